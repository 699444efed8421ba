//! wgpu back-end - real GPU execution.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use log::debug;

use super::{
    AdapterInfo, Backend, BufferDescriptor, Command, DeviceBackend, DeviceLost, LossEvents,
    LossReason, ShaderSource, compile_wgsl,
};
use crate::core::{BindingKind, CoreError, DeviceLimits, LayoutEntry, Result};
use crate::schema::{Capability, CapabilitySet, PowerPreference};

fn feature(capability: Capability) -> wgpu::Features {
    match capability {
        Capability::TimestampQuery => wgpu::Features::TIMESTAMP_QUERY,
        Capability::TimestampQueryInsideEncoders => wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS,
        Capability::ShaderF16 => wgpu::Features::SHADER_F16,
    }
}

fn backend_error(e: impl fmt::Display) -> CoreError {
    CoreError::Backend(e.to_string())
}

/// Adapter discovery through a `wgpu::Instance`.
pub struct WgpuBackend {
    instance: wgpu::Instance,
    adapter: Option<wgpu::Adapter>,
}

impl Default for WgpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WgpuBackend {
    pub fn new() -> Self {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        Self {
            instance,
            adapter: None,
        }
    }
}

impl Backend for WgpuBackend {
    type Device = WgpuDevice;

    const NAME: &'static str = "wgpu";

    async fn request_adapter(&mut self, power: PowerPreference) -> Result<AdapterInfo> {
        let power_preference = match power {
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
        };
        let adapter = self
            .instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| CoreError::AdapterUnavailable)?;

        let features = adapter.features();
        let limits = adapter.limits();
        let info = AdapterInfo {
            name: adapter.get_info().name,
            capabilities: Capability::ALL
                .into_iter()
                .filter(|&c| features.contains(feature(c)))
                .collect(),
            limits: DeviceLimits {
                max_buffer_size: limits.max_buffer_size,
                max_storage_buffer_binding_size: u64::from(limits.max_storage_buffer_binding_size),
                max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
            },
        };
        self.adapter = Some(adapter);
        Ok(info)
    }

    async fn request_device(
        &mut self,
        label: &str,
        capabilities: &CapabilitySet,
        limits: &DeviceLimits,
    ) -> Result<(Self::Device, LossEvents)> {
        let adapter = self.adapter.as_ref().ok_or(CoreError::AdapterUnavailable)?;

        let required_features = capabilities
            .iter()
            .fold(wgpu::Features::empty(), |acc, &c| acc | feature(c));
        let required_limits = wgpu::Limits {
            max_buffer_size: limits.max_buffer_size,
            max_storage_buffer_binding_size: limits
                .max_storage_buffer_binding_size
                .try_into()
                .unwrap_or_else(|_| u32::MAX.into()),
            max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
            ..wgpu::Limits::default()
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some(label),
                required_features,
                required_limits,
                ..Default::default()
            })
            .await
            .map_err(|e| CoreError::DeviceRequest(e.to_string()))?;

        let lost = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        {
            let lost = Arc::clone(&lost);
            device.set_device_lost_callback(move |reason, message| {
                lost.store(true, Ordering::SeqCst);
                let reason = match reason {
                    wgpu::DeviceLostReason::Destroyed => LossReason::Destroyed,
                    _ => LossReason::Unknown,
                };
                let _ = tx.send(DeviceLost { reason, message });
            });
        }

        debug!("wgpu device '{}' with features {:?}", label, required_features);
        Ok((
            WgpuDevice {
                device,
                queue,
                lost,
            },
            rx,
        ))
    }
}

/// Completion tracking for one `queue.submit`.
#[derive(Debug, Clone)]
pub struct WgpuSubmission {
    index: wgpu::SubmissionIndex,
    done: Arc<AtomicBool>,
}

/// A wgpu device and its queue.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    lost: Arc<AtomicBool>,
}

impl fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("lost", &self.lost.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl WgpuDevice {
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn check_live(&self) -> Result<()> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(CoreError::Backend("wgpu device is lost".to_string()));
        }
        Ok(())
    }

    fn encode(&self, commands: Vec<Command<Self>>) -> wgpu::CommandBuffer {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Compute Batch Encoder"),
            });

        for command in commands {
            match command {
                Command::CopyBufferToBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    encoder.copy_buffer_to_buffer(&src, src_offset, &dst, dst_offset, size);
                }
                Command::ComputePass {
                    timestamps,
                    dispatches,
                } => {
                    let timestamp_writes =
                        timestamps
                            .as_ref()
                            .map(|t| wgpu::ComputePassTimestampWrites {
                                query_set: &t.query_set,
                                beginning_of_pass_write_index: t.beginning,
                                end_of_pass_write_index: t.end,
                            });
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("Compute Pass"),
                        timestamp_writes,
                    });
                    for dispatch in &dispatches {
                        pass.set_pipeline(&dispatch.pipeline);
                        pass.set_bind_group(0, &dispatch.bind_group, &[]);
                        let [x, y, z] = dispatch.workgroups;
                        pass.dispatch_workgroups(x, y, z);
                    }
                }
                Command::WriteTimestamp { query_set, index } => {
                    encoder.write_timestamp(&query_set, index);
                }
                Command::ResolveQuerySet {
                    query_set,
                    start,
                    count,
                    destination,
                    destination_offset,
                } => {
                    encoder.resolve_query_set(
                        &query_set,
                        start..start + count,
                        &destination,
                        destination_offset,
                    );
                }
            }
        }

        encoder.finish()
    }
}

impl DeviceBackend for WgpuDevice {
    type Buffer = wgpu::Buffer;
    type BindGroupLayout = wgpu::BindGroupLayout;
    type BindGroup = wgpu::BindGroup;
    type Pipeline = wgpu::ComputePipeline;
    type QuerySet = wgpu::QuerySet;
    type Submission = WgpuSubmission;

    fn create_buffer(&self, desc: &BufferDescriptor<'_>) -> Result<Self::Buffer> {
        self.check_live()?;
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label,
            size: desc.size,
            usage: desc.usage,
            mapped_at_creation: desc.mapped_at_creation,
        }))
    }

    fn unmap(&self, buffer: &Self::Buffer, written: Option<&[u8]>) -> Result<()> {
        if let Some(data) = written {
            buffer.slice(..).get_mapped_range_mut().copy_from_slice(data);
        }
        buffer.unmap();
        Ok(())
    }

    async fn map_read(&self, buffer: &Self::Buffer, size: u64) -> Result<Vec<u8>> {
        self.check_live()?;
        let buffer_slice = buffer.slice(..size);

        let (sender, receiver) = futures_channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(backend_error)?;

        receiver
            .await
            .map_err(|_| CoreError::Backend("map callback dropped".to_string()))?
            .map_err(backend_error)?;

        let data = buffer_slice.get_mapped_range().to_vec();
        Ok(data)
    }

    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.check_live()?;
        self.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: &Self::Buffer) {
        buffer.destroy();
    }

    fn create_bind_group_layout(
        &self,
        label: Option<&str>,
        entries: &[LayoutEntry],
    ) -> Result<Self::BindGroupLayout> {
        let entries: Vec<_> = entries
            .iter()
            .map(|entry| wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: binding_type(entry.kind),
                count: None,
            })
            .collect();
        Ok(self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label,
                entries: &entries,
            }))
    }

    async fn create_compute_pipeline(
        &self,
        layout: &Self::BindGroupLayout,
        shader: &ShaderSource,
    ) -> Result<Self::Pipeline> {
        self.check_live()?;
        let shader_f16 = self.device.features().contains(wgpu::Features::SHADER_F16);
        compile_wgsl(shader, shader_f16)?;
        let label = shader.label.as_deref();

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label,
                source: wgpu::ShaderSource::Wgsl(shader.wgsl.as_ref().into()),
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label,
                bind_group_layouts: &[layout],
                ..Default::default()
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label,
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(&shader.entry_point),
                compilation_options: Default::default(),
                cache: None,
            });
        Ok(pipeline)
    }

    fn create_bind_group(
        &self,
        label: Option<&str>,
        layout: &Self::BindGroupLayout,
        entries: &[(u32, Self::Buffer)],
    ) -> Result<Self::BindGroup> {
        let entries: Vec<_> = entries
            .iter()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label,
            layout,
            entries: &entries,
        }))
    }

    fn create_query_set(&self, label: Option<&str>, capacity: u32) -> Result<Self::QuerySet> {
        Ok(self.device.create_query_set(&wgpu::QuerySetDescriptor {
            label,
            ty: wgpu::QueryType::Timestamp,
            count: capacity,
        }))
    }

    fn submit(&self, commands: Vec<Command<Self>>) -> Result<Self::Submission> {
        self.check_live()?;
        let command_buffer = self.encode(commands);
        let index = self.queue.submit(std::iter::once(command_buffer));

        let done = Arc::new(AtomicBool::new(false));
        {
            let done = Arc::clone(&done);
            self.queue.on_submitted_work_done(move || {
                done.store(true, Ordering::SeqCst);
            });
        }
        Ok(WgpuSubmission { index, done })
    }

    fn poll(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Poll)
            .map(|_| ())
            .map_err(backend_error)
    }

    fn is_retired(&self, submission: &Self::Submission) -> bool {
        submission.done.load(Ordering::SeqCst)
    }

    async fn wait(&self, submission: &Self::Submission) -> Result<()> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(backend_error)?;
        if self.is_retired(submission) {
            Ok(())
        } else {
            self.check_live()?;
            Err(CoreError::Backend(format!(
                "submission {:?} did not retire",
                submission.index
            )))
        }
    }

    fn timestamp_period(&self) -> f32 {
        self.queue.get_timestamp_period()
    }

    fn destroy(&self) {
        self.device.destroy();
    }
}

fn binding_type(kind: BindingKind) -> wgpu::BindingType {
    let buffer = |ty| wgpu::BindingType::Buffer {
        ty,
        has_dynamic_offset: false,
        min_binding_size: None,
    };
    match kind {
        BindingKind::Uniform => buffer(wgpu::BufferBindingType::Uniform),
        BindingKind::ReadOnlyStorage => buffer(wgpu::BufferBindingType::Storage { read_only: true }),
        BindingKind::Storage => buffer(wgpu::BufferBindingType::Storage { read_only: false }),
        BindingKind::SampledTexture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        BindingKind::Sampler => wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_features() {
        assert_eq!(
            feature(Capability::TimestampQuery),
            wgpu::Features::TIMESTAMP_QUERY
        );
        assert_eq!(feature(Capability::ShaderF16), wgpu::Features::SHADER_F16);
    }

    #[test]
    fn test_storage_binding_types() {
        assert!(matches!(
            binding_type(BindingKind::ReadOnlyStorage),
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                ..
            }
        ));
        assert!(matches!(
            binding_type(BindingKind::Sampler),
            wgpu::BindingType::Sampler(_)
        ));
    }

    #[test]
    fn test_adapter_request() {
        let mut backend = WgpuBackend::new();
        let info = match pollster::block_on(backend.request_adapter(PowerPreference::default())) {
            Ok(info) => info,
            Err(_) => {
                eprintln!("Skipping GPU test: no adapter available");
                return;
            }
        };
        assert!(info.limits.max_buffer_size > 0);
        assert!(info.limits.max_compute_workgroups_per_dimension > 0);
    }
}
