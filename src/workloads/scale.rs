//! Element-wise scaling by a uniform multiplier, with a reusable pipeline.

use log::{debug, warn};

use super::{Scratch, WorkloadError, decode_f32, workgroups};
use crate::backend::{Backend, DeviceBackend, HostKernel, ShaderSource};
use crate::core::{
    BindGroup, BindGroupEntry, BindGroupLayout, BindingKind, Buffer, CommandBatch, ComputeContext,
    CompletionHandle, ComputePipeline, CoreError, LayoutEntry,
};

const SCALE_SHADER: &str = include_str!("shaders/scale.wgsl");

const WORKGROUP_SIZE: u32 = 64;

const LAYOUT: [LayoutEntry; 3] = [
    LayoutEntry::new(0, BindingKind::Uniform),
    LayoutEntry::new(1, BindingKind::ReadOnlyStorage),
    LayoutEntry::new(2, BindingKind::Storage),
];

/// Uniform block of the scale shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct ScaleParams {
    multiplier: f32,
    count: u32,
    _pad: [u32; 2],
}

impl ScaleParams {
    fn new(multiplier: f32, count: usize) -> Self {
        Self {
            multiplier,
            count: u32::try_from(count).unwrap_or(u32::MAX),
            _pad: [0; 2],
        }
    }
}

fn shader() -> ShaderSource {
    ShaderSource::wgsl(SCALE_SHADER)
        .with_label("Scale Shader")
        .with_host_kernel(HostKernel::new([WORKGROUP_SIZE, 1, 1], |inv| {
            let multiplier = inv.load_f32(0, 0);
            let count = inv.load_u32(0, 1);
            let index = inv.global_id[0];
            if index >= count {
                return;
            }
            let value = inv.load_f32(1, index) * multiplier;
            inv.store_f32(2, index, value);
        }))
}

fn byte_len(elements: usize) -> u64 {
    elements as u64 * 4
}

/// Buffers and bind group serving one input of up to `capacity` elements.
#[derive(Debug)]
struct Lane<D: DeviceBackend> {
    params: Buffer,
    input: Buffer,
    output: Buffer,
    readback: Buffer,
    bind_group: BindGroup<D>,
}

impl<D: DeviceBackend> Lane<D> {
    fn create<B>(
        ctx: &mut ComputeContext<B>,
        scratch: &mut Scratch,
        layout: &BindGroupLayout<D>,
        params: ScaleParams,
        capacity: usize,
    ) -> Result<Self, CoreError>
    where
        B: Backend<Device = D>,
    {
        use wgpu::BufferUsages as U;
        let size = byte_len(capacity);
        let params = scratch.buffer_init(ctx, "Scale Params", bytemuck::bytes_of(&params), U::UNIFORM | U::COPY_DST)?;
        let input = scratch.buffer(ctx, "Scale Input", size, U::STORAGE | U::COPY_DST)?;
        let output = scratch.buffer(ctx, "Scale Output", size, U::STORAGE | U::COPY_SRC)?;
        let readback = scratch.buffer(ctx, "Scale Readback", size, U::COPY_DST | U::MAP_READ)?;
        let bind_group = ctx.create_bind_group(
            Some("Scale Bind Group"),
            layout,
            &[
                BindGroupEntry::new(0, params),
                BindGroupEntry::new(1, input),
                BindGroupEntry::new(2, output),
            ],
        )?;
        Ok(Self {
            params,
            input,
            output,
            readback,
            bind_group,
        })
    }

    fn buffers(&self) -> [Buffer; 4] {
        [self.params, self.input, self.output, self.readback]
    }

    /// Upload `input` and record its scaling into a batch.
    fn record<B>(
        &self,
        ctx: &mut ComputeContext<B>,
        pipeline: &ComputePipeline<D>,
        multiplier: f32,
        input: &[f32],
    ) -> Result<CommandBatch<D>, CoreError>
    where
        B: Backend<Device = D>,
    {
        let params = ScaleParams::new(multiplier, input.len());
        ctx.write_buffer(&self.params, 0, bytemuck::bytes_of(&params))?;
        ctx.write_buffer(&self.input, 0, bytemuck::cast_slice(input))?;

        let mut builder = ctx.command_builder()?;
        builder.dispatch(
            pipeline,
            &self.bind_group,
            [workgroups(input.len(), WORKGROUP_SIZE), 1, 1],
        )?;
        builder.copy_buffer_to_buffer(&self.output, 0, &self.readback, 0, byte_len(input.len()))?;
        builder.finish()
    }

    async fn read<B>(&self, ctx: &mut ComputeContext<B>, len: usize) -> Result<Vec<f32>, CoreError>
    where
        B: Backend<Device = D>,
    {
        ctx.read_back_with(&self.readback, |bytes| {
            Ok::<_, CoreError>(decode_f32(bytes).into_iter().take(len).collect())
        })
        .await
    }
}

/// Multiplies every element of its input by a fixed multiplier.
///
/// The pipeline, bind group and buffers for inputs of up to `capacity`
/// elements are created once; each [`compute`](Self::compute) only uploads
/// the new input and submits one batch.
#[derive(Debug)]
pub struct ScaleKernel<D: DeviceBackend> {
    multiplier: f32,
    capacity: usize,
    layout: BindGroupLayout<D>,
    pipeline: ComputePipeline<D>,
    lane: Lane<D>,
}

impl<D: DeviceBackend> ScaleKernel<D> {
    pub async fn new<B>(
        ctx: &mut ComputeContext<B>,
        multiplier: f32,
        capacity: usize,
    ) -> Result<Self, WorkloadError>
    where
        B: Backend<Device = D>,
    {
        if capacity == 0 {
            return Err(WorkloadError::EmptyInput);
        }
        let layout = ctx.create_bind_group_layout(Some("Scale Layout"), &LAYOUT)?;
        let pipeline = ctx.create_compute_pipeline(&layout, &shader()).await?;

        let mut scratch = Scratch::default();
        match Lane::create(ctx, &mut scratch, &layout, ScaleParams::new(multiplier, 0), capacity) {
            Ok(lane) => {
                scratch.keep();
                debug!("Scale kernel ready for {} element(s)", capacity);
                Ok(Self {
                    multiplier,
                    capacity,
                    layout,
                    pipeline,
                    lane,
                })
            }
            Err(e) => {
                scratch.release(ctx);
                Err(e.into())
            }
        }
    }

    pub fn multiplier(&self) -> f32 {
        self.multiplier
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check_input(&self, input: &[f32]) -> Result<(), WorkloadError> {
        if input.is_empty() {
            return Err(WorkloadError::EmptyInput);
        }
        if input.len() > self.capacity {
            return Err(WorkloadError::InputTooLarge {
                len: input.len(),
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Scale `input` with the kernel's own buffers.
    pub async fn compute<B>(&self, ctx: &mut ComputeContext<B>, input: &[f32]) -> Result<Vec<f32>, WorkloadError>
    where
        B: Backend<Device = D>,
    {
        self.check_input(input)?;
        let batch = self
            .lane
            .record(ctx, &self.pipeline, self.multiplier, input)?;
        let handle = ctx.submit(batch)?;
        ctx.await_completion(handle).await?;
        Ok(self.lane.read(ctx, input.len()).await?)
    }

    /// Scale `input` as two halves submitted back to back, so both batches
    /// are in flight together. Each half gets its own buffers and bind group
    /// for the duration of the call; the pipeline is shared.
    pub async fn compute_split<B>(
        &self,
        ctx: &mut ComputeContext<B>,
        input: &[f32],
    ) -> Result<Vec<f32>, WorkloadError>
    where
        B: Backend<Device = D>,
    {
        if input.is_empty() {
            return Err(WorkloadError::EmptyInput);
        }
        if input.len() < 2 {
            return self.compute(ctx, input).await;
        }
        let mut scratch = Scratch::default();
        let outcome = self.compute_split_in(ctx, &mut scratch, input).await;
        scratch.release(ctx);
        outcome
    }

    async fn compute_split_in<B>(
        &self,
        ctx: &mut ComputeContext<B>,
        scratch: &mut Scratch,
        input: &[f32],
    ) -> Result<Vec<f32>, WorkloadError>
    where
        B: Backend<Device = D>,
    {
        let (front, back) = input.split_at(input.len().div_ceil(2));
        let mut lanes = Vec::with_capacity(2);
        for half in [front, back] {
            let params = ScaleParams::new(self.multiplier, half.len());
            lanes.push(Lane::create(ctx, scratch, &self.layout, params, half.len())?);
        }

        let mut handles = Vec::with_capacity(2);
        for (lane, half) in lanes.iter().zip([front, back]) {
            match self.submit_lane(ctx, lane, half) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Halves already on the device must retire before their
                    // buffers can be released.
                    for handle in handles {
                        if let Err(wait) = ctx.await_completion(handle).await {
                            warn!("Submitted half did not retire: {}", wait);
                        }
                    }
                    return Err(e);
                }
            }
        }
        debug!(
            "Split scale of {} element(s): {} batch(es) in flight",
            input.len(),
            ctx.queue().in_flight()
        );

        let mut output = Vec::with_capacity(input.len());
        for ((lane, half), handle) in lanes.iter().zip([front, back]).zip(handles) {
            ctx.await_completion(handle).await?;
            output.extend(lane.read(ctx, half.len()).await?);
        }
        Ok(output)
    }

    fn submit_lane<B>(
        &self,
        ctx: &mut ComputeContext<B>,
        lane: &Lane<D>,
        input: &[f32],
    ) -> Result<CompletionHandle, WorkloadError>
    where
        B: Backend<Device = D>,
    {
        let batch = lane.record(ctx, &self.pipeline, self.multiplier, input)?;
        Ok(ctx.submit(batch)?)
    }

    /// Release the kernel's buffers.
    pub fn release<B>(self, ctx: &mut ComputeContext<B>) -> Result<(), WorkloadError>
    where
        B: Backend<Device = D>,
    {
        for buffer in self.lane.buffers() {
            ctx.release(&buffer)?;
        }
        Ok(())
    }
}
