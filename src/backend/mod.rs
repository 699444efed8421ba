//! Device back-ends.
//!
//! The submission core never talks to a graphics API directly. It drives a
//! [`Backend`] (adapter discovery and device creation) and the
//! [`DeviceBackend`] it produces (raw resources and queue submission). Two
//! back-ends are provided:
//!
//! - [`WgpuBackend`]: real GPU execution through `wgpu`
//! - [`SoftwareBackend`]: host emulation running [`HostKernel`]s, with
//!   injectable device loss for testing recovery

mod software;
mod webgpu;

use std::borrow::Cow;
use std::fmt;
use std::sync::mpsc;

pub use software::{
    HostKernel, Invocation, LossTrigger, SoftwareBackend, SoftwareDevice,
};
pub use webgpu::{WgpuBackend, WgpuDevice};

use crate::core::{CoreError, DeviceLimits, LayoutEntry, Result};
use crate::schema::{CapabilitySet, PowerPreference};

/// What an adapter offers before a device is requested.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Human-readable adapter name.
    pub name: String,
    /// Optional capabilities the adapter supports.
    pub capabilities: CapabilitySet,
    /// Maximum limits the adapter supports.
    pub limits: DeviceLimits,
}

/// Why a device was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// The owner released the device on purpose.
    Destroyed,
    /// Driver reset, resource pressure or any other external cause.
    Unknown,
}

/// Device-loss notification, delivered at most once per device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLost {
    pub reason: LossReason,
    pub message: String,
}

/// Receiving end of a device's loss notification.
pub type LossEvents = mpsc::Receiver<DeviceLost>;

/// Raw buffer creation parameters.
#[derive(Debug, Clone)]
pub struct BufferDescriptor<'a> {
    pub label: Option<&'a str>,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
    pub mapped_at_creation: bool,
}

/// Compute program handed to pipeline creation.
///
/// The WGSL text is opaque to the core. `host` is the equivalent kernel the
/// software back-end executes in place of the WGSL.
#[derive(Debug, Clone)]
pub struct ShaderSource {
    pub label: Option<String>,
    pub wgsl: Cow<'static, str>,
    pub entry_point: String,
    pub host: Option<HostKernel>,
}

impl ShaderSource {
    /// WGSL-only program with entry point `main`.
    pub fn wgsl(wgsl: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: None,
            wgsl: wgsl.into(),
            entry_point: "main".to_string(),
            host: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    /// Attach the host kernel used by the software back-end.
    pub fn with_host_kernel(mut self, kernel: HostKernel) -> Self {
        self.host = Some(kernel);
        self
    }
}

/// One recorded dispatch, with raw handles resolved.
pub struct Dispatch<D: DeviceBackend> {
    pub pipeline: D::Pipeline,
    pub bind_group: D::BindGroup,
    pub workgroups: [u32; 3],
}

/// Timestamps written at the beginning and/or end of a compute pass.
pub struct PassTimestamps<D: DeviceBackend> {
    pub query_set: D::QuerySet,
    pub beginning: Option<u32>,
    pub end: Option<u32>,
}

/// Backend-facing command, produced by the command builder after validation.
pub enum Command<D: DeviceBackend> {
    CopyBufferToBuffer {
        src: D::Buffer,
        src_offset: u64,
        dst: D::Buffer,
        dst_offset: u64,
        size: u64,
    },
    ComputePass {
        timestamps: Option<PassTimestamps<D>>,
        dispatches: Vec<Dispatch<D>>,
    },
    WriteTimestamp {
        query_set: D::QuerySet,
        index: u32,
    },
    ResolveQuerySet {
        query_set: D::QuerySet,
        start: u32,
        count: u32,
        destination: D::Buffer,
        destination_offset: u64,
    },
}

impl<D: DeviceBackend> fmt::Debug for Command<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::CopyBufferToBuffer {
                src_offset,
                dst_offset,
                size,
                ..
            } => f
                .debug_struct("CopyBufferToBuffer")
                .field("src_offset", src_offset)
                .field("dst_offset", dst_offset)
                .field("size", size)
                .finish(),
            Command::ComputePass {
                timestamps,
                dispatches,
            } => f
                .debug_struct("ComputePass")
                .field("timestamps", &timestamps.is_some())
                .field(
                    "workgroups",
                    &dispatches.iter().map(|d| d.workgroups).collect::<Vec<_>>(),
                )
                .finish(),
            Command::WriteTimestamp { index, .. } => {
                f.debug_struct("WriteTimestamp").field("index", index).finish()
            }
            Command::ResolveQuerySet {
                start,
                count,
                destination_offset,
                ..
            } => f
                .debug_struct("ResolveQuerySet")
                .field("start", start)
                .field("count", count)
                .field("destination_offset", destination_offset)
                .finish(),
        }
    }
}

/// Adapter discovery and device creation.
#[allow(async_fn_in_trait)]
pub trait Backend {
    type Device: DeviceBackend;

    /// Short back-end name for diagnostics.
    const NAME: &'static str;

    /// Find an adapter and report what it supports.
    async fn request_adapter(&mut self, power: PowerPreference) -> Result<AdapterInfo>;

    /// Create a device on the last requested adapter.
    ///
    /// Capabilities and limits have already been validated against the
    /// adapter by the caller.
    async fn request_device(
        &mut self,
        label: &str,
        capabilities: &CapabilitySet,
        limits: &DeviceLimits,
    ) -> Result<(Self::Device, LossEvents)>;
}

/// Raw resources and queue of one logical device.
#[allow(async_fn_in_trait)]
pub trait DeviceBackend: Sized {
    type Buffer: Clone + fmt::Debug;
    type BindGroupLayout: Clone + fmt::Debug;
    type BindGroup: Clone + fmt::Debug;
    type Pipeline: Clone + fmt::Debug;
    type QuerySet: Clone + fmt::Debug;
    type Submission: fmt::Debug;

    fn create_buffer(&self, desc: &BufferDescriptor<'_>) -> Result<Self::Buffer>;

    /// Return a mapped buffer to the GPU, committing `written` first when the
    /// host wrote through a write mapping.
    fn unmap(&self, buffer: &Self::Buffer, written: Option<&[u8]>) -> Result<()>;

    /// Map the first `size` bytes for reading and copy them out. The buffer
    /// stays mapped until [`unmap`](Self::unmap).
    async fn map_read(&self, buffer: &Self::Buffer, size: u64) -> Result<Vec<u8>>;

    /// Queue-ordered upload.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    fn destroy_buffer(&self, buffer: &Self::Buffer);

    fn create_bind_group_layout(
        &self,
        label: Option<&str>,
        entries: &[LayoutEntry],
    ) -> Result<Self::BindGroupLayout>;

    async fn create_compute_pipeline(
        &self,
        layout: &Self::BindGroupLayout,
        shader: &ShaderSource,
    ) -> Result<Self::Pipeline>;

    fn create_bind_group(
        &self,
        label: Option<&str>,
        layout: &Self::BindGroupLayout,
        entries: &[(u32, Self::Buffer)],
    ) -> Result<Self::BindGroup>;

    fn create_query_set(&self, label: Option<&str>, capacity: u32) -> Result<Self::QuerySet>;

    fn submit(&self, commands: Vec<Command<Self>>) -> Result<Self::Submission>;

    /// Make progress without blocking.
    fn poll(&self) -> Result<()>;

    fn is_retired(&self, submission: &Self::Submission) -> bool;

    /// Suspend until `submission` and everything before it has retired.
    async fn wait(&self, submission: &Self::Submission) -> Result<()>;

    /// Nanoseconds per timestamp tick.
    fn timestamp_period(&self) -> f32;

    /// Release the device on purpose.
    fn destroy(&self);
}

/// Front-end compile of `shader.wgsl`: parse, validate and look up the compute
/// entry point. Back-ends run this before creating a pipeline so that compile
/// errors come back as [`CoreError::ShaderCompilationFailed`] with the
/// rendered diagnostics instead of through the device's error channel.
pub(crate) fn compile_wgsl(shader: &ShaderSource, shader_f16: bool) -> Result<()> {
    let failed = |diagnostics: String| CoreError::ShaderCompilationFailed {
        entry_point: shader.entry_point.clone(),
        diagnostics,
    };

    let module = naga::front::wgsl::parse_str(&shader.wgsl)
        .map_err(|e| failed(e.emit_to_string(&shader.wgsl)))?;

    let mut capabilities = naga::valid::Capabilities::all();
    if !shader_f16 {
        capabilities.remove(naga::valid::Capabilities::SHADER_FLOAT16);
    }
    naga::valid::Validator::new(naga::valid::ValidationFlags::all(), capabilities)
        .validate(&module)
        .map_err(|e| failed(e.to_string()))?;

    let found = module
        .entry_points
        .iter()
        .any(|ep| ep.name == shader.entry_point && ep.stage == naga::ShaderStage::Compute);
    if !found {
        return Err(failed(format!(
            "no compute entry point named `{}`",
            shader.entry_point
        )));
    }
    Ok(())
}
