//! Error taxonomy for the submission core.

use std::fmt;

use super::registry::{BufferId, MapState};
use crate::schema::Capability;

/// Kind of resource named by a [`CoreError::StaleResource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Device,
    Buffer(BufferId),
    BindGroupLayout(u64),
    BindGroup(u64),
    Pipeline(u64),
    QuerySet(u64),
    Batch(u64),
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Device => write!(f, "device"),
            ResourceKind::Buffer(id) => write!(f, "{id}"),
            ResourceKind::BindGroupLayout(id) => write!(f, "bind group layout #{id}"),
            ResourceKind::BindGroup(id) => write!(f, "bind group #{id}"),
            ResourceKind::Pipeline(id) => write!(f, "pipeline #{id}"),
            ResourceKind::QuerySet(id) => write!(f, "query set #{id}"),
            ResourceKind::Batch(id) => write!(f, "batch #{id}"),
        }
    }
}

/// Error type for every core operation.
///
/// Resource-state violations (`BufferStillMapped`, `NotMapped`,
/// `BufferInFlight`, `BufferNotUnmapped`) are caller contract violations and
/// are never retried. `StaleResource` is the only kind with built-in recovery,
/// performed by [`DeviceSession::supervise`](super::DeviceSession::supervise).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("No suitable GPU adapter found")]
    AdapterUnavailable,

    #[error("Adapter does not support {name}: requested {requested}, available {available}")]
    CapabilityUnsupported {
        name: String,
        requested: String,
        available: String,
    },

    #[error("Failed to request device: {0}")]
    DeviceRequest(String),

    #[error("Size {requested} of {what} exceeds device limit {limit}")]
    SizeExceedsLimit {
        what: &'static str,
        requested: u64,
        limit: u64,
    },

    #[error("Invalid buffer usage {usage:?}: {reason}")]
    InvalidUsageCombination {
        usage: wgpu::BufferUsages,
        reason: &'static str,
    },

    #[error("{resource} belongs to device generation {generation}, which is no longer live")]
    StaleResource {
        resource: ResourceKind,
        generation: u64,
    },

    #[error("{buffer} is still {state}; unmap it before release")]
    BufferStillMapped { buffer: BufferId, state: MapState },

    #[error("{buffer} is referenced by {batches} batch(es) still in flight")]
    BufferInFlight { buffer: BufferId, batches: usize },

    #[error("{buffer} is not mapped for {wanted} (state: {state})")]
    NotMapped {
        buffer: BufferId,
        wanted: &'static str,
        state: MapState,
    },

    #[error("{buffer} must be unmapped to be used by the GPU (state: {state})")]
    BufferNotUnmapped { buffer: BufferId, state: MapState },

    #[error("{buffer} lacks required usage {required:?}")]
    MissingUsage {
        buffer: BufferId,
        required: wgpu::BufferUsages,
    },

    #[error("{buffer} has been released")]
    UnknownBuffer { buffer: BufferId },

    #[error("Layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("Range {offset}..{offset}+{size} is out of bounds for {what} of size {limit}")]
    RangeOutOfBounds {
        what: String,
        offset: u64,
        size: u64,
        limit: u64,
    },

    #[error("{what} {value} is not a multiple of {alignment}")]
    Misaligned {
        what: &'static str,
        value: u64,
        alignment: u64,
    },

    #[error("Copy source and destination are the same buffer ({buffer})")]
    CopyOverlap { buffer: BufferId },

    #[error("{0} is not allowed while a compute pass is open")]
    NotAllowedInsidePass(&'static str),

    #[error("{0} requires an open compute pass")]
    PassNotOpen(&'static str),

    #[error("A compute pass is already open")]
    PassAlreadyOpen,

    #[error("Batch cannot be finished while a compute pass is open")]
    PassStillOpen,

    #[error("Query index {index} is out of range for query set of capacity {capacity}")]
    QueryIndexOutOfRange { index: u32, capacity: u32 },

    #[error("Query index {index} was already written in this batch")]
    QueryAlreadyWritten { index: u32 },

    #[error("Batch contains no operations")]
    EmptyBatch,

    #[error("Shader compilation failed for entry point `{entry_point}`: {diagnostics}")]
    ShaderCompilationFailed {
        entry_point: String,
        diagnostics: String,
    },

    #[error("Timestamp interval is negative: start {start} > end {end}")]
    NegativeInterval { start: u64, end: u64 },

    #[error("Backend error: {0}")]
    Backend(String),
}

impl CoreError {
    pub(crate) fn capability(capability: Capability) -> Self {
        CoreError::CapabilityUnsupported {
            name: capability.name().to_string(),
            requested: "enabled".to_string(),
            available: "absent".to_string(),
        }
    }

    /// Whether the error is caused by device loss.
    pub fn is_stale(&self) -> bool {
        matches!(self, CoreError::StaleResource { .. })
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
