//! Workloads - example compute programs built on the core.
//!
//! Each workload creates its pipelines once and owns nothing beyond the
//! handles the core returns; the [`ComputeContext`] is always passed in.

mod atomic;
mod matmul;
mod scale;

pub use atomic::*;
pub use matmul::*;
pub use scale::*;

use log::warn;
use thiserror::Error;

use crate::backend::Backend;
use crate::core::{Buffer, ComputeContext, CoreError};

/// Errors raised by the example workloads.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkloadError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("a {rows}x{cols} matrix needs {} values, got {len}", .rows * .cols)]
    InvalidMatrix { rows: usize, cols: usize, len: usize },

    #[error("cannot multiply a {}x{} matrix by a {}x{} matrix", .left.0, .left.1, .right.0, .right.1)]
    DimensionMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("input is empty")]
    EmptyInput,

    #[error("input of {len} elements exceeds kernel capacity of {capacity}")]
    InputTooLarge { len: usize, capacity: usize },

    #[error("result decoding failed: {0}")]
    Decode(String),
}

/// Buffers allocated for one workload call, released together afterwards.
#[derive(Debug, Default)]
pub(crate) struct Scratch {
    buffers: Vec<Buffer>,
}

impl Scratch {
    pub(crate) fn buffer<B: Backend>(
        &mut self,
        ctx: &mut ComputeContext<B>,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> Result<Buffer, CoreError> {
        let buffer = ctx.create_buffer(Some(label), size, usage, false)?;
        self.buffers.push(buffer);
        Ok(buffer)
    }

    pub(crate) fn buffer_init<B: Backend>(
        &mut self,
        ctx: &mut ComputeContext<B>,
        label: &str,
        contents: &[u8],
        usage: wgpu::BufferUsages,
    ) -> Result<Buffer, CoreError> {
        let buffer = ctx.create_buffer_init(Some(label), contents, usage)?;
        self.buffers.push(buffer);
        Ok(buffer)
    }

    /// Stop tracking the buffers; the caller now owns them.
    pub(crate) fn keep(mut self) {
        self.buffers.clear();
    }

    pub(crate) fn release<B: Backend>(self, ctx: &mut ComputeContext<B>) {
        for buffer in &self.buffers {
            match ctx.release(buffer) {
                Ok(()) => {}
                // The device went away; the registry already forgot it.
                Err(e) if e.is_stale() => {}
                Err(e) => warn!("Could not release {}: {}", buffer.id(), e),
            }
        }
    }
}

/// Workgroup count covering `items` invocations with `size` per group.
/// Counts beyond `u32` saturate and are rejected by the dispatch limit check.
pub(crate) fn workgroups(items: usize, size: u32) -> u32 {
    u32::try_from(items.div_ceil(size as usize)).unwrap_or(u32::MAX)
}

/// Little-endian `f32` values of `bytes`; any trailing partial word is ignored.
pub(crate) fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|word| f32::from_bits(u32::from_le(bytemuck::pod_read_unaligned(word))))
        .collect()
}

/// `len` rounded up to the copy alignment.
pub(crate) fn padded(len: u64) -> u64 {
    len.next_multiple_of(crate::core::COPY_ALIGNMENT)
}
