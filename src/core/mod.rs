//! Core module - device lifecycle, buffer residency and command submission.
//!
//! Control flow: a [`DeviceSession`] supplies the live [`Device`]; buffers are
//! allocated through the [`BufferRegistry`]; a [`CommandBuilder`] records
//! work into a [`CommandBatch`]; the [`SubmissionQueue`] executes batches in
//! order; [`read_back`] returns results to the host. [`ComputeContext`]
//! bundles all of it.

mod binding;
mod command;
mod context;
mod error;
mod queue;
mod readback;
mod registry;
mod session;

pub use binding::*;
pub use command::*;
pub use context::*;
pub use error::*;
pub use queue::*;
pub use readback::*;
pub use registry::*;
pub use session::*;
