//! GPU compute core - device lifecycle, buffer mapping state and ordered
//! command submission.
//!
//! This crate wraps a WebGPU-style device behind a small, checked API:
//! buffers carry an explicit map state, recorded work is validated before it
//! reaches the driver, batches retire in submission order and a lost device
//! is re-acquired by a supervisor step instead of callbacks.
//!
//! # Architecture
//!
//! - `schema`: Session configuration (back-end, capabilities, limits)
//! - `core`: Device session, buffer registry, command recording, submission
//!   queue and readback
//! - `backend`: The `wgpu` back-end and a host software emulation
//! - `workloads`: Example compute programs built on the core
//!
//! # Example
//!
//! ```rust,no_run
//! use gpu_compute_core::{
//!     backend::SoftwareBackend,
//!     core::{ComputeContext, DeviceRequest},
//!     workloads::ScaleKernel,
//! };
//!
//! let mut ctx = pollster::block_on(ComputeContext::acquire(
//!     SoftwareBackend::new(),
//!     DeviceRequest::default(),
//! ))
//! .unwrap();
//!
//! let scale = pollster::block_on(ScaleKernel::new(&mut ctx, 2.0, 4)).unwrap();
//! let doubled = pollster::block_on(scale.compute(&mut ctx, &[1.0, 2.0, 3.0, 4.0])).unwrap();
//! assert_eq!(doubled, vec![2.0, 4.0, 6.0, 8.0]);
//! ```

pub mod backend;
pub mod core;
pub mod schema;
pub mod workloads;

// Re-export commonly used types
pub use crate::backend::{Backend, DeviceBackend, SoftwareBackend, WgpuBackend};
pub use crate::core::{ComputeContext, CoreError, DeviceRequest, DeviceSession};
pub use crate::schema::{BackendKind, Capability, SessionConfig};
