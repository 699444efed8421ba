//! Schema module - Configuration types for compute sessions.

mod config;

pub use config::*;
