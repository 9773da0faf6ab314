#![forbid(unsafe_code)]
//! rsfs public API facade.
//!
//! Re-exports the core filesystem surface through a stable external
//! interface. This is the crate that downstream consumers (transport,
//! services, tooling) depend on.

pub use rsfs_core::*;
