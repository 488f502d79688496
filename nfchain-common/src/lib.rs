//! Common types and utilities for the nfchain eBPF network-function supervisor.
//!
//! This crate provides the shared configuration records, the error type and
//! the metric sink consumed by the lifecycle engine and the daemon binary.

pub mod error;
pub mod metrics;
pub mod types;

/// Reexport of common types
pub use error::{Error, OpError};
pub type Result<T> = std::result::Result<T, Error>;
