//! Lifecycle and chain-linking engine for user-mode eBPF network functions.
//!
//! This crate manages, per network interface and traffic direction, an
//! ordered chain of BPF programs: a root dispatcher plus user-submitted
//! network functions. Each program ships as a versioned artifact, runs as a
//! supervised child process, links to its neighbours through pinned
//! next-program maps, and exports metrics through user-defined eBPF maps.
//!
//! The management surface that submits chains, the Prometheus exposition
//! endpoint and the configuration loader live outside this crate; only the
//! interfaces the engine consumes from them are defined here.

use std::sync::Arc;

use nfchain_common::metrics::MetricsSink;

pub mod artifacts;
pub mod chain;
pub mod config;
pub mod maps;
pub mod monitor;
pub mod platform;
pub mod process;
pub mod program;
pub mod recovery;
pub mod retry;

pub use chain::{ChainManager, NfChain, SharedChain};
pub use config::Config;
pub use program::{NfInstance, ProgramState};

/// Shared services injected into every program instance: the artifact
/// store, the process launcher and the metric sink. Tests substitute a
/// recording launcher and an in-memory sink.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<artifacts::ArtifactStore>,
    pub launcher: Arc<dyn process::ProcessLauncher>,
    pub sink: Arc<dyn MetricsSink>,
}
