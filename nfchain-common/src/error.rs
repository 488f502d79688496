//! Error types for the nfchain supervisor.

use thiserror::Error;

use crate::types::Direction;

/// All possible errors surfaced by the lifecycle engine.
#[derive(Error, Debug)]
pub enum Error {
    /// URL, HTTP, gzip or tar failure while fetching an artifact.
    #[error("artifact fetch failed for {artifact}: {reason}")]
    ArtifactFetch { artifact: String, reason: String },

    /// Pre-flight executable check failed.
    #[error("no executable permissions on {0}")]
    BinaryNotExecutable(String),

    /// The child process could not be started.
    #[error("failed to spawn {binary}: {reason}")]
    SpawnFailed { binary: String, reason: String },

    /// The child process could not be reaped.
    #[error("failed to wait on child of {program}: {reason}")]
    WaitFailed { program: String, reason: String },

    /// The program never created its pinned map after start.
    #[error("failed to find pinned file {0}")]
    PinnedMapMissing(String),

    /// The program never removed its pinned map after stop.
    #[error("{map} map file was never removed by BPF program {program}")]
    PinnedMapLingering { map: String, program: String },

    /// The kernel still resolves metric map IDs recorded on the instance.
    #[error("metrics maps were never removed by the kernel for {0}")]
    MapReferenceLingering(String),

    /// A predecessor slot could not be read or written.
    #[error("chain integrity: {0}")]
    ChainIntegrity(String),

    /// Unknown direction, empty process name, or similar.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Stop was requested but the program has no live child.
    #[error("BPFProgram is not running: {0}")]
    NotRunning(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single structured failure of one chain operation, carrying the
/// operation name and the (program, iface, direction) it applied to.
#[derive(Error, Debug)]
#[error("{op} failed for program {program} on {iface}/{direction}")]
pub struct OpError {
    pub op: &'static str,
    pub program: String,
    pub iface: String,
    pub direction: Direction,
    #[source]
    pub source: Error,
}

impl OpError {
    pub fn new(
        op: &'static str,
        program: &str,
        iface: &str,
        direction: Direction,
        source: Error,
    ) -> Self {
        Self {
            op,
            program: program.to_string(),
            iface: iface.to_string(),
            direction,
            source,
        }
    }
}
