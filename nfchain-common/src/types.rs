//! Configuration records for BPF programs / network functions.
//!
//! These records are submitted by the management surface and are immutable
//! after submission; the lifecycle engine only reads them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The kernel truncates map and process names to this many bytes.
pub const KERNEL_NAME_LEN: usize = 15;

/// Literal printed on stdout by a program's status command when healthy.
pub const STATUS_RUNNING: &str = "RUNNING";

/// Truncate a map or process name the way the kernel does.
pub fn kernel_name(name: &str) -> &str {
    if name.len() > KERNEL_NAME_LEN {
        &name[..KERNEL_NAME_LEN]
    } else {
        name
    }
}

/// Where in the kernel networking stack a chain attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    XdpIngress,
    Ingress,
    Egress,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::XdpIngress => "xdpingress",
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xdpingress" => Ok(Direction::XdpIngress),
            "ingress" => Ok(Direction::Ingress),
            "egress" => Ok(Direction::Egress),
            other => Err(Error::InvalidConfig(format!("unknown direction {other}"))),
        }
    }
}

/// The program type decides how its config maps are found: TC programs pin
/// them under bpffs, XDP programs are looked up by kernel map name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EbpfType {
    Xdp,
    Tc,
}

impl Default for EbpfType {
    fn default() -> Self {
        EbpfType::Xdp
    }
}

impl fmt::Display for EbpfType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EbpfType::Xdp => f.write_str("xdp"),
            EbpfType::Tc => f.write_str("tc"),
        }
    }
}

/// Whether the management surface wants the program on the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminStatus {
    Enabled,
    Disabled,
}

impl Default for AdminStatus {
    fn default() -> Self {
        AdminStatus::Enabled
    }
}

/// Function applied to a ring of metric samples to produce one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregator {
    #[serde(rename = "max-rate")]
    MaxRate,
    #[serde(rename = "avg")]
    Avg,
    #[serde(rename = "sum")]
    Sum,
}

impl Aggregator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregator::MaxRate => "max-rate",
            Aggregator::Avg => "avg",
            Aggregator::Sum => "sum",
        }
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One key/value argument appended to a program command line as `--key=value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfArg {
    pub key: String,
    pub value: String,
}

impl NfArg {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One metric map to sample: the map, the integer key inside it, and the
/// aggregator applied over the sample ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorMapDef {
    pub name: String,
    pub key: u32,
    pub aggregator: Aggregator,
}

/// Configuration record identifying one network function.
///
/// Command paths are relative to the unpacked artifact root; an empty string
/// means the command is not provided. `map_name` is the pinned map this
/// program owns, `prev_map_name` the pinned map of its predecessor in the
/// chain (empty for the root).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BpfProgram {
    pub name: String,
    pub version: String,
    /// Archive file name, e.g. `foo.tar.gz`.
    pub artifact: String,
    #[serde(default)]
    pub map_name: String,
    #[serde(default)]
    pub prev_map_name: String,
    /// True when a long-running user-mode process remains after load.
    #[serde(default)]
    pub is_user_program: bool,
    #[serde(default)]
    pub cmd_start: String,
    #[serde(default)]
    pub cmd_stop: String,
    #[serde(default)]
    pub cmd_status: String,
    #[serde(default)]
    pub cmd_config: String,
    #[serde(default)]
    pub config_file_path: String,
    #[serde(default)]
    pub start_args: Vec<NfArg>,
    #[serde(default)]
    pub stop_args: Vec<NfArg>,
    #[serde(default)]
    pub status_args: Vec<NfArg>,
    /// Values written into named config maps right after start.
    #[serde(default)]
    pub map_args: Vec<NfArg>,
    #[serde(default)]
    pub monitor_maps: Vec<MonitorMapDef>,
    /// Optional rules blob written to disk before start.
    #[serde(default)]
    pub rules_file: String,
    #[serde(default)]
    pub rules: String,
    /// Address-space limit in bytes; 0 means unlimited.
    #[serde(default)]
    pub memory: u64,
    /// CPU-seconds limit; 0 means unlimited.
    #[serde(default)]
    pub cpu: u64,
    #[serde(default)]
    pub admin_status: AdminStatus,
    /// Position in the chain; the root dispatcher is 0.
    #[serde(default)]
    pub seq_id: u32,
    pub ebpf_type: EbpfType,
}

impl BpfProgram {
    /// Directory stem of the artifact: `foo.tar.gz` unpacks into `foo/`.
    pub fn artifact_stem(&self) -> &str {
        self.artifact.split('.').next().unwrap_or(&self.artifact)
    }

    pub fn add_start_arg(&mut self, arg: NfArg) {
        self.start_args.push(arg);
    }

    pub fn add_stop_arg(&mut self, arg: NfArg) {
        self.stop_args.push(arg);
    }
}
