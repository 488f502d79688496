//! Daemon configuration consumed by the lifecycle engine.

use std::path::Path;

use nfchain_common::{Error, Result};
use serde::Deserialize;

/// Values the engine reads from the daemon configuration. The file is
/// JSON; every field falls back to its default when absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the local artifact cache.
    pub bpf_dir: String,
    /// Base URL of the artifact repository.
    pub kf_repo_url: String,
    /// Whole-request timeout for artifact downloads, in seconds.
    pub http_client_timeout: u64,
    /// When false, programs attach independently and no slot rewiring
    /// happens.
    pub bpf_chaining_enabled: bool,
    /// Passed to every program as `--log-dir` when non-empty.
    pub log_dir: String,
    pub data_center: String,
    /// Sampler tick and metric ring length, in seconds.
    pub metrics_interval_secs: u64,

    pub xdp_root_program_name: String,
    pub xdp_root_program_version: String,
    pub xdp_root_program_artifact: String,
    pub xdp_root_program_map_name: String,
    pub xdp_root_program_command: String,
    pub xdp_root_program_is_user_program: bool,

    pub tc_root_program_name: String,
    pub tc_root_program_version: String,
    pub tc_root_program_artifact: String,
    pub tc_root_program_command: String,
    pub tc_root_program_is_user_program: bool,
    pub tc_root_program_ingress_map_name: String,
    pub tc_root_program_egress_map_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bpf_dir: "/var/lib/nfchain".to_string(),
            kf_repo_url: "http://localhost:8080/artifacts".to_string(),
            http_client_timeout: 30,
            bpf_chaining_enabled: true,
            log_dir: String::new(),
            data_center: String::new(),
            metrics_interval_secs: 30,

            xdp_root_program_name: "xdp-root".to_string(),
            xdp_root_program_version: "latest".to_string(),
            xdp_root_program_artifact: "xdp-root.tar.gz".to_string(),
            xdp_root_program_map_name: "/sys/fs/bpf/xdp_root_array".to_string(),
            xdp_root_program_command: "xdp_root".to_string(),
            xdp_root_program_is_user_program: false,

            tc_root_program_name: "tc-root".to_string(),
            tc_root_program_version: "latest".to_string(),
            tc_root_program_artifact: "tc-root.tar.gz".to_string(),
            tc_root_program_command: "tc_root".to_string(),
            tc_root_program_is_user_program: false,
            tc_root_program_ingress_map_name: "/sys/fs/bpf/tc/globals/tc_ingress_root_array"
                .to_string(),
            tc_root_program_egress_map_name: "/sys/fs/bpf/tc/globals/tc_egress_root_array"
                .to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let conf: Config = serde_json::from_str(r#"{"bpf_dir": "/tmp/nf"}"#).unwrap();
        assert_eq!(conf.bpf_dir, "/tmp/nf");
        assert!(conf.bpf_chaining_enabled);
        assert_eq!(conf.http_client_timeout, 30);
        assert_eq!(conf.xdp_root_program_name, "xdp-root");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"kf_repo_url": "http://repo.internal/kf", "bpf_chaining_enabled": false}}"#
        )
        .unwrap();

        let conf = Config::from_file(file.path()).unwrap();
        assert_eq!(conf.kf_repo_url, "http://repo.internal/kf");
        assert!(!conf.bpf_chaining_enabled);

        assert!(Config::from_file(Path::new("/nonexistent/conf.json")).is_err());
    }
}
