//! Host plumbing: the BPF filesystem mount and the artifact platform probe.

use log::warn;
use nfchain_common::{Error, Result};
use nix::mount::{mount, MsFlags};
use tokio::process::Command;

/// Mount point every pinned map lives under.
pub const BPF_FS_PATH: &str = "/sys/fs/bpf";

/// Mount bpffs at [`BPF_FS_PATH`] unless it is already mounted.
pub fn mount_bpf_fs() -> Result<()> {
    let mounts = std::fs::read_to_string("/proc/mounts")?;
    if mounts.contains(BPF_FS_PATH) {
        return Ok(());
    }

    warn!("bpf filesystem is not mounted, mounting");
    mount(
        Some("bpffs"),
        BPF_FS_PATH,
        Some("bpf"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))
}

/// Linux distribution codename used as the platform segment of artifact
/// URLs. Edge nodes are assumed to ship the lsb modules.
pub async fn platform() -> Result<String> {
    let output = Command::new("lsb_release")
        .arg("-cs")
        .output()
        .await
        .map_err(|e| Error::SpawnFailed {
            binary: "lsb_release".to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(Error::SpawnFailed {
            binary: "lsb_release".to_string(),
            reason: format!("exited with {}", output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
