//! Startup recovery: kill NF processes left over from a prior supervisor.

use log::{info, warn};
use nfchain_common::types::kernel_name;
use nfchain_common::{Error, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Kill every process whose executable name matches `process_name`
/// (kernel-truncated to 15 bytes) and whose parent is not this supervisor.
///
/// Called before every program start and at daemon boot for the configured
/// root program names. A run that finds no matching process is a no-op,
/// so repeated invocations are safe.
pub fn kill_external(process_name: &str) -> Result<()> {
    if process_name.is_empty() {
        return Err(Error::InvalidConfig("process name can not be empty".to_string()));
    }

    let ps_name = kernel_name(process_name);
    let my_pid = std::process::id() as i32;

    info!("searching for process {process_name} not parented by {my_pid}");
    let processes = procfs::process::all_processes().map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("failed to fetch processes list: {e}"),
        ))
    })?;

    for process in processes.flatten() {
        let Ok(stat) = process.stat() else { continue };
        if stat.comm.contains(ps_name) && stat.ppid != my_pid {
            warn!(
                "found process id {} name {} ppid {}, stopping it",
                stat.pid, stat.comm, stat.ppid
            );
            kill(Pid::from_raw(stat.pid), Signal::SIGKILL).map_err(|e| {
                Error::Io(std::io::Error::from_raw_os_error(e as i32))
            })?;
        }
    }

    Ok(())
}
