//! Child-process supervision for user-mode BPF programs.
//!
//! The launcher is an injected capability so tests can substitute one that
//! records invocations; everything else here works on the spawned child.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;

use log::{debug, warn};
use nfchain_common::types::{Direction, NfArg};
use nfchain_common::{Error, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

/// Executable permission bits required of every program command.
const EXECUTE_PERM: u32 = 0o111;

/// Spawns NF child processes with stdout/stderr captured.
pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, binary: &Path, args: &[String]) -> std::io::Result<Child>;
}

/// Production launcher backed by `tokio::process`.
#[derive(Debug, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn spawn(&self, binary: &Path, args: &[String]) -> std::io::Result<Child> {
        Command::new(binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

/// Fail unless `path` exists and carries an executable bit.
pub fn assert_executable(path: &Path) -> Result<()> {
    let meta =
        fs::metadata(path).map_err(|_| Error::BinaryNotExecutable(path.display().to_string()))?;
    if meta.permissions().mode() & EXECUTE_PERM == 0 {
        return Err(Error::BinaryNotExecutable(path.display().to_string()));
    }
    Ok(())
}

/// Assemble the command-line envelope handed to every NF command.
///
/// `--iface` and `--direction` always come first; the chaining map, log
/// directory and rules file are appended when present, followed by the
/// program's declared key/value arguments as `--key=value`.
pub fn assemble_args(
    iface: &str,
    direction: Direction,
    prev_map: Option<&str>,
    log_dir: Option<&str>,
    rules_file: Option<&Path>,
    declared: &[NfArg],
) -> Vec<String> {
    let mut args = Vec::with_capacity(declared.len() + 5);
    args.push(format!("--iface={iface}"));
    args.push(format!("--direction={direction}"));
    if let Some(map) = prev_map {
        args.push(format!("--map-name={map}"));
    }
    if let Some(dir) = log_dir {
        args.push(format!("--log-dir={dir}"));
    }
    if let Some(path) = rules_file {
        args.push(format!("--rules-file={}", path.display()));
    }
    for arg in declared {
        args.push(format!("--{}={}", arg.key, arg.value));
    }
    args
}

/// Ask the child to detach and clean up.
pub fn terminate(child: &Child, program: &str) -> Result<()> {
    let pid = child
        .id()
        .ok_or_else(|| Error::NotRunning(program.to_string()))?;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))
}

/// Apply address-space and CPU-seconds limits to a running child.
///
/// Only non-zero limits are applied; a limit that cannot be set is logged
/// and skipped, the program keeps running unconstrained.
pub fn set_rlimits(pid: u32, memory: u64, cpu: u64, program: &str) {
    if memory > 0 {
        if let Err(e) = prlimit(pid, libc::RLIMIT_AS, memory) {
            warn!("failed to set memory limit for {program}: {e}");
        }
    }
    if cpu > 0 {
        if let Err(e) = prlimit(pid, libc::RLIMIT_CPU, cpu) {
            warn!("failed to set cpu limit for {program}: {e}");
        }
    }
}

fn prlimit(pid: u32, resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    let rc = unsafe { libc::prlimit(pid as libc::pid_t, resource, &limit, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// True unless the process is absent or in zombie state.
pub fn is_process_running(pid: i32, name: &str) -> bool {
    match procfs::process::Process::new(pid).and_then(|p| p.stat()) {
        Ok(stat) => stat.state != 'Z',
        Err(e) => {
            debug!("process {pid} ({name}) not found: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_assemble_args_envelope() {
        let declared = vec![NfArg::new("verbose", "1"), NfArg::new("ports", "80,443")];
        let args = assemble_args(
            "eth0",
            Direction::XdpIngress,
            Some("/sys/fs/bpf/root_array"),
            Some("/var/log/nf"),
            Some(Path::new("/tmp/rules.txt")),
            &declared,
        );
        assert_eq!(
            args,
            vec![
                "--iface=eth0",
                "--direction=xdpingress",
                "--map-name=/sys/fs/bpf/root_array",
                "--log-dir=/var/log/nf",
                "--rules-file=/tmp/rules.txt",
                "--verbose=1",
                "--ports=80,443",
            ]
        );
    }

    #[test]
    fn test_assemble_args_minimal() {
        let args = assemble_args("eth0", Direction::Egress, None, None, None, &[]);
        assert_eq!(args, vec!["--iface=eth0", "--direction=egress"]);
    }

    #[test]
    fn test_assert_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("start.sh");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"#!/bin/sh\n").unwrap();
        drop(file);

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            assert_executable(&path),
            Err(Error::BinaryNotExecutable(_))
        ));

        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(assert_executable(&path).is_ok());

        assert!(assert_executable(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_is_process_running_self() {
        assert!(is_process_running(std::process::id() as i32, "self"));
        // PID 0 is never a user process visible in procfs
        assert!(!is_process_running(0, "nothing"));
    }
}
