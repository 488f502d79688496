//! End-to-end lifecycle flows against scripted shell artifacts.
//!
//! The artifacts here stand in for real NF bundles: their start scripts
//! create the pinned-map file on disk and clean it up on SIGTERM, which is
//! exactly the handshake the supervisor verifies. Kernel map surgery is
//! not exercised; these programs carry no predecessor map.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nfchain_common::metrics::{MetricsRegistry, NF_RUNNING, NF_START_COUNT, NF_STOP_COUNT};
use nfchain_common::types::{BpfProgram, Direction, EbpfType, NfArg};
use nfchain_common::Error;
use nfchain_core::artifacts::ArtifactStore;
use nfchain_core::process::{ProcessLauncher, TokioLauncher};
use nfchain_core::{NfInstance, ProgramState, Services};
use tokio::process::Child;

/// Launcher that records every invocation before delegating to the real
/// spawner, so tests can assert on the assembled command lines.
#[derive(Default)]
struct RecordingLauncher {
    calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl RecordingLauncher {
    fn calls(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn spawn(&self, binary: &Path, args: &[String]) -> std::io::Result<Child> {
        self.calls
            .lock()
            .unwrap()
            .push((binary.to_path_buf(), args.to_vec()));
        TokioLauncher.spawn(binary, args)
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    artifact_dir: PathBuf,
    pin: PathBuf,
    launcher: Arc<RecordingLauncher>,
    registry: Arc<MetricsRegistry>,
    services: Services,
}

/// Lay out `<bpf_dir>/<name>/<version>/<stem>/` so the store treats the
/// artifact as already fetched; no network is involved.
fn fixture(name: &str) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let bpf_dir = tmp.path().join("cache");
    let artifact_dir = bpf_dir.join(name).join("1.0").join(name);
    fs::create_dir_all(&artifact_dir).unwrap();

    let store = ArtifactStore::new(&bpf_dir, "http://127.0.0.1:1/repo", Duration::from_secs(1))
        .unwrap()
        .with_platform("focal");
    let launcher = Arc::new(RecordingLauncher::default());
    let registry = Arc::new(MetricsRegistry::new());
    let services = Services {
        store: Arc::new(store),
        launcher: launcher.clone(),
        sink: registry.clone(),
    };

    Fixture {
        pin: tmp.path().join(format!("{name}_pin")),
        _tmp: tmp,
        artifact_dir,
        launcher,
        registry,
        services,
    }
}

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    let mut file = fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    file.write_all(body.as_bytes()).unwrap();
    drop(file);
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn program(name: &str, pin: &Path) -> BpfProgram {
    BpfProgram {
        name: name.to_string(),
        version: "1.0".to_string(),
        artifact: format!("{name}.tar.gz"),
        map_name: pin.display().to_string(),
        is_user_program: true,
        cmd_start: "start.sh".to_string(),
        ebpf_type: EbpfType::Xdp,
        ..BpfProgram::default()
    }
}

#[tokio::test]
async fn test_user_program_start_stop_roundtrip() {
    let fx = fixture("foo");
    write_script(
        &fx.artifact_dir,
        "start.sh",
        &format!(
            "trap 'rm -f {pin}; exit 0' TERM\ntouch {pin}\nwhile true; do sleep 1; done\n",
            pin = fx.pin.display()
        ),
    );

    let mut instance = NfInstance::new(program("foo", &fx.pin), "", "dc1", fx.services.clone());
    instance
        .start("eth0", Direction::XdpIngress, true)
        .await
        .unwrap();

    assert!(fx.pin.exists());
    assert_eq!(instance.state, ProgramState::Running);
    assert!(instance.status().pid.is_some());
    assert!(instance.is_running().await.unwrap());
    assert_eq!(
        fx.registry.counter_value(NF_START_COUNT, &["foo", "xdpingress"]),
        1
    );
    assert_eq!(
        fx.registry.gauge_value(NF_RUNNING, &["foo", "xdpingress"]),
        Some(1.0)
    );

    instance
        .stop("eth0", Direction::XdpIngress, true)
        .await
        .unwrap();

    assert!(!fx.pin.exists());
    assert_eq!(instance.state, ProgramState::Stopped);
    assert_eq!(
        fx.registry.counter_value(NF_STOP_COUNT, &["foo", "xdpingress"]),
        1
    );
    assert_eq!(
        fx.registry.gauge_value(NF_RUNNING, &["foo", "xdpingress"]),
        Some(0.0)
    );

    // stop of an already-stopped instance is an error
    let err = instance
        .stop("eth0", Direction::XdpIngress, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotRunning(_)));
}

#[tokio::test]
async fn test_restart_count_is_monotonic() {
    let fx = fixture("bounce");
    write_script(
        &fx.artifact_dir,
        "start.sh",
        &format!(
            "trap 'rm -f {pin}; exit 0' TERM\ntouch {pin}\nwhile true; do sleep 1; done\n",
            pin = fx.pin.display()
        ),
    );

    let mut instance = NfInstance::new(program("bounce", &fx.pin), "", "dc1", fx.services.clone());
    for expected in [0, 1, 2] {
        instance
            .start("eth0", Direction::XdpIngress, true)
            .await
            .unwrap();
        assert_eq!(instance.status().restart_count, expected);
        instance
            .stop("eth0", Direction::XdpIngress, true)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_start_fails_when_pin_never_appears() {
    let fx = fixture("noisy");
    // a start script that never creates its pinned map
    write_script(&fx.artifact_dir, "start.sh", "while true; do sleep 1; done\n");

    let mut instance = NfInstance::new(program("noisy", &fx.pin), "", "dc1", fx.services.clone());
    let err = instance
        .start("eth0", Direction::XdpIngress, true)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PinnedMapMissing(_)), "got: {err}");
    assert_eq!(instance.state, ProgramState::Failed);
    // rollback terminated the child
    assert!(instance.status().pid.is_none());
    assert_eq!(
        fx.registry.counter_value(NF_START_COUNT, &["noisy", "xdpingress"]),
        0
    );
}

#[tokio::test]
async fn test_non_user_program_installs() {
    let fx = fixture("loader");
    write_script(
        &fx.artifact_dir,
        "start.sh",
        &format!("touch {pin}\nexit 0\n", pin = fx.pin.display()),
    );

    let mut prog = program("loader", &fx.pin);
    prog.is_user_program = false;
    prog.start_args = vec![NfArg::new("mode", "drv")];

    let mut instance = NfInstance::new(prog, "", "dc1", fx.services.clone());
    instance
        .start("eth0", Direction::XdpIngress, true)
        .await
        .unwrap();

    // installed: the loader exited and only the pin remains. Without a
    // status command, programs with no resident process report running.
    assert!(fx.pin.exists());
    assert!(instance.status().pid.is_none());
    assert!(instance.is_running().await.unwrap());

    // the envelope always leads with iface and direction
    let calls = fx.launcher.calls();
    let (binary, args) = calls.last().unwrap();
    assert!(binary.ends_with("start.sh"));
    assert_eq!(args[0], "--iface=eth0");
    assert_eq!(args[1], "--direction=xdpingress");
    assert!(args.contains(&"--mode=drv".to_string()));
}

#[tokio::test]
async fn test_stop_without_child_is_rejected() {
    let fx = fixture("ghost");
    let mut instance = NfInstance::new(program("ghost", &fx.pin), "", "dc1", fx.services.clone());
    let err = instance
        .stop("eth0", Direction::XdpIngress, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotRunning(_)));
}

#[tokio::test]
async fn test_rules_file_written_and_passed() {
    let fx = fixture("rules");
    write_script(
        &fx.artifact_dir,
        "start.sh",
        &format!("touch {pin}\nexit 0\n", pin = fx.pin.display()),
    );
    fs::create_dir_all(fx.artifact_dir.join("ingress")).unwrap();

    let mut prog = program("rules", &fx.pin);
    prog.is_user_program = false;
    prog.ebpf_type = EbpfType::Tc;
    prog.rules_file = "rules.txt".to_string();
    prog.rules = "drop 10.0.0.0/8".to_string();

    let mut instance = NfInstance::new(prog, "", "dc1", fx.services.clone());
    instance
        .start("eth0", Direction::Ingress, false)
        .await
        .unwrap();

    let rules_path = fx.artifact_dir.join("ingress/rules.txt");
    assert_eq!(fs::read_to_string(&rules_path).unwrap(), "drop 10.0.0.0/8");
    let mode = fs::metadata(&rules_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o644);

    let calls = fx.launcher.calls();
    let (_, args) = calls.last().unwrap();
    assert!(args
        .iter()
        .any(|a| a == &format!("--rules-file={}", rules_path.display())));
}

#[tokio::test]
async fn test_status_command_decides_liveness() {
    let fx = fixture("probed");
    write_script(&fx.artifact_dir, "status.sh", "echo running\n");

    let mut prog = program("probed", &fx.pin);
    prog.cmd_status = "status.sh".to_string();

    let mut instance = NfInstance::new(prog, "", "dc1", fx.services.clone());
    instance.file_path = fx.artifact_dir.clone();

    // output is trimmed and compared case-insensitively
    assert!(instance.is_running().await.unwrap());

    write_script(&fx.artifact_dir, "status.sh", "echo stopped\n");
    assert!(!instance.is_running().await.unwrap());
}

#[tokio::test]
async fn test_chain_orders_starts_and_reverses_stops() {
    let fx = fixture("alpha");
    // a second artifact in the same cache
    let beta_dir = fx
        .artifact_dir
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("beta/1.0/beta");
    fs::create_dir_all(&beta_dir).unwrap();

    for dir in [&fx.artifact_dir, &beta_dir] {
        write_script(dir, "start.sh", "exit 0\n");
    }

    let mut alpha = program("alpha", &fx.pin);
    alpha.is_user_program = false;
    alpha.map_name = String::new();
    alpha.seq_id = 0;
    let mut beta = alpha.clone();
    beta.name = "beta".to_string();
    beta.artifact = "beta.tar.gz".to_string();
    beta.seq_id = 1;

    // chaining disabled: programs attach side by side, no slot rewiring
    let mut chain = nfchain_core::NfChain::new(
        "eth0",
        Direction::XdpIngress,
        false,
        "",
        "dc1",
        fx.services.clone(),
    );
    // submitted out of order; sequence IDs decide the start order
    chain.start_chain(vec![beta, alpha]).await.unwrap();
    assert_eq!(chain.len(), 2);

    let starts: Vec<PathBuf> = fx.launcher.calls().into_iter().map(|(bin, _)| bin).collect();
    assert!(starts[0].starts_with(fx.artifact_dir.parent().unwrap().parent().unwrap()));
    assert!(starts[1].starts_with(beta_dir.parent().unwrap().parent().unwrap()));

    chain.stop_all().await.unwrap();
    assert!(chain.is_empty());
}

#[tokio::test]
async fn test_config_sidecar_runs_on_changes() {
    let fx = fixture("watched");
    let marker = fx.artifact_dir.join("config_runs");
    let config_file = fx.artifact_dir.join("nf.conf");
    fs::write(&config_file, "v1").unwrap();

    write_script(
        &fx.artifact_dir,
        "start.sh",
        &format!(
            "trap 'rm -f {pin}; exit 0' TERM\ntouch {pin}\nwhile true; do sleep 1; done\n",
            pin = fx.pin.display()
        ),
    );
    write_script(
        &fx.artifact_dir,
        "config.sh",
        &format!("echo ran >> {}\n", marker.display()),
    );

    let mut prog = program("watched", &fx.pin);
    prog.cmd_config = "config.sh".to_string();
    prog.config_file_path = config_file.display().to_string();

    let mut instance = NfInstance::new(prog, "", "dc1", fx.services.clone());
    instance
        .start("eth0", Direction::XdpIngress, true)
        .await
        .unwrap();

    // the watch observes the file and reruns the config command
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(marker.exists());

    // stop signals the sidecar and awaits it
    instance
        .stop("eth0", Direction::XdpIngress, true)
        .await
        .unwrap();
    assert_eq!(instance.state, ProgramState::Stopped);
}
