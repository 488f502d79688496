//! Runtime state and lifecycle of one network function.
//!
//! An [`NfInstance`] is created when a program is submitted for start and
//! destroyed only after a clean stop released every map handle it held.
//! The child-process handle has a single owner: the stop path consumes it,
//! everything else reads a snapshot through [`NfInstance::status`].

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use nfchain_common::metrics::{
    NF_RUNNING, NF_START_COUNT, NF_START_TIME, NF_STOP_COUNT, NF_UPDATE_COUNT,
};
use nfchain_common::types::{BpfProgram, Direction, EbpfType, STATUS_RUNNING};
use nfchain_common::{Error, Result};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::maps::{self, BpfMap, MetricsMap};
use crate::retry::{retry, Cancel, POLL_ATTEMPTS, POLL_INTERVAL};
use crate::{process, recovery, Services};

/// Lifecycle states of a network function instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Idle,
    Fetched,
    Started,
    Linked,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Point-in-time view of an instance, safe to take while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceStatus {
    pub pid: Option<u32>,
    pub prog_id: u32,
    pub state: ProgramState,
    pub restart_count: u32,
}

/// Config-watch task attached to a running instance; stop signals the
/// channel and then awaits the task.
struct Sidecar {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Runtime record of one BPF program on one interface direction.
pub struct NfInstance {
    pub program: BpfProgram,
    pub file_path: PathBuf,
    pub state: ProgramState,
    pub restart_count: u32,
    /// Kernel program ID observed through the predecessor's pinned map.
    pub prog_id: u32,
    pub log_dir: String,
    pub data_center: String,
    child: Option<Child>,
    bpf_maps: HashMap<String, BpfMap>,
    metrics_maps: HashMap<String, MetricsMap>,
    sidecar: Option<Sidecar>,
    services: Services,
    cancel: Cancel,
}

impl NfInstance {
    pub fn new(
        program: BpfProgram,
        log_dir: &str,
        data_center: &str,
        services: Services,
    ) -> Self {
        Self {
            program,
            file_path: PathBuf::new(),
            state: ProgramState::Idle,
            restart_count: 0,
            prog_id: 0,
            log_dir: log_dir.to_string(),
            data_center: data_center.to_string(),
            child: None,
            bpf_maps: HashMap::new(),
            metrics_maps: HashMap::new(),
            sidecar: None,
            services,
            cancel: Cancel::never(),
        }
    }

    /// Attach a cancellation token honored by the verification polls.
    pub fn set_cancel(&mut self, cancel: Cancel) {
        self.cancel = cancel;
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            pid: self.child.as_ref().and_then(Child::id),
            prog_id: self.prog_id,
            state: self.state,
            restart_count: self.restart_count,
        }
    }

    /// Resolve the unpacked artifact directory, downloading when absent.
    pub async fn fetch_artifacts(&mut self) -> Result<()> {
        self.file_path = self.services.store.ensure(&self.program).await?;
        self.state = ProgramState::Fetched;
        Ok(())
    }

    /// Start the program and verify the user/kernel handshake.
    ///
    /// On failure all state created by this start is rolled back: the
    /// child is killed and pinned files are left for a subsequent stop.
    pub async fn start(&mut self, iface: &str, direction: Direction, chain: bool) -> Result<()> {
        if matches!(self.state, ProgramState::Stopped | ProgramState::Failed) {
            self.restart_count += 1;
        }
        match self.run_start(iface, direction, chain).await {
            Ok(()) => {
                self.state = ProgramState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = ProgramState::Failed;
                self.rollback_start().await;
                Err(e)
            }
        }
    }

    async fn run_start(&mut self, iface: &str, direction: Direction, chain: bool) -> Result<()> {
        if self.file_path.as_os_str().is_empty() {
            self.fetch_artifacts().await?;
        }

        // leftover instances from a crashed supervisor must not share the
        // interface with the one being started
        recovery::kill_external(&self.program.cmd_start)?;

        let cmd = self.file_path.join(&self.program.cmd_start);
        process::assert_executable(&cmd)?;

        // hand the child a clean predecessor slot
        self.remove_prev_prog_fd();

        let rules_file = if !self.program.rules_file.is_empty() && !self.program.rules.is_empty() {
            match self.write_rules_file(direction) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("create or update rules file failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        let prev_map = (chain && !self.program.prev_map_name.is_empty())
            .then_some(self.program.prev_map_name.as_str());
        let log_dir = (!self.log_dir.is_empty()).then_some(self.log_dir.as_str());
        let args = process::assemble_args(
            iface,
            direction,
            prev_map,
            log_dir,
            rules_file.as_deref(),
            &self.program.start_args,
        );

        info!("BPF program start command: {} {:?}", cmd.display(), args);
        let child = self
            .services
            .launcher
            .spawn(&cmd, &args)
            .map_err(|e| Error::SpawnFailed {
                binary: cmd.display().to_string(),
                reason: e.to_string(),
            })?;
        self.child = Some(child);
        self.state = ProgramState::Started;

        if !self.program.is_user_program {
            // a plain loader: reap it, then the pinned map is the only
            // success signal. The program is installed, not running.
            info!("no user mode BPF program - {}, no pid", self.program.name);
            if let Some(mut child) = self.child.take() {
                let status = child.wait().await.map_err(|e| Error::WaitFailed {
                    program: self.program.name.clone(),
                    reason: e.to_string(),
                })?;
                if !status.success() {
                    return Err(Error::WaitFailed {
                        program: self.program.name.clone(),
                        reason: format!("loader exited with {status}"),
                    });
                }
            }
            self.verify_pinned_map_exists(chain).await?;
            return Ok(());
        }

        if !self.is_running().await? {
            error!("eBPF program {} failed to start", self.program.name);
            return Err(Error::NotRunning(self.program.name.clone()));
        }

        self.verify_pinned_map_exists(chain).await?;

        if !self.program.map_args.is_empty() {
            self.update_map_args(direction)?;
        }

        // the child registered itself in the predecessor's map; record the
        // program ID it was assigned, validated against the kernel
        if !self.program.prev_map_name.is_empty() {
            let prev = PathBuf::from(&self.program.prev_map_name);
            let mut cancel = self.cancel.clone();
            self.prog_id =
                retry(POLL_ATTEMPTS, POLL_INTERVAL, &mut cancel, || maps::slot0_prog_id(&prev))
                    .await
                    .map_err(|e| {
                        Error::ChainIntegrity(format!(
                            "failed to fetch program ID of {}: {e}",
                            self.program.name
                        ))
                    })?;
            self.state = ProgramState::Linked;
        }

        if !self.program.cmd_config.is_empty() && !self.program.config_file_path.is_empty() {
            self.spawn_config_sidecar();
        }

        if let Some(pid) = self.child.as_ref().and_then(Child::id) {
            process::set_rlimits(pid, self.program.memory, self.program.cpu, &self.program.name);
        }

        let labels = [self.program.name.as_str(), direction.as_str()];
        self.services.sink.incr(NF_START_COUNT, &labels);
        self.services.sink.set(unix_now(), NF_START_TIME, &labels);
        self.services.sink.set(1.0, NF_RUNNING, &labels);

        info!(
            "BPF program - {} started, process id {:?} program id {}",
            self.program.name,
            self.child.as_ref().and_then(Child::id),
            self.prog_id
        );
        Ok(())
    }

    async fn rollback_start(&mut self) {
        if let Some(sidecar) = self.sidecar.take() {
            let _ = sidecar.cancel.send(());
            let _ = sidecar.task.await;
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("failed to kill child during start rollback: {e}");
            }
        }
    }

    /// Stop the program and verify it cleaned up its kernel state.
    ///
    /// Not cancellable: it runs to completion or leaves the instance in
    /// [`ProgramState::Failed`] for the management layer to retry.
    pub async fn stop(&mut self, iface: &str, direction: Direction, chain: bool) -> Result<()> {
        if self.program.is_user_program && self.child.is_none() {
            return Err(Error::NotRunning(self.program.name.clone()));
        }

        info!("stopping BPF program - {}", self.program.name);
        self.state = ProgramState::Stopping;

        match self.run_stop(iface, direction, chain).await {
            Ok(()) => {
                self.state = ProgramState::Stopped;
                Ok(())
            }
            Err(e) => {
                self.state = ProgramState::Failed;
                Err(e)
            }
        }
    }

    async fn run_stop(&mut self, iface: &str, direction: Direction, chain: bool) -> Result<()> {
        // release map handles, keeping the kernel IDs for the vanish check
        let mut recorded: Vec<BpfMap> = self.bpf_maps.drain().map(|(_, map)| map).collect();
        recorded.extend(self.metrics_maps.drain().map(|(_, metric)| metric.map));

        if let Some(sidecar) = self.sidecar.take() {
            info!("stopping config watch for {}", self.program.name);
            let _ = sidecar.cancel.send(());
            if let Err(e) = sidecar.task.await {
                warn!("config watch task join failed: {e}");
            }
        }

        self.prog_id = 0;

        let labels = [self.program.name.as_str(), direction.as_str()];
        self.services.sink.incr(NF_STOP_COUNT, &labels);
        self.services.sink.set(0.0, NF_RUNNING, &labels);

        if self.program.cmd_stop.is_empty() {
            self.terminate_child().await?;
        } else {
            self.run_stop_command(iface, direction).await?;
        }

        self.verify_pinned_map_vanish(chain).await?;
        self.verify_metrics_maps_vanish(&recorded).await?;
        Ok(())
    }

    /// SIGTERM the child and reap it; used when no stop command is shipped.
    async fn terminate_child(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            process::terminate(&child, &self.program.name)?;
            if let Err(e) = child.wait().await {
                error!("wait at stopping bpf program {} errored: {e}", self.program.name);
            }
        }
        Ok(())
    }

    /// Run the artifact's stop command synchronously. Its exit status is
    /// only warned about: the stop must proceed to the vanish checks.
    async fn run_stop_command(&mut self, iface: &str, direction: Direction) -> Result<()> {
        let cmd = self.file_path.join(&self.program.cmd_stop);
        process::assert_executable(&cmd)?;

        let args =
            process::assemble_args(iface, direction, None, None, None, &self.program.stop_args);
        info!("BPF program stop command: {} {:?}", cmd.display(), args);

        match self.services.launcher.spawn(&cmd, &args) {
            Ok(child) => match child.wait_with_output().await {
                Ok(output) if !output.status.success() => {
                    warn!(
                        "failed to stop the program {}: {}",
                        self.program.cmd_stop, output.status
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("failed to stop the program {}: {e}", self.program.cmd_stop),
            },
            Err(e) => warn!("failed to stop the program {}: {e}", self.program.cmd_stop),
        }
        self.child = None;
        Ok(())
    }

    /// Liveness contract: the status command's word wins when provided,
    /// programs without a resident process always count as running once
    /// installed, and resident processes must not be zombies.
    pub async fn is_running(&self) -> Result<bool> {
        if !self.program.cmd_status.is_empty() {
            let cmd = self.file_path.join(&self.program.cmd_status);
            process::assert_executable(&cmd)?;

            let mut args = Vec::with_capacity(self.program.status_args.len());
            for arg in &self.program.status_args {
                args.push(format!("--{}={}", arg.key, arg.value));
            }

            let child = self
                .services
                .launcher
                .spawn(&cmd, &args)
                .map_err(|e| Error::SpawnFailed {
                    binary: cmd.display().to_string(),
                    reason: e.to_string(),
                })?;
            let output = child.wait_with_output().await.map_err(|e| Error::WaitFailed {
                program: self.program.name.clone(),
                reason: e.to_string(),
            })?;
            if !output.status.success() {
                warn!("failed to execute {}: {}", self.program.cmd_status, output.status);
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Ok(stdout.trim().eq_ignore_ascii_case(STATUS_RUNNING));
        }

        if !self.program.is_user_program {
            return Ok(true);
        }

        let pid = self.verify_process_object().await?;
        Ok(process::is_process_running(pid, &self.program.name))
    }

    /// Wait for the spawned child to expose a PID.
    async fn verify_process_object(&self) -> Result<i32> {
        let mut cancel = self.cancel.clone();
        retry(POLL_ATTEMPTS, POLL_INTERVAL, &mut cancel, || {
            self.child
                .as_ref()
                .and_then(Child::id)
                .map(|pid| pid as i32)
                .ok_or_else(|| Error::NotRunning(self.program.name.clone()))
        })
        .await
    }

    /// Apply the program's `map_args` to its named config maps.
    pub fn update_map_args(&mut self, direction: Direction) -> Result<()> {
        for arg in self.program.map_args.clone() {
            info!("update map args key {} val {}", arg.key, arg.value);
            if !self.bpf_maps.contains_key(&arg.key) {
                let map = self.find_config_map(&arg.key)?;
                self.bpf_maps.insert(arg.key.clone(), map);
            }
            if let Some(map) = self.bpf_maps.get(&arg.key) {
                maps::update_values(map, &arg.value)?;
            }
        }
        self.services.sink.incr(
            NF_UPDATE_COUNT,
            &[self.program.name.as_str(), direction.as_str()],
        );
        Ok(())
    }

    /// Sample every monitored map slot and publish the aggregates.
    pub fn monitor_maps(&mut self, intervals: usize) -> Result<()> {
        for def in self.program.monitor_maps.clone() {
            debug!(
                "monitor maps element {} key {} aggregator {}",
                def.name, def.key, def.aggregator
            );
            let map_key = format!("{}|{}|{}", def.name, def.key, def.aggregator);
            if !self.metrics_maps.contains_key(&map_key) {
                let map = self.find_config_map(&def.name)?;
                info!(
                    "added metrics map id {} name {} key {} aggregator {}",
                    map.id, map.name, def.key, def.aggregator
                );
                self.metrics_maps.insert(
                    map_key.clone(),
                    MetricsMap::new(map, def.key, def.aggregator, intervals),
                );
            }
            if let Some(metric) = self.metrics_maps.get_mut(&map_key) {
                let value = metric.sample()?;
                let metric_name = format!("{}_{}_{}", def.name, def.key, def.aggregator);
                self.services.sink.set_value(
                    value,
                    nfchain_common::metrics::NF_MONITOR_MAP,
                    &[self.program.name.as_str(), metric_name.as_str()],
                );
            }
        }
        Ok(())
    }

    fn find_config_map(&self, name: &str) -> Result<BpfMap> {
        match self.program.ebpf_type {
            // TC programs pin their maps; open by path
            EbpfType::Tc => maps::open_pinned(Path::new(name), &self.program.name),
            // XDP config maps are unpinned; walk the kernel's map IDs
            EbpfType::Xdp => maps::find_by_name(name, &self.program.name),
        }
    }

    /// Write the successor's program fd into this program's own map.
    pub fn put_next_prog_fd(&self, prog_id: u32) -> Result<()> {
        if self.program.map_name.is_empty() {
            return Ok(());
        }
        info!(
            "updating next prog fd: map {} id {prog_id}",
            self.program.map_name
        );
        maps::put_slot0_fd(Path::new(&self.program.map_name), prog_id)
    }

    /// Clear this program's own next-program slot; used when it is (or
    /// becomes) the tail of the chain.
    pub fn remove_next_prog_fd(&self) {
        if self.program.map_name.is_empty() {
            return;
        }
        if let Err(e) = maps::delete_slot0(Path::new(&self.program.map_name)) {
            debug!("remove next prog fd skipped: {e}");
        }
    }

    /// Clear the predecessor's slot pointing at this program.
    pub fn remove_prev_prog_fd(&self) {
        if self.program.prev_map_name.is_empty() {
            return;
        }
        if let Err(e) = maps::delete_slot0(Path::new(&self.program.prev_map_name)) {
            debug!("remove prev prog fd skipped: {e}");
        }
    }

    /// Poll for the program's pinned map file to appear.
    pub async fn verify_pinned_map_exists(&self, chain: bool) -> Result<()> {
        if !chain || self.program.map_name.is_empty() {
            return Ok(());
        }

        debug!(
            "verify pinned map exists: program {} map {}",
            self.program.name, self.program.map_name
        );
        let map_name = self.program.map_name.clone();
        let mut cancel = self.cancel.clone();
        retry(POLL_ATTEMPTS, POLL_INTERVAL, &mut cancel, || {
            if Path::new(&map_name).exists() {
                Ok(())
            } else {
                warn!("failed to find pinned file, checking again after a second ...");
                Err(Error::PinnedMapMissing(map_name.clone()))
            }
        })
        .await?;

        info!("pinned map file created: {}", self.program.map_name);
        Ok(())
    }

    /// Poll for the pinned map file to disappear after stop. Only XDP
    /// programs in a chained setup remove their pinned file.
    pub async fn verify_pinned_map_vanish(&self, chain: bool) -> Result<()> {
        if self.program.map_name.is_empty() || self.program.ebpf_type != EbpfType::Xdp || !chain {
            return Ok(());
        }

        debug!(
            "verify pinned map vanish: program {} map {}",
            self.program.name, self.program.map_name
        );
        let map_name = self.program.map_name.clone();
        let program = self.program.name.clone();
        let mut cancel = self.cancel.clone();
        retry(POLL_ATTEMPTS, POLL_INTERVAL, &mut cancel, || {
            if !Path::new(&map_name).exists() {
                Ok(())
            } else {
                warn!("pinned file still exists, checking again after a second");
                Err(Error::PinnedMapLingering {
                    map: map_name.clone(),
                    program: program.clone(),
                })
            }
        })
        .await?;

        info!("pinned map file removed: {}", self.program.map_name);
        Ok(())
    }

    /// Poll until the kernel stopped resolving every recorded map ID.
    async fn verify_metrics_maps_vanish(&self, recorded: &[BpfMap]) -> Result<()> {
        if recorded.is_empty() {
            return Ok(());
        }

        let mut cancel = self.cancel.clone();
        retry(POLL_ATTEMPTS, POLL_INTERVAL, &mut cancel, || {
            for map in recorded {
                if maps::map_id_exists(map.id) {
                    warn!("bpf map reference still exists - {}", map.name);
                    return Err(Error::MapReferenceLingering(self.program.name.clone()));
                }
            }
            Ok(())
        })
        .await
    }

    /// Write the rules blob to `<artifact>/<direction>/<rules_file>`.
    fn write_rules_file(&self, direction: Direction) -> Result<PathBuf> {
        if self.program.rules_file.is_empty() {
            return Err(Error::InvalidConfig("rules file name is empty".to_string()));
        }

        let path = self
            .file_path
            .join(direction.as_str())
            .join(&self.program.rules_file);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(0o644)
            .open(&path)?;
        file.write_all(self.program.rules.as_bytes())?;
        Ok(path)
    }

    /// Watch the program's config file and rerun its config command on
    /// every change. The task ends when stop signals the channel.
    fn spawn_config_sidecar(&mut self) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let cmd = self.file_path.join(&self.program.cmd_config);
        let config_path = PathBuf::from(&self.program.config_file_path);
        let launcher = self.services.launcher.clone();
        let name = self.program.name.clone();

        info!("config monitoring - {}", config_path.display());
        let task = tokio::spawn(async move {
            let mut last_modified = None;
            let mut tick = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!("config watch for {name} cancelled");
                        break;
                    }
                    _ = tick.tick() => {}
                }

                let modified = std::fs::metadata(&config_path)
                    .and_then(|m| m.modified())
                    .ok();
                if modified == last_modified {
                    continue;
                }
                last_modified = modified;
                if modified.is_none() {
                    continue;
                }

                match launcher.spawn(&cmd, &[]) {
                    Ok(child) => match child.wait_with_output().await {
                        Ok(output) if !output.status.success() => {
                            warn!("config command for {name} exited with {}", output.status);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("config command for {name} failed: {e}"),
                    },
                    Err(e) => warn!("failed to run config command for {name}: {e}"),
                }
            }
        });

        self.sidecar = Some(Sidecar {
            cancel: cancel_tx,
            task,
        });
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as f64)
        .unwrap_or(0.0)
}
