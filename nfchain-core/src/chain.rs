//! Ordered program chains per (interface, direction).
//!
//! A chain is a root dispatcher plus an ordered list of network functions.
//! Adjacent programs are linked through the predecessor's pinned map: its
//! slot 0 holds the successor's program fd. All mutations of one chain are
//! serialized behind its lock; status reads share the read half.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use nfchain_common::types::{AdminStatus, BpfProgram, Direction, EbpfType, NfArg};
use nfchain_common::{Error, OpError};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::program::NfInstance;
use crate::Services;

/// A chain behind its serialization lock.
pub type SharedChain = Arc<RwLock<NfChain>>;

/// Start argument conventionally understood by root program artifacts.
const CMD_START: &str = "start";
const CMD_STOP: &str = "stop";

/// Build the root dispatcher record for one (direction, type) out of the
/// daemon configuration. Roots are owned by configuration, not submitted.
pub fn root_program(
    direction: Direction,
    ebpf_type: EbpfType,
    conf: &Config,
) -> Result<BpfProgram, Error> {
    let mut program = match ebpf_type {
        EbpfType::Xdp => BpfProgram {
            name: conf.xdp_root_program_name.clone(),
            version: conf.xdp_root_program_version.clone(),
            artifact: conf.xdp_root_program_artifact.clone(),
            map_name: conf.xdp_root_program_map_name.clone(),
            is_user_program: conf.xdp_root_program_is_user_program,
            cmd_start: conf.xdp_root_program_command.clone(),
            cmd_stop: conf.xdp_root_program_command.clone(),
            ebpf_type: EbpfType::Xdp,
            ..BpfProgram::default()
        },
        EbpfType::Tc => {
            let map_name = match direction {
                Direction::Ingress => conf.tc_root_program_ingress_map_name.clone(),
                Direction::Egress => conf.tc_root_program_egress_map_name.clone(),
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "unknown direction {other} for tc root program"
                    )))
                }
            };
            BpfProgram {
                name: conf.tc_root_program_name.clone(),
                version: conf.tc_root_program_version.clone(),
                artifact: conf.tc_root_program_artifact.clone(),
                map_name,
                is_user_program: conf.tc_root_program_is_user_program,
                cmd_start: conf.tc_root_program_command.clone(),
                cmd_stop: conf.tc_root_program_command.clone(),
                ebpf_type: EbpfType::Tc,
                ..BpfProgram::default()
            }
        }
    };

    program.admin_status = AdminStatus::Enabled;
    program.seq_id = 0;
    program.add_start_arg(NfArg::new("cmd", CMD_START));
    program.add_stop_arg(NfArg::new("cmd", CMD_STOP));
    Ok(program)
}

/// One (iface, direction) chain and the instances running on it.
pub struct NfChain {
    pub iface: String,
    pub direction: Direction,
    /// When false, programs run side by side without slot rewiring.
    pub chaining: bool,
    log_dir: String,
    data_center: String,
    services: Services,
    instances: Vec<NfInstance>,
}

impl NfChain {
    pub fn new(
        iface: &str,
        direction: Direction,
        chaining: bool,
        log_dir: &str,
        data_center: &str,
        services: Services,
    ) -> Self {
        Self {
            iface: iface.to_string(),
            direction,
            chaining,
            log_dir: log_dir.to_string(),
            data_center: data_center.to_string(),
            services,
            instances: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[NfInstance] {
        &self.instances
    }

    pub fn instances_mut(&mut self) -> &mut [NfInstance] {
        &mut self.instances
    }

    pub fn instance(&self, name: &str) -> Option<&NfInstance> {
        self.instances.iter().find(|i| i.program.name == name)
    }

    fn op_error(&self, op: &'static str, program: &str, source: Error) -> OpError {
        OpError::new(op, program, &self.iface, self.direction, source)
    }

    /// Provision and start the root dispatcher for this chain.
    ///
    /// A pinned map already present at the root's path is a leftover from
    /// a crashed supervisor: the old root is stopped before the new start.
    pub async fn load_root(&mut self, conf: &Config, ebpf_type: EbpfType) -> Result<(), OpError> {
        let program = root_program(self.direction, ebpf_type, conf)
            .map_err(|e| self.op_error("load-root", "root", e))?;
        info!(
            "loading root program {} for {}/{} type {ebpf_type}",
            program.name, self.iface, self.direction
        );

        let name = program.name.clone();
        let mut instance = NfInstance::new(program, &self.log_dir, &self.data_center, self.services.clone());
        instance
            .fetch_artifacts()
            .await
            .map_err(|e| self.op_error("load-root", &name, e))?;

        if !instance.program.map_name.is_empty()
            && Path::new(&instance.program.map_name).exists()
        {
            warn!(
                "previous instance of root program {} is running, stopping it",
                instance.program.name
            );
            instance
                .stop(&self.iface, self.direction, self.chaining)
                .await
                .map_err(|e| self.op_error("stop", &name, e))?;
        }

        instance
            .start(&self.iface, self.direction, self.chaining)
            .await
            .map_err(|e| self.op_error("start", &name, e))?;

        if self.chaining {
            // the root is the tail until a network function registers
            instance.remove_next_prog_fd();
        }
        self.instances.push(instance);
        Ok(())
    }

    /// Start `program` at the tail of the chain and wire it in: the
    /// predecessor's slot 0 receives the new program's fd, and the new
    /// tail's own slot is cleared.
    pub async fn add_program(&mut self, program: BpfProgram) -> Result<(), OpError> {
        let name = program.name.clone();

        if self.chaining {
            if let Some(prev) = self.instances.last() {
                if program.prev_map_name != prev.program.map_name {
                    return Err(self.op_error(
                        "start",
                        &name,
                        Error::ChainIntegrity(format!(
                            "prev map {} of {} does not match chain tail map {}",
                            program.prev_map_name, name, prev.program.map_name
                        )),
                    ));
                }
            }
        }

        let mut instance =
            NfInstance::new(program, &self.log_dir, &self.data_center, self.services.clone());
        instance
            .start(&self.iface, self.direction, self.chaining)
            .await
            .map_err(|e| self.op_error("start", &name, e))?;

        if self.chaining {
            if let Some(prev) = self.instances.last() {
                if instance.prog_id != 0 {
                    prev.put_next_prog_fd(instance.prog_id)
                        .map_err(|e| self.op_error("link", &name, e))?;
                }
            }
            instance.remove_next_prog_fd();
        }

        self.instances.push(instance);
        Ok(())
    }

    /// Start a whole submitted chain, lowest sequence ID first. Programs
    /// disabled by their admin status are skipped.
    pub async fn start_chain(&mut self, mut programs: Vec<BpfProgram>) -> Result<(), OpError> {
        programs.sort_by_key(|p| p.seq_id);
        for program in programs {
            if program.admin_status == AdminStatus::Disabled {
                info!("skipping disabled program {}", program.name);
                continue;
            }
            self.add_program(program).await?;
        }
        Ok(())
    }

    /// Stop one program and clear its predecessor's slot. The chain keeps
    /// the gap: traffic skips the removed link until a restart rewires it.
    pub async fn stop_program(&mut self, name: &str) -> Result<(), OpError> {
        let idx = self
            .instances
            .iter()
            .position(|i| i.program.name == name)
            .ok_or_else(|| {
                self.op_error("stop", name, Error::NotRunning(name.to_string()))
            })?;

        let iface = self.iface.clone();
        let direction = self.direction;
        let chaining = self.chaining;
        if let Err(e) = self.instances[idx].stop(&iface, direction, chaining).await {
            return Err(OpError::new("stop", name, &iface, direction, e));
        }

        if self.chaining && idx > 0 {
            self.instances[idx - 1].remove_next_prog_fd();
        }
        self.instances.remove(idx);
        Ok(())
    }

    /// Tear the chain down in reverse start order.
    pub async fn stop_all(&mut self) -> Result<(), OpError> {
        while let Some(name) = self.instances.last().map(|i| i.program.name.clone()) {
            self.stop_program(&name).await?;
        }
        Ok(())
    }
}

/// All chains managed by this daemon, keyed by (iface, direction).
pub struct ChainManager {
    chaining: bool,
    log_dir: String,
    data_center: String,
    services: Services,
    chains: std::sync::Mutex<HashMap<(String, Direction), SharedChain>>,
}

impl ChainManager {
    pub fn new(conf: &Config, services: Services) -> Self {
        Self {
            chaining: conf.bpf_chaining_enabled,
            log_dir: conf.log_dir.clone(),
            data_center: conf.data_center.clone(),
            services,
            chains: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The chain for (iface, direction), created on first use.
    pub fn chain(&self, iface: &str, direction: Direction) -> SharedChain {
        let mut chains = self.chains.lock().unwrap();
        chains
            .entry((iface.to_string(), direction))
            .or_insert_with(|| {
                Arc::new(RwLock::new(NfChain::new(
                    iface,
                    direction,
                    self.chaining,
                    &self.log_dir,
                    &self.data_center,
                    self.services.clone(),
                )))
            })
            .clone()
    }

    pub fn all(&self) -> Vec<SharedChain> {
        let chains = self.chains.lock().unwrap();
        chains.values().cloned().collect()
    }
}
