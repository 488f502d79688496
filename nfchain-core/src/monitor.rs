//! Periodic sampling of per-program metric maps.
//!
//! One sampler task runs per (iface, direction) chain. Every tick it walks
//! the chain's running instances and publishes the aggregate of each
//! monitored map slot; the ring length equals the tick interval so that
//! `max-rate` reports a per-interval rate.

use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;

use crate::chain::SharedChain;
use crate::program::ProgramState;
use crate::retry::Cancel;

/// Spawn the sampler for one chain; it ends when `cancel` fires.
pub fn spawn(chain: SharedChain, interval_secs: u64, mut cancel: Cancel) -> JoinHandle<()> {
    let interval_secs = interval_secs.max(1);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(interval_secs));
        // the first tick of a tokio interval fires immediately; skip it so
        // freshly started programs get one full interval to settle
        tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("metrics sampler cancelled");
                    break;
                }
                _ = tick.tick() => {}
            }

            let mut chain = chain.write().await;
            let iface = chain.iface.clone();
            for instance in chain.instances_mut() {
                if instance.state != ProgramState::Running {
                    continue;
                }
                if instance.program.monitor_maps.is_empty() {
                    continue;
                }
                if let Err(e) = instance.monitor_maps(interval_secs as usize) {
                    warn!(
                        "metrics collection failed for {} on {iface}: {e}",
                        instance.program.name
                    );
                }
            }
        }
    })
}
