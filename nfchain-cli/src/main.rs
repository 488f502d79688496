use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use nfchain_common::metrics::{MetricsRegistry, MetricsSink};
use nfchain_common::types::{BpfProgram, Direction, EbpfType};
use nfchain_core::artifacts::ArtifactStore;
use nfchain_core::process::TokioLauncher;
use nfchain_core::{monitor, platform, recovery, retry, ChainManager, Config, Services};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// nfchain daemon: supervises chains of user-mode eBPF network functions
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Path to the daemon configuration (JSON)
    #[clap(short, long, default_value = "/etc/nfchain/config.json")]
    config: PathBuf,

    /// Path to the chain description started at boot (JSON)
    #[clap(long)]
    chains: Option<PathBuf>,

    /// Sets the level of verbosity
    #[clap(short, long)]
    verbose: bool,
}

/// Desired chain for one interface direction, as submitted by the
/// management surface.
#[derive(Debug, Deserialize)]
struct ChainSpec {
    iface: String,
    direction: Direction,
    #[serde(default)]
    programs: Vec<BpfProgram>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    let conf = Config::from_file(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    platform::mount_bpf_fs().context("failed to mount bpf filesystem")?;

    // leftovers from a crashed daemon must not hold the interfaces
    for name in [&conf.xdp_root_program_command, &conf.tc_root_program_command] {
        if !name.is_empty() {
            if let Err(e) = recovery::kill_external(name) {
                warn!("boot recovery for {name} failed: {e}");
            }
        }
    }

    let store = ArtifactStore::new(
        &conf.bpf_dir,
        &conf.kf_repo_url,
        Duration::from_secs(conf.http_client_timeout),
    )
    .context("failed to build artifact store")?;
    let sink: Arc<dyn MetricsSink> = Arc::new(MetricsRegistry::new());
    let services = Services {
        store: Arc::new(store),
        launcher: Arc::new(TokioLauncher),
        sink,
    };
    let manager = ChainManager::new(&conf, services);

    let chain_specs: Vec<ChainSpec> = match &cli.chains {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read chain description {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse chain description {}", path.display()))?
        }
        None => Vec::new(),
    };

    let mut samplers = Vec::new();
    for spec in chain_specs {
        let ebpf_type = match spec.direction {
            Direction::XdpIngress => EbpfType::Xdp,
            Direction::Ingress | Direction::Egress => EbpfType::Tc,
        };
        let chain = manager.chain(&spec.iface, spec.direction);
        {
            let mut chain = chain.write().await;
            if let Err(e) = chain.load_root(&conf, ebpf_type).await {
                error!("{e}: {}", e.source);
                continue;
            }
            if let Err(e) = chain.start_chain(spec.programs).await {
                error!("{e}: {}", e.source);
            }
        }
        let (cancel_tx, cancel) = retry::cancellation();
        samplers.push((
            cancel_tx,
            monitor::spawn(chain, conf.metrics_interval_secs, cancel),
        ));
    }

    info!("nfchaind up, {} chain(s) loaded", manager.all().len());
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutting down");

    for (cancel, task) in samplers {
        cancel.cancel();
        if let Err(e) = task.await {
            warn!("sampler task join failed: {e}");
        }
    }

    for chain in manager.all() {
        let mut chain = chain.write().await;
        if let Err(e) = chain.stop_all().await {
            error!("teardown failed: {e}: {}", e.source);
        }
    }

    Ok(())
}
