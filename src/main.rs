use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ipnet::Ipv4Net;
use tokio::sync::broadcast;
use tracing::{info, warn};

use lan_watch_rs::config::{self, ScannerConfig};
use lan_watch_rs::discovery::{Discovery, HttpVendorLookup, VendorResolver};
use lan_watch_rs::logging::{self, LogFormat};
use lan_watch_rs::probe::PortProber;
use lan_watch_rs::registry::HostRegistry;
use lan_watch_rs::scheduler::ScanScheduler;
use lan_watch_rs::server::{self, AppState};
use lan_watch_rs::store::SqliteStore;
use lan_watch_rs::transport::{PnetArpTransport, PnetSynTransport};
use lan_watch_rs::netdetect;

/// lan-watch-rs: continuous LAN host discovery with half-open port probing and a persistent host registry.
#[derive(Debug, Clone, Parser)]
#[command(name = "lan-watch-rs", version, long_about = None)]
struct Cli {
    /// SQLite file holding the host registry.
    #[arg(long, env = "LANWATCH_DB", default_value = "lanwatch.db")]
    db_path: PathBuf,

    /// Address the control surface listens on.
    #[arg(long, env = "LANWATCH_BIND", default_value = "0.0.0.0:5000")]
    bind: String,

    /// Directory of static UI files served outside `/api`.
    #[arg(long, default_value = "ui")]
    ui_dir: PathBuf,

    /// How often the registry snapshot is pushed to listeners.
    #[arg(long = "push-interval-ms", default_value_t = 1000)]
    push_interval_ms: u64,

    /// Base URL of the MAC vendor API (`{base}/{mac}` returns the vendor as text).
    #[arg(long, env = "LANWATCH_VENDOR_API", default_value = "https://api.macvendors.com")]
    vendor_api: String,

    #[arg(long = "vendor-timeout-ms", default_value_t = 5000)]
    vendor_timeout_ms: u64,

    /// Retry failed vendor lookups after this many seconds. Unset: never retry.
    #[arg(long = "vendor-negative-ttl-secs")]
    vendor_negative_ttl_secs: Option<u64>,

    /// Max SYN probes in flight at once.
    #[arg(long, default_value_t = config::DEFAULT_MAX_CONCURRENT_PROBES)]
    max_concurrent_probes: usize,

    /// Upper bound on the port-probing phase of one cycle.
    #[arg(long = "cycle-deadline-secs")]
    cycle_deadline_secs: Option<u64>,

    /// Start scanning this CIDR immediately instead of waiting for the API.
    #[arg(long, conflicts_with = "auto_network")]
    network: Option<Ipv4Net>,

    /// Start scanning the first detected local /24.
    #[arg(long, default_value_t = false)]
    auto_network: bool,

    #[arg(long, default_value_t = config::DEFAULT_PORT_START)]
    port_start: u32,

    #[arg(long, default_value_t = config::DEFAULT_PORT_END)]
    port_end: u32,

    #[arg(long = "timeout-secs", default_value_t = config::DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    #[arg(long = "interval-secs", default_value_t = config::DEFAULT_INTERVAL_SECS)]
    interval_secs: u64,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_format);

    info!(
        db = %cli.db_path.display(),
        bind = %cli.bind,
        max_probes = cli.max_concurrent_probes,
        "lan-watch-rs starting"
    );

    let store = SqliteStore::open(&cli.db_path)
        .with_context(|| format!("failed to open host store: {}", cli.db_path.display()))?;
    let registry = Arc::new(HostRegistry::new(Arc::new(store)));
    registry.load_from_store().await.context("failed to load persisted hosts")?;

    let lookup = HttpVendorLookup::new(&cli.vendor_api, Duration::from_millis(cli.vendor_timeout_ms))
        .context("failed to build vendor lookup client")?;
    let vendors = VendorResolver::new(Arc::new(lookup))
        .with_negative_ttl(cli.vendor_negative_ttl_secs.map(Duration::from_secs));
    let discovery = Arc::new(Discovery::new(Arc::new(PnetArpTransport), vendors));
    let prober = PortProber::new(Arc::new(PnetSynTransport), cli.max_concurrent_probes);

    let (events, _) = broadcast::channel(64);
    let scheduler = ScanScheduler::new(registry, discovery, prober, events);
    let cycle_deadline = cli.cycle_deadline_secs.map(Duration::from_secs);

    let autostart = match (cli.network, cli.auto_network) {
        (Some(net), _) => Some(net),
        (None, true) => match netdetect::detect_local_cidrs() {
            Ok(cidrs) => cidrs.into_iter().next(),
            Err(e) => {
                warn!(error = %e, "failed to detect local networks");
                None
            }
        },
        (None, false) => None,
    };
    if let Some(net) = autostart {
        let cfg = ScannerConfig::new(
            net,
            cli.port_start,
            cli.port_end,
            Duration::from_secs(cli.timeout_secs),
            Duration::from_secs(cli.interval_secs),
        )?
        .with_cycle_deadline(cycle_deadline);
        scheduler.start(cfg);
    }

    tokio::spawn(server::push_snapshots(
        scheduler.clone(),
        Duration::from_millis(cli.push_interval_ms.max(1)),
    ));

    let state = AppState { scheduler: scheduler.clone(), cycle_deadline };
    tokio::select! {
        res = server::serve(&cli.bind, state, cli.ui_dir.clone()) => res?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }
    scheduler.stop();
    Ok(())
}
