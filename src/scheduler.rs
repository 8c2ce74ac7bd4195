use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::discovery::Discovery;
use crate::probe::PortProber;
use crate::registry::HostRegistry;
use crate::types::ScanEvent;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

#[derive(Serialize, Debug, Clone)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub config: Option<ScannerConfig>,
}

struct Control {
    state: SchedulerState,
    config: Option<ScannerConfig>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    control: Mutex<Control>,
    wake: Notify,
    registry: Arc<HostRegistry>,
    discovery: Arc<Discovery>,
    prober: PortProber,
    events: broadcast::Sender<ScanEvent>,
}

/// Drives periodic discovery and port probing.
///
/// At most one loop task is live per scheduler. `stop` and `pause` are
/// observed between cycles; a cycle already in flight runs to completion.
#[derive(Clone)]
pub struct ScanScheduler {
    shared: Arc<Shared>,
}

impl ScanScheduler {
    pub fn new(
        registry: Arc<HostRegistry>,
        discovery: Arc<Discovery>,
        prober: PortProber,
        events: broadcast::Sender<ScanEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        cancel.cancel();
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: SchedulerState::Stopped,
                    config: None,
                    cancel,
                    task: None,
                }),
                wake: Notify::new(),
                registry,
                discovery,
                prober,
                events,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.shared.registry
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.shared.discovery
    }

    pub fn prober(&self) -> &PortProber {
        &self.shared.prober
    }

    pub fn events(&self) -> &broadcast::Sender<ScanEvent> {
        &self.shared.events
    }

    pub fn state(&self) -> SchedulerState {
        self.control().state
    }

    pub fn status(&self) -> SchedulerStatus {
        let c = self.control();
        SchedulerStatus {
            state: c.state,
            config: c.config.clone(),
        }
    }

    /// Install `config` and run. If a loop is already live it picks up the new
    /// configuration and scans right away; otherwise a new loop is spawned,
    /// after any stopping predecessor has finished its last cycle.
    pub fn start(&self, config: ScannerConfig) {
        let mut c = self.control();
        info!(network = %config.network, ports = %format!("{}-{}", config.port_start, config.port_end),
            interval = ?config.interval, "scanner start");
        c.config = Some(config);
        c.state = SchedulerState::Running;

        let live = !c.cancel.is_cancelled() && c.task.as_ref().is_some_and(|t| !t.is_finished());
        if live {
            self.shared.wake.notify_one();
            return;
        }

        let cancel = CancellationToken::new();
        let previous = c.task.take();
        let shared = self.shared.clone();
        let token = cancel.clone();
        c.cancel = cancel;
        c.task = Some(tokio::spawn(async move {
            if let Some(prev) = previous {
                let _ = prev.await;
            }
            run_loop(shared, token).await;
        }));
    }

    pub fn pause(&self) -> SchedulerState {
        let mut c = self.control();
        if c.state == SchedulerState::Running {
            c.state = SchedulerState::Paused;
            info!("scanner paused");
        }
        c.state
    }

    pub fn resume(&self) -> SchedulerState {
        let mut c = self.control();
        if c.state == SchedulerState::Paused {
            c.state = SchedulerState::Running;
            info!("scanner resumed");
        }
        c.state
    }

    pub fn stop(&self) -> SchedulerState {
        let mut c = self.control();
        if c.state != SchedulerState::Stopped {
            info!("scanner stopping");
        }
        c.state = SchedulerState::Stopped;
        c.cancel.cancel();
        c.state
    }

    /// Wait for the loop task to exit. Intended for shutdown and tests.
    pub async fn join(&self) {
        let task = self.control().task.take();
        if let Some(t) = task {
            let _ = t.await;
        }
    }

    /// Ad-hoc port scan of one host outside the schedule. Flags the host while
    /// running, merges the result into the registry, and pushes events.
    pub async fn scan_host_now(&self, host: Ipv4Addr, ports: &[u16], timeout: Duration) -> BTreeSet<u16> {
        let ip = host.to_string();
        let registry = &self.shared.registry;
        registry.begin_port_scan(&ip).await;
        let _ = self.shared.events.send(ScanEvent::ScanUpdate(registry.snapshot().await));

        let found = self.shared.prober.scan_host(host, ports, timeout).await;
        registry.finish_port_scan(&ip, &found).await;
        info!(%ip, open = ?found, "on-demand port scan finished");
        let _ = self.shared.events.send(ScanEvent::PortScanResult {
            host: ip,
            open_ports: found.iter().copied().collect(),
        });
        found
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        lock_control(&self.shared)
    }
}

fn lock_control(shared: &Shared) -> MutexGuard<'_, Control> {
    // Control holds no invariants a panic could half-apply.
    shared.control.lock().unwrap_or_else(|p| p.into_inner())
}

async fn run_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    debug!("scan loop started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let (state, config) = {
            let c = lock_control(&shared);
            (c.state, c.config.clone())
        };
        let Some(config) = config else { break };

        if state == SchedulerState::Running {
            run_cycle(&shared, &config).await;
        } else {
            debug!("paused; skipping cycle");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
    debug!("scan loop exited");
}

/// One full cycle: discovery, liveness update, then port probing of every host
/// seen in this cycle. Liveness is fully applied before any probe starts.
async fn run_cycle(shared: &Arc<Shared>, config: &ScannerConfig) {
    let sightings = shared
        .discovery
        .discover_sightings(config.network, config.timeout)
        .await;
    let live = shared
        .registry
        .apply_discovery(&sightings, OffsetDateTime::now_utc(), config.liveness_window())
        .await;
    info!(network = %config.network, live = live.len(), "discovery cycle complete");

    let port_phase = probe_live_hosts(shared, config, &live);
    match config.cycle_deadline {
        Some(deadline) => {
            if tokio::time::timeout(deadline, port_phase).await.is_err() {
                warn!(?deadline, "port phase exceeded cycle deadline; abandoning remaining probes");
                shared.registry.abandon_port_scans(&live).await;
            }
        }
        None => port_phase.await,
    }
}

async fn probe_live_hosts(shared: &Arc<Shared>, config: &ScannerConfig, live: &[String]) {
    let ports = Arc::new(config.ports());
    let mut set = JoinSet::new();
    for ip in live {
        let addr: Ipv4Addr = match ip.parse() {
            Ok(a) => a,
            Err(_) => continue,
        };
        let shared = shared.clone();
        let ports = ports.clone();
        let ip = ip.clone();
        let timeout = config.timeout;
        set.spawn(async move {
            shared.registry.begin_port_scan(&ip).await;
            let found = shared.prober.scan_host(addr, &ports, timeout).await;
            shared.registry.finish_port_scan(&ip, &found).await;
        });
    }
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "host probe task failed");
        }
    }
}
