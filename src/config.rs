use std::time::Duration;

use ipnet::Ipv4Net;
use serde::Serialize;

use crate::error::{LanWatchError, Result};
use crate::ports;

pub const DEFAULT_PORT_START: u32 = 1;
pub const DEFAULT_PORT_END: u32 = 1024;
pub const DEFAULT_TIMEOUT_SECS: u64 = 2;
pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_CONCURRENT_PROBES: usize = 512;

/// Settings for the periodic scan loop. Replaced wholesale on every `start`.
#[derive(Debug, Clone, Serialize)]
pub struct ScannerConfig {
    pub network: Ipv4Net,
    pub port_start: u16,
    pub port_end: u16,
    /// Per-probe wait for ARP replies and SYN answers.
    pub timeout: Duration,
    /// Sleep between cycles.
    pub interval: Duration,
    /// Upper bound on port-phase duration of one cycle. `None` means unbounded.
    pub cycle_deadline: Option<Duration>,
}

impl ScannerConfig {
    pub fn new(
        network: Ipv4Net,
        port_start: u32,
        port_end: u32,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Self> {
        // Validates bounds and ordering.
        ports::port_range(port_start, port_end)?;
        if interval.is_zero() {
            return Err(LanWatchError::Validation("interval must be positive".into()));
        }
        Ok(Self {
            network,
            port_start: port_start as u16,
            port_end: port_end as u16,
            timeout,
            interval,
            cycle_deadline: None,
        })
    }

    pub fn with_cycle_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.cycle_deadline = deadline;
        self
    }

    pub fn ports(&self) -> Vec<u16> {
        (self.port_start..=self.port_end).collect()
    }

    /// Grace period before an unseen host goes Offline: 1.5 x interval.
    pub fn liveness_window(&self) -> Duration {
        self.interval.mul_f64(1.5)
    }
}
