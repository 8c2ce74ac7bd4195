use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Vendor string used whenever a MAC cannot be resolved.
pub const UNKNOWN_VENDOR: &str = "Unknown";

/// Legacy banner text returned when neither read produced any bytes.
pub const NO_BANNER_TEXT: &str = "No banner received.";

/// Liveness of a host as tracked by the registry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Online,
    Offline,
}

/// One known host. Keyed by `ip` in the registry and the store.
///
/// `open_ports` is a ledger of every port ever observed open: merges only add
/// ports, a later scan that misses a port does not remove it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub ip: String,
    pub mac: String,
    pub vendor: String,
    pub hostname: String,
    pub dns_name: String,
    pub is_dhcp: bool,
    pub open_ports: BTreeSet<u16>,
    pub status: HostStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub port_scan_in_progress: bool,
}

impl Host {
    /// A freshly created record with defaults for every optional field.
    pub fn new(ip: impl Into<String>, mac: impl Into<String>, last_seen: OffsetDateTime) -> Self {
        Self {
            ip: ip.into(),
            mac: mac.into(),
            vendor: UNKNOWN_VENDOR.to_string(),
            hostname: String::new(),
            dns_name: String::new(),
            is_dhcp: false,
            open_ports: BTreeSet::new(),
            status: HostStatus::Offline,
            last_seen,
            port_scan_in_progress: false,
        }
    }
}

/// A raw ARP reply as collected by the link-layer transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpReply {
    pub ip: Ipv4Addr,
    pub mac: String,
}

/// A discovery sighting after vendor resolution, ready to be applied to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub ip: String,
    pub mac: String,
    pub vendor: String,
}

/// Result of a banner grab.
///
/// Distinguishes data from failure; `legacy_text` flattens it back into the
/// single string older clients expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BannerOutcome {
    Banner(String),
    NoBanner,
    Timeout,
    ConnectionError(String),
}

impl BannerOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            BannerOutcome::Banner(_) => "ok",
            BannerOutcome::NoBanner => "no_banner",
            BannerOutcome::Timeout => "timeout",
            BannerOutcome::ConnectionError(_) => "error",
        }
    }

    /// Error text and banner text share one field here, as the control surface always returned them.
    pub fn legacy_text(&self) -> String {
        match self {
            BannerOutcome::Banner(b) => b.clone(),
            BannerOutcome::NoBanner => NO_BANNER_TEXT.to_string(),
            BannerOutcome::Timeout => "timed out".to_string(),
            BannerOutcome::ConnectionError(msg) => msg.clone(),
        }
    }
}

/// Which ports an on-demand scan covers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PortScanType {
    #[default]
    Popular,
    Range,
    All,
}

/// Out-of-band notifications pushed to connected listeners.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ScanEvent {
    ScanUpdate(std::collections::BTreeMap<String, Host>),
    PortScanResult { host: String, open_ports: Vec<u16> },
}
