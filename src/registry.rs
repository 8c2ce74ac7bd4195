//! The authoritative host map and its reconciliation with the store.
//!
//! Every mutation happens under one async mutex; the store write for that
//! mutation runs inside the same critical section, so a slow store slows the
//! scan loop down rather than letting memory and disk drift apart. No network
//! call is ever made while the lock is held.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{LanWatchError, Result};
use crate::store::{HostMetadata, HostRecord, HostStore};
use crate::types::{Host, HostStatus, Sighting};

/// Union of the two sets. Ports are never removed: the set records every port
/// ever seen open, not the live state of the host.
pub fn merge_ports(existing: &BTreeSet<u16>, incoming: &BTreeSet<u16>) -> BTreeSet<u16> {
    existing.union(incoming).copied().collect()
}

/// Status of a host that was not seen this cycle. Goes Offline only once the
/// liveness window has been exceeded; until then the previous status stands.
pub fn status_when_unseen(
    current: HostStatus,
    last_seen: OffsetDateTime,
    now: OffsetDateTime,
    window: Duration,
) -> HostStatus {
    let elapsed = now - last_seen;
    if elapsed > window {
        HostStatus::Offline
    } else {
        current
    }
}

pub struct HostRegistry {
    hosts: Mutex<HashMap<String, Host>>,
    store: Arc<dyn HostStore>,
}

impl HostRegistry {
    pub fn new(store: Arc<dyn HostStore>) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Load every persisted host into memory as Offline. Returns how many were loaded.
    pub async fn load_from_store(&self) -> Result<usize> {
        let records = self.store.load_all()?;
        let mut hosts = self.hosts.lock().await;
        let n = records.len();
        for rec in records {
            hosts.insert(rec.ip.clone(), host_from_record(rec));
        }
        info!(hosts = n, "loaded persisted hosts");
        Ok(n)
    }

    /// Apply one discovery cycle. Seen hosts become Online with fresh mac,
    /// vendor and last_seen (persisted immediately); unseen hosts go Offline
    /// once their liveness window has passed. Returns the IPs seen this cycle.
    pub async fn apply_discovery(
        &self,
        sightings: &[Sighting],
        now: OffsetDateTime,
        liveness_window: Duration,
    ) -> Vec<String> {
        let mut hosts = self.hosts.lock().await;
        let mut live = Vec::with_capacity(sightings.len());

        for s in sightings {
            let host = hosts
                .entry(s.ip.clone())
                .or_insert_with(|| Host::new(s.ip.clone(), s.mac.clone(), now));
            if host.status != HostStatus::Online {
                info!(ip = %s.ip, mac = %s.mac, "host online");
            }
            host.mac = s.mac.clone();
            host.vendor = s.vendor.clone();
            host.status = HostStatus::Online;
            host.last_seen = now;
            if let Err(e) = self.store.record_sighting(&s.ip, &s.mac, &s.vendor, now) {
                warn!(ip = %s.ip, error = %e, "failed to persist sighting");
            }
            if !live.contains(&s.ip) {
                live.push(s.ip.clone());
            }
        }

        for (ip, host) in hosts.iter_mut() {
            if live.contains(ip) {
                continue;
            }
            let next = status_when_unseen(host.status, host.last_seen, now, liveness_window);
            if next != host.status {
                info!(%ip, "host offline");
                host.status = next;
            }
        }
        live
    }

    /// Mark a port batch as running. Creates an Offline placeholder for unknown IPs.
    pub async fn begin_port_scan(&self, ip: &str) {
        let mut hosts = self.hosts.lock().await;
        hosts
            .entry(ip.to_string())
            .or_insert_with(|| Host::new(ip, "", OffsetDateTime::now_utc()))
            .port_scan_in_progress = true;
    }

    /// Merge a finished batch, persist if the set grew, and clear the in-progress flag.
    ///
    /// Memory only takes the merged set once the store has accepted it, so a
    /// failed write is retried by the next batch that reports the same ports.
    pub async fn finish_port_scan(&self, ip: &str, found: &BTreeSet<u16>) -> BTreeSet<u16> {
        let mut hosts = self.hosts.lock().await;
        let host = hosts
            .entry(ip.to_string())
            .or_insert_with(|| Host::new(ip, "", OffsetDateTime::now_utc()));
        let merged = merge_ports(&host.open_ports, found);
        if merged != host.open_ports {
            debug!(%ip, ports = ?merged, "open port set grew");
            match self.store.save_ports(ip, &merged) {
                Ok(()) => host.open_ports = merged.clone(),
                Err(e) => warn!(%ip, error = %e, "failed to persist ports; will retry on next merge"),
            }
        }
        host.port_scan_in_progress = false;
        merged
    }

    /// Clear in-progress flags without merging anything (used when a batch is abandoned).
    pub async fn abandon_port_scans(&self, ips: &[String]) {
        let mut hosts = self.hosts.lock().await;
        for ip in ips {
            if let Some(h) = hosts.get_mut(ip) {
                h.port_scan_in_progress = false;
            }
        }
    }

    /// Persist explicit metadata and mirror it in memory. Unseen IPs are created.
    pub async fn update_metadata(&self, ip: &str, meta: &HostMetadata) -> Result<Host> {
        let mut hosts = self.hosts.lock().await;
        let rec = self.store.update_metadata(ip, meta)?;
        let host = hosts
            .entry(ip.to_string())
            .or_insert_with(|| host_from_record(rec.clone()));
        host.hostname = rec.hostname;
        host.dns_name = rec.dns_name;
        host.is_dhcp = rec.is_dhcp;
        Ok(host.clone())
    }

    /// Current MAC for `ip`, from memory first, then the store.
    pub async fn mac_of(&self, ip: &str) -> Result<String> {
        {
            let hosts = self.hosts.lock().await;
            if let Some(h) = hosts.get(ip) {
                return Ok(h.mac.clone());
            }
        }
        match self.store.get(ip)? {
            Some(rec) => Ok(rec.mac),
            None => Err(LanWatchError::NotFound(format!("Host {ip} not found"))),
        }
    }

    pub async fn set_vendor(&self, ip: &str, vendor: &str) -> Result<()> {
        let mut hosts = self.hosts.lock().await;
        self.store.set_vendor(ip, vendor)?;
        if let Some(h) = hosts.get_mut(ip) {
            h.vendor = vendor.to_string();
        }
        Ok(())
    }

    pub async fn get(&self, ip: &str) -> Option<Host> {
        self.hosts.lock().await.get(ip).cloned()
    }

    /// Point-in-time copy of every host, ordered by IP string.
    pub async fn snapshot(&self) -> BTreeMap<String, Host> {
        let hosts = self.hosts.lock().await;
        hosts.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

fn host_from_record(rec: HostRecord) -> Host {
    Host {
        ip: rec.ip,
        mac: rec.mac,
        vendor: rec.vendor,
        hostname: rec.hostname,
        dns_name: rec.dns_name,
        is_dhcp: rec.is_dhcp,
        open_ports: rec.open_ports,
        status: HostStatus::Offline,
        last_seen: rec.last_seen,
        port_scan_in_progress: false,
    }
}
