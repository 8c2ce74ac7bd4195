//! Host discovery and MAC vendor resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::transport::ArpTransport;
use crate::types::{ArpReply, Sighting, UNKNOWN_VENDOR};

#[derive(Error, Debug)]
pub enum VendorLookupError {
    #[error("vendor lookup request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vendor lookup returned status {0}")]
    Status(u16),

    #[error("vendor lookup returned an empty body")]
    Empty,
}

/// An external source of MAC-to-vendor names.
#[async_trait]
pub trait VendorLookup: Send + Sync {
    async fn lookup(&self, mac: &str) -> Result<String, VendorLookupError>;
}

/// `GET {base_url}/{mac}` returning the vendor name as plain text (macvendors.com style).
#[derive(Debug, Clone)]
pub struct HttpVendorLookup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVendorLookup {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, VendorLookupError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl VendorLookup for HttpVendorLookup {
    async fn lookup(&self, mac: &str) -> Result<String, VendorLookupError> {
        let url = format!("{}/{}", self.base_url, mac);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if status.as_u16() != 200 {
            return Err(VendorLookupError::Status(status.as_u16()));
        }
        let body = resp.text().await?;
        let vendor = body.trim();
        if vendor.is_empty() {
            return Err(VendorLookupError::Empty);
        }
        Ok(vendor.to_string())
    }
}

#[derive(Debug, Clone)]
struct CachedVendor {
    vendor: String,
    negative: bool,
    cached_at: Instant,
}

/// Per-process memo of vendor names.
///
/// Failed lookups are cached as `"Unknown"` too, so a MAC is looked up at most
/// once unless the entry is refreshed or, when `negative_ttl` is set, a
/// negative entry has aged out. The map lock is never held across a lookup;
/// callers racing on one MAC await the same in-flight cell instead.
#[derive(Clone)]
pub struct VendorResolver {
    lookup: Arc<dyn VendorLookup>,
    cache: Arc<Mutex<HashMap<String, Arc<OnceCell<CachedVendor>>>>>,
    negative_ttl: Option<Duration>,
}

impl VendorResolver {
    pub fn new(lookup: Arc<dyn VendorLookup>) -> Self {
        Self {
            lookup,
            cache: Arc::new(Mutex::new(HashMap::new())),
            negative_ttl: None,
        }
    }

    pub fn with_negative_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.negative_ttl = ttl;
        self
    }

    fn expired(&self, hit: &CachedVendor) -> bool {
        hit.negative
            && self
                .negative_ttl
                .is_some_and(|ttl| hit.cached_at.elapsed() >= ttl)
    }

    pub async fn vendor_of(&self, mac: &str) -> String {
        let key = mac.trim().to_ascii_lowercase();
        let cell = {
            let mut cache = self.cache.lock().await;
            let slot = cache.entry(key.clone()).or_default();
            if let Some(hit) = slot.get() {
                if !self.expired(hit) {
                    return hit.vendor.clone();
                }
                *slot = Arc::new(OnceCell::new());
            }
            slot.clone()
        };

        let entry = cell
            .get_or_init(|| async {
                let (vendor, negative) = match self.lookup.lookup(&key).await {
                    Ok(v) => (v, false),
                    Err(e) => {
                        debug!(mac = %key, error = %e, "vendor lookup failed");
                        (UNKNOWN_VENDOR.to_string(), true)
                    }
                };
                CachedVendor {
                    vendor,
                    negative,
                    cached_at: Instant::now(),
                }
            })
            .await;
        entry.vendor.clone()
    }

    /// Re-resolve a MAC whose cached answer is a failure; positive answers are kept.
    pub async fn refresh(&self, mac: &str) -> String {
        let key = mac.trim().to_ascii_lowercase();
        {
            let mut cache = self.cache.lock().await;
            if cache
                .get(&key)
                .and_then(|cell| cell.get())
                .is_some_and(|c| c.negative)
            {
                cache.remove(&key);
            }
        }
        self.vendor_of(&key).await
    }
}

/// One ARP sweep plus vendor resolution.
pub struct Discovery {
    arp: Arc<dyn ArpTransport>,
    vendors: VendorResolver,
}

impl Discovery {
    pub fn new(arp: Arc<dyn ArpTransport>, vendors: VendorResolver) -> Self {
        Self { arp, vendors }
    }

    pub fn vendors(&self) -> &VendorResolver {
        &self.vendors
    }

    /// Sweep `network`. Transport failures are logged and yield an empty list,
    /// so an empty result does not necessarily mean the segment is empty.
    pub async fn discover(&self, network: Ipv4Net, timeout: Duration) -> Vec<ArpReply> {
        match self.arp.sweep(network, timeout).await {
            Ok(replies) => replies,
            Err(e) => {
                warn!(%network, error = %e, "ARP sweep failed; treating as empty");
                Vec::new()
            }
        }
    }

    /// Sweep and attach vendor names. Vendors are resolved concurrently, so the
    /// extra time over the sweep is bounded by the slowest single lookup.
    pub async fn discover_sightings(&self, network: Ipv4Net, timeout: Duration) -> Vec<Sighting> {
        let replies = self.discover(network, timeout).await;
        let mut set = JoinSet::new();
        for (idx, reply) in replies.into_iter().enumerate() {
            let vendors = self.vendors.clone();
            set.spawn(async move {
                let vendor = vendors.vendor_of(&reply.mac).await;
                let sighting = Sighting {
                    ip: reply.ip.to_string(),
                    mac: reply.mac,
                    vendor,
                };
                (idx, sighting)
            });
        }

        let mut out = Vec::with_capacity(set.len());
        while let Some(res) = set.join_next().await {
            match res {
                Ok(pair) => out.push(pair),
                Err(e) => warn!(error = %e, "vendor resolution task failed"),
            }
        }
        out.sort_by_key(|(idx, _)| *idx);
        out.into_iter().map(|(_, s)| s).collect()
    }
}
