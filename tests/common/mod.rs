#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::sync::broadcast;

use lan_watch_rs::discovery::{Discovery, VendorLookup, VendorLookupError, VendorResolver};
use lan_watch_rs::probe::PortProber;
use lan_watch_rs::registry::HostRegistry;
use lan_watch_rs::scheduler::ScanScheduler;
use lan_watch_rs::store::SqliteStore;
use lan_watch_rs::transport::{ArpTransport, SynReply, SynTransport, SYN_ACK};
use lan_watch_rs::types::{ArpReply, ScanEvent};

/// Transport call as observed by [`MockSyn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynCall {
    Syn(Ipv4Addr, u16),
    Rst(Ipv4Addr, u16),
}

/// Answers SYN-ACK for `open` ports and RST-ACK for everything else.
pub struct MockSyn {
    pub open: HashSet<u16>,
    pub calls: Mutex<Vec<SynCall>>,
    pub delay: Duration,
}

impl MockSyn {
    pub fn new(open: &[u16]) -> Self {
        Self {
            open: open.iter().copied().collect(),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<SynCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SynTransport for MockSyn {
    async fn send_syn(&self, target: Ipv4Addr, port: u16, _timeout: Duration) -> io::Result<Option<SynReply>> {
        self.calls.lock().unwrap().push(SynCall::Syn(target, port));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let flags = if self.open.contains(&port) { SYN_ACK } else { 0x14 };
        Ok(Some(SynReply { flags, local_port: 40_000, ack: 1 }))
    }

    async fn send_rst(&self, target: Ipv4Addr, port: u16, _reply: SynReply) -> io::Result<()> {
        self.calls.lock().unwrap().push(SynCall::Rst(target, port));
        Ok(())
    }
}

/// Returns a scripted list of replies and counts sweeps.
pub struct MockArp {
    pub replies: Mutex<Vec<ArpReply>>,
    pub sweeps: AtomicUsize,
    pub fail: bool,
}

impl MockArp {
    pub fn new(replies: Vec<ArpReply>) -> Self {
        Self { replies: Mutex::new(replies), sweeps: AtomicUsize::new(0), fail: false }
    }

    pub fn failing() -> Self {
        Self { replies: Mutex::new(Vec::new()), sweeps: AtomicUsize::new(0), fail: true }
    }

    pub fn set_replies(&self, replies: Vec<ArpReply>) {
        *self.replies.lock().unwrap() = replies;
    }

    pub fn sweeps(&self) -> usize {
        self.sweeps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArpTransport for MockArp {
    async fn sweep(&self, _network: Ipv4Net, _timeout: Duration) -> io::Result<Vec<ArpReply>> {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "raw socket denied"));
        }
        Ok(self.replies.lock().unwrap().clone())
    }
}

pub struct FixedVendor(pub &'static str);

#[async_trait]
impl VendorLookup for FixedVendor {
    async fn lookup(&self, _mac: &str) -> Result<String, VendorLookupError> {
        Ok(self.0.to_string())
    }
}

pub fn reply(ip: &str, mac: &str) -> ArpReply {
    ArpReply { ip: ip.parse().unwrap(), mac: mac.to_string() }
}

pub struct Harness {
    pub scheduler: ScanScheduler,
    pub registry: Arc<HostRegistry>,
    pub store: Arc<SqliteStore>,
    pub arp: Arc<MockArp>,
    pub syn: Arc<MockSyn>,
    pub events: broadcast::Sender<ScanEvent>,
}

pub fn harness(arp: MockArp, syn: MockSyn) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let registry = Arc::new(HostRegistry::new(store.clone()));
    let arp = Arc::new(arp);
    let syn = Arc::new(syn);
    let discovery = Arc::new(Discovery::new(
        arp.clone(),
        VendorResolver::new(Arc::new(FixedVendor("Acme Networks"))),
    ));
    let prober = PortProber::new(syn.clone(), 64);
    let (events, _) = broadcast::channel(64);
    let scheduler = ScanScheduler::new(registry.clone(), discovery, prober, events.clone());
    Harness { scheduler, registry, store, arp, syn, events }
}

/// Poll `cond` every 10ms for up to 2s.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
