use std::collections::BTreeSet;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, warn};

use crate::transport::{SynTransport, SYN_ACK};
use crate::types::BannerOutcome;

/// Ports whose banner exchange runs inside TLS.
pub const TLS_PORTS: &[u16] = &[443, 465, 993, 995, 990, 636, 8443];

const BANNER_BUF: usize = 1024;

/// Request sent when a service stays silent after connect.
pub fn banner_probe(host: &str, port: u16) -> Option<Vec<u8>> {
    match port {
        80 | 443 | 8443 => Some(format!("GET / HTTP/1.1\r\nHost: {host}\r\n\r\n").into_bytes()),
        21 | 110 | 995 | 143 | 993 | 636 | 990 => Some(b"\r\n".to_vec()),
        25 | 465 => Some(b"EHLO example.com\r\n".to_vec()),
        _ => None,
    }
}

/// Half-open port probing and banner capture.
///
/// All probes issued through one prober share a semaphore, so the total number
/// of outstanding SYNs never exceeds `max_concurrent`.
#[derive(Clone)]
pub struct PortProber {
    syn: Arc<dyn SynTransport>,
    permits: Arc<Semaphore>,
}

impl PortProber {
    pub fn new(syn: Arc<dyn SynTransport>, max_concurrent: usize) -> Self {
        Self {
            syn,
            permits: Arc::new(Semaphore::new(max_concurrent.clamp(1, 5_000))),
        }
    }

    /// One SYN, no retries. A SYN-ACK is answered with a RST before reporting open;
    /// anything else, silence, or a transport error counts as closed.
    pub async fn is_open(&self, host: Ipv4Addr, port: u16, timeout: Duration) -> bool {
        probe_port(self.syn.as_ref(), host, port, timeout).await
    }

    /// Probe every port and return the open ones once all probes have finished.
    pub async fn scan_host(&self, host: Ipv4Addr, ports: &[u16], timeout: Duration) -> BTreeSet<u16> {
        let mut set = JoinSet::new();
        for &port in ports {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let syn = self.syn.clone();
            set.spawn(async move {
                let _permit = permit;
                probe_port(syn.as_ref(), host, port, timeout).await.then_some(port)
            });
        }

        let mut open = BTreeSet::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok(Some(port)) => {
                    open.insert(port);
                }
                Ok(None) => {}
                Err(e) => warn!(%host, error = %e, "probe task failed"),
            }
        }
        debug!(%host, scanned = ports.len(), open = open.len(), "host scan finished");
        open
    }
}

async fn probe_port(syn: &dyn SynTransport, host: Ipv4Addr, port: u16, timeout: Duration) -> bool {
    let reply = match syn.send_syn(host, port, timeout).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return false,
        Err(e) => {
            debug!(%host, port, error = %e, "SYN send failed");
            return false;
        }
    };
    if reply.flags != SYN_ACK {
        return false;
    }
    if let Err(e) = syn.send_rst(host, port, reply).await {
        debug!(%host, port, error = %e, "RST send failed");
    }
    true
}

/// Connect to `host:port` (TLS on [`TLS_PORTS`], certificates unchecked) and capture a banner.
pub async fn grab_banner(host: &str, port: u16, timeout: Duration) -> BannerOutcome {
    let tcp = match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return BannerOutcome::ConnectionError(e.to_string()),
        Err(_) => return BannerOutcome::Timeout,
    };

    if !TLS_PORTS.contains(&port) {
        return exchange_banner(tcp, host, port, timeout).await;
    }

    let connector = match native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
    {
        Ok(c) => tokio_native_tls::TlsConnector::from(c),
        Err(e) => return BannerOutcome::ConnectionError(e.to_string()),
    };
    match time::timeout(timeout, connector.connect(host, tcp)).await {
        Ok(Ok(tls)) => exchange_banner(tls, host, port, timeout).await,
        Ok(Err(e)) => BannerOutcome::ConnectionError(e.to_string()),
        Err(_) => BannerOutcome::Timeout,
    }
}

/// Passive read first; if the peer says nothing, send the port's probe and read once more.
pub async fn exchange_banner<S>(mut stream: S, host: &str, port: u16, timeout: Duration) -> BannerOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_some(&mut stream, timeout).await {
        Ok(Some(text)) => return BannerOutcome::Banner(text),
        Ok(None) => {}
        Err(e) => return BannerOutcome::ConnectionError(e.to_string()),
    }

    if let Some(probe) = banner_probe(host, port) {
        if let Err(e) = stream.write_all(&probe).await {
            return BannerOutcome::ConnectionError(e.to_string());
        }
        let _ = stream.flush().await;
    }

    match read_some(&mut stream, timeout).await {
        Ok(Some(text)) => BannerOutcome::Banner(text),
        Ok(None) => BannerOutcome::NoBanner,
        Err(e) => BannerOutcome::ConnectionError(e.to_string()),
    }
}

/// A read timeout or EOF is "nothing received", not an error.
async fn read_some<S>(stream: &mut S, timeout: Duration) -> io::Result<Option<String>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; BANNER_BUF];
    match time::timeout(timeout, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Err(_) => Ok(None),
        Ok(Ok(n)) => {
            let text = decode_dropping_invalid(&buf[..n]);
            Ok((!text.is_empty()).then_some(text))
        }
        Ok(Err(e)) => Err(e),
    }
}

/// UTF-8 decode that drops invalid sequences instead of substituting U+FFFD.
fn decode_dropping_invalid(bytes: &[u8]) -> String {
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}
