mod common;

use std::collections::BTreeSet;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use common::{MockSyn, SynCall};
use lan_watch_rs::probe::{exchange_banner, grab_banner, PortProber};
use lan_watch_rs::transport::{SynReply, SynTransport};
use lan_watch_rs::types::{BannerOutcome, NO_BANNER_TEXT};

const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

#[tokio::test]
async fn scan_host_reports_syn_ack_ports_only() {
    let syn = Arc::new(MockSyn::new(&[22, 80]));
    let prober = PortProber::new(syn.clone(), 8);
    let open = prober.scan_host(HOST, &[22, 80, 81], Duration::from_secs(1)).await;
    assert_eq!(open, [22, 80].into_iter().collect::<BTreeSet<u16>>());
}

#[tokio::test]
async fn open_port_is_reset_before_reporting() {
    let syn = Arc::new(MockSyn::new(&[22]));
    let prober = PortProber::new(syn.clone(), 1);
    assert!(prober.is_open(HOST, 22, Duration::from_secs(1)).await);
    assert_eq!(syn.calls(), vec![SynCall::Syn(HOST, 22), SynCall::Rst(HOST, 22)]);
}

#[tokio::test]
async fn closed_port_gets_no_rst() {
    let syn = Arc::new(MockSyn::new(&[]));
    let prober = PortProber::new(syn.clone(), 1);
    assert!(!prober.is_open(HOST, 23, Duration::from_secs(1)).await);
    assert_eq!(syn.calls(), vec![SynCall::Syn(HOST, 23)]);
}

struct Broken;

#[async_trait]
impl SynTransport for Broken {
    async fn send_syn(&self, _: Ipv4Addr, _: u16, _: Duration) -> io::Result<Option<SynReply>> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "no raw sockets"))
    }

    async fn send_rst(&self, _: Ipv4Addr, _: u16, _: SynReply) -> io::Result<()> {
        unreachable!("never sent without a SYN-ACK")
    }
}

#[tokio::test]
async fn transport_errors_read_as_closed() {
    let prober = PortProber::new(Arc::new(Broken), 4);
    let open = prober.scan_host(HOST, &[22, 80], Duration::from_millis(10)).await;
    assert!(open.is_empty());
}

#[tokio::test]
async fn probe_ceiling_still_covers_every_port() {
    let syn = Arc::new(MockSyn::new(&[1, 50, 100]).with_delay(Duration::from_millis(5)));
    let prober = PortProber::new(syn.clone(), 2);
    let ports: Vec<u16> = (1..=100).collect();
    let open = prober.scan_host(HOST, &ports, Duration::from_secs(1)).await;
    assert_eq!(open, [1, 50, 100].into_iter().collect::<BTreeSet<u16>>());
    let syns = syn.calls().iter().filter(|c| matches!(c, SynCall::Syn(..))).count();
    assert_eq!(syns, 100);
}

#[tokio::test]
async fn silent_http_service_gets_a_get_request() {
    let (client, mut server) = tokio::io::duplex(4096);
    let expected = b"GET / HTTP/1.1\r\nHost: 10.0.0.5\r\n\r\n";
    let peer = tokio::spawn(async move {
        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        server.write_all(b"HTTP/1.1 200 OK\r\nServer: test\r\n\r\n").await.unwrap();
        (buf, server)
    });

    let outcome = exchange_banner(client, "10.0.0.5", 80, Duration::from_millis(200)).await;
    let (request, _server) = peer.await.unwrap();
    assert_eq!(request, expected.to_vec());
    assert_eq!(outcome, BannerOutcome::Banner("HTTP/1.1 200 OK\r\nServer: test\r\n\r\n".into()));
}

#[tokio::test]
async fn passive_banner_needs_no_probe() {
    let (client, mut server) = tokio::io::duplex(4096);
    server.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
    let outcome = exchange_banner(client, "10.0.0.5", 22, Duration::from_millis(200)).await;
    assert_eq!(outcome, BannerOutcome::Banner("SSH-2.0-OpenSSH_9.6\r\n".into()));
}

#[tokio::test]
async fn silence_yields_no_banner_text() {
    let (client, _server) = tokio::io::duplex(4096);
    let outcome = exchange_banner(client, "10.0.0.5", 22, Duration::from_millis(50)).await;
    assert_eq!(outcome, BannerOutcome::NoBanner);
    assert_eq!(outcome.legacy_text(), NO_BANNER_TEXT);
}

#[tokio::test]
async fn tcp_banner_from_live_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(b"220 ftp ready\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });
    let outcome = grab_banner("127.0.0.1", port, Duration::from_secs(1)).await;
    assert_eq!(outcome, BannerOutcome::Banner("220 ftp ready\r\n".into()));
}

#[tokio::test]
async fn refused_connection_becomes_error_text() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let outcome = grab_banner("127.0.0.1", port, Duration::from_secs(1)).await;
    assert!(matches!(outcome, BannerOutcome::ConnectionError(_)));
    assert_eq!(outcome.status(), "error");
    assert!(!outcome.legacy_text().is_empty());
}
