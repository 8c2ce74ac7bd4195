//! Raw packet seams.
//!
//! The scan engine only needs two capabilities from the link/IP layer: an ARP
//! sweep over a CIDR and a single SYN exchange. Both are traits so the engine
//! can be driven by mocks; the pnet-backed implementations need raw-socket
//! privileges (root or `CAP_NET_RAW`).

use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use pnet::datalink::{self, Channel, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags};
use pnet::packet::Packet;
use pnet::transport::{
    tcp_packet_iter, transport_channel, TransportChannelType::Layer4, TransportProtocol::Ipv4,
};
use pnet::util::MacAddr;
use rand::Rng;
use tracing::debug;

use crate::netdetect;
use crate::types::ArpReply;

/// TCP flag byte of a SYN-ACK.
pub const SYN_ACK: u8 = 0x12;

/// The answer to a SYN, with what is needed to tear the half-open connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynReply {
    pub flags: u8,
    /// Source port the SYN was sent from.
    pub local_port: u16,
    /// Acknowledgement number carried by the reply; becomes the RST sequence number.
    pub ack: u32,
}

#[async_trait]
pub trait ArpTransport: Send + Sync {
    /// Broadcast ARP requests for every address in `network` and collect the
    /// replies that arrive within `timeout`.
    async fn sweep(&self, network: Ipv4Net, timeout: Duration) -> io::Result<Vec<ArpReply>>;
}

#[async_trait]
pub trait SynTransport: Send + Sync {
    /// Send one SYN and wait up to `timeout` for a matching reply.
    async fn send_syn(
        &self,
        target: Ipv4Addr,
        port: u16,
        timeout: Duration,
    ) -> io::Result<Option<SynReply>>;

    /// Reset the half-open connection created by `reply`.
    async fn send_rst(&self, target: Ipv4Addr, port: u16, reply: SynReply) -> io::Result<()>;
}

/// ARP sweeps over a pnet datalink channel on the interface that owns the network.
#[derive(Debug, Default, Clone)]
pub struct PnetArpTransport;

#[async_trait]
impl ArpTransport for PnetArpTransport {
    async fn sweep(&self, network: Ipv4Net, timeout: Duration) -> io::Result<Vec<ArpReply>> {
        tokio::task::spawn_blocking(move || arp_sweep_blocking(network, timeout))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

fn interface_for(network: Ipv4Net) -> io::Result<(NetworkInterface, Ipv4Addr, MacAddr)> {
    for iface in datalink::interfaces() {
        if iface.is_loopback() || !iface.is_up() {
            continue;
        }
        let Some(mac) = iface.mac else { continue };
        let src = iface.ips.iter().find_map(|ip| match ip.ip() {
            IpAddr::V4(v4) if network.contains(&v4) => Some(v4),
            _ => None,
        });
        if let Some(src) = src {
            return Ok((iface, src, mac));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no interface with an address in {network}"),
    ))
}

fn arp_sweep_blocking(network: Ipv4Net, timeout: Duration) -> io::Result<Vec<ArpReply>> {
    let (iface, src_ip, src_mac) = interface_for(network)?;
    let config = datalink::Config {
        read_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let (mut tx, mut rx) = match datalink::channel(&iface, config)? {
        Channel::Ethernet(tx, rx) => (tx, rx),
        _ => return Err(io::Error::new(io::ErrorKind::Unsupported, "unknown channel type")),
    };

    let targets = netdetect::sweep_targets(network);
    debug!(interface = %iface.name, targets = targets.len(), "sending ARP requests");
    for target in &targets {
        let frame = build_arp_request(src_mac, src_ip, *target);
        if let Some(Err(e)) = tx.send_to(&frame, None) {
            return Err(e);
        }
    }

    let mut replies: Vec<ArpReply> = Vec::new();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let frame = match rx.next() {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e),
        };
        let Some(eth) = EthernetPacket::new(frame) else { continue };
        if eth.get_ethertype() != EtherTypes::Arp {
            continue;
        }
        let Some(arp) = ArpPacket::new(eth.payload()) else { continue };
        if arp.get_operation() != ArpOperations::Reply {
            continue;
        }
        let ip = arp.get_sender_proto_addr();
        if !network.contains(&ip) || replies.iter().any(|r| r.ip == ip) {
            continue;
        }
        replies.push(ArpReply {
            ip,
            mac: arp.get_sender_hw_addr().to_string(),
        });
    }
    Ok(replies)
}

fn build_arp_request(src_mac: MacAddr, src_ip: Ipv4Addr, target: Ipv4Addr) -> [u8; 42] {
    let mut frame = [0u8; 42];
    let mut arp_buf = [0u8; 28];
    if let Some(mut arp) = MutableArpPacket::new(&mut arp_buf) {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(src_mac);
        arp.set_sender_proto_addr(src_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target);
    }
    if let Some(mut eth) = MutableEthernetPacket::new(&mut frame) {
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(src_mac);
        eth.set_ethertype(EtherTypes::Arp);
        eth.set_payload(&arp_buf);
    }
    frame
}

/// Half-open TCP probes over a layer-4 raw socket.
#[derive(Debug, Default, Clone)]
pub struct PnetSynTransport;

#[async_trait]
impl SynTransport for PnetSynTransport {
    async fn send_syn(
        &self,
        target: Ipv4Addr,
        port: u16,
        timeout: Duration,
    ) -> io::Result<Option<SynReply>> {
        tokio::task::spawn_blocking(move || syn_exchange(target, port, timeout))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    async fn send_rst(&self, target: Ipv4Addr, port: u16, reply: SynReply) -> io::Result<()> {
        tokio::task::spawn_blocking(move || {
            let src = source_ip_for(target)?;
            let (mut tx, _rx) = transport_channel(4096, Layer4(Ipv4(IpNextHeaderProtocols::Tcp)))?;
            let mut buf = [0u8; 20];
            let pkt = build_tcp(&mut buf, src, target, reply.local_port, port, reply.ack, 0, TcpFlags::RST)?;
            tx.send_to(pkt, IpAddr::V4(target)).map(|_| ())
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

/// Source address the routing table picks for `target` (UDP connect, nothing is sent).
fn source_ip_for(target: Ipv4Addr) -> io::Result<Ipv4Addr> {
    let sock = UdpSocket::bind("0.0.0.0:0")?;
    sock.connect((target, 80))?;
    match sock.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "expected IPv4 source")),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_tcp(
    buf: &mut [u8; 20],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
) -> io::Result<MutableTcpPacket<'_>> {
    let mut pkt = MutableTcpPacket::new(buf)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "tcp buffer too small"))?;
    pkt.set_source(src_port);
    pkt.set_destination(dst_port);
    pkt.set_sequence(seq);
    pkt.set_acknowledgement(ack);
    pkt.set_data_offset(5);
    pkt.set_flags(flags);
    pkt.set_window(64240);
    let checksum = tcp::ipv4_checksum(&pkt.to_immutable(), &src, &dst);
    pkt.set_checksum(checksum);
    Ok(pkt)
}

fn syn_exchange(target: Ipv4Addr, port: u16, timeout: Duration) -> io::Result<Option<SynReply>> {
    let src = source_ip_for(target)?;
    let (mut tx, mut rx) = transport_channel(4096, Layer4(Ipv4(IpNextHeaderProtocols::Tcp)))?;
    let local_port: u16 = rand::thread_rng().gen_range(40000..61000);
    let seq: u32 = rand::random();

    let mut buf = [0u8; 20];
    let pkt = build_tcp(&mut buf, src, target, local_port, port, seq, 0, TcpFlags::SYN)?;
    tx.send_to(pkt, IpAddr::V4(target))?;

    let mut iter = tcp_packet_iter(&mut rx);
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match iter.next_with_timeout(remaining)? {
            Some((reply, IpAddr::V4(from)))
                if from == target
                    && reply.get_source() == port
                    && reply.get_destination() == local_port =>
            {
                return Ok(Some(SynReply {
                    flags: reply.get_flags(),
                    local_port,
                    ack: reply.get_acknowledgement(),
                }));
            }
            Some(_) => continue,
            None => return Ok(None),
        }
    }
}
