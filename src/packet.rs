//! Unified packet representation
//!
//! A flat, owned record of one captured packet with everything the flow
//! table and rule engine need: timestamp, 5-tuple, TCP flags, window,
//! header length and payload bytes.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::{Deserialize, Serialize};

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(v) => v,
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Icmpv6 => write!(f, "ICMPv6"),
            IpProtocol::Other(n) => write!(f, "Proto({})", n),
        }
    }
}

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
        }
    }

    pub fn to_u8(self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        if self.ece { flags |= 0x40; }
        if self.cwr { flags |= 0x80; }
        flags
    }

    /// Bare SYN (connection initiation)
    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// One captured packet, owned and ready for analysis
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp
    pub ts: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: IpProtocol,
    /// Full frame length in bytes
    pub length: u32,
    /// Transport header length in bytes
    pub header_len: u32,
    /// TCP flags (None for non-TCP)
    pub tcp_flags: Option<TcpFlags>,
    /// TCP window size (None for non-TCP)
    pub window: Option<u16>,
    /// Application payload (may be empty)
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a minimal packet for a protocol with no transport detail.
    pub fn new(ts: DateTime<Utc>, src_ip: IpAddr, dst_ip: IpAddr, protocol: IpProtocol) -> Self {
        Self {
            ts,
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            protocol,
            length: 0,
            header_len: 0,
            tcp_flags: None,
            window: None,
            payload: Vec::new(),
        }
    }

    pub fn flags(&self) -> TcpFlags {
        self.tcp_flags.unwrap_or_default()
    }

    pub fn payload_len(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Parse an Ethernet frame into a packet. Returns None for anything
    /// that is not IPv4/IPv6 over TCP/UDP/ICMP or fails to parse.
    pub fn from_ethernet(ts: DateTime<Utc>, data: &[u8]) -> Option<Self> {
        let sliced = SlicedPacket::from_ethernet(data).ok()?;
        Self::from_sliced(ts, data.len() as u32, sliced)
    }

    /// Parse a raw IP packet (no link layer).
    pub fn from_ip(ts: DateTime<Utc>, data: &[u8]) -> Option<Self> {
        let sliced = SlicedPacket::from_ip(data).ok()?;
        Self::from_sliced(ts, data.len() as u32, sliced)
    }

    fn from_sliced(ts: DateTime<Utc>, length: u32, sliced: SlicedPacket<'_>) -> Option<Self> {
        let (src_ip, dst_ip) = match sliced.net.as_ref()? {
            NetSlice::Ipv4(ipv4) => (
                IpAddr::from(ipv4.header().source_addr()),
                IpAddr::from(ipv4.header().destination_addr()),
            ),
            NetSlice::Ipv6(ipv6) => (
                IpAddr::from(ipv6.header().source_addr()),
                IpAddr::from(ipv6.header().destination_addr()),
            ),
            _ => return None, // ARP, etc.
        };

        let mut pkt = Self::new(ts, src_ip, dst_ip, IpProtocol::Other(0));
        pkt.length = length;

        match sliced.transport.as_ref()? {
            TransportSlice::Tcp(tcp) => {
                pkt.protocol = IpProtocol::Tcp;
                pkt.src_port = tcp.source_port();
                pkt.dst_port = tcp.destination_port();
                pkt.header_len = tcp.header_len() as u32;
                pkt.window = Some(tcp.window_size());
                pkt.tcp_flags = Some(TcpFlags {
                    fin: tcp.fin(),
                    syn: tcp.syn(),
                    rst: tcp.rst(),
                    psh: tcp.psh(),
                    ack: tcp.ack(),
                    urg: tcp.urg(),
                    ece: tcp.ece(),
                    cwr: tcp.cwr(),
                });
                pkt.payload = tcp.payload().to_vec();
            }
            TransportSlice::Udp(udp) => {
                pkt.protocol = IpProtocol::Udp;
                pkt.src_port = udp.source_port();
                pkt.dst_port = udp.destination_port();
                pkt.header_len = 8;
                pkt.payload = udp.payload().to_vec();
            }
            TransportSlice::Icmpv4(_) => {
                pkt.protocol = IpProtocol::Icmp;
                pkt.header_len = 8;
            }
            TransportSlice::Icmpv6(_) => {
                pkt.protocol = IpProtocol::Icmpv6;
                pkt.header_len = 8;
            }
            #[allow(unreachable_patterns)]
            _ => return None,
        }

        Some(pkt)
    }
}
