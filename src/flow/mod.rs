//! Flow reconstruction
//!
//! Tracks bidirectional TCP/UDP/ICMP flows and accumulates the running
//! statistics the feature extractor needs: per-direction packet/byte/length
//! stats, inter-arrival times, flag counters, bulk-transfer runs and
//! active/idle segmentation.
//!
//! A flow's forward direction is fixed by its first packet. Closure happens
//! on FIN in both directions, on RST, or when the table's inactivity sweep
//! expires it. A closed flow is finalized exactly once and never touched
//! again.

pub mod table;

pub use table::{FlowTable, TableStats};

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::packet::{IpProtocol, Packet};

/// Seconds between two timestamps as a float (never negative).
pub(crate) fn secs_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let micros = (later - earlier).num_microseconds().unwrap_or(0);
    if micros <= 0 {
        0.0
    } else {
        micros as f64 / 1_000_000.0
    }
}

/// Unique key identifying a flow (5-tuple, direction-independent)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub ip_a: IpAddr,
    pub ip_b: IpAddr,
    pub port_a: u16,
    pub port_b: u16,
    pub protocol: IpProtocol,
}

impl FlowKey {
    /// Create from packet, normalized so the smaller (IP, port) pair is
    /// always first. Both directions of a connection map to the same key.
    pub fn from_packet(pkt: &Packet) -> Self {
        if (pkt.src_ip, pkt.src_port) <= (pkt.dst_ip, pkt.dst_port) {
            Self {
                ip_a: pkt.src_ip,
                ip_b: pkt.dst_ip,
                port_a: pkt.src_port,
                port_b: pkt.dst_port,
                protocol: pkt.protocol,
            }
        } else {
            Self {
                ip_a: pkt.dst_ip,
                ip_b: pkt.src_ip,
                port_a: pkt.dst_port,
                port_b: pkt.src_port,
                protocol: pkt.protocol,
            }
        }
    }
}

/// Packet direction relative to the flow's first packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Forward,
    Backward,
}

/// Flow lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    /// Receiving packets
    Active,
    /// FIN seen in one direction
    Closing,
    /// FIN both directions, RST, or expired
    Closed,
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowState::Active => write!(f, "ACTIVE"),
            FlowState::Closing => write!(f, "CLOSING"),
            FlowState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Why a flow closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// FIN observed in both directions
    FinExchange,
    /// RST observed
    Reset,
    /// Inactivity timeout
    Timeout,
    /// Evicted to make room in a full table
    Evicted,
}

/// Online mean/variance accumulator with min/max tracking.
///
/// Population statistics: an empty accumulator reports 0 for everything.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            if value < self.min { self.min = value; }
            if value > self.max { self.max = value; }
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.mean }
    }

    pub fn variance(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.m2 / self.count as f64 }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.min }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.max }
    }

    pub fn total(&self) -> f64 {
        self.mean() * self.count as f64
    }
}

/// Bulk-transfer run accumulator for one direction.
///
/// A bulk run is a maximal consecutive sequence of payload-carrying packets
/// in one direction. Runs shorter than the configured minimum are discarded
/// when finalized.
#[derive(Debug, Clone, Default)]
pub struct BulkState {
    cur_packets: u64,
    cur_bytes: u64,
    cur_start: Option<DateTime<Utc>>,
    cur_last: Option<DateTime<Utc>>,
    runs: u32,
    total_packets: u64,
    total_bytes: u64,
    total_duration_secs: f64,
}

impl BulkState {
    fn push(&mut self, ts: DateTime<Utc>, payload_len: u32) {
        if self.cur_packets == 0 {
            self.cur_start = Some(ts);
        }
        self.cur_packets += 1;
        self.cur_bytes += payload_len as u64;
        self.cur_last = Some(ts);
    }

    fn finalize(&mut self, min_packets: u32) {
        if self.cur_packets >= min_packets as u64 {
            self.runs += 1;
            self.total_packets += self.cur_packets;
            self.total_bytes += self.cur_bytes;
            if let (Some(start), Some(last)) = (self.cur_start, self.cur_last) {
                self.total_duration_secs += secs_between(start, last);
            }
        }
        self.cur_packets = 0;
        self.cur_bytes = 0;
        self.cur_start = None;
        self.cur_last = None;
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn avg_bytes(&self) -> f64 {
        if self.runs == 0 { 0.0 } else { self.total_bytes as f64 / self.runs as f64 }
    }

    pub fn avg_packets(&self) -> f64 {
        if self.runs == 0 { 0.0 } else { self.total_packets as f64 / self.runs as f64 }
    }

    pub fn avg_rate(&self) -> f64 {
        if self.total_duration_secs > 0.0 {
            self.total_bytes as f64 / self.total_duration_secs
        } else {
            0.0
        }
    }
}

/// Per-direction running aggregates
#[derive(Debug, Clone, Default)]
pub struct DirStats {
    pub packets: u64,
    pub bytes: u64,
    pub header_bytes: u64,
    pub payload_bytes: u64,
    /// Count of packets carrying at least one payload byte
    pub payload_packets: u64,
    /// Packet length statistics (full frame lengths)
    pub len: RunningStats,
    /// Inter-arrival times within this direction, seconds
    pub iat: RunningStats,
    pub last_ts: Option<DateTime<Utc>>,
    pub syn: u32,
    pub fin: u32,
    pub rst: u32,
    pub psh: u32,
    pub ack: u32,
    pub urg: u32,
    /// First observed TCP window value
    pub init_window: Option<u16>,
    /// Smallest transport header length seen
    pub min_header_len: Option<u32>,
    pub bulk: BulkState,
}

impl DirStats {
    fn update(&mut self, pkt: &Packet) {
        self.packets += 1;
        self.bytes += pkt.length as u64;
        self.header_bytes += pkt.header_len as u64;
        self.len.push(pkt.length as f64);

        if let Some(last) = self.last_ts {
            self.iat.push(secs_between(last, pkt.ts));
        }
        self.last_ts = Some(pkt.ts);

        if let Some(flags) = pkt.tcp_flags {
            if flags.syn { self.syn += 1; }
            if flags.fin { self.fin += 1; }
            if flags.rst { self.rst += 1; }
            if flags.psh { self.psh += 1; }
            if flags.ack { self.ack += 1; }
            if flags.urg { self.urg += 1; }
        }

        if self.init_window.is_none() {
            self.init_window = pkt.window;
        }

        if pkt.header_len > 0 {
            self.min_header_len = Some(match self.min_header_len {
                Some(m) => m.min(pkt.header_len),
                None => pkt.header_len,
            });
        }

        let payload_len = pkt.payload_len();
        if payload_len > 0 {
            self.payload_packets += 1;
            self.payload_bytes += payload_len as u64;
        }
    }
}

/// Bidirectional flow with running aggregates
#[derive(Debug, Clone)]
pub struct Flow {
    pub key: FlowKey,

    // Forward endpoints (direction of the first packet)
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: IpProtocol,

    pub state: FlowState,
    pub close_reason: Option<CloseReason>,

    pub first_ts: DateTime<Utc>,
    pub last_ts: DateTime<Utc>,

    pub fwd: DirStats,
    pub bwd: DirStats,

    /// Combined packet length statistics
    pub len: RunningStats,
    /// Combined inter-arrival times, seconds
    pub iat: RunningStats,

    /// Flow-level ECE/CWR counts
    pub ece: u32,
    pub cwr: u32,

    /// Active segment durations, seconds
    pub active: RunningStats,
    /// Idle segment durations, seconds
    pub idle: RunningStats,
    active_start: DateTime<Utc>,
    last_activity: DateTime<Utc>,

    fwd_fin: bool,
    bwd_fin: bool,
    finalized: bool,
}

impl Flow {
    /// Create a new flow from its first packet. The packet's direction
    /// becomes the flow's forward direction; the packet itself is counted.
    pub fn new(pkt: &Packet, idle_threshold_secs: f64, bulk_min_packets: u32) -> Self {
        let mut flow = Self {
            key: FlowKey::from_packet(pkt),
            src_ip: pkt.src_ip,
            src_port: pkt.src_port,
            dst_ip: pkt.dst_ip,
            dst_port: pkt.dst_port,
            protocol: pkt.protocol,
            state: FlowState::Active,
            close_reason: None,
            first_ts: pkt.ts,
            last_ts: pkt.ts,
            fwd: DirStats::default(),
            bwd: DirStats::default(),
            len: RunningStats::default(),
            iat: RunningStats::default(),
            ece: 0,
            cwr: 0,
            active: RunningStats::default(),
            idle: RunningStats::default(),
            active_start: pkt.ts,
            last_activity: pkt.ts,
            fwd_fin: false,
            bwd_fin: false,
            finalized: false,
        };
        flow.update(pkt, idle_threshold_secs, bulk_min_packets);
        flow
    }

    /// Direction of a packet relative to this flow.
    pub fn direction_of(&self, pkt: &Packet) -> FlowDirection {
        if pkt.src_ip == self.src_ip && pkt.src_port == self.src_port {
            FlowDirection::Forward
        } else {
            FlowDirection::Backward
        }
    }

    /// Update aggregates and the closure state machine with one packet.
    pub fn update(&mut self, pkt: &Packet, idle_threshold_secs: f64, bulk_min_packets: u32) {
        debug_assert!(!self.finalized, "closed flow must not receive packets");

        let direction = self.direction_of(pkt);

        // Combined IAT and active/idle segmentation
        if self.total_packets() > 0 {
            let gap = secs_between(self.last_ts, pkt.ts);
            self.iat.push(gap);

            if gap >= idle_threshold_secs {
                let active_len = secs_between(self.active_start, self.last_activity);
                if active_len > 0.0 {
                    self.active.push(active_len);
                }
                self.idle.push(gap);
                self.active_start = pkt.ts;
            }
        }
        self.last_activity = pkt.ts;
        self.last_ts = pkt.ts;

        self.len.push(pkt.length as f64);

        // Bulk runs: a payload packet extends this direction's run and
        // interrupts the opposite direction's; an empty packet breaks its
        // own direction's run.
        let payload_len = pkt.payload_len();
        let (dir_stats, other_stats) = match direction {
            FlowDirection::Forward => (&mut self.fwd, &mut self.bwd),
            FlowDirection::Backward => (&mut self.bwd, &mut self.fwd),
        };
        if payload_len > 0 {
            other_stats.bulk.finalize(bulk_min_packets);
            dir_stats.bulk.push(pkt.ts, payload_len);
        } else {
            dir_stats.bulk.finalize(bulk_min_packets);
        }

        dir_stats.update(pkt);

        if let Some(flags) = pkt.tcp_flags {
            if flags.ece { self.ece += 1; }
            if flags.cwr { self.cwr += 1; }

            if flags.rst {
                self.state = FlowState::Closed;
                self.close_reason = Some(CloseReason::Reset);
            } else if flags.fin {
                match direction {
                    FlowDirection::Forward => self.fwd_fin = true,
                    FlowDirection::Backward => self.bwd_fin = true,
                }
                if self.fwd_fin && self.bwd_fin {
                    self.state = FlowState::Closed;
                    self.close_reason = Some(CloseReason::FinExchange);
                } else if self.state == FlowState::Active {
                    self.state = FlowState::Closing;
                }
            }
        }
    }

    /// Finalize for export: flush open bulk runs and the trailing active
    /// segment, and pin the state to Closed. Idempotent.
    pub fn finalize(&mut self, reason: CloseReason, bulk_min_packets: u32) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        self.fwd.bulk.finalize(bulk_min_packets);
        self.bwd.bulk.finalize(bulk_min_packets);

        let active_len = secs_between(self.active_start, self.last_activity);
        if active_len > 0.0 {
            self.active.push(active_len);
        }

        if self.state != FlowState::Closed {
            self.state = FlowState::Closed;
        }
        if self.close_reason.is_none() {
            self.close_reason = Some(reason);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == FlowState::Closed
    }

    pub fn total_packets(&self) -> u64 {
        self.fwd.packets + self.bwd.packets
    }

    pub fn total_bytes(&self) -> u64 {
        self.fwd.bytes + self.bwd.bytes
    }

    /// Flow duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        secs_between(self.first_ts, self.last_ts)
    }

    /// Compact summary used by the alert path.
    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            src_ip: self.src_ip,
            src_port: self.src_port,
            dst_ip: self.dst_ip,
            dst_port: self.dst_port,
            protocol: self.protocol,
            fwd_packets: self.fwd.packets,
            bwd_packets: self.bwd.packets,
            fwd_bytes: self.fwd.bytes,
            bwd_bytes: self.bwd.bytes,
            duration_secs: self.duration_secs(),
            closed_at: self.last_ts,
        }
    }
}

/// What the alert path needs to know about a closed flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: IpProtocol,
    pub fwd_packets: u64,
    pub bwd_packets: u64,
    pub fwd_bytes: u64,
    pub bwd_bytes: u64,
    pub duration_secs: f64,
    pub closed_at: DateTime<Utc>,
}
