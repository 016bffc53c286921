//! Signature rule engine
//!
//! Stateful, per-source detectors that run independently of the statistical
//! classifier: sliding-window counters for brute force, privilege
//! escalation, port scanning and slow-connection floods, plus immediate
//! payload pattern matching.
//!
//! Every window is pruned on access, so a source that never repeats is
//! forgotten as soon as its window slides past; `prune` additionally
//! reclaims memory for idle sources. Detectors are level-triggered: while a
//! condition holds, repeated observations re-fire and the alert
//! dispatcher's cooldown absorbs the repeats.

pub mod patterns;

pub use patterns::{PayloadInspector, PatternMatch, LABEL_CMDI, LABEL_SQLI, LABEL_XSS};

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::RulesConfig;
use crate::packet::Packet;

/// Attack labels for the windowed detectors
pub const LABEL_BRUTE_FORCE: &str = "SSH-Brute-Force";
pub const LABEL_PRIV_ESC: &str = "Privilege-Escalation";
pub const LABEL_PORT_SCAN: &str = "PortScan";
pub const LABEL_SLOW_CONN: &str = "Slowloris-DoS";

/// Confidence assigned to payload pattern matches
const PATTERN_CONFIDENCE: f64 = 0.95;
/// Confidence assigned to windowed counter detections
const WINDOW_CONFIDENCE: f64 = 0.90;

/// An application-layer event fed in from outside the packet stream
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Failed authentication attempt (sshd, ftp, ...)
    AuthFailure {
        src_ip: IpAddr,
        service: String,
        ts: DateTime<Utc>,
    },
    /// Elevated-privilege invocation (sudo)
    SudoInvocation {
        src_ip: IpAddr,
        ts: DateTime<Utc>,
    },
}

impl AppEvent {
    pub fn src_ip(&self) -> IpAddr {
        match self {
            AppEvent::AuthFailure { src_ip, .. } => *src_ip,
            AppEvent::SudoInvocation { src_ip, .. } => *src_ip,
        }
    }

    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            AppEvent::AuthFailure { ts, .. } => *ts,
            AppEvent::SudoInvocation { ts, .. } => *ts,
        }
    }
}

/// One rule-engine firing, a candidate for the alert dispatcher
#[derive(Debug, Clone)]
pub struct RuleDetection {
    pub label: String,
    pub src_ip: IpAddr,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: Option<u16>,
    pub confidence: f64,
    pub ts: DateTime<Utc>,
    pub message: String,
}

/// Open connection tracked for the slow-connection detector
#[derive(Debug, Clone)]
struct OpenConn {
    opened_at: DateTime<Utc>,
    payload_bytes: u64,
}

/// Per-source sliding-window state
#[derive(Debug, Default)]
struct SourceState {
    /// Failed-auth timestamps
    auth_failures: Vec<DateTime<Utc>>,
    /// Sudo invocation timestamps
    sudo_events: Vec<DateTime<Utc>>,
    /// Destination ports contacted, with most recent contact time
    ports: HashMap<u16, DateTime<Utc>>,
    /// Open connections keyed by (dst ip, dst port, src port)
    open_conns: HashMap<(IpAddr, u16, u16), OpenConn>,
}

impl SourceState {
    fn is_empty(&self) -> bool {
        self.auth_failures.is_empty()
            && self.sudo_events.is_empty()
            && self.ports.is_empty()
            && self.open_conns.is_empty()
    }
}

/// Stateful signature rule engine
pub struct RuleEngine {
    config: RulesConfig,
    inspector: PayloadInspector,
    sources: HashMap<IpAddr, SourceState>,
    pub detections_fired: u64,
}

impl RuleEngine {
    pub fn new(config: RulesConfig) -> Result<Self> {
        let inspector = PayloadInspector::new(&config.payload)?;
        Ok(Self {
            config,
            inspector,
            sources: HashMap::new(),
            detections_fired: 0,
        })
    }

    /// Observe one packet; returns zero or more candidate detections.
    pub fn observe(&mut self, pkt: &Packet) -> Vec<RuleDetection> {
        let mut detections = Vec::new();

        // Payload patterns fire immediately, no windowing
        for m in self.inspector.inspect(&pkt.payload) {
            debug!("Payload pattern {} from {}", m.rule_name, pkt.src_ip);
            detections.push(RuleDetection {
                label: m.label.to_string(),
                src_ip: pkt.src_ip,
                dst_ip: Some(pkt.dst_ip),
                dst_port: Some(pkt.dst_port),
                confidence: PATTERN_CONFIDENCE,
                ts: pkt.ts,
                message: format!("{} ({}): {:?}", m.description, m.rule_name, m.matched),
            });
        }

        if let Some(d) = self.track_ports(pkt) {
            detections.push(d);
        }

        if let Some(d) = self.track_connections(pkt) {
            detections.push(d);
        }

        self.detections_fired += detections.len() as u64;
        detections
    }

    /// Observe an application event (auth failure, sudo invocation).
    pub fn observe_event(&mut self, event: AppEvent) -> Option<RuleDetection> {
        let detection = match &event {
            AppEvent::AuthFailure { src_ip, service, ts } => {
                let rule = self.config.brute_force.clone();
                let state = self.sources.entry(*src_ip).or_default();
                let cutoff = *ts - rule.window();
                state.auth_failures.retain(|t| *t > cutoff);
                state.auth_failures.push(*ts);

                if state.auth_failures.len() >= rule.threshold {
                    Some(RuleDetection {
                        label: LABEL_BRUTE_FORCE.to_string(),
                        src_ip: *src_ip,
                        dst_ip: None,
                        dst_port: None,
                        confidence: WINDOW_CONFIDENCE,
                        ts: *ts,
                        message: format!(
                            "{} failed {} auth attempts in {}s",
                            state.auth_failures.len(),
                            service,
                            rule.window_secs
                        ),
                    })
                } else {
                    None
                }
            }
            AppEvent::SudoInvocation { src_ip, ts } => {
                let rule = self.config.privilege_escalation.clone();
                let state = self.sources.entry(*src_ip).or_default();
                let cutoff = *ts - rule.window();
                state.sudo_events.retain(|t| *t > cutoff);
                state.sudo_events.push(*ts);

                if state.sudo_events.len() >= rule.threshold {
                    Some(RuleDetection {
                        label: LABEL_PRIV_ESC.to_string(),
                        src_ip: *src_ip,
                        dst_ip: None,
                        dst_port: None,
                        confidence: WINDOW_CONFIDENCE,
                        ts: *ts,
                        message: format!(
                            "{} privilege elevations in {}s",
                            state.sudo_events.len(),
                            rule.window_secs
                        ),
                    })
                } else {
                    None
                }
            }
        };

        if detection.is_some() {
            self.detections_fired += 1;
        }
        detection
    }

    /// Distinct-destination-port tracking (scan detection).
    ///
    /// Only connection-opening traffic counts: TCP SYNs and UDP sends.
    /// Repeated contact with an already-seen port refreshes its timestamp
    /// but adds no new distinct port.
    fn track_ports(&mut self, pkt: &Packet) -> Option<RuleDetection> {
        use crate::packet::IpProtocol;

        let opening = match pkt.protocol {
            IpProtocol::Tcp => pkt.flags().is_syn(),
            IpProtocol::Udp => true,
            _ => false,
        };
        if !opening {
            return None;
        }

        let rule = &self.config.port_scan;
        let cutoff = pkt.ts - rule.window();

        let state = self.sources.entry(pkt.src_ip).or_default();
        state.ports.retain(|_, t| *t > cutoff);
        state.ports.insert(pkt.dst_port, pkt.ts);

        if state.ports.len() >= rule.threshold {
            debug!(
                "Port scan condition from {}: {} distinct ports",
                pkt.src_ip,
                state.ports.len()
            );
            Some(RuleDetection {
                label: LABEL_PORT_SCAN.to_string(),
                src_ip: pkt.src_ip,
                dst_ip: Some(pkt.dst_ip),
                dst_port: Some(pkt.dst_port),
                confidence: WINDOW_CONFIDENCE,
                ts: pkt.ts,
                message: format!(
                    "{} distinct ports contacted in {}s",
                    state.ports.len(),
                    rule.window_secs
                ),
            })
        } else {
            None
        }
    }

    /// Open low-throughput connection tracking (connection starvation).
    fn track_connections(&mut self, pkt: &Packet) -> Option<RuleDetection> {
        use crate::packet::IpProtocol;

        if pkt.protocol != IpProtocol::Tcp {
            return None;
        }
        let flags = pkt.flags();
        let cfg = self.config.slow_conn.clone();

        // Closure removes the connection from whichever side tracked it
        if flags.fin || flags.rst {
            if let Some(state) = self.sources.get_mut(&pkt.src_ip) {
                state.open_conns.remove(&(pkt.dst_ip, pkt.dst_port, pkt.src_port));
            }
            if let Some(state) = self.sources.get_mut(&pkt.dst_ip) {
                state.open_conns.remove(&(pkt.src_ip, pkt.src_port, pkt.dst_port));
            }
            return None;
        }

        let state = self.sources.entry(pkt.src_ip).or_default();

        if flags.is_syn() {
            state.open_conns.insert(
                (pkt.dst_ip, pkt.dst_port, pkt.src_port),
                OpenConn { opened_at: pkt.ts, payload_bytes: 0 },
            );
        } else if let Some(conn) =
            state.open_conns.get_mut(&(pkt.dst_ip, pkt.dst_port, pkt.src_port))
        {
            conn.payload_bytes += pkt.payload_len() as u64;
        }

        // Stale entries age out of the tracking window
        let cutoff = pkt.ts - cfg.window();
        state.open_conns.retain(|_, c| c.opened_at > cutoff);

        let slow = state
            .open_conns
            .values()
            .filter(|c| c.payload_bytes <= cfg.max_bytes)
            .count();

        if slow >= cfg.threshold {
            Some(RuleDetection {
                label: LABEL_SLOW_CONN.to_string(),
                src_ip: pkt.src_ip,
                dst_ip: Some(pkt.dst_ip),
                dst_port: Some(pkt.dst_port),
                confidence: WINDOW_CONFIDENCE,
                ts: pkt.ts,
                message: format!("{} concurrent low-throughput connections", slow),
            })
        } else {
            None
        }
    }

    /// Reclaim memory for sources whose windows have all emptied.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let auth_cutoff = now - self.config.brute_force.window();
        let sudo_cutoff = now - self.config.privilege_escalation.window();
        let port_cutoff = now - self.config.port_scan.window();
        let conn_cutoff = now - self.config.slow_conn.window();

        self.sources.retain(|ip, state| {
            state.auth_failures.retain(|t| *t > auth_cutoff);
            state.sudo_events.retain(|t| *t > sudo_cutoff);
            state.ports.retain(|_, t| *t > port_cutoff);
            state.open_conns.retain(|_, c| c.opened_at > conn_cutoff);
            let keep = !state.is_empty();
            if !keep {
                debug!("Evicted idle rule state for {}", ip);
            }
            keep
        });
    }

    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IpProtocol, Packet, TcpFlags};
    use chrono::TimeZone;
    use std::net::Ipv4Addr;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn src() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    fn engine() -> RuleEngine {
        RuleEngine::new(RulesConfig::default()).unwrap()
    }

    fn syn_to_port(ms: i64, dst_port: u16) -> Packet {
        let mut pkt = Packet::new(
            ts(ms),
            src(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpProtocol::Tcp,
        );
        pkt.src_port = 40000 + dst_port;
        pkt.dst_port = dst_port;
        pkt.length = 60;
        pkt.header_len = 20;
        pkt.tcp_flags = Some(TcpFlags { syn: true, ..Default::default() });
        pkt
    }

    #[test]
    fn test_brute_force_window() {
        let mut engine = engine();

        // 9 attempts: below threshold
        for i in 0..9 {
            let d = engine.observe_event(AppEvent::AuthFailure {
                src_ip: src(),
                service: "ssh".to_string(),
                ts: ts(i * 500),
            });
            assert!(d.is_none(), "attempt {} must not fire", i);
        }

        // 10th within the 10s window fires
        let d = engine.observe_event(AppEvent::AuthFailure {
            src_ip: src(),
            service: "ssh".to_string(),
            ts: ts(4800),
        });
        let d = d.expect("threshold reached");
        assert_eq!(d.label, LABEL_BRUTE_FORCE);
        assert!(d.confidence >= 0.85);
    }

    #[test]
    fn test_brute_force_window_slides() {
        let mut engine = engine();

        // 9 attempts early, then one 15 seconds later: window slid, no fire
        for i in 0..9 {
            engine.observe_event(AppEvent::AuthFailure {
                src_ip: src(),
                service: "ssh".to_string(),
                ts: ts(i * 100),
            });
        }
        let d = engine.observe_event(AppEvent::AuthFailure {
            src_ip: src(),
            service: "ssh".to_string(),
            ts: ts(15_000),
        });
        assert!(d.is_none());
    }

    #[test]
    fn test_privilege_escalation() {
        let mut engine = engine();

        assert!(engine
            .observe_event(AppEvent::SudoInvocation { src_ip: src(), ts: ts(0) })
            .is_none());
        assert!(engine
            .observe_event(AppEvent::SudoInvocation { src_ip: src(), ts: ts(5000) })
            .is_none());

        let d = engine
            .observe_event(AppEvent::SudoInvocation { src_ip: src(), ts: ts(10_000) })
            .expect("3 sudo events in 30s fire");
        assert_eq!(d.label, LABEL_PRIV_ESC);
    }

    #[test]
    fn test_port_scan_fires_at_threshold() {
        let mut engine = engine();

        for port in 1..=9u16 {
            let d = engine.observe(&syn_to_port((port as i64) * 100, port));
            assert!(d.iter().all(|d| d.label != LABEL_PORT_SCAN));
        }
        let d = engine.observe(&syn_to_port(1000, 10));
        assert!(d.iter().any(|d| d.label == LABEL_PORT_SCAN));
    }

    #[test]
    fn test_port_scan_repeats_add_no_distinct_port() {
        let mut engine = engine();

        // 9 distinct ports, each hammered 5 times: still below threshold
        for port in 1..=9u16 {
            for rep in 0..5 {
                let d = engine.observe(&syn_to_port((port as i64) * 100 + rep, port));
                assert!(d.iter().all(|d| d.label != LABEL_PORT_SCAN));
            }
        }
    }

    #[test]
    fn test_slow_connection_flood() {
        let mut engine = engine();

        let mut fired = false;
        for i in 0..25u16 {
            // Many half-open connections to the same service, no payload
            let mut pkt = syn_to_port(i as i64 * 10, 80);
            pkt.src_port = 50000 + i;
            fired |= engine
                .observe(&pkt)
                .iter()
                .any(|d| d.label == LABEL_SLOW_CONN);
        }
        assert!(fired, "20+ open low-throughput connections must fire");
    }

    #[test]
    fn test_closed_connections_not_counted() {
        let mut engine = engine();

        for i in 0..25u16 {
            let mut syn = syn_to_port(i as i64 * 10, 80);
            syn.src_port = 50000 + i;
            engine.observe(&syn);

            // Each connection closes right away
            let mut fin = syn.clone();
            fin.ts = ts(i as i64 * 10 + 5);
            fin.tcp_flags = Some(TcpFlags { fin: true, ack: true, ..Default::default() });
            let d = engine.observe(&fin);
            assert!(d.iter().all(|d| d.label != LABEL_SLOW_CONN));
        }
    }

    #[test]
    fn test_sql_injection_fires_immediately() {
        let mut engine = engine();

        let mut pkt = syn_to_port(0, 80);
        pkt.tcp_flags = Some(TcpFlags { psh: true, ack: true, ..Default::default() });
        pkt.payload = b"username=admin&password=' OR '1'='1".to_vec();

        let detections = engine.observe(&pkt);
        assert!(detections.iter().any(|d| d.label == LABEL_SQLI));
        let d = detections.iter().find(|d| d.label == LABEL_SQLI).unwrap();
        assert!((d.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_prune_evicts_idle_sources() {
        let mut engine = engine();

        engine.observe_event(AppEvent::AuthFailure {
            src_ip: src(),
            service: "ssh".to_string(),
            ts: ts(0),
        });
        assert_eq!(engine.tracked_sources(), 1);

        engine.prune(ts(200_000));
        assert_eq!(engine.tracked_sources(), 0);
    }
}
