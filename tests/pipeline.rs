//! End-to-end pipeline scenarios over synthetic packet sequences.
//!
//! Drives the flow table, feature extractor, rule engine and dispatcher
//! directly with fixed timestamps so every windowing decision is
//! deterministic.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, TimeZone, Utc};

use flowsentry::classifier::ClassificationResult;
use flowsentry::config::{AlertConfig, FlowConfig, RulesConfig};
use flowsentry::dispatch::{AlertDispatcher, Candidate};
use flowsentry::features::{extract, FEATURE_NAMES};
use flowsentry::flow::FlowTable;
use flowsentry::models::Severity;
use flowsentry::packet::{IpProtocol, Packet, TcpFlags};
use flowsentry::rules::{AppEvent, RuleEngine};
use flowsentry::snapshot::SnapshotHandle;

fn ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
}

fn attacker() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(203, 0, 113, 50))
}

fn server() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
}

fn client_packet(ms: i64, src_port: u16, dst_port: u16, flags: TcpFlags, payload: &[u8]) -> Packet {
    let mut pkt = Packet::new(ts(ms), attacker(), server(), IpProtocol::Tcp);
    pkt.src_port = src_port;
    pkt.dst_port = dst_port;
    pkt.length = (40 + payload.len()) as u32;
    pkt.header_len = 20;
    pkt.tcp_flags = Some(flags);
    pkt.window = Some(8192);
    pkt.payload = payload.to_vec();
    pkt
}

fn server_packet(ms: i64, src_port: u16, dst_port: u16, flags: TcpFlags) -> Packet {
    let mut pkt = Packet::new(ts(ms), server(), attacker(), IpProtocol::Tcp);
    pkt.src_port = src_port;
    pkt.dst_port = dst_port;
    pkt.length = 40;
    pkt.header_len = 20;
    pkt.tcp_flags = Some(flags);
    pkt.window = Some(16384);
    pkt
}

fn dispatcher_with(config: AlertConfig) -> (AlertDispatcher, SnapshotHandle) {
    let handle = SnapshotHandle::new();
    let dispatcher = AlertDispatcher::new(config, 0.60, handle.clone());
    (dispatcher, handle)
}

#[test]
fn fin_both_directions_closes_and_exports_exactly_once() {
    let mut table = FlowTable::new(FlowConfig::default());

    let syn = TcpFlags { syn: true, ..Default::default() };
    let syn_ack = TcpFlags { syn: true, ack: true, ..Default::default() };
    let ack = TcpFlags { ack: true, ..Default::default() };
    let fin = TcpFlags { fin: true, ack: true, ..Default::default() };

    assert!(table.ingest(&client_packet(0, 40100, 80, syn, b"")).is_none());
    assert!(table.ingest(&server_packet(10, 80, 40100, syn_ack)).is_none());
    assert!(table.ingest(&client_packet(20, 40100, 80, ack, b"hello")).is_none());
    assert!(table.ingest(&client_packet(30, 40100, 80, fin, b"")).is_none());

    let closed = table
        .ingest(&server_packet(40, 80, 40100, fin))
        .expect("FIN in both directions closes the flow");
    assert!(closed.is_closed());
    assert_eq!(table.len(), 0);

    // A later sweep finds nothing: the flow left the table on export
    assert!(table.sweep(ts(60_000)).is_empty());
    assert_eq!(table.stats.flows_closed, 1);
    assert_eq!(table.stats.flows_expired, 0);
}

#[test]
fn degenerate_flows_extract_finite_vectors() {
    let mut table = FlowTable::new(FlowConfig::default());

    // Single packet, zero duration
    table.ingest(&client_packet(0, 40200, 443, TcpFlags::default(), b""));
    let flows = table.sweep(ts(10_000));
    assert_eq!(flows.len(), 1);

    let features = extract(&flows[0]);
    for (i, name) in FEATURE_NAMES.iter().enumerate() {
        assert!(
            features[i].is_finite(),
            "feature '{}' must be finite for a single-packet flow",
            name
        );
    }
}

#[test]
fn extraction_is_idempotent_over_a_closed_flow() {
    let mut table = FlowTable::new(FlowConfig::default());

    table.ingest(&client_packet(0, 40300, 80, TcpFlags { syn: true, ..Default::default() }, b""));
    table.ingest(&server_packet(15, 80, 40300, TcpFlags { syn: true, ack: true, ..Default::default() }));
    table.ingest(&client_packet(40, 40300, 80, TcpFlags { ack: true, psh: true, ..Default::default() }, b"data"));

    let flows = table.sweep(ts(10_000));
    let flow = &flows[0];

    let first = extract(flow);
    let second = extract(flow);
    assert_eq!(first, second);
}

#[test]
fn active_idle_segments_for_gapped_flow() {
    // 3 packets, no TCP flags, third after a 5-second gap; idle threshold 1s
    let mut table = FlowTable::new(FlowConfig {
        inactivity_timeout_ms: 60_000,
        ..Default::default()
    });

    table.ingest(&client_packet(0, 40400, 9000, TcpFlags::default(), b"a"));
    table.ingest(&client_packet(400, 40400, 9000, TcpFlags::default(), b"b"));
    table.ingest(&client_packet(5400, 40400, 9000, TcpFlags::default(), b"c"));

    let flows = table.sweep(ts(120_000));
    let features = extract(&flows[0]);

    // One active segment spanning the first two packets
    assert!((features.get("Active Mean").unwrap() - 0.4).abs() < 1e-6);
    assert_eq!(
        features.get("Active Mean"),
        features.get("Active Max"),
        "exactly one active segment"
    );
    // One idle segment covering the 5s gap
    assert!(features.get("Idle Max").unwrap() >= 4.0);
    assert_eq!(features.get("Idle Mean"), features.get("Idle Max"));
}

#[test]
fn cooldown_bounds_alert_spacing_per_source_label() {
    let (mut dispatcher, handle) = dispatcher_with(AlertConfig::default());
    let mut rules = RuleEngine::new(RulesConfig::default()).unwrap();

    // Continuous brute-force stream for 60 seconds
    for i in 0..120 {
        if let Some(d) = rules.observe_event(AppEvent::AuthFailure {
            src_ip: attacker(),
            service: "ssh".to_string(),
            ts: ts(i * 500),
        }) {
            dispatcher.submit(Candidate::Rule(d));
        }
    }

    let snap = handle.read();
    assert!(!snap.alerts.is_empty());

    // No two alerts for the same (source, label) closer than the cooldown
    let cooldown = chrono::Duration::seconds(30);
    for pair in snap.alerts.windows(2) {
        assert!(
            pair[1].timestamp - pair[0].timestamp >= cooldown,
            "alerts {} and {} violate the cooldown",
            pair[0].timestamp,
            pair[1].timestamp
        );
    }
    assert!(snap.alerts_suppressed > 0);
}

#[test]
fn unknown_override_is_visible_in_snapshot() {
    let (mut dispatcher, handle) = dispatcher_with(AlertConfig::default());
    let mut table = FlowTable::new(FlowConfig::default());

    table.ingest(&client_packet(0, 40500, 80, TcpFlags::default(), b"x"));
    let flows = table.sweep(ts(10_000));

    // Classifier is confident enough to name a class, but below the
    // unknown threshold
    dispatcher.submit(Candidate::Classified {
        flow: flows[0].summary(),
        result: ClassificationResult::new("Bot", 0.42),
    });

    let snap = handle.read();
    assert_eq!(snap.traffic.len(), 1);
    assert_eq!(snap.traffic[0].label, "Unknown-Traffic");
    assert!(snap.alerts.is_empty(), "untrusted labels never alert");
}

#[test]
fn brute_force_scenario_fifteen_attempts_in_eight_seconds() {
    let (mut dispatcher, handle) = dispatcher_with(AlertConfig::default());
    let mut rules = RuleEngine::new(RulesConfig::default()).unwrap();

    // 15 attempts spread over 8 seconds; attempts continue after the fire
    let mut emitted = Vec::new();
    for i in 0..15 {
        if let Some(d) = rules.observe_event(AppEvent::AuthFailure {
            src_ip: attacker(),
            service: "ssh".to_string(),
            ts: ts(i * 533),
        }) {
            if let Some(alert) = dispatcher.submit(Candidate::Rule(d)) {
                emitted.push(alert);
            }
        }
    }

    assert_eq!(emitted.len(), 1, "cooldown holds while attempts continue");
    assert_eq!(emitted[0].label, "SSH-Brute-Force");
    assert!(emitted[0].severity >= Severity::High);

    let snap = handle.read();
    assert_eq!(snap.alerts.len(), 1);
}

#[test]
fn port_scan_scenario_twelve_distinct_ports() {
    let (mut dispatcher, handle) = dispatcher_with(AlertConfig::default());
    let mut rules = RuleEngine::new(RulesConfig::default()).unwrap();

    let mut emitted = 0;
    for port in 1..=12u16 {
        // Each port contacted twice: repeats add no distinct port
        for rep in 0..2i64 {
            let pkt = client_packet(
                port as i64 * 100 + rep,
                40600 + port,
                port,
                TcpFlags { syn: true, ..Default::default() },
                b"",
            );
            for d in rules.observe(&pkt) {
                if dispatcher.submit(Candidate::Rule(d)).is_some() {
                    emitted += 1;
                }
            }
        }
    }

    assert_eq!(emitted, 1, "one PortScan alert despite repeated firings");
    assert_eq!(handle.read().alerts[0].label, "PortScan");
}

#[test]
fn sql_injection_payload_fires_independent_of_classifier() {
    let (mut dispatcher, handle) = dispatcher_with(AlertConfig::default());
    let mut rules = RuleEngine::new(RulesConfig::default()).unwrap();
    let mut table = FlowTable::new(FlowConfig::default());

    let pkt = client_packet(
        0,
        40700,
        80,
        TcpFlags { psh: true, ack: true, ..Default::default() },
        b"GET /login?user=admin&pass=' OR '1'='1 HTTP/1.1",
    );

    // Rule path fires on the very first observation
    let detections = rules.observe(&pkt);
    let sqli: Vec<_> = detections.iter().filter(|d| d.label == "SQL-Injection").collect();
    assert_eq!(sqli.len(), 1);
    for d in detections.clone() {
        dispatcher.submit(Candidate::Rule(d));
    }

    // The classifier path later calls the same flow benign; the rule alert
    // is unaffected
    table.ingest(&pkt);
    let flows = table.sweep(ts(10_000));
    dispatcher.submit(Candidate::Classified {
        flow: flows[0].summary(),
        result: ClassificationResult::new("BENIGN", 0.93),
    });

    let snap = handle.read();
    assert!(snap.alerts.iter().any(|a| a.label == "SQL-Injection"));
    assert_eq!(snap.alerts[0].severity, Severity::Critical);
}

#[test]
fn snapshot_histories_respect_bounds() {
    let (mut dispatcher, handle) = dispatcher_with(AlertConfig {
        traffic_history: 10,
        alert_history: 4,
        cooldown_secs: 0,
        ..Default::default()
    });
    let mut table = FlowTable::new(FlowConfig::default());

    for i in 0..30u16 {
        table.ingest(&client_packet(i as i64 * 10, 41000 + i, 80, TcpFlags::default(), b"y"));
    }
    for flow in table.sweep(ts(60_000)) {
        dispatcher.submit(Candidate::Classified {
            flow: flow.summary(),
            result: ClassificationResult::new("DDoS", 0.97),
        });
    }

    let snap = handle.read();
    assert_eq!(snap.traffic.len(), 10);
    assert_eq!(snap.alerts.len(), 4);
    assert_eq!(snap.flows_classified, 30);
}
