//! Alert dispatcher
//!
//! Single consumer of both detection paths. Applies the unknown-confidence
//! override, derives severity, deduplicates per (source, label) with a
//! cooldown window, maintains the bounded traffic/alert histories, offers
//! emitted alerts to registered sinks, and publishes the snapshot.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::ClassificationResult;
use crate::config::AlertConfig;
use crate::flow::FlowSummary;
use crate::models::{Alert, DetectionMethod, Severity, LABEL_BENIGN, LABEL_UNKNOWN};
use crate::rules::RuleDetection;
use crate::snapshot::{Snapshot, SnapshotHandle, TrafficSample};

/// A detection submitted to the dispatcher
#[derive(Debug, Clone)]
pub enum Candidate {
    /// A classified, closed flow
    Classified {
        flow: FlowSummary,
        result: ClassificationResult,
    },
    /// A rule-engine firing
    Rule(RuleDetection),
}

/// Merges, deduplicates and publishes detections
pub struct AlertDispatcher {
    config: AlertConfig,
    unknown_threshold: f64,

    /// Last emission time per (source, label)
    cooldowns: HashMap<(IpAddr, String), DateTime<Utc>>,
    /// Last candidate per (source, label), emitted or not, for hybrid
    /// attribution
    last_candidate: HashMap<(IpAddr, String), (DateTime<Utc>, DetectionMethod)>,

    traffic: VecDeque<TrafficSample>,
    alerts: VecDeque<Alert>,
    suppressed: u64,
    flows_classified: u64,

    sinks: Vec<mpsc::Sender<Alert>>,
    snapshot: SnapshotHandle,
}

impl AlertDispatcher {
    pub fn new(config: AlertConfig, unknown_threshold: f64, snapshot: SnapshotHandle) -> Self {
        Self {
            config,
            unknown_threshold,
            cooldowns: HashMap::new(),
            last_candidate: HashMap::new(),
            traffic: VecDeque::new(),
            alerts: VecDeque::new(),
            suppressed: 0,
            flows_classified: 0,
            sinks: Vec::new(),
            snapshot: snapshot.clone(),
        }
    }

    /// Register an alert sink. Each emitted alert is offered once; a full
    /// or closed sink is skipped without affecting core state.
    pub fn subscribe(&mut self) -> mpsc::Receiver<Alert> {
        let (tx, rx) = mpsc::channel(256);
        self.sinks.push(tx);
        rx
    }

    /// Process one candidate. Returns the alert if one was emitted.
    pub fn submit(&mut self, candidate: Candidate) -> Option<Alert> {
        let alert = match candidate {
            Candidate::Classified { flow, result } => self.submit_classified(flow, result),
            Candidate::Rule(detection) => self.submit_rule(detection),
        };

        self.publish();
        alert
    }

    fn submit_classified(
        &mut self,
        flow: FlowSummary,
        result: ClassificationResult,
    ) -> Option<Alert> {
        // Low-confidence labels are not trusted
        let label = if result.confidence < self.unknown_threshold {
            LABEL_UNKNOWN.to_string()
        } else {
            result.label
        };
        let is_attack = label != LABEL_BENIGN && label != LABEL_UNKNOWN;

        self.flows_classified += 1;
        self.push_traffic(TrafficSample {
            timestamp: flow.closed_at,
            label: label.clone(),
            confidence: result.confidence,
            is_attack,
            src_ip: flow.src_ip,
            fwd_packets: flow.fwd_packets,
            bwd_packets: flow.bwd_packets,
            duration_secs: flow.duration_secs,
            dst_port: flow.dst_port,
        });

        if !is_attack {
            return None;
        }

        self.try_emit(
            flow.src_ip,
            label.clone(),
            DetectionMethod::Classifier,
            flow.closed_at,
            Alert {
                id: Uuid::new_v4(),
                timestamp: flow.closed_at,
                label,
                confidence: result.confidence,
                severity: Severity::from_confidence(result.confidence),
                method: DetectionMethod::Classifier,
                src_ip: flow.src_ip,
                src_port: flow.src_port,
                dst_ip: flow.dst_ip,
                dst_port: flow.dst_port,
                packets: flow.fwd_packets + flow.bwd_packets,
                bytes: flow.fwd_bytes + flow.bwd_bytes,
                message: format!(
                    "flow {}:{} -> {}:{} classified as attack",
                    flow.src_ip, flow.src_port, flow.dst_ip, flow.dst_port
                ),
            },
        )
    }

    fn submit_rule(&mut self, detection: RuleDetection) -> Option<Alert> {
        let dst_ip = detection
            .dst_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        self.try_emit(
            detection.src_ip,
            detection.label.clone(),
            DetectionMethod::Rule,
            detection.ts,
            Alert {
                id: Uuid::new_v4(),
                timestamp: detection.ts,
                label: detection.label,
                confidence: detection.confidence,
                severity: Severity::from_confidence(detection.confidence),
                method: DetectionMethod::Rule,
                src_ip: detection.src_ip,
                src_port: 0,
                dst_ip,
                dst_port: detection.dst_port.unwrap_or(0),
                packets: 0,
                bytes: 0,
                message: detection.message,
            },
        )
    }

    /// Cooldown gate: at most one alert per (source, label) per window.
    /// The first occurrence after expiry always emits.
    fn try_emit(
        &mut self,
        src_ip: IpAddr,
        label: String,
        method: DetectionMethod,
        ts: DateTime<Utc>,
        mut alert: Alert,
    ) -> Option<Alert> {
        let key = (src_ip, label);
        let cooldown = self.config.cooldown();

        // Corroboration by the other path within the window upgrades the
        // detection method.
        if let Some((prev_ts, prev_method)) = self.last_candidate.get(&key) {
            if *prev_method != method && ts - *prev_ts <= cooldown {
                alert.method = DetectionMethod::Hybrid;
            }
        }
        self.last_candidate.insert(key.clone(), (ts, method));

        if let Some(last_emit) = self.cooldowns.get(&key) {
            if ts - *last_emit < cooldown {
                self.suppressed += 1;
                debug!(
                    "Suppressed {} alert for {} (cooldown, {} total)",
                    key.1, key.0, self.suppressed
                );
                return None;
            }
        }

        self.cooldowns.insert(key, ts);
        self.push_alert(alert.clone());
        self.offer_to_sinks(&alert);

        info!("{}", alert);
        Some(alert)
    }

    fn offer_to_sinks(&mut self, alert: &Alert) {
        self.sinks.retain(|sink| {
            match sink.try_send(alert.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Alert sink full, dropping alert {}", alert.id);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn push_traffic(&mut self, sample: TrafficSample) {
        self.traffic.push_back(sample);
        while self.traffic.len() > self.config.traffic_history {
            self.traffic.pop_front();
        }
    }

    fn push_alert(&mut self, alert: Alert) {
        self.alerts.push_back(alert);
        while self.alerts.len() > self.config.alert_history {
            self.alerts.pop_front();
        }
    }

    /// Rebuild and atomically publish the snapshot.
    fn publish(&self) {
        self.snapshot.publish(Snapshot {
            traffic: self.traffic.iter().cloned().collect(),
            alerts: self.alerts.iter().cloned().collect(),
            alerts_suppressed: self.suppressed,
            flows_classified: self.flows_classified,
            updated_at: Some(Utc::now()),
        });
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::IpProtocol;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn summary(ms: i64) -> FlowSummary {
        FlowSummary {
            src_ip: "203.0.113.9".parse().unwrap(),
            src_port: 40123,
            dst_ip: "10.0.0.1".parse().unwrap(),
            dst_port: 80,
            protocol: IpProtocol::Tcp,
            fwd_packets: 12,
            bwd_packets: 10,
            fwd_bytes: 2400,
            bwd_bytes: 8000,
            duration_secs: 1.5,
            closed_at: ts(ms),
        }
    }

    fn detection(ms: i64, label: &str) -> RuleDetection {
        RuleDetection {
            label: label.to_string(),
            src_ip: "203.0.113.9".parse().unwrap(),
            dst_ip: Some("10.0.0.1".parse().unwrap()),
            dst_port: Some(22),
            confidence: 0.90,
            ts: ts(ms),
            message: "test detection".to_string(),
        }
    }

    fn dispatcher() -> (AlertDispatcher, SnapshotHandle) {
        let handle = SnapshotHandle::new();
        let dispatcher = AlertDispatcher::new(AlertConfig::default(), 0.60, handle.clone());
        (dispatcher, handle)
    }

    #[test]
    fn test_benign_flow_samples_without_alert() {
        let (mut d, handle) = dispatcher();

        let alert = d.submit(Candidate::Classified {
            flow: summary(0),
            result: ClassificationResult::new(LABEL_BENIGN, 0.92),
        });
        assert!(alert.is_none());

        let snap = handle.read();
        assert_eq!(snap.traffic.len(), 1);
        assert!(!snap.traffic[0].is_attack);
        assert!(snap.alerts.is_empty());
    }

    #[test]
    fn test_unknown_override_below_threshold() {
        let (mut d, handle) = dispatcher();

        let alert = d.submit(Candidate::Classified {
            flow: summary(0),
            result: ClassificationResult::new("DDoS", 0.45),
        });
        assert!(alert.is_none(), "untrusted label must not alert");

        let snap = handle.read();
        assert_eq!(snap.traffic[0].label, LABEL_UNKNOWN);
    }

    #[test]
    fn test_attack_flow_alerts() {
        let (mut d, handle) = dispatcher();

        let alert = d
            .submit(Candidate::Classified {
                flow: summary(0),
                result: ClassificationResult::new("DDoS", 0.97),
            })
            .expect("confident attack label emits");
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.method, DetectionMethod::Classifier);
        assert_eq!(alert.packets, 22);

        let snap = handle.read();
        assert_eq!(snap.alerts.len(), 1);
        assert!(snap.traffic[0].is_attack);
    }

    #[test]
    fn test_cooldown_suppresses_repeats() {
        let (mut d, _handle) = dispatcher();

        assert!(d.submit(Candidate::Rule(detection(0, "SSH-Brute-Force"))).is_some());
        // Repeats inside the 30s window are suppressed
        assert!(d.submit(Candidate::Rule(detection(5_000, "SSH-Brute-Force"))).is_none());
        assert!(d.submit(Candidate::Rule(detection(29_000, "SSH-Brute-Force"))).is_none());
        assert_eq!(d.suppressed(), 2);

        // First occurrence after expiry emits again
        assert!(d.submit(Candidate::Rule(detection(31_000, "SSH-Brute-Force"))).is_some());
    }

    #[test]
    fn test_cooldown_is_per_label() {
        let (mut d, _handle) = dispatcher();

        assert!(d.submit(Candidate::Rule(detection(0, "SSH-Brute-Force"))).is_some());
        assert!(d.submit(Candidate::Rule(detection(1_000, "PortScan"))).is_some());
    }

    #[test]
    fn test_hybrid_method_on_corroboration() {
        let (mut d, _handle) = dispatcher();

        // Rule path fires first
        assert!(d.submit(Candidate::Rule(detection(0, "DDoS"))).is_some());

        // Classifier confirms the same source and label after the cooldown
        let alert = d
            .submit(Candidate::Classified {
                flow: summary(31_000),
                result: ClassificationResult::new("DDoS", 0.97),
            })
            .expect("emits after cooldown");
        // The prior rule candidate is outside the window, so no upgrade
        assert_eq!(alert.method, DetectionMethod::Classifier);

        // A fresh rule firing within the window of the classifier emission
        // is suppressed but remembered; the next classifier emission is
        // marked hybrid.
        assert!(d.submit(Candidate::Rule(detection(40_000, "DDoS"))).is_none());
        let alert = d
            .submit(Candidate::Classified {
                flow: summary(65_000),
                result: ClassificationResult::new("DDoS", 0.97),
            })
            .expect("emits after second cooldown");
        assert_eq!(alert.method, DetectionMethod::Hybrid);
    }

    #[test]
    fn test_history_bounds() {
        let handle = SnapshotHandle::new();
        let config = AlertConfig {
            traffic_history: 5,
            alert_history: 3,
            cooldown_secs: 0,
            ..Default::default()
        };
        let mut d = AlertDispatcher::new(config, 0.60, handle.clone());

        for i in 0..10 {
            d.submit(Candidate::Classified {
                flow: summary(i * 1000),
                result: ClassificationResult::new("DDoS", 0.97),
            });
        }

        let snap = handle.read();
        assert_eq!(snap.traffic.len(), 5);
        assert_eq!(snap.alerts.len(), 3);
        // Newest entries are kept
        assert_eq!(snap.traffic.last().unwrap().timestamp, ts(9000));
    }

    #[test]
    fn test_sink_receives_alert_once() {
        let (mut d, _handle) = dispatcher();
        let mut rx = d.subscribe();

        d.submit(Candidate::Rule(detection(0, "PortScan")));
        let received = rx.try_recv().expect("sink offered the alert");
        assert_eq!(received.label, "PortScan");
        assert!(rx.try_recv().is_err(), "offered exactly once");
    }

    #[test]
    fn test_closed_sink_does_not_affect_core() {
        let (mut d, _handle) = dispatcher();
        let rx = d.subscribe();
        drop(rx);

        let alert = d.submit(Candidate::Rule(detection(0, "PortScan")));
        assert!(alert.is_some(), "closed sink must not block emission");
    }
}
