use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label assigned to clean traffic by the classifier
pub const LABEL_BENIGN: &str = "BENIGN";

/// Sentinel label for classifications below the confidence threshold or
/// flows the classifier could not score in time
pub const LABEL_UNKNOWN: &str = "Unknown-Traffic";

/// Alert severity, derived from detection confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Threshold mapping used for all emitted alerts.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.95 {
            Severity::Critical
        } else if confidence >= 0.85 {
            Severity::High
        } else if confidence >= 0.75 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Which detection path produced an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionMethod {
    /// Statistical classifier on a closed flow
    Classifier,
    /// Signature rule engine
    Rule,
    /// Both paths flagged the same source and label
    Hybrid,
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionMethod::Classifier => write!(f, "classifier"),
            DetectionMethod::Rule => write!(f, "rule"),
            DetectionMethod::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// A deduplicated, emitted detection. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub confidence: f64,
    pub severity: Severity,
    pub method: DetectionMethod,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub packets: u64,
    pub bytes: u64,
    pub message: String,
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {}:{} -> {}:{} ({}, {:.0}%)",
            self.severity,
            self.label,
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.method,
            self.confidence * 100.0,
        )
    }
}
