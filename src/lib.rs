//! flowsentry: real-time hybrid network intrusion detection.
//!
//! Reconstructs bidirectional flows from captured packets, summarizes each
//! closed flow into a fixed 78-feature vector scored by a pluggable
//! statistical classifier, and cross-checks the same traffic against a
//! stateful signature rule engine (brute force, privilege escalation, port
//! scans, slow-connection floods, payload patterns). Both detection paths
//! feed one alert dispatcher that deduplicates per (source, label) with a
//! cooldown and publishes an immutable snapshot for dashboards and
//! reporting.

pub mod authlog;
pub mod capture;
pub mod cli;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod features;
pub mod flow;
pub mod models;
pub mod packet;
pub mod rules;
pub mod snapshot;

pub use classifier::{ClassificationResult, Classifier, HeuristicClassifier};
pub use config::Config;
pub use dispatch::{AlertDispatcher, Candidate};
pub use engine::Engine;
pub use features::{extract, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use flow::{Flow, FlowKey, FlowTable};
pub use models::{Alert, DetectionMethod, Severity};
pub use packet::{IpProtocol, Packet, TcpFlags};
pub use rules::{AppEvent, RuleDetection, RuleEngine};
pub use snapshot::{Snapshot, SnapshotHandle, TrafficSample};
