//! Statistical classifier seam
//!
//! The engine only depends on the [`Classifier`] trait: a deterministic
//! scoring function from a feature vector to a label and a confidence in
//! [0, 1]. Production deployments plug a trained model in behind it;
//! [`HeuristicClassifier`] is the built-in fallback so the binary is useful
//! without one.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::features::FeatureVector;
use crate::models::{LABEL_BENIGN, LABEL_UNKNOWN};

/// Label and confidence returned by a classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl ClassificationResult {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Result recorded when classification could not complete.
    pub fn unclassified() -> Self {
        Self {
            label: LABEL_UNKNOWN.to_string(),
            confidence: 0.0,
        }
    }
}

/// A pluggable flow scoring function
pub trait Classifier: Send + Sync {
    fn classify(&self, features: &FeatureVector) -> Result<ClassificationResult>;

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        "classifier"
    }
}

/// Adapter for closures and external scoring functions
pub struct FnClassifier<F> {
    name: String,
    func: F,
}

impl<F> FnClassifier<F>
where
    F: Fn(&FeatureVector) -> Result<ClassificationResult> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self { name: name.into(), func }
    }
}

impl<F> Classifier for FnClassifier<F>
where
    F: Fn(&FeatureVector) -> Result<ClassificationResult> + Send + Sync,
{
    fn classify(&self, features: &FeatureVector) -> Result<ClassificationResult> {
        (self.func)(features)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Built-in fallback classifier.
///
/// Scores a handful of coarse traffic shapes from the feature vector. Not a
/// substitute for a trained model; it exists so the pipeline produces
/// labeled output before one is wired in.
#[derive(Debug, Default)]
pub struct HeuristicClassifier;

impl Classifier for HeuristicClassifier {
    fn classify(&self, features: &FeatureVector) -> Result<ClassificationResult> {
        let fwd_packets = features.get("Total Fwd Packets").unwrap_or(0.0);
        let bwd_packets = features.get("Total Backward Packets").unwrap_or(0.0);
        let packets_per_sec = features.get("Flow Packets/s").unwrap_or(0.0);
        let syn_count = features.get("SYN Flag Count").unwrap_or(0.0);
        let ack_count = features.get("ACK Flag Count").unwrap_or(0.0);
        let fwd_data_packets = features.get("act_data_pkt_fwd").unwrap_or(0.0);
        let duration = features.get("Flow Duration").unwrap_or(0.0);

        // One-sided packet storm
        if fwd_packets >= 100.0 && bwd_packets <= fwd_packets * 0.05 && packets_per_sec >= 50.0 {
            return Ok(ClassificationResult::new("DDoS", 0.90));
        }

        // Half-open probe: SYN traffic with no data and no completion
        if syn_count >= 1.0 && ack_count <= 1.0 && fwd_data_packets == 0.0 && fwd_packets <= 3.0 {
            return Ok(ClassificationResult::new("PortScan", 0.72));
        }

        // Long-lived connection trickling data
        if duration >= 30.0 && fwd_data_packets >= 1.0 && packets_per_sec < 1.0 {
            return Ok(ClassificationResult::new("Slowloris-DoS", 0.68));
        }

        Ok(ClassificationResult::new(LABEL_BENIGN, 0.80))
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// Run a classifier under a time budget.
///
/// The call is moved to the blocking pool; if it does not return within
/// `budget` the flow is recorded as unclassified instead of stalling
/// ingestion. Classifier errors are absorbed the same way.
pub async fn classify_with_budget(
    classifier: Arc<dyn Classifier>,
    features: FeatureVector,
    budget: Duration,
) -> ClassificationResult {
    let name = classifier.name().to_string();
    let task = tokio::task::spawn_blocking(move || classifier.classify(&features));

    match tokio::time::timeout(budget, task).await {
        Ok(Ok(Ok(result))) => result,
        Ok(Ok(Err(e))) => {
            warn!("Classifier {} failed: {}", name, e);
            ClassificationResult::unclassified()
        }
        Ok(Err(e)) => {
            warn!("Classifier {} panicked: {}", name, e);
            ClassificationResult::unclassified()
        }
        Err(_) => {
            warn!("Classifier {} exceeded {}ms budget", name, budget.as_millis());
            ClassificationResult::unclassified()
        }
    }
}
