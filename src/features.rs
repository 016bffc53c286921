//! Flow feature extraction
//!
//! Turns a closed flow into the fixed 78-column feature vector the
//! classifier was trained on (CIC-IDS2017 column layout). The column order
//! in [`FEATURE_NAMES`] is a contract with the trained model: reordering a
//! field silently breaks classification, so the order is pinned here and
//! checked by tests, never inferred at runtime.
//!
//! Extraction is pure and total: any closed flow, including a single-packet
//! one, yields a vector of finite numbers. Undefined statistics (e.g. the
//! standard deviation of one sample) are 0.

use serde::{Deserialize, Serialize};

use crate::flow::Flow;

/// Number of features in the vector
pub const FEATURE_COUNT: usize = 78;

/// Schema of the trained model, in consumption order.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "Destination Port",
    "Flow Duration",
    "Total Fwd Packets",
    "Total Backward Packets",
    "Total Length of Fwd Packets",
    "Total Length of Bwd Packets",
    "Fwd Packet Length Max",
    "Fwd Packet Length Min",
    "Fwd Packet Length Mean",
    "Fwd Packet Length Std",
    "Bwd Packet Length Max",
    "Bwd Packet Length Min",
    "Bwd Packet Length Mean",
    "Bwd Packet Length Std",
    "Flow Bytes/s",
    "Flow Packets/s",
    "Flow IAT Mean",
    "Flow IAT Std",
    "Flow IAT Max",
    "Flow IAT Min",
    "Fwd IAT Total",
    "Fwd IAT Mean",
    "Fwd IAT Std",
    "Fwd IAT Max",
    "Fwd IAT Min",
    "Bwd IAT Total",
    "Bwd IAT Mean",
    "Bwd IAT Std",
    "Bwd IAT Max",
    "Bwd IAT Min",
    "Fwd PSH Flags",
    "Bwd PSH Flags",
    "Fwd URG Flags",
    "Bwd URG Flags",
    "Fwd Header Length",
    "Bwd Header Length",
    "Fwd Packets/s",
    "Bwd Packets/s",
    "Min Packet Length",
    "Max Packet Length",
    "Packet Length Mean",
    "Packet Length Std",
    "Packet Length Variance",
    "FIN Flag Count",
    "SYN Flag Count",
    "RST Flag Count",
    "PSH Flag Count",
    "ACK Flag Count",
    "URG Flag Count",
    "CWE Flag Count",
    "ECE Flag Count",
    "Down/Up Ratio",
    "Average Packet Size",
    "Avg Fwd Segment Size",
    "Avg Bwd Segment Size",
    "Fwd Header Length.1",
    "Fwd Avg Bytes/Bulk",
    "Fwd Avg Packets/Bulk",
    "Fwd Avg Bulk Rate",
    "Bwd Avg Bytes/Bulk",
    "Bwd Avg Packets/Bulk",
    "Bwd Avg Bulk Rate",
    "Subflow Fwd Packets",
    "Subflow Fwd Bytes",
    "Subflow Bwd Packets",
    "Subflow Bwd Bytes",
    "Init_Win_bytes_forward",
    "Init_Win_bytes_backward",
    "act_data_pkt_fwd",
    "min_seg_size_forward",
    "Active Mean",
    "Active Std",
    "Active Max",
    "Active Min",
    "Idle Mean",
    "Idle Std",
    "Idle Max",
    "Idle Min",
];

/// Fixed-order numeric summary of one flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: Vec<f64>,
}

impl FeatureVector {
    fn from_values(mut values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), FEATURE_COUNT);
        for v in values.iter_mut() {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        Self { values }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Look up a feature by schema name.
    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|&n| n == name)
            .map(|i| self.values[i])
    }
}

impl std::ops::Index<usize> for FeatureVector {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.values[index]
    }
}

/// Rate with the degenerate-duration fallback: a zero-duration flow reports
/// its raw total so the value stays finite and comparable.
fn rate(total: f64, duration_secs: f64) -> f64 {
    if duration_secs > 0.0 {
        total / duration_secs
    } else {
        total
    }
}

/// Extract the feature vector from a closed flow.
pub fn extract(flow: &Flow) -> FeatureVector {
    let duration = flow.duration_secs();
    let total_packets = flow.total_packets() as f64;
    let total_bytes = flow.total_bytes() as f64;
    let fwd = &flow.fwd;
    let bwd = &flow.bwd;

    let down_up_ratio = if fwd.packets > 0 {
        bwd.packets as f64 / fwd.packets as f64
    } else {
        0.0
    };

    let avg_packet_size = if total_packets > 0.0 {
        total_bytes / total_packets
    } else {
        0.0
    };

    let values = vec![
        flow.dst_port as f64,
        duration,
        fwd.packets as f64,
        bwd.packets as f64,
        fwd.bytes as f64,
        bwd.bytes as f64,
        fwd.len.max(),
        fwd.len.min(),
        fwd.len.mean(),
        fwd.len.std_dev(),
        bwd.len.max(),
        bwd.len.min(),
        bwd.len.mean(),
        bwd.len.std_dev(),
        rate(total_bytes, duration),
        rate(total_packets, duration),
        flow.iat.mean(),
        flow.iat.std_dev(),
        flow.iat.max(),
        flow.iat.min(),
        fwd.iat.total(),
        fwd.iat.mean(),
        fwd.iat.std_dev(),
        fwd.iat.max(),
        fwd.iat.min(),
        bwd.iat.total(),
        bwd.iat.mean(),
        bwd.iat.std_dev(),
        bwd.iat.max(),
        bwd.iat.min(),
        fwd.psh as f64,
        bwd.psh as f64,
        fwd.urg as f64,
        bwd.urg as f64,
        fwd.header_bytes as f64,
        bwd.header_bytes as f64,
        rate(fwd.packets as f64, duration),
        rate(bwd.packets as f64, duration),
        flow.len.min(),
        flow.len.max(),
        flow.len.mean(),
        flow.len.std_dev(),
        flow.len.variance(),
        (fwd.fin + bwd.fin) as f64,
        (fwd.syn + bwd.syn) as f64,
        (fwd.rst + bwd.rst) as f64,
        (fwd.psh + bwd.psh) as f64,
        (fwd.ack + bwd.ack) as f64,
        (fwd.urg + bwd.urg) as f64,
        flow.cwr as f64,
        flow.ece as f64,
        down_up_ratio,
        avg_packet_size,
        fwd.len.mean(),
        bwd.len.mean(),
        fwd.header_bytes as f64,
        fwd.bulk.avg_bytes(),
        fwd.bulk.avg_packets(),
        fwd.bulk.avg_rate(),
        bwd.bulk.avg_bytes(),
        bwd.bulk.avg_packets(),
        bwd.bulk.avg_rate(),
        fwd.packets as f64,
        fwd.bytes as f64,
        bwd.packets as f64,
        bwd.bytes as f64,
        fwd.init_window.map(f64::from).unwrap_or(0.0),
        bwd.init_window.map(f64::from).unwrap_or(0.0),
        fwd.payload_packets as f64,
        fwd.min_header_len.map(f64::from).unwrap_or(0.0),
        flow.active.mean(),
        flow.active.std_dev(),
        flow.active.max(),
        flow.active.min(),
        flow.idle.mean(),
        flow.idle.std_dev(),
        flow.idle.max(),
        flow.idle.min(),
    ];

    FeatureVector::from_values(values)
}
