//! Published engine state
//!
//! The dispatcher is the only writer; everyone else reads. Publication is
//! an atomic replace of an `Arc<Snapshot>` behind a short-held lock, so a
//! reader can never observe a partially updated snapshot and never blocks
//! the producer for more than a pointer swap.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::Alert;

/// One classified flow in the rolling traffic history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSample {
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub confidence: f64,
    pub is_attack: bool,
    pub src_ip: IpAddr,
    pub fwd_packets: u64,
    pub bwd_packets: u64,
    pub duration_secs: f64,
    pub dst_port: u16,
}

/// Immutable externally-consumed state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Bounded, time-ordered classified-flow history
    pub traffic: Vec<TrafficSample>,
    /// Bounded, time-ordered alert history
    pub alerts: Vec<Alert>,
    /// Alerts suppressed by the cooldown since start
    pub alerts_suppressed: u64,
    /// Flows classified since start
    pub flows_classified: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Shared handle publishing immutable snapshots
#[derive(Clone)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(Snapshot::default()))),
        }
    }

    /// Replace the published snapshot.
    pub fn publish(&self, snapshot: Snapshot) {
        *self.inner.write() = Arc::new(snapshot);
    }

    /// Read the current snapshot. Cheap: clones an Arc.
    pub fn read(&self) -> Arc<Snapshot> {
        self.inner.read().clone()
    }

    /// Write the current snapshot as JSON, atomically (tmp file + rename).
    pub fn export_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = self.read();
        let json = serde_json::to_string(&*snapshot)?;

        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write snapshot to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to publish snapshot to {}", path.display()))?;
        Ok(())
    }
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        Self::new()
    }
}
