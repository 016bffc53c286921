//! Flow table with timeout management
//!
//! Single-writer store of in-progress flows. Packets enter through
//! [`FlowTable::ingest`]; flows leave exactly once, either because their
//! closure conditions were met on the ingestion path or because the
//! periodic [`FlowTable::sweep`] expired them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::FlowConfig;
use crate::packet::Packet;

use super::{CloseReason, Flow, FlowKey};

/// Table statistics
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub flows_created: u64,
    pub flows_closed: u64,
    pub flows_expired: u64,
    pub flows_evicted: u64,
    pub packets_processed: u64,
}

/// Hash table mapping flow keys to in-progress flows
pub struct FlowTable {
    flows: HashMap<FlowKey, Flow>,
    config: FlowConfig,
    pub stats: TableStats,
}

impl FlowTable {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            flows: HashMap::new(),
            config,
            stats: TableStats::default(),
        }
    }

    /// Process one packet. Creates or updates the matching flow; if the
    /// packet completes the flow (FIN both ways or RST), the flow is
    /// removed from the table, finalized and returned for export.
    ///
    /// A packet for an already-exported key starts a brand-new flow.
    pub fn ingest(&mut self, pkt: &Packet) -> Option<Flow> {
        self.stats.packets_processed += 1;

        let key = FlowKey::from_packet(pkt);
        let idle = self.config.idle_threshold_secs();
        let bulk_min = self.config.bulk_min_packets;

        match self.flows.get_mut(&key) {
            Some(flow) => {
                flow.update(pkt, idle, bulk_min);
                if flow.is_closed() {
                    let mut flow = self.flows.remove(&key)?;
                    let reason = flow.close_reason.unwrap_or(CloseReason::FinExchange);
                    flow.finalize(reason, bulk_min);
                    self.stats.flows_closed += 1;
                    return Some(flow);
                }
            }
            None => {
                if self.flows.len() >= self.config.table_size {
                    self.evict_oldest();
                }
                let flow = Flow::new(pkt, idle, bulk_min);
                self.stats.flows_created += 1;
                // A lone RST/FIN pair can close a flow on its first packet.
                if flow.is_closed() {
                    let mut flow = flow;
                    let reason = flow.close_reason.unwrap_or(CloseReason::Reset);
                    flow.finalize(reason, bulk_min);
                    self.stats.flows_closed += 1;
                    return Some(flow);
                }
                self.flows.insert(key, flow);
            }
        }

        None
    }

    /// Force-close flows whose last activity is older than the inactivity
    /// timeout. Called periodically, not per-packet. Returned flows are
    /// finalized and ready for export.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Flow> {
        let timeout = self.config.inactivity_timeout();
        let expired_keys: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, flow)| now - flow.last_ts > timeout)
            .map(|(key, _)| key.clone())
            .collect();

        let mut expired = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(mut flow) = self.flows.remove(&key) {
                flow.finalize(CloseReason::Timeout, self.config.bulk_min_packets);
                self.stats.flows_expired += 1;
                expired.push(flow);
            }
        }

        if !expired.is_empty() {
            debug!("Expired {} idle flows", expired.len());
        }

        expired
    }

    /// Drain every remaining flow (shutdown path).
    pub fn drain(&mut self) -> Vec<Flow> {
        let keys: Vec<FlowKey> = self.flows.keys().cloned().collect();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(mut flow) = self.flows.remove(&key) {
                flow.finalize(CloseReason::Timeout, self.config.bulk_min_packets);
                self.stats.flows_expired += 1;
                drained.push(flow);
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Evict the least recently active flow to make room.
    fn evict_oldest(&mut self) {
        if let Some(key) = self
            .flows
            .iter()
            .min_by_key(|(_, flow)| flow.last_ts)
            .map(|(k, _)| k.clone())
        {
            if let Some(mut flow) = self.flows.remove(&key) {
                flow.finalize(CloseReason::Evicted, self.config.bulk_min_packets);
                self.stats.flows_evicted += 1;
                debug!("Evicted oldest flow {} -> {}", flow.src_ip, flow.dst_ip);
            }
        }
    }
}
