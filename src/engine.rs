//! Detection engine
//!
//! Wires the pipeline together:
//!
//! ```text
//! capture thread ──packets──▶ ingest loop ──closed flows──▶ classify workers
//!                                │  │                            │
//!                   rule engine ◀┘  └─ sweep tick                │
//!                                │                               │
//!                                └──candidates──▶ dispatcher ──▶ snapshot
//! auth log task ──app events──▶ ingest loop                      └─▶ sinks
//! ```
//!
//! The ingest loop is the single writer of the flow table and rule-engine
//! state: packets and the periodic expiry sweep are serialized through one
//! `select!` loop, so a flow can never be exported twice or mutated after
//! export. Classification runs on a semaphore-bounded worker pool; when
//! the pool is saturated the flow is recorded as unclassified instead of
//! stalling ingestion.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::classifier::{classify_with_budget, ClassificationResult, Classifier};
use crate::config::Config;
use crate::dispatch::{AlertDispatcher, Candidate};
use crate::features;
use crate::flow::{Flow, FlowTable};
use crate::models::Alert;
use crate::packet::Packet;
use crate::rules::{AppEvent, RuleEngine};
use crate::snapshot::SnapshotHandle;

/// Engine counters
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub packets_processed: u64,
    pub flows_exported: u64,
    pub classify_pool_rejections: u64,
    pub rule_detections: u64,
}

/// The assembled detection pipeline
pub struct Engine {
    config: Config,
    classifier: Arc<dyn Classifier>,
    snapshot: SnapshotHandle,
    dispatcher: AlertDispatcher,
    stats: Arc<RwLock<EngineStats>>,
}

impl Engine {
    pub fn new(config: Config, classifier: Arc<dyn Classifier>) -> Result<Self> {
        let snapshot = SnapshotHandle::new();
        let dispatcher = AlertDispatcher::new(
            config.alerts.clone(),
            config.classifier.unknown_threshold,
            snapshot.clone(),
        );

        Ok(Self {
            config,
            classifier,
            snapshot,
            dispatcher,
            stats: Arc::new(RwLock::new(EngineStats::default())),
        })
    }

    /// Handle for reading the published snapshot. Never blocks the engine.
    pub fn snapshot(&self) -> SnapshotHandle {
        self.snapshot.clone()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.read().clone()
    }

    /// Register an alert sink (storage, email, ...). Must be called before
    /// `run`. Sink failure never affects the engine.
    pub fn subscribe_alerts(&mut self) -> mpsc::Receiver<Alert> {
        self.dispatcher.subscribe()
    }

    /// Run the engine until the packet source ends or shutdown fires.
    pub async fn run(
        self,
        mut packet_rx: mpsc::Receiver<Packet>,
        mut app_event_rx: mpsc::Receiver<AppEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let Engine {
            config,
            classifier,
            snapshot,
            dispatcher,
            stats,
        } = self;

        let mut table = FlowTable::new(config.flow.clone());
        let mut rules = RuleEngine::new(config.rules.clone())?;

        // Dispatcher task: single consumer of both detection paths
        let (cand_tx, mut cand_rx) = mpsc::channel::<Candidate>(1024);
        let dispatcher_task = tokio::spawn(async move {
            let mut dispatcher = dispatcher;
            while let Some(candidate) = cand_rx.recv().await {
                dispatcher.submit(candidate);
            }
            debug!("Dispatcher drained");
        });

        // Optional periodic JSON export for out-of-process consumers
        let export_task = config.alerts.export_path.clone().map(|path| {
            let handle = snapshot.clone();
            let interval = std::time::Duration::from_millis(config.alerts.export_interval_ms);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tick.tick().await;
                    if let Err(e) = handle.export_json(&path) {
                        warn!("Snapshot export failed: {}", e);
                    }
                }
            })
        });

        let semaphore = Arc::new(Semaphore::new(config.classifier.workers.max(1)));
        let budget = config.classifier.budget();

        let mut sweep = tokio::time::interval(config.flow.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "Engine running (inactivity timeout {}ms, {} classify workers)",
            config.flow.inactivity_timeout_ms, config.classifier.workers
        );

        loop {
            tokio::select! {
                maybe_pkt = packet_rx.recv() => {
                    match maybe_pkt {
                        Some(pkt) => {
                            stats.write().packets_processed += 1;

                            // Rule path sees every packet
                            let detections = rules.observe(&pkt);
                            if !detections.is_empty() {
                                stats.write().rule_detections += detections.len() as u64;
                                for d in detections {
                                    if cand_tx.send(Candidate::Rule(d)).await.is_err() {
                                        break;
                                    }
                                }
                            }

                            // Flow path: export on flag-based closure
                            if let Some(flow) = table.ingest(&pkt) {
                                Self::spawn_classification(
                                    flow,
                                    &classifier,
                                    &semaphore,
                                    budget,
                                    &cand_tx,
                                    &stats,
                                );
                            }
                        }
                        None => {
                            info!("Packet source ended");
                            break;
                        }
                    }
                }

                Some(event) = app_event_rx.recv() => {
                    if let Some(detection) = rules.observe_event(event) {
                        stats.write().rule_detections += 1;
                        let _ = cand_tx.send(Candidate::Rule(detection)).await;
                    }
                }

                _ = sweep.tick() => {
                    let now = Utc::now();
                    for flow in table.sweep(now) {
                        Self::spawn_classification(
                            flow,
                            &classifier,
                            &semaphore,
                            budget,
                            &cand_tx,
                            &stats,
                        );
                    }
                    rules.prune(now);
                }

                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        // Export whatever is still in flight
        for flow in table.drain() {
            Self::spawn_classification(flow, &classifier, &semaphore, budget, &cand_tx, &stats);
        }

        drop(cand_tx);
        dispatcher_task.await.ok();
        if let Some(task) = export_task {
            task.abort();
        }

        let final_stats = stats.read().clone();
        info!(
            "Engine stopped: {} packets, {} flows exported",
            final_stats.packets_processed, final_stats.flows_exported
        );

        Ok(())
    }

    /// Offload feature extraction and classification for one closed flow.
    ///
    /// Export order across flows is not preserved; alerts carry their own
    /// timestamps.
    fn spawn_classification(
        flow: Flow,
        classifier: &Arc<dyn Classifier>,
        semaphore: &Arc<Semaphore>,
        budget: std::time::Duration,
        cand_tx: &mpsc::Sender<Candidate>,
        stats: &Arc<RwLock<EngineStats>>,
    ) {
        stats.write().flows_exported += 1;
        let summary = flow.summary();

        match semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let classifier = classifier.clone();
                let cand_tx = cand_tx.clone();
                tokio::spawn(async move {
                    let features = features::extract(&flow);
                    let result = classify_with_budget(classifier, features, budget).await;
                    let _ = cand_tx
                        .send(Candidate::Classified { flow: summary, result })
                        .await;
                    drop(permit);
                });
            }
            Err(_) => {
                // Worker pool saturated: record the flow unclassified
                // rather than blocking ingestion.
                stats.write().classify_pool_rejections += 1;
                let _ = cand_tx.try_send(Candidate::Classified {
                    flow: summary,
                    result: ClassificationResult::unclassified(),
                });
            }
        }
    }
}
