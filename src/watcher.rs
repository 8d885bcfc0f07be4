//! Background replica watcher
//!
//! A single task polls the orchestrator on a fixed interval and publishes an
//! immutable [`ReplicaSnapshot`] through an atomic pointer swap. Readers load
//! the current snapshot without locking and never wait for a tick. A failed
//! tick is logged and the previous snapshot stays published.

use crate::metrics::GatewayMetrics;
use crate::orchestrator::{OrchestratorError, SharedOrchestrator};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Replica count and route for one function, as of a tick
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaEntry {
    pub replicas: u64,
    pub backend_address: String,
    pub last_updated: Instant,
}

impl ReplicaEntry {
    pub fn age(&self) -> Duration {
        self.last_updated.elapsed()
    }
}

/// Immutable view of all function replica counts
#[derive(Debug, Clone, Default)]
pub struct ReplicaSnapshot {
    entries: HashMap<String, ReplicaEntry>,
    /// Tick counter, 0 before the first successful tick
    generation: u64,
}

impl ReplicaSnapshot {
    pub fn get(&self, name: &str) -> Option<&ReplicaEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Read-only handle on the watcher's published snapshot
#[derive(Clone)]
pub struct ReplicaReader {
    current: Arc<ArcSwap<ReplicaSnapshot>>,
}

impl ReplicaReader {
    pub fn snapshot(&self) -> Arc<ReplicaSnapshot> {
        self.current.load_full()
    }
}

pub struct ReplicaWatcher {
    orchestrator: SharedOrchestrator,
    metrics: Arc<GatewayMetrics>,
    function_label: String,
    interval: Duration,
    current: Arc<ArcSwap<ReplicaSnapshot>>,
}

impl ReplicaWatcher {
    pub fn new(
        orchestrator: SharedOrchestrator,
        metrics: Arc<GatewayMetrics>,
        function_label: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            metrics,
            function_label: function_label.into(),
            interval,
            current: Arc::new(ArcSwap::from_pointee(ReplicaSnapshot::default())),
        }
    }

    pub fn reader(&self) -> ReplicaReader {
        ReplicaReader {
            current: Arc::clone(&self.current),
        }
    }

    pub fn snapshot(&self) -> Arc<ReplicaSnapshot> {
        self.current.load_full()
    }

    /// Poll the orchestrator once and publish a new snapshot.
    /// On error the published snapshot is left untouched.
    pub async fn tick(&self) -> Result<usize, OrchestratorError> {
        let services = self.orchestrator.list_services(&self.function_label).await?;
        let now = Instant::now();
        let previous = self.current.load_full();

        let entries: HashMap<String, ReplicaEntry> = services
            .into_iter()
            .map(|service| {
                (
                    service.name,
                    ReplicaEntry {
                        replicas: service.replicas,
                        backend_address: service.backend_address,
                        last_updated: now,
                    },
                )
            })
            .collect();

        for (name, entry) in &entries {
            self.metrics.set_replica_gauge(name, entry.replicas);
        }
        // Functions that disappeared drop to zero rather than keeping a stale gauge
        for name in previous.names().filter(|name| !entries.contains_key(*name)) {
            self.metrics.set_replica_gauge(name, 0);
        }

        let count = entries.len();
        self.current.store(Arc::new(ReplicaSnapshot {
            entries,
            generation: previous.generation + 1,
        }));
        Ok(count)
    }

    /// Run until the shutdown signal flips to true
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            label = %self.function_label,
            "Replica watcher started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(count) => debug!(
                            functions = count,
                            generation = self.snapshot().generation(),
                            "Replica snapshot refreshed"
                        ),
                        Err(e) => warn!(error = %e, "Replica watcher tick failed, keeping previous snapshot"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Replica watcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}
