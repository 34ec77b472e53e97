//! Topology tracker: version-checked intake of server observations.

use super::clock::{Clock, SystemClock};
use super::description::{is_stale, ServerDescription, TopologyDescription};
use super::state_machine::{DiscoveryStateMachine, TopologyStateMachine};
use crate::config::TopologyConfig;
use crate::metrics::CoreMetrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug)]
struct TrackerInner {
    description: Arc<TopologyDescription>,
    pool_generations: HashMap<String, u64>,
}

/// Tracks the deployment topology from server observations.
///
/// Observations are applied to a copy of the current description under one
/// mutex and the copy is published as the new snapshot. Readers only ever
/// see complete snapshots.
#[derive(Debug)]
pub struct TopologyTracker {
    inner: Mutex<TrackerInner>,
    publisher: watch::Sender<Arc<TopologyDescription>>,
    state_machine: Arc<dyn TopologyStateMachine>,
    clock: Arc<dyn Clock>,
    metrics: Arc<CoreMetrics>,
}

impl TopologyTracker {
    /// Create a tracker with the discovery state machine and system clock.
    pub fn new(config: &TopologyConfig, metrics: Arc<CoreMetrics>) -> Self {
        Self::with_parts(
            config,
            Arc::new(DiscoveryStateMachine::new()),
            Arc::new(SystemClock),
            metrics,
        )
    }

    pub fn with_parts(
        config: &TopologyConfig,
        state_machine: Arc<dyn TopologyStateMachine>,
        clock: Arc<dyn Clock>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        let description = Arc::new(TopologyDescription::new(config));
        let (publisher, _) = watch::channel(description.clone());
        Self {
            inner: Mutex::new(TrackerInner {
                description,
                pool_generations: HashMap::new(),
            }),
            publisher,
            state_machine,
            clock,
            metrics,
        }
    }

    /// Apply one observation.
    ///
    /// Returns `false` if the observation is older than the one already held
    /// for the server and was discarded.
    pub fn on_server_description(&self, mut observation: ServerDescription) -> bool {
        let mut inner = self.inner.lock();

        let last_version = inner
            .description
            .server(&observation.address)
            .and_then(|s| s.topology_version);
        if is_stale(last_version.as_ref(), observation.topology_version.as_ref()) {
            self.metrics.topology_stale_observations.inc();
            tracing::debug!(
                address = %observation.address,
                last = ?last_version,
                incoming = ?observation.topology_version,
                "Discarding stale server description"
            );
            return false;
        }

        if observation.is_error() && last_version.is_some() {
            let generation = inner
                .pool_generations
                .entry(observation.address.clone())
                .or_insert(0);
            *generation += 1;
            self.metrics.topology_pool_resets.inc();
            tracing::info!(
                address = %observation.address,
                generation = *generation,
                error = ?observation.error,
                "Clearing connection pool"
            );
        }

        observation.last_update = Some(self.clock.now());
        let mut next = TopologyDescription::clone(&inner.description);
        self.state_machine.on_server_description(&mut next, observation);

        let next = Arc::new(next);
        inner.description = next.clone();
        self.publisher.send_replace(next);
        true
    }

    /// Current snapshot.
    pub fn description(&self) -> Arc<TopologyDescription> {
        self.inner.lock().description.clone()
    }

    /// Receive every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologyDescription>> {
        self.publisher.subscribe()
    }

    /// Connection pool generation of a server; bumped on each pool reset.
    pub fn pool_generation(&self, address: &str) -> u64 {
        self.inner
            .lock()
            .pool_generations
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// Servers not updated within `window`, including those never updated.
    pub fn stale_servers(&self, window: Duration) -> Vec<String> {
        let now = self.clock.now();
        self.description()
            .servers()
            .filter(|s| {
                s.last_update
                    .map_or(true, |at| now.saturating_duration_since(at) > window)
            })
            .map(|s| s.address.clone())
            .collect()
    }
}
