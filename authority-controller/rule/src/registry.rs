use crate::{connection, Connection, ObserveResponse, Origin, RegistryMetrics};
use dubbo_authority_core::{Endpoint, RuleType};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::Instrument;

/// Tracks live connections and the latest origin of each rule type.
#[derive(Clone, Debug)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Inner>>,
    push_timeout: Duration,
    metrics: RegistryMetrics,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    connections: HashMap<u64, mpsc::UnboundedSender<Arc<dyn Origin>>>,
    latest: HashMap<RuleType, Arc<dyn Origin>>,
}

// Responses are bounded by the number of rule types, since each has at most
// one push in flight.
const RESPONSE_BUFFER: usize = 8;

// === impl ConnectionRegistry ===

impl ConnectionRegistry {
    pub fn new(push_timeout: Duration) -> Self {
        Self::with_metrics(push_timeout, RegistryMetrics::default())
    }

    pub fn with_metrics(push_timeout: Duration, metrics: RegistryMetrics) -> Self {
        Self {
            inner: Arc::default(),
            push_timeout,
            metrics,
        }
    }

    /// Registers a connection for `endpoint` and spawns the task that pushes
    /// rules to it. Pushes are delivered on the returned receiver until the
    /// connection is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, endpoint: Endpoint) -> (Connection, mpsc::Receiver<ObserveResponse>) {
        let (origins_tx, origins_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_BUFFER);

        let id = {
            let mut inner = self.inner.write();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.connections.insert(id, origins_tx.clone());
            id
        };
        self.metrics.connected();
        tracing::debug!(id, endpoint = %endpoint.id, "Connected");

        let shared = Arc::new(connection::Shared::new(
            endpoint,
            self.push_timeout,
            self.metrics.clone(),
        ));
        let worker = connection::Worker::new(shared.clone(), self.clone(), origins_rx, responses_tx);
        tokio::spawn(worker.run().instrument(tracing::debug_span!("connection", id)));

        (Connection::new(id, shared, self.clone(), origins_tx), responses_rx)
    }

    /// Records `origin` as the latest of its type and queues it on every
    /// live connection.
    pub fn publish(&self, origin: Arc<dyn Origin>) {
        let mut inner = self.inner.write();
        tracing::debug!(
            rule_type = %origin.rule_type(),
            revision = origin.revision(),
            connections = inner.connections.len(),
            "Publishing",
        );
        inner.latest.insert(origin.rule_type(), origin.clone());
        for tx in inner.connections.values() {
            // A closed queue belongs to a connection that is being removed.
            let _ = tx.send(origin.clone());
        }
    }

    pub fn latest(&self, rule_type: RuleType) -> Option<Arc<dyn Origin>> {
        self.inner.read().latest.get(&rule_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn disconnect(&self, id: u64) {
        if self.inner.write().connections.remove(&id).is_some() {
            self.metrics.disconnected();
            tracing::debug!(id, "Disconnected");
        }
    }
}
