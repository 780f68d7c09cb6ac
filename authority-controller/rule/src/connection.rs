use crate::{ConnectionRegistry, ObserveRequest, ObserveResponse, Origin, RegistryMetrics, ToClient};
use dubbo_authority_core::{Endpoint, RuleType};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Notify},
    time::{self, Instant},
};

/// A client's observe stream.
///
/// Requests read from the client are passed to [`Connection::handle_request`].
/// Dropping the connection removes it from the registry and stops its pushes.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    shared: Arc<Shared>,
    registry: ConnectionRegistry,
    origins: mpsc::UnboundedSender<Arc<dyn Origin>>,
}

/// State shared between a connection's reader and its push worker.
#[derive(Debug)]
pub(crate) struct Shared {
    endpoint: Endpoint,
    statuses: Mutex<HashMap<RuleType, ClientStatus>>,
    acked: Notify,
    push_timeout: Duration,
    metrics: RegistryMetrics,
}

/// Drains a connection's origin queue, pushing each rendered origin to the
/// client.
///
/// Origins are dispatched one at a time, so while a push waits for the
/// client to acknowledge an earlier push of the same type, queued origins of
/// other types wait too. The wait is bounded by the push timeout.
pub(crate) struct Worker {
    shared: Arc<Shared>,
    registry: ConnectionRegistry,
    origins: mpsc::UnboundedReceiver<Arc<dyn Origin>>,
    responses: mpsc::Sender<ObserveResponse>,
}

#[derive(Debug)]
struct ClientStatus {
    pushing: bool,
    nonce_inc: u64,
    /// The last version acknowledged by the client.
    client_version: Version,
    last_pushed: Option<Pushed>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Version {
    revision: i64,
    data: String,
}

#[derive(Debug)]
struct Pushed {
    version: Version,
    nonce: String,
    at: Instant,
}

/// The response stream is gone.
#[derive(Debug)]
struct Closed;

// === impl Connection ===

impl Connection {
    pub(crate) fn new(
        id: u64,
        shared: Arc<Shared>,
        registry: ConnectionRegistry,
        origins: mpsc::UnboundedSender<Arc<dyn Origin>>,
    ) -> Self {
        Self {
            id,
            shared,
            registry,
            origins,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Handles a subscription or acknowledgement from the client. Malformed
    /// requests are logged and ignored.
    pub fn handle_request(&self, req: ObserveRequest) {
        let rule_type = match req.rule_type.parse::<RuleType>() {
            Ok(rule_type) => rule_type,
            Err(error) => {
                tracing::warn!(id = self.id, %error, "Ignoring request");
                return;
            }
        };

        if req.nonce.is_empty() {
            self.subscribe(rule_type);
        } else {
            self.shared.ack(rule_type, &req.nonce);
        }
    }

    fn subscribe(&self, rule_type: RuleType) {
        let mut statuses = self.shared.statuses.lock();
        if statuses.contains_key(&rule_type) {
            tracing::debug!(id = self.id, %rule_type, "Already subscribed");
            return;
        }
        statuses.insert(rule_type, ClientStatus::default());
        drop(statuses);
        tracing::debug!(id = self.id, %rule_type, "Subscribed");

        // Catch up on the current state rather than waiting for the next
        // change.
        if let Some(origin) = self.registry.latest(rule_type) {
            let _ = self.origins.send(origin);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.registry.disconnect(self.id);
    }
}

// === impl Shared ===

impl Shared {
    pub(crate) fn new(endpoint: Endpoint, push_timeout: Duration, metrics: RegistryMetrics) -> Self {
        Self {
            endpoint,
            statuses: Mutex::default(),
            acked: Notify::new(),
            push_timeout,
            metrics,
        }
    }

    fn ack(&self, rule_type: RuleType, nonce: &str) {
        let mut statuses = self.statuses.lock();
        let Some(status) = statuses.get_mut(&rule_type) else {
            tracing::warn!(%rule_type, %nonce, "Ignoring ack for unsubscribed rule type");
            return;
        };
        if !status.pushing {
            tracing::debug!(%rule_type, %nonce, "Ignoring ack with no push in flight");
            return;
        }
        let Some(pushed) = status.last_pushed.as_ref().filter(|p| p.nonce == nonce) else {
            tracing::warn!(%rule_type, %nonce, "Ignoring ack with unexpected nonce");
            return;
        };
        tracing::debug!(%rule_type, %nonce, revision = pushed.version.revision, "Acknowledged");
        status.client_version = pushed.version.clone();
        status.pushing = false;
        drop(statuses);
        self.acked.notify_waiters();
    }

    /// Returns true if the client is subscribed to the rendered type and does
    /// not already have it.
    fn wants(&self, to_client: &ToClient) -> bool {
        self.statuses
            .lock()
            .get(&to_client.rule_type)
            .is_some_and(|s| !s.client_version.covers(to_client))
    }

    /// Marks a push of `to_client` as in flight, returning the response to
    /// send. Returns `None` if the push has become unnecessary.
    fn begin_push(&self, to_client: ToClient) -> Option<ObserveResponse> {
        let mut statuses = self.statuses.lock();
        let status = statuses.get_mut(&to_client.rule_type)?;
        if status.client_version.covers(&to_client) {
            return None;
        }
        status.nonce_inc += 1;
        let nonce = status.nonce_inc.to_string();
        status.pushing = true;
        status.last_pushed = Some(Pushed {
            version: Version {
                revision: to_client.revision,
                data: to_client.data.clone(),
            },
            nonce: nonce.clone(),
            at: Instant::now(),
        });
        Some(ObserveResponse {
            nonce,
            rule_type: to_client.rule_type,
            revision: to_client.revision,
            data: to_client.data,
        })
    }

    /// The time at which the in-flight push of `rule_type` expires, if any.
    fn push_deadline(&self, rule_type: RuleType) -> Option<Instant> {
        let statuses = self.statuses.lock();
        let status = statuses.get(&rule_type).filter(|s| s.pushing)?;
        status.last_pushed.as_ref().map(|p| p.at + self.push_timeout)
    }

    /// The earliest expiry among all in-flight pushes.
    fn next_deadline(&self) -> Option<Instant> {
        let statuses = self.statuses.lock();
        statuses
            .values()
            .filter(|s| s.pushing)
            .filter_map(|s| s.last_pushed.as_ref().map(|p| p.at + self.push_timeout))
            .min()
    }

    /// Resets an in-flight push of `rule_type` that has outlived the push
    /// timeout. Returns true if the push was reset.
    fn expire(&self, rule_type: RuleType) -> bool {
        let now = Instant::now();
        let mut statuses = self.statuses.lock();
        let Some(status) = statuses.get_mut(&rule_type) else {
            return false;
        };
        let expired = status.pushing
            && status
                .last_pushed
                .as_ref()
                .is_some_and(|p| p.at + self.push_timeout <= now);
        if expired {
            let nonce = status.last_pushed.as_ref().map(|p| p.nonce.as_str());
            tracing::warn!(%rule_type, ?nonce, "Push was not acknowledged in time");
            status.pushing = false;
            self.metrics.push_timed_out(rule_type);
        }
        expired
    }

    /// Waits until no push of `rule_type` is in flight. Returns false if the
    /// in-flight push had to be expired.
    async fn await_ack(&self, rule_type: RuleType) -> bool {
        loop {
            let notified = self.acked.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some(deadline) = self.push_deadline(rule_type) else {
                return true;
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = time::sleep_until(deadline) => {
                    if self.expire(rule_type) {
                        return false;
                    }
                }
            }
        }
    }
}

// === impl Worker ===

impl Worker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        registry: ConnectionRegistry,
        origins: mpsc::UnboundedReceiver<Arc<dyn Origin>>,
        responses: mpsc::Sender<ObserveResponse>,
    ) -> Self {
        Self {
            shared,
            registry,
            origins,
            responses,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let deadline = self.shared.next_deadline();
            let res = tokio::select! {
                origin = self.origins.recv() => match origin {
                    Some(origin) => self.dispatch(origin).await,
                    None => break,
                },
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.redispatch_expired().await
                },
                _ = self.responses.closed() => break,
            };
            if res.is_err() {
                break;
            }
        }
        tracing::debug!("Push worker finished");
    }

    /// Pushes `origin` once no other push of its type is in flight.
    async fn dispatch(&self, mut origin: Arc<dyn Origin>) -> Result<(), Closed> {
        let rule_type = origin.rule_type();
        loop {
            let to_client = match origin.exact(&self.shared.endpoint) {
                Ok(to_client) => to_client,
                Err(error) => {
                    tracing::warn!(%rule_type, %error, "Failed to render rules");
                    return Ok(());
                }
            };
            if !self.shared.wants(&to_client) {
                tracing::trace!(%rule_type, revision = to_client.revision, "Skipping push");
                return Ok(());
            }

            let acked = tokio::select! {
                acked = self.shared.await_ack(rule_type) => acked,
                _ = self.responses.closed() => return Err(Closed),
            };
            if !acked {
                // The lost push may have carried a newer revision than the
                // one being dispatched.
                if let Some(latest) = self.registry.latest(rule_type) {
                    if latest.revision() > origin.revision() {
                        origin = latest;
                    }
                }
                continue;
            }

            let Some(rsp) = self.shared.begin_push(to_client) else {
                return Ok(());
            };
            tracing::debug!(%rule_type, nonce = %rsp.nonce, revision = rsp.revision, "Pushing");
            self.responses.send(rsp).await.map_err(|_| Closed)?;
            self.shared.metrics.pushed(rule_type);
            return Ok(());
        }
    }

    async fn redispatch_expired(&self) -> Result<(), Closed> {
        for rule_type in RuleType::ALL {
            if self.shared.expire(rule_type) {
                if let Some(origin) = self.registry.latest(rule_type) {
                    self.dispatch(origin).await?;
                }
            }
        }
        Ok(())
    }
}

// === impl ClientStatus ===

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            pushing: false,
            nonce_inc: 0,
            client_version: Version {
                revision: -1,
                data: String::new(),
            },
            last_pushed: None,
        }
    }
}

// === impl Version ===

impl Version {
    fn covers(&self, to_client: &ToClient) -> bool {
        self.data == to_client.data || self.revision >= to_client.revision
    }
}
