//! In-process broker.
//!
//! [`MemoryBroker`] implements [`Connector`] with the same observable
//! contract as the MQTT link: per-topic FIFO delivery, `+`/`#` filters,
//! acknowledgment once a message has been routed, optional credential check.
//! It backs the test suite, the simulator and the `memory://` endpoint.
//!
//! Failure switches:
//! - [`MemoryBroker::set_reachable`] makes new handshakes fail
//! - [`MemoryBroker::drop_connections`] kills every live link as if the
//!   broker went away
//!
//! Only the last [`DEFAULT_HISTORY_LIMIT`] routed messages are kept for
//! inspection unless [`MemoryBroker::with_history_limit`] says otherwise.

use super::link::{BrokerLink, Connector, Credentials, Endpoint, InboundMessage};
use super::topic;
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Routed messages kept for [`MemoryBroker::published`] by default
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

struct MemorySubscription {
    link_id: u64,
    filter: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

struct BrokerState {
    credentials: Option<Credentials>,
    reachable: bool,
    next_link_id: u64,
    links: HashMap<u64, CancellationToken>,
    subscriptions: Vec<MemorySubscription>,
    published: VecDeque<InboundMessage>,
    history_limit: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            credentials: None,
            reachable: true,
            next_link_id: 0,
            links: HashMap::new(),
            subscriptions: Vec::new(),
            published: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl BrokerState {
    fn route(&mut self, message: InboundMessage) {
        // Closed receivers are pruned on the way.
        self.subscriptions.retain(|sub| {
            if !topic::matches(&sub.filter, &message.topic) {
                return true;
            }
            sub.sender.send(message.clone()).is_ok()
        });
        if self.history_limit == 0 {
            return;
        }
        if self.published.len() == self.history_limit {
            self.published.pop_front();
        }
        self.published.push_back(message);
    }

    fn close_link(&mut self, link_id: u64) {
        self.subscriptions.retain(|sub| sub.link_id != link_id);
        if let Some(token) = self.links.remove(&link_id) {
            token.cancel();
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handshakes must present exactly these credentials.
    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.lock().credentials = Some(credentials);
        self
    }

    /// Keeps at most `limit` routed messages; `0` disables the history.
    pub fn with_history_limit(self, limit: usize) -> Self {
        {
            let mut state = self.lock();
            state.history_limit = limit;
            while state.published.len() > limit {
                state.published.pop_front();
            }
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.links.keys().copied().collect();
        warn!(links = ids.len(), "memory broker dropping all connections");
        for id in ids {
            state.close_link(id);
        }
    }

    /// Publishes as an anonymous outside client, bypassing any validation.
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.lock().route(InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        });
    }

    /// The most recently routed messages, oldest first.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.lock().published.iter().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().links.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBroker")
            .field("links", &state.links.len())
            .field("subscriptions", &state.subscriptions.len())
            .field("published", &state.published.len())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> BusResult<Arc<dyn BrokerLink>> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(BusError::Connection(format!(
                "broker at {} is unreachable",
                endpoint
            )));
        }
        if let Some(expected) = &state.credentials {
            if credentials != Some(expected) {
                return Err(BusError::Connection(
                    "broker rejected credentials: not authorized".to_string(),
                ));
            }
        }

        let id = state.next_link_id;
        state.next_link_id += 1;
        let closed = CancellationToken::new();
        state.links.insert(id, closed.clone());
        info!(link_id = id, %endpoint, "memory broker accepted connection");

        Ok(Arc::new(MemoryLink {
            broker: self.clone(),
            id,
            closed,
        }))
    }
}

struct MemoryLink {
    broker: MemoryBroker,
    id: u64,
    closed: CancellationToken,
}

impl MemoryLink {
    fn ensure_open(&self, state: &BrokerState) -> BusResult<()> {
        if self.closed.is_cancelled() || !state.links.contains_key(&self.id) {
            return Err(BusError::Connection("memory link is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BusResult<()> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        debug!(link_id = self.id, topic, bytes = payload.len(), "memory publish");
        state.route(InboundMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> BusResult<mpsc::UnboundedReceiver<InboundMessage>> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscriptions.push(MemorySubscription {
            link_id: self.id,
            filter: filter.to_string(),
            sender,
        });
        debug!(link_id = self.id, filter, "memory subscribe");
        Ok(receiver)
    }

    async fn disconnect(&self) {
        self.broker.lock().close_link(self.id);
        self.closed.cancel();
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }
}
