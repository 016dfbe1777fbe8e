use super::link::{BrokerLink, Connector, Credentials, Endpoint, InboundMessage};
use super::topic::{Channel, Namespace, TopicAddress, TopicFilter};
use crate::command::{Command, CommandEnvelope};
use crate::error::{BusError, BusResult, ValidationError};
use crate::telemetry::{TelemetryRecord, Validator};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        write!(f, "{}", s)
    }
}

/// Things worth recording that are not the outcome of any single call.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// An inbound message was dropped before reaching any consumer.
    ValidationFailed {
        topic: String,
        error: ValidationError,
    },
    /// The broker link went away without `disconnect` being called.
    LinkLost { reason: String },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub validation_failures: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// A validated reading together with the topic it arrived on
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub address: TopicAddress,
    pub record: TelemetryRecord,
}

#[derive(Default)]
struct SessionStats {
    sent: AtomicU64,
    received: AtomicU64,
    validation_failures: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl SessionStats {
    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }
}

struct SessionInner {
    state: ConnectionState,
    link: Option<Arc<dyn BrokerLink>>,
    /// Bumped by every connect and disconnect so late completions can tell
    /// they were superseded.
    epoch: u64,
}

struct SessionCore {
    connector: Arc<dyn Connector>,
    namespace: Namespace,
    validator: Validator,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<BusEvent>,
    stats: SessionStats,
}

impl SessionCore {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut SessionInner, state: ConnectionState) {
        if inner.state != state {
            debug!(from = %inner.state, to = %state, "session state change");
        }
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn connected_link(&self) -> BusResult<Arc<dyn BrokerLink>> {
        let inner = self.lock();
        match (&inner.state, &inner.link) {
            (ConnectionState::Connected, Some(link)) => Ok(link.clone()),
            _ => Err(BusError::NotConnected(inner.state)),
        }
    }

    fn emit(&self, event: BusEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Turns one raw message into a typed item or records why it was dropped.
    fn accept<T>(&self, message: &InboundMessage, decode: Decoder<T>) -> Option<T> {
        let outcome = self
            .namespace
            .parse(&message.topic)
            .and_then(|address| decode(&self.validator, address, &message.payload));

        match outcome {
            Ok(item) => {
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                self.stats.touch();
                Some(item)
            }
            Err(error) => {
                self.stats.validation_failures.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %message.topic, %error, "dropping invalid message");
                self.emit(BusEvent::ValidationFailed {
                    topic: message.topic.clone(),
                    error,
                });
                None
            }
        }
    }
}

type Decoder<T> = fn(&Validator, TopicAddress, &[u8]) -> Result<T, ValidationError>;

fn decode_telemetry(
    validator: &Validator,
    address: TopicAddress,
    payload: &[u8],
) -> Result<Telemetry, ValidationError> {
    if address.channel() != Channel::Telemetry {
        return Err(ValidationError::new("topic", "not a telemetry topic"));
    }
    let mut record = validator.validate_bytes(payload)?;
    record.ingestion_time = Some(Utc::now());
    Ok(Telemetry { address, record })
}

fn decode_command(
    _validator: &Validator,
    address: TopicAddress,
    payload: &[u8],
) -> Result<Command, ValidationError> {
    if address.channel() != Channel::Command {
        return Err(ValidationError::new("topic", "not a command topic"));
    }
    let envelope = CommandEnvelope::from_payload(payload)?;
    Ok(Command { address, envelope })
}

/// Push-based stream of validated messages for one subscription.
///
/// Invalid messages never come out of [`recv`](Subscription::recv); they are
/// counted and broadcast as [`BusEvent::ValidationFailed`] instead. The
/// stream ends when the session disconnects or the link is lost.
pub struct Subscription<T> {
    filter: String,
    receiver: mpsc::UnboundedReceiver<InboundMessage>,
    core: Arc<SessionCore>,
    decode: Decoder<T>,
}

pub type TelemetrySubscription = Subscription<Telemetry>;
pub type CommandSubscription = Subscription<Command>;

impl<T> Subscription<T> {
    /// Broker filter this subscription was registered with.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub async fn recv(&mut self) -> Option<T> {
        while let Some(message) = self.receiver.recv().await {
            if let Some(item) = self.core.accept(&message, self.decode) {
                return Some(item);
            }
        }
        None
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .finish()
    }
}

/// One logical connection to the broker.
///
/// ```text
/// disconnected ──connect──► connecting ──CONNACK──► connected
///      ▲                        │                       │
///      └────── failure ─────────┘                       │
///      └──────────── disconnect / link lost ────────────┘
/// ```
///
/// Cloning yields another handle to the same session. The broker link is
/// owned here and never handed out; publish and subscribe calls outside
/// `connected` fail with [`BusError::NotConnected`] instead of queuing.
#[derive(Clone)]
pub struct TransportSession {
    core: Arc<SessionCore>,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("state", &self.state())
            .field("root", &self.core.namespace.root())
            .finish()
    }
}

impl TransportSession {
    pub fn new(connector: Arc<dyn Connector>, namespace: Namespace, validator: Validator) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            core: Arc::new(SessionCore {
                connector,
                namespace,
                validator,
                inner: Mutex::new(SessionInner {
                    state: ConnectionState::Disconnected,
                    link: None,
                    epoch: 0,
                }),
                state_tx,
                events,
                stats: SessionStats::default(),
            }),
        }
    }

    /// Session under the `ecos` root with the default validator.
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self::new(connector, Namespace::default(), Validator::default())
    }

    pub fn namespace(&self) -> &Namespace {
        &self.core.namespace
    }

    pub fn validator(&self) -> &Validator {
        &self.core.validator
    }

    pub fn state(&self) -> ConnectionState {
        self.core.lock().state
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.core.events.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        let stats = &self.core.stats;
        SessionStatus {
            connection_state: self.state(),
            messages_sent: stats.sent.load(Ordering::Relaxed),
            messages_received: stats.received.load(Ordering::Relaxed),
            validation_failures: stats.validation_failures.load(Ordering::Relaxed),
            last_activity: *stats
                .last_activity
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Performs exactly one handshake. Only allowed from `disconnected`;
    /// failures leave the session `disconnected` and are never retried here.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> BusResult<()> {
        let epoch = {
            let mut inner = self.core.lock();
            if inner.state != ConnectionState::Disconnected {
                return Err(BusError::Connection(format!(
                    "session is already {}",
                    inner.state
                )));
            }
            inner.epoch += 1;
            self.core.set_state(&mut inner, ConnectionState::Connecting);
            inner.epoch
        };

        info!(%endpoint, "connecting transport session");
        let link = match self.core.connector.connect(endpoint, credentials).await {
            Ok(link) => link,
            Err(e) => {
                let mut inner = self.core.lock();
                if inner.epoch == epoch {
                    self.core.set_state(&mut inner, ConnectionState::Disconnected);
                }
                warn!(%endpoint, error = %e, "connect failed");
                return Err(e);
            }
        };

        let superseded = {
            let mut inner = self.core.lock();
            if inner.epoch == epoch {
                inner.link = Some(link.clone());
                self.core.set_state(&mut inner, ConnectionState::Connected);
                false
            } else {
                true
            }
        };
        if superseded {
            link.disconnect().await;
            return Err(BusError::Connection(
                "session was disconnected while connecting".to_string(),
            ));
        }

        self.spawn_link_monitor(link, epoch);
        info!(%endpoint, "transport session connected");
        Ok(())
    }

    fn spawn_link_monitor(&self, link: Arc<dyn BrokerLink>, epoch: u64) {
        let core = self.core.clone();
        tokio::spawn(async move {
            link.closed().await;
            let lost = {
                let mut inner = core.lock();
                if inner.epoch == epoch && inner.state == ConnectionState::Connected {
                    inner.link = None;
                    core.set_state(&mut inner, ConnectionState::Disconnected);
                    true
                } else {
                    false
                }
            };
            if lost {
                let reason = "broker link closed unexpectedly".to_string();
                warn!(%reason, "transport session lost its link");
                core.emit(BusEvent::LinkLost { reason });
            }
        });
    }

    /// Moves to `disconnected` from any state and releases every
    /// subscription. A `connect` still in flight fails.
    pub async fn disconnect(&self) {
        let link = {
            let mut inner = self.core.lock();
            inner.epoch += 1;
            self.core.set_state(&mut inner, ConnectionState::Disconnected);
            inner.link.take()
        };
        if let Some(link) = link {
            link.disconnect().await;
            info!("transport session disconnected");
        }
    }

    /// Validates the wire form of `record` and publishes it on the device's
    /// telemetry topic.
    /// Resolves once the broker acknowledged receipt; an error means the
    /// message may or may not have arrived and the call may be retried.
    pub async fn publish_telemetry(
        &self,
        project_code: &str,
        device_id: &str,
        record: &TelemetryRecord,
    ) -> BusResult<()> {
        let payload = self.core.validator.encode(record)?;
        if record.ingestion_time.is_some() {
            return Err(ValidationError::new(
                "ingestionTime",
                "assigned by the receiving side, producers must leave it unset",
            )
            .into());
        }
        let address = TopicAddress::telemetry(project_code, device_id)?;
        self.publish(&address, payload).await
    }

    pub(crate) async fn publish_command(
        &self,
        address: &TopicAddress,
        envelope: &CommandEnvelope,
    ) -> BusResult<()> {
        let payload = serde_json::to_vec(envelope)?;
        self.publish(address, payload).await
    }

    async fn publish(&self, address: &TopicAddress, payload: Vec<u8>) -> BusResult<()> {
        let link = self.core.connected_link()?;
        let topic = self.core.namespace.topic(address);
        debug!(%topic, bytes = payload.len(), "publishing");
        link.publish(&topic, payload).await?;
        self.core.stats.sent.fetch_add(1, Ordering::Relaxed);
        self.core.stats.touch();
        Ok(())
    }

    /// Telemetry of one device, in broker order.
    pub async fn subscribe(
        &self,
        project_code: &str,
        device_id: &str,
    ) -> BusResult<TelemetrySubscription> {
        let address = TopicAddress::telemetry(project_code, device_id)?;
        self.subscribe_filter(&TopicFilter::device(&address)).await
    }

    /// Telemetry for a whole project or the whole fleet.
    pub async fn subscribe_filter(&self, filter: &TopicFilter) -> BusResult<TelemetrySubscription> {
        if filter.channel() != Channel::Telemetry {
            return Err(ValidationError::new("channel", "expected the telemetry channel").into());
        }
        self.register(filter, decode_telemetry).await
    }

    /// Callback form of [`subscribe`](Self::subscribe): `handler` runs on a
    /// worker task, one record at a time, until the subscription ends.
    pub async fn subscribe_with<F>(
        &self,
        project_code: &str,
        device_id: &str,
        mut handler: F,
    ) -> BusResult<JoinHandle<()>>
    where
        F: FnMut(Telemetry) + Send + 'static,
    {
        let mut subscription = self.subscribe(project_code, device_id).await?;
        Ok(tokio::spawn(async move {
            while let Some(telemetry) = subscription.recv().await {
                handler(telemetry);
            }
            debug!(filter = subscription.filter(), "subscription worker finished");
        }))
    }

    /// Device-side stream of commands addressed to `device_id`.
    pub async fn subscribe_commands(
        &self,
        project_code: &str,
        device_id: &str,
    ) -> BusResult<CommandSubscription> {
        let address = TopicAddress::command(project_code, device_id)?;
        self.register(&TopicFilter::device(&address), decode_command)
            .await
    }

    async fn register<T>(&self, filter: &TopicFilter, decode: Decoder<T>) -> BusResult<Subscription<T>> {
        let link = self.core.connected_link()?;
        let filter = self.core.namespace.filter(filter);
        let receiver = link.subscribe(&filter).await?;
        info!(%filter, "subscribed");
        Ok(Subscription {
            filter,
            receiver,
            core: self.core.clone(),
            decode,
        })
    }
}
