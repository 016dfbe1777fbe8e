//! MQTT broker link on top of rumqttc
//!
//! # Handshake
//!
//! ```text
//! Dialing ──(CONNACK success)──► Established ──► MqttLink + driver task
//!    │
//!    └──(refused / network error)──► BusError::Connection
//! ```
//!
//! # Acknowledgments
//!
//! rumqttc resolves `AsyncClient::publish` as soon as the request is queued,
//! which is not what callers of the bus are promised. The driver task
//! therefore correlates packet ids itself:
//!
//! ```text
//! publish() ──► queue ack slot ──► client.publish ──► Outgoing::Publish(pkid)
//!                                                          │
//!                               ack slot resolved ◄── Incoming::PubAck(pkid)
//! ```
//!
//! Requests leave the client channel in the order they were queued, so slots
//! are queued under an ordering lock and bound to a pkid when the matching
//! `Outgoing` event shows up. SUBSCRIBE/SUBACK use the same scheme.
//!
//! Dropping the last local receiver for a filter sends UNSUBSCRIBE so the
//! broker stops forwarding it.
//!
//! When the event loop fails, every pending slot is failed with
//! `BusError::Connection`, local subscriptions are dropped and the link
//! reports itself closed. The event loop is not polled again, which is what
//! keeps rumqttc from reconnecting behind the session's back.

use super::link::{BrokerLink, Connector, Credentials, Endpoint, InboundMessage};
use super::topic;
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use statum::{machine, state};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MIN_KEEP_ALIVE_SECS: u64 = 5;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub client_id: String,
    pub keep_alive: Duration,
    /// Capacity of the request channel between client handle and event loop
    pub request_capacity: usize,
    pub clean_session: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            client_id: "ecos-gateway".to_string(),
            keep_alive: Duration::from_secs(60),
            request_capacity: 100,
            clean_session: true,
        }
    }
}

type AckSlot = oneshot::Sender<BusResult<()>>;

/// Matches queued ack slots to packet ids and packet ids to broker acks.
#[derive(Default)]
struct AckTracker {
    queued_publishes: VecDeque<AckSlot>,
    queued_subscribes: VecDeque<AckSlot>,
    inflight_publishes: HashMap<u16, AckSlot>,
    inflight_subscribes: HashMap<u16, AckSlot>,
}

impl AckTracker {
    fn on_outgoing_publish(&mut self, pkid: u16) {
        match self.queued_publishes.pop_front() {
            Some(slot) => {
                self.inflight_publishes.insert(pkid, slot);
            }
            None => warn!(pkid, "outgoing publish without a waiting caller"),
        }
    }

    fn on_puback(&mut self, pkid: u16) {
        if let Some(slot) = self.inflight_publishes.remove(&pkid) {
            // The caller may have given up waiting; that is not an error here.
            let _ = slot.send(Ok(()));
        }
    }

    fn on_outgoing_subscribe(&mut self, pkid: u16) {
        match self.queued_subscribes.pop_front() {
            Some(slot) => {
                self.inflight_subscribes.insert(pkid, slot);
            }
            None => warn!(pkid, "outgoing subscribe without a waiting caller"),
        }
    }

    fn on_suback(&mut self, pkid: u16, outcome: BusResult<()>) {
        if let Some(slot) = self.inflight_subscribes.remove(&pkid) {
            let _ = slot.send(outcome);
        }
    }

    fn fail_all(&mut self, reason: &str) {
        let slots = self
            .queued_publishes
            .drain(..)
            .chain(self.queued_subscribes.drain(..))
            .chain(self.inflight_publishes.drain().map(|(_, slot)| slot))
            .chain(self.inflight_subscribes.drain().map(|(_, slot)| slot));
        for slot in slots {
            let _ = slot.send(Err(BusError::Connection(reason.to_string())));
        }
    }

    fn pending(&self) -> usize {
        self.queued_publishes.len()
            + self.queued_subscribes.len()
            + self.inflight_publishes.len()
            + self.inflight_subscribes.len()
    }
}

struct Route {
    id: u64,
    filter: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct LinkState {
    acks: AckTracker,
    routes: Vec<Route>,
    next_route_id: u64,
    closed_reason: Option<String>,
}

impl LinkState {
    fn dispatch(&mut self, message: InboundMessage) {
        let mut delivered = false;
        self.routes.retain(|route| {
            if !topic::matches(&route.filter, &message.topic) {
                return true;
            }
            delivered = true;
            route.sender.send(message.clone()).is_ok()
        });
        if !delivered {
            debug!(topic = %message.topic, "inbound message matched no local subscription");
        }
    }

    /// Drops one route and returns its filter when no other route still uses
    /// it, meaning the broker-side subscription can go.
    fn release_route(&mut self, route_id: u64) -> Option<String> {
        let index = self.routes.iter().position(|route| route.id == route_id)?;
        let route = self.routes.remove(index);
        if self.routes.iter().any(|other| other.filter == route.filter) {
            None
        } else {
            Some(route.filter)
        }
    }
}

struct LinkShared {
    state: Mutex<LinkState>,
    closed: CancellationToken,
    /// Keeps ack slots queued in the same order as requests enter the client
    request_order: tokio::sync::Mutex<()>,
}

impl LinkShared {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutdown(&self, reason: &str) {
        {
            let mut state = self.lock();
            if state.closed_reason.is_none() {
                state.closed_reason = Some(reason.to_string());
            }
            let pending = state.acks.pending();
            if pending > 0 {
                warn!(pending, reason, "failing unacknowledged requests");
            }
            state.acks.fail_all(reason);
            state.routes.clear();
        }
        self.closed.cancel();
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum HandshakeState {
    Dialing,
    Established,
}

/// Connection attempt with the CONNACK wait encoded in the type
#[machine]
pub struct MqttHandshake<S: HandshakeState> {
    client: AsyncClient,
    eventloop: EventLoop,
    endpoint: Endpoint,
}

impl MqttHandshake<Dialing> {
    pub fn dial(
        settings: &MqttSettings,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> Self {
        let keep_alive = settings
            .keep_alive
            .max(Duration::from_secs(MIN_KEEP_ALIVE_SECS));
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            endpoint.host.clone(),
            endpoint.port,
        );
        options
            .set_keep_alive(keep_alive)
            .set_clean_session(settings.clean_session);
        if let Some(credentials) = credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, settings.request_capacity);
        info!(%endpoint, client_id = %settings.client_id, "dialing MQTT broker");
        Self::new(client, eventloop, endpoint.clone())
    }

    /// Polls the event loop until the broker answers the CONNECT.
    pub async fn await_connack(mut self) -> BusResult<MqttHandshake<Established>> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!(endpoint = %self.endpoint, "connected to MQTT broker");
                        return Ok(self.transition());
                    }
                    return Err(BusError::Connection(format!(
                        "broker at {} refused connection: {:?}",
                        self.endpoint, ack.code
                    )));
                }
                Ok(event) => debug!(?event, "event before CONNACK"),
                Err(e) => {
                    return Err(BusError::Connection(format!(
                        "failed to connect to broker at {}: {}",
                        self.endpoint, e
                    )));
                }
            }
        }
    }
}

impl MqttHandshake<Established> {
    /// Hands the event loop to a driver task and returns the link.
    pub fn into_link(self) -> Arc<dyn BrokerLink> {
        let shared = Arc::new(LinkShared {
            state: Mutex::new(LinkState::default()),
            closed: CancellationToken::new(),
            request_order: tokio::sync::Mutex::new(()),
        });
        let endpoint = self.endpoint;
        tokio::spawn(drive(self.eventloop, shared.clone(), endpoint.clone()));

        Arc::new(MqttLink {
            client: self.client,
            shared,
            endpoint,
        })
    }
}

async fn drive(mut eventloop: EventLoop, shared: Arc<LinkShared>, endpoint: Endpoint) {
    let reason = loop {
        tokio::select! {
            _ = shared.closed.cancelled() => {
                break "link closed locally".to_string();
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(topic = %publish.topic, bytes = publish.payload.len(), "inbound publish");
                    shared.lock().dispatch(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => shared.lock().acks.on_puback(ack.pkid),
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let granted = ack
                        .return_codes
                        .iter()
                        .all(|code| !matches!(code, SubscribeReasonCode::Failure));
                    let outcome = if granted {
                        Ok(())
                    } else {
                        Err(BusError::Connection("broker refused subscription".to_string()))
                    };
                    shared.lock().acks.on_suback(ack.pkid, outcome);
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    shared.lock().acks.on_outgoing_publish(pkid)
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    shared.lock().acks.on_outgoing_subscribe(pkid)
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    break "disconnected".to_string();
                }
                Ok(_) => {}
                Err(e) => {
                    error!(%endpoint, error = %e, "MQTT event loop failed");
                    break format!("connection to {} lost: {}", endpoint, e);
                }
            }
        }
    };

    shared.shutdown(&reason);
    info!(%endpoint, reason = %reason, "MQTT driver stopped");
}

/// Sends UNSUBSCRIBE once the receiver of the last route for a filter is
/// gone. Nothing to do after the link closed.
async fn unsubscribe_when_dropped(
    shared: Arc<LinkShared>,
    client: AsyncClient,
    route_id: u64,
    watcher: mpsc::UnboundedSender<InboundMessage>,
) {
    tokio::select! {
        _ = shared.closed.cancelled() => return,
        _ = watcher.closed() => {}
    }
    let _order = shared.request_order.lock().await;
    let released = {
        let mut state = shared.lock();
        if state.closed_reason.is_some() {
            return;
        }
        state.release_route(route_id)
    };
    if let Some(filter) = released {
        match client.unsubscribe(filter.as_str()).await {
            Ok(()) => debug!(%filter, "last local route dropped, unsubscribed"),
            Err(e) => debug!(%filter, error = %e, "unsubscribe not delivered to event loop"),
        }
    }
}

pub struct MqttLink {
    client: AsyncClient,
    shared: Arc<LinkShared>,
    endpoint: Endpoint,
}

impl MqttLink {
    fn closed_error(&self, state: &LinkState) -> BusError {
        BusError::Connection(
            state
                .closed_reason
                .clone()
                .unwrap_or_else(|| format!("link to {} is closed", self.endpoint)),
        )
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BusResult<()> {
        let (slot, ack) = oneshot::channel();
        {
            let _order = self.shared.request_order.lock().await;
            {
                let mut state = self.shared.lock();
                if state.closed_reason.is_some() {
                    return Err(self.closed_error(&state));
                }
                state.acks.queued_publishes.push_back(slot);
            }
            if let Err(e) = self
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                self.shared.lock().acks.queued_publishes.pop_back();
                return Err(BusError::Connection(format!(
                    "failed to queue publish on {}: {}",
                    topic, e
                )));
            }
        }

        ack.await.unwrap_or_else(|_| {
            Err(BusError::Connection(
                "link closed before the broker acknowledged the publish".to_string(),
            ))
        })
    }

    async fn subscribe(&self, filter: &str) -> BusResult<mpsc::UnboundedReceiver<InboundMessage>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let watcher = sender.clone();
        let (slot, ack) = oneshot::channel();
        let route_id = {
            let _order = self.shared.request_order.lock().await;
            let route_id = {
                let mut state = self.shared.lock();
                if state.closed_reason.is_some() {
                    return Err(self.closed_error(&state));
                }
                let route_id = state.next_route_id;
                state.next_route_id += 1;
                // Route first so nothing published right after SUBACK is missed.
                state.routes.push(Route {
                    id: route_id,
                    filter: filter.to_string(),
                    sender,
                });
                state.acks.queued_subscribes.push_back(slot);
                route_id
            };
            if let Err(e) = self.client.subscribe(filter, QoS::AtLeastOnce).await {
                let mut state = self.shared.lock();
                state.acks.queued_subscribes.pop_back();
                state.routes.retain(|route| route.id != route_id);
                return Err(BusError::Connection(format!(
                    "failed to queue subscribe for {}: {}",
                    filter, e
                )));
            }
            route_id
        };

        let outcome = ack.await.unwrap_or_else(|_| {
            Err(BusError::Connection(
                "link closed before the broker acknowledged the subscription".to_string(),
            ))
        });
        match outcome {
            Ok(()) => {
                debug!(filter, "subscription granted");
                tokio::spawn(unsubscribe_when_dropped(
                    self.shared.clone(),
                    self.client.clone(),
                    route_id,
                    watcher,
                ));
                Ok(receiver)
            }
            Err(e) => {
                self.shared.lock().routes.retain(|route| route.id != route_id);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect request not delivered to event loop");
        }
        // Give the driver a moment to flush DISCONNECT, then stop it regardless.
        if tokio::time::timeout(DISCONNECT_GRACE, self.shared.closed.cancelled())
            .await
            .is_err()
        {
            warn!(endpoint = %self.endpoint, "driver did not stop in time, forcing close");
        }
        self.shared.shutdown("disconnected");
    }

    async fn closed(&self) {
        self.shared.closed.cancelled().await
    }
}

/// Connector producing [`MqttLink`]s
#[derive(Debug, Clone, Default)]
pub struct MqttConnector {
    settings: MqttSettings,
}

impl MqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> BusResult<Arc<dyn BrokerLink>> {
        let established = MqttHandshake::dial(&self.settings, endpoint, credentials)
            .await_connack()
            .await?;
        Ok(established.into_link())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> (AckSlot, oneshot::Receiver<BusResult<()>>) {
        oneshot::channel()
    }

    #[tokio::test]
    async fn test_publish_acks_resolve_by_pkid() {
        let mut tracker = AckTracker::default();
        let (first, first_rx) = slot();
        let (second, second_rx) = slot();
        tracker.queued_publishes.push_back(first);
        tracker.queued_publishes.push_back(second);

        tracker.on_outgoing_publish(7);
        tracker.on_outgoing_publish(8);
        // Broker acks out of order
        tracker.on_puback(8);
        tracker.on_puback(7);

        assert!(first_rx.await.unwrap().is_ok());
        assert!(second_rx.await.unwrap().is_ok());
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_unknown_puback_is_ignored() {
        let mut tracker = AckTracker::default();
        let (first, mut first_rx) = slot();
        tracker.queued_publishes.push_back(first);
        tracker.on_outgoing_publish(1);
        tracker.on_puback(99);
        assert!(first_rx.try_recv().is_err());
        assert_eq!(tracker.pending(), 1);
    }

    #[tokio::test]
    async fn test_refused_suback_fails_slot() {
        let mut tracker = AckTracker::default();
        let (sub, sub_rx) = slot();
        tracker.queued_subscribes.push_back(sub);
        tracker.on_outgoing_subscribe(3);
        tracker.on_suback(3, Err(BusError::Connection("refused".to_string())));
        assert!(matches!(sub_rx.await.unwrap(), Err(BusError::Connection(_))));
    }

    #[tokio::test]
    async fn test_fail_all_resolves_every_slot() {
        let mut tracker = AckTracker::default();
        let (queued, queued_rx) = slot();
        let (inflight, inflight_rx) = slot();
        let (sub, sub_rx) = slot();
        tracker.queued_publishes.push_back(inflight);
        tracker.on_outgoing_publish(1);
        tracker.queued_publishes.push_back(queued);
        tracker.queued_subscribes.push_back(sub);

        tracker.fail_all("connection lost");

        for rx in [queued_rx, inflight_rx, sub_rx] {
            match rx.await.unwrap() {
                Err(BusError::Connection(reason)) => assert_eq!(reason, "connection lost"),
                other => panic!("expected connection error, got {:?}", other),
            }
        }
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_dispatch_prunes_dropped_routes() {
        let mut state = LinkState::default();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        state.routes.push(Route { id: 0, filter: "ecos/+/+/telemetry".to_string(), sender: live_tx });
        state.routes.push(Route { id: 1, filter: "ecos/#".to_string(), sender: dead_tx });

        state.dispatch(InboundMessage {
            topic: "ecos/P13_HYDRO/hydro-1/telemetry".to_string(),
            payload: b"{}".to_vec(),
        });

        assert_eq!(state.routes.len(), 1);
        assert_eq!(live_rx.try_recv().unwrap().topic, "ecos/P13_HYDRO/hydro-1/telemetry");
    }

    #[test]
    fn test_release_route_reports_last_user_of_filter() {
        let mut state = LinkState::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        for id in 0..2 {
            state.routes.push(Route { id, filter: "ecos/P13_HYDRO/+/telemetry".to_string(), sender: tx.clone() });
        }
        state.routes.push(Route { id: 2, filter: "ecos/#".to_string(), sender: tx });

        assert_eq!(state.release_route(0), None);
        assert_eq!(state.release_route(0), None);
        assert_eq!(state.release_route(1).as_deref(), Some("ecos/P13_HYDRO/+/telemetry"));
        assert_eq!(state.release_route(2).as_deref(), Some("ecos/#"));
        assert!(state.routes.is_empty());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let connector = MqttConnector::default();
        let err = connector
            .connect(&Endpoint::new("127.0.0.1", 1), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BusError::Connection(_)));
    }
}
