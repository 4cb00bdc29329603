//! MQTT client state machine.
//!
//! A client lives on one node and talks to the broker through its radio:
//! every outgoing packet becomes a [`Frame`] handed to the radio entity, and
//! every packet the radio receives arrives as [`EventPayload::FrameReceived`].
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED
//!                     ^             |  MAC drops, supervision timeout,
//!                     |             v  keep-alive timeout, broker reset
//!                     +------ RECONNECTING (backoff)
//! ```

use crate::{Backoff, RetryPolicy};
use mqsim_common::{
    ClientCommand, ClientState, DisconnectCause, Entity, EntityId, Event, EventPayload, Frame,
    FrameId, LossReason, Message, MessageKey, NodeId, Observation, Packet, QoS, SimContext,
    SimError, SimTime, TimerHandle, Will,
};
use mqsim_metrics::{metric_defs, metrics, MetricLabels};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, trace};

// ============================================================================
// Configuration
// ============================================================================

/// Periodic sensor readings published by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Topic name.
    pub topic: String,
    /// Delivery guarantee.
    pub qos: QoS,
    /// Mean time between readings.
    pub interval: SimTime,
    /// Standard deviation of the reading interval, in seconds.
    pub interval_jitter_s: f64,
    /// Payload length in bytes.
    pub payload_bytes: u32,
    /// Retain flag.
    pub retain: bool,
}

/// Client parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Node name, used in logs and metric labels.
    pub name: String,
    /// Technology label for metrics.
    pub phy: String,
    /// MQTT client identifier.
    pub client_id: String,
    /// Discard broker-side state on every connect.
    pub clean_session: bool,
    /// Keep-alive interval.
    pub keepalive: SimTime,
    /// Time to wait for PINGRESP.
    pub ping_timeout: SimTime,
    /// Time to wait for CONNACK.
    pub connect_timeout: SimTime,
    /// QoS1 retransmission policy.
    pub retry: RetryPolicy,
    /// Reconnect backoff.
    pub backoff: Backoff,
    /// Readings to publish, if any.
    pub publish: Option<PublishConfig>,
    /// Subscriptions sent after a connect without a resumed session.
    pub subscriptions: Vec<(String, QoS)>,
    /// Last will registered with every CONNECT.
    pub will: Option<Will>,
    /// Readings buffered while not connected; the oldest is evicted beyond this.
    pub outbox_capacity: usize,
    /// Consecutive MAC-level drops that count as a disconnect.
    pub mac_drop_threshold: u32,
}

impl ClientConfig {
    /// Defaults for a client named `name` on a `phy` radio.
    pub fn new(name: impl Into<String>, phy: impl Into<String>) -> Self {
        let name = name.into();
        ClientConfig {
            client_id: name.clone(),
            name,
            phy: phy.into(),
            clean_session: false,
            keepalive: SimTime::from_secs(30.0),
            ping_timeout: SimTime::from_secs(5.0),
            connect_timeout: SimTime::from_secs(3.0),
            retry: RetryPolicy::default(),
            backoff: Backoff::default(),
            publish: None,
            subscriptions: Vec::new(),
            will: None,
            outbox_capacity: 32,
            mac_drop_threshold: 3,
        }
    }
}

// Timer IDs
const TIMER_CONNECT_TIMEOUT: u64 = 1;
const TIMER_RECONNECT: u64 = 2;
const TIMER_KEEPALIVE: u64 = 3;
const TIMER_PING_TIMEOUT: u64 = 4;
const TIMER_PUBLISH: u64 = 5;
const TIMER_RETRANSMIT_BASE: u64 = 1 << 32;

/// An unacknowledged QoS1 message.
#[derive(Debug, Clone)]
struct Pending {
    message: Message,
    retries: u32,
    timer: Option<TimerHandle>,
}

fn fired(slot: &Option<TimerHandle>, event: &Event) -> bool {
    slot.is_some_and(|h| h.fired_by(event))
}

// ============================================================================
// Client Entity
// ============================================================================

/// MQTT client entity.
pub struct Client {
    id: EntityId,
    node: NodeId,
    radio: EntityId,
    config: ClientConfig,

    state: ClientState,
    stopped: bool,
    depleted: bool,

    next_frame: u64,
    next_seq: u32,
    reconnect_attempt: u32,
    mac_failures: u32,

    pending: BTreeMap<u32, Pending>,
    outbox: VecDeque<Message>,

    connect_timer: Option<TimerHandle>,
    reconnect_timer: Option<TimerHandle>,
    keepalive_timer: Option<TimerHandle>,
    ping_timer: Option<TimerHandle>,
    publish_timer: Option<TimerHandle>,

    metrics_labels: MetricLabels,
}

impl Client {
    /// Create a client for `node` transmitting through `radio`.
    pub fn new(id: EntityId, node: NodeId, radio: EntityId, config: ClientConfig) -> Self {
        let metrics_labels = MetricLabels::new(config.name.clone(), config.phy.clone());
        Client {
            id,
            node,
            radio,
            config,
            state: ClientState::Disconnected,
            stopped: true,
            depleted: false,
            next_frame: 0,
            next_seq: 1,
            reconnect_attempt: 0,
            mac_failures: 0,
            pending: BTreeMap::new(),
            outbox: VecDeque::new(),
            connect_timer: None,
            reconnect_timer: None,
            keepalive_timer: None,
            ping_timer: None,
            publish_timer: None,
            metrics_labels,
        }
    }

    /// Node this client runs on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connection state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// QoS1 messages waiting for PUBACK.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Readings buffered while offline.
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn set_state(&mut self, state: ClientState, cause: Option<DisconnectCause>, ctx: &mut SimContext) {
        if self.state == state && cause.is_none() {
            return;
        }
        self.state = state;
        ctx.emit(Observation::ClientState {
            node: self.node,
            state,
            cause,
        });
    }

    /// Hand a packet to the radio.
    fn send(&mut self, packet: Packet, ctx: &mut SimContext) {
        let frame = Frame {
            id: FrameId(self.next_frame),
            node: self.node,
            packet,
        };
        self.next_frame += 1;
        trace!(
            "Client[{}]: sending {} ({} bytes)",
            self.config.name,
            frame.packet.label(),
            frame.size_bytes()
        );
        ctx.post_immediate(vec![self.radio], EventPayload::RadioTxRequest(frame));
        if self.state == ClientState::Connected {
            self.rearm_keepalive(ctx);
        }
    }

    fn rearm_keepalive(&mut self, ctx: &mut SimContext) {
        ctx.cancel_slot(&mut self.keepalive_timer);
        self.keepalive_timer = Some(ctx.set_timer(self.config.keepalive, TIMER_KEEPALIVE));
    }

    /// Delay drawn from a normal distribution around `base`, never negative.
    fn jittered_delay(rng: &mut ChaCha8Rng, base: SimTime, jitter_s: f64) -> SimTime {
        let base_s = base.as_secs_f64();
        let delay = match Normal::new(base_s, jitter_s) {
            Ok(normal) if jitter_s > 0.0 => normal.sample(rng).max(0.0),
            _ => base_s,
        };
        SimTime::from_secs(delay)
    }

    fn cancel_session_timers(&mut self, ctx: &mut SimContext) {
        ctx.cancel_slot(&mut self.connect_timer);
        ctx.cancel_slot(&mut self.keepalive_timer);
        ctx.cancel_slot(&mut self.ping_timer);
        for pending in self.pending.values_mut() {
            ctx.cancel_slot(&mut pending.timer);
        }
    }

    fn record_lost(&mut self, key: MessageKey, reason: LossReason, ctx: &mut SimContext) {
        metrics::counter!(
            metric_defs::MQTT_LOST.name,
            &self.metrics_labels.to_labels()
        )
        .increment(1);
        ctx.emit(Observation::Lost { key, reason });
    }

    // ========================================================================
    // Connection
    // ========================================================================

    fn start(&mut self, ctx: &mut SimContext) {
        if !self.stopped {
            return;
        }
        self.stopped = false;
        if let Some(publish) = &self.config.publish {
            let delay =
                Self::jittered_delay(ctx.rng(), publish.interval, publish.interval_jitter_s);
            self.publish_timer = Some(ctx.set_timer(delay, TIMER_PUBLISH));
        }
        if self.state == ClientState::Disconnected {
            self.connect(ctx);
        }
    }

    fn stop(&mut self, ctx: &mut SimContext) {
        if self.stopped {
            return;
        }
        info!("Client[{}]: stopping", self.config.name);
        if self.state == ClientState::Connected {
            self.send(Packet::Disconnect, ctx);
        }
        self.stopped = true;
        self.cancel_session_timers(ctx);
        ctx.cancel_slot(&mut self.reconnect_timer);
        ctx.cancel_slot(&mut self.publish_timer);
        self.set_state(ClientState::Disconnected, Some(DisconnectCause::Stopped), ctx);
    }

    fn connect(&mut self, ctx: &mut SimContext) {
        ctx.cancel_slot(&mut self.reconnect_timer);
        self.set_state(ClientState::Connecting, None, ctx);
        debug!(
            "Client[{}]: CONNECT clean_session={}",
            self.config.name, self.config.clean_session
        );
        self.send(
            Packet::Connect {
                client_id: self.config.client_id.clone(),
                clean_session: self.config.clean_session,
                keepalive: self.config.keepalive,
                will: self.config.will.clone(),
            },
            ctx,
        );
        ctx.cancel_slot(&mut self.connect_timer);
        self.connect_timer = Some(ctx.set_timer(self.config.connect_timeout, TIMER_CONNECT_TIMEOUT));
    }

    fn handle_connack(&mut self, session_present: bool, ctx: &mut SimContext) {
        if self.state != ClientState::Connecting {
            trace!("Client[{}]: ignoring CONNACK in {:?}", self.config.name, self.state);
            return;
        }
        ctx.cancel_slot(&mut self.connect_timer);
        self.reconnect_attempt = 0;
        self.mac_failures = 0;
        debug!(
            "Client[{}]: CONNACK session_present={}",
            self.config.name, session_present
        );
        self.set_state(ClientState::Connected, None, ctx);
        self.rearm_keepalive(ctx);

        let seqs: Vec<u32> = self.pending.keys().copied().collect();
        if self.config.clean_session {
            for seq in seqs {
                if let Some(pending) = self.pending.remove(&seq) {
                    self.record_lost(pending.message.key, LossReason::CleanSessionDiscard, ctx);
                }
            }
        } else {
            for seq in seqs {
                self.retransmit(seq, ctx);
            }
        }

        if !session_present && !self.config.subscriptions.is_empty() {
            self.send(
                Packet::Subscribe {
                    filters: self.config.subscriptions.clone(),
                },
                ctx,
            );
        }

        while let Some(message) = self.outbox.pop_front() {
            self.send_publish(message, ctx);
        }
    }

    /// Leave CONNECTED/CONNECTING and schedule the next attempt.
    fn fail(&mut self, cause: DisconnectCause, ctx: &mut SimContext) {
        if !matches!(self.state, ClientState::Connected | ClientState::Connecting) {
            return;
        }
        self.cancel_session_timers(ctx);
        self.mac_failures = 0;
        self.set_state(ClientState::Reconnecting, Some(cause), ctx);
        metrics::counter!(
            metric_defs::MQTT_RECONNECTS.name,
            &self.metrics_labels.to_labels()
        )
        .increment(1);

        let delay = self.config.backoff.delay(self.reconnect_attempt, ctx.rng());
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        debug!(
            "Client[{}]: {} -> reconnect in {}",
            self.config.name,
            cause.label(),
            delay
        );
        ctx.cancel_slot(&mut self.reconnect_timer);
        self.reconnect_timer = Some(ctx.set_timer(delay, TIMER_RECONNECT));
    }

    fn deplete(&mut self, ctx: &mut SimContext) {
        info!("Client[{}]: battery depleted", self.config.name);
        self.depleted = true;
        self.stopped = true;
        self.cancel_session_timers(ctx);
        ctx.cancel_slot(&mut self.reconnect_timer);
        ctx.cancel_slot(&mut self.publish_timer);
        let pending = std::mem::take(&mut self.pending);
        for (_, p) in pending {
            self.record_lost(p.message.key, LossReason::NodeDepleted, ctx);
        }
        while let Some(message) = self.outbox.pop_front() {
            ctx.emit(Observation::OutboxDrop {
                node: self.node,
                key: message.key,
            });
        }
        self.set_state(
            ClientState::Disconnected,
            Some(DisconnectCause::BatteryDepleted),
            ctx,
        );
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    fn publish_tick(&mut self, ctx: &mut SimContext) {
        let Some(publish) = self.config.publish.clone() else {
            return;
        };
        let key = MessageKey {
            origin: self.node,
            seq: self.next_seq,
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        let message = Message {
            key,
            topic: publish.topic.clone(),
            payload_len: publish.payload_bytes,
            qos: publish.qos,
            dup: false,
            retain: publish.retain,
            publish_time: ctx.time(),
        };
        ctx.emit(Observation::Published {
            key,
            topic: publish.topic.clone(),
            qos: publish.qos,
            retain: publish.retain,
        });
        metrics::counter!(
            metric_defs::MQTT_PUBLISHED.name,
            &self.metrics_labels.to_labels()
        )
        .increment(1);

        if self.state == ClientState::Connected {
            self.send_publish(message, ctx);
        } else {
            self.outbox.push_back(message);
            while self.outbox.len() > self.config.outbox_capacity {
                if let Some(evicted) = self.outbox.pop_front() {
                    trace!("Client[{}]: outbox full, evicting {}", self.config.name, evicted.key);
                    ctx.emit(Observation::OutboxDrop {
                        node: self.node,
                        key: evicted.key,
                    });
                }
            }
        }

        let delay = Self::jittered_delay(ctx.rng(), publish.interval, publish.interval_jitter_s);
        self.publish_timer = Some(ctx.set_timer(delay, TIMER_PUBLISH));
    }

    fn send_publish(&mut self, message: Message, ctx: &mut SimContext) {
        if message.qos == QoS::AtLeastOnce {
            let seq = message.key.seq;
            let timer = ctx.set_timer(self.config.retry.interval, TIMER_RETRANSMIT_BASE + seq as u64);
            self.pending.insert(
                seq,
                Pending {
                    message: message.clone(),
                    retries: 0,
                    timer: Some(timer),
                },
            );
        }
        self.send(Packet::Publish(message), ctx);
    }

    /// Resend a pending message with `dup = true`, or give it up once the
    /// retry budget is spent.
    fn retransmit(&mut self, seq: u32, ctx: &mut SimContext) {
        let Some(pending) = self.pending.get_mut(&seq) else {
            return;
        };
        ctx.cancel_slot(&mut pending.timer);
        if pending.retries >= self.config.retry.max_retries {
            let key = pending.message.key;
            self.pending.remove(&seq);
            debug!("Client[{}]: {} lost after {} retries", self.config.name, key, self.config.retry.max_retries);
            self.record_lost(key, LossReason::RetriesExhausted, ctx);
            return;
        }
        pending.retries += 1;
        pending.message.dup = true;
        pending.timer = Some(ctx.set_timer(
            self.config.retry.interval,
            TIMER_RETRANSMIT_BASE + seq as u64,
        ));
        let attempt = pending.retries;
        let message = pending.message.clone();
        ctx.emit(Observation::Retransmitted {
            key: message.key,
            attempt,
        });
        metrics::counter!(
            metric_defs::MQTT_RETRANSMISSIONS.name,
            &self.metrics_labels.to_labels()
        )
        .increment(1);
        self.send(Packet::Publish(message), ctx);
    }

    fn handle_puback(&mut self, key: MessageKey, ctx: &mut SimContext) {
        if key.origin != self.node {
            return;
        }
        let Some(mut pending) = self.pending.remove(&key.seq) else {
            trace!("Client[{}]: late PUBACK for {}", self.config.name, key);
            return;
        };
        ctx.cancel_slot(&mut pending.timer);
        ctx.emit(Observation::Acked {
            key,
            retries: pending.retries,
        });
    }

    fn handle_publish(&mut self, message: &Message, ctx: &mut SimContext) {
        let labels = self.metrics_labels.to_labels();
        metrics::counter!(metric_defs::MQTT_DELIVERED.name, &labels).increment(1);
        if message.dup {
            metrics::counter!(metric_defs::MQTT_DUPLICATES.name, &labels).increment(1);
        }
        let latency = ctx.time() - message.publish_time;
        metrics::histogram!(metric_defs::MQTT_LATENCY.name, &labels).record(latency.as_secs_f64());
        ctx.emit(Observation::Delivered {
            key: message.key,
            subscriber: self.node,
            publish_time: message.publish_time,
            dup: message.dup,
            retained: message.retain,
        });
        if message.qos == QoS::AtLeastOnce {
            self.send(Packet::PubAck { key: message.key }, ctx);
        }
    }

    fn handle_packet(&mut self, packet: &Packet, ctx: &mut SimContext) {
        match packet {
            Packet::ConnAck { session_present } => self.handle_connack(*session_present, ctx),
            Packet::PubAck { key } => self.handle_puback(*key, ctx),
            Packet::Publish(message) => self.handle_publish(message, ctx),
            Packet::SubAck { granted } => {
                debug!("Client[{}]: SUBACK ({} filters)", self.config.name, granted);
            }
            Packet::PingResp => ctx.cancel_slot(&mut self.ping_timer),
            Packet::ConnectionReset => self.fail(DisconnectCause::BrokerReset, ctx),
            other => trace!("Client[{}]: unexpected {}", self.config.name, other.label()),
        }
    }

    fn handle_tx_done(&mut self, delivered: bool, ctx: &mut SimContext) {
        if delivered {
            self.mac_failures = 0;
            return;
        }
        self.mac_failures += 1;
        if self.state == ClientState::Connected
            && self.config.mac_drop_threshold > 0
            && self.mac_failures >= self.config.mac_drop_threshold
        {
            self.fail(DisconnectCause::MacDrops, ctx);
        }
    }
}

impl Entity for Client {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.depleted {
            return Ok(());
        }
        match &event.payload {
            EventPayload::ClientControl(ClientCommand::Start) => self.start(ctx),
            EventPayload::ClientControl(ClientCommand::Stop) => self.stop(ctx),
            EventPayload::FrameReceived(packet) => {
                if !self.stopped {
                    self.handle_packet(packet, ctx);
                }
            }
            EventPayload::RadioTxDone { delivered, .. } => self.handle_tx_done(*delivered, ctx),
            EventPayload::LinkDown { cause } => self.fail(*cause, ctx),
            EventPayload::RadioDepleted => self.deplete(ctx),
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_CONNECT_TIMEOUT => {
                    if fired(&self.connect_timer, event) {
                        self.connect_timer = None;
                        self.fail(DisconnectCause::ConnectTimeout, ctx);
                    }
                }
                TIMER_RECONNECT => {
                    if fired(&self.reconnect_timer, event) {
                        self.reconnect_timer = None;
                        if self.state == ClientState::Reconnecting && !self.stopped {
                            self.connect(ctx);
                        }
                    }
                }
                TIMER_KEEPALIVE => {
                    if fired(&self.keepalive_timer, event) {
                        self.keepalive_timer = None;
                        if self.state == ClientState::Connected && self.ping_timer.is_none() {
                            self.ping_timer =
                                Some(ctx.set_timer(self.config.ping_timeout, TIMER_PING_TIMEOUT));
                            self.send(Packet::PingReq, ctx);
                        }
                    }
                }
                TIMER_PING_TIMEOUT => {
                    if fired(&self.ping_timer, event) {
                        self.ping_timer = None;
                        debug!("Client[{}]: no PINGRESP", self.config.name);
                        self.fail(DisconnectCause::KeepAliveTimeout, ctx);
                    }
                }
                TIMER_PUBLISH => {
                    if fired(&self.publish_timer, event) {
                        self.publish_timer = None;
                        self.publish_tick(ctx);
                    }
                }
                id if id >= TIMER_RETRANSMIT_BASE => {
                    let seq = (id - TIMER_RETRANSMIT_BASE) as u32;
                    let armed = self
                        .pending
                        .get(&seq)
                        .is_some_and(|p| fired(&p.timer, event));
                    if armed && self.state == ClientState::Connected {
                        self.retransmit(seq, ctx);
                    }
                }
                other => {
                    return Err(SimError::HandlerError {
                        entity: self.id,
                        message: format!("unknown client timer {}", other),
                    })
                }
            },
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqsim_common::{EntityRegistry, Record};
    use std::sync::{Arc, Mutex};

    const CLIENT: EntityId = EntityId(10);
    const RADIO: EntityId = EntityId(11);

    type Sent = Arc<Mutex<Vec<Packet>>>;

    /// Radio stand-in that records every frame handed to it.
    struct RadioRecorder {
        sent: Sent,
    }

    impl Entity for RadioRecorder {
        fn entity_id(&self) -> EntityId {
            RADIO
        }

        fn handle_event(&mut self, event: &Event, _ctx: &mut SimContext) -> Result<(), SimError> {
            if let EventPayload::RadioTxRequest(frame) = &event.payload {
                self.sent.lock().expect("lock").push(frame.packet.clone());
            }
            Ok(())
        }
    }

    fn config(clean_session: bool) -> ClientConfig {
        let mut config = ClientConfig::new("sensor_0", "zigbee");
        config.clean_session = clean_session;
        config.backoff.jitter = SimTime::ZERO;
        config.publish = Some(PublishConfig {
            topic: "sensors/temperature".to_string(),
            qos: QoS::AtLeastOnce,
            interval: SimTime::from_secs(30.0),
            interval_jitter_s: 0.0,
            payload_bytes: 32,
            retain: false,
        });
        config
    }

    struct Harness {
        registry: EntityRegistry,
        ctx: SimContext,
        sent: Sent,
        records: Vec<Record>,
    }

    impl Harness {
        fn new(config: ClientConfig) -> Self {
            let sent = Sent::default();
            let mut registry = EntityRegistry::new();
            registry.register(Box::new(Client::new(CLIENT, NodeId(0), RADIO, config)));
            registry.register(Box::new(RadioRecorder { sent: sent.clone() }));
            let mut ctx = SimContext::new(42);
            ctx.post_immediate(vec![CLIENT], EventPayload::ClientControl(ClientCommand::Start));
            Harness {
                registry,
                ctx,
                sent,
                records: Vec::new(),
            }
        }

        fn run_until(&mut self, secs: f64) {
            let limit = SimTime::from_secs(secs);
            while let Some(event) = self.ctx.scheduler_mut().pop_until(limit) {
                self.registry
                    .dispatch_event(&event, &mut self.ctx)
                    .expect("dispatch succeeds");
            }
            self.ctx.scheduler_mut().advance_to(limit);
            self.records.extend(self.ctx.take_observations());
        }

        fn deliver_at(&mut self, secs: f64, packet: Packet) {
            let delay = SimTime::from_secs(secs) - self.ctx.time();
            self.ctx
                .post_event(delay, vec![CLIENT], EventPayload::FrameReceived(packet));
        }

        fn sent(&self) -> Vec<Packet> {
            self.sent.lock().expect("lock").clone()
        }

        fn count(&self, pred: impl Fn(&Observation) -> bool) -> usize {
            self.records.iter().filter(|r| pred(&r.observation)).count()
        }
    }

    #[test]
    fn test_qos1_lost_after_max_retries() {
        let mut h = Harness::new(config(false));
        h.deliver_at(0.1, Packet::ConnAck { session_present: false });
        // first reading at 30 s, retries every 2 s, never acked
        h.run_until(45.0);

        assert_eq!(
            h.count(|o| matches!(o, Observation::Retransmitted { .. })),
            3
        );
        assert_eq!(
            h.count(|o| matches!(
                o,
                Observation::Lost {
                    reason: LossReason::RetriesExhausted,
                    ..
                }
            )),
            1
        );
        let publishes: Vec<bool> = h
            .sent()
            .iter()
            .filter_map(|p| match p {
                Packet::Publish(m) if m.key.seq == 1 => Some(m.dup),
                _ => None,
            })
            .collect();
        assert_eq!(publishes, vec![false, true, true, true]);
    }

    #[test]
    fn test_puback_stops_retransmission() {
        let mut h = Harness::new(config(false));
        h.deliver_at(0.1, Packet::ConnAck { session_present: false });
        h.run_until(30.5);
        h.deliver_at(
            31.0,
            Packet::PubAck {
                key: MessageKey {
                    origin: NodeId(0),
                    seq: 1,
                },
            },
        );
        h.run_until(40.0);

        assert_eq!(h.count(|o| matches!(o, Observation::Retransmitted { .. })), 0);
        assert_eq!(
            h.count(|o| matches!(o, Observation::Acked { retries: 0, .. })),
            1
        );
        assert_eq!(h.count(|o| matches!(o, Observation::Lost { .. })), 0);
    }

    #[test]
    fn test_clean_session_reconnect_discards_pending() {
        let mut h = Harness::new(config(true));
        h.deliver_at(0.1, Packet::ConnAck { session_present: false });
        h.run_until(30.5);
        h.deliver_at(31.0, Packet::ConnectionReset);
        // backoff base 0.5 s, then CONNECT; answer it
        h.deliver_at(32.0, Packet::ConnAck { session_present: false });
        h.run_until(33.0);

        assert_eq!(
            h.count(|o| matches!(
                o,
                Observation::Lost {
                    reason: LossReason::CleanSessionDiscard,
                    ..
                }
            )),
            1
        );
        assert_eq!(
            h.count(|o| matches!(
                o,
                Observation::ClientState {
                    state: ClientState::Reconnecting,
                    cause: Some(DisconnectCause::BrokerReset),
                    ..
                }
            )),
            1
        );
    }

    #[test]
    fn test_offline_readings_buffer_and_flush() {
        let mut config = config(false);
        config.outbox_capacity = 2;
        config.connect_timeout = SimTime::from_secs(1000.0);
        let mut h = Harness::new(config);
        // never acknowledged: four readings, the oldest two evicted
        h.run_until(125.0);
        assert_eq!(h.count(|o| matches!(o, Observation::OutboxDrop { .. })), 2);

        h.deliver_at(126.0, Packet::ConnAck { session_present: false });
        h.run_until(126.5);
        let flushed: Vec<u32> = h
            .sent()
            .iter()
            .filter_map(|p| match p {
                Packet::Publish(m) => Some(m.key.seq),
                _ => None,
            })
            .collect();
        assert_eq!(flushed, vec![3, 4]);
    }

    #[test]
    fn test_missing_pingresp_triggers_reconnect() {
        let mut config = config(false);
        config.publish = None;
        config.keepalive = SimTime::from_secs(10.0);
        let mut h = Harness::new(config);
        h.deliver_at(0.1, Packet::ConnAck { session_present: false });
        // ping at 10.1 s, timeout at 15.1 s, reconnect 0.5 s later
        h.run_until(16.0);

        let reconnecting: Vec<SimTime> = h
            .records
            .iter()
            .filter(|r| {
                matches!(
                    r.observation,
                    Observation::ClientState {
                        state: ClientState::Reconnecting,
                        cause: Some(DisconnectCause::KeepAliveTimeout),
                        ..
                    }
                )
            })
            .map(|r| r.time)
            .collect();
        assert_eq!(reconnecting, vec![SimTime::from_secs(15.1)]);
        let connects = h
            .sent()
            .iter()
            .filter(|p| matches!(p, Packet::Connect { .. }))
            .count();
        assert_eq!(connects, 2);
    }
}
