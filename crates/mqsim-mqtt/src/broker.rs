//! MQTT broker state machine.
//!
//! One broker per run. It receives client packets as [`EventPayload::Uplink`]
//! (after the gateway backhaul) and answers with [`EventPayload::Downlink`]
//! events addressed to the medium.
//!
//! Offline persistent sessions queue QoS1 messages up to
//! [`BrokerConfig::queue_capacity`]. A full queue drops the incoming message
//! and keeps what is already queued.

use crate::{topic_matches, RetryPolicy};
use mqsim_common::{
    BrokerCommand, BrokerDropReason, DiscardReason, Entity, EntityId, Event, EventPayload,
    Message, MessageKey, NodeId, Observation, Packet, QoS, SimContext, SimError, SimTime,
    TimerHandle, Will,
};
use mqsim_metrics::{metric_defs, metrics};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info, trace, warn};

/// Broker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Entity that carries downlink packets to clients.
    pub medium: EntityId,
    /// Messages queued per offline persistent session.
    pub queue_capacity: usize,
    /// How long a disconnected persistent session is kept.
    pub session_expiry: SimTime,
    /// Outbound QoS1 retransmission policy.
    pub retry: RetryPolicy,
    /// Period of the keep-alive and expiry sweep.
    pub sweep_interval: SimTime,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            medium: EntityId(2),
            queue_capacity: 500,
            session_expiry: SimTime::from_secs(3600.0),
            retry: RetryPolicy::default(),
            sweep_interval: SimTime::from_secs(15.0),
        }
    }
}

/// Timer that runs the periodic session sweep. The first one is posted by
/// whoever builds the simulation; the broker re-arms it.
pub const BROKER_SWEEP_TIMER: u64 = 2;
const TIMER_RESTORE: u64 = 1;
const TIMER_RETRY_BASE: u64 = 1 << 32;

/// Will messages get sequence numbers in a range clients never reach.
const WILL_SEQ_BASE: u32 = 1 << 31;

#[derive(Debug, Clone)]
struct Outbound {
    message: Message,
    retries: u32,
    slot: u64,
    timer: Option<TimerHandle>,
}

#[derive(Debug, Clone)]
struct Session {
    node: NodeId,
    clean_session: bool,
    keepalive: SimTime,
    subscriptions: BTreeMap<String, QoS>,
    queue: VecDeque<Message>,
    inflight: BTreeMap<MessageKey, Outbound>,
    connected: bool,
    last_seen: SimTime,
    disconnected_at: SimTime,
}

impl Session {
    fn new(node: NodeId, now: SimTime) -> Self {
        Session {
            node,
            clean_session: true,
            keepalive: SimTime::ZERO,
            subscriptions: BTreeMap::new(),
            queue: VecDeque::new(),
            inflight: BTreeMap::new(),
            connected: false,
            last_seen: now,
            disconnected_at: now,
        }
    }

    /// Highest QoS granted by any subscription matching `topic`.
    fn granted_qos(&self, topic: &str) -> Option<QoS> {
        self.subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, qos)| *qos)
            .max()
    }

    fn stored_keys(&self) -> Vec<MessageKey> {
        self.inflight
            .keys()
            .copied()
            .chain(self.queue.iter().map(|m| m.key))
            .collect()
    }
}

/// The MQTT broker entity.
pub struct Broker {
    id: EntityId,
    config: BrokerConfig,
    up: bool,
    sessions: BTreeMap<String, Session>,
    by_node: BTreeMap<NodeId, String>,
    retained: BTreeMap<String, Message>,
    wills: BTreeMap<String, Will>,
    retry_slots: BTreeMap<u64, (String, MessageKey)>,
    next_slot: u64,
    next_will_seq: u32,
    restore_timer: Option<TimerHandle>,
    queue_depth: usize,
}

impl Broker {
    /// Create a broker.
    pub fn new(id: EntityId, config: BrokerConfig) -> Self {
        Broker {
            id,
            config,
            up: true,
            sessions: BTreeMap::new(),
            by_node: BTreeMap::new(),
            retained: BTreeMap::new(),
            wills: BTreeMap::new(),
            retry_slots: BTreeMap::new(),
            next_slot: 0,
            next_will_seq: 0,
            restore_timer: None,
            queue_depth: 0,
        }
    }

    /// False while crashed.
    pub fn is_up(&self) -> bool {
        self.up
    }

    /// Retained message for `topic`.
    pub fn retained(&self, topic: &str) -> Option<&Message> {
        self.retained.get(topic)
    }

    /// True when a session record exists for `client_id`.
    pub fn has_session(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Messages queued for an offline session.
    pub fn queued(&self, client_id: &str) -> usize {
        self.sessions
            .get(client_id)
            .map(|s| s.queue.len())
            .unwrap_or(0)
    }

    /// Messages queued over every offline session.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    fn drop_packet(
        &self,
        node: NodeId,
        key: Option<MessageKey>,
        reason: BrokerDropReason,
        ctx: &mut SimContext,
    ) {
        metrics::counter!(metric_defs::BROKER_DROPS.name, "reason" => reason.label())
            .increment(1);
        ctx.emit(Observation::BrokerDrop { node, key, reason });
    }

    /// Report the total queue depth when it changed.
    fn update_queue_depth(&mut self, ctx: &mut SimContext) {
        let depth: usize = self.sessions.values().map(|s| s.queue.len()).sum();
        if depth == self.queue_depth {
            return;
        }
        self.queue_depth = depth;
        metrics::gauge!(metric_defs::BROKER_QUEUE_DEPTH.name).set(depth as f64);
        ctx.emit(Observation::BrokerQueueDepth { depth });
    }

    fn send(&self, to: NodeId, packet: Packet, ctx: &mut SimContext) {
        trace!("Broker: {} -> {}", packet.label(), to);
        ctx.post_immediate(
            vec![self.config.medium],
            EventPayload::Downlink { to, packet },
        );
    }

    /// Client id of the live connection on `node`.
    fn connected_client(&self, node: NodeId) -> Option<String> {
        let client_id = self.by_node.get(&node)?;
        self.sessions
            .get(client_id)
            .filter(|s| s.connected && s.node == node)
            .map(|_| client_id.clone())
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Send a message to a connected session, tracking it when QoS1.
    fn deliver(&mut self, client_id: &str, message: Message, ctx: &mut SimContext) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        if !session.connected {
            return;
        }
        if message.qos == QoS::AtLeastOnce {
            if let Some(mut old) = session.inflight.remove(&message.key) {
                ctx.cancel_slot(&mut old.timer);
                self.retry_slots.remove(&old.slot);
            }
            let slot = self.next_slot;
            self.next_slot += 1;
            let timer = ctx.set_timer(self.config.retry.interval, TIMER_RETRY_BASE + slot);
            self.retry_slots
                .insert(slot, (client_id.to_string(), message.key));
            session.inflight.insert(
                message.key,
                Outbound {
                    message: message.clone(),
                    retries: 0,
                    slot,
                    timer: Some(timer),
                },
            );
        }
        let to = session.node;
        self.send(to, Packet::Publish(message), ctx);
    }

    /// Fan a message out to every matching subscription.
    ///
    /// A copy that cannot be delivered or queued is reported as a drop, and
    /// so is a message nobody subscribed to.
    fn route(&mut self, message: &Message, ctx: &mut SimContext) {
        let mut live = Vec::new();
        let mut offline = Vec::new();
        let mut matched = false;
        for (client_id, session) in self.sessions.iter_mut() {
            let Some(granted) = session.granted_qos(&message.topic) else {
                continue;
            };
            matched = true;
            let mut out = message.clone();
            out.qos = out.qos.min(granted);
            out.retain = false;
            if session.connected {
                live.push((client_id.clone(), out));
            } else if out.qos == QoS::AtMostOnce {
                offline.push(session.node);
            } else if session.queue.len() >= self.config.queue_capacity {
                trace!("Broker: queue of {} full, dropping {}", client_id, out.key);
                metrics::counter!(metric_defs::BROKER_QUEUE_DROPS.name, "node" => client_id.clone())
                    .increment(1);
                ctx.emit(Observation::QueueDrop {
                    subscriber: session.node,
                    key: out.key,
                });
            } else {
                session.queue.push_back(out);
            }
        }
        for node in offline {
            self.drop_packet(
                node,
                Some(message.key),
                BrokerDropReason::SubscriberOffline,
                ctx,
            );
        }
        if !matched {
            trace!("Broker: no subscriber for {} on {}", message.key, message.topic);
            self.drop_packet(
                message.key.origin,
                Some(message.key),
                BrokerDropReason::NoSubscriber,
                ctx,
            );
        }
        self.update_queue_depth(ctx);
        for (client_id, out) in live {
            self.deliver(&client_id, out, ctx);
        }
    }

    /// Send retained messages matching `filters` to a connected session.
    fn deliver_retained<'a>(
        &mut self,
        client_id: &str,
        filters: impl IntoIterator<Item = (&'a String, &'a QoS)>,
        ctx: &mut SimContext,
    ) {
        let mut matched: BTreeMap<String, QoS> = BTreeMap::new();
        for (filter, qos) in filters {
            for topic in self.retained.keys() {
                if topic_matches(filter, topic) {
                    let entry = matched.entry(topic.clone()).or_insert(*qos);
                    *entry = (*entry).max(*qos);
                }
            }
        }
        for (topic, granted) in matched {
            let Some(stored) = self.retained.get(&topic) else {
                continue;
            };
            let mut out = stored.clone();
            out.qos = out.qos.min(granted);
            out.retain = true;
            out.dup = false;
            self.deliver(client_id, out, ctx);
        }
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    fn handle_connect(
        &mut self,
        from: NodeId,
        client_id: &str,
        clean_session: bool,
        keepalive: SimTime,
        will: Option<Will>,
        ctx: &mut SimContext,
    ) {
        let now = ctx.time();
        if self.sessions.get(client_id).is_some_and(|s| s.connected) {
            debug!("Broker: session takeover for {}", client_id);
            self.close_abnormally(client_id, ctx);
        }
        if let Some(previous) = self.by_node.get(&from).cloned() {
            if previous != client_id {
                self.close_abnormally(&previous, ctx);
            }
        }

        let resumable = self
            .sessions
            .get(client_id)
            .is_some_and(|s| now - s.disconnected_at <= self.config.session_expiry);
        if self.sessions.contains_key(client_id) && (clean_session || !resumable) {
            let reason = if clean_session {
                DiscardReason::CleanSession
            } else {
                DiscardReason::Expired
            };
            self.discard_session(client_id, reason, ctx);
        }
        let session_present = !clean_session && self.sessions.contains_key(client_id);

        let session = self
            .sessions
            .entry(client_id.to_string())
            .or_insert_with(|| Session::new(from, now));
        session.node = from;
        session.clean_session = clean_session;
        session.keepalive = keepalive;
        session.connected = true;
        session.last_seen = now;
        self.by_node.insert(from, client_id.to_string());
        match will {
            Some(will) => {
                self.wills.insert(client_id.to_string(), will);
            }
            None => {
                self.wills.remove(client_id);
            }
        }

        debug!(
            "Broker: CONNECT {} clean_session={} session_present={}",
            client_id, clean_session, session_present
        );
        self.send(from, Packet::ConnAck { session_present }, ctx);

        if session_present {
            self.resume(client_id, ctx);
        }
    }

    /// Redeliver in-flight, queued and retained messages of a resumed session.
    fn resume(&mut self, client_id: &str, ctx: &mut SimContext) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        let inflight: Vec<Message> = std::mem::take(&mut session.inflight)
            .into_values()
            .map(|mut o| {
                o.message.dup = true;
                o.message
            })
            .collect();
        let queued: Vec<Message> = session.queue.drain(..).collect();
        let subscriptions = session.subscriptions.clone();
        debug!(
            "Broker: resuming {} ({} in flight, {} queued)",
            client_id,
            inflight.len(),
            queued.len()
        );
        self.update_queue_depth(ctx);
        for message in inflight.into_iter().chain(queued) {
            self.deliver(client_id, message, ctx);
        }
        self.deliver_retained(client_id, subscriptions.iter(), ctx);
    }

    /// Drop a session record and count what it still held.
    fn discard_session(&mut self, client_id: &str, reason: DiscardReason, ctx: &mut SimContext) {
        let Some(mut session) = self.sessions.remove(client_id) else {
            return;
        };
        for outbound in session.inflight.values_mut() {
            ctx.cancel_slot(&mut outbound.timer);
            self.retry_slots.remove(&outbound.slot);
        }
        if self.by_node.get(&session.node).map(String::as_str) == Some(client_id) {
            self.by_node.remove(&session.node);
        }
        ctx.emit(Observation::SessionDiscarded {
            client: session.node,
            keys: session.stored_keys(),
            reason,
        });
        self.update_queue_depth(ctx);
    }

    /// Mark a session offline. Clean sessions end here.
    fn disconnect_session(&mut self, client_id: &str, ctx: &mut SimContext) {
        let now = ctx.time();
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        session.connected = false;
        session.disconnected_at = now;
        for outbound in session.inflight.values_mut() {
            ctx.cancel_slot(&mut outbound.timer);
        }
        let node = session.node;
        if session.clean_session {
            self.discard_session(client_id, DiscardReason::CleanSession, ctx);
        }
        if self.by_node.get(&node).map(String::as_str) == Some(client_id) {
            self.by_node.remove(&node);
        }
    }

    /// Close a connection that ended without DISCONNECT and publish its will.
    fn close_abnormally(&mut self, client_id: &str, ctx: &mut SimContext) {
        let Some(node) = self.sessions.get(client_id).map(|s| s.node) else {
            return;
        };
        self.disconnect_session(client_id, ctx);
        let Some(will) = self.wills.remove(client_id) else {
            return;
        };
        info!("Broker: publishing will of {} on {}", client_id, will.topic);
        metrics::counter!(metric_defs::BROKER_WILLS.name, "node" => client_id.to_string())
            .increment(1);
        ctx.emit(Observation::WillPublished {
            client: node,
            topic: will.topic.clone(),
        });
        let message = Message {
            key: MessageKey {
                origin: node,
                seq: WILL_SEQ_BASE + self.next_will_seq,
            },
            topic: will.topic,
            payload_len: will.payload_len,
            qos: will.qos,
            dup: false,
            retain: will.retain,
            publish_time: ctx.time(),
        };
        self.next_will_seq = self.next_will_seq.wrapping_add(1) % WILL_SEQ_BASE;
        if message.retain {
            self.retained.insert(message.topic.clone(), message.clone());
        }
        self.route(&message, ctx);
    }

    fn handle_disconnect(&mut self, client_id: &str, ctx: &mut SimContext) {
        debug!("Broker: DISCONNECT {}", client_id);
        self.wills.remove(client_id);
        self.disconnect_session(client_id, ctx);
    }

    fn sweep(&mut self, ctx: &mut SimContext) {
        ctx.set_timer(self.config.sweep_interval, BROKER_SWEEP_TIMER);
        if !self.up {
            return;
        }
        let now = ctx.time();
        let silent: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                s.connected
                    && s.keepalive > SimTime::ZERO
                    && (now - s.last_seen).as_micros() * 2 > s.keepalive.as_micros() * 3
            })
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in silent {
            debug!("Broker: keep-alive expired for {}", client_id);
            self.close_abnormally(&client_id, ctx);
        }

        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.connected && now - s.disconnected_at > self.config.session_expiry)
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in expired {
            debug!("Broker: session of {} expired", client_id);
            self.discard_session(&client_id, DiscardReason::Expired, ctx);
        }
    }

    // ========================================================================
    // Failure Injection
    // ========================================================================

    fn crash(&mut self, down_for: SimTime, ctx: &mut SimContext) {
        if !self.up {
            warn!("Broker: crash requested while already down");
            return;
        }
        let connected: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.connected)
            .map(|(id, _)| id.clone())
            .collect();
        let affected: Vec<NodeId> = connected
            .iter()
            .filter_map(|id| self.sessions.get(id).map(|s| s.node))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        info!(
            "Broker: crashed, {} clients affected, down for {}",
            affected.len(),
            down_for
        );
        self.up = false;
        ctx.emit(Observation::BrokerFailed {
            affected: affected.clone(),
        });
        for client_id in connected {
            self.disconnect_session(&client_id, ctx);
        }
        ctx.post_immediate(
            vec![self.config.medium],
            EventPayload::BrokerCrashed { affected },
        );
        ctx.cancel_slot(&mut self.restore_timer);
        self.restore_timer = Some(ctx.set_timer(down_for, TIMER_RESTORE));
    }

    fn restore(&mut self, ctx: &mut SimContext) {
        info!("Broker: restored");
        self.up = true;
        let now = ctx.time();
        for session in self.sessions.values_mut() {
            session.disconnected_at = now;
        }
        ctx.emit(Observation::BrokerRestored);
    }

    fn retry(&mut self, slot: u64, event: &Event, ctx: &mut SimContext) {
        let Some((client_id, key)) = self.retry_slots.get(&slot).cloned() else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&client_id) else {
            return;
        };
        let Some(outbound) = session.inflight.get_mut(&key) else {
            return;
        };
        if !session.connected || !outbound.timer.is_some_and(|h| h.fired_by(event)) {
            return;
        }
        let node = session.node;
        if outbound.retries >= self.config.retry.max_retries {
            session.inflight.remove(&key);
            self.retry_slots.remove(&slot);
            debug!("Broker: abandoning {} to {}", key, client_id);
            ctx.emit(Observation::DeliveryAbandoned {
                key,
                subscriber: node,
            });
            return;
        }
        outbound.retries += 1;
        outbound.message.dup = true;
        outbound.timer = Some(ctx.set_timer(self.config.retry.interval, TIMER_RETRY_BASE + slot));
        let message = outbound.message.clone();
        self.send(node, Packet::Publish(message), ctx);
    }

    fn handle_uplink(&mut self, from: NodeId, packet: &Packet, ctx: &mut SimContext) {
        if !self.up {
            trace!("Broker: down, dropping {} from {}", packet.label(), from);
            self.drop_packet(
                from,
                packet.message_key(),
                BrokerDropReason::BrokerDown,
                ctx,
            );
            return;
        }
        if let Packet::Connect {
            client_id,
            clean_session,
            keepalive,
            will,
        } = packet
        {
            self.handle_connect(from, client_id, *clean_session, *keepalive, will.clone(), ctx);
            return;
        }

        let Some(client_id) = self.connected_client(from) else {
            trace!("Broker: {} from {} without a session", packet.label(), from);
            return;
        };
        let now = ctx.time();
        if let Some(session) = self.sessions.get_mut(&client_id) {
            session.last_seen = now;
        }

        match packet {
            Packet::Publish(message) => {
                if message.qos == QoS::AtLeastOnce {
                    self.send(from, Packet::PubAck { key: message.key }, ctx);
                }
                if message.retain {
                    let mut stored = message.clone();
                    stored.dup = false;
                    self.retained.insert(message.topic.clone(), stored);
                }
                self.route(message, ctx);
            }
            Packet::PubAck { key } => {
                if let Some(session) = self.sessions.get_mut(&client_id) {
                    if let Some(mut outbound) = session.inflight.remove(key) {
                        ctx.cancel_slot(&mut outbound.timer);
                        self.retry_slots.remove(&outbound.slot);
                    }
                }
            }
            Packet::Subscribe { filters } => {
                if let Some(session) = self.sessions.get_mut(&client_id) {
                    for (filter, qos) in filters {
                        session.subscriptions.insert(filter.clone(), *qos);
                    }
                }
                self.send(
                    from,
                    Packet::SubAck {
                        granted: filters.len(),
                    },
                    ctx,
                );
                self.deliver_retained(&client_id, filters.iter().map(|(f, q)| (f, q)), ctx);
            }
            Packet::PingReq => self.send(from, Packet::PingResp, ctx),
            Packet::Disconnect => self.handle_disconnect(&client_id, ctx),
            other => trace!("Broker: ignoring {} from {}", other.label(), from),
        }
    }
}

impl Entity for Broker {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Uplink { from, packet } => self.handle_uplink(*from, packet, ctx),
            EventPayload::BrokerControl(BrokerCommand::Crash { down_for }) => {
                self.crash(*down_for, ctx)
            }
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_RESTORE => {
                    if self.restore_timer.is_some_and(|h| h.fired_by(event)) {
                        self.restore_timer = None;
                        self.restore(ctx);
                    }
                }
                BROKER_SWEEP_TIMER => self.sweep(ctx),
                id if id >= TIMER_RETRY_BASE => self.retry(id - TIMER_RETRY_BASE, event, ctx),
                other => {
                    return Err(SimError::HandlerError {
                        entity: self.id,
                        message: format!("unknown broker timer {}", other),
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

    const BROKER: EntityId = EntityId(1);
    const MEDIUM: EntityId = EntityId(2);

    type Downlinks = Arc<Mutex<Vec<(NodeId, Packet)>>>;

    struct MediumRecorder {
        seen: Downlinks,
        crashes: Arc<Mutex<Vec<Vec<NodeId>>>>,
    }

    impl Entity for MediumRecorder {
        fn entity_id(&self) -> EntityId {
            MEDIUM
        }

        fn handle_event(&mut self, event: &Event, _ctx: &mut SimContext) -> Result<(), SimError> {
            match &event.payload {
                EventPayload::Downlink { to, packet } => {
                    self.seen.lock().expect("lock").push((*to, packet.clone()))
                }
                EventPayload::BrokerCrashed { affected } => {
                    self.crashes.lock().expect("lock").push(affected.clone())
                }
                _ => {}
            }
            Ok(())
        }
    }

    struct Harness {
        registry: EntityRegistry,
        ctx: SimContext,
        seen: Downlinks,
        crashes: Arc<Mutex<Vec<Vec<NodeId>>>>,
        records: Vec<Record>,
    }

    impl Harness {
        fn new(config: BrokerConfig) -> Self {
            let seen = Downlinks::default();
            let crashes = Arc::new(Mutex::new(Vec::new()));
            let mut registry = EntityRegistry::new();
            registry.register(Box::new(Broker::new(BROKER, config)));
            registry.register(Box::new(MediumRecorder {
                seen: seen.clone(),
                crashes: crashes.clone(),
            }));
            let mut ctx = SimContext::new(42);
            ctx.post_immediate(
                vec![BROKER],
                EventPayload::Timer {
                    timer_id: BROKER_SWEEP_TIMER,
                },
            );
            Harness {
                registry,
                ctx,
                seen,
                crashes,
                records: Vec::new(),
            }
        }

        fn uplink(&mut self, secs: f64, from: u32, packet: Packet) {
            let delay = SimTime::from_secs(secs) - self.ctx.time();
            self.ctx.post_event(
                delay,
                vec![BROKER],
                EventPayload::Uplink {
                    from: NodeId(from),
                    packet,
                },
            );
        }

        fn connect(&mut self, secs: f64, node: u32, clean_session: bool, will: Option<Will>) {
            self.uplink(
                secs,
                node,
                Packet::Connect {
                    client_id: format!("c{}", node),
                    clean_session,
                    keepalive: SimTime::from_secs(10.0),
                    will,
                },
            );
        }

        fn publish(&mut self, secs: f64, node: u32, seq: u32, topic: &str, retain: bool) {
            self.uplink(
                secs,
                node,
                Packet::Publish(Message {
                    key: MessageKey {
                        origin: NodeId(node),
                        seq,
                    },
                    topic: topic.to_string(),
                    payload_len: 8,
                    qos: QoS::AtLeastOnce,
                    dup: false,
                    retain,
                    publish_time: SimTime::from_secs(secs),
                }),
            );
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

        fn publishes_to(&self, node: u32) -> Vec<Message> {
            self.seen
                .lock()
                .expect("lock")
                .iter()
                .filter_map(|(to, p)| match p {
                    Packet::Publish(m) if *to == NodeId(node) => Some(m.clone()),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, pred: impl Fn(&Observation) -> bool) -> usize {
            self.records.iter().filter(|r| pred(&r.observation)).count()
        }

        fn queue_depth_reports(&self) -> Vec<usize> {
            self.records
                .iter()
                .filter_map(|r| match r.observation {
                    Observation::BrokerQueueDepth { depth } => Some(depth),
                    _ => None,
                })
                .collect()
        }
    }

    fn subscribe(filter: &str) -> Packet {
        subscribe_qos(filter, QoS::AtLeastOnce)
    }

    fn subscribe_qos(filter: &str, qos: QoS) -> Packet {
        Packet::Subscribe {
            filters: vec![(filter.to_string(), qos)],
        }
    }

    fn key(node: u32, seq: u32) -> MessageKey {
        MessageKey {
            origin: NodeId(node),
            seq,
        }
    }

    #[test]
    fn test_retained_store_and_late_subscriber() {
        let mut h = Harness::new(BrokerConfig::default());
        h.connect(0.0, 1, true, None);
        h.publish(1.0, 1, 1, "sensors/t", true);
        h.publish(2.0, 1, 2, "sensors/t", false);
        h.publish(3.0, 1, 3, "sensors/t", true);
        h.publish(4.0, 1, 4, "sensors/t", false);
        h.connect(5.0, 2, true, None);
        h.uplink(6.0, 2, subscribe("sensors/#"));
        h.run_until(6.5);

        let got = h.publishes_to(2);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].key.seq, 3);
        assert!(got[0].retain);
    }

    #[test]
    fn test_persistent_session_queues_and_resumes() {
        let mut h = Harness::new(BrokerConfig::default());
        h.connect(0.0, 1, false, None);
        h.uplink(0.5, 1, subscribe("alerts/#"));
        h.uplink(1.0, 1, Packet::Disconnect);
        h.connect(1.5, 2, true, None);
        h.publish(2.0, 2, 1, "alerts/a", false);
        h.publish(2.5, 2, 2, "alerts/b", false);
        h.run_until(3.0);
        assert!(h.publishes_to(1).is_empty());

        h.connect(4.0, 1, false, None);
        h.run_until(4.5);
        let seen = h.seen.lock().expect("lock").clone();
        let connack = seen
            .iter()
            .rposition(|(to, p)| *to == NodeId(1) && matches!(p, Packet::ConnAck { session_present: true }))
            .expect("resumed");
        let first_publish = seen
            .iter()
            .position(|(to, p)| *to == NodeId(1) && matches!(p, Packet::Publish(_)))
            .expect("queued delivered");
        assert!(connack < first_publish);
        let keys: Vec<u32> = h.publishes_to(1).iter().map(|m| m.key.seq).collect();
        assert_eq!(keys, vec![1, 2]);
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let mut h = Harness::new(BrokerConfig {
            queue_capacity: 2,
            ..BrokerConfig::default()
        });
        h.connect(0.0, 1, false, None);
        h.uplink(0.5, 1, subscribe("#"));
        h.uplink(1.0, 1, Packet::Disconnect);
        h.connect(1.5, 2, true, None);
        for seq in 1..=4 {
            h.publish(2.0 + seq as f64 * 0.1, 2, seq, "sensors/t", false);
        }
        h.connect(3.0, 1, false, None);
        h.run_until(3.5);

        assert_eq!(h.count(|o| matches!(o, Observation::QueueDrop { .. })), 2);
        let keys: Vec<u32> = h.publishes_to(1).iter().map(|m| m.key.seq).collect();
        assert_eq!(keys, vec![1, 2]);
    }

    #[test]
    fn test_silent_client_gets_will_published() {
        let mut h = Harness::new(BrokerConfig {
            sweep_interval: SimTime::from_secs(5.0),
            ..BrokerConfig::default()
        });
        h.connect(0.0, 2, true, None);
        h.uplink(0.5, 2, subscribe("alerts/#"));
        h.connect(
            1.0,
            1,
            true,
            Some(Will {
                topic: "alerts/status".to_string(),
                qos: QoS::AtLeastOnce,
                retain: false,
                payload_len: 16,
            }),
        );
        // keep the subscriber alive
        for i in 1..5 {
            h.uplink(i as f64 * 4.0, 2, Packet::PingReq);
        }
        h.run_until(20.0);

        // silence of node 1 exceeds 15 s at the 20 s sweep
        assert_eq!(h.count(|o| matches!(o, Observation::WillPublished { .. })), 1);
        let wills = h.publishes_to(2);
        assert_eq!(wills.len(), 1);
        assert_eq!(wills[0].topic, "alerts/status");
        assert_eq!(wills[0].key.origin, NodeId(1));
    }

    #[test]
    fn test_crash_drops_traffic_until_restored() {
        let mut h = Harness::new(BrokerConfig::default());
        h.connect(0.0, 1, false, None);
        h.connect(0.0, 2, true, None);
        h.ctx.post_event(
            SimTime::from_secs(1.0),
            vec![BROKER],
            EventPayload::BrokerControl(BrokerCommand::Crash {
                down_for: SimTime::from_secs(10.0),
            }),
        );
        h.uplink(5.0, 1, Packet::PingReq);
        h.connect(6.0, 1, false, None);
        h.connect(12.0, 1, false, None);
        h.run_until(13.0);

        assert_eq!(
            h.crashes.lock().expect("lock").clone(),
            vec![vec![NodeId(1), NodeId(2)]]
        );
        assert_eq!(h.count(|o| matches!(o, Observation::BrokerFailed { .. })), 1);
        assert_eq!(h.count(|o| matches!(o, Observation::BrokerRestored)), 1);
        assert_eq!(h.count(|o| matches!(o, Observation::WillPublished { .. })), 0);
        let seen = h.seen.lock().expect("lock").clone();
        assert!(!seen.iter().any(|(_, p)| matches!(p, Packet::PingResp)));
        let acks: Vec<bool> = seen
            .iter()
            .filter_map(|(to, p)| match p {
                Packet::ConnAck { session_present } if *to == NodeId(1) => Some(*session_present),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![false, true]);
    }

    #[test]
    fn test_unacked_delivery_is_abandoned() {
        let mut h = Harness::new(BrokerConfig::default());
        h.connect(0.0, 1, true, None);
        h.uplink(0.5, 1, subscribe("#"));
        h.connect(1.0, 2, true, None);
        h.publish(1.5, 2, 1, "sensors/t", false);
        h.run_until(20.0);

        let copies: Vec<bool> = h.publishes_to(1).iter().map(|m| m.dup).collect();
        assert_eq!(copies, vec![false, true, true, true]);
        assert_eq!(
            h.count(|o| matches!(o, Observation::DeliveryAbandoned { .. })),
            1
        );
    }

    #[test]
    fn test_uplink_while_down_is_reported_as_drop() {
        let mut h = Harness::new(BrokerConfig::default());
        h.connect(0.0, 1, false, None);
        h.ctx.post_event(
            SimTime::from_secs(1.0),
            vec![BROKER],
            EventPayload::BrokerControl(BrokerCommand::Crash {
                down_for: SimTime::from_secs(10.0),
            }),
        );
        h.publish(2.0, 1, 1, "sensors/t", false);
        h.uplink(3.0, 1, Packet::PingReq);
        h.run_until(4.0);

        let drops: Vec<(NodeId, Option<MessageKey>, BrokerDropReason)> = h
            .records
            .iter()
            .filter_map(|r| match &r.observation {
                Observation::BrokerDrop { node, key, reason } => Some((*node, *key, *reason)),
                _ => None,
            })
            .collect();
        assert_eq!(
            drops,
            vec![
                (NodeId(1), Some(key(1, 1)), BrokerDropReason::BrokerDown),
                (NodeId(1), None, BrokerDropReason::BrokerDown),
            ]
        );
        assert!(!h
            .seen
            .lock()
            .expect("lock")
            .iter()
            .any(|(_, p)| matches!(p, Packet::PubAck { .. })));
    }

    #[test]
    fn test_offline_qos0_copy_and_unmatched_message_are_dropped() {
        let mut h = Harness::new(BrokerConfig::default());
        h.connect(0.0, 1, false, None);
        h.uplink(0.5, 1, subscribe_qos("sensors/#", QoS::AtMostOnce));
        h.uplink(1.0, 1, Packet::Disconnect);
        h.connect(1.5, 2, true, None);
        h.publish(2.0, 2, 1, "sensors/t", false);
        h.publish(2.5, 2, 2, "alerts/x", false);
        h.run_until(3.0);

        assert_eq!(h.queue_depth_reports(), Vec::<usize>::new());
        let drops: Vec<(NodeId, Option<MessageKey>, BrokerDropReason)> = h
            .records
            .iter()
            .filter_map(|r| match &r.observation {
                Observation::BrokerDrop { node, key, reason } => Some((*node, *key, *reason)),
                _ => None,
            })
            .collect();
        assert_eq!(
            drops,
            vec![
                (NodeId(1), Some(key(2, 1)), BrokerDropReason::SubscriberOffline),
                (NodeId(2), Some(key(2, 2)), BrokerDropReason::NoSubscriber),
            ]
        );
    }

    #[test]
    fn test_clean_reconnect_discards_queued_messages() {
        let mut h = Harness::new(BrokerConfig::default());
        h.connect(0.0, 1, false, None);
        h.uplink(0.5, 1, subscribe("alerts/#"));
        h.uplink(1.0, 1, Packet::Disconnect);
        h.connect(1.5, 2, true, None);
        h.publish(2.0, 2, 1, "alerts/a", false);
        h.run_until(3.0);
        assert_eq!(h.queue_depth_reports(), vec![1]);

        h.connect(4.0, 1, true, None);
        h.publish(5.0, 2, 2, "alerts/b", false);
        h.run_until(6.0);

        let acks: Vec<bool> = h
            .seen
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|(to, p)| match p {
                Packet::ConnAck { session_present } if *to == NodeId(1) => Some(*session_present),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![false, false]);
        assert!(h.publishes_to(1).is_empty());
        let discarded: Vec<(Vec<MessageKey>, DiscardReason)> = h
            .records
            .iter()
            .filter_map(|r| match &r.observation {
                Observation::SessionDiscarded { client, keys, reason } if *client == NodeId(1) => {
                    Some((keys.clone(), *reason))
                }
                _ => None,
            })
            .collect();
        assert_eq!(discarded, vec![(vec![key(2, 1)], DiscardReason::CleanSession)]);
        assert_eq!(h.queue_depth_reports(), vec![1, 0]);
        // the old subscription went with the session
        assert_eq!(
            h.count(|o| matches!(
                o,
                Observation::BrokerDrop {
                    reason: BrokerDropReason::NoSubscriber,
                    ..
                }
            )),
            1
        );
    }
}
