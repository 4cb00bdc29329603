//! Observation-driven metrics.
//!
//! [`MetricsAggregator`] is a pure consumer: it only ever reads [`Record`]s
//! and never holds a handle into the simulation.

use mqsim_common::{
    ClientState, DisconnectCause, EnergyUsage, EventSink, MessageKey, NodeId, Observation, Record,
    SimTime, SinkError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const SECS_PER_DAY: f64 = 86_400.0;

// ============================================================================
// Snapshot Types
// ============================================================================

/// Delivery statistics for one protocol, or for the whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStats {
    /// Application messages published.
    pub published: u64,
    /// Published messages that reached at least one subscriber.
    pub delivered: u64,
    /// `delivered / published` (0 when nothing was published).
    pub delivery_ratio: f64,
    /// First-time receptions summed over subscribers.
    pub deliveries: u64,
    /// Receptions with `dup = true` of a message the subscriber already had.
    pub duplicates: u64,
    /// QoS1 messages acknowledged by the broker.
    pub acked: u64,
    /// QoS1 messages given up by their publisher.
    pub lost: u64,
    /// Mean publish-to-delivery latency in seconds.
    pub mean_latency_s: f64,
    /// 95th percentile latency in seconds.
    pub p95_latency_s: f64,
    /// Largest latency in seconds.
    pub max_latency_s: f64,
}

/// Energy account of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeEnergy {
    /// Radio technology.
    pub phy: String,
    /// Energy drawn so far, in joules.
    pub consumed_j: f64,
    /// Battery left, in joules.
    pub remaining_j: f64,
    /// Fraction of accounted time spent asleep.
    pub sleep_ratio: f64,
    /// Seconds transmitting.
    pub tx_s: f64,
    /// Seconds receiving.
    pub rx_s: f64,
    /// Seconds idle.
    pub idle_s: f64,
    /// Seconds asleep.
    pub sleep_s: f64,
    /// Battery lifetime at the average drain rate so far, in days.
    pub battery_days: Option<f64>,
    /// True once the battery hit zero.
    pub depleted: bool,
}

/// One injected broker failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailoverStats {
    /// Crash instant.
    pub failed_at_s: f64,
    /// Instant the broker was UP again.
    pub restored_at_s: Option<f64>,
    /// Clients connected at the crash.
    pub affected: usize,
    /// Affected clients that noticed the disconnect.
    pub detected: usize,
    /// Slowest detection delay after the crash.
    pub max_detection_s: Option<f64>,
    /// Broker UP to the last affected client CONNECTED again.
    pub restore_time_s: Option<f64>,
}

/// Per-topic publish and delivery counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicStats {
    /// Application messages published on the topic.
    pub published: u64,
    /// Of those, messages that reached at least one subscriber.
    pub delivered: u64,
}

/// Immutable aggregate of a run up to `time_s`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Virtual time of the snapshot.
    pub time_s: f64,
    /// All protocols together.
    pub overall: ProtocolStats,
    /// Breakdown keyed by the publisher's radio technology.
    pub per_protocol: BTreeMap<String, ProtocolStats>,
    /// Messages refused by full offline-subscriber queues.
    pub queue_drops: u64,
    /// Readings evicted from full client outboxes.
    pub outbox_drops: u64,
    /// Queued or in-flight messages thrown away with a discarded session.
    pub session_discards: u64,
    /// Packets and routed copies the broker dropped, by reason.
    pub broker_drops: BTreeMap<String, u64>,
    /// Published messages never delivered to any subscriber after at least
    /// one recorded drop or loss.
    pub messages_lost: u64,
    /// Published messages with neither a delivery nor a drop yet.
    /// `delivered + messages_lost + in_flight == published`.
    pub in_flight: u64,
    /// Publish time of the oldest in-flight message.
    pub oldest_in_flight_s: Option<f64>,
    /// Messages queued for offline sessions at the snapshot.
    pub broker_queue_depth: u64,
    /// Largest queue depth seen so far.
    pub max_broker_queue_depth: u64,
    /// Breakdown by topic name.
    pub topics: BTreeMap<String, TopicStats>,
    /// QoS1 retransmissions.
    pub retransmissions: u64,
    /// Outbound QoS1 deliveries the broker gave up.
    pub delivery_abandoned: u64,
    /// Non-duplicate repeat receptions (session resume redelivery).
    pub redeliveries: u64,
    /// Messages served from the retained store.
    pub retained_deliveries: u64,
    /// Last-will messages published.
    pub wills_published: u64,
    /// Receptions of last-will messages.
    pub will_deliveries: u64,
    /// QoS1 messages reported both acknowledged and lost (always 0 in a correct run).
    pub conflicting_outcomes: u64,
    /// MAC-layer drops, both directions.
    pub mac_drops: u64,
    /// Gateway-broker drops, both directions.
    pub backhaul_drops: u64,
    /// Energy per node name.
    pub energy: BTreeMap<String, NodeEnergy>,
    /// Sum of consumed energy.
    pub total_energy_j: f64,
    /// Mean sleep ratio over client nodes.
    pub mean_sleep_ratio: f64,
    /// Disconnect causes.
    pub disconnects: BTreeMap<String, u64>,
    /// Completed CONNECTs.
    pub connects: u64,
    /// Injected broker failures, in order.
    pub failovers: Vec<FailoverStats>,
    /// Restore time of the latest completed failover.
    pub restore_time_s: Option<f64>,
}

impl MetricsSnapshot {
    /// Stats for one protocol (default when it published nothing).
    pub fn protocol(&self, phy: &str) -> ProtocolStats {
        self.per_protocol.get(phy).cloned().unwrap_or_default()
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Static description of a node for labeling.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLabel {
    /// Node id.
    pub node: NodeId,
    /// Scenario name.
    pub name: String,
    /// Radio technology; `None` for gateways.
    pub phy: Option<String>,
    /// Initial battery.
    pub battery_j: f64,
}

#[derive(Debug, Clone)]
struct PublishInfo {
    protocol: String,
    topic: String,
    time: SimTime,
}

#[derive(Debug, Clone, Default)]
struct Counters {
    published: u64,
    delivered: u64,
    deliveries: u64,
    duplicates: u64,
    acked: u64,
    lost: u64,
    latencies: Vec<f64>,
}

impl Counters {
    fn record_delivery(&mut self, latency_s: f64, first: bool) {
        self.deliveries += 1;
        self.latencies.push(latency_s);
        if first {
            self.delivered += 1;
        }
    }

    fn stats(&self) -> ProtocolStats {
        let mut sorted = self.latencies.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let count = sorted.len();
        let mean = if count > 0 {
            sorted.iter().sum::<f64>() / count as f64
        } else {
            0.0
        };
        let p95 = if count > 0 {
            let idx = ((0.95 * (count - 1) as f64).round() as usize).min(count - 1);
            sorted[idx]
        } else {
            0.0
        };
        ProtocolStats {
            published: self.published,
            delivered: self.delivered,
            delivery_ratio: if self.published > 0 {
                self.delivered as f64 / self.published as f64
            } else {
                0.0
            },
            deliveries: self.deliveries,
            duplicates: self.duplicates,
            acked: self.acked,
            lost: self.lost,
            mean_latency_s: mean,
            p95_latency_s: p95,
            max_latency_s: sorted.last().copied().unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct EnergyAccount {
    usage: EnergyUsage,
    remaining_j: f64,
    depleted: bool,
}

#[derive(Debug, Clone)]
struct FailoverTracker {
    failed_at: SimTime,
    restored_at: Option<SimTime>,
    affected: BTreeSet<NodeId>,
    /// Affected clients not yet CONNECTED after the restore.
    pending: BTreeSet<NodeId>,
    detection: BTreeMap<NodeId, SimTime>,
    restore_time: Option<SimTime>,
}

impl FailoverTracker {
    fn stats(&self) -> FailoverStats {
        FailoverStats {
            failed_at_s: self.failed_at.as_secs_f64(),
            restored_at_s: self.restored_at.map(|t| t.as_secs_f64()),
            affected: self.affected.len(),
            detected: self.detection.len(),
            max_detection_s: self.detection.values().max().map(|t| t.as_secs_f64()),
            restore_time_s: self.restore_time.map(|t| t.as_secs_f64()),
        }
    }
}

/// Folds observations into running statistics.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    nodes: BTreeMap<NodeId, NodeLabel>,
    published: BTreeMap<MessageKey, PublishInfo>,
    delivered_keys: BTreeSet<MessageKey>,
    /// Keys with any recorded drop or loss.
    failed_keys: BTreeSet<MessageKey>,
    delivered_pairs: BTreeSet<(MessageKey, NodeId)>,
    acked_keys: BTreeSet<MessageKey>,
    lost_keys: BTreeSet<MessageKey>,
    overall: Counters,
    protocols: BTreeMap<String, Counters>,
    energy: BTreeMap<NodeId, EnergyAccount>,
    queue_drops: u64,
    outbox_drops: u64,
    session_discards: u64,
    broker_drops: BTreeMap<String, u64>,
    queue_depth: u64,
    max_queue_depth: u64,
    topics: BTreeMap<String, TopicStats>,
    retransmissions: u64,
    delivery_abandoned: u64,
    redeliveries: u64,
    retained_deliveries: u64,
    wills_published: u64,
    will_deliveries: u64,
    conflicting_outcomes: u64,
    mac_drops: u64,
    backhaul_drops: u64,
    disconnects: BTreeMap<String, u64>,
    connects: u64,
    failovers: Vec<FailoverTracker>,
    last_time: SimTime,
}

impl MetricsAggregator {
    /// Create an aggregator for the given nodes.
    pub fn new(nodes: Vec<NodeLabel>) -> Self {
        let energy = nodes
            .iter()
            .filter(|n| n.phy.is_some())
            .map(|n| {
                (
                    n.node,
                    EnergyAccount {
                        remaining_j: n.battery_j,
                        ..Default::default()
                    },
                )
            })
            .collect();
        MetricsAggregator {
            nodes: nodes.into_iter().map(|n| (n.node, n)).collect(),
            energy,
            ..Default::default()
        }
    }

    fn protocol_of(&self, node: NodeId) -> String {
        self.nodes
            .get(&node)
            .and_then(|n| n.phy.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn counters_for(&mut self, protocol: &str) -> &mut Counters {
        self.protocols.entry(protocol.to_string()).or_default()
    }

    /// Apply one record.
    pub fn apply(&mut self, record: &Record) {
        let now = record.time;
        self.last_time = self.last_time.max(now);
        match &record.observation {
            Observation::Published { key, topic, .. } => {
                let protocol = self.protocol_of(key.origin);
                self.published.insert(
                    *key,
                    PublishInfo {
                        protocol: protocol.clone(),
                        topic: topic.clone(),
                        time: now,
                    },
                );
                self.overall.published += 1;
                self.counters_for(&protocol).published += 1;
                self.topics.entry(topic.clone()).or_default().published += 1;
            }
            Observation::Retransmitted { .. } => self.retransmissions += 1,
            Observation::Acked { key, .. } => {
                if self.lost_keys.contains(key) {
                    self.conflicting_outcomes += 1;
                }
                if self.acked_keys.insert(*key) {
                    let protocol = self.protocol_of(key.origin);
                    self.overall.acked += 1;
                    self.counters_for(&protocol).acked += 1;
                }
            }
            Observation::Lost { key, .. } => {
                if self.acked_keys.contains(key) {
                    self.conflicting_outcomes += 1;
                }
                if self.lost_keys.insert(*key) {
                    let protocol = self.protocol_of(key.origin);
                    self.overall.lost += 1;
                    self.counters_for(&protocol).lost += 1;
                }
                self.failed_keys.insert(*key);
            }
            Observation::OutboxDrop { key, .. } => {
                self.outbox_drops += 1;
                self.failed_keys.insert(*key);
            }
            Observation::Delivered {
                key,
                subscriber,
                publish_time,
                dup,
                retained,
            } => self.apply_delivery(now, *key, *subscriber, *publish_time, *dup, *retained),
            Observation::DeliveryAbandoned { key, .. } => {
                self.delivery_abandoned += 1;
                self.failed_keys.insert(*key);
            }
            Observation::QueueDrop { key, .. } => {
                self.queue_drops += 1;
                self.failed_keys.insert(*key);
            }
            Observation::SessionDiscarded { keys, .. } => {
                self.session_discards += keys.len() as u64;
                self.failed_keys.extend(keys.iter().copied());
            }
            Observation::BrokerDrop { key, reason, .. } => {
                *self.broker_drops.entry(reason.label().to_string()).or_default() += 1;
                self.failed_keys.extend(*key);
            }
            Observation::BrokerQueueDepth { depth } => {
                self.queue_depth = *depth as u64;
                self.max_queue_depth = self.max_queue_depth.max(self.queue_depth);
            }
            Observation::WillPublished { .. } => self.wills_published += 1,
            Observation::BrokerFailed { affected } => {
                let affected: BTreeSet<NodeId> = affected.iter().copied().collect();
                self.failovers.push(FailoverTracker {
                    failed_at: now,
                    restored_at: None,
                    pending: affected.clone(),
                    affected,
                    detection: BTreeMap::new(),
                    restore_time: None,
                });
            }
            Observation::BrokerRestored => {
                for f in self.failovers.iter_mut().filter(|f| f.restored_at.is_none()) {
                    f.restored_at = Some(now);
                    if f.pending.is_empty() {
                        f.restore_time = Some(SimTime::ZERO);
                    }
                }
            }
            Observation::ClientState { node, state, cause } => {
                self.apply_client_state(now, *node, *state, *cause)
            }
            Observation::Energy {
                node,
                usage,
                remaining_j,
            } => {
                let account = self.energy.entry(*node).or_default();
                account.usage.add(usage);
                account.remaining_j = *remaining_j;
            }
            Observation::NodeDepleted { node } => {
                self.energy.entry(*node).or_default().depleted = true;
                self.forget_in_failovers(now, *node);
            }
            Observation::MacDrop { key, .. } => {
                self.mac_drops += 1;
                self.failed_keys.extend(*key);
            }
            Observation::BackhaulDrop { key, .. } => {
                self.backhaul_drops += 1;
                self.failed_keys.extend(*key);
            }
            Observation::RadioState { .. }
            | Observation::LinkChanged { .. }
            | Observation::Moved { .. }
            | Observation::AirStarted { .. }
            | Observation::AirEnded { .. } => {}
        }
    }

    fn apply_delivery(
        &mut self,
        now: SimTime,
        key: MessageKey,
        subscriber: NodeId,
        publish_time: SimTime,
        dup: bool,
        retained: bool,
    ) {
        if retained {
            self.retained_deliveries += 1;
            return;
        }
        let Some(info) = self.published.get(&key) else {
            // Only last-will messages are published by the broker on a client's behalf.
            self.will_deliveries += 1;
            return;
        };
        let protocol = info.protocol.clone();
        let topic = info.topic.clone();
        if !self.delivered_pairs.insert((key, subscriber)) {
            if dup {
                self.overall.duplicates += 1;
                self.counters_for(&protocol).duplicates += 1;
            } else {
                self.redeliveries += 1;
            }
            return;
        }
        let latency = (now - publish_time).as_secs_f64();
        let first = self.delivered_keys.insert(key);
        self.overall.record_delivery(latency, first);
        self.counters_for(&protocol).record_delivery(latency, first);
        if first {
            self.topics.entry(topic).or_default().delivered += 1;
        }
    }

    fn apply_client_state(
        &mut self,
        now: SimTime,
        node: NodeId,
        state: ClientState,
        cause: Option<DisconnectCause>,
    ) {
        match state {
            ClientState::Connected => {
                self.connects += 1;
                for f in &mut self.failovers {
                    let Some(restored_at) = f.restored_at else {
                        continue;
                    };
                    if f.pending.remove(&node) && f.pending.is_empty() {
                        f.restore_time = Some(now - restored_at);
                        debug!(
                            "Metrics: every client affected at {} back {} after restore",
                            f.failed_at,
                            now - restored_at
                        );
                    }
                }
            }
            ClientState::Reconnecting | ClientState::Disconnected => {
                let Some(cause) = cause else { return };
                *self.disconnects.entry(cause.label().to_string()).or_default() += 1;
                // A client still waiting to come back from a failover detects it at most once.
                for f in &mut self.failovers {
                    if f.pending.contains(&node) && !f.detection.contains_key(&node) {
                        f.detection.insert(node, now - f.failed_at);
                    }
                }
                if cause == DisconnectCause::BatteryDepleted {
                    self.forget_in_failovers(now, node);
                }
            }
            ClientState::Connecting => {}
        }
    }

    /// A dead node can no longer reconnect; stop waiting for it.
    fn forget_in_failovers(&mut self, now: SimTime, node: NodeId) {
        for f in &mut self.failovers {
            if f.pending.remove(&node) && f.pending.is_empty() {
                if let Some(restored_at) = f.restored_at {
                    if f.restore_time.is_none() {
                        f.restore_time = Some(now - restored_at);
                    }
                }
            }
        }
    }

    /// Immutable copy of the current statistics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed_s = self.last_time.as_secs_f64();
        let mut energy = BTreeMap::new();
        let mut total_energy_j = 0.0;
        let mut sleep_ratios = Vec::new();
        for (node, account) in &self.energy {
            let label = self.nodes.get(node);
            let name = label
                .map(|n| n.name.clone())
                .unwrap_or_else(|| node.to_string());
            let consumed = account.usage.joules;
            total_energy_j += consumed;
            let sleep_ratio = account.usage.sleep_ratio();
            if account.usage.total_s() > 0.0 {
                sleep_ratios.push(sleep_ratio);
            }
            let battery_days = if consumed > 0.0 && elapsed_s > 0.0 {
                Some(account.remaining_j / (consumed / elapsed_s) / SECS_PER_DAY)
            } else {
                None
            };
            energy.insert(
                name,
                NodeEnergy {
                    phy: label.and_then(|n| n.phy.clone()).unwrap_or_default(),
                    consumed_j: consumed,
                    remaining_j: account.remaining_j,
                    sleep_ratio,
                    tx_s: account.usage.tx_s,
                    rx_s: account.usage.rx_s,
                    idle_s: account.usage.idle_s,
                    sleep_s: account.usage.sleep_s,
                    battery_days,
                    depleted: account.depleted,
                },
            );
        }
        let mean_sleep_ratio = if sleep_ratios.is_empty() {
            0.0
        } else {
            sleep_ratios.iter().sum::<f64>() / sleep_ratios.len() as f64
        };

        let mut messages_lost = 0;
        let mut in_flight = 0;
        let mut oldest_in_flight: Option<SimTime> = None;
        for (key, info) in &self.published {
            if self.delivered_keys.contains(key) {
                continue;
            }
            if self.failed_keys.contains(key) {
                messages_lost += 1;
            } else {
                in_flight += 1;
                oldest_in_flight = Some(oldest_in_flight.map_or(info.time, |t| t.min(info.time)));
            }
        }

        let overall = self.overall.stats();
        let failovers: Vec<FailoverStats> = self.failovers.iter().map(|f| f.stats()).collect();
        let restore_time_s = failovers.iter().rev().find_map(|f| f.restore_time_s);

        MetricsSnapshot {
            time_s: elapsed_s,
            messages_lost,
            in_flight,
            oldest_in_flight_s: oldest_in_flight.map(|t| t.as_secs_f64()),
            overall,
            per_protocol: self
                .protocols
                .iter()
                .map(|(k, v)| (k.clone(), v.stats()))
                .collect(),
            queue_drops: self.queue_drops,
            outbox_drops: self.outbox_drops,
            session_discards: self.session_discards,
            broker_drops: self.broker_drops.clone(),
            broker_queue_depth: self.queue_depth,
            max_broker_queue_depth: self.max_queue_depth,
            topics: self.topics.clone(),
            retransmissions: self.retransmissions,
            delivery_abandoned: self.delivery_abandoned,
            redeliveries: self.redeliveries,
            retained_deliveries: self.retained_deliveries,
            wills_published: self.wills_published,
            will_deliveries: self.will_deliveries,
            conflicting_outcomes: self.conflicting_outcomes,
            mac_drops: self.mac_drops,
            backhaul_drops: self.backhaul_drops,
            energy,
            total_energy_j,
            mean_sleep_ratio,
            disconnects: self.disconnects.clone(),
            connects: self.connects,
            failovers,
            restore_time_s,
        }
    }
}

impl EventSink for MetricsAggregator {
    fn name(&self) -> &str {
        "metrics"
    }

    fn observe(&mut self, record: &Record) -> Result<(), SinkError> {
        self.apply(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqsim_common::{BrokerDropReason, DiscardReason, LinkDirection, LossReason, QoS};

    fn labels() -> Vec<NodeLabel> {
        vec![
            NodeLabel {
                node: NodeId(0),
                name: "sensor_0".into(),
                phy: Some("zigbee".into()),
                battery_j: 100.0,
            },
            NodeLabel {
                node: NodeId(1),
                name: "dash".into(),
                phy: Some("wifi".into()),
                battery_j: 100.0,
            },
        ]
    }

    fn key(seq: u32) -> MessageKey {
        MessageKey {
            origin: NodeId(0),
            seq,
        }
    }

    fn rec(t: f64, observation: Observation) -> Record {
        Record {
            time: SimTime::from_secs(t),
            observation,
        }
    }

    fn published(t: f64, seq: u32) -> Record {
        rec(
            t,
            Observation::Published {
                key: key(seq),
                topic: "sensors/t".into(),
                qos: QoS::AtLeastOnce,
                retain: false,
            },
        )
    }

    fn delivered(t: f64, seq: u32, publish_t: f64, dup: bool) -> Record {
        rec(
            t,
            Observation::Delivered {
                key: key(seq),
                subscriber: NodeId(1),
                publish_time: SimTime::from_secs(publish_t),
                dup,
                retained: false,
            },
        )
    }

    #[test]
    fn test_duplicate_counted_once_and_latency_from_first_copy() {
        let mut agg = MetricsAggregator::new(labels());
        agg.apply(&published(1.0, 1));
        agg.apply(&delivered(1.5, 1, 1.0, false));
        agg.apply(&delivered(3.5, 1, 1.0, true));
        agg.apply(&rec(3.6, Observation::Acked { key: key(1), retries: 1 }));

        let snap = agg.snapshot();
        assert_eq!(snap.overall.published, 1);
        assert_eq!(snap.overall.delivered, 1);
        assert_eq!(snap.overall.duplicates, 1);
        assert_eq!(snap.overall.acked, 1);
        assert!((snap.overall.mean_latency_s - 0.5).abs() < 1e-9);
        assert_eq!(snap.protocol("zigbee").duplicates, 1);
        assert_eq!(snap.protocol("ble"), ProtocolStats::default());
    }

    #[test]
    fn test_dup_without_prior_delivery_is_a_delivery() {
        let mut agg = MetricsAggregator::new(labels());
        agg.apply(&published(1.0, 1));
        agg.apply(&delivered(4.0, 1, 1.0, true));
        let snap = agg.snapshot();
        assert_eq!(snap.overall.delivered, 1);
        assert_eq!(snap.overall.duplicates, 0);
    }

    #[test]
    fn test_conflicting_outcome_detected() {
        let mut agg = MetricsAggregator::new(labels());
        agg.apply(&published(1.0, 1));
        agg.apply(&rec(2.0, Observation::Acked { key: key(1), retries: 0 }));
        agg.apply(&rec(
            3.0,
            Observation::Lost {
                key: key(1),
                reason: LossReason::RetriesExhausted,
            },
        ));
        assert_eq!(agg.snapshot().conflicting_outcomes, 1);
    }

    #[test]
    fn test_energy_and_sleep_ratio() {
        let mut agg = MetricsAggregator::new(labels());
        agg.apply(&rec(
            10.0,
            Observation::Energy {
                node: NodeId(0),
                usage: EnergyUsage {
                    idle_s: 0.5,
                    sleep_s: 9.5,
                    joules: 2.0,
                    ..Default::default()
                },
                remaining_j: 98.0,
            },
        ));
        let snap = agg.snapshot();
        let e = &snap.energy["sensor_0"];
        assert!((e.sleep_ratio - 0.95).abs() < 1e-9);
        assert!((e.remaining_j - 98.0).abs() < 1e-9);
        // 2 J per 10 s leaves 490 s of battery
        let days = e.battery_days.expect("drain observed");
        assert!((days * SECS_PER_DAY - 490.0).abs() < 1e-6);
        assert!((snap.mean_sleep_ratio - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_failover_restore_time_uses_last_reconnect() {
        let mut agg = MetricsAggregator::new(labels());
        agg.apply(&rec(
            100.0,
            Observation::BrokerFailed {
                affected: vec![NodeId(0), NodeId(1)],
            },
        ));
        for (t, node) in [(100.5, 0), (101.0, 1)] {
            agg.apply(&rec(
                t,
                Observation::ClientState {
                    node: NodeId(node),
                    state: ClientState::Reconnecting,
                    cause: Some(DisconnectCause::BrokerReset),
                },
            ));
        }
        agg.apply(&rec(110.0, Observation::BrokerRestored));
        for (t, node) in [(111.0, 1), (114.0, 0)] {
            agg.apply(&rec(
                t,
                Observation::ClientState {
                    node: NodeId(node),
                    state: ClientState::Connected,
                    cause: None,
                },
            ));
        }
        let snap = agg.snapshot();
        let f = &snap.failovers[0];
        assert_eq!(f.affected, 2);
        assert_eq!(f.detected, 2);
        assert_eq!(f.max_detection_s, Some(1.0));
        assert_eq!(f.restore_time_s, Some(4.0));
        assert_eq!(snap.restore_time_s, Some(4.0));
        assert_eq!(snap.disconnects["broker_reset"], 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut agg = MetricsAggregator::new(labels());
        agg.apply(&published(1.0, 1));
        let json = serde_json::to_string(&agg.snapshot()).expect("serialize");
        let back: MetricsSnapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, agg.snapshot());
    }

    fn client_state(t: f64, node: u32, state: ClientState) -> Record {
        let cause = match state {
            ClientState::Reconnecting => Some(DisconnectCause::BrokerReset),
            _ => None,
        };
        rec(
            t,
            Observation::ClientState {
                node: NodeId(node),
                state,
                cause,
            },
        )
    }

    #[test]
    fn test_loss_counts_undelivered_messages_once() {
        let mut agg = MetricsAggregator::new(labels());
        for seq in 1..=4 {
            agg.apply(&published(seq as f64, seq));
        }
        // retried after a drop, then delivered
        agg.apply(&rec(
            1.1,
            Observation::MacDrop {
                node: NodeId(0),
                direction: LinkDirection::Uplink,
                key: Some(key(1)),
            },
        ));
        agg.apply(&delivered(3.5, 1, 1.0, false));
        // two drops of the same message
        agg.apply(&rec(
            2.1,
            Observation::BrokerDrop {
                node: NodeId(1),
                key: Some(key(2)),
                reason: BrokerDropReason::SubscriberOffline,
            },
        ));
        agg.apply(&rec(
            2.2,
            Observation::QueueDrop {
                subscriber: NodeId(1),
                key: key(2),
            },
        ));
        agg.apply(&rec(
            3.1,
            Observation::SessionDiscarded {
                client: NodeId(1),
                keys: vec![key(3)],
                reason: DiscardReason::CleanSession,
            },
        ));
        // a will nobody subscribed to is not an application message
        agg.apply(&rec(
            3.2,
            Observation::BrokerDrop {
                node: NodeId(9),
                key: Some(MessageKey {
                    origin: NodeId(9),
                    seq: 0,
                }),
                reason: BrokerDropReason::NoSubscriber,
            },
        ));

        let snap = agg.snapshot();
        assert_eq!(snap.overall.published, 4);
        assert_eq!(snap.overall.delivered, 1);
        assert_eq!(snap.messages_lost, 2);
        assert_eq!(snap.in_flight, 1);
        assert_eq!(snap.oldest_in_flight_s, Some(4.0));
        assert_eq!(
            snap.overall.delivered + snap.messages_lost + snap.in_flight,
            snap.overall.published
        );
        assert_eq!(snap.broker_drops["subscriber_offline"], 1);
        assert_eq!(snap.broker_drops["no_subscriber"], 1);
        assert_eq!(snap.queue_drops, 1);
        assert_eq!(snap.session_discards, 1);
        assert_eq!(snap.mac_drops, 1);
    }

    #[test]
    fn test_queue_depth_and_topic_counters() {
        let mut agg = MetricsAggregator::new(labels());
        agg.apply(&published(1.0, 1));
        agg.apply(&published(2.0, 2));
        agg.apply(&rec(
            2.5,
            Observation::Published {
                key: key(3),
                topic: "alerts/a".into(),
                qos: QoS::AtMostOnce,
                retain: false,
            },
        ));
        agg.apply(&delivered(3.0, 1, 1.0, false));
        agg.apply(&delivered(3.5, 1, 1.0, true));
        for (t, depth) in [(4.0, 1), (4.5, 3), (5.0, 0)] {
            agg.apply(&rec(t, Observation::BrokerQueueDepth { depth }));
        }

        let snap = agg.snapshot();
        assert_eq!(snap.broker_queue_depth, 0);
        assert_eq!(snap.max_broker_queue_depth, 3);
        assert_eq!(
            snap.topics["sensors/t"],
            TopicStats {
                published: 2,
                delivered: 1
            }
        );
        assert_eq!(
            snap.topics["alerts/a"],
            TopicStats {
                published: 1,
                delivered: 0
            }
        );
    }

    #[test]
    fn test_overlapping_failovers_each_close() {
        let mut agg = MetricsAggregator::new(labels());
        agg.apply(&rec(
            100.0,
            Observation::BrokerFailed {
                affected: vec![NodeId(0), NodeId(1)],
            },
        ));
        agg.apply(&client_state(100.5, 0, ClientState::Reconnecting));
        agg.apply(&client_state(100.8, 1, ClientState::Reconnecting));
        agg.apply(&rec(110.0, Observation::BrokerRestored));
        agg.apply(&client_state(111.0, 0, ClientState::Connected));
        // node 1 is still away when the broker fails again
        agg.apply(&rec(
            112.0,
            Observation::BrokerFailed {
                affected: vec![NodeId(0)],
            },
        ));
        agg.apply(&client_state(112.5, 0, ClientState::Reconnecting));
        agg.apply(&rec(120.0, Observation::BrokerRestored));
        agg.apply(&client_state(121.0, 1, ClientState::Connected));
        agg.apply(&client_state(122.0, 0, ClientState::Connected));

        let snap = agg.snapshot();
        assert_eq!(snap.failovers.len(), 2);
        let first = &snap.failovers[0];
        assert_eq!(first.restored_at_s, Some(110.0));
        assert_eq!(first.detected, 2);
        assert_eq!(first.restore_time_s, Some(11.0));
        let second = &snap.failovers[1];
        assert_eq!(second.restored_at_s, Some(120.0));
        assert_eq!(second.detected, 1);
        assert_eq!(second.max_detection_s, Some(0.5));
        assert_eq!(second.restore_time_s, Some(2.0));
        assert_eq!(snap.restore_time_s, Some(2.0));
    }
}
