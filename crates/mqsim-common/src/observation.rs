//! Observation stream emitted by entities for passive consumers.
//!
//! Entities describe what happened through [`SimContext::emit`](crate::SimContext::emit);
//! the event loop hands each [`Record`] to every attached [`EventSink`].
//! Sinks only ever see shared references, so they cannot influence a run.

use crate::{MessageKey, NodeId, Position, QoS, SimTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Externally visible radio state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RadioState {
    /// Awake, neither transmitting nor receiving.
    Idle,
    /// Transmitting.
    Tx,
    /// Receiving or waiting for an acknowledgment.
    Rx,
    /// Asleep (duty cycle, between BLE connection events, or battery empty).
    Sleep,
}

/// MQTT client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    /// Not connected and not trying.
    Disconnected,
    /// CONNECT sent, waiting for CONNACK.
    Connecting,
    /// Session established.
    Connected,
    /// Waiting for the reconnect backoff to elapse.
    Reconnecting,
}

/// Why a client left the CONNECTED (or CONNECTING) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    /// Consecutive MAC-layer drops reached the threshold.
    MacDrops,
    /// BLE supervision timeout.
    SupervisionTimeout,
    /// No PINGRESP within the ping timeout.
    KeepAliveTimeout,
    /// The gateway reported a broker crash.
    BrokerReset,
    /// No CONNACK within the connect timeout.
    ConnectTimeout,
    /// Explicit stop command.
    Stopped,
    /// The node's battery ran out.
    BatteryDepleted,
}

impl DisconnectCause {
    /// Stable label for counters.
    pub fn label(&self) -> &'static str {
        match self {
            DisconnectCause::MacDrops => "mac_drops",
            DisconnectCause::SupervisionTimeout => "supervision_timeout",
            DisconnectCause::KeepAliveTimeout => "keepalive_timeout",
            DisconnectCause::BrokerReset => "broker_reset",
            DisconnectCause::ConnectTimeout => "connect_timeout",
            DisconnectCause::Stopped => "stopped",
            DisconnectCause::BatteryDepleted => "battery_depleted",
        }
    }
}

/// Why a QoS1 message reached a terminal state without an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// Every retransmission went unacknowledged.
    RetriesExhausted,
    /// In-flight state thrown away by a clean-session reconnect.
    CleanSessionDiscard,
    /// The publisher died with the message still pending.
    NodeDepleted,
}

/// Why the broker threw a stored session away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// The client reconnected with `clean_session = true`.
    CleanSession,
    /// The session stayed disconnected past the expiry bound.
    Expired,
}

/// Why the broker dropped a packet or a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerDropReason {
    /// The packet arrived while the broker was FAILED.
    BrokerDown,
    /// A QoS0 message matched an offline persistent session, which only queues QoS1.
    SubscriberOffline,
    /// A client message matched no subscription at all.
    NoSubscriber,
}

impl BrokerDropReason {
    /// Stable label for counters.
    pub fn label(&self) -> &'static str {
        match self {
            BrokerDropReason::BrokerDown => "broker_down",
            BrokerDropReason::SubscriberOffline => "subscriber_offline",
            BrokerDropReason::NoSubscriber => "no_subscriber",
        }
    }
}

/// Direction of a hop relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDirection {
    /// Client towards broker.
    Uplink,
    /// Broker towards client.
    Downlink,
}

/// Time spent per radio state over an accounting interval, and its energy.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EnergyUsage {
    /// Seconds transmitting.
    pub tx_s: f64,
    /// Seconds receiving or waiting for an acknowledgment.
    pub rx_s: f64,
    /// Seconds awake and idle.
    pub idle_s: f64,
    /// Seconds asleep.
    pub sleep_s: f64,
    /// Energy drawn over the interval, in joules.
    pub joules: f64,
}

impl EnergyUsage {
    /// Accumulate another interval.
    pub fn add(&mut self, other: &EnergyUsage) {
        self.tx_s += other.tx_s;
        self.rx_s += other.rx_s;
        self.idle_s += other.idle_s;
        self.sleep_s += other.sleep_s;
        self.joules += other.joules;
    }

    /// Total accounted seconds.
    pub fn total_s(&self) -> f64 {
        self.tx_s + self.rx_s + self.idle_s + self.sleep_s
    }

    /// Fraction of accounted time spent asleep (0 when nothing was accounted).
    pub fn sleep_ratio(&self) -> f64 {
        let total = self.total_s();
        if total > 0.0 {
            self.sleep_s / total
        } else {
            0.0
        }
    }
}

/// Something that happened in the simulated system.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    // ======== MQTT publisher side ========
    /// The application published a message.
    Published {
        /// Message identity.
        key: MessageKey,
        /// Topic name.
        topic: String,
        /// Requested QoS.
        qos: QoS,
        /// Retain flag.
        retain: bool,
    },
    /// A QoS1 message was sent again with `dup = true`.
    Retransmitted {
        /// Message identity.
        key: MessageKey,
        /// Retransmission number, starting at 1.
        attempt: u32,
    },
    /// The broker acknowledged a QoS1 message.
    Acked {
        /// Message identity.
        key: MessageKey,
        /// Retransmissions needed.
        retries: u32,
    },
    /// A QoS1 message was given up.
    Lost {
        /// Message identity.
        key: MessageKey,
        /// Terminal reason.
        reason: LossReason,
    },
    /// A reading was evicted from a full client outbox while offline.
    OutboxDrop {
        /// Publishing node.
        node: NodeId,
        /// Evicted message.
        key: MessageKey,
    },

    // ======== MQTT subscriber side ========
    /// A subscriber received a PUBLISH.
    Delivered {
        /// Message identity.
        key: MessageKey,
        /// Receiving node.
        subscriber: NodeId,
        /// Original publish time.
        publish_time: SimTime,
        /// DUP flag as received.
        dup: bool,
        /// True when served from the retained store.
        retained: bool,
    },

    // ======== Broker ========
    /// The broker gave up an outbound QoS1 delivery.
    DeliveryAbandoned {
        /// Message identity.
        key: MessageKey,
        /// Intended subscriber.
        subscriber: NodeId,
    },
    /// An offline subscriber's queue was full; the incoming message was dropped.
    QueueDrop {
        /// Subscriber whose queue overflowed.
        subscriber: NodeId,
        /// Dropped message.
        key: MessageKey,
    },
    /// A stored session and its queued messages were discarded.
    SessionDiscarded {
        /// Client owning the session.
        client: NodeId,
        /// Queued plus in-flight messages thrown away.
        keys: Vec<MessageKey>,
        /// Why the session was discarded.
        reason: DiscardReason,
    },
    /// The broker dropped a packet, or a message it could not route.
    BrokerDrop {
        /// Sender for a refused packet; subscriber for an unroutable copy,
        /// or the publisher when nobody subscribed.
        node: NodeId,
        /// Carried message, for PUBLISH.
        key: Option<MessageKey>,
        /// Why.
        reason: BrokerDropReason,
    },
    /// Messages queued for offline sessions changed.
    BrokerQueueDepth {
        /// Queued messages over every offline session.
        depth: usize,
    },
    /// The broker published a client's last will.
    WillPublished {
        /// Client that disconnected abnormally.
        client: NodeId,
        /// Will topic.
        topic: String,
    },
    /// The broker crashed.
    BrokerFailed {
        /// Clients connected at the instant of the crash.
        affected: Vec<NodeId>,
    },
    /// The broker is back up.
    BrokerRestored,

    // ======== Client state ========
    /// A client changed connection state.
    ClientState {
        /// Client node.
        node: NodeId,
        /// New state.
        state: ClientState,
        /// Failure that caused the transition, if any.
        cause: Option<DisconnectCause>,
    },

    // ======== Radio ========
    /// Energy drawn since the node's previous accounting point.
    Energy {
        /// Node.
        node: NodeId,
        /// Breakdown of the interval.
        usage: EnergyUsage,
        /// Battery left after the interval, never negative.
        remaining_j: f64,
    },
    /// Radio state changed.
    RadioState {
        /// Node.
        node: NodeId,
        /// New state.
        state: RadioState,
    },
    /// Battery reached zero.
    NodeDepleted {
        /// Node.
        node: NodeId,
    },
    /// A frame was dropped at the MAC layer after its retry.
    MacDrop {
        /// Client node on the radio end.
        node: NodeId,
        /// Direction of the frame.
        direction: LinkDirection,
        /// Carried message, for PUBLISH frames.
        key: Option<MessageKey>,
    },
    /// The gateway-broker hop dropped a packet.
    BackhaulDrop {
        /// Client node the packet belonged to.
        node: NodeId,
        /// Direction of the packet.
        direction: LinkDirection,
        /// Carried message, for PUBLISH packets.
        key: Option<MessageKey>,
    },

    // ======== Topology ========
    /// A node's gateway coverage changed.
    LinkChanged {
        /// Node.
        node: NodeId,
        /// True when a gateway is in range.
        up: bool,
    },
    /// A node or gateway moved.
    Moved {
        /// Node or gateway.
        node: NodeId,
        /// New position.
        position: Position,
    },
    /// A frame went on the air.
    AirStarted {
        /// Transmission id, unique within the run.
        transmission: u64,
        /// Client node.
        node: NodeId,
        /// Gateway at the other end.
        gateway: NodeId,
        /// Direction of the frame.
        direction: LinkDirection,
        /// Time the frame leaves the air.
        end: SimTime,
    },
    /// A frame left the air.
    AirEnded {
        /// Transmission id.
        transmission: u64,
        /// Whether the receiver got it.
        delivered: bool,
    },
}

/// An observation stamped with the virtual time it happened at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Virtual time.
    pub time: SimTime,
    /// What happened.
    pub observation: Observation,
}

/// Errors raised by sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Output failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("{0}")]
    Failed(String),
}

/// Consumer of the observation stream (metrics, GUI feed, trace files).
pub trait EventSink: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Consume one record.
    fn observe(&mut self, record: &Record) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_usage_accumulates() {
        let mut total = EnergyUsage::default();
        total.add(&EnergyUsage {
            tx_s: 1.0,
            rx_s: 0.0,
            idle_s: 1.0,
            sleep_s: 18.0,
            joules: 0.5,
        });
        total.add(&EnergyUsage {
            sleep_s: 20.0,
            joules: 0.25,
            ..Default::default()
        });
        assert!((total.total_s() - 40.0).abs() < 1e-12);
        assert!((total.sleep_ratio() - 0.95).abs() < 1e-12);
        assert!((total.joules - 0.75).abs() < 1e-12);
        assert_eq!(EnergyUsage::default().sleep_ratio(), 0.0);
    }
}
