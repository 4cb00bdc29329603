//! MQTT value types carried through the simulated network.
//!
//! Packets are modeled as in-process values. [`Packet::wire_size`] gives the
//! size an MQTT 3.1.1 encoding would have, which drives airtime.

use crate::{NodeId, SimTime};
use serde::{Deserialize, Serialize};

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Retried until acknowledged or the retry budget runs out.
    AtLeastOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(format!("unsupported QoS level {} (expected 0 or 1)", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

/// Identity of an application message: publishing node plus its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    /// Node that published the message.
    pub origin: NodeId,
    /// Per-publisher sequence number (the MQTT message id).
    pub seq: u32,
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

/// An application message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message identity.
    pub key: MessageKey,
    /// Topic name.
    pub topic: String,
    /// Payload length in bytes.
    pub payload_len: u32,
    /// Delivery guarantee.
    pub qos: QoS,
    /// Set on retransmissions.
    pub dup: bool,
    /// Retain flag.
    pub retain: bool,
    /// Virtual time at which the application published it.
    pub publish_time: SimTime,
}

/// Last-will registration sent with CONNECT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Will {
    /// Topic the will is published on.
    pub topic: String,
    /// Delivery guarantee of the will message.
    pub qos: QoS,
    /// Whether the will is retained.
    pub retain: bool,
    /// Payload length in bytes.
    pub payload_len: u32,
}

/// MQTT control packets (plus the gateway's connection-reset notice).
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Open a session.
    Connect {
        /// Client identifier.
        client_id: String,
        /// Discard any previous session state.
        clean_session: bool,
        /// Keep-alive interval announced to the broker.
        keepalive: SimTime,
        /// Optional last will.
        will: Option<Will>,
    },
    /// Session accepted.
    ConnAck {
        /// True when a previous session was resumed.
        session_present: bool,
    },
    /// Application message.
    Publish(Message),
    /// QoS1 acknowledgment.
    PubAck {
        /// Acknowledged message.
        key: MessageKey,
    },
    /// Subscribe to topic filters.
    Subscribe {
        /// Filters with their requested QoS.
        filters: Vec<(String, QoS)>,
    },
    /// Subscription accepted.
    SubAck {
        /// Number of granted filters.
        granted: usize,
    },
    /// Keep-alive request.
    PingReq,
    /// Keep-alive response.
    PingResp,
    /// Clean termination.
    Disconnect,
    /// The gateway lost its broker connection and reset the client's session.
    ConnectionReset,
}

impl Packet {
    /// Encoded size in bytes.
    pub fn wire_size(&self) -> usize {
        match self {
            Packet::Connect { client_id, will, .. } => {
                let will_len = will
                    .as_ref()
                    .map(|w| 2 + w.topic.len() + 2 + w.payload_len as usize)
                    .unwrap_or(0);
                2 + 10 + 2 + client_id.len() + will_len
            }
            Packet::ConnAck { .. } => 4,
            Packet::Publish(msg) => {
                let packet_id = if msg.qos == QoS::AtLeastOnce { 2 } else { 0 };
                2 + 2 + msg.topic.len() + packet_id + msg.payload_len as usize
            }
            Packet::PubAck { .. } => 4,
            Packet::Subscribe { filters } => {
                2 + 2 + filters.iter().map(|(f, _)| 2 + f.len() + 1).sum::<usize>()
            }
            Packet::SubAck { granted } => 4 + granted,
            Packet::PingReq | Packet::PingResp | Packet::Disconnect | Packet::ConnectionReset => 2,
        }
    }

    /// Short label for logs and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            Packet::Connect { .. } => "connect",
            Packet::ConnAck { .. } => "connack",
            Packet::Publish(_) => "publish",
            Packet::PubAck { .. } => "puback",
            Packet::Subscribe { .. } => "subscribe",
            Packet::SubAck { .. } => "suback",
            Packet::PingReq => "pingreq",
            Packet::PingResp => "pingresp",
            Packet::Disconnect => "disconnect",
            Packet::ConnectionReset => "reset",
        }
    }

    /// Key of the carried application message, for PUBLISH only.
    pub fn message_key(&self) -> Option<MessageKey> {
        match self {
            Packet::Publish(msg) => Some(msg.key),
            _ => None,
        }
    }
}

/// Identity of a radio frame, unique per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u64);

/// A packet wrapped for one radio hop.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame identity.
    pub id: FrameId,
    /// Client node on the radio end of the hop.
    pub node: NodeId,
    /// Carried packet.
    pub packet: Packet,
}

impl Frame {
    /// MQTT bytes carried by this frame (PHY header excluded).
    pub fn size_bytes(&self) -> usize {
        self.packet.wire_size()
    }
}
