//! # mqsim-metrics
//!
//! Two complementary views of a run:
//!
//! - [`metric_defs`]: named counters and histograms emitted by entities through
//!   the [`metrics`] facade. They are no-ops unless a recorder is installed.
//! - [`MetricsAggregator`]: an [`EventSink`](mqsim_common::EventSink) that folds
//!   the observation stream into an immutable [`MetricsSnapshot`].
//! - [`SeriesRecorder`]: snapshots sampled on a fixed virtual-time grid.

pub mod aggregator;
pub mod series;

pub use aggregator::{
    FailoverStats, MetricsAggregator, MetricsSnapshot, NodeEnergy, NodeLabel, ProtocolStats,
    TopicStats,
};
pub use series::{SeriesPoint, SeriesRecorder};
pub use metrics;

// ============================================================================
// Metric Definitions
// ============================================================================

/// Kind of a facade metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Value that goes up and down.
    Gauge,
    /// Distribution of samples.
    Histogram,
}

/// Static description of a facade metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    /// Metric name.
    pub name: &'static str,
    /// Kind.
    pub kind: MetricKind,
    /// Unit of the recorded values.
    pub unit: metrics::Unit,
    /// Human readable description.
    pub description: &'static str,
    /// Labels attached when emitted.
    pub labels: &'static [&'static str],
}

/// Facade metric names.
pub mod metric_defs {
    use super::{MetricDef, MetricKind};
    use metrics::Unit;

    const NODE_PHY: &[&str] = &["node", "phy"];

    /// Application messages published.
    pub const MQTT_PUBLISHED: MetricDef = MetricDef {
        name: "mqsim.mqtt.published",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        description: "Application messages published by clients",
        labels: NODE_PHY,
    };

    /// PUBLISH packets received by subscribers.
    pub const MQTT_DELIVERED: MetricDef = MetricDef {
        name: "mqsim.mqtt.delivered",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        description: "PUBLISH packets received by subscribing clients",
        labels: NODE_PHY,
    };

    /// Deliveries flagged as duplicates.
    pub const MQTT_DUPLICATES: MetricDef = MetricDef {
        name: "mqsim.mqtt.duplicates",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        description: "PUBLISH packets received with the DUP flag set",
        labels: NODE_PHY,
    };

    /// QoS1 retransmissions.
    pub const MQTT_RETRANSMISSIONS: MetricDef = MetricDef {
        name: "mqsim.mqtt.retransmissions",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        description: "QoS1 PUBLISH retransmissions sent by clients",
        labels: NODE_PHY,
    };

    /// QoS1 messages given up.
    pub const MQTT_LOST: MetricDef = MetricDef {
        name: "mqsim.mqtt.lost",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        description: "QoS1 messages dropped without acknowledgment",
        labels: NODE_PHY,
    };

    /// End-to-end latency.
    pub const MQTT_LATENCY: MetricDef = MetricDef {
        name: "mqsim.mqtt.latency_s",
        kind: MetricKind::Histogram,
        unit: Unit::Seconds,
        description: "Publish-to-delivery latency observed by subscribers",
        labels: NODE_PHY,
    };

    /// Client reconnect attempts.
    pub const MQTT_RECONNECTS: MetricDef = MetricDef {
        name: "mqsim.mqtt.reconnects",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        description: "Reconnect attempts started after a detected failure",
        labels: NODE_PHY,
    };

    /// Broker queue overflows.
    pub const BROKER_QUEUE_DROPS: MetricDef = MetricDef {
        name: "mqsim.broker.queue_drops",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        description: "Messages dropped because an offline subscriber's queue was full",
        labels: &["node"],
    };

    /// Packets and routed messages the broker dropped.
    pub const BROKER_DROPS: MetricDef = MetricDef {
        name: "mqsim.broker.drops",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        description: "Packets refused while FAILED and messages that could not be routed",
        labels: &["reason"],
    };

    /// Messages held for offline sessions.
    pub const BROKER_QUEUE_DEPTH: MetricDef = MetricDef {
        name: "mqsim.broker.queue_depth",
        kind: MetricKind::Gauge,
        unit: Unit::Count,
        description: "Messages queued for offline persistent sessions",
        labels: &[],
    };

    /// Last-will publications.
    pub const BROKER_WILLS: MetricDef = MetricDef {
        name: "mqsim.broker.wills_published",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        description: "Last-will messages published for abnormally closed sessions",
        labels: &["node"],
    };

    /// Frames put on the air by client radios.
    pub const RADIO_TX_FRAMES: MetricDef = MetricDef {
        name: "mqsim.radio.tx_frames",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        description: "Frames transmitted by client radios, retries included",
        labels: NODE_PHY,
    };

    /// Airtime of client transmissions.
    pub const RADIO_TX_AIRTIME: MetricDef = MetricDef {
        name: "mqsim.radio.tx_airtime_us",
        kind: MetricKind::Counter,
        unit: Unit::Microseconds,
        description: "Total time on air of client transmissions",
        labels: NODE_PHY,
    };

    /// Channel access delay.
    pub const RADIO_ACCESS_DELAY: MetricDef = MetricDef {
        name: "mqsim.radio.access_delay_s",
        kind: MetricKind::Histogram,
        unit: Unit::Seconds,
        description: "Delay between a frame reaching the head of the queue and going on air",
        labels: NODE_PHY,
    };

    /// MAC drops.
    pub const RADIO_MAC_DROPS: MetricDef = MetricDef {
        name: "mqsim.radio.mac_drops",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        description: "Frames dropped at the MAC layer after the retry",
        labels: NODE_PHY,
    };

    /// Every definition, for listing and describing.
    pub const ALL: &[MetricDef] = &[
        MQTT_PUBLISHED,
        MQTT_DELIVERED,
        MQTT_DUPLICATES,
        MQTT_RETRANSMISSIONS,
        MQTT_LOST,
        MQTT_LATENCY,
        MQTT_RECONNECTS,
        BROKER_QUEUE_DROPS,
        BROKER_DROPS,
        BROKER_QUEUE_DEPTH,
        BROKER_WILLS,
        RADIO_TX_FRAMES,
        RADIO_TX_AIRTIME,
        RADIO_ACCESS_DELAY,
        RADIO_MAC_DROPS,
    ];
}

/// Register descriptions for every metric with the installed recorder.
pub fn describe_metrics() {
    for def in metric_defs::ALL {
        match def.kind {
            MetricKind::Counter => metrics::describe_counter!(def.name, def.unit, def.description),
            MetricKind::Gauge => metrics::describe_gauge!(def.name, def.unit, def.description),
            MetricKind::Histogram => {
                metrics::describe_histogram!(def.name, def.unit, def.description)
            }
        }
    }
}

// ============================================================================
// Labels
// ============================================================================

/// Labels identifying the emitting node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    /// Node name.
    pub node: String,
    /// Radio technology, or "backhaul" for the broker side.
    pub phy: String,
}

impl MetricLabels {
    /// Labels for a node.
    pub fn new(node: impl Into<String>, phy: impl Into<String>) -> Self {
        MetricLabels {
            node: node.into(),
            phy: phy.into(),
        }
    }

    /// Label pairs for the facade macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("node", self.node.clone()), ("phy", self.phy.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_are_unique() {
        let names: HashSet<&str> = metric_defs::ALL.iter().map(|d| d.name).collect();
        assert_eq!(names.len(), metric_defs::ALL.len());
        assert!(metric_defs::ALL.iter().all(|d| d.name.starts_with("mqsim.")));
    }

    #[test]
    fn test_labels_carry_node_and_phy() {
        let labels = MetricLabels::new("sensor_0", "zigbee").to_labels();
        assert_eq!(labels[0], ("node", "sensor_0".to_string()));
        assert_eq!(labels[1], ("phy", "zigbee".to_string()));
    }
}
