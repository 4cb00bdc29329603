//! Scenario schema.
//!
//! A scenario is one YAML document: global parameters, gateways, nodes and
//! an optional scheduled broker crash. Every struct rejects unknown fields.

use crate::ModelError;
use mqsim_common::{Position, QoS};
use mqsim_mobility::{Bounds, MobilityConfig};
use mqsim_phy::PhyKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

// ============================================================================
// Schema
// ============================================================================

/// A complete scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Run label; keys the exported snapshot.
    #[serde(default = "default_label")]
    pub label: String,
    /// Seed of the run's single random source.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Virtual run length in seconds.
    #[serde(default = "default_duration")]
    pub duration_s: f64,
    /// Simulation area.
    #[serde(default = "default_area")]
    pub area: Bounds,
    /// Global experiment parameters.
    #[serde(default)]
    pub params: Params,
    /// Gateways bridging radios to the broker.
    pub gateways: Vec<GatewayConfig>,
    /// Client nodes.
    pub nodes: Vec<NodeConfig>,
    /// Scheduled broker crash.
    #[serde(default)]
    pub failover: Option<FailoverConfig>,
}

fn default_label() -> String {
    "scenario".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_duration() -> f64 {
    600.0
}

fn default_area() -> Bounds {
    Bounds::new(100.0, 100.0)
}

/// Global experiment parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Params {
    /// Zigbee active fraction, in (0, 1].
    pub duty_cycle: f64,
    /// Length of one duty cycle.
    pub duty_cycle_period_s: f64,
    /// BLE connection interval.
    pub ble_conn_interval_ms: f64,
    /// Missed BLE connection events before supervision timeout.
    pub ble_supervision_events: u32,
    /// QoS1 retransmissions before a message is lost.
    pub max_retries: u32,
    /// QoS1 retransmission interval.
    pub retry_interval_s: f64,
    /// First reconnect delay.
    pub backoff_base_s: f64,
    /// Reconnect delay cap.
    pub backoff_cap_s: f64,
    /// Uniform jitter added to each reconnect delay.
    pub backoff_jitter_s: f64,
    /// Broker queue per offline persistent session.
    pub queue_capacity: usize,
    /// Lifetime of a disconnected persistent session.
    pub session_expiry_s: f64,
    /// Client keep-alive interval.
    pub keepalive_s: f64,
    /// Time a client waits for PINGRESP.
    pub ping_timeout_s: f64,
    /// Time a client waits for CONNACK.
    pub connect_timeout_s: f64,
    /// Per-attempt MAC frame loss probability.
    pub mac_loss_rate: f64,
    /// Consecutive MAC drops that count as a disconnect.
    pub mac_drop_threshold: u32,
    /// Readings buffered by an offline client.
    pub outbox_capacity: usize,
    /// Period of per-node energy reports.
    pub energy_report_interval_s: f64,
    /// Period of the snapshot time series.
    pub snapshot_interval_s: f64,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            duty_cycle: 1.0,
            duty_cycle_period_s: 1.0,
            ble_conn_interval_ms: 60.0,
            ble_supervision_events: 84,
            max_retries: 3,
            retry_interval_s: 2.0,
            backoff_base_s: 0.5,
            backoff_cap_s: 5.0,
            backoff_jitter_s: 0.5,
            queue_capacity: 500,
            session_expiry_s: 3600.0,
            keepalive_s: 30.0,
            ping_timeout_s: 5.0,
            connect_timeout_s: 3.0,
            mac_loss_rate: 0.0,
            mac_drop_threshold: 3,
            outbox_capacity: 32,
            energy_report_interval_s: 10.0,
            snapshot_interval_s: 5.0,
        }
    }
}

/// A gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Unique name.
    pub id: String,
    /// Initial position.
    pub position: Position,
    /// Movement.
    #[serde(default)]
    pub mobility: MobilityConfig,
    /// Link to the broker.
    #[serde(default)]
    pub backhaul: BackhaulConfig,
}

/// Gateway-broker link parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackhaulConfig {
    /// Mean one-way latency.
    pub latency_ms: f64,
    /// Uniform jitter bound.
    pub jitter_ms: f64,
    /// Packet loss probability.
    pub loss_rate: f64,
}

impl Default for BackhaulConfig {
    fn default() -> Self {
        BackhaulConfig {
            latency_ms: 50.0,
            jitter_ms: 10.0,
            loss_rate: 0.0,
        }
    }
}

/// A client node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Unique name, also the MQTT client id.
    pub id: String,
    /// Radio technology.
    pub phy: PhyKind,
    /// Initial position.
    pub position: Position,
    /// Movement.
    #[serde(default)]
    pub mobility: MobilityConfig,
    /// MQTT clean-session flag.
    #[serde(default)]
    pub clean_session: bool,
    /// Battery capacity in joules.
    #[serde(default = "default_battery")]
    pub battery_j: f64,
    /// Duty-cycle override (Zigbee only).
    #[serde(default)]
    pub duty_cycle: Option<f64>,
    /// Periodic readings.
    #[serde(default)]
    pub publish: Option<PublishSpec>,
    /// Topic subscriptions.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSpec>,
    /// Last will.
    #[serde(default)]
    pub will: Option<WillSpec>,
}

fn default_battery() -> f64 {
    500.0
}

fn default_qos() -> QoS {
    QoS::AtMostOnce
}

fn default_payload() -> u32 {
    32
}

/// Periodic publishing of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishSpec {
    /// Topic name.
    pub topic: String,
    /// 0 or 1.
    #[serde(default = "default_qos")]
    pub qos: QoS,
    /// Mean time between readings.
    pub interval_s: f64,
    /// Standard deviation of the reading interval.
    #[serde(default)]
    pub interval_jitter_s: f64,
    /// Payload length.
    #[serde(default = "default_payload")]
    pub payload_bytes: u32,
    /// Retain flag.
    #[serde(default)]
    pub retain: bool,
}

/// A subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionSpec {
    /// Topic filter.
    pub filter: String,
    /// Requested QoS.
    #[serde(default = "default_qos")]
    pub qos: QoS,
}

/// A last-will registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WillSpec {
    /// Topic.
    pub topic: String,
    /// 0 or 1.
    #[serde(default = "default_qos")]
    pub qos: QoS,
    /// Retain flag.
    #[serde(default)]
    pub retain: bool,
    /// Payload length.
    #[serde(default = "default_payload")]
    pub payload_bytes: u32,
}

/// A scheduled broker crash.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailoverConfig {
    /// Crash instant.
    pub at_s: f64,
    /// Outage length.
    pub duration_s: f64,
}

// ============================================================================
// Loading
// ============================================================================

impl Scenario {
    /// Parse and validate a scenario from YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Scenario, ModelError> {
        let scenario: Scenario = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load and validate a scenario file.
    pub fn load(path: &Path) -> Result<Scenario, ModelError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// YAML rendering of this scenario.
    pub fn to_yaml(&self) -> Result<String, ModelError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Same scenario with every node's session mode overridden.
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        for node in &mut self.nodes {
            node.clean_session = clean_session;
        }
        self
    }

    /// Same scenario with another seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check every constraint the builder relies on.
    pub fn validate(&self) -> Result<(), ModelError> {
        fn invalid(msg: String) -> Result<(), ModelError> {
            Err(ModelError::InvalidConfig(msg))
        }
        fn positive(name: &str, value: f64) -> Result<(), ModelError> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                invalid(format!("{} must be positive, got {}", name, value))
            }
        }
        fn non_negative(name: &str, value: f64) -> Result<(), ModelError> {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                invalid(format!("{} must not be negative, got {}", name, value))
            }
        }
        fn probability(name: &str, value: f64) -> Result<(), ModelError> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                invalid(format!("{} must lie in [0, 1], got {}", name, value))
            }
        }
        fn duty_cycle(name: &str, value: f64) -> Result<(), ModelError> {
            if value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                invalid(format!("{} must lie in (0, 1], got {}", name, value))
            }
        }

        if self.nodes.is_empty() {
            return invalid("scenario has no nodes".to_string());
        }
        if self.gateways.is_empty() {
            return invalid("scenario has no gateways".to_string());
        }
        positive("duration_s", self.duration_s)?;
        positive("area.width_m", self.area.width_m)?;
        positive("area.height_m", self.area.height_m)?;

        let p = &self.params;
        duty_cycle("params.duty_cycle", p.duty_cycle)?;
        positive("params.duty_cycle_period_s", p.duty_cycle_period_s)?;
        positive("params.ble_conn_interval_ms", p.ble_conn_interval_ms)?;
        if p.ble_supervision_events == 0 {
            return invalid("params.ble_supervision_events must be at least 1".to_string());
        }
        positive("params.retry_interval_s", p.retry_interval_s)?;
        positive("params.backoff_base_s", p.backoff_base_s)?;
        positive("params.backoff_cap_s", p.backoff_cap_s)?;
        non_negative("params.backoff_jitter_s", p.backoff_jitter_s)?;
        if p.backoff_cap_s < p.backoff_base_s {
            return invalid(format!(
                "params.backoff_cap_s ({}) is below params.backoff_base_s ({})",
                p.backoff_cap_s, p.backoff_base_s
            ));
        }
        if p.queue_capacity == 0 {
            return invalid("params.queue_capacity must be at least 1".to_string());
        }
        positive("params.session_expiry_s", p.session_expiry_s)?;
        positive("params.keepalive_s", p.keepalive_s)?;
        positive("params.ping_timeout_s", p.ping_timeout_s)?;
        positive("params.connect_timeout_s", p.connect_timeout_s)?;
        probability("params.mac_loss_rate", p.mac_loss_rate)?;
        if p.mac_drop_threshold == 0 {
            return invalid("params.mac_drop_threshold must be at least 1".to_string());
        }
        positive("params.energy_report_interval_s", p.energy_report_interval_s)?;
        positive("params.snapshot_interval_s", p.snapshot_interval_s)?;

        let mut names = BTreeSet::new();
        for gw in &self.gateways {
            if !names.insert(gw.id.as_str()) {
                return Err(ModelError::DuplicateNode(gw.id.clone()));
            }
            if !self.area.contains(&gw.position) {
                return invalid(format!("gateway {} lies outside the area", gw.id));
            }
            non_negative(&format!("gateways.{}.backhaul.latency_ms", gw.id), gw.backhaul.latency_ms)?;
            non_negative(&format!("gateways.{}.backhaul.jitter_ms", gw.id), gw.backhaul.jitter_ms)?;
            probability(&format!("gateways.{}.backhaul.loss_rate", gw.id), gw.backhaul.loss_rate)?;
        }

        for node in &self.nodes {
            if !names.insert(node.id.as_str()) {
                return Err(ModelError::DuplicateNode(node.id.clone()));
            }
            if !self.area.contains(&node.position) {
                return invalid(format!("node {} lies outside the area", node.id));
            }
            positive(&format!("nodes.{}.battery_j", node.id), node.battery_j)?;
            if let Some(dc) = node.duty_cycle {
                duty_cycle(&format!("nodes.{}.duty_cycle", node.id), dc)?;
            }
            if let Some(publish) = &node.publish {
                positive(&format!("nodes.{}.publish.interval_s", node.id), publish.interval_s)?;
                non_negative(
                    &format!("nodes.{}.publish.interval_jitter_s", node.id),
                    publish.interval_jitter_s,
                )?;
                if publish.topic.is_empty() || publish.topic.contains(['+', '#']) {
                    return invalid(format!("nodes.{}.publish.topic is not a topic name", node.id));
                }
            }
            for sub in &node.subscriptions {
                if !mqsim_mqtt::valid_filter(&sub.filter) {
                    return invalid(format!(
                        "nodes.{}: invalid subscription filter '{}'",
                        node.id, sub.filter
                    ));
                }
            }
        }

        if let Some(failover) = &self.failover {
            non_negative("failover.at_s", failover.at_s)?;
            positive("failover.duration_s", failover.duration_s)?;
        }
        Ok(())
    }
}
