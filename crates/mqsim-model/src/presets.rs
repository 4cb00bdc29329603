//! Built-in experiment scenarios.
//!
//! All presets share one topology: two gateways, five Zigbee and four BLE
//! sensors, one mobile Wi-Fi camera and a Wi-Fi dashboard subscribed to
//! everything. They differ only in the parameter under study.

use crate::scenario::{
    BackhaulConfig, FailoverConfig, GatewayConfig, NodeConfig, Params, PublishSpec, Scenario,
    SubscriptionSpec, WillSpec,
};
use crate::ModelError;
use mqsim_common::{Position, QoS};
use mqsim_mobility::{Bounds, MobilityConfig};
use mqsim_phy::PhyKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three canned experiments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperimentKind {
    /// Zigbee sensors at a 5 % duty cycle.
    DutyCycle,
    /// Every radio always on; compares the technologies.
    ProtocolComparison,
    /// Broker crash at 200 s for 30 s.
    TopologyFailover,
}

impl ExperimentKind {
    /// Every preset, in report order.
    pub const ALL: [ExperimentKind; 3] = [
        ExperimentKind::DutyCycle,
        ExperimentKind::ProtocolComparison,
        ExperimentKind::TopologyFailover,
    ];

    /// Stable name, also the preset's scenario label.
    pub fn label(&self) -> &'static str {
        match self {
            ExperimentKind::DutyCycle => "duty-cycle",
            ExperimentKind::ProtocolComparison => "protocol-comparison",
            ExperimentKind::TopologyFailover => "topology-failover",
        }
    }
}

impl fmt::Display for ExperimentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ExperimentKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "duty-cycle" => Ok(ExperimentKind::DutyCycle),
            "protocol-comparison" => Ok(ExperimentKind::ProtocolComparison),
            "topology-failover" => Ok(ExperimentKind::TopologyFailover),
            _ => Err(ModelError::UnknownExperiment(s.to_string())),
        }
    }
}

const SENSOR_TOPIC_ZIGBEE: &str = "sensors/temperature";
const SENSOR_TOPIC_BLE: &str = "sensors/humidity";

const ZIGBEE_SENSORS: [(f64, f64); 5] = [
    (25.0, 30.0),
    (35.0, 15.0),
    (10.0, 35.0),
    (70.0, 90.0),
    (90.0, 65.0),
];

const BLE_SENSORS: [(f64, f64); 4] = [(40.0, 40.0), (60.0, 75.0), (30.0, 50.0), (70.0, 40.0)];

fn sensor(index: usize, phy: PhyKind, at: (f64, f64), topic: &str) -> NodeConfig {
    let qos = if index % 2 == 0 {
        QoS::AtLeastOnce
    } else {
        QoS::AtMostOnce
    };
    NodeConfig {
        id: format!("sensor_{}", index),
        phy,
        position: Position::new(at.0, at.1),
        mobility: MobilityConfig::stationary(),
        clean_session: false,
        battery_j: 500.0,
        duty_cycle: None,
        publish: Some(PublishSpec {
            topic: topic.to_string(),
            qos,
            interval_s: 30.0,
            interval_jitter_s: 2.0,
            payload_bytes: 32,
            retain: false,
        }),
        subscriptions: vec![SubscriptionSpec {
            filter: "alerts/#".to_string(),
            qos: QoS::AtMostOnce,
        }],
        will: Some(WillSpec {
            topic: "alerts/status".to_string(),
            qos: QoS::AtLeastOnce,
            retain: false,
            payload_bytes: 16,
        }),
    }
}

fn gateway(id: &str, x: f64, y: f64) -> GatewayConfig {
    GatewayConfig {
        id: id.to_string(),
        position: Position::new(x, y),
        mobility: MobilityConfig::stationary(),
        backhaul: BackhaulConfig::default(),
    }
}

impl Scenario {
    /// The canned scenario of an experiment.
    pub fn preset(kind: ExperimentKind, seed: u64) -> Scenario {
        let mut nodes = Vec::new();
        for (i, at) in ZIGBEE_SENSORS.iter().enumerate() {
            nodes.push(sensor(i, PhyKind::Zigbee, *at, SENSOR_TOPIC_ZIGBEE));
        }
        for (j, at) in BLE_SENSORS.iter().enumerate() {
            let index = ZIGBEE_SENSORS.len() + j;
            let mut node = sensor(index, PhyKind::Ble, *at, SENSOR_TOPIC_BLE);
            // The last two BLE sensors walk a small square.
            if j >= 2 {
                node.mobility = MobilityConfig::grid(10.0, 0.5);
            }
            nodes.push(node);
        }

        nodes.push(NodeConfig {
            id: "mobile_cam".to_string(),
            phy: PhyKind::Wifi,
            position: Position::new(50.0, 50.0),
            mobility: MobilityConfig::random_waypoint([0.5, 2.0], 2.0),
            clean_session: true,
            battery_j: 2000.0,
            duty_cycle: None,
            publish: Some(PublishSpec {
                topic: "camera/frames".to_string(),
                qos: QoS::AtMostOnce,
                interval_s: 10.0,
                interval_jitter_s: 0.5,
                payload_bytes: 256,
                retain: true,
            }),
            subscriptions: Vec::new(),
            will: None,
        });
        nodes.push(NodeConfig {
            id: "dashboard".to_string(),
            phy: PhyKind::Wifi,
            position: Position::new(50.0, 20.0),
            mobility: MobilityConfig::stationary(),
            clean_session: false,
            battery_j: 5000.0,
            duty_cycle: None,
            publish: None,
            subscriptions: vec![SubscriptionSpec {
                filter: "#".to_string(),
                qos: QoS::AtLeastOnce,
            }],
            will: None,
        });

        let params = Params {
            duty_cycle: match kind {
                ExperimentKind::DutyCycle => 0.05,
                _ => 1.0,
            },
            ..Params::default()
        };
        let failover = match kind {
            ExperimentKind::TopologyFailover => Some(FailoverConfig {
                at_s: 200.0,
                duration_s: 30.0,
            }),
            _ => None,
        };

        Scenario {
            label: kind.label().to_string(),
            seed,
            duration_s: 600.0,
            area: Bounds::new(100.0, 100.0),
            params,
            gateways: vec![gateway("gw1", 20.0, 20.0), gateway("gw2", 80.0, 80.0)],
            nodes,
            failover,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for kind in ExperimentKind::ALL {
            let scenario = Scenario::preset(kind, 7);
            scenario.validate().expect("preset is valid");
            assert_eq!(scenario.label, kind.label());
            assert_eq!(scenario.nodes.len(), 11);
        }
    }

    #[test]
    fn test_presets_differ_in_parameter_under_study() {
        let duty = Scenario::preset(ExperimentKind::DutyCycle, 1);
        let cmp = Scenario::preset(ExperimentKind::ProtocolComparison, 1);
        let failover = Scenario::preset(ExperimentKind::TopologyFailover, 1);
        assert_eq!(duty.params.duty_cycle, 0.05);
        assert_eq!(cmp.params.duty_cycle, 1.0);
        assert!(cmp.failover.is_none());
        assert_eq!(
            failover.failover,
            Some(FailoverConfig {
                at_s: 200.0,
                duration_s: 30.0
            })
        );
        assert_eq!(duty.nodes, cmp.nodes);
    }

    #[test]
    fn test_experiment_names_parse() {
        assert_eq!(
            "duty_cycle".parse::<ExperimentKind>().ok(),
            Some(ExperimentKind::DutyCycle)
        );
        assert_eq!(
            "Topology-Failover".parse::<ExperimentKind>().ok(),
            Some(ExperimentKind::TopologyFailover)
        );
        assert!("latency".parse::<ExperimentKind>().is_err());
    }

    #[test]
    fn test_preset_yaml_roundtrips_through_loader() {
        let scenario = Scenario::preset(ExperimentKind::TopologyFailover, 3);
        let yaml = scenario.to_yaml().expect("serializes");
        let back = Scenario::from_yaml_str(&yaml).expect("reloads");
        assert_eq!(back, scenario);
    }
}
