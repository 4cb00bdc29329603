//! # mqsim-model
//!
//! Scenario loading and simulation building for mqsim.
//!
//! This crate provides:
//! - The YAML scenario schema ([`Scenario`]) with validation
//! - The canned experiments ([`ExperimentKind`], [`Scenario::preset`])
//! - [`build_simulation`], which turns a scenario into registered entities
//!   and the events that start them
//!
//! ## Entity layout
//!
//! | Entity | Id |
//! |---|---|
//! | broker | 1 |
//! | medium | 2 |
//! | client of node `i` | `10 + 2i` |
//! | radio of node `i` | `11 + 2i` |
//!
//! Client nodes get `NodeId(0..n)` in file order, gateways follow.

pub mod presets;
pub mod scenario;

pub use presets::ExperimentKind;
pub use scenario::{
    BackhaulConfig, FailoverConfig, GatewayConfig, NodeConfig, Params, PublishSpec, Scenario,
    SubscriptionSpec, WillSpec,
};

use mqsim_common::{
    BrokerCommand, ClientCommand, EntityId, EntityRegistry, Event, EventId, EventPayload, NodeId,
    Position, SimError, SimTime, Will,
};
use mqsim_metrics::NodeLabel;
use mqsim_mobility::Mobility;
use mqsim_mqtt::{
    Backoff, Broker, BrokerConfig, Client, ClientConfig, PublishConfig, RetryPolicy,
    BROKER_SWEEP_TIMER,
};
use mqsim_phy::{
    BernoulliLoss, GatewaySite, LossModel, Medium, PhyKind, Radio, RadioConfig, RadioSchedule,
    Station, WanLink, MEDIUM_START_TIMER, TIMER_ENERGY_REPORT,
};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Entity id of the broker.
pub const BROKER_ENTITY: EntityId = EntityId(1);
/// Entity id of the medium.
pub const MEDIUM_ENTITY: EntityId = EntityId(2);

/// Client entity of node `index`.
pub fn client_entity(index: usize) -> EntityId {
    EntityId(10 + 2 * index as u64)
}

/// Radio entity of node `index`.
pub fn radio_entity(index: usize) -> EntityId {
    EntityId(11 + 2 * index as u64)
}

/// Errors that can occur during scenario loading or building.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Unknown experiment: {0} (expected duty-cycle, protocol-comparison or topology-failover)")]
    UnknownExperiment(String),

    #[error("Simulation error: {0}")]
    Sim(#[from] SimError),
}

/// Load a scenario from a YAML file.
pub fn load_scenario(path: &Path) -> Result<Scenario, ModelError> {
    Scenario::load(path)
}

/// Load a scenario from a YAML string.
pub fn load_scenario_from_str(yaml: &str) -> Result<Scenario, ModelError> {
    Scenario::from_yaml_str(yaml)
}

// ============================================================================
// Simulation Building
// ============================================================================

/// What a built node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// MQTT client with a radio.
    Client,
    /// Gateway.
    Gateway,
}

/// Information about a node, for display and labeling.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    /// Node id.
    pub node: NodeId,
    /// Scenario name.
    pub name: String,
    /// Client or gateway.
    pub kind: NodeKind,
    /// Technology; `None` for gateways.
    pub phy: Option<PhyKind>,
    /// Initial position.
    pub position: Position,
    /// Client entity, for client nodes.
    pub client_entity: Option<EntityId>,
    /// Radio entity, for client nodes.
    pub radio_entity: Option<EntityId>,
    /// Battery capacity; 0 for mains-powered gateways.
    pub battery_j: f64,
    /// Sleep/wake schedule of the radio, for client nodes.
    pub schedule: Option<RadioSchedule>,
}

/// Knobs that are not part of the scenario file.
#[derive(Default)]
pub struct BuildOptions {
    /// Replaces the Bernoulli MAC loss derived from `params.mac_loss_rate`.
    pub loss_model: Option<Box<dyn LossModel>>,
}

/// A built simulation ready to run.
pub struct BuiltSimulation {
    /// Entity registry with all entities.
    pub entities: EntityRegistry,
    /// Initial events to seed the simulation.
    pub initial_events: Vec<Event>,
    /// Information about each node, clients first.
    pub node_infos: Vec<NodeInfo>,
    /// Broker entity.
    pub broker: EntityId,
    /// Medium entity.
    pub medium: EntityId,
    /// Run length.
    pub duration: SimTime,
    /// Period of the snapshot time series.
    pub snapshot_interval: SimTime,
    /// Seed of the run.
    pub seed: u64,
    /// Scenario label.
    pub label: String,
}

impl BuiltSimulation {
    /// Labels for the metrics aggregator.
    pub fn node_labels(&self) -> Vec<NodeLabel> {
        self.node_infos
            .iter()
            .map(|info| NodeLabel {
                node: info.node,
                name: info.name.clone(),
                phy: info.phy.map(|p| p.label().to_string()),
                battery_j: info.battery_j,
            })
            .collect()
    }

    /// Info of the node with the given scenario name.
    pub fn node_by_name(&self, name: &str) -> Option<&NodeInfo> {
        self.node_infos.iter().find(|info| info.name == name)
    }
}

fn secs(value: f64) -> Result<SimTime, ModelError> {
    Ok(SimTime::try_from_secs(value)?)
}

fn client_config(node: &NodeConfig, params: &Params) -> Result<ClientConfig, ModelError> {
    let mut config = ClientConfig::new(node.id.clone(), node.phy.label());
    config.clean_session = node.clean_session;
    config.keepalive = secs(params.keepalive_s)?;
    config.ping_timeout = secs(params.ping_timeout_s)?;
    config.connect_timeout = secs(params.connect_timeout_s)?;
    config.retry = RetryPolicy {
        interval: secs(params.retry_interval_s)?,
        max_retries: params.max_retries,
    };
    config.backoff = Backoff {
        base: secs(params.backoff_base_s)?,
        cap: secs(params.backoff_cap_s)?,
        jitter: secs(params.backoff_jitter_s)?,
    };
    config.publish = match &node.publish {
        Some(p) => Some(PublishConfig {
            topic: p.topic.clone(),
            qos: p.qos,
            interval: secs(p.interval_s)?,
            interval_jitter_s: p.interval_jitter_s,
            payload_bytes: p.payload_bytes,
            retain: p.retain,
        }),
        None => None,
    };
    config.subscriptions = node
        .subscriptions
        .iter()
        .map(|s| (s.filter.clone(), s.qos))
        .collect();
    config.will = node.will.as_ref().map(|w| Will {
        topic: w.topic.clone(),
        qos: w.qos,
        retain: w.retain,
        payload_len: w.payload_bytes,
    });
    config.outbox_capacity = params.outbox_capacity;
    config.mac_drop_threshold = params.mac_drop_threshold;
    Ok(config)
}

/// Build a simulation from a scenario.
///
/// The scenario is validated first; nothing is built from an invalid one.
pub fn build_simulation(
    scenario: &Scenario,
    options: BuildOptions,
) -> Result<BuiltSimulation, ModelError> {
    scenario.validate()?;
    let params = &scenario.params;

    let duty_cycle_period = secs(params.duty_cycle_period_s)?;
    let ble_interval = secs(params.ble_conn_interval_ms / 1000.0)?;
    let energy_report_interval = secs(params.energy_report_interval_s)?;
    let keepalive = secs(params.keepalive_s)?;

    let mut entities = EntityRegistry::new();
    let mut node_infos = Vec::with_capacity(scenario.nodes.len() + scenario.gateways.len());
    let mut stations = Vec::with_capacity(scenario.nodes.len());

    // ========================================================================
    // Client nodes
    // ========================================================================

    for (i, node) in scenario.nodes.iter().enumerate() {
        let node_id = NodeId(i as u32);
        let client_id = client_entity(i);
        let radio_id = radio_entity(i);
        let duty_cycle = match node.phy {
            PhyKind::Zigbee => node.duty_cycle.unwrap_or(params.duty_cycle),
            _ => 1.0,
        };
        let schedule =
            RadioSchedule::for_phy(node.phy, duty_cycle, duty_cycle_period, ble_interval);

        let radio = Radio::new(
            radio_id,
            node_id,
            node.id.clone(),
            client_id,
            RadioConfig {
                phy: node.phy,
                schedule,
                battery_j: node.battery_j,
                medium: MEDIUM_ENTITY,
                supervision_events: params.ble_supervision_events,
                energy_report_interval,
            },
        );
        let client = Client::new(client_id, node_id, radio_id, client_config(node, params)?);
        entities.register(Box::new(client));
        entities.register(Box::new(radio));

        stations.push(Station {
            node: node_id,
            name: node.id.clone(),
            phy: node.phy,
            radio: radio_id,
            position: node.position,
            mobility: Mobility::new(node.mobility.clone(), node.position, scenario.area),
            schedule,
        });
        node_infos.push(NodeInfo {
            node: node_id,
            name: node.id.clone(),
            kind: NodeKind::Client,
            phy: Some(node.phy),
            position: node.position,
            client_entity: Some(client_id),
            radio_entity: Some(radio_id),
            battery_j: node.battery_j,
            schedule: Some(schedule),
        });
        debug!(
            "Model: node {} ({}) -> {} client={:?} radio={:?}",
            node.id, node.phy, node_id, client_id, radio_id
        );
    }

    // ========================================================================
    // Gateways
    // ========================================================================

    let mut gateways = Vec::with_capacity(scenario.gateways.len());
    for (i, gw) in scenario.gateways.iter().enumerate() {
        let node_id = NodeId((scenario.nodes.len() + i) as u32);
        let backhaul = WanLink::new(
            secs(gw.backhaul.latency_ms / 1000.0)?,
            secs(gw.backhaul.jitter_ms / 1000.0)?,
            gw.backhaul.loss_rate,
        );
        gateways.push(GatewaySite {
            node: node_id,
            name: gw.id.clone(),
            position: gw.position,
            mobility: Mobility::new(gw.mobility.clone(), gw.position, scenario.area),
            transport: Box::new(backhaul),
        });
        node_infos.push(NodeInfo {
            node: node_id,
            name: gw.id.clone(),
            kind: NodeKind::Gateway,
            phy: None,
            position: gw.position,
            client_entity: None,
            radio_entity: None,
            battery_j: 0.0,
            schedule: None,
        });
    }

    let loss = options.loss_model.unwrap_or_else(|| {
        Box::new(BernoulliLoss {
            rate: params.mac_loss_rate,
        })
    });
    entities.register(Box::new(Medium::new(
        MEDIUM_ENTITY,
        BROKER_ENTITY,
        stations,
        gateways,
        loss,
    )));

    let broker_config = BrokerConfig {
        medium: MEDIUM_ENTITY,
        queue_capacity: params.queue_capacity,
        session_expiry: secs(params.session_expiry_s)?,
        retry: RetryPolicy {
            interval: secs(params.retry_interval_s)?,
            max_retries: params.max_retries,
        },
        sweep_interval: SimTime::from_micros((keepalive.as_micros() / 2).max(1)),
    };
    entities.register(Box::new(Broker::new(BROKER_ENTITY, broker_config)));

    // ========================================================================
    // Initial events
    // ========================================================================

    let mut initial_events = Vec::new();
    let mut push = |time: SimTime, source: EntityId, target: EntityId, payload: EventPayload| {
        initial_events.push(Event {
            id: EventId(initial_events.len() as u64),
            time,
            source,
            targets: vec![target],
            payload,
        });
    };

    push(
        SimTime::ZERO,
        MEDIUM_ENTITY,
        MEDIUM_ENTITY,
        EventPayload::Timer {
            timer_id: MEDIUM_START_TIMER,
        },
    );
    push(
        SimTime::ZERO,
        BROKER_ENTITY,
        BROKER_ENTITY,
        EventPayload::Timer {
            timer_id: BROKER_SWEEP_TIMER,
        },
    );
    // Clients start 10 ms apart so CONNECTs do not all contend at t = 0.
    for i in 0..scenario.nodes.len() {
        push(
            SimTime::from_millis(10 * i as u64),
            client_entity(i),
            client_entity(i),
            EventPayload::ClientControl(ClientCommand::Start),
        );
        push(
            energy_report_interval,
            radio_entity(i),
            radio_entity(i),
            EventPayload::Timer {
                timer_id: TIMER_ENERGY_REPORT,
            },
        );
    }
    if let Some(failover) = &scenario.failover {
        push(
            secs(failover.at_s)?,
            BROKER_ENTITY,
            BROKER_ENTITY,
            EventPayload::BrokerControl(BrokerCommand::Crash {
                down_for: secs(failover.duration_s)?,
            }),
        );
    }

    Ok(BuiltSimulation {
        entities,
        initial_events,
        node_infos,
        broker: BROKER_ENTITY,
        medium: MEDIUM_ENTITY,
        duration: secs(scenario.duration_s)?,
        snapshot_interval: secs(params.snapshot_interval_s)?,
        seed: scenario.seed,
        label: scenario.label.clone(),
    })
}
