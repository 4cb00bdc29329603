//! Presentation feed.
//!
//! [`WorldView`] is an [`EventSink`] that keeps just enough state to draw the
//! world: where every node is, what its radio and client are doing and which
//! frames are on the air. It is fed purely by observations, except that an
//! idle radio's sleep/wake phase is read off its schedule when a frame is
//! drawn: duty cycling emits no observation between transmissions.

use mqsim_common::{
    ClientState, EventSink, LinkDirection, NodeId, Observation, Position, RadioState, Record,
    SimTime, SinkError,
};
use mqsim_metrics::MetricsSnapshot;
use mqsim_model::{NodeInfo, NodeKind};
use mqsim_phy::RadioSchedule;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// One node as drawn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    /// Scenario name.
    pub id: String,
    /// Current position.
    pub position: Position,
    /// Radio state; `None` for gateways.
    pub radio_state: Option<RadioState>,
    /// Client state; `None` for gateways.
    pub client_state: Option<ClientState>,
    /// Battery left; `None` for gateways.
    pub battery_j: Option<f64>,
    /// Whether a gateway covers the node.
    pub link_up: bool,
}

/// A frame on the air.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InFlightView {
    /// Sending end.
    pub from: String,
    /// Receiving end.
    pub to: String,
    /// Fraction of the airtime elapsed, in [0, 1].
    pub progress: f64,
}

/// Everything the presentation layer needs for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewFrame {
    /// Virtual time of the frame.
    pub time_s: f64,
    /// Every node and gateway.
    pub nodes: Vec<NodeView>,
    /// Frames on the air.
    pub in_flight: Vec<InFlightView>,
    /// Statistics so far.
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone)]
struct Transmission {
    from: NodeId,
    to: NodeId,
    start: SimTime,
    end: SimTime,
}

/// Observation-fed world state.
#[derive(Debug, Clone)]
pub struct WorldView {
    nodes: BTreeMap<NodeId, NodeView>,
    schedules: BTreeMap<NodeId, RadioSchedule>,
    depleted: BTreeSet<NodeId>,
    in_flight: BTreeMap<u64, Transmission>,
}

impl WorldView {
    /// Initial view of the given nodes.
    pub fn new(node_infos: &[NodeInfo]) -> Self {
        let nodes = node_infos
            .iter()
            .map(|info| {
                let client = info.kind == NodeKind::Client;
                (
                    info.node,
                    NodeView {
                        id: info.name.clone(),
                        position: info.position,
                        radio_state: client.then_some(RadioState::Idle),
                        client_state: client.then_some(ClientState::Disconnected),
                        battery_j: client.then_some(info.battery_j),
                        link_up: !client,
                    },
                )
            })
            .collect();
        let schedules = node_infos
            .iter()
            .filter_map(|info| info.schedule.map(|s| (info.node, s)))
            .collect();
        WorldView {
            nodes,
            schedules,
            depleted: BTreeSet::new(),
            in_flight: BTreeMap::new(),
        }
    }

    /// Current view of a node.
    pub fn node(&self, node: NodeId) -> Option<&NodeView> {
        self.nodes.get(&node)
    }

    /// Number of frames on the air.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn name(&self, node: NodeId) -> String {
        self.nodes
            .get(&node)
            .map(|n| n.id.clone())
            .unwrap_or_else(|| node.to_string())
    }

    /// Radio state at `now`. Idle and asleep follow the schedule.
    fn radio_state_at(&self, node: NodeId, view: &NodeView, now: SimTime) -> Option<RadioState> {
        match (view.radio_state, self.schedules.get(&node)) {
            (Some(RadioState::Idle | RadioState::Sleep), Some(schedule))
                if !self.depleted.contains(&node) =>
            {
                Some(schedule.background_state(now))
            }
            (state, _) => state,
        }
    }

    /// Frame at `now` with the given statistics.
    pub fn frame(&self, now: SimTime, metrics: MetricsSnapshot) -> ViewFrame {
        let in_flight = self
            .in_flight
            .values()
            .map(|tx| {
                let total = tx.end.as_micros().saturating_sub(tx.start.as_micros());
                let done = now.as_micros().saturating_sub(tx.start.as_micros());
                let progress = if total == 0 {
                    1.0
                } else {
                    (done as f64 / total as f64).clamp(0.0, 1.0)
                };
                InFlightView {
                    from: self.name(tx.from),
                    to: self.name(tx.to),
                    progress,
                }
            })
            .collect();
        ViewFrame {
            time_s: now.as_secs_f64(),
            nodes: self
                .nodes
                .iter()
                .map(|(node, view)| NodeView {
                    radio_state: self.radio_state_at(*node, view, now),
                    ..view.clone()
                })
                .collect(),
            in_flight,
            metrics,
        }
    }

    /// Apply one observation.
    pub fn apply(&mut self, record: &Record) {
        match &record.observation {
            Observation::Moved { node, position } => {
                if let Some(view) = self.nodes.get_mut(node) {
                    view.position = *position;
                }
            }
            Observation::RadioState { node, state } => {
                if let Some(view) = self.nodes.get_mut(node) {
                    view.radio_state = Some(*state);
                }
            }
            Observation::ClientState { node, state, .. } => {
                if let Some(view) = self.nodes.get_mut(node) {
                    view.client_state = Some(*state);
                }
            }
            Observation::Energy {
                node, remaining_j, ..
            } => {
                if let Some(view) = self.nodes.get_mut(node) {
                    view.battery_j = Some(*remaining_j);
                }
            }
            Observation::NodeDepleted { node } => {
                self.depleted.insert(*node);
                if let Some(view) = self.nodes.get_mut(node) {
                    view.battery_j = Some(0.0);
                    view.radio_state = Some(RadioState::Sleep);
                }
            }
            Observation::LinkChanged { node, up } => {
                if let Some(view) = self.nodes.get_mut(node) {
                    view.link_up = *up;
                }
            }
            Observation::AirStarted {
                transmission,
                node,
                gateway,
                direction,
                end,
            } => {
                let (from, to) = match direction {
                    LinkDirection::Uplink => (*node, *gateway),
                    LinkDirection::Downlink => (*gateway, *node),
                };
                self.in_flight.insert(
                    *transmission,
                    Transmission {
                        from,
                        to,
                        start: record.time,
                        end: *end,
                    },
                );
            }
            Observation::AirEnded { transmission, .. } => {
                self.in_flight.remove(transmission);
            }
            _ => {}
        }
    }
}

impl EventSink for WorldView {
    fn name(&self) -> &str {
        "world-view"
    }

    fn observe(&mut self, record: &Record) -> Result<(), SinkError> {
        self.apply(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqsim_common::EntityId;
    use mqsim_phy::PhyKind;

    fn infos() -> Vec<NodeInfo> {
        vec![
            NodeInfo {
                node: NodeId(0),
                name: "sensor_0".to_string(),
                kind: NodeKind::Client,
                phy: Some(PhyKind::Zigbee),
                position: Position::new(25.0, 30.0),
                client_entity: Some(EntityId(10)),
                radio_entity: Some(EntityId(11)),
                battery_j: 500.0,
                schedule: Some(RadioSchedule::duty_cycled(SimTime::from_secs(1.0), 0.1)),
            },
            NodeInfo {
                node: NodeId(1),
                name: "gw1".to_string(),
                kind: NodeKind::Gateway,
                phy: None,
                position: Position::new(20.0, 20.0),
                client_entity: None,
                radio_entity: None,
                battery_j: 0.0,
                schedule: None,
            },
        ]
    }

    fn at(us: u64, observation: Observation) -> Record {
        Record {
            time: SimTime::from_micros(us),
            observation,
        }
    }

    #[test]
    fn test_view_tracks_node_state() {
        let mut view = WorldView::new(&infos());
        view.apply(&at(
            0,
            Observation::ClientState {
                node: NodeId(0),
                state: ClientState::Connected,
                cause: None,
            },
        ));
        view.apply(&at(
            0,
            Observation::Moved {
                node: NodeId(0),
                position: Position::new(26.0, 30.0),
            },
        ));
        view.apply(&at(
            0,
            Observation::NodeDepleted { node: NodeId(0) },
        ));
        let node = view.node(NodeId(0)).expect("node");
        assert_eq!(node.client_state, Some(ClientState::Connected));
        assert_eq!(node.position, Position::new(26.0, 30.0));
        assert_eq!(node.battery_j, Some(0.0));

        let gw = view.node(NodeId(1)).expect("gateway");
        assert_eq!(gw.radio_state, None);
        assert!(gw.link_up);
    }

    #[test]
    fn test_in_flight_progress() {
        let mut view = WorldView::new(&infos());
        view.apply(&at(
            1_000,
            Observation::AirStarted {
                transmission: 7,
                node: NodeId(0),
                gateway: NodeId(1),
                direction: LinkDirection::Uplink,
                end: SimTime::from_micros(3_000),
            },
        ));
        let frame = view.frame(SimTime::from_micros(2_000), MetricsSnapshot::default());
        assert_eq!(frame.in_flight.len(), 1);
        assert_eq!(frame.in_flight[0].from, "sensor_0");
        assert_eq!(frame.in_flight[0].to, "gw1");
        assert!((frame.in_flight[0].progress - 0.5).abs() < 1e-12);

        view.apply(&at(
            3_000,
            Observation::AirEnded {
                transmission: 7,
                delivered: true,
            },
        ));
        assert_eq!(view.in_flight_count(), 0);
    }

    #[test]
    fn test_duty_cycled_radio_sleeps_between_frames() {
        let mut view = WorldView::new(&infos());
        view.apply(&at(
            0,
            Observation::RadioState {
                node: NodeId(0),
                state: RadioState::Idle,
            },
        ));
        let state_at = |view: &WorldView, us: u64| {
            view.frame(SimTime::from_micros(us), MetricsSnapshot::default())
                .nodes
                .iter()
                .find(|n| n.id == "sensor_0")
                .and_then(|n| n.radio_state)
        };
        // awake for the first 100 ms of every second
        assert_eq!(state_at(&view, 50_000), Some(RadioState::Idle));
        assert_eq!(state_at(&view, 500_000), Some(RadioState::Sleep));
        assert_eq!(state_at(&view, 1_020_000), Some(RadioState::Idle));

        view.apply(&at(
            1_030_000,
            Observation::RadioState {
                node: NodeId(0),
                state: RadioState::Tx,
            },
        ));
        assert_eq!(state_at(&view, 1_500_000), Some(RadioState::Tx));

        view.apply(&at(
            2_000_000,
            Observation::NodeDepleted { node: NodeId(0) },
        ));
        assert_eq!(state_at(&view, 3_050_000), Some(RadioState::Sleep));
    }
}
