//! The shared air between client radios and gateways.
//!
//! The medium owns every position in the run. It steps node and gateway
//! mobility, keeps each node's serving gateway (the nearest one in range),
//! and routes frames:
//! - uplink: radio → air → gateway → backhaul → broker
//! - downlink: broker → backhaul → gateway → air (at the radio's next
//!   receive opportunity) → radio
//!
//! Reachability is re-checked when a frame leaves the air, so a node that
//! moved out of range during a transmission loses the frame.

use crate::transport::{Carry, LossModel, Transport};
use crate::{PhyKind, RadioSchedule};
use mqsim_common::{
    Entity, EntityId, Event, EventPayload, Frame, FrameId, LinkDirection, MessageKey, NodeId,
    Observation, Packet, Position, SimContext, SimError, SimTime, TimerHandle, TransmitAirEvent,
};
use mqsim_metrics::{metric_defs, metrics, MetricLabels};
use mqsim_mobility::{nearest_within, reachable, Mobility};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace, warn};

const KIND_SHIFT: u32 = 48;
const KIND_START: u64 = 1;
const KIND_MOVE_STATION: u64 = 2;
const KIND_MOVE_GATEWAY: u64 = 3;
const KIND_UPLINK_END: u64 = 4;
const KIND_BACKHAUL_ARRIVAL: u64 = 5;
const KIND_DOWNLINK_BEGIN: u64 = 6;
const KIND_DOWNLINK_END: u64 = 7;

/// Timer that starts the medium (mobility and initial coverage).
pub const MEDIUM_START_TIMER: u64 = KIND_START << KIND_SHIFT;

fn timer_id(kind: u64, seq: u64) -> u64 {
    (kind << KIND_SHIFT) | seq
}

fn split_timer(timer_id: u64) -> (u64, u64) {
    (timer_id >> KIND_SHIFT, timer_id & ((1 << KIND_SHIFT) - 1))
}

/// A client node as seen by the medium.
#[derive(Debug, Clone)]
pub struct Station {
    /// Node id.
    pub node: NodeId,
    /// Scenario name.
    pub name: String,
    /// Technology.
    pub phy: PhyKind,
    /// The node's radio entity.
    pub radio: EntityId,
    /// Current position.
    pub position: Position,
    /// Movement.
    pub mobility: Mobility,
    /// Receive opportunities of the node's radio.
    pub schedule: RadioSchedule,
}

/// A gateway bridging the air to the broker.
pub struct GatewaySite {
    /// Node id.
    pub node: NodeId,
    /// Scenario name.
    pub name: String,
    /// Current position.
    pub position: Position,
    /// Movement.
    pub mobility: Mobility,
    /// Link to the broker.
    pub transport: Box<dyn Transport>,
}

#[derive(Debug, Clone)]
struct DownlinkAir {
    frame: Frame,
    gateway: usize,
    attempt: u8,
    backed_off: bool,
    transmission: Option<u64>,
    timer: Option<TimerHandle>,
}

struct StationState {
    station: Station,
    gateway: Option<usize>,
    downlink_queue: VecDeque<(usize, Frame)>,
    downlink: Option<DownlinkAir>,
    metric_labels: MetricLabels,
}

#[derive(Debug, Clone)]
struct UplinkAir {
    transmission: u64,
    station: usize,
    gateway: usize,
    frame: Frame,
    attempt: u8,
}

/// The medium entity.
pub struct Medium {
    id: EntityId,
    broker: EntityId,
    stations: Vec<StationState>,
    gateways: Vec<GatewaySite>,
    by_node: BTreeMap<NodeId, usize>,
    loss: Box<dyn LossModel>,
    uplinks: BTreeMap<u64, UplinkAir>,
    arrivals: BTreeMap<u64, (usize, usize, Frame)>,
    next_transmission: u64,
    next_arrival: u64,
    next_frame: u64,
}

impl Medium {
    /// Create a medium routing between `stations`, `gateways` and the broker.
    pub fn new(
        id: EntityId,
        broker: EntityId,
        stations: Vec<Station>,
        gateways: Vec<GatewaySite>,
        loss: Box<dyn LossModel>,
    ) -> Self {
        let by_node = stations
            .iter()
            .enumerate()
            .map(|(i, s)| (s.node, i))
            .collect();
        let stations = stations
            .into_iter()
            .map(|station| StationState {
                metric_labels: MetricLabels::new(station.name.clone(), station.phy.label()),
                station,
                gateway: None,
                downlink_queue: VecDeque::new(),
                downlink: None,
            })
            .collect();
        Medium {
            id,
            broker,
            stations,
            gateways,
            by_node,
            loss,
            uplinks: BTreeMap::new(),
            arrivals: BTreeMap::new(),
            next_transmission: 0,
            next_arrival: 0,
            next_frame: 0,
        }
    }

    /// Current position of a node or gateway.
    pub fn position(&self, node: NodeId) -> Option<Position> {
        if let Some(&i) = self.by_node.get(&node) {
            return Some(self.stations[i].station.position);
        }
        self.gateways
            .iter()
            .find(|g| g.node == node)
            .map(|g| g.position)
    }

    /// Serving gateway of a node.
    pub fn serving_gateway(&self, node: NodeId) -> Option<NodeId> {
        let i = *self.by_node.get(&node)?;
        self.stations[i].gateway.map(|g| self.gateways[g].node)
    }

    fn next_transmission_id(&mut self) -> u64 {
        let t = self.next_transmission;
        self.next_transmission += 1;
        t
    }

    // ------------------------------------------------------------------------
    // Mobility and coverage
    // ------------------------------------------------------------------------

    fn start(&mut self, ctx: &mut SimContext) {
        for i in 0..self.stations.len() {
            let st = &mut self.stations[i].station;
            if let Some(delay) = st.mobility.first_move(&mut st.position, ctx.rng()) {
                ctx.set_timer(delay, timer_id(KIND_MOVE_STATION, i as u64));
            }
        }
        for j in 0..self.gateways.len() {
            let gw = &mut self.gateways[j];
            if let Some(delay) = gw.mobility.first_move(&mut gw.position, ctx.rng()) {
                ctx.set_timer(delay, timer_id(KIND_MOVE_GATEWAY, j as u64));
            }
        }
        for i in 0..self.stations.len() {
            let gateway = self.covering_gateway(i);
            let st = &mut self.stations[i];
            st.gateway = gateway;
            let up = gateway.is_some();
            ctx.emit(Observation::LinkChanged {
                node: st.station.node,
                up,
            });
            if !up {
                debug!("Medium: {} starts without coverage", st.station.name);
                ctx.post_immediate(
                    vec![st.station.radio],
                    EventPayload::LinkStateChanged { up: false },
                );
            }
        }
    }

    fn covering_gateway(&self, i: usize) -> Option<usize> {
        let st = &self.stations[i].station;
        nearest_within(
            &st.position,
            self.gateways.iter().map(|g| &g.position),
            st.phy.profile().range_m,
        )
    }

    fn update_coverage(&mut self, i: usize, ctx: &mut SimContext) {
        let gateway = self.covering_gateway(i);
        let st = &mut self.stations[i];
        let old = std::mem::replace(&mut st.gateway, gateway);
        if old.is_some() == gateway.is_some() {
            if old != gateway {
                trace!("Medium: {} handed over to gateway {:?}", st.station.name, gateway);
            }
            return;
        }
        let up = gateway.is_some();
        debug!(
            "Medium: {} link {}",
            st.station.name,
            if up { "up" } else { "down" }
        );
        ctx.emit(Observation::LinkChanged {
            node: st.station.node,
            up,
        });
        ctx.post_immediate(
            vec![st.station.radio],
            EventPayload::LinkStateChanged { up },
        );
    }

    fn move_station(&mut self, i: usize, ctx: &mut SimContext) {
        let Some(state) = self.stations.get_mut(i) else {
            return;
        };
        let st = &mut state.station;
        let next = st.mobility.advance(&mut st.position, ctx.rng());
        ctx.emit(Observation::Moved {
            node: st.node,
            position: st.position,
        });
        if let Some(delay) = next {
            ctx.set_timer(delay, timer_id(KIND_MOVE_STATION, i as u64));
        }
        self.update_coverage(i, ctx);
    }

    fn move_gateway(&mut self, j: usize, ctx: &mut SimContext) {
        let Some(gw) = self.gateways.get_mut(j) else {
            return;
        };
        let next = gw.mobility.advance(&mut gw.position, ctx.rng());
        ctx.emit(Observation::Moved {
            node: gw.node,
            position: gw.position,
        });
        if let Some(delay) = next {
            ctx.set_timer(delay, timer_id(KIND_MOVE_GATEWAY, j as u64));
        }
        for i in 0..self.stations.len() {
            self.update_coverage(i, ctx);
        }
    }

    // ------------------------------------------------------------------------
    // Uplink
    // ------------------------------------------------------------------------

    fn handle_transmit_air(&mut self, tx: &TransmitAirEvent, ctx: &mut SimContext) {
        let Some(&i) = self.by_node.get(&tx.node) else {
            warn!("Medium: transmission from unknown node {}", tx.node);
            return;
        };
        let end = ctx.time() + tx.airtime;
        let (phy, position, gateway) = {
            let st = &self.stations[i];
            (st.station.phy, st.station.position, st.gateway)
        };
        let range = phy.profile().range_m;

        for (j, other) in self.stations.iter().enumerate() {
            if j != i
                && other.station.phy == phy
                && reachable(&position, &other.station.position, range)
            {
                ctx.post_immediate(
                    vec![other.station.radio],
                    EventPayload::CarrierSense { until: end },
                );
            }
        }

        let Some(gateway) = gateway else {
            trace!("Medium: {} transmits without a gateway", tx.node);
            return;
        };
        let transmission = self.next_transmission_id();
        ctx.emit(Observation::AirStarted {
            transmission,
            node: tx.node,
            gateway: self.gateways[gateway].node,
            direction: LinkDirection::Uplink,
            end,
        });
        self.uplinks.insert(
            transmission,
            UplinkAir {
                transmission,
                station: i,
                gateway,
                frame: tx.frame.clone(),
                attempt: tx.attempt,
            },
        );
        ctx.set_timer(tx.airtime, timer_id(KIND_UPLINK_END, transmission));
    }

    fn uplink_end(&mut self, transmission: u64, ctx: &mut SimContext) {
        let Some(air) = self.uplinks.remove(&transmission) else {
            return;
        };
        let st = &self.stations[air.station].station;
        let profile = st.phy.profile();
        let gw = &mut self.gateways[air.gateway];
        let in_range = reachable(&st.position, &gw.position, profile.range_m);
        let lost = !in_range
            || self
                .loss
                .frame_lost(&air.frame, LinkDirection::Uplink, air.attempt, ctx.rng());
        ctx.emit(Observation::AirEnded {
            transmission: air.transmission,
            delivered: !lost,
        });
        if lost {
            trace!(
                "Medium: uplink {} from {} lost (in range: {})",
                air.frame.packet.label(),
                st.name,
                in_range
            );
            return;
        }

        ctx.post_event(
            profile.ack_turnaround,
            vec![st.radio],
            EventPayload::MacAck {
                frame_id: air.frame.id,
            },
        );
        let now = ctx.time();
        match gw.transport.carry(
            now,
            LinkDirection::Uplink,
            air.frame.size_bytes(),
            ctx.rng(),
        ) {
            Carry::Deliver(delay) => {
                ctx.post_event(
                    profile.tx_latency + delay,
                    vec![self.broker],
                    EventPayload::Uplink {
                        from: st.node,
                        packet: air.frame.packet,
                    },
                );
            }
            Carry::Drop => {
                debug!("Medium: backhaul dropped uplink from {}", st.name);
                ctx.emit(Observation::BackhaulDrop {
                    node: st.node,
                    direction: LinkDirection::Uplink,
                    key: air.frame.packet.message_key(),
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Downlink
    // ------------------------------------------------------------------------

    fn new_frame(&mut self, node: NodeId, packet: Packet) -> Frame {
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        Frame { id, node, packet }
    }

    fn handle_downlink(&mut self, to: NodeId, packet: &Packet, ctx: &mut SimContext) {
        let Some(&i) = self.by_node.get(&to) else {
            warn!("Medium: downlink for unknown node {}", to);
            return;
        };
        let Some(gateway) = self.stations[i].gateway else {
            trace!("Medium: no gateway for downlink {} to {}", packet.label(), to);
            self.downlink_dropped(i, packet.message_key(), ctx);
            return;
        };
        let frame = self.new_frame(to, packet.clone());
        let now = ctx.time();
        let carry = self.gateways[gateway].transport.carry(
            now,
            LinkDirection::Downlink,
            frame.size_bytes(),
            ctx.rng(),
        );
        match carry {
            Carry::Deliver(delay) => {
                let latency = self.stations[i].station.phy.profile().tx_latency;
                let seq = self.next_arrival;
                self.next_arrival += 1;
                self.arrivals.insert(seq, (i, gateway, frame));
                ctx.set_timer(delay + latency, timer_id(KIND_BACKHAUL_ARRIVAL, seq));
            }
            Carry::Drop => {
                debug!("Medium: backhaul dropped downlink to {}", to);
                ctx.emit(Observation::BackhaulDrop {
                    node: to,
                    direction: LinkDirection::Downlink,
                    key: packet.message_key(),
                });
            }
        }
    }

    fn handle_broker_crashed(&mut self, affected: &[NodeId], ctx: &mut SimContext) {
        for node in affected {
            let Some(&i) = self.by_node.get(node) else {
                continue;
            };
            let Some(gateway) = self.stations[i].gateway else {
                continue;
            };
            let frame = self.new_frame(*node, Packet::ConnectionReset);
            self.queue_downlink(i, gateway, frame, ctx);
        }
    }

    fn queue_downlink(&mut self, i: usize, gateway: usize, frame: Frame, ctx: &mut SimContext) {
        let st = &mut self.stations[i];
        st.downlink_queue.push_back((gateway, frame));
        if st.downlink.is_none() {
            self.begin_next_downlink(i, ctx);
        }
    }

    fn begin_next_downlink(&mut self, i: usize, ctx: &mut SimContext) {
        let st = &mut self.stations[i];
        let Some((gateway, frame)) = st.downlink_queue.pop_front() else {
            return;
        };
        st.downlink = Some(DownlinkAir {
            frame,
            gateway,
            attempt: 0,
            backed_off: false,
            transmission: None,
            timer: None,
        });
        self.downlink_step(i, ctx);
    }

    /// Wait for the radio's receive opportunity and the gateway's backoff, then transmit.
    fn downlink_step(&mut self, i: usize, ctx: &mut SimContext) {
        let now = ctx.time();
        let transmission = self.next_transmission;
        let st = &mut self.stations[i];
        let Some(air) = st.downlink.as_mut() else {
            return;
        };
        let profile = st.station.phy.profile();
        let airtime = profile.transmission_time(air.frame.size_bytes());

        let opportunity = st.station.schedule.next_opportunity(now, airtime);
        if opportunity > now {
            air.timer = Some(ctx.set_timer(
                opportunity - now,
                timer_id(KIND_DOWNLINK_BEGIN, i as u64),
            ));
            return;
        }
        if !air.backed_off {
            air.backed_off = true;
            let delay = profile.access_delay(ctx.rng());
            if delay > SimTime::ZERO {
                air.timer = Some(ctx.set_timer(delay, timer_id(KIND_DOWNLINK_BEGIN, i as u64)));
                return;
            }
        }

        let end = now + airtime;
        air.transmission = Some(transmission);
        air.timer = Some(ctx.set_timer(airtime, timer_id(KIND_DOWNLINK_END, i as u64)));
        ctx.emit(Observation::AirStarted {
            transmission,
            node: st.station.node,
            gateway: self.gateways[air.gateway].node,
            direction: LinkDirection::Downlink,
            end,
        });
        ctx.post_immediate(
            vec![st.station.radio],
            EventPayload::RadioRxStart { until: end },
        );
        self.next_transmission += 1;
    }

    fn downlink_end(&mut self, i: usize, ctx: &mut SimContext) {
        let st = &mut self.stations[i];
        let Some(air) = st.downlink.as_mut() else {
            return;
        };
        let profile = st.station.phy.profile();
        let gw = &self.gateways[air.gateway];
        let in_range = reachable(&st.station.position, &gw.position, profile.range_m);
        let lost = !in_range
            || self
                .loss
                .frame_lost(&air.frame, LinkDirection::Downlink, air.attempt, ctx.rng());
        if let Some(transmission) = air.transmission.take() {
            ctx.emit(Observation::AirEnded {
                transmission,
                delivered: !lost,
            });
        }

        if !lost {
            ctx.post_immediate(
                vec![st.station.radio],
                EventPayload::RadioRxFrame(air.frame.clone()),
            );
            st.downlink = None;
            self.begin_next_downlink(i, ctx);
            return;
        }

        if air.attempt == 0 {
            trace!(
                "Medium: downlink {} to {} lost, retrying",
                air.frame.packet.label(),
                st.station.name
            );
            air.attempt = 1;
            air.backed_off = false;
            air.timer = Some(ctx.set_timer(
                profile.ack_timeout,
                timer_id(KIND_DOWNLINK_BEGIN, i as u64),
            ));
            return;
        }

        let key = air.frame.packet.message_key();
        st.downlink = None;
        self.downlink_dropped(i, key, ctx);
        self.begin_next_downlink(i, ctx);
    }

    fn downlink_dropped(&mut self, i: usize, key: Option<MessageKey>, ctx: &mut SimContext) {
        let st = &self.stations[i];
        debug!("Medium: MAC drop of downlink to {}", st.station.name);
        let labels = st.metric_labels.to_labels();
        metrics::counter!(metric_defs::RADIO_MAC_DROPS.name, &labels).increment(1);
        ctx.emit(Observation::MacDrop {
            node: st.station.node,
            direction: LinkDirection::Downlink,
            key,
        });
    }

    fn downlink_timer_valid(&self, i: usize, event: &Event) -> bool {
        self.stations
            .get(i)
            .and_then(|st| st.downlink.as_ref())
            .and_then(|air| air.timer)
            .is_some_and(|h| h.fired_by(event))
    }
}

impl Entity for Medium {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::TransmitAir(tx) => self.handle_transmit_air(tx, ctx),
            EventPayload::Downlink { to, packet } => self.handle_downlink(*to, packet, ctx),
            EventPayload::BrokerCrashed { affected } => self.handle_broker_crashed(affected, ctx),
            EventPayload::Timer { timer_id } => {
                let (kind, seq) = split_timer(*timer_id);
                match kind {
                    KIND_START => self.start(ctx),
                    KIND_MOVE_STATION => self.move_station(seq as usize, ctx),
                    KIND_MOVE_GATEWAY => self.move_gateway(seq as usize, ctx),
                    KIND_UPLINK_END => self.uplink_end(seq, ctx),
                    KIND_BACKHAUL_ARRIVAL => {
                        if let Some((i, gateway, frame)) = self.arrivals.remove(&seq) {
                            self.queue_downlink(i, gateway, frame, ctx);
                        }
                    }
                    KIND_DOWNLINK_BEGIN => {
                        if self.downlink_timer_valid(seq as usize, event) {
                            self.downlink_step(seq as usize, ctx);
                        }
                    }
                    KIND_DOWNLINK_END => {
                        if self.downlink_timer_valid(seq as usize, event) {
                            self.downlink_end(seq as usize, ctx);
                        }
                    }
                    _ => {
                        return Err(SimError::HandlerError {
                            entity: self.id,
                            message: format!("unknown medium timer {:#x}", timer_id),
                        })
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
