//! Per-node radio entity.
//!
//! The radio sits between a client and the [`Medium`](crate::Medium):
//! 1. Channel access: waits for the schedule (BLE connection event, Zigbee
//!    active window), then carrier-senses and backs off on CSMA technologies
//! 2. Transmission: sends `TransmitAir` to the medium and waits for the MAC ack
//! 3. MAC retry: one retry on CSMA, next-event retries on BLE until the
//!    supervision window runs out
//! 4. Reception: forwards downlink frames to the client
//! 5. Energy: integrates power draw and reports depletion

use crate::{Activity, ChannelAccess, EnergyMeter, PhyKind, PhyProfile, RadioSchedule};
use mqsim_common::{
    DisconnectCause, Entity, EntityId, Event, EventPayload, Frame, FrameId, LinkDirection, NodeId,
    Observation, RadioState, SimContext, SimError, SimTime, TimerHandle, TransmitAirEvent,
};
use mqsim_metrics::{metric_defs, metrics, MetricLabels};
use rand::Rng;
use std::collections::VecDeque;
use tracing::{debug, info, trace};

/// Timer ID constants for the Radio entity.
const TIMER_WAKE: u64 = 1;
const TIMER_BACKOFF: u64 = 2;
const TIMER_TX_END: u64 = 3;
const TIMER_ACK_TIMEOUT: u64 = 4;
const TIMER_RX_END: u64 = 5;
const TIMER_SUPERVISION: u64 = 6;
/// Periodic energy report; the first one is posted by whoever builds the run.
pub const TIMER_ENERGY_REPORT: u64 = 7;

/// Radio configuration.
#[derive(Debug, Clone)]
pub struct RadioConfig {
    /// Technology.
    pub phy: PhyKind,
    /// When the radio is awake.
    pub schedule: RadioSchedule,
    /// Initial battery, joules.
    pub battery_j: f64,
    /// Entity ID of the medium (for routing transmissions).
    pub medium: EntityId,
    /// BLE: consecutive failed connection events before the link is declared down.
    pub supervision_events: u32,
    /// Interval of the periodic energy report.
    pub energy_report_interval: SimTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxPhase {
    /// Waiting for the schedule or a backoff.
    Access,
    /// On the air.
    OnAir,
    /// Waiting for the MAC acknowledgment.
    AwaitAck,
}

#[derive(Debug, Clone)]
struct TxAttempt {
    frame: Frame,
    /// MAC attempt, 0 for the first transmission.
    attempt: u8,
    /// Busy-channel backoffs in this attempt.
    backoffs: u32,
    /// When the frame reached the head of the queue.
    queued_at: SimTime,
    phase: TxPhase,
}

/// Radio entity of one node.
pub struct Radio {
    id: EntityId,
    node: NodeId,
    name: String,
    client: EntityId,
    config: RadioConfig,
    profile: &'static PhyProfile,
    meter: EnergyMeter,
    state: RadioState,

    queue: VecDeque<Frame>,
    current: Option<TxAttempt>,
    /// Carrier sensed busy until this instant.
    channel_busy_until: SimTime,
    /// A downlink frame is arriving until this instant.
    rx_until: SimTime,

    link_up: bool,
    link_down_reported: bool,
    /// BLE: connection events in a row without a successful exchange.
    failed_events: u32,

    access_timer: Option<TimerHandle>,
    phase_timer: Option<TimerHandle>,
    supervision_timer: Option<TimerHandle>,

    depleted: bool,
    metric_labels: MetricLabels,
}

impl Radio {
    /// Create a radio for `node`, attached to the `client` entity.
    pub fn new(
        id: EntityId,
        node: NodeId,
        name: impl Into<String>,
        client: EntityId,
        config: RadioConfig,
    ) -> Self {
        let name = name.into();
        let profile = config.phy.profile();
        let meter = EnergyMeter::new(profile, config.schedule, config.battery_j);
        let metric_labels = MetricLabels::new(name.clone(), config.phy.label());
        Radio {
            id,
            node,
            name,
            client,
            profile,
            meter,
            state: RadioState::Idle,
            queue: VecDeque::new(),
            current: None,
            channel_busy_until: SimTime::ZERO,
            rx_until: SimTime::ZERO,
            link_up: true,
            link_down_reported: false,
            failed_events: 0,
            access_timer: None,
            phase_timer: None,
            supervision_timer: None,
            depleted: false,
            metric_labels,
            config,
        }
    }

    /// Node this radio belongs to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Externally visible state.
    pub fn state(&self) -> RadioState {
        self.state
    }

    /// Battery left as of the last accounting point.
    pub fn remaining_j(&self) -> f64 {
        self.meter.remaining_j()
    }

    /// True while a gateway is in range.
    pub fn link_up(&self) -> bool {
        self.link_up
    }

    fn set_state(&mut self, state: RadioState, ctx: &mut SimContext) {
        if state != self.state {
            trace!("Radio[{}]: {:?} -> {:?}", self.name, self.state, state);
            self.state = state;
            ctx.emit(Observation::RadioState {
                node: self.node,
                state,
            });
        }
    }

    /// Re-derive the energy activity and visible state from the MAC state.
    fn refresh_activity(&mut self, ctx: &mut SimContext) {
        let now = ctx.time();
        let activity = match self.current.as_ref().map(|c| c.phase) {
            Some(TxPhase::OnAir) => Activity::Tx,
            Some(TxPhase::AwaitAck) => Activity::Rx,
            _ if self.rx_until > now => Activity::Rx,
            _ => Activity::Background,
        };
        if activity != self.meter.activity() {
            self.meter.set_activity(now, activity);
        }
        let state = match activity {
            Activity::Tx => RadioState::Tx,
            Activity::Rx => RadioState::Rx,
            Activity::Background => self.config.schedule.background_state(now),
        };
        self.set_state(state, ctx);
    }

    fn supervision_window(&self) -> Option<SimTime> {
        match self.config.schedule {
            RadioSchedule::ConnectionEvents { interval, .. } => {
                Some(interval * self.config.supervision_events.max(1) as u64)
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Transmit path
    // ------------------------------------------------------------------------

    fn enqueue(&mut self, frame: Frame, ctx: &mut SimContext) {
        trace!(
            "Radio[{}]: queue {} ({} bytes)",
            self.name,
            frame.packet.label(),
            frame.size_bytes()
        );
        self.queue.push_back(frame);
        if self.current.is_none() {
            self.start_next(ctx);
        }
    }

    fn start_next(&mut self, ctx: &mut SimContext) {
        let Some(frame) = self.queue.pop_front() else {
            self.refresh_activity(ctx);
            return;
        };
        self.current = Some(TxAttempt {
            frame,
            attempt: 0,
            backoffs: 0,
            queued_at: ctx.time(),
            phase: TxPhase::Access,
        });
        self.schedule_access(ctx);
    }

    fn schedule_access(&mut self, ctx: &mut SimContext) {
        let delay = self.profile.access_delay(ctx.rng());
        if delay == SimTime::ZERO {
            self.try_access(ctx);
        } else {
            self.access_timer = Some(ctx.set_timer(delay, TIMER_BACKOFF));
            self.refresh_activity(ctx);
        }
    }

    fn try_access(&mut self, ctx: &mut SimContext) {
        let now = ctx.time();
        let Some(size) = self.current.as_ref().map(|c| c.frame.size_bytes()) else {
            return;
        };
        let airtime = self.profile.transmission_time(size);

        let opportunity = self
            .config
            .schedule
            .next_opportunity(self.rx_until.max(now), airtime);
        if opportunity > now {
            self.access_timer = Some(ctx.set_timer(opportunity - now, TIMER_WAKE));
            self.refresh_activity(ctx);
            return;
        }

        if let ChannelAccess::Csma {
            slot,
            max_slots,
            max_backoffs,
        } = self.profile.access
        {
            if self.channel_busy_until > now {
                let backoffs = match self.current.as_mut() {
                    Some(current) => {
                        current.backoffs += 1;
                        current.backoffs
                    }
                    None => return,
                };
                if backoffs > max_backoffs {
                    debug!("Radio[{}]: channel access failure", self.name);
                    self.attempt_failed(ctx);
                    return;
                }
                let slots = ctx.rng().gen_range(1..=max_slots.max(1)) as u64;
                let delay = (self.channel_busy_until - now) + slot * slots;
                self.access_timer = Some(ctx.set_timer(delay, TIMER_BACKOFF));
                return;
            }
        }

        self.transmit(airtime, ctx);
    }

    fn transmit(&mut self, airtime: SimTime, ctx: &mut SimContext) {
        let now = ctx.time();
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.phase = TxPhase::OnAir;

        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::RADIO_TX_FRAMES.name, &labels).increment(1);
        metrics::counter!(metric_defs::RADIO_TX_AIRTIME.name, &labels)
            .increment(airtime.as_micros());
        metrics::histogram!(metric_defs::RADIO_ACCESS_DELAY.name, &labels)
            .record((now - current.queued_at).as_secs_f64());

        trace!(
            "Radio[{}]: TX {} attempt {} for {}",
            self.name,
            current.frame.packet.label(),
            current.attempt,
            airtime
        );
        let tx = TransmitAirEvent {
            radio: self.id,
            node: self.node,
            frame: current.frame.clone(),
            attempt: current.attempt,
            airtime,
        };
        ctx.post_immediate(vec![self.config.medium], EventPayload::TransmitAir(tx));
        self.phase_timer = Some(ctx.set_timer(airtime, TIMER_TX_END));
        self.refresh_activity(ctx);
    }

    fn end_transmission(&mut self, ctx: &mut SimContext) {
        if let Some(current) = self.current.as_mut() {
            current.phase = TxPhase::AwaitAck;
            self.phase_timer = Some(ctx.set_timer(self.profile.ack_timeout, TIMER_ACK_TIMEOUT));
        }
        self.refresh_activity(ctx);
    }

    fn handle_mac_ack(&mut self, frame_id: FrameId, ctx: &mut SimContext) {
        let matches = self
            .current
            .as_ref()
            .is_some_and(|c| c.phase == TxPhase::AwaitAck && c.frame.id == frame_id);
        if !matches {
            trace!("Radio[{}]: stale MAC ack {:?}", self.name, frame_id);
            return;
        }
        ctx.cancel_slot(&mut self.phase_timer);
        self.current = None;
        self.failed_events = 0;
        ctx.post_immediate(
            vec![self.client],
            EventPayload::RadioTxDone {
                frame_id,
                delivered: true,
            },
        );
        self.start_next(ctx);
    }

    fn attempt_failed(&mut self, ctx: &mut SimContext) {
        ctx.cancel_slot(&mut self.phase_timer);
        let now = ctx.time();
        match self.profile.access {
            ChannelAccess::ConnectionEvents => {
                self.failed_events += 1;
                if self.failed_events >= self.config.supervision_events {
                    self.supervision_timeout(ctx);
                    return;
                }
                if let Some(current) = self.current.as_mut() {
                    current.attempt = current.attempt.saturating_add(1);
                    current.phase = TxPhase::Access;
                }
                let next = self.config.schedule.next_window_start(now);
                self.access_timer = Some(ctx.set_timer(next - now, TIMER_WAKE));
                self.refresh_activity(ctx);
            }
            ChannelAccess::Csma { .. } => {
                let retry = match self.current.as_mut() {
                    Some(current) if current.attempt == 0 => {
                        current.attempt = 1;
                        current.backoffs = 0;
                        current.phase = TxPhase::Access;
                        true
                    }
                    Some(_) => false,
                    None => return,
                };
                if retry {
                    trace!("Radio[{}]: MAC retry", self.name);
                    self.refresh_activity(ctx);
                    self.schedule_access(ctx);
                } else {
                    self.mac_drop(ctx);
                    self.start_next(ctx);
                }
            }
        }
    }

    /// Give up the current frame at the MAC layer.
    fn mac_drop(&mut self, ctx: &mut SimContext) {
        let Some(current) = self.current.take() else {
            return;
        };
        debug!(
            "Radio[{}]: MAC drop of {} after {} attempts",
            self.name,
            current.frame.packet.label(),
            current.attempt as u32 + 1
        );
        self.report_drop(&current.frame, ctx);
        ctx.post_immediate(
            vec![self.client],
            EventPayload::RadioTxDone {
                frame_id: current.frame.id,
                delivered: false,
            },
        );
    }

    fn report_drop(&self, frame: &Frame, ctx: &mut SimContext) {
        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::RADIO_MAC_DROPS.name, &labels).increment(1);
        ctx.emit(Observation::MacDrop {
            node: self.node,
            direction: LinkDirection::Uplink,
            key: frame.packet.message_key(),
        });
    }

    /// BLE link lost: drop everything queued and tell the client once.
    fn supervision_timeout(&mut self, ctx: &mut SimContext) {
        ctx.cancel_slot(&mut self.access_timer);
        ctx.cancel_slot(&mut self.phase_timer);
        ctx.cancel_slot(&mut self.supervision_timer);
        self.failed_events = 0;

        if !self.link_down_reported {
            self.link_down_reported = true;
            info!("Radio[{}]: supervision timeout", self.name);
            ctx.post_immediate(
                vec![self.client],
                EventPayload::LinkDown {
                    cause: DisconnectCause::SupervisionTimeout,
                },
            );
        }
        self.mac_drop(ctx);
        let dropped: Vec<Frame> = self.queue.drain(..).collect();
        for frame in dropped {
            self.report_drop(&frame, ctx);
            ctx.post_immediate(
                vec![self.client],
                EventPayload::RadioTxDone {
                    frame_id: frame.id,
                    delivered: false,
                },
            );
        }
        self.refresh_activity(ctx);
    }

    // ------------------------------------------------------------------------
    // Receive path and link state
    // ------------------------------------------------------------------------

    fn handle_rx_start(&mut self, until: SimTime, ctx: &mut SimContext) {
        let now = ctx.time();
        if until <= now {
            return;
        }
        self.rx_until = self.rx_until.max(until);
        ctx.set_timer(until - now, TIMER_RX_END);
        self.refresh_activity(ctx);
    }

    fn handle_rx_frame(&mut self, frame: &Frame, ctx: &mut SimContext) {
        trace!("Radio[{}]: RX {}", self.name, frame.packet.label());
        self.failed_events = 0;
        ctx.post_immediate(
            vec![self.client],
            EventPayload::FrameReceived(frame.packet.clone()),
        );
    }

    fn handle_link_state(&mut self, up: bool, ctx: &mut SimContext) {
        self.link_up = up;
        if up {
            debug!("Radio[{}]: gateway in range", self.name);
            ctx.cancel_slot(&mut self.supervision_timer);
            self.link_down_reported = false;
            return;
        }
        debug!("Radio[{}]: no gateway in range", self.name);
        if self.supervision_timer.is_none() {
            if let Some(window) = self.supervision_window() {
                self.supervision_timer = Some(ctx.set_timer(window, TIMER_SUPERVISION));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Energy
    // ------------------------------------------------------------------------

    fn report_energy(&mut self, ctx: &mut SimContext) {
        let usage = self.meter.take_usage(ctx.time());
        ctx.emit(Observation::Energy {
            node: self.node,
            usage,
            remaining_j: self.meter.remaining_j(),
        });
    }

    fn check_depletion(&mut self, ctx: &mut SimContext) {
        self.meter.advance(ctx.time());
        if !self.meter.is_depleted() {
            return;
        }
        info!("Radio[{}]: battery depleted at {}", self.name, ctx.time());
        self.depleted = true;
        ctx.cancel_slot(&mut self.access_timer);
        ctx.cancel_slot(&mut self.phase_timer);
        ctx.cancel_slot(&mut self.supervision_timer);
        let unsent: Vec<Frame> = self
            .current
            .take()
            .map(|c| c.frame)
            .into_iter()
            .chain(self.queue.drain(..))
            .collect();
        for frame in &unsent {
            self.report_drop(frame, ctx);
        }
        self.report_energy(ctx);
        ctx.emit(Observation::NodeDepleted { node: self.node });
        self.set_state(RadioState::Sleep, ctx);
        ctx.post_immediate(vec![self.client], EventPayload::RadioDepleted);
    }
}

impl Entity for Radio {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.depleted {
            return Ok(());
        }
        match &event.payload {
            EventPayload::RadioTxRequest(frame) => self.enqueue(frame.clone(), ctx),
            EventPayload::CarrierSense { until } => {
                self.channel_busy_until = self.channel_busy_until.max(*until);
            }
            EventPayload::MacAck { frame_id } => self.handle_mac_ack(*frame_id, ctx),
            EventPayload::RadioRxStart { until } => self.handle_rx_start(*until, ctx),
            EventPayload::RadioRxFrame(frame) => self.handle_rx_frame(frame, ctx),
            EventPayload::LinkStateChanged { up } => self.handle_link_state(*up, ctx),
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_WAKE | TIMER_BACKOFF => {
                    if self.access_timer.is_some_and(|h| h.fired_by(event)) {
                        self.access_timer = None;
                        self.try_access(ctx);
                    }
                }
                TIMER_TX_END => {
                    if self.phase_timer.is_some_and(|h| h.fired_by(event)) {
                        self.phase_timer = None;
                        self.end_transmission(ctx);
                    }
                }
                TIMER_ACK_TIMEOUT => {
                    if self.phase_timer.is_some_and(|h| h.fired_by(event)) {
                        self.phase_timer = None;
                        trace!("Radio[{}]: ACK timeout", self.name);
                        self.attempt_failed(ctx);
                    }
                }
                TIMER_RX_END => self.refresh_activity(ctx),
                TIMER_SUPERVISION => {
                    if self.supervision_timer.is_some_and(|h| h.fired_by(event)) {
                        self.supervision_timer = None;
                        self.supervision_timeout(ctx);
                    }
                }
                TIMER_ENERGY_REPORT => {
                    self.report_energy(ctx);
                    ctx.set_timer(self.config.energy_report_interval, TIMER_ENERGY_REPORT);
                }
                _ => {}
            },
            EventPayload::Settle => self.report_energy(ctx),
            _ => {}
        }
        self.check_depletion(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqsim_common::{EntityRegistry, Packet};
    use std::sync::{Arc, Mutex};

    const MEDIUM: EntityId = EntityId(2);
    const CLIENT: EntityId = EntityId(10);
    const RADIO: EntityId = EntityId(11);

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records what the radio sends to its neighbors.
    struct Recorder {
        id: EntityId,
        seen: Log,
    }

    impl Entity for Recorder {
        fn entity_id(&self) -> EntityId {
            self.id
        }

        fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
            let entry = match &event.payload {
                EventPayload::TransmitAir(tx) => format!("air:{}", tx.attempt),
                EventPayload::RadioTxDone { delivered, .. } => format!("done:{}", delivered),
                EventPayload::LinkDown { .. } => "link_down".to_string(),
                EventPayload::RadioDepleted => "depleted".to_string(),
                _ => return Ok(()),
            };
            self.seen
                .lock()
                .expect("log lock")
                .push(format!("{}@{}", entry, ctx.time().as_micros()));
            Ok(())
        }
    }

    fn setup(
        phy: PhyKind,
        schedule: RadioSchedule,
        battery_j: f64,
    ) -> (EntityRegistry, SimContext, Log) {
        let log = Log::default();
        let mut registry = EntityRegistry::new();
        registry.register(Box::new(Radio::new(
            RADIO,
            NodeId(0),
            "n0",
            CLIENT,
            RadioConfig {
                phy,
                schedule,
                battery_j,
                medium: MEDIUM,
                supervision_events: 3,
                energy_report_interval: SimTime::from_secs(10.0),
            },
        )));
        registry.register(Box::new(Recorder {
            id: MEDIUM,
            seen: log.clone(),
        }));
        registry.register(Box::new(Recorder {
            id: CLIENT,
            seen: log.clone(),
        }));
        (registry, SimContext::new(42), log)
    }

    fn run(registry: &mut EntityRegistry, ctx: &mut SimContext, until: SimTime) {
        while let Some(event) = ctx.scheduler_mut().pop_until(until) {
            registry
                .dispatch_event(&event, ctx)
                .expect("dispatch succeeds");
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().expect("log lock").clone()
    }

    fn request(ctx: &mut SimContext) {
        let frame = Frame {
            id: FrameId(1),
            node: NodeId(0),
            packet: Packet::PingReq,
        };
        ctx.post_immediate(vec![RADIO], EventPayload::RadioTxRequest(frame));
    }

    #[test]
    fn test_csma_single_retry_then_mac_drop() {
        let (mut registry, mut ctx, log) = setup(PhyKind::Wifi, RadioSchedule::AlwaysOn, 100.0);
        request(&mut ctx);
        run(&mut registry, &mut ctx, SimTime::from_secs(1.0));

        let entries = entries(&log);
        let airs: Vec<_> = entries.iter().filter(|e| e.starts_with("air:")).collect();
        assert_eq!(airs.len(), 2, "{:?}", entries);
        assert!(airs[0].starts_with("air:0@"));
        assert!(airs[1].starts_with("air:1@"));
        assert!(entries.last().is_some_and(|e| e.starts_with("done:false")));
        assert!(ctx
            .take_observations()
            .iter()
            .any(|r| matches!(r.observation, Observation::MacDrop { .. })));
    }

    #[test]
    fn test_zigbee_waits_for_active_window() {
        let schedule = RadioSchedule::duty_cycled(SimTime::from_millis(1000), 0.05);
        let (mut registry, mut ctx, log) = setup(PhyKind::Zigbee, schedule, 100.0);
        // Request outside the active window
        ctx.scheduler_mut().advance_to(SimTime::from_millis(300));
        request(&mut ctx);
        run(&mut registry, &mut ctx, SimTime::from_secs(1.5));

        let first_air = entries(&log)
            .into_iter()
            .find(|e| e.starts_with("air:0@"))
            .expect("frame went on air");
        let at: u64 = first_air["air:0@".len()..].parse().expect("time");
        assert!((1_000_000..1_050_000).contains(&at), "sent at {}", at);
    }

    #[test]
    fn test_ble_supervision_timeout_reports_link_down() {
        let schedule = RadioSchedule::connection_events(SimTime::from_millis(60));
        let (mut registry, mut ctx, log) = setup(PhyKind::Ble, schedule, 100.0);
        request(&mut ctx);
        run(&mut registry, &mut ctx, SimTime::from_secs(1.0));

        let entries = entries(&log);
        let airs = entries.iter().filter(|e| e.starts_with("air:")).count();
        assert_eq!(airs, 3, "{:?}", entries);
        assert!(entries.iter().any(|e| e.starts_with("link_down")));
        assert!(entries.iter().any(|e| e.starts_with("done:false")));
    }

    #[test]
    fn test_depletion_notifies_client_once() {
        let (mut registry, mut ctx, log) = setup(PhyKind::Wifi, RadioSchedule::AlwaysOn, 0.01);
        ctx.post_event(
            SimTime::from_secs(1.0),
            vec![RADIO],
            EventPayload::Timer {
                timer_id: TIMER_ENERGY_REPORT,
            },
        );
        run(&mut registry, &mut ctx, SimTime::from_secs(30.0));

        let depleted = entries(&log)
            .iter()
            .filter(|e| e.starts_with("depleted"))
            .count();
        assert_eq!(depleted, 1);
        let observations = ctx.take_observations();
        let remaining: Vec<f64> = observations
            .iter()
            .filter_map(|r| match r.observation {
                Observation::Energy { remaining_j, .. } => Some(remaining_j),
                _ => None,
            })
            .collect();
        assert_eq!(remaining.last().copied(), Some(0.0));
        assert!(remaining.windows(2).all(|w| w[1] <= w[0]));
    }
}
