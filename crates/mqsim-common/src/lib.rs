//! # mqsim-common
//!
//! Common types and traits for the mqsim discrete-event simulator.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`])
//! - Planar positions ([`Position`])
//! - Entity identification ([`EntityId`], [`NodeId`])
//! - Event system ([`Event`], [`EventPayload`]) and the virtual-time [`Scheduler`]
//! - Simulation context ([`SimContext`])
//! - Entity traits ([`Entity`])
//! - MQTT value types ([`packet`]) and the observation stream ([`observation`])

pub mod observation;
pub mod packet;
pub mod scheduler;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub use observation::{
    BrokerDropReason, ClientState, DisconnectCause, DiscardReason, EnergyUsage, EventSink,
    LinkDirection, LossReason, Observation, RadioState, Record, SinkError,
};
pub use packet::{Frame, FrameId, Message, MessageKey, Packet, QoS, Will};
pub use scheduler::{Scheduler, TimerHandle};

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
///
/// Every variant is fatal for the run that raised it. Expected network
/// failures never surface here; they are reported as [`Observation`]s.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Invalid event target.
    #[error("Invalid event target: {0:?}")]
    InvalidTarget(EntityId),

    /// A timer was requested with a negative delay.
    #[error("Negative timer delay: {0}s")]
    NegativeDelay(f64),

    /// An absolute schedule time lies before the current virtual time.
    #[error("Cannot schedule at {requested:?}, clock is already at {now:?}")]
    ScheduleInPast {
        /// Requested firing time.
        requested: SimTime,
        /// Current virtual time.
        now: SimTime,
    },

    /// Simulation time overflow.
    #[error("Simulation time overflow")]
    TimeOverflow,

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in microseconds since simulation start.
///
/// Unsigned on purpose: a negative instant or delay cannot be expressed,
/// and fallible conversions from floating-point seconds reject them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Largest representable time.
    pub const MAX: SimTime = SimTime(u64::MAX);

    /// Create from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    /// Create from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1000)
    }

    /// Create from seconds (float). Negative input saturates to zero;
    /// use [`SimTime::try_from_secs`] for values that come from outside.
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1_000_000.0).round() as u64)
    }

    /// Create from seconds, rejecting negative and non-finite values.
    pub fn try_from_secs(s: f64) -> Result<Self, SimError> {
        if s.is_nan() || s < 0.0 {
            return Err(SimError::NegativeDelay(s));
        }
        if !s.is_finite() || s * 1_000_000.0 >= u64::MAX as f64 {
            return Err(SimError::TimeOverflow);
        }
        Ok(Self::from_secs(s))
    }

    /// Get as microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Add, clamping at [`SimTime::MAX`].
    pub fn saturating_add(&self, duration: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(duration.0))
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::Mul<u64> for SimTime {
    type Output = SimTime;

    fn mul(self, rhs: u64) -> Self::Output {
        SimTime(self.0.saturating_mul(rhs))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// Planar position in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Position {
    /// East coordinate in meters.
    pub x: f64,
    /// North coordinate in meters.
    pub y: f64,
}

impl Position {
    /// Create a new position.
    pub fn new(x: f64, y: f64) -> Self {
        Position { x, y }
    }

    /// Euclidean distance in meters.
    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Point a fraction `t` of the way from `self` to `other`.
    pub fn lerp(&self, other: &Position, t: f64) -> Position {
        Position {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
        }
    }
}

impl From<[f64; 2]> for Position {
    fn from(v: [f64; 2]) -> Self {
        Position::new(v[0], v[1])
    }
}

impl From<Position> for [f64; 2] {
    fn from(p: Position) -> Self {
        [p.x, p.y]
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// Node identifier: the node's index in the scenario (clients first, then gateways).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event.
///
/// Assigned from a monotonically increasing counter at scheduling time, so
/// it doubles as the deterministic tie-break between simultaneous events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first, then insertion order)
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// A radio started transmitting an uplink frame (Radio → Medium).
#[derive(Debug, Clone)]
pub struct TransmitAirEvent {
    /// Radio entity that is transmitting.
    pub radio: EntityId,
    /// Node owning the radio.
    pub node: NodeId,
    /// The frame on the air.
    pub frame: Frame,
    /// MAC attempt number, 0 for the first transmission.
    pub attempt: u8,
    /// Time on air.
    pub airtime: SimTime,
}

/// Commands accepted by a client entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    /// Begin (or resume) connecting.
    Start,
    /// Disconnect cleanly and stay offline.
    Stop,
}

/// Commands accepted by the broker entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerCommand {
    /// Crash now and come back after `down_for`.
    Crash {
        /// Outage duration.
        down_for: SimTime,
    },
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Client → Radio ===========
    /// Queue a frame for transmission.
    RadioTxRequest(Frame),

    // =========== Radio → Client ===========
    /// MAC outcome for a previously requested frame.
    RadioTxDone {
        /// Frame the outcome refers to.
        frame_id: FrameId,
        /// True when the frame was acknowledged at the MAC layer.
        delivered: bool,
    },
    /// A packet arrived over the air for this node.
    FrameReceived(Packet),
    /// The radio lost its link for longer than the supervision window.
    LinkDown {
        /// Why the link was declared down.
        cause: DisconnectCause,
    },
    /// The battery ran out; the radio is gone for the rest of the run.
    RadioDepleted,

    // =========== Radio ↔ Medium ===========
    /// A radio started transmitting (directed to the Medium entity).
    TransmitAir(TransmitAirEvent),
    /// The channel is occupied until the given time (carrier sense).
    CarrierSense {
        /// End of the foreign transmission.
        until: SimTime,
    },
    /// MAC-level acknowledgment for an uplink frame.
    MacAck {
        /// Acknowledged frame.
        frame_id: FrameId,
    },
    /// A downlink frame starts arriving at the radio.
    RadioRxStart {
        /// End of the reception.
        until: SimTime,
    },
    /// A downlink frame was received intact.
    RadioRxFrame(Frame),
    /// Coverage crossed the reachability threshold.
    LinkStateChanged {
        /// True when a gateway is now in range.
        up: bool,
    },

    // =========== Medium ↔ Broker ===========
    /// A client packet reached the broker.
    Uplink {
        /// Originating node.
        from: NodeId,
        /// The packet.
        packet: Packet,
    },
    /// The broker sends a packet towards a client.
    Downlink {
        /// Destination node.
        to: NodeId,
        /// The packet.
        packet: Packet,
    },
    /// The broker went down; gateways reset the listed clients.
    BrokerCrashed {
        /// Clients connected at the instant of the crash.
        affected: Vec<NodeId>,
    },

    // =========== Control ===========
    /// Command for a client.
    ClientControl(ClientCommand),
    /// Command for the broker.
    BrokerControl(BrokerCommand),

    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// User-defined timer ID.
        timer_id: u64,
    },

    // =========== Simulation Control ===========
    /// Bring time-integrated state (energy) up to the current instant.
    Settle,
    /// End the simulation.
    SimulationEnd,
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
///
/// Owns the scheduler and the single seeded random source of the run, and
/// buffers the observations emitted while handling an event.
pub struct SimContext {
    scheduler: Scheduler,
    rng: ChaCha8Rng,
    source_entity: EntityId,
    observations: Vec<Record>,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        SimContext {
            scheduler: Scheduler::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            source_entity: EntityId(0),
            observations: Vec::new(),
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.scheduler.now()
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Entity currently handling an event.
    pub fn source(&self) -> EntityId {
        self.source_entity
    }

    /// Set the source entity (used by event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Read access to the scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Mutable access to the scheduler (used by event loop).
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Post an event to occur after a delay.
    pub fn post_event(
        &mut self,
        delay: SimTime,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> TimerHandle {
        self.scheduler
            .schedule(delay, self.source_entity, targets, payload)
    }

    /// Post an event to occur immediately (at current time).
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) -> TimerHandle {
        self.post_event(SimTime::ZERO, targets, payload)
    }

    /// Post an event after a delay given in seconds. Negative delays are fatal.
    pub fn post_after_secs(
        &mut self,
        delay_s: f64,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> Result<TimerHandle, SimError> {
        let delay = SimTime::try_from_secs(delay_s)?;
        Ok(self.post_event(delay, targets, payload))
    }

    /// Arm a timer on the entity currently handling an event.
    pub fn set_timer(&mut self, delay: SimTime, timer_id: u64) -> TimerHandle {
        let me = self.source_entity;
        self.post_event(delay, vec![me], EventPayload::Timer { timer_id })
    }

    /// Cancel a scheduled event. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.scheduler.cancel(handle)
    }

    /// Cancel whatever timer the slot holds and leave it empty.
    pub fn cancel_slot(&mut self, slot: &mut Option<TimerHandle>) {
        if let Some(handle) = slot.take() {
            self.scheduler.cancel(handle);
        }
    }

    /// Record an observation at the current time.
    pub fn emit(&mut self, observation: Observation) {
        self.observations.push(Record {
            time: self.time(),
            observation,
        });
    }

    /// Drain the observations buffered since the last call (used by event loop).
    pub fn take_observations(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.observations)
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Dispatch an event to its target entities, in target order.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            let entity = self
                .entities
                .get_mut(target)
                .ok_or(SimError::EntityNotFound(*target))?;
            ctx.set_source(*target);
            entity.handle_event(event, ctx)?;
        }
        Ok(())
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
