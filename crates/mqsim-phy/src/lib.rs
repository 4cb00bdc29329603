//! # mqsim-phy
//!
//! Radio technologies for mqsim.
//!
//! This crate provides:
//! - The closed set of technologies ([`PhyKind`]) and their profile table ([`PhyProfile`])
//! - When a radio may use the air ([`RadioSchedule`]: BLE connection events, Zigbee duty cycle)
//! - Time-integrated energy accounting ([`EnergyMeter`])
//! - The per-node radio entity with its MAC ([`Radio`])
//! - The shared air and gateway routing entity ([`Medium`])
//! - Pluggable gateway backhaul ([`Transport`]) and per-frame loss ([`LossModel`])

use mqsim_common::{EnergyUsage, RadioState, SimTime};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod medium;
pub mod radio;
pub mod transport;

pub use medium::{GatewaySite, Medium, Station, MEDIUM_START_TIMER};
pub use radio::{Radio, RadioConfig, TIMER_ENERGY_REPORT};
pub use transport::{BernoulliLoss, Carry, LossModel, Transport, WanLink};

// ============================================================================
// PHY Kinds
// ============================================================================

/// Radio technology of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhyKind {
    /// Bluetooth Low Energy, connection-event scheduled.
    Ble,
    /// 802.11 Wi-Fi, CSMA/CA.
    Wifi,
    /// 802.15.4 Zigbee, CSMA/CA with an optional duty cycle.
    Zigbee,
}

impl PhyKind {
    /// Every technology, in table order.
    pub const ALL: [PhyKind; 3] = [PhyKind::Ble, PhyKind::Wifi, PhyKind::Zigbee];

    /// Profile of this technology.
    pub fn profile(&self) -> &'static PhyProfile {
        match self {
            PhyKind::Ble => &PROFILES[0],
            PhyKind::Wifi => &PROFILES[1],
            PhyKind::Zigbee => &PROFILES[2],
        }
    }

    /// Stable lowercase name, also used as the `phy` metric label.
    pub fn label(&self) -> &'static str {
        match self {
            PhyKind::Ble => "ble",
            PhyKind::Wifi => "wifi",
            PhyKind::Zigbee => "zigbee",
        }
    }
}

impl fmt::Display for PhyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PhyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ble" => Ok(PhyKind::Ble),
            "wifi" | "wi-fi" => Ok(PhyKind::Wifi),
            "zigbee" => Ok(PhyKind::Zigbee),
            other => Err(format!("unknown phy kind '{}' (expected ble, wifi or zigbee)", other)),
        }
    }
}

// ============================================================================
// Profiles
// ============================================================================

/// How a radio gets access to the air.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelAccess {
    /// Transmit only inside the connection events negotiated with the central.
    ConnectionEvents,
    /// Carrier sense with random slotted backoff.
    Csma {
        /// Backoff slot duration.
        slot: SimTime,
        /// Backoff is drawn uniformly from `[0, max_slots)` slots.
        max_slots: u32,
        /// Busy-channel backoffs before the attempt is given up.
        max_backoffs: u32,
    },
}

/// Static parameters of one technology.
#[derive(Debug, Clone, PartialEq)]
pub struct PhyProfile {
    /// Technology.
    pub kind: PhyKind,
    /// Air data rate in bits per second.
    pub data_rate_bps: f64,
    /// Radio range in meters.
    pub range_m: f64,
    /// Power while transmitting, mW.
    pub tx_mw: f64,
    /// Power while receiving, mW.
    pub rx_mw: f64,
    /// Power while awake and idle, mW.
    pub idle_mw: f64,
    /// Power while asleep, mW.
    pub sleep_mw: f64,
    /// PHY + MAC framing added to every frame, bytes.
    pub header_bytes: usize,
    /// Gateway processing latency added to every hop.
    pub tx_latency: SimTime,
    /// Wait for a MAC acknowledgment before the attempt counts as failed.
    pub ack_timeout: SimTime,
    /// Delay between the end of a frame and its MAC acknowledgment.
    pub ack_turnaround: SimTime,
    /// Channel access scheme.
    pub access: ChannelAccess,
}

/// Default BLE connection interval.
pub const BLE_CONN_INTERVAL: SimTime = SimTime::from_millis(60);

/// Radio-on time of one BLE connection event.
pub const BLE_EVENT_WINDOW: SimTime = SimTime::from_micros(1_250);

/// Default BLE supervision window, in connection events.
pub const BLE_SUPERVISION_EVENTS: u32 = 84;

/// Default Zigbee duty-cycle period.
pub const DUTY_CYCLE_PERIOD: SimTime = SimTime::from_millis(1_000);

static PROFILES: [PhyProfile; 3] = [
    PhyProfile {
        kind: PhyKind::Ble,
        data_rate_bps: 2_000_000.0,
        range_m: 50.0,
        tx_mw: 15.0,
        rx_mw: 10.0,
        idle_mw: 10.0,
        sleep_mw: 0.05,
        header_bytes: 10,
        tx_latency: SimTime::from_micros(7_500),
        ack_timeout: SimTime::from_micros(1_000),
        ack_turnaround: SimTime::from_micros(300),
        access: ChannelAccess::ConnectionEvents,
    },
    PhyProfile {
        kind: PhyKind::Wifi,
        data_rate_bps: 72_200_000.0,
        range_m: 90.0,
        tx_mw: 320.0,
        rx_mw: 220.0,
        idle_mw: 220.0,
        sleep_mw: 2.5,
        header_bytes: 50,
        tx_latency: SimTime::from_micros(2_000),
        ack_timeout: SimTime::from_micros(500),
        ack_turnaround: SimTime::from_micros(50),
        access: ChannelAccess::Csma {
            slot: SimTime::from_micros(20),
            max_slots: 150,
            max_backoffs: 4,
        },
    },
    PhyProfile {
        kind: PhyKind::Zigbee,
        data_rate_bps: 250_000.0,
        range_m: 30.0,
        tx_mw: 35.0,
        rx_mw: 20.0,
        idle_mw: 20.0,
        sleep_mw: 0.1,
        header_bytes: 30,
        tx_latency: SimTime::from_micros(15_000),
        ack_timeout: SimTime::from_micros(1_200),
        ack_turnaround: SimTime::from_micros(600),
        access: ChannelAccess::Csma {
            slot: SimTime::from_micros(320),
            max_slots: 25,
            max_backoffs: 4,
        },
    },
];

impl PhyProfile {
    /// Time on air for `payload_bytes` of MQTT data plus this PHY's framing.
    pub fn transmission_time(&self, payload_bytes: usize) -> SimTime {
        let bits = ((payload_bytes + self.header_bytes) * 8) as f64;
        SimTime::from_secs(bits / self.data_rate_bps)
    }

    /// Random channel-access backoff before sensing (zero for scheduled access).
    pub fn access_delay<R: Rng>(&self, rng: &mut R) -> SimTime {
        match self.access {
            ChannelAccess::ConnectionEvents => SimTime::ZERO,
            ChannelAccess::Csma {
                slot, max_slots, ..
            } => slot * rng.gen_range(0..max_slots.max(1)) as u64,
        }
    }

    /// Power draw in mW for a radio state.
    pub fn power_draw(&self, state: RadioState) -> f64 {
        match state {
            RadioState::Tx => self.tx_mw,
            RadioState::Rx => self.rx_mw,
            RadioState::Idle => self.idle_mw,
            RadioState::Sleep => self.sleep_mw,
        }
    }
}

// ============================================================================
// Radio Schedule
// ============================================================================

/// When a radio is awake and allowed to use the air.
///
/// Periodic schedules put the active window at the start of each period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioSchedule {
    /// Always awake.
    AlwaysOn,
    /// BLE: awake for `window` at every connection event.
    ConnectionEvents {
        /// Connection interval.
        interval: SimTime,
        /// Radio-on time per event.
        window: SimTime,
    },
    /// Zigbee duty cycle: awake for `active` out of every `period`.
    DutyCycled {
        /// Cycle length.
        period: SimTime,
        /// Active part of each cycle.
        active: SimTime,
    },
}

impl RadioSchedule {
    /// Duty-cycled schedule; a fraction of 1 or more is always on.
    pub fn duty_cycled(period: SimTime, fraction: f64) -> Self {
        if fraction >= 1.0 || period == SimTime::ZERO {
            return RadioSchedule::AlwaysOn;
        }
        let active = SimTime::from_micros(
            ((period.as_micros() as f64 * fraction).round() as u64).max(1),
        );
        RadioSchedule::DutyCycled { period, active }
    }

    /// BLE connection events every `interval`.
    pub fn connection_events(interval: SimTime) -> Self {
        RadioSchedule::ConnectionEvents {
            interval,
            window: BLE_EVENT_WINDOW.min(interval),
        }
    }

    /// Schedule of a technology given the run parameters.
    pub fn for_phy(
        phy: PhyKind,
        duty_cycle: f64,
        duty_cycle_period: SimTime,
        ble_interval: SimTime,
    ) -> Self {
        match phy {
            PhyKind::Ble => Self::connection_events(ble_interval),
            PhyKind::Wifi => RadioSchedule::AlwaysOn,
            PhyKind::Zigbee => Self::duty_cycled(duty_cycle_period, duty_cycle),
        }
    }

    /// `(period, active)` in microseconds for periodic schedules.
    fn window_us(&self) -> Option<(u64, u64)> {
        match *self {
            RadioSchedule::AlwaysOn => None,
            RadioSchedule::ConnectionEvents { interval, window } => {
                Some((interval.as_micros().max(1), window.as_micros()))
            }
            RadioSchedule::DutyCycled { period, active } => {
                Some((period.as_micros().max(1), active.as_micros()))
            }
        }
    }

    /// Fraction of time awake.
    pub fn duty_fraction(&self) -> f64 {
        match self.window_us() {
            None => 1.0,
            Some((p, a)) => a as f64 / p as f64,
        }
    }

    /// True when the radio is awake at `t`.
    pub fn is_active(&self, t: SimTime) -> bool {
        match self.window_us() {
            None => true,
            Some((p, a)) => t.as_micros() % p < a,
        }
    }

    /// State of a radio with nothing to send or receive at `t`.
    pub fn background_state(&self, t: SimTime) -> RadioState {
        if self.is_active(t) {
            RadioState::Idle
        } else {
            RadioState::Sleep
        }
    }

    /// Earliest instant `>= t` at which an operation lasting `needed` fits
    /// inside one active window. Operations longer than a window start at
    /// the beginning of one.
    pub fn next_opportunity(&self, t: SimTime, needed: SimTime) -> SimTime {
        let Some((p, a)) = self.window_us() else {
            return t;
        };
        let now = t.as_micros();
        let phase = now % p;
        let needed = needed.as_micros();
        if phase < a && (phase + needed <= a || (phase == 0 && needed > a)) {
            return t;
        }
        SimTime::from_micros(now - phase + p)
    }

    /// Start of the first active window strictly after the one containing `t`.
    pub fn next_window_start(&self, t: SimTime) -> SimTime {
        match self.window_us() {
            None => t,
            Some((p, _)) => {
                let now = t.as_micros();
                SimTime::from_micros(now - now % p + p)
            }
        }
    }

    /// Awake time inside `[from, to)`.
    pub fn active_time_between(&self, from: SimTime, to: SimTime) -> SimTime {
        if to <= from {
            return SimTime::ZERO;
        }
        match self.window_us() {
            None => to - from,
            Some((p, a)) => {
                let cumulative = |t: u64| (t / p) * a + (t % p).min(a);
                SimTime::from_micros(cumulative(to.as_micros()) - cumulative(from.as_micros()))
            }
        }
    }
}

// ============================================================================
// Energy Accounting
// ============================================================================

/// What the radio is doing between two accounting points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Following the schedule: idle while awake, asleep otherwise.
    Background,
    /// Transmitting.
    Tx,
    /// Receiving or waiting for an acknowledgment.
    Rx,
}

/// Integrates power draw over virtual time and drains the battery.
///
/// Remaining energy only ever decreases and is clamped at zero.
#[derive(Debug, Clone)]
pub struct EnergyMeter {
    profile: &'static PhyProfile,
    schedule: RadioSchedule,
    capacity_j: f64,
    remaining_j: f64,
    activity: Activity,
    since: SimTime,
    pending: EnergyUsage,
}

impl EnergyMeter {
    /// Meter for a full battery of `battery_j` joules.
    pub fn new(profile: &'static PhyProfile, schedule: RadioSchedule, battery_j: f64) -> Self {
        EnergyMeter {
            profile,
            schedule,
            capacity_j: battery_j,
            remaining_j: battery_j.max(0.0),
            activity: Activity::Background,
            since: SimTime::ZERO,
            pending: EnergyUsage::default(),
        }
    }

    /// Current activity.
    pub fn activity(&self) -> Activity {
        self.activity
    }

    /// Battery capacity.
    pub fn capacity_j(&self) -> f64 {
        self.capacity_j
    }

    /// Battery left as of the last accounting point.
    pub fn remaining_j(&self) -> f64 {
        self.remaining_j
    }

    /// True once the battery is empty.
    pub fn is_depleted(&self) -> bool {
        self.remaining_j <= 0.0
    }

    /// Account the time since the last accounting point at the current activity.
    pub fn advance(&mut self, now: SimTime) {
        if now <= self.since {
            return;
        }
        let span = now - self.since;
        let secs = span.as_secs_f64();
        let mut usage = EnergyUsage::default();
        let mw_s = match self.activity {
            Activity::Tx => {
                usage.tx_s = secs;
                self.profile.tx_mw * secs
            }
            Activity::Rx => {
                usage.rx_s = secs;
                self.profile.rx_mw * secs
            }
            Activity::Background => {
                let awake = self.schedule.active_time_between(self.since, now).as_secs_f64();
                let asleep = (secs - awake).max(0.0);
                usage.idle_s = awake;
                usage.sleep_s = asleep;
                self.profile.idle_mw * awake + self.profile.sleep_mw * asleep
            }
        };
        let drawn = (mw_s / 1000.0).min(self.remaining_j);
        usage.joules = drawn;
        self.remaining_j = (self.remaining_j - drawn).max(0.0);
        self.pending.add(&usage);
        self.since = now;
    }

    /// Switch activity at `now`, accounting everything before it.
    pub fn set_activity(&mut self, now: SimTime, activity: Activity) {
        self.advance(now);
        self.activity = activity;
    }

    /// Account up to `now` and hand out everything accumulated since the last call.
    pub fn take_usage(&mut self, now: SimTime) -> EnergyUsage {
        self.advance(now);
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_transmission_time_includes_header() {
        // (40 + 30) bytes at 250 kbps
        let t = PhyKind::Zigbee.profile().transmission_time(40);
        assert_eq!(t, SimTime::from_micros(2_240));
        assert!(PhyKind::Wifi.profile().transmission_time(40) < t);
    }

    #[test]
    fn test_unknown_phy_is_rejected() {
        assert_eq!("Zigbee".parse::<PhyKind>(), Ok(PhyKind::Zigbee));
        assert!("lora".parse::<PhyKind>().is_err());
    }

    #[test]
    fn test_access_delay_within_window() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let zigbee = PhyKind::Zigbee.profile();
        for _ in 0..100 {
            assert!(zigbee.access_delay(&mut rng) < SimTime::from_micros(320 * 25));
        }
        assert_eq!(PhyKind::Ble.profile().access_delay(&mut rng), SimTime::ZERO);
    }

    #[test]
    fn test_duty_cycle_opportunities() {
        let s = RadioSchedule::duty_cycled(SimTime::from_millis(1000), 0.05);
        assert_eq!(s.duty_fraction(), 0.05);
        assert!(s.is_active(SimTime::from_millis(1020)));
        assert!(!s.is_active(SimTime::from_millis(1050)));
        // Inside the window with room left
        let t = SimTime::from_millis(1010);
        assert_eq!(s.next_opportunity(t, SimTime::from_millis(5)), t);
        // Too close to the end of the window
        assert_eq!(
            s.next_opportunity(SimTime::from_millis(1048), SimTime::from_millis(5)),
            SimTime::from_millis(2000)
        );
        assert_eq!(
            RadioSchedule::duty_cycled(SimTime::from_millis(1000), 1.0),
            RadioSchedule::AlwaysOn
        );
    }

    #[test]
    fn test_ble_retry_waits_for_next_event() {
        let s = RadioSchedule::connection_events(SimTime::from_millis(60));
        let t = SimTime::from_micros(60_000 + 900);
        assert!(s.is_active(t));
        assert_eq!(s.next_window_start(t), SimTime::from_millis(120));
        assert!((s.duty_fraction() - 1.25 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn test_active_time_between_spans_periods() {
        let s = RadioSchedule::duty_cycled(SimTime::from_millis(1000), 0.1);
        let active = s.active_time_between(SimTime::from_millis(50), SimTime::from_millis(2050));
        // 50 ms of the first window, all of the second, 50 ms of the third
        assert_eq!(active, SimTime::from_millis(200));
    }

    #[test]
    fn test_meter_sleep_ratio_follows_duty_cycle() {
        let profile = PhyKind::Zigbee.profile();
        let schedule = RadioSchedule::duty_cycled(SimTime::from_millis(1000), 0.05);
        let mut meter = EnergyMeter::new(profile, schedule, 100.0);
        let usage = meter.take_usage(SimTime::from_secs(100.0));
        assert!((usage.sleep_ratio() - 0.95).abs() < 1e-9);
        let expected_j = (20.0 * 5.0 + 0.1 * 95.0) / 1000.0;
        assert!((usage.joules - expected_j).abs() < 1e-9);
        assert!((meter.remaining_j() - (100.0 - expected_j)).abs() < 1e-9);
        assert_eq!(meter.take_usage(SimTime::from_secs(100.0)), EnergyUsage::default());
    }

    #[test]
    fn test_meter_clamps_at_zero() {
        let profile = PhyKind::Wifi.profile();
        let mut meter = EnergyMeter::new(profile, RadioSchedule::AlwaysOn, 0.5);
        meter.set_activity(SimTime::ZERO, Activity::Tx);
        let usage = meter.take_usage(SimTime::from_secs(10.0));
        assert_eq!(meter.remaining_j(), 0.0);
        assert!(meter.is_depleted());
        assert!((usage.joules - 0.5).abs() < 1e-12);
        assert!((usage.tx_s - 10.0).abs() < 1e-12);
    }
}
