//! # mqsim-mqtt
//!
//! MQTT protocol engine for mqsim.
//!
//! This crate provides:
//!
//! - [`Client`] - the per-node client state machine: connect, QoS0/QoS1
//!   publish with retransmission, keep-alive, reconnect with exponential
//!   backoff and an offline outbox.
//!
//! - [`Broker`] - the single broker of a run: sessions (clean or
//!   persistent), subscription fan-out into bounded per-client queues, the
//!   retained store, last-will delivery and crash/restore.
//!
//! Packets are exchanged as in-process [`Packet`](mqsim_common::Packet)
//! values. Clients hand frames to their radio; the broker hands downlink
//! packets to the medium.

pub mod broker;
pub mod client;

pub use broker::{Broker, BrokerConfig, BROKER_SWEEP_TIMER};
pub use client::{Client, ClientConfig, PublishConfig};

use mqsim_common::SimTime;
use rand::Rng;
use serde::{Deserialize, Serialize};

// ============================================================================
// Topic Filters
// ============================================================================

/// True when `topic` matches the subscription `filter`.
///
/// `+` matches exactly one level, a trailing `#` matches the parent level and
/// everything below it.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// True when `filter` is a well-formed subscription filter.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == levels.len() - 1,
        "+" => true,
        other => !other.contains('#') && !other.contains('+'),
    })
}

// ============================================================================
// Retry and Backoff
// ============================================================================

/// QoS1 retransmission policy, shared by clients and the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Time to wait for an acknowledgment before resending.
    pub interval: SimTime,
    /// Retransmissions before the message is given up.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            interval: SimTime::from_secs(2.0),
            max_retries: 3,
        }
    }
}

/// Reconnect backoff: `min(base * 2^attempt, cap)` plus uniform jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay of the first attempt.
    pub base: SimTime,
    /// Upper bound of the exponential part.
    pub cap: SimTime,
    /// Jitter bound; each delay gets `uniform(0, jitter)` added.
    pub jitter: SimTime,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: SimTime::from_millis(500),
            cap: SimTime::from_secs(5.0),
            jitter: SimTime::from_millis(500),
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> SimTime {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let exponential = self
            .base
            .as_micros()
            .saturating_mul(factor)
            .min(self.cap.as_micros());
        let jitter = if self.jitter > SimTime::ZERO {
            rng.gen_range(0..=self.jitter.as_micros())
        } else {
            0
        };
        SimTime::from_micros(exponential.saturating_add(jitter))
    }

    /// Largest delay [`delay`](Self::delay) can return.
    pub fn max_delay(&self) -> SimTime {
        self.cap.max(self.base).saturating_add(self.jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("sensors/temperature", "sensors/temperature"));
        assert!(!topic_matches("sensors/temperature", "sensors/humidity"));
        assert!(topic_matches("sensors/+", "sensors/humidity"));
        assert!(!topic_matches("sensors/+", "sensors/a/b"));
        assert!(topic_matches("alerts/#", "alerts/status"));
        assert!(topic_matches("alerts/#", "alerts"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("alerts/#", "sensors/alerts"));
        assert!(!topic_matches("sensors", "sensors/temperature"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(valid_filter("#"));
        assert!(valid_filter("a/+/c"));
        assert!(!valid_filter("a/#/c"));
        assert!(!valid_filter("a/b#"));
        assert!(!valid_filter(""));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let backoff = Backoff {
            base: SimTime::from_millis(500),
            cap: SimTime::from_secs(5.0),
            jitter: SimTime::ZERO,
        };
        let delays: Vec<SimTime> = (0..6).map(|a| backoff.delay(a, &mut rng)).collect();
        assert_eq!(delays[0], SimTime::from_millis(500));
        assert_eq!(delays[1], SimTime::from_millis(1000));
        assert_eq!(delays[3], SimTime::from_millis(4000));
        assert_eq!(delays[4], SimTime::from_millis(5000));
        assert_eq!(delays[5], SimTime::from_millis(5000));
        assert_eq!(backoff.delay(200, &mut rng), SimTime::from_millis(5000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let backoff = Backoff::default();
        for attempt in 0..10 {
            let d = backoff.delay(attempt, &mut rng);
            let floor = SimTime::from_micros(
                (backoff.base.as_micros() << attempt).min(backoff.cap.as_micros()),
            );
            assert!(d >= floor);
            assert!(d <= floor + backoff.jitter);
            assert!(d <= backoff.max_delay());
        }
    }
}
