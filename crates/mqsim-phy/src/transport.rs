//! Gateway backhaul and per-frame loss.
//!
//! Both are trait objects so scenarios and tests can swap in a
//! lower-fidelity or scripted implementation. The only contract is
//! "deliver or drop after some duration".

use mqsim_common::{Frame, LinkDirection, SimTime};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Outcome of carrying a packet across a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carry {
    /// Delivered after the given delay.
    Deliver(SimTime),
    /// Lost.
    Drop,
}

/// A gateway-broker link.
pub trait Transport: Send {
    /// Carry `bytes` sent at `now` in `direction`.
    fn carry(
        &mut self,
        now: SimTime,
        direction: LinkDirection,
        bytes: usize,
        rng: &mut ChaCha8Rng,
    ) -> Carry;
}

/// Ordered WAN link with latency, uniform jitter and Bernoulli loss.
///
/// Packets in one direction never overtake each other.
#[derive(Debug, Clone)]
pub struct WanLink {
    /// Mean one-way latency.
    pub latency: SimTime,
    /// Jitter bound; each packet gets `latency ± uniform(jitter)`.
    pub jitter: SimTime,
    /// Probability that a packet is lost.
    pub loss_rate: f64,
    last_arrival: [SimTime; 2],
}

impl WanLink {
    /// Create a link.
    pub fn new(latency: SimTime, jitter: SimTime, loss_rate: f64) -> Self {
        WanLink {
            latency,
            jitter,
            loss_rate,
            last_arrival: [SimTime::ZERO; 2],
        }
    }
}

impl Transport for WanLink {
    fn carry(
        &mut self,
        now: SimTime,
        direction: LinkDirection,
        _bytes: usize,
        rng: &mut ChaCha8Rng,
    ) -> Carry {
        if self.loss_rate > 0.0 && rng.gen_bool(self.loss_rate.min(1.0)) {
            return Carry::Drop;
        }
        let jitter = self.jitter.as_micros() as i64;
        let offset = if jitter > 0 {
            rng.gen_range(-jitter..=jitter)
        } else {
            0
        };
        let delay = SimTime::from_micros((self.latency.as_micros() as i64 + offset).max(0) as u64);
        let slot = match direction {
            LinkDirection::Uplink => 0,
            LinkDirection::Downlink => 1,
        };
        let arrival = (now + delay).max(self.last_arrival[slot]);
        self.last_arrival[slot] = arrival;
        Carry::Deliver(arrival - now)
    }
}

/// Decides whether a single MAC attempt of a frame is lost.
pub trait LossModel: Send {
    /// `attempt` is 0 for the first transmission of the frame.
    fn frame_lost(
        &mut self,
        frame: &Frame,
        direction: LinkDirection,
        attempt: u8,
        rng: &mut ChaCha8Rng,
    ) -> bool;
}

/// Independent loss with a fixed probability per attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BernoulliLoss {
    /// Loss probability in `[0, 1]`.
    pub rate: f64,
}

impl LossModel for BernoulliLoss {
    fn frame_lost(
        &mut self,
        _frame: &Frame,
        _direction: LinkDirection,
        _attempt: u8,
        rng: &mut ChaCha8Rng,
    ) -> bool {
        self.rate > 0.0 && rng.gen_bool(self.rate.min(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqsim_common::{FrameId, NodeId, Packet};
    use rand::SeedableRng;

    #[test]
    fn test_wan_link_keeps_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut link = WanLink::new(SimTime::from_millis(50), SimTime::from_millis(40), 0.0);
        let mut last = SimTime::ZERO;
        for i in 0..50u64 {
            let now = SimTime::from_millis(i);
            match link.carry(now, LinkDirection::Uplink, 20, &mut rng) {
                Carry::Deliver(delay) => {
                    assert!(delay >= SimTime::from_millis(10));
                    assert!(now + delay >= last);
                    last = now + delay;
                }
                Carry::Drop => panic!("lossless link dropped"),
            }
        }
    }

    #[test]
    fn test_full_loss_drops_everything() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut link = WanLink::new(SimTime::from_millis(50), SimTime::ZERO, 1.0);
        assert_eq!(
            link.carry(SimTime::ZERO, LinkDirection::Downlink, 20, &mut rng),
            Carry::Drop
        );

        let frame = Frame {
            id: FrameId(1),
            node: NodeId(0),
            packet: Packet::PingReq,
        };
        let mut never = BernoulliLoss { rate: 0.0 };
        let mut always = BernoulliLoss { rate: 1.0 };
        assert!(!never.frame_lost(&frame, LinkDirection::Uplink, 0, &mut rng));
        assert!(always.frame_lost(&frame, LinkDirection::Uplink, 0, &mut rng));
    }
}
