//! # mqsim-mobility
//!
//! Node movement over virtual time and the reachability test that turns
//! positions into link state.
//!
//! A [`Mobility`] is a small state machine owned by whoever schedules move
//! events (the medium). Each call to [`Mobility::advance`] applies the
//! movement that completed at the current event and returns the delay until
//! the next one. All random draws come from the caller's seeded RNG.

use mqsim_common::{Position, SimTime};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

// ============================================================================
// Configuration
// ============================================================================

/// Mobility pattern of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MobilityKind {
    /// Position fixed for the run.
    Stationary,
    /// Deterministic waypoint loop, one leg per move event.
    Grid,
    /// Random destination, random speed, pause, repeat.
    RandomWaypoint,
}

/// Mobility parameters for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MobilityConfig {
    /// Pattern.
    pub kind: MobilityKind,
    /// Grid travel speed in m/s.
    #[serde(default = "default_speed")]
    pub speed_m_s: f64,
    /// Random-waypoint speed range `[min, max]` in m/s.
    #[serde(default = "default_speed_range")]
    pub speed_range_m_s: [f64; 2],
    /// Pause at each random waypoint, in seconds.
    #[serde(default = "default_pause")]
    pub pause_s: f64,
    /// Side of the generated grid loop, in meters.
    #[serde(default = "default_grid_step")]
    pub grid_step_m: f64,
    /// Explicit grid waypoints; generated from `grid_step_m` when empty.
    #[serde(default)]
    pub waypoints: Vec<Position>,
    /// Position update granularity while moving between random waypoints.
    #[serde(default = "default_step")]
    pub step_s: f64,
}

fn default_speed() -> f64 {
    1.0
}

fn default_speed_range() -> [f64; 2] {
    [0.5, 2.0]
}

fn default_pause() -> f64 {
    2.0
}

fn default_grid_step() -> f64 {
    20.0
}

fn default_step() -> f64 {
    1.0
}

impl Default for MobilityConfig {
    fn default() -> Self {
        MobilityConfig {
            kind: MobilityKind::Stationary,
            speed_m_s: default_speed(),
            speed_range_m_s: default_speed_range(),
            pause_s: default_pause(),
            grid_step_m: default_grid_step(),
            waypoints: Vec::new(),
            step_s: default_step(),
        }
    }
}

impl MobilityConfig {
    /// Stationary configuration.
    pub fn stationary() -> Self {
        Self::default()
    }

    /// Grid loop with the given step and speed.
    pub fn grid(grid_step_m: f64, speed_m_s: f64) -> Self {
        MobilityConfig {
            kind: MobilityKind::Grid,
            grid_step_m,
            speed_m_s,
            ..Self::default()
        }
    }

    /// Random waypoint with the given speed range and pause.
    pub fn random_waypoint(speed_range_m_s: [f64; 2], pause_s: f64) -> Self {
        MobilityConfig {
            kind: MobilityKind::RandomWaypoint,
            speed_range_m_s,
            pause_s,
            ..Self::default()
        }
    }
}

// ============================================================================
// Area
// ============================================================================

/// Rectangular simulation area anchored at the origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bounds {
    /// Width in meters.
    pub width_m: f64,
    /// Height in meters.
    pub height_m: f64,
}

impl Bounds {
    /// Create bounds.
    pub fn new(width_m: f64, height_m: f64) -> Self {
        Bounds { width_m, height_m }
    }

    /// True when `p` lies inside the area (edges included).
    pub fn contains(&self, p: &Position) -> bool {
        (0.0..=self.width_m).contains(&p.x) && (0.0..=self.height_m).contains(&p.y)
    }

    /// Closest point inside the area.
    pub fn clamp(&self, p: Position) -> Position {
        Position::new(p.x.clamp(0.0, self.width_m), p.y.clamp(0.0, self.height_m))
    }

    /// Uniformly random point inside the area.
    pub fn random_point<R: Rng>(&self, rng: &mut R) -> Position {
        Position::new(
            rng.gen_range(0.0..=self.width_m),
            rng.gen_range(0.0..=self.height_m),
        )
    }
}

// ============================================================================
// Reachability
// ============================================================================

/// Two endpoints can exchange frames iff they are within `range_m` of each other.
pub fn reachable(a: &Position, b: &Position, range_m: f64) -> bool {
    a.distance_to(b) <= range_m
}

/// Index of the closest candidate within `range_m`; ties go to the lower index.
pub fn nearest_within<'a, I>(from: &Position, candidates: I, range_m: f64) -> Option<usize>
where
    I: IntoIterator<Item = &'a Position>,
{
    let mut best: Option<(usize, f64)> = None;
    for (idx, p) in candidates.into_iter().enumerate() {
        let d = from.distance_to(p);
        if d > range_m {
            continue;
        }
        match best {
            Some((_, best_d)) if best_d <= d => {}
            _ => best = Some((idx, d)),
        }
    }
    best.map(|(idx, _)| idx)
}

// ============================================================================
// Mobility State Machine
// ============================================================================

#[derive(Debug, Clone)]
enum MobilityState {
    Stationary,
    Grid {
        waypoints: Vec<Position>,
        next: usize,
    },
    Pausing,
    Moving {
        target: Position,
        speed: f64,
        /// Distance covered by the step that ends at the next event.
        pending_m: f64,
    },
}

/// Movement of one node.
#[derive(Debug, Clone)]
pub struct Mobility {
    config: MobilityConfig,
    bounds: Bounds,
    state: MobilityState,
}

impl Mobility {
    /// Build the state machine for a node starting at `initial`.
    pub fn new(config: MobilityConfig, initial: Position, bounds: Bounds) -> Self {
        let state = match config.kind {
            MobilityKind::Stationary => MobilityState::Stationary,
            MobilityKind::Grid => {
                let waypoints = if config.waypoints.is_empty() {
                    grid_loop(initial, config.grid_step_m, &bounds)
                } else {
                    config.waypoints.iter().map(|p| bounds.clamp(*p)).collect()
                };
                let loop_len: f64 = waypoints
                    .iter()
                    .zip(waypoints.iter().cycle().skip(1))
                    .map(|(a, b)| a.distance_to(b))
                    .sum();
                if loop_len > 0.0 && config.speed_m_s > 0.0 {
                    MobilityState::Grid { waypoints, next: 0 }
                } else {
                    MobilityState::Stationary
                }
            }
            MobilityKind::RandomWaypoint => MobilityState::Pausing,
        };
        Mobility {
            config,
            bounds,
            state,
        }
    }

    /// Configured pattern.
    pub fn kind(&self) -> MobilityKind {
        self.config.kind
    }

    /// Delay until the first move event, or `None` for a node that never moves.
    pub fn first_move<R: Rng>(&mut self, position: &mut Position, rng: &mut R) -> Option<SimTime> {
        match &self.state {
            MobilityState::Stationary => None,
            MobilityState::Grid { waypoints, next } => {
                let leg = position.distance_to(&waypoints[*next]);
                Some(SimTime::from_secs(leg / self.config.speed_m_s))
            }
            MobilityState::Pausing | MobilityState::Moving { .. } => self.advance(position, rng),
        }
    }

    /// Apply the movement due at this event and return the delay to the next one.
    pub fn advance<R: Rng>(&mut self, position: &mut Position, rng: &mut R) -> Option<SimTime> {
        match &mut self.state {
            MobilityState::Stationary => None,
            MobilityState::Grid { waypoints, next } => {
                *position = waypoints[*next];
                *next = (*next + 1) % waypoints.len();
                let leg = position.distance_to(&waypoints[*next]);
                Some(SimTime::from_secs(leg / self.config.speed_m_s))
            }
            MobilityState::Pausing => {
                let target = self.bounds.random_point(rng);
                let [lo, hi] = self.config.speed_range_m_s;
                let speed = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
                let pending_m = (self.config.step_s * speed).min(position.distance_to(&target));
                trace!(
                    "Mobility: heading to ({:.1}, {:.1}) at {:.2} m/s",
                    target.x,
                    target.y,
                    speed
                );
                self.state = MobilityState::Moving {
                    target,
                    speed,
                    pending_m,
                };
                Some(SimTime::from_secs(pending_m / speed))
            }
            MobilityState::Moving {
                target,
                speed,
                pending_m,
            } => {
                let remaining = position.distance_to(target);
                if *pending_m >= remaining - 1e-9 {
                    *position = *target;
                    self.state = MobilityState::Pausing;
                    return Some(SimTime::from_secs(self.config.pause_s));
                }
                *position = position.lerp(target, *pending_m / remaining);
                let remaining = position.distance_to(target);
                *pending_m = (self.config.step_s * *speed).min(remaining);
                Some(SimTime::from_secs(*pending_m / *speed))
            }
        }
    }
}

/// Square loop of side `step` starting at the grid point nearest `origin`,
/// folded back inside the area when it would leave it.
fn grid_loop(origin: Position, step: f64, bounds: &Bounds) -> Vec<Position> {
    if step <= 0.0 {
        return vec![origin];
    }
    let snap = |v: f64| (v / step).round() * step;
    let start = bounds.clamp(Position::new(snap(origin.x), snap(origin.y)));
    let dx = if start.x + step <= bounds.width_m { step } else { -step };
    let dy = if start.y + step <= bounds.height_m { step } else { -step };
    vec![
        start,
        bounds.clamp(Position::new(start.x + dx, start.y)),
        bounds.clamp(Position::new(start.x + dx, start.y + dy)),
        bounds.clamp(Position::new(start.x, start.y + dy)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn area() -> Bounds {
        Bounds::new(100.0, 100.0)
    }

    #[test]
    fn test_reachability_threshold_is_inclusive() {
        let a = Position::new(0.0, 0.0);
        assert!(reachable(&a, &Position::new(30.0, 0.0), 30.0));
        assert!(!reachable(&a, &Position::new(30.01, 0.0), 30.0));
    }

    #[test]
    fn test_nearest_within_prefers_closest_then_lowest_index() {
        let from = Position::new(50.0, 50.0);
        let gws = [
            Position::new(90.0, 50.0),
            Position::new(60.0, 50.0),
            Position::new(40.0, 50.0),
        ];
        assert_eq!(nearest_within(&from, gws.iter(), 45.0), Some(1));
        assert_eq!(nearest_within(&from, gws.iter(), 5.0), None);
    }

    #[test]
    fn test_stationary_never_moves() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut pos = Position::new(10.0, 10.0);
        let mut m = Mobility::new(MobilityConfig::stationary(), pos, area());
        assert!(m.first_move(&mut pos, &mut rng).is_none());
        assert_eq!(pos, Position::new(10.0, 10.0));
    }

    #[test]
    fn test_grid_visits_loop_one_leg_per_event() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut pos = Position::new(20.0, 20.0);
        let mut m = Mobility::new(MobilityConfig::grid(20.0, 2.0), pos, area());

        // Starts on a grid point, so the first leg has zero length.
        assert_eq!(m.first_move(&mut pos, &mut rng), Some(SimTime::ZERO));
        let mut visited = Vec::new();
        for _ in 0..5 {
            let delay = m.advance(&mut pos, &mut rng).expect("grid keeps moving");
            visited.push(pos);
            // 20 m legs at 2 m/s
            assert_eq!(delay, SimTime::from_secs(10.0));
        }
        assert_eq!(visited[1], Position::new(40.0, 20.0));
        assert_eq!(visited[2], Position::new(40.0, 40.0));
        assert_eq!(visited[3], Position::new(20.0, 40.0));
        assert_eq!(visited[4], Position::new(20.0, 20.0));
    }

    #[test]
    fn test_grid_folds_back_at_area_edge() {
        let waypoints = grid_loop(Position::new(99.0, 99.0), 20.0, &area());
        assert!(waypoints.iter().all(|p| area().contains(p)));
        assert_eq!(waypoints[0], Position::new(100.0, 100.0));
        assert_eq!(waypoints[1], Position::new(80.0, 100.0));
    }

    #[test]
    fn test_random_waypoint_stays_in_bounds_and_pauses() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut pos = Position::new(50.0, 50.0);
        let config = MobilityConfig::random_waypoint([1.0, 2.0], 3.0);
        let mut m = Mobility::new(config, pos, area());

        let mut delay = m.first_move(&mut pos, &mut rng);
        let mut pauses = 0;
        for _ in 0..2_000 {
            let d = delay.expect("random waypoint keeps moving");
            assert!(d <= SimTime::from_secs(3.0));
            if d == SimTime::from_secs(3.0) {
                pauses += 1;
            }
            delay = m.advance(&mut pos, &mut rng);
            assert!(area().contains(&pos), "left the area: {:?}", pos);
        }
        assert!(pauses > 0, "never reached a waypoint");
    }

    #[test]
    fn test_random_waypoint_is_reproducible() {
        let run = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut pos = Position::new(10.0, 90.0);
            let mut m = Mobility::new(
                MobilityConfig::random_waypoint([0.5, 2.0], 1.0),
                pos,
                area(),
            );
            let mut trail = Vec::new();
            let _ = m.first_move(&mut pos, &mut rng);
            for _ in 0..200 {
                let _ = m.advance(&mut pos, &mut rng);
                trail.push(pos);
            }
            trail
        };
        assert_eq!(run(9), run(9));
        assert_ne!(run(9), run(10));
    }
}
