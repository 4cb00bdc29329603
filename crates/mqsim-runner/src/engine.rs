//! Command surface for an interactive front end.
//!
//! The engine never runs on its own: a front end calls [`Engine::advance`]
//! once per rendered frame, and the engine only moves virtual time forward
//! while it is running.

use crate::view::{ViewFrame, WorldView};
use crate::{create_event_loop, EventLoop, RunnerError, SharedSink, SimTime};
use mqsim_metrics::MetricsSnapshot;
use mqsim_model::{BuildOptions, Scenario};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Lifecycle of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, not started.
    Ready,
    /// Advancing on every call to [`Engine::advance`].
    Running,
    /// Holding time still.
    Paused,
    /// Reached the end of the run.
    Finished,
}

/// An event loop plus the presentation feed and the command surface.
pub struct Engine {
    scenario: Scenario,
    options: fn() -> BuildOptions,
    event_loop: EventLoop,
    view: Arc<Mutex<WorldView>>,
    state: EngineState,
}

impl Engine {
    /// Build an engine for a scenario.
    pub fn new(scenario: Scenario) -> Result<Self, RunnerError> {
        Self::with_options(scenario, BuildOptions::default)
    }

    /// Build an engine whose simulations are built with `options()`, also on reset.
    pub fn with_options(
        scenario: Scenario,
        options: fn() -> BuildOptions,
    ) -> Result<Self, RunnerError> {
        let (event_loop, view) = Self::build(&scenario, options)?;
        Ok(Engine {
            scenario,
            options,
            event_loop,
            view,
            state: EngineState::Ready,
        })
    }

    fn build(
        scenario: &Scenario,
        options: fn() -> BuildOptions,
    ) -> Result<(EventLoop, Arc<Mutex<WorldView>>), RunnerError> {
        let mut event_loop = create_event_loop(scenario, options(), None)?;
        let sink = SharedSink::new(WorldView::new(event_loop.node_infos()));
        let view = sink.handle();
        event_loop.attach_sink(Box::new(sink));
        Ok((event_loop, view))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Current virtual time.
    pub fn now(&self) -> SimTime {
        self.event_loop.now()
    }

    /// The underlying event loop.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Start or resume.
    pub fn start(&mut self) {
        if self.state != EngineState::Finished {
            self.state = EngineState::Running;
        }
    }

    /// Hold virtual time still.
    pub fn pause(&mut self) {
        if self.state == EngineState::Running {
            self.state = EngineState::Paused;
        }
    }

    /// Crash the broker now for `duration_s` seconds.
    pub fn inject_failover(&mut self, duration_s: f64) -> Result<(), RunnerError> {
        if self.state == EngineState::Finished {
            return Err(RunnerError::ConfigError(
                "cannot inject a failover into a finished run".to_string(),
            ));
        }
        self.event_loop.inject_failover(duration_s)
    }

    /// Rebuild from the same scenario and seed.
    pub fn reset(&mut self) -> Result<(), RunnerError> {
        let (event_loop, view) = Self::build(&self.scenario, self.options)?;
        self.event_loop = event_loop;
        self.view = view;
        self.state = EngineState::Ready;
        info!("Engine: reset '{}'", self.scenario.label);
        Ok(())
    }

    /// Move virtual time forward by `delta` if running, and return the new frame.
    pub fn advance(&mut self, delta: SimTime) -> Result<ViewFrame, RunnerError> {
        if self.state == EngineState::Running {
            let end = self.event_loop.duration();
            let target = self.event_loop.now().saturating_add(delta).min(end);
            self.event_loop.run_until(target)?;
            if target >= end {
                self.event_loop.finalize()?;
                self.state = EngineState::Finished;
            }
        }
        Ok(self.view_frame())
    }

    /// Run whatever is left of the run and return the final statistics.
    pub fn run_to_end(&mut self) -> Result<MetricsSnapshot, RunnerError> {
        self.start();
        let snapshot = self.event_loop.run()?;
        self.state = EngineState::Finished;
        Ok(snapshot)
    }

    /// Frame at the current time.
    pub fn view_frame(&self) -> ViewFrame {
        let now = self.event_loop.now();
        self.view.lock().frame(now, self.event_loop.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqsim_common::ClientState;
    use mqsim_model::ExperimentKind;

    fn scenario() -> Scenario {
        let mut scenario = Scenario::preset(ExperimentKind::ProtocolComparison, 42);
        scenario.duration_s = 120.0;
        scenario
    }

    #[test]
    fn test_paused_engine_holds_time() {
        let mut engine = Engine::new(scenario()).expect("builds");
        let frame = engine.advance(SimTime::from_secs(5.0)).expect("advance");
        assert_eq!(frame.time_s, 0.0);

        engine.start();
        engine.advance(SimTime::from_secs(5.0)).expect("advance");
        assert_eq!(engine.now(), SimTime::from_secs(5.0));

        engine.pause();
        let frame = engine.advance(SimTime::from_secs(5.0)).expect("advance");
        assert_eq!(frame.time_s, 5.0);
        assert_eq!(engine.state(), EngineState::Paused);
    }

    #[test]
    fn test_frame_shows_connected_clients() {
        let mut engine = Engine::new(scenario()).expect("builds");
        engine.start();
        let frame = engine.advance(SimTime::from_secs(10.0)).expect("advance");
        assert_eq!(frame.nodes.len(), 13);
        let dashboard = frame
            .nodes
            .iter()
            .find(|n| n.id == "dashboard")
            .expect("dashboard");
        assert_eq!(dashboard.client_state, Some(ClientState::Connected));
    }

    #[test]
    fn test_engine_finishes_and_resets() {
        let mut engine = Engine::new(scenario()).expect("builds");
        engine.start();
        engine.advance(SimTime::from_secs(500.0)).expect("advance");
        assert_eq!(engine.state(), EngineState::Finished);
        assert_eq!(engine.now(), SimTime::from_secs(120.0));
        let finished = engine.view_frame().metrics;

        engine.reset().expect("reset");
        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(engine.now(), SimTime::ZERO);
        let again = engine.run_to_end().expect("runs");
        assert_eq!(again, finished);
    }

    #[test]
    fn test_injected_failover_is_observed() {
        let mut engine = Engine::new(scenario()).expect("builds");
        engine.start();
        engine.advance(SimTime::from_secs(20.0)).expect("advance");
        assert!(engine.inject_failover(-3.0).is_err());
        engine.inject_failover(10.0).expect("injected");
        let frame = engine.advance(SimTime::from_secs(60.0)).expect("advance");
        assert_eq!(frame.metrics.failovers.len(), 1);
        assert!(frame.metrics.failovers[0].restored_at_s.is_some());
    }
}
