//! # mqsim-runner library
//!
//! Library interface for running mqsim simulations programmatically and for
//! integration testing.
//!
//! - [`EventLoop`] drives a [`BuiltSimulation`]: it pops events in
//!   `(time, insertion order)`, dispatches them to entities and hands every
//!   observation to the metrics aggregator, the trace recorder and any
//!   attached [`EventSink`].
//! - [`Engine`] wraps an event loop with the presentation command surface
//!   (`start`, `pause`, `inject_failover`, `reset`, `advance`) and a
//!   [`WorldView`] feed.
//! - [`run_scenario`] runs one scenario to completion and returns its
//!   [`RunReport`].

pub mod engine;
pub mod metrics_export;
pub mod view;

pub use engine::{Engine, EngineState};
pub use mqsim_common::SimTime;
pub use view::{InFlightView, NodeView, ViewFrame, WorldView};

use mqsim_common::{
    BrokerCommand, EntityId, EventPayload, EventSink, NodeId, Observation, Record, SimContext,
    SinkError,
};
use mqsim_metrics::{MetricsAggregator, MetricsSnapshot, SeriesPoint, SeriesRecorder};
use mqsim_model::{build_simulation, BuildOptions, BuiltSimulation, NodeInfo, Scenario};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] mqsim_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] mqsim_common::SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Event loop counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationStats {
    /// Events dispatched.
    pub total_events: u64,
    /// Observations handed to sinks.
    pub total_observations: u64,
    /// Virtual time reached, in microseconds.
    pub simulation_time_us: u64,
    /// Sinks detached after an error.
    pub detached_sinks: u64,
}

// ============================================================================
// Trace Recording
// ============================================================================

/// A trace entry for output.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    /// Virtual time in seconds.
    pub time_s: f64,
    /// Name of the node the observation is about, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// The observation (flattened into this object, tagged by `kind`).
    #[serde(flatten)]
    pub observation: Observation,
}

/// The node an observation is about.
pub fn observation_node(observation: &Observation) -> Option<NodeId> {
    match observation {
        Observation::Published { key, .. }
        | Observation::Retransmitted { key, .. }
        | Observation::Acked { key, .. }
        | Observation::Lost { key, .. } => Some(key.origin),
        Observation::Delivered { subscriber, .. }
        | Observation::DeliveryAbandoned { subscriber, .. }
        | Observation::QueueDrop { subscriber, .. } => Some(*subscriber),
        Observation::BrokerDrop { node, .. } => Some(*node),
        Observation::SessionDiscarded { client, .. } | Observation::WillPublished { client, .. } => {
            Some(*client)
        }
        Observation::OutboxDrop { node, .. }
        | Observation::ClientState { node, .. }
        | Observation::Energy { node, .. }
        | Observation::RadioState { node, .. }
        | Observation::NodeDepleted { node }
        | Observation::MacDrop { node, .. }
        | Observation::BackhaulDrop { node, .. }
        | Observation::LinkChanged { node, .. }
        | Observation::Moved { node, .. }
        | Observation::AirStarted { node, .. } => Some(*node),
        Observation::BrokerFailed { .. }
        | Observation::BrokerQueueDepth { .. }
        | Observation::BrokerRestored
        | Observation::AirEnded { .. } => None,
    }
}

/// Trace recorder for outputting simulation observations as a JSON array.
pub struct TraceRecorder {
    output: Option<Box<dyn Write + Send>>,
    names: BTreeMap<NodeId, String>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    /// Create a new trace recorder. Nothing is recorded without an output.
    pub fn new(output: Option<Box<dyn Write + Send>>, node_infos: &[NodeInfo]) -> Self {
        TraceRecorder {
            output,
            names: node_infos
                .iter()
                .map(|info| (info.node, info.name.clone()))
                .collect(),
            entries: Vec::new(),
        }
    }

    /// True when records are kept.
    pub fn is_enabled(&self) -> bool {
        self.output.is_some()
    }

    /// Record an observation.
    pub fn record(&mut self, record: &Record) {
        if !self.is_enabled() {
            return;
        }
        let node = observation_node(&record.observation)
            .map(|n| self.names.get(&n).cloned().unwrap_or_else(|| n.to_string()));
        self.entries.push(TraceEntry {
            time_s: record.time.as_secs_f64(),
            node,
            observation: record.observation.clone(),
        });
    }

    /// Flush all entries to output.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if let Some(ref mut output) = self.output {
            let json = serde_json::to_string_pretty(&self.entries)?;
            writeln!(output, "{}", json)?;
            output.flush()?;
            self.entries.clear();
        }
        Ok(())
    }
}

// ============================================================================
// Shared Sinks
// ============================================================================

/// An [`EventSink`] that can still be read while attached to an event loop.
pub struct SharedSink<S>(Arc<Mutex<S>>);

impl<S> SharedSink<S> {
    /// Wrap a sink.
    pub fn new(sink: S) -> Self {
        SharedSink(Arc::new(Mutex::new(sink)))
    }

    /// Another handle to the same sink.
    pub fn handle(&self) -> Arc<Mutex<S>> {
        self.0.clone()
    }
}

impl<S> Clone for SharedSink<S> {
    fn clone(&self) -> Self {
        SharedSink(self.0.clone())
    }
}

impl<S: EventSink> EventSink for SharedSink<S> {
    fn name(&self) -> &str {
        "shared"
    }

    fn observe(&mut self, record: &Record) -> Result<(), SinkError> {
        self.0.lock().observe(record)
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// The main simulation event loop.
pub struct EventLoop {
    simulation: BuiltSimulation,
    context: SimContext,
    metrics: MetricsAggregator,
    series: SeriesRecorder,
    sinks: Vec<Box<dyn EventSink>>,
    trace: TraceRecorder,
    stats: SimulationStats,
    finalized: bool,
}

impl EventLoop {
    /// Create a new event loop and schedule the simulation's initial events.
    pub fn new(
        mut simulation: BuiltSimulation,
        trace_output: Option<Box<dyn Write + Send>>,
    ) -> Result<Self, RunnerError> {
        let mut context = SimContext::new(simulation.seed);
        for event in std::mem::take(&mut simulation.initial_events) {
            context
                .scheduler_mut()
                .schedule_at(event.time, event.source, event.targets, event.payload)?;
        }
        let metrics = MetricsAggregator::new(simulation.node_labels());
        let series = SeriesRecorder::new(simulation.snapshot_interval);
        let trace = TraceRecorder::new(trace_output, &simulation.node_infos);
        Ok(EventLoop {
            simulation,
            context,
            metrics,
            series,
            sinks: Vec::new(),
            trace,
            stats: SimulationStats::default(),
            finalized: false,
        })
    }

    /// Attach another observation consumer.
    pub fn attach_sink(&mut self, sink: Box<dyn EventSink>) {
        debug!("EventLoop: attaching sink '{}'", sink.name());
        self.sinks.push(sink);
    }

    /// Current virtual time.
    pub fn now(&self) -> SimTime {
        self.context.time()
    }

    /// Configured run length.
    pub fn duration(&self) -> SimTime {
        self.simulation.duration
    }

    /// Scenario label.
    pub fn label(&self) -> &str {
        &self.simulation.label
    }

    /// Seed of the run.
    pub fn seed(&self) -> u64 {
        self.simulation.seed
    }

    /// Node infos of the simulation.
    pub fn node_infos(&self) -> &[NodeInfo] {
        &self.simulation.node_infos
    }

    /// Event loop counters.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// True once [`finalize`](Self::finalize) ran.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Statistics derived so far.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Snapshots sampled every `snapshot_interval_s` so far.
    pub fn series(&self) -> &[SeriesPoint] {
        self.series.points()
    }

    /// Sample every grid instant before `time`, or up to and including it.
    fn sample_series(&mut self, time: SimTime, inclusive: bool) {
        loop {
            let due = self.series.next_due();
            if due > time || (due == time && !inclusive) {
                break;
            }
            self.series.sample(due, &self.metrics.snapshot());
        }
    }

    /// Process the next event, if it is due no later than the run length.
    ///
    /// Returns the time of the processed event.
    pub fn step(&mut self) -> Result<Option<SimTime>, RunnerError> {
        let limit = self.simulation.duration;
        match self.context.scheduler_mut().pop_until(limit) {
            Some(event) => {
                let time = event.time;
                self.sample_series(time, false);
                self.dispatch(&event)?;
                Ok(Some(time))
            }
            None => Ok(None),
        }
    }

    /// Process every event due no later than `limit`, then move the clock to `limit`.
    pub fn run_until(&mut self, limit: SimTime) -> Result<(), RunnerError> {
        while let Some(event) = self.context.scheduler_mut().pop_until(limit) {
            self.sample_series(event.time, false);
            self.dispatch(&event)?;
        }
        self.context.scheduler_mut().advance_to(limit);
        self.sample_series(limit, true);
        self.stats.simulation_time_us = self.context.time().as_micros();
        Ok(())
    }

    /// Run to the configured length and finalize.
    pub fn run(&mut self) -> Result<MetricsSnapshot, RunnerError> {
        let end = self.simulation.duration;
        self.run_until(end)?;
        self.finalize()
    }

    /// Schedule a broker crash now, lasting `duration_s` seconds.
    pub fn inject_failover(&mut self, duration_s: f64) -> Result<(), RunnerError> {
        let down_for = SimTime::try_from_secs(duration_s)?;
        let broker = self.simulation.broker;
        info!("EventLoop: injecting broker failover for {}", down_for);
        self.context.scheduler_mut().schedule(
            SimTime::ZERO,
            broker,
            vec![broker],
            EventPayload::BrokerControl(BrokerCommand::Crash { down_for }),
        );
        Ok(())
    }

    /// Close energy accounting at the current instant, flush the trace and
    /// return the final snapshot. Calling it again returns the same snapshot.
    pub fn finalize(&mut self) -> Result<MetricsSnapshot, RunnerError> {
        if !self.finalized {
            let radios: Vec<EntityId> = self
                .simulation
                .node_infos
                .iter()
                .filter_map(|info| info.radio_entity)
                .collect();
            if !radios.is_empty() {
                self.context
                    .scheduler_mut()
                    .schedule(SimTime::ZERO, EntityId(0), radios, EventPayload::Settle);
            }
            let now = self.context.time();
            self.run_until(now)?;
            self.trace.flush()?;
            self.finalized = true;
            debug!(
                "EventLoop: finalized at {} after {} events",
                now, self.stats.total_events
            );
        }
        Ok(self.metrics.snapshot())
    }

    fn dispatch(&mut self, event: &mqsim_common::Event) -> Result<(), RunnerError> {
        if matches!(event.payload, EventPayload::SimulationEnd) {
            return Ok(());
        }
        self.simulation
            .entities
            .dispatch_event(event, &mut self.context)?;
        self.stats.total_events += 1;

        for record in self.context.take_observations() {
            self.stats.total_observations += 1;
            self.metrics.apply(&record);
            self.trace.record(&record);
            let mut failed = Vec::new();
            for (i, sink) in self.sinks.iter_mut().enumerate() {
                if let Err(e) = sink.observe(&record) {
                    warn!("EventLoop: sink '{}' failed and is detached: {}", sink.name(), e);
                    failed.push(i);
                }
            }
            for i in failed.into_iter().rev() {
                self.sinks.remove(i);
                self.stats.detached_sinks += 1;
            }
        }
        Ok(())
    }
}

/// Build a simulation and wrap it in an event loop.
pub fn create_event_loop(
    scenario: &Scenario,
    options: BuildOptions,
    trace_output: Option<Box<dyn Write + Send>>,
) -> Result<EventLoop, RunnerError> {
    let simulation = build_simulation(scenario, options)?;
    EventLoop::new(simulation, trace_output)
}

// ============================================================================
// Run Reports
// ============================================================================

/// Finalized result of one run, keyed by its label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Scenario label.
    pub label: String,
    /// Experiment preset the scenario came from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<String>,
    /// Seed of the run.
    pub seed: u64,
    /// Virtual run length.
    pub duration_s: f64,
    /// Final statistics.
    pub snapshot: MetricsSnapshot,
    /// Statistics sampled along the run.
    #[serde(default)]
    pub series: Vec<SeriesPoint>,
}

impl RunReport {
    /// Write the report as pretty JSON.
    pub fn write_json<W: Write>(&self, writer: &mut W) -> Result<(), RunnerError> {
        serde_json::to_writer_pretty(&mut *writer, self)?;
        writeln!(writer)?;
        Ok(())
    }
}

/// Run a scenario to completion.
pub fn run_scenario(
    scenario: &Scenario,
    options: BuildOptions,
    experiment: Option<String>,
    trace_output: Option<Box<dyn Write + Send>>,
) -> Result<RunReport, RunnerError> {
    let mut event_loop = create_event_loop(scenario, options, trace_output)?;
    let snapshot = event_loop.run()?;
    info!(
        "Run '{}' (seed {}) finished: {} events, delivery ratio {:.3}",
        scenario.label,
        scenario.seed,
        event_loop.stats().total_events,
        snapshot.overall.delivery_ratio
    );
    Ok(RunReport {
        label: scenario.label.clone(),
        experiment,
        seed: scenario.seed,
        duration_s: scenario.duration_s,
        snapshot,
        series: event_loop.series().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqsim_model::ExperimentKind;

    struct FailingSink {
        calls: Arc<Mutex<u32>>,
    }

    impl EventSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn observe(&mut self, _record: &Record) -> Result<(), SinkError> {
            *self.calls.lock() += 1;
            Err(SinkError::Failed("boom".to_string()))
        }
    }

    fn short_scenario() -> Scenario {
        let mut scenario = Scenario::preset(ExperimentKind::ProtocolComparison, 42);
        scenario.duration_s = 60.0;
        scenario
    }

    #[test]
    fn test_failing_sink_is_detached_without_stopping_run() {
        let calls = Arc::new(Mutex::new(0));
        let mut event_loop =
            create_event_loop(&short_scenario(), BuildOptions::default(), None).expect("builds");
        event_loop.attach_sink(Box::new(FailingSink {
            calls: calls.clone(),
        }));
        let snapshot = event_loop.run().expect("run completes");
        assert_eq!(*calls.lock(), 1);
        assert_eq!(event_loop.stats().detached_sinks, 1);
        assert!(snapshot.overall.published > 0);
    }

    #[test]
    fn test_run_until_advances_clock_and_finalize_is_idempotent() {
        let mut event_loop =
            create_event_loop(&short_scenario(), BuildOptions::default(), None).expect("builds");
        event_loop
            .run_until(SimTime::from_secs(10.0))
            .expect("runs");
        assert_eq!(event_loop.now(), SimTime::from_secs(10.0));
        let first = event_loop.finalize().expect("finalizes");
        let second = event_loop.finalize().expect("finalizes again");
        assert_eq!(first, second);
        assert!((first.time_s - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_series_samples_every_interval() {
        let mut event_loop =
            create_event_loop(&short_scenario(), BuildOptions::default(), None).expect("builds");
        let snapshot = event_loop.run().expect("runs");
        let series = event_loop.series();

        let times: Vec<f64> = series.iter().map(|p| p.time_s).collect();
        let expected: Vec<f64> = (1..=12).map(|i| i as f64 * 5.0).collect();
        assert_eq!(times, expected);
        assert!(series.windows(2).all(|w| w[0].published <= w[1].published));
        let last = series.last().expect("samples");
        assert_eq!(last.published, snapshot.overall.published);
        let rate_total: f64 = series
            .iter()
            .flat_map(|p| p.topic_rates.values())
            .map(|rate| rate * 5.0)
            .sum();
        assert!((rate_total - snapshot.overall.published as f64).abs() < 1e-6);
    }

    #[test]
    fn test_negative_failover_is_rejected() {
        let mut event_loop =
            create_event_loop(&short_scenario(), BuildOptions::default(), None).expect("builds");
        assert!(matches!(
            event_loop.inject_failover(-1.0),
            Err(RunnerError::Simulation(mqsim_common::SimError::NegativeDelay(_)))
        ));
    }

    #[test]
    fn test_trace_records_observations() {
        let buffer = SharedBuffer::default();
        let mut event_loop = create_event_loop(
            &short_scenario(),
            BuildOptions::default(),
            Some(Box::new(buffer.clone())),
        )
        .expect("builds");
        event_loop.run().expect("runs");
        let text = String::from_utf8(buffer.0.lock().clone()).expect("utf8");
        let entries: Vec<serde_json::Value> = serde_json::from_str(&text).expect("json array");
        assert!(entries
            .iter()
            .any(|e| e["kind"] == "published" && e["node"] == "sensor_0"));
        assert!(entries.iter().any(|e| e["kind"] == "client_state"));
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
