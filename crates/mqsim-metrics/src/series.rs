//! Time series of the running aggregate.
//!
//! [`SeriesRecorder`] samples a [`MetricsSnapshot`] on a fixed grid of
//! virtual instants. Per-topic rates are taken over the interval since the
//! previous sample.

use crate::aggregator::MetricsSnapshot;
use mqsim_common::SimTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Sample instant.
    pub time_s: f64,
    /// Messages published so far.
    pub published: u64,
    /// Messages delivered so far.
    pub delivered: u64,
    /// `delivered / published` at the sample.
    pub delivery_ratio: f64,
    /// Duplicate receptions so far.
    pub duplicates: u64,
    /// Messages lost so far.
    pub messages_lost: u64,
    /// Messages neither delivered nor dropped.
    pub in_flight: u64,
    /// Mean latency over every delivery so far.
    pub mean_latency_s: f64,
    /// Energy drawn by all nodes so far.
    pub total_energy_j: f64,
    /// Messages queued for offline sessions.
    pub broker_queue_depth: u64,
    /// Publications per second on each topic since the previous sample.
    pub topic_rates: BTreeMap<String, f64>,
}

/// Samples snapshots every `interval` of virtual time.
#[derive(Debug, Clone)]
pub struct SeriesRecorder {
    interval: SimTime,
    next: SimTime,
    last_sample: SimTime,
    last_topic_counts: BTreeMap<String, u64>,
    points: Vec<SeriesPoint>,
}

impl SeriesRecorder {
    /// First sample at `interval`. A zero interval is raised to one microsecond.
    pub fn new(interval: SimTime) -> Self {
        let interval = interval.max(SimTime::from_micros(1));
        SeriesRecorder {
            interval,
            next: interval,
            last_sample: SimTime::ZERO,
            last_topic_counts: BTreeMap::new(),
            points: Vec::new(),
        }
    }

    /// Instant of the next sample.
    pub fn next_due(&self) -> SimTime {
        self.next
    }

    /// Record the state at `at` and move to the next grid instant.
    pub fn sample(&mut self, at: SimTime, snapshot: &MetricsSnapshot) {
        let span_s = (at - self.last_sample).as_secs_f64();
        let topic_rates = snapshot
            .topics
            .iter()
            .map(|(topic, stats)| {
                let before = self.last_topic_counts.get(topic).copied().unwrap_or(0);
                let rate = if span_s > 0.0 {
                    stats.published.saturating_sub(before) as f64 / span_s
                } else {
                    0.0
                };
                (topic.clone(), rate)
            })
            .collect();
        self.points.push(SeriesPoint {
            time_s: at.as_secs_f64(),
            published: snapshot.overall.published,
            delivered: snapshot.overall.delivered,
            delivery_ratio: snapshot.overall.delivery_ratio,
            duplicates: snapshot.overall.duplicates,
            messages_lost: snapshot.messages_lost,
            in_flight: snapshot.in_flight,
            mean_latency_s: snapshot.overall.mean_latency_s,
            total_energy_j: snapshot.total_energy_j,
            broker_queue_depth: snapshot.broker_queue_depth,
            topic_rates,
        });
        self.last_topic_counts = snapshot
            .topics
            .iter()
            .map(|(topic, stats)| (topic.clone(), stats.published))
            .collect();
        self.last_sample = at;
        while self.next <= at {
            self.next = self.next + self.interval;
        }
    }

    /// Samples taken so far.
    pub fn points(&self) -> &[SeriesPoint] {
        &self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::TopicStats;

    fn snapshot(published: u64, topic_count: u64) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::default();
        snap.overall.published = published;
        snap.topics.insert(
            "sensors/t".to_string(),
            TopicStats {
                published: topic_count,
                delivered: 0,
            },
        );
        snap
    }

    #[test]
    fn test_samples_follow_grid_and_rates_use_interval_delta() {
        let mut series = SeriesRecorder::new(SimTime::from_secs(5.0));
        assert_eq!(series.next_due(), SimTime::from_secs(5.0));

        series.sample(SimTime::from_secs(5.0), &snapshot(10, 10));
        assert_eq!(series.next_due(), SimTime::from_secs(10.0));
        series.sample(SimTime::from_secs(10.0), &snapshot(12, 12));

        let points = series.points();
        assert_eq!(points.len(), 2);
        assert!((points[0].topic_rates["sensors/t"] - 2.0).abs() < 1e-9);
        assert!((points[1].topic_rates["sensors/t"] - 0.4).abs() < 1e-9);
        assert_eq!(points[1].published, 12);
        assert_eq!(points[1].time_s, 10.0);
    }
}
