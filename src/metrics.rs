//! Run-wide metrics registry.
//!
//! Every virtual user appends to one shared [`MetricsRegistry`]. Three kinds of
//! collectors exist:
//!
//! - **trends**: latency samples between protocol milestones,
//! - **counters**: monotonically increasing event counts,
//! - **checks**: named pass/fail assertions.
//!
//! Samples are never mutated once recorded. Recording never fails: once a trend
//! reaches the configured capacity further samples are dropped and only
//! [`MetricsSnapshot::dropped_samples`] grows, so metrics can never affect
//! protocol behavior. [`MetricsRegistry::snapshot`] aggregates everything into
//! distributions for the end-of-run report.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use web_time::Duration;

/// Metric and check names.
pub mod names {
    pub const HTTP_GAMELAUNCH_RESPONSE_TIME: &str = "http_gamelaunch_response_time";
    pub const WS_OPENED_TIME: &str = "ws_opened_time";
    pub const WS_CONNECTED_MESSAGE_TIME: &str = "ws_connected_message_time";
    pub const WS_QUEUE_CONFIRMATION_TIME: &str = "ws_queue_confirmation_response_message_time";
    pub const WS_PAIRED_TIME: &str = "ws_paired_response_message_time";
    pub const WS_MOVEMENT_TIME: &str = "ws_movement_response_message_time";

    pub const VU_ITERATIONS: &str = "vu_iterations";
    pub const VU_GAMELAUNCH: &str = "vu_gamelaunch";
    pub const VU_GAMELAUNCH_OK: &str = "vu_gamelaunch_ok";
    pub const VU_WS_CONN: &str = "vu_ws_conn";
    pub const VU_WS_CONN_OK: &str = "vu_ws_conn_ok";
    pub const VU_WS_ERRORS: &str = "vu_ws_errors";
    pub const WS_MALFORMED_ENVELOPES: &str = "ws_malformed_envelopes";
    pub const WS_QUEUE_RETRIES: &str = "ws_queue_retries";
    pub const WS_SERVER_NOTICES: &str = "ws_server_notices";
    pub const VU_SESSIONS_PASSED: &str = "vu_sessions_passed";
    pub const VU_SESSIONS_FAILED: &str = "vu_sessions_failed";
    pub const VU_SESSION_PANICS: &str = "vu_session_panics";
    pub const VU_INTERRUPTED: &str = "vu_interrupted";
    pub const VU_SESSION_TERMINATIONS: &str = "vu_session_terminations";

    pub const CHECK_STATUS_200: &str = "status is 200";
    pub const CHECK_WS_OPENED: &str = "WebSocket opened";
    pub const CHECK_CONNECTED: &str = "Connected message received";
    pub const CHECK_QUEUE_CONFIRMATION: &str = "Queue confirmation message received";
    pub const CHECK_PAIRED: &str = "Paired message received";
    pub const CHECK_GAME_START: &str = "Game start message received";
    pub const CHECK_BALANCE_UPDATE: &str = "Balance Update message received";
    pub const CHECK_OPPONENT_READY: &str = "Opponent ready message received";
    pub const CHECK_TURN_SWITCH: &str = "Turn switch message received";
}

/// Default number of samples kept per trend.
pub const DEFAULT_SAMPLE_CAPACITY: usize = 1_000_000;

/// Tag set attached to a sample or counter increment.
pub type Tags = BTreeMap<String, String>;

/// One latency sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    pub name: String,
    pub value: Duration,
    pub tags: Tags,
}

#[derive(Debug, Default)]
struct RegistryInner {
    trends: BTreeMap<String, Vec<MetricSample>>,
    counters: BTreeMap<String, BTreeMap<Tags, u64>>,
    checks: BTreeMap<String, CheckSummary>,
    dropped: u64,
}

/// Thread-safe, append-only metrics store shared by every virtual user.
#[derive(Debug)]
pub struct MetricsRegistry {
    inner: Mutex<RegistryInner>,
    sample_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn to_tags(tags: &[(&str, &str)]) -> Tags {
    tags.iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SAMPLE_CAPACITY)
    }

    /// Creates a registry keeping at most `sample_capacity` samples per trend.
    #[must_use]
    pub fn with_capacity(sample_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            sample_capacity,
        }
    }

    /// Appends a latency sample to the trend `name`.
    pub fn record(&self, name: &str, value: Duration, tags: &[(&str, &str)]) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let samples = inner.trends.entry(name.to_owned()).or_default();
        if samples.len() >= self.sample_capacity {
            inner.dropped += 1;
            return;
        }
        samples.push(MetricSample {
            name: name.to_owned(),
            value,
            tags: to_tags(tags),
        });
    }

    /// Adds `delta` to the counter `name` under the given tag set.
    pub fn add(&self, name: &str, delta: u64, tags: &[(&str, &str)]) {
        let mut inner = self.inner.lock();
        let slot = inner
            .counters
            .entry(name.to_owned())
            .or_default()
            .entry(to_tags(tags))
            .or_default();
        *slot = slot.saturating_add(delta);
    }

    /// Adds one to the untagged counter `name`.
    pub fn increment(&self, name: &str) {
        self.add(name, 1, &[]);
    }

    /// Records the outcome of the check `name`. Returns `passed` for chaining.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        let mut inner = self.inner.lock();
        let tally = inner.checks.entry(name.to_owned()).or_default();
        if passed {
            tally.passes += 1;
        } else {
            tally.fails += 1;
        }
        passed
    }

    /// Returns a copy of every sample recorded for `name`.
    #[must_use]
    pub fn samples(&self, name: &str) -> Vec<MetricSample> {
        self.inner.lock().trends.get(name).cloned().unwrap_or_default()
    }

    /// Current total of the counter `name` across all tag sets.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .counters
            .get(name)
            .map_or(0, |by_tags| by_tags.values().sum())
    }

    /// Aggregates everything recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();

        let trends = inner
            .trends
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(name, samples)| {
                let overall = Distribution::from_durations(samples.iter().map(|s| s.value));
                let mut grouped: BTreeMap<String, Vec<Duration>> = BTreeMap::new();
                for sample in samples.iter().filter(|s| !s.tags.is_empty()) {
                    grouped
                        .entry(tag_label(&sample.tags))
                        .or_default()
                        .push(sample.value);
                }
                let by_tags = grouped
                    .into_iter()
                    .map(|(label, values)| (label, Distribution::from_durations(values)))
                    .collect();
                (name.clone(), TrendSummary { overall, by_tags })
            })
            .collect();

        let counters = inner
            .counters
            .iter()
            .map(|(name, by_tags)| {
                let total = by_tags.values().sum();
                let by_tags = by_tags
                    .iter()
                    .filter(|(tags, _)| !tags.is_empty())
                    .map(|(tags, count)| (tag_label(tags), *count))
                    .collect();
                (name.clone(), CounterSummary { total, by_tags })
            })
            .collect();

        MetricsSnapshot {
            trends,
            counters,
            checks: inner.checks.clone(),
            dropped_samples: inner.dropped,
        }
    }
}

fn tag_label(tags: &Tags) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Summary statistics of one set of durations, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Distribution {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub med_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
}

impl Distribution {
    fn from_durations(values: impl IntoIterator<Item = Duration>) -> Self {
        let mut millis: Vec<f64> = values
            .into_iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        millis.sort_by(f64::total_cmp);
        let count = millis.len();
        let sum: f64 = millis.iter().sum();
        Self {
            count,
            min_ms: millis.first().copied().unwrap_or_default(),
            max_ms: millis.last().copied().unwrap_or_default(),
            avg_ms: if count == 0 { 0.0 } else { sum / count as f64 },
            med_ms: percentile(&millis, 0.5),
            p90_ms: percentile(&millis, 0.9),
            p95_ms: percentile(&millis, 0.95),
        }
    }
}

/// Linear-interpolated percentile of sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let rank = p.clamp(0.0, 1.0) * (len - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSummary {
    pub overall: Distribution,
    /// Distributions per tag set, keyed by `k:v[,k:v]` labels.
    pub by_tags: BTreeMap<String, Distribution>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterSummary {
    pub total: u64,
    pub by_tags: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    pub passes: u64,
    pub fails: u64,
}

impl CheckSummary {
    /// Fraction of passing evaluations, or 1.0 when the check never ran.
    #[must_use]
    pub fn rate(&self) -> f64 {
        let total = self.passes + self.fails;
        if total == 0 {
            1.0
        } else {
            self.passes as f64 / total as f64
        }
    }
}

/// Point-in-time aggregation of a [`MetricsRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[must_use = "MetricsSnapshot should be inspected or exported after being taken"]
pub struct MetricsSnapshot {
    pub trends: BTreeMap<String, TrendSummary>,
    pub counters: BTreeMap<String, CounterSummary>,
    pub checks: BTreeMap<String, CheckSummary>,
    pub dropped_samples: u64,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map_or(0, |c| c.total)
    }

    #[must_use]
    pub fn trend(&self, name: &str) -> Option<&Distribution> {
        self.trends.get(name).map(|t| &t.overall)
    }

    #[must_use]
    pub fn check(&self, name: &str) -> CheckSummary {
        self.checks.get(name).copied().unwrap_or_default()
    }

    /// True when any check recorded at least one failure.
    #[must_use]
    pub fn any_check_failed(&self) -> bool {
        self.checks.values().any(|c| c.fails > 0)
    }

    /// Pretty JSON export of the whole snapshot.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, check) in &self.checks {
            let mark = if check.fails == 0 { '✓' } else { '✗' };
            writeln!(
                f,
                "  {} {:<40} {:>6.2}% ({} passed, {} failed)",
                mark,
                name,
                check.rate() * 100.0,
                check.passes,
                check.fails
            )?;
        }
        if !self.checks.is_empty() {
            writeln!(f)?;
        }
        for (name, trend) in &self.trends {
            let d = &trend.overall;
            writeln!(
                f,
                "  {:<45} avg={:.2}ms min={:.2}ms med={:.2}ms max={:.2}ms p(90)={:.2}ms p(95)={:.2}ms count={}",
                name, d.avg_ms, d.min_ms, d.med_ms, d.max_ms, d.p90_ms, d.p95_ms, d.count
            )?;
            for (label, d) in &trend.by_tags {
                writeln!(
                    f,
                    "    {{{}}} avg={:.2}ms med={:.2}ms p(95)={:.2}ms count={}",
                    label, d.avg_ms, d.med_ms, d.p95_ms, d.count
                )?;
            }
        }
        for (name, counter) in &self.counters {
            writeln!(f, "  {:<45} {}", name, counter.total)?;
            for (label, count) in &counter.by_tags {
                writeln!(f, "    {{{}}} {}", label, count)?;
            }
        }
        if self.dropped_samples > 0 {
            writeln!(f, "  dropped samples: {}", self.dropped_samples)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp
)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn distribution_statistics() {
        let registry = MetricsRegistry::new();
        for value in [10, 20, 30, 40, 50] {
            registry.record(names::WS_OPENED_TIME, ms(value), &[]);
        }
        let snapshot = registry.snapshot();
        let d = snapshot.trend(names::WS_OPENED_TIME).unwrap();
        assert_eq!(d.count, 5);
        assert_eq!(d.min_ms, 10.0);
        assert_eq!(d.max_ms, 50.0);
        assert_eq!(d.avg_ms, 30.0);
        assert_eq!(d.med_ms, 30.0);
        assert!((d.p90_ms - 46.0).abs() < 1e-9);
        assert!((d.p95_ms - 48.0).abs() < 1e-9);
    }

    #[test]
    fn tagged_samples_are_grouped() {
        let registry = MetricsRegistry::new();
        registry.record(names::WS_MOVEMENT_TIME, ms(5), &[("turn", "0")]);
        registry.record(names::WS_MOVEMENT_TIME, ms(7), &[("turn", "1")]);
        registry.record(names::WS_MOVEMENT_TIME, ms(9), &[("turn", "1")]);
        let snapshot = registry.snapshot();
        let trend = &snapshot.trends[names::WS_MOVEMENT_TIME];
        assert_eq!(trend.overall.count, 3);
        assert_eq!(trend.by_tags["turn:0"].count, 1);
        assert_eq!(trend.by_tags["turn:1"].avg_ms, 8.0);
    }

    #[test]
    fn counters_sum_across_tags() {
        let registry = MetricsRegistry::new();
        registry.increment(names::VU_ITERATIONS);
        registry.add(names::WS_SERVER_NOTICES, 2, &[("kind", "error")]);
        registry.add(names::WS_SERVER_NOTICES, 1, &[("kind", "info")]);
        assert_eq!(registry.counter(names::WS_SERVER_NOTICES), 3);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counter(names::VU_ITERATIONS), 1);
        assert_eq!(
            snapshot.counters[names::WS_SERVER_NOTICES].by_tags["kind:error"],
            2
        );
        assert_eq!(snapshot.counter("never_touched"), 0);
    }

    #[test]
    fn checks_track_passes_and_fails() {
        let registry = MetricsRegistry::new();
        assert!(registry.check(names::CHECK_PAIRED, true));
        assert!(!registry.check(names::CHECK_PAIRED, false));
        let snapshot = registry.snapshot();
        let check = snapshot.check(names::CHECK_PAIRED);
        assert_eq!((check.passes, check.fails), (1, 1));
        assert_eq!(check.rate(), 0.5);
        assert!(snapshot.any_check_failed());
        assert_eq!(snapshot.check("unknown").rate(), 1.0);
    }

    #[test]
    fn overflow_is_dropped_silently() {
        let registry = MetricsRegistry::with_capacity(2);
        for value in 0..5 {
            registry.record(names::WS_PAIRED_TIME, ms(value), &[]);
        }
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.trend(names::WS_PAIRED_TIME).unwrap().count, 2);
        assert_eq!(snapshot.dropped_samples, 3);
    }

    #[test]
    fn concurrent_appends_are_not_lost() {
        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        registry.record(names::WS_CONNECTED_MESSAGE_TIME, ms(i), &[]);
                        registry.increment(names::VU_WS_CONN);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.samples(names::WS_CONNECTED_MESSAGE_TIME).len(), 2000);
        assert_eq!(registry.counter(names::VU_WS_CONN), 2000);
    }

    #[test]
    fn snapshot_serializes_and_displays() {
        let registry = MetricsRegistry::new();
        registry.record(names::WS_OPENED_TIME, ms(3), &[]);
        registry.check(names::CHECK_WS_OPENED, true);
        let snapshot = registry.snapshot();
        let json = snapshot.to_json_pretty().unwrap();
        assert!(json.contains("ws_opened_time"));
        assert!(json.contains("dropped_samples"));
        let text = snapshot.to_string();
        assert!(text.contains("WebSocket opened"));
        assert!(text.contains("ws_opened_time"));
    }
}
