//! Spawns virtual users according to the configured scenarios.
//!
//! Every iteration runs in its own task. A panic, a failed bootstrap or a
//! failed assertion in one session is tallied and the run carries on; the
//! only state users share is the metrics registry and the read-only
//! configuration and script.
//!
//! ```text
//!  scenario ──► user task ──► iteration task ──► run_iteration_until()
//!                  │  (loops)        (one per session)
//!                  └── stop flag / max duration / graceful ramp-down
//! ```
//!
//! Hitting `max_duration` or the ramp-down grace raises the scenario's
//! interrupt: running sessions tear down as interrupted, cleanup frames and
//! milestone checks included. Users still running after a further grace are
//! aborted.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use web_time::{Duration, Instant};

use crate::bootstrap::{Bootstrapper, HttpBootstrapper};
use crate::config::{RunConfiguration, Scenario, Stage};
use crate::error::SimResult;
use crate::metrics::{names, MetricsRegistry, MetricsSnapshot};
use crate::session::driver::{
    interrupt_channel, run_iteration_until, InterruptSignal, Interrupter, SessionContext,
    TEARDOWN_GRACE,
};
use crate::session::report::SessionReport;
use crate::session::state::Termination;
use crate::telemetry::{TracingObserver, ViolationObserver};

/// How often a ramping scenario re-evaluates its target.
const RAMP_TICK: Duration = Duration::from_millis(100);

/// Pause before a looping user retries after its launch call failed.
const BOOTSTRAP_BACKOFF: Duration = Duration::from_secs(1);

/// How long interrupted users get to tear down before they are aborted.
const INTERRUPT_GRACE: Duration = TEARDOWN_GRACE.saturating_add(Duration::from_secs(1));

/// Target number of users over time for a ramping scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampPlan {
    start_vus: u32,
    stages: Vec<Stage>,
}

impl RampPlan {
    #[must_use]
    pub fn new(start_vus: u32, stages: Vec<Stage>) -> Self {
        Self { start_vus, stages }
    }

    /// Sum of all stage durations.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|stage| stage.duration).sum()
    }

    /// Users that should be active `elapsed` into the ramp.
    ///
    /// Each stage moves linearly from the previous target to its own. Past the
    /// last stage the last target holds.
    #[must_use]
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        let mut from = self.start_vus;
        let mut stage_start = Duration::ZERO;
        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let progress =
                    (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let from_f = f64::from(from);
                let target = from_f + (f64::from(stage.target) - from_f) * progress;
                return target.round() as u32;
            }
            from = stage.target;
            stage_start = stage_end;
        }
        from
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_ms")]
    pub elapsed: Duration,
    pub sessions_passed: u64,
    pub sessions_failed: u64,
    pub interrupted: u64,
    pub panics: u64,
    pub metrics: MetricsSnapshot,
}

fn serialize_ms<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

impl RunSummary {
    #[must_use]
    pub fn from_snapshot(elapsed: Duration, metrics: MetricsSnapshot) -> Self {
        Self {
            elapsed,
            sessions_passed: metrics.counter(names::VU_SESSIONS_PASSED),
            sessions_failed: metrics.counter(names::VU_SESSIONS_FAILED),
            interrupted: metrics.counter(names::VU_INTERRUPTED),
            panics: metrics.counter(names::VU_SESSION_PANICS),
            metrics,
        }
    }

    /// A run passes when every check passed and no session failed, panicked
    /// or was interrupted.
    #[must_use]
    pub fn passed(&self) -> bool {
        !self.metrics.any_check_failed()
            && self.sessions_failed == 0
            && self.panics == 0
            && self.interrupted == 0
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run finished in {:.1}s: {} passed, {} failed, {} interrupted, {} panicked",
            self.elapsed.as_secs_f64(),
            self.sessions_passed,
            self.sessions_failed,
            self.interrupted,
            self.panics
        )?;
        writeln!(f)?;
        write!(f, "{}", self.metrics)
    }
}

/// Runs every scenario of a configuration against one server.
#[derive(Debug)]
pub struct Orchestrator {
    ctx: SessionContext,
}

impl Orchestrator {
    /// Validates `config` and prepares an HTTP-bootstrapped run.
    pub fn new(config: RunConfiguration) -> SimResult<Self> {
        let bootstrapper = Arc::new(HttpBootstrapper::new(&config.bootstrap));
        Self::with_bootstrapper(config, bootstrapper)
    }

    /// Like [`new`](Self::new) with a custom launch step.
    pub fn with_bootstrapper(
        config: RunConfiguration,
        bootstrapper: Arc<dyn Bootstrapper>,
    ) -> SimResult<Self> {
        config.validate()?;
        let script = Arc::new(config.turn_script());
        Ok(Self {
            ctx: SessionContext {
                config: Arc::new(config),
                script,
                metrics: Arc::new(MetricsRegistry::new()),
                observer: Arc::new(TracingObserver::new()),
                bootstrapper,
            },
        })
    }

    /// Replaces the default tracing observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.ctx.observer = observer;
        self
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.ctx.metrics)
    }

    #[must_use]
    pub const fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Runs all scenarios concurrently and summarizes the run.
    pub async fn run(&self) -> RunSummary {
        let started = Instant::now();
        let next_vu = Arc::new(AtomicU64::new(1));
        let mut scenarios = JoinSet::new();

        for (name, scenario) in &self.ctx.config.scenarios {
            info!(scenario = %name, peak_vus = scenario.peak_vus(), "starting scenario");
            scenarios.spawn(run_scenario(
                self.ctx.clone(),
                name.clone(),
                scenario.clone(),
                Arc::clone(&next_vu),
            ));
        }
        while let Some(result) = scenarios.join_next().await {
            match result {
                Ok(name) => info!(scenario = %name, "scenario finished"),
                Err(err) => warn!(%err, "scenario task failed"),
            }
        }

        RunSummary::from_snapshot(started.elapsed(), self.ctx.metrics.snapshot())
    }
}

async fn run_scenario(
    ctx: SessionContext,
    name: String,
    scenario: Scenario,
    next_vu: Arc<AtomicU64>,
) -> String {
    tokio::time::sleep(scenario.start_time()).await;
    match scenario {
        Scenario::PerVuIterations {
            vus,
            iterations,
            max_duration,
            ..
        } => run_per_vu_iterations(&ctx, vus, iterations, max_duration, &next_vu).await,
        Scenario::RampingVus {
            start_vus,
            stages,
            graceful_ramp_down,
            ..
        } => {
            let plan = RampPlan::new(start_vus, stages);
            run_ramping(&ctx, &plan, graceful_ramp_down, &next_vu).await;
        },
    }
    name
}

async fn run_per_vu_iterations(
    ctx: &SessionContext,
    vus: u32,
    iterations: u32,
    max_duration: Duration,
    next_vu: &AtomicU64,
) {
    let (interrupter, signal) = interrupt_channel();
    let mut users = JoinSet::new();
    for _ in 0..vus {
        let vu = next_vu.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        users.spawn(run_user(ctx.clone(), vu, Some(iterations), stop, signal.clone()));
    }

    let timed_out = tokio::time::timeout(max_duration, drain_users(ctx, &mut users))
        .await
        .is_err();
    if timed_out {
        warn!(?max_duration, "max duration reached; interrupting remaining users");
        interrupt_all(ctx, &mut users, &interrupter).await;
    }
}

async fn run_ramping(
    ctx: &SessionContext,
    plan: &RampPlan,
    graceful_ramp_down: Duration,
    next_vu: &AtomicU64,
) {
    let started = Instant::now();
    let total = plan.total_duration();
    let (interrupter, signal) = interrupt_channel();
    let mut users = JoinSet::new();
    let mut active: Vec<Arc<AtomicBool>> = Vec::new();
    let mut ticker = tokio::time::interval(RAMP_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let elapsed = started.elapsed();
        if elapsed >= total {
            break;
        }
        let target = plan.target_at(elapsed) as usize;
        while active.len() < target {
            let vu = next_vu.fetch_add(1, Ordering::Relaxed);
            let stop = Arc::new(AtomicBool::new(false));
            users.spawn(run_user(
                ctx.clone(),
                vu,
                None,
                Arc::clone(&stop),
                signal.clone(),
            ));
            active.push(stop);
        }
        // users asked to stop finish their current session first
        while active.len() > target {
            if let Some(stop) = active.pop() {
                stop.store(true, Ordering::Relaxed);
            }
        }
        // reap users that already left
        while let Some(result) = users.try_join_next() {
            note_user_exit(ctx, result);
        }
    }

    for stop in &active {
        stop.store(true, Ordering::Relaxed);
    }
    debug!(users = users.len(), ?graceful_ramp_down, "ramp finished; waiting for users");
    let timed_out = tokio::time::timeout(graceful_ramp_down, drain_users(ctx, &mut users))
        .await
        .is_err();
    if timed_out {
        warn!("graceful ramp-down elapsed; interrupting remaining users");
        interrupt_all(ctx, &mut users, &interrupter).await;
    }
}

/// One virtual user: sessions back to back until told to stop, interrupted
/// or out of iterations.
async fn run_user(
    ctx: SessionContext,
    vu: u64,
    iterations: Option<u32>,
    stop: Arc<AtomicBool>,
    mut interrupt: InterruptSignal,
) {
    // dropping the set aborts the running session when this user is aborted
    let mut current = JoinSet::new();
    let mut iteration: u64 = 0;

    loop {
        if stop.load(Ordering::Relaxed) || interrupt.is_raised() {
            break;
        }
        if iterations.is_some_and(|limit| iteration >= u64::from(limit)) {
            break;
        }
        let session_ctx = ctx.clone();
        let session_interrupt = interrupt.clone();
        current.spawn(async move {
            run_iteration_until(&session_ctx, vu, iteration, session_interrupt).await
        });

        let backoff = match current.join_next().await {
            Some(Ok(report)) => {
                tally(&ctx.metrics, &report);
                matches!(report.termination, Termination::BootstrapFailed { .. })
            },
            Some(Err(err)) if err.is_panic() => {
                warn!(vu, iteration, "session panicked");
                ctx.metrics.increment(names::VU_SESSION_PANICS);
                ctx.metrics.increment(names::VU_SESSIONS_FAILED);
                false
            },
            Some(Err(_)) | None => break,
        };
        iteration += 1;

        if backoff && iterations.is_none() {
            tokio::select! {
                () = tokio::time::sleep(BOOTSTRAP_BACKOFF) => (),
                () = interrupt.raised() => break,
            }
        }
    }
}

fn tally(metrics: &MetricsRegistry, report: &SessionReport) {
    if report.termination == Termination::Interrupted {
        debug!(%report, "session interrupted");
        metrics.increment(names::VU_INTERRUPTED);
    } else if report.passed() {
        metrics.increment(names::VU_SESSIONS_PASSED);
    } else {
        debug!(%report, "session failed");
        metrics.increment(names::VU_SESSIONS_FAILED);
    }
}

fn note_user_exit(ctx: &SessionContext, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => (),
        Err(err) if err.is_cancelled() => ctx.metrics.increment(names::VU_INTERRUPTED),
        Err(err) => warn!(%err, "user task failed"),
    }
}

async fn drain_users(ctx: &SessionContext, users: &mut JoinSet<()>) {
    while let Some(result) = users.join_next().await {
        note_user_exit(ctx, result);
    }
}

/// Raises the interrupt, then aborts whoever has not torn down in time.
async fn interrupt_all(ctx: &SessionContext, users: &mut JoinSet<()>, interrupter: &Interrupter) {
    interrupter.raise();
    let timed_out = tokio::time::timeout(INTERRUPT_GRACE, drain_users(ctx, users))
        .await
        .is_err();
    if timed_out {
        warn!(users = users.len(), "users still running after the interrupt; aborting");
        users.abort_all();
        drain_users(ctx, users).await;
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn ramp_interpolates_linearly() {
        let plan = RampPlan::new(0, vec![Stage::new(secs(10), 100)]);
        assert_eq!(plan.target_at(Duration::ZERO), 0);
        assert_eq!(plan.target_at(secs(5)), 50);
        assert_eq!(plan.target_at(secs(10)), 100);
        assert_eq!(plan.target_at(secs(60)), 100);
    }

    #[test]
    fn long_ramp_shape() {
        let Scenario::RampingVus { start_vus, stages, .. } = Scenario::long_ramp() else {
            panic!("long ramp is a ramping scenario");
        };
        let plan = RampPlan::new(start_vus, stages);
        assert_eq!(plan.total_duration(), secs(16 * 60));
        assert_eq!(plan.target_at(secs(5 * 60)), 400);
        assert_eq!(plan.target_at(secs(10 * 60)), 700);
        assert_eq!(plan.target_at(secs(15 * 60)), 1000);
        assert_eq!(plan.target_at(secs(15 * 60 + 30)), 500);
        assert_eq!(plan.target_at(secs(16 * 60)), 0);
    }

    #[test]
    fn zero_length_stage_jumps() {
        let plan = RampPlan::new(
            5,
            vec![Stage::new(Duration::ZERO, 20), Stage::new(secs(2), 20)],
        );
        assert_eq!(plan.target_at(Duration::ZERO), 20);
        assert_eq!(plan.target_at(secs(1)), 20);
    }

    #[test]
    fn summary_passes_only_without_failures() {
        let metrics = MetricsRegistry::new();
        metrics.increment(names::VU_SESSIONS_PASSED);
        metrics.check(names::CHECK_PAIRED, true);
        let summary = RunSummary::from_snapshot(secs(1), metrics.snapshot());
        assert!(summary.passed());
        assert_eq!(summary.sessions_passed, 1);

        metrics.check(names::CHECK_GAME_START, false);
        let summary = RunSummary::from_snapshot(secs(1), metrics.snapshot());
        assert!(!summary.passed());
        let json = summary.to_json_pretty().unwrap();
        assert!(json.contains("\"elapsed_ms\": 1000"));
    }

    #[test]
    fn interrupted_sessions_fail_the_run() {
        let metrics = MetricsRegistry::new();
        metrics.increment(names::VU_SESSIONS_PASSED);
        metrics.increment(names::VU_INTERRUPTED);
        let summary = RunSummary::from_snapshot(secs(1), metrics.snapshot());
        assert!(!metrics.snapshot().any_check_failed());
        assert!(!summary.passed());
    }

    #[test]
    fn tally_splits_passed_and_failed() {
        let metrics = MetricsRegistry::new();
        tally(&metrics, &SessionReport::bootstrap_failed(1, 0, "status 500"));
        assert_eq!(metrics.counter(names::VU_SESSIONS_FAILED), 1);
        assert_eq!(metrics.counter(names::VU_SESSIONS_PASSED), 0);

        tally(
            &metrics,
            &SessionReport::unstarted(2, 0, Termination::Interrupted),
        );
        assert_eq!(metrics.counter(names::VU_INTERRUPTED), 1);
        assert_eq!(metrics.counter(names::VU_SESSIONS_FAILED), 1);
    }
}
