//! Run configuration.
//!
//! Everything a run needs is declared up front and never changes while the run
//! is in progress; the orchestrator shares one [`RunConfiguration`] with every
//! virtual user through an `Arc`.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `SessionConfig` | Per-connection timers, think time, stake | `fast()`, `smoke()` |
//! | `BootstrapConfig` | Game launch endpoint and payload | `default()` |
//! | `Scenario` | Concurrency shape | `per_vu_iterations()`, `long_ramp()` |
//!
//! Files are TOML. Durations are integer milliseconds with a `_ms` suffix:
//!
//! ```
//! use duelsim::config::{RunConfiguration, Scenario};
//! use web_time::Duration;
//!
//! let config = RunConfiguration::from_toml_str(r#"
//!     [bootstrap]
//!     host = "game.example.com"
//!     tls = true
//!
//!     [session]
//!     move_delay_ms = 20
//!
//!     [scenarios.smoke]
//!     executor = "per-vu-iterations"
//!     vus = 2
//!     iterations = 1
//! "#).unwrap();
//!
//! assert_eq!(config.session.move_delay, Duration::from_millis(20));
//! assert!(matches!(config.scenarios["smoke"], Scenario::PerVuIterations { vus: 2, .. }));
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;
use web_time::Duration;

use crate::error::{InvalidConfigKind, SimError, SimResult};
use crate::script::TurnScript;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use web_time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use web_time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

fn check_duration(field: &'static str, value: Duration, min_ms: u64, max_ms: u64) -> SimResult<()> {
    let actual_ms = value.as_millis() as u64;
    if actual_ms < min_ms || actual_ms > max_ms {
        return Err(InvalidConfigKind::DurationOutOfRange {
            field,
            min_ms,
            max_ms,
            actual_ms,
        }
        .into());
    }
    Ok(())
}

fn check_value(field: &'static str, actual: u64, min: u64, max: u64) -> SimResult<()> {
    if actual < min || actual > max {
        return Err(InvalidConfigKind::ValueOutOfRange {
            field,
            min,
            max,
            actual,
        }
        .into());
    }
    Ok(())
}

/// Per-connection knobs for one virtual player.
///
/// # Example
///
/// ```
/// use duelsim::config::SessionConfig;
/// use web_time::Duration;
///
/// let config = SessionConfig {
///     stake: 500,
///     hard_session_timeout: Duration::from_secs(90),
///     ..SessionConfig::fast()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[must_use = "SessionConfig has no effect unless placed in a RunConfiguration"]
pub struct SessionConfig {
    /// Amount sent with the `queue` request.
    ///
    /// Default: 100
    pub stake: u64,

    /// Think time between `connected` and the `queue` request.
    ///
    /// Default: 150ms
    #[serde(rename = "queue_delay_ms", with = "duration_ms")]
    pub queue_delay: Duration,

    /// Think time between `paired` and the `ready_queue` request.
    ///
    /// Default: 150ms
    #[serde(rename = "ready_delay_ms", with = "duration_ms")]
    pub ready_delay: Duration,

    /// Think time before each scripted move.
    ///
    /// Default: 150ms
    #[serde(rename = "move_delay_ms", with = "duration_ms")]
    pub move_delay: Duration,

    /// How long the connection may take to open.
    ///
    /// Default: 3s
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// How long a session may go without a transition (or, in game, without a
    /// turn switch) before it is torn down. `None` leaves only the hard timeout.
    ///
    /// Default: 60s
    #[serde(rename = "state_timeout_ms", with = "option_duration_ms")]
    pub state_timeout: Option<Duration>,

    /// Absolute session lifetime, armed when the connection opens.
    ///
    /// Default: 180s
    #[serde(rename = "hard_session_timeout_ms", with = "duration_ms")]
    pub hard_session_timeout: Duration,

    /// Interval between keepalive pings.
    ///
    /// Default: 1s
    #[serde(rename = "keepalive_interval_ms", with = "duration_ms")]
    pub keepalive_interval: Duration,

    /// Grace period between the last scripted turn switch and closing.
    ///
    /// Default: 60s
    #[serde(rename = "close_after_script_ms", with = "duration_ms")]
    pub close_after_script: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stake: 100,
            queue_delay: Duration::from_millis(150),
            ready_delay: Duration::from_millis(150),
            move_delay: Duration::from_millis(150),
            connect_timeout: Duration::from_secs(3),
            state_timeout: Some(Duration::from_secs(60)),
            hard_session_timeout: Duration::from_secs(180),
            keepalive_interval: Duration::from_secs(1),
            close_after_script: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short think time and a tighter lifetime, for batch runs.
    pub fn fast() -> Self {
        Self {
            queue_delay: Duration::from_millis(20),
            ready_delay: Duration::from_millis(20),
            move_delay: Duration::from_millis(20),
            hard_session_timeout: Duration::from_secs(60),
            close_after_script: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// No think time; meant for local servers and tests.
    pub fn smoke() -> Self {
        Self {
            queue_delay: Duration::ZERO,
            ready_delay: Duration::ZERO,
            move_delay: Duration::ZERO,
            state_timeout: Some(Duration::from_secs(10)),
            hard_session_timeout: Duration::from_secs(30),
            close_after_script: Duration::from_millis(200),
            ..Self::default()
        }
    }

    /// Validates the session configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] if any value is out of range.
    pub fn validate(&self) -> SimResult<()> {
        check_value("stake", self.stake, 1, 1_000_000_000)?;
        check_duration("queue_delay", self.queue_delay, 0, 60_000)?;
        check_duration("ready_delay", self.ready_delay, 0, 60_000)?;
        check_duration("move_delay", self.move_delay, 0, 60_000)?;
        check_duration("connect_timeout", self.connect_timeout, 1, 60_000)?;
        if let Some(state_timeout) = self.state_timeout {
            check_duration("state_timeout", state_timeout, 1, 3_600_000)?;
        }
        check_duration(
            "hard_session_timeout",
            self.hard_session_timeout,
            1,
            86_400_000,
        )?;
        check_duration("keepalive_interval", self.keepalive_interval, 1, 60_000)?;
        check_duration("close_after_script", self.close_after_script, 0, 3_600_000)?;
        Ok(())
    }
}

/// Where and how to launch games.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// `host[:port]` serving both the launch endpoint and the game socket.
    pub host: String,
    /// Use `https`/`wss` instead of `http`/`ws`.
    pub tls: bool,
    /// Accept any server certificate on both the launch call and the socket.
    pub tls_skip_verify: bool,
    pub launch_path: String,
    pub connection_path: String,
    pub bearer_token: String,
    pub currency: String,
    pub operator_name: String,
    pub game_id: String,
    pub language: String,
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            host: "localhost:8080".to_owned(),
            tls: false,
            tls_skip_verify: false,
            launch_path: "/api/gamelaunch".to_owned(),
            connection_path: "/ws/checkers".to_owned(),
            bearer_token: "token".to_owned(),
            currency: "BRL".to_owned(),
            operator_name: "TestOp".to_owned(),
            game_id: "damasSokkerDuel".to_owned(),
            language: "pt".to_owned(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl BootstrapConfig {
    /// Full URL of the launch endpoint.
    #[must_use]
    pub fn launch_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.host, self.launch_path)
    }

    /// Base URL of the game socket, without query.
    #[must_use]
    pub fn connection_base(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, self.host, self.connection_path)
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.host.trim().is_empty() {
            return Err(InvalidConfigKind::Empty { field: "host" }.into());
        }
        if !self.launch_path.starts_with('/') || !self.connection_path.starts_with('/') {
            return Err(InvalidConfigKind::Inconsistent {
                reason: "launch_path and connection_path must start with '/'".to_owned(),
            }
            .into());
        }
        check_duration("request_timeout", self.request_timeout, 1, 300_000)
    }
}

/// One step of a ramp: move linearly to `target` VUs over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    #[must_use]
    pub const fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

fn default_max_duration() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_graceful_ramp_down() -> Duration {
    Duration::from_secs(30)
}

/// Concurrency shape of one named scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum Scenario {
    /// `vus` users each run `iterations` sessions back to back; whatever is
    /// still running at `max_duration` is interrupted.
    PerVuIterations {
        vus: u32,
        iterations: u32,
        #[serde(
            rename = "max_duration_ms",
            with = "duration_ms",
            default = "default_max_duration"
        )]
        max_duration: Duration,
        #[serde(rename = "start_time_ms", with = "duration_ms", default)]
        start_time: Duration,
    },
    /// Users loop sessions while the number of active users follows `stages`.
    RampingVus {
        #[serde(default)]
        start_vus: u32,
        stages: Vec<Stage>,
        #[serde(
            rename = "graceful_ramp_down_ms",
            with = "duration_ms",
            default = "default_graceful_ramp_down"
        )]
        graceful_ramp_down: Duration,
        #[serde(rename = "start_time_ms", with = "duration_ms", default)]
        start_time: Duration,
    },
}

impl Scenario {
    /// Fixed batch: `vus` users, `iterations` sessions each, ten minute cap.
    #[must_use]
    pub fn per_vu_iterations(vus: u32, iterations: u32) -> Self {
        Self::PerVuIterations {
            vus,
            iterations,
            max_duration: default_max_duration(),
            start_time: Duration::ZERO,
        }
    }

    /// The long ramp: 0→400 over 5m, →1000 over 10m, →0 over 1m.
    #[must_use]
    pub fn long_ramp() -> Self {
        Self::RampingVus {
            start_vus: 0,
            stages: vec![
                Stage::new(Duration::from_secs(5 * 60), 400),
                Stage::new(Duration::from_secs(10 * 60), 1000),
                Stage::new(Duration::from_secs(60), 0),
            ],
            graceful_ramp_down: default_graceful_ramp_down(),
            start_time: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn start_time(&self) -> Duration {
        match self {
            Self::PerVuIterations { start_time, .. } | Self::RampingVus { start_time, .. } => {
                *start_time
            },
        }
    }

    /// Largest number of VUs this scenario ever runs at once.
    #[must_use]
    pub fn peak_vus(&self) -> u32 {
        match self {
            Self::PerVuIterations { vus, .. } => *vus,
            Self::RampingVus {
                start_vus, stages, ..
            } => stages
                .iter()
                .map(|s| s.target)
                .fold(*start_vus, u32::max),
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        match self {
            Self::PerVuIterations {
                vus,
                iterations,
                max_duration,
                start_time,
            } => {
                check_value("vus", u64::from(*vus), 1, 100_000)?;
                check_value("iterations", u64::from(*iterations), 1, 1_000_000)?;
                check_duration("max_duration", *max_duration, 1, 86_400_000)?;
                check_duration("start_time", *start_time, 0, 86_400_000)
            },
            Self::RampingVus {
                start_vus,
                stages,
                graceful_ramp_down,
                start_time,
            } => {
                if stages.is_empty() {
                    return Err(InvalidConfigKind::Empty { field: "stages" }.into());
                }
                check_value("start_vus", u64::from(*start_vus), 0, 100_000)?;
                for stage in stages {
                    check_value("target", u64::from(stage.target), 0, 100_000)?;
                    check_duration("duration", stage.duration, 0, 86_400_000)?;
                }
                check_duration("graceful_ramp_down", *graceful_ramp_down, 0, 3_600_000)?;
                check_duration("start_time", *start_time, 0, 86_400_000)
            },
        }
    }
}

/// Everything a run needs. Immutable for the duration of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfiguration {
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub scenarios: BTreeMap<String, Scenario>,
    /// Moves to play; the four-move checkers opening when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<TurnScript>,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        let mut scenarios = BTreeMap::new();
        scenarios.insert("default".to_owned(), Scenario::per_vu_iterations(2, 1));
        Self {
            bootstrap: BootstrapConfig::default(),
            session: SessionConfig::default(),
            scenarios,
            script: None,
        }
    }
}

impl RunConfiguration {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> SimResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| {
            SimError::from(InvalidConfigKind::Parse {
                context: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> SimResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            SimError::from(InvalidConfigKind::Parse {
                context: format!("{}: {}", path.display(), e),
            })
        })?;
        Self::from_toml_str(&source)
    }

    /// The turn script every session of this run follows.
    #[must_use]
    pub fn turn_script(&self) -> TurnScript {
        self.script.clone().unwrap_or_default()
    }

    /// Fixed-batch scenarios whose `max_duration` does not outlast the hard
    /// session timeout, so a slow session is interrupted instead of timing out.
    #[must_use]
    pub fn scenarios_cut_short(&self) -> Vec<&str> {
        self.scenarios
            .iter()
            .filter(|(_, scenario)| {
                matches!(scenario, Scenario::PerVuIterations { max_duration, .. }
                    if *max_duration <= self.session.hard_session_timeout)
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Validates every section. Scenarios that would cut sessions short are
    /// allowed but logged.
    pub fn validate(&self) -> SimResult<()> {
        self.bootstrap.validate()?;
        self.session.validate()?;
        if self.scenarios.is_empty() {
            return Err(InvalidConfigKind::Empty { field: "scenarios" }.into());
        }
        for scenario in self.scenarios.values() {
            scenario.validate()?;
        }
        if self.script.as_ref().is_some_and(TurnScript::is_empty) {
            return Err(InvalidConfigKind::Empty { field: "script" }.into());
        }
        for name in self.scenarios_cut_short() {
            warn!(
                scenario = name,
                hard_session_timeout = ?self.session.hard_session_timeout,
                "max_duration does not exceed the hard session timeout; late sessions will be interrupted"
            );
        }
        Ok(())
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

    #[test]
    fn presets_validate() {
        SessionConfig::default().validate().unwrap();
        SessionConfig::fast().validate().unwrap();
        SessionConfig::smoke().validate().unwrap();
        RunConfiguration::default().validate().unwrap();
        Scenario::long_ramp().validate().unwrap();
    }

    #[test]
    fn out_of_range_duration_is_structured() {
        let config = SessionConfig {
            connect_timeout: Duration::ZERO,
            ..SessionConfig::default()
        };
        match config.validate() {
            Err(SimError::InvalidConfig(InvalidConfigKind::DurationOutOfRange {
                field,
                actual_ms,
                ..
            })) => {
                assert_eq!(field, "connect_timeout");
                assert_eq!(actual_ms, 0);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn zero_stake_is_rejected() {
        let config = SessionConfig {
            stake: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SimError::InvalidConfig(InvalidConfigKind::ValueOutOfRange {
                field: "stake",
                ..
            }))
        ));
    }

    #[test]
    fn urls_follow_tls_flag() {
        let mut bootstrap = BootstrapConfig {
            host: "example.com".into(),
            ..BootstrapConfig::default()
        };
        assert_eq!(bootstrap.launch_url(), "http://example.com/api/gamelaunch");
        assert_eq!(bootstrap.connection_base(), "ws://example.com/ws/checkers");
        bootstrap.tls = true;
        assert_eq!(bootstrap.launch_url(), "https://example.com/api/gamelaunch");
        assert_eq!(bootstrap.connection_base(), "wss://example.com/ws/checkers");
    }

    #[test]
    fn parses_ramp_scenario_and_script() {
        let config = RunConfiguration::from_toml_str(
            r#"
            [session]
            state_timeout_ms = 5000

            [scenarios.ramp]
            executor = "ramping-vus"
            stages = [
                { duration_ms = 1000, target = 4 },
                { duration_ms = 500, target = 0 },
            ]

            [[script]]
            from = "A1"
            to = "B2"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.state_timeout, Some(Duration::from_secs(5)));
        let Scenario::RampingVus {
            stages,
            graceful_ramp_down,
            ..
        } = &config.scenarios["ramp"]
        else {
            panic!("expected ramping-vus");
        };
        assert_eq!(stages.len(), 2);
        assert_eq!(*graceful_ramp_down, Duration::from_secs(30));
        assert_eq!(config.turn_script().len(), 1);
        assert_eq!(config.scenarios["ramp"].peak_vus(), 4);
    }

    #[test]
    fn default_run_outlasts_its_sessions() {
        let config = RunConfiguration::default();
        let Scenario::PerVuIterations { max_duration, .. } = config.scenarios["default"] else {
            panic!("default is a fixed batch");
        };
        assert_eq!(max_duration, Duration::from_secs(600));
        assert!(max_duration > config.session.hard_session_timeout);
        assert!(config.scenarios_cut_short().is_empty());
    }

    #[test]
    fn short_max_duration_is_flagged_but_valid() {
        let mut config = RunConfiguration {
            session: SessionConfig::smoke(),
            ..RunConfiguration::default()
        };
        config.scenarios.insert(
            "tight".to_owned(),
            Scenario::PerVuIterations {
                vus: 1,
                iterations: 1,
                max_duration: Duration::from_secs(30),
                start_time: Duration::ZERO,
            },
        );
        config.scenarios.insert("ramp".to_owned(), Scenario::long_ramp());
        assert_eq!(config.scenarios_cut_short(), vec!["tight"]);
        config.validate().unwrap();
    }

    #[test]
    fn skip_verify_defaults_off_and_parses() {
        assert!(!BootstrapConfig::default().tls_skip_verify);
        let config = RunConfiguration::from_toml_str(
            r#"
            [bootstrap]
            host = "alb.example.com"
            tls = true
            tls_skip_verify = true

            [scenarios.one]
            executor = "per-vu-iterations"
            vus = 1
            iterations = 1
            "#,
        )
        .unwrap();
        assert!(config.bootstrap.tls_skip_verify);
        assert_eq!(config.bootstrap.launch_url(), "https://alb.example.com/api/gamelaunch");
    }

    #[test]
    fn missing_scenarios_is_an_error() {
        let err = RunConfiguration::from_toml_str("[session]\nstake = 5\n").unwrap_err();
        assert_eq!(
            err,
            SimError::InvalidConfig(InvalidConfigKind::Empty { field: "scenarios" })
        );
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = RunConfiguration::from_toml_str("scenarios = 12").unwrap_err();
        assert!(matches!(
            err,
            SimError::InvalidConfig(InvalidConfigKind::Parse { .. })
        ));
    }

    #[test]
    fn default_script_is_the_opening() {
        assert_eq!(
            RunConfiguration::default().turn_script(),
            TurnScript::checkers_opening()
        );
    }

    #[test]
    fn serializes_back_to_toml() {
        let config = RunConfiguration::default();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("queue_delay_ms = 150"));
        assert_eq!(RunConfiguration::from_toml_str(&text).unwrap(), config);
    }
}
