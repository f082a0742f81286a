//! # duelsim
//!
//! Drives many simulated players through the full lifecycle of a turn-based,
//! two-player game protocol over websockets: matchmaking queue, pairing,
//! ready check, game start, alternating scripted moves and teardown. Every
//! leg of the flow is timed into a shared [`MetricsRegistry`], and every
//! session ends with pass/fail checks on the milestones it observed.
//!
//! The protocol logic lives in [`PlayerSession`], a sans-IO state machine
//! that is fed frames and instants and hands back envelopes to send. The
//! [`session::driver`] pumps it over a real socket, and the [`Orchestrator`]
//! runs one driver task per virtual user according to the configured
//! [`Scenario`]s.
//!
//! ```no_run
//! use duelsim::{Orchestrator, RunConfiguration};
//!
//! # async fn run() -> duelsim::SimResult<()> {
//! let config = RunConfiguration::from_toml_file("demos/smoke.toml")?;
//! let summary = Orchestrator::new(config)?.run().await;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use bootstrap::{Bootstrapper, HttpBootstrapper, LaunchRequest, LaunchResponse};
pub use config::{BootstrapConfig, RunConfiguration, Scenario, SessionConfig, Stage};
pub use error::{BootstrapFailure, InvalidConfigKind, SimError, SimResult};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use orchestrator::{Orchestrator, RampPlan, RunSummary};
pub use protocol::{Command, Envelope, Outbound};
pub use script::{ScriptedMove, TurnScript};
pub use session::{
    InterruptSignal, Interrupter, Milestone, MilestoneFlags, PlayerSession, PlayerState,
    SessionContext, SessionReport, Termination,
};

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod protocol;
/// PCG32 generator behind the per-launch tokens.
pub mod rng;
pub mod script;
pub mod session;
pub mod telemetry;
pub mod tls;
