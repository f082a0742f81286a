//! Command-line front end for duelsim.
//!
//! ```bash
//! # Two players, one game each, against a local server
//! duelsim --config demos/smoke.toml
//!
//! # Same file, different host, 20 players
//! duelsim --config demos/smoke.toml --host staging.example.com --tls --insecure-skip-tls-verify --vus 20
//!
//! # Keep the machine-readable summary
//! duelsim --config demos/long_ramp.toml --summary-export summary.json
//! ```
//!
//! Exits with status 0 when every check passed, 99 when any check failed or a
//! session failed or was interrupted, and 2 when the run could not start.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use duelsim::{Orchestrator, RunConfiguration, RunSummary, Scenario, SessionConfig, SimError};
use tracing::{error, info};

/// Status for a run that finished with failed checks.
const CHECKS_FAILED: u8 = 99;
/// Status for a run that never started.
const SETUP_FAILED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Preset {
    /// 150 ms think time, long timeouts
    Default,
    /// 20 ms think time
    Fast,
    /// No think time
    Smoke,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated players for turn-based game servers", long_about = None)]
struct Args {
    /// Run configuration (TOML). Built-in defaults when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the server `host[:port]`
    #[arg(long)]
    host: Option<String>,

    /// Use https/wss
    #[arg(long, overrides_with = "no_tls")]
    tls: bool,

    /// Use http/ws
    #[arg(long, overrides_with = "tls")]
    no_tls: bool,

    /// Accept any server certificate (self-signed or mismatched)
    #[arg(long)]
    insecure_skip_tls_verify: bool,

    /// Replace all scenarios with a fixed batch of this many users
    #[arg(long)]
    vus: Option<u32>,

    /// Sessions per user for the fixed batch (with --vus, default 1)
    #[arg(long)]
    iterations: Option<u32>,

    /// Replace the session timing knobs with a preset
    #[arg(long, value_enum)]
    preset: Option<Preset>,

    /// Write the run summary as JSON to this file
    #[arg(long)]
    summary_export: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<RunConfiguration, SimError> {
    let mut config = match &args.config {
        Some(path) => RunConfiguration::from_toml_file(path)?,
        None => RunConfiguration::default(),
    };

    if let Some(host) = &args.host {
        config.bootstrap.host.clone_from(host);
    }
    if args.tls {
        config.bootstrap.tls = true;
    } else if args.no_tls {
        config.bootstrap.tls = false;
    }
    if args.insecure_skip_tls_verify {
        config.bootstrap.tls_skip_verify = true;
    }
    if let Some(preset) = args.preset {
        let stake = config.session.stake;
        config.session = match preset {
            Preset::Default => SessionConfig::default(),
            Preset::Fast => SessionConfig::fast(),
            Preset::Smoke => SessionConfig::smoke(),
        };
        config.session.stake = stake;
    }
    if args.vus.is_some() || args.iterations.is_some() {
        let vus = args.vus.unwrap_or(1);
        let iterations = args.iterations.unwrap_or(1);
        config.scenarios.clear();
        config
            .scenarios
            .insert("cli".to_owned(), Scenario::per_vu_iterations(vus, iterations));
    }

    config.validate()?;
    Ok(config)
}

fn export_summary(path: &PathBuf, summary: &RunSummary) -> std::io::Result<()> {
    let json = summary.to_json_pretty().map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("duelsim: {err}");
            return ExitCode::from(SETUP_FAILED);
        },
    };
    info!(
        host = %config.bootstrap.host,
        scenarios = config.scenarios.len(),
        "starting run"
    );

    let orchestrator = match Orchestrator::new(config) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            eprintln!("duelsim: {err}");
            return ExitCode::from(SETUP_FAILED);
        },
    };
    let summary = orchestrator.run().await;
    println!("{summary}");

    if let Some(path) = &args.summary_export {
        if let Err(err) = export_summary(path, &summary) {
            error!(path = %path.display(), %err, "could not write summary");
        }
    }

    if summary.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(CHECKS_FAILED)
    }
}
