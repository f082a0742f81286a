//! Shared helpers for integration tests.
//!
//! Builds run configurations pointing at a [`MockGameServer`] and provides
//! bootstrappers that never touch HTTP.
//!
//! [`MockGameServer`]: super::mock_server::MockGameServer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duelsim::bootstrap::{Bootstrapper, LaunchRequest, LaunchResponse};
use duelsim::metrics::MetricsRegistry;
use duelsim::telemetry::CollectingObserver;
use duelsim::{
    BootstrapConfig, BootstrapFailure, RunConfiguration, Scenario, SessionConfig, SessionContext,
    TurnScript,
};

/// Upper bound for any single integration test run.
#[allow(dead_code)]
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Grants every launch with a fresh session id on the mock server.
#[derive(Debug, Default)]
pub struct StaticBootstrapper {
    launches: AtomicU64,
}

impl Bootstrapper for StaticBootstrapper {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchResponse, BootstrapFailure> {
        assert!(!request.token.is_empty());
        let sid = self.launches.fetch_add(1, Ordering::Relaxed);
        Ok(LaunchResponse {
            url: format!("/play/index.html?sid={sid}&lang={}", request.language),
        })
    }
}

/// Rejects every launch with the given status.
#[derive(Debug)]
pub struct RejectingBootstrapper(pub u16);

impl Bootstrapper for RejectingBootstrapper {
    fn launch(&self, _request: &LaunchRequest) -> Result<LaunchResponse, BootstrapFailure> {
        Err(BootstrapFailure::Status { code: self.0 })
    }
}

/// Panics inside the launch call.
#[allow(dead_code)]
#[derive(Debug)]
pub struct PanickingBootstrapper;

impl Bootstrapper for PanickingBootstrapper {
    fn launch(&self, _request: &LaunchRequest) -> Result<LaunchResponse, BootstrapFailure> {
        panic!("launch exploded");
    }
}

/// Run configuration against `host` with no think time.
pub fn run_config(host: &str, session: SessionConfig, scenario: Scenario) -> RunConfiguration {
    let mut config = RunConfiguration {
        bootstrap: BootstrapConfig {
            host: host.to_owned(),
            tls: false,
            ..BootstrapConfig::default()
        },
        session,
        ..RunConfiguration::default()
    };
    config.scenarios.clear();
    config.scenarios.insert("test".to_owned(), scenario);
    config
}

/// A session context with a collecting observer, for driving single iterations.
pub fn session_context(
    config: RunConfiguration,
    bootstrapper: Arc<dyn Bootstrapper>,
) -> (SessionContext, Arc<CollectingObserver>) {
    let observer = Arc::new(CollectingObserver::new());
    let ctx = SessionContext {
        script: Arc::new(config.turn_script()),
        config: Arc::new(config),
        metrics: Arc::new(MetricsRegistry::new()),
        observer: observer.clone(),
        bootstrapper,
    };
    (ctx, observer)
}

/// Smoke timings with a short state timeout, for sessions expected to stall.
#[allow(dead_code)]
pub fn stalling_session(state_timeout: Duration) -> SessionConfig {
    SessionConfig {
        state_timeout: Some(state_timeout),
        ..SessionConfig::smoke()
    }
}

#[allow(dead_code)]
pub fn default_script() -> TurnScript {
    TurnScript::checkers_opening()
}

/// Polls `condition` until it holds or a few seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// An address nothing listens on.
pub async fn unused_host() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
