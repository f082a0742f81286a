//! Game launch: trading a launch request for a connection endpoint.
//!
//! Each iteration calls its [`Bootstrapper`] exactly once before the session
//! opens a socket. Failures are reported, never retried.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::BootstrapConfig;
use crate::error::BootstrapFailure;
use crate::rng::launch_token;
use crate::tls::unverified_client_config;

/// Body of the launch call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchRequest {
    pub currency: String,
    pub operator_name: String,
    #[serde(rename = "gameid")]
    pub game_id: String,
    pub language: String,
    /// Fresh per call.
    pub token: String,
}

impl LaunchRequest {
    /// Builds a request from the configured launch parameters with a new token.
    #[must_use]
    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self {
            currency: config.currency.clone(),
            operator_name: config.operator_name.clone(),
            game_id: config.game_id.clone(),
            language: config.language.clone(),
            token: launch_token(),
        }
    }
}

/// Successful launch answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LaunchResponse {
    pub url: String,
}

#[derive(Deserialize)]
struct RawLaunchResponse {
    #[serde(default)]
    url: Option<String>,
}

/// Anything that can turn a launch request into a launch URL.
///
/// Implementations are blocking; the driver runs them on the blocking pool.
pub trait Bootstrapper: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchResponse, BootstrapFailure>;
}

/// Parses a launch response body.
pub fn parse_launch_body(body: &str) -> Result<LaunchResponse, BootstrapFailure> {
    let raw: RawLaunchResponse =
        serde_json::from_str(body).map_err(|err| BootstrapFailure::UnparseableBody {
            context: err.to_string(),
        })?;
    match raw.url {
        Some(url) if !url.trim().is_empty() => Ok(LaunchResponse { url }),
        _ => Err(BootstrapFailure::MissingUrl),
    }
}

/// Launches games over HTTP with a bearer credential.
#[derive(Debug, Clone)]
pub struct HttpBootstrapper {
    agent: ureq::Agent,
    launch_url: String,
    bearer_token: String,
}

impl HttpBootstrapper {
    #[must_use]
    pub fn new(config: &BootstrapConfig) -> Self {
        let mut builder = ureq::AgentBuilder::new().timeout(config.request_timeout);
        if config.tls_skip_verify {
            debug!(host = %config.host, "skipping certificate verification");
            builder = builder.tls_config(unverified_client_config());
        }
        let agent = builder.build();
        Self {
            agent,
            launch_url: config.launch_url(),
            bearer_token: config.bearer_token.clone(),
        }
    }
}

impl Bootstrapper for HttpBootstrapper {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchResponse, BootstrapFailure> {
        let response = self
            .agent
            .post(&self.launch_url)
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {}", self.bearer_token))
            .send_json(request);

        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                warn!(url = %self.launch_url, code, "launch rejected");
                return Err(BootstrapFailure::Status { code });
            },
            Err(ureq::Error::Transport(transport)) => {
                return Err(BootstrapFailure::Transport {
                    context: transport.to_string(),
                });
            },
        };

        // ureq accepts any 2xx; the launch contract is exactly 200
        let code = response.status();
        if code != 200 {
            return Err(BootstrapFailure::Status { code });
        }
        let body = response
            .into_string()
            .map_err(|err| BootstrapFailure::UnparseableBody {
                context: err.to_string(),
            })?;
        debug!(url = %self.launch_url, bytes = body.len(), "launch accepted");
        parse_launch_body(&body)
    }
}

/// Builds the game socket URL from a launch URL.
///
/// The launch URL may be absolute or relative to the launch endpoint. Only
/// its query string is kept; it is appended to the configured connection
/// base, so scheme, host and path always come from configuration.
pub fn derive_connection_url(
    launch_url: &str,
    config: &BootstrapConfig,
) -> Result<String, BootstrapFailure> {
    let invalid = |context: String| BootstrapFailure::InvalidUrl { context };

    let parsed = match Url::parse(launch_url) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse(&config.launch_url()).map_err(|err| invalid(err.to_string()))?;
            base.join(launch_url).map_err(|err| invalid(err.to_string()))?
        },
        Err(err) => return Err(invalid(err.to_string())),
    };

    match parsed.query() {
        Some(query) if !query.is_empty() => {
            Ok(format!("{}?{}", config.connection_base(), query))
        },
        _ => Err(invalid(format!("no session query in {}", launch_url))),
    }
}
