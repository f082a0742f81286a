#![allow(dead_code)]

//! Common test infrastructure shared across integration tests.
//!
//! - `mock_server`: in-process websocket game server
//! - `test_utils`: configurations, bootstrappers and timeouts
//!
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::{MockGameServer, ServerBehavior, StaticBootstrapper};
//! ```

pub mod mock_server;
pub mod test_utils;

#[allow(unused_imports)]
pub use mock_server::{MockGameServer, Received, ServerBehavior};
#[allow(unused_imports)]
pub use test_utils::{
    run_config, session_context, stalling_session, PanickingBootstrapper, RejectingBootstrapper,
    unused_host, wait_for, StaticBootstrapper, TEST_TIMEOUT,
};
