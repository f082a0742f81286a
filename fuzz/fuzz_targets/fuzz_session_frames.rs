//! Fuzz target for a session fed arbitrary frames and clock jumps.
//!
//! # Properties Tested
//! - No panics under any inbound sequence
//! - State and turn index never move backwards
//! - Nothing is sent after the session terminated and was drained

#![no_main]

use std::sync::Arc;
use std::time::Duration;

use arbitrary::Arbitrary;
use duelsim::metrics::MetricsRegistry;
use duelsim::telemetry::CollectingObserver;
use duelsim::{PlayerSession, SessionConfig, TurnScript};
use libfuzzer_sys::fuzz_target;
use web_time::Instant;

#[derive(Debug, Arbitrary)]
enum Step {
    Frame(Vec<u8>),
    Advance(u16),
    Close,
}

fuzz_target!(|steps: Vec<Step>| {
    let script = Arc::new(TurnScript::checkers_opening());
    let mut session = PlayerSession::new(
        1,
        0,
        SessionConfig::fast(),
        Arc::clone(&script),
        Arc::new(MetricsRegistry::new()),
        Arc::new(CollectingObserver::new()),
    );
    let mut now = Instant::now();
    session.begin_connect(now);
    session.on_open(now);

    for step in steps {
        let was_terminated = session.is_terminated();
        let state = session.state();
        let turn = session.turn_index();
        match step {
            Step::Frame(bytes) => session.handle_frame(&bytes, now),
            Step::Advance(ms) => now += Duration::from_millis(u64::from(ms)),
            Step::Close => session.on_transport_closed(now),
        }
        session.poll(now);
        let sent = session.drain_outbound().count();

        assert!(session.state() >= state);
        assert!(session.turn_index() >= turn);
        assert!(session.turn_index() <= script.len());
        if was_terminated {
            assert_eq!(sent, 0);
        }
    }
});
