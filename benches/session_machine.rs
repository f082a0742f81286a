//! Benchmarks for envelope decoding and session event handling
//!
//! Run with: cargo bench --bench session_machine
//!
//! Every inbound frame of every simulated player goes through `decode` and
//! `PlayerSession::handle_frame`, so these bound how many players one core
//! can drive.

// Allow benchmark-specific patterns
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use duelsim::metrics::MetricsRegistry;
use duelsim::protocol::decode;
use duelsim::telemetry::CollectingObserver;
use duelsim::{PlayerSession, SessionConfig, TurnScript};
use serde_json::json;
use web_time::Instant;

fn frames() -> Vec<(&'static str, Vec<u8>)> {
    let board = json!({
        "C7": {"type": "pawn", "player_id": "P1", "piece_id": "a1"},
        "C5": {"type": "pawn", "player_id": "P1", "piece_id": "a2"},
        "F2": {"type": "pawn", "player_id": "P2", "piece_id": "b1"},
        "F4": {"type": "pawn", "player_id": "P2", "piece_id": "b2"},
        "D8": null, "E1": null, "D6": null, "E3": null
    });
    vec![
        ("queue_confirmation", json!({"command": "queue_confirmation", "value": true})),
        ("turn_switch", json!({"command": "turn_switch", "value": "P2"})),
        (
            "move_piece",
            json!({"command": "move_piece", "value": {
                "player_id": "P2", "piece_id": "b1", "from": "F2", "to": "E1",
                "is_capture": false, "is_kinged": false
            }}),
        ),
        ("game_start", json!({"command": "game_start", "value": {"Board": board}})),
    ]
    .into_iter()
    .map(|(name, value)| (name, value.to_string().into_bytes()))
    .collect()
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for (name, bytes) in frames() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &bytes, |b, bytes| {
            b.iter(|| decode(black_box(bytes)).unwrap());
        });
    }
    group.finish();
}

/// One full scripted game as seen by the first player, from open to close.
fn bench_full_game(c: &mut Criterion) {
    let script = Arc::new(TurnScript::checkers_opening());
    let game: Vec<Vec<u8>> = {
        let mut frames = vec![
            json!({"command": "connected", "value": {"player_id": "P1"}}),
            json!({"command": "queue_confirmation", "value": true}),
            json!({"command": "paired", "value": {}}),
            json!({"command": "opponent_ready", "value": {"is_ready": true}}),
            json!({"command": "balance_update", "value": 100}),
            json!({"command": "game_start", "value": {"Board": {
                "C7": {"type": "pawn", "player_id": "P1", "piece_id": "a1"},
                "C5": {"type": "pawn", "player_id": "P1", "piece_id": "a2"},
                "F2": {"type": "pawn", "player_id": "P2", "piece_id": "b1"},
                "F4": {"type": "pawn", "player_id": "P2", "piece_id": "b2"},
                "D8": null, "E1": null, "D6": null, "E3": null
            }}}),
        ];
        for (player, from, to, next) in [
            ("P1", "C7", "D8", "P2"),
            ("P2", "F2", "E1", "P1"),
            ("P1", "C5", "D6", "P2"),
            ("P2", "F4", "E3", "P1"),
        ] {
            frames.push(json!({"command": "move_piece", "value": {
                "player_id": player, "piece_id": "x", "from": from, "to": to,
                "is_capture": false, "is_kinged": false
            }}));
            frames.push(json!({"command": "turn_switch", "value": next}));
        }
        frames
            .into_iter()
            .map(|value| value.to_string().into_bytes())
            .collect()
    };

    c.bench_function("PlayerSession/full_game", |b| {
        b.iter(|| {
            let mut session = PlayerSession::new(
                1,
                0,
                SessionConfig::smoke(),
                Arc::clone(&script),
                Arc::new(MetricsRegistry::new()),
                Arc::new(CollectingObserver::new()),
            );
            let mut now = Instant::now();
            session.begin_connect(now);
            session.on_open(now);
            for frame in &game {
                now += Duration::from_millis(1);
                session.handle_frame(black_box(frame), now);
                session.poll(now);
                black_box(session.drain_outbound().count());
            }
            session.poll(now + Duration::from_secs(1));
            black_box(session.report())
        });
    });
}

criterion_group!(benches, bench_decode, bench_full_game);
criterion_main!(benches);
