//! Property-based tests for the codec, ramp plans and the session machine.
//!
//! # Properties Tested
//!
//! - Envelopes survive an encode/decode round trip for every command
//! - A ramp target always lies between the neighboring stage targets
//! - Under arbitrary inbound traffic a session's state and turn index never
//!   move backwards, the turn index stays within the script, and a
//!   terminated session stays silent

use std::sync::Arc;
use std::time::Duration;

use duelsim::config::Stage;
use duelsim::metrics::MetricsRegistry;
use duelsim::protocol::{decode, encode};
use duelsim::telemetry::CollectingObserver;
use duelsim::{
    Command, Envelope, PlayerSession, PlayerState, RampPlan, SessionConfig, TurnScript,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use web_time::Instant;

// ============================================================================
// Strategies
// ============================================================================

fn command_strategy() -> impl Strategy<Value = Command> {
    (0..Command::ALL.len()).prop_map(|index| Command::ALL[index])
}

fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9_ ]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

const ME: &str = "P1";
const THEM: &str = "P2";

fn board() -> Value {
    json!({
        "C7": {"type": "pawn", "player_id": ME, "piece_id": "a1"},
        "C5": {"type": "pawn", "player_id": ME, "piece_id": "a2"},
        "F2": {"type": "pawn", "player_id": THEM, "piece_id": "b1"},
        "F4": {"type": "pawn", "player_id": THEM, "piece_id": "b2"},
        "D8": null, "E1": null, "D6": null, "E3": null
    })
}

fn echo(player: &str, from: &str, to: &str) -> Vec<u8> {
    json!({"command": "move_piece", "value": {
        "player_id": player, "piece_id": "x", "from": from, "to": to,
        "is_capture": false, "is_kinged": false
    }})
    .to_string()
    .into_bytes()
}

/// Inbound frames a confused or hostile server might send.
fn frame_templates() -> Vec<Vec<u8>> {
    let frame = |value: Value| value.to_string().into_bytes();
    vec![
        frame(json!({"command": "connected", "value": {"player_id": ME}})),
        frame(json!({"command": "queue_confirmation", "value": true})),
        frame(json!({"command": "queue_confirmation", "value": false})),
        frame(json!({"command": "paired", "value": {"room": 1}})),
        frame(json!({"command": "game_start", "value": {"Board": board(), "current_player_id": ME}})),
        frame(json!({"command": "game_start", "value": 7})),
        frame(json!({"command": "opponent_ready", "value": {"is_ready": true}})),
        frame(json!({"command": "balance_update", "value": 10})),
        echo(ME, "C7", "D8"),
        echo(THEM, "F2", "E1"),
        echo(ME, "C5", "D6"),
        echo(THEM, "F4", "E3"),
        frame(json!({"command": "turn_switch", "value": ME})),
        frame(json!({"command": "turn_switch", "value": THEM})),
        frame(json!({"command": "pong"})),
        frame(json!({"command": "game_timer", "value": 30})),
        frame(json!({"command": "something_new", "value": [1, 2]})),
        b"not json at all".to_vec(),
        b"{\"value\": 1}".to_vec(),
    ]
}

fn fail_ready_frame() -> Vec<u8> {
    json!({"command": "room_failed_ready_check"})
        .to_string()
        .into_bytes()
}

// ============================================================================
// Codec
// ============================================================================

proptest! {
    #[test]
    fn envelope_round_trip(command in command_strategy(), value in prop::option::of(value_strategy())) {
        let envelope = Envelope::new(command, value);
        let text = encode(&envelope).unwrap();
        let decoded = decode(text.as_bytes()).unwrap();
        prop_assert_eq!(decoded.kind(), Some(command));
        prop_assert_eq!(decoded, envelope);
    }

    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode(&bytes);
    }
}

// ============================================================================
// Ramp plans
// ============================================================================

proptest! {
    #[test]
    fn ramp_target_is_bounded_by_its_stage(
        start in 0u32..500,
        stages in prop::collection::vec((0u64..5_000, 0u32..500), 1..5),
        at_ms in 0u64..30_000,
    ) {
        let stages: Vec<Stage> = stages
            .into_iter()
            .map(|(ms, target)| Stage::new(Duration::from_millis(ms), target))
            .collect();
        let plan = RampPlan::new(start, stages.clone());
        let elapsed = Duration::from_millis(at_ms);
        let target = plan.target_at(elapsed);

        let mut from = start;
        let mut stage_start = Duration::ZERO;
        let mut expected_bounds = None;
        for stage in &stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                expected_bounds = Some((from.min(stage.target), from.max(stage.target)));
                break;
            }
            from = stage.target;
            stage_start = stage_end;
        }
        let (low, high) = expected_bounds.unwrap_or((from, from));
        prop_assert!(low <= target && target <= high, "{} not in [{}, {}]", target, low, high);
    }
}

// ============================================================================
// Session machine
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn session_never_regresses(
        steps in prop::collection::vec((0usize..19, 0u64..300), 1..80),
        fail_at in prop::option::of(0usize..80),
    ) {
        let templates = frame_templates();
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

        let mut last_state = session.state();
        let mut last_turn = session.turn_index();
        let mut moves_sent = 0usize;

        for (step, (template, advance)) in steps.into_iter().enumerate() {
            now += Duration::from_millis(advance);
            let was_terminated = session.is_terminated();
            if fail_at == Some(step) {
                session.handle_frame(&fail_ready_frame(), now);
            } else {
                session.handle_frame(&templates[template], now);
            }
            session.poll(now);

            let sent: Vec<Envelope> = session.drain_outbound().collect();
            if was_terminated {
                prop_assert!(sent.is_empty(), "terminated session sent {:?}", sent);
            }
            moves_sent += sent.iter().filter(|e| e.kind() == Some(Command::MovePiece)).count();

            prop_assert!(session.state() >= last_state);
            prop_assert!(session.turn_index() >= last_turn);
            prop_assert!(session.turn_index() <= script.len());
            last_state = session.state();
            last_turn = session.turn_index();
        }

        // one move per scripted turn at most, and only on our own turns
        prop_assert!(moves_sent <= 2, "sent {} moves", moves_sent);
        if session.state() < PlayerState::InGame {
            prop_assert_eq!(moves_sent, 0);
        }
    }
}
