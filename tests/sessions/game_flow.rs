//! Queueing, pairing and full scripted games over real sockets.

use std::sync::Arc;
use std::time::Duration;

use duelsim::metrics::names;
use duelsim::session::run_iteration;
use duelsim::{Command, Envelope, Milestone, PlayerState, Scenario, SessionConfig, Termination};
use serde_json::json;
use serial_test::serial;

use crate::common::{
    run_config, session_context, stalling_session, wait_for, MockGameServer, ServerBehavior,
    StaticBootstrapper, TEST_TIMEOUT,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn two_players_complete_the_scripted_game() {
    let server = MockGameServer::start(ServerBehavior::default()).await;
    let config = run_config(
        &server.host(),
        SessionConfig::smoke(),
        Scenario::per_vu_iterations(2, 1),
    );
    let (ctx, observer) = session_context(config, Arc::new(StaticBootstrapper::default()));

    let (first, second) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(run_iteration(&ctx, 1, 0), run_iteration(&ctx, 2, 0))
    })
    .await
    .expect("both sessions finish");

    for report in [&first, &second] {
        assert_eq!(report.termination, Termination::Completed, "{report}");
        assert_eq!(report.final_state, PlayerState::InGame);
        assert_eq!(report.turn_index, 4);
        assert!(report.flags.turn_switched);
        assert!(report.passed(), "{report}");
    }
    assert_ne!(first.player_id, second.player_id);

    let snapshot = ctx.metrics.snapshot();
    assert_eq!(snapshot.trend(names::WS_MOVEMENT_TIME).unwrap().count, 4);
    assert_eq!(snapshot.check(names::CHECK_TURN_SWITCH).passes, 2);
    assert_eq!(snapshot.check(names::CHECK_GAME_START).passes, 2);
    assert!(!snapshot.any_check_failed(), "{snapshot}");
    assert!(observer.is_empty(), "{:?}", observer.violations());

    let players = server.players();
    assert_eq!(players.len(), 2);
    assert!(
        wait_for(|| players
            .iter()
            .all(|p| server.commands_from(p).contains(&"concede_game".to_owned())))
        .await
    );
    for player in &players {
        let commands = server.commands_from(player);
        let moves = commands.iter().filter(|c| *c == "move_piece").count();
        assert_eq!(moves, 2, "{player} sent {commands:?}");
        assert!(commands.ends_with(&[
            "leave_queue".to_owned(),
            "leave_room".to_owned(),
            "concede_game".to_owned()
        ]));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn queue_confirmation_latency_is_recorded() {
    let server = MockGameServer::start(ServerBehavior {
        never_pair: true,
        ..ServerBehavior::default()
    })
    .await;
    let session = SessionConfig {
        queue_delay: Duration::from_millis(150),
        ..stalling_session(Duration::from_millis(500))
    };
    let config = run_config(&server.host(), session, Scenario::per_vu_iterations(1, 1));
    let (ctx, _observer) = session_context(config, Arc::new(StaticBootstrapper::default()));

    let report = tokio::time::timeout(TEST_TIMEOUT, run_iteration(&ctx, 1, 0))
        .await
        .expect("session finishes");

    assert_eq!(report.player_id.as_deref(), Some("P1"));
    assert_eq!(report.final_state, PlayerState::InQueue);
    assert_eq!(
        report.termination,
        Termination::StateTimeout {
            state: PlayerState::InQueue
        }
    );
    assert!(report.flags.queued);
    assert!(report.failed_checks.contains(&Milestone::Paired));

    let queued = server
        .received()
        .into_iter()
        .find(|r| r.envelope.command == "queue")
        .expect("queue request reached the server");
    assert_eq!(queued.envelope, Envelope::new(Command::Queue, Some(json!(100))));

    let metrics = &ctx.metrics;
    assert_eq!(metrics.samples(names::WS_QUEUE_CONFIRMATION_TIME).len(), 1);
    assert_eq!(metrics.samples(names::WS_CONNECTED_MESSAGE_TIME).len(), 1);
    assert_eq!(metrics.samples(names::HTTP_GAMELAUNCH_RESPONSE_TIME).len(), 1);
    assert_eq!(metrics.counter(names::VU_GAMELAUNCH_OK), 1);
    assert_eq!(metrics.counter(names::VU_WS_CONN_OK), 1);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.check(names::CHECK_STATUS_200).passes, 1);
    assert_eq!(snapshot.check(names::CHECK_CONNECTED).passes, 1);
    assert_eq!(snapshot.check(names::CHECK_PAIRED).fails, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn declined_queue_requests_are_retried() {
    let server = MockGameServer::start(ServerBehavior {
        queue_declines: 3,
        never_pair: true,
        ..ServerBehavior::default()
    })
    .await;
    let config = run_config(
        &server.host(),
        stalling_session(Duration::from_millis(500)),
        Scenario::per_vu_iterations(1, 1),
    );
    let (ctx, _observer) = session_context(config, Arc::new(StaticBootstrapper::default()));

    let report = tokio::time::timeout(TEST_TIMEOUT, run_iteration(&ctx, 1, 0))
        .await
        .expect("session finishes");

    assert_eq!(report.final_state, PlayerState::InQueue);
    assert_eq!(ctx.metrics.counter(names::WS_QUEUE_RETRIES), 3);
    let queues = server
        .commands_from("P1")
        .iter()
        .filter(|c| *c == "queue")
        .count();
    assert_eq!(queues, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn two_games_run_side_by_side() {
    let server = MockGameServer::start(ServerBehavior::default()).await;
    let config = run_config(
        &server.host(),
        SessionConfig::smoke(),
        Scenario::per_vu_iterations(4, 1),
    );
    let (ctx, _observer) = session_context(config, Arc::new(StaticBootstrapper::default()));

    let reports = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(
            run_iteration(&ctx, 1, 0),
            run_iteration(&ctx, 2, 0),
            run_iteration(&ctx, 3, 0),
            run_iteration(&ctx, 4, 0),
        )
    })
    .await
    .expect("all sessions finish");

    for report in [&reports.0, &reports.1, &reports.2, &reports.3] {
        assert_eq!(report.termination, Termination::Completed, "{report}");
        assert_eq!(report.turn_index, 4);
    }
    assert_eq!(ctx.metrics.samples(names::WS_MOVEMENT_TIME).len(), 8);
}
