//! Sessions that end before the script does.

use std::sync::Arc;
use std::time::Duration;

use duelsim::metrics::names;
use duelsim::session::{interrupt_channel, run_iteration, run_iteration_until};
use duelsim::{Milestone, PlayerState, Scenario, SessionConfig, Termination};
use serial_test::serial;

use crate::common::{
    run_config, session_context, unused_host, wait_for, MockGameServer, PanickingBootstrapper,
    RejectingBootstrapper, ServerBehavior, StaticBootstrapper, TEST_TIMEOUT,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn failed_ready_check_fails_both_players_with_cleanup() {
    let server = MockGameServer::start(ServerBehavior {
        fail_ready_check: true,
        ..ServerBehavior::default()
    })
    .await;
    let config = run_config(
        &server.host(),
        SessionConfig::smoke(),
        Scenario::per_vu_iterations(2, 1),
    );
    let (ctx, _observer) = session_context(config, Arc::new(StaticBootstrapper::default()));

    let (first, second) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(run_iteration(&ctx, 1, 0), run_iteration(&ctx, 2, 0))
    })
    .await
    .expect("both sessions finish");

    for report in [&first, &second] {
        assert_eq!(report.termination, Termination::RoomFailedReadyCheck);
        assert_eq!(report.final_state, PlayerState::InRoom);
        assert!(report.failed_checks.contains(&Milestone::GameStarted));
        assert!(!report.passed());
    }
    assert!(
        wait_for(|| ["P1", "P2"]
            .iter()
            .all(|p| server.commands_from(p).contains(&"concede_game".to_owned())))
        .await,
        "cleanup sequence reached the server: {:?}",
        server.received()
    );
    let terminations = ctx.metrics.snapshot();
    let counter = &terminations.counters[names::VU_SESSION_TERMINATIONS];
    assert_eq!(counter.by_tags["reason:room_failed_ready_check"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn server_closing_before_game_start_is_a_failed_check() {
    let server = MockGameServer::start(ServerBehavior {
        close_before_game_start: true,
        ..ServerBehavior::default()
    })
    .await;
    let config = run_config(
        &server.host(),
        SessionConfig::smoke(),
        Scenario::per_vu_iterations(2, 1),
    );
    let (ctx, _observer) = session_context(config, Arc::new(StaticBootstrapper::default()));

    let (first, second) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(run_iteration(&ctx, 1, 0), run_iteration(&ctx, 2, 0))
    })
    .await
    .expect("both sessions finish");

    for report in [&first, &second] {
        assert_eq!(report.termination, Termination::PeerClosed, "{report}");
        assert!(report.flags.paired);
        assert!(report.failed_checks.contains(&Milestone::GameStarted));
        assert!(report.failed_checks.contains(&Milestone::TurnSwitched));
        assert!(!report.failed_checks.contains(&Milestone::Paired));
    }
    let snapshot = ctx.metrics.snapshot();
    assert_eq!(snapshot.check(names::CHECK_GAME_START).fails, 2);
    assert_eq!(snapshot.check(names::CHECK_PAIRED).passes, 2);
    assert_eq!(ctx.metrics.counter(names::VU_WS_ERRORS), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn hard_timeout_ends_an_unpaired_session() {
    let server = MockGameServer::start(ServerBehavior {
        never_pair: true,
        ..ServerBehavior::default()
    })
    .await;
    let session = SessionConfig {
        state_timeout: None,
        hard_session_timeout: Duration::from_millis(800),
        ..SessionConfig::smoke()
    };
    let config = run_config(&server.host(), session, Scenario::per_vu_iterations(1, 1));
    let (ctx, _observer) = session_context(config, Arc::new(StaticBootstrapper::default()));

    let report = tokio::time::timeout(TEST_TIMEOUT, run_iteration(&ctx, 1, 0))
        .await
        .expect("session finishes");

    assert_eq!(report.termination, Termination::HardTimeout);
    assert_eq!(report.final_state, PlayerState::InQueue);
    assert!(
        wait_for(|| server.commands_from("P1").ends_with(&[
            "leave_queue".to_owned(),
            "leave_room".to_owned(),
            "concede_game".to_owned()
        ]))
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn interrupt_tears_down_a_queued_session() {
    let server = MockGameServer::start(ServerBehavior {
        never_pair: true,
        ..ServerBehavior::default()
    })
    .await;
    let session = SessionConfig {
        state_timeout: None,
        ..SessionConfig::smoke()
    };
    let config = run_config(&server.host(), session, Scenario::per_vu_iterations(1, 1));
    let (ctx, _observer) = session_context(config, Arc::new(StaticBootstrapper::default()));
    let (interrupter, signal) = interrupt_channel();

    let raise = async {
        assert!(wait_for(|| server.commands_from("P1").contains(&"queue".to_owned())).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        interrupter.raise();
    };
    let (report, ()) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(run_iteration_until(&ctx, 1, 0, signal), raise)
    })
    .await
    .expect("session finishes");

    assert_eq!(report.termination, Termination::Interrupted);
    assert_eq!(report.final_state, PlayerState::InQueue);
    assert!(report.failed_checks.contains(&Milestone::Paired));
    assert!(!report.passed());
    let snapshot = ctx.metrics.snapshot();
    assert_eq!(snapshot.check(names::CHECK_WS_OPENED).passes, 1);
    assert_eq!(snapshot.check(names::CHECK_PAIRED).fails, 1);
    assert!(
        wait_for(|| server.commands_from("P1").ends_with(&[
            "leave_queue".to_owned(),
            "leave_room".to_owned(),
            "concede_game".to_owned()
        ]))
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn interrupt_raised_up_front_never_passes() {
    let server = MockGameServer::start(ServerBehavior::default()).await;
    let config = run_config(
        &server.host(),
        SessionConfig::smoke(),
        Scenario::per_vu_iterations(1, 1),
    );
    let (ctx, _observer) = session_context(config, Arc::new(StaticBootstrapper::default()));
    let (interrupter, signal) = interrupt_channel();
    interrupter.raise();

    let report = tokio::time::timeout(TEST_TIMEOUT, run_iteration_until(&ctx, 1, 0, signal))
        .await
        .expect("session finishes");

    assert_eq!(report.termination, Termination::Interrupted);
    assert!(!report.passed());
    assert!(report.final_state < PlayerState::InQueue);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn refused_connection_is_a_transport_error() {
    let host = unused_host().await;
    let config = run_config(&host, SessionConfig::smoke(), Scenario::per_vu_iterations(1, 1));
    let (ctx, observer) = session_context(config, Arc::new(StaticBootstrapper::default()));

    let report = tokio::time::timeout(TEST_TIMEOUT, run_iteration(&ctx, 1, 0))
        .await
        .expect("session finishes");

    assert!(matches!(report.termination, Termination::TransportError { .. }));
    assert_eq!(report.final_state, PlayerState::Offline);
    assert_eq!(ctx.metrics.counter(names::VU_WS_CONN), 1);
    assert_eq!(ctx.metrics.counter(names::VU_WS_CONN_OK), 0);
    assert_eq!(ctx.metrics.counter(names::VU_WS_ERRORS), 1);
    let snapshot = ctx.metrics.snapshot();
    assert_eq!(snapshot.check(names::CHECK_WS_OPENED).fails, 1);
    // later milestones are not asserted for a connection that never opened
    assert_eq!(snapshot.check(names::CHECK_PAIRED), Default::default());
    assert!(!observer.is_empty());
}

#[tokio::test]
#[serial]
async fn rejected_launch_never_connects() {
    let config = run_config(
        "localhost:1",
        SessionConfig::smoke(),
        Scenario::per_vu_iterations(1, 1),
    );
    let (ctx, _observer) = session_context(config, Arc::new(RejectingBootstrapper(503)));

    let report = run_iteration(&ctx, 7, 3).await;

    assert_eq!(report.vu, 7);
    assert_eq!(report.iteration, 3);
    assert!(matches!(report.termination, Termination::BootstrapFailed { .. }));
    assert!(!report.passed());
    let snapshot = ctx.metrics.snapshot();
    assert_eq!(snapshot.check(names::CHECK_STATUS_200).fails, 1);
    assert_eq!(snapshot.counter(names::VU_GAMELAUNCH), 1);
    assert_eq!(snapshot.counter(names::VU_GAMELAUNCH_OK), 0);
    assert_eq!(snapshot.counter(names::VU_WS_CONN), 0);
    assert!(snapshot.trend(names::WS_OPENED_TIME).is_none());
}

#[tokio::test]
#[serial]
async fn panicking_launch_is_contained() {
    let config = run_config(
        "localhost:1",
        SessionConfig::smoke(),
        Scenario::per_vu_iterations(1, 1),
    );
    let (ctx, _observer) = session_context(config, Arc::new(PanickingBootstrapper));

    let report = run_iteration(&ctx, 1, 0).await;

    assert!(matches!(report.termination, Termination::BootstrapFailed { .. }));
    assert!(ctx.metrics.samples(names::HTTP_GAMELAUNCH_RESPONSE_TIME).is_empty());
}
