//! Sans-IO state machine for one virtual player.
//!
//! [`PlayerSession`] never touches a socket or a clock. The driver feeds it
//! connection events and inbound frames together with the current instant,
//! calls [`PlayerSession::poll`] whenever [`PlayerSession::next_deadline`]
//! passes, and writes out whatever [`PlayerSession::drain_outbound`] yields.
//! That keeps every transition testable without a server or real time.

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};
use web_time::Instant;

use crate::config::SessionConfig;
use crate::metrics::{names, MetricsRegistry};
use crate::protocol::codec::{decode, decode_payload, CodecError};
use crate::protocol::messages::{
    id_from_value, is_truthy, Board, Command, ConnectedPayload, Envelope, GameStartPayload,
    MovePayload, Outbound, PlayerId,
};
use crate::report_violation;
use crate::script::TurnScript;
use crate::session::flags::{Milestone, MilestoneFlags};
use crate::session::report::SessionReport;
use crate::session::state::{PlayerState, Termination};
use crate::session::timers::{DeferredAction, Fired, SessionTimers, TimerKind};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};

/// Connection status as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Pending,
    Open,
    Closed,
}

/// Everything one virtual player knows about its game.
///
/// Owned exclusively by the task driving that player; the only shared pieces
/// are the read-only script and config and the append-only metrics registry.
pub struct PlayerSession {
    vu: u64,
    iteration: u64,
    config: SessionConfig,
    script: Arc<TurnScript>,
    metrics: Arc<MetricsRegistry>,
    observer: Arc<dyn ViolationObserver>,

    state: PlayerState,
    transport: Transport,
    player_id: Option<PlayerId>,
    board: Option<Board>,
    current_player: Option<PlayerId>,
    turn_index: usize,
    flags: MilestoneFlags,
    timers: SessionTimers,

    // per-flow start timestamps
    connect_started: Option<Instant>,
    queue_requested: bool,
    queue_sent_at: Option<Instant>,
    queue_confirmed_at: Option<Instant>,
    move_sent: Option<(usize, Instant)>,
    last_sent_turn: Option<usize>,

    outbound: VecDeque<Envelope>,
    termination: Option<Termination>,
}

impl std::fmt::Debug for PlayerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerSession")
            .field("vu", &self.vu)
            .field("iteration", &self.iteration)
            .field("state", &self.state)
            .field("player_id", &self.player_id)
            .field("turn_index", &self.turn_index)
            .field("flags", &self.flags)
            .field("termination", &self.termination)
            .finish_non_exhaustive()
    }
}

impl PlayerSession {
    #[must_use]
    pub fn new(
        vu: u64,
        iteration: u64,
        config: SessionConfig,
        script: Arc<TurnScript>,
        metrics: Arc<MetricsRegistry>,
        observer: Arc<dyn ViolationObserver>,
    ) -> Self {
        Self {
            vu,
            iteration,
            config,
            script,
            metrics,
            observer,
            state: PlayerState::Offline,
            transport: Transport::Pending,
            player_id: None,
            board: None,
            current_player: None,
            turn_index: 0,
            flags: MilestoneFlags::default(),
            timers: SessionTimers::new(),
            connect_started: None,
            queue_requested: false,
            queue_sent_at: None,
            queue_confirmed_at: None,
            move_sent: None,
            last_sent_turn: None,
            outbound: VecDeque::new(),
            termination: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> PlayerState {
        self.state
    }

    #[must_use]
    pub fn player_id(&self) -> Option<&str> {
        self.player_id.as_deref()
    }

    #[must_use]
    pub const fn board(&self) -> Option<&Board> {
        self.board.as_ref()
    }

    /// Player whose turn it is, as last announced by `turn_switch` or `game_start`.
    #[must_use]
    pub fn current_player(&self) -> Option<&str> {
        self.current_player.as_deref()
    }

    #[must_use]
    pub const fn turn_index(&self) -> usize {
        self.turn_index
    }

    #[must_use]
    pub const fn flags(&self) -> MilestoneFlags {
        self.flags
    }

    #[must_use]
    pub const fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.termination.is_some()
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Envelopes waiting to be written, in order.
    pub fn drain_outbound(&mut self) -> Drain<'_, Envelope> {
        self.outbound.drain(..)
    }

    /// Final report. `None` until the session terminated.
    #[must_use]
    pub fn report(&self) -> Option<SessionReport> {
        self.termination
            .clone()
            .map(|termination| self.build_report(termination))
    }

    /// Final report, ending the session as `fallback` if it is still running.
    pub fn finish(&mut self, fallback: Termination, now: Instant) -> SessionReport {
        if let Some(termination) = self.termination.clone() {
            return self.build_report(termination);
        }
        self.terminate(fallback.clone(), now);
        self.build_report(fallback)
    }

    fn build_report(&self, termination: Termination) -> SessionReport {
        SessionReport {
            vu: self.vu,
            iteration: self.iteration,
            player_id: self.player_id.clone(),
            final_state: self.state,
            turn_index: self.turn_index,
            flags: self.flags,
            failed_checks: self.flags.missing(),
            termination,
        }
    }

    /*
     *  CONNECTION EVENTS
     */

    /// The driver started opening the connection.
    pub fn begin_connect(&mut self, now: Instant) {
        if self.is_terminated() || self.connect_started.is_some() {
            return;
        }
        self.metrics.increment(names::VU_WS_CONN);
        self.connect_started = Some(now);
        self.timers
            .arm(TimerKind::Connect, now + self.config.connect_timeout);
    }

    /// The connection is open: OFFLINE → ONLINE.
    pub fn on_open(&mut self, now: Instant) {
        if self.is_terminated() || self.transport != Transport::Pending {
            return;
        }
        self.transport = Transport::Open;
        self.transition(PlayerState::Online, now);
        self.flags.opened = true;
        self.metrics.increment(names::VU_WS_CONN_OK);
        let started = *self.connect_started.get_or_insert(now);
        self.metrics
            .record(names::WS_OPENED_TIME, now.saturating_duration_since(started), &[]);

        self.timers.disarm(TimerKind::Connect);
        self.timers
            .arm(TimerKind::Hard, now + self.config.hard_session_timeout);
        self.timers
            .arm(TimerKind::Keepalive, now + self.config.keepalive_interval);
    }

    /// The server closed the connection.
    pub fn on_transport_closed(&mut self, now: Instant) {
        if self.is_terminated() {
            return;
        }
        self.mark_closed();
        self.terminate(Termination::PeerClosed, now);
    }

    // a connection that never opened stays pending, so teardown only asserts `opened`
    fn mark_closed(&mut self) {
        if self.transport == Transport::Open {
            self.transport = Transport::Closed;
        }
    }

    /// The connection failed (including failure to open it at all).
    pub fn on_transport_error(&mut self, context: impl Into<String>, now: Instant) {
        if self.is_terminated() {
            return;
        }
        let context = context.into();
        self.metrics.increment(names::VU_WS_ERRORS);
        report_violation!(
            self.observer,
            Some(self.vu),
            ViolationSeverity::Warning,
            ViolationKind::Transport,
            "connection error in {}: {}",
            self.state,
            context
        );
        self.mark_closed();
        self.terminate(Termination::TransportError { context }, now);
    }

    /*
     *  RECEIVING MESSAGES
     */

    /// Decodes and handles one inbound frame. Malformed frames are dropped.
    pub fn handle_frame(&mut self, bytes: &[u8], now: Instant) {
        if self.is_terminated() {
            return;
        }
        match decode(bytes) {
            Ok(envelope) => self.handle_envelope(&envelope, now),
            Err(err) => self.on_malformed(&err, bytes.len()),
        }
    }

    /// Handles one decoded envelope.
    pub fn handle_envelope(&mut self, envelope: &Envelope, now: Instant) {
        if self.is_terminated() {
            trace!(vu = self.vu, command = %envelope.command, "session terminated; ignoring message");
            return;
        }
        let Some(command) = envelope.kind() else {
            debug!(vu = self.vu, command = %envelope.command, "ignoring unknown command");
            return;
        };
        trace!(vu = self.vu, state = %self.state, %command, "handling message");
        let value = envelope.value.as_ref();

        match command {
            Command::Connected => self.on_connected(value, now),
            Command::QueueConfirmation => self.on_queue_confirmation(value, now),
            Command::Paired => self.on_paired(now),
            Command::GameStart => self.on_game_start(value, now),
            Command::OpponentReady => self.on_opponent_ready(value),
            Command::BalanceUpdate => self.on_balance_update(),
            Command::MovePiece => self.on_move_echo(value, now),
            Command::TurnSwitch => self.on_turn_switch(value, now),
            Command::RoomFailedReadyCheck => {
                debug!(vu = self.vu, state = %self.state, "room failed ready check");
                self.terminate(Termination::RoomFailedReadyCheck, now);
            },
            Command::Error | Command::Invalid | Command::Info => {
                self.metrics
                    .add(names::WS_SERVER_NOTICES, 1, &[("kind", command.as_str())]);
                debug!(vu = self.vu, %command, value = ?value, "server notice");
            },
            Command::Ping
            | Command::Pong
            | Command::GameInfo
            | Command::GameTimer
            | Command::RoomTimer => (),
            // outbound-only commands echoed back by a confused server
            Command::Queue
            | Command::LeaveQueue
            | Command::ReadyQueue
            | Command::LeaveRoom
            | Command::ConcedeGame => {
                trace!(vu = self.vu, %command, "ignoring outbound command from server");
            },
        }
    }

    fn on_malformed(&mut self, err: &CodecError, len: usize) {
        self.metrics.increment(names::WS_MALFORMED_ENVELOPES);
        report_violation!(
            self.observer,
            Some(self.vu),
            ViolationSeverity::Warning,
            ViolationKind::Codec,
            "dropping malformed frame of {} bytes in {}: {}",
            len,
            self.state,
            err
        );
    }

    fn on_connected(&mut self, value: Option<&Value>, now: Instant) {
        if self.state != PlayerState::Online || self.queue_requested {
            trace!(vu = self.vu, state = %self.state, "unexpected connected; ignoring");
            return;
        }
        if let Some(started) = self.connect_started {
            self.metrics.record(
                names::WS_CONNECTED_MESSAGE_TIME,
                now.saturating_duration_since(started),
                &[],
            );
        }
        self.metrics.check(names::CHECK_CONNECTED, true);

        let payload = match value {
            Some(value) => decode_payload::<ConnectedPayload>(Command::Connected, Some(value)),
            None => Ok(ConnectedPayload::default()),
        };
        match payload {
            Ok(ConnectedPayload {
                player_id: Some(id),
            }) => self.player_id = Some(id),
            Ok(ConnectedPayload { player_id: None }) => {
                report_violation!(
                    self.observer,
                    Some(self.vu),
                    ViolationSeverity::Error,
                    ViolationKind::Protocol,
                    "connected without player_id; this player cannot move"
                );
            },
            Err(err) => self.on_malformed(&err, 0),
        }

        self.queue_requested = true;
        self.timers
            .schedule(DeferredAction::SendQueue, now + self.config.queue_delay);
        self.rearm_state_timer(now);
    }

    fn on_queue_confirmation(&mut self, value: Option<&Value>, now: Instant) {
        if self.state != PlayerState::Online || self.queue_sent_at.is_none() {
            trace!(vu = self.vu, state = %self.state, "unexpected queue_confirmation; ignoring");
            return;
        }
        if is_truthy(value) {
            if let Some(sent) = self.queue_sent_at {
                self.metrics.record(
                    names::WS_QUEUE_CONFIRMATION_TIME,
                    now.saturating_duration_since(sent),
                    &[],
                );
            }
            self.metrics.check(names::CHECK_QUEUE_CONFIRMATION, true);
            self.flags.queued = true;
            self.queue_confirmed_at = Some(now);
            self.transition(PlayerState::InQueue, now);
        } else {
            // the queue is busy: ask again right away, the hard timeout bounds the retries
            self.metrics.increment(names::WS_QUEUE_RETRIES);
            debug!(vu = self.vu, "queue request declined; retrying");
            self.send_queue(now);
            self.rearm_state_timer(now);
        }
    }

    fn on_paired(&mut self, now: Instant) {
        if self.state != PlayerState::InQueue {
            trace!(vu = self.vu, state = %self.state, "unexpected paired; ignoring");
            return;
        }
        if let Some(confirmed) = self.queue_confirmed_at {
            self.metrics.record(
                names::WS_PAIRED_TIME,
                now.saturating_duration_since(confirmed),
                &[],
            );
        }
        self.flags.paired = true;
        self.transition(PlayerState::InRoom, now);
        self.timers
            .schedule(DeferredAction::SendReady, now + self.config.ready_delay);
    }

    fn on_game_start(&mut self, value: Option<&Value>, now: Instant) {
        if self.state != PlayerState::InRoom {
            trace!(vu = self.vu, state = %self.state, "unexpected game_start; ignoring");
            return;
        }
        let payload = match decode_payload::<GameStartPayload>(Command::GameStart, value) {
            Ok(payload) => payload,
            Err(err) => {
                self.on_malformed(&err, 0);
                return;
            },
        };
        self.flags.game_started = true;
        self.board = Some(payload.board);
        self.current_player = payload.current_player_id;
        self.transition(PlayerState::InGame, now);
        self.schedule_move_if_ours(now);
    }

    fn on_opponent_ready(&mut self, value: Option<&Value>) {
        if self.state < PlayerState::InRoom {
            trace!(vu = self.vu, state = %self.state, "unexpected opponent_ready; ignoring");
            return;
        }
        let ready = match value {
            Some(Value::Object(fields)) => is_truthy(fields.get("is_ready")),
            other => is_truthy(other),
        };
        if ready {
            self.flags.opponent_ready = true;
        }
    }

    fn on_balance_update(&mut self) {
        if self.state < PlayerState::Online {
            return;
        }
        self.flags.balance_updated = true;
    }

    fn on_move_echo(&mut self, value: Option<&Value>, now: Instant) {
        if self.state != PlayerState::InGame {
            trace!(vu = self.vu, state = %self.state, "move_piece before game_start; ignoring");
            return;
        }
        let payload = match decode_payload::<MovePayload>(Command::MovePiece, value) {
            Ok(payload) => payload,
            Err(err) => {
                self.on_malformed(&err, 0);
                return;
            },
        };
        if let Some(board) = self.board.as_mut() {
            if let Some(piece) = board.get_mut(&payload.from).and_then(Option::take) {
                board.insert(payload.to.clone(), Some(piece));
            }
        }
        let from_opponent = self.player_id.as_deref() != Some(payload.player_id.as_str());
        if from_opponent && self.turn_index < self.script.len() {
            self.schedule_move_if_ours(now);
        }
    }

    fn on_turn_switch(&mut self, value: Option<&Value>, now: Instant) {
        if self.state != PlayerState::InGame {
            trace!(vu = self.vu, state = %self.state, "turn_switch before game_start; ignoring");
            return;
        }
        self.flags.turn_switched = true;
        if let Some(id) = value.and_then(id_from_value) {
            self.current_player = Some(id);
        }
        if self.turn_index >= self.script.len() {
            trace!(vu = self.vu, "turn_switch after the script ended");
            return;
        }

        if let Some((turn, sent)) = self.move_sent {
            if turn == self.turn_index {
                let tag = turn.to_string();
                self.metrics.record(
                    names::WS_MOVEMENT_TIME,
                    now.saturating_duration_since(sent),
                    &[("turn", tag.as_str())],
                );
                self.move_sent = None;
            }
        }
        self.turn_index += 1;

        if self.turn_index >= self.script.len() {
            debug!(vu = self.vu, turns = self.turn_index, "script finished");
            self.timers.disarm(TimerKind::State);
            self.timers
                .arm(TimerKind::Close, now + self.config.close_after_script);
        } else {
            self.rearm_state_timer(now);
            self.schedule_move_if_ours(now);
        }
    }

    /*
     *  TIMERS
     */

    /// Runs everything that is due at `now`.
    pub fn poll(&mut self, now: Instant) {
        while !self.is_terminated() {
            let Some(fired) = self.timers.pop_due(now) else {
                break;
            };
            match fired {
                Fired::Timer(TimerKind::Hard) => self.terminate(Termination::HardTimeout, now),
                Fired::Timer(TimerKind::Connect) => {
                    if self.transport == Transport::Pending {
                        self.terminate(Termination::ConnectTimeout, now);
                    }
                },
                Fired::Timer(TimerKind::State) => {
                    let state = self.state;
                    self.terminate(Termination::StateTimeout { state }, now);
                },
                Fired::Timer(TimerKind::Close) => self.terminate(Termination::Completed, now),
                Fired::Timer(TimerKind::Keepalive) => {
                    if self.transport == Transport::Open {
                        self.queue_message(&Outbound::Ping);
                        self.timers
                            .arm(TimerKind::Keepalive, now + self.config.keepalive_interval);
                    }
                },
                Fired::Deferred(DeferredAction::SendQueue) => self.send_queue(now),
                Fired::Deferred(DeferredAction::SendReady) => {
                    self.queue_message(&Outbound::ReadyQueue { ready: true });
                },
                Fired::Deferred(DeferredAction::SendMove) => self.send_move(now),
            }
        }
    }

    /*
     *  SENDING MESSAGES
     */

    fn queue_message(&mut self, message: &Outbound) {
        trace!(vu = self.vu, command = %message.command(), "queuing message");
        self.outbound.push_back(message.to_envelope());
    }

    fn send_queue(&mut self, now: Instant) {
        self.queue_message(&Outbound::Queue {
            stake: self.config.stake,
        });
        self.queue_sent_at = Some(now);
    }

    /// Whether the board shows one of our pieces on the source square of `turn`.
    fn owns_turn(&self, turn: usize) -> bool {
        let (Some(me), Some(board)) = (self.player_id.as_deref(), self.board.as_ref()) else {
            return false;
        };
        let Ok(scripted) = self.script.turn_at(turn) else {
            return false;
        };
        matches!(board.get(&scripted.from), Some(Some(piece)) if piece.player_id == me)
    }

    fn schedule_move_if_ours(&mut self, now: Instant) {
        let turn = self.turn_index;
        if turn < self.script.len() && self.last_sent_turn != Some(turn) && self.owns_turn(turn) {
            self.timers
                .schedule(DeferredAction::SendMove, now + self.config.move_delay);
        }
    }

    fn send_move(&mut self, now: Instant) {
        let turn = self.turn_index;
        if self.last_sent_turn == Some(turn) || !self.owns_turn(turn) {
            trace!(vu = self.vu, turn, "scripted move no longer ours; skipping");
            return;
        }
        let scripted = match self.script.turn_at(turn) {
            Ok(scripted) => scripted.clone(),
            Err(err) => {
                report_violation!(
                    self.observer,
                    Some(self.vu),
                    ViolationSeverity::Critical,
                    ViolationKind::Internal,
                    "move scheduled past the script: {}",
                    err
                );
                return;
            },
        };
        let piece = self
            .board
            .as_ref()
            .and_then(|board| board.get(&scripted.from))
            .and_then(Option::as_ref);
        let Some(piece) = piece else {
            return;
        };
        let payload = MovePayload {
            player_id: piece.player_id.clone(),
            piece_id: piece.piece_id.clone(),
            from: scripted.from,
            to: scripted.to,
            is_capture: false,
            is_kinged: false,
        };
        debug!(vu = self.vu, turn, from = %payload.from, to = %payload.to, "sending scripted move");
        self.queue_message(&Outbound::MovePiece(payload));
        self.last_sent_turn = Some(turn);
        self.move_sent = Some((turn, now));
    }

    /*
     *  TRANSITIONS AND TEARDOWN
     */

    fn transition(&mut self, next: PlayerState, now: Instant) {
        debug_assert!(next > self.state, "state may only move forward");
        if next <= self.state {
            report_violation!(
                self.observer,
                Some(self.vu),
                ViolationSeverity::Critical,
                ViolationKind::Internal,
                "refusing backward transition {} -> {}",
                self.state,
                next
            );
            return;
        }
        debug!(vu = self.vu, from = %self.state, to = %next, "state transition");
        self.state = next;
        self.rearm_state_timer(now);
    }

    fn rearm_state_timer(&mut self, now: Instant) {
        match self.config.state_timeout {
            Some(timeout) => self.timers.arm(TimerKind::State, now + timeout),
            None => self.timers.disarm(TimerKind::State),
        }
    }

    /// Ends the session: cancels every timer and pending send, asserts the
    /// milestone flags and, if the connection is still open, queues the
    /// leave/concede sequence for a best-effort flush.
    pub fn terminate(&mut self, reason: Termination, _now: Instant) {
        if self.is_terminated() {
            return;
        }
        debug!(vu = self.vu, state = %self.state, %reason, "terminating session");
        self.timers.cancel_all();

        if self.transport != Transport::Pending {
            for milestone in Milestone::ASSERTED {
                self.metrics
                    .check(milestone.check_name(), self.flags.is_set(milestone));
            }
        } else {
            // never connected: only the opened check is meaningful
            self.metrics.check(Milestone::Opened.check_name(), false);
        }

        if self.transport == Transport::Open {
            self.queue_message(&Outbound::LeaveQueue);
            self.queue_message(&Outbound::LeaveRoom);
            self.queue_message(&Outbound::ConcedeGame);
        }

        self.metrics
            .add(names::VU_SESSION_TERMINATIONS, 1, &[("reason", reason.label())]);
        self.termination = Some(reason);
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::telemetry::CollectingObserver;
    use serde_json::json;
    use web_time::Duration;

    const ME: &str = "P1";
    const THEM: &str = "P2";

    struct Harness {
        session: PlayerSession,
        metrics: Arc<MetricsRegistry>,
        observer: Arc<CollectingObserver>,
        now: Instant,
    }

    impl Harness {
        fn new(config: SessionConfig) -> Self {
            let metrics = Arc::new(MetricsRegistry::new());
            let observer = Arc::new(CollectingObserver::new());
            let session = PlayerSession::new(
                1,
                0,
                config,
                Arc::new(TurnScript::checkers_opening()),
                metrics.clone(),
                observer.clone(),
            );
            Self {
                session,
                metrics,
                observer,
                now: Instant::now(),
            }
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            self.session.poll(self.now);
        }

        fn open(&mut self) {
            self.session.begin_connect(self.now);
            self.advance(Duration::from_millis(5));
            self.session.on_open(self.now);
        }

        fn recv(&mut self, frame: serde_json::Value) {
            let bytes = serde_json::to_vec(&frame).unwrap();
            self.session.handle_frame(&bytes, self.now);
            self.session.poll(self.now);
        }

        fn sent(&mut self) -> Vec<Envelope> {
            self.session.drain_outbound().collect()
        }

        fn sent_commands(&mut self) -> Vec<String> {
            self.sent().into_iter().map(|e| e.command).collect()
        }

        /// Drives the session through connected/queue/paired.
        fn into_room(&mut self) {
            self.open();
            self.recv(json!({"command": "connected", "value": {"player_id": ME}}));
            self.advance(Duration::from_millis(150));
            self.recv(json!({"command": "queue_confirmation", "value": true}));
            self.recv(json!({"command": "paired", "value": {"room": 1}}));
            self.advance(Duration::from_millis(150));
            self.sent();
        }

        fn start_game(&mut self) {
            self.recv(json!({"command": "game_start", "value": {
                "Board": opening_board(),
                "current_player_id": ME,
                "game_id": "g1"
            }}));
        }
    }

    fn opening_board() -> serde_json::Value {
        json!({
            "C7": {"type": "pawn", "player_id": ME, "piece_id": "a1", "is_kinged": false},
            "C5": {"type": "pawn", "player_id": ME, "piece_id": "a2", "is_kinged": false},
            "F2": {"type": "pawn", "player_id": THEM, "piece_id": "b1", "is_kinged": false},
            "F4": {"type": "pawn", "player_id": THEM, "piece_id": "b2", "is_kinged": false},
            "D8": null, "E1": null, "D6": null, "E3": null
        })
    }

    fn echo(player: &str, from: &str, to: &str) -> serde_json::Value {
        json!({"command": "move_piece", "value": {
            "player_id": player, "piece_id": "x", "from": from, "to": to,
            "is_capture": false, "is_kinged": false
        }})
    }

    // ==========================================================================
    // Connection and queue
    // ==========================================================================

    #[test]
    fn open_moves_offline_to_online_and_records_latency() {
        let mut h = Harness::new(SessionConfig::default());
        assert_eq!(h.session.state(), PlayerState::Offline);
        h.open();
        assert_eq!(h.session.state(), PlayerState::Online);
        assert!(h.session.flags().opened);
        assert_eq!(h.metrics.samples(names::WS_OPENED_TIME).len(), 1);
        assert_eq!(h.metrics.counter(names::VU_WS_CONN_OK), 1);
    }

    #[test]
    fn connected_then_queue_after_delay() {
        let mut h = Harness::new(SessionConfig::default());
        h.open();
        h.recv(json!({"command": "connected", "value": {"player_id": ME}}));
        assert_eq!(h.session.player_id(), Some(ME));
        assert!(h.sent().is_empty());

        h.advance(Duration::from_millis(149));
        assert!(h.sent().is_empty());
        h.advance(Duration::from_millis(1));
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], Envelope::new(Command::Queue, Some(json!(100))));

        h.advance(Duration::from_millis(30));
        h.recv(json!({"command": "queue_confirmation", "value": true}));
        assert_eq!(h.session.state(), PlayerState::InQueue);
        let samples = h.metrics.samples(names::WS_QUEUE_CONFIRMATION_TIME);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, Duration::from_millis(30));
    }

    #[test]
    fn falsy_confirmation_retries_without_leaving_online() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.open();
        h.recv(json!({"command": "connected", "value": {"player_id": ME}}));
        assert_eq!(h.sent_commands(), vec!["queue"]);

        for falsy in [json!(false), json!(0), json!(""), json!(null)] {
            h.recv(json!({"command": "queue_confirmation", "value": falsy}));
            assert_eq!(h.session.state(), PlayerState::Online);
            assert_eq!(h.sent_commands(), vec!["queue"]);
        }
        assert_eq!(h.metrics.counter(names::WS_QUEUE_RETRIES), 4);

        h.recv(json!({"command": "queue_confirmation", "value": 1}));
        assert_eq!(h.session.state(), PlayerState::InQueue);
    }

    #[test]
    fn queue_retries_stop_at_hard_timeout() {
        let config = SessionConfig {
            state_timeout: None,
            ..SessionConfig::smoke()
        };
        let mut h = Harness::new(config);
        h.open();
        h.recv(json!({"command": "connected", "value": {"player_id": ME}}));
        for _ in 0..10 {
            h.advance(Duration::from_secs(2));
            h.recv(json!({"command": "queue_confirmation", "value": false}));
        }
        h.advance(Duration::from_secs(30));
        assert_eq!(h.session.termination(), Some(&Termination::HardTimeout));
        assert_eq!(h.session.state(), PlayerState::Online);
    }

    #[test]
    fn connected_without_player_id_is_a_violation() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.open();
        h.recv(json!({"command": "connected", "value": {}}));
        assert!(h.observer.has_violation(ViolationKind::Protocol));
        assert_eq!(h.session.player_id(), None);
        assert_eq!(h.sent_commands(), vec!["queue"]);
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.open();
        h.session.handle_frame(b"{not json", h.now);
        h.session.handle_frame(br#"{"value": 3}"#, h.now);
        assert_eq!(h.metrics.counter(names::WS_MALFORMED_ENVELOPES), 2);
        assert!(h.observer.has_violation(ViolationKind::Codec));
        assert_eq!(h.session.state(), PlayerState::Online);
        assert!(!h.session.is_terminated());
    }

    // ==========================================================================
    // Ordering tolerance
    // ==========================================================================

    #[test]
    fn out_of_order_messages_are_ignored() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.open();
        h.recv(echo(THEM, "F2", "E1"));
        h.recv(json!({"command": "turn_switch", "value": ME}));
        h.recv(json!({"command": "paired"}));
        h.recv(json!({"command": "game_start", "value": {"Board": {}}}));
        assert_eq!(h.session.state(), PlayerState::Online);
        assert_eq!(h.session.turn_index(), 0);
        assert!(!h.session.flags().paired);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn duplicate_milestones_are_idempotent() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.into_room();
        h.recv(json!({"command": "paired"}));
        h.recv(json!({"command": "queue_confirmation", "value": true}));
        assert_eq!(h.session.state(), PlayerState::InRoom);
        assert_eq!(h.metrics.samples(names::WS_PAIRED_TIME).len(), 1);
    }

    #[test]
    fn paired_schedules_ready_request() {
        let mut h = Harness::new(SessionConfig::default());
        h.open();
        h.recv(json!({"command": "connected", "value": {"player_id": ME}}));
        h.advance(Duration::from_millis(150));
        h.recv(json!({"command": "queue_confirmation", "value": true}));
        h.sent();
        h.recv(json!({"command": "paired", "value": {}}));
        assert!(h.sent().is_empty());
        h.advance(Duration::from_millis(150));
        assert_eq!(
            h.sent(),
            vec![Envelope::new(Command::ReadyQueue, Some(json!(true)))]
        );
    }

    // ==========================================================================
    // Game flow
    // ==========================================================================

    #[test]
    fn first_mover_sends_opening_move() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.into_room();
        h.start_game();
        assert_eq!(h.session.state(), PlayerState::InGame);
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, "move_piece");
        let value = sent[0].value.as_ref().unwrap();
        assert_eq!(value["from"], "C7");
        assert_eq!(value["to"], "D8");
        assert_eq!(value["piece_id"], "a1");
        assert_eq!(value["is_capture"], false);
        assert_eq!(value["is_kinged"], false);
    }

    #[test]
    fn full_script_alternates_and_stops_after_four_turns() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.into_room();
        h.start_game();
        h.sent();

        // turn 0: ours
        h.recv(echo(ME, "C7", "D8"));
        h.advance(Duration::from_millis(7));
        h.recv(json!({"command": "turn_switch", "value": THEM}));
        assert_eq!(h.session.turn_index(), 1);
        assert!(h.sent().is_empty());
        let moves = h.metrics.samples(names::WS_MOVEMENT_TIME);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].tags["turn"], "0");
        assert_eq!(moves[0].value, Duration::from_millis(7));

        // turn 1: theirs
        h.recv(echo(THEM, "F2", "E1"));
        h.recv(json!({"command": "turn_switch", "value": ME}));
        assert_eq!(h.session.turn_index(), 2);
        let sent = h.sent();
        assert_eq!(sent.len(), 1, "exactly one move for turn 2");
        assert_eq!(sent[0].value.as_ref().unwrap()["from"], "C5");

        // turn 2: ours
        h.recv(echo(ME, "C5", "D6"));
        h.recv(json!({"command": "turn_switch", "value": THEM}));
        // turn 3: theirs
        h.recv(echo(THEM, "F4", "E3"));
        h.recv(json!({"command": "turn_switch", "value": ME}));

        assert_eq!(h.session.turn_index(), 4);
        assert!(h.sent().is_empty());

        // extra turn switches never push past the script
        h.recv(json!({"command": "turn_switch", "value": THEM}));
        assert_eq!(h.session.turn_index(), 4);
        assert!(h.sent().is_empty());
        assert_eq!(h.metrics.samples(names::WS_MOVEMENT_TIME).len(), 2);
    }

    #[test]
    fn echoes_update_the_board() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.into_room();
        h.start_game();
        h.recv(echo(ME, "C7", "D8"));
        let board = h.session.board().unwrap();
        assert_eq!(board["C7"], None);
        assert_eq!(board["D8"].as_ref().unwrap().piece_id, "a1");
    }

    #[test]
    fn game_start_reads_server_cased_current_player() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.into_room();
        h.recv(json!({"command": "game_start", "value": {
            "Board": opening_board(),
            "CurrentPlayerID": THEM,
            "game_id": "g1"
        }}));
        assert_eq!(h.session.state(), PlayerState::InGame);
        assert_eq!(h.session.current_player(), Some(THEM));
    }

    #[test]
    fn second_player_waits_for_its_turn() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.open();
        h.recv(json!({"command": "connected", "value": {"player_id": THEM}}));
        h.recv(json!({"command": "queue_confirmation", "value": true}));
        h.recv(json!({"command": "paired"}));
        h.sent();
        h.start_game();
        assert!(h.sent().is_empty());

        h.recv(echo(ME, "C7", "D8"));
        assert!(h.sent().is_empty(), "turn 0 is not ours");
        h.recv(json!({"command": "turn_switch", "value": THEM}));
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].value.as_ref().unwrap()["from"], "F2");
        assert_eq!(sent[0].value.as_ref().unwrap()["player_id"], THEM);
    }

    #[test]
    fn echo_and_turn_switch_do_not_double_send() {
        let mut h = Harness::new(SessionConfig::fast());
        h.open();
        h.recv(json!({"command": "connected", "value": {"player_id": THEM}}));
        h.advance(Duration::from_millis(20));
        h.recv(json!({"command": "queue_confirmation", "value": true}));
        h.recv(json!({"command": "paired"}));
        h.advance(Duration::from_millis(20));
        h.sent();
        h.start_game();
        h.recv(echo(ME, "C7", "D8"));
        h.recv(json!({"command": "turn_switch", "value": THEM}));
        h.advance(Duration::from_millis(20));
        h.recv(echo(ME, "C7", "D8"));
        h.advance(Duration::from_millis(20));
        assert_eq!(h.sent_commands(), vec!["move_piece"]);
    }

    #[test]
    fn opponent_ready_and_balance_update_set_flags() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.into_room();
        h.recv(json!({"command": "opponent_ready", "value": {"is_ready": false}}));
        assert!(!h.session.flags().opponent_ready);
        h.recv(json!({"command": "opponent_ready", "value": {"is_ready": true}}));
        h.recv(json!({"command": "balance_update", "value": 900.5}));
        let flags = h.session.flags();
        assert!(flags.opponent_ready);
        assert!(flags.balance_updated);
        assert_eq!(h.session.state(), PlayerState::InRoom);
    }

    #[test]
    fn server_notices_are_counted() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.open();
        h.recv(json!({"command": "error", "value": "boom"}));
        h.recv(json!({"command": "invalid"}));
        h.recv(json!({"command": "game_timer", "value": 10}));
        assert_eq!(h.metrics.counter(names::WS_SERVER_NOTICES), 2);
        assert!(!h.session.is_terminated());
    }

    // ==========================================================================
    // Teardown
    // ==========================================================================

    #[test]
    fn room_failed_ready_check_is_fatal_with_cleanup() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.into_room();
        h.recv(json!({"command": "room_failed_ready_check"}));
        assert_eq!(
            h.session.termination(),
            Some(&Termination::RoomFailedReadyCheck)
        );
        assert_eq!(
            h.sent_commands(),
            vec!["leave_queue", "leave_room", "concede_game"]
        );
        let report = h.session.report().unwrap();
        assert!(!report.passed());
        assert!(report.failed_checks.contains(&Milestone::GameStarted));
    }

    #[test]
    fn peer_close_before_game_start_fails_game_started_check() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.into_room();
        h.session.on_transport_closed(h.now);
        let report = h.session.report().unwrap();
        assert_eq!(report.termination, Termination::PeerClosed);
        assert!(report.failed_checks.contains(&Milestone::GameStarted));
        assert!(!report.failed_checks.contains(&Milestone::Paired));
        assert!(h.sent().is_empty(), "no cleanup on a closed connection");
        let checks = h.metrics.snapshot();
        assert_eq!(checks.check(names::CHECK_GAME_START).fails, 1);
        assert_eq!(checks.check(names::CHECK_PAIRED).passes, 1);
    }

    #[test]
    fn termination_discards_pending_sends() {
        let mut h = Harness::new(SessionConfig::default());
        h.open();
        h.recv(json!({"command": "connected", "value": {"player_id": ME}}));
        h.session.on_transport_error("reset by peer", h.now);
        h.advance(Duration::from_secs(1));
        assert!(h.sent().is_empty());
        assert_eq!(h.session.next_deadline(), None);
        assert_eq!(h.metrics.counter(names::VU_WS_ERRORS), 1);

        // nothing after termination changes the session
        h.recv(json!({"command": "queue_confirmation", "value": true}));
        assert_eq!(h.session.state(), PlayerState::Online);
    }

    #[test]
    fn connect_timeout_fires_when_never_opened() {
        let mut h = Harness::new(SessionConfig::default());
        h.session.begin_connect(h.now);
        h.advance(Duration::from_secs(3));
        assert_eq!(h.session.termination(), Some(&Termination::ConnectTimeout));
        assert_eq!(h.metrics.snapshot().check(names::CHECK_WS_OPENED).fails, 1);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn state_timeout_tears_down_a_stuck_session() {
        let config = SessionConfig {
            state_timeout: Some(Duration::from_secs(5)),
            ..SessionConfig::smoke()
        };
        let mut h = Harness::new(config);
        h.into_room();
        h.advance(Duration::from_secs(5));
        assert_eq!(
            h.session.termination(),
            Some(&Termination::StateTimeout {
                state: PlayerState::InRoom
            })
        );
    }

    #[test]
    fn each_transition_pushes_the_state_timeout_out() {
        let step = Duration::from_millis(800);
        let config = SessionConfig {
            state_timeout: Some(Duration::from_secs(1)),
            ..SessionConfig::smoke()
        };
        let mut h = Harness::new(config);
        h.open();
        h.advance(step);
        h.recv(json!({"command": "connected", "value": {"player_id": ME}}));
        h.advance(step);
        h.recv(json!({"command": "queue_confirmation", "value": true}));
        h.advance(step);
        h.recv(json!({"command": "paired"}));
        h.advance(step);
        h.start_game();
        h.advance(step);
        h.recv(echo(ME, "C7", "D8"));
        h.recv(json!({"command": "turn_switch", "value": THEM}));
        h.advance(step);
        h.recv(echo(THEM, "F2", "E1"));
        h.recv(json!({"command": "turn_switch", "value": ME}));

        // six steps: well past one timeout since open, never one since a transition
        assert!(!h.session.is_terminated(), "{:?}", h.session.termination());
        assert_eq!(h.session.turn_index(), 2);

        h.advance(Duration::from_millis(999));
        assert!(!h.session.is_terminated());
        h.advance(Duration::from_millis(1));
        assert_eq!(
            h.session.termination(),
            Some(&Termination::StateTimeout {
                state: PlayerState::InGame
            })
        );
    }

    #[test]
    fn interrupt_runs_the_normal_teardown() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.into_room();
        h.session.terminate(Termination::Interrupted, h.now);
        assert_eq!(h.session.next_deadline(), None);
        assert_eq!(
            h.sent_commands(),
            vec!["leave_queue", "leave_room", "concede_game"]
        );
        let report = h.session.report().unwrap();
        assert!(!report.passed());
        assert!(report.failed_checks.contains(&Milestone::GameStarted));
        let checks = h.metrics.snapshot();
        assert_eq!(checks.check(names::CHECK_PAIRED).passes, 1);
        assert_eq!(checks.check(names::CHECK_GAME_START).fails, 1);
    }

    #[test]
    fn completed_after_close_delay() {
        let mut h = Harness::new(SessionConfig::smoke());
        h.into_room();
        h.recv(json!({"command": "opponent_ready", "value": {"is_ready": true}}));
        h.recv(json!({"command": "balance_update", "value": 1}));
        h.start_game();
        for (player, from, to, next) in [
            (ME, "C7", "D8", THEM),
            (THEM, "F2", "E1", ME),
            (ME, "C5", "D6", THEM),
            (THEM, "F4", "E3", ME),
        ] {
            h.recv(echo(player, from, to));
            h.recv(json!({"command": "turn_switch", "value": next}));
        }
        h.sent();
        assert!(!h.session.is_terminated());
        h.advance(Duration::from_millis(200));
        let report = h.session.report().unwrap();
        assert_eq!(report.termination, Termination::Completed);
        assert!(report.passed(), "{report}");
        assert_eq!(
            h.sent_commands(),
            vec!["leave_queue", "leave_room", "concede_game"]
        );
    }

    #[test]
    fn keepalive_pings_on_interval() {
        let mut h = Harness::new(SessionConfig::default());
        h.open();
        h.advance(Duration::from_millis(999));
        assert!(h.sent().is_empty());
        h.advance(Duration::from_millis(1));
        assert_eq!(h.sent_commands(), vec!["ping"]);
        h.advance(Duration::from_secs(1));
        assert_eq!(h.sent_commands(), vec!["ping"]);
    }
}
