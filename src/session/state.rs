//! Player lifecycle states and the ways a session can end.
//!
//! # State Machine Diagram
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                   Virtual Player State Machine                       │
//! │                                                                      │
//! │  ┌─────────┐  connection open  ┌────────┐ connected: send queue      │
//! │  │ Offline │──────────────────►│ Online │◄──────────┐                │
//! │  └─────────┘                   └───┬────┘  queue_confirmation(falsy) │
//! │                                    │       re-sends queue            │
//! │              queue_confirmation    │                                 │
//! │                       (truthy)     ▼                                 │
//! │                              ┌──────────┐                            │
//! │                              │ InQueue  │                            │
//! │                              └────┬─────┘                            │
//! │                            paired │ send ready_queue after delay     │
//! │                                   ▼                                  │
//! │                              ┌──────────┐                            │
//! │                              │  InRoom  │                            │
//! │                              └────┬─────┘                            │
//! │                        game_start │ store board, maybe move          │
//! │                                   ▼                                  │
//! │                              ┌──────────┐ move_piece / turn_switch   │
//! │                              │  InGame  │◄──────────┐                │
//! │                              └──────────┘───────────┘                │
//! │                                                                      │
//! │  any state: hard timeout, state timeout, peer close, transport       │
//! │  error, room_failed_ready_check, interrupt ──► terminal (clean up)   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! States only ever move forward. Termination is not a state of its own: a
//! session that terminated keeps the state it reached, which is what the
//! end-of-session report shows.

use std::fmt;

use serde::Serialize;

/// Protocol phase of one virtual player.
///
/// The derived ordering follows protocol progress, so `state >= InRoom` reads
/// as "has been paired".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    /// No connection yet.
    Offline,
    /// Connection open; the queue request may or may not have been accepted yet.
    Online,
    /// The server accepted the queue request.
    InQueue,
    /// Paired with an opponent; readiness handshake in progress.
    InRoom,
    /// Game running. Moves and turn switches are exchanged here.
    InGame,
}

impl PlayerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::Online => "ONLINE",
            Self::InQueue => "IN_QUEUE",
            Self::InRoom => "IN_ROOM",
            Self::InGame => "IN_GAME",
        }
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// The whole script was played and the close-after-script delay elapsed.
    Completed,
    /// The hard session timeout fired.
    HardTimeout,
    /// No transition happened within the per-state timeout.
    StateTimeout { state: PlayerState },
    /// The connection never opened within the connect timeout.
    ConnectTimeout,
    /// The server closed the connection.
    PeerClosed,
    /// The connection failed.
    TransportError { context: String },
    /// The server reported that the room failed its ready check.
    RoomFailedReadyCheck,
    /// The bootstrap call failed; the state machine never started.
    BootstrapFailed { context: String },
    /// The run stopped this session early (max duration or ramp-down grace).
    Interrupted,
}

impl Termination {
    /// Label used for the `reason` tag of the terminations counter.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::HardTimeout => "hard_timeout",
            Self::StateTimeout { .. } => "state_timeout",
            Self::ConnectTimeout => "connect_timeout",
            Self::PeerClosed => "peer_closed",
            Self::TransportError { .. } => "transport_error",
            Self::RoomFailedReadyCheck => "room_failed_ready_check",
            Self::BootstrapFailed { .. } => "bootstrap_failed",
            Self::Interrupted => "interrupted",
        }
    }

    /// Terminations that fail the iteration regardless of milestone checks.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RoomFailedReadyCheck
                | Self::TransportError { .. }
                | Self::ConnectTimeout
                | Self::BootstrapFailed { .. }
                | Self::Interrupted
        )
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateTimeout { state } => write!(f, "state_timeout in {}", state),
            Self::TransportError { context } => write!(f, "transport_error: {}", context),
            Self::BootstrapFailed { context } => write!(f, "bootstrap_failed: {}", context),
            other => f.write_str(other.label()),
        }
    }
}
