use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Opaque player identifier assigned by the server.
///
/// The server is not consistent about whether ids are strings or numbers, so
/// both are accepted and normalized to their textual form.
pub type PlayerId = String;

/// The closed set of commands exchanged with the game server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Command {
    // outbound
    Queue,
    LeaveQueue,
    ReadyQueue,
    MovePiece,
    LeaveRoom,
    ConcedeGame,
    Ping,
    // inbound
    Connected,
    QueueConfirmation,
    Paired,
    GameStart,
    BalanceUpdate,
    OpponentReady,
    TurnSwitch,
    RoomFailedReadyCheck,
    Pong,
    // informational, never state-affecting
    GameInfo,
    GameTimer,
    RoomTimer,
    Info,
    Error,
    Invalid,
}

impl Command {
    /// Every known command, in declaration order.
    pub const ALL: [Self; 22] = [
        Self::Queue,
        Self::LeaveQueue,
        Self::ReadyQueue,
        Self::MovePiece,
        Self::LeaveRoom,
        Self::ConcedeGame,
        Self::Ping,
        Self::Connected,
        Self::QueueConfirmation,
        Self::Paired,
        Self::GameStart,
        Self::BalanceUpdate,
        Self::OpponentReady,
        Self::TurnSwitch,
        Self::RoomFailedReadyCheck,
        Self::Pong,
        Self::GameInfo,
        Self::GameTimer,
        Self::RoomTimer,
        Self::Info,
        Self::Error,
        Self::Invalid,
    ];

    /// The command's name on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::LeaveQueue => "leave_queue",
            Self::ReadyQueue => "ready_queue",
            Self::MovePiece => "move_piece",
            Self::LeaveRoom => "leave_room",
            Self::ConcedeGame => "concede_game",
            Self::Ping => "ping",
            Self::Connected => "connected",
            Self::QueueConfirmation => "queue_confirmation",
            Self::Paired => "paired",
            Self::GameStart => "game_start",
            Self::BalanceUpdate => "balance_update",
            Self::OpponentReady => "opponent_ready",
            Self::TurnSwitch => "turn_switch",
            Self::RoomFailedReadyCheck => "room_failed_ready_check",
            Self::Pong => "pong",
            Self::GameInfo => "game_info",
            Self::GameTimer => "game_timer",
            Self::RoomTimer => "room_timer",
            Self::Info => "info",
            Self::Error => "error",
            Self::Invalid => "invalid",
        }
    }

    /// Looks up a command by its wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.as_str() == name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message: a command name plus a command-specific payload.
///
/// The command is kept as received so that unknown commands survive decoding
/// and can be logged; [`Envelope::kind`] maps it onto [`Command`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Envelope {
    /// Creates an envelope. An explicit JSON `null` value is treated as absent.
    #[must_use]
    pub fn new(command: Command, value: Option<Value>) -> Self {
        Self {
            command: command.as_str().to_owned(),
            value: value.filter(|v| !v.is_null()),
        }
    }

    /// The recognized command, if any.
    #[must_use]
    pub fn kind(&self) -> Option<Command> {
        Command::from_wire(&self.command)
    }
}

/// Outbound requests a virtual player can send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Queue { stake: u64 },
    LeaveQueue,
    ReadyQueue { ready: bool },
    MovePiece(MovePayload),
    LeaveRoom,
    ConcedeGame,
    Ping,
}

impl Outbound {
    #[must_use]
    pub const fn command(&self) -> Command {
        match self {
            Self::Queue { .. } => Command::Queue,
            Self::LeaveQueue => Command::LeaveQueue,
            Self::ReadyQueue { .. } => Command::ReadyQueue,
            Self::MovePiece(_) => Command::MovePiece,
            Self::LeaveRoom => Command::LeaveRoom,
            Self::ConcedeGame => Command::ConcedeGame,
            Self::Ping => Command::Ping,
        }
    }

    /// Builds the wire envelope for this request.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        let value = match self {
            Self::Queue { stake } => Some(Value::from(*stake)),
            Self::ReadyQueue { ready } => Some(Value::Bool(*ready)),
            Self::MovePiece(payload) => Some(payload.to_value()),
            Self::LeaveQueue | Self::LeaveRoom | Self::ConcedeGame | Self::Ping => None,
        };
        Envelope::new(self.command(), value)
    }
}

/// Payload of `move_piece`, both as sent and as echoed back by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePayload {
    #[serde(deserialize_with = "id_from_any")]
    pub player_id: PlayerId,
    #[serde(deserialize_with = "id_from_any")]
    pub piece_id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub is_capture: bool,
    #[serde(default)]
    pub is_kinged: bool,
}

impl MovePayload {
    fn to_value(&self) -> Value {
        serde_json::json!({
            "player_id": self.player_id,
            "piece_id": self.piece_id,
            "from": self.from,
            "to": self.to,
            "is_capture": self.is_capture,
            "is_kinged": self.is_kinged,
        })
    }
}

/// Payload of `connected`. Fields other than the player id are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectedPayload {
    #[serde(default, deserialize_with = "opt_id_from_any")]
    pub player_id: Option<PlayerId>,
}

/// A piece standing on a board square.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Piece {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(deserialize_with = "id_from_any")]
    pub player_id: PlayerId,
    #[serde(deserialize_with = "id_from_any")]
    pub piece_id: String,
    #[serde(default)]
    pub is_kinged: bool,
}

/// Board snapshot: every position maps to a piece, or `None` for an empty square.
pub type Board = BTreeMap<String, Option<Piece>>;

/// Payload of `game_start`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct GameStartPayload {
    #[serde(rename = "Board", alias = "board")]
    pub board: Board,
    #[serde(
        default,
        alias = "CurrentPlayerID",
        deserialize_with = "opt_id_from_any"
    )]
    pub current_player_id: Option<PlayerId>,
    #[serde(default, deserialize_with = "opt_id_from_any")]
    pub game_id: Option<String>,
}

/// JavaScript-style truthiness of an optional payload.
///
/// `false`, `null`, `0`, `NaN`-like numbers and the empty string are falsy, as is
/// an absent value. Everything else, including empty arrays and objects, is truthy.
#[must_use]
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(true, |f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

/// Reads an identifier that may be encoded as a string or a number.
#[must_use]
pub fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn id_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    id_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected an id, got {}", value)))
}

fn opt_id_from_any<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_from_value))
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
    use serde_json::json;

    #[test]
    fn wire_names_round_trip() {
        for command in Command::ALL {
            assert_eq!(Command::from_wire(command.as_str()), Some(command));
        }
        assert_eq!(Command::from_wire("teleport"), None);
    }

    #[test]
    fn outbound_envelopes_have_expected_shape() {
        let queue = Outbound::Queue { stake: 100 }.to_envelope();
        assert_eq!(queue.command, "queue");
        assert_eq!(queue.value, Some(json!(100)));

        let leave = Outbound::LeaveRoom.to_envelope();
        assert_eq!(leave.value, None);

        let ready = Outbound::ReadyQueue { ready: true }.to_envelope();
        assert_eq!(ready.value, Some(json!(true)));
    }

    #[test]
    fn move_payload_serializes_all_fields() {
        let envelope = Outbound::MovePiece(MovePayload {
            player_id: "P1".into(),
            piece_id: "7".into(),
            from: "C7".into(),
            to: "D8".into(),
            is_capture: false,
            is_kinged: false,
        })
        .to_envelope();
        assert_eq!(
            envelope.value,
            Some(json!({
                "player_id": "P1",
                "piece_id": "7",
                "from": "C7",
                "to": "D8",
                "is_capture": false,
                "is_kinged": false,
            }))
        );
    }

    #[test]
    fn truthiness_follows_javascript() {
        assert!(!is_truthy(None));
        assert!(!is_truthy(Some(&json!(null))));
        assert!(!is_truthy(Some(&json!(false))));
        assert!(!is_truthy(Some(&json!(0))));
        assert!(!is_truthy(Some(&json!(0.0))));
        assert!(!is_truthy(Some(&json!(""))));
        assert!(is_truthy(Some(&json!(true))));
        assert!(is_truthy(Some(&json!(2))));
        assert!(is_truthy(Some(&json!("no"))));
        assert!(is_truthy(Some(&json!([]))));
        assert!(is_truthy(Some(&json!({}))));
    }

    #[test]
    fn game_start_accepts_either_board_key_and_numeric_ids() {
        let upper: GameStartPayload = serde_json::from_value(json!({
            "Board": {
                "C7": {"type": "pawn", "player_id": 11, "piece_id": 3, "is_kinged": false},
                "D8": null
            },
            "current_player_id": 11,
            "game_id": "g-1",
            "max_timer": 30
        }))
        .unwrap();
        assert_eq!(upper.board["C7"].as_ref().unwrap().player_id, "11");
        assert_eq!(upper.board["D8"], None);
        assert_eq!(upper.current_player_id.as_deref(), Some("11"));

        let lower: GameStartPayload =
            serde_json::from_value(json!({"board": {"A1": null}})).unwrap();
        assert_eq!(lower.board.len(), 1);
        assert_eq!(lower.current_player_id, None);
    }

    #[test]
    fn connected_without_player_id_decodes_to_none() {
        let payload: ConnectedPayload = serde_json::from_value(json!({"foo": 1})).unwrap();
        assert_eq!(payload.player_id, None);
    }

    #[test]
    fn null_value_is_treated_as_absent() {
        let envelope = Envelope::new(Command::Ping, Some(Value::Null));
        assert_eq!(envelope.value, None);
    }
}
