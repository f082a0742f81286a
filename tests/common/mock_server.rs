//! In-process game server for integration tests.
//!
//! Speaks just enough of the protocol to drive two players through a game:
//! it pairs queued players in arrival order, relays ready checks, starts the
//! game with seat 0 owning `C7`/`C5` and seat 1 owning `F2`/`F4`, and relays
//! every move as an echo followed by a `turn_switch`. Every envelope it
//! receives is logged for assertions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use duelsim::protocol::{decode, encode, Envelope};
use duelsim::Command;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Knobs for misbehaving servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerBehavior {
    /// Answer this many `queue` requests per connection with `false` first.
    pub queue_declines: usize,
    /// Never pair anyone.
    pub never_pair: bool,
    /// Send `room_failed_ready_check` once both seats are ready.
    pub fail_ready_check: bool,
    /// Close both connections once both seats are ready.
    pub close_before_game_start: bool,
}

/// A received envelope, tagged with the sender's player id.
#[derive(Debug, Clone)]
pub struct Received {
    pub player: String,
    pub envelope: Envelope,
}

enum HubEvent {
    Joined {
        player: String,
        outbox: mpsc::UnboundedSender<Message>,
    },
    Frame {
        player: String,
        envelope: Envelope,
    },
    Left {
        player: String,
    },
}

struct Room {
    seats: [String; 2],
    ready: [bool; 2],
}

impl Room {
    fn seat_of(&self, player: &str) -> Option<usize> {
        self.seats.iter().position(|seat| seat == player)
    }
}

#[derive(Default)]
struct Hub {
    behavior: ServerBehavior,
    outboxes: HashMap<String, mpsc::UnboundedSender<Message>>,
    declines_left: HashMap<String, usize>,
    lobby: Vec<String>,
    rooms: Vec<Room>,
    room_of: HashMap<String, usize>,
}

pub struct MockGameServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Received>>>,
    accept: JoinHandle<()>,
    hub: JoinHandle<()>,
}

impl MockGameServer {
    pub async fn start(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let hub = tokio::spawn(run_hub(behavior, events_rx, Arc::clone(&received)));
        let accept = tokio::spawn(async move {
            let mut next_player = 1u32;
            while let Ok((stream, _)) = listener.accept().await {
                let player = format!("P{next_player}");
                next_player += 1;
                tokio::spawn(serve_connection(stream, player, events_tx.clone()));
            }
        });

        Self {
            addr,
            received,
            accept,
            hub,
        }
    }

    /// `host:port` to put in the bootstrap configuration.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().clone()
    }

    /// Commands received from `player`, in order.
    pub fn commands_from(&self, player: &str) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter(|r| r.player == player)
            .map(|r| r.envelope.command.clone())
            .collect()
    }

    /// Distinct players that sent anything.
    pub fn players(&self) -> Vec<String> {
        let mut players: Vec<String> = self
            .received
            .lock()
            .iter()
            .map(|r| r.player.clone())
            .collect();
        players.sort();
        players.dedup();
        players
    }
}

impl Drop for MockGameServer {
    fn drop(&mut self) {
        self.accept.abort();
        self.hub.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    player: String,
    events: mpsc::UnboundedSender<HubEvent>,
) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let _ = events.send(HubEvent::Joined {
        player: player.clone(),
        outbox,
    });
    while let Some(Ok(message)) = source.next().await {
        let bytes = match &message {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(bytes) => bytes.clone(),
            Message::Close(_) => break,
            _ => continue,
        };
        if let Ok(envelope) = decode(&bytes) {
            let _ = events.send(HubEvent::Frame {
                player: player.clone(),
                envelope,
            });
        }
    }
    let _ = events.send(HubEvent::Left { player });
    writer.abort();
}

async fn run_hub(
    behavior: ServerBehavior,
    mut events: mpsc::UnboundedReceiver<HubEvent>,
    received: Arc<Mutex<Vec<Received>>>,
) {
    let mut hub = Hub {
        behavior,
        ..Hub::default()
    };
    while let Some(event) = events.recv().await {
        match event {
            HubEvent::Joined { player, outbox } => {
                hub.declines_left
                    .insert(player.clone(), behavior.queue_declines);
                hub.outboxes.insert(player.clone(), outbox);
                hub.send(&player, Command::Connected, Some(json!({"player_id": player})));
            },
            HubEvent::Frame { player, envelope } => {
                received.lock().push(Received {
                    player: player.clone(),
                    envelope: envelope.clone(),
                });
                hub.handle(&player, &envelope);
            },
            HubEvent::Left { player } => {
                hub.outboxes.remove(&player);
                hub.lobby.retain(|p| p != &player);
            },
        }
    }
}

fn opening_board(seats: &[String; 2]) -> Value {
    json!({
        "C7": {"type": "pawn", "player_id": seats[0], "piece_id": "w1", "is_kinged": false},
        "C5": {"type": "pawn", "player_id": seats[0], "piece_id": "w2", "is_kinged": false},
        "F2": {"type": "pawn", "player_id": seats[1], "piece_id": "b1", "is_kinged": false},
        "F4": {"type": "pawn", "player_id": seats[1], "piece_id": "b2", "is_kinged": false},
        "D8": null, "E1": null, "D6": null, "E3": null
    })
}

impl Hub {
    fn send(&self, player: &str, command: Command, value: Option<Value>) {
        if let Some(outbox) = self.outboxes.get(player) {
            let text = encode(&Envelope::new(command, value)).unwrap();
            let _ = outbox.send(Message::Text(text));
        }
    }

    fn close(&mut self, player: &str) {
        if let Some(outbox) = self.outboxes.remove(player) {
            let _ = outbox.send(Message::Close(None));
        }
    }

    fn room(&self, player: &str) -> Option<usize> {
        self.room_of.get(player).copied()
    }

    fn handle(&mut self, player: &str, envelope: &Envelope) {
        match envelope.kind() {
            Some(Command::Queue) => self.on_queue(player),
            Some(Command::ReadyQueue) => self.on_ready(player),
            Some(Command::MovePiece) => self.on_move(player, envelope.value.clone()),
            Some(Command::Ping) => self.send(player, Command::Pong, None),
            _ => (),
        }
    }

    fn on_queue(&mut self, player: &str) {
        let declines = self.declines_left.entry(player.to_owned()).or_insert(0);
        if *declines > 0 {
            *declines -= 1;
            self.send(player, Command::QueueConfirmation, Some(json!(false)));
            return;
        }
        self.send(player, Command::QueueConfirmation, Some(json!(true)));
        if self.behavior.never_pair || self.room_of.contains_key(player) {
            return;
        }
        self.lobby.push(player.to_owned());
        if self.lobby.len() >= 2 {
            let first = self.lobby.remove(0);
            let second = self.lobby.remove(0);
            let index = self.rooms.len();
            self.room_of.insert(first.clone(), index);
            self.room_of.insert(second.clone(), index);
            self.rooms.push(Room {
                seats: [first.clone(), second.clone()],
                ready: [false; 2],
            });
            let pairing = json!({"room_id": index, "players": [first, second]});
            self.send(&first, Command::Paired, Some(pairing.clone()));
            self.send(&second, Command::Paired, Some(pairing));
        }
    }

    fn on_ready(&mut self, player: &str) {
        let Some(index) = self.room(player) else {
            return;
        };
        let room = &mut self.rooms[index];
        let Some(seat) = room.seat_of(player) else {
            return;
        };
        room.ready[seat] = true;
        let opponent = room.seats[1 - seat].clone();
        let seats = room.seats.clone();
        let all_ready = room.ready.iter().all(|ready| *ready);

        self.send(&opponent, Command::OpponentReady, Some(json!({"is_ready": true})));
        if !all_ready {
            return;
        }
        if self.behavior.fail_ready_check {
            for seat in &seats {
                self.send(seat, Command::RoomFailedReadyCheck, None);
            }
            return;
        }
        if self.behavior.close_before_game_start {
            for seat in &seats {
                self.close(seat);
            }
            return;
        }
        let start = json!({
            "Board": opening_board(&seats),
            "CurrentPlayerID": seats[0],
            "game_id": format!("game-{index}")
        });
        for seat in &seats {
            self.send(seat, Command::BalanceUpdate, Some(json!(900)));
            self.send(seat, Command::GameStart, Some(start.clone()));
        }
    }

    fn on_move(&mut self, player: &str, value: Option<Value>) {
        let Some(index) = self.room(player) else {
            return;
        };
        let room = &self.rooms[index];
        let Some(seat) = room.seat_of(player) else {
            return;
        };
        let seats = room.seats.clone();
        let next = seats[1 - seat].clone();
        for seat in &seats {
            self.send(seat, Command::MovePiece, value.clone());
            self.send(seat, Command::TurnSwitch, Some(json!(next)));
        }
    }
}
