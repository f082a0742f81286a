//! Wire protocol spoken with the game server.
//!
//! Every exchange is a JSON envelope `{command, value}`. [`messages`] holds the
//! closed command set and the typed payloads; [`codec`] turns envelopes into
//! text frames and back.

pub mod codec;
pub mod messages;

pub use codec::{decode, decode_payload, encode, CodecError, CodecOperation, CodecResult};
pub use messages::{
    is_truthy, Board, Command, ConnectedPayload, Envelope, GameStartPayload, MovePayload,
    Outbound, Piece, PlayerId,
};
