// Binary wire protocol: lib0 primitives, envelope framing and inner messages.

pub mod envelope;
pub mod lib0;
pub mod message;

pub use envelope::{
    decode_envelope, encode_envelope, encode_frame, encode_raw_envelope, resolve_doc_name, Envelope,
};
pub use message::{HandshakePayload, Heartbeat, Message, SyncMessage};
