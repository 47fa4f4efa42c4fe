// wikisync-common: wire protocol, engine adapter and shared types for wikisync

pub mod binding;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod settings;
pub mod types;

pub use error::{AuthFailure, ProtocolError};
pub use types::{ConnectionState, SessionId};
