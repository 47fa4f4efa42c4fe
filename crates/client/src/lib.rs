//! Client end of the wikisync relay protocol: one session multiplexing any
//! number of documents over a single socket, with heartbeat and backoff
//! reconnects.

pub mod config;
pub mod dispatch;
pub mod reconnect;
pub mod session;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use session::{ClientSession, SessionEvent};
pub use transport::{spawn, ClientHandle, ConnectTarget};
