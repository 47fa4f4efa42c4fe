//! Narrow interface over the CRDT engine.
//!
//! The protocol layer never inspects document contents. It moves state
//! vectors, updates and awareness payloads between peers through
//! [`DocumentEngine`], which [`YrsEngine`] implements on top of `yrs`.

mod origin;
mod yrs_engine;

pub use origin::UpdateOrigin;
pub use yrs_engine::{is_empty_update, YrsEngine};

use thiserror::Error;

use crate::protocol::{Message, SyncMessage};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("awareness state error: {0}")]
    Awareness(String),
}

/// Awareness clients touched by an applied awareness update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn changed(&self) -> Vec<u64> {
        self.added.iter().chain(&self.updated).chain(&self.removed).copied().collect()
    }
}

pub trait DocumentEngine: Send + Sync {
    /// Encoded state vector (sync step 1 body).
    fn write_step1(&self) -> Vec<u8>;

    /// Update covering everything missing from `state_vector` (sync step 2 body).
    fn write_step2(&self, state_vector: &[u8]) -> Result<Vec<u8>, EngineError>;

    /// Applies a remote update. Undecodable bytes leave the document untouched.
    fn apply_update(&self, update: &[u8], origin: &UpdateOrigin) -> Result<(), EngineError>;

    /// Full document state as a single update.
    fn encode_state(&self) -> Vec<u8>;

    fn apply_awareness_update(
        &self,
        update: &[u8],
        origin: &UpdateOrigin,
    ) -> Result<AwarenessChange, EngineError>;

    fn encode_awareness_update(&self, client_ids: &[u64]) -> Result<Vec<u8>, EngineError>;

    /// All known awareness states, or `None` when nobody is present.
    fn encode_awareness_snapshot(&self) -> Result<Option<Vec<u8>>, EngineError>;

    /// Drops the given clients and returns the update announcing their removal.
    fn remove_awareness_states(&self, client_ids: &[u64]) -> Result<Option<Vec<u8>>, EngineError>;

    /// Clients with a live awareness state.
    fn awareness_client_ids(&self) -> Vec<u64>;
}

/// Handles one sync sub-message. Step 1 yields the step 2 reply without
/// touching local state; step 2 and updates are applied under `origin`.
pub fn read_sync_message(
    engine: &dyn DocumentEngine,
    message: &SyncMessage,
    origin: &UpdateOrigin,
) -> Result<Option<Message>, EngineError> {
    match message {
        SyncMessage::Step1(state_vector) => {
            let update = engine.write_step2(state_vector)?;
            Ok(Some(Message::Sync(SyncMessage::Step2(update))))
        }
        SyncMessage::Step2(update) | SyncMessage::Update(update) => {
            engine.apply_update(update, origin)?;
            Ok(None)
        }
    }
}
