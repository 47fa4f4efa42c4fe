use serde_json::Value;
use yrs::sync::{Awareness, AwarenessUpdate};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, StateVector, Transact, TransactionMut, Update};

use super::{AwarenessChange, DocumentEngine, EngineError, UpdateOrigin};

/// v1 encoding of an update without structs or deletions.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

pub fn is_empty_update(update: &[u8]) -> bool {
    update == EMPTY_UPDATE
}

/// A yrs document together with its awareness map.
pub struct YrsEngine {
    awareness: Awareness,
}

impl YrsEngine {
    pub fn new(gc_enabled: bool) -> Self {
        Self::with_options(Options { skip_gc: !gc_enabled, ..Options::default() })
    }

    pub fn with_client_id(client_id: u64) -> Self {
        Self::with_options(Options { client_id, ..Options::default() })
    }

    fn with_options(options: Options) -> Self {
        Self { awareness: Awareness::new(Doc::with_options(options)) }
    }

    pub fn doc(&self) -> &Doc {
        self.awareness.doc()
    }

    pub fn client_id(&self) -> u64 {
        self.awareness.doc().client_id()
    }

    /// Runs a local mutation and returns the update it produced.
    ///
    /// Root types must be resolved before calling, since yrs does not allow
    /// creating them while a transaction is open.
    pub fn transact_local<F>(&self, mutate: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut<'_>),
    {
        let doc = self.doc();
        let before = doc.transact().state_vector();
        {
            let tag = UpdateOrigin::Local.to_string();
            let mut txn = doc.transact_mut_with(tag.as_str());
            mutate(&mut txn);
        }
        doc.transact().encode_diff_v1(&before)
    }

    /// Publishes this process's presence and returns the update to broadcast.
    pub fn set_local_awareness(&self, state: &Value) -> Result<Vec<u8>, EngineError> {
        self.awareness
            .set_local_state(state)
            .map_err(|err| EngineError::Awareness(err.to_string()))?;
        self.encode_awareness_update(&[self.client_id()])
    }

    pub fn clear_local_awareness(&self) -> Result<Vec<u8>, EngineError> {
        self.awareness.clean_local_state();
        self.encode_awareness_update(&[self.client_id()])
    }

    /// Forgets every peer's presence while keeping our own. Local only.
    pub fn clear_remote_awareness(&self) -> Vec<u64> {
        let own = self.client_id();
        let remote: Vec<u64> =
            self.awareness_client_ids().into_iter().filter(|id| *id != own).collect();
        for client_id in &remote {
            self.awareness.remove_state(*client_id);
        }
        remote
    }
}

impl DocumentEngine for YrsEngine {
    fn write_step1(&self) -> Vec<u8> {
        self.doc().transact().state_vector().encode_v1()
    }

    fn write_step2(&self, state_vector: &[u8]) -> Result<Vec<u8>, EngineError> {
        let state_vector = StateVector::decode_v1(state_vector).map_err(|err| {
            EngineError::Decode { what: "state vector", reason: err.to_string() }
        })?;
        Ok(self.doc().transact().encode_diff_v1(&state_vector))
    }

    fn apply_update(&self, update: &[u8], origin: &UpdateOrigin) -> Result<(), EngineError> {
        let update = Update::decode_v1(update)
            .map_err(|err| EngineError::Decode { what: "update", reason: err.to_string() })?;
        let tag = origin.to_string();
        self.doc()
            .transact_mut_with(tag.as_str())
            .apply_update(update)
            .map_err(|err| EngineError::Apply(err.to_string()))
    }

    fn encode_state(&self) -> Vec<u8> {
        self.doc().transact().encode_state_as_update_v1(&StateVector::default())
    }

    fn apply_awareness_update(
        &self,
        update: &[u8],
        _origin: &UpdateOrigin,
    ) -> Result<AwarenessChange, EngineError> {
        let update = AwarenessUpdate::decode_v1(update).map_err(|err| EngineError::Decode {
            what: "awareness update",
            reason: err.to_string(),
        })?;
        let summary = self
            .awareness
            .apply_update_summary(update)
            .map_err(|err| EngineError::Awareness(err.to_string()))?;
        Ok(summary
            .map(|summary| AwarenessChange {
                added: summary.added,
                updated: summary.updated,
                removed: summary.removed,
            })
            .unwrap_or_default())
    }

    fn encode_awareness_update(&self, client_ids: &[u64]) -> Result<Vec<u8>, EngineError> {
        let update = self
            .awareness
            .update_with_clients(client_ids.iter().copied())
            .map_err(|err| EngineError::Awareness(err.to_string()))?;
        Ok(update.encode_v1())
    }

    fn encode_awareness_snapshot(&self) -> Result<Option<Vec<u8>>, EngineError> {
        let client_ids = self.awareness_client_ids();
        if client_ids.is_empty() {
            return Ok(None);
        }
        self.encode_awareness_update(&client_ids).map(Some)
    }

    fn remove_awareness_states(&self, client_ids: &[u64]) -> Result<Option<Vec<u8>>, EngineError> {
        let live = self.awareness_client_ids();
        let removed: Vec<u64> =
            client_ids.iter().copied().filter(|id| live.contains(id)).collect();
        if removed.is_empty() {
            return Ok(None);
        }
        for client_id in &removed {
            self.awareness.remove_state(*client_id);
        }
        self.encode_awareness_update(&removed).map(Some)
    }

    fn awareness_client_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .awareness
            .iter()
            .filter_map(|(client_id, state)| state.data.map(|_| client_id))
            .collect();
        ids.sort_unstable();
        ids
    }
}
