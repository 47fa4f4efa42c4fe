//! Maps plain field records onto a shared document.
//!
//! Layout inside the document:
//! - root map `titles`: title -> `true` for every live record
//! - root map `tombstones`: title -> deletion time (unix ms)
//! - root map `record:{title}`: string fields other than `text`
//! - root text `record:{title}#text`: the collaborative body

mod text_diff;

pub use text_diff::{splice, TextSplice};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use yrs::{Any, GetString, Map, MapRef, Out, Text, TextRef, Transact};

use crate::engine::YrsEngine;
use crate::types::now_millis;

const TITLES: &str = "titles";
const TOMBSTONES: &str = "tombstones";
const TEXT_FIELD: &str = "text";

/// A titled bag of string fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub title: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Record {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn text(&self) -> &str {
        self.fields.get(TEXT_FIELD).map(String::as_str).unwrap_or_default()
    }
}

/// The host application's plain record storage.
pub trait RecordStore {
    fn load(&self, title: &str) -> Option<Record>;
    fn save(&mut self, record: Record);
    fn delete(&mut self, title: &str);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryRecordStore {
    records: BTreeMap<String, Record>,
}

impl MemoryRecordStore {
    pub fn titles(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }
}

impl RecordStore for MemoryRecordStore {
    fn load(&self, title: &str) -> Option<Record> {
        self.records.get(title).cloned()
    }

    fn save(&mut self, record: Record) {
        self.records.insert(record.title.clone(), record);
    }

    fn delete(&mut self, title: &str) {
        self.records.remove(title);
    }
}

/// Outcome of pushing shared state into a [`RecordStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSync {
    pub saved: Vec<String>,
    pub deleted: Vec<String>,
}

/// Record view over one engine. Mutations return the update to send to peers.
pub struct RecordBinding<'a> {
    engine: &'a YrsEngine,
    titles: MapRef,
    tombstones: MapRef,
}

impl<'a> RecordBinding<'a> {
    pub fn new(engine: &'a YrsEngine) -> Self {
        let doc = engine.doc();
        Self {
            engine,
            titles: doc.get_or_insert_map(TITLES),
            tombstones: doc.get_or_insert_map(TOMBSTONES),
        }
    }

    fn record_roots(&self, title: &str) -> (MapRef, TextRef) {
        let doc = self.engine.doc();
        (
            doc.get_or_insert_map(format!("record:{title}")),
            doc.get_or_insert_text(format!("record:{title}#text")),
        )
    }

    pub fn save(&self, record: &Record) -> Vec<u8> {
        let (fields, text) = self.record_roots(&record.title);
        let current_text = text.get_string(&self.engine.doc().transact());
        let title = record.title.as_str();

        self.engine.transact_local(|txn| {
            self.titles.insert(txn, title, true);
            self.tombstones.remove(txn, title);

            let stale: Vec<String> = fields
                .keys(txn)
                .filter(|key| !record.fields.contains_key(*key))
                .map(str::to_owned)
                .collect();
            for key in stale {
                fields.remove(txn, &key);
            }

            for (name, value) in record.fields.iter().filter(|(name, _)| *name != TEXT_FIELD) {
                let current = fields.get(txn, name).map(|out| out.to_string(txn));
                if current.as_deref() != Some(value.as_str()) {
                    fields.insert(txn, name.as_str(), value.as_str());
                }
            }

            if let Some(op) = splice(&current_text, record.text()) {
                if op.delete_len > 0 {
                    text.remove_range(txn, op.index, op.delete_len);
                }
                if !op.insert.is_empty() {
                    text.insert(txn, op.index, &op.insert);
                }
            }
        })
    }

    pub fn load(&self, title: &str) -> Option<Record> {
        let (fields, text) = self.record_roots(title);
        let txn = self.engine.doc().transact();
        if !self.titles.contains_key(&txn, title) {
            return None;
        }

        let mut record = Record::new(title);
        for (name, value) in fields.iter(&txn) {
            record.fields.insert(name.to_owned(), value.to_string(&txn));
        }
        let body = text.get_string(&txn);
        if !body.is_empty() {
            record.fields.insert(TEXT_FIELD.to_owned(), body);
        }
        Some(record)
    }

    /// Removes the record and leaves a tombstone. Returns `None` if unknown.
    pub fn delete(&self, title: &str) -> Option<Vec<u8>> {
        if !self.titles.contains_key(&self.engine.doc().transact(), title) {
            return None;
        }
        let (fields, text) = self.record_roots(title);

        Some(self.engine.transact_local(|txn| {
            self.titles.remove(txn, title);
            fields.clear(txn);
            let len = text.len(txn);
            if len > 0 {
                text.remove_range(txn, 0, len);
            }
            self.tombstones.insert(txn, title, now_millis() as f64);
        }))
    }

    pub fn titles(&self) -> Vec<String> {
        let txn = self.engine.doc().transact();
        let mut titles: Vec<String> = self.titles.keys(&txn).map(str::to_owned).collect();
        titles.sort();
        titles
    }

    /// Deleted titles with their deletion time in unix ms.
    pub fn tombstones(&self) -> BTreeMap<String, i64> {
        let txn = self.engine.doc().transact();
        self.tombstones
            .iter(&txn)
            .map(|(title, value)| {
                let deleted_at = match value {
                    Out::Any(Any::Number(millis)) => millis as i64,
                    Out::Any(Any::BigInt(millis)) => millis,
                    _ => 0,
                };
                (title.to_owned(), deleted_at)
            })
            .collect()
    }

    /// Brings `store` in line with the shared document.
    pub fn sync_into(&self, store: &mut dyn RecordStore) -> StoreSync {
        let mut outcome = StoreSync::default();
        for title in self.titles() {
            let Some(record) = self.load(&title) else {
                continue;
            };
            if store.load(&title).as_ref() != Some(&record) {
                store.save(record);
                outcome.saved.push(title);
            }
        }
        for title in self.tombstones().into_keys() {
            if store.load(&title).is_some() {
                store.delete(&title);
                outcome.deleted.push(title);
            }
        }
        outcome
    }
}
