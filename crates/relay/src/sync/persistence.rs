//! Document state at rest.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use tracing::debug;

const SNAPSHOT_FILE_EXT: &str = "ydoc";
const SNAPSHOT_MAGIC: [u8; 4] = *b"WSD1";
const SNAPSHOT_VERSION: u8 = 1;
const SNAPSHOT_HEADER_BYTES: usize = 9;

pub type PersistenceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Loads a document when it is first opened and stores it when the last
/// session leaves.
pub trait PersistenceProvider: Send + Sync {
    /// Stored state for `name`, applied before the document is handed out.
    fn bind_state<'a>(&'a self, name: &'a str) -> PersistenceFuture<'a, Option<Vec<u8>>>;

    /// Called with every update applied from a session, while the document
    /// lock is held. Must not block.
    fn store_update(&self, name: &str, update: &[u8]);

    /// Full state of a document about to be evicted.
    fn write_state<'a>(&'a self, name: &'a str, state: Vec<u8>) -> PersistenceFuture<'a, ()>;
}

/// Snapshot files at `{dir}/{hex(name)}.ydoc`.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| {
            format!("failed to create persistence directory `{}`", dir.display())
        })?;
        Ok(Self { dir })
    }

    pub fn snapshot_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{SNAPSHOT_FILE_EXT}", hex_name(name)))
    }

    fn temp_path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!(".{}.{SNAPSHOT_FILE_EXT}.tmp", hex_name(name)))
    }

    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.snapshot_path(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("failed to read snapshot `{}`", path.display())
                })
            }
        };
        decode_snapshot(&bytes)
            .with_context(|| format!("snapshot `{}` is corrupt", path.display()))
            .map(Some)
    }

    async fn save(&self, name: &str, state: Vec<u8>) -> Result<()> {
        let target_path = self.snapshot_path(name);
        let tmp_path = self.temp_path_for(name);
        let bytes = encode_snapshot(&state)?;

        tokio::fs::write(&tmp_path, &bytes).await.with_context(|| {
            format!("failed to write temp snapshot `{}`", tmp_path.display())
        })?;
        tokio::fs::rename(&tmp_path, &target_path).await.with_context(|| {
            format!(
                "failed to atomically move snapshot `{}` to `{}`",
                tmp_path.display(),
                target_path.display()
            )
        })?;
        debug!(doc = name, bytes = state.len(), path = %target_path.display(), "snapshot written");
        Ok(())
    }
}

impl PersistenceProvider for FilePersistence {
    fn bind_state<'a>(&'a self, name: &'a str) -> PersistenceFuture<'a, Option<Vec<u8>>> {
        Box::pin(self.load(name))
    }

    fn store_update(&self, _name: &str, _update: &[u8]) {}

    fn write_state<'a>(&'a self, name: &'a str, state: Vec<u8>) -> PersistenceFuture<'a, ()> {
        Box::pin(self.save(name, state))
    }
}

fn hex_name(name: &str) -> String {
    name.bytes().map(|byte| format!("{byte:02x}")).collect()
}

fn encode_snapshot(state: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(state.len()).context("snapshot payload exceeds u32::MAX")?;
    let mut bytes = Vec::with_capacity(SNAPSHOT_HEADER_BYTES + state.len());
    bytes.extend_from_slice(&SNAPSHOT_MAGIC);
    bytes.push(SNAPSHOT_VERSION);
    bytes.extend_from_slice(&len.to_le_bytes());
    bytes.extend_from_slice(state);
    Ok(bytes)
}

fn decode_snapshot(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < SNAPSHOT_HEADER_BYTES {
        bail!("truncated header ({} bytes)", bytes.len());
    }
    if bytes[..4] != SNAPSHOT_MAGIC {
        bail!("bad magic");
    }
    if bytes[4] != SNAPSHOT_VERSION {
        bail!("unsupported version {}", bytes[4]);
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[5..9]);
    let len = u32::from_le_bytes(len) as usize;
    let payload = &bytes[SNAPSHOT_HEADER_BYTES..];
    if payload.len() != len {
        bail!("payload length {} does not match header {len}", payload.len());
    }
    Ok(payload.to_vec())
}

/// Keeps states and the update log in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    states: HashMap<String, Vec<u8>>,
    updates: HashMap<String, Vec<Vec<u8>>>,
    writes: usize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(name: impl Into<String>, state: Vec<u8>) -> Self {
        let persistence = Self::default();
        persistence.lock().states.insert(name.into(), state);
        persistence
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().states.get(name).cloned()
    }

    pub fn updates(&self, name: &str) -> Vec<Vec<u8>> {
        self.lock().updates.get(name).cloned().unwrap_or_default()
    }

    /// Number of `write_state` calls so far.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }
}

impl PersistenceProvider for MemoryPersistence {
    fn bind_state<'a>(&'a self, name: &'a str) -> PersistenceFuture<'a, Option<Vec<u8>>> {
        let state = self.state(name);
        Box::pin(async move { Ok(state) })
    }

    fn store_update(&self, name: &str, update: &[u8]) {
        self.lock().updates.entry(name.to_owned()).or_default().push(update.to_vec());
    }

    fn write_state<'a>(&'a self, name: &'a str, state: Vec<u8>) -> PersistenceFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.states.insert(name.to_owned(), state);
            inner.updates.remove(name);
            inner.writes += 1;
            Ok(())
        })
    }
}
