pub mod persistence;
pub mod registry;

pub use persistence::{FilePersistence, MemoryPersistence, PersistenceProvider};
pub use registry::{DetachOutcome, DocumentState, Registry, SharedDocument};
