//! faceid-store: Persistence of enrolled faces.
//!
//! Records are kept as a single serialized list inside a string key-value
//! store, backed by SQLite on disk or a map in memory.

pub mod faces;
pub mod kv;

use thiserror::Error;

pub use faces::{FaceStore, FACES_KEY};
pub use kv::{KeyValueStore, MemoryKvStore, SqliteKvStore};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored face collection is corrupt: {0}")]
    Corrupt(serde_json::Error),
    #[error("descriptor contains non-finite values")]
    InvalidDescriptor,
    #[error("failed to serialize face collection: {0}")]
    Serialize(serde_json::Error),
}
