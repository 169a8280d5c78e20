//! cdx-index: the encrypted inverted index
//!
//! Maps opaque tokens to posting lists of document IDs. Every posting list
//! carries an HMAC tag under `K_indexMac`; the [`IndexStore`] recomputes it
//! on each read and reseals on each write. Backends only persist bytes.
//!
//! Backends:
//! - [`LogBackend`]: one JSON document rewritten per commit
//! - [`TableBackend`]: hash table + fsynced journal + snapshot compaction
//! - `RocksBackend` (feature `rocksdb`)

pub mod backend;
pub mod forward;
pub mod log;
pub mod migrate;
pub mod posting;
#[cfg(feature = "rocksdb")]
pub mod rocks;
pub mod store;
pub mod table;

pub use backend::{backend_path, Backend, BackendOptions, IndexBackend};
pub use log::LogBackend;
pub use migrate::{migrate, MigrationReport};
pub use posting::{IndexSnapshot, PostingList, WriteBatch, WriteOp};
#[cfg(feature = "rocksdb")]
pub use rocks::RocksBackend;
pub use store::{IndexStore, IndexedUpload, VerifyReport};
pub use table::TableBackend;
