//! Pluggable index storage
//!
//! Backends store postings and counters verbatim and apply a
//! [`WriteBatch`] atomically. They never see keys and never verify tags;
//! integrity is checked one layer up, in [`crate::IndexStore`].

use anyhow::Context;
use cdx_core::config::IndexBackendKind;
use cdx_core::{CdxResult, Token};
use std::path::{Path, PathBuf};

use crate::log::LogBackend;
use crate::posting::{IndexSnapshot, PostingList, WriteBatch};
#[cfg(feature = "rocksdb")]
use crate::rocks::RocksBackend;
use crate::table::TableBackend;

/// Storage contract shared by every backend.
///
/// All methods take `&self`; implementations synchronize internally so that
/// reads of different tokens never block each other.
pub trait IndexBackend: Send + Sync {
    fn kind(&self) -> IndexBackendKind;
    /// Raw (unverified) posting list for a token.
    fn get(&self, token: &Token) -> CdxResult<Option<PostingList>>;
    /// Counter value, 0 when absent.
    fn counter(&self, key: &Token) -> CdxResult<u64>;
    /// Apply every op durably and atomically.
    fn commit(&self, batch: WriteBatch) -> CdxResult<()>;
    /// Every token whose posting list contains `doc_id`.
    fn tokens_containing(&self, doc_id: &str) -> CdxResult<Vec<Token>>;
    fn snapshot(&self) -> CdxResult<IndexSnapshot>;
    /// Number of posting lists.
    fn len(&self) -> CdxResult<usize>;
    fn is_empty(&self) -> CdxResult<bool> {
        Ok(self.len()? == 0)
    }
    fn flush(&self) -> CdxResult<()>;
}

/// Tuning shared by backends that need it.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Journal records before the table backend compacts
    pub compact_after: usize,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            compact_after: 1024,
        }
    }
}

/// Where a backend of `kind` lives inside an index directory.
pub fn backend_path(kind: IndexBackendKind, dir: &Path) -> PathBuf {
    match kind {
        IndexBackendKind::Log => dir.join("index.log"),
        IndexBackendKind::Table => dir.join("table"),
        IndexBackendKind::RocksDb => dir.join("rocksdb"),
    }
}

/// Dispatch enum over the compiled-in backends.
pub enum Backend {
    Log(LogBackend),
    Table(TableBackend),
    #[cfg(feature = "rocksdb")]
    Rocks(RocksBackend),
}

impl Backend {
    /// Open (or create) the backend of `kind` inside `dir`.
    pub fn open(kind: IndexBackendKind, dir: &Path, options: &BackendOptions) -> CdxResult<Self> {
        let path = backend_path(kind, dir);
        match kind {
            IndexBackendKind::Log => Ok(Backend::Log(LogBackend::open(&path)?)),
            IndexBackendKind::Table => Ok(Backend::Table(TableBackend::open(
                &path,
                options.compact_after,
            )?)),
            #[cfg(feature = "rocksdb")]
            IndexBackendKind::RocksDb => Ok(Backend::Rocks(RocksBackend::open(&path)?)),
            #[cfg(not(feature = "rocksdb"))]
            IndexBackendKind::RocksDb => Err(cdx_core::CdxError::Config(
                "RocksDB index backend not compiled in (missing 'rocksdb' feature)".into(),
            )),
        }
    }

    /// Whether a backend of `kind` already has data in `dir`.
    pub fn exists(kind: IndexBackendKind, dir: &Path) -> bool {
        backend_path(kind, dir).exists()
    }

    /// Delete whatever a backend of `kind` left in `dir`.
    pub fn discard(kind: IndexBackendKind, dir: &Path) -> CdxResult<()> {
        let path = backend_path(kind, dir);
        if path.is_dir() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("removing stale index: {}", path.display()))?;
        } else if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing stale index: {}", path.display()))?;
        }
        Ok(())
    }

    fn inner(&self) -> &dyn IndexBackend {
        match self {
            Backend::Log(b) => b,
            Backend::Table(b) => b,
            #[cfg(feature = "rocksdb")]
            Backend::Rocks(b) => b,
        }
    }
}

impl IndexBackend for Backend {
    fn kind(&self) -> IndexBackendKind {
        self.inner().kind()
    }

    fn get(&self, token: &Token) -> CdxResult<Option<PostingList>> {
        self.inner().get(token)
    }

    fn counter(&self, key: &Token) -> CdxResult<u64> {
        self.inner().counter(key)
    }

    fn commit(&self, batch: WriteBatch) -> CdxResult<()> {
        self.inner().commit(batch)
    }

    fn tokens_containing(&self, doc_id: &str) -> CdxResult<Vec<Token>> {
        self.inner().tokens_containing(doc_id)
    }

    fn snapshot(&self) -> CdxResult<IndexSnapshot> {
        self.inner().snapshot()
    }

    fn len(&self) -> CdxResult<usize> {
        self.inner().len()
    }

    fn flush(&self) -> CdxResult<()> {
        self.inner().flush()
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Backend({})", self.kind())
    }
}
