//! Sharded, integrity-checked index store
//!
//! Locking discipline:
//! - Posting lists and counters hash to one of N shards by token; mutations
//!   hold the shard's write lock, lookups its read lock. Multi-shard
//!   mutations lock shards in ascending order.
//! - The backend sits behind its own `RwLock`. Everything except migration
//!   takes it shared; migration takes it exclusively, so readers see either
//!   the old or the new backend, never a mix.
//! - Order is always shards first, then backend.
//!
//! A lookup that finds nothing is only trusted once every stored posting
//! has verified: a posting whose token bytes were altered sits under some
//! other key, and would otherwise turn into a silent miss. The full sweep
//! runs on the first miss after open or migration and is cached once clean.

use cdx_core::config::{expand_tilde, IndexBackendKind, IndexConfig};
use cdx_core::error::poisoned;
use cdx_core::{CdxError, CdxResult, DocumentId, Token};
use cdx_crypto::SecretKey;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use crate::backend::{backend_path, Backend, BackendOptions, IndexBackend};
use crate::migrate::{migrate, MigrationReport};
use crate::posting::{PostingList, WriteBatch};

/// Optimistic attempts before an upload falls back to locking every shard.
const MAX_OPTIMISTIC_ATTEMPTS: usize = 8;

/// What one upload wrote to the index.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexedUpload {
    /// Every token the document now appears under
    pub tokens: Vec<Token>,
    /// Counter epoch consumed per forward keyword, in input order
    pub epochs: Vec<u64>,
}

/// Result of [`IndexStore::verify_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    /// Short hex prefixes of tokens whose tag did not verify
    pub failed: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Remembers that the current backend held no unverifiable postings.
#[derive(Debug, Default)]
struct OrphanAudit {
    clean: AtomicBool,
}

impl OrphanAudit {
    fn reset(&self) {
        self.clean.store(false, Ordering::Release);
    }

    /// `IndexIntegrity` (reported against `token`) if any stored posting
    /// fails its tag. Only a clean result is cached.
    fn check(
        &self,
        backend: &dyn IndexBackend,
        k_index_mac: &SecretKey,
        token: &Token,
    ) -> CdxResult<()> {
        if self.clean.load(Ordering::Acquire) {
            return Ok(());
        }
        let snapshot = backend.snapshot()?;
        if let Some(bad) = snapshot.postings.iter().find(|p| p.verify(k_index_mac).is_err()) {
            error!(
                token = %token.short(),
                unverified = %bad.token.short(),
                "index holds an unverifiable posting, refusing to report a miss"
            );
            return Err(CdxError::IndexIntegrity {
                token_prefix: token.short(),
            });
        }
        self.clean.store(true, Ordering::Release);
        Ok(())
    }
}

pub struct IndexStore {
    dir: PathBuf,
    options: BackendOptions,
    backend: RwLock<Backend>,
    shards: Vec<RwLock<()>>,
    audit: OrphanAudit,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("dir", &self.dir)
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

impl IndexStore {
    pub fn open(
        kind: IndexBackendKind,
        dir: &Path,
        shards: usize,
        options: BackendOptions,
    ) -> CdxResult<Self> {
        let backend = Backend::open(kind, dir, &options)?;
        Ok(Self::with_backend(dir, backend, shards, options))
    }

    fn with_backend(dir: &Path, backend: Backend, shards: usize, options: BackendOptions) -> Self {
        Self {
            dir: dir.to_path_buf(),
            options,
            backend: RwLock::new(backend),
            shards: (0..shards.max(1)).map(|_| RwLock::new(())).collect(),
            audit: OrphanAudit::default(),
        }
    }

    pub fn from_config(config: &IndexConfig) -> CdxResult<Self> {
        Self::open_or_migrate(config)
    }

    /// Open the configured backend. When the table backend is configured but
    /// only a legacy log index exists, migrate it first and keep the log as
    /// `index.log.bak`.
    pub fn open_or_migrate(config: &IndexConfig) -> CdxResult<Self> {
        let dir = expand_tilde(&config.path);
        let options = BackendOptions {
            compact_after: config.compact_after,
        };
        let legacy = backend_path(IndexBackendKind::Log, &dir);
        if config.backend != IndexBackendKind::Log
            && legacy.exists()
            && !Backend::exists(config.backend, &dir)
        {
            info!(
                from = "log",
                to = %config.backend,
                dir = %dir.display(),
                "migrating legacy index"
            );
            let old = Backend::open(IndexBackendKind::Log, &dir, &options)?;
            let new = Backend::open(config.backend, &dir, &options)?;
            migrate(&old, &new)?;
            drop(old);
            let bak = legacy.with_extension("log.bak");
            std::fs::rename(&legacy, &bak)?;
            info!(backup = %bak.display(), "legacy index kept as backup");
            return Ok(Self::with_backend(&dir, new, config.shards, options));
        }
        Self::open(config.backend, &dir, config.shards, options)
    }

    pub fn kind(&self) -> CdxResult<IndexBackendKind> {
        Ok(self.backend.read().map_err(poisoned("index backend"))?.kind())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of posting lists.
    pub fn len(&self) -> CdxResult<usize> {
        self.backend.read().map_err(poisoned("index backend"))?.len()
    }

    pub fn is_empty(&self) -> CdxResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn flush(&self) -> CdxResult<()> {
        self.backend.read().map_err(poisoned("index backend"))?.flush()
    }

    fn shard_of(&self, token: &Token) -> usize {
        token.shard(self.shards.len())
    }

    /// Write-lock a set of shards in ascending order.
    fn lock_shards(&self, shards: &BTreeSet<usize>) -> CdxResult<Vec<RwLockWriteGuard<'_, ()>>> {
        shards
            .iter()
            .map(|&i| self.shards[i].write().map_err(poisoned("index shard")))
            .collect()
    }

    fn lock_all_shards(&self) -> CdxResult<Vec<RwLockWriteGuard<'_, ()>>> {
        let all: BTreeSet<usize> = (0..self.shards.len()).collect();
        self.lock_shards(&all)
    }

    /// Add `doc_id` to one posting list, verifying the existing tag first.
    pub fn insert(&self, k_index_mac: &SecretKey, token: Token, doc_id: &DocumentId) -> CdxResult<()> {
        let _shard = self.shards[self.shard_of(&token)]
            .write()
            .map_err(poisoned("index shard"))?;
        let backend = self.backend.read().map_err(poisoned("index backend"))?;
        let mut batch = WriteBatch::new();
        add_to_posting(&*backend, &self.audit, k_index_mac, token, doc_id, &mut batch)?;
        backend.commit(batch)
    }

    /// Verified document IDs under `token`. An absent token is an empty set;
    /// a tag mismatch is `IndexIntegrity`, and so is a miss while any stored
    /// posting fails its tag.
    pub fn lookup(&self, k_index_mac: &SecretKey, token: &Token) -> CdxResult<BTreeSet<DocumentId>> {
        let _shard = self.shards[self.shard_of(token)]
            .read()
            .map_err(poisoned("index shard"))?;
        let backend = self.backend.read().map_err(poisoned("index backend"))?;
        match load_posting(&*backend, &self.audit, k_index_mac, token)? {
            Some(p) => p.verified_ids(k_index_mac),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Lookup by raw token bytes. Malformed input is indistinguishable from
    /// a token with no postings.
    pub fn lookup_bytes(&self, k_index_mac: &SecretKey, raw: &[u8]) -> CdxResult<BTreeSet<DocumentId>> {
        match Token::from_slice(raw) {
            Some(token) => self.lookup(k_index_mac, &token),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Lookup by hex token, with the same malformed-input rule.
    pub fn lookup_hex(&self, k_index_mac: &SecretKey, hex: &str) -> CdxResult<BTreeSet<DocumentId>> {
        match Token::from_hex(hex) {
            Some(token) => self.lookup(k_index_mac, &token),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Current counter value (0 for unseen keywords).
    pub fn counter(&self, counter_key: &Token) -> CdxResult<u64> {
        let _shard = self.shards[self.shard_of(counter_key)]
            .read()
            .map_err(poisoned("index shard"))?;
        self.backend
            .read()
            .map_err(poisoned("index backend"))?
            .counter(counter_key)
    }

    /// Increment a counter on its own. Returns the new value.
    pub fn advance_counter(&self, counter_key: &Token) -> CdxResult<u64> {
        let _shard = self.shards[self.shard_of(counter_key)]
            .write()
            .map_err(poisoned("index shard"))?;
        let backend = self.backend.read().map_err(poisoned("index backend"))?;
        let next = backend.counter(counter_key)? + 1;
        let mut batch = WriteBatch::new();
        batch.set_counter(*counter_key, next);
        backend.commit(batch)?;
        Ok(next)
    }

    /// Index one uploaded document in a single atomic batch.
    ///
    /// `static_tokens` (exact, n-gram, phonetic) are inserted as-is. For
    /// each `counter_keys[i]` the current epoch `c` is read, the posting for
    /// `forward_token(i, c)` gains `doc_id`, and the counter becomes `c + 1`,
    /// all in the same batch.
    ///
    /// Which shards a forward token lands in depends on the counter, so the
    /// counters are read optimistically, the shards locked, and the counters
    /// re-checked; a concurrent advance retries. After a few collisions every
    /// shard is locked instead.
    pub fn apply_upload<F>(
        &self,
        k_index_mac: &SecretKey,
        doc_id: &DocumentId,
        static_tokens: &[Token],
        counter_keys: &[Token],
        forward_token: F,
    ) -> CdxResult<IndexedUpload>
    where
        F: Fn(usize, u64) -> Token,
    {
        for attempt in 0..MAX_OPTIMISTIC_ATTEMPTS {
            let epochs = {
                let backend = self.backend.read().map_err(poisoned("index backend"))?;
                read_counters(&*backend, counter_keys)?
            };
            let forward: Vec<Token> = epochs
                .iter()
                .enumerate()
                .map(|(i, c)| forward_token(i, *c))
                .collect();

            let shards: BTreeSet<usize> = static_tokens
                .iter()
                .chain(&forward)
                .chain(counter_keys)
                .map(|t| self.shard_of(t))
                .collect();
            let _guards = self.lock_shards(&shards)?;
            let backend = self.backend.read().map_err(poisoned("index backend"))?;

            if read_counters(&*backend, counter_keys)? != epochs {
                debug!(attempt, "counter advanced concurrently, retrying upload");
                continue;
            }
            return commit_upload(
                &*backend,
                &self.audit,
                k_index_mac,
                doc_id,
                static_tokens,
                ForwardEpochs {
                    counter_keys,
                    forward,
                    epochs,
                },
            );
        }

        warn!("upload contention, locking all index shards");
        let _guards = self.lock_all_shards()?;
        let backend = self.backend.read().map_err(poisoned("index backend"))?;
        let epochs = read_counters(&*backend, counter_keys)?;
        let forward = epochs
            .iter()
            .enumerate()
            .map(|(i, c)| forward_token(i, *c))
            .collect();
        commit_upload(
            &*backend,
            &self.audit,
            k_index_mac,
            doc_id,
            static_tokens,
            ForwardEpochs {
                counter_keys,
                forward,
                epochs,
            },
        )
    }

    /// Union of lookups for `token_at(0..counter)`.
    pub fn lookup_forward<F>(
        &self,
        k_index_mac: &SecretKey,
        counter_key: &Token,
        token_at: F,
    ) -> CdxResult<BTreeSet<DocumentId>>
    where
        F: Fn(u64) -> Token,
    {
        let counter = self.counter(counter_key)?;
        let mut out = BTreeSet::new();
        for c in 0..counter {
            out.extend(self.lookup(k_index_mac, &token_at(c))?);
        }
        Ok(out)
    }

    /// Remove `doc_id` from every posting list that holds it. Emptied lists
    /// are deleted. Every touched list is verified first; any mismatch
    /// aborts the whole removal. Returns the number of lists touched.
    pub fn remove(&self, k_index_mac: &SecretKey, doc_id: &DocumentId) -> CdxResult<usize> {
        let tokens = self
            .backend
            .read()
            .map_err(poisoned("index backend"))?
            .tokens_containing(doc_id.as_str())?;
        if tokens.is_empty() {
            return Ok(0);
        }

        let shards: BTreeSet<usize> = tokens.iter().map(|t| self.shard_of(t)).collect();
        let _guards = self.lock_shards(&shards)?;
        let backend = self.backend.read().map_err(poisoned("index backend"))?;

        let mut batch = WriteBatch::new();
        for token in &tokens {
            let Some(posting) = backend.get(token)? else {
                continue;
            };
            posting.verify(k_index_mac)?;
            if !posting.contains(doc_id) {
                continue;
            }
            let mut ids = posting.doc_ids;
            ids.remove(doc_id.as_str());
            if ids.is_empty() {
                batch.delete(*token);
            } else {
                batch.put(PostingList::sealed(k_index_mac, *token, ids));
            }
        }
        let touched = batch.len();
        backend.commit(batch)?;
        debug!(doc_id = %doc_id, postings = touched, "removed document from index");
        Ok(touched)
    }

    /// Verify every posting list. Failures are collected, not returned
    /// as errors, so an audit sees all of them.
    pub fn verify_all(&self, k_index_mac: &SecretKey) -> CdxResult<VerifyReport> {
        let snapshot = self
            .backend
            .read()
            .map_err(poisoned("index backend"))?
            .snapshot()?;
        let mut report = VerifyReport::default();
        for posting in &snapshot.postings {
            report.checked += 1;
            if posting.verify(k_index_mac).is_err() {
                report.failed.push(posting.token.short());
            }
        }
        info!(
            checked = report.checked,
            failed = report.failed.len(),
            "index verification finished"
        );
        Ok(report)
    }

    /// Copy the index into a backend of `kind` and switch to it.
    ///
    /// Holds the backend lock exclusively for the whole copy: writers and
    /// readers wait, then continue against the new backend. Files left by an
    /// earlier migration to `kind` are discarded first, since they predate
    /// every change made since. The old backend's files are left in place.
    pub fn migrate_to(&self, kind: IndexBackendKind) -> CdxResult<MigrationReport> {
        let mut guard = self.backend.write().map_err(poisoned("index backend"))?;
        if guard.kind() == kind {
            return Err(CdxError::Config(format!("index already uses the {kind} backend")));
        }
        if Backend::exists(kind, &self.dir) {
            warn!(backend = %kind, dir = %self.dir.display(), "discarding stale index copy");
            Backend::discard(kind, &self.dir)?;
        }
        let target = Backend::open(kind, &self.dir, &self.options)?;
        let report = migrate(&*guard, &target)?;
        let old = std::mem::replace(&mut *guard, target);
        self.audit.reset();
        drop(guard);
        old.flush()?;
        Ok(report)
    }
}

fn read_counters(backend: &dyn IndexBackend, keys: &[Token]) -> CdxResult<Vec<u64>> {
    keys.iter().map(|k| backend.counter(k)).collect()
}

/// Verified posting under `token`, or `None` once a miss can be trusted.
fn load_posting(
    backend: &dyn IndexBackend,
    audit: &OrphanAudit,
    k_index_mac: &SecretKey,
    token: &Token,
) -> CdxResult<Option<PostingList>> {
    match backend.get(token)? {
        Some(posting) => {
            posting.verify(k_index_mac)?;
            Ok(Some(posting))
        }
        None => {
            audit.check(backend, k_index_mac, token)?;
            Ok(None)
        }
    }
}

fn add_to_posting(
    backend: &dyn IndexBackend,
    audit: &OrphanAudit,
    k_index_mac: &SecretKey,
    token: Token,
    doc_id: &DocumentId,
    batch: &mut WriteBatch,
) -> CdxResult<()> {
    let mut ids = match load_posting(backend, audit, k_index_mac, &token)? {
        Some(existing) => existing.doc_ids,
        None => BTreeSet::new(),
    };
    ids.insert(doc_id.as_str().to_string());
    batch.put(PostingList::sealed(k_index_mac, token, ids));
    Ok(())
}

/// Forward tokens chosen for one upload, and the epochs they consume.
struct ForwardEpochs<'a> {
    counter_keys: &'a [Token],
    forward: Vec<Token>,
    epochs: Vec<u64>,
}

fn commit_upload(
    backend: &dyn IndexBackend,
    audit: &OrphanAudit,
    k_index_mac: &SecretKey,
    doc_id: &DocumentId,
    static_tokens: &[Token],
    ForwardEpochs {
        counter_keys,
        forward,
        epochs,
    }: ForwardEpochs<'_>,
) -> CdxResult<IndexedUpload> {
    // Dedup while keeping first-seen order for the receipt.
    let mut seen = BTreeMap::new();
    for token in static_tokens.iter().chain(&forward) {
        let next = seen.len();
        seen.entry(*token).or_insert(next);
    }
    let mut tokens: Vec<(usize, Token)> = seen.into_iter().map(|(t, i)| (i, t)).collect();
    tokens.sort();
    let tokens: Vec<Token> = tokens.into_iter().map(|(_, t)| t).collect();

    let mut batch = WriteBatch::new();
    for token in &tokens {
        add_to_posting(backend, audit, k_index_mac, *token, doc_id, &mut batch)?;
    }
    for (key, epoch) in counter_keys.iter().zip(&epochs) {
        batch.set_counter(*key, epoch + 1);
    }
    backend.commit(batch)?;
    debug!(doc_id = %doc_id, tokens = tokens.len(), "indexed document");
    Ok(IndexedUpload { tokens, epochs })
}
