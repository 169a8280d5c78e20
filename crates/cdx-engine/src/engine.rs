//! The searchable-encryption engine
//!
//! Request flow: `Received -> Tokenized -> Looked-up -> (Verified) -> Padded
//! -> Returned`. Tokenizing and index work happen synchronously under a
//! [`KeyGuard`]; the guard is never held across an `.await`. Every step
//! after the first re-borrows the keys with [`Vault::keys_at`], so a lock in
//! the middle of a request cancels it with `AuthError::Locked`.

use cdx_core::config::{CdxConfig, IndexBackendKind};
use cdx_core::{CdxError, CdxResult, DocumentId, KeywordCombine, SearchMode, Token};
use cdx_crypto::{
    decrypt_document, decrypt_filename, encrypt_document, encrypt_filename, exact_token,
    extract_keywords, forward_token, ngram_tokens, normalize_keyword, phonetic_token, tokenize,
    FilenamePayload, KeyGuard, KeySet, Vault,
};
use cdx_index::{forward, IndexStore, IndexedUpload, MigrationReport, VerifyReport};
use cdx_storage::S3Credentials;
use opendal::Operator;
use serde::Serialize;
use cdx_core::error::poisoned;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::document::{DocumentRecord, DocumentStore};
use crate::metrics::EngineMetrics;
use crate::search::{
    combine, fuzzy_match, pad_and_shuffle, paginate, rank_tfidf, substring_match, SearchOptions,
    SearchOutcome,
};

/// What an upload stored and which tokens it inserted.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub record: DocumentRecord,
    /// Hex tokens the document is now indexed under
    pub tokens: Vec<String>,
    pub keywords: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub encrypted_filename: FilenamePayload,
    pub size: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentPage {
    pub documents: Vec<DocumentSummary>,
    pub total: usize,
}

/// Holds a document ID for one in-flight upload; released on drop.
struct Reservation<'a> {
    ids: &'a Mutex<HashSet<DocumentId>>,
    id: DocumentId,
}

impl<'a> Reservation<'a> {
    fn claim(ids: &'a Mutex<HashSet<DocumentId>>, id: &DocumentId) -> CdxResult<Self> {
        if !ids.lock().map_err(poisoned("upload reservations"))?.insert(id.clone()) {
            return Err(CdxError::InvalidDocumentId(format!(
                "{id} is already being uploaded"
            )));
        }
        Ok(Self { ids, id: id.clone() })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.remove(&self.id);
        }
    }
}

pub struct Engine {
    vault: Arc<Vault>,
    index: Arc<IndexStore>,
    docs: DocumentStore,
    config: CdxConfig,
    metrics: EngineMetrics,
    /// IDs between their existence check and their write
    uploading: Mutex<HashSet<DocumentId>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("vault", &self.vault)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(vault: Arc<Vault>, index: Arc<IndexStore>, op: Operator, config: CdxConfig) -> Self {
        Self {
            vault,
            index,
            docs: DocumentStore::new(op),
            config,
            metrics: EngineMetrics::default(),
            uploading: Mutex::new(HashSet::new()),
        }
    }

    /// Open the vault header, index, and document store named by `config`.
    pub fn open(config: CdxConfig, credentials: Option<&S3Credentials>) -> CdxResult<Self> {
        config.validate()?;
        let vault = Arc::new(Vault::from_config(&config.vault)?);
        let index = Arc::new(IndexStore::from_config(&config.index)?);
        let op = cdx_storage::build_operator(&config.storage, credentials)?;
        info!(
            index_backend = %config.index.backend,
            storage_backend = ?config.storage.backend,
            "engine opened"
        );
        Ok(Self::new(vault, index, op, config))
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.docs
    }

    pub fn config(&self) -> &CdxConfig {
        &self.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Count integrity failures on their way out.
    fn observe<T>(&self, result: CdxResult<T>) -> CdxResult<T> {
        if let Err(CdxError::IndexIntegrity { token_prefix }) = &result {
            error!(token = %token_prefix, "index integrity failure");
            self.metrics.integrity_failures.inc();
        }
        result
    }

    fn generation(&self) -> CdxResult<u64> {
        Ok(self.vault.keys()?.generation())
    }

    fn keys_at(&self, generation: u64) -> CdxResult<KeyGuard<'_>> {
        self.vault.keys_at(generation)
    }

    // ── Upload ───────────────────────────────────────────────────────────

    /// Encrypt and store a document under a fresh ID, then index it.
    pub async fn upload(&self, plaintext: &[u8], filename: &str) -> CdxResult<UploadReceipt> {
        self.upload_with_id(DocumentId::generate(), plaintext, filename)
            .await
    }

    /// Upload under a caller-chosen ID. An existing ID is rejected, and so
    /// is one another upload in this engine is still writing.
    pub async fn upload_with_id(
        &self,
        id: DocumentId,
        plaintext: &[u8],
        filename: &str,
    ) -> CdxResult<UploadReceipt> {
        if id.is_synthetic() {
            return Err(CdxError::InvalidDocumentId(id.to_string()));
        }
        let generation = self.generation()?;
        let _reservation = Reservation::claim(&self.uploading, &id)?;
        if self.docs.exists(&id).await? {
            return Err(CdxError::InvalidDocumentId(format!("{id} already exists")));
        }

        let (record, keywords, static_tokens) = {
            let keys = self.keys_at(generation)?;
            let body = encrypt_document(&keys.file_enc, &id, plaintext)?;
            let name = encrypt_filename(&keys.filename_enc, &id, filename)?;
            let keywords = extract_keywords(&String::from_utf8_lossy(plaintext));
            let static_tokens = self.static_tokens(&keys, &keywords);
            (DocumentRecord::new(id.clone(), &body, name), keywords, static_tokens)
        };

        self.docs.put(&record).await?;

        let indexed = self.index_document(generation, &id, &keywords, &static_tokens);
        let indexed = match indexed {
            Ok(indexed) => indexed,
            Err(e) => {
                // Leave nothing unindexed behind.
                if let Err(cleanup) = self.docs.delete(&id).await {
                    warn!(doc_id = %id, error = %cleanup, "failed to remove unindexed document");
                }
                return Err(e);
            }
        };

        self.metrics.uploads.inc();
        info!(
            doc_id = %id,
            keywords = keywords.len(),
            tokens = indexed.tokens.len(),
            "uploaded document"
        );
        Ok(UploadReceipt {
            record,
            tokens: indexed.tokens.iter().map(Token::to_hex).collect(),
            keywords: keywords.len(),
        })
    }

    /// N-gram and phonetic tokens for every keyword, plus exact tokens
    /// unless forward privacy is on. A deterministic exact token would let
    /// a past search be matched against every later upload.
    fn static_tokens(&self, keys: &KeySet, keywords: &[String]) -> Vec<Token> {
        let n = self.config.index.substring_n;
        let forward_privacy = self.config.index.forward_privacy;
        let mut tokens = Vec::new();
        for kw in keywords {
            if !forward_privacy {
                tokens.push(exact_token(&keys.search, kw));
            }
            if n > 0 {
                tokens.extend(ngram_tokens(&keys.search, kw, n));
            }
            if self.config.index.phonetic {
                tokens.extend(phonetic_token(&keys.search, kw));
            }
        }
        tokens
    }

    fn index_document(
        &self,
        generation: u64,
        id: &DocumentId,
        keywords: &[String],
        static_tokens: &[Token],
    ) -> CdxResult<IndexedUpload> {
        let keys = self.keys_at(generation)?;
        let forward_keywords: &[String] = if self.config.index.forward_privacy {
            keywords
        } else {
            &[]
        };
        self.observe(forward::index_with_forward(
            &self.index,
            &keys,
            id,
            static_tokens,
            forward_keywords,
        ))
    }

    // ── Search ───────────────────────────────────────────────────────────

    /// Single-query search in one of the five modes.
    ///
    /// Exact, forward, substring and fuzzy take exactly one keyword after
    /// normalization; ranked takes any number and scores their sum. An empty
    /// query matches nothing (and is still padded).
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        options: &SearchOptions,
    ) -> CdxResult<SearchOutcome> {
        let start = Instant::now();
        self.check_query_len(query)?;
        let mode = self.resolve_mode(mode)?;
        let terms = extract_keywords(query);
        if terms.len() > 1 && !matches!(mode, SearchMode::Ranked { .. }) {
            return Err(CdxError::InvalidQuery(format!(
                "{mode} search takes one keyword, got {}",
                terms.len()
            )));
        }
        if terms.len() > self.config.search.max_keywords {
            return Err(CdxError::InvalidQuery(format!(
                "too many keywords (max {})",
                self.config.search.max_keywords
            )));
        }

        let generation = self.generation()?;
        let (candidates, first_token) = if terms.is_empty() {
            (BTreeSet::new(), None)
        } else {
            self.observe(self.lookup_candidates(generation, mode, &terms))?
        };
        debug!(mode = %mode, candidates = candidates.len(), "looked up candidates");

        let ids: Vec<DocumentId> = match mode {
            SearchMode::Exact | SearchMode::Forward => candidates.into_iter().collect(),
            SearchMode::Substring { .. } => {
                let needle = &terms[0];
                self.verify(generation, candidates, |t| substring_match(t, needle))
                    .await?
            }
            SearchMode::Fuzzy { max_distance } => {
                let query = &terms[0];
                self.verify(generation, candidates, |t| fuzzy_match(t, query, max_distance))
                    .await?
            }
            SearchMode::Ranked { top_k } => {
                self.rank(generation, candidates, &terms, top_k).await?
            }
        };

        let outcome = self.finish(ids, options, first_token);
        self.metrics
            .record_search(mode.name(), start.elapsed().as_secs_f64());
        debug!(mode = %mode, total = outcome.total, "search finished");
        Ok(outcome)
    }

    /// Exact-mode lookups for several keywords, combined with AND or OR.
    pub async fn search_keywords(
        &self,
        keywords: &[String],
        combine_with: KeywordCombine,
        options: &SearchOptions,
    ) -> CdxResult<SearchOutcome> {
        let start = Instant::now();
        if keywords.len() > self.config.search.max_keywords {
            return Err(CdxError::InvalidQuery(format!(
                "too many keywords (max {})",
                self.config.search.max_keywords
            )));
        }
        for kw in keywords {
            self.check_query_len(kw)?;
        }
        let terms: Vec<String> = keywords
            .iter()
            .map(|kw| normalize_keyword(kw))
            .filter(|kw| !kw.is_empty())
            .collect();

        let (matched, first_token) = {
            let keys = self.vault.keys()?;
            let mut sets = Vec::with_capacity(terms.len());
            let mut first_token = None;
            for term in &terms {
                let (ids, token) = self.observe(self.keyword_postings(&keys, term))?;
                if let Some(token) = token {
                    first_token.get_or_insert(token);
                }
                sets.push(ids);
            }
            (
                combine(sets, combine_with == KeywordCombine::And),
                first_token,
            )
        };

        let label = match combine_with {
            KeywordCombine::And => "keywords_and",
            KeywordCombine::Or => "keywords_or",
        };
        let outcome = self.finish(matched.into_iter().collect(), options, first_token);
        self.metrics.record_search(label, start.elapsed().as_secs_f64());
        Ok(outcome)
    }

    /// Look up a caller-supplied hex token. A malformed token is an empty
    /// result, indistinguishable from one with no postings.
    pub fn lookup_token(&self, token_hex: &str) -> CdxResult<BTreeSet<DocumentId>> {
        let keys = self.vault.keys()?;
        self.observe(self.index.lookup_hex(&keys.index_mac, token_hex))
    }

    fn check_query_len(&self, query: &str) -> CdxResult<()> {
        let max = self.config.search.max_query_len;
        if query.trim().chars().count() > max {
            return Err(CdxError::InvalidQuery(format!(
                "query too long (max {max} characters)"
            )));
        }
        Ok(())
    }

    /// Validate mode parameters against what the index was built with.
    fn resolve_mode(&self, mode: SearchMode) -> CdxResult<SearchMode> {
        match mode {
            SearchMode::Substring { n } => {
                let indexed = self.config.index.substring_n;
                if n == 0 || n != indexed {
                    return Err(CdxError::InvalidQuery(format!(
                        "substring n must match the indexed n-gram size ({indexed})"
                    )));
                }
            }
            SearchMode::Fuzzy { max_distance } => {
                if !self.config.index.phonetic {
                    return Err(CdxError::InvalidQuery(
                        "fuzzy search needs the phonetic index".into(),
                    ));
                }
                let max = self.config.search.max_edit_distance;
                if max_distance > max {
                    return Err(CdxError::InvalidQuery(format!(
                        "max edit distance is {max}"
                    )));
                }
            }
            SearchMode::Forward if !self.config.index.forward_privacy => {
                return Err(CdxError::InvalidQuery(
                    "forward search needs forward_privacy enabled".into(),
                ));
            }
            SearchMode::Ranked { top_k } => {
                let top_k = top_k.clamp(1, self.config.search.max_top_k);
                return Ok(SearchMode::Ranked { top_k });
            }
            _ => {}
        }
        Ok(mode)
    }

    /// Server-side step: token derivation and posting lookups.
    fn lookup_candidates(
        &self,
        generation: u64,
        mode: SearchMode,
        terms: &[String],
    ) -> CdxResult<(BTreeSet<DocumentId>, Option<Token>)> {
        let keys = self.keys_at(generation)?;
        let kw = &terms[0];
        match mode {
            SearchMode::Exact | SearchMode::Forward => self.keyword_postings(&keys, kw),
            SearchMode::Substring { n } => {
                let tokens = ngram_tokens(&keys.search, kw, n);
                let mut sets = Vec::with_capacity(tokens.len());
                for token in &tokens {
                    sets.push(self.index.lookup(&keys.index_mac, token)?);
                }
                Ok((combine(sets, true), tokens.first().copied()))
            }
            SearchMode::Fuzzy { .. } => match phonetic_token(&keys.search, kw) {
                Some(token) => Ok((self.index.lookup(&keys.index_mac, &token)?, Some(token))),
                None => Ok((BTreeSet::new(), None)),
            },
            SearchMode::Ranked { .. } => {
                let mut ids = BTreeSet::new();
                let mut first = None;
                for term in terms {
                    let (found, token) = self.keyword_postings(&keys, term)?;
                    if let Some(token) = token {
                        first.get_or_insert(token);
                    }
                    ids.extend(found);
                }
                Ok((ids, first))
            }
        }
    }

    /// Whole-keyword postings: the union over every forward epoch when
    /// forward privacy is on, the exact token's list otherwise. The token
    /// returned is the exact token or the latest epoch's.
    fn keyword_postings(
        &self,
        keys: &KeySet,
        keyword: &str,
    ) -> CdxResult<(BTreeSet<DocumentId>, Option<Token>)> {
        if !self.config.index.forward_privacy {
            let token = exact_token(&keys.search, keyword);
            return Ok((self.index.lookup(&keys.index_mac, &token)?, Some(token)));
        }
        let ids = forward::search_forward(&self.index, keys, keyword)?;
        let latest = forward::current_counter(&self.index, keys, keyword)?
            .checked_sub(1)
            .map(|c| forward_token(&keys.search, keyword, c));
        Ok((ids, latest))
    }

    /// Decrypt one candidate into its keyword sequence. `None` when the
    /// candidate has to be dropped: missing ciphertext or failed decryption.
    async fn candidate_terms(
        &self,
        generation: u64,
        id: &DocumentId,
    ) -> CdxResult<Option<Vec<String>>> {
        let record = match self.docs.get(id).await {
            Ok(record) => record,
            Err(CdxError::NotFound(_)) => {
                warn!(doc_id = %id, "indexed document has no ciphertext");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let keys = self.keys_at(generation)?;
        let plaintext = record
            .blob()
            .and_then(|blob| decrypt_document(&keys.file_enc, id, &blob));
        match plaintext {
            Ok(bytes) => Ok(Some(tokenize(&String::from_utf8_lossy(&bytes)))),
            Err(e) if e.is_tamper() => {
                warn!(doc_id = %id, "dropping candidate that failed to decrypt");
                self.metrics.decrypt_failures.inc();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Client-side verification: keep candidates whose plaintext passes
    /// `accept`.
    async fn verify<F>(
        &self,
        generation: u64,
        candidates: BTreeSet<DocumentId>,
        accept: F,
    ) -> CdxResult<Vec<DocumentId>>
    where
        F: Fn(&[String]) -> bool,
    {
        let mut out = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(terms) = self.candidate_terms(generation, &id).await? {
                if accept(&terms) {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    async fn rank(
        &self,
        generation: u64,
        candidates: BTreeSet<DocumentId>,
        query_terms: &[String],
        top_k: usize,
    ) -> CdxResult<Vec<DocumentId>> {
        let mut docs = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(terms) = self.candidate_terms(generation, &id).await? {
                if query_terms.iter().any(|q| terms.contains(q)) {
                    docs.push((id, terms));
                }
            }
        }
        let corpus_size = self.docs.list().await?.len();
        Ok(rank_tfidf(&docs, query_terms, corpus_size, top_k)
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Pad, then paginate.
    fn finish(
        &self,
        mut ids: Vec<DocumentId>,
        options: &SearchOptions,
        first_token: Option<Token>,
    ) -> SearchOutcome {
        if let Some(pad_to) = options.pad_to {
            ids = pad_and_shuffle(ids, pad_to, &mut rand::thread_rng());
        }
        let total = ids.len();
        let limit = options.limit.unwrap_or(self.config.search.default_limit);
        SearchOutcome {
            document_ids: paginate(ids, options.skip, limit),
            total,
            query_token: first_token.filter(|_| options.trace).map(|t| t.short()),
        }
    }

    // ── Retrieval ────────────────────────────────────────────────────────

    /// The stored ciphertext record. No key is needed.
    pub async fn fetch(&self, id: &DocumentId) -> CdxResult<DocumentRecord> {
        self.docs.get(id).await
    }

    /// Fetch and decrypt a document body. A tag mismatch is `AuthFailure`.
    pub async fn decrypt(&self, id: &DocumentId) -> CdxResult<Vec<u8>> {
        let generation = self.generation()?;
        let record = self.docs.get(id).await?;
        let keys = self.keys_at(generation)?;
        decrypt_document(&keys.file_enc, id, &record.blob()?)
    }

    pub async fn decrypt_filename(&self, id: &DocumentId) -> CdxResult<String> {
        let generation = self.generation()?;
        let record = self.docs.get(id).await?;
        let keys = self.keys_at(generation)?;
        decrypt_filename(&keys.filename_enc, id, &record.encrypted_filename)
    }

    /// Remove a document's postings, then its ciphertext. Returns the
    /// number of posting lists touched.
    pub async fn delete(&self, id: &DocumentId) -> CdxResult<usize> {
        let generation = self.generation()?;
        if !self.docs.exists(id).await? {
            return Err(CdxError::NotFound(id.clone()));
        }
        let touched = {
            let keys = self.keys_at(generation)?;
            self.observe(self.index.remove(&keys.index_mac, id))?
        };
        self.docs.delete(id).await?;
        info!(doc_id = %id, postings = touched, "deleted document");
        Ok(touched)
    }

    /// Stored documents, sorted by ID, with their encrypted filenames.
    pub async fn list_documents(&self, skip: usize, limit: usize) -> CdxResult<DocumentPage> {
        let ids = self.docs.list().await?;
        let total = ids.len();
        let mut documents = Vec::new();
        for id in ids.into_iter().skip(skip).take(limit) {
            let record = self.docs.get(&id).await?;
            documents.push(DocumentSummary {
                size: record.ciphertext_len(),
                encrypted_filename: record.encrypted_filename,
                id,
            });
        }
        Ok(DocumentPage { documents, total })
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Switch the index to another backend. Blocks index access meanwhile.
    pub fn migrate_index(&self, to: IndexBackendKind) -> CdxResult<MigrationReport> {
        let report = self.index.migrate_to(to)?;
        info!(
            from = %report.from,
            to = %report.to,
            copied = report.postings_copied,
            "index migrated"
        );
        Ok(report)
    }

    /// Audit every posting list's tag.
    pub fn verify_index(&self) -> CdxResult<VerifyReport> {
        let keys = self.vault.keys()?;
        let report = self.index.verify_all(&keys.index_mac)?;
        if !report.is_ok() {
            error!(failed = report.failed.len(), "index verification found tampered postings");
            self.metrics
                .integrity_failures
                .inc_by(report.failed.len() as u64);
        }
        Ok(report)
    }

    pub async fn check_storage(&self) -> CdxResult<()> {
        cdx_storage::check_health(self.docs.operator()).await
    }
}
