//! Append/rewrite log backend
//!
//! The whole index is one JSON document, rewritten atomically (temp file,
//! fsync, rename) on every commit. Lookups scan the entry list. Adequate for
//! small indexes; use the table backend beyond a few thousand postings.

use anyhow::Context;
use cdx_core::config::IndexBackendKind;
use cdx_core::error::poisoned;
use cdx_core::{CdxError, CdxResult, Token};
use cdx_crypto::tokens_equal;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::backend::IndexBackend;
use crate::posting::{IndexSnapshot, PostingList, WriteBatch, WriteOp};

const LOG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CounterEntry {
    key: Token,
    value: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogFile {
    version: u32,
    postings: Vec<PostingList>,
    counters: Vec<CounterEntry>,
}

impl LogFile {
    fn position(&self, token: &Token) -> Option<usize> {
        // Full pass with constant-time compares; no early exit on match.
        let mut found = None;
        for (i, p) in self.postings.iter().enumerate() {
            if tokens_equal(&p.token, token) && found.is_none() {
                found = Some(i);
            }
        }
        found
    }

    fn apply(&mut self, batch: WriteBatch) {
        for op in batch.ops {
            match op {
                WriteOp::PutPosting(posting) => match self.position(&posting.token) {
                    Some(i) => self.postings[i] = posting,
                    None => self.postings.push(posting),
                },
                WriteOp::DeletePosting { token } => {
                    if let Some(i) = self.position(&token) {
                        self.postings.swap_remove(i);
                    }
                }
                WriteOp::SetCounter { key, value } => {
                    match self.counters.iter_mut().find(|c| c.key == key) {
                        Some(entry) => entry.value = value,
                        None => self.counters.push(CounterEntry { key, value }),
                    }
                }
                WriteOp::DeleteCounter { key } => self.counters.retain(|c| c.key != key),
            }
        }
    }
}

pub struct LogBackend {
    path: PathBuf,
    state: RwLock<LogFile>,
    /// Serializes whole-file rewrites.
    writer: Mutex<()>,
}

impl LogBackend {
    pub fn open(path: &Path) -> CdxResult<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading index log: {}", path.display()))?;
            let file: LogFile = serde_json::from_str(&content).map_err(|e| {
                tracing::error!(path = %path.display(), "index log is unreadable");
                CdxError::Index(format!("corrupt index log {}: {e}", path.display()))
            })?;
            if file.version != LOG_VERSION {
                return Err(CdxError::Index(format!(
                    "unsupported index log version {}",
                    file.version
                )));
            }
            file
        } else {
            LogFile {
                version: LOG_VERSION,
                ..Default::default()
            }
        };
        tracing::debug!(
            path = %path.display(),
            postings = state.postings.len(),
            "opened log index"
        );
        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, file: &LogFile) -> CdxResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating index dir: {}", parent.display()))?;
        }
        let json = serde_json::to_vec(file)?;

        // Atomic write: write to temp file, fsync, then rename
        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = std::fs::File::create(&tmp_path)
            .with_context(|| format!("creating index temp: {}", tmp_path.display()))?;
        tmp.write_all(&json)
            .with_context(|| format!("writing index temp: {}", tmp_path.display()))?;
        tmp.sync_all()
            .with_context(|| format!("syncing index temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming index log: {}", self.path.display()))?;
        Ok(())
    }
}

impl IndexBackend for LogBackend {
    fn kind(&self) -> IndexBackendKind {
        IndexBackendKind::Log
    }

    fn get(&self, token: &Token) -> CdxResult<Option<PostingList>> {
        let state = self.state.read().map_err(poisoned("index log"))?;
        Ok(state.position(token).map(|i| state.postings[i].clone()))
    }

    fn counter(&self, key: &Token) -> CdxResult<u64> {
        let state = self.state.read().map_err(poisoned("index log"))?;
        Ok(state
            .counters
            .iter()
            .find(|c| c.key == *key)
            .map(|c| c.value)
            .unwrap_or(0))
    }

    fn commit(&self, batch: WriteBatch) -> CdxResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _writer = self.writer.lock().map_err(poisoned("index log writer"))?;
        let mut next = self.state.read().map_err(poisoned("index log"))?.clone();
        next.apply(batch);
        // Durable before visible: a failed write leaves memory unchanged.
        self.write_file(&next)?;
        *self.state.write().map_err(poisoned("index log"))? = next;
        Ok(())
    }

    fn tokens_containing(&self, doc_id: &str) -> CdxResult<Vec<Token>> {
        let state = self.state.read().map_err(poisoned("index log"))?;
        Ok(state
            .postings
            .iter()
            .filter(|p| p.doc_ids.contains(doc_id))
            .map(|p| p.token)
            .collect())
    }

    fn snapshot(&self) -> CdxResult<IndexSnapshot> {
        let state = self.state.read().map_err(poisoned("index log"))?;
        let mut postings = state.postings.clone();
        postings.sort_by(|a, b| a.token.cmp(&b.token));
        let mut counters: Vec<(Token, u64)> =
            state.counters.iter().map(|c| (c.key, c.value)).collect();
        counters.sort();
        Ok(IndexSnapshot { postings, counters })
    }

    fn len(&self) -> CdxResult<usize> {
        Ok(self.state.read().map_err(poisoned("index log"))?.postings.len())
    }

    fn flush(&self) -> CdxResult<()> {
        // Every commit already rewrote the file.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn posting(b: u8, ids: &[&str]) -> PostingList {
        PostingList {
            token: Token::from_bytes([b; 32]),
            doc_ids: ids.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            tag: "00".into(),
        }
    }

    #[test]
    fn test_commit_persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.log");
        {
            let log = LogBackend::open(&path).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(posting(1, &["d1"]));
            batch.put(posting(2, &["d1", "d2"]));
            batch.set_counter(Token::from_bytes([9; 32]), 3);
            log.commit(batch).unwrap();
        }
        let log = LogBackend::open(&path).unwrap();
        assert_eq!(log.len().unwrap(), 2);
        assert_eq!(log.counter(&Token::from_bytes([9; 32])).unwrap(), 3);
        assert_eq!(
            log.get(&Token::from_bytes([2; 32])).unwrap().unwrap().doc_ids.len(),
            2
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_put_replaces_and_delete_removes() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogBackend::open(&dir.path().join("index.log")).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(posting(1, &["d1"]));
        log.commit(batch).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(posting(1, &["d1", "d2"]));
        log.commit(batch).unwrap();
        assert_eq!(log.len().unwrap(), 1);
        assert_eq!(log.tokens_containing("d2").unwrap(), vec![Token::from_bytes([1; 32])]);

        let mut batch = WriteBatch::new();
        batch.delete(Token::from_bytes([1; 32]));
        log.commit(batch).unwrap();
        assert!(log.get(&Token::from_bytes([1; 32])).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.log");
        std::fs::write(&path, b"{\"version\":1,\"postings\":[").unwrap();
        assert!(matches!(LogBackend::open(&path), Err(CdxError::Index(_))));
    }
}
