//! RocksDB backend (feature `rocksdb`)
//!
//! Key layout:
//! ```text
//! p:<32-byte token>  → JSON PostingList
//! c:<32-byte key>    → u64 big-endian
//! ```
//! Batches map onto a RocksDB `WriteBatch` written with `sync = true`.

use anyhow::Context;
use cdx_core::config::IndexBackendKind;
use cdx_core::{CdxError, CdxResult, Token};
use std::path::Path;

use crate::backend::IndexBackend;
use crate::posting::{IndexSnapshot, PostingList, WriteBatch, WriteOp};

const POSTING_PREFIX: &[u8] = b"p:";
const COUNTER_PREFIX: &[u8] = b"c:";

fn key(prefix: &[u8], token: &Token) -> Vec<u8> {
    let mut k = Vec::with_capacity(prefix.len() + 32);
    k.extend_from_slice(prefix);
    k.extend_from_slice(token.as_bytes());
    k
}

fn db_err(e: rocksdb::Error) -> CdxError {
    CdxError::Index(format!("RocksDB: {e}"))
}

pub struct RocksBackend {
    db: rocksdb::DB,
}

impl RocksBackend {
    /// Open or create a RocksDB index at the given path.
    pub fn open(path: &Path) -> CdxResult<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);

        let db = rocksdb::DB::open(&opts, path)
            .with_context(|| format!("opening RocksDB: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "opened rocksdb index");
        Ok(Self { db })
    }

    fn scan_postings(&self) -> CdxResult<Vec<PostingList>> {
        let mut out = Vec::new();
        let iter = self.db.prefix_iterator(POSTING_PREFIX);
        for item in iter {
            let (k, v) = item.map_err(db_err)?;
            if !k.starts_with(POSTING_PREFIX) {
                break;
            }
            let posting: PostingList = serde_json::from_slice(&v)
                .map_err(|e| CdxError::Index(format!("corrupt posting record: {e}")))?;
            out.push(posting);
        }
        Ok(out)
    }
}

impl IndexBackend for RocksBackend {
    fn kind(&self) -> IndexBackendKind {
        IndexBackendKind::RocksDb
    }

    fn get(&self, token: &Token) -> CdxResult<Option<PostingList>> {
        match self.db.get(key(POSTING_PREFIX, token)).map_err(db_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                CdxError::Index(format!("corrupt posting record: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    fn counter(&self, k: &Token) -> CdxResult<u64> {
        match self.db.get(key(COUNTER_PREFIX, k)).map_err(db_err)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CdxError::Index("corrupt counter record".into()))?;
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    fn commit(&self, batch: WriteBatch) -> CdxResult<()> {
        let mut wb = rocksdb::WriteBatch::default();
        for op in batch.ops {
            match op {
                WriteOp::PutPosting(posting) => {
                    wb.put(key(POSTING_PREFIX, &posting.token), serde_json::to_vec(&posting)?);
                }
                WriteOp::DeletePosting { token } => wb.delete(key(POSTING_PREFIX, &token)),
                WriteOp::SetCounter { key: k, value } => {
                    wb.put(key(COUNTER_PREFIX, &k), value.to_be_bytes());
                }
                WriteOp::DeleteCounter { key: k } => wb.delete(key(COUNTER_PREFIX, &k)),
            }
        }
        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(wb, &write_opts).map_err(db_err)
    }

    fn tokens_containing(&self, doc_id: &str) -> CdxResult<Vec<Token>> {
        Ok(self
            .scan_postings()?
            .into_iter()
            .filter(|p| p.doc_ids.contains(doc_id))
            .map(|p| p.token)
            .collect())
    }

    fn snapshot(&self) -> CdxResult<IndexSnapshot> {
        let postings = self.scan_postings()?;
        let mut counters = Vec::new();
        for item in self.db.prefix_iterator(COUNTER_PREFIX) {
            let (k, v) = item.map_err(db_err)?;
            if !k.starts_with(COUNTER_PREFIX) {
                break;
            }
            let token = Token::from_slice(&k[COUNTER_PREFIX.len()..])
                .ok_or_else(|| CdxError::Index("corrupt counter key".into()))?;
            let arr: [u8; 8] = v
                .as_ref()
                .try_into()
                .map_err(|_| CdxError::Index("corrupt counter record".into()))?;
            counters.push((token, u64::from_be_bytes(arr)));
        }
        Ok(IndexSnapshot { postings, counters })
    }

    fn len(&self) -> CdxResult<usize> {
        Ok(self.scan_postings()?.len())
    }

    fn flush(&self) -> CdxResult<()> {
        self.db.flush().map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rocks_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = RocksBackend::open(dir.path()).unwrap();
        let posting = PostingList {
            token: Token::from_bytes([4; 32]),
            doc_ids: ["d1".to_string()].into_iter().collect(),
            tag: "ab".into(),
        };
        let mut batch = WriteBatch::new();
        batch.put(posting.clone());
        batch.set_counter(Token::from_bytes([5; 32]), 11);
        db.commit(batch).unwrap();

        assert_eq!(db.get(&posting.token).unwrap(), Some(posting));
        assert_eq!(db.counter(&Token::from_bytes([5; 32])).unwrap(), 11);
        let snap = db.snapshot().unwrap();
        assert_eq!(snap.postings.len(), 1);
        assert_eq!(snap.counters, vec![(Token::from_bytes([5; 32]), 11)]);
    }
}
