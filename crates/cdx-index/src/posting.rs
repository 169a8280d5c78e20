//! Posting lists and atomic write batches

use cdx_core::{CdxError, CdxResult, DocumentId, Token};
use cdx_crypto::{posting_tag, verify_posting_tag, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Document IDs under one token, with their integrity tag.
///
/// IDs and tag are kept as raw strings: a posting read back from storage is
/// untrusted until [`PostingList::verify`] succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingList {
    pub token: Token,
    pub doc_ids: BTreeSet<String>,
    /// Hex HMAC over token and sorted IDs
    pub tag: String,
}

impl PostingList {
    pub fn sealed(k_index_mac: &SecretKey, token: Token, doc_ids: BTreeSet<String>) -> Self {
        let tag = posting_tag(k_index_mac, &token, &doc_ids).to_hex();
        Self {
            token,
            doc_ids,
            tag,
        }
    }

    /// Recompute and compare the tag in constant time.
    pub fn verify(&self, k_index_mac: &SecretKey) -> CdxResult<()> {
        let ok = hex::decode(&self.tag)
            .map(|tag| verify_posting_tag(k_index_mac, &self.token, &self.doc_ids, &tag))
            .unwrap_or(false);
        if !ok {
            tracing::error!(token = %self.token.short(), "posting list failed integrity check");
            return Err(CdxError::IndexIntegrity {
                token_prefix: self.token.short(),
            });
        }
        Ok(())
    }

    /// Verified document IDs.
    pub fn verified_ids(&self, k_index_mac: &SecretKey) -> CdxResult<BTreeSet<DocumentId>> {
        self.verify(k_index_mac)?;
        self.doc_ids
            .iter()
            .map(|id| {
                DocumentId::try_from(id.clone()).map_err(|_| CdxError::IndexIntegrity {
                    token_prefix: self.token.short(),
                })
            })
            .collect()
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.doc_ids.contains(id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }
}

/// One mutation inside a [`WriteBatch`]. Every op carries absolute state,
/// so replaying a batch twice yields the same index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    PutPosting(PostingList),
    DeletePosting { token: Token },
    SetCounter { key: Token, value: u64 },
    DeleteCounter { key: Token },
}

/// Mutations that become durable together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, posting: PostingList) {
        self.ops.push(WriteOp::PutPosting(posting));
    }

    pub fn delete(&mut self, token: Token) {
        self.ops.push(WriteOp::DeletePosting { token });
    }

    pub fn set_counter(&mut self, key: Token, value: u64) {
        self.ops.push(WriteOp::SetCounter { key, value });
    }

    pub fn delete_counter(&mut self, key: Token) {
        self.ops.push(WriteOp::DeleteCounter { key });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Full copy of a backend's contents, sorted by token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub postings: Vec<PostingList>,
    pub counters: Vec<(Token, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SecretKey {
        SecretKey::from_bytes([0x11; 32])
    }

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sealed_posting_verifies() {
        let p = PostingList::sealed(&key(), Token::from_bytes([1; 32]), ids(&["a1", "b2"]));
        let verified = p.verified_ids(&key()).unwrap();
        assert_eq!(verified.len(), 2);
        assert!(p.contains(&DocumentId::parse("a1").unwrap()));
    }

    #[test]
    fn test_tampered_posting_is_integrity_error() {
        let mut p = PostingList::sealed(&key(), Token::from_bytes([1; 32]), ids(&["a1"]));
        p.doc_ids.insert("evil".into());
        assert!(matches!(
            p.verify(&key()),
            Err(CdxError::IndexIntegrity { .. })
        ));

        let mut p = PostingList::sealed(&key(), Token::from_bytes([1; 32]), ids(&["a1"]));
        p.tag = "not hex".into();
        assert!(p.verify(&key()).is_err());
    }

    #[test]
    fn test_write_op_serde_shape() {
        let mut batch = WriteBatch::new();
        batch.set_counter(Token::from_bytes([2; 32]), 7);
        batch.delete(Token::from_bytes([3; 32]));
        let json = serde_json::to_string(&batch).unwrap();
        assert!(json.contains(r#""op":"set_counter""#));
        assert!(json.contains(r#""op":"delete_posting""#));
        let back: WriteBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, batch);
    }
}
