//! Posting-list integrity tags
//!
//! ```text
//! tag = HMAC-SHA256(K_indexMac, "posting" || token || Σ (len_be32(id) || id))
//! ```
//! over the document IDs in ascending order. Length-prefixing keeps
//! `{"ab","c"}` and `{"a","bc"}` distinct.

use cdx_core::Token;
use hmac::Mac;
use subtle::ConstantTimeEq;

use crate::keys::{HmacSha256, SecretKey};

const POSTING_DOMAIN: &[u8] = b"posting";

/// MAC over one posting list.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PostingTag(pub [u8; 32]);

impl PostingTag {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PostingTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PostingTag({}..)", hex::encode(&self.0[..4]))
    }
}

fn keyed<I, S>(k_index_mac: &SecretKey, token: &Token, sorted_ids: I) -> HmacSha256
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut mac = k_index_mac.hmac();
    mac.update(POSTING_DOMAIN);
    mac.update(token.as_bytes());
    for id in sorted_ids {
        let bytes = id.as_ref().as_bytes();
        mac.update(&(bytes.len() as u32).to_be_bytes());
        mac.update(bytes);
    }
    mac
}

/// Tag a posting list. `sorted_ids` must be in ascending order (a
/// `BTreeSet` iterates that way).
pub fn posting_tag<I, S>(k_index_mac: &SecretKey, token: &Token, sorted_ids: I) -> PostingTag
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = [0u8; 32];
    out.copy_from_slice(&keyed(k_index_mac, token, sorted_ids).finalize().into_bytes());
    PostingTag(out)
}

/// Constant-time check of a stored tag. A tag of the wrong length fails.
pub fn verify_posting_tag<I, S>(
    k_index_mac: &SecretKey,
    token: &Token,
    sorted_ids: I,
    tag: &[u8],
) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keyed(k_index_mac, token, sorted_ids).verify_slice(tag).is_ok()
}

/// Constant-time token comparison, for scans over untrusted storage.
pub fn tokens_equal(a: &Token, b: &Token) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
