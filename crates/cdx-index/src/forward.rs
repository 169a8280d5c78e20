//! Forward-privacy helpers at keyword level
//!
//! A keyword's counter lives under `counter_key(K_index, keyword)`; epoch
//! `c` postings live under `forward_token(K_search, keyword, c)`. A search
//! must cover every epoch in `0..counter`.

use cdx_core::{CdxResult, DocumentId, Token};
use cdx_crypto::{counter_key, forward_token, KeySet};
use std::collections::BTreeSet;

use crate::store::IndexStore;

/// Number of uploads that have introduced `keyword`.
pub fn current_counter(store: &IndexStore, keys: &KeySet, keyword: &str) -> CdxResult<u64> {
    store.counter(&counter_key(&keys.index, keyword))
}

/// Bump the keyword's counter outside an upload. Returns the new value.
pub fn advance_counter(store: &IndexStore, keys: &KeySet, keyword: &str) -> CdxResult<u64> {
    store.advance_counter(&counter_key(&keys.index, keyword))
}

/// Tokens for epochs `0..counter`.
pub fn forward_search_tokens(keys: &KeySet, keyword: &str, counter: u64) -> Vec<Token> {
    (0..counter)
        .map(|c| forward_token(&keys.search, keyword, c))
        .collect()
}

/// Verified union of every epoch's postings for `keyword`.
pub fn search_forward(
    store: &IndexStore,
    keys: &KeySet,
    keyword: &str,
) -> CdxResult<BTreeSet<DocumentId>> {
    store.lookup_forward(
        &keys.index_mac,
        &counter_key(&keys.index, keyword),
        |c| forward_token(&keys.search, keyword, c),
    )
}

/// Index `doc_id` under the next epoch of each keyword, atomically with the
/// counter increments, alongside any `static_tokens`.
pub fn index_with_forward(
    store: &IndexStore,
    keys: &KeySet,
    doc_id: &DocumentId,
    static_tokens: &[Token],
    keywords: &[String],
) -> CdxResult<crate::store::IndexedUpload> {
    let counter_keys: Vec<Token> = keywords
        .iter()
        .map(|kw| counter_key(&keys.index, kw))
        .collect();
    store.apply_upload(&keys.index_mac, doc_id, static_tokens, &counter_keys, |i, c| {
        forward_token(&keys.search, &keywords[i], c)
    })
}
