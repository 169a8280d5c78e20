//! Keyword normalization and search-token (trapdoor) derivation
//!
//! Every token is `HMAC-SHA256(K_search, tag || 0x00 || input)`:
//!
//! | kind     | tag         | input                         |
//! |----------|-------------|-------------------------------|
//! | exact    | `exact`     | keyword                       |
//! | forward  | `fwd`       | keyword `\|\|` counter (u64 BE) |
//! | n-gram   | `ngram:<n>` | one n-gram                    |
//! | phonetic | `soundex`   | Soundex code                  |
//!
//! All functions normalize their keyword argument first, so upload and
//! query paths cannot disagree on folding.

use cdx_core::{Token, TOKEN_SIZE};
use hmac::Mac;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::keys::SecretKey;
use crate::phonetic::soundex;

const TAG_EXACT: &[u8] = b"exact";
const TAG_FORWARD: &[u8] = b"fwd";
const TAG_SOUNDEX: &[u8] = b"soundex";
const TAG_COUNTER: &[u8] = b"counter";

/// Unicode-fold a string: NFKD, lowercase, drop combining marks. The second
/// decomposition catches lowercase forms that decompose further.
fn fold(text: &str) -> impl Iterator<Item = char> + '_ {
    text.nfkd()
        .flat_map(char::to_lowercase)
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
}

/// Normalize one keyword: fold, then keep only alphanumeric characters.
pub fn normalize_keyword(keyword: &str) -> String {
    fold(keyword).filter(|c| c.is_alphanumeric()).collect()
}

/// Split text into normalized keywords, in order, duplicates kept.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in fold(text).chain(std::iter::once(' ')) {
        if c.is_alphanumeric() {
            current.push(c);
        } else if !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
    }
    out
}

/// Unique normalized keywords, in first-seen order.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// Unique sliding n-grams of a normalized keyword, in order of first
/// appearance. A keyword shorter than `n` is its own single gram.
pub fn ngrams(keyword: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = normalize_keyword(keyword).chars().collect();
    if chars.is_empty() || n == 0 {
        return Vec::new();
    }
    if chars.len() < n {
        return vec![chars.into_iter().collect()];
    }
    let mut seen = std::collections::HashSet::new();
    chars
        .windows(n)
        .map(|w| w.iter().collect::<String>())
        .filter(|g| seen.insert(g.clone()))
        .collect()
}

fn derive(key: &SecretKey, tag: &[u8], parts: &[&[u8]]) -> Token {
    let mut mac = key.hmac();
    mac.update(tag);
    mac.update(&[0u8]);
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; TOKEN_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Token::from_bytes(out)
}

/// Deterministic token: same keyword, same key, same token.
pub fn exact_token(k_search: &SecretKey, keyword: &str) -> Token {
    let kw = normalize_keyword(keyword);
    derive(k_search, TAG_EXACT, &[kw.as_bytes()])
}

/// Counter-bound token. Tokens for different counters are unrelated.
pub fn forward_token(k_search: &SecretKey, keyword: &str, counter: u64) -> Token {
    let kw = normalize_keyword(keyword);
    derive(
        k_search,
        TAG_FORWARD,
        &[kw.as_bytes(), &counter.to_be_bytes()],
    )
}

/// One token per unique n-gram. The width is bound into the tag so grams
/// of different widths never share a token.
pub fn ngram_tokens(k_search: &SecretKey, keyword: &str, n: usize) -> Vec<Token> {
    let tag = format!("ngram:{n}");
    ngrams(keyword, n)
        .iter()
        .map(|g| derive(k_search, tag.as_bytes(), &[g.as_bytes()]))
        .collect()
}

/// Token of the keyword's Soundex code; similar-sounding words collide.
/// `None` if the keyword has no phonetic code.
pub fn phonetic_token(k_search: &SecretKey, keyword: &str) -> Option<Token> {
    let code = soundex(&normalize_keyword(keyword))?;
    Some(derive(k_search, TAG_SOUNDEX, &[code.as_bytes()]))
}

/// Storage key of a keyword's forward-privacy counter, under `K_index`.
pub fn counter_key(k_index: &SecretKey, keyword: &str) -> Token {
    let kw = normalize_keyword(keyword);
    derive(k_index, TAG_COUNTER, &[kw.as_bytes()])
}
