//! Search request/response types and the client-side steps of a search:
//! candidate verification, TF-IDF ranking, padding, and pagination.

use cdx_core::DocumentId;
use cdx_crypto::levenshtein;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Pad the response with synthetic IDs up to this many entries, then shuffle
    pub pad_to: Option<usize>,
    pub skip: usize,
    /// Defaults to `search.default_limit`
    pub limit: Option<usize>,
    /// Include a short query-token prefix in the outcome
    pub trace: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub document_ids: Vec<DocumentId>,
    /// Entries before pagination, padding included
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_token: Option<String>,
}

/// True if `needle` occurs inside any of the document's keywords.
pub fn substring_match(terms: &[String], needle: &str) -> bool {
    !needle.is_empty() && terms.iter().any(|t| t.contains(needle))
}

/// True if any keyword is within `max_distance` edits of `query`.
pub fn fuzzy_match(terms: &[String], query: &str, max_distance: usize) -> bool {
    terms.iter().any(|t| levenshtein(t, query) <= max_distance)
}

/// Score documents by summed TF-IDF over `query_terms` and keep the best
/// `top_k`. Order is descending score, then ascending ID.
///
/// `idf = ln((N + 1) / (df + 1)) + 1` with `df` counted over `docs`;
/// `tf = count / len(terms)`.
pub fn rank_tfidf(
    docs: &[(DocumentId, Vec<String>)],
    query_terms: &[String],
    corpus_size: usize,
    top_k: usize,
) -> Vec<(DocumentId, f64)> {
    let n = corpus_size.max(docs.len()) as f64;
    let idf: Vec<f64> = query_terms
        .iter()
        .map(|q| {
            let df = docs.iter().filter(|(_, terms)| terms.contains(q)).count() as f64;
            ((n + 1.0) / (df + 1.0)).ln() + 1.0
        })
        .collect();

    let mut scored: Vec<(DocumentId, f64)> = docs
        .iter()
        .map(|(id, terms)| {
            let score = if terms.is_empty() {
                0.0
            } else {
                let len = terms.len() as f64;
                query_terms
                    .iter()
                    .zip(&idf)
                    .map(|(q, idf)| {
                        let count = terms.iter().filter(|t| *t == q).count() as f64;
                        count / len * idf
                    })
                    .sum()
            };
            (id.clone(), score)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(top_k);
    scored
}

/// Extend `ids` with synthetic IDs up to `pad_to` and shuffle. Real matches
/// are never dropped and never padded below their own count.
pub fn pad_and_shuffle<R: Rng + ?Sized>(
    mut ids: Vec<DocumentId>,
    pad_to: usize,
    rng: &mut R,
) -> Vec<DocumentId> {
    while ids.len() < pad_to {
        ids.push(DocumentId::synthetic());
    }
    ids.shuffle(rng);
    ids
}

/// AND: intersection of every set. OR: union.
pub fn combine(sets: Vec<BTreeSet<DocumentId>>, all: bool) -> BTreeSet<DocumentId> {
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    iter.fold(first, |acc, set| {
        if all {
            acc.intersection(&set).cloned().collect()
        } else {
            acc.union(&set).cloned().collect()
        }
    })
}

/// Apply `skip`/`limit` after padding.
pub fn paginate(ids: Vec<DocumentId>, skip: usize, limit: usize) -> Vec<DocumentId> {
    ids.into_iter().skip(skip).take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(s: &str) -> DocumentId {
        DocumentId::parse(s).unwrap()
    }

    fn terms(s: &str) -> Vec<String> {
        cdx_crypto::tokenize(s)
    }

    #[test]
    fn test_substring_and_fuzzy_match() {
        let t = terms("invoice for March");
        assert!(substring_match(&t, "voice"));
        assert!(!substring_match(&t, "voices"));
        assert!(!substring_match(&t, ""));
        assert!(fuzzy_match(&t, "marhc", 2));
        assert!(fuzzy_match(&t, "marsh", 1));
        assert!(!fuzzy_match(&t, "mark", 1));
    }

    #[test]
    fn test_rank_orders_by_score_then_id() {
        let docs = vec![
            (id("b"), terms("report")),
            (id("a"), terms("report")),
            (id("c"), terms("report report draft summary")),
            (id("d"), terms("quarterly report draft summary")),
        ];
        let ranked = rank_tfidf(&docs, &terms("report"), 10, 10);
        let order: Vec<&str> = ranked.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        assert!(ranked[0].1 > ranked[2].1);
        assert!(ranked[2].1 > ranked[3].1);

        let top = rank_tfidf(&docs, &terms("report"), 10, 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, id("a"));
    }

    #[test]
    fn test_rare_terms_weigh_more() {
        let docs = vec![
            (id("x"), terms("alpha beta")),
            (id("y"), terms("alpha gamma")),
            (id("z"), terms("alpha beta")),
        ];
        let ranked = rank_tfidf(&docs, &terms("alpha gamma"), 3, 3);
        assert_eq!(ranked[0].0, id("y"));
    }

    #[test]
    fn test_combine() {
        let a: BTreeSet<_> = [id("a"), id("b")].into_iter().collect();
        let b: BTreeSet<_> = [id("b"), id("c")].into_iter().collect();
        assert_eq!(combine(vec![a.clone(), b.clone()], true), [id("b")].into_iter().collect());
        assert_eq!(combine(vec![a, b], false).len(), 3);
        assert!(combine(Vec::new(), true).is_empty());
    }

    #[test]
    fn test_paginate() {
        let ids: Vec<_> = ["a", "b", "c", "d"].into_iter().map(id).collect();
        assert_eq!(paginate(ids.clone(), 1, 2), vec![id("b"), id("c")]);
        assert!(paginate(ids, 10, 2).is_empty());
    }

    proptest! {
        #[test]
        fn padding_size_law(real in 0usize..20, pad_to in 0usize..40) {
            let ids: Vec<DocumentId> = (0..real).map(|_| DocumentId::generate()).collect();
            let padded = pad_and_shuffle(ids.clone(), pad_to, &mut rand::thread_rng());
            prop_assert_eq!(padded.len(), pad_to.max(real));
            for id in &ids {
                prop_assert!(padded.contains(id));
            }
            prop_assert_eq!(padded.iter().filter(|d| d.is_synthetic()).count(), pad_to.saturating_sub(real));
        }
    }
}
