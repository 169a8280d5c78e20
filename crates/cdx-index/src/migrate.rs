//! Backend-to-backend migration
//!
//! Copies postings and counters verbatim (tags included, so no key is
//! needed), drops anything the target holds that the source does not, then
//! re-reads the whole target and compares it with the source snapshot.
//! Running it again copies nothing: entries already identical in the target
//! are skipped.

use cdx_core::config::IndexBackendKind;
use cdx_core::{CdxError, CdxResult, Token};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::backend::IndexBackend;
use crate::posting::{IndexSnapshot, WriteBatch};

/// Ops per target commit.
const MIGRATION_CHUNK: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from: IndexBackendKind,
    pub to: IndexBackendKind,
    pub postings_copied: usize,
    pub postings_unchanged: usize,
    /// Stale target postings with no counterpart in the source
    pub postings_removed: usize,
    pub counters_copied: usize,
    pub counters_removed: usize,
    /// Postings confirmed identical in the target after copying
    pub verified: usize,
}

/// Make `to` an exact copy of `from`. Callers must keep writers out of both
/// for the duration.
pub fn migrate(from: &dyn IndexBackend, to: &dyn IndexBackend) -> CdxResult<MigrationReport> {
    let snapshot = from.snapshot()?;
    let stale = to.snapshot()?;
    let mut report = MigrationReport {
        from: from.kind(),
        to: to.kind(),
        postings_copied: 0,
        postings_unchanged: 0,
        postings_removed: 0,
        counters_copied: 0,
        counters_removed: 0,
        verified: 0,
    };

    let mut batch = WriteBatch::new();
    let flush_full = |batch: &mut WriteBatch| -> CdxResult<()> {
        if batch.len() >= MIGRATION_CHUNK {
            to.commit(std::mem::take(batch))?;
        }
        Ok(())
    };

    let live: BTreeSet<Token> = snapshot.postings.iter().map(|p| p.token).collect();
    for posting in stale.postings.iter().filter(|p| !live.contains(&p.token)) {
        batch.delete(posting.token);
        report.postings_removed += 1;
        flush_full(&mut batch)?;
    }
    let live_counters: BTreeSet<Token> = snapshot.counters.iter().map(|(k, _)| *k).collect();
    for (key, _) in stale.counters.iter().filter(|(k, _)| !live_counters.contains(k)) {
        batch.delete_counter(*key);
        report.counters_removed += 1;
        flush_full(&mut batch)?;
    }

    for posting in &snapshot.postings {
        if to.get(&posting.token)?.as_ref() == Some(posting) {
            report.postings_unchanged += 1;
            continue;
        }
        batch.put(posting.clone());
        report.postings_copied += 1;
        flush_full(&mut batch)?;
    }
    for (key, value) in &snapshot.counters {
        if to.counter(key)? != *value {
            batch.set_counter(*key, *value);
            report.counters_copied += 1;
            flush_full(&mut batch)?;
        }
    }
    to.commit(batch)?;
    to.flush()?;

    verify_copy(&snapshot, &to.snapshot()?)?;
    report.verified = snapshot.postings.len();

    tracing::info!(
        from = %report.from,
        to = %report.to,
        copied = report.postings_copied,
        unchanged = report.postings_unchanged,
        removed = report.postings_removed,
        counters = report.counters_copied,
        "index migrated"
    );
    Ok(report)
}

/// The target must hold exactly the source's postings and counters.
fn verify_copy(source: &IndexSnapshot, target: &IndexSnapshot) -> CdxResult<()> {
    let want: BTreeMap<Token, _> = source.postings.iter().map(|p| (p.token, p)).collect();
    let got: BTreeMap<Token, _> = target.postings.iter().map(|p| (p.token, p)).collect();
    for token in want.keys().chain(got.keys()) {
        if want.get(token) != got.get(token) {
            return Err(CdxError::Index(format!(
                "migration verification failed for token {}",
                token.short()
            )));
        }
    }
    let want: BTreeMap<Token, u64> = source.counters.iter().copied().collect();
    let got: BTreeMap<Token, u64> = target.counters.iter().copied().collect();
    for key in want.keys().chain(got.keys()) {
        if want.get(key) != got.get(key) {
            return Err(CdxError::Index(format!(
                "migration verification failed for counter {}",
                key.short()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogBackend;
    use crate::posting::PostingList;
    use crate::table::TableBackend;
    use cdx_core::Token;

    fn seed(log: &LogBackend, n: u8) {
        let mut batch = WriteBatch::new();
        for b in 0..n {
            batch.put(PostingList {
                token: Token::from_bytes([b; 32]),
                doc_ids: [format!("doc{b}")].into_iter().collect(),
                tag: format!("{b:02x}"),
            });
        }
        batch.set_counter(Token::from_bytes([0xee; 32]), 4);
        log.commit(batch).unwrap();
    }

    #[test]
    fn test_migrate_copies_everything() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogBackend::open(&dir.path().join("index.log")).unwrap();
        seed(&log, 20);
        let table = TableBackend::open(&dir.path().join("table"), 8).unwrap();

        let report = migrate(&log, &table).unwrap();
        assert_eq!(report.postings_copied, 20);
        assert_eq!(report.verified, 20);
        assert_eq!(report.counters_copied, 1);
        assert_eq!(log.snapshot().unwrap(), table.snapshot().unwrap());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogBackend::open(&dir.path().join("index.log")).unwrap();
        seed(&log, 5);
        let table = TableBackend::open(&dir.path().join("table"), 1024).unwrap();

        migrate(&log, &table).unwrap();
        let again = migrate(&log, &table).unwrap();
        assert_eq!(again.postings_copied, 0);
        assert_eq!(again.postings_unchanged, 5);
        assert_eq!(again.counters_copied, 0);
        assert_eq!(table.len().unwrap(), 5);
    }

    #[test]
    fn test_migrate_prunes_stale_target_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogBackend::open(&dir.path().join("index.log")).unwrap();
        seed(&log, 3);
        let table = TableBackend::open(&dir.path().join("table"), 1024).unwrap();
        migrate(&log, &table).unwrap();

        // Source loses a posting and its counter after the first copy.
        let mut batch = WriteBatch::new();
        batch.delete(Token::from_bytes([1; 32]));
        batch.delete_counter(Token::from_bytes([0xee; 32]));
        log.commit(batch).unwrap();

        let report = migrate(&log, &table).unwrap();
        assert_eq!(report.postings_removed, 1);
        assert_eq!(report.counters_removed, 1);
        assert!(table.get(&Token::from_bytes([1; 32])).unwrap().is_none());
        assert_eq!(table.counter(&Token::from_bytes([0xee; 32])).unwrap(), 0);
        assert_eq!(log.snapshot().unwrap(), table.snapshot().unwrap());
    }
}
