//! Integrity, migration and concurrency tests against real backends.

use cdx_core::config::{IndexBackendKind, IndexConfig};
use cdx_core::{CdxError, DocumentId, Token};
use cdx_crypto::{exact_token, KeySet, MasterKey};
use cdx_index::forward::{current_counter, index_with_forward, search_forward};
use cdx_index::{backend_path, BackendOptions, IndexStore};
use std::path::Path;
use std::sync::Arc;

fn keys() -> KeySet {
    KeySet::derive(&MasterKey::from_bytes([0x5e; 32])).unwrap()
}

fn open(kind: IndexBackendKind, dir: &Path) -> IndexStore {
    IndexStore::open(kind, dir, 32, BackendOptions::default()).unwrap()
}

/// Same string with its first character changed.
fn forge(original: &str) -> String {
    let first = if original.starts_with('a') { "b" } else { "a" };
    format!("{first}{}", &original[1..])
}

/// Replace `original` with a one-character variant in every file under
/// `path`.
fn tamper(path: &Path, original: &str) {
    let files: Vec<_> = if path.is_dir() {
        std::fs::read_dir(path)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    } else {
        vec![path.to_path_buf()]
    };
    let forged = forge(original);
    let mut changed = false;
    for file in files {
        let content = std::fs::read_to_string(&file).unwrap();
        if content.contains(original) {
            std::fs::write(&file, content.replace(original, &forged)).unwrap();
            changed = true;
        }
    }
    assert!(changed, "{original} not found in persisted index");
}

/// Persist one posting, let `corrupt` edit the files, then reopen.
fn assert_tamper_detected(
    kind: IndexBackendKind,
    corrupt: impl FnOnce(&Path, &Token, &DocumentId),
) {
    let dir = tempfile::tempdir().unwrap();
    let keys = keys();
    let token = exact_token(&keys.search, "invoice");
    let d1 = DocumentId::generate();
    {
        let store = open(kind, dir.path());
        store.insert(&keys.index_mac, token, &d1).unwrap();
        store.flush().unwrap();
    }

    corrupt(&backend_path(kind, dir.path()), &token, &d1);

    let store = open(kind, dir.path());
    let err = store.lookup(&keys.index_mac, &token).unwrap_err();
    assert!(matches!(err, CdxError::IndexIntegrity { .. }), "{err:?}");
    assert!(!store.verify_all(&keys.index_mac).unwrap().is_ok());
}

fn flip_doc_id(path: &Path, _: &Token, id: &DocumentId) {
    tamper(path, id.as_str());
}

fn flip_token(path: &Path, token: &Token, _: &DocumentId) {
    tamper(path, &token.to_hex());
}

#[test]
fn tampered_log_posting_fails_lookup() {
    assert_tamper_detected(IndexBackendKind::Log, flip_doc_id);
}

#[test]
fn tampered_table_posting_fails_lookup() {
    assert_tamper_detected(IndexBackendKind::Table, flip_doc_id);
}

#[test]
fn rekeyed_log_posting_fails_lookup() {
    assert_tamper_detected(IndexBackendKind::Log, flip_token);
}

#[test]
fn rekeyed_table_posting_fails_lookup() {
    assert_tamper_detected(IndexBackendKind::Table, flip_token);
}

#[test]
fn rekeyed_posting_blocks_inserts_under_its_token() {
    let dir = tempfile::tempdir().unwrap();
    let keys = keys();
    let token = exact_token(&keys.search, "invoice");
    {
        let store = open(IndexBackendKind::Log, dir.path());
        store
            .insert(&keys.index_mac, token, &DocumentId::generate())
            .unwrap();
    }
    tamper(&backend_path(IndexBackendKind::Log, dir.path()), &token.to_hex());

    // Writing a fresh posting would silently drop the original documents.
    let store = open(IndexBackendKind::Log, dir.path());
    let err = store
        .insert(&keys.index_mac, token, &DocumentId::generate())
        .unwrap_err();
    assert!(matches!(err, CdxError::IndexIntegrity { .. }), "{err:?}");
}

#[test]
fn migration_round_trip_keeps_deletions() {
    let dir = tempfile::tempdir().unwrap();
    let keys = keys();
    let store = open(IndexBackendKind::Log, dir.path());
    let token = exact_token(&keys.search, "invoice");
    let d1 = DocumentId::generate();
    store.insert(&keys.index_mac, token, &d1).unwrap();
    index_with_forward(&store, &keys, &d1, &[], &["invoice".to_string()]).unwrap();

    store.migrate_to(IndexBackendKind::Table).unwrap();
    store.remove(&keys.index_mac, &d1).unwrap();
    let before = store.lookup(&keys.index_mac, &token).unwrap();
    assert!(before.is_empty());

    // The log file from before the first migration still holds d1.
    store.migrate_to(IndexBackendKind::Log).unwrap();
    assert_eq!(store.lookup(&keys.index_mac, &token).unwrap(), before);
    assert!(search_forward(&store, &keys, "invoice").unwrap().is_empty());

    store.migrate_to(IndexBackendKind::Table).unwrap();
    assert!(store.lookup(&keys.index_mac, &token).unwrap().is_empty());
    assert_eq!(store.len().unwrap(), 0);
    assert!(store.verify_all(&keys.index_mac).unwrap().is_ok());
}

#[test]
fn migration_preserves_every_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let keys = keys();
    let store = open(IndexBackendKind::Log, dir.path());
    let words = ["invoice", "march", "quarterly", "report", "budget"];
    let mut docs = Vec::new();
    for i in 0..12 {
        let d = DocumentId::generate();
        let statics: Vec<_> = words
            .iter()
            .skip(i % 3)
            .map(|w| exact_token(&keys.search, w))
            .collect();
        let kws: Vec<String> = words.iter().take(2).map(|w| w.to_string()).collect();
        index_with_forward(&store, &keys, &d, &statics, &kws).unwrap();
        docs.push(d);
    }

    let before: Vec<_> = words
        .iter()
        .map(|w| store.lookup(&keys.index_mac, &exact_token(&keys.search, w)).unwrap())
        .collect();
    let fwd_before = search_forward(&store, &keys, "invoice").unwrap();
    assert_eq!(fwd_before.len(), 12);

    store.migrate_to(IndexBackendKind::Table).unwrap();

    let after: Vec<_> = words
        .iter()
        .map(|w| store.lookup(&keys.index_mac, &exact_token(&keys.search, w)).unwrap())
        .collect();
    assert_eq!(before, after);
    assert_eq!(search_forward(&store, &keys, "invoice").unwrap(), fwd_before);
    assert_eq!(current_counter(&store, &keys, "march").unwrap(), 12);
}

#[test]
fn open_or_migrate_upgrades_legacy_log() {
    let dir = tempfile::tempdir().unwrap();
    let keys = keys();
    let token = exact_token(&keys.search, "legacy");
    let d = DocumentId::generate();
    {
        let store = open(IndexBackendKind::Log, dir.path());
        store.insert(&keys.index_mac, token, &d).unwrap();
    }

    let config = IndexConfig {
        backend: IndexBackendKind::Table,
        path: dir.path().to_path_buf(),
        shards: 8,
        ..Default::default()
    };
    let store = IndexStore::open_or_migrate(&config).unwrap();
    assert_eq!(store.kind().unwrap(), IndexBackendKind::Table);
    assert_eq!(
        store.lookup(&keys.index_mac, &token).unwrap(),
        [d].into_iter().collect()
    );
    assert!(dir.path().join("index.log.bak").exists());
    assert!(!dir.path().join("index.log").exists());
    drop(store);

    // Second open finds the table and does not migrate again.
    let store = IndexStore::open_or_migrate(&config).unwrap();
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn concurrent_uploads_keep_counters_complete() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open(IndexBackendKind::Table, dir.path()));
    let keys = Arc::new(keys());
    let threads = 8;
    let per_thread = 10;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = Arc::clone(&store);
            let keys = Arc::clone(&keys);
            std::thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..per_thread {
                    let d = DocumentId::generate();
                    let kws = vec!["shared".to_string(), "common".to_string()];
                    let statics = [exact_token(&keys.search, "shared")];
                    index_with_forward(&store, &keys, &d, &statics, &kws).unwrap();
                    ids.push(d);
                }
                ids
            })
        })
        .collect();

    let mut all = std::collections::BTreeSet::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }

    let total = (threads * per_thread) as u64;
    assert_eq!(current_counter(&store, &keys, "shared").unwrap(), total);
    assert_eq!(current_counter(&store, &keys, "common").unwrap(), total);
    assert_eq!(search_forward(&store, &keys, "shared").unwrap(), all);
    assert_eq!(
        store
            .lookup(&keys.index_mac, &exact_token(&keys.search, "shared"))
            .unwrap(),
        all
    );
}

#[test]
fn concurrent_readers_and_writers_on_different_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open(IndexBackendKind::Log, dir.path()));
    let keys = Arc::new(keys());
    let seeded = DocumentId::generate();
    let stable = exact_token(&keys.search, "stable");
    store.insert(&keys.index_mac, stable, &seeded).unwrap();

    let writer = {
        let store = Arc::clone(&store);
        let keys = Arc::clone(&keys);
        std::thread::spawn(move || {
            for i in 0..20 {
                let t = exact_token(&keys.search, &format!("w{i}"));
                store
                    .insert(&keys.index_mac, t, &DocumentId::generate())
                    .unwrap();
            }
        })
    };
    for _ in 0..50 {
        let ids = store.lookup(&keys.index_mac, &stable).unwrap();
        assert_eq!(ids.len(), 1);
    }
    writer.join().unwrap();
    assert_eq!(store.len().unwrap(), 21);
}
