//! Indexed-table backend
//!
//! In-memory hash table keyed by token, made durable by an append-only
//! journal of committed batches plus a periodic snapshot:
//!
//! ```text
//! <dir>/snapshot.json   full table as of the last compaction
//! <dir>/journal.jsonl   one WriteBatch per line, fsynced per commit
//! ```
//!
//! Inserts are amortized O(1) and lookups are a single hash lookup. On open
//! the journal is replayed over the snapshot; a torn final line (crash
//! mid-append) is dropped, any other unreadable line is an error.

use anyhow::Context;
use cdx_core::config::IndexBackendKind;
use cdx_core::error::poisoned;
use cdx_core::{CdxError, CdxResult, Token};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::backend::IndexBackend;
use crate::posting::{IndexSnapshot, PostingList, WriteBatch, WriteOp};

const SNAPSHOT_FILE: &str = "snapshot.json";
const JOURNAL_FILE: &str = "journal.jsonl";

#[derive(Debug, Default)]
struct Table {
    postings: HashMap<Token, PostingList>,
    counters: HashMap<Token, u64>,
}

impl Table {
    fn apply(&mut self, batch: WriteBatch) {
        for op in batch.ops {
            match op {
                WriteOp::PutPosting(posting) => {
                    self.postings.insert(posting.token, posting);
                }
                WriteOp::DeletePosting { token } => {
                    self.postings.remove(&token);
                }
                WriteOp::SetCounter { key, value } => {
                    self.counters.insert(key, value);
                }
                WriteOp::DeleteCounter { key } => {
                    self.counters.remove(&key);
                }
            }
        }
    }
}

/// Snapshot on disk: maps serialize with hex-string keys.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    postings: Vec<PostingList>,
    counters: HashMap<String, u64>,
}

/// What the journal needs from its file, so append failures can be
/// exercised without a failing disk.
trait JournalFile: Write {
    fn end(&self) -> std::io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;
    fn sync(&mut self) -> std::io::Result<()>;
}

impl JournalFile for File {
    fn end(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)?;
        self.sync_all()
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

struct Journal<F = File> {
    file: F,
    records: usize,
    /// A failed append could not be rolled back; the file may end in a
    /// partial record, so nothing more may be appended after it.
    torn: bool,
}

impl<F: JournalFile> Journal<F> {
    /// Append and sync one record. Any failure cuts the file back to its
    /// previous length, so a record is either fully durable or absent.
    fn append(&mut self, line: &[u8]) -> CdxResult<()> {
        if self.torn {
            return Err(CdxError::Index(
                "index journal has an unrecoverable partial record; reopen the index".into(),
            ));
        }
        let start = self.file.end().context("sizing index journal")?;
        let written = self.file.write_all(line).and_then(|()| self.file.sync());
        let Err(e) = written else {
            self.records += 1;
            return Ok(());
        };
        if let Err(rollback) = self.file.truncate_to(start) {
            tracing::error!(error = %rollback, "could not roll back index journal append");
            self.torn = true;
        }
        Err(anyhow::Error::new(e)
            .context("appending to index journal")
            .into())
    }
}

pub struct TableBackend {
    dir: PathBuf,
    table: RwLock<Table>,
    journal: Mutex<Journal>,
    compact_after: usize,
}

impl TableBackend {
    pub fn open(dir: &Path, compact_after: usize) -> CdxResult<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating index table dir: {}", dir.display()))?;

        let mut table = load_snapshot(&dir.join(SNAPSHOT_FILE))?;
        let journal_path = dir.join(JOURNAL_FILE);
        let (records, journal_bytes) = replay_journal(&journal_path, &mut table)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .with_context(|| format!("opening index journal: {}", journal_path.display()))?;

        tracing::debug!(
            dir = %dir.display(),
            postings = table.postings.len(),
            replayed = records,
            "opened table index"
        );
        let backend = Self {
            dir: dir.to_path_buf(),
            table: RwLock::new(table),
            journal: Mutex::new(Journal {
                file,
                records,
                torn: false,
            }),
            compact_after: compact_after.max(1),
        };
        // Fold the replayed journal into a snapshot; this also drops a torn
        // tail from disk before anything is appended after it.
        if journal_bytes > 0 {
            let mut journal = backend.journal.lock().map_err(poisoned("index journal"))?;
            backend.compact(&mut journal)?;
        }
        Ok(backend)
    }

    /// Write the table as a fresh snapshot and truncate the journal.
    ///
    /// Replaying a journal over a snapshot that already contains it is
    /// harmless (every op is absolute), so a crash between the two steps
    /// loses nothing.
    fn compact(&self, journal: &mut Journal) -> CdxResult<()> {
        let snapshot = {
            let table = self.table.read().map_err(poisoned("index table"))?;
            SnapshotFile {
                postings: table.postings.values().cloned().collect(),
                counters: table
                    .counters
                    .iter()
                    .map(|(k, v)| (k.to_hex(), *v))
                    .collect(),
            }
        };
        let path = self.dir.join(SNAPSHOT_FILE);
        let tmp_path = path.with_extension("tmp");
        let json = serde_json::to_vec(&snapshot)?;
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("creating snapshot temp: {}", tmp_path.display()))?;
        tmp.write_all(&json)
            .with_context(|| format!("writing snapshot temp: {}", tmp_path.display()))?;
        tmp.sync_all()
            .with_context(|| format!("syncing snapshot temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming snapshot: {}", path.display()))?;

        journal
            .file
            .set_len(0)
            .context("truncating index journal")?;
        journal.file.sync_all().context("syncing index journal")?;
        journal.torn = false;
        tracing::debug!(
            postings = snapshot.postings.len(),
            records = journal.records,
            "compacted table index"
        );
        journal.records = 0;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn load_snapshot(path: &Path) -> CdxResult<Table> {
    if !path.exists() {
        return Ok(Table::default());
    }
    let content =
        std::fs::read(path).with_context(|| format!("reading snapshot: {}", path.display()))?;
    let file: SnapshotFile = serde_json::from_slice(&content).map_err(|e| {
        tracing::error!(path = %path.display(), "index snapshot is unreadable");
        CdxError::Index(format!("corrupt index snapshot {}: {e}", path.display()))
    })?;
    let mut table = Table::default();
    for posting in file.postings {
        table.postings.insert(posting.token, posting);
    }
    for (key, value) in file.counters {
        let key = Token::from_hex(&key)
            .ok_or_else(|| CdxError::Index(format!("corrupt counter key in {}", path.display())))?;
        table.counters.insert(key, value);
    }
    Ok(table)
}

/// Returns (records applied, journal size in bytes).
fn replay_journal(path: &Path, table: &mut Table) -> CdxResult<(usize, usize)> {
    if !path.exists() {
        return Ok((0, 0));
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading index journal: {}", path.display()))?;
    let complete = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let mut records = 0;
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WriteBatch>(line) {
            Ok(batch) => {
                table.apply(batch);
                records += 1;
            }
            Err(_) if i + 1 == lines.len() && !complete => {
                tracing::warn!(path = %path.display(), "dropping torn journal record");
            }
            Err(e) => {
                tracing::error!(path = %path.display(), line = i + 1, "index journal is unreadable");
                return Err(CdxError::Index(format!(
                    "corrupt index journal {} line {}: {e}",
                    path.display(),
                    i + 1
                )));
            }
        }
    }
    Ok((records, content.len()))
}

impl IndexBackend for TableBackend {
    fn kind(&self) -> IndexBackendKind {
        IndexBackendKind::Table
    }

    fn get(&self, token: &Token) -> CdxResult<Option<PostingList>> {
        let table = self.table.read().map_err(poisoned("index table"))?;
        Ok(table.postings.get(token).cloned())
    }

    fn counter(&self, key: &Token) -> CdxResult<u64> {
        let table = self.table.read().map_err(poisoned("index table"))?;
        Ok(table.counters.get(key).copied().unwrap_or(0))
    }

    fn commit(&self, batch: WriteBatch) -> CdxResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut journal = self.journal.lock().map_err(poisoned("index journal"))?;

        let mut line = serde_json::to_vec(&batch)?;
        line.push(b'\n');
        journal.append(&line)?;

        self.table
            .write()
            .map_err(poisoned("index table"))?
            .apply(batch);

        // The batch is durable already; a failed compaction is retried on
        // the next commit.
        if journal.records >= self.compact_after {
            if let Err(e) = self.compact(&mut journal) {
                tracing::warn!(error = %e, "index compaction failed");
            }
        }
        Ok(())
    }

    fn tokens_containing(&self, doc_id: &str) -> CdxResult<Vec<Token>> {
        let table = self.table.read().map_err(poisoned("index table"))?;
        Ok(table
            .postings
            .values()
            .filter(|p| p.doc_ids.contains(doc_id))
            .map(|p| p.token)
            .collect())
    }

    fn snapshot(&self) -> CdxResult<IndexSnapshot> {
        let table = self.table.read().map_err(poisoned("index table"))?;
        let mut postings: Vec<PostingList> = table.postings.values().cloned().collect();
        postings.sort_by(|a, b| a.token.cmp(&b.token));
        let mut counters: Vec<(Token, u64)> =
            table.counters.iter().map(|(k, v)| (*k, *v)).collect();
        counters.sort();
        Ok(IndexSnapshot { postings, counters })
    }

    fn len(&self) -> CdxResult<usize> {
        Ok(self.table.read().map_err(poisoned("index table"))?.postings.len())
    }

    fn flush(&self) -> CdxResult<()> {
        let mut journal = self.journal.lock().map_err(poisoned("index journal"))?;
        if journal.records > 0 {
            self.compact(&mut journal)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posting(b: u8, ids: &[&str]) -> PostingList {
        PostingList {
            token: Token::from_bytes([b; 32]),
            doc_ids: ids.iter().map(|s| s.to_string()).collect(),
            tag: "00".into(),
        }
    }

    fn put(table: &TableBackend, p: PostingList) {
        let mut batch = WriteBatch::new();
        batch.put(p);
        table.commit(batch).unwrap();
    }

    #[test]
    fn test_journal_replay_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = TableBackend::open(dir.path(), 1000).unwrap();
            put(&table, posting(1, &["d1"]));
            put(&table, posting(2, &["d2"]));
            let mut batch = WriteBatch::new();
            batch.set_counter(Token::from_bytes([7; 32]), 2);
            table.commit(batch).unwrap();
        }
        let table = TableBackend::open(dir.path(), 1000).unwrap();
        assert_eq!(table.len().unwrap(), 2);
        assert_eq!(table.counter(&Token::from_bytes([7; 32])).unwrap(), 2);
    }

    #[test]
    fn test_compaction_truncates_journal() {
        let dir = tempfile::tempdir().unwrap();
        let table = TableBackend::open(dir.path(), 2).unwrap();
        put(&table, posting(1, &["d1"]));
        put(&table, posting(2, &["d2"]));
        assert_eq!(std::fs::metadata(dir.path().join(JOURNAL_FILE)).unwrap().len(), 0);
        put(&table, posting(3, &["d3"]));
        drop(table);

        let table = TableBackend::open(dir.path(), 2).unwrap();
        assert_eq!(table.len().unwrap(), 3);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = TableBackend::open(dir.path(), 1000).unwrap();
            put(&table, posting(1, &["d1"]));
        }
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join(JOURNAL_FILE))
            .unwrap();
        f.write_all(br#"{"ops":[{"op":"put_posting","tok"#).unwrap();
        drop(f);

        let table = TableBackend::open(dir.path(), 1000).unwrap();
        assert_eq!(table.len().unwrap(), 1);
    }

    #[test]
    fn test_corrupt_middle_line_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(JOURNAL_FILE), "garbage\n{\"ops\":[]}\n").unwrap();
        assert!(matches!(
            TableBackend::open(dir.path(), 1000),
            Err(CdxError::Index(_))
        ));
    }

    /// In-memory journal whose writes fail past `limit` bytes.
    struct FlakyJournal {
        data: Vec<u8>,
        limit: usize,
        fail_sync: bool,
        fail_truncate: bool,
    }

    impl FlakyJournal {
        fn new(data: &[u8], limit: usize) -> Self {
            Self {
                data: data.to_vec(),
                limit,
                fail_sync: false,
                fail_truncate: false,
            }
        }
    }

    impl Write for FlakyJournal {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let room = self.limit.saturating_sub(self.data.len());
            if room == 0 {
                return Err(std::io::Error::other("disk full"));
            }
            let n = room.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl JournalFile for FlakyJournal {
        fn end(&self) -> std::io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
            if self.fail_truncate {
                return Err(std::io::Error::other("read-only"));
            }
            self.data.truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> std::io::Result<()> {
            if self.fail_sync {
                return Err(std::io::Error::other("fsync failed"));
            }
            Ok(())
        }
    }

    fn journal(file: FlakyJournal) -> Journal<FlakyJournal> {
        Journal {
            file,
            records: 0,
            torn: false,
        }
    }

    #[test]
    fn test_short_write_leaves_no_partial_record() {
        let mut j = journal(FlakyJournal::new(b"{\"ops\":[]}\n", 20));
        assert!(j.append(b"{\"ops\":[{\"op\":\"put_posting\"}]}\n").is_err());
        assert_eq!(j.file.data, b"{\"ops\":[]}\n");
        assert_eq!(j.records, 0);

        // The next record starts on a clean line.
        j.file.limit = usize::MAX;
        j.append(b"{\"ops\":[]}\n").unwrap();
        assert_eq!(j.file.data, b"{\"ops\":[]}\n{\"ops\":[]}\n");
        assert_eq!(j.records, 1);
    }

    #[test]
    fn test_failed_sync_rolls_back_complete_record() {
        let mut file = FlakyJournal::new(b"", usize::MAX);
        file.fail_sync = true;
        let mut j = journal(file);
        assert!(j.append(b"{\"ops\":[]}\n").is_err());
        assert!(j.file.data.is_empty());
        assert_eq!(j.records, 0);
    }

    #[test]
    fn test_failed_rollback_refuses_further_appends() {
        let mut file = FlakyJournal::new(b"", 4);
        file.fail_truncate = true;
        let mut j = journal(file);
        assert!(j.append(b"{\"ops\":[]}\n").is_err());
        assert!(j.torn);

        j.file.limit = usize::MAX;
        assert!(matches!(j.append(b"{\"ops\":[]}\n"), Err(CdxError::Index(_))));
        assert_eq!(j.file.data.len(), 4);
    }

    #[test]
    fn test_batch_is_atomic_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let table = TableBackend::open(dir.path(), 1000).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(posting(1, &["d1"]));
        batch.set_counter(Token::from_bytes([5; 32]), 1);
        table.commit(batch).unwrap();
        assert!(table.get(&Token::from_bytes([1; 32])).unwrap().is_some());
        assert_eq!(table.counter(&Token::from_bytes([5; 32])).unwrap(), 1);
    }
}
