//! Append-only time-series storage for sensor readings.
//!
//! Readings are kept in an ordered in-memory index keyed by
//! `(timestamp, insertion sequence)`. When the store is backed by a file,
//! every append is written as one JSON line before it becomes visible in the
//! index, and the file is replayed on open.

use crate::core::reading::{Reading, StoredId, StoredReading};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// File name used for the reading log inside a data directory.
pub const READINGS_FILE: &str = "readings.jsonl";

type IndexKey = (DateTime<Utc>, u64);

/// Errors raised by the storage layer.
#[derive(Debug)]
pub enum PersistenceError {
    /// Underlying file operation failed
    Io(String),
    /// A stored line could not be decoded
    Corrupt { line: usize, message: String },
    /// A record could not be encoded
    Encode(String),
    /// A lock was poisoned by a panicking writer
    Poisoned,
    /// Another process holds the store open for writing
    Locked(String),
    /// The store was opened read-only
    ReadOnly,
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::Io(e) => write!(f, "Storage IO error: {e}"),
            PersistenceError::Corrupt { line, message } => {
                write!(f, "Corrupt record at line {line}: {message}")
            }
            PersistenceError::Encode(e) => write!(f, "Failed to encode record: {e}"),
            PersistenceError::Poisoned => write!(f, "Storage lock poisoned"),
            PersistenceError::Locked(path) => {
                write!(f, "Store is already open for writing (lock held on {path})")
            }
            PersistenceError::ReadOnly => write!(f, "Store is open read-only"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        PersistenceError::Io(e.to_string())
    }
}

/// On-disk line format (borrowed form for writing).
#[derive(Serialize)]
struct RecordRef<'a> {
    id: StoredId,
    seq: u64,
    #[serde(flatten)]
    reading: &'a Reading,
}

/// On-disk line format (owned form for replay).
#[derive(Deserialize)]
struct Record {
    id: StoredId,
    seq: u64,
    #[serde(flatten)]
    reading: Reading,
}

/// Destination of appended records.
trait LogFile: Write + Send + std::fmt::Debug {
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
    fn sync(&mut self) -> std::io::Result<()>;
}

impl LogFile for File {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

#[derive(Debug)]
struct Writer {
    file: Option<Box<dyn LogFile>>,
    /// Length of the file up to the last complete record
    len: u64,
    next_seq: u64,
}

/// Durable, append-only store of readings with time-ordered retrieval.
#[derive(Debug)]
pub struct TimeSeriesStore {
    index: RwLock<BTreeMap<IndexKey, StoredReading>>,
    writer: Mutex<Writer>,
    path: Option<PathBuf>,
    sync: bool,
    read_only: bool,
    /// Exclusive advisory lock held while the store is open for writing
    _lock: Option<File>,
}

impl TimeSeriesStore {
    /// Create a store that keeps readings in memory only.
    pub fn in_memory() -> Self {
        Self {
            index: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(Writer {
                file: None,
                len: 0,
                next_seq: 0,
            }),
            path: None,
            sync: false,
            read_only: false,
            _lock: None,
        }
    }

    /// Open (or create) a file-backed store and replay its contents.
    ///
    /// Only one writer may hold a store file at a time. A second `open` on
    /// the same path fails with [`PersistenceError::Locked`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = acquire_lock(&path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        let (index, len, next_seq) = replay(&path, &content)?;

        if len < content.len() as u64 {
            file.set_len(len)?;
        } else if !content.is_empty() && !content.ends_with(b"\n") {
            // Last record parsed but was never terminated.
            file.write_all(b"\n")?;
        }
        let len = file.metadata()?.len();

        tracing::info!(
            path = %path.display(),
            readings = index.len(),
            "opened reading store"
        );

        Ok(Self {
            index: RwLock::new(index),
            writer: Mutex::new(Writer {
                file: Some(Box::new(file)),
                len,
                next_seq,
            }),
            path: Some(path),
            sync: true,
            read_only: false,
            _lock: Some(lock),
        })
    }

    /// Open the store file inside a data directory.
    pub fn open_in_dir(dir: &Path) -> Result<Self, PersistenceError> {
        Self::open(dir.join(READINGS_FILE))
    }

    /// Load a snapshot of a store file without taking the writer lock.
    ///
    /// The file is never modified, so this is safe while a server is
    /// appending to it. A torn trailing record is skipped in memory only.
    /// A missing file yields an empty store. Appends fail with
    /// [`PersistenceError::ReadOnly`].
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (index, _, next_seq) = replay(&path, &content)?;

        tracing::debug!(
            path = %path.display(),
            readings = index.len(),
            "loaded reading store read-only"
        );

        Ok(Self {
            index: RwLock::new(index),
            writer: Mutex::new(Writer {
                file: None,
                len: 0,
                next_seq,
            }),
            path: Some(path),
            sync: false,
            read_only: true,
            _lock: None,
        })
    }

    /// Read-only counterpart of [`open_in_dir`](Self::open_in_dir).
    pub fn open_read_only_in_dir(dir: &Path) -> Result<Self, PersistenceError> {
        Self::open_read_only(dir.join(READINGS_FILE))
    }

    /// Set whether each append is synced to disk before it returns.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one reading and return its identifier.
    ///
    /// The reading becomes visible to queries only after it has been written.
    pub fn append(&self, reading: Reading) -> Result<StoredId, PersistenceError> {
        if self.read_only {
            return Err(PersistenceError::ReadOnly);
        }

        let mut guard = self.writer.lock().map_err(|_| PersistenceError::Poisoned)?;
        let writer = &mut *guard;
        let id = StoredId::new();
        let seq = writer.next_seq;

        let sync = self.sync;
        let good_len = writer.len;
        if let Some(file) = writer.file.as_mut() {
            let mut line = serde_json::to_vec(&RecordRef {
                id,
                seq,
                reading: &reading,
            })
            .map_err(|e| PersistenceError::Encode(e.to_string()))?;
            line.push(b'\n');

            if let Err(e) = write_line(&mut **file, &line, sync) {
                // Drop any partial line so later records stay aligned.
                if let Err(truncate_err) = file.truncate(good_len) {
                    tracing::error!("Failed to roll back partial write: {}", truncate_err);
                }
                tracing::error!("Failed to append reading: {}", e);
                return Err(e.into());
            }
            writer.len = good_len + line.len() as u64;
        }
        writer.next_seq += 1;

        let timestamp = reading.timestamp;
        self.index
            .write()
            .map_err(|_| PersistenceError::Poisoned)?
            .insert((timestamp, seq), StoredReading { id, reading });

        tracing::debug!(%id, %timestamp, seq, "appended reading");
        Ok(id)
    }

    /// Get up to `n` readings, newest first.
    ///
    /// Readings with equal timestamps are returned newest insertion first.
    pub fn latest(&self, n: usize) -> Result<Vec<StoredReading>, PersistenceError> {
        let index = self.index.read().map_err(|_| PersistenceError::Poisoned)?;
        Ok(index.values().rev().take(n).cloned().collect())
    }

    /// Get all readings at or after `cutoff`, oldest first.
    pub fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredReading>, PersistenceError> {
        let index = self.index.read().map_err(|_| PersistenceError::Poisoned)?;
        Ok(index.range((cutoff, 0)..).map(|(_, r)| r.clone()).collect())
    }

    /// Number of stored readings.
    ///
    /// The index is only changed after a record is fully written, so a
    /// poisoned lock still guards a consistent map.
    pub fn len(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn write_line(file: &mut dyn LogFile, line: &[u8], sync: bool) -> std::io::Result<()> {
    file.write_all(line)?;
    file.flush()?;
    if sync {
        file.sync()?;
    }
    Ok(())
}

/// Take the writer lock on `<path>.lock`.
///
/// The lock lives in a side file so readers of the data file are never
/// blocked by it. The OS releases it when the handle closes.
fn acquire_lock(path: &Path) -> Result<File, PersistenceError> {
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(".lock");
    let lock_path = PathBuf::from(lock_path);

    let lock = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;

    lock.try_lock_exclusive().map_err(|e| {
        if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            PersistenceError::Locked(lock_path.display().to_string())
        } else {
            e.into()
        }
    })?;
    Ok(lock)
}

/// Rebuild the index from file contents.
///
/// Returns the index, the byte length of the valid prefix and the next
/// sequence number. An undecodable final line without a newline is a torn
/// write and is excluded from the valid prefix.
fn replay(
    path: &Path,
    content: &[u8],
) -> Result<(BTreeMap<IndexKey, StoredReading>, u64, u64), PersistenceError> {
    let mut index = BTreeMap::new();
    let mut seen = HashSet::new();
    let mut next_seq = 0;
    let mut offset = 0usize;
    let mut valid_len = content.len();

    for (line_no, segment) in content.split(|b| *b == b'\n').enumerate() {
        let start = offset;
        offset += segment.len() + 1;

        if segment.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match serde_json::from_slice::<Record>(segment) {
            Ok(record) => {
                if !seen.insert(record.seq) {
                    return Err(PersistenceError::Corrupt {
                        line: line_no + 1,
                        message: format!("duplicate record sequence {}", record.seq),
                    });
                }
                next_seq = next_seq.max(record.seq + 1);
                index.insert(
                    (record.reading.timestamp, record.seq),
                    StoredReading {
                        id: record.id,
                        reading: record.reading,
                    },
                );
            }
            Err(e) if offset > content.len() => {
                tracing::warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    "discarding torn trailing record: {}",
                    e
                );
                valid_len = start;
            }
            Err(e) => {
                return Err(PersistenceError::Corrupt {
                    line: line_no + 1,
                    message: e.to_string(),
                });
            }
        }
    }

    Ok((index, valid_len as u64, next_seq))
}

/// Thread-safe shared store handle.
pub type SharedStore = Arc<TimeSeriesStore>;

/// Create a shared in-memory store.
pub fn create_shared_store() -> SharedStore {
    Arc::new(TimeSeriesStore::in_memory())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reading::SensorValues;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn temp_store_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("taste-sensor-store-{}", uuid::Uuid::new_v4()))
            .join(READINGS_FILE)
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn reading_at(offset_secs: i64, temperature: f64) -> Reading {
        Reading {
            timestamp: base_time() + Duration::seconds(offset_secs),
            values: SensorValues {
                temperature: Some(temperature),
                ..Default::default()
            },
        }
    }

    fn temperatures(readings: &[StoredReading]) -> Vec<f64> {
        readings
            .iter()
            .map(|r| r.reading.values.temperature.unwrap())
            .collect()
    }

    #[test]
    fn test_latest_orders_by_timestamp_not_insertion() {
        let store = TimeSeriesStore::in_memory();
        store.append(reading_at(20, 2.0)).unwrap();
        store.append(reading_at(10, 1.0)).unwrap();
        store.append(reading_at(30, 3.0)).unwrap();

        assert_eq!(temperatures(&store.latest(10).unwrap()), vec![3.0, 2.0, 1.0]);
        assert_eq!(temperatures(&store.latest(2).unwrap()), vec![3.0, 2.0]);
    }

    #[test]
    fn test_latest_limits() {
        let store = TimeSeriesStore::in_memory();
        assert!(store.latest(5).unwrap().is_empty());

        store.append(reading_at(0, 1.0)).unwrap();
        store.append(reading_at(1, 2.0)).unwrap();

        assert!(store.latest(0).unwrap().is_empty());
        assert_eq!(store.latest(5).unwrap().len(), 2);
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let store = TimeSeriesStore::in_memory();
        store.append(reading_at(0, 1.0)).unwrap();
        store.append(reading_at(0, 2.0)).unwrap();
        store.append(reading_at(0, 3.0)).unwrap();

        assert_eq!(temperatures(&store.latest(3).unwrap()), vec![3.0, 2.0, 1.0]);
        assert_eq!(
            temperatures(&store.since(base_time()).unwrap()),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn test_since_is_inclusive_and_chronological() {
        let store = TimeSeriesStore::in_memory();
        store.append(reading_at(30, 3.0)).unwrap();
        store.append(reading_at(0, 0.0)).unwrap();
        store.append(reading_at(10, 1.0)).unwrap();
        store.append(reading_at(20, 2.0)).unwrap();

        let cutoff = base_time() + Duration::seconds(10);
        let readings = store.since(cutoff).unwrap();
        assert_eq!(temperatures(&readings), vec![1.0, 2.0, 3.0]);
        assert!(readings.iter().all(|r| r.reading.timestamp >= cutoff));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let path = temp_store_path();
        let first_id = {
            let store = TimeSeriesStore::open(&path).unwrap();
            let id = store.append(reading_at(0, 1.0)).unwrap();
            store.append(reading_at(5, 2.0)).unwrap();
            id
        };

        let store = TimeSeriesStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        let oldest = store.since(base_time()).unwrap();
        assert_eq!(oldest[0].id, first_id);

        // New appends continue after the replayed records.
        store.append(reading_at(5, 3.0)).unwrap();
        assert_eq!(temperatures(&store.latest(1).unwrap()), vec![3.0]);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_torn_trailing_record_is_discarded() {
        let path = temp_store_path();
        {
            let store = TimeSeriesStore::open(&path).unwrap();
            store.append(reading_at(0, 1.0)).unwrap();
        }

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"id":"0b7e","seq":1,"timest"#).unwrap();
        drop(file);

        let store = TimeSeriesStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        store.append(reading_at(1, 2.0)).unwrap();
        drop(store);

        let store = TimeSeriesStore::open(&path).unwrap();
        assert_eq!(temperatures(&store.latest(5).unwrap()), vec![2.0, 1.0]);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_corrupt_middle_record_fails_open() {
        let path = temp_store_path();
        {
            let store = TimeSeriesStore::open(&path).unwrap();
            store.append(reading_at(0, 1.0)).unwrap();
        }

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"garbage\n").unwrap();
        drop(file);
        let err = TimeSeriesStore::open(&path).unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { line: 2, .. }));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_concurrent_appends() {
        let store = create_shared_store();

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..25 {
                        store.append(reading_at(i, worker as f64)).unwrap();
                        assert!(!store.latest(1).unwrap().is_empty());
                    }
                });
            }
        });

        assert_eq!(store.len(), 100);
        let newest_first = store.latest(100).unwrap();
        assert!(newest_first
            .windows(2)
            .all(|w| w[0].reading.timestamp >= w[1].reading.timestamp));
    }

    fn encode_record(seq: u64, reading: &Reading) -> Vec<u8> {
        let mut line = serde_json::to_vec(&RecordRef {
            id: StoredId::new(),
            seq,
            reading,
        })
        .unwrap();
        line.push(b'\n');
        line
    }

    #[test]
    fn test_second_writer_is_refused() {
        let path = temp_store_path();
        let store = TimeSeriesStore::open(&path).unwrap();

        let err = TimeSeriesStore::open(&path).unwrap_err();
        assert!(matches!(err, PersistenceError::Locked(_)));

        drop(store);
        assert!(TimeSeriesStore::open(&path).is_ok());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_read_only_snapshot_leaves_in_flight_write_intact() {
        let path = temp_store_path();
        let store = TimeSeriesStore::open(&path).unwrap();
        store.append(reading_at(0, 1.0)).unwrap();

        // A record the writer has only partly flushed.
        let pending = encode_record(1, &reading_at(5, 2.0));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&pending[..20]).unwrap();
        let len_before = std::fs::metadata(&path).unwrap().len();

        let snapshot = TimeSeriesStore::open_read_only(&path).unwrap();
        assert_eq!(temperatures(&snapshot.latest(10).unwrap()), vec![1.0]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);

        file.write_all(&pending[20..]).unwrap();
        drop(file);
        drop(store);

        let store = TimeSeriesStore::open(&path).unwrap();
        assert_eq!(temperatures(&store.latest(10).unwrap()), vec![2.0, 1.0]);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_read_only_store_rejects_appends() {
        let path = temp_store_path();
        let snapshot = TimeSeriesStore::open_read_only(&path).unwrap();
        assert!(snapshot.is_empty());
        assert!(matches!(
            snapshot.append(reading_at(0, 1.0)),
            Err(PersistenceError::ReadOnly)
        ));
        assert!(!path.exists());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_duplicate_sequence_fails_open() {
        let path = temp_store_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut content = encode_record(0, &reading_at(0, 1.0));
        content.extend(encode_record(0, &reading_at(0, 2.0)));
        std::fs::write(&path, content).unwrap();

        let err = TimeSeriesStore::open(&path).unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { line: 2, .. }));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    /// Log that records writes in memory and can be told to fail midway.
    #[derive(Debug, Clone, Default)]
    struct FlakyLog {
        bytes: Arc<Mutex<Vec<u8>>>,
        fail_next: Arc<AtomicBool>,
    }

    impl Write for FlakyLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut bytes = self.bytes.lock().unwrap();
            if self.fail_next.swap(false, Ordering::SeqCst) {
                bytes.extend_from_slice(&buf[..buf.len() / 2]);
                return Err(std::io::Error::other("no space left on device"));
            }
            bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for FlakyLog {
        fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            self.bytes.lock().unwrap().truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn store_with_log(log: FlakyLog) -> TimeSeriesStore {
        TimeSeriesStore {
            index: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(Writer {
                file: Some(Box::new(log)),
                len: 0,
                next_seq: 0,
            }),
            path: None,
            sync: true,
            read_only: false,
            _lock: None,
        }
    }

    #[test]
    fn test_failed_write_is_rolled_back() {
        let log = FlakyLog::default();
        let store = store_with_log(log.clone());

        store.append(reading_at(0, 1.0)).unwrap();
        let good_len = log.bytes.lock().unwrap().len();

        log.fail_next.store(true, Ordering::SeqCst);
        let err = store.append(reading_at(1, 2.0)).unwrap_err();
        assert!(matches!(err, PersistenceError::Io(_)));
        assert_eq!(log.bytes.lock().unwrap().len(), good_len);
        assert_eq!(temperatures(&store.latest(10).unwrap()), vec![1.0]);

        store.append(reading_at(2, 3.0)).unwrap();
        let content = log.bytes.lock().unwrap().clone();
        let (index, len, _) = replay(Path::new("memory"), &content).unwrap();
        assert_eq!(len, content.len() as u64);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_len_survives_poisoned_lock() {
        let store = create_shared_store();
        store.append(reading_at(0, 1.0)).unwrap();

        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.index.write().unwrap();
            panic!("writer panicked while holding the index");
        })
        .join();

        assert_eq!(store.len(), 1);
        assert!(matches!(store.latest(1), Err(PersistenceError::Poisoned)));
    }
}
