// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! De-duplicating buffer between the gatherers and the archive store.
//!
//! Records are kept by file name. Once an archive is written the saved entries stay in the map
//! without their bytes, so a record with an unchanged fingerprint is not written again in a
//! later cycle.

use crate::anonymization::Anonymizer;
use crate::archive::{ArchiveError, ArchiveStore, SavedArchive};
use crate::backoff::{self, Attempt, Backoff};
use crate::record::{sort_by_time, MemoryRecord, Record, RecordError};
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Size of buffered data that triggers an early flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("archive writer stopped unexpectedly: {0}")]
    Writer(String),
}

/// Time of the last successful upload.
pub trait LastReported: Send + Sync {
    fn last_reported_time(&self) -> Option<DateTime<Utc>>;
}

struct Entry {
    record: MemoryRecord,
    digest: u64,
    flushed: bool,
}

struct Inner {
    records: HashMap<String, Entry>,
    size: usize,
    anonymizer: Arc<Anonymizer>,
}

pub struct Recorder {
    store: Arc<dyn ArchiveStore>,
    interval: Duration,
    max_age: Duration,
    flush_threshold: usize,
    inner: Mutex<Inner>,
    flush_tx: mpsc::Sender<()>,
    flush_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl Recorder {
    pub fn new(store: Arc<dyn ArchiveStore>, interval: Duration, anonymizer: Arc<Anonymizer>) -> Self {
        let (flush_tx, flush_rx) = mpsc::channel(1);
        Self {
            store,
            interval,
            max_age: interval * 6 * 24,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                size: 0,
                anonymizer,
            }),
            flush_tx,
            flush_rx: std::sync::Mutex::new(Some(flush_rx)),
        }
    }

    #[must_use]
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Receiver woken when the buffered size crosses the flush threshold. Can be taken once.
    pub fn take_flush_signal(&self) -> Option<mpsc::Receiver<()>> {
        self.flush_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Anonymizer applied to records from now on.
    pub async fn set_anonymizer(&self, anonymizer: Arc<Anonymizer>) {
        self.inner.lock().await.anonymizer = anonymizer;
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.size
    }

    /// Number of records with unflushed data.
    pub async fn pending(&self) -> usize {
        self.inner
            .lock()
            .await
            .records
            .values()
            .filter(|e| !e.flushed)
            .count()
    }

    pub async fn record(&self, record: Record) -> Result<(), RecorderError> {
        let name = record.filename();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let (Some(existing), Some(fingerprint)) =
            (inner.records.get(&name), record.fingerprint.as_deref())
        {
            if existing.record.fingerprint.as_deref() == Some(fingerprint) {
                debug!("Record {name} has an unchanged fingerprint, skipping");
                return Ok(());
            }
        }

        let data = record.marshal()?;
        let digest = digest(&data);
        if record.fingerprint.is_none() {
            if let Some(existing) = inner.records.get(&name) {
                if existing.record.fingerprint.is_none() && existing.digest == digest {
                    debug!("Record {name} has identical content, skipping");
                    return Ok(());
                }
            }
        }

        info!(
            "Recording {name} with fingerprint={}",
            record.fingerprint.as_deref().unwrap_or_default()
        );

        let mut memory_record = MemoryRecord {
            name: name.clone(),
            fingerprint: record.fingerprint.clone(),
            at: record.captured_at.unwrap_or_else(Utc::now),
            data,
        };
        let anonymizer = Arc::clone(&inner.anonymizer);
        anonymizer.anonymize_memory_record(&mut memory_record);

        if let Some(existing) = inner.records.get(&name) {
            if !existing.flushed {
                warn!(
                    "the record with the same name {name:?} was already recorded and had the fingerprint {:?}, overwriting with the record having fingerprint {:?}",
                    existing.record.fingerprint.as_deref().unwrap_or_default(),
                    memory_record.fingerprint.as_deref().unwrap_or_default()
                );
                let previous = existing.record.data.len();
                inner.size -= previous;
            }
        }

        inner.size += memory_record.data.len();
        // keyed by the original file name so later cycles find it again
        inner.records.insert(
            name,
            Entry {
                record: memory_record,
                digest,
                flushed: false,
            },
        );

        if inner.size > self.flush_threshold {
            // a pending signal is enough
            let _ = self.flush_tx.try_send(());
        }
        Ok(())
    }

    /// Writes every unflushed record to a new archive, oldest first.
    pub async fn flush(&self) -> Result<Option<SavedArchive>, RecorderError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut records: Vec<MemoryRecord> = inner
            .records
            .values()
            .filter(|e| !e.flushed)
            .map(|e| e.record.clone())
            .collect();
        if records.is_empty() {
            debug!("No records to flush");
            return Ok(None);
        }
        sort_by_time(&mut records);

        let store = Arc::clone(&self.store);
        let saved = tokio::task::spawn_blocking(move || store.save(&records))
            .await
            .map_err(|e| RecorderError::Writer(e.to_string()))??;

        for name in &saved.saved {
            let Some(entry) = inner
                .records
                .values_mut()
                .find(|e| !e.flushed && &e.record.name == name)
            else {
                continue;
            };
            let len = entry.record.data.len();
            entry.record.data = Vec::new();
            entry.flushed = true;
            inner.size -= len;
        }
        debug!("Records successfully flushed");
        Ok(Some(saved))
    }

    /// Deletes archives older than the last report or the maximum age, whichever is earlier,
    /// every `interval * 2` (jittered).
    pub async fn periodically_prune(&self, cancel: CancellationToken, reported: Arc<dyn LastReported>) {
        loop {
            let interval = backoff::jitter(self.interval * 2, 1.2);
            debug!(
                "Pruning old reports every {}s, max age is {}s",
                interval.as_secs(),
                self.max_age.as_secs()
            );
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            self.prune_old_reports(reported.as_ref(), &cancel).await;
        }
    }

    pub async fn prune_old_reports(&self, reported: &dyn LastReported, cancel: &CancellationToken) {
        let result = backoff::retry(
            Backoff::new(Duration::from_secs(1), 1.5, 4),
            cancel,
            || async {
                let cutoff = self.prune_cutoff(reported.last_reported_time(), Utc::now());
                let _guard = self.inner.lock().await;
                let store = Arc::clone(&self.store);
                let pruned = tokio::task::spawn_blocking(move || store.prune(cutoff)).await;
                match pruned {
                    Ok(Ok(count)) => Ok(count),
                    Ok(Err(e)) => {
                        error!("Failed to prune older records: {e}");
                        Err(Attempt::Retry(e.to_string()))
                    }
                    Err(e) => Err(Attempt::Retry(e.to_string())),
                }
            },
        )
        .await;
        if let Err(e) = result {
            error!("Failed to prune old reports: {e}");
        }
    }

    fn prune_cutoff(&self, last_reported: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        let oldest_allowed = now
            - chrono::Duration::from_std(self.max_age).unwrap_or_else(|_| chrono::Duration::zero());
        match last_reported {
            Some(reported) => reported.min(oldest_allowed),
            None => oldest_allowed,
        }
    }
}

fn digest(data: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{read_archive_file, DiskStorage};
    use crate::record::RawBytes;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockStore {
        saved: StdMutex<Vec<Vec<MemoryRecord>>>,
        fail: bool,
        prune_cutoffs: StdMutex<Vec<DateTime<Utc>>>,
    }

    impl ArchiveStore for MockStore {
        fn save(&self, records: &[MemoryRecord]) -> Result<SavedArchive, ArchiveError> {
            if self.fail {
                return Err(ArchiveError::AlreadyExists("archive".into()));
            }
            self.saved.lock().unwrap().push(records.to_vec());
            Ok(SavedArchive {
                path: "archive".into(),
                saved: records.iter().map(|r| r.name.clone()).collect(),
            })
        }

        fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, ArchiveError> {
            self.prune_cutoffs.lock().unwrap().push(older_than);
            Ok(0)
        }
    }

    fn recorder(store: Arc<MockStore>) -> Recorder {
        Recorder::new(
            store,
            Duration::from_secs(3600),
            Arc::new(Anonymizer::disabled().unwrap()),
        )
    }

    fn raw(name: &str, data: &str) -> Record {
        Record::new(name, RawBytes(data.as_bytes().to_vec()))
    }

    #[tokio::test]
    async fn test_same_fingerprint_is_recorded_once() {
        let recorder = recorder(Arc::default());
        recorder.record(raw("config/a", "abc").with_fingerprint("f1")).await.unwrap();
        let size = recorder.size().await;
        recorder.record(raw("config/a", "abcdef").with_fingerprint("f1")).await.unwrap();
        assert_eq!(recorder.size().await, size);
        assert_eq!(recorder.pending().await, 1);
    }

    #[tokio::test]
    async fn test_new_fingerprint_replaces_record() {
        let recorder = recorder(Arc::default());
        recorder.record(raw("config/a", "abc").with_fingerprint("f1")).await.unwrap();
        recorder.record(raw("config/a", "abcdef").with_fingerprint("f2")).await.unwrap();
        assert_eq!(recorder.size().await, 6);
        assert_eq!(recorder.pending().await, 1);
    }

    #[tokio::test]
    async fn test_flush_accounts_for_saved_bytes() {
        let store = Arc::new(MockStore::default());
        let recorder = recorder(Arc::clone(&store));
        recorder.record(raw("a", "1234")).await.unwrap();
        recorder.record(raw("b", "12")).await.unwrap();
        assert_eq!(recorder.size().await, 6);

        let saved = recorder.flush().await.unwrap().unwrap();
        assert_eq!(saved.saved.len(), 2);
        assert_eq!(recorder.size().await, 0);
        assert_eq!(recorder.pending().await, 0);

        // nothing left
        assert!(recorder.flush().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flushed_records_are_not_recorded_again() {
        let store = Arc::new(MockStore::default());
        let recorder = recorder(Arc::clone(&store));
        recorder.record(raw("a", "1").with_fingerprint("x")).await.unwrap();
        recorder.record(raw("b", "2")).await.unwrap();
        recorder.flush().await.unwrap();

        recorder.record(raw("a", "1").with_fingerprint("x")).await.unwrap();
        recorder.record(raw("b", "2")).await.unwrap();
        assert_eq!(recorder.pending().await, 0);

        recorder.record(raw("b", "3")).await.unwrap();
        assert_eq!(recorder.pending().await, 1);
    }

    #[tokio::test]
    async fn test_flush_sorts_by_time() {
        let store = Arc::new(MockStore::default());
        let recorder = recorder(Arc::clone(&store));
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        recorder
            .record(raw("late", "x").with_captured_at(t0 + chrono::Duration::seconds(10)))
            .await
            .unwrap();
        recorder.record(raw("early", "x").with_captured_at(t0)).await.unwrap();
        recorder.flush().await.unwrap();

        let saved = store.saved.lock().unwrap();
        let names: Vec<&str> = saved[0].iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_failed_flush_leaves_state_untouched() {
        let store = Arc::new(MockStore {
            fail: true,
            ..Default::default()
        });
        let recorder = recorder(store);
        recorder.record(raw("a", "1234")).await.unwrap();
        assert!(recorder.flush().await.is_err());
        assert_eq!(recorder.size().await, 4);
        assert_eq!(recorder.pending().await, 1);
    }

    #[tokio::test]
    async fn test_size_threshold_signals_flush_once() {
        let recorder = recorder(Arc::default()).with_flush_threshold(4);
        let mut signal = recorder.take_flush_signal().unwrap();
        assert!(recorder.take_flush_signal().is_none());

        recorder.record(raw("a", "123")).await.unwrap();
        assert!(signal.try_recv().is_err());
        recorder.record(raw("b", "45")).await.unwrap();
        recorder.record(raw("c", "67")).await.unwrap();
        assert!(signal.try_recv().is_ok());
        assert!(signal.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_records_are_anonymized() {
        let anonymizer = Anonymizer::builder()
            .with_sensitive_value("example.com", "<CLUSTER_BASE_DOMAIN>")
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(
            Arc::new(DiskStorage::new(dir.path())),
            Duration::from_secs(3600),
            Arc::new(anonymizer),
        );
        recorder
            .record(raw("hosts", "api.example.com"))
            .await
            .unwrap();
        let saved = recorder.flush().await.unwrap().unwrap();
        let records = read_archive_file(&saved.path).unwrap();
        assert_eq!(records[0].data, b"api.<CLUSTER_BASE_DOMAIN>");
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() {
        let recorder = recorder(Arc::default());
        let err = recorder.record(raw("", "x")).await.unwrap_err();
        assert!(matches!(err, RecorderError::Record(RecordError::EmptyName)));
    }

    struct Reported(Option<DateTime<Utc>>);

    impl LastReported for Reported {
        fn last_reported_time(&self) -> Option<DateTime<Utc>> {
            self.0
        }
    }

    #[test]
    fn test_prune_cutoff_is_earliest_bound() {
        let recorder = recorder(Arc::default());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        // max age is 1h * 6 * 24 = 6 days
        let oldest_allowed = now - chrono::Duration::days(6);
        assert_eq!(recorder.prune_cutoff(None, now), oldest_allowed);
        let recent = now - chrono::Duration::hours(1);
        assert_eq!(recorder.prune_cutoff(Some(recent), now), oldest_allowed);
        let ancient = now - chrono::Duration::days(30);
        assert_eq!(recorder.prune_cutoff(Some(ancient), now), ancient);
    }

    #[tokio::test]
    async fn test_prune_old_reports_calls_store() {
        let store = Arc::new(MockStore::default());
        let recorder = recorder(Arc::clone(&store));
        recorder
            .prune_old_reports(&Reported(None), &CancellationToken::new())
            .await;
        assert_eq!(store.prune_cutoffs.lock().unwrap().len(), 1);
    }
}
