// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk archive store.
//!
//! Every flush of the recorder produces one `insights-YYYY-MM-DD-HHMMSS.tar.gz` file in the
//! storage directory. The store is the only writer of that directory.

use crate::record::MemoryRecord;
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

const ARCHIVE_PREFIX: &str = "insights-";
const ARCHIVE_SUFFIX: &str = ".tar.gz";
const ENTRY_MODE: u32 = 0o640;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("no records to save")]
    Empty,
    #[error("archive {0} already exists")]
    AlreadyExists(PathBuf),
    #[error("unable to create archive {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("unable to write archive {path} ({} records written): {source}", saved.len())]
    Write {
        path: PathBuf,
        saved: Vec<String>,
        source: io::Error,
    },
    #[error("unable to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("unable to prune {0}")]
    PruneFailed(String),
    #[error("unable to prune {count} entries: {first}")]
    PruneFailedMany { count: usize, first: String },
    #[error("archive task failed: {0}")]
    Task(String),
}

/// Result of a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArchive {
    pub path: PathBuf,
    /// Names of the written records, in write order.
    pub saved: Vec<String>,
}

/// Archive file as seen in the storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

/// Persistence used by the recorder.
pub trait ArchiveStore: Send + Sync {
    fn save(&self, records: &[MemoryRecord]) -> Result<SavedArchive, ArchiveError>;
    fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, ArchiveError>;
}

pub fn archive_name(at: DateTime<Utc>) -> String {
    format!(
        "{ARCHIVE_PREFIX}{}{ARCHIVE_SUFFIX}",
        at.format("%Y-%m-%d-%H%M%S")
    )
}

fn is_archive_name(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(ARCHIVE_SUFFIX)
}

#[derive(Debug, Clone)]
pub struct DiskStorage {
    base_path: PathBuf,
}

impl DiskStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Writes the records, in the given order, into a new archive at `path`. The file is created
    /// exclusively and is left on disk when a write fails.
    pub fn save_at_path(
        &self,
        records: &[MemoryRecord],
        path: &Path,
    ) -> Result<SavedArchive, ArchiveError> {
        if records.is_empty() {
            return Err(ArchiveError::Empty);
        }
        let start = Instant::now();
        let file = create_exclusive(path)?;
        debug!("Writing {} records to {}", records.len(), path.display());

        let mut saved = Vec::with_capacity(records.len());
        let result = write_entries(file, records, &mut saved);
        if let Err(source) = result {
            error!("Archive | unable to write {}: {source}", path.display());
            return Err(ArchiveError::Write {
                path: path.to_path_buf(),
                saved,
                source,
            });
        }
        info!(
            "Wrote {} records to disk in {}ms",
            saved.len(),
            start.elapsed().as_millis()
        );
        Ok(SavedArchive {
            path: path.to_path_buf(),
            saved,
        })
    }

    /// Archive files sorted by name, oldest first. Unreadable entries are logged and skipped.
    pub fn list(&self) -> Result<Vec<ArchiveFile>, ArchiveError> {
        let (files, errors) = self.scan()?;
        for e in errors {
            warn!("Archive | skipping unreadable entry {e}");
        }
        Ok(files)
    }

    /// Archive files plus the errors met while walking the directory.
    fn scan(&self) -> Result<(Vec<ArchiveFile>, Vec<String>), ArchiveError> {
        let entries = match fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
            Err(source) => {
                return Err(ArchiveError::Read {
                    path: self.base_path.clone(),
                    source,
                })
            }
        };
        let entries = entries.map(|entry| entry.map(|e| (e.path(), e.metadata())));
        Ok(collect_archives(&self.base_path, entries))
    }

    pub fn last_archive(&self) -> Result<Option<PathBuf>, ArchiveError> {
        Ok(self.list()?.pop().map(|f| f.path))
    }

    /// The newest archive modified after `since`, if any.
    pub fn summary(&self, since: DateTime<Utc>) -> Result<Option<ArchiveFile>, ArchiveError> {
        let last = self
            .list()?
            .into_iter()
            .filter(|f| f.modified > since)
            .last();
        if let Some(file) = &last {
            debug!("Found files to send: {}", file.path.display());
        }
        Ok(last)
    }

    /// Keeps only the newest `keep` archives.
    pub fn prune_by_count(&self, keep: usize) -> Result<usize, ArchiveError> {
        let files = self.list()?;
        let excess = files.len().saturating_sub(keep);
        let paths: Vec<PathBuf> = files.into_iter().take(excess).map(|f| f.path).collect();
        let (count, errors) = remove_all(&paths);
        aggregate(errors)?;
        Ok(count)
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>, ArchiveError> {
        fs::read(path).map_err(|source| ArchiveError::Read {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ArchiveStore for DiskStorage {
    fn save(&self, records: &[MemoryRecord]) -> Result<SavedArchive, ArchiveError> {
        let first = records.first().ok_or(ArchiveError::Empty)?;
        fs::create_dir_all(&self.base_path).map_err(|source| ArchiveError::Create {
            path: self.base_path.clone(),
            source,
        })?;
        let path = self.base_path.join(archive_name(first.at));
        self.save_at_path(records, &path)
    }

    /// Deletes archives whose modification time is strictly before `older_than`. Every file is
    /// attempted even when some deletions or directory entries fail.
    fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, ArchiveError> {
        let (files, mut errors) = self.scan()?;
        let paths: Vec<PathBuf> = files
            .into_iter()
            .filter(|f| f.modified < older_than)
            .map(|f| f.path)
            .collect();
        let (count, failed) = remove_all(&paths);
        errors.extend(failed);
        if count > 0 {
            debug!(
                "Deleted {count} files older than {}",
                older_than.to_rfc3339()
            );
        }
        aggregate(errors)?;
        Ok(count)
    }
}

/// Keeps the archive entries of a directory walk and collects the errors of the others.
fn collect_archives(
    base_path: &Path,
    entries: impl Iterator<Item = io::Result<(PathBuf, io::Result<fs::Metadata>)>>,
) -> (Vec<ArchiveFile>, Vec<String>) {
    let mut files = Vec::new();
    let mut errors = Vec::new();
    for entry in entries {
        let (path, metadata) = match entry {
            Ok(entry) => entry,
            Err(e) => {
                errors.push(format!("{}: {e}", base_path.display()));
                continue;
            }
        };
        let is_archive = path
            .file_name()
            .map(|name| is_archive_name(&name.to_string_lossy()))
            .unwrap_or(false);
        if !is_archive {
            continue;
        }
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(e) => {
                errors.push(format!("{}: {e}", path.display()));
                continue;
            }
        };
        if metadata.is_dir() {
            continue;
        }
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        files.push(ArchiveFile {
            path,
            modified,
            size: metadata.len(),
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    (files, errors)
}

fn remove_all(paths: &[PathBuf]) -> (usize, Vec<String>) {
    let mut count = 0;
    let mut errors = Vec::new();
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => count += 1,
            Err(e) => errors.push(format!("{}: {e}", path.display())),
        }
    }
    (count, errors)
}

fn aggregate(mut errors: Vec<String>) -> Result<(), ArchiveError> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(ArchiveError::PruneFailed(errors.remove(0))),
        n => Err(ArchiveError::PruneFailedMany {
            count: n,
            first: errors.remove(0),
        }),
    }
}

fn create_exclusive(path: &Path) -> Result<File, ArchiveError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(ENTRY_MODE);
    }
    options.open(path).map_err(|source| {
        if source.kind() == io::ErrorKind::AlreadyExists {
            error!("Tried to copy to {} which already exists", path.display());
            ArchiveError::AlreadyExists(path.to_path_buf())
        } else {
            ArchiveError::Create {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn write_entries(
    file: File,
    records: &[MemoryRecord],
    saved: &mut Vec<String>,
) -> io::Result<()> {
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for record in records {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(ENTRY_MODE);
        header.set_size(record.data.len() as u64);
        header.set_mtime(u64::try_from(record.at.timestamp()).unwrap_or_default());
        builder.append_data(&mut header, &record.name, record.data.as_slice())?;
        saved.push(record.name.clone());
    }
    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    let file = encoder.finish()?;
    file.sync_all()
}

/// Reads an archive back into memory records, in archive order. Fingerprints are not stored on
/// disk and come back empty.
pub fn read_archive<R: Read>(reader: R) -> io::Result<Vec<MemoryRecord>> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut records = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let mtime = entry.header().mtime()?;
        let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
        entry.read_to_end(&mut data)?;
        records.push(MemoryRecord {
            name,
            fingerprint: None,
            at: Utc
                .timestamp_opt(i64::try_from(mtime).unwrap_or_default(), 0)
                .single()
                .unwrap_or_default(),
            data,
        });
    }
    Ok(records)
}

pub fn read_archive_file(path: &Path) -> Result<Vec<MemoryRecord>, ArchiveError> {
    let file = File::open(path).map_err(|source| ArchiveError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    read_archive(file).map_err(|source| ArchiveError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use std::time::SystemTime;

    fn record(name: &str, at: DateTime<Utc>, data: &[u8]) -> MemoryRecord {
        MemoryRecord {
            name: name.to_string(),
            fingerprint: None,
            at,
            data: data.to_vec(),
        }
    }

    fn touch(path: &Path, modified: SystemTime) {
        fs::write(path, b"x").unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    #[test]
    fn test_archive_name_uses_first_record_time() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(archive_name(at), "insights-2024-01-02-030405.tar.gz");
    }

    #[test]
    fn test_save_writes_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let records = vec![
            record("config/id", at, b"abc"),
            record("config/version.json", at + Duration::seconds(1), b"{}"),
        ];

        let saved = storage.save(&records).unwrap();
        assert_eq!(
            saved.path,
            dir.path().join("insights-2024-01-02-030405.tar.gz")
        );
        assert_eq!(saved.saved, vec!["config/id", "config/version.json"]);

        let file = File::open(&saved.path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.header().mode().unwrap(), 0o640);
            assert_eq!(entry.header().entry_type(), tar::EntryType::Regular);
        }

        let back = read_archive_file(&saved.path).unwrap();
        assert_eq!(back, records);
    }

    #[test]
    fn test_save_refuses_existing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());
        let records = vec![record("a", Utc::now(), b"1")];
        storage.save(&records).unwrap();
        assert!(matches!(
            storage.save(&records).unwrap_err(),
            ArchiveError::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_save_rejects_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());
        assert!(matches!(storage.save(&[]).unwrap_err(), ArchiveError::Empty));
    }

    #[test]
    fn test_prune_only_touches_old_archives() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());
        let now = SystemTime::now();
        let old = now - std::time::Duration::from_secs(3600);

        touch(&dir.path().join("insights-2024-01-01-000000.tar.gz"), old);
        touch(&dir.path().join("insights-2024-01-01-010000.tar.gz"), now);
        touch(&dir.path().join("notes.txt"), old);
        touch(&dir.path().join("insights-2024-01-01-000000.tar"), old);

        let cutoff = DateTime::<Utc>::from(now - std::time::Duration::from_secs(60));
        assert_eq!(storage.prune(cutoff).unwrap(), 1);

        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                "insights-2024-01-01-000000.tar",
                "insights-2024-01-01-010000.tar.gz",
                "notes.txt"
            ]
        );
    }

    #[test]
    fn test_last_archive_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());
        assert_eq!(storage.last_archive().unwrap(), None);

        let now = SystemTime::now();
        let older = dir.path().join("insights-2024-01-01-000000.tar.gz");
        let newer = dir.path().join("insights-2024-01-02-000000.tar.gz");
        touch(&older, now - std::time::Duration::from_secs(7200));
        touch(&newer, now - std::time::Duration::from_secs(3600));

        assert_eq!(storage.last_archive().unwrap(), Some(newer.clone()));
        let since = DateTime::<Utc>::from(now - std::time::Duration::from_secs(5400));
        assert_eq!(storage.summary(since).unwrap().map(|f| f.path), Some(newer));
        assert_eq!(storage.summary(DateTime::<Utc>::from(now)).unwrap(), None);
    }

    #[test]
    fn test_unreadable_entries_do_not_stop_listing() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("insights-2024-01-01-000000.tar.gz");
        touch(&good, SystemTime::now());
        let entries = vec![
            Err(io::Error::other("entry vanished")),
            Ok((
                dir.path().join("insights-2024-01-02-000000.tar.gz"),
                Err(io::Error::other("stat failed")),
            )),
            Ok((
                dir.path().join("notes.txt"),
                Err(io::Error::other("ignored for other files")),
            )),
            Ok((good.clone(), fs::metadata(&good))),
        ];

        let (files, errors) = collect_archives(dir.path(), entries.into_iter());

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, good);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("entry vanished"));
        assert!(errors[1].contains("insights-2024-01-02-000000.tar.gz"));
        assert!(matches!(
            aggregate(errors),
            Err(ArchiveError::PruneFailedMany { count: 2, .. })
        ));
    }

    #[test]
    fn test_prune_by_count_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());
        for day in 1..=7 {
            touch(
                &dir.path().join(format!("insights-2024-01-0{day}-000000.tar.gz")),
                SystemTime::now(),
            );
        }
        assert_eq!(storage.prune_by_count(5).unwrap(), 2);
        let names: Vec<PathBuf> = storage.list().unwrap().into_iter().map(|f| f.path).collect();
        assert_eq!(names.len(), 5);
        assert_eq!(
            names[0],
            dir.path().join("insights-2024-01-03-000000.tar.gz")
        );
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let storage = DiskStorage::new("/nonexistent/insights/archives");
        assert!(storage.list().unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn prop_archive_round_trip(
            entries in proptest::collection::btree_map("[a-z]{1,8}(/[a-z]{1,8}){0,2}", proptest::collection::vec(any::<u8>(), 0..512), 1..8),
            base in 1_600_000_000i64..1_900_000_000,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let storage = DiskStorage::new(dir.path());
            let records: Vec<MemoryRecord> = entries
                .into_iter()
                .enumerate()
                .map(|(i, (name, data))| MemoryRecord {
                    name,
                    fingerprint: None,
                    at: Utc.timestamp_opt(base + i as i64, 0).unwrap(),
                    data,
                })
                .collect();
            let saved = storage.save(&records).unwrap();
            prop_assert_eq!(read_archive_file(&saved.path).unwrap(), records);
        }
    }
}
