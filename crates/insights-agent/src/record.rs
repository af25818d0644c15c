// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Records produced by gathering functions.
//!
//! A [`Record`] is lazy: its bytes are produced by the [`Marshalable`] item only when the
//! recorder asks for them. Once materialized it becomes a [`MemoryRecord`], which is what the
//! archive store writes to disk.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Upper bound for a single serialized record.
pub const ARCHIVE_HARD_CAP: usize = 8 * 1024 * 1024;

/// Name of the record carrying the archive metadata.
pub const METADATA_RECORD_NAME: &str = "insights-operator/gathers";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record name must not be empty")]
    EmptyName,
    #[error("record {name} (size={size}) exceeds the archive size limit {cap}")]
    TooLarge {
        name: String,
        size: usize,
        cap: usize,
    },
    #[error("unable to serialize record {name}: {reason}")]
    Serialization { name: String, reason: String },
}

/// Producer of the record bytes.
pub trait Marshalable: Send + Sync {
    fn marshal(&self) -> Result<Vec<u8>, String>;

    /// File extension appended to the record name, without the dot. Empty for raw data.
    fn extension(&self) -> &'static str;
}

/// Serializes any `Serialize` value as JSON.
pub struct JsonMarshaller<T>(pub T);

impl<T> Marshalable for JsonMarshaller<T>
where
    T: Serialize + Send + Sync,
{
    fn marshal(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&self.0).map_err(|e| e.to_string())
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}

/// Raw bytes written as-is.
pub struct RawBytes(pub Vec<u8>);

impl Marshalable for RawBytes {
    fn marshal(&self) -> Result<Vec<u8>, String> {
        Ok(self.0.clone())
    }

    fn extension(&self) -> &'static str {
        ""
    }
}

pub struct Record {
    pub name: String,
    /// `None` means "at flush time".
    pub captured_at: Option<DateTime<Utc>>,
    pub fingerprint: Option<String>,
    pub item: Box<dyn Marshalable>,
}

impl Record {
    pub fn new(name: impl Into<String>, item: impl Marshalable + 'static) -> Self {
        Self {
            name: name.into(),
            captured_at: None,
            fingerprint: None,
            item: Box::new(item),
        }
    }

    pub fn json<T>(name: impl Into<String>, value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self::new(name, JsonMarshaller(value))
    }

    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        let fingerprint = fingerprint.into();
        self.fingerprint = if fingerprint.is_empty() {
            None
        } else {
            Some(fingerprint)
        };
        self
    }

    #[must_use]
    pub fn with_captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = Some(at);
        self
    }

    /// Name of the entry in the archive, including the serialization suffix.
    pub fn filename(&self) -> String {
        let extension = self.item.extension();
        if extension.is_empty() || self.name.ends_with(&format!(".{extension}")) {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, extension)
        }
    }

    /// Produces the record bytes, enforcing the name and size rules.
    pub fn marshal(&self) -> Result<Vec<u8>, RecordError> {
        if self.name.trim().is_empty() {
            return Err(RecordError::EmptyName);
        }
        let data = self
            .item
            .marshal()
            .map_err(|reason| RecordError::Serialization {
                name: self.name.clone(),
                reason,
            })?;
        if data.len() > ARCHIVE_HARD_CAP {
            return Err(RecordError::TooLarge {
                name: self.filename(),
                size: data.len(),
                cap: ARCHIVE_HARD_CAP,
            });
        }
        Ok(data)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name)
            .field("captured_at", &self.captured_at)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Materialized record as held by the recorder and written to the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRecord {
    pub name: String,
    pub fingerprint: Option<String>,
    pub at: DateTime<Utc>,
    pub data: Vec<u8>,
}

/// Stable sort by capture time, oldest first.
pub fn sort_by_time(records: &mut [MemoryRecord]) {
    records.sort_by_key(|r| r.at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    struct Failing;

    impl Marshalable for Failing {
        fn marshal(&self) -> Result<Vec<u8>, String> {
            Err("boom".to_string())
        }

        fn extension(&self) -> &'static str {
            "json"
        }
    }

    #[test]
    fn test_filename_suffix() {
        let record = Record::json("config/version", BTreeMap::<String, String>::new());
        assert_eq!(record.filename(), "config/version.json");

        let record = Record::json("config/version.json", BTreeMap::<String, String>::new());
        assert_eq!(record.filename(), "config/version.json");

        let record = Record::new("insights-operator/gathers", RawBytes(vec![]));
        assert_eq!(record.filename(), "insights-operator/gathers");
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let record = Record::new("  ", RawBytes(b"data".to_vec()));
        assert_eq!(record.marshal(), Err(RecordError::EmptyName));
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let record = Record::new("big", RawBytes(vec![0; ARCHIVE_HARD_CAP + 1]));
        assert!(matches!(
            record.marshal(),
            Err(RecordError::TooLarge { size, .. }) if size == ARCHIVE_HARD_CAP + 1
        ));
    }

    #[test]
    fn test_serialization_error_carries_name() {
        let record = Record::new("broken", Failing);
        assert_eq!(
            record.marshal(),
            Err(RecordError::Serialization {
                name: "broken".to_string(),
                reason: "boom".to_string()
            })
        );
    }

    #[test]
    fn test_empty_fingerprint_is_none() {
        let record = Record::new("a", RawBytes(vec![])).with_fingerprint("");
        assert!(record.fingerprint.is_none());
    }

    #[test]
    fn test_sort_by_time_is_stable() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mk = |name: &str, at| MemoryRecord {
            name: name.to_string(),
            fingerprint: None,
            at,
            data: vec![],
        };
        let mut records = vec![mk("b", t1), mk("a", t1), mk("c", t0)];
        sort_by_time(&mut records);
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }
}
