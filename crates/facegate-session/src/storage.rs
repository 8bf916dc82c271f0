//! Session-scoped storage for the verified label.
//!
//! Downstream consumers read the record stored under [`VERIFIED_LABEL_KEY`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Key under which the verified label is stored.
pub const VERIFIED_LABEL_KEY: &str = "verifiedLabel";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store document malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// What a successful verification leaves behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedRecord {
    pub label: String,
    pub distance: f32,
    pub verified_at: DateTime<Utc>,
}

impl VerifiedRecord {
    pub fn now(label: impl Into<String>, distance: f32) -> Self {
        Self {
            label: label.into(),
            distance,
            verified_at: Utc::now(),
        }
    }
}

pub trait LabelStore: Send + Sync {
    fn get(&self) -> Result<Option<VerifiedRecord>, StoreError>;
    fn set(&self, record: &VerifiedRecord) -> Result<(), StoreError>;
    /// Remove the record. Clearing an empty store succeeds.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Process-lifetime store.
#[derive(Default)]
pub struct MemoryLabelStore {
    record: Mutex<Option<VerifiedRecord>>,
}

impl LabelStore for MemoryLabelStore {
    fn get(&self) -> Result<Option<VerifiedRecord>, StoreError> {
        Ok(self.record.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn set(&self, record: &VerifiedRecord) -> Result<(), StoreError> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

/// JSON document on disk, one key per stored value. Other keys are preserved.
///
/// Lives under the runtime directory by default, so it does not outlive the
/// login session.
pub struct FileLabelStore {
    path: PathBuf,
}

impl FileLabelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read_document(&self) -> Result<Map<String, Value>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(Map::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn write_document(&self, doc: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(doc)?).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }
}

impl LabelStore for FileLabelStore {
    fn get(&self) -> Result<Option<VerifiedRecord>, StoreError> {
        let doc = self.read_document()?;
        doc.get(VERIFIED_LABEL_KEY)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(StoreError::from)
    }

    fn set(&self, record: &VerifiedRecord) -> Result<(), StoreError> {
        let mut doc = self.read_document()?;
        doc.insert(VERIFIED_LABEL_KEY.to_string(), serde_json::to_value(record)?);
        self.write_document(&doc)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut doc = self.read_document()?;
        if doc.remove(VERIFIED_LABEL_KEY).is_none() {
            return Ok(());
        }
        self.write_document(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryLabelStore::default();
        assert_eq!(store.get().unwrap(), None);

        let record = VerifiedRecord::now("a", 0.3);
        store.set(&record).unwrap();
        assert_eq!(store.get().unwrap(), Some(record));

        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn test_file_store_uses_well_known_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/session.json");
        let store = FileLabelStore::new(&path);

        assert_eq!(store.get().unwrap(), None);
        store.set(&VerifiedRecord::now("b", 0.21)).unwrap();

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc[VERIFIED_LABEL_KEY]["label"], "b");
        assert_eq!(store.get().unwrap().map(|r| r.label).as_deref(), Some("b"));
    }

    #[test]
    fn test_file_store_clear_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"theme": "dark"}"#).unwrap();

        let store = FileLabelStore::new(&path);
        store.set(&VerifiedRecord::now("a", 0.1)).unwrap();
        store.clear().unwrap();

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["theme"], "dark");
        assert!(doc.get(VERIFIED_LABEL_KEY).is_none());
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn test_file_store_clear_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLabelStore::new(dir.path().join("missing.json"));
        store.clear().unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_file_store_rejects_malformed_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(FileLabelStore::new(&path).get(), Err(StoreError::Malformed(_))));
    }
}
