//! Persistence collaborators for saved filters.
//!
//! The store hands the complete filter document to a [`FilterPersistence`]
//! after every mutation. Calls are synchronous and failures are surfaced to
//! the caller, never retried.
//!
//! - [`JsonFilePersistence`] writes a JSON file through a temporary sibling
//!   and a rename, so a crash mid-write leaves the previous document intact.
//! - [`MemoryPersistence`] keeps the document in memory and can be told to
//!   refuse writes.

use std::fs;
use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ti_core::SavedFilter;

use crate::error::StorageError;

const fn first_id() -> u64 {
    1
}

/// The persisted filter document.
///
/// ```json
/// { "next_id": 3, "filters": [ { "id": 1, "name": "errors", "source": { "kind": "expression", "code": "..." } } ] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSnapshot {
    /// Id the next added filter receives.
    #[serde(default = "first_id")]
    pub next_id: u64,

    /// Saved filters in display order.
    #[serde(default)]
    pub filters: Vec<SavedFilter>,
}

impl Default for FilterSnapshot {
    fn default() -> Self {
        Self {
            next_id: first_id(),
            filters: Vec::new(),
        }
    }
}

/// Durable storage for the filter document.
pub trait FilterPersistence: Send + Sync {
    /// Loads the stored document; `None` if nothing has been saved yet.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the document exists but cannot be read.
    fn load(&self) -> Result<Option<FilterSnapshot>, StorageError>;

    /// Replaces the stored document.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the document cannot be written.
    fn save(&self, snapshot: &FilterSnapshot) -> Result<(), StorageError>;
}

/// Stores filters in a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: Utf8PathBuf,
}

impl JsonFilePersistence {
    /// Creates a collaborator for the file at `path`. Nothing is read yet.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn temp_path(&self) -> Utf8PathBuf {
        let mut name = self.path.file_name().unwrap_or("filters").to_owned();
        name.push_str(".tmp");
        self.path.with_file_name(name)
    }
}

impl FilterPersistence for JsonFilePersistence {
    fn load(&self) -> Result<Option<FilterSnapshot>, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path, "no filter file yet");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let snapshot: FilterSnapshot = serde_json::from_slice(&bytes)?;
        tracing::info!(path = %self.path, filters = snapshot.filters.len(), "loaded saved filters");
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &FilterSnapshot) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path();
        let written = write_document(&temp, snapshot)
            .and_then(|()| fs::rename(&temp, &self.path).map_err(StorageError::from));
        if let Err(err) = written {
            match fs::remove_file(&temp) {
                Ok(()) => {}
                Err(cleanup) if cleanup.kind() == std::io::ErrorKind::NotFound => {}
                Err(cleanup) => {
                    tracing::warn!(path = %temp, error = %cleanup, "could not remove temporary filter file");
                }
            }
            return Err(err);
        }

        tracing::debug!(path = %self.path, filters = snapshot.filters.len(), "saved filters");
        Ok(())
    }
}

fn write_document(path: &Utf8Path, snapshot: &FilterSnapshot) -> Result<(), StorageError> {
    let mut file = fs::File::create(path)?;
    serde_json::to_writer_pretty(&mut file, snapshot)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

/// Keeps the filter document in memory.
///
/// Clones share the same document, so a test can keep a handle after giving
/// one to a store.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    inner: Arc<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshot: Mutex<Option<FilterSnapshot>>,
    refuse_writes: AtomicBool,
}

impl MemoryPersistence {
    /// Creates an empty in-memory collaborator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collaborator that already holds `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: FilterSnapshot) -> Self {
        let persistence = Self::new();
        *persistence.inner.snapshot.lock() = Some(snapshot);
        persistence
    }

    /// Makes subsequent saves fail (or succeed again).
    pub fn refuse_writes(&self, refuse: bool) {
        self.inner.refuse_writes.store(refuse, Ordering::Relaxed);
    }

    /// Returns the last saved document.
    #[must_use]
    pub fn snapshot(&self) -> Option<FilterSnapshot> {
        self.inner.snapshot.lock().clone()
    }
}

impl FilterPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<FilterSnapshot>, StorageError> {
        Ok(self.snapshot())
    }

    fn save(&self, snapshot: &FilterSnapshot) -> Result<(), StorageError> {
        if self.inner.refuse_writes.load(Ordering::Relaxed) {
            return Err(StorageError::Unavailable("writes refused".to_owned()));
        }
        *self.inner.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ti_core::{FilterDefinition, FilterId, PredicateSource};

    use super::*;

    fn sample() -> FilterSnapshot {
        FilterSnapshot {
            next_id: 3,
            filters: vec![SavedFilter {
                id: FilterId::new(2),
                definition: FilterDefinition::new(
                    "errors",
                    PredicateSource::expression(r#"value.level == "error""#),
                ),
            }],
        }
    }

    #[test]
    fn test_json_file_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("filters.json")).unwrap();
        let persistence = JsonFilePersistence::new(path);
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn test_json_file_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("nested/filters.json")).unwrap();
        let persistence = JsonFilePersistence::new(path.clone());

        persistence.save(&sample()).unwrap();
        assert!(path.exists());
        assert!(!persistence.temp_path().exists());
        assert_eq!(persistence.load().unwrap(), Some(sample()));
    }

    #[test]
    fn test_json_file_failed_save_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("filters.json")).unwrap();
        // A directory in the way makes the final rename fail.
        fs::create_dir(&path).unwrap();
        let persistence = JsonFilePersistence::new(path);

        assert!(persistence.save(&sample()).is_err());
        assert!(!persistence.temp_path().exists());
    }

    #[test]
    fn test_json_file_document_shape() {
        let json = serde_json::to_string(&sample()).unwrap();
        insta::assert_snapshot!(json, @r#"{"next_id":3,"filters":[{"id":2,"name":"errors","source":{"kind":"expression","code":"value.level == \"error\""}}]}"#);
    }

    #[test]
    fn test_json_file_corrupt_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("filters.json")).unwrap();
        fs::write(&path, "not json").unwrap();
        let err = JsonFilePersistence::new(path).load().unwrap_err();
        assert!(matches!(err, StorageError::Format(_)));
    }

    #[test]
    fn test_memory_refuses_writes() {
        let persistence = MemoryPersistence::new();
        persistence.refuse_writes(true);
        assert!(persistence.save(&sample()).is_err());
        assert!(persistence.snapshot().is_none());

        persistence.refuse_writes(false);
        persistence.save(&sample()).unwrap();
        assert_eq!(persistence.clone().load().unwrap(), Some(sample()));
    }
}
