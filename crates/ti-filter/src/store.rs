//! The saved-filter collection.
//!
//! [`FilterStore`] owns the ordered list of [`SavedFilter`]s and writes the
//! whole document through its [`FilterPersistence`] after every mutation.
//! A mutation is committed in memory only once the save succeeded, so the
//! store never diverges from what was persisted.
//!
//! [`SharedFilterStore`] is the handle passed around the workspace: cheap to
//! clone, with reads that always observe the latest committed mutation.
//!
//! # Examples
//!
//! ```
//! use ti_core::{FilterDefinition, PredicateSource};
//! use ti_filter::SharedFilterStore;
//!
//! let store = SharedFilterStore::in_memory();
//! let id = store
//!     .add(FilterDefinition::new("errors", PredicateSource::expression(r#"value.level == "error""#)))
//!     .unwrap();
//!
//! assert_eq!(store.list().len(), 1);
//! assert_eq!(store.get(id).unwrap().definition.name, "errors");
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use ti_core::{FilterDefinition, FilterId, SavedFilter};

use crate::error::{FilterError, StorageError};
use crate::persist::{FilterPersistence, FilterSnapshot, MemoryPersistence};

/// Ordered, persisted collection of saved filters.
pub struct FilterStore {
    persistence: Box<dyn FilterPersistence>,
    filters: Vec<SavedFilter>,
    next_id: u64,
}

impl FilterStore {
    /// Opens a store, loading whatever the collaborator holds.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the stored document cannot be loaded.
    pub fn open(persistence: impl FilterPersistence + 'static) -> Result<Self, StorageError> {
        let snapshot = persistence.load()?.unwrap_or_default();
        let highest = snapshot.filters.iter().map(|f| f.id.get()).max().unwrap_or(0);
        let after_highest = highest.checked_add(1).ok_or_else(|| {
            StorageError::Inconsistent(format!("filter id {highest} leaves no id to assign"))
        })?;
        Ok(Self {
            next_id: snapshot.next_id.max(after_highest),
            filters: snapshot.filters,
            persistence: Box::new(persistence),
        })
    }

    /// Creates an empty store that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            persistence: Box::new(MemoryPersistence::new()),
            filters: Vec::new(),
            next_id: 1,
        }
    }

    /// Adds a filter and returns its freshly assigned id.
    ///
    /// # Errors
    ///
    /// - [`FilterError::Validation`] if the predicate source is empty
    /// - [`FilterError::Storage`] if the save failed; the store is unchanged
    pub fn add(&mut self, definition: FilterDefinition) -> Result<FilterId, FilterError> {
        validate(&definition)?;

        let id = FilterId::new(self.next_id);
        let next_id = self.next_id.checked_add(1).ok_or_else(|| {
            StorageError::Inconsistent("filter ids are exhausted".to_owned())
        })?;
        let mut filters = self.filters.clone();
        filters.push(SavedFilter { id, definition });
        self.commit(filters, next_id)?;

        tracing::info!(filter = %id, "added filter");
        Ok(id)
    }

    /// Replaces the definition stored under `id`.
    ///
    /// # Errors
    ///
    /// - [`FilterError::Validation`] if the predicate source is empty
    /// - [`FilterError::NotFound`] if no filter has this id
    /// - [`FilterError::Storage`] if the save failed; the store is unchanged
    pub fn edit(&mut self, id: FilterId, definition: FilterDefinition) -> Result<(), FilterError> {
        validate(&definition)?;
        let index = self.position(id).ok_or(FilterError::NotFound(id))?;

        let mut filters = self.filters.clone();
        filters[index].definition = definition;
        self.commit(filters, self.next_id)?;

        tracing::info!(filter = %id, "edited filter");
        Ok(())
    }

    /// Deletes the filter stored under `id` and returns it.
    ///
    /// The store knows nothing about selection; callers holding `id` as the
    /// active filter must fall back to pass-through themselves.
    ///
    /// # Errors
    ///
    /// - [`FilterError::NotFound`] if no filter has this id
    /// - [`FilterError::Storage`] if the save failed; the store is unchanged
    pub fn remove(&mut self, id: FilterId) -> Result<SavedFilter, FilterError> {
        let index = self.position(id).ok_or(FilterError::NotFound(id))?;

        let mut filters = self.filters.clone();
        let removed = filters.remove(index);
        self.commit(filters, self.next_id)?;

        tracing::info!(filter = %id, "removed filter");
        Ok(removed)
    }

    /// Saved filters in display (insertion) order.
    #[must_use]
    pub fn list(&self) -> &[SavedFilter] {
        &self.filters
    }

    /// Returns the filter stored under `id`.
    #[must_use]
    pub fn get(&self, id: FilterId) -> Option<&SavedFilter> {
        self.filters.iter().find(|f| f.id == id)
    }

    /// Number of saved filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns `true` if nothing is saved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    fn position(&self, id: FilterId) -> Option<usize> {
        self.filters.iter().position(|f| f.id == id)
    }

    fn commit(&mut self, filters: Vec<SavedFilter>, next_id: u64) -> Result<(), StorageError> {
        let snapshot = FilterSnapshot { next_id, filters };
        if let Err(err) = self.persistence.save(&snapshot) {
            tracing::warn!(error = %err, "failed to persist filters");
            return Err(err);
        }
        self.filters = snapshot.filters;
        self.next_id = next_id;
        Ok(())
    }
}

impl std::fmt::Debug for FilterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterStore")
            .field("filters", &self.filters.len())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

fn validate(definition: &FilterDefinition) -> Result<(), FilterError> {
    if definition.source.is_empty() {
        return Err(FilterError::validation("predicate source is empty"));
    }
    Ok(())
}

/// A cloneable handle to one [`FilterStore`].
///
/// Every method takes the lock for the duration of one call, so each
/// mutation is atomic with respect to other holders. Reads clone the data
/// out instead of exposing guards.
#[derive(Debug, Clone)]
pub struct SharedFilterStore {
    inner: Arc<RwLock<FilterStore>>,
}

impl SharedFilterStore {
    /// Wraps an opened store.
    #[must_use]
    pub fn new(store: FilterStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    /// Opens a store over `persistence`.
    ///
    /// # Errors
    ///
    /// See [`FilterStore::open`].
    pub fn open(persistence: impl FilterPersistence + 'static) -> Result<Self, StorageError> {
        FilterStore::open(persistence).map(Self::new)
    }

    /// An empty in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(FilterStore::in_memory())
    }

    /// See [`FilterStore::add`].
    ///
    /// # Errors
    ///
    /// See [`FilterStore::add`].
    pub fn add(&self, definition: FilterDefinition) -> Result<FilterId, FilterError> {
        self.inner.write().add(definition)
    }

    /// See [`FilterStore::edit`].
    ///
    /// # Errors
    ///
    /// See [`FilterStore::edit`].
    pub fn edit(&self, id: FilterId, definition: FilterDefinition) -> Result<(), FilterError> {
        self.inner.write().edit(id, definition)
    }

    /// See [`FilterStore::remove`].
    ///
    /// # Errors
    ///
    /// See [`FilterStore::remove`].
    pub fn remove(&self, id: FilterId) -> Result<SavedFilter, FilterError> {
        self.inner.write().remove(id)
    }

    /// A copy of the saved filters in display order.
    #[must_use]
    pub fn list(&self) -> Vec<SavedFilter> {
        self.inner.read().list().to_vec()
    }

    /// A copy of the filter stored under `id`.
    #[must_use]
    pub fn get(&self, id: FilterId) -> Option<SavedFilter> {
        self.inner.read().get(id).cloned()
    }

    /// Returns `true` if a filter is stored under `id`.
    #[must_use]
    pub fn contains(&self, id: FilterId) -> bool {
        self.inner.read().get(id).is_some()
    }

    /// Returns `true` if nothing is saved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ti_core::{FieldConstraint, MessageField, PredicateSource};

    use super::*;

    fn def(name: &str, code: &str) -> FilterDefinition {
        FilterDefinition::new(name, PredicateSource::expression(code))
    }

    fn names(store: &FilterStore) -> Vec<&str> {
        store.list().iter().map(|f| f.definition.name.as_str()).collect()
    }

    #[test]
    fn test_add_assigns_increasing_ids_in_order() {
        let mut store = FilterStore::in_memory();
        let a = store.add(def("errors", "true")).unwrap();
        let b = store.add(def("retries", "false")).unwrap();
        assert_eq!((a.get(), b.get()), (1, 2));
        assert_eq!(names(&store), vec!["errors", "retries"]);
    }

    #[test]
    fn test_add_rejects_empty_source() {
        let mut store = FilterStore::in_memory();
        let err = store.add(def("blank", "   ")).unwrap_err();
        assert!(matches!(err, FilterError::Validation { .. }));

        let err = store
            .add(FilterDefinition::new("none", PredicateSource::structural(Vec::new())))
            .unwrap_err();
        assert!(matches!(err, FilterError::Validation { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_edit_replaces_wholesale() {
        let mut store = FilterStore::in_memory();
        let id = store.add(def("errors", "true")).unwrap();
        let replacement = FilterDefinition::new(
            "api",
            PredicateSource::structural(vec![FieldConstraint::equals(MessageField::Key, "api")]),
        );
        store.edit(id, replacement.clone()).unwrap();
        assert_eq!(store.get(id).unwrap().definition, replacement);
    }

    #[test]
    fn test_edit_and_remove_missing_id() {
        let mut store = FilterStore::in_memory();
        let missing = FilterId::new(9);
        assert!(matches!(store.edit(missing, def("x", "true")), Err(FilterError::NotFound(id)) if id == missing));
        assert!(matches!(store.remove(missing), Err(FilterError::NotFound(_))));
    }

    #[test]
    fn test_ids_never_reused() {
        let mut store = FilterStore::in_memory();
        let first = store.add(def("a", "true")).unwrap();
        store.remove(first).unwrap();
        let second = store.add(def("b", "true")).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.get(), 2);
    }

    #[test]
    fn test_reopen_keeps_ids_and_order() {
        let persistence = MemoryPersistence::new();
        {
            let mut store = FilterStore::open(persistence.clone()).unwrap();
            let a = store.add(def("a", "true")).unwrap();
            store.add(def("b", "true")).unwrap();
            store.remove(a).unwrap();
        }

        let mut store = FilterStore::open(persistence).unwrap();
        assert_eq!(names(&store), vec!["b"]);
        assert_eq!(store.add(def("c", "true")).unwrap().get(), 3);
    }

    #[test]
    fn test_open_repairs_stale_next_id() {
        let snapshot = FilterSnapshot {
            next_id: 1,
            filters: vec![SavedFilter {
                id: FilterId::new(5),
                definition: def("old", "true"),
            }],
        };
        let mut store = FilterStore::open(MemoryPersistence::with_snapshot(snapshot)).unwrap();
        assert_eq!(store.add(def("new", "true")).unwrap().get(), 6);
    }

    #[test]
    fn test_open_rejects_highest_possible_id() {
        let snapshot = FilterSnapshot {
            next_id: 1,
            filters: vec![SavedFilter {
                id: FilterId::new(u64::MAX),
                definition: def("edited by hand", "true"),
            }],
        };
        let err = FilterStore::open(MemoryPersistence::with_snapshot(snapshot)).unwrap_err();
        assert!(matches!(err, StorageError::Inconsistent(_)));
    }

    #[test]
    fn test_add_fails_once_ids_are_exhausted() {
        let snapshot = FilterSnapshot {
            next_id: u64::MAX,
            filters: Vec::new(),
        };
        let persistence = MemoryPersistence::with_snapshot(snapshot.clone());
        let mut store = FilterStore::open(persistence.clone()).unwrap();
        let err = store.add(def("late", "true")).unwrap_err();
        assert!(err.is_fatal());
        assert!(store.list().is_empty());
        assert_eq!(persistence.snapshot(), Some(snapshot));
    }

    #[test]
    fn test_failed_save_rolls_back() {
        let persistence = MemoryPersistence::new();
        let mut store = FilterStore::open(persistence.clone()).unwrap();
        let id = store.add(def("kept", "true")).unwrap();

        persistence.refuse_writes(true);
        let err = store.add(def("lost", "true")).unwrap_err();
        assert!(err.is_fatal());
        assert!(store.edit(id, def("renamed", "true")).is_err());
        assert!(store.remove(id).is_err());
        assert_eq!(names(&store), vec!["kept"]);

        persistence.refuse_writes(false);
        assert_eq!(store.add(def("next", "true")).unwrap().get(), 2);
    }

    #[test]
    fn test_empty_store_lists_nothing() {
        let store = SharedFilterStore::in_memory();
        assert!(store.list().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_shared_store_sees_latest_mutation() {
        let store = SharedFilterStore::in_memory();
        let other = store.clone();
        let id = store.add(def("errors", "true")).unwrap();
        other.edit(id, def("errors v2", "true")).unwrap();
        assert_eq!(store.get(id).unwrap().definition.name, "errors v2");
        assert!(store.contains(id));
        other.remove(id).unwrap();
        assert!(!store.contains(id));
    }
}
