//! Which filter applies to the current view.
//!
//! At most one filter is active: a saved filter referenced by id, the
//! transient (unsaved) filter, or none at all. Activating anything replaces
//! the previous selection entirely.

use ti_core::{FilterDefinition, FilterId, UNSAVED_FILTER_NAME};

use crate::error::FilterError;
use crate::store::SharedFilterStore;

/// The active selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveSelection {
    /// No filter; every message is included.
    #[default]
    PassThrough,
    /// The saved filter with this id.
    Saved(FilterId),
    /// The transient filter.
    Transient,
}

/// Selection state for one viewing session.
#[derive(Debug, Clone)]
pub struct FilterSelection {
    store: SharedFilterStore,
    active: ActiveSelection,
    transient: Option<FilterDefinition>,
}

impl FilterSelection {
    /// Creates a pass-through selection over `store`.
    #[must_use]
    pub fn new(store: SharedFilterStore) -> Self {
        Self {
            store,
            active: ActiveSelection::PassThrough,
            transient: None,
        }
    }

    /// Activates the saved filter `id` and discards the transient filter.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::NotFound`] if the store holds no such filter;
    /// the selection is unchanged.
    pub fn activate_saved(&mut self, id: FilterId) -> Result<(), FilterError> {
        if !self.store.contains(id) {
            return Err(FilterError::NotFound(id));
        }
        self.active = ActiveSelection::Saved(id);
        self.transient = None;
        Ok(())
    }

    /// Activates `definition` as the transient filter. The store is not touched.
    ///
    /// An empty name becomes [`UNSAVED_FILTER_NAME`].
    pub fn activate_transient(&mut self, mut definition: FilterDefinition) {
        if definition.name.trim().is_empty() {
            UNSAVED_FILTER_NAME.clone_into(&mut definition.name);
        }
        self.active = ActiveSelection::Transient;
        self.transient = Some(definition);
    }

    /// Switches to pass-through. A transient filter is kept for later
    /// saving until [`discard_transient`](Self::discard_transient).
    pub fn clear(&mut self) {
        self.active = ActiveSelection::PassThrough;
    }

    /// The active selection.
    #[must_use]
    pub const fn active(&self) -> ActiveSelection {
        self.active
    }

    /// The transient filter, active or not.
    #[must_use]
    pub const fn transient(&self) -> Option<&FilterDefinition> {
        self.transient.as_ref()
    }

    /// Resolves the active definition.
    ///
    /// Saved filters are read through the store on every call, so edits show
    /// up on the next resolution. A saved id the store no longer holds
    /// resolves to `None`.
    #[must_use]
    pub fn current(&self) -> Option<FilterDefinition> {
        match self.active {
            ActiveSelection::PassThrough => None,
            ActiveSelection::Saved(id) => self.store.get(id).map(|saved| saved.definition),
            ActiveSelection::Transient => self.transient.clone(),
        }
    }

    /// Clears the selection if `id` was the active saved filter.
    ///
    /// Returns `true` if the selection changed.
    pub fn on_removed(&mut self, id: FilterId) -> bool {
        if self.active == ActiveSelection::Saved(id) {
            self.clear();
            return true;
        }
        false
    }

    /// Saves the transient filter under `name` and activates the saved copy.
    ///
    /// # Errors
    ///
    /// - [`FilterError::Validation`] if there is no transient filter, or it
    ///   has an empty source
    /// - [`FilterError::Storage`] if the save failed; the selection is unchanged
    pub fn save_transient(&mut self, name: impl Into<String>) -> Result<FilterId, FilterError> {
        let Some(transient) = &self.transient else {
            return Err(FilterError::validation("no transient filter to save"));
        };
        let definition = FilterDefinition::new(name, transient.source.clone());
        let id = self.store.add(definition)?;
        self.active = ActiveSelection::Saved(id);
        self.transient = None;
        Ok(id)
    }

    /// Drops the transient filter, falling back to pass-through if it was active.
    pub fn discard_transient(&mut self) {
        if self.active == ActiveSelection::Transient {
            self.active = ActiveSelection::PassThrough;
        }
        self.transient = None;
    }

    /// The store this selection reads through.
    #[must_use]
    pub const fn store(&self) -> &SharedFilterStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use ti_core::PredicateSource;

    use super::*;

    fn def(name: &str, code: &str) -> FilterDefinition {
        FilterDefinition::new(name, PredicateSource::expression(code))
    }

    fn seeded() -> (SharedFilterStore, FilterId, FilterId) {
        let store = SharedFilterStore::in_memory();
        let errors = store.add(def("errors", r#"value.level == "error""#)).unwrap();
        let retries = store.add(def("retries", "value.attempt > 1")).unwrap();
        (store, errors, retries)
    }

    #[test]
    fn test_starts_as_pass_through() {
        let selection = FilterSelection::new(SharedFilterStore::in_memory());
        assert_eq!(selection.active(), ActiveSelection::PassThrough);
        assert!(selection.current().is_none());
    }

    #[test]
    fn test_activate_saved_unknown_id() {
        let (store, errors, _) = seeded();
        let mut selection = FilterSelection::new(store);
        selection.activate_saved(errors).unwrap();

        let err = selection.activate_saved(FilterId::new(42)).unwrap_err();
        assert!(matches!(err, FilterError::NotFound(_)));
        assert_eq!(selection.active(), ActiveSelection::Saved(errors));
    }

    #[test]
    fn test_activation_replaces_previous() {
        let (store, errors, retries) = seeded();
        let mut selection = FilterSelection::new(store);

        selection.activate_transient(def("", "offset > 10"));
        assert_eq!(selection.current().unwrap().name, UNSAVED_FILTER_NAME);

        selection.activate_saved(errors).unwrap();
        assert!(selection.transient().is_none());
        assert_eq!(selection.current().unwrap().name, "errors");

        selection.activate_saved(retries).unwrap();
        assert_eq!(selection.current().unwrap().name, "retries");
    }

    #[test]
    fn test_current_reads_through_store() {
        let (store, errors, _) = seeded();
        let mut selection = FilterSelection::new(store.clone());
        selection.activate_saved(errors).unwrap();

        store.edit(errors, def("errors v2", "true")).unwrap();
        assert_eq!(selection.current().unwrap().name, "errors v2");
    }

    #[test]
    fn test_removing_active_filter_falls_back_to_pass_through() {
        let (store, _, retries) = seeded();
        let mut selection = FilterSelection::new(store.clone());
        selection.activate_saved(retries).unwrap();

        store.remove(retries).unwrap();
        assert!(selection.current().is_none());
        assert!(selection.on_removed(retries));
        assert_eq!(selection.active(), ActiveSelection::PassThrough);
        assert!(selection.current().is_none());
    }

    #[test]
    fn test_on_removed_ignores_other_ids() {
        let (store, errors, retries) = seeded();
        let mut selection = FilterSelection::new(store);
        selection.activate_saved(errors).unwrap();
        assert!(!selection.on_removed(retries));
        assert_eq!(selection.active(), ActiveSelection::Saved(errors));
    }

    #[test]
    fn test_save_transient() {
        let (store, _, _) = seeded();
        let mut selection = FilterSelection::new(store.clone());
        selection.activate_transient(def("", "partition == 3"));

        let id = selection.save_transient("partition three").unwrap();
        assert_eq!(selection.active(), ActiveSelection::Saved(id));
        assert!(selection.transient().is_none());
        assert_eq!(store.list().last().unwrap().definition.name, "partition three");
    }

    #[test]
    fn test_save_without_transient() {
        let mut selection = FilterSelection::new(SharedFilterStore::in_memory());
        assert!(matches!(
            selection.save_transient("x"),
            Err(FilterError::Validation { .. })
        ));
    }

    #[test]
    fn test_discard_transient() {
        let mut selection = FilterSelection::new(SharedFilterStore::in_memory());
        selection.activate_transient(def("mine", "true"));
        selection.discard_transient();
        assert_eq!(selection.active(), ActiveSelection::PassThrough);
        assert!(selection.transient().is_none());
    }
}
