//! Ties sessions to the viewed topic and the filter selection.
//!
//! The [`SessionOrchestrator`] owns at most one [`ConsumptionSession`], the
//! one for the topic currently on screen. It reacts to three kinds of input:
//!
//! - navigation: [`enter_topic`](SessionOrchestrator::enter_topic) and
//!   [`leave_topic`](SessionOrchestrator::leave_topic)
//! - filter activation: saved, transient, or none
//! - store mutations that touch the active filter
//!
//! A filter change never recreates the session. The running session is
//! paused, the new filter compiled, and the session resumed with it, so the
//! cursor carries over and no message produced meanwhile is skipped.

use std::sync::Arc;

use tracing::{debug, info, warn};

use ti_core::{
    ConsumptionMode, Cursor, FilterDefinition, FilterId, SavedFilter, SessionConfig,
    SessionStatus, TopicRef,
};
use ti_filter::{ActiveSelection, CompiledFilter, FilterError, FilterSelection, SharedFilterStore};

use crate::error::SessionError;
use crate::event::{PresentationSink, SessionId};
use crate::session::ConsumptionSession;
use crate::source::MessageSource;
use crate::stats::ConsumingSnapshot;

/// Starts, stops, and re-filters consumption sessions.
pub struct SessionOrchestrator<S: MessageSource> {
    source: Arc<S>,
    sink: Arc<dyn PresentationSink>,
    config: SessionConfig,
    selection: FilterSelection,
    session: Option<ConsumptionSession<S>>,
    next_session: u64,
}

impl<S: MessageSource> std::fmt::Debug for SessionOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("selection", &self.selection.active())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl<S: MessageSource> SessionOrchestrator<S> {
    /// Creates an orchestrator with a pass-through selection and no topic.
    pub fn new(
        source: Arc<S>,
        store: SharedFilterStore,
        sink: Arc<dyn PresentationSink>,
        config: SessionConfig,
    ) -> Self {
        Self {
            source,
            sink,
            config,
            selection: FilterSelection::new(store),
            session: None,
            next_session: 1,
        }
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Opens `topic` and starts a session bound to the current selection.
    ///
    /// A session for a previously viewed topic is stopped first. If the
    /// active filter no longer compiles, the session starts as pass-through.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] if the session cannot be started.
    pub fn enter_topic(
        &mut self,
        topic: TopicRef,
        mode: ConsumptionMode,
    ) -> Result<SessionId, SessionError> {
        self.stop_session();

        let filter = self.compile_selection().unwrap_or_else(|err| {
            warn!(error = %err, "active filter does not compile; starting unfiltered");
            CompiledFilter::pass_through()
        });
        self.open_session(topic, mode, filter, None)
    }

    /// Stops the session and discards the transient filter.
    pub fn leave_topic(&mut self) {
        self.stop_session();
        self.selection.discard_transient();
    }

    /// Starts a fresh session where the failed one stopped.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NoTopic`] if no topic is open
    /// - [`SessionError::InvalidTransition`] unless the session failed
    pub fn retry(&mut self) -> Result<SessionId, SessionError> {
        let Some(failed) = self.session.take() else {
            return Err(SessionError::NoTopic);
        };
        let status = failed.status();
        if status != SessionStatus::Failed {
            self.session = Some(failed);
            return Err(SessionError::invalid_transition(status, "retry"));
        }

        let topic = failed.topic().clone();
        let mode = failed.mode();
        let cursor = failed.cursor();
        drop(failed);

        info!(topic = %topic, %cursor, "retrying failed session");
        let filter = self.compile_selection().unwrap_or_else(|err| {
            warn!(error = %err, "active filter does not compile; retrying unfiltered");
            CompiledFilter::pass_through()
        });
        self.open_session(topic, mode, filter, Some(cursor))
    }

    // =========================================================================
    // Filter activation
    // =========================================================================

    /// Makes saved filter `id` active and swaps it into the running session.
    ///
    /// # Errors
    ///
    /// - [`FilterError::NotFound`] if no filter has this id
    /// - [`FilterError::Compile`] if it does not compile; the previous filter
    ///   stays in effect
    pub fn activate_saved(&mut self, id: FilterId) -> Result<(), SessionError> {
        let saved = self
            .selection
            .store()
            .get(id)
            .ok_or(FilterError::NotFound(id))?;
        let filter = CompiledFilter::compile(&saved.definition)?;
        self.selection.activate_saved(id)?;
        self.swap_filter(filter)
    }

    /// Makes `definition` the active transient filter.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Compile`] if it does not compile; the previous
    /// filter stays in effect.
    pub fn activate_transient(&mut self, definition: FilterDefinition) -> Result<(), SessionError> {
        let filter = CompiledFilter::compile(&definition)?;
        self.selection.activate_transient(definition);
        self.swap_filter(filter)
    }

    /// Switches to pass-through.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] if the session rejects the swap.
    pub fn clear_filter(&mut self) -> Result<(), SessionError> {
        self.selection.clear();
        self.swap_filter(CompiledFilter::pass_through())
    }

    /// Pauses the running session while the user edits filter criteria.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] if the session rejects the pause.
    pub fn begin_filter_edit(&mut self) -> Result<(), SessionError> {
        match self.session.as_ref() {
            Some(session) if session.status() == SessionStatus::Fetching => session.pause(),
            _ => Ok(()),
        }
    }

    /// Resumes a session paused by [`begin_filter_edit`](Self::begin_filter_edit)
    /// with the unchanged active filter.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Compile`] if the active filter no longer compiles.
    pub fn cancel_filter_edit(&mut self) -> Result<(), SessionError> {
        match self.session.as_ref() {
            Some(session) if session.status() == SessionStatus::Paused => {
                session.resume(self.compile_selection()?)
            }
            _ => Ok(()),
        }
    }

    /// Saves the transient filter under `name`; it stays active as a saved filter.
    ///
    /// # Errors
    ///
    /// See [`FilterSelection::save_transient`].
    pub fn save_transient(&mut self, name: impl Into<String>) -> Result<FilterId, SessionError> {
        Ok(self.selection.save_transient(name)?)
    }

    // =========================================================================
    // Store mutations
    // =========================================================================

    /// Adds a saved filter. Does not activate it.
    ///
    /// # Errors
    ///
    /// See [`SharedFilterStore::add`].
    pub fn add_filter(&mut self, definition: FilterDefinition) -> Result<FilterId, SessionError> {
        Ok(self.selection.store().add(definition)?)
    }

    /// Replaces saved filter `id`.
    ///
    /// If it is the active filter, the new definition is compiled first and
    /// swapped into the running session; a definition that does not compile
    /// is rejected and the store is left untouched.
    ///
    /// # Errors
    ///
    /// - [`FilterError::Compile`] if the active filter's new definition does not compile
    /// - any error of [`SharedFilterStore::edit`]
    pub fn edit_filter(
        &mut self,
        id: FilterId,
        definition: FilterDefinition,
    ) -> Result<(), SessionError> {
        if self.selection.active() != ActiveSelection::Saved(id) {
            return Ok(self.selection.store().edit(id, definition)?);
        }

        let filter = CompiledFilter::compile(&definition)?;
        self.selection.store().edit(id, definition)?;
        self.swap_filter(filter)
    }

    /// Deletes saved filter `id`; if it was active the session continues
    /// as pass-through.
    ///
    /// # Errors
    ///
    /// See [`SharedFilterStore::remove`].
    pub fn remove_filter(&mut self, id: FilterId) -> Result<SavedFilter, SessionError> {
        let removed = self.selection.store().remove(id)?;
        if self.selection.on_removed(id) {
            debug!(filter = %id, "active filter removed; falling back to pass-through");
            self.swap_filter(CompiledFilter::pass_through())?;
        }
        Ok(removed)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The filter selection.
    #[must_use]
    pub const fn selection(&self) -> &FilterSelection {
        &self.selection
    }

    /// The saved-filter store.
    #[must_use]
    pub const fn store(&self) -> &SharedFilterStore {
        self.selection.store()
    }

    /// The current session, if a topic is open.
    #[must_use]
    pub const fn session(&self) -> Option<&ConsumptionSession<S>> {
        self.session.as_ref()
    }

    /// Id of the current session.
    #[must_use]
    pub fn current_session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(ConsumptionSession::id)
    }

    /// Status of the current session.
    #[must_use]
    pub fn status(&self) -> Option<SessionStatus> {
        self.session.as_ref().map(ConsumptionSession::status)
    }

    /// Counters of the current session.
    #[must_use]
    pub fn stats(&self) -> Option<ConsumingSnapshot> {
        self.session.as_ref().map(ConsumptionSession::stats)
    }

    /// Stops the current session and waits for its task.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TaskFailed`] if the task panicked.
    pub async fn shutdown(mut self) -> Result<(), SessionError> {
        match self.session.take() {
            Some(session) => session.shutdown().await,
            None => Ok(()),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn compile_selection(&self) -> Result<CompiledFilter, FilterError> {
        CompiledFilter::compile_optional(self.selection.current().as_ref())
    }

    fn open_session(
        &mut self,
        topic: TopicRef,
        mode: ConsumptionMode,
        filter: CompiledFilter,
        start: Option<Cursor>,
    ) -> Result<SessionId, SessionError> {
        let id = SessionId::new(self.next_session);
        self.next_session += 1;

        let mut session = ConsumptionSession::new(
            id,
            topic,
            mode,
            self.config,
            Arc::clone(&self.source),
            Arc::clone(&self.sink),
        );
        if let Some(cursor) = start {
            session = session.with_start_cursor(cursor);
        }
        session.start(filter)?;
        self.session = Some(session);
        Ok(id)
    }

    fn stop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop();
        }
    }

    /// Pauses the session (unless already paused) and resumes it with `filter`.
    fn swap_filter(&self, filter: CompiledFilter) -> Result<(), SessionError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        match session.pause() {
            Ok(()) | Err(SessionError::InvalidTransition { from: SessionStatus::Paused, .. }) => {}
            Err(SessionError::InvalidTransition { from, .. }) => {
                debug!(status = %from, "session not running; filter applies to the next session");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        session.resume(filter)
    }
}
