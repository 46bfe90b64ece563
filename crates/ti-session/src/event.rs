//! Events delivered to the presentation layer.
//!
//! A session reports everything it does through a [`PresentationSink`]:
//! phase changes, filtered batches, completion, and failure. Events are
//! delivered in cursor order. A sink may still see the same cursor twice
//! (for example an empty live poll), and [`CursorGuard`] drops those repeats.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use ti_core::{Cursor, FxHashMap, Message, SessionStatus, fx_hash_map};

use crate::stats::ConsumingSnapshot;

/// Identifies one consumption session; never reused within a process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a session id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A lifecycle step reported to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// The session started fetching.
    Started,
    /// The session was paused.
    Paused,
    /// The session resumed with a (possibly new) filter.
    Resumed,
    /// A backward read is reading this partition.
    ReadingPartition(i32),
}

/// Something the presentation layer should show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A lifecycle step.
    Phase {
        /// Reporting session.
        session: SessionId,
        /// The step taken.
        phase: SessionPhase,
    },
    /// One filtered batch, possibly empty.
    Batch {
        /// Reporting session.
        session: SessionId,
        /// Cursor after this batch.
        cursor: Cursor,
        /// Session status when the batch was emitted.
        status: SessionStatus,
        /// Messages that passed the filter.
        messages: Vec<Message>,
        /// Counters after this batch.
        stats: ConsumingSnapshot,
    },
    /// A historical read completed.
    Done {
        /// Reporting session.
        session: SessionId,
        /// Final cursor.
        cursor: Cursor,
        /// Final counters.
        stats: ConsumingSnapshot,
    },
    /// The message source failed; the session is `Failed`.
    Failed {
        /// Reporting session.
        session: SessionId,
        /// Cursor of the last committed batch.
        cursor: Cursor,
        /// The source error, rendered.
        error: String,
    },
}

impl SessionEvent {
    /// The session that produced this event.
    #[must_use]
    pub const fn session(&self) -> SessionId {
        match self {
            Self::Phase { session, .. }
            | Self::Batch { session, .. }
            | Self::Done { session, .. }
            | Self::Failed { session, .. } => *session,
        }
    }
}

/// Receives session events.
///
/// Deliveries for one session are serialized and happen after its state lock
/// is released, so an implementation may query or control the session from
/// inside `deliver`. It must not block: `stop` waits for a delivery in
/// progress.
pub trait PresentationSink: Send + Sync + 'static {
    /// Delivers one event.
    fn deliver(&self, event: SessionEvent);
}

impl PresentationSink for mpsc::UnboundedSender<SessionEvent> {
    fn deliver(&self, event: SessionEvent) {
        if self.send(event).is_err() {
            tracing::trace!("presentation receiver dropped; event discarded");
        }
    }
}

/// Drops repeated deliveries of a cursor for the same session.
///
/// # Examples
///
/// ```
/// use ti_core::{Cursor, SessionStatus};
/// use ti_session::{ConsumingSnapshot, CursorGuard, SessionEvent, SessionId};
///
/// let batch = SessionEvent::Batch {
///     session: SessionId::new(1),
///     cursor: Cursor::new(10),
///     status: SessionStatus::Fetching,
///     messages: Vec::new(),
///     stats: ConsumingSnapshot::default(),
/// };
///
/// let mut guard = CursorGuard::new();
/// assert!(guard.admit(&batch));
/// assert!(!guard.admit(&batch));
/// ```
#[derive(Debug, Default)]
pub struct CursorGuard {
    seen: FxHashMap<SessionId, Cursor>,
}

impl CursorGuard {
    /// Creates an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self { seen: fx_hash_map() }
    }

    /// Returns `true` if the event should be shown.
    ///
    /// Batches whose cursor is not past the last admitted one for their
    /// session are rejected; every other event is admitted.
    pub fn admit(&mut self, event: &SessionEvent) -> bool {
        let SessionEvent::Batch { session, cursor, .. } = event else {
            return true;
        };
        match self.seen.get(session) {
            Some(last) if cursor <= last => false,
            _ => {
                self.seen.insert(*session, *cursor);
                true
            }
        }
    }

    /// Forgets a session.
    pub fn forget(&mut self, session: SessionId) {
        self.seen.remove(&session);
    }
}
