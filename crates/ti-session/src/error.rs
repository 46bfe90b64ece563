//! Error types for the ti-session crate.
//!
//! # Error Recovery Strategy
//!
//! - **Source errors** ([`SourceError`]): the session moves to `Failed`; a
//!   retry is an explicit new session
//! - **Invalid transitions** ([`SessionError::InvalidTransition`]):
//!   Recoverable - the call is rejected and the session is unchanged
//! - **Filter errors** ([`SessionError::Filter`]): Recoverable unless the
//!   underlying [`FilterError`] is fatal
//! - **Task failures** ([`SessionError::TaskFailed`]): Fatal - the fetch task
//!   panicked or was aborted

use ti_core::SessionStatus;
use ti_filter::FilterError;

/// Typed failures reported by a message source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The topic does not exist.
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    /// The connection to the cluster was lost.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The source returned something it should not have.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SourceError {
    /// Creates a new [`SourceError::TopicNotFound`] error.
    #[inline]
    pub fn topic_not_found(topic: impl Into<String>) -> Self {
        Self::TopicNotFound(topic.into())
    }

    /// Creates a new [`SourceError::ConnectionLost`] error.
    #[inline]
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost(reason.into())
    }
}

/// Errors returned by sessions and the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The requested transition is not allowed from the current state.
    #[error("cannot {action} session in state {from}")]
    InvalidTransition {
        /// State the session was in.
        from: SessionStatus,
        /// The rejected action.
        action: &'static str,
    },

    /// The message source failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// A filter operation failed.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// No topic is being viewed.
    #[error("no topic is being viewed")]
    NoTopic,

    /// The session task panicked or was aborted.
    #[error("session task failed")]
    TaskFailed,
}

impl SessionError {
    /// Creates a new [`SessionError::InvalidTransition`] error.
    #[inline]
    pub const fn invalid_transition(from: SessionStatus, action: &'static str) -> Self {
        Self::InvalidTransition { from, action }
    }

    /// Returns `true` if only the triggering call failed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidTransition { .. } | Self::NoTopic => true,
            Self::Filter(err) => err.is_recoverable(),
            Self::Source(_) | Self::TaskFailed => false,
        }
    }

    /// Returns `true` if the error cannot be handled locally.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }
}
