//! Session status and consumption modes.

use serde::{Deserialize, Serialize};

use super::message::Message;

/// The lifecycle state of a consumption session.
///
/// ```text
/// Idle ──► Fetching ⇄ Paused
///            │  │        │
///            │  └──► Stopped ◄──┘
///            └──► Failed
/// ```
///
/// # Examples
///
/// ```
/// use ti_core::SessionStatus;
///
/// assert!(SessionStatus::Stopped.is_terminal());
/// assert!(!SessionStatus::Paused.is_terminal());
/// assert_eq!(SessionStatus::Fetching.label(), "Fetching");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, not yet started.
    #[default]
    Idle,
    /// Fetching batches or waiting for the next poll.
    Fetching,
    /// Suspended; no fetch is issued until resumed.
    Paused,
    /// Finished, either on request or at the end of a historical read.
    Stopped,
    /// The message source failed.
    Failed,
}

impl SessionStatus {
    /// Returns `true` for [`Stopped`](Self::Stopped) and [`Failed`](Self::Failed).
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Returns `true` while the session may still emit batches.
    #[inline]
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Fetching | Self::Paused)
    }

    /// Returns a human-readable label for this status.
    #[inline]
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Fetching => "Fetching",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a historical read ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoricalBound {
    /// Read until the source reports the end of the topic.
    #[default]
    SourceEnd,
    /// Read messages with an offset up to and including this one.
    Offset(i64),
    /// Read messages with a timestamp up to and including this one (ms).
    Timestamp(i64),
}

impl HistoricalBound {
    /// Returns `true` if `message` lies past the bound.
    ///
    /// # Examples
    ///
    /// ```
    /// use ti_core::{HistoricalBound, Message};
    ///
    /// let bound = HistoricalBound::Offset(10);
    /// assert!(!bound.is_exceeded_by(&Message::new(0, 10)));
    /// assert!(bound.is_exceeded_by(&Message::new(0, 11)));
    /// ```
    #[inline]
    #[must_use]
    pub const fn is_exceeded_by(self, message: &Message) -> bool {
        match self {
            Self::SourceEnd => false,
            Self::Offset(offset) => message.offset > offset,
            Self::Timestamp(timestamp) => message.timestamp > timestamp,
        }
    }
}

/// How a session reads its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionMode {
    /// Bounded oldest-first read that stops on its own.
    Historical(HistoricalBound),
    /// Bounded newest-first read. Messages past the bound are skipped and the
    /// read ends at the beginning of every partition.
    Backward(HistoricalBound),
    /// Unbounded read polled until stopped.
    Live,
}

impl ConsumptionMode {
    /// Returns `true` for [`Live`](Self::Live).
    #[inline]
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }

    /// Returns `true` for [`Backward`](Self::Backward).
    #[inline]
    #[must_use]
    pub const fn is_backward(self) -> bool {
        matches!(self, Self::Backward(_))
    }

    /// Returns the historical bound, if any.
    #[inline]
    #[must_use]
    pub const fn bound(self) -> Option<HistoricalBound> {
        match self {
            Self::Historical(bound) | Self::Backward(bound) => Some(bound),
            Self::Live => None,
        }
    }
}

impl Default for ConsumptionMode {
    fn default() -> Self {
        Self::Historical(HistoricalBound::SourceEnd)
    }
}
