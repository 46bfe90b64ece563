//! Domain types for topic-inspector.
//!
//! # Module Organization
//!
//! - [`message`] - Records read from a topic and their payloads
//! - [`topic`] - Topic references and cursors
//! - [`filter`] - Filter definitions and predicate sources
//! - [`status`] - Session status and consumption modes
//!
//! All public types are re-exported here and at the crate root:
//!
//! ```
//! use ti_core::{Cursor, FilterDefinition, Message, SessionStatus, TopicRef};
//! ```

mod filter;
mod message;
mod status;
mod topic;

pub use filter::{
    FieldConstraint, FilterDefinition, FilterId, MatchOp, MessageField, PredicateSource,
    SavedFilter, UNSAVED_FILTER_NAME,
};
pub use message::{Header, Message, Payload};
pub use status::{ConsumptionMode, HistoricalBound, SessionStatus};
pub use topic::{Cursor, TopicRef};
