//! Consumption sessions for topic-inspector.
//!
//! # Overview
//!
//! - [`MessageSource`] - the collaborator that fetches batches from a topic;
//!   [`MemorySource`] is an in-process implementation
//! - [`ConsumptionSession`] - one cancellable, pausable read of a topic,
//!   running its fetch loop on a tokio task
//! - [`SessionOrchestrator`] - starts and stops sessions as topics are
//!   entered and left, and swaps filters into the running session
//! - [`SessionEvent`] / [`PresentationSink`] - what sessions report and
//!   where it goes
//!
//! # Data Flow
//!
//! ```text
//! MessageSource ──► FetchTask ──► CompiledFilter::apply ──► PresentationSink
//!                      ▲
//!   SessionOrchestrator ── pause / resume(filter) / stop
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod error;
pub mod event;
pub mod orchestrator;
pub mod session;
pub mod source;
pub mod stats;

#[cfg(test)]
mod testing;

pub use error::{SessionError, SourceError};
pub use event::{CursorGuard, PresentationSink, SessionEvent, SessionId, SessionPhase};
pub use orchestrator::SessionOrchestrator;
pub use session::ConsumptionSession;
pub use source::{FetchedBatch, MemorySource, MessageSource};
pub use stats::{ConsumingSnapshot, ConsumingStats};
