//! Core types, configuration, and errors for topic-inspector.
//!
//! This crate provides the foundational types used across the workspace:
//!
//! - Domain types ([`Message`], [`TopicRef`], [`Cursor`], [`FilterDefinition`])
//! - Session vocabulary ([`SessionStatus`], [`ConsumptionMode`])
//! - Configuration structures ([`Config`] and its sections)
//! - [`ConfigError`] for configuration loading and validation
//! - An `FxHashMap` alias (faster than std for internal keys)
//!
//! # Crate Dependencies
//!
//! ```text
//! ti-cli ──► ti-session ──► ti-filter ──► ti-core
//!        └─────────────────────────────────►
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use config::{Config, SessionConfig, StoreConfig};
pub use error::ConfigError;
pub use hash::{FxHashMap, fx_hash_map};
pub use types::{
    ConsumptionMode, Cursor, FieldConstraint, FilterDefinition, FilterId, Header,
    HistoricalBound, MatchOp, Message, MessageField, Payload, PredicateSource, SavedFilter,
    SessionStatus, TopicRef, UNSAVED_FILTER_NAME,
};
