//! Filter language, predicate compilation, and filter storage.
//!
//! # Overview
//!
//! - [`expr`] - the expression language: a nom parser and a sandboxed
//!   interpreter with no access to anything but the message
//! - [`CompiledFilter`] - a [`FilterDefinition`](ti_core::FilterDefinition)
//!   compiled for evaluation, with order-preserving (optionally parallel)
//!   batch filtering
//! - [`FilterStore`] / [`SharedFilterStore`] - the saved-filter collection,
//!   persisted through a [`FilterPersistence`] collaborator
//! - [`FilterSelection`] - which filter (saved, transient, or none) is active
//!
//! # Data Flow
//!
//! ```text
//! FilterStore ──► FilterSelection::current() ──► CompiledFilter::compile()
//!                                                        │
//!                                      batch ──► apply() ─┴─► FilteredBatch
//! ```
//!
//! # Crate Dependencies
//!
//! ```text
//! ti-cli ──► ti-session ──► ti-filter ──► ti-core
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod error;
pub mod expr;
pub mod persist;
pub mod predicate;
pub mod selection;
pub mod store;

pub use error::{CompileError, EvalError, FilterError, StorageError};
pub use persist::{FilterPersistence, FilterSnapshot, JsonFilePersistence, MemoryPersistence};
pub use predicate::{
    CompiledFilter, ExpressionPredicate, FilteredBatch, MessagePredicate, PassThrough,
    StructuralPredicate,
};
pub use selection::{ActiveSelection, FilterSelection};
pub use store::{FilterStore, SharedFilterStore};
