//! Compiled predicates and batch filtering.
//!
//! A [`FilterDefinition`] is compiled into a [`CompiledFilter`] whenever a
//! session (re)applies it. Compiled filters are immutable and cheap to clone,
//! and are never shared between sessions by the session layer: each
//! activation compiles afresh so later edits cannot leak into earlier batches.
//!
//! # Examples
//!
//! ```
//! use ti_core::{FilterDefinition, Message, PredicateSource};
//! use ti_filter::CompiledFilter;
//!
//! let def = FilterDefinition::new("errors", PredicateSource::expression(r#"value.level == "error""#));
//! let filter = CompiledFilter::compile(&def).unwrap();
//!
//! let hit = Message::new(0, 1).with_value(r#"{"level":"error"}"#);
//! let miss = Message::new(0, 2).with_value(r#"{"level":"info"}"#);
//! assert!(filter.includes(&hit));
//! assert!(!filter.includes(&miss));
//! ```

use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use ti_core::{
    FieldConstraint, FilterDefinition, MatchOp, Message, MessageField, PredicateSource,
};

use crate::error::{CompileError, EvalError, FilterError};
use crate::expr::eval::{Scope, evaluate};
use crate::expr::{self, Expr};

/// A boolean function over one message.
///
/// # Thread Safety
///
/// Predicates must be [`Send`] and [`Sync`] because large batches are
/// evaluated on the rayon pool, and `'static` so they can move into the
/// session task.
pub trait MessagePredicate: Send + Sync + 'static {
    /// Returns whether `message` is included.
    ///
    /// An error excludes the message; it never aborts the caller.
    fn evaluate(&self, message: &Message) -> Result<bool, EvalError>;
}

/// Includes every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl MessagePredicate for PassThrough {
    #[inline]
    fn evaluate(&self, _message: &Message) -> Result<bool, EvalError> {
        Ok(true)
    }
}

/// All constraints must hold. A missing field fails its constraint.
#[derive(Debug, Clone)]
pub struct StructuralPredicate {
    constraints: Vec<FieldConstraint>,
}

impl StructuralPredicate {
    /// Creates a predicate from its constraints.
    #[must_use]
    pub fn new(constraints: Vec<FieldConstraint>) -> Self {
        Self { constraints }
    }

    fn holds(constraint: &FieldConstraint, message: &Message) -> bool {
        let text = match &constraint.field {
            MessageField::Key => message.key.as_ref().map(ti_core::Payload::as_text),
            MessageField::Value => message.value.as_ref().map(ti_core::Payload::as_text),
            MessageField::Header(name) => message.header(name).map(std::borrow::Cow::Borrowed),
        };
        let Some(text) = text else {
            return false;
        };
        match constraint.op {
            MatchOp::Equals => *text == *constraint.value,
            MatchOp::Contains => text.contains(constraint.value.as_str()),
        }
    }
}

impl MessagePredicate for StructuralPredicate {
    fn evaluate(&self, message: &Message) -> Result<bool, EvalError> {
        Ok(self
            .constraints
            .iter()
            .all(|constraint| Self::holds(constraint, message)))
    }
}

/// An expression in the filter language.
#[derive(Debug, Clone)]
pub struct ExpressionPredicate {
    expr: Expr,
}

impl ExpressionPredicate {
    /// Parses `source` into a predicate.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] if the source does not parse.
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        Ok(Self {
            expr: expr::parse(source)?,
        })
    }

    /// Returns the parsed tree.
    #[must_use]
    pub const fn expr(&self) -> &Expr {
        &self.expr
    }
}

impl MessagePredicate for ExpressionPredicate {
    fn evaluate(&self, message: &Message) -> Result<bool, EvalError> {
        evaluate(&self.expr, &Scope::new(message))
    }
}

impl<P: MessagePredicate + ?Sized> MessagePredicate for Box<P> {
    #[inline]
    fn evaluate(&self, message: &Message) -> Result<bool, EvalError> {
        (**self).evaluate(message)
    }
}

impl<P: MessagePredicate + ?Sized> MessagePredicate for Arc<P> {
    #[inline]
    fn evaluate(&self, message: &Message) -> Result<bool, EvalError> {
        (**self).evaluate(message)
    }
}

/// The result of filtering one batch.
#[derive(Debug, Default)]
pub struct FilteredBatch {
    /// Included messages, in input order.
    pub messages: Vec<Message>,
    /// Messages excluded because evaluation failed.
    pub evaluation_errors: u64,
}

/// A filter ready to apply to messages.
#[derive(Clone)]
pub struct CompiledFilter {
    label: String,
    predicate: Arc<dyn MessagePredicate>,
    pass_through: bool,
}

impl CompiledFilter {
    /// Compiles a definition.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Compile`] if an expression does not parse or a
    /// structural source carries no constraints.
    pub fn compile(definition: &FilterDefinition) -> Result<Self, FilterError> {
        let predicate: Arc<dyn MessagePredicate> = match &definition.source {
            PredicateSource::Structural { constraints } => {
                if constraints.is_empty() {
                    return Err(CompileError::new("filter has no constraints", 0).into());
                }
                Arc::new(StructuralPredicate::new(constraints.clone()))
            }
            PredicateSource::Expression { code } => Arc::new(ExpressionPredicate::compile(code)?),
        };
        tracing::debug!(filter = definition.display_name(), "compiled filter");
        Ok(Self {
            label: definition.display_name().to_owned(),
            predicate,
            pass_through: false,
        })
    }

    /// Compiles an optional definition; `None` is pass-through.
    ///
    /// # Errors
    ///
    /// See [`compile`](Self::compile).
    pub fn compile_optional(definition: Option<&FilterDefinition>) -> Result<Self, FilterError> {
        definition.map_or_else(|| Ok(Self::pass_through()), Self::compile)
    }

    /// A filter that includes everything.
    #[must_use]
    pub fn pass_through() -> Self {
        Self {
            label: "pass-through".to_owned(),
            predicate: Arc::new(PassThrough),
            pass_through: true,
        }
    }

    /// Wraps a custom predicate.
    pub fn from_predicate(label: impl Into<String>, predicate: impl MessagePredicate) -> Self {
        Self {
            label: label.into(),
            predicate: Arc::new(predicate),
            pass_through: false,
        }
    }

    /// Name of the definition this was compiled from.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns `true` if this filter includes every message.
    #[must_use]
    pub const fn is_pass_through(&self) -> bool {
        self.pass_through
    }

    /// Evaluates one message.
    ///
    /// # Errors
    ///
    /// Returns the [`EvalError`] the predicate raised.
    pub fn evaluate(&self, message: &Message) -> Result<bool, EvalError> {
        self.predicate.evaluate(message)
    }

    /// Evaluates one message, treating an error as exclusion.
    #[must_use]
    pub fn includes(&self, message: &Message) -> bool {
        self.evaluate(message).unwrap_or(false)
    }

    /// Filters a batch, preserving order.
    ///
    /// Batches of at least `parallel_threshold` messages are evaluated on the
    /// rayon pool; a threshold of zero keeps evaluation on the calling thread.
    pub fn apply(&self, messages: Vec<Message>, parallel_threshold: usize) -> FilteredBatch {
        if self.pass_through {
            return FilteredBatch {
                messages,
                evaluation_errors: 0,
            };
        }

        let verdicts: Vec<Result<bool, EvalError>> =
            if parallel_threshold > 0 && messages.len() >= parallel_threshold {
                messages
                    .par_iter()
                    .map(|message| self.predicate.evaluate(message))
                    .collect()
            } else {
                messages
                    .iter()
                    .map(|message| self.predicate.evaluate(message))
                    .collect()
            };

        let mut evaluation_errors = 0;
        let messages = messages
            .into_iter()
            .zip(verdicts)
            .filter_map(|(message, verdict)| match verdict {
                Ok(true) => Some(message),
                Ok(false) => None,
                Err(err) => {
                    evaluation_errors += 1;
                    tracing::debug!(
                        filter = %self.label,
                        partition = message.partition,
                        offset = message.offset,
                        error = %err,
                        "filter evaluation failed"
                    );
                    None
                }
            })
            .collect();

        if evaluation_errors > 0 {
            tracing::warn!(
                filter = %self.label,
                failures = evaluation_errors,
                "messages excluded after evaluation errors"
            );
        }

        FilteredBatch {
            messages,
            evaluation_errors,
        }
    }
}

impl fmt::Debug for CompiledFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFilter")
            .field("label", &self.label)
            .field("pass_through", &self.pass_through)
            .finish_non_exhaustive()
    }
}
