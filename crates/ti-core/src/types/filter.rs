//! Filter definitions.
//!
//! A [`FilterDefinition`] is the user-facing description of a filter: a
//! display name and a [`PredicateSource`]. Saved filters are stored as
//! [`SavedFilter`]s, which pair a definition with the [`FilterId`] assigned
//! when it was added to the store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Display name given to a transient filter created without a name.
pub const UNSAVED_FILTER_NAME: &str = "Unsaved filter";

/// Identifier of a saved filter; assigned once, never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FilterId(u64);

impl FilterId {
    /// Creates a filter id from its raw value.
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

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message field a structural constraint inspects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageField {
    /// The message key, as text.
    Key,
    /// The message value, as text.
    Value,
    /// The header with the given name.
    Header(String),
}

impl fmt::Display for MessageField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key => f.write_str("key"),
            Self::Value => f.write_str("value"),
            Self::Header(name) => write!(f, "headers[{name:?}]"),
        }
    }
}

/// How a structural constraint compares a field with its operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    /// The field text equals the operand.
    Equals,
    /// The field text contains the operand.
    Contains,
}

/// One structural constraint: `field op value`.
///
/// # Examples
///
/// ```
/// use ti_core::{FieldConstraint, MessageField};
///
/// let c = FieldConstraint::contains(MessageField::Value, "timeout");
/// assert_eq!(c.to_string(), r#"value contains "timeout""#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldConstraint {
    /// Field to inspect.
    pub field: MessageField,
    /// Comparison applied to the field.
    pub op: MatchOp,
    /// Operand compared with the field text.
    pub value: String,
}

impl FieldConstraint {
    /// Creates an equality constraint.
    pub fn equals(field: MessageField, value: impl Into<String>) -> Self {
        Self {
            field,
            op: MatchOp::Equals,
            value: value.into(),
        }
    }

    /// Creates a containment constraint.
    pub fn contains(field: MessageField, value: impl Into<String>) -> Self {
        Self {
            field,
            op: MatchOp::Contains,
            value: value.into(),
        }
    }
}

impl fmt::Display for FieldConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            MatchOp::Equals => "==",
            MatchOp::Contains => "contains",
        };
        write!(f, "{} {op} {:?}", self.field, self.value)
    }
}

/// The source a predicate is compiled from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredicateSource {
    /// All constraints must hold.
    Structural {
        /// Constraints combined with AND.
        constraints: Vec<FieldConstraint>,
    },
    /// An expression in the filter language.
    Expression {
        /// Expression source text.
        code: String,
    },
}

impl PredicateSource {
    /// Creates an expression source.
    pub fn expression(code: impl Into<String>) -> Self {
        Self::Expression { code: code.into() }
    }

    /// Creates a structural source.
    #[must_use]
    pub fn structural(constraints: Vec<FieldConstraint>) -> Self {
        Self::Structural { constraints }
    }

    /// Returns `true` if the source carries nothing to evaluate.
    ///
    /// # Examples
    ///
    /// ```
    /// use ti_core::PredicateSource;
    ///
    /// assert!(PredicateSource::expression("   ").is_empty());
    /// assert!(PredicateSource::structural(Vec::new()).is_empty());
    /// assert!(!PredicateSource::expression("offset > 3").is_empty());
    /// ```
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Structural { constraints } => constraints.is_empty(),
            Self::Expression { code } => code.trim().is_empty(),
        }
    }
}

impl fmt::Display for PredicateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expression { code } => f.write_str(code.trim()),
            Self::Structural { constraints } => {
                for (i, constraint) in constraints.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" && ")?;
                    }
                    write!(f, "{constraint}")?;
                }
                Ok(())
            }
        }
    }
}

/// A named filter, saved or transient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterDefinition {
    /// Display label; may be empty for a transient filter.
    #[serde(default)]
    pub name: String,

    /// What the filter matches.
    pub source: PredicateSource,
}

impl FilterDefinition {
    /// Creates a definition.
    pub fn new(name: impl Into<String>, source: PredicateSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }

    /// Returns the name to display, substituting [`UNSAVED_FILTER_NAME`] for
    /// an empty one.
    ///
    /// # Examples
    ///
    /// ```
    /// use ti_core::{FilterDefinition, PredicateSource};
    ///
    /// let def = FilterDefinition::new("", PredicateSource::expression("true"));
    /// assert_eq!(def.display_name(), "Unsaved filter");
    /// ```
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            UNSAVED_FILTER_NAME
        } else {
            &self.name
        }
    }
}

/// A definition stored in the filter store under its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SavedFilter {
    /// Identifier assigned at creation.
    pub id: FilterId,

    /// The stored definition.
    #[serde(flatten)]
    pub definition: FilterDefinition,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_display() {
        let source = PredicateSource::structural(vec![
            FieldConstraint::equals(MessageField::Key, "order-1"),
            FieldConstraint::contains(MessageField::Header("trace".to_owned()), "abc"),
        ]);
        assert_eq!(
            source.to_string(),
            r#"key == "order-1" && headers["trace"] contains "abc""#
        );
    }

    #[test]
    fn test_display_name_keeps_given_name() {
        let def = FilterDefinition::new("errors", PredicateSource::expression("true"));
        assert_eq!(def.display_name(), "errors");
    }

    #[test]
    fn test_saved_filter_json_shape() {
        let saved = SavedFilter {
            id: FilterId::new(3),
            definition: FilterDefinition::new(
                "errors",
                PredicateSource::expression(r#"value.level == "error""#),
            ),
        };
        let json = serde_json::to_value(&saved).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["name"], "errors");
        assert_eq!(json["source"]["kind"], "expression");

        let back: SavedFilter = serde_json::from_value(json).unwrap();
        assert_eq!(back, saved);
    }

    #[test]
    fn test_structural_constraint_json_shape() {
        let constraint = FieldConstraint::equals(MessageField::Header("h".to_owned()), "v");
        let json = serde_json::to_string(&constraint).unwrap();
        insta::assert_snapshot!(json, @r#"{"field":{"header":"h"},"op":"equals","value":"v"}"#);
    }
}
