//! Syntax tree of the filter language.

use std::fmt;

use regex::Regex;

/// A message attribute an expression starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Root {
    /// `key`
    Key,
    /// `value`
    Value,
    /// `headers`
    Headers,
    /// `offset`
    Offset,
    /// `partition`
    Partition,
    /// `timestamp`
    Timestamp,
}

impl Root {
    /// Resolves an identifier to a root, if it names one.
    #[must_use]
    pub fn from_ident(ident: &str) -> Option<Self> {
        Some(match ident {
            "key" => Self::Key,
            "value" => Self::Value,
            "headers" => Self::Headers,
            "offset" => Self::Offset,
            "partition" => Self::Partition,
            "timestamp" => Self::Timestamp,
            _ => return None,
        })
    }

    /// Returns the identifier for this root.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Value => "value",
            Self::Headers => "headers",
            Self::Offset => "offset",
            Self::Partition => "partition",
            Self::Timestamp => "timestamp",
        }
    }
}

/// A built-in function. Every built-in takes exactly one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    /// `len(x)`: characters of a string, elements of a list or object, or headers.
    Len,
    /// `lower(s)`
    Lower,
    /// `upper(s)`
    Upper,
    /// `trim(s)`
    Trim,
    /// `str(x)`: renders any value as text.
    Str,
    /// `num(x)`: parses text as a number.
    Num,
}

impl Function {
    /// Resolves an identifier to a built-in, if it names one.
    #[must_use]
    pub fn from_ident(ident: &str) -> Option<Self> {
        Some(match ident {
            "len" => Self::Len,
            "lower" => Self::Lower,
            "upper" => Self::Upper,
            "trim" => Self::Trim,
            "str" => Self::Str,
            "num" => Self::Num,
            _ => return None,
        })
    }

    /// Returns the identifier for this function.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Len => "len",
            Self::Lower => "lower",
            Self::Upper => "upper",
            Self::Trim => "trim",
            Self::Str => "str",
            Self::Num => "num",
        }
    }

    /// Number of arguments the function takes.
    #[must_use]
    pub const fn arity(self) -> usize {
        1
    }
}

/// A prefix operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `-`
    Neg,
}

/// An infix operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `||`
    Or,
    /// `&&`
    And,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `contains`
    Contains,
    /// `startsWith`
    StartsWith,
    /// `endsWith`
    EndsWith,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
}

impl BinaryOp {
    /// Returns the operator as written in source.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Or => "||",
            Self::And => "&&",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "contains",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
        }
    }
}

/// A literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// `null`
    Null,
    /// `true` / `false`
    Bool(bool),
    /// A decimal number.
    Number(f64),
    /// A quoted string.
    Str(String),
}

/// An expression node.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A literal.
    Literal(Literal),
    /// A message attribute.
    Root(Root),
    /// `target.name`
    Member(Box<Expr>, String),
    /// `target[index]`
    Index(Box<Expr>, Box<Expr>),
    /// Prefix operation.
    Unary(UnaryOp, Box<Expr>),
    /// Infix operation.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `subject matches "pattern"`, with the pattern compiled at parse time.
    Matches(Box<Expr>, Regex),
    /// Built-in function call.
    Call(Function, Vec<Expr>),
}

impl Expr {
    pub(crate) fn binary(op: BinaryOp, lhs: Self, rhs: Self) -> Self {
        Self::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub(crate) fn unary(op: UnaryOp, operand: Self) -> Self {
        Self::Unary(op, Box::new(operand))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Renders the tree fully parenthesised, which makes precedence visible.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(literal) => write!(f, "{literal}"),
            Self::Root(root) => f.write_str(root.name()),
            Self::Member(target, name) => write!(f, "{target}.{name}"),
            Self::Index(target, index) => write!(f, "{target}[{index}]"),
            Self::Unary(UnaryOp::Not, operand) => write!(f, "!{operand}"),
            Self::Unary(UnaryOp::Neg, operand) => write!(f, "-{operand}"),
            Self::Binary(op, lhs, rhs) => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Self::Matches(subject, pattern) => {
                write!(f, "({subject} matches {:?})", pattern.as_str())
            }
            Self::Call(function, args) => {
                write!(f, "{}(", function.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}
