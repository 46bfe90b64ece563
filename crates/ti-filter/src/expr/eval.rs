//! Sandboxed interpreter for the filter language.
//!
//! Evaluation only reads the message handed in. There are no loops, no
//! variables, and no callbacks into the host, so running time is bounded by
//! the size of the tree and the message.

use std::borrow::Cow;
use std::cell::OnceCell;
use std::cmp::Ordering;

use ti_core::{Header, Message, Payload};

use super::ast::{BinaryOp, Expr, Function, Literal, Root, UnaryOp};
use crate::error::EvalError;

/// A value produced while evaluating an expression.
#[derive(Debug, Clone)]
pub enum Value<'v> {
    /// `null`, also the result of reading a missing field.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number.
    Number(f64),
    /// A string.
    Str(Cow<'v, str>),
    /// A structured list or object taken from a payload.
    Json(&'v serde_json::Value),
    /// The message headers.
    Headers(&'v [Header]),
}

impl<'v> Value<'v> {
    fn from_json(json: &'v serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::Str(Cow::Borrowed(s)),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => Self::Json(json),
        }
    }

    /// Returns the name of this value's type, as used in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::Json(serde_json::Value::Array(_)) => "list",
            Self::Json(_) => "object",
            Self::Headers(_) => "headers",
        }
    }
}

/// Per-message evaluation state; payloads are parsed at most once.
pub(crate) struct Scope<'m> {
    message: &'m Message,
    key: OnceCell<Option<serde_json::Value>>,
    value: OnceCell<Option<serde_json::Value>>,
}

impl<'m> Scope<'m> {
    pub(crate) fn new(message: &'m Message) -> Self {
        Self {
            message,
            key: OnceCell::new(),
            value: OnceCell::new(),
        }
    }

    fn payload<'v>(
        &'v self,
        payload: Option<&'v Payload>,
        parsed: &'v OnceCell<Option<serde_json::Value>>,
    ) -> Value<'v> {
        let Some(payload) = payload else {
            return Value::Null;
        };
        match parsed.get_or_init(|| payload.structured()) {
            Some(json) => Value::Json(json),
            None => Value::Str(payload.as_text()),
        }
    }
}

/// Evaluates `expr` against the message in `scope` and requires a boolean.
pub(crate) fn evaluate(expr: &Expr, scope: &Scope<'_>) -> Result<bool, EvalError> {
    match eval(expr, scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::NotBoolean(other.type_name())),
    }
}

#[allow(clippy::cast_precision_loss)] // offsets and timestamps fit f64 for comparison purposes
fn eval<'v>(expr: &'v Expr, scope: &'v Scope<'v>) -> Result<Value<'v>, EvalError> {
    let message = scope.message;
    Ok(match expr {
        Expr::Literal(Literal::Null) => Value::Null,
        Expr::Literal(Literal::Bool(b)) => Value::Bool(*b),
        Expr::Literal(Literal::Number(n)) => Value::Number(*n),
        Expr::Literal(Literal::Str(s)) => Value::Str(Cow::Borrowed(s)),

        Expr::Root(Root::Key) => scope.payload(message.key.as_ref(), &scope.key),
        Expr::Root(Root::Value) => scope.payload(message.value.as_ref(), &scope.value),
        Expr::Root(Root::Headers) => Value::Headers(&message.headers),
        Expr::Root(Root::Offset) => Value::Number(message.offset as f64),
        Expr::Root(Root::Partition) => Value::Number(f64::from(message.partition)),
        Expr::Root(Root::Timestamp) => Value::Number(message.timestamp as f64),

        Expr::Member(target, name) => member(eval(target, scope)?, name)?,
        Expr::Index(target, index) => {
            let target = eval(target, scope)?;
            let index = eval(index, scope)?;
            index_into(target, &index)?
        }

        Expr::Unary(UnaryOp::Not, operand) => match eval(operand, scope)? {
            Value::Bool(b) => Value::Bool(!b),
            other => return Err(type_mismatch("!", &other, None)),
        },
        Expr::Unary(UnaryOp::Neg, operand) => match eval(operand, scope)? {
            Value::Number(n) => Value::Number(-n),
            other => return Err(type_mismatch("-", &other, None)),
        },

        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            Value::Bool(boolean("&&", eval(lhs, scope)?)? && boolean("&&", eval(rhs, scope)?)?)
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            Value::Bool(boolean("||", eval(lhs, scope)?)? || boolean("||", eval(rhs, scope)?)?)
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, scope)?;
            let rhs = eval(rhs, scope)?;
            binary(*op, lhs, rhs)?
        }

        Expr::Matches(subject, pattern) => match eval(subject, scope)? {
            Value::Str(s) => Value::Bool(pattern.is_match(&s)),
            other => return Err(type_mismatch("matches", &other, None)),
        },

        Expr::Call(function, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, scope)?);
            }
            call(*function, values)?
        }
    })
}

fn type_mismatch(op: &'static str, left: &Value<'_>, right: Option<&Value<'_>>) -> EvalError {
    EvalError::TypeMismatch {
        op,
        left: left.type_name(),
        right: right.map_or("", Value::type_name),
    }
}

fn boolean(op: &'static str, value: Value<'_>) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(type_mismatch(op, &other, None)),
    }
}

fn header_value<'v>(headers: &'v [Header], name: &str) -> Value<'v> {
    headers
        .iter()
        .find(|header| header.key == name)
        .map_or(Value::Null, |header| Value::Str(Cow::Borrowed(&header.value)))
}

fn member<'v>(target: Value<'v>, name: &str) -> Result<Value<'v>, EvalError> {
    match target {
        Value::Null => Ok(Value::Null),
        Value::Json(serde_json::Value::Object(map)) => {
            Ok(map.get(name).map_or(Value::Null, Value::from_json))
        }
        Value::Headers(headers) => Ok(header_value(headers, name)),
        other => Err(EvalError::NoSuchField {
            field: name.to_owned(),
            kind: other.type_name(),
        }),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // guarded by the integer check
fn index_into<'v>(target: Value<'v>, index: &Value<'_>) -> Result<Value<'v>, EvalError> {
    match (target, index) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::Json(serde_json::Value::Object(map)), Value::Str(key)) => {
            Ok(map.get(&**key).map_or(Value::Null, Value::from_json))
        }
        (Value::Json(serde_json::Value::Array(items)), Value::Number(n)) => {
            if n.fract() != 0.0 || *n < 0.0 {
                return Ok(Value::Null);
            }
            Ok(items
                .get(*n as usize)
                .map_or(Value::Null, Value::from_json))
        }
        (Value::Headers(headers), Value::Str(name)) => Ok(header_value(headers, name)),
        (target, index) => Err(EvalError::NoSuchField {
            field: render(index),
            kind: target.type_name(),
        }),
    }
}

fn values_equal(lhs: &Value<'_>, rhs: &Value<'_>) -> bool {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        #[allow(clippy::float_cmp)] // exact equality is the language semantics
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Json(a), Value::Json(b)) => a == b,
        _ => false,
    }
}

fn ordering(op: BinaryOp, lhs: &Value<'_>, rhs: &Value<'_>) -> Result<Option<Ordering>, EvalError> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => Ok(a.partial_cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        _ => Err(type_mismatch(op.symbol(), lhs, Some(rhs))),
    }
}

fn contains(lhs: &Value<'_>, rhs: &Value<'_>) -> Result<bool, EvalError> {
    match (lhs, rhs) {
        (Value::Str(haystack), Value::Str(needle)) => Ok(haystack.contains(&**needle)),
        (Value::Json(serde_json::Value::Array(items)), needle) => Ok(items
            .iter()
            .any(|item| values_equal(&Value::from_json(item), needle))),
        (Value::Json(serde_json::Value::Object(map)), Value::Str(key)) => {
            Ok(map.contains_key(&**key))
        }
        (Value::Headers(headers), Value::Str(key)) => {
            Ok(headers.iter().any(|header| header.key == **key))
        }
        _ => Err(type_mismatch("contains", lhs, Some(rhs))),
    }
}

fn binary<'v>(op: BinaryOp, lhs: Value<'v>, rhs: Value<'v>) -> Result<Value<'v>, EvalError> {
    let result = match op {
        BinaryOp::Eq => Value::Bool(values_equal(&lhs, &rhs)),
        BinaryOp::Ne => Value::Bool(!values_equal(&lhs, &rhs)),
        BinaryOp::Lt => Value::Bool(ordering(op, &lhs, &rhs)? == Some(Ordering::Less)),
        BinaryOp::Le => Value::Bool(matches!(
            ordering(op, &lhs, &rhs)?,
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Gt => Value::Bool(ordering(op, &lhs, &rhs)? == Some(Ordering::Greater)),
        BinaryOp::Ge => Value::Bool(matches!(
            ordering(op, &lhs, &rhs)?,
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::Contains => Value::Bool(contains(&lhs, &rhs)?),
        BinaryOp::StartsWith | BinaryOp::EndsWith => match (&lhs, &rhs) {
            (Value::Str(s), Value::Str(affix)) => Value::Bool(if op == BinaryOp::StartsWith {
                s.starts_with(&**affix)
            } else {
                s.ends_with(&**affix)
            }),
            _ => return Err(type_mismatch(op.symbol(), &lhs, Some(&rhs))),
        },
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
            (Value::Str(a), Value::Str(b)) => Value::Str(Cow::Owned(format!("{a}{b}"))),
            (lhs, rhs) => return Err(type_mismatch("+", &lhs, Some(&rhs))),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (Value::Number(a), Value::Number(b)) = (&lhs, &rhs) else {
                return Err(type_mismatch(op.symbol(), &lhs, Some(&rhs)));
            };
            let (a, b) = (*a, *b);
            match op {
                BinaryOp::Sub => Value::Number(a - b),
                BinaryOp::Mul => Value::Number(a * b),
                _ if b == 0.0 => return Err(EvalError::DivisionByZero),
                BinaryOp::Div => Value::Number(a / b),
                _ => Value::Number(a % b),
            }
        }
        BinaryOp::And | BinaryOp::Or => {
            Value::Bool(boolean(op.symbol(), lhs)? && boolean(op.symbol(), rhs)?)
        }
    };
    Ok(result)
}

fn call<'v>(function: Function, mut args: Vec<Value<'v>>) -> Result<Value<'v>, EvalError> {
    let arg = args.pop().unwrap_or(Value::Null);
    let op = function.name();
    Ok(match (function, arg) {
        (Function::Len, Value::Str(s)) => Value::Number(count(s.chars().count())),
        (Function::Len, Value::Json(serde_json::Value::Array(items))) => {
            Value::Number(count(items.len()))
        }
        (Function::Len, Value::Json(serde_json::Value::Object(map))) => {
            Value::Number(count(map.len()))
        }
        (Function::Len, Value::Headers(headers)) => Value::Number(count(headers.len())),
        (Function::Lower, Value::Str(s)) => Value::Str(Cow::Owned(s.to_lowercase())),
        (Function::Upper, Value::Str(s)) => Value::Str(Cow::Owned(s.to_uppercase())),
        (Function::Trim, Value::Str(Cow::Borrowed(s))) => Value::Str(Cow::Borrowed(s.trim())),
        (Function::Trim, Value::Str(Cow::Owned(s))) => Value::Str(Cow::Owned(s.trim().to_owned())),
        (Function::Str, Value::Headers(_)) => {
            return Err(EvalError::TypeMismatch {
                op,
                left: "headers",
                right: "",
            });
        }
        (Function::Str, value) => Value::Str(Cow::Owned(render(&value))),
        (Function::Num, Value::Number(n)) => Value::Number(n),
        (Function::Num, Value::Str(s)) => Value::Number(
            s.trim()
                .parse::<f64>()
                .map_err(|_| EvalError::NotANumber(s.clone().into_owned()))?,
        ),
        (_, other) => return Err(type_mismatch(op, &other, None)),
    })
}

#[allow(clippy::cast_precision_loss)] // lengths are small
fn count(n: usize) -> f64 {
    n as f64
}

/// Renders a value as text, printing whole numbers without a fraction.
#[allow(clippy::cast_possible_truncation)] // guarded by the integer check
fn render(value: &Value<'_>) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 => {
            (*n as i64).to_string()
        }
        Value::Number(n) => n.to_string(),
        Value::Str(s) => s.clone().into_owned(),
        Value::Json(json) => json.to_string(),
        Value::Headers(headers) => format!("<{} headers>", headers.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;

    fn sample() -> Message {
        Message::new(2, 41)
            .with_timestamp(1_700_000_000_000)
            .with_key("order-17")
            .with_value(r#"{"level":"error","code":503,"tags":["db","retry"],"user":{"id":"u1"}}"#)
            .with_header(Header::new("trace-id", "abc123"))
    }

    fn run(source: &str, message: &Message) -> Result<bool, EvalError> {
        let expr = parse(source).unwrap();
        evaluate(&expr, &Scope::new(message))
    }

    #[test]
    fn test_structured_value_access() {
        let m = sample();
        assert_eq!(run(r#"value.level == "error""#, &m), Ok(true));
        assert_eq!(run("value.code >= 500 && value.code < 600", &m), Ok(true));
        assert_eq!(run(r#"value.user.id == "u1""#, &m), Ok(true));
        assert_eq!(run(r#"value["user"]["id"] == "u1""#, &m), Ok(true));
        assert_eq!(run(r#"value.tags[1] == "retry""#, &m), Ok(true));
    }

    #[test]
    fn test_raw_text_key() {
        let m = sample();
        assert_eq!(run(r#"key startsWith "order-""#, &m), Ok(true));
        assert_eq!(run(r#"key matches "^order-\\d+$""#, &m), Ok(true));
        assert_eq!(run(r#"num(key) > 1"#, &m), Err(EvalError::NotANumber("order-17".to_owned())));
    }

    #[test]
    fn test_metadata_roots() {
        let m = sample();
        assert_eq!(run("offset == 41 && partition == 2", &m), Ok(true));
        assert_eq!(run("timestamp > 1600000000000", &m), Ok(true));
        assert_eq!(run("offset % 2 == 1", &m), Ok(true));
    }

    #[test]
    fn test_headers() {
        let m = sample();
        assert_eq!(run(r#"headers["trace-id"] == "abc123""#, &m), Ok(true));
        assert_eq!(run(r#"headers contains "trace-id""#, &m), Ok(true));
        assert_eq!(run("headers.missing == null", &m), Ok(true));
        assert_eq!(run("len(headers) == 1", &m), Ok(true));
    }

    #[test]
    fn test_contains_on_lists_and_objects() {
        let m = sample();
        assert_eq!(run(r#"value.tags contains "db""#, &m), Ok(true));
        assert_eq!(run(r#"value contains "user""#, &m), Ok(true));
        assert_eq!(run(r#"value.tags contains "cache""#, &m), Ok(false));
    }

    #[test]
    fn test_missing_fields_are_null() {
        let m = sample();
        assert_eq!(run("value.nothing == null", &m), Ok(true));
        assert_eq!(run("value.nothing.deeper == null", &m), Ok(true));
        assert_eq!(run("value.tags[9] == null", &m), Ok(true));
    }

    #[test]
    fn test_absent_payload_is_null() {
        let m = Message::new(0, 0);
        assert_eq!(run("key == null && value == null", &m), Ok(true));
    }

    #[test]
    fn test_no_implicit_coercion() {
        let m = Message::new(0, 0).with_value("42");
        assert_eq!(run(r#"value == "42""#, &m), Ok(true));
        assert_eq!(run("value == 42", &m), Ok(false));
        assert_eq!(run("num(value) == 42", &m), Ok(true));
    }

    #[test]
    fn test_type_errors() {
        let m = sample();
        assert_eq!(
            run(r#"value.level < 3"#, &m),
            Err(EvalError::TypeMismatch {
                op: "<",
                left: "string",
                right: "number"
            })
        );
        assert!(matches!(
            run("value.code.inner == 1", &m),
            Err(EvalError::NoSuchField { .. })
        ));
        assert_eq!(run("offset / 0 == 1", &m), Err(EvalError::DivisionByZero));
        assert_eq!(run("offset + 1", &m), Err(EvalError::NotBoolean("number")));
        assert!(run("!offset", &m).is_err());
    }

    #[test]
    fn test_short_circuit() {
        let m = sample();
        // The right-hand side would fail if it were evaluated.
        assert_eq!(run("false && offset / 0 == 1", &m), Ok(false));
        assert_eq!(run("true || offset / 0 == 1", &m), Ok(true));
    }

    #[test]
    fn test_string_functions() {
        let m = Message::new(0, 0).with_value("  MiXed  ");
        assert_eq!(run(r#"lower(trim(value)) == "mixed""#, &m), Ok(true));
        assert_eq!(run(r#"upper(trim(value)) == "MIXED""#, &m), Ok(true));
        assert_eq!(run(r#"str(offset) + "!" == "0!""#, &m), Ok(true));
        assert_eq!(run("len(value) == 9", &m), Ok(true));
    }

    #[test]
    fn test_deterministic() {
        let m = sample();
        let expr = parse(r#"value.level == "error" && len(value.tags) == 2"#).unwrap();
        let first = evaluate(&expr, &Scope::new(&m));
        for _ in 0..10 {
            assert_eq!(evaluate(&expr, &Scope::new(&m)), first);
        }
    }
}
