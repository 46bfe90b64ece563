//! Nom parser for the filter language.
//!
//! Precedence, loosest first: `||`, `&&`, prefix `!`, comparisons (including
//! `contains`, `startsWith`, `endsWith`, `matches`), `+ -`, `* / %`, prefix
//! `-`, then member and index access.
//!
//! Identifiers are resolved while parsing, so an unknown root or function is
//! reported with its position instead of failing later on every message.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{all_consuming, cut, map, map_res, not, opt, recognize, value},
    error::{ErrorKind, FromExternalError, ParseError},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated},
};
use regex::RegexBuilder;

use super::ast::{BinaryOp, Expr, Function, Literal, Root, UnaryOp};
use crate::error::CompileError;

/// Longest accepted expression source, in bytes.
pub const MAX_SOURCE_LEN: usize = 4096;

/// Deepest accepted nesting of parentheses, indexes, calls, and prefix operators.
pub const MAX_DEPTH: usize = 64;

/// Tallest accepted syntax tree. Operator chains and member accesses count
/// one level per operand, so this bounds evaluation recursion as well.
pub const MAX_HEIGHT: usize = 256;

/// Compiled size limit for `matches` patterns.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

// =============================================================================
// ERROR PLUMBING
// =============================================================================

#[derive(Debug)]
enum Reason {
    Unexpected,
    Expected(char),
    UnknownIdentifier(String),
    UnknownFunction(String),
    Arity {
        function: &'static str,
        expected: usize,
        found: usize,
    },
    UnterminatedString,
    BadPattern(String),
    TooDeep(usize),
}

#[derive(Debug)]
struct SyntaxError<'a> {
    input: &'a str,
    reason: Reason,
}

impl<'a> ParseError<&'a str> for SyntaxError<'a> {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        Self {
            input,
            reason: Reason::Unexpected,
        }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    fn from_char(input: &'a str, c: char) -> Self {
        Self {
            input,
            reason: Reason::Expected(c),
        }
    }

    // Report whichever branch got further.
    fn or(self, other: Self) -> Self {
        if other.input.len() < self.input.len() {
            other
        } else {
            self
        }
    }
}

impl<'a, E> FromExternalError<&'a str, E> for SyntaxError<'a> {
    fn from_external_error(input: &'a str, kind: ErrorKind, _e: E) -> Self {
        Self::from_error_kind(input, kind)
    }
}

impl SyntaxError<'_> {
    fn into_compile_error(self, source: &str) -> CompileError {
        let position = source.len() - self.input.len();
        let message = match self.reason {
            Reason::Unexpected if self.input.is_empty() => "unexpected end of expression".to_owned(),
            Reason::Unexpected => {
                let snippet: String = self.input.chars().take(16).collect();
                format!("unexpected '{snippet}'")
            }
            Reason::Expected(c) => format!("expected '{c}'"),
            Reason::UnknownIdentifier(name) => format!("unknown identifier '{name}'"),
            Reason::UnknownFunction(name) => format!("unknown function '{name}'"),
            Reason::Arity {
                function,
                expected,
                found,
            } => format!("'{function}' takes {expected} argument(s), found {found}"),
            Reason::UnterminatedString => "unterminated string".to_owned(),
            Reason::BadPattern(detail) => format!("invalid pattern: {detail}"),
            Reason::TooDeep(limit) => format!("expression nests deeper than {limit} levels"),
        };
        CompileError { message, position }
    }
}

type PResult<'a, T> = IResult<&'a str, T, SyntaxError<'a>>;

fn failure<T>(input: &str, reason: Reason) -> PResult<'_, T> {
    Err(nom::Err::Failure(SyntaxError { input, reason }))
}

// =============================================================================
// MAIN PARSER ENTRY POINT
// =============================================================================

/// Parses a filter expression into its syntax tree.
///
/// # Errors
///
/// Returns a [`CompileError`] locating the first problem in `source`.
///
/// # Examples
///
/// ```
/// use ti_filter::expr::parse;
///
/// let expr = parse(r#"value.level == "error" && offset > 10"#)?;
/// assert_eq!(expr.to_string(), r#"((value.level == "error") && (offset > 10))"#);
///
/// let err = parse("offset >").unwrap_err();
/// assert_eq!(err.position, 8);
/// # Ok::<(), ti_filter::CompileError>(())
/// ```
pub fn parse(source: &str) -> Result<Expr, CompileError> {
    if source.trim().is_empty() {
        return Err(CompileError::new("expression is empty", 0));
    }
    if source.len() > MAX_SOURCE_LEN {
        return Err(CompileError::new(
            format!("expression is longer than {MAX_SOURCE_LEN} bytes"),
            MAX_SOURCE_LEN,
        ));
    }

    match all_consuming(ws(|i| expr(i, 0)))(source) {
        Ok((_, parsed)) => Ok(parsed.expr),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(e.into_compile_error(source)),
        Err(nom::Err::Incomplete(_)) => Err(CompileError::new(
            "unexpected end of expression",
            source.len(),
        )),
    }
}

// =============================================================================
// GRAMMAR
// =============================================================================

/// A parsed subtree and its height.
struct Node {
    expr: Expr,
    height: usize,
}

impl Node {
    const fn leaf(expr: Expr) -> Self {
        Self { expr, height: 1 }
    }
}

/// Wraps `expr` over children of height `children`, failing at `at` once the
/// tree is taller than [`MAX_HEIGHT`].
fn grow(at: &str, children: usize, expr: Expr) -> Result<Node, nom::Err<SyntaxError<'_>>> {
    let height = children + 1;
    if height > MAX_HEIGHT {
        return Err(nom::Err::Failure(SyntaxError {
            input: at,
            reason: Reason::TooDeep(MAX_HEIGHT),
        }));
    }
    Ok(Node { expr, height })
}

/// Left-folds an operator chain, checking the height after every operand.
fn fold_chain(
    at: &str,
    first: Node,
    rest: impl IntoIterator<Item = (BinaryOp, Node)>,
) -> Result<Node, nom::Err<SyntaxError<'_>>> {
    rest.into_iter().try_fold(first, |lhs, (op, rhs)| {
        grow(
            at,
            lhs.height.max(rhs.height),
            Expr::binary(op, lhs.expr, rhs.expr),
        )
    })
}

fn expr(input: &str, depth: usize) -> PResult<'_, Node> {
    if depth > MAX_DEPTH {
        return failure(input, Reason::TooDeep(MAX_DEPTH));
    }
    or_expr(input, depth)
}

fn or_expr(input: &str, depth: usize) -> PResult<'_, Node> {
    let (rest, first) = and_expr(input, depth)?;
    let (rest, others) = many0(preceded(ws(tag("||")), cut(|i| and_expr(i, depth))))(rest)?;
    let folded = fold_chain(input, first, others.into_iter().map(|rhs| (BinaryOp::Or, rhs)))?;
    Ok((rest, folded))
}

fn and_expr(input: &str, depth: usize) -> PResult<'_, Node> {
    let (rest, first) = not_expr(input, depth)?;
    let (rest, others) = many0(preceded(ws(tag("&&")), cut(|i| not_expr(i, depth))))(rest)?;
    let folded = fold_chain(input, first, others.into_iter().map(|rhs| (BinaryOp::And, rhs)))?;
    Ok((rest, folded))
}

fn not_expr(input: &str, depth: usize) -> PResult<'_, Node> {
    if depth > MAX_DEPTH {
        return failure(input, Reason::TooDeep(MAX_DEPTH));
    }
    alt((|i| negation(i, depth), |i| compare(i, depth)))(input)
}

fn negation(input: &str, depth: usize) -> PResult<'_, Node> {
    let (rest, operand) = preceded(ws(char('!')), cut(|i| not_expr(i, depth + 1)))(input)?;
    let node = grow(
        input,
        operand.height,
        Expr::unary(UnaryOp::Not, operand.expr),
    )?;
    Ok((rest, node))
}

fn compare(input: &str, depth: usize) -> PResult<'_, Node> {
    let (rest, lhs) = sum(input, depth)?;

    let (rest, matches_kw) = opt(ws(keyword("matches")))(rest)?;
    if matches_kw.is_some() {
        let pattern_start = rest;
        let (rest, pattern) = cut(ws(string_literal))(rest)?;
        let regex = RegexBuilder::new(&pattern)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|e| {
                nom::Err::Failure(SyntaxError {
                    input: pattern_start,
                    reason: Reason::BadPattern(e.to_string()),
                })
            })?;
        let node = grow(input, lhs.height, Expr::Matches(Box::new(lhs.expr), regex))?;
        return Ok((rest, node));
    }

    let (rest, tail) = opt(pair(ws(comparison_op), cut(|i| sum(i, depth))))(rest)?;
    let node = match tail {
        Some((op, rhs)) => grow(
            input,
            lhs.height.max(rhs.height),
            Expr::binary(op, lhs.expr, rhs.expr),
        )?,
        None => lhs,
    };
    Ok((rest, node))
}

fn comparison_op(input: &str) -> PResult<'_, BinaryOp> {
    alt((
        value(BinaryOp::Eq, tag("==")),
        value(BinaryOp::Ne, tag("!=")),
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Lt, char('<')),
        value(BinaryOp::Gt, char('>')),
        value(BinaryOp::Contains, keyword("contains")),
        value(BinaryOp::StartsWith, keyword("startsWith")),
        value(BinaryOp::EndsWith, keyword("endsWith")),
    ))(input)
}

fn sum(input: &str, depth: usize) -> PResult<'_, Node> {
    let (rest, first) = product(input, depth)?;
    let (rest, others) = many0(pair(
        ws(alt((
            value(BinaryOp::Add, char('+')),
            value(BinaryOp::Sub, char('-')),
        ))),
        cut(|i| product(i, depth)),
    ))(rest)?;
    Ok((rest, fold_chain(input, first, others)?))
}

fn product(input: &str, depth: usize) -> PResult<'_, Node> {
    let (rest, first) = unary(input, depth)?;
    let (rest, others) = many0(pair(
        ws(alt((
            value(BinaryOp::Mul, char('*')),
            value(BinaryOp::Div, char('/')),
            value(BinaryOp::Rem, char('%')),
        ))),
        cut(|i| unary(i, depth)),
    ))(rest)?;
    Ok((rest, fold_chain(input, first, others)?))
}

fn unary(input: &str, depth: usize) -> PResult<'_, Node> {
    if depth > MAX_DEPTH {
        return failure(input, Reason::TooDeep(MAX_DEPTH));
    }
    alt((|i| negative(i, depth), |i| postfix(i, depth)))(input)
}

fn negative(input: &str, depth: usize) -> PResult<'_, Node> {
    let (rest, operand) = preceded(ws(char('-')), cut(|i| unary(i, depth + 1)))(input)?;
    let node = grow(
        input,
        operand.height,
        Expr::unary(UnaryOp::Neg, operand.expr),
    )?;
    Ok((rest, node))
}

enum Accessor {
    Member(String),
    Index(Node),
}

fn postfix(input: &str, depth: usize) -> PResult<'_, Node> {
    let (rest, base) = primary(input, depth)?;
    let (rest, accessors) = many0(alt((
        map(preceded(ws(char('.')), cut(identifier)), |name: &str| {
            Accessor::Member(name.to_owned())
        }),
        map(
            delimited(
                ws(char('[')),
                cut(|i| expr(i, depth + 1)),
                cut(ws(char(']'))),
            ),
            Accessor::Index,
        ),
    )))(rest)?;

    let node = accessors
        .into_iter()
        .try_fold(base, |target, accessor| match accessor {
            Accessor::Member(name) => grow(
                input,
                target.height,
                Expr::Member(Box::new(target.expr), name),
            ),
            Accessor::Index(index) => grow(
                input,
                target.height.max(index.height),
                Expr::Index(Box::new(target.expr), Box::new(index.expr)),
            ),
        })?;
    Ok((rest, node))
}

fn primary(input: &str, depth: usize) -> PResult<'_, Node> {
    ws(alt((
        map(number, |n| Node::leaf(Expr::Literal(Literal::Number(n)))),
        map(string_literal, |s| Node::leaf(Expr::Literal(Literal::Str(s)))),
        delimited(
            char('('),
            cut(|i| expr(i, depth + 1)),
            cut(ws(char(')'))),
        ),
        |i| named(i, depth),
    )))(input)
}

/// Keyword literals, function calls, and roots.
fn named(input: &str, depth: usize) -> PResult<'_, Node> {
    let (rest, ident) = identifier(input)?;

    match ident {
        "true" => return Ok((rest, Node::leaf(Expr::Literal(Literal::Bool(true))))),
        "false" => return Ok((rest, Node::leaf(Expr::Literal(Literal::Bool(false))))),
        "null" => return Ok((rest, Node::leaf(Expr::Literal(Literal::Null)))),
        _ => {}
    }

    if let Ok((after_paren, _)) =
        preceded(multispace0::<&str, SyntaxError<'_>>, char('('))(rest)
    {
        let Some(function) = Function::from_ident(ident) else {
            return failure(input, Reason::UnknownFunction(ident.to_owned()));
        };
        if depth >= MAX_DEPTH {
            return failure(input, Reason::TooDeep(MAX_DEPTH));
        }
        let (rest, args) =
            separated_list0(ws(char(',')), |i| expr(i, depth + 1))(after_paren)?;
        let (rest, _) = cut(ws(char(')')))(rest)?;
        if args.len() != function.arity() {
            return failure(
                input,
                Reason::Arity {
                    function: function.name(),
                    expected: function.arity(),
                    found: args.len(),
                },
            );
        }
        let children = args.iter().map(|arg| arg.height).max().unwrap_or(0);
        let args = args.into_iter().map(|arg| arg.expr).collect();
        return Ok((rest, grow(input, children, Expr::Call(function, args))?));
    }

    match Root::from_ident(ident) {
        Some(root) => Ok((rest, Node::leaf(Expr::Root(root)))),
        None => failure(input, Reason::UnknownIdentifier(ident.to_owned())),
    }
}

// =============================================================================
// HELPER PARSERS
// =============================================================================

/// Wraps a parser so surrounding whitespace is skipped.
fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn identifier(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(is_ident_char),
    ))(input)
}

/// Matches `word` only when it is not the prefix of a longer identifier.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    terminated(tag(word), not(satisfy(is_ident_char)))
}

/// Parse a decimal number: `12` or `12.5`
fn number(input: &str) -> PResult<'_, f64> {
    map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        str::parse::<f64>,
    )(input)
}

/// Parse a quoted string: "some text" or 'some text', with backslash escapes.
fn string_literal(input: &str) -> PResult<'_, String> {
    let mut chars = input.char_indices();
    let quote = match chars.next() {
        Some((_, c @ ('"' | '\''))) => c,
        _ => {
            return Err(nom::Err::Error(SyntaxError::from_error_kind(
                input,
                ErrorKind::Char,
            )));
        }
    };

    let mut out = String::new();
    let mut escaped = false;
    for (i, c) in chars {
        if escaped {
            out.push(match c {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other,
            });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Ok((&input[i + c.len_utf8()..], out));
        } else {
            out.push(c);
        }
    }
    failure(input, Reason::UnterminatedString)
}
