//! The filter expression language.
//!
//! A small, side-effect free language over one message:
//!
//! ```text
//! value.level == "error" && headers["region"] startsWith "eu-"
//! len(value.items) > 3 || key matches "^order-[0-9]+$"
//! num(value) / 2 >= 10 && partition != 0
//! ```
//!
//! - [`parser`] turns source text into an [`Expr`] tree, resolving identifiers
//!   and compiling `matches` patterns up front.
//! - [`eval`] interprets a tree against a message.

pub mod ast;
pub mod eval;
pub mod parser;

pub use ast::{BinaryOp, Expr, Function, Literal, Root, UnaryOp};
pub use eval::Value;
pub use parser::{MAX_DEPTH, MAX_HEIGHT, MAX_SOURCE_LEN, parse};
