//! WebAssembly text format (WAT) front-end.
//!
//! Source text flows through three stages: the [`Lexer`] turns bytes into
//! tokens, [`sexpr`] matches parentheses into a tree, and [`parse`] walks
//! that tree into a [`crate::module::Module`] equivalent to what a
//! binary-format decoder would produce.
//!
//! # Example
//!
//! ```
//! let module = watc::wat::parse(r#"
//!     (module
//!         (func (export "add") (param i32 i32) (result i32)
//!             local.get 0
//!             local.get 1
//!             i32.add))
//! "#).unwrap();
//!
//! assert_eq!(module.exports[0].name, "add");
//! ```

mod cursor;
mod error;
mod lexer;
pub mod names;
pub(crate) mod parser;
pub mod sexpr;
mod token;

pub use error::LexError;
pub use lexer::Lexer;
pub use parser::{ParseError, parse, parse_module};
pub use token::{FloatLit, IntLit, Span, Token, TokenKind};
