//! Text-format front-end for an ahead-of-time WebAssembly compiler.
//!
//! watc ingests human-readable WAT source — plain modules as well as the
//! extended script dialect used by the official test suite — and produces
//! an in-memory [`module::Module`] equivalent to what a binary-format
//! decoder would yield. Script input additionally drives an
//! execute-and-compare loop against a compiled artifact reached through
//! collaborator traits.
//!
//! # Modules
//!
//! - [`wat`] -- Lexer, s-expression reader, and module parser.
//! - [`module`] -- The binary-format-shaped module record.
//! - [`script`] -- Script directives, the evaluation driver, and the
//!   machine-fault guard around artifact calls.
//!
//! # Example
//!
//! ```
//! use watc::module::Instr;
//!
//! let module = watc::wat::parse(r#"
//!     (module
//!         (func $id (param $x i32) (result i32) local.get $x)
//!         (export "id" (func $id)))
//! "#).unwrap();
//!
//! assert_eq!(module.exports[0].name, "id");
//! assert_eq!(module.code[0].body, vec![Instr::LocalGet { local: 0 }, Instr::End]);
//! ```

pub mod module;
pub mod script;
pub mod wat;
