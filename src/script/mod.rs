//! Extended-script support: the test dialect layered over plain modules.
//!
//! Scripts define modules, register them for cross-module imports, invoke
//! exports, read exported globals, and assert expected outcomes. The
//! [`Driver`] evaluates a script against a compiled artifact supplied
//! through the [`Compiler`] and [`Loader`] collaborator traits; binary
//! module bodies go through a [`BinaryDecoder`].
//!
//! # Example
//!
//! Parsing alone needs no collaborators:
//!
//! ```
//! let script = watc::script::parse_script(r#"
//!     (module (func (export "f") (result i32) (i32.const 42)))
//!     (assert_return (invoke "f") (i32.const 42))
//! "#).unwrap();
//! assert_eq!(script.commands.len(), 2);
//! ```

pub mod command;
mod driver;
mod faults;
mod parser;
pub mod values;

pub use command::{Action, Command, Script, ScriptModule};
pub use driver::{BinaryDecoder, Compiler, Driver, Environment, Loader, ScriptError, ScriptStats, mangle};
pub use faults::{Fault, catch_faults};
pub use parser::{SyntaxError, parse_script};
pub use values::Value;
