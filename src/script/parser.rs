//! Parser for the extended script dialect.
//!
//! Built on the s-expression reader. Module bodies are not parsed here:
//! inline WAT modules are carried as the raw source slice their span
//! covers, binary and quoted modules as their concatenated string
//! contents. The driver decides later whether parsing them is supposed to
//! succeed — `assert_malformed` exists to expect that it does not.

use super::command::{Action, Command, Script, ScriptModule};
use super::values::Value;
use crate::wat::parser::{parse_f32, parse_f64, parse_i32, parse_i64};
use crate::wat::sexpr::{self, ReadError, SExpr, SExprList};
use crate::wat::{ParseError, Span, TokenKind};
use std::fmt;

/// A syntax error in the directive layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
    pub span: Span,
}

impl SyntaxError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.span, self.message)
    }
}

impl std::error::Error for SyntaxError {}

impl From<ReadError> for SyntaxError {
    fn from(e: ReadError) -> Self {
        Self {
            message: e.message,
            span: e.span,
        }
    }
}

impl From<ParseError> for SyntaxError {
    fn from(e: ParseError) -> Self {
        Self {
            message: e.message,
            span: e.span,
        }
    }
}

/// Parse script source into its directive sequence.
pub fn parse_script(source: &str) -> Result<Script, SyntaxError> {
    let sexprs = sexpr::read_all(source)?;
    let mut commands = Vec::new();

    for sexpr in &sexprs {
        let list = sexpr
            .as_list()
            .ok_or_else(|| SyntaxError::new("expected top-level directive", sexpr.span()))?;
        let keyword = list
            .head_keyword()
            .ok_or_else(|| SyntaxError::new("expected directive keyword", list.span))?;

        let command = match keyword {
            "module" => parse_module_directive(source, list)?,
            "register" => parse_register(list)?,
            "invoke" | "get" => Command::Action {
                span: list.span,
                action: parse_action_list(list)?,
            },
            "assert_return" => {
                let action = parse_action(action_arg(list)?)?;
                let expected = match list.get(2) {
                    Some(item) => {
                        if list.get(3).is_some() {
                            return Err(SyntaxError::new("multiple return values", list.span));
                        }
                        Some(parse_value(item)?)
                    }
                    None => None,
                };
                Command::AssertReturn {
                    span: list.span,
                    action,
                    expected,
                }
            }
            "assert_return_canonical_nan" => Command::AssertReturnCanonicalNan {
                span: list.span,
                action: parse_action(action_arg(list)?)?,
            },
            "assert_return_arithmetic_nan" => Command::AssertReturnArithmeticNan {
                span: list.span,
                action: parse_action(action_arg(list)?)?,
            },
            "assert_trap" => {
                let inner = action_arg(list)?;
                let message = optional_message(list, 2)?;
                if inner.is_list_headed_by("module") {
                    Command::AssertModuleTrap {
                        span: list.span,
                        module: parse_inline_module(source, inner)?,
                        message,
                    }
                } else {
                    Command::AssertTrap {
                        span: list.span,
                        action: parse_action(inner)?,
                        message,
                    }
                }
            }
            "assert_malformed" => {
                let module = parse_inline_module(source, action_arg(list)?)?;
                Command::AssertMalformed {
                    span: list.span,
                    module,
                    message: optional_message(list, 2)?,
                }
            }
            "assert_invalid" => {
                let module = parse_inline_module(source, action_arg(list)?)?;
                Command::AssertInvalid {
                    span: list.span,
                    module,
                    message: optional_message(list, 2)?,
                }
            }
            "assert_unlinkable" => {
                let module = parse_inline_module(source, action_arg(list)?)?;
                Command::AssertUnlinkable {
                    span: list.span,
                    module,
                    message: optional_message(list, 2)?,
                }
            }
            "assert_exhaustion" => Command::AssertExhaustion { span: list.span },
            "script" | "input" | "output" => Command::Skipped { span: list.span },
            other => return Err(SyntaxError::new(format!("unknown directive: {}", other), list.span)),
        };
        commands.push(command);
    }

    Ok(Script { commands })
}

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

/// `(module $name? ...)` / `(module $name? binary string*)`
/// / `(module $name? quote string*)`.
fn parse_module_directive(source: &str, list: SExprList<'_>) -> Result<Command, SyntaxError> {
    let mut idx = 1;
    let name = list.get(idx).and_then(|s| s.as_id()).map(String::from);
    if name.is_some() {
        idx += 1;
    }

    let module = match list.get(idx).and_then(|s| s.as_keyword()) {
        Some("binary") => ScriptModule::Binary(concat_string_bytes(list, idx + 1)?),
        Some("quote") => ScriptModule::Quote(concat_string_text(list, idx + 1)?),
        _ => ScriptModule::Text(source[list.span.start..list.span.end].to_string()),
    };

    Ok(Command::Module {
        span: list.span,
        name,
        module,
    })
}

/// A `(module ...)` form inside an assertion.
fn parse_inline_module(source: &str, sexpr: &SExpr) -> Result<ScriptModule, SyntaxError> {
    let list = sexpr
        .as_list()
        .ok_or_else(|| SyntaxError::new("expected module", sexpr.span()))?;
    list.expect_head("module")?;

    let mut idx = 1;
    if list.get(idx).and_then(|s| s.as_id()).is_some() {
        idx += 1;
    }

    match list.get(idx).and_then(|s| s.as_keyword()) {
        Some("binary") => Ok(ScriptModule::Binary(concat_string_bytes(list, idx + 1)?)),
        Some("quote") => Ok(ScriptModule::Quote(concat_string_text(list, idx + 1)?)),
        _ => Ok(ScriptModule::Text(
            source[list.span.start..list.span.end].to_string(),
        )),
    }
}

/// Concatenated raw bytes of a run of string literals.
fn concat_string_bytes(list: SExprList<'_>, from: usize) -> Result<Vec<u8>, SyntaxError> {
    let mut bytes = Vec::new();
    for item in list.iter_from(from) {
        match item.as_atom().map(|t| &t.kind) {
            Some(TokenKind::String(b)) => bytes.extend_from_slice(b),
            _ => return Err(SyntaxError::new("expected string literal", item.span())),
        }
    }
    Ok(bytes)
}

/// Concatenated text of a run of string literals (for quoted modules).
fn concat_string_text(list: SExprList<'_>, from: usize) -> Result<String, SyntaxError> {
    let bytes = concat_string_bytes(list, from)?;
    String::from_utf8(bytes).map_err(|_| SyntaxError::new("malformed UTF-8 encoding", list.span))
}

// ---------------------------------------------------------------------------
// Register and actions
// ---------------------------------------------------------------------------

/// `(register "name" $mod?)`
fn parse_register(list: SExprList<'_>) -> Result<Command, SyntaxError> {
    let as_name = expect_string(list.get(1), list.span)?;
    let module_name = list.get(2).and_then(|s| s.as_id()).map(String::from);
    Ok(Command::Register {
        span: list.span,
        as_name,
        module_name,
    })
}

/// The first operand of an assertion directive.
fn action_arg<'a>(list: SExprList<'a>) -> Result<&'a SExpr, SyntaxError> {
    list.get(1)
        .ok_or_else(|| SyntaxError::new("expected action or module", list.span))
}

fn parse_action(sexpr: &SExpr) -> Result<Action, SyntaxError> {
    let list = sexpr
        .as_list()
        .ok_or_else(|| SyntaxError::new("expected action", sexpr.span()))?;
    parse_action_list(list)
}

fn parse_action_list(list: SExprList<'_>) -> Result<Action, SyntaxError> {
    match list.head_keyword() {
        Some("invoke") => {
            let mut idx = 1;
            let module = list.get(idx).and_then(|s| s.as_id()).map(String::from);
            if module.is_some() {
                idx += 1;
            }
            let name = expect_string(list.get(idx), list.span)?;
            idx += 1;

            let mut args = Vec::new();
            for item in list.iter_from(idx) {
                args.push(parse_value(item)?);
            }
            Ok(Action::Invoke { module, name, args })
        }
        Some("get") => {
            let mut idx = 1;
            let module = list.get(idx).and_then(|s| s.as_id()).map(String::from);
            if module.is_some() {
                idx += 1;
            }
            let name = expect_string(list.get(idx), list.span)?;
            Ok(Action::Get { module, name })
        }
        Some(other) => Err(SyntaxError::new(format!("unknown action: {}", other), list.span)),
        None => Err(SyntaxError::new("expected action keyword", list.span)),
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// `(t.const literal)` for the four value types.
fn parse_value(sexpr: &SExpr) -> Result<Value, SyntaxError> {
    let list = sexpr
        .as_list()
        .ok_or_else(|| SyntaxError::new("expected constant", sexpr.span()))?;
    let keyword = list
        .head_keyword()
        .ok_or_else(|| SyntaxError::new("expected constant keyword", list.span))?;

    if list.get(2).is_some() {
        return Err(SyntaxError::new("unexpected token", list.get(2).unwrap().span()));
    }

    let value = match keyword {
        "i32.const" => Value::I32(parse_i32(list.get(1))?),
        "i64.const" => Value::I64(parse_i64(list.get(1))?),
        "f32.const" => Value::F32(parse_f32(list.get(1))?),
        "f64.const" => Value::F64(parse_f64(list.get(1))?),
        other => return Err(SyntaxError::new(format!("unknown constant: {}", other), list.span)),
    };
    Ok(value)
}

/// Optional trailing `"message"` on an assertion. Recorded only.
fn optional_message(list: SExprList<'_>, idx: usize) -> Result<Option<String>, SyntaxError> {
    match list.get(idx) {
        Some(item) => Ok(Some(expect_string(Some(item), list.span)?)),
        None => Ok(None),
    }
}

fn expect_string(sexpr: Option<&SExpr>, fallback: Span) -> Result<String, SyntaxError> {
    let item = sexpr.ok_or_else(|| SyntaxError::new("expected string", fallback))?;
    let token = item
        .as_atom()
        .ok_or_else(|| SyntaxError::new("expected string", item.span()))?;
    match &token.kind {
        TokenKind::String(b) => {
            String::from_utf8(b.clone()).map_err(|_| SyntaxError::new("malformed UTF-8 encoding", token.span))
        }
        _ => Err(SyntaxError::new("expected string", token.span)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_then_assert_return() {
        let source = r#"
(module
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add))
(assert_return (invoke "add" (i32.const 1) (i32.const 2)) (i32.const 3))
"#;
        let script = parse_script(source).unwrap();
        assert_eq!(script.commands.len(), 2);
        assert!(matches!(&script.commands[0], Command::Module { .. }));

        let Command::AssertReturn { action, expected, .. } = &script.commands[1] else {
            panic!("expected assert_return");
        };
        let Action::Invoke { name, args, .. } = action else {
            panic!("expected invoke");
        };
        assert_eq!(name, "add");
        assert_eq!(args.len(), 2);
        assert!(matches!(expected, Some(Value::I32(3))));
    }

    #[test]
    fn assert_return_without_constant() {
        let script = parse_script(r#"(assert_return (invoke "run"))"#).unwrap();
        assert!(matches!(
            &script.commands[0],
            Command::AssertReturn { expected: None, .. }
        ));
    }

    #[test]
    fn assert_return_rejects_multiple_constants() {
        let err = parse_script(r#"(assert_return (invoke "f") (i32.const 1) (i32.const 2))"#).unwrap_err();
        assert!(err.message.contains("multiple return values"));
    }

    #[test]
    fn nan_assertions() {
        let script = parse_script(
            r#"
(assert_return_canonical_nan (invoke "f" (f64.const 0)))
(assert_return_arithmetic_nan (invoke "g"))
"#,
        )
        .unwrap();
        assert!(matches!(&script.commands[0], Command::AssertReturnCanonicalNan { .. }));
        assert!(matches!(&script.commands[1], Command::AssertReturnArithmeticNan { .. }));
    }

    #[test]
    fn binary_module_concatenates_strings() {
        let script = parse_script(r#"(module binary "\00asm" "\01\00\00\00")"#).unwrap();
        let Command::Module {
            module: ScriptModule::Binary(bytes),
            ..
        } = &script.commands[0]
        else {
            panic!("expected binary module");
        };
        assert_eq!(bytes, b"\x00asm\x01\x00\x00\x00");
    }

    #[test]
    fn quote_module_concatenates_text() {
        let script = parse_script(r#"(module quote "(func" ")")"#).unwrap();
        let Command::Module {
            module: ScriptModule::Quote(text),
            ..
        } = &script.commands[0]
        else {
            panic!("expected quoted module");
        };
        assert_eq!(text, "(func)");
    }

    #[test]
    fn named_module_and_register() {
        let script = parse_script(
            r#"
(module $lib (func (export "f")))
(register "lib" $lib)
(register "alias")
"#,
        )
        .unwrap();
        let Command::Module { name, .. } = &script.commands[0] else {
            panic!("expected module");
        };
        assert_eq!(name.as_deref(), Some("lib"));

        let Command::Register {
            as_name, module_name, ..
        } = &script.commands[1]
        else {
            panic!("expected register");
        };
        assert_eq!(as_name, "lib");
        assert_eq!(module_name.as_deref(), Some("lib"));

        let Command::Register { module_name, .. } = &script.commands[2] else {
            panic!("expected register");
        };
        assert!(module_name.is_none());
    }

    #[test]
    fn assert_trap_on_action_and_module() {
        let script = parse_script(
            r#"
(assert_trap (invoke "div" (i32.const 1) (i32.const 0)) "integer divide by zero")
(assert_trap (module (func $f (unreachable)) (start $f)) "unreachable")
"#,
        )
        .unwrap();
        assert!(matches!(
            &script.commands[0],
            Command::AssertTrap { message: Some(m), .. } if m == "integer divide by zero"
        ));
        assert!(matches!(&script.commands[1], Command::AssertModuleTrap { .. }));
    }

    #[test]
    fn assert_malformed_invalid_unlinkable() {
        let script = parse_script(
            r#"
(assert_malformed (module quote "(func") "unclosed")
(assert_invalid (module (func (result i32))) "type mismatch")
(assert_unlinkable (module (import "missing" "f" (func))) "unknown import")
"#,
        )
        .unwrap();
        assert!(matches!(&script.commands[0], Command::AssertMalformed { .. }));
        assert!(matches!(&script.commands[1], Command::AssertInvalid { .. }));
        assert!(matches!(&script.commands[2], Command::AssertUnlinkable { .. }));
    }

    #[test]
    fn get_action() {
        let script = parse_script(r#"(assert_return (get $m "counter") (i32.const 4))"#).unwrap();
        let Command::AssertReturn { action, .. } = &script.commands[0] else {
            panic!("expected assert_return");
        };
        assert!(matches!(
            action,
            Action::Get { module: Some(m), name } if m == "m" && name == "counter"
        ));
    }

    #[test]
    fn top_level_invoke() {
        let script = parse_script(r#"(invoke "init" (i64.const -1))"#).unwrap();
        let Command::Action { action, .. } = &script.commands[0] else {
            panic!("expected action");
        };
        assert!(matches!(action, Action::Invoke { args, .. } if args.len() == 1));
    }

    #[test]
    fn skipped_and_reserved_directives() {
        let script = parse_script(
            r#"
(script (module))
(input "file.wat")
(output "file.wasm")
(assert_exhaustion (invoke "runaway") "call stack exhausted")
"#,
        )
        .unwrap();
        assert!(matches!(&script.commands[0], Command::Skipped { .. }));
        assert!(matches!(&script.commands[1], Command::Skipped { .. }));
        assert!(matches!(&script.commands[2], Command::Skipped { .. }));
        assert!(matches!(&script.commands[3], Command::AssertExhaustion { .. }));
    }

    #[test]
    fn float_constants_carry_exact_bits() {
        let script = parse_script(r#"(assert_return (invoke "f") (f32.const nan:0x200000))"#).unwrap();
        let Command::AssertReturn {
            expected: Some(Value::F32(v)),
            ..
        } = &script.commands[0]
        else {
            panic!("expected f32 constant");
        };
        assert_eq!(v.to_bits(), 0x7FA0_0000);
    }

    #[test]
    fn unknown_directive_fails() {
        let err = parse_script("(frobnicate)").unwrap_err();
        assert!(err.message.contains("unknown directive"));
    }

    #[test]
    fn command_lines_track_source() {
        let script = parse_script("(module)\n(invoke \"f\")").unwrap();
        assert_eq!(script.commands[0].line(), 1);
        assert_eq!(script.commands[1].line(), 2);
    }
}
