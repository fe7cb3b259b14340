//! End-to-end module-parser scenarios through the public API.

use watc::module::{BlockType, ExportDesc, Instr, ValueType};
use watc::wat;

#[test]
fn empty_module() {
    let module = wat::parse("(module)").unwrap();
    assert!(module.types.is_empty());
    assert!(module.imports.is_empty());
    assert!(module.functions.is_empty());
    assert!(module.tables.is_empty());
    assert!(module.memories.is_empty());
    assert!(module.globals.is_empty());
    assert!(module.exports.is_empty());
    assert!(module.elements.is_empty());
    assert!(module.data.is_empty());
    assert!(module.start.is_none());
}

#[test]
fn identity_function() {
    let module = wat::parse(
        r#"(module
             (func $id (param $x i32) (result i32) local.get $x)
             (export "id" (func $id)))"#,
    )
    .unwrap();

    assert_eq!(module.types.len(), 1);
    assert_eq!(module.types[0].params, vec![ValueType::I32]);
    assert_eq!(module.types[0].results, vec![ValueType::I32]);
    assert_eq!(module.functions, vec![0]);
    assert_eq!(module.code[0].body, vec![Instr::LocalGet { local: 0 }, Instr::End]);
    assert_eq!(module.exports.len(), 1);
    assert_eq!(module.exports[0].name, "id");
    assert_eq!(module.exports[0].desc, ExportDesc::Function(0));
}

#[test]
fn forward_reference() {
    let module = wat::parse("(module (func $a (call $b)) (func $b))").unwrap();
    assert_eq!(module.code[0].body, vec![Instr::Call { func: 1 }, Instr::End]);
}

#[test]
fn label_matching() {
    let module = wat::parse("(module (func (block $L (br $L) end)))").unwrap();
    assert_eq!(
        module.code[0].body,
        vec![
            Instr::Block {
                block_type: BlockType::Empty
            },
            Instr::Br { depth: 0 },
            Instr::End,
            Instr::End,
        ]
    );
}

#[test]
fn duplicate_name_is_malformed() {
    let err = wat::parse("(module (func $f) (func $f))").unwrap_err();
    assert!(err.message.contains("duplicate function"));
}

#[test]
fn every_accepted_body_balances_blocks_and_ends() {
    let sources = [
        "(module (func))",
        "(module (func (block) (loop) (if (i32.const 1) (then))))",
        "(module (func (block $a (block $b (br $a) (br $b)))))",
        r#"(module (func (param i32) (result i32)
             local.get 0
             if (result i32)
               i32.const 1
             else
               i32.const 2
             end))"#,
    ];
    for source in sources {
        let module = wat::parse(source).unwrap();
        for body in module.code.iter().map(|c| &c.body) {
            let mut depth = 1i64; // the function frame itself
            for instr in body {
                match instr {
                    Instr::Block { .. } | Instr::Loop { .. } | Instr::If { .. } => depth += 1,
                    Instr::End => depth -= 1,
                    _ => {}
                }
                assert!(depth >= 0, "depth went negative in {:?}", source);
            }
            assert_eq!(depth, 0, "unbalanced body for {:?}", source);
        }
    }
}

#[test]
fn call_immediates_are_in_range_after_resolution() {
    let module = wat::parse(
        r#"(module
             (import "env" "log" (func $log (param i32)))
             (global $g (mut i32) (i32.const 0))
             (func $a (call $b) (call $log (i32.const 1)) (global.set $g (i32.const 2)))
             (func $b (global.get $g) drop))"#,
    )
    .unwrap();

    let func_count = module.func_count();
    let global_count = module.global_count();
    for body in module.code.iter().map(|c| &c.body) {
        for instr in body {
            match instr {
                Instr::Call { func } => assert!(*func < func_count),
                Instr::GlobalGet { global } | Instr::GlobalSet { global } => {
                    assert!(*global < global_count)
                }
                _ => {}
            }
        }
    }
}

#[test]
fn imports_always_precede_same_kind_definitions() {
    let module = wat::parse(
        r#"(module
             (import "a" "f" (func))
             (import "a" "g" (global i32))
             (func)
             (global i32 (i32.const 0)))"#,
    )
    .unwrap();
    assert_eq!(module.import_counts.funcs, 1);
    assert_eq!(module.import_counts.globals, 1);

    let err = wat::parse(r#"(module (global i32 (i32.const 0)) (import "a" "g" (global i32)))"#).unwrap_err();
    assert!(err.message.contains("import after global definition"));
}

#[test]
fn module_display_summarises_sections() {
    let module = wat::parse(
        r#"(module $demo
             (memory (data "xyz"))
             (func (export "f")))"#,
    )
    .unwrap();
    let text = module.to_string();
    assert!(text.contains("module demo"));
    assert!(text.contains("memories: 1"));
    assert!(text.contains("\"f\""));
}

#[test]
fn larger_module_parses_whole() {
    let module = wat::parse(
        r#"
;; iterative fibonacci plus a scratch memory
(module $fib
  (memory 1)
  (global $calls (mut i32) (i32.const 0))
  (func (export "fib") (param $n i32) (result i32)
    (local $a i32) (local $b i32) (local $i i32) (local $t i32)
    (global.set $calls (i32.add (global.get $calls) (i32.const 1)))
    (if (i32.lt_s (local.get $n) (i32.const 2))
      (then (return (local.get $n))))
    (local.set $b (i32.const 1))
    (block $done
      (loop $loop
        (br_if $done (i32.ge_s (local.get $i) (i32.sub (local.get $n) (i32.const 1))))
        (local.set $t (i32.add (local.get $a) (local.get $b)))
        (local.set $a (local.get $b))
        (local.set $b (local.get $t))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $loop)))
    (local.get $b))
  (func $unused (param f64) (result f64)
    (f64.sqrt (local.get 0))))
"#,
    )
    .unwrap();

    assert_eq!(module.name.as_deref(), Some("fib"));
    assert_eq!(module.functions.len(), 2);
    assert_eq!(module.globals.len(), 1);
    assert_eq!(module.code[0].local_names.len(), 4);
    assert!(!module.code[0].body.contains(&Instr::F64Sqrt));
    assert!(module.code[1].body.contains(&Instr::F64Sqrt));
}
