//! WAT module parser: s-expression tree to [`Module`].
//!
//! The module body is walked three times:
//!
//! 1. **Types** — `(type ...)` definitions, so every later field can refer
//!    to a signature by name or index.
//! 2. **Definitions** — imports, functions, tables, memories, globals.
//!    Each registers its `$name` before its body is parsed. Function bodies
//!    may forward-reference functions and globals that pass 2 has not
//!    reached yet; those become entries in a deferred-reference queue.
//! 3. **Wiring** — exports, element and data segments, `start`. Afterwards
//!    the deferred queue is drained, rewriting each recorded instruction
//!    with the now-known index.
//!
//! Instructions come in two surface syntaxes producing one output stream:
//! the flat form (`block ... end`) and the folded form (`(i32.add (...)
//! (...))`), which emits its children post-order. [`ArgSource`] abstracts
//! over where an instruction's immediates live in the two forms.

use super::names::{LabelStack, NameTable, Namespace};
use super::sexpr::{self, ReadError, SExpr, SExprList};
use super::token::{FloatLit, Span, TokenKind};
use crate::module::{
    BlockType, DataSegment, ElemSegment, ElemType, Export, ExportDesc, FuncSig, FunctionBody, Global, GlobalType,
    Import, ImportKind, Instr, Limits, MemArg, Module, TableType, ValueType,
};
use log::trace;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

// Natural alignments, as log2 of the access width in bytes. Used when the
// source omits an explicit `align=N`.
const ALIGN_8: u32 = 0;
const ALIGN_16: u32 = 1;
const ALIGN_32: u32 = 2;
const ALIGN_64: u32 = 3;

// ============================================================================
// Error type
// ============================================================================

/// An error encountered during WAT parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }

    /// An "expected X, found Y" error.
    pub fn expected(expected: &str, found: &str, span: Span) -> Self {
        Self::new(format!("expected {}, found {}", expected, found), span)
    }

    /// An "undefined X: $name" error.
    pub fn undefined(kind: &str, name: &str, span: Span) -> Self {
        Self::new(format!("undefined {}: ${}", kind, name), span)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at line {}, column {}",
            self.message, self.span.line, self.span.column
        )
    }
}

impl std::error::Error for ParseError {}

impl From<ReadError> for ParseError {
    fn from(e: ReadError) -> Self {
        Self {
            message: e.message,
            span: e.span,
        }
    }
}

// ============================================================================
// Parse context
// ============================================================================

/// A forward reference recorded while parsing a function body.
///
/// `call`, `global.get`, and `global.set` with a symbolic name always go
/// through this queue: the instruction is emitted with a placeholder index
/// and rewritten once the whole module has been walked.
#[derive(Debug)]
struct DeferredRef {
    ns: Namespace,
    name: String,
    span: Span,
    /// Index of the function body the instruction sits in.
    body: usize,
    /// Instruction offset within that body.
    offset: usize,
}

/// Accumulated state: the module being built, one name table per index
/// space, the label stack of the function currently being parsed, and the
/// deferred-reference queue.
struct ParseContext {
    module: Module,
    type_names: NameTable,
    func_names: NameTable,
    table_names: NameTable,
    memory_names: NameTable,
    global_names: NameTable,
    local_names: NameTable,
    labels: LabelStack,
    deferred: Vec<DeferredRef>,

    // Per-function name bookkeeping for diagnostics.
    param_names: Vec<Option<String>>,
    body_local_names: Vec<Option<String>>,
    /// Body index the current function's instructions will land in.
    current_body: usize,

    // Definition flags for the import-order invariant.
    has_func_def: bool,
    has_table_def: bool,
    has_memory_def: bool,
    has_global_def: bool,
}

impl ParseContext {
    fn new() -> Self {
        Self {
            module: Module::new(),
            type_names: NameTable::new(),
            func_names: NameTable::new(),
            table_names: NameTable::new(),
            memory_names: NameTable::new(),
            global_names: NameTable::new(),
            local_names: NameTable::new(),
            labels: LabelStack::new(),
            deferred: Vec::new(),
            param_names: Vec::new(),
            body_local_names: Vec::new(),
            current_body: 0,
            has_func_def: false,
            has_table_def: false,
            has_memory_def: false,
            has_global_def: false,
        }
    }

    fn table_for(&mut self, ns: Namespace) -> &mut NameTable {
        match ns {
            Namespace::Type => &mut self.type_names,
            Namespace::Func => &mut self.func_names,
            Namespace::Table => &mut self.table_names,
            Namespace::Memory => &mut self.memory_names,
            Namespace::Global => &mut self.global_names,
            Namespace::Local => &mut self.local_names,
        }
    }

    /// Register the next definition in a namespace, failing on duplicates.
    fn register(&mut self, ns: Namespace, name: Option<&str>, span: Span) -> Result<u32, ParseError> {
        self.table_for(ns)
            .register(name)
            .ok_or_else(|| ParseError::new(format!("duplicate {}", ns.label()), span))
    }

    fn resolve(&self, ns: Namespace, name: &str, span: Span) -> Result<u32, ParseError> {
        let table = match ns {
            Namespace::Type => &self.type_names,
            Namespace::Func => &self.func_names,
            Namespace::Table => &self.table_names,
            Namespace::Memory => &self.memory_names,
            Namespace::Global => &self.global_names,
            Namespace::Local => &self.local_names,
        };
        table
            .lookup(name)
            .ok_or_else(|| ParseError::undefined(ns.label(), name, span))
    }

    /// Reset per-function state and note where the next body will land.
    fn begin_function(&mut self) {
        self.local_names.clear();
        self.labels.clear();
        self.param_names.clear();
        self.body_local_names.clear();
        self.current_body = self.module.code.len();
    }

    /// Record a forward reference for the instruction about to be emitted
    /// at `offset` in the current body.
    fn defer(&mut self, ns: Namespace, name: &str, span: Span, offset: usize) {
        self.deferred.push(DeferredRef {
            ns,
            name: name.to_string(),
            span,
            body: self.current_body,
            offset,
        });
    }

    /// Add an explicit type definition. Explicit definitions each get their
    /// own index; no structural deduplication.
    fn add_type(&mut self, name: Option<&str>, sig: FuncSig, span: Span) -> Result<u32, ParseError> {
        let idx = self.register(Namespace::Type, name, span)?;
        self.module.types.push(sig);
        Ok(idx)
    }

    /// Index of a structurally equal signature, adding one if none exists.
    /// Used for implicit type uses (inline params/results without `(type)`).
    fn find_or_add_type(&mut self, sig: FuncSig) -> u32 {
        if let Some(idx) = self.module.types.iter().position(|t| *t == sig) {
            return idx as u32;
        }
        // Anonymous: register() cannot fail without a name.
        let idx = self.type_names.register(None).unwrap();
        self.module.types.push(sig);
        idx
    }

    /// Drain the deferred-reference queue, rewriting each recorded
    /// instruction's index field.
    fn flush_deferred(&mut self) -> Result<(), ParseError> {
        for d in self.deferred.drain(..) {
            let table = match d.ns {
                Namespace::Func => &self.func_names,
                Namespace::Global => &self.global_names,
                _ => unreachable!("only calls and global accesses defer"),
            };
            let idx = table
                .lookup(&d.name)
                .ok_or_else(|| ParseError::undefined(d.ns.label(), &d.name, d.span))?;
            let instr = self
                .module
                .code
                .get_mut(d.body)
                .and_then(|b| b.body.get_mut(d.offset))
                .ok_or_else(|| ParseError::new("internal error: dangling deferred reference", d.span))?;
            match instr {
                Instr::Call { func } => *func = idx,
                Instr::GlobalGet { global } | Instr::GlobalSet { global } => *global = idx,
                other => {
                    return Err(ParseError::new(
                        format!("internal error: deferred reference to {}", other.mnemonic()),
                        d.span,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Enforce the import-before-definition invariant for one kind.
    fn check_import_order(&self, kind: &ImportKind, span: Span) -> Result<(), ParseError> {
        let (defined, label) = match kind {
            ImportKind::Function(_) => (self.has_func_def, "function"),
            ImportKind::Table(_) => (self.has_table_def, "table"),
            ImportKind::Memory(_) => (self.has_memory_def, "memory"),
            ImportKind::Global(_) => (self.has_global_def, "global"),
        };
        if defined {
            return Err(ParseError::new(format!("import after {} definition", label), span));
        }
        Ok(())
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Parse WAT source into a [`Module`].
///
/// # Example
///
/// ```
/// let module = watc::wat::parse("(module (func (result i32) (i32.const 42)))").unwrap();
/// assert_eq!(module.functions.len(), 1);
/// ```
#[must_use = "parsing result should be checked"]
pub fn parse(source: &str) -> Result<Module, ParseError> {
    let sexpr = sexpr::read(source)?;
    parse_module(&sexpr)
}

/// Parse a module from an already-read s-expression.
pub fn parse_module(sexpr: &SExpr) -> Result<Module, ParseError> {
    let list = sexpr.expect_list()?;
    list.expect_head("module")?;

    let mut ctx = ParseContext::new();
    let mut start = 1;
    if let Some(name) = list.get(1).and_then(|s| s.as_id()) {
        ctx.module.name = Some(name.to_string());
        start = 2;
    }
    trace!("parsing module {:?}", ctx.module.name);

    // Pass 1: types only.
    for field in list.iter_from(start) {
        let inner = field.expect_list()?;
        if inner.head_keyword() == Some("type") {
            parse_type_def(inner, &mut ctx)?;
        }
    }

    // Pass 2: definitions.
    for field in list.iter_from(start) {
        let inner = field.expect_list()?;
        match inner.head_keyword() {
            Some("import") => parse_import(inner, &mut ctx)?,
            Some("func") => parse_func(inner, &mut ctx)?,
            Some("table") => parse_table(inner, &mut ctx)?,
            Some("memory") => parse_memory(inner, &mut ctx)?,
            Some("global") => parse_global(inner, &mut ctx)?,
            Some("type") | Some("export") | Some("elem") | Some("data") | Some("start") => {}
            Some(kw) => return Err(ParseError::new(format!("unknown field: {}", kw), inner.span)),
            None => return Err(ParseError::new("expected field keyword", inner.span)),
        }
    }

    // Pass 3: wiring.
    for field in list.iter_from(start) {
        let inner = field.expect_list()?;
        match inner.head_keyword() {
            Some("export") => parse_export(inner, &mut ctx)?,
            Some("elem") => parse_elem(inner, &mut ctx)?,
            Some("data") => parse_data(inner, &mut ctx)?,
            Some("start") => parse_start(inner, &mut ctx)?,
            _ => {}
        }
    }

    ctx.flush_deferred()?;
    Ok(ctx.module)
}

// ============================================================================
// Types
// ============================================================================

/// `type ::= '(' 'type' id? '(' 'func' param* result* ')' ')'`
fn parse_type_def(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);

    let func_sexpr = list
        .get(idx)
        .ok_or_else(|| ParseError::new("expected function type", list.span))?;
    let func_list = func_sexpr.expect_list()?;
    func_list.expect_head("func")?;

    let sig = parse_func_sig(func_list)?;
    ctx.add_type(name, sig, list.span)?;
    Ok(())
}

/// `functype ::= '(' 'func' param* result* ')'`
///
/// Parameter names are permitted and ignored here; they only matter on
/// function definitions, where `parse_type_use` records them as locals.
fn parse_func_sig(list: SExprList<'_>) -> Result<FuncSig, ParseError> {
    let mut params = Vec::new();
    let mut results = Vec::new();
    let mut seen_result = false;

    for item in list.iter_from(1) {
        let inner = item.expect_list()?;
        match inner.head_keyword() {
            Some("param") => {
                if seen_result {
                    return Err(ParseError::new("param after result", inner.span));
                }
                for p in inner.iter_from(1) {
                    if p.as_id().is_some() {
                        continue;
                    }
                    params.push(parse_valtype(p)?);
                }
            }
            Some("result") => {
                seen_result = true;
                for r in inner.iter_from(1) {
                    results.push(parse_valtype(r)?);
                }
                if results.len() > 1 {
                    return Err(ParseError::new("multiple return values", inner.span));
                }
            }
            Some(kw) => {
                return Err(ParseError::new(
                    format!("expected 'param' or 'result', found '{}'", kw),
                    inner.span,
                ));
            }
            None => return Err(ParseError::new("expected keyword in type", inner.span)),
        }
    }

    Ok(FuncSig { params, results })
}

/// `valtype ::= 'i32' | 'i64' | 'f32' | 'f64'`
fn parse_valtype(sexpr: &SExpr) -> Result<ValueType, ParseError> {
    match sexpr.as_keyword() {
        Some("i32") => Ok(ValueType::I32),
        Some("i64") => Ok(ValueType::I64),
        Some("f32") => Ok(ValueType::F32),
        Some("f64") => Ok(ValueType::F64),
        Some(kw) => Err(ParseError::expected("value type", &format!("'{}'", kw), sexpr.span())),
        None => Err(ParseError::expected("value type", "list", sexpr.span())),
    }
}

/// `typeuse ::= '(' 'type' idx ')'? param* result*`
///
/// Resolves a `(type $t)` reference and/or inline `(param ...)` /
/// `(result ...)` clauses into a type index. When both appear, the inline
/// signature must be structurally equal to the referenced one. When
/// `register_locals` is set (function definitions), parameters are
/// registered in the local namespace, named or not, so later local indices
/// line up.
///
/// Returns the type index and the list position after the last clause.
fn parse_type_use(
    list: SExprList<'_>,
    start: usize,
    register_locals: bool,
    ctx: &mut ParseContext,
) -> Result<(u32, usize), ParseError> {
    let mut params = Vec::new();
    let mut results = Vec::new();
    let mut explicit = None;
    let mut idx = start;
    let mut seen_inline = false;
    let mut seen_result = false;

    while let Some(item) = list.get(idx) {
        let Some(inner) = item.as_list() else { break };
        match inner.head_keyword() {
            Some("type") => {
                if seen_inline {
                    return Err(ParseError::new("unexpected token", inner.span));
                }
                explicit = Some(parse_index(inner.get(1), Namespace::Type, ctx)?);
                idx += 1;
            }
            Some("param") => {
                if seen_result {
                    return Err(ParseError::new("param after result", inner.span));
                }
                seen_inline = true;
                let name = inner.get(1).and_then(|s| s.as_id());
                if let Some(name) = name {
                    // Named form: exactly one valtype.
                    let ty_item = inner
                        .get(2)
                        .ok_or_else(|| ParseError::new("expected valtype after param name", inner.span))?;
                    let ty = parse_valtype(ty_item)?;
                    if inner.get(3).is_some() {
                        return Err(ParseError::new("named param must have exactly one type", inner.span));
                    }
                    if register_locals {
                        ctx.register(Namespace::Local, Some(name), inner.span)?;
                        ctx.param_names.push(Some(name.to_string()));
                    }
                    params.push(ty);
                } else {
                    for p in inner.iter_from(1) {
                        let ty = parse_valtype(p)?;
                        if register_locals {
                            ctx.register(Namespace::Local, None, inner.span)?;
                            ctx.param_names.push(None);
                        }
                        params.push(ty);
                    }
                }
                idx += 1;
            }
            Some("result") => {
                seen_inline = true;
                seen_result = true;
                for r in inner.iter_from(1) {
                    results.push(parse_valtype(r)?);
                }
                if results.len() > 1 {
                    return Err(ParseError::new("multiple return values", inner.span));
                }
                idx += 1;
            }
            _ => break,
        }
    }

    let type_idx = match explicit {
        Some(t) => {
            let sig = ctx
                .module
                .types
                .get(t as usize)
                .ok_or_else(|| ParseError::new("undefined type", list.span))?;
            if seen_inline {
                if sig.params != params || sig.results != results {
                    return Err(ParseError::new("type mismatch", list.span));
                }
            } else if register_locals {
                // The referenced type supplies the parameter arity; register
                // anonymous locals so body-local indices start in the right
                // place.
                for _ in 0..sig.params.len() {
                    ctx.register(Namespace::Local, None, list.span)?;
                    ctx.param_names.push(None);
                }
            }
            t
        }
        None => ctx.find_or_add_type(FuncSig { params, results }),
    };

    Ok((type_idx, idx))
}

// ============================================================================
// Pass 2 fields
// ============================================================================

/// `import ::= '(' 'import' name name importdesc ')'`
fn parse_import(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let module_name = parse_name_string(
        list.get(1)
            .ok_or_else(|| ParseError::new("expected module name string", list.span))?,
    )?;
    let field_name = parse_name_string(
        list.get(2)
            .ok_or_else(|| ParseError::new("expected field name string", list.span))?,
    )?;

    let desc = list
        .get(3)
        .ok_or_else(|| ParseError::new("expected import descriptor", list.span))?
        .expect_list()?;

    let kind = match desc.head_keyword() {
        Some("func") => {
            let mut idx = 1;
            let name = take_optional_name(desc, &mut idx);
            ctx.register(Namespace::Func, name, desc.span)?;
            let (type_idx, _) = parse_type_use(desc, idx, false, ctx)?;
            ImportKind::Function(type_idx)
        }
        Some("table") => {
            let mut idx = 1;
            let name = take_optional_name(desc, &mut idx);
            ctx.register(Namespace::Table, name, desc.span)?;
            let (limits, consumed) = parse_limits(desc, idx)?;
            parse_elemtype(desc.get(idx + consumed))?;
            ImportKind::Table(TableType {
                elem: ElemType::AnyFunc,
                limits,
            })
        }
        Some("memory") => {
            let mut idx = 1;
            let name = take_optional_name(desc, &mut idx);
            ctx.register(Namespace::Memory, name, desc.span)?;
            let (limits, _) = parse_limits(desc, idx)?;
            ImportKind::Memory(limits)
        }
        Some("global") => {
            let mut idx = 1;
            let name = take_optional_name(desc, &mut idx);
            ctx.register(Namespace::Global, name, desc.span)?;
            ImportKind::Global(parse_global_type(desc, idx)?)
        }
        Some(kw) => return Err(ParseError::new(format!("unknown import kind: {}", kw), desc.span)),
        None => return Err(ParseError::new("expected import kind", desc.span)),
    };

    ctx.check_import_order(&kind, list.span)?;
    ctx.module.push_import(Import {
        module: module_name,
        field: field_name,
        kind,
    });
    Ok(())
}

/// `func ::= '(' 'func' id? export* typeuse local* instr* ')'`
///        `| '(' 'func' id? export* '(' 'import' name name ')' typeuse ')'`
fn parse_func(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    ctx.begin_function();

    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);
    let func_index = ctx.register(Namespace::Func, name, list.span)?;

    idx = collect_inline_exports(list, idx, ExportDesc::Function(func_index), ctx)?;

    if let Some((module_name, field_name)) = parse_inline_import(list, idx)? {
        idx += 1;
        let (type_idx, _) = parse_type_use(list, idx, false, ctx)?;
        let kind = ImportKind::Function(type_idx);
        ctx.check_import_order(&kind, list.span)?;
        ctx.module.push_import(Import {
            module: module_name,
            field: field_name,
            kind,
        });
        return Ok(());
    }

    ctx.has_func_def = true;

    let (type_idx, body_start) = parse_type_use(list, idx, true, ctx)?;

    // Locals, then the body. Local declarations may not follow instructions.
    let mut locals = Vec::new();
    let mut body = Vec::new();
    let mut body_idx = body_start;
    let mut seen_instr = false;

    while let Some(item) = list.get(body_idx) {
        if item.is_list_headed_by("local") {
            if seen_instr {
                return Err(ParseError::new("local after instruction", item.span()));
            }
            parse_local(item.as_list().unwrap(), &mut locals, ctx)?;
            body_idx += 1;
        } else {
            seen_instr = true;
            body_idx = parse_body_item(list, body_idx, &mut body, ctx)?;
        }
    }
    body.push(Instr::End);

    ctx.module.functions.push(type_idx);
    ctx.module.code.push(FunctionBody {
        locals,
        body,
        param_names: std::mem::take(&mut ctx.param_names),
        local_names: std::mem::take(&mut ctx.body_local_names),
        name: name.map(String::from),
    });
    Ok(())
}

/// `local ::= '(' 'local' id valtype ')' | '(' 'local' valtype* ')'`
fn parse_local(list: SExprList<'_>, locals: &mut Vec<ValueType>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);
    if let Some(name) = name {
        let item = list
            .get(idx)
            .ok_or_else(|| ParseError::new("expected valtype after local name", list.span))?;
        let ty = parse_valtype(item)?;
        if list.get(idx + 1).is_some() {
            return Err(ParseError::new("named local must have exactly one type", list.span));
        }
        ctx.register(Namespace::Local, Some(name), list.span)?;
        ctx.body_local_names.push(Some(name.to_string()));
        locals.push(ty);
    } else {
        for item in list.iter_from(idx) {
            let ty = parse_valtype(item)?;
            ctx.register(Namespace::Local, None, list.span)?;
            ctx.body_local_names.push(None);
            locals.push(ty);
        }
    }
    Ok(())
}

/// `table ::= '(' 'table' id? export* limits elemtype ')'`
///         `| '(' 'table' id? export* elemtype '(' 'elem' funcidx* ')' ')'`
///         `| '(' 'table' id? export* '(' 'import' name name ')' limits elemtype ')'`
fn parse_table(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);
    let table_index = ctx.register(Namespace::Table, name, list.span)?;
    idx = collect_inline_exports(list, idx, ExportDesc::Table(table_index), ctx)?;

    if let Some((module_name, field_name)) = parse_inline_import(list, idx)? {
        idx += 1;
        let (limits, consumed) = parse_limits(list, idx)?;
        parse_elemtype(list.get(idx + consumed))?;
        let kind = ImportKind::Table(TableType {
            elem: ElemType::AnyFunc,
            limits,
        });
        ctx.check_import_order(&kind, list.span)?;
        ctx.module.push_import(Import {
            module: module_name,
            field: field_name,
            kind,
        });
        return Ok(());
    }

    ctx.has_table_def = true;

    // Inline element form: the table's size is the element count.
    if is_elemtype(list.get(idx)) && list.get(idx + 1).map(|s| s.is_list_headed_by("elem")).unwrap_or(false) {
        let elem_list = list.get(idx + 1).unwrap().as_list().unwrap();
        let mut funcs = Vec::new();
        for item in elem_list.iter_from(1) {
            funcs.push(parse_index(Some(item), Namespace::Func, ctx)?);
        }
        let n = funcs.len() as u32;
        ctx.module.tables.push(TableType {
            elem: ElemType::AnyFunc,
            limits: Limits { min: n, max: Some(n) },
        });
        ctx.module.elements.push(ElemSegment {
            table: table_index,
            offset: vec![Instr::I32Const { value: 0 }, Instr::End],
            funcs,
        });
        return Ok(());
    }

    let (limits, consumed) = parse_limits(list, idx)?;
    parse_elemtype(list.get(idx + consumed))?;
    ctx.module.tables.push(TableType {
        elem: ElemType::AnyFunc,
        limits,
    });
    Ok(())
}

/// `memory ::= '(' 'memory' id? export* limits ')'`
///          `| '(' 'memory' id? export* '(' 'data' string* ')' ')'`
///          `| '(' 'memory' id? export* '(' 'import' name name ')' limits ')'`
fn parse_memory(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);
    let memory_index = ctx.register(Namespace::Memory, name, list.span)?;
    idx = collect_inline_exports(list, idx, ExportDesc::Memory(memory_index), ctx)?;

    if let Some((module_name, field_name)) = parse_inline_import(list, idx)? {
        idx += 1;
        let (limits, _) = parse_limits(list, idx)?;
        let kind = ImportKind::Memory(limits);
        ctx.check_import_order(&kind, list.span)?;
        ctx.module.push_import(Import {
            module: module_name,
            field: field_name,
            kind,
        });
        return Ok(());
    }

    ctx.has_memory_def = true;

    // Inline data form: minimum is the concatenated byte length, no maximum.
    if let Some(item) = list.get(idx)
        && item.is_list_headed_by("data")
    {
        let data_list = item.as_list().unwrap();
        let mut bytes = Vec::new();
        for s in data_list.iter_from(1) {
            bytes.extend_from_slice(&parse_byte_string(s)?);
        }
        ctx.module.memories.push(Limits {
            min: bytes.len() as u32,
            max: None,
        });
        ctx.module.data.push(DataSegment {
            memory: memory_index,
            offset: vec![Instr::I32Const { value: 0 }, Instr::End],
            bytes,
        });
        return Ok(());
    }

    let (limits, _) = parse_limits(list, idx)?;
    ctx.module.memories.push(limits);
    Ok(())
}

/// `global ::= '(' 'global' id? export* globaltype expr ')'`
///          `| '(' 'global' id? export* '(' 'import' name name ')' globaltype ')'`
fn parse_global(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);
    let global_index = ctx.register(Namespace::Global, name, list.span)?;
    idx = collect_inline_exports(list, idx, ExportDesc::Global(global_index), ctx)?;

    if let Some((module_name, field_name)) = parse_inline_import(list, idx)? {
        idx += 1;
        let kind = ImportKind::Global(parse_global_type(list, idx)?);
        ctx.check_import_order(&kind, list.span)?;
        ctx.module.push_import(Import {
            module: module_name,
            field: field_name,
            kind,
        });
        return Ok(());
    }

    ctx.has_global_def = true;

    let ty = parse_global_type(list, idx)?;
    idx += 1;

    let init_sexpr = list
        .get(idx)
        .ok_or_else(|| ParseError::new("expected init expression", list.span))?;
    if list.get(idx + 1).is_some() {
        return Err(ParseError::new("unexpected token", list.get(idx + 1).unwrap().span()));
    }
    let init = parse_const_expr(init_sexpr, ctx)?;

    ctx.module.globals.push(Global { ty, init });
    Ok(())
}

/// `globaltype ::= valtype | '(' 'mut' valtype ')'`
fn parse_global_type(list: SExprList<'_>, idx: usize) -> Result<GlobalType, ParseError> {
    let item = list
        .get(idx)
        .ok_or_else(|| ParseError::new("expected global type", list.span))?;

    if let Some(inner) = item.as_list() {
        inner.expect_head("mut")?;
        let value_type = parse_valtype(
            inner
                .get(1)
                .ok_or_else(|| ParseError::new("expected value type in mut", inner.span))?,
        )?;
        Ok(GlobalType {
            value_type,
            mutable: true,
        })
    } else {
        Ok(GlobalType {
            value_type: parse_valtype(item)?,
            mutable: false,
        })
    }
}

// ============================================================================
// Pass 3 fields
// ============================================================================

/// Consume inline `(export "name")` forms on a definition, registering each
/// as an export of the definition's index.
fn collect_inline_exports(
    list: SExprList<'_>,
    mut idx: usize,
    desc: ExportDesc,
    ctx: &mut ParseContext,
) -> Result<usize, ParseError> {
    while let Some(item) = list.get(idx) {
        if !item.is_list_headed_by("export") {
            break;
        }
        let export_list = item.as_list().unwrap();
        let name = parse_name_string(
            export_list
                .get(1)
                .ok_or_else(|| ParseError::new("expected export name", export_list.span))?,
        )?;
        ctx.module.exports.push(Export { name, desc });
        idx += 1;
    }
    Ok(idx)
}

/// `export ::= '(' 'export' name '(' exportdesc ')' ')'`
fn parse_export(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let name = parse_name_string(
        list.get(1)
            .ok_or_else(|| ParseError::new("expected export name", list.span))?,
    )?;

    let desc = list
        .get(2)
        .ok_or_else(|| ParseError::new("expected export descriptor", list.span))?
        .expect_list()?;

    let desc = match desc.head_keyword() {
        Some("func") => ExportDesc::Function(parse_index(desc.get(1), Namespace::Func, ctx)?),
        Some("table") => ExportDesc::Table(parse_index(desc.get(1), Namespace::Table, ctx)?),
        Some("memory") => ExportDesc::Memory(parse_index(desc.get(1), Namespace::Memory, ctx)?),
        Some("global") => ExportDesc::Global(parse_index(desc.get(1), Namespace::Global, ctx)?),
        Some(kw) => return Err(ParseError::new(format!("unknown export kind: {}", kw), desc.span)),
        None => return Err(ParseError::new("expected export kind", desc.span)),
    };

    ctx.module.exports.push(Export { name, desc });
    Ok(())
}

/// `start ::= '(' 'start' funcidx ')'`
fn parse_start(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    if ctx.module.start.is_some() {
        return Err(ParseError::new("multiple start sections", list.span));
    }
    ctx.module.start = Some(parse_index(list.get(1), Namespace::Func, ctx)?);
    Ok(())
}

/// `elem ::= '(' 'elem' tableidx? offset funcidx* ')'`
///
/// The table index defaults to 0; the offset may be wrapped in
/// `(offset ...)` or stand bare as a single constant expression.
fn parse_elem(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;

    let mut table = 0;
    if let Some(item) = list.get(idx)
        && (item.as_id().is_some() || is_integer_atom(item))
    {
        table = parse_index(Some(item), Namespace::Table, ctx)?;
        idx += 1;
    }

    let offset = parse_offset(list, &mut idx, ctx)?;

    let mut funcs = Vec::new();
    while let Some(item) = list.get(idx) {
        funcs.push(parse_index(Some(item), Namespace::Func, ctx)?);
        idx += 1;
    }

    ctx.module.elements.push(ElemSegment { table, offset, funcs });
    Ok(())
}

/// `data ::= '(' 'data' memidx? offset string* ')'`
fn parse_data(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;

    let mut memory = 0;
    if let Some(item) = list.get(idx)
        && (item.as_id().is_some() || is_integer_atom(item))
    {
        memory = parse_index(Some(item), Namespace::Memory, ctx)?;
        idx += 1;
    }

    let offset = parse_offset(list, &mut idx, ctx)?;

    let mut bytes = Vec::new();
    while let Some(item) = list.get(idx) {
        bytes.extend_from_slice(&parse_byte_string(item)?);
        idx += 1;
    }

    ctx.module.data.push(DataSegment { memory, offset, bytes });
    Ok(())
}

/// An `(offset expr)` wrapper or a bare constant expression.
fn parse_offset(list: SExprList<'_>, idx: &mut usize, ctx: &mut ParseContext) -> Result<Vec<Instr>, ParseError> {
    let item = list
        .get(*idx)
        .ok_or_else(|| ParseError::new("expected offset expression", list.span))?;

    if item.is_list_headed_by("offset") {
        let inner = item.as_list().unwrap();
        let expr = inner
            .get(1)
            .ok_or_else(|| ParseError::new("expected expression in offset", inner.span))?;
        if inner.get(2).is_some() {
            return Err(ParseError::new("unexpected token", inner.get(2).unwrap().span()));
        }
        *idx += 1;
        parse_const_expr(expr, ctx)
    } else if item.as_list().is_some() {
        *idx += 1;
        parse_const_expr(item, ctx)
    } else {
        Err(ParseError::new("expected offset expression", item.span()))
    }
}

// ============================================================================
// Constant expressions
// ============================================================================

/// A constant initialiser: exactly one of `i32.const`, `i64.const`,
/// `f32.const`, `f64.const`, or `global.get` of an imported global.
/// The result carries a trailing `End`, matching the binary format.
fn parse_const_expr(sexpr: &SExpr, ctx: &ParseContext) -> Result<Vec<Instr>, ParseError> {
    let list = sexpr.expect_list()?;
    let kw = list
        .head_keyword()
        .ok_or_else(|| ParseError::new("expected constant expression", sexpr.span()))?;

    let instr = match kw {
        "i32.const" => Instr::I32Const {
            value: parse_i32(list.get(1))?,
        },
        "i64.const" => Instr::I64Const {
            value: parse_i64(list.get(1))?,
        },
        "f32.const" => Instr::F32Const {
            value: parse_f32(list.get(1))?,
        },
        "f64.const" => Instr::F64Const {
            value: parse_f64(list.get(1))?,
        },
        "global.get" => {
            // Only already-imported globals may appear; forward references
            // into the defined globals are rejected.
            let global = parse_index(list.get(1), Namespace::Global, ctx)?;
            if global >= ctx.module.import_counts.globals {
                return Err(ParseError::new(
                    "constant expression must reference an imported global",
                    list.span,
                ));
            }
            Instr::GlobalGet { global }
        }
        other => {
            return Err(ParseError::new(
                format!("expected constant expression, found '{}'", other),
                list.span,
            ));
        }
    };

    if list.get(2).is_some() {
        return Err(ParseError::new("unexpected token", list.get(2).unwrap().span()));
    }

    Ok(vec![instr, Instr::End])
}

// ============================================================================
// Instructions
// ============================================================================

/// Where an instruction's immediate arguments live.
///
/// Folded form: `(i32.load offset=4 (local.get 0))` — arguments are the
/// instruction's own children. Flat form: `i32.load offset=4` — arguments
/// are the following siblings in the enclosing list.
enum ArgSource<'a> {
    Folded(&'a [SExpr]),
    Flat { list: SExprList<'a>, start: usize },
}

impl<'a> ArgSource<'a> {
    fn get(&self, idx: usize) -> Option<&'a SExpr> {
        match self {
            ArgSource::Folded(args) => args.get(idx),
            ArgSource::Flat { list, start } => list.get(*start + idx),
        }
    }
}

/// One item of a function body at the top level of its list. Dispatches on
/// flat control keywords, flat plain instructions, and folded forms.
/// Returns the list position after everything consumed.
fn parse_body_item(
    list: SExprList<'_>,
    idx: usize,
    out: &mut Vec<Instr>,
    ctx: &mut ParseContext,
) -> Result<usize, ParseError> {
    let item = list
        .get(idx)
        .ok_or_else(|| ParseError::new("expected instruction", list.span))?;

    match item {
        SExpr::Atom(token) => {
            if let TokenKind::Keyword(kw) = &token.kind {
                match kw.as_str() {
                    "block" | "loop" => parse_flat_block(kw, list, idx + 1, out, ctx),
                    "if" => parse_flat_if(list, idx + 1, out, ctx),
                    "else" | "end" => Err(ParseError::new(format!("unexpected '{}'", kw), token.span)),
                    _ => {
                        let args = ArgSource::Flat { list, start: idx + 1 };
                        let consumed = emit_op(kw, args, token.span, out, ctx)?;
                        Ok(idx + 1 + consumed)
                    }
                }
            } else {
                Err(ParseError::expected(
                    "instruction",
                    &format!("{}", token.kind),
                    token.span,
                ))
            }
        }
        SExpr::List { .. } => {
            parse_folded(item, out, ctx)?;
            Ok(idx + 1)
        }
    }
}

/// Flat `block`/`loop`: label? blocktype? instr* `end` label?
fn parse_flat_block(
    kw: &str,
    list: SExprList<'_>,
    start: usize,
    out: &mut Vec<Instr>,
    ctx: &mut ParseContext,
) -> Result<usize, ParseError> {
    let mut idx = start;

    let label = list.get(idx).and_then(|s| s.as_id()).map(String::from);
    if label.is_some() {
        idx += 1;
    }
    let (block_type, consumed) = parse_block_type(list, idx, ctx)?;
    idx += consumed;

    ctx.labels.push(label.clone());
    out.push(if kw == "block" {
        Instr::Block { block_type }
    } else {
        Instr::Loop { block_type }
    });

    let mut closed = false;
    while let Some(item) = list.get(idx) {
        if item.as_keyword() == Some("end") {
            idx += 1;
            check_end_label(list, &mut idx, &label)?;
            closed = true;
            break;
        }
        idx = parse_body_item(list, idx, out, ctx)?;
    }
    if !closed {
        return Err(ParseError::new("expected 'end'", list.span));
    }

    ctx.labels.pop();
    out.push(Instr::End);
    Ok(idx)
}

/// Flat `if`: label? blocktype? instr* (`else` label? instr*)? `end` label?
fn parse_flat_if(
    list: SExprList<'_>,
    start: usize,
    out: &mut Vec<Instr>,
    ctx: &mut ParseContext,
) -> Result<usize, ParseError> {
    let mut idx = start;

    let label = list.get(idx).and_then(|s| s.as_id()).map(String::from);
    if label.is_some() {
        idx += 1;
    }
    let (block_type, consumed) = parse_block_type(list, idx, ctx)?;
    idx += consumed;

    ctx.labels.push(label.clone());
    out.push(Instr::If { block_type });

    let mut closed = false;
    while let Some(item) = list.get(idx) {
        if let Some(kw) = item.as_keyword() {
            if kw == "else" {
                out.push(Instr::Else);
                idx += 1;
                check_end_label(list, &mut idx, &label)?;
                while let Some(item2) = list.get(idx) {
                    if item2.as_keyword() == Some("end") {
                        idx += 1;
                        check_end_label(list, &mut idx, &label)?;
                        closed = true;
                        break;
                    }
                    idx = parse_body_item(list, idx, out, ctx)?;
                }
                break;
            }
            if kw == "end" {
                idx += 1;
                check_end_label(list, &mut idx, &label)?;
                closed = true;
                break;
            }
        }
        idx = parse_body_item(list, idx, out, ctx)?;
    }
    if !closed {
        return Err(ParseError::new("expected 'end'", list.span));
    }

    ctx.labels.pop();
    out.push(Instr::End);
    Ok(idx)
}

/// A trailing label on `end` or `else` must repeat the block's own label.
fn check_end_label(list: SExprList<'_>, idx: &mut usize, expected: &Option<String>) -> Result<(), ParseError> {
    if let Some(end_label) = list.get(*idx).and_then(|s| s.as_id()) {
        if expected.as_deref() != Some(end_label) {
            return Err(ParseError::new(
                format!("mismatching label: ${}", end_label),
                list.get(*idx).unwrap().span(),
            ));
        }
        *idx += 1;
    }
    Ok(())
}

/// A folded instruction: `(op immediates... (operand)...)`.
///
/// Operand subexpressions are emitted first (post-order), then the
/// instruction itself. `block`, `loop`, and `if` get structural handling.
fn parse_folded(sexpr: &SExpr, out: &mut Vec<Instr>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let SExpr::List { items, span } = sexpr else {
        return Err(ParseError::new("expected folded instruction", sexpr.span()));
    };
    if items.is_empty() {
        return Err(ParseError::new("expected instruction keyword", *span));
    }

    let head = &items[0];
    let kw = head
        .as_keyword()
        .ok_or_else(|| ParseError::expected("instruction keyword", "list", head.span()))?;

    match kw {
        "block" | "loop" => parse_folded_block(kw, &items[1..], out, ctx),
        "if" => parse_folded_if(&items[1..], out, ctx),
        _ => {
            // Nested operands first.
            for arg in &items[1..] {
                if arg.as_list().is_some() && !is_immediate_list(arg) {
                    parse_folded(arg, out, ctx)?;
                }
            }
            let consumed = emit_op(kw, ArgSource::Folded(&items[1..]), *span, out, ctx)?;
            let _ = consumed; // folded operands are children; nothing else to skip
            Ok(())
        }
    }
}

/// Folded `(block label? blocktype? instr*)` / `(loop ...)`.
fn parse_folded_block(
    kw: &str,
    args: &[SExpr],
    out: &mut Vec<Instr>,
    ctx: &mut ParseContext,
) -> Result<(), ParseError> {
    let mut idx = 0;

    let label = args.get(idx).and_then(|s| s.as_id()).map(String::from);
    if label.is_some() {
        idx += 1;
    }
    let (block_type, consumed) = parse_block_type_slice(&args[idx..], ctx)?;
    idx += consumed;

    ctx.labels.push(label);
    out.push(if kw == "block" {
        Instr::Block { block_type }
    } else {
        Instr::Loop { block_type }
    });

    parse_body_slice(&args[idx..], out, ctx)?;

    ctx.labels.pop();
    out.push(Instr::End);
    Ok(())
}

/// Folded `(if label? blocktype? cond* (then instr*) (else instr*)?)`.
///
/// The condition subexpressions are emitted before the `if` opcode.
fn parse_folded_if(args: &[SExpr], out: &mut Vec<Instr>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 0;

    let label = args.get(idx).and_then(|s| s.as_id()).map(String::from);
    if label.is_some() {
        idx += 1;
    }
    let (block_type, consumed) = parse_block_type_slice(&args[idx..], ctx)?;
    idx += consumed;

    // Condition: folded subexpressions up to the (then ...) clause.
    while let Some(item) = args.get(idx) {
        if item.is_list_headed_by("then") {
            break;
        }
        match item {
            SExpr::List { .. } => {
                parse_folded(item, out, ctx)?;
                idx += 1;
            }
            SExpr::Atom(token) => {
                return Err(ParseError::new("unexpected token in if condition", token.span));
            }
        }
    }

    ctx.labels.push(label);
    out.push(Instr::If { block_type });

    let then_item = args
        .get(idx)
        .filter(|s| s.is_list_headed_by("then"))
        .ok_or_else(|| {
            let span = args.get(idx).map(|s| s.span()).unwrap_or(Span::ZERO);
            ParseError::new("expected 'then'", span)
        })?;
    let then_list = then_item.as_list().unwrap();
    parse_body_slice_list(then_list, 1, out, ctx)?;
    idx += 1;

    if let Some(else_item) = args.get(idx) {
        let else_list = else_item
            .as_list()
            .filter(|l| l.head_keyword() == Some("else"))
            .ok_or_else(|| ParseError::new("expected 'else'", else_item.span()))?;
        out.push(Instr::Else);
        parse_body_slice_list(else_list, 1, out, ctx)?;
        idx += 1;
    }
    if let Some(extra) = args.get(idx) {
        return Err(ParseError::new("unexpected token after else", extra.span()));
    }

    ctx.labels.pop();
    out.push(Instr::End);
    Ok(())
}

/// A sequence of instructions from a slice: folded forms, flat control
/// keywords, and flat plain instructions whose arguments follow as
/// siblings.
fn parse_body_slice(args: &[SExpr], out: &mut Vec<Instr>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut i = 0;
    while i < args.len() {
        match &args[i] {
            SExpr::List { .. } => {
                parse_folded(&args[i], out, ctx)?;
                i += 1;
            }
            SExpr::Atom(token) => {
                if let TokenKind::Keyword(kw) = &token.kind {
                    match kw.as_str() {
                        // A flat block inside a folded body runs to the end
                        // of the enclosing slice.
                        "block" | "loop" => {
                            parse_nested_flat_block(kw, &args[i + 1..], out, ctx)?;
                            return Ok(());
                        }
                        "if" => {
                            parse_nested_flat_if(&args[i + 1..], out, ctx)?;
                            return Ok(());
                        }
                        _ => {
                            let consumed = emit_op(kw, ArgSource::Folded(&args[i + 1..]), token.span, out, ctx)?;
                            i += 1 + consumed;
                        }
                    }
                } else {
                    return Err(ParseError::expected(
                        "instruction",
                        &format!("{}", token.kind),
                        token.span,
                    ));
                }
            }
        }
    }
    Ok(())
}

/// `parse_body_slice` over a list's items starting at `start`.
fn parse_body_slice_list(
    list: SExprList<'_>,
    start: usize,
    out: &mut Vec<Instr>,
    ctx: &mut ParseContext,
) -> Result<(), ParseError> {
    let items: Vec<SExpr> = list.iter_from(start).cloned().collect();
    parse_body_slice(&items, out, ctx)
}

/// Flat block opened inside a folded body slice; consumes to its `end`.
fn parse_nested_flat_block(
    kw: &str,
    args: &[SExpr],
    out: &mut Vec<Instr>,
    ctx: &mut ParseContext,
) -> Result<(), ParseError> {
    let list = SExprList {
        span: args.first().map(|s| s.span()).unwrap_or(Span::ZERO),
        items: args,
    };
    let after = parse_flat_block(kw, list, 0, out, ctx)?;
    let rest: Vec<SExpr> = args[after..].to_vec();
    parse_body_slice(&rest, out, ctx)
}

/// Flat `if` opened inside a folded body slice; consumes to its `end`.
fn parse_nested_flat_if(args: &[SExpr], out: &mut Vec<Instr>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let list = SExprList {
        span: args.first().map(|s| s.span()).unwrap_or(Span::ZERO),
        items: args,
    };
    let after = parse_flat_if(list, 0, out, ctx)?;
    let rest: Vec<SExpr> = args[after..].to_vec();
    parse_body_slice(&rest, out, ctx)
}

/// Block result annotation at `list[idx]`: `(result t)` or nothing.
fn parse_block_type(list: SExprList<'_>, idx: usize, ctx: &mut ParseContext) -> Result<(BlockType, usize), ParseError> {
    match list.get(idx) {
        Some(item) => {
            let (bt, consumed) = parse_block_type_slice(std::slice::from_ref(item), ctx)?;
            Ok((bt, consumed))
        }
        None => Ok((BlockType::Empty, 0)),
    }
}

fn parse_block_type_slice(args: &[SExpr], _ctx: &mut ParseContext) -> Result<(BlockType, usize), ParseError> {
    let Some(first) = args.first() else {
        return Ok((BlockType::Empty, 0));
    };
    if !first.is_list_headed_by("result") {
        return Ok((BlockType::Empty, 0));
    }
    let inner = first.as_list().unwrap();
    let mut types = Vec::new();
    for r in inner.iter_from(1) {
        types.push(parse_valtype(r)?);
    }
    match types.len() {
        0 => Ok((BlockType::Empty, 1)),
        1 => Ok((BlockType::Value(types[0]), 1)),
        _ => Err(ParseError::new("multiple return values", inner.span)),
    }
}

/// Emit one instruction (other than block/loop/if), consuming its
/// immediates from `args`. `call`, `global.get`, and `global.set` with a
/// symbolic target emit a placeholder and queue a deferred reference.
/// Returns the number of argument positions consumed.
fn emit_op(
    kw: &str,
    args: ArgSource<'_>,
    span: Span,
    out: &mut Vec<Instr>,
    ctx: &mut ParseContext,
) -> Result<usize, ParseError> {
    match kw {
        // Branches
        "br" => {
            let depth = parse_label_depth(args.get(0), ctx)?;
            out.push(Instr::Br { depth });
            Ok(1)
        }
        "br_if" => {
            let depth = parse_label_depth(args.get(0), ctx)?;
            out.push(Instr::BrIf { depth });
            Ok(1)
        }
        "br_table" => {
            // A run of targets; the last listed one is the default.
            let mut targets = Vec::new();
            let mut consumed = 0;
            while let Some(s) = args.get(consumed) {
                if s.as_id().is_none() && !is_integer_atom(s) {
                    break;
                }
                targets.push(parse_label_depth(Some(s), ctx)?);
                consumed += 1;
            }
            let default = targets
                .pop()
                .ok_or_else(|| ParseError::new("br_table requires at least one label", span))?;
            out.push(Instr::BrTable { targets, default });
            Ok(consumed)
        }

        // Calls
        "call" => {
            let target = args.get(0).ok_or_else(|| ParseError::new("expected function", span))?;
            if let Some(name) = target.as_id() {
                ctx.defer(Namespace::Func, name, target.span(), out.len());
                out.push(Instr::Call { func: 0 });
            } else {
                out.push(Instr::Call {
                    func: parse_index(Some(target), Namespace::Func, ctx)?,
                });
            }
            Ok(1)
        }
        "call_indirect" => {
            let mut consumed = 0;
            let mut type_idx = None;
            if let Some(a) = args.get(0)
                && a.is_list_headed_by("type")
            {
                let inner = a.as_list().unwrap();
                type_idx = Some(parse_index(inner.get(1), Namespace::Type, ctx)?);
                consumed = 1;
            }
            // Inline (param ...) (result ...) clauses.
            let mut params = Vec::new();
            let mut results = Vec::new();
            let mut seen_result = false;
            let mut seen_inline = false;
            while let Some(a) = args.get(consumed) {
                if a.is_list_headed_by("param") {
                    if seen_result {
                        return Err(ParseError::new("param after result", a.span()));
                    }
                    seen_inline = true;
                    let inner = a.as_list().unwrap();
                    for p in inner.iter_from(1) {
                        if p.as_id().is_some() {
                            continue;
                        }
                        params.push(parse_valtype(p)?);
                    }
                    consumed += 1;
                } else if a.is_list_headed_by("result") {
                    seen_result = true;
                    seen_inline = true;
                    let inner = a.as_list().unwrap();
                    for r in inner.iter_from(1) {
                        results.push(parse_valtype(r)?);
                    }
                    if results.len() > 1 {
                        return Err(ParseError::new("multiple return values", inner.span));
                    }
                    consumed += 1;
                } else {
                    break;
                }
            }
            let type_idx = match type_idx {
                Some(t) => {
                    if seen_inline {
                        let sig = ctx
                            .module
                            .types
                            .get(t as usize)
                            .ok_or_else(|| ParseError::new("undefined type", span))?;
                        if sig.params != params || sig.results != results {
                            return Err(ParseError::new("type mismatch", span));
                        }
                    }
                    t
                }
                None => ctx.find_or_add_type(FuncSig { params, results }),
            };
            out.push(Instr::CallIndirect { type_idx });
            Ok(consumed)
        }

        // Variables
        "local.get" => {
            let local = parse_index(args.get(0), Namespace::Local, ctx)?;
            out.push(Instr::LocalGet { local });
            Ok(1)
        }
        "local.set" => {
            let local = parse_index(args.get(0), Namespace::Local, ctx)?;
            out.push(Instr::LocalSet { local });
            Ok(1)
        }
        "local.tee" => {
            let local = parse_index(args.get(0), Namespace::Local, ctx)?;
            out.push(Instr::LocalTee { local });
            Ok(1)
        }
        "global.get" => {
            let target = args.get(0).ok_or_else(|| ParseError::new("expected global", span))?;
            if let Some(name) = target.as_id() {
                ctx.defer(Namespace::Global, name, target.span(), out.len());
                out.push(Instr::GlobalGet { global: 0 });
            } else {
                out.push(Instr::GlobalGet {
                    global: parse_index(Some(target), Namespace::Global, ctx)?,
                });
            }
            Ok(1)
        }
        "global.set" => {
            let target = args.get(0).ok_or_else(|| ParseError::new("expected global", span))?;
            if let Some(name) = target.as_id() {
                ctx.defer(Namespace::Global, name, target.span(), out.len());
                out.push(Instr::GlobalSet { global: 0 });
            } else {
                out.push(Instr::GlobalSet {
                    global: parse_index(Some(target), Namespace::Global, ctx)?,
                });
            }
            Ok(1)
        }

        // Constants
        "i32.const" => {
            out.push(Instr::I32Const {
                value: parse_i32(args.get(0))?,
            });
            Ok(1)
        }
        "i64.const" => {
            out.push(Instr::I64Const {
                value: parse_i64(args.get(0))?,
            });
            Ok(1)
        }
        "f32.const" => {
            out.push(Instr::F32Const {
                value: parse_f32(args.get(0))?,
            });
            Ok(1)
        }
        "f64.const" => {
            out.push(Instr::F64Const {
                value: parse_f64(args.get(0))?,
            });
            Ok(1)
        }

        // Loads and stores
        "i32.load" => emit_memop(&args, ALIGN_32, out, |m| Instr::I32Load { memarg: m }),
        "i64.load" => emit_memop(&args, ALIGN_64, out, |m| Instr::I64Load { memarg: m }),
        "f32.load" => emit_memop(&args, ALIGN_32, out, |m| Instr::F32Load { memarg: m }),
        "f64.load" => emit_memop(&args, ALIGN_64, out, |m| Instr::F64Load { memarg: m }),
        "i32.load8_s" => emit_memop(&args, ALIGN_8, out, |m| Instr::I32Load8S { memarg: m }),
        "i32.load8_u" => emit_memop(&args, ALIGN_8, out, |m| Instr::I32Load8U { memarg: m }),
        "i32.load16_s" => emit_memop(&args, ALIGN_16, out, |m| Instr::I32Load16S { memarg: m }),
        "i32.load16_u" => emit_memop(&args, ALIGN_16, out, |m| Instr::I32Load16U { memarg: m }),
        "i64.load8_s" => emit_memop(&args, ALIGN_8, out, |m| Instr::I64Load8S { memarg: m }),
        "i64.load8_u" => emit_memop(&args, ALIGN_8, out, |m| Instr::I64Load8U { memarg: m }),
        "i64.load16_s" => emit_memop(&args, ALIGN_16, out, |m| Instr::I64Load16S { memarg: m }),
        "i64.load16_u" => emit_memop(&args, ALIGN_16, out, |m| Instr::I64Load16U { memarg: m }),
        "i64.load32_s" => emit_memop(&args, ALIGN_32, out, |m| Instr::I64Load32S { memarg: m }),
        "i64.load32_u" => emit_memop(&args, ALIGN_32, out, |m| Instr::I64Load32U { memarg: m }),
        "i32.store" => emit_memop(&args, ALIGN_32, out, |m| Instr::I32Store { memarg: m }),
        "i64.store" => emit_memop(&args, ALIGN_64, out, |m| Instr::I64Store { memarg: m }),
        "f32.store" => emit_memop(&args, ALIGN_32, out, |m| Instr::F32Store { memarg: m }),
        "f64.store" => emit_memop(&args, ALIGN_64, out, |m| Instr::F64Store { memarg: m }),
        "i32.store8" => emit_memop(&args, ALIGN_8, out, |m| Instr::I32Store8 { memarg: m }),
        "i32.store16" => emit_memop(&args, ALIGN_16, out, |m| Instr::I32Store16 { memarg: m }),
        "i64.store8" => emit_memop(&args, ALIGN_8, out, |m| Instr::I64Store8 { memarg: m }),
        "i64.store16" => emit_memop(&args, ALIGN_16, out, |m| Instr::I64Store16 { memarg: m }),
        "i64.store32" => emit_memop(&args, ALIGN_32, out, |m| Instr::I64Store32 { memarg: m }),

        // Everything without immediates comes from the mnemonic table.
        _ => match PLAIN_OPS.get(kw) {
            Some(instr) => {
                out.push(instr.clone());
                Ok(0)
            }
            None => Err(ParseError::new(format!("unknown instruction: {}", kw), span)),
        },
    }
}

fn emit_memop(
    args: &ArgSource<'_>,
    natural_align: u32,
    out: &mut Vec<Instr>,
    make: impl FnOnce(MemArg) -> Instr,
) -> Result<usize, ParseError> {
    let (memarg, consumed) = parse_memarg(args, natural_align)?;
    out.push(make(memarg));
    Ok(consumed)
}

/// Optional `offset=N` and `align=N` clauses.
///
/// WAT writes alignment in bytes; the module record stores log2, so
/// `align=4` becomes 2. A missing `align` falls back to the access width's
/// natural alignment.
fn parse_memarg(args: &ArgSource<'_>, natural_align: u32) -> Result<(MemArg, usize), ParseError> {
    let mut offset = 0u32;
    let mut align = natural_align;
    let mut consumed = 0;

    while let Some(s) = args.get(consumed) {
        let Some(kw) = s.as_keyword() else { break };
        if let Some(val) = kw.strip_prefix("offset=") {
            offset = parse_u32_text(val).ok_or_else(|| ParseError::new("invalid offset", s.span()))?;
            consumed += 1;
        } else if let Some(val) = kw.strip_prefix("align=") {
            let bytes = parse_u32_text(val).ok_or_else(|| ParseError::new("invalid alignment", s.span()))?;
            if bytes == 0 || !bytes.is_power_of_two() {
                return Err(ParseError::new("alignment must be a power of two", s.span()));
            }
            align = bytes.trailing_zeros();
            consumed += 1;
        } else {
            break;
        }
    }

    Ok((MemArg { align, offset }, consumed))
}

fn parse_u32_text(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Lists that are immediates of their parent, not nested instructions.
fn is_immediate_list(sexpr: &SExpr) -> bool {
    sexpr.is_list_headed_by("type") || sexpr.is_list_headed_by("param") || sexpr.is_list_headed_by("result")
}

/// Instruction mnemonics that carry no immediates, resolved through one
/// process-wide table built on first use.
static PLAIN_OPS: Lazy<HashMap<&'static str, Instr>> = Lazy::new(|| {
    use Instr::*;
    let ops = [
        ("unreachable", Unreachable),
        ("nop", Nop),
        ("return", Return),
        ("drop", Drop),
        ("select", Select),
        ("memory.size", MemorySize),
        ("memory.grow", MemoryGrow),
        ("i32.eqz", I32Eqz),
        ("i32.eq", I32Eq),
        ("i32.ne", I32Ne),
        ("i32.lt_s", I32LtS),
        ("i32.lt_u", I32LtU),
        ("i32.gt_s", I32GtS),
        ("i32.gt_u", I32GtU),
        ("i32.le_s", I32LeS),
        ("i32.le_u", I32LeU),
        ("i32.ge_s", I32GeS),
        ("i32.ge_u", I32GeU),
        ("i64.eqz", I64Eqz),
        ("i64.eq", I64Eq),
        ("i64.ne", I64Ne),
        ("i64.lt_s", I64LtS),
        ("i64.lt_u", I64LtU),
        ("i64.gt_s", I64GtS),
        ("i64.gt_u", I64GtU),
        ("i64.le_s", I64LeS),
        ("i64.le_u", I64LeU),
        ("i64.ge_s", I64GeS),
        ("i64.ge_u", I64GeU),
        ("f32.eq", F32Eq),
        ("f32.ne", F32Ne),
        ("f32.lt", F32Lt),
        ("f32.gt", F32Gt),
        ("f32.le", F32Le),
        ("f32.ge", F32Ge),
        ("f64.eq", F64Eq),
        ("f64.ne", F64Ne),
        ("f64.lt", F64Lt),
        ("f64.gt", F64Gt),
        ("f64.le", F64Le),
        ("f64.ge", F64Ge),
        ("i32.clz", I32Clz),
        ("i32.ctz", I32Ctz),
        ("i32.popcnt", I32Popcnt),
        ("i32.add", I32Add),
        ("i32.sub", I32Sub),
        ("i32.mul", I32Mul),
        ("i32.div_s", I32DivS),
        ("i32.div_u", I32DivU),
        ("i32.rem_s", I32RemS),
        ("i32.rem_u", I32RemU),
        ("i32.and", I32And),
        ("i32.or", I32Or),
        ("i32.xor", I32Xor),
        ("i32.shl", I32Shl),
        ("i32.shr_s", I32ShrS),
        ("i32.shr_u", I32ShrU),
        ("i32.rotl", I32Rotl),
        ("i32.rotr", I32Rotr),
        ("i64.clz", I64Clz),
        ("i64.ctz", I64Ctz),
        ("i64.popcnt", I64Popcnt),
        ("i64.add", I64Add),
        ("i64.sub", I64Sub),
        ("i64.mul", I64Mul),
        ("i64.div_s", I64DivS),
        ("i64.div_u", I64DivU),
        ("i64.rem_s", I64RemS),
        ("i64.rem_u", I64RemU),
        ("i64.and", I64And),
        ("i64.or", I64Or),
        ("i64.xor", I64Xor),
        ("i64.shl", I64Shl),
        ("i64.shr_s", I64ShrS),
        ("i64.shr_u", I64ShrU),
        ("i64.rotl", I64Rotl),
        ("i64.rotr", I64Rotr),
        ("f32.abs", F32Abs),
        ("f32.neg", F32Neg),
        ("f32.ceil", F32Ceil),
        ("f32.floor", F32Floor),
        ("f32.trunc", F32Trunc),
        ("f32.nearest", F32Nearest),
        ("f32.sqrt", F32Sqrt),
        ("f32.add", F32Add),
        ("f32.sub", F32Sub),
        ("f32.mul", F32Mul),
        ("f32.div", F32Div),
        ("f32.min", F32Min),
        ("f32.max", F32Max),
        ("f32.copysign", F32Copysign),
        ("f64.abs", F64Abs),
        ("f64.neg", F64Neg),
        ("f64.ceil", F64Ceil),
        ("f64.floor", F64Floor),
        ("f64.trunc", F64Trunc),
        ("f64.nearest", F64Nearest),
        ("f64.sqrt", F64Sqrt),
        ("f64.add", F64Add),
        ("f64.sub", F64Sub),
        ("f64.mul", F64Mul),
        ("f64.div", F64Div),
        ("f64.min", F64Min),
        ("f64.max", F64Max),
        ("f64.copysign", F64Copysign),
        ("i32.wrap_i64", I32WrapI64),
        ("i32.trunc_f32_s", I32TruncF32S),
        ("i32.trunc_f32_u", I32TruncF32U),
        ("i32.trunc_f64_s", I32TruncF64S),
        ("i32.trunc_f64_u", I32TruncF64U),
        ("i64.extend_i32_s", I64ExtendI32S),
        ("i64.extend_i32_u", I64ExtendI32U),
        ("i64.trunc_f32_s", I64TruncF32S),
        ("i64.trunc_f32_u", I64TruncF32U),
        ("i64.trunc_f64_s", I64TruncF64S),
        ("i64.trunc_f64_u", I64TruncF64U),
        ("f32.convert_i32_s", F32ConvertI32S),
        ("f32.convert_i32_u", F32ConvertI32U),
        ("f32.convert_i64_s", F32ConvertI64S),
        ("f32.convert_i64_u", F32ConvertI64U),
        ("f32.demote_f64", F32DemoteF64),
        ("f64.convert_i32_s", F64ConvertI32S),
        ("f64.convert_i32_u", F64ConvertI32U),
        ("f64.convert_i64_s", F64ConvertI64S),
        ("f64.convert_i64_u", F64ConvertI64U),
        ("f64.promote_f32", F64PromoteF32),
        ("i32.reinterpret_f32", I32ReinterpretF32),
        ("i64.reinterpret_f64", I64ReinterpretF64),
        ("f32.reinterpret_i32", F32ReinterpretI32),
        ("f64.reinterpret_i64", F64ReinterpretI64),
    ];
    ops.into_iter().collect()
});

// ============================================================================
// Small parsers
// ============================================================================

/// Consume an optional `$id` at `list[*idx]`, advancing past it if present.
fn take_optional_name<'a>(list: SExprList<'a>, idx: &mut usize) -> Option<&'a str> {
    let name = list.get(*idx).and_then(|s| s.as_id());
    if name.is_some() {
        *idx += 1;
    }
    name
}

/// `idx ::= u32 | id`, resolved in the given namespace.
fn parse_index(sexpr: Option<&SExpr>, ns: Namespace, ctx: &ParseContext) -> Result<u32, ParseError> {
    let s = sexpr.ok_or_else(|| ParseError::new(format!("expected {} index", ns.label()), Span::ZERO))?;

    if let Some(name) = s.as_id() {
        return ctx.resolve(ns, name, s.span());
    }
    if let Some(token) = s.as_atom()
        && let TokenKind::Integer(lit) = &token.kind
    {
        return lit
            .to_u32()
            .ok_or_else(|| ParseError::new("index out of range", token.span));
    }
    Err(ParseError::expected(
        &format!("{} index", ns.label()),
        "other",
        s.span(),
    ))
}

/// `labelidx ::= u32 | id`; names resolve against the label stack,
/// innermost first. Numeric depths pass through unchanged.
fn parse_label_depth(sexpr: Option<&SExpr>, ctx: &ParseContext) -> Result<u32, ParseError> {
    let s = sexpr.ok_or_else(|| ParseError::new("expected label", Span::ZERO))?;

    if let Some(name) = s.as_id() {
        return ctx
            .labels
            .depth(name)
            .ok_or_else(|| ParseError::undefined("label", name, s.span()));
    }
    if let Some(token) = s.as_atom()
        && let TokenKind::Integer(lit) = &token.kind
    {
        return lit
            .to_u32()
            .ok_or_else(|| ParseError::new("label out of range", token.span));
    }
    Err(ParseError::expected("label", "other", s.span()))
}

fn is_integer_atom(sexpr: &SExpr) -> bool {
    sexpr
        .as_atom()
        .map(|t| matches!(t.kind, TokenKind::Integer(_)))
        .unwrap_or(false)
}

/// A UTF-8 name from a string literal.
fn parse_name_string(sexpr: &SExpr) -> Result<String, ParseError> {
    let token = sexpr.expect_atom()?;
    if let TokenKind::String(bytes) = &token.kind {
        String::from_utf8(bytes.clone()).map_err(|_| ParseError::new("malformed UTF-8 encoding", token.span))
    } else {
        Err(ParseError::expected("string", &format!("{}", token.kind), token.span))
    }
}

/// Raw bytes from a string literal (data segments keep arbitrary bytes).
fn parse_byte_string(sexpr: &SExpr) -> Result<Vec<u8>, ParseError> {
    let token = sexpr.expect_atom()?;
    if let TokenKind::String(bytes) = &token.kind {
        Ok(bytes.clone())
    } else {
        Err(ParseError::expected("string", &format!("{}", token.kind), token.span))
    }
}

/// `(import "module" "field")` at `list[idx]`, if present.
fn parse_inline_import(list: SExprList<'_>, idx: usize) -> Result<Option<(String, String)>, ParseError> {
    let Some(item) = list.get(idx) else { return Ok(None) };
    if !item.is_list_headed_by("import") {
        return Ok(None);
    }
    let imp = item.as_list().unwrap();
    let module_name = parse_name_string(
        imp.get(1)
            .ok_or_else(|| ParseError::new("expected module name", imp.span))?,
    )?;
    let field_name = parse_name_string(
        imp.get(2)
            .ok_or_else(|| ParseError::new("expected field name", imp.span))?,
    )?;
    Ok(Some((module_name, field_name)))
}

/// `limits ::= u32 u32?` — returns the limits and how many items they took.
fn parse_limits(list: SExprList<'_>, start: usize) -> Result<(Limits, usize), ParseError> {
    let min_sexpr = list
        .get(start)
        .ok_or_else(|| ParseError::new("expected minimum limit", list.span))?;
    let min = parse_u32(min_sexpr)?;

    if let Some(s) = list.get(start + 1)
        && is_integer_atom(s)
    {
        Ok((
            Limits {
                min,
                max: Some(parse_u32(s)?),
            },
            2,
        ))
    } else {
        Ok((Limits { min, max: None }, 1))
    }
}

/// `elemtype ::= 'anyfunc'` (the pre-reference-types spelling `funcref` is
/// also accepted).
fn parse_elemtype(sexpr: Option<&SExpr>) -> Result<(), ParseError> {
    let s = sexpr.ok_or_else(|| ParseError::new("expected element type", Span::ZERO))?;
    match s.as_keyword() {
        Some("anyfunc") | Some("funcref") => Ok(()),
        Some(kw) => Err(ParseError::expected("element type", &format!("'{}'", kw), s.span())),
        None => Err(ParseError::expected("element type", "list", s.span())),
    }
}

fn is_elemtype(sexpr: Option<&SExpr>) -> bool {
    matches!(
        sexpr.and_then(|s| s.as_keyword()),
        Some("anyfunc") | Some("funcref")
    )
}

fn parse_u32(sexpr: &SExpr) -> Result<u32, ParseError> {
    let token = sexpr.expect_atom()?;
    if let TokenKind::Integer(lit) = &token.kind {
        lit.to_u32()
            .ok_or_else(|| ParseError::new("constant out of range", token.span))
    } else {
        Err(ParseError::expected("u32", &format!("{}", token.kind), token.span))
    }
}

pub(crate) fn parse_i32(sexpr: Option<&SExpr>) -> Result<i32, ParseError> {
    let s = sexpr.ok_or_else(|| ParseError::new("expected i32", Span::ZERO))?;
    let token = s.expect_atom()?;

    if let TokenKind::Integer(lit) = &token.kind {
        // Accept the full signed and unsigned ranges; out-of-range rejects.
        lit.to_i64()
            .and_then(|n| i32::try_from(n).ok())
            .or_else(|| lit.to_u64().and_then(|n| u32::try_from(n).ok()).map(|u| u as i32))
            .ok_or_else(|| ParseError::new("constant out of range", token.span))
    } else {
        Err(ParseError::expected("i32", &format!("{}", token.kind), token.span))
    }
}

pub(crate) fn parse_i64(sexpr: Option<&SExpr>) -> Result<i64, ParseError> {
    let s = sexpr.ok_or_else(|| ParseError::new("expected i64", Span::ZERO))?;
    let token = s.expect_atom()?;

    if let TokenKind::Integer(lit) = &token.kind {
        lit.to_i64()
            .or_else(|| lit.to_u64().map(|u| u as i64))
            .ok_or_else(|| ParseError::new("constant out of range", token.span))
    } else {
        Err(ParseError::expected("i64", &format!("{}", token.kind), token.span))
    }
}

/// Generates the f32/f64 constant parsers. NaN payloads build the exact bit
/// pattern; a finite literal that overflows the width is out of range.
macro_rules! parse_float_fn {
    ($name:ident, $fty:ty, $uty:ty, $label:expr,
     $max_payload:expr, $exp_bits:expr, $canon_nan:expr, $sign_bit:expr, $to_float:ident) => {
        pub(crate) fn $name(sexpr: Option<&SExpr>) -> Result<$fty, ParseError> {
            let s = sexpr.ok_or_else(|| ParseError::new(concat!("expected ", $label), Span::ZERO))?;
            let token = s.expect_atom()?;
            match &token.kind {
                TokenKind::Float(lit) => match lit {
                    FloatLit::Nan { negative, payload } => {
                        let mut bits: $uty = match payload {
                            Some(p) => {
                                if *p == 0 || *p > $max_payload {
                                    return Err(ParseError::new("constant out of range", token.span));
                                }
                                $exp_bits | (*p as $uty)
                            }
                            None => $canon_nan,
                        };
                        if *negative {
                            bits |= $sign_bit;
                        }
                        Ok(<$fty>::from_bits(bits))
                    }
                    FloatLit::Inf { .. } => Ok(lit.$to_float()),
                    _ => {
                        let val = lit.$to_float();
                        if val.is_infinite() {
                            return Err(ParseError::new("constant out of range", token.span));
                        }
                        Ok(val)
                    }
                },
                TokenKind::Integer(lit) => {
                    let val = if lit.negative {
                        -(lit.magnitude as f64)
                    } else {
                        lit.magnitude as f64
                    };
                    Ok(val as $fty)
                }
                other => Err(ParseError::expected($label, &format!("{}", other), token.span)),
            }
        }
    };
}

parse_float_fn!(
    parse_f32,
    f32,
    u32,
    "f32",
    0x7F_FFFFu64,
    0x7F80_0000u32,
    0x7FC0_0000u32,
    0x8000_0000u32,
    to_f32
);
parse_float_fn!(
    parse_f64,
    f64,
    u64,
    "f64",
    0xF_FFFF_FFFF_FFFFu64,
    0x7FF0_0000_0000_0000u64,
    0x7FF8_0000_0000_0000u64,
    0x8000_0000_0000_0000u64,
    to_f64
);

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(module: &Module, idx: usize) -> &[Instr] {
        &module.code[idx].body
    }

    fn expect_error(source: &str, substring: &str) {
        let err = parse(source).expect_err("expected parse error");
        assert!(
            err.message.contains(substring),
            "expected error containing {:?}, got {:?}",
            substring,
            err.message
        );
    }

    #[test]
    fn empty_module() {
        let module = parse("(module)").unwrap();
        assert!(module.types.is_empty());
        assert!(module.functions.is_empty());
        assert!(module.exports.is_empty());
        assert!(module.start.is_none());
    }

    #[test]
    fn named_module() {
        let module = parse("(module $m)").unwrap();
        assert_eq!(module.name.as_deref(), Some("m"));
    }

    #[test]
    fn identity_function() {
        let module = parse(
            r#"(module
                 (func $id (param $x i32) (result i32) local.get $x)
                 (export "id" (func $id)))"#,
        )
        .unwrap();

        assert_eq!(module.types.len(), 1);
        assert_eq!(module.types[0].params, vec![ValueType::I32]);
        assert_eq!(module.types[0].results, vec![ValueType::I32]);
        assert_eq!(module.functions, vec![0]);
        assert_eq!(body_of(&module, 0), &[Instr::LocalGet { local: 0 }, Instr::End]);
        assert_eq!(module.exports.len(), 1);
        assert_eq!(module.exports[0].name, "id");
        assert_eq!(module.exports[0].desc, ExportDesc::Function(0));
        assert_eq!(module.code[0].param_names, vec![Some("x".to_string())]);
    }

    #[test]
    fn forward_reference_resolves_after_pass_three() {
        let module = parse("(module (func $a (call $b)) (func $b))").unwrap();
        assert_eq!(body_of(&module, 0), &[Instr::Call { func: 1 }, Instr::End]);
        assert_eq!(body_of(&module, 1), &[Instr::End]);
    }

    #[test]
    fn self_call_resolves() {
        let module = parse("(module (func $f (call $f)))").unwrap();
        assert_eq!(body_of(&module, 0), &[Instr::Call { func: 0 }, Instr::End]);
    }

    #[test]
    fn undefined_call_target_fails() {
        expect_error("(module (func (call $nope)))", "undefined function");
    }

    #[test]
    fn label_matching() {
        let module = parse("(module (func (block $L (br $L) end)))").unwrap();
        // Note the flat block inside a folded wrapper: block, br 0, end, end.
        assert_eq!(
            body_of(&module, 0),
            &[
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
    fn nested_labels_resolve_by_depth() {
        let module = parse(
            "(module (func
               (block $outer
                 (block $inner
                   (br $outer)
                   (br $inner)))))",
        )
        .unwrap();
        assert_eq!(
            body_of(&module, 0),
            &[
                Instr::Block {
                    block_type: BlockType::Empty
                },
                Instr::Block {
                    block_type: BlockType::Empty
                },
                Instr::Br { depth: 1 },
                Instr::Br { depth: 0 },
                Instr::End,
                Instr::End,
                Instr::End,
            ]
        );
    }

    #[test]
    fn end_label_must_match() {
        expect_error("(module (func (block $a (br $a) end $b)))", "mismatching label");
        assert!(parse("(module (func (block $a (br $a) end $a)))").is_ok());
    }

    #[test]
    fn duplicate_function_name_fails() {
        expect_error("(module (func $f) (func $f))", "duplicate function");
    }

    #[test]
    fn duplicate_local_name_fails() {
        expect_error("(module (func (param $x i32) (local $x i32)))", "duplicate local");
    }

    #[test]
    fn folded_emits_operands_first() {
        let module = parse(
            r#"(module (func (result i32)
                 (i32.add (i32.const 1) (i32.const 2))))"#,
        )
        .unwrap();
        assert_eq!(
            body_of(&module, 0),
            &[
                Instr::I32Const { value: 1 },
                Instr::I32Const { value: 2 },
                Instr::I32Add,
                Instr::End,
            ]
        );
    }

    #[test]
    fn flat_and_folded_agree() {
        let flat = parse(
            r#"(module (func (param i32 i32) (result i32)
                 local.get 0
                 local.get 1
                 i32.add))"#,
        )
        .unwrap();
        let folded = parse(
            r#"(module (func (param i32 i32) (result i32)
                 (i32.add (local.get 0) (local.get 1))))"#,
        )
        .unwrap();
        assert_eq!(body_of(&flat, 0), body_of(&folded, 0));
    }

    #[test]
    fn folded_if_emits_condition_first() {
        let module = parse(
            r#"(module (func (param i32) (result i32)
                 (if (result i32) (local.get 0)
                   (then (i32.const 1))
                   (else (i32.const 2)))))"#,
        )
        .unwrap();
        assert_eq!(
            body_of(&module, 0),
            &[
                Instr::LocalGet { local: 0 },
                Instr::If {
                    block_type: BlockType::Value(ValueType::I32)
                },
                Instr::I32Const { value: 1 },
                Instr::Else,
                Instr::I32Const { value: 2 },
                Instr::End,
                Instr::End,
            ]
        );
    }

    #[test]
    fn flat_if_with_else() {
        let module = parse(
            r#"(module (func (param i32)
                 local.get 0
                 if
                   nop
                 else
                   unreachable
                 end))"#,
        )
        .unwrap();
        assert_eq!(
            body_of(&module, 0),
            &[
                Instr::LocalGet { local: 0 },
                Instr::If {
                    block_type: BlockType::Empty
                },
                Instr::Nop,
                Instr::Else,
                Instr::Unreachable,
                Instr::End,
                Instr::End,
            ]
        );
    }

    #[test]
    fn block_end_balance() {
        let module = parse(
            r#"(module (func
                 (block (loop (br 1) (br 0)))
                 (if (i32.const 1) (then (nop)))))"#,
        )
        .unwrap();
        let body = body_of(&module, 0);
        let opens = body
            .iter()
            .filter(|i| matches!(i, Instr::Block { .. } | Instr::Loop { .. } | Instr::If { .. }))
            .count();
        let ends = body.iter().filter(|i| matches!(i, Instr::End)).count();
        // One End closes the function body itself.
        assert_eq!(ends, opens + 1);
    }

    #[test]
    fn br_table_last_target_is_default() {
        let module = parse(
            r#"(module (func (param i32)
                 (block $a (block $b (block $c
                   (br_table $c $b $a (local.get 0)))))))"#,
        )
        .unwrap();
        let body = body_of(&module, 0);
        assert!(body.contains(&Instr::BrTable {
            targets: vec![0, 1],
            default: 2
        }));
    }

    #[test]
    fn loop_label_is_zero_depth_inside() {
        let module = parse(
            r#"(module (func
                 (loop $continue
                   (br $continue))))"#,
        )
        .unwrap();
        assert_eq!(
            body_of(&module, 0),
            &[
                Instr::Loop {
                    block_type: BlockType::Empty
                },
                Instr::Br { depth: 0 },
                Instr::End,
                Instr::End,
            ]
        );
    }

    #[test]
    fn memarg_parsing() {
        let module = parse(
            r#"(module (memory 1) (func (param i32)
                 (i32.load offset=4 align=2 (local.get 0))
                 drop
                 (i32.store8 (local.get 0) (i32.const 0))))"#,
        )
        .unwrap();
        let body = body_of(&module, 0);
        assert!(body.contains(&Instr::I32Load {
            memarg: MemArg { align: 1, offset: 4 }
        }));
        // Natural alignment for an 8-bit store is log2(1) = 0.
        assert!(body.contains(&Instr::I32Store8 {
            memarg: MemArg { align: 0, offset: 0 }
        }));
    }

    #[test]
    fn alignment_must_be_power_of_two() {
        expect_error(
            "(module (memory 1) (func (i32.load align=3 (i32.const 0)) drop))",
            "power of two",
        );
    }

    #[test]
    fn type_definitions_and_references() {
        let module = parse(
            r#"(module
                 (type $binop (func (param i32 i32) (result i32)))
                 (func $add (type $binop) local.get 0 local.get 1 i32.add))"#,
        )
        .unwrap();
        assert_eq!(module.types.len(), 1);
        assert_eq!(module.functions, vec![0]);
    }

    #[test]
    fn forward_type_reference_works() {
        // Types are collected in pass 1, so use before definition is fine.
        let module = parse(
            r#"(module
                 (func (type $t))
                 (type $t (func)))"#,
        )
        .unwrap();
        assert_eq!(module.functions, vec![0]);
    }

    #[test]
    fn inline_type_use_must_match_referenced_type() {
        expect_error(
            r#"(module
                 (type $t (func (param i32)))
                 (func (type $t) (param f64)))"#,
            "type mismatch",
        );
    }

    #[test]
    fn implicit_types_are_deduplicated() {
        let module = parse(
            r#"(module
                 (func (param i32) (result i32) local.get 0)
                 (func (param i32) (result i32) local.get 0))"#,
        )
        .unwrap();
        assert_eq!(module.types.len(), 1);
        assert_eq!(module.functions, vec![0, 0]);
    }

    #[test]
    fn explicit_types_are_not_deduplicated() {
        let module = parse(
            r#"(module
                 (type (func (param i32)))
                 (type (func (param i32))))"#,
        )
        .unwrap();
        assert_eq!(module.types.len(), 2);
    }

    #[test]
    fn param_after_result_fails() {
        expect_error("(module (func (result i32) (param i32)))", "param after result");
    }

    #[test]
    fn multiple_results_fail() {
        expect_error("(module (func (result i32 i32)))", "multiple return values");
        expect_error("(module (type (func (result i32 f64))))", "multiple return values");
    }

    #[test]
    fn imports_and_ordering() {
        let module = parse(
            r#"(module
                 (import "env" "print" (func $print (param i32)))
                 (import "env" "mem" (memory 1))
                 (func (call $print (i32.const 1))))"#,
        )
        .unwrap();
        assert_eq!(module.imports.len(), 2);
        assert_eq!(module.import_counts.funcs, 1);
        assert_eq!(module.import_counts.memories, 1);
        // The defined function's index comes after the imported one.
        assert_eq!(body_of(&module, 0)[1], Instr::Call { func: 0 });
        assert_eq!(module.func_count(), 2);
    }

    #[test]
    fn import_after_definition_fails() {
        expect_error(
            r#"(module (func) (import "m" "f" (func)))"#,
            "import after function definition",
        );
        // A different kind is still fine.
        assert!(parse(r#"(module (func) (import "m" "g" (global i32)))"#).is_ok());
    }

    #[test]
    fn inline_import_desugars() {
        let module = parse(r#"(module (func $f (import "m" "f") (param i32)))"#).unwrap();
        assert_eq!(module.imports.len(), 1);
        assert!(matches!(module.imports[0].kind, ImportKind::Function(_)));
        assert!(module.functions.is_empty());
    }

    #[test]
    fn inline_import_after_definition_fails() {
        expect_error(
            r#"(module (func) (func $f (import "m" "f")))"#,
            "import after function definition",
        );
    }

    #[test]
    fn inline_export_desugars() {
        let module = parse(r#"(module (func $f (export "a") (export "b")))"#).unwrap();
        assert_eq!(module.exports.len(), 2);
        assert_eq!(module.exports[0].desc, ExportDesc::Function(0));
        assert_eq!(module.exports[1].desc, ExportDesc::Function(0));
    }

    #[test]
    fn globals_and_const_exprs() {
        let module = parse(
            r#"(module
                 (import "env" "base" (global $base i32))
                 (global $g (mut i32) (i32.const 7))
                 (global $h f64 (f64.const 0.5))
                 (global $i i32 (global.get $base)))"#,
        )
        .unwrap();
        assert_eq!(module.globals.len(), 3);
        assert!(module.globals[0].ty.mutable);
        assert_eq!(module.globals[0].init, vec![Instr::I32Const { value: 7 }, Instr::End]);
        assert_eq!(
            module.globals[2].init,
            vec![Instr::GlobalGet { global: 0 }, Instr::End]
        );
    }

    #[test]
    fn const_expr_must_reference_imported_global() {
        expect_error(
            r#"(module
                 (global $a i32 (i32.const 1))
                 (global $b i32 (global.get $a)))"#,
            "imported global",
        );
    }

    #[test]
    fn const_expr_rejects_computation() {
        expect_error(
            "(module (global i32 (i32.add (i32.const 1) (i32.const 2))))",
            "expected constant expression",
        );
    }

    #[test]
    fn global_references_in_bodies_defer() {
        let module = parse(
            r#"(module
                 (func (result i32) (global.get $g))
                 (global $g i32 (i32.const 3)))"#,
        )
        .unwrap();
        assert_eq!(body_of(&module, 0), &[Instr::GlobalGet { global: 0 }, Instr::End]);
    }

    #[test]
    fn elem_and_data_segments() {
        let module = parse(
            r#"(module
                 (table 2 anyfunc)
                 (memory 1)
                 (func $f)
                 (func $g)
                 (elem (i32.const 0) $f $g)
                 (data (offset (i32.const 8)) "hi" "!"))"#,
        )
        .unwrap();
        assert_eq!(module.elements.len(), 1);
        assert_eq!(module.elements[0].funcs, vec![0, 1]);
        assert_eq!(module.elements[0].offset, vec![Instr::I32Const { value: 0 }, Instr::End]);
        assert_eq!(module.data.len(), 1);
        assert_eq!(module.data[0].bytes, b"hi!");
        assert_eq!(module.data[0].offset, vec![Instr::I32Const { value: 8 }, Instr::End]);
    }

    #[test]
    fn elem_with_explicit_table_index() {
        let module = parse(
            r#"(module
                 (table $t 1 anyfunc)
                 (func $f)
                 (elem $t (offset (i32.const 0)) $f))"#,
        )
        .unwrap();
        assert_eq!(module.elements[0].table, 0);
    }

    #[test]
    fn inline_memory_data() {
        let module = parse(r#"(module (memory (data "abcd")))"#).unwrap();
        assert_eq!(module.memories.len(), 1);
        assert_eq!(module.memories[0].min, 4);
        assert_eq!(module.memories[0].max, None);
        assert_eq!(module.data.len(), 1);
        assert_eq!(module.data[0].bytes, b"abcd");
    }

    #[test]
    fn inline_table_elem() {
        let module = parse(r#"(module (func $f) (func $g) (table anyfunc (elem $f $g $f)))"#).unwrap();
        assert_eq!(module.tables.len(), 1);
        assert_eq!(module.tables[0].limits.min, 3);
        assert_eq!(module.tables[0].limits.max, Some(3));
        assert_eq!(module.elements[0].funcs, vec![0, 1, 0]);
    }

    #[test]
    fn start_section() {
        let module = parse("(module (func $main) (start $main))").unwrap();
        assert_eq!(module.start, Some(0));
        expect_error("(module (func $m) (start $m) (start $m))", "multiple start");
    }

    #[test]
    fn call_indirect_with_type_use() {
        let module = parse(
            r#"(module
                 (type $t (func (param i32) (result i32)))
                 (table 1 anyfunc)
                 (func (param i32) (result i32)
                   (call_indirect (type $t) (local.get 0) (i32.const 0))))"#,
        )
        .unwrap();
        let body = body_of(&module, 0);
        assert!(body.contains(&Instr::CallIndirect { type_idx: 0 }));
    }

    #[test]
    fn call_indirect_with_inline_signature() {
        let module = parse(
            r#"(module
                 (table 1 anyfunc)
                 (func (result i32)
                   (call_indirect (param i32) (result i32) (i32.const 5) (i32.const 0))))"#,
        )
        .unwrap();
        // The inline signature synthesised a type distinct from the
        // enclosing function's.
        assert_eq!(module.types.len(), 2);
    }

    #[test]
    fn integer_constant_ranges() {
        let module = parse(
            r#"(module
                 (func (result i32) (i32.const -2147483648))
                 (func (result i32) (i32.const 4294967295))
                 (func (result i64) (i64.const 0xFFFFFFFFFFFFFFFF)))"#,
        )
        .unwrap();
        assert_eq!(body_of(&module, 0)[0], Instr::I32Const { value: i32::MIN });
        assert_eq!(body_of(&module, 1)[0], Instr::I32Const { value: -1 });
        assert_eq!(body_of(&module, 2)[0], Instr::I64Const { value: -1 });
        expect_error("(module (func (result i32) (i32.const 4294967296)))", "out of range");
    }

    #[test]
    fn float_constants_bit_patterns() {
        let module = parse(
            r#"(module
                 (func (result f32) (f32.const -0.0))
                 (func (result f32) (f32.const nan:0x200000))
                 (func (result f64) (f64.const 0x1.8p1)))"#,
        )
        .unwrap();
        match body_of(&module, 0)[0] {
            Instr::F32Const { value } => assert_eq!(value.to_bits(), 0x8000_0000),
            ref other => panic!("expected f32.const, got {}", other),
        }
        match body_of(&module, 1)[0] {
            Instr::F32Const { value } => assert_eq!(value.to_bits(), 0x7FA0_0000),
            ref other => panic!("expected f32.const, got {}", other),
        }
        match body_of(&module, 2)[0] {
            Instr::F64Const { value } => assert_eq!(value, 3.0),
            ref other => panic!("expected f64.const, got {}", other),
        }
    }

    #[test]
    fn nan_payload_out_of_range_fails() {
        expect_error("(module (func (result f32) (f32.const nan:0x800000)))", "out of range");
    }

    #[test]
    fn unknown_instruction_fails() {
        expect_error("(module (func (i32.frobnicate)))", "unknown instruction");
    }

    #[test]
    fn unknown_field_fails() {
        expect_error("(module (bogus))", "unknown field");
    }

    #[test]
    fn local_after_instruction_fails() {
        expect_error("(module (func nop (local i32)))", "local after instruction");
    }

    #[test]
    fn branch_depths_never_exceed_open_labels() {
        // All symbolic branches resolve to a depth below the label-stack
        // height at their program point.
        let module = parse(
            r#"(module (func
                 (block $a
                   (block $b
                     (br_if $a (i32.const 0))
                     (br_if $b (i32.const 1))))))"#,
        )
        .unwrap();
        let body = body_of(&module, 0);
        let mut height = 0i32;
        for instr in body {
            match instr {
                Instr::Block { .. } | Instr::Loop { .. } | Instr::If { .. } => height += 1,
                Instr::End => height -= 1,
                Instr::Br { depth } | Instr::BrIf { depth } => {
                    assert!((*depth as i32) < height);
                }
                _ => {}
            }
        }
        assert_eq!(height, -1); // the function body's own End
    }
}
