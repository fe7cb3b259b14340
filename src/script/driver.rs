//! Script evaluation against a compiled artifact.
//!
//! The driver owns the environment of parsed modules and reaches the
//! outside world through three collaborator traits: a [`BinaryDecoder`]
//! for `(module binary ...)` bodies, a [`Compiler`] for validation and
//! code generation, and a [`Loader`] for the produced artifact.
//!
//! Compilation is lazy: adding any module marks the environment dirty and
//! drops the artifact handle; the next directive that needs to execute
//! revalidates, recompiles, and reloads. Function dispatch goes through a
//! strongly-typed `extern "C"` call shape selected from the export's
//! signature, wrapped in the machine-fault guard so a crashing artifact
//! surfaces as a trap error instead of taking the process down.

use super::command::{Action, Command, ScriptModule};
use super::faults::catch_faults;
use super::parser::parse_script;
use super::values::Value;
use crate::module::{ExportDesc, FuncSig, Module, ValueType};
use crate::wat;
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The artifact symbol for a module's export. Kept in one place so the
/// driver and every [`Compiler`] implementation agree.
pub fn mangle(module: &str, export: &str) -> String {
    format!("{}_{}", module, export)
}

// ============================================================================
// Collaborators
// ============================================================================

/// Decodes binary-format modules (for `(module binary ...)`).
pub trait BinaryDecoder {
    fn decode(&self, bytes: &[u8], name: Option<&str>) -> Result<Module, String>;
}

/// Validates and compiles the environment.
pub trait Compiler {
    /// Validate every module in the environment; returns the number of
    /// validation errors found.
    fn validate(&mut self, env: &Environment) -> usize;

    /// Compile the environment into a loadable artifact at `out`.
    fn compile(&mut self, env: &Environment, out: &Path) -> Result<(), String>;
}

/// Loads compiled artifacts and resolves mangled symbols.
pub trait Loader {
    /// Load the artifact at `path`; `false` when no handle could be
    /// obtained. The handle stays with the implementation.
    fn load(&mut self, path: &Path) -> bool;

    /// Resolve a mangled symbol in the loaded artifact.
    fn lookup(&self, symbol: &str) -> Option<*const ()>;

    /// Release the artifact handle, if any.
    fn unload(&mut self);
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script syntax error: {0}")]
    Syntax(#[from] super::parser::SyntaxError),
    #[error("malformed module: {0}")]
    Malformed(String),
    #[error("invalid module: {0} validation error(s)")]
    Invalid(usize),
    #[error("compilation failed: {0}")]
    Compile(String),
    #[error("artifact failed to load")]
    InitFailure,
    #[error("runtime trap")]
    Trap,
    #[error("assertion failed at line {line}: {context}")]
    AssertFailure { line: u32, context: String },
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("unknown export: {0}")]
    UnknownExport(String),
    #[error("duplicate module name: {0}")]
    DuplicateModuleName(String),
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),
    #[error("unsupported directive: {0}")]
    Unsupported(&'static str),
}

fn assert_failure(line: u32, context: impl Into<String>) -> ScriptError {
    ScriptError::AssertFailure {
        line,
        context: context.into(),
    }
}

// ============================================================================
// Environment
// ============================================================================

/// The modules a script has defined, with the two name maps that refer to
/// them: script-level `$name`s and `register`ed import names.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    modules: Vec<Module>,
    names: HashMap<String, usize>,
    registered: HashMap<String, usize>,
    last: Option<usize>,
}

impl Environment {
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// The `register`ed import-name map, for the compiler's link step.
    pub fn registered(&self) -> &HashMap<String, usize> {
        &self.registered
    }

    fn add_module(&mut self, mut module: Module, script_name: Option<&str>) -> Result<usize, ScriptError> {
        let idx = self.modules.len();
        if let Some(n) = script_name {
            if self.names.contains_key(n) {
                return Err(ScriptError::DuplicateModuleName(n.to_string()));
            }
            self.names.insert(n.to_string(), idx);
            if module.name.is_none() {
                module.name = Some(n.to_string());
            }
        }
        // Unnamed modules still need a linking name for symbol mangling.
        if module.name.is_none() {
            module.name = Some(format!("m{}", idx));
        }
        self.modules.push(module);
        self.last = Some(idx);
        Ok(idx)
    }

    fn register(&mut self, as_name: &str, module_name: Option<&str>) -> Result<(), ScriptError> {
        let idx = match module_name {
            Some(n) => *self
                .names
                .get(n)
                .ok_or_else(|| ScriptError::UnknownModule(n.to_string()))?,
            None => self
                .last
                .ok_or_else(|| ScriptError::UnknownModule("<none>".to_string()))?,
        };
        if self.registered.contains_key(as_name) {
            return Err(ScriptError::DuplicateModuleName(as_name.to_string()));
        }
        self.registered.insert(as_name.to_string(), idx);
        Ok(())
    }

    /// The module an action targets: `$name`, a registered name, or the
    /// most recently defined one.
    fn action_target(&self, name: &Option<String>) -> Result<&Module, ScriptError> {
        match name {
            Some(n) => self
                .names
                .get(n)
                .or_else(|| self.registered.get(n))
                .map(|&i| &self.modules[i])
                .ok_or_else(|| ScriptError::UnknownModule(n.clone())),
            None => self
                .last
                .map(|i| &self.modules[i])
                .ok_or_else(|| ScriptError::UnknownModule("<none>".to_string())),
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Per-run tallies, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptStats {
    pub modules: usize,
    pub registers: usize,
    pub actions: usize,
    pub assertions: usize,
    pub skipped: usize,
}

/// Evaluates script directives, aborting on the first failure.
///
/// Expected failures (the `assert_*` directives) are consumed and counted;
/// an assertion observing the opposite outcome aborts the run with
/// [`ScriptError::AssertFailure`].
pub struct Driver<C: Compiler, L: Loader, D: BinaryDecoder> {
    env: Environment,
    compiler: C,
    loader: L,
    decoder: D,
    artifact: PathBuf,
    dirty: bool,
    loaded: bool,
}

impl<C: Compiler, L: Loader, D: BinaryDecoder> Driver<C, L, D> {
    pub fn new(compiler: C, loader: L, decoder: D, artifact: impl Into<PathBuf>) -> Self {
        Self {
            env: Environment::default(),
            compiler,
            loader,
            decoder,
            artifact: artifact.into(),
            dirty: false,
            loaded: false,
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Take the environment out of a finished driver.
    pub fn into_env(mut self) -> Environment {
        std::mem::take(&mut self.env)
    }

    /// Parse and evaluate a whole script.
    pub fn run_script(&mut self, source: &str) -> Result<ScriptStats, ScriptError> {
        let script = parse_script(source)?;
        let mut stats = ScriptStats::default();
        for command in &script.commands {
            self.run_command(command, &mut stats)?;
        }
        Ok(stats)
    }

    fn run_command(&mut self, command: &Command, stats: &mut ScriptStats) -> Result<(), ScriptError> {
        let line = command.line();
        match command {
            Command::Module { name, module, .. } => {
                let parsed = self.build_module(module, name.as_deref())?;
                self.commit_module(parsed, name.as_deref())?;
                stats.modules += 1;
            }

            Command::Register {
                as_name, module_name, ..
            } => {
                self.env.register(as_name, module_name.as_deref())?;
                stats.registers += 1;
            }

            Command::Action { action, .. } => {
                self.run_action(action)?;
                stats.actions += 1;
            }

            Command::AssertReturn { action, expected, .. } => {
                let result = self.run_action(action)?;
                match (expected, &result) {
                    (None, None) => {}
                    (Some(want), Some(got)) if want.bits_eq(got) => {}
                    (want, got) => {
                        return Err(assert_failure(
                            line,
                            format!("expected {}, got {}", fmt_opt(want.as_ref()), fmt_opt(got.as_ref())),
                        ));
                    }
                }
                stats.assertions += 1;
            }

            Command::AssertReturnCanonicalNan { action, .. } => {
                let result = self.run_action(action)?;
                match result {
                    Some(v) if v.is_canonical_nan() => {}
                    other => {
                        return Err(assert_failure(
                            line,
                            format!("expected canonical NaN, got {}", fmt_opt(other.as_ref())),
                        ));
                    }
                }
                stats.assertions += 1;
            }

            Command::AssertReturnArithmeticNan { action, .. } => {
                let result = self.run_action(action)?;
                match result {
                    Some(v) if v.is_arithmetic_nan() => {}
                    other => {
                        return Err(assert_failure(
                            line,
                            format!("expected arithmetic NaN, got {}", fmt_opt(other.as_ref())),
                        ));
                    }
                }
                stats.assertions += 1;
            }

            Command::AssertTrap { action, .. } => match self.run_action(action) {
                Err(ScriptError::Trap) => stats.assertions += 1,
                Err(other) => return Err(other),
                Ok(result) => {
                    return Err(assert_failure(
                        line,
                        format!("expected trap, got {}", fmt_opt(result.as_ref())),
                    ));
                }
            },

            Command::AssertModuleTrap { module, .. } => {
                let parsed = self.build_module(module, None)?;
                self.commit_module(parsed, None)?;
                match self.ensure_artifact() {
                    Err(ScriptError::Trap) => stats.assertions += 1,
                    Err(other) => return Err(other),
                    Ok(()) => {
                        return Err(assert_failure(line, "expected trap during instantiation"));
                    }
                }
            }

            Command::AssertMalformed { module, .. } => match self.build_module(module, None) {
                Err(ScriptError::Malformed(_)) => stats.assertions += 1,
                Err(other) => return Err(other),
                Ok(_) => {
                    return Err(assert_failure(line, "module parsed but was expected to be malformed"));
                }
            },

            Command::AssertInvalid { module, .. } => {
                let parsed = self
                    .build_module(module, None)
                    .map_err(|e| assert_failure(line, format!("module failed to parse: {}", e)))?;
                // Validate against a throwaway copy of the environment so
                // the rejected module never joins the real one.
                let mut candidate = self.env.clone();
                candidate.add_module(parsed, None)?;
                if self.compiler.validate(&candidate) == 0 {
                    return Err(assert_failure(line, "module validated but was expected to be invalid"));
                }
                stats.assertions += 1;
            }

            Command::AssertUnlinkable { module, .. } => {
                let parsed = self
                    .build_module(module, None)
                    .map_err(|e| assert_failure(line, format!("module failed to parse: {}", e)))?;
                let mut candidate = self.env.clone();
                candidate.add_module(parsed, None)?;
                if self.compiler.validate(&candidate) > 0 {
                    return Err(assert_failure(line, "module failed validation, expected a link failure"));
                }
                let linked = match self.compiler.compile(&candidate, &self.artifact) {
                    Err(_) => false,
                    Ok(()) => {
                        let loaded = catch_faults(|| self.loader.load(&self.artifact)).unwrap_or(false);
                        self.loader.unload();
                        loaded
                    }
                };
                // The scratch compile clobbered the real artifact.
                self.loaded = false;
                self.dirty = true;
                if linked {
                    return Err(assert_failure(line, "module linked but was expected to be unlinkable"));
                }
                stats.assertions += 1;
            }

            Command::AssertExhaustion { .. } => return Err(ScriptError::Unsupported("assert_exhaustion")),

            Command::Skipped { .. } => stats.skipped += 1,
        }
        Ok(())
    }

    /// Materialise a script module body into a module record.
    fn build_module(&self, module: &ScriptModule, script_name: Option<&str>) -> Result<Module, ScriptError> {
        match module {
            ScriptModule::Text(text) => wat::parse(text).map_err(|e| ScriptError::Malformed(e.to_string())),
            ScriptModule::Quote(text) => {
                let wrapped = if text.trim_start().starts_with("(module") {
                    text.clone()
                } else {
                    format!("(module {})", text)
                };
                wat::parse(&wrapped).map_err(|e| ScriptError::Malformed(e.to_string()))
            }
            ScriptModule::Binary(bytes) => self
                .decoder
                .decode(bytes, script_name)
                .map_err(ScriptError::Malformed),
        }
    }

    /// Add a module to the environment and invalidate the artifact.
    fn commit_module(&mut self, module: Module, name: Option<&str>) -> Result<usize, ScriptError> {
        let idx = self.env.add_module(module, name)?;
        debug!("module {} committed, artifact invalidated", idx);
        self.dirty = true;
        if self.loaded {
            self.loader.unload();
            self.loaded = false;
        }
        Ok(idx)
    }

    /// Validate, compile, and load on demand.
    fn ensure_artifact(&mut self) -> Result<(), ScriptError> {
        if self.loaded && !self.dirty {
            return Ok(());
        }

        let errors = self.compiler.validate(&self.env);
        if errors > 0 {
            return Err(ScriptError::Invalid(errors));
        }
        self.compiler
            .compile(&self.env, &self.artifact)
            .map_err(ScriptError::Compile)?;
        debug!(
            "compiled {} module(s) to {}",
            self.env.modules.len(),
            self.artifact.display()
        );

        // Loading runs the artifact's initialisers (including any start
        // function); a fault there is a trap during instantiation.
        let loaded = catch_faults(|| self.loader.load(&self.artifact)).map_err(|_| ScriptError::Trap)?;
        if !loaded {
            return Err(ScriptError::InitFailure);
        }
        self.loaded = true;
        self.dirty = false;
        Ok(())
    }

    /// Execute an action, returning its (optional) result value.
    fn run_action(&mut self, action: &Action) -> Result<Option<Value>, ScriptError> {
        self.ensure_artifact()?;

        match action {
            Action::Invoke { module, name, args } => {
                let (symbol, sig) = {
                    let target = self.env.action_target(module)?;
                    let export = target
                        .find_export(name)
                        .ok_or_else(|| ScriptError::UnknownExport(name.clone()))?;
                    let ExportDesc::Function(func_idx) = export.desc else {
                        return Err(ScriptError::UnknownExport(format!("{} is not a function", name)));
                    };
                    let sig = target
                        .func_sig(func_idx)
                        .ok_or_else(|| ScriptError::SignatureMismatch(format!("function {} has no type", func_idx)))?
                        .clone();
                    (mangle(target.name.as_deref().unwrap_or(""), name), sig)
                };

                if args.len() != sig.params.len() {
                    return Err(ScriptError::SignatureMismatch(format!(
                        "{} takes {} argument(s), got {}",
                        name,
                        sig.params.len(),
                        args.len()
                    )));
                }
                for (i, (arg, param)) in args.iter().zip(&sig.params).enumerate() {
                    if arg.ty() != *param {
                        return Err(ScriptError::SignatureMismatch(format!(
                            "argument {} of {}: expected {}, got {}",
                            i, name, param, arg
                        )));
                    }
                }

                let ptr = self
                    .loader
                    .lookup(&symbol)
                    .ok_or_else(|| ScriptError::UnknownExport(symbol.clone()))?;

                catch_faults(|| unsafe { dispatch(ptr, &sig, args) }).map_err(|_| ScriptError::Trap)?
            }

            Action::Get { module, name } => {
                let (symbol, value_type) = {
                    let target = self.env.action_target(module)?;
                    let export = target
                        .find_export(name)
                        .ok_or_else(|| ScriptError::UnknownExport(name.clone()))?;
                    let ExportDesc::Global(global_idx) = export.desc else {
                        return Err(ScriptError::UnknownExport(format!("{} is not a global", name)));
                    };
                    let ty = target
                        .global_type(global_idx)
                        .ok_or_else(|| ScriptError::UnknownExport(format!("global {} has no type", global_idx)))?;
                    (mangle(target.name.as_deref().unwrap_or(""), name), ty.value_type)
                };

                let ptr = self
                    .loader
                    .lookup(&symbol)
                    .ok_or_else(|| ScriptError::UnknownExport(symbol.clone()))?;

                let value =
                    catch_faults(|| unsafe { read_global(ptr, value_type) }).map_err(|_| ScriptError::Trap)?;
                Ok(Some(value))
            }
        }
    }
}

impl<C: Compiler, L: Loader, D: BinaryDecoder> Drop for Driver<C, L, D> {
    fn drop(&mut self) {
        if self.loaded {
            self.loader.unload();
        }
    }
}

fn fmt_opt(v: Option<&Value>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "nothing".to_string(),
    }
}

// ============================================================================
// Dispatch
// ============================================================================

macro_rules! native_ty {
    (I32) => { i32 };
    (I64) => { i64 };
    (F32) => { f32 };
    (F64) => { f64 };
}

macro_rules! arg_at {
    ($args:expr, $i:tt, I32) => {
        match $args[$i] {
            Value::I32(v) => v,
            _ => unreachable!(),
        }
    };
    ($args:expr, $i:tt, I64) => {
        match $args[$i] {
            Value::I64(v) => v,
            _ => unreachable!(),
        }
    };
    ($args:expr, $i:tt, F32) => {
        match $args[$i] {
            Value::F32(v) => v,
            _ => unreachable!(),
        }
    };
    ($args:expr, $i:tt, F64) => {
        match $args[$i] {
            Value::F64(v) => v,
            _ => unreachable!(),
        }
    };
}

/// One strongly-typed call: transmute to the exact `extern "C"` shape and
/// pass each argument from its own slot.
macro_rules! call_shape {
    ($ptr:expr, $args:expr, ($($p:ident @ $i:tt),*)) => {{
        let f: unsafe extern "C" fn($(native_ty!($p)),*) = std::mem::transmute($ptr);
        f($(arg_at!($args, $i, $p)),*);
        Ok(None)
    }};
    ($ptr:expr, $args:expr, ($($p:ident @ $i:tt),*) -> I32) => {{
        let f: unsafe extern "C" fn($(native_ty!($p)),*) -> i32 = std::mem::transmute($ptr);
        Ok(Some(Value::I32(f($(arg_at!($args, $i, $p)),*))))
    }};
    ($ptr:expr, $args:expr, ($($p:ident @ $i:tt),*) -> I64) => {{
        let f: unsafe extern "C" fn($(native_ty!($p)),*) -> i64 = std::mem::transmute($ptr);
        Ok(Some(Value::I64(f($(arg_at!($args, $i, $p)),*))))
    }};
    ($ptr:expr, $args:expr, ($($p:ident @ $i:tt),*) -> F32) => {{
        let f: unsafe extern "C" fn($(native_ty!($p)),*) -> f32 = std::mem::transmute($ptr);
        Ok(Some(Value::F32(f($(arg_at!($args, $i, $p)),*))))
    }};
    ($ptr:expr, $args:expr, ($($p:ident @ $i:tt),*) -> F64) => {{
        let f: unsafe extern "C" fn($(native_ty!($p)),*) -> f64 = std::mem::transmute($ptr);
        Ok(Some(Value::F64(f($(arg_at!($args, $i, $p)),*))))
    }};
}

/// Select the call shape for a signature and perform the call.
///
/// Covers every nullary, unary, and binary combination over the four value
/// types, for each result type and for void. Arguments are already
/// type-checked against the signature.
///
/// # Safety
///
/// `ptr` must point at a function with exactly the ABI the signature
/// describes; the caller wraps the call in the fault guard.
unsafe fn dispatch(ptr: *const (), sig: &FuncSig, args: &[Value]) -> Result<Option<Value>, ScriptError> {
    use ValueType as T;
    let ret = sig.results.first().copied();
    unsafe {
        match (ret, sig.params.as_slice()) {
            // Void results
            (None, []) => call_shape!(ptr, args, ()),
            (None, [T::I32]) => call_shape!(ptr, args, (I32 @ 0)),
            (None, [T::I64]) => call_shape!(ptr, args, (I64 @ 0)),
            (None, [T::F32]) => call_shape!(ptr, args, (F32 @ 0)),
            (None, [T::F64]) => call_shape!(ptr, args, (F64 @ 0)),
            (None, [T::I32, T::I32]) => call_shape!(ptr, args, (I32 @ 0, I32 @ 1)),
            (None, [T::I32, T::I64]) => call_shape!(ptr, args, (I32 @ 0, I64 @ 1)),
            (None, [T::I32, T::F32]) => call_shape!(ptr, args, (I32 @ 0, F32 @ 1)),
            (None, [T::I32, T::F64]) => call_shape!(ptr, args, (I32 @ 0, F64 @ 1)),
            (None, [T::I64, T::I32]) => call_shape!(ptr, args, (I64 @ 0, I32 @ 1)),
            (None, [T::I64, T::I64]) => call_shape!(ptr, args, (I64 @ 0, I64 @ 1)),
            (None, [T::I64, T::F32]) => call_shape!(ptr, args, (I64 @ 0, F32 @ 1)),
            (None, [T::I64, T::F64]) => call_shape!(ptr, args, (I64 @ 0, F64 @ 1)),
            (None, [T::F32, T::I32]) => call_shape!(ptr, args, (F32 @ 0, I32 @ 1)),
            (None, [T::F32, T::I64]) => call_shape!(ptr, args, (F32 @ 0, I64 @ 1)),
            (None, [T::F32, T::F32]) => call_shape!(ptr, args, (F32 @ 0, F32 @ 1)),
            (None, [T::F32, T::F64]) => call_shape!(ptr, args, (F32 @ 0, F64 @ 1)),
            (None, [T::F64, T::I32]) => call_shape!(ptr, args, (F64 @ 0, I32 @ 1)),
            (None, [T::F64, T::I64]) => call_shape!(ptr, args, (F64 @ 0, I64 @ 1)),
            (None, [T::F64, T::F32]) => call_shape!(ptr, args, (F64 @ 0, F32 @ 1)),
            (None, [T::F64, T::F64]) => call_shape!(ptr, args, (F64 @ 0, F64 @ 1)),

            // i32 results
            (Some(T::I32), []) => call_shape!(ptr, args, () -> I32),
            (Some(T::I32), [T::I32]) => call_shape!(ptr, args, (I32 @ 0) -> I32),
            (Some(T::I32), [T::I64]) => call_shape!(ptr, args, (I64 @ 0) -> I32),
            (Some(T::I32), [T::F32]) => call_shape!(ptr, args, (F32 @ 0) -> I32),
            (Some(T::I32), [T::F64]) => call_shape!(ptr, args, (F64 @ 0) -> I32),
            (Some(T::I32), [T::I32, T::I32]) => call_shape!(ptr, args, (I32 @ 0, I32 @ 1) -> I32),
            (Some(T::I32), [T::I32, T::I64]) => call_shape!(ptr, args, (I32 @ 0, I64 @ 1) -> I32),
            (Some(T::I32), [T::I32, T::F32]) => call_shape!(ptr, args, (I32 @ 0, F32 @ 1) -> I32),
            (Some(T::I32), [T::I32, T::F64]) => call_shape!(ptr, args, (I32 @ 0, F64 @ 1) -> I32),
            (Some(T::I32), [T::I64, T::I32]) => call_shape!(ptr, args, (I64 @ 0, I32 @ 1) -> I32),
            (Some(T::I32), [T::I64, T::I64]) => call_shape!(ptr, args, (I64 @ 0, I64 @ 1) -> I32),
            (Some(T::I32), [T::I64, T::F32]) => call_shape!(ptr, args, (I64 @ 0, F32 @ 1) -> I32),
            (Some(T::I32), [T::I64, T::F64]) => call_shape!(ptr, args, (I64 @ 0, F64 @ 1) -> I32),
            (Some(T::I32), [T::F32, T::I32]) => call_shape!(ptr, args, (F32 @ 0, I32 @ 1) -> I32),
            (Some(T::I32), [T::F32, T::I64]) => call_shape!(ptr, args, (F32 @ 0, I64 @ 1) -> I32),
            (Some(T::I32), [T::F32, T::F32]) => call_shape!(ptr, args, (F32 @ 0, F32 @ 1) -> I32),
            (Some(T::I32), [T::F32, T::F64]) => call_shape!(ptr, args, (F32 @ 0, F64 @ 1) -> I32),
            (Some(T::I32), [T::F64, T::I32]) => call_shape!(ptr, args, (F64 @ 0, I32 @ 1) -> I32),
            (Some(T::I32), [T::F64, T::I64]) => call_shape!(ptr, args, (F64 @ 0, I64 @ 1) -> I32),
            (Some(T::I32), [T::F64, T::F32]) => call_shape!(ptr, args, (F64 @ 0, F32 @ 1) -> I32),
            (Some(T::I32), [T::F64, T::F64]) => call_shape!(ptr, args, (F64 @ 0, F64 @ 1) -> I32),

            // i64 results
            (Some(T::I64), []) => call_shape!(ptr, args, () -> I64),
            (Some(T::I64), [T::I32]) => call_shape!(ptr, args, (I32 @ 0) -> I64),
            (Some(T::I64), [T::I64]) => call_shape!(ptr, args, (I64 @ 0) -> I64),
            (Some(T::I64), [T::F32]) => call_shape!(ptr, args, (F32 @ 0) -> I64),
            (Some(T::I64), [T::F64]) => call_shape!(ptr, args, (F64 @ 0) -> I64),
            (Some(T::I64), [T::I32, T::I32]) => call_shape!(ptr, args, (I32 @ 0, I32 @ 1) -> I64),
            (Some(T::I64), [T::I32, T::I64]) => call_shape!(ptr, args, (I32 @ 0, I64 @ 1) -> I64),
            (Some(T::I64), [T::I32, T::F32]) => call_shape!(ptr, args, (I32 @ 0, F32 @ 1) -> I64),
            (Some(T::I64), [T::I32, T::F64]) => call_shape!(ptr, args, (I32 @ 0, F64 @ 1) -> I64),
            (Some(T::I64), [T::I64, T::I32]) => call_shape!(ptr, args, (I64 @ 0, I32 @ 1) -> I64),
            (Some(T::I64), [T::I64, T::I64]) => call_shape!(ptr, args, (I64 @ 0, I64 @ 1) -> I64),
            (Some(T::I64), [T::I64, T::F32]) => call_shape!(ptr, args, (I64 @ 0, F32 @ 1) -> I64),
            (Some(T::I64), [T::I64, T::F64]) => call_shape!(ptr, args, (I64 @ 0, F64 @ 1) -> I64),
            (Some(T::I64), [T::F32, T::I32]) => call_shape!(ptr, args, (F32 @ 0, I32 @ 1) -> I64),
            (Some(T::I64), [T::F32, T::I64]) => call_shape!(ptr, args, (F32 @ 0, I64 @ 1) -> I64),
            (Some(T::I64), [T::F32, T::F32]) => call_shape!(ptr, args, (F32 @ 0, F32 @ 1) -> I64),
            (Some(T::I64), [T::F32, T::F64]) => call_shape!(ptr, args, (F32 @ 0, F64 @ 1) -> I64),
            (Some(T::I64), [T::F64, T::I32]) => call_shape!(ptr, args, (F64 @ 0, I32 @ 1) -> I64),
            (Some(T::I64), [T::F64, T::I64]) => call_shape!(ptr, args, (F64 @ 0, I64 @ 1) -> I64),
            (Some(T::I64), [T::F64, T::F32]) => call_shape!(ptr, args, (F64 @ 0, F32 @ 1) -> I64),
            (Some(T::I64), [T::F64, T::F64]) => call_shape!(ptr, args, (F64 @ 0, F64 @ 1) -> I64),

            // f32 results
            (Some(T::F32), []) => call_shape!(ptr, args, () -> F32),
            (Some(T::F32), [T::I32]) => call_shape!(ptr, args, (I32 @ 0) -> F32),
            (Some(T::F32), [T::I64]) => call_shape!(ptr, args, (I64 @ 0) -> F32),
            (Some(T::F32), [T::F32]) => call_shape!(ptr, args, (F32 @ 0) -> F32),
            (Some(T::F32), [T::F64]) => call_shape!(ptr, args, (F64 @ 0) -> F32),
            (Some(T::F32), [T::I32, T::I32]) => call_shape!(ptr, args, (I32 @ 0, I32 @ 1) -> F32),
            (Some(T::F32), [T::I32, T::I64]) => call_shape!(ptr, args, (I32 @ 0, I64 @ 1) -> F32),
            (Some(T::F32), [T::I32, T::F32]) => call_shape!(ptr, args, (I32 @ 0, F32 @ 1) -> F32),
            (Some(T::F32), [T::I32, T::F64]) => call_shape!(ptr, args, (I32 @ 0, F64 @ 1) -> F32),
            (Some(T::F32), [T::I64, T::I32]) => call_shape!(ptr, args, (I64 @ 0, I32 @ 1) -> F32),
            (Some(T::F32), [T::I64, T::I64]) => call_shape!(ptr, args, (I64 @ 0, I64 @ 1) -> F32),
            (Some(T::F32), [T::I64, T::F32]) => call_shape!(ptr, args, (I64 @ 0, F32 @ 1) -> F32),
            (Some(T::F32), [T::I64, T::F64]) => call_shape!(ptr, args, (I64 @ 0, F64 @ 1) -> F32),
            (Some(T::F32), [T::F32, T::I32]) => call_shape!(ptr, args, (F32 @ 0, I32 @ 1) -> F32),
            (Some(T::F32), [T::F32, T::I64]) => call_shape!(ptr, args, (F32 @ 0, I64 @ 1) -> F32),
            (Some(T::F32), [T::F32, T::F32]) => call_shape!(ptr, args, (F32 @ 0, F32 @ 1) -> F32),
            (Some(T::F32), [T::F32, T::F64]) => call_shape!(ptr, args, (F32 @ 0, F64 @ 1) -> F32),
            (Some(T::F32), [T::F64, T::I32]) => call_shape!(ptr, args, (F64 @ 0, I32 @ 1) -> F32),
            (Some(T::F32), [T::F64, T::I64]) => call_shape!(ptr, args, (F64 @ 0, I64 @ 1) -> F32),
            (Some(T::F32), [T::F64, T::F32]) => call_shape!(ptr, args, (F64 @ 0, F32 @ 1) -> F32),
            (Some(T::F32), [T::F64, T::F64]) => call_shape!(ptr, args, (F64 @ 0, F64 @ 1) -> F32),

            // f64 results
            (Some(T::F64), []) => call_shape!(ptr, args, () -> F64),
            (Some(T::F64), [T::I32]) => call_shape!(ptr, args, (I32 @ 0) -> F64),
            (Some(T::F64), [T::I64]) => call_shape!(ptr, args, (I64 @ 0) -> F64),
            (Some(T::F64), [T::F32]) => call_shape!(ptr, args, (F32 @ 0) -> F64),
            (Some(T::F64), [T::F64]) => call_shape!(ptr, args, (F64 @ 0) -> F64),
            (Some(T::F64), [T::I32, T::I32]) => call_shape!(ptr, args, (I32 @ 0, I32 @ 1) -> F64),
            (Some(T::F64), [T::I32, T::I64]) => call_shape!(ptr, args, (I32 @ 0, I64 @ 1) -> F64),
            (Some(T::F64), [T::I32, T::F32]) => call_shape!(ptr, args, (I32 @ 0, F32 @ 1) -> F64),
            (Some(T::F64), [T::I32, T::F64]) => call_shape!(ptr, args, (I32 @ 0, F64 @ 1) -> F64),
            (Some(T::F64), [T::I64, T::I32]) => call_shape!(ptr, args, (I64 @ 0, I32 @ 1) -> F64),
            (Some(T::F64), [T::I64, T::I64]) => call_shape!(ptr, args, (I64 @ 0, I64 @ 1) -> F64),
            (Some(T::F64), [T::I64, T::F32]) => call_shape!(ptr, args, (I64 @ 0, F32 @ 1) -> F64),
            (Some(T::F64), [T::I64, T::F64]) => call_shape!(ptr, args, (I64 @ 0, F64 @ 1) -> F64),
            (Some(T::F64), [T::F32, T::I32]) => call_shape!(ptr, args, (F32 @ 0, I32 @ 1) -> F64),
            (Some(T::F64), [T::F32, T::I64]) => call_shape!(ptr, args, (F32 @ 0, I64 @ 1) -> F64),
            (Some(T::F64), [T::F32, T::F32]) => call_shape!(ptr, args, (F32 @ 0, F32 @ 1) -> F64),
            (Some(T::F64), [T::F32, T::F64]) => call_shape!(ptr, args, (F32 @ 0, F64 @ 1) -> F64),
            (Some(T::F64), [T::F64, T::I32]) => call_shape!(ptr, args, (F64 @ 0, I32 @ 1) -> F64),
            (Some(T::F64), [T::F64, T::I64]) => call_shape!(ptr, args, (F64 @ 0, I64 @ 1) -> F64),
            (Some(T::F64), [T::F64, T::F32]) => call_shape!(ptr, args, (F64 @ 0, F32 @ 1) -> F64),
            (Some(T::F64), [T::F64, T::F64]) => call_shape!(ptr, args, (F64 @ 0, F64 @ 1) -> F64),

            _ => Err(ScriptError::SignatureMismatch(format!("no call shape for {}", sig))),
        }
    }
}

/// Read an exported global through its data symbol.
///
/// # Safety
///
/// `ptr` must point at a live global of the given type in the loaded
/// artifact.
unsafe fn read_global(ptr: *const (), ty: ValueType) -> Value {
    unsafe {
        match ty {
            ValueType::I32 => Value::I32(*(ptr as *const i32)),
            ValueType::I64 => Value::I64(*(ptr as *const i64)),
            ValueType::F32 => Value::F32(*(ptr as *const f32)),
            ValueType::F64 => Value::F64(*(ptr as *const f64)),
        }
    }
}
