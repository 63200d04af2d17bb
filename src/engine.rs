//! The tree-walking evaluator.
//!
//! Evaluation of a node produces a [`Flow`]: a plain value, or a
//! non-local result (`return`, `break N`, `continue N`) that propagates
//! upward until the construct that consumes it. Errors never unwind:
//! each diagnostic is recorded in the engine's sink and the faulty
//! position evaluates to nil.

use crate::arena::{Arena, Buffer};
use crate::ast::{BinaryExpr, CallExpr, Expr, FnDef, ForExpr, InfixOp, PrefixOp, SwitchExpr};
use crate::error::{Diagnostics, Severity};
use crate::module::{Module, ModuleKind, ModuleRegistry, ParseMode};
use crate::scope::Env;
use crate::symbol::{Symbol, SymbolTable};
use crate::token::Span;
use crate::value::{values_equal, Value, ValueMap};
use crate::{Identifier, FLOAT, INT};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

/// The result of evaluating one node.
///
/// `break` and `continue` carry the output accumulated so far by the
/// blocks they tear through, so breaking out of a loop mid-pass keeps the
/// text already produced; each block appends its partial buffer on the way
/// up. `return` deliberately carries only its value; it propagates past
/// blocks without stringification.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Flow {
    Value(Value),
    /// `return` bubbling towards the nearest function call.
    Return(Value),
    /// `break N` bubbling through N loops, with the output gathered so
    /// far.
    Break(u32, String),
    /// `continue N` bubbling towards the Nth enclosing loop, with the
    /// output gathered so far.
    Continue(u32, String),
}

impl Flow {
    /// Reduce to the carried value; at the top level non-value flows
    /// reduce to what they carry.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(value) | Self::Return(value) => value,
            Self::Break(_, out) | Self::Continue(_, out) => Value::string(out),
        }
    }
}

/// Propagate non-value flows, yielding the value otherwise.
macro_rules! value_of {
    ($flow:expr) => {
        match $flow {
            Flow::Value(value) => value,
            other => return other,
        }
    };
}

/// A script function value: shared definition plus the captured
/// environment snapshot.
///
/// The environment is a fresh one populated from the definition's free
/// variables at creation time. It has no parent pointer back to the
/// creator, so later mutations there never leak in, and no cycle between
/// environment and closure can form.
pub struct Closure {
    pub(crate) def: Rc<FnDef>,
    pub(crate) env: Env,
    pub(crate) module: Option<Rc<Module>>,
}

/// An error recorded by a native function through its context.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeError {
    pub message: String,
    /// Index of the offending argument, when one can be named. The
    /// evaluator attributes the diagnostic to that argument's source node.
    pub arg: Option<usize>,
    pub severity: Severity,
}

type NativeFnPtr = Box<dyn Fn(&mut NativeContext<'_>, &[Value]) -> Value>;

/// A host function callable from scripts.
pub struct NativeFn {
    name: Identifier,
    min_args: usize,
    max_args: Option<usize>,
    func: NativeFnPtr,
}

impl NativeFn {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({}, {}..{:?})", self.name, self.min_args, self.max_args)
    }
}

/// Call context handed to native functions: access to the engine and the
/// calling environment, plus the per-call error slot.
pub struct NativeContext<'a> {
    engine: &'a Engine,
    env: &'a Env,
    error: Option<NativeError>,
}

impl<'a> NativeContext<'a> {
    #[must_use]
    pub fn engine(&self) -> &Engine {
        self.engine
    }

    #[must_use]
    pub fn env(&self) -> &Env {
        self.env
    }

    #[must_use]
    pub fn symbols(&self) -> SymbolTable {
        self.engine.symbols()
    }

    /// Record a failure for this call. The call yields nil to the script,
    /// which continues. Only the first error per call is kept.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error =
                Some(NativeError { message: message.into(), arg: None, severity: Severity::Error });
        }
    }

    /// Record a failure attributed to argument `arg` (0-based).
    pub fn fail_arg(&mut self, arg: usize, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(NativeError {
                message: message.into(),
                arg: Some(arg),
                severity: Severity::Error,
            });
        }
    }

    /// Record a warning; the call's return value still stands.
    pub fn warn(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(NativeError {
                message: message.into(),
                arg: None,
                severity: Severity::Warning,
            });
        }
    }
}

/// Per-evaluation state: the module being evaluated (for diagnostic
/// attribution), the loop nesting depth, and the suppress counter.
pub(crate) struct EvalState {
    module: Option<Rc<Module>>,
    loop_depth: u32,
    suppress: u32,
}

impl EvalState {
    fn new(module: Option<Rc<Module>>) -> Self {
        Self { module, loop_depth: 0, suppress: 0 }
    }
}

/// The engine: symbol table, module registry, native registry and the
/// diagnostics sink, shared across one whole build.
pub struct Engine {
    symbols: SymbolTable,
    modules: ModuleRegistry,
    natives: IndexMap<Symbol, Rc<NativeFn>, ahash::RandomState>,
    diags: RefCell<Diagnostics>,
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable::new(),
            modules: ModuleRegistry::new(),
            natives: IndexMap::default(),
            diags: RefCell::new(Diagnostics::new()),
        }
    }

    /// A handle to the engine's symbol table.
    #[must_use]
    pub fn symbols(&self) -> SymbolTable {
        self.symbols.clone()
    }

    /// Register a host function under `name`. Calls outside
    /// `min_args..=max_args` (no upper bound when `None`) are diagnosed
    /// without invoking the function.
    pub fn register_native(
        &mut self,
        name: &str,
        min_args: usize,
        max_args: Option<usize>,
        func: impl Fn(&mut NativeContext<'_>, &[Value]) -> Value + 'static,
    ) {
        let sym = self.symbols.intern(name);
        self.natives.insert(
            sym,
            Rc::new(NativeFn { name: name.into(), min_args, max_args, func: Box::new(func) }),
        );
    }

    // ---- diagnostics ----

    /// A snapshot of the diagnostics recorded so far.
    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        self.diags.borrow().clone()
    }

    /// Drain the diagnostics sink.
    pub fn take_diagnostics(&self) -> Diagnostics {
        let mut sink = self.diags.borrow_mut();
        let list = sink.take();
        let mut out = Diagnostics::new();
        for d in list {
            out.push(d);
        }
        out
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diags.borrow().has_errors()
    }

    /// Record an error that has no source position (host-side problems,
    /// malformed site-map entries and the like).
    pub fn report_error(&self, message: impl Into<String>) {
        self.diags.borrow_mut().error(message, None, Span::default());
    }

    /// Record a warning with no source position.
    pub fn report_warning(&self, message: impl Into<String>) {
        self.diags.borrow_mut().warning(message, None, Span::default());
    }

    fn module_path(st: &EvalState) -> Option<PathBuf> {
        st.module.as_ref().and_then(|m| m.path().map(Path::to_path_buf))
    }

    pub(crate) fn error_at(&self, st: &EvalState, span: Span, message: impl Into<String>) {
        self.diags.borrow_mut().error(message, Self::module_path(st), span);
    }

    pub(crate) fn warn_at(&self, st: &EvalState, span: Span, message: impl Into<String>) {
        self.diags.borrow_mut().warning(message, Self::module_path(st), span);
    }

    fn report_module_errors(&self, module: &Module) {
        let mut sink = self.diags.borrow_mut();
        for err in module.errors() {
            sink.error(err.kind().to_string(), module.path().map(Path::to_path_buf), err.span());
        }
    }

    // ---- compiling and evaluating ----

    /// Compile source into an anonymous module. Parse errors are reported
    /// to the sink and flagged on the module.
    #[must_use]
    pub fn compile(&self, source: &str, mode: ParseMode) -> Rc<Module> {
        let module = Rc::new(Module::compile(None, source.to_string(), mode, &self.symbols));
        self.report_module_errors(&module);
        module
    }

    /// Register a host-provided module under `path` without touching the
    /// filesystem; later loads of that path are served from the registry.
    /// Parse errors in the source are reported here, once.
    pub fn register_module(&self, path: &Path, source: &str, mode: ParseMode) -> Rc<Module> {
        let module =
            Rc::new(Module::system(path.to_path_buf(), source.to_string(), mode, &self.symbols));
        self.report_module_errors(&module);
        self.modules.insert(module.clone());
        module
    }

    /// Load (or fetch from cache) the module at `path`. Parse errors in
    /// file modules are re-reported on every request; a system module's
    /// source is the host's own, reported once at registration. I/O
    /// failures are diagnosed and yield `None`.
    pub fn load_module(&self, path: &Path, mode: ParseMode) -> Option<Rc<Module>> {
        match self.modules.load(path, mode, &self.symbols) {
            Ok(module) => {
                if module.kind() != ModuleKind::System {
                    self.report_module_errors(&module);
                }
                Some(module)
            }
            Err(err) => {
                self.diags.borrow_mut().error(
                    format!("cannot load module {}: {err}", path.display()),
                    Some(path.to_path_buf()),
                    Span::default(),
                );
                None
            }
        }
    }

    /// Evaluate a module's tree against `env`. A module with parse errors
    /// is skipped entirely and yields nil.
    #[must_use]
    pub fn eval_module(&self, module: &Rc<Module>, env: &Env) -> Value {
        if module.parse_error() {
            debug!(path = ?module.path(), "skipping module with parse errors");
            return Value::Nil;
        }
        debug!(path = ?module.path(), "evaluating module");
        let mut st = EvalState::new(Some(module.clone()));
        self.eval_expr(module.root(), env, &mut st).into_value()
    }

    /// Render template source in a fresh arena and environment.
    #[must_use]
    pub fn render_str(&self, source: &str) -> String {
        let arena = Arena::new();
        let env = arena.root_env();
        self.render_str_with_env(source, &env)
    }

    /// Render template source against an existing environment.
    #[must_use]
    pub fn render_str_with_env(&self, source: &str, env: &Env) -> String {
        let module = self.compile(source, ParseMode::Template);
        self.eval_module(&module, env).render_to_string()
    }

    /// Evaluate script source in a fresh arena and environment, returning
    /// the result value.
    #[must_use]
    pub fn eval_script_str(&self, source: &str) -> Value {
        let arena = Arena::new();
        let env = arena.root_env();
        let module = self.compile(source, ParseMode::Script);
        self.eval_module(&module, &env)
    }

    // ---- site-map boundary helpers ----

    /// Read a global binding by name.
    #[must_use]
    pub fn get_global(&self, env: &Env, name: &str) -> Option<Value> {
        env.lookup(&self.symbols.intern(name))
    }

    /// Write a global binding by name.
    pub fn set_global(&self, env: &Env, name: &str, value: Value) {
        env.define(self.symbols.intern(name), value);
    }

    // ---- the walker ----

    pub(crate) fn eval_expr(&self, expr: &Expr, env: &Env, st: &mut EvalState) -> Flow {
        match expr {
            Expr::Int(n, _) => Flow::Value(Value::Int(*n)),
            Expr::Float(x, _) => Flow::Value(Value::Float(*x)),
            Expr::Str(s, _) => Flow::Value(Value::Str(s.clone())),
            Expr::SymbolLit(s, _) => Flow::Value(Value::Symbol(s.clone())),
            Expr::Variable(name, span) => Flow::Value(self.lookup_variable(name, *span, env, st)),
            Expr::Interp(parts, _) => {
                let mut buf = Buffer::new();
                for part in parts.iter() {
                    let value = value_of!(self.eval_expr(part, env, st));
                    value.render(&mut buf);
                }
                Flow::Value(Value::string(buf.into_string()))
            }
            Expr::Array(items, _) | Expr::Tuple(items, _) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(value_of!(self.eval_expr(item, env, st)));
                }
                Flow::Value(Value::array(out))
            }
            Expr::Object(entries, _) => {
                let mut map = ValueMap::new();
                for (key_expr, value_expr) in entries.iter() {
                    let key = value_of!(self.eval_expr(key_expr, env, st));
                    let value = value_of!(self.eval_expr(value_expr, env, st));
                    map.insert(key, value);
                }
                Flow::Value(Value::object(map))
            }
            Expr::Call(call, span) => self.eval_call(call, *span, env, st),
            Expr::Index(bin, span) => self.eval_index(bin, *span, env, st),
            Expr::Dot(target, name, span) => self.eval_dot(target, name, *span, env, st),
            Expr::Prefix(op, inner, span) => {
                let value = value_of!(self.eval_expr(inner, env, st));
                Flow::Value(self.apply_prefix(*op, value, *span, st))
            }
            Expr::Infix(op, bin, span) => self.eval_infix(*op, bin, *span, env, st),
            Expr::Fn(def, _) => {
                // Snapshot only the free variables the body references.
                let capture = env.detached();
                for name in &def.free_vars {
                    if let Some(value) = env.lookup(name) {
                        capture.define(name.clone(), value);
                    }
                }
                Flow::Value(Value::Closure(Rc::new(Closure {
                    def: def.clone(),
                    env: capture,
                    module: st.module.clone(),
                })))
            }
            Expr::If(branch, _) => {
                let cond = value_of!(self.eval_expr(&branch.cond, env, st));
                if cond.is_truthy() {
                    self.eval_expr(&branch.then_branch, env, st)
                } else if let Some(alt) = &branch.else_branch {
                    self.eval_expr(alt, env, st)
                } else {
                    Flow::Value(Value::Nil)
                }
            }
            Expr::For(f, span) => self.eval_for(f, *span, env, st),
            Expr::Switch(sw, _) => self.eval_switch(sw, env, st),
            Expr::Export(name, value, _) => {
                let value = value_of!(self.eval_expr(value, env, st));
                env.define(name.clone(), value);
                env.add_export(name.clone());
                Flow::Value(Value::Nil)
            }
            Expr::Assign(op, bin, span) => self.eval_assign(*op, bin, *span, env, st),
            Expr::Block(items, _) => {
                let mut buf = Buffer::new();
                for item in items {
                    match self.eval_expr(item, env, st) {
                        Flow::Value(value) => value.render(&mut buf),
                        Flow::Return(value) => return Flow::Return(value),
                        Flow::Break(n, partial) => {
                            buf.push_str(&partial);
                            return Flow::Break(n, buf.into_string());
                        }
                        Flow::Continue(n, partial) => {
                            buf.push_str(&partial);
                            return Flow::Continue(n, buf.into_string());
                        }
                    }
                }
                Flow::Value(Value::string(buf.into_string()))
            }
            Expr::Suppress(inner, _) => {
                st.suppress += 1;
                let result = self.eval_expr(inner, env, st);
                st.suppress -= 1;
                result
            }
            Expr::Return(value, _) => {
                let value = match value {
                    Some(expr) => value_of!(self.eval_expr(expr, env, st)),
                    None => Value::Nil,
                };
                Flow::Return(value)
            }
            Expr::Break(n, span) => self.eval_break_continue(*n, *span, true, st),
            Expr::Continue(n, span) => self.eval_break_continue(*n, *span, false, st),
        }
    }

    fn lookup_variable(&self, name: &Symbol, span: Span, env: &Env, st: &EvalState) -> Value {
        if let Some(value) = env.lookup(name) {
            return value;
        }
        if let Some(native) = self.natives.get(name) {
            return Value::Native(native.clone());
        }
        if st.suppress == 0 {
            self.error_at(st, span, format!("undefined variable: {name}"));
        }
        Value::Nil
    }

    fn eval_call(&self, call: &CallExpr, span: Span, env: &Env, st: &mut EvalState) -> Flow {
        let target = value_of!(self.eval_expr(&call.target, env, st));
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(value_of!(self.eval_expr(arg, env, st)));
        }
        match target {
            Value::Native(f) => {
                if args.len() < f.min_args {
                    self.error_at(
                        st,
                        span,
                        format!(
                            "too few arguments to {}: expected at least {}, found {}",
                            f.name(),
                            f.min_args,
                            args.len()
                        ),
                    );
                    return Flow::Value(Value::Nil);
                }
                if let Some(max) = f.max_args {
                    if args.len() > max {
                        self.error_at(
                            st,
                            span,
                            format!(
                                "too many arguments to {}: expected at most {}, found {}",
                                f.name(),
                                max,
                                args.len()
                            ),
                        );
                        return Flow::Value(Value::Nil);
                    }
                }
                // The error slot starts clear for every dispatch.
                let mut ctx = NativeContext { engine: self, env, error: None };
                let result = (f.func)(&mut ctx, &args);
                match ctx.error {
                    None => Flow::Value(result),
                    Some(err) => {
                        let err_span = err
                            .arg
                            .and_then(|i| call.args.get(i))
                            .map_or(span, Expr::span);
                        match err.severity {
                            Severity::Error => {
                                self.error_at(st, err_span, err.message);
                                Flow::Value(Value::Nil)
                            }
                            Severity::Warning => {
                                self.warn_at(st, err_span, err.message);
                                Flow::Value(result)
                            }
                        }
                    }
                }
            }
            Value::Closure(closure) => self.call_closure(&closure, args),
            other => {
                self.error_at(st, span, format!("not a function: {}", other.type_name()));
                Flow::Value(Value::Nil)
            }
        }
    }

    /// Invoke a closure: bind parameters in a child of the captured
    /// environment (missing arguments are nil, extras ignored) and run the
    /// body in fresh evaluation state. `return` is consumed here.
    pub(crate) fn call_closure(&self, closure: &Closure, args: Vec<Value>) -> Flow {
        let call_env = closure.env.child();
        for (i, param) in closure.def.params.iter().enumerate() {
            call_env.define(param.clone(), args.get(i).cloned().unwrap_or(Value::Nil));
        }
        let mut st = EvalState::new(closure.module.clone());
        match self.eval_expr(&closure.def.body, &call_env, &mut st) {
            Flow::Value(value) | Flow::Return(value) => Flow::Value(value),
            // Loose break/continue were already diagnosed at the statement.
            Flow::Break(..) | Flow::Continue(..) => Flow::Value(Value::Nil),
        }
    }

    fn eval_index(&self, bin: &BinaryExpr, span: Span, env: &Env, st: &mut EvalState) -> Flow {
        let target = value_of!(self.eval_expr(&bin.lhs, env, st));
        let index = value_of!(self.eval_expr(&bin.rhs, env, st));
        let value = match (target, index) {
            (Value::Array(arr), Value::Int(i)) => {
                let items = arr.borrow();
                match usize::try_from(i).ok().and_then(|i| items.get(i)) {
                    Some(value) => value.clone(),
                    None => {
                        if st.suppress == 0 {
                            self.error_at(st, span, format!("undefined array index: {i}"));
                        }
                        Value::Nil
                    }
                }
            }
            (Value::Array(_), other) => {
                self.error_at(
                    st,
                    span,
                    format!("array index must be an int, found {}", other.type_name()),
                );
                Value::Nil
            }
            (Value::Str(s), Value::Int(i)) => {
                match usize::try_from(i).ok().and_then(|i| s.as_bytes().get(i)) {
                    Some(byte) => Value::Int(INT::from(*byte)),
                    None => {
                        if st.suppress == 0 {
                            self.error_at(st, span, format!("undefined string index: {i}"));
                        }
                        Value::Nil
                    }
                }
            }
            (Value::Str(_), other) => {
                self.error_at(
                    st,
                    span,
                    format!("string index must be an int, found {}", other.type_name()),
                );
                Value::Nil
            }
            // A missing object key is nil, not an error.
            (Value::Object(obj), key) => obj.borrow().get(&key).cloned().unwrap_or(Value::Nil),
            (other, _) => {
                self.error_at(st, span, format!("cannot index {}", other.type_name()));
                Value::Nil
            }
        };
        Flow::Value(value)
    }

    fn eval_dot(
        &self,
        target: &Expr,
        name: &Symbol,
        span: Span,
        env: &Env,
        st: &mut EvalState,
    ) -> Flow {
        let target = value_of!(self.eval_expr(target, env, st));
        let value = match target {
            Value::Object(obj) => {
                let key = Value::Symbol(name.clone());
                match obj.borrow().get(&key) {
                    Some(value) => value.clone(),
                    None => {
                        if st.suppress == 0 {
                            self.error_at(st, span, format!("undefined object property: {name}"));
                        }
                        Value::Nil
                    }
                }
            }
            other => {
                self.error_at(
                    st,
                    span,
                    format!("cannot access property '{name}' of {}", other.type_name()),
                );
                Value::Nil
            }
        };
        Flow::Value(value)
    }

    fn apply_prefix(&self, op: PrefixOp, value: Value, span: Span, st: &EvalState) -> Value {
        match op {
            PrefixOp::Not => Value::Bool(!value.is_truthy()),
            PrefixOp::Negate => match value {
                Value::Int(n) => Value::Int(n.wrapping_neg()),
                Value::Float(x) => Value::Float(-x),
                other => {
                    self.error_at(st, span, format!("cannot negate {}", other.type_name()));
                    Value::Nil
                }
            },
        }
    }

    fn eval_infix(
        &self,
        op: InfixOp,
        bin: &BinaryExpr,
        span: Span,
        env: &Env,
        st: &mut EvalState,
    ) -> Flow {
        match op {
            // `and` yields the right operand when the left is truthy, nil
            // otherwise; `or` yields the left when truthy, else the right.
            InfixOp::And => {
                let lhs = value_of!(self.eval_expr(&bin.lhs, env, st));
                if lhs.is_truthy() {
                    self.eval_expr(&bin.rhs, env, st)
                } else {
                    Flow::Value(Value::Nil)
                }
            }
            InfixOp::Or => {
                let lhs = value_of!(self.eval_expr(&bin.lhs, env, st));
                if lhs.is_truthy() {
                    Flow::Value(lhs)
                } else {
                    self.eval_expr(&bin.rhs, env, st)
                }
            }
            _ => {
                let lhs = value_of!(self.eval_expr(&bin.lhs, env, st));
                let rhs = value_of!(self.eval_expr(&bin.rhs, env, st));
                Flow::Value(self.apply_binary(op, lhs, rhs, span, st))
            }
        }
    }

    fn apply_binary(&self, op: InfixOp, lhs: Value, rhs: Value, span: Span, st: &EvalState) -> Value {
        use InfixOp::*;

        match op {
            Add => match (lhs, rhs) {
                // Strings concatenate with anything, via stringification.
                (lhs @ Value::Str(_), rhs) | (lhs, rhs @ Value::Str(_)) => {
                    let mut buf = Buffer::new();
                    lhs.render(&mut buf);
                    rhs.render(&mut buf);
                    Value::string(buf.into_string())
                }
                (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(b)),
                (Value::Int(a), Value::Float(b)) => Value::Float(a as FLOAT + b),
                (Value::Float(a), Value::Int(b)) => Value::Float(a + b as FLOAT),
                (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
                (Value::Array(a), Value::Array(b)) => {
                    let mut items = a.borrow().clone();
                    items.extend(b.borrow().iter().cloned());
                    Value::array(items)
                }
                // Merged objects: left entries keep their positions, right
                // values shadow.
                (Value::Object(a), Value::Object(b)) => {
                    let mut map = a.borrow().clone();
                    for (k, v) in b.borrow().iter() {
                        map.insert(k.clone(), v.clone());
                    }
                    Value::object(map)
                }
                (lhs, rhs) => self.binary_type_error(op, &lhs, &rhs, span, st),
            },
            Subtract => match (lhs, rhs) {
                (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_sub(b)),
                (Value::Int(a), Value::Float(b)) => Value::Float(a as FLOAT - b),
                (Value::Float(a), Value::Int(b)) => Value::Float(a - b as FLOAT),
                (Value::Float(a), Value::Float(b)) => Value::Float(a - b),
                (lhs, rhs) => self.binary_type_error(op, &lhs, &rhs, span, st),
            },
            Multiply => match (lhs, rhs) {
                (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_mul(b)),
                (Value::Int(a), Value::Float(b)) => Value::Float(a as FLOAT * b),
                (Value::Float(a), Value::Int(b)) => Value::Float(a * b as FLOAT),
                (Value::Float(a), Value::Float(b)) => Value::Float(a * b),
                (lhs, rhs) => self.binary_type_error(op, &lhs, &rhs, span, st),
            },
            Divide => match (lhs, rhs) {
                (Value::Int(_), Value::Int(0)) => {
                    self.error_at(st, span, "division by zero");
                    Value::Nil
                }
                // Truncating division; `i64::MIN / -1` wraps.
                (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_div(b)),
                (Value::Int(a), Value::Float(b)) => Value::Float(a as FLOAT / b),
                (Value::Float(a), Value::Int(b)) => Value::Float(a / b as FLOAT),
                (Value::Float(a), Value::Float(b)) => Value::Float(a / b),
                (lhs, rhs) => self.binary_type_error(op, &lhs, &rhs, span, st),
            },
            Remainder => match (lhs, rhs) {
                (Value::Int(_), Value::Int(0)) => {
                    self.error_at(st, span, "division by zero");
                    Value::Nil
                }
                (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_rem(b)),
                (lhs, rhs) => self.binary_type_error(op, &lhs, &rhs, span, st),
            },
            Less | LessEq | Greater | GreaterEq => {
                let ordering = match (&lhs, &rhs) {
                    (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
                    (Value::Int(a), Value::Float(b)) => (*a as FLOAT).partial_cmp(b),
                    (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as FLOAT)),
                    (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
                    (Value::Time(a), Value::Time(b)) => a.partial_cmp(b),
                    _ => return self.binary_type_error(op, &lhs, &rhs, span, st),
                };
                match ordering {
                    Some(ordering) => Value::Bool(match op {
                        Less => ordering.is_lt(),
                        LessEq => ordering.is_le(),
                        Greater => ordering.is_gt(),
                        GreaterEq => ordering.is_ge(),
                        _ => unreachable!(),
                    }),
                    // NaN compares as nothing.
                    None => Value::Bool(false),
                }
            }
            Equals => Value::Bool(values_equal(&lhs, &rhs)),
            NotEquals => Value::Bool(!values_equal(&lhs, &rhs)),
            And | Or => unreachable!("short-circuit operators are handled in eval_infix"),
        }
    }

    fn binary_type_error(
        &self,
        op: InfixOp,
        lhs: &Value,
        rhs: &Value,
        span: Span,
        st: &EvalState,
    ) -> Value {
        self.error_at(
            st,
            span,
            format!(
                "invalid operands for '{}': {} and {}",
                op.symbol(),
                lhs.type_name(),
                rhs.type_name()
            ),
        );
        Value::Nil
    }

    /// `for` over arrays (element, key = index), objects (value, key =
    /// key) or strings (byte as int, key = index). Each pass's stringified
    /// body output is appended to the loop buffer; the loop yields the
    /// buffer as one string. An empty collection yields the `else` branch
    /// instead.
    fn eval_for(&self, f: &ForExpr, span: Span, env: &Env, st: &mut EvalState) -> Flow {
        let iterable = value_of!(self.eval_expr(&f.iterable, env, st));

        let is_empty = match &iterable {
            Value::Array(arr) => arr.borrow().is_empty(),
            Value::Object(obj) => obj.borrow().is_empty(),
            Value::Str(s) => s.is_empty(),
            other => {
                self.error_at(st, span, format!("cannot iterate over {}", other.type_name()));
                return Flow::Value(Value::Nil);
            }
        };
        if is_empty {
            return match &f.alt {
                Some(alt) => self.eval_expr(alt, env, st),
                None => Flow::Value(Value::Nil),
            };
        }

        enum Outcome {
            Finished,
            Return(Value),
            PropagateBreak(u32),
            PropagateContinue(u32),
        }

        st.loop_depth += 1;
        let mut buf = Buffer::new();
        let mut outcome = Outcome::Finished;
        let mut i = 0usize;
        loop {
            // Re-borrow per pass: the body may mutate the collection.
            let pair = match &iterable {
                Value::Array(arr) => {
                    arr.borrow().get(i).map(|v| (Value::Int(i as INT), v.clone()))
                }
                Value::Object(obj) => {
                    obj.borrow().get_index(i).map(|(k, v)| (k.clone(), v.clone()))
                }
                Value::Str(s) => {
                    s.as_bytes().get(i).map(|b| (Value::Int(i as INT), Value::Int(INT::from(*b))))
                }
                _ => unreachable!("checked above"),
            };
            let Some((key, value)) = pair else { break };

            if let Some(key_name) = &f.key {
                env.define(key_name.clone(), key);
            }
            env.define(f.binding.clone(), value);

            match self.eval_expr(&f.body, env, st) {
                Flow::Value(value) => value.render(&mut buf),
                Flow::Return(value) => {
                    outcome = Outcome::Return(value);
                    break;
                }
                Flow::Break(1, partial) => {
                    buf.push_str(&partial);
                    break;
                }
                Flow::Break(n, partial) => {
                    buf.push_str(&partial);
                    outcome = Outcome::PropagateBreak(n - 1);
                    break;
                }
                Flow::Continue(1, partial) => buf.push_str(&partial),
                Flow::Continue(n, partial) => {
                    buf.push_str(&partial);
                    outcome = Outcome::PropagateContinue(n - 1);
                    break;
                }
            }
            i += 1;
        }
        st.loop_depth -= 1;

        match outcome {
            Outcome::Finished => Flow::Value(Value::string(buf.into_string())),
            Outcome::Return(value) => Flow::Return(value),
            Outcome::PropagateBreak(n) => Flow::Break(n, buf.into_string()),
            Outcome::PropagateContinue(n) => Flow::Continue(n, buf.into_string()),
        }
    }

    fn eval_switch(&self, sw: &SwitchExpr, env: &Env, st: &mut EvalState) -> Flow {
        let scrutinee = value_of!(self.eval_expr(&sw.scrutinee, env, st));
        for (key_expr, body) in &sw.cases {
            let key = value_of!(self.eval_expr(key_expr, env, st));
            if values_equal(&scrutinee, &key) {
                return self.eval_expr(body, env, st);
            }
        }
        match &sw.default {
            Some(default) => self.eval_expr(default, env, st),
            None => Flow::Value(Value::Nil),
        }
    }

    fn eval_assign(
        &self,
        op: Option<InfixOp>,
        bin: &BinaryExpr,
        span: Span,
        env: &Env,
        st: &mut EvalState,
    ) -> Flow {
        let rhs = value_of!(self.eval_expr(&bin.rhs, env, st));
        match &bin.lhs {
            Expr::Variable(name, name_span) => {
                let value = match op {
                    None => rhs,
                    Some(op) => {
                        let current = self.lookup_variable(name, *name_span, env, st);
                        self.apply_binary(op, current, rhs, span, st)
                    }
                };
                env.assign(name.clone(), value);
            }
            Expr::Dot(target, name, _) => {
                let target = value_of!(self.eval_expr(target, env, st));
                match target {
                    Value::Object(obj) => {
                        let key = Value::Symbol(name.clone());
                        let value = match op {
                            None => rhs,
                            Some(op) => {
                                let current = match obj.borrow().get(&key) {
                                    Some(value) => value.clone(),
                                    None => {
                                        if st.suppress == 0 {
                                            self.error_at(
                                                st,
                                                span,
                                                format!("undefined object property: {name}"),
                                            );
                                        }
                                        Value::Nil
                                    }
                                };
                                self.apply_binary(op, current, rhs, span, st)
                            }
                        };
                        obj.borrow_mut().insert(key, value);
                    }
                    other => {
                        self.error_at(
                            st,
                            span,
                            format!("cannot access property '{name}' of {}", other.type_name()),
                        );
                    }
                }
            }
            Expr::Index(target, _) => {
                let container = value_of!(self.eval_expr(&target.lhs, env, st));
                let index = value_of!(self.eval_expr(&target.rhs, env, st));
                match (container, index) {
                    (Value::Array(arr), Value::Int(i)) => {
                        let len = arr.borrow().len();
                        match usize::try_from(i).ok().filter(|&i| i < len) {
                            Some(i) => {
                                let value = match op {
                                    None => rhs,
                                    Some(op) => {
                                        let current = arr.borrow()[i].clone();
                                        self.apply_binary(op, current, rhs, span, st)
                                    }
                                };
                                arr.borrow_mut()[i] = value;
                            }
                            None => {
                                if st.suppress == 0 {
                                    self.error_at(st, span, format!("undefined array index: {i}"));
                                }
                            }
                        }
                    }
                    (Value::Array(_), other) => {
                        self.error_at(
                            st,
                            span,
                            format!("array index must be an int, found {}", other.type_name()),
                        );
                    }
                    (Value::Object(obj), key) => {
                        let value = match op {
                            None => rhs,
                            Some(op) => {
                                let current = obj.borrow().get(&key).cloned().unwrap_or(Value::Nil);
                                self.apply_binary(op, current, rhs, span, st)
                            }
                        };
                        obj.borrow_mut().insert(key, value);
                    }
                    (other, _) => {
                        self.error_at(st, span, format!("cannot index {}", other.type_name()));
                    }
                }
            }
            other => {
                self.error_at(st, other.span(), "cannot assign to this expression");
            }
        }
        Flow::Value(Value::Nil)
    }

    fn eval_break_continue(&self, n: u32, span: Span, is_break: bool, st: &mut EvalState) -> Flow {
        let kw = if is_break { "break" } else { "continue" };
        if st.loop_depth == 0 {
            self.error_at(st, span, format!("{kw} outside of a loop"));
            return Flow::Value(Value::Nil);
        }
        let mut level = n.max(1);
        if level > st.loop_depth {
            self.warn_at(
                st,
                span,
                format!("{kw} level {level} exceeds loop depth {}", st.loop_depth),
            );
            level = st.loop_depth;
        }
        if is_break {
            Flow::Break(level, String::new())
        } else {
            Flow::Continue(level, String::new())
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Engine({} natives, {} diagnostics)",
            self.natives.len(),
            self.diags.borrow().len()
        )
    }
}
