// File: src/context.rs
//
// Embedding surface: `Context` owns one isolated heap, global
// object, and budget — there is no process-wide mutable state because
// nothing here reaches outside the `Context` it's called through. Host code
// drives a sandboxed script through `eval`/`get`/`set` and reads typed
// errors back out, never touching `Vm`/`Compiler` directly.

use crate::compiler::compile_program;
use crate::errors::{EngineError, ErrorKind, SourceLocation};
use crate::heap::Heap;
use crate::value::Value;
use crate::vm::{Limits, Thrown, Vm};
use std::time::Duration;

/// What `Context::eval` raises. `Syntax`/`Memory`/`Time` wrap the engine's
/// own `EngineError`; `Runtime` is a value the script `throw`-ed that
/// nothing caught, carried as its host-native conversion plus the
/// `Error.name: message` string and source location the VM stamped onto it.
#[derive(Debug, Clone)]
pub enum EvalError {
    Syntax(EngineError),
    Runtime { value: Value, message: String, location: Option<SourceLocation> },
    MemoryLimit(EngineError),
    TimeLimit(EngineError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EvalError::Syntax(e) => write!(f, "{}", e),
            EvalError::MemoryLimit(e) => write!(f, "{}", e),
            EvalError::TimeLimit(e) => write!(f, "{}", e),
            EvalError::Runtime { message, location, .. } => match location {
                Some(loc) => write!(f, "Uncaught {} at {}", message, loc),
                None => write!(f, "Uncaught {}", message),
            },
        }
    }
}

impl std::error::Error for EvalError {}

impl From<EngineError> for EvalError {
    fn from(e: EngineError) -> Self {
        match e.kind {
            ErrorKind::MemoryLimitError => EvalError::MemoryLimit(e),
            ErrorKind::TimeLimitError => EvalError::TimeLimit(e),
            _ => EvalError::Syntax(e),
        }
    }
}

/// Optional limits a `Context` is constructed with. `None`
/// fields mean unbounded, matching `Heap`/`Limits`' own defaults.
#[derive(Default, Clone, Copy)]
pub struct ContextOptions {
    pub memory_limit: Option<usize>,
    pub time_limit: Option<Duration>,
}

pub struct Context {
    vm: Vm,
}

impl Context {
    pub fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    pub fn with_options(opts: ContextOptions) -> Self {
        let heap = Heap::new(opts.memory_limit);
        let limits = Limits { max_instructions: None, max_duration: opts.time_limit, poll_interval: 100 };
        let mut vm = Vm::new(heap, limits);
        crate::builtins::install(&mut vm);
        Self { vm }
    }

    /// Installs a sink for the `console.log`/`print` builtin. Without one,
    /// prints are silently dropped.
    pub fn set_print_sink(&mut self, sink: impl FnMut(&str) + 'static) {
        self.vm.print_sink = Some(Box::new(sink));
    }

    /// Installs a host poll callback queried periodically during execution;
    /// a truthy return aborts with an uncatchable `TimeLimitError`.
    pub fn set_poll_callback(&mut self, poll: impl FnMut() -> bool + 'static) {
        self.vm.poll = Some(Box::new(poll));
    }

    /// Compiles and runs `source` as top-level code, returning the
    /// completion value (the value of the last expression statement).
    pub fn eval(&mut self, source: &str) -> Result<Value, EvalError> {
        let proto = compile_program(source).map_err(EvalError::Syntax)?;
        match self.vm.run_script(proto) {
            Ok(v) => Ok(v),
            Err(thrown) => Err(self.describe_thrown(thrown)),
        }
    }

    fn describe_thrown(&self, thrown: Thrown) -> EvalError {
        if let Thrown::Engine(e) = &thrown {
            match e.kind {
                ErrorKind::MemoryLimitError => return EvalError::MemoryLimit(e.clone()),
                ErrorKind::TimeLimitError => return EvalError::TimeLimit(e.clone()),
                _ => {}
            }
        }
        let (value, message, location) = self.vm.describe_uncaught(thrown);
        EvalError::Runtime { value, message, location }
    }

    /// Reads a property of the global object.
    pub fn get(&mut self, name: &str) -> Value {
        self.vm.get_prop(&Value::Object(self.vm.globals.clone()), name).unwrap_or(Value::Undefined)
    }

    /// Writes a host value as a global binding. Host
    /// primitives convert by value; a `Value::Object` wrapping a callable
    /// becomes a global function re-entering host code synchronously on
    /// every call.
    pub fn set(&mut self, name: &str, value: Value) {
        let globals = Value::Object(self.vm.globals.clone());
        let _ = self.vm.set_prop(&globals, name, value);
    }

    /// Calls a value retrieved from the context (e.g. via `get`) as a
    /// function, re-entering the VM synchronously.
    pub fn call(&mut self, callee: Value, this: Value, args: &[Value]) -> Result<Value, EvalError> {
        self.vm.call_value(callee, this, args).map_err(|t| self.describe_thrown(t))
    }

    /// Converts a script value to a UTF-8 `String` the way `String(v)`
    /// would (used by hosts that just want display text, not a `Value`).
    pub fn to_display_string(&self, v: &Value) -> String {
        crate::builtins::to_display_string(v)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
