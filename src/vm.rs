// File: src/vm.rs
//
// Stack-based bytecode virtual machine: the operand stack,
// call frames, opcode dispatch for the families bytecode.rs defines,
// exception-table-driven unwinding (catch/finally via the gosub/ret
// trampoline the compiler emits), the two iteration protocols, and
// cooperative budget polling.
//
// Exceptions: the compiler always gives a `try` a concrete `catch_pc`
// landing pad, synthesising one that re-throws after running `finally` when
// the source had no `catch` clause. That means the VM's own unwinding logic
// never needs to track "run finally, then resume whatever was pending" —
// it just truncates the stack, pushes the thrown value, and jumps to
// `catch_pc`. `finally_pc` on `ExceptionEntry` is therefore bookkeeping for
// the compiler, not something this module reads.

use crate::bytecode::{Constant, FunctionProto, Instr, UpvalueSource};
use crate::errors::{EngineError, ErrorKind, SourceLocation};
use crate::heap::{cost, Heap};
use crate::value::{
    js_string, js_string_to_utf8, new_cell, Callable, Cell, JsString, NativeFn, ObjectData,
    ObjectKind, ObjectRef, OrderedMap, PropertySlot, Value,
};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// What propagates on a non-local exit. `Value` covers the source language's
/// `throw <anything>`; `Engine` covers errors the engine itself raises.
#[derive(Debug, Clone)]
pub enum Thrown {
    Engine(EngineError),
    Value(Value),
}

impl Thrown {
    pub fn type_error(msg: impl Into<String>) -> Self {
        Thrown::Engine(EngineError::type_error(msg))
    }

    pub fn reference_error(name: &str) -> Self {
        Thrown::Engine(EngineError::reference_error(name))
    }

    pub fn range_error(msg: impl Into<String>) -> Self {
        Thrown::Engine(EngineError::range_error(msg))
    }

    pub fn catchable(&self) -> bool {
        match self {
            Thrown::Engine(e) => e.kind.catchable(),
            Thrown::Value(_) => true,
        }
    }
}

/// Internal state of the hidden iterator object `ForInStart`/`ForOfStart`
/// push onto the operand stack.
#[derive(Debug)]
pub enum IterState {
    ForIn { keys: Vec<Rc<str>>, idx: usize },
    ForOfArray { elements: Vec<Value>, idx: usize },
    /// For-of over a string iterates Unicode code points, not UTF-16 code
    /// units — unlike `.length`/indexing, matching the
    /// source language's iteration protocol for strings.
    ForOfString { chars: Vec<char>, idx: usize },
}

impl IterState {
    /// Advances the iterator, returning `(value, done)`.
    fn next(&mut self) -> (Value, bool) {
        match self {
            IterState::ForIn { keys, idx } => {
                if *idx >= keys.len() {
                    (Value::Undefined, true)
                } else {
                    let k = keys[*idx].clone();
                    *idx += 1;
                    (Value::String(js_string(&k)), false)
                }
            }
            IterState::ForOfArray { elements, idx } => {
                if *idx >= elements.len() {
                    (Value::Undefined, true)
                } else {
                    let v = elements[*idx].clone();
                    *idx += 1;
                    (v, false)
                }
            }
            IterState::ForOfString { chars, idx } => {
                if *idx >= chars.len() {
                    (Value::Undefined, true)
                } else {
                    let c = chars[*idx];
                    *idx += 1;
                    (Value::string(&c.to_string()), false)
                }
            }
        }
    }
}

/// One active invocation. Locals (including parameters, which occupy the
/// first `param_count` slots) are boxed cells uniformly so that capturing a
/// local in a closure never needs a separate "closed over" transition.
struct CallFrame {
    proto: Rc<FunctionProto>,
    pc: usize,
    locals: Vec<Cell>,
    upvalues: Rc<Vec<Cell>>,
    this_value: Value,
    new_target: Value,
    arguments: Option<ObjectRef>,
    /// Operand-stack depth when this frame was entered; `Return` truncates
    /// the stack back to this point before pushing the result.
    stack_base: usize,
    /// Gosub return addresses for this frame's `finally` trampolines.
    gosub_stack: Vec<usize>,
}

/// Prototype objects the VM needs when it allocates built-in kinds of value
/// (array literals, thrown errors, regex literals, ...). Installed by
/// `builtins::install` before any user code runs.
#[derive(Default, Clone)]
pub struct Prototypes {
    pub object: Option<ObjectRef>,
    pub array: Option<ObjectRef>,
    pub function: Option<ObjectRef>,
    pub string: Option<ObjectRef>,
    pub number: Option<ObjectRef>,
    pub boolean: Option<ObjectRef>,
    pub regexp: Option<ObjectRef>,
    pub error: Option<ObjectRef>,
    pub type_error: Option<ObjectRef>,
    pub range_error: Option<ObjectRef>,
    pub reference_error: Option<ObjectRef>,
}

/// Cooperative execution limits. `None` means unbounded.
pub struct Limits {
    pub max_instructions: Option<u64>,
    pub max_duration: Option<Duration>,
    pub poll_interval: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_instructions: None, max_duration: None, poll_interval: 100 }
    }
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub globals: ObjectRef,
    pub heap: Heap,
    pub protos: Prototypes,
    limits: Limits,
    instr_count: u64,
    started_at: Option<Instant>,
    /// Host-supplied poll hook, called every `limits.poll_interval`
    /// instructions; returning `true` aborts execution with `TimeLimitError`.
    pub poll: Option<Box<dyn FnMut() -> bool>>,
    /// Sink for the `console.log`/`print` builtin.
    pub print_sink: Option<Box<dyn FnMut(&str)>>,
}

impl Vm {
    pub fn new(heap: Heap, limits: Limits) -> Self {
        let globals = ObjectData::plain(None).new_ref();
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            globals,
            heap,
            protos: Prototypes::default(),
            limits,
            instr_count: 0,
            started_at: None,
            poll: None,
            print_sink: None,
        }
    }

    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    /// Charges `bytes` against the configured memory budget, converting an
    /// exhausted budget into an uncatchable `Thrown::Engine(MemoryLimitError)`.
    pub(crate) fn charge(&mut self, bytes: usize) -> Result<(), Thrown> {
        self.heap.charge(bytes).map_err(Thrown::Engine)
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn peek(&self, depth_from_top: usize) -> Value {
        self.stack[self.stack.len() - 1 - depth_from_top].clone()
    }

    /// Runs `proto` as a top-level script (the implicit top-level
    /// function produced by `Context::eval`), with `this` bound to the
    /// global object and no arguments.
    pub fn run_script(&mut self, proto: Rc<FunctionProto>) -> Result<Value, Thrown> {
        let this = Value::Object(self.globals.clone());
        self.call_closure(proto, Rc::new(Vec::new()), this, Value::Undefined, &[])
    }

    pub fn call_value(&mut self, callee: Value, this: Value, args: &[Value]) -> Result<Value, Thrown> {
        let obj = match &callee {
            Value::Object(o) => o.clone(),
            _ => return Err(Thrown::type_error(format!("{} is not a function", callee.type_of()))),
        };
        let callable = obj.borrow().callable.clone();
        match callable {
            Some(Callable::Native(f)) => f(self, this, args),
            Some(Callable::Closure(proto, upvalues)) => {
                self.call_closure(proto, upvalues, this, Value::Undefined, args)
            }
            None => Err(Thrown::type_error("value is not callable")),
        }
    }

    pub fn construct_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, Thrown> {
        let obj = match &callee {
            Value::Object(o) => o.clone(),
            _ => return Err(Thrown::type_error(format!("{} is not a constructor", callee.type_of()))),
        };
        if !obj.borrow().constructible {
            return Err(Thrown::type_error("value is not a constructor"));
        }
        let proto_prop = self.get_prop(&callee, "prototype")?;
        let proto_obj = match proto_prop {
            Value::Object(p) => Some(p),
            _ => self.protos.object.clone(),
        };
        self.charge(cost::OBJECT_BASE)?;
        let instance = ObjectData::plain(proto_obj).new_ref();
        let this = Value::Object(instance.clone());
        let callable = obj.borrow().callable.clone();
        let result = match callable {
            Some(Callable::Native(f)) => f(self, this.clone(), args)?,
            Some(Callable::Closure(proto, upvalues)) => {
                self.call_closure(proto, upvalues, this.clone(), callee.clone(), args)?
            }
            None => return Err(Thrown::type_error("value is not a constructor")),
        };
        match result {
            Value::Object(_) => Ok(result),
            _ => Ok(this),
        }
    }

    fn call_closure(
        &mut self,
        proto: Rc<FunctionProto>,
        upvalues: Rc<Vec<Cell>>,
        this_value: Value,
        new_target: Value,
        args: &[Value],
    ) -> Result<Value, Thrown> {
        if self.frames.len() > 2000 {
            return Err(Thrown::range_error("maximum call stack size exceeded"));
        }
        self.charge(proto.local_count as usize * cost::CLOSURE_CELL)?;
        let mut locals = Vec::with_capacity(proto.local_count as usize);
        for i in 0..proto.local_count as usize {
            let v = if i < proto.param_count as usize { args.get(i).cloned().unwrap_or(Value::Undefined) } else { Value::Undefined };
            locals.push(new_cell(v));
        }
        let stack_base = self.stack.len();
        self.frames.push(CallFrame {
            proto,
            pc: 0,
            locals,
            upvalues,
            this_value,
            new_target,
            arguments: None,
            stack_base,
            gosub_stack: Vec::new(),
        });
        let result = self.run_frame(args);
        self.frames.pop();
        result
    }

    /// Executes instructions in the current (topmost) frame until it
    /// returns, throws uncatchably, or an internal `throw` is fully handled
    /// by a handler within this same frame (handlers in outer frames cause
    /// this call to return `Err` so the caller's own frame can search its
    /// table in turn).
    fn run_frame(&mut self, call_args: &[Value]) -> Result<Value, Thrown> {
        loop {
            match self.step(call_args) {
                StepResult::Continue => {}
                StepResult::Returned(v) => return Ok(v),
                StepResult::Thrown(t) => {
                    if let Some(v) = self.try_handle(&t) {
                        // handler found and installed in this frame; value already pushed.
                        let _ = v;
                        continue;
                    }
                    return Err(t);
                }
            }
        }
    }

    /// Looks for a handler for the current frame's faulting pc. On success,
    /// truncates the stack, pushes the catch value, repositions the frame's
    /// pc at `catch_pc`, and returns `Some(())`.
    fn try_handle(&mut self, thrown: &Thrown) -> Option<()> {
        if !thrown.catchable() {
            return None;
        }
        let frame = self.frames.last()?;
        let pc = frame.pc;
        let entry = *frame.proto.handler_for(pc)?;
        let catch_pc = entry.catch_pc?;
        let target_depth = frame.stack_base + entry.stack_depth as usize;
        self.stack.truncate(target_depth);
        let value = self.catch_value(thrown.clone());
        self.stack.push(value);
        let frame = self.frames.last_mut().unwrap();
        frame.pc = catch_pc as usize;
        Some(())
    }

    /// The value bound to a `catch` clause's parameter.
    fn catch_value(&self, thrown: Thrown) -> Value {
        match thrown {
            Thrown::Value(v) => v,
            Thrown::Engine(e) => self.make_error_object(&e),
        }
    }

    /// Converts a `Thrown` that reached the top of `run_script` with no
    /// remaining handler into `(value, display_string, location)` for
    /// `Context::eval` to report as a `RuntimeError` once no frame handles
    /// the throw.
    pub fn describe_uncaught(&self, thrown: Thrown) -> (Value, String, Option<SourceLocation>) {
        let value = self.catch_value(thrown);
        let message = match &value {
            Value::Object(o) if matches!(o.borrow().kind, ObjectKind::Error) => {
                let b = o.borrow();
                let name = match b.properties.get("name") {
                    Some(PropertySlot::Data(Value::String(s))) => js_string_to_utf8(s),
                    _ => "Error".to_string(),
                };
                let msg = match b.properties.get("message") {
                    Some(PropertySlot::Data(Value::String(s))) => js_string_to_utf8(s),
                    _ => String::new(),
                };
                format!("{}: {}", name, msg)
            }
            other => crate::builtins::to_display_string(other),
        };
        let location = if let Value::Object(o) = &value {
            let b = o.borrow();
            match (b.properties.get("lineNumber"), b.properties.get("columnNumber")) {
                (Some(PropertySlot::Data(Value::Number(l))), Some(PropertySlot::Data(Value::Number(c)))) => {
                    Some(SourceLocation::new(*l as u32, *c as u32))
                }
                _ => None,
            }
        } else {
            None
        };
        (value, message, location)
    }

    fn make_error_object(&self, e: &EngineError) -> Value {
        let proto = match e.kind {
            ErrorKind::TypeError => self.protos.type_error.clone(),
            ErrorKind::RangeError => self.protos.range_error.clone(),
            ErrorKind::ReferenceError => self.protos.reference_error.clone(),
            _ => self.protos.error.clone(),
        }
        .or_else(|| self.protos.error.clone());
        let mut data = ObjectData::plain(proto);
        data.kind = ObjectKind::Error;
        data.properties.insert(Rc::from("message"), PropertySlot::Data(Value::string(&e.message)));
        data.properties.insert(Rc::from("name"), PropertySlot::Data(Value::string(&e.kind.to_string())));
        let loc = if e.location != SourceLocation::unknown() { e.location } else { self.current_location() };
        if loc != SourceLocation::unknown() {
            data.properties.insert(Rc::from("lineNumber"), PropertySlot::Data(Value::Number(loc.line as f64)));
            data.properties.insert(Rc::from("columnNumber"), PropertySlot::Data(Value::Number(loc.column as f64)));
        }
        Value::Object(data.new_ref())
    }

    /// Writes `lineNumber`/`columnNumber` onto a thrown value's error object
    /// using the source map at the throw opcode's own pc.
    /// A value merely constructed (`new Error("x")`) and never thrown, or a
    /// non-error-shaped thrown value, is left untouched.
    fn stamp_throw_location(&self, v: Value, frame_idx: usize, pc: usize) -> Value {
        if let Value::Object(o) = &v {
            let is_error = matches!(o.borrow().kind, ObjectKind::Error);
            if is_error {
                if let Some((line, column)) = self.frames[frame_idx].proto.location_at(pc) {
                    let mut b = o.borrow_mut();
                    b.properties.insert(Rc::from("lineNumber"), PropertySlot::Data(Value::Number(line as f64)));
                    b.properties.insert(Rc::from("columnNumber"), PropertySlot::Data(Value::Number(column as f64)));
                }
            }
        }
        v
    }

    fn current_location(&self) -> SourceLocation {
        self.frames
            .last()
            .and_then(|f| f.proto.location_at(f.pc))
            .map(|(l, c)| SourceLocation::new(l, c))
            .unwrap_or_else(SourceLocation::unknown)
    }

    fn poll_budget(&mut self) -> Result<(), Thrown> {
        self.instr_count += 1;
        if self.instr_count % self.limits.poll_interval != 0 {
            return Ok(());
        }
        if let Some(max) = self.limits.max_instructions {
            if self.instr_count >= max {
                return Err(Thrown::Engine(EngineError::new(
                    ErrorKind::TimeLimitError,
                    "instruction budget exceeded",
                    self.current_location(),
                )));
            }
        }
        if let Some(max_dur) = self.limits.max_duration {
            let start = *self.started_at.get_or_insert_with(Instant::now);
            if start.elapsed() >= max_dur {
                return Err(Thrown::Engine(EngineError::new(
                    ErrorKind::TimeLimitError,
                    "time budget exceeded",
                    self.current_location(),
                )));
            }
        }
        if let Some(poll) = self.poll.as_mut() {
            if poll() {
                return Err(Thrown::Engine(EngineError::new(
                    ErrorKind::TimeLimitError,
                    "execution aborted by host",
                    self.current_location(),
                )));
            }
        }
        Ok(())
    }

    /// Executes a single instruction in the current frame.
    fn step(&mut self, call_args: &[Value]) -> StepResult {
        if let Err(t) = self.poll_budget() {
            return StepResult::Thrown(t);
        }
        let (instr, frame_idx) = {
            let frame = self.frames.last().unwrap();
            (frame.proto.instructions[frame.pc].clone(), self.frames.len() - 1)
        };
        self.frames[frame_idx].pc += 1;

        macro_rules! bail {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(t) => return StepResult::Thrown(t),
                }
            };
        }

        match instr {
            Instr::PushConst(i) => {
                let c = self.frames[frame_idx].proto.constants[i as usize].clone();
                let v = bail!(self.value_from_constant(&c));
                self.push(v);
            }
            Instr::PushI(i) => self.push(Value::Number(i as f64)),
            Instr::PushTrue => self.push(Value::Boolean(true)),
            Instr::PushFalse => self.push(Value::Boolean(false)),
            Instr::PushNull => self.push(Value::Null),
            Instr::PushUndef => self.push(Value::Undefined),
            Instr::Drop => {
                self.pop();
            }
            Instr::Dup => {
                let v = self.peek(0);
                self.push(v);
            }
            Instr::Dup1 => {
                let v = self.peek(1);
                self.push(v);
            }
            Instr::Dup2 => {
                let v = self.peek(2);
                self.push(v);
            }
            Instr::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            Instr::Rot3L => {
                let len = self.stack.len();
                self.stack[len - 3..].rotate_left(1);
            }
            Instr::Nip => {
                let top = self.pop();
                self.pop();
                self.push(top);
            }
            Instr::Perm3 => {
                let len = self.stack.len();
                self.stack[len - 3..].rotate_right(1);
            }
            Instr::Perm4 => {
                let len = self.stack.len();
                self.stack[len - 4..].rotate_right(1);
            }
            Instr::Insert2 => {
                let top = self.peek(0);
                let len = self.stack.len();
                self.stack.insert(len - 2, top);
            }
            Instr::Insert3 => {
                let top = self.peek(0);
                let len = self.stack.len();
                self.stack.insert(len - 3, top);
            }
            Instr::GetLoc(i) | Instr::GetArg(i) => {
                let v = self.frames[frame_idx].locals[i as usize].borrow().clone();
                self.push(v);
            }
            Instr::PutLoc(i) | Instr::PutArg(i) => {
                let v = self.pop();
                *self.frames[frame_idx].locals[i as usize].borrow_mut() = v;
            }
            Instr::GetVarRef(i) => {
                let v = self.frames[frame_idx].upvalues[i as usize].borrow().clone();
                self.push(v);
            }
            Instr::PutVarRef(i) => {
                let v = self.pop();
                *self.frames[frame_idx].upvalues[i as usize].borrow_mut() = v;
            }
            Instr::GetGlobal(i) => {
                let name = bail!(self.name_constant(frame_idx, i));
                let has = self.globals.borrow().properties.contains_key(&name);
                if !has {
                    return StepResult::Thrown(Thrown::reference_error(&name));
                }
                let v = self.globals.borrow().properties.get(&name).map(|s| match s {
                    PropertySlot::Data(v) => v.clone(),
                    PropertySlot::Accessor { .. } => Value::Undefined,
                });
                self.push(v.unwrap_or(Value::Undefined));
            }
            Instr::PutGlobal(i) => {
                let name = bail!(self.name_constant(frame_idx, i));
                let v = self.peek(0);
                self.globals.borrow_mut().properties.insert(Rc::from(name.as_str()), PropertySlot::Data(v));
            }
            Instr::DeclareGlobal(i) => {
                let name = bail!(self.name_constant(frame_idx, i));
                if !self.globals.borrow().properties.contains_key(&name) {
                    self.globals.borrow_mut().properties.insert(Rc::from(name.as_str()), PropertySlot::Data(Value::Undefined));
                }
            }
            Instr::GetField(i) => {
                let name = bail!(self.name_constant(frame_idx, i));
                let obj = self.pop();
                let v = bail!(self.get_prop(&obj, &name));
                self.push(v);
            }
            Instr::PutField(i) => {
                let name = bail!(self.name_constant(frame_idx, i));
                let v = self.pop();
                let obj = self.pop();
                if !self.has_own_prop(&obj, &name) {
                    bail!(self.charge(cost::PROPERTY_SLOT));
                }
                bail!(self.set_prop(&obj, &name, v.clone()));
                self.push(v);
            }
            Instr::DefineField(i) => {
                let name = bail!(self.name_constant(frame_idx, i));
                let v = self.pop();
                let obj = self.peek(0);
                if let Value::Object(o) = &obj {
                    bail!(self.charge(cost::PROPERTY_SLOT));
                    o.borrow_mut().properties.insert(Rc::from(name.as_str()), PropertySlot::Data(v));
                }
            }
            Instr::DefineGetter(i) => {
                let name = bail!(self.name_constant(frame_idx, i));
                let f = self.pop();
                let obj = self.peek(0);
                if let Value::Object(o) = &obj {
                    bail!(self.charge(cost::PROPERTY_SLOT));
                    let mut b = o.borrow_mut();
                    let existing = b.properties.get(&name).cloned();
                    let set = match existing {
                        Some(PropertySlot::Accessor { set, .. }) => set,
                        _ => None,
                    };
                    b.properties.insert(Rc::from(name.as_str()), PropertySlot::Accessor { get: Some(f), set });
                }
            }
            Instr::DefineSetter(i) => {
                let name = bail!(self.name_constant(frame_idx, i));
                let f = self.pop();
                let obj = self.peek(0);
                if let Value::Object(o) = &obj {
                    bail!(self.charge(cost::PROPERTY_SLOT));
                    let mut b = o.borrow_mut();
                    let existing = b.properties.get(&name).cloned();
                    let get = match existing {
                        Some(PropertySlot::Accessor { get, .. }) => get,
                        _ => None,
                    };
                    b.properties.insert(Rc::from(name.as_str()), PropertySlot::Accessor { get, set: Some(f) });
                }
            }
            Instr::GetArrayEl => {
                let key = self.pop();
                let obj = self.pop();
                let v = bail!(self.get_indexed(&obj, &key));
                self.push(v);
            }
            Instr::PutArrayEl => {
                let v = self.pop();
                let key = self.pop();
                let obj = self.pop();
                bail!(self.set_indexed(&obj, &key, v.clone()));
                self.push(v);
            }
            Instr::GetLength => {
                let obj = self.pop();
                let v = bail!(self.get_prop(&obj, "length"));
                self.push(v);
            }
            Instr::Goto(target) => self.frames[frame_idx].pc = target as usize,
            Instr::IfTrue(target) => {
                let v = self.pop();
                if v.to_bool() {
                    self.frames[frame_idx].pc = target as usize;
                }
            }
            Instr::IfFalse(target) => {
                let v = self.pop();
                if !v.to_bool() {
                    self.frames[frame_idx].pc = target as usize;
                }
            }
            Instr::Gosub(target) => {
                let ret = self.frames[frame_idx].pc;
                self.frames[frame_idx].gosub_stack.push(ret);
                self.frames[frame_idx].pc = target as usize;
            }
            Instr::Ret => {
                let ret = self.frames[frame_idx].gosub_stack.pop().expect("ret without matching gosub");
                self.frames[frame_idx].pc = ret;
            }
            Instr::Call(n) => {
                let result = bail!(self.do_call(n as usize, Value::Undefined));
                self.push(result);
            }
            Instr::CallMethod(n) => {
                let args = self.pop_n(n as usize);
                let callee = self.pop();
                let this = self.pop();
                let result = bail!(self.call_value(callee, this, &args));
                self.push(result);
            }
            Instr::CallConstructor(n) => {
                let args = self.pop_n(n as usize);
                let callee = self.pop();
                let result = bail!(self.construct_value(callee, &args));
                self.push(result);
            }
            Instr::Return => {
                let v = self.pop();
                let base = self.frames[frame_idx].stack_base;
                self.stack.truncate(base);
                return StepResult::Returned(v);
            }
            Instr::ReturnUndef => {
                let base = self.frames[frame_idx].stack_base;
                self.stack.truncate(base);
                return StepResult::Returned(Value::Undefined);
            }
            Instr::Throw => {
                let v = self.pop();
                let throw_pc = self.frames[frame_idx].pc - 1;
                let v = self.stamp_throw_location(v, frame_idx, throw_pc);
                return StepResult::Thrown(Thrown::Value(v));
            }
            Instr::ForInStart => {
                let obj = self.pop();
                let keys = self.enumerable_keys(&obj);
                let iter = ObjectData { kind: ObjectKind::Iterator(std::cell::RefCell::new(IterState::ForIn { keys, idx: 0 })), ..ObjectData::plain(None) };
                self.push(Value::Object(iter.new_ref()));
            }
            Instr::ForOfStart => {
                let obj = self.pop();
                let state = bail!(self.make_forof_state(&obj));
                let iter = ObjectData { kind: ObjectKind::Iterator(std::cell::RefCell::new(state)), ..ObjectData::plain(None) };
                self.push(Value::Object(iter.new_ref()));
            }
            Instr::ForOfNext | Instr::EnumNext => {
                let iter_v = self.peek(0);
                let (value, done) = if let Value::Object(o) = &iter_v {
                    let b = o.borrow();
                    if let ObjectKind::Iterator(state) = &b.kind {
                        state.borrow_mut().next()
                    } else {
                        (Value::Undefined, true)
                    }
                } else {
                    (Value::Undefined, true)
                };
                self.push(value);
                self.push(Value::Boolean(done));
            }
            Instr::Add => {
                let b = self.pop();
                let a = self.pop();
                let v = bail!(self.add(&a, &b));
                self.push(v);
            }
            Instr::Sub => bail!(self.num_binop(|a, b| a - b)),
            Instr::Mul => bail!(self.num_binop(|a, b| a * b)),
            Instr::Div => bail!(self.num_binop(|a, b| a / b)),
            Instr::Mod => bail!(self.num_binop(|a, b| a % b)),
            Instr::Pow => bail!(self.num_binop(|a, b| a.powf(b))),
            Instr::Neg => {
                let v = self.pop();
                self.push(Value::Number(-to_number(&v)));
            }
            Instr::Plus => {
                let v = self.pop();
                self.push(Value::Number(to_number(&v)));
            }
            Instr::LNot => {
                let v = self.pop();
                self.push(Value::Boolean(!v.to_bool()));
            }
            Instr::Inc => {
                let v = self.pop();
                self.push(Value::Number(to_number(&v) + 1.0));
            }
            Instr::Dec => {
                let v = self.pop();
                self.push(Value::Number(to_number(&v) - 1.0));
            }
            Instr::PostInc => {
                let v = self.pop();
                let n = to_number(&v);
                self.push(Value::Number(n));
                self.push(Value::Number(n + 1.0));
            }
            Instr::PostDec => {
                let v = self.pop();
                let n = to_number(&v);
                self.push(Value::Number(n));
                self.push(Value::Number(n - 1.0));
            }
            Instr::Shl => bail!(self.int_binop(|a, b| a.wrapping_shl(b as u32 & 31))),
            Instr::Sar => bail!(self.int_binop(|a, b| a.wrapping_shr(b as u32 & 31))),
            Instr::Shr => {
                let b = self.pop();
                let a = self.pop();
                let au = to_number(&a) as i64 as u32;
                let bu = (to_number(&b) as i64 as u32) & 31;
                self.push(Value::Number((au >> bu) as f64));
            }
            Instr::BitAnd => bail!(self.int_binop(|a, b| a & b)),
            Instr::BitOr => bail!(self.int_binop(|a, b| a | b)),
            Instr::BitXor => bail!(self.int_binop(|a, b| a ^ b)),
            Instr::BitNot => {
                let v = self.pop();
                let i = to_number(&v) as i64 as i32;
                self.push(Value::Number((!i) as f64));
            }
            Instr::Lt => bail!(self.compare(|o| o == std::cmp::Ordering::Less)),
            Instr::Lte => bail!(self.compare(|o| o != std::cmp::Ordering::Greater)),
            Instr::Gt => bail!(self.compare(|o| o == std::cmp::Ordering::Greater)),
            Instr::Gte => bail!(self.compare(|o| o != std::cmp::Ordering::Less)),
            Instr::Eq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Boolean(loose_eq(&a, &b)));
            }
            Instr::Neq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Boolean(!loose_eq(&a, &b)));
            }
            Instr::StrictEq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Boolean(strict_eq(&a, &b)));
            }
            Instr::StrictNeq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Boolean(!strict_eq(&a, &b)));
            }
            Instr::TypeOf => {
                let v = self.pop();
                self.push(Value::string(v.type_of()));
            }
            Instr::Delete => {
                let key = self.pop();
                let obj = self.pop();
                let name = to_property_key(&key);
                if let Value::Object(o) = &obj {
                    o.borrow_mut().properties.remove(&name);
                }
                self.push(Value::Boolean(true));
            }
            Instr::InstanceOf => {
                let ctor = self.pop();
                let obj = self.pop();
                let v = bail!(self.instance_of(&obj, &ctor));
                self.push(Value::Boolean(v));
            }
            Instr::In => {
                let obj = self.pop();
                let key = self.pop();
                let name = to_property_key(&key);
                self.push(Value::Boolean(self.has_prop(&obj, &name)));
            }
            Instr::Object => {
                bail!(self.charge(cost::OBJECT_BASE));
                let obj = ObjectData::plain(self.protos.object.clone()).new_ref();
                self.push(Value::Object(obj));
            }
            Instr::ArrayFrom(n) => {
                bail!(self.charge(cost::OBJECT_BASE + n as usize * cost::ARRAY_ELEMENT));
                let elems = self.pop_n(n as usize);
                let obj = ObjectData::array(elems, self.protos.array.clone()).new_ref();
                self.push(Value::Object(obj));
            }
            Instr::FClosure(i) => {
                let c = self.frames[frame_idx].proto.constants[i as usize].clone();
                let v = bail!(self.make_closure(frame_idx, &c));
                self.push(v);
            }
            Instr::RegExp(i) => {
                let c = self.frames[frame_idx].proto.constants[i as usize].clone();
                let v = bail!(self.value_from_constant(&c));
                self.push(v);
            }
            Instr::PushThis => {
                let v = self.frames[frame_idx].this_value.clone();
                self.push(v);
            }
            Instr::ThisFunc => {
                let v = self.frames[frame_idx].this_value.clone();
                self.push(v);
            }
            Instr::Arguments => {
                let v = bail!(self.arguments_object(frame_idx, call_args));
                self.push(v);
            }
            Instr::NewTarget => {
                let v = self.frames[frame_idx].new_target.clone();
                self.push(v);
            }
            Instr::SetProto => {
                let proto = self.pop();
                let obj = self.peek(0);
                if let (Value::Object(o), Value::Object(p)) = (&obj, &proto) {
                    o.borrow_mut().prototype = Some(p.clone());
                }
            }
            Instr::Nop => {}
        }
        StepResult::Continue
    }

    fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let len = self.stack.len();
        let args = self.stack.split_off(len - n);
        args
    }

    fn do_call(&mut self, argc: usize, this: Value) -> Result<Value, Thrown> {
        let args = self.pop_n(argc);
        let callee = self.pop();
        self.call_value(callee, this, &args)
    }

    fn name_constant(&self, frame_idx: usize, i: u32) -> Result<String, Thrown> {
        match &self.frames[frame_idx].proto.constants[i as usize] {
            Constant::Str(s) => Ok(s.to_string()),
            _ => Err(Thrown::type_error("expected a string constant for property/global name")),
        }
    }

    fn value_from_constant(&mut self, c: &Constant) -> Result<Value, Thrown> {
        match c {
            Constant::Number(n) => Ok(Value::Number(*n)),
            Constant::Str(s) => Ok(Value::string(s)),
            Constant::Function(_) => Err(Thrown::type_error("bare function constant requires FClosure")),
            Constant::Regex { source, flags } => {
                let program = crate::regex::compiler::compile(source, flags)
                    .map_err(|e| Thrown::Engine(e))?;
                self.charge(cost::OBJECT_BASE)?;
                let mut data = ObjectData::plain(self.protos.regexp.clone());
                data.kind = ObjectKind::Regex(Rc::new(program));
                data.properties.insert(Rc::from("source"), PropertySlot::Data(Value::string(source)));
                data.properties.insert(Rc::from("flags"), PropertySlot::Data(Value::string(flags)));
                data.properties.insert(Rc::from("lastIndex"), PropertySlot::Data(Value::Number(0.0)));
                Ok(Value::Object(data.new_ref()))
            }
        }
    }

    fn make_closure(&mut self, frame_idx: usize, c: &Constant) -> Result<Value, Thrown> {
        let proto = match c {
            Constant::Function(p) => p.clone(),
            _ => return Err(Thrown::type_error("FClosure requires a function constant")),
        };
        let mut cells = Vec::with_capacity(proto.upvalues.len());
        for src in &proto.upvalues {
            let cell = match src {
                UpvalueSource::ParentLocal(i) => self.frames[frame_idx].locals[*i as usize].clone(),
                UpvalueSource::ParentUpvalue(i) => self.frames[frame_idx].upvalues[*i as usize].clone(),
            };
            cells.push(cell);
        }
        self.charge(cost::OBJECT_BASE + cells.len() * cost::CLOSURE_CELL)?;
        let mut data = ObjectData::plain(self.protos.function.clone());
        data.callable = Some(Callable::Closure(proto.clone(), Rc::new(cells)));
        data.constructible = proto.flags.constructible;
        data.properties.insert(Rc::from("name"), PropertySlot::Data(Value::string(proto.name.as_deref().unwrap_or(""))));
        data.properties.insert(Rc::from("length"), PropertySlot::Data(Value::Number(proto.param_count as f64)));
        if proto.flags.constructible {
            let proto_obj = ObjectData::plain(self.protos.object.clone()).new_ref();
            data.properties.insert(Rc::from("prototype"), PropertySlot::Data(Value::Object(proto_obj)));
        }
        Ok(Value::Object(data.new_ref()))
    }

    fn arguments_object(&mut self, frame_idx: usize, call_args: &[Value]) -> Result<Value, Thrown> {
        if let Some(obj) = &self.frames[frame_idx].arguments {
            return Ok(Value::Object(obj.clone()));
        }
        self.charge(cost::OBJECT_BASE + call_args.len() * cost::ARRAY_ELEMENT)?;
        let obj = ObjectData::array(call_args.to_vec(), self.protos.array.clone()).new_ref();
        self.frames[frame_idx].arguments = Some(obj.clone());
        Ok(Value::Object(obj))
    }

    /// Own-then-inherited enumerable string keys, in the order `for-in`
    /// must produce: own keys in insertion order first, then
    /// each prototype's own keys not already seen.
    fn enumerable_keys(&self, v: &Value) -> Vec<Rc<str>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        if let Value::Object(o) = v {
            let mut cur = Some(o.clone());
            while let Some(obj) = cur {
                let b = obj.borrow();
                if let ObjectKind::Array(elems) = &b.kind {
                    for i in 0..elems.len() {
                        let k: Rc<str> = Rc::from(i.to_string());
                        if seen.insert(k.clone()) {
                            out.push(k);
                        }
                    }
                }
                for k in b.properties.keys() {
                    if seen.insert(k.clone()) {
                        out.push(k.clone());
                    }
                }
                cur = b.prototype.clone();
            }
        }
        out
    }

    fn make_forof_state(&self, v: &Value) -> Result<IterState, Thrown> {
        match v {
            Value::Object(o) => {
                let b = o.borrow();
                match &b.kind {
                    ObjectKind::Array(elems) => Ok(IterState::ForOfArray { elements: elems.clone(), idx: 0 }),
                    _ => Err(Thrown::type_error("value is not iterable")),
                }
            }
            Value::String(s) => Ok(IterState::ForOfString { chars: js_string_to_utf8(s).chars().collect(), idx: 0 }),
            _ => Err(Thrown::type_error(format!("{} is not iterable", v.type_of()))),
        }
    }

    pub fn get_prop(&mut self, base: &Value, key: &str) -> Result<Value, Thrown> {
        match base {
            Value::Undefined | Value::Null => {
                Err(Thrown::type_error(format!("Cannot read properties of {} (reading '{}')", base.type_of(), key)))
            }
            Value::String(s) => {
                if key == "length" {
                    return Ok(Value::Number(s.len() as f64));
                }
                if let Ok(idx) = key.parse::<usize>() {
                    return Ok(s.get(idx).map(|u| Value::string(&String::from_utf16_lossy(&[*u]))).unwrap_or(Value::Undefined));
                }
                self.get_from_proto_chain(self.protos.string.clone(), key, base.clone())
            }
            Value::Number(_) => self.get_from_proto_chain(self.protos.number.clone(), key, base.clone()),
            Value::Boolean(_) => self.get_from_proto_chain(self.protos.boolean.clone(), key, base.clone()),
            Value::Object(o) => {
                if key == "length" {
                    if let ObjectKind::Array(elems) = &o.borrow().kind {
                        return Ok(Value::Number(elems.len() as f64));
                    }
                }
                if let ObjectKind::Array(elems) = &o.borrow().kind {
                    if let Ok(idx) = key.parse::<usize>() {
                        return Ok(elems.get(idx).cloned().unwrap_or(Value::Undefined));
                    }
                }
                let mut cur = Some(o.clone());
                while let Some(obj) = cur {
                    let slot = obj.borrow().properties.get(key).cloned();
                    match slot {
                        Some(PropertySlot::Data(v)) => return Ok(v),
                        Some(PropertySlot::Accessor { get: Some(f), .. }) => {
                            return self.call_value(f, base.clone(), &[]);
                        }
                        Some(PropertySlot::Accessor { get: None, .. }) => return Ok(Value::Undefined),
                        None => cur = obj.borrow().prototype.clone(),
                    }
                }
                Ok(Value::Undefined)
            }
        }
    }

    fn get_from_proto_chain(&mut self, proto: Option<ObjectRef>, key: &str, this: Value) -> Result<Value, Thrown> {
        let mut cur = proto;
        while let Some(obj) = cur {
            let slot = obj.borrow().properties.get(key).cloned();
            match slot {
                Some(PropertySlot::Data(v)) => return Ok(v),
                Some(PropertySlot::Accessor { get: Some(f), .. }) => return self.call_value(f, this, &[]),
                Some(PropertySlot::Accessor { get: None, .. }) => return Ok(Value::Undefined),
                None => cur = obj.borrow().prototype.clone(),
            }
        }
        Ok(Value::Undefined)
    }

    pub fn set_prop(&mut self, base: &Value, key: &str, value: Value) -> Result<(), Thrown> {
        let obj = match base {
            Value::Object(o) => o.clone(),
            Value::Undefined | Value::Null => {
                return Err(Thrown::type_error(format!("Cannot set properties of {} (setting '{}')", base.type_of(), key)))
            }
            _ => return Ok(()),
        };
        if key == "length" {
            let is_array = matches!(obj.borrow().kind, ObjectKind::Array(_));
            if is_array {
                let new_len = to_number(&value).max(0.0) as usize;
                if let ObjectKind::Array(elems) = &mut obj.borrow_mut().kind {
                    elems.resize(new_len, Value::Undefined);
                }
                return Ok(());
            }
        }
        if let Ok(idx) = key.parse::<usize>() {
            let is_array = matches!(obj.borrow().kind, ObjectKind::Array(_));
            if is_array {
                if let ObjectKind::Array(elems) = &mut obj.borrow_mut().kind {
                    if idx >= elems.len() {
                        elems.resize(idx + 1, Value::Undefined);
                    }
                    elems[idx] = value;
                }
                return Ok(());
            }
        }
        let existing_setter = obj.borrow().properties.get(key).and_then(|s| match s {
            PropertySlot::Accessor { set, .. } => set.clone(),
            _ => None,
        });
        if let Some(setter) = existing_setter {
            self.call_value(setter, base.clone(), &[value])?;
            return Ok(());
        }
        obj.borrow_mut().properties.insert(Rc::from(key), PropertySlot::Data(value));
        Ok(())
    }

    /// Whether `base` already has an own (non-indexed, non-inherited) slot
    /// named `key`. Used to charge the memory budget only for a property
    /// that's genuinely new, not one merely being overwritten.
    fn has_own_prop(&self, base: &Value, key: &str) -> bool {
        match base {
            Value::Object(o) => o.borrow().properties.contains_key(key),
            _ => false,
        }
    }

    fn get_indexed(&mut self, base: &Value, key: &Value) -> Result<Value, Thrown> {
        let name = to_property_key(key);
        self.get_prop(base, &name)
    }

    fn set_indexed(&mut self, base: &Value, key: &Value, value: Value) -> Result<(), Thrown> {
        let name = to_property_key(key);
        self.set_prop(base, &name, value)
    }

    fn has_prop(&self, base: &Value, key: &str) -> bool {
        match base {
            Value::Object(o) => {
                if let ObjectKind::Array(elems) = &o.borrow().kind {
                    if key == "length" {
                        return true;
                    }
                    if let Ok(idx) = key.parse::<usize>() {
                        return idx < elems.len();
                    }
                }
                let mut cur = Some(o.clone());
                while let Some(obj) = cur {
                    if obj.borrow().properties.contains_key(key) {
                        return true;
                    }
                    cur = obj.borrow().prototype.clone();
                }
                false
            }
            _ => false,
        }
    }

    fn instance_of(&self, obj: &Value, ctor: &Value) -> Result<bool, Thrown> {
        let ctor_obj = match ctor {
            Value::Object(o) => o,
            _ => return Err(Thrown::type_error("right-hand side of 'instanceof' is not callable")),
        };
        let proto_prop = ctor_obj.borrow().properties.get("prototype").cloned();
        let target_proto = match proto_prop {
            Some(PropertySlot::Data(Value::Object(p))) => p,
            _ => return Ok(false),
        };
        let mut cur = match obj {
            Value::Object(o) => o.borrow().prototype.clone(),
            _ => return Ok(false),
        };
        while let Some(p) = cur {
            if Rc::ptr_eq(&p, &target_proto) {
                return Ok(true);
            }
            cur = p.borrow().prototype.clone();
        }
        Ok(false)
    }

    fn add(&mut self, a: &Value, b: &Value) -> Result<Value, Thrown> {
        let a_prim = self.to_primitive(a)?;
        let b_prim = self.to_primitive(b)?;
        if matches!(a_prim, Value::String(_)) || matches!(b_prim, Value::String(_)) {
            let mut s = js_string_to_utf8_value(&a_prim);
            s.push_str(&js_string_to_utf8_value(&b_prim));
            self.charge(cost::STRING_BASE + s.len())?;
            Ok(Value::string(&s))
        } else {
            Ok(Value::Number(to_number(&a_prim) + to_number(&b_prim)))
        }
    }

    /// A pragmatic `ToPrimitive`: objects stringify via their specialised
    /// body (array join, regex source/flags) or fall back to
    /// `"[object Object]"`; there is no user-overridable `valueOf`/
    /// `Symbol.toPrimitive` hook in this engine.
    fn to_primitive(&mut self, v: &Value) -> Result<Value, Thrown> {
        match v {
            Value::Object(o) => {
                let b = o.borrow();
                match &b.kind {
                    ObjectKind::Array(elems) => {
                        let elems = elems.clone();
                        drop(b);
                        let mut parts = Vec::with_capacity(elems.len());
                        for e in &elems {
                            if e.is_nullish() {
                                parts.push(String::new());
                            } else {
                                parts.push(js_string_to_utf8_value(&self.to_primitive(e)?));
                            }
                        }
                        Ok(Value::string(&parts.join(",")))
                    }
                    ObjectKind::Regex(prog) => Ok(Value::string(&format!("/{}/{}", prog.source, prog.flags))),
                    _ if b.callable.is_some() => {
                        let name = b.properties.get("name").cloned();
                        drop(b);
                        let name = match name {
                            Some(PropertySlot::Data(Value::String(s))) => js_string_to_utf8(&s),
                            _ => String::new(),
                        };
                        Ok(Value::string(&format!("function {}() {{ [native code] }}", name)))
                    }
                    _ => Ok(Value::string("[object Object]")),
                }
            }
            other => Ok(other.clone()),
        }
    }

    fn num_binop(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), Thrown> {
        let b = self.pop();
        let a = self.pop();
        self.push(Value::Number(f(to_number(&a), to_number(&b))));
        Ok(())
    }

    fn int_binop(&mut self, f: impl Fn(i32, i32) -> i32) -> Result<(), Thrown> {
        let b = self.pop();
        let a = self.pop();
        let ai = to_number(&a) as i64 as i32;
        let bi = to_number(&b) as i64 as i32;
        self.push(Value::Number(f(ai, bi) as f64));
        Ok(())
    }

    fn compare(&mut self, pred: impl Fn(std::cmp::Ordering) -> bool) -> Result<(), Thrown> {
        let b = self.pop();
        let a = self.pop();
        let result = match (&a, &b) {
            (Value::String(sa), Value::String(sb)) => sa.iter().partial_cmp(sb.iter()).map(|o| pred(o)).unwrap_or(false),
            _ => {
                let (na, nb) = (to_number(&a), to_number(&b));
                na.partial_cmp(&nb).map(|o| pred(o)).unwrap_or(false)
            }
        };
        self.push(Value::Boolean(result));
        Ok(())
    }
}

enum StepResult {
    Continue,
    Returned(Value),
    Thrown(Thrown),
}

/// `ToNumber`: objects don't coerce through
/// a user hook (no `valueOf`), so an object always yields `NaN`.
pub fn to_number(v: &Value) -> f64 {
    match v {
        Value::Undefined => f64::NAN,
        Value::Null => 0.0,
        Value::Boolean(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => *n,
        Value::String(s) => {
            let text = js_string_to_utf8(s);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Value::Object(_) => f64::NAN,
    }
}

fn js_string_to_utf8_value(v: &Value) -> String {
    match v {
        Value::Undefined => "undefined".to_string(),
        Value::Null => "null".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::String(s) => js_string_to_utf8(s),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

/// Formats a number the way the source language's `ToString` does for the
/// common cases: integral values print without a trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn to_property_key(v: &Value) -> String {
    match v {
        Value::String(s) => js_string_to_utf8(s),
        Value::Number(n) => format_number(*n),
        other => js_string_to_utf8_value(other),
    }
}

pub fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

pub fn loose_eq(a: &Value, b: &Value) -> bool {
    use Value::*;
    match (a, b) {
        (Undefined | Null, Undefined | Null) => true,
        (Number(_), Number(_))
        | (String(_), String(_))
        | (Boolean(_), Boolean(_))
        | (Object(_), Object(_)) => strict_eq(a, b),
        (Number(_), String(_)) | (String(_), Number(_)) => to_number(a) == to_number(b),
        (Boolean(_), _) => loose_eq(&Value::Number(to_number(a)), b),
        (_, Boolean(_)) => loose_eq(a, &Value::Number(to_number(b))),
        (Object(_), Number(_)) | (Object(_), String(_)) => {
            loose_eq(&Value::string(&js_string_to_utf8_value(a)), b)
        }
        (Number(_), Object(_)) | (String(_), Object(_)) => {
            loose_eq(a, &Value::string(&js_string_to_utf8_value(b)))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{FunctionFlags, FunctionProto};

    fn empty_proto(instructions: Vec<Instr>, constants: Vec<Constant>) -> Rc<FunctionProto> {
        Rc::new(FunctionProto {
            name: None,
            instructions,
            constants,
            param_count: 0,
            local_count: 0,
            local_names: Vec::new(),
            upvalues: Vec::new(),
            exception_table: Vec::new(),
            source_map: Vec::new(),
            flags: FunctionFlags::default(),
        })
    }

    fn new_vm() -> Vm {
        Vm::new(Heap::new(None), Limits::default())
    }

    #[test]
    fn arithmetic_and_return() {
        let proto = empty_proto(vec![Instr::PushI(2), Instr::PushI(3), Instr::Add, Instr::Return], vec![]);
        let mut vm = new_vm();
        let result = vm.run_script(proto).unwrap();
        match result {
            Value::Number(n) => assert_eq!(n, 5.0),
            _ => panic!("expected number"),
        }
    }

    #[test]
    fn string_concatenation_duality() {
        let proto = empty_proto(
            vec![Instr::PushConst(0), Instr::PushI(1), Instr::Add, Instr::Return],
            vec![Constant::Str(Rc::from("x = "))],
        );
        let mut vm = new_vm();
        let result = vm.run_script(proto).unwrap();
        match result {
            Value::String(s) => assert_eq!(js_string_to_utf8(&s), "x = 1"),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn strict_equality_distinguishes_types() {
        assert!(!strict_eq(&Value::Number(0.0), &Value::string("")));
        assert!(strict_eq(&Value::Number(1.0), &Value::Number(1.0)));
    }

    #[test]
    fn loose_equality_coerces_numeric_strings() {
        assert!(loose_eq(&Value::Number(1.0), &Value::string("1")));
        assert!(loose_eq(&Value::Null, &Value::Undefined));
    }

    #[test]
    fn try_catch_binds_thrown_value_and_continues() {
        // try { throw 42; } catch (e) { return e + 1; }
        let instructions = vec![
            /* 0 */ Instr::PushI(42),
            /* 1 */ Instr::Throw,
            /* 2 (catch_pc) */ Instr::PushI(1),
            /* 3 */ Instr::Add,
            /* 4 */ Instr::Return,
        ];
        let mut proto = empty_proto(instructions, vec![]);
        Rc::get_mut(&mut proto).unwrap().exception_table.push(crate::bytecode::ExceptionEntry {
            start_pc: 0,
            end_pc: 2,
            catch_pc: Some(2),
            finally_pc: None,
            stack_depth: 0,
        });
        let mut vm = new_vm();
        let result = vm.run_script(proto).unwrap();
        match result {
            Value::Number(n) => assert_eq!(n, 43.0),
            _ => panic!("expected number"),
        }
    }

    #[test]
    fn instruction_budget_raises_time_limit_error() {
        // An infinite loop: Goto(0).
        let proto = empty_proto(vec![Instr::Goto(0)], vec![]);
        let mut vm = Vm::new(Heap::new(None), Limits { max_instructions: Some(1000), max_duration: None, poll_interval: 10 });
        let err = vm.run_script(proto).unwrap_err();
        match err {
            Thrown::Engine(e) => assert_eq!(e.kind, ErrorKind::TimeLimitError),
            _ => panic!("expected engine error"),
        }
    }
}
