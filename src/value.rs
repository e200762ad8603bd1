// File: src/value.rs
//
// Runtime value representation for the sandboxed script engine: the tagged
// `Value` sum, ordered property records, and the function/closure-cell
// model.
//
// Objects are `Rc<RefCell<ObjectData>>` rather than `Arc<Mutex<..>>`:
// execution is single-threaded and cooperative with no shared mutable
// state across contexts, so `Rc`/`RefCell` is the idiomatic choice for a
// single-threaded heap.

use crate::bytecode::FunctionProto;
use ahash::AHashMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// UTF-16 code units: `.length`, indexing, and
/// `charCodeAt` all operate on code units, not Unicode scalar values.
pub type JsString = Rc<[u16]>;

pub fn js_string(s: &str) -> JsString {
    s.encode_utf16().collect::<Vec<u16>>().into()
}

pub fn js_string_to_utf8(s: &[u16]) -> String {
    String::from_utf16_lossy(s)
}

/// A closure cell: an independently addressable slot shared by every
/// closure that captured it. Identity is stable
/// across re-entries into the creating scope.
pub type Cell = Rc<RefCell<Value>>;

pub fn new_cell(v: Value) -> Cell {
    Rc::new(RefCell::new(v))
}

/// Reference-counted handle to a heap object. Identity equality (`Rc::ptr_eq`)
/// is what distinguishes two objects from two references to the same object.
pub type ObjectRef = Rc<RefCell<ObjectData>>;

/// The tagged value sum.
#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(JsString),
    Object(ObjectRef),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::String(js_string(s))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// The source language's `ToBoolean`.
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Object(_) => true,
        }
    }

    /// `typeof`.
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(o) => {
                if o.borrow().callable.is_some() {
                    "function"
                } else {
                    "object"
                }
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", js_string_to_utf8(s)),
            Value::Object(o) => write!(f, "Object({:p})", Rc::as_ptr(o)),
        }
    }
}

/// A property slot: either a plain data value or an accessor pair. Every
/// user-created property is writable/enumerable/configurable,
/// so there are no attribute bits to track beyond which shape the slot has.
#[derive(Clone)]
pub enum PropertySlot {
    Data(Value),
    Accessor { get: Option<Value>, set: Option<Value> },
}

/// An insertion-order-preserving string-keyed map. `for-in`
/// and `JSON.stringify`/`Object.keys` both depend on this order being
/// preserved exactly as properties were defined.
#[derive(Clone, Default)]
pub struct OrderedMap {
    order: Vec<Rc<str>>,
    slots: AHashMap<Rc<str>, PropertySlot>,
}

impl OrderedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&PropertySlot> {
        self.slots.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Inserts or overwrites a slot. Overwriting an existing key does not
    /// move it in the enumeration order (matches ordinary object semantics:
    /// re-assigning a property keeps its original insertion position).
    pub fn insert(&mut self, key: Rc<str>, slot: PropertySlot) {
        if !self.slots.contains_key(&key) {
            self.order.push(Rc::clone(&key));
        }
        self.slots.insert(key, slot);
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertySlot> {
        let removed = self.slots.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k.as_ref() != key);
        }
        removed
    }

    /// Own keys in insertion order, as `for-in` requires before it walks the
    /// prototype chain.
    pub fn keys(&self) -> impl Iterator<Item = &Rc<str>> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// The specialised body an object may carry in addition to its property map:
/// array elements, regex data, error fields, or an iterator's hidden state.
#[derive(Clone)]
pub enum ObjectKind {
    Plain,
    Array(Vec<Value>),
    Error,
    Regex(Rc<crate::regex::compiler::RegexProgram>),
    /// The hidden iterator object `ForInStart`/`ForOfStart` push onto the
    /// operand stack for the duration of a loop. Never
    /// reachable from user code.
    Iterator(RefCell<crate::vm::IterState>),
}

/// A native (host-implemented) function's call signature:
/// `(this_value, args, context) -> Value | raise`.
pub type NativeFn = Rc<dyn Fn(&mut crate::vm::Vm, Value, &[Value]) -> Result<Value, crate::vm::Thrown>>;

#[derive(Clone)]
pub enum Callable {
    Native(NativeFn),
    Closure(Rc<FunctionProto>, Rc<Vec<Cell>>),
}

/// A heap object: an ordered property map, a prototype link, an optional
/// callable slot, and an optional specialised body.
pub struct ObjectData {
    pub properties: OrderedMap,
    pub prototype: Option<ObjectRef>,
    pub callable: Option<Callable>,
    pub kind: ObjectKind,
    /// Set on construction of a function object whose `.prototype` property
    /// should back `new`-expressions.
    pub constructible: bool,
}

impl ObjectData {
    pub fn plain(prototype: Option<ObjectRef>) -> Self {
        Self {
            properties: OrderedMap::new(),
            prototype,
            callable: None,
            kind: ObjectKind::Plain,
            constructible: false,
        }
    }

    pub fn array(elements: Vec<Value>, prototype: Option<ObjectRef>) -> Self {
        Self {
            properties: OrderedMap::new(),
            prototype,
            callable: None,
            kind: ObjectKind::Array(elements),
            constructible: false,
        }
    }

    pub fn new_ref(self) -> ObjectRef {
        Rc::new(RefCell::new(self))
    }
}
