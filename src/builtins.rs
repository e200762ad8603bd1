// File: src/builtins.rs
//
// Prototype installation and the standard library (spec.md §4.5): every
// built-in is an object whose callable slot is a native Rust closure with
// signature `(vm, this, args) -> Value | raise`, exactly the contract
// `value::NativeFn` describes. `install` wires up `Object`/`Array`/
// `String`/`Number`/`Boolean`/`Function`/`Error` (+ subtypes)/`RegExp`
// prototypes plus the free-standing `Math`/`JSON`/globals, and is the one
// place a fresh `Vm` becomes a usable context (`Context::with_options`
// calls it once, right after construction).

use crate::errors::EngineError;
use crate::heap::cost;
use crate::regex::matcher::Matcher;
use crate::value::{
    js_string, js_string_to_utf8, Callable, NativeFn, ObjectData, ObjectKind, ObjectRef,
    PropertySlot, Value,
};
use crate::vm::{format_number, to_number, Thrown, Vm};
use std::rc::Rc;

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Undefined)
}

fn to_str(v: &Value) -> String {
    match v {
        Value::String(s) => js_string_to_utf8(s),
        other => to_display_string(other),
    }
}

fn chars_of(v: &Value) -> Vec<char> {
    to_str(v).chars().collect()
}

/// `String(v)`/template coercion/`console.log` display, all without the
/// `&mut Vm` `Vm::to_primitive` needs for its stack-machine context — there
/// is no user-overridable `valueOf`, so this can run standalone.
pub fn to_display_string(v: &Value) -> String {
    match v {
        Value::Undefined => "undefined".to_string(),
        Value::Null => "null".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::String(s) => js_string_to_utf8(s),
        Value::Object(o) => {
            let b = o.borrow();
            match &b.kind {
                ObjectKind::Array(elems) => {
                    let parts: Vec<String> = elems
                        .iter()
                        .map(|e| match e {
                            Value::Undefined | Value::Null => String::new(),
                            other => to_display_string(other),
                        })
                        .collect();
                    format!("[{}]", parts.join(","))
                }
                ObjectKind::Regex(prog) => format!("/{}/{}", prog.source, prog.flags),
                ObjectKind::Error => {
                    let name = match b.properties.get("name") {
                        Some(PropertySlot::Data(Value::String(s))) => js_string_to_utf8(s),
                        _ => "Error".to_string(),
                    };
                    let message = match b.properties.get("message") {
                        Some(PropertySlot::Data(Value::String(s))) => js_string_to_utf8(s),
                        _ => String::new(),
                    };
                    if message.is_empty() {
                        name
                    } else {
                        format!("{}: {}", name, message)
                    }
                }
                _ if b.callable.is_some() => {
                    let name = match b.properties.get("name") {
                        Some(PropertySlot::Data(Value::String(s))) => js_string_to_utf8(s),
                        _ => String::new(),
                    };
                    format!("function {}() {{ [native code] }}", name)
                }
                _ => "[object Object]".to_string(),
            }
        }
    }
}

fn new_object(proto: Option<ObjectRef>) -> ObjectRef {
    ObjectData::plain(proto).new_ref()
}

fn new_array(elems: Vec<Value>, proto: Option<ObjectRef>) -> Value {
    Value::Object(ObjectData::array(elems, proto).new_ref())
}

fn elements_of(v: &Value) -> Vec<Value> {
    match v {
        Value::Object(o) => match &o.borrow().kind {
            ObjectKind::Array(e) => e.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Defines a native method on `obj`, attached to `Function.prototype` the
/// way every closure is (so `fn.call`/`fn.bind` work on built-ins too).
fn def(obj: &ObjectRef, function_proto: &Option<ObjectRef>, name: &'static str, arity: f64, f: impl Fn(&mut Vm, Value, &[Value]) -> Result<Value, Thrown> + 'static) {
    let mut data = ObjectData::plain(function_proto.clone());
    data.callable = Some(Callable::Native(Rc::new(f) as NativeFn));
    data.properties.insert(Rc::from("name"), PropertySlot::Data(Value::string(name)));
    data.properties.insert(Rc::from("length"), PropertySlot::Data(Value::Number(arity)));
    obj.borrow_mut().properties.insert(Rc::from(name), PropertySlot::Data(Value::Object(data.new_ref())));
}

/// Installs every prototype and global the language runtime needs, in
/// dependency order: bare shells first (so `Function.prototype` exists to
/// attach methods to), then cross-links, then the methods themselves.
pub fn install(vm: &mut Vm) {
    let object_proto = new_object(None);
    let function_proto = new_object(Some(object_proto.clone()));
    let array_proto = new_object(Some(object_proto.clone()));
    let string_proto = new_object(Some(object_proto.clone()));
    let number_proto = new_object(Some(object_proto.clone()));
    let boolean_proto = new_object(Some(object_proto.clone()));
    let regexp_proto = new_object(Some(object_proto.clone()));
    let error_proto = new_object(Some(object_proto.clone()));
    let type_error_proto = new_object(Some(error_proto.clone()));
    let range_error_proto = new_object(Some(error_proto.clone()));
    let reference_error_proto = new_object(Some(error_proto.clone()));

    vm.protos.object = Some(object_proto.clone());
    vm.protos.function = Some(function_proto.clone());
    vm.protos.array = Some(array_proto.clone());
    vm.protos.string = Some(string_proto.clone());
    vm.protos.number = Some(number_proto.clone());
    vm.protos.boolean = Some(boolean_proto.clone());
    vm.protos.regexp = Some(regexp_proto.clone());
    vm.protos.error = Some(error_proto.clone());
    vm.protos.type_error = Some(type_error_proto.clone());
    vm.protos.range_error = Some(range_error_proto.clone());
    vm.protos.reference_error = Some(reference_error_proto.clone());

    let fp = Some(function_proto.clone());
    install_object_proto(&object_proto, &fp);
    install_array_proto(&array_proto, &fp);
    install_string_proto(&string_proto, &fp);
    install_number_proto(&number_proto, &fp);
    install_boolean_proto(&boolean_proto, &fp);
    install_function_proto(&function_proto, &fp);
    install_regexp_proto(&regexp_proto, &fp);
    install_error_proto(&error_proto, &fp, "Error");
    install_error_proto(&type_error_proto, &fp, "TypeError");
    install_error_proto(&range_error_proto, &fp, "RangeError");
    install_error_proto(&reference_error_proto, &fp, "ReferenceError");

    let globals = vm.globals.clone();
    install_globals(&globals, &fp, vm);
    install_constructors(&globals, &fp, vm);
}

// ---- Object.prototype / Object constructor ----

fn install_object_proto(proto: &ObjectRef, fp: &Option<ObjectRef>) {
    def(proto, fp, "hasOwnProperty", 1.0, |_vm, this, args| {
        let key = to_str(&arg(args, 0));
        let owns = match &this {
            Value::Object(o) => match &o.borrow().kind {
                ObjectKind::Array(elems) => {
                    key == "length" || key.parse::<usize>().is_ok_and(|i| i < elems.len())
                }
                _ => o.borrow().properties.contains_key(&key),
            },
            _ => false,
        };
        Ok(Value::Boolean(owns))
    });
    def(proto, fp, "toString", 0.0, |_vm, this, _args| Ok(Value::string(&to_display_string(&this))));
}

fn own_keys(o: &ObjectRef) -> Vec<Rc<str>> {
    let b = o.borrow();
    if let ObjectKind::Array(elems) = &b.kind {
        return (0..elems.len()).map(|i| Rc::from(i.to_string())).collect();
    }
    b.properties.keys().cloned().collect()
}

fn install_constructors(globals: &ObjectRef, fp: &Option<ObjectRef>, vm: &mut Vm) {
    let object_proto = vm.protos.object.clone();
    let object_ctor = new_object(fp.clone());
    object_ctor.borrow_mut().callable = Some(Callable::Native(Rc::new(|vm: &mut Vm, _this, args| {
        match arg(args, 0) {
            Value::Undefined | Value::Null => Ok(Value::Object(new_object(vm.protos.object.clone()))),
            other => Ok(other),
        }
    }) as NativeFn));
    object_ctor.borrow_mut().constructible = true;
    object_ctor.borrow_mut().properties.insert(Rc::from("prototype"), PropertySlot::Data(Value::Object(object_proto.clone().unwrap())));
    def(&object_ctor, fp, "keys", 1.0, |_vm, _this, args| match arg(args, 0) {
        Value::Object(o) => Ok(new_array(own_keys(&o).into_iter().map(|k| Value::string(&k)).collect(), None)),
        _ => Ok(new_array(Vec::new(), None)),
    });
    def(&object_ctor, fp, "values", 1.0, |_vm, _this, args| match arg(args, 0) {
        Value::Object(o) => {
            let keys = own_keys(&o);
            let vals: Vec<Value> = keys
                .iter()
                .map(|k| match &o.borrow().kind {
                    ObjectKind::Array(elems) => k.parse::<usize>().ok().and_then(|i| elems.get(i).cloned()).unwrap_or(Value::Undefined),
                    _ => match o.borrow().properties.get(k) {
                        Some(PropertySlot::Data(v)) => v.clone(),
                        _ => Value::Undefined,
                    },
                })
                .collect();
            Ok(new_array(vals, None))
        }
        _ => Ok(new_array(Vec::new(), None)),
    });
    def(&object_ctor, fp, "entries", 1.0, |_vm, _this, args| match arg(args, 0) {
        Value::Object(o) => {
            let keys = own_keys(&o);
            let pairs: Vec<Value> = keys
                .iter()
                .map(|k| {
                    let v = match &o.borrow().kind {
                        ObjectKind::Array(elems) => k.parse::<usize>().ok().and_then(|i| elems.get(i).cloned()).unwrap_or(Value::Undefined),
                        _ => match o.borrow().properties.get(k) {
                            Some(PropertySlot::Data(v)) => v.clone(),
                            _ => Value::Undefined,
                        },
                    };
                    new_array(vec![Value::string(k), v], None)
                })
                .collect();
            Ok(new_array(pairs, None))
        }
        _ => Ok(new_array(Vec::new(), None)),
    });
    def(&object_ctor, fp, "assign", 2.0, |vm, _this, args| {
        let target = arg(args, 0);
        if let Value::Object(t) = &target {
            for src in &args[1.min(args.len())..] {
                if let Value::Object(s) = src {
                    for k in own_keys(s) {
                        let v = vm.get_prop(src, &k)?;
                        vm.set_prop(&target, &k, v)?;
                    }
                }
            }
            let _ = t;
        }
        Ok(target)
    });
    // Object.freeze is documented as a no-op: the engine has no immutability
    // enforcement, but scripts that call it shouldn't fail (SPEC_FULL.md §4).
    def(&object_ctor, fp, "freeze", 1.0, |_vm, _this, args| Ok(arg(args, 0)));
    def(&object_ctor, fp, "isFrozen", 1.0, |_vm, _this, _args| Ok(Value::Boolean(false)));
    globals.borrow_mut().properties.insert(Rc::from("Object"), PropertySlot::Data(Value::Object(object_ctor)));

    install_array_ctor(globals, fp, vm);
    install_string_ctor(globals, fp, vm);
    install_number_ctor(globals, fp, vm);
    install_boolean_ctor(globals, fp, vm);
    install_error_ctors(globals, fp, vm);
    install_regexp_ctor(globals, fp, vm);
}

fn install_array_ctor(globals: &ObjectRef, fp: &Option<ObjectRef>, vm: &mut Vm) {
    let array_proto = vm.protos.array.clone();
    let ctor = new_object(fp.clone());
    ctor.borrow_mut().callable = Some(Callable::Native(Rc::new(|vm: &mut Vm, _this, args| {
        if args.len() == 1 {
            if let Value::Number(n) = &args[0] {
                return Ok(new_array(vec![Value::Undefined; *n as usize], vm.protos.array.clone()));
            }
        }
        Ok(new_array(args.to_vec(), vm.protos.array.clone()))
    }) as NativeFn));
    ctor.borrow_mut().constructible = true;
    ctor.borrow_mut().properties.insert(Rc::from("prototype"), PropertySlot::Data(Value::Object(array_proto.unwrap())));
    def(&ctor, fp, "isArray", 1.0, |_vm, _this, args| {
        Ok(Value::Boolean(matches!(arg(args, 0), Value::Object(o) if matches!(o.borrow().kind, ObjectKind::Array(_)))))
    });
    globals.borrow_mut().properties.insert(Rc::from("Array"), PropertySlot::Data(Value::Object(ctor)));
}

fn install_string_ctor(globals: &ObjectRef, fp: &Option<ObjectRef>, vm: &mut Vm) {
    let string_proto = vm.protos.string.clone();
    let ctor = new_object(fp.clone());
    ctor.borrow_mut().callable = Some(Callable::Native(Rc::new(|_vm, _this, args| Ok(Value::string(&to_str(&arg(args, 0))))) as NativeFn));
    ctor.borrow_mut().properties.insert(Rc::from("prototype"), PropertySlot::Data(Value::Object(string_proto.unwrap())));
    globals.borrow_mut().properties.insert(Rc::from("String"), PropertySlot::Data(Value::Object(ctor)));
}

fn install_number_ctor(globals: &ObjectRef, fp: &Option<ObjectRef>, vm: &mut Vm) {
    let number_proto = vm.protos.number.clone();
    let ctor = new_object(fp.clone());
    ctor.borrow_mut().callable = Some(Callable::Native(Rc::new(|_vm, _this, args| Ok(Value::Number(to_number(&arg(args, 0))))) as NativeFn));
    ctor.borrow_mut().properties.insert(Rc::from("prototype"), PropertySlot::Data(Value::Object(number_proto.unwrap())));
    ctor.borrow_mut().properties.insert(Rc::from("MAX_SAFE_INTEGER"), PropertySlot::Data(Value::Number(9007199254740991.0)));
    ctor.borrow_mut().properties.insert(Rc::from("MIN_SAFE_INTEGER"), PropertySlot::Data(Value::Number(-9007199254740991.0)));
    ctor.borrow_mut().properties.insert(Rc::from("EPSILON"), PropertySlot::Data(Value::Number(f64::EPSILON)));
    def(&ctor, fp, "isNaN", 1.0, |_vm, _this, args| Ok(Value::Boolean(matches!(arg(args, 0), Value::Number(n) if n.is_nan()))));
    def(&ctor, fp, "isFinite", 1.0, |_vm, _this, args| Ok(Value::Boolean(matches!(arg(args, 0), Value::Number(n) if n.is_finite()))));
    def(&ctor, fp, "isInteger", 1.0, |_vm, _this, args| Ok(Value::Boolean(matches!(arg(args, 0), Value::Number(n) if n.is_finite() && n.fract() == 0.0))));
    def(&ctor, fp, "parseInt", 2.0, |_vm, _this, args| {
        let s = to_str(&arg(args, 0));
        let radix = match arg(args, 1) {
            Value::Undefined => 10u32,
            v => {
                let r = to_number(&v) as u32;
                if r == 0 {
                    10
                } else {
                    r
                }
            }
        };
        Ok(Value::Number(parse_int(s.trim(), radix)))
    });
    def(&ctor, fp, "parseFloat", 1.0, |_vm, _this, args| {
        let s = to_str(&arg(args, 0));
        Ok(Value::Number(parse_float(s.trim())))
    });
    globals.borrow_mut().properties.insert(Rc::from("Number"), PropertySlot::Data(Value::Object(ctor)));
}

fn parse_int(s: &str, radix: u32) -> f64 {
    let (neg, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let s = if radix == 16 { s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s) } else { s };
    let end = s.find(|c: char| !c.is_digit(radix)).unwrap_or(s.len());
    if end == 0 {
        return f64::NAN;
    }
    match i64::from_str_radix(&s[..end], radix) {
        Ok(n) => {
            if neg {
                -(n as f64)
            } else {
                n as f64
            }
        }
        Err(_) => f64::NAN,
    }
}

fn parse_float(s: &str) -> f64 {
    let mut end = 0;
    let bytes: Vec<char> = s.chars().collect();
    let mut seen_dot = false;
    let mut seen_digit = false;
    let mut i = 0;
    if i < bytes.len() && (bytes[i] == '+' || bytes[i] == '-') {
        i += 1;
    }
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_digit() {
            seen_digit = true;
            i += 1;
        } else if c == '.' && !seen_dot {
            seen_dot = true;
            i += 1;
        } else {
            break;
        }
    }
    end = i;
    if !seen_digit {
        return f64::NAN;
    }
    s.chars().take(end).collect::<String>().parse::<f64>().unwrap_or(f64::NAN)
}

fn install_boolean_ctor(globals: &ObjectRef, fp: &Option<ObjectRef>, vm: &mut Vm) {
    let boolean_proto = vm.protos.boolean.clone();
    let ctor = new_object(fp.clone());
    ctor.borrow_mut().callable = Some(Callable::Native(Rc::new(|_vm, _this, args| Ok(Value::Boolean(arg(args, 0).to_bool()))) as NativeFn));
    ctor.borrow_mut().properties.insert(Rc::from("prototype"), PropertySlot::Data(Value::Object(boolean_proto.unwrap())));
    globals.borrow_mut().properties.insert(Rc::from("Boolean"), PropertySlot::Data(Value::Object(ctor)));
}

fn make_error_ctor(fp: &Option<ObjectRef>, proto: ObjectRef, kind_name: &'static str) -> ObjectRef {
    let ctor = new_object(fp.clone());
    let proto_for_call = proto.clone();
    ctor.borrow_mut().callable = Some(Callable::Native(Rc::new(move |vm: &mut Vm, this, args| {
        let target = match &this {
            Value::Object(o) if o.borrow().prototype.is_some() => this.clone(),
            _ => Value::Object(new_object(Some(proto_for_call.clone()))),
        };
        let _ = vm;
        if let Value::Object(o) = &target {
            let mut b = o.borrow_mut();
            b.kind = ObjectKind::Error;
            if !matches!(arg(args, 0), Value::Undefined) {
                b.properties.insert(Rc::from("message"), PropertySlot::Data(Value::string(&to_str(&arg(args, 0)))));
            }
            if !b.properties.contains_key("name") {
                b.properties.insert(Rc::from("name"), PropertySlot::Data(Value::string(kind_name)));
            }
        }
        Ok(target)
    }) as NativeFn));
    ctor.borrow_mut().constructible = true;
    ctor.borrow_mut().properties.insert(Rc::from("prototype"), PropertySlot::Data(Value::Object(proto)));
    ctor
}

fn install_error_ctors(globals: &ObjectRef, fp: &Option<ObjectRef>, vm: &mut Vm) {
    let error_ctor = make_error_ctor(fp, vm.protos.error.clone().unwrap(), "Error");
    let type_error_ctor = make_error_ctor(fp, vm.protos.type_error.clone().unwrap(), "TypeError");
    let range_error_ctor = make_error_ctor(fp, vm.protos.range_error.clone().unwrap(), "RangeError");
    let reference_error_ctor = make_error_ctor(fp, vm.protos.reference_error.clone().unwrap(), "ReferenceError");
    let mut g = globals.borrow_mut();
    g.properties.insert(Rc::from("Error"), PropertySlot::Data(Value::Object(error_ctor)));
    g.properties.insert(Rc::from("TypeError"), PropertySlot::Data(Value::Object(type_error_ctor)));
    g.properties.insert(Rc::from("RangeError"), PropertySlot::Data(Value::Object(range_error_ctor)));
    g.properties.insert(Rc::from("ReferenceError"), PropertySlot::Data(Value::Object(reference_error_ctor)));
}

fn install_regexp_ctor(globals: &ObjectRef, fp: &Option<ObjectRef>, vm: &mut Vm) {
    let regexp_proto = vm.protos.regexp.clone();
    let ctor = new_object(fp.clone());
    ctor.borrow_mut().callable = Some(Callable::Native(Rc::new(|vm: &mut Vm, _this, args| {
        let (source, flags) = match arg(args, 0) {
            Value::Object(o) if matches!(o.borrow().kind, ObjectKind::Regex(_)) => {
                let b = o.borrow();
                let src = match &b.kind {
                    ObjectKind::Regex(p) => p.source.to_string(),
                    _ => unreachable!(),
                };
                (src, to_str(&arg(args, 1)))
            }
            other => (to_str(&other), to_str(&arg(args, 1))),
        };
        make_regexp(vm, &source, &flags).map_err(Thrown::Engine)
    }) as NativeFn));
    ctor.borrow_mut().constructible = true;
    ctor.borrow_mut().properties.insert(Rc::from("prototype"), PropertySlot::Data(Value::Object(regexp_proto.unwrap())));
    globals.borrow_mut().properties.insert(Rc::from("RegExp"), PropertySlot::Data(Value::Object(ctor)));
}

fn make_regexp(vm: &mut Vm, source: &str, flags: &str) -> Result<Value, EngineError> {
    let program = crate::regex::compiler::compile(source, flags)?;
    let mut data = ObjectData::plain(vm.protos.regexp.clone());
    data.kind = ObjectKind::Regex(Rc::new(program));
    data.properties.insert(Rc::from("source"), PropertySlot::Data(Value::string(source)));
    data.properties.insert(Rc::from("flags"), PropertySlot::Data(Value::string(flags)));
    data.properties.insert(Rc::from("global"), PropertySlot::Data(Value::Boolean(flags.contains('g'))));
    data.properties.insert(Rc::from("ignoreCase"), PropertySlot::Data(Value::Boolean(flags.contains('i'))));
    data.properties.insert(Rc::from("multiline"), PropertySlot::Data(Value::Boolean(flags.contains('m'))));
    data.properties.insert(Rc::from("lastIndex"), PropertySlot::Data(Value::Number(0.0)));
    Ok(Value::Object(data.new_ref()))
}

// ---- Array.prototype ----

fn install_array_proto(proto: &ObjectRef, fp: &Option<ObjectRef>) {
    def(proto, fp, "push", 1.0, |_vm, this, args| {
        as_array_mut(&this, |e| e.extend_from_slice(args));
        Ok(Value::Number(array_len(&this) as f64))
    });
    def(proto, fp, "pop", 0.0, |_vm, this, _args| Ok(as_array_mut(&this, |e| e.pop()).flatten().unwrap_or(Value::Undefined)));
    def(proto, fp, "shift", 0.0, |_vm, this, _args| {
        Ok(as_array_mut(&this, |e| if e.is_empty() { None } else { Some(e.remove(0)) }).flatten().unwrap_or(Value::Undefined))
    });
    def(proto, fp, "unshift", 1.0, |_vm, this, args| {
        as_array_mut(&this, |e| {
            for (i, a) in args.iter().enumerate() {
                e.insert(i, a.clone());
            }
        });
        Ok(Value::Number(array_len(&this) as f64))
    });
    def(proto, fp, "reverse", 0.0, |_vm, this, _args| {
        as_array_mut(&this, |e| e.reverse());
        Ok(this)
    });
    def(proto, fp, "slice", 2.0, |_vm, this, args| {
        let elems = elements_of(&this);
        let len = elems.len() as i64;
        let start = slice_index(arg(args, 0), len, 0);
        let end = slice_index(arg(args, 1), len, len);
        let slice = if start < end { elems[start as usize..end as usize].to_vec() } else { Vec::new() };
        Ok(new_array(slice, proto_of(&this)))
    });
    def(proto, fp, "concat", 1.0, |_vm, this, args| {
        let mut out = elements_of(&this);
        for a in args {
            match a {
                Value::Object(o) if matches!(o.borrow().kind, ObjectKind::Array(_)) => out.extend(elements_of(a)),
                other => out.push(other.clone()),
            }
        }
        Ok(new_array(out, proto_of(&this)))
    });
    def(proto, fp, "join", 1.0, |_vm, this, args| {
        let sep = match arg(args, 0) {
            Value::Undefined => ",".to_string(),
            v => to_str(&v),
        };
        let parts: Vec<String> = elements_of(&this)
            .iter()
            .map(|e| if e.is_nullish() { String::new() } else { to_str(e) })
            .collect();
        Ok(Value::string(&parts.join(&sep)))
    });
    def(proto, fp, "includes", 1.0, |_vm, this, args| {
        let needle = arg(args, 0);
        Ok(Value::Boolean(elements_of(&this).iter().any(|e| strict_or_nan_eq(e, &needle))))
    });
    def(proto, fp, "indexOf", 1.0, |_vm, this, args| {
        let needle = arg(args, 0);
        let pos = elements_of(&this).iter().position(|e| crate::vm::strict_eq(e, &needle));
        Ok(Value::Number(pos.map(|p| p as f64).unwrap_or(-1.0)))
    });
    def(proto, fp, "lastIndexOf", 1.0, |_vm, this, args| {
        let needle = arg(args, 0);
        let pos = elements_of(&this).iter().rposition(|e| crate::vm::strict_eq(e, &needle));
        Ok(Value::Number(pos.map(|p| p as f64).unwrap_or(-1.0)))
    });
    def(proto, fp, "forEach", 1.0, |vm, this, args| {
        let cb = arg(args, 0);
        for (i, e) in elements_of(&this).into_iter().enumerate() {
            vm.call_value(cb.clone(), Value::Undefined, &[e, Value::Number(i as f64), this.clone()])?;
        }
        Ok(Value::Undefined)
    });
    def(proto, fp, "map", 1.0, |vm, this, args| {
        let cb = arg(args, 0);
        let mut out = Vec::new();
        for (i, e) in elements_of(&this).into_iter().enumerate() {
            out.push(vm.call_value(cb.clone(), Value::Undefined, &[e, Value::Number(i as f64), this.clone()])?);
        }
        Ok(new_array(out, proto_of(&this)))
    });
    def(proto, fp, "filter", 1.0, |vm, this, args| {
        let cb = arg(args, 0);
        let mut out = Vec::new();
        for (i, e) in elements_of(&this).into_iter().enumerate() {
            let keep = vm.call_value(cb.clone(), Value::Undefined, &[e.clone(), Value::Number(i as f64), this.clone()])?;
            if keep.to_bool() {
                out.push(e);
            }
        }
        Ok(new_array(out, proto_of(&this)))
    });
    def(proto, fp, "reduce", 2.0, |vm, this, args| {
        let cb = arg(args, 0);
        let elems = elements_of(&this);
        let mut iter = elems.into_iter().enumerate();
        let mut acc = if args.len() > 1 {
            arg(args, 1)
        } else {
            match iter.next() {
                Some((_, v)) => v,
                None => return Err(Thrown::type_error("Reduce of empty array with no initial value")),
            }
        };
        for (i, e) in iter {
            acc = vm.call_value(cb.clone(), Value::Undefined, &[acc, e, Value::Number(i as f64), this.clone()])?;
        }
        Ok(acc)
    });
    def(proto, fp, "find", 1.0, |vm, this, args| {
        let cb = arg(args, 0);
        for (i, e) in elements_of(&this).into_iter().enumerate() {
            let hit = vm.call_value(cb.clone(), Value::Undefined, &[e.clone(), Value::Number(i as f64), this.clone()])?;
            if hit.to_bool() {
                return Ok(e);
            }
        }
        Ok(Value::Undefined)
    });
    def(proto, fp, "findIndex", 1.0, |vm, this, args| {
        let cb = arg(args, 0);
        for (i, e) in elements_of(&this).into_iter().enumerate() {
            let hit = vm.call_value(cb.clone(), Value::Undefined, &[e, Value::Number(i as f64), this.clone()])?;
            if hit.to_bool() {
                return Ok(Value::Number(i as f64));
            }
        }
        Ok(Value::Number(-1.0))
    });
    def(proto, fp, "some", 1.0, |vm, this, args| {
        let cb = arg(args, 0);
        for (i, e) in elements_of(&this).into_iter().enumerate() {
            let hit = vm.call_value(cb.clone(), Value::Undefined, &[e, Value::Number(i as f64), this.clone()])?;
            if hit.to_bool() {
                return Ok(Value::Boolean(true));
            }
        }
        Ok(Value::Boolean(false))
    });
    def(proto, fp, "every", 1.0, |vm, this, args| {
        let cb = arg(args, 0);
        for (i, e) in elements_of(&this).into_iter().enumerate() {
            let hit = vm.call_value(cb.clone(), Value::Undefined, &[e, Value::Number(i as f64), this.clone()])?;
            if !hit.to_bool() {
                return Ok(Value::Boolean(false));
            }
        }
        Ok(Value::Boolean(true))
    });
    def(proto, fp, "toString", 0.0, |_vm, this, _args| {
        let parts: Vec<String> = elements_of(&this).iter().map(|e| if e.is_nullish() { String::new() } else { to_str(e) }).collect();
        Ok(Value::string(&parts.join(",")))
    });
}

fn strict_or_nan_eq(a: &Value, b: &Value) -> bool {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        if x.is_nan() && y.is_nan() {
            return true;
        }
    }
    crate::vm::strict_eq(a, b)
}

fn slice_index(v: Value, len: i64, default: i64) -> i64 {
    match v {
        Value::Undefined => default,
        other => {
            let n = to_number(&other) as i64;
            let n = if n < 0 { (len + n).max(0) } else { n.min(len) };
            n
        }
    }
}

fn proto_of(v: &Value) -> Option<ObjectRef> {
    match v {
        Value::Object(o) => o.borrow().prototype.clone(),
        _ => None,
    }
}

fn array_len(v: &Value) -> usize {
    match v {
        Value::Object(o) => match &o.borrow().kind {
            ObjectKind::Array(e) => e.len(),
            _ => 0,
        },
        _ => 0,
    }
}

fn as_array_mut<T>(v: &Value, f: impl FnOnce(&mut Vec<Value>) -> T) -> Option<T> {
    match v {
        Value::Object(o) => {
            let mut b = o.borrow_mut();
            match &mut b.kind {
                ObjectKind::Array(e) => Some(f(e)),
                _ => None,
            }
        }
        _ => None,
    }
}

// ---- String.prototype ----

fn install_string_proto(proto: &ObjectRef, fp: &Option<ObjectRef>) {
    def(proto, fp, "charAt", 1.0, |_vm, this, args| {
        let s = chars_of(&this);
        let i = to_number(&arg(args, 0)) as i64;
        Ok(Value::string(&i.try_into().ok().and_then(|i: usize| s.get(i)).map(|c| c.to_string()).unwrap_or_default()))
    });
    def(proto, fp, "charCodeAt", 1.0, |_vm, this, args| {
        let units = js_string(&to_str(&this));
        let i = to_number(&arg(args, 0)) as i64;
        match usize::try_from(i).ok().and_then(|i| units.get(i)) {
            Some(u) => Ok(Value::Number(*u as f64)),
            None => Ok(Value::Number(f64::NAN)),
        }
    });
    def(proto, fp, "indexOf", 1.0, |_vm, this, args| {
        let s = to_str(&this);
        let needle = to_str(&arg(args, 0));
        Ok(Value::Number(utf16_find(&s, &needle, false).map(|i| i as f64).unwrap_or(-1.0)))
    });
    def(proto, fp, "lastIndexOf", 1.0, |_vm, this, args| {
        let s = to_str(&this);
        let needle = to_str(&arg(args, 0));
        Ok(Value::Number(utf16_find(&s, &needle, true).map(|i| i as f64).unwrap_or(-1.0)))
    });
    def(proto, fp, "includes", 1.0, |_vm, this, args| Ok(Value::Boolean(to_str(&this).contains(&to_str(&arg(args, 0))))));
    def(proto, fp, "startsWith", 1.0, |_vm, this, args| Ok(Value::Boolean(to_str(&this).starts_with(&to_str(&arg(args, 0))))));
    def(proto, fp, "endsWith", 1.0, |_vm, this, args| Ok(Value::Boolean(to_str(&this).ends_with(&to_str(&arg(args, 0))))));
    def(proto, fp, "toLowerCase", 0.0, |_vm, this, _args| Ok(Value::string(&to_str(&this).to_lowercase())));
    def(proto, fp, "toUpperCase", 0.0, |_vm, this, _args| Ok(Value::string(&to_str(&this).to_uppercase())));
    def(proto, fp, "trim", 0.0, |_vm, this, _args| Ok(Value::string(to_str(&this).trim())));
    def(proto, fp, "concat", 1.0, |_vm, this, args| {
        let mut s = to_str(&this);
        for a in args {
            s.push_str(&to_str(a));
        }
        Ok(Value::string(&s))
    });
    def(proto, fp, "repeat", 1.0, |_vm, this, args| {
        let n = to_number(&arg(args, 0));
        if n < 0.0 || !n.is_finite() {
            return Err(Thrown::range_error("invalid count value"));
        }
        Ok(Value::string(&to_str(&this).repeat(n as usize)))
    });
    def(proto, fp, "substring", 2.0, |_vm, this, args| {
        let chars = chars_of(&this);
        let len = chars.len() as i64;
        let clamp = |v: Value| -> i64 {
            match v {
                Value::Undefined => len,
                other => (to_number(&other) as i64).clamp(0, len),
            }
        };
        let mut a = clamp(arg(args, 0));
        let mut b = clamp(arg(args, 1));
        if a > b {
            std::mem::swap(&mut a, &mut b);
        }
        Ok(Value::string(&chars[a as usize..b as usize].iter().collect::<String>()))
    });
    def(proto, fp, "slice", 2.0, |_vm, this, args| {
        let chars = chars_of(&this);
        let len = chars.len() as i64;
        let start = slice_index(arg(args, 0), len, 0);
        let end = slice_index(arg(args, 1), len, len);
        let s = if start < end { chars[start as usize..end as usize].iter().collect() } else { String::new() };
        Ok(Value::string(&s))
    });
    def(proto, fp, "split", 1.0, |_vm, this, args| {
        let s = to_str(&this);
        let parts: Vec<Value> = match arg(args, 0) {
            Value::Undefined => vec![Value::string(&s)],
            sep => {
                let sep = to_str(&sep);
                if sep.is_empty() {
                    s.chars().map(|c| Value::string(&c.to_string())).collect()
                } else {
                    s.split(sep.as_str()).map(Value::string).collect()
                }
            }
        };
        Ok(new_array(parts, None))
    });
    def(proto, fp, "replace", 2.0, |vm, this, args| {
        let s = to_str(&this);
        match arg(args, 0) {
            Value::Object(o) if matches!(o.borrow().kind, ObjectKind::Regex(_)) => {
                let global = matches!(o.borrow().properties.get("global"), Some(PropertySlot::Data(Value::Boolean(true))));
                regex_replace(vm, &o, &s, arg(args, 1), global)
            }
            pattern => {
                let pattern = to_str(&pattern);
                let replacement = to_str(&arg(args, 1));
                Ok(Value::string(&s.replacen(&pattern, &replacement, 1)))
            }
        }
    });
    def(proto, fp, "toString", 0.0, |_vm, this, _args| Ok(Value::string(&to_str(&this))));
}

fn utf16_find(haystack: &str, needle: &str, last: bool) -> Option<usize> {
    let h = js_string(haystack);
    let n = js_string(needle);
    if n.is_empty() {
        return Some(if last { h.len() } else { 0 });
    }
    if n.len() > h.len() {
        return None;
    }
    let positions = 0..=(h.len() - n.len());
    let mut found = None;
    for i in positions {
        if &h[i..i + n.len()] == &n[..] {
            found = Some(i);
            if !last {
                break;
            }
        }
    }
    found
}

fn regex_replace(vm: &mut Vm, regex_obj: &ObjectRef, haystack: &str, replacement: Value, global: bool) -> Result<Value, Thrown> {
    let program = match &regex_obj.borrow().kind {
        ObjectKind::Regex(p) => p.clone(),
        _ => return Ok(Value::string(haystack)),
    };
    let chars: Vec<char> = haystack.chars().collect();
    let matcher = Matcher::new(&program);
    let mut out = String::new();
    let mut pos = 0usize;
    loop {
        let m = matcher.find_from(&chars, pos, &mut poll_fn(vm)).map_err(Thrown::Engine)?;
        match m {
            None => {
                out.extend(&chars[pos..]);
                break;
            }
            Some(found) => {
                let (start, end) = found.group(0).unwrap();
                out.extend(&chars[pos..start]);
                let matched: String = chars[start..end].iter().collect();
                let rep = match &replacement {
                    Value::Object(o) if o.borrow().callable.is_some() => {
                        let mut call_args = vec![Value::string(&matched)];
                        for g in 1..=program.group_count {
                            call_args.push(found.group(g).map(|(a, b)| Value::string(&chars[a..b].iter().collect::<String>())).unwrap_or(Value::Undefined));
                        }
                        call_args.push(Value::Number(start as f64));
                        call_args.push(Value::string(haystack));
                        to_str(&vm.call_value(replacement.clone(), Value::Undefined, &call_args)?)
                    }
                    other => expand_replacement(&to_str(other), &chars, &found, program.group_count),
                };
                out.push_str(&rep);
                pos = if end > start { end } else { end + 1 };
                if !global {
                    out.extend(&chars[end..]);
                    break;
                }
                if pos > chars.len() {
                    break;
                }
            }
        }
    }
    Ok(Value::string(&out))
}

fn expand_replacement(template: &str, chars: &[char], m: &crate::regex::matcher::MatchResult, group_count: usize) -> String {
    let mut out = String::new();
    let tchars: Vec<char> = template.chars().collect();
    let mut i = 0;
    while i < tchars.len() {
        if tchars[i] == '$' && i + 1 < tchars.len() {
            let next = tchars[i + 1];
            if next == '$' {
                out.push('$');
                i += 2;
                continue;
            }
            if next == '&' {
                if let Some((a, b)) = m.group(0) {
                    out.extend(&chars[a..b]);
                }
                i += 2;
                continue;
            }
            if let Some(d) = next.to_digit(10) {
                let g = d as usize;
                if g >= 1 && g <= group_count {
                    if let Some((a, b)) = m.group(g) {
                        out.extend(&chars[a..b]);
                    }
                    i += 2;
                    continue;
                }
            }
        }
        out.push(tchars[i]);
        i += 1;
    }
    out
}

/// Regex execution shares the embedder's poll hook rather than the VM's
/// instruction-budget counter (which is private to `vm.rs`): the matcher
/// already throttles how often it's consulted (`Matcher::poll_interval`).
fn poll_fn(vm: &mut Vm) -> impl FnMut() -> bool + '_ {
    move || match vm.poll.as_mut() {
        Some(poll) => poll(),
        None => false,
    }
}

// ---- Number.prototype / Boolean.prototype ----

fn install_number_proto(proto: &ObjectRef, fp: &Option<ObjectRef>) {
    def(proto, fp, "toFixed", 1.0, |_vm, this, args| {
        let n = to_number(&this);
        let digits = to_number(&arg(args, 0)).max(0.0) as usize;
        Ok(Value::string(&format!("{:.*}", digits, n)))
    });
    def(proto, fp, "toString", 1.0, |_vm, this, args| {
        let n = to_number(&this);
        match arg(args, 0) {
            Value::Undefined => Ok(Value::string(&format_number(n))),
            radix_v => {
                let radix = to_number(&radix_v) as u32;
                if radix == 10 {
                    Ok(Value::string(&format_number(n)))
                } else {
                    Ok(Value::string(&to_radix_string(n, radix)))
                }
            }
        }
    });
}

fn to_radix_string(n: f64, radix: u32) -> String {
    if n == 0.0 {
        return "0".to_string();
    }
    let neg = n < 0.0;
    let mut i = n.abs().trunc() as i64;
    let digits = "0123456789abcdefghijklmnopqrstuvwxyz".as_bytes();
    let mut out = Vec::new();
    while i > 0 {
        out.push(digits[(i % radix as i64) as usize]);
        i /= radix as i64;
    }
    if neg {
        out.push(b'-');
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

fn install_boolean_proto(proto: &ObjectRef, fp: &Option<ObjectRef>) {
    def(proto, fp, "toString", 0.0, |_vm, this, _args| Ok(Value::string(&this.to_bool().to_string())));
}

// ---- Function.prototype ----

fn install_function_proto(proto: &ObjectRef, fp: &Option<ObjectRef>) {
    def(proto, fp, "call", 1.0, |vm, this, args| {
        let bound_this = arg(args, 0);
        let rest = if args.is_empty() { &[][..] } else { &args[1..] };
        vm.call_value(this, bound_this, rest)
    });
    def(proto, fp, "apply", 2.0, |vm, this, args| {
        let bound_this = arg(args, 0);
        let call_args = elements_of(&arg(args, 1));
        vm.call_value(this, bound_this, &call_args)
    });
    def(proto, fp, "bind", 1.0, |_vm, this, args| {
        let bound_this = arg(args, 0);
        let bound_args: Vec<Value> = args.get(1..).map(|s| s.to_vec()).unwrap_or_default();
        let target = this.clone();
        let mut data = ObjectData::plain(proto_of(&this));
        data.callable = Some(Callable::Native(Rc::new(move |vm: &mut Vm, _this, call_args| {
            let mut all = bound_args.clone();
            all.extend_from_slice(call_args);
            vm.call_value(target.clone(), bound_this.clone(), &all)
        }) as NativeFn));
        Ok(Value::Object(data.new_ref()))
    });
    def(proto, fp, "toString", 0.0, |_vm, this, _args| Ok(Value::string(&to_display_string(&this))));
}

// ---- RegExp.prototype ----

fn install_regexp_proto(proto: &ObjectRef, fp: &Option<ObjectRef>) {
    def(proto, fp, "test", 1.0, |vm, this, args| {
        Ok(Value::Boolean(regex_exec(vm, &this, &to_str(&arg(args, 0)))?.is_some()))
    });
    def(proto, fp, "exec", 1.0, |vm, this, args| match regex_exec(vm, &this, &to_str(&arg(args, 0)))? {
        Some(m) => Ok(m),
        None => Ok(Value::Null),
    });
    def(proto, fp, "toString", 0.0, |_vm, this, _args| Ok(Value::string(&to_display_string(&this))));
}

/// Runs `this`'s pattern against `input`, building the `[0]`/numbered/named
/// capture result object spec.md §6.3 describes, and advancing `lastIndex`
/// for a sticky/global match the way `RegExp.prototype.exec` does.
fn regex_exec(vm: &mut Vm, this: &Value, input: &str) -> Result<Option<Value>, Thrown> {
    let obj = match this {
        Value::Object(o) => o.clone(),
        _ => return Err(Thrown::type_error("not a RegExp")),
    };
    let program = match &obj.borrow().kind {
        ObjectKind::Regex(p) => p.clone(),
        _ => return Err(Thrown::type_error("not a RegExp")),
    };
    let global = matches!(obj.borrow().properties.get("global"), Some(PropertySlot::Data(Value::Boolean(true))));
    let start = if global {
        match obj.borrow().properties.get("lastIndex") {
            Some(PropertySlot::Data(Value::Number(n))) => *n as usize,
            _ => 0,
        }
    } else {
        0
    };
    let chars: Vec<char> = input.chars().collect();
    if start > chars.len() {
        if global {
            obj.borrow_mut().properties.insert(Rc::from("lastIndex"), PropertySlot::Data(Value::Number(0.0)));
        }
        return Ok(None);
    }
    let matcher = Matcher::new(&program);
    let result = matcher.find_from(&chars, start, &mut poll_fn(vm)).map_err(Thrown::Engine)?;
    match result {
        None => {
            if global {
                obj.borrow_mut().properties.insert(Rc::from("lastIndex"), PropertySlot::Data(Value::Number(0.0)));
            }
            Ok(None)
        }
        Some(m) => {
            let (mstart, mend) = m.group(0).unwrap();
            if global {
                let next = if mend > mstart { mend } else { mend + 1 };
                obj.borrow_mut().properties.insert(Rc::from("lastIndex"), PropertySlot::Data(Value::Number(next as f64)));
            }
            let mut elements = Vec::with_capacity(program.group_count + 1);
            for g in 0..=program.group_count {
                elements.push(match m.group(g) {
                    Some((a, b)) => Value::string(&chars[a..b].iter().collect::<String>()),
                    None => Value::Undefined,
                });
            }
            let result_obj = ObjectData::array(elements, vm.protos.array.clone()).new_ref();
            {
                let mut b = result_obj.borrow_mut();
                b.properties.insert(Rc::from("index"), PropertySlot::Data(Value::Number(mstart as f64)));
                b.properties.insert(Rc::from("input"), PropertySlot::Data(Value::string(input)));
                if !program.group_names.is_empty() {
                    let groups_obj = new_object(vm.protos.object.clone());
                    for (name, idx) in &program.group_names {
                        let v = match m.group(*idx) {
                            Some((a, b)) => Value::string(&chars[a..b].iter().collect::<String>()),
                            None => Value::Undefined,
                        };
                        groups_obj.borrow_mut().properties.insert(Rc::from(name.as_str()), PropertySlot::Data(v));
                    }
                    b.properties.insert(Rc::from("groups"), PropertySlot::Data(Value::Object(groups_obj)));
                }
            }
            Ok(Some(Value::Object(result_obj)))
        }
    }
}

// ---- Error.prototype (shared shape for every error kind) ----

fn install_error_proto(proto: &ObjectRef, fp: &Option<ObjectRef>, name: &'static str) {
    proto.borrow_mut().properties.insert(Rc::from("name"), PropertySlot::Data(Value::string(name)));
    proto.borrow_mut().properties.insert(Rc::from("message"), PropertySlot::Data(Value::string("")));
    def(proto, fp, "toString", 0.0, |_vm, this, _args| Ok(Value::string(&to_display_string(&this))));
}

// ---- Math / JSON / console / globals ----

fn install_globals(globals: &ObjectRef, fp: &Option<ObjectRef>, vm: &mut Vm) {
    install_math(globals, fp);
    install_json(globals, fp, vm);

    let console = new_object(vm.protos.object.clone());
    def(&console, fp, "log", 0.0, |vm, _this, args| {
        let line = args.iter().map(to_display_string).collect::<Vec<_>>().join(" ");
        if let Some(sink) = vm.print_sink.as_mut() {
            sink(&line);
        }
        Ok(Value::Undefined)
    });
    globals.borrow_mut().properties.insert(Rc::from("console"), PropertySlot::Data(Value::Object(console)));

    // `print` is the bare-function sibling of `console.log` (SPEC_FULL.md §4).
    let print = new_object(fp.clone());
    print.borrow_mut().callable = Some(Callable::Native(Rc::new(|vm: &mut Vm, _this, args| {
        let line = args.iter().map(to_display_string).collect::<Vec<_>>().join(" ");
        if let Some(sink) = vm.print_sink.as_mut() {
            sink(&line);
        }
        Ok(Value::Undefined)
    }) as NativeFn));
    globals.borrow_mut().properties.insert(Rc::from("print"), PropertySlot::Data(Value::Object(print)));

    let date = new_object(fp.clone());
    def(&date, fp, "now", 0.0, |_vm, _this, _args| {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0);
        Ok(Value::Number(millis))
    });
    globals.borrow_mut().properties.insert(Rc::from("Date"), PropertySlot::Data(Value::Object(date)));

    globals.borrow_mut().properties.insert(Rc::from("NaN"), PropertySlot::Data(Value::Number(f64::NAN)));
    globals.borrow_mut().properties.insert(Rc::from("Infinity"), PropertySlot::Data(Value::Number(f64::INFINITY)));
    globals.borrow_mut().properties.insert(Rc::from("undefined"), PropertySlot::Data(Value::Undefined));
}

fn install_math(globals: &ObjectRef, fp: &Option<ObjectRef>) {
    let math = new_object(None);
    {
        let mut b = math.borrow_mut();
        b.properties.insert(Rc::from("PI"), PropertySlot::Data(Value::Number(std::f64::consts::PI)));
        b.properties.insert(Rc::from("E"), PropertySlot::Data(Value::Number(std::f64::consts::E)));
        b.properties.insert(Rc::from("LN2"), PropertySlot::Data(Value::Number(std::f64::consts::LN_2)));
        b.properties.insert(Rc::from("LN10"), PropertySlot::Data(Value::Number(std::f64::consts::LN_10)));
        b.properties.insert(Rc::from("SQRT2"), PropertySlot::Data(Value::Number(std::f64::consts::SQRT_2)));
    }
    macro_rules! unary {
        ($name:literal, $f:expr) => {
            def(&math, fp, $name, 1.0, |_vm, _this, args| Ok(Value::Number(($f)(to_number(&arg(args, 0))))));
        };
    }
    unary!("abs", f64::abs);
    unary!("floor", f64::floor);
    unary!("ceil", f64::ceil);
    unary!("round", |n: f64| (n + 0.5).floor());
    unary!("trunc", f64::trunc);
    unary!("sqrt", f64::sqrt);
    unary!("cbrt", f64::cbrt);
    unary!("sign", f64::signum);
    unary!("sin", f64::sin);
    unary!("cos", f64::cos);
    unary!("tan", f64::tan);
    unary!("log", f64::ln);
    unary!("log2", f64::log2);
    unary!("log10", f64::log10);
    unary!("exp", f64::exp);
    def(&math, fp, "pow", 2.0, |_vm, _this, args| Ok(Value::Number(to_number(&arg(args, 0)).powf(to_number(&arg(args, 1))))));
    def(&math, fp, "max", 2.0, |_vm, _this, args| {
        Ok(Value::Number(args.iter().map(to_number).fold(f64::NEG_INFINITY, f64::max)))
    });
    def(&math, fp, "min", 2.0, |_vm, _this, args| {
        Ok(Value::Number(args.iter().map(to_number).fold(f64::INFINITY, f64::min)))
    });
    def(&math, fp, "random", 0.0, |_vm, _this, _args| Ok(Value::Number(rand::random::<f64>())));
    globals.borrow_mut().properties.insert(Rc::from("Math"), PropertySlot::Data(Value::Object(math)));
}

fn install_json(globals: &ObjectRef, fp: &Option<ObjectRef>, vm: &mut Vm) {
    let json = new_object(vm.protos.object.clone());
    def(&json, fp, "stringify", 1.0, |_vm, _this, args| match value_to_json(&arg(args, 0)) {
        Some(j) => Ok(Value::string(&serde_json::to_string(&j).unwrap_or_else(|_| "null".to_string()))),
        None => Ok(Value::Undefined),
    });
    def(&json, fp, "parse", 1.0, |vm, _this, args| {
        let text = to_str(&arg(args, 0));
        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| Thrown::Engine(EngineError::syntax(format!("JSON.parse: {}", e), crate::errors::SourceLocation::unknown())))?;
        json_to_value(&parsed, vm)
    });
    globals.borrow_mut().properties.insert(Rc::from("JSON"), PropertySlot::Data(Value::Object(json)));
}

/// Converts an engine `Value` into `serde_json::Value`, or `None` when the
/// value has no JSON representation (`undefined`, functions) — mirrors
/// `JSON.stringify`'s own "omit/convert to null" rule at the call site.
fn value_to_json(v: &Value) -> Option<serde_json::Value> {
    match v {
        Value::Undefined => None,
        Value::Object(o) if o.borrow().callable.is_some() => None,
        Value::Null => Some(serde_json::Value::Null),
        Value::Boolean(b) => Some(serde_json::Value::Bool(*b)),
        Value::Number(n) => Some(serde_json::Number::from_f64(*n).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null)),
        Value::String(s) => Some(serde_json::Value::String(js_string_to_utf8(s))),
        Value::Object(o) => {
            let b = o.borrow();
            match &b.kind {
                ObjectKind::Array(elems) => {
                    let arr: Vec<serde_json::Value> = elems.iter().map(|e| value_to_json(e).unwrap_or(serde_json::Value::Null)).collect();
                    Some(serde_json::Value::Array(arr))
                }
                _ => {
                    let mut map = serde_json::Map::new();
                    for k in b.properties.keys() {
                        if let Some(PropertySlot::Data(val)) = b.properties.get(k) {
                            if let Some(j) = value_to_json(val) {
                                map.insert(k.to_string(), j);
                            }
                        }
                    }
                    Some(serde_json::Value::Object(map))
                }
            }
        }
    }
}

/// Converts a `serde_json::Value` into an engine `Value`, charging the
/// memory budget per object/array the same way `Object`/`ArrayFrom`
/// bytecode does, so a pathological `JSON.parse` payload is bounded by the
/// same limit as script-level allocation.
fn json_to_value(j: &serde_json::Value, vm: &mut Vm) -> Result<Value, Thrown> {
    match j {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
        serde_json::Value::Number(n) => Ok(Value::Number(n.as_f64().unwrap_or(f64::NAN))),
        serde_json::Value::String(s) => Ok(Value::string(s)),
        serde_json::Value::Array(items) => {
            vm.charge(cost::OBJECT_BASE + items.len() * cost::ARRAY_ELEMENT)?;
            let mut elems = Vec::with_capacity(items.len());
            for item in items {
                elems.push(json_to_value(item, vm)?);
            }
            Ok(new_array(elems, vm.protos.array.clone()))
        }
        serde_json::Value::Object(map) => {
            vm.charge(cost::OBJECT_BASE + map.len() * cost::PROPERTY_SLOT)?;
            let obj = new_object(vm.protos.object.clone());
            for (k, val) in map {
                let v = json_to_value(val, vm)?;
                obj.borrow_mut().properties.insert(Rc::from(k.as_str()), PropertySlot::Data(v));
            }
            Ok(Value::Object(obj))
        }
    }
}
