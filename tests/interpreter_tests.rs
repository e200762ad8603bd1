// Integration tests for the sandboxed script engine.
//
// Each test drives a fresh `Context` through `eval` and checks either the
// completion value or the shape of a raised `EvalError`. Tests are grouped
// by the engine subsystem they exercise: lexer/parser nesting limits,
// closures and scoping, control flow and exceptions, the regex engine,
// builtins, and budget enforcement.

use sandbox_script::context::{Context, ContextOptions, EvalError};
use sandbox_script::value::Value;
use std::time::Duration;

fn number(ctx: &mut Context, src: &str) -> f64 {
    match ctx.eval(src).unwrap_or_else(|e| panic!("eval failed for {:?}: {}", src, e)) {
        Value::Number(n) => n,
        other => panic!("expected number, got {:?}", other),
    }
}

fn string(ctx: &mut Context, src: &str) -> String {
    match ctx.eval(src).unwrap_or_else(|e| panic!("eval failed for {:?}: {}", src, e)) {
        Value::String(s) => sandbox_script::value::js_string_to_utf8(&s),
        other => panic!("expected string, got {:?}", other),
    }
}

fn boolean(ctx: &mut Context, src: &str) -> bool {
    match ctx.eval(src).unwrap_or_else(|e| panic!("eval failed for {:?}: {}", src, e)) {
        Value::Boolean(b) => b,
        other => panic!("expected boolean, got {:?}", other),
    }
}

#[test]
fn arithmetic_and_string_concat() {
    let mut ctx = Context::new();
    assert_eq!(number(&mut ctx, "1 + 2"), 3.0);
    assert_eq!(number(&mut ctx, "2 * (3 + 4) - 1"), 13.0);
    assert_eq!(string(&mut ctx, "'a' + 'b' + 1"), "ab1");
    assert_eq!(number(&mut ctx, "10 % 3"), 1.0);
    assert_eq!(number(&mut ctx, "2 ** 10"), 1024.0);
}

#[test]
fn numeric_edge_cases() {
    let mut ctx = Context::new();
    assert!(boolean(&mut ctx, "1/0 === Infinity"));
    assert!(boolean(&mut ctx, "-1/0 === -Infinity"));
    assert!(boolean(&mut ctx, "Number.isNaN(0/0)"));
    assert!(boolean(&mut ctx, "0/0 !== 0/0"));
}

#[test]
fn closures_share_cell_within_call_not_across_calls() {
    let mut ctx = Context::new();
    let src = r#"
        function mk() { var c = 0; return function() { return ++c; }; }
        var f = mk();
        f(); f(); f();
    "#;
    assert_eq!(number(&mut ctx, src), 3.0);

    let src2 = r#"
        function mk() { var c = 0; return { inc: function(){ return ++c; }, get: function(){ return c; } }; }
        var a = mk();
        var b = mk();
        a.inc(); a.inc();
        b.inc();
        a.get() + b.get();
    "#;
    assert_eq!(number(&mut ctx, src2), 3.0);
}

#[test]
fn array_filter_and_reduce_chain() {
    let mut ctx = Context::new();
    let src = "[1,2,3,4].filter(function(x){return x%2===0;}).reduce(function(a,b){return a+b;},0)";
    assert_eq!(number(&mut ctx, src), 6.0);
}

#[test]
fn array_higher_order_methods() {
    let mut ctx = Context::new();
    assert_eq!(string(&mut ctx, "[1,2,3].map(function(x){return x*2;}).join(',')"), "2,4,6");
    assert!(boolean(&mut ctx, "[1,2,3].some(function(x){return x > 2;})"));
    assert!(boolean(&mut ctx, "[1,2,3].every(function(x){return x > 0;})"));
    assert_eq!(number(&mut ctx, "[1,2,3].indexOf(2)"), 1.0);
    assert_eq!(number(&mut ctx, "[1,2,3].find(function(x){return x>1;})"), 2.0);
}

#[test]
fn try_catch_finally_runs_exactly_once_on_thrown_path() {
    let mut ctx = Context::new();
    let src = r#"var s=""; try{s+="t"; throw "c";}catch(e){s+=e;}finally{s+="f";} s;"#;
    assert_eq!(string(&mut ctx, src), "tcf");
}

#[test]
fn try_finally_runs_once_on_normal_path() {
    let mut ctx = Context::new();
    let src = r#"var s=""; try{s+="t";}finally{s+="f";} s;"#;
    assert_eq!(string(&mut ctx, src), "tf");
}

#[test]
fn try_finally_runs_once_on_return_path() {
    let mut ctx = Context::new();
    let src = r#"
        var log = "";
        function f() {
            try { log += "t"; return "r"; }
            finally { log += "f"; }
        }
        f();
        log;
    "#;
    assert_eq!(string(&mut ctx, src), "tf");
}

#[test]
fn try_finally_runs_once_when_uncaught() {
    let mut ctx = Context::new();
    let src = r#"
        var log = "";
        function f() {
            try { throw "boom"; }
            finally { log += "f"; }
        }
        try { f(); } catch (e) { log += e; }
        log;
    "#;
    assert_eq!(string(&mut ctx, src), "fboom");
}

#[test]
fn try_finally_runs_once_on_break_path() {
    let mut ctx = Context::new();
    let src = r#"
        var log = "";
        for (var i = 0; i < 3; i++) {
            try { log += "t" + i; if (i === 1) break; }
            finally { log += "f"; }
        }
        log;
    "#;
    assert_eq!(string(&mut ctx, src), "t0ft1f");
}

#[test]
fn try_finally_runs_once_on_continue_path() {
    let mut ctx = Context::new();
    let src = r#"
        var log = "";
        for (var i = 0; i < 3; i++) {
            try { log += "t" + i; continue; }
            finally { log += "f"; }
        }
        log;
    "#;
    assert_eq!(string(&mut ctx, src), "t0ft1ft2f");
}

#[test]
fn try_finally_does_not_double_run_when_loop_is_inside_the_try() {
    let mut ctx = Context::new();
    let src = r#"
        var log = "";
        try {
            for (var i = 0; i < 3; i++) {
                if (i === 1) break;
                log += "t" + i;
            }
            log += "b";
        } finally { log += "f"; }
        log;
    "#;
    assert_eq!(string(&mut ctx, src), "t0bf");
}

#[test]
fn for_in_visits_own_properties_in_insertion_order() {
    let mut ctx = Context::new();
    let src = r#"
        var o = {};
        o.z = 1; o.a = 2; o.m = 3;
        var keys = "";
        for (var k in o) { keys += k; }
        keys;
    "#;
    assert_eq!(string(&mut ctx, src), "zam");
}

#[test]
fn json_stringify_preserves_insertion_order() {
    let mut ctx = Context::new();
    assert_eq!(string(&mut ctx, "JSON.stringify({a:1,b:[2,3]})"), "{\"a\":1,\"b\":[2,3]}");
}

#[test]
fn json_round_trip() {
    let mut ctx = Context::new();
    let src = r#"
        var v = {a: 1, b: [2, 3, null, true, false], c: "hi", d: {e: 5}};
        JSON.stringify(JSON.parse(JSON.stringify(v))) === JSON.stringify(v);
    "#;
    assert!(boolean(&mut ctx, src));
}

#[test]
fn regex_exec_captures_groups_and_index() {
    let mut ctx = Context::new();
    match ctx.eval(r#"/(\w+)@(\w+)/.exec("user@host")"#).unwrap() {
        Value::Object(o) => {
            let arr = o.borrow();
            match &arr.kind {
                sandbox_script::value::ObjectKind::Array(elems) => {
                    assert_eq!(elems.len(), 3);
                    assert_eq!(sandbox_script::builtins::to_display_string(&elems[0]), "user@host");
                    assert_eq!(sandbox_script::builtins::to_display_string(&elems[1]), "user");
                    assert_eq!(sandbox_script::builtins::to_display_string(&elems[2]), "host");
                }
                _ => panic!("exec result should be array-shaped"),
            }
            match arr.properties.get("index") {
                Some(sandbox_script::value::PropertySlot::Data(Value::Number(n))) => assert_eq!(*n, 0.0),
                other => panic!("expected index property, got {}", other.is_some()),
            }
        }
        other => panic!("expected match array, got {:?}", other),
    }
}

#[test]
fn regex_test_and_global_flag_advance_last_index() {
    let mut ctx = Context::new();
    let src = r#"
        var re = /a/g;
        var count = 0;
        while (re.test("aaa")) { count++; }
        count;
    "#;
    assert_eq!(number(&mut ctx, src), 3.0);
}

#[test]
fn regex_zero_advance_quantifier_terminates() {
    let mut ctx = Context::new();
    let src = r#"/(a*)*/.test("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaab")"#;
    assert!(boolean(&mut ctx, src));
}

#[test]
fn regex_replace_with_capture_groups() {
    let mut ctx = Context::new();
    assert_eq!(string(&mut ctx, r#""2024-01-15".replace(/(\d+)-(\d+)-(\d+)/, "$3/$2/$1")"#), "15/01/2024");
}

#[test]
fn string_builtin_methods() {
    let mut ctx = Context::new();
    assert_eq!(string(&mut ctx, "'Hello'.toLowerCase()"), "hello");
    assert_eq!(string(&mut ctx, "'  hi  '.trim()"), "hi");
    assert!(boolean(&mut ctx, "'hello world'.includes('world')"));
    assert_eq!(number(&mut ctx, "'hello'.indexOf('l')"), 2.0);
    assert_eq!(string(&mut ctx, "'ab'.repeat(3)"), "ababab");
    assert_eq!(string(&mut ctx, "'hello world'.split(' ').join('-')"), "hello-world");
}

#[test]
fn object_keys_values_entries() {
    let mut ctx = Context::new();
    assert_eq!(string(&mut ctx, "Object.keys({a:1,b:2}).join(',')"), "a,b");
    assert_eq!(number(&mut ctx, "Object.values({a:1,b:2}).reduce(function(a,b){return a+b;},0)"), 3.0);
}

#[test]
fn math_builtins() {
    let mut ctx = Context::new();
    assert_eq!(number(&mut ctx, "Math.max(1,5,3)"), 5.0);
    assert_eq!(number(&mut ctx, "Math.floor(3.7)"), 3.0);
    assert_eq!(number(&mut ctx, "Math.abs(-4)"), 4.0);
}

#[test]
fn deeply_nested_parens_do_not_exhaust_the_host_stack() {
    let mut ctx = Context::new();
    let n = 1000;
    let src = format!("{}1{}", "(".repeat(n), ")".repeat(n));
    assert_eq!(number(&mut ctx, &src), 1.0);
}

#[test]
fn deeply_nested_blocks_do_not_exhaust_the_host_stack() {
    let mut ctx = Context::new();
    let n = 1000;
    let src = format!("{}1;{}", "{".repeat(n), "}".repeat(n));
    assert!(ctx.eval(&src).is_ok());
}

#[test]
fn deeply_nested_arrays_do_not_exhaust_the_host_stack() {
    let mut ctx = Context::new();
    let n = 1000;
    let src = format!("{}1{}", "[".repeat(n), "]".repeat(n));
    assert!(ctx.eval(&src).is_ok());
}

#[test]
fn deeply_nested_member_chains_do_not_exhaust_the_host_stack() {
    let mut ctx = Context::new();
    let n = 1000;
    let src = format!("var a = 1; a{};", "[0]".repeat(n));
    // Indexing a number 1000 times over a non-array falls back to undefined
    // at the first step rather than throwing; the point of this test is
    // that compiling and running the chain itself does not blow the stack.
    assert!(ctx.eval(&src).is_ok());
}

#[test]
fn budget_enforcement_terminates_infinite_loop_uncatchably() {
    let mut ctx = Context::with_options(ContextOptions {
        memory_limit: None,
        time_limit: Some(Duration::from_millis(50)),
    });
    let src = "try { while(true) {} } catch (e) { 'caught'; }";
    match ctx.eval(src) {
        Err(EvalError::TimeLimit(_)) => {}
        other => panic!("expected an uncatchable time-limit error, got {:?}", other),
    }
}

#[test]
fn memory_limit_is_enforced() {
    let mut ctx = Context::with_options(ContextOptions {
        memory_limit: Some(4096),
        time_limit: None,
    });
    let src = "var a = []; while(true) { a.push({x:1,y:2,z:3}); }";
    match ctx.eval(src) {
        Err(EvalError::MemoryLimit(_)) => {}
        other => panic!("expected a memory-limit error, got {:?}", other),
    }
}

#[test]
fn type_error_is_catchable() {
    let mut ctx = Context::new();
    let src = r#"
        var caught = false;
        try { null.foo; } catch (e) { caught = (e instanceof TypeError); }
        caught;
    "#;
    assert!(boolean(&mut ctx, src));
}

#[test]
fn reference_error_on_undeclared_global_read() {
    let mut ctx = Context::new();
    match ctx.eval("thisNameWasNeverDeclared") {
        Err(EvalError::Runtime { .. }) => {}
        other => panic!("expected a runtime ReferenceError, got {:?}", other),
    }
}

#[test]
fn syntax_error_is_reported_at_compile_time() {
    let mut ctx = Context::new();
    match ctx.eval("var x = ;") {
        Err(EvalError::Syntax(_)) => {}
        other => panic!("expected a syntax error, got {:?}", other),
    }
}

#[test]
fn host_get_and_set_round_trip_primitives() {
    let mut ctx = Context::new();
    ctx.set("greeting", Value::string("hi"));
    assert_eq!(string(&mut ctx, "greeting + '!'"), "hi!");

    ctx.eval("globalCounter = 41;").unwrap();
    match ctx.get("globalCounter") {
        Value::Number(n) => assert_eq!(n, 41.0),
        other => panic!("expected number, got {:?}", other),
    }
}

#[test]
fn switch_statement_falls_through_until_break() {
    let mut ctx = Context::new();
    let src = r#"
        function classify(n) {
            var out = "";
            switch (n) {
                case 1:
                    out += "a";
                case 2:
                    out += "b";
                    break;
                case 3:
                    out += "c";
                    break;
                default:
                    out += "d";
            }
            return out;
        }
        classify(1) + "|" + classify(3) + "|" + classify(9);
    "#;
    assert_eq!(string(&mut ctx, src), "ab|c|d");
}

#[test]
fn for_of_iterates_array_values() {
    let mut ctx = Context::new();
    let src = r#"
        var total = 0;
        for (var v of [1,2,3,4]) { total += v; }
        total;
    "#;
    assert_eq!(number(&mut ctx, src), 10.0);
}

#[test]
fn break_and_continue_in_nested_loops() {
    let mut ctx = Context::new();
    let src = r#"
        var out = 0;
        for (var i = 0; i < 5; i++) {
            if (i === 2) continue;
            if (i === 4) break;
            out += i;
        }
        out;
    "#;
    assert_eq!(number(&mut ctx, src), 1.0 + 3.0);
}

#[test]
fn closures_capture_enclosing_scope() {
    let mut ctx = Context::new();
    let src = r#"
        function mk(base) {
            return function(x) { return base + x; };
        }
        var addTen = mk(10);
        addTen(5);
    "#;
    assert_eq!(number(&mut ctx, src), 15.0);
}

#[test]
fn constructors_and_prototype_methods() {
    let mut ctx = Context::new();
    let src = r#"
        function Point(x, y) { this.x = x; this.y = y; }
        Point.prototype.sum = function() { return this.x + this.y; };
        var p = new Point(2, 3);
        p.sum();
    "#;
    assert_eq!(number(&mut ctx, src), 5.0);
}

#[test]
fn typeof_and_instanceof_operators() {
    let mut ctx = Context::new();
    assert_eq!(string(&mut ctx, "typeof 1"), "number");
    assert_eq!(string(&mut ctx, "typeof 'x'"), "string");
    assert_eq!(string(&mut ctx, "typeof undefined"), "undefined");
    assert_eq!(string(&mut ctx, "typeof function(){}"), "function");
    assert!(boolean(&mut ctx, "[] instanceof Array"));
}
