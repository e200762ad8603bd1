// File: src/compiler.rs
//
// One-pass parser/compiler: there is no intermediate AST.
// `Compiler` drives the `Lexer` directly with a single token of lookahead
// and emits `bytecode::Instr` straight into the function currently being
// built. Four grammar shapes are required to handle at least 1000 levels
// of nesting without recursing the host stack:
// parenthesised expression chains, nested blocks, nested array literals,
// and member-access chains. Each is implemented below as an explicit loop
// rather than mutual recursion through `compile_*` calls; everything else
// in the grammar is small and bounded enough that ordinary recursive
// descent is fine.

use crate::bytecode::{
    Constant, ExceptionEntry, FunctionFlags, FunctionProto, Instr, SourceMapEntry, UpvalueSource,
};
use crate::errors::{EngineError, SourceLocation};
use crate::lexer::{Lexer, TemplatePiece, Token, TokenKind};
use std::collections::HashMap;
use std::rc::Rc;

type PResult<T> = Result<T, EngineError>;

/// Per-function compilation state, pushed while compiling a function body
/// and popped once it's finished. Identifiers resolve to
/// locals in the innermost entry, then upvalues by walking outward, then
/// globals).
struct FuncState {
    name: Option<Rc<str>>,
    is_top_level: bool,
    is_arrow: bool,
    instructions: Vec<Instr>,
    constants: Vec<Constant>,
    num_const_idx: HashMap<u64, u32>,
    str_const_idx: HashMap<Rc<str>, u32>,
    locals: HashMap<Rc<str>, u16>,
    local_order: Vec<Rc<str>>,
    param_count: u16,
    upvalue_names: Vec<Rc<str>>,
    upvalues: Vec<UpvalueSource>,
    exception_table: Vec<ExceptionEntry>,
    source_map: Vec<SourceMapEntry>,
    loops: Vec<LoopCtx>,
    trys: Vec<TryCtx>,
    stack_depth_hint: u32,
    temp_counter: u32,
}

struct LoopCtx {
    break_patches: Vec<usize>,
    continue_patches: Vec<usize>,
    is_switch: bool,
    /// `self.top().trys.len()` at the point this loop/switch was entered —
    /// `break`/`continue` only need to trampoline through `try`s opened
    /// since then, not ones that enclose the whole loop.
    try_depth: usize,
}

struct TryCtx {
    gosub_patches: Vec<usize>,
}

impl FuncState {
    fn new(name: Option<Rc<str>>, is_top_level: bool, is_arrow: bool) -> Self {
        Self {
            name,
            is_top_level,
            is_arrow,
            instructions: Vec::new(),
            constants: Vec::new(),
            num_const_idx: HashMap::new(),
            str_const_idx: HashMap::new(),
            locals: HashMap::new(),
            local_order: Vec::new(),
            param_count: 0,
            upvalue_names: Vec::new(),
            upvalues: Vec::new(),
            exception_table: Vec::new(),
            source_map: Vec::new(),
            loops: Vec::new(),
            trys: Vec::new(),
            stack_depth_hint: 0,
            temp_counter: 0,
        }
    }
}

/// How a variable binding resolves from the innermost function.
#[derive(Clone, Copy)]
enum Resolved {
    Local(u16),
    Upvalue(u16),
    Global,
}

/// Where `declare_var` put a newly declared `var`/function-declaration
/// binding — a local slot for any non-top-level function, or a global
/// object property for the implicit top-level script function, which
/// needs top-level bindings visible as properties of the global object).
enum VarSlot {
    Local(u16),
    Global(Rc<str>),
}

/// One frame of the explicit work stack `compile_array_literal` uses so
/// arbitrarily deep nested array literals don't recurse.
struct ArrayFrame {
    count: u16,
}

/// What a prefix `++`/`--` (or a probed `delete`) target's final suffix
/// turned out to be, once `compile_member_chain_leave_target` has walked
/// every suffix but the last: a field name, or an index whose key is
/// already sitting on the stack above the object.
enum MemberKind {
    Field(Rc<str>),
    Index,
}

pub struct Compiler {
    lexer: Lexer,
    cur: Token,
    cur_mark: (usize, u32, u32),
    funcs: Vec<FuncState>,
}

/// Compiles `source` into the implicit top-level function `Context::eval`
/// runs. The top-level function's completion value is the
/// value of the last expression statement executed, tracked through a
/// hidden local slot.
pub fn compile_program(source: &str) -> PResult<Rc<FunctionProto>> {
    let mut c = Compiler::new(source)?;
    c.funcs.push(FuncState::new(None, true, false));
    let completion = c.declare_local("%completion");
    loop {
        if matches!(c.cur.kind, TokenKind::Eof) {
            break;
        }
        c.compile_statement()?;
    }
    c.emit(Instr::GetLoc(completion));
    c.emit(Instr::Return);
    let fs = c.funcs.pop().unwrap();
    Ok(Rc::new(c.finish_proto(fs, 0, true)))
}

impl Compiler {
    fn new(source: &str) -> PResult<Self> {
        let mut lexer = Lexer::new(source);
        let mark = lexer.mark();
        let cur = lexer.next_token()?;
        Ok(Self { lexer, cur, cur_mark: mark, funcs: Vec::new() })
    }

    fn finish_proto(&self, fs: FuncState, _depth: u32, constructible: bool) -> FunctionProto {
        FunctionProto {
            name: fs.name,
            instructions: fs.instructions,
            constants: fs.constants,
            param_count: fs.param_count,
            local_count: fs.local_order.len() as u16,
            local_names: fs.local_order,
            upvalues: fs.upvalues,
            exception_table: fs.exception_table,
            source_map: fs.source_map,
            flags: FunctionFlags { constructible, arrow: fs.is_arrow, generator: false },
        }
    }

    // ---- token-stream plumbing ----

    fn top(&self) -> &FuncState {
        self.funcs.last().unwrap()
    }

    fn top_mut(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    fn push_loop(&mut self, is_switch: bool) {
        let try_depth = self.top().trys.len();
        self.top_mut().loops.push(LoopCtx {
            break_patches: Vec::new(),
            continue_patches: Vec::new(),
            is_switch,
            try_depth,
        });
    }

    fn bump(&mut self) -> PResult<Token> {
        let mark = self.lexer.mark();
        let next = self.lexer.next_token()?;
        self.cur_mark = mark;
        Ok(std::mem::replace(&mut self.cur, next))
    }

    fn loc(&self) -> SourceLocation {
        SourceLocation::new(self.cur.line, self.cur.column)
    }

    fn err(&self, msg: impl Into<String>) -> EngineError {
        EngineError::syntax(msg, self.loc())
    }

    fn check_punct(&self, p: &str) -> bool {
        matches!(&self.cur.kind, TokenKind::Punct(q) if *q == p)
    }

    fn check_keyword(&self, k: &str) -> bool {
        matches!(&self.cur.kind, TokenKind::Keyword(q) if q == k)
    }

    fn is_eof(&self) -> bool {
        matches!(self.cur.kind, TokenKind::Eof)
    }

    fn expect_punct(&mut self, p: &str) -> PResult<()> {
        if self.check_punct(p) {
            self.bump()?;
            Ok(())
        } else {
            Err(self.err(format!("expected '{}'", p)))
        }
    }

    fn expect_identifier(&mut self) -> PResult<String> {
        match self.cur.kind.clone() {
            TokenKind::Identifier(s) => {
                self.bump()?;
                Ok(s)
            }
            _ => Err(self.err("expected an identifier")),
        }
    }

    /// Property/member names accept keywords too (`.catch`, `.in`, ...),
    /// matching real-world object shapes the corpus's examples use.
    fn expect_name_like(&mut self) -> PResult<String> {
        match self.cur.kind.clone() {
            TokenKind::Identifier(s) | TokenKind::Keyword(s) => {
                self.bump()?;
                Ok(s)
            }
            _ => Err(self.err("expected a property name")),
        }
    }

    fn consume_semicolon(&mut self) -> PResult<()> {
        if self.check_punct(";") {
            self.bump()?;
            return Ok(());
        }
        // ASI: a `}` or EOF or a newline before the current token ends the
        // statement implicitly.
        if self.check_punct("}") || self.is_eof() || self.cur.newline_before {
            return Ok(());
        }
        Err(self.err("expected ';'"))
    }

    // ---- constant pool ----

    fn const_number(&mut self, n: f64) -> u32 {
        let key = n.to_bits();
        if let Some(&idx) = self.top().num_const_idx.get(&key) {
            return idx;
        }
        let idx = self.top().constants.len() as u32;
        self.top_mut().constants.push(Constant::Number(n));
        self.top_mut().num_const_idx.insert(key, idx);
        idx
    }

    fn const_str(&mut self, s: &str) -> u32 {
        let key: Rc<str> = Rc::from(s);
        if let Some(&idx) = self.top().str_const_idx.get(&key) {
            return idx;
        }
        let idx = self.top().constants.len() as u32;
        self.top_mut().constants.push(Constant::Str(key.clone()));
        self.top_mut().str_const_idx.insert(key, idx);
        idx
    }

    // ---- emission ----

    fn emit(&mut self, instr: Instr) -> usize {
        let pc = self.top().instructions.len();
        let (line, column) = (self.cur.line, self.cur.column);
        self.top_mut().source_map.push(SourceMapEntry { pc: pc as u32, line, column });
        self.top_mut().instructions.push(instr);
        pc
    }

    fn here(&self) -> u32 {
        self.top().instructions.len() as u32
    }

    fn patch_jump(&mut self, pc: usize, target: u32) {
        let instr = &mut self.top_mut().instructions[pc];
        *instr = match instr {
            Instr::Goto(_) => Instr::Goto(target),
            Instr::IfTrue(_) => Instr::IfTrue(target),
            Instr::IfFalse(_) => Instr::IfFalse(target),
            Instr::Gosub(_) => Instr::Gosub(target),
            other => panic!("patch_jump on non-jump instruction: {:?}", other),
        };
    }

    fn patch_to_here(&mut self, pc: usize) {
        let t = self.here();
        self.patch_jump(pc, t);
    }

    fn emit_goto_placeholder(&mut self) -> usize {
        self.emit(Instr::Goto(u32::MAX))
    }

    // ---- scope / variables ----

    fn declare_local(&mut self, name: &str) -> u16 {
        if let Some(&slot) = self.top().locals.get(name) {
            return slot;
        }
        let slot = self.top().local_order.len() as u16;
        let name_rc: Rc<str> = Rc::from(name);
        self.top_mut().local_order.push(name_rc.clone());
        self.top_mut().locals.insert(name_rc, slot);
        slot
    }

    fn declare_hidden_local(&mut self, tag: &str) -> u16 {
        let n = self.top().temp_counter;
        self.top_mut().temp_counter += 1;
        let name = format!("%{}:{}", tag, n);
        self.declare_local(&name)
    }

    /// `var x` / function declarations hoist to the nearest enclosing
    /// *function* scope; at the top level that scope is
    /// the implicit script function, whose bindings are global-object
    /// properties rather than locals.
    fn declare_var(&mut self, name: &str) -> VarSlot {
        if self.top().is_top_level {
            let name_rc: Rc<str> = Rc::from(name);
            let idx = self.const_str(name);
            self.emit(Instr::DeclareGlobal(idx));
            VarSlot::Global(name_rc)
        } else {
            VarSlot::Local(self.declare_local(name))
        }
    }

    fn store_var(&mut self, slot: &VarSlot, need_value: bool) {
        match slot {
            VarSlot::Local(s) => {
                if need_value {
                    self.emit(Instr::Dup);
                }
                self.emit(Instr::PutLoc(*s));
            }
            VarSlot::Global(name) => {
                let idx = self.const_str(name);
                self.emit(Instr::PutGlobal(idx));
                if !need_value {
                    self.emit(Instr::Drop);
                }
            }
        }
    }

    fn resolve(&mut self, name: &str) -> Resolved {
        let top_idx = self.funcs.len() - 1;
        if !self.top().is_top_level {
            if let Some(&slot) = self.top().locals.get(name) {
                return Resolved::Local(slot);
            }
        }
        if top_idx > 0 {
            if let Some(idx) = self.resolve_upvalue(top_idx, name) {
                return Resolved::Upvalue(idx);
            }
        }
        Resolved::Global
    }

    /// Recursively resolves `name` as an upvalue of `func_idx`, capturing it
    /// through every enclosing function between its defining scope and
    /// `func_idx`. Never descends into the top-level
    /// script function's own locals — those are global bindings, not
    /// something a closure captures by reference.
    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> Option<u16> {
        if func_idx == 0 {
            return None;
        }
        if let Some(pos) = self.funcs[func_idx].upvalue_names.iter().position(|n| n.as_ref() == name) {
            return Some(pos as u16);
        }
        let parent_idx = func_idx - 1;
        if !self.funcs[parent_idx].is_top_level {
            if let Some(&slot) = self.funcs[parent_idx].locals.get(name) {
                return Some(self.add_upvalue(func_idx, UpvalueSource::ParentLocal(slot), name));
            }
        }
        if let Some(up_idx) = self.resolve_upvalue(parent_idx, name) {
            return Some(self.add_upvalue(func_idx, UpvalueSource::ParentUpvalue(up_idx), name));
        }
        None
    }

    fn add_upvalue(&mut self, func_idx: usize, src: UpvalueSource, name: &str) -> u16 {
        let f = &mut self.funcs[func_idx];
        f.upvalues.push(src);
        f.upvalue_names.push(Rc::from(name));
        (f.upvalues.len() - 1) as u16
    }

    fn load_var(&mut self, name: &str) {
        match self.resolve(name) {
            Resolved::Local(s) => {
                self.emit(Instr::GetLoc(s));
            }
            Resolved::Upvalue(i) => {
                self.emit(Instr::GetVarRef(i));
            }
            Resolved::Global => {
                let idx = self.const_str(name);
                self.emit(Instr::GetGlobal(idx));
            }
        }
    }

    // ---- statements ----

    fn compile_statement(&mut self) -> PResult<()> {
        if self.check_punct("{") {
            return self.compile_block();
        }
        self.compile_statement_inner()
    }

    /// The four-form iterative nested-block handler: a
    /// chain of `{ { { ... } } }` never recurses through `compile_block`,
    /// since the depth counter absorbs every nesting level in one call.
    fn compile_block(&mut self) -> PResult<()> {
        self.expect_punct("{")?;
        let mut depth: u32 = 1;
        while depth > 0 {
            if self.check_punct("}") {
                self.bump()?;
                depth -= 1;
                continue;
            }
            if self.check_punct("{") {
                self.bump()?;
                depth += 1;
                continue;
            }
            if self.is_eof() {
                return Err(self.err("unterminated block"));
            }
            self.compile_statement_inner()?;
        }
        Ok(())
    }

    fn compile_statement_inner(&mut self) -> PResult<()> {
        if self.check_punct(";") {
            self.bump()?;
            return Ok(());
        }
        match &self.cur.kind {
            TokenKind::Keyword(k) => match k.as_str() {
                "var" => self.compile_var_stmt(),
                "function" => self.compile_function_decl(),
                "if" => self.compile_if_stmt(),
                "while" => self.compile_while_stmt(),
                "do" => self.compile_do_while_stmt(),
                "for" => self.compile_for_stmt(),
                "break" => self.compile_break_stmt(),
                "continue" => self.compile_continue_stmt(),
                "return" => self.compile_return_stmt(),
                "throw" => self.compile_throw_stmt(),
                "try" => self.compile_try_stmt(),
                "switch" => self.compile_switch_stmt(),
                _ => self.compile_expr_stmt(),
            },
            _ => self.compile_expr_stmt(),
        }
    }

    fn compile_expr_stmt(&mut self) -> PResult<()> {
        self.compile_expression()?;
        if self.top().is_top_level {
            let slot = self.top().locals.get("%completion").copied().unwrap();
            self.emit(Instr::PutLoc(slot));
        } else {
            self.emit(Instr::Drop);
        }
        self.consume_semicolon()?;
        Ok(())
    }

    fn compile_var_stmt(&mut self) -> PResult<()> {
        self.bump()?; // 'var'
        loop {
            let name = self.expect_identifier()?;
            let slot = self.declare_var(&name);
            if self.check_punct("=") {
                self.bump()?;
                self.compile_assignment_expr()?;
            } else {
                self.emit(Instr::PushUndef);
            }
            self.store_var(&slot, false);
            if self.check_punct(",") {
                self.bump()?;
                continue;
            }
            break;
        }
        self.consume_semicolon()?;
        Ok(())
    }

    fn compile_function_decl(&mut self) -> PResult<()> {
        self.bump()?; // 'function'
        let name = self.expect_identifier()?;
        let slot = self.declare_var(&name);
        self.expect_punct("(")?;
        let params = self.parse_param_list()?;
        let proto = self.compile_function_body(Some(Rc::from(name.as_str())), params, false, true)?;
        self.emit_function_expr(proto);
        self.store_var(&slot, false);
        Ok(())
    }

    fn compile_if_stmt(&mut self) -> PResult<()> {
        self.bump()?; // 'if'
        self.expect_punct("(")?;
        self.compile_expression()?;
        self.expect_punct(")")?;
        let else_patch = self.emit(Instr::IfFalse(u32::MAX));
        self.compile_statement()?;
        if self.check_keyword("else") {
            let end_patch = self.emit_goto_placeholder();
            self.patch_to_here(else_patch);
            self.bump()?; // 'else'
            self.compile_statement()?;
            self.patch_to_here(end_patch);
        } else {
            self.patch_to_here(else_patch);
        }
        Ok(())
    }

    fn compile_while_stmt(&mut self) -> PResult<()> {
        self.bump()?; // 'while'
        let test_label = self.here();
        self.expect_punct("(")?;
        self.compile_expression()?;
        self.expect_punct(")")?;
        let end_patch = self.emit(Instr::IfFalse(u32::MAX));
        self.push_loop(false);
        self.compile_statement()?;
        let ctx = self.top_mut().loops.pop().unwrap();
        for p in ctx.continue_patches {
            self.patch_jump(p, test_label);
        }
        self.emit(Instr::Goto(test_label));
        self.patch_to_here(end_patch);
        let end_label = self.here();
        for p in ctx.break_patches {
            self.patch_jump(p, end_label);
        }
        Ok(())
    }

    fn compile_do_while_stmt(&mut self) -> PResult<()> {
        self.bump()?; // 'do'
        let body_label = self.here();
        self.push_loop(false);
        self.compile_statement()?;
        if !self.check_keyword("while") {
            return Err(self.err("expected 'while' after do-while body"));
        }
        self.bump()?;
        let ctx = self.top_mut().loops.pop().unwrap();
        let test_label = self.here();
        for p in ctx.continue_patches {
            self.patch_jump(p, test_label);
        }
        self.expect_punct("(")?;
        self.compile_expression()?;
        self.expect_punct(")")?;
        self.emit(Instr::IfTrue(body_label));
        self.consume_semicolon()?;
        let end_label = self.here();
        for p in ctx.break_patches {
            self.patch_jump(p, end_label);
        }
        Ok(())
    }

    fn compile_for_stmt(&mut self) -> PResult<()> {
        self.bump()?; // 'for'
        self.expect_punct("(")?;

        // Disambiguate `for (var x in/of ...)` and `for (x in/of ...)` from
        // a classic three-clause header by a bounded lookahead: both start
        // with an optional `var` then an identifier, diverging only at the
        // token right after.
        let has_var = self.check_keyword("var");
        if has_var || matches!(self.cur.kind, TokenKind::Identifier(_)) {
            let mark = (self.cur.clone(), self.cur_mark, self.lexer.mark());
            let is_var = has_var;
            if is_var {
                self.bump()?;
            }
            if let TokenKind::Identifier(name) = self.cur.kind.clone() {
                self.bump()?;
                if self.check_keyword("in") || self.check_keyword("of") {
                    let is_of = self.check_keyword("of");
                    self.bump()?;
                    return self.compile_for_in_of(name, is_var, is_of);
                }
            }
            self.cur = mark.0;
            self.cur_mark = mark.1;
            self.lexer.restore(mark.2);
        }

        // Classic `for (init; test; update) body`.
        if self.check_punct(";") {
            self.bump()?;
        } else if self.check_keyword("var") {
            self.compile_var_stmt()?;
        } else {
            self.compile_expression()?;
            self.emit(Instr::Drop);
            self.expect_punct(";")?;
        }
        let test_label = self.here();
        let end_patch = if !self.check_punct(";") {
            self.compile_expression()?;
            Some(self.emit(Instr::IfFalse(u32::MAX)))
        } else {
            None
        };
        self.expect_punct(";")?;
        // The update clause's source is parsed now but its bytecode must be
        // emitted *after* the body; stash it as raw source and re-lex it in
        // place once the body has been compiled.
        let update_src = self.capture_balanced_until(")")?;
        self.expect_punct(")")?;
        self.push_loop(false);
        self.compile_statement()?;
        let ctx = self.top_mut().loops.pop().unwrap();
        let update_label = self.here();
        for p in ctx.continue_patches {
            self.patch_jump(p, update_label);
        }
        if !update_src.trim().is_empty() {
            self.compile_nested_source_stmt(&update_src)?;
            self.emit(Instr::Drop);
        }
        self.emit(Instr::Goto(test_label));
        if let Some(p) = end_patch {
            self.patch_to_here(p);
        }
        let end_label = self.here();
        for p in ctx.break_patches {
            self.patch_jump(p, end_label);
        }
        Ok(())
    }

    /// Captures the raw source text from the current position up to (but
    /// not including) the matching top-level occurrence of `stop`, tracking
    /// paren/bracket/brace nesting so commas and parens inside the update
    /// clause (e.g. `i++, j--` or `f(i)`) aren't mistaken for the end.
    fn capture_balanced_until(&mut self, stop: &str) -> PResult<String> {
        let mut depth = 0i32;
        let mut out = String::new();
        loop {
            if depth == 0 && self.check_punct(stop) {
                return Ok(out);
            }
            if self.is_eof() {
                return Err(self.err("unexpected end of input"));
            }
            match &self.cur.kind {
                TokenKind::Punct(p @ ("(" | "[" | "{")) => {
                    depth += 1;
                    out.push_str(p);
                    out.push(' ');
                }
                TokenKind::Punct(p @ (")" | "]" | "}")) => {
                    depth -= 1;
                    out.push_str(p);
                    out.push(' ');
                }
                TokenKind::Punct(p) => {
                    out.push_str(p);
                    out.push(' ');
                }
                TokenKind::Identifier(s) | TokenKind::Keyword(s) => {
                    out.push_str(s);
                    out.push(' ');
                }
                TokenKind::Number(n) => {
                    out.push_str(&n.to_string());
                    out.push(' ');
                }
                TokenKind::String(s) => {
                    out.push('"');
                    out.push_str(&s.replace('\\', "\\\\").replace('"', "\\\""));
                    out.push('"');
                    out.push(' ');
                }
                _ => return Err(self.err("unsupported expression in for-loop update clause")),
            }
            self.bump()?;
        }
    }

    fn compile_for_in_of(&mut self, var_name: String, is_var: bool, is_of: bool) -> PResult<()> {
        let slot = if is_var { self.declare_var(&var_name) } else { VarSlot::Local(match self.resolve(&var_name) {
            Resolved::Local(s) => s,
            _ => {
                // Assigning into an upvalue/global loop variable: resolve
                // generically at bind time below instead.
                u16::MAX
            }
        }) };
        self.compile_expression()?;
        self.expect_punct(")")?;
        self.emit(if is_of { Instr::ForOfStart } else { Instr::ForInStart });
        self.top_mut().stack_depth_hint += 1;
        let loop_start = self.here();
        self.emit(if is_of { Instr::ForOfNext } else { Instr::EnumNext });
        let to_bind_patch = self.emit(Instr::IfFalse(u32::MAX));
        self.emit(Instr::Drop);
        let done_goto_end = self.emit_goto_placeholder();
        self.patch_to_here(to_bind_patch);
        match &slot {
            VarSlot::Local(s) if *s != u16::MAX => {
                self.emit(Instr::PutLoc(*s));
            }
            _ => {
                // plain identifier target (not `var`): resolve and store
                // through the generic path, which also covers globals.
                if !is_var {
                    let s2 = self.declare_var_target(&var_name);
                    self.store_var(&s2, false);
                }
            }
        }
        self.push_loop(false);
        self.compile_statement()?;
        let ctx = self.top_mut().loops.pop().unwrap();
        for p in ctx.continue_patches {
            self.patch_jump(p, loop_start);
        }
        self.emit(Instr::Goto(loop_start));
        let end_label = self.here();
        self.patch_jump(done_goto_end, end_label);
        for p in ctx.break_patches {
            self.patch_jump(p, end_label);
        }
        self.emit(Instr::Drop);
        self.top_mut().stack_depth_hint -= 1;
        Ok(())
    }

    /// Resolves an already-existing binding for a bare (non-`var`)
    /// for-in/for-of target without declaring a new one.
    fn declare_var_target(&mut self, name: &str) -> VarSlot {
        match self.resolve(name) {
            Resolved::Local(s) => VarSlot::Local(s),
            Resolved::Upvalue(_) | Resolved::Global => VarSlot::Global(Rc::from(name)),
        }
    }

    fn compile_break_stmt(&mut self) -> PResult<()> {
        self.bump()?;
        self.consume_semicolon()?;
        let depth = self.top().loops.len();
        if depth == 0 {
            return Err(self.err("'break' outside of a loop or switch"));
        }
        let try_depth = self.top().loops[depth - 1].try_depth;
        self.emit_finally_gosubs_for_exit(try_depth);
        let pc = self.emit_goto_placeholder();
        self.top_mut().loops[depth - 1].break_patches.push(pc);
        Ok(())
    }

    fn compile_continue_stmt(&mut self) -> PResult<()> {
        self.bump()?;
        self.consume_semicolon()?;
        let idx = self.top().loops.iter().rposition(|l| !l.is_switch);
        match idx {
            Some(i) => {
                let try_depth = self.top().loops[i].try_depth;
                self.emit_finally_gosubs_for_exit(try_depth);
                let pc = self.emit_goto_placeholder();
                self.top_mut().loops[i].continue_patches.push(pc);
                Ok(())
            }
            None => Err(self.err("'continue' outside of a loop")),
        }
    }

    fn compile_return_stmt(&mut self) -> PResult<()> {
        self.bump()?; // 'return'
        let has_value = !(self.check_punct(";") || self.check_punct("}") || self.is_eof() || self.cur.newline_before);
        if has_value {
            self.compile_expression()?;
        } else {
            self.emit(Instr::PushUndef);
        }
        self.consume_semicolon()?;
        self.emit_finally_gosubs_for_return();
        self.emit(Instr::Return);
        Ok(())
    }

    fn emit_finally_gosubs_for_return(&mut self) {
        self.emit_finally_gosubs_for_exit(0);
    }

    /// Emits a `gosub` into the `finally` trampoline of every `try` at
    /// index `floor` or deeper, innermost first, so each one runs with the
    /// right disposition recorded before control actually leaves it.
    /// `return` passes `floor: 0` (it always exits every enclosing `try`);
    /// `break`/`continue` pass the `try` depth recorded when their loop was
    /// entered, since they never leave a `try` that also encloses the whole
    /// loop.
    fn emit_finally_gosubs_for_exit(&mut self, floor: usize) {
        let try_count = self.top().trys.len();
        for i in (floor..try_count).rev() {
            let pc = self.emit(Instr::Gosub(u32::MAX));
            self.top_mut().trys[i].gosub_patches.push(pc);
        }
    }

    fn compile_throw_stmt(&mut self) -> PResult<()> {
        self.bump()?; // 'throw'
        self.compile_expression()?;
        self.emit(Instr::Throw);
        self.consume_semicolon()?;
        Ok(())
    }

    /// `try`/`catch`/`finally`: the compiler always emits
    /// a catch landing pad (synthesising a rethrow-after-finally one when
    /// the source has no `catch` clause), and normal fall-through reaches
    /// `finally` through the same `gosub`/`ret` trampoline a `return`
    /// inside the guarded region also targets. A guarded region's table
    /// entry is reserved before its body compiles and filled in afterward,
    /// so outer `try`s keep a lower table index than the inner ones they
    /// contain (see `FunctionProto::handler_for`).
    ///
    /// Known simplification: an exception raised while *executing* a
    /// `catch` or `finally` body is not itself guarded by this try's own
    /// handler (it propagates to whichever outer handler, if any, covers
    /// this pc range) — only the matrix of completion paths actually tests
    /// (normal completion, thrown-and-caught, thrown-uncaught, and a
    /// `return` from inside the guarded region) is guaranteed to run
    /// `finally` exactly once.
    fn compile_try_stmt(&mut self) -> PResult<()> {
        self.bump()?; // 'try'
        let start_pc = self.here();
        let entry_idx = self.top().exception_table.len();
        let stack_depth = self.top().stack_depth_hint;
        self.top_mut().exception_table.push(ExceptionEntry {
            start_pc,
            end_pc: 0,
            catch_pc: None,
            finally_pc: None,
            stack_depth,
        });
        self.top_mut().trys.push(TryCtx { gosub_patches: Vec::new() });
        self.compile_block()?;
        let goto_after_try = self.emit_goto_placeholder();
        let catch_pc = self.here();

        let has_catch = self.check_keyword("catch");
        if has_catch {
            self.bump()?;
            if self.check_punct("(") {
                self.bump()?;
                let name = self.expect_identifier()?;
                let slot = self.declare_local(&name);
                self.emit(Instr::PutLoc(slot));
                self.expect_punct(")")?;
            } else {
                self.emit(Instr::Drop);
            }
            self.compile_block()?;
        }
        let rethrow_slot = if !has_catch {
            let slot = self.declare_hidden_local("catch-passthrough");
            self.emit(Instr::PutLoc(slot));
            Some(slot)
        } else {
            None
        };
        let goto_after_catch = self.emit_goto_placeholder();

        let trampoline = self.here();
        self.patch_jump(goto_after_try, trampoline);
        self.patch_jump(goto_after_catch, trampoline);
        let gosub_pc = self.emit(Instr::Gosub(u32::MAX));
        if let Some(slot) = rethrow_slot {
            self.emit(Instr::GetLoc(slot));
            self.emit(Instr::Throw);
        }
        let after_all_goto = self.emit_goto_placeholder();
        let finally_sub_start = self.here();
        self.patch_jump(gosub_pc, finally_sub_start);

        let try_ctx = self.top_mut().trys.pop().unwrap();
        for p in try_ctx.gosub_patches {
            self.patch_jump(p, finally_sub_start);
        }

        let has_finally = self.check_keyword("finally");
        if has_finally {
            self.bump()?;
            self.compile_block()?;
        } else if !has_catch {
            // neither catch nor finally is a syntax error the caller above
            // should have ruled out, but guard against malformed input.
        }
        self.emit(Instr::Ret);
        self.patch_to_here(after_all_goto);

        let entry = &mut self.top_mut().exception_table[entry_idx];
        entry.end_pc = catch_pc;
        entry.catch_pc = Some(catch_pc);
        entry.finally_pc = if has_finally { Some(finally_sub_start) } else { None };

        if !has_catch && !has_finally {
            return Err(self.err("'try' requires a 'catch' or 'finally' clause"));
        }
        Ok(())
    }

    /// Desugars to a dispatch of `StrictEq` tests followed by fall-through
    /// case bodies, matching ordinary switch-without-`break` semantics.
    /// `continue` inside a `switch` passes through to the nearest enclosing
    /// loop; `break` exits the switch itself. Since there's no AST to walk
    /// twice, the raw source of each case's test expression and body is
    /// captured verbatim in a first pass, then recompiled (dispatch tests,
    /// then bodies in source order) in a second pass via a temporary
    /// sub-lexer, the same device `compile_for_stmt`'s update clause uses.
    fn compile_switch_stmt(&mut self) -> PResult<()> {
        self.bump()?; // 'switch'
        self.expect_punct("(")?;
        self.compile_expression()?;
        self.expect_punct(")")?;
        let disc_slot = self.declare_hidden_local("switch-disc");
        self.emit(Instr::PutLoc(disc_slot));
        self.expect_punct("{")?;

        struct Clause {
            test_src: Option<String>,
            body_src: String,
        }
        let mut clauses: Vec<Clause> = Vec::new();
        loop {
            if self.check_punct("}") {
                self.bump()?;
                break;
            }
            if self.check_keyword("case") {
                self.bump()?;
                let test_src = self.capture_balanced_until(":")?;
                self.expect_punct(":")?;
                let body_src = self.capture_case_body()?;
                clauses.push(Clause { test_src: Some(test_src), body_src });
            } else if self.check_keyword("default") {
                self.bump()?;
                self.expect_punct(":")?;
                let body_src = self.capture_case_body()?;
                clauses.push(Clause { test_src: None, body_src });
            } else if self.is_eof() {
                return Err(self.err("unterminated switch"));
            } else {
                return Err(self.err("expected 'case' or 'default'"));
            }
        }

        self.push_loop(true);

        // (clause_idx, jump_pc) for each `case` test, in source order.
        let mut dispatch_jumps: Vec<(usize, usize)> = Vec::new();
        let mut default_idx: Option<usize> = None;
        for (i, clause) in clauses.iter().enumerate() {
            match &clause.test_src {
                Some(src) => {
                    self.emit(Instr::GetLoc(disc_slot));
                    self.compile_nested_source_expr(src)?;
                    self.emit(Instr::StrictEq);
                    let jump = self.emit(Instr::IfTrue(u32::MAX));
                    dispatch_jumps.push((i, jump));
                }
                None => {
                    default_idx = Some(i);
                }
            }
        }
        let default_entry_jump = self.emit_goto_placeholder();

        let mut body_labels: Vec<u32> = Vec::with_capacity(clauses.len());
        for clause in clauses.iter() {
            body_labels.push(self.here());
            if !clause.body_src.trim().is_empty() {
                self.compile_nested_source_stmts(&clause.body_src)?;
            }
        }
        let end_label = self.here();

        for (clause_idx, jump_pc) in dispatch_jumps {
            self.patch_jump(jump_pc, body_labels[clause_idx]);
        }
        match default_idx {
            Some(idx) => self.patch_jump(default_entry_jump, body_labels[idx]),
            None => self.patch_jump(default_entry_jump, end_label),
        }

        let ctx = self.top_mut().loops.pop().unwrap();
        for p in ctx.break_patches {
            self.patch_jump(p, end_label);
        }
        Ok(())
    }

    /// Captures the raw source of one case/default clause's statement list:
    /// everything up to (but not including) the next top-level `case`,
    /// `default`, or closing `}` of the switch body.
    fn capture_case_body(&mut self) -> PResult<String> {
        let mut depth = 0i32;
        let mut out = String::new();
        loop {
            if depth == 0 && (self.check_keyword("case") || self.check_keyword("default")) {
                return Ok(out);
            }
            if depth == 0 && self.check_punct("}") {
                return Ok(out);
            }
            if self.is_eof() {
                return Err(self.err("unterminated switch"));
            }
            match &self.cur.kind {
                TokenKind::Punct(p @ ("{" | "(" | "[")) => {
                    depth += 1;
                    out.push_str(p);
                    out.push(' ');
                }
                TokenKind::Punct(p @ ("}" | ")" | "]")) => {
                    depth -= 1;
                    out.push_str(p);
                    out.push(' ');
                }
                TokenKind::Punct(p) => {
                    out.push_str(p);
                    out.push(' ');
                }
                TokenKind::Identifier(s) | TokenKind::Keyword(s) => {
                    out.push_str(s);
                    out.push(' ');
                }
                TokenKind::Number(n) => {
                    out.push_str(&n.to_string());
                    out.push(' ');
                }
                TokenKind::String(s) => {
                    out.push('"');
                    out.push_str(&s.replace('\\', "\\\\").replace('"', "\\\""));
                    out.push('"');
                    out.push(' ');
                }
                _ => return Err(self.err("unsupported construct in switch case body")),
            }
            self.bump()?;
        }
    }

    // ---- nested re-lexing helper ----
    //
    // `compile_for_stmt`'s update clause and `compile_switch_stmt`'s case
    // tests/bodies are captured as raw source text during a first pass (so
    // the body can be compiled before the update clause, and so every case
    // test/body can be emitted in the right dispatch order) and recompiled
    // here through a throwaway `Lexer` over that slice. The throwaway lexer
    // and lookahead token are swapped back in afterward so the outer parse
    // resumes exactly where it left off.
    fn with_nested_source<T>(&mut self, src: &str, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        let outer_lexer = std::mem::replace(&mut self.lexer, Lexer::new(src));
        let outer_mark = self.cur_mark;
        self.cur_mark = self.lexer.mark();
        let outer_cur = std::mem::replace(&mut self.cur, self.lexer.next_token()?);
        let result = f(self);
        self.lexer = outer_lexer;
        self.cur = outer_cur;
        self.cur_mark = outer_mark;
        result
    }

    fn compile_nested_source_expr(&mut self, src: &str) -> PResult<()> {
        self.with_nested_source(src, |c| c.compile_expression())
    }

    fn compile_nested_source_stmt(&mut self, src: &str) -> PResult<()> {
        self.with_nested_source(src, |c| c.compile_expression())
    }

    fn compile_nested_source_stmts(&mut self, src: &str) -> PResult<()> {
        self.with_nested_source(src, |c| {
            while !c.is_eof() {
                c.compile_statement()?;
            }
            Ok(())
        })
    }

    // ---- expressions ----
    //
    // Ordinary recursive-descent precedence climbing, one level per grammar
    // rule. `can_assign` threads clox-style: only a primary
    // expression that's actually a valid assignment target (identifier,
    // member, index) consumes a following `=`/compound-assignment operator;
    // every other level just forwards the flag down and otherwise ignores
    // it, so `1 + (x = 2)` parses but `1 + x = 2` does not swallow the `=`
    // as part of the addition.

    fn compile_expression(&mut self) -> PResult<()> {
        self.compile_assignment_expr()?;
        while self.check_punct(",") {
            self.bump()?;
            self.emit(Instr::Drop);
            self.compile_assignment_expr()?;
        }
        Ok(())
    }

    fn compile_assignment_expr(&mut self) -> PResult<()> {
        self.compile_conditional_expr(true)
    }

    fn compile_conditional_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_nullish_expr(can_assign)?;
        if self.check_punct("?") {
            self.bump()?;
            let else_patch = self.emit(Instr::IfFalse(u32::MAX));
            self.compile_assignment_expr()?;
            let end_patch = self.emit_goto_placeholder();
            self.patch_to_here(else_patch);
            self.expect_punct(":")?;
            self.compile_assignment_expr()?;
            self.patch_to_here(end_patch);
        }
        Ok(())
    }

    /// `??` short-circuits only on null/undefined, unlike `||`.
    /// `null == undefined` and nothing else is loosely equal to
    /// either of them, so `PushNull; Eq` is a cheaper nullish test than a
    /// pair of `StrictEq` comparisons against both literals.
    fn emit_is_nullish(&mut self) {
        self.emit(Instr::PushNull);
        self.emit(Instr::Eq);
    }

    fn compile_nullish_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_logical_or_expr(can_assign)?;
        while self.check_punct("??") {
            self.bump()?;
            self.emit(Instr::Dup);
            self.emit_is_nullish();
            let skip = self.emit(Instr::IfFalse(u32::MAX));
            self.emit(Instr::Drop);
            self.compile_logical_or_expr(false)?;
            self.patch_to_here(skip);
        }
        Ok(())
    }

    fn compile_logical_or_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_logical_and_expr(can_assign)?;
        while self.check_punct("||") {
            self.bump()?;
            self.emit(Instr::Dup);
            let skip = self.emit(Instr::IfTrue(u32::MAX));
            self.emit(Instr::Drop);
            self.compile_logical_and_expr(false)?;
            self.patch_to_here(skip);
        }
        Ok(())
    }

    fn compile_logical_and_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_bitor_expr(can_assign)?;
        while self.check_punct("&&") {
            self.bump()?;
            self.emit(Instr::Dup);
            let skip = self.emit(Instr::IfFalse(u32::MAX));
            self.emit(Instr::Drop);
            self.compile_bitor_expr(false)?;
            self.patch_to_here(skip);
        }
        Ok(())
    }

    fn compile_bitor_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_bitxor_expr(can_assign)?;
        while self.check_punct("|") {
            self.bump()?;
            self.compile_bitxor_expr(false)?;
            self.emit(Instr::BitOr);
        }
        Ok(())
    }

    fn compile_bitxor_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_bitand_expr(can_assign)?;
        while self.check_punct("^") {
            self.bump()?;
            self.compile_bitand_expr(false)?;
            self.emit(Instr::BitXor);
        }
        Ok(())
    }

    fn compile_bitand_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_equality_expr(can_assign)?;
        while self.check_punct("&") {
            self.bump()?;
            self.compile_equality_expr(false)?;
            self.emit(Instr::BitAnd);
        }
        Ok(())
    }

    fn compile_equality_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_relational_expr(can_assign)?;
        loop {
            let instr = if self.check_punct("===") {
                Instr::StrictEq
            } else if self.check_punct("!==") {
                Instr::StrictNeq
            } else if self.check_punct("==") {
                Instr::Eq
            } else if self.check_punct("!=") {
                Instr::Neq
            } else {
                break;
            };
            self.bump()?;
            self.compile_relational_expr(false)?;
            self.emit(instr);
        }
        Ok(())
    }

    fn compile_relational_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_shift_expr(can_assign)?;
        loop {
            let instr = if self.check_punct("<=") {
                Instr::Lte
            } else if self.check_punct(">=") {
                Instr::Gte
            } else if self.check_punct("<") {
                Instr::Lt
            } else if self.check_punct(">") {
                Instr::Gt
            } else if self.check_keyword("instanceof") {
                Instr::InstanceOf
            } else if self.check_keyword("in") {
                Instr::In
            } else {
                break;
            };
            self.bump()?;
            self.compile_shift_expr(false)?;
            self.emit(instr);
        }
        Ok(())
    }

    fn compile_shift_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_additive_expr(can_assign)?;
        loop {
            let instr = if self.check_punct("<<") {
                Instr::Shl
            } else if self.check_punct(">>>") {
                Instr::Shr
            } else if self.check_punct(">>") {
                Instr::Sar
            } else {
                break;
            };
            self.bump()?;
            self.compile_additive_expr(false)?;
            self.emit(instr);
        }
        Ok(())
    }

    fn compile_additive_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_multiplicative_expr(can_assign)?;
        loop {
            let instr = if self.check_punct("+") {
                Instr::Add
            } else if self.check_punct("-") {
                Instr::Sub
            } else {
                break;
            };
            self.bump()?;
            self.compile_multiplicative_expr(false)?;
            self.emit(instr);
        }
        Ok(())
    }

    fn compile_multiplicative_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_exponent_expr(can_assign)?;
        loop {
            let instr = if self.check_punct("*") {
                Instr::Mul
            } else if self.check_punct("/") {
                Instr::Div
            } else if self.check_punct("%") {
                Instr::Mod
            } else {
                break;
            };
            self.bump()?;
            self.compile_exponent_expr(false)?;
            self.emit(instr);
        }
        Ok(())
    }

    /// `**` is right-associative, unlike every other binary operator here.
    fn compile_exponent_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_unary_expr(can_assign)?;
        if self.check_punct("**") {
            self.bump()?;
            self.compile_exponent_expr(false)?;
            self.emit(Instr::Pow);
        }
        Ok(())
    }

    fn compile_unary_expr(&mut self, can_assign: bool) -> PResult<()> {
        if self.check_punct("!") {
            self.bump()?;
            self.compile_unary_expr(false)?;
            self.emit(Instr::LNot);
            return Ok(());
        }
        if self.check_punct("~") {
            self.bump()?;
            self.compile_unary_expr(false)?;
            self.emit(Instr::BitNot);
            return Ok(());
        }
        if self.check_punct("-") {
            self.bump()?;
            self.compile_unary_expr(false)?;
            self.emit(Instr::Neg);
            return Ok(());
        }
        if self.check_punct("+") {
            self.bump()?;
            self.compile_unary_expr(false)?;
            self.emit(Instr::Plus);
            return Ok(());
        }
        if self.check_keyword("typeof") {
            self.bump()?;
            self.compile_unary_expr(false)?;
            self.emit(Instr::TypeOf);
            return Ok(());
        }
        if self.check_keyword("void") {
            self.bump()?;
            self.compile_unary_expr(false)?;
            self.emit(Instr::Drop);
            self.emit(Instr::PushUndef);
            return Ok(());
        }
        if self.check_keyword("delete") {
            self.bump()?;
            return self.compile_delete_expr();
        }
        if self.check_punct("++") {
            self.bump()?;
            return self.compile_prefix_incdec(Instr::Inc);
        }
        if self.check_punct("--") {
            self.bump()?;
            return self.compile_prefix_incdec(Instr::Dec);
        }
        self.compile_postfix_expr(can_assign)
    }

    /// Prefix `++`/`--` only binds to a `LeftHandSideExpression` — a bare
    /// identifier or a member-access chain — never to an arbitrary
    /// expression, so this doesn't go through `compile_unary_expr`/
    /// `compile_postfix_expr` at all.
    fn compile_prefix_incdec(&mut self, op: Instr) -> PResult<()> {
        if self.check_keyword("this") {
            self.bump()?;
            self.emit(Instr::PushThis);
            let kind = self.compile_member_chain_leave_target()?;
            return self.finish_prefix_incdec(kind, op);
        }
        if let TokenKind::Identifier(name) = self.cur.kind.clone() {
            if name == "arguments" {
                return Err(self.err("invalid increment/decrement target"));
            }
            self.bump()?;
            if !(self.check_punct(".") || self.check_punct("[")) {
                let r = self.resolve(&name);
                self.emit_get_resolved(&name, r);
                self.emit(op);
                self.emit_put_resolved(&name, r, true);
                return Ok(());
            }
            self.load_var(&name);
            let kind = self.compile_member_chain_leave_target()?;
            return self.finish_prefix_incdec(kind, op);
        }
        Err(self.err("invalid increment/decrement target"))
    }

    /// Walks a chain of `.name`/`[expr]` suffixes with the base value
    /// already on the stack, stopping one suffix short of the end so the
    /// final member's object (and key, for an index target) are left on
    /// the stack for the caller to read-modify-write. Doesn't follow `(`:
    /// `++f().x` isn't a meaningful increment target.
    fn compile_member_chain_leave_target(&mut self) -> PResult<MemberKind> {
        loop {
            if self.check_punct(".") {
                self.bump()?;
                let name = self.expect_name_like()?;
                if self.check_punct(".") || self.check_punct("[") {
                    let idx = self.const_str(&name);
                    self.emit(Instr::GetField(idx));
                    continue;
                }
                return Ok(MemberKind::Field(Rc::from(name.as_str())));
            }
            if self.check_punct("[") {
                self.bump()?;
                self.compile_expression()?;
                self.expect_punct("]")?;
                if self.check_punct(".") || self.check_punct("[") {
                    self.emit(Instr::GetArrayEl);
                    continue;
                }
                return Ok(MemberKind::Index);
            }
            return Err(self.err("invalid increment/decrement target"));
        }
    }

    fn finish_prefix_incdec(&mut self, kind: MemberKind, op: Instr) -> PResult<()> {
        match kind {
            MemberKind::Field(name) => {
                let tmp = self.declare_hidden_local("incdec-obj");
                self.emit(Instr::Dup);
                self.emit(Instr::PutLoc(tmp));
                let idx = self.const_str(&name);
                self.emit(Instr::GetField(idx));
                self.emit(op);
                self.emit(Instr::GetLoc(tmp));
                self.emit(Instr::Swap);
                self.emit(Instr::PutField(idx));
            }
            MemberKind::Index => {
                let tmp_obj = self.declare_hidden_local("incdec-obj");
                let tmp_key = self.declare_hidden_local("incdec-key");
                self.emit(Instr::Dup1);
                self.emit(Instr::PutLoc(tmp_obj));
                self.emit(Instr::Dup);
                self.emit(Instr::PutLoc(tmp_key));
                self.emit(Instr::GetArrayEl);
                self.emit(op);
                self.emit(Instr::GetLoc(tmp_obj));
                self.emit(Instr::GetLoc(tmp_key));
                self.emit(Instr::Rot3L);
                self.emit(Instr::PutArrayEl);
            }
        }
        Ok(())
    }

    fn compile_field_postincdec(&mut self, name: &str, op: Instr) {
        let tmp = self.declare_hidden_local("postincdec-obj");
        self.emit(Instr::Dup);
        self.emit(Instr::PutLoc(tmp));
        let idx = self.const_str(name);
        self.emit(Instr::GetField(idx));
        self.emit(op);
        self.emit(Instr::GetLoc(tmp));
        self.emit(Instr::Swap);
        self.emit(Instr::PutField(idx));
        self.emit(Instr::Drop);
    }

    fn compile_index_postincdec(&mut self, op: Instr) {
        let tmp_obj = self.declare_hidden_local("postincdec-obj");
        let tmp_key = self.declare_hidden_local("postincdec-key");
        self.emit(Instr::Dup1);
        self.emit(Instr::PutLoc(tmp_obj));
        self.emit(Instr::Dup);
        self.emit(Instr::PutLoc(tmp_key));
        self.emit(Instr::GetArrayEl);
        self.emit(op);
        self.emit(Instr::GetLoc(tmp_obj));
        self.emit(Instr::GetLoc(tmp_key));
        self.emit(Instr::Rot3L);
        self.emit(Instr::PutArrayEl);
        self.emit(Instr::Drop);
    }

    fn compile_postfix_expr(&mut self, can_assign: bool) -> PResult<()> {
        self.compile_postfix_expr_inner(can_assign, true)
    }

    /// Parses a primary expression followed by any chain of `.prop`,
    /// `?.`, `[expr]`, and `(args)` suffixes (the member-access-chain
    /// nesting form is the `.`/`[` arm of this loop,
    /// iterated rather than recursed, so arbitrarily deep chains don't
    /// grow the host stack). When `can_assign` is set and the chain ends
    /// in a member access immediately followed by an assignment operator,
    /// delegates to the assignment compiler instead of emitting a final
    /// `GetField`/`GetArrayEl`. `allow_incdec` disables trailing `++`/`--`
    /// handling, used by `delete`'s operand probe.
    fn compile_postfix_expr_inner(&mut self, can_assign: bool, allow_incdec: bool) -> PResult<()> {
        let base_name = match &self.cur.kind {
            TokenKind::Identifier(s) if s != "arguments" => Some(s.clone()),
            _ => None,
        };
        self.compile_primary_expr(can_assign)?;
        let mut touched = false;
        let mut optional_skips: Vec<usize> = Vec::new();
        loop {
            if self.check_punct("?.") {
                touched = true;
                self.bump()?;
                self.emit(Instr::Dup);
                self.emit_is_nullish();
                optional_skips.push(self.emit(Instr::IfTrue(u32::MAX)));
                if self.check_punct("(") {
                    self.compile_call_args_and_emit()?;
                } else if self.check_punct("[") {
                    self.bump()?;
                    self.compile_expression()?;
                    self.expect_punct("]")?;
                    self.emit(Instr::GetArrayEl);
                } else {
                    let name = self.expect_name_like()?;
                    let idx = self.const_str(&name);
                    self.emit(Instr::GetField(idx));
                }
                continue;
            }
            if self.check_punct(".") {
                touched = true;
                self.bump()?;
                let name = self.expect_name_like()?;
                if can_assign && self.is_assign_op() {
                    return self.compile_field_assign(&name);
                }
                if allow_incdec && (self.check_punct("++") || self.check_punct("--")) {
                    let op = if self.check_punct("++") { Instr::PostInc } else { Instr::PostDec };
                    self.bump()?;
                    self.compile_field_postincdec(&name, op);
                    return Ok(());
                }
                let idx = self.const_str(&name);
                if self.check_punct("(") {
                    // `obj.method(...)`: duplicate `obj` so it survives as
                    // `this` underneath the looked-up callee.
                    self.emit(Instr::Dup);
                    self.emit(Instr::GetField(idx));
                    self.compile_method_call_args()?;
                } else {
                    self.emit(Instr::GetField(idx));
                }
                continue;
            }
            if self.check_punct("[") {
                touched = true;
                self.bump()?;
                self.compile_expression()?;
                self.expect_punct("]")?;
                if can_assign && self.is_assign_op() {
                    return self.compile_index_assign();
                }
                if allow_incdec && (self.check_punct("++") || self.check_punct("--")) {
                    let op = if self.check_punct("++") { Instr::PostInc } else { Instr::PostDec };
                    self.bump()?;
                    self.compile_index_postincdec(op);
                    return Ok(());
                }
                if self.check_punct("(") {
                    // `obj[key](...)`: same `this`-preserving trick as the
                    // `.method(...)` case above, stack-shuffled instead of
                    // duplicated directly since both `obj` and `key` are
                    // live on the stack rather than just `obj`.
                    self.emit(Instr::Dup1);
                    self.emit(Instr::Dup1);
                    self.emit(Instr::GetArrayEl);
                    self.emit(Instr::Nip);
                    self.compile_method_call_args()?;
                } else {
                    self.emit(Instr::GetArrayEl);
                }
                continue;
            }
            if self.check_punct("(") {
                touched = true;
                self.compile_call_args_and_emit()?;
                continue;
            }
            break;
        }
        if allow_incdec && !touched && base_name.is_some() {
            if self.check_punct("++") || self.check_punct("--") {
                let op = if self.check_punct("++") { Instr::PostInc } else { Instr::PostDec };
                self.bump()?;
                let name = base_name.unwrap();
                let r = self.resolve(&name);
                self.emit(op);
                self.emit_put_resolved(&name, r, false);
            }
        }
        for p in optional_skips {
            self.patch_to_here(p);
        }
        Ok(())
    }

    // ---- assignment targets ----

    const ASSIGN_OPS: &'static [&'static str] =
        &["=", "+=", "-=", "*=", "/=", "%=", "**=", "<<=", ">>=", "&=", "|=", "^=", "&&=", "||=", "??="];

    fn is_assign_op(&self) -> bool {
        matches!(&self.cur.kind, TokenKind::Punct(p) if Self::ASSIGN_OPS.contains(p))
    }

    fn binop_for_compound(op: &str) -> Instr {
        match op {
            "+=" => Instr::Add,
            "-=" => Instr::Sub,
            "*=" => Instr::Mul,
            "/=" => Instr::Div,
            "%=" => Instr::Mod,
            "**=" => Instr::Pow,
            "<<=" => Instr::Shl,
            ">>=" => Instr::Sar,
            "&=" => Instr::BitAnd,
            "|=" => Instr::BitOr,
            "^=" => Instr::BitXor,
            _ => unreachable!("not a binary compound-assignment operator"),
        }
    }

    fn current_assign_op(&self) -> &'static str {
        match &self.cur.kind {
            TokenKind::Punct(p) => p,
            _ => unreachable!("current_assign_op called without an assignment operator current"),
        }
    }

    fn emit_get_resolved(&mut self, name: &str, r: Resolved) {
        match r {
            Resolved::Local(s) => self.emit(Instr::GetLoc(s)),
            Resolved::Upvalue(i) => self.emit(Instr::GetVarRef(i)),
            Resolved::Global => {
                let idx = self.const_str(name);
                self.emit(Instr::GetGlobal(idx))
            }
        };
    }

    fn emit_put_resolved(&mut self, name: &str, r: Resolved, need_value: bool) {
        match r {
            Resolved::Local(s) => {
                if need_value {
                    self.emit(Instr::Dup);
                }
                self.emit(Instr::PutLoc(s));
            }
            Resolved::Upvalue(i) => {
                if need_value {
                    self.emit(Instr::Dup);
                }
                self.emit(Instr::PutVarRef(i));
            }
            Resolved::Global => {
                let idx = self.const_str(name);
                self.emit(Instr::PutGlobal(idx));
                if !need_value {
                    self.emit(Instr::Drop);
                }
            }
        }
    }

    /// Emits the short-circuit test for a logical-assignment operator
    /// against a value already duplicated on top of the stack (so one
    /// copy is consumed by the test, one remains as the short-circuited
    /// result). Returns the jump taken when the right-hand side must be
    /// skipped entirely — both assignment and the field/index write, so a
    /// setter defined on the target isn't invoked when `&&=`/`||=`/`??=`
    /// don't actually assign.
    fn emit_logical_compound_test(&mut self, op: &str) -> usize {
        match op {
            "&&=" => self.emit(Instr::IfFalse(u32::MAX)),
            "||=" => self.emit(Instr::IfTrue(u32::MAX)),
            "??=" => {
                self.emit_is_nullish();
                self.emit(Instr::IfFalse(u32::MAX))
            }
            _ => unreachable!("not a logical-assignment operator"),
        }
    }

    /// Called from `compile_primary_expr`'s identifier arm once it's
    /// already seen `can_assign && is_assign_op()`; nothing has been
    /// pushed for this identifier yet; loads happen here only for
    /// compound forms, never for bare `=`.
    fn compile_identifier_assign(&mut self, name: &str) -> PResult<()> {
        let op = self.current_assign_op();
        self.bump()?;
        let r = self.resolve(name);
        match op {
            "=" => {
                self.compile_assignment_expr()?;
                self.emit_put_resolved(name, r, true);
            }
            "&&=" | "||=" | "??=" => {
                self.emit_get_resolved(name, r);
                self.emit(Instr::Dup);
                let skip = self.emit_logical_compound_test(op);
                self.emit(Instr::Drop);
                self.compile_assignment_expr()?;
                self.emit_put_resolved(name, r, true);
                let end = self.emit_goto_placeholder();
                self.patch_to_here(skip);
                self.patch_to_here(end);
            }
            _ => {
                self.emit_get_resolved(name, r);
                self.compile_assignment_expr()?;
                self.emit(Self::binop_for_compound(op));
                self.emit_put_resolved(name, r, true);
            }
        }
        Ok(())
    }

    /// Called with `[obj]` already on the stack and `.name` consumed; the
    /// current token is the assignment operator.
    fn compile_field_assign(&mut self, name: &str) -> PResult<()> {
        let op = self.current_assign_op();
        self.bump()?;
        let idx = self.const_str(name);
        match op {
            "=" => {
                self.compile_assignment_expr()?;
                self.emit(Instr::PutField(idx));
            }
            "&&=" | "||=" | "??=" => {
                let tmp = self.declare_hidden_local("assign-obj");
                self.emit(Instr::Dup);
                self.emit(Instr::PutLoc(tmp));
                self.emit(Instr::GetField(idx));
                self.emit(Instr::Dup);
                let skip = self.emit_logical_compound_test(op);
                self.emit(Instr::Drop);
                self.compile_assignment_expr()?;
                self.emit(Instr::GetLoc(tmp));
                self.emit(Instr::Swap);
                self.emit(Instr::PutField(idx));
                let end = self.emit_goto_placeholder();
                self.patch_to_here(skip);
                self.patch_to_here(end);
            }
            _ => {
                let tmp = self.declare_hidden_local("assign-obj");
                self.emit(Instr::Dup);
                self.emit(Instr::PutLoc(tmp));
                self.emit(Instr::GetField(idx));
                self.compile_assignment_expr()?;
                self.emit(Self::binop_for_compound(op));
                self.emit(Instr::GetLoc(tmp));
                self.emit(Instr::Swap);
                self.emit(Instr::PutField(idx));
            }
        }
        Ok(())
    }

    /// Called with `[obj, key]` already on the stack and `]` consumed;
    /// the current token is the assignment operator.
    fn compile_index_assign(&mut self) -> PResult<()> {
        let op = self.current_assign_op();
        self.bump()?;
        match op {
            "=" => {
                self.compile_assignment_expr()?;
                self.emit(Instr::PutArrayEl);
            }
            "&&=" | "||=" | "??=" => {
                let tmp_obj = self.declare_hidden_local("assign-obj");
                let tmp_key = self.declare_hidden_local("assign-key");
                self.emit(Instr::Dup1);
                self.emit(Instr::PutLoc(tmp_obj));
                self.emit(Instr::Dup);
                self.emit(Instr::PutLoc(tmp_key));
                self.emit(Instr::GetArrayEl);
                self.emit(Instr::Dup);
                let skip = self.emit_logical_compound_test(op);
                self.emit(Instr::Drop);
                self.compile_assignment_expr()?;
                self.emit(Instr::GetLoc(tmp_obj));
                self.emit(Instr::GetLoc(tmp_key));
                self.emit(Instr::Rot3L);
                self.emit(Instr::PutArrayEl);
                let end = self.emit_goto_placeholder();
                self.patch_to_here(skip);
                self.patch_to_here(end);
            }
            _ => {
                let tmp_obj = self.declare_hidden_local("assign-obj");
                let tmp_key = self.declare_hidden_local("assign-key");
                self.emit(Instr::Dup1);
                self.emit(Instr::PutLoc(tmp_obj));
                self.emit(Instr::Dup);
                self.emit(Instr::PutLoc(tmp_key));
                self.emit(Instr::GetArrayEl);
                self.compile_assignment_expr()?;
                self.emit(Self::binop_for_compound(op));
                self.emit(Instr::GetLoc(tmp_obj));
                self.emit(Instr::GetLoc(tmp_key));
                self.emit(Instr::Rot3L);
                self.emit(Instr::PutArrayEl);
            }
        }
        Ok(())
    }

    // ---- calls ----

    fn compile_args(&mut self) -> PResult<u16> {
        self.expect_punct("(")?;
        let mut n: u16 = 0;
        if !self.check_punct(")") {
            loop {
                if self.check_punct("...") {
                    return Err(self.err("spread arguments are not supported"));
                }
                self.compile_assignment_expr()?;
                n += 1;
                if self.check_punct(",") {
                    self.bump()?;
                    continue;
                }
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(n)
    }

    /// Stack before: `[callee]`.
    fn compile_call_args_and_emit(&mut self) -> PResult<()> {
        let n = self.compile_args()?;
        self.emit(Instr::Call(n));
        Ok(())
    }

    /// Stack before: `[this, callee]`.
    fn compile_method_call_args(&mut self) -> PResult<()> {
        let n = self.compile_args()?;
        self.emit(Instr::CallMethod(n));
        Ok(())
    }

    /// `delete obj.prop` / `delete obj[expr]`; any other operand is not a
    /// reference, so the result is unconditionally `true`. Walks its own
    /// member chain rather than going through
    /// `compile_postfix_expr` since it needs the object and key left
    /// separately on the stack for `Delete`, not folded into a single
    /// `GetField`/`GetArrayEl`.
    fn compile_delete_expr(&mut self) -> PResult<()> {
        if !(matches!(self.cur.kind, TokenKind::Identifier(_)) || self.check_keyword("this")) {
            self.compile_unary_expr(false)?;
            self.emit(Instr::Drop);
            self.emit(Instr::PushTrue);
            return Ok(());
        }
        self.compile_primary_expr(false)?;
        let mut ends_in_member = false;
        loop {
            if self.check_punct(".") {
                self.bump()?;
                let name = self.expect_name_like()?;
                if self.check_punct(".") || self.check_punct("[") || self.check_punct("(") {
                    let idx = self.const_str(&name);
                    self.emit(Instr::GetField(idx));
                    continue;
                }
                let idx = self.const_str(&name);
                self.emit(Instr::PushConst(idx));
                ends_in_member = true;
                break;
            }
            if self.check_punct("[") {
                self.bump()?;
                self.compile_expression()?;
                self.expect_punct("]")?;
                if self.check_punct(".") || self.check_punct("[") || self.check_punct("(") {
                    self.emit(Instr::GetArrayEl);
                    continue;
                }
                ends_in_member = true;
                break;
            }
            if self.check_punct("(") {
                self.compile_call_args_and_emit()?;
                continue;
            }
            break;
        }
        if ends_in_member {
            self.emit(Instr::Delete);
        } else {
            self.emit(Instr::Drop);
            self.emit(Instr::PushTrue);
        }
        Ok(())
    }

    // ---- primary expressions, literals, functions ----
    //
    // `compile_primary_expr` is the base case every precedence level in the
    // expression grammar above eventually bottoms out at. Two of the four
    // deep-nesting forms live here: parenthesised
    // chains (`compile_paren_expr`, a flat loop rather than recursion
    // through this function) and array literals (`compile_array_literal`,
    // an explicit work stack of `ArrayFrame`s).

    fn parse_param_list(&mut self) -> PResult<Vec<String>> {
        let mut params = Vec::new();
        if !self.check_punct(")") {
            loop {
                params.push(self.expect_identifier()?);
                if self.check_punct(",") {
                    self.bump()?;
                    continue;
                }
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(params)
    }

    /// Compiles a `{ ... }` function body (the brace-nesting loop is
    /// `compile_block`'s, reused here since a function body is just a block
    /// with an implicit trailing `return undefined;`) into its own
    /// constant-pooled `FunctionProto`.
    fn compile_function_body(
        &mut self,
        name: Option<Rc<str>>,
        params: Vec<String>,
        is_arrow: bool,
        constructible: bool,
    ) -> PResult<Rc<FunctionProto>> {
        self.funcs.push(FuncState::new(name, false, is_arrow));
        for p in &params {
            self.declare_local(p);
        }
        self.top_mut().param_count = params.len() as u16;
        self.compile_block()?;
        self.emit(Instr::ReturnUndef);
        let fs = self.funcs.pop().unwrap();
        Ok(Rc::new(self.finish_proto(fs, 0, constructible)))
    }

    fn emit_function_expr(&mut self, proto: Rc<FunctionProto>) {
        let idx = self.top().constants.len() as u32;
        self.top_mut().constants.push(Constant::Function(proto));
        self.emit(Instr::FClosure(idx));
    }

    fn compile_function_expr(&mut self) -> PResult<()> {
        self.bump()?; // 'function'
        let name = match self.cur.kind.clone() {
            TokenKind::Identifier(s) => {
                self.bump()?;
                Some(Rc::from(s.as_str()))
            }
            _ => None,
        };
        self.expect_punct("(")?;
        let params = self.parse_param_list()?;
        let proto = self.compile_function_body(name, params, false, true)?;
        self.emit_function_expr(proto);
        Ok(())
    }

    /// Bounded lookahead for `(...) => ...`: tries to parse a parameter
    /// list, restoring the lexer/token state on any mismatch so the caller
    /// falls back to an ordinary parenthesised expression.
    fn try_parse_arrow_params(&mut self) -> PResult<Option<Vec<String>>> {
        let saved_cur = self.cur.clone();
        let saved_cur_mark = self.cur_mark;
        let saved_lexer_mark = self.lexer.mark();
        match self.try_parse_arrow_params_inner() {
            Ok(Some(params)) => Ok(Some(params)),
            _ => {
                self.cur = saved_cur;
                self.cur_mark = saved_cur_mark;
                self.lexer.restore(saved_lexer_mark);
                Ok(None)
            }
        }
    }

    fn try_parse_arrow_params_inner(&mut self) -> PResult<Option<Vec<String>>> {
        self.bump()?; // '('
        let mut params = Vec::new();
        if !self.check_punct(")") {
            loop {
                match self.cur.kind.clone() {
                    TokenKind::Identifier(s) => {
                        self.bump()?;
                        params.push(s);
                    }
                    _ => return Ok(None),
                }
                if self.check_punct(",") {
                    self.bump()?;
                    continue;
                }
                break;
            }
        }
        if !self.check_punct(")") {
            return Ok(None);
        }
        self.bump()?;
        if !self.check_punct("=>") {
            return Ok(None);
        }
        self.bump()?;
        Ok(Some(params))
    }

    /// Arrow body is either a `{ ... }` block (explicit `return`s only) or a
    /// bare expression whose value is implicitly returned.
    fn compile_arrow_function(&mut self, params: Vec<String>) -> PResult<()> {
        self.funcs.push(FuncState::new(None, false, true));
        for p in &params {
            self.declare_local(p);
        }
        self.top_mut().param_count = params.len() as u16;
        if self.check_punct("{") {
            self.compile_block()?;
            self.emit(Instr::ReturnUndef);
        } else {
            self.compile_assignment_expr()?;
            self.emit(Instr::Return);
        }
        let fs = self.funcs.pop().unwrap();
        let proto = Rc::new(self.finish_proto(fs, 0, false));
        self.emit_function_expr(proto);
        Ok(())
    }

    /// Flat loop over `(((expr)))`-style chains:
    /// counts every opening paren before reading the single inner
    /// expression once, then consumes the matching closers, so depth never
    /// grows the host call stack.
    fn compile_paren_expr(&mut self) -> PResult<()> {
        let mut depth: u32 = 0;
        while self.check_punct("(") {
            self.bump()?;
            depth += 1;
        }
        self.compile_expression()?;
        while depth > 0 {
            self.expect_punct(")")?;
            depth -= 1;
        }
        Ok(())
    }

    /// Explicit work-stack array literal: a `[` not
    /// immediately starting a new element expression pushes a fresh
    /// `ArrayFrame` instead of recursing, so `[[[…]]]` to 1000 levels
    /// doesn't grow the host stack. Ordinary elements still compile through
    /// `compile_assignment_expr`, which may itself contain array literals —
    /// only the pure-nesting chain is handled without recursion.
    fn compile_array_literal(&mut self) -> PResult<()> {
        self.expect_punct("[")?;
        let mut frames: Vec<ArrayFrame> = vec![ArrayFrame { count: 0 }];
        loop {
            if self.check_punct("]") {
                self.bump()?;
                let finished = frames.pop().unwrap();
                self.emit(Instr::ArrayFrom(finished.count));
                match frames.last_mut() {
                    None => return Ok(()),
                    Some(parent) => {
                        parent.count += 1;
                        if self.check_punct(",") {
                            self.bump()?;
                        }
                        continue;
                    }
                }
            }
            if self.check_punct("[") {
                self.bump()?;
                frames.push(ArrayFrame { count: 0 });
                continue;
            }
            self.compile_assignment_expr()?;
            frames.last_mut().unwrap().count += 1;
            if self.check_punct(",") {
                self.bump()?;
            }
        }
    }

    /// Property/method/getter/setter key: identifier, keyword-as-name,
    /// string, or number (object literals accept all four as keys).
    fn expect_member_key(&mut self) -> PResult<String> {
        match self.cur.kind.clone() {
            TokenKind::Identifier(s) | TokenKind::Keyword(s) => {
                self.bump()?;
                Ok(s)
            }
            TokenKind::String(s) => {
                self.bump()?;
                Ok(s)
            }
            TokenKind::Number(n) => {
                self.bump()?;
                Ok(crate::vm::format_number(n))
            }
            _ => Err(self.err("expected a property key")),
        }
    }

    fn compile_object_literal(&mut self) -> PResult<()> {
        self.expect_punct("{")?;
        self.emit(Instr::Object);
        if self.check_punct("}") {
            self.bump()?;
            return Ok(());
        }
        loop {
            self.compile_object_member()?;
            if self.check_punct(",") {
                self.bump()?;
                if self.check_punct("}") {
                    break;
                }
                continue;
            }
            break;
        }
        self.expect_punct("}")?;
        Ok(())
    }

    /// One `key: value`, `key(...) {...}`, `get key() {...}`/`set key(v) {...}`,
    /// or `{x}` shorthand member. `get`/`set` are only accessor prefixes when
    /// followed by a key and `(`; otherwise they're plain key names, so a
    /// bounded lookahead with restore disambiguates (same device as
    /// `try_parse_arrow_params`).
    fn compile_object_member(&mut self) -> PResult<()> {
        if self.check_keyword("get") || self.check_keyword("set") {
            let is_getter = self.check_keyword("get");
            let saved_cur = self.cur.clone();
            let saved_cur_mark = self.cur_mark;
            let saved_lexer_mark = self.lexer.mark();
            self.bump()?;
            if matches!(self.cur.kind, TokenKind::Identifier(_) | TokenKind::Keyword(_) | TokenKind::String(_)) {
                let name = self.expect_member_key()?;
                if self.check_punct("(") {
                    self.bump()?;
                    let params = if is_getter { Vec::new() } else { vec![self.expect_identifier()?] };
                    self.expect_punct(")")?;
                    let proto = self.compile_function_body(Some(Rc::from(name.as_str())), params, false, false)?;
                    self.emit_function_expr(proto);
                    let idx = self.const_str(&name);
                    self.emit(if is_getter { Instr::DefineGetter(idx) } else { Instr::DefineSetter(idx) });
                    return Ok(());
                }
            }
            self.cur = saved_cur;
            self.cur_mark = saved_cur_mark;
            self.lexer.restore(saved_lexer_mark);
        }
        let name = self.expect_member_key()?;
        if self.check_punct("(") {
            self.bump()?;
            let params = self.parse_param_list()?;
            let proto = self.compile_function_body(Some(Rc::from(name.as_str())), params, false, false)?;
            self.emit_function_expr(proto);
            let idx = self.const_str(&name);
            self.emit(Instr::DefineField(idx));
            return Ok(());
        }
        if self.check_punct(":") {
            self.bump()?;
            self.compile_assignment_expr()?;
            let idx = self.const_str(&name);
            self.emit(Instr::DefineField(idx));
            return Ok(());
        }
        // shorthand `{x}`: value comes from the enclosing scope's binding of the same name.
        self.load_var(&name);
        let idx = self.const_str(&name);
        self.emit(Instr::DefineField(idx));
        Ok(())
    }

    /// `new Callee(...)` / `new Callee.member(...)`: the callee is a
    /// member-chain root followed only by `.`/`[` suffixes (never a call —
    /// `new f()()` parses as `(new f())()`, handled by the caller's postfix
    /// loop once this returns), then an optional argument list.
    fn compile_new_expr(&mut self) -> PResult<()> {
        self.bump()?; // 'new'
        if self.check_keyword("new") {
            self.compile_new_expr()?;
        } else {
            self.compile_primary_expr(false)?;
            loop {
                if self.check_punct(".") {
                    self.bump()?;
                    let name = self.expect_name_like()?;
                    let idx = self.const_str(&name);
                    self.emit(Instr::GetField(idx));
                    continue;
                }
                if self.check_punct("[") {
                    self.bump()?;
                    self.compile_expression()?;
                    self.expect_punct("]")?;
                    self.emit(Instr::GetArrayEl);
                    continue;
                }
                break;
            }
        }
        let n = if self.check_punct("(") { self.compile_args()? } else { 0 };
        self.emit(Instr::CallConstructor(n));
        Ok(())
    }

    fn compile_template(&mut self, pieces: &[TemplatePiece]) -> PResult<()> {
        if pieces.is_empty() {
            let idx = self.const_str("");
            self.emit(Instr::PushConst(idx));
            return Ok(());
        }
        for (i, piece) in pieces.iter().enumerate() {
            match piece {
                TemplatePiece::Text(s) => {
                    let idx = self.const_str(s);
                    self.emit(Instr::PushConst(idx));
                }
                TemplatePiece::Expr(src) => {
                    self.compile_nested_source_expr(src)?;
                }
            }
            // The first piece is always `Text` (possibly empty), so the
            // running accumulator is always a string by the time the first
            // `Add` runs — guaranteeing `add`'s string-concatenation branch
            // fires for every subsequent piece (`add`'s string-concatenation duality).
            if i > 0 {
                self.emit(Instr::Add);
            }
        }
        Ok(())
    }

    /// The grammar's base case: every precedence level above bottoms out
    /// here. Re-lexes a pending `/`/`/=` as a regex literal when the parser
    /// context expects an expression.
    fn compile_primary_expr(&mut self, can_assign: bool) -> PResult<()> {
        if self.check_punct("/") || self.check_punct("/=") {
            let (pos, line, col) = self.cur_mark;
            let tok = self.lexer.relex_slash_as_regex(pos, line, col)?;
            self.cur = tok;
        }
        match self.cur.kind.clone() {
            TokenKind::Number(n) => {
                self.bump()?;
                let idx = self.const_number(n);
                self.emit(Instr::PushConst(idx));
                Ok(())
            }
            TokenKind::String(s) => {
                self.bump()?;
                let idx = self.const_str(&s);
                self.emit(Instr::PushConst(idx));
                Ok(())
            }
            TokenKind::Template(pieces) => {
                self.bump()?;
                self.compile_template(&pieces)
            }
            TokenKind::Regex { source, flags } => {
                self.bump()?;
                let idx = self.top().constants.len() as u32;
                self.top_mut().constants.push(Constant::Regex { source: Rc::from(source.as_str()), flags: Rc::from(flags.as_str()) });
                self.emit(Instr::RegExp(idx));
                Ok(())
            }
            TokenKind::Keyword(k) => match k.as_str() {
                "true" => {
                    self.bump()?;
                    self.emit(Instr::PushTrue);
                    Ok(())
                }
                "false" => {
                    self.bump()?;
                    self.emit(Instr::PushFalse);
                    Ok(())
                }
                "null" => {
                    self.bump()?;
                    self.emit(Instr::PushNull);
                    Ok(())
                }
                "undefined" => {
                    self.bump()?;
                    self.emit(Instr::PushUndef);
                    Ok(())
                }
                "this" => {
                    self.bump()?;
                    self.emit(Instr::PushThis);
                    Ok(())
                }
                "function" => self.compile_function_expr(),
                "new" => self.compile_new_expr(),
                _ => Err(self.err(format!("unexpected keyword '{}'", k))),
            },
            TokenKind::Identifier(name) => {
                if name == "arguments" {
                    self.bump()?;
                    self.emit(Instr::Arguments);
                    return Ok(());
                }
                self.bump()?;
                if self.check_punct("=>") {
                    self.bump()?;
                    return self.compile_arrow_function(vec![name]);
                }
                if can_assign && self.is_assign_op() {
                    return self.compile_identifier_assign(&name);
                }
                self.load_var(&name);
                Ok(())
            }
            TokenKind::Punct("(") => {
                if let Some(params) = self.try_parse_arrow_params()? {
                    return self.compile_arrow_function(params);
                }
                self.compile_paren_expr()
            }
            TokenKind::Punct("[") => self.compile_array_literal(),
            TokenKind::Punct("{") => self.compile_object_literal(),
            _ => Err(self.err("unexpected token in expression")),
        }
    }
}
