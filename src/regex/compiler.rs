// File: src/regex/compiler.rs
//
// Pattern -> bytecode compiler for the engine's regex dialect (spec.md
// §4.4). A recursive-descent parser over the pattern text emits a flat
// `Vec<RegexOp>` with backtracking `Split`/`Jump` targets, in the classic
// Thompson/Pike backtracking-VM shape (Split-for-choice, Jump-for-loop)
// rather than a Thompson NFA, since backreferences and lookaround can't be
// expressed as a pure NFA.

use crate::errors::{EngineError, ErrorKind, SourceLocation};
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub enum CharMatcher {
    Digit,
    NotDigit,
    Word,
    NotWord,
    Space,
    NotSpace,
    Range(char, char),
}

impl CharMatcher {
    fn matches(&self, c: char) -> bool {
        match self {
            CharMatcher::Digit => c.is_ascii_digit(),
            CharMatcher::NotDigit => !c.is_ascii_digit(),
            CharMatcher::Word => c.is_ascii_alphanumeric() || c == '_',
            CharMatcher::NotWord => !(c.is_ascii_alphanumeric() || c == '_'),
            CharMatcher::Space => c.is_whitespace(),
            CharMatcher::NotSpace => !c.is_whitespace(),
            CharMatcher::Range(lo, hi) => c >= *lo && c <= *hi,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CharClass {
    pub negated: bool,
    pub items: Vec<CharMatcher>,
}

impl CharClass {
    fn matches(&self, c: char, ignore_case: bool) -> bool {
        let hit = self.items.iter().any(|m| {
            if ignore_case {
                m.matches(c) || m.matches(swap_case(c))
            } else {
                m.matches(c)
            }
        });
        hit != self.negated
    }
}

fn swap_case(c: char) -> char {
    if c.is_uppercase() {
        c.to_ascii_lowercase()
    } else {
        c.to_ascii_uppercase()
    }
}

#[derive(Debug, Clone)]
pub enum RegexOp {
    Char(char),
    Any,
    Class(CharClass),
    StartAnchor,
    EndAnchor,
    WordBoundary(bool),
    Save(usize),
    Jump(usize),
    Split(usize, usize),
    /// Like `Split`, but for a `*`/`+` loop back-edge: the matcher refuses
    /// to take the loop branch again if input position hasn't advanced
    /// since the last visit to this guard at the same position (spec.md
    /// §4.4's zero-advance mitigation for patterns like `(a*)*`).
    LoopSplit(usize, usize, usize),
    Backref(usize),
    LookAround { prog: Rc<Vec<RegexOp>>, negative: bool, behind: bool },
    Match,
}

#[derive(Debug)]
pub struct RegexProgram {
    pub source: Rc<str>,
    pub flags: Rc<str>,
    pub ops: Vec<RegexOp>,
    pub group_count: usize,
    pub loop_count: usize,
    pub group_names: HashMap<String, usize>,
    pub ignore_case: bool,
    pub multiline: bool,
    pub dot_all: bool,
    pub global: bool,
    pub sticky: bool,
    pub unicode: bool,
}

const MAX_REPEAT: u32 = 10_000;

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    group_count: usize,
    loop_count: usize,
    group_names: HashMap<String, usize>,
    source: &'a str,
}

type PResult<T> = Result<T, EngineError>;

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Parser { chars: source.chars().collect(), pos: 0, group_count: 0, loop_count: 0, group_names: HashMap::new(), source }
    }

    fn err(&self, msg: impl Into<String>) -> EngineError {
        EngineError::new(ErrorKind::RegexError, format!("/{}/: {}", self.source, msg.into()), SourceLocation::unknown())
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<char> {
        self.chars.get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_alternation(&mut self) -> PResult<Vec<RegexOp>> {
        let mut branches = vec![self.parse_concat()?];
        while self.eat('|') {
            branches.push(self.parse_concat()?);
        }
        if branches.len() == 1 {
            return Ok(branches.pop().unwrap());
        }
        // Chain of Split(branch_i, next_try) / Jump(end) per classic alternation codegen.
        let mut out = Vec::new();
        let mut jumps_to_end = Vec::new();
        for (i, branch) in branches.iter().enumerate() {
            let is_last = i == branches.len() - 1;
            if !is_last {
                let split_pos = out.len();
                out.push(RegexOp::Split(0, 0)); // patched below
                let a = out.len();
                out.extend(branch.iter().cloned());
                jumps_to_end.push(out.len());
                out.push(RegexOp::Jump(0)); // patched below
                let b = out.len();
                out[split_pos] = RegexOp::Split(a, b);
            } else {
                out.extend(branch.iter().cloned());
            }
        }
        let end = out.len();
        for j in jumps_to_end {
            out[j] = RegexOp::Jump(end);
        }
        Ok(out)
    }

    fn parse_concat(&mut self) -> PResult<Vec<RegexOp>> {
        let mut out = Vec::new();
        while let Some(c) = self.peek() {
            if c == '|' || c == ')' {
                break;
            }
            let atom = self.parse_atom()?;
            out.extend(self.parse_quantified(atom)?);
        }
        Ok(out)
    }

    fn parse_quantified(&mut self, atom: Vec<RegexOp>) -> PResult<Vec<RegexOp>> {
        let (min, max) = match self.peek() {
            Some('*') => {
                self.bump();
                (0, None)
            }
            Some('+') => {
                self.bump();
                (1, None)
            }
            Some('?') => {
                self.bump();
                (0, Some(1))
            }
            Some('{') if self.looks_like_bound() => self.parse_bound()?,
            _ => return Ok(atom),
        };
        let lazy = self.eat('?');
        Ok(self.compile_repeat(atom, min, max, lazy))
    }

    fn looks_like_bound(&self) -> bool {
        let mut i = 1;
        let mut saw_digit = false;
        while let Some(c) = self.peek_at(i) {
            if c.is_ascii_digit() {
                saw_digit = true;
                i += 1;
            } else if c == ',' {
                i += 1;
            } else if c == '}' {
                return saw_digit;
            } else {
                return false;
            }
        }
        false
    }

    fn parse_bound(&mut self) -> PResult<(u32, Option<u32>)> {
        self.bump(); // '{'
        let mut min_s = String::new();
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            min_s.push(self.bump().unwrap());
        }
        let min: u32 = min_s.parse().map_err(|_| self.err("invalid repetition bound"))?;
        let max = if self.eat(',') {
            let mut max_s = String::new();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                max_s.push(self.bump().unwrap());
            }
            if max_s.is_empty() {
                None
            } else {
                Some(max_s.parse::<u32>().map_err(|_| self.err("invalid repetition bound"))?)
            }
        } else {
            Some(min)
        };
        if !self.eat('}') {
            return Err(self.err("unterminated repetition bound"));
        }
        if min > MAX_REPEAT || max.is_some_and(|m| m > MAX_REPEAT) {
            return Err(self.err("repetition count too large"));
        }
        Ok((min, max))
    }

    /// Expands `{m,n}` by unrolling: `m` mandatory copies followed by
    /// either `(n-m)` optional copies or, for unbounded `{m,}`, a single
    /// guarded loop.
    fn compile_repeat(&mut self, atom: Vec<RegexOp>, min: u32, max: Option<u32>, lazy: bool) -> Vec<RegexOp> {
        let mut out = Vec::new();
        for _ in 0..min {
            out.extend(relocate(&atom, out.len()));
        }
        match max {
            None => {
                let guard = self.loop_count;
                self.loop_count += 1;
                let l1 = out.len();
                out.push(RegexOp::LoopSplit(0, 0, guard)); // patched
                let a = out.len();
                out.extend(relocate(&atom, a));
                out.push(RegexOp::Jump(l1));
                let b = out.len();
                if lazy {
                    out[l1] = RegexOp::LoopSplit(b, a, guard);
                } else {
                    out[l1] = RegexOp::LoopSplit(a, b, guard);
                }
            }
            Some(max) => {
                let optional = max.saturating_sub(min);
                let mut split_positions = Vec::new();
                for _ in 0..optional {
                    let split_pos = out.len();
                    out.push(RegexOp::Split(0, 0)); // patched in a second pass
                    split_positions.push(split_pos);
                    let body_start = out.len();
                    out.extend(relocate(&atom, body_start));
                }
                let end = out.len();
                for sp in split_positions {
                    let a = sp + 1;
                    if lazy {
                        out[sp] = RegexOp::Split(end, a);
                    } else {
                        out[sp] = RegexOp::Split(a, end);
                    }
                }
            }
        }
        out
    }

    fn parse_atom(&mut self) -> PResult<Vec<RegexOp>> {
        match self.peek() {
            Some('.') => {
                self.bump();
                Ok(vec![RegexOp::Any])
            }
            Some('^') => {
                self.bump();
                Ok(vec![RegexOp::StartAnchor])
            }
            Some('$') => {
                self.bump();
                Ok(vec![RegexOp::EndAnchor])
            }
            Some('(') => self.parse_group(),
            Some('[') => self.parse_class(),
            Some('\\') => self.parse_escape(),
            Some(c) => {
                self.bump();
                Ok(vec![RegexOp::Char(c)])
            }
            None => Err(self.err("unexpected end of pattern")),
        }
    }

    fn parse_group(&mut self) -> PResult<Vec<RegexOp>> {
        self.bump(); // '('
        if self.eat('?') {
            if self.eat(':') {
                let body = self.parse_alternation()?;
                if !self.eat(')') {
                    return Err(self.err("unterminated group"));
                }
                return Ok(body);
            }
            match self.peek() {
                Some('=') | Some('!') => {
                    let negative = self.bump() == Some('!');
                    let body = self.parse_alternation()?;
                    if !self.eat(')') {
                        return Err(self.err("unterminated lookahead"));
                    }
                    return Ok(vec![RegexOp::LookAround { prog: Rc::new(body), negative, behind: false }]);
                }
                Some('<') => {
                    if self.peek_at(1) == Some('=') || self.peek_at(1) == Some('!') {
                        self.bump(); // '<'
                        let negative = self.bump() == Some('!');
                        let body = self.parse_alternation()?;
                        if !self.eat(')') {
                            return Err(self.err("unterminated lookbehind"));
                        }
                        return Ok(vec![RegexOp::LookAround { prog: Rc::new(body), negative, behind: true }]);
                    }
                    // named group (?<name>...)
                    self.bump(); // '<'
                    let mut name = String::new();
                    while let Some(c) = self.peek() {
                        if c == '>' {
                            break;
                        }
                        name.push(c);
                        self.bump();
                    }
                    if !self.eat('>') {
                        return Err(self.err("unterminated group name"));
                    }
                    self.group_count += 1;
                    let idx = self.group_count;
                    self.group_names.insert(name, idx);
                    let mut out = vec![RegexOp::Save(idx * 2)];
                    out.extend(self.parse_alternation()?);
                    out.push(RegexOp::Save(idx * 2 + 1));
                    if !self.eat(')') {
                        return Err(self.err("unterminated group"));
                    }
                    return Ok(out);
                }
                _ => return Err(self.err("unsupported group syntax")),
            }
        }
        self.group_count += 1;
        let idx = self.group_count;
        let mut out = vec![RegexOp::Save(idx * 2)];
        out.extend(self.parse_alternation()?);
        out.push(RegexOp::Save(idx * 2 + 1));
        if !self.eat(')') {
            return Err(self.err("unterminated group"));
        }
        Ok(out)
    }

    fn parse_class(&mut self) -> PResult<Vec<RegexOp>> {
        self.bump(); // '['
        let negated = self.eat('^');
        let mut items = Vec::new();
        while let Some(c) = self.peek() {
            if c == ']' {
                break;
            }
            if c == '\\' {
                self.bump();
                let esc = self.bump().ok_or_else(|| self.err("unterminated class escape"))?;
                items.push(predefined_class(esc).unwrap_or(CharMatcher::Range(esc, esc)));
                continue;
            }
            self.bump();
            if self.peek() == Some('-') && self.peek_at(1).is_some() && self.peek_at(1) != Some(']') {
                self.bump(); // '-'
                let hi = self.bump().unwrap();
                items.push(CharMatcher::Range(c, hi));
            } else {
                items.push(CharMatcher::Range(c, c));
            }
        }
        if !self.eat(']') {
            return Err(self.err("unterminated character class"));
        }
        Ok(vec![RegexOp::Class(CharClass { negated, items })])
    }

    fn parse_escape(&mut self) -> PResult<Vec<RegexOp>> {
        self.bump(); // backslash
        let c = self.bump().ok_or_else(|| self.err("trailing backslash"))?;
        if let Some(cls) = predefined_class(c) {
            return Ok(vec![RegexOp::Class(CharClass { negated: false, items: vec![cls] })]);
        }
        match c {
            'b' => Ok(vec![RegexOp::WordBoundary(true)]),
            'B' => Ok(vec![RegexOp::WordBoundary(false)]),
            'n' => Ok(vec![RegexOp::Char('\n')]),
            't' => Ok(vec![RegexOp::Char('\t')]),
            'r' => Ok(vec![RegexOp::Char('\r')]),
            '0' => Ok(vec![RegexOp::Char('\0')]),
            c if c.is_ascii_digit() => {
                let mut num = String::from(c);
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    num.push(self.bump().unwrap());
                }
                let idx: usize = num.parse().map_err(|_| self.err("invalid backreference"))?;
                Ok(vec![RegexOp::Backref(idx)])
            }
            other => Ok(vec![RegexOp::Char(other)]),
        }
    }
}

fn predefined_class(c: char) -> Option<CharMatcher> {
    Some(match c {
        'd' => CharMatcher::Digit,
        'D' => CharMatcher::NotDigit,
        'w' => CharMatcher::Word,
        'W' => CharMatcher::NotWord,
        's' => CharMatcher::Space,
        'S' => CharMatcher::NotSpace,
        _ => return None,
    })
}

/// Shifts every jump/split/loop-split target in `ops` by `offset`, for
/// splicing a previously-compiled sub-program into a larger one at a new
/// position (used by repetition unrolling, which copies the same atom
/// program several times).
fn relocate(ops: &[RegexOp], offset: usize) -> Vec<RegexOp> {
    ops.iter()
        .map(|op| match op {
            RegexOp::Jump(t) => RegexOp::Jump(t + offset),
            RegexOp::Split(a, b) => RegexOp::Split(a + offset, b + offset),
            RegexOp::LoopSplit(a, b, g) => RegexOp::LoopSplit(a + offset, b + offset, *g),
            other => other.clone(),
        })
        .collect()
}

/// Compiles `source`/`flags` into a `RegexProgram`. `flags` may contain any
/// of `g i m s u y` (global, ignoreCase, multiline, dotAll, unicode, sticky);
/// an unrecognised flag character is a `RegexError`.
pub fn compile(source: &str, flags: &str) -> Result<RegexProgram, EngineError> {
    let mut global = false;
    let mut ignore_case = false;
    let mut multiline = false;
    let mut dot_all = false;
    let mut unicode = false;
    let mut sticky = false;
    for c in flags.chars() {
        match c {
            'g' => global = true,
            'i' => ignore_case = true,
            'm' => multiline = true,
            's' => dot_all = true,
            'u' => unicode = true,
            'y' => sticky = true,
            other => {
                return Err(EngineError::new(
                    ErrorKind::RegexError,
                    format!("unknown regex flag '{}'", other),
                    SourceLocation::unknown(),
                ))
            }
        }
    }
    let mut parser = Parser::new(source);
    let mut ops = parser.parse_alternation()?;
    if parser.pos != parser.chars.len() {
        return Err(parser.err("unexpected ')'"));
    }
    ops.push(RegexOp::Save(1));
    ops.push(RegexOp::Match);
    // Whole-match save slots occupy 0/1; group saves were emitted at (idx*2, idx*2+1).
    let mut full_ops = Vec::with_capacity(ops.len() + 1);
    full_ops.push(RegexOp::Save(0));
    full_ops.extend(relocate(&ops, 1));
    Ok(RegexProgram {
        source: Rc::from(source),
        flags: Rc::from(flags),
        ops: full_ops,
        group_count: parser.group_count,
        loop_count: parser.loop_count,
        group_names: parser.group_names,
        ignore_case,
        multiline,
        dot_all,
        global,
        sticky,
        unicode,
    })
}

pub(crate) fn class_matches(class: &CharClass, c: char, ignore_case: bool) -> bool {
    class.matches(c, ignore_case)
}
