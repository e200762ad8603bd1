// File: src/regex/matcher.rs
//
// Backtracking executor for the bytecode `compiler.rs` produces (spec.md
// §4.4). An explicit, heap-allocated backtrack stack stands in for the
// native call stack a recursive backtracker would use, so a pathological
// pattern fails with `RegexStackOverflow` instead of blowing the real
// stack. Two further mitigations apply at every loop iteration and every
// few hundred instructions respectively: zero-advance loop detection (see
// `RegexOp::LoopSplit`) and a host poll callback for cooperative time-outs.

use super::compiler::{class_matches, RegexOp, RegexProgram};
use crate::errors::{EngineError, ErrorKind, SourceLocation};

const DEFAULT_MAX_BACKTRACK: usize = 10_000;
const POLL_INTERVAL: u64 = 100;

#[derive(Debug, Clone)]
pub struct MatchResult {
    /// `saves[0]`/`saves[1]` are the whole match's start/end; group `i`
    /// occupies `saves[2*i]`/`saves[2*i+1]`. Indices are Unicode scalar
    /// (`char`) offsets into the haystack, not code units.
    pub saves: Vec<Option<usize>>,
}

impl MatchResult {
    pub fn group(&self, i: usize) -> Option<(usize, usize)> {
        match (self.saves.get(i * 2).copied().flatten(), self.saves.get(i * 2 + 1).copied().flatten()) {
            (Some(a), Some(b)) => Some((a, b)),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct Frame {
    pc: usize,
    pos: usize,
    saves: Vec<Option<usize>>,
    loop_pos: Vec<Option<usize>>,
}

pub struct Matcher<'p> {
    program: &'p RegexProgram,
    pub max_backtrack: usize,
    pub poll_interval: u64,
}

impl<'p> Matcher<'p> {
    pub fn new(program: &'p RegexProgram) -> Self {
        Self { program, max_backtrack: DEFAULT_MAX_BACKTRACK, poll_interval: POLL_INTERVAL }
    }

    /// Tries to match starting exactly at `start` (used for the `y` sticky
    /// flag and as the inner primitive `find_from` calls at each offset).
    pub fn match_at(
        &self,
        input: &[char],
        start: usize,
        poll: &mut dyn FnMut() -> bool,
    ) -> Result<Option<MatchResult>, EngineError> {
        let mut pc = 0usize;
        let mut pos = start;
        let mut saves = vec![None; 2 * (self.program.group_count + 1)];
        let mut loop_pos = vec![None; self.program.loop_count];
        let mut backtrack: Vec<Frame> = Vec::new();
        let mut steps: u64 = 0;

        loop {
            steps += 1;
            if steps % self.poll_interval == 0 && poll() {
                return Err(EngineError::new(ErrorKind::RegexTimeout, "regex match aborted by host", SourceLocation::unknown()));
            }

            let outcome = self.exec_one(&self.program.ops[pc], input, pos, &mut saves, &mut loop_pos, &mut backtrack, pc);
            match outcome {
                ExecOutcome::Advance(next_pc, next_pos) => {
                    pc = next_pc;
                    pos = next_pos;
                }
                ExecOutcome::Matched => {
                    saves[1] = Some(pos);
                    return Ok(Some(MatchResult { saves }));
                }
                ExecOutcome::Fail => {
                    if backtrack.len() > self.max_backtrack {
                        return Err(EngineError::new(
                            ErrorKind::RegexStackOverflow,
                            "regex backtrack limit exceeded",
                            SourceLocation::unknown(),
                        ));
                    }
                    match backtrack.pop() {
                        None => return Ok(None),
                        Some(frame) => {
                            pc = frame.pc;
                            pos = frame.pos;
                            saves = frame.saves;
                            loop_pos = frame.loop_pos;
                        }
                    }
                }
                ExecOutcome::PushAndGo(frame, next_pc) => {
                    if backtrack.len() >= self.max_backtrack {
                        return Err(EngineError::new(
                            ErrorKind::RegexStackOverflow,
                            "regex backtrack limit exceeded",
                            SourceLocation::unknown(),
                        ));
                    }
                    backtrack.push(frame);
                    pc = next_pc;
                }
            }
        }
    }

    /// Searches for the first match at or after `from`, honouring the `y`
    /// sticky flag (only try `from` itself) vs ordinary search (try every
    /// offset up to the end of input).
    pub fn find_from(
        &self,
        input: &[char],
        from: usize,
        poll: &mut dyn FnMut() -> bool,
    ) -> Result<Option<MatchResult>, EngineError> {
        if self.program.sticky {
            return self.match_at(input, from, poll);
        }
        for start in from..=input.len() {
            if let Some(m) = self.match_at(input, start, poll)? {
                return Ok(Some(m));
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_one(
        &self,
        op: &RegexOp,
        input: &[char],
        pos: usize,
        saves: &mut Vec<Option<usize>>,
        loop_pos: &mut Vec<Option<usize>>,
        _backtrack: &mut [Frame],
        pc: usize,
    ) -> ExecOutcome {
        match op {
            RegexOp::Char(c) => {
                if pos < input.len() && chars_eq(input[pos], *c, self.program.ignore_case) {
                    ExecOutcome::Advance(pc + 1, pos + 1)
                } else {
                    ExecOutcome::Fail
                }
            }
            RegexOp::Any => {
                if pos < input.len() && (self.program.dot_all || input[pos] != '\n') {
                    ExecOutcome::Advance(pc + 1, pos + 1)
                } else {
                    ExecOutcome::Fail
                }
            }
            RegexOp::Class(class) => {
                if pos < input.len() && class_matches(class, input[pos], self.program.ignore_case) {
                    ExecOutcome::Advance(pc + 1, pos + 1)
                } else {
                    ExecOutcome::Fail
                }
            }
            RegexOp::StartAnchor => {
                let at_start = pos == 0 || (self.program.multiline && pos > 0 && input[pos - 1] == '\n');
                if at_start {
                    ExecOutcome::Advance(pc + 1, pos)
                } else {
                    ExecOutcome::Fail
                }
            }
            RegexOp::EndAnchor => {
                let at_end = pos == input.len() || (self.program.multiline && input[pos] == '\n');
                if at_end {
                    ExecOutcome::Advance(pc + 1, pos)
                } else {
                    ExecOutcome::Fail
                }
            }
            RegexOp::WordBoundary(want) => {
                let before = pos > 0 && is_word(input[pos - 1]);
                let after = pos < input.len() && is_word(input[pos]);
                if (before != after) == *want {
                    ExecOutcome::Advance(pc + 1, pos)
                } else {
                    ExecOutcome::Fail
                }
            }
            RegexOp::Save(i) => {
                saves[*i] = Some(pos);
                ExecOutcome::Advance(pc + 1, pos)
            }
            RegexOp::Jump(t) => ExecOutcome::Advance(*t, pos),
            RegexOp::Split(a, b) => {
                let frame = Frame { pc: *b, pos, saves: saves.clone(), loop_pos: loop_pos.clone() };
                ExecOutcome::PushAndGo(frame, *a)
            }
            RegexOp::LoopSplit(a, b, guard) => {
                if loop_pos[*guard] == Some(pos) {
                    ExecOutcome::Advance(*b, pos)
                } else {
                    loop_pos[*guard] = Some(pos);
                    let frame = Frame { pc: *b, pos, saves: saves.clone(), loop_pos: loop_pos.clone() };
                    ExecOutcome::PushAndGo(frame, *a)
                }
            }
            RegexOp::Backref(i) => match (saves.get(i * 2).copied().flatten(), saves.get(i * 2 + 1).copied().flatten()) {
                (Some(s), Some(e)) if e >= s => {
                    let len = e - s;
                    if pos + len > input.len() {
                        return ExecOutcome::Fail;
                    }
                    for k in 0..len {
                        if !chars_eq(input[pos + k], input[s + k], self.program.ignore_case) {
                            return ExecOutcome::Fail;
                        }
                    }
                    ExecOutcome::Advance(pc + 1, pos + len)
                }
                _ => ExecOutcome::Advance(pc + 1, pos), // unset group matches empty
            },
            RegexOp::LookAround { prog, negative, behind } => {
                let sub = RegexProgram {
                    source: self.program.source.clone(),
                    flags: self.program.flags.clone(),
                    ops: {
                        let mut v = (**prog).clone();
                        v.push(RegexOp::Match);
                        v
                    },
                    group_count: self.program.group_count,
                    loop_count: self.program.loop_count,
                    group_names: self.program.group_names.clone(),
                    ignore_case: self.program.ignore_case,
                    multiline: self.program.multiline,
                    dot_all: self.program.dot_all,
                    global: self.program.global,
                    sticky: true,
                    unicode: self.program.unicode,
                };
                let sub_matcher = Matcher::new(&sub);
                let found = if *behind {
                    // Fixed-width-agnostic but bounded: try every start <= pos
                    // whose match ends exactly at pos. Lookbehind bodies in
                    // practice are short, so this bounded scan is acceptable.
                    (0..=pos).rev().any(|s| {
                        matches!(sub_matcher.match_at(input, s, &mut |_| false), Ok(Some(m)) if m.saves[1] == Some(pos))
                    })
                } else {
                    matches!(sub_matcher.match_at(input, pos, &mut |_| false), Ok(Some(_)))
                };
                if found != *negative {
                    ExecOutcome::Advance(pc + 1, pos)
                } else {
                    ExecOutcome::Fail
                }
            }
            RegexOp::Match => ExecOutcome::Matched,
        }
    }
}

enum ExecOutcome {
    Advance(usize, usize),
    PushAndGo(Frame, usize),
    Matched,
    Fail,
}

fn chars_eq(a: char, b: char, ignore_case: bool) -> bool {
    if ignore_case {
        a.to_ascii_lowercase() == b.to_ascii_lowercase()
    } else {
        a == b
    }
}

fn is_word(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regex::compiler::compile;

    fn run(pattern: &str, flags: &str, text: &str) -> Option<MatchResult> {
        let prog = compile(pattern, flags).unwrap();
        let chars: Vec<char> = text.chars().collect();
        Matcher::new(&prog).find_from(&chars, 0, &mut |_| false).unwrap()
    }

    #[test]
    fn literal_match() {
        assert!(run("abc", "", "xxabcyy").is_some());
        assert!(run("abc", "", "xxabyy").is_none());
    }

    #[test]
    fn star_and_groups() {
        let m = run("(a+)(b*)", "", "aaab").unwrap();
        assert_eq!(m.group(1), Some((0, 3)));
        assert_eq!(m.group(2), Some((3, 4)));
    }

    #[test]
    fn alternation() {
        assert!(run("cat|dog", "", "I have a dog").is_some());
        assert!(run("cat|dog", "", "I have a fish").is_none());
    }

    #[test]
    fn zero_advance_star_of_star_terminates() {
        // (a*)* against a non-matching tail must not hang or overflow.
        let result = run("(a*)*b", "", "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaac");
        assert!(result.is_none());
    }

    #[test]
    fn backreference() {
        assert!(run(r"(\w+) \1", "", "hello hello").is_some());
        assert!(run(r"(\w+) \1", "", "hello world").is_none());
    }

    #[test]
    fn negative_lookahead() {
        assert!(run("foo(?!bar)", "", "foobaz").is_some());
        assert!(run("foo(?!bar)", "", "foobar").is_none());
    }

    #[test]
    fn backtrack_limit_raises_stack_overflow() {
        let prog = compile("(a*)(a*)(a*)(a*)b", "").unwrap();
        let text: Vec<char> = "a".repeat(50).chars().collect();
        let mut matcher = Matcher::new(&prog);
        matcher.max_backtrack = 5;
        let err = matcher.match_at(&text, 0, &mut |_| false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RegexStackOverflow);
    }
}
