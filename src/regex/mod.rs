// File: src/regex/mod.rs
//
// The engine's own regex implementation (spec.md §4.4): a pattern compiler
// producing a small backtracking bytecode, and a matcher that executes it
// with the ReDoS mitigations spec.md calls for (bounded backtrack stack,
// zero-advance loop detection, cooperative polling). Kept independent of
// the `regex` crate the teacher depends on: a sandboxed engine can't let
// user-supplied patterns run against an unbounded matcher it doesn't
// control the internals of.

pub mod compiler;
pub mod matcher;

pub use compiler::{compile, RegexProgram};
pub use matcher::{MatchResult, Matcher};
