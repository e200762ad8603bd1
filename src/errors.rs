// File: src/errors.rs
//
// Error handling and reporting for the sandboxed script engine.
// Provides structured error types with source location information
// and pretty-printed error messages for the embedder and the REPL.

use colored::Colorize;
use std::fmt;

/// A (line, column) pair, 1-based, recorded at the point a token, opcode, or
/// thrown value originates. Columns are code-unit counts from the start of
/// the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    pub fn unknown() -> Self {
        Self { line: 0, column: 0 }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// The error kinds the engine can raise. Kinds are grouped by who raises them
/// and whether user `try`/`catch` can observe them; see [`EngineError::catchable`].
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Raised by the lexer or compiler; never catchable, surfaced to the embedder.
    SyntaxError,
    /// Raised by VM builtin operations.
    TypeError,
    /// Raised on read of an undeclared global in strict mode.
    ReferenceError,
    /// Raised on out-of-range numeric/array operations.
    RangeError,
    /// A value `throw`n by user code. Carries the thrown [`crate::value::Value`]
    /// through the VM, not through this type (see [`crate::vm::Thrown`]).
    UserThrown,
    /// Raised by the regex compiler on an invalid pattern.
    RegexError,
    /// Raised by the regex matcher when the backtrack stack limit is exceeded.
    RegexStackOverflow,
    /// Raised by the regex matcher when the poll callback aborts a match.
    RegexTimeout,
    /// Raised by the heap allocator when the memory budget is exhausted.
    MemoryLimitError,
    /// Raised by the VM or regex matcher when the time budget is exhausted.
    TimeLimitError,
}

impl ErrorKind {
    /// Whether user `try`/`catch`/`finally` can intercept an error of this kind.
    /// `UserThrown` values are always
    /// catchable but travel through the VM as `vm::Thrown`, not this type;
    /// it's listed here only so a caught-and-rethrown `EngineError` round-trips.
    pub fn catchable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TypeError | ErrorKind::ReferenceError | ErrorKind::RangeError | ErrorKind::UserThrown
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::UserThrown => "Error",
            ErrorKind::RegexError => "RegexError",
            ErrorKind::RegexStackOverflow => "RegexStackOverflow",
            ErrorKind::RegexTimeout => "RegexTimeout",
            ErrorKind::MemoryLimitError => "MemoryLimitError",
            ErrorKind::TimeLimitError => "TimeLimitError",
        };
        write!(f, "{}", s)
    }
}

/// A structured, embedder-facing error with source location and optional
/// pretty-printing context. This is what `Context::eval` returns on failure
/// for every kind except a caught-then-rethrown user value, which is carried
/// as a `Value` instead (see `crate::context::EvalError`).
#[derive(Debug, Clone)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
    pub source_line: Option<String>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, location: SourceLocation) -> Self {
        Self { kind, message: message.into(), location, source_line: None }
    }

    pub fn with_source_line(mut self, line: impl Into<String>) -> Self {
        self.source_line = Some(line.into());
        self
    }

    pub fn syntax(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(ErrorKind::SyntaxError, message, location)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message, SourceLocation::unknown())
    }

    pub fn reference_error(name: &str) -> Self {
        Self::new(
            ErrorKind::ReferenceError,
            format!("{} is not defined", name),
            SourceLocation::unknown(),
        )
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RangeError, message, SourceLocation::unknown())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}: {}", self.kind.to_string().red().bold(), self.message.bold())?;
        if self.location != SourceLocation::unknown() {
            writeln!(f, "{}", format!("  --> {}", self.location).bright_blue())?;
        }
        if let Some(ref src) = self.source_line {
            let col = self.location.column as usize;
            writeln!(f, "   {}", "|".bright_blue())?;
            writeln!(
                f,
                "{} {} {}",
                format!("{:3}", self.location.line).bright_blue(),
                "|".bright_blue(),
                src
            )?;
            writeln!(f, "   {} {}{}", "|".bright_blue(), " ".repeat(col.saturating_sub(1)), "^".red().bold())?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}
