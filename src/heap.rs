// File: src/heap.rs
//
// Memory-budget accounting for a single context: a running byte
// budget is decremented on each allocation and an uncatchable
// `MemoryLimitError` is raised on exhaustion. Object identity and lifetime
// are otherwise governed by ordinary `Rc` reference counting (see
// `value.rs`'s module comment for why `Rc` rather than a tracing GC is the
// appropriate contract here): the normative requirement is stable identity
// and outlasting closure cells, not any particular collection strategy.

use crate::errors::{EngineError, ErrorKind, SourceLocation};

/// Rough per-kind byte costs used for budget accounting. These are
/// approximations of heap footprint, not exact `size_of` measurements —
/// the budget is a cooperative safety valve, not a precise accountant.
pub mod cost {
    pub const OBJECT_BASE: usize = 64;
    pub const PROPERTY_SLOT: usize = 48;
    pub const ARRAY_ELEMENT: usize = 16;
    pub const STRING_BASE: usize = 24;
    pub const CLOSURE_CELL: usize = 32;
    pub const BYTECODE_BYTE: usize = 1;
}

/// Tracks bytes allocated against an optional ceiling. `None` means
/// unbounded, matching `Context`'s default.
pub struct Heap {
    limit: Option<usize>,
    used: usize,
}

impl Heap {
    pub fn new(limit: Option<usize>) -> Self {
        Self { limit, used: 0 }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Accounts for `bytes` of new allocation, raising an uncatchable
    /// `MemoryLimitError` if doing so would exceed the configured limit.
    pub fn charge(&mut self, bytes: usize) -> Result<(), EngineError> {
        if let Some(limit) = self.limit {
            if self.used.saturating_add(bytes) > limit {
                return Err(EngineError::new(
                    ErrorKind::MemoryLimitError,
                    format!(
                        "allocation of {} bytes would exceed the {} byte memory limit",
                        bytes, limit
                    ),
                    SourceLocation::unknown(),
                ));
            }
        }
        self.used += bytes;
        Ok(())
    }
}
