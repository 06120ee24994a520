//! Per-exchange bump arena.
//!
//! Every allocation made while processing one exchange is carved out of a
//! single preallocated region and invalidated as a batch by [`Arena::reset`].
//! Allocations are addressed by [`Span`] handles rather than references so the
//! arena can be reset without fighting outstanding borrows; a span taken before
//! a reset no longer resolves afterwards.

use crate::error::ArenaError;

/// Default block size used to size worker arenas
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Handle to an allocation inside an [`Arena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    start: u32,
    len: u32,
    generation: u32,
}

impl Span {
    /// Length of the allocation in bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the allocation is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Bump allocator reset as a unit at the end of each exchange
pub struct Arena {
    buf: Vec<u8>,
    used: usize,
    peak: usize,
    generation: u32,
}

impl Arena {
    /// Create an arena with a fixed capacity in bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            used: 0,
            peak: 0,
            generation: 0,
        }
    }

    /// Create the per-worker arena (16 default blocks)
    pub fn for_worker() -> Self {
        Self::with_capacity(16 * DEFAULT_BLOCK_SIZE)
    }

    /// Allocate `len` zeroed bytes
    pub fn alloc(&mut self, len: usize) -> Result<Span, ArenaError> {
        let available = self.buf.len() - self.used;
        if len > available {
            return Err(ArenaError::Exhausted {
                requested: len,
                available,
            });
        }

        let start = self.used;
        self.buf[start..start + len].fill(0);
        self.used += len;
        self.peak = self.peak.max(self.used);

        Ok(Span {
            start: start as u32,
            len: len as u32,
            generation: self.generation,
        })
    }

    /// Allocate a copy of `bytes`
    pub fn copy(&mut self, bytes: &[u8]) -> Result<Span, ArenaError> {
        let span = self.alloc(bytes.len())?;
        let start = span.start as usize;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(span)
    }

    /// Resolve a span allocated since the last reset
    pub fn get(&self, span: Span) -> Option<&[u8]> {
        if span.generation != self.generation {
            return None;
        }
        let start = span.start as usize;
        self.buf.get(start..start + span.len as usize)
    }

    /// Resolve a span for writing
    pub fn get_mut(&mut self, span: Span) -> Option<&mut [u8]> {
        if span.generation != self.generation {
            return None;
        }
        let start = span.start as usize;
        self.buf.get_mut(start..start + span.len as usize)
    }

    /// Release every allocation at once
    pub fn reset(&mut self) {
        self.used = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Bytes currently allocated
    pub fn used(&self) -> usize {
        self.used
    }

    /// Highest number of bytes ever allocated between resets
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Total capacity
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}
