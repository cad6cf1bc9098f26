//! Growable byte accumulator.
//!
//! Both the handshake collector and the frame assembler stage incoming bytes
//! in a `ByteBuffer`. Storage grows in fixed-size chunks rather than
//! byte-by-byte, and every buffer carries a hard upper bound so a peer cannot
//! make the server allocate without limit.
//!
//! Allocation uses `try_reserve_exact`, so running out of memory surfaces as
//! a `BufferError` for the owning connection instead of aborting the process.

use std::fmt;

/// Default growth increment for accumulators.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Error returned when an accumulator cannot grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Growing would exceed the configured maximum size.
    LimitExceeded {
        /// Configured maximum.
        limit: usize,
        /// Size that was asked for.
        requested: usize,
    },
    /// The allocator refused the request.
    AllocFailed {
        /// Size that was asked for.
        requested: usize,
    },
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::LimitExceeded { limit, requested } => {
                write!(f, "buffer limit exceeded: {requested} > {limit}")
            }
            BufferError::AllocFailed { requested } => {
                write!(f, "allocation of {requested} bytes failed")
            }
        }
    }
}

impl std::error::Error for BufferError {}

/// Append-only byte buffer with chunked growth and a hard limit.
#[derive(Debug)]
pub struct ByteBuffer {
    /// Written bytes. `data.len()` is the write index.
    data: Vec<u8>,
    /// Logical capacity, always a multiple of `chunk_size` or equal to `limit`.
    capacity: usize,
    chunk_size: usize,
    limit: usize,
}

impl ByteBuffer {
    /// Create an empty buffer. Nothing is allocated until the first write.
    pub fn new(chunk_size: usize, limit: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity: 0,
            chunk_size: chunk_size.max(1),
            limit,
        }
    }

    /// Ensure at least `needed` bytes of capacity.
    ///
    /// Capacity is rounded up to the next chunk boundary (clamped to the
    /// limit) and never shrinks.
    pub fn capacity_for(&mut self, needed: usize) -> Result<(), BufferError> {
        if needed <= self.capacity {
            return Ok(());
        }
        if needed > self.limit {
            return Err(BufferError::LimitExceeded {
                limit: self.limit,
                requested: needed,
            });
        }

        let target = needed
            .div_ceil(self.chunk_size)
            .saturating_mul(self.chunk_size)
            .min(self.limit)
            .max(needed);

        self.data
            .try_reserve_exact(target - self.data.len())
            .map_err(|_| BufferError::AllocFailed { requested: target })?;
        self.capacity = target;
        Ok(())
    }

    /// Append bytes, growing as needed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let needed = self
            .data
            .len()
            .checked_add(bytes.len())
            .ok_or(BufferError::LimitExceeded {
                limit: self.limit,
                requested: usize::MAX,
            })?;
        self.capacity_for(needed)?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append a single byte.
    pub fn push(&mut self, byte: u8) -> Result<(), BufferError> {
        self.capacity_for(self.data.len() + 1)?;
        self.data.push(byte);
        Ok(())
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Logical capacity (bytes that fit without another chunk).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Growth increment.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Maximum size this buffer may grow to.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes still available before the limit is hit.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.data.len())
    }

    /// All written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// All written bytes, mutably (used for in-place unmasking).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Drop all contents and release the allocation.
    pub fn clear(&mut self) {
        self.data = Vec::new();
        self.capacity = 0;
    }
}
