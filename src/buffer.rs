//! Limited buffer implementations.

use rayon;

use crate::record::Record;

/// Default memory budget of a chunk buffer (500 MiB).
pub const DEFAULT_MEMORY_BUDGET: u64 = 500 * 1024 * 1024;

/// Buffer builder.
pub trait ChunkBufferBuilder: Default {
    type Buffer: ChunkBuffer;

    /// Creates a new buffer.
    fn build(&self) -> Self::Buffer;

    /// Returns the largest record size (delimiter included) a buffer can accept,
    /// or [`None`] if records are not limited by size.
    fn record_limit(&self) -> Option<u64> {
        None
    }
}

/// Base limited buffer interface.
pub trait ChunkBuffer: rayon::slice::ParallelSliceMut<Record> + Send {
    /// Adds a new record to the buffer.
    fn push(&mut self, record: Record);

    /// Returns buffer length
    fn len(&self) -> usize;

    /// Returns estimated size of buffered records once written.
    fn mem_size(&self) -> u64;

    /// Checks if the buffer reached the limit.
    fn is_full(&self) -> bool;

    /// Returns the buffered records.
    fn as_slice(&self) -> &[Record];
}

pub struct LimitedBufferBuilder {
    buffer_limit: usize,
    preallocate: bool,
}

impl LimitedBufferBuilder {
    pub fn new(buffer_limit: usize, preallocate: bool) -> Self {
        LimitedBufferBuilder {
            buffer_limit,
            preallocate,
        }
    }
}

impl ChunkBufferBuilder for LimitedBufferBuilder {
    type Buffer = LimitedBuffer;

    fn build(&self) -> Self::Buffer {
        if self.preallocate {
            LimitedBuffer::with_capacity(self.buffer_limit)
        } else {
            LimitedBuffer::new(self.buffer_limit)
        }
    }
}

impl Default for LimitedBufferBuilder {
    fn default() -> Self {
        LimitedBufferBuilder {
            buffer_limit: usize::MAX,
            preallocate: false,
        }
    }
}

/// Buffer limited by records count.
pub struct LimitedBuffer {
    limit: usize,
    current_size: u64,
    inner: Vec<Record>,
}

impl LimitedBuffer {
    pub fn new(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            current_size: 0,
            inner: Vec::new(),
        }
    }

    pub fn with_capacity(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            current_size: 0,
            inner: Vec::with_capacity(limit),
        }
    }
}

impl ChunkBuffer for LimitedBuffer {
    fn push(&mut self, record: Record) {
        self.current_size += record.encoded_len();
        self.inner.push(record);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn mem_size(&self) -> u64 {
        self.current_size
    }

    fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }

    fn as_slice(&self) -> &[Record] {
        &self.inner
    }
}

impl rayon::slice::ParallelSliceMut<Record> for LimitedBuffer {
    fn as_parallel_slice_mut(&mut self) -> &mut [Record] {
        self.inner.as_mut_slice()
    }
}

pub struct MemoryLimitedBufferBuilder {
    buffer_limit: u64,
}

impl MemoryLimitedBufferBuilder {
    pub fn new(buffer_limit: u64) -> Self {
        MemoryLimitedBufferBuilder { buffer_limit }
    }
}

impl ChunkBufferBuilder for MemoryLimitedBufferBuilder {
    type Buffer = MemoryLimitedBuffer;

    fn build(&self) -> Self::Buffer {
        MemoryLimitedBuffer::new(self.buffer_limit)
    }

    fn record_limit(&self) -> Option<u64> {
        Some(self.buffer_limit)
    }
}

impl Default for MemoryLimitedBufferBuilder {
    fn default() -> Self {
        MemoryLimitedBufferBuilder {
            buffer_limit: DEFAULT_MEMORY_BUDGET,
        }
    }
}

/// Buffer limited by the estimated size of its records.
/// Every record accounts for its length plus the delimiter so the estimate never
/// falls below the size of the run written from the buffer.
pub struct MemoryLimitedBuffer {
    limit: u64,
    current_size: u64,
    inner: Vec<Record>,
}

impl MemoryLimitedBuffer {
    pub fn new(limit: u64) -> Self {
        MemoryLimitedBuffer {
            limit,
            current_size: 0,
            inner: Vec::new(),
        }
    }
}

impl ChunkBuffer for MemoryLimitedBuffer {
    fn push(&mut self, record: Record) {
        self.current_size += record.encoded_len();
        self.inner.push(record);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn mem_size(&self) -> u64 {
        self.current_size
    }

    fn is_full(&self) -> bool {
        self.current_size >= self.limit
    }

    fn as_slice(&self) -> &[Record] {
        &self.inner
    }
}

impl rayon::slice::ParallelSliceMut<Record> for MemoryLimitedBuffer {
    fn as_parallel_slice_mut(&mut self) -> &mut [Record] {
        self.inner.as_mut_slice()
    }
}
