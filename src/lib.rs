//! `ext-line-sort` sorts newline-delimited text files that don't fit in memory.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. Sorting is achieved in two passes. During the
//! first pass it sorts chunks of data that each fit in RAM, during the second pass it merges the sorted chunks
//! together. For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `ext-line-sort` supports the following features:
//!
//! * **Byte-wise ordering:**
//!   lines are opaque byte strings compared lexicographically, no encoding is assumed.
//! * **Memory limit support:**
//!   the input is split into runs whose estimated size (delimiters included) stays within the memory budget.
//! * **K-way merge:**
//!   all runs are merged at once by a binary heap merger holding one record per run in memory.
//! * **Multithreading support:**
//!   chunks are sorted in multiple threads utilizing maximum CPU resources.
//! * **Atomic output:**
//!   the output file appears only once it is completely written, temporary runs are removed
//!   whether sorting succeeds or fails.
//!
//! # Example
//!
//! ```no_run
//! use std::path;
//!
//! use log;
//!
//! use ext_line_sort::{ExternalSorter, ExternalSorterBuilder, MemoryLimitedBufferBuilder};
//!
//! fn main() {
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(path::Path::new("./"))
//!         .with_buffer(MemoryLimitedBufferBuilder::new(50 * 1024 * 1024))
//!         .build()
//!         .unwrap();
//!
//!     let report = sorter
//!         .sort_file(path::Path::new("input.txt"), path::Path::new("output.txt"))
//!         .unwrap();
//!
//!     log::info!("{} records sorted using {} runs", report.records, report.runs);
//! }
//! ```

pub mod buffer;
pub mod merger;
pub mod record;
pub mod run;
pub mod sort;

pub use buffer::{ChunkBuffer, ChunkBufferBuilder, LimitedBufferBuilder, MemoryLimitedBufferBuilder};
pub use merger::{BinaryHeapMerger, MergeCursor};
pub use record::{LineReader, LineWriter, Record};
pub use run::{LineRunFormat, RmpRunFormat, Run, RunCursor, RunFormat, RunId};
pub use sort::{ExternalSorter, ExternalSorterBuilder, MergeStrategy, SortError, SortReport, Stage};
