//! Sorted runs: writing them to disk and streaming them back.

use std::fmt;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use log;

use crate::merger::MergeCursor;
use crate::record::{self, Record};
use crate::sort::SortError;

/// Run identifier. Issued by the sorting job in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{:06}", self.0)
    }
}

/// Run file format interface. Provides methods for dumping sorted records to a run file
/// and reading them back one by one.
pub trait RunFormat: Default + Sync {
    /// Run file name extension.
    fn extension(&self) -> &'static str;

    /// Dumps records to a run file.
    fn dump(&self, writer: &mut dyn Write, records: &[Record]) -> io::Result<()>;

    /// Loads the next record from a run file. Returns [`None`] at the end of the file.
    fn load(&self, reader: &mut dyn BufRead) -> io::Result<Option<Record>>;

    /// Checks if run files are byte-identical to the sorted output,
    /// so a single run may be moved to the output as is.
    fn matches_output(&self) -> bool {
        false
    }
}

/// Newline-delimited run format, the same framing as the sorted output.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineRunFormat;

impl RunFormat for LineRunFormat {
    fn extension(&self) -> &'static str {
        "lines"
    }

    fn dump(&self, writer: &mut dyn Write, records: &[Record]) -> io::Result<()> {
        for item in records {
            record::write_record(writer, item)?;
        }

        return Ok(());
    }

    fn load(&self, reader: &mut dyn BufRead) -> io::Result<Option<Record>> {
        record::read_record(reader)
    }

    fn matches_output(&self) -> bool {
        true
    }
}

/// RMP (Rust MessagePack) run format.
/// Every record is stored as a MessagePack `bin` value.
/// For more information see https://msgpack.org/.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmpRunFormat;

impl RunFormat for RmpRunFormat {
    fn extension(&self) -> &'static str {
        "rmp"
    }

    fn dump(&self, mut writer: &mut dyn Write, records: &[Record]) -> io::Result<()> {
        for item in records {
            rmp_serde::encode::write(&mut writer, item)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        }

        return Ok(());
    }

    fn load(&self, reader: &mut dyn BufRead) -> io::Result<Option<Record>> {
        if reader.fill_buf()?.is_empty() {
            return Ok(None);
        }

        match rmp_serde::decode::from_read(reader) {
            Ok(record) => Ok(Some(record)),
            Err(err) => Err(io::Error::new(io::ErrorKind::InvalidData, err)),
        }
    }
}

/// Sorted run persisted on disk.
/// A run is immutable once written and is only handed out after it was durably stored.
#[derive(Debug)]
pub struct Run {
    id: RunId,
    path: PathBuf,
    records: u64,
    bytes: u64,
}

impl Run {
    /// Writes sorted records to a new run file in `dir`.
    /// The file is flushed and synced before the run is returned. On failure the partially
    /// written file is removed.
    ///
    /// # Arguments
    /// * `dir` - Directory the run file is created in
    /// * `id` - Run identifier, determines the file name
    /// * `records` - Records sorted in ascending order
    /// * `format` - Run file format
    /// * `buf_size` - Write buffer size
    pub fn write<F: RunFormat>(
        dir: &Path,
        id: RunId,
        records: &[Record],
        format: &F,
        buf_size: Option<usize>,
    ) -> Result<Run, SortError> {
        let path = dir.join(format!("{}.{}", id, format.extension()));

        let file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) => return Err(SortError::RunWrite(path, err)),
        };

        match Self::write_file(file, records, format, buf_size) {
            Ok(bytes) => {
                log::debug!("{} saved ({} records, {} bytes)", id, records.len(), bytes);
                Ok(Run {
                    id,
                    path,
                    records: records.len() as u64,
                    bytes,
                })
            }
            Err(err) => {
                if let Err(rm_err) = fs::remove_file(&path) {
                    if rm_err.kind() != io::ErrorKind::NotFound {
                        log::warn!("partial run {} not removed: {}", path.display(), rm_err);
                    }
                }
                Err(SortError::RunWrite(path, err))
            }
        }
    }

    fn write_file<F: RunFormat>(
        file: fs::File,
        records: &[Record],
        format: &F,
        buf_size: Option<usize>,
    ) -> io::Result<u64> {
        let mut run_writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        format.dump(&mut run_writer, records)?;

        let file = run_writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;

        return Ok(file.metadata()?.len());
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the run.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Run file size in bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Streaming read position over a run.
/// Holds at most one buffered record: the current one, or nothing once the run is exhausted.
pub struct RunCursor<'f, F: RunFormat> {
    run: Run,
    reader: io::BufReader<fs::File>,
    format: &'f F,
    current: Option<Record>,
}

impl<'f, F: RunFormat> RunCursor<'f, F> {
    /// Opens a run and buffers its first record.
    pub fn open(run: Run, format: &'f F, buf_size: Option<usize>) -> Result<Self, SortError> {
        let file = match fs::File::open(&run.path) {
            Ok(file) => file,
            Err(err) => return Err(SortError::RunRead(run.path, err)),
        };

        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        let mut cursor = RunCursor {
            run,
            reader,
            format,
            current: None,
        };
        cursor.current = cursor.load()?;

        return Ok(cursor);
    }

    fn load(&mut self) -> Result<Option<Record>, SortError> {
        self.format
            .load(&mut self.reader)
            .map_err(|err| SortError::RunRead(self.run.path.clone(), err))
    }

    /// Returns the current record or [`None`] if the run is exhausted.
    pub fn peek(&self) -> Option<&Record> {
        self.current.as_ref()
    }

    /// Returns the current record and buffers the following one.
    /// Advancing an exhausted cursor returns [`None`].
    pub fn advance(&mut self) -> Result<Option<Record>, SortError> {
        if self.current.is_none() {
            return Ok(None);
        }

        let next = self.load()?;
        return Ok(std::mem::replace(&mut self.current, next));
    }

    pub fn is_exhausted(&self) -> bool {
        self.current.is_none()
    }
}

impl<'f, F: RunFormat> MergeCursor for RunCursor<'f, F> {
    type Item = Record;
    type Error = SortError;

    fn id(&self) -> RunId {
        self.run.id
    }

    fn peek(&self) -> Option<&Record> {
        RunCursor::peek(self)
    }

    fn advance(&mut self) -> Result<Option<Record>, SortError> {
        RunCursor::advance(self)
    }
}
