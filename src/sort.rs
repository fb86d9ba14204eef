//! External sorter.

use log;
use rayon::slice::ParallelSliceMut;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use crate::merger::BinaryHeapMerger;
use crate::record::{LineReader, LineWriter, Record};
use crate::run::{LineRunFormat, Run, RunCursor, RunFormat, RunId};
use crate::{ChunkBuffer, ChunkBufferBuilder, MemoryLimitedBufferBuilder};

/// Sorting stage an error occurred at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Sorter or job initialization.
    Setup,
    /// Reading the input stream.
    Input,
    /// Writing a sorted run.
    RunWrite,
    /// Reading a sorted run back during the merge.
    RunRead,
    /// Writing or publishing the output.
    Output,
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Setup => write!(f, "setup"),
            Stage::Input => write!(f, "input"),
            Stage::RunWrite => write!(f, "run write"),
            Stage::RunRead => write!(f, "run read"),
            Stage::Output => write!(f, "output"),
        }
    }
}

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Input data stream error.
    InputError(io::Error),
    /// Run file writing error.
    RunWrite(PathBuf, io::Error),
    /// Run file reading error.
    RunRead(PathBuf, io::Error),
    /// Output file writing or publishing error.
    OutputError(PathBuf, io::Error),
    /// A single record exceeds the memory budget.
    RecordTooLarge { limit: u64 },
}

impl SortError {
    /// Returns the stage the error occurred at.
    pub fn stage(&self) -> Stage {
        match self {
            SortError::TempDir(_) | SortError::ThreadPoolBuildError(_) => Stage::Setup,
            SortError::InputError(_) | SortError::RecordTooLarge { .. } => Stage::Input,
            SortError::RunWrite(..) => Stage::RunWrite,
            SortError::RunRead(..) => Stage::RunRead,
            SortError::OutputError(..) => Stage::Output,
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::InputError(err) => Some(err),
            SortError::RunWrite(_, err) => Some(err),
            SortError::RunRead(_, err) => Some(err),
            SortError::OutputError(_, err) => Some(err),
            SortError::RecordTooLarge { .. } => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::InputError(err) => write!(f, "input data stream error: {}", err),
            SortError::RunWrite(path, err) => write!(f, "run {} not saved: {}", path.display(), err),
            SortError::RunRead(path, err) => write!(f, "run {} not read: {}", path.display(), err),
            SortError::OutputError(path, err) => write!(f, "output {} not written: {}", path.display(), err),
            SortError::RecordTooLarge { limit } => write!(f, "record exceeds memory budget of {} bytes", limit),
        }
    }
}

/// The way sorted runs were turned into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// No runs, the output is empty.
    Empty,
    /// The only run became the output.
    SingleRun,
    /// Runs were merged by the k-way merger.
    KWay,
}

/// Summary of a finished sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortReport {
    /// Number of sorted records.
    pub records: u64,
    /// Output size in bytes.
    pub bytes: u64,
    /// Number of runs the input was split into.
    pub runs: usize,
    /// How runs were turned into the output.
    pub strategy: MergeStrategy,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
pub struct ExternalSorterBuilder<B = MemoryLimitedBufferBuilder, F = LineRunFormat>
where
    B: ChunkBufferBuilder,
    F: RunFormat,
{
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Run and output file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Chunk buffer builder.
    buffer_builder: B,
    /// Run file format.
    run_format: F,
}

impl<B, F> ExternalSorterBuilder<B, F>
where
    B: ChunkBufferBuilder,
    F: RunFormat,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<B, F>, SortError> {
        ExternalSorter::new(
            self.threads_number,
            self.tmp_dir.as_deref(),
            self.buffer_builder,
            self.run_format,
            self.rw_buf_size,
        )
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<B, F> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<B, F> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets buffer builder.
    pub fn with_buffer(mut self, buffer_builder: B) -> ExternalSorterBuilder<B, F> {
        self.buffer_builder = buffer_builder;
        return self;
    }

    /// Sets run file format.
    pub fn with_run_format(mut self, run_format: F) -> ExternalSorterBuilder<B, F> {
        self.run_format = run_format;
        return self;
    }

    /// Sets run and output file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<B, F> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }
}

impl<B, F> Default for ExternalSorterBuilder<B, F>
where
    B: ChunkBufferBuilder,
    F: RunFormat,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            buffer_builder: B::default(),
            run_format: F::default(),
        }
    }
}

/// State of a single sort invocation.
/// Owns a private temporary directory holding the runs. Dropping the job removes the
/// directory with everything left in it.
struct Job {
    tmp_dir: tempfile::TempDir,
    next_run_id: u64,
    runs: Vec<Run>,
    records: u64,
}

impl Job {
    fn new(tmp_path: Option<&Path>) -> Result<Self, SortError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ext-line-sort-");

        let tmp_dir = match tmp_path {
            Some(tmp_path) => builder.tempdir_in(tmp_path),
            None => builder.tempdir(),
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::debug!("job directory {} created", tmp_dir.path().display());

        return Ok(Job {
            tmp_dir,
            next_run_id: 0,
            runs: Vec::new(),
            records: 0,
        });
    }

    fn dir(&self) -> &Path {
        self.tmp_dir.path()
    }

    fn issue_run_id(&mut self) -> RunId {
        let id = RunId(self.next_run_id);
        self.next_run_id += 1;
        return id;
    }

    fn register(&mut self, run: Run) {
        self.records += run.records();
        self.runs.push(run);
    }

    /// Removes the job directory with all remaining runs.
    fn close(self) {
        let path = self.tmp_dir.path().to_path_buf();
        if let Err(err) = self.tmp_dir.close() {
            log::warn!("temporary directory {} not removed: {}", path.display(), err);
        }
    }
}

/// External sorter.
pub struct ExternalSorter<B = MemoryLimitedBufferBuilder, F = LineRunFormat>
where
    B: ChunkBufferBuilder,
    F: RunFormat,
{
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Chunk buffer builder.
    buffer_builder: B,
    /// Run file format.
    run_format: F,
    /// Run and output file read/write buffer size.
    rw_buf_size: Option<usize>,
}

impl<B, F> ExternalSorter<B, F>
where
    B: ChunkBufferBuilder,
    F: RunFormat,
{
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `tmp_path` - Directory to be used to store temporary data. If paramater is [`None`] default OS temporary
    ///   directory will be used.
    /// * `buffer_builder` - An instance of a buffer builder that will be used for chunk buffer creation.
    /// * `run_format` - Run file format.
    /// * `rw_buf_size` - Run and output files read/write buffer size.
    pub fn new(
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        buffer_builder: B,
        run_format: F,
        rw_buf_size: Option<usize>,
    ) -> Result<Self, SortError> {
        if let Some(tmp_path) = tmp_path {
            log::info!("using {} as a temporary directory", tmp_path.display());
        }

        return Ok(ExternalSorter {
            rw_buf_size,
            buffer_builder,
            run_format,
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: tmp_path.map(Into::into),
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    /// Sorts lines of the input file and writes them to the output file.
    ///
    /// # Arguments
    /// * `input` - File to be sorted
    /// * `output` - Result file, replaced atomically once sorting succeeded
    pub fn sort_file(&self, input: &Path, output: &Path) -> Result<SortReport, SortError> {
        let file = fs::File::open(input).map_err(|err| SortError::InputError(err))?;
        let reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return self.sort(reader, output);
    }

    /// Sorts lines of the input stream and writes them to the output file.
    /// The output appears only if sorting succeeded; on failure all temporary data is removed
    /// and the output is left untouched.
    ///
    /// # Arguments
    /// * `input` - Input stream of newline-delimited records
    /// * `output` - Result file
    pub fn sort<R: BufRead>(&self, input: R, output: &Path) -> Result<SortReport, SortError> {
        let mut job = Job::new(self.tmp_dir.as_deref())?;

        let result = self
            .produce_runs(&mut job, LineReader::with_limit(input, self.buffer_builder.record_limit()))
            .and_then(|_| self.merge_runs(&mut job, output));

        match &result {
            Ok(report) => log::info!(
                "sorting done ({} records, {} bytes, {} runs)",
                report.records,
                report.bytes,
                report.runs
            ),
            Err(err) => log::error!("sorting failed at {} stage: {}", err.stage(), err),
        }

        job.close();

        return result;
    }

    fn produce_runs<I>(&self, job: &mut Job, input: I) -> Result<(), SortError>
    where
        I: IntoIterator<Item = Result<Record, SortError>>,
    {
        let record_limit = self.buffer_builder.record_limit();
        let mut chunk_buf = self.buffer_builder.build();

        for item in input.into_iter() {
            chunk_buf.push(item?);

            if chunk_buf.is_full() {
                self.create_run(job, chunk_buf, record_limit)?;
                chunk_buf = self.buffer_builder.build();
            }
        }

        if chunk_buf.len() > 0 {
            self.create_run(job, chunk_buf, record_limit)?;
        }

        log::debug!("external sort preparation done ({} runs)", job.runs.len());

        return Ok(());
    }

    fn create_run(&self, job: &mut Job, mut buffer: B::Buffer, record_limit: Option<u64>) -> Result<(), SortError> {
        if let Some(limit) = record_limit {
            if buffer.mem_size() > limit {
                log::debug!(
                    "chunk exceeds memory budget by {} bytes, saving it anyway",
                    buffer.mem_size() - limit
                );
            }
        }

        log::debug!("sorting chunk data ({} records) ...", buffer.len());
        self.thread_pool.install(|| {
            buffer.par_sort_unstable();
        });

        let id = job.issue_run_id();
        log::debug!("saving chunk data as {}", id);
        let run = Run::write(job.dir(), id, buffer.as_slice(), &self.run_format, self.rw_buf_size)?;
        job.register(run);

        return Ok(());
    }

    fn merge_runs(&self, job: &mut Job, output: &Path) -> Result<SortReport, SortError> {
        let mut runs = std::mem::take(&mut job.runs);
        let runs_number = runs.len();

        let (strategy, bytes) = match runs_number {
            0 => {
                log::info!("input is empty");
                self.publish(output, |_| Ok(()))?;
                (MergeStrategy::Empty, 0)
            }
            1 => {
                let run = runs.remove(0);
                log::info!("single run, moving {} to the output", run.id());
                (MergeStrategy::SingleRun, self.publish_run(run, output)?)
            }
            _ => {
                log::info!("merging {} runs", runs_number);
                let mut cursors = Vec::with_capacity(runs_number);
                for run in runs {
                    cursors.push(RunCursor::open(run, &self.run_format, self.rw_buf_size)?);
                }
                let merger = BinaryHeapMerger::new(cursors);

                let bytes = self.publish(output, |writer| {
                    for record in merger {
                        writer.write(&record?).map_err(|err| SortError::OutputError(output.into(), err))?;
                    }
                    Ok(())
                })?;
                (MergeStrategy::KWay, bytes)
            }
        };

        return Ok(SortReport {
            records: job.records,
            bytes,
            runs: runs_number,
            strategy,
        });
    }

    /// Moves a run to the output location. Falls back to copying if the run can't be renamed,
    /// for example when the temporary directory is on another file system.
    fn publish_run(&self, run: Run, output: &Path) -> Result<u64, SortError> {
        if self.run_format.matches_output() {
            let permissions =
                output_permissions(output, run.path()).map_err(|err| SortError::OutputError(output.into(), err))?;
            fs::set_permissions(run.path(), permissions).map_err(|err| SortError::OutputError(output.into(), err))?;

            match fs::rename(run.path(), output) {
                Ok(()) => return Ok(run.bytes()),
                Err(err) => log::debug!("{} not renamed ({}), copying it", run.id(), err),
            }
        }

        let mut cursor = RunCursor::open(run, &self.run_format, self.rw_buf_size)?;
        return self.publish(output, |writer| {
            while let Some(record) = cursor.advance()? {
                writer.write(&record).map_err(|err| SortError::OutputError(output.into(), err))?;
            }
            Ok(())
        });
    }

    /// Writes the output to a temporary file next to the output path and atomically
    /// moves it to the output path once it is completely written and synced.
    /// Returns the number of written bytes.
    fn publish<W>(&self, output: &Path, write: W) -> Result<u64, SortError>
    where
        W: FnOnce(&mut LineWriter<io::BufWriter<tempfile::NamedTempFile>>) -> Result<(), SortError>,
    {
        let output_err = |err: io::Error| SortError::OutputError(output.into(), err);

        let dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let staged = tempfile::Builder::new()
            .prefix(".ext-line-sort-")
            .tempfile_in(dir)
            .map_err(output_err)?;

        let buf_writer = match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, staged),
            None => io::BufWriter::new(staged),
        };
        let mut writer = LineWriter::new(buf_writer);

        write(&mut writer)?;

        let bytes = writer.bytes();
        let staged = writer
            .finish()
            .map_err(output_err)?
            .into_inner()
            .map_err(|err| output_err(err.into_error()))?;
        staged.as_file().sync_all().map_err(output_err)?;

        let permissions = output_permissions(output, staged.path()).map_err(output_err)?;
        staged.as_file().set_permissions(permissions).map_err(output_err)?;
        staged.persist(output).map_err(|err| output_err(err.error))?;

        return Ok(bytes);
    }
}

/// Mode of a newly created output file.
#[cfg(unix)]
const OUTPUT_MODE: u32 = 0o644;

/// Returns the permissions a file replacing `output` must carry: those of the existing output,
/// or the regular file mode if there is no output yet. Permissions of `file` are the base on
/// platforms without unix modes.
fn output_permissions(output: &Path, file: &Path) -> io::Result<fs::Permissions> {
    match fs::metadata(output) {
        Ok(metadata) => Ok(metadata.permissions()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            #[cfg_attr(not(unix), allow(unused_mut))]
            let mut permissions = fs::metadata(file)?.permissions();
            #[cfg(unix)]
            std::os::unix::fs::PermissionsExt::set_mode(&mut permissions, OUTPUT_MODE);
            Ok(permissions)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::{self, prelude::*};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder, MergeStrategy, SortError, SortReport, Stage};
    use crate::record::{self, Record};
    use crate::run::{LineRunFormat, RmpRunFormat, RunFormat};
    use crate::{LimitedBufferBuilder, MemoryLimitedBufferBuilder};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn lines(content: &[u8]) -> Vec<Vec<u8>> {
        Vec::from_iter(content.split_inclusive(|b| *b == b'\n').map(|line| line.to_vec()))
    }

    fn dir_entries(path: &Path) -> Vec<PathBuf> {
        Vec::from_iter(fs::read_dir(path).unwrap().map(|entry| entry.unwrap().path()))
    }

    fn sorter(tmp_dir: &Path, budget: u64) -> ExternalSorter {
        ExternalSorterBuilder::new()
            .with_buffer(MemoryLimitedBufferBuilder::new(budget))
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir)
            .build()
            .unwrap()
    }

    #[rstest]
    fn test_example_runs(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output.txt");
        let runs_dir = tmp_dir.path().join("runs");
        fs::create_dir(&runs_dir).unwrap();

        // 13 bytes hold two of the records together with their delimiters
        let report = sorter(&runs_dir, 13)
            .sort(&b"banana\napple\ncherry\napple\n"[..], &output)
            .unwrap();

        assert_eq!(report.runs, 2);
        assert_eq!(report.records, 4);
        assert_eq!(report.bytes, 26);
        assert_eq!(report.strategy, MergeStrategy::KWay);
        assert_eq!(fs::read(&output).unwrap(), b"apple\napple\nbanana\ncherry\n");
        assert!(dir_entries(&runs_dir).is_empty());
    }

    fn sort_with<F: RunFormat>(tmp_dir: &Path, budget: u64, run_format: F, input: &[u8], output: &Path) -> SortReport {
        let sorter: ExternalSorter<MemoryLimitedBufferBuilder, F> = ExternalSorterBuilder::new()
            .with_buffer(MemoryLimitedBufferBuilder::new(budget))
            .with_run_format(run_format)
            .with_tmp_dir(tmp_dir)
            .with_rw_buf_size(128)
            .build()
            .unwrap();

        sorter.sort(input, output).unwrap()
    }

    #[rstest]
    #[case(false, 64)]
    #[case(false, 1024)]
    #[case(true, 64)]
    #[case(true, 1 << 20)]
    fn test_external_sorter(tmp_dir: tempfile::TempDir, #[case] rmp: bool, #[case] budget: u64) {
        let input_sorted = Vec::from_iter((0..500).map(|i| format!("line-{:05}\n", i % 250).into_bytes()));

        let mut input_shuffled = input_sorted.clone();
        input_shuffled.shuffle(&mut rand::thread_rng());
        let input = input_shuffled.concat();

        let output = tmp_dir.path().join("output.txt");
        let report = if rmp {
            sort_with(tmp_dir.path(), budget, RmpRunFormat, &input, &output)
        } else {
            sort_with(tmp_dir.path(), budget, LineRunFormat, &input, &output)
        };

        let mut expected = input_sorted.clone();
        expected.sort();
        assert_eq!(report.records, 500);
        assert_eq!(lines(&fs::read(&output).unwrap()), expected);
        assert_eq!(dir_entries(tmp_dir.path()), vec![output]);
    }

    #[rstest]
    fn test_sorted_input_is_unchanged(tmp_dir: tempfile::TempDir) {
        let input = tmp_dir.path().join("input.txt");
        let output = tmp_dir.path().join("output.txt");
        let content = b"\n\nA\na\na\nab\nb\nbanana\n\xff\n".to_vec();
        fs::write(&input, &content).unwrap();

        let report = sorter(tmp_dir.path(), 8).sort_file(&input, &output).unwrap();

        assert!(report.runs > 1);
        assert_eq!(fs::read(&output).unwrap(), content);
    }

    #[rstest]
    fn test_single_run_shortcut(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output.txt");
        let input = b"pear\nfig\napple\nfig";

        let report = sorter(tmp_dir.path(), 1024).sort(&input[..], &output).unwrap();

        let mut expected = Vec::from_iter(input.split(|b| *b == b'\n'));
        expected.sort();
        let expected = expected.join(&b'\n');

        assert_eq!(report.runs, 1);
        assert_eq!(report.strategy, MergeStrategy::SingleRun);
        assert_eq!(fs::read(&output).unwrap(), [expected, b"\n".to_vec()].concat());
        assert_eq!(dir_entries(tmp_dir.path()), vec![output]);
    }

    #[rstest]
    fn test_single_run_in_rmp_format_is_decoded(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output.txt");

        let sorter: ExternalSorter<MemoryLimitedBufferBuilder, RmpRunFormat> = ExternalSorterBuilder::new()
            .with_run_format(RmpRunFormat)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let report = sorter.sort(&b"b\na\n"[..], &output).unwrap();

        assert_eq!(report.strategy, MergeStrategy::SingleRun);
        assert_eq!(fs::read(&output).unwrap(), b"a\nb\n");
    }

    #[rstest]
    fn test_empty_input(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output.txt");

        let report = sorter(tmp_dir.path(), 16).sort(io::empty(), &output).unwrap();

        assert_eq!(report.runs, 0);
        assert_eq!(report.records, 0);
        assert_eq!(report.strategy, MergeStrategy::Empty);
        assert_eq!(fs::read(&output).unwrap(), b"");
        assert_eq!(dir_entries(tmp_dir.path()), vec![output]);
    }

    #[rstest]
    fn test_duplicates_and_empty_records(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output.txt");
        let sorter: ExternalSorter<LimitedBufferBuilder> = ExternalSorterBuilder::new()
            .with_buffer(LimitedBufferBuilder::new(2, true))
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let report = sorter
            .sort(&b"apple\n\nkiwi\napple\n\nbanana\napple\n"[..], &output)
            .unwrap();

        assert_eq!(report.runs, 4);
        assert_eq!(fs::read(&output).unwrap(), b"\n\napple\napple\napple\nbanana\nkiwi\n");
    }

    #[rstest]
    fn test_output_is_deterministic(tmp_dir: tempfile::TempDir) {
        let input = Vec::from_iter((0..200).map(|i| format!("{}\n", i % 7).into_bytes())).concat();

        let first = tmp_dir.path().join("first.txt");
        let second = tmp_dir.path().join("second.txt");
        sorter(tmp_dir.path(), 10).sort(&input[..], &first).unwrap();
        sorter(tmp_dir.path(), 10).sort(&input[..], &second).unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[rstest]
    fn test_record_too_large(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output.txt");

        let result = sorter(tmp_dir.path(), 8).sort(&b"a\nb\nc\nd\nlong record\ne\n"[..], &output);

        match result {
            Err(err @ SortError::RecordTooLarge { limit: 8 }) => assert_eq!(err.stage(), Stage::Input),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(dir_entries(tmp_dir.path()).is_empty());
    }

    /// Endless line of `x` bytes, counting the bytes handed out.
    struct EndlessLine<'c> {
        consumed: &'c mut u64,
    }

    impl Read for EndlessLine<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            buf.fill(b'x');
            *self.consumed += buf.len() as u64;
            Ok(buf.len())
        }
    }

    #[rstest]
    fn test_oversized_record_fails_early(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output.txt");
        let mut consumed = 0;

        let input = io::BufReader::with_capacity(64, EndlessLine { consumed: &mut consumed }.take(256 << 20));
        let result = sorter(tmp_dir.path(), 16).sort(input, &output);

        assert!(matches!(result, Err(SortError::RecordTooLarge { limit: 16 })));
        assert!(consumed <= 1024, "consumed {} bytes", consumed);
        assert!(dir_entries(tmp_dir.path()).is_empty());
    }

    struct FailingReader {
        served: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(io::ErrorKind::Other, "device gone"));
            }
            self.served = true;
            let data = b"c\nb\na\n";
            buf[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }
    }

    #[rstest]
    fn test_input_failure_cleanup(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output.txt");
        let input = io::BufReader::new(FailingReader { served: false });

        let result = sorter(tmp_dir.path(), 2).sort(input, &output);

        assert!(matches!(result, Err(SortError::InputError(_))));
        assert!(dir_entries(tmp_dir.path()).is_empty());
    }

    /// Line run format failing once a number of records were read back.
    #[derive(Default)]
    struct FailingRunFormat {
        reads_left: AtomicUsize,
    }

    impl RunFormat for FailingRunFormat {
        fn extension(&self) -> &'static str {
            "failing"
        }

        fn dump(&self, writer: &mut dyn Write, records: &[Record]) -> io::Result<()> {
            LineRunFormat.dump(writer, records)
        }

        fn load(&self, reader: &mut dyn BufRead) -> io::Result<Option<Record>> {
            let left = self.reads_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "bad sector"));
            }
            self.reads_left.store(left - 1, Ordering::SeqCst);
            record::read_record(reader)
        }
    }

    #[rstest]
    fn test_merge_failure_cleanup(tmp_dir: tempfile::TempDir) {
        let output_dir = tmp_dir.path().join("output");
        let runs_dir = tmp_dir.path().join("runs");
        fs::create_dir(&output_dir).unwrap();
        fs::create_dir(&runs_dir).unwrap();
        let output = output_dir.join("output.txt");

        let input = Vec::from_iter((0..40).rev().map(|i| format!("{:02}\n", i).into_bytes())).concat();
        let sorter: ExternalSorter<MemoryLimitedBufferBuilder, FailingRunFormat> = ExternalSorterBuilder::new()
            .with_buffer(MemoryLimitedBufferBuilder::new(12))
            .with_run_format(FailingRunFormat {
                reads_left: AtomicUsize::new(15),
            })
            .with_tmp_dir(&runs_dir)
            .build()
            .unwrap();

        let result = sorter.sort(&input[..], &output);

        match result {
            Err(err @ SortError::RunRead(..)) => assert_eq!(err.stage(), Stage::RunRead),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(dir_entries(&runs_dir).is_empty());
        assert!(dir_entries(&output_dir).is_empty());
    }

    /// Line run format whose disk fills up after the first run.
    #[derive(Default)]
    struct FullDiskRunFormat {
        dumps: AtomicUsize,
    }

    impl RunFormat for FullDiskRunFormat {
        fn extension(&self) -> &'static str {
            "full"
        }

        fn dump(&self, writer: &mut dyn Write, records: &[Record]) -> io::Result<()> {
            if self.dumps.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            LineRunFormat.dump(writer, records)
        }

        fn load(&self, reader: &mut dyn BufRead) -> io::Result<Option<Record>> {
            record::read_record(reader)
        }
    }

    #[rstest]
    fn test_run_write_failure_cleanup(tmp_dir: tempfile::TempDir) {
        let output_dir = tmp_dir.path().join("output");
        let runs_dir = tmp_dir.path().join("runs");
        fs::create_dir(&output_dir).unwrap();
        fs::create_dir(&runs_dir).unwrap();
        let output = output_dir.join("output.txt");

        let sorter: ExternalSorter<LimitedBufferBuilder, FullDiskRunFormat> = ExternalSorterBuilder::new()
            .with_buffer(LimitedBufferBuilder::new(2, false))
            .with_tmp_dir(&runs_dir)
            .build()
            .unwrap();

        let result = sorter.sort(&b"d
c
b
a
f
e
"[..], &output);

        match result {
            Err(err @ SortError::RunWrite(..)) => assert_eq!(err.stage(), Stage::RunWrite),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(sorter.run_format.dumps.load(Ordering::SeqCst), 2);
        assert!(dir_entries(&runs_dir).is_empty());
        assert!(dir_entries(&output_dir).is_empty());
    }

    #[cfg(unix)]
    fn mode(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;

        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[cfg(unix)]
    #[rstest]
    #[case(&b"b\na\n"[..], 1024, MergeStrategy::SingleRun)]
    #[case(&b"d\nc\nb\na\n"[..], 4, MergeStrategy::KWay)]
    #[case(&b""[..], 1024, MergeStrategy::Empty)]
    fn test_new_output_mode(
        tmp_dir: tempfile::TempDir,
        #[case] input: &[u8],
        #[case] budget: u64,
        #[case] strategy: MergeStrategy,
    ) {
        let output = tmp_dir.path().join("output.txt");

        let report = sorter(tmp_dir.path(), budget).sort(input, &output).unwrap();

        assert_eq!(report.strategy, strategy);
        assert_eq!(mode(&output), 0o644);
    }

    #[cfg(unix)]
    #[rstest]
    #[case(1024, MergeStrategy::SingleRun)]
    #[case(4, MergeStrategy::KWay)]
    fn test_existing_output_mode_is_kept(
        tmp_dir: tempfile::TempDir,
        #[case] budget: u64,
        #[case] strategy: MergeStrategy,
    ) {
        use std::os::unix::fs::PermissionsExt;

        let output = tmp_dir.path().join("output.txt");
        fs::write(&output, b"previous\n").unwrap();
        fs::set_permissions(&output, fs::Permissions::from_mode(0o640)).unwrap();

        let report = sorter(tmp_dir.path(), budget).sort(&b"d\nc\nb\na\n"[..], &output).unwrap();

        assert_eq!(report.strategy, strategy);
        assert_eq!(fs::read(&output).unwrap(), b"a\nb\nc\nd\n");
        assert_eq!(mode(&output), 0o640);
    }

    #[rstest]
    fn test_failure_keeps_previous_output(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("output.txt");
        fs::write(&output, b"previous\n").unwrap();

        let result = sorter(tmp_dir.path(), 4).sort(&b"x\ntoo long\n"[..], &output);

        assert!(result.is_err());
        assert_eq!(fs::read(&output).unwrap(), b"previous\n");
        assert_eq!(dir_entries(tmp_dir.path()), vec![output]);
    }
}
