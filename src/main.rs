use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ext_line_sort::{
    ExternalSorter, ExternalSorterBuilder, LineRunFormat, MemoryLimitedBufferBuilder, RmpRunFormat, RunFormat,
    SortError, SortReport,
};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let run_format: RunFormatArg = arg_parser.value_of_t_or_exit("run_format");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let chunk_size = arg_parser.value_of("chunk_size").expect("value has default");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let buf_size: Option<ByteSize> = arg_parser
        .is_present("buf_size")
        .then(|| arg_parser.value_of_t_or_exit("buf_size"));

    let input = path::Path::new(arg_parser.value_of("input").expect("value is required"));
    let output = path::Path::new(arg_parser.value_of("output").expect("value is required"));

    let options = Options {
        threads,
        tmp_dir: tmp_dir.map(path::Path::new),
        chunk_size: chunk_size.parse::<ByteSize>().expect("value is pre-validated").as_u64(),
        buf_size: buf_size.map(|size| size.as_u64() as usize),
    };

    let result = match run_format {
        RunFormatArg::Lines => sort(&options, LineRunFormat, input, output),
        RunFormatArg::Msgpack => sort(&options, RmpRunFormat, input, output),
    };

    match result {
        Ok(report) => log::info!(
            "{} sorted into {} ({} records, {} runs, {:?})",
            input.display(),
            output.display(),
            report.records,
            report.runs,
            report.strategy
        ),
        Err(err) => {
            log::error!("{} stage failed: {}", err.stage(), err);
            process::exit(1);
        }
    }
}

struct Options<'a> {
    threads: Option<usize>,
    tmp_dir: Option<&'a path::Path>,
    chunk_size: u64,
    buf_size: Option<usize>,
}

fn sort<F: RunFormat>(
    options: &Options,
    run_format: F,
    input: &path::Path,
    output: &path::Path,
) -> Result<SortReport, SortError> {
    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_buffer(MemoryLimitedBufferBuilder::new(options.chunk_size))
        .with_run_format(run_format);

    if let Some(threads) = options.threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = options.tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(tmp_dir);
    }

    if let Some(buf_size) = options.buf_size {
        sorter_builder = sorter_builder.with_rw_buf_size(buf_size);
    }

    let sorter: ExternalSorter<MemoryLimitedBufferBuilder, F> = sorter_builder.build()?;

    return sorter.sort_file(input, output);
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum RunFormatArg {
    Lines,
    Msgpack,
}

impl RunFormatArg {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        RunFormatArg::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for RunFormatArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <RunFormatArg as clap::ArgEnum>::from_str(s, false)
    }
}

fn validate_size(value: &str) -> Result<(), String> {
    match value.parse::<ByteSize>() {
        Ok(size) if size.as_u64() > 0 => Ok(()),
        Ok(_) => Err(String::from("size must be positive")),
        Err(err) => Err(format!("size format incorrect: {}", err)),
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-line-sort")
        .about("sorts lines of a file larger than available memory")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("chunk_size")
                .short('c')
                .long("chunk-size")
                .help("memory budget of a single chunk")
                .takes_value(true)
                .default_value("500MiB")
                .validator(validate_size),
        )
        .arg(
            clap::Arg::new("buf_size")
                .short('b')
                .long("buf-size")
                .help("read/write buffer size of run and output files")
                .takes_value(true)
                .validator(validate_size),
        )
        .arg(
            clap::Arg::new("run_format")
                .short('f')
                .long("run-format")
                .help("temporary run file format")
                .takes_value(true)
                .default_value("lines")
                .possible_values(RunFormatArg::possible_values()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
