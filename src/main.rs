/*!
 * Freight CLI - Command Line Interface
 *
 * Thin collaborator around the library: builds a `TransferConfig` from the
 * config file and flags, discovers the source tree, runs the scheduler and
 * prints the summary. The exit code comes from the run report.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use freight::{
    cli_progress::CliProgressRenderer,
    cli_style::{
        self, failure_table, format_bytes, plan_table, print_error, print_info,
        print_run_verdict, run_summary_table, section_header, stats_table,
    },
    config::{ChecksumAlgorithm, LogLevel, TransferConfig, VerifyMode},
    core::{
        discover,
        progress::ProgressPublisher,
        sink::{BundleSink, DestinationSink, DirectorySink, MemorySink},
        RunReport, Scheduler,
    },
    error::{FreightError, EXIT_FATAL, EXIT_SUCCESS},
    logging,
};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const PROGRESS_BUFFER: usize = 1024;

#[derive(Parser)]
#[command(name = "freight")]
#[command(version, about = "Resource-adaptive bulk file transfer with memory-aware chunking, retries and verification", long_about = None)]
struct Cli {
    #[command(flatten)]
    options: TransferArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer a file or directory tree into a destination directory
    Copy {
        /// Source file or directory
        source: PathBuf,
        /// Destination directory
        dest: PathBuf,
    },

    /// Transfer a file or directory tree into a single bundle file
    Bundle {
        /// Source file or directory
        source: PathBuf,
        /// Bundle file; the index is written to <OUTPUT>.index.json
        output: PathBuf,
    },

    /// Show the lane assignment and chunk plan without transferring
    Plan {
        /// Source file or directory
        source: PathBuf,
    },

    /// Write a configuration file from a preset
    Init {
        /// Where to write the TOML configuration
        #[arg(default_value = "freight.toml")]
        path: PathBuf,
        /// Preset to start from
        #[arg(long, value_enum, default_value = "default")]
        preset: PresetArg,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct TransferArgs {
    /// Load configuration from a TOML file (flags override it)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Start from a built-in preset instead of the defaults
    #[arg(long, value_enum, global = true)]
    preset: Option<PresetArg>,

    /// Number of small-file workers
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Files larger than this many MiB use the sequential lane
    #[arg(long = "large-threshold", value_name = "MIB", global = true)]
    large_threshold: Option<u64>,

    /// Fixed chunk size in KiB (default: derived from available memory)
    #[arg(long = "chunk-size", value_name = "KIB", global = true)]
    chunk_size: Option<u64>,

    /// Total attempts per file, including the first
    #[arg(long = "max-attempts", global = true)]
    max_attempts: Option<u32>,

    /// Backoff unit in milliseconds
    #[arg(long = "base-delay-ms", global = true)]
    base_delay_ms: Option<u64>,

    /// Longest single backoff delay in milliseconds
    #[arg(long = "max-delay-ms", global = true)]
    max_delay_ms: Option<u64>,

    /// Add random jitter to backoff delays
    #[arg(long, global = true)]
    jitter: bool,

    /// Fraction of available memory left untouched (0.0 - 1.0)
    #[arg(long = "reserved-memory", value_name = "FRACTION", global = true)]
    reserved_memory: Option<f64>,

    /// Memory-map source files larger than this many MiB
    #[arg(long = "mmap-threshold", value_name = "MIB", global = true)]
    mmap_threshold: Option<u64>,

    /// Verification mode
    #[arg(long, value_enum, global = true)]
    verify: Option<VerifyArg>,

    /// Digest algorithm for checksum verification
    #[arg(long, value_enum, global = true)]
    checksum: Option<ChecksumArg>,

    /// Keep discovery order instead of dispatching smallest files first
    #[arg(long = "no-sort", global = true)]
    no_sort: bool,

    /// Prefix prepended to every destination key
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Write the run report as JSON
    #[arg(long, value_name = "FILE", global = true)]
    report: Option<PathBuf>,

    /// Log level
    #[arg(long = "log-level", value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stdout
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Verbose output (debug logging and per-file lines)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable the progress bar
    #[arg(long = "no-progress", global = true)]
    no_progress: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PresetArg {
    Default,
    Upload,
    Archive,
}

impl PresetArg {
    fn config(self) -> TransferConfig {
        match self {
            PresetArg::Default => TransferConfig::default(),
            PresetArg::Upload => TransferConfig::upload_preset(),
            PresetArg::Archive => TransferConfig::archive_preset(),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum VerifyArg {
    Size,
    Checksum,
}

impl From<VerifyArg> for VerifyMode {
    fn from(arg: VerifyArg) -> Self {
        match arg {
            VerifyArg::Size => VerifyMode::Size,
            VerifyArg::Checksum => VerifyMode::Checksum,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ChecksumArg {
    Sha256,
    Blake3,
    Md5,
}

impl From<ChecksumArg> for ChecksumAlgorithm {
    fn from(arg: ChecksumArg) -> Self {
        match arg {
            ChecksumArg::Sha256 => ChecksumAlgorithm::Sha256,
            ChecksumArg::Blake3 => ChecksumAlgorithm::Blake3,
            ChecksumArg::Md5 => ChecksumAlgorithm::Md5,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            let freight_error = e.downcast_ref::<FreightError>();
            let hint = freight_error.and_then(hint_for);
            print_error(&format!("{:#}", e), hint);
            freight_error.map(FreightError::exit_code).unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    if let Commands::Init {
        path,
        preset,
        force,
    } = &cli.command
    {
        return write_config(path, *preset, *force).map(|_| EXIT_SUCCESS);
    }

    let config = build_config(&cli.options)?;
    if let Err(e) = logging::init_logging(&config) {
        cli_style::print_warning(&format!("Failed to initialize logging: {}", e));
    }

    let prefix = cli.options.prefix.as_deref();
    let report = match cli.command {
        Commands::Plan { source } => {
            show_plan(&source, prefix, config)?;
            return Ok(EXIT_SUCCESS);
        }
        Commands::Copy { source, dest } => {
            let sink = Arc::new(DirectorySink::new(dest));
            transfer(&source, prefix, config, sink)?
        }
        Commands::Bundle { source, output } => {
            let sink = BundleSink::create(&output)
                .with_context(|| format!("cannot create bundle {}", output.display()))?;
            let report = transfer(&source, prefix, config, Arc::new(sink.clone()))?;
            let index = sink.finalize()?;
            print_info(&format!(
                "Bundle index: {} ({} entries)",
                sink.index_path().display(),
                index.entries.len()
            ));
            report
        }
        Commands::Init { .. } => return Ok(EXIT_SUCCESS),
    };

    if let Some(path) = &cli.options.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("cannot write report {}", path.display()))?;
    }

    section_header("Summary");
    println!("{}", run_summary_table(&report));
    if let Some(table) = failure_table(&report) {
        println!("{}", table);
    }
    print_run_verdict(&report);

    Ok(report.exit_code())
}

/// Defaults or preset, then the config file, then flags
fn build_config(args: &TransferArgs) -> anyhow::Result<TransferConfig> {
    let mut config = match &args.config {
        Some(path) => TransferConfig::from_file(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => args.preset.map(PresetArg::config).unwrap_or_default(),
    };

    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(mib) = args.large_threshold {
        config.large_threshold_bytes = mib.saturating_mul(MIB);
    }
    if let Some(kib) = args.chunk_size {
        config.chunk_size = Some(kib.saturating_mul(KIB));
    }
    if let Some(attempts) = args.max_attempts {
        config.max_attempts = attempts;
    }
    if let Some(ms) = args.base_delay_ms {
        config.base_delay_ms = ms;
    }
    if let Some(ms) = args.max_delay_ms {
        config.max_delay_ms = ms;
    }
    if args.jitter {
        config.backoff_jitter = true;
    }
    if let Some(fraction) = args.reserved_memory {
        config.reserved_memory_fraction = fraction;
    }
    if let Some(mib) = args.mmap_threshold {
        config.mmap_threshold_bytes = mib.saturating_mul(MIB);
    }
    if let Some(verify) = args.verify {
        config.verify_mode = verify.into();
    }
    if let Some(checksum) = args.checksum {
        config.checksum_algorithm = checksum.into();
    }
    if args.no_sort {
        config.sort_by_size = false;
    }
    if args.no_progress {
        config.show_progress = false;
    }
    if let Some(level) = args.log_level {
        config.log_level = level.into();
    }
    if args.log.is_some() {
        config.log_file = args.log.clone();
    }
    if args.verbose {
        config.verbose = true;
    }

    config.validate()?;
    Ok(config)
}

fn transfer(
    source: &Path,
    prefix: Option<&str>,
    config: TransferConfig,
    sink: Arc<dyn DestinationSink>,
) -> anyhow::Result<RunReport> {
    let files = discover(source, prefix)?;
    print_info(&format!(
        "{} files ({}) {} {}",
        files.len(),
        format_bytes(files.iter().map(|f| f.size()).sum()),
        cli_style::Icons::ARROW_RIGHT,
        sink.describe()
    ));

    let (publisher, renderer) = if config.show_progress {
        let (publisher, subscriber) = ProgressPublisher::new(PROGRESS_BUFFER);
        let renderer = CliProgressRenderer::new(subscriber, config.verbose).spawn();
        (publisher, Some(renderer))
    } else {
        (ProgressPublisher::noop(), None)
    };

    let report = {
        let scheduler = Scheduler::new(config, sink).with_publisher(publisher);
        scheduler.run(files)
    };

    // Scheduler (and its publisher) are gone, so the renderer sees the channel close
    if let Some(handle) = renderer {
        if handle.join().is_err() {
            cli_style::print_warning("progress renderer panicked");
        }
    }

    Ok(report?)
}

fn show_plan(source: &Path, prefix: Option<&str>, config: TransferConfig) -> anyhow::Result<()> {
    let files = discover(source, prefix)?;
    let threshold = config.large_threshold_bytes;
    let concurrency = config.concurrency;
    let scheduler = Scheduler::new(config, Arc::new(MemorySink::new()));
    let plan = scheduler.plan(files);

    section_header("Transfer Plan");
    println!("{}", plan_table(&plan, threshold));
    println!(
        "{}",
        stats_table(&[
            ("Small-file workers", concurrency.to_string()),
            ("Large-file lane", "1 (sequential)".to_string()),
            ("Files", plan.files_total().to_string()),
        ])
    );
    Ok(())
}

fn write_config(path: &Path, preset: PresetArg, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    preset
        .config()
        .to_file(path)
        .map_err(|e| anyhow::anyhow!("Failed to save configuration: {}", e))?;
    cli_style::print_success(&format!("Configuration written to {}", path.display()));
    Ok(())
}

fn hint_for(err: &FreightError) -> Option<&'static str> {
    match err {
        FreightError::Config(_) => Some("check the config file and flags"),
        FreightError::SinkUnavailable(_) => Some("check that the destination exists and is writable"),
        FreightError::SourceNotFound(_) => Some("check the source path"),
        _ => None,
    }
}
