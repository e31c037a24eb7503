use fuzzwatch_core::config::FuzzwatchConfig;
use fuzzwatch_core::decoder::LineDecoder;
use fuzzwatch_core::persist::{JsonFileSink, SummarySink, WriterSink};
use fuzzwatch_core::processor::{ProcessorOptions, StreamEnd, StreamProcessor};
use fuzzwatch_core::sanitizer::SINK_MODE_ENV;

use anyhow::Context;
use clap::Parser;
use std::fs::File;
use std::io::{self, BufRead, BufReader, IsTerminal};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "fuzzwatch.toml";

/// Summarize a live fuzzer log: coverage over time, crashes and triaged
/// artifacts, written as JSON under the `fuzz_data` key.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Fuzzer log file. Reads from stdin when omitted.
    fuzz_log_file: Option<PathBuf>,
    /// JSON file to write the summary into (merged under `fuzz_data`).
    #[clap(short, long, value_parser)]
    output: Option<PathBuf>,
    /// Do not echo input lines to stdout.
    #[clap(long)]
    no_tee: bool,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Seconds between time-based dumps; 0 disables them.
    #[clap(long)]
    dump_interval_secs: Option<u64>,
    /// Triage sink-point hits as their own crash class.
    #[clap(long)]
    sink_mode: bool,
    /// Diagnostic log filter, used when RUST_LOG is unset.
    #[clap(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Resolves the effective configuration: defaults, then the config file,
/// then the sink-mode environment value, then command-line flags.
fn load_config(cli: &Cli, sink_mode_env: Option<&str>) -> Result<FuzzwatchConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!(path = ?config_path, "loading configuration");
            FuzzwatchConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!(path = ?default_config_path, "loading default configuration");
                FuzzwatchConfig::load_from_file(&default_config_path)?
            } else {
                FuzzwatchConfig::default()
            }
        }
    };

    config.apply_sink_mode_env(sink_mode_env);

    if let Some(output) = &cli.output {
        config.output.path = Some(output.clone());
    }
    if cli.no_tee {
        config.input.tee = false;
    }
    if let Some(secs) = cli.dump_interval_secs {
        config.output.dump_interval_secs = secs;
    }
    if cli.sink_mode {
        config.triage.sink_mode = true;
    }
    Ok(config)
}

fn open_input(cli: &Cli) -> Result<Box<dyn BufRead>, anyhow::Error> {
    match &cli.fuzz_log_file {
        Some(path) => {
            info!(path = ?path, "analyzing fuzz log file");
            let file = File::open(path)
                .with_context(|| format!("Failed to open fuzz log file {path:?}"))?;
            Ok(Box::new(BufReader::new(file)))
        }
        None if !io::stdin().is_terminal() => {
            info!("analyzing fuzz log from stdin");
            Ok(Box::new(io::stdin().lock()))
        }
        None => anyhow::bail!(
            "no input: pass a fuzz log file or pipe the fuzzer output in, e.g. `fuzz_command | fuzzwatch -o result.json`"
        ),
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let sink_mode_env = std::env::var(SINK_MODE_ENV).ok();
    let config = load_config(&cli, sink_mode_env.as_deref())?;
    info!(?config, "effective configuration");

    let sink: Box<dyn SummarySink> = match &config.output.path {
        Some(path) => {
            let sink = JsonFileSink::open(path, config.output.pretty);
            info!(path = ?sink.path(), "summary will be merged into output file");
            Box::new(sink)
        }
        None => Box::new(WriterSink::stdout(config.output.pretty)),
    };
    let mut processor = StreamProcessor::new(ProcessorOptions::from(&config), sink)?;

    let handle = processor.flush_handle();
    ctrlc::set_handler(move || {
        info!("termination requested, writing final summary");
        if let Err(e) = handle.flush() {
            error!(error = %e, "final summary dump failed");
        }
        std::process::exit(0);
    })
    .context("Failed to install termination signal handler")?;

    let input = open_input(&cli)?;
    let tee = config.input.tee.then(io::stdout);
    let decoder = LineDecoder::new(input, tee);

    match processor.run(decoder)? {
        StreamEnd::Exhausted => info!("end of input reached"),
        StreamEnd::TeeClosed => warn!("stdout closed, stopping early"),
    }

    match processor.finish() {
        Ok(summary) => info!(
            ttl_round = summary.ttl_round,
            max_cov = summary.max_cov,
            crashes = summary.log_crash_over_time.len(),
            triaged = summary.log_triage_crash_over_time.len(),
            "fuzz log analysis finished"
        ),
        Err(e) => error!(error = %e, "final summary dump failed"),
    }
    Ok(())
}
