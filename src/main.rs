//! CLI Entry Point for rust_logwatch
//!
//! Two ways to drive the pipeline:
//! - `run`: spawn synthetic emitters and watch them for a fixed duration
//! - `interactive`: read `name:value` lines from stdin until the sentinel line
//!
//! Anomaly reports go to stdout, logs to stderr.
//!
//! # Usage
//!
//! ```bash
//! rust_logwatch run --sources 100 --duration 30s --seed 42
//! printf 'a:1\na:1\na:1\nX\n' | rust_logwatch interactive
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use humantime_serde::re::humantime;
use rust_logwatch::config::{LogwatchConfig, DEFAULT_CONFIG_PATH};
use rust_logwatch::core::AnomalyReport;
use rust_logwatch::pipeline::{self, PipelineSummary};
use rust_logwatch::tracing_setup;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Parser)]
#[command(name = "rust_logwatch")]
#[command(about = "Streaming detector for stuck log sources", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// Configuration file (TOML)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Require records to match the whole line
    #[arg(long)]
    strict: bool,

    /// Print anomaly reports as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run synthetic emitters for a fixed duration
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// Number of emitters
        #[arg(long)]
        sources: Option<usize>,

        /// Total run time (e.g. "10s", "2m")
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Per-emitter interval (e.g. "100ms")
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,

        /// Base RNG seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Read records from stdin until the sentinel line
    Interactive {
        #[command(flatten)]
        common: CommonArgs,

        /// Line that ends input (default from config: "X")
        #[arg(long)]
        sentinel: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            common,
            sources,
            duration,
            interval,
            seed,
        } => {
            let mut config = load_config(&common)?;
            if let Some(count) = sources {
                config.sources.count = count;
            }
            if let Some(duration) = duration {
                config.pipeline.run_duration = duration;
            }
            if let Some(interval) = interval {
                config.sources.interval = interval;
            }
            if seed.is_some() {
                config.sources.seed = seed;
            }
            config.validate()?;

            let (sink_tx, printer) = spawn_printer(common.json);
            let summary = pipeline::run_timed(&config, sink_tx).await;
            finish(summary, printer).await
        }
        Commands::Interactive { common, sentinel } => {
            let mut config = load_config(&common)?;
            if let Some(sentinel) = sentinel {
                config.pipeline.sentinel = sentinel;
            }
            config.validate()?;

            let (sink_tx, printer) = spawn_printer(common.json);
            let stdin = BufReader::new(tokio::io::stdin());
            let summary = pipeline::run_interactive(&config, stdin, sink_tx).await?;
            finish(summary, printer).await
        }
    }
}

fn load_config(common: &CommonArgs) -> Result<LogwatchConfig> {
    let mut config = LogwatchConfig::load_from(&common.config)?;
    if common.strict {
        config.pipeline.strict_records = true;
    }
    tracing_setup::init_from_config(&config)?;
    info!(name = %config.application.name, "Configuration loaded");
    Ok(config)
}

/// Output sink: owns the receiving end of the report channel.
fn spawn_printer(json: bool) -> (mpsc::UnboundedSender<AnomalyReport>, JoinHandle<u64>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<AnomalyReport>();
    let handle = tokio::spawn(async move {
        let mut printed = 0u64;
        while let Some(report) = rx.recv().await {
            if json {
                match serde_json::to_string(&report) {
                    Ok(line) => println!("{line}"),
                    Err(err) => tracing::error!(error = %err, "Failed to encode report"),
                }
            } else {
                println!("{report}");
            }
            printed += 1;
        }
        printed
    });
    (tx, handle)
}

async fn finish(summary: PipelineSummary, printer: JoinHandle<u64>) -> Result<()> {
    let reports = printer.await?;
    info!(
        emitted = summary.emitted,
        collector = %summary.parser,
        aggregator = %summary.aggregator,
        resolver = %summary.resolver,
        reports,
        "Pipeline finished"
    );
    Ok(())
}
