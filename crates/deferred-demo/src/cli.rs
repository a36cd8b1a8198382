use std::io;
use std::path::PathBuf;

use clap::Parser;
use deferred_core::EventLoop;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use web_time::Duration;

use crate::error::{DemoError, Result};
use crate::pipeline::{PipelineConfig, run_pipeline};

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV: &str = "DEFERRED_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "deferred-demo",
    about = "Read a file, wait, strip lowercase vowels and print a preview",
    version
)]
pub struct Cli {
    /// File to read.
    pub path: PathBuf,

    /// How long to wait before transforming the text.
    #[arg(long = "delay-ms", default_value_t = 2000)]
    pub delay_ms: u64,

    /// Number of characters of the transformed text to print.
    #[arg(long = "preview-chars", default_value_t = 200)]
    pub preview_chars: usize,

    /// Log filter used when DEFERRED_LOG is unset.
    #[arg(long = "log-level", default_value = "warn")]
    pub log_level: String,
}

impl Cli {
    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            path: self.path.clone(),
            delay: Duration::from_millis(self.delay_ms),
            preview_chars: self.preview_chars,
        }
    }
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    run(cli)
}

pub fn run(cli: Cli) -> Result<()> {
    let config = cli.pipeline_config();
    let status = run_pipeline(&EventLoop::new(), &config, io::stdout(), io::stderr())?;
    if status.failed {
        return Err(DemoError::PipelineFailed { path: config.path });
    }
    Ok(())
}

fn log_filter(fallback: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(fallback))
        .map_err(|err| DemoError::invalid(format!("log filter {fallback:?}: {err}")))
}

fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(log_filter(level)?)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false),
        )
        .try_init()
        .map_err(|err| DemoError::Logging {
            message: err.to_string(),
        })
}
