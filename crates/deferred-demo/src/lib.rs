#![forbid(unsafe_code)]

pub mod cli;
pub mod error;
pub mod pipeline;

pub use cli::{Cli, run, run_from_env};
pub use error::{DemoError, Result};
pub use pipeline::{PipelineConfig, PipelineStatus, preview, run_pipeline, strip_vowels};
