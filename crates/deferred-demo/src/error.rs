use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DemoError>;

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("logging setup failed: {message}")]
    Logging { message: String },

    #[error("pipeline failed for {path}")]
    PipelineFailed { path: PathBuf },
}

impl DemoError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } => 2,
            _ => 1,
        }
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}
