use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// Rejection reason produced by the built-in adapters.
///
/// Every rejection reason must be `Clone` (each subscriber receives its own
/// copy), so I/O errors are shared behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum DeferredError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("worker for {task} panicked: {message}")]
    WorkerPanicked { task: String, message: String },
}

impl DeferredError {
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source: Arc::new(source),
        }
    }

    /// Build a `WorkerPanicked` from a `catch_unwind` payload.
    #[must_use]
    pub fn worker_panicked(task: impl Into<String>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::WorkerPanicked {
            task: task.into(),
            message,
        }
    }

    /// The underlying I/O error kind, if this is an I/O failure.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io { source, .. } => Some(source.kind()),
            Self::WorkerPanicked { .. } => None,
        }
    }
}
