use std::path::PathBuf;
use thiserror::Error;

/// Failure to establish the run's archive root. The one condition that
/// aborts a whole run.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to create archive root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create archive subdirectory {path}: {source}")]
    Subdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
