use std::{
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = DsynthError> = std::result::Result<T, E>;

/// Various error types for the build core.
#[derive(Debug, thiserror::Error)]
pub enum DsynthError {
    /// Template construction failed; fatal for the whole campaign.
    #[error("template: {0}")]
    Template(String),
    /// A worker slot exhausted its mount or unmount retries.
    #[error("slot {slot}: {msg}")]
    SlotMount { slot: usize, msg: String },
    /// The build child exited non-zero, timed out or produced no package.
    #[error("build of {origin} failed: {reason}")]
    Build { origin: String, reason: String },
    /// Cycle or unknown origin detected while resolving the DAG.
    #[error("dependency graph: {0}")]
    Dag(String),
    /// SIGINT/SIGTERM observed; running builds were interrupted.
    #[error("interrupted by signal")]
    Shutdown,
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl DsynthError {
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        DsynthError::Message(msg.to_string())
    }

    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        IoError::new(err, path).into()
    }
}

/// An `io::Error` annotated with the path it occurred on.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct IoError {
    io: io::Error,
    path: PathBuf,
}

impl IoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inner(&self) -> &io::Error {
        &self.io
    }
}

impl From<IoError> for io::Error {
    fn from(err: IoError) -> Self {
        err.io
    }
}
