use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::{DatasetId, Stage};

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("invalid dataset id: {0}")]
    InvalidDatasetId(String),

    #[error("invalid stage: {0}")]
    InvalidStage(String),

    #[error("config file not found: {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("remote returned status {status}: {message}")]
    TransferStatus { status: u16, message: String },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("malformed section {section}: {message}")]
    Parse { section: String, message: String },

    #[error("{stage} for {dataset} requires {predecessor} to be complete")]
    #[diagnostic(help("run the earlier stages first, or check the workspace for removed markers"))]
    Dependency {
        dataset: DatasetId,
        stage: Stage,
        predecessor: Stage,
    },

    #[error("{stage} for {dataset} is already running (lock {lock})")]
    StageLocked {
        dataset: DatasetId,
        stage: Stage,
        lock: PathBuf,
    },

    #[error("{stage} failed for {dataset}: {source}")]
    Stage {
        dataset: DatasetId,
        stage: Stage,
        #[source]
        source: Box<IngestError>,
    },
}

impl IngestError {
    pub(crate) fn fs(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        IngestError::Filesystem(format!("{context}: {err}"))
    }

    /// Innermost cause, looking through stage wrappers.
    pub fn root_cause(&self) -> &IngestError {
        match self {
            IngestError::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
