use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum LoadAtomsError {
    #[error("invalid dataset identifier: {0}")]
    InvalidIdentifier(String),

    #[error("unknown dataset: {0}")]
    #[diagnostic(help("check the spelling, or browse the catalog for available datasets"))]
    NotFound(String),

    #[error("the provided path does not exist: {0}")]
    PathNotFound(PathBuf),

    #[error("request for {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("request for {url} returned status {status}")]
    NetworkStatus { url: String, status: u16 },

    #[error("checksum mismatch for {file}: expected {expected}, found {actual}")]
    #[diagnostic(help("the downloaded file is corrupt or the catalog entry is stale"))]
    Integrity {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("dataset {dataset} requires load-atoms >= {required} (current version: {current})")]
    #[diagnostic(help("upgrade load-atoms to load this dataset"))]
    IncompatibleVersion {
        dataset: String,
        required: String,
        current: String,
    },

    #[error("invalid dataset description {source_name}: {message}")]
    #[diagnostic(help("a stale description on disk can be removed to force a fresh download"))]
    Schema {
        source_name: String,
        message: String,
    },

    #[error("unknown processing step: {name} (expected one of {expected})")]
    UnknownStep { name: String, expected: String },

    #[error("invalid configuration for step {step}: {message}")]
    StepConfig { step: String, message: String },

    #[error("failed to parse {path} (line {line}): {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cache for {dataset} is locked by another process ({lock})")]
    #[diagnostic(help("wait for the other load to finish, or remove the lock file if it is stale"))]
    CacheLocked { dataset: String, lock: PathBuf },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),
}

impl LoadAtomsError {
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            LoadAtomsError::Network { .. } | LoadAtomsError::NetworkStatus { .. }
        )
    }
}

impl From<rusqlite::Error> for LoadAtomsError {
    fn from(err: rusqlite::Error) -> Self {
        LoadAtomsError::Storage(err.to_string())
    }
}
