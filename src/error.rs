use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpaceQueryError {
    #[error("unable to resolve {path:?}: {source}")]
    Resolve { path: PathBuf, source: io::Error },
    #[error("no mounted volume contains {path:?}")]
    NoVolume { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid resource {url:?}: {reason}")]
    InvalidResource { url: String, reason: String },
    #[error("fetching {url:?} failed: {reason}")]
    Backend { url: String, reason: String },
    #[error("fetching {url:?} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("I/O error fetching {url:?}: {source}")]
    Io { url: String, source: io::Error },
}

impl FetchError {
    pub fn invalid(url: &str, reason: &str) -> Self {
        FetchError::InvalidResource {
            url: String::from(url),
            reason: String::from(reason),
        }
    }

    pub fn backend(url: &str, reason: &str) -> Self {
        FetchError::Backend {
            url: String::from(url),
            reason: String::from(reason),
        }
    }

    /// Everything except a malformed resource is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::InvalidResource { .. })
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoding {path:?} failed: {reason}\n{diagnostics}")]
    Process {
        path: PathBuf,
        reason: String,
        diagnostics: String,
    },
    #[error("transcoding {path:?} timed out after {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("I/O error transcoding {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("transcoded {path:?} has an unexpected format: {reason}")]
    Format { path: PathBuf, reason: String },
}

impl TranscodeError {
    pub fn for_file(path: &PathBuf, reason: &str, diagnostics: &str) -> Self {
        TranscodeError::Process {
            path: PathBuf::from(path),
            reason: String::from(reason),
            diagnostics: String::from(diagnostics),
        }
    }
}

/// A failure confined to one attempt; the pipeline decides whether to retry.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid resource {url:?}: {reason}")]
    InvalidResource { url: String, reason: String },
    #[error("insufficient disk space in {dir:?}: {free_gb:.2} GB free, {required_gb:.2} GB required")]
    InsufficientSpace {
        dir: PathBuf,
        free_gb: f64,
        required_gb: f64,
    },
    #[error("free space in {dir:?} is unknown: {source}")]
    SpaceUnknown {
        dir: PathBuf,
        source: SpaceQueryError,
    },
    #[error("giving up on {url:?} after {attempts} attempt(s): {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: AttemptError,
    },
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("unable to read {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("unable to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{path:?} must contain a JSON array of rows")]
    NotAnArray { path: PathBuf },
    #[error("missing required columns: {0:?}")]
    MissingColumns(Vec<String>),
    #[error("row {row} has an invalid {column:?} value")]
    InvalidValue { row: usize, column: String },
}

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("unable to write {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("unable to serialize results: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unable to write {path:?}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("unable to read waveform {path:?}: {source}")]
    Waveform { path: PathBuf, source: hound::Error },
}
