use std::io::{self, ErrorKind};
use std::path::PathBuf;

/// Problems with the replacement mapping. Any of these aborts the run
/// before the tree is scanned.
#[derive(thiserror::Error, Debug)]
pub enum MappingError {
    #[error("unable to read mapping file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("mapping file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("mapping file is missing the \"REPLACEMENT_MAPPING\" object")]
    MissingMapping,
    #[error("\"REPLACEMENT_MAPPING\" must be a JSON object")]
    NotAnObject,
    #[error("mapping entry '{key}' must map to a string")]
    NonStringValue { key: String },
    #[error("recursive mapping: value '{value}' of key '{key}' is itself a key")]
    Recursive { key: String, value: String },
    #[error("unable to compile replacement pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Outcome of a failed transaction attempt. The retry loop pattern-matches
/// on the variant to decide between rescheduling and giving up.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),
    #[error("content drifted since scan at line {line}")]
    ContentDrift { line: usize },
}

impl ExecError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Retryable(_))
    }

    /// Classify an OS error raised while touching `what`.
    pub fn from_io(err: &io::Error, what: &str) -> Self {
        let message = format!("{what}: {err}");
        if is_transient(err) {
            ExecError::Retryable(message)
        } else {
            ExecError::Fatal(message)
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    match err.kind() {
        ErrorKind::PermissionDenied
        | ErrorKind::ResourceBusy
        | ErrorKind::ExecutableFileBusy
        | ErrorKind::WouldBlock => true,
        // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
        _ if cfg!(windows) => matches!(err.raw_os_error(), Some(32) | Some(33)),
        _ => false,
    }
}
