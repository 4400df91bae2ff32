use std::path::PathBuf;

/// Run-level errors. Any of these stops the scan; per-candidate failures never
/// surface here.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("line {line}: malformed subnet specification: {spec:?}")]
    MalformedSpecification { line: usize, spec: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {}: {reason}", path.display())]
    ConfigFile { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("results sink stopped accepting verdicts")]
    SinkClosed,

    #[error("worker task failed: {0}")]
    WorkerFailed(String),
}

impl ScanError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ScanError::Io {
            path: path.into(),
            source,
        }
    }
}
