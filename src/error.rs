//! Error types.
//!
//! Two layers:
//! - [`TimingError`]: what library code returns. A failed *fit* is not an error;
//!   it is a [`crate::fit::FitOutcome::Failed`] value the engine recovers from.
//! - [`AppError`]: what the binary returns, carrying a process exit code.

use std::path::PathBuf;

use thiserror::Error;

pub type TimingResult<T> = Result<T, TimingError>;

#[derive(Debug, Error)]
pub enum TimingError {
    /// Fatal for the current cycle: nothing meaningful can be fit, or the
    /// persisted inputs disagree with what the pipeline was started with.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Cross-references between observations, TOAs and solutions do not line up.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// The TOA store refused an operation (duplicate id, non-unique timestamp).
    #[error("store error: {0}")]
    Store(String),

    #[error("failed to access '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("invalid JSON in '{}': {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl TimingError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            TimingError::Configuration(_) | TimingError::Parse { .. } | TimingError::Json { .. } => 2,
            TimingError::DataIntegrity(_) => 3,
            TimingError::Store(_) | TimingError::Io { .. } => 4,
        }
    }
}

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl From<TimingError> for AppError {
    fn from(err: TimingError) -> Self {
        AppError::new(err.exit_code(), err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_errors_map_to_exit_codes() {
        let err: AppError = TimingError::Configuration("no parameters".into()).into();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("no parameters"));

        let err: AppError = TimingError::DataIntegrity("missing TOA".into()).into();
        assert_eq!(err.exit_code(), 3);

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AppError = TimingError::io("/tmp/pulsar.par", io).into();
        assert_eq!(err.exit_code(), 4);
        assert!(err.to_string().contains("/tmp/pulsar.par"));
    }
}
