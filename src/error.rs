//! Error types for firmflow
//!
//! Failures local to one object or one plugin are recorded on the object and
//! never abort a scheduler. Only worker crashes under the fail-fast policy and
//! configuration problems surface to the caller.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for firmflow operations
#[derive(Error, Debug)]
pub enum FirmflowError {
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl FirmflowError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while extracting a container
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("No extraction method for mime type {mime}")]
    Unsupported { mime: String },

    #[error("Corrupt container {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Entry {entry} escapes the extraction directory")]
    UnsafeEntry { entry: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExtractionError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Per object/plugin analysis failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Analysis timed out after {}ms", timeout.as_millis())]
    Timeout { plugin: String, timeout: Duration },

    #[error("Analysis threw an exception: {reason}")]
    Exception { plugin: String, reason: String },

    #[error("dependency {dependency} failed")]
    DependencyFailed { plugin: String, dependency: String },

    #[error("dependency {dependency} unavailable")]
    DependencyUnavailable { plugin: String, dependency: String },

    #[error("No worker pool for plugin {plugin}")]
    NoRunner { plugin: String },
}

impl AnalysisError {
    pub fn plugin(&self) -> &str {
        match self {
            Self::Timeout { plugin, .. }
            | Self::Exception { plugin, .. }
            | Self::DependencyFailed { plugin, .. }
            | Self::DependencyUnavailable { plugin, .. }
            | Self::NoRunner { plugin } => plugin,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Worker lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    #[error("{label} worker {name} crashed: {message}")]
    Crashed {
        label: String,
        name: String,
        message: String,
    },

    #[error("Failed to spawn worker {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Work queue closed")]
    QueueClosed,
}

impl WorkerError {
    /// Whether the pipeline may keep running after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Crashed { .. })
    }
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("Invalid mime pattern {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("Unknown plugin {0}")]
    UnknownPlugin(String),
}

impl ConfigError {
    pub fn invalid(key: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for firmflow operations
pub type Result<T> = std::result::Result<T, FirmflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_messages() {
        let timeout = AnalysisError::Timeout {
            plugin: "file_hashes".into(),
            timeout: Duration::from_millis(250),
        };
        assert!(timeout.to_string().starts_with("Analysis timed out"));
        assert!(timeout.is_timeout());
        assert_eq!(timeout.plugin(), "file_hashes");

        let failed = AnalysisError::Exception {
            plugin: "entropy".into(),
            reason: "boom".into(),
        };
        assert_eq!(failed.to_string(), "Analysis threw an exception: boom");
    }

    #[test]
    fn test_worker_error_recoverability() {
        let crash = WorkerError::Crashed {
            label: "Unpacking".into(),
            name: "unpack-0".into(),
            message: "panic".into(),
        };
        assert!(!crash.is_recoverable());
        assert!(WorkerError::QueueClosed.is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let err: FirmflowError = ExtractionError::Unsupported {
            mime: "application/x-foo".into(),
        }
        .into();
        assert!(err.to_string().contains("application/x-foo"));
    }
}
