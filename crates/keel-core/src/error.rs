// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Keel.

use thiserror::Error;

use crate::types::EnvironmentId;

/// Top-level error type for all Keel operations.
#[derive(Debug, Error)]
pub enum KeelError {
    // -- Environment lifecycle --
    #[error("environment {environment} is not ready or has been disposed")]
    NotReadyOrDisposed { environment: EnvironmentId },

    #[error("no such environment: {environment}")]
    NoSuchEnvironment { environment: EnvironmentId },

    /// Programmer error: an operation was called out of order or twice.
    #[error("usage error: {0}")]
    Usage(String),

    // -- Collaborators --
    #[error("executor error: {0}")]
    Executor(String),

    #[error("script queue error: {0}")]
    Queue(String),

    // -- Bundles --
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("module {module} not found in bundle segment {segment}")]
    ModuleNotFound { segment: u32, module: u32 },

    // -- Storage / persistence --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse classification used by embedders to decide how to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller can retry later or carry on without the result.
    Recoverable,
    /// A bug in the calling code. Never retried.
    Usage,
    /// A collaborator (executor, queue, file system) failed.
    Collaborator,
}

impl KeelError {
    /// Classify this error for the caller.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotReadyOrDisposed { .. } | Self::NoSuchEnvironment { .. } => {
                ErrorClass::Recoverable
            }
            Self::Usage(_) => ErrorClass::Usage,
            Self::Executor(_)
            | Self::Queue(_)
            | Self::InvalidBundle(_)
            | Self::ModuleNotFound { .. }
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Config(_) => ErrorClass::Collaborator,
        }
    }

    /// Whether this error signals a programmer error.
    pub fn is_usage(&self) -> bool {
        self.class() == ErrorClass::Usage
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, KeelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_errors_are_recoverable() {
        let id = EnvironmentId::named("main");
        let err = KeelError::NotReadyOrDisposed {
            environment: id.clone(),
        };
        assert_eq!(err.class(), ErrorClass::Recoverable);
        assert_eq!(
            err.to_string(),
            "environment main is not ready or has been disposed"
        );

        let err = KeelError::NoSuchEnvironment { environment: id };
        assert_eq!(err.class(), ErrorClass::Recoverable);
    }

    #[test]
    fn usage_errors_are_flagged() {
        let err = KeelError::Usage("preload called twice".into());
        assert!(err.is_usage());
        assert_eq!(err.to_string(), "usage error: preload called twice");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: KeelError = io.into();
        assert_eq!(err.class(), ErrorClass::Collaborator);
    }
}
