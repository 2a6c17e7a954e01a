use std::path::PathBuf;

use thiserror::Error;

use crate::ports::PortError;

/// Errors surfaced by registry, resolver and derivation operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed time range, unsupported format, end <= start
    #[error("invalid input: {0}")]
    Input(String),

    /// Alias unknown and reference is not resolvable
    #[error("not found: {0}")]
    NotFound(String),

    #[error("alias '{alias}' is already bound to {existing} (requested {requested})")]
    Conflict {
        alias: String,
        existing: String,
        requested: String,
    },

    #[error("download failed for {reference}: {source}")]
    Download {
        reference: String,
        #[source]
        source: PortError,
    },

    #[error("processing failed for {reference}: {message}")]
    Processing {
        reference: String,
        message: String,
        /// Diagnostic output of the processing tool, when it produced any
        stderr: Option<String>,
    },

    #[error("registry {} is corrupt: {reason}", .path.display())]
    RegistryCorrupt { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reportable failure category, mapped to process exit codes by the command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Input,
    NotFound,
    ToolFailure,
    State,
    Cancelled,
}

impl ErrorCategory {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::State => 1,
            ErrorCategory::Input => 2,
            ErrorCategory::NotFound => 3,
            ErrorCategory::ToolFailure => 4,
            ErrorCategory::Cancelled => 130,
        }
    }
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Input(_) | Error::Conflict { .. } => ErrorCategory::Input,
            Error::NotFound(_) => ErrorCategory::NotFound,
            Error::Download { .. } | Error::Processing { .. } => ErrorCategory::ToolFailure,
            Error::RegistryCorrupt { .. } | Error::Io(_) => ErrorCategory::State,
            Error::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Wrap a downloader failure, keeping cancellation distinct.
    pub(crate) fn download(reference: &str, source: PortError) -> Self {
        match source {
            PortError::Cancelled => Error::Cancelled,
            source => Error::Download {
                reference: reference.to_string(),
                source,
            },
        }
    }

    /// Wrap a processor failure, carrying the tool's stderr along.
    pub(crate) fn processing(reference: &str, source: PortError) -> Self {
        match source {
            PortError::Cancelled => Error::Cancelled,
            PortError::Failed { stderr, .. } if !stderr.trim().is_empty() => Error::Processing {
                reference: reference.to_string(),
                message: source_summary(&stderr),
                stderr: Some(stderr),
            },
            other => Error::Processing {
                reference: reference.to_string(),
                message: other.to_string(),
                stderr: None,
            },
        }
    }
}

/// Last non-empty line of a tool's stderr, which is usually the actual complaint.
fn source_summary(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("tool failed")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_category() {
        let codes = [
            ErrorCategory::Input.exit_code(),
            ErrorCategory::NotFound.exit_code(),
            ErrorCategory::ToolFailure.exit_code(),
            ErrorCategory::State.exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(codes.iter().all(|&c| c != 0));
    }

    #[test]
    fn test_conflict_is_input_category() {
        let err = Error::Conflict {
            alias: "a".into(),
            existing: "u1".into(),
            requested: "u2".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Input);
    }

    #[test]
    fn test_processing_keeps_stderr() {
        let err = Error::processing(
            "demo",
            PortError::Failed {
                program: "ffmpeg".into(),
                status: Some(1),
                stderr: "frame=1\nInvalid argument\n".into(),
            },
        );
        match err {
            Error::Processing { message, stderr, .. } => {
                assert_eq!(message, "Invalid argument");
                assert!(stderr.unwrap().contains("frame=1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_port_maps_to_cancelled() {
        assert!(matches!(Error::download("u", PortError::Cancelled), Error::Cancelled));
        assert!(matches!(Error::processing("u", PortError::Cancelled), Error::Cancelled));
    }
}
