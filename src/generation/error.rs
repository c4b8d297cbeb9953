//! Generation error types.

use thiserror::Error;

/// Substrings that mark a failure message as likely recoverable.
const TRANSIENT_MARKERS: [&str; 5] = ["aborted", "fetch", "network", "timeout", "in progress"];

/// Whether a failure message looks transient (network/timeout-shaped).
#[must_use]
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Eligible for retry with backoff.
    Transient,
    /// Rejected immediately.
    Fatal,
    /// The task's cancellation token fired inside the service.
    Cancelled,
}

/// Failure reported by an execution service.
///
/// The kind is assigned where the error leaves the service, so the
/// exchange never has to sniff strings itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    kind: ErrorKind,
    message: String,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a plain failure message by the transient marker rule.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if is_transient_message(&message) {
            ErrorKind::Transient
        } else {
            ErrorKind::Fatal
        };
        Self { kind, message }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Cancelled")
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Terminal outcome of a task that did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("Generation cancelled")]
    Cancelled,

    #[error("Generation failed, retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("{0}")]
    Fatal(String),

    #[error("Generation exchange dropped the task before it settled")]
    Dropped,
}

impl GenerationError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_markers() {
        assert!(is_transient_message("Fetch failed"));
        assert!(is_transient_message("The operation was aborted."));
        assert!(is_transient_message("NetworkError when attempting to fetch resource"));
        assert!(is_transient_message("Request timeout"));
        assert!(is_transient_message("Generation already in progress"));
    }

    #[test]
    fn test_fatal_messages() {
        assert!(!is_transient_message("Context too long"));
        assert!(!is_transient_message("HTTP 401: Unauthorized"));
        assert!(!is_transient_message("Invalid model"));
    }

    #[test]
    fn test_from_message_assigns_kind() {
        assert_eq!(
            ExecutionError::from_message("TIMEOUT waiting for reply").kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            ExecutionError::from_message("Context too long").kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_fatal_display_is_original_message() {
        let err = GenerationError::Fatal("Context too long".into());
        assert_eq!(err.to_string(), "Context too long");
    }

    #[test]
    fn test_retries_exhausted_display() {
        let err = GenerationError::RetriesExhausted {
            attempts: 4,
            message: "Fetch failed".into(),
        };
        let text = err.to_string();
        assert!(text.contains("retries exhausted"));
        assert!(text.contains("Fetch failed"));
        assert!(!err.is_cancelled());
        assert!(GenerationError::Cancelled.is_cancelled());
    }
}
