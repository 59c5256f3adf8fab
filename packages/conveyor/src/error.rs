//! Structured error types for the job engine.
//!
//! `QueueError` provides pattern-matchable errors for the synchronous API
//! surface instead of generic `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses a subscription or storage boundary.**
//!
//! - `anyhow` is internal transport (ergonomic for handlers)
//! - [`JobError`](crate::JobError) is the only externalized failure shape
//!   (structured `{message, code}` records on the job and in `on_failed`
//!   callbacks)
//!
//! Handlers that want a stable, caller-visible error code return a
//! [`HandlerFailure`] inside their `anyhow::Error`; the worker downcasts it
//! when normalizing the failure. Codes are preserved — `EXECUTION_ERROR` is
//! only the default for handlers that provide none.
//!
//! # Example
//!
//! ```ignore
//! use conveyor::{HandlerFailure, QueueError};
//!
//! // A handler surfacing a stable code
//! async fn send(ctx: JobContext) -> anyhow::Result<serde_json::Value> {
//!     if quota_exhausted() {
//!         return Err(HandlerFailure::new("quota exhausted", "RATE_LIMITED").into());
//!     }
//!     Ok(serde_json::json!({ "sent": true }))
//! }
//!
//! // Pattern-matching API errors
//! match service.add("emails", "email:send", data, Default::default()).await {
//!     Err(QueueError::UnknownQueue { name }) => eprintln!("no such queue: {name}"),
//!     Err(e) => eprintln!("submit failed: {e}"),
//!     Ok(id) => println!("queued {id}"),
//! }
//! ```

use thiserror::Error;
use uuid::Uuid;

use crate::storage::StorageError;

/// Structured error type for queue service operations.
///
/// Each variant includes context about what went wrong and maps onto a
/// stable failure kind: absent targets, misconfiguration, refusal while
/// stopping, and storage trouble.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The targeted job does not exist.
    #[error("job {id} not found")]
    NotFound {
        /// The job id that was looked up.
        id: Uuid,
    },

    /// The named queue was never configured on this service.
    #[error("unknown queue: {name}")]
    UnknownQueue {
        /// The queue name as given by the caller.
        name: String,
    },

    /// The queue is stopping or stopped and refuses new submissions.
    #[error("queue {name} is not accepting jobs")]
    QueueClosed {
        /// The refusing queue.
        name: String,
    },

    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the argument.
        message: String,
    },

    /// The engine cannot serve the request right now.
    #[error("service unavailable: {message}")]
    ServiceUnavailable {
        /// Why the service is unavailable.
        message: String,
    },

    /// The storage adapter failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QueueError {
    /// Shorthand for an [`QueueError::InvalidArgument`].
    pub fn invalid(message: impl Into<String>) -> Self {
        QueueError::InvalidArgument {
            message: message.into(),
        }
    }
}

/// A handler failure carrying a stable, caller-visible error code.
///
/// Handlers return `anyhow::Result`; wrapping the error in `HandlerFailure`
/// lets the worker preserve the code when it normalizes the failure into the
/// job record. Failures without a `HandlerFailure` inside normalize to code
/// `EXECUTION_ERROR`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerFailure {
    /// Human-readable failure message.
    pub message: String,
    /// Stable error code (e.g. `RATE_LIMITED`).
    pub code: String,
    /// Optional structured details, opaque to the engine.
    pub details: Option<serde_json::Value>,
}

impl HandlerFailure {
    /// Create a failure with a message and a stable code.
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            details: None,
        }
    }

    /// Attach structured details to the failure.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::UnknownQueue {
            name: "emails".into(),
        };
        assert!(err.to_string().contains("unknown queue"));
        assert!(err.to_string().contains("emails"));
    }

    #[test]
    fn test_queue_error_is_pattern_matchable() {
        let err = QueueError::QueueClosed {
            name: "emails".into(),
        };

        match &err {
            QueueError::QueueClosed { name } => assert_eq!(name, "emails"),
            _ => panic!("expected QueueClosed"),
        }
    }

    #[test]
    fn test_handler_failure_downcasts_from_anyhow() {
        let err: anyhow::Error = HandlerFailure::new("quota exhausted", "RATE_LIMITED").into();

        let failure = err.downcast_ref::<HandlerFailure>().unwrap();
        assert_eq!(failure.code, "RATE_LIMITED");
        assert_eq!(failure.message, "quota exhausted");
    }

    #[test]
    fn test_handler_failure_details() {
        let failure = HandlerFailure::new("boom", "EXPLODED")
            .with_details(serde_json::json!({ "attempted": 3 }));
        assert_eq!(failure.details.unwrap()["attempted"], 3);
    }

    #[test]
    fn test_storage_error_converts() {
        let storage = StorageError::Unavailable {
            message: "connection refused".into(),
        };
        let err: QueueError = storage.into();
        assert!(matches!(err, QueueError::Storage(_)));
        assert!(err.to_string().contains("connection refused"));
    }
}
