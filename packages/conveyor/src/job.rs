//! Job model for background work items.
//!
//! A [`Job`] is an opaque-payload work item owned by exactly one named
//! queue. The engine drives it through the status state machine below;
//! `data` and `result` are never inspected.
//!
//! ```text
//! queued ──► running ──► completed
//!   │           │ ├────► failed      (retries exhausted)
//!   │           │ ├────► queued      (retry pending)
//!   │           │ └────► cancelled
//!   └─────────────────► cancelled
//! ```
//!
//! Terminal states (`completed`, `failed`, `cancelled`) are absorbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Stable error codes written into [`JobError::code`].
pub mod codes {
    /// Handler returned an error without a stable code of its own.
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
    /// The attempt exceeded the job's per-attempt timeout.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// No handler is registered for `(queue_name, job_type)`.
    pub const NO_HANDLER: &str = "NO_HANDLER";
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether this status is absorbing (no transitions leave it).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine permits a transition to `next`.
    ///
    /// Self-transitions are not transitions; callers that patch a job
    /// without changing its status skip this check.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)
                | (Running, Cancelled)
        )
    }

    /// The wire name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Stable ordinal used when sorting job listings by status.
    pub(crate) fn ordinal(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Completed => 2,
            JobStatus::Failed => 3,
            JobStatus::Cancelled => 4,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Error record
// ============================================================================

/// Normalized failure record stored on a failed job.
///
/// Handler-provided codes are preserved; [`codes::EXECUTION_ERROR`] is only
/// the default when the handler supplied none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Human-readable failure message.
    pub message: String,
    /// Stable error code.
    pub code: String,
    /// Optional structured details, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl JobError {
    /// Create an error record with an explicit code.
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            details: None,
        }
    }

    /// A generic handler failure (`EXECUTION_ERROR`).
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(message, codes::EXECUTION_ERROR)
    }

    /// An attempt-timeout failure (`TIMEOUT`).
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            format!("attempt exceeded timeout of {timeout_ms}ms"),
            codes::TIMEOUT,
        )
    }

    /// A missing-handler failure (`NO_HANDLER`).
    pub fn no_handler(queue_name: &str, job_type: &str) -> Self {
        Self::new(
            format!("no handler registered for {job_type} on queue {queue_name}"),
            codes::NO_HANDLER,
        )
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

// ============================================================================
// Job
// ============================================================================

/// A work item with an opaque payload.
///
/// Construct via the builder; queue-level defaults for `priority`,
/// `max_retries` and `timeout_ms` are filled in by the service at
/// submission.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    // Identity
    pub queue_name: String,
    pub job_type: String,

    // Payload (opaque to the engine)
    #[builder(default = serde_json::Value::Null)]
    pub data: serde_json::Value,

    // State
    #[builder(default)]
    pub status: JobStatus,
    /// Higher runs earlier; ties break FIFO on `queued_at`.
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = 0)]
    pub progress: u8,
    #[builder(default, setter(strip_option))]
    pub progress_message: Option<String>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub queued_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    /// Do not dispatch before this instant (retry backoff, scheduled runs).
    #[builder(default, setter(strip_option))]
    pub not_before: Option<DateTime<Utc>>,

    // Execution settings
    /// Failed attempts already spent.
    #[builder(default = 0)]
    pub retries: u32,
    #[builder(default = 3)]
    pub max_retries: u32,
    /// Per-attempt wall-clock budget.
    #[builder(default = 30_000)]
    pub timeout_ms: u64,

    // Outcome
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub error: Option<JobError>,

    // Submission idempotency
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,

    // Caller-opaque key/value map
    #[builder(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// The 1-based attempt number the next execution would be.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    /// Whether the job has reached an absorbing status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
