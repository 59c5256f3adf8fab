//! Lifecycle events and the optional external event bridge.
//!
//! [`JobEvent`]s are facts about the job lifecycle, not commands. Locally
//! they reach observers through the subscription registry; when the
//! service is configured with a server id and an [`EventSink`], the
//! [`EventBridge`] additionally republishes each event to the external bus
//! in a canonical envelope for cross-instance visibility.
//!
//! # Guarantees
//!
//! - External publishing is fire-and-forget: failures are logged and never
//!   propagate into workers or observers
//! - The local subscription path is authoritative; the bridge is advisory

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::job::{Job, JobError};

/// A fact about the job lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobEvent {
    /// A job was accepted into a queue.
    Queued {
        job_id: Uuid,
        queue_name: String,
        job_type: String,
        priority: i32,
    },

    /// A worker began an attempt.
    Started {
        job_id: Uuid,
        queue_name: String,
        job_type: String,
        attempt: u32,
    },

    /// The running attempt reported progress.
    Progress {
        job_id: Uuid,
        queue_name: String,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The job completed with a handler result.
    Completed {
        job_id: Uuid,
        queue_name: String,
        result: serde_json::Value,
    },

    /// Retries are exhausted; the job failed.
    Failed {
        job_id: Uuid,
        queue_name: String,
        error: JobError,
    },

    /// The job was cancelled.
    Cancelled {
        job_id: Uuid,
        queue_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl JobEvent {
    /// Build the `job:queued` event from a freshly submitted job.
    pub fn queued(job: &Job) -> Self {
        JobEvent::Queued {
            job_id: job.id,
            queue_name: job.queue_name.clone(),
            job_type: job.job_type.clone(),
            priority: job.priority,
        }
    }

    /// The canonical event kind (`job:queued`, `job:progress`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Queued { .. } => "job:queued",
            JobEvent::Started { .. } => "job:started",
            JobEvent::Progress { .. } => "job:progress",
            JobEvent::Completed { .. } => "job:completed",
            JobEvent::Failed { .. } => "job:failed",
            JobEvent::Cancelled { .. } => "job:cancelled",
        }
    }

    /// The job this event concerns.
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Queued { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id, .. } => *job_id,
        }
    }

    /// Wrap the event for the external bus.
    pub fn into_envelope(self, server_id: &str) -> BusEnvelope {
        let kind = self.kind();
        BusEnvelope {
            kind: kind.to_string(),
            data: serde_json::to_value(&self).unwrap_or(serde_json::Value::Null),
            server_id: server_id.to_string(),
            correlation_id: None,
        }
    }
}

/// Canonical envelope published to the external bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Event kind, e.g. `job:completed`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event payload (the [`JobEvent`] fields).
    pub data: serde_json::Value,
    /// Identifies the publishing instance.
    pub server_id: String,
    /// Optional id for tracking related work across instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

/// Capability for publishing envelopes to an external bus.
///
/// Implementations wrap whatever transport the deployment uses (NATS,
/// webhooks, ...). The engine only requires best-effort delivery.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Publish one envelope. Errors are logged by the bridge and dropped.
    async fn publish(&self, envelope: BusEnvelope) -> anyhow::Result<()>;
}

/// Republishes lifecycle events to an [`EventSink`].
///
/// Publishes are spawned fire-and-forget so a slow or failing bus never
/// blocks state transitions.
#[derive(Clone)]
pub struct EventBridge {
    sink: Arc<dyn EventSink>,
    server_id: Arc<str>,
}

impl EventBridge {
    /// Create a bridge publishing on behalf of `server_id`.
    pub fn new(server_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            server_id: Arc::from(server_id.into()),
        }
    }

    /// Publish an event to the external bus, best-effort.
    pub fn publish(&self, event: JobEvent) {
        let job_id = event.job_id();
        let kind = event.kind();
        let envelope = event.into_envelope(&self.server_id);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.publish(envelope).await {
                warn!(job_id = %job_id, event = kind, error = %e, "external event publish failed");
            }
        });
    }
}

impl std::fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBridge")
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingSink {
        envelopes: Mutex<Vec<BusEnvelope>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, envelope: BusEnvelope) -> anyhow::Result<()> {
            self.envelopes.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn publish(&self, _envelope: BusEnvelope) -> anyhow::Result<()> {
            anyhow::bail!("bus unreachable")
        }
    }

    #[test]
    fn test_event_kinds() {
        let id = Uuid::new_v4();
        let event = JobEvent::Progress {
            job_id: id,
            queue_name: "q".into(),
            progress: 40,
            message: None,
        };
        assert_eq!(event.kind(), "job:progress");
        assert_eq!(event.job_id(), id);
    }

    #[test]
    fn test_envelope_shape() {
        let event = JobEvent::Completed {
            job_id: Uuid::new_v4(),
            queue_name: "emails".into(),
            result: serde_json::json!({ "sent": true }),
        };
        let envelope = event.into_envelope("server-1");

        assert_eq!(envelope.kind, "job:completed");
        assert_eq!(envelope.server_id, "server-1");
        assert_eq!(envelope.data["queue_name"], "emails");
        assert_eq!(envelope.data["result"]["sent"], true);

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "job:completed");
        assert!(json.get("correlation_id").is_none());
    }

    #[test]
    fn test_progress_message_omitted_when_none() {
        let event = JobEvent::Progress {
            job_id: Uuid::new_v4(),
            queue_name: "q".into(),
            progress: 10,
            message: None,
        };
        let data = serde_json::to_value(&event).unwrap();
        assert!(data.get("message").is_none());
    }

    #[tokio::test]
    async fn test_bridge_publishes_to_sink() {
        let sink = Arc::new(RecordingSink {
            envelopes: Mutex::new(Vec::new()),
        });
        let bridge = EventBridge::new("server-1", sink.clone());

        let job = Job::builder().queue_name("q").job_type("t").build();
        bridge.publish(JobEvent::queued(&job));

        // Publishing is fire-and-forget; give the spawned task a moment.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let envelopes = sink.envelopes.lock().unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].kind, "job:queued");
        assert_eq!(envelopes[0].server_id, "server-1");
    }

    #[tokio::test]
    async fn test_bridge_swallows_sink_failures() {
        let bridge = EventBridge::new("server-1", Arc::new(FailingSink));
        let job = Job::builder().queue_name("q").job_type("t").build();

        bridge.publish(JobEvent::queued(&job));
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Nothing to assert beyond "no panic, no propagation".
    }
}
