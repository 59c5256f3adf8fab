//! Projection of one job's lifecycle onto a consumable event stream.
//!
//! This is the contract the HTTP streaming layer builds SSE responses on:
//! subscribe to a job, forward its events verbatim as JSON values with a
//! `type` field, and synthesize the terminal event when the job is already
//! terminal at subscription time. The combination of registry delivery and
//! synthesis yields **at most one terminal event per stream**, enforced by
//! an atomic swap shared between the observer callbacks and the
//! synthesizer.
//!
//! The transport itself is out of scope; [`JobEventStream`] implements
//! `futures::Stream`, so an HTTP layer maps it straight onto its SSE
//! response type.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::JobStatus;
use crate::service::QueueService;
use crate::subscription::{JobObserver, Unsubscribe};

/// Stream of JSON lifecycle events for one job.
///
/// Dropping the stream releases the underlying subscription.
pub struct JobEventStream {
    rx: mpsc::UnboundedReceiver<serde_json::Value>,
    _subscription: Unsubscribe,
}

impl JobEventStream {
    /// Receive the next event, or `None` once the stream is exhausted.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }
}

impl Stream for JobEventStream {
    type Item = serde_json::Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for JobEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEventStream").finish_non_exhaustive()
    }
}

/// Subscribe to a job's lifecycle events as a stream.
///
/// If the job is already terminal, the stream immediately carries one
/// synthesized terminal event built from the job record. Unknown job ids
/// return [`QueueError::NotFound`].
pub async fn subscribe_job_events(
    service: &QueueService,
    job_id: Uuid,
) -> Result<JobEventStream, QueueError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let terminal_seen = Arc::new(AtomicBool::new(false));

    let observer = JobObserver::new()
        .on_progress({
            let tx = tx.clone();
            move |percent, message| {
                let _ = tx.send(json!({
                    "type": "job:progress",
                    "job_id": job_id,
                    "progress": percent,
                    "message": message,
                }));
            }
        })
        .on_completed({
            let tx = tx.clone();
            let seen = terminal_seen.clone();
            move |result| {
                if !seen.swap(true, Ordering::SeqCst) {
                    let _ = tx.send(json!({
                        "type": "job:completed",
                        "job_id": job_id,
                        "result": result,
                    }));
                }
            }
        })
        .on_failed({
            let tx = tx.clone();
            let seen = terminal_seen.clone();
            move |error| {
                if !seen.swap(true, Ordering::SeqCst) {
                    let _ = tx.send(json!({
                        "type": "job:failed",
                        "job_id": job_id,
                        "error": error,
                    }));
                }
            }
        })
        .on_cancelled({
            let tx = tx.clone();
            let seen = terminal_seen.clone();
            move |reason| {
                if !seen.swap(true, Ordering::SeqCst) {
                    let _ = tx.send(json!({
                        "type": "job:cancelled",
                        "job_id": job_id,
                        "reason": reason,
                    }));
                }
            }
        });

    // Subscribe first, then read: a terminal transition landing between
    // the two is delivered by the registry, and the atomic swap keeps the
    // synthesized copy from doubling it.
    let subscription = service.subscribe(job_id, observer);
    let job = service
        .get_job(job_id, None)
        .await?
        .ok_or(QueueError::NotFound { id: job_id })?;

    if job.status.is_terminal() && !terminal_seen.swap(true, Ordering::SeqCst) {
        let event = match job.status {
            JobStatus::Completed => json!({
                "type": "job:completed",
                "job_id": job_id,
                "result": job.result.unwrap_or(serde_json::Value::Null),
            }),
            JobStatus::Failed => json!({
                "type": "job:failed",
                "job_id": job_id,
                "error": job.error,
            }),
            _ => json!({
                "type": "job:cancelled",
                "job_id": job_id,
                "reason": serde_json::Value::Null,
            }),
        };
        let _ = tx.send(event);
    }

    Ok(JobEventStream {
        rx,
        _subscription: subscription,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::AddOptions;
    use crate::worker::{QueueConfig, StopOptions};
    use std::time::Duration;

    async fn completed_job(service: &crate::QueueService) -> Uuid {
        let id = service
            .add("q", "ok", serde_json::json!({"n": 1}), AddOptions::default())
            .await
            .unwrap();
        service.start_all();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let job = service.get_job(id, None).await.unwrap().unwrap();
            if job.is_terminal() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job did not finish");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        id
    }

    fn build_service() -> crate::QueueService {
        crate::QueueService::builder()
            .with_queue("q", QueueConfig::default().with_concurrency(1))
            .with_handler("q", "ok", |ctx| async move {
                ctx.progress(50, Some("halfway"));
                Ok(serde_json::json!({ "done": true }))
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_stream_forwards_live_events() {
        let service = build_service();
        let id = service
            .add("q", "ok", serde_json::Value::Null, AddOptions::default())
            .await
            .unwrap();

        let mut stream = subscribe_job_events(&service, id).await.unwrap();
        service.start_all();

        let first = tokio::time::timeout(Duration::from_secs(2), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first["type"], "job:progress");
        assert_eq!(first["progress"], 50);
        assert_eq!(first["message"], "halfway");

        let second = tokio::time::timeout(Duration::from_secs(2), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second["type"], "job:completed");
        assert_eq!(second["result"]["done"], true);

        service.stop_all(StopOptions::default()).await;
    }

    #[tokio::test]
    async fn test_terminal_job_synthesizes_exactly_one_event() {
        let service = build_service();
        let id = completed_job(&service).await;

        let mut stream = subscribe_job_events(&service, id).await.unwrap();
        let event = stream.recv().await.unwrap();
        assert_eq!(event["type"], "job:completed");
        assert_eq!(event["result"]["done"], true);

        // Nothing further arrives.
        let nothing = tokio::time::timeout(Duration::from_millis(50), stream.recv()).await;
        assert!(nothing.is_err());

        service.stop_all(StopOptions::default()).await;
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let service = build_service();
        let err = subscribe_job_events(&service, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound { .. }));
    }
}
