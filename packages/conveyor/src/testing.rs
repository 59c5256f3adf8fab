//! Testing utilities (feature-gated).
//!
//! - [`RecordingObserver`] — collects every lifecycle event a job emits
//! - [`FlakyStorage`] — wraps [`MemoryStorage`] and fails the first N
//!   dequeues to exercise the dispatcher's unavailability backoff

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::job::{Job, JobError};
use crate::storage::{
    JobPatch, ListFilter, MemoryStorage, QueueStats, Storage, StorageError, StorageResult,
};
use crate::subscription::JobObserver;

/// One event seen by a [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    Progress(u8, Option<String>),
    Completed(serde_json::Value),
    Failed(JobError),
    Cancelled(Option<String>),
}

impl ObservedEvent {
    /// Whether this is a terminal event.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ObservedEvent::Progress(..))
    }
}

/// Observer that records everything it sees, for assertions.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ObservedEvent>>>,
}

impl RecordingObserver {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a [`JobObserver`] wired to this recorder.
    pub fn observer(&self) -> JobObserver {
        let progress = self.events.clone();
        let completed = self.events.clone();
        let failed = self.events.clone();
        let cancelled = self.events.clone();
        JobObserver::new()
            .on_progress(move |p, m| {
                progress
                    .lock()
                    .unwrap()
                    .push(ObservedEvent::Progress(p, m.map(str::to_owned)));
            })
            .on_completed(move |result| {
                completed
                    .lock()
                    .unwrap()
                    .push(ObservedEvent::Completed(result.clone()));
            })
            .on_failed(move |error| {
                failed
                    .lock()
                    .unwrap()
                    .push(ObservedEvent::Failed(error.clone()));
            })
            .on_cancelled(move |reason| {
                cancelled
                    .lock()
                    .unwrap()
                    .push(ObservedEvent::Cancelled(reason.map(str::to_owned)));
            })
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Number of terminal events recorded.
    pub fn terminal_count(&self) -> usize {
        self.events().iter().filter(|e| e.is_terminal()).count()
    }

    /// Progress percentages in the order they arrived.
    pub fn progress_values(&self) -> Vec<u8> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::Progress(p, _) => Some(*p),
                _ => None,
            })
            .collect()
    }

    /// Wait until a terminal event arrives, up to `timeout`.
    pub async fn wait_for_terminal(&self, timeout: Duration) -> Option<ObservedEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.events().into_iter().find(|e| e.is_terminal()) {
                return Some(event);
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Storage wrapper that fails the first N dequeues with
/// [`StorageError::Unavailable`], then behaves normally.
pub struct FlakyStorage {
    inner: MemoryStorage,
    dequeue_failures: AtomicU32,
}

impl FlakyStorage {
    /// Fail the first `failures` dequeues.
    pub fn failing_dequeues(failures: u32) -> Self {
        Self {
            inner: MemoryStorage::new(),
            dequeue_failures: AtomicU32::new(failures),
        }
    }

    /// Failures not yet consumed.
    pub fn remaining_failures(&self) -> u32 {
        self.dequeue_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn enqueue(&self, queue_name: &str, job: Job) -> StorageResult<()> {
        self.inner.enqueue(queue_name, job).await
    }

    async fn dequeue(&self, queue_name: &str) -> StorageResult<Option<Job>> {
        let remaining = self.dequeue_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .dequeue_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StorageError::Unavailable {
                message: "injected failure".into(),
            });
        }
        self.inner.dequeue(queue_name).await
    }

    async fn peek(&self, queue_name: &str) -> StorageResult<Option<Job>> {
        self.inner.peek(queue_name).await
    }

    async fn get_job(&self, id: Uuid, queue_name: Option<&str>) -> StorageResult<Option<Job>> {
        self.inner.get_job(id, queue_name).await
    }

    async fn list_jobs(&self, queue_name: &str, filter: ListFilter) -> StorageResult<Vec<Job>> {
        self.inner.list_jobs(queue_name, filter).await
    }

    async fn update_job(&self, id: Uuid, patch: JobPatch) -> StorageResult<Job> {
        self.inner.update_job(id, patch).await
    }

    async fn remove_job(&self, id: Uuid) -> StorageResult<bool> {
        self.inner.remove_job(id).await
    }

    async fn get_stats(&self, queue_name: &str) -> StorageResult<QueueStats> {
        self.inner.get_stats(queue_name).await
    }

    async fn find_by_idempotency_key(
        &self,
        queue_name: &str,
        key: &str,
    ) -> StorageResult<Option<Job>> {
        self.inner.find_by_idempotency_key(queue_name, key).await
    }

    async fn next_run_at(&self, queue_name: &str) -> StorageResult<Option<DateTime<Utc>>> {
        self.inner.next_run_at(queue_name).await
    }
}
