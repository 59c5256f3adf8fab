//! Pluggable persistence for jobs.
//!
//! The engine never assumes a specific backend: everything it needs is the
//! [`Storage`] capability. The default [`MemoryStorage`] adapter keeps jobs
//! in process memory with fine-grained locking — a concurrent job index
//! plus one mutexed `{heap, stats}` slot per queue. Adapters backed by a
//! database implement the same contract.
//!
//! # Guarantees expected by the engine
//!
//! - `dequeue` hands a job to exactly one caller (no duplicate dispatch
//!   in-process)
//! - `update_job` is observable atomically by subsequent reads in the same
//!   process, validates status transitions, and adjusts stats with the
//!   write
//! - stats are incrementally maintained, never recomputed per call
//! - a job whose status leaves `queued` also leaves the queue's heap, and
//!   `enqueue` of a known id puts it back (retry requeue is an upsert)
//!
//! Operations may fail with [`StorageError::Unavailable`]; the engine
//! treats that as retryable at the dispatch and update sites.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::heap::PriorityQueue;
use crate::job::{Job, JobError, JobStatus};

/// Errors from job storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend is transiently unreachable. Retryable.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// The underlying failure message.
        message: String,
    },

    /// The targeted job does not exist.
    #[error("job {id} not found in storage")]
    NotFound {
        /// The missing job id.
        id: Uuid,
    },

    /// A patch requested a status transition the state machine forbids.
    ///
    /// Terminal states are absorbing; a lost race (e.g. cancel vs.
    /// dispatch) surfaces here and the loser backs off.
    #[error("invalid status transition {from} -> {to} for job {id}")]
    InvalidTransition {
        /// The job whose transition was rejected.
        id: Uuid,
        /// Status at the time of the write.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

// ============================================================================
// Stats
// ============================================================================

/// Per-queue job counts, maintained incrementally on every mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    fn slot_mut(&mut self, status: JobStatus) -> &mut u64 {
        match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }

    /// Count for a single status.
    pub fn for_status(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    fn record_added(&mut self, status: JobStatus) {
        self.total += 1;
        *self.slot_mut(status) += 1;
    }

    fn record_transition(&mut self, from: JobStatus, to: JobStatus) {
        let old = self.slot_mut(from);
        *old = old.saturating_sub(1);
        *self.slot_mut(to) += 1;
    }

    fn record_removed(&mut self, status: JobStatus) {
        self.total = self.total.saturating_sub(1);
        let slot = self.slot_mut(status);
        *slot = slot.saturating_sub(1);
    }
}

// ============================================================================
// Listing
// ============================================================================

/// Sort key for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    QueuedAt,
    Priority,
    Status,
}

/// Sort direction for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Filter, sort, and pagination options for [`Storage::list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl ListFilter {
    /// Filter to a single status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter to a single job type.
    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Page window.
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Sort key and direction.
    pub fn sorted(mut self, by: SortBy, order: SortOrder) -> Self {
        self.sort_by = by;
        self.sort_order = order;
        self
    }
}

// ============================================================================
// Patch
// ============================================================================

/// Partial update applied by [`Storage::update_job`].
///
/// Built through the intent-named constructors so call sites read as state
/// machine steps rather than field soup.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    /// `Some(None)` clears the message (attempt reset).
    pub progress_message: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the dispatch hold.
    pub not_before: Option<Option<DateTime<Utc>>>,
    pub retries: Option<u32>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
}

impl JobPatch {
    /// `queued -> running`: stamp `started_at` (first transition only) and
    /// reset attempt progress.
    pub fn running(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Running),
            started_at: Some(now),
            progress: Some(0),
            progress_message: Some(None),
            ..Default::default()
        }
    }

    /// In-attempt progress update.
    pub fn progress(percent: u8, message: Option<String>) -> Self {
        Self {
            progress: Some(percent),
            progress_message: Some(message),
            ..Default::default()
        }
    }

    /// `running -> completed` with the handler result.
    pub fn completed(result: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            completed_at: Some(now),
            progress: Some(100),
            result: Some(result),
            ..Default::default()
        }
    }

    /// `running -> failed` with the normalized error and final retry count.
    pub fn failed(error: JobError, retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            completed_at: Some(now),
            retries: Some(retries),
            error: Some(error),
            ..Default::default()
        }
    }

    /// `queued|running -> cancelled`.
    pub fn cancelled(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            completed_at: Some(now),
            ..Default::default()
        }
    }

    /// `running -> queued` for a retry: bump the counter, reset attempt
    /// progress, and hold dispatch until `not_before`.
    pub fn requeued(retries: u32, not_before: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Queued),
            retries: Some(retries),
            progress: Some(0),
            progress_message: Some(None),
            not_before: Some(Some(not_before)),
            ..Default::default()
        }
    }

    fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(progress) = self.progress {
            job.progress = progress.min(100);
        }
        if let Some(message) = &self.progress_message {
            job.progress_message = message.clone();
        }
        if let Some(started_at) = self.started_at {
            // Set on the first queued -> running transition, never cleared.
            if job.started_at.is_none() {
                job.started_at = Some(started_at);
            }
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
        if let Some(not_before) = self.not_before {
            job.not_before = not_before;
        }
        if let Some(retries) = self.retries {
            job.retries = retries;
        }
        if let Some(result) = &self.result {
            job.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            job.error = Some(error.clone());
        }
    }
}

// ============================================================================
// Storage trait
// ============================================================================

/// Capability for persisting and retrieving jobs.
///
/// Implementations must be safe for concurrent calls from multiple queues.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Place a job in its queue: index by id, heap by priority, adjust
    /// stats. Re-enqueueing a known id (retry requeue) is an upsert.
    async fn enqueue(&self, queue_name: &str, job: Job) -> StorageResult<()>;

    /// Remove and return the highest-priority eligible queued job.
    async fn dequeue(&self, queue_name: &str) -> StorageResult<Option<Job>>;

    /// The highest-priority eligible queued job, without removing it.
    async fn peek(&self, queue_name: &str) -> StorageResult<Option<Job>>;

    /// Look up a job by id, optionally scoped to a queue.
    async fn get_job(&self, id: Uuid, queue_name: Option<&str>) -> StorageResult<Option<Job>>;

    /// List a queue's jobs with filtering, sorting, and pagination.
    async fn list_jobs(&self, queue_name: &str, filter: ListFilter) -> StorageResult<Vec<Job>>;

    /// Apply a partial update. Status changes are validated against the
    /// state machine and adjust stats atomically with the write. Returns
    /// the updated record.
    async fn update_job(&self, id: Uuid, patch: JobPatch) -> StorageResult<Job>;

    /// Delete a job outright. Returns whether it existed.
    async fn remove_job(&self, id: Uuid) -> StorageResult<bool>;

    /// Incrementally-maintained counts for a queue.
    async fn get_stats(&self, queue_name: &str) -> StorageResult<QueueStats>;

    /// A non-terminal job submitted with this idempotency key, if any.
    async fn find_by_idempotency_key(
        &self,
        queue_name: &str,
        key: &str,
    ) -> StorageResult<Option<Job>>;

    /// When the next held-back entry becomes eligible (sleep optimization
    /// for dispatcher parking). `None` means nothing is scheduled.
    async fn next_run_at(&self, _queue_name: &str) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(None)
    }

    /// Open backend resources. The default adapter is a no-op.
    async fn connect(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Release backend resources. The default adapter is a no-op.
    async fn disconnect(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Probe backend liveness. The default adapter is a no-op.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

// ============================================================================
// In-memory adapter
// ============================================================================

#[derive(Default)]
struct QueueSlot {
    heap: PriorityQueue,
    stats: QueueStats,
}

/// Default in-process storage adapter.
///
/// Jobs live in a concurrent index; each queue owns a mutexed slot holding
/// its priority heap and stats, so no operation holds more than one lock
/// at a time.
#[derive(Default)]
pub struct MemoryStorage {
    jobs: DashMap<Uuid, Job>,
    slots: DashMap<String, Mutex<QueueSlot>>,
}

impl MemoryStorage {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slot<R>(&self, queue_name: &str, f: impl FnOnce(&mut QueueSlot) -> R) -> R {
        let slot = self
            .slots
            .entry(queue_name.to_string())
            .or_insert_with(|| Mutex::new(QueueSlot::default()));
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("jobs", &self.jobs.len())
            .field("queues", &self.slots.len())
            .finish()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn enqueue(&self, queue_name: &str, job: Job) -> StorageResult<()> {
        let id = job.id;
        let priority = job.priority;
        let not_before = job.not_before;
        let previous = self.jobs.insert(id, job);

        self.with_slot(queue_name, |slot| {
            match previous {
                None => slot.stats.record_added(JobStatus::Queued),
                Some(prev) if prev.status != JobStatus::Queued => {
                    slot.stats.record_transition(prev.status, JobStatus::Queued);
                }
                Some(_) => {}
            }
            slot.heap
                .push(id, priority, not_before)
                .map_err(|e| StorageError::Unavailable {
                    message: e.to_string(),
                })
        })
    }

    async fn dequeue(&self, queue_name: &str) -> StorageResult<Option<Job>> {
        loop {
            let Some(id) = self.with_slot(queue_name, |slot| slot.heap.pop()) else {
                return Ok(None);
            };
            // A raced remove_job can leave a popped id without a record;
            // skip it and try the next entry.
            if let Some(job) = self.jobs.get(&id) {
                return Ok(Some(job.clone()));
            }
        }
    }

    async fn peek(&self, queue_name: &str) -> StorageResult<Option<Job>> {
        let Some(id) = self.with_slot(queue_name, |slot| slot.heap.peek()) else {
            return Ok(None);
        };
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn get_job(&self, id: Uuid, queue_name: Option<&str>) -> StorageResult<Option<Job>> {
        Ok(self
            .jobs
            .get(&id)
            .filter(|job| queue_name.is_none_or(|q| job.queue_name == q))
            .map(|j| j.clone()))
    }

    async fn list_jobs(&self, queue_name: &str, filter: ListFilter) -> StorageResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.queue_name == queue_name)
            .filter(|entry| filter.status.is_none_or(|s| entry.status == s))
            .filter(|entry| {
                filter
                    .job_type
                    .as_deref()
                    .is_none_or(|t| entry.job_type == t)
            })
            .map(|entry| entry.clone())
            .collect();

        jobs.sort_by(|a, b| {
            let ordering = match filter.sort_by {
                SortBy::QueuedAt => a.queued_at.cmp(&b.queued_at),
                SortBy::Priority => a.priority.cmp(&b.priority),
                SortBy::Status => a.status.ordinal().cmp(&b.status.ordinal()),
            };
            let ordering = ordering.then_with(|| a.queued_at.cmp(&b.queued_at));
            match filter.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let jobs = jobs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(jobs)
    }

    async fn update_job(&self, id: Uuid, patch: JobPatch) -> StorageResult<Job> {
        let (queue_name, old_status, new_status, updated) = {
            let mut entry = self
                .jobs
                .get_mut(&id)
                .ok_or(StorageError::NotFound { id })?;

            let old_status = entry.status;
            if let Some(next) = patch.status {
                if next != old_status && !old_status.can_transition_to(next) {
                    return Err(StorageError::InvalidTransition {
                        id,
                        from: old_status,
                        to: next,
                    });
                }
            }

            patch.apply(&mut entry);
            (
                entry.queue_name.clone(),
                old_status,
                entry.status,
                entry.clone(),
            )
        };

        if new_status != old_status {
            self.with_slot(&queue_name, |slot| {
                slot.stats.record_transition(old_status, new_status);
                // Leaving `queued` means leaving the heap; re-entry happens
                // through enqueue.
                if old_status == JobStatus::Queued {
                    slot.heap.remove(id);
                }
            });
        }

        Ok(updated)
    }

    async fn remove_job(&self, id: Uuid) -> StorageResult<bool> {
        let Some((_, job)) = self.jobs.remove(&id) else {
            return Ok(false);
        };
        self.with_slot(&job.queue_name, |slot| {
            if job.status == JobStatus::Queued {
                slot.heap.remove(id);
            }
            slot.stats.record_removed(job.status);
        });
        Ok(true)
    }

    async fn get_stats(&self, queue_name: &str) -> StorageResult<QueueStats> {
        Ok(self.with_slot(queue_name, |slot| slot.stats))
    }

    async fn find_by_idempotency_key(
        &self,
        queue_name: &str,
        key: &str,
    ) -> StorageResult<Option<Job>> {
        // Full scan; acceptable for the in-process adapter. Database
        // adapters index this column.
        Ok(self
            .jobs
            .iter()
            .find(|entry| {
                entry.queue_name == queue_name
                    && !entry.status.is_terminal()
                    && entry.idempotency_key.as_deref() == Some(key)
            })
            .map(|entry| entry.clone()))
    }

    async fn next_run_at(&self, queue_name: &str) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self.with_slot(queue_name, |slot| slot.heap.next_run_at()))
    }
}
