//! Per-job observers for lifecycle events.
//!
//! The [`SubscriptionRegistry`] maps a job id to the observers watching it.
//! Workers publish progress and exactly one terminal event per job; the
//! registry snapshots observers under its lock and invokes callbacks with
//! the lock released, so a slow observer delays only its own job's event
//! path, never dispatch or other jobs.
//!
//! # Guarantees
//!
//! - Observer panics are caught and logged; they never reach the engine
//! - A terminal publish drops the job's observers; later publishes for
//!   that id are no-ops
//! - `unsubscribe` is idempotent and safe after a terminal publish
//!
//! Callbacks are synchronous and expected to be quick — hand off to a
//! channel (see [`crate::stream`]) for anything slow.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use smallvec::SmallVec;
use tracing::warn;
use uuid::Uuid;

use crate::job::JobError;

type ProgressFn = Box<dyn Fn(u8, Option<&str>) + Send + Sync>;
type CompletedFn = Box<dyn Fn(&serde_json::Value) + Send + Sync>;
type FailedFn = Box<dyn Fn(&JobError) + Send + Sync>;
type CancelledFn = Box<dyn Fn(Option<&str>) + Send + Sync>;

/// A set of optional lifecycle callbacks for one job.
#[derive(Default)]
pub struct JobObserver {
    on_progress: Option<ProgressFn>,
    on_completed: Option<CompletedFn>,
    on_failed: Option<FailedFn>,
    on_cancelled: Option<CancelledFn>,
}

impl JobObserver {
    /// Create an observer with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on each progress update `(percent, message)`.
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(u8, Option<&str>) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Called once with the handler result when the job completes.
    pub fn on_completed<F>(mut self, f: F) -> Self
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.on_completed = Some(Box::new(f));
        self
    }

    /// Called once with the normalized error when retries are exhausted.
    pub fn on_failed<F>(mut self, f: F) -> Self
    where
        F: Fn(&JobError) + Send + Sync + 'static,
    {
        self.on_failed = Some(Box::new(f));
        self
    }

    /// Called once when the job is cancelled.
    pub fn on_cancelled<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.on_cancelled = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for JobObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobObserver")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_completed", &self.on_completed.is_some())
            .field("on_failed", &self.on_failed.is_some())
            .field("on_cancelled", &self.on_cancelled.is_some())
            .finish()
    }
}

struct Registration {
    token: u64,
    observer: Arc<JobObserver>,
}

#[derive(Default)]
struct RegistryInner {
    observers: Mutex<HashMap<Uuid, Vec<Registration>>>,
    next_token: AtomicU64,
}

/// Registry of per-job observers.
///
/// Thread-safe and cheaply cloneable; clones share the observer set.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for a job.
    ///
    /// The returned handle unsubscribes on [`Unsubscribe::unsubscribe`] or
    /// on drop, and is a safe no-op once the job published a terminal
    /// event.
    pub fn subscribe(&self, job_id: Uuid, observer: JobObserver) -> Unsubscribe {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(job_id)
            .or_default()
            .push(Registration {
                token,
                observer: Arc::new(observer),
            });
        Unsubscribe {
            registry: Arc::downgrade(&self.inner),
            job_id,
            token,
            released: AtomicBool::new(false),
        }
    }

    /// Number of observers registered for a job.
    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Publish a progress update to a job's observers.
    pub fn publish_progress(&self, job_id: Uuid, percent: u8, message: Option<&str>) {
        let snapshot = self.snapshot(job_id);
        for observer in snapshot {
            if let Some(cb) = &observer.on_progress {
                Self::invoke("on_progress", job_id, || cb(percent, message));
            }
        }
    }

    /// Publish completion and drop the job's observers.
    pub fn publish_completed(&self, job_id: Uuid, result: &serde_json::Value) {
        for observer in self.take(job_id) {
            if let Some(cb) = &observer.on_completed {
                Self::invoke("on_completed", job_id, || cb(result));
            }
        }
    }

    /// Publish failure and drop the job's observers.
    pub fn publish_failed(&self, job_id: Uuid, error: &JobError) {
        for observer in self.take(job_id) {
            if let Some(cb) = &observer.on_failed {
                Self::invoke("on_failed", job_id, || cb(error));
            }
        }
    }

    /// Publish cancellation and drop the job's observers.
    pub fn publish_cancelled(&self, job_id: Uuid, reason: Option<&str>) {
        for observer in self.take(job_id) {
            if let Some(cb) = &observer.on_cancelled {
                Self::invoke("on_cancelled", job_id, || cb(reason));
            }
        }
    }

    /// Snapshot a job's observers without holding the lock during invoke.
    fn snapshot(&self, job_id: Uuid) -> SmallVec<[Arc<JobObserver>; 2]> {
        let guard = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard
            .get(&job_id)
            .map(|regs| regs.iter().map(|r| r.observer.clone()).collect())
            .unwrap_or_default()
    }

    /// Remove and return a job's observers (terminal publish).
    fn take(&self, job_id: Uuid) -> SmallVec<[Arc<JobObserver>; 2]> {
        let mut guard = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard
            .remove(&job_id)
            .map(|regs| regs.into_iter().map(|r| r.observer).collect())
            .unwrap_or_default()
    }

    fn invoke(callback: &'static str, job_id: Uuid, f: impl FnOnce()) {
        if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            warn!(job_id = %job_id, callback, "subscription observer panicked");
        }
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        f.debug_struct("SubscriptionRegistry")
            .field("watched_jobs", &guard.len())
            .finish()
    }
}

/// Handle that releases a subscription.
///
/// Dropping the handle unsubscribes. Both paths are idempotent and safe
/// after the job's terminal publish already dropped the observer.
pub struct Unsubscribe {
    registry: Weak<RegistryInner>,
    job_id: Uuid,
    token: u64,
    released: AtomicBool,
}

impl Unsubscribe {
    /// Remove the observer from the registry.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut guard = inner.observers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(regs) = guard.get_mut(&self.job_id) {
            regs.retain(|r| r.token != self.token);
            if regs.is_empty() {
                guard.remove(&self.job_id);
            }
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("job_id", &self.job_id)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_progress_then_terminal() {
        let registry = SubscriptionRegistry::new();
        let job_id = Uuid::new_v4();
        let progress = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicUsize::new(0));

        let _sub = registry.subscribe(
            job_id,
            JobObserver::new()
                .on_progress({
                    let progress = progress.clone();
                    move |p, _| progress.lock().unwrap().push(p)
                })
                .on_completed({
                    let completed = completed.clone();
                    move |_| {
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                }),
        );

        registry.publish_progress(job_id, 25, None);
        registry.publish_progress(job_id, 75, Some("almost"));
        registry.publish_completed(job_id, &serde_json::json!({"ok": true}));

        assert_eq!(*progress.lock().unwrap(), vec![25, 75]);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminal_publish_drops_observers() {
        let registry = SubscriptionRegistry::new();
        let job_id = Uuid::new_v4();
        let completed = Arc::new(AtomicUsize::new(0));

        let _sub = registry.subscribe(
            job_id,
            JobObserver::new().on_completed({
                let completed = completed.clone();
                move |_| {
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        registry.publish_completed(job_id, &serde_json::Value::Null);
        // Second terminal publish is a no-op.
        registry.publish_completed(job_id, &serde_json::Value::Null);
        registry.publish_failed(job_id, &JobError::execution("late"));

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.subscriber_count(job_id), 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_safe_after_terminal() {
        let registry = SubscriptionRegistry::new();
        let job_id = Uuid::new_v4();

        let sub = registry.subscribe(job_id, JobObserver::new());
        registry.publish_cancelled(job_id, Some("shutdown"));

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = SubscriptionRegistry::new();
        let job_id = Uuid::new_v4();
        let count = Arc::new(AtomicUsize::new(0));

        let sub = registry.subscribe(
            job_id,
            JobObserver::new().on_progress({
                let count = count.clone();
                move |_, _| {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        registry.publish_progress(job_id, 10, None);
        sub.unsubscribe();
        registry.publish_progress(job_id, 20, None);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let registry = SubscriptionRegistry::new();
        let job_id = Uuid::new_v4();

        {
            let _sub = registry.subscribe(job_id, JobObserver::new());
            assert_eq!(registry.subscriber_count(job_id), 1);
        }
        assert_eq!(registry.subscriber_count(job_id), 0);
    }

    #[test]
    fn test_clones_share_observers() {
        let registry = SubscriptionRegistry::new();
        let clone = registry.clone();
        let job_id = Uuid::new_v4();
        let count = Arc::new(AtomicUsize::new(0));

        let _sub = registry.subscribe(
            job_id,
            JobObserver::new().on_progress({
                let count = count.clone();
                move |_, _| {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        clone.publish_progress(job_id, 10, None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multiple_observers_all_receive() {
        let registry = SubscriptionRegistry::new();
        let job_id = Uuid::new_v4();
        let count = Arc::new(AtomicUsize::new(0));

        let subs: Vec<_> = (0..3)
            .map(|_| {
                registry.subscribe(
                    job_id,
                    JobObserver::new().on_failed({
                        let count = count.clone();
                        move |_| {
                            count.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                )
            })
            .collect();

        registry.publish_failed(job_id, &JobError::execution("boom"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        drop(subs);
    }

    #[test]
    fn test_observer_panic_is_contained() {
        let registry = SubscriptionRegistry::new();
        let job_id = Uuid::new_v4();
        let after = Arc::new(AtomicUsize::new(0));

        let _panicking = registry.subscribe(
            job_id,
            JobObserver::new().on_progress(|_, _| panic!("observer bug")),
        );
        let _counting = registry.subscribe(
            job_id,
            JobObserver::new().on_progress({
                let after = after.clone();
                move |_, _| {
                    after.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        registry.publish_progress(job_id, 50, None);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let registry = SubscriptionRegistry::new();
        registry.publish_progress(Uuid::new_v4(), 10, None);
        registry.publish_completed(Uuid::new_v4(), &serde_json::Value::Null);
    }
}
