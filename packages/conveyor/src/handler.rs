//! Handler registration and the context handed to running jobs.
//!
//! A handler is an async closure resolving `(queue_name, job_type)`. It
//! receives a [`JobContext`] — intentionally narrow: the payload, identity
//! fields, a progress reporter, and the cancellation signal. Nothing else.
//! Handlers return a `serde_json::Value` result or an error; retry and
//! terminal classification belong to the worker, not the handler.
//!
//! Registration is idempotent (re-registering replaces the prior entry)
//! and may happen before or after queues start. The registry keeps its map
//! copy-on-write: registration clones and swaps, the dispatch hot path
//! takes a snapshot without blocking writers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What a handler returns: an opaque result value or an error.
///
/// Errors carrying a [`crate::HandlerFailure`] keep their stable code
/// through normalization.
pub type HandlerResult = anyhow::Result<serde_json::Value>;

pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
pub(crate) type BoxedHandler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;

// ============================================================================
// Progress plumbing
// ============================================================================

/// Latest progress value reported by a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ProgressUpdate {
    pub percent: u8,
    pub message: Option<String>,
}

/// Handler-side progress reporter.
///
/// Values are clamped to [0, 100] and kept monotonically non-decreasing
/// within the attempt. Reports flow through a watch channel, so a burst of
/// calls coalesces to the latest value while the worker's storage write is
/// in flight.
pub(crate) struct ProgressHandle {
    tx: watch::Sender<ProgressUpdate>,
    high_water: AtomicU8,
}

impl ProgressHandle {
    pub(crate) fn channel() -> (Self, watch::Receiver<ProgressUpdate>) {
        let (tx, rx) = watch::channel(ProgressUpdate::default());
        (
            Self {
                tx,
                high_water: AtomicU8::new(0),
            },
            rx,
        )
    }

    fn report(&self, percent: u8, message: Option<&str>) {
        let percent = percent.min(100);
        let previous = self.high_water.fetch_max(percent, Ordering::SeqCst);
        if percent < previous {
            return;
        }
        self.tx.send_replace(ProgressUpdate {
            percent,
            message: message.map(str::to_owned),
        });
    }
}

// ============================================================================
// Job context
// ============================================================================

/// Context passed to a handler for one attempt.
///
/// # Narrow API
///
/// Handlers see the payload and report progress; they do not see storage,
/// other jobs, or the queue. Cancellation and timeout arrive through the
/// same signal — poll [`JobContext::is_cancelled`] or await
/// [`JobContext::cancellation`] at natural checkpoints.
pub struct JobContext {
    job_id: Uuid,
    queue_name: Arc<str>,
    job_type: Arc<str>,
    attempt: u32,
    data: serde_json::Value,
    progress: ProgressHandle,
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        job_id: Uuid,
        queue_name: Arc<str>,
        job_type: Arc<str>,
        attempt: u32,
        data: serde_json::Value,
        progress: ProgressHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            queue_name,
            job_type,
            attempt,
            data,
            progress,
            cancel,
        }
    }

    /// The job being executed.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// The queue that owns the job.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// The job type that resolved this handler.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// 1-based attempt number (first retry is attempt 2).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The caller-opaque payload.
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Report progress for this attempt.
    ///
    /// Clamped to [0, 100]; regressions are ignored. Each effective call
    /// is persisted and fanned out to subscribers, coalesced to the latest
    /// value under storage latency.
    pub fn progress(&self, percent: u8, message: Option<&str>) {
        self.progress.report(percent, message);
    }

    /// Whether cancellation (explicit or timeout) was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The cancellation signal, for `select!`-style cooperative handlers.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("queue_name", &self.queue_name)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Registry
// ============================================================================

type HandlerKey = (String, String);

/// Maps `(queue_name, job_type)` to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Arc<HashMap<HandlerKey, BoxedHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Replaces any prior entry for the pair.
    pub fn register<F, Fut>(&self, queue_name: &str, job_type: &str, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: BoxedHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        let mut guard = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut next = HashMap::clone(&guard);
        next.insert((queue_name.to_string(), job_type.to_string()), boxed);
        *guard = Arc::new(next);
    }

    /// Resolve the handler for a pair, if registered.
    pub(crate) fn lookup(&self, queue_name: &str, job_type: &str) -> Option<BoxedHandler> {
        let snapshot = {
            let guard = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };
        snapshot
            .get(&(queue_name.to_string(), job_type.to_string()))
            .cloned()
    }

    /// Whether a handler exists for the pair.
    pub fn is_registered(&self, queue_name: &str, job_type: &str) -> bool {
        self.lookup(queue_name, job_type).is_some()
    }

    /// Job types registered for a queue.
    pub fn registered_types(&self, queue_name: &str) -> Vec<String> {
        let snapshot = {
            let guard = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };
        snapshot
            .keys()
            .filter(|(q, _)| q == queue_name)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("HandlerRegistry")
            .field("registered", &guard.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with(progress: ProgressHandle) -> JobContext {
        JobContext::new(
            Uuid::new_v4(),
            Arc::from("q"),
            Arc::from("t"),
            1,
            serde_json::json!({"n": 7}),
            progress,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = HandlerRegistry::new();
        registry.register("emails", "email:send", |ctx: JobContext| async move {
            Ok(serde_json::json!({ "echo": ctx.data()["n"] }))
        });

        let handler = registry.lookup("emails", "email:send").unwrap();
        let (progress, _rx) = ProgressHandle::channel();
        let result = (handler.as_ref())(context_with(progress)).await.unwrap();
        assert_eq!(result["echo"], 7);
    }

    #[test]
    fn test_lookup_missing() {
        let registry = HandlerRegistry::new();
        assert!(registry.lookup("q", "missing").is_none());
        assert!(!registry.is_registered("q", "missing"));
    }

    #[tokio::test]
    async fn test_reregistration_replaces() {
        let registry = HandlerRegistry::new();
        registry.register("q", "t", |_| async { Ok(serde_json::json!("first")) });
        registry.register("q", "t", |_| async { Ok(serde_json::json!("second")) });

        let handler = registry.lookup("q", "t").unwrap();
        let (progress, _rx) = ProgressHandle::channel();
        let result = (handler.as_ref())(context_with(progress)).await.unwrap();
        assert_eq!(result, "second");
        assert_eq!(registry.registered_types("q"), vec!["t".to_string()]);
    }

    #[test]
    fn test_registered_types_scoped_to_queue() {
        let registry = HandlerRegistry::new();
        registry.register("a", "x", |_| async { Ok(serde_json::Value::Null) });
        registry.register("b", "y", |_| async { Ok(serde_json::Value::Null) });

        assert_eq!(registry.registered_types("a"), vec!["x".to_string()]);
    }

    #[test]
    fn test_progress_clamps_and_stays_monotonic() {
        let (handle, rx) = ProgressHandle::channel();

        handle.report(150, None);
        assert_eq!(rx.borrow().percent, 100);

        // Regression is ignored.
        handle.report(40, Some("late"));
        assert_eq!(rx.borrow().percent, 100);
        assert_eq!(rx.borrow().message, None);
    }

    #[test]
    fn test_progress_coalesces_to_latest() {
        let (handle, mut rx) = ProgressHandle::channel();

        handle.report(10, None);
        handle.report(20, None);
        handle.report(30, Some("nearly"));

        // A slow consumer sees only the latest value.
        assert!(rx.has_changed().unwrap());
        let latest = rx.borrow_and_update().clone();
        assert_eq!(latest.percent, 30);
        assert_eq!(latest.message.as_deref(), Some("nearly"));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_context_cancellation_flag() {
        let (progress, _rx) = ProgressHandle::channel();
        let ctx = context_with(progress);
        assert!(!ctx.is_cancelled());

        ctx.cancellation().cancel();
        assert!(ctx.is_cancelled());
    }
}
