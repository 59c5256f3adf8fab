//! One named queue: dispatcher loop, bounded worker pool, retry, stop.
//!
//! A [`QueueInstance`] owns the scheduling and execution for a single
//! queue. The dispatcher keeps at most `concurrency` workers in flight,
//! parking when storage is drained and waking on submission, worker
//! completion, cancellation, or stop. Each worker drives one attempt:
//!
//! ```text
//! dequeue ─► queued→running ─► handler(ctx) ─► classify
//!                 │                │              ├─ completed
//!                 │                │              ├─ cancelled
//!    (progress pump: storage + subscribers)       ├─ requeued (retry + backoff)
//!                                                 └─ failed (retries exhausted)
//! ```
//!
//! Timeout and explicit cancellation share one cancellation signal; the
//! worker records which fired and classifies the outcome by that reason.
//! A shutdown interruption writes no terminal state — the job stays
//! `running` in storage and reclaim is operator policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{HandlerFailure, QueueError};
use crate::events::{EventBridge, JobEvent};
use crate::handler::{HandlerRegistry, JobContext, ProgressHandle, ProgressUpdate};
use crate::job::{Job, JobError};
use crate::storage::{JobPatch, Storage, StorageError};
use crate::subscription::SubscriptionRegistry;

const STORAGE_BACKOFF_INITIAL_MS: u64 = 50;
const STORAGE_BACKOFF_CAP_MS: u64 = 5_000;
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;

// ============================================================================
// Configuration
// ============================================================================

/// Per-queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum simultaneously running jobs.
    pub concurrency: usize,
    /// Per-attempt wall-clock budget applied when a submission sets none.
    pub default_timeout_ms: u64,
    /// Retry budget applied when a submission sets none.
    pub default_max_retries: u32,
    /// Base of the retry backoff: `base * 2^(retries-1)`, jittered.
    pub retry_base_ms: u64,
    /// Upper bound on a single retry delay.
    pub retry_cap_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            default_timeout_ms: 30_000,
            default_max_retries: 3,
            retry_base_ms: 1_000,
            retry_cap_ms: 60_000,
        }
    }
}

impl QueueConfig {
    /// Override the worker pool size.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Override the default per-attempt timeout.
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Override the default retry budget.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Override the retry backoff base.
    pub fn with_retry_base_ms(mut self, base_ms: u64) -> Self {
        self.retry_base_ms = base_ms;
        self
    }

    /// Override the retry backoff cap.
    pub fn with_retry_cap_ms(mut self, cap_ms: u64) -> Self {
        self.retry_cap_ms = cap_ms;
        self
    }

    pub(crate) fn validate(&self, queue_name: &str) -> Result<(), QueueError> {
        if queue_name.is_empty() {
            return Err(QueueError::invalid("queue name must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(QueueError::invalid(format!(
                "queue {queue_name}: concurrency must be positive"
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of a queue instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// How to stop a queue (or all of them).
#[derive(Debug, Clone)]
pub struct StopOptions {
    /// Drain queued work before interrupting in-flight attempts.
    pub graceful: bool,
    /// Drain deadline (graceful) or maximum wait (non-graceful).
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            graceful: true,
            timeout: Duration::from_secs(30),
        }
    }
}

impl StopOptions {
    /// Graceful stop with the given drain deadline.
    pub fn graceful(timeout: Duration) -> Self {
        Self {
            graceful: true,
            timeout,
        }
    }

    /// Immediate stop: interrupt everything, wait at most `timeout`.
    pub fn immediate(timeout: Duration) -> Self {
        Self {
            graceful: false,
            timeout,
        }
    }
}

// ============================================================================
// Cancellation signal
// ============================================================================

/// Why a cancellation signal fired. The first trigger wins.
#[derive(Debug, Clone)]
pub(crate) enum CancelReason {
    /// Explicit `cancel_job`, with the caller's reason.
    Cancel(Option<String>),
    /// The attempt exceeded its timeout.
    Timeout,
    /// The queue is shutting down; abandon without a terminal write.
    Shutdown,
}

/// Single-shot watchable flag handed to handlers, with the recorded reason
/// the worker uses for classification.
pub(crate) struct CancelSignal {
    token: CancellationToken,
    reason: StdMutex<Option<CancelReason>>,
}

impl CancelSignal {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: StdMutex::new(None),
        }
    }

    pub(crate) fn trigger(&self, reason: CancelReason) {
        {
            let mut guard = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
        self.token.cancel();
    }

    fn reason(&self) -> Option<CancelReason> {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }
}

// ============================================================================
// Queue instance
// ============================================================================

/// Scheduler and worker pool for one named queue.
pub struct QueueInstance {
    name: Arc<str>,
    config: QueueConfig,
    storage: Arc<dyn Storage>,
    handlers: Arc<HandlerRegistry>,
    subscriptions: SubscriptionRegistry,
    bridge: Option<EventBridge>,
    state: watch::Sender<QueueState>,
    accepting: AtomicBool,
    wake: Notify,
    slots: Arc<Semaphore>,
    running: StdMutex<HashMap<Uuid, Arc<CancelSignal>>>,
    shutdown: StdMutex<CancellationToken>,
    self_ref: Weak<QueueInstance>,
}

impl QueueInstance {
    pub(crate) fn new(
        name: String,
        config: QueueConfig,
        storage: Arc<dyn Storage>,
        handlers: Arc<HandlerRegistry>,
        subscriptions: SubscriptionRegistry,
        bridge: Option<EventBridge>,
    ) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.concurrency));
        let (state, _) = watch::channel(QueueState::Stopped);
        Arc::new_cyclic(|self_ref| Self {
            name: Arc::from(name),
            config,
            storage,
            handlers,
            subscriptions,
            bridge,
            state,
            accepting: AtomicBool::new(true),
            wake: Notify::new(),
            slots,
            running: StdMutex::new(HashMap::new()),
            shutdown: StdMutex::new(CancellationToken::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue's configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> QueueState {
        *self.state.borrow()
    }

    /// Whether submissions are currently accepted.
    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Wake the dispatcher after a submission.
    pub(crate) fn notify_submitted(&self) {
        self.wake.notify_one();
    }

    /// Number of in-flight workers.
    pub(crate) fn running_count(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Signal cancellation to an in-flight job. Returns whether the job
    /// was running here.
    pub(crate) fn cancel_running(&self, job_id: Uuid, reason: Option<String>) -> bool {
        let signal = {
            let guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
            guard.get(&job_id).cloned()
        };
        match signal {
            Some(signal) => {
                info!(queue = %self.name, job_id = %job_id, "cancellation requested for running job");
                signal.trigger(CancelReason::Cancel(reason));
                true
            }
            None => false,
        }
    }

    /// Start the dispatcher. Idempotent.
    pub fn start(&self) {
        let claimed = self.state.send_if_modified(|state| {
            if *state == QueueState::Stopped {
                *state = QueueState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return;
        }
        let Some(instance) = self.self_ref.upgrade() else {
            return;
        };

        self.accepting.store(true, Ordering::SeqCst);
        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();

        tokio::spawn(async move { instance.dispatch_loop(token).await });

        self.state.send_replace(QueueState::Running);
        info!(queue = %self.name, concurrency = self.config.concurrency, "queue started");
    }

    /// Stop the queue. Idempotent; a stop while stopping joins the
    /// in-progress shutdown.
    ///
    /// Graceful: refuse submissions, drain queued work until the deadline,
    /// then interrupt whatever is still in flight and wait for workers to
    /// return. Non-graceful: interrupt immediately and wait at most
    /// `timeout`.
    ///
    /// Jobs interrupted by the deadline are left in status `running` in
    /// storage — their ownership is presumed lost, and they are not reset
    /// to `queued` on a later `start`. Reclaiming them is adapter/operator
    /// policy.
    pub async fn stop(&self, options: StopOptions) {
        let mut state_rx = self.state.subscribe();
        let claimed = self.state.send_if_modified(|state| match state {
            QueueState::Running | QueueState::Starting => {
                *state = QueueState::Stopping;
                true
            }
            _ => false,
        });

        if !claimed {
            // Already stopped, or join the shutdown in progress.
            while *state_rx.borrow_and_update() != QueueState::Stopped {
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
            return;
        }

        info!(queue = %self.name, graceful = options.graceful, "queue stopping");
        self.accepting.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();

        let deadline = Instant::now() + options.timeout;

        if options.graceful {
            loop {
                let queued = match self.storage.get_stats(&self.name).await {
                    Ok(stats) => stats.queued,
                    Err(_) => 0,
                };
                if queued == 0 && self.running_count() == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    break;
                }
                time::sleep(Duration::from_millis(20)).await;
            }
        }

        // Dispatcher exits; in-flight attempts are abandoned without a
        // terminal write.
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        self.wake.notify_waiters();

        let signals: Vec<Arc<CancelSignal>> = {
            let guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        for signal in &signals {
            signal.trigger(CancelReason::Shutdown);
        }

        if options.graceful {
            while self.running_count() > 0 {
                time::sleep(Duration::from_millis(10)).await;
            }
        } else {
            while self.running_count() > 0 && Instant::now() < deadline {
                time::sleep(Duration::from_millis(10)).await;
            }
        }

        self.state.send_replace(QueueState::Stopped);
        info!(queue = %self.name, "queue stopped");
    }

    // ------------------------------------------------------------------------
    // Dispatcher
    // ------------------------------------------------------------------------

    async fn dispatch_loop(self: Arc<Self>, shutdown: CancellationToken) {
        debug!(queue = %self.name, "dispatcher starting");
        let mut backoff = StorageBackoff::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.storage.dequeue(&self.name).await {
                Ok(Some(job)) => {
                    backoff.reset();
                    self.spawn_worker(job, permit);
                }
                Ok(None) => {
                    drop(permit);
                    self.park(&shutdown).await;
                }
                Err(StorageError::Unavailable { message }) => {
                    drop(permit);
                    let delay = backoff.next_delay();
                    warn!(
                        queue = %self.name,
                        error = %message,
                        backoff_ms = delay.as_millis() as u64,
                        "storage unavailable, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = %self.name, error = %e, "dequeue failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
        }
        debug!(queue = %self.name, "dispatcher stopped");
    }

    /// Park until a wake event: submission, worker completion, cancel,
    /// stop, or the next delayed entry coming due.
    async fn park(&self, shutdown: &CancellationToken) {
        let next = self.storage.next_run_at(&self.name).await.ok().flatten();
        let until_due = async move {
            match next {
                Some(at) => {
                    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    time::sleep(wait).await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = self.wake.notified() => {}
            _ = until_due => {}
        }
    }

    fn spawn_worker(&self, job: Job, permit: OwnedSemaphorePermit) {
        let Some(instance) = self.self_ref.upgrade() else {
            return;
        };
        let signal = Arc::new(CancelSignal::new());
        {
            let mut guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
            guard.insert(job.id, signal.clone());
        }

        tokio::spawn(async move {
            let job_id = job.id;
            instance.run_job(job, signal).await;
            {
                let mut guard = instance.running.lock().unwrap_or_else(|e| e.into_inner());
                guard.remove(&job_id);
            }
            drop(permit);
            instance.wake.notify_one();
        });
    }

    // ------------------------------------------------------------------------
    // Worker protocol
    // ------------------------------------------------------------------------

    async fn run_job(&self, job: Job, signal: Arc<CancelSignal>) {
        let job_id = job.id;
        let attempt = job.attempt();
        debug!(
            queue = %self.name,
            job_id = %job_id,
            job_type = %job.job_type,
            attempt,
            "dispatching job"
        );

        match self
            .persist_with_retry(job_id, JobPatch::running(Utc::now()))
            .await
        {
            Ok(_) => {}
            Err(StorageError::InvalidTransition { .. }) => {
                // Lost the race against cancel; the terminal event was
                // already published by the cancelling side.
                debug!(queue = %self.name, job_id = %job_id, "job no longer queued, skipping attempt");
                return;
            }
            Err(e) => {
                warn!(queue = %self.name, job_id = %job_id, error = %e, "failed to mark job running");
                // A dispatch-site storage failure does not consume an
                // attempt; put the job back.
                if let Err(e) = self.storage.enqueue(&self.name, job).await {
                    error!(queue = %self.name, job_id = %job_id, error = %e, "failed to restore job after storage failure");
                }
                self.wake.notify_one();
                return;
            }
        }

        self.bridge_publish(JobEvent::Started {
            job_id,
            queue_name: job.queue_name.clone(),
            job_type: job.job_type.clone(),
            attempt,
        });

        let Some(handler) = self.handlers.lookup(&job.queue_name, &job.job_type) else {
            let error = JobError::no_handler(&job.queue_name, &job.job_type);
            warn!(queue = %self.name, job_id = %job_id, job_type = %job.job_type, "no handler registered");
            self.finish_failed(&job, error, job.max_retries).await;
            return;
        };

        let (progress, progress_rx) = ProgressHandle::channel();
        let context = JobContext::new(
            job_id,
            self.name.clone(),
            Arc::from(job.job_type.as_str()),
            attempt,
            job.data.clone(),
            progress,
            signal.token().clone(),
        );
        let pump = tokio::spawn(Self::progress_pump(
            Arc::clone(&self.storage),
            self.subscriptions.clone(),
            self.bridge.clone(),
            job.queue_name.clone(),
            job_id,
            progress_rx,
        ));

        let timeout = Duration::from_millis(job.timeout_ms);
        let started = Instant::now();
        debug!(queue = %self.name, job_id = %job_id, attempt, "handler starting");

        enum RawOutcome {
            Returned(anyhow::Result<serde_json::Value>),
            Interrupted,
            TimedOut,
        }

        let raw = tokio::select! {
            result = (handler.as_ref())(context) => RawOutcome::Returned(result),
            _ = signal.token().cancelled() => RawOutcome::Interrupted,
            _ = time::sleep(timeout) => {
                signal.trigger(CancelReason::Timeout);
                RawOutcome::TimedOut
            }
        };

        // The handler future (and with it the progress sender) is gone;
        // drain the pump so every progress event lands before a terminal.
        let _ = pump.await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = match raw {
            RawOutcome::Returned(result) => match signal.reason() {
                Some(CancelReason::Cancel(reason)) => Outcome::Cancelled(reason),
                Some(CancelReason::Timeout) => Outcome::Failed(JobError::timeout(job.timeout_ms)),
                Some(CancelReason::Shutdown) => Outcome::Abandoned,
                None => match result {
                    Ok(value) => Outcome::Completed(value),
                    Err(e) => Outcome::Failed(normalize_failure(e)),
                },
            },
            RawOutcome::Interrupted => match signal.reason() {
                Some(CancelReason::Cancel(reason)) => Outcome::Cancelled(reason),
                Some(CancelReason::Shutdown) => Outcome::Abandoned,
                _ => Outcome::Failed(JobError::timeout(job.timeout_ms)),
            },
            RawOutcome::TimedOut => Outcome::Failed(JobError::timeout(job.timeout_ms)),
        };

        match outcome {
            Outcome::Completed(value) => {
                info!(
                    queue = %self.name,
                    job_id = %job_id,
                    job_type = %job.job_type,
                    duration_ms,
                    "job completed"
                );
                if self
                    .persist_terminal(job_id, JobPatch::completed(value.clone(), Utc::now()))
                    .await
                {
                    self.subscriptions.publish_completed(job_id, &value);
                    self.bridge_publish(JobEvent::Completed {
                        job_id,
                        queue_name: job.queue_name.clone(),
                        result: value,
                    });
                }
            }
            Outcome::Cancelled(reason) => {
                info!(queue = %self.name, job_id = %job_id, duration_ms, "job cancelled");
                if self
                    .persist_terminal(job_id, JobPatch::cancelled(Utc::now()))
                    .await
                {
                    self.subscriptions
                        .publish_cancelled(job_id, reason.as_deref());
                    self.bridge_publish(JobEvent::Cancelled {
                        job_id,
                        queue_name: job.queue_name.clone(),
                        reason,
                    });
                }
            }
            Outcome::Failed(error) => {
                if job.retries < job.max_retries {
                    self.requeue_for_retry(&job, error).await;
                } else {
                    warn!(
                        queue = %self.name,
                        job_id = %job_id,
                        error = %error,
                        retries = job.retries,
                        "retries exhausted, job failed"
                    );
                    self.finish_failed(&job, error, job.retries).await;
                }
            }
            Outcome::Abandoned => {
                debug!(queue = %self.name, job_id = %job_id, "attempt abandoned at shutdown");
            }
        }
    }

    async fn requeue_for_retry(&self, job: &Job, error: JobError) {
        let retries = job.retries + 1;
        let delay = retry_delay(&self.config, retries);
        let not_before = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        info!(
            queue = %self.name,
            job_id = %job.id,
            error = %error,
            retries,
            max_retries = job.max_retries,
            delay_ms = delay.as_millis() as u64,
            "attempt failed, scheduling retry"
        );

        match self
            .persist_with_retry(job.id, JobPatch::requeued(retries, not_before))
            .await
        {
            Ok(updated) => {
                if let Err(e) = self.storage.enqueue(&self.name, updated).await {
                    error!(queue = %self.name, job_id = %job.id, error = %e, "failed to requeue job for retry");
                }
                self.wake.notify_one();
            }
            Err(e) => {
                error!(queue = %self.name, job_id = %job.id, error = %e, "failed to persist retry");
            }
        }
    }

    async fn finish_failed(&self, job: &Job, error: JobError, retries: u32) {
        if self
            .persist_terminal(job.id, JobPatch::failed(error.clone(), retries, Utc::now()))
            .await
        {
            self.subscriptions.publish_failed(job.id, &error);
            self.bridge_publish(JobEvent::Failed {
                job_id: job.id,
                queue_name: job.queue_name.clone(),
                error,
            });
        }
    }

    async fn progress_pump(
        storage: Arc<dyn Storage>,
        subscriptions: SubscriptionRegistry,
        bridge: Option<EventBridge>,
        queue_name: String,
        job_id: Uuid,
        mut rx: watch::Receiver<ProgressUpdate>,
    ) {
        while rx.changed().await.is_ok() {
            let update = rx.borrow_and_update().clone();
            if let Err(e) = storage
                .update_job(
                    job_id,
                    JobPatch::progress(update.percent, update.message.clone()),
                )
                .await
            {
                warn!(job_id = %job_id, error = %e, "progress update failed");
            }
            subscriptions.publish_progress(job_id, update.percent, update.message.as_deref());
            if let Some(bridge) = &bridge {
                bridge.publish(JobEvent::Progress {
                    job_id,
                    queue_name: queue_name.clone(),
                    progress: update.percent,
                    message: update.message,
                });
            }
        }
    }

    /// Retry transient storage failures a few times before giving up.
    async fn persist_with_retry(
        &self,
        job_id: Uuid,
        patch: JobPatch,
    ) -> Result<Job, StorageError> {
        let mut delay = Duration::from_millis(STORAGE_BACKOFF_INITIAL_MS);
        let mut last = None;
        for _ in 0..TERMINAL_WRITE_ATTEMPTS {
            match self.storage.update_job(job_id, patch.clone()).await {
                Ok(job) => return Ok(job),
                Err(StorageError::Unavailable { message }) => {
                    last = Some(StorageError::Unavailable { message });
                    time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(StorageError::NotFound { id: job_id }))
    }

    /// Persist a terminal transition. Returns whether the terminal events
    /// should be published: a persistently unavailable store still
    /// publishes (the next authoritative update reconciles), a rejected
    /// transition does not.
    async fn persist_terminal(&self, job_id: Uuid, patch: JobPatch) -> bool {
        match self.persist_with_retry(job_id, patch).await {
            Ok(_) => true,
            Err(StorageError::InvalidTransition { from, to, .. }) => {
                warn!(queue = %self.name, job_id = %job_id, %from, %to, "terminal transition rejected");
                false
            }
            Err(e) => {
                warn!(queue = %self.name, job_id = %job_id, error = %e, "terminal write failed, proceeding");
                true
            }
        }
    }

    fn bridge_publish(&self, event: JobEvent) {
        if let Some(bridge) = &self.bridge {
            bridge.publish(event);
        }
    }
}

impl std::fmt::Debug for QueueInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueInstance")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("running", &self.running_count())
            .finish_non_exhaustive()
    }
}

enum Outcome {
    Completed(serde_json::Value),
    Failed(JobError),
    Cancelled(Option<String>),
    Abandoned,
}

// ============================================================================
// Backoff
// ============================================================================

/// Bounded exponential backoff for transient storage failures.
struct StorageBackoff {
    current_ms: u64,
}

impl StorageBackoff {
    fn new() -> Self {
        Self {
            current_ms: STORAGE_BACKOFF_INITIAL_MS,
        }
    }

    fn reset(&mut self) {
        self.current_ms = STORAGE_BACKOFF_INITIAL_MS;
    }

    fn next_delay(&mut self) -> Duration {
        let jitter = 0.8 + 0.4 * fastrand::f64();
        let delay = (self.current_ms as f64 * jitter) as u64;
        self.current_ms = (self.current_ms * 2).min(STORAGE_BACKOFF_CAP_MS);
        Duration::from_millis(delay)
    }
}

/// Deterministic exponential retry delay with jitter:
/// `base * 2^(retries-1) * (0.8..1.2)`, capped.
fn retry_delay(config: &QueueConfig, retries: u32) -> Duration {
    let exponent = retries.saturating_sub(1).min(20);
    let base = config.retry_base_ms.saturating_mul(1u64 << exponent);
    let jitter = 0.8 + 0.4 * fastrand::f64();
    let delay = (base as f64 * jitter) as u64;
    Duration::from_millis(delay.min(config.retry_cap_ms))
}

fn normalize_failure(error: anyhow::Error) -> JobError {
    match error.downcast::<HandlerFailure>() {
        Ok(failure) => JobError {
            message: failure.message,
            code: failure.code,
            details: failure.details,
        },
        Err(error) => JobError::execution(error.to_string()),
    }
}
