//! Multi-queue coordinator exposing the public API.
//!
//! A [`QueueService`] owns the named [`QueueInstance`]s, the handler
//! registry, the storage handle, the subscription registry, and the
//! optional external event bridge. Its lifecycle brackets
//! [`QueueService::start_all`] / [`QueueService::stop_all`]; callers
//! obtain it by dependency injection, not a global.
//!
//! # Example
//!
//! ```ignore
//! let service = QueueService::builder()
//!     .with_queue("emails", QueueConfig::default().with_concurrency(2))
//!     .with_handler("emails", "email:send", |ctx| async move {
//!         ctx.progress(50, Some("sending"));
//!         Ok(serde_json::json!({ "sent": true }))
//!     })
//!     .build()?;
//!
//! service.start_all();
//! let job_id = service.add("emails", "email:send", payload, AddOptions::default()).await?;
//! service.stop_all(StopOptions::default()).await;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::QueueError;
use crate::events::{EventBridge, EventSink, JobEvent};
use crate::handler::{HandlerRegistry, HandlerResult, JobContext};
use crate::job::{Job, JobStatus};
use crate::storage::{JobPatch, ListFilter, MemoryStorage, QueueStats, Storage, StorageError};
use crate::subscription::{JobObserver, SubscriptionRegistry, Unsubscribe};
use crate::worker::{QueueConfig, QueueInstance, StopOptions};

/// Result of a submission that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// The job was created, returns the new job id.
    Created(Uuid),
    /// A non-terminal job already carries this idempotency key.
    Duplicate(Uuid),
}

impl EnqueueResult {
    /// The job id regardless of whether it was created or a duplicate.
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    /// Whether a new job was created.
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Options for submitting a job.
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct AddOptions {
    /// Higher runs earlier. Defaults to 0.
    pub priority: Option<i32>,
    /// Retry budget. Defaults to the queue's `default_max_retries`.
    pub max_retries: Option<u32>,
    /// Per-attempt budget. Defaults to the queue's `default_timeout_ms`.
    pub timeout_ms: Option<u64>,
    /// Earliest time to dispatch the job.
    pub run_at: Option<DateTime<Utc>>,
    /// At most one non-terminal job per queue carries a given key.
    pub idempotency_key: Option<String>,
    /// Caller-opaque key/value map stored on the job.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// The multi-queue coordinator.
pub struct QueueService {
    storage: Arc<dyn Storage>,
    handlers: Arc<HandlerRegistry>,
    subscriptions: SubscriptionRegistry,
    queues: HashMap<String, Arc<QueueInstance>>,
    bridge: Option<EventBridge>,
}

impl QueueService {
    /// Start building a service.
    pub fn builder() -> QueueServiceBuilder {
        QueueServiceBuilder::new()
    }

    /// Register (or replace) the handler for `(queue_name, job_type)`.
    /// May be called before or after the queues start.
    pub fn register_handler<F, Fut>(&self, queue_name: &str, job_type: &str, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(queue_name, job_type, handler);
    }

    /// Submit a job, returning its id. See [`QueueService::enqueue`] for
    /// idempotency-aware submission.
    pub async fn add(
        &self,
        queue_name: &str,
        job_type: &str,
        data: serde_json::Value,
        options: AddOptions,
    ) -> Result<Uuid, QueueError> {
        Ok(self
            .enqueue(queue_name, job_type, data, options)
            .await?
            .job_id())
    }

    /// Submit a job. If the options carry an idempotency key already held
    /// by a non-terminal job on this queue, returns
    /// [`EnqueueResult::Duplicate`] with the existing id.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        job_type: &str,
        data: serde_json::Value,
        options: AddOptions,
    ) -> Result<EnqueueResult, QueueError> {
        let instance = self.instance(queue_name)?;
        if !instance.is_accepting() {
            return Err(QueueError::QueueClosed {
                name: queue_name.to_string(),
            });
        }
        if job_type.is_empty() {
            return Err(QueueError::invalid("job type must not be empty"));
        }

        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = self.storage.find_by_idempotency_key(queue_name, key).await? {
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        let config = instance.config();
        let mut job = Job::builder()
            .queue_name(queue_name)
            .job_type(job_type)
            .data(data)
            .priority(options.priority.unwrap_or(0))
            .max_retries(options.max_retries.unwrap_or(config.default_max_retries))
            .timeout_ms(options.timeout_ms.unwrap_or(config.default_timeout_ms))
            .metadata(options.metadata)
            .build();
        job.not_before = options.run_at;
        job.idempotency_key = options.idempotency_key;
        let job_id = job.id;

        self.storage.enqueue(queue_name, job.clone()).await?;
        instance.notify_submitted();
        info!(queue = %queue_name, job_id = %job_id, job_type = %job_type, "job submitted");

        if let Some(bridge) = &self.bridge {
            bridge.publish(JobEvent::queued(&job));
        }

        Ok(EnqueueResult::Created(job_id))
    }

    /// Register an observer for a job's lifecycle events.
    pub fn subscribe(&self, job_id: Uuid, observer: JobObserver) -> Unsubscribe {
        self.subscriptions.subscribe(job_id, observer)
    }

    /// Look up a job, optionally scoped to a queue.
    pub async fn get_job(
        &self,
        job_id: Uuid,
        queue_name: Option<&str>,
    ) -> Result<Option<Job>, QueueError> {
        Ok(self.storage.get_job(job_id, queue_name).await?)
    }

    /// List a queue's jobs with filtering, sorting, and pagination.
    pub async fn list_jobs(
        &self,
        queue_name: &str,
        filter: ListFilter,
    ) -> Result<Vec<Job>, QueueError> {
        self.instance(queue_name)?;
        Ok(self.storage.list_jobs(queue_name, filter).await?)
    }

    /// A queue's incrementally-maintained counts.
    pub async fn get_stats(&self, queue_name: &str) -> Result<QueueStats, QueueError> {
        self.instance(queue_name)?;
        Ok(self.storage.get_stats(queue_name).await?)
    }

    /// Cancel a job.
    ///
    /// Queued jobs transition straight to `cancelled`; running jobs get
    /// their cancellation signal and reach the terminal state through the
    /// worker. Returns `false` for jobs already terminal. Idempotent.
    pub async fn cancel_job(
        &self,
        job_id: Uuid,
        queue_name: Option<&str>,
        reason: Option<&str>,
    ) -> Result<bool, QueueError> {
        let job = self
            .storage
            .get_job(job_id, queue_name)
            .await?
            .ok_or(QueueError::NotFound { id: job_id })?;

        if job.status.is_terminal() {
            return Ok(false);
        }

        let instance = self.queues.get(&job.queue_name);
        match job.status {
            JobStatus::Queued => {
                match self
                    .storage
                    .update_job(job_id, JobPatch::cancelled(Utc::now()))
                    .await
                {
                    Ok(_) => {
                        info!(queue = %job.queue_name, job_id = %job_id, "queued job cancelled");
                        self.subscriptions.publish_cancelled(job_id, reason);
                        if let Some(bridge) = &self.bridge {
                            bridge.publish(JobEvent::Cancelled {
                                job_id,
                                queue_name: job.queue_name.clone(),
                                reason: reason.map(str::to_owned),
                            });
                        }
                        Ok(true)
                    }
                    // Raced into `running`; fall through to the signal.
                    Err(StorageError::InvalidTransition { .. }) => Ok(instance
                        .map(|i| i.cancel_running(job_id, reason.map(str::to_owned)))
                        .unwrap_or(false)),
                    Err(e) => Err(e.into()),
                }
            }
            JobStatus::Running => Ok(instance
                .map(|i| i.cancel_running(job_id, reason.map(str::to_owned)))
                .unwrap_or(false)),
            _ => Ok(false),
        }
    }

    /// Probe the storage adapter's liveness.
    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.storage
            .health_check()
            .await
            .map_err(|e| QueueError::ServiceUnavailable {
                message: e.to_string(),
            })
    }

    /// Names of the configured queues.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// The instance for a queue, for per-queue start/stop.
    pub fn queue(&self, queue_name: &str) -> Option<&Arc<QueueInstance>> {
        self.queues.get(queue_name)
    }

    /// Start every queue's dispatcher. Idempotent.
    pub fn start_all(&self) {
        for instance in self.queues.values() {
            instance.start();
        }
    }

    /// Stop every queue. See [`QueueInstance::stop`] for the protocol.
    pub async fn stop_all(&self, options: StopOptions) {
        let stops = self
            .queues
            .values()
            .map(|instance| instance.stop(options.clone()));
        futures::future::join_all(stops).await;
    }

    /// All queues' stats as a JSON object keyed by queue name.
    pub async fn stats_json(&self) -> Result<serde_json::Value, QueueError> {
        let mut stats = BTreeMap::new();
        for name in self.queue_names() {
            stats.insert(name.clone(), self.storage.get_stats(&name).await?);
        }
        Ok(serde_json::to_value(stats).unwrap_or(serde_json::Value::Null))
    }

    /// All queues' stats in a scrape-friendly textual exposition: one
    /// gauge per `(queue, status)` plus a per-queue total.
    pub async fn stats_text(&self) -> Result<String, QueueError> {
        let mut out = String::from("# TYPE conveyor_jobs gauge\n");
        let mut totals = String::from("# TYPE conveyor_jobs_total gauge\n");
        for name in self.queue_names() {
            let stats = self.storage.get_stats(&name).await?;
            for status in [
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                let _ = writeln!(
                    out,
                    "conveyor_jobs{{queue=\"{name}\",status=\"{status}\"}} {}",
                    stats.for_status(status)
                );
            }
            let _ = writeln!(totals, "conveyor_jobs_total{{queue=\"{name}\"}} {}", stats.total);
        }
        out.push_str(&totals);
        Ok(out)
    }

    fn instance(&self, queue_name: &str) -> Result<&Arc<QueueInstance>, QueueError> {
        self.queues
            .get(queue_name)
            .ok_or_else(|| QueueError::UnknownQueue {
                name: queue_name.to_string(),
            })
    }
}

impl std::fmt::Debug for QueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("queues", &self.queue_names())
            .field("bridged", &self.bridge.is_some())
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder wiring storage, queues, handlers, and the optional bridge.
pub struct QueueServiceBuilder {
    storage: Option<Arc<dyn Storage>>,
    handlers: Arc<HandlerRegistry>,
    queues: Vec<(String, QueueConfig)>,
    bridge: Option<EventBridge>,
}

impl QueueServiceBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            storage: None,
            handlers: Arc::new(HandlerRegistry::new()),
            queues: Vec::new(),
            bridge: None,
        }
    }

    /// Use a storage adapter other than the in-memory default.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Declare a named queue.
    pub fn with_queue(mut self, name: impl Into<String>, config: QueueConfig) -> Self {
        self.queues.push((name.into(), config));
        self
    }

    /// Republish lifecycle events to an external bus on behalf of
    /// `server_id`.
    pub fn with_event_sink(mut self, server_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        self.bridge = Some(EventBridge::new(server_id, sink));
        self
    }

    /// Register a handler during construction.
    pub fn with_handler<F, Fut>(self, queue_name: &str, job_type: &str, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(queue_name, job_type, handler);
        self
    }

    /// Validate the configuration and assemble the service.
    pub fn build(self) -> Result<QueueService, QueueError> {
        let storage: Arc<dyn Storage> = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let subscriptions = SubscriptionRegistry::new();

        let mut queues = HashMap::new();
        for (name, config) in self.queues {
            config.validate(&name)?;
            if queues.contains_key(&name) {
                return Err(QueueError::invalid(format!("duplicate queue: {name}")));
            }
            let instance = QueueInstance::new(
                name.clone(),
                config,
                Arc::clone(&storage),
                Arc::clone(&self.handlers),
                subscriptions.clone(),
                self.bridge.clone(),
            );
            queues.insert(name, instance);
        }

        Ok(QueueService {
            storage,
            handlers: self.handlers,
            subscriptions,
            queues,
            bridge: self.bridge,
        })
    }
}

impl Default for QueueServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> QueueService {
        QueueService::builder()
            .with_queue("emails", QueueConfig::default())
            .with_queue("crawls", QueueConfig::default().with_concurrency(2))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_bad_config() {
        let err = QueueService::builder()
            .with_queue("", QueueConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument { .. }));

        let err = QueueService::builder()
            .with_queue("q", QueueConfig::default().with_concurrency(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument { .. }));

        let err = QueueService::builder()
            .with_queue("q", QueueConfig::default())
            .with_queue("q", QueueConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument { .. }));
    }

    #[test]
    fn test_queue_names_sorted() {
        let service = service();
        assert_eq!(service.queue_names(), vec!["crawls", "emails"]);
    }

    #[tokio::test]
    async fn test_add_to_unknown_queue() {
        let service = service();
        let err = service
            .add("nope", "t", serde_json::Value::Null, AddOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue { .. }));
    }

    #[tokio::test]
    async fn test_add_requires_job_type() {
        let service = service();
        let err = service
            .add("emails", "", serde_json::Value::Null, AddOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_add_round_trip() {
        let service = service();
        let id = service
            .add(
                "emails",
                "email:send",
                serde_json::json!({"to": "a@b"}),
                AddOptions::builder().priority(7).build(),
            )
            .await
            .unwrap();

        let job = service.get_job(id, None).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, 7);
        assert_eq!(job.data["to"], "a@b");
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn test_enqueue_idempotency() {
        let service = service();
        let options = || {
            AddOptions::builder()
                .idempotency_key("weekly-digest".to_string())
                .build()
        };

        let first = service
            .enqueue("emails", "digest", serde_json::Value::Null, options())
            .await
            .unwrap();
        assert!(first.is_created());

        let second = service
            .enqueue("emails", "digest", serde_json::Value::Null, options())
            .await
            .unwrap();
        assert!(!second.is_created());
        assert_eq!(second.job_id(), first.job_id());
    }

    #[tokio::test]
    async fn test_cancel_missing_job_is_not_found() {
        let service = service();
        let err = service
            .cancel_job(Uuid::new_v4(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancel_queued_then_again() {
        let service = service();
        let id = service
            .add("emails", "t", serde_json::Value::Null, AddOptions::default())
            .await
            .unwrap();

        assert!(service.cancel_job(id, None, Some("operator")).await.unwrap());
        let job = service.get_job(id, None).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());

        // Second cancel sees a terminal job.
        assert!(!service.cancel_job(id, None, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_exposition() {
        let service = service();
        service
            .add("emails", "t", serde_json::Value::Null, AddOptions::default())
            .await
            .unwrap();

        let text = service.stats_text().await.unwrap();
        assert!(text.contains("# TYPE conveyor_jobs gauge"));
        assert!(text.contains("conveyor_jobs{queue=\"emails\",status=\"queued\"} 1"));
        assert!(text.contains("conveyor_jobs_total{queue=\"emails\"} 1"));
        assert!(text.contains("conveyor_jobs{queue=\"crawls\",status=\"queued\"} 0"));

        let json = service.stats_json().await.unwrap();
        assert_eq!(json["emails"]["queued"], 1);
        assert_eq!(json["crawls"]["total"], 0);
    }

    #[tokio::test]
    async fn test_health_check_with_default_adapter() {
        let service = service();
        service.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_jobs_unknown_queue() {
        let service = service();
        let err = service
            .list_jobs("nope", ListFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue { .. }));
    }
}
