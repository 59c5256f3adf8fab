//! # Conveyor
//!
//! A multi-queue background job engine where dispatchers schedule, workers
//! execute, and subscriptions observe.
//!
//! ## Core Concepts
//!
//! Conveyor separates **submission** from **execution**:
//! - [`QueueService`] = the public API (submit, query, cancel, subscribe)
//! - [`QueueInstance`] = one named queue's scheduler and bounded worker pool
//!
//! Jobs carry opaque payloads and move through a small state machine with
//! retry, cancellation, and per-attempt timeouts. Observers subscribe per
//! job; an optional bridge republishes every lifecycle event to an
//! external bus.
//!
//! ## Architecture
//!
//! ```text
//! add() ──► QueueService ──► Storage.enqueue ──► priority heap
//!                                                    │
//!                              QueueInstance dispatcher (≤ concurrency)
//!                                                    │
//!                                             worker ▼
//!                              handler(JobContext { data, progress, cancel })
//!                                                    │
//!                      Storage.update_job ◄──────────┤
//!                                                    ▼
//!                              SubscriptionRegistry fan-out
//!                                                    │
//!                              (EventBridge ──► external bus)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Terminal states absorb** - `completed`, `failed`, `cancelled` are final
//! 2. **Bounded concurrency** - never more than `concurrency` running jobs per queue
//! 3. **Priority with FIFO tie-break** - dispatch picks max priority, earliest submission
//! 4. **One worker per job** - status transitions are linearized per job
//! 5. **Progress before terminal** - observers see progress events strictly
//!    before exactly one terminal event
//! 6. **Local path is authoritative** - external bus publishing is best-effort
//!
//! ## Example
//!
//! ```ignore
//! use conveyor::{AddOptions, QueueConfig, QueueService, StopOptions};
//!
//! let service = QueueService::builder()
//!     .with_queue("emails", QueueConfig::default().with_concurrency(2))
//!     .with_handler("emails", "email:send", |ctx| async move {
//!         ctx.progress(50, Some("sending"));
//!         if ctx.is_cancelled() {
//!             anyhow::bail!("interrupted");
//!         }
//!         Ok(serde_json::json!({ "sent": true }))
//!     })
//!     .build()?;
//!
//! service.start_all();
//!
//! let job_id = service
//!     .add("emails", "email:send", serde_json::json!({ "to": "a@b" }), AddOptions::default())
//!     .await?;
//!
//! let _sub = service.subscribe(job_id, conveyor::JobObserver::new()
//!     .on_completed(|result| println!("done: {result}")));
//!
//! service.stop_all(StopOptions::default()).await;
//! ```
//!
//! ## What This Is Not
//!
//! Conveyor is **not**:
//! - A distributed scheduler (one process owns its queues)
//! - Exactly-once across crashes (jobs running at shutdown stay `running`;
//!   reclaim is operator policy)
//! - An HTTP layer (the [`stream`] module hands the streaming collaborator
//!   a `futures::Stream`; transport is theirs)

// Core modules
mod error;
mod events;
mod handler;
mod heap;
mod job;
mod service;
mod storage;
mod subscription;
mod worker;

// Stream projection for the SSE collaborator
pub mod stream;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export the job model
pub use crate::job::{codes, Job, JobError, JobStatus};

// Re-export error types
pub use crate::error::{HandlerFailure, QueueError};

// Re-export the priority queue
pub use crate::heap::{PriorityQueue, QueueClosedError};

// Re-export the storage contract and default adapter
pub use crate::storage::{
    JobPatch, ListFilter, MemoryStorage, QueueStats, SortBy, SortOrder, Storage, StorageError,
    StorageResult,
};

// Re-export handler types
pub use crate::handler::{HandlerRegistry, HandlerResult, JobContext};

// Re-export subscription types
pub use crate::subscription::{JobObserver, SubscriptionRegistry, Unsubscribe};

// Re-export queue types
pub use crate::worker::{QueueConfig, QueueInstance, QueueState, StopOptions};

// Re-export the service (primary entry point)
pub use crate::service::{AddOptions, EnqueueResult, QueueService, QueueServiceBuilder};

// Re-export event bridge types
pub use crate::events::{BusEnvelope, EventBridge, EventSink, JobEvent};

// Re-export stream projection types
pub use crate::stream::{subscribe_job_events, JobEventStream};

// Re-export commonly used external types
pub use async_trait::async_trait;
