//! # docdb-bulk
//!
//! Client-side bulk execution engine for a partitioned document database.
//!
//! Many concurrent callers submit single-item operations; the engine groups
//! them into server-side transactional batches addressed to the correct
//! partition range, dispatches with bounded per-range concurrency, adapts
//! that concurrency with per-range AIMD congestion control, and retries
//! individual operations on throttling or stale partition routing. Each
//! caller just awaits its own result.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use docdb_bulk::executor::{BulkExecutor, BulkExecutorOptions};
//! use docdb_bulk::operation::Operation;
//! use docdb_bulk::transport::ContainerFacade;
//!
//! async fn run(facade: Arc<dyn ContainerFacade>) -> anyhow::Result<()> {
//!     // Bind one executor per container; clones share it.
//!     let executor = BulkExecutor::new(facade, BulkExecutorOptions::default());
//!
//!     // Submit operations from as many tasks as needed.
//!     let tasks: Vec<_> = (0..100)
//!         .map(|i| {
//!             let executor = executor.clone();
//!             tokio::spawn(async move {
//!                 let op = Operation::create(
//!                     format!("doc-{i}"),
//!                     format!("tenant-{}", i % 7),
//!                     serde_json::json!({"value": i}),
//!                 );
//!                 // The awaiter resolves once the server settled this
//!                 // operation, however it was batched or retried.
//!                 executor.add(op, None).await?.get(None).await
//!             })
//!         })
//!         .collect();
//!     for task in tasks {
//!         let result = task.await??;
//!         assert!(result.is_success());
//!     }
//!
//!     // Drain buffers and stop background work.
//!     executor.dispose().await;
//!     Ok(())
//! }
//! ```
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod operation;
pub mod retry_policy;
pub mod routing;
pub mod transport;

pub(crate) mod congestion;
pub(crate) mod dispatcher;
pub(crate) mod limiter;
pub(crate) mod streamer;
pub(crate) mod timer_pool;

pub use congestion::RangeMetricsSnapshot;
