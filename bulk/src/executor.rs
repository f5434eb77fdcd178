use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::select;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use docdb_core::retry;
use docdb_core::status::Status;

use crate::congestion::{CongestionConfig, CongestionController, RangeMetrics, RangeMetricsSnapshot};
use crate::diagnostics::RequestDiagnostics;
use crate::dispatcher::{Dispatcher, RebatchRequest};
use crate::error::Error;
use crate::limiter::PermitLimiter;
use crate::operation::{Operation, OperationAwaiter, OperationContext, OperationOptions};
use crate::retry_policy::{RetryState, ThrottleRetrySetting};
use crate::routing::{self, PartitionKeyValue};
use crate::streamer::Streamer;
use crate::timer_pool::TimerPool;

/// Executor configuration. Limits below their floor are raised to it.
#[derive(Clone, Debug)]
pub struct BulkExecutorOptions {
    /// Hard cap on operations per server batch. Floor 1.
    pub max_server_request_operation_count: usize,
    /// Hard cap on batch body bytes. Floor 1.
    pub max_server_request_body_length: usize,
    /// Upper bound on how long an operation waits in a non-full buffer.
    /// Floor 1 second.
    pub dispatch_timer_seconds: u64,
    pub retry: ThrottleRetrySetting,
    congestion: CongestionConfig,
}

impl Default for BulkExecutorOptions {
    fn default() -> Self {
        Self {
            max_server_request_operation_count: 100,
            max_server_request_body_length: 2_202_010,
            dispatch_timer_seconds: 1,
            retry: ThrottleRetrySetting::default(),
            congestion: CongestionConfig::default(),
        }
    }
}

impl BulkExecutorOptions {
    fn sanitized(mut self) -> Self {
        self.max_server_request_operation_count = self.max_server_request_operation_count.max(1);
        self.max_server_request_body_length = self.max_server_request_body_length.max(1);
        self.dispatch_timer_seconds = self.dispatch_timer_seconds.max(1);
        self
    }
}

struct RangeState {
    streamer: Streamer,
    limiter: Arc<PermitLimiter>,
    metrics: Arc<RangeMetrics>,
    controller: CongestionController,
    shutdown: CancellationToken,
}

/// Top-level facade of the bulk execution engine, one per container binding.
///
/// Callers submit single-item operations; the executor resolves the target
/// partition range, feeds the per-range streamer and hands back an awaiter.
/// Batching, concurrency shaping and retry stay invisible.
#[derive(Clone)]
pub struct BulkExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    facade: Arc<dyn crate::transport::ContainerFacade>,
    options: BulkExecutorOptions,
    ranges: Mutex<HashMap<String, Arc<RangeState>>>,
    timer_pool: Arc<TimerPool>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    tracker: TaskTracker,
    rebatch: async_channel::Sender<RebatchRequest>,
}

impl BulkExecutor {
    pub fn new(facade: Arc<dyn crate::transport::ContainerFacade>, options: BulkExecutorOptions) -> Self {
        let (rebatch, rebatch_receiver) = async_channel::unbounded();
        let inner = Arc::new(ExecutorInner {
            facade,
            options: options.sanitized(),
            ranges: Mutex::new(HashMap::new()),
            timer_pool: Arc::new(TimerPool::new()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            rebatch,
        });
        // the worker holds the executor weakly so dropping the last clone
        // without dispose still releases everything
        inner.tracker.spawn(rebatch_loop(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            rebatch_receiver,
        ));
        Self { inner }
    }

    /// Submits one operation. Returns synchronously with
    /// [`Error::InvalidUsage`] for unsupported options or an oversized body;
    /// every later failure arrives on the returned awaiter.
    pub async fn add(
        &self,
        mut operation: Operation,
        options: Option<OperationOptions>,
    ) -> Result<OperationAwaiter, Error> {
        let options = options.unwrap_or_default();
        options.validate_for_bulk()?;

        let body_len = operation.materialize(&options)?;
        if body_len > self.inner.options.max_server_request_body_length {
            return Err(Error::InvalidUsage(format!(
                "operation body of {} bytes exceeds the server request limit of {} bytes",
                body_len, self.inner.options.max_server_request_body_length
            )));
        }

        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(OperationAwaiter::resolved(Err(Error::Cancelled)));
        }

        let (producer, consumer) = oneshot::channel();
        let range_id = match self.inner.resolve_range_id(operation.partition_key(), false).await {
            Ok(range_id) => range_id,
            Err(error) => {
                let _ = producer.send(Err(error));
                return Ok(OperationAwaiter::new(consumer));
            }
        };

        let reserved = crate::operation::ReservedOperation {
            operation,
            context: OperationContext {
                range_id: range_id.clone(),
                retry: RetryState::new(self.inner.options.retry),
                sink: producer,
                diagnostics: vec![RequestDiagnostics::PointLookup {
                    range_id: range_id.clone(),
                }],
            },
        };
        self.inner.range_state(&range_id).streamer.add(reserved);
        Ok(OperationAwaiter::new(consumer))
    }

    /// Counter snapshot for one partition range, if the executor has touched
    /// it.
    pub fn range_metrics(&self, range_id: &str) -> Option<RangeMetricsSnapshot> {
        self.inner.ranges.lock().get(range_id).map(|s| s.metrics.snapshot())
    }

    /// Drains pending buffers, stops the congestion controllers and resolves
    /// anything still in flight with [`Error::Cancelled`]. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("dispose bulk executor");

        let states: Vec<Arc<RangeState>> = self.inner.ranges.lock().values().cloned().collect();
        for state in &states {
            state.streamer.force_flush();
        }

        self.inner.shutdown.cancel();
        self.inner.rebatch.close();
        for state in &states {
            state.limiter.close();
        }
        self.inner.timer_pool.dispose().await;
        for state in &states {
            state.controller.done().await;
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.ranges.lock().clear();
        tracing::debug!("bulk executor disposed");
    }
}

impl ExecutorInner {
    async fn resolve_range_id(
        &self,
        partition_key: &PartitionKeyValue,
        force_refresh: bool,
    ) -> Result<String, Error> {
        let cancel = &self.shutdown;
        let definition = retry::invoke(Some(cancel), None, || {
            self.facade.partition_key_definition(cancel.child_token())
        })
        .await
        .map_err(routing_error)?;
        let map = retry::invoke(Some(cancel), None, || {
            self.facade.routing_map(force_refresh, cancel.child_token())
        })
        .await
        .map_err(routing_error)?;
        // keyless operations route through the container's own none value
        if matches!(partition_key, PartitionKeyValue::None) {
            let none_value = retry::invoke(Some(cancel), None, || {
                self.facade.none_partition_key_value(cancel.child_token())
            })
            .await
            .map_err(routing_error)?;
            return routing::range_id_of(&none_value, &definition, &map);
        }
        routing::range_id_of(partition_key, &definition, &map)
    }

    /// Create-or-get of the per-range state. Two racing creators are
    /// resolved by the map insert: the loser cancels the controller it just
    /// spawned and adopts the winner.
    fn range_state(&self, range_id: &str) -> Arc<RangeState> {
        if let Some(state) = self.ranges.lock().get(range_id) {
            return Arc::clone(state);
        }
        let fresh = self.build_range_state(range_id);
        let mut ranges = self.ranges.lock();
        match ranges.get(range_id) {
            Some(winner) => {
                let winner = Arc::clone(winner);
                drop(ranges);
                fresh.shutdown.cancel();
                winner
            }
            None => {
                ranges.insert(range_id.to_string(), Arc::clone(&fresh));
                fresh
            }
        }
    }

    fn build_range_state(&self, range_id: &str) -> Arc<RangeState> {
        let congestion = self.options.congestion;
        let metrics = Arc::new(RangeMetrics::default());
        let limiter = Arc::new(PermitLimiter::new(congestion.initial_degree_of_concurrency));
        let range_shutdown = self.shutdown.child_token();
        let controller = CongestionController::spawn(
            range_id.to_string(),
            Arc::clone(&metrics),
            Arc::clone(&limiter),
            congestion,
            range_shutdown.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            range_id.to_string(),
            Arc::clone(&self.facade),
            Arc::clone(&limiter),
            Arc::clone(&metrics),
            self.rebatch.clone(),
            self.shutdown.clone(),
            self.tracker.clone(),
        ));
        let streamer = Streamer::new(
            range_id.to_string(),
            self.options.max_server_request_operation_count,
            self.options.max_server_request_body_length,
            Duration::from_secs(self.options.dispatch_timer_seconds),
            Arc::clone(&self.timer_pool),
            dispatcher,
            self.tracker.clone(),
        );
        Arc::new(RangeState {
            streamer,
            limiter,
            metrics,
            controller,
            shutdown: range_shutdown,
        })
    }

    /// Re-homes one failed operation: re-resolve routing (forcing a map
    /// refresh after a stale-range signal) and feed the target streamer.
    async fn rebatch(&self, request: RebatchRequest) {
        let mut reserved = request.operation;
        match self
            .resolve_range_id(reserved.operation.partition_key(), request.refresh_routing)
            .await
        {
            Err(error) => reserved.complete(Err(error)),
            Ok(range_id) => {
                tracing::trace!(
                    "rebatch: id={} range={}->{}",
                    reserved.operation.id(),
                    reserved.context.range_id,
                    range_id
                );
                reserved.context.range_id = range_id.clone();
                self.range_state(&range_id).streamer.add(reserved);
            }
        }
    }
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            tracing::warn!("bulk executor dropped without dispose; cancelling in-flight work");
            self.shutdown.cancel();
        }
    }
}

fn routing_error(status: Status) -> Error {
    if status.is_cancelled() {
        Error::Cancelled
    } else {
        Error::Transport(status)
    }
}

async fn rebatch_loop(
    inner: std::sync::Weak<ExecutorInner>,
    shutdown: CancellationToken,
    receiver: async_channel::Receiver<RebatchRequest>,
) {
    loop {
        let request = select! {
            _ = shutdown.cancelled() => break,
            request = receiver.recv() => match request {
                Ok(request) => request,
                Err(_closed) => return,
            },
        };
        match inner.upgrade() {
            Some(inner) => inner.rebatch(request).await,
            None => {
                request.operation.complete(Err(Error::Cancelled));
                break;
            }
        }
    }
    // shutdown: everything still queued resolves as cancelled
    while let Ok(request) = receiver.try_recv() {
        request.operation.complete(Err(Error::Cancelled));
    }
}
