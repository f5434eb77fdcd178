use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use docdb_core::status::Status;

use crate::congestion::RangeMetrics;
use crate::diagnostics::RequestDiagnostics;
use crate::error::Error;
use crate::limiter::PermitLimiter;
use crate::operation::{OperationResult, ReservedOperation};
use crate::retry_policy::RetryDecision;
use crate::transport::{BatchRequest, BatchResponse, ContainerFacade};

/// An operation going back through routing into a (possibly different)
/// streamer, with its retry state intact.
pub(crate) struct RebatchRequest {
    pub(crate) operation: ReservedOperation,
    pub(crate) refresh_routing: bool,
}

/// Per-partition-range dispatcher: turns sealed batches into server
/// requests and fans per-operation results back to their awaiters or into
/// the rebatch pipeline.
pub(crate) struct Dispatcher {
    range_id: String,
    facade: Arc<dyn ContainerFacade>,
    limiter: Arc<PermitLimiter>,
    metrics: Arc<RangeMetrics>,
    rebatch: async_channel::Sender<RebatchRequest>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub(crate) fn new(
        range_id: String,
        facade: Arc<dyn ContainerFacade>,
        limiter: Arc<PermitLimiter>,
        metrics: Arc<RangeMetrics>,
        rebatch: async_channel::Sender<RebatchRequest>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            range_id,
            facade,
            limiter,
            metrics,
            rebatch,
            shutdown,
            tracker,
        }
    }

    pub(crate) async fn dispatch(&self, batch: Vec<ReservedOperation>) {
        // one permit per batch in flight against this range
        let _permit = match self.limiter.acquire(&self.shutdown).await {
            Ok(permit) => permit,
            Err(_) => {
                self.fail(batch, Error::Cancelled);
                return;
            }
        };

        let mut body = BytesMut::new();
        for reserved in &batch {
            body.extend_from_slice(reserved.operation.body());
        }
        let request = BatchRequest::new(self.facade.link().to_string(), self.range_id.clone(), body.freeze());
        tracing::trace!(
            "dispatch batch: range={} ops={} bytes={}",
            self.range_id,
            batch.len(),
            request.body.len()
        );

        let started = tokio::time::Instant::now();
        let response = select! {
            _ = self.shutdown.cancelled() => Err(Status::cancelled("executor disposed")),
            r = self.facade.process_resource_operation(request, self.shutdown.child_token()) => r,
        };
        let backend_latency = started.elapsed();
        self.metrics
            .backend_millis
            .fetch_add(backend_latency.as_millis() as u64, Ordering::Relaxed);

        let message = match response {
            Ok(message) => message,
            Err(status) => {
                if status.is_cancelled() {
                    self.fail(batch, Error::Cancelled);
                } else {
                    tracing::error!("batch dispatch failed: range={} {}", self.range_id, status);
                    for reserved in batch {
                        self.settle_transport_failure(reserved, status.clone());
                    }
                }
                return;
            }
        };

        let parsed = match BatchResponse::parse(message, batch.len()) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::error!("batch response rejected: range={} {}", self.range_id, error);
                self.fail(batch, error);
                return;
            }
        };

        self.metrics.docs_served.fetch_add(batch.len() as u64, Ordering::Relaxed);
        let throttles = parsed.results.iter().filter(|r| r.status().is_throttled()).count();
        if throttles > 0 {
            self.metrics.throttled.fetch_add(throttles as u64, Ordering::Relaxed);
        }

        let batch_diagnostics = RequestDiagnostics::Batch {
            range_id: self.range_id.clone(),
            operation_count: parsed.results.len(),
            backend_latency,
            request_charge: parsed.request_charge,
        };
        for (reserved, result) in batch.into_iter().zip(parsed.results) {
            self.settle(reserved, result, &batch_diagnostics);
        }
    }

    fn settle(
        &self,
        mut reserved: ReservedOperation,
        result: crate::transport::BatchOperationResponse,
        batch_diagnostics: &RequestDiagnostics,
    ) {
        let status = result.status();
        reserved.context.diagnostics.push(batch_diagnostics.clone());
        match reserved.context.retry.decide(&status) {
            RetryDecision::Complete => {
                let diagnostics = std::mem::take(&mut reserved.context.diagnostics);
                reserved.complete(Ok(OperationResult {
                    status,
                    resource: result.resource_body,
                    etag: result.e_tag,
                    request_charge: result.request_charge,
                    diagnostics,
                }));
            }
            RetryDecision::Retry { delay, refresh_routing } => {
                self.note_retry(&mut reserved, delay, refresh_routing);
                self.requeue(reserved, delay, refresh_routing);
            }
        }
    }

    /// Whole-batch failure: each operation's own retry state decides whether
    /// it goes back through routing or surfaces the failure.
    fn settle_transport_failure(&self, mut reserved: ReservedOperation, status: Status) {
        match reserved.context.retry.decide(&status) {
            RetryDecision::Complete => reserved.complete(Err(Error::Transport(status))),
            RetryDecision::Retry { delay, refresh_routing } => {
                self.note_retry(&mut reserved, delay, refresh_routing);
                self.requeue(reserved, delay, refresh_routing);
            }
        }
    }

    fn note_retry(&self, reserved: &mut ReservedOperation, delay: Duration, refresh_routing: bool) {
        if refresh_routing {
            reserved.context.diagnostics.push(RequestDiagnostics::RoutingRefresh {
                previous_range_id: reserved.context.range_id.clone(),
            });
        } else {
            reserved.context.diagnostics.push(RequestDiagnostics::Throttle {
                retry_after: delay,
                attempt: reserved.context.retry.throttle_attempts(),
            });
        }
    }

    fn requeue(&self, reserved: ReservedOperation, delay: Duration, refresh_routing: bool) {
        let rebatch = self.rebatch.clone();
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            if delay > Duration::ZERO {
                select! {
                    _ = shutdown.cancelled() => {
                        reserved.complete(Err(Error::Cancelled));
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let request = RebatchRequest {
                operation: reserved,
                refresh_routing,
            };
            if let Err(send_error) = rebatch.send(request).await {
                send_error.0.operation.complete(Err(Error::Cancelled));
            }
        });
    }

    fn fail(&self, batch: Vec<ReservedOperation>, error: Error) {
        for reserved in batch {
            reserved.complete(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Operation, OperationContext, OperationOptions};
    use crate::retry_policy::{RetryState, ThrottleRetrySetting};
    use crate::routing::{PartitionKeyDefinition, PartitionKeyValue, RoutingMap};
    use crate::transport::{BatchOperationResponse, ResponseMessage};
    use bytes::Bytes;
    use docdb_core::status::StatusCode;
    use tokio::sync::oneshot;

    struct ScriptedFacade {
        results: Vec<BatchOperationResponse>,
    }

    #[async_trait::async_trait]
    impl ContainerFacade for ScriptedFacade {
        fn link(&self) -> &str {
            "dbs/d/colls/c"
        }

        async fn process_resource_operation(
            &self,
            _request: BatchRequest,
            _cancel: CancellationToken,
        ) -> Result<ResponseMessage, Status> {
            let body = serde_json::to_vec(&self.results).unwrap();
            Ok(ResponseMessage::new(Status::new(StatusCode::OK), Bytes::from(body)))
        }

        async fn partition_key_definition(
            &self,
            _cancel: CancellationToken,
        ) -> Result<PartitionKeyDefinition, Status> {
            Ok(PartitionKeyDefinition::default())
        }

        async fn routing_map(
            &self,
            _force_refresh: bool,
            _cancel: CancellationToken,
        ) -> Result<Arc<RoutingMap>, Status> {
            Ok(Arc::new(RoutingMap::single("0")))
        }

        async fn none_partition_key_value(
            &self,
            _cancel: CancellationToken,
        ) -> Result<PartitionKeyValue, Status> {
            Ok(PartitionKeyValue::Null)
        }
    }

    fn reserved(id: &str) -> (ReservedOperation, oneshot::Receiver<Result<OperationResult, Error>>) {
        let mut operation = Operation::create(id, "pk", serde_json::json!({"k": id}));
        operation.materialize(&OperationOptions::default()).unwrap();
        let (producer, consumer) = oneshot::channel();
        let reserved = ReservedOperation {
            operation,
            context: OperationContext {
                range_id: "0".to_string(),
                retry: RetryState::new(ThrottleRetrySetting::default()),
                sink: producer,
                diagnostics: Vec::new(),
            },
        };
        (reserved, consumer)
    }

    fn dispatcher(
        facade: Arc<dyn ContainerFacade>,
    ) -> (Dispatcher, async_channel::Receiver<RebatchRequest>) {
        let (rebatch, rebatch_rx) = async_channel::unbounded();
        let dispatcher = Dispatcher::new(
            "0".to_string(),
            facade,
            Arc::new(PermitLimiter::new(1)),
            Arc::new(RangeMetrics::default()),
            rebatch,
            CancellationToken::new(),
            TaskTracker::new(),
        );
        (dispatcher, rebatch_rx)
    }

    fn ok_result(code: u16) -> BatchOperationResponse {
        BatchOperationResponse {
            status_code: code,
            sub_status_code: 0,
            retry_after_milliseconds: None,
            resource_body: None,
            e_tag: None,
            request_charge: 1.0,
        }
    }

    #[tokio::test]
    async fn count_mismatch_is_a_protocol_violation_for_every_operation() {
        let facade = Arc::new(ScriptedFacade {
            results: vec![ok_result(201)],
        });
        let (dispatcher, _rebatch_rx) = dispatcher(facade);

        let (a, a_rx) = reserved("a");
        let (b, b_rx) = reserved("b");
        dispatcher.dispatch(vec![a, b]).await;

        for rx in [a_rx, b_rx] {
            match rx.await.unwrap() {
                Err(Error::Protocol(_)) => {}
                other => panic!("expected protocol violation, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn throttled_result_lands_in_the_rebatch_pipeline() {
        let throttled = BatchOperationResponse {
            retry_after_milliseconds: Some(0),
            ..ok_result(429)
        };
        let facade = Arc::new(ScriptedFacade {
            results: vec![ok_result(201), throttled],
        });
        let (dispatcher, rebatch_rx) = dispatcher(facade);

        let (a, a_rx) = reserved("a");
        let (b, _b_rx) = reserved("b");
        dispatcher.dispatch(vec![a, b]).await;

        assert!(a_rx.await.unwrap().unwrap().is_success());
        let requeued = rebatch_rx.recv().await.unwrap();
        assert_eq!(requeued.operation.operation.id(), "b");
        assert!(!requeued.refresh_routing);
        // counters saw the batch and the throttle
        assert_eq!(dispatcher.metrics.snapshot().docs_served, 2);
        assert_eq!(dispatcher.metrics.snapshot().throttled, 1);
    }

    #[tokio::test]
    async fn permits_balance_after_dispatch() {
        let facade = Arc::new(ScriptedFacade {
            results: vec![ok_result(200)],
        });
        let (dispatcher, _rebatch_rx) = dispatcher(facade);
        let (op, _rx) = reserved("a");
        dispatcher.dispatch(vec![op]).await;
        assert_eq!(dispatcher.limiter.available(), 1);
    }

    struct FailingFacade {
        status: Status,
    }

    #[async_trait::async_trait]
    impl ContainerFacade for FailingFacade {
        fn link(&self) -> &str {
            "dbs/d/colls/c"
        }

        async fn process_resource_operation(
            &self,
            _request: BatchRequest,
            _cancel: CancellationToken,
        ) -> Result<ResponseMessage, Status> {
            Err(self.status.clone())
        }

        async fn partition_key_definition(
            &self,
            _cancel: CancellationToken,
        ) -> Result<PartitionKeyDefinition, Status> {
            Ok(PartitionKeyDefinition::default())
        }

        async fn routing_map(
            &self,
            _force_refresh: bool,
            _cancel: CancellationToken,
        ) -> Result<Arc<RoutingMap>, Status> {
            Ok(Arc::new(RoutingMap::single("0")))
        }

        async fn none_partition_key_value(
            &self,
            _cancel: CancellationToken,
        ) -> Result<PartitionKeyValue, Status> {
            Ok(PartitionKeyValue::Null)
        }
    }

    #[tokio::test]
    async fn transport_failure_surfaces_to_every_operation() {
        let facade = Arc::new(FailingFacade {
            status: Status::new(StatusCode::SERVICE_UNAVAILABLE),
        });
        let (dispatcher, _rebatch_rx) = dispatcher(facade);

        let (a, a_rx) = reserved("a");
        let (b, b_rx) = reserved("b");
        dispatcher.dispatch(vec![a, b]).await;

        for rx in [a_rx, b_rx] {
            match rx.await.unwrap() {
                Err(Error::Transport(status)) => {
                    assert_eq!(status.code(), StatusCode::SERVICE_UNAVAILABLE)
                }
                other => panic!("expected transport failure, got {other:?}"),
            }
        }
        // the permit came back even though the batch failed
        assert_eq!(dispatcher.limiter.available(), 1);
    }

    #[tokio::test]
    async fn throttling_transport_failure_is_salvaged_per_operation() {
        let facade = Arc::new(FailingFacade {
            status: Status::new(StatusCode::TOO_MANY_REQUESTS),
        });
        let (dispatcher, rebatch_rx) = dispatcher(facade);

        let (op, _rx) = reserved("a");
        dispatcher.dispatch(vec![op]).await;

        let requeued = rebatch_rx.recv().await.unwrap();
        assert_eq!(requeued.operation.operation.id(), "a");
        assert!(!requeued.refresh_routing);
    }
}
