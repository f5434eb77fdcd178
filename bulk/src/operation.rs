use bytes::Bytes;
use tokio::select;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use docdb_core::status::Status;

use crate::diagnostics::RequestDiagnostics;
use crate::error::Error;
use crate::retry_policy::RetryState;
use crate::routing::PartitionKeyValue;

/// Kind of a single-item operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Read,
    Replace,
    Upsert,
    Delete,
    Patch,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "Create",
            OperationKind::Read => "Read",
            OperationKind::Replace => "Replace",
            OperationKind::Upsert => "Upsert",
            OperationKind::Delete => "Delete",
            OperationKind::Patch => "Patch",
        }
    }
}

/// Per-operation options supplied to [`crate::executor::BulkExecutor::add`].
///
/// Only `if_match_etag` is honored in bulk mode. The remaining fields exist
/// so a caller migrating from point operations gets a clear rejection
/// instead of silently dropped behavior.
#[derive(Clone, Debug, Default)]
pub struct OperationOptions {
    pub if_match_etag: Option<String>,
    pub consistency_level: Option<String>,
    pub session_token: Option<String>,
    pub pre_triggers: Vec<String>,
    pub post_triggers: Vec<String>,
}

impl OperationOptions {
    pub(crate) fn validate_for_bulk(&self) -> Result<(), Error> {
        if self.consistency_level.is_some() {
            return Err(Error::InvalidUsage(
                "consistency level overrides are not supported in bulk mode".to_string(),
            ));
        }
        if self.session_token.is_some() {
            return Err(Error::InvalidUsage(
                "session tokens are not supported in bulk mode".to_string(),
            ));
        }
        if !self.pre_triggers.is_empty() || !self.post_triggers.is_empty() {
            return Err(Error::InvalidUsage(
                "pre/post triggers are not supported in bulk mode".to_string(),
            ));
        }
        Ok(())
    }
}

/// A single-item operation submitted to the bulk executor.
#[derive(Debug)]
pub struct Operation {
    kind: OperationKind,
    id: String,
    partition_key: PartitionKeyValue,
    resource_body: Option<serde_json::Value>,
    body: Option<Bytes>,
}

impl Operation {
    fn new(
        kind: OperationKind,
        id: impl Into<String>,
        partition_key: impl Into<PartitionKeyValue>,
        resource_body: Option<serde_json::Value>,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            partition_key: partition_key.into(),
            resource_body,
            body: None,
        }
    }

    pub fn create(
        id: impl Into<String>,
        partition_key: impl Into<PartitionKeyValue>,
        resource_body: serde_json::Value,
    ) -> Self {
        Self::new(OperationKind::Create, id, partition_key, Some(resource_body))
    }

    pub fn read(id: impl Into<String>, partition_key: impl Into<PartitionKeyValue>) -> Self {
        Self::new(OperationKind::Read, id, partition_key, None)
    }

    pub fn replace(
        id: impl Into<String>,
        partition_key: impl Into<PartitionKeyValue>,
        resource_body: serde_json::Value,
    ) -> Self {
        Self::new(OperationKind::Replace, id, partition_key, Some(resource_body))
    }

    pub fn upsert(
        id: impl Into<String>,
        partition_key: impl Into<PartitionKeyValue>,
        resource_body: serde_json::Value,
    ) -> Self {
        Self::new(OperationKind::Upsert, id, partition_key, Some(resource_body))
    }

    pub fn delete(id: impl Into<String>, partition_key: impl Into<PartitionKeyValue>) -> Self {
        Self::new(OperationKind::Delete, id, partition_key, None)
    }

    pub fn patch(
        id: impl Into<String>,
        partition_key: impl Into<PartitionKeyValue>,
        patch_document: serde_json::Value,
    ) -> Self {
        Self::new(OperationKind::Patch, id, partition_key, Some(patch_document))
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn partition_key(&self) -> &PartitionKeyValue {
        &self.partition_key
    }

    /// Serializes the wire record once. The serialized length is final after
    /// this call; retries reuse the same bytes.
    pub(crate) fn materialize(&mut self, options: &OperationOptions) -> Result<usize, Error> {
        if let Some(body) = &self.body {
            return Ok(body.len());
        }
        let mut record = serde_json::Map::new();
        record.insert(
            "operationType".to_string(),
            serde_json::Value::String(self.kind.as_str().to_string()),
        );
        record.insert("id".to_string(), serde_json::Value::String(self.id.clone()));
        record.insert("partitionKey".to_string(), self.partition_key.to_wire());
        if let Some(resource_body) = &self.resource_body {
            record.insert("resourceBody".to_string(), resource_body.clone());
        }
        if let Some(etag) = &options.if_match_etag {
            record.insert("ifMatch".to_string(), serde_json::Value::String(etag.clone()));
        }
        let mut bytes = serde_json::to_vec(&serde_json::Value::Object(record))
            .map_err(|e| Error::InvalidUsage(format!("operation body is not serializable: {e}")))?;
        bytes.push(b'\n');
        let len = bytes.len();
        self.body = Some(Bytes::from(bytes));
        Ok(len)
    }

    pub(crate) fn body_len(&self) -> usize {
        self.body.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub(crate) fn body(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }
}

/// Final result of one operation, as the server reported it.
#[derive(Clone, Debug)]
pub struct OperationResult {
    pub status: Status,
    pub resource: Option<serde_json::Value>,
    pub etag: Option<String>,
    pub request_charge: f64,
    pub diagnostics: Vec<RequestDiagnostics>,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Handle returned by `add`; resolves once the operation settles.
#[derive(Debug)]
pub struct OperationAwaiter {
    consumer: oneshot::Receiver<Result<OperationResult, Error>>,
}

impl OperationAwaiter {
    pub(crate) fn new(consumer: oneshot::Receiver<Result<OperationResult, Error>>) -> Self {
        Self { consumer }
    }

    pub(crate) fn resolved(result: Result<OperationResult, Error>) -> Self {
        let (producer, consumer) = oneshot::channel();
        let _ = producer.send(result);
        Self { consumer }
    }

    /// Waits for the operation to settle. The engine resolves every admitted
    /// operation exactly once; a closed channel means the executor was torn
    /// down, which surfaces as [`Error::Cancelled`].
    pub async fn get(self, cancel: Option<CancellationToken>) -> Result<OperationResult, Error> {
        let consumer = self.consumer;
        let awaited = match cancel {
            Some(cancel) => {
                select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    v = consumer => v
                }
            }
            None => consumer.await,
        };
        match awaited {
            Ok(v) => v,
            Err(_closed) => Err(Error::Cancelled),
        }
    }
}

/// Per-operation engine state: the partition range the operation is
/// currently homed to, its private retry state, the single-shot result sink
/// and the diagnostics trail.
pub(crate) struct OperationContext {
    pub(crate) range_id: String,
    pub(crate) retry: RetryState,
    pub(crate) sink: oneshot::Sender<Result<OperationResult, Error>>,
    pub(crate) diagnostics: Vec<RequestDiagnostics>,
}

/// An operation travelling through the engine together with its context.
/// Single-owner by construction: whoever holds it either completes it or
/// hands it on, so the sink resolves at most once.
pub(crate) struct ReservedOperation {
    pub(crate) operation: Operation,
    pub(crate) context: OperationContext,
}

impl ReservedOperation {
    pub(crate) fn complete(self, result: Result<OperationResult, Error>) {
        if self.context.sink.send(result).is_err() {
            tracing::trace!("awaiter dropped before completion: id={}", self.operation.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_is_idempotent_and_final() {
        let mut op = Operation::create("doc-1", "pk-1", serde_json::json!({"v": 1}));
        let options = OperationOptions::default();
        let first = op.materialize(&options).unwrap();
        assert_eq!(first, op.body_len());
        // a second call must not re-serialize
        let second = op.materialize(&options).unwrap();
        assert_eq!(first, second);
        assert!(op.body().ends_with(b"\n"));
    }

    #[test]
    fn materialize_carries_if_match() {
        let mut op = Operation::replace("doc-1", "pk-1", serde_json::json!({"v": 2}));
        let options = OperationOptions {
            if_match_etag: Some("\"abc\"".to_string()),
            ..Default::default()
        };
        op.materialize(&options).unwrap();
        let record: serde_json::Value = serde_json::from_slice(op.body()).unwrap();
        assert_eq!(record["ifMatch"], "\"abc\"");
        assert_eq!(record["operationType"], "Replace");
    }

    #[test]
    fn bulk_rejects_point_operation_options() {
        let with_session = OperationOptions {
            session_token: Some("token".to_string()),
            ..Default::default()
        };
        assert!(with_session.validate_for_bulk().is_err());

        let with_triggers = OperationOptions {
            pre_triggers: vec!["t".to_string()],
            ..Default::default()
        };
        assert!(with_triggers.validate_for_bulk().is_err());

        assert!(OperationOptions::default().validate_for_bulk().is_ok());
    }
}
