use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use docdb_core::status::{Status, StatusCode, SubStatusCode};

use crate::error::Error;
use crate::routing::{PartitionKeyDefinition, PartitionKeyValue, RoutingMap};

/// Request headers the engine sets on every batch dispatch.
pub mod headers {
    pub const PARTITION_KEY_RANGE_ID: &str = "x-ms-documentdb-partitionkeyrangeid";
    pub const BATCH_CONTINUE_ON_ERROR: &str = "x-ms-cosmos-batch-continue-on-error";
    pub const IS_BATCH_REQUEST: &str = "x-ms-cosmos-is-batch-request";
    pub const REQUEST_CHARGE: &str = "x-ms-request-charge";
    pub const RETRY_AFTER_MS: &str = "x-ms-retry-after-ms";
    pub const SUB_STATUS: &str = "x-ms-substatus";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceType {
    Document,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationType {
    Batch,
}

/// One server request carrying a sealed batch. The body is a single-owner
/// handoff; it is not reusable after dispatch.
#[derive(Debug)]
pub struct BatchRequest {
    pub link: String,
    pub resource_type: ResourceType,
    pub operation_type: OperationType,
    pub partition_key_range_id: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl BatchRequest {
    pub(crate) fn new(link: String, partition_key_range_id: String, body: Bytes) -> Self {
        let mut request_headers = HashMap::new();
        request_headers.insert(
            headers::PARTITION_KEY_RANGE_ID.to_string(),
            partition_key_range_id.clone(),
        );
        request_headers.insert(headers::BATCH_CONTINUE_ON_ERROR.to_string(), "true".to_string());
        request_headers.insert(headers::IS_BATCH_REQUEST.to_string(), "true".to_string());
        Self {
            link,
            resource_type: ResourceType::Document,
            operation_type: OperationType::Batch,
            partition_key_range_id,
            headers: request_headers,
            body,
        }
    }

    /// Number of operation records framed into the body.
    pub fn operation_count(&self) -> usize {
        self.body.split(|b| *b == b'\n').filter(|line| !line.is_empty()).count()
    }
}

/// Raw transport response before batch parsing.
#[derive(Clone, Debug)]
pub struct ResponseMessage {
    pub status: Status,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl ResponseMessage {
    pub fn new(status: Status, body: Bytes) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    fn request_charge(&self) -> f64 {
        self.headers
            .get(headers::REQUEST_CHARGE)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }
}

/// Serialized per-operation result inside a batch response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperationResponse {
    pub status_code: u16,
    #[serde(default)]
    pub sub_status_code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_milliseconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
    #[serde(default)]
    pub request_charge: f64,
}

impl BatchOperationResponse {
    pub fn status(&self) -> Status {
        let mut status = Status::new(StatusCode::from_u16(self.status_code))
            .with_sub_status(SubStatusCode::from_u32(self.sub_status_code));
        if let Some(millis) = self.retry_after_milliseconds {
            status = status.with_retry_after(Duration::from_millis(millis));
        }
        status
    }
}

/// Parsed batch response: overall status, request charge and one result per
/// operation, in admission order.
#[derive(Clone, Debug)]
pub struct BatchResponse {
    pub status: Status,
    pub request_charge: f64,
    pub results: Vec<BatchOperationResponse>,
}

impl BatchResponse {
    /// Parses a transport response. A result count different from
    /// `expected_count` is a protocol violation, never a retryable state.
    pub fn parse(message: ResponseMessage, expected_count: usize) -> Result<Self, Error> {
        let results: Vec<BatchOperationResponse> = serde_json::from_slice(&message.body)
            .map_err(|e| Error::Protocol(format!("malformed batch response body: {e}")))?;
        if results.len() != expected_count {
            return Err(Error::Protocol(format!(
                "batch response carried {} results for {} operations",
                results.len(),
                expected_count
            )));
        }
        Ok(Self {
            request_charge: message.request_charge(),
            status: message.status,
            results,
        })
    }
}

/// The container collaborators the engine consumes: the RPC transport and
/// the partition routing surface. Implementations wrap whatever client the
/// binding uses; tests script one in process.
#[async_trait]
pub trait ContainerFacade: Send + Sync + 'static {
    /// Link of the collection the executor is bound to.
    fn link(&self) -> &str;

    /// Sends one batch request and returns the raw response.
    async fn process_resource_operation(
        &self,
        request: BatchRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ResponseMessage, Status>;

    async fn partition_key_definition(
        &self,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<PartitionKeyDefinition, Status>;

    /// Current routing map. `force_refresh` bypasses any cached map after a
    /// stale-routing signal.
    async fn routing_map(
        &self,
        force_refresh: bool,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<Arc<RoutingMap>, Status>;

    /// The container-level value that documents written with the explicit
    /// "no partition key" sentinel route through.
    async fn none_partition_key_value(
        &self,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<PartitionKeyValue, Status>;
}
