use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

/// An HTTP-like status describing the result of a server interaction or of a
/// single operation inside a batch response.
#[derive(Clone, PartialEq)]
pub struct Status {
    code: StatusCode,
    sub_status: SubStatusCode,
    message: String,
    retry_after: Option<Duration>,
}

impl Status {
    pub fn new(code: StatusCode) -> Self {
        Status {
            code,
            sub_status: SubStatusCode::UNKNOWN,
            message: String::new(),
            retry_after: None,
        }
    }

    /// Status used when a caller or shutdown signal interrupted the request.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Status::new(StatusCode::CLIENT_CLOSED_REQUEST).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_sub_status(mut self, sub_status: SubStatusCode) -> Self {
        self.sub_status = sub_status;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn sub_status(&self) -> SubStatusCode {
        self.sub_status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Server-provided backoff hint, present on throttled responses.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    pub fn is_throttled(&self) -> bool {
        self.code == StatusCode::TOO_MANY_REQUESTS
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == StatusCode::CLIENT_CLOSED_REQUEST
    }

    /// True when the server signalled that the addressed partition range no
    /// longer exists in the form the client cached (split, merge or
    /// migration in progress).
    pub fn is_partition_range_gone(&self) -> bool {
        self.code == StatusCode::GONE
            && matches!(
                self.sub_status,
                SubStatusCode::PARTITION_KEY_RANGE_GONE
                    | SubStatusCode::COMPLETING_SPLIT
                    | SubStatusCode::COMPLETING_PARTITION_MIGRATION
            )
    }
}

impl Error for Status {}

impl Debug for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.code.as_u16())
            .field("sub_status", &self.sub_status.as_u32())
            .field("message", &self.message)
            .field("retry_after", &self.retry_after)
            .finish()
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "status {}/{}", self.code.as_u16(), self.sub_status.as_u32())
        } else {
            write!(
                f,
                "status {}/{}: {}",
                self.code.as_u16(),
                self.sub_status.as_u32(),
                self.message
            )
        }
    }
}

/// Status codes carried on [`Status`].
///
/// These are the HTTP status codes the document service responds with; the
/// additional `499` follows the common client-closed-request convention and
/// never comes from the server.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const CONFLICT: StatusCode = StatusCode(409);
    pub const GONE: StatusCode = StatusCode(410);
    pub const PRECONDITION_FAILED: StatusCode = StatusCode(412);
    pub const REQUEST_ENTITY_TOO_LARGE: StatusCode = StatusCode(413);
    pub const TOO_MANY_REQUESTS: StatusCode = StatusCode(429);
    pub const CLIENT_CLOSED_REQUEST: StatusCode = StatusCode(499);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    pub fn from_u16(code: u16) -> StatusCode {
        StatusCode(code)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl Debug for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Service sub-status codes refining a [`StatusCode`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubStatusCode(u32);

impl SubStatusCode {
    pub const UNKNOWN: SubStatusCode = SubStatusCode(0);
    /// The addressed partition key range was split or merged away.
    pub const PARTITION_KEY_RANGE_GONE: SubStatusCode = SubStatusCode(1002);
    /// The addressed range is mid-split; routing must be refreshed.
    pub const COMPLETING_SPLIT: SubStatusCode = SubStatusCode(1007);
    /// The addressed range is migrating between owners.
    pub const COMPLETING_PARTITION_MIGRATION: SubStatusCode = SubStatusCode(1008);

    pub fn from_u32(code: u32) -> SubStatusCode {
        SubStatusCode(code)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Debug for SubStatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Display for SubStatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_range_gone_requires_matching_sub_status() {
        let plain_gone = Status::new(StatusCode::GONE);
        assert!(!plain_gone.is_partition_range_gone());

        let split = Status::new(StatusCode::GONE).with_sub_status(SubStatusCode::COMPLETING_SPLIT);
        assert!(split.is_partition_range_gone());

        let throttled = Status::new(StatusCode::TOO_MANY_REQUESTS)
            .with_sub_status(SubStatusCode::PARTITION_KEY_RANGE_GONE);
        assert!(!throttled.is_partition_range_gone());
        assert!(throttled.is_throttled());
    }

    #[test]
    fn success_window() {
        assert!(Status::new(StatusCode::OK).is_success());
        assert!(Status::new(StatusCode::CREATED).is_success());
        assert!(!Status::new(StatusCode::NOT_MODIFIED).is_success());
        assert!(!Status::new(StatusCode::GONE).is_success());
    }
}
