use std::time::Duration;

/// One recorded step in an operation's journey through the engine.
///
/// Stored as plain variants and folded with [`RequestDiagnostics::summarize`];
/// consumers match on the kind directly.
#[derive(Clone, Debug)]
pub enum RequestDiagnostics {
    /// The operation's partition range was resolved at admission.
    PointLookup { range_id: String },
    /// The operation travelled in a server batch.
    Batch {
        range_id: String,
        operation_count: usize,
        backend_latency: Duration,
        request_charge: f64,
    },
    /// The operation waited out a server throttle before being rebatched.
    Throttle { retry_after: Duration, attempt: u32 },
    /// The operation forced a routing refresh after a stale-range signal.
    RoutingRefresh { previous_range_id: String },
}

impl RequestDiagnostics {
    pub fn summarize(&self) -> String {
        match self {
            RequestDiagnostics::PointLookup { range_id } => {
                format!("point lookup range={}", range_id)
            }
            RequestDiagnostics::Batch {
                range_id,
                operation_count,
                backend_latency,
                request_charge,
            } => format!(
                "batch range={} ops={} backend={:?} charge={}",
                range_id, operation_count, backend_latency, request_charge
            ),
            RequestDiagnostics::Throttle { retry_after, attempt } => {
                format!("throttled attempt={} retry_after={:?}", attempt, retry_after)
            }
            RequestDiagnostics::RoutingRefresh { previous_range_id } => {
                format!("routing refresh from range={}", previous_range_id)
            }
        }
    }
}
