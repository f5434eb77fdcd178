use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::limiter::PermitLimiter;

/// Per-range counters written by the dispatcher and read by the controller.
/// Relaxed atomics; the control loop tolerates a tick of staleness.
#[derive(Default)]
pub(crate) struct RangeMetrics {
    pub(crate) docs_served: AtomicU64,
    pub(crate) throttled: AtomicU64,
    pub(crate) backend_millis: AtomicU64,
}

impl RangeMetrics {
    pub(crate) fn snapshot(&self) -> RangeMetricsSnapshot {
        RangeMetricsSnapshot {
            docs_served: self.docs_served.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            backend_millis: self.backend_millis.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of one range's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeMetricsSnapshot {
    pub docs_served: u64,
    pub throttled: u64,
    pub backend_millis: u64,
}

/// Congestion tunables. Not part of the public options surface.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CongestionConfig {
    pub(crate) initial_degree_of_concurrency: usize,
    pub(crate) max_degree_of_concurrency: usize,
    pub(crate) initial_additive_factor: usize,
    pub(crate) idle_wait: Duration,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            initial_degree_of_concurrency: 5,
            max_degree_of_concurrency: 60,
            initial_additive_factor: 5,
            idle_wait: Duration::from_millis(2),
        }
    }
}

/// Additive-increase/multiplicative-decrease control over one range's permit
/// budget.
///
/// The tick is keyed on cumulative backend time rather than wall-clock, so
/// the loop responds to actual work done against the range. Each elapsed
/// observation window grows by one second (`wait_secs += 1`, uncapped). The
/// additive factor starts at 5 and drops to 1 permanently after the first
/// decrease event.
pub(crate) struct CongestionController {
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CongestionController {
    pub(crate) fn spawn(
        range_id: String,
        metrics: Arc<RangeMetrics>,
        limiter: Arc<PermitLimiter>,
        config: CongestionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let task = tokio::spawn(async move {
            tracing::debug!("start congestion controller: range={}", range_id);
            run(&range_id, metrics, limiter, config, shutdown).await;
            tracing::debug!("stop congestion controller: range={}", range_id);
        });
        Self {
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Waits for the control loop to exit. The loop only exits on its
    /// shutdown token, so cancel first.
    pub(crate) async fn done(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for CongestionController {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn run(
    range_id: &str,
    metrics: Arc<RangeMetrics>,
    limiter: Arc<PermitLimiter>,
    config: CongestionConfig,
    shutdown: CancellationToken,
) {
    let mut last_backend_secs: u64 = 0;
    let mut wait_secs: u64 = 1;
    let mut old_docs: u64 = 0;
    let mut old_throttle: u64 = 0;
    let mut degree_of_concurrency = config.initial_degree_of_concurrency;
    let mut additive_factor = config.initial_additive_factor;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let current_backend_secs = metrics.backend_millis.load(Ordering::Relaxed) / 1000;
        if current_backend_secs.saturating_sub(last_backend_secs) < wait_secs {
            select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(config.idle_wait) => continue,
            }
        }
        last_backend_secs = current_backend_secs;
        wait_secs += 1;

        let docs = metrics.docs_served.load(Ordering::Relaxed);
        let throttle = metrics.throttled.load(Ordering::Relaxed);
        let delta_docs = docs.saturating_sub(old_docs);
        let delta_throttle = throttle.saturating_sub(old_throttle);
        old_docs = docs;
        old_throttle = throttle;

        if delta_throttle > 0 {
            additive_factor = 1;
            let decrease = decrease_count(degree_of_concurrency, delta_throttle);
            if decrease > 0 {
                tracing::debug!(
                    "congestion decrease: range={} throttles={} dop={}->{}",
                    range_id,
                    delta_throttle,
                    degree_of_concurrency,
                    degree_of_concurrency - decrease
                );
                // blocking on purpose: new dispatches stay parked until the
                // seized permits drain out of in-flight batches
                if !limiter.seize(decrease as u32, &shutdown).await {
                    return;
                }
                degree_of_concurrency -= decrease;
            }
        } else if delta_docs > 0 {
            if degree_of_concurrency + additive_factor <= config.max_degree_of_concurrency {
                limiter.release(additive_factor);
                degree_of_concurrency += additive_factor;
                tracing::trace!(
                    "congestion increase: range={} dop={}",
                    range_id,
                    degree_of_concurrency
                );
            }
        }
    }
}

/// How many permits a decrease event removes: `floor(dop / decrease_factor)`
/// with `decrease_factor = 1 + 1000 / max(Δthrottle, 1000)`.
fn decrease_count(degree_of_concurrency: usize, delta_throttle: u64) -> usize {
    let decrease_factor = 1.0 + 1000.0 / (delta_throttle.max(1000) as f64);
    (degree_of_concurrency as f64 / decrease_factor).floor() as usize
}
