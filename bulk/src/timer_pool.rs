use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of a pooled timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerSignal {
    Fired,
    Cancelled,
}

struct PendingTimer {
    id: u64,
    producer: oneshot::Sender<TimerSignal>,
}

struct PoolState {
    next_id: u64,
    tick: u64,
    buckets: BTreeMap<u64, Vec<PendingTimer>>,
    disposed: bool,
}

/// A coalescing source of one-shot deadlines at whole-second granularity.
///
/// All dispatch deadlines of all streamers share one ticking task; thousands
/// of concurrent buffers cost one timer each in a per-second bucket instead
/// of one runtime timer each.
pub(crate) struct TimerPool {
    state: Arc<Mutex<PoolState>>,
    shutdown: CancellationToken,
    resolution: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimerPool {
    pub(crate) fn new() -> Self {
        Self::with_resolution(Duration::from_secs(1))
    }

    pub(crate) fn with_resolution(resolution: Duration) -> Self {
        // minimum resolution floor
        let resolution = resolution.max(Duration::from_secs(1));
        let state = Arc::new(Mutex::new(PoolState {
            next_id: 0,
            tick: 0,
            buckets: BTreeMap::new(),
            disposed: false,
        }));
        let shutdown = CancellationToken::new();

        let tick_state = Arc::clone(&state);
        let tick_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(resolution);
            interval.tick().await;
            loop {
                select! {
                    _ = tick_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let due = {
                            let mut state = tick_state.lock();
                            state.tick += 1;
                            let tick = state.tick;
                            let mut due = Vec::new();
                            while let Some(entry) = state.buckets.first_entry() {
                                if *entry.key() > tick {
                                    break;
                                }
                                due.append(&mut entry.remove());
                            }
                            due
                        };
                        for timer in due {
                            let _ = timer.producer.send(TimerSignal::Fired);
                        }
                    }
                }
            }
            let remaining: Vec<PendingTimer> = {
                let mut state = tick_state.lock();
                state.disposed = true;
                std::mem::take(&mut state.buckets).into_values().flatten().collect()
            };
            for timer in remaining {
                let _ = timer.producer.send(TimerSignal::Cancelled);
            }
        });

        Self {
            state,
            shutdown,
            resolution,
            task: Mutex::new(Some(task)),
        }
    }

    /// Schedules a deadline `delay` from now, rounded up to the pool
    /// resolution. The handle's future completes at or after the deadline.
    pub(crate) fn schedule(&self, delay: Duration) -> TimerHandle {
        let resolution_millis = self.resolution.as_millis().max(1);
        let ticks = (delay.as_millis().div_ceil(resolution_millis)).max(1) as u64;

        let (producer, consumer) = oneshot::channel();
        let key = {
            let mut state = self.state.lock();
            if state.disposed {
                let _ = producer.send(TimerSignal::Cancelled);
                TimerKey { deadline: 0, id: 0 }
            } else {
                state.next_id += 1;
                let key = TimerKey {
                    deadline: state.tick + ticks,
                    id: state.next_id,
                };
                state
                    .buckets
                    .entry(key.deadline)
                    .or_default()
                    .push(PendingTimer { id: key.id, producer });
                key
            }
        };
        TimerHandle {
            key,
            state: Arc::clone(&self.state),
            consumer,
        }
    }

    /// Stops the ticking task and completes every outstanding timer with
    /// [`TimerSignal::Cancelled`].
    pub(crate) async fn dispose(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for TimerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct TimerKey {
    deadline: u64,
    id: u64,
}

/// A scheduled deadline. `wait` consumes the handle; cancellation goes
/// through a [`TimerCanceller`] taken before handing the handle off.
pub(crate) struct TimerHandle {
    key: TimerKey,
    state: Arc<Mutex<PoolState>>,
    consumer: oneshot::Receiver<TimerSignal>,
}

impl TimerHandle {
    pub(crate) fn canceller(&self) -> TimerCanceller {
        TimerCanceller {
            key: self.key,
            state: Arc::clone(&self.state),
        }
    }

    pub(crate) async fn wait(self) -> TimerSignal {
        self.consumer.await.unwrap_or(TimerSignal::Cancelled)
    }
}

pub(crate) struct TimerCanceller {
    key: TimerKey,
    state: Arc<Mutex<PoolState>>,
}

impl TimerCanceller {
    /// Idempotent: the first call completes the timer's future with a
    /// cancellation marker; later calls (or a cancel after firing) are
    /// no-ops.
    pub(crate) fn cancel(&self) {
        let timer = {
            let mut state = self.state.lock();
            match state.buckets.get_mut(&self.key.deadline) {
                None => None,
                Some(bucket) => {
                    let timer = bucket
                        .iter()
                        .position(|t| t.id == self.key.id)
                        .map(|i| bucket.remove(i));
                    if bucket.is_empty() {
                        state.buckets.remove(&self.key.deadline);
                    }
                    timer
                }
            }
        };
        if let Some(timer) = timer {
            let _ = timer.producer.send(TimerSignal::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_at_or_after_deadline() {
        let pool = TimerPool::new();
        let started = tokio::time::Instant::now();
        let handle = pool.schedule(Duration::from_secs(1));
        assert_eq!(handle.wait().await, TimerSignal::Fired);
        assert!(started.elapsed() >= Duration::from_secs(1));
        pool.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sub_second_delay_is_floored_to_one_tick() {
        let pool = TimerPool::new();
        let started = tokio::time::Instant::now();
        let handle = pool.schedule(Duration::from_millis(10));
        assert_eq!(handle.wait().await, TimerSignal::Fired);
        assert!(started.elapsed() >= Duration::from_secs(1));
        pool.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_completes_with_marker_and_is_idempotent() {
        let pool = TimerPool::new();
        let handle = pool.schedule(Duration::from_secs(5));
        let canceller = handle.canceller();
        canceller.cancel();
        canceller.cancel();
        assert_eq!(handle.wait().await, TimerSignal::Cancelled);
        pool.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_cancels_outstanding_timers() {
        let pool = TimerPool::new();
        let handle = pool.schedule(Duration::from_secs(30));
        pool.dispose().await;
        assert_eq!(handle.wait().await, TimerSignal::Cancelled);
        // scheduling against a disposed pool resolves immediately
        let late = pool.schedule(Duration::from_secs(1));
        assert_eq!(late.wait().await, TimerSignal::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_timers_fire_together() {
        let pool = TimerPool::new();
        let a = pool.schedule(Duration::from_secs(2));
        let b = pool.schedule(Duration::from_secs(2));
        assert_eq!(a.wait().await, TimerSignal::Fired);
        assert_eq!(b.wait().await, TimerSignal::Fired);
        pool.dispose().await;
    }
}
