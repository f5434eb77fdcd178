use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::task::TaskTracker;

use crate::dispatcher::Dispatcher;
use crate::operation::ReservedOperation;
use crate::timer_pool::{TimerCanceller, TimerPool, TimerSignal};

/// The active accumulation buffer of one streamer.
///
/// `generation` ties a scheduled dispatch deadline to the buffer it was
/// armed for; sealing bumps it, so a timer that fires after a fill-based
/// seal finds a different generation and backs off. That makes the two seal
/// paths mutually exclusive without holding the lock across dispatch.
struct BatchBuffer {
    operations: Vec<ReservedOperation>,
    body_bytes: usize,
    generation: u64,
    deadline: Option<TimerCanceller>,
}

impl BatchBuffer {
    fn new() -> Self {
        Self {
            operations: Vec::new(),
            body_bytes: 0,
            generation: 0,
            deadline: None,
        }
    }

    fn can_admit(&self, operation: &ReservedOperation, max_operations: usize, max_body_bytes: usize) -> bool {
        if self.operations.is_empty() {
            return true;
        }
        self.operations.len() < max_operations
            && self.body_bytes + operation.operation.body_len() <= max_body_bytes
    }

    fn push(&mut self, operation: ReservedOperation) {
        self.body_bytes += operation.operation.body_len();
        self.operations.push(operation);
    }

    fn seal(&mut self) -> Vec<ReservedOperation> {
        if let Some(deadline) = self.deadline.take() {
            deadline.cancel();
        }
        self.generation += 1;
        self.body_bytes = 0;
        std::mem::take(&mut self.operations)
    }
}

/// Per-partition-range accumulator: turns a stream of single operations
/// into sealed batches, by fill or by deadline.
#[derive(Clone)]
pub(crate) struct Streamer {
    inner: Arc<StreamerInner>,
}

struct StreamerInner {
    range_id: String,
    max_operations: usize,
    max_body_bytes: usize,
    dispatch_timer: Duration,
    current: Mutex<BatchBuffer>,
    timer_pool: Arc<TimerPool>,
    dispatcher: Arc<Dispatcher>,
    tracker: TaskTracker,
}

impl Streamer {
    pub(crate) fn new(
        range_id: String,
        max_operations: usize,
        max_body_bytes: usize,
        dispatch_timer: Duration,
        timer_pool: Arc<TimerPool>,
        dispatcher: Arc<Dispatcher>,
        tracker: TaskTracker,
    ) -> Self {
        tracing::debug!("start streamer: range={}", range_id);
        Self {
            inner: Arc::new(StreamerInner {
                range_id,
                max_operations,
                max_body_bytes,
                dispatch_timer,
                current: Mutex::new(BatchBuffer::new()),
                timer_pool,
                dispatcher,
                tracker,
            }),
        }
    }

    /// Admits one operation. Never fails; anything that goes wrong later is
    /// delivered on the operation's own result future.
    ///
    /// Safe for concurrent callers: the seal-and-swap below is the single
    /// critical section, and operations land in batches in admission order.
    pub(crate) fn add(&self, operation: ReservedOperation) {
        let sealed = {
            let mut current = self.inner.current.lock();
            let sealed = if current.can_admit(&operation, self.inner.max_operations, self.inner.max_body_bytes) {
                None
            } else {
                Some(current.seal())
            };
            current.push(operation);
            if current.operations.len() == 1 {
                self.arm_deadline(&mut current);
            }
            sealed
        };
        if let Some(batch) = sealed {
            self.dispatch(batch);
        }
    }

    /// Seals and dispatches whatever the buffer holds. Used at shutdown so
    /// no admitted operation is left behind.
    pub(crate) fn force_flush(&self) {
        let sealed = {
            let mut current = self.inner.current.lock();
            if current.operations.is_empty() {
                None
            } else {
                Some(current.seal())
            }
        };
        if let Some(batch) = sealed {
            tracing::trace!("flush rest buffer: range={}", self.inner.range_id);
            self.dispatch(batch);
        }
    }

    fn arm_deadline(&self, current: &mut BatchBuffer) {
        let handle = self.inner.timer_pool.schedule(self.inner.dispatch_timer);
        current.deadline = Some(handle.canceller());
        let generation = current.generation;
        let streamer = self.clone();
        self.inner.tracker.spawn(async move {
            if handle.wait().await == TimerSignal::Fired {
                streamer.flush_generation(generation);
            }
        });
    }

    fn flush_generation(&self, generation: u64) {
        let sealed = {
            let mut current = self.inner.current.lock();
            if current.generation != generation || current.operations.is_empty() {
                None
            } else {
                Some(current.seal())
            }
        };
        if let Some(batch) = sealed {
            self.dispatch(batch);
        }
    }

    fn dispatch(&self, batch: Vec<ReservedOperation>) {
        tracing::trace!("seal batch: range={} ops={}", self.inner.range_id, batch.len());
        let dispatcher = Arc::clone(&self.inner.dispatcher);
        self.inner.tracker.spawn(async move {
            dispatcher.dispatch(batch).await;
        });
    }
}
