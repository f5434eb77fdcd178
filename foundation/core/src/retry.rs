use std::future::Future;
use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::status::{Status, StatusCode};

/// Exponential backoff sequence used between retry attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    factor: u64,
    max_delay: Option<Duration>,
    remaining: usize,
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let duration = Duration::from_millis(self.current);
        self.current = self.current.checked_mul(self.factor).unwrap_or(u64::MAX);
        if let Some(max_delay) = self.max_delay {
            let max_millis = max_delay.as_millis().min(u64::MAX as u128) as u64;
            if self.current > max_millis {
                self.current = max_millis;
            }
        }
        Some(duration)
    }
}

pub trait AsStatus {
    fn as_status(&self) -> Option<&Status>;
}

impl AsStatus for Status {
    fn as_status(&self) -> Option<&Status> {
        Some(self)
    }
}

/// Settings for [`invoke`]: which status codes retry, and the backoff shape.
#[derive(Clone, Debug)]
pub struct RetrySetting {
    pub from_millis: u64,
    pub max_delay: Option<Duration>,
    pub factor: u64,
    pub attempts: usize,
    pub codes: Vec<StatusCode>,
}

impl RetrySetting {
    pub fn strategy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current: self.from_millis,
            factor: self.factor.max(1),
            max_delay: self.max_delay,
            remaining: self.attempts,
        }
    }

    pub fn should_retry(&self, status: &Status) -> bool {
        self.codes.contains(&status.code())
    }
}

impl Default for RetrySetting {
    fn default() -> Self {
        Self {
            from_millis: 10,
            max_delay: Some(Duration::from_secs(1)),
            factor: 2,
            attempts: 5,
            codes: vec![StatusCode::SERVICE_UNAVAILABLE, StatusCode::REQUEST_TIMEOUT],
        }
    }
}

/// Invokes `f` until it succeeds, the retry budget runs out, or the error is
/// one the settings do not retry. Cancellation wins over any in-flight
/// attempt or backoff sleep.
pub async fn invoke<R, E, A>(
    cancel: Option<&CancellationToken>,
    retry: Option<RetrySetting>,
    mut f: impl FnMut() -> A,
) -> Result<R, E>
where
    E: AsStatus + From<Status>,
    A: Future<Output = Result<R, E>>,
{
    let fn_loop = async {
        let retry = retry.unwrap_or_default();
        let mut strategy = retry.strategy();
        loop {
            let err = match f().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            let status = match err.as_status() {
                Some(s) => s,
                None => return Err(err),
            };
            if !retry.should_retry(status) {
                return Err(err);
            }
            match strategy.next() {
                None => return Err(err),
                Some(duration) => {
                    tracing::trace!("retrying after {:?}: {}", duration, status);
                    tokio::time::sleep(duration).await
                }
            }
        }
    };

    match cancel {
        Some(cancel) => {
            select! {
                _ = cancel.cancelled() => Err(Status::cancelled("client cancel").into()),
                v = fn_loop => v
            }
        }
        None => fn_loop.await,
    }
}
