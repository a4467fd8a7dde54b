//! Retry failed operations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use skein_core::{Observable, Observer, Operation, Subscriber, Subscription, Teardown};
use tokio::task::JoinHandle;

use super::{Next, OperationLink, OperationObservable, OperationResult};
use crate::error::ClientError;

type DelayFn = dyn Fn(u32) -> u64 + Send + Sync;
type RetryIfFn = dyn Fn(&Operation, &ClientError, u32) -> bool + Send + Sync;

/// Retry policy.
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay in milliseconds before retry number `n` (starting at 1).
    pub retry_delay_ms: Arc<DelayFn>,
    /// Extra veto, called with the failed attempt count. Aborts are never retried.
    pub retry_if: Arc<RetryIfFn>,
}

impl RetryConfig {
    #[must_use]
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: impl Fn(u32) -> u64 + Send + Sync + 'static) -> Self {
        self.retry_delay_ms = Arc::new(delay);
        self
    }

    #[must_use]
    pub fn with_retry_if(
        mut self,
        predicate: impl Fn(&Operation, &ClientError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_if = Arc::new(predicate);
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: Arc::new(|_| 0),
            retry_if: Arc::new(|_, _, _| true),
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Re-runs the rest of the chain when it fails.
///
/// A retry resubscribes to `next` with the same operation. Values already
/// delivered from a failed attempt are not retracted.
#[derive(Clone, Debug, Default)]
pub struct RetryLink {
    config: RetryConfig,
}

impl RetryLink {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl OperationLink for RetryLink {
    fn call(&self, op: Operation, next: Next) -> OperationObservable {
        let config = self.config.clone();
        Observable::new(move |downstream| {
            let run = Arc::new(RetryRun {
                op: op.clone(),
                next: next.clone(),
                config: config.clone(),
                downstream,
                current: Mutex::new(None),
                timer: Mutex::new(None),
            });
            RetryRun::attempt(&run, 1);
            Teardown::new(move || run.stop())
        })
    }
}

/// State of one subscription to a retrying operation.
struct RetryRun {
    op: Operation,
    next: Next,
    config: RetryConfig,
    downstream: Subscriber<OperationResult, ClientError>,
    /// Live attempt, tagged with its number. A synchronous failure starts
    /// the next attempt before `subscribe` returns, so the newest tag wins.
    current: Mutex<Option<(u32, Subscription)>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RetryRun {
    fn attempt(run: &Arc<Self>, attempt: u32) {
        if run.downstream.is_closed() {
            return;
        }
        let subscription = run.next.run(run.op.clone()).subscribe(AttemptObserver {
            run: Arc::clone(run),
            attempt,
        });
        let stale = {
            let mut current = run.current.lock();
            match current.take() {
                Some((newer, live)) if newer > attempt => {
                    *current = Some((newer, live));
                    Some(subscription)
                }
                previous => {
                    *current = Some((attempt, subscription));
                    previous.map(|(_, older)| older)
                }
            }
        };
        if let Some(stale) = stale {
            stale.unsubscribe();
        }
    }

    fn should_retry(&self, err: &ClientError, attempt: u32) -> bool {
        !err.is_aborted()
            && !self.downstream.is_closed()
            && attempt < self.config.max_attempts
            && (self.config.retry_if)(&self.op, err, attempt)
    }

    fn schedule(run: &Arc<Self>, attempt: u32) {
        let delay_ms = (run.config.retry_delay_ms)(attempt - 1);
        tracing::debug!(
            id = run.op.id(),
            path = run.op.path(),
            attempt,
            delay_ms,
            "retrying operation"
        );
        if delay_ms == 0 {
            Self::attempt(run, attempt);
            return;
        }
        let pending = Arc::clone(run);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Self::attempt(&pending, attempt);
        });
        if let Some(old) = run.timer.lock().replace(handle) {
            old.abort();
        }
    }

    fn stop(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        let current = self.current.lock().take();
        if let Some((_, current)) = current {
            current.unsubscribe();
        }
    }
}

struct AttemptObserver {
    run: Arc<RetryRun>,
    attempt: u32,
}

impl Observer<OperationResult, ClientError> for AttemptObserver {
    fn next(&mut self, value: OperationResult) {
        self.run.downstream.next(value);
    }

    fn error(&mut self, err: ClientError) {
        if self.run.should_retry(&err, self.attempt) {
            RetryRun::schedule(&self.run, self.attempt + 1);
        } else {
            self.run.downstream.error(err);
        }
    }

    fn complete(&mut self) {
        self.run.downstream.complete();
    }
}
