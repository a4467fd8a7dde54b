use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use skein_core::{Observable, Observer, Operation, Subscriber, Teardown};

use super::{Next, OperationLink, OperationObservable, OperationResult};
use crate::error::ClientError;

/// Which way an event is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDirection {
    /// Operation leaving the client.
    Up,
    /// Result coming back.
    Down,
}

impl fmt::Display for LogDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

type Filter = dyn Fn(&Operation, LogDirection) -> bool + Send + Sync;

/// Emits a `tracing` event for every operation and every result.
///
/// Down events carry the elapsed time since the operation went up. Errors
/// are logged at `warn`, everything else at `debug`.
#[derive(Clone)]
pub struct LoggerLink {
    enabled: Arc<Filter>,
}

impl LoggerLink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: Arc::new(|_, _| true),
        }
    }

    /// Restricts logging to events for which `filter` returns true.
    #[must_use]
    pub fn with_filter(
        filter: impl Fn(&Operation, LogDirection) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            enabled: Arc::new(filter),
        }
    }
}

impl Default for LoggerLink {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLink for LoggerLink {
    fn call(&self, op: Operation, next: Next) -> OperationObservable {
        let enabled = Arc::clone(&self.enabled);
        Observable::new(move |downstream| {
            if enabled(&op, LogDirection::Up) {
                tracing::debug!(
                    direction = %LogDirection::Up,
                    id = op.id(),
                    kind = %op.kind(),
                    path = op.path(),
                    input = %op.input(),
                    "operation"
                );
            }
            let observer = LoggingObserver {
                downstream,
                log_down: enabled(&op, LogDirection::Down),
                id: op.id(),
                path: op.path().to_string(),
                started: Instant::now(),
            };
            Teardown::from(next.run(op.clone()).subscribe(observer))
        })
    }
}

struct LoggingObserver {
    downstream: Subscriber<OperationResult, ClientError>,
    log_down: bool,
    id: u64,
    path: String,
    started: Instant,
}

impl LoggingObserver {
    #[allow(clippy::cast_possible_truncation)]
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Observer<OperationResult, ClientError> for LoggingObserver {
    fn next(&mut self, value: OperationResult) {
        if self.log_down {
            tracing::debug!(
                direction = %LogDirection::Down,
                id = self.id,
                path = %self.path,
                elapsed_ms = self.elapsed_ms(),
                result = ?value,
                "result"
            );
        }
        self.downstream.next(value);
    }

    fn error(&mut self, err: ClientError) {
        if self.log_down {
            tracing::warn!(
                direction = %LogDirection::Down,
                id = self.id,
                path = %self.path,
                elapsed_ms = self.elapsed_ms(),
                error = %err,
                "operation failed"
            );
        }
        self.downstream.error(err);
    }

    fn complete(&mut self) {
        if self.log_down {
            tracing::debug!(
                direction = %LogDirection::Down,
                id = self.id,
                path = %self.path,
                elapsed_ms = self.elapsed_ms(),
                "complete"
            );
        }
        self.downstream.complete();
    }
}
