//! Composable link chain.
//!
//! A chain is an ordered list of [`OperationLink`]s. Each link receives the
//! operation plus a [`Next`] handle to the rest of the chain and returns an
//! observable of results. The last link must answer without calling `next`
//! (a transport); if the chain runs dry the operation fails with
//! [`ClientError::NoTerminatingLink`].
//!
//! - [`DedupeLink`]: share one in-flight query between identical callers
//! - [`RetryLink`]: re-run failed operations
//! - [`SplitLink`]: route operations to one of two sub-chains
//! - [`LoggerLink`]: trace operations in both directions

mod dedupe;
mod logger;
mod retry;
mod split;

use std::sync::Arc;

use serde_json::Value;
use skein_core::{Observable, Operation, Teardown};

use crate::error::ClientError;

pub use dedupe::{DedupeCache, DedupeLink};
pub use logger::{LogDirection, LoggerLink};
pub use retry::{RetryConfig, RetryLink};
pub use split::SplitLink;

/// One event delivered for an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Data(Value),
    /// A subscription was acknowledged by the server.
    Started,
    /// A subscription was ended by the server.
    Stopped,
}

impl OperationResult {
    #[must_use]
    pub fn into_data(self) -> Option<Value> {
        match self {
            Self::Data(value) => Some(value),
            Self::Started | Self::Stopped => None,
        }
    }
}

pub type OperationObservable = Observable<OperationResult, ClientError>;

/// A stage of the chain.
pub trait OperationLink: Send + Sync + 'static {
    /// Handles `op`, usually by forwarding it to `next` and transforming the
    /// resulting stream. Terminating links ignore `next`.
    fn call(&self, op: Operation, next: Next) -> OperationObservable;
}

impl<F> OperationLink for F
where
    F: Fn(Operation, Next) -> OperationObservable + Send + Sync + 'static,
{
    fn call(&self, op: Operation, next: Next) -> OperationObservable {
        self(op, next)
    }
}

pub type SharedLink = Arc<dyn OperationLink>;

/// The remainder of a chain, as seen from inside a link.
#[derive(Clone)]
pub struct Next {
    links: Arc<[SharedLink]>,
    index: usize,
}

impl Next {
    /// Runs the rest of the chain for `op`.
    #[must_use]
    pub fn run(&self, op: Operation) -> OperationObservable {
        match self.links.get(self.index) {
            Some(link) => link.call(
                op,
                Next {
                    links: Arc::clone(&self.links),
                    index: self.index + 1,
                },
            ),
            None => Observable::fail(ClientError::NoTerminatingLink),
        }
    }
}

/// An immutable, reusable composition of links.
#[derive(Clone)]
pub struct Chain {
    links: Arc<[SharedLink]>,
}

impl Chain {
    /// Composes `links` in order.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] for an empty list.
    pub fn new(links: Vec<SharedLink>) -> Result<Self, ClientError> {
        if links.is_empty() {
            return Err(ClientError::Config("a chain needs at least one link".into()));
        }
        Ok(Self {
            links: links.into(),
        })
    }

    /// Number of links in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// The operation's result stream. The chain runs once per subscribe.
    #[must_use]
    pub fn execute(&self, op: Operation) -> OperationObservable {
        let links = Arc::clone(&self.links);
        Observable::new(move |subscriber| {
            let head = Next {
                links: Arc::clone(&links),
                index: 0,
            };
            Teardown::from(head.run(op.clone()).subscribe(subscriber))
        })
    }
}

/// Convenience for turning a link value into a [`SharedLink`].
pub fn shared(link: impl OperationLink) -> SharedLink {
    Arc::new(link)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted terminating links for exercising the middle of a chain.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::Value;
    use skein_core::{Observable, Operation, Teardown};

    use super::{OperationObservable, OperationResult};
    use crate::error::ClientError;

    /// Terminating link that answers every operation with its input after
    /// yielding to the scheduler, counting invocations.
    #[derive(Clone, Default)]
    pub struct EchoLink {
        pub calls: Arc<AtomicUsize>,
    }

    impl EchoLink {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn observe(&self, op: &Operation) -> OperationObservable {
            let calls = Arc::clone(&self.calls);
            let input = op.input().clone();
            Observable::new(move |subscriber| {
                calls.fetch_add(1, Ordering::SeqCst);
                let input = input.clone();
                let task = tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    subscriber.next(OperationResult::Data(input));
                    subscriber.complete();
                });
                Teardown::new(move || task.abort())
            })
        }
    }

    /// Terminating link that fails the first `failures` invocations.
    ///
    /// Failures are always reported synchronously; success is reported
    /// from a spawned task when `deferred` is set.
    #[derive(Clone)]
    pub struct FlakyLink {
        pub calls: Arc<AtomicUsize>,
        pub failures: usize,
        pub error: ClientError,
        pub deferred: bool,
    }

    impl FlakyLink {
        pub fn new(failures: usize, error: ClientError) -> Self {
            Self {
                calls: Arc::default(),
                failures,
                error,
                deferred: false,
            }
        }

        pub fn deferred(mut self) -> Self {
            self.deferred = true;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn observe(&self) -> OperationObservable {
            let calls = Arc::clone(&self.calls);
            let failures = self.failures;
            let error = self.error.clone();
            let deferred = self.deferred;
            Observable::new(move |subscriber| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    subscriber.error(error.clone());
                    return Teardown::noop();
                }
                if !deferred {
                    subscriber.next(OperationResult::Data(Value::from(n)));
                    subscriber.complete();
                    return Teardown::noop();
                }
                let task = tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    subscriber.next(OperationResult::Data(Value::from(n)));
                    subscriber.complete();
                });
                Teardown::new(move || task.abort())
            })
        }
    }
}
