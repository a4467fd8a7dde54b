//! Bridge from an [`Observable`] to a single awaited value.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::{Observable, Observer, Subscription};

/// Why an [`ObservableFuture`] resolved without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Incomplete {
    /// The stream completed before emitting anything.
    #[error("observable completed without emitting a value")]
    Empty,
    /// The future was cancelled before the stream terminated.
    #[error("observable was cancelled before it terminated")]
    Cancelled,
}

struct FutureObserver<T, E> {
    tx: Option<oneshot::Sender<Result<T, E>>>,
    value: Option<T>,
}

impl<T: Send, E: Send + From<Incomplete>> Observer<T, E> for FutureObserver<T, E> {
    fn next(&mut self, value: T) {
        if self.value.is_none() {
            self.value = Some(value);
        }
    }

    fn error(&mut self, err: E) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    fn complete(&mut self) {
        if let Some(tx) = self.tx.take() {
            let result = self.value.take().ok_or_else(|| E::from(Incomplete::Empty));
            let _ = tx.send(result);
        }
    }
}

/// Awaitable view of an observable.
///
/// Resolves with the first emitted value once the stream completes, or with
/// the stream's error. Dropping the future or calling [`cancel`](Self::cancel)
/// unsubscribes from the source.
#[must_use = "futures do nothing unless awaited"]
pub struct ObservableFuture<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
    subscription: Subscription,
}

impl<T, E> ObservableFuture<T, E>
where
    T: Send + 'static,
    E: Send + From<Incomplete> + 'static,
{
    pub(super) fn new(source: &Observable<T, E>) -> Self {
        let (tx, rx) = oneshot::channel();
        let subscription = source.subscribe(FutureObserver {
            tx: Some(tx),
            value: None,
        });
        Self { rx, subscription }
    }
}

impl<T, E> ObservableFuture<T, E> {
    /// Unsubscribes from the source; a pending await resolves with
    /// [`Incomplete::Cancelled`].
    pub fn cancel(&self) {
        self.subscription.unsubscribe();
    }

    /// A handle that cancels this future from elsewhere.
    #[must_use]
    pub fn canceller(&self) -> Subscription {
        self.subscription.clone()
    }
}

impl<T, E: From<Incomplete>> Future for ObservableFuture<T, E> {
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_closed)) => Poll::Ready(Err(E::from(Incomplete::Cancelled))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> Drop for ObservableFuture<T, E> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}
