//! Single-subscriber push stream with explicit teardown.
//!
//! An [`Observable`] is a factory: every call to [`Observable::subscribe`]
//! runs the producer again with a fresh [`Subscriber`], so independent
//! subscriptions share no state unless an operator such as
//! [`Observable::share`] is used.
//!
//! Delivery grammar: `next* (error | complete)?`. At most one terminal event
//! reaches the observer; anything emitted after a terminal event or after
//! [`Subscription::unsubscribe`] is dropped. The producer's [`Teardown`] runs
//! exactly once, either on unsubscribe or right after the terminal event has
//! been delivered downstream.
//!
//! Emissions to one subscriber must be serialized. A producer must not
//! deliver a terminal event to a subscriber from inside that subscriber's own
//! `next` callback.

mod future;
mod operators;

use std::fmt;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub use future::{Incomplete, ObservableFuture};
pub use operators::Tap;

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Receiver of the events pushed by an [`Observable`].
pub trait Observer<T, E>: Send {
    /// Called for every emitted value.
    fn next(&mut self, value: T);

    /// Called at most once, when the stream fails.
    fn error(&mut self, err: E);

    /// Called at most once, when the stream ends successfully.
    fn complete(&mut self);
}

type NextFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn<E> = Box<dyn FnOnce(E) + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;

/// Closure-backed [`Observer`]. Missing callbacks ignore their event.
pub struct Callbacks<T, E> {
    on_next: Option<NextFn<T>>,
    on_error: Option<ErrorFn<E>>,
    on_complete: Option<CompleteFn>,
}

impl<T, E> Callbacks<T, E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            on_next: None,
            on_error: None,
            on_complete: None,
        }
    }

    #[must_use]
    pub fn on_next(mut self, f: impl FnMut(T) + Send + 'static) -> Self {
        self.on_next = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl FnOnce(E) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl<T, E> Default for Callbacks<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Observer<T, E> for Callbacks<T, E> {
    fn next(&mut self, value: T) {
        if let Some(f) = self.on_next.as_mut() {
            f(value);
        }
    }

    fn error(&mut self, err: E) {
        if let Some(f) = self.on_error.take() {
            f(err);
        }
    }

    fn complete(&mut self) {
        if let Some(f) = self.on_complete.take() {
            f();
        }
    }
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

/// Cleanup logic returned by a producer.
pub struct Teardown(Option<Box<dyn FnOnce() + Send>>);

impl Teardown {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A teardown with nothing to release.
    #[must_use]
    pub fn noop() -> Self {
        Self(None)
    }

    fn run(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl From<Subscription> for Teardown {
    fn from(subscription: Subscription) -> Self {
        Self::new(move || subscription.unsubscribe())
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Teardown").field(&self.0.is_some()).finish()
    }
}

enum TeardownSlot {
    /// Producer has not returned yet.
    Pending,
    Set(Teardown),
    Done,
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

struct SubscriberInner<T, E> {
    observer: Mutex<Option<Box<dyn Observer<T, E>>>>,
    closed: AtomicBool,
    teardown: Mutex<TeardownSlot>,
}

impl<T, E> SubscriberInner<T, E> {
    fn run_teardown(&self) {
        let teardown = {
            let mut slot = self.teardown.lock();
            match std::mem::replace(&mut *slot, TeardownSlot::Done) {
                TeardownSlot::Set(t) => Some(t),
                TeardownSlot::Pending | TeardownSlot::Done => None,
            }
        };
        if let Some(t) = teardown {
            t.run();
        }
    }

    fn set_teardown(&self, teardown: Teardown) {
        let mut slot = self.teardown.lock();
        if matches!(*slot, TeardownSlot::Done) || self.closed.load(Ordering::Acquire) {
            *slot = TeardownSlot::Done;
            drop(slot);
            teardown.run();
        } else {
            *slot = TeardownSlot::Set(teardown);
        }
    }

    fn take_observer(&self) -> Option<Box<dyn Observer<T, E>>> {
        self.observer.lock().take()
    }
}

/// Handle given to a producer to push events downstream.
///
/// Cheap to clone; all clones feed the same observer.
pub struct Subscriber<T, E> {
    inner: Arc<SubscriberInner<T, E>>,
}

impl<T, E> Clone for Subscriber<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static, E: Send + 'static> Subscriber<T, E> {
    fn new(observer: Box<dyn Observer<T, E>>) -> Self {
        Self {
            inner: Arc::new(SubscriberInner {
                observer: Mutex::new(Some(observer)),
                closed: AtomicBool::new(false),
                teardown: Mutex::new(TeardownSlot::Pending),
            }),
        }
    }

    pub fn next(&self, value: T) {
        if self.is_closed() {
            return;
        }
        let mut guard = self.inner.observer.lock();
        if let Some(observer) = guard.as_mut() {
            observer.next(value);
        }
        // Unsubscribed from inside the callback: release the observer now.
        if self.is_closed() {
            guard.take();
        }
    }

    pub fn error(&self, err: E) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut observer) = self.inner.take_observer() {
            observer.error(err);
        }
        self.inner.run_teardown();
    }

    pub fn complete(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut observer) = self.inner.take_observer() {
            observer.complete();
        }
        self.inner.run_teardown();
    }

    /// True once a terminal event was delivered or the consumer unsubscribed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// A disposer handle for this subscriber, usable by the producer itself.
    #[must_use]
    pub fn subscription(&self) -> Subscription {
        Subscription {
            inner: Some(Arc::clone(&self.inner) as Arc<dyn Unsubscribe>),
        }
    }
}

/// A subscriber forwards whatever it observes, which lets a producer pipe
/// another observable straight into its own downstream.
impl<T: Send + 'static, E: Send + 'static> Observer<T, E> for Subscriber<T, E> {
    fn next(&mut self, value: T) {
        Subscriber::next(self, value);
    }

    fn error(&mut self, err: E) {
        Subscriber::error(self, err);
    }

    fn complete(&mut self) {
        Subscriber::complete(self);
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self);
    fn is_closed(&self) -> bool;
}

impl<T: Send, E: Send> Unsubscribe for SubscriberInner<T, E> {
    fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            // Already terminal; make sure a late teardown still runs once.
            self.run_teardown();
            return;
        }
        // The observer may be executing `next` right now (possibly the caller
        // of this very function). In that case `next` drops it on return.
        if let Some(mut guard) = self.observer.try_lock() {
            guard.take();
        }
        self.run_teardown();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Disposer returned by [`Observable::subscribe`].
///
/// Dropping a `Subscription` does not unsubscribe; call
/// [`Subscription::unsubscribe`] explicitly. Unsubscribing is idempotent.
#[derive(Clone)]
pub struct Subscription {
    inner: Option<Arc<dyn Unsubscribe>>,
}

impl Subscription {
    /// A subscription that is already closed.
    #[must_use]
    pub fn closed() -> Self {
        Self { inner: None }
    }

    pub fn unsubscribe(&self) {
        if let Some(inner) = &self.inner {
            inner.unsubscribe();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.as_ref().map_or(true, |inner| inner.is_closed())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Observable
// ---------------------------------------------------------------------------

type Producer<T, E> = dyn Fn(Subscriber<T, E>) -> Teardown + Send + Sync;

/// Lazy push stream. Nothing happens until [`Observable::subscribe`].
pub struct Observable<T, E> {
    producer: Arc<Producer<T, E>>,
}

impl<T, E> Clone for Observable<T, E> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<T, E> fmt::Debug for Observable<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Observable")
    }
}

impl<T: Send + 'static, E: Send + 'static> Observable<T, E> {
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn(Subscriber<T, E>) -> Teardown + Send + Sync + 'static,
    {
        Self {
            producer: Arc::new(producer),
        }
    }

    /// Emits `value` then completes.
    pub fn of(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(move |subscriber| {
            subscriber.next(value.clone());
            subscriber.complete();
            Teardown::noop()
        })
    }

    /// Fails immediately with `err`.
    pub fn fail(err: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::new(move |subscriber| {
            subscriber.error(err.clone());
            Teardown::noop()
        })
    }

    /// Completes immediately without emitting.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(|subscriber| {
            subscriber.complete();
            Teardown::noop()
        })
    }

    /// Runs the producer synchronously and returns its disposer.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer<T, E> + 'static,
    {
        let subscriber = Subscriber::new(Box::new(observer));
        let teardown = (self.producer)(subscriber.clone());
        subscriber.inner.set_teardown(teardown);
        subscriber.subscription()
    }
}

/// Awaiting an observable resolves with its first value once it completes.
impl<T, E> IntoFuture for Observable<T, E>
where
    T: Send + 'static,
    E: Send + From<Incomplete> + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = ObservableFuture<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        ObservableFuture::new(&self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
