//! Combinators over [`Observable`].

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{Observable, Observer, Subscriber, Subscription, Teardown};

// ---------------------------------------------------------------------------
// map / map_err
// ---------------------------------------------------------------------------

struct MapObserver<U, E, F> {
    downstream: Subscriber<U, E>,
    f: Arc<F>,
}

impl<T, U, E, F> Observer<T, E> for MapObserver<U, E, F>
where
    U: Send + 'static,
    E: Send + 'static,
    F: Fn(T) -> U + Send + Sync,
{
    fn next(&mut self, value: T) {
        self.downstream.next((self.f)(value));
    }

    fn error(&mut self, err: E) {
        self.downstream.error(err);
    }

    fn complete(&mut self) {
        self.downstream.complete();
    }
}

struct MapErrObserver<T, E2, F> {
    downstream: Subscriber<T, E2>,
    f: Arc<F>,
}

impl<T, E, E2, F> Observer<T, E> for MapErrObserver<T, E2, F>
where
    T: Send + 'static,
    E2: Send + 'static,
    F: Fn(E) -> E2 + Send + Sync,
{
    fn next(&mut self, value: T) {
        self.downstream.next(value);
    }

    fn error(&mut self, err: E) {
        self.downstream.error((self.f)(err));
    }

    fn complete(&mut self) {
        self.downstream.complete();
    }
}

struct FilterMapObserver<U, E, F> {
    downstream: Subscriber<U, E>,
    f: Arc<F>,
}

impl<T, U, E, F> Observer<T, E> for FilterMapObserver<U, E, F>
where
    U: Send + 'static,
    E: Send + 'static,
    F: Fn(T) -> Option<U> + Send + Sync,
{
    fn next(&mut self, value: T) {
        if let Some(mapped) = (self.f)(value) {
            self.downstream.next(mapped);
        }
    }

    fn error(&mut self, err: E) {
        self.downstream.error(err);
    }

    fn complete(&mut self) {
        self.downstream.complete();
    }
}

// ---------------------------------------------------------------------------
// tap
// ---------------------------------------------------------------------------

type PeekFn<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// Side-effect callbacks for [`Observable::tap`]. They see every event by
/// reference and cannot alter the stream.
pub struct Tap<T, E> {
    on_next: Option<PeekFn<T>>,
    on_error: Option<PeekFn<E>>,
    on_complete: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<T, E> Tap<T, E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            on_next: None,
            on_error: None,
            on_complete: None,
        }
    }

    #[must_use]
    pub fn on_next(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_next = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }
}

impl<T, E> Default for Tap<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for Tap<T, E> {
    fn clone(&self) -> Self {
        Self {
            on_next: self.on_next.clone(),
            on_error: self.on_error.clone(),
            on_complete: self.on_complete.clone(),
        }
    }
}

struct TapObserver<T, E> {
    downstream: Subscriber<T, E>,
    tap: Tap<T, E>,
}

impl<T, E> Observer<T, E> for TapObserver<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn next(&mut self, value: T) {
        if let Some(f) = &self.tap.on_next {
            f(&value);
        }
        self.downstream.next(value);
    }

    fn error(&mut self, err: E) {
        if let Some(f) = &self.tap.on_error {
            f(&err);
        }
        self.downstream.error(err);
    }

    fn complete(&mut self) {
        if let Some(f) = &self.tap.on_complete {
            f();
        }
        self.downstream.complete();
    }
}

// ---------------------------------------------------------------------------
// share
// ---------------------------------------------------------------------------

struct ShareState<T, E> {
    riders: Vec<(u64, Subscriber<T, E>)>,
    upstream: Option<Subscription>,
    starting: bool,
    next_rider: u64,
}

impl<T, E> ShareState<T, E> {
    fn new() -> Self {
        Self {
            riders: Vec::new(),
            upstream: None,
            starting: false,
            next_rider: 0,
        }
    }
}

struct ShareObserver<T, E> {
    state: Weak<Mutex<ShareState<T, E>>>,
}

impl<T, E> ShareObserver<T, E> {
    fn riders(&self) -> Vec<Subscriber<T, E>> {
        self.state.upgrade().map_or_else(Vec::new, |state| {
            state.lock().riders.iter().map(|(_, s)| s.clone()).collect()
        })
    }

    /// Terminal upstream event: detach everyone so the next rider restarts the source.
    fn drain(&self) -> Vec<Subscriber<T, E>> {
        self.state.upgrade().map_or_else(Vec::new, |state| {
            let mut state = state.lock();
            state.upstream = None;
            state.riders.drain(..).map(|(_, s)| s).collect()
        })
    }
}

impl<T, E> Observer<T, E> for ShareObserver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn next(&mut self, value: T) {
        for rider in self.riders() {
            rider.next(value.clone());
        }
    }

    fn error(&mut self, err: E) {
        for rider in self.drain() {
            rider.error(err.clone());
        }
    }

    fn complete(&mut self) {
        for rider in self.drain() {
            rider.complete();
        }
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

impl<T: Send + 'static, E: Send + 'static> Observable<T, E> {
    /// Lazily transforms every emitted value.
    pub fn map<U, F>(&self, f: F) -> Observable<U, E>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Observable::new(move |downstream| {
            let observer = MapObserver {
                downstream,
                f: Arc::clone(&f),
            };
            source.subscribe(observer).into()
        })
    }

    /// Lazily transforms values, dropping those mapped to `None`.
    pub fn filter_map<U, F>(&self, f: F) -> Observable<U, E>
    where
        U: Send + 'static,
        F: Fn(T) -> Option<U> + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Observable::new(move |downstream| {
            let observer = FilterMapObserver {
                downstream,
                f: Arc::clone(&f),
            };
            source.subscribe(observer).into()
        })
    }

    /// Lazily transforms the error, if any.
    pub fn map_err<E2, F>(&self, f: F) -> Observable<T, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Observable::new(move |downstream| {
            let observer = MapErrObserver {
                downstream,
                f: Arc::clone(&f),
            };
            source.subscribe(observer).into()
        })
    }

    /// Runs `tap`'s callbacks on every event passing through.
    #[must_use]
    pub fn tap(&self, tap: Tap<T, E>) -> Observable<T, E> {
        let source = self.clone();
        Observable::new(move |downstream| {
            let observer = TapObserver {
                downstream,
                tap: tap.clone(),
            };
            source.subscribe(observer).into()
        })
    }

    /// Multiplexes one upstream subscription to any number of riders.
    ///
    /// The upstream is subscribed when the first rider arrives and torn down
    /// when the last rider leaves. After a terminal event the next rider
    /// starts a fresh upstream subscription.
    #[must_use]
    pub fn share(&self) -> Observable<T, E>
    where
        T: Clone,
        E: Clone,
    {
        let source = self.clone();
        let state = Arc::new(Mutex::new(ShareState::<T, E>::new()));

        Observable::new(move |rider| {
            let (rider_id, start) = {
                let mut st = state.lock();
                let id = st.next_rider;
                st.next_rider += 1;
                st.riders.push((id, rider));
                let start = st.upstream.is_none() && !st.starting;
                if start {
                    st.starting = true;
                }
                (id, start)
            };

            if start {
                let upstream = source.subscribe(ShareObserver {
                    state: Arc::downgrade(&state),
                });
                let orphaned = {
                    let mut st = state.lock();
                    st.starting = false;
                    if st.riders.is_empty() || upstream.is_closed() {
                        true
                    } else {
                        st.upstream = Some(upstream.clone());
                        false
                    }
                };
                if orphaned {
                    upstream.unsubscribe();
                }
            }

            let state = Arc::clone(&state);
            Teardown::new(move || {
                let last = {
                    let mut st = state.lock();
                    st.riders.retain(|(id, _)| *id != rider_id);
                    if st.riders.is_empty() {
                        st.upstream.take()
                    } else {
                        None
                    }
                };
                if let Some(upstream) = last {
                    upstream.unsubscribe();
                }
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
