//! In-flight query deduplication.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use skein_core::{Fingerprint, Observable, Observer, Operation, OperationKind, Subscriber, Teardown};

use super::{Next, OperationLink, OperationObservable, OperationResult};
use crate::error::ClientError;

struct DedupeEntry {
    riders: usize,
    generation: u64,
    shared: OperationObservable,
}

/// Table of queries currently in flight, keyed by fingerprint.
///
/// Owned by a [`DedupeLink`]; exposed so several links (or clients) can
/// share one table.
#[derive(Default)]
pub struct DedupeCache {
    entries: Mutex<HashMap<Fingerprint, DedupeEntry>>,
    generations: AtomicU64,
}

impl DedupeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct queries in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Joins the entry for `key`, creating it from `make` if absent.
    fn join(
        &self,
        key: &Fingerprint,
        make: impl FnOnce() -> OperationObservable,
    ) -> (OperationObservable, u64) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.riders += 1;
            return (entry.shared.clone(), entry.generation);
        }

        // Build the upstream outside the lock; another caller may win the race.
        let shared = make().share();
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| DedupeEntry {
            riders: 0,
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            shared,
        });
        entry.riders += 1;
        (entry.shared.clone(), entry.generation)
    }

    /// One rider left.
    fn release(&self, key: &Fingerprint, generation: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            if entry.generation == generation {
                entry.riders = entry.riders.saturating_sub(1);
                if entry.riders == 0 {
                    entries.remove(key);
                }
            }
        }
    }

    /// The shared call finished; later identical queries start fresh.
    fn finish(&self, key: &Fingerprint, generation: u64) {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.generation == generation) {
            entries.remove(key);
        }
    }
}

struct DedupeRider {
    downstream: Subscriber<OperationResult, ClientError>,
    cache: Arc<DedupeCache>,
    key: Fingerprint,
    generation: u64,
}

impl Observer<OperationResult, ClientError> for DedupeRider {
    fn next(&mut self, value: OperationResult) {
        self.downstream.next(value);
    }

    fn error(&mut self, err: ClientError) {
        self.cache.finish(&self.key, self.generation);
        self.downstream.error(err);
    }

    fn complete(&mut self) {
        self.cache.finish(&self.key, self.generation);
        self.downstream.complete();
    }
}

/// Shares one execution among concurrent identical queries.
///
/// Two queries are identical when their fingerprints (kind, path, canonical
/// input) match. Mutations and subscriptions always pass straight through.
#[derive(Clone, Default)]
pub struct DedupeLink {
    cache: Arc<DedupeCache>,
}

impl DedupeLink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cache(cache: Arc<DedupeCache>) -> Self {
        Self { cache }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<DedupeCache> {
        &self.cache
    }
}

impl OperationLink for DedupeLink {
    fn call(&self, op: Operation, next: Next) -> OperationObservable {
        if op.kind() != OperationKind::Query {
            return next.run(op);
        }

        let cache = Arc::clone(&self.cache);
        let key = op.fingerprint();
        Observable::new(move |downstream| {
            let (shared, generation) = cache.join(&key, || next.run(op.clone()));
            let subscription = shared.subscribe(DedupeRider {
                downstream,
                cache: Arc::clone(&cache),
                key: key.clone(),
                generation,
            });

            let cache = Arc::clone(&cache);
            let key = key.clone();
            Teardown::new(move || {
                subscription.unsubscribe();
                cache.release(&key, generation);
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::future::IntoFuture;

    use serde_json::json;
    use skein_core::Callbacks;

    use super::*;
    use crate::link::testing::EchoLink;
    use crate::link::{shared, Chain};

    fn chain_with(echo: &EchoLink, dedupe: &DedupeLink) -> Chain {
        let terminal = echo.clone();
        Chain::new(vec![
            shared(dedupe.clone()),
            shared(move |op: Operation, _next: Next| terminal.observe(&op)),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn identical_queries_share_one_call() {
        let echo = EchoLink::default();
        let dedupe = DedupeLink::new();
        let chain = chain_with(&echo, &dedupe);

        let a = chain.execute(Operation::query(1, "user.get", json!({"id": 1, "x": 2})));
        let b = chain.execute(Operation::query(2, "user.get", json!({"x": 2, "id": 1})));
        let (ra, rb) = tokio::join!(a.into_future(), b.into_future());

        assert_eq!(ra.unwrap(), OperationResult::Data(json!({"id": 1, "x": 2})));
        assert_eq!(rb.unwrap(), OperationResult::Data(json!({"id": 1, "x": 2})));
        assert_eq!(echo.calls(), 1);
        assert!(dedupe.cache().is_empty());
    }

    #[tokio::test]
    async fn mutations_are_never_shared() {
        let echo = EchoLink::default();
        let dedupe = DedupeLink::new();
        let chain = chain_with(&echo, &dedupe);

        let a = chain.execute(Operation::mutation(1, "post.add", json!(1)));
        let b = chain.execute(Operation::mutation(2, "post.add", json!(1)));
        let (ra, rb) = tokio::join!(a.into_future(), b.into_future());
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(echo.calls(), 2);
    }

    #[tokio::test]
    async fn different_inputs_are_not_shared() {
        let echo = EchoLink::default();
        let dedupe = DedupeLink::new();
        let chain = chain_with(&echo, &dedupe);

        let a = chain.execute(Operation::query(1, "user.get", json!(1)));
        let b = chain.execute(Operation::query(2, "user.get", json!(2)));
        let (ra, rb) = tokio::join!(a.into_future(), b.into_future());
        assert_ne!(ra.unwrap(), rb.unwrap());
        assert_eq!(echo.calls(), 2);
    }

    #[tokio::test]
    async fn completed_queries_run_again() {
        let echo = EchoLink::default();
        let dedupe = DedupeLink::new();
        let chain = chain_with(&echo, &dedupe);

        chain.execute(Operation::query(1, "a", json!(1))).await.unwrap();
        chain.execute(Operation::query(2, "a", json!(1))).await.unwrap();
        assert_eq!(echo.calls(), 2);
    }

    #[tokio::test]
    async fn one_rider_leaving_keeps_the_call_alive() {
        let echo = EchoLink::default();
        let dedupe = DedupeLink::new();
        let chain = chain_with(&echo, &dedupe);

        let early = chain
            .execute(Operation::query(1, "a", json!(1)))
            .subscribe(Callbacks::new());
        let stays = chain.execute(Operation::query(2, "a", json!(1)));
        assert_eq!(dedupe.cache().len(), 1);

        let pending = tokio::spawn(stays.into_future());
        tokio::task::yield_now().await;
        early.unsubscribe();

        let result = pending.await.unwrap();
        assert_eq!(result.unwrap(), OperationResult::Data(json!(1)));
        assert_eq!(echo.calls(), 1);
    }

    #[tokio::test]
    async fn last_rider_leaving_drops_the_entry() {
        let echo = EchoLink::default();
        let dedupe = DedupeLink::new();
        let chain = chain_with(&echo, &dedupe);

        let a = chain
            .execute(Operation::query(1, "a", json!(1)))
            .subscribe(Callbacks::new());
        let b = chain
            .execute(Operation::query(2, "a", json!(1)))
            .subscribe(Callbacks::new());
        a.unsubscribe();
        assert_eq!(dedupe.cache().len(), 1);
        b.unsubscribe();
        assert!(dedupe.cache().is_empty());
    }
}
