//! Same-tick request batching.
//!
//! Keys submitted with [`DataLoader::load`] before the submitting task
//! yields are collected into one batch and handed to a [`BatchFetch`] in a
//! single call. A batch that would fail [`BatchFetch::validate`] with the
//! next key is flushed first and the key starts a new batch; a key that
//! fails validation on its own is still dispatched alone.
//!
//! Requires a running tokio runtime: dispatch happens on spawned tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::ClientError;

/// The function a loader batches calls into.
#[async_trait]
pub trait BatchFetch<K, V>: Send + Sync + 'static {
    /// Whether `keys` may be sent as one batch.
    fn validate(&self, _keys: &[K]) -> bool {
        true
    }

    /// Resolves every key, positionally.
    async fn fetch(&self, keys: Vec<K>) -> Result<Vec<V>, ClientError>;
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Collecting,
    Dispatched,
}

struct Slot<K, V> {
    key: K,
    reply: Option<oneshot::Sender<Result<V, ClientError>>>,
    cancelled: bool,
}

struct BatchItems<K, V> {
    slots: Vec<Slot<K, V>>,
    live: usize,
    state: BatchState,
}

struct Batch<K, V> {
    items: Mutex<BatchItems<K, V>>,
    task: Mutex<Option<AbortHandle>>,
}

impl<K: Clone, V> Batch<K, V> {
    fn new() -> Self {
        Self {
            items: Mutex::new(BatchItems {
                slots: Vec::new(),
                live: 0,
                state: BatchState::Collecting,
            }),
            task: Mutex::new(None),
        }
    }

    fn live_keys(&self) -> Vec<K> {
        let items = self.items.lock();
        items
            .slots
            .iter()
            .filter(|s| !s.cancelled)
            .map(|s| s.key.clone())
            .collect()
    }

    fn push(&self, key: K, reply: oneshot::Sender<Result<V, ClientError>>) -> usize {
        let mut items = self.items.lock();
        items.slots.push(Slot {
            key,
            reply: Some(reply),
            cancelled: false,
        });
        items.live += 1;
        items.slots.len() - 1
    }

    /// Marks the batch dispatched and returns the live keys with their slots.
    fn seal(&self) -> (Vec<usize>, Vec<K>) {
        let mut items = self.items.lock();
        items.state = BatchState::Dispatched;
        items
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.cancelled)
            .map(|(i, s)| (i, s.key.clone()))
            .unzip()
    }

    fn settle(&self, indices: &[usize], result: Result<Vec<V>, ClientError>) {
        let mut items = self.items.lock();
        let result = result.and_then(|values| {
            if values.len() == indices.len() {
                Ok(values)
            } else {
                Err(ClientError::Protocol(format!(
                    "batch returned {} results for {} requests",
                    values.len(),
                    indices.len()
                )))
            }
        });
        match result {
            Ok(values) => {
                for (&index, value) in indices.iter().zip(values) {
                    if let Some(reply) = items.slots[index].reply.take() {
                        let _ = reply.send(Ok(value));
                    }
                }
            }
            Err(err) => {
                for &index in indices {
                    if let Some(reply) = items.slots[index].reply.take() {
                        let _ = reply.send(Err(err.clone()));
                    }
                }
            }
        }
        items.live = 0;
    }

    fn all_cancelled(&self) -> bool {
        self.items.lock().live == 0
    }
}

/// Type-erased handle a [`Load`] uses to cancel its slot.
trait CancelSlot: Send + Sync {
    fn cancel(&self, index: usize);
}

impl<K: Send, V: Send> CancelSlot for Batch<K, V> {
    fn cancel(&self, index: usize) {
        let abort = {
            let mut items = self.items.lock();
            let Some(slot) = items.slots.get_mut(index) else {
                return;
            };
            let Some(reply) = slot.reply.take() else {
                return;
            };
            slot.cancelled = true;
            let _ = reply.send(Err(ClientError::Aborted));
            items.live = items.live.saturating_sub(1);
            items.live == 0 && items.state == BatchState::Dispatched
        };
        if abort {
            if let Some(task) = self.task.lock().take() {
                task.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Cancels one pending [`Load`].
#[derive(Clone)]
pub struct LoadCanceller {
    batch: Arc<dyn CancelSlot>,
    index: usize,
}

impl LoadCanceller {
    /// Resolves the load with [`ClientError::Aborted`]. A no-op once settled.
    /// The underlying fetch is aborted only when every key in its batch was
    /// cancelled.
    pub fn cancel(&self) {
        self.batch.cancel(self.index);
    }
}

/// The pending result of one key.
///
/// Dropping an unsettled load cancels it.
#[must_use = "futures do nothing unless awaited"]
pub struct Load<V> {
    rx: oneshot::Receiver<Result<V, ClientError>>,
    canceller: LoadCanceller,
}

impl<V> Load<V> {
    #[must_use]
    pub fn canceller(&self) -> LoadCanceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }
}

impl<V> Future for Load<V> {
    type Output = Result<V, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Fetch task aborted or panicked.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Aborted)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<V> Drop for Load<V> {
    fn drop(&mut self) {
        self.canceller.cancel();
    }
}

// ---------------------------------------------------------------------------
// DataLoader
// ---------------------------------------------------------------------------

struct LoaderInner<K, V> {
    fetcher: Arc<dyn BatchFetch<K, V>>,
    collecting: Mutex<Option<Arc<Batch<K, V>>>>,
}

/// Coalesces keys submitted in the same scheduler tick into one fetch.
pub struct DataLoader<K, V> {
    inner: Arc<LoaderInner<K, V>>,
}

impl<K, V> Clone for DataLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> DataLoader<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn new(fetcher: impl BatchFetch<K, V>) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                fetcher: Arc::new(fetcher),
                collecting: Mutex::new(None),
            }),
        }
    }

    /// Queues `key` for the current batch.
    pub fn load(&self, key: K) -> Load<V> {
        let (tx, rx) = oneshot::channel();
        let mut collecting = self.inner.collecting.lock();

        if let Some(batch) = collecting.as_ref() {
            let mut candidate = batch.live_keys();
            if !candidate.is_empty() {
                candidate.push(key.clone());
                if !self.inner.fetcher.validate(&candidate) {
                    if let Some(full) = collecting.take() {
                        self.dispatch(full);
                    }
                }
            }
        }

        let batch = match collecting.as_ref() {
            Some(batch) => Arc::clone(batch),
            None => {
                let batch = Arc::new(Batch::new());
                *collecting = Some(Arc::clone(&batch));
                self.schedule(&batch);
                batch
            }
        };
        let index = batch.push(key, tx);
        drop(collecting);

        Load {
            rx,
            canceller: LoadCanceller {
                batch,
                index,
            },
        }
    }

    /// Dispatches `batch` once the current task yields, unless it was
    /// flushed earlier.
    fn schedule(&self, batch: &Arc<Batch<K, V>>) {
        let loader = self.clone();
        let batch = Arc::clone(batch);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let due = {
                let mut collecting = loader.inner.collecting.lock();
                match collecting.as_ref() {
                    Some(current) if Arc::ptr_eq(current, &batch) => collecting.take(),
                    _ => None,
                }
            };
            if let Some(batch) = due {
                loader.dispatch(batch);
            }
        });
    }

    fn dispatch(&self, batch: Arc<Batch<K, V>>) {
        let (indices, keys) = batch.seal();
        if keys.is_empty() {
            return;
        }
        tracing::trace!(size = keys.len(), "dispatching batch");

        let fetcher = Arc::clone(&self.inner.fetcher);
        let settling = Arc::clone(&batch);
        let handle = tokio::spawn(async move {
            let result = fetcher.fetch(keys).await;
            settling.settle(&indices, result);
        });
        *batch.task.lock() = Some(handle.abort_handle());
        // Everyone may have cancelled while the task was being spawned.
        if batch.all_cancelled() {
            handle.abort();
        }
    }
}
