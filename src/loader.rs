//! # Batched Data Loader
//!
//! A per-transaction request coalescer. Every record fetch an executor pass
//! triggers lands here as a pending load; one manual [`DataLoader::dispatch`]
//! turns the whole pending list into a single batched backend call, so
//! dereferencing N references costs one round-trip instead of N.
//!
//! ```text
//!  executor pass                       loader                    backend
//!  ─────────────                       ──────                    ───────
//!  resolve friends[0] ── load(k0) ──►  pending: [k0]
//!  resolve friends[1] ── load(k1) ──►  pending: [k0, k1]
//!  resolve friends[1] ── load(k1) ──►  pending: [k0, k1]   (same promise)
//!  dispatch ─────────────────────────► batch_load([k0, k1]) ──► one query
//!                                      distribute positionally
//! ```
//!
//! ## Contract
//!
//! - `load(k)` returns a promise; identical keys within one transaction
//!   return the same promise and enter the pending list at most once.
//! - `load` never performs backend work.
//! - `dispatch` atomically takes the pending list, invokes the supplied
//!   batch function exactly once, and distributes results by position.
//!   An empty dispatch is a no-op.
//! - Pending loads are dispatched in first-enqueue order.
//! - A result list whose length differs from the key list fails the whole
//!   batch with [`Error::BatchContract`].
//!
//! The loader is scoped to one transaction. Sharing it across transactions
//! would bind unrelated reads' lifetimes together.

use std::collections::HashMap;
use std::hash::Hash;
use std::mem;
use std::sync::Mutex;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// The shared promise handed out by [`DataLoader::load`].
///
/// Cloning is cheap; every clone resolves to the same value once the batch
/// containing the key completes.
pub type LoadPromise<V> = Shared<BoxFuture<'static, Result<V>>>;

/// Mutable loader state behind one mutex: the FIFO pending list and the
/// per-key promise map that provides request deduplication.
struct LoaderState<K, V> {
    pending: Vec<(K, oneshot::Sender<Result<V>>)>,
    promises: HashMap<K, LoadPromise<V>>,
}

/// A per-transaction coalescer of keyed loads.
pub struct DataLoader<K, V> {
    state: Mutex<LoaderState<K, V>>,
}

impl<K, V> DataLoader<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Creates an empty loader.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoaderState {
                pending: Vec::new(),
                promises: HashMap::new(),
            }),
        }
    }

    /// Enqueues a load for `key` and returns its promise.
    ///
    /// Calling `load` again with the same key returns the same promise, both
    /// before the key is dispatched and after it has resolved. No backend
    /// work happens here; the promise stays unresolved until a later
    /// [`dispatch`](Self::dispatch).
    pub fn load(&self, key: K) -> LoadPromise<V> {
        let mut state = self.state.lock().expect("loader mutex poisoned");

        if let Some(existing) = state.promises.get(&key) {
            return existing.clone();
        }

        let (sender, receiver) = oneshot::channel();
        let promise: LoadPromise<V> = async move {
            match receiver.await {
                Ok(result) => result,
                // The loader (and its senders) was dropped before dispatch
                // completed; the transaction is gone.
                Err(_) => Err(Error::TransactionDropped),
            }
        }
        .boxed()
        .shared();

        state.pending.push((key.clone(), sender));
        state.promises.insert(key, promise.clone());
        promise
    }

    /// Number of loads enqueued and not yet dispatched.
    pub fn pending_count(&self) -> usize {
        self.state.lock().expect("loader mutex poisoned").pending.len()
    }

    /// Forgets resolved promises so subsequent loads re-fetch.
    ///
    /// Read-write transactions call this after staging a write: re-reads of
    /// an overwritten key must observe the staged record, not the promise
    /// cached from before the write. Promises for keys still in the pending
    /// list are kept, since their senders are already committed to the next
    /// dispatch.
    pub fn clear_promises(&self) {
        let mut state = self.state.lock().expect("loader mutex poisoned");
        let LoaderState { pending, promises } = &mut *state;
        promises.retain(|key, _| pending.iter().any(|(pending_key, _)| pending_key == key));
    }

    /// Takes the pending list, invokes `batch_load` once with its keys in
    /// enqueue order, and distributes the results positionally.
    ///
    /// An empty pending list is a no-op and `batch_load` is not invoked.
    ///
    /// # Errors
    ///
    /// A failed batch, or a result list of the wrong length, fails every
    /// waiter with the same error and is also returned to the caller.
    pub async fn dispatch<F, Fut>(&self, batch_load: F) -> Result<()>
    where
        F: FnOnce(Vec<K>) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<V>>>,
    {
        let taken = {
            let mut state = self.state.lock().expect("loader mutex poisoned");
            mem::take(&mut state.pending)
        };
        if taken.is_empty() {
            return Ok(());
        }

        let keys: Vec<K> = taken.iter().map(|(key, _)| key.clone()).collect();
        tracing::trace!(batch_size = keys.len(), "dispatching batched load");

        match batch_load(keys).await {
            Ok(values) => {
                if values.len() != taken.len() {
                    let err = Error::BatchContract {
                        expected: taken.len(),
                        actual: values.len(),
                    };
                    for (_, sender) in taken {
                        let _ = sender.send(Err(err.clone()));
                    }
                    return Err(err);
                }
                for ((_, sender), value) in taken.into_iter().zip(values) {
                    let _ = sender.send(Ok(value));
                }
                Ok(())
            }
            Err(err) => {
                for (_, sender) in taken {
                    let _ = sender.send(Err(err.clone()));
                }
                Err(err)
            }
        }
    }
}

impl<K, V> Default for DataLoader<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_coalesces_into_one_batch_in_enqueue_order() {
        let loader: DataLoader<String, u32> = DataLoader::new();
        let a = loader.load("a".to_string());
        let b = loader.load("b".to_string());
        let c = loader.load("c".to_string());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_batch = Arc::clone(&calls);
        loader
            .dispatch(|keys| async move {
                calls_in_batch.fetch_add(1, Ordering::SeqCst);
                assert_eq!(keys, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
                Ok(vec![1, 2, 3])
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.await.unwrap(), 1);
        assert_eq!(b.await.unwrap(), 2);
        assert_eq!(c.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_keys_share_one_promise() {
        let loader: DataLoader<String, u32> = DataLoader::new();
        let first = loader.load("k".to_string());
        let second = loader.load("k".to_string());
        assert_eq!(loader.pending_count(), 1);

        loader
            .dispatch(|keys| async move {
                assert_eq!(keys, vec!["k".to_string()]);
                Ok(vec![7])
            })
            .await
            .unwrap();

        assert_eq!(first.await.unwrap(), 7);
        assert_eq!(second.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_empty_dispatch_is_noop() {
        let loader: DataLoader<String, u32> = DataLoader::new();
        loader
            .dispatch(|_keys| async move {
                panic!("batch_load must not run for an empty dispatch");
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_after_dispatch_reuses_resolved_promise() {
        let loader: DataLoader<String, u32> = DataLoader::new();
        let first = loader.load("k".to_string());
        loader
            .dispatch(|_| async move { Ok(vec![7]) })
            .await
            .unwrap();
        assert_eq!(first.await.unwrap(), 7);

        // Same transaction, same key: the resolved promise is reused and no
        // new pending load appears.
        let again = loader.load("k".to_string());
        assert_eq!(loader.pending_count(), 0);
        assert_eq!(again.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_length_mismatch_fails_every_waiter() {
        let loader: DataLoader<String, u32> = DataLoader::new();
        let a = loader.load("a".to_string());
        let b = loader.load("b".to_string());

        let result = loader.dispatch(|_| async move { Ok(vec![1]) }).await;
        assert_eq!(
            result,
            Err(Error::BatchContract {
                expected: 2,
                actual: 1
            })
        );
        assert!(matches!(a.await, Err(Error::BatchContract { .. })));
        assert!(matches!(b.await, Err(Error::BatchContract { .. })));
    }

    #[tokio::test]
    async fn test_batch_error_reaches_every_waiter() {
        let loader: DataLoader<String, u32> = DataLoader::new();
        let a = loader.load("a".to_string());
        let b = loader.load("b".to_string());

        let result = loader
            .dispatch(|_| async move { Err(Error::backend("disk on fire")) })
            .await;
        assert!(result.is_err());
        assert_eq!(a.await, Err(Error::backend("disk on fire")));
        assert_eq!(b.await, Err(Error::backend("disk on fire")));
    }

    #[tokio::test]
    async fn test_dropped_loader_fails_pending_promises() {
        let loader: DataLoader<String, u32> = DataLoader::new();
        let promise = loader.load("k".to_string());
        drop(loader);
        assert_eq!(promise.await, Err(Error::TransactionDropped));
    }

    #[tokio::test]
    async fn test_clear_promises_forces_refetch() {
        let loader: DataLoader<String, u32> = DataLoader::new();
        let first = loader.load("k".to_string());
        loader
            .dispatch(|_| async move { Ok(vec![1]) })
            .await
            .unwrap();
        assert_eq!(first.await.unwrap(), 1);

        loader.clear_promises();
        let second = loader.load("k".to_string());
        assert_eq!(loader.pending_count(), 1);
        loader
            .dispatch(|_| async move { Ok(vec![2]) })
            .await
            .unwrap();
        assert_eq!(second.await.unwrap(), 2);
    }
}
