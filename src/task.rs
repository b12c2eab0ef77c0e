//! Small composition utilities for the lifecycle controllers: a named-future
//! map, a single-shot settled cell, and the per-controller cleanup registry.

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::Error;

/// Await every entry of a map of named futures, failing fast on the first
/// error. The failing task's name is logged; the error itself is returned
/// unchanged so callers can still match on its kind.
pub async fn run_named(tasks: Vec<(&'static str, BoxFuture<'_, Result<(), Error>>)>) -> Result<(), Error> {
    let wrapped = tasks.into_iter().map(|(name, fut)| async move {
        match fut.await {
            Ok(()) => {
                debug!(target = "task", task = name, "task complete");
                Ok(())
            }
            Err(err) => {
                error!(target = "task", task = name, error = %err, "task failed");
                Err(err)
            }
        }
    });
    futures_util::future::try_join_all(wrapped).await?;
    Ok(())
}

enum SettleState<T> {
    Pending(Vec<oneshot::Sender<T>>),
    Done(T),
}

/// A single-shot settled value with any number of waiters. The first call to
/// `settle` wins; later calls are ignored. Used for `onInit` and the child
/// binding slot, where one resolution must fan out in a well-defined order.
pub struct Settled<T> {
    state: Arc<Mutex<SettleState<T>>>,
}

impl<T> Clone for Settled<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + 'static> Settled<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SettleState::Pending(Vec::new()))),
        }
    }

    /// Settle the cell. Returns false if it was already settled.
    pub fn settle(&self, value: T) -> bool {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                SettleState::Done(_) => return false,
                SettleState::Pending(waiters) => {
                    let drained = std::mem::take(waiters);
                    *state = SettleState::Done(value.clone());
                    drained
                }
            }
        };
        for tx in waiters {
            let _ = tx.send(value.clone());
        }
        true
    }

    pub fn peek(&self) -> Option<T> {
        match &*self.state.lock().unwrap() {
            SettleState::Done(value) => Some(value.clone()),
            SettleState::Pending(_) => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), SettleState::Done(_))
    }

    /// Wait until the cell settles.
    pub async fn wait(&self) -> T {
        let rx = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                SettleState::Done(value) => return value.clone(),
                SettleState::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
            }
        };
        match rx.await {
            Ok(value) => value,
            // All senders dropped without settling: behave like a promise
            // that never resolves.
            Err(_) => std::future::pending().await,
        }
    }
}

impl<T: Clone + Send + 'static> Default for Settled<T> {
    fn default() -> Self {
        Self::new()
    }
}

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Ordered list of named teardown tasks for one controller. Tasks run once,
/// in registration order; a failure in one task does not stop the rest.
pub struct CleanupRegistry {
    tasks: Mutex<Vec<(String, CleanupFn)>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.tasks.lock().unwrap().push((name.into(), Box::new(task)));
    }

    /// Register a synchronous teardown task.
    pub fn register_sync<F>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(name, move || {
            task();
            Box::pin(async {})
        });
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Drain and run every registered task. Running twice is a no-op the
    /// second time because the registry empties on the first run.
    pub async fn run_all(&self) {
        let drained: Vec<(String, CleanupFn)> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for (name, task) in drained {
            debug!(target = "task", task = %name, "running cleanup task");
            task().await;
        }
    }
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn settled_fans_out_to_all_waiters() {
        let cell: Settled<u32> = Settled::new();
        let a = cell.clone();
        let b = cell.clone();
        let wa = tokio::spawn(async move { a.wait().await });
        let wb = tokio::spawn(async move { b.wait().await });
        tokio::task::yield_now().await;
        assert!(cell.settle(7));
        assert!(!cell.settle(9));
        assert_eq!(wa.await.unwrap(), 7);
        assert_eq!(wb.await.unwrap(), 7);
        assert_eq!(cell.peek(), Some(7));
    }

    #[tokio::test]
    async fn cleanup_runs_in_registration_order_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = CleanupRegistry::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            registry.register_sync(format!("task-{i}"), move || {
                order.lock().unwrap().push(i);
            });
        }
        registry.run_all().await;
        registry.run_all().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn run_named_fails_fast() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let result = run_named(vec![
            (
                "ok",
                Box::pin(async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            ),
            (
                "fails",
                Box::pin(async { Err(Error::Fatal("boom".into())) }),
            ),
        ])
        .await;
        assert!(matches!(result, Err(Error::Fatal(_))));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
