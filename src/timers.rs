//! Cancellable timers built the way the page runtime schedules work: a
//! spawned task selecting between the clock and a cancel channel, so a
//! cancellation can never race a pending tick.

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

/// Handle to a scheduled timeout or interval. Cancellation is idempotent;
/// dropping the handle also cancels.
#[derive(Debug)]
pub struct SafeTask {
    cancel_tx: mpsc::UnboundedSender<()>,
}

impl SafeTask {
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(());
    }
}

impl Drop for SafeTask {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(());
    }
}

/// Run `f` once after `delay`, unless cancelled first.
pub fn safe_timeout<F>(delay: Duration, f: F) -> SafeTask
where
    F: FnOnce() + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        tokio::select! {
            _ = sleep(delay) => f(),
            _ = cancel_rx.recv() => {}
        }
    });
    SafeTask { cancel_tx }
}

/// Run `f` every `period`, first tick after `period`. The next tick is only
/// scheduled once the previous callback returns, so ticks cannot pile up.
pub fn safe_interval<F>(period: Duration, mut f: F) -> SafeTask
where
    F: FnMut() + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(period) => f(),
                _ = cancel_rx.recv() => break,
            }
        }
    });
    SafeTask { cancel_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn timeout_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _task = safe_timeout(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_timeout_never_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = safe_timeout(Duration::from_millis(20), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();
        task.cancel();
        sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn interval_first_tick_after_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = safe_interval(Duration::from_millis(15), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        // Nothing before the first period elapses.
        sleep(Duration::from_millis(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(50)).await;
        task.cancel();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 1);
        sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
