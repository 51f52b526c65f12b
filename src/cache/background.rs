//! Owned periodic maintenance tasks
//!
//! A task holds only a `Weak` reference to what it maintains and is aborted
//! when its owner drops the handle, so it never outlives the cache.

use std::sync::Weak;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Shortest period a task runs at; zero would make `tokio::time::interval` panic
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a running periodic task; aborts the task on drop
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Run `tick` against `target` every `interval` on the current runtime.
    ///
    /// Returns `None` outside a tokio runtime; the owner then has to drive
    /// the maintenance itself. Intervals below 10ms are raised to 10ms.
    pub fn spawn_periodic<T, F>(
        name: &'static str,
        interval: Duration,
        target: Weak<T>,
        tick: F,
    ) -> Option<Self>
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(task = name, "no tokio runtime, periodic task not started");
                return None;
            }
        };

        if interval < MIN_INTERVAL {
            warn!(task = name, ?interval, "interval too short, using {:?}", MIN_INTERVAL);
        }
        let interval = interval.max(MIN_INTERVAL);

        info!(task = name, ?interval, "starting background task");

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(target) = target.upgrade() else {
                    break;
                };
                tick(&target);
            }
            debug!(task = name, "background task target dropped");
        });

        Some(Self { name, handle })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        debug!(task = self.name, "stopping background task");
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_no_runtime_returns_none() {
        let target = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::spawn_periodic(
            "test",
            Duration::from_millis(10),
            Arc::downgrade(&target),
            |counter: &AtomicUsize| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn test_periodic_ticks_and_abort() {
        let target = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::spawn_periodic(
            "test",
            Duration::from_millis(10),
            Arc::downgrade(&target),
            |counter: &AtomicUsize| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(target.load(Ordering::SeqCst) >= 1);
        assert_eq!(task.name(), "test");

        drop(task);
        let after_abort = target.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(target.load(Ordering::SeqCst) <= after_abort + 1);
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let target = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::spawn_periodic(
            "test",
            Duration::ZERO,
            Arc::downgrade(&target),
            |counter: &AtomicUsize| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!task.is_finished());
        assert!(target.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_task_exits_when_target_dropped() {
        let target = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::spawn_periodic(
            "test",
            Duration::from_millis(5),
            Arc::downgrade(&target),
            |_: &AtomicUsize| {},
        )
        .unwrap();

        drop(target);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(task.is_finished());
    }
}
