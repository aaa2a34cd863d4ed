use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use opentelemetry::{
    KeyValue,
    global::{self},
    metrics::{Counter, Histogram, Meter},
};
use tokio::{sync::Notify, task::JoinHandle, time::sleep};

use crate::{errors::ControllerError, utils::metric_name};

const TASK_QUEUE: &'static str = "task_queue";

/// Delay before the first retry of a failed key.
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Retries of a key that keeps failing are spaced at most this far apart.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, queued or not.
    dirty: HashSet<String>,
    /// Keys handed out by `get` and not yet `done`.
    processing: HashSet<String>,
    /// Backoff of keys whose last sync failed.
    failures: HashMap<String, ExponentialBackoff>,
    shutting_down: bool,
}

struct Inner {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

/// De-duplicating, rate-limited work queue drained by a single worker.
///
/// A key added while queued is a no-op, a key added while it is being
/// processed is queued again once the worker marks it `done`.
#[derive(Clone)]
pub(crate) struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub(crate) fn new(name: &'static str) -> Self {
        Self::with_backoff(name, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF)
    }

    pub(crate) fn with_backoff(
        name: &'static str,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Default::default(),
                notify: Notify::new(),
                worker: Default::default(),
                initial_backoff,
                max_backoff,
            }),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues the key unless it is already waiting or the queue is shut down.
    pub(crate) fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueues the key after its current backoff delay, which doubles on
    /// every call until the key is forgotten.
    pub(crate) fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            let (initial, max) = (self.inner.initial_backoff, self.inner.max_backoff);
            state
                .failures
                .entry(key.clone())
                .or_insert_with(|| new_backoff(initial, max))
                .next_backoff()
                .unwrap_or(max)
        };
        debug!(
            "requeuing {} on {} queue in {:?}",
            key, self.inner.name, delay
        );
        let queue = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.add(key);
        });
    }

    /// Resets the backoff of the key.
    pub(crate) fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and
    /// drained.
    pub(crate) async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks the key as processed, requeuing it if it was added meanwhile.
    pub(crate) fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Number of queued keys, excluding keys being processed.
    pub(crate) fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Starts the single worker of this queue, calling `sync` for every key.
    pub(crate) fn run<F, Fut>(&self, sync: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ControllerError>> + Send,
    {
        let mut worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            warn!("worker of {} queue already running", self.inner.name);
            return;
        }
        let queue = self.clone();
        *worker = Some(tokio::spawn(async move { queue.worker(sync).await }));
    }

    async fn worker<F, Fut>(self, sync: F)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), ControllerError>>,
    {
        let meter: Meter = global::meter(TASK_QUEUE);
        let sync_count: Counter<u64> = meter
            .u64_counter(metric_name("queue_sync_count"))
            .with_description("Count of keys processed by a task queue worker")
            .build();
        let sync_errors: Counter<u64> = meter
            .u64_counter(metric_name("queue_sync_errors"))
            .with_description("Count of keys whose sync failed and was requeued")
            .build();
        let sync_duration: Histogram<u64> = meter
            .u64_histogram(metric_name("queue_sync_duration_ms"))
            .with_description("Sync duration of a single key in milliseconds")
            .with_unit("ms")
            .build();
        let labels = &[KeyValue::new("queue", self.inner.name)];

        while let Some(key) = self.get().await {
            let start = Instant::now();
            match sync(key.clone()).await {
                Ok(()) => self.forget(&key),
                Err(e) => {
                    warn!("sync of {} on {} queue failed: {}", key, self.inner.name, e);
                    sync_errors.add(1, labels);
                    self.add_rate_limited(key.clone());
                }
            }
            sync_count.add(1, labels);
            sync_duration.record(start.elapsed().as_millis() as u64, labels);
            self.done(&key);
        }
        info!("worker of {} queue exiting", self.inner.name);
    }

    /// Closes the queue and waits until the worker has drained it and exited.
    pub(crate) async fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("worker of {} queue failed: {}", self.inner.name, e);
            }
        }
    }
}

fn new_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(max)
        .with_randomization_factor(0.0)
        .with_multiplier(2.0)
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio::{sync::mpsc, time::timeout};

    use super::*;

    #[tokio::test]
    async fn keys_are_deduplicated() {
        let queue = TaskQueue::new("test");
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(2, queue.len());

        assert_eq!(Some("a".to_string()), queue.get().await);
        // Added while processing, held back until done.
        queue.add("a");
        assert_eq!(1, queue.len());
        queue.done("a");
        assert_eq!(2, queue.len());

        assert_eq!(Some("b".to_string()), queue.get().await);
        assert_eq!(Some("a".to_string()), queue.get().await);
        queue.done("b");
        queue.done("a");
        assert_eq!(0, queue.len());
    }

    #[test]
    fn backoff_grows_and_is_bounded() {
        let max = Duration::from_millis(35);
        let mut backoff = new_backoff(Duration::from_millis(10), max);
        let delays: Vec<Duration> = (0..6).filter_map(|_| backoff.next_backoff()).collect();
        assert_eq!(6, delays.len());
        assert!(delays[0] >= Duration::from_millis(10));
        assert!(delays[1] > delays[0]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= max + Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn failed_syncs_are_retried() {
        let queue =
            TaskQueue::with_backoff("test", Duration::from_millis(1), Duration::from_millis(10));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        queue.run(move |key| {
            let tx = tx.clone();
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let _ = tx.send((key, attempt));
                if attempt < 2 {
                    Err(ControllerError::Invalid("try again".to_string()))
                } else {
                    Ok(())
                }
            }
        });
        queue.add("default/foo");
        for expected in 0..3 {
            let (key, attempt) = timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!("default/foo", key);
            assert_eq!(expected, attempt);
        }
        queue.shutdown().await;
        assert_eq!(3, attempts.load(Ordering::SeqCst));
        assert!(queue.state().failures.is_empty());
    }

    #[tokio::test]
    async fn shutdown_waits_for_worker() {
        let queue = TaskQueue::new("test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        queue.run(move |_key| {
            let tx = tx.clone();
            let flag = flag.clone();
            async move {
                let _ = tx.send(());
                sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        queue.add("nodes");
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        queue.shutdown().await;
        assert!(finished.load(Ordering::SeqCst));

        queue.add("nodes");
        assert_eq!(0, queue.len());
        assert_eq!(None, queue.get().await);
    }
}
