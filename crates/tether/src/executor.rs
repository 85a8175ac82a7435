//! Keyed Serial Executor
//!
//! Serialises asynchronous work per key. Each key owns a FIFO of tasks; a task
//! starts as soon as the previous one for the same key has released every
//! [`Barrier`] it was handed. Different keys never wait on each other.
//!
//! ```text
//! Idle ──push_task──► Executing ──last barrier released──► Idle
//!                         ▲                                  │
//!                         └──────── next task dequeued ◄─────┘
//! ```
//!
//! Pushing and issuing barriers happen on the executor's runner thread.
//! Barriers themselves may be released anywhere: the release is posted back to
//! the runner, which is where the queue advances.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tether_runtime::{SharedRunner, TaskRunnerExt};

use crate::config::ExecutorConfig;

/// Anything usable as a queue key.
pub trait ExecutorKey: Clone + Eq + Hash + fmt::Debug + Send + 'static {}

impl<T> ExecutorKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + 'static {}

type KeyedTask<K> = Box<dyn FnOnce(Barrier<K>) + Send + 'static>;

/// Bookkeeping for one issued barrier.
struct HeldBarrier {
    issued: Instant,
    /// Set once the watchdog has warned about it.
    reported: bool,
}

struct TaskQueue<K: ExecutorKey> {
    pending: VecDeque<KeyedTask<K>>,
    /// Barriers issued and not yet released. Non-empty means executing.
    outstanding: HashMap<u64, HeldBarrier>,
}

impl<K: ExecutorKey> Default for TaskQueue<K> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            outstanding: HashMap::new(),
        }
    }
}

impl<K: ExecutorKey> TaskQueue<K> {
    fn is_executing(&self) -> bool {
        !self.outstanding.is_empty()
    }
}

struct ExecutorInner<K: ExecutorKey> {
    queues: Mutex<HashMap<K, TaskQueue<K>>>,
    runner: SharedRunner,
    watchdog: Option<Duration>,
    /// At most one watchdog sweep is queued on the runner at a time.
    sweep_armed: AtomicBool,
    next_barrier_id: AtomicU64,
}

impl<K: ExecutorKey> ExecutorInner<K> {
    fn assert_on_runner(&self, what: &str) {
        debug_assert!(
            self.runner.runs_tasks_on_current_thread(),
            "KeyedSerialExecutor::{what} called off the executor thread"
        );
    }

    /// Record a new outstanding barrier on `queue` and return its id.
    fn reserve(&self, queue: &mut TaskQueue<K>) -> u64 {
        let id = self.next_barrier_id.fetch_add(1, Ordering::Relaxed);
        queue.outstanding.insert(
            id,
            HeldBarrier {
                issued: Instant::now(),
                reported: false,
            },
        );
        id
    }

    fn issue(self: &Arc<Self>, key: K, id: u64) -> Barrier<K> {
        if let Some(limit) = self.watchdog {
            if !self.sweep_armed.swap(true, Ordering::Relaxed) {
                self.arm_sweep(limit);
            }
        }
        Barrier {
            inner: Arc::clone(self),
            key,
            id,
        }
    }

    fn arm_sweep(self: &Arc<Self>, delay: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let armed = self.runner.post_delayed(delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.sweep();
            }
        });
        if armed.is_err() {
            self.sweep_armed.store(false, Ordering::Relaxed);
            tracing::trace!("Runner gone; barrier watchdog not armed");
        }
    }

    /// Warn once about every barrier held past the watchdog limit, then
    /// re-arm for the earliest barrier not yet due.
    fn sweep(self: &Arc<Self>) {
        let Some(limit) = self.watchdog else {
            return;
        };
        let now = Instant::now();
        let mut next: Option<Duration> = None;
        {
            let mut queues = self.queues.lock();
            for (key, queue) in queues.iter_mut() {
                for (id, held) in queue.outstanding.iter_mut().filter(|(_, held)| !held.reported) {
                    let age = now.saturating_duration_since(held.issued);
                    if age >= limit {
                        held.reported = true;
                        tracing::warn!(
                            key = ?key,
                            barrier = id,
                            held_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                            "Barrier still held; queue for this key is stalled"
                        );
                    } else {
                        let remaining = limit - age;
                        next = Some(next.map_or(remaining, |due| due.min(remaining)));
                    }
                }
            }
        }

        match next {
            Some(delay) => self.arm_sweep(delay),
            None => self.sweep_armed.store(false, Ordering::Relaxed),
        }
    }

    /// Runs on the executor thread once a barrier has been dropped.
    fn on_finish(self: &Arc<Self>, key: K, id: u64) {
        let next = {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get_mut(&key) else {
                debug_assert!(false, "barrier released for unknown key {key:?}");
                return;
            };
            let released = queue.outstanding.remove(&id).is_some();
            debug_assert!(released, "barrier {id} released twice for key {key:?}");

            if queue.is_executing() {
                None
            } else if let Some(task) = queue.pending.pop_front() {
                let next_id = self.reserve(queue);
                Some((task, next_id))
            } else {
                queues.remove(&key);
                None
            }
        };

        if let Some((task, next_id)) = next {
            tracing::trace!(key = ?key, "Starting next queued task");
            let barrier = self.issue(key, next_id);
            task(barrier);
        }
    }
}

/// Runs tasks for the same key one after another.
///
/// Cloning yields another handle to the same queues.
pub struct KeyedSerialExecutor<K: ExecutorKey> {
    inner: Arc<ExecutorInner<K>>,
}

impl<K: ExecutorKey> Clone for KeyedSerialExecutor<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: ExecutorKey> KeyedSerialExecutor<K> {
    /// Executor driven by `runner`, without a barrier watchdog.
    pub fn new(runner: SharedRunner) -> Self {
        Self::with_config(runner, &ExecutorConfig::default())
    }

    pub fn with_config(runner: SharedRunner, config: &ExecutorConfig) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                queues: Mutex::new(HashMap::new()),
                runner,
                watchdog: config.barrier_watchdog(),
                sweep_armed: AtomicBool::new(false),
                next_barrier_id: AtomicU64::new(0),
            }),
        }
    }

    /// Queue `task` under `key`. If the key is idle the task runs right away,
    /// before this call returns.
    ///
    /// The task receives the barrier for its own run; the next task for `key`
    /// starts once that barrier (and any extra ones taken with
    /// [`new_barrier`](Self::new_barrier)) is dropped. A task that finishes
    /// synchronously simply lets the barrier fall out of scope.
    ///
    /// A panic inside an immediately-started task unwinds out of this call.
    /// The barrier is dropped during unwinding, so the key still advances.
    pub fn push_task<F>(&self, key: K, task: F)
    where
        F: FnOnce(Barrier<K>) + Send + 'static,
    {
        self.inner.assert_on_runner("push_task");

        let id = {
            let mut queues = self.inner.queues.lock();
            let queue = queues.entry(key.clone()).or_default();
            if queue.is_executing() {
                queue.pending.push_back(Box::new(task));
                tracing::trace!(key = ?key, pending = queue.pending.len(), "Task queued behind running task");
                return;
            }
            self.inner.reserve(queue)
        };

        let barrier = self.inner.issue(key, id);
        task(barrier);
    }

    /// Take an extra barrier on `key`.
    ///
    /// While held, the key counts as executing: on an idle key this reserves
    /// it, on a busy key it delays the next task until this barrier is also
    /// released.
    pub fn new_barrier(&self, key: K) -> Barrier<K> {
        self.inner.assert_on_runner("new_barrier");

        let id = {
            let mut queues = self.inner.queues.lock();
            let queue = queues.entry(key.clone()).or_default();
            self.inner.reserve(queue)
        };
        self.inner.issue(key, id)
    }

    /// Whether a task (or a reservation) currently holds `key`.
    pub fn is_executing(&self, key: &K) -> bool {
        self.inner
            .queues
            .lock()
            .get(key)
            .is_some_and(TaskQueue::is_executing)
    }

    /// Tasks waiting behind the running one for `key`.
    pub fn pending(&self, key: &K) -> usize {
        self.inner
            .queues
            .lock()
            .get(key)
            .map_or(0, |queue| queue.pending.len())
    }

    /// Keys that are executing or have queued work.
    pub fn key_count(&self) -> usize {
        self.inner.queues.lock().len()
    }

    pub fn runner(&self) -> &SharedRunner {
        &self.inner.runner
    }
}

impl<K: ExecutorKey> fmt::Debug for KeyedSerialExecutor<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedSerialExecutor")
            .field("keys", &self.key_count())
            .field("watchdog", &self.inner.watchdog)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Barrier
// ─────────────────────────────────────────────────────────────────────────────

/// Scoped token marking asynchronous work in progress for one key.
///
/// Dropping it (on any thread) posts the completion back to the executor's
/// runner. Move it into whatever completion callback ends the work.
#[must_use = "dropping a barrier immediately releases its key"]
pub struct Barrier<K: ExecutorKey> {
    inner: Arc<ExecutorInner<K>>,
    key: K,
    id: u64,
}

impl<K: ExecutorKey> Barrier<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Release now. Equivalent to dropping.
    pub fn release(self) {}
}

impl<K: ExecutorKey> Drop for Barrier<K> {
    fn drop(&mut self) {
        let runner = Arc::clone(&self.inner.runner);
        let inner = Arc::clone(&self.inner);
        let key = self.key.clone();
        let id = self.id;
        if runner.post(move || inner.on_finish(key, id)).is_err() {
            tracing::warn!(key = ?self.key, "Executor runner gone; barrier release lost");
        }
    }
}

impl<K: ExecutorKey> fmt::Debug for Barrier<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use tether_runtime::ManualTaskRunner;

    fn executor() -> (Arc<ManualTaskRunner>, KeyedSerialExecutor<&'static str>) {
        let runner = ManualTaskRunner::new();
        let executor = KeyedSerialExecutor::new(runner.clone() as SharedRunner);
        (runner, executor)
    }

    type Log = Arc<Mutex<Vec<String>>>;

    #[test]
    fn test_tasks_for_one_key_run_in_order_without_overlap() {
        let (runner, executor) = executor();
        let log: Log = Arc::default();
        let held: Arc<Mutex<Vec<Barrier<&'static str>>>> = Arc::default();

        for i in 0..5 {
            let log = Arc::clone(&log);
            let held = Arc::clone(&held);
            executor.push_task("k", move |barrier| {
                log.lock().push(format!("start {i}"));
                held.lock().push(barrier);
            });
        }

        // Only the first task has started; each release lets exactly one more in.
        let started = |log: &Log| {
            log.lock()
                .iter()
                .filter(|entry| entry.starts_with("start"))
                .count()
        };
        for i in 0..5 {
            assert_eq!(started(&log), i + 1);
            assert_eq!(executor.pending(&"k"), 4 - i);
            let barrier = held.lock().pop().unwrap();
            log.lock().push(format!("end {i}"));
            drop(barrier);
            runner.run_until_idle();
        }

        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start {i}"), format!("end {i}")])
            .collect();
        assert_eq!(*log.lock(), expected);
        assert!(!executor.is_executing(&"k"));
        assert_eq!(executor.key_count(), 0);
    }

    #[test]
    fn test_keys_do_not_wait_on_each_other() {
        let (_runner, executor) = executor();
        let log: Log = Arc::default();
        let held: Arc<Mutex<Vec<Barrier<&'static str>>>> = Arc::default();

        for key in ["a", "b"] {
            let log = Arc::clone(&log);
            let held = Arc::clone(&held);
            executor.push_task(key, move |barrier| {
                log.lock().push(key.to_string());
                held.lock().push(barrier);
            });
        }

        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert!(executor.is_executing(&"a"));
        assert!(executor.is_executing(&"b"));
        assert_eq!(executor.key_count(), 2);
    }

    #[test]
    fn test_release_starts_next_task_without_another_push() {
        let (runner, executor) = executor();
        let log: Log = Arc::default();
        let held: Arc<Mutex<Option<Barrier<&'static str>>>> = Arc::default();

        let (a_log, a_held) = (Arc::clone(&log), Arc::clone(&held));
        executor.push_task("k", move |barrier| {
            a_log.lock().push("A".into());
            *a_held.lock() = Some(barrier);
        });
        for name in ["B", "C"] {
            let log = Arc::clone(&log);
            executor.push_task("k", move |_barrier| log.lock().push(name.into()));
        }

        assert_eq!(*log.lock(), vec!["A"]);
        assert!(executor.is_executing(&"k"));
        assert_eq!(executor.pending(&"k"), 2);

        // Releasing off-thread only posts; the queue moves when the runner drains.
        let barrier = held.lock().take().unwrap();
        std::thread::spawn(move || drop(barrier)).join().unwrap();
        assert_eq!(*log.lock(), vec!["A"]);

        runner.run_until_idle();
        assert_eq!(*log.lock(), vec!["A", "B", "C"]);
        assert_eq!(executor.key_count(), 0);
    }

    #[test]
    fn test_empty_task_still_advances_queue() {
        let (runner, executor) = executor();
        let ran = Arc::new(Mutex::new(false));

        executor.push_task("k", |_barrier| {});
        let flag = Arc::clone(&ran);
        executor.push_task("k", move |_barrier| *flag.lock() = true);

        assert!(!*ran.lock());
        runner.run_until_idle();
        assert!(*ran.lock());
    }

    #[test]
    fn test_panicking_task_propagates_and_releases_key() {
        let (runner, executor) = executor();

        let result = catch_unwind(AssertUnwindSafe(|| {
            executor.push_task("k", |_barrier| panic!("task failed"));
        }));
        assert!(result.is_err());

        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        executor.push_task("k", move |_barrier| *flag.lock() = true);

        runner.run_until_idle();
        assert!(*ran.lock());
    }

    #[test]
    fn test_barrier_on_idle_key_reserves_it() {
        let (runner, executor) = executor();
        let reservation = executor.new_barrier("k");
        assert_eq!(reservation.key(), &"k");

        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        executor.push_task("k", move |_barrier| *flag.lock() = true);
        assert!(!*ran.lock());

        reservation.release();
        runner.run_until_idle();
        assert!(*ran.lock());
    }

    #[test]
    fn test_queue_waits_for_every_barrier() {
        let (runner, executor) = executor();
        let held: Arc<Mutex<Vec<Barrier<&'static str>>>> = Arc::default();

        let inner = executor.clone();
        let first_held = Arc::clone(&held);
        executor.push_task("k", move |barrier| {
            let extra = inner.new_barrier("k");
            first_held.lock().extend([barrier, extra]);
        });
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        executor.push_task("k", move |_barrier| *flag.lock() = true);

        drop(held.lock().pop());
        runner.run_until_idle();
        assert!(!*ran.lock());
        assert!(executor.is_executing(&"k"));

        drop(held.lock().pop());
        runner.run_until_idle();
        assert!(*ran.lock());
    }

    #[test]
    fn test_watchdog_reports_but_does_not_release() {
        let runner = ManualTaskRunner::new();
        let config = ExecutorConfig {
            barrier_watchdog_ms: Some(5),
        };
        let executor: KeyedSerialExecutor<u32> =
            KeyedSerialExecutor::with_config(runner.clone() as SharedRunner, &config);
        let held: Arc<Mutex<Option<Barrier<u32>>>> = Arc::default();

        let slot = Arc::clone(&held);
        executor.push_task(7, move |barrier| *slot.lock() = Some(barrier));
        executor.push_task(7, |_barrier| {});
        assert_eq!(runner.pending_delayed(), 1);

        runner.fire_delayed();
        assert!(executor.is_executing(&7));
        assert_eq!(executor.pending(&7), 1);

        drop(held.lock().take());
        runner.run_until_idle();
        runner.fire_delayed();
        assert_eq!(executor.key_count(), 0);
    }

    #[test]
    fn test_watchdog_keeps_one_sweep_for_many_barriers() {
        let runner = ManualTaskRunner::new();
        let config = ExecutorConfig {
            barrier_watchdog_ms: Some(5),
        };
        let executor: KeyedSerialExecutor<u32> =
            KeyedSerialExecutor::with_config(runner.clone() as SharedRunner, &config);
        let held: Arc<Mutex<Vec<Barrier<u32>>>> = Arc::default();

        for key in 0..20 {
            let slot = Arc::clone(&held);
            executor.push_task(key, move |barrier| slot.lock().push(barrier));
        }
        assert_eq!(runner.pending_delayed(), 1);

        // Every barrier is overdue by now; each is reported once and the sweep
        // is not re-armed for them.
        std::thread::sleep(Duration::from_millis(20));
        runner.fire_delayed();
        assert_eq!(runner.pending_delayed(), 0);
        assert_eq!(executor.key_count(), 20);

        // A fresh barrier arms a new sweep.
        let fresh = executor.new_barrier(99);
        assert_eq!(runner.pending_delayed(), 1);

        drop(fresh);
        held.lock().clear();
        runner.run_until_idle();
        runner.fire_delayed();
        assert_eq!(executor.key_count(), 0);
        assert_eq!(runner.pending_delayed(), 0);
    }

    #[test]
    fn test_release_after_runner_closed_is_dropped() {
        let (runner, executor) = executor();
        let barrier = executor.new_barrier("k");
        runner.close();
        drop(barrier);
        assert!(executor.is_executing(&"k"));
    }
}
