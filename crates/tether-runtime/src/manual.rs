//! A task runner pumped by its owner.
//!
//! Hosts that already own a message loop (or tests that want determinism)
//! drain this runner themselves with [`ManualTaskRunner::run_until_idle`].
//! Tasks may be posted from any thread; they only ever run on the thread that
//! created the runner.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runner::{SharedRunner, Task, TaskRunner, set_current_runner};

struct DelayedTask {
    due: Instant,
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct Queues {
    ready: VecDeque<Task>,
    delayed: Vec<DelayedTask>,
    next_seq: u64,
    /// Checked and set under the same lock as the queues.
    closed: bool,
}

impl Queues {
    /// Move every delayed task due at or before `now` onto the ready queue,
    /// earliest deadline first.
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|d| (d.due, d.seq));
        let due_count = self.delayed.iter().take_while(|d| d.due <= now).count();
        self.ready
            .extend(self.delayed.drain(..due_count).map(|d| d.task));
    }
}

/// Runner whose queue is drained explicitly on its owning thread.
pub struct ManualTaskRunner {
    owner: ThreadId,
    queues: Mutex<Queues>,
}

impl ManualTaskRunner {
    /// Create a runner owned by the calling thread.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            queues: Mutex::new(Queues::default()),
        })
    }

    /// Run ready tasks (and delayed tasks whose deadline has passed) until
    /// none remain. Tasks posted while draining run in the same call.
    ///
    /// Returns the number of tasks executed.
    pub fn run_until_idle(self: &Arc<Self>) -> usize {
        debug_assert!(
            self.runs_tasks_on_current_thread(),
            "ManualTaskRunner drained off its owning thread"
        );
        let _current = set_current_runner(Arc::clone(self) as SharedRunner);

        let mut ran = 0;
        loop {
            let next = {
                let mut queues = self.queues.lock();
                queues.promote_due(Instant::now());
                queues.ready.pop_front()
            };
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    /// Treat every delayed task queued right now as due, then drain.
    ///
    /// Delayed tasks posted by the tasks that run here keep their deadline.
    pub fn fire_delayed(self: &Arc<Self>) -> usize {
        {
            let mut queues = self.queues.lock();
            let mut delayed = std::mem::take(&mut queues.delayed);
            delayed.sort_by_key(|d| (d.due, d.seq));
            queues.ready.extend(delayed.into_iter().map(|d| d.task));
        }
        self.run_until_idle()
    }

    /// Number of queued tasks, delayed ones included.
    pub fn pending(&self) -> usize {
        let queues = self.queues.lock();
        queues.ready.len() + queues.delayed.len()
    }

    /// Number of queued delayed tasks.
    pub fn pending_delayed(&self) -> usize {
        self.queues.lock().delayed.len()
    }

    /// Stop accepting tasks and drop everything still queued.
    pub fn close(&self) {
        let dropped = {
            let mut queues = self.queues.lock();
            queues.closed = true;
            let ready = std::mem::take(&mut queues.ready);
            let delayed = std::mem::take(&mut queues.delayed);
            (ready, delayed)
        };
        tracing::debug!(
            dropped = dropped.0.len() + dropped.1.len(),
            "Manual task runner closed"
        );
    }

    fn enqueue(&self, delay: Option<Duration>, task: Task) -> RuntimeResult<()> {
        let mut queues = self.queues.lock();
        if queues.closed {
            return Err(RuntimeError::TaskRunnerGone);
        }
        match delay {
            None => queues.ready.push_back(task),
            Some(delay) => {
                let seq = queues.next_seq;
                queues.next_seq += 1;
                queues.delayed.push(DelayedTask {
                    due: Instant::now() + delay,
                    seq,
                    task,
                });
            }
        }
        Ok(())
    }
}

impl TaskRunner for ManualTaskRunner {
    fn post_task(&self, task: Task) -> RuntimeResult<()> {
        self.enqueue(None, task)
    }

    fn post_delayed_task(&self, delay: Duration, task: Task) -> RuntimeResult<()> {
        self.enqueue(Some(delay), task)
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.owner
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{TaskRunnerExt, current_runner};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_runs_in_post_order() {
        let runner = ManualTaskRunner::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            runner.post(move || order.lock().push(i)).unwrap();
        }

        assert_eq!(runner.pending(), 5);
        assert_eq!(runner.run_until_idle(), 5);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_tasks_posted_while_draining_run_in_same_pass() {
        let runner = ManualTaskRunner::new();
        let hits = Arc::new(Mutex::new(0));

        let inner_runner = Arc::clone(&runner);
        let inner_hits = Arc::clone(&hits);
        runner
            .post(move || {
                *inner_hits.lock() += 1;
                let hits = Arc::clone(&inner_hits);
                inner_runner.post(move || *hits.lock() += 1).unwrap();
            })
            .unwrap();

        assert_eq!(runner.run_until_idle(), 2);
        assert_eq!(*hits.lock(), 2);
    }

    #[test]
    fn test_delayed_tasks_wait_for_deadline() {
        let runner = ManualTaskRunner::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        runner
            .post_delayed(Duration::from_secs(3600), move || {
                flag.store(true, Ordering::SeqCst)
            })
            .unwrap();

        assert_eq!(runner.run_until_idle(), 0);
        assert_eq!(runner.pending_delayed(), 1);

        assert_eq!(runner.fire_delayed(), 1);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_short_delay_becomes_due() {
        let runner = ManualTaskRunner::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        runner
            .post_delayed(Duration::from_millis(5), move || {
                flag.store(true, Ordering::SeqCst)
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(runner.run_until_idle(), 1);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_posts_from_other_threads_run_on_owner() {
        let runner = ManualTaskRunner::new();
        let (tx, rx) = std::sync::mpsc::channel();

        let remote = Arc::clone(&runner);
        std::thread::spawn(move || {
            assert!(!remote.runs_tasks_on_current_thread());
            remote
                .post(move || tx.send(std::thread::current().id()).unwrap())
                .unwrap();
        })
        .join()
        .unwrap();

        runner.run_until_idle();
        assert_eq!(rx.try_recv().unwrap(), std::thread::current().id());
    }

    #[test]
    fn test_closed_runner_rejects_tasks() {
        let runner = ManualTaskRunner::new();
        runner.post(|| {}).unwrap();
        runner.close();

        assert_eq!(runner.pending(), 0);
        assert!(matches!(
            runner.post(|| {}),
            Err(RuntimeError::TaskRunnerGone)
        ));
    }

    #[test]
    fn test_close_races_with_remote_posts() {
        let runner = ManualTaskRunner::new();
        let posters: Vec<_> = (0..4)
            .map(|_| {
                let remote = Arc::clone(&runner);
                std::thread::spawn(move || while remote.post(|| {}).is_ok() {})
            })
            .collect();

        std::thread::sleep(Duration::from_millis(5));
        runner.close();
        for poster in posters {
            poster.join().unwrap();
        }

        // Nothing accepted around the close survives it.
        assert_eq!(runner.pending(), 0);
        assert_eq!(runner.run_until_idle(), 0);
    }

    #[test]
    fn test_is_current_while_draining() {
        let runner = ManualTaskRunner::new();
        let (tx, rx) = std::sync::mpsc::channel();
        runner
            .post(move || tx.send(current_runner().is_some()).unwrap())
            .unwrap();

        runner.run_until_idle();
        assert!(rx.try_recv().unwrap());
        assert!(current_runner().is_none());
    }
}
