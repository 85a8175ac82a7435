//! A runner proxy that drops callbacks once its owner is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::RuntimeResult;
use crate::runner::{SharedRunner, Task, TaskRunner};
use crate::thread_checker::ThreadChecker;

/// Forwards tasks to a runner, discarding them at dispatch time once the
/// owner has called [`invalidate`](Self::invalidate).
///
/// An object that posts closures referring back to itself keeps one of these
/// and invalidates it before it goes away. Tasks posted before or after that
/// point then become silent no-ops instead of calling into a dead owner.
pub struct OwnerGuardedRunner {
    runner: SharedRunner,
    /// Read on the runner thread when a task is dispatched.
    valid: Arc<AtomicBool>,
    owner: ThreadChecker,
}

impl OwnerGuardedRunner {
    /// Create a guard owned by the calling thread.
    pub fn new(runner: SharedRunner) -> Self {
        Self {
            runner,
            valid: Arc::new(AtomicBool::new(true)),
            owner: ThreadChecker::new(),
        }
    }

    /// Create a guard already wrapped for sharing.
    pub fn new_shared(runner: SharedRunner) -> Arc<Self> {
        Arc::new(Self::new(runner))
    }

    /// Mark the owner as gone. Must be called once, on the owner's thread.
    pub fn invalidate(&self) {
        self.owner.assert_on_owner("OwnerGuardedRunner::invalidate");
        let was_valid = self.valid.swap(false, Ordering::AcqRel);
        debug_assert!(was_valid, "OwnerGuardedRunner invalidated twice");
    }

    /// Whether tasks posted through this guard will still run.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// The runner tasks are forwarded to.
    pub fn inner(&self) -> &SharedRunner {
        &self.runner
    }

    fn guard(&self, task: Task) -> Task {
        let valid = Arc::clone(&self.valid);
        Box::new(move || {
            if valid.load(Ordering::Acquire) {
                task();
            } else {
                tracing::trace!("Dropping stale callback after owner invalidation");
            }
        })
    }
}

impl TaskRunner for OwnerGuardedRunner {
    fn post_task(&self, task: Task) -> RuntimeResult<()> {
        self.runner.post_task(self.guard(task))
    }

    fn post_delayed_task(&self, delay: Duration, task: Task) -> RuntimeResult<()> {
        self.runner.post_delayed_task(delay, self.guard(task))
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        self.runner.runs_tasks_on_current_thread()
    }
}

impl Drop for OwnerGuardedRunner {
    fn drop(&mut self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            tracing::trace!("OwnerGuardedRunner dropped without invalidate; invalidating now");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manual::ManualTaskRunner;
    use crate::runner::TaskRunnerExt;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_valid_guard_runs_tasks() {
        let runner = ManualTaskRunner::new();
        let guarded = OwnerGuardedRunner::new(runner.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        guarded.post(counting_task(&calls)).unwrap();
        runner.run_until_idle();

        assert!(guarded.is_valid());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_drops_tasks_posted_before_and_after() {
        let runner = ManualTaskRunner::new();
        let guarded = OwnerGuardedRunner::new(runner.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        guarded.post(counting_task(&calls)).unwrap();
        guarded
            .post_delayed(Duration::from_millis(1), counting_task(&calls))
            .unwrap();
        guarded.invalidate();
        guarded.post(counting_task(&calls)).unwrap();

        // The posts still reach the runner; they just do nothing there.
        assert_eq!(runner.pending(), 3);
        assert_eq!(runner.fire_delayed(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalidation_seen_across_threads() {
        let runner = ManualTaskRunner::new();
        let guarded = Arc::new(OwnerGuardedRunner::new(runner.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        let remote = Arc::clone(&guarded);
        let task = counting_task(&calls);
        std::thread::spawn(move || remote.post(task).unwrap())
            .join()
            .unwrap();

        guarded.invalidate();
        runner.run_until_idle();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_invalidates_outstanding_tasks() {
        let runner = ManualTaskRunner::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let guarded = OwnerGuardedRunner::new(runner.clone());
            guarded.post(counting_task(&calls)).unwrap();
        }

        runner.run_until_idle();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "invalidated twice")]
    fn test_double_invalidate_is_a_programmer_error() {
        let runner = ManualTaskRunner::new();
        let guarded = OwnerGuardedRunner::new(runner);
        guarded.invalidate();
        guarded.invalidate();
    }
}
