//! The task runner abstraction.
//!
//! Everything in tether reaches other threads through [`TaskRunner`]: a sink
//! for zero-argument tasks that runs them later, possibly on another thread.
//! The host decides what actually backs a runner; this crate ships a
//! thread-backed runner and a host-pumped one.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RuntimeResult;

/// A unit of work handed to a runner.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A runner shared between the components that post to it.
pub type SharedRunner = Arc<dyn TaskRunner>;

/// Accepts tasks and executes them later, best-effort.
///
/// Posting never blocks. A runner that has been torn down rejects the task
/// with [`RuntimeError::TaskRunnerGone`](crate::RuntimeError::TaskRunnerGone);
/// callers that treat posting as fire-and-forget may ignore that error.
pub trait TaskRunner: Send + Sync + 'static {
    /// Queue `task` to run as soon as possible.
    fn post_task(&self, task: Task) -> RuntimeResult<()>;

    /// Queue `task` to run once `delay` has elapsed.
    fn post_delayed_task(&self, delay: Duration, task: Task) -> RuntimeResult<()>;

    /// Whether the calling thread is the one this runner executes tasks on.
    fn runs_tasks_on_current_thread(&self) -> bool;
}

/// Closure-taking conveniences for any [`TaskRunner`], including trait objects.
pub trait TaskRunnerExt {
    fn post<F>(&self, f: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static;

    fn post_delayed<F>(&self, delay: Duration, f: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static;
}

impl<T: TaskRunner + ?Sized> TaskRunnerExt for T {
    fn post<F>(&self, f: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task(Box::new(f))
    }

    fn post_delayed<F>(&self, delay: Duration, f: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_delayed_task(delay, Box::new(f))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Current runner
// ─────────────────────────────────────────────────────────────────────────────

thread_local! {
    static CURRENT_RUNNER: RefCell<Option<SharedRunner>> = const { RefCell::new(None) };
}

/// The runner whose tasks are executing on this thread, if any.
pub fn current_runner() -> Option<SharedRunner> {
    CURRENT_RUNNER.with(|current| current.borrow().clone())
}

/// Make `runner` the current runner of this thread until the guard drops.
///
/// Guards nest: dropping one restores whatever was current before it.
pub fn set_current_runner(runner: SharedRunner) -> CurrentRunnerGuard {
    let previous = CURRENT_RUNNER.with(|current| current.borrow_mut().replace(runner));
    CurrentRunnerGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Restores the previous current runner on drop.
#[must_use = "the runner stops being current as soon as the guard is dropped"]
pub struct CurrentRunnerGuard {
    previous: Option<SharedRunner>,
    // Restoring must happen on the thread that installed the runner.
    _not_send: PhantomData<*const ()>,
}

impl Drop for CurrentRunnerGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_RUNNER.with(|current| *current.borrow_mut() = previous);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
