//! Callbacks that always run on a chosen thread.
//!
//! A [`CallerThreadForwarder`] pins a callback to a task runner, by default
//! the runner that was current when the forwarder was made. Invoking it on
//! that runner's thread runs the callback inline; invoking it anywhere else
//! posts the callback over. Invocation consumes the forwarder, so the callback
//! runs at most once and is freed as soon as it has run.
//!
//! Arguments of any arity travel as one value, typically a tuple:
//!
//! ```ignore
//! let done = CallerThreadForwarder::on_caller_thread(|(rows, elapsed): (Vec<Row>, Duration)| {
//!     push_results_to_script(rows, elapsed);
//! })?;
//! std::thread::spawn(move || done.call((query(), started.elapsed())));
//! ```

use crate::error::{RuntimeError, RuntimeResult};
use crate::runner::{SharedRunner, Task, current_runner};

/// A callback bound to the thread of a task runner.
pub struct CallerThreadForwarder<F> {
    callback: F,
    runner: SharedRunner,
}

impl<F> CallerThreadForwarder<F> {
    /// Bind `callback` to the runner current on the calling thread.
    pub fn on_caller_thread(callback: F) -> RuntimeResult<Self> {
        let runner = current_runner().ok_or(RuntimeError::NoCurrentRunner)?;
        Ok(Self { callback, runner })
    }

    /// Bind `callback` to an explicit runner.
    pub fn on_runner(callback: F, runner: SharedRunner) -> Self {
        Self { callback, runner }
    }

    /// The runner the callback will execute on.
    pub fn runner(&self) -> &SharedRunner {
        &self.runner
    }

    /// Invoke with `args`, inline or via the runner.
    pub fn call<A>(self, args: A)
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        let Self { callback, runner } = self;
        dispatch(&runner, Box::new(move || callback(args)));
    }

    /// Turn the forwarder into a plain callback for APIs that want one.
    pub fn into_callback<A>(self) -> impl FnOnce(A) + Send + 'static
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        move |args| self.call(args)
    }
}

impl<F> CallerThreadForwarder<F>
where
    F: FnOnce() + Send + 'static,
{
    /// Invoke a zero-argument callback, inline or via the runner.
    pub fn run(self) {
        let Self { callback, runner } = self;
        dispatch(&runner, Box::new(callback));
    }

    /// Turn the forwarder into a task that can be posted anywhere.
    pub fn into_task(self) -> Task {
        Box::new(move || self.run())
    }
}

fn dispatch(runner: &SharedRunner, task: Task) {
    if runner.runs_tasks_on_current_thread() {
        tracing::trace!("Running forwarded callback inline");
        task();
        return;
    }
    if runner.post_task(task).is_err() {
        tracing::trace!("Dropping forwarded callback: target runner is gone");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manual::ManualTaskRunner;
    use crate::runner::set_current_runner;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Counts how many times it has been dropped.
    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_requires_current_runner() {
        let result = thread::spawn(|| CallerThreadForwarder::on_caller_thread(|| {}).is_err())
            .join()
            .unwrap();
        assert!(result);
    }

    #[test]
    fn test_runs_inline_on_owner_thread() {
        let runner = ManualTaskRunner::new();
        let _current = set_current_runner(runner.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let forwarder = CallerThreadForwarder::on_caller_thread(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        forwarder.run();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.pending(), 0);
    }

    #[test]
    fn test_posts_back_from_other_thread_and_releases_once() {
        let runner = ManualTaskRunner::new();
        let _current = set_current_runner(runner.clone());
        let owner = thread::current().id();
        let ran_on = Arc::new(parking_lot::Mutex::new(None));
        let drops = Arc::new(AtomicUsize::new(0));

        let slot = Arc::clone(&ran_on);
        let guard = DropCounter(Arc::clone(&drops));
        let forwarder = CallerThreadForwarder::on_caller_thread(move || {
            let _guard = &guard;
            *slot.lock() = Some(thread::current().id());
        })
        .unwrap();

        thread::spawn(move || forwarder.run()).join().unwrap();

        // Deferred, not run on the worker.
        assert!(ran_on.lock().is_none());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        assert_eq!(runner.run_until_idle(), 1);
        assert_eq!(*ran_on.lock(), Some(owner));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forwards_tuple_arguments() {
        let runner = ManualTaskRunner::new();
        let received = Arc::new(parking_lot::Mutex::new(None));

        let slot = Arc::clone(&received);
        let forwarder = CallerThreadForwarder::on_runner(
            move |(id, name, ok): (u32, String, bool)| {
                *slot.lock() = Some((id, name, ok));
            },
            runner.clone(),
        );
        let callback = forwarder.into_callback();

        thread::spawn(move || callback((7, "seven".to_string(), true)))
            .join()
            .unwrap();
        runner.run_until_idle();

        assert_eq!(*received.lock(), Some((7, "seven".to_string(), true)));
    }

    #[test]
    fn test_gone_runner_drops_callback_silently() {
        let runner = ManualTaskRunner::new();
        runner.close();
        let drops = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let guard = DropCounter(Arc::clone(&drops));
        let counter = Arc::clone(&calls);
        let forwarder = CallerThreadForwarder::on_runner(
            move || {
                let _guard = &guard;
                counter.fetch_add(1, Ordering::SeqCst);
            },
            runner.clone(),
        );

        thread::spawn(move || forwarder.run()).join().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
