//! Thread-backed task runner.
//!
//! Each [`ThreadTaskRunner`] owns a dedicated OS thread with a
//! single-threaded Tokio runtime, the same shape as a script-host worker:
//! one thread, no work stealing, tasks executed strictly one at a time.
//! Tasks arrive over a channel; delayed tasks are timed on the runner thread
//! itself.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::{RuntimeError, RuntimeResult};
use crate::runner::{SharedRunner, Task, TaskRunner, set_current_runner};

/// Messages delivered to the runner thread.
enum RunnerMessage {
    Run(Task),
    RunDelayed(Duration, Task),
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cheap posting side of a runner thread.
///
/// This is what the runner thread installs as its own current runner, so
/// tasks that capture it never keep the thread's join handle alive.
#[derive(Clone)]
struct RunnerHandle {
    cmd_tx: mpsc::UnboundedSender<RunnerMessage>,
    terminated: Arc<AtomicBool>,
    thread_id: ThreadId,
}

impl RunnerHandle {
    fn send(&self, message: RunnerMessage) -> RuntimeResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(RuntimeError::TaskRunnerGone);
        }
        self.cmd_tx
            .send(message)
            .map_err(|_| RuntimeError::TaskRunnerGone)
    }
}

impl TaskRunner for RunnerHandle {
    fn post_task(&self, task: Task) -> RuntimeResult<()> {
        self.send(RunnerMessage::Run(task))
    }

    fn post_delayed_task(&self, delay: Duration, task: Task) -> RuntimeResult<()> {
        self.send(RunnerMessage::RunDelayed(delay, task))
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Thread Task Runner
// ─────────────────────────────────────────────────────────────────────────────

/// A task runner backed by its own named thread.
pub struct ThreadTaskRunner {
    name: String,
    handle: RunnerHandle,
    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,
    /// Thread join handle
    thread_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ThreadTaskRunner {
    /// Spawn the runner thread and wait until it is ready to accept tasks.
    pub fn spawn(name: impl Into<String>) -> RuntimeResult<Arc<Self>> {
        let name = name.into();
        tracing::debug!(runner = %name, "Spawning task runner thread");

        let terminated = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<RunnerMessage>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<RuntimeResult<()>>(1);

        let worker_tx = cmd_tx.clone();
        let worker_terminated = Arc::clone(&terminated);
        let worker_name = name.clone();
        let thread_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = init_tx.send(Err(RuntimeError::SpawnFailed(e)));
                        return;
                    }
                };

                let own_handle = RunnerHandle {
                    cmd_tx: worker_tx,
                    terminated: Arc::clone(&worker_terminated),
                    thread_id: thread::current().id(),
                };
                let _current = set_current_runner(Arc::new(own_handle) as SharedRunner);
                let _ = init_tx.send(Ok(()));

                rt.block_on(run_loop(worker_name.clone(), cmd_rx, shutdown_rx));

                worker_terminated.store(true, Ordering::SeqCst);
                rt.shutdown_background();
                tracing::debug!(runner = %worker_name, "Task runner thread exiting");
            })?;

        let thread_id = thread_handle.thread().id();

        init_rx
            .recv()
            .map_err(|_| RuntimeError::ThreadPanic)??;

        tracing::debug!(runner = %name, "Task runner is ready");

        Ok(Arc::new(Self {
            name,
            handle: RunnerHandle {
                cmd_tx,
                terminated,
                thread_id,
            },
            shutdown_tx,
            thread_handle: Mutex::new(Some(thread_handle)),
        }))
    }

    /// Name of the runner thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the runner. Queued and delayed tasks that have not started are
    /// dropped; later posts fail with [`RuntimeError::TaskRunnerGone`].
    pub fn shutdown(&self) {
        if self.handle.terminated.swap(true, Ordering::SeqCst) {
            return; // Already terminated
        }
        tracing::debug!(runner = %self.name, "Shutting down task runner");
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if the runner has terminated.
    pub fn is_terminated(&self) -> bool {
        self.handle.terminated.load(Ordering::SeqCst)
    }

    /// Wait for the runner thread to finish.
    ///
    /// Joining from the runner's own thread is a no-op.
    pub fn join(&self) -> RuntimeResult<()> {
        if self.handle.runs_tasks_on_current_thread() {
            return Ok(());
        }
        let handle = self.thread_handle.lock().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| RuntimeError::ThreadPanic)?;
        }
        Ok(())
    }
}

impl TaskRunner for ThreadTaskRunner {
    fn post_task(&self, task: Task) -> RuntimeResult<()> {
        self.handle.post_task(task)
    }

    fn post_delayed_task(&self, delay: Duration, task: Task) -> RuntimeResult<()> {
        self.handle.post_delayed_task(delay, task)
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        self.handle.runs_tasks_on_current_thread()
    }
}

impl Drop for ThreadTaskRunner {
    fn drop(&mut self) {
        self.shutdown();
        if let Err(e) = self.join() {
            tracing::error!(runner = %self.name, error = %e, "Task runner thread did not exit cleanly");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner Loop
// ─────────────────────────────────────────────────────────────────────────────

async fn run_loop(
    name: String,
    mut cmd_rx: mpsc::UnboundedReceiver<RunnerMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            biased;  // Check shutdown first

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!(runner = %name, "Received shutdown signal");
                    break;
                }
            }

            message = cmd_rx.recv() => match message {
                Some(RunnerMessage::Run(task)) => run_task(&name, task),
                Some(RunnerMessage::RunDelayed(delay, task)) => {
                    // Spawned tasks stay on this thread: the runtime is current-thread.
                    let name = name.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        run_task(&name, task);
                    });
                }
                None => {
                    tracing::debug!(runner = %name, "Command channel closed");
                    break;
                }
            },
        }
    }
}

/// Run one task, containing any panic so the runner survives it.
fn run_task(name: &str, task: Task) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(runner = %name, panic = %message, "Task panicked");
    }
}
