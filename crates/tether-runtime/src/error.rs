//! Error types for task runners.

/// Errors that can occur when handing work to a task runner.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The target runner has been shut down; the task was dropped.
    #[error("Task runner has terminated")]
    TaskRunnerGone,

    #[error("No task runner is active on this thread")]
    NoCurrentRunner,

    #[error("Runner thread panicked")]
    ThreadPanic,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// Result alias for runner operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
