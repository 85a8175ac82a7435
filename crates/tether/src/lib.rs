//! Tether
//!
//! Coordination layer between a single-threaded script interpreter and the
//! native work it triggers. Built on the runner primitives of
//! [`tether_runtime`] (re-exported here), it adds:
//!
//! - [`KeyedSerialExecutor`]: per-key FIFO of asynchronous tasks, advanced by
//!   [`Barrier`] release
//! - [`WeakIdentityCache`]: one live instance per key, with a small strong ring
//! - [`LifecycleState`] and [`LifecycleTimer`]: foreground/background tracking
//!   and timers that respect it
//! - [`TetherContext`]: the process-wide owner of the interpreter thread and
//!   lifecycle, configured from [`TetherConfig`]

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod lifecycle;

pub use cache::{CacheStats, SharedRef, WeakIdentityCache, WeakIdentityCacheBuilder};
pub use config::{CacheConfig, ExecutorConfig, LifecycleConfig, RunnerConfig, TetherConfig};
pub use context::TetherContext;
pub use error::{ConfigError, ContextError, LifecycleError};
pub use executor::{Barrier, ExecutorKey, KeyedSerialExecutor};
pub use lifecycle::{
    AppState, CallbackObserver, LifecycleObserver, LifecycleState, LifecycleTimer, ObserverId,
    TimerOptions,
};

pub use tether_runtime::{
    CallerThreadForwarder, ManualTaskRunner, OwnerGuardedRunner, RuntimeError, SharedRunner,
    Task, TaskRunner, TaskRunnerExt, ThreadChecker, ThreadTaskRunner, current_runner,
    set_current_runner,
};
