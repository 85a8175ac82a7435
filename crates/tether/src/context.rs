//! Process-wide context.
//!
//! [`TetherContext`] owns what would otherwise be global: the interpreter
//! runner thread and the installed [`LifecycleState`]. Build one at startup,
//! pass it (or the handles it gives out) to whatever needs them, and shut it
//! down explicitly.

use std::fmt;
use std::sync::Arc;

use tether_runtime::{OwnerGuardedRunner, SharedRunner, ThreadTaskRunner};

use crate::cache::{SharedRef, WeakIdentityCacheBuilder};
use crate::config::TetherConfig;
use crate::error::ContextError;
use crate::executor::{ExecutorKey, KeyedSerialExecutor};
use crate::lifecycle::{LifecycleState, LifecycleTimer, TimerOptions};

pub struct TetherContext {
    config: TetherConfig,
    runner: Arc<ThreadTaskRunner>,
    lifecycle: Arc<LifecycleState>,
}

impl TetherContext {
    /// Validate `config`, install the process lifecycle state and spawn the
    /// interpreter thread.
    ///
    /// Fails with [`LifecycleError::AlreadyInstalled`](crate::LifecycleError::AlreadyInstalled)
    /// while another context (or anything still holding its lifecycle) is alive.
    pub fn start(config: TetherConfig) -> Result<Self, ContextError> {
        config.validate()?;
        let lifecycle = LifecycleState::install(config.lifecycle.initial_state())?;
        let runner = ThreadTaskRunner::spawn(config.runner.thread_name.clone())?;

        tracing::info!(
            thread = %runner.name(),
            state = ?lifecycle.state(),
            "Tether context started"
        );
        Ok(Self {
            config,
            runner,
            lifecycle,
        })
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    /// The interpreter thread's runner.
    pub fn runner(&self) -> SharedRunner {
        Arc::clone(&self.runner) as SharedRunner
    }

    pub fn thread_runner(&self) -> &Arc<ThreadTaskRunner> {
        &self.runner
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleState> {
        &self.lifecycle
    }

    /// Guarded proxy over the interpreter runner, owned by the calling thread.
    pub fn guarded_runner(&self) -> OwnerGuardedRunner {
        OwnerGuardedRunner::new(self.runner())
    }

    /// Keyed executor on the interpreter runner. Use it from tasks running
    /// there.
    pub fn keyed_executor<K: ExecutorKey>(&self) -> KeyedSerialExecutor<K> {
        KeyedSerialExecutor::with_config(self.runner(), &self.config.executor)
    }

    /// Repeating timer on the interpreter runner, following this context's
    /// lifecycle.
    pub fn lifecycle_timer(&self) -> LifecycleTimer {
        LifecycleTimer::with_options(
            self.runner(),
            Arc::clone(&self.lifecycle),
            TimerOptions {
                repeating: true,
                fire_once_on_background: self.config.lifecycle.fire_once_on_background,
            },
        )
    }

    /// Cache builder preloaded with the configured tuning.
    pub fn cache_builder<K, R>(&self) -> WeakIdentityCacheBuilder<K, R>
    where
        K: Ord + Clone + fmt::Debug,
        R: SharedRef,
    {
        WeakIdentityCacheBuilder::new().config(self.config.cache.clone())
    }

    /// Stop and join the interpreter thread, then let go of the lifecycle.
    ///
    /// The lifecycle slot frees up once every other holder (timers, for
    /// instance) is gone as well.
    pub fn shutdown(self) -> Result<(), ContextError> {
        self.runner.shutdown();
        self.runner.join()?;
        tracing::info!(thread = %self.runner.name(), "Tether context stopped");
        Ok(())
    }
}

impl fmt::Debug for TetherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TetherContext")
            .field("thread", &self.runner.name())
            .field("state", &self.lifecycle.state())
            .finish()
    }
}
