//! A delay timer that follows the application lifecycle.
//!
//! While the app is in the background the timer does not run. Entering the
//! background either just stops it or, with `fire_once_on_background`, stops
//! it and runs the callback one last time right away. Coming back to the
//! foreground restarts the full delay.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tether_runtime::{SharedRunner, TaskRunnerExt};

use super::state::{LifecycleObserver, LifecycleState, ObserverId};

type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// How a [`LifecycleTimer`] behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerOptions {
    /// Re-arm after every firing
    pub repeating: bool,
    /// Fire once, immediately, when the app goes to the background while the
    /// timer is running
    pub fire_once_on_background: bool,
}

impl Default for TimerOptions {
    fn default() -> Self {
        Self {
            repeating: true,
            fire_once_on_background: true,
        }
    }
}

struct TimerState {
    delay: Duration,
    callback: Option<TimerCallback>,
    running: bool,
    /// Bumped on every (re)arm and stop; stale firings compare unequal.
    generation: u64,
}

struct TimerCore {
    runner: SharedRunner,
    options: TimerOptions,
    state: Mutex<TimerState>,
}

impl TimerCore {
    fn schedule(self: &Arc<Self>, state: &mut TimerState) {
        state.generation += 1;
        state.running = true;

        let generation = state.generation;
        let weak = Arc::downgrade(self);
        let armed = self.runner.post_delayed(state.delay, move || {
            if let Some(core) = weak.upgrade() {
                core.fire(generation);
            }
        });
        if armed.is_err() {
            state.running = false;
            tracing::warn!(
                delay_ms = u64::try_from(state.delay.as_millis()).unwrap_or(u64::MAX),
                "Timer runner gone; timer not armed"
            );
        }
    }

    fn fire(self: &Arc<Self>, generation: u64) {
        let callback = {
            let mut state = self.state.lock();
            if !state.running || state.generation != generation {
                return;
            }
            if self.options.repeating {
                self.schedule(&mut state);
            } else {
                state.running = false;
            }
            state.callback.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    fn start(self: &Arc<Self>, delay: Duration, callback: TimerCallback) {
        let mut state = self.state.lock();
        state.delay = delay;
        state.callback = Some(callback);
        self.schedule(&mut state);
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.generation += 1;
    }

    fn reset(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.callback.is_some() {
            self.schedule(&mut state);
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.generation += 1;
        state.callback = None;
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn enter_foreground(self: &Arc<Self>) {
        self.reset();
    }

    fn enter_background(&self) {
        let callback = {
            let mut state = self.state.lock();
            let was_running = state.running;
            state.running = false;
            state.generation += 1;
            if was_running && self.options.fire_once_on_background {
                state.callback.clone()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            tracing::trace!("Firing timer once on entering background");
            callback();
        }
    }
}

/// Registered with the lifecycle on behalf of a timer. Holds the timer weakly
/// so a queued notification never keeps it alive.
struct TimerObserver {
    core: Weak<TimerCore>,
}

impl LifecycleObserver for TimerObserver {
    fn on_foreground(&self) {
        if let Some(core) = self.core.upgrade() {
            core.enter_foreground();
        }
    }

    fn on_background(&self) {
        if let Some(core) = self.core.upgrade() {
            core.enter_background();
        }
    }
}

/// Repeating or one-shot timer driven by a runner and paused by the
/// application lifecycle.
///
/// Firings happen on the runner. Lifecycle notifications are delivered there
/// too. Dropping the timer stops it and deregisters it from the lifecycle.
pub struct LifecycleTimer {
    core: Arc<TimerCore>,
    lifecycle: Arc<LifecycleState>,
    observer: ObserverId,
}

impl LifecycleTimer {
    /// Repeating timer that fires once when the app is backgrounded.
    pub fn new(runner: SharedRunner, lifecycle: Arc<LifecycleState>) -> Self {
        Self::with_options(runner, lifecycle, TimerOptions::default())
    }

    pub fn one_shot(runner: SharedRunner, lifecycle: Arc<LifecycleState>) -> Self {
        Self::with_options(
            runner,
            lifecycle,
            TimerOptions {
                repeating: false,
                ..TimerOptions::default()
            },
        )
    }

    pub fn with_options(
        runner: SharedRunner,
        lifecycle: Arc<LifecycleState>,
        options: TimerOptions,
    ) -> Self {
        let core = Arc::new(TimerCore {
            runner: Arc::clone(&runner),
            options,
            state: Mutex::new(TimerState {
                delay: Duration::ZERO,
                callback: None,
                running: false,
                generation: 0,
            }),
        });
        let observer = lifecycle.add_observer_on(
            Arc::new(TimerObserver {
                core: Arc::downgrade(&core),
            }),
            Some(runner),
        );
        Self {
            core,
            lifecycle,
            observer,
        }
    }

    /// Arm the timer. When the app is already in the background the
    /// background policy applies straight away.
    pub fn start<F>(&self, delay: Duration, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.start(delay, Arc::new(callback));
        if self.lifecycle.is_foreground() {
            return;
        }
        if self.core.runner.runs_tasks_on_current_thread() {
            self.core.enter_background();
            return;
        }

        // Apply the policy on the runner so a fire-once callback runs there.
        let core = Arc::downgrade(&self.core);
        let lifecycle = Arc::downgrade(&self.lifecycle);
        let posted = self.core.runner.post(move || {
            let (Some(core), Some(lifecycle)) = (core.upgrade(), lifecycle.upgrade()) else {
                return;
            };
            if !lifecycle.is_foreground() {
                core.enter_background();
            }
        });
        if posted.is_err() {
            self.core.stop();
            tracing::warn!("Timer runner gone; background policy not applied");
        }
    }

    /// Stop without forgetting the callback; [`reset`](Self::reset) re-arms.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Restart the full delay, if a callback has been set.
    pub fn reset(&self) {
        self.core.reset();
    }

    /// Stop and forget the callback.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn options(&self) -> TimerOptions {
        self.core.options
    }
}

impl Drop for LifecycleTimer {
    fn drop(&mut self) {
        self.lifecycle.remove_observer(self.observer);
        self.core.stop();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
