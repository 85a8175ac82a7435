//! Foreground/background state of the hosting application.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_runtime::{SharedRunner, TaskRunnerExt, current_runner};

use crate::error::LifecycleError;

/// Whether the hosting application is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Foreground,
    Background,
}

/// Receives lifecycle transitions.
pub trait LifecycleObserver: Send + Sync {
    fn on_foreground(&self);
    fn on_background(&self);
}

/// Adapts a closure taking the new state into an observer.
pub struct CallbackObserver<F> {
    handler: F,
}

impl<F> CallbackObserver<F>
where
    F: Fn(AppState) + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }

    /// Shortcut for the common `Arc<dyn LifecycleObserver>` form.
    pub fn shared(handler: F) -> Arc<dyn LifecycleObserver> {
        Arc::new(Self::new(handler))
    }
}

impl<F> LifecycleObserver for CallbackObserver<F>
where
    F: Fn(AppState) + Send + Sync + 'static,
{
    fn on_foreground(&self) {
        (self.handler)(AppState::Foreground);
    }

    fn on_background(&self) {
        (self.handler)(AppState::Background);
    }
}

/// Registration handle returned by the `add_*observer` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

impl ObserverId {
    fn next() -> Self {
        Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct ObserverEntry {
    id: ObserverId,
    observer: Arc<dyn LifecycleObserver>,
    /// Where notifications are delivered. `None` means on the notifying thread.
    runner: Option<SharedRunner>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Process-wide slot
// ─────────────────────────────────────────────────────────────────────────────

struct GlobalSlot {
    /// Static observers registered before any instance was installed
    pending: Vec<ObserverEntry>,
    instance: Weak<LifecycleState>,
}

static GLOBAL: Mutex<GlobalSlot> = parking_lot::const_mutex(GlobalSlot {
    pending: Vec::new(),
    instance: Weak::new(),
});

// ─────────────────────────────────────────────────────────────────────────────
// LifecycleState
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks the application state and fans transitions out to observers.
///
/// Observers registered with a runner are notified on that runner's thread
/// (inline when the transition already happens there). An observer removed
/// before a queued notification is delivered does not receive it.
pub struct LifecycleState {
    foreground: AtomicBool,
    observers: Mutex<Vec<ObserverEntry>>,
}

impl LifecycleState {
    /// A free-standing instance, not visible through [`installed`](Self::installed).
    pub fn new(initial: AppState) -> Arc<Self> {
        Arc::new(Self {
            foreground: AtomicBool::new(initial == AppState::Foreground),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Create the process-wide instance and hand it every static observer
    /// registered so far.
    ///
    /// The slot is released when the last `Arc` to the instance is dropped.
    pub fn install(initial: AppState) -> Result<Arc<Self>, LifecycleError> {
        let mut global = GLOBAL.lock();
        if global.instance.upgrade().is_some() {
            return Err(LifecycleError::AlreadyInstalled);
        }

        let state = Self::new(initial);
        let flushed = std::mem::take(&mut global.pending);
        tracing::debug!(static_observers = flushed.len(), state = ?initial, "Lifecycle state installed");
        state.observers.lock().extend(flushed);
        global.instance = Arc::downgrade(&state);
        Ok(state)
    }

    /// The process-wide instance, if one is installed.
    pub fn installed() -> Option<Arc<Self>> {
        GLOBAL.lock().instance.upgrade()
    }

    /// Register an observer with the process-wide instance, even before it
    /// exists. Queued registrations are handed over by the next
    /// [`install`](Self::install). Notifications are delivered on the
    /// notifying thread.
    pub fn add_static_observer(observer: Arc<dyn LifecycleObserver>) -> ObserverId {
        let mut global = GLOBAL.lock();
        let entry = ObserverEntry {
            id: ObserverId::next(),
            observer,
            runner: None,
        };
        let id = entry.id;
        match global.instance.upgrade() {
            Some(state) => state.observers.lock().push(entry),
            None => global.pending.push(entry),
        }
        id
    }

    /// Drop a static observer that has not been handed to an instance yet.
    pub fn remove_pending_static_observer(id: ObserverId) -> bool {
        let mut global = GLOBAL.lock();
        let before = global.pending.len();
        global.pending.retain(|entry| entry.id != id);
        global.pending.len() != before
    }

    /// Register `observer`, notified on the calling thread's current runner
    /// (or on the notifying thread when there is none).
    pub fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) -> ObserverId {
        self.add_observer_on(observer, current_runner())
    }

    /// Register `observer`, notified on `runner`.
    pub fn add_observer_on(
        &self,
        observer: Arc<dyn LifecycleObserver>,
        runner: Option<SharedRunner>,
    ) -> ObserverId {
        let id = ObserverId::next();
        self.observers.lock().push(ObserverEntry {
            id,
            observer,
            runner,
        });
        id
    }

    /// Returns whether `id` was registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|entry| entry.id != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::Acquire)
    }

    pub fn state(&self) -> AppState {
        if self.is_foreground() {
            AppState::Foreground
        } else {
            AppState::Background
        }
    }

    /// Switch to foreground. Does nothing when already there.
    pub fn enter_foreground(self: &Arc<Self>) {
        self.transition(AppState::Foreground);
    }

    /// Switch to background. Does nothing when already there.
    pub fn enter_background(self: &Arc<Self>) {
        self.transition(AppState::Background);
    }

    fn transition(self: &Arc<Self>, to: AppState) {
        let foreground = to == AppState::Foreground;
        if self
            .foreground
            .compare_exchange(!foreground, foreground, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::info!(state = ?to, "Application lifecycle changed");
        self.notify(to);
    }

    fn notify(self: &Arc<Self>, to: AppState) {
        let snapshot: Vec<_> = self
            .observers
            .lock()
            .iter()
            .map(|entry| (entry.id, Arc::clone(&entry.observer), entry.runner.clone()))
            .collect();

        for (id, observer, runner) in snapshot {
            match runner {
                Some(runner) if !runner.runs_tasks_on_current_thread() => {
                    let weak = Arc::downgrade(self);
                    let posted = runner.post(move || {
                        if weak.upgrade().is_some_and(|state| state.is_registered(id)) {
                            deliver(observer.as_ref(), to);
                        }
                    });
                    if posted.is_err() {
                        tracing::trace!(?id, "Observer runner gone; lifecycle notification dropped");
                    }
                }
                _ => {
                    // An earlier observer may have removed this one.
                    if self.is_registered(id) {
                        deliver(observer.as_ref(), to);
                    }
                }
            }
        }
    }

    fn is_registered(&self, id: ObserverId) -> bool {
        self.observers.lock().iter().any(|entry| entry.id == id)
    }
}

fn deliver(observer: &dyn LifecycleObserver, to: AppState) {
    match to {
        AppState::Foreground => observer.on_foreground(),
        AppState::Background => observer.on_background(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
