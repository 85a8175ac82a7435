//! Application lifecycle tracking and lifecycle-aware timers.

mod state;
mod timer;

pub use state::{AppState, CallbackObserver, LifecycleObserver, LifecycleState, ObserverId};
pub use timer::{LifecycleTimer, TimerOptions};
