//! Tether runtime primitives
//!
//! The thread-hopping half of tether. Script interpreters embedded in a host
//! run on one thread and cannot be entered concurrently, while the native work
//! they trigger (I/O, timers, OS notifications) completes on arbitrary
//! threads. This crate provides the pieces that carry those completions back:
//!
//! - [`TaskRunner`]: the opaque "run this later, over there" abstraction
//! - [`ThreadTaskRunner`]: a runner backed by a dedicated thread
//! - [`ManualTaskRunner`]: a runner drained explicitly by the host loop
//! - [`CallerThreadForwarder`]: a callback that always runs on its home thread
//! - [`OwnerGuardedRunner`]: a proxy that turns callbacks into no-ops once
//!   their owner is gone
//! - [`ThreadChecker`]: debug-build thread affinity assertions

mod error;
mod forwarder;
mod guarded;
mod manual;
mod runner;
mod thread_checker;
mod thread_runner;

pub use error::{RuntimeError, RuntimeResult};
pub use forwarder::CallerThreadForwarder;
pub use guarded::OwnerGuardedRunner;
pub use manual::ManualTaskRunner;
pub use runner::{
    CurrentRunnerGuard, SharedRunner, Task, TaskRunner, TaskRunnerExt, current_runner,
    set_current_runner,
};
pub use thread_checker::ThreadChecker;
pub use thread_runner::ThreadTaskRunner;
