//! Debug-build thread affinity checks.

use std::thread::{self, ThreadId};

use parking_lot::Mutex;

/// Remembers the thread an object belongs to.
///
/// Objects that must only be touched from one thread hold a checker and call
/// [`ThreadChecker::assert_on_owner`] at the top of their public methods. The
/// assertion compiles away in release builds.
#[derive(Debug)]
pub struct ThreadChecker {
    owner: Mutex<Option<ThreadId>>,
}

impl Default for ThreadChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadChecker {
    /// Bind to the calling thread.
    pub fn new() -> Self {
        Self {
            owner: Mutex::new(Some(thread::current().id())),
        }
    }

    /// Forget the owner; the next thread that checks becomes the owner.
    ///
    /// Use this when an object is built on one thread and handed to another.
    pub fn detach(&self) {
        *self.owner.lock() = None;
    }

    /// Whether the calling thread owns the object, binding it if detached.
    pub fn called_on_valid_thread(&self) -> bool {
        let current = thread::current().id();
        let mut owner = self.owner.lock();
        match *owner {
            Some(id) => id == current,
            None => {
                *owner = Some(current);
                true
            }
        }
    }

    /// Panic in debug builds if called off the owning thread.
    #[track_caller]
    pub fn assert_on_owner(&self, what: &str) {
        debug_assert!(
            self.called_on_valid_thread(),
            "{what} used off its owning thread"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
