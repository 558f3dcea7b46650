//! Runners for work the client wants done "later".
//!
//! The client never decides when deferred work runs. It hands a closure to
//! the injected [`DeferredRunner`], which may run it after the current
//! request, on a background pool, or right away when nothing can be
//! deferred.

use tokio::runtime::Handle;

/// A zero-argument task handed to a [`DeferredRunner`].
pub type DeferredTask = Box<dyn FnOnce() + Send + 'static>;

/// Accepts tasks and runs them at some later point.
pub trait DeferredRunner: Send + Sync {
    fn defer(&self, task: DeferredTask);
}

/// Runs every task inline, for contexts where nothing can be deferred.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateRunner;

impl DeferredRunner for ImmediateRunner {
    fn defer(&self, task: DeferredTask) {
        task();
    }
}

/// Runs tasks on a tokio runtime's blocking pool.
#[derive(Clone, Debug)]
pub struct TokioRunner {
    handle: Handle,
}

impl TokioRunner {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// A runner bound to the runtime of the calling task, if there is one.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl DeferredRunner for TokioRunner {
    fn defer(&self, task: DeferredTask) {
        // Tasks may log or touch locks; keep them off the async workers.
        self.handle.spawn_blocking(task);
    }
}
