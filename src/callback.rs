//! Callback registration handles.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide callback ID counter.
static CALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Callback handle for unregistering callbacks.
///
/// Dropping the handle unregisters the callback.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle with a fresh ID.
    pub(crate) fn new(unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id: CALLBACK_COUNTER.fetch_add(1, Ordering::SeqCst),
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}
