//! Gradient tracking mode
//!
//! Whether the current step will be followed by a backward pass. The flag is
//! thread-scoped, like autograd grad mode in other frameworks, and enabled by
//! default. The orchestrator only reads it.

use std::cell::Cell;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Is gradient tracking enabled on the current thread?
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

/// Set gradient tracking on the current thread, returning the previous value.
pub fn set_grad_enabled(enabled: bool) -> bool {
    GRAD_ENABLED.with(|flag| flag.replace(enabled))
}

/// Sets gradient tracking to a given mode until dropped.
///
/// Used to carry the caller's mode onto worker threads running replicas.
#[must_use = "gradient tracking is restored as soon as the guard is dropped"]
pub struct GradModeGuard {
    prev: bool,
}

impl GradModeGuard {
    pub fn new(enabled: bool) -> Self {
        Self {
            prev: set_grad_enabled(enabled),
        }
    }
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}

/// Disables gradient tracking until dropped, then restores the previous mode.
///
/// ```ignore
/// let _guard = NoGradGuard::new();
/// let out = ddp.val_step(payload)?; // reducer is not primed
/// ```
#[must_use = "gradient tracking is restored as soon as the guard is dropped"]
pub struct NoGradGuard {
    prev: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        Self {
            prev: set_grad_enabled(false),
        }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}
