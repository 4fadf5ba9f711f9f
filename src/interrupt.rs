//! Operator interruption flag shared between the signal handler and the
//! blocking testbed calls.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    raised: AtomicBool,
    shield_depth: AtomicUsize,
}

/// Cloneable handle to the run-wide interruption flag.
///
/// Once raised the flag never clears. Code running inside [`Interrupt::shielded`]
/// observes the flag as clear, which lets teardown commands run to completion
/// after an abort was requested.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an abort of the whole run.
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested, regardless of shielding.
    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Whether a blocking call should stop now.
    pub fn should_stop(&self) -> bool {
        self.is_raised() && self.inner.shield_depth.load(Ordering::SeqCst) == 0
    }

    /// Run `f` with interruption masked.
    pub fn shielded<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = ShieldGuard::enter(&self.inner);
        f()
    }
}

struct ShieldGuard<'a> {
    inner: &'a Inner,
}

impl<'a> ShieldGuard<'a> {
    fn enter(inner: &'a Inner) -> Self {
        inner.shield_depth.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for ShieldGuard<'_> {
    fn drop(&mut self) {
        self.inner.shield_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_is_visible_to_clones() {
        let interrupt = Interrupt::new();
        let handle = interrupt.clone();
        assert!(!handle.should_stop());
        interrupt.raise();
        assert!(handle.is_raised());
        assert!(handle.should_stop());
    }

    #[test]
    fn test_shield_masks_until_scope_ends() {
        let interrupt = Interrupt::new();
        interrupt.raise();
        let inside = interrupt.shielded(|| interrupt.should_stop());
        assert!(!inside);
        assert!(interrupt.should_stop());
    }
}
