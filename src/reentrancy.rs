//! Reentrancy guard for container structural sections.
//!
//! A container walks its bucket table while calling user code (match and
//! compare functions). The table is protected by the container's
//! recursive lock, so the thread that owns the lock can legitimately
//! re-enter the container from such a callback; the guard turns that
//! nested entry into a panic instead of a second `&mut` to the table.
//!
//! Only the lock holder ever enters, so the depth needs no ordering
//! stronger than the lock already provides.

use core::sync::atomic::{AtomicBool, Ordering};

/// Per-instance reentrancy tracker. Embed it next to the state it guards
/// and open each structural section with `let _g = self.reentrancy.enter();`.
#[derive(Debug, Default)]
pub struct Reentrancy {
    entered: AtomicBool,
}

impl Reentrancy {
    /// Create a new tracker. Const so it can be a field default.
    pub const fn new() -> Self {
        Self {
            entered: AtomicBool::new(false),
        }
    }

    /// Enter a guarded section. Panics if the section is already entered.
    #[inline]
    pub fn enter(&self) -> ReentrancyGuard<'_> {
        let was_entered = self.entered.swap(true, Ordering::Relaxed);
        assert!(
            !was_entered,
            "reentrancy detected: nested entry into container structure"
        );
        ReentrancyGuard { owner: self }
    }
}

/// RAII guard returned by [`Reentrancy::enter`].
pub struct ReentrancyGuard<'a> {
    owner: &'a Reentrancy,
}

impl<'a> Drop for ReentrancyGuard<'a> {
    fn drop(&mut self) {
        self.owner.entered.store(false, Ordering::Relaxed);
    }
}
