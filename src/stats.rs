//! Global object statistics.
//!
//! With the `stats` feature the crate keeps process-wide counters of live
//! objects, payload bytes, containers, outstanding references and held
//! locks. Without it the recording hooks are empty and [`snapshot`]
//! reports zeros. Counters are relaxed atomics: a snapshot taken while
//! other threads allocate is only approximately consistent.

/// Point-in-time copy of the global counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Objects allocated and not yet destroyed.
    pub objects: isize,
    /// Payload bytes of those objects.
    pub memory: isize,
    /// Containers allocated and not yet destroyed.
    pub containers: isize,
    /// Sum of all reference counts.
    pub refs: isize,
    /// Object locks currently held.
    pub locked: isize,
}

#[cfg(feature = "stats")]
mod counters {
    use core::sync::atomic::AtomicIsize;

    pub(super) static OBJECTS: AtomicIsize = AtomicIsize::new(0);
    pub(super) static MEMORY: AtomicIsize = AtomicIsize::new(0);
    pub(super) static CONTAINERS: AtomicIsize = AtomicIsize::new(0);
    pub(super) static REFS: AtomicIsize = AtomicIsize::new(0);
    pub(super) static LOCKED: AtomicIsize = AtomicIsize::new(0);
}

#[cfg(feature = "stats")]
mod imp {
    use super::counters::*;
    use super::Stats;
    use core::sync::atomic::Ordering::Relaxed;

    pub fn snapshot() -> Stats {
        Stats {
            objects: OBJECTS.load(Relaxed),
            memory: MEMORY.load(Relaxed),
            containers: CONTAINERS.load(Relaxed),
            refs: REFS.load(Relaxed),
            locked: LOCKED.load(Relaxed),
        }
    }

    #[inline]
    pub fn record_alloc(size: usize) {
        OBJECTS.fetch_add(1, Relaxed);
        MEMORY.fetch_add(size as isize, Relaxed);
        REFS.fetch_add(1, Relaxed);
    }

    #[inline]
    pub fn record_destroy(size: usize) {
        OBJECTS.fetch_sub(1, Relaxed);
        MEMORY.fetch_sub(size as isize, Relaxed);
    }

    #[inline]
    pub fn record_ref(delta: isize) {
        REFS.fetch_add(delta, Relaxed);
    }

    #[inline]
    pub fn record_lock(delta: isize) {
        LOCKED.fetch_add(delta, Relaxed);
    }

    #[inline]
    pub fn record_container(delta: isize) {
        CONTAINERS.fetch_add(delta, Relaxed);
    }
}

#[cfg(not(feature = "stats"))]
mod imp {
    use super::Stats;

    pub fn snapshot() -> Stats {
        Stats::default()
    }

    #[inline(always)]
    pub fn record_alloc(_size: usize) {}

    #[inline(always)]
    pub fn record_destroy(_size: usize) {}

    #[inline(always)]
    pub fn record_ref(_delta: isize) {}

    #[inline(always)]
    pub fn record_lock(_delta: isize) {}

    #[inline(always)]
    pub fn record_container(_delta: isize) {}
}

/// Read the global counters.
pub fn snapshot() -> Stats {
    imp::snapshot()
}

pub(crate) use imp::{record_alloc, record_container, record_destroy, record_lock, record_ref};
