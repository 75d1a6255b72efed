//! Reference-counted objects: header, counted and uncounted handles.
//!
//! Every object is one `Arc` allocation holding a header (magic number,
//! atomic reference count, optional recursive lock, destructor hook,
//! payload size) followed by the payload. Two handle types share it:
//!
//! - [`Ao2<T>`] is a counted reference. Cloning adds one reference,
//!   dropping releases it, and the payload is reachable through `Deref`.
//! - [`ObjPtr<T>`] is an uncounted handle, the equivalent of a bare
//!   payload pointer. It is how references are adjusted by arbitrary
//!   deltas and how stale handles are detected.
//!
//! The logical reference count is independent of the `Arc` strong count.
//! When the logical count drops to zero the destructor hook runs exactly
//! once and the magic number is cleared; from then on every operation
//! through any remaining handle fails with [`Ao2Error::InvalidObject`].
//! The `Arc` only keeps the memory valid for such stale handles, so the
//! magic check never reads freed memory. The payload value itself is
//! dropped once the last handle of either kind is gone.

use crate::error::{Ao2Error, Result};
use crate::stats;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::sync::atomic::{AtomicIsize, AtomicU32, AtomicUsize, Ordering};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::Arc;

/// Stamped into every live header, cleared on destruction.
pub(crate) const AO2_MAGIC: u32 = 0xa570_b123;

/// Hook run once, with the payload still valid, when the count reaches zero.
pub type Destructor<T> = fn(&T);

/// Whether an object carries its own recursive lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockKind {
    #[default]
    Recursive,
    None,
}

/// Allocation options for [`Ao2::alloc`].
pub struct ObjectOptions<T> {
    pub destructor: Option<Destructor<T>>,
    pub lock: LockKind,
}

impl<T> ObjectOptions<T> {
    pub fn new() -> Self {
        Self {
            destructor: None,
            lock: LockKind::Recursive,
        }
    }

    pub fn destructor(mut self, destructor: Destructor<T>) -> Self {
        self.destructor = Some(destructor);
        self
    }

    pub fn lock(mut self, lock: LockKind) -> Self {
        self.lock = lock;
        self
    }
}

impl<T> Default for ObjectOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ObjectOptions<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ObjectOptions<T> {}

struct Inner<T> {
    magic: AtomicU32,
    refcount: AtomicIsize,
    size: AtomicUsize,
    lock: Option<ReentrantMutex<()>>,
    destructor: Option<Destructor<T>>,
    payload: T,
}

impl<T> Inner<T> {
    fn new(payload: T, options: ObjectOptions<T>) -> Self {
        let size = core::mem::size_of::<T>().max(core::mem::size_of::<usize>());
        let lock = match options.lock {
            LockKind::Recursive => Some(ReentrantMutex::new(())),
            LockKind::None => None,
        };
        stats::record_alloc(size);
        Self {
            magic: AtomicU32::new(AO2_MAGIC),
            refcount: AtomicIsize::new(1),
            size: AtomicUsize::new(size),
            lock,
            destructor: options.destructor,
            payload,
        }
    }

    fn check_magic(&self) -> Result<()> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic == AO2_MAGIC {
            Ok(())
        } else {
            tracing::error!("bad magic number {:#x} for ao2 object {:p}", magic, self);
            Err(Ao2Error::InvalidObject)
        }
    }

    /// Add `delta` to the count and return the previous count.
    ///
    /// The count is only ever moved from a positive value, so the
    /// transition to zero (and the destruction it triggers) happens once.
    fn add_ref(&self, delta: isize) -> Result<isize> {
        self.check_magic()?;
        let mut current = self.refcount.load(Ordering::Acquire);
        let next = loop {
            if current <= 0 {
                tracing::error!(
                    "ao2 object {:p} used with refcount {}",
                    self,
                    current
                );
                return Err(Ao2Error::InvalidObject);
            }
            if delta == 0 {
                return Ok(current);
            }
            let Some(next) = current.checked_add(delta) else {
                // Same policy as Rc/Arc: overflow aborts.
                std::process::abort();
            };
            match self.refcount.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break next,
                Err(actual) => current = actual,
            }
        };
        stats::record_ref(delta);
        if next > 0 {
            return Ok(current);
        }
        if next < 0 {
            tracing::error!("invalid refcount {} on ao2 object {:p}", next, self);
        }
        self.destroy();
        Ok(current)
    }

    fn destroy(&self) {
        if let Some(destructor) = self.destructor {
            let _lock = self.lock.as_ref().map(|m| m.lock());
            destructor(&self.payload);
        }
        self.magic.store(0, Ordering::Release);
        let size = self.size.swap(0, Ordering::Relaxed);
        stats::record_destroy(size);
        tracing::trace!("destroyed ao2 object {:p} ({} bytes)", self, size);
    }

    fn lock(&self) -> Result<ObjectGuard<'_>> {
        let mutex = self.lock_handle()?;
        let guard = mutex.lock();
        stats::record_lock(1);
        Ok(ObjectGuard {
            _guard: guard,
            magic: &self.magic,
        })
    }

    fn try_lock(&self) -> Result<Option<ObjectGuard<'_>>> {
        let mutex = self.lock_handle()?;
        Ok(mutex.try_lock().map(|guard| {
            stats::record_lock(1);
            ObjectGuard {
                _guard: guard,
                magic: &self.magic,
            }
        }))
    }

    fn lock_handle(&self) -> Result<&ReentrantMutex<()>> {
        self.add_ref(0)?;
        self.lock.as_ref().ok_or_else(|| {
            tracing::warn!("lock requested on lockless ao2 object {:p}", self);
            Ao2Error::NoLock
        })
    }
}

/// Held lock on an object. Unlocks on drop.
pub struct ObjectGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
    magic: &'a AtomicU32,
}

impl<'a> ObjectGuard<'a> {
    /// Unlock explicitly. The lock is released either way; the result
    /// reports whether the object was still valid at that point.
    pub fn unlock(self) -> Result<()> {
        let magic = self.magic.load(Ordering::Acquire);
        drop(self);
        if magic == AO2_MAGIC {
            Ok(())
        } else {
            tracing::error!("unlock of destroyed ao2 object (magic {:#x})", magic);
            Err(Ao2Error::InvalidObject)
        }
    }
}

impl<'a> Drop for ObjectGuard<'a> {
    fn drop(&mut self) {
        stats::record_lock(-1);
    }
}

/// A counted reference to a managed object.
///
/// `Clone` adds a reference, `Drop` releases it. The destructor hook runs
/// when the last reference is released.
pub struct Ao2<T> {
    inner: ManuallyDrop<Arc<Inner<T>>>,
}

impl<T> Ao2<T> {
    /// Allocate with a recursive lock and no destructor hook.
    pub fn new(value: T) -> Self {
        Self::alloc(value, ObjectOptions::new())
    }

    pub fn with_destructor(value: T, destructor: Destructor<T>) -> Self {
        Self::alloc(value, ObjectOptions::new().destructor(destructor))
    }

    /// Allocate an object with a count of one.
    pub fn alloc(value: T, options: ObjectOptions<T>) -> Self {
        Self::from_arc(Arc::new(Inner::new(value, options)))
    }

    fn from_arc(inner: Arc<Inner<T>>) -> Self {
        Self {
            inner: ManuallyDrop::new(inner),
        }
    }

    /// Current reference count. Zero or less means the object was
    /// destroyed through an uncounted handle.
    pub fn ref_count(&self) -> isize {
        self.inner.refcount.load(Ordering::Acquire)
    }

    pub fn payload_size(&self) -> usize {
        self.inner.size.load(Ordering::Relaxed)
    }

    pub fn lock(&self) -> Result<ObjectGuard<'_>> {
        self.inner.lock()
    }

    /// `Ok(None)` when another thread holds the lock.
    pub fn try_lock(&self) -> Result<Option<ObjectGuard<'_>>> {
        self.inner.try_lock()
    }

    /// Uncounted handle to the same object.
    pub fn as_ptr(&self) -> ObjPtr<T> {
        ObjPtr {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Give up this handle without releasing its reference. The reference
    /// now belongs to whoever holds the returned pointer; see [`ObjPtr::adopt`].
    pub fn into_raw(self) -> ObjPtr<T> {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never used or dropped again.
        let inner = unsafe { ManuallyDrop::take(&mut this.inner) };
        ObjPtr { inner }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.inner.add_ref(0).map(|_| ())
    }
}

impl<T> Clone for Ao2<T> {
    fn clone(&self) -> Self {
        // Only fails if the object was released behind this handle's back;
        // that is logged, and the clone stays just as stale.
        let _ = self.inner.add_ref(1);
        Self::from_arc(Arc::clone(&self.inner))
    }
}

impl<T> Drop for Ao2<T> {
    fn drop(&mut self) {
        let _ = self.inner.add_ref(-1);
        // SAFETY: `inner` is not touched after this point.
        unsafe { ManuallyDrop::drop(&mut self.inner) }
    }
}

impl<T> Deref for Ao2<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.payload
    }
}

impl<T: fmt::Debug> fmt::Debug for Ao2<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ao2")
            .field("refcount", &self.ref_count())
            .field("payload", &self.inner.payload)
            .finish()
    }
}

/// An uncounted handle to a managed object.
///
/// Cloning an `ObjPtr` does not change the reference count. Every
/// operation validates the object first and fails with
/// [`Ao2Error::InvalidObject`] once it has been destroyed.
pub struct ObjPtr<T> {
    inner: Arc<Inner<T>>,
}

impl<T> ObjPtr<T> {
    /// Add `delta` (which may be zero or negative) to the reference count
    /// and return the count before the change. Driving the count to zero
    /// destroys the object.
    pub fn add_ref(&self, delta: isize) -> Result<isize> {
        self.inner.add_ref(delta)
    }

    pub fn ref_count(&self) -> Result<isize> {
        self.inner.add_ref(0)
    }

    pub fn is_alive(&self) -> bool {
        self.inner.magic.load(Ordering::Acquire) == AO2_MAGIC
            && self.inner.refcount.load(Ordering::Acquire) > 0
    }

    /// Take a new reference and return it as a counted handle.
    pub fn upgrade(&self) -> Result<Ao2<T>> {
        self.inner.add_ref(1)?;
        Ok(Ao2::from_arc(Arc::clone(&self.inner)))
    }

    /// Turn a reference previously given up with [`Ao2::into_raw`] back
    /// into a counted handle, without changing the count.
    pub fn adopt(self) -> Result<Ao2<T>> {
        self.inner.add_ref(0)?;
        Ok(Ao2::from_arc(self.inner))
    }

    pub fn lock(&self) -> Result<ObjectGuard<'_>> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Result<Option<ObjectGuard<'_>>> {
        self.inner.try_lock()
    }

    /// Borrow the payload of a live object.
    pub fn payload(&self) -> Result<&T> {
        self.inner.add_ref(0)?;
        Ok(&self.inner.payload)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl<T> Clone for ObjPtr<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ObjPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjPtr")
            .field("addr", &Arc::as_ptr(&self.inner))
            .field("alive", &self.is_alive())
            .finish()
    }
}
