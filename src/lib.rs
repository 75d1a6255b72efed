//! ao2: reference-counted, lock-bearing objects and versioned hash
//! containers with callback search and mutation-tolerant iteration.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: shared, thread-safe objects whose lifetime is an explicit
//!   reference count, plus containers that co-own their members and can
//!   be searched and iterated while other threads link and unlink.
//! - Layers:
//!   - `list`: singly-linked lists (head and tail) threaded through a
//!     slotmap arena; insert head/tail/after, cursor removal during
//!     traversal, splice.
//!   - `object`: `Ao2<T>` counted handle and `ObjPtr<T>` uncounted handle
//!     over one header + payload allocation (magic, atomic refcount,
//!     optional recursive lock, destructor hook).
//!   - `container`: `Container<T>`, itself an `Ao2` object, holding a bucket
//!     table of versioned entries over one arena; `callback` is the single
//!     search primitive and `find`/`unlink` are special cases of it.
//!   - `iter`: `Iter<'_, T>`, which resumes by (bucket, version) rather
//!     than by pointer. `GuardIter` borrows a held container lock and is
//!     therefore not `Send`.
//!
//! Constraints
//! - Objects and containers are `Send + Sync` when the payload is.
//! - The logical reference count is independent of the `Arc` strong count;
//!   the `Arc` only keeps memory valid for stale handles.
//! - Every operation validates the magic number first. A stale or
//!   destroyed object yields `Ao2Error::InvalidObject`, never a crash.
//! - Container structure is only mutated while the container's lock is
//!   held. Element count and version are atomics readable without it.
//!
//! Reentrancy policy
//! - The container lock is recursive, so a match, hash or compare
//!   function running on the lock-holding thread could re-enter the
//!   container. Each structural section is wrapped in a reentrancy guard
//!   that turns such nesting into a panic. Hash functions run before the
//!   section is entered.
//! - Members removed by a search are released after the section is left
//!   and the lock dropped; their destructors may use the container.
//!
//! Overflow semantics
//! - A reference count overflowing `isize` aborts the process. A count
//!   driven below zero is logged as an underflow and the object is
//!   destroyed exactly once.
//!
//! Notes and non-goals
//! - No specific hash family; `Container::keyed` uses hashbrown's default
//!   builder and keeps it, so `KeyedContainer::find_key` hashes a bare key
//!   the same way the container hashes members.
//! - Buckets may degenerate; lookups are O(bucket length).
//! - Allocation failure aborts, as with any Rust allocation.
//! - Global counters (`stats`) are compiled in only with the `stats`
//!   feature.

pub mod list;

mod container;
mod error;
mod iter;
mod object;
mod reentrancy;
pub mod stats;

// Public surface
pub use container::{
    match_by_pointer, CmpFlags, CompareFn, Container, ContainerGuard, ContainerOptions, HashFn,
    KeyedContainer, Outcome, Position, Scan, Search, DEFAULT_BUCKETS,
};
pub use error::{Ao2Error, Result};
pub use iter::{GuardIter, Iter};
pub use object::{Ao2, Destructor, LockKind, ObjPtr, ObjectGuard, ObjectOptions};
pub use stats::Stats;
