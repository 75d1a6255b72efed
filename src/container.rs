//! Container: a bucketed, versioned collection of managed objects.
//!
//! A container is itself an [`Ao2`] object. Its payload holds the hash and
//! compare functions, the live element count, a version counter and the
//! bucket table. Every structural change happens under the container's own
//! recursive lock; the count and version are atomics so they can be read
//! without it.
//!
//! Each member is stored as a bucket entry carrying a cloned `Ao2<T>` (the
//! container's reference) and the version stamped at link time. Versions
//! start at 1 and grow on every link and unlink; iterators use them to
//! resume after concurrent changes (see [`Iter`]).
//!
//! Removed members are released only after the table section is left and
//! the lock dropped, so a member's destructor may call back into the
//! container.

use crate::error::Result;
use crate::iter::{GuardIter, Iter};
use crate::list::{Linked, List};
use crate::object::{Ao2, ObjectGuard};
use crate::reentrancy::Reentrancy;
use crate::stats;
use core::cell::UnsafeCell;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::ops::{Deref, Range};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use hashbrown::hash_map::DefaultHashBuilder;
use slotmap::SlotMap;
use std::sync::Arc;

/// Bucket count used by [`Container::builder`] unless overridden.
pub const DEFAULT_BUCKETS: usize = 17;

/// Maps a member (or a lookup value) to a hash; the bucket is the hash modulo the
/// bucket count.
pub type HashFn<T> = Box<dyn Fn(&T) -> u64 + Send + Sync>;

/// Default predicate of [`Container::find`]: `(member, wanted)`.
pub type CompareFn<T> = Box<dyn Fn(&T, &T) -> CmpFlags + Send + Sync>;

bitflags::bitflags! {
    /// Verdict of a match function.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CmpFlags: u8 {
        /// The candidate matches.
        const MATCH = 0x1;
        /// Stop scanning after this candidate.
        const STOP = 0x2;
    }
}

/// Where [`Container::link_at`] puts a new member within its bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Position {
    Head,
    #[default]
    Tail,
}

/// Which buckets a search visits.
pub enum Scan<'a, T> {
    /// Every bucket, in index order.
    All,
    /// Only the bucket the container's hash function assigns to this object.
    Object(&'a T),
    /// Only the bucket for a precomputed hash.
    Hash(u64),
}

impl<'a, T> Clone for Scan<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for Scan<'a, T> {}

/// What happens to a matched member.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Outcome {
    /// Return it with an added reference.
    #[default]
    Return,
    /// Remove it and release the container's reference.
    Unlink,
    /// Remove it and hand the container's reference to the caller.
    UnlinkReturn,
    /// Leave it in place and return nothing.
    Visit,
}

impl Outcome {
    fn unlinks(self) -> bool {
        matches!(self, Outcome::Unlink | Outcome::UnlinkReturn)
    }

    fn returns(self) -> bool {
        matches!(self, Outcome::Return | Outcome::UnlinkReturn)
    }
}

/// A search request for [`Container::callback`] and [`Container::callback_all`].
pub struct Search<'a, T> {
    pub scan: Scan<'a, T>,
    pub outcome: Outcome,
}

impl<'a, T> Search<'a, T> {
    pub fn all() -> Self {
        Self {
            scan: Scan::All,
            outcome: Outcome::Return,
        }
    }

    pub fn object(wanted: &'a T) -> Self {
        Self {
            scan: Scan::Object(wanted),
            outcome: Outcome::Return,
        }
    }

    pub fn hash(hash: u64) -> Self {
        Self {
            scan: Scan::Hash(hash),
            outcome: Outcome::Return,
        }
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }
}

impl<'a, T> Clone for Search<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for Search<'a, T> {}

/// Match exactly `target` (by identity) and stop.
pub fn match_by_pointer<T>(target: &Ao2<T>) -> impl Fn(&Ao2<T>) -> CmpFlags + '_ {
    move |candidate| {
        if Ao2::ptr_eq(candidate, target) {
            CmpFlags::MATCH | CmpFlags::STOP
        } else {
            CmpFlags::empty()
        }
    }
}

fn same_payload<T>(candidate: &Ao2<T>, wanted: &T) -> CmpFlags {
    if core::ptr::eq(&**candidate, wanted) {
        CmpFlags::MATCH | CmpFlags::STOP
    } else {
        CmpFlags::empty()
    }
}

slotmap::new_key_type! {
    pub(crate) struct EntryKey;
}

pub(crate) struct BucketEntry<T> {
    next: Option<EntryKey>,
    pub(crate) version: u64,
    pub(crate) obj: Ao2<T>,
}

impl<T> Linked<EntryKey> for BucketEntry<T> {
    fn next(&self) -> Option<EntryKey> {
        self.next
    }

    fn set_next(&mut self, next: Option<EntryKey>) {
        self.next = next;
    }
}

pub(crate) struct Bucket {
    pub(crate) list: List<EntryKey>,
    // Entries are in ascending version order; cleared by head insertion
    // into a non-empty bucket.
    pub(crate) ordered: bool,
}

pub(crate) struct Table<T> {
    pub(crate) entries: SlotMap<EntryKey, BucketEntry<T>>,
    pub(crate) buckets: Box<[Bucket]>,
}

impl<T> Table<T> {
    fn new(n_buckets: usize) -> Self {
        Self {
            entries: SlotMap::with_key(),
            buckets: (0..n_buckets)
                .map(|_| Bucket {
                    list: List::new(),
                    ordered: true,
                })
                .collect(),
        }
    }

    fn insert(&mut self, bucket: usize, obj: Ao2<T>, version: u64, position: Position) {
        let key = self.entries.insert(BucketEntry {
            next: None,
            version,
            obj,
        });
        let bucket = &mut self.buckets[bucket];
        if bucket.list.is_empty() {
            bucket.ordered = true;
        }
        match position {
            Position::Tail => bucket.list.insert_tail(&mut self.entries, key),
            Position::Head => {
                if !bucket.list.is_empty() {
                    bucket.ordered = false;
                }
                bucket.list.insert_head(&mut self.entries, key);
            }
        }
    }

    fn drain(&mut self) -> Vec<Ao2<T>> {
        let mut drained = Vec::with_capacity(self.entries.len());
        for bucket in self.buckets.iter_mut() {
            while let Some(key) = bucket.list.remove_head(&mut self.entries) {
                if let Some(entry) = self.entries.remove(key) {
                    drained.push(entry.obj);
                }
            }
            bucket.ordered = true;
        }
        drained
    }
}

struct Scanned<T> {
    returned: Vec<Ao2<T>>,
    released: Vec<Ao2<T>>,
}

/// Payload of a container object. Only reachable through [`Container`].
pub(crate) struct ContainerInner<T> {
    hash: Option<HashFn<T>>,
    compare: Option<CompareFn<T>>,
    n_buckets: usize,
    elements: AtomicUsize,
    version: AtomicU64,
    table: UnsafeCell<Table<T>>,
    reentrancy: Reentrancy,
}

// SAFETY: the table is only touched through `with_table`, whose callers
// hold the container's lock; everything else is immutable or atomic.
unsafe impl<T: Send + Sync> Sync for ContainerInner<T> {}

impl<T> ContainerInner<T> {
    fn bucket_index(&self, hash: u64) -> usize {
        (hash % self.n_buckets as u64) as usize
    }

    fn bucket_of(&self, value: &T) -> usize {
        match &self.hash {
            Some(hash) => self.bucket_index(hash(value)),
            None => 0,
        }
    }

    fn scan_range(&self, scan: Scan<'_, T>) -> Range<usize> {
        let bucket = match scan {
            Scan::All => return 0..self.n_buckets,
            Scan::Object(wanted) => self.bucket_of(wanted),
            Scan::Hash(hash) => self.bucket_index(hash),
        };
        bucket..bucket + 1
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Run `f` on the bucket table.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the container's lock for the whole call.
    pub(crate) unsafe fn with_table<R>(&self, f: impl FnOnce(&mut Table<T>) -> R) -> R {
        let _g = self.reentrancy.enter();
        // SAFETY: the lock excludes other threads and the reentrancy guard
        // excludes a second borrow on this one.
        let table = unsafe { &mut *self.table.get() };
        f(table)
    }

    /// # Safety
    ///
    /// The calling thread must hold the container's lock.
    unsafe fn insert(&self, bucket: usize, obj: Ao2<T>, position: Position) {
        // SAFETY: forwarded from the caller.
        unsafe {
            self.with_table(|table| {
                let version = self.version.fetch_add(1, Ordering::AcqRel);
                table.insert(bucket, obj, version, position);
                self.elements.fetch_add(1, Ordering::Relaxed);
            })
        }
    }

    /// # Safety
    ///
    /// The calling thread must hold the container's lock.
    unsafe fn scan<F>(
        &self,
        range: Range<usize>,
        outcome: Outcome,
        first_only: bool,
        match_fn: &mut F,
    ) -> Scanned<T>
    where
        F: FnMut(&Ao2<T>) -> CmpFlags,
    {
        let mut scanned = Scanned {
            returned: Vec::new(),
            released: Vec::new(),
        };
        let table_scan = |table: &mut Table<T>| {
            let Table { entries, buckets } = table;
            'buckets: for bucket in &mut buckets[range] {
                let mut cursor = bucket.list.cursor_mut();
                while let Some(key) = cursor.move_next(entries) {
                    let verdict = match_fn(&entries[key].obj);
                    if verdict.contains(CmpFlags::MATCH) {
                        if outcome.unlinks() {
                            cursor.remove_current(entries);
                            let entry = entries.remove(key).expect("listed entry must be live");
                            self.version.fetch_add(1, Ordering::AcqRel);
                            self.elements.fetch_sub(1, Ordering::Relaxed);
                            if outcome.returns() {
                                scanned.returned.push(entry.obj);
                            } else {
                                scanned.released.push(entry.obj);
                            }
                        } else if outcome.returns() {
                            scanned.returned.push(entries[key].obj.clone());
                        }
                        if first_only {
                            break 'buckets;
                        }
                    }
                    if verdict.contains(CmpFlags::STOP) {
                        break 'buckets;
                    }
                }
            }
        };
        // SAFETY: forwarded from the caller.
        unsafe { self.with_table(table_scan) };
        scanned
    }

    /// Destructor hook: unlink and release every member. Runs with the
    /// container's lock held.
    fn destroy(&self) {
        // SAFETY: object destruction holds the object's own lock while the
        // hook runs.
        let drained = unsafe { self.with_table(Table::drain) };
        self.version
            .fetch_add(drained.len() as u64, Ordering::AcqRel);
        self.elements.store(0, Ordering::Relaxed);
        stats::record_container(-1);
        tracing::trace!("destroying ao2 container, releasing {} members", drained.len());
        drop(drained);
    }
}

/// Builder for [`Container`].
pub struct ContainerOptions<T> {
    buckets: usize,
    hash: Option<HashFn<T>>,
    compare: Option<CompareFn<T>>,
}

impl<T> ContainerOptions<T> {
    pub fn buckets(mut self, buckets: usize) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn hash<F>(mut self, hash: F) -> Self
    where
        F: Fn(&T) -> u64 + Send + Sync + 'static,
    {
        self.hash = Some(Box::new(hash));
        self
    }

    pub fn compare<F>(mut self, compare: F) -> Self
    where
        F: Fn(&T, &T) -> CmpFlags + Send + Sync + 'static,
    {
        self.compare = Some(Box::new(compare));
        self
    }

    pub fn build(self) -> Container<T> {
        Container::new(self.buckets, self.hash, self.compare)
    }
}

/// Counted handle to a container. Cloning adds a reference to the
/// container object; the last release unlinks every member.
pub struct Container<T> {
    obj: Ao2<ContainerInner<T>>,
}

impl<T> Container<T> {
    /// Create a container with `buckets` buckets (at least one). Without a
    /// hash function every member lands in bucket 0; without a compare
    /// function [`find`](Self::find) matches by identity.
    pub fn new(buckets: usize, hash: Option<HashFn<T>>, compare: Option<CompareFn<T>>) -> Self {
        let n_buckets = buckets.max(1);
        let inner = ContainerInner {
            hash,
            compare,
            n_buckets,
            elements: AtomicUsize::new(0),
            version: AtomicU64::new(1),
            table: UnsafeCell::new(Table::new(n_buckets)),
            reentrancy: Reentrancy::new(),
        };
        stats::record_container(1);
        tracing::trace!("created ao2 container with {} buckets", n_buckets);
        Self {
            obj: Ao2::with_destructor(inner, ContainerInner::destroy),
        }
    }

    pub fn builder() -> ContainerOptions<T> {
        ContainerOptions {
            buckets: DEFAULT_BUCKETS,
            hash: None,
            compare: None,
        }
    }

    /// Container hashed and compared on a key extracted from each member.
    /// The returned handle can also be searched by a bare key.
    pub fn keyed<K, F>(buckets: usize, key: F) -> KeyedContainer<T, K>
    where
        T: 'static,
        K: Hash + Eq + ?Sized + 'static,
        F: Fn(&T) -> &K + Send + Sync + 'static,
    {
        let key: Arc<dyn Fn(&T) -> &K + Send + Sync> = Arc::new(key);
        let hasher = DefaultHashBuilder::default();
        let hash_key = Arc::clone(&key);
        let hash_state = hasher.clone();
        let compare_key = Arc::clone(&key);
        let container = Self::new(
            buckets,
            Some(Box::new(move |value: &T| {
                hash_state.hash_one((*hash_key)(value))
            })),
            Some(Box::new(move |member: &T, wanted: &T| {
                if (*compare_key)(member) == (*compare_key)(wanted) {
                    CmpFlags::MATCH | CmpFlags::STOP
                } else {
                    CmpFlags::empty()
                }
            })),
        );
        KeyedContainer {
            container,
            key,
            hasher,
        }
    }

    pub(crate) fn core(&self) -> Result<&ContainerInner<T>> {
        self.obj.validate()?;
        Ok(&*self.obj)
    }

    /// The container's own object handle (reference count, lock).
    pub fn as_object(&self) -> &Ao2<impl Sized> {
        &self.obj
    }

    pub fn ref_count(&self) -> isize {
        self.obj.ref_count()
    }

    /// Number of members. Read without locking.
    pub fn count(&self) -> usize {
        self.obj.elements.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.obj.n_buckets
    }

    pub fn version(&self) -> u64 {
        self.obj.version()
    }

    /// Add `obj` at the tail of its bucket.
    pub fn link(&self, obj: &Ao2<T>) -> Result<()> {
        self.link_at(obj, Position::Tail)
    }

    /// Add `obj` to its bucket; the container takes one reference.
    pub fn link_at(&self, obj: &Ao2<T>, position: Position) -> Result<()> {
        let inner = self.core()?;
        obj.validate()?;
        let bucket = inner.bucket_of(obj);
        let held = obj.clone();
        let _lock = self.obj.lock()?;
        // SAFETY: `_lock` holds the container lock.
        unsafe { inner.insert(bucket, held, position) };
        Ok(())
    }

    fn run<F>(&self, search: Search<'_, T>, first_only: bool, mut match_fn: F) -> Result<Scanned<T>>
    where
        F: FnMut(&Ao2<T>) -> CmpFlags,
    {
        let inner = self.core()?;
        let range = inner.scan_range(search.scan);
        let _lock = self.obj.lock()?;
        // SAFETY: `_lock` holds the container lock.
        Ok(unsafe { inner.scan(range, search.outcome, first_only, &mut match_fn) })
    }

    /// Visit candidates until the first match (or a stop verdict) and apply
    /// the search outcome to it.
    pub fn callback<F>(&self, search: Search<'_, T>, match_fn: F) -> Result<Option<Ao2<T>>>
    where
        F: FnMut(&Ao2<T>) -> CmpFlags,
    {
        let Scanned { returned, released } = self.run(search, true, match_fn)?;
        drop(released);
        Ok(returned.into_iter().next())
    }

    /// Visit candidates until a stop verdict and apply the search outcome
    /// to every match.
    pub fn callback_all<F>(&self, search: Search<'_, T>, match_fn: F) -> Result<Vec<Ao2<T>>>
    where
        F: FnMut(&Ao2<T>) -> CmpFlags,
    {
        let Scanned { returned, released } = self.run(search, false, match_fn)?;
        drop(released);
        Ok(returned)
    }

    /// Look `wanted` up in its bucket with the container's compare function.
    pub fn find(&self, wanted: &T, outcome: Outcome) -> Result<Option<Ao2<T>>> {
        let compare = self.obj.compare.as_deref();
        self.callback(Search::object(wanted).outcome(outcome), |candidate| {
            match compare {
                Some(compare) => compare(candidate, wanted),
                None => same_payload(candidate, wanted),
            }
        })
    }

    /// Like [`find`](Self::find) but applies `outcome` to every match.
    pub fn find_all(&self, wanted: &T, outcome: Outcome) -> Result<Vec<Ao2<T>>> {
        let compare = self.obj.compare.as_deref();
        self.callback_all(Search::object(wanted).outcome(outcome), |candidate| {
            match compare {
                Some(compare) => compare(candidate, wanted),
                None => same_payload(candidate, wanted),
            }
        })
    }

    /// Remove `obj` and release the container's reference to it.
    pub fn unlink(&self, obj: &Ao2<T>) -> Result<()> {
        obj.validate()?;
        let target: &T = obj;
        self.callback(
            Search::object(target).outcome(Outcome::Unlink),
            match_by_pointer(obj),
        )?;
        Ok(())
    }

    pub fn contains(&self, obj: &Ao2<T>) -> Result<bool> {
        let target: &T = obj;
        Ok(self
            .callback(Search::object(target), match_by_pointer(obj))?
            .is_some())
    }

    /// Unlink every member; returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let Scanned { released, .. } =
            self.run(Search::all().outcome(Outcome::Unlink), false, |_| CmpFlags::MATCH)?;
        Ok(released.len())
    }

    /// Hold the container lock. Iterators created from the guard do not
    /// lock on their own.
    pub fn lock(&self) -> Result<ContainerGuard<'_, T>> {
        let guard = self.obj.lock()?;
        Ok(ContainerGuard {
            container: self,
            guard,
        })
    }

    /// Iterator that takes the container lock for each step.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter::new(self, false)
    }
}

impl<T> Clone for Container<T> {
    fn clone(&self) -> Self {
        Self {
            obj: self.obj.clone(),
        }
    }
}

impl<T> fmt::Debug for Container<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("buckets", &self.bucket_count())
            .field("count", &self.count())
            .field("version", &self.version())
            .field("refcount", &self.ref_count())
            .finish()
    }
}

impl<'a, T> IntoIterator for &'a Container<T> {
    type Item = Ao2<T>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

/// A [`Container`] built by [`Container::keyed`].
///
/// Dereferences to the container; adds lookups by a bare key, hashed with
/// the same builder the container hashes its members with.
pub struct KeyedContainer<T, K: ?Sized> {
    container: Container<T>,
    key: Arc<dyn Fn(&T) -> &K + Send + Sync>,
    hasher: DefaultHashBuilder,
}

impl<T, K: Hash + Eq + ?Sized> KeyedContainer<T, K> {
    /// Hash of `key`, as the container hashes a member carrying it.
    pub fn key_hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    /// Search restricted to the bucket `key` hashes to.
    pub fn search_key<'a>(&self, key: &K) -> Search<'a, T> {
        Search::hash(self.key_hash(key))
    }

    /// First member whose key equals `key`.
    pub fn find_key(&self, key: &K, outcome: Outcome) -> Result<Option<Ao2<T>>> {
        let key_of = &*self.key;
        self.container
            .callback(self.search_key(key).outcome(outcome), |member| {
                if key_of(&**member) == key {
                    CmpFlags::MATCH | CmpFlags::STOP
                } else {
                    CmpFlags::empty()
                }
            })
    }

    /// Every member whose key equals `key`.
    pub fn find_key_all(&self, key: &K, outcome: Outcome) -> Result<Vec<Ao2<T>>> {
        let key_of = &*self.key;
        self.container
            .callback_all(self.search_key(key).outcome(outcome), |member| {
                if key_of(&**member) == key {
                    CmpFlags::MATCH
                } else {
                    CmpFlags::empty()
                }
            })
    }
}

impl<T, K: ?Sized> Deref for KeyedContainer<T, K> {
    type Target = Container<T>;

    fn deref(&self) -> &Container<T> {
        &self.container
    }
}

impl<T, K: ?Sized> Clone for KeyedContainer<T, K> {
    fn clone(&self) -> Self {
        Self {
            container: self.container.clone(),
            key: Arc::clone(&self.key),
            hasher: self.hasher.clone(),
        }
    }
}

impl<T, K: ?Sized> fmt::Debug for KeyedContainer<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyedContainer").field(&self.container).finish()
    }
}

/// Held container lock.
pub struct ContainerGuard<'a, T> {
    container: &'a Container<T>,
    guard: ObjectGuard<'a>,
}

impl<'a, T> ContainerGuard<'a, T> {
    /// Iterator that relies on this guard for locking.
    pub fn iter(&self) -> GuardIter<'_, T> {
        GuardIter::new(self.container)
    }

    pub fn unlock(self) -> Result<()> {
        self.guard.unlock()
    }
}
