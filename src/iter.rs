//! Version-tracking container iterator.
//!
//! The iterator remembers the bucket and version of the last member it
//! returned instead of a pointer into the table, so members may be linked
//! and unlinked between steps (from any thread, or by the iterating thread
//! itself) without invalidating it.
//!
//! Each step looks, starting at the remembered bucket, for the entry with
//! the smallest version above the remembered one; in later buckets any
//! version qualifies. While the container version is unchanged and the
//! bucket is still in version order, the successor of the last returned
//! entry is taken directly.
//!
//! Guarantees: members present for the whole iteration are returned exactly
//! once, and never out of bucket order. Members linked during the iteration
//! are returned if they land after the current position.

use core::marker::PhantomData;

use crate::container::{Container, EntryKey, Table};
use crate::list::Linked;
use crate::object::Ao2;

/// Iterator over the members of a [`Container`], yielding counted handles.
///
/// Created by [`Container::iter`]; each step takes the container lock.
pub struct Iter<'a, T> {
    container: &'a Container<T>,
    bucket: usize,
    last_version: u64,
    last_node: Option<EntryKey>,
    cached_version: u64,
    locked: bool,
}

impl<'a, T> Iter<'a, T> {
    pub(crate) fn new(container: &'a Container<T>, locked: bool) -> Self {
        Self {
            container,
            bucket: 0,
            last_version: 0,
            last_node: None,
            cached_version: 0,
            locked,
        }
    }

    fn step(&mut self, table: &Table<T>, version: u64) -> Option<Ao2<T>> {
        let found = self
            .successor(table, version)
            .or_else(|| self.scan_forward(table));
        match found {
            Some((bucket, key)) => {
                let entry = &table.entries[key];
                self.bucket = bucket;
                self.last_version = entry.version;
                self.last_node = Some(key);
                self.cached_version = version;
                Some(entry.obj.clone())
            }
            None => {
                self.bucket = table.buckets.len();
                self.last_node = None;
                None
            }
        }
    }

    fn successor(&self, table: &Table<T>, version: u64) -> Option<(usize, EntryKey)> {
        if self.cached_version != version || !table.buckets.get(self.bucket)?.ordered {
            return None;
        }
        let next = table.entries.get(self.last_node?)?.next()?;
        Some((self.bucket, next))
    }

    fn scan_forward(&self, table: &Table<T>) -> Option<(usize, EntryKey)> {
        for (index, bucket) in table.buckets.iter().enumerate().skip(self.bucket) {
            let floor = if index == self.bucket {
                self.last_version
            } else {
                0
            };
            let best = bucket
                .list
                .iter(&table.entries)
                .filter(|(_, entry)| entry.version > floor)
                .min_by_key(|(_, entry)| entry.version);
            if let Some((key, _)) = best {
                return Some((index, key));
            }
        }
        None
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = Ao2<T>;

    fn next(&mut self) -> Option<Ao2<T>> {
        let container = self.container;
        let inner = container.core().ok()?;
        let _lock = if self.locked {
            None
        } else {
            Some(container.as_object().lock().ok()?)
        };
        let version = inner.version();
        // SAFETY: the container lock is held, by `_lock` or by the guard
        // this iterator was created from.
        unsafe { inner.with_table(|table| self.step(table, version)) }
    }
}

/// Iterator that relies on a container lock held by the current thread.
///
/// Created by [`ContainerGuard::iter`](crate::ContainerGuard::iter). It
/// reads the table without locking, so it must stay on the thread that
/// holds the guard:
///
/// ```compile_fail
/// use ao2::{Ao2, Container};
///
/// let c: Container<u32> = Container::new(1, None, None);
/// c.link(&Ao2::new(1)).unwrap();
/// let guard = c.lock().unwrap();
/// let it = guard.iter();
/// std::thread::scope(|s| {
///     s.spawn(move || it.count());
/// });
/// ```
pub struct GuardIter<'g, T> {
    inner: Iter<'g, T>,
    _nosend: PhantomData<*mut ()>,
}

impl<'g, T> GuardIter<'g, T> {
    pub(crate) fn new(container: &'g Container<T>) -> Self {
        Self {
            inner: Iter::new(container, true),
            _nosend: PhantomData,
        }
    }
}

impl<'g, T> Iterator for GuardIter<'g, T> {
    type Item = Ao2<T>;

    fn next(&mut self) -> Option<Ao2<T>> {
        self.inner.next()
    }
}
