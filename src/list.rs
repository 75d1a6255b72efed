//! Singly-linked lists threaded through a slotmap arena.
//!
//! A [`List`] stores only its head and tail keys. The nodes live in a
//! `SlotMap` owned by the caller and expose their `next` link through
//! [`Linked`], so one arena can back any number of lists (the container
//! keeps one list per bucket over a single arena of entries).
//!
//! Every key handed to a list operation must be live in the arena and,
//! except for the insert operations, already on that list. Violations
//! are internal bugs and panic on the arena index.

use slotmap::{Key, SlotMap};

/// A node that carries the `next` link of the list it is on.
pub trait Linked<K: Key> {
    fn next(&self) -> Option<K>;
    fn set_next(&mut self, next: Option<K>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct List<K: Key> {
    head: Option<K>,
    tail: Option<K>,
}

impl<K: Key> Default for List<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> List<K> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn first(&self) -> Option<K> {
        self.head
    }

    pub fn last(&self) -> Option<K> {
        self.tail
    }

    pub fn insert_head<N: Linked<K>>(&mut self, arena: &mut SlotMap<K, N>, key: K) {
        arena[key].set_next(self.head);
        self.head = Some(key);
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    pub fn insert_tail<N: Linked<K>>(&mut self, arena: &mut SlotMap<K, N>, key: K) {
        arena[key].set_next(None);
        match self.tail {
            Some(tail) => arena[tail].set_next(Some(key)),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
    }

    /// Insert `key` right behind `after`, which must be on this list.
    pub fn insert_after<N: Linked<K>>(&mut self, arena: &mut SlotMap<K, N>, after: K, key: K) {
        let next = arena[after].next();
        arena[key].set_next(next);
        arena[after].set_next(Some(key));
        if self.tail == Some(after) {
            self.tail = Some(key);
        }
    }

    pub fn remove_head<N: Linked<K>>(&mut self, arena: &mut SlotMap<K, N>) -> Option<K> {
        let head = self.head?;
        self.head = arena[head].next();
        if self.head.is_none() {
            self.tail = None;
        }
        arena[head].set_next(None);
        Some(head)
    }

    /// Detach `key` from the list. O(n); returns false if it was not found.
    pub fn remove<N: Linked<K>>(&mut self, arena: &mut SlotMap<K, N>, key: K) -> bool {
        let mut cursor = self.cursor_mut();
        while let Some(current) = cursor.move_next(arena) {
            if current == key {
                cursor.remove_current(arena);
                return true;
            }
        }
        false
    }

    /// Move every node of `other` to the end of this list, leaving `other` empty.
    pub fn append<N: Linked<K>>(&mut self, arena: &mut SlotMap<K, N>, other: &mut List<K>) {
        let Some(other_head) = other.head.take() else {
            return;
        };
        match self.tail {
            Some(tail) => arena[tail].set_next(Some(other_head)),
            None => self.head = Some(other_head),
        }
        self.tail = other.tail.take();
    }

    pub fn iter<'a, N: Linked<K>>(&self, arena: &'a SlotMap<K, N>) -> Iter<'a, K, N> {
        Iter {
            arena,
            next: self.head,
        }
    }

    /// Cursor that can unlink the node it stands on without losing its place.
    pub fn cursor_mut(&mut self) -> CursorMut<'_, K> {
        CursorMut {
            list: self,
            prev: None,
            current: None,
            next: None,
            started: false,
        }
    }
}

pub struct Iter<'a, K: Key, N> {
    arena: &'a SlotMap<K, N>,
    next: Option<K>,
}

impl<'a, K: Key, N: Linked<K>> Iterator for Iter<'a, K, N> {
    type Item = (K, &'a N);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.next?;
        let node = &self.arena[key];
        self.next = node.next();
        Some((key, node))
    }
}

/// Traversal that tolerates removal of the current node.
///
/// The successor is captured when the cursor moves onto a node, so
/// `remove_current` followed by `move_next` continues with the node that
/// followed the removed one.
pub struct CursorMut<'l, K: Key> {
    list: &'l mut List<K>,
    prev: Option<K>,
    current: Option<K>,
    next: Option<K>,
    started: bool,
}

impl<'l, K: Key> CursorMut<'l, K> {
    pub fn move_next<N: Linked<K>>(&mut self, arena: &SlotMap<K, N>) -> Option<K> {
        if let Some(current) = self.current {
            self.prev = Some(current);
        }
        let candidate = if self.started {
            self.next
        } else {
            self.started = true;
            self.list.head
        };
        self.current = candidate;
        self.next = candidate.and_then(|k| arena[k].next());
        candidate
    }

    pub fn current(&self) -> Option<K> {
        self.current
    }

    pub fn remove_current<N: Linked<K>>(&mut self, arena: &mut SlotMap<K, N>) -> Option<K> {
        let current = self.current.take()?;
        match self.prev {
            Some(prev) => arena[prev].set_next(self.next),
            None => self.list.head = self.next,
        }
        if self.list.tail == Some(current) {
            self.list.tail = self.prev;
        }
        arena[current].set_next(None);
        Some(current)
    }
}
