//! Intrusive doubly linked list.
//!
//! The list never owns its nodes. Nodes live in statics or are embedded in
//! the objects they link, so no allocation is needed. Push-back, pop-front
//! and removal of a known node are all O(1).

use crate::{Error, Result};
use core::cell::Cell;

/// A list link carrying `value`
pub struct Node<'a, T> {
    value: T,
    prev: Cell<Option<&'a Node<'a, T>>>,
    next: Cell<Option<&'a Node<'a, T>>>,
    linked: Cell<bool>,
}

impl<'a, T> Node<'a, T> {
    pub const fn new(value: T) -> Self {
        Self {
            value,
            prev: Cell::new(None),
            next: Cell::new(None),
            linked: Cell::new(false),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// `true` while the node sits in a list
    pub fn is_linked(&self) -> bool {
        self.linked.get()
    }
}

/// List of borrowed nodes
pub struct List<'a, T> {
    head: Cell<Option<&'a Node<'a, T>>>,
    tail: Cell<Option<&'a Node<'a, T>>>,
    len: Cell<usize>,
}

impl<'a, T> List<'a, T> {
    pub const fn new() -> Self {
        Self {
            head: Cell::new(None),
            tail: Cell::new(None),
            len: Cell::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.head.get().is_none()
    }

    pub fn front(&self) -> Option<&'a Node<'a, T>> {
        self.head.get()
    }

    /// Append a node
    ///
    /// # Returns
    /// * `Busy` if the node is already in a list
    pub fn push_back(&self, node: &'a Node<'a, T>) -> Result<()> {
        if node.linked.get() {
            return Err(Error::Busy);
        }
        node.next.set(None);
        node.prev.set(self.tail.get());
        match self.tail.get() {
            Some(tail) => tail.next.set(Some(node)),
            None => self.head.set(Some(node)),
        }
        self.tail.set(Some(node));
        node.linked.set(true);
        self.len.set(self.len.get() + 1);
        Ok(())
    }

    /// Unlink and return the first node
    pub fn pop_front(&self) -> Option<&'a Node<'a, T>> {
        let head = self.head.get()?;
        self.unlink(head);
        Some(head)
    }

    /// Unlink `node`, which must belong to this list
    ///
    /// Returns `false` if the node was not linked.
    pub fn remove(&self, node: &'a Node<'a, T>) -> bool {
        if !node.linked.get() {
            return false;
        }
        self.unlink(node);
        true
    }

    fn unlink(&self, node: &'a Node<'a, T>) {
        let prev = node.prev.get();
        let next = node.next.get();
        match prev {
            Some(p) => p.next.set(next),
            None => self.head.set(next),
        }
        match next {
            Some(n) => n.prev.set(prev),
            None => self.tail.set(prev),
        }
        node.prev.set(None);
        node.next.set(None);
        node.linked.set(false);
        self.len.set(self.len.get() - 1);
    }

    /// Front-to-back iteration
    pub fn iter(&self) -> Iter<'a, T> {
        Iter {
            next: self.head.get(),
        }
    }
}

impl<T> Default for List<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, T> {
    next: Option<&'a Node<'a, T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a Node<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next.get();
        Some(node)
    }
}
