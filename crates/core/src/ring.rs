//! Fixed-capacity circular buffer.
//!
//! Slots are preallocated once; `push` writes at the head and, when the
//! buffer is full, overwrites the logically oldest slot. Iteration always
//! yields entries in insertion order.

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    /// Slot storage, `capacity` long once full.
    slots: Vec<T>,
    capacity: usize,
    /// Index of the next slot to write once the buffer has wrapped.
    head: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer. A zero capacity is rejected.
    pub fn new(capacity: usize) -> Result<Self, CoreError> {
        if capacity == 0 {
            return Err(CoreError::Validation(
                "ring buffer capacity must be > 0".into(),
            ));
        }
        Ok(Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        })
    }

    /// Append an entry, returning the evicted oldest entry if the buffer was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        if self.slots.len() < self.capacity {
            self.slots.push(value);
            return None;
        }
        let evicted = std::mem::replace(&mut self.slots[self.head], value);
        self.head = (self.head + 1) % self.capacity;
        Some(evicted)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        let (newer, older) = self.slots.split_at(self.head);
        older.iter().chain(newer.iter())
    }

    /// Oldest surviving entry.
    pub fn oldest(&self) -> Option<&T> {
        self.iter().next()
    }

    /// Most recently pushed entry.
    pub fn newest(&self) -> Option<&T> {
        self.iter().next_back()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Up to `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<T> {
        self.iter().rev().take(n).cloned().collect()
    }

    /// Copy of the whole buffer, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
