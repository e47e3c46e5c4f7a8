//! Capacity-bounded queue used for hardware FIFOs.

use std::collections::VecDeque;

use thiserror::Error;

/// Push into a full FIFO. The item is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("fifo full ({capacity} entries)")]
pub struct FifoFull {
    /// Capacity of the FIFO that refused the item.
    pub capacity: usize,
}

/// A FIFO that refuses pushes beyond its capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedFifo<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedFifo<T> {
    /// An empty FIFO holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of items.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the FIFO holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the FIFO is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Number of items that can still be pushed.
    #[must_use]
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.items.len())
    }

    /// Appends an item.
    ///
    /// # Errors
    ///
    /// Returns [`FifoFull`] and drops `item` when the FIFO is at capacity.
    pub fn try_push(&mut self, item: T) -> Result<(), FifoFull> {
        if self.is_full() {
            return Err(FifoFull {
                capacity: self.capacity,
            });
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Removes the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Oldest item without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// Removes every item.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Removes and returns every item in FIFO order.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }

    /// Items in FIFO order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{BoundedFifo, FifoFull};

    #[test]
    fn drains_in_order_then_reports_empty() {
        let mut fifo = BoundedFifo::new(3);
        for value in [10, 20, 30] {
            fifo.try_push(value).expect("space");
        }
        assert!(fifo.is_full());
        assert_eq!(fifo.try_push(40), Err(FifoFull { capacity: 3 }));
        assert_eq!(fifo.pop(), Some(10));
        assert_eq!(fifo.pop(), Some(20));
        assert_eq!(fifo.pop(), Some(30));
        assert_eq!(fifo.pop(), None);
    }

    #[test]
    fn free_tracks_occupancy() {
        let mut fifo = BoundedFifo::new(2);
        assert_eq!(fifo.free(), 2);
        fifo.try_push('a').expect("space");
        assert_eq!(fifo.free(), 1);
        assert_eq!(fifo.peek(), Some(&'a'));
        fifo.clear();
        assert!(fifo.is_empty());
    }
}
