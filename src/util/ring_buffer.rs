//! Single-producer/single-consumer ring buffer for sharing a byte stream
//! between one interrupt handler and the foreground loop.
//!
//! A thin owner of [`heapless::spsc::Queue`]: one slot stays unused, so a
//! buffer of `N` slots holds `N - 1` items. The split halves need no
//! interrupt masking.

use heapless::spsc::{self, Queue};

/// Bounded FIFO holding up to `N - 1` items
pub struct RingBuffer<T, const N: usize> {
    queue: Queue<T, N>,
}

impl<T, const N: usize> RingBuffer<T, N> {
    pub const fn new() -> Self {
        Self { queue: Queue::new() }
    }

    /// Items the buffer can hold at once
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Split into the producer and consumer halves
    pub fn split(&mut self) -> (Producer<'_, T, N>, Consumer<'_, T, N>) {
        let (tx, rx) = self.queue.split();
        (Producer { tx }, Consumer { rx })
    }
}

impl<T, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Writing half
pub struct Producer<'a, T, const N: usize> {
    tx: spsc::Producer<'a, T, N>,
}

impl<T, const N: usize> Producer<'_, T, N> {
    /// Enqueue `value`, handing it back if the buffer is full
    pub fn push(&mut self, value: T) -> Result<(), T> {
        self.tx.enqueue(value)
    }

    pub fn is_full(&self) -> bool {
        !self.tx.ready()
    }
}

impl<T: Copy, const N: usize> Producer<'_, T, N> {
    /// Enqueue as many of `values` as fit, returning how many were taken
    pub fn push_slice(&mut self, values: &[T]) -> usize {
        values
            .iter()
            .take_while(|&&v| self.tx.enqueue(v).is_ok())
            .count()
    }
}

/// Reading half
pub struct Consumer<'a, T, const N: usize> {
    rx: spsc::Consumer<'a, T, N>,
}

impl<T, const N: usize> Consumer<'_, T, N> {
    /// Dequeue the oldest item
    pub fn pop(&mut self) -> Option<T> {
        self.rx.dequeue()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.rx.ready()
    }
}

impl<T, const N: usize> Iterator for Consumer<'_, T, N> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.pop()
    }
}
