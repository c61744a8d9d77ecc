//! Bounded event queue shared between interrupt and foreground context.

use super::Event;
use crate::{Error, Result};
use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Deque;

/// What a full mailbox does with a new event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OverflowPolicy {
    /// Discard the new event
    #[default]
    DropNew,
    /// Discard the oldest queued event and enqueue the new one
    DropOldest,
}

/// FIFO of up to `Q` events
///
/// Every operation holds a critical section for a single enqueue or dequeue.
pub struct Mailbox<E, const Q: usize> {
    queue: Mutex<CriticalSectionRawMutex, RefCell<Deque<E, Q>>>,
    policy: OverflowPolicy,
    dropped: AtomicU32,
}

impl<E, const Q: usize> Mailbox<E, Q> {
    pub const fn new() -> Self {
        Self::with_policy(OverflowPolicy::DropNew)
    }

    pub const fn with_policy(policy: OverflowPolicy) -> Self {
        Self {
            queue: Mutex::new(RefCell::new(Deque::new())),
            policy,
            dropped: AtomicU32::new(0),
        }
    }

    /// Enqueue an event; callable from any context
    ///
    /// # Returns
    /// * `QueueFull` when the queue was saturated. Under
    ///   [`OverflowPolicy::DropOldest`] the new event is still queued.
    pub fn post(&self, event: E) -> Result<()> {
        let outcome = self.queue.lock(|queue| {
            let mut queue = queue.borrow_mut();
            match queue.push_back(event) {
                Ok(()) => Ok(()),
                Err(event) => {
                    if self.policy == OverflowPolicy::DropOldest {
                        queue.pop_front();
                        let _ = queue.push_back(event);
                    }
                    Err(Error::QueueFull)
                }
            }
        });
        if outcome.is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Dequeue the oldest event
    pub fn take(&self) -> Option<E> {
        self.queue.lock(|queue| queue.borrow_mut().pop_front())
    }

    pub fn len(&self) -> usize {
        self.queue.lock(|queue| queue.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard everything queued
    pub fn clear(&self) {
        self.queue.lock(|queue| queue.borrow_mut().clear());
    }

    /// Events lost to overflow since boot
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}

impl<E, const Q: usize> Default for Mailbox<E, Q> {
    fn default() -> Self {
        Self::new()
    }
}

/// Posting application signals without naming the queue depth
pub trait Post<S> {
    fn post_signal(&self, signal: S) -> Result<()>;
}

impl<S, const Q: usize> Post<S> for Mailbox<Event<S>, Q> {
    fn post_signal(&self, signal: S) -> Result<()> {
        self.post(Event::Signal(signal))
    }
}

/// Receiver of periodic [`Event::Tick`]s
pub trait TickSink {
    fn post_tick(&self) -> Result<()>;
}

impl<S, const Q: usize> TickSink for Mailbox<Event<S>, Q> {
    fn post_tick(&self) -> Result<()> {
        self.post(Event::Tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_and_drop_new() {
        let mb: Mailbox<u8, 3> = Mailbox::new();
        for v in 1..=3 {
            mb.post(v).unwrap();
        }
        assert_eq!(mb.post(4), Err(Error::QueueFull));
        assert_eq!(mb.dropped(), 1);
        assert_eq!(mb.len(), 3);
        assert_eq!((mb.take(), mb.take(), mb.take()), (Some(1), Some(2), Some(3)));
        assert!(mb.take().is_none());
    }

    #[test]
    fn drop_oldest_keeps_the_newest() {
        let mb: Mailbox<u8, 2> = Mailbox::with_policy(OverflowPolicy::DropOldest);
        mb.post(1).unwrap();
        mb.post(2).unwrap();
        assert_eq!(mb.post(3), Err(Error::QueueFull));
        assert_eq!(mb.take(), Some(2));
        assert_eq!(mb.take(), Some(3));
        assert_eq!(mb.dropped(), 1);
    }

    #[test]
    fn signals_and_ticks_share_the_queue() {
        let mb: Mailbox<Event<char>, 4> = Mailbox::new();
        mb.post_signal('a').unwrap();
        mb.post_tick().unwrap();
        assert_eq!(mb.take(), Some(Event::Signal('a')));
        assert_eq!(mb.take(), Some(Event::Tick));
        mb.post_tick().unwrap();
        mb.clear();
        assert!(mb.is_empty());
    }
}
