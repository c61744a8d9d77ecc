//! Active objects: a state machine bound to its mailbox.

use super::{Event, Mailbox, Post, TickSink};
use crate::util::list::Node;
use core::cell::{Cell, RefCell};

/// Data-driven state machine run by an [`ActiveObject`]
pub trait StateMachine {
    /// Application signals this machine reacts to
    type Signal: Copy + Send;

    /// Handle one event to completion
    ///
    /// # Arguments
    /// * `event` - The dequeued event
    /// * `this` - The machine's own mailbox, for follow-up signals
    fn dispatch(&mut self, event: Event<Self::Signal>, this: &dyn Post<Self::Signal>);
}

/// Registry slot pointing back at the object embedding it
pub type Entry<'a> = Cell<Option<&'a dyn Dispatch<'a>>>;

/// Object-safe view the scheduler drives
pub trait Dispatch<'a> {
    fn id(&self) -> u8;

    fn is_enabled(&self) -> bool;

    /// Events waiting in the mailbox
    fn pending(&self) -> usize;

    /// Dequeue and handle one event. Returns `false` if none was pending.
    fn dispatch_one(&self) -> bool;

    /// Mailbox and divisor for periodic ticks, if the object wants them
    fn ticks(&self) -> Option<(&'a (dyn TickSink + Sync), u32)>;

    /// Intrusive registry link
    fn link(&self) -> &Node<'a, Entry<'a>>;
}

/// A state machine with its mailbox, tick divisor and enabled flag
pub struct ActiveObject<'a, M: StateMachine, const Q: usize> {
    id: u8,
    mailbox: &'a Mailbox<Event<M::Signal>, Q>,
    machine: RefCell<M>,
    divisor: u32,
    enabled: Cell<bool>,
    link: Node<'a, Entry<'a>>,
}

impl<'a, M: StateMachine, const Q: usize> ActiveObject<'a, M, Q> {
    /// # Arguments
    /// * `id` - Identifier used in logs
    /// * `mailbox` - Queue other contexts post into
    /// * `machine` - Initial state
    /// * `divisor` - Receive a tick every `divisor` timebase ticks; 0 for none
    pub fn new(
        id: u8,
        mailbox: &'a Mailbox<Event<M::Signal>, Q>,
        machine: M,
        divisor: u32,
    ) -> Self {
        Self {
            id,
            mailbox,
            machine: RefCell::new(machine),
            divisor,
            enabled: Cell::new(true),
            link: Node::new(Cell::new(None)),
        }
    }

    pub fn mailbox(&self) -> &'a Mailbox<Event<M::Signal>, Q> {
        self.mailbox
    }

    /// Post an application signal to this object
    pub fn post(&self, signal: M::Signal) -> crate::Result<()> {
        self.mailbox.post_signal(signal)
    }

    /// Disabled objects keep their queue but are skipped by the scheduler
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    /// Read the machine between dispatches
    ///
    /// Returns `None` when called from inside this object's own dispatch.
    pub fn inspect<R>(&self, f: impl FnOnce(&M) -> R) -> Option<R> {
        self.machine.try_borrow().ok().map(|m| f(&m))
    }
}

impl<'a, M, const Q: usize> Dispatch<'a> for ActiveObject<'a, M, Q>
where
    M: StateMachine,
    M::Signal: 'a,
{
    fn id(&self) -> u8 {
        self.id
    }

    fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    fn pending(&self) -> usize {
        self.mailbox.len()
    }

    fn dispatch_one(&self) -> bool {
        let Ok(mut machine) = self.machine.try_borrow_mut() else {
            return false;
        };
        match self.mailbox.take() {
            Some(event) => {
                machine.dispatch(event, self.mailbox);
                true
            }
            None => false,
        }
    }

    fn ticks(&self) -> Option<(&'a (dyn TickSink + Sync), u32)> {
        if self.divisor == 0 {
            return None;
        }
        let sink: &'a (dyn TickSink + Sync) = self.mailbox;
        Some((sink, self.divisor))
    }

    fn link(&self) -> &Node<'a, Entry<'a>> {
        &self.link
    }
}
