//! Active Object Framework.
//!
//! Interrupt handlers post events into per-object [`Mailbox`]es and the
//! [`Timebase`] posts periodic [`Event::Tick`]s. The foreground loop calls
//! [`Scheduler::run_once`], which hands at most one event to each registered
//! [`ActiveObject`] per pass, in registration order. State machines run to
//! completion and never block.

mod event;
mod mailbox;
mod object;
mod scheduler;
mod timebase;

pub use event::Event;
pub use mailbox::{Mailbox, OverflowPolicy, Post, TickSink};
pub use object::{ActiveObject, Dispatch, Entry, StateMachine};
pub use scheduler::Scheduler;
pub use timebase::Timebase;
