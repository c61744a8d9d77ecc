//! Cooperative run-to-completion scheduler.

use super::{Dispatch, Entry, Timebase};
use crate::util::list::List;
use crate::{Error, Result};

/// Registry of up to `N` active objects
pub struct Scheduler<'a, const N: usize> {
    registry: List<'a, Entry<'a>>,
    timebase: &'a Timebase<'a, N>,
    passes: u32,
}

impl<'a, const N: usize> Scheduler<'a, N> {
    pub fn new(timebase: &'a Timebase<'a, N>) -> Self {
        Self {
            registry: List::new(),
            timebase,
            passes: 0,
        }
    }

    /// Append an object to the registry and subscribe it to ticks
    ///
    /// # Returns
    /// * `Full` when `N` objects are registered, `Busy` if `ao` already is
    pub fn register(&mut self, ao: &'a dyn Dispatch<'a>) -> Result<()> {
        let link = ao.link();
        if link.is_linked() {
            return Err(Error::Busy);
        }
        if self.registry.len() >= N {
            log_warn!("registry full, active object {} rejected", ao.id());
            return Err(Error::Full);
        }
        if let Some((sink, divisor)) = ao.ticks() {
            self.timebase.subscribe(sink, divisor)?;
        }
        link.get().set(Some(ao));
        self.registry.push_back(link)?;
        log_info!("active object {} registered", ao.id());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// One pass over the registry: each enabled object handles at most one event
    ///
    /// Returns the number of events dispatched.
    pub fn run_once(&mut self) -> usize {
        self.passes = self.passes.wrapping_add(1);
        let mut dispatched = 0;
        for ao in self.registry.iter().filter_map(|node| node.get().get()) {
            if ao.is_enabled() && ao.dispatch_one() {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Passes completed since start
    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub fn timebase(&self) -> &'a Timebase<'a, N> {
        self.timebase
    }

    /// Run forever, sleeping until the next interrupt after an idle pass
    ///
    /// An event posted between the idle pass and the sleep waits for the
    /// next interrupt, at most one tick.
    pub fn run_forever(&mut self) -> ! {
        loop {
            if self.run_once() == 0 {
                wait_for_interrupt();
            }
        }
    }
}

#[cfg(target_arch = "arm")]
fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

#[cfg(not(target_arch = "arm"))]
fn wait_for_interrupt() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aof::{ActiveObject, Event, Mailbox, Post, StateMachine};
    use core::cell::RefCell;

    struct Recorder<'l> {
        name: char,
        log: &'l RefCell<String>,
    }

    impl StateMachine for Recorder<'_> {
        type Signal = ();

        fn dispatch(&mut self, event: Event<()>, _this: &dyn Post<()>) {
            let c = if event.is_tick() {
                self.name.to_ascii_lowercase()
            } else {
                self.name
            };
            self.log.borrow_mut().push(c);
        }
    }

    #[test]
    fn one_event_per_object_per_pass() {
        let log = RefCell::new(String::new());
        let (ma, mb): (Mailbox<Event<()>, 8>, Mailbox<Event<()>, 8>) = (Mailbox::new(), Mailbox::new());
        let a = ActiveObject::new(1, &ma, Recorder { name: 'A', log: &log }, 0);
        let b = ActiveObject::new(2, &mb, Recorder { name: 'B', log: &log }, 2);
        let tb: Timebase<'_, 2> = Timebase::new();
        let mut sched = Scheduler::new(&tb);
        sched.register(&a).unwrap();
        sched.register(&b).unwrap();
        assert_eq!(sched.register(&a), Err(Error::Busy));

        for _ in 0..3 {
            a.post(()).unwrap();
        }
        b.post(()).unwrap();
        tb.tick();
        tb.tick();
        assert_eq!(sched.run_once(), 2);
        assert_eq!(sched.run_once(), 2);
        assert_eq!(sched.run_once(), 1);
        assert_eq!(sched.run_once(), 0);
        assert_eq!(log.borrow().as_str(), "ABAbA");
        assert_eq!(sched.passes(), 4);
    }

    #[test]
    fn registry_capacity_and_disabled_objects() {
        let log = RefCell::new(String::new());
        let m: Mailbox<Event<()>, 2> = Mailbox::new();
        let a = ActiveObject::new(1, &m, Recorder { name: 'A', log: &log }, 0);
        let b = ActiveObject::new(2, &m, Recorder { name: 'B', log: &log }, 0);
        let tb: Timebase<'_, 1> = Timebase::new();
        let mut sched = Scheduler::new(&tb);
        sched.register(&a).unwrap();
        assert_eq!(sched.register(&b), Err(Error::Full));
        assert_eq!(sched.register(&a), Err(Error::Busy));
        assert_eq!(sched.len(), 1);

        a.set_enabled(false);
        a.post(()).unwrap();
        assert_eq!(sched.run_once(), 0);
        a.set_enabled(true);
        assert_eq!(sched.run_once(), 1);
    }
}
