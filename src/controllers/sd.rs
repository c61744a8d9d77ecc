//! SD card controller.
//!
//! Brings the card up one command per tick and then works through read and
//! write requests a sector at a time. Each tick either starts the next
//! sector or checks on the one in flight, so waiting for a data token or for
//! the card to finish programming never holds up the scheduler. A fatal
//! error (card gone, timeout, bus fault) parks the controller in
//! [`SdState::Error`] until an explicit [`SdSignal::Reset`].
//!
//! With card detect enabled, the socket switch is sampled on every tick
//! through a [`Debouncer`]; a settled removal is handled like
//! [`SdSignal::CardRemoved`].

use super::is_fatal;
use crate::aof::{Event, Post, StateMachine};
use crate::drivers::sd::{CardType, NoSocket, SdCard, Socket, BLOCK_SIZE};
use crate::peripherals::{OutputPin, SpiBus, TickSource};
use crate::util::{DebounceConfig, Debouncer};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdSignal {
    /// Begin initialisation
    Start,
    /// Leave any state, forget the card and return to idle
    Reset,
    /// Card-detect switch opened
    CardRemoved,
    /// Read `count` sectors starting at `block`
    Read { block: u32, count: u32 },
    /// Write `count` sectors starting at `block`
    Write { block: u32, count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdState {
    Idle,
    Initialising,
    Ready,
    /// Next sector `block`, `end` exclusive
    Reading { block: u32, end: u32 },
    Writing { block: u32, end: u32 },
    Error(Error),
}

/// Notifications from the controller
#[derive(Clone, Copy, Default)]
pub struct SdCallbacks {
    /// Initialisation finished
    pub on_ready: Option<fn(CardType)>,
    /// One sector of a read request arrived
    pub on_sector_read: Option<fn(u32, &[u8])>,
    /// Supplies the contents of a sector about to be written
    pub fill_sector: Option<fn(u32, &mut [u8])>,
    /// A read or write request finished or was refused
    pub on_complete: Option<fn(Result<()>)>,
    /// The controller entered the error state
    pub on_error: Option<fn(Error)>,
}

/// Active-object wrapper of an [`SdCard`]
pub struct SdController<S, P, C, K = NoSocket> {
    card: SdCard<S, P, C, K>,
    state: SdState,
    callbacks: SdCallbacks,
    sector: [u8; BLOCK_SIZE],
    detect: Option<Debouncer>,
}

impl<S, P, C, K> SdController<S, P, C, K>
where
    S: SpiBus,
    P: OutputPin,
    C: TickSource,
    K: Socket,
{
    pub fn new(card: SdCard<S, P, C, K>, callbacks: SdCallbacks) -> Self {
        Self {
            card,
            state: SdState::Idle,
            callbacks,
            sector: [0; BLOCK_SIZE],
            detect: None,
        }
    }

    /// Watch the socket's card-detect switch on every tick
    pub fn with_card_detect(mut self, config: DebounceConfig) -> Self {
        self.detect = Some(Debouncer::new(config, self.card.card_present()));
        self
    }

    pub fn state(&self) -> SdState {
        self.state
    }

    pub fn card(&self) -> &SdCard<S, P, C, K> {
        &self.card
    }

    /// Direct driver access, e.g. for the disk-I/O layer while idle
    pub fn card_mut(&mut self) -> &mut SdCard<S, P, C, K> {
        &mut self.card
    }

    fn complete(&self, result: Result<()>) {
        if let Some(f) = self.callbacks.on_complete {
            f(result);
        }
    }

    fn fail(&mut self, error: Error) -> SdState {
        self.card.reset();
        if let Some(f) = self.callbacks.on_error {
            f(error);
        }
        SdState::Error(error)
    }

    /// End a transfer after a driver error
    fn abort(&mut self, error: Error) -> SdState {
        self.complete(Err(error));
        if is_fatal(error) {
            self.fail(error)
        } else {
            SdState::Ready
        }
    }

    /// Queue a transfer, or refuse it in the current state
    fn request(&mut self, block: u32, count: u32, write: bool) -> SdState {
        let refusal = match self.state {
            SdState::Ready => None,
            SdState::Idle | SdState::Error(_) => Some(Error::NotReady),
            _ => Some(Error::Busy),
        };
        if let Some(e) = refusal {
            self.complete(Err(e));
            return self.state;
        }
        let Some(end) = block.checked_add(count).filter(|_| count > 0) else {
            self.complete(Err(Error::InvalidArgument));
            return SdState::Ready;
        };
        if write {
            SdState::Writing { block, end }
        } else {
            SdState::Reading { block, end }
        }
    }

    fn step_init(&mut self) -> SdState {
        match self.card.init_step() {
            Ok(Some(card)) => {
                if let Some(f) = self.callbacks.on_ready {
                    f(card);
                }
                SdState::Ready
            }
            Ok(None) => SdState::Initialising,
            Err(e) => self.fail(e),
        }
    }

    fn step_read(&mut self, block: u32, end: u32) -> SdState {
        if !self.card.is_transferring() {
            if let Err(e) = self.card.begin_read(block) {
                return self.abort(e);
            }
        }
        match self.card.poll_read(&mut self.sector) {
            Ok(false) => self.state,
            Ok(true) => {
                if let Some(f) = self.callbacks.on_sector_read {
                    f(block, &self.sector);
                }
                self.advance(block, end, SdState::Reading { block: block + 1, end })
            }
            Err(e) => self.abort(e),
        }
    }

    fn step_write(&mut self, block: u32, end: u32) -> SdState {
        if !self.card.is_transferring() {
            if let Some(f) = self.callbacks.fill_sector {
                f(block, &mut self.sector);
            }
            if let Err(e) = self.card.begin_write(block, &self.sector) {
                return self.abort(e);
            }
        }
        match self.card.poll_write() {
            Ok(false) => self.state,
            Ok(true) => self.advance(block, end, SdState::Writing { block: block + 1, end }),
            Err(e) => self.abort(e),
        }
    }

    /// Sample the card-detect switch; `true` once a removal has settled
    fn card_removed(&mut self) -> bool {
        let present = self.card.card_present();
        let Some(detect) = self.detect.as_mut() else {
            return false;
        };
        match detect.update(present) {
            Some(false) => {
                log_warn!("SD card removed");
                true
            }
            Some(true) => {
                log_info!("SD card inserted");
                false
            }
            None => false,
        }
    }

    fn advance(&self, block: u32, end: u32, next: SdState) -> SdState {
        if block + 1 < end {
            return next;
        }
        self.complete(Ok(()));
        SdState::Ready
    }

    /// The state following `event`
    fn transition(&mut self, event: Event<SdSignal>) -> SdState {
        use SdSignal::*;
        match (self.state, event) {
            (_, Event::Signal(Reset)) => {
                self.card.reset();
                SdState::Idle
            }
            (SdState::Error(_), _) => self.state,
            (SdState::Idle, Event::Signal(Start)) => {
                self.card.reset();
                SdState::Initialising
            }
            (SdState::Idle, Event::Signal(CardRemoved)) => SdState::Idle,
            (_, Event::Signal(CardRemoved)) => {
                if matches!(self.state, SdState::Reading { .. } | SdState::Writing { .. }) {
                    self.complete(Err(Error::NoDevice));
                }
                self.fail(Error::NoDevice)
            }
            (_, Event::Signal(Read { block, count })) => self.request(block, count, false),
            (_, Event::Signal(Write { block, count })) => self.request(block, count, true),
            (SdState::Initialising, Event::Tick) => self.step_init(),
            (SdState::Reading { block, end }, Event::Tick) => self.step_read(block, end),
            (SdState::Writing { block, end }, Event::Tick) => self.step_write(block, end),
            (state, _) => state,
        }
    }
}

impl<S, P, C, K> StateMachine for SdController<S, P, C, K>
where
    S: SpiBus,
    P: OutputPin,
    C: TickSource,
    K: Socket,
{
    type Signal = SdSignal;

    fn dispatch(&mut self, event: Event<SdSignal>, this: &dyn Post<SdSignal>) {
        if matches!(event, Event::Tick) && self.card_removed() {
            if let Err(e) = this.post_signal(SdSignal::CardRemoved) {
                log_error!("SD card removal not queued: {:?}", e);
            }
        }
        let next = self.transition(event);
        if next != self.state {
            log_info!("SD controller: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aof::Mailbox;
    use crate::drivers::sd::SdConfig;
    use core::cell::Cell;
    use std::rc::Rc;
    use std::sync::Mutex;

    struct Ticker(Cell<u32>);

    impl TickSource for Ticker {
        fn now(&self) -> u32 {
            let t = self.0.get();
            self.0.set(t + 100);
            t
        }
    }

    struct Floating;

    impl SpiBus for Floating {
        fn exchange(&mut self, _tx: &[u8], rx: &mut [u8]) -> Result<()> {
            rx.fill(0xFF);
            Ok(())
        }

        fn set_frequency(&mut self, hz: u32) -> Result<u32> {
            Ok(hz)
        }
    }

    struct Cs;

    impl OutputPin for Cs {
        fn set_high(&mut self) {}
        fn set_low(&mut self) {}
    }

    struct Present;

    impl Socket for Present {}

    static LOG: Mutex<Vec<Result<()>>> = Mutex::new(Vec::new());

    fn record(result: Result<()>) {
        LOG.lock().unwrap().push(result);
    }

    fn controller() -> SdController<Floating, Cs, Ticker, Present> {
        let card = SdCard::new(Floating, Cs, Ticker(Cell::new(0)), SdConfig::default())
            .with_socket(Present);
        SdController::new(
            card,
            SdCallbacks {
                on_complete: Some(record),
                ..Default::default()
            },
        )
    }

    fn run(ctl: &mut SdController<Floating, Cs, Ticker, Present>, event: Event<SdSignal>) {
        let mb: Mailbox<Event<SdSignal>, 1> = Mailbox::new();
        ctl.dispatch(event, &mb);
    }

    #[test]
    fn missing_card_ends_in_error_until_reset() {
        let mut ctl = controller();
        run(&mut ctl, Event::Tick);
        assert_eq!(ctl.state(), SdState::Idle);

        run(&mut ctl, Event::Signal(SdSignal::Start));
        assert_eq!(ctl.state(), SdState::Initialising);
        for _ in 0..20 {
            run(&mut ctl, Event::Tick);
        }
        assert_eq!(ctl.state(), SdState::Error(Error::NoDevice));

        // Only Reset leaves the error state
        run(&mut ctl, Event::Signal(SdSignal::Start));
        assert_eq!(ctl.state(), SdState::Error(Error::NoDevice));
        run(&mut ctl, Event::Signal(SdSignal::Reset));
        assert_eq!(ctl.state(), SdState::Idle);
    }

    #[test]
    fn requests_outside_ready_are_refused() {
        LOG.lock().unwrap().clear();
        let mut ctl = controller();
        run(&mut ctl, Event::Signal(SdSignal::Read { block: 0, count: 1 }));
        assert_eq!(ctl.state(), SdState::Idle);

        ctl.state = SdState::Ready;
        run(&mut ctl, Event::Signal(SdSignal::Write { block: 0, count: 0 }));
        assert_eq!(ctl.state(), SdState::Ready);
        run(&mut ctl, Event::Signal(SdSignal::Read { block: 7, count: 2 }));
        assert_eq!(ctl.state(), SdState::Reading { block: 7, end: 9 });
        run(&mut ctl, Event::Signal(SdSignal::Read { block: 0, count: 1 }));

        run(&mut ctl, Event::Signal(SdSignal::CardRemoved));
        assert_eq!(ctl.state(), SdState::Error(Error::NoDevice));
        let expected: [Result<()>; 4] = [
            Err(Error::NotReady),
            Err(Error::InvalidArgument),
            Err(Error::Busy),
            Err(Error::NoDevice),
        ];
        assert_eq!(*LOG.lock().unwrap(), expected);
    }

    struct Switch(Rc<Cell<bool>>);

    impl Socket for Switch {
        fn card_present(&self) -> bool {
            self.0.get()
        }
    }

    #[test]
    fn settled_removal_raises_card_removed() {
        let present = Rc::new(Cell::new(true));
        let card = SdCard::new(Floating, Cs, Ticker(Cell::new(0)), SdConfig::default())
            .with_socket(Switch(present.clone()));
        let mut ctl = SdController::new(card, SdCallbacks::default())
            .with_card_detect(DebounceConfig { samples: 3 });
        ctl.state = SdState::Ready;
        let mb: Mailbox<Event<SdSignal>, 4> = Mailbox::new();

        // Contact bounce settles back to present
        present.set(false);
        ctl.dispatch(Event::Tick, &mb);
        ctl.dispatch(Event::Tick, &mb);
        present.set(true);
        ctl.dispatch(Event::Tick, &mb);
        assert!(mb.is_empty());

        present.set(false);
        for _ in 0..5 {
            ctl.dispatch(Event::Tick, &mb);
        }
        assert_eq!(mb.take(), Some(Event::Signal(SdSignal::CardRemoved)));
        assert!(mb.is_empty());

        ctl.dispatch(Event::Signal(SdSignal::CardRemoved), &mb);
        assert_eq!(ctl.state(), SdState::Error(Error::NoDevice));
    }
}
