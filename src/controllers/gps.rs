//! GPS receiver controller.
//!
//! Uploads the configuration list step by step, then polls the receiver on
//! every tick or `DataReady` signal and reports new fixes and staleness.
//! The first valid fix after `Start` becomes home; later fixes carry their
//! great-circle offset from it.

use crate::aof::{Event, Post, StateMachine};
use crate::drivers::gps::{Fix, Gps, UbxMessage, UploadStatus};
use crate::peripherals::{SerialPort, TickSource};
use crate::util::nav;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpsSignal {
    /// Upload the configuration and start tracking
    Start,
    /// Drop all state and return to idle
    Reset,
    /// The UART saw an idle line; bytes are waiting
    DataReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpsState {
    Idle,
    Configuring,
    Running,
    Error(Error),
}

/// Position relative to the home fix
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HomeOffset {
    pub distance_m: f32,
    /// Initial great-circle bearing from home, 0-360
    pub bearing_deg: f32,
}

#[derive(Clone, Copy, Default)]
pub struct GpsCallbacks {
    /// Every configuration message was acknowledged
    pub on_configured: Option<fn()>,
    /// A position report updated the fix
    pub on_fix: Option<fn(&Fix)>,
    /// No valid GGA within the stale timeout; fires once per outage
    pub on_stale: Option<fn()>,
    pub on_error: Option<fn(Error)>,
}

/// Active-object wrapper of a [`Gps`] driver
pub struct GpsController<U, C> {
    gps: Gps<U, C>,
    messages: &'static [UbxMessage],
    state: GpsState,
    callbacks: GpsCallbacks,
    seen_fixes: u32,
    stale: bool,
    /// Latitude and longitude of the home fix, degrees x 1e7
    home: Option<(i32, i32)>,
    offset: Option<HomeOffset>,
}

impl<U: SerialPort, C: TickSource> GpsController<U, C> {
    /// # Arguments
    /// * `gps` - Driver for the receiver
    /// * `messages` - UBX configuration sent on `Start`, in order
    /// * `callbacks` - Notifications
    pub fn new(gps: Gps<U, C>, messages: &'static [UbxMessage], callbacks: GpsCallbacks) -> Self {
        Self {
            gps,
            messages,
            state: GpsState::Idle,
            callbacks,
            seen_fixes: 0,
            stale: false,
            home: None,
            offset: None,
        }
    }

    pub fn state(&self) -> GpsState {
        self.state
    }

    /// Offset of the latest fix from home, once home is set
    pub fn home_offset(&self) -> Option<HomeOffset> {
        self.offset
    }

    pub fn gps(&self) -> &Gps<U, C> {
        &self.gps
    }

    pub fn gps_mut(&mut self) -> &mut Gps<U, C> {
        &mut self.gps
    }

    fn fail(&mut self, error: Error) -> GpsState {
        if let Some(f) = self.callbacks.on_error {
            f(error);
        }
        GpsState::Error(error)
    }

    fn start(&mut self) -> GpsState {
        if let Err(e) = self.gps.begin_config(self.messages) {
            return self.fail(e);
        }
        self.configure()
    }

    fn configure(&mut self) -> GpsState {
        match self.gps.upload_step() {
            UploadStatus::InProgress => GpsState::Configuring,
            UploadStatus::Done => {
                if let Some(f) = self.callbacks.on_configured {
                    f();
                }
                self.seen_fixes = self.gps.fix_count();
                self.stale = false;
                GpsState::Running
            }
            UploadStatus::Failed(e) => self.fail(e),
            UploadStatus::Idle => GpsState::Idle,
        }
    }

    fn track(&mut self) -> GpsState {
        self.gps.poll();
        let count = self.gps.fix_count();
        if count != self.seen_fixes {
            self.seen_fixes = count;
            if let Some(fix) = self.gps.fix() {
                self.update_home(&fix);
                if let Some(f) = self.callbacks.on_fix {
                    f(&fix);
                }
            }
        }
        let stale = self.gps.is_stale();
        if stale && !self.stale {
            log_warn!("GPS fix stale");
            if let Some(f) = self.callbacks.on_stale {
                f();
            }
        }
        self.stale = stale;
        GpsState::Running
    }

    fn update_home(&mut self, fix: &Fix) {
        if !fix.quality.is_valid() {
            return;
        }
        let (home_lat, home_lon) = *self.home.get_or_insert_with(|| {
            log_info!("GPS home set");
            (fix.latitude, fix.longitude)
        });
        let (distance_m, bearing_deg) =
            nav::distance_bearing_e7(home_lat, home_lon, fix.latitude, fix.longitude);
        self.offset = Some(HomeOffset {
            distance_m,
            bearing_deg,
        });
    }

    fn transition(&mut self, event: Event<GpsSignal>) -> GpsState {
        match (self.state, event) {
            (_, Event::Signal(GpsSignal::Reset)) => {
                self.gps.reset();
                self.home = None;
                self.offset = None;
                GpsState::Idle
            }
            (GpsState::Idle, Event::Signal(GpsSignal::Start)) => self.start(),
            (GpsState::Configuring, Event::Tick | Event::Signal(GpsSignal::DataReady)) => {
                self.configure()
            }
            (GpsState::Running, Event::Tick | Event::Signal(GpsSignal::DataReady)) => {
                self.track()
            }
            (state, _) => state,
        }
    }
}

impl<U: SerialPort, C: TickSource> StateMachine for GpsController<U, C> {
    type Signal = GpsSignal;

    fn dispatch(&mut self, event: Event<GpsSignal>, _this: &dyn Post<GpsSignal>) {
        let next = self.transition(event);
        if next != self.state {
            log_info!("GPS controller: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aof::Mailbox;
    use crate::drivers::gps::GpsConfig;
    use crate::Result;
    use core::cell::Cell;
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Port {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl SerialPort for Port {
        fn write(&mut self, bytes: &[u8]) -> Result<()> {
            self.tx.extend_from_slice(bytes);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> usize {
            let n = buf.len().min(self.rx.len());
            for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
                *slot = byte;
            }
            n
        }
    }

    struct Clock(Cell<u32>);

    impl TickSource for Clock {
        fn now(&self) -> u32 {
            self.0.get()
        }
    }

    static FIXES: AtomicU32 = AtomicU32::new(0);
    static STALE: AtomicU32 = AtomicU32::new(0);

    fn on_fix(fix: &Fix) {
        assert_eq!(fix.satellites, 8);
        FIXES.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stale() {
        STALE.fetch_add(1, Ordering::SeqCst);
    }

    fn run<U: SerialPort, C: TickSource>(ctl: &mut GpsController<U, C>, event: Event<GpsSignal>) {
        let mb: Mailbox<Event<GpsSignal>, 1> = Mailbox::new();
        ctl.dispatch(event, &mb);
    }

    #[test]
    fn empty_config_runs_and_reports_fixes() {
        let clock = Clock(Cell::new(0));
        let gps = Gps::new(Port::default(), &clock, GpsConfig::default());
        let mut ctl = GpsController::new(
            gps,
            &[],
            GpsCallbacks {
                on_fix: Some(on_fix),
                on_stale: Some(on_stale),
                ..Default::default()
            },
        );
        run(&mut ctl, Event::Tick);
        assert_eq!(ctl.state(), GpsState::Idle);
        run(&mut ctl, Event::Signal(GpsSignal::Start));
        assert_eq!(ctl.state(), GpsState::Running);

        // Stale until the first GGA, reported once
        run(&mut ctl, Event::Tick);
        run(&mut ctl, Event::Tick);
        assert_eq!(STALE.load(Ordering::SeqCst), 1);

        ctl.gps_mut().uart_mut().rx.extend(
            b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n",
        );
        run(&mut ctl, Event::Signal(GpsSignal::DataReady));
        assert_eq!(FIXES.load(Ordering::SeqCst), 1);
        run(&mut ctl, Event::Tick);
        assert_eq!(FIXES.load(Ordering::SeqCst), 1);

        clock.0.set(2500);
        run(&mut ctl, Event::Tick);
        assert_eq!(STALE.load(Ordering::SeqCst), 2);

        run(&mut ctl, Event::Signal(GpsSignal::Reset));
        assert_eq!(ctl.state(), GpsState::Idle);
        assert!(ctl.gps().fix().is_none());
    }

    #[test]
    fn later_fixes_are_measured_from_home() {
        let clock = Clock(Cell::new(0));
        let gps = Gps::new(Port::default(), &clock, GpsConfig::default());
        let mut ctl = GpsController::new(gps, &[], GpsCallbacks::default());
        run(&mut ctl, Event::Signal(GpsSignal::Start));
        assert_eq!(ctl.home_offset(), None);

        ctl.gps_mut().uart_mut().rx.extend(
            b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n",
        );
        run(&mut ctl, Event::Signal(GpsSignal::DataReady));
        let offset = ctl.home_offset().unwrap();
        assert!(offset.distance_m < 0.5);

        // One arc minute due north
        ctl.gps_mut().uart_mut().rx.extend(
            b"$GPGGA,123520,4808.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*42\r\n",
        );
        run(&mut ctl, Event::Signal(GpsSignal::DataReady));
        let offset = ctl.home_offset().unwrap();
        assert!((offset.distance_m - 1853.0).abs() < 5.0, "{offset:?}");
        assert!(offset.bearing_deg < 0.5 || offset.bearing_deg > 359.5);

        run(&mut ctl, Event::Signal(GpsSignal::Reset));
        assert_eq!(ctl.home_offset(), None);
    }
}
