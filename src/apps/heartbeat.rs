//! Status LED.
//!
//! Blinks slowly while waiting for the GPS, fast once a fix arrives and
//! stays lit after a storage fault. Other objects post [`Beat`] signals from
//! their controller callbacks. An optional WS2812 pixel mirrors the state in
//! colour.

use stm32f4_aof::aof::{Event, Post, StateMachine};
use stm32f4_aof::drivers::ws2812::{Rgb, Ws2812Strip};
use stm32f4_aof::peripherals::OutputPin;
use stm32f4_aof::{log_info, log_warn};

/// Half-period in heartbeat ticks while searching
const SLOW: u32 = 10;
/// Half-period once the GPS has a fix
const FAST: u32 = 2;

const SEARCHING: Rgb = Rgb::new(255, 160, 0);
const TRACKING: Rgb = Rgb::new(0, 255, 0);
const FAULT: Rgb = Rgb::new(255, 0, 0);
/// Pixel brightness out of 255
const LEVEL: u8 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Beat {
    Fix,
    Lost,
    Fault,
}

pub struct Heartbeat<P> {
    led: P,
    half_period: u32,
    count: u32,
    lit: bool,
    fault: bool,
    pixel: Option<Ws2812Strip>,
}

impl<P: OutputPin> Heartbeat<P> {
    pub fn new(mut led: P) -> Self {
        led.set_low();
        Self {
            led,
            half_period: SLOW,
            count: 0,
            lit: false,
            fault: false,
            pixel: None,
        }
    }

    /// Mirror the state on a one-pixel WS2812 strip
    pub fn with_pixel(mut self, strip: Ws2812Strip) -> Self {
        self.pixel = Some(strip);
        self.paint(SEARCHING);
        self
    }

    fn paint(&mut self, colour: Rgb) {
        if let Some(strip) = self.pixel.as_mut() {
            if let Err(e) = strip.show(&[colour.dimmed(LEVEL)]) {
                log_warn!("status pixel: {:?}", e);
            }
        }
    }

    fn show(&mut self, lit: bool) {
        self.lit = lit;
        if lit {
            self.led.set_high();
        } else {
            self.led.set_low();
        }
    }
}

impl<P: OutputPin> StateMachine for Heartbeat<P> {
    type Signal = Beat;

    fn dispatch(&mut self, event: Event<Beat>, _this: &dyn Post<Beat>) {
        match event {
            Event::Tick if !self.fault => {
                self.count += 1;
                if self.count >= self.half_period {
                    self.count = 0;
                    self.show(!self.lit);
                }
            }
            Event::Tick => {}
            Event::Signal(Beat::Fix) => {
                self.half_period = FAST;
                if !self.fault {
                    self.paint(TRACKING);
                }
            }
            Event::Signal(Beat::Lost) => {
                self.half_period = SLOW;
                if !self.fault {
                    self.paint(SEARCHING);
                }
            }
            Event::Signal(Beat::Fault) => {
                log_info!("heartbeat: storage fault");
                self.fault = true;
                self.show(true);
                self.paint(FAULT);
            }
        }
    }
}
