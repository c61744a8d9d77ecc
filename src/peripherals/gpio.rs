//! General-purpose I/O.
//!
//! A [`Port`] owns one GPIO register block and hands out each of its sixteen
//! pins at most once. Level writes go through BSRR, so updating one pin never
//! disturbs a concurrent update of another pin on the same port.

use super::traits::{InputPin, OutputPin};
use super::{Periph, Rcc};
use crate::registers::gpio::RegisterBlock;
use crate::registers::{any_bits, write_bits, write_field};
use crate::{Error, Result};

/// Pins per port
pub const PINS: u8 = 16;

/// Pin function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    Input,
    Output,
    /// Alternate function selector 0-15
    Alternate(u8),
    Analog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Drive {
    PushPull,
    OpenDrain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pull {
    None,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    Low,
    Medium,
    High,
    VeryHigh,
}

/// Electrical configuration of one pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PinConfig {
    pub mode: Mode,
    pub drive: Drive,
    pub pull: Pull,
    pub speed: Speed,
}

impl Default for PinConfig {
    /// Floating input, the reset state of most pins
    fn default() -> Self {
        Self {
            mode: Mode::Input,
            drive: Drive::PushPull,
            pull: Pull::None,
            speed: Speed::Low,
        }
    }
}

impl PinConfig {
    pub fn input(pull: Pull) -> Self {
        Self {
            pull,
            ..Default::default()
        }
    }

    pub fn output() -> Self {
        Self {
            mode: Mode::Output,
            speed: Speed::High,
            ..Default::default()
        }
    }

    pub fn open_drain() -> Self {
        Self {
            mode: Mode::Output,
            drive: Drive::OpenDrain,
            pull: Pull::Up,
            speed: Speed::High,
        }
    }

    pub fn alternate(af: u8) -> Self {
        Self {
            mode: Mode::Alternate(af),
            speed: Speed::VeryHigh,
            ..Default::default()
        }
    }

    pub fn analog() -> Self {
        Self {
            mode: Mode::Analog,
            ..Default::default()
        }
    }

    pub fn with_drive(mut self, drive: Drive) -> Self {
        self.drive = drive;
        self
    }

    pub fn with_pull(mut self, pull: Pull) -> Self {
        self.pull = pull;
        self
    }
}

/// One GPIO port and the set of pins already handed out
pub struct Port {
    periph: Periph<RegisterBlock>,
    claimed: u16,
}

impl Port {
    /// Take ownership of a port and ungate its clock
    pub fn new(periph: Periph<RegisterBlock>, rcc: &Rcc) -> Self {
        rcc.enable(&periph);
        Self { periph, claimed: 0 }
    }

    /// Configure and hand out a pin
    ///
    /// # Arguments
    /// * `index` - Pin number 0-15
    /// * `config` - Electrical configuration
    ///
    /// # Returns
    /// * The pin handle
    /// * `InvalidArgument` for an index or alternate function out of range
    /// * `Busy` if the pin was already handed out
    pub fn pin(&mut self, index: u8, config: PinConfig) -> Result<Pin> {
        if index >= PINS {
            return Err(Error::InvalidArgument);
        }
        if self.claimed & (1 << index) != 0 {
            return Err(Error::Busy);
        }
        let mut pin = Pin {
            regs: self.periph.regs(),
            port: self.periph.index(),
            index,
        };
        pin.configure(config)?;
        self.claimed |= 1 << index;
        Ok(pin)
    }

    /// Port number (0 = A)
    pub fn index(&self) -> u8 {
        self.periph.index()
    }
}

/// A configured pin
///
/// Runtime operations assume the handle was validated by [`Port::pin`].
pub struct Pin {
    regs: &'static RegisterBlock,
    port: u8,
    index: u8,
}

impl Pin {
    /// Reconfigure the pin (used by bus recovery to borrow I2C lines)
    pub fn configure(&mut self, config: PinConfig) -> Result<()> {
        let n = self.index as u32;
        let mode = match config.mode {
            Mode::Input => 0b00,
            Mode::Output => 0b01,
            Mode::Alternate(af) if af < 16 => 0b10,
            Mode::Alternate(_) => return Err(Error::InvalidArgument),
            Mode::Analog => 0b11,
        };
        let drive = match config.drive {
            Drive::PushPull => 0,
            Drive::OpenDrain => 1,
        };
        let pull = match config.pull {
            Pull::None => 0b00,
            Pull::Up => 0b01,
            Pull::Down => 0b10,
        };
        let speed = config.speed as u32;

        let r = self.regs;
        critical_section::with(|_| {
            if let Mode::Alternate(af) = config.mode {
                let shift = (n % 8) * 4;
                if n < 8 {
                    write_field!(r.afrl, shift, 4, af as u32);
                } else {
                    write_field!(r.afrh, shift, 4, af as u32);
                }
            }
            write_field!(r.otyper, n, 1, drive);
            write_field!(r.ospeedr, n * 2, 2, speed);
            write_field!(r.pupdr, n * 2, 2, pull);
            write_field!(r.moder, n * 2, 2, mode);
        });
        Ok(())
    }

    /// Drive the output level
    #[inline]
    pub fn write(&mut self, high: bool) {
        let bit = if high {
            1 << self.index
        } else {
            1 << (self.index + 16)
        };
        write_bits!(self.regs.bsrr, bit);
    }

    /// Sampled input level
    #[inline]
    pub fn read(&self) -> bool {
        any_bits!(self.regs.idr, 1 << self.index)
    }

    /// Level the output latch is driving
    #[inline]
    pub fn is_set_high(&self) -> bool {
        any_bits!(self.regs.odr, 1 << self.index)
    }

    #[inline]
    pub fn toggle(&mut self) {
        let high = self.is_set_high();
        self.write(!high);
    }

    /// Port number (0 = A)
    pub fn port(&self) -> u8 {
        self.port
    }

    /// Pin number within the port
    pub fn index(&self) -> u8 {
        self.index
    }
}

impl OutputPin for Pin {
    fn set_high(&mut self) {
        self.write(true);
    }

    fn set_low(&mut self) {
        self.write(false);
    }
}

impl InputPin for Pin {
    fn is_high(&self) -> bool {
        self.read()
    }
}
