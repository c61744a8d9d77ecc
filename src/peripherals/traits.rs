//! Seams between the HAL and the device drivers.
//!
//! Drivers are generic over these traits so that they run unchanged on the
//! STM32 peripherals and against host-side stubs.

use crate::Result;

/// Full-duplex SPI master
pub trait SpiBus {
    /// Clock out `tx` while filling `rx`. Both slices have the same length.
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()>;

    /// Change the SCK frequency, returning the frequency actually selected
    fn set_frequency(&mut self, hz: u32) -> Result<u32>;

    /// Exchange a single byte
    fn transfer_byte(&mut self, byte: u8) -> Result<u8> {
        let mut rx = [0u8; 1];
        self.exchange(&[byte], &mut rx)?;
        Ok(rx[0])
    }

    /// Clock out `tx`, discarding whatever comes back
    fn write(&mut self, tx: &[u8]) -> Result<()> {
        for &byte in tx {
            self.transfer_byte(byte)?;
        }
        Ok(())
    }

    /// Fill `rx` while holding MOSI high (0xFF)
    fn read(&mut self, rx: &mut [u8]) -> Result<()> {
        for slot in rx.iter_mut() {
            *slot = self.transfer_byte(0xFF)?;
        }
        Ok(())
    }
}

/// Push-pull or open-drain output
pub trait OutputPin {
    fn set_high(&mut self);
    fn set_low(&mut self);

    fn set(&mut self, high: bool) {
        if high {
            self.set_high()
        } else {
            self.set_low()
        }
    }
}

/// Digital input
pub trait InputPin {
    fn is_high(&self) -> bool;

    fn is_low(&self) -> bool {
        !self.is_high()
    }
}

/// Byte-oriented serial link
pub trait SerialPort {
    /// Queue `bytes` for transmission
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Move up to `buf.len()` received bytes into `buf`, returning the count
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// Monotonic tick counter, wrapping at `u32::MAX`
pub trait TickSource {
    fn now(&self) -> u32;
}

impl<T: TickSource + ?Sized> TickSource for &T {
    fn now(&self) -> u32 {
        (**self).now()
    }
}

/// Point in tick time after which an operation is abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Deadline {
    start: u32,
    ticks: u32,
}

impl Deadline {
    /// Deadline `ticks` after the current time of `clock`
    pub fn after<C: TickSource + ?Sized>(clock: &C, ticks: u32) -> Self {
        Self {
            start: clock.now(),
            ticks,
        }
    }

    /// Deadline `ticks` after the tick value `start`
    pub const fn starting_at(start: u32, ticks: u32) -> Self {
        Self { start, ticks }
    }

    /// `true` once `ticks` have elapsed; correct across counter wrap
    pub fn expired_at(&self, now: u32) -> bool {
        now.wrapping_sub(self.start) >= self.ticks
    }

    pub fn expired<C: TickSource + ?Sized>(&self, clock: &C) -> bool {
        self.expired_at(clock.now())
    }

    /// Ticks left before expiry, zero once expired
    pub fn remaining_at(&self, now: u32) -> u32 {
        self.ticks.saturating_sub(now.wrapping_sub(self.start))
    }
}
