//! WS2812 addressable LEDs driven by timer PWM with DMA.
//!
//! Each data bit is one PWM period at 800 kHz. A short high time encodes 0
//! and a long one encodes 1. The DMA stream reloads the compare register
//! from a buffer of duty values on every update event; trailing zero slots
//! hold the line low long enough to latch the colours.

use crate::peripherals::dma::{Descriptor, Direction, Priority, Stream, Width};
use crate::peripherals::tim::{CountMode, Timer};
use crate::{Error, Result};

/// Line timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ws2812Timing {
    pub bit_hz: u32,
    /// High time of a 0 bit
    pub t0h_ns: u32,
    /// High time of a 1 bit
    pub t1h_ns: u32,
    /// Low time that latches the shifted data
    pub latch_ns: u32,
}

impl Default for Ws2812Timing {
    fn default() -> Self {
        Self {
            bit_hz: 800_000,
            t0h_ns: 350,
            t1h_ns: 700,
            latch_ns: 50_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Scale all channels by `level / 255`
    pub fn dimmed(self, level: u8) -> Self {
        let scale = |c: u8| ((c as u16 * level as u16 + 127) / 255) as u8;
        Self::new(scale(self.r), scale(self.g), scale(self.b))
    }
}

/// Bits per LED
pub const SLOTS_PER_LED: usize = 24;

/// Colour to duty-slot encoder for a given timer clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ws2812 {
    /// Auto-reload value for one bit period
    reload: u32,
    zero: u16,
    one: u16,
    latch_slots: usize,
}

fn ns_to_ticks(ns: u32, hz: u32) -> u64 {
    (ns as u64 * hz as u64 + 500_000_000) / 1_000_000_000
}

impl Ws2812 {
    /// # Arguments
    /// * `timer_hz` - Counter clock of the PWM timer
    /// * `timing` - Bit and latch timing of the LEDs
    ///
    /// # Returns
    /// * `InvalidArgument` if the timer is too slow to tell 0 from 1
    pub fn new(timer_hz: u32, timing: Ws2812Timing) -> Result<Self> {
        if timing.bit_hz == 0 {
            return Err(Error::InvalidArgument);
        }
        let period = (timer_hz / timing.bit_hz) as u64;
        let zero = ns_to_ticks(timing.t0h_ns, timer_hz);
        let one = ns_to_ticks(timing.t1h_ns, timer_hz);
        if zero == 0 || one <= zero || one >= period || period > u16::MAX as u64 {
            return Err(Error::InvalidArgument);
        }
        let bit_ns = 1_000_000_000u64 / timing.bit_hz as u64;
        let latch_slots = (timing.latch_ns as u64).div_ceil(bit_ns) as usize;
        Ok(Self {
            reload: (period - 1) as u32,
            zero: zero as u16,
            one: one as u16,
            latch_slots,
        })
    }

    pub fn reload(&self) -> u32 {
        self.reload
    }

    /// Compare values for a 0 and a 1 bit
    pub fn duties(&self) -> (u16, u16) {
        (self.zero, self.one)
    }

    pub fn latch_slots(&self) -> usize {
        self.latch_slots
    }

    /// Buffer length for `leds` LEDs including the latch
    pub fn slots_needed(&self, leds: usize) -> usize {
        leds * SLOTS_PER_LED + self.latch_slots
    }

    /// Fill `out` with duty values, GRB order, most significant bit first
    ///
    /// # Returns
    /// * The number of slots used, or `InvalidArgument` if `out` is short
    pub fn encode(&self, pixels: &[Rgb], out: &mut [u16]) -> Result<usize> {
        let n = self.slots_needed(pixels.len());
        let out = out.get_mut(..n).ok_or(Error::InvalidArgument)?;
        let (data, latch) = out.split_at_mut(pixels.len() * SLOTS_PER_LED);
        for (slots, px) in data.chunks_exact_mut(SLOTS_PER_LED).zip(pixels) {
            let grb = ((px.g as u32) << 16) | ((px.r as u32) << 8) | px.b as u32;
            for (i, slot) in slots.iter_mut().enumerate() {
                let bit = (grb >> (SLOTS_PER_LED - 1 - i)) & 1;
                *slot = if bit == 1 { self.one } else { self.zero };
            }
        }
        latch.fill(0);
        Ok(n)
    }
}

/// LED strip on one timer channel, fed by a DMA stream
pub struct Ws2812Strip {
    timer: Timer,
    stream: Stream,
    channel: u8,
    request: u8,
    encoder: Ws2812,
    buf: &'static mut [u16],
}

impl Ws2812Strip {
    /// Set up the timer for PWM at the bit rate, with DMA on update
    ///
    /// # Arguments
    /// * `timer` - Timer whose `channel` output is wired to the data line
    /// * `stream` - DMA stream serving the timer's update request
    /// * `request` - DMA request channel (CHSEL) of that stream
    /// * `buf` - Duty buffer, at least [`Ws2812::slots_needed`] long
    pub fn new(
        mut timer: Timer,
        stream: Stream,
        channel: u8,
        request: u8,
        timing: Ws2812Timing,
        buf: &'static mut [u16],
    ) -> Result<Self> {
        timer.configure(0, 1, CountMode::Up)?;
        let encoder = Ws2812::new(timer.tick_hz(), timing)?;
        timer.configure(0, encoder.reload(), CountMode::Up)?;
        timer.pwm_configure(channel)?;
        timer.enable_update_dma(true);
        log_debug!(
            "WS2812 on channel {}: reload {}, latch {} slots",
            channel,
            encoder.reload(),
            encoder.latch_slots()
        );
        Ok(Self {
            timer,
            stream,
            channel,
            request,
            encoder,
            buf,
        })
    }

    /// LEDs that fit in the buffer
    pub fn capacity(&self) -> usize {
        self.buf.len().saturating_sub(self.encoder.latch_slots()) / SLOTS_PER_LED
    }

    /// `true` while the previous frame is still being clocked out
    pub fn is_busy(&self) -> bool {
        self.stream.is_busy()
    }

    /// Encode `pixels` and start shifting them out
    ///
    /// # Returns
    /// * `Busy` while the previous frame is in flight
    /// * `InvalidArgument` if the strip buffer is too small
    pub fn show(&mut self, pixels: &[Rgb]) -> Result<()> {
        if self.stream.is_busy() {
            return Err(Error::Busy);
        }
        let count = self.encoder.encode(pixels, self.buf)?;
        let descriptor = Descriptor {
            channel: self.request,
            direction: Direction::MemoryToPeripheral,
            peripheral: self.timer.ccr_addr(self.channel)?,
            memory: self.buf.as_ptr() as usize as u32,
            count: u16::try_from(count).map_err(|_| Error::InvalidArgument)?,
            width: Width::HalfWord,
            memory_increment: true,
            peripheral_increment: false,
            circular: false,
            priority: Priority::High,
            half_transfer: false,
        };
        // The buffer is owned by the strip and untouched until the stream idles
        unsafe { self.stream.configure(&descriptor)? };
        self.timer.pwm_set_duty(self.channel, 0)?;
        self.stream.start()?;
        self.timer.start();
        Ok(())
    }
}
