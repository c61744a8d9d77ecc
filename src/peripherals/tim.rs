//! General-purpose and advanced-control timers.
//!
//! The counting period is deterministic:
//! `period_ns = (prescaler + 1) * (arr + 1) * 1e9 / f_timer`.

use super::{Bus, Clocks, Periph, Rcc};
use crate::registers::tim::{bdtr, cr1, dier, egr, sr, RegisterBlock};
use crate::registers::{
    addr, any_bits, clear_bits, read_bits, set_bits, write_bits, write_field,
};
use crate::{Error, Result};

/// Capture/compare channels per timer
pub const CHANNELS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CountMode {
    Up,
    Down,
    /// Centre-aligned, compare flags set while counting up and down
    Center,
}

/// Called from the timer interrupt on each update event
pub type UpdateHandler = fn();

/// Timer
pub struct Timer {
    regs: &'static RegisterBlock,
    kernel_clock: u32,
    wide: bool,
    advanced: bool,
    handler: Option<UpdateHandler>,
}

impl Timer {
    /// Take a timer and ungate its clock
    ///
    /// TIM2 and TIM5 have 32-bit counters; TIM1 and TIM8 need MOE for outputs.
    pub fn new(periph: Periph<RegisterBlock>, clocks: &Clocks, rcc: &Rcc) -> Self {
        rcc.enable(&periph);
        let kernel_clock = match periph.gate().bus {
            Bus::Apb2 => clocks.timclk2(),
            _ => clocks.timclk1(),
        };
        let index = periph.index();
        Self::init(
            periph.regs(),
            kernel_clock,
            matches!(index, 2 | 5),
            matches!(index, 1 | 8),
        )
    }

    fn init(regs: &'static RegisterBlock, kernel_clock: u32, wide: bool, advanced: bool) -> Self {
        Self {
            regs,
            kernel_clock,
            wide,
            advanced,
            handler: None,
        }
    }

    /// Program prescaler, auto-reload and counting mode; the counter stays stopped
    ///
    /// # Arguments
    /// * `prescaler` - Counter clock is `f_timer / (prescaler + 1)`
    /// * `period` - Auto-reload value; at most 0xFFFF on 16-bit timers
    /// * `mode` - Counting direction
    pub fn configure(&mut self, prescaler: u16, period: u32, mode: CountMode) -> Result<()> {
        if period == 0 || (!self.wide && period > 0xFFFF) {
            return Err(Error::InvalidArgument);
        }
        let r = self.regs;
        clear_bits!(r.cr1, cr1::CEN);
        let mode_bits = match mode {
            CountMode::Up => 0,
            CountMode::Down => cr1::DIR,
            CountMode::Center => 0b01 << cr1::CMS_SHIFT,
        };
        write_bits!(r.cr1, mode_bits | cr1::ARPE | cr1::URS);
        write_bits!(r.psc, prescaler as u32);
        write_bits!(r.arr, period);
        // Load PSC/ARR now instead of at the first overflow
        write_bits!(r.egr, egr::UG);
        write_bits!(r.sr, !sr::UIF);
        Ok(())
    }

    /// Counter input frequency in Hz
    pub fn tick_hz(&self) -> u32 {
        self.kernel_clock / (read_bits!(self.regs.psc) + 1)
    }

    /// Length of one counting period in nanoseconds
    pub fn period_ns(&self) -> u64 {
        let psc = read_bits!(self.regs.psc) as u64 + 1;
        let arr = read_bits!(self.regs.arr) as u64 + 1;
        psc * arr * 1_000_000_000 / self.kernel_clock as u64
    }

    /// Auto-reload value
    pub fn period(&self) -> u32 {
        read_bits!(self.regs.arr)
    }

    pub fn start(&mut self) {
        set_bits!(self.regs.cr1, cr1::CEN);
    }

    pub fn stop(&mut self) {
        clear_bits!(self.regs.cr1, cr1::CEN);
    }

    /// Install the update handler and enable the update interrupt
    pub fn on_update(&mut self, handler: UpdateHandler) {
        self.handler = Some(handler);
        set_bits!(self.regs.dier, dier::UIE);
    }

    /// Service the update interrupt. Returns `true` if an update was pending.
    pub fn on_interrupt(&mut self) -> bool {
        let r = self.regs;
        if !any_bits!(r.sr, sr::UIF) {
            return false;
        }
        // rc_w0: writing 1 leaves the other flags untouched
        write_bits!(r.sr, !sr::UIF);
        if let Some(handler) = self.handler {
            handler();
        }
        true
    }

    fn check(channel: u8) -> Result<u32> {
        if channel < CHANNELS {
            Ok(channel as u32)
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Replace the 8-bit CCMR byte of channel `ch`
    fn write_ccmr(&self, ch: u32, value: u32) {
        let r = self.regs;
        let shift = (ch % 2) * 8;
        if ch < 2 {
            write_field!(r.ccmr1_output(), shift, 8, value);
        } else {
            write_field!(r.ccmr2_output(), shift, 8, value);
        }
    }

    /// Put `channel` (0-3) in PWM mode 1 with preload and enable its output
    pub fn pwm_configure(&mut self, channel: u8) -> Result<()> {
        let ch = Self::check(channel)?;
        let r = self.regs;
        // CCxS = output, OCxPE, OCxM = 110
        self.write_ccmr(ch, (0b110 << 4) | (1 << 3));
        write_bits!(r.ccr[ch as usize], 0);
        set_bits!(r.ccer, 1 << (4 * ch));
        if self.advanced {
            set_bits!(r.bdtr, bdtr::MOE);
        }
        Ok(())
    }

    /// Set the compare value of a PWM channel, in counter ticks
    pub fn pwm_set_duty(&mut self, channel: u8, ticks: u32) -> Result<()> {
        let ch = Self::check(channel)?;
        if !self.wide && ticks > 0xFFFF {
            return Err(Error::InvalidArgument);
        }
        write_bits!(self.regs.ccr[ch as usize], ticks);
        Ok(())
    }

    /// Capture the counter on rising edges of the channel's own input
    pub fn input_capture_configure(&mut self, channel: u8) -> Result<()> {
        let ch = Self::check(channel)?;
        let r = self.regs;
        self.write_ccmr(ch, 0b01);
        set_bits!(r.ccer, 1 << (4 * ch));
        Ok(())
    }

    /// Last captured value and whether a capture was overwritten unread
    ///
    /// Reading clears both the capture and the overflow flag.
    pub fn input_capture_read(&mut self, channel: u8) -> Result<(u32, bool)> {
        let ch = Self::check(channel)?;
        let r = self.regs;
        let overflow = any_bits!(r.sr, sr::ccof(ch));
        let value = read_bits!(r.ccr[ch as usize]);
        if overflow {
            write_bits!(r.sr, !sr::ccof(ch));
        }
        Ok((value, overflow))
    }

    /// Issue a DMA request on each update (used to stream duty cycles)
    pub fn enable_update_dma(&mut self, enable: bool) {
        if enable {
            set_bits!(self.regs.dier, dier::UDE);
        } else {
            clear_bits!(self.regs.dier, dier::UDE);
        }
    }

    /// Address of a channel's compare register, as a DMA target
    pub fn ccr_addr(&self, channel: u8) -> Result<u32> {
        let ch = Self::check(channel)?;
        Ok(addr(&self.regs.ccr[ch as usize]))
    }
}

#[cfg(test)]
impl Timer {
    pub(crate) fn fake(kernel_clock: u32) -> Self {
        Self::init(crate::registers::fake(), kernel_clock, false, false)
    }

    pub(crate) fn update_dma_enabled(&self) -> bool {
        any_bits!(self.regs.dier, dier::UDE)
    }
}
