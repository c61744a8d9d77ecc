//! 12-bit ADC, right-aligned.
//!
//! Single conversions poll EOC for one channel. A scan sequence built with
//! [`Adc::config_channel`] can be streamed into a caller buffer by DMA
//! (ADC1 on DMA2 stream 0 channel 0).

use super::dma::{Descriptor, Direction, Priority, Stream, Width};
use super::{wait_flag, Clocks, Periph, Rcc};
use crate::registers::adc::{ccr, cr1, cr2, sr, CommonRegisterBlock, RegisterBlock};
use crate::registers::{
    addr, any_bits, clear_bits, read_bits, set_bits, write_bits, write_field,
};
use crate::{Error, Result};

/// Highest channel number (16 = temperature, 17 = Vrefint, 18 = Vbat)
pub const MAX_CHANNEL: u8 = 18;
/// Longest regular sequence
pub const MAX_RANK: u8 = 16;
const ADC_CLOCK_MAX: u32 = 36_000_000;

/// Sampling time in ADC clock cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleTime {
    Cycles3,
    Cycles15,
    Cycles28,
    Cycles56,
    Cycles84,
    Cycles112,
    Cycles144,
    Cycles480,
}

/// ADC with its regular conversion sequence
pub struct Adc {
    regs: &'static RegisterBlock,
    length: u8,
    dma: Option<(Stream, u8)>,
    scan: Option<&'static mut [u16]>,
}

impl Adc {
    /// Power up an ADC with the prescaler keeping its clock within 36 MHz
    pub fn new(
        periph: Periph<RegisterBlock>,
        common: Periph<CommonRegisterBlock>,
        clocks: &Clocks,
        rcc: &Rcc,
    ) -> Self {
        rcc.enable(&periph);
        let divider = (0..4u32)
            .find(|&pre| clocks.pclk2 / (2 * (pre + 1)) <= ADC_CLOCK_MAX)
            .unwrap_or(3);
        write_field!(common.regs().ccr, ccr::ADCPRE_SHIFT, 2, divider);
        Self::init(periph.regs())
    }

    fn init(regs: &'static RegisterBlock) -> Self {
        // 12-bit resolution, right alignment
        write_field!(regs.cr1, cr1::RES_SHIFT, 2, 0);
        write_bits!(regs.cr2, cr2::ADON);
        Self {
            regs,
            length: 0,
            dma: None,
            scan: None,
        }
    }

    /// Bind the DMA stream used by [`Adc::start_scan`]
    pub fn with_dma(mut self, stream: Stream, channel: u8) -> Self {
        self.dma = Some((stream, channel));
        self
    }

    /// Place `channel` at position `rank` of the regular sequence
    ///
    /// # Arguments
    /// * `channel` - Input 0-18
    /// * `sample_time` - Sampling time for this input
    /// * `rank` - Sequence position 1-16
    pub fn config_channel(&mut self, channel: u8, sample_time: SampleTime, rank: u8) -> Result<()> {
        if channel > MAX_CHANNEL || !(1..=MAX_RANK).contains(&rank) {
            return Err(Error::InvalidArgument);
        }
        let r = self.regs;
        let ch = channel as u32;
        let smp = sample_time as u32;
        if ch < 10 {
            write_field!(r.smpr2, ch * 3, 3, smp);
        } else {
            write_field!(r.smpr1, (ch - 10) * 3, 3, smp);
        }

        let slot = (rank - 1) as u32;
        match slot {
            0..=5 => write_field!(r.sqr3, slot * 5, 5, ch),
            6..=11 => write_field!(r.sqr2, (slot - 6) * 5, 5, ch),
            _ => write_field!(r.sqr1, (slot - 12) * 5, 5, ch),
        }
        self.length = self.length.max(rank);
        write_field!(r.sqr1, 20, 4, (self.length - 1) as u32);
        Ok(())
    }

    /// Number of conversions in the regular sequence
    pub fn sequence_len(&self) -> u8 {
        self.length
    }

    /// Software-trigger the regular sequence
    pub fn start_sequence(&mut self) -> Result<()> {
        if self.length == 0 {
            return Err(Error::NotReady);
        }
        let r = self.regs;
        if self.length > 1 {
            set_bits!(r.cr1, cr1::SCAN);
        } else {
            clear_bits!(r.cr1, cr1::SCAN);
        }
        clear_bits!(r.sr, sr::EOC | sr::OVR | sr::STRT);
        set_bits!(r.cr2, cr2::SWSTART);
        Ok(())
    }

    /// One-shot conversion of `channel`, leaving the configured sequence intact
    pub fn read_sample(&mut self, channel: u8) -> Result<u16> {
        if channel > MAX_CHANNEL {
            return Err(Error::InvalidArgument);
        }
        if self.scan.is_some() {
            return Err(Error::Busy);
        }
        let r = self.regs;
        let (saved1, saved3, saved_cr1) = (read_bits!(r.sqr1), read_bits!(r.sqr3), read_bits!(r.cr1));
        // Reading DR clears an EOC left over from an earlier conversion
        let _ = read_bits!(r.dr);

        clear_bits!(r.cr1, cr1::SCAN);
        write_field!(r.sqr1, 20, 4, 0);
        write_field!(r.sqr3, 0, 5, channel as u32);
        clear_bits!(r.sr, sr::OVR);
        set_bits!(r.cr2, cr2::SWSTART);
        let done = wait_flag(|| any_bits!(r.sr, sr::EOC));
        let value = (read_bits!(r.dr) & 0xFFF) as u16;

        write_bits!(r.sqr1, saved1);
        write_bits!(r.sqr3, saved3);
        write_bits!(r.cr1, saved_cr1);
        done.map(|_| value)
    }

    /// Convert the whole sequence into `buf` by DMA
    ///
    /// # Arguments
    /// * `buf` - One slot per sequence rank; handed back by [`Adc::poll_scan`]
    pub fn start_scan(&mut self, buf: &'static mut [u16]) -> Result<()> {
        if self.scan.is_some() {
            return Err(Error::Busy);
        }
        if self.length == 0 || buf.len() != self.length as usize {
            return Err(Error::InvalidArgument);
        }
        let Some((stream, channel)) = self.dma.as_mut() else {
            return Err(Error::NotReady);
        };
        let r = self.regs;
        let descriptor = Descriptor {
            channel: *channel,
            direction: Direction::PeripheralToMemory,
            peripheral: addr(&r.dr),
            memory: buf.as_ptr() as usize as u32,
            count: buf.len() as u16,
            width: Width::HalfWord,
            memory_increment: true,
            peripheral_increment: false,
            circular: false,
            priority: Priority::Medium,
            half_transfer: false,
        };
        // `buf` is 'static and parked in `self.scan` until the stream is idle
        unsafe { stream.configure(&descriptor)? };
        stream.start()?;
        clear_bits!(r.cr2, cr2::DMA);
        set_bits!(r.cr2, cr2::DMA | cr2::EOCS);
        self.scan = Some(buf);
        self.start_sequence()
    }

    /// Check a DMA scan
    ///
    /// # Returns
    /// * `None` while converting or when no scan was started
    /// * `Some(Ok(buf))` with the samples, or `Some(Err)` on a transfer error
    pub fn poll_scan(&mut self) -> Option<Result<&'static mut [u16]>> {
        self.scan.as_ref()?;
        let (stream, _) = self.dma.as_mut()?;
        let outcome = match stream.poll() {
            Ok(false) => return None,
            Ok(true) => Ok(()),
            Err(e) => Err(e),
        };
        clear_bits!(self.regs.cr2, cr2::DMA);
        let buf = self.scan.take()?;
        Some(outcome.map(|_| {
            for sample in buf.iter_mut() {
                *sample &= 0xFFF;
            }
            buf
        }))
    }
}
