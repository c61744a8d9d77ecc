//! DMA controllers and their eight streams.
//!
//! A [`Stream`] is either idle or owns exactly one outstanding transfer.
//! Starting a stream that is still enabled fails with `Busy`.

use super::{wait_flag, Periph, Rcc};
use crate::registers::dma::{self, cr, isr, RegisterBlock};
use crate::registers::{any_bits, clear_bits, read_bits, set_bits, write_bits};
use crate::{Error, Fault, Result};

/// Streams per controller
pub const STREAMS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    PeripheralToMemory,
    MemoryToPeripheral,
    MemoryToMemory,
}

/// Size of one data item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Width {
    Byte,
    HalfWord,
    Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    Low,
    Medium,
    High,
    VeryHigh,
}

/// What a stream reported from its interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferEvent {
    HalfComplete,
    Complete,
    Error,
}

/// Called from the stream interrupt with the stream number and what happened
pub type Callback = fn(stream: u8, event: TransferEvent);

/// Transfer description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Descriptor {
    /// Request channel 0-7 (CHSEL)
    pub channel: u8,
    pub direction: Direction,
    /// Peripheral data register (or source for memory-to-memory)
    pub peripheral: u32,
    pub memory: u32,
    /// Items to move
    pub count: u16,
    pub width: Width,
    pub memory_increment: bool,
    pub peripheral_increment: bool,
    pub circular: bool,
    pub priority: Priority,
    /// Also interrupt at the half-way point
    pub half_transfer: bool,
}

impl Descriptor {
    /// Byte transfer between a peripheral register and a memory buffer
    pub fn bytes(channel: u8, direction: Direction, peripheral: u32, memory: &[u8]) -> Self {
        Self {
            channel,
            direction,
            peripheral,
            memory: memory.as_ptr() as usize as u32,
            count: memory.len().min(u16::MAX as usize) as u16,
            width: Width::Byte,
            memory_increment: true,
            peripheral_increment: false,
            circular: false,
            priority: Priority::Medium,
            half_transfer: false,
        }
    }

    pub fn circular(mut self) -> Self {
        self.circular = true;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// One DMA controller before it is split into streams
pub struct Dma {
    periph: Periph<RegisterBlock>,
}

impl Dma {
    pub fn new(periph: Periph<RegisterBlock>, rcc: &Rcc) -> Self {
        rcc.enable(&periph);
        Self { periph }
    }

    /// Hand out the eight streams as independently owned handles
    pub fn split(self) -> [Stream; STREAMS] {
        let regs = self.periph.regs();
        let controller = self.periph.index();
        core::array::from_fn(|n| Stream::new(regs, controller, n as u8))
    }
}

/// One stream of a DMA controller
pub struct Stream {
    regs: &'static RegisterBlock,
    controller: u8,
    number: u8,
    configured: bool,
    callback: Option<Callback>,
}

/// Shift of a stream's flag group inside LISR/HISR
const FLAG_SHIFT: [u32; 4] = [0, 6, 16, 22];

/// Interrupt-side view of a stream: its status flags and enable bit
///
/// `Copy`, so an interrupt handler can service the stream while the
/// [`Stream`] itself stays with its owner.
#[derive(Clone, Copy)]
pub struct StreamFlags {
    regs: &'static RegisterBlock,
    controller: u8,
    number: u8,
}

impl StreamFlags {
    fn shift(&self) -> u32 {
        FLAG_SHIFT[(self.number % 4) as usize]
    }

    /// Raw flag group of this stream (FEIF..TCIF in the low six bits)
    pub fn read(&self) -> u32 {
        let status = if self.number < 4 {
            read_bits!(self.regs.lisr)
        } else {
            read_bits!(self.regs.hisr)
        };
        (status >> self.shift()) & isr::ALL
    }

    pub fn clear(&self, flags: u32) {
        let value = (flags & isr::ALL) << self.shift();
        if self.number < 4 {
            write_bits!(self.regs.lifcr, value);
        } else {
            write_bits!(self.regs.hifcr, value);
        }
    }

    fn disable(&self) {
        clear_bits!(self.regs.st[self.number as usize].cr, cr::EN);
    }

    /// Clear pending flags and classify them; errors disable the stream
    ///
    /// Returns the most significant event, or `None` when nothing (or only
    /// a FIFO error, benign in direct mode) was pending.
    pub fn service(&self) -> Option<TransferEvent> {
        let flags = self.read();
        if flags == 0 {
            return None;
        }
        self.clear(flags);
        if flags & (isr::TEIF | isr::DMEIF) != 0 {
            self.disable();
            log_warn!("DMA{} stream {} transfer error", self.controller, self.number);
            Some(TransferEvent::Error)
        } else if flags & isr::TCIF != 0 {
            Some(TransferEvent::Complete)
        } else if flags & isr::HTIF != 0 {
            Some(TransferEvent::HalfComplete)
        } else {
            None
        }
    }
}

impl Stream {
    fn new(regs: &'static RegisterBlock, controller: u8, number: u8) -> Self {
        Self {
            regs,
            controller,
            number,
            configured: false,
            callback: None,
        }
    }

    fn st(&self) -> &'static dma::StreamRegisters {
        &self.regs.st[self.number as usize]
    }

    #[cfg(test)]
    fn shift(&self) -> u32 {
        self.interrupt_flags().shift()
    }

    /// Handle for servicing this stream from an interrupt
    pub fn interrupt_flags(&self) -> StreamFlags {
        StreamFlags {
            regs: self.regs,
            controller: self.controller,
            number: self.number,
        }
    }

    fn flags(&self) -> u32 {
        self.interrupt_flags().read()
    }

    fn clear_flags(&self, flags: u32) {
        self.interrupt_flags().clear(flags)
    }

    /// Controller number (1 or 2)
    pub fn controller(&self) -> u8 {
        self.controller
    }

    /// Stream number 0-7
    pub fn number(&self) -> u8 {
        self.number
    }

    /// `true` while the stream owns a transfer
    pub fn is_busy(&self) -> bool {
        any_bits!(self.st().cr, cr::EN)
    }

    /// Program the stream for a transfer. Does not start it.
    ///
    /// # Safety
    ///
    /// The memory region named by `descriptor` must stay valid, and must not
    /// be accessed by the CPU, until the transfer completes or the stream is
    /// stopped.
    pub unsafe fn configure(&mut self, descriptor: &Descriptor) -> Result<()> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        if descriptor.channel > 7 || descriptor.count == 0 {
            return Err(Error::InvalidArgument);
        }
        let width = match descriptor.width {
            Width::Byte => 0b00,
            Width::HalfWord => 0b01,
            Width::Word => 0b10,
        };
        let dir = match descriptor.direction {
            Direction::PeripheralToMemory => 0b00,
            Direction::MemoryToPeripheral => 0b01,
            Direction::MemoryToMemory => 0b10,
        };
        let mut value = ((descriptor.channel as u32) << cr::CHSEL_SHIFT)
            | ((descriptor.priority as u32) << cr::PL_SHIFT)
            | (width << cr::MSIZE_SHIFT)
            | (width << cr::PSIZE_SHIFT)
            | (dir << cr::DIR_SHIFT)
            | cr::TCIE
            | cr::TEIE
            | cr::DMEIE;
        if descriptor.memory_increment {
            value |= cr::MINC;
        }
        if descriptor.peripheral_increment {
            value |= cr::PINC;
        }
        if descriptor.circular {
            value |= cr::CIRC;
        }
        if descriptor.half_transfer {
            value |= cr::HTIE;
        }

        let st = self.st();
        self.clear_flags(isr::ALL);
        write_bits!(st.par, descriptor.peripheral);
        write_bits!(st.m0ar, descriptor.memory);
        write_bits!(st.ndtr, descriptor.count as u32);
        // Direct mode, FIFO disabled
        write_bits!(st.fcr, 0);
        write_bits!(st.cr, value);
        self.configured = true;
        Ok(())
    }

    /// Point an already configured stream at a new memory buffer
    ///
    /// # Safety
    ///
    /// Same contract as [`Stream::configure`].
    pub unsafe fn set_memory(&mut self, memory: u32, count: u16) -> Result<()> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        if !self.configured {
            return Err(Error::NotReady);
        }
        if count == 0 {
            return Err(Error::InvalidArgument);
        }
        write_bits!(self.st().m0ar, memory);
        write_bits!(self.st().ndtr, count as u32);
        Ok(())
    }

    /// Enable the stream
    ///
    /// # Returns
    /// * `Busy` if the previous transfer is still running
    /// * `NotReady` if the stream was never configured
    pub fn start(&mut self) -> Result<()> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        if !self.configured {
            return Err(Error::NotReady);
        }
        self.clear_flags(isr::ALL);
        set_bits!(self.st().cr, cr::EN);
        Ok(())
    }

    /// Abort the current transfer and wait for the stream to release the bus
    pub fn stop(&mut self) -> Result<()> {
        let st = self.st();
        clear_bits!(st.cr, cr::EN);
        let stopped = wait_flag(|| !any_bits!(st.cr, cr::EN));
        self.clear_flags(isr::ALL);
        stopped
    }

    /// Items left to transfer
    pub fn remaining(&self) -> u16 {
        read_bits!(self.st().ndtr) as u16
    }

    /// Install the completion callback
    pub fn on_complete(&mut self, callback: Callback) {
        self.callback = Some(callback);
    }

    /// Service the stream interrupt. Call from the stream's ISR.
    ///
    /// Transfer errors disable the stream. Returns the most significant event
    /// seen, after running the callback for it.
    pub fn on_interrupt(&mut self) -> Option<TransferEvent> {
        let event = self.interrupt_flags().service()?;
        if let Some(callback) = self.callback {
            callback(self.number, event);
        }
        Some(event)
    }

    /// Poll for completion without interrupts
    ///
    /// # Returns
    /// * `Ok(true)` once the transfer finished
    /// * `Ok(false)` while it is still running
    /// * `Hardware(Transfer)` if the stream flagged an error
    pub fn poll(&mut self) -> Result<bool> {
        let flags = self.flags();
        if flags & (isr::TEIF | isr::DMEIF) != 0 {
            self.clear_flags(flags);
            clear_bits!(self.st().cr, cr::EN);
            return Err(Fault::Transfer.into());
        }
        if flags & isr::TCIF != 0 {
            self.clear_flags(isr::TCIF | isr::HTIF);
            return Ok(true);
        }
        Ok(!self.is_busy())
    }

    /// `true` when a transfer-complete flag is set but not yet serviced
    pub fn is_complete_pending(&self) -> bool {
        self.flags() & isr::TCIF != 0
    }

    /// Raw NDTR, used by circular receivers to locate the write position
    pub(crate) fn ndtr(&self) -> u32 {
        read_bits!(self.st().ndtr)
    }
}

#[cfg(test)]
impl Dma {
    pub(crate) fn fake(index: u8) -> Self {
        Self {
            periph: Periph::fake(index),
        }
    }
}

#[cfg(test)]
impl Stream {
    pub(crate) fn controller_regs(&self) -> &'static RegisterBlock {
        self.regs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{peek, poke};
    use core::sync::atomic::{AtomicU32, Ordering};

    fn streams() -> [Stream; STREAMS] {
        Dma::fake(2).split()
    }

    static BUFFER: [u8; 16] = [0; 16];

    fn descriptor() -> Descriptor {
        Descriptor::bytes(4, Direction::MemoryToPeripheral, 0x4001_100C, &BUFFER)
    }

    #[test]
    fn configure_encodes_the_descriptor() {
        let [_, _, _, _, _, _, _, mut s7] = streams();
        unsafe { s7.configure(&descriptor().circular().priority(Priority::High)) }.unwrap();
        let st = s7.st();
        let value = peek(&st.cr);
        assert_eq!((value >> cr::CHSEL_SHIFT) & 0b111, 4);
        assert_eq!((value >> cr::PL_SHIFT) & 0b11, 2);
        assert_eq!((value >> cr::DIR_SHIFT) & 0b11, 0b01);
        assert!(value & cr::MINC != 0 && value & cr::CIRC != 0);
        assert_eq!(value & cr::EN, 0);
        assert_eq!(peek(&st.ndtr), 16);
        assert_eq!(peek(&st.par), 0x4001_100C);
        assert_eq!(s7.controller(), 2);
    }

    #[test]
    fn start_on_a_busy_stream_fails() {
        let [mut s0, ..] = streams();
        assert_eq!(s0.start(), Err(Error::NotReady));
        unsafe { s0.configure(&descriptor()) }.unwrap();
        s0.start().unwrap();
        assert!(s0.is_busy());
        assert_eq!(s0.start(), Err(Error::Busy));
        assert_eq!(unsafe { s0.configure(&descriptor()) }, Err(Error::Busy));
        s0.stop().unwrap();
        assert!(s0.start().is_ok());
    }

    #[test]
    fn flag_groups_follow_the_reference_manual() {
        let [_, s1, _, _, _, s5, s6, _] = streams();
        assert_eq!(s1.shift(), 6);
        assert_eq!(s6.shift(), 16);
        poke(&s5.regs.hisr, isr::TCIF << 6);
        assert_eq!(s5.flags(), isr::TCIF);
        assert_eq!(s1.flags(), 0);
    }

    static EVENTS: AtomicU32 = AtomicU32::new(0);

    fn count(stream: u8, event: TransferEvent) {
        assert_eq!(stream, 3);
        if event == TransferEvent::Complete {
            EVENTS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn interrupt_reports_completion_and_errors() {
        let [_, _, _, mut s3, ..] = streams();
        s3.on_complete(count);
        assert_eq!(s3.on_interrupt(), None);

        poke(&s3.regs.lisr, isr::TCIF << 22);
        assert_eq!(s3.on_interrupt(), Some(TransferEvent::Complete));
        assert_eq!(peek(&s3.regs.lifcr), isr::TCIF << 22);
        assert_eq!(EVENTS.load(Ordering::SeqCst), 1);

        poke(&s3.st().cr, cr::EN);
        poke(&s3.regs.lisr, isr::TEIF << 22);
        assert_eq!(s3.on_interrupt(), Some(TransferEvent::Error));
        assert!(!s3.is_busy());
    }

    #[test]
    fn remaining_reads_ndtr() {
        let [_, _, mut s2, ..] = streams();
        unsafe { s2.configure(&descriptor()) }.unwrap();
        poke(&s2.st().ndtr, 5);
        assert_eq!(s2.remaining(), 5);
        assert_eq!(s2.ndtr(), 5);
    }
}
