//! USART with DMA circular reception and idle-line notification.
//!
//! Reception runs continuously into a circular buffer. Each call to
//! [`Uart::recv_nonblocking`] exposes the bytes written since the previous
//! call as at most two slices and advances the read position. If the DMA laps
//! the reader, the overwritten bytes are counted as dropped.
//!
//! Break, framing, parity and noise errors each bump a counter and the
//! affected byte is discarded.
//!
//! Interrupt handlers reach the port through a [`UartShared`] placed in a
//! `static`, so the [`Uart`] itself can be moved into its owner.

use super::dma::{Descriptor, Direction, Priority, Stream, StreamFlags, TransferEvent};
use super::traits::SerialPort;
use super::{wait_flag, Clocks, Periph, Rcc};
use crate::registers::dma::isr;
use crate::registers::usart::{cr1, cr2, cr3, sr, RegisterBlock};
use crate::registers::{addr, any_bits, clear_bits, read_bits, set_bits, write_bits};
use crate::{Error, Result};
use core::cell::Cell;
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopBits {
    One,
    Two,
}

/// Line settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UartConfig {
    pub baud: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Enable LIN break detection
    pub break_detect: bool,
}

impl Default for UartConfig {
    /// 115200 8N1
    fn default() -> Self {
        Self {
            baud: 115_200,
            parity: Parity::None,
            stop_bits: StopBits::One,
            break_detect: false,
        }
    }
}

/// Receive-side diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UartStats {
    pub framing: u32,
    pub parity: u32,
    pub noise: u32,
    pub overrun: u32,
    pub breaks: u32,
    /// Bytes overwritten in the circular buffer before they were read
    pub dropped: u32,
    pub idle_events: u32,
}

impl UartStats {
    const ZERO: Self = Self {
        framing: 0,
        parity: 0,
        noise: 0,
        overrun: 0,
        breaks: 0,
        dropped: 0,
        idle_events: 0,
    };
}

/// Called in interrupt context on each idle line
pub type IdleHandler = fn();

/// Bytes received since the previous read, in arrival order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxView<'a> {
    pub first: &'a [u8],
    /// Continuation after the circular buffer wrapped
    pub second: &'a [u8],
}

impl<'a> RxView<'a> {
    pub const EMPTY: RxView<'static> = RxView {
        first: &[],
        second: &[],
    };

    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + 'a {
        self.first.iter().chain(self.second.iter()).copied()
    }

    /// Copy into `out`, returning the number of bytes copied
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        let mut n = 0;
        for (slot, byte) in out.iter_mut().zip(self.iter()) {
            *slot = byte;
            n += 1;
        }
        n
    }
}

/// Read position in a circular buffer that a writer fills without feedback
///
/// Positions are running totals; `capacity` must be a power of two so they
/// stay consistent across `u32` wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxCursor {
    capacity: u32,
    read_total: u32,
}

impl RxCursor {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity > u16::MAX as usize {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            capacity: capacity as u32,
            read_total: 0,
        })
    }

    /// Consume up to `limit` bytes given the writer's running total
    ///
    /// # Returns
    /// `(start, count, dropped)`: buffer index of the oldest unread byte, the
    /// number of bytes consumed, and how many were overwritten unread
    pub fn advance(&mut self, written_total: u32, limit: usize) -> (usize, usize, u32) {
        let mut pending = written_total.wrapping_sub(self.read_total);
        let mut dropped = 0;
        if pending > self.capacity {
            dropped = pending - self.capacity;
            self.read_total = self.read_total.wrapping_add(dropped);
            pending = self.capacity;
        }
        let start = (self.read_total % self.capacity) as usize;
        let count = (pending as usize).min(limit);
        self.read_total = self.read_total.wrapping_add(count as u32);
        (start, count, dropped)
    }
}

/// Interrupt-side state of one USART
///
/// Lives in a `static`; [`Uart::new`] binds it to the port and the USART and
/// RX stream interrupts call into it directly.
pub struct UartShared {
    regs: Mutex<CriticalSectionRawMutex, Cell<Option<&'static RegisterBlock>>>,
    rx_flags: Mutex<CriticalSectionRawMutex, Cell<Option<StreamFlags>>>,
    idle: Mutex<CriticalSectionRawMutex, Cell<Option<IdleHandler>>>,
    stats: Mutex<CriticalSectionRawMutex, Cell<UartStats>>,
    /// Completed passes of the RX stream over its circular buffer
    laps: Mutex<CriticalSectionRawMutex, Cell<u32>>,
}

impl Default for UartShared {
    fn default() -> Self {
        Self::new()
    }
}

impl UartShared {
    pub const fn new() -> Self {
        Self {
            regs: Mutex::new(Cell::new(None)),
            rx_flags: Mutex::new(Cell::new(None)),
            idle: Mutex::new(Cell::new(None)),
            stats: Mutex::new(Cell::new(UartStats::ZERO)),
            laps: Mutex::new(Cell::new(0)),
        }
    }

    fn count(&self, f: impl FnOnce(&mut UartStats)) {
        self.stats.lock(|cell| {
            let mut stats = cell.get();
            f(&mut stats);
            cell.set(stats);
        });
    }

    pub fn stats(&self) -> UartStats {
        self.stats.lock(|cell| cell.get())
    }

    /// Service the USART interrupt
    pub fn on_interrupt(&self) {
        let Some(r) = self.regs.lock(|cell| cell.get()) else {
            return;
        };
        let status = read_bits!(r.sr);

        if status & (sr::PE | sr::FE | sr::NF | sr::ORE) != 0 {
            self.count(|stats| {
                if status & sr::PE != 0 {
                    stats.parity += 1;
                }
                if status & sr::FE != 0 {
                    stats.framing += 1;
                }
                if status & sr::NF != 0 {
                    stats.noise += 1;
                }
                if status & sr::ORE != 0 {
                    stats.overrun += 1;
                }
            });
            // SR then DR read clears the flags and discards the byte
            let _ = read_bits!(r.dr);
        }
        if status & sr::LBD != 0 {
            self.count(|stats| stats.breaks += 1);
            clear_bits!(r.sr, sr::LBD);
            let _ = read_bits!(r.dr);
        }
        if status & sr::IDLE != 0 {
            let _ = read_bits!(r.dr);
            self.count(|stats| stats.idle_events += 1);
            if let Some(handler) = self.idle.lock(|cell| cell.get()) {
                handler();
            }
        }
    }

    /// Service the RX DMA stream interrupt (counts buffer laps)
    pub fn on_rx_dma_interrupt(&self) {
        critical_section::with(|_| {
            let Some(flags) = self.rx_flags.lock(|cell| cell.get()) else {
                return;
            };
            if flags.service() == Some(TransferEvent::Complete) {
                self.add_lap();
            }
        });
    }

    fn add_lap(&self) {
        self.laps.lock(|cell| cell.set(cell.get().wrapping_add(1)));
    }
}

struct RxRing {
    stream: Stream,
    buf: &'static mut [u8],
    cursor: RxCursor,
}

impl RxRing {
    /// Running count of bytes the stream has written
    ///
    /// A wrap whose interrupt has not run yet is consumed here, so the
    /// reader never depends on the stream interrupt being enabled.
    fn written_total(&self, shared: &UartShared) -> u32 {
        let capacity = self.buf.len() as u32;
        let flags = self.stream.interrupt_flags();
        critical_section::with(|_| {
            let mut remaining = self.stream.ndtr();
            if flags.read() & isr::TCIF != 0 {
                flags.clear(isr::TCIF | isr::HTIF);
                shared.add_lap();
                // NDTR may have been sampled before the wrap
                remaining = self.stream.ndtr();
            }
            let laps = shared.laps.lock(|cell| cell.get());
            let position = capacity - (remaining & 0xFFFF).min(capacity);
            laps.wrapping_mul(capacity).wrapping_add(position)
        })
    }
}

/// Transmission handle returned by [`Uart::send_dma`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxHandle(u32);

/// USART driver
pub struct Uart {
    regs: &'static RegisterBlock,
    shared: &'static UartShared,
    rx: Option<RxRing>,
    tx: Option<(Stream, u8)>,
    tx_issued: u32,
    tx_done: u32,
}

impl Uart {
    /// Enable a USART with the given line settings
    ///
    /// # Arguments
    /// * `periph` - USART instance token
    /// * `config` - Baud rate, parity, stop bits
    /// * `clocks` - Frozen clock tree, for the baud divisor
    /// * `rcc` - Clock gate owner
    /// * `shared` - Interrupt-side state for this port
    pub fn new(
        periph: Periph<RegisterBlock>,
        config: UartConfig,
        clocks: &Clocks,
        rcc: &Rcc,
        shared: &'static UartShared,
    ) -> Result<Self> {
        rcc.enable(&periph);
        let pclk = clocks.bus_clock(periph.gate().bus);
        Self::init(periph.regs(), pclk, config, shared)
    }

    fn init(
        regs: &'static RegisterBlock,
        pclk: u32,
        config: UartConfig,
        shared: &'static UartShared,
    ) -> Result<Self> {
        if config.baud == 0 || pclk / config.baud < 16 {
            return Err(Error::InvalidArgument);
        }
        // 16x oversampling: BRR holds USARTDIV in 1/16 units
        write_bits!(regs.brr, (pclk + config.baud / 2) / config.baud);

        let mut c1 = cr1::TE | cr1::RE;
        match config.parity {
            Parity::None => {}
            Parity::Even => c1 |= cr1::PCE | cr1::M | cr1::PEIE,
            Parity::Odd => c1 |= cr1::PCE | cr1::PS | cr1::M | cr1::PEIE,
        }
        let stop = match config.stop_bits {
            StopBits::One => 0b00,
            StopBits::Two => 0b10,
        };
        let mut c2 = stop << cr2::STOP_SHIFT;
        if config.break_detect {
            c2 |= cr2::LINEN | cr2::LBDIE;
        }
        write_bits!(regs.cr2, c2);
        write_bits!(regs.cr3, cr3::EIE);
        write_bits!(regs.cr1, c1 | cr1::UE);
        shared.regs.lock(|cell| cell.set(Some(regs)));

        Ok(Self {
            regs,
            shared,
            rx: None,
            tx: None,
            tx_issued: 0,
            tx_done: 0,
        })
    }

    /// Start circular DMA reception into `buf`
    ///
    /// # Arguments
    /// * `stream` - RX DMA stream
    /// * `channel` - Request channel of this USART on that stream
    /// * `buf` - Circular buffer; power-of-two length up to 32768
    pub fn enable_rx_dma(&mut self, mut stream: Stream, channel: u8, buf: &'static mut [u8]) -> Result<()> {
        let cursor = RxCursor::new(buf.len())?;
        let descriptor =
            Descriptor::bytes(channel, Direction::PeripheralToMemory, addr(&self.regs.dr), buf)
                .circular()
                .priority(Priority::High);
        // `buf` is 'static and owned by the ring for as long as the stream runs
        unsafe { stream.configure(&descriptor)? };
        stream.start()?;
        critical_section::with(|_| {
            self.shared.laps.lock(|cell| cell.set(0));
            self.shared.rx_flags.lock(|cell| cell.set(Some(stream.interrupt_flags())));
        });
        set_bits!(self.regs.cr3, cr3::DMAR);
        set_bits!(self.regs.cr1, cr1::IDLEIE);
        self.rx = Some(RxRing { stream, buf, cursor });
        Ok(())
    }

    /// Bind a TX DMA stream for [`Uart::send_dma`]
    pub fn enable_tx_dma(&mut self, stream: Stream, channel: u8) {
        self.tx = Some((stream, channel));
    }

    /// Install the idle-line handler
    pub fn on_idle(&mut self, handler: IdleHandler) {
        self.shared.idle.lock(|cell| cell.set(Some(handler)));
    }

    /// Diagnostic counters
    pub fn stats(&self) -> UartStats {
        self.shared.stats()
    }

    /// Blocking transmit
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let r = self.regs;
        for &byte in bytes {
            wait_flag(|| any_bits!(r.sr, sr::TXE))?;
            write_bits!(r.dr, byte as u32);
        }
        wait_flag(|| any_bits!(r.sr, sr::TC))
    }

    /// Start a DMA transmission
    ///
    /// # Returns
    /// * A handle to check with [`Uart::is_sent`]
    /// * `NotReady` without a TX stream, `Busy` while the previous one runs
    pub fn send_dma(&mut self, bytes: &'static [u8]) -> Result<TxHandle> {
        let dr = addr(&self.regs.dr);
        let Some((stream, channel)) = self.tx.as_mut() else {
            return Err(Error::NotReady);
        };
        if bytes.is_empty() || bytes.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument);
        }
        let descriptor = Descriptor::bytes(*channel, Direction::MemoryToPeripheral, dr, bytes);
        // 'static source; the stream never writes to it
        unsafe { stream.configure(&descriptor)? };
        clear_bits!(self.regs.sr, sr::TC);
        set_bits!(self.regs.cr3, cr3::DMAT);
        stream.start()?;
        self.tx_issued = self.tx_issued.wrapping_add(1);
        Ok(TxHandle(self.tx_issued))
    }

    /// `true` once the DMA transmission behind `handle` has finished
    pub fn is_sent(&mut self, handle: TxHandle) -> bool {
        if let Some((stream, _)) = self.tx.as_mut() {
            if self.tx_done != self.tx_issued && matches!(stream.poll(), Ok(true) | Err(_)) {
                self.tx_done = self.tx_issued;
            }
        }
        self.tx_done.wrapping_sub(handle.0) < u32::MAX / 2
    }

    /// Bytes received since the previous call and how many were dropped
    pub fn recv_nonblocking(&mut self) -> (RxView<'_>, u32) {
        self.recv_up_to(usize::MAX)
    }

    fn recv_up_to(&mut self, limit: usize) -> (RxView<'_>, u32) {
        let Some(ring) = self.rx.as_mut() else {
            return (RxView::EMPTY, 0);
        };
        let written = ring.written_total(self.shared);
        let (start, count, dropped) = ring.cursor.advance(written, limit);
        if dropped > 0 {
            self.shared.count(|stats| stats.dropped = stats.dropped.wrapping_add(dropped));
            log_warn!("UART RX dropped {} bytes", dropped);
        }
        let buf: &[u8] = &ring.buf[..];
        let end = (start + count).min(buf.len());
        let first = &buf[start..end];
        let second = &buf[..count - first.len()];
        (RxView { first, second }, dropped)
    }

    /// Service the USART interrupt; see [`UartShared::on_interrupt`]
    pub fn on_interrupt(&self) {
        self.shared.on_interrupt()
    }

    /// Service the RX DMA stream interrupt
    pub fn on_rx_dma_interrupt(&self) {
        self.shared.on_rx_dma_interrupt()
    }
}

impl SerialPort for Uart {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.send(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let (view, _) = self.recv_up_to(buf.len());
        view.copy_to(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripherals::dma::Dma;
    use crate::registers::{fake, peek, poke};
    use core::sync::atomic::{AtomicU32, Ordering};

    fn shared() -> &'static UartShared {
        Box::leak(Box::new(UartShared::new()))
    }

    fn uart() -> Uart {
        Uart::init(fake(), 84_000_000, UartConfig::default(), shared()).unwrap()
    }

    #[test]
    fn cursor_reads_in_order_across_wrap() {
        let mut cursor = RxCursor::new(8).unwrap();
        assert_eq!(cursor.advance(5, usize::MAX), (0, 5, 0));
        assert_eq!(cursor.advance(11, usize::MAX), (5, 6, 0));
        assert_eq!(cursor.advance(11, usize::MAX), (3, 0, 0));
    }

    #[test]
    fn cursor_counts_lapped_bytes() {
        let mut cursor = RxCursor::new(8).unwrap();
        assert_eq!(cursor.advance(2, usize::MAX), (0, 2, 0));
        // Writer went 12 bytes further: 4 of them were overwritten unread
        assert_eq!(cursor.advance(14, usize::MAX), (6, 8, 4));
    }

    #[test]
    fn cursor_respects_the_limit_and_counter_wrap() {
        let mut cursor = RxCursor::new(4).unwrap();
        cursor.read_total = u32::MAX - 1;
        assert_eq!(cursor.advance(1, 2), (2, 2, 0));
        assert_eq!(cursor.advance(1, 2), (0, 1, 0));
        assert_eq!(RxCursor::new(12), Err(Error::InvalidArgument));
    }

    #[test]
    fn baud_divisor_rounds() {
        let uart = uart();
        assert_eq!(read_bits!(uart.regs.brr), 729);
        assert!(any_bits!(uart.regs.cr1, cr1::UE | cr1::TE | cr1::RE));
        assert!(Uart::init(fake(), 1_000_000, UartConfig::default(), shared()).is_err());
    }

    #[test]
    fn errors_are_counted() {
        let uart = uart();
        poke(&uart.regs.sr, sr::FE | sr::ORE);
        uart.on_interrupt();
        poke(&uart.regs.sr, sr::LBD);
        uart.on_interrupt();
        let stats = uart.stats();
        assert_eq!((stats.framing, stats.overrun, stats.breaks), (1, 1, 1));
        assert_eq!(stats.parity, 0);
        assert!(!any_bits!(uart.regs.sr, sr::LBD));
    }

    #[test]
    fn unbound_shared_state_ignores_interrupts() {
        let shared = shared();
        shared.on_interrupt();
        shared.on_rx_dma_interrupt();
        assert_eq!(shared.stats(), UartStats::default());
    }

    static IDLES: AtomicU32 = AtomicU32::new(0);

    fn idle() {
        IDLES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn idle_line_runs_the_handler() {
        let shared = shared();
        let mut uart = Uart::init(fake(), 84_000_000, UartConfig::default(), shared).unwrap();
        uart.on_idle(idle);
        poke(&uart.regs.sr, sr::IDLE);
        // The interrupt goes through the static side, not the driver
        shared.on_interrupt();
        assert_eq!(IDLES.load(Ordering::SeqCst), 1);
        assert_eq!(uart.stats().idle_events, 1);
    }

    #[test]
    fn dma_reception_exposes_new_bytes() {
        let mut uart = uart();
        let [_, _, stream, ..] = Dma::fake(2).split();
        let dma = stream.controller_regs();
        let buf: &'static mut [u8] = Box::leak(Box::new(*b"ABCDEFGH"));
        uart.enable_rx_dma(stream, 4, buf).unwrap();
        let ndtr = &dma.st[2].ndtr;

        assert!(uart.recv_nonblocking().0.is_empty());

        poke(ndtr, 5);
        let (view, dropped) = uart.recv_nonblocking();
        assert_eq!((view.first, view.second, dropped), (&b"ABC"[..], &b""[..], 0));

        // Wrap: the TC interrupt ran, then two more bytes landed
        poke(&dma.lisr, isr::TCIF << 16);
        uart.on_rx_dma_interrupt();
        poke(&dma.lisr, 0);
        poke(ndtr, 6);
        let (view, _) = uart.recv_nonblocking();
        assert_eq!(view.first, b"DEFGH");
        assert_eq!(view.second, b"AB");

        let mut out = [0u8; 4];
        assert_eq!(uart.read(&mut out), 0);
    }

    #[test]
    fn pending_wrap_is_counted_before_its_interrupt() {
        let mut uart = uart();
        let [_, stream, ..] = Dma::fake(1).split();
        let dma = stream.controller_regs();
        uart.enable_rx_dma(stream, 4, Box::leak(Box::new([0u8; 8]))).unwrap();
        poke(&dma.st[1].ndtr, 8);
        poke(&dma.lisr, isr::TCIF << 6);
        assert_eq!(uart.recv_nonblocking().0.len(), 8);
    }

    #[test]
    fn reader_consumes_wraps_without_the_interrupt() {
        let mut uart = uart();
        let [_, stream, ..] = Dma::fake(1).split();
        let dma = stream.controller_regs();
        uart.enable_rx_dma(stream, 4, Box::leak(Box::new([0u8; 8]))).unwrap();
        let ndtr = &dma.st[1].ndtr;

        poke(ndtr, 2);
        assert_eq!(uart.recv_nonblocking().0.len(), 6);

        // Two more wraps, each with six new bytes, and no DMA interrupt
        for remaining in [4, 6] {
            poke(&dma.lifcr, 0);
            poke(&dma.lisr, isr::TCIF << 6);
            poke(ndtr, remaining);
            let (view, dropped) = uart.recv_nonblocking();
            assert_eq!((view.len(), dropped), (6, 0));
            assert_ne!(peek(&dma.lifcr) & (isr::TCIF << 6), 0);
            // Hardware drops the flag once LIFCR is written
            poke(&dma.lisr, 0);
        }

        // A late interrupt finds nothing left to count
        uart.on_rx_dma_interrupt();
        assert_eq!(uart.recv_nonblocking().0.len(), 0);
        assert_eq!(uart.stats().dropped, 0);
    }

    #[test]
    fn send_dma_requires_a_stream() {
        let mut uart = uart();
        assert_eq!(uart.send_dma(b"hi").err(), Some(Error::NotReady));
        let [_, _, _, _, _, _, _, stream] = Dma::fake(2).split();
        let dma = stream.controller_regs();
        uart.enable_tx_dma(stream, 4);
        let handle = uart.send_dma(b"hello").unwrap();
        assert!(!uart.is_sent(handle));
        poke(&dma.hisr, isr::TCIF << 22);
        assert!(uart.is_sent(handle));
    }
}
