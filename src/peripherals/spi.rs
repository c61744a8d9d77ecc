//! SPI master with polled, interrupt and DMA transports.
//!
//! On completion the receive buffer holds exactly as many bytes as were
//! clocked out of the transmit buffer. Overrun and mode faults end the
//! transfer with an error instead of being dropped.
//!
//! DMA request mapping used by the board (RM0090 table 43):
//! SPI1 RX on DMA2 stream 0 channel 3, SPI1 TX on DMA2 stream 3 channel 3.

use super::dma::{Descriptor, Direction, Priority, Stream};
use super::traits::{OutputPin, SpiBus};
use super::{wait_flag, Clocks, Periph, Rcc};
use crate::registers::spi::{cr1, cr2, sr, RegisterBlock};
use crate::registers::{addr, any_bits, clear_bits, read_bits, set_bits, write_bits, write_field};
use crate::{Error, Fault, Result};

/// Clock polarity and phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// CPOL = 0, CPHA = 0
    Mode0,
    /// CPOL = 0, CPHA = 1
    Mode1,
    /// CPOL = 1, CPHA = 0
    Mode2,
    /// CPOL = 1, CPHA = 1
    Mode3,
}

impl Mode {
    fn bits(self) -> u32 {
        match self {
            Mode::Mode0 => 0,
            Mode::Mode1 => cr1::CPHA,
            Mode::Mode2 => cr1::CPOL,
            Mode::Mode3 => cr1::CPOL | cr1::CPHA,
        }
    }
}

/// SPI bus configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpiConfig {
    pub mode: Mode,
    /// Upper bound on SCK; the nearest prescaler at or below is chosen
    pub frequency: u32,
    pub lsb_first: bool,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Mode0,
            frequency: 1_000_000,
            lsb_first: false,
        }
    }
}

/// Pick the smallest prescaler 2..=256 that keeps SCK at or below `target`
///
/// # Returns
/// The BR field value and the resulting SCK frequency
pub fn prescaler(kernel: u32, target: u32) -> (u32, u32) {
    for br in 0..8u32 {
        let sck = kernel >> (br + 1);
        if sck <= target {
            return (br, sck);
        }
    }
    (7, kernel >> 8)
}

/// Result of an interrupt or DMA transfer, handing the receive buffer back
pub struct Finished {
    pub rx: &'static mut [u8],
    pub result: Result<()>,
}

struct Transfer {
    tx: &'static [u8],
    rx: &'static mut [u8],
    sent: usize,
    received: usize,
    error: Option<Error>,
    dma: bool,
}

/// SPI master
pub struct Spi {
    regs: &'static RegisterBlock,
    kernel_clock: u32,
    frequency: u32,
    transfer: Option<Transfer>,
    streams: Option<(Stream, u8, Stream, u8)>,
}

impl Spi {
    /// Enable and configure an SPI peripheral as master
    ///
    /// # Arguments
    /// * `periph` - SPI instance token
    /// * `config` - Mode and target SCK frequency
    /// * `clocks` - Frozen clock tree, for the prescaler
    /// * `rcc` - Clock gate owner
    pub fn new(periph: Periph<RegisterBlock>, config: SpiConfig, clocks: &Clocks, rcc: &Rcc) -> Self {
        rcc.enable(&periph);
        let kernel = clocks.bus_clock(periph.gate().bus);
        Self::init(periph.regs(), kernel, config)
    }

    fn init(regs: &'static RegisterBlock, kernel_clock: u32, config: SpiConfig) -> Self {
        let (br, frequency) = prescaler(kernel_clock, config.frequency);
        let mut value = cr1::MSTR | cr1::SSM | cr1::SSI | config.mode.bits() | (br << cr1::BR_SHIFT);
        if config.lsb_first {
            value |= cr1::LSBFIRST;
        }
        write_bits!(regs.cr1, value);
        write_bits!(regs.cr2, 0);
        set_bits!(regs.cr1, cr1::SPE);
        log_debug!("SPI up at {} Hz", frequency);
        Self {
            regs,
            kernel_clock,
            frequency,
            transfer: None,
            streams: None,
        }
    }

    /// Bind TX and RX DMA streams with their request channels
    pub fn with_dma(mut self, tx: Stream, tx_channel: u8, rx: Stream, rx_channel: u8) -> Self {
        self.streams = Some((tx, tx_channel, rx, rx_channel));
        self
    }

    /// Current SCK frequency
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// `true` while an interrupt or DMA transfer is outstanding
    pub fn is_busy(&self) -> bool {
        self.transfer.is_some()
    }

    /// Assert a chip select line
    pub fn select<P: OutputPin>(&mut self, cs: &mut P) {
        cs.set_low();
    }

    /// Wait for the last frame to leave the shifter, then release chip select
    pub fn release<P: OutputPin>(&mut self, cs: &mut P) -> Result<()> {
        let r = self.regs;
        let idle = wait_flag(|| !any_bits!(r.sr, sr::BSY));
        cs.set_high();
        idle
    }

    fn check_errors(&self) -> Result<()> {
        let status = read_bits!(self.regs.sr);
        if status & sr::OVR != 0 {
            // OVR clears on a DR read followed by an SR read
            let _ = read_bits!(self.regs.dr);
            let _ = read_bits!(self.regs.sr);
            return Err(Fault::Overrun.into());
        }
        if status & sr::MODF != 0 {
            // MODF clears on an SR read followed by a CR1 write
            set_bits!(self.regs.cr1, cr1::MSTR);
            return Err(Fault::ModeFault.into());
        }
        Ok(())
    }

    /// Polled full-duplex transfer
    fn exchange_polled(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        if tx.len() != rx.len() {
            return Err(Error::InvalidArgument);
        }
        if self.transfer.is_some() {
            return Err(Error::Busy);
        }
        let r = self.regs;
        for (out, slot) in tx.iter().zip(rx.iter_mut()) {
            wait_flag(|| any_bits!(r.sr, sr::TXE))?;
            write_bits!(r.dr, *out as u32);
            wait_flag(|| any_bits!(r.sr, sr::RXNE | sr::OVR | sr::MODF))?;
            self.check_errors()?;
            *slot = read_bits!(r.dr) as u8;
        }
        Ok(())
    }

    /// Start an interrupt-driven transfer
    ///
    /// # Arguments
    /// * `tx` - Bytes to clock out
    /// * `rx` - Buffer for the received bytes, returned by [`Spi::poll`]
    ///
    /// # Returns
    /// * `Busy` if a transfer is outstanding
    /// * `InvalidArgument` if the buffers differ in length or are empty
    pub fn begin(&mut self, tx: &'static [u8], rx: &'static mut [u8]) -> Result<()> {
        self.accept(tx, rx)?;
        let r = self.regs;
        let _ = read_bits!(r.dr);
        write_bits!(r.dr, tx[0] as u32);
        self.transfer = Some(Transfer {
            tx,
            rx,
            sent: 1,
            received: 0,
            error: None,
            dma: false,
        });
        set_bits!(r.cr2, cr2::RXNEIE | cr2::ERRIE);
        Ok(())
    }

    /// Start a DMA transfer on the streams bound by [`Spi::with_dma`]
    pub fn begin_dma(&mut self, tx: &'static [u8], rx: &'static mut [u8]) -> Result<()> {
        self.accept(tx, rx)?;
        let Some((tx_stream, tx_channel, rx_stream, rx_channel)) = self.streams.as_mut() else {
            return Err(Error::NotReady);
        };
        let dr = addr(&self.regs.dr);
        let rx_desc = Descriptor::bytes(*rx_channel, Direction::PeripheralToMemory, dr, rx)
            .priority(Priority::High);
        let tx_desc = Descriptor::bytes(*tx_channel, Direction::MemoryToPeripheral, dr, tx);
        // Both buffers are 'static and held in `self.transfer` until `poll`
        // hands them back, after the streams are idle.
        unsafe {
            rx_stream.configure(&rx_desc)?;
            tx_stream.configure(&tx_desc)?;
        }
        let r = self.regs;
        set_bits!(r.cr2, cr2::RXDMAEN);
        rx_stream.start()?;
        tx_stream.start()?;
        set_bits!(r.cr2, cr2::TXDMAEN);
        self.transfer = Some(Transfer {
            tx,
            rx,
            sent: 0,
            received: 0,
            error: None,
            dma: true,
        });
        Ok(())
    }

    fn accept(&self, tx: &[u8], rx: &[u8]) -> Result<()> {
        if self.transfer.is_some() {
            return Err(Error::Busy);
        }
        if tx.is_empty() || tx.len() != rx.len() || tx.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Service the SPI interrupt (interrupt transport)
    pub fn on_interrupt(&mut self) {
        let r = self.regs;
        let errors = self.check_errors();
        let Some(t) = self.transfer.as_mut() else {
            return;
        };
        if t.dma || t.error.is_some() {
            return;
        }
        if let Err(e) = errors {
            t.error = Some(e);
            clear_bits!(r.cr2, cr2::RXNEIE | cr2::TXEIE | cr2::ERRIE);
            return;
        }
        let status = read_bits!(r.sr);
        if status & sr::RXNE != 0 && t.received < t.rx.len() {
            t.rx[t.received] = read_bits!(r.dr) as u8;
            t.received += 1;
        }
        // One frame in flight keeps the receiver from overrunning
        if t.sent < t.tx.len() && t.sent == t.received && status & sr::TXE != 0 {
            write_bits!(r.dr, t.tx[t.sent] as u32);
            t.sent += 1;
        }
        if t.received == t.rx.len() {
            clear_bits!(r.cr2, cr2::RXNEIE | cr2::TXEIE | cr2::ERRIE);
        }
    }

    /// Check an outstanding transfer
    ///
    /// # Returns
    /// * `None` while the transfer runs or when none was started
    /// * `Some(Finished)` exactly once per transfer, with the receive buffer
    pub fn poll(&mut self) -> Option<Finished> {
        let t = self.transfer.as_ref()?;
        let result = if t.dma {
            let (tx_stream, _, rx_stream, _) = self.streams.as_mut()?;
            match rx_stream.poll() {
                Ok(false) => return None,
                Ok(true) => Ok(()),
                Err(e) => {
                    let _ = tx_stream.stop();
                    Err(e)
                }
            }
        } else if let Some(e) = t.error {
            Err(e)
        } else if t.received < t.rx.len() {
            return None;
        } else {
            Ok(())
        };

        let r = self.regs;
        clear_bits!(r.cr2, cr2::TXDMAEN | cr2::RXDMAEN);
        if let Some((tx_stream, _, rx_stream, _)) = self.streams.as_mut() {
            if t.dma {
                let _ = tx_stream.stop();
                let _ = rx_stream.stop();
            }
        }
        let t = self.transfer.take()?;
        if let Err(e) = result {
            log_warn!("SPI transfer failed: {:?}", e);
        }
        Some(Finished { rx: t.rx, result })
    }
}

impl SpiBus for Spi {
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        self.exchange_polled(tx, rx)
    }

    fn set_frequency(&mut self, hz: u32) -> Result<u32> {
        if self.transfer.is_some() {
            return Err(Error::Busy);
        }
        let (br, frequency) = prescaler(self.kernel_clock, hz);
        let r = self.regs;
        wait_flag(|| !any_bits!(r.sr, sr::BSY))?;
        clear_bits!(r.cr1, cr1::SPE);
        write_field!(r.cr1, cr1::BR_SHIFT, 3, br);
        set_bits!(r.cr1, cr1::SPE);
        self.frequency = frequency;
        Ok(frequency)
    }
}
