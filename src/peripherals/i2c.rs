//! Polled I2C master (STM32F4 I2C v1 peripheral).
//!
//! Slave clock stretching is honoured without a bit-level timeout; the only
//! bound is the per-transaction deadline measured on a [`TickSource`].
//!
//! On an address NACK the driver issues STOP and returns to idle. On a bus
//! error it marks the bus for recovery, which clocks nine SCL pulses with SDA
//! released before the next transaction.

use super::gpio::{Pin, PinConfig};
use super::traits::{Deadline, TickSource};
use super::{spin, Clocks, Periph, Rcc};
use crate::registers::i2c::{ccr, cr1, cr2, sr1, sr2, RegisterBlock};
use crate::registers::{any_bits, clear_bits, read_bits, set_bits, write_bits, write_field};
use crate::{Error, Fault, Protocol, Result};

/// Transfer direction encoded in the address byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rw {
    Write,
    Read,
}

/// Bus settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct I2cConfig {
    /// SCL frequency, up to 400 kHz
    pub frequency: u32,
    /// Deadline for one transaction, in ticks
    pub timeout_ticks: u32,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            frequency: 100_000,
            timeout_ticks: 10,
        }
    }
}

/// Lines borrowed back from the peripheral to unstick the bus
struct RecoveryPins {
    scl: Pin,
    sda: Pin,
    af: u8,
}

/// CR2.FREQ, CCR and TRISE for a kernel clock and SCL frequency
fn timing(pclk: u32, frequency: u32) -> Result<(u32, u32, u32)> {
    let mhz = pclk / 1_000_000;
    if !(2..=50).contains(&mhz) || frequency == 0 || frequency > 400_000 {
        return Err(Error::InvalidArgument);
    }
    if frequency <= 100_000 {
        let ccr = (pclk / (2 * frequency)).max(4);
        Ok((mhz, ccr, mhz + 1))
    } else {
        let ccr = (pclk / (3 * frequency)).max(1);
        Ok((mhz, ccr::FS | ccr, mhz * 300 / 1000 + 1))
    }
}

/// I2C master
pub struct I2c<C: TickSource> {
    regs: &'static RegisterBlock,
    clock: C,
    config: I2cConfig,
    pclk: u32,
    recovery: Option<RecoveryPins>,
    needs_recovery: bool,
    addr_pending: bool,
    deadline: Deadline,
}

impl<C: TickSource> I2c<C> {
    /// Enable and time an I2C peripheral
    ///
    /// # Arguments
    /// * `periph` - I2C instance token
    /// * `config` - SCL frequency and transaction deadline
    /// * `clock` - Tick source for deadlines
    pub fn new(
        periph: Periph<RegisterBlock>,
        config: I2cConfig,
        clocks: &Clocks,
        rcc: &Rcc,
        clock: C,
    ) -> Result<Self> {
        rcc.enable(&periph);
        rcc.reset(&periph);
        Self::init(periph.regs(), clocks.pclk1, config, clock)
    }

    fn init(regs: &'static RegisterBlock, pclk: u32, config: I2cConfig, clock: C) -> Result<Self> {
        let mut bus = Self {
            regs,
            deadline: Deadline::after(&clock, config.timeout_ticks),
            clock,
            config,
            pclk,
            recovery: None,
            needs_recovery: false,
            addr_pending: false,
        };
        bus.program_timing()?;
        Ok(bus)
    }

    /// Provide the SCL/SDA pins (already in alternate-function open-drain mode)
    /// so bus recovery can drive them directly
    pub fn with_recovery(mut self, scl: Pin, sda: Pin, af: u8) -> Self {
        self.recovery = Some(RecoveryPins { scl, sda, af });
        self
    }

    fn program_timing(&mut self) -> Result<()> {
        let (freq, ccr, trise) = timing(self.pclk, self.config.frequency)?;
        let r = self.regs;
        clear_bits!(r.cr1, cr1::PE);
        write_field!(r.cr2, cr2::FREQ_SHIFT, 6, freq);
        write_bits!(r.ccr, ccr);
        write_bits!(r.trise, trise);
        set_bits!(r.cr1, cr1::PE);
        Ok(())
    }

    /// `true` after a bus error, until the next transaction recovers the bus
    pub fn needs_recovery(&self) -> bool {
        self.needs_recovery
    }

    /// Release a stuck bus: nine SCL pulses with SDA high, then a STOP
    pub fn recover(&mut self) -> Result<()> {
        log_warn!("I2C bus recovery");
        let r = self.regs;
        clear_bits!(r.cr1, cr1::PE);

        if let Some(pins) = self.recovery.as_mut() {
            pins.scl.configure(PinConfig::open_drain())?;
            pins.sda.configure(PinConfig::open_drain())?;
            pins.sda.write(true);
            for _ in 0..9 {
                pins.scl.write(false);
                spin(HALF_PERIOD_CYCLES);
                pins.scl.write(true);
                spin(HALF_PERIOD_CYCLES);
            }
            // STOP: SDA rises while SCL is high
            pins.sda.write(false);
            spin(HALF_PERIOD_CYCLES);
            pins.sda.write(true);
            spin(HALF_PERIOD_CYCLES);

            let af = PinConfig::alternate(pins.af).with_drive(super::gpio::Drive::OpenDrain);
            pins.scl.configure(af)?;
            pins.sda.configure(af)?;
        }

        set_bits!(r.cr1, cr1::SWRST);
        clear_bits!(r.cr1, cr1::SWRST);
        self.program_timing()?;
        self.needs_recovery = false;
        self.addr_pending = false;
        Ok(())
    }

    /// Poll SR1 until `ready` holds, mapping error flags on the way
    fn wait(&mut self, ready: u32) -> Result<u32> {
        let r = self.regs;
        loop {
            let status = read_bits!(r.sr1);
            if status & sr1::BERR != 0 {
                clear_bits!(r.sr1, sr1::BERR);
                self.needs_recovery = true;
                log_error!("I2C bus error");
                return Err(Fault::Bus.into());
            }
            if status & sr1::ARLO != 0 {
                clear_bits!(r.sr1, sr1::ARLO);
                return Err(Fault::ArbitrationLost.into());
            }
            if status & ready != 0 {
                return Ok(status);
            }
            if status & sr1::AF != 0 {
                clear_bits!(r.sr1, sr1::AF);
                return Err(Protocol::DataNack.into());
            }
            if self.deadline.expired(&self.clock) {
                return Err(Error::Timeout);
            }
        }
    }

    fn clear_addr(&mut self) {
        if self.addr_pending {
            let _ = read_bits!(self.regs.sr1);
            let _ = read_bits!(self.regs.sr2);
            self.addr_pending = false;
        }
    }

    /// Generate a (repeated) START and send the address byte
    ///
    /// # Arguments
    /// * `addr` - 7-bit slave address
    /// * `rw` - Direction of the following data phase
    ///
    /// # Returns
    /// * `Busy` if another master holds the bus
    /// * `Protocol(AddressNack)` after issuing STOP if nobody answered
    pub fn start(&mut self, addr: u8, rw: Rw) -> Result<()> {
        if self.needs_recovery {
            self.recover()?;
        }
        let r = self.regs;
        let repeated = any_bits!(r.sr2, sr2::MSL);
        if !repeated {
            self.deadline = Deadline::after(&self.clock, self.config.timeout_ticks);
            if any_bits!(r.sr2, sr2::BUSY) {
                return Err(Error::Busy);
            }
        }
        self.clear_addr();

        set_bits!(r.cr1, cr1::ACK | cr1::START);
        self.wait(sr1::SB).inspect_err(|_| self.abort())?;

        let rw_bit = match rw {
            Rw::Write => 0,
            Rw::Read => 1,
        };
        write_bits!(r.dr, ((addr as u32) << 1) | rw_bit);
        match self.wait(sr1::ADDR) {
            Ok(_) => {
                self.addr_pending = true;
                Ok(())
            }
            Err(Error::Protocol(Protocol::DataNack)) => {
                set_bits!(r.cr1, cr1::STOP);
                log_debug!("I2C address {} not acknowledged", addr);
                Err(Protocol::AddressNack.into())
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Send data bytes after a write START
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.clear_addr();
        for &byte in bytes {
            self.wait(sr1::TXE).inspect_err(|_| self.abort())?;
            write_bits!(self.regs.dr, byte as u32);
        }
        self.wait(sr1::BTF).inspect_err(|_| self.abort())?;
        Ok(())
    }

    /// Receive `buf.len()` bytes after a read START
    ///
    /// # Arguments
    /// * `buf` - Destination
    /// * `ack_last` - Acknowledge the final byte (for continued reads)
    pub fn read(&mut self, buf: &mut [u8], ack_last: bool) -> Result<()> {
        let r = self.regs;
        let n = buf.len();
        if n <= 1 && !ack_last {
            // NACK must be armed before ADDR is cleared for single-byte reads
            clear_bits!(r.cr1, cr1::ACK);
        } else {
            set_bits!(r.cr1, cr1::ACK);
        }
        self.clear_addr();
        for i in 0..n {
            if i + 1 == n && !ack_last {
                clear_bits!(r.cr1, cr1::ACK);
            }
            self.wait(sr1::RXNE).inspect_err(|_| self.abort())?;
            buf[i] = read_bits!(r.dr) as u8;
        }
        Ok(())
    }

    /// Generate STOP
    pub fn stop(&mut self) {
        self.clear_addr();
        set_bits!(self.regs.cr1, cr1::STOP);
    }

    fn abort(&mut self) {
        self.addr_pending = false;
        set_bits!(self.regs.cr1, cr1::STOP);
    }

    /// Read `buf.len()` bytes from register `reg` of device `addr`
    pub fn mem_read(&mut self, addr: u8, reg: u8, buf: &mut [u8]) -> Result<()> {
        self.start(addr, Rw::Write)?;
        self.write(&[reg])?;
        self.start(addr, Rw::Read)?;
        self.read(buf, false)?;
        self.stop();
        Ok(())
    }

    /// Write `data` to register `reg` of device `addr`
    pub fn mem_write(&mut self, addr: u8, reg: u8, data: &[u8]) -> Result<()> {
        self.start(addr, Rw::Write)?;
        self.write(&[reg])?;
        self.write(data)?;
        self.stop();
        Ok(())
    }
}

/// Half an SCL period at 100 kHz for a 168 MHz core
const HALF_PERIOD_CYCLES: u32 = 840;
