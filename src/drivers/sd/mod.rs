//! SD and MMC cards in SPI mode.
//!
//! The driver owns its SPI bus, chip-select pin and a tick clock. Card
//! bring-up is available both as a blocking call ([`SdCard::init`], for
//! early boot) and as a stepper ([`SdCard::init_step`]) that does one
//! bounded piece of the handshake per call, for use from a state machine.
//!
//! Single-sector transfers can also run split in two: `begin_*` issues the
//! command, and `poll_*` samples a few bytes per call until the data token
//! or the end of programming arrives. Nothing in that path spins on the
//! card.
//!
//! Block addresses given to the driver are always sector numbers.
//! Standard-capacity cards are byte-addressed on the wire, so the driver
//! multiplies by 512 for them and sends high-capacity addresses verbatim.

pub mod command;
mod crc;
pub mod csd;

pub use command::Command;
pub use crc::{crc16, crc7};
pub use csd::Csd;

use crate::peripherals::{Deadline, InputPin, OutputPin, SpiBus, TickSource};
use crate::{Error, Protocol, Result};
use command::{data_response, r1, HCS, IF_COND_ARG, OCR_CCS, TOKEN_START, TOKEN_START_MULTI, TOKEN_STOP};

/// Sector size
pub const BLOCK_SIZE: usize = 512;

/// Bytes sampled per poll while the card is not ready yet
const POLL_BYTES: usize = 8;

/// Card generation, fixed once initialisation succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardType {
    /// MMC version 3
    Mmc,
    /// SD version 1.x, byte-addressed
    SdV1,
    /// SD version 2.0 standard capacity, byte-addressed
    SdV2,
    /// SD version 2.0 high capacity, block-addressed
    SdV2Hc,
}

impl CardType {
    pub fn block_addressed(self) -> bool {
        self == CardType::SdV2Hc
    }
}

/// Drive status as seen by a filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Ok,
    NotInit,
    NoDisk,
    WriteProtect,
}

/// Drive queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ioctl {
    /// Wait for pending writes to finish
    Sync,
    /// Capacity in sectors, from the CSD
    SectorCount,
    /// Always 512
    SectorSize,
    /// Erase unit in sectors, from the CSD
    BlockSize,
}

/// SD driver settings; timeouts are in ticks (1 ms at the default tick rate)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SdConfig {
    /// SPI clock during identification (100-400 kHz)
    pub init_hz: u32,
    /// SPI clock after initialisation
    pub operating_hz: u32,
    /// Whole initialisation handshake
    pub init_timeout: u32,
    /// Wait for a read data token
    pub read_timeout: u32,
    /// Busy wait per written sector
    pub write_timeout: u32,
    /// Turn on card-side CRC checking (CMD59)
    pub crc: bool,
    /// Re-reads after a data CRC mismatch
    pub retries: u8,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            init_hz: 400_000,
            operating_hz: 25_000_000,
            init_timeout: 1000,
            read_timeout: 200,
            write_timeout: 250,
            crc: true,
            retries: 3,
        }
    }
}

/// Diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SdStats {
    pub commands: u32,
    pub crc_errors: u32,
    pub timeouts: u32,
    pub retries: u32,
    pub blocks_read: u32,
    pub blocks_written: u32,
}

/// Card-detect and write-protect switches of the card socket
pub trait Socket {
    fn card_present(&self) -> bool {
        true
    }

    fn write_protected(&self) -> bool {
        false
    }
}

/// Socket without switches: a card is always assumed present and writable
pub struct NoSocket;

impl Socket for NoSocket {}

/// Socket switches read from GPIO
///
/// Card detect pulls low when a card is inserted; write protect reads high
/// when the tab is locked.
pub struct PinSocket<D, W> {
    pub detect: D,
    pub protect: W,
}

impl<D: InputPin, W: InputPin> Socket for PinSocket<D, W> {
    fn card_present(&self) -> bool {
        self.detect.is_low()
    }

    fn write_protected(&self) -> bool {
        self.protect.is_high()
    }
}

/// Initialisation progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    PowerUp,
    GoIdle,
    CrcOn,
    CheckVoltage,
    LegacyKind,
    Activate(CardType),
    ReadOcr,
    SetBlockLen(CardType),
}

/// Split single-sector transfer in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// CMD17 accepted, waiting for the data token
    Token {
        block: u32,
        deadline: Deadline,
        attempt: u8,
    },
    /// Sector accepted, MISO held low while the card programs it
    Programming { block: u32, deadline: Deadline },
}

/// SD card on an SPI bus
pub struct SdCard<S, P, C, K = NoSocket> {
    spi: S,
    cs: P,
    clock: C,
    socket: K,
    config: SdConfig,
    card: Option<CardType>,
    phase: Phase,
    deadline: Deadline,
    pending: Option<Pending>,
    last: Result<()>,
    stats: SdStats,
}

impl<S: SpiBus, P: OutputPin, C: TickSource> SdCard<S, P, C, NoSocket> {
    /// Create a driver; the card is not touched until initialisation
    ///
    /// # Arguments
    /// * `spi` - Bus dedicated to the card
    /// * `cs` - Chip select, driven high here
    /// * `clock` - Tick source for deadlines
    /// * `config` - Clock rates and timeouts
    pub fn new(spi: S, mut cs: P, clock: C, config: SdConfig) -> Self {
        cs.set_high();
        let deadline = Deadline::after(&clock, config.init_timeout);
        Self {
            spi,
            cs,
            clock,
            socket: NoSocket,
            config,
            card: None,
            phase: Phase::PowerUp,
            deadline,
            pending: None,
            last: Err(Error::NotReady),
            stats: SdStats::default(),
        }
    }
}

impl<S: SpiBus, P: OutputPin, C: TickSource, K: Socket> SdCard<S, P, C, K> {
    /// Attach socket switches
    pub fn with_socket<K2: Socket>(self, socket: K2) -> SdCard<S, P, C, K2> {
        SdCard {
            spi: self.spi,
            cs: self.cs,
            clock: self.clock,
            socket,
            config: self.config,
            card: self.card,
            phase: self.phase,
            deadline: self.deadline,
            pending: self.pending,
            last: self.last,
            stats: self.stats,
        }
    }

    pub fn card_type(&self) -> Option<CardType> {
        self.card
    }

    pub fn is_initialized(&self) -> bool {
        self.card.is_some()
    }

    pub fn stats(&self) -> SdStats {
        self.stats
    }

    /// Result of the most recent initialisation or block operation
    pub fn last_status(&self) -> Result<()> {
        self.last
    }

    pub fn config(&self) -> &SdConfig {
        &self.config
    }

    /// `true` while the socket reports a card (always without a socket)
    pub fn card_present(&self) -> bool {
        self.socket.card_present()
    }

    pub fn status(&self) -> Status {
        if !self.socket.card_present() {
            Status::NoDisk
        } else if self.card.is_none() {
            Status::NotInit
        } else if self.socket.write_protected() {
            Status::WriteProtect
        } else {
            Status::Ok
        }
    }

    /// Forget the card and restart the handshake on the next step
    pub fn reset(&mut self) {
        if self.card.is_some() {
            log_info!("SD card reset");
        }
        self.card = None;
        self.phase = Phase::PowerUp;
        self.pending = None;
        self.last = Err(Error::NotReady);
        self.cs.set_high();
    }

    /// Blocking initialisation, bounded by `init_timeout`
    pub fn init(&mut self) -> Result<CardType> {
        self.reset();
        loop {
            if let Some(card) = self.init_step()? {
                return Ok(card);
            }
        }
    }

    /// Advance the initialisation handshake by one command
    ///
    /// # Returns
    /// * `Ok(None)` while the handshake is in progress
    /// * `Ok(Some(card))` once the card is ready (and on every later call)
    /// * `Err` when the handshake failed; call [`SdCard::reset`] to start over
    pub fn init_step(&mut self) -> Result<Option<CardType>> {
        if !self.socket.card_present() {
            self.card = None;
            self.last = Err(Error::NoDevice);
            return Err(Error::NoDevice);
        }
        if let Some(card) = self.card {
            return Ok(Some(card));
        }
        match self.advance() {
            Ok(Some(card)) => {
                self.last = Ok(());
                Ok(Some(card))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.deselect();
                self.phase = Phase::PowerUp;
                self.last = Err(e);
                log_error!("SD init failed: {:?}", e);
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<CardType>> {
        match self.phase {
            Phase::PowerUp => {
                self.deadline = Deadline::after(&self.clock, self.config.init_timeout);
                self.spi.set_frequency(self.config.init_hz)?;
                // At least 74 clocks with CS high put the card in native idle
                self.cs.set_high();
                self.spi.write(&[0xFF; 10])?;
                self.phase = Phase::GoIdle;
            }
            Phase::GoIdle => {
                self.cs.set_low();
                match self.command(Command::GoIdle, 0) {
                    Ok(r1::IDLE) => {
                        self.phase = if self.config.crc {
                            Phase::CrcOn
                        } else {
                            Phase::CheckVoltage
                        };
                    }
                    _ => {
                        self.deselect();
                        self.retry_or(Error::NoDevice)?;
                    }
                }
            }
            Phase::CrcOn => {
                let r = self.command(Command::CrcOnOff, 1)?;
                if r != r1::IDLE {
                    log_warn!("SD card refused CRC checking (R1 {}), continuing without", r);
                }
                self.phase = Phase::CheckVoltage;
            }
            Phase::CheckVoltage => {
                let r = self.command(Command::SendIfCond, IF_COND_ARG)?;
                if r & r1::ILLEGAL_COMMAND != 0 {
                    // Version 1 SD or MMC
                    self.phase = Phase::LegacyKind;
                } else if r == r1::IDLE {
                    let mut r7 = [0u8; 4];
                    self.spi.read(&mut r7)?;
                    if r7[2] & 0x0F != 0x01 || r7[3] != 0xAA {
                        log_warn!("SD card rejected voltage range, echo {}", r7[3]);
                        return Err(Error::NoDevice);
                    }
                    self.phase = Phase::Activate(CardType::SdV2);
                } else {
                    return Err(Protocol::UnexpectedResponse(r).into());
                }
            }
            Phase::LegacyKind => {
                let r = self.command(Command::AppSendOpCond, 0)?;
                self.phase = match r {
                    0 => Phase::SetBlockLen(CardType::SdV1),
                    r1::IDLE => Phase::Activate(CardType::SdV1),
                    _ => Phase::Activate(CardType::Mmc),
                };
            }
            Phase::Activate(card) => {
                let (cmd, arg) = match card {
                    CardType::SdV2 => (Command::AppSendOpCond, HCS),
                    CardType::Mmc => (Command::SendOpCond, 0),
                    _ => (Command::AppSendOpCond, 0),
                };
                match self.command(cmd, arg)? {
                    0 => {
                        self.phase = if card == CardType::SdV2 {
                            Phase::ReadOcr
                        } else {
                            Phase::SetBlockLen(card)
                        };
                    }
                    r1::IDLE => self.retry_or(Error::Timeout)?,
                    r => return Err(Protocol::UnexpectedResponse(r).into()),
                }
            }
            Phase::ReadOcr => {
                let r = self.command(Command::ReadOcr, 0)?;
                if r != 0 {
                    return Err(Protocol::UnexpectedResponse(r).into());
                }
                let mut ocr = [0u8; 4];
                self.spi.read(&mut ocr)?;
                if u32::from_be_bytes(ocr) & OCR_CCS != 0 {
                    return self.finish(CardType::SdV2Hc).map(Some);
                }
                self.phase = Phase::SetBlockLen(CardType::SdV2);
            }
            Phase::SetBlockLen(card) => {
                let r = self.command(Command::SetBlockLen, BLOCK_SIZE as u32)?;
                if r != 0 {
                    return Err(Protocol::UnexpectedResponse(r).into());
                }
                return self.finish(card).map(Some);
            }
        }
        Ok(None)
    }

    /// Keep waiting unless the init deadline has passed
    fn retry_or(&mut self, error: Error) -> Result<()> {
        if self.deadline.expired(&self.clock) {
            self.stats.timeouts += 1;
            return Err(error);
        }
        self.stats.retries += 1;
        Ok(())
    }

    fn finish(&mut self, card: CardType) -> Result<CardType> {
        self.deselect();
        let hz = self.spi.set_frequency(self.config.operating_hz)?;
        self.card = Some(card);
        log_info!("SD card ready: {:?}, SPI at {} Hz", card, hz);
        Ok(card)
    }

    /// Address sent on the wire for sector `block`
    pub fn wire_address(&self, block: u32) -> Result<u32> {
        match self.card {
            None => Err(Error::NotReady),
            Some(card) if card.block_addressed() => Ok(block),
            Some(_) => block
                .checked_mul(BLOCK_SIZE as u32)
                .ok_or(Error::InvalidArgument),
        }
    }

    /// Sector count of a buffer, after checking the card can take I/O
    fn check_io(&self, len: usize) -> Result<u32> {
        if !self.socket.card_present() {
            return Err(Error::NoDevice);
        }
        if self.card.is_none() {
            return Err(Error::NotReady);
        }
        if len == 0 || len % BLOCK_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok((len / BLOCK_SIZE) as u32)
    }

    /// Read `buf.len() / 512` sectors starting at `block`
    ///
    /// A single sector uses CMD17; more use CMD18 followed by CMD12. A data
    /// CRC mismatch is retried up to `retries` times.
    pub fn read_blocks(&mut self, block: u32, buf: &mut [u8]) -> Result<()> {
        let count = self.check_io(buf.len())?;
        let addr = self.wire_address(block)?;
        let mut attempt = 0;
        let result = loop {
            let result = self.try_read(addr, count, buf);
            self.deselect();
            match result {
                Err(Error::Protocol(Protocol::Checksum)) if attempt < self.config.retries => {
                    attempt += 1;
                    self.stats.retries += 1;
                    log_warn!("CRC mismatch reading sector {}, retry {}", block, attempt);
                }
                other => break other,
            }
        };
        if result.is_ok() {
            self.stats.blocks_read += count;
        }
        self.last = result;
        result
    }

    fn try_read(&mut self, addr: u32, count: u32, buf: &mut [u8]) -> Result<()> {
        self.select()?;
        if count == 1 {
            self.expect_ok(Command::ReadSingle, addr)?;
            return self.receive_block(buf);
        }
        self.expect_ok(Command::ReadMultiple, addr)?;
        let mut result = Ok(());
        for sector in buf.chunks_exact_mut(BLOCK_SIZE) {
            result = self.receive_block(sector);
            if result.is_err() {
                break;
            }
        }
        let stopped = self
            .command(Command::StopTransmission, 0)
            .and_then(|_| self.wait_ready(self.config.write_timeout));
        result.and(stopped)
    }

    /// Write `data.len() / 512` sectors starting at `block`
    ///
    /// A single sector uses CMD24 and is confirmed with CMD13; more use
    /// ACMD23 (SD only) and CMD25 with a stop token.
    pub fn write_blocks(&mut self, block: u32, data: &[u8]) -> Result<()> {
        let count = self.check_io(data.len())?;
        if self.socket.write_protected() {
            return Err(Error::WriteProtected);
        }
        let addr = self.wire_address(block)?;
        let result = self.try_write(addr, count, data);
        self.deselect();
        match result {
            Ok(()) => self.stats.blocks_written += count,
            Err(e) => log_warn!("SD write of sector {} failed: {:?}", block, e),
        }
        self.last = result;
        result
    }

    fn try_write(&mut self, addr: u32, count: u32, data: &[u8]) -> Result<()> {
        let card = self.card.ok_or(Error::NotReady)?;
        self.select()?;
        if count == 1 {
            self.expect_ok(Command::WriteSingle, addr)?;
            self.send_block(TOKEN_START, data)?;
            return self.check_status();
        }
        if card != CardType::Mmc {
            self.expect_ok(Command::SetWriteBlockEraseCount, count)?;
        }
        self.expect_ok(Command::WriteMultiple, addr)?;
        let mut result = Ok(());
        for sector in data.chunks_exact(BLOCK_SIZE) {
            result = self.send_block(TOKEN_START_MULTI, sector);
            if result.is_err() {
                break;
            }
        }
        // The stop token is owed even after a rejected sector
        let ready = self.wait_ready(self.config.write_timeout);
        let stopped = self
            .spi
            .write(&[TOKEN_STOP, 0xFF])
            .and_then(|_| self.wait_ready(self.config.write_timeout));
        result.and(ready).and(stopped)
    }

    /// `true` while a split transfer is in flight
    pub fn is_transferring(&self) -> bool {
        self.pending.is_some()
    }

    /// Record the outcome of a split transfer and release the card
    fn settle(&mut self, result: Result<()>) -> Result<()> {
        self.pending = None;
        self.deselect();
        self.last = result;
        result
    }

    /// Assert CS, failing with `Busy` instead of waiting if MISO is held low
    fn select_now(&mut self) -> Result<()> {
        self.cs.set_low();
        self.transfer(0xFF)?;
        if self.transfer(0xFF)? != 0xFF {
            return Err(Error::Busy);
        }
        Ok(())
    }

    fn issue_read(&mut self, block: u32, attempt: u8) -> Result<()> {
        let addr = self.wire_address(block)?;
        self.select_now()?;
        self.expect_ok(Command::ReadSingle, addr)?;
        self.pending = Some(Pending::Token {
            block,
            deadline: Deadline::after(&self.clock, self.config.read_timeout),
            attempt,
        });
        Ok(())
    }

    /// Send CMD17 for `block`; finish with [`SdCard::poll_read`]
    pub fn begin_read(&mut self, block: u32) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::Busy);
        }
        self.check_io(BLOCK_SIZE)?;
        match self.issue_read(block, 0) {
            Ok(()) => Ok(()),
            Err(e) => self.settle(Err(e)),
        }
    }

    /// Look for the data token of the read started by [`SdCard::begin_read`]
    ///
    /// # Returns
    /// * `Ok(false)` while the card has not sent the token yet
    /// * `Ok(true)` once the sector is in `buf`
    /// * `Timeout` after `read_timeout` ticks, `Checksum` once retries run out
    pub fn poll_read(&mut self, buf: &mut [u8; BLOCK_SIZE]) -> Result<bool> {
        let Some(Pending::Token {
            block,
            deadline,
            attempt,
        }) = self.pending
        else {
            return Err(Error::NotReady);
        };
        let mut token = 0xFF;
        for _ in 0..POLL_BYTES {
            token = self.transfer(0xFF)?;
            if token != 0xFF {
                break;
            }
        }
        if token == 0xFF {
            if deadline.expired(&self.clock) {
                self.stats.timeouts += 1;
                self.settle(Err(Error::Timeout))?;
            }
            return Ok(false);
        }
        let result = if token == TOKEN_START {
            self.receive_payload(buf)
        } else {
            Err(Protocol::UnexpectedResponse(token).into())
        };
        match result {
            Ok(()) => {
                self.stats.blocks_read += 1;
                self.settle(Ok(())).map(|_| true)
            }
            Err(Error::Protocol(Protocol::Checksum)) if attempt < self.config.retries => {
                self.stats.retries += 1;
                log_warn!("CRC mismatch reading sector {}, retry {}", block, attempt + 1);
                self.deselect();
                if let Err(e) = self.issue_read(block, attempt + 1) {
                    self.settle(Err(e))?;
                }
                Ok(false)
            }
            Err(e) => self.settle(Err(e)).map(|_| false),
        }
    }

    /// Send CMD24 and the sector; finish with [`SdCard::poll_write`]
    pub fn begin_write(&mut self, block: u32, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::Busy);
        }
        self.check_io(BLOCK_SIZE)?;
        if self.socket.write_protected() {
            return Err(Error::WriteProtected);
        }
        let result = self.issue_write(block, data);
        if let Err(e) = result {
            log_warn!("SD write of sector {} failed: {:?}", block, e);
            return self.settle(Err(e));
        }
        Ok(())
    }

    fn issue_write(&mut self, block: u32, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        let addr = self.wire_address(block)?;
        self.select_now()?;
        self.expect_ok(Command::WriteSingle, addr)?;
        self.spi.write(&[TOKEN_START])?;
        self.spi.write(data)?;
        self.spi.write(&crc16(data).to_be_bytes())?;
        self.data_response()?;
        self.pending = Some(Pending::Programming {
            block,
            deadline: Deadline::after(&self.clock, self.config.write_timeout),
        });
        Ok(())
    }

    /// Check whether the card finished programming the sector
    ///
    /// # Returns
    /// * `Ok(false)` while MISO is still held low
    /// * `Ok(true)` once the card is idle and CMD13 reports no error
    /// * `Timeout` after `write_timeout` ticks
    pub fn poll_write(&mut self) -> Result<bool> {
        let Some(Pending::Programming { block, deadline }) = self.pending else {
            return Err(Error::NotReady);
        };
        let mut idle = false;
        for _ in 0..POLL_BYTES {
            if self.transfer(0xFF)? == 0xFF {
                idle = true;
                break;
            }
        }
        if !idle {
            if deadline.expired(&self.clock) {
                self.stats.timeouts += 1;
                log_warn!("SD card busy past the write timeout on sector {}", block);
                self.settle(Err(Error::Timeout))?;
            }
            return Ok(false);
        }
        match self.check_status() {
            Ok(()) => {
                self.stats.blocks_written += 1;
                self.settle(Ok(())).map(|_| true)
            }
            Err(e) => {
                log_warn!("SD write of sector {} failed: {:?}", block, e);
                self.settle(Err(e)).map(|_| false)
            }
        }
    }

    /// Decode the CSD register
    pub fn read_csd(&mut self) -> Result<Csd> {
        let card = self.card.ok_or(Error::NotReady)?;
        let mut raw = [0u8; 16];
        let result = self.fetch_csd(&mut raw);
        self.deselect();
        result?;
        Ok(Csd::parse(&raw, card))
    }

    fn fetch_csd(&mut self, raw: &mut [u8; 16]) -> Result<()> {
        self.select()?;
        self.expect_ok(Command::SendCsd, 0)?;
        self.receive_block(raw)
    }

    /// Filesystem control queries
    pub fn ioctl(&mut self, cmd: Ioctl) -> Result<u32> {
        if self.card.is_none() {
            return Err(Error::NotReady);
        }
        match cmd {
            Ioctl::Sync => {
                let ready = self.select();
                self.deselect();
                ready.map(|_| 0)
            }
            Ioctl::SectorSize => Ok(BLOCK_SIZE as u32),
            Ioctl::SectorCount => Ok(self.read_csd()?.sector_count),
            Ioctl::BlockSize => Ok(self.read_csd()?.erase_block),
        }
    }

    fn transfer(&mut self, byte: u8) -> Result<u8> {
        self.spi.transfer_byte(byte)
    }

    /// Assert CS and wait until the card stops signalling busy
    fn select(&mut self) -> Result<()> {
        self.cs.set_low();
        self.transfer(0xFF)?;
        self.wait_ready(self.config.write_timeout)
    }

    /// Release CS; one extra byte lets the card release MISO
    fn deselect(&mut self) {
        self.cs.set_high();
        let _ = self.transfer(0xFF);
    }

    fn wait_ready(&mut self, ticks: u32) -> Result<()> {
        let deadline = Deadline::after(&self.clock, ticks);
        loop {
            if self.transfer(0xFF)? == 0xFF {
                return Ok(());
            }
            if deadline.expired(&self.clock) {
                self.stats.timeouts += 1;
                return Err(Error::Timeout);
            }
        }
    }

    /// Send a command and return its R1
    fn command(&mut self, cmd: Command, arg: u32) -> Result<u8> {
        if cmd.is_app() {
            let r = self.command(Command::AppCmd, 0)?;
            if r > r1::IDLE {
                return Ok(r);
            }
        }
        self.spi.write(&cmd.frame(arg))?;
        if cmd == Command::StopTransmission {
            // Stuff byte
            self.transfer(0xFF)?;
        }
        // The response arrives within eight bytes (NCR)
        for _ in 0..10 {
            let r = self.transfer(0xFF)?;
            if r & 0x80 == 0 {
                self.stats.commands += 1;
                return Ok(r);
            }
        }
        self.stats.timeouts += 1;
        Err(Error::Timeout)
    }

    /// CMD13; R2 is R1 followed by the second status byte
    fn check_status(&mut self) -> Result<()> {
        let r = self.command(Command::SendStatus, 0)?;
        let status = self.transfer(0xFF)?;
        if r != 0 || status != 0 {
            return Err(Protocol::Rejected(if status != 0 { status } else { r }).into());
        }
        Ok(())
    }

    fn expect_ok(&mut self, cmd: Command, arg: u32) -> Result<()> {
        match self.command(cmd, arg)? {
            0 => Ok(()),
            r => Err(Protocol::Rejected(r).into()),
        }
    }

    fn receive_block(&mut self, buf: &mut [u8]) -> Result<()> {
        let deadline = Deadline::after(&self.clock, self.config.read_timeout);
        let token = loop {
            let b = self.transfer(0xFF)?;
            if b != 0xFF {
                break b;
            }
            if deadline.expired(&self.clock) {
                self.stats.timeouts += 1;
                return Err(Error::Timeout);
            }
        };
        if token != TOKEN_START {
            return Err(Protocol::UnexpectedResponse(token).into());
        }
        self.receive_payload(buf)
    }

    /// Data and CRC following a start token
    fn receive_payload(&mut self, buf: &mut [u8]) -> Result<()> {
        self.spi.read(buf)?;
        let mut crc = [0u8; 2];
        self.spi.read(&mut crc)?;
        if u16::from_be_bytes(crc) != crc16(buf) {
            self.stats.crc_errors += 1;
            return Err(Protocol::Checksum.into());
        }
        Ok(())
    }

    fn send_block(&mut self, token: u8, data: &[u8]) -> Result<()> {
        self.wait_ready(self.config.write_timeout)?;
        self.spi.write(&[token])?;
        self.spi.write(data)?;
        self.spi.write(&crc16(data).to_be_bytes())?;
        self.data_response()?;
        // MISO stays low while the card programs the sector
        self.wait_ready(self.config.write_timeout)
    }

    fn data_response(&mut self) -> Result<()> {
        match self.transfer(0xFF)? & data_response::MASK {
            data_response::ACCEPTED => Ok(()),
            data_response::CRC_ERROR => {
                self.stats.crc_errors += 1;
                Err(Protocol::Checksum.into())
            }
            other => Err(Protocol::Rejected(other).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct Ticker(Cell<u32>);

    impl TickSource for Ticker {
        fn now(&self) -> u32 {
            let t = self.0.get();
            self.0.set(t + 1);
            t
        }
    }

    /// Bus whose card never answers
    struct Floating;

    impl SpiBus for Floating {
        fn exchange(&mut self, _tx: &[u8], rx: &mut [u8]) -> Result<()> {
            rx.fill(0xFF);
            Ok(())
        }

        fn set_frequency(&mut self, hz: u32) -> Result<u32> {
            Ok(hz)
        }
    }

    struct Cs(bool);

    impl OutputPin for Cs {
        fn set_high(&mut self) {
            self.0 = true;
        }

        fn set_low(&mut self) {
            self.0 = false;
        }
    }

    struct Switches {
        present: bool,
        locked: bool,
    }

    impl Socket for Switches {
        fn card_present(&self) -> bool {
            self.present
        }

        fn write_protected(&self) -> bool {
            self.locked
        }
    }

    fn card() -> SdCard<Floating, Cs, Ticker> {
        SdCard::new(Floating, Cs(false), Ticker(Cell::new(0)), SdConfig::default())
    }

    #[test]
    fn missing_card_times_out_as_no_device() {
        let mut sd = card();
        assert!(sd.cs.0);
        assert_eq!(sd.init(), Err(Error::NoDevice));
        assert_eq!(sd.status(), Status::NotInit);
        assert_eq!(sd.last_status(), Err(Error::NoDevice));
        assert!(sd.stats().timeouts > 0);
        assert!(sd.cs.0);
    }

    #[test]
    fn io_requires_initialisation_and_whole_sectors() {
        let mut sd = card();
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(sd.read_blocks(0, &mut buf), Err(Error::NotReady));
        assert_eq!(sd.wire_address(3), Err(Error::NotReady));
        assert_eq!(sd.ioctl(Ioctl::SectorSize), Err(Error::NotReady));

        sd.card = Some(CardType::SdV2);
        assert_eq!(sd.read_blocks(0, &mut buf[..100]), Err(Error::InvalidArgument));
        assert_eq!(sd.write_blocks(0, &[]), Err(Error::InvalidArgument));
        assert_eq!(sd.ioctl(Ioctl::SectorSize), Ok(512));
    }

    #[test]
    fn wire_address_depends_on_capacity() {
        let mut sd = card();
        for (card, expected) in [
            (CardType::SdV2Hc, 100),
            (CardType::SdV2, 51_200),
            (CardType::SdV1, 51_200),
            (CardType::Mmc, 51_200),
        ] {
            sd.card = Some(card);
            assert_eq!(sd.wire_address(100), Ok(expected));
        }
        sd.card = Some(CardType::SdV1);
        assert_eq!(sd.wire_address(u32::MAX), Err(Error::InvalidArgument));
    }

    #[test]
    fn socket_switches_drive_status() {
        let mut sd = card().with_socket(Switches {
            present: false,
            locked: false,
        });
        assert_eq!(sd.status(), Status::NoDisk);
        assert_eq!(sd.init_step(), Err(Error::NoDevice));

        sd.socket.present = true;
        sd.card = Some(CardType::SdV2Hc);
        assert_eq!(sd.status(), Status::Ok);
        sd.socket.locked = true;
        assert_eq!(sd.status(), Status::WriteProtect);
        assert_eq!(
            sd.write_blocks(0, &[0u8; BLOCK_SIZE]),
            Err(Error::WriteProtected)
        );
    }
}
