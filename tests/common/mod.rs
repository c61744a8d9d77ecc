//! Host-side stand-ins for the hardware the drivers talk to.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use stm32f4_aof::drivers::gps::UbxMessage;
use stm32f4_aof::drivers::sd::{crc16, crc7, BLOCK_SIZE};
use stm32f4_aof::peripherals::{OutputPin, SerialPort, SpiBus, TickSource};
use stm32f4_aof::Result;

/// Clock that advances by one tick every time it is read
#[derive(Default)]
pub struct Ticker(Cell<u32>);

impl TickSource for Ticker {
    fn now(&self) -> u32 {
        let t = self.0.get();
        self.0.set(t.wrapping_add(1));
        t
    }
}

/// Clock that only moves when the test says so
#[derive(Default)]
pub struct ManualClock(Cell<u32>);

impl ManualClock {
    pub fn advance(&self, ticks: u32) {
        self.0.set(self.0.get().wrapping_add(ticks));
    }
}

impl TickSource for ManualClock {
    fn now(&self) -> u32 {
        self.0.get()
    }
}

/// Chip select that goes nowhere
pub struct Cs;

impl OutputPin for Cs {
    fn set_high(&mut self) {}
    fn set_low(&mut self) {}
}

enum Mode {
    Command,
    MultiRead { next: u32 },
    WriteToken { sector: u32, multi: bool },
    WriteData { sector: u32, multi: bool, buf: Vec<u8> },
}

/// SD card answering the SPI-mode protocol byte by byte
pub struct CardEmu {
    pub present: bool,
    pub high_capacity: bool,
    pub crc_enabled: bool,
    /// ACMD41 polls answered with "still idle" before the card is ready
    pub busy_polls: u32,
    /// Data blocks sent with a damaged CRC
    pub corrupt_reads: u32,
    /// Filler bytes before each data token
    pub read_latency: usize,
    /// Busy bytes after each accepted sector; `u32::MAX` never finishes
    pub write_busy: u32,
    /// Answer every data block with "write error"
    pub reject_writes: bool,
    /// Treat CMD59 as an illegal command
    pub refuse_crc: bool,
    /// Written sectors; the rest read back as `i % 256`
    pub sectors: HashMap<u32, [u8; BLOCK_SIZE]>,
    /// Index of every command received, in order
    pub commands: Vec<u8>,
    pub frequency: u32,
    idle: bool,
    app: bool,
    busy: u32,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    mode: Mode,
}

impl CardEmu {
    pub fn sdhc() -> Self {
        Self {
            present: true,
            high_capacity: true,
            crc_enabled: false,
            busy_polls: 2,
            corrupt_reads: 0,
            read_latency: 0,
            write_busy: 2,
            reject_writes: false,
            refuse_crc: false,
            sectors: HashMap::new(),
            commands: Vec::new(),
            frequency: 0,
            idle: false,
            app: false,
            busy: 0,
            out: VecDeque::new(),
            frame: Vec::new(),
            mode: Mode::Command,
        }
    }

    pub fn sdsc() -> Self {
        Self {
            high_capacity: false,
            ..Self::sdhc()
        }
    }

    pub fn pattern() -> [u8; BLOCK_SIZE] {
        core::array::from_fn(|i| (i % 256) as u8)
    }

    fn sector_of(&self, arg: u32) -> u32 {
        if self.high_capacity {
            arg
        } else {
            arg / BLOCK_SIZE as u32
        }
    }

    fn queue_data(&mut self, data: &[u8]) {
        let mut crc = crc16(data);
        if self.corrupt_reads > 0 {
            self.corrupt_reads -= 1;
            crc ^= 0xFFFF;
        }
        self.out.push_back(0xFF);
        self.out.extend(std::iter::repeat(0xFF).take(self.read_latency));
        self.out.push_back(0xFE);
        self.out.extend(data.iter().copied());
        self.out.extend(crc.to_be_bytes());
    }

    fn queue_sector(&mut self, sector: u32) {
        let data = self.sectors.get(&sector).copied().unwrap_or_else(Self::pattern);
        self.queue_data(&data);
    }

    fn csd(&self) -> [u8; 16] {
        let mut raw = [0u8; 16];
        if self.high_capacity {
            // Version 2.0, C_SIZE 15159
            raw[0] = 0x40;
            raw[7] = 0x00;
            raw[8] = 0x3B;
            raw[9] = 0x37;
        } else {
            // Version 1.0, READ_BL_LEN 9, C_SIZE 4095, C_SIZE_MULT 7
            raw[5] = 0x09;
            raw[6] = 0x03;
            raw[7] = 0xFF;
            raw[8] = 0xC0;
            raw[9] = 0x03;
            raw[10] = 0x80;
        }
        // SECTOR_SIZE 127 (128 write blocks), WRITE_BL_LEN 9
        raw[10] |= 0x3F;
        raw[11] = 0x80;
        raw[12] = 0x02;
        raw[13] = 0x40;
        raw
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.out.push_back(0xFF);
        self.out.extend(bytes.iter().copied());
    }

    fn command(&mut self) {
        let frame: Vec<u8> = self.frame.drain(..).collect();
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        self.out.clear();
        self.mode = Mode::Command;
        self.commands.push(index);

        let r1 = self.idle as u8;
        let checked = self.crc_enabled || index == 0 || index == 8;
        if checked && frame[5] != (crc7(&frame[..5]) << 1) | 1 {
            self.reply(&[r1 | 0x08]);
            return;
        }
        let app = std::mem::take(&mut self.app);
        match (index, app) {
            (0, _) => {
                self.idle = true;
                self.crc_enabled = false;
                self.reply(&[0x01]);
            }
            (8, _) => self.reply(&[r1, 0x00, 0x00, (arg >> 8) as u8 & 0x0F, arg as u8]),
            (9, _) => {
                self.reply(&[0x00]);
                let csd = self.csd();
                self.queue_data(&csd);
            }
            (12, _) => self.reply(&[0xFF, 0x00]),
            (13, _) => self.reply(&[0x00, 0x00]),
            (16, _) => self.reply(&[r1]),
            (17, _) => {
                self.reply(&[0x00]);
                let sector = self.sector_of(arg);
                self.queue_sector(sector);
            }
            (18, _) => {
                self.reply(&[0x00]);
                self.mode = Mode::MultiRead {
                    next: self.sector_of(arg),
                };
            }
            (23, true) => self.reply(&[0x00]),
            (24, _) | (25, _) => {
                self.reply(&[0x00]);
                self.mode = Mode::WriteToken {
                    sector: self.sector_of(arg),
                    multi: index == 25,
                };
            }
            (41, true) => {
                if self.busy_polls > 0 {
                    self.busy_polls -= 1;
                    self.reply(&[0x01]);
                } else {
                    self.idle = false;
                    self.reply(&[0x00]);
                }
            }
            (55, _) => {
                self.app = true;
                self.reply(&[r1]);
            }
            (58, _) => {
                let ocr0 = if self.high_capacity { 0xC0 } else { 0x80 };
                self.reply(&[r1, ocr0, 0xFF, 0x80, 0x00]);
            }
            (59, _) if self.refuse_crc => self.reply(&[r1 | 0x04]),
            (59, _) => {
                self.crc_enabled = arg & 1 == 1;
                self.reply(&[r1]);
            }
            _ => self.reply(&[r1 | 0x04]),
        }
    }

    /// Next byte on MISO: queued output, then busy, then idle
    fn next_out(&mut self) -> u8 {
        if let Some(byte) = self.out.pop_front() {
            byte
        } else if self.busy > 0 {
            self.busy -= 1;
            0x00
        } else {
            0xFF
        }
    }

    /// Exchange one byte
    pub fn step(&mut self, tx: u8) -> u8 {
        if !self.present {
            return 0xFF;
        }
        match std::mem::replace(&mut self.mode, Mode::Command) {
            Mode::WriteToken { sector, multi } => {
                let token = if multi { 0xFC } else { 0xFE };
                self.mode = if tx == token {
                    Mode::WriteData {
                        sector,
                        multi,
                        buf: Vec::with_capacity(BLOCK_SIZE + 2),
                    }
                } else if multi && tx == 0xFD {
                    self.out.push_back(0x00);
                    Mode::Command
                } else {
                    Mode::WriteToken { sector, multi }
                };
                self.next_out()
            }
            Mode::WriteData {
                sector,
                multi,
                mut buf,
            } => {
                buf.push(tx);
                if buf.len() < BLOCK_SIZE + 2 {
                    self.mode = Mode::WriteData { sector, multi, buf };
                    return 0xFF;
                }
                let crc = u16::from_be_bytes([buf[BLOCK_SIZE], buf[BLOCK_SIZE + 1]]);
                if self.crc_enabled && crc != crc16(&buf[..BLOCK_SIZE]) {
                    self.out.push_back(0x0B);
                } else if self.reject_writes {
                    self.out.push_back(0x0D);
                } else {
                    let mut data = [0u8; BLOCK_SIZE];
                    data.copy_from_slice(&buf[..BLOCK_SIZE]);
                    self.sectors.insert(sector, data);
                    self.out.push_back(0x05);
                    self.busy = self.write_busy;
                }
                self.mode = if multi {
                    Mode::WriteToken {
                        sector: sector + 1,
                        multi,
                    }
                } else {
                    Mode::Command
                };
                0xFF
            }
            mode => {
                self.mode = mode;
                if !self.frame.is_empty() || tx & 0xC0 == 0x40 {
                    let out = self.next_out();
                    self.frame.push(tx);
                    if self.frame.len() == 6 {
                        self.command();
                    }
                    return out;
                }
                if let Mode::MultiRead { next } = self.mode {
                    if self.out.is_empty() {
                        self.queue_sector(next);
                        self.mode = Mode::MultiRead { next: next + 1 };
                    }
                }
                self.next_out()
            }
        }
    }
}

/// Handle on a [`CardEmu`] the test keeps after the driver takes the bus
#[derive(Clone)]
pub struct SharedCard(pub Rc<RefCell<CardEmu>>);

impl SharedCard {
    pub fn new(card: CardEmu) -> Self {
        Self(Rc::new(RefCell::new(card)))
    }
}

impl SpiBus for SharedCard {
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        let mut card = self.0.borrow_mut();
        for (t, r) in tx.iter().zip(rx.iter_mut()) {
            *r = card.step(*t);
        }
        Ok(())
    }

    fn set_frequency(&mut self, hz: u32) -> Result<u32> {
        self.0.borrow_mut().frequency = hz;
        Ok(hz)
    }
}

/// Serial line with a scripted receive side
#[derive(Default)]
pub struct PortState {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct SharedPort(pub Rc<RefCell<PortState>>);

impl SharedPort {
    pub fn inject(&self, bytes: &[u8]) {
        self.0.borrow_mut().rx.extend(bytes.iter().copied());
    }

    pub fn take_tx(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.borrow_mut().tx)
    }
}

impl SerialPort for SharedPort {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.0.borrow_mut().tx.extend_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut state = self.0.borrow_mut();
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

/// Wire bytes of a UBX message
pub fn ubx_bytes(msg: &UbxMessage) -> Vec<u8> {
    let mut out = vec![0u8; msg.encoded_len()];
    let n = msg.encode(&mut out).unwrap();
    out.truncate(n);
    out
}
