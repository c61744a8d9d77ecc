//! FlySky IBUS RC receiver protocol.
//!
//! Every frame is 32 bytes: the length `0x20`, the command `0x40`, fourteen
//! little-endian channel values and a little-endian checksum equal to
//! `0xFFFF` minus the sum of the 30 bytes before it.

use crate::peripherals::SerialPort;
use crate::{Error, Protocol, Result};

pub const FRAME_LEN: usize = 32;
pub const CHANNELS: usize = 14;

const HEADER_LEN: u8 = 0x20;
const HEADER_CMD: u8 = 0x40;
const PAYLOAD_END: usize = FRAME_LEN - 2;

/// Channel values, typically 1000 to 2000 µs
pub type Channels = [u16; CHANNELS];

/// `0xFFFF` minus the byte sum of `bytes`
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0xFFFFu16, |acc, &b| acc.wrapping_sub(b as u16))
}

/// Build a complete frame
pub fn encode(channels: &Channels) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = HEADER_LEN;
    frame[1] = HEADER_CMD;
    for (slot, value) in frame[2..PAYLOAD_END].chunks_exact_mut(2).zip(channels) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
    let ck = checksum(&frame[..PAYLOAD_END]);
    frame[PAYLOAD_END..].copy_from_slice(&ck.to_le_bytes());
    frame
}

/// Check and unpack one frame
///
/// # Returns
/// * `InvalidArgument` if `frame` is not 32 bytes
/// * `Protocol(UnexpectedResponse)` for a bad header byte
/// * `Protocol(Checksum)` for a checksum mismatch
pub fn decode(frame: &[u8]) -> Result<Channels> {
    if frame.len() != FRAME_LEN {
        return Err(Error::InvalidArgument);
    }
    if frame[0] != HEADER_LEN {
        return Err(Protocol::UnexpectedResponse(frame[0]).into());
    }
    if frame[1] != HEADER_CMD {
        return Err(Protocol::UnexpectedResponse(frame[1]).into());
    }
    let received = u16::from_le_bytes([frame[PAYLOAD_END], frame[PAYLOAD_END + 1]]);
    if received != checksum(&frame[..PAYLOAD_END]) {
        return Err(Protocol::Checksum.into());
    }
    let mut channels = [0u16; CHANNELS];
    for (value, raw) in channels.iter_mut().zip(frame[2..PAYLOAD_END].chunks_exact(2)) {
        *value = u16::from_le_bytes([raw[0], raw[1]]);
    }
    Ok(channels)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IbusStats {
    pub frames: u32,
    pub checksum_errors: u32,
    /// Bytes skipped while hunting for a header
    pub discarded: u32,
}

/// Byte-at-a-time frame assembler
pub struct IbusParser {
    buf: [u8; FRAME_LEN],
    len: usize,
    stats: IbusStats,
}

impl IbusParser {
    pub const fn new() -> Self {
        Self {
            buf: [0; FRAME_LEN],
            len: 0,
            stats: IbusStats {
                frames: 0,
                checksum_errors: 0,
                discarded: 0,
            },
        }
    }

    pub fn stats(&self) -> IbusStats {
        self.stats
    }

    /// Feed one byte, returning the channels when a valid frame completes
    pub fn push(&mut self, byte: u8) -> Option<Channels> {
        let expected = match self.len {
            0 => Some(HEADER_LEN),
            1 => Some(HEADER_CMD),
            _ => None,
        };
        if let Some(header) = expected {
            if byte != header {
                self.stats.discarded += self.len as u32 + 1;
                // The stray byte may itself open a frame
                self.len = 0;
                if byte == HEADER_LEN {
                    self.stats.discarded -= 1;
                    self.buf[0] = byte;
                    self.len = 1;
                }
                return None;
            }
        }
        self.buf[self.len] = byte;
        self.len += 1;
        if self.len < FRAME_LEN {
            return None;
        }
        self.len = 0;
        match decode(&self.buf) {
            Ok(channels) => {
                self.stats.frames += 1;
                Some(channels)
            }
            Err(_) => {
                self.stats.checksum_errors += 1;
                log_debug!("IBUS checksum mismatch");
                None
            }
        }
    }
}

impl Default for IbusParser {
    fn default() -> Self {
        Self::new()
    }
}

/// RC receiver on a serial port
pub struct Ibus<U> {
    uart: U,
    parser: IbusParser,
    channels: Option<Channels>,
}

impl<U: SerialPort> Ibus<U> {
    pub fn new(uart: U) -> Self {
        Self {
            uart,
            parser: IbusParser::new(),
            channels: None,
        }
    }

    /// Drain the port; returns the newest channels if a frame completed
    pub fn poll(&mut self) -> Option<Channels> {
        let mut buf = [0u8; FRAME_LEN];
        let mut latest = None;
        loop {
            let n = self.uart.read(&mut buf);
            if n == 0 {
                break;
            }
            for &byte in &buf[..n] {
                if let Some(channels) = self.parser.push(byte) {
                    latest = Some(channels);
                }
            }
        }
        if latest.is_some() {
            self.channels = latest;
        }
        latest
    }

    /// Channels from the last valid frame
    pub fn channels(&self) -> Option<Channels> {
        self.channels
    }

    pub fn stats(&self) -> IbusStats {
        self.parser.stats()
    }
}
