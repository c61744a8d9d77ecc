//! Splits an interleaved NMEA and UBX byte stream into frames.

use super::nmea::{Body, NmeaFramer};
use super::ubx::{UbxFrame, UbxFramer, SYNC1};

/// Reasons a frame was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Longer than the largest accepted frame
    Overflow,
    /// Checksum missing or wrong
    Checksum,
    /// Cut short by the start of another frame
    Truncated,
    /// Checksum fine but the fields do not parse
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Nmea(Body),
    Ubx(UbxFrame),
}

/// Routes each byte to the NMEA or UBX decoder
#[derive(Default)]
pub struct Framer {
    nmea: NmeaFramer,
    ubx: UbxFramer,
    false_syncs: u32,
}

impl Framer {
    pub const fn new() -> Self {
        Self {
            nmea: NmeaFramer::new(),
            ubx: UbxFramer::new(),
            false_syncs: 0,
        }
    }

    /// Feed one received byte
    ///
    /// A UBX sync byte ends any partial NMEA sentence, which is reported
    /// as `Truncated`. A sync byte not followed by the second one is
    /// dropped and decoding resumes with the byte after it.
    pub fn push(&mut self, byte: u8) -> Option<Result<Frame, FrameError>> {
        if self.ubx.is_active() {
            return match self.ubx.push(byte) {
                Some(Err(FrameError::Truncated)) => {
                    self.false_syncs = self.false_syncs.wrapping_add(1);
                    self.push(byte)
                }
                other => other.map(|r| r.map(Frame::Ubx)),
            };
        }
        if byte == SYNC1 {
            let cut = self.nmea.is_active();
            self.nmea.abort();
            self.ubx.push(byte);
            return cut.then_some(Err(FrameError::Truncated));
        }
        self.nmea.push(byte).map(|r| r.map(Frame::Nmea))
    }

    /// Sync bytes dropped since the last call
    pub fn take_false_syncs(&mut self) -> u32 {
        core::mem::take(&mut self.false_syncs)
    }

    pub fn reset(&mut self) {
        self.nmea.abort();
        self.ubx.reset();
    }
}
