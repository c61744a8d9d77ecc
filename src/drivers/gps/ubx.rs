//! u-blox UBX binary protocol.
//!
//! Frame layout: `B5 62 class id len_lo len_hi payload.. ck_a ck_b`, with
//! the 8-bit Fletcher checksum taken over class through payload.

use super::nmea::FixQuality;
use super::FrameError;
use crate::{Error, Result};
use heapless::Vec;

pub const SYNC1: u8 = 0xB5;
pub const SYNC2: u8 = 0x62;

/// Largest payload accepted from the receiver
pub const MAX_PAYLOAD: usize = 100;
/// Largest payload this driver sends
pub const MAX_COMMAND: usize = 20;

pub mod class {
    pub const NAV: u8 = 0x01;
    pub const ACK: u8 = 0x05;
    pub const CFG: u8 = 0x06;
    pub const NMEA: u8 = 0xF0;
    pub const PUBX: u8 = 0xF1;
}

pub mod id {
    pub const ACK_NAK: u8 = 0x00;
    pub const ACK_ACK: u8 = 0x01;
    pub const CFG_PRT: u8 = 0x00;
    pub const CFG_MSG: u8 = 0x01;
    pub const CFG_RATE: u8 = 0x08;
    pub const NAV_PVT: u8 = 0x07;
}

/// Fletcher checksum over `bytes`
pub fn checksum(bytes: &[u8]) -> (u8, u8) {
    bytes.iter().fold((0u8, 0u8), |(a, b), &byte| {
        let a = a.wrapping_add(byte);
        (a, b.wrapping_add(a))
    })
}

/// Outgoing command with a fixed-size payload buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UbxMessage {
    pub class: u8,
    pub id: u8,
    len: u8,
    payload: [u8; MAX_COMMAND],
}

impl UbxMessage {
    /// Message with an empty payload; also used as a poll request
    pub const fn poll(class: u8, id: u8) -> Self {
        Self {
            class,
            id,
            len: 0,
            payload: [0; MAX_COMMAND],
        }
    }

    /// Copy `payload` into a new message
    ///
    /// # Returns
    /// * `InvalidArgument` if the payload is longer than [`MAX_COMMAND`]
    pub fn with_payload(class: u8, id: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_COMMAND {
            return Err(Error::InvalidArgument);
        }
        let mut msg = Self::poll(class, id);
        msg.payload[..payload.len()].copy_from_slice(payload);
        msg.len = payload.len() as u8;
        Ok(msg)
    }

    /// `CFG-MSG`: output `msg_class`/`msg_id` every `rate` navigation
    /// solutions on the current port; 0 disables it
    pub const fn cfg_msg(msg_class: u8, msg_id: u8, rate: u8) -> Self {
        let mut msg = Self::poll(class::CFG, id::CFG_MSG);
        msg.payload[0] = msg_class;
        msg.payload[1] = msg_id;
        msg.payload[2] = rate;
        msg.len = 3;
        msg
    }

    /// `CFG-RATE`
    ///
    /// # Arguments
    /// * `meas_ms` - Measurement period in ms
    /// * `nav_cycles` - Measurements per navigation solution
    /// * `time_ref` - 0 for UTC, 1 for GPS time
    pub const fn cfg_rate(meas_ms: u16, nav_cycles: u16, time_ref: u16) -> Self {
        let mut msg = Self::poll(class::CFG, id::CFG_RATE);
        let (m, n, t) = (
            meas_ms.to_le_bytes(),
            nav_cycles.to_le_bytes(),
            time_ref.to_le_bytes(),
        );
        msg.payload[0] = m[0];
        msg.payload[1] = m[1];
        msg.payload[2] = n[0];
        msg.payload[3] = n[1];
        msg.payload[4] = t[0];
        msg.payload[5] = t[1];
        msg.len = 6;
        msg
    }

    /// `CFG-PRT` for a UART port in 8N1
    ///
    /// # Arguments
    /// * `port` - Receiver port id, 1 for UART1
    /// * `baud` - New baud rate
    /// * `in_mask` - Accepted input protocols (bit 0 UBX, bit 1 NMEA)
    /// * `out_mask` - Enabled output protocols
    pub const fn cfg_prt_uart(port: u8, baud: u32, in_mask: u16, out_mask: u16) -> Self {
        let mut msg = Self::poll(class::CFG, id::CFG_PRT);
        let mode = 0x0000_08D0u32.to_le_bytes();
        let baud = baud.to_le_bytes();
        let (i, o) = (in_mask.to_le_bytes(), out_mask.to_le_bytes());
        msg.payload[0] = port;
        msg.payload[4] = mode[0];
        msg.payload[5] = mode[1];
        msg.payload[6] = mode[2];
        msg.payload[7] = mode[3];
        msg.payload[8] = baud[0];
        msg.payload[9] = baud[1];
        msg.payload[10] = baud[2];
        msg.payload[11] = baud[3];
        msg.payload[12] = i[0];
        msg.payload[13] = i[1];
        msg.payload[14] = o[0];
        msg.payload[15] = o[1];
        msg.len = 20;
        msg
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }

    /// Bytes on the wire
    pub fn encoded_len(&self) -> usize {
        self.len as usize + 8
    }

    /// Serialise into `out`
    ///
    /// # Returns
    /// * The number of bytes written, or `InvalidArgument` if `out` is short
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        let n = self.encoded_len();
        let frame = out.get_mut(..n).ok_or(Error::InvalidArgument)?;
        frame[0] = SYNC1;
        frame[1] = SYNC2;
        frame[2] = self.class;
        frame[3] = self.id;
        frame[4] = self.len;
        frame[5] = 0;
        frame[6..n - 2].copy_from_slice(self.payload());
        let (a, b) = checksum(&frame[2..n - 2]);
        frame[n - 2] = a;
        frame[n - 1] = b;
        Ok(n)
    }
}

/// A received frame with a verified checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UbxFrame {
    pub class: u8,
    pub id: u8,
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

/// `ACK-ACK` or `ACK-NAK` for a configuration command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ack {
    pub acked: bool,
    pub class: u8,
    pub id: u8,
}

/// Navigation position-velocity-time solution (`NAV-PVT`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NavPvt {
    /// GPS time of week in ms
    pub itow: u32,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// Validity flags: bit 0 date, bit 1 time
    pub valid: u8,
    pub fix_type: u8,
    /// Bit 0 set when the fix is within DOP and accuracy masks
    pub flags: u8,
    pub satellites: u8,
    /// Degrees x 1e7
    pub longitude: i32,
    pub latitude: i32,
    /// Height above ellipsoid in mm
    pub height_mm: i32,
    /// Height above mean sea level in mm
    pub height_msl_mm: i32,
    pub h_acc_mm: u32,
    pub ground_speed_mm_s: i32,
    /// Heading of motion, degrees x 1e5
    pub heading: i32,
    /// Position DOP x 100
    pub pdop: u16,
}

impl NavPvt {
    pub const LEN: usize = 92;

    pub fn quality(&self) -> FixQuality {
        let diff = self.flags & 0x02 != 0;
        match self.fix_type {
            _ if self.flags & 0x01 == 0 => FixQuality::NoFix,
            3 | 4 if diff => FixQuality::Dgps,
            2 => FixQuality::Fix2D,
            3 | 4 => FixQuality::Fix3D,
            _ => FixQuality::NoFix,
        }
    }

    pub fn date_valid(&self) -> bool {
        self.valid & 0x01 != 0
    }

    pub fn time_valid(&self) -> bool {
        self.valid & 0x02 != 0
    }
}

fn u16_at(p: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([p[at], p[at + 1]])
}

fn u32_at(p: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]])
}

fn i32_at(p: &[u8], at: usize) -> i32 {
    u32_at(p, at) as i32
}

impl UbxFrame {
    pub fn is(&self, class: u8, id: u8) -> bool {
        self.class == class && self.id == id
    }

    pub fn ack(&self) -> Option<Ack> {
        if self.class != class::ACK || self.payload.len() < 2 {
            return None;
        }
        let acked = match self.id {
            id::ACK_ACK => true,
            id::ACK_NAK => false,
            _ => return None,
        };
        Some(Ack {
            acked,
            class: self.payload[0],
            id: self.payload[1],
        })
    }

    pub fn nav_pvt(&self) -> Option<NavPvt> {
        if !self.is(class::NAV, id::NAV_PVT) || self.payload.len() < NavPvt::LEN {
            return None;
        }
        let p = &self.payload;
        Some(NavPvt {
            itow: u32_at(p, 0),
            year: u16_at(p, 4),
            month: p[6],
            day: p[7],
            hour: p[8],
            minute: p[9],
            second: p[10],
            valid: p[11],
            fix_type: p[20],
            flags: p[21],
            satellites: p[23],
            longitude: i32_at(p, 24),
            latitude: i32_at(p, 28),
            height_mm: i32_at(p, 32),
            height_msl_mm: i32_at(p, 36),
            h_acc_mm: u32_at(p, 40),
            ground_speed_mm_s: i32_at(p, 60),
            heading: i32_at(p, 64),
            pdop: u16_at(p, 76),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Sync1,
    Sync2,
    Class,
    Id,
    Len1,
    Len2,
    Payload,
    CkA,
    CkB,
}

/// Byte-at-a-time UBX frame decoder
pub struct UbxFramer {
    state: State,
    class: u8,
    id: u8,
    len: usize,
    payload: Vec<u8, MAX_PAYLOAD>,
    ck: (u8, u8),
    ck_a: u8,
}

impl UbxFramer {
    pub const fn new() -> Self {
        Self {
            state: State::Sync1,
            class: 0,
            id: 0,
            len: 0,
            payload: Vec::new(),
            ck: (0, 0),
            ck_a: 0,
        }
    }

    /// `true` once the first sync byte has been seen
    pub fn is_active(&self) -> bool {
        self.state != State::Sync1
    }

    pub fn reset(&mut self) {
        self.state = State::Sync1;
        self.payload.clear();
        self.ck = (0, 0);
    }

    fn sum(&mut self, byte: u8) {
        let a = self.ck.0.wrapping_add(byte);
        self.ck = (a, self.ck.1.wrapping_add(a));
    }

    /// Feed one byte
    ///
    /// # Returns
    /// * `None` while a frame is incomplete
    /// * `Some(Err(Truncated))` when the second sync byte does not follow
    ///   the first; the caller may hand that byte to another decoder
    pub fn push(&mut self, byte: u8) -> Option<core::result::Result<UbxFrame, FrameError>> {
        match self.state {
            State::Sync1 => {
                if byte == SYNC1 {
                    self.reset();
                    self.state = State::Sync2;
                }
                None
            }
            State::Sync2 => {
                if byte == SYNC2 {
                    self.state = State::Class;
                    None
                } else {
                    self.reset();
                    Some(Err(FrameError::Truncated))
                }
            }
            State::Class => {
                self.class = byte;
                self.sum(byte);
                self.state = State::Id;
                None
            }
            State::Id => {
                self.id = byte;
                self.sum(byte);
                self.state = State::Len1;
                None
            }
            State::Len1 => {
                self.len = byte as usize;
                self.sum(byte);
                self.state = State::Len2;
                None
            }
            State::Len2 => {
                self.len |= (byte as usize) << 8;
                self.sum(byte);
                if self.len > MAX_PAYLOAD {
                    self.reset();
                    return Some(Err(FrameError::Overflow));
                }
                self.state = if self.len == 0 {
                    State::CkA
                } else {
                    State::Payload
                };
                None
            }
            State::Payload => {
                // Length was bounded in Len2
                let _ = self.payload.push(byte);
                self.sum(byte);
                if self.payload.len() == self.len {
                    self.state = State::CkA;
                }
                None
            }
            State::CkA => {
                self.ck_a = byte;
                self.state = State::CkB;
                None
            }
            State::CkB => {
                let ok = (self.ck_a, byte) == self.ck;
                let frame = UbxFrame {
                    class: self.class,
                    id: self.id,
                    payload: core::mem::take(&mut self.payload),
                };
                self.reset();
                Some(if ok { Ok(frame) } else { Err(FrameError::Checksum) })
            }
        }
    }
}

impl Default for UbxFramer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Option<core::result::Result<UbxFrame, FrameError>> {
        let mut framer = UbxFramer::new();
        let mut out = None;
        for &b in bytes {
            if let Some(r) = framer.push(b) {
                out = Some(r);
            }
        }
        out
    }

    #[test]
    fn fletcher_checksum() {
        assert_eq!(checksum(&[0x06, 0x01, 0x03, 0x00, 0xF0, 0x00, 0x01]), (0xFB, 0x10));
    }

    #[test]
    fn encodes_cfg_msg() {
        let msg = UbxMessage::cfg_msg(class::NMEA, 0x00, 1);
        let mut out = [0u8; 32];
        let n = msg.encode(&mut out).unwrap();
        assert_eq!(
            out[..n],
            [0xB5, 0x62, 0x06, 0x01, 0x03, 0x00, 0xF0, 0x00, 0x01, 0xFB, 0x10]
        );
        assert_eq!(msg.encode(&mut [0u8; 4]), Err(Error::InvalidArgument));
    }

    #[test]
    fn builders_lay_out_payloads() {
        let rate = UbxMessage::cfg_rate(200, 1, 0);
        assert_eq!(rate.payload(), [0xC8, 0x00, 0x01, 0x00, 0x00, 0x00]);

        let prt = UbxMessage::cfg_prt_uart(1, 115_200, 0x0003, 0x0001);
        let p = prt.payload();
        assert_eq!(p.len(), 20);
        assert_eq!(p[0], 1);
        assert_eq!(p[4..8], [0xD0, 0x08, 0x00, 0x00]);
        assert_eq!(p[8..12], [0x00, 0xC2, 0x01, 0x00]);
        assert_eq!(p[12..16], [0x03, 0x00, 0x01, 0x00]);

        assert!(UbxMessage::with_payload(class::CFG, 0x09, &[0; 21]).is_err());
        let poll = UbxMessage::with_payload(class::NAV, id::NAV_PVT, &[]).unwrap();
        assert_eq!(poll, UbxMessage::poll(class::NAV, id::NAV_PVT));
        assert_eq!(poll.encoded_len(), 8);
    }

    #[test]
    fn decodes_encoded_ack() {
        let ack = UbxMessage::with_payload(class::ACK, id::ACK_ACK, &[class::CFG, id::CFG_MSG]).unwrap();
        let mut out = [0u8; 16];
        let n = ack.encode(&mut out).unwrap();
        let frame = decode(&out[..n]).unwrap().unwrap();
        assert_eq!(
            frame.ack(),
            Some(Ack {
                acked: true,
                class: class::CFG,
                id: id::CFG_MSG
            })
        );
        assert!(frame.nav_pvt().is_none());

        out[n - 1] ^= 0xFF;
        assert_eq!(decode(&out[..n]), Some(Err(FrameError::Checksum)));
    }

    #[test]
    fn rejects_oversized_and_false_sync() {
        assert_eq!(
            decode(&[0xB5, 0x62, 0x01, 0x07, 0xFF, 0x00]),
            Some(Err(FrameError::Overflow))
        );
        assert_eq!(decode(&[0xB5, b'$']), Some(Err(FrameError::Truncated)));
    }

    #[test]
    fn nav_pvt_fields() {
        let mut p = [0u8; NavPvt::LEN];
        p[4..6].copy_from_slice(&2024u16.to_le_bytes());
        p[6] = 5;
        p[7] = 17;
        p[8] = 12;
        p[11] = 0x03;
        p[20] = 3;
        p[21] = 0x01;
        p[23] = 11;
        p[24..28].copy_from_slice(&85_652_531i32.to_le_bytes());
        p[28..32].copy_from_slice(&(-338_500_000i32).to_le_bytes());
        p[36..40].copy_from_slice(&546_589i32.to_le_bytes());
        p[76..78].copy_from_slice(&150u16.to_le_bytes());
        let frame = UbxFrame {
            class: class::NAV,
            id: id::NAV_PVT,
            payload: Vec::from_slice(&p).unwrap(),
        };
        let pvt = frame.nav_pvt().unwrap();
        assert_eq!(pvt.year, 2024);
        assert_eq!(pvt.latitude, -338_500_000);
        assert_eq!(pvt.longitude, 85_652_531);
        assert_eq!(pvt.height_msl_mm, 546_589);
        assert_eq!(pvt.satellites, 11);
        assert_eq!(pvt.pdop, 150);
        assert_eq!(pvt.quality(), FixQuality::Fix3D);
        assert!(pvt.date_valid() && pvt.time_valid());

        let short = UbxFrame {
            class: class::NAV,
            id: id::NAV_PVT,
            payload: Vec::from_slice(&p[..40]).unwrap(),
        };
        assert!(short.nav_pvt().is_none());
    }
}
