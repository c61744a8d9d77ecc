//! NMEA-0183 sentence framing and field extraction.
//!
//! Positions are kept in integer fixed point: degrees x 1e7, altitude in
//! centimetres, HDOP x 100, speed in mm/s and course in centidegrees.

use super::FrameError;
use heapless::{String, Vec};

/// Longest sentence including `$` and CR-LF
pub const MAX_SENTENCE: usize = 82;
/// Characters between `$` and CR-LF
const MAX_BODY: usize = MAX_SENTENCE - 3;

/// Sentence text between `$` and `*`, checksum already verified
pub type Body = String<MAX_BODY>;

/// Byte-at-a-time sentence framer
pub struct NmeaFramer {
    buf: Vec<u8, { MAX_BODY + 1 }>,
    active: bool,
}

impl NmeaFramer {
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            active: false,
        }
    }

    /// `true` between `$` and the end of the sentence
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Drop a partial sentence
    pub fn abort(&mut self) {
        self.active = false;
        self.buf.clear();
    }

    /// Feed one byte
    ///
    /// # Returns
    /// * `None` while no sentence has ended
    /// * `Some(Ok(body))` for a sentence with a valid `*HH` checksum
    /// * `Some(Err(_))` for an overlong, cut-off or corrupted sentence
    pub fn push(&mut self, byte: u8) -> Option<Result<Body, FrameError>> {
        match byte {
            b'$' => {
                let cut = self.active;
                self.buf.clear();
                self.active = true;
                cut.then_some(Err(FrameError::Truncated))
            }
            _ if !self.active => None,
            b'\n' => {
                self.active = false;
                let result = verify(&self.buf);
                self.buf.clear();
                Some(result)
            }
            _ => {
                if self.buf.push(byte).is_err() {
                    self.abort();
                    return Some(Err(FrameError::Overflow));
                }
                None
            }
        }
    }
}

impl Default for NmeaFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

/// XOR of every character of `body`
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0, |acc, &c| acc ^ c)
}

/// Split `body*HH[\r]` and check the XOR checksum
fn verify(line: &[u8]) -> Result<Body, FrameError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    // Sentences without a checksum are rejected
    let star = line
        .iter()
        .rposition(|&c| c == b'*')
        .ok_or(FrameError::Checksum)?;
    let (body, tail) = (&line[..star], &line[star + 1..]);
    let expected = match tail {
        [hi, lo] => hex_digit(*hi)
            .zip(hex_digit(*lo))
            .map(|(h, l)| (h << 4) | l)
            .ok_or(FrameError::Checksum)?,
        _ => return Err(FrameError::Checksum),
    };
    if checksum(body) != expected {
        return Err(FrameError::Checksum);
    }
    if !body.is_ascii() {
        return Err(FrameError::Malformed);
    }
    let text = core::str::from_utf8(body).map_err(|_| FrameError::Malformed)?;
    let mut out = Body::new();
    out.push_str(text).map_err(|_| FrameError::Overflow)?;
    Ok(out)
}

/// Fix classification shared by GGA, PUBX and NAV-PVT
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FixQuality {
    NoFix,
    Fix2D,
    Fix3D,
    Dgps,
}

impl FixQuality {
    pub fn is_valid(self) -> bool {
        self != FixQuality::NoFix
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UtcTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub millis: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

/// Fix data (`GGA`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Gga {
    pub time: UtcTime,
    /// Degrees x 1e7, north positive
    pub latitude: i32,
    /// Degrees x 1e7, east positive
    pub longitude: i32,
    pub quality: FixQuality,
    pub satellites: u8,
    /// HDOP x 100
    pub hdop: u16,
    /// Above mean sea level, in cm
    pub altitude_cm: Option<i32>,
}

/// Recommended minimum data (`RMC`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Rmc {
    pub time: UtcTime,
    /// Status `A`
    pub valid: bool,
    pub latitude: i32,
    pub longitude: i32,
    pub speed_mm_s: u32,
    /// Course over ground in centidegrees
    pub course_cdeg: Option<u16>,
    pub date: Option<Date>,
}

/// u-blox `PUBX,00` position report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PubxPosition {
    pub time: UtcTime,
    pub latitude: i32,
    pub longitude: i32,
    pub altitude_cm: i32,
    pub quality: FixQuality,
    /// Horizontal accuracy estimate in cm
    pub h_acc_cm: u32,
    pub speed_mm_s: u32,
    pub course_cdeg: Option<u16>,
    pub hdop: u16,
    pub satellites: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sentence {
    Gga(Gga),
    Rmc(Rmc),
    Pubx(PubxPosition),
    /// Well-formed but not used here
    Other,
}

/// Extract the fields of a verified sentence body
pub fn parse(body: &str) -> Result<Sentence, FrameError> {
    let mut fields = body.split(',');
    let tag = fields.next().ok_or(FrameError::Malformed)?;
    let sentence = if tag == "PUBX" {
        match fields.next() {
            Some("00") => pubx(&mut fields).map(Sentence::Pubx),
            _ => Some(Sentence::Other),
        }
    } else if tag.len() == 5 {
        match tag.get(2..).unwrap_or_default() {
            "GGA" => gga(&mut fields).map(Sentence::Gga),
            "RMC" => rmc(&mut fields).map(Sentence::Rmc),
            _ => Some(Sentence::Other),
        }
    } else {
        Some(Sentence::Other)
    };
    sentence.ok_or(FrameError::Malformed)
}

type Fields<'a> = core::str::Split<'a, char>;

fn next<'a>(fields: &mut Fields<'a>) -> Option<&'a str> {
    fields.next()
}

fn gga(f: &mut Fields<'_>) -> Option<Gga> {
    let time = utc_time(next(f)?)?;
    let (lat, ns, lon, ew) = (next(f)?, next(f)?, next(f)?, next(f)?);
    let indicator = next(f)?;
    let satellites = next(f)?.parse().unwrap_or(0);
    let hdop = fixed(next(f)?, 2).unwrap_or(0).clamp(0, u16::MAX as i64) as u16;
    let altitude_cm = fixed(next(f)?, 2).map(|v| v as i32);

    let quality = match indicator {
        "" | "0" => FixQuality::NoFix,
        "2" => FixQuality::Dgps,
        _ if altitude_cm.is_some() => FixQuality::Fix3D,
        _ => FixQuality::Fix2D,
    };
    let (latitude, longitude) = if quality.is_valid() {
        (coordinate(lat, ns, 90)?, coordinate(lon, ew, 180)?)
    } else {
        (0, 0)
    };
    Some(Gga {
        time,
        latitude,
        longitude,
        quality,
        satellites,
        hdop,
        altitude_cm,
    })
}

fn rmc(f: &mut Fields<'_>) -> Option<Rmc> {
    let time = utc_time(next(f)?)?;
    let valid = next(f)? == "A";
    let (lat, ns, lon, ew) = (next(f)?, next(f)?, next(f)?, next(f)?);
    let (latitude, longitude) = if valid {
        (coordinate(lat, ns, 90)?, coordinate(lon, ew, 180)?)
    } else {
        (0, 0)
    };
    let knots_milli = fixed(next(f)?, 3).unwrap_or(0).max(0);
    let course_cdeg = fixed(next(f)?, 2).map(|c| c.clamp(0, 35_999) as u16);
    let date = date(next(f)?);
    Some(Rmc {
        time,
        valid,
        latitude,
        longitude,
        // 1 knot = 514.444 mm/s
        speed_mm_s: (knots_milli * 514_444 / 1_000_000) as u32,
        course_cdeg,
        date,
    })
}

fn pubx(f: &mut Fields<'_>) -> Option<PubxPosition> {
    let time = utc_time(next(f)?)?;
    let (lat, ns, lon, ew) = (next(f)?, next(f)?, next(f)?, next(f)?);
    let altitude_cm = fixed(next(f)?, 2).unwrap_or(0) as i32;
    let quality = match next(f)? {
        "G2" => FixQuality::Fix2D,
        "G3" => FixQuality::Fix3D,
        "D2" | "D3" => FixQuality::Dgps,
        _ => FixQuality::NoFix,
    };
    let h_acc_cm = fixed(next(f)?, 2).unwrap_or(0).max(0) as u32;
    let _v_acc = next(f)?;
    let kmh_milli = fixed(next(f)?, 3).unwrap_or(0).max(0);
    let course_cdeg = fixed(next(f)?, 2).map(|c| c.clamp(0, 35_999) as u16);
    let _v_vel = next(f)?;
    let _diff_age = next(f)?;
    let hdop = fixed(next(f)?, 2).unwrap_or(0).clamp(0, u16::MAX as i64) as u16;
    let _vdop = next(f)?;
    let _tdop = next(f)?;
    let satellites = next(f)?.parse().unwrap_or(0);

    let (latitude, longitude) = if quality.is_valid() {
        (coordinate(lat, ns, 90)?, coordinate(lon, ew, 180)?)
    } else {
        (0, 0)
    };
    Some(PubxPosition {
        time,
        latitude,
        longitude,
        altitude_cm,
        quality,
        h_acc_cm,
        // km/h x 1000 to mm/s
        speed_mm_s: (kmh_milli * 1000 / 3600) as u32,
        course_cdeg,
        hdop,
        satellites,
    })
}

/// Parse a decimal string scaled by `10^decimals`; extra digits are truncated
fn fixed(s: &str, decimals: u32) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (int, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    let mut value: i64 = 0;
    for c in int.bytes() {
        if !c.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((c - b'0') as i64)?;
    }
    let mut taken = 0;
    for c in frac.bytes() {
        if !c.is_ascii_digit() {
            return None;
        }
        if taken < decimals {
            value = value.checked_mul(10)?.checked_add((c - b'0') as i64)?;
            taken += 1;
        }
    }
    value = value.checked_mul(10i64.checked_pow(decimals - taken)?)?;
    Some(if negative { -value } else { value })
}

/// `dddmm.mmmm` plus hemisphere to degrees x 1e7
fn coordinate(value: &str, hemisphere: &str, max_degrees: i64) -> Option<i32> {
    let dot = value.find('.').unwrap_or(value.len());
    let split = dot.checked_sub(2).filter(|&at| at > 0)?;
    let (deg, min) = (value.get(..split)?, value.get(split..)?);
    let degrees: i64 = deg.parse().ok()?;
    let minutes_e7 = fixed(min, 7)?;
    if minutes_e7 >= 60 * 10_000_000 {
        return None;
    }
    let magnitude = degrees * 10_000_000 + (minutes_e7 + 30) / 60;
    if magnitude > max_degrees * 10_000_000 {
        return None;
    }
    match hemisphere {
        "N" | "E" => Some(magnitude as i32),
        "S" | "W" => Some(-magnitude as i32),
        _ => None,
    }
}

fn two_digits(s: &str, at: usize) -> Option<u8> {
    s.get(at..at + 2)?.parse().ok()
}

/// `hhmmss[.sss]`
fn utc_time(s: &str) -> Option<UtcTime> {
    let hour = two_digits(s, 0)?;
    let minute = two_digits(s, 2)?;
    let seconds_milli = fixed(s.get(4..)?, 3)?;
    let time = UtcTime {
        hour,
        minute,
        second: (seconds_milli / 1000) as u8,
        millis: (seconds_milli % 1000) as u16,
    };
    (time.hour < 24 && time.minute < 60 && time.second <= 60).then_some(time)
}

/// `ddmmyy`
fn date(s: &str) -> Option<Date> {
    if s.len() != 6 {
        return None;
    }
    let day = two_digits(s, 0)?;
    let month = two_digits(s, 2)?;
    let yy = two_digits(s, 4)? as u16;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };
    ((1..=12).contains(&month) && (1..=31).contains(&day)).then_some(Date { year, month, day })
}
