//! u-blox GNSS receiver on a UART.
//!
//! The receiver interleaves NMEA sentences and UBX binary frames on one
//! link. [`Gps::poll`] drains the serial port through the [`Framer`], keeps
//! the latest valid position reports and merges them into one [`Fix`].
//!
//! Configuration is a list of UBX commands, each of which must be answered
//! by a matching `ACK-ACK`. [`Gps::upload_step`] advances the upload by one
//! bounded step for use from a state machine; [`Gps::configure`] runs it to
//! completion for early boot.

mod framer;
pub mod nmea;
pub mod ubx;

pub use framer::{Frame, FrameError, Framer};
pub use nmea::{Date, FixQuality, Gga, PubxPosition, Rmc, Sentence, UtcTime};
pub use ubx::{Ack, NavPvt, UbxFrame, UbxMessage};

use crate::peripherals::{Deadline, SerialPort, TickSource};
use crate::{Error, Protocol, Result};

/// GPS driver settings; times are in ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GpsConfig {
    /// Wait for the ACK of one configuration message
    pub ack_timeout: u32,
    /// Resends of a message after a NAK or timeout
    pub retries: u8,
    /// Age of the last valid GGA after which the fix is stale
    pub stale_timeout: u32,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            ack_timeout: 1000,
            retries: 3,
            stale_timeout: 2000,
        }
    }
}

/// Diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GpsStats {
    pub nmea_frames: u32,
    pub ubx_frames: u32,
    pub checksum_errors: u32,
    pub overflows: u32,
    pub truncated: u32,
    pub malformed: u32,
    /// UBX sync bytes without the second sync byte
    pub false_syncs: u32,
    pub acks: u32,
    pub naks: u32,
    pub ack_timeouts: u32,
    pub retries: u32,
}

/// Position merged from every valid report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Fix {
    pub time: UtcTime,
    pub date: Option<Date>,
    /// Degrees x 1e7
    pub latitude: i32,
    /// Degrees x 1e7
    pub longitude: i32,
    /// Above mean sea level, in cm
    pub altitude_cm: Option<i32>,
    pub quality: FixQuality,
    pub satellites: u8,
    /// Dilution of precision x 100 (HDOP, or PDOP from NAV-PVT)
    pub dop: u16,
    pub speed_mm_s: Option<u32>,
    pub course_cdeg: Option<u16>,
}

/// What a completed frame turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Received {
    Gga(Gga),
    Rmc(Rmc),
    Pubx(PubxPosition),
    NavPvt(NavPvt),
    Ack(Ack),
    /// Valid frame this driver does not interpret
    Other,
}

/// Progress of a configuration upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UploadStatus {
    Idle,
    InProgress,
    Done,
    Failed(Error),
}

struct Upload {
    messages: &'static [UbxMessage],
    index: usize,
    attempts: u32,
    /// Set while waiting for the ACK of `messages[index]`
    deadline: Option<Deadline>,
    reply: Option<bool>,
    status: UploadStatus,
}

/// GNSS receiver driver
pub struct Gps<U, C> {
    uart: U,
    clock: C,
    config: GpsConfig,
    framer: Framer,
    gga: Option<Gga>,
    gga_at: Option<u32>,
    rmc: Option<Rmc>,
    pubx: Option<PubxPosition>,
    nav_pvt: Option<NavPvt>,
    fix: Option<Fix>,
    fixes: u32,
    upload: Upload,
    stats: GpsStats,
}

impl<U: SerialPort, C: TickSource> Gps<U, C> {
    /// # Arguments
    /// * `uart` - Port the receiver is attached to, already at the right baud
    /// * `clock` - Tick source for ACK timeouts and staleness
    /// * `config` - Timeouts and retry count
    pub fn new(uart: U, clock: C, config: GpsConfig) -> Self {
        Self {
            uart,
            clock,
            config,
            framer: Framer::new(),
            gga: None,
            gga_at: None,
            rmc: None,
            pubx: None,
            nav_pvt: None,
            fix: None,
            fixes: 0,
            upload: Upload {
                messages: &[],
                index: 0,
                attempts: 0,
                deadline: None,
                reply: None,
                status: UploadStatus::Idle,
            },
            stats: GpsStats::default(),
        }
    }

    pub fn config(&self) -> &GpsConfig {
        &self.config
    }

    pub fn stats(&self) -> GpsStats {
        self.stats
    }

    /// The serial port, e.g. to follow a baud change sent with `CFG-PRT`
    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }

    /// Drain the serial port, returning the number of valid frames handled
    pub fn poll(&mut self) -> usize {
        let mut buf = [0u8; 64];
        let mut frames = 0;
        loop {
            let n = self.uart.read(&mut buf);
            if n == 0 {
                return frames;
            }
            for &byte in &buf[..n] {
                if self.feed(byte).is_some() {
                    frames += 1;
                }
            }
        }
    }

    /// Run one received byte through the framer
    pub fn feed(&mut self, byte: u8) -> Option<Received> {
        let result = self.framer.push(byte);
        let false_syncs = self.framer.take_false_syncs();
        if false_syncs > 0 {
            self.stats.false_syncs += false_syncs;
            log_debug!("GPS false UBX sync dropped");
        }
        match result? {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => {
                self.count_error(e);
                None
            }
        }
    }

    fn count_error(&mut self, error: FrameError) {
        match error {
            FrameError::Checksum => self.stats.checksum_errors += 1,
            FrameError::Overflow => self.stats.overflows += 1,
            FrameError::Truncated => self.stats.truncated += 1,
            FrameError::Malformed => self.stats.malformed += 1,
        }
        log_debug!("GPS frame dropped: {:?}", error);
    }

    /// Interpret a frame with a verified checksum
    pub fn handle_frame(&mut self, frame: Frame) -> Option<Received> {
        match frame {
            Frame::Nmea(body) => {
                self.stats.nmea_frames += 1;
                match nmea::parse(&body) {
                    Ok(sentence) => Some(self.handle_sentence(sentence)),
                    Err(e) => {
                        self.count_error(e);
                        None
                    }
                }
            }
            Frame::Ubx(frame) => {
                self.stats.ubx_frames += 1;
                Some(self.handle_ubx(&frame))
            }
        }
    }

    fn handle_sentence(&mut self, sentence: Sentence) -> Received {
        match sentence {
            Sentence::Gga(gga) => {
                if gga.quality.is_valid() {
                    self.gga = Some(gga);
                    self.gga_at = Some(self.clock.now());
                    let rmc = self.rmc;
                    let fix = self.update_fix(gga.time, gga.latitude, gga.longitude, gga.quality);
                    fix.altitude_cm = gga.altitude_cm;
                    fix.satellites = gga.satellites;
                    fix.dop = gga.hdop;
                    if let Some(rmc) = rmc {
                        fix.date = fix.date.or(rmc.date);
                        fix.speed_mm_s = fix.speed_mm_s.or(Some(rmc.speed_mm_s));
                        fix.course_cdeg = fix.course_cdeg.or(rmc.course_cdeg);
                    }
                }
                Received::Gga(gga)
            }
            Sentence::Rmc(rmc) => {
                if rmc.valid {
                    self.rmc = Some(rmc);
                    if let Some(fix) = self.fix.as_mut() {
                        fix.date = rmc.date.or(fix.date);
                        fix.speed_mm_s = Some(rmc.speed_mm_s);
                        fix.course_cdeg = rmc.course_cdeg;
                    }
                }
                Received::Rmc(rmc)
            }
            Sentence::Pubx(pubx) => {
                if pubx.quality.is_valid() {
                    self.pubx = Some(pubx);
                    let fix =
                        self.update_fix(pubx.time, pubx.latitude, pubx.longitude, pubx.quality);
                    fix.altitude_cm = Some(pubx.altitude_cm);
                    fix.satellites = pubx.satellites;
                    fix.dop = pubx.hdop;
                    fix.speed_mm_s = Some(pubx.speed_mm_s);
                    fix.course_cdeg = pubx.course_cdeg;
                }
                Received::Pubx(pubx)
            }
            Sentence::Other => Received::Other,
        }
    }

    fn handle_ubx(&mut self, frame: &UbxFrame) -> Received {
        if let Some(ack) = frame.ack() {
            if ack.acked {
                self.stats.acks += 1;
            } else {
                self.stats.naks += 1;
                log_warn!("GPS NAK for class {} id {}", ack.class, ack.id);
            }
            let awaited = self
                .upload
                .deadline
                .and_then(|_| self.upload.messages.get(self.upload.index).copied());
            if let Some(msg) = awaited {
                if msg.class == ack.class && msg.id == ack.id {
                    self.upload.reply = Some(ack.acked);
                }
            }
            return Received::Ack(ack);
        }
        if let Some(pvt) = frame.nav_pvt() {
            let quality = pvt.quality();
            if quality.is_valid() {
                self.nav_pvt = Some(pvt);
                let time = UtcTime {
                    hour: pvt.hour,
                    minute: pvt.minute,
                    second: pvt.second,
                    millis: 0,
                };
                let fix = self.update_fix(time, pvt.latitude, pvt.longitude, quality);
                fix.altitude_cm = Some(pvt.height_msl_mm / 10);
                fix.satellites = pvt.satellites;
                fix.dop = pvt.pdop;
                fix.speed_mm_s = Some(pvt.ground_speed_mm_s.max(0) as u32);
                fix.course_cdeg = Some((pvt.heading / 1000).clamp(0, 35_999) as u16);
                if pvt.date_valid() {
                    fix.date = Some(Date {
                        year: pvt.year,
                        month: pvt.month,
                        day: pvt.day,
                    });
                }
            }
            return Received::NavPvt(pvt);
        }
        Received::Other
    }

    /// Start or refresh the merged fix with a new position
    fn update_fix(
        &mut self,
        time: UtcTime,
        latitude: i32,
        longitude: i32,
        quality: FixQuality,
    ) -> &mut Fix {
        self.fixes = self.fixes.wrapping_add(1);
        let fix = self.fix.get_or_insert(Fix {
            time,
            date: None,
            latitude,
            longitude,
            altitude_cm: None,
            quality,
            satellites: 0,
            dop: 0,
            speed_mm_s: None,
            course_cdeg: None,
        });
        fix.time = time;
        fix.latitude = latitude;
        fix.longitude = longitude;
        fix.quality = quality;
        fix
    }

    /// Latest merged position, if any report carried a fix
    pub fn fix(&self) -> Option<Fix> {
        self.fix
    }

    /// Position updates accepted so far
    pub fn fix_count(&self) -> u32 {
        self.fixes
    }

    pub fn gga(&self) -> Option<Gga> {
        self.gga
    }

    pub fn rmc(&self) -> Option<Rmc> {
        self.rmc
    }

    pub fn pubx(&self) -> Option<PubxPosition> {
        self.pubx
    }

    pub fn nav_pvt(&self) -> Option<NavPvt> {
        self.nav_pvt
    }

    /// `true` when no valid GGA arrived within `stale_timeout`
    pub fn is_stale(&self) -> bool {
        self.is_stale_after(self.config.stale_timeout)
    }

    /// `true` when no valid GGA arrived within `timeout` ticks
    pub fn is_stale_after(&self, timeout: u32) -> bool {
        match self.gga_at {
            None => true,
            Some(at) => Deadline::starting_at(at, timeout).expired(&self.clock),
        }
    }

    /// Encode and transmit one UBX message
    pub fn send(&mut self, msg: &UbxMessage) -> Result<()> {
        let mut out = [0u8; ubx::MAX_COMMAND + 8];
        let n = msg.encode(&mut out)?;
        self.uart.write(&out[..n])
    }

    /// Start uploading `messages` in order
    ///
    /// # Returns
    /// * `Busy` if an upload is already in progress
    pub fn begin_config(&mut self, messages: &'static [UbxMessage]) -> Result<()> {
        if self.upload.status == UploadStatus::InProgress {
            return Err(Error::Busy);
        }
        self.upload = Upload {
            messages,
            index: 0,
            attempts: 0,
            deadline: None,
            reply: None,
            status: if messages.is_empty() {
                UploadStatus::Done
            } else {
                UploadStatus::InProgress
            },
        };
        Ok(())
    }

    pub fn upload_status(&self) -> UploadStatus {
        self.upload.status
    }

    /// Messages acknowledged so far in the current upload
    pub fn upload_progress(&self) -> usize {
        self.upload.index
    }

    /// Advance the upload by one bounded step
    ///
    /// Drains the serial port, then either moves on after an ACK, resends
    /// after a NAK or timeout, or keeps waiting. A message is sent at most
    /// `1 + retries` times before the upload fails.
    pub fn upload_step(&mut self) -> UploadStatus {
        if self.upload.status != UploadStatus::InProgress {
            return self.upload.status;
        }
        self.poll();

        if let Some(deadline) = self.upload.deadline {
            match self.upload.reply.take() {
                Some(true) => {
                    self.upload.index += 1;
                    self.upload.attempts = 0;
                    self.upload.deadline = None;
                    if self.upload.index == self.upload.messages.len() {
                        log_info!("GPS configured, {} messages", self.upload.index);
                        return self.finish_upload(UploadStatus::Done);
                    }
                }
                Some(false) => {
                    if let Err(e) = self.retry(Protocol::Nak.into()) {
                        return self.finish_upload(UploadStatus::Failed(e));
                    }
                }
                None if deadline.expired(&self.clock) => {
                    self.stats.ack_timeouts += 1;
                    if let Err(e) = self.retry(Error::Timeout) {
                        return self.finish_upload(UploadStatus::Failed(e));
                    }
                }
                None => return UploadStatus::InProgress,
            }
        }

        let Some(msg) = self.upload.messages.get(self.upload.index).copied() else {
            return self.finish_upload(UploadStatus::Done);
        };
        self.upload.attempts += 1;
        if let Err(e) = self.send(&msg) {
            return self.finish_upload(UploadStatus::Failed(e));
        }
        self.upload.deadline = Some(Deadline::after(&self.clock, self.config.ack_timeout));
        UploadStatus::InProgress
    }

    fn retry(&mut self, error: Error) -> Result<()> {
        if self.upload.attempts > self.config.retries as u32 {
            log_error!(
                "GPS config message {} failed: {:?}",
                self.upload.index,
                error
            );
            return Err(error);
        }
        self.stats.retries += 1;
        self.upload.deadline = None;
        Ok(())
    }

    fn finish_upload(&mut self, status: UploadStatus) -> UploadStatus {
        self.upload.deadline = None;
        self.upload.reply = None;
        self.upload.status = status;
        status
    }

    /// Blocking upload, bounded by `(1 + retries) * ack_timeout` per message
    pub fn configure(&mut self, messages: &'static [UbxMessage]) -> Result<()> {
        self.begin_config(messages)?;
        loop {
            match self.upload_step() {
                UploadStatus::InProgress => continue,
                UploadStatus::Done => return Ok(()),
                UploadStatus::Failed(e) => return Err(e),
                UploadStatus::Idle => return Err(Error::NotReady),
            }
        }
    }

    /// Drop partial frames and cached positions, abandoning any upload
    pub fn reset(&mut self) {
        self.framer.reset();
        self.gga = None;
        self.gga_at = None;
        self.rmc = None;
        self.pubx = None;
        self.nav_pvt = None;
        self.fix = None;
        self.finish_upload(UploadStatus::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::ubx::{class, id};
    use super::*;
    use core::cell::Cell;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Port {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl SerialPort for Port {
        fn write(&mut self, bytes: &[u8]) -> Result<()> {
            self.tx.extend_from_slice(bytes);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> usize {
            let n = buf.len().min(self.rx.len());
            for slot in &mut buf[..n] {
                *slot = self.rx.pop_front().unwrap();
            }
            n
        }
    }

    struct Clock(Cell<u32>);

    impl TickSource for Clock {
        fn now(&self) -> u32 {
            self.0.get()
        }
    }

    impl Clock {
        fn advance(&self, ticks: u32) {
            self.0.set(self.0.get().wrapping_add(ticks));
        }
    }

    fn ack(gps: &mut Gps<Port, &Clock>, acked: bool, class: u8, id: u8) {
        let reply = UbxMessage::with_payload(
            ubx::class::ACK,
            if acked { ubx::id::ACK_ACK } else { ubx::id::ACK_NAK },
            &[class, id],
        )
        .unwrap();
        let mut out = [0u8; 16];
        let n = reply.encode(&mut out).unwrap();
        gps.uart.rx.extend(&out[..n]);
    }

    const GGA: &[u8] = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";
    const RMC: &[u8] = b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";

    static CONFIG: [UbxMessage; 2] = [
        UbxMessage::cfg_rate(200, 1, 0),
        UbxMessage::cfg_msg(class::NMEA, 0x01, 0),
    ];

    #[test]
    fn gga_and_rmc_merge_into_one_fix() {
        let clock = Clock(Cell::new(0));
        let mut gps = Gps::new(Port::default(), &clock, GpsConfig::default());
        assert!(gps.is_stale());
        assert!(gps.fix().is_none());

        gps.uart.rx.extend(RMC);
        gps.uart.rx.extend(GGA);
        assert_eq!(gps.poll(), 2);
        let fix = gps.fix().unwrap();
        assert_eq!(fix.latitude, 481_173_000);
        assert_eq!(fix.longitude, 115_166_667);
        assert_eq!(fix.altitude_cm, Some(54_540));
        assert_eq!(fix.quality, FixQuality::Fix3D);
        assert_eq!(fix.speed_mm_s, Some(11_523));
        assert_eq!(fix.date.map(|d| d.year), Some(1994));
        assert_eq!(gps.fix_count(), 1);
        assert!(!gps.is_stale());

        clock.advance(1999);
        assert!(!gps.is_stale());
        clock.advance(1);
        assert!(gps.is_stale());
        assert!(!gps.is_stale_after(5000));
    }

    #[test]
    fn no_fix_sentence_is_not_cached() {
        let clock = Clock(Cell::new(0));
        let mut gps = Gps::new(Port::default(), &clock, GpsConfig::default());
        for &b in b"$GNGGA,000001,,,,,0,00,99.99,,,,,,*57\r\n" {
            gps.feed(b);
        }
        assert!(gps.gga().is_none());
        assert!(gps.is_stale());
        assert_eq!(gps.stats().nmea_frames, 1);
    }

    #[test]
    fn bad_frames_are_counted() {
        let clock = Clock(Cell::new(0));
        let mut gps = Gps::new(Port::default(), &clock, GpsConfig::default());
        gps.uart.rx.extend(b"$GPGGA,123519*00\r\n");
        gps.uart.rx.extend(b"$GPGGA,12*79\r\n");
        gps.uart.rx.extend(b"$GPGGA,1");
        gps.uart.rx.extend([0xB5, 0x62, 0x01, 0x07, 0xFF, 0x00]);
        assert_eq!(gps.poll(), 0);
        let stats = gps.stats();
        assert_eq!(stats.checksum_errors, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.truncated, 1);
        assert_eq!(stats.overflows, 1);
        assert_eq!(stats.false_syncs, 0);
    }

    #[test]
    fn false_sync_is_counted() {
        let clock = Clock(Cell::new(0));
        let mut gps = Gps::new(Port::default(), &clock, GpsConfig::default());
        gps.uart.rx.extend([0xB5, b'x', 0xB5]);
        gps.uart.rx.extend(b"$GPGSV,1,1,00*79\r\n");
        assert_eq!(gps.poll(), 1);
        let stats = gps.stats();
        assert_eq!(stats.false_syncs, 2);
        assert_eq!(stats.nmea_frames, 1);
        assert_eq!(stats.truncated, 0);
    }

    #[test]
    fn upload_advances_on_ack() {
        let clock = Clock(Cell::new(0));
        let mut gps = Gps::new(Port::default(), &clock, GpsConfig::default());
        gps.begin_config(&CONFIG).unwrap();
        assert_eq!(gps.begin_config(&CONFIG), Err(Error::Busy));

        assert_eq!(gps.upload_step(), UploadStatus::InProgress);
        assert_eq!(gps.uart.tx.len(), CONFIG[0].encoded_len());
        // Still waiting
        assert_eq!(gps.upload_step(), UploadStatus::InProgress);

        clock.advance(30);
        ack(&mut gps, true, class::CFG, id::CFG_RATE);
        assert_eq!(gps.upload_step(), UploadStatus::InProgress);
        assert_eq!(gps.upload_progress(), 1);
        assert_eq!(
            gps.uart.tx.len(),
            CONFIG[0].encoded_len() + CONFIG[1].encoded_len()
        );

        ack(&mut gps, true, class::CFG, id::CFG_MSG);
        assert_eq!(gps.upload_step(), UploadStatus::Done);
        assert_eq!(gps.stats().acks, 2);
        assert_eq!(gps.stats().retries, 0);
    }

    #[test]
    fn upload_fails_after_repeated_naks() {
        let clock = Clock(Cell::new(0));
        let mut gps = Gps::new(Port::default(), &clock, GpsConfig::default());
        gps.begin_config(&CONFIG[..1]).unwrap();
        gps.upload_step();
        let mut status = UploadStatus::InProgress;
        while status == UploadStatus::InProgress {
            ack(&mut gps, false, class::CFG, id::CFG_RATE);
            status = gps.upload_step();
        }
        assert_eq!(status, UploadStatus::Failed(Error::Protocol(Protocol::Nak)));
        assert_eq!(gps.uart.tx.len(), 4 * CONFIG[0].encoded_len());
        assert_eq!(gps.stats().naks, 4);
        assert_eq!(gps.stats().retries, 3);
    }

    #[test]
    fn upload_times_out_without_reply() {
        let clock = Clock(Cell::new(0));
        let mut gps = Gps::new(Port::default(), &clock, GpsConfig::default());
        gps.begin_config(&CONFIG).unwrap();
        gps.upload_step();
        // An ACK for another message does not count
        ack(&mut gps, true, class::CFG, id::CFG_PRT);
        let mut steps = 0;
        loop {
            clock.advance(1000);
            match gps.upload_step() {
                UploadStatus::InProgress => steps += 1,
                status => {
                    assert_eq!(status, UploadStatus::Failed(Error::Timeout));
                    break;
                }
            }
        }
        assert_eq!(steps, 3);
        assert_eq!(gps.stats().ack_timeouts, 4);
        assert_eq!(gps.upload_progress(), 0);
    }
}
