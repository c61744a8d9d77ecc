//! Disk-I/O binding for a FAT filesystem layer.
//!
//! Mirrors the FatFs `diskio` entry points: status bits, result codes and
//! ioctl numbers have the values FatFs expects. Only physical drive 0
//! exists. File timestamps come from a [`WallClock`] advanced by ticks.
//!
//! Scheduling is cooperative, so the FatFs re-entrancy hooks are no-ops.

use crate::drivers::gps::{Date, UtcTime};
use crate::drivers::sd::{Ioctl, SdCard, Socket, Status};
use crate::peripherals::{OutputPin, SpiBus, TickSource};
use crate::{Error, Result};

/// Drive status bits
pub type DStatus = u8;

pub const STA_NOINIT: DStatus = 0x01;
pub const STA_NODISK: DStatus = 0x02;
pub const STA_PROTECT: DStatus = 0x04;

/// Result of a disk function
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DResult {
    Ok = 0,
    Error = 1,
    WrPrt = 2,
    NotRdy = 3,
    ParErr = 4,
}

impl From<Error> for DResult {
    fn from(error: Error) -> Self {
        match error {
            Error::NotReady | Error::NoDevice => DResult::NotRdy,
            Error::WriteProtected => DResult::WrPrt,
            Error::InvalidArgument => DResult::ParErr,
            _ => DResult::Error,
        }
    }
}

impl<T> From<Result<T>> for DResult {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(_) => DResult::Ok,
            Err(e) => e.into(),
        }
    }
}

/// ioctl commands
pub const CTRL_SYNC: u8 = 0;
pub const GET_SECTOR_COUNT: u8 = 1;
pub const GET_SECTOR_SIZE: u8 = 2;
pub const GET_BLOCK_SIZE: u8 = 3;

pub const SECTOR_SIZE: usize = 512;

/// Sector-addressed storage
pub trait BlockDevice {
    fn initialize(&mut self) -> Result<()>;

    fn status(&self) -> Status;

    /// Read `buf.len() / 512` sectors starting at `sector`
    fn read(&mut self, sector: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `data.len() / 512` sectors starting at `sector`
    fn write(&mut self, sector: u32, data: &[u8]) -> Result<()>;

    fn ioctl(&mut self, cmd: Ioctl) -> Result<u32>;
}

impl<S, P, C, K> BlockDevice for SdCard<S, P, C, K>
where
    S: SpiBus,
    P: OutputPin,
    C: TickSource,
    K: Socket,
{
    fn initialize(&mut self) -> Result<()> {
        self.init().map(|_| ())
    }

    fn status(&self) -> Status {
        SdCard::status(self)
    }

    fn read(&mut self, sector: u32, buf: &mut [u8]) -> Result<()> {
        self.read_blocks(sector, buf)
    }

    fn write(&mut self, sector: u32, data: &[u8]) -> Result<()> {
        self.write_blocks(sector, data)
    }

    fn ioctl(&mut self, cmd: Ioctl) -> Result<u32> {
        SdCard::ioctl(self, cmd)
    }
}

/// Calendar date and time of day, UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    /// Earliest time a FAT timestamp can hold
    pub const EPOCH: DateTime = DateTime {
        year: 1980,
        month: 1,
        day: 1,
        hour: 0,
        minute: 0,
        second: 0,
    };

    pub fn from_gps(date: Date, time: UtcTime) -> Self {
        Self {
            year: date.year,
            month: date.month,
            day: date.day,
            hour: time.hour,
            minute: time.minute,
            second: time.second.min(59),
        }
    }

    /// Seconds since 1980-01-01, `None` before that or for invalid fields
    pub fn to_fat_seconds(&self) -> Option<u32> {
        if !(1..=12).contains(&self.month)
            || !(1..=31).contains(&self.day)
            || self.hour > 23
            || self.minute > 59
            || self.second > 59
        {
            return None;
        }
        let days = days_from_civil(self.year as i64, self.month as i64, self.day as i64)
            - days_from_civil(1980, 1, 1);
        let seconds = days * 86_400
            + self.hour as i64 * 3600
            + self.minute as i64 * 60
            + self.second as i64;
        u32::try_from(seconds).ok()
    }

    pub fn from_fat_seconds(seconds: u32) -> Self {
        let days = (seconds / 86_400) as i64 + days_from_civil(1980, 1, 1);
        let (year, month, day) = civil_from_days(days);
        let rem = seconds % 86_400;
        Self {
            year: year as u16,
            month: month as u8,
            day: day as u8,
            hour: (rem / 3600) as u8,
            minute: (rem / 60 % 60) as u8,
            second: (rem % 60) as u8,
        }
    }

    /// Packed FAT timestamp, two-second resolution
    pub fn to_fattime(&self) -> u32 {
        ((self.year.saturating_sub(1980) as u32) << 25)
            | ((self.month as u32) << 21)
            | ((self.day as u32) << 16)
            | ((self.hour as u32) << 11)
            | ((self.minute as u32) << 5)
            | (self.second as u32 / 2)
    }
}

/// Days since 1970-01-01 of a proleptic Gregorian date
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe + era * 400 + if m <= 2 { 1 } else { 0 };
    (y, m, d)
}

/// Software clock: a base time plus the ticks elapsed since it was set
pub struct WallClock<T> {
    clock: T,
    tick_hz: u32,
    base: u32,
    base_tick: u32,
}

impl<T: TickSource> WallClock<T> {
    /// Starts at 2024-01-01 00:00:00 until [`WallClock::set`] is called
    pub fn new(clock: T, tick_hz: u32) -> Self {
        let default = DateTime {
            year: 2024,
            ..DateTime::EPOCH
        };
        let base_tick = clock.now();
        Self {
            clock,
            tick_hz: tick_hz.max(1),
            base: default.to_fat_seconds().unwrap_or(0),
            base_tick,
        }
    }

    /// # Returns
    /// * `InvalidArgument` for dates before 1980 or out-of-range fields
    pub fn set(&mut self, now: DateTime) -> Result<()> {
        self.base = now.to_fat_seconds().ok_or(Error::InvalidArgument)?;
        self.base_tick = self.clock.now();
        Ok(())
    }

    /// Current time; folds whole elapsed seconds into the base so the tick
    /// counter can wrap
    pub fn now(&mut self) -> DateTime {
        let elapsed = self.clock.now().wrapping_sub(self.base_tick) / self.tick_hz;
        self.base = self.base.saturating_add(elapsed);
        self.base_tick = self.base_tick.wrapping_add(elapsed * self.tick_hz);
        DateTime::from_fat_seconds(self.base)
    }
}

/// FatFs disk-I/O entry points over one block device
pub struct DiskIo<D, T> {
    device: D,
    clock: WallClock<T>,
}

impl<D: BlockDevice, T: TickSource> DiskIo<D, T> {
    pub fn new(device: D, clock: WallClock<T>) -> Self {
        Self { device, clock }
    }

    pub fn device(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn clock(&mut self) -> &mut WallClock<T> {
        &mut self.clock
    }

    fn status_bits(&self) -> DStatus {
        match self.device.status() {
            Status::Ok => 0,
            Status::NotInit => STA_NOINIT,
            Status::NoDisk => STA_NOINIT | STA_NODISK,
            Status::WriteProtect => STA_PROTECT,
        }
    }

    pub fn disk_initialize(&mut self, pdrv: u8) -> DStatus {
        if pdrv != 0 {
            return STA_NOINIT;
        }
        if let Err(e) = self.device.initialize() {
            log_warn!("disk_initialize failed: {:?}", e);
        }
        self.status_bits()
    }

    pub fn disk_status(&self, pdrv: u8) -> DStatus {
        if pdrv != 0 {
            return STA_NOINIT;
        }
        self.status_bits()
    }

    /// Check the drive number and size the buffer to `count` sectors
    fn span(pdrv: u8, len: usize, count: u32) -> core::result::Result<usize, DResult> {
        let bytes = (count as usize)
            .checked_mul(SECTOR_SIZE)
            .filter(|&n| pdrv == 0 && n > 0 && n <= len)
            .ok_or(DResult::ParErr)?;
        Ok(bytes)
    }

    pub fn disk_read(&mut self, pdrv: u8, buf: &mut [u8], sector: u32, count: u32) -> DResult {
        match Self::span(pdrv, buf.len(), count) {
            Ok(n) => self.device.read(sector, &mut buf[..n]).into(),
            Err(r) => r,
        }
    }

    pub fn disk_write(&mut self, pdrv: u8, buf: &[u8], sector: u32, count: u32) -> DResult {
        match Self::span(pdrv, buf.len(), count) {
            Ok(n) => self.device.write(sector, &buf[..n]).into(),
            Err(r) => r,
        }
    }

    /// # Arguments
    /// * `cmd` - One of `CTRL_SYNC`, `GET_SECTOR_COUNT`, `GET_SECTOR_SIZE`,
    ///   `GET_BLOCK_SIZE`
    /// * `out` - Receives the queried value
    pub fn disk_ioctl(&mut self, pdrv: u8, cmd: u8, out: &mut u32) -> DResult {
        if pdrv != 0 {
            return DResult::ParErr;
        }
        let cmd = match cmd {
            CTRL_SYNC => Ioctl::Sync,
            GET_SECTOR_COUNT => Ioctl::SectorCount,
            GET_SECTOR_SIZE => Ioctl::SectorSize,
            GET_BLOCK_SIZE => Ioctl::BlockSize,
            _ => return DResult::ParErr,
        };
        match self.device.ioctl(cmd) {
            Ok(value) => {
                *out = value;
                DResult::Ok
            }
            Err(e) => e.into(),
        }
    }

    /// Packed FAT timestamp of the current wall-clock time
    pub fn get_fattime(&mut self) -> u32 {
        self.clock.now().to_fattime()
    }
}

pub fn ff_mutex_create(_vol: i32) -> bool {
    true
}

pub fn ff_mutex_delete(_vol: i32) {}

pub fn ff_mutex_take(_vol: i32) -> bool {
    true
}

pub fn ff_mutex_give(_vol: i32) {}
