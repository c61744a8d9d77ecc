//! SD command set and wire tokens (SPI mode).

/// Command index. Application commands are sent after [`Command::AppCmd`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// CMD0
    GoIdle = 0,
    /// CMD1, MMC initialisation
    SendOpCond = 1,
    /// CMD8
    SendIfCond = 8,
    /// CMD9
    SendCsd = 9,
    /// CMD12
    StopTransmission = 12,
    /// CMD13
    SendStatus = 13,
    /// CMD16
    SetBlockLen = 16,
    /// CMD17
    ReadSingle = 17,
    /// CMD18
    ReadMultiple = 18,
    /// ACMD23
    SetWriteBlockEraseCount = 23,
    /// CMD24
    WriteSingle = 24,
    /// CMD25
    WriteMultiple = 25,
    /// ACMD41
    AppSendOpCond = 41,
    /// CMD55
    AppCmd = 55,
    /// CMD58
    ReadOcr = 58,
    /// CMD59
    CrcOnOff = 59,
}

impl Command {
    /// Needs a CMD55 prefix
    pub fn is_app(self) -> bool {
        matches!(self, Command::SetWriteBlockEraseCount | Command::AppSendOpCond)
    }

    /// Six-byte command frame with its CRC7
    pub fn frame(self, arg: u32) -> [u8; 6] {
        let a = arg.to_be_bytes();
        let mut f = [0x40 | self as u8, a[0], a[1], a[2], a[3], 0];
        f[5] = (super::crc::crc7(&f[..5]) << 1) | 1;
        f
    }
}

/// R1 status bits
pub mod r1 {
    pub const IDLE: u8 = 1 << 0;
    pub const ERASE_RESET: u8 = 1 << 1;
    pub const ILLEGAL_COMMAND: u8 = 1 << 2;
    pub const CRC_ERROR: u8 = 1 << 3;
    pub const ADDRESS_ERROR: u8 = 1 << 5;
    pub const PARAMETER_ERROR: u8 = 1 << 6;
}

/// Start token for single-block reads and writes and multi-block reads
pub const TOKEN_START: u8 = 0xFE;
/// Start token for each block of a multi-block write
pub const TOKEN_START_MULTI: u8 = 0xFC;
/// Ends a multi-block write
pub const TOKEN_STOP: u8 = 0xFD;

/// Data-response token (`xxx0sss1`) status field
pub mod data_response {
    pub const MASK: u8 = 0x1F;
    pub const ACCEPTED: u8 = 0x05;
    pub const CRC_ERROR: u8 = 0x0B;
    pub const WRITE_ERROR: u8 = 0x0D;
}

/// CMD8 argument: 2.7-3.6 V range and check pattern 0xAA
pub const IF_COND_ARG: u32 = 0x1AA;
/// ACMD41 argument announcing high-capacity support
pub const HCS: u32 = 1 << 30;
/// OCR card-capacity-status bit (block addressing)
pub const OCR_CCS: u32 = 1 << 30;
