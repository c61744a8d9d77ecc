//! Card-specific data (CSD) register decoding.

use super::CardType;

/// Fields of the 16-byte CSD the disk layer needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Csd {
    /// Capacity in 512-byte sectors
    pub sector_count: u32,
    /// Erase unit in 512-byte sectors
    pub erase_block: u32,
}

impl Csd {
    /// Decode a raw CSD
    ///
    /// Version 2.0 layouts (high-capacity cards) carry a 22-bit C_SIZE in
    /// 512 KiB units; version 1.0 and MMC layouts scale C_SIZE by
    /// C_SIZE_MULT and READ_BL_LEN.
    pub fn parse(raw: &[u8; 16], card: CardType) -> Self {
        let sector_count = if raw[0] >> 6 == 1 {
            let c_size = ((raw[7] as u32 & 0x3F) << 16) | ((raw[8] as u32) << 8) | raw[9] as u32;
            (c_size + 1) << 10
        } else {
            let read_bl_len = (raw[5] & 0x0F) as u32;
            let c_size = ((raw[6] as u32 & 0x03) << 10)
                | ((raw[7] as u32) << 2)
                | ((raw[8] as u32) >> 6);
            let c_size_mult = (((raw[9] & 0x03) << 1) | (raw[10] >> 7)) as u32;
            let shift = (read_bl_len + c_size_mult + 2).saturating_sub(9);
            (c_size + 1) << shift
        };

        let erase_block = match card {
            CardType::Mmc => {
                let size = ((raw[10] & 0x7C) >> 2) as u32;
                let mult = (((raw[10] & 0x03) << 3) | ((raw[11] & 0xE0) >> 5)) as u32;
                (size + 1) * (mult + 1)
            }
            _ => {
                let sector_size = ((((raw[10] & 0x3F) << 1) | (raw[11] >> 7)) as u32) + 1;
                let write_bl_len = (((raw[12] & 0x03) << 2) | (raw[13] >> 6)) as u32;
                sector_size << write_bl_len.saturating_sub(9)
            }
        };

        Self {
            sector_count,
            erase_block,
        }
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.sector_count as u64 * 512
    }
}
