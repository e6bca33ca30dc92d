//! Card registers read during identification: CSD, CID and SCR.
//!
//! CSD and CID arrive as 16 bytes, most significant first, so register bit
//! `n` lives in byte `15 - n / 8`. The last byte holds the register's own
//! CRC7 and end bit.

use bitflags::bitflags;

use crate::crc::Crc7;
use crate::err::{SdError, SdResult};

/// Extract register bits `msb..=lsb` from a big-endian register image.
pub fn bits(raw: &[u8], msb: usize, lsb: usize) -> u32 {
    let top = raw.len() * 8 - 1;
    (lsb..=msb).rev().fold(0u32, |acc, n| {
        let byte = raw[(top - n) / 8];
        (acc << 1) | ((byte >> (n % 8)) & 1) as u32
    })
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CsdFlags: u16 {
        const READ_BLOCK_PARTIAL = 1 << 0;              /* Partial blocks for read allowed [79:79] */
        const WRITE_BLOCK_MISALIGN = 1 << 1;            /* Write block misalignment [78:78] */
        const READ_BLOCK_MISALIGN = 1 << 2;             /* Read block misalignment [77:77] */
        const DSR_IMPLEMENTED = 1 << 3;                 /* DSR implemented [76:76] */
        const ERASE_BLOCK_ENABLED = 1 << 4;             /* Erase single block enabled [46:46] */
        const WRITE_PROTECT_GROUP_ENABLED = 1 << 5;     /* Write protect group enabled [31:31] */
        const WRITE_BLOCK_PARTIAL = 1 << 6;             /* Partial blocks for write allowed [21:21] */
        const FILE_FORMAT_GROUP = 1 << 7;               /* File format group [15:15] */
        const COPY = 1 << 8;                            /* Copy flag [14:14] */
        const PERMANENT_WRITE_PROTECT = 1 << 9;         /* Permanent write protection [13:13] */
        const TEMPORARY_WRITE_PROTECT = 1 << 10;        /* Temporary write protection [12:12] */
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdCardCmdClass: u16 {
        const BASIC = 1 << 0;
        const BLOCK_READ = 1 << 2;
        const BLOCK_WRITE = 1 << 4;
        const ERASE = 1 << 5;
        const WRITE_PROTECT = 1 << 6;
        const LOCK_CARD = 1 << 7;
        const APPLICATION_SPECIFIC = 1 << 8;
        const SWITCH = 1 << 10;
    }
}

/// TMP_WRITE_PROTECT lives in byte 14, bit 4.
const CSD_TMP_WP_BYTE: usize = 14;
const CSD_TMP_WP_MASK: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsdVersion {
    /// Standard capacity, byte addressed.
    V1,
    /// High capacity, block addressed.
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csd {
    raw: [u8; 16],
    pub version: CsdVersion,
    pub transfer_speed: u8,
    pub card_command_classes: SdCardCmdClass,
    /// log2 of the native read block length.
    pub read_block_length: u8,
    pub write_block_length: u8,
    pub flags: CsdFlags,
    pub device_size: u32,
    /// Only meaningful on version 1 cards.
    pub device_size_multiplier: u8,
}

impl Csd {
    pub fn parse(raw: [u8; 16]) -> SdResult<Self> {
        let version = match bits(&raw, 127, 126) {
            0 => CsdVersion::V1,
            1 => CsdVersion::V2,
            _ => return Err(SdError::ProtocolError),
        };

        let flag_bits = [
            (79, CsdFlags::READ_BLOCK_PARTIAL),
            (78, CsdFlags::WRITE_BLOCK_MISALIGN),
            (77, CsdFlags::READ_BLOCK_MISALIGN),
            (76, CsdFlags::DSR_IMPLEMENTED),
            (46, CsdFlags::ERASE_BLOCK_ENABLED),
            (31, CsdFlags::WRITE_PROTECT_GROUP_ENABLED),
            (21, CsdFlags::WRITE_BLOCK_PARTIAL),
            (15, CsdFlags::FILE_FORMAT_GROUP),
            (14, CsdFlags::COPY),
            (13, CsdFlags::PERMANENT_WRITE_PROTECT),
            (12, CsdFlags::TEMPORARY_WRITE_PROTECT),
        ];
        let flags = flag_bits
            .iter()
            .filter(|(bit, _)| bits(&raw, *bit, *bit) != 0)
            .fold(CsdFlags::empty(), |acc, (_, flag)| acc | *flag);

        let (device_size, device_size_multiplier) = match version {
            CsdVersion::V1 => (bits(&raw, 73, 62), bits(&raw, 49, 47) as u8),
            CsdVersion::V2 => (bits(&raw, 69, 48), 0),
        };

        Ok(Csd {
            raw,
            version,
            transfer_speed: bits(&raw, 103, 96) as u8,
            card_command_classes: SdCardCmdClass::from_bits_retain(bits(&raw, 95, 84) as u16),
            read_block_length: bits(&raw, 83, 80) as u8,
            write_block_length: bits(&raw, 25, 22) as u8,
            flags,
            device_size,
            device_size_multiplier,
        })
    }

    pub fn raw(&self) -> &[u8; 16] {
        &self.raw
    }

    pub fn read_bl_len(&self) -> u32 {
        1 << self.read_block_length
    }

    /// Card size in 512-byte sectors.
    pub fn capacity_sectors(&self) -> u32 {
        let sectors = match self.version {
            CsdVersion::V1 => {
                let blocks = (self.device_size as u64 + 1) << (self.device_size_multiplier + 2);
                (blocks << self.read_block_length) / 512
            }
            CsdVersion::V2 => (self.device_size as u64 + 1) * 1024,
        };
        sectors.min(u32::MAX as u64) as u32
    }

    pub fn perm_write_protect(&self) -> bool {
        self.flags.contains(CsdFlags::PERMANENT_WRITE_PROTECT)
    }

    pub fn tmp_write_protect(&self) -> bool {
        self.flags.contains(CsdFlags::TEMPORARY_WRITE_PROTECT)
    }

    /// Register image for CMD27 with TMP_WRITE_PROTECT set or cleared and the
    /// trailing CRC7 recomputed.
    pub fn with_tmp_write_protect(&self, enable: bool) -> [u8; 16] {
        let mut raw = self.raw;
        if enable {
            raw[CSD_TMP_WP_BYTE] |= CSD_TMP_WP_MASK;
        } else {
            raw[CSD_TMP_WP_BYTE] &= !CSD_TMP_WP_MASK;
        }
        raw[15] = Crc7::new().feed_slice(&raw[..15]).framed();
        raw
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cid {
    pub manufacturer_id: u8,
    pub application_id: u16,
    pub product_name: [u8; 5],
    pub product_version: u8,
    pub serial_number: u32,
    /// Year offset from 2000 in bits 11:4, month in bits 3:0.
    pub manufacturing_date: u16,
}

impl Cid {
    pub fn parse(raw: &[u8; 16]) -> Self {
        let mut product_name = [0u8; 5];
        product_name.copy_from_slice(&raw[3..8]);
        Cid {
            manufacturer_id: raw[0],
            application_id: u16::from_be_bytes([raw[1], raw[2]]),
            product_name,
            product_version: raw[8],
            serial_number: u32::from_be_bytes([raw[9], raw[10], raw[11], raw[12]]),
            manufacturing_date: bits(raw, 19, 8) as u16,
        }
    }

    pub fn product_name(&self) -> &str {
        core::str::from_utf8(&self.product_name).unwrap_or("?")
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScrFlags: u16 {
        const DATA_STATUS_AFTER_ERASE = 1 << 0; /* Data status after erases [55:55] */
        const SD_SPECIFICATION3 = 1 << 1; /* SD specification 3.00 or higher [47:47] */
    }
}

/// SD Configuration Register, 8 bytes from ACMD51.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scr {
    // SCR Structure [63:60]
    pub scr_structure: u8,
    // SD memory card specification version [59:56]
    pub sd_specification: u8,
    pub flags: ScrFlags,
    // Security specification supported [54:52]
    pub sd_security: u8,
    // Data bus widths supported [51:48]
    pub sd_bus_widths: u8,
    // Command support bits [33:32] 33-support CMD23, 32-support cmd20
    pub command_support: u8,
}

impl Scr {
    pub const LEN: usize = 8;

    pub fn parse(raw: &[u8; Self::LEN]) -> Self {
        let mut flags = ScrFlags::empty();
        if bits(raw, 55, 55) != 0 {
            flags |= ScrFlags::DATA_STATUS_AFTER_ERASE;
        }
        if bits(raw, 47, 47) != 0 {
            flags |= ScrFlags::SD_SPECIFICATION3;
        }
        Scr {
            scr_structure: bits(raw, 63, 60) as u8,
            sd_specification: bits(raw, 59, 56) as u8,
            flags,
            sd_security: bits(raw, 54, 52) as u8,
            sd_bus_widths: bits(raw, 51, 48) as u8,
            command_support: bits(raw, 33, 32) as u8,
        }
    }

    pub fn supports_wide_bus(&self) -> bool {
        self.sd_bus_widths & 0b0100 != 0
    }
}
