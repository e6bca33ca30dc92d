//! CRC7 for command/response frames and CRC16 for data blocks.
//!
//! All accumulators are `Copy` values; feeding returns the next accumulator so
//! a block can be checksummed in any number of pieces.

/// x^7 + x^3 + 1, stored pre-shifted into the upper seven bits.
const CRC7_POLY: u8 = 0x09 << 1;
/// x^16 + x^12 + x^5 + 1 (CCITT), initial value 0.
const CRC16_POLY: u16 = 0x1021;

const fn crc7_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC7_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC7 lookup, entries shifted left by one.
pub static CRC7_TABLE: [u8; 256] = crc7_table();
/// CRC16-CCITT lookup, one byte at a time.
pub static CRC16_TABLE: [u16; 256] = crc16_table();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc7(u8);

impl Crc7 {
    pub const fn new() -> Self {
        Crc7(0)
    }

    #[must_use]
    pub fn feed(self, byte: u8) -> Self {
        Crc7(CRC7_TABLE[(self.0 ^ byte) as usize])
    }

    #[must_use]
    pub fn feed_slice(self, data: &[u8]) -> Self {
        data.iter().fold(self, |crc, &b| crc.feed(b))
    }

    /// The 7-bit checksum.
    pub fn value(&self) -> u8 {
        self.0 >> 1
    }

    /// Checksum followed by the end bit, as it appears on the CMD line.
    pub fn framed(&self) -> u8 {
        self.0 | 1
    }
}

/// CRC16 of a single data line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc16(u16);

impl Crc16 {
    pub const fn new() -> Self {
        Crc16(0)
    }

    #[inline]
    #[must_use]
    pub fn feed_bit(self, bit: bool) -> Self {
        let top = (self.0 & 0x8000 != 0) ^ bit;
        let crc = self.0 << 1;
        Crc16(if top { crc ^ CRC16_POLY } else { crc })
    }

    #[must_use]
    pub fn feed_byte(self, byte: u8) -> Self {
        let idx = ((self.0 >> 8) as u8 ^ byte) as usize;
        Crc16((self.0 << 8) ^ CRC16_TABLE[idx])
    }

    #[must_use]
    pub fn feed_slice(self, data: &[u8]) -> Self {
        data.iter().fold(self, |crc, &b| crc.feed_byte(b))
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    /// Checksum in transmission order, most significant bit first.
    pub fn crc_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

/// Four independent CRC16s, one per DAT line of a 4-bit bus.
///
/// Nibble bit `i` travels on DAT`i`, so each lane sees every fourth bit of the
/// block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc16Wide([Crc16; 4]);

impl Crc16Wide {
    pub const fn new() -> Self {
        Crc16Wide([Crc16::new(); 4])
    }

    #[must_use]
    pub fn feed_nibble(self, nibble: u8) -> Self {
        let mut lanes = self.0;
        for (line, lane) in lanes.iter_mut().enumerate() {
            *lane = lane.feed_bit((nibble >> line) & 1 != 0);
        }
        Crc16Wide(lanes)
    }

    #[must_use]
    pub fn feed_byte(self, byte: u8) -> Self {
        self.feed_nibble(byte >> 4).feed_nibble(byte & 0xf)
    }

    #[must_use]
    pub fn feed_slice(self, data: &[u8]) -> Self {
        data.iter().fold(self, |crc, &b| crc.feed_byte(b))
    }

    pub fn lanes(&self) -> [u16; 4] {
        [self.0[0].0, self.0[1].0, self.0[2].0, self.0[3].0]
    }

    /// The 16 CRC nibbles in transmission order, packed high nibble first.
    pub fn crc_bytes(&self) -> [u8; 8] {
        let lanes = self.lanes();
        let nibble = |k: usize| -> u8 {
            lanes
                .iter()
                .enumerate()
                .fold(0u8, |acc, (line, crc)| {
                    acc | ((((*crc >> (15 - k)) & 1) as u8) << line)
                })
        };

        let mut out = [0u8; 8];
        for (j, byte) in out.iter_mut().enumerate() {
            *byte = (nibble(2 * j) << 4) | nibble(2 * j + 1);
        }
        out
    }
}

/// Data-block CRC for the current bus width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCrc {
    Narrow(Crc16),
    Wide(Crc16Wide),
}

impl BlockCrc {
    pub fn new(wide: bool) -> Self {
        if wide {
            BlockCrc::Wide(Crc16Wide::new())
        } else {
            BlockCrc::Narrow(Crc16::new())
        }
    }

    #[must_use]
    pub fn feed_byte(self, byte: u8) -> Self {
        match self {
            BlockCrc::Narrow(crc) => BlockCrc::Narrow(crc.feed_byte(byte)),
            BlockCrc::Wide(crc) => BlockCrc::Wide(crc.feed_byte(byte)),
        }
    }

    #[must_use]
    pub fn feed_slice(self, data: &[u8]) -> Self {
        match self {
            BlockCrc::Narrow(crc) => BlockCrc::Narrow(crc.feed_slice(data)),
            BlockCrc::Wide(crc) => BlockCrc::Wide(crc.feed_slice(data)),
        }
    }

    pub fn crc_bytes(&self) -> CrcBytes {
        match self {
            BlockCrc::Narrow(crc) => {
                let mut bytes = [0u8; 8];
                bytes[..2].copy_from_slice(&crc.crc_bytes());
                CrcBytes { wide: false, bytes }
            }
            BlockCrc::Wide(crc) => CrcBytes {
                wide: true,
                bytes: crc.crc_bytes(),
            },
        }
    }
}

/// A finished block checksum as streamed after the data: 2 bytes on a 1-bit
/// bus, 8 bytes (16 nibbles) on a 4-bit bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcBytes {
    wide: bool,
    bytes: [u8; 8],
}

impl CrcBytes {
    pub fn is_wide(&self) -> bool {
        self.wide
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.wide {
            &self.bytes
        } else {
            &self.bytes[..2]
        }
    }
}

/// Precomputed checksum for the first block of the next write.
pub type CrcHint = CrcBytes;

/// Checksum a whole block for the given bus width.
pub fn block_crc(data: &[u8], wide: bool) -> CrcBytes {
    BlockCrc::new(wide).feed_slice(data).crc_bytes()
}
