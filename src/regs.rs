//! Register window of the SSP-style SD core.
//!
//! The core exposes four byte-wide registers:
//!
//! - `Command`: each write shifts one command byte out on CMD, each read
//!   returns the next response byte shifted in.
//! - `Data`: each access moves one DAT sample, bit 0 on a 1-bit bus or bits
//!   3:0 on a 4-bit bus. After a written block and its CRC, one read returns
//!   the card's CRC status token.
//! - `State`: readiness flags, see [`SspStatus`].
//! - `Control`: bus configuration and card detect, see [`SspControl`].

use bitflags::bitflags;

use crate::common::RegisterTransport;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdReg {
    Command = 0,
    Data = 1,
    State = 2,
    Control = 3,
}

impl SdReg {
    pub const fn offset(self) -> u32 {
        self as u32
    }
}

bitflags! {
    /// State register, read only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SspStatus: u8 {
        /// CMD line idle, a new command may be written.
        const CMD_READY = 1 << 0;
        /// A response start bit was seen, response bytes can be read.
        const RESP_READY = 1 << 1;
        /// DAT start bit seen on read, or CRC status token latched on write.
        const DAT_READY = 1 << 2;
        /// Card holds DAT0 low while programming.
        const DAT_BUSY = 1 << 3;
    }
}

bitflags! {
    /// Control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SspControl: u8 {
        /// 4-bit data bus.
        const WIDE_BUS = 1 << 0;
        /// Full-speed clock instead of the 400 kHz identification clock.
        const FAST_CLOCK = 1 << 1;
        /// Set by hardware when no card is inserted.
        const CARD_ABSENT = 0x08;
        /// Set by hardware when the slot's write-protect tab is engaged.
        const WRITE_PROTECT = 1 << 4;
        /// Logical unit select.
        const LUN_MASK = 0b11 << 5;
    }
}

impl SspControl {
    pub const LUN_SHIFT: u8 = 5;

    /// Bits the driver owns; the rest are status bits driven by hardware.
    pub const WRITABLE: SspControl = SspControl::WIDE_BUS
        .union(SspControl::FAST_CLOCK)
        .union(SspControl::LUN_MASK);

    pub fn with_lun(self, lun: u8) -> Self {
        let lun_bits = SspControl::from_bits_retain((lun << Self::LUN_SHIFT) & Self::LUN_MASK.bits());
        (self - SspControl::LUN_MASK) | lun_bits
    }
}

bitflags! {
    /// Software view of the transfer state, readable by client code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdState: u32 {
        const DAT_RX = 1 << 0;
        const DAT_TX = 1 << 1;
        const CMD_RX = 1 << 2;
        const CMD_TX = 1 << 3;
        /// Skip CRC computation on written data, a precomputed one is used.
        const CRC_DISABLE = 1 << 4;
        /// 4-bit bus and CRC mode.
        const WIDE_BUS = 1 << 5;
        /// Block-indexed addressing; sector numbers are sent unscaled.
        const ADDRESSING_DIRECT = 1 << 6;
    }
}

#[macro_export]
macro_rules! impl_register_ops {
    ($struct_name:ident, $field_name:ident) => {
        impl $struct_name {
            #[inline]
            pub fn read_reg8(&self, offset: u32) -> u8 {
                unsafe {
                    core::ptr::read_volatile((self.$field_name + offset as usize) as *const u8)
                }
            }

            #[inline]
            pub fn write_reg8(&self, offset: u32, value: u8) {
                unsafe {
                    core::ptr::write_volatile(
                        (self.$field_name + offset as usize) as *mut u8,
                        value,
                    )
                }
            }
        }
    };
}

/// Memory-mapped register window.
#[derive(Debug)]
pub struct MmioTransport {
    base_addr: usize,
}

impl_register_ops!(MmioTransport, base_addr);

impl MmioTransport {
    /// # Safety
    ///
    /// `base_addr` must be the virtual address of a mapped SD core register
    /// block, valid for volatile byte access at offsets 0..4 for the lifetime
    /// of the returned value, and not used by anything else.
    pub unsafe fn new(base_addr: usize) -> Self {
        MmioTransport { base_addr }
    }

    pub fn base_addr(&self) -> usize {
        self.base_addr
    }
}

impl RegisterTransport for MmioTransport {
    fn read_reg(&mut self, reg: SdReg) -> u8 {
        self.read_reg8(reg.offset())
    }

    fn write_reg(&mut self, reg: SdReg, value: u8) {
        self.write_reg8(reg.offset(), value)
    }
}
