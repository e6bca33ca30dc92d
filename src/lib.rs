//! SD card protocol engine for the SSP-style SD core found on TS-72xx boards.
//!
//! The core only exposes four byte-wide registers, so command framing, CRC7
//! and CRC16, card identification and block transfers are all done in
//! software. [`CardSession`] is the entry point; [`disk::SdDisk`] wraps one
//! for an OS block layer.

#![cfg_attr(not(test), no_std)]

pub mod card;
pub mod common;
pub mod config;
pub mod crc;
pub mod disk;
pub mod err;
pub mod host;
pub mod regs;

pub use card::{CardPhase, CardSession, LockOp, SECTOR_SIZE, SdIov, SdIovMut};
pub use common::{RegisterTransport, SdPlatform};
pub use config::{BootToken, Password, SdConfig, SdTimeouts};
pub use crc::CrcHint;
pub use err::{SdError, SdResult};
pub use regs::MmioTransport;
