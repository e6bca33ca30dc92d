//! Session configuration.

use crate::err::{SdError, SdResult};

/// Poll bounds. Every wait is `polls` iterations of a readiness check followed
/// by `SdPlatform::irq_wait(poll_delay_us)`, so the wall-clock limit depends
/// on the delay callback. The defaults suit a core clocked in the tens of MHz;
/// tune them per board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdTimeouts {
    pub poll_delay_us: u32,    /* Delay between two polls of the state register */
    pub command_polls: u32,    /* Waiting for CMD ready or a response start bit */
    pub data_polls: u32,       /* Waiting for a read block start bit or a CRC token */
    pub busy_polls: u32,       /* Waiting for the card to release DAT0 after programming */
    pub erase_polls: u32,      /* Busy limit after a CMD42 force erase of the whole card */
    pub op_cond_attempts: u32, /* ACMD41 rounds before giving up on power-up */
    pub op_cond_delay_us: u32, /* Delay between two ACMD41 rounds */
}

impl Default for SdTimeouts {
    fn default() -> Self {
        SdTimeouts {
            poll_delay_us: 1,
            command_polls: 1000,
            data_polls: 100_000,
            busy_polls: 500_000,
            erase_polls: 300_000_000,
            op_cond_attempts: 1000,
            op_cond_delay_us: 1000,
        }
    }
}

/// Card password, 1 to 16 bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Password {
    len: u8,
    bytes: [u8; Password::MAX_LEN],
}

impl Password {
    pub const MAX_LEN: usize = 16;

    pub fn new(password: &[u8]) -> SdResult<Self> {
        if password.is_empty() || password.len() > Self::MAX_LEN {
            return Err(SdError::InvalidArgument);
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..password.len()].copy_from_slice(password);
        Ok(Password {
            len: password.len() as u8,
            bytes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl core::fmt::Debug for Password {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Password({} bytes)", self.len)
    }
}

/// State a boot loader left the card in. With it, reset skips identification
/// and only re-reads the CSD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootToken {
    pub rca: u16,
    pub wide_bus: bool,
    pub high_capacity: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdConfig {
    pub timeouts: SdTimeouts,
    pub erase_hint: u32,                 /* Sectors to pre-erase before a multi-block write, 0 = off */
    pub write_parking: bool,             /* Leave multi-block writes open between calls, on by default */
    pub lun: u8,                         /* Slot select on a shared core */
    pub prefer_wide_bus: bool,           /* Switch to 4-bit when the card supports it */
    pub password: Option<Password>,      /* Auto-unlock during reset */
    pub boot_token: Option<BootToken>,   /* Card already identified by a boot loader */
}

impl Default for SdConfig {
    fn default() -> Self {
        SdConfig {
            timeouts: SdTimeouts::default(),
            erase_hint: 8,
            write_parking: true,
            lun: 0,
            prefer_wide_bus: true,
            password: None,
            boot_token: None,
        }
    }
}

impl SdConfig {
    pub fn with_timeouts(mut self, timeouts: SdTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_erase_hint(mut self, sectors: u32) -> Self {
        self.erase_hint = sectors;
        self
    }

    pub fn with_write_parking(mut self, enable: bool) -> Self {
        self.write_parking = enable;
        self
    }

    pub fn with_lun(mut self, lun: u8) -> Self {
        self.lun = lun;
        self
    }

    pub fn with_wide_bus(mut self, prefer: bool) -> Self {
        self.prefer_wide_bus = prefer;
        self
    }

    pub fn with_password(mut self, password: Password) -> Self {
        self.password = Some(password);
        self
    }

    pub fn with_boot_token(mut self, token: BootToken) -> Self {
        self.boot_token = Some(token);
        self
    }
}
