use log::{debug, info};

use crate::{
    card::{CardPhase, CardSession, SECTOR_SIZE},
    common::{
        RegisterTransport, SdPlatform,
        commands::{CardStatus, DataBuffer, SdCommand},
    },
    config::Password,
    err::{SdError, SdResult},
};

/// CMD42 data block, first byte.
const LOCK_SET_PWD: u8 = 1 << 0;
const LOCK_CLR_PWD: u8 = 1 << 1;
const LOCK_LOCK_UNLOCK: u8 = 1 << 2;
const LOCK_ERASE: u8 = 1 << 3;

/// Largest CMD42 block: mode, length and two passwords when replacing one.
const LOCK_BLOCK_MAX: usize = 2 + 2 * Password::MAX_LEN;

#[derive(Debug, Clone, Copy)]
pub enum LockOp<'a> {
    Unlock(&'a Password),
    /// Lock the card now with its current password.
    Lock(&'a Password),
    /// Replace the password, `old` is required when one is already set.
    SetPassword {
        old: Option<&'a Password>,
        new: &'a Password,
    },
    ClearPassword(&'a Password),
    /// Erase the whole card, removing the password with it.
    ForceErase,
}

impl LockOp<'_> {
    /// Encode the CMD42 data block, returning its length.
    fn encode(&self, block: &mut [u8; LOCK_BLOCK_MAX]) -> usize {
        let (mode, first, second) = match *self {
            LockOp::Unlock(pwd) => (0, Some(pwd), None),
            LockOp::Lock(pwd) => (LOCK_LOCK_UNLOCK, Some(pwd), None),
            LockOp::SetPassword { old, new } => (LOCK_SET_PWD, old, Some(new)),
            LockOp::ClearPassword(pwd) => (LOCK_CLR_PWD, Some(pwd), None),
            LockOp::ForceErase => {
                block[0] = LOCK_ERASE;
                return 1;
            }
        };

        block[0] = mode;
        let mut len = 2;
        for pwd in [first, second].into_iter().flatten() {
            let bytes = pwd.as_bytes();
            block[len..len + bytes.len()].copy_from_slice(bytes);
            len += bytes.len();
        }
        block[1] = (len - 2) as u8;
        len
    }
}

impl<T: RegisterTransport, P: SdPlatform> CardSession<T, P> {
    /// Password management through CMD42.
    ///
    /// A successful unlock of a locked session finishes bus setup and makes
    /// the card usable. The password in effect after the operation is kept for
    /// auto-unlock on later resets.
    pub fn lock_control(&mut self, op: LockOp<'_>) -> SdResult {
        if self.phase != CardPhase::Ready {
            return Err(SdError::NoCard);
        }
        self.close_parked()?;

        let was_locked = self.locked;
        self.lock_command(op)?;
        let status = self.card_status()?;
        self.locked = status.contains(CardStatus::CARD_IS_LOCKED);

        match op {
            LockOp::Unlock(pwd) | LockOp::Lock(pwd) => self.password = Some(*pwd),
            LockOp::SetPassword { new, .. } => self.password = Some(*new),
            LockOp::ClearPassword(_) | LockOp::ForceErase => self.password = None,
        }

        if was_locked && !self.locked {
            let card = self.configure()?;
            self.commit(card);
            info!(
                "lun {}: card unlocked, {} sectors",
                self.lun, self.capacity_sectors
            );
        }
        Ok(())
    }

    /// CMD16 to the block length, CMD42 with the block, CMD16 back to 512.
    pub(super) fn lock_command(&mut self, op: LockOp<'_>) -> SdResult {
        let mut block = [0u8; LOCK_BLOCK_MAX];
        let len = op.encode(&mut block);
        let block = &block[..len];
        debug!("CMD42 mode {:#04x}, {} byte block", block[0], len);

        let busy_polls = match op {
            LockOp::ForceErase => self.ssp.timeouts().erase_polls,
            _ => self.ssp.timeouts().busy_polls,
        };

        self.command_r1(&SdCommand::SetBlockLen(len as u32))?;
        let result = self
            .command_r1(&SdCommand::LockUnlock)
            .and_then(|_| self.ssp.stream_data(DataBuffer::Write(block), None))
            .and_then(|_| self.ssp.wait_not_busy_within(busy_polls));
        let restore = self
            .command_r1(&SdCommand::SetBlockLen(SECTOR_SIZE as u32))
            .map(|_| ());
        result.and(restore)
    }
}
