//! One card slot: identification, geometry, lock and write-protect state.

mod block;
mod cmd;
mod lock;
mod recovery;

pub use block::{SdIov, SdIovMut};
pub use lock::LockOp;

use log::{debug, info, warn};

use crate::{
    common::{
        RegisterTransport, SdPlatform,
        commands::{CardStatus, DataBuffer, OCR_CCS, SdCommand, SdResponse},
        csd::{Cid, Csd, Scr},
    },
    config::{BootToken, Password, SdConfig},
    crc::CrcHint,
    err::{SdError, SdResult},
    host::SspHost,
    regs::SdState,
};

/// Transfer unit of every read and write.
pub const SECTOR_SIZE: usize = 512;

/// Largest native block length reported to callers.
const MAX_BLOCK_LEN: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardPhase {
    Uninitialized,
    Identifying,
    /// Identified. Lock and write protection are tracked separately.
    Ready,
    Absent,
}

/// Geometry and registers gathered by one identification pass, committed to
/// the session only when the whole reset succeeds.
struct Identified {
    csd: Csd,
    scr: Option<Scr>,
    write_protected: bool,
}

pub struct CardSession<T: RegisterTransport, P: SdPlatform> {
    ssp: SspHost<T, P>,
    phase: CardPhase,
    erase_hint: u32,
    write_protected: bool,
    boot_token: Option<BootToken>,
    crc_hint: Option<CrcHint>,
    block_size: u32,
    locked: bool,
    password: Option<Password>,
    write_parking: bool,
    prefer_wide_bus: bool,
    lun: u8,
    rca: Option<u16>,
    high_capacity: bool,
    csd: Option<Csd>,
    cid: Option<Cid>,
    scr: Option<Scr>,
    capacity_sectors: u32,
    /// Next sector of a multi-block write left open between calls.
    parked: Option<u32>,
}

impl<T: RegisterTransport, P: SdPlatform> CardSession<T, P> {
    pub fn new(regs: T, platform: P, config: SdConfig) -> Self {
        CardSession {
            ssp: SspHost::new(regs, platform, config.timeouts, config.lun),
            phase: CardPhase::Uninitialized,
            erase_hint: config.erase_hint,
            write_protected: false,
            boot_token: config.boot_token,
            crc_hint: None,
            block_size: SECTOR_SIZE as u32,
            locked: false,
            password: config.password,
            write_parking: config.write_parking,
            prefer_wide_bus: config.prefer_wide_bus,
            lun: config.lun,
            rca: None,
            high_capacity: false,
            csd: None,
            cid: None,
            scr: None,
            capacity_sectors: 0,
            parked: None,
        }
    }

    pub fn phase(&self) -> CardPhase {
        self.phase
    }

    pub fn capacity_sectors(&self) -> u32 {
        self.capacity_sectors
    }

    /// Native block length from the CSD, 512 or 1024. Transfers always use
    /// [`SECTOR_SIZE`].
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_high_capacity(&self) -> bool {
        self.high_capacity
    }

    /// Relative card address, known once identification got that far.
    pub fn rca(&self) -> Option<u16> {
        self.rca
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    pub fn csd(&self) -> Option<&Csd> {
        self.csd.as_ref()
    }

    pub fn cid(&self) -> Option<&Cid> {
        self.cid.as_ref()
    }

    pub fn scr(&self) -> Option<&Scr> {
        self.scr.as_ref()
    }

    pub fn state(&self) -> SdState {
        self.ssp.state()
    }

    pub fn host_mut(&mut self) -> &mut SspHost<T, P> {
        &mut self.ssp
    }

    pub fn set_erase_hint(&mut self, sectors: u32) {
        self.erase_hint = sectors;
    }

    /// Precomputed CRC for the first block of the next write. Used once.
    pub fn set_crc_hint(&mut self, hint: CrcHint) {
        self.crc_hint = Some(hint);
    }

    pub fn set_password(&mut self, password: Option<Password>) {
        self.password = password;
    }

    pub fn set_write_parking(&mut self, enable: bool) -> SdResult {
        if !enable {
            self.close_parked()?;
        }
        self.write_parking = enable;
        Ok(())
    }

    pub fn set_boot_token(&mut self, token: Option<BootToken>) {
        self.boot_token = token;
    }

    /// Hardware revision of the SD core, as reported by the platform.
    pub fn core_version(&self) -> Option<u32> {
        self.ssp.core_version()
    }

    /// Token describing the current card setup, for handing the card to a
    /// later stage without identifying it again.
    pub fn boot_token(&self) -> Option<BootToken> {
        match (self.phase, self.rca) {
            (CardPhase::Ready, Some(rca)) if !self.locked => Some(BootToken {
                rca,
                wide_bus: self.ssp.is_wide(),
                high_capacity: self.high_capacity,
            }),
            _ => None,
        }
    }

    /// Identify the card and configure the bus.
    ///
    /// Returns the capacity in 512-byte sectors. A password-locked card that
    /// cannot be unlocked fails with [`SdError::Locked`] and keeps the previous
    /// capacity; every other failure reports [`SdError::NoCard`] and zeroes it.
    pub fn reset(&mut self) -> SdResult<u32> {
        if let Err(e) = self.close_parked() {
            debug!("reset: closing parked write failed: {e}");
        }
        self.parked = None;
        self.phase = CardPhase::Identifying;
        self.rca = None;
        self.ssp.init();

        if self.ssp.card_absent() {
            warn!("lun {}: no card", self.lun);
            self.phase = CardPhase::Absent;
            self.locked = false;
            self.capacity_sectors = 0;
            return Err(SdError::NoCard);
        }

        let identified = match self.boot_token.take() {
            Some(token) => self.resume(token).or_else(|e| {
                warn!("boot token rejected ({e}), identifying from scratch");
                self.ssp.init();
                self.identify()
            }),
            None => self.identify(),
        }
        .and_then(|()| self.unlock_on_reset())
        .and_then(|()| self.configure());

        match identified {
            Ok(card) => {
                self.commit(card);
                info!(
                    "lun {}: card ready, {} sectors, block {} bytes, {}-bit bus{}",
                    self.lun,
                    self.capacity_sectors,
                    self.block_size,
                    if self.ssp.is_wide() { 4 } else { 1 },
                    if self.write_protected { ", write protected" } else { "" }
                );
                if let Some(version) = self.ssp.core_version() {
                    info!("lun {}: SD core revision {version:#010x}", self.lun);
                }
                Ok(self.capacity_sectors)
            }
            Err(SdError::Locked) => {
                warn!("lun {}: card is password locked", self.lun);
                self.locked = true;
                self.phase = CardPhase::Ready;
                Err(SdError::Locked)
            }
            Err(e) => {
                warn!("lun {}: identification failed: {e}", self.lun);
                self.phase = CardPhase::Uninitialized;
                self.locked = false;
                self.capacity_sectors = 0;
                Err(SdError::NoCard)
            }
        }
    }

    /// Full identification, leaves the card selected in transfer state.
    fn identify(&mut self) -> SdResult {
        self.ssp.send_command(&SdCommand::GoIdleState)?;

        let v2 = match self.ssp.send_command(&SdCommand::SendIfCond {
            check_pattern: cmd::IF_COND_PATTERN,
        }) {
            Ok(SdResponse::R7 {
                voltage,
                check_pattern,
            }) => {
                if voltage != 1 || check_pattern != cmd::IF_COND_PATTERN {
                    warn!("CMD8 echo mismatch: voltage {voltage:#x}, pattern {check_pattern:#x}");
                    return Err(SdError::ProtocolError);
                }
                true
            }
            Ok(_) => return Err(SdError::ProtocolError),
            Err(SdError::Timeout) => {
                debug!("no CMD8 response, version 1 card");
                false
            }
            Err(e) => return Err(e),
        };

        let ocr = self.wait_op_cond(v2)?;
        self.high_capacity = v2 && ocr & OCR_CCS != 0;
        debug!("OCR {ocr:#010x}, high capacity: {}", self.high_capacity);

        let cid = match self.ssp.send_command(&SdCommand::AllSendCid)? {
            SdResponse::R2(raw) => Cid::parse(&raw),
            _ => return Err(SdError::ProtocolError),
        };
        info!(
            "card {} rev {:#04x}, serial {:#010x}",
            cid.product_name(),
            cid.product_version,
            cid.serial_number
        );
        self.cid = Some(cid);

        let rca = match self.ssp.send_command(&SdCommand::SendRelativeAddr)? {
            SdResponse::R6 { rca, status } => {
                status.check()?;
                rca
            }
            _ => return Err(SdError::ProtocolError),
        };
        debug!("RCA {rca:#06x}");
        self.rca = Some(rca);

        self.csd = Some(self.read_csd(rca)?);
        self.command_r1(&SdCommand::SelectCard(rca))?;
        Ok(())
    }

    /// Take over a card a boot loader left selected: deselect, read the CSD
    /// again and reselect.
    fn resume(&mut self, token: BootToken) -> SdResult {
        debug!("resuming boot loader setup, RCA {:#06x}", token.rca);
        self.high_capacity = token.high_capacity;
        self.ssp.set_wide_bus(token.wide_bus);
        self.ssp.set_fast_clock(true);

        self.ssp.send_command(&SdCommand::SelectCard(0))?;
        let csd = self.read_csd(token.rca)?;
        self.command_r1(&SdCommand::SelectCard(token.rca))?;

        self.rca = Some(token.rca);
        self.csd = Some(csd);
        Ok(())
    }

    fn unlock_on_reset(&mut self) -> SdResult {
        let status = self.card_status()?;
        if !status.contains(CardStatus::CARD_IS_LOCKED) {
            self.locked = false;
            return Ok(());
        }

        let Some(password) = self.password else {
            return Err(SdError::Locked);
        };
        debug!("card locked, trying stored password");
        self.lock_command(LockOp::Unlock(&password))
            .map_err(|_| SdError::Locked)?;
        if self.card_status()?.contains(CardStatus::CARD_IS_LOCKED) {
            return Err(SdError::Locked);
        }
        self.locked = false;
        Ok(())
    }

    /// Bus and addressing setup for a selected, unlocked card.
    fn configure(&mut self) -> SdResult<Identified> {
        let csd = self.csd.ok_or(SdError::ProtocolError)?;
        if csd.capacity_sectors() == 0 {
            return Err(SdError::ProtocolError);
        }

        if !self.high_capacity {
            self.command_r1(&SdCommand::SetBlockLen(SECTOR_SIZE as u32))?;
        }
        self.ssp.set_addressing_direct(self.high_capacity);

        let scr = if self.ssp.is_wide() {
            self.scr
        } else {
            let scr = self.read_scr()?;
            if self.prefer_wide_bus && scr.supports_wide_bus() {
                self.app_command_r1(&SdCommand::SetClrCardDetect(false))?;
                self.app_command_r1(&SdCommand::SetBusWidth(true))?;
                self.ssp.set_wide_bus(true);
                debug!("switched to 4-bit bus");
            }
            Some(scr)
        };
        self.ssp.set_fast_clock(true);

        let write_protected =
            csd.perm_write_protect() || csd.tmp_write_protect() || self.ssp.write_protect_switch();

        Ok(Identified {
            csd,
            scr,
            write_protected,
        })
    }

    fn commit(&mut self, card: Identified) {
        self.capacity_sectors = card.csd.capacity_sectors();
        self.block_size = card.csd.read_bl_len().min(MAX_BLOCK_LEN);
        self.write_protected = card.write_protected;
        self.csd = Some(card.csd);
        self.scr = card.scr;
        self.locked = false;
        self.phase = CardPhase::Ready;
    }

    /// Set or clear temporary write protection by rewriting the CSD.
    pub fn set_write_protection(&mut self, enable: bool) -> SdResult {
        self.ensure_ready()?;
        let csd = self.csd.ok_or(SdError::NoCard)?;
        if !enable && csd.perm_write_protect() {
            return Err(SdError::WriteProtected);
        }
        self.close_parked()?;

        let raw = csd.with_tmp_write_protect(enable);
        self.command_r1(&SdCommand::ProgramCsd)?;
        self.ssp.stream_data(DataBuffer::Write(&raw), None)?;
        self.ssp.wait_not_busy()?;
        self.card_status()?;

        let csd = Csd::parse(raw)?;
        self.write_protected =
            csd.perm_write_protect() || csd.tmp_write_protect() || self.ssp.write_protect_switch();
        self.csd = Some(csd);
        info!(
            "temporary write protection {}",
            if enable { "set" } else { "cleared" }
        );
        Ok(())
    }

    /// Identified and unlocked.
    fn ensure_ready(&self) -> SdResult {
        if self.phase != CardPhase::Ready {
            return Err(SdError::NoCard);
        }
        if self.locked {
            return Err(SdError::Locked);
        }
        Ok(())
    }
}
