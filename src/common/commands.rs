use bitflags::bitflags;

use crate::crc::Crc7;
use crate::err::{SdError, SdResult};

/// Data phase buffer, its variant gives the direction.
pub enum DataBuffer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl DataBuffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::Read(buf) => buf.len(),
            DataBuffer::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_read(&self) -> bool {
        matches!(self, DataBuffer::Read(_))
    }
}

/// OCR: card power-up finished.
pub const OCR_BUSY: u32 = 1 << 31;
/// OCR: card capacity status, set for block-addressed cards.
pub const OCR_CCS: u32 = 1 << 30;
/// OCR: 2.7V - 3.6V.
pub const OCR_VOLTAGE_WINDOW: u32 = 0x00ff_8000;

/// CMD8 supply voltage field, 2.7V - 3.6V.
const IF_COND_VHS_27_36: u32 = 0x1 << 8;

/// SD bus commands. Application commands (`ACMDx`) are sent after
/// [`SdCommand::AppCmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdCommand {
    /// CMD0
    GoIdleState,
    /// CMD2
    AllSendCid,
    /// CMD3
    SendRelativeAddr,
    /// CMD7, RCA 0 deselects all cards.
    SelectCard(u16),
    /// CMD8
    SendIfCond { check_pattern: u8 },
    /// CMD9
    SendCsd(u16),
    /// CMD12
    StopTransmission,
    /// CMD13
    SendStatus(u16),
    /// CMD16
    SetBlockLen(u32),
    /// CMD17
    ReadSingleBlock(u32),
    /// CMD18
    ReadMultipleBlock(u32),
    /// CMD24
    WriteBlock(u32),
    /// CMD25
    WriteMultipleBlock(u32),
    /// CMD27
    ProgramCsd,
    /// CMD42
    LockUnlock,
    /// CMD55
    AppCmd(u16),
    /// ACMD6, `true` selects the 4-bit bus.
    SetBusWidth(bool),
    /// ACMD23, number of blocks to pre-erase before a multi-block write.
    SetWrBlkEraseCount(u32),
    /// ACMD41
    SdSendOpCond { hcs: bool, voltage_window: u32 },
    /// ACMD42, `false` disconnects the DAT3 pull-up.
    SetClrCardDetect(bool),
    /// ACMD51
    SendScr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    None,
    R1,
    /// R1 followed by busy signalling on DAT0.
    R1b,
    R2,
    R3,
    R6,
    R7,
}

impl ResponseKind {
    /// Response length in bytes, start bit to end bit.
    pub fn len(&self) -> usize {
        match self {
            ResponseKind::None => 0,
            ResponseKind::R2 => 17,
            _ => 6,
        }
    }
}

impl SdCommand {
    pub fn index(&self) -> u8 {
        match self {
            SdCommand::GoIdleState => 0,
            SdCommand::AllSendCid => 2,
            SdCommand::SendRelativeAddr => 3,
            SdCommand::SetBusWidth(_) => 6,
            SdCommand::SelectCard(_) => 7,
            SdCommand::SendIfCond { .. } => 8,
            SdCommand::SendCsd(_) => 9,
            SdCommand::StopTransmission => 12,
            SdCommand::SendStatus(_) => 13,
            SdCommand::SetBlockLen(_) => 16,
            SdCommand::ReadSingleBlock(_) => 17,
            SdCommand::ReadMultipleBlock(_) => 18,
            SdCommand::SetWrBlkEraseCount(_) => 23,
            SdCommand::WriteBlock(_) => 24,
            SdCommand::WriteMultipleBlock(_) => 25,
            SdCommand::ProgramCsd => 27,
            SdCommand::SdSendOpCond { .. } => 41,
            SdCommand::LockUnlock => 42,
            SdCommand::SetClrCardDetect(_) => 42,
            SdCommand::SendScr => 51,
            SdCommand::AppCmd(_) => 55,
        }
    }

    pub fn argument(&self) -> u32 {
        match *self {
            SdCommand::SelectCard(rca)
            | SdCommand::SendCsd(rca)
            | SdCommand::SendStatus(rca)
            | SdCommand::AppCmd(rca) => (rca as u32) << 16,
            SdCommand::SendIfCond { check_pattern } => IF_COND_VHS_27_36 | check_pattern as u32,
            SdCommand::SetBlockLen(arg)
            | SdCommand::ReadSingleBlock(arg)
            | SdCommand::ReadMultipleBlock(arg)
            | SdCommand::WriteBlock(arg)
            | SdCommand::WriteMultipleBlock(arg) => arg,
            SdCommand::SetWrBlkEraseCount(count) => count & 0x007f_ffff,
            SdCommand::SetBusWidth(wide) => {
                if wide {
                    0b10
                } else {
                    0
                }
            }
            SdCommand::SdSendOpCond {
                hcs,
                voltage_window,
            } => {
                let hcs = if hcs { OCR_CCS } else { 0 };
                hcs | (voltage_window & 0x00ff_ff00)
            }
            SdCommand::SetClrCardDetect(connect) => connect as u32,
            SdCommand::GoIdleState
            | SdCommand::AllSendCid
            | SdCommand::SendRelativeAddr
            | SdCommand::StopTransmission
            | SdCommand::ProgramCsd
            | SdCommand::LockUnlock
            | SdCommand::SendScr => 0,
        }
    }

    pub fn response_kind(&self) -> ResponseKind {
        match self {
            SdCommand::GoIdleState => ResponseKind::None,
            SdCommand::SelectCard(0) => ResponseKind::None,
            SdCommand::SelectCard(_)
            | SdCommand::StopTransmission
            | SdCommand::LockUnlock => ResponseKind::R1b,
            SdCommand::AllSendCid | SdCommand::SendCsd(_) => ResponseKind::R2,
            SdCommand::SdSendOpCond { .. } => ResponseKind::R3,
            SdCommand::SendRelativeAddr => ResponseKind::R6,
            SdCommand::SendIfCond { .. } => ResponseKind::R7,
            _ => ResponseKind::R1,
        }
    }

    /// Needs a preceding CMD55.
    pub fn is_app(&self) -> bool {
        matches!(
            self,
            SdCommand::SetBusWidth(_)
                | SdCommand::SetWrBlkEraseCount(_)
                | SdCommand::SdSendOpCond { .. }
                | SdCommand::SetClrCardDetect(_)
                | SdCommand::SendScr
        )
    }

    /// The 48-bit frame as written to the command register.
    pub fn frame(&self) -> [u8; 6] {
        let arg = self.argument().to_be_bytes();
        let mut frame = [0x40 | self.index(), arg[0], arg[1], arg[2], arg[3], 0];
        frame[5] = Crc7::new().feed_slice(&frame[..5]).framed();
        frame
    }
}

bitflags! {
    /// R1 card status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CardStatus: u32 {
        const OUT_OF_RANGE = 1 << 31;
        const ADDRESS_ERROR = 1 << 30;
        const BLOCK_LEN_ERROR = 1 << 29;
        const ERASE_SEQ_ERROR = 1 << 28;
        const ERASE_PARAM = 1 << 27;
        const WP_VIOLATION = 1 << 26;
        const CARD_IS_LOCKED = 1 << 25;
        const LOCK_UNLOCK_FAILED = 1 << 24;
        const COM_CRC_ERROR = 1 << 23;
        const ILLEGAL_COMMAND = 1 << 22;
        const CARD_ECC_FAILED = 1 << 21;
        const CC_ERROR = 1 << 20;
        const ERROR = 1 << 19;
        const CSD_OVERWRITE = 1 << 16;
        const WP_ERASE_SKIP = 1 << 15;
        const CARD_ECC_DISABLED = 1 << 14;
        const ERASE_RESET = 1 << 13;
        const CURRENT_STATE = 0xf << 9;
        const READY_FOR_DATA = 1 << 8;
        const APP_CMD = 1 << 5;
        const AKE_SEQ_ERROR = 1 << 3;
    }
}

impl CardStatus {
    const ERROR_MASK: CardStatus = CardStatus::OUT_OF_RANGE
        .union(CardStatus::ADDRESS_ERROR)
        .union(CardStatus::BLOCK_LEN_ERROR)
        .union(CardStatus::ERASE_SEQ_ERROR)
        .union(CardStatus::ERASE_PARAM)
        .union(CardStatus::WP_VIOLATION)
        .union(CardStatus::LOCK_UNLOCK_FAILED)
        .union(CardStatus::COM_CRC_ERROR)
        .union(CardStatus::ILLEGAL_COMMAND)
        .union(CardStatus::CARD_ECC_FAILED)
        .union(CardStatus::CC_ERROR)
        .union(CardStatus::ERROR)
        .union(CardStatus::CSD_OVERWRITE)
        .union(CardStatus::AKE_SEQ_ERROR);

    /// Expand the 16-bit status carried in an R6 response.
    pub fn from_r6(bits: u16) -> Self {
        let bits = bits as u32;
        let mut status = CardStatus::from_bits_retain(bits & 0x1fff);
        if bits & (1 << 15) != 0 {
            status |= CardStatus::COM_CRC_ERROR;
        }
        if bits & (1 << 14) != 0 {
            status |= CardStatus::ILLEGAL_COMMAND;
        }
        if bits & (1 << 13) != 0 {
            status |= CardStatus::ERROR;
        }
        status
    }

    pub fn current_state(&self) -> CardState {
        CardState::from_bits(((self.bits() & CardStatus::CURRENT_STATE.bits()) >> 9) as u8)
    }

    /// Map reported error bits to an [`SdError`].
    pub fn check(self) -> SdResult<Self> {
        let errors = self & Self::ERROR_MASK;
        if errors.is_empty() {
            return Ok(self);
        }

        let err = if errors.contains(CardStatus::WP_VIOLATION) {
            SdError::WriteProtected
        } else if errors.contains(CardStatus::LOCK_UNLOCK_FAILED)
            || (errors.contains(CardStatus::ILLEGAL_COMMAND)
                && self.contains(CardStatus::CARD_IS_LOCKED))
        {
            SdError::Locked
        } else if errors.intersects(CardStatus::OUT_OF_RANGE | CardStatus::ADDRESS_ERROR) {
            SdError::OutOfRange
        } else if errors.contains(CardStatus::COM_CRC_ERROR) {
            SdError::CrcMismatch
        } else {
            SdError::ProtocolError
        };
        Err(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Idle,  // idle state
    Ready, // ready state
    Ident, // identification state
    Stby,  // stand-by state
    Tran,  // transfer state
    Data,  // sending-data state
    Rcv,   // receive-data state
    Prg,   // programming state
    Dis,   // disconnect state
    Reserved(u8),
}

impl CardState {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Ident,
            3 => CardState::Stby,
            4 => CardState::Tran,
            5 => CardState::Data,
            6 => CardState::Rcv,
            7 => CardState::Prg,
            8 => CardState::Dis,
            other => CardState::Reserved(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdResponse {
    None,
    /// R1 and R1b.
    R1(CardStatus),
    /// CID or CSD register, 16 bytes including its own CRC7.
    R2([u8; 16]),
    /// OCR register.
    R3(u32),
    R6 { rca: u16, status: CardStatus },
    R7 { voltage: u8, check_pattern: u8 },
}

impl SdResponse {
    /// Validate and decode the raw response bytes of `cmd`.
    pub fn parse(cmd: &SdCommand, raw: &[u8]) -> SdResult<Self> {
        let kind = cmd.response_kind();
        if raw.len() != kind.len() {
            return Err(SdError::ProtocolError);
        }
        if kind == ResponseKind::None {
            return Ok(SdResponse::None);
        }
        if raw[raw.len() - 1] & 1 == 0 {
            return Err(SdError::ProtocolError);
        }

        match kind {
            ResponseKind::R2 => {
                if raw[0] != 0x3f {
                    return Err(SdError::ProtocolError);
                }
                let mut reg = [0u8; 16];
                reg.copy_from_slice(&raw[1..17]);
                if Crc7::new().feed_slice(&reg[..15]).framed() != reg[15] {
                    return Err(SdError::CrcMismatch);
                }
                Ok(SdResponse::R2(reg))
            }
            ResponseKind::R3 => {
                // No CRC on R3, the field reads as all ones.
                if raw[0] != 0x3f || raw[5] != 0xff {
                    return Err(SdError::ProtocolError);
                }
                Ok(SdResponse::R3(u32::from_be_bytes([
                    raw[1], raw[2], raw[3], raw[4],
                ])))
            }
            _ => {
                if raw[0] & 0xc0 != 0 || raw[0] & 0x3f != cmd.index() {
                    return Err(SdError::ProtocolError);
                }
                if Crc7::new().feed_slice(&raw[..5]).framed() != raw[5] {
                    return Err(SdError::CrcMismatch);
                }

                let body = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
                Ok(match kind {
                    ResponseKind::R6 => SdResponse::R6 {
                        rca: (body >> 16) as u16,
                        status: CardStatus::from_r6(body as u16),
                    },
                    ResponseKind::R7 => SdResponse::R7 {
                        voltage: ((body >> 8) & 0xf) as u8,
                        check_pattern: body as u8,
                    },
                    _ => SdResponse::R1(CardStatus::from_bits_retain(body)),
                })
            }
        }
    }

    pub fn status(&self) -> Option<CardStatus> {
        match self {
            SdResponse::R1(status) | SdResponse::R6 { status, .. } => Some(*status),
            _ => None,
        }
    }
}
