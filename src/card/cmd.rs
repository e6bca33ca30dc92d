use log::{debug, trace};

use crate::{
    card::CardSession,
    common::{
        RegisterTransport, SdPlatform,
        commands::{
            CardStatus, DataBuffer, OCR_BUSY, OCR_VOLTAGE_WINDOW, SdCommand, SdResponse,
        },
        csd::{Csd, Scr},
    },
    err::{SdError, SdResult},
};

/// Echoed back by CMD8.
pub(super) const IF_COND_PATTERN: u8 = 0xaa;

impl<T: RegisterTransport, P: SdPlatform> CardSession<T, P> {
    /// Send a command answered with R1 or R1b and check the status bits.
    pub(super) fn command_r1(&mut self, cmd: &SdCommand) -> SdResult<CardStatus> {
        match self.ssp.send_command(cmd)? {
            SdResponse::R1(status) => status.check(),
            _ => Err(SdError::ProtocolError),
        }
    }

    /// CMD55 followed by an application command.
    pub(super) fn app_command(&mut self, cmd: &SdCommand) -> SdResult<SdResponse> {
        let rca = self.rca.unwrap_or(0);
        // Error bits in the CMD55 status belong to the previous command, an
        // ignored CMD8 on a v1 card shows up here as ILLEGAL_COMMAND.
        let status = match self.ssp.send_command(&SdCommand::AppCmd(rca))? {
            SdResponse::R1(status) => status,
            _ => return Err(SdError::ProtocolError),
        };
        if !status.contains(CardStatus::APP_CMD) {
            debug!("CMD55 not acknowledged: {status:?}");
            return Err(SdError::ProtocolError);
        }
        self.ssp.send_command(cmd)
    }

    pub(super) fn app_command_r1(&mut self, cmd: &SdCommand) -> SdResult<CardStatus> {
        match self.app_command(cmd)? {
            SdResponse::R1(status) => status.check(),
            _ => Err(SdError::ProtocolError),
        }
    }

    /// CMD13
    pub(super) fn card_status(&mut self) -> SdResult<CardStatus> {
        let rca = self.rca.ok_or(SdError::NoCard)?;
        let status = self.command_r1(&SdCommand::SendStatus(rca))?;
        trace!("card status {:#010x}, {:?}", status.bits(), status.current_state());
        Ok(status)
    }

    /// ACMD41 until the card reports power-up done. Returns the OCR.
    pub(super) fn wait_op_cond(&mut self, high_capacity_host: bool) -> SdResult<u32> {
        let cmd = SdCommand::SdSendOpCond {
            hcs: high_capacity_host,
            voltage_window: OCR_VOLTAGE_WINDOW,
        };
        let attempts = self.ssp.timeouts().op_cond_attempts;
        let delay = self.ssp.timeouts().op_cond_delay_us;

        for attempt in 0..attempts {
            match self.app_command(&cmd)? {
                SdResponse::R3(ocr) if ocr & OCR_BUSY != 0 => {
                    debug!("card powered up after {} ACMD41 rounds", attempt + 1);
                    return Ok(ocr);
                }
                SdResponse::R3(_) => self.ssp.delay_us(delay),
                _ => return Err(SdError::ProtocolError),
            }
        }
        Err(SdError::Timeout)
    }

    /// CMD9, card must be in stand-by state.
    pub(super) fn read_csd(&mut self, rca: u16) -> SdResult<Csd> {
        match self.ssp.send_command(&SdCommand::SendCsd(rca))? {
            SdResponse::R2(raw) => {
                let csd = Csd::parse(raw)?;
                debug!(
                    "CSD {:?}: C_SIZE {}, READ_BL_LEN {}, {} sectors",
                    csd.version,
                    csd.device_size,
                    csd.read_bl_len(),
                    csd.capacity_sectors()
                );
                Ok(csd)
            }
            _ => Err(SdError::ProtocolError),
        }
    }

    /// ACMD51, one 8-byte data block.
    pub(super) fn read_scr(&mut self) -> SdResult<Scr> {
        self.app_command_r1(&SdCommand::SendScr)?;
        let mut raw = [0u8; Scr::LEN];
        self.ssp.stream_data(DataBuffer::Read(&mut raw), None)?;
        let scr = Scr::parse(&raw);
        debug!("SCR: spec {}, bus widths {:#06b}", scr.sd_specification, scr.sd_bus_widths);
        Ok(scr)
    }

    /// CMD12
    pub(super) fn stop_transmission(&mut self) -> SdResult {
        match self.ssp.send_command(&SdCommand::StopTransmission)? {
            // A multi-block read ending on the last sector reads ahead past
            // the end, which the card flags on the stop.
            SdResponse::R1(status) => (status - CardStatus::OUT_OF_RANGE).check().map(|_| ()),
            _ => Err(SdError::ProtocolError),
        }
    }
}
