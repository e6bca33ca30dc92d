use log::{debug, trace};

use crate::{
    common::{
        RegisterTransport, SdPlatform,
        commands::{ResponseKind, SdCommand, SdResponse},
    },
    err::SdResult,
    host::SspHost,
    regs::{SdReg, SdState, SspStatus},
};

/// Longest response: R2, start byte plus the 16-byte register.
const MAX_RESPONSE_LEN: usize = 17;

impl<T: RegisterTransport, P: SdPlatform> SspHost<T, P> {
    /// Send one command and collect its response.
    ///
    /// The response is checked for framing, command index and CRC7; card
    /// status bits are left to the caller. R1b responses also wait for the
    /// card to leave the busy state.
    pub fn send_command(&mut self, cmd: &SdCommand) -> SdResult<SdResponse> {
        let command_polls = self.timeouts.command_polls;
        self.poll(command_polls, |s| s.contains(SspStatus::CMD_READY))?;

        trace!(
            "CMD{}: arg={:#010x}, resp={:?}",
            cmd.index(),
            cmd.argument(),
            cmd.response_kind()
        );

        self.state.insert(SdState::CMD_TX);
        for byte in cmd.frame() {
            self.regs.write_reg(SdReg::Command, byte);
        }
        self.state.remove(SdState::CMD_TX);

        let kind = cmd.response_kind();
        if kind == ResponseKind::None {
            return Ok(SdResponse::None);
        }

        self.state.insert(SdState::CMD_RX);
        let response = self.read_response(cmd, kind);
        self.state.remove(SdState::CMD_RX);

        let response = response.inspect_err(|e| debug!("CMD{} failed: {e}", cmd.index()))?;
        if kind == ResponseKind::R1b {
            self.wait_not_busy()?;
        }
        Ok(response)
    }

    fn read_response(&mut self, cmd: &SdCommand, kind: ResponseKind) -> SdResult<SdResponse> {
        let command_polls = self.timeouts.command_polls;
        self.poll(command_polls, |s| s.contains(SspStatus::RESP_READY))?;

        let mut raw = [0u8; MAX_RESPONSE_LEN];
        let raw = &mut raw[..kind.len()];
        for byte in raw.iter_mut() {
            *byte = self.regs.read_reg(SdReg::Command);
        }
        SdResponse::parse(cmd, raw)
    }
}
