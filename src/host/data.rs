use log::{trace, warn};

use crate::{
    common::{RegisterTransport, SdPlatform, commands::DataBuffer},
    crc::{BlockCrc, CrcBytes, CrcHint},
    err::{SdError, SdResult},
    host::SspHost,
    regs::{SdReg, SdState, SspStatus},
};

/// CRC status token after a written block: `0b010` accepted, `0b101`
/// rejected for a CRC error, anything else a write error.
const TOKEN_MASK: u8 = 0b111;
const TOKEN_ACCEPTED: u8 = 0b010;
const TOKEN_CRC_ERROR: u8 = 0b101;

impl<T: RegisterTransport, P: SdPlatform> SspHost<T, P> {
    /// Move one data block through the data register.
    ///
    /// Reads verify the trailing CRC16. Writes append the CRC16, or `hint`
    /// when it was computed for the current bus width, and check the card's
    /// status token.
    pub fn stream_data(&mut self, data: DataBuffer<'_>, hint: Option<CrcHint>) -> SdResult<usize> {
        match data {
            DataBuffer::Read(buf) => {
                let data_polls = self.timeouts.data_polls;
                self.poll(data_polls, |s| s.contains(SspStatus::DAT_READY))?;

                self.state.insert(SdState::DAT_RX);
                let result = self.receive_block(buf);
                self.state.remove(SdState::DAT_RX);
                result
            }
            DataBuffer::Write(buf) => {
                self.wait_not_busy()?;

                let wide = self.is_wide();
                let hint = hint.filter(|h| h.is_wide() == wide);
                self.state.insert(SdState::DAT_TX);
                self.state.set(SdState::CRC_DISABLE, hint.is_some());
                let result = self.transmit_block(buf, hint);
                self.state.remove(SdState::DAT_TX | SdState::CRC_DISABLE);
                result
            }
        }
    }

    fn receive_block(&mut self, buf: &mut [u8]) -> SdResult<usize> {
        let wide = self.is_wide();
        let state = self.state;

        let crc = if self.platform.has_dma() && self.platform.dma_stream(state, DataBuffer::Read(&mut *buf))
        {
            BlockCrc::new(wide).feed_slice(buf)
        } else {
            let mut crc = BlockCrc::new(wide);
            for byte in buf.iter_mut() {
                *byte = self.read_data_byte(wide);
                crc = crc.feed_byte(*byte);
            }
            crc
        };

        let expected = crc.crc_bytes();
        let expected = expected.as_slice();
        let mut received = [0u8; 8];
        let received = &mut received[..expected.len()];
        for byte in received.iter_mut() {
            *byte = self.read_data_byte(wide);
        }

        if received != expected {
            warn!(
                "data CRC mismatch: got {:02x?}, computed {:02x?}",
                received, expected
            );
            return Err(SdError::CrcMismatch);
        }
        trace!("read block of {} bytes", buf.len());
        Ok(buf.len())
    }

    fn transmit_block(&mut self, buf: &[u8], hint: Option<CrcHint>) -> SdResult<usize> {
        let wide = self.is_wide();
        let state = self.state;
        let compute = hint.is_none();

        let mut crc = BlockCrc::new(wide);
        if self.platform.has_dma() && self.platform.dma_stream(state, DataBuffer::Write(buf)) {
            if compute {
                crc = crc.feed_slice(buf);
            }
        } else {
            for &byte in buf {
                self.write_data_byte(byte, wide);
                if compute {
                    crc = crc.feed_byte(byte);
                }
            }
        }

        let crc: CrcBytes = hint.unwrap_or_else(|| crc.crc_bytes());
        for &byte in crc.as_slice() {
            self.write_data_byte(byte, wide);
        }

        let data_polls = self.timeouts.data_polls;
        self.poll(data_polls, |s| s.contains(SspStatus::DAT_READY))?;
        match self.regs.read_reg(SdReg::Data) & TOKEN_MASK {
            TOKEN_ACCEPTED => {
                trace!("wrote block of {} bytes", buf.len());
                Ok(buf.len())
            }
            TOKEN_CRC_ERROR => {
                warn!("card rejected block: CRC error");
                Err(SdError::CrcMismatch)
            }
            token => {
                warn!("card rejected block: token {:#05b}", token);
                Err(SdError::ProtocolError)
            }
        }
    }

    /// One byte from DAT, MSB first: eight 1-bit samples or two nibbles.
    fn read_data_byte(&mut self, wide: bool) -> u8 {
        if wide {
            let hi = self.regs.read_reg(SdReg::Data) & 0xf;
            let lo = self.regs.read_reg(SdReg::Data) & 0xf;
            (hi << 4) | lo
        } else {
            (0..8).fold(0u8, |acc, _| (acc << 1) | (self.regs.read_reg(SdReg::Data) & 1))
        }
    }

    fn write_data_byte(&mut self, byte: u8, wide: bool) {
        if wide {
            self.regs.write_reg(SdReg::Data, byte >> 4);
            self.regs.write_reg(SdReg::Data, byte & 0xf);
        } else {
            for bit in (0..8).rev() {
                self.regs.write_reg(SdReg::Data, (byte >> bit) & 1);
            }
        }
    }
}
