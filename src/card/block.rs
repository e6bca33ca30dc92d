use log::{debug, trace};

use crate::{
    card::{CardPhase, CardSession, SECTOR_SIZE},
    common::{
        RegisterTransport, SdPlatform,
        commands::{DataBuffer, SdCommand},
    },
    crc::CrcHint,
    err::{SdError, SdResult},
};

/// One scatter segment of a write: `nsect` sectors at `base`.
pub struct SdIov<'a> {
    pub base: &'a [u8],
    pub nsect: u32,
}

/// One scatter segment of a read.
pub struct SdIovMut<'a> {
    pub base: &'a mut [u8],
    pub nsect: u32,
}

impl<T: RegisterTransport, P: SdPlatform> CardSession<T, P> {
    /// Validate a request before any bus traffic.
    fn check_access(&self, sector: u32, count: u32, write: bool) -> SdResult {
        if self.phase != CardPhase::Ready {
            return Err(SdError::NoCard);
        }
        if self.locked {
            return Err(SdError::Locked);
        }
        if write && self.write_protected {
            return Err(SdError::WriteProtected);
        }
        if sector as u64 + count as u64 > self.capacity_sectors as u64 {
            return Err(SdError::OutOfRange);
        }
        Ok(())
    }

    /// Byte address on standard capacity cards, block address otherwise.
    fn card_address(&self, sector: u32) -> u32 {
        if self.high_capacity {
            sector
        } else {
            sector * SECTOR_SIZE as u32
        }
    }

    pub(crate) fn do_read(&mut self, sector: u32, iov: &mut [SdIovMut<'_>]) -> SdResult {
        let count = iov.iter().map(|seg| seg.nsect as u64).sum::<u64>();
        if count == 0 {
            return Ok(());
        }
        let count = u32::try_from(count).map_err(|_| SdError::OutOfRange)?;
        self.check_access(sector, count, false)?;
        if iov
            .iter()
            .any(|seg| seg.base.len() != seg.nsect as usize * SECTOR_SIZE)
        {
            return Err(SdError::InvalidArgument);
        }

        self.close_parked()?;
        trace!("read: sector {sector}, count {count}");

        let addr = self.card_address(sector);
        let multi = count > 1;
        let cmd = if multi {
            SdCommand::ReadMultipleBlock(addr)
        } else {
            SdCommand::ReadSingleBlock(addr)
        };
        self.command_r1(&cmd)?;

        let result = self.read_segments(iov);
        if multi {
            let stop = self.stop_transmission();
            result?;
            stop
        } else {
            result
        }
    }

    fn read_segments(&mut self, iov: &mut [SdIovMut<'_>]) -> SdResult {
        for seg in iov.iter_mut() {
            self.ssp.dma_prepare(seg.base);
            for block in seg.base.chunks_exact_mut(SECTOR_SIZE) {
                self.ssp.stream_data(DataBuffer::Read(block), None)?;
            }
        }
        Ok(())
    }

    pub(crate) fn do_write(&mut self, sector: u32, iov: &[SdIov<'_>]) -> SdResult {
        let count = iov.iter().map(|seg| seg.nsect as u64).sum::<u64>();
        if count == 0 {
            return Ok(());
        }
        let count = u32::try_from(count).map_err(|_| SdError::OutOfRange)?;
        self.check_access(sector, count, true)?;
        if iov
            .iter()
            .any(|seg| seg.base.len() != seg.nsect as usize * SECTOR_SIZE)
        {
            return Err(SdError::InvalidArgument);
        }

        let result = self.write_blocks(sector, count, iov);
        if result == Err(SdError::WriteProtected) {
            self.write_protected = true;
        }
        result
    }

    fn write_blocks(&mut self, sector: u32, count: u32, iov: &[SdIov<'_>]) -> SdResult {
        let continuing = self.parked == Some(sector);
        if continuing {
            trace!("write: continuing parked stream at sector {sector}");
        } else {
            self.close_parked()?;
        }
        self.parked = None;
        trace!("write: sector {sector}, count {count}");

        let multi = continuing || count > 1 || self.write_parking;
        if !continuing {
            let addr = self.card_address(sector);
            if multi {
                if self.erase_hint > 0 {
                    self.app_command_r1(&SdCommand::SetWrBlkEraseCount(self.erase_hint))?;
                }
                self.command_r1(&SdCommand::WriteMultipleBlock(addr))?;
            } else {
                self.command_r1(&SdCommand::WriteBlock(addr))?;
            }
        }

        let hint = self.crc_hint.take();
        if let Err(e) = self.write_segments(iov, hint) {
            if multi {
                if let Err(stop) = self.stop_transmission() {
                    debug!("stop after failed write: {stop}");
                }
            }
            return Err(e);
        }

        if !multi {
            self.ssp.wait_not_busy()?;
            self.card_status()?;
        } else if self.write_parking {
            self.parked = Some(sector + count);
        } else {
            self.stop_transmission()?;
        }
        Ok(())
    }

    fn write_segments(&mut self, iov: &[SdIov<'_>], mut hint: Option<CrcHint>) -> SdResult {
        for seg in iov {
            self.ssp.dma_prepare(seg.base);
            for block in seg.base.chunks_exact(SECTOR_SIZE) {
                self.ssp.stream_data(DataBuffer::Write(block), hint.take())?;
            }
        }
        Ok(())
    }

    /// Close a parked multi-block write.
    pub(super) fn close_parked(&mut self) -> SdResult {
        if let Some(next) = self.parked.take() {
            debug!("closing parked write before sector {next}");
            self.stop_transmission()?;
        }
        Ok(())
    }

    /// Finish any write left open by write parking.
    pub fn stop(&mut self) -> SdResult {
        self.close_parked()
    }
}
