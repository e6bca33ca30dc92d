//! Command and data channels over the four-register window.

pub mod cmd;
pub mod data;

use log::debug;

use crate::{
    common::{RegisterTransport, SdPlatform},
    config::SdTimeouts,
    err::{SdError, SdResult},
    regs::{SdReg, SdState, SspControl, SspStatus},
};

/// Drives one SD core window. Owns the register transport and the platform
/// services for the lifetime of the session.
pub struct SspHost<T: RegisterTransport, P: SdPlatform> {
    regs: T,
    platform: P,
    timeouts: SdTimeouts,
    control: SspControl,
    state: SdState,
}

impl<T: RegisterTransport, P: SdPlatform> SspHost<T, P> {
    pub fn new(regs: T, platform: P, timeouts: SdTimeouts, lun: u8) -> Self {
        SspHost {
            regs,
            platform,
            timeouts,
            control: SspControl::empty().with_lun(lun),
            state: SdState::empty(),
        }
    }

    /// Back to identification mode: slow clock, 1-bit bus, byte addressing.
    pub fn init(&mut self) {
        self.control.remove(SspControl::WIDE_BUS | SspControl::FAST_CLOCK);
        self.state = SdState::empty();
        self.write_control();
        debug!("ssp: identification mode, control {:#04x}", self.control.bits());
    }

    pub fn core_version(&self) -> Option<u32> {
        self.platform.core_version()
    }

    pub fn state(&self) -> SdState {
        self.state
    }

    pub fn timeouts(&self) -> &SdTimeouts {
        &self.timeouts
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn is_wide(&self) -> bool {
        self.state.contains(SdState::WIDE_BUS)
    }

    pub fn set_wide_bus(&mut self, wide: bool) {
        self.control.set(SspControl::WIDE_BUS, wide);
        self.state.set(SdState::WIDE_BUS, wide);
        self.write_control();
    }

    pub fn set_fast_clock(&mut self, fast: bool) {
        self.control.set(SspControl::FAST_CLOCK, fast);
        self.write_control();
    }

    /// Block-indexed addressing; sector numbers go out unscaled.
    pub fn set_addressing_direct(&mut self, direct: bool) {
        self.state.set(SdState::ADDRESSING_DIRECT, direct);
    }

    pub fn card_absent(&mut self) -> bool {
        self.read_control().contains(SspControl::CARD_ABSENT)
    }

    /// Mechanical write-protect tab of the slot.
    pub fn write_protect_switch(&mut self) -> bool {
        self.read_control().contains(SspControl::WRITE_PROTECT)
    }

    pub fn delay_us(&mut self, us: u32) {
        self.platform.delay_us(us);
    }

    /// Cache maintenance ahead of DMA on `buf`.
    pub fn dma_prepare(&mut self, buf: &[u8]) {
        if self.platform.has_dma() {
            self.platform.dma_prepare(buf);
        }
    }

    /// Wait for the card to release DAT0.
    pub fn wait_not_busy(&mut self) -> SdResult {
        self.wait_not_busy_within(self.timeouts.busy_polls)
    }

    /// Same as [`SspHost::wait_not_busy`] with an explicit bound, for
    /// operations that keep the card busy far longer than a block write.
    pub fn wait_not_busy_within(&mut self, polls: u32) -> SdResult {
        self.poll(polls, |s| !s.contains(SspStatus::DAT_BUSY))
            .map(|_| ())
    }

    fn read_control(&mut self) -> SspControl {
        SspControl::from_bits_retain(self.regs.read_reg(SdReg::Control))
    }

    fn write_control(&mut self) {
        let value = self.control & SspControl::WRITABLE;
        self.regs.write_reg(SdReg::Control, value.bits());
    }

    fn status(&mut self) -> SspStatus {
        SspStatus::from_bits_retain(self.regs.read_reg(SdReg::State))
    }

    /// Check the state register up to `polls` times, waiting for the SD
    /// interrupt for at most `poll_delay_us` after each miss.
    fn poll(
        &mut self,
        polls: u32,
        mut ready: impl FnMut(SspStatus) -> bool,
    ) -> SdResult<SspStatus> {
        for _ in 0..polls {
            let status = self.status();
            if ready(status) {
                return Ok(status);
            }
            self.platform.irq_wait(self.timeouts.poll_delay_us);
        }
        Err(SdError::Timeout)
    }
}
