pub mod commands;
pub mod csd;

use commands::DataBuffer;

use crate::regs::{SdReg, SdState};

/// Byte access to the four registers of one SD core window.
///
/// [`crate::regs::MmioTransport`] talks to real hardware; tests plug in a
/// simulated card.
pub trait RegisterTransport {
    fn read_reg(&mut self, reg: SdReg) -> u8;
    fn write_reg(&mut self, reg: SdReg, value: u8);
}

/// Services the environment provides to the core.
pub trait SdPlatform {
    /// Stall for `us` microseconds. A multitasking host may yield here.
    fn delay_us(&mut self, us: u32);

    /// Sleep until the SD interrupt fires or `us` microseconds pass. Poll
    /// loops call this after a miss; without interrupt support it is a plain
    /// delay.
    fn irq_wait(&mut self, us: u32) {
        self.delay_us(us);
    }

    /// Hardware revision of the SD core, when the platform knows it.
    fn core_version(&self) -> Option<u32> {
        None
    }

    /// Whether [`SdPlatform::dma_stream`] can move data blocks.
    fn has_dma(&self) -> bool {
        false
    }

    /// Called once per distinct buffer before any `dma_stream` on it, for
    /// cache maintenance.
    fn dma_prepare(&mut self, _buf: &[u8]) {}

    /// Move one data block through the data register. `state` carries the
    /// direction and bus width. Returns `true` when the transfer ran to
    /// completion.
    fn dma_stream(&mut self, _state: SdState, _data: DataBuffer<'_>) -> bool {
        false
    }
}

impl<T: RegisterTransport + ?Sized> RegisterTransport for &mut T {
    fn read_reg(&mut self, reg: SdReg) -> u8 {
        (**self).read_reg(reg)
    }

    fn write_reg(&mut self, reg: SdReg, value: u8) {
        (**self).write_reg(reg, value)
    }
}
