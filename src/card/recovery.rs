//! Reset-and-retry wrappers around the transfer engine.
//!
//! A transfer failing with a transient bus fault gets exactly one card reset
//! and one more attempt. The second result is returned as is.

use log::warn;

use crate::{
    card::{CardSession, SdIov, SdIovMut},
    common::{RegisterTransport, SdPlatform},
    err::{SdError, SdResult},
};

impl<T: RegisterTransport, P: SdPlatform> CardSession<T, P> {
    /// Read `count` sectors starting at `sector` into `buf`, which must hold
    /// exactly `count * 512` bytes.
    pub fn read(&mut self, sector: u32, buf: &mut [u8], count: u32) -> SdResult {
        self.read_scatter(sector, &mut [SdIovMut { base: buf, nsect: count }])
    }

    /// Write `count` sectors starting at `sector` from `buf`.
    pub fn write(&mut self, sector: u32, buf: &[u8], count: u32) -> SdResult {
        self.write_scatter(sector, &[SdIov { base: buf, nsect: count }])
    }

    pub fn read_scatter(&mut self, sector: u32, iov: &mut [SdIovMut<'_>]) -> SdResult {
        match self.do_read(sector, iov) {
            Err(e) if e.is_transient() => {
                self.recover("read", sector, e);
                self.do_read(sector, iov)
            }
            result => result,
        }
    }

    pub fn write_scatter(&mut self, sector: u32, iov: &[SdIov<'_>]) -> SdResult {
        match self.do_write(sector, iov) {
            Err(e) if e.is_transient() => {
                self.recover("write", sector, e);
                self.do_write(sector, iov)
            }
            result => result,
        }
    }

    /// The retry runs whatever the reset outcome; a card that did not come
    /// back fails it with its own error.
    fn recover(&mut self, op: &str, sector: u32, err: SdError) {
        warn!("{op} at sector {sector} failed: {err}, resetting card");
        if let Err(e) = self.reset() {
            warn!("reset before retry failed: {e}");
        }
    }
}
