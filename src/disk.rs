//! Block-device view of a card session for an OS block layer.
//!
//! One lock per session, held across each whole call.

use kspin::SpinNoIrq;
use log::{debug, error, info};

use crate::{
    card::{CardSession, SECTOR_SIZE, SdIovMut},
    common::{RegisterTransport, SdPlatform, commands::DataBuffer},
    err::{SdError, SdResult},
};

/// Fake CHS geometry consistent with the capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub heads: u8,
    pub sectors: u8,
    pub cylinders: u32,
}

struct DiskInner<T: RegisterTransport, P: SdPlatform> {
    card: CardSession<T, P>,
    size: u32,
    media_changed: bool,
}

pub struct SdDisk<T: RegisterTransport, P: SdPlatform> {
    inner: SpinNoIrq<DiskInner<T, P>>,
}

impl<T: RegisterTransport, P: SdPlatform> SdDisk<T, P> {
    /// The disk starts out changed, the first [`SdDisk::revalidate`] resets
    /// the card.
    pub fn new(card: CardSession<T, P>) -> Self {
        SdDisk {
            inner: SpinNoIrq::new(DiskInner {
                card,
                size: 0,
                media_changed: true,
            }),
        }
    }

    /// Reset the card if the medium changed and refresh size and read-only
    /// state. Returns the capacity in sectors.
    pub fn revalidate(&self) -> SdResult<u32> {
        let mut inner = self.inner.lock();
        debug!("revalidate, media changed: {}", inner.media_changed);
        if !inner.media_changed {
            return Ok(inner.size);
        }

        match inner.card.reset() {
            Ok(size) => {
                inner.size = size;
                inner.media_changed = false;
                info!(
                    "sd disk: {} sectors{}",
                    size,
                    if inner.card.is_write_protected() { ", read only" } else { "" }
                );
                Ok(size)
            }
            Err(e) => {
                inner.size = inner.card.capacity_sectors();
                error!("revalidate: no usable card ({e})");
                Err(e)
            }
        }
    }

    /// Test read of sector 1. Any failure marks the medium changed.
    pub fn check_media_change(&self) -> bool {
        let mut inner = self.inner.lock();
        let mut scratch = [0u8; SECTOR_SIZE];
        let changed = inner
            .card
            .do_read(1, &mut [SdIovMut { base: &mut scratch, nsect: 1 }])
            .is_err();
        inner.media_changed |= changed;
        debug!("media changed: {}", inner.media_changed);
        inner.media_changed
    }

    pub fn capacity(&self) -> u32 {
        self.inner.lock().size
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.lock().card.is_write_protected()
    }

    pub fn geometry(&self) -> DiskGeometry {
        const HEADS: u8 = 16;
        const SECTORS: u8 = 32;
        DiskGeometry {
            heads: HEADS,
            sectors: SECTORS,
            cylinders: self.capacity() / (HEADS as u32 * SECTORS as u32),
        }
    }

    /// Run a request made of consecutive segments, starting at `sector`.
    /// Stops at the first failing segment.
    pub fn transfer(&self, sector: u32, segments: &mut [DataBuffer<'_>]) -> SdResult {
        let mut inner = self.inner.lock();
        let mut sector = sector;

        for seg in segments.iter_mut() {
            if seg.len() % SECTOR_SIZE != 0 {
                return Err(SdError::InvalidArgument);
            }
            let nsect = (seg.len() / SECTOR_SIZE) as u32;
            if sector as u64 + nsect as u64 > inner.size as u64 {
                error!("transfer: beyond-end request ({sector} {nsect})");
                return Err(SdError::OutOfRange);
            }

            match seg {
                DataBuffer::Read(buf) => inner.card.read(sector, buf, nsect)?,
                DataBuffer::Write(buf) => inner.card.write(sector, buf, nsect)?,
            }
            sector += nsect;
        }
        Ok(())
    }

    /// Run `f` with the session locked.
    pub fn with_card<R>(&self, f: impl FnOnce(&mut CardSession<T, P>) -> R) -> R {
        f(&mut self.inner.lock().card)
    }
}
