//! Swap-slot allocator.
//!
//! The swap device is divided into fixed slots of one page
//! ([`SECTORS_PER_PAGE`] sectors) each, tracked by a bitmap. The scan
//! reserves the slot before any I/O, so concurrent stores never collide
//! on a slot. Slots are single-use: loading a page back clears the
//! bit, and re-storing the page may land in a different slot.

use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use minos_fs_types::SectorNo;
use sector_cache::BlockDevice;

use super::{KPage, PagePool};
use crate::{
    bitmap::Bitmap,
    error::KernelError,
    param::{PAGE_SIZE, SECTORS_PER_PAGE},
};

/// Index of one page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u32);

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "swap#{}", self.0)
    }
}

impl SwapSlot {
    fn sector(self, i: usize) -> SectorNo {
        SectorNo::new(self.0 * u32::try_from(SECTORS_PER_PAGE).unwrap() + u32::try_from(i).unwrap())
    }

    fn index(self) -> usize {
        usize::try_from(self.0).unwrap()
    }
}

pub struct SwapDevice {
    device: Arc<dyn BlockDevice>,
    map: Mutex<Bitmap>,
}

impl SwapDevice {
    /// Creates the allocator over `device`, one slot per page that
    /// fits.
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = usize::try_from(device.sector_count()).unwrap() / SECTORS_PER_PAGE;
        Self {
            device,
            map: Mutex::new(Bitmap::new(slots)),
        }
    }

    /// Writes the frame at `kpage` into a fresh slot.
    pub fn store(&self, pool: &PagePool, kpage: KPage) -> Result<SwapSlot, KernelError> {
        let slot = {
            let mut map = self.map.lock();
            map.scan_and_set()
        };
        let Some(slot) = slot else {
            log::warn!("swap space exhausted");
            return Err(KernelError::SwapFull);
        };
        let slot = SwapSlot(u32::try_from(slot).unwrap());
        pool.with_page(kpage, |data| {
            for i in 0..SECTORS_PER_PAGE {
                let chunk = &data[i * PAGE_SIZE / SECTORS_PER_PAGE..][..PAGE_SIZE / SECTORS_PER_PAGE];
                self.device.write_sector(slot.sector(i), chunk.try_into().unwrap());
            }
        });
        Ok(slot)
    }

    /// Reads `slot` back into the frame at `kpage` and releases the
    /// slot.
    pub fn load(&self, pool: &PagePool, kpage: KPage, slot: SwapSlot) {
        pool.with_page_mut(kpage, |data| {
            for i in 0..SECTORS_PER_PAGE {
                let chunk =
                    &mut data[i * PAGE_SIZE / SECTORS_PER_PAGE..][..PAGE_SIZE / SECTORS_PER_PAGE];
                self.device.read_sector(slot.sector(i), chunk.try_into().unwrap());
            }
        });
        self.map.lock().clear(slot.index());
    }

    /// Releases `slot` without reading it.
    pub fn free(&self, slot: SwapSlot) {
        self.map.lock().clear(slot.index());
    }

    /// Total number of slots.
    pub fn slot_count(&self) -> usize {
        self.map.lock().len()
    }

    /// Number of slots in use. Diagnostic.
    pub fn used_slots(&self) -> usize {
        self.map.lock().count_set()
    }

    /// Whether `slot` is free. Diagnostic.
    pub fn is_free(&self, slot: SwapSlot) -> bool {
        !self.map.lock().test(slot.index())
    }
}
