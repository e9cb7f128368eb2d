//! Free-sector map.
//!
//! One bit per device sector; set means in use. The map lives in
//! memory and is persisted as a regular file whose inode sits at
//! sector 0, so its on-disk bytes are exactly [`Bitmap::as_bytes`].

use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

use minos_fs_types::SectorNo;
use sector_cache::Owner;

use super::FileSys;
use crate::{bitmap::Bitmap, error::KernelError};

pub(crate) struct FreeMap {
    bits: Mutex<Bitmap>,
}

impl FreeMap {
    pub(crate) fn new(sectors: usize) -> Self {
        Self {
            bits: Mutex::new(Bitmap::new(sectors)),
        }
    }

    /// Marks the free-map file and root-directory sectors in use.
    pub(crate) fn reserve_metadata(&self) {
        let mut bits = self.bits.lock();
        bits.set(SectorNo::FREE_MAP.as_index());
        bits.set(SectorNo::ROOT_DIR.as_index());
    }

    /// Allocates one sector, or `None` if the device is full.
    pub(crate) fn allocate(&self) -> Option<SectorNo> {
        let i = self.bits.lock().scan_and_set()?;
        Some(SectorNo::new(u32::try_from(i).unwrap()))
    }

    /// Releases a sector.
    pub(crate) fn release(&self, sector: SectorNo) {
        let mut bits = self.bits.lock();
        assert!(bits.test(sector.as_index()), "releasing free sector");
        bits.clear(sector.as_index());
    }

    /// Size of the on-disk representation in bytes.
    pub(crate) fn byte_len(&self) -> usize {
        self.bits.lock().as_bytes().len()
    }

    /// Loads the map from the free-map file.
    pub(crate) fn load(&self, fs: &Arc<FileSys>) -> Result<(), KernelError> {
        let inode = super::Inode::open(fs, SectorNo::FREE_MAP)?;
        let mut buf = vec![0; self.byte_len()];
        let mut ra = super::RaState::new();
        let read = inode.read_at(Owner::KERNEL, &mut ra, &mut buf, 0);
        assert_eq!(read, buf.len(), "short free-map file");
        self.bits.lock().restore(&buf);
        Ok(())
    }

    /// Writes the map back into the free-map file.
    pub(crate) fn store(&self, fs: &Arc<FileSys>) -> Result<(), KernelError> {
        let inode = super::Inode::open(fs, SectorNo::FREE_MAP)?;
        let buf = self.bits.lock().as_bytes().to_vec();
        let written = inode.write_at(Owner::KERNEL, &buf, 0);
        assert_eq!(written, buf.len(), "short free-map write");
        Ok(())
    }

    /// Number of sectors in use. Diagnostic.
    pub(crate) fn used_count(&self) -> usize {
        self.bits.lock().count_set()
    }
}
