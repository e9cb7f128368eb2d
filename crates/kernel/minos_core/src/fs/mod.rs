//! File system context.
//!
//! [`FileSys`] ties the sector cache, the free-sector map and the table
//! of open inodes to one block device. Inode handles keep their
//! `FileSys` alive; the interning table only holds weak references, so
//! dropping the last handle of an inode releases it.

mod fd_table;
mod file;
mod free_map;
mod inode;
mod readahead;

pub use fd_table::FdTable;
pub use file::File;
pub use inode::Inode;
pub use readahead::RaState;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use minos_fs_types::{InodeKind, SectorNo};
use sector_cache::{BlockDevice, Owner, SectorCache};

use crate::error::KernelError;
use free_map::FreeMap;

pub struct FileSys {
    cache: SectorCache,
    free_map: FreeMap,
    /// Open inodes, so that opening a sector twice returns the same
    /// handle.
    inodes: Mutex<Vec<(SectorNo, Weak<Inode>)>>,
}

impl FileSys {
    /// Brings up the file system on `device`.
    ///
    /// With `format` set, wipes the device: writes a fresh free-map
    /// file at sector 0 and an empty root directory at sector 1.
    /// Otherwise the free map is loaded from the existing image.
    pub fn new(device: Arc<dyn BlockDevice>, format: bool) -> Result<Arc<Self>, KernelError> {
        let sectors = device.sector_count();
        let fs = Arc::new(Self {
            cache: SectorCache::new(device),
            free_map: FreeMap::new(usize::try_from(sectors).unwrap()),
            inodes: Mutex::new(Vec::new()),
        });
        if format {
            Self::format(&fs)?;
        } else {
            fs.free_map.load(&fs)?;
        }
        Ok(fs)
    }

    fn format(fs: &Arc<Self>) -> Result<(), KernelError> {
        log::debug!("formatting file system");
        fs.free_map.reserve_metadata();
        fs.create_inode(SectorNo::FREE_MAP, fs.free_map.byte_len(), InodeKind::File)?;
        fs.create_inode(SectorNo::ROOT_DIR, 0, InodeKind::Dir)?;
        fs.free_map.store(fs)?;
        Ok(())
    }

    /// Shuts the file system down: persists the free map and writes
    /// every dirty sector back.
    pub fn done(fs: &Arc<Self>) -> Result<(), KernelError> {
        fs.free_map.store(fs)?;
        fs.cache.clear();
        Ok(())
    }

    /// Timer hook; drives the cache's write-behind clock.
    pub fn tick(&self) {
        self.cache.tick();
    }

    pub fn cache(&self) -> &SectorCache {
        &self.cache
    }

    /// Allocates a sector for a new inode.
    pub fn allocate_sector(&self) -> Result<SectorNo, KernelError> {
        self.free_map.allocate().ok_or(KernelError::OutOfSectors)
    }

    /// Returns a sector to the free map.
    pub fn release_sector(&self, sector: SectorNo) {
        self.free_map.release(sector);
    }

    /// Number of sectors in use. Diagnostic.
    pub fn used_sectors(&self) -> usize {
        self.free_map.used_count()
    }

    pub(crate) fn free_map(&self) -> &FreeMap {
        &self.free_map
    }

    /// Allocates a sector and zero-fills it through the cache,
    /// recording it in `allocated` for rollback.
    pub(crate) fn alloc_zeroed_sector(
        &self,
        allocated: &mut Vec<SectorNo>,
    ) -> Result<SectorNo, KernelError> {
        let sector = self.free_map.allocate().ok_or(KernelError::OutOfSectors)?;
        allocated.push(sector);
        self.cache
            .memset(sector, Owner::KERNEL, 0, 0, minos_fs_types::SECTOR_SIZE)?;
        Ok(sector)
    }
}
