//! In-memory block device shared by the integration suites.

use std::sync::{Arc, Mutex};

use minos_fs_types::{SectorNo, SECTOR_SIZE};
use sector_cache::BlockDevice;

pub struct MemDisk {
    sectors: Vec<Mutex<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    pub fn new(sectors: usize) -> Arc<Self> {
        Arc::new(Self {
            sectors: (0..sectors).map(|_| Mutex::new([0; SECTOR_SIZE])).collect(),
        })
    }

    /// Raw device contents of one sector, bypassing any cache.
    #[allow(dead_code)]
    pub fn raw(&self, sector: u32) -> [u8; SECTOR_SIZE] {
        *self.sectors[sector as usize].lock().unwrap()
    }
}

impl BlockDevice for MemDisk {
    fn read_sector(&self, sector: SectorNo, buf: &mut [u8; SECTOR_SIZE]) {
        buf.copy_from_slice(&*self.sectors[sector.as_index()].lock().unwrap());
    }

    fn write_sector(&self, sector: SectorNo, buf: &[u8; SECTOR_SIZE]) {
        self.sectors[sector.as_index()]
            .lock()
            .unwrap()
            .copy_from_slice(buf);
    }

    fn sector_count(&self) -> u32 {
        u32::try_from(self.sectors.len()).unwrap()
    }
}
