//! Memory-mapped files.
//!
//! Each process keeps a list of its file mappings. Creating one
//! reopens the file (so closing the descriptor does not tear the
//! mapping down) and records one supplemental MMAPFILE entry per page;
//! frames are only allocated when the pages fault in. Unmapping writes
//! dirty pages back to the file and returns their frames; the reopened
//! handle drops with the mapping.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use super::{PageOrigin, UPage, Vm};
use crate::{error::KernelError, fs::File, param::PAGE_SIZE, proc::Thread};

/// Mapping identifier, unique within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(u32);

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MapId {
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

/// One file mapping.
pub struct Mapping {
    mapid: MapId,
    addr: UPage,
    pages: usize,
    file: Arc<File>,
}

impl Mapping {
    pub fn mapid(&self) -> MapId {
        self.mapid
    }

    pub fn addr(&self) -> UPage {
        self.addr
    }

    /// Size in pages.
    pub fn pages(&self) -> usize {
        self.pages
    }
}

/// Per-process mapping list, owned and serialized by the process.
#[derive(Default)]
pub struct MmapTable {
    maps: Vec<Mapping>,
}

impl MmapTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next mapid: one past the last, starting from 1.
    fn next_id(&self) -> MapId {
        MapId(self.maps.last().map_or(0, |m| m.mapid.0) + 1)
    }

    fn take(&mut self, mapid: MapId) -> Option<Mapping> {
        let i = self.maps.iter().position(|m| m.mapid == mapid)?;
        Some(self.maps.remove(i))
    }

    fn drain_all(&mut self) -> Vec<Mapping> {
        core::mem::take(&mut self.maps)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.maps.iter()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

impl Vm {
    /// Maps `file` at `addr` and returns the mapping id.
    ///
    /// The address must be page-aligned and non-null, the file
    /// non-empty, and the page range free of existing supplemental
    /// entries. On a mid-install failure every entry added by this
    /// call is removed and the reopened handle is dropped.
    pub fn mmap(&self, t: &Arc<Thread>, file: &Arc<File>, addr: usize) -> Result<MapId, KernelError> {
        let Some(base) = UPage::new(addr) else {
            return Err(KernelError::BadMappingAddress(addr));
        };
        let file = file.reopen();
        let len = file.len()?;
        if len == 0 {
            return Err(KernelError::EmptyMapping);
        }
        let pages = len.div_ceil(PAGE_SIZE);

        let mut pmap = t.pages().lock();
        for i in 0..pages {
            if pmap.find(base.add_pages(i)).is_some() {
                return Err(KernelError::MappingOverlap);
            }
        }
        for i in 0..pages {
            let ofs = i * PAGE_SIZE;
            let read_bytes = usize::min(PAGE_SIZE, len - ofs);
            if let Err(e) = pmap.add_mapfile(Arc::clone(&file), ofs, base.add_pages(i), read_bytes)
            {
                for j in 0..i {
                    pmap.delete(base.add_pages(j));
                }
                return Err(e);
            }
        }
        drop(pmap);

        let mut maps = t.mmaps().lock();
        let mapid = maps.next_id();
        maps.maps.push(Mapping {
            mapid,
            addr: base,
            pages,
            file,
        });
        Ok(mapid)
    }

    /// Tears the mapping `mapid` down, writing dirty pages back.
    pub fn munmap(&self, t: &Arc<Thread>, mapid: MapId) -> Result<(), KernelError> {
        let mapping = t
            .mmaps()
            .lock()
            .take(mapid)
            .ok_or(KernelError::MappingNotFound(mapid.value()))?;
        self.unmap_pages(t, &mapping);
        Ok(())
    }

    /// Tears every mapping of `t` down. Part of process teardown.
    pub fn munmap_all(&self, t: &Arc<Thread>) {
        let mappings = t.mmaps().lock().drain_all();
        for mapping in &mappings {
            self.unmap_pages(t, mapping);
        }
    }

    fn unmap_pages(&self, t: &Arc<Thread>, mapping: &Mapping) {
        for i in 0..mapping.pages {
            let upage = mapping.addr.add_pages(i);
            let Some(entry) = t.pages().lock().delete(upage) else {
                continue;
            };
            if !entry.is_loaded() {
                continue;
            }
            let Some(kpage) = t.pagedir().lookup(upage) else {
                continue;
            };
            if t.pagedir().is_dirty(upage) {
                if let PageOrigin::Mmap {
                    file,
                    ofs,
                    read_bytes,
                } = entry.origin()
                {
                    self.pool()
                        .with_page(kpage, |data| file.write_at(&data[..*read_bytes], *ofs));
                }
            }
            t.pagedir().clear(upage);
            self.frame_free(kpage);
        }
    }
}
