//! Supplemental page map.
//!
//! Each process maps every user page it may fault on to a
//! [`PageEntry`] describing where the page's contents come from: an
//! executable file region, a memory-mapped file region, or an
//! anonymous stack page. A page that has been evicted to swap keeps
//! its origin and additionally carries the swap slot; loading it back
//! drops the slot and demotes the page to its origin again.
//!
//! The valid position states are exactly STACK, FILE, MMAPFILE,
//! FILE|SWAP and STACK|SWAP; mapped-file pages are written back to
//! their file instead of swapping.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::{SwapSlot, UPage, Vm};
use crate::{error::KernelError, fs::File, param::PAGE_SIZE, proc::Thread};

bitflags! {
    /// Where a page's contents currently live, as a position mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Position: u8 {
        const STACK = 0x01;
        const FILE = 0x02;
        const MMAPFILE = 0x04;
        const SWAP = 0x08;
    }
}

/// Where a page's initial contents come from.
pub enum PageOrigin {
    /// Anonymous stack page.
    Stack,
    /// Region of an executable file.
    File {
        file: Arc<File>,
        ofs: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    },
    /// Region of a memory-mapped file; always writable, written back
    /// to the file when dirty.
    Mmap {
        file: Arc<File>,
        ofs: usize,
        read_bytes: usize,
    },
}

/// One page of a process's supplemental map.
pub struct PageEntry {
    upage: UPage,
    origin: PageOrigin,
    swap_slot: Option<SwapSlot>,
    loaded: bool,
}

impl PageEntry {
    pub fn upage(&self) -> UPage {
        self.upage
    }

    pub fn origin(&self) -> &PageOrigin {
        &self.origin
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.swap_slot
    }

    pub(crate) fn set_swap_slot(&mut self, slot: SwapSlot) {
        debug_assert!(!matches!(self.origin, PageOrigin::Mmap { .. }));
        self.swap_slot = Some(slot);
    }

    pub(crate) fn take_swap_slot(&mut self) -> Option<SwapSlot> {
        self.swap_slot.take()
    }

    /// The position mask for this entry.
    pub fn position(&self) -> Position {
        let origin = match self.origin {
            PageOrigin::Stack => Position::STACK,
            PageOrigin::File { .. } => Position::FILE,
            PageOrigin::Mmap { .. } => Position::MMAPFILE,
        };
        if self.swap_slot.is_some() {
            origin | Position::SWAP
        } else {
            origin
        }
    }
}

/// Per-process supplemental page map, keyed by user page.
#[derive(Default)]
pub struct PageMap {
    entries: BTreeMap<UPage, PageEntry>,
}

impl PageMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, entry: PageEntry) -> Result<(), KernelError> {
        let upage = entry.upage;
        if self.entries.contains_key(&upage) {
            return Err(KernelError::AlreadyMapped(upage.addr()));
        }
        self.entries.insert(upage, entry);
        Ok(())
    }

    /// Records a file-backed page: `read_bytes` from `file` at `ofs`,
    /// then `zero_bytes` of zeros.
    pub fn add_file(
        &mut self,
        file: Arc<File>,
        ofs: usize,
        upage: UPage,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), KernelError> {
        debug_assert!(read_bytes + zero_bytes <= PAGE_SIZE);
        self.add(PageEntry {
            upage,
            origin: PageOrigin::File {
                file,
                ofs,
                read_bytes,
                zero_bytes,
                writable,
            },
            swap_slot: None,
            loaded: false,
        })
    }

    /// Records a mapped-file page: `read_bytes` from `file` at `ofs`,
    /// zero to the page boundary.
    pub fn add_mapfile(
        &mut self,
        file: Arc<File>,
        ofs: usize,
        upage: UPage,
        read_bytes: usize,
    ) -> Result<(), KernelError> {
        debug_assert!(read_bytes <= PAGE_SIZE);
        self.add(PageEntry {
            upage,
            origin: PageOrigin::Mmap {
                file,
                ofs,
                read_bytes,
            },
            swap_slot: None,
            loaded: false,
        })
    }

    /// Records a stack page whose frame is already installed.
    pub fn add_stack(&mut self, upage: UPage) -> Result<(), KernelError> {
        self.add(PageEntry {
            upage,
            origin: PageOrigin::Stack,
            swap_slot: None,
            loaded: true,
        })
    }

    pub fn find(&self, upage: UPage) -> Option<&PageEntry> {
        self.entries.get(&upage)
    }

    pub(crate) fn find_mut(&mut self, upage: UPage) -> Option<&mut PageEntry> {
        self.entries.get_mut(&upage)
    }

    /// Removes and returns the entry at `upage`.
    pub fn delete(&mut self, upage: UPage) -> Option<PageEntry> {
        self.entries.remove(&upage)
    }

    /// Removes every entry, releasing swap slots into `swap`.
    pub fn free_pages(&mut self, swap: &super::SwapDevice) {
        for (_, entry) in core::mem::take(&mut self.entries) {
            if let Some(slot) = entry.swap_slot {
                swap.free(slot);
            }
        }
    }

    /// Removes and returns every entry.
    pub(crate) fn drain(&mut self) -> Vec<PageEntry> {
        core::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum LoadPlan {
    Swap(SwapSlot),
    File {
        file: Arc<File>,
        ofs: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    },
    Mmap {
        file: Arc<File>,
        ofs: usize,
        read_bytes: usize,
    },
}

impl Vm {
    /// Loads the page at `upage` from its recorded source and installs
    /// it in the thread's page directory.
    ///
    /// On any sub-step failure the frame goes back to the allocator
    /// before the error is reported.
    pub fn load_page(&self, t: &Arc<Thread>, upage: UPage) -> Result<(), KernelError> {
        // Snapshot the entry; the page-map lock cannot be held across
        // frame allocation, which may evict through other maps.
        let plan = {
            let pages = t.pages().lock();
            let entry = pages
                .find(upage)
                .ok_or(KernelError::PageNotPresent(upage.addr()))?;
            if entry.loaded {
                return Ok(());
            }
            match (&entry.origin, entry.swap_slot) {
                (PageOrigin::File { .. } | PageOrigin::Stack, Some(slot)) => LoadPlan::Swap(slot),
                (
                    PageOrigin::File {
                        file,
                        ofs,
                        read_bytes,
                        zero_bytes,
                        writable,
                    },
                    None,
                ) => LoadPlan::File {
                    file: Arc::clone(file),
                    ofs: *ofs,
                    read_bytes: *read_bytes,
                    zero_bytes: *zero_bytes,
                    writable: *writable,
                },
                (
                    PageOrigin::Mmap {
                        file,
                        ofs,
                        read_bytes,
                    },
                    None,
                ) => LoadPlan::Mmap {
                    file: Arc::clone(file),
                    ofs: *ofs,
                    read_bytes: *read_bytes,
                },
                _ => return Err(KernelError::InvalidPageState),
            }
        };

        let kpage = self.frame_get(t)?;
        let res = match plan {
            LoadPlan::Swap(slot) => {
                self.swap().load(self.pool(), kpage, slot);
                self.install(t, upage, kpage, true)
            }
            LoadPlan::File {
                file,
                ofs,
                read_bytes,
                zero_bytes,
                writable,
            } => {
                let read = self.pool().with_page_mut(kpage, |data| {
                    let read = file.read_at(&mut data[..read_bytes], ofs);
                    data[read_bytes..read_bytes + zero_bytes].fill(0);
                    read
                });
                if read != read_bytes {
                    Err(KernelError::InvalidPageState)
                } else {
                    self.install(t, upage, kpage, writable)
                }
            }
            LoadPlan::Mmap {
                file,
                ofs,
                read_bytes,
            } => {
                let read = self.pool().with_page_mut(kpage, |data| {
                    let read = file.read_at(&mut data[..read_bytes], ofs);
                    data[read_bytes..].fill(0);
                    read
                });
                if read != read_bytes {
                    Err(KernelError::InvalidPageState)
                } else {
                    self.install(t, upage, kpage, true)
                }
            }
        };

        match res {
            Ok(()) => {
                let mut pages = t.pages().lock();
                if let Some(entry) = pages.find_mut(upage) {
                    // Loading from swap demotes the page back to its
                    // origin state.
                    entry.take_swap_slot();
                    entry.set_loaded(true);
                }
                Ok(())
            }
            Err(e) => {
                self.frame_free(kpage);
                Err(e)
            }
        }
    }
}
