//! Virtual-memory layer.
//!
//! [`Vm`] owns the machine-wide memory state: the bounded pool of
//! physical page frames, the frame table with its two-list eviction
//! policy, and the swap-slot allocator. Per-process state (the
//! supplemental page map, the mapping table and the page directory)
//! lives on the [`Thread`](crate::proc::Thread) and is reached through
//! the thread handle that every operation takes.

pub mod frame;
pub mod mmap;
pub mod page;
pub mod pagedir;
pub mod palloc;
pub mod swap;

pub use frame::FrameInfo;
pub use mmap::{MapId, Mapping, MmapTable};
pub use page::{PageEntry, PageMap, PageOrigin, Position};
pub use pagedir::{PageDirectory, SoftPageDir};
pub use palloc::{KPage, PagePool};
pub use swap::{SwapDevice, SwapSlot};

use alloc::sync::Arc;
use core::fmt;

use sector_cache::BlockDevice;

use crate::{error::KernelError, param::PAGE_SIZE, proc::Thread};

/// A page-aligned user virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UPage(usize);

impl fmt::Display for UPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl UPage {
    /// Creates a user page from an aligned, non-null address.
    #[must_use]
    pub fn new(addr: usize) -> Option<Self> {
        (addr != 0 && addr % PAGE_SIZE == 0).then_some(Self(addr))
    }

    /// The page containing `addr`.
    #[must_use]
    pub fn containing(addr: usize) -> Self {
        Self(addr & !(PAGE_SIZE - 1))
    }

    #[must_use]
    pub const fn addr(&self) -> usize {
        self.0
    }

    /// The page `n` pages above this one.
    #[must_use]
    pub fn add_pages(&self, n: usize) -> Self {
        Self(self.0 + n * PAGE_SIZE)
    }
}

/// Machine-wide virtual-memory state.
pub struct Vm {
    pool: PagePool,
    frames: frame::FrameTable,
    swap: SwapDevice,
}

impl Vm {
    /// Creates the VM layer with `pool_pages` frames of user memory
    /// and swap on `swap_device`.
    #[must_use]
    pub fn new(pool_pages: usize, swap_device: Arc<dyn BlockDevice>) -> Self {
        Self {
            pool: PagePool::new(pool_pages),
            frames: frame::FrameTable::new(),
            swap: SwapDevice::new(swap_device),
        }
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub fn swap(&self) -> &SwapDevice {
        &self.swap
    }

    fn frames(&self) -> &frame::FrameTable {
        &self.frames
    }

    /// Resolves a page fault at `addr`: looks the page up in the
    /// faulting thread's supplemental map and loads it.
    ///
    /// An address with no supplemental entry is a genuine fault; the
    /// caller kills the process.
    pub fn handle_fault(&self, t: &Arc<Thread>, addr: usize) -> Result<(), KernelError> {
        let upage = UPage::containing(addr);
        if t.pages().lock().find(upage).is_none() {
            return Err(KernelError::PageNotPresent(addr));
        }
        self.load_page(t, upage)
    }

    /// Grows the stack by one page at `upage`: allocates a zeroed
    /// frame, installs it writable and records a stack entry.
    pub fn grow_stack(&self, t: &Arc<Thread>, upage: UPage) -> Result<(), KernelError> {
        if t.pages().lock().find(upage).is_some() {
            return Err(KernelError::AlreadyMapped(upage.addr()));
        }
        let kpage = self.frame_get(t)?;
        self.pool.with_page_mut(kpage, |data| data.fill(0));
        if let Err(e) = self.install(t, upage, kpage, true) {
            self.frame_free(kpage);
            return Err(e);
        }
        if let Err(e) = t.pages().lock().add_stack(upage) {
            t.pagedir().clear(upage);
            self.frame_free(kpage);
            return Err(e);
        }
        Ok(())
    }

    /// Releases everything a dying process holds from this layer:
    /// mappings (with dirty write-back), supplemental entries and their
    /// swap slots, and page frames.
    pub fn free_process(&self, t: &Arc<Thread>) {
        self.munmap_all(t);

        let entries = t.pages().lock().drain();
        for entry in entries {
            if entry.is_loaded() {
                if let Some(kpage) = t.pagedir().lookup(entry.upage()) {
                    t.pagedir().clear(entry.upage());
                    self.frame_free(kpage);
                }
            }
            if let Some(slot) = entry.swap_slot() {
                self.swap.free(slot);
            }
        }

        self.free_owned_frames(t);
    }
}
