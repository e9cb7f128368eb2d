//! Frame table and eviction.
//!
//! Every user frame is tracked by a descriptor keyed on its [`KPage`]
//! and linked on exactly one of two queues: *active* (recently used)
//! or *inactive* (eviction candidates). Eviction runs a second-chance
//! sweep: inactive frames whose accessed bit is set get promoted back
//! to active; the first frame whose contents can be saved is the
//! victim. The sweep finishes by refilling the inactive list from the
//! cold end of the active list.
//!
//! Saving a victim writes anonymous and writable file pages to swap
//! and dirty mapped-file pages back to their file; read-only file
//! pages need no backing store. The frame lock is held across the
//! whole sweep; the swap and page-map locks nest briefly inside it,
//! and nothing reached from here takes the frame lock again.
//!
//! A frame points back at its owning thread through a [`Weak`]
//! reference plus a thread-id tag, so thread teardown is proportional
//! to the frames the thread owns.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use super::{KPage, PageOrigin, UPage, Vm};
use crate::{
    error::KernelError,
    param::MIN_INACTIVE_FRAMES,
    proc::{Thread, Tid},
};

struct Frame {
    upage: Option<UPage>,
    owner: Weak<Thread>,
    owner_tid: Tid,
    size: usize,
    active: bool,
}

/// Snapshot of one frame descriptor. Diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub kpage: KPage,
    pub upage: Option<UPage>,
    pub owner: Tid,
    pub size: usize,
    pub active: bool,
}

#[derive(Default)]
pub(super) struct FrameTable {
    inner: Mutex<FrameInner>,
}

#[derive(Default)]
struct FrameInner {
    frames: BTreeMap<KPage, Frame>,
    active: VecDeque<KPage>,
    inactive: VecDeque<KPage>,
    nr_active: usize,
    nr_inactive: usize,
}

impl FrameTable {
    pub(super) fn new() -> Self {
        Self::default()
    }
}

impl FrameInner {
    /// Appends a frame to the active list.
    fn activate(&mut self, kpage: KPage) {
        self.frames.get_mut(&kpage).unwrap().active = true;
        self.active.push_back(kpage);
        self.nr_active += 1;
    }
}

enum SaveAction {
    ToSwap,
    WriteBack {
        file: Arc<crate::fs::File>,
        ofs: usize,
        read_bytes: usize,
    },
    Nothing,
}

impl Vm {
    /// Allocates one user frame for `t`, evicting if the pool is
    /// exhausted.
    pub fn frame_get(&self, t: &Arc<Thread>) -> Result<KPage, KernelError> {
        self.frame_get_multiple(t, 1)
    }

    /// Allocates `n` consecutive user frames for `t`.
    ///
    /// Only single-frame requests fall back to eviction.
    pub fn frame_get_multiple(&self, t: &Arc<Thread>, n: usize) -> Result<KPage, KernelError> {
        let from_pool = if n == 1 {
            self.pool().alloc()
        } else {
            self.pool().alloc_multiple(n)
        };
        if let Some(kpage) = from_pool {
            let mut inner = self.frames().inner.lock();
            inner.frames.insert(
                kpage,
                Frame {
                    upage: None,
                    owner: Arc::downgrade(t),
                    owner_tid: t.tid(),
                    size: n,
                    active: true,
                },
            );
            inner.active.push_back(kpage);
            inner.nr_active += 1;
            return Ok(kpage);
        }
        if n != 1 {
            return Err(KernelError::NoFreePage);
        }

        // Reuse a victim whose backing store has been saved.
        let kpage = self.evict()?;
        let mut inner = self.frames().inner.lock();
        let frame = inner.frames.get_mut(&kpage).unwrap();
        frame.upage = None;
        frame.owner = Arc::downgrade(t);
        frame.owner_tid = t.tid();
        frame.size = 1;
        inner.activate(kpage);
        Ok(kpage)
    }

    /// Returns a frame to the pool and drops its descriptor.
    pub fn frame_free(&self, kpage: KPage) {
        let size = {
            let mut inner = self.frames().inner.lock();
            let Some(frame) = inner.frames.remove(&kpage) else {
                return;
            };
            // A frame mid-eviction sits on neither list; tolerate it.
            if frame.active {
                if let Some(i) = inner.active.iter().position(|&k| k == kpage) {
                    inner.active.remove(i);
                    inner.nr_active -= 1;
                }
            } else if let Some(i) = inner.inactive.iter().position(|&k| k == kpage) {
                inner.inactive.remove(i);
                inner.nr_inactive -= 1;
            }
            frame.size
        };
        self.pool().free_multiple(kpage, size);
    }

    /// Looks a frame descriptor up. Diagnostic.
    pub fn frame_find(&self, kpage: KPage) -> Option<FrameInfo> {
        let inner = self.frames().inner.lock();
        inner.frames.get(&kpage).map(|f| FrameInfo {
            kpage,
            upage: f.upage,
            owner: f.owner_tid,
            size: f.size,
            active: f.active,
        })
    }

    /// Maps `upage` to `kpage` in the thread's page directory and
    /// records the user page on the frame.
    pub fn install(
        &self,
        t: &Arc<Thread>,
        upage: UPage,
        kpage: KPage,
        writable: bool,
    ) -> Result<(), KernelError> {
        if !t.pagedir().install(upage, kpage, writable) {
            return Err(KernelError::AlreadyMapped(upage.addr()));
        }
        let mut inner = self.frames().inner.lock();
        if let Some(frame) = inner.frames.get_mut(&kpage) {
            frame.upage = Some(upage);
        }
        Ok(())
    }

    /// Picks a frame, saves its contents, and returns it detached from
    /// both queues (still in the table) for reuse.
    pub fn evict(&self) -> Result<KPage, KernelError> {
        let mut inner = self.frames().inner.lock();
        let mut victim = None;

        // Inactive sweep: second chance, then save.
        while let Some(kpage) = inner.inactive.pop_front() {
            inner.nr_inactive -= 1;
            let frame = inner.frames.get(&kpage).unwrap();
            let (upage, owner) = (frame.upage, frame.owner.clone());
            if is_accessed(&owner, upage) {
                clear_accessed(&owner, upage);
                inner.activate(kpage);
            } else if self.save_frame(kpage, upage, &owner) {
                victim = Some(kpage);
                break;
            } else {
                // Unsaveable right now (swap full, page in flight);
                // park it on the active list so it stays tracked.
                inner.activate(kpage);
            }
        }

        // Active sweep.
        if victim.is_none() {
            let mut i = 0;
            while i < inner.active.len() {
                let kpage = inner.active[i];
                let frame = inner.frames.get(&kpage).unwrap();
                let (upage, owner) = (frame.upage, frame.owner.clone());
                if is_accessed(&owner, upage) {
                    clear_accessed(&owner, upage);
                    i += 1;
                } else if self.save_frame(kpage, upage, &owner) {
                    inner.active.remove(i);
                    inner.nr_active -= 1;
                    inner.frames.get_mut(&kpage).unwrap().active = false;
                    victim = Some(kpage);
                    break;
                } else {
                    i += 1;
                }
            }
        }

        // Forced: take the head of the active list.
        if victim.is_none() {
            if let Some(kpage) = inner.active.pop_front() {
                inner.nr_active -= 1;
                let frame = inner.frames.get(&kpage).unwrap();
                let (upage, owner) = (frame.upage, frame.owner.clone());
                if self.save_frame(kpage, upage, &owner) {
                    inner.frames.get_mut(&kpage).unwrap().active = false;
                    victim = Some(kpage);
                } else {
                    inner.activate(kpage);
                }
            }
        }

        self.shrink_active_list(&mut inner);

        match victim {
            Some(kpage) => {
                log::debug!("evicted frame {kpage}");
                Ok(kpage)
            }
            None => {
                log::warn!("no evictable frame");
                Err(KernelError::NoFreePage)
            }
        }
    }

    /// Keeps the inactive list topped up with eviction candidates.
    fn shrink_active_list(&self, inner: &mut FrameInner) {
        while inner.nr_inactive < MIN_INACTIVE_FRAMES {
            let Some(kpage) = inner.active.pop_front() else {
                break;
            };
            inner.nr_active -= 1;
            let frame = inner.frames.get_mut(&kpage).unwrap();
            frame.active = false;
            let (upage, owner) = (frame.upage, frame.owner.clone());
            clear_accessed(&owner, upage);
            inner.inactive.push_back(kpage);
            inner.nr_inactive += 1;
        }
    }

    /// Saves a frame's contents through the owner's supplemental map:
    /// swap for anonymous and writable file pages, file write-back for
    /// dirty mapped pages, nothing for clean read-only file pages.
    /// Clears the hardware mapping on success.
    fn save_frame(&self, kpage: KPage, upage: Option<UPage>, owner: &Weak<Thread>) -> bool {
        let Some(t) = owner.upgrade() else {
            // Owner is gone; its teardown already saved what mattered.
            return true;
        };
        let Some(upage) = upage else {
            // Never installed: the frame is mid-load somewhere.
            return false;
        };

        let mut pages = t.pages().lock();
        let Some(entry) = pages.find_mut(upage) else {
            return false;
        };
        if !entry.is_loaded() {
            return false;
        }

        let action = match entry.origin() {
            PageOrigin::File { writable: true, .. } | PageOrigin::Stack => SaveAction::ToSwap,
            PageOrigin::Mmap {
                file,
                ofs,
                read_bytes,
            } if t.pagedir().is_dirty(upage) => SaveAction::WriteBack {
                file: Arc::clone(file),
                ofs: *ofs,
                read_bytes: *read_bytes,
            },
            _ => SaveAction::Nothing,
        };

        match action {
            SaveAction::ToSwap => {
                let Ok(slot) = self.swap().store(self.pool(), kpage) else {
                    return false;
                };
                entry.set_swap_slot(slot);
            }
            SaveAction::WriteBack {
                file,
                ofs,
                read_bytes,
            } => {
                self.pool()
                    .with_page(kpage, |data| file.write_at(&data[..read_bytes], ofs));
            }
            SaveAction::Nothing => {}
        }

        t.pagedir().clear(upage);
        entry.set_loaded(false);
        true
    }

    /// Frees every frame owned by `t`. Part of thread teardown.
    pub fn free_owned_frames(&self, t: &Arc<Thread>) {
        let owned: Vec<KPage> = {
            let inner = self.frames().inner.lock();
            inner
                .frames
                .iter()
                .filter(|(_, f)| f.owner_tid == t.tid())
                .map(|(&k, _)| k)
                .collect()
        };
        for kpage in owned {
            self.frame_free(kpage);
        }
    }

    /// `(nr_active, nr_inactive)`. Diagnostic.
    pub fn frame_counts(&self) -> (usize, usize) {
        let inner = self.frames().inner.lock();
        (inner.nr_active, inner.nr_inactive)
    }

    /// Number of tracked frames. Diagnostic.
    pub fn frame_len(&self) -> usize {
        self.frames().inner.lock().frames.len()
    }

    /// Asserts the frame-table invariants: counters match list
    /// lengths, every frame is on exactly one list, and the active
    /// flag matches list membership.
    pub fn check_frame_consistency(&self) {
        let inner = self.frames().inner.lock();
        assert_eq!(inner.nr_active, inner.active.len());
        assert_eq!(inner.nr_inactive, inner.inactive.len());
        assert_eq!(inner.frames.len(), inner.nr_active + inner.nr_inactive);
        for &k in &inner.active {
            assert!(inner.frames[&k].active);
        }
        for &k in &inner.inactive {
            assert!(!inner.frames[&k].active);
        }
    }
}

fn is_accessed(owner: &Weak<Thread>, upage: Option<UPage>) -> bool {
    match (owner.upgrade(), upage) {
        (Some(t), Some(upage)) => t.pagedir().is_accessed(upage),
        _ => false,
    }
}

fn clear_accessed(owner: &Weak<Thread>, upage: Option<UPage>) {
    if let (Some(t), Some(upage)) = (owner.upgrade(), upage) {
        t.pagedir().set_accessed(upage, false);
    }
}
