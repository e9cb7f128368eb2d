//! Physical page-frame pool.
//!
//! A bounded arena of 4096-byte frames handed out by index. Exhaustion
//! is the signal for the frame table to evict. Frames are zeroed on
//! allocation.

use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use spin::Mutex;

use crate::param::PAGE_SIZE;

/// Handle to one physical page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KPage(u32);

impl fmt::Display for KPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kpage#{}", self.0)
    }
}

impl KPage {
    fn index(self) -> usize {
        usize::try_from(self.0).unwrap()
    }

    /// The frame `n` frames after this one (multi-page allocations).
    #[must_use]
    pub fn add(self, n: usize) -> Self {
        Self(self.0 + u32::try_from(n).unwrap())
    }
}

pub struct PagePool {
    pages: Vec<Mutex<Box<[u8; PAGE_SIZE]>>>,
    used: Mutex<Vec<bool>>,
}

impl PagePool {
    /// Creates a pool of `n` frames.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn new(n: usize) -> Self {
        assert!(n > 0);
        Self {
            pages: (0..n).map(|_| Mutex::new(Box::new([0; PAGE_SIZE]))).collect(),
            used: Mutex::new(alloc::vec![false; n]),
        }
    }

    /// Allocates one zeroed frame, or `None` if the pool is exhausted.
    pub fn alloc(&self) -> Option<KPage> {
        self.alloc_multiple(1)
    }

    /// Allocates `n` consecutive zeroed frames.
    pub fn alloc_multiple(&self, n: usize) -> Option<KPage> {
        assert!(n > 0);
        let first = {
            let mut used = self.used.lock();
            let first = (0..used.len().checked_sub(n - 1)?)
                .find(|&i| used[i..i + n].iter().all(|u| !u))?;
            used[first..first + n].iter_mut().for_each(|u| *u = true);
            first
        };
        let kpage = KPage(u32::try_from(first).unwrap());
        for i in 0..n {
            self.pages[first + i].lock().fill(0);
        }
        Some(kpage)
    }

    /// Returns `n` consecutive frames starting at `kpage` to the pool.
    ///
    /// # Panics
    ///
    /// Panics if any of the frames is not allocated.
    pub fn free_multiple(&self, kpage: KPage, n: usize) {
        let mut used = self.used.lock();
        for i in 0..n {
            assert!(used[kpage.index() + i], "freeing free frame");
            used[kpage.index() + i] = false;
        }
    }

    /// Returns one frame to the pool.
    pub fn free(&self, kpage: KPage) {
        self.free_multiple(kpage, 1);
    }

    /// Runs `f` over the frame's bytes.
    pub fn with_page<R>(&self, kpage: KPage, f: impl FnOnce(&[u8; PAGE_SIZE]) -> R) -> R {
        f(&self.pages[kpage.index()].lock())
    }

    /// Runs `f` over the frame's bytes mutably.
    pub fn with_page_mut<R>(&self, kpage: KPage, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        f(&mut self.pages[kpage.index()].lock())
    }

    /// Total number of frames.
    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    /// Number of unallocated frames.
    pub fn available(&self) -> usize {
        self.used.lock().iter().filter(|&&u| !u).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_reuse() {
        let pool = PagePool::new(2);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert!(pool.alloc().is_none());
        pool.free(a);
        assert_eq!(pool.alloc(), Some(a));
    }

    #[test]
    fn frames_are_zeroed_on_alloc() {
        let pool = PagePool::new(1);
        let a = pool.alloc().unwrap();
        pool.with_page_mut(a, |data| data.fill(0xFF));
        pool.free(a);
        let b = pool.alloc().unwrap();
        pool.with_page(b, |data| assert!(data.iter().all(|&x| x == 0)));
    }

    #[test]
    fn multi_page_runs_are_consecutive() {
        let pool = PagePool::new(4);
        let a = pool.alloc().unwrap();
        let run = pool.alloc_multiple(2).unwrap();
        assert_ne!(run, a);
        assert_ne!(run.add(1), a);
        pool.free(a);
        // A 3-run no longer fits after the 2-run in a 4-frame pool.
        assert!(pool.alloc_multiple(3).is_none());
        pool.free_multiple(run, 2);
        assert!(pool.alloc_multiple(3).is_some());
    }

    #[test]
    #[should_panic = "freeing free frame"]
    fn double_free_panics() {
        let pool = PagePool::new(1);
        let a = pool.alloc().unwrap();
        pool.free(a);
        pool.free(a);
    }
}
