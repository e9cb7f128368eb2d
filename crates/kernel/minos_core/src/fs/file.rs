//! File handles.
//!
//! A [`File`] is one opener of an inode: it carries the position for
//! sequential I/O, the opener's readahead state and an optional
//! deny-write guard. Reopening yields an independent handle over the
//! same inode.

use alloc::sync::Arc;

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use sector_cache::Owner;

use super::{Inode, RaState};
use crate::error::KernelError;

pub struct File {
    inode: Arc<Inode>,
    owner: Owner,
    pos: Mutex<usize>,
    ra: Mutex<RaState>,
    /// Whether this handle holds a deny-write on the inode.
    denies_write: AtomicBool,
}

impl File {
    /// Opens a handle over `inode` on behalf of `owner`.
    #[must_use]
    pub fn open(inode: Arc<Inode>, owner: Owner) -> Arc<Self> {
        Arc::new(Self {
            inode,
            owner,
            pos: Mutex::new(0),
            ra: Mutex::new(RaState::new()),
            denies_write: AtomicBool::new(false),
        })
    }

    /// Opens an independent handle over the same inode, with its own
    /// position and readahead state.
    #[must_use]
    pub fn reopen(&self) -> Arc<Self> {
        Self::open(Inode::reopen(&self.inode), self.owner)
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// File length in bytes.
    pub fn len(&self) -> Result<usize, KernelError> {
        self.inode.length()
    }

    pub fn is_empty(&self) -> Result<bool, KernelError> {
        Ok(self.len()? == 0)
    }

    pub fn is_dir(&self) -> Result<bool, KernelError> {
        self.inode.is_dir()
    }

    /// Reads at the current position, advancing it by the bytes read.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.read_at(buf, *pos);
        *pos += n;
        n
    }

    /// Reads at an explicit offset; the position is untouched.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.inode.read_at(self.owner, &mut self.ra.lock(), buf, offset)
    }

    /// Writes at the current position, advancing it by the bytes
    /// written.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.write_at(buf, *pos);
        *pos += n;
        n
    }

    /// Writes at an explicit offset; the position is untouched.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        self.inode.write_at(self.owner, buf, offset)
    }

    /// Moves the position for sequential I/O.
    pub fn seek(&self, pos: usize) {
        *self.pos.lock() = pos;
    }

    /// Current position.
    pub fn tell(&self) -> usize {
        *self.pos.lock()
    }

    /// Denies writes to the underlying inode while this handle lives
    /// (or until [`File::allow_write`]). Idempotent per handle.
    pub fn deny_write(&self) {
        if !self.denies_write.swap(true, Ordering::AcqRel) {
            self.inode.deny_write();
        }
    }

    /// Releases this handle's deny-write, if held.
    pub fn allow_write(&self) {
        if self.denies_write.swap(false, Ordering::AcqRel) {
            self.inode.allow_write();
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.denies_write.load(Ordering::Acquire) {
            self.inode.allow_write();
        }
    }
}
