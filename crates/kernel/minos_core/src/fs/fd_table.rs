//! Per-process file-descriptor table.
//!
//! Descriptors index a growable table of open file handles. The table
//! starts small and doubles on demand up to a hard cap; `next_fd`
//! remembers where the last search ended so allocation stays cheap.
//! Reads and writes through a descriptor both refuse directories.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::File;
use crate::{
    error::KernelError,
    param::{FD_TABLE_INIT, FD_TABLE_MAX},
};

pub struct FdTable {
    files: Vec<Option<Arc<File>>>,
    next_fd: usize,
}

impl FdTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: vec![None; FD_TABLE_INIT],
            next_fd: 0,
        }
    }

    /// Installs `file` in the lowest free slot at or after the last
    /// allocation, growing the table if every slot is taken.
    pub fn install(&mut self, file: Arc<File>) -> Result<usize, KernelError> {
        let free = (self.next_fd..self.files.len())
            .chain(0..self.next_fd)
            .find(|&fd| self.files[fd].is_none());
        let fd = match free {
            Some(fd) => fd,
            None => {
                if self.files.len() >= FD_TABLE_MAX {
                    return Err(KernelError::TooManyOpenFiles);
                }
                let fd = self.files.len();
                let grown = usize::min(self.files.len() * 2, FD_TABLE_MAX);
                self.files.resize(grown, None);
                fd
            }
        };
        self.files[fd] = Some(file);
        self.next_fd = fd + 1;
        Ok(fd)
    }

    /// Looks a descriptor up.
    pub fn get(&self, fd: usize) -> Result<Arc<File>, KernelError> {
        self.files
            .get(fd)
            .and_then(Clone::clone)
            .ok_or(KernelError::BadFileDescriptor(fd))
    }

    /// Closes a descriptor.
    pub fn close(&mut self, fd: usize) -> Result<(), KernelError> {
        let slot = self
            .files
            .get_mut(fd)
            .ok_or(KernelError::BadFileDescriptor(fd))?;
        slot.take().ok_or(KernelError::BadFileDescriptor(fd))?;
        if fd < self.next_fd {
            self.next_fd = fd;
        }
        Ok(())
    }

    /// Closes every descriptor. Part of process teardown.
    pub fn close_all(&mut self) {
        for slot in &mut self.files {
            slot.take();
        }
        self.next_fd = 0;
    }

    /// Reads from a descriptor at its current position.
    ///
    /// Directories cannot be read through a descriptor.
    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let file = self.get(fd)?;
        if file.is_dir()? {
            return Err(KernelError::IsADirectory);
        }
        Ok(file.read(buf))
    }

    /// Writes to a descriptor at its current position.
    ///
    /// Directories cannot be written through a descriptor.
    pub fn write(&self, fd: usize, buf: &[u8]) -> Result<usize, KernelError> {
        let file = self.get(fd)?;
        if file.is_dir()? {
            return Err(KernelError::IsADirectory);
        }
        Ok(file.write(buf))
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.files.iter().filter(|f| f.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
