//! Thread context.
//!
//! Every operation that reads the current thread, allocates memory or
//! evicts a page takes an explicit [`Thread`] handle: the page
//! directory, the supplemental page map, the mapping list and the
//! descriptor table all hang off it. Frames and cache entries refer
//! back to their owner through the [`Tid`] tag or a [`Weak`] handle,
//! never an owning one.

use alloc::sync::Arc;

use spin::Mutex;

use sector_cache::Owner;

use crate::{
    error::KernelError,
    fs::{FdTable, File, FileSys},
    vm::{MapId, MmapTable, PageDirectory, PageMap, Vm},
};

/// Thread identifier. 0 is reserved for the kernel itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u64);

impl Tid {
    #[must_use]
    pub fn as_owner(&self) -> Owner {
        Owner(self.0)
    }
}

/// A kernel thread running a user process.
pub struct Thread {
    tid: Tid,
    pagedir: Arc<dyn PageDirectory>,
    pages: Mutex<PageMap>,
    mmaps: Mutex<MmapTable>,
    files: Mutex<FdTable>,
}

impl Thread {
    /// Creates a thread context over its hardware page directory.
    ///
    /// # Panics
    ///
    /// Panics if `tid` is the reserved kernel id.
    #[must_use]
    pub fn new(tid: Tid, pagedir: Arc<dyn PageDirectory>) -> Arc<Self> {
        assert!(tid.0 != 0, "tid 0 is reserved for the kernel");
        Arc::new(Self {
            tid,
            pagedir,
            pages: Mutex::new(PageMap::new()),
            mmaps: Mutex::new(MmapTable::new()),
            files: Mutex::new(FdTable::new()),
        })
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The thread's tag for cache-entry ownership.
    pub fn owner(&self) -> Owner {
        self.tid.as_owner()
    }

    pub fn pagedir(&self) -> &Arc<dyn PageDirectory> {
        &self.pagedir
    }

    pub fn pages(&self) -> &Mutex<PageMap> {
        &self.pages
    }

    pub fn mmaps(&self) -> &Mutex<MmapTable> {
        &self.mmaps
    }

    pub fn files(&self) -> &Mutex<FdTable> {
        &self.files
    }

    /// Opens the file stored at `sector` and installs it in the
    /// descriptor table, returning the user-visible descriptor.
    ///
    /// Descriptors 0 and 1 name the console, so file descriptors start
    /// at 2.
    pub fn open_file(
        &self,
        fs: &Arc<FileSys>,
        sector: minos_fs_types::SectorNo,
    ) -> Result<usize, KernelError> {
        let inode = crate::fs::Inode::open(fs, sector)?;
        let file = File::open(inode, self.owner());
        let idx = self.files.lock().install(file)?;
        Ok(idx + 2)
    }

    /// The open file behind a user-visible descriptor.
    pub fn file(&self, fd: usize) -> Result<Arc<File>, KernelError> {
        if fd < 2 {
            return Err(KernelError::BadFileDescriptor(fd));
        }
        self.files.lock().get(fd - 2)
    }

    /// Reads from a user-visible descriptor. Directories are refused.
    pub fn read_fd(&self, fd: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        if fd < 2 {
            return Err(KernelError::BadFileDescriptor(fd));
        }
        self.files.lock().read(fd - 2, buf)
    }

    /// Writes to a user-visible descriptor. Directories are refused.
    pub fn write_fd(&self, fd: usize, buf: &[u8]) -> Result<usize, KernelError> {
        if fd < 2 {
            return Err(KernelError::BadFileDescriptor(fd));
        }
        self.files.lock().write(fd - 2, buf)
    }

    /// Closes a user-visible descriptor.
    pub fn close_fd(&self, fd: usize) -> Result<(), KernelError> {
        if fd < 2 {
            return Err(KernelError::BadFileDescriptor(fd));
        }
        self.files.lock().close(fd - 2)
    }

}

impl Vm {
    /// Maps the file behind the thread's descriptor `fd` at `addr`.
    ///
    /// The console descriptors cannot be mapped.
    pub fn mmap_fd(&self, t: &Arc<Thread>, fd: usize, addr: usize) -> Result<MapId, KernelError> {
        if fd < 2 {
            return Err(KernelError::BadFileDescriptor(fd));
        }
        let file = t.files.lock().get(fd - 2)?;
        self.mmap(t, &file, addr)
    }
}

/// Process teardown: unmaps every mapping (writing dirty pages back),
/// releases supplemental pages, swap slots and frames, then the
/// thread's cache entries and descriptors.
pub fn exit(t: &Arc<Thread>, vm: &Vm, fs: &FileSys) {
    vm.free_process(t);
    fs.cache().free_owned_by(t.owner());
    t.files.lock().close_all();
}
