//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk structure
//! ([`DiskInode`]) occupies one sector and lists the file's data
//! sectors through 12 direct slots, a single-indirect index block and a
//! double-indirect index block; file length and type live in the same
//! sector and are read through the cache on demand.
//!
//! In-memory handles are interned: opening the same sector twice
//! returns the same [`Inode`] behind a cloned [`Arc`]. The last handle
//! to drop releases the in-memory state, plus every allocated sector
//! if the inode was marked removed.
//!
//! Creation and extension are all-or-nothing: any sector acquired by a
//! failing call is released before the error is reported, and a new
//! file length is committed only after the data sectors exist.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use dataview::PodMethods as _;
use spin::Mutex;

use minos_fs_types::{
    bytes_to_sectors, DiskInode, IndexBlock, InodeKind, SectorNo, DOUBLE_INDIRECT_SLOT,
    INODE_MAGIC, MAX_FILE_BYTES, MAX_FILE_SECTORS, NUM_DIRECT, NUM_INDIRECT, SECTOR_SIZE,
    SINGLE_INDIRECT_SLOT,
};
use sector_cache::Owner;

use super::{FileSys, RaState};
use crate::error::KernelError;

/// In-memory inode handle.
pub struct Inode {
    fs: Arc<FileSys>,
    sector: SectorNo,
    removed: AtomicBool,
    /// 0: writes ok, >0: writes denied.
    deny_write: AtomicU32,
    /// Serializes file extension; held until the new length commits.
    ext: Mutex<()>,
}

impl FileSys {
    /// Initializes an inode at `sector` with `length` bytes of zeroed
    /// data and writes it to the cache.
    ///
    /// The inode sector itself is supplied by the caller. Data sectors
    /// are allocated across the direct, single-indirect and
    /// double-indirect tiers in order; on any failure every sector
    /// allocated by this call is released.
    pub fn create_inode(
        &self,
        sector: SectorNo,
        length: usize,
        kind: InodeKind,
    ) -> Result<(), KernelError> {
        let total = bytes_to_sectors(length);
        if total > MAX_FILE_SECTORS {
            return Err(KernelError::FileTooLarge);
        }
        let length = i32::try_from(length).map_err(|_| KernelError::FileTooLarge)?;

        let mut img = DiskInode::new(length, kind);
        let mut allocated = Vec::new();
        let res = (|| {
            for i in 0..total {
                self.map_file_sector(&mut img, i, &mut allocated)?;
            }
            self.cache()
                .get(sector, Owner::KERNEL)?
                .write_bytes(0, img.as_bytes());
            Ok(())
        })();
        if let Err(e) = res {
            for s in allocated {
                self.free_map().release(s);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Maps file-sector `index` of `img` to a freshly allocated, zeroed
    /// data sector, allocating any missing index blocks on the way.
    ///
    /// Index-block entries are written through the cache; `img` is only
    /// updated in memory and committed by the caller.
    fn map_file_sector(
        &self,
        img: &mut DiskInode,
        index: usize,
        allocated: &mut Vec<SectorNo>,
    ) -> Result<(), KernelError> {
        if index < NUM_DIRECT {
            let s = self.alloc_zeroed_sector(allocated)?;
            img.set_slot(index, Some(s));
            return Ok(());
        }

        let index = index - NUM_DIRECT;
        if index < NUM_INDIRECT {
            let root = match img.slot(SINGLE_INDIRECT_SLOT) {
                Some(root) => root,
                None => {
                    let root = self.alloc_zeroed_sector(allocated)?;
                    img.set_slot(SINGLE_INDIRECT_SLOT, Some(root));
                    root
                }
            };
            let s = self.alloc_zeroed_sector(allocated)?;
            self.cache()
                .write_u32(root, Owner::KERNEL, IndexBlock::entry_offset(index), s.value())?;
            return Ok(());
        }

        let index = index - NUM_INDIRECT;
        assert!(index < NUM_INDIRECT * NUM_INDIRECT);
        let (l1, l2) = (index / NUM_INDIRECT, index % NUM_INDIRECT);
        let root = match img.slot(DOUBLE_INDIRECT_SLOT) {
            Some(root) => root,
            None => {
                let root = self.alloc_zeroed_sector(allocated)?;
                img.set_slot(DOUBLE_INDIRECT_SLOT, Some(root));
                root
            }
        };
        let mid = match self
            .cache()
            .read_u32(root, Owner::KERNEL, IndexBlock::entry_offset(l1))?
        {
            0 => {
                let mid = self.alloc_zeroed_sector(allocated)?;
                self.cache()
                    .write_u32(root, Owner::KERNEL, IndexBlock::entry_offset(l1), mid.value())?;
                mid
            }
            n => SectorNo::new(n),
        };
        let s = self.alloc_zeroed_sector(allocated)?;
        self.cache()
            .write_u32(mid, Owner::KERNEL, IndexBlock::entry_offset(l2), s.value())?;
        Ok(())
    }

    /// Walks the index structure of the inode at `inode_sector` and
    /// returns the device sector holding file-sector `index`, or `None`
    /// for a hole.
    pub(crate) fn locate(
        &self,
        inode_sector: SectorNo,
        index: usize,
    ) -> Result<Option<SectorNo>, KernelError> {
        let nonzero = |n: u32| (n != 0).then(|| SectorNo::new(n));
        let k = Owner::KERNEL;

        if index < NUM_DIRECT {
            let n = self
                .cache()
                .read_u32(inode_sector, k, DiskInode::slot_offset(index))?;
            return Ok(nonzero(n));
        }

        let index = index - NUM_DIRECT;
        if index < NUM_INDIRECT {
            let root = self
                .cache()
                .read_u32(inode_sector, k, DiskInode::slot_offset(SINGLE_INDIRECT_SLOT))?;
            let Some(root) = nonzero(root) else {
                return Ok(None);
            };
            let n = self
                .cache()
                .read_u32(root, k, IndexBlock::entry_offset(index))?;
            return Ok(nonzero(n));
        }

        let index = index - NUM_INDIRECT;
        if index >= NUM_INDIRECT * NUM_INDIRECT {
            return Ok(None);
        }
        let (l1, l2) = (index / NUM_INDIRECT, index % NUM_INDIRECT);
        let root = self
            .cache()
            .read_u32(inode_sector, k, DiskInode::slot_offset(DOUBLE_INDIRECT_SLOT))?;
        let Some(root) = nonzero(root) else {
            return Ok(None);
        };
        let mid = self
            .cache()
            .read_u32(root, k, IndexBlock::entry_offset(l1))?;
        let Some(mid) = nonzero(mid) else {
            return Ok(None);
        };
        let n = self.cache().read_u32(mid, k, IndexBlock::entry_offset(l2))?;
        Ok(nonzero(n))
    }
}

impl Inode {
    /// Opens the inode stored at `sector` of `fs`.
    ///
    /// Returns the existing handle if the sector is already open.
    ///
    /// # Panics
    ///
    /// Panics if the sector does not hold an inode (wrong magic); that
    /// is a fatal integrity error.
    pub fn open(fs: &Arc<FileSys>, sector: SectorNo) -> Result<Arc<Self>, KernelError> {
        let mut table = fs.inodes.lock();
        table.retain(|(_, weak)| weak.strong_count() > 0);
        if let Some(inode) = table
            .iter()
            .find(|(s, _)| *s == sector)
            .and_then(|(_, weak)| weak.upgrade())
        {
            return Ok(inode);
        }

        let magic = fs
            .cache()
            .read_u32(sector, Owner::KERNEL, DiskInode::MAGIC_OFFSET)?;
        assert_eq!(magic, INODE_MAGIC, "bad inode magic at sector {sector}");

        let inode = Arc::new(Inode {
            fs: Arc::clone(fs),
            sector,
            removed: AtomicBool::new(false),
            deny_write: AtomicU32::new(0),
            ext: Mutex::new(()),
        });
        table.push((sector, Arc::downgrade(&inode)));
        Ok(inode)
    }

    /// Clones the handle, bumping the open count.
    #[must_use]
    pub fn reopen(this: &Arc<Self>) -> Arc<Self> {
        Arc::clone(this)
    }

    /// Sector number of the inode; doubles as its inumber.
    #[must_use]
    pub fn inumber(&self) -> SectorNo {
        self.sector
    }

    /// Marks the inode to be deleted when the last handle drops.
    pub fn remove(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// File length in bytes, read from the inode sector.
    pub fn length(&self) -> Result<usize, KernelError> {
        let raw = self
            .fs
            .cache()
            .read_u32(self.sector, Owner::KERNEL, DiskInode::LENGTH_OFFSET)?;
        let len = raw as i32;
        Ok(usize::try_from(len.max(0)).unwrap())
    }

    /// The inode's type tag.
    pub fn kind(&self) -> Result<InodeKind, KernelError> {
        let raw = self
            .fs
            .cache()
            .read_u32(self.sector, Owner::KERNEL, DiskInode::KIND_OFFSET)?;
        Ok(InodeKind::from_repr(raw).expect("bad inode kind"))
    }

    /// Returns `true` if this inode is a directory.
    pub fn is_dir(&self) -> Result<bool, KernelError> {
        Ok(self.kind()? == InodeKind::Dir)
    }

    /// Disables writes. May be called at most once per opener.
    pub fn deny_write(&self) {
        self.deny_write.fetch_add(1, Ordering::AcqRel);
    }

    /// Re-enables writes; pairs with [`Inode::deny_write`].
    pub fn allow_write(&self) {
        let prev = self.deny_write.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "allow_write without deny_write");
    }

    pub(crate) fn fs(&self) -> &Arc<FileSys> {
        &self.fs
    }

    /// Device sector holding file-sector `index`, or `None` for a hole.
    pub fn data_sector(&self, index: usize) -> Result<Option<SectorNo>, KernelError> {
        self.fs.locate(self.sector, index)
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`.
    ///
    /// Returns the number of bytes actually read, which is short at end
    /// of file or on a transient cache failure. Feeds the access
    /// pattern into `ra` and may prefetch sectors ahead of the reader.
    pub fn read_at(&self, owner: Owner, ra: &mut RaState, buf: &mut [u8], offset: usize) -> usize {
        let Ok(length) = self.length() else {
            return 0;
        };
        if length == 0 || buf.is_empty() {
            return 0;
        }

        let mut index = offset / SECTOR_SIZE;
        let last_index = (offset + buf.len()).div_ceil(SECTOR_SIZE);
        let mut sector_ofs = offset % SECTOR_SIZE;
        // Carried into `prev_pos` at the end; starts at the previous
        // read position so an empty loop leaves the state unchanged.
        let mut prev_index = ra.prev_pos >> RaState::SECTOR_SHIFT;
        let mut prev_offset = ra.prev_pos & (SECTOR_SIZE as i64 - 1);

        let mut bytes_read = 0;
        let mut size = buf.len();
        while size > 0 {
            let Ok(Some(sector)) = self.data_sector(index) else {
                break;
            };

            if !self.fs.cache().contains(sector) {
                self.sync_readahead(owner, ra, index, last_index - index);
            }
            if self.fs.cache().readahead(sector) {
                self.async_readahead(owner, ra, sector, index, last_index - index);
            }

            let end_index = (length - 1) / SECTOR_SIZE;
            if index > end_index {
                break;
            }
            let mut sector_left = SECTOR_SIZE;
            if index == end_index {
                sector_left = ((length - 1) % SECTOR_SIZE) + 1;
                if sector_left <= sector_ofs {
                    break;
                }
            }
            sector_left -= sector_ofs;

            let chunk = usize::min(size, sector_left);
            if chunk == 0 {
                break;
            }
            prev_index = index as i64;

            if self
                .fs
                .cache()
                .read(sector, owner, sector_ofs, &mut buf[bytes_read..bytes_read + chunk])
                .is_err()
            {
                break;
            }

            sector_ofs += chunk;
            index += sector_ofs / SECTOR_SIZE;
            sector_ofs %= SECTOR_SIZE;
            prev_offset = sector_ofs as i64;
            bytes_read += chunk;
            size -= chunk;
        }

        ra.prev_pos = (prev_index * SECTOR_SIZE as i64) | prev_offset;
        bytes_read
    }

    /// Writes `buf` starting at byte `offset`, extending the file if it
    /// ends beyond the current length.
    ///
    /// Returns the number of bytes actually written: 0 while writes are
    /// denied or when extension fails, short on a transient cache
    /// failure.
    pub fn write_at(&self, owner: Owner, buf: &[u8], offset: usize) -> usize {
        if self.deny_write.load(Ordering::Acquire) > 0 {
            return 0;
        }
        if buf.is_empty() {
            return 0;
        }
        let Some(end) = offset.checked_add(buf.len()) else {
            return 0;
        };
        let Ok(mut length) = self.length() else {
            return 0;
        };

        // Extension happens under the inode lock; the new length is
        // committed only after the data is in place.
        let mut ext_guard = None;
        if end > length {
            let guard = self.ext.lock();
            let Ok(cur) = self.length() else {
                return 0;
            };
            length = cur;
            if end > length {
                if let Err(e) = self.extend(end) {
                    log::debug!("inode {}: extension to {} failed: {}", self.sector, end, e);
                    return 0;
                }
                ext_guard = Some(guard);
                length = end;
            }
        }

        let mut written = 0;
        let mut pos = offset;
        while written < buf.len() {
            let index = pos / SECTOR_SIZE;
            let sector_ofs = pos % SECTOR_SIZE;
            let inode_left = length - pos;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = usize::min(buf.len() - written, usize::min(inode_left, sector_left));
            if chunk == 0 {
                break;
            }
            let Ok(Some(sector)) = self.data_sector(index) else {
                break;
            };
            if self
                .fs
                .cache()
                .write(sector, owner, sector_ofs, &buf[written..written + chunk])
                .is_err()
            {
                break;
            }
            pos += chunk;
            written += chunk;
        }

        if let Some(guard) = ext_guard {
            let committed = self.fs.cache().write_u32(
                self.sector,
                Owner::KERNEL,
                DiskInode::LENGTH_OFFSET,
                u32::try_from(length).unwrap(),
            );
            if committed.is_err() {
                return 0;
            }
            drop(guard);
        }
        written
    }

    /// Allocates the data (and index) sectors needed to hold `new_len`
    /// bytes. Newly allocated sectors are zero-filled; the length field
    /// is left for the caller to commit.
    ///
    /// On failure, every sector allocated by this call is released and
    /// the inode image is unchanged on disk.
    fn extend(&self, new_len: usize) -> Result<(), KernelError> {
        if new_len > MAX_FILE_BYTES {
            return Err(KernelError::FileTooLarge);
        }
        let cur_sectors = bytes_to_sectors(self.length()?);
        let new_sectors = bytes_to_sectors(new_len);
        if new_sectors <= cur_sectors {
            return Ok(());
        }

        let mut img = DiskInode::zeroed();
        self.fs
            .cache()
            .get(self.sector, Owner::KERNEL)?
            .with_data(|data| img.as_bytes_mut().copy_from_slice(data));
        assert_eq!(img.magic, INODE_MAGIC, "bad inode magic at sector {}", self.sector);

        let mut allocated = Vec::new();
        let res = (|| {
            for i in cur_sectors..new_sectors {
                self.fs.map_file_sector(&mut img, i, &mut allocated)?;
            }
            // Slots changed; the length word in `img` still holds the
            // old value and is rewritten unchanged.
            self.fs
                .cache()
                .get(self.sector, Owner::KERNEL)?
                .write_bytes(0, img.as_bytes());
            Ok(())
        })();
        if let Err(e) = res {
            for s in allocated {
                self.fs.free_map().release(s);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Releases every sector of a removed inode: data sectors up to the
    /// file length, the index blocks reaching them, and the inode
    /// sector itself. Best effort; runs at last close.
    fn release_contents(&self) {
        let Ok(length) = self.length() else {
            return;
        };
        let total = bytes_to_sectors(length);
        let k = Owner::KERNEL;

        let mut img = DiskInode::zeroed();
        let Ok(img_ref) = self.fs.cache().get(self.sector, k) else {
            return;
        };
        img_ref.with_data(|data| img.as_bytes_mut().copy_from_slice(data));
        drop(img_ref);

        for i in 0..usize::min(total, NUM_DIRECT) {
            if let Some(s) = img.slot(i) {
                self.fs.free_map().release(s);
            }
        }

        if total > NUM_DIRECT {
            if let Some(root) = img.slot(SINGLE_INDIRECT_SLOT) {
                let mut ib = IndexBlock::zeroed();
                if let Ok(r) = self.fs.cache().get(root, k) {
                    r.with_data(|data| ib.as_bytes_mut().copy_from_slice(data));
                    for j in 0..usize::min(total - NUM_DIRECT, NUM_INDIRECT) {
                        if let Some(s) = ib.get(j) {
                            self.fs.free_map().release(s);
                        }
                    }
                }
                self.fs.free_map().release(root);
            }
        }

        let double_base = NUM_DIRECT + NUM_INDIRECT;
        if total > double_base {
            if let Some(root) = img.slot(DOUBLE_INDIRECT_SLOT) {
                let mut l1 = IndexBlock::zeroed();
                if let Ok(r) = self.fs.cache().get(root, k) {
                    r.with_data(|data| l1.as_bytes_mut().copy_from_slice(data));
                    let remaining = total - double_base;
                    for i in 0..remaining.div_ceil(NUM_INDIRECT) {
                        let Some(mid) = l1.get(i) else {
                            continue;
                        };
                        let mut l2 = IndexBlock::zeroed();
                        if let Ok(r) = self.fs.cache().get(mid, k) {
                            r.with_data(|data| l2.as_bytes_mut().copy_from_slice(data));
                            let in_this = usize::min(remaining - i * NUM_INDIRECT, NUM_INDIRECT);
                            for j in 0..in_this {
                                if let Some(s) = l2.get(j) {
                                    self.fs.free_map().release(s);
                                }
                            }
                        }
                        self.fs.free_map().release(mid);
                    }
                }
                self.fs.free_map().release(root);
            }
        }

        self.fs.free_map().release(self.sector);
        self.fs.cache().free(self.sector);
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let mut table = self.fs.inodes.lock();
        table.retain(|(s, weak)| !(*s == self.sector && weak.strong_count() == 0));
        drop(table);

        if self.removed.load(Ordering::Acquire) {
            log::debug!("releasing removed inode at sector {}", self.sector);
            self.release_contents();
        }
    }
}
