//! Data types for the minos on-disk file layout.
//!
//! The disk is an array of 512-byte sectors:
//!
//! | sector no. | content        | type                      |
//! |------------|----------------|---------------------------|
//! | 0          | free-map file  | [`DiskInode`] + data      |
//! | 1          | root directory | [`DiskInode`] + data      |
//! | others     | inodes & data  | [`DiskInode`], [`IndexBlock`], raw bytes |
//!
//! Every file is described by a [`DiskInode`] occupying exactly one
//! sector. File data is reached through 12 direct sector slots, one
//! single-indirect [`IndexBlock`] and one double-indirect [`IndexBlock`]
//! whose entries point at further index blocks. A slot value of 0 means
//! "no sector here".

#![cfg_attr(not(test), no_std)]

use core::{fmt, mem};

use dataview::Pod;

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors directly referenced by an inode.
pub const NUM_DIRECT: usize = 12;

/// Number of sector slots in one index block.
pub const NUM_INDIRECT: usize = SECTOR_SIZE / mem::size_of::<u32>();

/// Number of sector slots stored in the inode itself
/// (direct slots plus the two indirect roots).
pub const NUM_INODE_SLOTS: usize = NUM_DIRECT + 2;

/// Inode slot index of the single-indirect root.
pub const SINGLE_INDIRECT_SLOT: usize = NUM_DIRECT;

/// Inode slot index of the double-indirect root.
pub const DOUBLE_INDIRECT_SLOT: usize = NUM_DIRECT + 1;

/// Maximum number of data sectors a file can reference.
pub const MAX_FILE_SECTORS: usize = NUM_DIRECT + NUM_INDIRECT + NUM_INDIRECT * NUM_INDIRECT;

/// Maximum file size in bytes (~8 MiB with 512-byte sectors).
pub const MAX_FILE_BYTES: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

/// Identifies an on-disk inode.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Represents a block-device sector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct SectorNo(u32);

impl fmt::Display for SectorNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SectorNo {
    /// Sector of the free-map file's inode.
    pub const FREE_MAP: Self = Self::new(0);

    /// Sector of the root directory's inode.
    pub const ROOT_DIR: Self = Self::new(1);

    /// Creates a new `SectorNo` with the given value.
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Returns the value of the sector number.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Converts the sector number to an index.
    ///
    /// # Panics
    ///
    /// Panics if the value does not fit in `usize`.
    #[must_use]
    pub fn as_index(&self) -> usize {
        usize::try_from(self.0).unwrap()
    }
}

/// Type tag of an on-disk inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InodeKind {
    Dir = 0,
    File = 1,
}

impl InodeKind {
    /// Decodes the on-disk tag value.
    #[must_use]
    pub fn from_repr(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Dir),
            1 => Some(Self::File),
            _ => None,
        }
    }
}

const NUM_RESERVED: usize = (SECTOR_SIZE - (NUM_INODE_SLOTS + 3) * mem::size_of::<u32>())
    / mem::size_of::<u32>();

/// On-disk inode. Must be exactly [`SECTOR_SIZE`] bytes long.
///
/// Slot 12 roots the single-indirect tier, slot 13 the double-indirect
/// tier. `length` is the file size in bytes; `kind` is an [`InodeKind`]
/// tag; the remainder of the sector is reserved zero.
#[derive(Pod)]
#[repr(C)]
pub struct DiskInode {
    /// Direct slots plus the two indirect roots. 0 means unallocated.
    pub slots: [u32; NUM_INODE_SLOTS],
    /// File size in bytes.
    pub length: i32,
    /// [`InodeKind`] as its raw tag.
    pub kind: u32,
    /// Must be [`INODE_MAGIC`].
    pub magic: u32,
    reserved: [u32; NUM_RESERVED],
}

const _: () = assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    /// Byte offset of slot `i` within the inode sector.
    #[must_use]
    pub const fn slot_offset(i: usize) -> usize {
        assert!(i < NUM_INODE_SLOTS);
        i * mem::size_of::<u32>()
    }

    /// Byte offset of the length word within the inode sector.
    pub const LENGTH_OFFSET: usize = NUM_INODE_SLOTS * mem::size_of::<u32>();

    /// Byte offset of the kind word within the inode sector.
    pub const KIND_OFFSET: usize = Self::LENGTH_OFFSET + mem::size_of::<u32>();

    /// Byte offset of the magic word within the inode sector.
    pub const MAGIC_OFFSET: usize = Self::KIND_OFFSET + mem::size_of::<u32>();

    /// Creates a fresh inode image with no data sectors.
    #[must_use]
    pub fn new(length: i32, kind: InodeKind) -> Self {
        Self {
            slots: [0; NUM_INODE_SLOTS],
            length,
            kind: kind as u32,
            magic: INODE_MAGIC,
            reserved: [0; NUM_RESERVED],
        }
    }

    /// Returns the sector rooted at slot `i`, or `None` for a hole.
    #[must_use]
    pub fn slot(&self, i: usize) -> Option<SectorNo> {
        (self.slots[i] != 0).then(|| SectorNo::new(self.slots[i]))
    }

    /// Points slot `i` at `sector` (or clears it).
    pub fn set_slot(&mut self, i: usize, sector: Option<SectorNo>) {
        self.slots[i] = sector.map_or(0, |s| s.value());
    }
}

/// An index block: one sector of sector numbers.
///
/// Used both for the single-indirect tier and for each level of the
/// double-indirect tier.
#[derive(Pod)]
#[repr(C)]
pub struct IndexBlock {
    entries: [u32; NUM_INDIRECT],
}

const _: () = assert!(mem::size_of::<IndexBlock>() == SECTOR_SIZE);

impl IndexBlock {
    /// Byte offset of entry `i` within the index sector.
    #[must_use]
    pub const fn entry_offset(i: usize) -> usize {
        assert!(i < NUM_INDIRECT);
        i * mem::size_of::<u32>()
    }

    /// Returns entry `i`, or `None` for a hole.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<SectorNo> {
        (self.entries[i] != 0).then(|| SectorNo::new(self.entries[i]))
    }

    /// Sets entry `i` to `sector` (or clears it).
    pub fn set(&mut self, i: usize, sector: Option<SectorNo>) {
        self.entries[i] = sector.map_or(0, |s| s.value());
    }

    /// Iterates over the allocated entries.
    pub fn iter(&self) -> impl Iterator<Item = SectorNo> + '_ {
        self.entries
            .iter()
            .filter(|&&e| e != 0)
            .map(|&e| SectorNo::new(e))
    }
}

/// Returns the number of sectors needed for `size` bytes of data.
#[must_use]
pub fn bytes_to_sectors(size: usize) -> usize {
    size.div_ceil(SECTOR_SIZE)
}

#[cfg(test)]
mod tests {
    use dataview::PodMethods as _;

    use super::*;

    #[test]
    fn disk_inode_layout() {
        let mut inode = DiskInode::new(1234, InodeKind::File);
        inode.set_slot(0, Some(SectorNo::new(7)));
        inode.set_slot(SINGLE_INDIRECT_SLOT, Some(SectorNo::new(9)));

        let bytes = inode.as_bytes();
        assert_eq!(bytes.len(), SECTOR_SIZE);
        assert_eq!(&bytes[..4], &7u32.to_le_bytes());
        assert_eq!(
            &bytes[DiskInode::slot_offset(SINGLE_INDIRECT_SLOT)..][..4],
            &9u32.to_le_bytes()
        );
        assert_eq!(
            &bytes[DiskInode::LENGTH_OFFSET..][..4],
            &1234i32.to_le_bytes()
        );
        assert_eq!(&bytes[DiskInode::KIND_OFFSET..][..4], &1u32.to_le_bytes());
        assert_eq!(
            &bytes[DiskInode::MAGIC_OFFSET..][..4],
            &INODE_MAGIC.to_le_bytes()
        );
        // Everything past the magic word is reserved zero.
        assert!(bytes[DiskInode::MAGIC_OFFSET + 4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn index_block_holes() {
        let mut ib = IndexBlock::zeroed();
        assert!(ib.get(0).is_none());
        ib.set(5, Some(SectorNo::new(42)));
        assert_eq!(ib.get(5), Some(SectorNo::new(42)));
        ib.set(5, None);
        assert!(ib.get(5).is_none());
        assert_eq!(ib.iter().count(), 0);
    }

    #[test]
    fn addressable_limits() {
        assert_eq!(NUM_INDIRECT, 128);
        assert_eq!(MAX_FILE_SECTORS, 12 + 128 + 128 * 128);
        assert_eq!(bytes_to_sectors(0), 0);
        assert_eq!(bytes_to_sectors(1), 1);
        assert_eq!(bytes_to_sectors(SECTOR_SIZE), 1);
        assert_eq!(bytes_to_sectors(SECTOR_SIZE + 1), 2);
    }

    #[test]
    fn inode_kind_repr() {
        assert_eq!(InodeKind::from_repr(0), Some(InodeKind::Dir));
        assert_eq!(InodeKind::from_repr(1), Some(InodeKind::File));
        assert_eq!(InodeKind::from_repr(2), None);
    }
}
