use minos_fs_types::SECTOR_SIZE;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Sectors per page; one swap slot holds this many sectors.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Default maximum readahead window, in sectors.
pub const READAHEAD_WINDOW: usize = 32;

/// The eviction sweep refills the inactive list up to this size.
pub const MIN_INACTIVE_FRAMES: usize = 10;

/// Initial per-process file-descriptor table size.
pub const FD_TABLE_INIT: usize = 16;

/// Hard cap on a process's descriptor table.
pub const FD_TABLE_MAX: usize = 512;
