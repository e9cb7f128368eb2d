//! Cache for sector I/O.
//!
//! Sectors are cached in a fixed number of buffers ordered by how
//! recently they were used. A buffer that is held through a
//! [`CacheRef`] is *in use* and never recycled; recycling picks the
//! least recently used unreferenced buffer and writes it back first if
//! it is dirty. Device I/O always happens with the cache lock released;
//! a per-entry `valid` flag makes concurrent misses on the same sector
//! coalesce into a single device read.
//!
//! Dirty buffers are written back by [`SectorCache::tick`], driven by
//! the timer: every [`WRITE_BEHIND_TICKS`] ticks all dirty buffers are
//! flushed. They are also written back on recycle, on [`free`], and on
//! [`clear`].
//!
//! [`free`]: SectorCache::free
//! [`clear`]: SectorCache::clear

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use minos_fs_types::{SectorNo, SECTOR_SIZE};

/// Number of sector buffers in a cache.
pub const CACHE_CAPACITY: usize = 64;

/// Write-behind period, in timer ticks.
pub const WRITE_BEHIND_TICKS: u32 = 30;

/// A block device addressed in [`SECTOR_SIZE`]-byte sectors.
///
/// The device is assumed infallible; a real driver treats an I/O error
/// as fatal before it reaches this layer.
pub trait BlockDevice: Send + Sync {
    fn read_sector(&self, sector: SectorNo, buf: &mut [u8; SECTOR_SIZE]);
    fn write_sector(&self, sector: SectorNo, buf: &[u8; SECTOR_SIZE]);

    /// Total number of sectors on the device.
    fn sector_count(&self) -> u32;
}

/// Tag identifying the thread that faulted a buffer in.
///
/// Stored as a plain field so that per-thread teardown does not walk
/// any per-thread list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner(pub u64);

impl Owner {
    /// Owner tag for work done outside any user thread.
    pub const KERNEL: Self = Self(0);
}

/// Error returned when every buffer is in use.
///
/// Transient: callers propagate it instead of blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBusy;

impl fmt::Display for CacheBusy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "every sector buffer is in use")
    }
}

struct Entry {
    sector: SectorNo,
    owner: AtomicU64,
    dirty: AtomicBool,
    readahead: AtomicBool,
    /// `true` once the buffer holds the sector's bytes. Cleared only at
    /// creation; checked under the data lock so duplicate misses fill
    /// once.
    valid: AtomicBool,
    data: Mutex<Box<[u8; SECTOR_SIZE]>>,
    device: Arc<dyn BlockDevice>,
}

impl Entry {
    fn new(sector: SectorNo, owner: Owner, device: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            sector,
            owner: AtomicU64::new(owner.0),
            dirty: AtomicBool::new(false),
            readahead: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            data: Mutex::new(Box::new([0; SECTOR_SIZE])),
            device,
        })
    }

    /// Writes the buffer back if dirty. Takes the data lock.
    fn flush(&self) {
        let data = self.data.lock();
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.device.write_sector(self.sector, &data);
        }
    }
}

/// A pinned reference to a cached sector.
///
/// While any `CacheRef` to a sector exists, its buffer is in use and
/// cannot be recycled. Dropping the reference releases the pin.
pub struct CacheRef {
    entry: Arc<Entry>,
}

impl fmt::Debug for CacheRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRef")
            .field("sector", &self.entry.sector)
            .finish()
    }
}

impl CacheRef {
    /// Returns the sector number.
    #[must_use]
    pub fn sector(&self) -> SectorNo {
        self.entry.sector
    }

    fn lock_valid(&self) -> spin::MutexGuard<'_, Box<[u8; SECTOR_SIZE]>> {
        let mut data = self.entry.data.lock();
        if !self.entry.valid.load(Ordering::Acquire) {
            self.entry.device.read_sector(self.entry.sector, &mut data);
            self.entry.valid.store(true, Ordering::Release);
        }
        data
    }

    /// Runs `f` over the sector's bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8; SECTOR_SIZE]) -> R) -> R {
        f(&self.lock_valid())
    }

    /// Runs `f` over the sector's bytes mutably and marks the buffer
    /// dirty.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8; SECTOR_SIZE]) -> R) -> R {
        let mut data = self.lock_valid();
        self.entry.dirty.store(true, Ordering::Release);
        f(&mut data)
    }

    /// Copies `dst.len()` bytes out of the sector starting at `off`.
    pub fn read_bytes(&self, off: usize, dst: &mut [u8]) {
        self.with_data(|data| dst.copy_from_slice(&data[off..off + dst.len()]));
    }

    /// Copies `src` into the sector starting at `off`.
    pub fn write_bytes(&self, off: usize, src: &[u8]) {
        self.with_data_mut(|data| data[off..off + src.len()].copy_from_slice(src));
    }

    /// Reads the little-endian word at byte position `pos`.
    #[must_use]
    pub fn read_u32(&self, pos: usize) -> u32 {
        self.with_data(|data| u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()))
    }

    /// Writes `value` as a little-endian word at byte position `pos`.
    pub fn write_u32(&self, pos: usize, value: u32) {
        self.with_data_mut(|data| data[pos..pos + 4].copy_from_slice(&value.to_le_bytes()));
    }

    /// Marks this sector as the lookahead point of an asynchronous
    /// readahead window.
    pub fn set_readahead(&self) {
        self.entry.readahead.store(true, Ordering::Release);
    }
}

/// A fixed-capacity cache of sectors, least recently used first.
pub struct SectorCache {
    device: Arc<dyn BlockDevice>,
    /// LRU order and membership. Front is the recycling candidate.
    lru: Mutex<VecDeque<Arc<Entry>>>,
    capacity: usize,
    ticks: AtomicU32,
}

impl SectorCache {
    /// Creates a cache of [`CACHE_CAPACITY`] buffers over `device`.
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self::with_capacity(device, CACHE_CAPACITY)
    }

    /// Creates a cache with a non-default buffer count.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            device,
            lru: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ticks: AtomicU32::new(0),
        }
    }

    /// Returns a pinned reference to `sector`, reading it from the
    /// device on a miss.
    ///
    /// The entry is moved to the most recently used position. On a miss
    /// with a full cache, the least recently used unpinned buffer is
    /// recycled (written back first if dirty). Fails with [`CacheBusy`]
    /// if every buffer is pinned.
    pub fn get(&self, sector: SectorNo, owner: Owner) -> Result<CacheRef, CacheBusy> {
        let mut victim = None;
        let entry = {
            let mut lru = self.lru.lock();
            if let Some(i) = lru.iter().position(|e| e.sector == sector) {
                let entry = lru.remove(i).unwrap();
                lru.push_back(Arc::clone(&entry));
                entry
            } else {
                if lru.len() == self.capacity {
                    let Some(i) = lru.iter().position(|e| Arc::strong_count(e) == 1) else {
                        return Err(CacheBusy);
                    };
                    victim = lru.remove(i);
                }
                let entry = Entry::new(sector, owner, Arc::clone(&self.device));
                lru.push_back(Arc::clone(&entry));
                entry
            }
        };

        // Device I/O runs with the cache lock released. The recycled
        // buffer is exclusively ours here; the new entry fills lazily
        // behind its valid flag.
        if let Some(victim) = victim {
            log::trace!("recycle sector buffer {}", victim.sector);
            victim.flush();
        }
        Ok(CacheRef { entry })
    }

    /// Returns a pinned reference to `sector` if it is cached.
    ///
    /// Does not touch the LRU order.
    pub fn find(&self, sector: SectorNo) -> Option<CacheRef> {
        let lru = self.lru.lock();
        lru.iter()
            .find(|e| e.sector == sector)
            .map(|e| CacheRef {
                entry: Arc::clone(e),
            })
    }

    /// Returns `true` if `sector` is cached.
    pub fn contains(&self, sector: SectorNo) -> bool {
        self.lru.lock().iter().any(|e| e.sector == sector)
    }

    /// Drops `sector` from the cache, writing it back first if dirty.
    ///
    /// The caller must not hold a reference to the sector.
    pub fn free(&self, sector: SectorNo) {
        let entry = {
            let mut lru = self.lru.lock();
            lru.iter()
                .position(|e| e.sector == sector)
                .and_then(|i| lru.remove(i))
        };
        if let Some(entry) = entry {
            entry.flush();
        }
    }

    /// Drops every buffer, writing dirty ones back.
    pub fn clear(&self) {
        let drained: Vec<_> = self.lru.lock().drain(..).collect();
        for entry in drained {
            entry.flush();
        }
    }

    /// Drops every buffer faulted in by `owner`, writing dirty ones
    /// back. Part of thread teardown.
    pub fn free_owned_by(&self, owner: Owner) {
        let removed = {
            let mut lru = self.lru.lock();
            let mut removed = Vec::new();
            let mut i = 0;
            while i < lru.len() {
                if lru[i].owner.load(Ordering::Relaxed) == owner.0 {
                    removed.push(lru.remove(i).unwrap());
                } else {
                    i += 1;
                }
            }
            removed
        };
        for entry in removed {
            entry.flush();
        }
    }

    /// Writes every dirty buffer back and clears its dirty flag.
    pub fn flush_all(&self) {
        let entries: Vec<_> = self.lru.lock().iter().map(Arc::clone).collect();
        for entry in entries {
            entry.flush();
        }
    }

    /// Advances the write-behind clock by one timer tick.
    ///
    /// Every [`WRITE_BEHIND_TICKS`] ticks, flushes all dirty buffers.
    pub fn tick(&self) {
        let t = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if t % WRITE_BEHIND_TICKS == 0 {
            log::trace!("write-behind flush");
            self.flush_all();
        }
    }

    /// Copies `dst.len()` bytes from `sector` starting at `off`.
    pub fn read(
        &self,
        sector: SectorNo,
        owner: Owner,
        off: usize,
        dst: &mut [u8],
    ) -> Result<(), CacheBusy> {
        self.get(sector, owner)?.read_bytes(off, dst);
        Ok(())
    }

    /// Copies `src` into `sector` starting at `off`.
    pub fn write(
        &self,
        sector: SectorNo,
        owner: Owner,
        off: usize,
        src: &[u8],
    ) -> Result<(), CacheBusy> {
        self.get(sector, owner)?.write_bytes(off, src);
        Ok(())
    }

    /// Reads the little-endian word at byte position `pos` of `sector`.
    pub fn read_u32(&self, sector: SectorNo, owner: Owner, pos: usize) -> Result<u32, CacheBusy> {
        Ok(self.get(sector, owner)?.read_u32(pos))
    }

    /// Writes `value` at byte position `pos` of `sector`.
    pub fn write_u32(
        &self,
        sector: SectorNo,
        owner: Owner,
        pos: usize,
        value: u32,
    ) -> Result<(), CacheBusy> {
        self.get(sector, owner)?.write_u32(pos, value);
        Ok(())
    }

    /// Fills `len` bytes of `sector` starting at `off` with `value`.
    pub fn memset(
        &self,
        sector: SectorNo,
        owner: Owner,
        value: u8,
        off: usize,
        len: usize,
    ) -> Result<(), CacheBusy> {
        self.get(sector, owner)?
            .with_data_mut(|data| data[off..off + len].fill(value));
        Ok(())
    }

    /// Returns whether `sector` bears a readahead marker.
    pub fn readahead(&self, sector: SectorNo) -> bool {
        let lru = self.lru.lock();
        lru.iter()
            .find(|e| e.sector == sector)
            .is_some_and(|e| e.readahead.load(Ordering::Acquire))
    }

    /// Marks `sector` as the lookahead point of an asynchronous
    /// readahead window, if it is cached.
    pub fn set_readahead(&self, sector: SectorNo) {
        let lru = self.lru.lock();
        if let Some(e) = lru.iter().find(|e| e.sector == sector) {
            e.readahead.store(true, Ordering::Release);
        }
    }

    /// Clears `sector`'s readahead marker, if it is cached.
    pub fn clear_readahead(&self, sector: SectorNo) {
        let lru = self.lru.lock();
        if let Some(e) = lru.iter().find(|e| e.sector == sector) {
            e.readahead.store(false, Ordering::Release);
        }
    }

    /// Number of cached sectors.
    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.lru.lock().is_empty()
    }

    /// Snapshot of the cached sectors in LRU order (coldest first).
    /// Diagnostic; used by consistency checks.
    pub fn lru_sectors(&self) -> Vec<SectorNo> {
        self.lru.lock().iter().map(|e| e.sector).collect()
    }

    /// Returns `true` if any cached buffer is dirty. Diagnostic.
    pub fn any_dirty(&self) -> bool {
        self.lru
            .lock()
            .iter()
            .any(|e| e.dirty.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    struct MockDevice {
        sectors: Vec<StdMutex<MockSector>>,
    }

    #[derive(Clone)]
    struct MockSector {
        data: [u8; SECTOR_SIZE],
        reads: usize,
        writes: usize,
    }

    impl MockDevice {
        fn new(size: usize) -> Arc<Self> {
            Arc::new(Self {
                sectors: (0..size)
                    .map(|_| {
                        StdMutex::new(MockSector {
                            data: [0; SECTOR_SIZE],
                            reads: 0,
                            writes: 0,
                        })
                    })
                    .collect(),
            })
        }

        fn sector(&self, i: u32) -> MockSector {
            self.sectors[i as usize].lock().unwrap().clone()
        }
    }

    impl BlockDevice for MockDevice {
        fn read_sector(&self, sector: SectorNo, buf: &mut [u8; SECTOR_SIZE]) {
            let mut s = self.sectors[sector.as_index()].lock().unwrap();
            s.reads += 1;
            buf.copy_from_slice(&s.data);
        }

        fn write_sector(&self, sector: SectorNo, buf: &[u8; SECTOR_SIZE]) {
            let mut s = self.sectors[sector.as_index()].lock().unwrap();
            s.writes += 1;
            s.data.copy_from_slice(buf);
        }

        fn sector_count(&self) -> u32 {
            u32::try_from(self.sectors.len()).unwrap()
        }
    }

    fn sn(n: u32) -> SectorNo {
        SectorNo::new(n)
    }

    #[test]
    fn miss_reads_device_once() {
        let device = MockDevice::new(10);
        let cache = SectorCache::new(Arc::clone(&device) as _);

        cache.read(sn(3), Owner::KERNEL, 0, &mut [0; 16]).unwrap();
        cache.read(sn(3), Owner::KERNEL, 16, &mut [0; 16]).unwrap();
        assert_eq!(device.sector(3).reads, 1);
        assert_eq!(device.sector(3).writes, 0);
    }

    #[test]
    fn write_then_read_round_trip() {
        let device = MockDevice::new(10);
        let cache = SectorCache::new(Arc::clone(&device) as _);

        cache.write(sn(2), Owner::KERNEL, 100, b"hello").unwrap();
        let mut out = [0; 5];
        cache.read(sn(2), Owner::KERNEL, 100, &mut out).unwrap();
        assert_eq!(&out, b"hello");
        // Dirty data has not reached the device yet.
        assert_eq!(device.sector(2).writes, 0);
        assert!(cache.any_dirty());
    }

    #[test]
    fn word_access() {
        let device = MockDevice::new(10);
        let cache = SectorCache::new(Arc::clone(&device) as _);

        cache.write_u32(sn(1), Owner::KERNEL, 12, 0xdead_beef).unwrap();
        assert_eq!(cache.read_u32(sn(1), Owner::KERNEL, 12).unwrap(), 0xdead_beef);
    }

    #[test]
    fn get_moves_entry_to_tail() {
        let device = MockDevice::new(10);
        let cache = SectorCache::with_capacity(Arc::clone(&device) as _, 4);

        for i in 0..4 {
            cache.get(sn(i), Owner::KERNEL).unwrap();
        }
        assert_eq!(cache.lru_sectors(), [sn(0), sn(1), sn(2), sn(3)]);
        cache.get(sn(1), Owner::KERNEL).unwrap();
        assert_eq!(cache.lru_sectors(), [sn(0), sn(2), sn(3), sn(1)]);
    }

    #[test]
    fn full_cache_recycles_coldest_and_writes_back() {
        let device = MockDevice::new(100);
        let cache = SectorCache::with_capacity(Arc::clone(&device) as _, 4);

        for i in 0..4 {
            cache.write(sn(i), Owner::KERNEL, 0, &[i as u8 + 1]).unwrap();
        }
        cache.get(sn(50), Owner::KERNEL).unwrap();

        // Sector 0 was the coldest: gone from the cache, flushed to the
        // device.
        assert!(!cache.contains(sn(0)));
        assert!(cache.contains(sn(50)));
        assert_eq!(cache.len(), 4);
        assert_eq!(device.sector(0).writes, 1);
        assert_eq!(device.sector(0).data[0], 1);
    }

    #[test]
    fn pinned_entries_are_never_recycled() {
        let device = MockDevice::new(100);
        let cache = SectorCache::with_capacity(Arc::clone(&device) as _, 2);

        let pin0 = cache.get(sn(0), Owner::KERNEL).unwrap();
        let pin1 = cache.get(sn(1), Owner::KERNEL).unwrap();
        assert_eq!(cache.get(sn(2), Owner::KERNEL).unwrap_err(), CacheBusy);

        drop(pin0);
        let got = cache.get(sn(2), Owner::KERNEL).unwrap();
        assert_eq!(got.sector(), sn(2));
        assert!(cache.contains(sn(1)));
        drop(pin1);
    }

    #[test]
    fn duplicate_gets_coalesce() {
        let device = MockDevice::new(10);
        let cache = SectorCache::new(Arc::clone(&device) as _);

        let a = cache.get(sn(5), Owner::KERNEL).unwrap();
        let b = cache.get(sn(5), Owner::KERNEL).unwrap();
        a.write_bytes(0, b"x");
        b.with_data(|data| assert_eq!(data[0], b'x'));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn write_behind_flushes_every_30_ticks() {
        let device = MockDevice::new(40);
        let cache = SectorCache::new(Arc::clone(&device) as _);

        for i in 0..8 {
            cache.write(sn(i), Owner::KERNEL, 0, &[0xAA]).unwrap();
        }
        for _ in 0..WRITE_BEHIND_TICKS - 1 {
            cache.tick();
        }
        assert!(cache.any_dirty());
        cache.tick();
        assert!(!cache.any_dirty());
        for i in 0..8 {
            assert_eq!(device.sector(i).writes, 1);
        }
    }

    #[test]
    fn clear_flushes_dirty_buffers() {
        let device = MockDevice::new(10);
        let cache = SectorCache::new(Arc::clone(&device) as _);

        cache.write(sn(4), Owner::KERNEL, 0, b"bye").unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(&device.sector(4).data[..3], b"bye");
    }

    #[test]
    fn free_owned_by_drops_only_that_owner() {
        let device = MockDevice::new(10);
        let cache = SectorCache::new(Arc::clone(&device) as _);

        cache.write(sn(1), Owner(7), 0, b"a").unwrap();
        cache.write(sn(2), Owner(8), 0, b"b").unwrap();
        cache.free_owned_by(Owner(7));

        assert!(!cache.contains(sn(1)));
        assert!(cache.contains(sn(2)));
        assert_eq!(device.sector(1).writes, 1);
        assert_eq!(device.sector(2).writes, 0);
    }

    #[test]
    fn readahead_marker_ops() {
        let device = MockDevice::new(10);
        let cache = SectorCache::new(Arc::clone(&device) as _);

        // Markers only stick to cached sectors.
        cache.set_readahead(sn(3));
        assert!(!cache.readahead(sn(3)));

        cache.get(sn(3), Owner::KERNEL).unwrap();
        cache.set_readahead(sn(3));
        assert!(cache.readahead(sn(3)));
        cache.clear_readahead(sn(3));
        assert!(!cache.readahead(sn(3)));
    }

    #[test]
    fn memset_marks_dirty() {
        let device = MockDevice::new(10);
        let cache = SectorCache::new(Arc::clone(&device) as _);

        cache.memset(sn(6), Owner::KERNEL, 0x5A, 8, 16).unwrap();
        let mut out = [0; 16];
        cache.read(sn(6), Owner::KERNEL, 8, &mut out).unwrap();
        assert_eq!(out, [0x5A; 16]);
        cache.flush_all();
        assert_eq!(device.sector(6).data[8..24], [0x5A; 16]);
        assert_eq!(device.sector(6).data[0..8], [0; 8]);
    }
}
