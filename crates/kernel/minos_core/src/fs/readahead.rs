//! Sequential-read prefetching.
//!
//! Each opener carries an [`RaState`] describing its readahead window:
//! `[start, start + size)` in file sectors, of which the trailing
//! `async_size` sectors are the asynchronous lookahead. The first
//! sector of the lookahead carries a marker in the cache; when a reader
//! consumes the marked sector, the next window is fetched before the
//! reader arrives.
//!
//! The policy distinguishes a sequential start (read from offset 0, a
//! large request, or a read adjacent to the previous position), a
//! sequential continuation (the read lands exactly where the window
//! predicted), an interleaved hit on a marker with no matching window
//! state, and random access, which fetches the request one-shot
//! without touching the window.

use minos_fs_types::SECTOR_SIZE;
use sector_cache::Owner;

use super::Inode;
use crate::param::READAHEAD_WINDOW;

/// Per-opener readahead state.
#[derive(Debug, Clone)]
pub struct RaState {
    /// Window start, in file sectors.
    pub start: usize,
    /// Window size, in sectors.
    pub size: usize,
    /// Trailing part of the window fetched asynchronously.
    pub async_size: usize,
    /// Maximum window size; 0 disables readahead.
    pub ra_sectors: usize,
    /// Byte position of the previous read, −1 before the first read.
    pub prev_pos: i64,
}

impl RaState {
    pub(crate) const SECTOR_SHIFT: u32 = SECTOR_SIZE.trailing_zeros();

    #[must_use]
    pub fn new() -> Self {
        Self {
            start: 0,
            size: 0,
            async_size: 0,
            ra_sectors: READAHEAD_WINDOW,
            prev_pos: -1,
        }
    }
}

impl Default for RaState {
    fn default() -> Self {
        Self::new()
    }
}

/// Initial window size for a sequential start: the request rounded up
/// to a power of two, scaled up while well below the maximum.
fn get_init_ra_size(req: usize, max: usize) -> usize {
    let newsize = req.next_power_of_two();
    if newsize <= max / 32 {
        newsize * 4
    } else if newsize <= max / 4 {
        newsize * 2
    } else {
        max
    }
}

/// Ramps the previous window size up into the next one.
fn get_next_ra_size(cur: usize, max: usize) -> usize {
    if cur < max / 16 {
        4 * cur
    } else if cur <= max / 2 {
        2 * cur
    } else {
        max
    }
}

impl Inode {
    pub(super) fn sync_readahead(
        &self,
        owner: Owner,
        ra: &mut RaState,
        index: usize,
        req: usize,
    ) {
        if ra.ra_sectors == 0 {
            return;
        }
        self.ondemand_readahead(owner, ra, false, index, req);
    }

    pub(super) fn async_readahead(
        &self,
        owner: Owner,
        ra: &mut RaState,
        sector: minos_fs_types::SectorNo,
        index: usize,
        req: usize,
    ) {
        if ra.ra_sectors == 0 {
            return;
        }
        self.fs().cache().clear_readahead(sector);
        self.ondemand_readahead(owner, ra, true, index, req);
    }

    /// Scans forward from `index` for the first file sector that is not
    /// in the cache, looking at most `max_scan` sectors ahead.
    fn next_miss(&self, mut index: usize, mut max_scan: usize) -> usize {
        while max_scan > 0 {
            max_scan -= 1;
            match self.data_sector(index) {
                Ok(Some(sector)) if self.fs().cache().contains(sector) => index += 1,
                _ => break,
            }
        }
        index
    }

    /// Fetches `n` file sectors starting at `start` into the cache.
    ///
    /// If a sector of the range is already cached the pass is
    /// suppressed: the reader is already ahead of us. The sector at
    /// `n - lookahead` is stamped with the readahead marker.
    fn do_readahead(&self, owner: Owner, start: usize, n: usize, lookahead: usize) -> usize {
        let Ok(length) = self.length() else {
            return 0;
        };
        if length == 0 {
            return 0;
        }
        let end_index = (length - 1) / SECTOR_SIZE;

        let mut fetched = 0;
        for i in 0..n {
            let index = start + i;
            if index > end_index {
                break;
            }
            let Ok(Some(sector)) = self.data_sector(index) else {
                break;
            };
            if self.fs().cache().contains(sector) {
                return 0;
            }
            let Ok(entry) = self.fs().cache().get(sector, owner) else {
                break;
            };
            if i == n - lookahead {
                entry.set_readahead();
            }
            fetched += 1;
        }
        fetched
    }

    /// The readahead oracle: sizes and places the window from the
    /// access pattern, then fetches it.
    fn ondemand_readahead(
        &self,
        owner: Owner,
        ra: &mut RaState,
        hit_marker: bool,
        offset: usize,
        req: usize,
    ) -> usize {
        let max = ra.ra_sectors;

        if offset != 0 && (offset == ra.start + ra.size - ra.async_size || offset == ra.start + ra.size)
        {
            // The reader followed the predicted path: push the window
            // forward and ramp it up.
            ra.start += ra.size;
            ra.size = get_next_ra_size(ra.size, max);
            ra.async_size = ra.size;
        } else if offset != 0 && hit_marker {
            // Marker hit without matching window state (interleaved
            // reads): restart the window at the first gap ahead.
            let start = self.next_miss(offset + 1, max);
            if start - offset > max {
                return 0;
            }
            ra.start = start;
            ra.size = (start - offset) + req;
            ra.size = get_next_ra_size(ra.size, max);
            ra.async_size = ra.size;
        } else if offset == 0
            || req > max
            || offset as i64 - (ra.prev_pos >> RaState::SECTOR_SHIFT) <= 1
        {
            // Sequential start: from the head of the file, a large
            // request, or adjacent to the previous position.
            ra.start = offset;
            ra.size = get_init_ra_size(req, max);
            ra.async_size = if ra.size > req { ra.size - req } else { ra.size };
        } else {
            // Random access: one-shot fetch, window state untouched.
            return self.do_readahead(owner, offset, req, 0);
        }

        // If this fetch would consume its own marker, merge the next
        // window in ahead of time.
        if offset == ra.start && ra.size == ra.async_size {
            let add = get_next_ra_size(ra.size, max);
            if ra.size + add <= max {
                ra.async_size = add;
                ra.size += add;
            } else {
                ra.size = max;
                ra.async_size = max / 2;
            }
        }

        self.do_readahead(owner, ra.start, ra.size, ra.async_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_size_scales_with_distance_from_max() {
        // Well below the maximum: quadruple.
        assert_eq!(get_init_ra_size(1, 32), 4);
        // Mid-range: double.
        assert_eq!(get_init_ra_size(5, 32), 16);
        // Near the maximum: clamp.
        assert_eq!(get_init_ra_size(16, 32), 32);
    }

    #[test]
    fn ramp_quadruples_then_doubles_then_clamps() {
        assert_eq!(get_next_ra_size(1, 32), 4);
        assert_eq!(get_next_ra_size(4, 32), 8);
        assert_eq!(get_next_ra_size(16, 32), 32);
        assert_eq!(get_next_ra_size(32, 32), 32);
    }

    #[test]
    fn fresh_state_has_no_history() {
        let ra = RaState::new();
        assert_eq!(ra.prev_pos, -1);
        assert_eq!(ra.ra_sectors, READAHEAD_WINDOW);
        assert_eq!((ra.start, ra.size, ra.async_size), (0, 0, 0));
    }
}
