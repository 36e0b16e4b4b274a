//! Adaptive read-ahead: a per-open-handle state machine that recognises
//! sequential, strided, and marker-driven access patterns and advances a
//! window of logical sectors asynchronously ahead of the reader.
//!
//! This module knows nothing about inodes or the buffer cache directly;
//! it drives a [`Source`] (implemented by [`crate::inode::Inode`]) that
//! can test whether a logical sector is already cached, pull one into the
//! cache, and set or clear the cache's advisory marker bit. That keeps the
//! window-sizing arithmetic -- the part worth testing in isolation --
//! decoupled from disk I/O.

use keos::kdebug;

/// What the read-ahead engine needs from whatever it is reading ahead of.
pub trait Source {
    /// Number of logical sectors in the file (`ceil(length / 512)`).
    fn sector_count(&self) -> usize;

    /// True if logical sector `i` already has a cache entry.
    fn is_cached(&self, i: usize) -> bool;

    /// Pulls logical sector `i` into the cache if it is not already
    /// there. No-op if `i` is beyond [`Source::sector_count`].
    fn admit(&self, i: usize);

    /// Sets the cache's read-ahead marker on logical sector `i`.
    fn set_marker(&self, i: usize);

    /// Clears the cache's read-ahead marker on logical sector `i`.
    fn clear_marker(&self, i: usize);
}

/// Per-open-handle read-ahead state.
///
/// Invariant: `async_size <= size <= ra_pages`.
#[derive(Debug, Clone, Copy)]
pub struct RaState {
    /// First logical sector of the current window.
    pub start: usize,
    /// Window size, in sectors.
    pub size: usize,
    /// Size of the "async" (look-ahead, not-yet-requested) tail of the
    /// window, in sectors.
    pub async_size: usize,
    /// Maximum window size; 0 disables read-ahead entirely.
    pub ra_pages: usize,
    /// Last absolute byte position read through this handle.
    pub prev_pos: Option<u64>,
}

impl RaState {
    /// A fresh state for a newly opened handle, matching `inode_ra_state_init`:
    /// the window starts empty and `prev_pos` is "none" until the first read.
    pub fn new(ra_pages: usize) -> Self {
        Self {
            start: 0,
            size: 0,
            async_size: 0,
            ra_pages,
            prev_pos: None,
        }
    }
}

fn ramp(cur: usize, ra_pages: usize) -> usize {
    if cur < ra_pages / 16 {
        cur * 4
    } else if cur <= ra_pages / 2 {
        cur * 2
    } else {
        ra_pages
    }
}

fn next_pow2(x: usize) -> usize {
    x.max(1).next_power_of_two()
}

fn init_size(req: usize, ra_pages: usize) -> usize {
    let newsize = next_pow2(req);
    if newsize <= ra_pages / 32 {
        newsize * 4
    } else if newsize <= ra_pages / 4 {
        newsize * 2
    } else {
        ra_pages
    }
}

/// A bounded linear scan (up to `limit` sectors from `from`) for the next
/// logical sector that is not yet cached.
fn next_miss(source: &impl Source, from: usize, limit: usize) -> Option<usize> {
    (from..from + limit).find(|&i| !source.is_cached(i))
}

/// Pulls the next `n` logical sectors starting at `start` into the cache
/// (stopping at EOF), marking the `(n - lookahead)`-th freshly admitted
/// sector as the new lookahead boundary.
///
/// On a cache hit mid-scan the "freshly admitted" counter resets to zero
/// rather than decrementing: after running through an already-hot range,
/// the marker should land at the first new miss past that range, not
/// somewhere inside it (see the module-level open-question note this
/// implements explicitly).
fn do_readahead(source: &impl Source, start: usize, n: usize, lookahead: usize) -> usize {
    let mut fresh = 0usize;
    let end = source.sector_count();
    for i in 0..n {
        let logical = start + i;
        if logical >= end {
            break;
        }
        if source.is_cached(logical) {
            fresh = 0;
            continue;
        }
        source.admit(logical);
        fresh += 1;
        if fresh == n.saturating_sub(lookahead) {
            source.set_marker(logical);
        }
    }
    fresh
}

impl RaState {
    fn self_merge(&mut self, offset: usize) {
        if offset == self.start && self.size == self.async_size {
            let candidate = self.size.saturating_mul(2);
            if candidate <= self.ra_pages {
                self.size = candidate;
                self.async_size = candidate;
            } else {
                self.size = self.ra_pages;
                self.async_size = self.ra_pages / 2;
            }
        }
    }

    fn initial(&mut self, offset: usize, req: usize) {
        let newsize = init_size(req, self.ra_pages);
        self.start = offset;
        self.size = newsize;
        self.async_size = if newsize > req { newsize - req } else { newsize };
    }

    fn advance(&mut self) {
        self.start += self.size;
        let new_size = ramp(self.size, self.ra_pages);
        if new_size != self.size {
            kdebug!("readahead: window ramped {} -> {new_size} sector(s)", self.size);
        }
        self.size = new_size;
        self.async_size = self.size;
    }

    /// Runs the decision tree and issues the resulting read-ahead, if
    /// any. `offset` and `req` are in sectors; `marker_hit` selects the
    /// asynchronous decision path.
    fn dispatch(&mut self, source: &impl Source, offset: usize, req: usize, marker_hit: bool) {
        let window_continuation = self.size > 0
            && (offset == self.start + self.size - self.async_size || offset == self.start + self.size);

        if offset == 0 {
            self.initial(offset, req);
            self.self_merge(offset);
        } else if window_continuation {
            self.advance();
            self.self_merge(offset);
        } else if marker_hit {
            if let Some(gap) = next_miss(source, offset + 1, self.ra_pages) {
                if gap <= offset + self.ra_pages {
                    self.start = gap;
                    self.size = ramp(gap - offset + req, self.ra_pages);
                    self.async_size = self.size;
                }
            }
            let lookahead = self.size.saturating_sub(self.async_size);
            do_readahead(source, self.start, self.size, lookahead);
            return;
        } else if req > self.ra_pages {
            self.initial(offset, req);
            self.self_merge(offset);
        } else if self
            .prev_pos
            .map(|p| offset.saturating_sub((p / 512) as usize) <= 1)
            .unwrap_or(false)
        {
            self.initial(offset, req);
            self.self_merge(offset);
        } else {
            // Random access: issue a plain read-ahead without touching
            // the state machine.
            do_readahead(source, offset, req, 0);
            return;
        }

        let lookahead = self.size.saturating_sub(self.async_size);
        do_readahead(source, self.start, self.size, lookahead);
    }

    /// The synchronous entry point, called once per read loop with the
    /// sector the caller is about to read and how many sectors it asked
    /// for.
    pub fn sync_readahead(&mut self, source: &impl Source, offset: usize, req: usize) {
        if self.ra_pages == 0 {
            return;
        }
        self.dispatch(source, offset, req, false);
    }

    /// The asynchronous entry point: called when the sector being read
    /// carries the cache's read-ahead marker. Clears the marker on that
    /// sector before re-running the decision tree in marker-hit mode.
    pub fn async_readahead(&mut self, source: &impl Source, offset: usize, req: usize) {
        if self.ra_pages == 0 {
            return;
        }
        source.clear_marker(offset);
        self.dispatch(source, offset, req, true);
    }

    /// Records the absolute byte position of the read that just
    /// completed; used by the decision tree's "near sequential" check on
    /// the next call.
    pub fn note_read(&mut self, end_byte_pos: u64) {
        self.prev_pos = Some(end_byte_pos);
    }
}
