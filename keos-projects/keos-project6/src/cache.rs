//! Buffer cache: bounded capacity, dirty-writeback, eviction under one
//! lock, and a background periodic flush.
//!
//! Two indices are kept in lockstep under a single cache lock: a hash map
//! from sector number to slot id, and a recency queue (LRU-ish: touched
//! entries move to the tail) used to pick an eviction victim. All
//! structural mutation -- insertion, eviction, capacity accounting --
//! happens under that lock.
//!
//! The original teaching-kernel cache drops its lock between miss
//! detection and insertion, which lets two threads race and create two
//! entries for the same sector, and checks capacity via an unlocked size
//! read. Both are fixed here: the lock is held continuously from
//! miss-detection through slot reservation, a reserved-but-unread slot is
//! marked [`Loading`](SlotState::Loading), and a second thread that looks
//! up the same sector while it is loading spins on the lock rather than
//! racing a second insertion.

use crate::block::{BlockDevice, Sector, SectorBuf};
use crate::config::SECTOR_SIZE;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use keos::error::{Error, Result};
use keos::sync::SpinLock;
use keos::{kdebug, kwarn};

/// Identifies the thread (or process) that last touched a cache entry.
///
/// A weak identifier rather than a direct pointer, so that teardown can
/// walk the cache and evict everything owned by a departing owner (see
/// [`BufferCache::evict_owner`]) without the cache holding a live
/// reference into thread state.
pub type OwnerId = u64;

#[derive(PartialEq, Eq, Clone, Copy)]
enum SlotState {
    /// Reserved, awaiting its initial disk read.
    Loading,
    /// Holds a valid copy of its sector's contents.
    Ready,
}

struct Slot {
    sector: u32,
    buf: SectorBuf,
    dirty: bool,
    in_use: u32,
    marker: bool,
    owner: Option<OwnerId>,
    state: SlotState,
}

struct Inner {
    slots: Vec<Option<Slot>>,
    index: BTreeMap<u32, usize>,
    recency: VecDeque<usize>,
    free_slots: Vec<usize>,
    capacity: usize,
}

impl Inner {
    fn touch(&mut self, slot_id: usize) {
        if let Some(pos) = self.recency.iter().position(|&s| s == slot_id) {
            self.recency.remove(pos);
        }
        self.recency.push_back(slot_id);
    }
}

/// A bounded cache of device sectors.
pub struct BufferCache<D: BlockDevice> {
    device: Arc<D>,
    inner: SpinLock<Inner>,
    ticks_since_flush: SpinLock<u64>,
}

impl<D: BlockDevice> BufferCache<D> {
    /// Creates a cache over `device` holding at most [`crate::config::CACHE_SIZE`]
    /// sectors at once.
    pub fn new(device: Arc<D>) -> Self {
        Self::with_capacity(device, crate::config::CACHE_SIZE)
    }

    /// Creates a cache with an explicit capacity, for tests that want to
    /// exercise eviction without allocating a full-size cache.
    pub fn with_capacity(device: Arc<D>, capacity: usize) -> Self {
        Self {
            device,
            inner: SpinLock::new(Inner {
                slots: (0..capacity).map(|_| None).collect(),
                index: BTreeMap::new(),
                recency: VecDeque::new(),
                free_slots: (0..capacity).collect(),
                capacity,
            }),
            ticks_since_flush: SpinLock::new(0),
        }
    }

    /// Returns a pinned entry whose buffer holds sector `sn`, reading it
    /// from disk on a miss. Fails only when the cache is at capacity and
    /// every entry is pinned (`in_use`), so no eviction victim exists.
    pub fn get(&self, sn: u32, owner: OwnerId) -> Result<CacheEntry<'_, D>> {
        loop {
            let mut guard = self.inner.lock();
            if let Some(&slot_id) = guard.index.get(&sn) {
                let loading = guard.slots[slot_id].as_ref().unwrap().state == SlotState::Loading;
                if loading {
                    guard.unlock();
                    core::hint::spin_loop();
                    continue;
                }
                guard.touch(slot_id);
                let slot = guard.slots[slot_id].as_mut().unwrap();
                slot.in_use += 1;
                slot.owner = Some(owner);
                guard.unlock();
                return Ok(CacheEntry {
                    cache: self,
                    slot_id,
                });
            }

            // Miss: reserve a slot for `sn` while still holding the lock.
            let slot_id = match guard.free_slots.pop() {
                Some(id) => id,
                None => match self.evict_locked(&mut guard) {
                    Some(id) => id,
                    None => {
                        guard.unlock();
                        kwarn!("cache: full and every entry pinned, cannot admit sector {sn}");
                        return Err(Error::ResourceExhausted);
                    }
                },
            };
            guard.slots[slot_id] = Some(Slot {
                sector: sn,
                buf: [0u8; SECTOR_SIZE],
                dirty: false,
                in_use: 1,
                marker: false,
                owner: Some(owner),
                state: SlotState::Loading,
            });
            guard.index.insert(sn, slot_id);
            guard.recency.push_back(slot_id);
            guard.unlock();

            let mut buf = [0u8; SECTOR_SIZE];
            self.device.read(Sector(sn), &mut buf)?;

            let mut guard = self.inner.lock();
            let slot = guard.slots[slot_id].as_mut().unwrap();
            slot.buf = buf;
            slot.state = SlotState::Ready;
            guard.unlock();

            return Ok(CacheEntry {
                cache: self,
                slot_id,
            });
        }
    }

    /// Picks an eviction victim (first non-pinned entry from the
    /// recency head), writes it back if dirty, and returns its slot id
    /// ready for reuse. Returns `None` if every entry is pinned.
    fn evict_locked(&self, guard: &mut keos::sync::SpinLockGuard<'_, Inner>) -> Option<usize> {
        let victim_pos = guard
            .recency
            .iter()
            .position(|&id| guard.slots[id].as_ref().unwrap().in_use == 0)?;
        let slot_id = guard.recency.remove(victim_pos).unwrap();
        let sector = {
            let slot = guard.slots[slot_id].as_ref().unwrap();
            slot.sector
        };
        let dirty = guard.slots[slot_id].as_ref().unwrap().dirty;
        if dirty {
            let buf = guard.slots[slot_id].as_ref().unwrap().buf;
            // Synchronous device I/O performed while holding the cache
            // lock: no other cache operation may interleave a
            // dirty-entry observation for this sector during eviction.
            let _ = self.device.write(Sector(sector), &buf);
        }
        kdebug!("cache: evicting sector {sector} (dirty={dirty})");
        guard.index.remove(&sector);
        guard.slots[slot_id] = None;
        Some(slot_id)
    }

    fn unpin(&self, slot_id: usize) {
        let mut guard = self.inner.lock();
        if let Some(slot) = guard.slots[slot_id].as_mut() {
            slot.in_use = slot.in_use.saturating_sub(1);
        }
        guard.unlock();
    }

    /// Copies `size` bytes starting at byte offset `off` within sector
    /// `sn` into `buf`.
    pub fn read(&self, sn: u32, buf: &mut [u8], off: usize, size: usize, owner: OwnerId) -> Result<()> {
        let entry = self.get(sn, owner)?;
        entry.with(|s| buf[..size].copy_from_slice(&s[off..off + size]));
        Ok(())
    }

    /// Copies `size` bytes from `buf` into sector `sn` at byte offset
    /// `off`, marking the entry dirty.
    pub fn write(&self, sn: u32, buf: &[u8], off: usize, size: usize, owner: OwnerId) -> Result<()> {
        let entry = self.get(sn, owner)?;
        entry.with_mut(|s| s[off..off + size].copy_from_slice(&buf[..size]));
        Ok(())
    }

    /// Reads a little-endian `u32` at byte offset `pos` within sector `sn`.
    pub fn read_u32_at(&self, sn: u32, pos: usize, owner: OwnerId) -> Result<u32> {
        let entry = self.get(sn, owner)?;
        let bytes: [u8; 4] = entry.with(|s| s[pos..pos + 4].try_into().unwrap());
        Ok(u32::from_le_bytes(bytes))
    }

    /// Writes a little-endian `u32` at byte offset `pos` within sector `sn`.
    pub fn write_u32_at(&self, sn: u32, pos: usize, v: u32, owner: OwnerId) -> Result<()> {
        let entry = self.get(sn, owner)?;
        entry.with_mut(|s| s[pos..pos + 4].copy_from_slice(&v.to_le_bytes()));
        Ok(())
    }

    /// Fills `size` bytes starting at `off` within sector `sn` with `byte`.
    pub fn memset(&self, sn: u32, byte: u8, off: usize, size: usize, owner: OwnerId) -> Result<()> {
        let entry = self.get(sn, owner)?;
        entry.with_mut(|s| s[off..off + size].fill(byte));
        Ok(())
    }

    /// Removes sector `sn` from the cache, writing it back first if dirty.
    /// After this call, no lookup of `sn` returns an entry.
    pub fn free(&self, sn: u32) {
        let mut guard = self.inner.lock();
        if let Some(slot_id) = guard.index.remove(&sn) {
            let (dirty, buf) = {
                let slot = guard.slots[slot_id].as_ref().unwrap();
                (slot.dirty, slot.buf)
            };
            if dirty {
                let _ = self.device.write(Sector(sn), &buf);
            }
            if let Some(pos) = guard.recency.iter().position(|&s| s == slot_id) {
                guard.recency.remove(pos);
            }
            guard.slots[slot_id] = None;
            guard.free_slots.push(slot_id);
        }
        guard.unlock();
    }

    /// Writes every dirty entry back to disk and clears its dirty bit;
    /// entries remain cached. Called periodically by the write-behind
    /// task and once at shutdown.
    pub fn flush(&self) {
        let mut guard = self.inner.lock();
        let capacity = guard.capacity;
        let mut written = 0u32;
        for slot_id in 0..capacity {
            if let Some(slot) = guard.slots[slot_id].as_mut() {
                if slot.dirty {
                    let _ = self.device.write(Sector(slot.sector), &slot.buf);
                    slot.dirty = false;
                    written += 1;
                }
            }
        }
        guard.unlock();
        if written > 0 {
            kdebug!("cache: flush wrote back {written} dirty entr(ies)");
        }
    }

    /// Writes back and discards every entry whose last toucher is
    /// `owner`. Used at process teardown.
    pub fn evict_owner(&self, owner: OwnerId) {
        let mut guard = self.inner.lock();
        let capacity = guard.capacity;
        let mut to_remove = Vec::new();
        for slot_id in 0..capacity {
            if let Some(slot) = &guard.slots[slot_id] {
                if slot.owner == Some(owner) && slot.state == SlotState::Ready {
                    to_remove.push((slot_id, slot.sector, slot.dirty, slot.buf));
                }
            }
        }
        for (slot_id, sector, dirty, buf) in to_remove {
            if dirty {
                let _ = self.device.write(Sector(sector), &buf);
            }
            guard.index.remove(&sector);
            if let Some(pos) = guard.recency.iter().position(|&s| s == slot_id) {
                guard.recency.remove(pos);
            }
            guard.slots[slot_id] = None;
            guard.free_slots.push(slot_id);
        }
        guard.unlock();
    }

    /// True if sector `sn` is cached and carries the read-ahead marker.
    pub fn is_marker(&self, sn: u32) -> bool {
        let guard = self.inner.lock();
        let v = guard
            .index
            .get(&sn)
            .and_then(|&id| guard.slots[id].as_ref())
            .map(|s| s.marker)
            .unwrap_or(false);
        guard.unlock();
        v
    }

    /// Sets the read-ahead marker on sector `sn`, if cached. Advisory: a
    /// no-op if `sn` is not cached.
    pub fn set_marker(&self, sn: u32) {
        let mut guard = self.inner.lock();
        if let Some(&id) = guard.index.get(&sn) {
            if let Some(slot) = guard.slots[id].as_mut() {
                slot.marker = true;
            }
        }
        guard.unlock();
    }

    /// Clears the read-ahead marker on sector `sn`, if cached.
    pub fn clear_marker(&self, sn: u32) {
        let mut guard = self.inner.lock();
        if let Some(&id) = guard.index.get(&sn) {
            if let Some(slot) = guard.slots[id].as_mut() {
                slot.marker = false;
            }
        }
        guard.unlock();
    }

    /// True if sector `sn` currently has a cache entry (used by read-ahead
    /// to test for an already-cached sector without pinning it).
    pub fn contains(&self, sn: u32) -> bool {
        let guard = self.inner.lock();
        let v = guard.index.contains_key(&sn);
        guard.unlock();
        v
    }

    /// Advances the write-behind timer by one tick; flushes once
    /// [`crate::config::WRITE_BEHIND_PERIOD_TICKS`] have elapsed since the
    /// last flush. The host's timer-interrupt path calls this once per
    /// tick; no thread or scheduler integration happens inside this crate.
    pub fn on_timer_tick(&self) {
        let mut ticks = self.ticks_since_flush.lock();
        *ticks += 1;
        if *ticks >= crate::config::WRITE_BEHIND_PERIOD_TICKS {
            *ticks = 0;
            ticks.unlock();
            self.flush();
        } else {
            ticks.unlock();
        }
    }
}

/// A pinned reference to a cached sector.
///
/// While this guard is alive, the underlying entry cannot be chosen as an
/// eviction victim. Dropping it releases the pin.
pub struct CacheEntry<'a, D: BlockDevice> {
    cache: &'a BufferCache<D>,
    slot_id: usize,
}

impl<'a, D: BlockDevice> CacheEntry<'a, D> {
    /// Runs `f` against the cached sector's bytes, under the cache lock.
    pub fn with<R>(&self, f: impl FnOnce(&SectorBuf) -> R) -> R {
        let guard = self.cache.inner.lock();
        let r = f(&guard.slots[self.slot_id].as_ref().unwrap().buf);
        guard.unlock();
        r
    }

    /// Runs `f` against the cached sector's bytes mutably, under the
    /// cache lock, and marks the entry dirty: its buffer may now differ
    /// from disk.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut SectorBuf) -> R) -> R {
        let mut guard = self.cache.inner.lock();
        let slot = guard.slots[self.slot_id].as_mut().unwrap();
        let r = f(&mut slot.buf);
        slot.dirty = true;
        guard.unlock();
        r
    }

    /// Marks this entry dirty without touching its bytes (used when the
    /// caller already mutated the buffer through another handle, e.g. the
    /// inode engine zero-filling a freshly allocated sector).
    pub fn mark_dirty(&self) {
        let mut guard = self.cache.inner.lock();
        guard.slots[self.slot_id].as_mut().unwrap().dirty = true;
        guard.unlock();
    }

    /// The sector number this entry caches.
    pub fn sector(&self) -> u32 {
        let guard = self.cache.inner.lock();
        let s = guard.slots[self.slot_id].as_ref().unwrap().sector;
        guard.unlock();
        s
    }
}

impl<D: BlockDevice> Drop for CacheEntry<'_, D> {
    fn drop(&mut self) {
        self.cache.unpin(self.slot_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;

    fn cache(capacity: usize, sectors: u32) -> BufferCache<MemBlockDevice> {
        BufferCache::with_capacity(Arc::new(MemBlockDevice::new(sectors)), capacity)
    }

    #[test]
    fn miss_then_hit_reads_same_content() {
        let c = cache(4, 8);
        c.write(0, &[5u8; SECTOR_SIZE], 0, SECTOR_SIZE, 1).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        c.read(0, &mut buf, 0, SECTOR_SIZE, 1).unwrap();
        assert_eq!(buf, [5u8; SECTOR_SIZE]);
    }

    #[test]
    fn flush_clears_dirty_bit() {
        let c = cache(4, 8);
        c.write(1, &[9u8; SECTOR_SIZE], 0, SECTOR_SIZE, 1).unwrap();
        c.flush();
        let guard = c.inner.lock();
        let slot_id = *guard.index.get(&1).unwrap();
        assert!(!guard.slots[slot_id].as_ref().unwrap().dirty);
        guard.unlock();
    }

    #[test]
    fn eviction_writes_back_dirty_entry() {
        let c = cache(2, 8);
        c.write(0, &[1u8; SECTOR_SIZE], 0, SECTOR_SIZE, 1).unwrap();
        c.write(1, &[2u8; SECTOR_SIZE], 0, SECTOR_SIZE, 1).unwrap();
        // Capacity 2, both entries unpinned (guards dropped already):
        // fetching a third sector evicts one of them, writing it back.
        c.write(2, &[3u8; SECTOR_SIZE], 0, SECTOR_SIZE, 1).unwrap();
        c.free(0);
        c.free(1);
        c.free(2);
        let mut buf0 = [0u8; SECTOR_SIZE];
        c.read(0, &mut buf0, 0, SECTOR_SIZE, 1).unwrap();
        assert_eq!(buf0, [1u8; SECTOR_SIZE]);
    }

    #[test]
    fn full_cache_with_every_entry_pinned_fails_without_evicting() {
        let c = cache(1, 4);
        let pinned = c.get(0, 1).unwrap();
        assert_eq!(c.get(1, 1).map(|_| ()), Err(Error::ResourceExhausted));
        drop(pinned);
        assert!(c.get(1, 1).is_ok());
    }

    #[test]
    fn markers_are_advisory_and_sticky_until_cleared() {
        let c = cache(4, 4);
        c.get(0, 1).unwrap();
        assert!(!c.is_marker(0));
        c.set_marker(0);
        assert!(c.is_marker(0));
        c.clear_marker(0);
        assert!(!c.is_marker(0));
    }
}
