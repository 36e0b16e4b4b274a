//! Supplemental page table: per-process bookkeeping of where a virtual
//! page's contents live when the page is not resident in a physical
//! frame.
//!
//! A page's [`Position`] records every backing source that currently
//! applies to it. `FILE` and `STACK` pages start out absent and get their
//! initial contents from a file or from a zero-fill; either can later
//! gain `SWAP` once evicted. `MMAPFILE` pages are never swapped --
//! instead a dirty mapped page is written back to its file on eviction --
//! so `MMAPFILE` and `SWAP` never appear together on the same entry; see
//! [`SupPageEntry::assert_consistent`].

use crate::inode::Inode;
use crate::block::BlockDevice;
use crate::swap::SwapSlot;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use keos::error::{Error, Result};
use keos::sync::SpinLock;

bitflags! {
    /// Which backing source(s) currently apply to a virtual page.
    pub struct Position: u8 {
        /// Backed by a read-only region of an executable's file (demand
        /// loaded, never written back).
        const FILE = 0b0001;
        /// Backed by a memory-mapped file (read and write back on
        /// eviction if dirty).
        const MMAPFILE = 0b0010;
        /// An anonymous stack page (zero-fill on first fault).
        const STACK = 0b0100;
        /// Currently swapped out; `swap_slot` names where.
        const SWAP = 0b1000;
    }
}

/// Virtual page number: a user address with the page offset bits
/// stripped.
pub type Upage = usize;

/// One virtual page's backing-source record.
pub struct SupPageEntry<D: BlockDevice> {
    /// Every backing source that currently applies.
    pub position: Position,
    /// Whether the page may be written (a read-only code page is not).
    pub writable: bool,
    /// Whether the page is currently resident in a physical frame.
    pub loaded: bool,
    /// The backing file, for `FILE` and `MMAPFILE` entries.
    pub inode: Option<Arc<Inode<D>>>,
    /// Byte offset into `inode` where this page's data starts.
    pub file_offset: u32,
    /// Bytes to read from `inode` before zero-filling the rest of the
    /// page.
    pub read_bytes: u32,
    /// Bytes of this page to zero-fill after `read_bytes`.
    pub zero_bytes: u32,
    /// The swap slot holding this page's contents, once `SWAP` is set.
    pub swap_slot: Option<SwapSlot>,
}

impl<D: BlockDevice> Clone for SupPageEntry<D> {
    fn clone(&self) -> Self {
        Self {
            position: self.position,
            writable: self.writable,
            loaded: self.loaded,
            inode: self.inode.clone(),
            file_offset: self.file_offset,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
            swap_slot: self.swap_slot,
        }
    }
}

impl<D: BlockDevice> SupPageEntry<D> {
    fn assert_consistent(&self) {
        debug_assert!(
            !(self.position.contains(Position::MMAPFILE) && self.position.contains(Position::SWAP)),
            "a memory-mapped page is never also swapped out"
        );
    }
}

/// A process's supplemental page table: virtual page number to backing
/// source.
pub struct SupPageTable<D: BlockDevice> {
    entries: SpinLock<BTreeMap<Upage, SupPageEntry<D>>>,
}

impl<D: BlockDevice> SupPageTable<D> {
    /// An empty table, as created for a freshly loaded process.
    pub fn new() -> Self {
        Self {
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Registers `upage` as backed by a read-only region of `inode`,
    /// loaded on first fault and never written back.
    pub fn add_file(
        &self,
        upage: Upage,
        inode: Arc<Inode<D>>,
        file_offset: u32,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> Result<()> {
        self.insert_new(
            upage,
            SupPageEntry {
                position: Position::FILE,
                writable,
                loaded: false,
                inode: Some(inode),
                file_offset,
                read_bytes,
                zero_bytes,
                swap_slot: None,
            },
        )
    }

    /// Registers `upage` as backed by a memory-mapped file region;
    /// always writable, and written back to `inode` (rather than
    /// swapped) if dirty at eviction.
    pub fn add_mmap(
        &self,
        upage: Upage,
        inode: Arc<Inode<D>>,
        file_offset: u32,
        read_bytes: u32,
        zero_bytes: u32,
    ) -> Result<()> {
        self.insert_new(
            upage,
            SupPageEntry {
                position: Position::MMAPFILE,
                writable: true,
                loaded: false,
                inode: Some(inode),
                file_offset,
                read_bytes,
                zero_bytes,
                swap_slot: None,
            },
        )
    }

    /// Registers `upage` as an anonymous, zero-fill-on-demand stack page.
    pub fn add_stack(&self, upage: Upage) -> Result<()> {
        self.insert_new(
            upage,
            SupPageEntry {
                position: Position::STACK,
                writable: true,
                loaded: false,
                inode: None,
                file_offset: 0,
                read_bytes: 0,
                zero_bytes: crate::config::PGSIZE as u32,
                swap_slot: None,
            },
        )
    }

    fn insert_new(&self, upage: Upage, entry: SupPageEntry<D>) -> Result<()> {
        entry.assert_consistent();
        let mut guard = self.entries.lock();
        if guard.contains_key(&upage) {
            guard.unlock();
            return Err(Error::InvalidArgument);
        }
        guard.insert(upage, entry);
        guard.unlock();
        Ok(())
    }

    /// Looks up `upage`'s current backing-source record.
    pub fn find(&self, upage: Upage) -> Option<SupPageEntry<D>> {
        let guard = self.entries.lock();
        let entry = guard.get(&upage).cloned();
        guard.unlock();
        entry
    }

    /// Removes `upage`'s record entirely, returning it if present.
    pub fn delete(&self, upage: Upage) -> Option<SupPageEntry<D>> {
        let mut guard = self.entries.lock();
        let entry = guard.remove(&upage);
        guard.unlock();
        entry
    }

    /// Marks `upage` resident or not, leaving its backing source alone.
    pub fn set_loaded(&self, upage: Upage, loaded: bool) {
        let mut guard = self.entries.lock();
        if let Some(entry) = guard.get_mut(&upage) {
            entry.loaded = loaded;
        }
        guard.unlock();
    }

    /// Records that `upage` was evicted to `slot`: sets `SWAP`, clears
    /// `loaded`. Never called for an `MMAPFILE` entry -- those write back
    /// to their file instead.
    pub fn set_swapped(&self, upage: Upage, slot: SwapSlot) {
        let mut guard = self.entries.lock();
        if let Some(entry) = guard.get_mut(&upage) {
            debug_assert!(!entry.position.contains(Position::MMAPFILE));
            entry.position.insert(Position::SWAP);
            entry.swap_slot = Some(slot);
            entry.loaded = false;
        }
        guard.unlock();
    }

    /// Records that `upage` was swapped back in: clears `SWAP` and the
    /// slot, sets `loaded`.
    pub fn clear_swapped(&self, upage: Upage) {
        let mut guard = self.entries.lock();
        if let Some(entry) = guard.get_mut(&upage) {
            entry.position.remove(Position::SWAP);
            entry.swap_slot = None;
            entry.loaded = true;
        }
        guard.unlock();
    }

    /// Drains every entry, for use when a process exits: the caller is
    /// responsible for freeing any swap slots and unmapping any loaded
    /// frames the drained entries reference.
    pub fn free_all(&self) -> Vec<(Upage, SupPageEntry<D>)> {
        let mut guard = self.entries.lock();
        let drained: Vec<_> = core::mem::take(&mut *guard).into_iter().collect();
        guard.unlock();
        drained
    }
}

impl<D: BlockDevice> Default for SupPageTable<D> {
    fn default() -> Self {
        Self::new()
    }
}
