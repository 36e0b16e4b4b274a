//! On-disk inodes: a 512-byte header per file, a 12-entry direct pointer
//! array plus one single- and one double-indirect block, sparse (hole)
//! semantics for never-written regions, and the read/write paths that
//! drive the buffer cache and the read-ahead state machine.
//!
//! Every inode lives at a fixed sector number (its "inode sector") for
//! its whole life; growth never moves it. [`InodeTable`] is the
//! process-wide registry that guarantees at most one in-memory [`Inode`]
//! exists per sector number at a time, so two callers opening the same
//! file observe the same length, the same deny-write count, and the same
//! pointer tree.

use crate::block::{BlockDevice, Sector, SectorBuf};
use crate::cache::{BufferCache, OwnerId};
use crate::config::{
    DIRECT_POINTERS, INDIRECT_FANOUT, INODE_MAGIC, INODE_POINTER_SLOTS, SECTOR_SIZE,
};
use crate::freemap::FreeMap;
use crate::readahead::{RaState, Source as RaSource};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use keos::error::{Error, Result};
use keos::sync::SpinLock;
use keos::{kdebug, kerror, kwarn};

// On-disk layout, per the external-interface table: the pointer array
// comes first, then length, then a reserved slot standing in for the
// in-memory advisory lock (on disk always zero), then the type tag, then
// the magic; the rest of the sector is zero padding.
const POINTERS_OFFSET: usize = 0;
const LENGTH_OFFSET: usize = INODE_POINTER_SLOTS * 4;
const RESERVED_OFFSET: usize = LENGTH_OFFSET + 4;
const TYPE_OFFSET: usize = RESERVED_OFFSET + 4;
const MAGIC_OFFSET: usize = TYPE_OFFSET + 4;
const HEADER_BYTES: usize = MAGIC_OFFSET + 4;

/// What an inode sector holds: a regular file's data, or a directory's
/// entry list. Directory-name parsing itself is an external collaborator
/// (see [`crate`] docs) -- this crate only stamps and round-trips the tag,
/// it never interprets a directory inode's bytes as entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    /// A directory's entry list.
    Dir,
    /// A regular file's data.
    File,
}

impl InodeKind {
    fn encode(self) -> u32 {
        match self {
            InodeKind::Dir => 0,
            InodeKind::File => 1,
        }
    }

    fn decode(v: u32) -> Result<Self> {
        match v {
            0 => Ok(InodeKind::Dir),
            1 => Ok(InodeKind::File),
            _ => {
                kerror!("inode: invalid on-disk type tag {v}");
                Err(Error::InvariantViolation("inode type tag out of range"))
            }
        }
    }
}

/// The fixed-size on-disk inode header.
///
/// `sectors[0..DIRECT_POINTERS]` are direct data sectors,
/// `sectors[DIRECT_POINTERS]` is the single-indirect block, and
/// `sectors[DIRECT_POINTERS + 1]` is the double-indirect block. A zero
/// entry anywhere in the pointer tree means "never written" (a hole);
/// sector 0 is never a legitimate data sector since it is permanently
/// reserved for the free map, so it doubles safely as the sentinel.
#[derive(Debug, Clone)]
pub struct InodeDisk {
    /// File length in bytes.
    pub length: u32,
    /// FILE or DIR; see [`InodeKind`].
    pub kind: InodeKind,
    /// Direct, single-indirect (slot 12), and double-indirect (slot 13)
    /// pointers.
    pub sectors: [u32; INODE_POINTER_SLOTS],
}

impl InodeDisk {
    fn new_empty(kind: InodeKind) -> Self {
        Self {
            length: 0,
            kind,
            sectors: [0; INODE_POINTER_SLOTS],
        }
    }

    fn encode(&self) -> SectorBuf {
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, s) in self.sectors.iter().enumerate() {
            let o = POINTERS_OFFSET + i * 4;
            buf[o..o + 4].copy_from_slice(&s.to_le_bytes());
        }
        buf[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&self.length.to_le_bytes());
        // RESERVED_OFFSET..TYPE_OFFSET stands in for the in-memory advisory
        // lock; left zeroed, there is nothing to persist for it.
        buf[TYPE_OFFSET..TYPE_OFFSET + 4].copy_from_slice(&self.kind.encode().to_le_bytes());
        buf[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&INODE_MAGIC.to_le_bytes());
        buf
    }

    fn decode(buf: &SectorBuf) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[MAGIC_OFFSET..MAGIC_OFFSET + 4].try_into().unwrap());
        if magic != INODE_MAGIC {
            kerror!("inode: magic mismatch, found {magic:#x}, expected {INODE_MAGIC:#x}");
            return Err(Error::InvariantViolation("inode magic mismatch"));
        }
        let length = u32::from_le_bytes(buf[LENGTH_OFFSET..LENGTH_OFFSET + 4].try_into().unwrap());
        let kind = InodeKind::decode(u32::from_le_bytes(
            buf[TYPE_OFFSET..TYPE_OFFSET + 4].try_into().unwrap(),
        ))?;
        let mut sectors = [0u32; INODE_POINTER_SLOTS];
        for (i, s) in sectors.iter_mut().enumerate() {
            let o = POINTERS_OFFSET + i * 4;
            *s = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        }
        Ok(Self { length, kind, sectors })
    }

    fn sector_count(&self) -> usize {
        (self.length as usize).div_ceil(SECTOR_SIZE)
    }
}

const _: () = assert!(HEADER_BYTES <= SECTOR_SIZE);

/// One sector's worth of indirect pointers.
struct IndirectBlock {
    entries: [u32; INDIRECT_FANOUT],
}

impl IndirectBlock {
    fn empty() -> Self {
        Self {
            entries: [0; INDIRECT_FANOUT],
        }
    }

    fn encode(&self) -> SectorBuf {
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, e) in self.entries.iter().enumerate() {
            let o = i * 4;
            buf[o..o + 4].copy_from_slice(&e.to_le_bytes());
        }
        buf
    }

    fn decode(buf: &SectorBuf) -> Self {
        let mut entries = [0u32; INDIRECT_FANOUT];
        for (i, e) in entries.iter_mut().enumerate() {
            let o = i * 4;
            *e = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        }
        Self { entries }
    }
}

crate::const_assert_sector_sized!(IndirectBlock);

/// Resolves logical sector `index` against `disk` without allocating.
/// Returns `None` for a hole (never written).
fn find_sector<D: BlockDevice>(
    disk: &InodeDisk,
    index: usize,
    cache: &BufferCache<D>,
    owner: OwnerId,
) -> Result<Option<u32>> {
    if index < DIRECT_POINTERS {
        let s = disk.sectors[index];
        return Ok(if s == 0 { None } else { Some(s) });
    }
    let index = index - DIRECT_POINTERS;
    if index < INDIRECT_FANOUT {
        let indirect_sn = disk.sectors[DIRECT_POINTERS];
        if indirect_sn == 0 {
            return Ok(None);
        }
        let block = read_indirect(cache, indirect_sn, owner)?;
        let s = block.entries[index];
        return Ok(if s == 0 { None } else { Some(s) });
    }
    let index = index - INDIRECT_FANOUT;
    let outer_idx = index / INDIRECT_FANOUT;
    let inner_idx = index % INDIRECT_FANOUT;
    let doubly_sn = disk.sectors[DIRECT_POINTERS + 1];
    if doubly_sn == 0 {
        return Ok(None);
    }
    let outer = read_indirect(cache, doubly_sn, owner)?;
    let inner_sn = outer.entries[outer_idx];
    if inner_sn == 0 {
        return Ok(None);
    }
    let inner = read_indirect(cache, inner_sn, owner)?;
    let s = inner.entries[inner_idx];
    Ok(if s == 0 { None } else { Some(s) })
}

fn read_indirect<D: BlockDevice>(
    cache: &BufferCache<D>,
    sn: u32,
    owner: OwnerId,
) -> Result<IndirectBlock> {
    let entry = cache.get(sn, owner)?;
    Ok(entry.with(|buf| IndirectBlock::decode(buf)))
}

fn write_indirect<D: BlockDevice>(
    cache: &BufferCache<D>,
    sn: u32,
    block: &IndirectBlock,
    owner: OwnerId,
) -> Result<()> {
    let entry = cache.get(sn, owner)?;
    entry.with_mut(|buf| *buf = block.encode());
    Ok(())
}

/// Allocates (if necessary) and returns the physical sector for logical
/// `index`, eagerly materialising any indirect block the path passes
/// through. On allocation failure partway through a multi-sector path,
/// every sector allocated by this call is released before returning the
/// error, so a failed extend never leaks sectors into the free map.
fn ensure_sector<D: BlockDevice>(
    disk: &mut InodeDisk,
    index: usize,
    cache: &BufferCache<D>,
    freemap: &dyn FreeMap,
    owner: OwnerId,
) -> Result<u32> {
    let mut rollback: alloc::vec::Vec<u32> = alloc::vec::Vec::new();
    let result = ensure_sector_inner(disk, index, cache, freemap, owner, &mut rollback);
    if result.is_err() {
        kwarn!("inode: allocation failed at logical sector {index}, rolling back {} sector(s)", rollback.len());
        for sn in rollback {
            freemap.release(sn, 1);
        }
    }
    result
}

fn alloc_zeroed<D: BlockDevice>(
    cache: &BufferCache<D>,
    freemap: &dyn FreeMap,
    owner: OwnerId,
    rollback: &mut alloc::vec::Vec<u32>,
) -> Result<u32> {
    let mut sn = 0u32;
    freemap.allocate(1, &mut sn)?;
    rollback.push(sn);
    let entry = cache.get(sn, owner)?;
    entry.with_mut(|buf| *buf = [0u8; SECTOR_SIZE]);
    Ok(sn)
}

fn ensure_sector_inner<D: BlockDevice>(
    disk: &mut InodeDisk,
    index: usize,
    cache: &BufferCache<D>,
    freemap: &dyn FreeMap,
    owner: OwnerId,
    rollback: &mut alloc::vec::Vec<u32>,
) -> Result<u32> {
    if index < DIRECT_POINTERS {
        if disk.sectors[index] == 0 {
            disk.sectors[index] = alloc_zeroed(cache, freemap, owner, rollback)?;
        }
        return Ok(disk.sectors[index]);
    }
    let index = index - DIRECT_POINTERS;
    if index < INDIRECT_FANOUT {
        if disk.sectors[DIRECT_POINTERS] == 0 {
            disk.sectors[DIRECT_POINTERS] = alloc_zeroed(cache, freemap, owner, rollback)?;
        }
        let indirect_sn = disk.sectors[DIRECT_POINTERS];
        let mut block = read_indirect(cache, indirect_sn, owner)?;
        if block.entries[index] == 0 {
            block.entries[index] = alloc_zeroed(cache, freemap, owner, rollback)?;
            write_indirect(cache, indirect_sn, &block, owner)?;
        }
        return Ok(block.entries[index]);
    }
    let index = index - INDIRECT_FANOUT;
    let outer_idx = index / INDIRECT_FANOUT;
    let inner_idx = index % INDIRECT_FANOUT;
    if disk.sectors[DIRECT_POINTERS + 1] == 0 {
        disk.sectors[DIRECT_POINTERS + 1] = alloc_zeroed(cache, freemap, owner, rollback)?;
    }
    let doubly_sn = disk.sectors[DIRECT_POINTERS + 1];
    let mut outer = read_indirect(cache, doubly_sn, owner)?;
    if outer.entries[outer_idx] == 0 {
        outer.entries[outer_idx] = alloc_zeroed(cache, freemap, owner, rollback)?;
        write_indirect(cache, doubly_sn, &outer, owner)?;
    }
    let inner_sn = outer.entries[outer_idx];
    let mut inner = read_indirect(cache, inner_sn, owner)?;
    if inner.entries[inner_idx] == 0 {
        inner.entries[inner_idx] = alloc_zeroed(cache, freemap, owner, rollback)?;
        write_indirect(cache, inner_sn, &inner, owner)?;
    }
    Ok(inner.entries[inner_idx])
}

/// Releases every sector reachable from `disk`'s pointer tree, including
/// the indirect blocks themselves, then releases the inode's own sector.
fn free_inode<D: BlockDevice>(
    disk: &InodeDisk,
    inode_sn: u32,
    cache: &BufferCache<D>,
    freemap: &dyn FreeMap,
    owner: OwnerId,
) -> Result<()> {
    for &sn in disk.sectors.iter().take(DIRECT_POINTERS) {
        if sn != 0 {
            cache.free(sn);
            freemap.release(sn, 1);
        }
    }
    let indirect_sn = disk.sectors[DIRECT_POINTERS];
    if indirect_sn != 0 {
        let block = read_indirect(cache, indirect_sn, owner)?;
        for &sn in block.entries.iter() {
            if sn != 0 {
                cache.free(sn);
                freemap.release(sn, 1);
            }
        }
        cache.free(indirect_sn);
        freemap.release(indirect_sn, 1);
    }
    let doubly_sn = disk.sectors[DIRECT_POINTERS + 1];
    if doubly_sn != 0 {
        let outer = read_indirect(cache, doubly_sn, owner)?;
        for &outer_sn in outer.entries.iter() {
            if outer_sn == 0 {
                continue;
            }
            let inner = read_indirect(cache, outer_sn, owner)?;
            for &sn in inner.entries.iter() {
                if sn != 0 {
                    cache.free(sn);
                    freemap.release(sn, 1);
                }
            }
            cache.free(outer_sn);
            freemap.release(outer_sn, 1);
        }
        cache.free(doubly_sn);
        freemap.release(doubly_sn, 1);
    }
    cache.free(inode_sn);
    freemap.release(inode_sn, 1);
    Ok(())
}

/// An open in-memory inode.
///
/// The inode header is cached here rather than re-read from the buffer
/// cache on every call: a writer extending the file holds `disk` locked
/// across the whole extend, which is how two concurrent writers appending
/// to the same file serialize without either observing a torn length.
pub struct Inode<D: BlockDevice> {
    sn: u32,
    cache: Arc<BufferCache<D>>,
    freemap: Arc<dyn FreeMap>,
    disk: SpinLock<InodeDisk>,
    open_count: AtomicUsize,
    deny_write_count: AtomicUsize,
    removed: AtomicBool,
    owner: AtomicU64,
}

impl<D: BlockDevice> Inode<D> {
    /// Inode sector number; the identity this inode was opened under.
    pub fn sector(&self) -> u32 {
        self.sn
    }

    /// Current file length in bytes.
    pub fn length(&self) -> u32 {
        self.disk.lock().length
    }

    /// Whether this inode holds a regular file or a directory's entries.
    pub fn kind(&self) -> InodeKind {
        self.disk.lock().kind
    }

    fn owner_id(&self) -> OwnerId {
        self.owner.load(Ordering::Relaxed)
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`, returning
    /// the number of bytes actually read (short on reaching EOF). Holes in
    /// the pointer tree read back as zero without touching the cache.
    pub fn read_at(&self, buf: &mut [u8], offset: u64, ra: &mut RaState) -> Result<usize> {
        let length = self.length() as u64;
        if offset >= length {
            return Ok(0);
        }
        let to_read = buf.len().min((length - offset) as usize);
        let owner = self.owner_id();
        let first_logical = (offset / SECTOR_SIZE as u64) as usize;
        let req_sectors = (to_read + SECTOR_SIZE - 1) / SECTOR_SIZE;
        {
            let source = InodeReadSource { inode: self };
            ra.sync_readahead(&source, first_logical, req_sectors.max(1));
        }

        let mut done = 0usize;
        while done < to_read {
            let pos = offset + done as u64;
            let logical = (pos / SECTOR_SIZE as u64) as usize;
            let within = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - within).min(to_read - done);
            let disk = self.disk.lock();
            let physical = find_sector(&disk, logical, &self.cache, owner)?;
            disk.unlock();
            match physical {
                None => {
                    buf[done..done + chunk].fill(0);
                }
                Some(sn) => {
                    if self.cache.is_marker(sn) {
                        let remaining_sectors = (to_read - done + SECTOR_SIZE - 1) / SECTOR_SIZE;
                        let source = InodeReadSource { inode: self };
                        ra.async_readahead(&source, logical, remaining_sectors.max(1));
                    }
                    let entry = self.cache.get(sn, owner)?;
                    entry.with(|sector_buf| {
                        buf[done..done + chunk].copy_from_slice(&sector_buf[within..within + chunk]);
                    });
                }
            }
            done += chunk;
        }
        ra.note_read(offset + done as u64);
        Ok(done)
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`, the same as
    /// [`Inode::read_at`] but without touching any read-ahead state.
    ///
    /// The page-fault path loads a page's initial contents directly from
    /// its backing file, exactly as the original `file_read_at` call it is
    /// grounded on does -- demand-paged loads are a one-shot extent read,
    /// not a streaming access pattern, so there is no window to adapt.
    pub fn read_at_raw(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let length = self.length() as u64;
        if offset >= length {
            return Ok(0);
        }
        let to_read = buf.len().min((length - offset) as usize);
        let owner = self.owner_id();
        let mut done = 0usize;
        while done < to_read {
            let pos = offset + done as u64;
            let logical = (pos / SECTOR_SIZE as u64) as usize;
            let within = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - within).min(to_read - done);
            let disk = self.disk.lock();
            let physical = find_sector(&disk, logical, &self.cache, owner)?;
            disk.unlock();
            match physical {
                None => buf[done..done + chunk].fill(0),
                Some(sn) => {
                    let entry = self.cache.get(sn, owner)?;
                    entry.with(|sector_buf| {
                        buf[done..done + chunk].copy_from_slice(&sector_buf[within..within + chunk]);
                    });
                }
            }
            done += chunk;
        }
        Ok(done)
    }

    /// Writes `buf` at byte `offset`, extending the file (and zero-filling
    /// any gap before `offset`) if necessary. Fails with
    /// [`Error::InvariantViolation`] if the file currently has deny-write
    /// holders (an open executable image, say).
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if self.deny_write_count.load(Ordering::Acquire) > 0 {
            kdebug!("inode: write to deny-write sector {} dropped", self.sn);
            return Ok(0);
        }
        let owner = self.owner_id();
        let mut disk = self.disk.lock();
        let new_length = offset + buf.len() as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let logical = (pos / SECTOR_SIZE as u64) as usize;
            let within = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - within).min(buf.len() - done);
            let physical = ensure_sector(&mut disk, logical, &self.cache, self.freemap.as_ref(), owner)?;
            let entry = self.cache.get(physical, owner)?;
            entry.with_mut(|sector_buf| {
                sector_buf[within..within + chunk].copy_from_slice(&buf[done..done + chunk]);
            });
            done += chunk;
        }
        // Length is published only after every sector this write touches is
        // fully initialised, so a write that fails partway through never
        // leaves the in-memory (or on-disk) length ahead of what was
        // actually allocated and copied.
        if new_length > disk.length as u64 {
            disk.length = new_length as u32;
        }
        let header_sn = self.sn;
        let encoded = disk.encode();
        disk.unlock();
        let header_entry = self.cache.get(header_sn, owner)?;
        header_entry.with_mut(|sector_buf| *sector_buf = encoded);
        Ok(done)
    }

    /// Increments the deny-write count; while held above zero,
    /// [`Inode::write_at`] fails.
    pub fn deny_write(&self) {
        self.deny_write_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the deny-write count.
    pub fn allow_write(&self) {
        let prev = self.deny_write_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "allow_write without a matching deny_write");
    }

    /// Marks this inode for deletion once the last open handle closes.
    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// True once [`Inode::mark_removed`] has been called.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

struct InodeReadSource<'a, D: BlockDevice> {
    inode: &'a Inode<D>,
}

impl<'a, D: BlockDevice> RaSource for InodeReadSource<'a, D> {
    fn sector_count(&self) -> usize {
        self.inode.disk.lock().sector_count()
    }

    fn is_cached(&self, i: usize) -> bool {
        let disk = self.inode.disk.lock();
        let physical = find_sector(&disk, i, &self.inode.cache, self.inode.owner_id()).ok().flatten();
        disk.unlock();
        match physical {
            Some(sn) => self.inode.cache.contains(sn),
            None => true,
        }
    }

    fn admit(&self, i: usize) {
        let disk = self.inode.disk.lock();
        let physical = find_sector(&disk, i, &self.inode.cache, self.inode.owner_id()).ok().flatten();
        disk.unlock();
        if let Some(sn) = physical {
            let _ = self.inode.cache.get(sn, self.inode.owner_id());
        }
    }

    fn set_marker(&self, i: usize) {
        let disk = self.inode.disk.lock();
        let physical = find_sector(&disk, i, &self.inode.cache, self.inode.owner_id()).ok().flatten();
        disk.unlock();
        if let Some(sn) = physical {
            self.inode.cache.set_marker(sn);
        }
    }

    fn clear_marker(&self, i: usize) {
        let disk = self.inode.disk.lock();
        let physical = find_sector(&disk, i, &self.inode.cache, self.inode.owner_id()).ok().flatten();
        disk.unlock();
        if let Some(sn) = physical {
            self.inode.cache.clear_marker(sn);
        }
    }
}

/// Process-wide registry ensuring at most one in-memory [`Inode`] exists
/// per inode sector number, so two opens of the same file observe the
/// same length, deny-write count, and pointer tree.
pub struct InodeTable<D: BlockDevice> {
    cache: Arc<BufferCache<D>>,
    freemap: Arc<dyn FreeMap>,
    table: SpinLock<BTreeMap<u32, Weak<Inode<D>>>>,
}

impl<D: BlockDevice> InodeTable<D> {
    /// Builds an empty registry over the given cache and free map.
    pub fn new(cache: Arc<BufferCache<D>>, freemap: Arc<dyn FreeMap>) -> Self {
        Self {
            cache,
            freemap,
            table: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Allocates a fresh inode sector, stamps a zero-length regular-file
    /// header onto it, and opens it. Equivalent to
    /// `create_typed(owner, InodeKind::File)`.
    pub fn create(&self, owner: OwnerId) -> Result<Arc<Inode<D>>> {
        self.create_typed(owner, InodeKind::File)
    }

    /// Allocates a fresh inode sector, stamps a zero-length header of the
    /// given [`InodeKind`] onto it, and opens it.
    pub fn create_typed(&self, owner: OwnerId, kind: InodeKind) -> Result<Arc<Inode<D>>> {
        let mut sn = 0u32;
        self.freemap.allocate(1, &mut sn)?;
        let header = InodeDisk::new_empty(kind).encode();
        let entry = match self.cache.get(sn, owner) {
            Ok(entry) => entry,
            Err(e) => {
                self.freemap.release(sn, 1);
                return Err(e);
            }
        };
        entry.with_mut(|buf| *buf = header);
        drop(entry);
        kdebug!("inode: created sector {sn}");
        self.open(sn, owner)
    }

    /// Opens the inode at `sn`, returning the single shared instance if
    /// one is already open.
    pub fn open(&self, sn: u32, owner: OwnerId) -> Result<Arc<Inode<D>>> {
        let mut table = self.table.lock();
        if let Some(existing) = table.get(&sn).and_then(Weak::upgrade) {
            existing.open_count.fetch_add(1, Ordering::AcqRel);
            table.unlock();
            return Ok(existing);
        }
        let entry = self.cache.get(sn, owner)?;
        let disk = entry.with(InodeDisk::decode)?;
        drop(entry);
        let inode = Arc::new(Inode {
            sn,
            cache: self.cache.clone(),
            freemap: self.freemap.clone(),
            disk: SpinLock::new(disk),
            open_count: AtomicUsize::new(1),
            deny_write_count: AtomicUsize::new(0),
            removed: AtomicBool::new(false),
            owner: AtomicU64::new(owner),
        });
        table.insert(sn, Arc::downgrade(&inode));
        table.unlock();
        Ok(inode)
    }

    /// Releases one reference to `inode`. Once the last reference closes,
    /// the inode is dropped from the registry and, if it was marked
    /// removed, its sectors are returned to the free map.
    pub fn close(&self, inode: &Arc<Inode<D>>) -> Result<()> {
        let owner = inode.owner_id();
        if inode.open_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(());
        }
        let mut table = self.table.lock();
        table.remove(&inode.sn);
        table.unlock();
        if inode.is_removed() {
            let disk = inode.disk.lock();
            let snapshot = disk.clone();
            disk.unlock();
            kwarn!("inode: freeing removed sector {}", inode.sn);
            free_inode(&snapshot, inode.sn, &inode.cache, inode.freemap.as_ref(), owner)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;
    use crate::freemap::BitmapFreeMap;

    fn harness(sectors: u32) -> (InodeTable<MemBlockDevice>, ()) {
        let dev = Arc::new(MemBlockDevice::new(sectors));
        let cache = Arc::new(BufferCache::with_capacity(dev, 16));
        let fm = Arc::new(BitmapFreeMap::new(sectors));
        fm.reserve(0, 1);
        (InodeTable::new(cache, fm), ())
    }

    #[test]
    fn write_then_read_back_same_bytes() {
        let (table, _) = harness(64);
        let inode = table.create(1).unwrap();
        let data = [7u8; 1300];
        inode.write_at(&data, 0).unwrap();
        assert_eq!(inode.length(), 1300);
        let mut ra = RaState::new(32);
        let mut out = [0u8; 1300];
        let n = inode.read_at(&mut out, 0, &mut ra).unwrap();
        assert_eq!(n, 1300);
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn sparse_write_reads_back_zero_hole() {
        let (table, _) = harness(64);
        let inode = table.create(1).unwrap();
        inode.write_at(&[9u8; 4], 4096).unwrap();
        let mut ra = RaState::new(32);
        let mut out = [1u8; 512];
        inode.read_at(&mut out, 0, &mut ra).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_across_indirect_boundary_allocates_indirect_block() {
        let (table, _) = harness(4096);
        let inode = table.create(1).unwrap();
        let offset = (DIRECT_POINTERS as u64) * SECTOR_SIZE as u64 + 10;
        inode.write_at(&[3u8; 8], offset).unwrap();
        let mut ra = RaState::new(32);
        let mut out = [0u8; 8];
        inode.read_at(&mut out, offset, &mut ra).unwrap();
        assert_eq!(out, [3u8; 8]);
    }

    #[test]
    fn kind_round_trips_across_reopen() {
        let (table, _) = harness(16);
        let dir = table.create_typed(1, InodeKind::Dir).unwrap();
        let sn = dir.sector();
        assert_eq!(dir.kind(), InodeKind::Dir);
        table.close(&dir).unwrap();
        let reopened = table.open(sn, 1).unwrap();
        assert_eq!(reopened.kind(), InodeKind::Dir);
        table.close(&reopened).unwrap();

        let file = table.create(1).unwrap();
        assert_eq!(file.kind(), InodeKind::File);
    }

    #[test]
    fn deny_write_blocks_writers() {
        let (table, _) = harness(16);
        let inode = table.create(1).unwrap();
        inode.deny_write();
        assert_eq!(inode.write_at(&[1u8], 0), Ok(0));
        assert_eq!(inode.length(), 0);
        inode.allow_write();
        assert_eq!(inode.write_at(&[1u8], 0), Ok(1));
    }

    #[test]
    fn second_open_shares_the_same_instance() {
        let (table, _) = harness(16);
        let a = table.create(1).unwrap();
        let sn = a.sector();
        let b = table.open(sn, 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        table.close(&a).unwrap();
        table.close(&b).unwrap();
    }

    #[test]
    fn remove_on_last_close_frees_sectors() {
        let (table, fm_probe) = harness(16);
        let _ = fm_probe;
        let inode = table.create(1).unwrap();
        inode.write_at(&[1u8; 512], 0).unwrap();
        inode.mark_removed();
        table.close(&inode).unwrap();
    }
}
