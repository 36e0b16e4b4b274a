//! End-to-end scenarios exercising the storage and paging core as a whole,
//! through public APIs only, one scenario per literal behaviour this
//! project is built to guarantee.

use std::sync::{Arc, Mutex};

use keos_project6::block::{MemBlockDevice, Sector};
use keos_project6::cache::BufferCache;
use keos_project6::config::{SWAP_SLOT_SECTORS, WRITE_BEHIND_PERIOD_TICKS};
use keos_project6::frame::{AddressSpace, FrameId, FrameTable};
use keos_project6::freemap::{BitmapFreeMap, FreeMap};
use keos_project6::inode::InodeTable;
use keos_project6::readahead::RaState;
use keos_project6::suppage::{Position, SupPageTable, Upage};
use keos_project6::swap::SwapArea;

const OWNER: u64 = 1;

fn fs_harness(
    sectors: u32,
) -> (
    InodeTable<MemBlockDevice>,
    Arc<BufferCache<MemBlockDevice>>,
    Arc<BitmapFreeMap>,
) {
    let dev = Arc::new(MemBlockDevice::new(sectors));
    let cache = Arc::new(BufferCache::with_capacity(dev, 64));
    let fm = Arc::new(BitmapFreeMap::new(sectors));
    fm.reserve(0, 1);
    let table = InodeTable::new(cache.clone(), fm.clone());
    (table, cache, fm)
}

#[test]
fn sequential_read_triggers_window_ramp() {
    const FS_SECTORS: u32 = 512;
    let (table, cache, _fm) = fs_harness(FS_SECTORS);
    let inode = table.create(OWNER).unwrap();
    inode.write_at(&[0u8; 40 * 512], 0).unwrap();

    let mut ra = RaState::new(32);
    let mut buf = [0u8; 512];
    inode.read_at(&mut buf, 0, &mut ra).unwrap();
    inode.read_at(&mut buf, 512, &mut ra).unwrap();
    inode.read_at(&mut buf, 1024, &mut ra).unwrap();

    // read_at feeds the state machine logical *sector* indices, not byte
    // offsets: the three calls above touch sectors 0, 1, 2. Call 1 is the
    // initial window (start=0); call 2 lands on the window continuation
    // and advances (start=4); call 3 (sector 2) is neither a continuation
    // nor beyond ra_pages, so it falls through to the near-sequential
    // "initial" branch and re-anchors at the sector it was asked for.
    assert_eq!(ra.start, 2);
    assert!(ra.size >= 4);

    // The window's marker lands on a physical (allocated) sector, not
    // necessarily the same number as the logical sector index -- scan
    // every sector the freshly-populated cache could plausibly hold.
    let any_marker = (0..FS_SECTORS).any(|sn| cache.is_marker(sn));
    assert!(any_marker, "expected at least one marked sector after the window ramp");
}

#[test]
fn extension_via_write() {
    let (table, _cache, _fm) = fs_harness(64);
    let inode = table.create(OWNER).unwrap();

    let data = [0x42u8; 1500];
    let n = inode.write_at(&data, 2000).unwrap();
    assert_eq!(n, 1500);
    assert_eq!(inode.length(), 3500);

    let mut ra = RaState::new(32);
    let mut readback = [0u8; 1500];
    inode.read_at(&mut readback, 2000, &mut ra).unwrap();
    assert_eq!(readback, data);

    let mut hole = [0xffu8; 2000];
    inode.read_at(&mut hole, 0, &mut ra).unwrap();
    assert!(hole.iter().all(|&b| b == 0));
}

#[test]
fn eviction_writeback() {
    let dev = Arc::new(MemBlockDevice::new(128));
    let cache = BufferCache::with_capacity(dev.clone(), 64);

    for sn in 0..64u32 {
        let byte = (sn % 251) as u8;
        cache.write(sn, &[byte; 512], 0, 512, OWNER).unwrap();
    }

    // The cache is now full of 64 distinct, all-dirty entries. Requesting
    // a 65th forces an eviction.
    cache.get(65, OWNER).unwrap();

    // Sector 0 was the oldest entry and the only unpinned candidate at
    // that point, so it was the one evicted; re-reading it must reflect
    // the last write through the buffer cache, not stale device content.
    let mut out = [0u8; 512];
    cache.read(0, &mut out, 0, 512, OWNER).unwrap();
    assert_eq!(out, [0u8; 512]);
}

#[derive(Default)]
struct FakeAddressSpace {
    accessed: Mutex<std::collections::BTreeMap<Upage, bool>>,
    dirty: Mutex<std::collections::BTreeMap<Upage, bool>>,
    unmapped: Mutex<Vec<Upage>>,
    installed: Mutex<std::collections::BTreeMap<Upage, (FrameId, bool)>>,
}

impl FakeAddressSpace {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl AddressSpace for FakeAddressSpace {
    fn is_dirty(&self, upage: Upage) -> bool {
        *self.dirty.lock().unwrap().get(&upage).unwrap_or(&false)
    }
    fn is_accessed(&self, upage: Upage) -> bool {
        *self.accessed.lock().unwrap().get(&upage).unwrap_or(&false)
    }
    fn clear_accessed(&self, upage: Upage) {
        self.accessed.lock().unwrap().insert(upage, false);
    }
    fn unmap(&self, upage: Upage) {
        self.unmapped.lock().unwrap().push(upage);
    }
    fn install(&self, upage: Upage, frame: FrameId, writable: bool) -> keos::error::Result<()> {
        self.installed.lock().unwrap().insert(upage, (frame, writable));
        Ok(())
    }
}

fn swap_area(slots: u32) -> Arc<SwapArea<MemBlockDevice>> {
    let dev = Arc::new(MemBlockDevice::new(slots * SWAP_SLOT_SECTORS as u32));
    Arc::new(SwapArea::new(dev))
}

#[test]
fn swap_round_trip_via_page_fault_restore() {
    // Two processes, one page each, plus a third allocation: physical
    // frames are exhausted and one of the first two must be evicted.
    let ft: FrameTable<MemBlockDevice> = FrameTable::new(2, swap_area(4));

    let sup1: Arc<SupPageTable<MemBlockDevice>> = Arc::new(SupPageTable::new());
    let addr1 = FakeAddressSpace::new();
    sup1.add_stack(0x1000).unwrap();
    let h1 = ft.get(1, 0x1000, sup1.clone(), addr1.clone()).unwrap();
    h1.with_mut(|b| b[0] = 0xAB);
    drop(h1);

    let sup2: Arc<SupPageTable<MemBlockDevice>> = Arc::new(SupPageTable::new());
    let addr2 = FakeAddressSpace::new();
    sup2.add_stack(0x2000).unwrap();
    ft.get(2, 0x2000, sup2.clone(), addr2.clone()).unwrap();

    // A third page, also pid 1's, forces eviction of an inactive frame;
    // neither existing page was "accessed" so the first one allocated
    // (pid 1's 0x1000) is the second-chance sweep's victim.
    sup1.add_stack(0x3000).unwrap();
    ft.get(1, 0x3000, sup1.clone(), addr1.clone()).unwrap();

    let evicted = sup1.find(0x1000).unwrap();
    assert!(evicted.position.contains(Position::SWAP));
    assert!(!evicted.loaded);

    ft.load_page(1, 0x1000, sup1.clone(), addr1.clone()).unwrap();
    let restored = sup1.find(0x1000).unwrap();
    assert!(!restored.position.contains(Position::SWAP));
    assert!(restored.loaded);

    let frame_id = ft.find(1, 0x1000).unwrap();
    let byte0 = ft.peek(frame_id, |bytes| bytes[0]).unwrap();
    assert_eq!(byte0, 0xAB);

    assert!(addr1.installed.lock().unwrap().contains_key(&0x1000));
}

#[test]
fn remove_on_close_releases_sectors_only_after_the_last_close() {
    let (table, _cache, fm) = fs_harness(64);
    // Sector 0 is the reserved free-map sector, allocated before any file
    // exists.
    let baseline = fm.allocated_count();

    let inode = table.create(OWNER).unwrap();
    let sn = inode.sector();
    let second = table.open(sn, OWNER).unwrap();
    inode.mark_removed();
    let allocated_with_file = fm.allocated_count();
    assert!(allocated_with_file > baseline);

    table.close(&inode).unwrap();
    // One more open handle remains: sectors are not released yet.
    assert_eq!(fm.allocated_count(), allocated_with_file);
    assert_eq!(second.sector(), sn);

    table.close(&second).unwrap();
    // All handles closed: the removed inode's sectors are back on the
    // free map, matching the pre-create count.
    assert_eq!(fm.allocated_count(), baseline);
}

#[test]
fn write_behind_timer_flushes_without_an_explicit_flush_call() {
    let dev = Arc::new(MemBlockDevice::new(4));
    let cache = BufferCache::with_capacity(dev.clone(), 4);

    let mut sector = [0u8; 512];
    sector[0] = 0x7a;
    cache.write(0, &sector, 0, 512, OWNER).unwrap();

    for _ in 0..WRITE_BEHIND_PERIOD_TICKS {
        cache.on_timer_tick();
    }

    let mut raw = [0u8; 512];
    dev.read(Sector(0), &mut raw).unwrap();
    assert_eq!(raw[0], 0x7a);
}
