//! Swap area: a page-granularity bitmap slot allocator over a dedicated
//! block device.
//!
//! The allocation bitmap is the only thing [`SwapArea`] protects with its
//! lock. The sector I/O that actually moves a page's bytes happens with
//! the lock released: [`SwapArea::store`] flips the slot's bit to
//! "in use" and releases the lock *before* writing the page out, and
//! [`SwapArea::load`] reads the page's sectors with no lock held at all,
//! only taking the lock afterward to clear the bit. Two swap operations on
//! different slots therefore never serialize on disk I/O, only on the
//! brief bitmap update -- the same shape the frame evictor and the page
//! fault handler rely on to make swap-in/swap-out throughput scale with
//! the device, not with a lock held for the whole transfer.

use crate::block::{BlockDevice, Sector};
use crate::config::{PGSIZE, SWAP_SLOT_SECTORS};
use alloc::sync::Arc;
use keos::error::{Error, Result};
use keos::kwarn;
use keos::sync::SpinLock;

/// One page's worth of bytes, the unit [`SwapArea`] moves.
pub type Page = [u8; PGSIZE];

/// A swap slot index: `slot * SWAP_SLOT_SECTORS` is the slot's first
/// sector on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(pub u32);

/// The swap area: a bitmap allocator plus the block device it allocates
/// over.
pub struct SwapArea<D: BlockDevice> {
    device: Arc<D>,
    bitmap: SpinLock<alloc::vec::Vec<bool>>,
}

impl<D: BlockDevice> SwapArea<D> {
    /// Builds a swap area over `device`, sized to however many whole
    /// slots its sector count divides into.
    pub fn new(device: Arc<D>) -> Self {
        let slots = device.sector_count() as usize / SWAP_SLOT_SECTORS;
        Self {
            device,
            bitmap: SpinLock::new(alloc::vec![false; slots]),
        }
    }

    /// Number of slots on this device, used and free combined.
    pub fn slot_count(&self) -> usize {
        self.bitmap.lock().len()
    }

    /// Writes `page` into a freshly allocated slot and returns it.
    ///
    /// The bitmap is updated and the lock released before the sector
    /// writes happen; a concurrent `store`/`load`/`free` on a different
    /// slot proceeds without waiting on this transfer.
    pub fn store(&self, page: &Page) -> Result<SwapSlot> {
        let slot = {
            let mut bitmap = self.bitmap.lock();
            let found = bitmap.iter().position(|used| !used);
            let idx = match found {
                Some(i) => i,
                None => {
                    let slots = bitmap.len();
                    bitmap.unlock();
                    kwarn!("swap: area full, all {slots} slot(s) in use");
                    return Err(Error::ResourceExhausted);
                }
            };
            bitmap[idx] = true;
            bitmap.unlock();
            idx as u32
        };

        for i in 0..SWAP_SLOT_SECTORS {
            let sn = Sector(slot * SWAP_SLOT_SECTORS as u32 + i as u32);
            let offset = i * crate::config::SECTOR_SIZE;
            let mut buf = [0u8; crate::config::SECTOR_SIZE];
            buf.copy_from_slice(&page[offset..offset + crate::config::SECTOR_SIZE]);
            if let Err(e) = self.device.write(sn, &buf) {
                let mut bitmap = self.bitmap.lock();
                bitmap[slot as usize] = false;
                bitmap.unlock();
                return Err(e);
            }
        }
        Ok(SwapSlot(slot))
    }

    /// Reads the page stored at `slot` back into `page` and frees the
    /// slot.
    ///
    /// All sector reads happen before the lock is taken at all; the
    /// bitmap is only touched afterward, to clear the slot's bit.
    pub fn load(&self, slot: SwapSlot, page: &mut Page) -> Result<()> {
        for i in 0..SWAP_SLOT_SECTORS {
            let sn = Sector(slot.0 * SWAP_SLOT_SECTORS as u32 + i as u32);
            let offset = i * crate::config::SECTOR_SIZE;
            let mut buf = [0u8; crate::config::SECTOR_SIZE];
            self.device.read(sn, &mut buf)?;
            page[offset..offset + crate::config::SECTOR_SIZE].copy_from_slice(&buf);
        }
        let mut bitmap = self.bitmap.lock();
        if let Some(used) = bitmap.get_mut(slot.0 as usize) {
            *used = false;
        }
        bitmap.unlock();
        Ok(())
    }

    /// Frees `slot` without reading it back, for callers that only need
    /// to reclaim the slot (e.g. a process exiting with pages still
    /// swapped out).
    pub fn free(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        if let Some(used) = bitmap.get_mut(slot.0 as usize) {
            *used = false;
        }
        bitmap.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockDevice;

    fn area(slots: u32) -> SwapArea<MemBlockDevice> {
        let dev = Arc::new(MemBlockDevice::new(slots * SWAP_SLOT_SECTORS as u32));
        SwapArea::new(dev)
    }

    #[test]
    fn store_then_load_round_trips_and_frees_the_slot() {
        let sw = area(4);
        let page = [5u8; PGSIZE];
        let slot = sw.store(&page).unwrap();
        let mut out = [0u8; PGSIZE];
        sw.load(slot, &mut out).unwrap();
        assert_eq!(page, out);
        // slot is free again: four more stores now succeed.
        for _ in 0..4 {
            sw.store(&page).unwrap();
        }
    }

    #[test]
    fn exhaustion_reports_resource_exhausted() {
        let sw = area(1);
        let page = [1u8; PGSIZE];
        sw.store(&page).unwrap();
        assert_eq!(sw.store(&page), Err(Error::ResourceExhausted));
    }

    #[test]
    fn free_reclaims_slot_without_reading() {
        let sw = area(1);
        let page = [2u8; PGSIZE];
        let slot = sw.store(&page).unwrap();
        sw.free(slot);
        assert!(sw.store(&page).is_ok());
    }
}
