//! Block device abstraction.
//!
//! A narrow, synchronous interface over a 512-byte-sector device. Two
//! instances of [`BlockDevice`] are used by the rest of this crate: the
//! file-system device (consumed by [`crate::cache`] and [`crate::inode`])
//! and the swap device (consumed by [`crate::swap`]). Real hosts implement
//! [`BlockDevice`] over whatever storage medium they have (a virtio-blk
//! queue, a RAM disk, a loopback file); this crate only ever talks to the
//! trait.

use crate::config::SECTOR_SIZE;
use keos::error::{Error, Result};

/// An opaque sector number: an index into a [`BlockDevice`].
///
/// Sector 0 is the free-map inode and sector 1 is the root-directory
/// inode on the file-system device (see [`crate::config::FREE_MAP_SECTOR`]
/// and [`crate::config::ROOT_DIR_SECTOR`]); the swap device instead
/// addresses sectors in groups of [`crate::config::SWAP_SLOT_SECTORS`],
/// one group per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sector(pub u32);

impl Sector {
    /// The byte offset of this sector within its device.
    pub fn into_offset(self) -> u64 {
        self.0 as u64 * SECTOR_SIZE as u64
    }
}

impl core::ops::Add<u32> for Sector {
    type Output = Sector;
    fn add(self, rhs: u32) -> Sector {
        Sector(self.0 + rhs)
    }
}

/// One sector's worth of bytes.
pub type SectorBuf = [u8; SECTOR_SIZE];

/// A synchronous block device: read and write exactly one sector at a
/// time.
///
/// Implementations are assumed to be synchronous and to always succeed
/// barring a genuine device failure -- see the error-handling design: disk
/// I/O failure is the one error kind this trait itself can report, every
/// other failure (capacity, invariant) is handled above this layer.
pub trait BlockDevice: Send + Sync {
    /// Reads sector `sn` into `buf`.
    fn read(&self, sn: Sector, buf: &mut SectorBuf) -> Result<()>;

    /// Writes `buf` into sector `sn`.
    fn write(&self, sn: Sector, buf: &SectorBuf) -> Result<()>;

    /// Total number of addressable sectors on this device.
    fn sector_count(&self) -> u32;
}

/// An in-memory [`BlockDevice`], used by tests and by any host that has
/// not wired in real storage.
pub struct MemBlockDevice {
    sectors: keos::sync::SpinLock<alloc::vec::Vec<SectorBuf>>,
}

impl MemBlockDevice {
    /// Creates a zero-filled device with `count` sectors.
    pub fn new(count: u32) -> Self {
        Self {
            sectors: keos::sync::SpinLock::new(alloc::vec![[0u8; SECTOR_SIZE]; count as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read(&self, sn: Sector, buf: &mut SectorBuf) -> Result<()> {
        let guard = self.sectors.lock();
        let sector = guard.get(sn.0 as usize).ok_or(Error::IoError)?;
        buf.copy_from_slice(sector);
        guard.unlock();
        Ok(())
    }

    fn write(&self, sn: Sector, buf: &SectorBuf) -> Result<()> {
        let mut guard = self.sectors.lock();
        let sector = guard.get_mut(sn.0 as usize).ok_or(Error::IoError)?;
        sector.copy_from_slice(buf);
        guard.unlock();
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        self.sectors.lock().len() as u32
    }
}
