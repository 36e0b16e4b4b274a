//! Compile-time tunables.
//!
//! These are gathered in one place so a host can see every knob at a
//! glance. They default to the values a faithful reimplementation of the
//! original teaching kernel uses; components that want a different
//! topology for testing (e.g. a tiny cache to exercise eviction cheaply)
//! take an explicit capacity in their constructor instead of depending on
//! these constants, so tests are not forced to recompile the crate.

/// Bytes per device sector.
pub const SECTOR_SIZE: usize = 512;

/// Bytes per virtual-memory page; also the unit of swap storage.
pub const PGSIZE: usize = 4096;

/// Number of buffer-cache entries held at once.
pub const CACHE_SIZE: usize = 64;

/// How often (in timer ticks) the background task flushes dirty cache
/// entries to disk.
pub const WRITE_BEHIND_PERIOD_TICKS: u64 = 30;

/// Maximum read-ahead window, in sectors.
pub const READ_AHEAD_WINDOW: usize = 32;

/// Direct pointers in an on-disk inode.
pub const DIRECT_POINTERS: usize = 12;

/// Sector slots in an indirect block (`SECTOR_SIZE / size_of::<u32>()`).
pub const INDIRECT_FANOUT: usize = SECTOR_SIZE / 4;

/// Total pointer slots in an on-disk inode: 12 direct, 1 single-indirect,
/// 1 double-indirect.
pub const INODE_POINTER_SLOTS: usize = DIRECT_POINTERS + 2;

/// Largest logical sector index a file can address:
/// `DIRECT_POINTERS + INDIRECT_FANOUT + INDIRECT_FANOUT * INDIRECT_FANOUT`.
pub const MAX_FILE_SECTORS: usize =
    DIRECT_POINTERS + INDIRECT_FANOUT + INDIRECT_FANOUT * INDIRECT_FANOUT;

/// Sectors occupied by one swap slot (one page).
pub const SWAP_SLOT_SECTORS: usize = PGSIZE / SECTOR_SIZE;

/// The frame evictor keeps at least this many frames on the inactive list
/// after a refill, so the next eviction always has cold candidates handy.
pub const INACTIVE_LIST_FLOOR: usize = 10;

/// Reserved sector number for the free-map inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Reserved sector number for the root-directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Magic constant stamped into every on-disk inode; mismatches are fatal.
pub const INODE_MAGIC: u32 = 0x494e_4f44;
