//! # Project 6: Storage and Paging Core
//!
//! This project builds the storage and paging core shared by every later
//! KeOS course project that touches persistent data or virtual memory: an
//! on-disk, inode-based file system with a write-behind buffer cache and
//! adaptive read-ahead, and a demand-paged virtual-memory subsystem (frame
//! table, supplemental page table, swap area, memory-mapped files).
//!
//! ## Module map
//!
//! | Module | Role |
//! |---|---|
//! | [`block`] | Synchronous 512-byte sector device abstraction |
//! | [`cache`] | Bounded buffer cache: writeback, eviction, periodic flush |
//! | [`freemap`] | Bitmap allocator over device sectors |
//! | [`inode`] | On-disk inode layout, sector resolution, growth, free |
//! | [`readahead`] | Adaptive read-ahead window over a single open inode |
//! | [`swap`] | Page-granularity slot allocator over a second block device |
//! | [`suppage`] | Per-process upage -> backing-source descriptor |
//! | [`frame`] | Physical-frame ownership, two-list clock, swap/writeback |
//!
//! The CLI/boot path, thread scheduler, priority donation, interrupt
//! plumbing, syscall dispatch, directory-name parsing, free-map
//! persistence, and the file-descriptor table are all consumed through the
//! narrow interfaces named in [`config`] and [`block`] -- this project does
//! not respecify them.
//!
//! This project does not implement crash-consistent journaling, concurrent
//! writers to a single inode beyond length-extension serialisation,
//! cross-machine coherence, ACLs, or files larger than the two-level
//! pointer tree admits.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod block;
pub mod cache;
pub mod config;
pub mod frame;
pub mod freemap;
pub mod inode;
pub mod readahead;
pub mod suppage;
pub mod swap;

pub use keos::error::{Error, Result};

/// Statically asserts that an on-disk structure is exactly one sector
/// (512 bytes), mirroring the fatal "inode size != 512" invariant check
/// from the error-handling design.
#[macro_export]
macro_rules! const_assert_sector_sized {
    ($t:ty) => {
        const _: () = assert!(core::mem::size_of::<$t>() == $crate::config::SECTOR_SIZE);
    };
}
