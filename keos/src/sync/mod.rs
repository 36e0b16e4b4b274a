//! Synchronization primitives.
//!
//! This module collects the locking building blocks shared by every
//! project crate: an SMP [`SpinLock`]. Project code that needs atomics
//! reaches for `core::sync::atomic` directly rather than a wrapper here,
//! since the in-memory inode (and similar structures) need precise
//! per-field memory ordering (`Acquire`/`Release`/`AcqRel`) that a
//! single-`Ordering` wrapper can't express.

mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
