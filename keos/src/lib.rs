//! # keos: the core support crate
//!
//! `keos` is the small `no_std` foundation shared by every KeOS course
//! project: a spinlock, a teletype-style logging sink, and the
//! [`Error`] type that every fallible kernel-side operation returns.
//!
//! Project crates (`keos-projectN`) depend on this crate and build the
//! actual course content on top of it. Nothing in here is specific to a
//! single project; if a project needs something project-specific, it
//! belongs in the project crate instead.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod error;
pub mod sync;
pub mod teletype;

pub use error::Error;
