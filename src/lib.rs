//! Small-footprint flash filesystem core (spec §1): on-media object model,
//! garbage collection, object append/modify/truncate, and a page cache with
//! write-back and an index-map accelerator, over a caller-supplied block
//! device. The POSIX/VFS wrapper, the HAL's hardware bindings, and
//! probe-on-mount heuristics beyond §4.8 are external collaborators; this
//! crate is the core plus two ready-to-use HAL bindings for demonstration
//! and testing.
//!
//! The core itself never touches raw pointers; the only `unsafe` in this
//! crate is `MmapHal::open`'s call into `mmap-rs`, explicitly exempted below.

#![deny(unsafe_code)]

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod fd;
pub mod fs;
pub mod gc;
pub mod geometry;
pub mod hal;
pub mod ixmap;
pub mod mount;
pub mod objix;
pub mod olu;
pub mod page;

pub use api::{DirEntry, Stat};
pub use config::FsConfig;
pub use error::{FsError, FsResult};
pub use fd::{OpenFlags, Whence};
pub use fs::{FileCallback, FileEvent, Filesystem};
pub use hal::Hal;
pub use mount::CheckReport;
