//! Runtime tuning and the `fsutil` binary's command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Geometry and tuning knobs fixed at mount (spec §3).
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Logical page size in bytes. Power of two.
    pub page_size: u32,
    /// Logical block size in bytes (smallest erasable unit). Multiple of `page_size`.
    pub block_size: u32,
    /// Number of blocks on the volume. Must be at least 3 (two spares + one data block).
    pub block_count: u32,
    /// Maximum object name length, including the NUL terminator.
    pub name_len: u32,
    /// Fixed-size metadata blob length attached to every object. 0 disables it.
    pub meta_len: u32,
    /// Number of page-sized frames in the read/write-back cache. 0 disables caching.
    pub cache_pages: u32,
    /// Allow the write-back cache to buffer sub-page writes per file descriptor.
    pub write_back: bool,
    /// Zero page payloads on delete, not just the OLU slot.
    pub secure_erase: bool,
    /// Per-block magic/erase-count bookkeeping (spec §3(F)).
    pub use_magic: bool,
    /// Budget used by quick-GC: a block with more trailing FREE entries than
    /// this isn't worth reclaiming without live-page eviction.
    pub max_free_pages: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            page_size: 256,
            block_size: 4096,
            block_count: 64,
            name_len: 32,
            meta_len: 0,
            cache_pages: 16,
            write_back: true,
            secure_erase: false,
            use_magic: true,
            max_free_pages: 2,
        }
    }
}

/// Command-line surface for the `fsutil` demonstration binary.
#[derive(Parser)]
#[command(name = "fsutil", about = "Drive the flash filesystem core against a file-backed image")]
pub struct FsUtilArgs {
    /// Path to the image file (created if missing for `format`).
    pub image: PathBuf,

    #[command(subcommand)]
    pub command: FsUtilCommand,

    #[clap(long, default_value_t = 256)]
    pub page_size: u32,
    #[clap(long, default_value_t = 4096)]
    pub block_size: u32,
    #[clap(long, default_value_t = 64)]
    pub block_count: u32,
}

#[derive(Subcommand)]
pub enum FsUtilCommand {
    /// Erase every block and initialize an empty filesystem.
    Format,
    /// Print block_count/used/free page accounting.
    Info,
    /// Run the consistency checker, repairing what it can.
    Fsck,
    /// List object names in the flat namespace.
    Ls,
    /// Print an object's contents to stdout.
    Cat { name: String },
    /// Write stdin into a named object, creating or truncating it.
    Put { name: String },
}

impl FsUtilArgs {
    pub fn fs_config(&self) -> FsConfig {
        FsConfig {
            page_size: self.page_size,
            block_size: self.block_size,
            block_count: self.block_count,
            ..FsConfig::default()
        }
    }
}
