//! The owning `Filesystem` value (spec §9, first design note): replaces a
//! global mutable struct with pointers into caller scratch buffers with a
//! value that owns its geometry, counters, FD table and work buffers.
//! Every public operation is a `&mut self` method, which is how the "external
//! lock serialises all API calls" contract (spec §5) is expressed in Rust —
//! the borrow checker forbids the nested-call case spec §5 says is
//! unsupported.

use crate::cache::Cache;
use crate::fd::FdTable;
use crate::geometry::{BlockIx, EntryIx, Geometry};
use crate::hal::Hal;
use crate::ixmap::IndexMapSlot;

/// Events emitted by index mutations (spec §4.4 "Event callback"), dispatched
/// to FDs, attached index maps, and an optional user callback.
#[derive(Debug, Clone, Copy)]
pub enum IndexEvent {
    New { obj_id: u16, span_ix: u32, pix: u32 },
    Updated { obj_id: u16, span_ix: u32, pix: u32, size: u32 },
    UpdatedHeader { obj_id: u16, span_ix: u32, pix: u32, size: u32 },
    Deleted { obj_id: u16, span_ix: u32 },
    Moved { obj_id: u16, span_ix: u32, new_pix: u32 },
}

/// User-visible reduction of [`IndexEvent`], delivered only for span==0
/// events (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub enum FileEvent {
    Created { obj_id: u16 },
    Updated { obj_id: u16 },
    Deleted { obj_id: u16 },
}

pub type FileCallback = Box<dyn FnMut(FileEvent)>;

/// The GC state machine cursor (spec §9, fourth design note / spec §4.7).
#[derive(Debug, Clone, Copy, Default)]
pub enum GcState {
    #[default]
    Idle,
    FindObjData,
    MoveObjData { obj_id: u16, span_ix: u32 },
    MoveObjIx,
    Finished,
}

pub struct Filesystem<H: Hal> {
    pub(crate) hal: H,
    pub(crate) geometry: Geometry,

    pub(crate) free_blocks: u32,
    pub(crate) stats_p_allocated: u32,
    pub(crate) stats_p_deleted: u32,
    pub(crate) max_erase_count: u32,

    pub(crate) free_cursor: (BlockIx, EntryIx),
    pub(crate) cursor: (BlockIx, EntryIx),

    pub(crate) fds: FdTable,
    pub(crate) cache: Option<Cache>,
    pub(crate) index_maps: Vec<Option<IndexMapSlot>>,

    pub(crate) work_buf: Vec<u8>,
    pub(crate) lu_work: Vec<u8>,

    pub(crate) cleaning: bool,
    pub(crate) gc_victim_block: Option<BlockIx>,
    pub(crate) gc_state: GcState,

    pub(crate) read_only: bool,
    pub(crate) mounted: bool,

    pub(crate) file_callback: Option<FileCallback>,
}

impl<H: Hal> Filesystem<H> {
    pub(crate) fn new(hal: H, geometry: Geometry, max_fds: usize) -> Self {
        let work_len = 2 * geometry.cfg.page_size as usize;
        let lu_len = geometry.cfg.page_size as usize;
        let cache = if geometry.cfg.cache_pages > 0 {
            Some(Cache::new(geometry.cfg.cache_pages as usize, geometry.cfg.page_size as usize))
        } else {
            None
        };
        Filesystem {
            hal,
            geometry,
            free_blocks: 0,
            stats_p_allocated: 0,
            stats_p_deleted: 0,
            max_erase_count: 0,
            free_cursor: (0, 0),
            cursor: (0, 0),
            fds: FdTable::new(max_fds),
            cache,
            index_maps: Vec::new(),
            work_buf: vec![0u8; work_len],
            lu_work: vec![0u8; lu_len],
            cleaning: false,
            gc_victim_block: None,
            gc_state: GcState::Idle,
            read_only: false,
            mounted: false,
            file_callback: None,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn info(&self) -> (u64, u64) {
        let total = self.geometry.data_pages_per_block as u64
            * self.geometry.block_count() as u64
            * self.geometry.data_page_size as u64;
        let used = self.stats_p_allocated as u64 * self.geometry.data_page_size as u64;
        (total, used)
    }

    pub fn set_file_callback(&mut self, cb: Option<FileCallback>) {
        self.file_callback = cb;
    }

    /// Dispatch an index event to FDs, index maps, and the user callback.
    pub(crate) fn dispatch_event(&mut self, ev: IndexEvent) {
        self.fds.on_index_event(&ev);
        for slot in self.index_maps.iter_mut().flatten() {
            slot.on_index_event(&ev);
        }
        if let Some(cb) = self.file_callback.as_mut() {
            let user_ev = match ev {
                IndexEvent::New { obj_id, span_ix: 0, .. } => Some(FileEvent::Created { obj_id }),
                IndexEvent::Updated { obj_id, span_ix: 0, .. }
                | IndexEvent::UpdatedHeader { obj_id, span_ix: 0, .. } => {
                    Some(FileEvent::Updated { obj_id })
                }
                IndexEvent::Deleted { obj_id, span_ix: 0 } => Some(FileEvent::Deleted { obj_id }),
                _ => None,
            };
            if let Some(ue) = user_ev {
                cb(ue);
            }
        }
    }
}
