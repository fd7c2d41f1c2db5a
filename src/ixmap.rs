//! Index-map accelerator (spec §4.9): a per-fd vector caching resolved data
//! page indices over a contiguous span range, so a read can skip the OLU
//! seek entirely when its span is covered.

use crate::error::{FsError, FsResult};
use crate::fs::IndexEvent;
use crate::geometry::{PageIx, SpanIx};

pub struct IndexMapSlot {
    pub fd_idx: usize,
    pub obj_id: u16,
    pub start_spix: SpanIx,
    pub map_buf: Vec<PageIx>,
}

impl IndexMapSlot {
    pub fn new(fd_idx: usize, obj_id: u16, start_spix: SpanIx, len: usize) -> Self {
        IndexMapSlot { fd_idx, obj_id, start_spix, map_buf: vec![0; len] }
    }

    pub fn end_spix(&self) -> SpanIx {
        self.start_spix + self.map_buf.len() as u32
    }

    pub fn covers(&self, span_ix: SpanIx) -> bool {
        span_ix >= self.start_spix && span_ix < self.end_spix()
    }

    pub fn get(&self, span_ix: SpanIx) -> Option<PageIx> {
        if self.covers(span_ix) {
            let pix = self.map_buf[(span_ix - self.start_spix) as usize];
            if pix != 0 {
                Some(pix)
            } else {
                None
            }
        } else {
            None
        }
    }

    pub fn set(&mut self, span_ix: SpanIx, pix: PageIx) {
        if self.covers(span_ix) {
            self.map_buf[(span_ix - self.start_spix) as usize] = pix;
        }
    }

    /// Shift the window to `new_start`, refilling only the newly-exposed
    /// slots (spec §4.9 `remap`). Q3 (spec §9): the original zeroed the
    /// wrong pointer on one remap path; here the whole vector is refilled
    /// explicitly rather than relying on an in-place shift, which preserves
    /// the observable "whole vector refreshed" behavior without the bug.
    pub fn remap(&mut self, new_start: SpanIx) {
        let len = self.map_buf.len();
        let old_start = self.start_spix;
        let mut new_buf = vec![0u32; len];
        for (i, slot) in new_buf.iter_mut().enumerate() {
            let span = new_start + i as u32;
            if span >= old_start && span < old_start + len as u32 {
                *slot = self.map_buf[(span - old_start) as usize];
            }
        }
        self.map_buf = new_buf;
        self.start_spix = new_start;
    }

    pub fn on_index_event(&mut self, ev: &IndexEvent) {
        match *ev {
            IndexEvent::Moved { obj_id, span_ix, new_pix } if obj_id == self.obj_id => {
                self.set(span_ix, new_pix);
            }
            IndexEvent::Updated { obj_id, span_ix, pix, .. } if obj_id == self.obj_id => {
                self.set(span_ix, pix);
            }
            _ => {}
        }
    }
}

/// Translate a byte count into the number of index-map entries it would take
/// to cover that many spans worth of buffer (spec §6 `bytes_to_ix_map_entries`).
pub fn bytes_to_ix_map_entries(bytes: u32, data_page_size: u32) -> u32 {
    bytes.div_ceil(data_page_size)
}

pub fn ix_map_entries_to_bytes(entries: u32, data_page_size: u32) -> u32 {
    entries * data_page_size
}

pub fn check_range(start: SpanIx, len: usize, total_spans: u32) -> FsResult<()> {
    if start as u64 + len as u64 > total_spans as u64 {
        Err(FsError::IxMapBadRange)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_respects_window() {
        let mut slot = IndexMapSlot::new(0, 1, 10, 4);
        assert!(!slot.covers(9));
        assert!(slot.covers(10));
        assert!(slot.covers(13));
        assert!(!slot.covers(14));

        assert_eq!(slot.get(11), None);
        slot.set(11, 500);
        assert_eq!(slot.get(11), Some(500));
        // out-of-window set is silently ignored.
        slot.set(20, 999);
        assert_eq!(slot.get(20), None);
    }

    #[test]
    fn remap_preserves_overlapping_entries() {
        let mut slot = IndexMapSlot::new(0, 1, 0, 4);
        slot.set(0, 10);
        slot.set(1, 11);
        slot.set(2, 12);
        slot.set(3, 13);

        slot.remap(2);
        assert_eq!(slot.start_spix, 2);
        assert_eq!(slot.get(2), Some(12));
        assert_eq!(slot.get(3), Some(13));
        assert_eq!(slot.get(4), None);
        assert_eq!(slot.get(5), None);
    }

    #[test]
    fn on_index_event_updates_matching_obj_only() {
        let mut slot = IndexMapSlot::new(0, 1, 0, 4);
        slot.on_index_event(&IndexEvent::Moved { obj_id: 2, span_ix: 0, new_pix: 7 });
        assert_eq!(slot.get(0), None);

        slot.on_index_event(&IndexEvent::Moved { obj_id: 1, span_ix: 0, new_pix: 7 });
        assert_eq!(slot.get(0), Some(7));

        slot.on_index_event(&IndexEvent::Updated { obj_id: 1, span_ix: 1, pix: 8, size: 0 });
        assert_eq!(slot.get(1), Some(8));
    }

    #[test]
    fn byte_entry_conversions_round_trip() {
        assert_eq!(bytes_to_ix_map_entries(0, 248), 0);
        assert_eq!(bytes_to_ix_map_entries(1, 248), 1);
        assert_eq!(bytes_to_ix_map_entries(248, 248), 1);
        assert_eq!(bytes_to_ix_map_entries(249, 248), 2);
        assert_eq!(ix_map_entries_to_bytes(2, 248), 496);
    }

    #[test]
    fn check_range_rejects_overflow() {
        assert!(check_range(0, 10, 10).is_ok());
        assert!(check_range(5, 6, 10).is_err());
    }
}
