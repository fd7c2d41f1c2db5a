//! File-descriptor table and the temporal FD cache (spec §4.6).

use crate::fs::IndexEvent;
use crate::geometry::{BlockIx, EntryIx, ObjId, PageIx};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const CREAT    = 1 << 0;
        const EXCL     = 1 << 1;
        const TRUNC    = 1 << 2;
        const APPEND   = 1 << 3;
        const RDONLY   = 1 << 4;
        const WRONLY   = 1 << 5;
        const RDWR     = 1 << 6;
        const DIRECT   = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// One open-file slot. `file_nbr == 0` means closed (spec §4.6).
#[derive(Debug, Clone)]
pub struct Fd {
    pub file_nbr: u32,
    pub obj_id: ObjId,
    pub size: u32,
    pub objix_hdr_pix: PageIx,
    pub cursor_objix_pix: PageIx,
    pub cursor_objix_spix: u32,
    pub offset: u32,
    pub flags: OpenFlags,
    pub name_hash: u64,
    pub score: u32,
    pub seek_hint: Option<(BlockIx, EntryIx)>,
    pub ix_map: Option<usize>,
}

impl Fd {
    fn closed() -> Self {
        Fd {
            file_nbr: 0,
            obj_id: ObjId::FREE,
            size: 0,
            objix_hdr_pix: 0,
            cursor_objix_pix: 0,
            cursor_objix_spix: 0,
            offset: 0,
            flags: OpenFlags::empty(),
            name_hash: 0,
            score: 0,
            seek_hint: None,
            ix_map: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.file_nbr == 0
    }
}

pub struct FdTable {
    slots: Vec<Fd>,
    next_file_nbr: u32,
}

impl FdTable {
    pub fn new(capacity: usize) -> Self {
        FdTable { slots: (0..capacity).map(|_| Fd::closed()).collect(), next_file_nbr: 1 }
    }

    /// Find a slot for a new open. In temporal mode, closed slots whose
    /// `name_hash` matches are preferred (reusing the remembered OLU seek
    /// hint); otherwise the lowest-scored closed slot is chosen, after aging
    /// every closed slot's score down by one (spec §4.6 `find_new`).
    pub fn find_new(&mut self, name_hash: u64) -> Option<usize> {
        for slot in self.slots.iter_mut() {
            if slot.is_closed() && slot.score > 0 {
                slot.score -= 1;
            }
        }
        if let Some(i) = self
            .slots
            .iter()
            .position(|s| s.is_closed() && s.name_hash == name_hash && s.name_hash != 0)
        {
            return Some(i);
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_closed())
            .min_by_key(|(_, s)| s.score)
            .map(|(i, _)| i)
    }

    pub fn open_slot(
        &mut self,
        idx: usize,
        obj_id: ObjId,
        size: u32,
        objix_hdr_pix: PageIx,
        flags: OpenFlags,
        name_hash: u64,
    ) -> u32 {
        let file_nbr = self.next_file_nbr;
        self.next_file_nbr = self.next_file_nbr.wrapping_add(1).max(1);
        let seek_hint = self.slots[idx].seek_hint;
        self.slots[idx] = Fd {
            file_nbr,
            obj_id,
            size,
            objix_hdr_pix,
            cursor_objix_pix: objix_hdr_pix,
            cursor_objix_spix: 0,
            offset: 0,
            flags,
            name_hash,
            score: 4,
            seek_hint,
            ix_map: None,
        };
        file_nbr
    }

    pub fn get(&self, file_nbr: u32) -> Option<&Fd> {
        self.slots.iter().find(|s| s.file_nbr == file_nbr)
    }

    pub fn get_mut(&mut self, file_nbr: u32) -> Option<&mut Fd> {
        self.slots.iter_mut().find(|s| s.file_nbr == file_nbr)
    }

    pub fn index_of(&self, file_nbr: u32) -> Option<usize> {
        self.slots.iter().position(|s| s.file_nbr == file_nbr)
    }

    pub fn close(&mut self, file_nbr: u32) -> bool {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.file_nbr == file_nbr) {
            slot.seek_hint = Some((0, 0));
            slot.file_nbr = 0;
            true
        } else {
            false
        }
    }

    pub fn iter_open(&self) -> impl Iterator<Item = &Fd> {
        self.slots.iter().filter(|s| !s.is_closed())
    }

    /// Patch cached (pix, size, offset) fields and release a cache page on
    /// object deletion or a move affecting the currently-open object (spec
    /// §4.4 "Event callback").
    pub fn on_index_event(&mut self, ev: &IndexEvent) {
        match *ev {
            IndexEvent::Moved { obj_id, span_ix: 0, new_pix } => {
                for slot in self.slots.iter_mut() {
                    if !slot.is_closed() && slot.obj_id.raw_id() == obj_id {
                        slot.objix_hdr_pix = new_pix;
                        if slot.cursor_objix_spix == 0 {
                            slot.cursor_objix_pix = new_pix;
                        }
                    }
                }
            }
            IndexEvent::UpdatedHeader { obj_id, pix, .. } => {
                for slot in self.slots.iter_mut() {
                    if !slot.is_closed() && slot.obj_id.raw_id() == obj_id {
                        slot.objix_hdr_pix = pix;
                    }
                }
            }
            IndexEvent::Updated { obj_id, size, .. } => {
                for slot in self.slots.iter_mut() {
                    if !slot.is_closed() && slot.obj_id.raw_id() == obj_id {
                        slot.size = size;
                    }
                }
            }
            IndexEvent::Deleted { obj_id, span_ix: 0 } => {
                for slot in self.slots.iter_mut() {
                    if !slot.is_closed() && slot.obj_id.raw_id() == obj_id {
                        slot.file_nbr = 0;
                    }
                }
            }
            _ => {}
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_new_prefers_matching_name_hash_slot() {
        let mut table = FdTable::new(2);
        let a = table.find_new(42).unwrap();
        let fh = table.open_slot(a, ObjId::new(1), 0, 0, OpenFlags::RDONLY, 42);
        table.close(fh);

        let picked = table.find_new(42).unwrap();
        assert_eq!(picked, a);
    }

    #[test]
    fn find_new_returns_none_when_all_open() {
        let mut table = FdTable::new(1);
        let a = table.find_new(0).unwrap();
        table.open_slot(a, ObjId::new(1), 0, 0, OpenFlags::RDONLY, 0);
        assert!(table.find_new(0).is_none());
    }

    #[test]
    fn open_close_round_trip() {
        let mut table = FdTable::new(4);
        let idx = table.find_new(7).unwrap();
        let fh = table.open_slot(idx, ObjId::new(9), 100, 3, OpenFlags::RDWR, 7);
        assert!(table.get(fh).is_some());
        assert!(table.close(fh));
        assert!(table.get(fh).is_none());
        assert!(!table.close(fh));
    }

    #[test]
    fn on_index_event_patches_open_fd() {
        let mut table = FdTable::new(2);
        let idx = table.find_new(0).unwrap();
        let fh = table.open_slot(idx, ObjId::new(5), 10, 1, OpenFlags::RDWR, 0);

        table.on_index_event(&IndexEvent::Updated { obj_id: 5, span_ix: 2, pix: 0, size: 999 });
        assert_eq!(table.get(fh).unwrap().size, 999);

        table.on_index_event(&IndexEvent::Moved { obj_id: 5, span_ix: 0, new_pix: 77 });
        assert_eq!(table.get(fh).unwrap().objix_hdr_pix, 77);

        table.on_index_event(&IndexEvent::Deleted { obj_id: 5, span_ix: 0 });
        assert!(table.get(fh).is_none());
    }
}
