//! Object-lookup (OLU) engine (spec §4.2): scans and updates the per-block
//! id table, finds free entries, resolves (obj_id, span_ix) pairs.
//!
//! Each consumer below is its own small loop over `(block, entry)` rather
//! than a shared iterator/visitor abstraction — spec.md §9's third design
//! note suggested one, but with only four call sites and each wanting a
//! slightly different early-exit condition (free-terminal-within-block for
//! `find_free`, id+flag match for `find_id`, id+flag+header-validity match
//! for `find_id_and_span`), a shared abstraction added a layer of indirection
//! without removing any duplication; see `DESIGN.md`.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FsError, FsResult};
use crate::fs::Filesystem;
use crate::geometry::{BlockIx, EntryIx, ObjId, PageIx, SpanIx, OBJ_ID_LEN};
use crate::hal::Hal;
use crate::page::PageHeader;

impl<H: Hal> Filesystem<H> {
    pub(crate) fn read_obj_lookup(&mut self, pix: PageIx) -> FsResult<ObjId> {
        let block = self.geometry.block_for_page(pix);
        let entry = pix - block * self.geometry.data_pages_per_block;
        self.read_obj_lookup_entry(block, entry)
    }

    pub(crate) fn read_obj_lookup_entry(&mut self, block: BlockIx, entry: EntryIx) -> FsResult<ObjId> {
        let addr = self.geometry.obj_lookup_entry_paddr(block, entry);
        let mut buf = [0u8; OBJ_ID_LEN as usize];
        self.hal_read(addr, &mut buf)?;
        Ok(ObjId::new(LittleEndian::read_u16(&buf)))
    }

    pub(crate) fn write_obj_lookup(&mut self, pix: PageIx, id: ObjId) -> FsResult<()> {
        let block = self.geometry.block_for_page(pix);
        let entry = pix - block * self.geometry.data_pages_per_block;
        let addr = self.geometry.obj_lookup_entry_paddr(block, entry);
        let mut buf = [0u8; OBJ_ID_LEN as usize];
        LittleEndian::write_u16(&mut buf, id.0);
        self.hal_write(addr, &buf)
    }

    /// Find the next free OLU entry, running quick-GC first if the free
    /// block count is critically low (spec §4.2 `find_free`).
    pub(crate) fn find_free(&mut self) -> FsResult<PageIx> {
        if self.free_blocks < 2 && !self.cleaning {
            match self.gc_quick(0) {
                Ok(_) | Err(FsError::NoDeletedBlocks) => {}
                Err(e) => return Err(e),
            }
        }
        if self.free_blocks < 2 {
            return Err(FsError::Full);
        }

        let block_count = self.geometry.block_count();
        let entries_per_block = self.geometry.obj_lookup_max_entries();
        let (mut block, mut entry) = self.free_cursor;
        for _ in 0..(block_count * entries_per_block.max(1)) {
            let id = self.read_obj_lookup_entry(block, entry)?;
            if id.is_free() {
                self.free_cursor = if entry + 1 < entries_per_block {
                    (block, entry + 1)
                } else {
                    ((block + 1) % block_count, 0)
                };
                if entry == 0 {
                    // entry 0 free => whole block was virgin (I1: free is
                    // terminal), this is its first occupation.
                    self.free_blocks = self.free_blocks.saturating_sub(1);
                }
                return Ok(self.geometry.page_for_block(block, entry));
            }
            entry += 1;
            if entry >= entries_per_block {
                entry = 0;
                block = (block + 1) % block_count;
            }
        }
        Err(FsError::Full)
    }

    pub(crate) fn find_id(&mut self, obj_id: ObjId, start: (BlockIx, EntryIx)) -> FsResult<Option<PageIx>> {
        let block_count = self.geometry.block_count();
        let entries_per_block = self.geometry.obj_lookup_max_entries();
        let mut block = start.0;
        let mut entry = start.1;
        for _ in 0..block_count {
            for e in entry..entries_per_block {
                let id = self.read_obj_lookup_entry(block, e)?;
                if id.is_free() {
                    break;
                }
                if id.raw_id() == obj_id.raw_id() && id.is_index() == obj_id.is_index() {
                    return Ok(Some(self.geometry.page_for_block(block, e)));
                }
            }
            entry = 0;
            block = (block + 1) % block_count;
        }
        Ok(None)
    }

    /// Find the page holding `(obj_id, span_ix)`, validating the candidate's
    /// header (spec §4.2 `find_id_and_span`, by-header variant). `exclude_pix`
    /// skips a page the caller already knows about (used during move/GC so
    /// the freshly-written destination isn't mistaken for a stale source).
    pub(crate) fn find_id_and_span(
        &mut self,
        obj_id: ObjId,
        span_ix: SpanIx,
        exclude_pix: Option<PageIx>,
        is_index: bool,
    ) -> FsResult<PageIx> {
        let block_count = self.geometry.block_count();
        let entries_per_block = self.geometry.obj_lookup_max_entries();
        let mut block = 0;
        let mut entry = 0;
        for _ in 0..(block_count * entries_per_block.max(1)) {
            let id = self.read_obj_lookup_entry(block, entry)?;
            if !id.is_free()
                && id.raw_id() == obj_id.raw_id()
                && id.is_index() == obj_id.is_index()
            {
                let pix = self.geometry.page_for_block(block, entry);
                if exclude_pix != Some(pix) {
                    let addr = self.geometry.page_to_paddr(pix);
                    let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
                    self.hal_read(addr, &mut hdr_buf)?;
                    let header = PageHeader::parse(&hdr_buf);
                    // An index-header candidate (span_ix==0) is invalid only
                    // when it is itself marked "being deleted" (IXDELE
                    // cleared); chain pages (span_ix>0) carry no such flag
                    // and are never rejected on it (spec §4.2).
                    let valid = if is_index {
                        header.validate_index(obj_id, span_ix).is_ok()
                            && (span_ix != 0 || !header.flags.is_ix_deleted())
                    } else {
                        header.validate_data(obj_id, span_ix).is_ok()
                    };
                    if valid {
                        return Ok(pix);
                    }
                }
            }
            entry += 1;
            if entry >= entries_per_block {
                entry = 0;
                block += 1;
                if block >= block_count {
                    block = 0;
                }
            }
        }
        Err(FsError::NotFound)
    }
}
