//! Garbage collector: quick GC (reclaim fully-deleted blocks) and
//! incremental GC (evacuate a scored victim block, then erase) — spec §4.7.

use crate::error::{FsError, FsResult};
use crate::fs::{Filesystem, GcState};
use crate::geometry::{BlockIx, ObjId};
use crate::hal::Hal;
use crate::page::PageHeader;

/// Candidate-scoring weights (spec §4.7 `find_candidate`).
const W_DELET: u32 = 4;
const W_USED: u32 = 2;
const W_ERASE_AGE: u32 = 1;
const MAX_RUNS: u32 = 32;
const MAX_CANDIDATES: usize = 4;

struct BlockScan {
    live: u32,
    deleted: u32,
    free: u32,
}

impl<H: Hal> Filesystem<H> {
    fn scan_block(&mut self, block: BlockIx) -> FsResult<BlockScan> {
        let entries = self.geometry.obj_lookup_max_entries();
        let mut live = 0;
        let mut deleted = 0;
        let mut free = 0;
        for e in 0..entries {
            let id = self.read_obj_lookup_entry(block, e)?;
            if id.is_free() {
                free += 1;
            } else if id.is_deleted() {
                deleted += 1;
            } else {
                live += 1;
            }
        }
        Ok(BlockScan { live, deleted, free })
    }

    fn erase_count(&mut self, block: BlockIx) -> FsResult<u32> {
        let addr = self.geometry.erase_count_paddr(block);
        let mut buf = [0u8; 2];
        self.hal_read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf) as u32)
    }

    pub(crate) fn erase_block(&mut self, block: BlockIx) -> FsResult<()> {
        let addr = self.geometry.block_to_paddr(block);
        self.hal_erase(addr, self.geometry.cfg.block_size)?;
        self.free_blocks += 1;

        self.max_erase_count = self.max_erase_count.wrapping_add(1) & 0xFFFF;
        let ec_addr = self.geometry.erase_count_paddr(block);
        self.hal_write(ec_addr, &(self.max_erase_count as u16).to_le_bytes())?;
        if self.geometry.check_magic_possible() {
            let magic = self.block_magic(block);
            let magic_addr = self.geometry.magic_paddr(block);
            self.hal_write(magic_addr, &(magic as u16).to_le_bytes())?;
        }

        if let Some(cache) = self.cache.as_mut() {
            let lo = self.geometry.page_for_block(block, 0);
            let hi = lo + self.geometry.data_pages_per_block;
            for pix in lo..hi {
                cache.invalidate_read(pix);
            }
        }
        if self.gc_victim_block == Some(block) {
            self.gc_victim_block = None;
        }
        if self.free_cursor.0 == block {
            self.free_cursor = ((block + 1) % self.geometry.block_count(), 0);
        }
        tracing::debug!(block, "erased block");
        Ok(())
    }

    pub(crate) fn block_magic(&self, block: BlockIx) -> u32 {
        (self.geometry.cfg.block_size.wrapping_mul(31).wrapping_add(block)) & 0xFFFF
    }

    /// Reclaim blocks whose OLU is entirely DELETED followed by at most
    /// `max_free_pages` FREE entries; no live-page moves (spec §4.7
    /// `gc_quick`).
    pub(crate) fn gc_quick(&mut self, max_free_pages: u32) -> FsResult<u32> {
        let budget = if max_free_pages == 0 { self.geometry.cfg.max_free_pages } else { max_free_pages };
        let block_count = self.geometry.block_count();
        let mut reclaimed = 0;
        self.cleaning = true;
        let result = (|| {
            for block in 0..block_count {
                let scan = self.scan_block(block)?;
                if scan.live == 0 && scan.deleted > 0 && scan.free <= budget {
                    self.erase_block(block)?;
                    self.stats_p_deleted = self.stats_p_deleted.saturating_sub(scan.deleted);
                    reclaimed += 1;
                }
            }
            Ok(())
        })();
        self.cleaning = false;
        result?;
        if reclaimed == 0 {
            Err(FsError::NoDeletedBlocks)
        } else {
            Ok(reclaimed)
        }
    }

    /// Ensure at least `len` bytes (plus one page of slack) can be written,
    /// running incremental GC rounds if needed (spec §4.7 `gc_check`).
    pub(crate) fn gc_check(&mut self, len: u32) -> FsResult<()> {
        let block_count = self.geometry.block_count();
        let data_pages_per_block = self.geometry.data_pages_per_block;
        let free_pages_total =
            data_pages_per_block * (block_count.saturating_sub(2)) - self.stats_p_allocated - self.stats_p_deleted;
        let free_bytes = free_pages_total as u64 * self.geometry.data_page_size as u64;
        let needed = len as u64 + self.geometry.data_page_size as u64;

        if self.free_blocks > 3 && needed <= free_bytes {
            return Ok(());
        }
        if needed > free_bytes + self.stats_p_deleted as u64 * self.geometry.data_page_size as u64 {
            return Err(FsError::Full);
        }

        let mut stale_rounds = 0;
        for _ in 0..MAX_RUNS {
            let before = self.stats_p_deleted;
            match self.find_candidate()? {
                Some(bix) => {
                    self.clean_block(bix)?;
                }
                None => break,
            }
            if self.free_blocks > 3 {
                break;
            }
            if self.stats_p_deleted == before {
                stale_rounds += 1;
                if stale_rounds >= 2 {
                    break;
                }
            } else {
                stale_rounds = 0;
            }
        }
        Ok(())
    }

    /// Score every block and return the highest-scoring candidate with at
    /// least one live or deleted page to reclaim (spec §4.7 `find_candidate`).
    fn find_candidate(&mut self) -> FsResult<Option<BlockIx>> {
        let block_count = self.geometry.block_count();
        let mut top: Vec<(BlockIx, u32)> = Vec::with_capacity(MAX_CANDIDATES);
        let crammed = self.free_blocks <= 1;
        for block in 0..block_count {
            let scan = self.scan_block(block)?;
            if scan.live == 0 && scan.deleted == 0 {
                continue;
            }
            let erase_age = if crammed {
                0
            } else {
                let ec = self.erase_count(block)?;
                self.max_erase_count.wrapping_sub(ec) & 0xFFFF
            };
            let score = W_DELET * scan.deleted + W_USED * scan.live + W_ERASE_AGE * erase_age;
            let pos = top.iter().position(|&(_, s)| score > s);
            match pos {
                Some(i) => {
                    top.insert(i, (block, score));
                    top.truncate(MAX_CANDIDATES);
                }
                None if top.len() < MAX_CANDIDATES => top.push((block, score)),
                None => {}
            }
        }
        Ok(top.first().map(|&(b, _)| b))
    }

    /// Evacuate every live page in `bix` (data pages, then index pages) and
    /// erase it (spec §4.7 `clean`, the FIND_OBJ_DATA -> MOVE_OBJ_DATA ->
    /// MOVE_OBJ_IX -> FINISHED state machine, spec §9 fourth design note).
    fn clean_block(&mut self, bix: BlockIx) -> FsResult<()> {
        self.cleaning = true;
        self.gc_victim_block = Some(bix);
        self.gc_state = GcState::FindObjData;
        let result = self.run_clean_state_machine(bix);
        self.cleaning = false;
        self.gc_state = GcState::Idle;
        result?;
        self.erase_block(bix)?;
        Ok(())
    }

    fn run_clean_state_machine(&mut self, bix: BlockIx) -> FsResult<()> {
        let entries = self.geometry.obj_lookup_max_entries();

        loop {
            match self.gc_state {
                GcState::FindObjData => {
                    let mut found = None;
                    for e in 0..entries {
                        let id = self.read_obj_lookup_entry(bix, e)?;
                        if id.is_free() || id.is_deleted() || id.is_index() {
                            continue;
                        }
                        found = Some((e, id));
                        break;
                    }
                    match found {
                        None => {
                            self.gc_state = GcState::MoveObjIx;
                        }
                        Some((e, id)) => {
                            let pix = self.geometry.page_for_block(bix, e);
                            let addr = self.geometry.page_to_paddr(pix);
                            let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
                            self.hal_read(addr, &mut hdr_buf)?;
                            let header = PageHeader::parse(&hdr_buf);
                            if !header.flags.is_used() || !header.flags.is_final() || header.flags.is_deleted() {
                                // orphaned / half-written page: not referenced by any live
                                // index; drop it and keep scanning this block.
                                self.delete_page(pix)?;
                                continue;
                            }
                            let ix_obj_id = id.with_index_flag();
                            match self.find_id_and_span(ix_obj_id, 0, None, true) {
                                Ok(_) => {
                                    self.gc_state =
                                        GcState::MoveObjData { obj_id: id.raw_id(), span_ix: header.span_ix };
                                }
                                Err(FsError::NotFound) => {
                                    // no owning index page: orphaned data page, spec §4.7
                                    // recovery -- drop it and resume FIND_OBJ_DATA.
                                    self.delete_page(pix)?;
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
                GcState::MoveObjData { obj_id, span_ix } => {
                    let id = ObjId::new(obj_id);
                    let pix = self.geometry.page_for_block(
                        bix,
                        self.locate_entry_for(bix, id, span_ix)?.ok_or(FsError::NotFound)?,
                    );
                    let addr = self.geometry.page_to_paddr(pix);
                    let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
                    self.hal_read(addr, &mut hdr_buf)?;
                    let header = PageHeader::parse(&hdr_buf);
                    if header.flags.is_deleted() {
                        // already deleted under us; nothing to move.
                        self.gc_state = GcState::FindObjData;
                        continue;
                    }
                    let new_pix = self.move_page(id, span_ix, false, pix, None)?;
                    // objix_hdr_pix is re-resolved by set_index_entry's own
                    // lookup of the header when span_ix==0, or via a chain
                    // page search otherwise, so no header pix is threaded here.
                    let hdr_pix = self.find_id_and_span(id.with_index_flag(), 0, None, true)?;
                    self.set_index_entry(id, span_ix, hdr_pix, new_pix)?;
                    self.gc_state = GcState::FindObjData;
                }
                GcState::MoveObjIx => {
                    let mut found = None;
                    for e in 0..entries {
                        let id = self.read_obj_lookup_entry(bix, e)?;
                        if id.is_free() || id.is_deleted() || !id.is_index() {
                            continue;
                        }
                        found = Some((e, id));
                        break;
                    }
                    match found {
                        None => {
                            self.gc_state = GcState::Finished;
                        }
                        Some((e, id)) => {
                            let pix = self.geometry.page_for_block(bix, e);
                            let addr = self.geometry.page_to_paddr(pix);
                            let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
                            self.hal_read(addr, &mut hdr_buf)?;
                            let header = PageHeader::parse(&hdr_buf);
                            if !header.flags.is_used() || !header.flags.is_final() || header.flags.is_deleted() {
                                self.delete_page(pix)?;
                                continue;
                            }
                            let new_pix = self.move_page(id, header.span_ix, true, pix, None)?;
                            if header.span_ix == 0 {
                                self.dispatch_event(crate::fs::IndexEvent::Moved {
                                    obj_id: id.raw_id(),
                                    span_ix: 0,
                                    new_pix,
                                });
                            } else {
                                self.dispatch_event(crate::fs::IndexEvent::Moved {
                                    obj_id: id.raw_id(),
                                    span_ix: header.span_ix,
                                    new_pix,
                                });
                            }
                        }
                    }
                }
                GcState::Finished | GcState::Idle => return Ok(()),
            }
        }
    }

    fn locate_entry_for(&mut self, bix: BlockIx, obj_id: ObjId, span_ix: u32) -> FsResult<Option<u32>> {
        let entries = self.geometry.obj_lookup_max_entries();
        for e in 0..entries {
            let id = self.read_obj_lookup_entry(bix, e)?;
            if id.is_free() || id.is_deleted() || id.is_index() {
                continue;
            }
            if id.raw_id() == obj_id.raw_id() {
                let pix = self.geometry.page_for_block(bix, e);
                let addr = self.geometry.page_to_paddr(pix);
                let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
                self.hal_read(addr, &mut hdr_buf)?;
                let header = PageHeader::parse(&hdr_buf);
                if header.span_ix == span_ix {
                    return Ok(Some(e));
                }
            }
        }
        Ok(None)
    }
}
