//! Mount, format, consistency check, and geometry probe (spec §4.8).

use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::fs::Filesystem;
use crate::geometry::{BlockIx, Geometry, ObjId, PageIx};
use crate::hal::Hal;
use crate::page::PageHeader;

/// Outcome of a `check()` pass: what was found and, where the pass could
/// repair it, what was done (spec §4.8 `check`, §7 recovery policy).
#[derive(Debug, Default)]
pub struct CheckReport {
    pub orphaned_data_pages_removed: u32,
    pub duplicate_spans_resolved: u32,
    pub half_deleted_headers_finished: u32,
}

impl<H: Hal> Filesystem<H> {
    /// Zero-fill max_erase_count and erase every block (spec §4.8 `format`).
    pub fn format(cfg: FsConfig, mut hal: H) -> FsResult<()> {
        let geometry = Geometry::new(cfg)?;
        for block in 0..geometry.block_count() {
            let addr = geometry.block_to_paddr(block);
            hal.erase(addr, geometry.cfg.block_size)
                .map_err(|e| FsError::Media(std::io::Error::other(e.to_string())))?;
            let ec_addr = geometry.erase_count_paddr(block);
            hal.write(ec_addr, &0u16.to_le_bytes())
                .map_err(|e| FsError::Media(std::io::Error::other(e.to_string())))?;
            if geometry.check_magic_possible() {
                let magic = (geometry.cfg.block_size.wrapping_mul(31).wrapping_add(block)) & 0xFFFF;
                let magic_addr = geometry.magic_paddr(block);
                hal.write(magic_addr, &(magic as u16).to_le_bytes())
                    .map_err(|e| FsError::Media(std::io::Error::other(e.to_string())))?;
            }
        }
        tracing::debug!(blocks = geometry.block_count(), "formatted volume");
        Ok(())
    }

    /// Mount: compute geometry, scan the OLU to recover runtime counters
    /// (spec §4.8 `mount` + `OLU scan`).
    pub fn mount(cfg: FsConfig, hal: H, max_fds: usize) -> FsResult<Self> {
        let geometry = Geometry::new(cfg)?;
        let mut fs = Filesystem::new(hal, geometry, max_fds);
        fs.olu_scan()?;
        fs.mounted = true;
        tracing::debug!(
            free_blocks = fs.free_blocks,
            allocated = fs.stats_p_allocated,
            deleted = fs.stats_p_deleted,
            "mounted"
        );
        Ok(fs)
    }

    pub fn unmount(&mut self) {
        self.mounted = false;
    }

    fn olu_scan(&mut self) -> FsResult<()> {
        let block_count = self.geometry.block_count();

        let mut min_ec = u32::MAX;
        let mut max_ec = 0u32;
        let mut all_free = true;
        let mut unerased_block = None;
        for block in 0..block_count {
            let addr = self.geometry.erase_count_paddr(block);
            let mut buf = [0u8; 2];
            self.hal_read(addr, &mut buf)?;
            let ec = u16::from_le_bytes(buf);
            if ec != 0xFFFF {
                all_free = false;
                min_ec = min_ec.min(ec as u32);
                max_ec = max_ec.max(ec as u32);
            } else if unerased_block.is_none() {
                // all-ones erase_count: either never written or mid-erase.
                unerased_block = Some(block);
            }
        }

        self.max_erase_count = if all_free {
            0
        } else if max_ec - min_ec > 0x7FFF {
            min_ec.wrapping_add(1) & 0xFFFF
        } else {
            max_ec.wrapping_add(1) & 0xFFFF
        };

        if let Some(block) = unerased_block {
            if !self.read_only {
                self.erase_block(block)?;
            }
        }

        self.free_blocks = 0;
        self.stats_p_allocated = 0;
        self.stats_p_deleted = 0;
        for block in 0..block_count {
            let entries = self.geometry.obj_lookup_max_entries();
            // I1: free is terminal within a block, so an entirely virgin
            // (never-allocated-into) block has its first entry FREE.
            let first = self.read_obj_lookup_entry(block, 0)?;
            if first.is_free() {
                self.free_blocks += 1;
                continue;
            }
            for e in 0..entries {
                let id = self.read_obj_lookup_entry(block, e)?;
                if id.is_free() {
                    break;
                } else if id.is_deleted() {
                    self.stats_p_deleted += 1;
                } else {
                    self.stats_p_allocated += 1;
                }
            }
        }
        Ok(())
    }

    /// Infer geometry from the first three blocks' magic values without a
    /// prior mount (spec §4.8 `probe`). Requires a decreasing sequence,
    /// tolerating exactly one block caught mid-erase.
    pub fn probe(cfg: &FsConfig, hal: &mut H) -> FsResult<u64> {
        if cfg.block_count < 3 {
            return Err(FsError::ProbeTooFewBlocks);
        }
        let geometry = Geometry::new(cfg.clone())?;
        if !geometry.check_magic_possible() {
            return Err(FsError::MagicNotPossible);
        }

        let mut magics = [None; 3];
        for (i, m) in magics.iter_mut().enumerate() {
            let addr = geometry.magic_paddr(i as BlockIx);
            let mut buf = [0u8; 2];
            hal.read(addr, &mut buf)
                .map_err(|e| FsError::Media(std::io::Error::other(e.to_string())))?;
            let val = u16::from_le_bytes(buf);
            *m = if val == 0xFFFF { None } else { Some(val as u32) };
        }

        let interrupted = magics.iter().filter(|m| m.is_none()).count();
        if interrupted > 1 {
            return Err(FsError::ProbeNotAFs);
        }
        let present: Vec<(usize, u32)> =
            magics.iter().enumerate().filter_map(|(i, m)| m.map(|v| (i, v))).collect();
        for w in present.windows(2) {
            let (i0, v0) = w[0];
            let (i1, v1) = w[1];
            let step = (i1 - i0) as u32;
            if v0.wrapping_sub(v1) != step {
                return Err(FsError::ProbeNotAFs);
            }
        }

        Ok(geometry.block_count() as u64 * cfg.block_size as u64)
    }

    /// Run the three consistency-check passes: lookup, object-index, page
    /// (spec §4.8 `check`). Fixes orphaned data pages (no live index
    /// references them), resolves duplicate (obj_id, span_ix) left behind
    /// by a crashed move (spec §8 I2, I5, S6), and finishes half-deleted
    /// headers (IXDELE cleared but object not fully removed).
    pub fn check(&mut self) -> FsResult<CheckReport> {
        let mut report = CheckReport::default();
        let block_count = self.geometry.block_count();
        let entries = self.geometry.obj_lookup_max_entries();

        // Pass 1: lookup consistency -- every live data-page OLU entry must
        // have a valid, finalized header; otherwise it is orphaned.
        let mut live_data: Vec<(BlockIx, u32, ObjId, u32)> = Vec::new();
        let mut live_chain_ix: Vec<(ObjId, PageIx)> = Vec::new();
        for block in 0..block_count {
            for e in 0..entries {
                let id = self.read_obj_lookup_entry(block, e)?;
                if id.is_free() || id.is_deleted() {
                    continue;
                }
                let pix = self.geometry.page_for_block(block, e);
                let addr = self.geometry.page_to_paddr(pix);
                let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
                self.hal_read(addr, &mut hdr_buf)?;
                let header = PageHeader::parse(&hdr_buf);
                if !header.flags.is_used() || !header.flags.is_final() {
                    self.delete_page(pix)?;
                    report.orphaned_data_pages_removed += 1;
                    continue;
                }
                if !id.is_index() {
                    live_data.push((block, e, id, header.span_ix));
                } else if header.span_ix != 0 {
                    live_chain_ix.push((id, pix));
                }
            }
        }

        // Pass 2: duplicate (obj_id, span_ix) among live, finalized data
        // pages -- a crash between writing the new OLU slot and deleting the
        // old one (spec §8 S6). Keep the newest (higher pix), delete others.
        use std::collections::{HashMap, HashSet};
        let mut by_key: HashMap<(u16, u32), Vec<u32>> = HashMap::new();
        for &(block, e, id, span_ix) in &live_data {
            let pix = self.geometry.page_for_block(block, e);
            by_key.entry((id.raw_id(), span_ix)).or_default().push(pix);
        }
        let mut already_deleted: HashSet<u32> = HashSet::new();
        for (_key, mut pixes) in by_key {
            if pixes.len() > 1 {
                pixes.sort_unstable();
                for &dup in &pixes[..pixes.len() - 1] {
                    self.delete_page(dup)?;
                    already_deleted.insert(dup);
                    report.duplicate_spans_resolved += 1;
                }
            }
        }

        // Pass 3: object-index / page consistency -- index headers whose
        // IXDELE bit is already cleared (being-deleted marker written) but
        // whose object was not fully removed are finished off.
        for block in 0..block_count {
            for e in 0..entries {
                let id = self.read_obj_lookup_entry(block, e)?;
                if id.is_free() || id.is_deleted() || !id.is_index() {
                    continue;
                }
                let pix = self.geometry.page_for_block(block, e);
                let addr = self.geometry.page_to_paddr(pix);
                let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
                self.hal_read(addr, &mut hdr_buf)?;
                let header = PageHeader::parse(&hdr_buf);
                if header.span_ix != 0 || !header.flags.is_ix_deleted() {
                    continue;
                }
                // Header marks the object as being deleted (a crashed
                // ftruncate/remove): finish the job by deleting any data
                // pages and chain index pages still referencing it, then the
                // header itself.
                for &(block2, e2, oid, _) in &live_data {
                    if oid.raw_id() == id.raw_id() {
                        let dpix = self.geometry.page_for_block(block2, e2);
                        if already_deleted.insert(dpix) {
                            self.delete_page(dpix)?;
                        }
                    }
                }
                for &(oid, cpix) in &live_chain_ix {
                    if oid.raw_id() == id.raw_id() && already_deleted.insert(cpix) {
                        self.delete_page(cpix)?;
                    }
                }
                self.delete_page(pix)?;
                report.half_deleted_headers_finished += 1;
            }
        }

        tracing::warn!(?report, "consistency check complete");
        Ok(report)
    }
}
