//! Object index manager (spec §4.4): creates index headers; resolves
//! `(obj_id, data_span_ix) -> page` via a header page plus chained index
//! pages; exposes append/modify/truncate/read.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FsError, FsResult};
use crate::fs::{Filesystem, IndexEvent};
use crate::geometry::{ObjId, PageIx, SpanIx, PAGE_HDR_LEN};
use crate::hal::Hal;
use crate::page::PageHeader;

/// Object type tag stored in the index header payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    File = 1,
}

/// Parsed index header fields (spec §3(C), §6 on-media layout).
#[derive(Debug, Clone)]
pub struct IndexHeader {
    pub size: Option<u32>, // None => FREE sentinel, "undefined length"
    pub obj_type: u8,
    pub name: String,
    pub meta: Vec<u8>,
}

impl<H: Hal> Filesystem<H> {
    fn header_array_offset(&self) -> usize {
        (PAGE_HDR_LEN + self.geometry.hdr_fixed_len) as usize
    }

    fn chain_array_offset(&self) -> usize {
        PAGE_HDR_LEN as usize
    }

    fn read_index_header(&mut self, pix: PageIx) -> FsResult<IndexHeader> {
        let addr = self.geometry.page_to_paddr(pix);
        let len = self.geometry.cfg.page_size as usize;
        let mut buf = vec![0u8; len];
        self.hal_read(addr, &mut buf)?;
        Ok(self.parse_index_header_for_api(&buf))
    }

    pub(crate) fn parse_index_header_for_api(&self, buf: &[u8]) -> IndexHeader {
        let off = PAGE_HDR_LEN as usize;
        let size_raw = LittleEndian::read_u32(&buf[off..off + 4]);
        let obj_type = buf[off + 4];
        let name_off = off + 5;
        let name_len = self.geometry.cfg.name_len as usize;
        let name_bytes = &buf[name_off..name_off + name_len];
        let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_len);
        let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
        let meta_off = name_off + name_len;
        let meta_len = self.geometry.cfg.meta_len as usize;
        let meta = buf[meta_off..meta_off + meta_len].to_vec();
        let size = if size_raw == u32::MAX { None } else { Some(size_raw) };
        IndexHeader { size, obj_type, name, meta }
    }

    fn write_index_header_payload(
        &self,
        buf: &mut [u8],
        size: Option<u32>,
        obj_type: u8,
        name: &str,
        meta: &[u8],
    ) {
        let off = PAGE_HDR_LEN as usize;
        LittleEndian::write_u32(&mut buf[off..off + 4], size.unwrap_or(u32::MAX));
        buf[off + 4] = obj_type;
        let name_off = off + 5;
        let name_len = self.geometry.cfg.name_len as usize;
        let name_bytes = name.as_bytes();
        let n = name_bytes.len().min(name_len - 1);
        buf[name_off..name_off + n].copy_from_slice(&name_bytes[..n]);
        buf[name_off + n] = 0;
        let meta_off = name_off + name_len;
        let m = meta.len().min(self.geometry.cfg.meta_len as usize);
        buf[meta_off..meta_off + m].copy_from_slice(&meta[..m]);
    }

    pub(crate) fn read_index_entry(&mut self, pix: PageIx, is_header: bool, offset: u32) -> FsResult<PageIx> {
        let addr = self.geometry.page_to_paddr(pix);
        let array_off = if is_header { self.header_array_offset() } else { self.chain_array_offset() };
        let entry_addr = addr + array_off as u32 + offset * 4;
        let mut buf = [0u8; 4];
        self.hal_read(entry_addr, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    /// Resolve the physical page holding `data_span_ix` for `obj_id`, using
    /// `fd`'s cursor as a starting hint and updating it on success (spec
    /// §4.4 walking logic shared by append/modify/read).
    pub(crate) fn resolve_index_page(
        &mut self,
        obj_id: ObjId,
        data_span_ix: SpanIx,
        objix_hdr_pix: PageIx,
        cursor_pix: PageIx,
        cursor_spix: u32,
    ) -> FsResult<(PageIx, u32)> {
        let (is_header, chain_span, _offset) = self.geometry.index_location_for_span(data_span_ix);
        if is_header {
            return Ok((objix_hdr_pix, 0));
        }
        if chain_span == cursor_spix && cursor_pix != 0 {
            return Ok((cursor_pix, chain_span));
        }
        let ix_obj_id = obj_id.with_index_flag();
        let pix = self.find_id_and_span(ix_obj_id, chain_span, None, true)?;
        Ok((pix, chain_span))
    }

    /// Create a fresh object: allocate an index header page with
    /// size=UNDEFINED and an empty (all-ones) index array (spec §4.4
    /// `create`).
    pub(crate) fn create_object(
        &mut self,
        obj_id: ObjId,
        name: &str,
        meta: &[u8],
        obj_type: u8,
    ) -> FsResult<PageIx> {
        let page_size = self.geometry.cfg.page_size as usize;
        let mut buf = vec![0xFFu8; page_size];
        self.write_index_header_payload(&mut buf, None, obj_type, name, meta);
        let array_off = self.header_array_offset();
        let payload_start = PAGE_HDR_LEN as usize;
        let payload = buf[payload_start..].to_vec();
        let ix_obj_id = obj_id.with_index_flag();
        let pix = self.allocate_data(ix_obj_id, 0, true, &payload, true)?;
        let _ = array_off;
        self.dispatch_event(IndexEvent::New { obj_id: obj_id.raw_id(), span_ix: 0, pix });
        Ok(pix)
    }

    /// Mutate name/meta/size on the header and move it to a new page,
    /// emitting IX_UPD or IX_UPD_HDR (spec §4.4 `update_index_hdr`).
    pub(crate) fn update_index_hdr(
        &mut self,
        obj_id: ObjId,
        old_pix: PageIx,
        new_name: Option<&str>,
        new_meta: Option<&[u8]>,
        new_size: Option<u32>,
        header_event: bool,
    ) -> FsResult<PageIx> {
        let mut header = self.read_index_header(old_pix)?;
        if let Some(n) = new_name {
            header.name = n.to_string();
        }
        if let Some(m) = new_meta {
            header.meta = m.to_vec();
        }
        let size = new_size.or(header.size);

        let page_size = self.geometry.cfg.page_size as usize;
        let array_off = self.header_array_offset();
        let old_addr = self.geometry.page_to_paddr(old_pix);
        let mut full = vec![0u8; page_size];
        self.hal_read(old_addr, &mut full)?;
        self.write_index_header_payload(&mut full, size, header.obj_type, &header.name, &header.meta);
        let payload = full[PAGE_HDR_LEN as usize..].to_vec();
        let _ = array_off;

        let ix_obj_id = obj_id.with_index_flag();
        let new_pix = self.move_page(ix_obj_id, 0, true, old_pix, Some(&payload))?;
        let ev = if header_event {
            IndexEvent::UpdatedHeader { obj_id: obj_id.raw_id(), span_ix: 0, pix: new_pix, size: size.unwrap_or(0) }
        } else {
            IndexEvent::Updated { obj_id: obj_id.raw_id(), span_ix: 0, pix: new_pix, size: size.unwrap_or(0) }
        };
        self.dispatch_event(ev);
        Ok(new_pix)
    }

    /// Update a single page_ix entry in a header or chain index page,
    /// allocating a new chain page first if this is its first entry.
    pub(crate) fn set_index_entry(
        &mut self,
        obj_id: ObjId,
        data_span_ix: SpanIx,
        objix_hdr_pix: PageIx,
        new_data_pix: PageIx,
    ) -> FsResult<PageIx> {
        let (is_header, chain_span, offset) = self.geometry.index_location_for_span(data_span_ix);
        let page_size = self.geometry.cfg.page_size as usize;
        let ix_obj_id = obj_id.with_index_flag();

        if is_header {
            let addr = self.geometry.page_to_paddr(objix_hdr_pix);
            let mut full = vec![0u8; page_size];
            self.hal_read(addr, &mut full)?;
            let array_off = self.header_array_offset();
            LittleEndian::write_u32(&mut full[array_off + offset as usize * 4..][..4], new_data_pix);
            let payload = full[PAGE_HDR_LEN as usize..].to_vec();
            let new_pix = self.move_page(ix_obj_id, 0, true, objix_hdr_pix, Some(&payload))?;
            self.dispatch_event(IndexEvent::UpdatedHeader {
                obj_id: obj_id.raw_id(),
                span_ix: 0,
                pix: new_pix,
                size: 0,
            });
            return Ok(new_pix);
        }

        match self.find_id_and_span(ix_obj_id, chain_span, None, true) {
            Ok(pix) => {
                let addr = self.geometry.page_to_paddr(pix);
                let mut full = vec![0u8; page_size];
                self.hal_read(addr, &mut full)?;
                let array_off = self.chain_array_offset();
                LittleEndian::write_u32(&mut full[array_off + offset as usize * 4..][..4], new_data_pix);
                let payload = full[PAGE_HDR_LEN as usize..].to_vec();
                let new_pix = self.move_page(ix_obj_id, chain_span, true, pix, Some(&payload))?;
                self.dispatch_event(IndexEvent::Moved { obj_id: obj_id.raw_id(), span_ix: chain_span, new_pix });
                Ok(new_pix)
            }
            Err(FsError::NotFound) => {
                let mut full = vec![0xFFu8; page_size];
                let array_off = self.chain_array_offset();
                LittleEndian::write_u32(&mut full[array_off + offset as usize * 4..][..4], new_data_pix);
                let payload = full[PAGE_HDR_LEN as usize..].to_vec();
                let new_pix = self.allocate_data(ix_obj_id, chain_span, true, &payload, true)?;
                self.dispatch_event(IndexEvent::New { obj_id: obj_id.raw_id(), span_ix: chain_span, pix: new_pix });
                Ok(new_pix)
            }
            Err(e) => Err(e),
        }
    }

    /// Read `dst.len()` payload bytes of data page `pix` starting at
    /// `page_off`, consulting the read cache first and populating it on a
    /// miss (spec §4.5 "any read ... is cached"). Safe because a page's
    /// content at a given `pix` never changes once finalized; the only way a
    /// `pix` is reused is after its whole block is erased, which already
    /// invalidates every cached frame for that block (see `erase_block`).
    fn read_data_page_cached(&mut self, pix: PageIx, page_off: u32, dst: &mut [u8]) -> FsResult<()> {
        let start = PAGE_HDR_LEN as usize + page_off as usize;
        if let Some(cache) = self.cache.as_mut() {
            if let Some(data) = cache.lookup_read(pix) {
                dst.copy_from_slice(&data[start..start + dst.len()]);
                return Ok(());
            }
        }
        let addr = self.geometry.page_to_paddr(pix);
        let page_size = self.geometry.cfg.page_size as usize;
        let mut full = vec![0u8; page_size];
        self.hal_read(addr, &mut full)?;
        dst.copy_from_slice(&full[start..start + dst.len()]);
        if let Some(cache) = self.cache.as_mut() {
            cache.insert_read(pix, full);
        }
        Ok(())
    }

    /// Read up to `dst.len()` bytes starting at `offset` (spec §4.4 `read`).
    /// `ix_map`, if given, is `(start_spix, map_buf)` cloned out of the fd's
    /// attached index map (spec §4.9): a span it covers with a non-zero
    /// entry resolves straight to a data pix, skipping the OLU seek through
    /// `resolve_index_page`/`read_index_entry` entirely.
    pub(crate) fn read_object(
        &mut self,
        obj_id: ObjId,
        objix_hdr_pix: PageIx,
        offset: u32,
        size: u32,
        dst: &mut [u8],
        ix_map: Option<(SpanIx, &[PageIx])>,
    ) -> FsResult<usize> {
        let dps = self.geometry.data_page_size;
        let mut done = 0usize;
        let mut cursor_pix = objix_hdr_pix;
        let mut cursor_spix = 0u32;
        while done < dst.len() {
            let cur_offset = offset + done as u32;
            if cur_offset >= size {
                break;
            }
            let span_ix = cur_offset / dps;
            let in_page_off = cur_offset % dps;

            let mapped = ix_map.and_then(|(start, buf)| {
                if span_ix >= start && (span_ix - start) < buf.len() as u32 {
                    let pix = buf[(span_ix - start) as usize];
                    if pix != 0 && pix != u32::MAX {
                        return Some(pix);
                    }
                }
                None
            });
            let data_pix = if let Some(pix) = mapped {
                pix
            } else {
                let (ix_pix, spix) =
                    self.resolve_index_page(obj_id, span_ix, objix_hdr_pix, cursor_pix, cursor_spix)?;
                cursor_pix = ix_pix;
                cursor_spix = spix;
                self.read_index_entry(ix_pix, spix == 0, span_ix - (if spix == 0 { 0 } else {
                    self.geometry.obj_hdr_ix_len + (spix - 1) * self.geometry.obj_ix_len
                }))?
            };
            if data_pix == u32::MAX || data_pix == 0 {
                return Err(FsError::IndexRefFree);
            }
            let remaining_in_page = dps - in_page_off;
            let remaining_in_file = size - cur_offset;
            let remaining_in_dst = (dst.len() - done) as u32;
            let n = remaining_in_page.min(remaining_in_file).min(remaining_in_dst);
            self.read_data_page_cached(data_pix, in_page_off, &mut dst[done..done + n as usize])?;
            done += n as usize;
        }
        Ok(done)
    }

    /// Append/extend an object's data starting at `offset` (clamped to
    /// current size if it is beyond it), allocating full new pages for
    /// spans that don't yet exist and growing the last partial page in
    /// place via a move (spec §4.4 `append`).
    pub(crate) fn append_object(
        &mut self,
        obj_id: ObjId,
        objix_hdr_pix: PageIx,
        mut offset: u32,
        size: u32,
        data: &[u8],
    ) -> FsResult<usize> {
        if offset > size {
            offset = size;
        }
        let dps = self.geometry.data_page_size;
        let mut written = 0usize;
        let mut cursor_pix = objix_hdr_pix;
        let mut cursor_spix = 0u32;

        while written < data.len() {
            let cur_offset = offset + written as u32;
            let span_ix = cur_offset / dps;
            let page_off = cur_offset % dps;
            let chunk_len = (dps - page_off).min((data.len() - written) as u32);
            let chunk = &data[written..written + chunk_len as usize];

            if page_off == 0 && cur_offset >= size {
                let new_pix = self.allocate_data(obj_id, span_ix, false, chunk, chunk_len == dps)?;
                let (ix_pix, spix) =
                    self.resolve_or_create_index_page(obj_id, span_ix, objix_hdr_pix, cursor_pix, cursor_spix)?;
                cursor_pix = ix_pix;
                cursor_spix = spix;
                self.set_index_entry(obj_id, span_ix, objix_hdr_pix, new_pix)?;
            } else {
                let (ix_pix, spix) =
                    self.resolve_index_page(obj_id, span_ix, objix_hdr_pix, cursor_pix, cursor_spix)?;
                cursor_pix = ix_pix;
                cursor_spix = spix;
                let entry_off = span_ix - (if spix == 0 { 0 } else {
                    self.geometry.obj_hdr_ix_len + (spix - 1) * self.geometry.obj_ix_len
                });
                let old_pix = self.read_index_entry(ix_pix, spix == 0, entry_off)?;
                let old_addr = self.geometry.page_to_paddr(old_pix);
                let mut page_buf = vec![0u8; self.geometry.cfg.page_size as usize];
                self.hal_read(old_addr, &mut page_buf)?;
                let payload_start = PAGE_HDR_LEN as usize;
                payload_apply(&mut page_buf[payload_start..], page_off, chunk);
                let finalize = page_off + chunk_len == dps;
                let new_pix = self.move_page(
                    obj_id,
                    span_ix,
                    false,
                    old_pix,
                    Some(&page_buf[payload_start..]),
                )?;
                let _ = finalize;
                self.set_index_entry(obj_id, span_ix, objix_hdr_pix, new_pix)?;
            }
            written += chunk_len as usize;
        }
        Ok(written)
    }

    fn resolve_or_create_index_page(
        &mut self,
        obj_id: ObjId,
        data_span_ix: SpanIx,
        objix_hdr_pix: PageIx,
        cursor_pix: PageIx,
        cursor_spix: u32,
    ) -> FsResult<(PageIx, u32)> {
        match self.resolve_index_page(obj_id, data_span_ix, objix_hdr_pix, cursor_pix, cursor_spix) {
            Ok(r) => Ok(r),
            Err(FsError::NotFound) => {
                let (_is_header, chain_span, _off) = self.geometry.index_location_for_span(data_span_ix);
                Ok((0, chain_span))
            }
            Err(e) => Err(e),
        }
    }

    /// Overwrite existing bytes in `[offset, offset+data.len())`, which must
    /// lie entirely within the object's current size (spec §4.4 `modify`).
    pub(crate) fn modify_object(
        &mut self,
        obj_id: ObjId,
        objix_hdr_pix: PageIx,
        offset: u32,
        data: &[u8],
    ) -> FsResult<usize> {
        let dps = self.geometry.data_page_size;
        let mut written = 0usize;
        let mut cursor_pix = objix_hdr_pix;
        let mut cursor_spix = 0u32;

        while written < data.len() {
            let cur_offset = offset + written as u32;
            let span_ix = cur_offset / dps;
            let page_off = cur_offset % dps;
            let chunk_len = (dps - page_off).min((data.len() - written) as u32);
            let chunk = &data[written..written + chunk_len as usize];

            let (ix_pix, spix) =
                self.resolve_index_page(obj_id, span_ix, objix_hdr_pix, cursor_pix, cursor_spix)?;
            cursor_pix = ix_pix;
            cursor_spix = spix;
            let entry_off = span_ix - (if spix == 0 { 0 } else {
                self.geometry.obj_hdr_ix_len + (spix - 1) * self.geometry.obj_ix_len
            });
            let old_pix = self.read_index_entry(ix_pix, spix == 0, entry_off)?;
            let old_addr = self.geometry.page_to_paddr(old_pix);
            let mut page_buf = vec![0u8; self.geometry.cfg.page_size as usize];
            self.hal_read(old_addr, &mut page_buf)?;
            let payload_start = PAGE_HDR_LEN as usize;
            payload_apply(&mut page_buf[payload_start..], page_off, chunk);
            let new_pix = self.move_page(obj_id, span_ix, false, old_pix, Some(&page_buf[payload_start..]))?;
            self.set_index_entry(obj_id, span_ix, objix_hdr_pix, new_pix)?;

            written += chunk_len as usize;
        }
        Ok(written)
    }

    /// Shrink an object to `new_size`, deleting whole trailing data pages
    /// and, for the straddling page, allocating a truncated replacement
    /// (spec §4.4 `truncate`).
    pub(crate) fn truncate_object(
        &mut self,
        obj_id: ObjId,
        objix_hdr_pix: PageIx,
        cur_size: u32,
        new_size: u32,
        remove_full: bool,
    ) -> FsResult<PageIx> {
        if new_size == 0 && remove_full {
            self.mark_header_being_deleted(obj_id, objix_hdr_pix)?;
        }

        let dps = self.geometry.data_page_size;
        let last_span = if cur_size == 0 { 0 } else { (cur_size - 1) / dps };
        let boundary_span = if new_size == 0 { 0 } else { (new_size - 1) / dps };

        let mut span = last_span as i64;
        let mut cursor_pix = objix_hdr_pix;
        let mut cursor_spix = u32::MAX;
        while span > boundary_span as i64 || (new_size == 0 && span >= 0) {
            let s = span as u32;
            if new_size > 0 && s == boundary_span && new_size % dps != 0 {
                break;
            }
            let (ix_pix, spix) = match self.resolve_index_page(obj_id, s, objix_hdr_pix, cursor_pix, cursor_spix) {
                Ok(r) => r,
                Err(FsError::NotFound) => break,
                Err(e) => return Err(e),
            };
            cursor_pix = ix_pix;
            cursor_spix = spix;
            let entry_off = s - (if spix == 0 { 0 } else {
                self.geometry.obj_hdr_ix_len + (spix - 1) * self.geometry.obj_ix_len
            });
            if let Ok(data_pix) = self.read_index_entry(ix_pix, spix == 0, entry_off) {
                if data_pix != u32::MAX && data_pix != 0 {
                    self.delete_page(data_pix)?;
                }
            }
            if spix > 0 && entry_off == 0 {
                self.delete_page(ix_pix)?;
                self.dispatch_event(IndexEvent::Deleted { obj_id: obj_id.raw_id(), span_ix: s });
                cursor_pix = objix_hdr_pix;
                cursor_spix = u32::MAX;
            }
            span -= 1;
            if span < 0 {
                break;
            }
        }

        if new_size > 0 && new_size % dps != 0 {
            let s = boundary_span;
            let (ix_pix, spix) = self.resolve_index_page(obj_id, s, objix_hdr_pix, objix_hdr_pix, u32::MAX)?;
            let entry_off = s - (if spix == 0 { 0 } else {
                self.geometry.obj_hdr_ix_len + (spix - 1) * self.geometry.obj_ix_len
            });
            let old_pix = self.read_index_entry(ix_pix, spix == 0, entry_off)?;
            let old_addr = self.geometry.page_to_paddr(old_pix);
            let keep = new_size % dps;
            let mut page_buf = vec![0u8; self.geometry.cfg.page_size as usize];
            self.hal_read(old_addr, &mut page_buf)?;
            let payload_start = PAGE_HDR_LEN as usize;
            let new_pix = self.allocate_data(
                obj_id,
                s,
                false,
                &page_buf[payload_start..payload_start + keep as usize],
                true,
            )?;
            self.delete_page(old_pix)?;
            self.set_index_entry(obj_id, s, objix_hdr_pix, new_pix)?;
        }

        if new_size == 0 && remove_full {
            self.delete_page(objix_hdr_pix)?;
            self.dispatch_event(IndexEvent::Deleted { obj_id: obj_id.raw_id(), span_ix: 0 });
            Ok(0)
        } else {
            self.update_index_hdr(obj_id, objix_hdr_pix, None, None, Some(new_size), false)
        }
    }

    fn mark_header_being_deleted(&mut self, obj_id: ObjId, pix: PageIx) -> FsResult<()> {
        let addr = self.geometry.page_to_paddr(pix);
        let mut hdr_buf = [0u8; PAGE_HDR_LEN as usize];
        self.hal_read(addr, &mut hdr_buf)?;
        let mut header = PageHeader::parse(&hdr_buf);
        header.flags = header.flags.mark_ix_deleted();
        header.write(&mut hdr_buf);
        self.hal_write(addr, &hdr_buf)?;
        let _ = obj_id;
        Ok(())
    }
}

fn payload_apply(payload: &mut [u8], offset: u32, chunk: &[u8]) {
    let o = offset as usize;
    payload[o..o + chunk.len()].copy_from_slice(chunk);
}
