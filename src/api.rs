//! Public filesystem API surface (spec §6).

use crate::error::{FsError, FsResult};
use crate::fd::{OpenFlags, Whence};
use crate::fs::Filesystem;
use crate::geometry::{ObjId, PageIx};
use crate::hal::Hal;
use crate::ixmap::{bytes_to_ix_map_entries, check_range, ix_map_entries_to_bytes, IndexMapSlot};
use crate::objix::ObjType;

fn name_hash(name: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in name.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub obj_id: u16,
    pub size: u32,
    pub obj_type: u8,
    pub pix: PageIx,
}

/// One `readdir_entries` result: enough to `open_by_dirent` without a second
/// name lookup (spec §6 `opendir`/`readdir`).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub obj_id: u16,
    pub pix: PageIx,
    pub name: String,
    pub size: u32,
    pub obj_type: u8,
}

impl<H: Hal> Filesystem<H> {
    fn require_mounted(&self) -> FsResult<()> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        Ok(())
    }

    /// Resolve a flat-namespace path (no separators, no nested directories
    /// per spec §1's Non-goals) to its header pix, scanning live index
    /// headers for a name match.
    fn lookup_header(&mut self, name: &str) -> FsResult<Option<(ObjId, PageIx)>> {
        let block_count = self.geometry.block_count();
        let entries = self.geometry.obj_lookup_max_entries();
        for block in 0..block_count {
            for e in 0..entries {
                let id = self.read_obj_lookup_entry(block, e)?;
                if id.is_free() || id.is_deleted() || !id.is_index() {
                    continue;
                }
                let pix = self.geometry.page_for_block(block, e);
                let addr = self.geometry.page_to_paddr(pix);
                let page_size = self.geometry.cfg.page_size as usize;
                let mut buf = vec![0u8; page_size];
                self.hal_read(addr, &mut buf)?;
                let header = crate::page::PageHeader::parse(&buf);
                if header.span_ix != 0 || !header.flags.is_final() || header.flags.is_deleted() {
                    continue;
                }
                let parsed = self.parse_index_header_pub(&buf);
                if parsed.name == name {
                    return Ok(Some((ObjId::new(id.raw_id()), pix)));
                }
            }
        }
        Ok(None)
    }

    fn parse_index_header_pub(&self, buf: &[u8]) -> crate::objix::IndexHeader {
        // thin wrapper so lookup_header (in this module) can reuse the
        // private parser defined in objix.rs
        self.parse_index_header_for_api(buf)
    }

    fn alloc_obj_id(&mut self) -> FsResult<ObjId> {
        let block_count = self.geometry.block_count();
        let entries = self.geometry.obj_lookup_max_entries();
        // Stay below the INDEX flag bit (spec §3 "high bit is the INDEX
        // flag") so a plain data obj_id never aliases an index obj_id.
        'outer: for candidate in 1u16..ObjId::INDEX_FLAG {
            for block in 0..block_count {
                for e in 0..entries {
                    let id = self.read_obj_lookup_entry(block, e)?;
                    if id.is_free() {
                        break;
                    }
                    if id.raw_id() == candidate {
                        continue 'outer;
                    }
                }
            }
            return Ok(ObjId::new(candidate));
        }
        Err(FsError::Full)
    }

    pub fn creat(&mut self, name: &str) -> FsResult<()> {
        self.require_mounted()?;
        if name.len() as u32 >= self.geometry.cfg.name_len {
            return Err(FsError::NameTooLong);
        }
        if self.lookup_header(name)?.is_some() {
            return Err(FsError::FileExists);
        }
        self.gc_check(self.geometry.data_page_size)?;
        let obj_id = self.alloc_obj_id()?;
        self.create_object(obj_id, name, &[], ObjType::File as u8)?;
        Ok(())
    }

    pub fn open(&mut self, name: &str, flags: OpenFlags) -> FsResult<u32> {
        self.require_mounted()?;
        let existing = self.lookup_header(name)?;
        if existing.is_some() && flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
            return Err(FsError::FileExists);
        }
        let (obj_id, hdr_pix) = match existing {
            Some(v) => v,
            None if flags.contains(OpenFlags::CREAT) => {
                self.creat(name)?;
                self.lookup_header(name)?.ok_or(FsError::NotFound)?
            }
            None => return Err(FsError::NotFound),
        };
        self.open_resolved(obj_id, hdr_pix, name_hash(name), flags)
    }

    /// Open an object whose header page is already known, bypassing the
    /// flat-namespace name scan `open` would otherwise perform (spec §6
    /// `open_by_page`). Used by `open_by_dirent` and by callers that cached
    /// a pix from a prior `readdir_entries`/`stat` call.
    pub fn open_by_page(&mut self, hdr_pix: PageIx, flags: OpenFlags) -> FsResult<u32> {
        self.require_mounted()?;
        let addr = self.geometry.page_to_paddr(hdr_pix);
        let page_size = self.geometry.cfg.page_size as usize;
        let mut buf = vec![0u8; page_size];
        self.hal_read(addr, &mut buf)?;
        let page_header = crate::page::PageHeader::parse(&buf);
        if !page_header.flags.is_final() || page_header.flags.is_deleted() {
            return Err(FsError::NotFound);
        }
        if page_header.span_ix != 0 || page_header.flags.is_data() {
            return Err(FsError::NotAFile);
        }
        let obj_id = ObjId::new(page_header.obj_id.raw_id());
        let parsed = self.parse_index_header_for_api(&buf);
        self.open_resolved(obj_id, hdr_pix, name_hash(&parsed.name), flags)
    }

    /// Open the object a `DirEntry` from `readdir_entries` refers to (spec
    /// §6 `open_by_dirent`): equivalent to `open_by_page(entry.pix, flags)`,
    /// named separately to mirror the directory-enumeration entry point.
    pub fn open_by_dirent(&mut self, entry: &DirEntry, flags: OpenFlags) -> FsResult<u32> {
        self.open_by_page(entry.pix, flags)
    }

    fn open_resolved(
        &mut self,
        obj_id: ObjId,
        hdr_pix: PageIx,
        hash: u64,
        flags: OpenFlags,
    ) -> FsResult<u32> {
        let header = {
            let addr = self.geometry.page_to_paddr(hdr_pix);
            let page_size = self.geometry.cfg.page_size as usize;
            let mut buf = vec![0u8; page_size];
            self.hal_read(addr, &mut buf)?;
            self.parse_index_header_for_api(&buf)
        };
        let mut size = header.size.unwrap_or(0);

        let idx = self.fds.find_new(hash).ok_or(FsError::OutOfFileDescs)?;
        let file_nbr = self.fds.open_slot(idx, obj_id, size, hdr_pix, flags, hash);

        if flags.contains(OpenFlags::TRUNC) && size > 0 {
            let new_hdr = self.truncate_object(obj_id, hdr_pix, size, 0, false)?;
            size = 0;
            if let Some(slot) = self.fds.get_mut(file_nbr) {
                slot.objix_hdr_pix = new_hdr;
                slot.size = 0;
            }
        }
        if flags.contains(OpenFlags::APPEND) {
            if let Some(slot) = self.fds.get_mut(file_nbr) {
                slot.offset = size;
            }
        }
        Ok(file_nbr)
    }

    pub fn close(&mut self, fh: u32) -> FsResult<()> {
        self.flush_write_cache(fh)?;
        if self.fds.close(fh) {
            Ok(())
        } else {
            Err(FsError::BadDescriptor)
        }
    }

    pub fn eof(&mut self, fh: u32) -> FsResult<bool> {
        self.flush_write_cache(fh)?;
        let fd = self.fds.get(fh).ok_or(FsError::BadDescriptor)?;
        Ok(fd.offset >= fd.size)
    }

    pub fn tell(&mut self, fh: u32) -> FsResult<u32> {
        self.flush_write_cache(fh)?;
        let fd = self.fds.get(fh).ok_or(FsError::BadDescriptor)?;
        Ok(fd.offset)
    }

    pub fn lseek(&mut self, fh: u32, offset: i64, whence: Whence) -> FsResult<u32> {
        self.flush_write_cache(fh)?;
        let fd = self.fds.get_mut(fh).ok_or(FsError::BadDescriptor)?;
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Cur => fd.offset as i64,
            Whence::End => fd.size as i64,
        };
        let new_off = base + offset;
        if new_off < 0 {
            return Err(FsError::SeekBounds);
        }
        fd.offset = new_off as u32;
        Ok(fd.offset)
    }

    pub fn read(&mut self, fh: u32, dst: &mut [u8]) -> FsResult<usize> {
        self.flush_write_cache(fh)?;
        let fd = self.fds.get(fh).ok_or(FsError::BadDescriptor)?;
        if !fd.flags.contains(OpenFlags::RDONLY) && !fd.flags.contains(OpenFlags::RDWR) {
            return Err(FsError::NotReadable);
        }
        let (obj_id, hdr_pix, offset, size) = (fd.obj_id, fd.objix_hdr_pix, fd.offset, fd.size);
        if offset >= size {
            return Ok(0);
        }
        let ix_map_data = fd
            .ix_map
            .and_then(|mi| self.index_maps[mi].as_ref())
            .map(|slot| (slot.start_spix, slot.map_buf.clone()));
        let n = self.read_object(
            obj_id,
            hdr_pix,
            offset,
            size,
            dst,
            ix_map_data.as_ref().map(|(s, v)| (*s, v.as_slice())),
        )?;
        if let Some(fd) = self.fds.get_mut(fh) {
            fd.offset += n as u32;
        }
        Ok(n)
    }

    pub fn write(&mut self, fh: u32, data: &[u8]) -> FsResult<usize> {
        let fd = self.fds.get(fh).ok_or(FsError::BadDescriptor)?.clone();
        if !fd.flags.contains(OpenFlags::WRONLY) && !fd.flags.contains(OpenFlags::RDWR) {
            return Err(FsError::NotWritable);
        }
        if self.read_only {
            return Err(FsError::RoNotImpl);
        }

        let direct = fd.flags.contains(OpenFlags::DIRECT) || !self.geometry.cfg.write_back || self.cache.is_none();
        if !direct && data.len() < self.geometry.data_page_size as usize {
            return self.buffered_write(fh, data);
        }
        self.flush_write_cache(fh)?;
        self.gc_check(data.len() as u32)?;

        let written = if fd.offset < fd.size {
            let within = (fd.size - fd.offset).min(data.len() as u32) as usize;
            let mut total = 0;
            if within > 0 {
                total += self.modify_object(fd.obj_id, fd.objix_hdr_pix, fd.offset, &data[..within])?;
            }
            if data.len() > within {
                total += self.append_object(
                    fd.obj_id,
                    fd.objix_hdr_pix,
                    fd.offset + within as u32,
                    fd.size,
                    &data[within..],
                )?;
            }
            total
        } else {
            self.append_object(fd.obj_id, fd.objix_hdr_pix, fd.offset, fd.size, data)?
        };

        let new_offset = fd.offset + written as u32;
        let new_size = fd.size.max(new_offset);
        if new_size != fd.size {
            self.update_index_hdr(fd.obj_id, fd.objix_hdr_pix, None, None, Some(new_size), false)?;
        }
        if let Some(slot) = self.fds.get_mut(fh) {
            slot.offset = new_offset;
            slot.size = new_size;
        }
        Ok(written)
    }

    fn buffered_write(&mut self, fh: u32, data: &[u8]) -> FsResult<usize> {
        let fd = self.fds.get(fh).ok_or(FsError::BadDescriptor)?.clone();
        let page_size = self.cache.as_ref().map(|c| c.page_size()).unwrap_or(0);
        let cache = self.cache.as_mut().ok_or(FsError::NotWritable)?;

        let needs_flush = match cache.find_write_frame(fd.obj_id.raw_id()) {
            Some(frame) => {
                if let crate::cache::FrameKey::Write { offset, len, .. } = frame.key {
                    (fd.offset != offset + len) || (len as usize + data.len() > page_size)
                } else {
                    false
                }
            }
            None => false,
        };
        if needs_flush {
            self.flush_write_cache(fh)?;
        }

        let cache = self.cache.as_mut().ok_or(FsError::NotWritable)?;
        let frame = match cache.find_write_frame(fd.obj_id.raw_id()) {
            Some(f) => f,
            None => cache.alloc_write_frame(fd.obj_id.raw_id(), fd.offset),
        };
        if let crate::cache::FrameKey::Write { len, .. } = &mut frame.key {
            let start = *len as usize;
            frame.data[start..start + data.len()].copy_from_slice(data);
            *len += data.len() as u32;
        }

        if let Some(slot) = self.fds.get_mut(fh) {
            slot.offset += data.len() as u32;
            slot.size = slot.size.max(slot.offset);
        }
        Ok(data.len())
    }

    fn flush_write_cache(&mut self, fh: u32) -> FsResult<()> {
        let fd = match self.fds.get(fh) {
            Some(f) => f.clone(),
            None => return Ok(()),
        };
        let frame = match self.cache.as_mut().and_then(|c| c.drop_write_frame(fd.obj_id.raw_id())) {
            Some(f) => f,
            None => return Ok(()),
        };
        let (offset, len) = match frame.key {
            crate::cache::FrameKey::Write { offset, len, .. } => (offset, len),
            _ => return Ok(()),
        };
        if len == 0 {
            return Ok(());
        }
        self.gc_check(len)?;
        let payload = &frame.data[..len as usize];
        let written = if offset < fd.size {
            let within = (fd.size - offset).min(len) as usize;
            let mut total = self.modify_object(fd.obj_id, fd.objix_hdr_pix, offset, &payload[..within])?;
            if payload.len() > within {
                total += self.append_object(fd.obj_id, fd.objix_hdr_pix, offset + within as u32, fd.size, &payload[within..])?;
            }
            total
        } else {
            self.append_object(fd.obj_id, fd.objix_hdr_pix, offset, fd.size, payload)?
        };
        let new_size = fd.size.max(offset + written as u32);
        if new_size != fd.size {
            self.update_index_hdr(fd.obj_id, fd.objix_hdr_pix, None, None, Some(new_size), false)?;
        }
        if let Some(slot) = self.fds.get_mut(fh) {
            slot.size = new_size;
        }
        Ok(())
    }

    pub fn fflush(&mut self, fh: u32) -> FsResult<()> {
        self.flush_write_cache(fh)
    }

    pub fn ftruncate(&mut self, fh: u32, new_size: u32) -> FsResult<()> {
        self.flush_write_cache(fh)?;
        let fd = self.fds.get(fh).ok_or(FsError::BadDescriptor)?.clone();
        if new_size > fd.size {
            return Err(FsError::EndOfObject);
        }
        let new_hdr = self.truncate_object(fd.obj_id, fd.objix_hdr_pix, fd.size, new_size, false)?;
        if let Some(slot) = self.fds.get_mut(fh) {
            slot.objix_hdr_pix = new_hdr;
            slot.size = new_size;
            if slot.offset > new_size {
                slot.offset = new_size;
            }
        }
        Ok(())
    }

    pub fn stat(&mut self, name: &str) -> FsResult<Stat> {
        let (obj_id, pix) = self.lookup_header(name)?.ok_or(FsError::NotFound)?;
        let addr = self.geometry.page_to_paddr(pix);
        let page_size = self.geometry.cfg.page_size as usize;
        let mut buf = vec![0u8; page_size];
        self.hal_read(addr, &mut buf)?;
        let header = self.parse_index_header_for_api(&buf);
        Ok(Stat { obj_id: obj_id.raw_id(), size: header.size.unwrap_or(0), obj_type: header.obj_type, pix })
    }

    pub fn fstat(&mut self, fh: u32) -> FsResult<Stat> {
        self.flush_write_cache(fh)?;
        let fd = self.fds.get(fh).ok_or(FsError::BadDescriptor)?.clone();
        let addr = self.geometry.page_to_paddr(fd.objix_hdr_pix);
        let page_size = self.geometry.cfg.page_size as usize;
        let mut buf = vec![0u8; page_size];
        self.hal_read(addr, &mut buf)?;
        let header = self.parse_index_header_for_api(&buf);
        Ok(Stat { obj_id: fd.obj_id.raw_id(), size: fd.size, obj_type: header.obj_type, pix: fd.objix_hdr_pix })
    }

    pub fn remove(&mut self, name: &str) -> FsResult<()> {
        let (obj_id, pix) = self.lookup_header(name)?.ok_or(FsError::NotFound)?;
        let addr = self.geometry.page_to_paddr(pix);
        let page_size = self.geometry.cfg.page_size as usize;
        let mut buf = vec![0u8; page_size];
        self.hal_read(addr, &mut buf)?;
        let header = self.parse_index_header_for_api(&buf);
        self.truncate_object(obj_id, pix, header.size.unwrap_or(0), 0, true)?;
        Ok(())
    }

    pub fn fremove(&mut self, fh: u32) -> FsResult<()> {
        self.flush_write_cache(fh)?;
        let fd = self.fds.get(fh).ok_or(FsError::BadDescriptor)?.clone();
        self.truncate_object(fd.obj_id, fd.objix_hdr_pix, fd.size, 0, true)?;
        self.fds.close(fh);
        Ok(())
    }

    pub fn rename(&mut self, old: &str, new: &str) -> FsResult<()> {
        if old == new {
            if self.lookup_header(old)?.is_some() {
                return Err(FsError::ConflictingName);
            }
            return Err(FsError::NotFound);
        }
        let (obj_id, pix) = self.lookup_header(old)?.ok_or(FsError::NotFound)?;
        if self.lookup_header(new)?.is_some() {
            return Err(FsError::ConflictingName);
        }
        self.update_index_hdr(obj_id, pix, Some(new), None, None, true)?;
        Ok(())
    }

    pub fn update_meta(&mut self, name: &str, meta: &[u8]) -> FsResult<()> {
        let (obj_id, pix) = self.lookup_header(name)?.ok_or(FsError::NotFound)?;
        self.update_index_hdr(obj_id, pix, None, Some(meta), None, true)?;
        Ok(())
    }

    pub fn fupdate_meta(&mut self, fh: u32, meta: &[u8]) -> FsResult<()> {
        let fd = self.fds.get(fh).ok_or(FsError::BadDescriptor)?.clone();
        let new_pix = self.update_index_hdr(fd.obj_id, fd.objix_hdr_pix, None, Some(meta), None, true)?;
        if let Some(slot) = self.fds.get_mut(fh) {
            slot.objix_hdr_pix = new_pix;
        }
        Ok(())
    }

    /// Iterate live index headers (objects whose OLU id has the INDEX flag
    /// and whose span-0 header is not deleted), returning their names (spec
    /// §6 `opendir`/`readdir`/`closedir`, collapsed into one call since
    /// there is no concurrent-mutation hazard in a single-threaded core).
    pub fn readdir(&mut self) -> FsResult<Vec<String>> {
        Ok(self.readdir_entries()?.into_iter().map(|e| e.name).collect())
    }

    /// Like `readdir`, but returns enough per-object detail (`pix`, `obj_id`,
    /// `size`, `obj_type`) to `open_by_dirent` without repeating the
    /// flat-namespace name scan `open`/`stat` would otherwise perform (spec
    /// §6 `opendir`/`readdir`, collapsed into one call per the comment on
    /// `readdir` above -- there is no concurrent-mutation hazard in a
    /// single-threaded core).
    pub fn readdir_entries(&mut self) -> FsResult<Vec<DirEntry>> {
        self.require_mounted()?;
        let block_count = self.geometry.block_count();
        let entries = self.geometry.obj_lookup_max_entries();
        let mut out = Vec::new();
        for block in 0..block_count {
            for e in 0..entries {
                let id = self.read_obj_lookup_entry(block, e)?;
                if id.is_free() || id.is_deleted() || !id.is_index() {
                    continue;
                }
                let pix = self.geometry.page_for_block(block, e);
                let addr = self.geometry.page_to_paddr(pix);
                let page_size = self.geometry.cfg.page_size as usize;
                let mut buf = vec![0u8; page_size];
                self.hal_read(addr, &mut buf)?;
                let header = crate::page::PageHeader::parse(&buf);
                if header.span_ix != 0 || !header.flags.is_final() || header.flags.is_deleted() {
                    continue;
                }
                let parsed = self.parse_index_header_for_api(&buf);
                out.push(DirEntry {
                    obj_id: id.raw_id(),
                    pix,
                    name: parsed.name,
                    size: parsed.size.unwrap_or(0),
                    obj_type: parsed.obj_type,
                });
            }
        }
        Ok(out)
    }

    pub fn gc_quick_pub(&mut self, max_free_pages: u32) -> FsResult<u32> {
        self.gc_quick(max_free_pages)
    }

    pub fn gc(&mut self, size: u32) -> FsResult<()> {
        self.gc_check(size)
    }

    pub fn bytes_to_ix_map_entries(&self, bytes: u32) -> u32 {
        bytes_to_ix_map_entries(bytes, self.geometry.data_page_size)
    }

    pub fn ix_map_entries_to_bytes(&self, entries: u32) -> u32 {
        ix_map_entries_to_bytes(entries, self.geometry.data_page_size)
    }

    /// Attach an index map covering `entries` spans starting at `start_spix`
    /// to `fh` (spec §4.9 `ix_map` / `populate_ix_map`).
    pub fn ix_map(&mut self, fh: u32, start_spix: u32, entries: usize) -> FsResult<()> {
        let fd = self.fds.get(fh).ok_or(FsError::BadDescriptor)?.clone();
        if fd.ix_map.is_some() {
            return Err(FsError::IxMapMapped);
        }
        let dps = self.geometry.data_page_size;
        let total_spans = fd.size.div_ceil(dps).max(1);
        check_range(start_spix, entries, total_spans)?;

        let idx = self.fds.index_of(fh).ok_or(FsError::BadDescriptor)?;
        let mut slot = IndexMapSlot::new(idx, fd.obj_id.raw_id(), start_spix, entries);
        self.populate_ix_map(&mut slot, fd.obj_id, fd.objix_hdr_pix)?;
        self.index_maps.push(Some(slot));
        let map_ix = self.index_maps.len() - 1;
        if let Some(s) = self.fds.get_mut(fh) {
            s.ix_map = Some(map_ix);
        }
        Ok(())
    }

    pub fn ix_unmap(&mut self, fh: u32) -> FsResult<()> {
        let fd = self.fds.get_mut(fh).ok_or(FsError::BadDescriptor)?;
        let map_ix = fd.ix_map.take().ok_or(FsError::IxMapUnmapped)?;
        self.index_maps[map_ix] = None;
        Ok(())
    }

    pub fn ix_remap(&mut self, fh: u32, new_start: u32) -> FsResult<()> {
        let fd = self.fds.get(fh).ok_or(FsError::BadDescriptor)?.clone();
        let map_ix = fd.ix_map.ok_or(FsError::IxMapUnmapped)?;
        let dps = self.geometry.data_page_size;
        let total_spans = fd.size.div_ceil(dps).max(1);
        let mut slot = self.index_maps[map_ix].take().ok_or(FsError::IxMapUnmapped)?;
        let len = slot.map_buf.len();
        if let Err(e) = check_range(new_start, len, total_spans) {
            self.index_maps[map_ix] = Some(slot);
            return Err(e);
        }
        slot.remap(new_start);
        let (obj_id, hdr_pix) = (fd.obj_id, fd.objix_hdr_pix);
        self.populate_ix_map(&mut slot, obj_id, hdr_pix)?;
        self.index_maps[map_ix] = Some(slot);
        Ok(())
    }

    fn populate_ix_map(&mut self, slot: &mut IndexMapSlot, obj_id: ObjId, hdr_pix: PageIx) -> FsResult<()> {
        let start = slot.start_spix;
        let end = slot.end_spix();
        for span in start..end {
            if let Ok((ix_pix, spix)) = self.resolve_index_page(obj_id, span, hdr_pix, hdr_pix, 0) {
                let entry_off = span
                    - (if spix == 0 { 0 } else { self.geometry.obj_hdr_ix_len + (spix - 1) * self.geometry.obj_ix_len });
                if let Ok(data_pix) = self.read_index_entry_pub(ix_pix, spix == 0, entry_off) {
                    if data_pix != 0 && data_pix != u32::MAX {
                        slot.set(span, data_pix);
                    }
                }
            }
        }
        Ok(())
    }

    fn read_index_entry_pub(&mut self, pix: PageIx, is_header: bool, offset: u32) -> FsResult<PageIx> {
        self.read_index_entry(pix, is_header, offset)
    }
}
