//! Page header type with one-way flag transitions, and the page-level
//! primitives `allocate_data` / `move_page` / `delete` (spec §4.3, §9 second
//! design note: "model as a small value type with explicit state-transition
//! methods; never expose raw write of arbitrary flag bytes").

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FsError, FsResult};
use crate::fs::{Filesystem, IndexEvent};
use crate::geometry::{ObjId, PageIx, SpanIx, PAGE_HDR_LEN, PH_OFF_FLAGS, PH_OFF_OBJ_ID, PH_OFF_SPAN_IX};
use crate::hal::Hal;

/// Bit positions within the flags byte. All transitions clear a bit (1→0);
/// an erased page reads all-ones, so every flag starts "not yet done".
mod bit {
    pub const USED: u8 = 1 << 0;
    pub const FINAL: u8 = 1 << 1;
    pub const INDEX: u8 = 1 << 2;
    pub const IXDELE: u8 = 1 << 6;
    pub const DELET: u8 = 1 << 7;
}

/// The page header flag byte, modeled so only one-way (1→0) transitions are
/// reachable through its API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u8);

impl PageFlags {
    pub const ERASED: PageFlags = PageFlags(0xFF);

    pub fn from_byte(b: u8) -> Self {
        PageFlags(b)
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    fn clear(self, bit: u8) -> Self {
        PageFlags(self.0 & !bit)
    }

    pub fn mark_used(self) -> Self {
        self.clear(bit::USED)
    }

    pub fn finalize(self) -> Self {
        self.clear(bit::FINAL)
    }

    pub fn mark_data(self) -> Self {
        self.clear(bit::INDEX)
    }

    pub fn mark_deleted(self) -> Self {
        self.clear(bit::DELET)
    }

    pub fn mark_ix_deleted(self) -> Self {
        self.clear(bit::IXDELE)
    }

    pub fn is_used(self) -> bool {
        self.0 & bit::USED == 0
    }

    pub fn is_final(self) -> bool {
        self.0 & bit::FINAL == 0
    }

    /// true => data page, false => index page (spec §3(B): "INDEX (0 = index
    /// page, 1 = data page)").
    pub fn is_data(self) -> bool {
        self.0 & bit::INDEX != 0
    }

    pub fn is_index(self) -> bool {
        !self.is_data()
    }

    pub fn is_deleted(self) -> bool {
        self.0 & bit::DELET == 0
    }

    pub fn is_ix_deleted(self) -> bool {
        self.0 & bit::IXDELE == 0
    }
}

/// Parsed page header (spec §3(B)).
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub obj_id: ObjId,
    pub span_ix: SpanIx,
    pub flags: PageFlags,
}

impl PageHeader {
    pub fn parse(buf: &[u8]) -> Self {
        let raw_id = LittleEndian::read_u16(&buf[PH_OFF_OBJ_ID..PH_OFF_OBJ_ID + 2]);
        let flags = PageFlags::from_byte(buf[PH_OFF_FLAGS]);
        let span_ix = LittleEndian::read_u32(&buf[PH_OFF_SPAN_IX..PH_OFF_SPAN_IX + 4]);
        PageHeader { obj_id: ObjId::new(raw_id), span_ix, flags }
    }

    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[PH_OFF_OBJ_ID..PH_OFF_OBJ_ID + 2], self.obj_id.0);
        buf[PH_OFF_FLAGS] = self.flags.as_byte();
        LittleEndian::write_u32(&mut buf[PH_OFF_SPAN_IX..PH_OFF_SPAN_IX + 4], self.span_ix);
    }

    /// Validate a header read back from media against the (obj_id, span_ix)
    /// the caller expected, per spec §4.3's structural-error group (c).
    pub fn validate_data(&self, expect_id: ObjId, expect_span: SpanIx) -> FsResult<()> {
        if !self.flags.is_used() {
            return Err(FsError::IsFree);
        }
        if self.flags.is_deleted() {
            return Err(FsError::Deleted);
        }
        if !self.flags.is_final() {
            return Err(FsError::NotFinalized);
        }
        if !self.flags.is_data() {
            return Err(FsError::IsIndex);
        }
        if self.obj_id.raw_id() != expect_id.raw_id() {
            return Err(FsError::IndexRefInvalid);
        }
        if self.span_ix != expect_span {
            return Err(FsError::DataSpanMismatch);
        }
        Ok(())
    }

    pub fn validate_index(&self, expect_id: ObjId, expect_span: SpanIx) -> FsResult<()> {
        if !self.flags.is_used() {
            return Err(FsError::IsFree);
        }
        if self.flags.is_deleted() {
            return Err(FsError::Deleted);
        }
        if !self.flags.is_final() {
            return Err(FsError::NotFinalized);
        }
        if !self.flags.is_index() {
            return Err(FsError::NotIndex);
        }
        if self.obj_id.raw_id() != expect_id.raw_id() {
            return Err(FsError::IndexRefInvalid);
        }
        if self.span_ix != expect_span {
            return Err(FsError::IndexSpanMismatch);
        }
        Ok(())
    }
}

impl<H: Hal> Filesystem<H> {
    /// Allocate a fresh page: find a free OLU entry, stamp the OLU slot,
    /// write the (not-yet-final) header, write the payload, optionally
    /// finalize (spec §4.3 `allocate_data`).
    pub(crate) fn allocate_data(
        &mut self,
        obj_id: ObjId,
        span_ix: SpanIx,
        is_index: bool,
        payload: &[u8],
        finalize: bool,
    ) -> FsResult<PageIx> {
        let pix = self.find_free()?;
        self.write_obj_lookup(pix, obj_id)?;

        let mut flags = PageFlags::ERASED.mark_used();
        if is_index {
            // data-page bit stays set (1) => index page per is_data() semantics
        } else {
            flags = flags.mark_data();
        }
        if finalize {
            flags = flags.finalize();
        }
        let header = PageHeader { obj_id, span_ix, flags };

        let addr = self.geometry.page_to_paddr(pix);
        let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
        header.write(&mut hdr_buf);
        self.hal_write(addr, &hdr_buf)?;
        self.hal_write(addr + PAGE_HDR_LEN, payload)?;

        self.stats_p_allocated += 1;
        tracing::debug!(pix, obj_id = obj_id.0, span_ix, "allocated page");
        Ok(pix)
    }

    pub(crate) fn finalize_page(&mut self, pix: PageIx) -> FsResult<()> {
        let addr = self.geometry.page_to_paddr(pix);
        let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
        self.hal_read(addr, &mut hdr_buf)?;
        let mut header = PageHeader::parse(&hdr_buf);
        header.flags = header.flags.finalize();
        header.write(&mut hdr_buf);
        self.hal_write(addr, &hdr_buf)
    }

    /// Move a page's payload to a new location, delete the source. If
    /// `page_data` is given (new content), writes it unfinalized then
    /// conditionally finalizes based on whether the source was final;
    /// otherwise performs a physical byte copy (spec §4.3 `move`).
    pub(crate) fn move_page(
        &mut self,
        obj_id: ObjId,
        span_ix: SpanIx,
        is_index: bool,
        src_pix: PageIx,
        page_data: Option<&[u8]>,
    ) -> FsResult<PageIx> {
        let src_addr = self.geometry.page_to_paddr(src_pix);
        let mut src_hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
        self.hal_read(src_addr, &mut src_hdr_buf)?;
        let src_header = PageHeader::parse(&src_hdr_buf);
        let was_final = src_header.flags.is_final();

        let dst_pix = self.find_free()?;
        self.write_obj_lookup(dst_pix, obj_id)?;
        let dst_addr = self.geometry.page_to_paddr(dst_pix);

        let mut flags = PageFlags::ERASED.mark_used();
        if !is_index {
            flags = flags.mark_data();
        }
        if let Some(data) = page_data {
            let mut header = PageHeader { obj_id, span_ix, flags };
            let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
            header.write(&mut hdr_buf);
            self.hal_write(dst_addr, &hdr_buf)?;
            self.hal_write(dst_addr + PAGE_HDR_LEN, data)?;
            if was_final {
                header.flags = header.flags.finalize();
                header.write(&mut hdr_buf);
                self.hal_write(dst_addr, &hdr_buf)?;
            }
        } else {
            let data_len = self.geometry.data_page_size;
            let mut buf = vec![0u8; data_len as usize];
            self.hal_read(src_addr + PAGE_HDR_LEN, &mut buf)?;
            let mut header = PageHeader { obj_id, span_ix, flags: flags.finalize() };
            let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
            header.write(&mut hdr_buf);
            self.hal_write(dst_addr, &hdr_buf)?;
            self.hal_write(dst_addr + PAGE_HDR_LEN, &buf)?;
        }

        self.stats_p_allocated += 1;
        self.delete_page(src_pix)?;
        tracing::debug!(src_pix, dst_pix, obj_id = obj_id.0, span_ix, "moved page");
        self.dispatch_event(IndexEvent::Moved { obj_id: obj_id.0, span_ix, new_pix: dst_pix });
        Ok(dst_pix)
    }

    /// Delete a page: OLU slot -> DELETED, header DELET bit cleared, optional
    /// secure-erase of the payload (spec §4.3 `delete`).
    pub(crate) fn delete_page(&mut self, pix: PageIx) -> FsResult<()> {
        self.write_obj_lookup(pix, ObjId::DELETED)?;

        let addr = self.geometry.page_to_paddr(pix);
        let mut hdr_buf = [0u8; crate::geometry::PAGE_HDR_LEN as usize];
        self.hal_read(addr, &mut hdr_buf)?;
        let mut header = PageHeader::parse(&hdr_buf);
        header.flags = header.flags.mark_deleted();
        header.write(&mut hdr_buf);
        self.hal_write(addr, &hdr_buf)?;

        if self.geometry.cfg.secure_erase {
            // Q4 (spec §9): a crash between the OLU write and this zeroing
            // leaves some payload bytes readable; permitted, not hidden.
            let zeros = vec![0u8; self.geometry.data_page_size as usize];
            self.hal_write(addr + PAGE_HDR_LEN, &zeros)?;
        }

        self.stats_p_deleted += 1;
        Ok(())
    }

    pub(crate) fn hal_read(&mut self, addr: u32, buf: &mut [u8]) -> FsResult<()> {
        self.hal
            .read(addr, buf)
            .map_err(|e| FsError::Media(std::io::Error::other(e.to_string())))
    }

    pub(crate) fn hal_write(&mut self, addr: u32, buf: &[u8]) -> FsResult<()> {
        self.hal
            .write(addr, buf)
            .map_err(|e| FsError::Media(std::io::Error::other(e.to_string())))
    }

    pub(crate) fn hal_erase(&mut self, addr: u32, len: u32) -> FsResult<()> {
        self.hal
            .erase(addr, len)
            .map_err(|e| FsError::Media(std::io::Error::other(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_transitions_are_one_way() {
        let f = PageFlags::ERASED;
        assert!(!f.is_used() && !f.is_final() && f.is_data() && !f.is_deleted() && !f.is_ix_deleted());

        let f = f.mark_used();
        assert!(f.is_used());
        let f = f.finalize();
        assert!(f.is_final());
        let f = f.mark_data();
        assert!(!f.is_data() && f.is_index());
        let f = f.mark_deleted();
        assert!(f.is_deleted());
        let f = f.mark_ix_deleted();
        assert!(f.is_ix_deleted());

        // re-applying an already-cleared transition is a no-op, never a set.
        let same = f.mark_used().finalize().mark_data().mark_deleted().mark_ix_deleted();
        assert_eq!(same, f);
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let header = PageHeader {
            obj_id: ObjId::new(0x1234),
            span_ix: 77,
            flags: PageFlags::ERASED.mark_used().finalize(),
        };
        let mut buf = [0u8; PAGE_HDR_LEN as usize];
        header.write(&mut buf);
        let parsed = PageHeader::parse(&buf);
        assert_eq!(parsed.obj_id, header.obj_id);
        assert_eq!(parsed.span_ix, header.span_ix);
        assert_eq!(parsed.flags, header.flags);
    }

    #[test]
    fn validate_data_rejects_wrong_span() {
        let header = PageHeader {
            obj_id: ObjId::new(5),
            span_ix: 2,
            flags: PageFlags::ERASED.mark_used().finalize(),
        };
        assert!(header.validate_data(ObjId::new(5), 2).is_ok());
        assert!(matches!(header.validate_data(ObjId::new(5), 3), Err(FsError::DataSpanMismatch)));
        assert!(matches!(header.validate_data(ObjId::new(6), 2), Err(FsError::IndexRefInvalid)));
    }

    #[test]
    fn validate_data_rejects_unfinalized_or_deleted() {
        let not_final = PageHeader {
            obj_id: ObjId::new(1),
            span_ix: 0,
            flags: PageFlags::ERASED.mark_used(),
        };
        assert!(matches!(not_final.validate_data(ObjId::new(1), 0), Err(FsError::NotFinalized)));

        let deleted = PageHeader {
            obj_id: ObjId::new(1),
            span_ix: 0,
            flags: PageFlags::ERASED.mark_used().finalize().mark_deleted(),
        };
        assert!(matches!(deleted.validate_data(ObjId::new(1), 0), Err(FsError::Deleted)));
    }
}
