//! Fixed-count page cache with read caching and an optional per-fd
//! write-back path (spec §4.5).

use crate::fs::IndexEvent;
use crate::geometry::PageIx;

/// What a frame is keyed by: a read frame remembers the physical page it
/// mirrors; a write frame remembers the (obj_id, offset, len) of buffered,
/// not-yet-flushed content (spec §4.5's C union, modeled as a Rust enum per
/// spec §9's "no dynamic typing" note).
#[derive(Debug, Clone, Copy)]
pub enum FrameKey {
    Read { pix: PageIx },
    Write { obj_id: u16, offset: u32, len: u32 },
}

pub struct CacheFrame {
    pub key: FrameKey,
    pub last_access: u64,
    pub data: Vec<u8>,
}

/// A fixed pool of page-sized frames. Read misses evict the least-recently
/// accessed *read* frame; write frames are never evicted to satisfy a read
/// miss (spec §4.5).
pub struct Cache {
    page_size: usize,
    frames: Vec<Option<CacheFrame>>,
    clock: u64,
}

impl Cache {
    pub fn new(count: usize, page_size: usize) -> Self {
        Cache { page_size, frames: (0..count).map(|_| None).collect(), clock: 0 }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn lookup_read(&mut self, pix: PageIx) -> Option<&[u8]> {
        let now = self.tick();
        for frame in self.frames.iter_mut().flatten() {
            if let FrameKey::Read { pix: p } = frame.key {
                if p == pix {
                    frame.last_access = now;
                    return Some(&frame.data);
                }
            }
        }
        None
    }

    /// Insert a freshly-read page, evicting the LRU read frame if the pool
    /// is full of read frames (write frames are skipped for eviction).
    pub fn insert_read(&mut self, pix: PageIx, data: Vec<u8>) {
        let now = self.tick();
        if let Some(slot) = self.frames.iter_mut().find(|f| f.is_none()) {
            *slot = Some(CacheFrame { key: FrameKey::Read { pix }, last_access: now, data });
            return;
        }
        let victim = self
            .frames
            .iter_mut()
            .enumerate()
            .filter_map(|(i, f)| match f {
                Some(frame) if matches!(frame.key, FrameKey::Read { .. }) => Some((i, frame.last_access)),
                _ => None,
            })
            .min_by_key(|&(_, la)| la)
            .map(|(i, _)| i);
        if let Some(i) = victim {
            self.frames[i] = Some(CacheFrame { key: FrameKey::Read { pix }, last_access: now, data });
        }
        // if every frame is a write frame, the page simply isn't cached.
    }

    /// A write (of any kind) invalidates any read frame mirroring `pix`; a
    /// DELE write additionally drops the frame outright rather than keeping
    /// stale content around (spec §4.5).
    pub fn invalidate_read(&mut self, pix: PageIx) {
        for frame in self.frames.iter_mut() {
            if let Some(f) = frame {
                if matches!(f.key, FrameKey::Read { pix: p } if p == pix) {
                    *frame = None;
                }
            }
        }
    }

    pub fn find_write_frame(&mut self, obj_id: u16) -> Option<&mut CacheFrame> {
        self.frames.iter_mut().flatten().find(|f| matches!(f.key, FrameKey::Write { obj_id: o, .. } if o == obj_id))
    }

    pub fn alloc_write_frame(&mut self, obj_id: u16, offset: u32) -> &mut CacheFrame {
        let now = self.tick();
        let page_size = self.page_size;
        let idx = self.frames.iter().position(|f| f.is_none()).unwrap_or(0);
        self.frames[idx] = Some(CacheFrame {
            key: FrameKey::Write { obj_id, offset, len: 0 },
            last_access: now,
            data: vec![0u8; page_size],
        });
        self.frames[idx].as_mut().unwrap()
    }

    pub fn drop_write_frame(&mut self, obj_id: u16) -> Option<CacheFrame> {
        if let Some(i) = self.frames.iter().position(
            |f| matches!(f, Some(frame) if matches!(frame.key, FrameKey::Write { obj_id: o, .. } if o == obj_id)),
        ) {
            self.frames[i].take()
        } else {
            None
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Index mutations can reassign a page's identity (move/gc); drop any
    /// read frame for pages belonging to the affected object so a stale
    /// mirror is never served.
    pub fn on_index_event(&mut self, _ev: &IndexEvent) {
        // Conservative: read frames are keyed by physical pix, and pages are
        // never rewritten at the same pix once allocated, so no action is
        // required here beyond what invalidate_read already does at the
        // point of the write. Kept as an explicit hook for symmetry with
        // fd.rs/ixmap.rs's event subscriptions.
    }
}
