//! Error taxonomy surfaced by the public API (spec §6/§7).

use thiserror::Error;

/// Every error the filesystem can return. Variants are grouped the way
/// spec §7 groups them: pre-condition, media, structural, quota.
#[derive(Debug, Error)]
pub enum FsError {
    // -- pre-condition errors --------------------------------------------
    #[error("filesystem is not mounted")]
    NotMounted,
    #[error("filesystem is not configured")]
    NotConfigured,
    #[error("filesystem is already mounted")]
    Mounted,
    #[error("name exceeds the configured NAME_LEN")]
    NameTooLong,
    #[error("no such object")]
    NotFound,
    #[error("object already exists")]
    FileExists,
    #[error("file descriptor is closed")]
    FileClosed,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("not a file")]
    NotAFile,
    #[error("descriptor not opened for reading")]
    NotReadable,
    #[error("descriptor not opened for writing")]
    NotWritable,
    #[error("read/seek past end of object")]
    EndOfObject,
    #[error("seek offset out of bounds")]
    SeekBounds,
    #[error("destination name already exists")]
    ConflictingName,

    // -- quota errors -----------------------------------------------------
    #[error("volume is full")]
    Full,
    #[error("no deleted blocks available to reclaim")]
    NoDeletedBlocks,
    #[error("out of file descriptors")]
    OutOfFileDescs,

    // -- media errors -------------------------------------------------------
    #[error("erase failed")]
    EraseFail,
    #[error("media I/O error: {0}")]
    Media(#[from] std::io::Error),

    // -- structural / consistency errors -----------------------------------
    #[error("volume does not contain a recognizable filesystem")]
    NotAFs,
    #[error("magic bookkeeping is not possible with this geometry")]
    MagicNotPossible,
    #[error("probe: volume does not look like a filesystem")]
    ProbeNotAFs,
    #[error("probe: too few blocks to determine geometry")]
    ProbeTooFewBlocks,
    #[error("object-lookup entry is free")]
    IsFree,
    #[error("object-lookup entry refers to a deleted page")]
    Deleted,
    #[error("page is not finalized")]
    NotFinalized,
    #[error("expected an index page")]
    NotIndex,
    #[error("expected a data page, found an index page")]
    IsIndex,
    #[error("index span does not match the requested span")]
    IndexSpanMismatch,
    #[error("data span does not match the requested span")]
    DataSpanMismatch,
    #[error("index entry references a free page")]
    IndexRefFree,
    #[error("index entry references an object-lookup entry, not a page")]
    IndexRefLu,
    #[error("index entry is invalid")]
    IndexRefInvalid,
    #[error("object-lookup entry is free where an index was expected")]
    IndexFree,
    #[error("object-lookup entry is not an index entry")]
    IndexLu,
    #[error("index entry is invalid")]
    IndexInvalid,
    #[error("index map is already mapped")]
    IxMapMapped,
    #[error("index map is not mapped")]
    IxMapUnmapped,
    #[error("index map range is out of bounds")]
    IxMapBadRange,

    // -- read-only mode -----------------------------------------------------
    #[error("operation not implemented in read-only mode")]
    RoNotImpl,
    #[error("operation aborted: filesystem is read-only")]
    RoAbortedOperation,
}

impl FsError {
    /// Conventional negative numeric code, mirroring the `fs.err_code`
    /// convention a POSIX/VFS collaborator would bridge to errno values.
    pub fn code(&self) -> i32 {
        use FsError::*;
        -(match self {
            NotMounted => 1,
            NotConfigured => 2,
            Mounted => 3,
            NameTooLong => 4,
            NotFound => 5,
            FileExists => 6,
            FileClosed => 7,
            BadDescriptor => 8,
            NotAFile => 9,
            NotReadable => 10,
            NotWritable => 11,
            EndOfObject => 12,
            SeekBounds => 13,
            ConflictingName => 14,
            Full => 15,
            NoDeletedBlocks => 16,
            EraseFail => 17,
            Media(_) => 18,
            NotAFs => 19,
            MagicNotPossible => 20,
            ProbeNotAFs => 21,
            ProbeTooFewBlocks => 22,
            IsFree => 23,
            Deleted => 24,
            NotFinalized => 25,
            NotIndex => 26,
            IsIndex => 27,
            IndexSpanMismatch => 28,
            DataSpanMismatch => 29,
            IndexRefFree => 30,
            IndexRefLu => 31,
            IndexRefInvalid => 32,
            IndexFree => 33,
            IndexLu => 34,
            IndexInvalid => 35,
            IxMapMapped => 36,
            IxMapUnmapped => 37,
            IxMapBadRange => 38,
            OutOfFileDescs => 39,
            RoNotImpl => 40,
            RoAbortedOperation => 41,
        } as i32)
    }
}

pub type FsResult<T> = Result<T, FsError>;
