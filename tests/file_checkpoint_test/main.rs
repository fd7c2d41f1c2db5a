//! Scenario-driven checks against a real file-backed volume, exercised
//! through the public API rather than the internals. Bespoke `main()`
//! rather than the default test harness, driving a real tempfile-backed
//! image end to end.

use std::cell::Cell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use norfs::hal::FileHal;
use norfs::{FsConfig, FsError, Filesystem, OpenFlags, Whence};

fn small_cfg() -> FsConfig {
    FsConfig { page_size: 256, block_size: 4096, block_count: 16, ..FsConfig::default() }
}

/// A geometry where one block holds exactly two data-page OLU entries, so a
/// single small file (one header page + one data page) exactly fills one
/// block -- used by the GC-under-crammed-load scenario, where "alternate
/// files" must line up with "alternate blocks" for the reclaim bound to hold.
fn one_file_per_block_cfg() -> FsConfig {
    FsConfig { page_size: 1024, block_size: 3072, block_count: 16, ..FsConfig::default() }
}

fn formatted_image(cfg: &FsConfig) -> Result<tempfile::NamedTempFile> {
    let file = tempfile::NamedTempFile::new().context("creating temp image")?;
    let size = cfg.block_size as u64 * cfg.block_count as u64;
    let hal = FileHal::create(file.path(), size).context("creating image")?;
    Filesystem::format(cfg.clone(), hal)?;
    Ok(file)
}

fn mount(path: &std::path::Path, cfg: &FsConfig) -> Result<Filesystem<FileHal>> {
    let hal = FileHal::open(path)?;
    Ok(Filesystem::mount(cfg.clone(), hal, 8)?)
}

/// S1: a large round-trip through many spans, including the header/chain
/// boundary at `obj_hdr_ix_len` spans.
fn large_round_trip() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;
    let mut fs = mount(image.path(), &cfg)?;

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let fh = fs.open("big", OpenFlags::CREAT | OpenFlags::RDWR)?;
    let written = fs.write(fh, &payload)?;
    if written != payload.len() {
        bail!("short write: {written} of {}", payload.len());
    }
    fs.close(fh)?;

    let mut fs = mount(image.path(), &cfg)?;
    let fh = fs.open("big", OpenFlags::RDONLY)?;
    let mut readback = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = fs.read(fh, &mut buf)?;
        if n == 0 {
            break;
        }
        readback.extend_from_slice(&buf[..n]);
    }
    fs.close(fh)?;

    if readback != payload {
        bail!("round-trip mismatch: {} vs {} bytes", readback.len(), payload.len());
    }
    Ok(())
}

/// S2: overwrite a range that straddles a data-span boundary, leaving the
/// rest of the object untouched.
fn partial_overwrite_across_span_boundary() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;
    let mut fs = mount(image.path(), &cfg)?;

    let data_page_size = fs.geometry().data_page_size;
    let total = data_page_size * 3 + 10;
    let original: Vec<u8> = (0..total).map(|i| (i % 200) as u8).collect();
    let fh = fs.open("mid", OpenFlags::CREAT | OpenFlags::RDWR)?;
    fs.write(fh, &original)?;
    fs.close(fh)?;

    let patch_start = data_page_size as usize - 5;
    let patch: Vec<u8> = vec![0xAAu8; 10];

    let fh = fs.open("mid", OpenFlags::RDWR)?;
    fs.lseek(fh, patch_start as i64, norfs::Whence::Set)?;
    fs.write(fh, &patch)?;
    fs.close(fh)?;

    let mut expected = original.clone();
    expected[patch_start..patch_start + patch.len()].copy_from_slice(&patch);

    let fh = fs.open("mid", OpenFlags::RDONLY)?;
    let mut got = vec![0u8; expected.len()];
    let mut off = 0;
    while off < got.len() {
        let n = fs.read(fh, &mut got[off..])?;
        if n == 0 {
            break;
        }
        off += n;
    }
    fs.close(fh)?;

    if got != expected {
        bail!("patched region mismatch");
    }
    Ok(())
}

/// S3: rename onto an existing name must fail with ConflictingName, and
/// renaming a missing object must fail with NotFound.
fn rename_atomicity() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;
    let mut fs = mount(image.path(), &cfg)?;

    fs.creat("a")?;
    fs.creat("b")?;

    match fs.rename("a", "b") {
        Err(norfs::FsError::ConflictingName) => {}
        other => bail!("expected ConflictingName, got {other:?}"),
    }
    match fs.rename("ghost", "c") {
        Err(norfs::FsError::NotFound) => {}
        other => bail!("expected NotFound, got {other:?}"),
    }

    fs.rename("a", "c")?;
    if fs.stat("c").is_err() || fs.stat("a").is_ok() {
        bail!("rename did not move the object");
    }
    Ok(())
}

/// Create-and-delete churn under a small, crammed volume must keep succeeding
/// via incremental GC rather than failing with Full.
fn gc_under_load() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;
    let mut fs = mount(image.path(), &cfg)?;

    let chunk = vec![0x5Au8; fs.geometry().data_page_size as usize * 2];
    for round in 0..40 {
        let name = format!("churn{round}");
        let fh = fs.open(&name, OpenFlags::CREAT | OpenFlags::RDWR)?;
        fs.write(fh, &chunk)?;
        fs.close(fh)?;
        if round >= 2 {
            fs.remove(&format!("churn{}", round - 2))?;
        }
    }
    let report = fs.check()?;
    if report.orphaned_data_pages_removed != 0 || report.duplicate_spans_resolved != 0 {
        bail!("unexpected repairs needed after clean churn: {report:?}");
    }
    Ok(())
}

/// S4: fill the volume with one-data-page files until the next create yields
/// `Full`; remove alternate files; `gc_quick(0)` must succeed and free at
/// least `block_count / 4` blocks; a subsequent single-file create must then
/// succeed.
fn gc_reclaims_under_crammed_load() -> Result<()> {
    let cfg = one_file_per_block_cfg();
    let image = formatted_image(&cfg)?;
    let mut fs = mount(image.path(), &cfg)?;

    let page = vec![0x33u8; 16];
    let mut names = Vec::new();
    loop {
        let name = format!("fill{}", names.len());
        let fh = match fs.open(&name, OpenFlags::CREAT | OpenFlags::RDWR | OpenFlags::DIRECT) {
            Ok(fh) => fh,
            Err(FsError::Full) => break,
            Err(e) => return Err(e.into()),
        };
        match fs.write(fh, &page) {
            Ok(_) => {}
            Err(FsError::Full) => {
                fs.close(fh)?;
                fs.remove(&name)?;
                break;
            }
            Err(e) => return Err(e.into()),
        }
        fs.close(fh)?;
        names.push(name);
    }
    if names.is_empty() {
        bail!("volume never filled up");
    }

    for (i, name) in names.iter().enumerate() {
        if i % 2 == 0 {
            fs.remove(name)?;
        }
    }

    let reclaimed = fs.gc_quick_pub(0)?;
    let block_count = fs.geometry().block_count();
    if reclaimed < block_count / 4 {
        bail!("gc_quick(0) reclaimed only {reclaimed} of {block_count} blocks, expected >= {}", block_count / 4);
    }

    let fh = fs.open("after_gc", OpenFlags::CREAT | OpenFlags::RDWR)?;
    let written = fs.write(fh, b"room after gc")?;
    if written != b"room after gc".len() {
        bail!("short write after gc_quick reclaim");
    }
    fs.close(fh)?;

    Ok(())
}

/// S5: an index map must make subsequent reads skip object-index traversal
/// entirely -- measured by wrapping the HAL with a read-byte counter shared
/// via `Rc<Cell<u64>>` so the count survives after the `Filesystem` (and its
/// owned HAL) are handed off.
struct CountingHal {
    inner: FileHal,
    bytes_read: Rc<Cell<u64>>,
}

impl norfs::hal::Hal for CountingHal {
    type Error = std::io::Error;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.bytes_read.set(self.bytes_read.get() + buf.len() as u64);
        self.inner.read(addr, buf)
    }
    fn write(&mut self, addr: u32, buf: &[u8]) -> Result<(), Self::Error> {
        self.inner.write(addr, buf)
    }
    fn erase(&mut self, addr: u32, len: u32) -> Result<(), Self::Error> {
        self.inner.erase(addr, len)
    }
}

fn ix_map_reduces_reads() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;

    {
        let mut fs = mount(image.path(), &cfg)?;
        let dps = fs.geometry().data_page_size;
        let payload = vec![0x11u8; dps as usize * 5];
        let fh = fs.open("mapped", OpenFlags::CREAT | OpenFlags::RDWR)?;
        fs.write(fh, &payload)?;
        fs.close(fh)?;
    }

    let hal = FileHal::open(image.path())?;
    let counter = Rc::new(Cell::new(0u64));
    let counting = CountingHal { inner: hal, bytes_read: counter.clone() };
    let mut fs = Filesystem::mount(cfg.clone(), counting, 8)?;

    let dps = fs.geometry().data_page_size;
    let fh = fs.open("mapped", OpenFlags::RDONLY)?;
    let mut buf = vec![0u8; dps as usize];
    fs.read(fh, &mut buf)?;
    fs.close(fh)?;

    let entries = fs.bytes_to_ix_map_entries(dps * 5);
    let fh = fs.open("mapped", OpenFlags::RDONLY)?;
    fs.ix_map(fh, 0, entries as usize)?;

    let before = counter.get();
    for _ in 0..4 {
        fs.read(fh, &mut buf)?;
    }
    let after = counter.get();
    fs.close(fh)?;

    let data_bytes_read = after - before;
    // With the map populated, reads should cost close to exactly the data
    // payload: no extra index-header/chain traversal bytes.
    let budget = buf.len() as u64 * 4 + fs.geometry().cfg.page_size as u64;
    if data_bytes_read > budget {
        bail!("ix_map did not reduce read traffic: {data_bytes_read} bytes against a budget of {budget}");
    }
    Ok(())
}

/// S6: simulate a crash between writing a moved page's new OLU slot and
/// deleting the old one, by hand-injecting a duplicate (obj_id, span_ix)
/// OLU entry, then confirm `check()` keeps the newer page and repairs the
/// rest (spec §8 I2/I5).
fn check_resolves_duplicate_span() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;

    let obj_id: u16;
    {
        let mut fs = mount(image.path(), &cfg)?;
        fs.creat("dup")?;
        let fh = fs.open("dup", OpenFlags::RDWR)?;
        fs.write(fh, b"hello duplicate span")?;
        fs.close(fh)?;
        let st = fs.stat("dup")?;
        obj_id = st.obj_id;
    }

    // Hand-craft a second OLU entry pointing at a free data page, with a
    // page header claiming the same (obj_id, span_ix=0) -- mirroring what a
    // crash between OLU-write-dst and OLU-write-src-deleted would leave
    // behind (spec §8 S6).
    {
        let mut raw = std::fs::OpenOptions::new().read(true).write(true).open(image.path())?;

        let page_size = cfg.page_size as u64;
        let block_size = cfg.block_size as u64;
        let lu_pages = 1u64;
        let block1_base = block_size;
        let olu_addr = block1_base;
        let mut olu_entry = [0u8; 2];
        raw.seek(SeekFrom::Start(olu_addr))?;
        raw.read_exact(&mut olu_entry)?;
        if u16::from_le_bytes(olu_entry) != 0xFFFF {
            bail!("expected block 1 entry 0 to be free for this fixture");
        }
        raw.seek(SeekFrom::Start(olu_addr))?;
        raw.write_all(&obj_id.to_le_bytes())?;

        let dup_page_addr = block1_base + lu_pages * page_size;
        let mut hdr = [0u8; 8];
        hdr[0..2].copy_from_slice(&obj_id.to_le_bytes());
        // used+final bits cleared (0), data bit left set (1), delete bits
        // left erased (1): a finalized, live, non-deleted data page.
        hdr[2] = 0b1111_1100;
        hdr[4..8].copy_from_slice(&0u32.to_le_bytes());
        raw.seek(SeekFrom::Start(dup_page_addr))?;
        raw.write_all(&hdr)?;
    }

    let mut fs = mount(image.path(), &cfg)?;
    let report = fs.check()?;
    if report.duplicate_spans_resolved == 0 {
        bail!("check() did not resolve the injected duplicate span");
    }

    // Idempotent: a second pass over the now-repaired volume finds nothing
    // left to resolve, and the object is still enumerable.
    let second = fs.check()?;
    if second.duplicate_spans_resolved != 0 {
        bail!("duplicate resolution was not idempotent: {second:?}");
    }
    if !fs.readdir()?.iter().any(|n| n == "dup") {
        bail!("object disappeared after duplicate-span resolution");
    }
    Ok(())
}

/// `check()` must finish off a header left marked "being deleted" by a
/// crashed `ftruncate`/`remove` (its IXDELE bit cleared but the data pages
/// and header never actually removed) -- and must leave an unrelated,
/// perfectly healthy empty file alone (spec §8 I5; regression test for an
/// inverted IXDELE condition that once deleted healthy empty-file headers
/// instead of half-deleted ones).
fn check_finishes_half_deleted_header() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;

    let dying_pix: u32;
    {
        let mut fs = mount(image.path(), &cfg)?;
        fs.creat("untouched")?; // healthy, empty, never marked for deletion

        let fh = fs.open("dying", OpenFlags::CREAT | OpenFlags::RDWR)?;
        fs.write(fh, b"about to be half-deleted")?;
        fs.close(fh)?;
        dying_pix = fs.stat("dying")?.pix;
    }

    // Hand-clear the header's IXDELE bit in place, mirroring what
    // `truncate_object` writes before it starts removing pages, then crash
    // before any page is actually removed.
    {
        let mut raw = std::fs::OpenOptions::new().read(true).write(true).open(image.path())?;
        let page_size = cfg.page_size as u64;
        let block_size = cfg.block_size as u64;
        let lu_pages = 1u64;
        let data_pages_per_block = block_size / page_size - lu_pages;
        let block = dying_pix as u64 / data_pages_per_block;
        let within = dying_pix as u64 % data_pages_per_block;
        let page_addr = block * block_size + (lu_pages + within) * page_size;
        let flags_off = page_addr + 2; // PH_OFF_FLAGS
        raw.seek(SeekFrom::Start(flags_off))?;
        let mut byte = [0u8; 1];
        raw.read_exact(&mut byte)?;
        byte[0] &= !(1 << 6); // clear IXDELE bit
        raw.seek(SeekFrom::Start(flags_off))?;
        raw.write_all(&byte)?;
    }

    let mut fs = mount(image.path(), &cfg)?;
    let report = fs.check()?;
    if report.half_deleted_headers_finished == 0 {
        bail!("check() did not finish the half-deleted header");
    }

    let names = fs.readdir()?;
    if names.iter().any(|n| n == "dying") {
        bail!("half-deleted object is still visible after check()");
    }
    if !names.iter().any(|n| n == "untouched") {
        bail!("check() incorrectly deleted a healthy empty-file header");
    }
    if fs.stat("untouched").is_err() {
        bail!("untouched file lost its header entirely");
    }

    Ok(())
}

/// `open_by_dirent`/`open_by_page` must resolve to the same object `open`
/// would, without a name lookup.
fn open_by_dirent_matches_open_by_name() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;
    let mut fs = mount(image.path(), &cfg)?;

    let fh = fs.open("via_name", OpenFlags::CREAT | OpenFlags::RDWR)?;
    fs.write(fh, b"dirent open")?;
    fs.close(fh)?;

    let entry = fs
        .readdir_entries()?
        .into_iter()
        .find(|e| e.name == "via_name")
        .context("entry missing from readdir_entries")?;

    let fh = fs.open_by_dirent(&entry, OpenFlags::RDONLY)?;
    let mut got = vec![0u8; b"dirent open".len()];
    fs.read(fh, &mut got)?;
    fs.close(fh)?;
    if got != b"dirent open" {
        bail!("open_by_dirent read back the wrong content");
    }

    let fh = fs.open_by_page(entry.pix, OpenFlags::RDONLY)?;
    let mut got2 = vec![0u8; b"dirent open".len()];
    fs.read(fh, &mut got2)?;
    fs.close(fh)?;
    if got2 != got {
        bail!("open_by_page disagreed with open_by_dirent");
    }
    Ok(())
}

/// `CREAT | EXCL` against an existing name must fail with `FileExists`
/// rather than silently reopening or truncating it.
fn creat_excl_rejects_existing_name() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;
    let mut fs = mount(image.path(), &cfg)?;

    fs.creat("taken")?;
    match fs.open("taken", OpenFlags::CREAT | OpenFlags::EXCL | OpenFlags::RDWR) {
        Err(FsError::FileExists) => {}
        other => bail!("expected FileExists for CREAT|EXCL collision, got {other:?}"),
    }
    Ok(())
}

/// A seek landing before the start of the object must fail with
/// `SeekBounds` and leave the file position untouched.
fn lseek_rejects_negative_offset() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;
    let mut fs = mount(image.path(), &cfg)?;

    let fh = fs.open("seeker", OpenFlags::CREAT | OpenFlags::RDWR)?;
    fs.write(fh, b"0123456789")?;
    fs.lseek(fh, 4, Whence::Set)?;

    match fs.lseek(fh, -100, Whence::Cur) {
        Err(FsError::SeekBounds) => {}
        other => bail!("expected SeekBounds for a negative absolute offset, got {other:?}"),
    }
    if fs.tell(fh)? != 4 {
        bail!("rejected seek moved the file position");
    }
    Ok(())
}

/// Truncating past the current size must fail with `EndOfObject` (growing a
/// file is `write`'s job, not `ftruncate`'s).
fn ftruncate_rejects_growth() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;
    let mut fs = mount(image.path(), &cfg)?;

    let fh = fs.open("shrinker", OpenFlags::CREAT | OpenFlags::RDWR)?;
    fs.write(fh, b"short")?;

    match fs.ftruncate(fh, 1000) {
        Err(FsError::EndOfObject) => {}
        other => bail!("expected EndOfObject for ftruncate growth, got {other:?}"),
    }
    if fs.fstat(fh)?.size as usize != b"short".len() {
        bail!("rejected ftruncate changed the object size");
    }
    Ok(())
}

/// S4's write-capacity boundary: appending to a single object must keep
/// succeeding exactly up to the volume's true capacity and then fail with
/// `Full` -- deterministically, not just once.
fn write_reports_full_at_exact_capacity() -> Result<()> {
    let cfg = small_cfg();
    let image = formatted_image(&cfg)?;
    let mut fs = mount(image.path(), &cfg)?;

    let fh = fs.open("cap", OpenFlags::CREAT | OpenFlags::RDWR | OpenFlags::DIRECT)?;
    let chunk = vec![0x7Eu8; 64];
    let mut accepted = 0u64;
    loop {
        match fs.write(fh, &chunk) {
            Ok(n) if n == chunk.len() => accepted += n as u64,
            Ok(n) => bail!("short direct write: {n} of {}", chunk.len()),
            Err(FsError::Full) => break,
            Err(e) => return Err(e.into()),
        }
    }
    if accepted == 0 {
        bail!("volume reported Full on the very first chunk");
    }

    // Retrying past capacity must keep failing, not wedge or silently accept.
    match fs.write(fh, &chunk) {
        Err(FsError::Full) => {}
        other => bail!("expected Full past capacity on retry, got {other:?}"),
    }

    let stat = fs.fstat(fh)?;
    if stat.size as u64 != accepted {
        bail!("stat size {} does not match bytes actually accepted {accepted}", stat.size);
    }
    fs.close(fh)?;
    Ok(())
}

fn run(name: &str, f: fn() -> Result<()>) -> bool {
    match f() {
        Ok(()) => {
            println!("ok   {name}");
            true
        }
        Err(e) => {
            println!("FAIL {name}: {e:#}");
            false
        }
    }
}

fn main() {
    let checks: &[(&str, fn() -> Result<()>)] = &[
        ("large_round_trip", large_round_trip),
        ("partial_overwrite_across_span_boundary", partial_overwrite_across_span_boundary),
        ("rename_atomicity", rename_atomicity),
        ("gc_under_load", gc_under_load),
        ("gc_reclaims_under_crammed_load", gc_reclaims_under_crammed_load),
        ("ix_map_reduces_reads", ix_map_reduces_reads),
        ("check_resolves_duplicate_span", check_resolves_duplicate_span),
        ("check_finishes_half_deleted_header", check_finishes_half_deleted_header),
        ("open_by_dirent_matches_open_by_name", open_by_dirent_matches_open_by_name),
        ("creat_excl_rejects_existing_name", creat_excl_rejects_existing_name),
        ("lseek_rejects_negative_offset", lseek_rejects_negative_offset),
        ("ftruncate_rejects_growth", ftruncate_rejects_growth),
        ("write_reports_full_at_exact_capacity", write_reports_full_at_exact_capacity),
    ];

    let mut all_ok = true;
    for (name, f) in checks {
        all_ok &= run(name, *f);
    }
    if !all_ok {
        std::process::exit(1);
    }
}
