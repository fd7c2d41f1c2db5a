//! `fsutil`: drives the flash filesystem core against a file-backed image
//! (spec §1 `[ADD]`, SPEC_FULL.md §2/§6). A thin CLI, not core.

use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use clap::Parser;

use norfs::config::{FsUtilArgs, FsUtilCommand};
use norfs::hal::FileHal;
use norfs::{FsConfig, Filesystem, OpenFlags};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = FsUtilArgs::parse();
    let cfg = args.fs_config();

    match args.command {
        FsUtilCommand::Format => {
            let size = cfg.block_size as u64 * cfg.block_count as u64;
            let hal = FileHal::create(&args.image, size)
                .with_context(|| format!("creating image at {}", args.image.display()))?;
            Filesystem::format(cfg, hal)?;
            println!("formatted {} ({size} bytes)", args.image.display());
        }
        FsUtilCommand::Info => {
            let fs = mount(&args.image, cfg)?;
            let (total, used) = fs.info();
            println!("total={total} used={used} free={}", total - used);
        }
        FsUtilCommand::Fsck => {
            let mut fs = mount(&args.image, cfg)?;
            let report = fs.check()?;
            println!("{report:?}");
        }
        FsUtilCommand::Ls => {
            let mut fs = mount(&args.image, cfg)?;
            for name in fs.readdir()? {
                let st = fs.stat(&name)?;
                println!("{name}\t{}", st.size);
            }
        }
        FsUtilCommand::Cat { name } => {
            let mut fs = mount(&args.image, cfg.clone())?;
            let fh = fs.open(&name, OpenFlags::RDONLY)?;
            let mut buf = vec![0u8; cfg.page_size as usize];
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            loop {
                let n = fs.read(fh, &mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
            fs.close(fh)?;
        }
        FsUtilCommand::Put { name } => {
            let mut fs = mount(&args.image, cfg)?;
            let fh = fs.open(&name, OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::RDWR)?;
            let mut input = Vec::new();
            std::io::stdin().read_to_end(&mut input)?;
            let n = fs.write(fh, &input)?;
            fs.close(fh)?;
            if n != input.len() {
                bail!("short write: wrote {n} of {} bytes", input.len());
            }
        }
    }
    Ok(())
}

fn mount(path: &std::path::Path, cfg: FsConfig) -> Result<Filesystem<FileHal>> {
    let hal = FileHal::open(path).with_context(|| format!("opening image at {}", path.display()))?;
    Ok(Filesystem::mount(cfg, hal, 16)?)
}
