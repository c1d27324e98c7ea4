#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pfs::{OpenFlags, Vfs};
use pfs_types::{StorageGeometry, DEFAULT_BLOCK_COUNT, DEFAULT_BLOCK_SIZE};
use std::io::{Read, SeekFrom, Write};
use std::path::{Path, PathBuf};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "pfs", about = "pocketfs — a POSIX-style filesystem inside one file")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and format a new backing image.
    Format {
        /// Path of the image to create.
        image: PathBuf,
        /// Payload bytes per block.
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u16,
        /// Number of blocks in the image.
        #[arg(long, default_value_t = DEFAULT_BLOCK_COUNT)]
        block_count: u16,
    },
    /// Create a directory.
    Mkdir {
        image: PathBuf,
        /// Directory path, e.g. `Documents` or `Documents/archive`.
        path: String,
    },
    /// Remove an empty directory.
    Rmdir { image: PathBuf, path: String },
    /// Remove a file.
    Rm { image: PathBuf, path: String },
    /// Write to a file, creating it if needed.
    Write {
        image: PathBuf,
        path: String,
        /// Bytes to write; read from stdin when omitted.
        data: Option<String>,
        /// Append to the end instead of writing from offset 0.
        #[arg(long)]
        append: bool,
        /// Discard existing content first.
        #[arg(long)]
        truncate: bool,
    },
    /// Print a file's contents to stdout.
    Read { image: PathBuf, path: String },
    /// List a directory (the root when no path is given).
    Ls {
        image: PathBuf,
        #[arg(default_value = "")]
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Verify chain and namespace invariants.
    Check {
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Format {
            image,
            block_size,
            block_count,
        } => format_cmd(&image, block_size, block_count),
        Command::Mkdir { image, path } => {
            mount(&image)?.mkdir(&path)?;
            Ok(())
        }
        Command::Rmdir { image, path } => {
            mount(&image)?.rmdir(&path)?;
            Ok(())
        }
        Command::Rm { image, path } => {
            mount(&image)?.unlink(&path)?;
            Ok(())
        }
        Command::Write {
            image,
            path,
            data,
            append,
            truncate,
        } => write_cmd(&image, &path, data, append, truncate),
        Command::Read { image, path } => read_cmd(&image, &path),
        Command::Ls { image, path, json } => ls_cmd(&image, &path, json),
        Command::Check { image, json } => check_cmd(&image, json),
    }
}

fn mount(image: &Path) -> Result<Vfs<pfs_block::FileByteDevice>> {
    Vfs::mount_file(image).with_context(|| format!("mounting {}", image.display()))
}

fn format_cmd(image: &Path, block_size: u16, block_count: u16) -> Result<()> {
    let geometry = StorageGeometry::new(block_size, block_count).context("invalid geometry")?;
    Vfs::format_file(image, geometry)
        .with_context(|| format!("formatting {}", image.display()))?;
    println!(
        "formatted {} ({} blocks of {} bytes, {} bytes total)",
        image.display(),
        geometry.block_count(),
        geometry.block_size(),
        geometry.image_len(),
    );
    Ok(())
}

fn write_cmd(
    image: &Path,
    path: &str,
    data: Option<String>,
    append: bool,
    truncate: bool,
) -> Result<()> {
    let bytes = match data {
        Some(text) => text.into_bytes(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf).context("reading stdin")?;
            buf
        }
    };

    let mut flags = OpenFlags::CREATE;
    if append {
        flags |= OpenFlags::APPEND;
    }
    if truncate {
        flags |= OpenFlags::TRUNC;
    }

    let fs = mount(image)?;
    let fd = fs.open(path, flags)?;
    let wrote = fs.write(fd, &bytes)?;
    fs.close(fd);
    fs.sync()?;

    if wrote < bytes.len() {
        bail!("short write: {wrote} of {} bytes (image full)", bytes.len());
    }
    println!("wrote {wrote} bytes to {path}");
    Ok(())
}

fn read_cmd(image: &Path, path: &str) -> Result<()> {
    let fs = mount(image)?;
    let fd = fs.open(path, OpenFlags::empty())?;
    let len = fs.seek(fd, SeekFrom::End(0))?;
    fs.seek(fd, SeekFrom::Start(0))?;

    let mut buf = vec![0_u8; usize::try_from(len).context("file length")?];
    let got = fs.read(fd, &mut buf)?;
    fs.close(fd);

    std::io::stdout().write_all(&buf[..got])?;
    Ok(())
}

fn ls_cmd(image: &Path, path: &str, json: bool) -> Result<()> {
    let fs = mount(image)?;
    let entries = fs.list_dir(path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        println!("{:<4} {:>8}  {}", entry.kind, entry.length, entry.name);
    }
    Ok(())
}

fn check_cmd(image: &Path, json: bool) -> Result<()> {
    let fs = mount(image)?;
    let report = fs.check()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "blocks: {} in use, {} free, {} chains",
            report.chains.in_use, report.chains.free, report.chains.chains,
        );
        println!(
            "namespace: {} directories, {} files",
            report.directories, report.files,
        );
        for orphan in &report.chains.orphaned {
            println!("orphaned block: {orphan}");
        }
        for problem in report.chains.problems.iter().chain(&report.problems) {
            println!("problem: {problem}");
        }
    }

    if !report.is_clean() {
        bail!("structural check found problems");
    }
    Ok(())
}
