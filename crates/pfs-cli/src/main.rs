#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pfs_fuse::SessionConfig;
use pfs_provider::{DataProvider, FileDataProvider};
use pfs_types::Geometry;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pfs", about = "ParcelFS — on-demand verified package filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a local package file and serve it until the exit flag is
    /// touched.
    Serve {
        /// Path to the package file to serve.
        package: PathBuf,
        /// Mountpoint directory.
        mountpoint: PathBuf,
        /// Fetch block size in bytes.
        #[arg(long, default_value_t = 65_536)]
        block_size: u32,
        /// Name the package appears under inside the mount.
        #[arg(long, default_value = "package.zip")]
        package_name: String,
        /// Name of the shutdown flag file.
        #[arg(long, default_value = "exit")]
        exit_name: String,
    },
    /// Print the block geometry a package would be served with.
    Geometry {
        /// Path to the package file.
        package: PathBuf,
        /// Fetch block size in bytes.
        #[arg(long, default_value_t = 65_536)]
        block_size: u32,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct GeometryReport {
    file_size: u64,
    block_size: u32,
    file_blocks: u64,
    tail_bytes: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Serve {
            package,
            mountpoint,
            block_size,
            package_name,
            exit_name,
        } => serve(package, mountpoint, block_size, package_name, exit_name),
        Command::Geometry {
            package,
            block_size,
            json,
        } => geometry(&package, block_size, json),
    }
}

fn serve(
    package: PathBuf,
    mountpoint: PathBuf,
    block_size: u32,
    package_name: String,
    exit_name: String,
) -> Result<()> {
    let provider = FileDataProvider::open(&package, block_size)
        .with_context(|| format!("open package {}", package.display()))?;

    let mut config = SessionConfig::new(mountpoint);
    config.package_name = package_name;
    config.exit_name = exit_name;

    pfs_fuse::run(Box::new(provider), &config).context("serve package filesystem")?;
    Ok(())
}

fn geometry(package: &Path, block_size: u32, json: bool) -> Result<()> {
    let provider = FileDataProvider::open(package, block_size)
        .with_context(|| format!("open package {}", package.display()))?;
    let geometry = Geometry::new(provider.file_size(), provider.block_size())
        .context("validate package geometry")?;

    let report = GeometryReport {
        file_size: geometry.file_size(),
        block_size: geometry.block_size(),
        file_blocks: geometry.file_blocks(),
        tail_bytes: if geometry.file_blocks() == 0 {
            0
        } else {
            geometry.fetch_len(geometry.block_of(geometry.file_size() - 1))
        },
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize geometry report")?
        );
    } else {
        println!("file size:   {} bytes", report.file_size);
        println!("block size:  {} bytes", report.block_size);
        println!("blocks:      {}", report.file_blocks);
        println!("tail block:  {} bytes", report.tail_bytes);
    }
    Ok(())
}
