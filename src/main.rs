//! # Marmot
//!
//! A command-line BitTorrent client, written in Rust.
//!
//! ```bash
//! marmot <torrent_file>
//! marmot <torrent_file> -o <output_file>
//! ```
//!
//! The main thread parses arguments, loads the torrent, and assembles the
//! download; one worker thread per peer handles the wire protocol.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use marmot::torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Args {
    /// The .torrent file to download
    torrent: PathBuf,

    /// Where to write the content (defaults to the name in the torrent)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// Keep the torrent-supplied name from escaping the working directory.
fn safe_output_name(name: &str) -> String {
    let cleaned = name.replace(['/', '\\'], "_");

    if cleaned.trim().is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

/// Ask whether an existing file may be replaced.
fn confirm_overwrite(path: &Path) -> Result<bool> {
    println!("{} already exists.", path.display());
    print!("Overwrite it? [y/N] ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;

    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn run(args: Args) -> Result<()> {
    // Load the metainfo and announce to its trackers
    let mut torrent = Torrent::new();
    torrent
        .open(args.torrent.clone())
        .with_context(|| format!("failed to load {}", args.torrent.display()))?;

    let output_path = args
        .output
        .unwrap_or_else(|| PathBuf::from(safe_output_name(torrent.name())));

    if output_path.exists() && !confirm_overwrite(&output_path)? {
        println!("Keeping the existing file, nothing downloaded.");
        return Ok(());
    }

    let data = torrent.download()?;

    fs::write(&output_path, &data)
        .with_context(|| format!("failed to write {}", output_path.display()))?;
    println!("Wrote {} bytes to {}.", data.len(), output_path.display());

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    if let Err(error) = run(Args::parse()) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}
