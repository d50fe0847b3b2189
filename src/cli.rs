use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sector-fs", about = "Inspect and pack sector file system images")]
pub struct Cli {
    /// Disk image backing the file system
    #[arg(long, short, default_value = "fs.img")]
    pub image: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a fresh, empty file system on the image
    Format {
        /// Number of sectors, a multiple of 8
        #[arg(long, short, default_value_t = 0x4000)]
        sectors: usize,
    },
    /// Copy a host file into the file system
    Copy { host: PathBuf, path: String },
    /// Print a file to stdout
    Cat { path: String },
    /// Create a directory
    Mkdir { path: String },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
        /// Walk the whole subtree
        #[arg(long, short)]
        recursive: bool,
    },
    /// Remove a file, or a whole subtree with -r
    Rm {
        path: String,
        #[arg(long, short)]
        recursive: bool,
    },
    /// Dump headers and contents of the root directory
    Dump,
    /// Show which sectors hold nested file headers
    Usage,
    /// Compare the directory tree against the free map
    Check,
}
