//! Command-line argument definitions for the `dirvault` binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Incrementally back up a directory tree into archive containers.
    #[command(alias = "b")]
    Backup {
        /// The directory to back up.
        source: PathBuf,

        /// The directory holding the index and the archive containers.
        target: PathBuf,

        /// Alternate index location. With a shadow index, stale archives are
        /// recorded in a removal list instead of deleted.
        #[arg(long)]
        shadow_index: Option<PathBuf>,

        /// Re-pack every file regardless of recorded metadata.
        #[arg(long)]
        force: bool,

        /// Exclude pattern: glob, or a `$`-prefixed regular expression. May
        /// be given multiple times.
        #[arg(short = 'x', long = "exclude")]
        excludes: Vec<String>,

        /// Size in MiB at which a file gets its own container instead of
        /// joining the shared archive.
        #[arg(long, default_value_t = 50)]
        size_threshold: u64,

        /// File extension stored without compression (e.g. `.jpg`). May be
        /// given multiple times; overrides the built-in list.
        #[arg(long = "no-compress")]
        no_compress: Vec<String>,
    },

    /// Restore files from a backup target directory.
    #[command(alias = "r")]
    Restore {
        /// The backup target directory (index + containers).
        source: PathBuf,

        /// The directory to restore into.
        target: PathBuf,

        /// Replace files that already exist at the target.
        #[arg(long)]
        overwrite: bool,

        /// Restore only entries matching this pattern. May be given multiple
        /// times.
        #[arg(short = 'f', long = "filter")]
        filters: Vec<String>,
    },

    /// Mirror a source directory onto a target directory.
    #[command(alias = "s")]
    Sync {
        /// The directory to read from.
        source: PathBuf,

        /// The directory made identical to the source.
        target: PathBuf,

        /// Exclude pattern, applied on both sides. May be given multiple
        /// times.
        #[arg(short = 'x', long = "exclude")]
        excludes: Vec<String>,
    },

    /// Delete files untouched for a given number of days, then drop empty
    /// directories.
    Clean {
        /// The directory to clean.
        target: PathBuf,

        /// Minimum age, in days, before a file is deleted.
        #[arg(long, default_value_t = 7)]
        age_days: i64,

        /// Exclude pattern. May be given multiple times.
        #[arg(short = 'x', long = "exclude")]
        excludes: Vec<String>,
    },

    /// Print the contents of a backup index file.
    #[command(alias = "i")]
    Index {
        /// Path to an index file (plain or gzipped).
        path: PathBuf,
    },
}

pub fn run() -> Result<Commands, Box<dyn std::error::Error>> {
    let args = Args::parse();
    Ok(args.command)
}
