//! Main entry point for the dirvault CLI app

use dirvault::archive::DEFAULT_NO_COMPRESS;
use dirvault::backup::{BackupEngine, BackupOptions};
use dirvault::clean::{CleanEngine, CleanOptions};
use dirvault::cli::{self, Commands};
use dirvault::index::FileIndex;
use dirvault::progress::format_bytes;
use dirvault::restore::{RestoreEngine, RestoreOptions};
use dirvault::sync::{SyncOptions, SyncPipeline};

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_app() {
        if e.downcast_ref::<clap::Error>().is_none() {
            eprintln!("Error: {}", e);
        }
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let command = cli::run()?;

    match command {
        Commands::Backup {
            source,
            target,
            shadow_index,
            force,
            excludes,
            size_threshold,
            no_compress,
        } => {
            let no_compress = if no_compress.is_empty() {
                DEFAULT_NO_COMPRESS.iter().map(|s| s.to_string()).collect()
            } else {
                no_compress
            };
            let options = BackupOptions {
                shadow_index,
                force,
                excludes,
                size_threshold: size_threshold * 1024 * 1024,
                no_compress,
            };
            let report = BackupEngine::new(&source, &target, options).run()?;
            println!(
                "backup: {} modified, {} unmodified, {} removed, {} written",
                report.modified,
                report.unmodified,
                report.removed,
                format_bytes(report.bytes_written)
            );
        }
        Commands::Restore {
            source,
            target,
            overwrite,
            filters,
        } => {
            let options = RestoreOptions {
                overwrite,
                filter: filters,
            };
            let report = RestoreEngine::new(&source, &target, options).run()?;
            println!(
                "restore: {} restored, {} skipped, {} written",
                report.restored,
                report.skipped,
                format_bytes(report.bytes_written)
            );
        }
        Commands::Sync {
            source,
            target,
            excludes,
        } => {
            let report = SyncPipeline::new(&source, &target, SyncOptions { excludes }).run()?;
            println!(
                "sync: {} copied, {} deleted, {} failed, {} transferred",
                report.copied,
                report.deleted,
                report.failed,
                format_bytes(report.bytes_copied)
            );
        }
        Commands::Clean {
            target,
            age_days,
            excludes,
        } => {
            let options = CleanOptions {
                max_age: chrono::Duration::days(age_days),
                excludes,
            };
            let report = CleanEngine::new(&target, options).run()?;
            println!(
                "clean: {} files, {} directories, {} freed",
                report.deleted_files,
                report.deleted_dirs,
                format_bytes(report.bytes_freed)
            );
        }
        Commands::Index { path } => {
            let index = FileIndex::load(&path)?;
            for entry in index.iter() {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.relative_path,
                    entry.archive_name,
                    entry.length,
                    entry.modified_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}
