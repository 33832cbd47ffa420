use std::fs;
use std::path::Path;

use filetime::FileTime;
use tempfile::tempdir;

use dirvault::archive::{INDEX_FILE_NAME, REMOVAL_LIST_NAME};
use dirvault::backup::{BackupEngine, BackupOptions};
use dirvault::index::FileIndex;
use dirvault::restore::{RestoreEngine, RestoreOptions};

fn set_times(path: &Path, secs: i64) {
    let t = FileTime::from_unix_time(secs, 0);
    filetime::set_file_times(path, t, t).unwrap();
}

fn mtime_secs(path: &Path) -> i64 {
    FileTime::from_last_modification_time(&fs::metadata(path).unwrap()).unix_seconds()
}

#[test]
fn backup_restore_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Setup: a small tree with nested dirs and binary content
    let source = tempdir()?;
    fs::write(source.path().join("hello.txt"), "Hello, world!")?;
    fs::create_dir(source.path().join("nested"))?;
    fs::write(source.path().join("nested/data.bin"), [0u8, 1, 2, 3, 250])?;
    set_times(&source.path().join("hello.txt"), 1_700_000_000);
    set_times(&source.path().join("nested/data.bin"), 1_700_000_100);

    // 2. Backup
    let target = tempdir()?;
    let report = BackupEngine::new(source.path(), target.path(), BackupOptions::default()).run()?;
    assert_eq!(report.modified, 2);
    assert!(target.path().join(INDEX_FILE_NAME).exists());

    // 3. Restore into a fresh directory
    let restored = tempdir()?;
    let report =
        RestoreEngine::new(target.path(), restored.path(), RestoreOptions::default()).run()?;
    assert_eq!(report.restored, 2);

    // 4. Content, length and second-granularity mtime survive the trip
    assert_eq!(fs::read(restored.path().join("hello.txt"))?, b"Hello, world!");
    assert_eq!(
        fs::read(restored.path().join("nested/data.bin"))?,
        [0u8, 1, 2, 3, 250]
    );
    assert_eq!(mtime_secs(&restored.path().join("hello.txt")), 1_700_000_000);
    assert_eq!(
        mtime_secs(&restored.path().join("nested/data.bin")),
        1_700_000_100
    );
    Ok(())
}

#[test]
fn per_file_containers_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    // threshold of one byte forces every file into its own container
    let source = tempdir()?;
    fs::write(source.path().join("notes.txt"), "compressible text ".repeat(20))?;
    fs::write(source.path().join("photo.jpg"), [0xFFu8, 0xD8, 0xFF, 0xE0])?;

    let target = tempdir()?;
    let options = BackupOptions {
        size_threshold: 1,
        ..BackupOptions::default()
    };
    BackupEngine::new(source.path(), target.path(), options).run()?;

    let index = FileIndex::load(&target.path().join(INDEX_FILE_NAME))?;
    let text = index.get("notes.txt").unwrap();
    let photo = index.get("photo.jpg").unwrap();
    assert!(text.archive_name.ends_with(".txt.gz"), "{}", text.archive_name);
    assert!(
        photo.archive_name.ends_with(".jpg.nopack"),
        "{}",
        photo.archive_name
    );
    assert!(target.path().join(&text.archive_name).exists());
    assert!(target.path().join(&photo.archive_name).exists());

    let restored = tempdir()?;
    let report =
        RestoreEngine::new(target.path(), restored.path(), RestoreOptions::default()).run()?;
    assert_eq!(report.restored, 2);
    assert_eq!(
        fs::read(restored.path().join("notes.txt"))?,
        "compressible text ".repeat(20).as_bytes()
    );
    assert_eq!(
        fs::read(restored.path().join("photo.jpg"))?,
        [0xFFu8, 0xD8, 0xFF, 0xE0]
    );
    Ok(())
}

#[test]
fn unchanged_rerun_writes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let source = tempdir()?;
    fs::write(source.path().join("a.txt"), "stable")?;

    let target = tempdir()?;
    BackupEngine::new(source.path(), target.path(), BackupOptions::default()).run()?;

    let mut listing_before: Vec<_> = fs::read_dir(target.path())?
        .map(|e| e.unwrap().file_name())
        .collect();
    listing_before.sort();

    let report = BackupEngine::new(source.path(), target.path(), BackupOptions::default()).run()?;
    assert_eq!(report.modified, 0);
    assert_eq!(report.unmodified, 1);

    let mut listing_after: Vec<_> = fs::read_dir(target.path())?
        .map(|e| e.unwrap().file_name())
        .collect();
    listing_after.sort();
    assert_eq!(listing_before, listing_after);
    Ok(())
}

#[test]
fn content_change_with_same_metadata_is_invisible() -> Result<(), Box<dyn std::error::Error>> {
    let source = tempdir()?;
    let file = source.path().join("a.txt");
    fs::write(&file, "aaaa")?;
    set_times(&file, 1_700_000_000);

    let target = tempdir()?;
    BackupEngine::new(source.path(), target.path(), BackupOptions::default()).run()?;

    // same length, timestamps pinned back: the diff cannot see this
    fs::write(&file, "bbbb")?;
    set_times(&file, 1_700_000_000);
    let report = BackupEngine::new(source.path(), target.path(), BackupOptions::default()).run()?;
    assert_eq!(report.modified, 0);

    // touching the mtime makes it visible again
    set_times(&file, 1_700_000_010);
    let report = BackupEngine::new(source.path(), target.path(), BackupOptions::default()).run()?;
    assert_eq!(report.modified, 1);
    Ok(())
}

#[test]
fn force_repacks_unchanged_files() -> Result<(), Box<dyn std::error::Error>> {
    let source = tempdir()?;
    fs::write(source.path().join("a.txt"), "stable")?;

    let target = tempdir()?;
    BackupEngine::new(source.path(), target.path(), BackupOptions::default()).run()?;

    let options = BackupOptions {
        force: true,
        ..BackupOptions::default()
    };
    let report = BackupEngine::new(source.path(), target.path(), options).run()?;
    assert_eq!(report.modified, 1);
    Ok(())
}

#[test]
fn deleted_files_leave_index_and_archives_are_collected() -> Result<(), Box<dyn std::error::Error>>
{
    let source = tempdir()?;
    fs::write(source.path().join("doomed.txt"), "x".repeat(100))?;
    fs::write(source.path().join("stays.txt"), "y".repeat(100))?;

    let target = tempdir()?;
    let options = || BackupOptions {
        size_threshold: 1, // dedicated container per file
        ..BackupOptions::default()
    };
    BackupEngine::new(source.path(), target.path(), options()).run()?;

    let index = FileIndex::load(&target.path().join(INDEX_FILE_NAME))?;
    let doomed_archive = index.get("doomed.txt").unwrap().archive_name.clone();

    // delete one file, modify the other so the run has something to write
    fs::remove_file(source.path().join("doomed.txt"))?;
    fs::write(source.path().join("stays.txt"), "z".repeat(120))?;
    let report = BackupEngine::new(source.path(), target.path(), options()).run()?;
    assert_eq!(report.removed, 1);
    assert_eq!(report.archives_collected, 1);

    let index = FileIndex::load(&target.path().join(INDEX_FILE_NAME))?;
    assert!(index.get("doomed.txt").is_none());
    assert!(index.get("stays.txt").is_some());
    assert!(!target.path().join(&doomed_archive).exists());
    Ok(())
}

#[test]
fn shadow_mode_defers_archive_removal() -> Result<(), Box<dyn std::error::Error>> {
    let source = tempdir()?;
    fs::write(source.path().join("doomed.txt"), "x".repeat(100))?;
    fs::write(source.path().join("stays.txt"), "y".repeat(100))?;

    let target = tempdir()?;
    let shadow = tempdir()?;
    let shadow_path = shadow.path().join("index.txt.gz");
    let options = || BackupOptions {
        size_threshold: 1,
        shadow_index: Some(shadow_path.clone()),
        ..BackupOptions::default()
    };
    BackupEngine::new(source.path(), target.path(), options()).run()?;
    assert!(shadow_path.exists());

    let index = FileIndex::load(&shadow_path)?;
    let doomed_archive = index.get("doomed.txt").unwrap().archive_name.clone();

    fs::remove_file(source.path().join("doomed.txt"))?;
    fs::write(source.path().join("stays.txt"), "z".repeat(120))?;
    BackupEngine::new(source.path(), target.path(), options()).run()?;

    // archive stays on disk; its name lands in the removal list
    assert!(target.path().join(&doomed_archive).exists());
    let removal_list = fs::read_to_string(target.path().join(REMOVAL_LIST_NAME))?;
    assert!(removal_list.lines().any(|l| l == doomed_archive));
    Ok(())
}

#[test]
fn restore_without_overwrite_skips_existing_targets() -> Result<(), Box<dyn std::error::Error>> {
    let source = tempdir()?;
    fs::write(source.path().join("a.txt"), "from backup")?;

    let target = tempdir()?;
    BackupEngine::new(source.path(), target.path(), BackupOptions::default()).run()?;

    let restored = tempdir()?;
    fs::write(restored.path().join("a.txt"), "already here")?;

    let report =
        RestoreEngine::new(target.path(), restored.path(), RestoreOptions::default()).run()?;
    assert_eq!(report.restored, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(fs::read(restored.path().join("a.txt"))?, b"already here");

    let options = RestoreOptions {
        overwrite: true,
        ..RestoreOptions::default()
    };
    let report = RestoreEngine::new(target.path(), restored.path(), options).run()?;
    assert_eq!(report.restored, 1);
    assert_eq!(fs::read(restored.path().join("a.txt"))?, b"from backup");
    Ok(())
}

#[test]
fn restore_filter_selects_entries() -> Result<(), Box<dyn std::error::Error>> {
    let source = tempdir()?;
    fs::write(source.path().join("keep.txt"), "keep")?;
    fs::write(source.path().join("other.log"), "other")?;

    let target = tempdir()?;
    BackupEngine::new(source.path(), target.path(), BackupOptions::default()).run()?;

    let restored = tempdir()?;
    let options = RestoreOptions {
        filter: vec!["*.txt".to_string()],
        ..RestoreOptions::default()
    };
    let report = RestoreEngine::new(target.path(), restored.path(), options).run()?;
    assert_eq!(report.restored, 1);
    assert!(restored.path().join("keep.txt").exists());
    assert!(!restored.path().join("other.log").exists());
    Ok(())
}

#[test]
fn index_entries_missing_from_shared_zip_are_reported() -> Result<(), Box<dyn std::error::Error>> {
    let source = tempdir()?;
    fs::write(source.path().join("a.txt"), "payload")?;

    let target = tempdir()?;
    BackupEngine::new(source.path(), target.path(), BackupOptions::default()).run()?;

    // swap the shared archive for a valid but empty zip: the index row for
    // a.txt now has no physical entry behind it
    let index = FileIndex::load(&target.path().join(INDEX_FILE_NAME))?;
    let archive = index.get("a.txt").unwrap().archive_name.clone();
    let file = fs::File::create(target.path().join(&archive))?;
    zip::ZipWriter::new(file).finish()?;

    let restored = tempdir()?;
    let report =
        RestoreEngine::new(target.path(), restored.path(), RestoreOptions::default()).run()?;
    assert_eq!(report.restored, 0);
    assert_eq!(report.skipped, 1);
    assert!(!restored.path().join("a.txt").exists());
    Ok(())
}

#[test]
fn readonly_attribute_round_trips() -> Result<(), Box<dyn std::error::Error>> {
    let source = tempdir()?;
    let file = source.path().join("locked.txt");
    fs::write(&file, "locked")?;
    let mut perms = fs::metadata(&file)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(&file, perms)?;

    let target = tempdir()?;
    BackupEngine::new(source.path(), target.path(), BackupOptions::default()).run()?;

    let restored = tempdir()?;
    RestoreEngine::new(target.path(), restored.path(), RestoreOptions::default()).run()?;
    assert!(fs::metadata(restored.path().join("locked.txt"))?
        .permissions()
        .readonly());

    // unlock so the temp dirs can be removed
    for dir in [source.path(), restored.path()] {
        let p = dir.join("locked.txt");
        let mut perms = fs::metadata(&p)?.permissions();
        perms.set_readonly(false);
        fs::set_permissions(&p, perms)?;
    }
    Ok(())
}
