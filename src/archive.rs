//! ZIP packaging of a finished working directory, and retention of the
//! archives it produces.

use crate::error::{CloneError, Result};
use crate::resolver::sanitize_segment;
use crate::site_tree::SavedFile;
use crate::store::sibling_temp_path;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// `<host>-<random>.zip`
pub fn archive_name(host: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    let host = match sanitize_segment(host) {
        h if h.is_empty() => "site".to_string(),
        h => h,
    };
    format!("{host}-{suffix}.zip")
}

/// Zips `files` (relative to `working_dir`) into a new archive under
/// `storage_dir` and returns its path.
///
/// The archive only appears at its final path once every entry is written
/// and the file is flushed to disk.
pub async fn create_archive(
    working_dir: &Path,
    files: Vec<SavedFile>,
    storage_dir: &Path,
    host: &str,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(storage_dir).await?;
    let destination = storage_dir.join(archive_name(host));

    let working_dir = working_dir.to_path_buf();
    let target = destination.clone();
    tokio::task::spawn_blocking(move || write_archive(&working_dir, &files, &target))
        .await
        .map_err(|e| CloneError::Task(e.to_string()))??;

    Ok(destination)
}

fn write_archive(working_dir: &Path, files: &[SavedFile], destination: &Path) -> Result<()> {
    let tmp = sibling_temp_path(destination);
    let result = write_entries(working_dir, files, &tmp).and_then(|()| {
        fs::rename(&tmp, destination)?;
        Ok(())
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_entries(working_dir: &Path, files: &[SavedFile], tmp: &Path) -> Result<()> {
    let mut zip = ZipWriter::new(BufWriter::new(File::create(tmp)?));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9));

    for file in files {
        zip.start_file(entry_name(&file.relative), options)?;
        let mut source = File::open(working_dir.join(&file.relative))?;
        io::copy(&mut source, &mut zip)?;
    }

    let writer = zip.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    debug!(path = ?tmp, entries = files.len(), "archive written");
    Ok(())
}

/// Entry names always use `/`, whatever the host separator.
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Deletes `.zip` files in `dir` older than `max_age`. Returns how many
/// were removed.
pub fn sweep_archives(dir: &Path, max_age: Duration) -> Result<usize> {
    sweep_archives_at(dir, max_age, SystemTime::now())
}

pub fn sweep_archives_at(dir: &Path, max_age: Duration, now: SystemTime) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || path.extension().map_or(true, |e| e != "zip") {
            continue;
        }

        let modified = fs::metadata(&path)?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age > max_age {
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = ?path, age_days = age.as_secs() / 86_400, "removed expired archive");
                    removed += 1;
                }
                Err(e) => warn!(path = ?path, error = %e, "could not remove expired archive"),
            }
        }
    }

    Ok(removed)
}
