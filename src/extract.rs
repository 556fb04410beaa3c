//! Flattening of downloaded archives into a single table directory
//!
//! Archive entries are stored under their file name only, so any directory
//! structure inside of the archives is lost. When several entries share a
//! file name, the first one to be extracted is kept and later ones are
//! ignored, so the order in which archives are processed matters.

use crate::{
    archive::CompletionMarker,
    pipeline::StageReport,
    progress::{ProgressReport, Work},
    Result,
};
use anyhow::Context;
use std::{
    ffi::OsString,
    fs::File,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

/// What flattening an archive did to the table directory
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FlattenedArchive {
    /// Archive that was flattened
    pub archive: PathBuf,

    /// Tables that this archive introduced
    pub claimed: Vec<PathBuf>,

    /// Tables that already came from an earlier archive, and were left alone
    pub ignored: Vec<PathBuf>,
}

/// Flatten a sequence of archives into `flatten_dir`, in order
///
/// An archive that cannot be read is reported as a failure, and the next
/// archives are still processed.
pub fn flatten_all(
    flatten_dir: &Path,
    archives: Vec<PathBuf>,
    report: &ProgressReport,
    cancel: &CancellationToken,
) -> Result<StageReport<FlattenedArchive>> {
    std::fs::create_dir_all(flatten_dir)
        .with_context(|| format!("creating table directory {}", flatten_dir.display()))?;
    let progress = report.add("Extracting archives", Work::Steps(archives.len()));
    let mut outcome = StageReport::default();
    for archive in archives {
        if cancel.is_cancelled() {
            log::warn!("Extraction interrupted before {}", archive.display());
            break;
        }
        log::info!("Extracting {}", archive.display());
        let result = match flatten(flatten_dir, &archive, cancel) {
            Ok(Some(flattened)) => Ok(flattened),
            Ok(None) => {
                log::warn!("Extraction of {} was interrupted", archive.display());
                break;
            }
            Err(e) => Err(e),
        };
        outcome.record(archive, result);
        progress.make_progress(1);
    }
    progress.finish();
    Ok(outcome)
}

/// Flatten one archive into `flatten_dir`
///
/// Tables are only kept if the whole archive could be flattened: when an
/// archive fails or is interrupted midway, the tables that it claimed so far
/// are removed so that later archives can claim them. `None` is returned if
/// the extraction was interrupted.
pub fn flatten(
    flatten_dir: &Path,
    archive_path: &Path,
    cancel: &CancellationToken,
) -> Result<Option<FlattenedArchive>> {
    let context = || format!("extracting {}", archive_path.display());
    check_completion(archive_path).with_context(context)?;
    let file = File::open(archive_path).with_context(context)?;
    let mut archive = ZipArchive::new(file).with_context(context)?;

    let mut flattened = FlattenedArchive {
        archive: archive_path.to_owned(),
        ..Default::default()
    };
    match flatten_entries(&mut archive, flatten_dir, &mut flattened, cancel) {
        Ok(true) => {
            log::debug!(
                "{} introduced {} table(s) and repeated {} existing one(s)",
                flattened.archive.display(),
                flattened.claimed.len(),
                flattened.ignored.len()
            );
            Ok(Some(flattened))
        }
        Ok(false) => {
            release_claims(&flattened);
            Ok(None)
        }
        Err(e) => {
            release_claims(&flattened);
            Err(e)
        }
    }
}

/// Extract the file entries of an archive, recording them in `flattened`
///
/// Returns `false` if cancellation was requested before every entry was
/// extracted.
fn flatten_entries(
    archive: &mut ZipArchive<File>,
    flatten_dir: &Path,
    flattened: &mut FlattenedArchive,
    cancel: &CancellationToken,
) -> Result<bool> {
    let archive_path = flattened.archive.clone();
    for idx in 0..archive.len() {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        let mut entry = archive
            .by_index(idx)
            .with_context(|| format!("opening entry {idx} of {}", archive_path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let entry_name = entry.name().to_owned();
        let Some(file_name) = entry.enclosed_name().and_then(Path::file_name).map(OsString::from) else {
            log::warn!(
                "Skipping entry {entry_name:?} of {}, its name is unsafe",
                archive_path.display()
            );
            continue;
        };
        let target = flatten_dir.join(file_name);

        // Don't bother extracting entries that have already been claimed
        if target.exists() {
            log::debug!("Keeping existing {} over {entry_name:?}", target.display());
            flattened.ignored.push(target);
            continue;
        }

        // Extract to a temporary file, then try to claim the final name
        let entry_context = || format!("extracting {entry_name:?} to {}", flatten_dir.display());
        let mut temp = tempfile::Builder::new()
            .prefix(".extracting-")
            .tempfile_in(flatten_dir)
            .with_context(entry_context)?;
        io::copy(&mut entry, temp.as_file_mut()).with_context(entry_context)?;
        if claim(temp, &target).with_context(entry_context)? {
            log::debug!("Extracted {}", target.display());
            flattened.claimed.push(target);
        } else {
            log::debug!("Keeping existing {} over {entry_name:?}", target.display());
            flattened.ignored.push(target);
        }
    }
    Ok(true)
}

/// Give up the tables that an archive claimed
fn release_claims(flattened: &FlattenedArchive) {
    for table in &flattened.claimed {
        log::debug!("Giving up {}", table.display());
        if let Err(e) = std::fs::remove_file(table) {
            log::warn!("Could not remove {}: {e}", table.display());
        }
    }
}

/// Move a temporary file to `target`, unless `target` already exists
///
/// The existence check and the move are a single atomic operation, so among
/// concurrent claims of the same target exactly one succeeds. A temporary
/// file that loses the claim is deleted.
fn claim(temp: NamedTempFile, target: &Path) -> io::Result<bool> {
    match temp.persist_noclobber(target) {
        Ok(_file) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

/// Make sure that an archive matches its completion marker, if it has one
fn check_completion(archive: &Path) -> Result<()> {
    let Some(marker) = CompletionMarker::load(archive)? else {
        log::debug!("{} has no completion marker", archive.display());
        return Ok(());
    };
    let size = std::fs::metadata(archive)?.len();
    anyhow::ensure!(
        size == marker.bytes,
        "archive is {size} bytes long, but {} bytes were downloaded from {}",
        marker.bytes,
        marker.url
    );
    Ok(())
}
