//! Naming, discovery and completion tracking of local archives

use crate::{config::SourceConfig, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

/// Placeholder for the archive index in URL templates
pub const INDEX_PLACEHOLDER: &str = "{idx}";

/// Position of an archive in the remote numbered sequence
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveIndex(pub u32);
//
impl ArchiveIndex {
    /// Remote location of this archive
    pub fn url(self, source: &SourceConfig) -> Box<str> {
        source
            .url_template
            .replace(INDEX_PLACEHOLDER, &self.0.to_string())
            .into()
    }

    /// Local file name of this archive
    pub fn file_name(self, source: &SourceConfig) -> String {
        format!("{}{}.zip", source.archive_prefix, self.0)
    }

    /// Recognize a local archive file name, return its index
    pub fn from_file_name(source: &SourceConfig, file_name: &str) -> Option<Self> {
        let digits = file_name
            .strip_prefix(&*source.archive_prefix)?
            .strip_suffix(".zip")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(Self)
    }
}
//
impl fmt::Display for ArchiveIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Find the local archives of a directory, ordered by increasing index
///
/// Only files named like [`ArchiveIndex::file_name()`] are considered, so
/// partial downloads and completion markers are left out.
pub fn discover(source: &SourceConfig, raw_dir: &Path) -> Result<Vec<(ArchiveIndex, PathBuf)>> {
    let context = || format!("listing archives in {}", raw_dir.display());
    let mut archives = Vec::new();
    for entry in std::fs::read_dir(raw_dir).with_context(context)? {
        let entry = entry.with_context(context)?;
        if !entry.file_type().with_context(context)?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(index) = file_name
            .to_str()
            .and_then(|name| ArchiveIndex::from_file_name(source, name))
        else {
            continue;
        };
        archives.push((index, entry.path()));
    }
    archives.sort_unstable_by_key(|(index, _path)| *index);
    log::debug!("Found {} archive(s) in {}", archives.len(), raw_dir.display());
    Ok(archives)
}

/// Local state of an archive, as tracked by the fetch stage
#[derive(Debug)]
pub enum ArchiveState {
    /// Download has not started
    Pending,

    /// Download has started, but was interrupted before completion
    Downloading,

    /// Archive is fully downloaded and has a completion marker
    Complete {
        /// Archive size in bytes
        bytes: u64,
    },

    /// Download failed
    Failed(crate::fetch::FetchError),
}

/// Outcome of fetching one archive
#[derive(Debug)]
pub struct ArchiveFile {
    /// Which archive this is
    pub index: ArchiveIndex,

    /// Final location of the archive
    pub path: PathBuf,

    /// How far we got
    pub state: ArchiveState,
}
//
impl ArchiveFile {
    /// Truth that the archive was fully downloaded
    pub fn is_complete(&self) -> bool {
        matches!(self.state, ArchiveState::Complete { .. })
    }
}

/// Sibling file recording that an archive download completed
///
/// The archive itself is moved into place only once fully written, so its
/// presence already means that a download completed at some point. The
/// marker additionally tells where the archive came from and how large it
/// should be, which catches archives that were later truncated or replaced.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CompletionMarker {
    /// Index of the archive
    pub index: ArchiveIndex,

    /// URL that the archive was downloaded from
    pub url: Box<str>,

    /// Size of the archive in bytes
    pub bytes: u64,
}
//
impl CompletionMarker {
    /// Location of the marker of a given archive
    pub fn path(archive: &Path) -> PathBuf {
        sibling_with_suffix(archive, ".json")
    }

    /// Write down the marker of an archive
    pub async fn save(&self, archive: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(Self::path(archive), json).await
    }

    /// Read the marker of an archive, if any
    pub fn load(archive: &Path) -> Result<Option<Self>> {
        let path = Self::path(archive);
        let context = || format!("reading completion marker {}", path.display());
        match std::fs::read(&path) {
            Ok(json) => Ok(Some(serde_json::from_slice(&json).with_context(context)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(context),
        }
    }

    /// Remove the marker of an archive, if any
    pub async fn remove(archive: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(Self::path(archive)).await {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Location where an archive is written while it is being downloaded
pub fn partial_path(archive: &Path) -> PathBuf {
    sibling_with_suffix(archive, ".part")
}

/// Append a suffix to a file name, keeping the directory
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or(OsStr::new("")).to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}
