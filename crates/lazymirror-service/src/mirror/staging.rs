//! Staging files and the advisory lock that elects the master of a download.
//!
//! Every canonical cache entry has exactly one staging file, a hidden sibling in the same
//! directory. Whoever holds the exclusive lock on it is the master and writes the document,
//! everyone else tails it.

use std::fs::File as StdFile;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use walkdir::WalkDir;

const STAGING_PREFIX: &str = ".lazymirror-";
const STAGING_SUFFIX: &str = ".partial";

/// Returns the staging file path for the canonical entry at `local_path`.
pub fn staging_path(local_path: &Path) -> PathBuf {
    let file_name = local_path.file_name().unwrap_or_default();
    let digest = Sha256::digest(file_name.as_encoded_bytes());
    local_path.with_file_name(format!(
        "{STAGING_PREFIX}{}{STAGING_SUFFIX}",
        hex::encode(digest)
    ))
}

/// Whether `name` is the file name of a staging file.
pub fn is_staging_name(name: &str) -> bool {
    name.strip_prefix(STAGING_PREFIX)
        .and_then(|rest| rest.strip_suffix(STAGING_SUFFIX))
        .is_some_and(|hash| hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// An open handle to a staging file.
///
/// The lock, once acquired, belongs to this handle and is released when it is dropped. A handle
/// marked with [`set_discard_on_drop`](Self::set_discard_on_drop) removes the file before the
/// lock is released, unless it was unmarked again.
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
    /// A duplicate of `file`, sharing its open file description and therefore its lock.
    lock: StdFile,
    file: File,
    discard_on_drop: bool,
}

impl StagingFile {
    /// Opens the staging file, creating it if it does not exist yet.
    ///
    /// Existing content is left alone, it may belong to a download in progress.
    pub async fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        let lock = file.try_clone().await?.into_std().await;

        Ok(Self {
            path,
            lock,
            file,
            discard_on_drop: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempts to take the exclusive lock without waiting.
    ///
    /// Returns `false` if somebody else holds it.
    pub fn try_lock(&self) -> io::Result<bool> {
        match self.lock.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Discards all content and rewinds to the start.
    pub async fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(0).await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    pub async fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf).await
    }

    /// Reads from the current position, returning `0` at the current end of the file.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.file.flush().await
    }

    /// The current size of the file.
    pub async fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata().await?.len())
    }

    /// Whether dropping this handle removes the file.
    ///
    /// Only the lock holder may set this. It has to be cleared once the file was published or
    /// removed, as the path may belong to somebody else's staging file by then.
    pub fn set_discard_on_drop(&mut self, discard: bool) {
        self.discard_on_drop = discard;
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if !self.discard_on_drop {
            return;
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "removed unfinished staging file");
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "failed to remove staging file: {err}");
            }
        }
    }
}

/// Removes staging files left behind under `root`, returning how many were removed.
///
/// Staging files that are locked belong to a download in progress and are kept.
pub fn clean_staging(root: &Path) -> io::Result<usize> {
    let mut removed = 0;

    for entry in WalkDir::new(root) {
        let entry = entry?;
        let is_staging = entry.file_type().is_file()
            && entry.file_name().to_str().is_some_and(is_staging_name);
        if !is_staging {
            continue;
        }

        let file = match StdFile::open(entry.path()) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        if let Err(err) = file.try_lock_exclusive() {
            tracing::debug!(path = %entry.path().display(), "keeping staging file in use: {err}");
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                tracing::info!(path = %entry.path().display(), "removed stale staging file");
                removed += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }

    Ok(removed)
}
