//! Filesystem primitives of the mirror tree.

use std::io;
use std::path::Path;

use filetime::FileTime;
use tokio::fs;

/// Creates `path` and all of its missing parents.
///
/// Losing the race against a concurrent request creating the same directory is not an error.
pub async fn ensure_dir(path: &Path) -> io::Result<()> {
    match fs::create_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Returns the modification time of the regular file at `path`, in whole seconds.
///
/// Returns `None` if there is no such file.
pub async fn local_mtime(path: &Path) -> io::Result<Option<i64>> {
    let metadata = match fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    Ok(Some(
        FileTime::from_last_modification_time(&metadata).unix_seconds(),
    ))
}

/// Turns a completed staging file into the cache entry at `target`.
///
/// The staging file is stamped with `mtime` first, so the entry never becomes visible with a
/// different modification time. The rename atomically replaces an existing entry. Should the
/// platform refuse to replace it, the old entry is removed and the rename retried.
pub async fn publish(staging: &Path, target: &Path, mtime: i64) -> io::Result<()> {
    let mtime = FileTime::from_unix_time(mtime, 0);
    filetime::set_file_times(staging, mtime, mtime)?;

    if let Err(err) = fs::rename(staging, target).await {
        tracing::debug!(path = %target.display(), "replacing cache entry: {err}");
        discard(target).await?;
        fs::rename(staging, target).await?;
    }

    Ok(())
}

/// Removes the file at `path` if it exists.
pub async fn discard(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
