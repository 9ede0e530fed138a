//! Coordinates concurrent downloads of the same document.
//!
//! All requests for a document that is missing or stale race for the exclusive lock on its
//! staging file. The winner becomes the *master*: it streams the origin body to its client and
//! into the staging file, and renames the staging file over the cache entry once the body is
//! complete. Everybody else becomes a *follower*: it drops its own origin body unread and tails
//! the staging file instead, so the origin sees one download no matter how many clients ask.
//!
//! A follower knows the master is gone once it can take the lock itself. If the master left
//! without writing anything, the follower is promoted and downloads the document on its own.

use std::cmp;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;

use super::origin::{OriginBody, OriginMeta};
use super::staging::{StagingFile, staging_path};
use super::{MirrorError, WriteStream, store};

/// The size of the chunks followers read from the staging file.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// The part a request plays in a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Writes the staging file from the origin body.
    Master,
    /// Relays the staging file written by somebody else.
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Follower => "follower",
        }
    }
}

/// A request's stake in a download: its role and its handle on the staging file.
///
/// A master's claim removes the staging file when it is dropped without being run to the end,
/// e.g. when the client disconnects before the body is started or the runtime shuts down.
#[derive(Debug)]
pub struct Claim {
    role: Role,
    staging: StagingFile,
}

impl Claim {
    pub fn role(&self) -> Role {
        self.role
    }
}

/// How a successful transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Bytes relayed from the origin range response, or from another request's download.
    Relayed(u64),
    /// The document was downloaded and published as cache entry.
    Published(u64),
}

impl Completion {
    /// The number of bytes sent to the client.
    pub fn size(&self) -> u64 {
        match *self {
            Completion::Relayed(size) | Completion::Published(size) => size,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::Relayed(_) => "relayed",
            Completion::Published(_) => "published",
        }
    }
}

/// How a follower stopped tailing the staging file.
#[derive(Debug, PartialEq, Eq)]
enum FollowerExit {
    /// The whole document was relayed.
    Completed(u64),
    /// The master stopped after the given number of bytes.
    Abandoned(u64),
    /// The master stopped before writing anything.
    Vacated,
}

/// Runs the download protocol for one cache entry.
#[derive(Debug, Clone)]
pub struct DownloadCoordinator {
    local_path: PathBuf,
    staging_path: PathBuf,
    last_modified: i64,
    expected_len: Option<u64>,
    poll_interval: Duration,
}

impl DownloadCoordinator {
    pub fn new(local_path: PathBuf, meta: &OriginMeta, poll_interval: Duration) -> Self {
        Self {
            staging_path: staging_path(&local_path),
            local_path,
            last_modified: meta.last_modified,
            expected_len: meta.content_length,
            poll_interval,
        }
    }

    /// Opens the staging file and tries to become the master of the download.
    pub async fn claim(&self) -> Result<Claim, MirrorError> {
        let mut staging = StagingFile::open(self.staging_path.clone()).await?;
        let role = match staging.try_lock()? {
            true => {
                staging.set_discard_on_drop(true);
                // Followers must never see what a crashed download left behind.
                staging.truncate().await?;
                Role::Master
            }
            false => Role::Follower,
        };

        metric!(counter("download.role") += 1, "role" => role.as_str());
        tracing::debug!(
            path = %self.local_path.display(),
            role = role.as_str(),
            "claimed download"
        );

        Ok(Claim { role, staging })
    }

    /// Streams the document to `client` in the role of `claim`.
    ///
    /// `body` is the origin body of this request. Followers leave it unread unless they get
    /// promoted.
    pub async fn run(
        &self,
        claim: Claim,
        body: OriginBody,
        client: &mut impl WriteStream,
    ) -> Result<Completion, MirrorError> {
        let Claim { role, staging } = claim;
        if role == Role::Master {
            return self.run_master(staging, body, client).await;
        }

        match self.run_follower(staging, client).await? {
            FollowerExit::Completed(relayed) => return Ok(Completion::Relayed(relayed)),
            FollowerExit::Abandoned(relayed) => return Err(MirrorError::Abandoned { relayed }),
            FollowerExit::Vacated => {}
        }

        tracing::debug!(path = %self.local_path.display(), "master vanished, taking over");
        metric!(counter("download.promoted") += 1);

        // Followers get promoted at most once.
        let Claim { role, staging } = self.claim().await?;
        match role {
            Role::Master => self.run_master(staging, body, client).await,
            Role::Follower => match self.run_follower(staging, client).await? {
                FollowerExit::Completed(relayed) => Ok(Completion::Relayed(relayed)),
                FollowerExit::Abandoned(relayed) => Err(MirrorError::Abandoned { relayed }),
                FollowerExit::Vacated => Err(MirrorError::Abandoned { relayed: 0 }),
            },
        }
    }

    /// Writes the origin body to the client and the staging file, and publishes it.
    ///
    /// On any failure the staging file is removed before the lock is released. The staging file
    /// has been truncated by [`claim`](Self::claim).
    async fn run_master(
        &self,
        mut staging: StagingFile,
        body: OriginBody,
        client: &mut impl WriteStream,
    ) -> Result<Completion, MirrorError> {
        let result = async {
            let size = write_through(&mut staging, body, client).await?;
            store::publish(staging.path(), &self.local_path, self.last_modified).await?;
            Ok::<_, MirrorError>(size)
        }
        .await;

        match result {
            Ok(size) => {
                staging.set_discard_on_drop(false);
                tracing::info!(path = %self.local_path.display(), size, "published");
                Ok(Completion::Published(size))
            }
            Err(err) => {
                tracing::info!(path = %self.local_path.display(), "download aborted: {err}");
                if let Err(err) = store::discard(staging.path()).await {
                    tracing::warn!(
                        path = %staging.path().display(),
                        "failed to remove staging file: {err}"
                    );
                }
                staging.set_discard_on_drop(false);
                Err(err)
            }
        }
    }

    /// Relays the staging file until the document is complete or the master is gone.
    async fn run_follower(
        &self,
        mut staging: StagingFile,
        client: &mut impl WriteStream,
    ) -> Result<FollowerExit, MirrorError> {
        let mut buf = vec![0; CHUNK_SIZE];
        let mut relayed = 0;

        loop {
            if self.is_complete(relayed) {
                return Ok(FollowerExit::Completed(relayed));
            }

            let len = self.next_read_len(relayed);
            let read = staging.read(&mut buf[..len]).await?;
            if read > 0 {
                relay(client, &buf[..read]).await?;
                relayed += read as u64;
                continue;
            }

            ensure_not_truncated(&staging, relayed).await?;
            if staging.try_lock()? {
                break;
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        // The master is gone. Everything it wrote is in the file by now.
        ensure_not_truncated(&staging, relayed).await?;
        loop {
            let len = self.next_read_len(relayed);
            if len == 0 {
                break;
            }
            let read = staging.read(&mut buf[..len]).await?;
            if read == 0 {
                break;
            }
            relay(client, &buf[..read]).await?;
            relayed += read as u64;
        }

        Ok(match self.expected_len {
            _ if relayed == 0 && self.expected_len != Some(0) => FollowerExit::Vacated,
            Some(expected) if relayed < expected => FollowerExit::Abandoned(relayed),
            _ => FollowerExit::Completed(relayed),
        })
    }

    fn is_complete(&self, relayed: u64) -> bool {
        self.expected_len.is_some_and(|expected| relayed >= expected)
    }

    /// How much a follower reads next, never past the expected end of the document.
    fn next_read_len(&self, relayed: u64) -> usize {
        match self.expected_len {
            Some(expected) => {
                cmp::min(expected.saturating_sub(relayed), CHUNK_SIZE as u64) as usize
            }
            None => CHUNK_SIZE,
        }
    }
}

/// Streams `body` into the client first and into the staging file second, chunk by chunk.
async fn write_through(
    staging: &mut StagingFile,
    mut body: OriginBody,
    client: &mut impl WriteStream,
) -> Result<u64, MirrorError> {
    let mut size = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;
        client
            .write_buf(chunk.clone())
            .await
            .map_err(|_| MirrorError::ClientGone)?;
        staging.append(&chunk).await?;
    }

    staging.flush().await?;
    Ok(size)
}

/// Fails if the staging file shrank below what was already relayed.
///
/// That happens when a new master took over and started from scratch. What the follower relayed
/// so far does not belong to the new download.
async fn ensure_not_truncated(staging: &StagingFile, relayed: u64) -> Result<(), MirrorError> {
    if staging.size().await? < relayed {
        return Err(MirrorError::Abandoned { relayed });
    }
    Ok(())
}

async fn relay(client: &mut impl WriteStream, buf: &[u8]) -> Result<(), MirrorError> {
    client
        .write_buf(Bytes::copy_from_slice(buf))
        .await
        .map_err(|_| MirrorError::ClientGone)
}
