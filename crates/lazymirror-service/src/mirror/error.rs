use std::error::Error;
use std::io;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Everything that can go wrong while mirroring a single request.
///
/// How each variant surfaces to the client is decided by
/// [`MirrorService::handle`](super::MirrorService::handle) for errors that happen before the
/// response started, and by the host for errors in the middle of a transfer.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The origin answered with an explicit non-success status.
    ///
    /// The status is authoritative and is passed on to the client unchanged.
    #[error("origin responded with {0}")]
    Origin(StatusCode),
    /// The origin did not answer in time.
    #[error("origin timed out after {0:?}")]
    Timeout(Duration),
    /// The origin could not be reached at all, e.g. DNS failure or connection refused.
    #[error("origin unreachable: {0}")]
    Unreachable(String),
    /// The request path cannot be mapped into the mirror tree.
    #[error("invalid request path")]
    InvalidPath,
    /// Writing to the client failed, most likely because it disconnected.
    #[error("client went away")]
    ClientGone,
    /// A follower's master released the staging file before the document was complete.
    #[error("download abandoned by its master after {relayed} bytes")]
    Abandoned { relayed: u64 },
    /// A local filesystem operation failed.
    #[error("local i/o failure")]
    Io(#[from] io::Error),
}

impl MirrorError {
    /// Classifies a transport level error from the origin client.
    ///
    /// `timeout` is the bound that applied to the failed operation.
    pub(super) fn from_reqwest(error: &reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            return Self::Timeout(timeout);
        }

        let mut error: &dyn Error = error;
        while let Some(src) = error.source() {
            error = src;
        }

        Self::Unreachable(error.to_string())
    }
}
