//! Mirroring of origin documents into the local tree.
//!
//! [`MirrorService::handle`] decides for a single request whether the host should serve the
//! local copy, answer by itself, or stream a [`Transfer`] from the origin. The transfer
//! downloads the document into the mirror tree as a side effect, coordinating with concurrent
//! requests for the same document.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::Context;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::HeaderValue;

use crate::config::Config;
use crate::utils::http::{OriginTimeouts, create_client};

mod client;
mod coordinator;
mod error;
mod freshness;
mod measure;
mod origin;
mod router;
mod staging;
mod store;

pub use client::WriteStream;
pub use coordinator::{CHUNK_SIZE, Claim, Completion, DownloadCoordinator, Role};
pub use error::MirrorError;
pub use freshness::Freshness;
pub use origin::{OriginBody, OriginFetcher, OriginMeta, OriginResponse};
pub use router::{ROBOTS_POLICY, RequestRouter, Resolution, Route, Target};
pub use staging::{clean_staging, is_staging_name, staging_path};

use self::measure::TransferGuard;

/// A `GET` request for a mirrored document.
#[derive(Debug, Clone)]
pub struct MirrorRequest {
    /// The percent-encoded request path, without query string.
    pub path: String,
    /// The client's `Range` header, forwarded to the origin as is.
    pub range: Option<HeaderValue>,
}

/// Why the host should serve a request from the mirror tree on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    /// `robots.txt` is served from the mirror tree.
    LocalRobots,
    /// The local copy is up to date.
    Fresh,
    /// The origin is unreachable, the local copy is the best we have.
    Unreachable,
    /// The mirror tree could not be prepared for a download.
    LocalIo,
    /// Something unexpected went wrong.
    Internal,
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::LocalRobots => "local_robots",
            DeclineReason::Fresh => "fresh",
            DeclineReason::Unreachable => "unreachable",
            DeclineReason::LocalIo => "local_io",
            DeclineReason::Internal => "internal",
        }
    }
}

/// What the host should answer.
#[derive(Debug)]
pub enum Outcome {
    /// Respond with [`ROBOTS_POLICY`].
    Robots,
    /// Redirect to the given path with `302 Found`.
    Redirect(String),
    /// Serve the request from the mirror tree.
    Decline(DeclineReason),
    /// Respond with the status and an empty body.
    Failed(StatusCode),
    /// Stream a document from the origin.
    Transfer(Transfer),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Robots => "robots",
            Outcome::Redirect(_) => "redirect",
            Outcome::Decline(_) => "decline",
            Outcome::Failed(_) => "failed",
            Outcome::Transfer(_) => "transfer",
        }
    }
}

/// The response head of a [`Transfer`].
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub content_length: Option<u64>,
    pub content_range: Option<HeaderValue>,
    /// The normalized `Last-Modified` of the origin, in unix seconds.
    pub last_modified: i64,
}

impl ResponseHead {
    fn from_meta(meta: &OriginMeta) -> Self {
        let status = match meta.content_range {
            Some(_) => StatusCode::PARTIAL_CONTENT,
            None => meta.status,
        };

        Self {
            status,
            content_type: meta.content_type.clone(),
            content_length: meta.content_length,
            content_range: meta.content_range.clone(),
            last_modified: meta.last_modified,
        }
    }

    /// The `Last-Modified` header value.
    pub fn last_modified_http(&self) -> String {
        let secs = u64::try_from(self.last_modified).unwrap_or_default();
        httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(secs))
    }
}

/// A document ready to be streamed to the client.
///
/// Nothing has been sent yet, the host is expected to send [`head`](Self::head) and then
/// [`run`](Self::run) the transfer to produce the body.
#[derive(Debug)]
pub struct Transfer {
    head: ResponseHead,
    kind: TransferKind,
}

enum TransferKind {
    /// A range response, passed through without touching the mirror tree.
    Relay(OriginBody),
    /// A full document, downloaded into the mirror tree or tailed from another download.
    Download {
        coordinator: DownloadCoordinator,
        claim: Claim,
        body: OriginBody,
    },
}

impl std::fmt::Debug for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferKind::Relay(_) => f.write_str("Relay"),
            TransferKind::Download { claim, .. } => f
                .debug_struct("Download")
                .field("role", &claim.role())
                .finish_non_exhaustive(),
        }
    }
}

impl Transfer {
    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// The role in the download, `None` for range responses.
    pub fn role(&self) -> Option<Role> {
        match &self.kind {
            TransferKind::Relay(_) => None,
            TransferKind::Download { claim, .. } => Some(claim.role()),
        }
    }

    /// Streams the body to `client`.
    ///
    /// An error means the body sent so far is incomplete, and the host has to make sure the
    /// client notices.
    pub async fn run(self, client: &mut impl WriteStream) -> Result<Completion, MirrorError> {
        match self.kind {
            TransferKind::Relay(mut body) => {
                let mut size = 0;
                while let Some(chunk) = body.next().await {
                    let chunk = chunk?;
                    size += chunk.len() as u64;
                    client
                        .write_buf(chunk)
                        .await
                        .map_err(|_| MirrorError::ClientGone)?;
                }
                Ok(Completion::Relayed(size))
            }
            TransferKind::Download {
                coordinator,
                claim,
                body,
            } => {
                let guard = TransferGuard::new(claim.role());
                let result = coordinator.run(claim, body, client).await;
                guard.done(&result);
                result
            }
        }
    }
}

#[derive(Debug)]
struct MirrorServiceInner {
    mirror_root: PathBuf,
    router: RequestRouter,
    fetcher: OriginFetcher,
    poll_interval: Duration,
}

/// Serves requests from the mirror tree, downloading documents from the origin on demand.
#[derive(Debug, Clone)]
pub struct MirrorService {
    inner: Arc<MirrorServiceInner>,
}

impl MirrorService {
    pub fn create(config: &Config) -> anyhow::Result<Self> {
        let upstream = config.upstream()?;
        let timeouts = OriginTimeouts::from_config(config);
        let client = create_client(&timeouts).context("failed to create origin client")?;

        let router = RequestRouter::new(
            config.mirror_root.clone(),
            upstream,
            config.no_robots,
            &config.index_file,
        );

        Ok(Self {
            inner: Arc::new(MirrorServiceInner {
                mirror_root: config.mirror_root.clone(),
                router,
                fetcher: OriginFetcher::new(client, timeouts),
                poll_interval: config.follower_poll_interval,
            }),
        })
    }

    /// The root of the local mirror tree.
    pub fn mirror_root(&self) -> &Path {
        &self.inner.mirror_root
    }

    /// Rejects paths that could leave the mirror tree or that name a staging file.
    ///
    /// [`handle`](Self::handle) does this on its own. Hosts that serve other methods straight
    /// from the mirror tree use this to apply the same rules.
    pub fn check_path(&self, path: &str) -> Result<(), MirrorError> {
        self.inner.router.route(path).map(|_| ())
    }

    /// Decides how to answer `request`.
    pub async fn handle(&self, request: MirrorRequest) -> Outcome {
        let outcome = match self.try_handle(&request).await {
            Ok(outcome) => outcome,
            Err(err) => outcome_for_error(&request, err),
        };

        match &outcome {
            Outcome::Decline(reason) => {
                metric!(
                    counter("mirror.outcome") += 1,
                    "outcome" => "decline",
                    "reason" => reason.as_str(),
                );
                tracing::debug!(path = %request.path, reason = reason.as_str(), "declined");
            }
            outcome => {
                metric!(counter("mirror.outcome") += 1, "outcome" => outcome.as_str());
            }
        }

        outcome
    }

    async fn try_handle(&self, request: &MirrorRequest) -> Result<Outcome, MirrorError> {
        let target = match self.inner.router.route(&request.path)? {
            Route::Robots => return Ok(Outcome::Robots),
            Route::LocalRobots => return Ok(Outcome::Decline(DeclineReason::LocalRobots)),
            Route::Mirror(target) => target,
        };

        let response = self
            .inner
            .fetcher
            .fetch(&target.origin_url, request.range.as_ref())
            .await?;

        let local_path = match self.inner.router.resolve(&target, response.meta.is_dir) {
            Resolution::Redirect(location) => {
                tracing::debug!(path = %request.path, %location, "redirecting to directory");
                return Ok(Outcome::Redirect(location));
            }
            Resolution::Document(local_path) => local_path,
        };

        let head = ResponseHead::from_meta(&response.meta);

        // Partial responses are never cached.
        if request.range.is_some() {
            return Ok(Outcome::Transfer(Transfer {
                head,
                kind: TransferKind::Relay(response.body),
            }));
        }

        if let Some(parent) = local_path.parent() {
            store::ensure_dir(parent).await?;
        }

        let local_mtime = store::local_mtime(&local_path).await?;
        let meta = &response.meta;
        if freshness::check(local_mtime, meta.last_modified, meta.is_dir) == Freshness::ServeLocal {
            return Ok(Outcome::Decline(DeclineReason::Fresh));
        }

        let coordinator =
            DownloadCoordinator::new(local_path, &response.meta, self.inner.poll_interval);
        let claim = coordinator.claim().await?;

        Ok(Outcome::Transfer(Transfer {
            head,
            kind: TransferKind::Download {
                coordinator,
                claim,
                body: response.body,
            },
        }))
    }
}

fn outcome_for_error(request: &MirrorRequest, err: MirrorError) -> Outcome {
    match err {
        MirrorError::Origin(status) => Outcome::Failed(status),
        MirrorError::Timeout(timeout) => {
            tracing::warn!(path = %request.path, ?timeout, "origin timed out");
            Outcome::Failed(StatusCode::REQUEST_TIMEOUT)
        }
        MirrorError::InvalidPath => Outcome::Failed(StatusCode::BAD_REQUEST),
        MirrorError::Unreachable(reason) => {
            tracing::warn!(path = %request.path, "origin unreachable: {reason}");
            Outcome::Decline(DeclineReason::Unreachable)
        }
        MirrorError::Io(err) => {
            tracing::warn!(path = %request.path, error = %err, "failed to prepare mirror tree");
            Outcome::Decline(DeclineReason::LocalIo)
        }
        err => {
            let dynerr: &dyn std::error::Error = &err;
            tracing::error!(path = %request.path, error = dynerr, "failed to mirror document");
            Outcome::Decline(DeclineReason::Internal)
        }
    }
}
