//! Requests to the origin server.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderValue};
use url::Url;

use super::MirrorError;
use crate::utils::http::OriginTimeouts;

/// The body of an origin response.
///
/// Every chunk has to arrive within the read timeout, otherwise the stream ends with
/// [`MirrorError::Timeout`].
pub type OriginBody = BoxStream<'static, Result<Bytes, MirrorError>>;

/// What the origin told us about a document.
#[derive(Debug, Clone)]
pub struct OriginMeta {
    pub status: StatusCode,
    /// `Last-Modified` as unix timestamp in whole seconds.
    ///
    /// Falls back to the time of the request if the origin sent none, or one we could not parse.
    pub last_modified: i64,
    pub content_type: Option<HeaderValue>,
    pub content_length: Option<u64>,
    pub content_range: Option<HeaderValue>,
    /// Whether the document is a directory index, i.e. the final URL after redirects ends in `/`.
    pub is_dir: bool,
}

impl OriginMeta {
    fn from_response(response: &reqwest::Response) -> Self {
        let headers = response.headers();

        Self {
            status: response.status(),
            last_modified: parse_last_modified(headers)
                .unwrap_or_else(|| unix_seconds(SystemTime::now())),
            content_type: headers.get(header::CONTENT_TYPE).cloned(),
            content_length: headers
                .get(header::CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok()),
            content_range: headers.get(header::CONTENT_RANGE).cloned(),
            is_dir: response.url().path().ends_with('/'),
        }
    }
}

/// A successful origin response whose body has not been read yet.
pub struct OriginResponse {
    pub meta: OriginMeta,
    pub body: OriginBody,
}

impl std::fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginResponse")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Issues `GET` requests against the origin.
#[derive(Debug, Clone)]
pub struct OriginFetcher {
    client: reqwest::Client,
    timeouts: OriginTimeouts,
}

impl OriginFetcher {
    pub fn new(client: reqwest::Client, timeouts: OriginTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Requests `url`, forwarding the client's `Range` header if there is one.
    ///
    /// Only the response head is awaited. Any status other than a success is returned as
    /// [`MirrorError::Origin`].
    pub async fn fetch(
        &self,
        url: &Url,
        range: Option<&HeaderValue>,
    ) -> Result<OriginResponse, MirrorError> {
        let mut request = self.client.get(url.clone());
        if let Some(range) = range {
            request = request.header(header::RANGE, range.clone());
        }

        let timeout = self.timeouts.read;
        let response = match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(MirrorError::from_reqwest(&err, self.timeouts.connect)),
            Err(_) => return Err(MirrorError::Timeout(timeout)),
        };

        let meta = OriginMeta::from_response(&response);
        tracing::trace!(%url, status = %meta.status, "origin responded");

        if !meta.status.is_success() {
            return Err(MirrorError::Origin(meta.status));
        }

        Ok(OriginResponse {
            meta,
            body: timed_body(response, timeout),
        })
    }
}

fn timed_body(response: reqwest::Response, timeout: Duration) -> OriginBody {
    let chunks = response.bytes_stream().boxed();

    stream::unfold(Some(chunks), move |chunks| async move {
        let mut chunks = chunks?;
        match tokio::time::timeout(timeout, chunks.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(chunks))),
            Ok(Some(Err(err))) => Some((Err(MirrorError::from_reqwest(&err, timeout)), None)),
            Ok(None) => None,
            Err(_) => Some((Err(MirrorError::Timeout(timeout)), None)),
        }
    })
    .boxed()
}

fn parse_last_modified(headers: &HeaderMap) -> Option<i64> {
    let value = headers.get(header::LAST_MODIFIED)?.to_str().ok()?;
    httpdate::parse_http_date(value).ok().map(unix_seconds)
}

fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs() as i64,
        Err(err) => -(err.duration().as_secs_f64().ceil() as i64),
    }
}
