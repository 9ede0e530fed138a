//! Helpers for testing the mirror and its web server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Hold the [`TempDir`] returned by [`tempdir`] for the entire test. It is usually the mirror
//!    root, dropping it early deletes the mirror tree under the feet of the test.
//!
//!  - Hold the [`Origin`] until all requests to it have been made. Once dropped, its port is
//!    closed and requests to it fail as unreachable.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the lazymirror crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("lazymirror=trace,lazymirror_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Returns a URL on localhost that refuses connections.
pub fn unreachable_url() -> Url {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    format!("http://127.0.0.1:{port}/").parse().unwrap()
}

/// An HTTP server running in the background of a test.
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Serves `router` on an ephemeral port on localhost.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A document served by the [`Origin`].
#[derive(Clone, Debug)]
pub struct Document {
    chunks: Vec<Bytes>,
    last_modified: Option<u64>,
    content_type: &'static str,
    status: StatusCode,
    head_delay: Duration,
    chunk_delay: Duration,
    fail_after: Option<usize>,
    unknown_length: bool,
}

impl Document {
    /// A document with the given content, served in one chunk.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self::chunked([body.into()])
    }

    /// A document whose content is sent in the given chunks.
    pub fn chunked(chunks: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
            last_modified: None,
            content_type: "application/octet-stream",
            status: StatusCode::OK,
            head_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            fail_after: None,
            unknown_length: false,
        }
    }

    /// A directory index.
    pub fn directory(listing: &str) -> Self {
        Self::new(listing.to_owned()).content_type("text/html")
    }

    /// Sends a `Last-Modified` header with the given unix timestamp.
    pub fn last_modified(mut self, secs: u64) -> Self {
        self.last_modified = Some(secs);
        self
    }

    pub fn content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = content_type;
        self
    }

    /// Answers with the given status and an empty body instead.
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Waits before sending the response head.
    pub fn head_delay(mut self, delay: Duration) -> Self {
        self.head_delay = delay;
        self
    }

    /// Waits before sending each chunk.
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Breaks the connection after sending `chunks` chunks.
    ///
    /// `Content-Length` still announces the full document.
    pub fn fail_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Sends the body chunked, without `Content-Length`.
    pub fn unknown_length(mut self) -> Self {
        self.unknown_length = true;
        self
    }

    /// The complete content of the document.
    pub fn content(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

#[derive(Clone, Default)]
struct OriginState {
    documents: Arc<Mutex<BTreeMap<String, Document>>>,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

/// A scriptable origin server.
///
/// Serves the registered [`Document`]s and counts requests per path. Like a regular web server,
/// a directory requested without its trailing slash, is answered with a redirect to the slash
/// form. Simple `Range` requests of the form `bytes=<start>-[<end>]` are supported.
pub struct Origin {
    server: Server,
    state: OriginState,
}

impl Origin {
    pub fn new() -> Self {
        let state = OriginState::default();
        let router = Router::new().fallback(serve).with_state(state.clone());

        Self {
            server: Server::with_router(router),
            state,
        }
    }

    /// Registers a document at `path`, replacing what was there.
    ///
    /// Directory indexes are registered with a trailing slash.
    pub fn insert(&self, path: &str, document: Document) {
        let mut documents = self.state.documents.lock().unwrap();
        documents.insert(path.to_owned(), document);
    }

    /// The number of requests for `path`.
    pub fn hits(&self, path: &str) -> usize {
        let hits = self.state.hits.lock().unwrap();
        hits.get(path).copied().unwrap_or_default()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::new()
    }
}

async fn serve(State(state): State<OriginState>, request: Request) -> Response {
    let path = request.uri().path().to_owned();
    *state.hits.lock().unwrap().entry(path.clone()).or_default() += 1;

    let document = {
        let documents = state.documents.lock().unwrap();
        match documents.get(&path) {
            Some(document) => document.clone(),
            None if documents.contains_key(&format!("{path}/")) => {
                let location = format!("{path}/");
                return (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)])
                    .into_response();
            }
            None => return StatusCode::NOT_FOUND.into_response(),
        }
    };

    tokio::time::sleep(document.head_delay).await;

    if document.status != StatusCode::OK {
        return document.status.into_response();
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(document.content_type),
    );
    if let Some(secs) = document.last_modified {
        let date = httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(secs));
        headers.insert(header::LAST_MODIFIED, date.parse().unwrap());
    }

    let content = document.content();
    let range = request
        .headers()
        .get(header::RANGE)
        .and_then(|range| parse_range(range.to_str().ok()?, content.len()));
    if let Some((start, end)) = range {
        let range = format!("bytes {start}-{end}/{}", content.len());
        headers.insert(header::CONTENT_RANGE, range.parse().unwrap());
        headers.insert(header::CONTENT_LENGTH, (end + 1 - start).into());
        let body = Bytes::copy_from_slice(&content[start..=end]);
        return (StatusCode::PARTIAL_CONTENT, headers, body).into_response();
    }

    if !document.unknown_length {
        headers.insert(header::CONTENT_LENGTH, content.len().into());
    }

    let Document {
        chunks,
        chunk_delay,
        fail_after,
        ..
    } = document;
    let sent = fail_after.unwrap_or(chunks.len());
    let failure = fail_after.map(|_| Err(io::Error::other("connection dropped by origin")));

    let body = futures::stream::iter(chunks.into_iter().take(sent))
        .then(move |chunk| async move {
            tokio::time::sleep(chunk_delay).await;
            Ok::<_, io::Error>(chunk)
        })
        .chain(futures::stream::iter(failure));

    (headers, Body::from_stream(body)).into_response()
}

/// Parses `bytes=<start>-[<end>]` into an inclusive, satisfiable range.
fn parse_range(range: &str, len: usize) -> Option<(usize, usize)> {
    let (start, end) = range.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end = match end {
        "" => len.checked_sub(1)?,
        end => end.parse::<usize>().ok()?.min(len.checked_sub(1)?),
    };

    (start <= end).then_some((start, end))
}
