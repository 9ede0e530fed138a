use std::io;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::SinkExt;
use futures::channel::mpsc;
use lazymirror_service::mirror::{
    MirrorRequest, MirrorService, Outcome, ROBOTS_POLICY, Transfer, WriteStream,
};
use tower::ServiceExt;
use tower_http::services::ServeDir;

use super::ResponseError;

/// How many chunks may be buffered between a transfer and a slow client.
const BODY_BUFFER: usize = 16;

/// Feeds the response body of a transfer.
///
/// Sending fails once hyper dropped the body, i.e. the client went away.
struct BodySender(mpsc::Sender<io::Result<Bytes>>);

impl WriteStream for BodySender {
    async fn write_buf(&mut self, buf: Bytes) -> io::Result<()> {
        self.0
            .send(Ok(buf))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

pub async fn mirror(
    State(service): State<MirrorService>,
    request: Request,
) -> Result<Response, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /*path"));
    });

    if request.method() != Method::GET {
        if service.check_path(request.uri().path()).is_err() {
            return Ok(StatusCode::BAD_REQUEST.into_response());
        }
        return Ok(serve_local(&service, request).await);
    }

    let mirror_request = MirrorRequest {
        path: request.uri().path().to_owned(),
        range: request.headers().get(header::RANGE).cloned(),
    };

    match service.handle(mirror_request).await {
        Outcome::Robots => {
            Ok(([(header::CONTENT_TYPE, "text/plain")], ROBOTS_POLICY).into_response())
        }
        Outcome::Redirect(location) => {
            Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
        }
        Outcome::Failed(status) => Ok(status.into_response()),
        Outcome::Decline(_) => Ok(serve_local(&service, request).await),
        Outcome::Transfer(transfer) => stream_transfer(transfer),
    }
}

/// Serves the request from the mirror tree.
async fn serve_local(service: &MirrorService, request: Request) -> Response {
    let response = ServeDir::new(service.mirror_root())
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});

    response.map(Body::new)
}

/// Sends the head of the transfer and runs it in the background to produce the body.
fn stream_transfer(transfer: Transfer) -> Result<Response, ResponseError> {
    let head = transfer.head();
    let mut response = Response::builder()
        .status(head.status)
        .header(header::LAST_MODIFIED, head.last_modified_http());
    if let Some(content_type) = &head.content_type {
        response = response.header(header::CONTENT_TYPE, content_type);
    }
    if let Some(content_length) = head.content_length {
        response = response.header(header::CONTENT_LENGTH, content_length);
    }
    if let Some(content_range) = &head.content_range {
        response = response.header(header::CONTENT_RANGE, content_range);
    }

    let (sender, receiver) = mpsc::channel(BODY_BUFFER);
    let response = response.body(Body::from_stream(receiver))?;

    tokio::spawn(async move {
        let mut client = BodySender(sender);
        match transfer.run(&mut client).await {
            Ok(completion) => {
                tracing::trace!(size = completion.size(), "transfer {}", completion.as_str());
            }
            Err(err) => {
                tracing::debug!("transfer failed: {err}");
                // The client has to see a broken body rather than a short one.
                let err = io::Error::other(err.to_string());
                client.0.send(Err(err)).await.ok();
            }
        }
    });

    Ok(response)
}
