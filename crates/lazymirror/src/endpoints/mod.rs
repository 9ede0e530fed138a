use axum::Router;
use axum::routing::get;
use lazymirror_service::metric;
use lazymirror_service::mirror::MirrorService;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

mod error;
mod metrics;
mod mirror;

pub use error::ResponseError;
use metrics::MetricsLayer;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: MirrorService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer)
        .layer(TraceLayer::new_for_http());

    // Every path is a potential document, so mirroring is the fallback of the router.
    Router::new()
        .fallback(mirror::mirror)
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
