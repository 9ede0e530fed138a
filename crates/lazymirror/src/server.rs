use std::net::SocketAddr;

use anyhow::{Context, Result};
use lazymirror_service::config::Config;
use lazymirror_service::metric;
use lazymirror_service::mirror::MirrorService;

use crate::endpoints;

/// Starts the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("lazymirror-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    std::fs::create_dir_all(&config.mirror_root).with_context(|| {
        format!(
            "failed to create mirror root {}",
            config.mirror_root.display()
        )
    })?;

    let service = MirrorService::create(&config).context("failed to create mirror service")?;
    let socket = config.bind.parse::<SocketAddr>()?;
    let server =
        axum_server::bind(socket).serve(endpoints::create_app(service).into_make_service());

    tracing::info!(
        upstream = %config.upstream()?,
        mirror_root = %config.mirror_root.display(),
        "Starting HTTP server on {}",
        socket
    );

    web_pool.block_on(server)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
