//! lazymirror.
//!
//! lazymirror is an on-demand mirror of a static HTTP document tree, such as a Linux
//! distribution. Documents are downloaded from the origin into a local directory the first time
//! they are requested, and served from there for as long as the origin reports them unchanged.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod logging;
mod server;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
