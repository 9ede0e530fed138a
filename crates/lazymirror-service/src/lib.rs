//! The mirroring core of lazymirror.
//!
//! This crate decides, per request, whether a document can be served from the local mirror tree
//! or has to be fetched from the origin, and coordinates concurrent downloads of the same
//! document so that only one of them talks to the origin. See [`mirror::MirrorService`] for the
//! entry point.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod mirror;
pub mod utils;
