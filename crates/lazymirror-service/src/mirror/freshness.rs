/// Whether a cached document can be served as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The local copy matches the origin.
    ServeLocal,
    /// The document has to be downloaded.
    FetchRequired,
}

/// Compares the local copy of a document against the origin.
///
/// A copy is fresh if its modification time equals the origin's `Last-Modified`, both in whole
/// seconds. The size is not compared. Directory indexes are generated by the origin and are
/// always fetched again.
pub fn check(local_mtime: Option<i64>, origin_mtime: i64, is_dir: bool) -> Freshness {
    match local_mtime {
        Some(mtime) if !is_dir && mtime == origin_mtime => Freshness::ServeLocal,
        _ => Freshness::FetchRequired,
    }
}
