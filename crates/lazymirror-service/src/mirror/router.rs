//! Maps request paths onto the origin and the local mirror tree.

use std::path::PathBuf;

use percent_encoding::percent_decode_str;
use url::Url;

use super::MirrorError;
use super::staging::is_staging_name;

/// The policy served for `robots.txt` when the mirror is configured to keep crawlers out.
pub const ROBOTS_POLICY: &str = "User-agent: *\nDisallow: /\n";

const ROBOTS_FILE: &str = "/robots.txt";

/// What to do with a request before the origin is contacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Answer with [`ROBOTS_POLICY`].
    Robots,
    /// Let the host serve the `robots.txt` of the local mirror.
    LocalRobots,
    /// Mirror the document.
    Mirror(Target),
}

/// A request path resolved against the origin and the mirror root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// The request path as received, still percent-encoded.
    pub path: String,
    /// Where the document lives on the origin.
    pub origin_url: Url,
    /// Where the document lives in the mirror tree, before directory resolution.
    pub local_path: PathBuf,
}

/// The local side of a [`Target`], once the origin told us whether it is a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The client has to retry with the directory form of the path.
    Redirect(String),
    /// The canonical cache entry for the document.
    Document(PathBuf),
}

/// Computes origin URLs and local paths for request paths.
#[derive(Debug, Clone)]
pub struct RequestRouter {
    mirror_root: PathBuf,
    upstream: String,
    no_robots: bool,
    index_file: String,
}

impl RequestRouter {
    pub fn new(mirror_root: PathBuf, upstream: &Url, no_robots: bool, index_file: &str) -> Self {
        Self {
            mirror_root,
            upstream: upstream.as_str().trim_end_matches('/').to_owned(),
            no_robots,
            index_file: index_file.to_owned(),
        }
    }

    /// Routes an inbound request path.
    ///
    /// Paths that could escape the mirror root or that name a staging file are rejected with
    /// [`MirrorError::InvalidPath`].
    pub fn route(&self, path: &str) -> Result<Route, MirrorError> {
        let segments = decode_segments(path)?;

        if path.ends_with(ROBOTS_FILE) {
            return Ok(match self.no_robots {
                true => Route::Robots,
                false => Route::LocalRobots,
            });
        }

        let origin_path = match path.strip_suffix(&self.index_alias()) {
            Some(dir) => format!("{dir}/"),
            None => path.to_owned(),
        };
        let origin_url = Url::parse(&format!("{}{origin_path}", self.upstream))
            .map_err(|_| MirrorError::InvalidPath)?;

        let mut local_path = self.mirror_root.clone();
        local_path.extend(segments);

        Ok(Route::Mirror(Target {
            path: path.to_owned(),
            origin_url,
            local_path,
        }))
    }

    /// Resolves the canonical local path of `target`.
    ///
    /// Directories are stored as their index document. A directory requested without the
    /// trailing separator is redirected to the separator form, so that relative links in the
    /// index resolve correctly.
    pub fn resolve(&self, target: &Target, is_dir: bool) -> Resolution {
        if target.path.ends_with(&self.index_alias()) {
            return Resolution::Document(target.local_path.clone());
        }

        if target.path.ends_with('/') {
            return Resolution::Document(target.local_path.join(&self.index_file));
        }

        if is_dir {
            return Resolution::Redirect(format!("{}/", target.path));
        }

        Resolution::Document(target.local_path.clone())
    }

    fn index_alias(&self) -> String {
        format!("/{}", self.index_file)
    }
}

/// Splits a request path into decoded, validated path segments.
fn decode_segments(path: &str) -> Result<Vec<String>, MirrorError> {
    let relative = path.strip_prefix('/').ok_or(MirrorError::InvalidPath)?;

    let mut segments = Vec::new();
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        let segment = percent_decode_str(segment)
            .decode_utf8()
            .map_err(|_| MirrorError::InvalidPath)?;

        let is_unsafe = segment == "."
            || segment == ".."
            || segment.contains(['/', '\\', '\0'])
            || is_staging_name(&segment);
        if is_unsafe {
            return Err(MirrorError::InvalidPath);
        }

        segments.push(segment.into_owned());
    }

    Ok(segments)
}
