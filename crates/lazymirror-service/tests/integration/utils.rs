use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use lazymirror_service::config::Config;
use lazymirror_service::mirror::{
    MirrorRequest, MirrorService, Outcome, Transfer, WriteStream, is_staging_name,
};
use lazymirror_test::TempDir;
use reqwest::header::HeaderValue;
use url::Url;

/// Creates a mirror of `upstream` in a fresh temp directory.
///
/// The temp directory is the mirror root and has to be held for the duration of the test.
pub fn setup_service(
    upstream: Url,
    configure: impl FnOnce(&mut Config),
) -> (MirrorService, TempDir) {
    lazymirror_test::setup();

    let mirror_dir = lazymirror_test::tempdir();
    let mut config = Config {
        mirror_root: mirror_dir.path().to_owned(),
        upstream: Some(upstream),
        connect_timeout: Duration::from_secs(1),
        read_timeout: Duration::from_secs(2),
        follower_poll_interval: Duration::from_millis(5),
        ..Config::default()
    };
    configure(&mut config);

    (MirrorService::create(&config).unwrap(), mirror_dir)
}

pub fn get(path: &str) -> MirrorRequest {
    MirrorRequest {
        path: path.to_owned(),
        range: None,
    }
}

pub fn get_range(path: &str, range: &'static str) -> MirrorRequest {
    MirrorRequest {
        path: path.to_owned(),
        range: Some(HeaderValue::from_static(range)),
    }
}

/// Handles `request`, expecting a transfer.
pub async fn transfer(service: &MirrorService, request: MirrorRequest) -> Transfer {
    match service.handle(request).await {
        Outcome::Transfer(transfer) => transfer,
        outcome => panic!("expected a transfer, got {outcome:?}"),
    }
}

/// Lists the staging files anywhere under `root`.
pub fn staging_files(root: &Path) -> Vec<String> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
        .filter(|name| is_staging_name(name))
        .collect()
}

/// Returns the modification time of a file in unix seconds.
pub fn mtime(path: &Path) -> i64 {
    let metadata = std::fs::metadata(path).unwrap();
    filetime::FileTime::from_last_modification_time(&metadata).unix_seconds()
}

/// A document of `chunks` distinguishable chunks of 16KiB each.
pub fn chunks(chunks: u8) -> Vec<Bytes> {
    (0..chunks).map(|i| Bytes::from(vec![b'a' + i; 16 * 1024])).collect()
}

/// A client that hangs up after accepting `budget` bytes.
pub struct HangingUp {
    pub budget: usize,
}

impl WriteStream for HangingUp {
    async fn write_buf(&mut self, buf: Bytes) -> std::io::Result<()> {
        if buf.len() > self.budget {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        self.budget -= buf.len();
        Ok(())
    }
}
