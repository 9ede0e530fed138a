use std::time::Duration;

use lazymirror_service::mirror::{Completion, DeclineReason, MirrorError, Outcome, Role};
use lazymirror_test::{Document, Origin, unreachable_url};
use reqwest::StatusCode;

use crate::utils::{get, get_range, mtime, setup_service, staging_files, transfer};

const LAST_MODIFIED: u64 = 1_600_000_000;

#[tokio::test]
async fn test_cold_miss() {
    let origin = Origin::new();
    let content = vec![7u8; 100_000];
    origin.insert(
        "/pkg/foo.rpm",
        Document::new(content.clone())
            .content_type("application/x-rpm")
            .last_modified(LAST_MODIFIED),
    );
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let transfer = transfer(&service, get("/pkg/foo.rpm")).await;
    assert_eq!(transfer.role(), Some(Role::Master));

    let head = transfer.head();
    assert_eq!(head.status, StatusCode::OK);
    assert_eq!(head.content_length, Some(100_000));
    assert_eq!(head.content_type.as_ref().unwrap(), "application/x-rpm");
    assert_eq!(head.last_modified, LAST_MODIFIED as i64);

    let mut client = Vec::new();
    let completion = transfer.run(&mut client).await.unwrap();

    assert_eq!(completion, Completion::Published(100_000));
    assert_eq!(client, content);

    let local = mirror_dir.path().join("pkg/foo.rpm");
    assert_eq!(std::fs::read(&local).unwrap(), content);
    assert_eq!(mtime(&local), LAST_MODIFIED as i64);
    assert!(staging_files(mirror_dir.path()).is_empty());
}

#[tokio::test]
async fn test_warm_hit() {
    let origin = Origin::new();
    origin.insert(
        "/pkg/foo.rpm",
        Document::new("current").last_modified(LAST_MODIFIED),
    );
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let transfer = transfer(&service, get("/pkg/foo.rpm")).await;
    transfer.run(&mut Vec::new()).await.unwrap();

    // the origin changes the content, but not the modification time
    origin.insert(
        "/pkg/foo.rpm",
        Document::new("changed").last_modified(LAST_MODIFIED),
    );

    let outcome = service.handle(get("/pkg/foo.rpm")).await;
    assert!(matches!(outcome, Outcome::Decline(DeclineReason::Fresh)));

    let local = mirror_dir.path().join("pkg/foo.rpm");
    assert_eq!(std::fs::read(&local).unwrap(), b"current");
    assert_eq!(origin.hits("/pkg/foo.rpm"), 2);
}

#[tokio::test]
async fn test_stale_entry_is_replaced() {
    let origin = Origin::new();
    origin.insert(
        "/pkg/foo.rpm",
        Document::new("new content").last_modified(LAST_MODIFIED),
    );
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let local = mirror_dir.path().join("pkg/foo.rpm");
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, b"old content").unwrap();
    let old = filetime::FileTime::from_unix_time(1_500_000_000, 0);
    filetime::set_file_mtime(&local, old).unwrap();

    let transfer = transfer(&service, get("/pkg/foo.rpm")).await;
    assert_eq!(transfer.role(), Some(Role::Master));
    transfer.run(&mut Vec::new()).await.unwrap();

    assert_eq!(std::fs::read(&local).unwrap(), b"new content");
    assert_eq!(mtime(&local), LAST_MODIFIED as i64);
}

#[tokio::test]
async fn test_directory_redirect() {
    let origin = Origin::new();
    origin.insert(
        "/releases/",
        Document::directory("<a href=\"42/\">42/</a>").last_modified(LAST_MODIFIED),
    );
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let outcome = service.handle(get("/releases")).await;
    assert!(matches!(outcome, Outcome::Redirect(ref location) if location == "/releases/"));
    assert!(!mirror_dir.path().join("releases").exists());

    let transfer = transfer(&service, get("/releases/")).await;
    transfer.run(&mut Vec::new()).await.unwrap();

    let index = mirror_dir.path().join("releases/index.html");
    assert_eq!(std::fs::read(&index).unwrap(), b"<a href=\"42/\">42/</a>");

    // directory indexes are never served from the mirror
    let transfer = crate::utils::transfer(&service, get("/releases/")).await;
    assert_eq!(transfer.role(), Some(Role::Master));
}

#[tokio::test]
async fn test_index_alias() {
    let origin = Origin::new();
    origin.insert(
        "/releases/",
        Document::directory("listing").last_modified(LAST_MODIFIED),
    );
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let transfer = transfer(&service, get("/releases/index.html")).await;
    transfer.run(&mut Vec::new()).await.unwrap();

    assert_eq!(origin.hits("/releases/"), 1);
    assert_eq!(origin.hits("/releases/index.html"), 0);
    let index = mirror_dir.path().join("releases/index.html");
    assert_eq!(std::fs::read(&index).unwrap(), b"listing");
}

#[tokio::test]
async fn test_range_request_bypasses_mirror() {
    let origin = Origin::new();
    origin.insert(
        "/pkg/foo.rpm",
        Document::new(vec![1u8; 1000]).last_modified(LAST_MODIFIED),
    );
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let transfer = transfer(&service, get_range("/pkg/foo.rpm", "bytes=0-99")).await;
    assert_eq!(transfer.role(), None);
    assert_eq!(transfer.head().status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        transfer.head().content_range.as_ref().unwrap(),
        "bytes 0-99/1000"
    );

    let mut client = Vec::new();
    let completion = transfer.run(&mut client).await.unwrap();
    assert_eq!(completion, Completion::Relayed(100));
    assert_eq!(client, vec![1u8; 100]);

    assert!(!mirror_dir.path().join("pkg").exists());
    assert!(staging_files(mirror_dir.path()).is_empty());
}

#[tokio::test]
async fn test_unreachable_origin_declines() {
    let (service, mirror_dir) = setup_service(unreachable_url(), |_| {});

    let local = mirror_dir.path().join("pkg/foo.rpm");
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, b"stale but useful").unwrap();

    let outcome = service.handle(get("/pkg/foo.rpm")).await;
    assert!(matches!(
        outcome,
        Outcome::Decline(DeclineReason::Unreachable)
    ));
    assert_eq!(std::fs::read(&local).unwrap(), b"stale but useful");
}

#[tokio::test]
async fn test_origin_error_status() {
    let origin = Origin::new();
    origin.insert(
        "/broken",
        Document::new("").status(StatusCode::INTERNAL_SERVER_ERROR),
    );
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let outcome = service.handle(get("/missing")).await;
    assert!(matches!(outcome, Outcome::Failed(StatusCode::NOT_FOUND)));

    let outcome = service.handle(get("/broken")).await;
    assert!(matches!(
        outcome,
        Outcome::Failed(StatusCode::INTERNAL_SERVER_ERROR)
    ));

    assert!(!mirror_dir.path().join("missing").exists());
    assert!(!mirror_dir.path().join("broken").exists());
}

#[tokio::test]
async fn test_origin_timeout() {
    let origin = Origin::new();
    origin.insert(
        "/slow",
        Document::new("late")
            .last_modified(LAST_MODIFIED)
            .head_delay(Duration::from_millis(500)),
    );
    let (service, mirror_dir) = setup_service(origin.url("/"), |config| {
        config.read_timeout = Duration::from_millis(100);
    });

    let local = mirror_dir.path().join("slow");
    std::fs::write(&local, b"cached").unwrap();

    let outcome = service.handle(get("/slow")).await;
    assert!(matches!(
        outcome,
        Outcome::Failed(StatusCode::REQUEST_TIMEOUT)
    ));
    assert_eq!(std::fs::read(&local).unwrap(), b"cached");
}

#[tokio::test]
async fn test_stalled_body_aborts() {
    let origin = Origin::new();
    origin.insert(
        "/stalled",
        Document::chunked(crate::utils::chunks(3))
            .last_modified(LAST_MODIFIED)
            .chunk_delay(Duration::from_millis(300)),
    );
    let (service, mirror_dir) = setup_service(origin.url("/"), |config| {
        config.read_timeout = Duration::from_millis(100);
    });

    let transfer = transfer(&service, get("/stalled")).await;
    let result = transfer.run(&mut Vec::new()).await;

    assert!(matches!(result, Err(MirrorError::Timeout(_))));
    assert!(!mirror_dir.path().join("stalled").exists());
    assert!(staging_files(mirror_dir.path()).is_empty());
}

#[tokio::test]
async fn test_robots() {
    let origin = Origin::new();

    let (service, _mirror_dir) = setup_service(origin.url("/"), |config| {
        config.no_robots = true;
    });
    assert!(matches!(
        service.handle(get("/robots.txt")).await,
        Outcome::Robots
    ));

    let (service, _mirror_dir) = setup_service(origin.url("/"), |_| {});
    assert!(matches!(
        service.handle(get("/robots.txt")).await,
        Outcome::Decline(DeclineReason::LocalRobots)
    ));

    assert_eq!(origin.hits("/robots.txt"), 0);
}

#[tokio::test]
async fn test_invalid_paths() {
    let origin = Origin::new();
    let (service, _mirror_dir) = setup_service(origin.url("/"), |_| {});

    for path in ["/../secret", "/pkg/%2e%2e/%2e%2e/secret", "/pkg/a%5cb"] {
        let outcome = service.handle(get(path)).await;
        assert!(
            matches!(outcome, Outcome::Failed(StatusCode::BAD_REQUEST)),
            "{path}"
        );
    }
}

#[tokio::test]
async fn test_upstream_with_prefix() {
    let origin = Origin::new();
    origin.insert(
        "/pub/fedora/README",
        Document::new("hello").last_modified(LAST_MODIFIED),
    );
    let (service, mirror_dir) = setup_service(origin.url("/pub/fedora/"), |_| {});

    let transfer = transfer(&service, get("/README")).await;
    transfer.run(&mut Vec::new()).await.unwrap();

    assert_eq!(origin.hits("/pub/fedora/README"), 1);
    assert_eq!(
        std::fs::read(mirror_dir.path().join("README")).unwrap(),
        b"hello"
    );
}
