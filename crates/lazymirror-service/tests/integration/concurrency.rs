use std::time::Duration;

use lazymirror_service::mirror::{Completion, MirrorError, Role};
use lazymirror_test::{Document, Origin};

use crate::utils::{HangingUp, chunks, get, setup_service, staging_files, transfer};

const LAST_MODIFIED: u64 = 1_600_000_000;

#[tokio::test]
async fn test_follower_receives_identical_stream() {
    let origin = Origin::new();
    let document = Document::chunked(chunks(4))
        .last_modified(LAST_MODIFIED)
        .chunk_delay(Duration::from_millis(20));
    let content = document.content();
    origin.insert("/big.iso", document);
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let master = transfer(&service, get("/big.iso")).await;
    let follower = transfer(&service, get("/big.iso")).await;
    assert_eq!(master.role(), Some(Role::Master));
    assert_eq!(follower.role(), Some(Role::Follower));

    let mut master_client = Vec::new();
    let mut follower_client = Vec::new();
    let (master_result, follower_result) = tokio::join!(
        master.run(&mut master_client),
        follower.run(&mut follower_client),
    );

    let len = content.len() as u64;
    assert_eq!(master_result.unwrap(), Completion::Published(len));
    assert_eq!(follower_result.unwrap(), Completion::Relayed(len));
    assert_eq!(master_client, content);
    assert_eq!(follower_client, content);

    assert_eq!(std::fs::read(mirror_dir.path().join("big.iso")).unwrap(), content);
    assert!(staging_files(mirror_dir.path()).is_empty());
}

#[tokio::test]
async fn test_follower_without_content_length() {
    let origin = Origin::new();
    let document = Document::chunked(chunks(4))
        .last_modified(LAST_MODIFIED)
        .chunk_delay(Duration::from_millis(20))
        .unknown_length();
    let content = document.content();
    origin.insert("/big.iso", document);
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let master = transfer(&service, get("/big.iso")).await;
    let follower = transfer(&service, get("/big.iso")).await;
    assert_eq!(master.head().content_length, None);
    assert_eq!(follower.role(), Some(Role::Follower));

    let mut master_client = Vec::new();
    let mut follower_client = Vec::new();
    let (master_result, follower_result) = tokio::join!(
        master.run(&mut master_client),
        follower.run(&mut follower_client),
    );

    // the follower only knows it is done once the master released the staging file
    let len = content.len() as u64;
    assert_eq!(master_result.unwrap(), Completion::Published(len));
    assert_eq!(follower_result.unwrap(), Completion::Relayed(len));
    assert_eq!(follower_client, content);

    assert_eq!(std::fs::read(mirror_dir.path().join("big.iso")).unwrap(), content);
    assert!(staging_files(mirror_dir.path()).is_empty());
}

#[tokio::test]
async fn test_many_followers() {
    let origin = Origin::new();
    let document = Document::chunked(chunks(3))
        .last_modified(LAST_MODIFIED)
        .chunk_delay(Duration::from_millis(10));
    let content = document.content();
    origin.insert("/big.iso", document);
    let (service, _mirror_dir) = setup_service(origin.url("/"), |_| {});

    let mut transfers = Vec::new();
    for _ in 0..4 {
        transfers.push(transfer(&service, get("/big.iso")).await);
    }
    let roles: Vec<_> = transfers.iter().map(|t| t.role().unwrap()).collect();
    assert_eq!(
        roles,
        [Role::Master, Role::Follower, Role::Follower, Role::Follower]
    );

    let results = futures::future::join_all(transfers.into_iter().map(|transfer| async move {
        let mut client = Vec::new();
        let result = transfer.run(&mut client).await;
        result.map(|_| client)
    }))
    .await;

    for result in results {
        assert_eq!(result.unwrap(), content);
    }
}

#[tokio::test]
async fn test_master_abort_leaves_clean_miss() {
    let origin = Origin::new();
    origin.insert(
        "/big.iso",
        Document::chunked(chunks(4)).last_modified(LAST_MODIFIED),
    );
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let master = transfer(&service, get("/big.iso")).await;
    let result = master.run(&mut HangingUp { budget: 20_000 }).await;
    assert!(matches!(result, Err(MirrorError::ClientGone)));

    assert!(!mirror_dir.path().join("big.iso").exists());
    assert!(staging_files(mirror_dir.path()).is_empty());

    let retry = transfer(&service, get("/big.iso")).await;
    assert_eq!(retry.role(), Some(Role::Master));
    let mut client = Vec::new();
    retry.run(&mut client).await.unwrap();
    assert_eq!(client.len(), 4 * 16 * 1024);
}

#[tokio::test]
async fn test_follower_of_failed_master_is_truncated() {
    let origin = Origin::new();
    let document = Document::chunked(chunks(4))
        .last_modified(LAST_MODIFIED)
        .chunk_delay(Duration::from_millis(20))
        .fail_after(2);
    let total = document.content().len() as u64;
    origin.insert("/big.iso", document);
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let master = transfer(&service, get("/big.iso")).await;
    let follower = transfer(&service, get("/big.iso")).await;
    assert_eq!(follower.role(), Some(Role::Follower));

    let mut master_client = Vec::new();
    let mut follower_client = Vec::new();
    let (master_result, follower_result) = tokio::join!(
        master.run(&mut master_client),
        follower.run(&mut follower_client),
    );

    assert!(master_result.is_err());
    match follower_result {
        Err(MirrorError::Abandoned { relayed }) => {
            assert!(relayed > 0 && relayed < total);
            assert_eq!(relayed, follower_client.len() as u64);
        }
        result => panic!("expected an abandoned transfer, got {result:?}"),
    }
    assert_eq!(follower_client, master_client);

    assert!(!mirror_dir.path().join("big.iso").exists());
    assert!(staging_files(mirror_dir.path()).is_empty());
}

#[tokio::test]
async fn test_follower_promoted_when_master_vanishes() {
    let origin = Origin::new();
    let document = Document::chunked(chunks(2)).last_modified(LAST_MODIFIED);
    let content = document.content();
    origin.insert("/big.iso", document);
    let (service, mirror_dir) = setup_service(origin.url("/"), |_| {});

    let master = transfer(&service, get("/big.iso")).await;
    let follower = transfer(&service, get("/big.iso")).await;
    assert_eq!(follower.role(), Some(Role::Follower));

    // the master's client disconnects before the body was started
    drop(master);

    let mut client = Vec::new();
    let completion = follower.run(&mut client).await.unwrap();

    assert_eq!(completion, Completion::Published(content.len() as u64));
    assert_eq!(client, content);
    assert_eq!(std::fs::read(mirror_dir.path().join("big.iso")).unwrap(), content);
}
