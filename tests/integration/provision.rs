//! Release download and installation against a served archive.

use std::io::Write;

use aio_supervisor::registry::ReleaseAsset;
use aio_supervisor::{Error, FetchError, ProgramKind};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::fixture::TestEnv;

const ASSET: &str = "blocknet-4.4.1-test.tar.gz";

fn node_archive(env: &TestEnv) -> Vec<u8> {
    let executable: Vec<String> = env
        .registry
        .node
        .executable
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let entry = format!("blocknet-4.4.1/{}", executable.join("/"));
    let contents = b"#!/bin/sh\nexit 0\n";

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut header = tar::Header::new_gnu();
    header.set_path(&entry).unwrap();
    header.set_size(contents.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append(&header, &contents[..]).unwrap();

    let mut encoder = builder.into_inner().unwrap();
    encoder.flush().unwrap();
    encoder.finish().unwrap()
}

async fn publish(env: &mut TestEnv, head_body: &[u8], get_body: &[u8]) {
    let url = format!("{}/releases/{}", env.server.uri(), ASSET);
    let platform = env.registry.platform;
    env.registry
        .node
        .releases
        .insert(platform, ReleaseAsset::new(url));

    Mock::given(method("HEAD"))
        .and(path(format!("/releases/{}", ASSET)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", head_body.len().to_string().as_str())
                .set_body_bytes(head_body.to_vec()),
        )
        .mount(&env.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/releases/{}", ASSET)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(get_body.to_vec()))
        .mount(&env.server)
        .await;
}

#[tokio::test]
async fn test_install_extracts_expected_version() {
    let mut env = TestEnv::new().await;
    let archive = node_archive(&env);
    publish(&mut env, &archive, &archive).await;
    let manager = env.manager();

    let executable = manager.install(ProgramKind::Node).await.unwrap();
    assert!(executable.exists());

    let status = manager.status(ProgramKind::Node);
    assert!(status.installed);
    assert_eq!(status.installed_version.as_deref(), Some("v4.4.1"));
    assert!(!status.downloading);
    assert_eq!(status.download_percent, None);

    let part = env
        .registry
        .download_dir()
        .join(format!("{}.part", ASSET));
    assert!(!part.exists());
}

#[tokio::test]
async fn test_truncated_download_is_discarded() {
    let mut env = TestEnv::new().await;
    let archive = node_archive(&env);
    let truncated = archive[..archive.len() / 2].to_vec();
    publish(&mut env, &archive, &truncated).await;
    let manager = env.manager();

    let err = manager.install(ProgramKind::Node).await.unwrap_err();
    assert!(
        matches!(err, Error::Fetch(FetchError::Integrity { .. })),
        "unexpected error: {}",
        err
    );

    let part = env
        .registry
        .download_dir()
        .join(format!("{}.part", ASSET));
    assert!(!part.exists());
    assert!(!manager.status(ProgramKind::Node).installed);
}

#[tokio::test]
async fn test_partial_download_resumes_with_range() {
    let mut env = TestEnv::new().await;
    let archive = node_archive(&env);
    let split = archive.len() / 3;

    std::fs::create_dir_all(env.registry.download_dir()).unwrap();
    std::fs::write(
        env.registry.download_dir().join(format!("{}.part", ASSET)),
        &archive[..split],
    )
    .unwrap();

    Mock::given(method("GET"))
        .and(path(format!("/releases/{}", ASSET)))
        .and(header("range", format!("bytes={}-", split).as_str()))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(archive[split..].to_vec()))
        .expect(1)
        .mount(&env.server)
        .await;
    publish(&mut env, &archive, b"wrong body").await;

    let manager = env.manager();
    let executable = manager.install(ProgramKind::Node).await.unwrap();
    assert!(executable.exists());
}

#[tokio::test]
async fn test_delete_removes_install() {
    let mut env = TestEnv::new().await;
    let archive = node_archive(&env);
    publish(&mut env, &archive, &archive).await;
    let manager = env.manager();

    manager.install(ProgramKind::Node).await.unwrap();
    manager.delete(ProgramKind::Node).await.unwrap();

    assert!(!manager.status(ProgramKind::Node).installed);
    assert!(!env.registry.install_root().join("blocknet-4.4.1").exists());
}

async fn publish_checksum(env: &TestEnv, digest: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/releases/{}.sha256", ASSET)))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(format!("{}  {}\n", digest, ASSET)),
        )
        .mount(&env.server)
        .await;
}

#[tokio::test]
async fn test_published_checksum_is_verified() {
    let mut env = TestEnv::new().await;
    let archive = node_archive(&env);
    publish(&mut env, &archive, &archive).await;
    publish_checksum(&env, &hex::encode(Sha256::digest(&archive))).await;

    let manager = env.manager();
    assert!(manager.install(ProgramKind::Node).await.unwrap().exists());
}

#[tokio::test]
async fn test_checksum_mismatch_rejects_install() {
    let mut env = TestEnv::new().await;
    let archive = node_archive(&env);
    publish(&mut env, &archive, &archive).await;
    publish_checksum(&env, &hex::encode(Sha256::digest(b"something else"))).await;

    let manager = env.manager();
    let err = manager.install(ProgramKind::Node).await.unwrap_err();
    assert!(
        matches!(err, Error::Fetch(FetchError::Checksum { .. })),
        "unexpected error: {}",
        err
    );
    assert!(!manager.status(ProgramKind::Node).installed);
}
