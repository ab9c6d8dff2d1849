// tests/image_store.rs

//! End-to-end image store scenarios over the REST surface.

mod common;

use common::{serve, setup_state, sha256_hex, unified_image_tar};
use paddock::db::models::Project;
use paddock::fingerprint::Fingerprint;

#[tokio::test]
async fn test_unified_image_upload_roundtrip() {
    let (_dir, state) = setup_state();
    let addr = serve(state.clone()).await;
    let client = reqwest::Client::new();

    let tarball = unified_image_tar("web1\n");
    let expected = sha256_hex(&tarball);

    // Upload the tarball raw
    let response = client
        .post(format!("http://{}/1.0/images", addr))
        .header("Content-Type", "application/octet-stream")
        .header("X-Paddock-filename", "test.tar")
        .body(tarball.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let info: serde_json::Value = response.json().await.unwrap();
    assert_eq!(info["fingerprint"], expected);
    assert_eq!(info["size"], tarball.len() as i64);
    assert_eq!(info["type"], "container");

    // The record is retrievable, by full fingerprint and by prefix
    let got: serde_json::Value = client
        .get(format!("http://{}/1.0/images/{}", addr, expected))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(got["fingerprint"], expected);

    let by_prefix: serde_json::Value = client
        .get(format!("http://{}/1.0/images/{}", addr, &expected[..12]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(by_prefix["fingerprint"], expected);

    // The blob is on disk (invariant: record implies file)
    let fp = Fingerprint::new(expected.clone()).unwrap();
    assert!(state.archive.exists(&fp));

    // A second identical upload conflicts
    let dup = client
        .post(format!("http://{}/1.0/images", addr))
        .header("Content-Type", "application/octet-stream")
        .body(tarball)
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status(), 409);
}

#[tokio::test]
async fn test_split_upload_is_virtual_machine() {
    let (_dir, state) = setup_state();
    let addr = serve(state.clone()).await;
    let client = reqwest::Client::new();

    let meta = common::metadata_only_tar();
    let rootfs = b"qcow2 disk bytes".to_vec();

    // Fingerprint hashes metadata then rootfs, in that order
    let mut concat = meta.clone();
    concat.extend_from_slice(&rootfs);
    let expected = sha256_hex(&concat);

    let form = reqwest::multipart::Form::new()
        .part(
            "metadata",
            reqwest::multipart::Part::bytes(meta.clone()).file_name("metadata"),
        )
        .part(
            "rootfs.img",
            reqwest::multipart::Part::bytes(rootfs.clone()).file_name("rootfs.img"),
        );

    let response = client
        .post(format!("http://{}/1.0/images", addr))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let info: serde_json::Value = response.json().await.unwrap();
    assert_eq!(info["fingerprint"], expected);
    assert_eq!(info["type"], "virtual-machine");
    assert_eq!(info["size"], (meta.len() + rootfs.len()) as i64);

    let fp = Fingerprint::new(expected).unwrap();
    assert!(state.archive.is_split(&fp));
}

#[tokio::test]
async fn test_multipart_with_bad_second_part_rejected() {
    let (_dir, state) = setup_state();
    let addr = serve(state.clone()).await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new()
        .part(
            "metadata",
            reqwest::multipart::Part::bytes(common::metadata_only_tar()).file_name("metadata"),
        )
        .part(
            "disk",
            reqwest::multipart::Part::bytes(b"bytes".to_vec()).file_name("disk"),
        );

    let response = client
        .post(format!("http://{}/1.0/images", addr))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // No files survive the rejection
    assert!(state.archive.entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_expected_fingerprint_header_enforced() {
    let (_dir, state) = setup_state();
    let addr = serve(state.clone()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/1.0/images", addr))
        .header("Content-Type", "application/octet-stream")
        .header("X-Paddock-fingerprint", "ab".repeat(32))
        .body(unified_image_tar("web1\n"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert!(state.archive.entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_alias_lifecycle() {
    let (_dir, state) = setup_state();
    let addr = serve(state.clone()).await;
    let client = reqwest::Client::new();

    let tarball = unified_image_tar("web1\n");
    let fingerprint = sha256_hex(&tarball);

    client
        .post(format!("http://{}/1.0/images", addr))
        .header("Content-Type", "application/octet-stream")
        .body(tarball)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    // Create
    let response = client
        .post(format!("http://{}/1.0/images/aliases", addr))
        .json(&serde_json::json!({"name": "u22", "target": fingerprint}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Patch the description
    client
        .patch(format!("http://{}/1.0/images/aliases/u22", addr))
        .json(&serde_json::json!({"description": "Ubuntu 22"}))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let alias: serde_json::Value = client
        .get(format!("http://{}/1.0/images/aliases/u22", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(alias["description"], "Ubuntu 22");

    // Rename
    client
        .post(format!("http://{}/1.0/images/aliases/u22", addr))
        .json(&serde_json::json!({"name": "ubuntu-lts"}))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let renamed: serde_json::Value = client
        .get(format!("http://{}/1.0/images/aliases/ubuntu-lts", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(renamed["target"], fingerprint);

    let gone = client
        .get(format!("http://{}/1.0/images/aliases/u22", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);

    // Deleting the image removes the alias with it
    let response = client
        .delete(format!("http://{}/1.0/images/{}", addr, fingerprint))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let op: serde_json::Value = response.json().await.unwrap();

    // Wait for the background deletion
    client
        .get(format!(
            "http://{}/1.0/operations/{}/wait",
            addr,
            op["id"].as_str().unwrap()
        ))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let alias_gone = client
        .get(format!("http://{}/1.0/images/aliases/ubuntu-lts", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(alias_gone.status(), 404);

    let image_gone = client
        .get(format!("http://{}/1.0/images/{}", addr, fingerprint))
        .send()
        .await
        .unwrap();
    assert_eq!(image_gone.status(), 404);
}

#[tokio::test]
async fn test_export_then_import_preserves_fingerprint() {
    let (_dir, state) = setup_state();
    let addr = serve(state.clone()).await;
    let client = reqwest::Client::new();

    let tarball = unified_image_tar("web1\n");
    let fingerprint = sha256_hex(&tarball);

    client
        .post(format!("http://{}/1.0/images", addr))
        .header("Content-Type", "application/octet-stream")
        .body(tarball.clone())
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    // Export the blob back out
    let exported = client
        .get(format!("http://{}/1.0/images/{}/export", addr, fingerprint))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(exported.to_vec(), tarball);

    // Import into a fresh server: same fingerprint, size and type
    let (_dir2, state2) = setup_state();
    let addr2 = serve(state2).await;

    let reimported: serde_json::Value = client
        .post(format!("http://{}/1.0/images", addr2))
        .header("Content-Type", "application/octet-stream")
        .body(exported.to_vec())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(reimported["fingerprint"], fingerprint);
    assert_eq!(reimported["size"], tarball.len() as i64);
    assert_eq!(reimported["type"], "container");
}

#[tokio::test]
async fn test_image_secret_is_single_use() {
    let (_dir, state) = setup_state();
    let addr = serve(state.clone()).await;
    let client = reqwest::Client::new();

    let tarball = unified_image_tar("web1\n");
    let fingerprint = sha256_hex(&tarball);

    client
        .post(format!("http://{}/1.0/images", addr))
        .header("Content-Type", "application/octet-stream")
        .body(tarball)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let response = client
        .post(format!(
            "http://{}/1.0/images/{}/secret",
            addr, fingerprint
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let op: serde_json::Value = response.json().await.unwrap();
    let secret = op["metadata"]["secret"].as_str().unwrap().to_string();

    // First use consumes the token
    let first = state
        .operations
        .image_valid_secret(&fingerprint, &secret)
        .unwrap();
    assert!(first.is_some());

    // Second use finds nothing
    let second = state
        .operations
        .image_valid_secret(&fingerprint, &secret)
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn test_quota_rejects_oversized_upload() {
    let (_dir, state) = setup_state();

    state
        .cluster
        .with(|conn| Project::config_set(conn, "default", "limits.images_space", "16"))
        .await
        .unwrap();

    let addr = serve(state.clone()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/1.0/images", addr))
        .header("Content-Type", "application/octet-stream")
        .body(unified_image_tar("web1\n"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
    assert!(state.archive.entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_public_listing_hides_private_images() {
    let (_dir, state) = setup_state();
    let addr = serve(state.clone()).await;
    let client = reqwest::Client::new();

    let private = unified_image_tar("private\n");
    let public = unified_image_tar("public\n");
    let public_fp = sha256_hex(&public);

    client
        .post(format!("http://{}/1.0/images", addr))
        .header("Content-Type", "application/octet-stream")
        .body(private)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    client
        .post(format!("http://{}/1.0/images", addr))
        .header("Content-Type", "application/octet-stream")
        .header("X-Paddock-public", "1")
        .body(public)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let listing: Vec<String> = client
        .get(format!("http://{}/1.0/images?public=1", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(listing, vec![format!("/1.0/images/{}", public_fp)]);
}
