// tests/maintenance.rs

//! Auto-update stitching against a live upstream server.

mod common;

use common::{serve, setup_state, sha256_hex, unified_image_tar};
use paddock::db::models::{Image, ImageAlias, Profile};
use paddock::fingerprint::Fingerprint;
use paddock::instance::InstanceType;
use paddock::lifecycle::LifecycleAction;

#[tokio::test]
async fn test_auto_update_stitches_record_to_new_fingerprint() {
    // Upstream server publishes the new version of the image under a
    // stable alias.
    let (_updir, upstream) = setup_state();
    let upstream_addr = serve(upstream.clone()).await;
    let client = reqwest::Client::new();

    let new_tarball = unified_image_tar("v2\n");
    let new_fingerprint = sha256_hex(&new_tarball);

    client
        .post(format!("http://{}/1.0/images", upstream_addr))
        .header("Content-Type", "application/octet-stream")
        .body(new_tarball)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    client
        .post(format!("http://{}/1.0/images/aliases", upstream_addr))
        .json(&serde_json::json!({"name": "foo", "target": new_fingerprint}))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    // Local server holds the old version, marked auto-update, sourced
    // from the upstream alias.
    let (_dir, local) = setup_state();
    let local_addr = serve(local.clone()).await;

    let old_tarball = unified_image_tar("v1\n");
    let old_fingerprint = sha256_hex(&old_tarball);
    let mut old_blob: &[u8] = &old_tarball;
    local.archive.write(&mut old_blob, None, None).unwrap();

    let record_fp = Fingerprint::new(old_fingerprint.clone()).unwrap();
    let upstream_url = format!("http://{}", upstream_addr);
    local
        .cluster
        .tx({
            let record_fp = record_fp.clone();
            move |tx| {
                let web = Profile::create(tx, "default", "web", None)?;

                let mut image = Image::new("default", record_fp.clone(), InstanceType::Container);
                image.auto_update = true;
                image.size = 42;
                let id = image.insert(tx, &[web])?;

                ImageAlias::create(tx, "default", "u22", id, "tracking alias")?;

                Image::set_source(
                    tx,
                    id,
                    &paddock::db::models::ImageSource {
                        server: upstream_url.clone(),
                        protocol: "paddock".to_string(),
                        certificate: String::new(),
                        alias: "foo".to_string(),
                    },
                )?;

                Ok(())
            }
        })
        .await
        .unwrap();

    let mut events = local.events.subscribe();

    // Force the refresh through the API
    let response = client
        .post(format!(
            "http://{}/1.0/images/{}/refresh",
            local_addr, old_fingerprint
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let op: serde_json::Value = response.json().await.unwrap();
    let finished: serde_json::Value = client
        .get(format!(
            "http://{}/1.0/operations/{}/wait",
            local_addr,
            op["id"].as_str().unwrap()
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(finished["status"], "success");
    assert_eq!(finished["metadata"]["refreshed"], true);

    // The new record exists, the old one is gone from DB and disk.
    let new_fp = Fingerprint::new(new_fingerprint.clone()).unwrap();
    let old_fp = record_fp.clone();
    let (old_gone, new_id) = local
        .cluster
        .with(move |conn| {
            let old_gone = !Image::exists(conn, "default", &old_fp)?;
            let (new_id, _) = Image::get(conn, "default", &new_fp)?;
            Ok((old_gone, new_id))
        })
        .await
        .unwrap();
    assert!(old_gone);
    assert!(!local.archive.exists(&record_fp));
    assert!(local
        .archive
        .exists(&Fingerprint::new(new_fingerprint.clone()).unwrap()));

    // Aliases and default profiles moved to the new record.
    let (alias_target, profiles) = local
        .cluster
        .with(move |conn| {
            let alias = ImageAlias::get(conn, "default", "u22")?;
            let profiles = Image::profiles(conn, new_id)?;
            Ok((alias.image_id, profiles))
        })
        .await
        .unwrap();
    assert_eq!(alias_target, new_id);
    assert_eq!(profiles, vec!["web"]);

    // Exactly one image-refreshed event was emitted.
    let mut refreshed = 0;
    while let Ok(event) = events.try_recv() {
        if event.action == LifecycleAction::ImageRefreshed {
            refreshed += 1;
        }
    }
    assert_eq!(refreshed, 1);
}

#[tokio::test]
async fn test_refresh_without_change_reports_not_refreshed() {
    let (_updir, upstream) = setup_state();
    let upstream_addr = serve(upstream.clone()).await;
    let client = reqwest::Client::new();

    let tarball = unified_image_tar("stable\n");
    let fingerprint = sha256_hex(&tarball);

    client
        .post(format!("http://{}/1.0/images", upstream_addr))
        .header("Content-Type", "application/octet-stream")
        .body(tarball.clone())
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    client
        .post(format!("http://{}/1.0/images/aliases", upstream_addr))
        .json(&serde_json::json!({"name": "foo", "target": fingerprint}))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    // Local holds the same version already.
    let (_dir, local) = setup_state();
    let local_addr = serve(local.clone()).await;

    let mut blob: &[u8] = &tarball;
    let (fp, _) = local.archive.write(&mut blob, None, None).unwrap();

    let upstream_url = format!("http://{}", upstream_addr);
    local
        .cluster
        .tx({
            let fp = fp.clone();
            move |tx| {
                let mut image = Image::new("default", fp.clone(), InstanceType::Container);
                image.auto_update = true;
                image.size = 42;
                let id = image.insert(tx, &[])?;

                Image::set_source(
                    tx,
                    id,
                    &paddock::db::models::ImageSource {
                        server: upstream_url.clone(),
                        protocol: "paddock".to_string(),
                        certificate: String::new(),
                        alias: "foo".to_string(),
                    },
                )?;
                Ok(())
            }
        })
        .await
        .unwrap();

    let response = client
        .post(format!(
            "http://{}/1.0/images/{}/refresh",
            local_addr, fingerprint
        ))
        .send()
        .await
        .unwrap();
    let op: serde_json::Value = response.json().await.unwrap();

    let finished: serde_json::Value = client
        .get(format!(
            "http://{}/1.0/operations/{}/wait",
            local_addr,
            op["id"].as_str().unwrap()
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(finished["status"], "success");
    assert_eq!(finished["metadata"]["refreshed"], false);

    // Record and blob are untouched
    let kept = local
        .cluster
        .with({
            let fp = fp.clone();
            move |conn| Image::exists(conn, "default", &fp)
        })
        .await
        .unwrap();
    assert!(kept);
    assert!(local.archive.exists(&fp));
}
