// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

use paddock::server::{DaemonConfig, State};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;

/// Build a daemon state over a scratch directory.
///
/// Returns (TempDir, state) - keep the TempDir alive to prevent cleanup.
pub fn setup_state() -> (TempDir, Arc<State>) {
    let dir = tempfile::tempdir().unwrap();
    let state = State::new(DaemonConfig::default().with_var_dir(dir.path())).unwrap();
    (dir, state)
}

/// Serve a state's router on an ephemeral loopback port.
///
/// Returns the bound address; the server task runs until the test ends.
pub async fn serve(state: Arc<State>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = paddock::server::create_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });

    addr
}

/// A minimal but valid unified container image tarball
pub fn unified_image_tar(hostname: &str) -> Vec<u8> {
    build_tar(&[
        (
            "metadata.yaml",
            "architecture: x86_64\ncreation_date: 1700000000\n".as_bytes(),
        ),
        ("rootfs/etc/hostname", hostname.as_bytes()),
    ])
}

/// A metadata-only tarball for split uploads
pub fn metadata_only_tar() -> Vec<u8> {
    build_tar(&[(
        "metadata.yaml",
        "architecture: x86_64\ncreation_date: 1700000000\n".as_bytes(),
    )])
}

pub fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Hex SHA-256 of a byte slice, via the crate's canonical hasher
pub fn sha256_hex(data: &[u8]) -> String {
    paddock::fingerprint::fingerprint_bytes(data).to_string()
}
