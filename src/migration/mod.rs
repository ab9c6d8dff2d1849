// src/migration/mod.rs

//! Instance migration transport.
//!
//! A migration session multiplexes one websocket per named channel between
//! two servers: `control` carries JSON frames, `filesystem` the rootfs
//! stream, and `state` (live sessions only) the checkpoint image. Which
//! side dials depends on the mode: in pull mode the source publishes
//! secrets on an operation and the target dials; push mode is the mirror
//! image. Every connection authenticates by presenting its channel secret
//! as the first frame.

pub mod control;
pub mod sink;
pub mod source;

use crate::error::{Error, Result};
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub use sink::{MigrationSink, MigrationSinkArgs};
pub use source::{MigrationSource, PushTarget};

/// Channel names; the set is fixed by the protocol
pub const CHANNEL_CONTROL: &str = "control";
pub const CHANNEL_FILESYSTEM: &str = "filesystem";
pub const CHANNEL_STATE: &str = "state";

/// Hard ceiling on acquiring the control channel
pub const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Checkpoint/restore tool required for live container migration
pub const CRIU_BINARY: &str = "criu";

/// An established websocket, from either side of the upgrade
#[derive(Debug)]
pub enum Channel {
    Client(WebSocketStream<MaybeTlsStream<TcpStream>>),
    Server(WebSocket),
}

impl Channel {
    /// Send a JSON control frame
    pub async fn send_json<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let payload = serde_json::to_string(msg)?;
        match self {
            Self::Client(ws) => ws.send(WsMessage::Text(payload)).await?,
            Self::Server(ws) => ws
                .send(AxumMessage::Text(payload))
                .await
                .map_err(|e| Error::Other(format!("Websocket send failed: {}", e)))?,
        }
        Ok(())
    }

    /// Receive the next JSON control frame, skipping transport noise
    pub async fn recv_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        loop {
            let text = match self {
                Self::Client(ws) => match ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                        continue
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return Err(Error::Other("Control connection closed".to_string()))
                    }
                    Some(Err(e)) => return Err(e.into()),
                },
                Self::Server(ws) => match ws.next().await {
                    Some(Ok(AxumMessage::Text(text))) => text,
                    Some(Ok(AxumMessage::Binary(data))) => {
                        String::from_utf8_lossy(&data).into_owned()
                    }
                    Some(Ok(AxumMessage::Ping(_) | AxumMessage::Pong(_))) => continue,
                    Some(Ok(AxumMessage::Close(_))) | None => {
                        return Err(Error::Other("Control connection closed".to_string()))
                    }
                    Some(Err(e)) => {
                        return Err(Error::Other(format!("Websocket receive failed: {}", e)))
                    }
                },
            };

            return Ok(serde_json::from_str(&text)?);
        }
    }

    /// Send an opaque binary frame
    pub async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        match self {
            Self::Client(ws) => ws.send(WsMessage::Binary(data)).await?,
            Self::Server(ws) => ws
                .send(AxumMessage::Binary(data))
                .await
                .map_err(|e| Error::Other(format!("Websocket send failed: {}", e)))?,
        }
        Ok(())
    }

    /// Receive the next binary frame; None on close
    pub async fn recv_binary(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self {
                Self::Client(ws) => match ws.next().await {
                    Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data)),
                    Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.into_bytes())),
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                        continue
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                    Some(Err(e)) => return Err(e.into()),
                },
                Self::Server(ws) => match ws.next().await {
                    Some(Ok(AxumMessage::Binary(data))) => return Ok(Some(data)),
                    Some(Ok(AxumMessage::Text(text))) => return Ok(Some(text.into_bytes())),
                    Some(Ok(AxumMessage::Ping(_) | AxumMessage::Pong(_))) => continue,
                    Some(Ok(AxumMessage::Close(_))) | None => return Ok(None),
                    Some(Err(e)) => {
                        return Err(Error::Other(format!("Websocket receive failed: {}", e)))
                    }
                },
            }
        }
    }

    /// Close the websocket
    pub async fn close(&mut self) {
        match self {
            Self::Client(ws) => {
                let _ = ws.close(None).await;
            }
            Self::Server(ws) => {
                let _ = ws.send(AxumMessage::Close(None)).await;
            }
        }
    }
}

/// Dialer for the side that opens connections
#[derive(Clone, Debug)]
pub struct Dialer {
    /// Base `wss://host:port` endpoint; the `/websocket` path is appended
    pub url: String,
    /// PEM of the peer certificate to pin; None trusts the system roots
    pub certificate: Option<String>,
}

impl Dialer {
    /// Dial the peer's `/websocket` endpoint and present the secret
    pub async fn dial(&self, secret: &str) -> Result<Channel> {
        // Plain ws is only ever used on loopback (tests, local moves).
        let scheme = if self.url.starts_with("http://") || self.url.starts_with("ws://") {
            "ws"
        } else {
            "wss"
        };

        let url = format!(
            "{}://{}/websocket",
            scheme,
            self.url
                .trim_start_matches("https://")
                .trim_start_matches("wss://")
                .trim_start_matches("http://")
                .trim_start_matches("ws://")
        );

        debug!("Dialing migration channel at {}", url);

        let connector = match &self.certificate {
            Some(pem) => Some(Connector::Rustls(Arc::new(pinned_tls_config(pem)?))),
            None => None,
        };

        let (mut ws, _) =
            tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector)
                .await?;

        // First frame carries the channel secret.
        ws.send(WsMessage::Text(secret.to_string())).await?;

        Ok(Channel::Client(ws))
    }
}

/// Build a TLS config that accepts exactly the pinned peer certificate
fn pinned_tls_config(pem: &str) -> Result<rustls::ClientConfig> {
    let der = rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .ok_or_else(|| Error::Validation("No certificate in pinned PEM".to_string()))?
        .map_err(|e| Error::Validation(format!("Invalid pinned certificate: {}", e)))?;

    let verifier = Arc::new(PinnedCertVerifier { der });

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(config)
}

/// Certificate verifier that only accepts one exact certificate
#[derive(Debug)]
struct PinnedCertVerifier {
    der: rustls::pki_types::CertificateDer<'static>,
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.der.as_ref() {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Pending websocket hand-offs, keyed by channel secret.
///
/// The accepting side registers each channel's secret here; the
/// `/websocket` handler reads the first frame from an incoming upgrade and
/// routes the socket to the matching waiter. An unknown secret is
/// unauthorised.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Channel>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret, returning the receiver the session waits on
    pub fn register(&self, secret: &str) -> oneshot::Receiver<Channel> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(secret.to_string(), tx);
        rx
    }

    /// Claim the waiter for a secret; None means the secret is unknown
    /// and the connection is unauthorised
    pub fn claim(&self, secret: &str) -> Option<oneshot::Sender<Channel>> {
        self.pending.lock().unwrap().remove(secret)
    }

    /// Drop a registration that will never be used
    pub fn forget(&self, secret: &str) {
        self.pending.lock().unwrap().remove(secret);
    }
}

/// One named channel of a session: its secret plus how it materialises
#[derive(Debug)]
pub struct MigrationConn {
    secret: String,
    dialer: Option<Dialer>,
    waiter: Option<oneshot::Receiver<Channel>>,
}

impl MigrationConn {
    /// Dial-mode connection (this side opens the websocket)
    pub fn new_dial(secret: String, dialer: Dialer) -> Self {
        Self {
            secret,
            dialer: Some(dialer),
            waiter: None,
        }
    }

    /// Accept-mode connection (the peer dials; we wait on the registry)
    pub fn new_accept(secret: String, registry: &ChannelRegistry) -> Self {
        let waiter = registry.register(&secret);
        Self {
            secret,
            dialer: None,
            waiter: Some(waiter),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Establish the websocket, dialing or awaiting as configured
    pub async fn connect(&mut self) -> Result<Channel> {
        if let Some(dialer) = &self.dialer {
            return dialer.dial(&self.secret).await;
        }

        if let Some(waiter) = self.waiter.take() {
            return waiter
                .await
                .map_err(|_| Error::Other("Websocket hand-off dropped".to_string()));
        }

        Err(Error::Other("Channel already connected".to_string()))
    }
}

/// The channel set of one migration session, shared with the instance
/// driver.
///
/// Non-control channels connect lazily on first use. `disconnect` closes
/// everything except control, which the owning side closes last so a
/// failure can still be reported.
#[derive(Debug)]
pub struct MigrationChannels {
    conns: tokio::sync::Mutex<HashMap<&'static str, MigrationConn>>,
    control: tokio::sync::Mutex<Option<Channel>>,
}

impl MigrationChannels {
    pub fn new(conns: HashMap<&'static str, MigrationConn>) -> Self {
        Self {
            conns: tokio::sync::Mutex::new(conns),
            control: tokio::sync::Mutex::new(None),
        }
    }

    /// The per-channel secrets, for publishing on an operation
    pub async fn secrets(&self) -> HashMap<String, String> {
        let conns = self.conns.lock().await;
        conns
            .iter()
            .map(|(name, conn)| (name.to_string(), conn.secret().to_string()))
            .collect()
    }

    /// Whether the session carries a state channel (live migration)
    pub async fn has_state(&self) -> bool {
        self.conns.lock().await.contains_key(CHANNEL_STATE)
    }

    /// Acquire the control channel within the protocol's hard window
    pub async fn connect_control(&self, side: &str) -> Result<()> {
        let mut conn = {
            let mut conns = self.conns.lock().await;
            conns
                .remove(CHANNEL_CONTROL)
                .ok_or_else(|| Error::Other("Control channel already taken".to_string()))?
        };

        let channel = tokio::time::timeout(CONTROL_CONNECT_TIMEOUT, conn.connect())
            .await
            .map_err(|_| {
                Error::Other(format!(
                    "Failed waiting for migration control connection on {}",
                    side
                ))
            })??;

        *self.control.lock().await = Some(channel);
        Ok(())
    }

    /// Send a control frame
    pub async fn send_control<T: Serialize>(&self, msg: &T) -> Result<()> {
        let mut control = self.control.lock().await;
        match control.as_mut() {
            Some(channel) => channel.send_json(msg).await,
            None => Err(Error::Other("Control connection not initialized".to_string())),
        }
    }

    /// Receive a control frame
    pub async fn recv_control<T: DeserializeOwned>(&self) -> Result<T> {
        let mut control = self.control.lock().await;
        match control.as_mut() {
            Some(channel) => channel.recv_json().await,
            None => Err(Error::Other("Control connection not initialized".to_string())),
        }
    }

    /// Connect a non-control channel on first use and hand it out
    pub async fn take_channel(&self, name: &'static str) -> Result<Channel> {
        let mut conn = {
            let mut conns = self.conns.lock().await;
            conns.remove(name).ok_or_else(|| {
                Error::Other(format!("Migration {} connection not initialized", name))
            })?
        };

        conn.connect().await
    }

    /// Close every channel except control
    ///
    /// Channels already handed to the driver are owned there; this drops
    /// the never-connected ones so their registry slots die with the
    /// session.
    pub async fn disconnect(&self) {
        let mut conns = self.conns.lock().await;
        conns.retain(|name, _| *name == CHANNEL_CONTROL);
    }

    /// Close control too; only the owning side calls this, last
    pub async fn close_control(&self) {
        if let Some(mut channel) = self.control.lock().await.take() {
            channel.close().await;
        }
    }
}

/// Locate an executable on PATH
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Arguments handed to the instance driver on the sending side
pub struct MigrateSendArgs {
    pub channels: Arc<MigrationChannels>,
    pub snapshots: bool,
    pub live: bool,
    pub cluster_move_source_name: Option<String>,
    pub storage_pool: Option<String>,
    pub allow_inconsistent: bool,
}

/// Arguments handed to the instance driver on the receiving side
pub struct MigrateReceiveArgs {
    pub channels: Arc<MigrationChannels>,
    pub snapshots: bool,
    pub live: bool,
    pub cluster_move_source_name: Option<String>,
    pub storage_pool: Option<String>,
    pub refresh: bool,
    /// In refresh mode, snapshots older than this are kept on the sink
    pub refresh_exclude_older: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_claim() {
        let registry = ChannelRegistry::new();
        let _rx = registry.register("good-secret");

        // Unknown secret: no waiter, the connection is unauthorised
        assert!(registry.claim("bad-secret").is_none());

        // Known secret: claimed exactly once
        assert!(registry.claim("good-secret").is_some());
        assert!(registry.claim("good-secret").is_none());
    }

    #[test]
    fn test_registry_forget() {
        let registry = ChannelRegistry::new();
        let _rx = registry.register("secret");
        registry.forget("secret");

        assert!(registry.claim("secret").is_none());
    }

    #[test]
    fn test_find_executable() {
        // `sh` exists on any host this daemon targets
        assert!(find_executable("sh").is_some());
        assert!(find_executable("no-such-binary-paddock").is_none());
    }
}
