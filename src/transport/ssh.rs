//! SSH secure transport backed by russh
//!
//! Forwarded streams are `direct-tcpip` channels on a single
//! authenticated client session.

use super::{SocketOpts, Transport, TransportConnection};
use crate::config::{SshConfig, SshCredential};
use crate::error::TunnelError;
use crate::helper;
use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle};
use russh::keys::{decode_secret_key, load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use russh::ChannelStream;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Client-side event handler
///
/// Owned by the russh session task. It is dropped when that task ends,
/// which is how we learn the connection is gone.
struct ClientHandler {
    endpoint: String,
    closed_tx: watch::Sender<bool>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            endpoint = %self.endpoint,
            fingerprint = %server_public_key.fingerprint(Default::default()),
            "Accepting SSH host key"
        );
        Ok(true)
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        let _ = self.closed_tx.send(true);
    }
}

/// Transport that opens SSH client sessions
#[derive(Debug, Clone, Default)]
pub struct SshTransport;

impl SshTransport {
    /// Create a new SSH transport
    pub fn new() -> Self {
        SshTransport
    }
}

/// An authenticated SSH client session
pub struct SshConnection {
    handle: Handle<ClientHandler>,
    endpoint: String,
    closed_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("endpoint", &self.endpoint)
            .field("closed", &*self.closed_rx.borrow())
            .finish()
    }
}

fn load_key(credential: &SshCredential) -> Result<Option<PrivateKey>, TunnelError> {
    match credential {
        SshCredential::Password(_) => Ok(None),
        SshCredential::PrivateKey { key, passphrase } => decode_secret_key(key, passphrase.as_deref())
            .map(Some)
            .map_err(|e| TunnelError::Auth(format!("Failed to parse private key: {}", e))),
        SshCredential::PrivateKeyFile { path, passphrase } => {
            load_secret_key(path, passphrase.as_deref())
                .map(Some)
                .map_err(|e| {
                    TunnelError::Auth(format!(
                        "Failed to load private key from {}: {}",
                        path.display(),
                        e
                    ))
                })
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    type Connection = SshConnection;

    async fn connect(&self, config: &SshConfig) -> Result<SshConnection, TunnelError> {
        let credential = config.credential()?;
        // Parse the key before touching the network so a bad key fails fast
        let key = load_key(&credential)?;

        let endpoint = helper::endpoint(&config.host, config.port);
        let client_config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(config.keepalive_secs)),
            ..Default::default()
        });

        let (closed_tx, closed_rx) = watch::channel(false);
        let handler = ClientHandler {
            endpoint: endpoint.clone(),
            closed_tx,
        };

        debug!(endpoint = %endpoint, user = %config.username, "Connecting to SSH server");

        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let mut handle = tokio::time::timeout(connect_timeout, async {
            let stream = TcpStream::connect((config.host.as_str(), config.port))
                .await
                .map_err(russh::Error::from)?;
            // Catch a dead bastion even when the SSH layer is idle
            if let Err(e) = SocketOpts::default().apply(&stream) {
                warn!(endpoint = %endpoint, "Failed to set socket options: {}", e);
            }
            client::connect_stream(client_config, stream, handler).await
        })
        .await
        .map_err(|_| {
            TunnelError::Transport(format!(
                "Connection to {} timed out after {:?}",
                endpoint, connect_timeout
            ))
        })?
        .map_err(|e| TunnelError::Transport(format!("Failed to connect to {}: {}", endpoint, e)))?;

        let auth = match (&credential, key) {
            (SshCredential::Password(password), _) => handle
                .authenticate_password(config.username.as_str(), password.as_str())
                .await
                .map_err(|e| TunnelError::Auth(e.to_string()))?,
            (_, Some(key)) => {
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| TunnelError::Auth(e.to_string()))?
                    .flatten();
                handle
                    .authenticate_publickey(
                        config.username.as_str(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(|e| TunnelError::Auth(e.to_string()))?
            }
            (_, None) => return Err(TunnelError::Config("no credential".to_string())),
        };

        if !matches!(auth, AuthResult::Success) {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
            return Err(TunnelError::Auth(format!(
                "SSH server {} rejected credentials for {}",
                endpoint, config.username
            )));
        }

        info!(endpoint = %endpoint, user = %config.username, "SSH session authenticated");

        Ok(SshConnection {
            handle,
            endpoint,
            closed_rx,
        })
    }
}

#[async_trait]
impl TransportConnection for SshConnection {
    type Stream = ChannelStream<client::Msg>;

    async fn open_forwarded_stream(
        &self,
        originator: SocketAddr,
        host: &str,
        port: u16,
    ) -> Result<Self::Stream, TunnelError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                host,
                port as u32,
                originator.ip().to_string(),
                originator.port() as u32,
            )
            .await
            .map_err(|e| TunnelError::Forward {
                target: helper::endpoint(host, port),
                reason: e.to_string(),
            })?;

        Ok(channel.into_stream())
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        // An error means the sender is gone, which also means closed
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        if *self.closed_rx.borrow() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(endpoint = %self.endpoint, "SSH disconnect failed: {}", e);
        }
    }
}
