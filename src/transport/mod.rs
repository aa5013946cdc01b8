//! Secure transport abstraction
//!
//! A tunnel needs three things from the encrypted connection underneath
//! it: a way to establish it from credentials, a way to open forwarded
//! byte streams once it is up, and a way to learn that it went away.
//! [`Transport`] and [`TransportConnection`] capture exactly that, so the
//! session and listener logic can run against SSH or an in-process mock.

#[cfg(feature = "ssh")]
mod ssh;

#[cfg(feature = "ssh")]
pub use ssh::{SshConnection, SshTransport};

use crate::config::SshConfig;
use crate::error::TunnelError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Socket options for configuring connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Options for sockets accepted by local listeners
    ///
    /// Interactive traffic dominates, and the client sits on the same
    /// host, so keepalive probing is left off.
    pub fn for_local_client() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: None,
            keepalive_interval: None,
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Factory for secure-transport connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connection type produced by this transport
    type Connection: TransportConnection;

    /// Establish and authenticate a connection to the configured endpoint
    async fn connect(&self, config: &SshConfig) -> Result<Self::Connection, TunnelError>;
}

/// An established secure-transport connection
///
/// Shared by a session's forwarder and SOCKS5 listeners; every method must
/// be safe to call concurrently.
#[async_trait]
pub trait TransportConnection: Send + Sync + 'static {
    /// Stream type of a forwarded channel
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a forwarded stream to `host:port` on behalf of `originator`
    async fn open_forwarded_stream(
        &self,
        originator: SocketAddr,
        host: &str,
        port: u16,
    ) -> Result<Self::Stream, TunnelError>;

    /// Resolve once the connection has dropped, for whatever reason
    async fn closed(&self);

    /// Close the connection
    async fn close(&self);
}
