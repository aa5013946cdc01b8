//! Local Forwarder
//!
//! Listens on a fixed local port and relays every accepted socket to one
//! fixed remote `host:port` through the secure transport.

use crate::acceptor::{self, ListenerHandle};
use crate::error::TunnelError;
use crate::helper::endpoint;
use crate::socks::relay;
use crate::transport::TransportConnection;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// A running forwarder
#[derive(Debug)]
pub struct LocalForwarder {
    handle: ListenerHandle,
}

#[derive(Debug)]
struct ForwardTarget {
    tunnel: String,
    host: String,
    port: u16,
}

impl LocalForwarder {
    /// Bind `host:port` and forward each client to `remote_host:remote_port`
    pub async fn bind<C: TransportConnection>(
        host: &str,
        port: u16,
        remote_host: &str,
        remote_port: u16,
        connection: Arc<C>,
        tunnel: &str,
    ) -> Result<Self, TunnelError> {
        let listener = acceptor::bind(host, port).await?;
        let target = Arc::new(ForwardTarget {
            tunnel: tunnel.to_string(),
            host: remote_host.to_string(),
            port: remote_port,
        });

        info!(
            tunnel = %tunnel,
            addr = %listener.local_addr()?,
            remote = %endpoint(remote_host, remote_port),
            "Local forwarder listening"
        );

        let handle = acceptor::spawn_accept_loop(listener, "forward", move |socket, peer| {
            forward_client(socket, peer, target.clone(), connection.clone())
        })?;

        Ok(LocalForwarder { handle })
    }

    /// Address the forwarder is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Stop accepting and drop every relayed connection
    pub async fn shutdown(self) {
        self.handle.shutdown().await
    }
}

async fn forward_client<C: TransportConnection>(
    socket: TcpStream,
    peer: SocketAddr,
    target: Arc<ForwardTarget>,
    connection: Arc<C>,
) {
    let stream = match connection
        .open_forwarded_stream(peer, &target.host, target.port)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            // Dropping the socket closes the client; the listener keeps going
            warn!(tunnel = %target.tunnel, peer = %peer, "Forward failed: {}", e);
            return;
        }
    };

    debug!(
        tunnel = %target.tunnel,
        peer = %peer,
        "Forwarding to {}:{}",
        target.host,
        target.port
    );

    if let Err(e) = relay(socket, stream, &[]).await {
        debug!(tunnel = %target.tunnel, peer = %peer, "Relay error: {}", e);
    }
}
