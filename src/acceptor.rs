//! TCP accept loop shared by the forwarder and the SOCKS5 gateways
//!
//! Each accepted socket is served on its own task inside a [`JoinSet`]
//! owned by the loop. Stopping the loop drops the set, which aborts every
//! in-flight connection.

use crate::error::TunnelError;
use crate::helper::{endpoint, ACCEPT_ERROR_BACKOFF};
use crate::transport::SocketOpts;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Bind a listener, mapping failures to [`TunnelError::Bind`]
pub async fn bind(host: &str, port: u16) -> Result<TcpListener, TunnelError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|source| TunnelError::Bind {
            addr: endpoint(host, port),
            source,
        })
}

/// A running accept loop
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and tear down every connection; returns once the
    /// port is released
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawn the accept loop for `listener`, serving each client with `serve`
pub fn spawn_accept_loop<F, Fut>(
    listener: TcpListener,
    kind: &'static str,
    serve: F,
) -> Result<ListenerHandle, TunnelError>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    let task = tokio::spawn(accept_loop(listener, kind, serve));

    Ok(ListenerHandle {
        local_addr,
        task: Some(task),
    })
}

async fn accept_loop<F, Fut>(listener: TcpListener, kind: &'static str, serve: F)
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let opts = SocketOpts::for_local_client();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        debug!(listener = kind, peer = %peer, "Accepted connection");
                        if let Err(e) = opts.apply(&socket) {
                            debug!(peer = %peer, "Failed to set socket options: {}", e);
                        }
                        connections.spawn(serve(socket, peer));
                    }
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning
                        warn!(listener = kind, "Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}
