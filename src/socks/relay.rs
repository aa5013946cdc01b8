//! Bidirectional byte relay
//!
//! Pipes a local client socket and a forwarded stream into each other.
//! Whichever direction finishes first tears down both ends; nothing is
//! drained.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Relay data bidirectionally between a client and a forwarded stream
///
/// `early` holds client bytes that arrived together with the negotiation
/// and is written to the forwarded stream before relaying starts.
pub async fn relay<A, B>(client: A, mut target: B, early: &[u8]) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    if !early.is_empty() {
        target.write_all(early).await?;
    }

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let upstream = tokio::io::copy(&mut client_read, &mut target_write);
    let downstream = tokio::io::copy(&mut target_read, &mut client_write);

    tokio::select! {
        result = upstream => {
            match result {
                Ok(bytes) => debug!("client->remote finished: {} bytes", bytes),
                Err(e) => debug!("client->remote error: {}", e),
            }
        }
        result = downstream => {
            match result {
                Ok(bytes) => debug!("remote->client finished: {} bytes", bytes),
                Err(e) => debug!("remote->client error: {}", e),
            }
        }
    }

    Ok(())
}
