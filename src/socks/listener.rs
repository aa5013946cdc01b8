//! SOCKS5 listener
//!
//! Drives the [`Socks5Engine`] over each accepted socket and relays the
//! negotiated connection through the tunnel's secure transport.

use super::consts::NEGOTIATION_BUFFER_SIZE;
use super::engine::{encode_reply, Socks5Engine};
use super::relay::relay;
use super::types::{Phase, Socks5Credentials, TargetAddr};
use crate::acceptor::{self, ListenerHandle};
use crate::error::{Socks5Error, Socks5ReplyCode, TunnelError};
use crate::transport::TransportConnection;
use bytes::{Buf, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Which of the two gateway variants a listener is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Static gateway, optionally gated by username/password
    Authenticated,
    /// Dynamic gateway, no-auth only (`ssh -D` style)
    Open,
}

impl ListenerKind {
    fn label(self) -> &'static str {
        match self {
            ListenerKind::Authenticated => "socks5",
            ListenerKind::Open => "dynamic-socks5",
        }
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Negotiation state of one client socket
///
/// Each step performs at most one read. Bytes left over after a message
/// are kept and become the input of the next step without another read.
pub struct Socks5Connection<S> {
    stream: S,
    engine: Arc<Socks5Engine>,
    phase: Phase,
    buf: BytesMut,
}

impl<S> Socks5Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an accepted socket
    pub fn new(stream: S, engine: Arc<Socks5Engine>) -> Self {
        Socks5Connection {
            stream,
            engine,
            phase: Phase::AwaitingHandshake,
            buf: BytesMut::with_capacity(NEGOTIATION_BUFFER_SIZE),
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run handshake, optional auth and request; returns the target
    pub async fn negotiate(&mut self) -> Result<TargetAddr, TunnelError> {
        self.handshake().await?;
        if self.phase == Phase::AwaitingAuth {
            self.authenticate().await?;
        }
        self.request().await
    }

    async fn fill(&mut self) -> Result<(), TunnelError> {
        if !self.buf.is_empty() {
            return Ok(());
        }
        let n = self.stream.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(Socks5Error::ConnectionClosed.into());
        }
        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), TunnelError> {
        self.fill().await?;
        let greeting = self.engine.handshake(&self.buf)?;
        self.buf.advance(greeting.consumed);
        self.stream.write_all(&greeting.reply()).await?;
        self.phase = self.engine.after_handshake(&greeting)?;
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<(), TunnelError> {
        self.fill().await?;
        let outcome = self.engine.authenticate(&self.buf)?;
        self.buf.advance(outcome.consumed);
        self.stream.write_all(&outcome.reply()).await?;
        if !outcome.accepted {
            debug!(user = %outcome.username, "SOCKS5 authentication rejected");
        }
        self.phase = self.engine.after_auth(&outcome)?;
        Ok(())
    }

    async fn request(&mut self) -> Result<TargetAddr, TunnelError> {
        self.fill().await?;
        match self.engine.parse_request(&self.buf) {
            Ok(request) => {
                self.buf.advance(request.consumed);
                Ok(request.target)
            }
            Err(e) => {
                if let Some(code) = e.reply_code() {
                    self.stream.write_all(&encode_reply(code)).await?;
                }
                Err(e.into())
            }
        }
    }

    /// Send a failure reply; the connection is dropped afterwards
    pub async fn reject(mut self, code: Socks5ReplyCode) -> std::io::Result<()> {
        self.stream.write_all(&encode_reply(code)).await?;
        self.stream.shutdown().await
    }

    /// Send SUCCESS and hand back the socket plus any pipelined client bytes
    pub async fn accept(mut self) -> std::io::Result<(S, BytesMut)> {
        self.stream
            .write_all(&encode_reply(Socks5ReplyCode::Succeeded))
            .await?;
        Ok((self.stream, self.buf))
    }
}

/// A running SOCKS5 gateway
#[derive(Debug)]
pub struct Socks5Listener {
    kind: ListenerKind,
    handle: ListenerHandle,
}

impl Socks5Listener {
    /// Bind the static gateway
    pub async fn bind_authenticated<C: TransportConnection>(
        host: &str,
        port: u16,
        credentials: Option<Socks5Credentials>,
        connection: Arc<C>,
        tunnel: &str,
    ) -> Result<Self, TunnelError> {
        let engine = Socks5Engine::authenticated(credentials);
        Self::bind(ListenerKind::Authenticated, host, port, engine, connection, tunnel).await
    }

    /// Bind the dynamic gateway
    pub async fn bind_open<C: TransportConnection>(
        host: &str,
        port: u16,
        connection: Arc<C>,
        tunnel: &str,
    ) -> Result<Self, TunnelError> {
        Self::bind(ListenerKind::Open, host, port, Socks5Engine::open(), connection, tunnel).await
    }

    async fn bind<C: TransportConnection>(
        kind: ListenerKind,
        host: &str,
        port: u16,
        engine: Socks5Engine,
        connection: Arc<C>,
        tunnel: &str,
    ) -> Result<Self, TunnelError> {
        let listener = acceptor::bind(host, port).await?;
        let engine = Arc::new(engine);
        let tunnel: Arc<str> = Arc::from(tunnel);

        info!(
            tunnel = %tunnel,
            listener = %kind,
            addr = %listener.local_addr()?,
            auth = engine.has_credentials(),
            "SOCKS5 server listening"
        );

        let handle = acceptor::spawn_accept_loop(listener, kind.label(), move |socket, peer| {
            serve_client(
                socket,
                peer,
                engine.clone(),
                connection.clone(),
                tunnel.clone(),
                kind,
            )
        })?;

        Ok(Socks5Listener { kind, handle })
    }

    /// Gateway variant
    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Address the gateway is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Stop the gateway and drop every client
    pub async fn shutdown(self) {
        self.handle.shutdown().await
    }
}

async fn serve_client<C: TransportConnection>(
    socket: TcpStream,
    peer: SocketAddr,
    engine: Arc<Socks5Engine>,
    connection: Arc<C>,
    tunnel: Arc<str>,
    kind: ListenerKind,
) {
    let mut conn = Socks5Connection::new(socket, engine);

    let target = match conn.negotiate().await {
        Ok(target) => target,
        Err(TunnelError::Socks5(e)) if e.is_auth() => {
            warn!(
                tunnel = %tunnel,
                listener = %kind,
                peer = %peer,
                "SOCKS5 client rejected: {}",
                e
            );
            return;
        }
        Err(e) => {
            debug!(
                tunnel = %tunnel,
                listener = %kind,
                peer = %peer,
                phase = %conn.phase(),
                "SOCKS5 negotiation failed: {}",
                e
            );
            return;
        }
    };

    let stream = match connection
        .open_forwarded_stream(peer, &target.host(), target.port())
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                tunnel = %tunnel,
                listener = %kind,
                peer = %peer,
                target_addr = %target,
                "Forward failed: {}",
                e
            );
            let _ = conn.reject(Socks5ReplyCode::HostUnreachable).await;
            return;
        }
    };

    let (client, early) = match conn.accept().await {
        Ok(parts) => parts,
        Err(e) => {
            debug!(peer = %peer, "Failed to send SOCKS5 reply: {}", e);
            return;
        }
    };

    debug!(tunnel = %tunnel, listener = %kind, peer = %peer, target_addr = %target, "SOCKS5 relay started");

    if let Err(e) = relay(client, stream, &early).await {
        debug!(peer = %peer, target_addr = %target, "Relay error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_negotiate_no_auth() {
        let mock = Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .build();

        let mut conn = Socks5Connection::new(mock, Arc::new(Socks5Engine::open()));
        let target = conn.negotiate().await.unwrap();
        assert_eq!(target.to_string(), "10.0.0.1:80");
        assert_eq!(conn.phase(), Phase::AwaitingRequest);
    }

    #[tokio::test]
    async fn test_negotiate_with_password() {
        let mock = Builder::new()
            .read(&[0x05, 0x02, 0x00, 0x02])
            .write(&[0x05, 0x02])
            .read(&[0x01, 0x01, b'u', 0x01, b'p'])
            .write(&[0x01, 0x00])
            .read(&[
                0x05, 0x01, 0x00, 0x03, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c',
                b'o', b'm', 0x01, 0xBB,
            ])
            .build();

        let engine = Socks5Engine::authenticated(Some(Socks5Credentials::new("u", "p")));
        let mut conn = Socks5Connection::new(mock, Arc::new(engine));
        let target = conn.negotiate().await.unwrap();
        assert_eq!(target, TargetAddr::Domain("example.com".to_string(), 443));
    }

    #[tokio::test]
    async fn test_negotiate_bad_password() {
        let mock = Builder::new()
            .read(&[0x05, 0x01, 0x02])
            .write(&[0x05, 0x02])
            .read(&[0x01, 0x01, b'u', 0x01, b'x'])
            .write(&[0x01, 0x01])
            .build();

        let engine = Socks5Engine::authenticated(Some(Socks5Credentials::new("u", "p")));
        let mut conn = Socks5Connection::new(mock, Arc::new(engine));
        let err = conn.negotiate().await.unwrap_err();
        assert!(matches!(err, TunnelError::Socks5(Socks5Error::AuthFailed)));
    }

    #[tokio::test]
    async fn test_negotiate_no_acceptable_method() {
        let mock = Builder::new()
            .read(&[0x05, 0x01, 0x02])
            .write(&[0x05, 0xFF])
            .build();

        let mut conn = Socks5Connection::new(mock, Arc::new(Socks5Engine::open()));
        let err = conn.negotiate().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Socks5(Socks5Error::NoAcceptableMethod)
        ));
    }

    #[tokio::test]
    async fn test_negotiate_truncated_handshake_sends_nothing() {
        let mock = Builder::new().read(&[0x05, 0x05, 0x00, 0x02]).build();

        let mut conn = Socks5Connection::new(mock, Arc::new(Socks5Engine::open()));
        let err = conn.negotiate().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Socks5(Socks5Error::Truncated { .. })
        ));
        assert_eq!(conn.phase(), Phase::AwaitingHandshake);
    }

    #[tokio::test]
    async fn test_negotiate_unsupported_command_replies() {
        let mut reply = vec![0x05, 0x07, 0x00, 0x01];
        reply.extend_from_slice(&[0; 6]);
        let mock = Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .write(&reply)
            .build();

        let mut conn = Socks5Connection::new(mock, Arc::new(Socks5Engine::open()));
        let err = conn.negotiate().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Socks5(Socks5Error::CommandNotSupported(0x03))
        ));
    }

    #[tokio::test]
    async fn test_negotiate_client_disconnect() {
        let mock = Builder::new().build();
        let mut conn = Socks5Connection::new(mock, Arc::new(Socks5Engine::open()));
        let err = conn.negotiate().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Socks5(Socks5Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_pipelined_bytes_are_carried() {
        let (mut client, server) = duplex(1024);

        // Greeting, request and payload in one write
        let mut pipelined = vec![0x05, 0x01, 0x00];
        pipelined.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90]);
        pipelined.extend_from_slice(b"hello");
        client.write_all(&pipelined).await.unwrap();

        let mut conn = Socks5Connection::new(server, Arc::new(Socks5Engine::open()));
        let target = conn.negotiate().await.unwrap();
        assert_eq!(target.to_string(), "127.0.0.1:8080");

        let (_server, early) = conn.accept().await.unwrap();
        assert_eq!(&early[..], b"hello");

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..2], &[0x05, 0x00]);
        assert_eq!(&replies[2..], &encode_reply(Socks5ReplyCode::Succeeded));
    }

    #[test]
    fn test_listener_kind_labels() {
        assert_eq!(ListenerKind::Authenticated.to_string(), "socks5");
        assert_eq!(ListenerKind::Open.to_string(), "dynamic-socks5");
    }
}
