//! Test utilities and mocks for Phantom Portal
//!
//! `MockTransport` stands in for SSH: forwarded streams are plain TCP
//! connections to an in-process echo server, and connections can be made
//! to fail or to drop on demand.

#![allow(dead_code)]

use async_trait::async_trait;
use phantom_portal::config::{SshConfig, TunnelConfig};
use phantom_portal::error::TunnelError;
use phantom_portal::transport::{Transport, TransportConnection};
use phantom_portal::tunnel::TunnelEvent;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};

/// Generous upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn a TCP echo server on loopback
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// SSH endpoint the mock ignores apart from validation
pub fn test_ssh() -> SshConfig {
    SshConfig::with_password("bastion.test", 22, "deploy", "secret")
}

/// Tunnel config on a free local port
pub fn test_tunnel(name: &str) -> TunnelConfig {
    let mut config = TunnelConfig::new(test_ssh(), "db.internal", 5432, free_port());
    config.name = Some(name.to_string());
    config
}

#[derive(Default)]
struct MockState {
    connections: Vec<Arc<watch::Sender<bool>>>,
    opened: Vec<(String, u16)>,
}

/// Scriptable secure transport
pub struct MockTransport {
    echo: SocketAddr,
    /// Connect attempts that will still fail; `u32::MAX` fails forever
    failures_left: AtomicU32,
    attempts: AtomicU32,
    /// How long each connect takes, in milliseconds
    connect_delay_ms: AtomicU64,
    refuse_forwards: Arc<AtomicBool>,
    close_delay: Duration,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Transport whose connects always succeed
    pub async fn new() -> Arc<Self> {
        Self::build(0, Duration::ZERO).await
    }

    /// Transport whose connects always fail
    pub async fn failing() -> Arc<Self> {
        Self::build(u32::MAX, Duration::ZERO).await
    }

    /// Transport whose first `n` connects fail
    pub async fn failing_first(n: u32) -> Arc<Self> {
        Self::build(n, Duration::ZERO).await
    }

    /// Transport whose connections take `delay` to close
    pub async fn with_close_delay(delay: Duration) -> Arc<Self> {
        Self::build(0, delay).await
    }

    async fn build(failures: u32, close_delay: Duration) -> Arc<Self> {
        Arc::new(MockTransport {
            echo: spawn_echo_server().await,
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            connect_delay_ms: AtomicU64::new(0),
            refuse_forwards: Arc::new(AtomicBool::new(false)),
            close_delay,
            state: Arc::new(Mutex::new(MockState::default())),
        })
    }

    /// Connect attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make subsequent connects fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        let value = if failing { u32::MAX } else { 0 };
        self.failures_left.store(value, Ordering::SeqCst);
    }

    /// Make subsequent connects take `delay` before resolving
    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Refuse every forwarded stream
    pub fn refuse_forwards(&self, refuse: bool) {
        self.refuse_forwards.store(refuse, Ordering::SeqCst);
    }

    /// Simulate the server dropping every live connection
    pub fn drop_all_connections(&self) {
        for conn in &self.state.lock().unwrap().connections {
            conn.send_replace(true);
        }
    }

    /// Connections established and not yet closed
    pub fn live_connections(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|c| !*c.borrow())
            .count()
    }

    /// Targets of every forwarded stream opened so far
    pub fn opened_targets(&self) -> Vec<(String, u16)> {
        self.state.lock().unwrap().opened.clone()
    }
}

/// Connection produced by [`MockTransport`]
pub struct MockConnection {
    echo: SocketAddr,
    closed: Arc<watch::Sender<bool>>,
    refuse_forwards: Arc<AtomicBool>,
    close_delay: Duration,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(&self, _config: &SshConfig) -> Result<MockConnection, TunnelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            if left != u32::MAX {
                self.failures_left.store(left - 1, Ordering::SeqCst);
            }
            return Err(TunnelError::Transport("connection refused".to_string()));
        }

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        self.state.lock().unwrap().connections.push(closed.clone());

        Ok(MockConnection {
            echo: self.echo,
            closed,
            refuse_forwards: self.refuse_forwards.clone(),
            close_delay: self.close_delay,
            state: self.state.clone(),
        })
    }
}

#[async_trait]
impl TransportConnection for MockConnection {
    type Stream = TcpStream;

    async fn open_forwarded_stream(
        &self,
        _originator: SocketAddr,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, TunnelError> {
        if self.refuse_forwards.load(Ordering::SeqCst) || *self.closed.borrow() {
            return Err(TunnelError::Forward {
                target: format!("{}:{}", host, port),
                reason: "administratively prohibited".to_string(),
            });
        }
        self.state
            .lock()
            .unwrap()
            .opened
            .push((host.to_string(), port));
        Ok(TcpStream::connect(self.echo).await?)
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.closed.send_replace(true);
    }
}

/// Write `payload` and expect it echoed back
pub async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

/// Whether the peer has closed `stream`
pub async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(TEST_TIMEOUT, stream.read(&mut buf))
        .await
        .expect("socket was not closed");
    assert_eq!(read.unwrap_or(0), 0);
}

/// Collect events until `pred` matches one, or panic on timeout
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<TunnelEvent>,
    mut pred: F,
) -> Vec<TunnelEvent>
where
    F: FnMut(&TunnelEvent) -> bool,
{
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// SOCKS5 client helpers
pub mod socks5_client {
    use super::*;
    use phantom_portal::socks::{encode_connect_request, TargetAddr};

    /// Send a greeting and return the selected method
    pub async fn greet(stream: &mut TcpStream, methods: &[u8]) -> u8 {
        let mut greeting = vec![0x05, methods.len() as u8];
        greeting.extend_from_slice(methods);
        stream.write_all(&greeting).await.unwrap();

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        reply[1]
    }

    /// Run the username/password sub-negotiation; returns the status byte
    pub async fn login(stream: &mut TcpStream, username: &str, password: &str) -> u8 {
        let mut request = vec![0x01, username.len() as u8];
        request.extend_from_slice(username.as_bytes());
        request.push(password.len() as u8);
        request.extend_from_slice(password.as_bytes());
        stream.write_all(&request).await.unwrap();

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x01);
        reply[1]
    }

    /// Send a CONNECT request and return the 10-byte reply
    pub async fn request(stream: &mut TcpStream, target: &TargetAddr) -> [u8; 10] {
        stream
            .write_all(&encode_connect_request(target))
            .await
            .unwrap();
        read_reply(stream).await
    }

    /// Read one reply frame
    pub async fn read_reply(stream: &mut TcpStream) -> [u8; 10] {
        let mut reply = [0u8; 10];
        tokio::time::timeout(TEST_TIMEOUT, stream.read_exact(&mut reply))
            .await
            .expect("reply timed out")
            .unwrap();
        reply
    }

    /// No-auth handshake plus CONNECT; returns the reply code
    pub async fn connect_no_auth(stream: &mut TcpStream, target: &TargetAddr) -> u8 {
        assert_eq!(greet(stream, &[0x00]).await, 0x00);
        request(stream, target).await[1]
    }
}

/// Hold `port` on every address `localhost` resolves to
pub async fn occupy_localhost(port: u16) -> Vec<TcpListener> {
    let mut held = Vec::new();
    for addr in tokio::net::lookup_host(("localhost", port)).await.unwrap() {
        if let Ok(listener) = TcpListener::bind(addr).await {
            held.push(listener);
        }
    }
    assert!(!held.is_empty(), "could not occupy localhost:{}", port);
    held
}

/// Connect to the tunnel's local forwarder
pub async fn connect_local(port: u16) -> TcpStream {
    tokio::time::timeout(TEST_TIMEOUT, TcpStream::connect(("localhost", port)))
        .await
        .expect("connect timed out")
        .unwrap()
}
