//! Tunnel session lifecycle
//!
//! A session owns one secure-transport connection, the Local Forwarder
//! bound to it, and up to two SOCKS5 gateways. It runs the
//! connect / active / disconnected / reconnecting lifecycle and the
//! bounded fixed-delay reconnect cycle.
//!
//! Network work never happens under the session lock. Results are
//! committed under the lock afterwards, and `epoch` lets `connect()`,
//! `reconnect()` and `close()` invalidate attempts that are still in
//! flight. A superseded retry task notices through the epoch watch,
//! cleans up after itself and exits; callers wait for it rather than
//! aborting it mid-establish.

use super::info::{TunnelEvent, TunnelInfo};
use super::policy::{ReconnectPolicy, RetryDecision, SessionState, Transition};
use crate::config::{TunnelConfig, LOCAL_FORWARD_HOST};
use crate::error::TunnelError;
use crate::forward::LocalForwarder;
use crate::helper::{endpoint, millis, EVENT_CHANNEL_CAPACITY};
use crate::socks::Socks5Listener;
use crate::transport::{Transport, TransportConnection};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything bound to one live transport connection
struct Resources<C> {
    connection: Arc<C>,
    forwarder: LocalForwarder,
    socks5: Option<Socks5Listener>,
    dynamic: Option<Socks5Listener>,
    monitor: Option<JoinHandle<()>>,
}

impl<C: TransportConnection> Resources<C> {
    async fn release(self) {
        if let Some(monitor) = self.monitor {
            monitor.abort();
        }
        self.forwarder.shutdown().await;
        if let Some(socks5) = self.socks5 {
            socks5.shutdown().await;
        }
        if let Some(dynamic) = self.dynamic {
            dynamic.shutdown().await;
        }
        self.connection.close().await;
    }
}

struct Shared<C> {
    state: SessionState,
    info: TunnelInfo,
    resources: Option<Resources<C>>,
    reconnect_attempts: u32,
    reconnecting: bool,
    retry_task: Option<JoinHandle<()>>,
    /// Bumped by connect/reconnect/close; in-flight attempts from an
    /// older epoch must not commit
    epoch: u64,
    /// Identifies the live connection for its close monitor
    generation: u64,
}

impl<C> Shared<C> {
    fn transition(&mut self, name: &str, transition: Transition) {
        match self.state.apply(transition) {
            Some(next) => {
                if next != self.state {
                    debug!(tunnel = %name, from = %self.state, to = %next, "State change");
                }
                self.state = next;
            }
            None => {
                debug!(tunnel = %name, state = %self.state, ?transition, "Ignoring transition");
            }
        }
    }
}

struct SessionInner<T: Transport> {
    name: String,
    config: TunnelConfig,
    policy: ReconnectPolicy,
    transport: Arc<T>,
    events: broadcast::Sender<TunnelEvent>,
    /// Mirrors `Shared::epoch` so waiting tasks can observe it lock-free
    epoch_tx: watch::Sender<u64>,
    shared: Mutex<Shared<T::Connection>>,
}

/// Handle to one tunnel session
///
/// Cloning is cheap; all clones drive the same session.
pub struct TunnelSession<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for TunnelSession<T> {
    fn clone(&self) -> Self {
        TunnelSession {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for TunnelSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl<T: Transport> TunnelSession<T> {
    /// Create a session in the `Connecting` state; nothing is opened yet
    pub fn new(config: TunnelConfig, transport: Arc<T>) -> Self {
        let name = config.tunnel_name();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (epoch_tx, _) = watch::channel(0);

        let info = TunnelInfo {
            local_host: LOCAL_FORWARD_HOST.to_string(),
            local_port: config.local_port,
            remote_host: config.remote_host.clone(),
            remote_port: config.remote_port,
            is_active: false,
            name: Some(name.clone()),
        };

        TunnelSession {
            inner: Arc::new(SessionInner {
                name,
                policy: config.reconnect_policy(),
                config,
                transport,
                events,
                epoch_tx,
                shared: Mutex::new(Shared {
                    state: SessionState::Connecting,
                    info,
                    resources: None,
                    reconnect_attempts: 0,
                    reconnecting: false,
                    retry_task: None,
                    epoch: 0,
                    generation: 0,
                }),
            }),
        }
    }

    /// Tunnel name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configuration the session was created from
    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    /// Current state
    pub async fn state(&self) -> SessionState {
        self.lock().await.state
    }

    /// Snapshot of the tunnel info
    pub async fn info(&self) -> TunnelInfo {
        self.lock().await.info.clone()
    }

    /// Whether the tunnel is usable right now
    pub async fn is_active(&self) -> bool {
        self.lock().await.info.is_active
    }

    /// Consecutive reconnect attempts made so far
    pub async fn reconnect_attempts(&self) -> u32 {
        self.lock().await.reconnect_attempts
    }

    /// Local endpoint clients should connect to, while active
    pub async fn connection_details(&self) -> Option<(String, u16)> {
        let shared = self.lock().await;
        if shared.info.is_active {
            Some((shared.info.local_host.clone(), shared.info.local_port))
        } else {
            None
        }
    }

    async fn lock(&self) -> MutexGuard<'_, Shared<T::Connection>> {
        self.inner.shared.lock().await
    }

    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn emit_error(&self, err: &TunnelError) {
        self.emit(TunnelEvent::Error {
            name: Some(self.inner.name.clone()),
            message: err.to_string(),
        });
    }

    /// Invalidate every attempt started under the current epoch
    fn bump_epoch(&self, shared: &mut Shared<T::Connection>) -> u64 {
        shared.epoch += 1;
        self.inner.epoch_tx.send_replace(shared.epoch);
        shared.epoch
    }

    /// Resolve once `epoch` is no longer current
    async fn superseded(&self, epoch: u64) {
        let mut rx = self.inner.epoch_tx.subscribe();
        let _ = rx.wait_for(|current| *current != epoch).await;
    }

    /// Wait for a taken retry task to exit, then release stale resources
    async fn settle(retry: Option<JoinHandle<()>>, stale: Option<Resources<T::Connection>>) {
        if let Some(retry) = retry {
            let _ = retry.await;
        }
        if let Some(stale) = stale {
            stale.release().await;
        }
    }

    /// Run the connect sequence
    ///
    /// A no-op returning the current info while the tunnel is active.
    /// Otherwise a pending retry is stopped and awaited, leftover
    /// resources are released, and the sequence runs from scratch.
    ///
    /// Resolves with the tunnel info once the transport is up and the
    /// forwarder is bound. A failed attempt still starts the reconnect
    /// cycle when auto-reconnect is enabled and the error is retryable;
    /// any other failure, such as a forwarder bind conflict, closes the
    /// session instead.
    pub async fn connect(&self) -> Result<TunnelInfo, TunnelError> {
        self.inner.config.validate()?;

        let (epoch, retry, stale) = {
            let mut shared = self.lock().await;
            match shared.state {
                SessionState::Closed => return Err(TunnelError::Closed),
                SessionState::Active => return Ok(shared.info.clone()),
                _ => {}
            }
            let epoch = self.bump_epoch(&mut shared);
            shared.transition(&self.inner.name, Transition::Connect);
            shared.reconnect_attempts = 0;
            shared.reconnecting = false;
            (epoch, shared.retry_task.take(), shared.resources.take())
        };
        Self::settle(retry, stale).await;

        info!(
            tunnel = %self.inner.name,
            remote = %endpoint(&self.inner.config.remote_host, self.inner.config.remote_port),
            "Connecting tunnel"
        );

        match self.establish(epoch).await {
            Ok(info) => {
                info!(tunnel = %self.inner.name, local_port = info.local_port, "Tunnel connected");
                self.emit(TunnelEvent::Connected(info.clone()));
                Ok(info)
            }
            Err(TunnelError::Closed) => Err(TunnelError::Closed),
            Err(e) => {
                error!(tunnel = %self.inner.name, "Tunnel connect failed: {}", e);
                self.emit_error(&e);

                let mut shared = self.lock().await;
                if shared.epoch == epoch {
                    if !e.is_retryable() {
                        shared.transition(&self.inner.name, Transition::Closed);
                        shared.info.is_active = false;
                    } else {
                        shared.transition(&self.inner.name, Transition::Failed);
                        if self.inner.policy.enabled && !shared.reconnecting {
                            self.start_reconnect_cycle(&mut shared);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Open the transport and bind the listeners, then commit
    async fn establish(&self, epoch: u64) -> Result<TunnelInfo, TunnelError> {
        let config = &self.inner.config;
        let name = self.inner.name.as_str();

        let ssh = config.ssh()?;
        let connection = tokio::select! {
            result = self.inner.transport.connect(ssh) => Arc::new(result?),
            _ = self.superseded(epoch) => return Err(TunnelError::Closed),
        };

        let forwarder = match LocalForwarder::bind(
            LOCAL_FORWARD_HOST,
            config.local_port,
            &config.remote_host,
            config.remote_port,
            connection.clone(),
            name,
        )
        .await
        {
            Ok(forwarder) => forwarder,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        let socks5 = self.start_socks5(&connection).await;
        let dynamic = self.start_dynamic_socks5(&connection).await;

        let mut resources = Resources {
            connection,
            forwarder,
            socks5,
            dynamic,
            monitor: None,
        };

        let mut shared = self.lock().await;
        if shared.state.is_closed() || shared.epoch != epoch {
            drop(shared);
            resources.release().await;
            return Err(TunnelError::Closed);
        }

        shared.generation += 1;
        resources.monitor = Some(self.spawn_monitor(resources.connection.clone(), shared.generation));
        shared.resources = Some(resources);
        shared.info.is_active = true;
        shared.reconnect_attempts = 0;
        shared.reconnecting = false;
        shared.transition(name, Transition::Ready);

        Ok(shared.info.clone())
    }

    async fn start_socks5(&self, connection: &Arc<T::Connection>) -> Option<Socks5Listener> {
        let socks = self.inner.config.socks5_enabled()?;
        let (host, port) = self.inner.config.socks5_endpoint().ok().flatten()?;

        match Socks5Listener::bind_authenticated(
            &host,
            port,
            socks.credentials(),
            connection.clone(),
            &self.inner.name,
        )
        .await
        {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!(tunnel = %self.inner.name, "Failed to start SOCKS5 server: {}", e);
                self.emit_error(&e);
                None
            }
        }
    }

    async fn start_dynamic_socks5(
        &self,
        connection: &Arc<T::Connection>,
    ) -> Option<Socks5Listener> {
        let (host, port) = self.inner.config.dynamic_socks5_endpoint().ok().flatten()?;

        match Socks5Listener::bind_open(&host, port, connection.clone(), &self.inner.name).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!(tunnel = %self.inner.name, "Failed to start dynamic SOCKS5 server: {}", e);
                self.emit_error(&e);
                None
            }
        }
    }

    fn spawn_monitor(&self, connection: Arc<T::Connection>, generation: u64) -> JoinHandle<()> {
        let weak: Weak<SessionInner<T>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            connection.closed().await;
            if let Some(inner) = weak.upgrade() {
                TunnelSession { inner }.on_transport_closed(generation).await;
            }
        })
    }

    async fn on_transport_closed(&self, generation: u64) {
        let mut shared = self.lock().await;
        if shared.generation != generation || shared.state != SessionState::Active {
            return;
        }

        shared.info.is_active = false;
        shared.transition(&self.inner.name, Transition::TransportClosed);
        warn!(tunnel = %self.inner.name, "Secure transport closed");
        self.emit(TunnelEvent::Disconnected(shared.info.clone()));

        if self.inner.policy.enabled && !shared.reconnecting {
            self.start_reconnect_cycle(&mut shared);
        }
    }

    fn start_reconnect_cycle(&self, shared: &mut Shared<T::Connection>) {
        shared.reconnecting = true;
        let session = self.clone();
        let epoch = shared.epoch;
        shared.retry_task = Some(tokio::spawn(async move {
            session.run_reconnect_cycle(epoch).await
        }));
    }

    async fn run_reconnect_cycle(&self, epoch: u64) {
        let name = self.inner.name.as_str();

        loop {
            let delay = {
                let mut shared = self.lock().await;
                if shared.state.is_closed() || shared.epoch != epoch {
                    return;
                }

                shared.reconnect_attempts += 1;
                let attempt = shared.reconnect_attempts;

                match self.inner.policy.decide(attempt) {
                    RetryDecision::GiveUp => {
                        shared.reconnecting = false;
                        shared.transition(name, Transition::GaveUp);
                        let stale = shared.resources.take();
                        drop(shared);

                        if let Some(stale) = stale {
                            stale.release().await;
                        }

                        let err = TunnelError::ReconnectExhausted(self.inner.policy.max_attempts);
                        error!(tunnel = %name, "{}", err);
                        self.emit_error(&err);
                        return;
                    }
                    RetryDecision::Retry { delay } => {
                        shared.transition(name, Transition::RetryScheduled);
                        info!(
                            tunnel = %name,
                            attempt,
                            max_attempts = self.inner.policy.max_attempts,
                            delay_ms = millis(delay),
                            "Scheduling reconnect"
                        );
                        self.emit(TunnelEvent::Reconnecting {
                            attempt,
                            name: Some(self.inner.name.clone()),
                        });
                        delay
                    }
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.superseded(epoch) => return,
            }

            let stale = {
                let mut shared = self.lock().await;
                if shared.state.is_closed() || shared.epoch != epoch {
                    return;
                }
                shared.resources.take()
            };
            if let Some(stale) = stale {
                stale.release().await;
            }

            match self.establish(epoch).await {
                Ok(info) => {
                    info!(tunnel = %name, "Tunnel reconnected");
                    self.emit(TunnelEvent::Reconnected(info));
                    return;
                }
                Err(TunnelError::Closed) => return,
                Err(e) => {
                    warn!(tunnel = %name, "Reconnect attempt failed: {}", e);
                    self.emit_error(&e);

                    let mut shared = self.lock().await;
                    if shared.epoch != epoch {
                        return;
                    }
                    if !e.is_retryable() {
                        shared.reconnecting = false;
                        shared.transition(name, Transition::Closed);
                        return;
                    }
                    shared.transition(name, Transition::Failed);
                }
            }
        }
    }

    /// Reconnect on demand
    ///
    /// Same contract as [`connect`](Self::connect): a no-op while the
    /// tunnel is active, otherwise a fresh connect sequence that first
    /// stops any pending retry.
    pub async fn reconnect(&self) -> Result<TunnelInfo, TunnelError> {
        info!(tunnel = %self.inner.name, "Manual reconnect");
        self.connect().await
    }

    /// Close the session for good
    ///
    /// Stops any pending retry and waits for it to exit, then tears down
    /// the listeners, every relayed connection and the transport. Ports
    /// are free again once this returns.
    pub async fn close(&self) {
        let (resources, retry) = {
            let mut shared = self.lock().await;
            if shared.state.is_closed() && shared.resources.is_none() {
                return;
            }
            shared.transition(&self.inner.name, Transition::Closed);
            self.bump_epoch(&mut shared);
            shared.info.is_active = false;
            shared.reconnecting = false;
            (shared.resources.take(), shared.retry_task.take())
        };

        Self::settle(retry, resources).await;

        info!(tunnel = %self.inner.name, "Tunnel closed");
    }
}
