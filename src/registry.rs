//! Tunnel registry
//!
//! Owns every named [`TunnelSession`] of the process and tracks which one
//! is the default. All table mutations are serialized through one lock so
//! name uniqueness and default reassignment hold under concurrent calls.

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::helper::{endpoint, EVENT_CHANNEL_CAPACITY};
use crate::transport::Transport;
use crate::tunnel::{TunnelEvent, TunnelInfo, TunnelSession};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A session event tagged with the tunnel it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEvent {
    /// Tunnel name
    pub tunnel: String,
    /// The event
    pub event: TunnelEvent,
}

/// Listing entry returned by [`TunnelRegistry::get_all_tunnels`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSummary {
    /// Tunnel name
    pub name: String,
    /// Snapshot at listing time
    pub info: TunnelInfo,
}

struct Entry<T: Transport> {
    session: TunnelSession<T>,
    event_relay: JoinHandle<()>,
}

struct Table<T: Transport> {
    tunnels: HashMap<String, Entry<T>>,
    default_tunnel: Option<String>,
}

impl<T: Transport> Table<T> {
    fn resolve(&self, name: Option<&str>) -> Option<String> {
        name.map(str::to_string).or_else(|| self.default_tunnel.clone())
    }
}

/// Process-wide table of named tunnel sessions
pub struct TunnelRegistry<T: Transport> {
    transport: Arc<T>,
    table: Mutex<Table<T>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl<T: Transport> TunnelRegistry<T> {
    /// Create an empty registry whose sessions connect through `transport`
    pub fn new(transport: Arc<T>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        TunnelRegistry {
            transport,
            table: Mutex::new(Table {
                tunnels: HashMap::new(),
                default_tunnel: None,
            }),
            events,
        }
    }

    /// Subscribe to events of every registered tunnel
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a tunnel and run its connect sequence
    ///
    /// Invalid configs and duplicate names fail without touching the
    /// table. A tunnel whose connect fails stays registered so that its
    /// reconnect cycle, or a later [`reconnect_tunnel`], can bring it up.
    ///
    /// [`reconnect_tunnel`]: TunnelRegistry::reconnect_tunnel
    pub async fn create_tunnel(&self, config: TunnelConfig) -> Result<TunnelInfo, TunnelError> {
        config.validate()?;
        let name = config.tunnel_name();

        let session = {
            let mut table = self.table.lock().await;
            if table.tunnels.contains_key(&name) {
                return Err(TunnelError::DuplicateName(name));
            }

            let session = TunnelSession::new(config, self.transport.clone());
            let event_relay = self.spawn_event_relay(&session);
            table.tunnels.insert(
                name.clone(),
                Entry {
                    session: session.clone(),
                    event_relay,
                },
            );
            if table.default_tunnel.is_none() {
                debug!(tunnel = %name, "Default tunnel set");
                table.default_tunnel = Some(name.clone());
            }
            session
        };

        session.connect().await
    }

    fn spawn_event_relay(&self, session: &TunnelSession<T>) -> JoinHandle<()> {
        let mut rx = session.subscribe();
        let events = self.events.clone();
        let tunnel = session.name().to_string();

        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(tunnel = %tunnel, skipped = n, "Event observer lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match &event {
                    TunnelEvent::Connected(info) => {
                        info!(tunnel = %tunnel, local = %endpoint(&info.local_host, info.local_port), "Tunnel up")
                    }
                    TunnelEvent::Disconnected(_) => warn!(tunnel = %tunnel, "Tunnel lost its connection"),
                    TunnelEvent::Error { message, .. } => {
                        error!(tunnel = %tunnel, "Tunnel error: {}", message)
                    }
                    TunnelEvent::Reconnecting { attempt, .. } => {
                        info!(tunnel = %tunnel, attempt = *attempt, "Tunnel reconnecting")
                    }
                    TunnelEvent::Reconnected(_) => info!(tunnel = %tunnel, "Tunnel back online"),
                }

                let _ = events.send(RegistryEvent {
                    tunnel: tunnel.clone(),
                    event,
                });
            }
        })
    }

    /// Session by name, or the default session when `name` is `None`
    pub async fn get_tunnel(&self, name: Option<&str>) -> Option<TunnelSession<T>> {
        let table = self.table.lock().await;
        let name = table.resolve(name)?;
        table.tunnels.get(&name).map(|e| e.session.clone())
    }

    /// Info snapshot of the named (or default) tunnel
    pub async fn get_tunnel_info(&self, name: Option<&str>) -> Option<TunnelInfo> {
        match self.get_tunnel(name).await {
            Some(session) => Some(session.info().await),
            None => None,
        }
    }

    /// Whether the named (or default) tunnel is active; `false` if absent
    pub async fn is_active(&self, name: Option<&str>) -> bool {
        match self.get_tunnel(name).await {
            Some(session) => session.is_active().await,
            None => false,
        }
    }

    /// Local endpoint of the named (or default) tunnel while it is active
    pub async fn connection_details(&self, name: Option<&str>) -> Option<(String, u16)> {
        match self.get_tunnel(name).await {
            Some(session) => session.connection_details().await,
            None => None,
        }
    }

    /// Name of the default tunnel
    pub async fn default_tunnel(&self) -> Option<String> {
        self.table.lock().await.default_tunnel.clone()
    }

    /// Number of registered tunnels
    pub async fn len(&self) -> usize {
        self.table.lock().await.tunnels.len()
    }

    /// Whether no tunnel is registered
    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.tunnels.is_empty()
    }

    /// Close and remove the named (or default) tunnel
    ///
    /// Returns `false` when there was nothing to close.
    pub async fn close_tunnel(&self, name: Option<&str>) -> bool {
        let mut table = self.table.lock().await;
        let Some(name) = table.resolve(name) else {
            return false;
        };
        let Some(entry) = table.tunnels.remove(&name) else {
            return false;
        };

        entry.session.close().await;
        entry.event_relay.abort();

        if table.default_tunnel.as_deref() == Some(name.as_str()) {
            table.default_tunnel = table.tunnels.keys().next().cloned();
            debug!(tunnel = %name, new_default = ?table.default_tunnel, "Default tunnel reassigned");
        }

        info!(tunnel = %name, "Tunnel removed");
        true
    }

    /// Close every tunnel concurrently and clear the table
    pub async fn close_all_tunnels(&self) {
        let mut table = self.table.lock().await;
        let count = table.tunnels.len();

        futures::future::join_all(table.tunnels.values().map(|e| e.session.close())).await;

        for (_, entry) in table.tunnels.drain() {
            entry.event_relay.abort();
        }
        table.default_tunnel = None;

        info!(count, "All tunnels closed");
    }

    /// Listing of active tunnels
    pub async fn get_active_tunnels(&self) -> Vec<TunnelSummary> {
        self.get_all_tunnels()
            .await
            .into_iter()
            .filter(|t| t.info.is_active)
            .collect()
    }

    /// Listing of every registered tunnel, sorted by name
    pub async fn get_all_tunnels(&self) -> Vec<TunnelSummary> {
        let sessions: Vec<(String, TunnelSession<T>)> = {
            let table = self.table.lock().await;
            table
                .tunnels
                .iter()
                .map(|(name, e)| (name.clone(), e.session.clone()))
                .collect()
        };

        let mut summaries = Vec::with_capacity(sessions.len());
        for (name, session) in sessions {
            summaries.push(TunnelSummary {
                name,
                info: session.info().await,
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Reconnect the named (or default) tunnel
    pub async fn reconnect_tunnel(&self, name: Option<&str>) -> Result<TunnelInfo, TunnelError> {
        let session = self.get_tunnel(name).await.ok_or_else(|| {
            TunnelError::NotFound(name.map(str::to_string).unwrap_or_else(|| "default".to_string()))
        })?;
        session.reconnect().await
    }
}
