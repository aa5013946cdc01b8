//! Tunnel snapshots and lifecycle events

use std::fmt;

/// Point-in-time view of a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    /// Host the forwarder listens on
    pub local_host: String,
    /// Port the forwarder listens on
    pub local_port: u16,
    /// Forward target host
    pub remote_host: String,
    /// Forward target port
    pub remote_port: u16,
    /// Whether the tunnel is currently usable
    pub is_active: bool,
    /// Tunnel name
    pub name: Option<String>,
}

impl fmt::Display for TunnelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.local_host,
            self.local_port,
            self.remote_host,
            self.remote_port,
            if self.is_active { "active" } else { "inactive" }
        )
    }
}

/// Lifecycle notifications published by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The tunnel came up for the first time (or after a manual reconnect)
    Connected(TunnelInfo),
    /// The secure transport dropped
    Disconnected(TunnelInfo),
    /// Something failed; the message carries the cause
    Error {
        /// Tunnel name
        name: Option<String>,
        /// Rendered error
        message: String,
    },
    /// An automatic reconnect attempt is scheduled
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Tunnel name
        name: Option<String>,
    },
    /// An automatic reconnect attempt succeeded
    Reconnected(TunnelInfo),
}

impl TunnelEvent {
    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelEvent::Connected(_) => "connected",
            TunnelEvent::Disconnected(_) => "disconnected",
            TunnelEvent::Error { .. } => "error",
            TunnelEvent::Reconnecting { .. } => "reconnecting",
            TunnelEvent::Reconnected(_) => "reconnected",
        }
    }
}
