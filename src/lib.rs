//! # Phantom Portal - SSH Tunnel Manager
//!
//! Phantom Portal keeps a set of named SSH tunnels alive. Every tunnel
//! exposes a local port that forwards to a fixed remote `host:port` through
//! the SSH connection, and can additionally expose two SOCKS5 gateways
//! riding the same connection.
//!
//! ## Features
//!
//! - **Local Port Forwarding**: `ssh -L` style, one fixed target per tunnel
//! - **Static SOCKS5 Gateway**: client-chosen targets, optional username/password
//! - **Dynamic SOCKS5 Gateway**: `ssh -D` style, no authentication
//! - **Auto-Reconnect**: bounded attempts with a fixed delay
//! - **Registry**: named sessions, default tunnel, bulk shutdown
//!
//! ## Usage
//!
//! ```rust,ignore
//! use phantom_portal::config::{SshConfig, TunnelConfig};
//! use phantom_portal::registry::TunnelRegistry;
//! use phantom_portal::transport::SshTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = TunnelRegistry::new(Arc::new(SshTransport::new()));
//!     let ssh = SshConfig::with_password("bastion.example.com", 22, "deploy", "secret");
//!     let info = registry
//!         .create_tunnel(TunnelConfig::new(ssh, "db.internal", 5432, 15432))
//!         .await?;
//!     println!("{}", info);
//!
//!     tokio::signal::ctrl_c().await?;
//!     registry.close_all_tunnels().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! client -> LocalForwarder / Socks5Listener -> SSH direct-tcpip -> target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod acceptor;
pub mod config;
pub mod error;
pub mod forward;
pub mod helper;
pub mod registry;
pub mod socks;
pub mod transport;
pub mod tunnel;

// Re-export commonly used items
pub use config::{load_config, Config, TunnelConfig};
pub use error::{Socks5Error, TunnelError};
pub use registry::TunnelRegistry;
pub use tunnel::{TunnelEvent, TunnelInfo, TunnelSession};

/// Version of the Phantom Portal library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "phantom-portal");
    }
}
