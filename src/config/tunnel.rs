//! Tunnel configuration types
//!
//! Defines the SSH endpoint, forward target and SOCKS5 gateway settings
//! of a single tunnel.

use crate::error::TunnelError;
use crate::socks::Socks5Credentials;
use crate::tunnel::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default SSH port
fn default_ssh_port() -> u16 {
    22
}

/// Default SSH connect timeout in seconds
fn default_connect_timeout() -> u64 {
    15
}

/// Default SSH keepalive interval in seconds
fn default_keepalive() -> u64 {
    30
}

/// Default reconnect attempt bound
fn default_max_reconnect_attempts() -> u32 {
    5
}

/// Default fixed delay between reconnect attempts in milliseconds
fn default_reconnect_delay_ms() -> u64 {
    5000
}

/// Default bind host for local listeners
fn default_listen_host() -> String {
    "localhost".to_string()
}

/// Offset of the static SOCKS5 port from the forward port
pub const SOCKS5_PORT_OFFSET: u16 = 1000;

/// Offset of the dynamic SOCKS5 port from the forward port
pub const DYNAMIC_SOCKS5_PORT_OFFSET: u16 = 2000;

/// Host the Local Forwarder always binds on
pub const LOCAL_FORWARD_HOST: &str = "localhost";

/// SSH endpoint and credential
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshConfig {
    /// SSH server host
    pub host: String,

    /// SSH server port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Login user
    pub username: String,

    /// Password credential
    #[serde(default)]
    pub password: Option<String>,

    /// Inline private key (OpenSSH or PEM)
    #[serde(default)]
    pub private_key: Option<String>,

    /// Path to a private key file
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Passphrase for the private key
    #[serde(default)]
    pub passphrase: Option<String>,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .field("private_key_path", &self.private_key_path)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("keepalive_secs", &self.keepalive_secs)
            .finish()
    }
}

/// The one credential an SSH login uses
#[derive(Clone, PartialEq, Eq)]
pub enum SshCredential {
    /// Password login
    Password(String),
    /// Inline private key
    PrivateKey {
        /// Key material
        key: String,
        /// Optional passphrase
        passphrase: Option<String>,
    },
    /// Private key read from disk
    PrivateKeyFile {
        /// Key file path
        path: PathBuf,
        /// Optional passphrase
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshCredential::Password(_) => write!(f, "Password(***)"),
            SshCredential::PrivateKey { .. } => write!(f, "PrivateKey(***)"),
            SshCredential::PrivateKeyFile { path, .. } => {
                write!(f, "PrivateKeyFile({})", path.display())
            }
        }
    }
}

impl SshConfig {
    /// Create an endpoint with a password credential
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        SshConfig {
            host: host.into(),
            port,
            username: username.into(),
            password: Some(password.into()),
            private_key: None,
            private_key_path: None,
            passphrase: None,
            connect_timeout_secs: default_connect_timeout(),
            keepalive_secs: default_keepalive(),
        }
    }

    /// Resolve the configured credential
    ///
    /// Exactly one of password, inline key or key file must be present.
    pub fn credential(&self) -> Result<SshCredential, TunnelError> {
        let present = [
            self.password.is_some(),
            self.private_key.is_some(),
            self.private_key_path.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();

        if present == 0 {
            return Err(TunnelError::Config("no credential".to_string()));
        }
        if present > 1 {
            return Err(TunnelError::Config(
                "exactly one of password, private_key or private_key_path must be set"
                    .to_string(),
            ));
        }

        let passphrase = self.passphrase.clone();
        if let Some(password) = &self.password {
            Ok(SshCredential::Password(password.clone()))
        } else if let Some(key) = &self.private_key {
            Ok(SshCredential::PrivateKey {
                key: key.clone(),
                passphrase,
            })
        } else if let Some(path) = &self.private_key_path {
            Ok(SshCredential::PrivateKeyFile {
                path: path.clone(),
                passphrase,
            })
        } else {
            Err(TunnelError::Config("no credential".to_string()))
        }
    }

    /// Validate the endpoint
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.host.trim().is_empty() {
            return Err(TunnelError::Config("ssh host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(TunnelError::Config("ssh port must not be 0".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(TunnelError::Config(
                "ssh username must not be empty".to_string(),
            ));
        }
        self.credential().map(|_| ())
    }
}

/// Static (authenticated) SOCKS5 gateway settings
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Socks5Config {
    /// Start the gateway
    #[serde(default)]
    pub enabled: bool,

    /// Listen port, defaults to the forward port plus 1000
    #[serde(default)]
    pub port: Option<u16>,

    /// Listen host, defaults to `localhost`
    #[serde(default)]
    pub host: Option<String>,

    /// Username clients must present
    #[serde(default)]
    pub username: Option<String>,

    /// Password clients must present
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for Socks5Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socks5Config")
            .field("enabled", &self.enabled)
            .field("port", &self.port)
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Socks5Config {
    /// Credentials gating this gateway, if both halves are configured
    pub fn credentials(&self) -> Option<Socks5Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                Some(Socks5Credentials::new(username.clone(), password.clone()))
            }
            _ => None,
        }
    }
}

/// Dynamic (open) SOCKS5 gateway settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DynamicSocks5Config {
    /// Start the gateway
    #[serde(default)]
    pub enabled: bool,

    /// Listen port, defaults to the forward port plus 2000
    #[serde(default)]
    pub port: Option<u16>,

    /// Listen host, defaults to `localhost`
    #[serde(default)]
    pub host: Option<String>,
}

/// Configuration of a single tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelConfig {
    /// SSH endpoint; inherited from the shared `[ssh]` block when absent
    #[serde(default)]
    pub ssh: Option<SshConfig>,

    /// Human-readable name, unique within a registry
    #[serde(default)]
    pub name: Option<String>,

    /// Host the forwarded stream connects to, as seen from the SSH server
    pub remote_host: String,

    /// Port the forwarded stream connects to
    pub remote_port: u16,

    /// Local port the forwarder listens on
    pub local_port: u16,

    /// Reconnect automatically after the SSH connection drops
    #[serde(default)]
    pub auto_reconnect: bool,

    /// Upper bound on consecutive reconnect attempts; 0 disables
    /// automatic retries even with `auto_reconnect` set
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Fixed delay between reconnect attempts in milliseconds; must be
    /// non-zero when `auto_reconnect` is set
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Static SOCKS5 gateway
    #[serde(default)]
    pub socks5: Option<Socks5Config>,

    /// Dynamic SOCKS5 gateway
    #[serde(default)]
    pub dynamic_socks5: Option<DynamicSocks5Config>,
}

impl TunnelConfig {
    /// Create a tunnel config with defaults for everything optional
    pub fn new(
        ssh: SshConfig,
        remote_host: impl Into<String>,
        remote_port: u16,
        local_port: u16,
    ) -> Self {
        TunnelConfig {
            ssh: Some(ssh),
            name: None,
            remote_host: remote_host.into(),
            remote_port,
            local_port,
            auto_reconnect: false,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            socks5: None,
            dynamic_socks5: None,
        }
    }

    /// Registry key: explicit name or `phantom_<remote_host>_<remote_port>`
    pub fn tunnel_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("phantom_{}_{}", self.remote_host, self.remote_port),
        }
    }

    /// The SSH endpoint; a validated config always has one
    pub fn ssh(&self) -> Result<&SshConfig, TunnelError> {
        self.ssh
            .as_ref()
            .ok_or_else(|| TunnelError::Config("no ssh endpoint configured".to_string()))
    }

    /// Reconnect policy derived from the config
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.auto_reconnect,
            self.max_reconnect_attempts,
            Duration::from_millis(self.reconnect_delay_ms),
        )
    }

    /// Static SOCKS5 gateway settings if enabled
    pub fn socks5_enabled(&self) -> Option<&Socks5Config> {
        self.socks5.as_ref().filter(|s| s.enabled)
    }

    /// Dynamic SOCKS5 gateway settings if enabled
    pub fn dynamic_socks5_enabled(&self) -> Option<&DynamicSocks5Config> {
        self.dynamic_socks5.as_ref().filter(|s| s.enabled)
    }

    /// Listen endpoint of the static SOCKS5 gateway
    pub fn socks5_endpoint(&self) -> Result<Option<(String, u16)>, TunnelError> {
        match self.socks5_enabled() {
            Some(socks) => {
                let port = resolve_port(socks.port, self.local_port, SOCKS5_PORT_OFFSET)?;
                let host = socks.host.clone().unwrap_or_else(default_listen_host);
                Ok(Some((host, port)))
            }
            None => Ok(None),
        }
    }

    /// Listen endpoint of the dynamic SOCKS5 gateway
    pub fn dynamic_socks5_endpoint(&self) -> Result<Option<(String, u16)>, TunnelError> {
        match self.dynamic_socks5_enabled() {
            Some(socks) => {
                let port = resolve_port(socks.port, self.local_port, DYNAMIC_SOCKS5_PORT_OFFSET)?;
                let host = socks.host.clone().unwrap_or_else(default_listen_host);
                Ok(Some((host, port)))
            }
            None => Ok(None),
        }
    }

    /// Validate everything that can be checked without touching the network
    pub fn validate(&self) -> Result<(), TunnelError> {
        self.ssh()?.validate()?;

        if self.remote_host.trim().is_empty() {
            return Err(TunnelError::Config(
                "remote_host must not be empty".to_string(),
            ));
        }
        if self.remote_port == 0 {
            return Err(TunnelError::Config("remote_port must not be 0".to_string()));
        }
        if self.local_port == 0 {
            return Err(TunnelError::Config("local_port must not be 0".to_string()));
        }
        if self.auto_reconnect && self.reconnect_delay_ms == 0 {
            return Err(TunnelError::Config(
                "reconnect_delay_ms must not be 0 with auto_reconnect".to_string(),
            ));
        }

        if let Some(socks) = self.socks5_enabled() {
            if socks.username.is_some() != socks.password.is_some() {
                return Err(TunnelError::Config(
                    "socks5 username and password must be set together".to_string(),
                ));
            }
        }

        self.socks5_endpoint()?;
        self.dynamic_socks5_endpoint()?;

        Ok(())
    }
}

fn resolve_port(explicit: Option<u16>, local_port: u16, offset: u16) -> Result<u16, TunnelError> {
    match explicit {
        Some(0) => Err(TunnelError::Config("socks5 port must not be 0".to_string())),
        Some(port) => Ok(port),
        None => local_port.checked_add(offset).ok_or_else(|| {
            TunnelError::Config(format!(
                "default socks5 port {} + {} overflows",
                local_port, offset
            ))
        }),
    }
}
