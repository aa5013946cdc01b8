//! Error types for Phantom Portal
//!
//! This module defines the error taxonomy shared by the tunnel sessions,
//! the registry and the SOCKS5 gateways.

use std::io;
use thiserror::Error;

/// Main error type for tunnel operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Invalid or incomplete tunnel configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tunnel with the same name is already registered
    #[error("Tunnel '{0}' already exists")]
    DuplicateName(String),

    /// No tunnel registered under that name
    #[error("Tunnel '{0}' not found")]
    NotFound(String),

    /// Connect failure at the secure-transport layer
    #[error("Transport error: {0}")]
    Transport(String),

    /// The secure transport rejected our credential
    #[error("Authentication error: {0}")]
    Auth(String),

    /// A local listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind
        addr: String,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// The secure transport could not open a forwarded stream
    #[error("Forward to {target} failed: {reason}")]
    Forward {
        /// Requested target, `host:port`
        target: String,
        /// Reason reported by the transport
        reason: String,
    },

    /// SOCKS5 protocol violation on a single client connection
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// Automatic reconnection gave up
    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    /// The tunnel was closed explicitly
    #[error("Tunnel is closed")]
    Closed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Whether this error belongs to the configuration class, which is
    /// never retried automatically.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            TunnelError::Config(_) | TunnelError::DuplicateName(_)
        )
    }

    /// Whether an automatic reconnect cycle may follow this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunnelError::Transport(_) | TunnelError::Auth(_) | TunnelError::Io(_)
        )
    }
}

/// SOCKS5 specific errors
///
/// These are always scoped to the single client connection that caused them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// Buffer shorter than the message it declares
    #[error("Truncated {stage}: need {needed} bytes, got {got}")]
    Truncated {
        /// Message being parsed
        stage: &'static str,
        /// Bytes required
        needed: usize,
        /// Bytes available
        got: usize,
    },

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("Authentication failed")]
    AuthFailed,

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// Client went away before the negotiation finished
    #[error("Connection closed by client")]
    ConnectionClosed,
}

impl Socks5Error {
    /// Reply code the server sends before dropping the client, if any.
    ///
    /// Only request-level rejections get a reply frame; truncated or
    /// malformed framing is dropped silently. An unusable domain is
    /// answered like a target that cannot be reached.
    pub fn reply_code(&self) -> Option<Socks5ReplyCode> {
        match self {
            Socks5Error::CommandNotSupported(_) => Some(Socks5ReplyCode::CommandNotSupported),
            Socks5Error::AddressTypeNotSupported(_) => {
                Some(Socks5ReplyCode::AddressTypeNotSupported)
            }
            Socks5Error::InvalidDomain(_) => Some(Socks5ReplyCode::HostUnreachable),
            _ => None,
        }
    }

    /// Whether this is an authentication failure rather than malformed input
    pub fn is_auth(&self) -> bool {
        matches!(self, Socks5Error::AuthFailed | Socks5Error::NoAcceptableMethod)
    }
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for Socks5ReplyCode {
    /// The unrecognized byte
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Socks5ReplyCode::Succeeded),
            0x01 => Ok(Socks5ReplyCode::GeneralFailure),
            0x02 => Ok(Socks5ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(Socks5ReplyCode::NetworkUnreachable),
            0x04 => Ok(Socks5ReplyCode::HostUnreachable),
            0x05 => Ok(Socks5ReplyCode::ConnectionRefused),
            0x06 => Ok(Socks5ReplyCode::TtlExpired),
            0x07 => Ok(Socks5ReplyCode::CommandNotSupported),
            0x08 => Ok(Socks5ReplyCode::AddressTypeNotSupported),
            other => Err(other),
        }
    }
}
