//! SOCKS5 type definitions
//!
//! Values produced by the protocol engine for each negotiation step.

use super::consts::*;
use std::fmt;
use std::net::Ipv4Addr;

/// Negotiation phase of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the method greeting
    AwaitingHandshake,
    /// Waiting for the username/password sub-negotiation
    AwaitingAuth,
    /// Waiting for the CONNECT request
    AwaitingRequest,
    /// Bytes are being piped to the target
    Relaying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::AwaitingHandshake => write!(f, "handshake"),
            Phase::AwaitingAuth => write!(f, "auth"),
            Phase::AwaitingRequest => write!(f, "request"),
            Phase::Relaying => write!(f, "relaying"),
        }
    }
}

/// Authentication method chosen during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication
    NoAuth,
    /// Username/password sub-negotiation follows
    UserPass,
    /// None of the offered methods is acceptable
    NoAcceptable,
}

impl AuthMethod {
    /// Wire value of the method
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::NoAuth => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::UserPass => SOCKS5_AUTH_METHOD_PASSWORD,
            AuthMethod::NoAcceptable => SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
        }
    }
}

/// Username/password pair a listener gates clients with
#[derive(Clone, PartialEq, Eq)]
pub struct Socks5Credentials {
    /// Expected username
    pub username: String,
    /// Expected password
    pub password: String,
}

impl Socks5Credentials {
    /// Create a credential pair
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Socks5Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Exact byte comparison against what the client sent
    pub fn matches(&self, username: &[u8], password: &[u8]) -> bool {
        self.username.as_bytes() == username && self.password.as_bytes() == password
    }
}

impl fmt::Debug for Socks5Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Destination requested by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IPv4 address with port
    Ipv4(Ipv4Addr, u16),
    /// Domain name with port
    Domain(String, u16),
    /// Raw IPv6 address with port
    ///
    /// The host renders as 32 lowercase hex digits rather than colon
    /// notation.
    Ipv6([u8; 16], u16),
}

impl TargetAddr {
    /// Host string handed to the secure transport
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip, _) => ip.to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
            TargetAddr::Ipv6(bytes, _) => bytes.iter().map(|b| format!("{:02x}", b)).collect(),
        }
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ipv4(_, port) | TargetAddr::Domain(_, port) | TargetAddr::Ipv6(_, port) => {
                *port
            }
        }
    }

    /// Get the address type byte for SOCKS5 protocol
    pub fn addr_type(&self) -> u8 {
        match self {
            TargetAddr::Ipv4(..) => SOCKS5_ADDR_TYPE_IPV4,
            TargetAddr::Domain(..) => SOCKS5_ADDR_TYPE_DOMAIN,
            TargetAddr::Ipv6(..) => SOCKS5_ADDR_TYPE_IPV6,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port())
    }
}

/// Result of the handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Greeting {
    /// Selected method
    pub method: AuthMethod,
    /// Bytes of the input buffer the greeting occupied
    pub consumed: usize,
}

impl Greeting {
    /// Method selection reply
    pub fn reply(&self) -> [u8; 2] {
        [SOCKS5_VERSION, self.method.to_byte()]
    }
}

/// Result of the username/password step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Whether the credentials matched
    pub accepted: bool,
    /// Username the client presented, lossily decoded for logging
    pub username: String,
    /// Bytes of the input buffer the sub-negotiation occupied
    pub consumed: usize,
}

impl AuthOutcome {
    /// Sub-negotiation status reply
    pub fn reply(&self) -> [u8; 2] {
        let status = if self.accepted {
            SOCKS5_AUTH_SUCCESS
        } else {
            SOCKS5_AUTH_FAILURE
        };
        [SOCKS5_AUTH_VERSION, status]
    }
}

/// Result of the request step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Decoded target
    pub target: TargetAddr,
    /// Bytes of the input buffer the request occupied
    pub consumed: usize,
}
