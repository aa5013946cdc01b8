//! SOCKS5 gateway
//!
//! The protocol engine is pure and shared by both gateway variants; the
//! listener owns the sockets and the relay.
//!
//! # Protocol Flow
//!
//! 1. Method negotiation (no-auth or username/password)
//! 2. Username/password sub-negotiation when selected
//! 3. CONNECT request
//! 4. Forwarded stream opened through the tunnel, reply, relay

pub mod consts;
mod engine;
mod listener;
mod relay;
mod types;

pub use engine::{encode_connect_request, encode_reply, Socks5Engine};
pub use listener::{ListenerKind, Socks5Connection, Socks5Listener};
pub use relay::relay;
pub use types::{AuthMethod, AuthOutcome, ConnectRequest, Greeting, Phase, Socks5Credentials, TargetAddr};
