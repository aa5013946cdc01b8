//! Tunnel sessions
//!
//! A [`TunnelSession`] pairs one secure-transport connection with the
//! local endpoints that forward through it, and keeps it alive according
//! to its [`ReconnectPolicy`].

mod info;
mod policy;
mod session;

pub use info::{TunnelEvent, TunnelInfo};
pub use policy::{ReconnectPolicy, RetryDecision, SessionState, Transition};
pub use session::TunnelSession;
