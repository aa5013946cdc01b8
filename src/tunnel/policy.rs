//! Session state machine and reconnect policy
//!
//! Both are pure: the session feeds them transitions and counters and acts
//! on what they return.

use std::fmt;
use std::time::Duration;

/// Lifecycle state of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Secure transport connect in progress
    Connecting,
    /// Transport up, forwarder bound
    Active,
    /// Transport down, no retry pending
    Disconnected,
    /// Automatic reconnect cycle running
    Reconnecting,
    /// Closed for good
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Disconnected => "disconnected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Inputs that move a session between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A connect sequence starts
    Connect,
    /// Transport ready and forwarder bound
    Ready,
    /// A connect sequence failed
    Failed,
    /// The established transport dropped
    TransportClosed,
    /// A retry was scheduled
    RetryScheduled,
    /// Retries are exhausted
    GaveUp,
    /// Explicit close, or a fatal connect failure
    Closed,
}

impl SessionState {
    /// Next state, or `None` when the transition does not apply
    pub fn apply(self, transition: Transition) -> Option<SessionState> {
        use SessionState::*;

        match (self, transition) {
            (Closed, _) => None,
            (_, Transition::Closed) => Some(Closed),

            (Connecting | Disconnected | Reconnecting, Transition::Connect) => Some(Connecting),
            (Connecting | Reconnecting, Transition::Ready) => Some(Active),
            (Connecting, Transition::Failed) => Some(Disconnected),
            // A failed retry keeps the cycle going until the policy gives up
            (Reconnecting, Transition::Failed) => Some(Reconnecting),
            (Active, Transition::TransportClosed) => Some(Disconnected),
            (Disconnected | Reconnecting, Transition::RetryScheduled) => Some(Reconnecting),
            (Disconnected | Reconnecting, Transition::GaveUp) => Some(Disconnected),

            _ => None,
        }
    }

    /// Whether the state is terminal
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

/// Verdict for one reconnect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then try again
    Retry {
        /// Fixed pause before the attempt
        delay: Duration,
    },
    /// Stop retrying
    GiveUp,
}

/// Bounded, fixed-delay reconnect policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect automatically at all
    pub enabled: bool,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
    /// Delay before every attempt; never grows
    pub delay: Duration,
}

impl ReconnectPolicy {
    /// Create a policy
    pub fn new(enabled: bool, max_attempts: u32, delay: Duration) -> Self {
        ReconnectPolicy {
            enabled,
            max_attempts,
            delay,
        }
    }

    /// A policy that never retries
    pub fn disabled() -> Self {
        ReconnectPolicy::new(false, 0, Duration::ZERO)
    }

    /// Decide on `attempt`, the counter value after incrementing it
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if !self.enabled || attempt > self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry { delay: self.delay }
        }
    }
}
