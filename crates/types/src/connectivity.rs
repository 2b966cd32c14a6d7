//! Connectivity states shared by subchannels, load balancers and channels.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle stage of a subchannel or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    /// Not connected and not trying to connect.
    Idle,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected and able to carry calls.
    Ready,
    /// The last attempt failed; a retry is pending.
    TransientFailure,
    /// Terminal. No further transitions happen.
    Shutdown,
}

impl ConnectivityState {
    /// Returns true for [`ConnectivityState::Shutdown`].
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Shutdown
    }

    /// Returns whether a subchannel may move from `self` to `next`.
    ///
    /// Shutdown is reachable from every state. Every other edge follows the
    /// connection lifecycle: idle to connecting, connecting to ready or
    /// failure, failure back to connecting after backoff, and ready to idle
    /// or failure when the transport goes away.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectivityState::*;

        match (self, next) {
            (Shutdown, _) => false,
            (_, Shutdown) => true,
            (Idle, Connecting)
            | (Connecting, Ready)
            | (Connecting, TransientFailure)
            | (TransientFailure, Connecting)
            | (Ready, Idle)
            | (Ready, TransientFailure) => true,
            _ => false,
        }
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Ready => "READY",
            Self::TransientFailure => "TRANSIENT_FAILURE",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
