use std::fmt;

use thiserror::Error;

/// Per-connection state.
///
/// `Connecting -> Authorized -> Joined -> Closing -> Closed`, or
/// `Connecting -> Closed` when the handshake is rejected. A joined
/// connection always passes through `Closing`, where it is unregistered and
/// its `Left` is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Authorized,
    Joined,
    Closing,
    Closed,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authorized => "authorized",
            Self::Joined => "joined",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Authorized)
                | (Self::Connecting, Self::Closed)
                | (Self::Authorized, Self::Joined)
                | (Self::Joined, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid connection transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Tracks one connection through its states, rejecting skipped steps.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: ConnectionState,
}

impl Lifecycle {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn advance(&mut self, next: ConnectionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition { from: self.state, to: next });
        }
        self.state = next;
        Ok(())
    }
}
