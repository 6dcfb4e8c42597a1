//! Connection lifecycle and the stop-condition check run around every write.

use crate::connection::WriterId;
use crate::error::{Error, Result};

/// WebSocket connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum ConnectionState {
    /// Connection is open and ready for data transfer.
    #[default]
    Open,
    /// A close frame has been sent or received; waiting for the other side.
    Closing,
    /// Connection is fully closed.
    Closed,
    /// A frame write stopped partway. The stream is left mid-frame, so
    /// nothing else may be written to it.
    Failed,
}

impl ConnectionState {
    /// Returns `true` unless the connection is closed or failed.
    #[must_use]
    #[inline]
    pub const fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// Data frames may only be sent while open.
    #[must_use]
    #[inline]
    pub const fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Returns `true` for `Open` or `Closing` states.
    #[must_use]
    #[inline]
    pub const fn can_receive(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Closing)
    }

    /// Decide whether `writer` must abort instead of touching the transport.
    ///
    /// A closed or failed connection stops every writer. While closing, control
    /// traffic (close, pings, read-side replies) still goes out but user
    /// data does not.
    ///
    /// # Errors
    ///
    /// - `Error::Aborted` once closed or failed
    /// - `Error::ConnectionClosed(None)` for user writes while closing
    pub fn check_stop(&self, writer: WriterId) -> Result<()> {
        match (self, writer) {
            (ConnectionState::Closed | ConnectionState::Failed, _) => Err(Error::Aborted),
            (ConnectionState::Closing, WriterId::Write) => Err(Error::ConnectionClosed(None)),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Closing => write!(f, "Closing"),
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}
