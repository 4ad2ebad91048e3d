//! Errors surfaced to the user by the measurement session.

use thiserror::Error;

use crate::mqtt::{ChannelError, ConnectionStatus};

/// Every variant is recoverable: the action is aborted and nothing changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Measure requested while the device channel is not connected
    #[error("No connection to the device ({0})")]
    NotConnected(ConnectionStatus),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Write a label for the reading")]
    EmptyLabel,

    #[error("Take a reading first")]
    NoValue,

    #[error("No reading at position {index} (log holds {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// Edit requested while a reading is still on its way
    #[error("Wait for the current reading before editing")]
    MeasurementInFlight,

    #[error("Removal cancelled")]
    Declined,

    #[error("Add readings before finishing")]
    EmptyLog,

    /// The session was finalized or torn down
    #[error("Session is closed")]
    Closed,

    #[error("Reconnect is only possible after the connection failed or dropped ({0})")]
    AlreadyConnecting(ConnectionStatus),

    #[error("Missing {0}")]
    InvalidContext(&'static str),

    /// The session worker stopped before answering
    #[error("Session worker is gone")]
    WorkerGone,
}
