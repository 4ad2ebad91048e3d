//! # Measurement Session
//!
//! The part of the logger with real state: connection status, the value
//! currently shown to the user and the list of committed readings.
//!
//! ## Key Abstractions
//! - **[`MeasurementSession`]**: synchronous state machine. Channel events and
//!   user actions go in, a [`SessionView`] comes out.
//! - **[`ReadingLog`]**: newest-first list of labeled readings.
//! - **[`SessionContext`]**: client, address and visit date captured once by
//!   the entry form.
//! - **[`SessionHandle`]**: runs the session in its own task so that every
//!   mutation happens in one place, in arrival order.
//!
//! ## Error Handling Strategy
//! Every failure is a [`SessionError`] that aborts the action without changing
//! state. Connection problems are not errors at this level; they show up as a
//! [`ConnectionStatus`](crate::mqtt::ConnectionStatus) change.

pub mod context;
pub mod error;
pub mod measurement;
pub mod reading_log;
pub mod session_handle;

pub use context::SessionContext;
pub use error::SessionError;
pub use measurement::{
    Confirm, FinalizedSession, Lifecycle, MeasurementSession, MeasurementValue,
    PendingMeasurement, SessionPhase, SessionView,
};
pub use reading_log::{ReadingEntry, ReadingLog};
pub use session_handle::{SessionAction, SessionHandle};
