//! Measurement session state machine.
//!
//! Combines the connection status reported by the device channel with the
//! pending measurement into one of five phases:
//!
//! ```text
//!                 connect ok                 request_measurement()
//! Connecting ─────────────────► ConnectedIdle ───────────────────────► ConnectedAwaiting
//!     │                              ▲  │                                   │
//!     │ connect failed               │  └──────── result message ◄──────────┘
//!     ▼                              │
//! ConnectFailed            Disconnected ◄──── connection lost (from any Connected phase)
//!     │                         │
//!     └──── reconnect() ────────┴──► Connecting
//! ```
//!
//! The session is not thread safe and does not need to be: one event loop
//! owns it and feeds it channel events and user actions in order.

use std::fmt;
use tracing::{debug, info, warn};

use super::context::SessionContext;
use super::error::SessionError;
use super::reading_log::{ReadingEntry, ReadingLog};
use crate::mqtt::message_manager::{decode_result, encode_command};
use crate::mqtt::{
    ChannelEvent, CommandChannel, ConnectionEpoch, ConnectionStatus, CorrelationMode, LinkEvent,
    MQTTMessage, MqttConfig, RequestToken,
};

/// A measured value as reported by the device.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MeasurementValue {
    /// Distance in millimeters. `raw` keeps the digits as the device sent them.
    Distance { millimeters: u32, raw: String },
    /// Anything else the device sent, e.g. its out-of-range message
    Text(String),
}

impl MeasurementValue {
    pub fn parse(body: &str) -> Self {
        let body = body.trim();
        match body.parse::<u32>() {
            Ok(millimeters) => MeasurementValue::Distance {
                millimeters,
                raw: body.to_string(),
            },
            Err(_) => MeasurementValue::Text(body.to_string()),
        }
    }

    pub fn with_unit(&self) -> String {
        match self {
            MeasurementValue::Distance { raw, .. } => format!("{} mm", raw),
            MeasurementValue::Text(text) => text.clone(),
        }
    }
}

impl fmt::Display for MeasurementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementValue::Distance { raw, .. } => f.write_str(raw),
            MeasurementValue::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PendingMeasurement {
    #[default]
    NoValue,
    AwaitingResponse,
    Value(MeasurementValue),
}

impl PendingMeasurement {
    pub fn value(&self) -> Option<&MeasurementValue> {
        match self {
            PendingMeasurement::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for PendingMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingMeasurement::NoValue => f.write_str("---"),
            PendingMeasurement::AwaitingResponse => f.write_str("..."),
            PendingMeasurement::Value(value) => write!(f, "{}", value),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    ConnectedIdle,
    ConnectedAwaiting,
    ConnectFailed,
    Disconnected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Lifecycle {
    #[default]
    Active,
    /// Readings handed to the summary builder
    Finalized,
    TornDown,
}

/// Yes/no question put to the user before destructive actions.
#[cfg_attr(test, mockall::automock)]
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Read-only handoff to the summary builder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizedSession {
    pub context: SessionContext,
    /// Newest first, as stored in the log
    pub readings: Vec<ReadingEntry>,
}

impl FinalizedSession {
    pub fn oldest_first(&self) -> impl Iterator<Item = &ReadingEntry> {
        self.readings.iter().rev()
    }
}

/// Everything a front-end needs to draw the measuring screen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionView {
    pub status: ConnectionStatus,
    pub phase: SessionPhase,
    pub pending: PendingMeasurement,
    pub draft_label: String,
    pub readings: Vec<ReadingEntry>,
    pub lifecycle: Lifecycle,
}

pub struct MeasurementSession {
    context: SessionContext,
    channel: Box<dyn CommandChannel>,
    command_literal: String,
    correlation: CorrelationMode,
    status: ConnectionStatus,
    epoch: Option<ConnectionEpoch>,
    pending: PendingMeasurement,
    outstanding: Option<RequestToken>,
    draft_label: String,
    log: ReadingLog,
    lifecycle: Lifecycle,
}

impl MeasurementSession {
    pub fn new(
        context: SessionContext,
        channel: Box<dyn CommandChannel>,
        config: &MqttConfig,
    ) -> Self {
        Self {
            context,
            channel,
            command_literal: config.command_literal.clone(),
            correlation: config.correlation,
            status: ConnectionStatus::Connecting,
            epoch: None,
            pending: PendingMeasurement::NoValue,
            outstanding: None,
            draft_label: String::new(),
            log: ReadingLog::new(),
            lifecycle: Lifecycle::Active,
        }
    }

    /// Opens the device connection. The session starts out `Connecting`.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.ensure_active()?;
        info!(
            "Starting measurement session for {} ({})",
            self.context.client_name(),
            self.context.visit_date()
        );
        self.begin_connect()
    }

    /// Starts a fresh connect cycle after a failure or a dropped link.
    pub fn reconnect(&mut self) -> Result<(), SessionError> {
        self.ensure_active()?;
        match self.status {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                Err(SessionError::AlreadyConnecting(self.status))
            }
            ConnectionStatus::Disconnected | ConnectionStatus::ConnectFailed => {
                info!("Reconnecting after: {}", self.status);
                self.channel.disconnect();
                self.outstanding = None;
                self.begin_connect()
            }
        }
    }

    fn begin_connect(&mut self) -> Result<(), SessionError> {
        self.status = ConnectionStatus::Connecting;
        match self.channel.connect() {
            Ok(epoch) => {
                self.epoch = Some(epoch);
                Ok(())
            }
            Err(e) => {
                warn!("Could not start connection: {}", e);
                self.epoch = None;
                self.status = ConnectionStatus::ConnectFailed;
                Err(e.into())
            }
        }
    }

    /// Applies a channel event. Returns whether it changed anything.
    ///
    /// Events are dropped once the session is finalized or torn down, and
    /// when they belong to a connection other than the current one.
    pub fn handle_event(&mut self, event: ChannelEvent) -> bool {
        if self.lifecycle != Lifecycle::Active {
            debug!("Session {:?}, discarding {:?}", self.lifecycle, event.kind);
            return false;
        }
        if self.epoch != Some(event.epoch) {
            debug!(
                "Discarding event from stale connection {}: {:?}",
                event.epoch, event.kind
            );
            return false;
        }

        match event.kind {
            LinkEvent::Connected => {
                info!("Device channel connected");
                self.status = ConnectionStatus::Connected;
                true
            }
            LinkEvent::ConnectFailed(reason) => {
                warn!("Device channel failed to connect: {}", reason);
                self.status = ConnectionStatus::ConnectFailed;
                true
            }
            LinkEvent::ConnectionLost(reason) => {
                warn!("Device channel lost: {}", reason);
                self.status = ConnectionStatus::Disconnected;
                true
            }
            LinkEvent::Message(message) => self.accept_result(&message),
        }
    }

    fn accept_result(&mut self, message: &MQTTMessage) -> bool {
        let Some(payload) = decode_result(message.content(), self.correlation) else {
            debug!("Dropping result without request token: {}", message);
            return false;
        };

        match self.correlation {
            CorrelationMode::Tokened => {
                if payload.token.is_none() || payload.token != self.outstanding {
                    debug!(
                        "Dropping result for {:?}, outstanding {:?}",
                        payload.token, self.outstanding
                    );
                    return false;
                }
                self.outstanding = None;
            }
            CorrelationMode::Untokened => {
                if self.pending != PendingMeasurement::AwaitingResponse {
                    info!("Accepting unsolicited result: {}", payload.body);
                }
            }
        }

        let value = MeasurementValue::parse(payload.body);
        info!("Reading received: {}", value.with_unit());
        self.pending = PendingMeasurement::Value(value);
        true
    }

    /// Sends the measure command. A repeated request replaces the previous one.
    pub fn request_measurement(&mut self) -> Result<(), SessionError> {
        self.ensure_active()?;
        if self.status != ConnectionStatus::Connected {
            return Err(SessionError::NotConnected(self.status));
        }

        let token = match self.correlation {
            CorrelationMode::Tokened => Some(RequestToken::random()),
            CorrelationMode::Untokened => None,
        };
        self.channel
            .send(&encode_command(&self.command_literal, token))?;

        if self.pending == PendingMeasurement::AwaitingResponse {
            debug!("Previous request abandoned: {:?}", self.outstanding);
        }
        self.outstanding = token;
        self.pending = PendingMeasurement::AwaitingResponse;
        Ok(())
    }

    /// Adds the pending value under `label` at the front of the log.
    pub fn commit_reading(&mut self, label: &str) -> Result<(), SessionError> {
        self.ensure_active()?;
        let label = label.trim();
        if label.is_empty() {
            return Err(SessionError::EmptyLabel);
        }
        let value = self
            .pending
            .value()
            .cloned()
            .ok_or(SessionError::NoValue)?;

        info!("Committed '{}': {}", label, value.with_unit());
        self.log.insert_front(ReadingEntry::new(label, value));
        self.pending = PendingMeasurement::NoValue;
        self.draft_label.clear();
        Ok(())
    }

    pub fn commit_draft(&mut self) -> Result<(), SessionError> {
        let label = self.draft_label.clone();
        self.commit_reading(&label)
    }

    pub fn set_draft_label(&mut self, label: &str) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.draft_label = label.to_string();
        Ok(())
    }

    /// Throws away the pending value without committing it.
    pub fn discard_pending(&mut self) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.pending = PendingMeasurement::NoValue;
        self.outstanding = None;
        Ok(())
    }

    /// Moves entry `index` back into the draft for correction.
    ///
    /// Refused while a reading is outstanding: its reply would replace the
    /// restored value.
    pub fn edit_reading(&mut self, index: usize) -> Result<ReadingEntry, SessionError> {
        self.ensure_active()?;
        if self.pending == PendingMeasurement::AwaitingResponse {
            return Err(SessionError::MeasurementInFlight);
        }
        let entry = self.log.edit_at(index)?;
        debug!("Editing '{}'", entry.label);
        self.draft_label = entry.label.clone();
        self.pending = PendingMeasurement::Value(entry.value.clone());
        self.outstanding = None;
        Ok(entry)
    }

    pub fn delete_reading(
        &mut self,
        index: usize,
        confirm: &dyn Confirm,
    ) -> Result<ReadingEntry, SessionError> {
        self.ensure_active()?;
        let prompt = match self.log.get(index) {
            Some(entry) => format!("Remove '{}'?", entry),
            None => {
                return Err(SessionError::IndexOutOfRange {
                    index,
                    len: self.log.len(),
                })
            }
        };
        if !confirm.confirm(&prompt) {
            return Err(SessionError::Declined);
        }
        let entry = self.log.remove_at(index)?;
        info!("Removed '{}'", entry.label);
        Ok(entry)
    }

    /// Hands the readings off and releases the device channel.
    pub fn finalize(&mut self) -> Result<FinalizedSession, SessionError> {
        self.ensure_active()?;
        if self.log.is_empty() {
            return Err(SessionError::EmptyLog);
        }
        self.channel.disconnect();
        self.status = ConnectionStatus::Disconnected;
        self.lifecycle = Lifecycle::Finalized;
        info!("Session finalized with {} readings", self.log.len());
        Ok(FinalizedSession {
            context: self.context.clone(),
            readings: self.log.snapshot(),
        })
    }

    /// Tears the session down. Releases the channel in every state.
    pub fn close(&mut self) {
        if self.lifecycle == Lifecycle::Active {
            self.lifecycle = Lifecycle::TornDown;
            info!("Measurement session closed");
        }
        self.channel.disconnect();
        self.status = ConnectionStatus::Disconnected;
        self.outstanding = None;
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        match self.lifecycle {
            Lifecycle::Active => Ok(()),
            _ => Err(SessionError::Closed),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match (self.status, &self.pending) {
            (ConnectionStatus::Connected, PendingMeasurement::AwaitingResponse) => {
                SessionPhase::ConnectedAwaiting
            }
            (ConnectionStatus::Connected, _) => SessionPhase::ConnectedIdle,
            (ConnectionStatus::Connecting, _) => SessionPhase::Connecting,
            (ConnectionStatus::ConnectFailed, _) => SessionPhase::ConnectFailed,
            (ConnectionStatus::Disconnected, _) => SessionPhase::Disconnected,
        }
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            status: self.status,
            phase: self.phase(),
            pending: self.pending.clone(),
            draft_label: self.draft_label.clone(),
            readings: self.log.snapshot(),
            lifecycle: self.lifecycle,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn pending(&self) -> &PendingMeasurement {
        &self.pending
    }

    pub fn draft_label(&self) -> &str {
        &self.draft_label
    }

    pub fn log(&self) -> &ReadingLog {
        &self.log
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }
}
