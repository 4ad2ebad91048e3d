use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::SessionError;
use super::measurement::{Confirm, FinalizedSession, MeasurementSession, SessionView};
use super::reading_log::ReadingEntry;
use crate::mqtt::ChannelEvent;

// The view is published before the caller is answered, so whoever awaits the
// response reads the state the action produced.
macro_rules! handle_action {
    ($session:expr, $view_tx:expr, $result:expr, $response_tx:expr) => {{
        let result = $result;
        $view_tx.send_replace($session.view());
        if $response_tx.send(result).is_err() {
            error!("Failed to send response");
        }
    }};
}

type Responder<T> = oneshot::Sender<Result<T, SessionError>>;

/// User actions serialized into the session event loop.
pub enum SessionAction {
    RequestMeasurement {
        response_tx: Responder<()>,
    },
    SetDraftLabel {
        label: String,
        response_tx: Responder<()>,
    },
    /// `None` commits under the current draft label
    CommitReading {
        label: Option<String>,
        response_tx: Responder<()>,
    },
    DiscardPending {
        response_tx: Responder<()>,
    },
    EditReading {
        index: usize,
        response_tx: Responder<ReadingEntry>,
    },
    DeleteReading {
        index: usize,
        confirm: Box<dyn Confirm + Send>,
        response_tx: Responder<ReadingEntry>,
    },
    Reconnect {
        response_tx: Responder<()>,
    },
    Finalize {
        response_tx: Responder<FinalizedSession>,
    },
}

/// Owns a [`MeasurementSession`] inside one tokio task.
///
/// The task is the only place the session is touched. It interleaves channel
/// events and user actions strictly one at a time and publishes a fresh
/// [`SessionView`] after each of them. Dropping the handle or calling
/// [`SessionHandle::shutdown`] closes the session, which releases the device
/// connection whatever state it is in.
pub struct SessionHandle {
    tx: mpsc::Sender<SessionAction>,
    view: watch::Receiver<SessionView>,
    shutdown: CancellationToken,
    worker_handle: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn spawn(session: MeasurementSession, events: mpsc::Receiver<ChannelEvent>) -> Self {
        let (view_tx, view_rx) = watch::channel(session.view());
        let (tx, rx) = mpsc::channel::<SessionAction>(32);
        let shutdown = CancellationToken::new();

        let worker_handle = tokio::spawn(run_session(
            session,
            events,
            rx,
            view_tx,
            shutdown.clone(),
        ));

        Self {
            tx,
            view: view_rx,
            shutdown,
            worker_handle: Some(worker_handle),
        }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Responder<T>) -> SessionAction,
    ) -> Result<T, SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| SessionError::WorkerGone)?;
        response_rx.await.map_err(|_| SessionError::WorkerGone)?
    }

    pub async fn request_measurement(&self) -> Result<(), SessionError> {
        self.call(|response_tx| SessionAction::RequestMeasurement { response_tx })
            .await
    }

    pub async fn set_draft_label(&self, label: impl Into<String>) -> Result<(), SessionError> {
        let label = label.into();
        self.call(|response_tx| SessionAction::SetDraftLabel { label, response_tx })
            .await
    }

    pub async fn commit_reading(&self, label: Option<String>) -> Result<(), SessionError> {
        self.call(|response_tx| SessionAction::CommitReading { label, response_tx })
            .await
    }

    pub async fn discard_pending(&self) -> Result<(), SessionError> {
        self.call(|response_tx| SessionAction::DiscardPending { response_tx })
            .await
    }

    pub async fn edit_reading(&self, index: usize) -> Result<ReadingEntry, SessionError> {
        self.call(|response_tx| SessionAction::EditReading { index, response_tx })
            .await
    }

    pub async fn delete_reading(
        &self,
        index: usize,
        confirm: Box<dyn Confirm + Send>,
    ) -> Result<ReadingEntry, SessionError> {
        self.call(|response_tx| SessionAction::DeleteReading {
            index,
            confirm,
            response_tx,
        })
        .await
    }

    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.call(|response_tx| SessionAction::Reconnect { response_tx })
            .await
    }

    pub async fn finalize(&self) -> Result<FinalizedSession, SessionError> {
        self.call(|response_tx| SessionAction::Finalize { response_tx })
            .await
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Closes the session and waits for the worker to stop.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        let Some(handle) = self.worker_handle.take() else {
            return;
        };
        match tokio::time::timeout(Duration::from_secs(2), handle).await {
            Ok(Ok(())) => debug!("Session worker stopped"),
            Ok(Err(e)) => error!("Session worker panicked: {}", e),
            Err(_) => warn!("Session worker did not stop in time"),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_session(
    mut session: MeasurementSession,
    mut events: mpsc::Receiver<ChannelEvent>,
    mut rx: mpsc::Receiver<SessionAction>,
    view_tx: watch::Sender<SessionView>,
    shutdown: CancellationToken,
) {
    if let Err(e) = session.start() {
        warn!("Session started without a connection: {}", e);
    }
    view_tx.send_replace(session.view());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Session shutdown requested");
                break;
            }
            Some(event) = events.recv() => {
                if session.handle_event(event) {
                    view_tx.send_replace(session.view());
                }
            }
            action = rx.recv() => match action {
                Some(action) => dispatch(&mut session, &view_tx, action),
                None => {
                    debug!("All session handles dropped");
                    break;
                }
            },
        }
    }

    session.close();
    view_tx.send_replace(session.view());
    info!("Session worker finished");
}

fn dispatch(
    session: &mut MeasurementSession,
    view_tx: &watch::Sender<SessionView>,
    action: SessionAction,
) {
    match action {
        SessionAction::RequestMeasurement { response_tx } => {
            handle_action!(session, view_tx, session.request_measurement(), response_tx);
        }
        SessionAction::SetDraftLabel { label, response_tx } => {
            handle_action!(session, view_tx, session.set_draft_label(&label), response_tx);
        }
        SessionAction::CommitReading { label, response_tx } => {
            let result = match label {
                Some(label) => session.commit_reading(&label),
                None => session.commit_draft(),
            };
            handle_action!(session, view_tx, result, response_tx);
        }
        SessionAction::DiscardPending { response_tx } => {
            handle_action!(session, view_tx, session.discard_pending(), response_tx);
        }
        SessionAction::EditReading { index, response_tx } => {
            handle_action!(session, view_tx, session.edit_reading(index), response_tx);
        }
        SessionAction::DeleteReading {
            index,
            confirm,
            response_tx,
        } => {
            handle_action!(
                session,
                view_tx,
                session.delete_reading(index, confirm.as_ref()),
                response_tx
            );
        }
        SessionAction::Reconnect { response_tx } => {
            handle_action!(session, view_tx, session.reconnect(), response_tx);
        }
        SessionAction::Finalize { response_tx } => {
            handle_action!(session, view_tx, session.finalize(), response_tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{
        ChannelError, CommandChannel, ConnectionEpoch, ConnectionStatus, LinkEvent, MQTTMessage,
        MqttConfig,
    };
    use crate::session::context::SessionContext;
    use crate::session::measurement::{Lifecycle, MeasurementValue, PendingMeasurement};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Shared {
        sent: Vec<String>,
        disconnects: usize,
    }

    struct FakeChannel {
        shared: Arc<Mutex<Shared>>,
    }

    impl CommandChannel for FakeChannel {
        fn connect(&mut self) -> Result<ConnectionEpoch, ChannelError> {
            Ok(ConnectionEpoch::default().next())
        }

        fn send(&mut self, payload: &str) -> Result<(), ChannelError> {
            self.shared.lock().unwrap().sent.push(payload.to_string());
            Ok(())
        }

        fn disconnect(&mut self) {
            self.shared.lock().unwrap().disconnects += 1;
        }

        fn status(&self) -> ConnectionStatus {
            ConnectionStatus::Connected
        }
    }

    struct Accept;

    impl Confirm for Accept {
        fn confirm(&self, _prompt: &str) -> bool {
            true
        }
    }

    fn spawn() -> (SessionHandle, mpsc::Sender<ChannelEvent>, Arc<Mutex<Shared>>) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (events_tx, events_rx) = mpsc::channel(16);
        let context = SessionContext::from_form("Ana", "Rua A", Some("16/10/2026")).unwrap();
        let session = MeasurementSession::new(
            context,
            Box::new(FakeChannel {
                shared: shared.clone(),
            }),
            &MqttConfig::default(),
        );
        (SessionHandle::spawn(session, events_rx), events_tx, shared)
    }

    async fn deliver(events: &mpsc::Sender<ChannelEvent>, kind: LinkEvent) {
        events
            .send(ChannelEvent {
                epoch: ConnectionEpoch::default().next(),
                kind,
            })
            .await
            .unwrap();
    }

    fn reading(payload: &str) -> LinkEvent {
        LinkEvent::Message(MQTTMessage::from_topic(
            "projeto_trena/resultado".into(),
            payload.into(),
        ))
    }

    #[tokio::test]
    async fn request_commit_roundtrip() {
        let (handle, events, shared) = spawn();
        let mut view = handle.watch_view();

        deliver(&events, LinkEvent::Connected).await;
        view.wait_for(|v| v.status == ConnectionStatus::Connected)
            .await
            .unwrap();

        handle.request_measurement().await.unwrap();
        assert_eq!(handle.view().pending, PendingMeasurement::AwaitingResponse);
        assert_eq!(shared.lock().unwrap().sent, vec!["MEDIR".to_string()]);

        deliver(&events, reading("2500")).await;
        view.wait_for(|v| v.pending.value().is_some()).await.unwrap();

        handle.set_draft_label("Wall A").await.unwrap();
        handle.commit_reading(None).await.unwrap();
        let current = handle.view();
        assert_eq!(current.readings.len(), 1);
        assert_eq!(current.readings[0].value, MeasurementValue::parse("2500"));
        assert_eq!(current.pending, PendingMeasurement::NoValue);

        let removed = handle.delete_reading(0, Box::new(Accept)).await.unwrap();
        assert_eq!(removed.label, "Wall A");
        assert_eq!(handle.finalize().await, Err(SessionError::EmptyLog));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn answered_actions_are_already_visible() {
        let (handle, events, _shared) = spawn();
        deliver(&events, LinkEvent::Connected).await;
        let mut view = handle.watch_view();
        view.wait_for(|v| v.status == ConnectionStatus::Connected)
            .await
            .unwrap();

        for round in 0..500 {
            handle.request_measurement().await.unwrap();
            assert_eq!(
                handle.view().pending,
                PendingMeasurement::AwaitingResponse,
                "round {round}"
            );
            handle.discard_pending().await.unwrap();
            assert_eq!(handle.view().pending, PendingMeasurement::NoValue, "round {round}");
        }
    }

    #[tokio::test]
    async fn request_before_connect_is_rejected() {
        let (handle, _events, shared) = spawn();
        assert_eq!(
            handle.request_measurement().await,
            Err(SessionError::NotConnected(ConnectionStatus::Connecting))
        );
        assert!(shared.lock().unwrap().sent.is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_connection() {
        let (handle, events, shared) = spawn();
        deliver(&events, LinkEvent::Connected).await;
        let mut view = handle.watch_view();
        view.wait_for(|v| v.status == ConnectionStatus::Connected)
            .await
            .unwrap();
        handle.request_measurement().await.unwrap();

        handle.shutdown().await;
        assert!(shared.lock().unwrap().disconnects >= 1);
        assert_eq!(view.borrow().lifecycle, Lifecycle::TornDown);
        // late reply after teardown goes nowhere
        let _ = events
            .send(ChannelEvent {
                epoch: ConnectionEpoch::default().next(),
                kind: reading("2500"),
            })
            .await;
        assert_eq!(view.borrow().pending, PendingMeasurement::AwaitingResponse);
    }

    #[tokio::test]
    async fn finalize_closes_session() {
        let (handle, events, shared) = spawn();
        deliver(&events, LinkEvent::Connected).await;
        deliver(&events, reading("1800")).await;
        let mut view = handle.watch_view();
        view.wait_for(|v| v.pending.value().is_some()).await.unwrap();
        handle
            .commit_reading(Some("Wall B".to_string()))
            .await
            .unwrap();

        let finalized = handle.finalize().await.unwrap();
        assert_eq!(finalized.readings.len(), 1);
        assert_eq!(shared.lock().unwrap().disconnects, 1);
        assert_eq!(handle.reconnect().await, Err(SessionError::Closed));
        assert_eq!(handle.view().lifecycle, Lifecycle::Finalized);
    }
}
