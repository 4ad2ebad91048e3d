//! Broker connection lifecycle for the measuring device channel.
//!
//! [`MqttChannel`] owns one rumqttc connection at a time. Every call to
//! [`CommandChannel::connect`] opens a fresh connection under a new
//! [`ConnectionEpoch`] and spawns a [`LinkWorker`] that drives the rumqttc
//! event loop and reports what happens as [`ChannelEvent`]s.
//!
//! # Worker State Machine
//!
//! ```text
//! Connecting ──(CONNACK ok, subscribed)──► Connected ──(error / broker DISCONNECT)──► Closed
//!     │                                        │
//!     └──────(refused / transport error)───────┴──────(shutdown token)─────────────► Closed
//! ```
//!
//! A closed worker never polls rumqttc again, so nothing reconnects on its
//! own. Leaving `Closed` always means a new `connect()` and a new epoch.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use statum::{machine, state};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::MQTTMessage;

/// Liveness of the broker connection.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    ConnectFailed,
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected to device broker",
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::ConnectFailed => "Connection failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Generation counter distinguishing successive connections.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionEpoch(u64);

impl ConnectionEpoch {
    pub fn next(self) -> Self {
        ConnectionEpoch(self.0 + 1)
    }
}

impl fmt::Display for ConnectionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    ConnectFailed(String),
    ConnectionLost(String),
    Message(MQTTMessage),
}

/// Something that happened on the connection opened under `epoch`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelEvent {
    pub epoch: ConnectionEpoch,
    pub kind: LinkEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("No MQTT connection ({0})")]
    NotConnected(ConnectionStatus),

    #[error("Failed to publish command: {0}")]
    Publish(String),

    #[error("Failed to subscribe: {0}")]
    Subscribe(String),

    #[error("Invalid broker address: {0}")]
    InvalidBroker(String),
}

/// Outbound side of the device channel as seen by the measurement session.
///
/// Inbound traffic does not go through this trait; it arrives as
/// [`ChannelEvent`]s on the receiver handed out next to the channel.
#[cfg_attr(test, mockall::automock)]
pub trait CommandChannel: Send {
    /// Drops any current connection and starts a new one.
    fn connect(&mut self) -> Result<ConnectionEpoch, ChannelError>;

    /// Publishes `payload` on the command topic. Fails unless connected.
    fn send(&mut self, payload: &str) -> Result<(), ChannelError>;

    /// Releases the connection. Safe to call in any state, any number of times.
    fn disconnect(&mut self);

    fn status(&self) -> ConnectionStatus;
}

/// Per-connection client id, e.g. `trena-4f1c09a2`.
pub fn client_identity(prefix: &str) -> String {
    format!("{}-{:08x}", prefix, rand::random::<u32>())
}

/// Status tagged with the connection it describes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStatus {
    epoch: ConnectionEpoch,
    status: ConnectionStatus,
}

struct LinkHandle {
    client: AsyncClient,
    client_id: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// rumqttc-backed [`CommandChannel`].
pub struct MqttChannel {
    config: Arc<MqttConfig>,
    events: mpsc::Sender<ChannelEvent>,
    status: Arc<watch::Sender<LinkStatus>>,
    epoch: ConnectionEpoch,
    link: Option<LinkHandle>,
}

impl MqttChannel {
    pub fn new(config: MqttConfig, events: mpsc::Sender<ChannelEvent>) -> Self {
        let (status, _) = watch::channel(LinkStatus::default());
        Self {
            config: Arc::new(config),
            events,
            status: Arc::new(status),
            epoch: ConnectionEpoch::default(),
            link: None,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.link.as_ref().map(|link| link.client_id.as_str())
    }

    fn options(&self, client_id: &str) -> Result<MqttOptions, ChannelError> {
        let (host, port) = self.config.server.address()?;
        let mut options = MqttOptions::new(client_id, host, port);
        options
            .set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(1)))
            .set_clean_session(true);
        if let Some(user) = &self.config.server.user {
            options.set_credentials(user.clone(), self.config.server.pw.clone().unwrap_or_default());
        }
        Ok(options)
    }

    fn release(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        info!("Releasing broker connection {} ({})", self.epoch, link.client_id);
        if let Err(e) = link.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        link.shutdown.cancel();
        if link.task.is_finished() {
            debug!("Connection worker {} had already stopped", self.epoch);
        }
        self.status.send_replace(LinkStatus {
            epoch: self.epoch,
            status: ConnectionStatus::Disconnected,
        });
    }
}

impl CommandChannel for MqttChannel {
    fn connect(&mut self) -> Result<ConnectionEpoch, ChannelError> {
        self.release();

        let client_id = client_identity(&self.config.client_id_prefix);
        let options = self.options(&client_id)?;
        let (client, event_loop) = AsyncClient::new(options, self.config.event_capacity.max(1));

        self.epoch = self.epoch.next();
        self.status.send_replace(LinkStatus {
            epoch: self.epoch,
            status: ConnectionStatus::Connecting,
        });
        info!(
            "Connecting to {} as {} (epoch {})",
            self.config.server, client_id, self.epoch
        );

        let shutdown = CancellationToken::new();
        let worker = LinkWorker::<Connecting>::new(
            client.clone(),
            event_loop,
            self.config.result_topic.clone(),
            self.epoch,
            self.events.clone(),
            self.status.clone(),
            shutdown.clone(),
        );
        let task = spawn_worker(worker);

        self.link = Some(LinkHandle {
            client,
            client_id,
            shutdown,
            task,
        });
        Ok(self.epoch)
    }

    fn send(&mut self, payload: &str) -> Result<(), ChannelError> {
        let status = self.status();
        let link = match &self.link {
            Some(link) if status == ConnectionStatus::Connected => link,
            _ => return Err(ChannelError::NotConnected(status)),
        };
        link.client
            .try_publish(
                self.config.command_topic.clone(),
                QoS::AtMostOnce,
                false,
                payload.as_bytes().to_vec(),
            )
            .map_err(|e| ChannelError::Publish(e.to_string()))?;
        debug!("Published '{}' to {}", payload, self.config.command_topic);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.release();
    }

    fn status(&self) -> ConnectionStatus {
        self.status.borrow().status
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        self.release();
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Connecting, // waiting for CONNACK
    Connected,  // subscribed, forwarding results
    Closed,     // event loop abandoned
}

/// Drives one rumqttc event loop from CONNECT to teardown.
#[machine]
pub struct LinkWorker<S: LinkState> {
    client: AsyncClient,
    event_loop: EventLoop,
    result_topic: String,
    epoch: ConnectionEpoch,
    events: mpsc::Sender<ChannelEvent>,
    status: Arc<watch::Sender<LinkStatus>>,
    shutdown: CancellationToken,
}

impl<S: LinkState + 'static> LinkWorker<S> {
    // Owns everything it needs so the worker is not borrowed across the send.
    fn emit(&self, kind: LinkEvent) -> impl Future<Output = ()> + Send + 'static {
        let events = self.events.clone();
        let epoch = self.epoch;
        async move {
            if events.send(ChannelEvent { epoch, kind }).await.is_err() {
                debug!("No session listening for events of epoch {}", epoch);
            }
        }
    }

    // A released worker must not overwrite the status of its successor. The
    // check and the write happen under the watch lock.
    fn set_status(&self, status: ConnectionStatus) -> bool {
        self.status.send_if_modified(|current| {
            if self.shutdown.is_cancelled() || current.epoch != self.epoch {
                return false;
            }
            current.status = status;
            true
        })
    }

    async fn next_event(&mut self) -> Option<Result<Event, rumqttc::ConnectionError>> {
        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.cancelled() => None,
            polled = self.event_loop.poll() => Some(polled),
        }
    }
}

impl LinkWorker<Connecting> {
    /// Polls until the broker answers the CONNECT.
    ///
    /// On success the result topic subscription is queued before the
    /// `Connected` event goes out, so the session never sees Connected without
    /// a pending subscription.
    pub async fn await_connack(mut self) -> Result<LinkWorker<Connected>, LinkWorker<Closed>> {
        loop {
            let Some(polled) = self.next_event().await else {
                debug!("Connect attempt {} abandoned", self.epoch);
                return Err(self.transition());
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        self.fail(format!("broker refused connection: {:?}", ack.code))
                            .await;
                        return Err(self.transition());
                    }
                    if let Err(e) = self
                        .client
                        .subscribe(self.result_topic.clone(), QoS::AtMostOnce)
                        .await
                    {
                        self.fail(ChannelError::Subscribe(e.to_string()).to_string())
                            .await;
                        return Err(self.transition());
                    }
                    info!("Connected (epoch {}), subscribed to {}", self.epoch, self.result_topic);
                    self.set_status(ConnectionStatus::Connected);
                    self.emit(LinkEvent::Connected).await;
                    return Ok(self.transition());
                }
                Ok(other) => debug!("Ignoring {:?} while connecting", other),
                Err(e) => {
                    self.fail(e.to_string()).await;
                    return Err(self.transition());
                }
            }
        }
    }

    fn fail(&self, reason: String) -> impl Future<Output = ()> + Send + 'static {
        error!("Connection attempt {} failed: {}", self.epoch, reason);
        self.set_status(ConnectionStatus::ConnectFailed);
        self.emit(LinkEvent::ConnectFailed(reason))
    }
}

impl LinkWorker<Connected> {
    /// Forwards result messages until the link drops or is released.
    pub async fn run_until_closed(mut self) -> LinkWorker<Closed> {
        loop {
            let Some(polled) = self.next_event().await else {
                self.flush_disconnect().await;
                break;
            };

            match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic != self.result_topic {
                        debug!("Ignoring message on {}", publish.topic);
                        continue;
                    }
                    let content = String::from_utf8_lossy(&publish.payload).into_owned();
                    debug!("Result message on {}: {}", publish.topic, content);
                    self.emit(LinkEvent::Message(MQTTMessage::from_topic(
                        publish.topic,
                        content,
                    )))
                    .await;
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!("Subscription acknowledged: {:?}", ack.return_codes);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.lose("broker closed the connection".to_string()).await;
                    break;
                }
                Ok(other) => debug!("Connection event: {:?}", other),
                Err(e) => {
                    self.lose(e.to_string()).await;
                    break;
                }
            }
        }
        self.transition()
    }

    fn lose(&self, reason: String) -> impl Future<Output = ()> + Send + 'static {
        warn!("Connection {} lost: {}", self.epoch, reason);
        self.set_status(ConnectionStatus::Disconnected);
        self.emit(LinkEvent::ConnectionLost(reason))
    }

    // Gives the queued DISCONNECT a short chance to reach the broker.
    async fn flush_disconnect(&mut self) {
        let event_loop = &mut self.event_loop;
        let flush = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        };
        if tokio::time::timeout(Duration::from_millis(500), flush).await.is_err() {
            debug!("Disconnect of epoch {} not flushed in time", self.epoch);
        }
    }
}

impl LinkWorker<Closed> {
    pub fn finish(self) {
        debug!("Connection worker {} finished", self.epoch);
    }
}

fn spawn_worker(worker: LinkWorker<Connecting>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let closed = match worker.await_connack().await {
            Ok(connected) => connected.run_until_closed().await,
            Err(closed) => closed,
        };
        closed.finish();
    })
}
