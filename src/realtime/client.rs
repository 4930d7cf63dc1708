use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use super::protocol;
use super::{
    ConnectionState, ControlCommand, RealtimeConfig, Transport, TransportEvent, TransportMessage,
};
use crate::audio::AudioFrame;
use crate::ws;
use crate::{Error, Result};

const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug)]
struct Shared {
    connection: u64,
    state: ConnectionState,
}

type SharedState = Arc<Mutex<Shared>>;

/// Set `state` only if `connection` is still the current one.
fn set_state(shared: &SharedState, connection: u64, state: ConnectionState) -> bool {
    match shared.lock() {
        Ok(mut s) if s.connection == connection => {
            s.state = state;
            true
        }
        _ => false,
    }
}

fn is_current(shared: &SharedState, connection: u64) -> bool {
    shared
        .lock()
        .map(|s| s.connection == connection)
        .unwrap_or(false)
}

struct Link {
    outbound: mpsc::Sender<String>,
    shutdown: oneshot::Sender<u64>,
}

/// [`Transport`] over a tokio-tungstenite websocket.
///
/// Each `connect` spawns one task that owns the socket. The task reports on
/// `events` and stops on `disconnect` or when the server goes away.
pub struct RealtimeClient {
    config: RealtimeConfig,
    events: mpsc::Sender<TransportMessage>,
    shared: SharedState,
    muted: bool,
    link: Option<Link>,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig, events: mpsc::Sender<TransportMessage>) -> Self {
        Self {
            config,
            events,
            shared: Arc::new(Mutex::new(Shared {
                connection: 0,
                state: ConnectionState::Disconnected,
            })),
            muted: false,
            link: None,
        }
    }

    fn begin_connection(&self, state: ConnectionState) -> Result<u64> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| Error::Transport("connection state poisoned".into()))?;
        shared.connection += 1;
        shared.state = state;
        Ok(shared.connection)
    }

    fn enqueue(&self, message: String) -> Result<()> {
        let link = self.link.as_ref().ok_or(Error::NotConnected)?;
        link.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::Transport("outbound queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => Error::NotConnected,
        })
    }
}

impl Transport for RealtimeClient {
    fn connect(&mut self) -> Result<()> {
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Ok(());
        }
        if self.config.api_key.trim().is_empty() {
            return Err(Error::Config("no OpenAI API key configured".into()));
        }
        let connection = self.begin_connection(ConnectionState::Connecting)?;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(run_connection(ConnectionTask {
            config: self.config.clone(),
            connection,
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        }));
        self.link = Some(Link {
            outbound: outbound_tx,
            shutdown: shutdown_tx,
        });
        log::info!("[realtime] connection {} starting", connection);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.shared
            .lock()
            .map(|s| s.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn connection(&self) -> u64 {
        self.shared.lock().map(|s| s.connection).unwrap_or(0)
    }

    fn send_audio_frame(&mut self, frame: &AudioFrame) -> Result<()> {
        if self.muted || self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        self.enqueue(protocol::audio_append(frame).to_string())
    }

    fn send_control(&mut self, command: ControlCommand) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        log::debug!("[realtime] control {:?}", command);
        self.enqueue(command.to_json().to_string())
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let closing = match self.begin_connection(ConnectionState::Closing) {
            Ok(id) => id,
            Err(e) => {
                log::error!("[realtime] {}", e);
                return;
            }
        };
        drop(link.outbound);
        if link.shutdown.send(closing).is_err() {
            set_state(&self.shared, closing, ConnectionState::Disconnected);
        }
        log::info!("[realtime] disconnecting");
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct ConnectionTask {
    config: RealtimeConfig,
    connection: u64,
    shared: SharedState,
    events: mpsc::Sender<TransportMessage>,
    outbound: mpsc::Receiver<String>,
    shutdown: oneshot::Receiver<u64>,
}

impl ConnectionTask {
    async fn emit(&self, event: TransportEvent) {
        if !is_current(&self.shared, self.connection) {
            log::debug!("[realtime] dropping event from stale connection {}", self.connection);
            return;
        }
        let _ = self
            .events
            .send(TransportMessage {
                connection: self.connection,
                event,
            })
            .await;
    }

    /// Connection is gone without the user asking: report it once.
    async fn fail(&self, reason: String) {
        if !set_state(&self.shared, self.connection, ConnectionState::Disconnected) {
            return;
        }
        self.emit(TransportEvent::Stream(protocol::Inbound {
            response_id: None,
            event: protocol::StreamEvent::Error {
                message: reason.clone(),
            },
        }))
        .await;
        self.emit(TransportEvent::Closed { reason }).await;
    }
}

fn finish_close(shared: &SharedState, closing: std::result::Result<u64, oneshot::error::RecvError>) {
    if let Ok(closing) = closing {
        set_state(shared, closing, ConnectionState::Disconnected);
    }
}

async fn run_connection(mut task: ConnectionTask) {
    let endpoint = task.config.endpoint();
    let headers = task.config.headers();
    log::info!("[realtime] connecting: url={}", endpoint);

    let connecting = ws::connect_with_retry(
        "realtime",
        &endpoint,
        &headers,
        task.config.connect_timeout,
        task.config.connect_attempts,
    );
    let result = tokio::select! {
        closing = &mut task.shutdown => {
            log::info!("[realtime] connect abandoned");
            finish_close(&task.shared, closing);
            return;
        }
        result = connecting => result,
    };
    let stream = match result {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("[realtime] {}", e);
            task.fail(e.to_string()).await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = stream.split();
    let init = protocol::session_update(&task.config).to_string();
    if let Err(e) = ws_tx.send(Message::Text(init.into())).await {
        task.fail(format!("failed to send session update: {}", e)).await;
        return;
    }
    if !set_state(&task.shared, task.connection, ConnectionState::Connected) {
        let _ = ws_tx.close().await;
        return;
    }
    task.emit(TransportEvent::Connected).await;

    let mut sent: u64 = 0;
    let reason = loop {
        tokio::select! {
            biased;
            closing = &mut task.shutdown => {
                log::info!("[realtime] closing websocket after {} messages", sent);
                let _ = ws_tx.close().await;
                finish_close(&task.shared, closing);
                return;
            }
            Some(text) = task.outbound.recv() => {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    break format!("send failed: {}", e);
                }
                sent += 1;
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => match protocol::decode_server_event(&text) {
                    Ok(Some(inbound)) => task.emit(TransportEvent::Stream(inbound)).await,
                    Ok(None) => {}
                    Err(e) => log::warn!("[realtime] {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => format!("closed by server: {} {}", frame.code, frame.reason),
                        None => "closed by server".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("websocket error: {}", e),
                None => break "connection closed".to_string(),
            },
        }
    };

    log::warn!("[realtime] connection lost: {}", reason);
    task.fail(reason).await;
}
