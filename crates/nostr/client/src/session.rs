//! Single relay session: one socket, one driver task, reconnect with backoff.

use crate::backoff::ReconnectBackoff;
use crate::descriptor::RelayUrl;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage, parse_relay_message};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection state, mutated only by the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry; carries the backoff attempt number.
    Reconnecting(u32),
}

/// Session timing configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// A connection that stays up this long resets the backoff.
    pub stability_window: Duration,
    /// How long `disconnect` waits for the close handshake.
    pub disconnect_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            stability_window: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(2),
        }
    }
}

/// Everything a session reports to its owner, in receipt order.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub relay: RelayUrl,
    pub session_id: u64,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone)]
pub enum SessionEventKind {
    State(ConnectionState),
    Message(RelayMessage),
    /// Transport or protocol failure. Informational; the session keeps going.
    Failure(String),
}

struct SessionShared {
    url: RelayUrl,
    id: u64,
    state: RwLock<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionShared {
    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        debug!("relay {} is {:?}", self.url, state);
        self.emit(SessionEventKind::State(state));
    }

    fn set_outbound(&self, sender: Option<mpsc::UnboundedSender<String>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    fn emit(&self, kind: SessionEventKind) {
        // The owner may already be gone during teardown.
        let _ = self.events_tx.send(SessionEvent {
            relay: self.url.clone(),
            session_id: self.id,
            kind,
        });
    }

    fn handle_text(&self, text: &str) {
        match parse_relay_message(text) {
            Ok(Some(message)) => self.emit(SessionEventKind::Message(message)),
            Ok(None) => debug!("ignoring unsupported frame from {}", self.url),
            Err(error) => {
                warn!("protocol parse error on {}: {}", self.url, error);
                self.emit(SessionEventKind::Failure(error.to_string()));
            }
        }
    }
}

struct Driver {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

enum PumpOutcome {
    Shutdown,
    Dropped(String),
}

/// One relay connection.
///
/// `connect` spawns a driver task that owns the socket and keeps reconnecting
/// until `disconnect` is called or the session is dropped.
pub struct RelaySession {
    shared: Arc<SessionShared>,
    config: SessionConfig,
    driver: Mutex<Option<Driver>>,
}

impl RelaySession {
    /// Create a disconnected session reporting into `events_tx`.
    pub fn new(
        url: RelayUrl,
        config: SessionConfig,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                url,
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                state: RwLock::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                events_tx,
            }),
            config,
            driver: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.shared.url
    }

    /// Process-unique id used to tell events of a replaced session apart.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Start the connection driver. Returns `false` if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> bool {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.as_ref().is_some_and(|running| !running.task.is_finished()) {
            debug!("relay {} driver already running", self.shared.url);
            return false;
        }

        self.shared.set_state(ConnectionState::Connecting);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(
            Arc::clone(&self.shared),
            self.config.clone(),
            shutdown_rx,
        ));
        *driver = Some(Driver { shutdown, task });
        true
    }

    /// Queue a protocol message on the live socket.
    ///
    /// Fails with `NotConnected` (logged, never fatal) when the session has no
    /// live socket; nothing is queued for later.
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        if !self.is_connected() {
            warn!(
                "dropping {} for {}: not connected",
                message.label(),
                self.shared.url
            );
            return Err(ClientError::NotConnected);
        }

        let text = message.to_json()?;
        let outbound = self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(sender) => sender.send(text).map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Close the socket, cancel any pending reconnect, and stop the driver.
    pub async fn disconnect(&self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Driver { shutdown, mut task }) = driver {
            let _ = shutdown.send(());
            if timeout(self.config.disconnect_grace, &mut task).await.is_err() {
                debug!("relay {} driver did not stop in time; aborting", self.shared.url);
                task.abort();
            }
        }

        self.shared.set_outbound(None);
        if self.shared.state() != ConnectionState::Disconnected {
            self.shared.set_state(ConnectionState::Disconnected);
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        // Dropping the shutdown sender stops the driver; abort covers a
        // driver blocked inside the connect handshake.
        if let Some(driver) = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.task.abort();
        }
    }
}

async fn run_session(
    shared: Arc<SessionShared>,
    config: SessionConfig,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut backoff = ReconnectBackoff::new(config.reconnect_initial, config.reconnect_max);

    loop {
        // The first attempt was announced by `connect`.
        if shared.state() != ConnectionState::Connecting {
            shared.set_state(ConnectionState::Connecting);
        }
        let attempt = tokio::select! {
            _ = &mut shutdown => return,
            result = timeout(config.connect_timeout, connect_async(shared.url.as_str())) => result,
        };

        let failure = match attempt {
            Ok(Ok((stream, _response))) => {
                info!("connected to relay {}", shared.url);
                let connected_at = Instant::now();
                let outcome = pump(&shared, stream, &mut shutdown).await;
                if connected_at.elapsed() >= config.stability_window {
                    backoff.reset();
                }
                match outcome {
                    PumpOutcome::Shutdown => return,
                    PumpOutcome::Dropped(reason) => ClientError::Connection(reason),
                }
            }
            Ok(Err(error)) => ClientError::WebSocket(error.to_string()),
            Err(_) => ClientError::Timeout(format!(
                "connect gave up after {:?}",
                config.connect_timeout
            )),
        };
        warn!("relay {}: {}", shared.url, failure);
        shared.emit(SessionEventKind::Failure(failure.to_string()));

        let delay = backoff.next_delay();
        shared.set_state(ConnectionState::Reconnecting(backoff.attempt()));
        debug!("relay {} reconnecting in {:?}", shared.url, delay);

        tokio::select! {
            _ = &mut shutdown => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump(
    shared: &SessionShared,
    stream: WsStream,
    shutdown: &mut oneshot::Receiver<()>,
) -> PumpOutcome {
    let (mut writer, mut reader) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    // The sender must be in place before the state flips so that replayed
    // subscriptions triggered by `Connected` reach the socket.
    shared.set_outbound(Some(outbound_tx));
    shared.set_state(ConnectionState::Connected);

    let outcome = loop {
        tokio::select! {
            _ = &mut *shutdown => {
                if let Err(error) = writer.send(Message::Close(None)).await {
                    debug!("close frame to {} failed: {}", shared.url, error);
                }
                break PumpOutcome::Shutdown;
            }
            outgoing = outbound_rx.recv() => {
                let Some(text) = outgoing else {
                    break PumpOutcome::Dropped("outbound queue closed".to_string());
                };
                if let Err(error) = writer.send(Message::Text(text.into())).await {
                    break PumpOutcome::Dropped(format!("write failed: {error}"));
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.handle_text(text.as_str()),
                Some(Ok(Message::Ping(payload))) => {
                    debug!("received ping from {} ({} bytes)", shared.url, payload.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    break PumpOutcome::Dropped(format!("closed by relay: {frame:?}"));
                }
                Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                Some(Err(error)) => break PumpOutcome::Dropped(format!("read failed: {error}")),
                None => break PumpOutcome::Dropped("stream ended".to_string()),
            }
        }
    };

    shared.set_outbound(None);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

    async fn unused_relay_url() -> Result<RelayUrl> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);
        RelayUrl::parse(&format!("ws://{addr}"))
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(500),
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(80),
            stability_window: Duration::from_secs(5),
            disconnect_grace: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn send_without_connection_fails_softly() -> TestResult {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let session = RelaySession::new(unused_relay_url().await?, fast_config(), events_tx);

        let message = ClientMessage::Close {
            subscription_id: "sub".to_string(),
        };
        assert!(matches!(session.send(&message), Err(ClientError::NotConnected)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_relay_backs_off_until_disconnected() -> TestResult {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = RelaySession::new(unused_relay_url().await?, fast_config(), events_tx);

        assert!(session.connect());
        assert!(!session.connect());

        let mut states = Vec::new();
        let mut failures = Vec::new();
        while states.len() < 6 {
            let event = timeout(Duration::from_secs(5), events_rx.recv())
                .await?
                .ok_or("event channel closed")?;
            assert_eq!(event.session_id, session.id());
            match event.kind {
                SessionEventKind::State(state) => states.push(state),
                SessionEventKind::Failure(message) => failures.push(message),
                SessionEventKind::Message(_) => {}
            }
        }
        // Every retry handshake is announced as a fresh connect attempt.
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Reconnecting(1),
                ConnectionState::Connecting,
                ConnectionState::Reconnecting(2),
                ConnectionState::Connecting,
                ConnectionState::Reconnecting(3),
            ]
        );
        assert!(failures.len() >= 3);
        assert!(
            failures.iter().all(|message| message.starts_with("WebSocket error:")),
            "{failures:?}"
        );

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);

        // No further reconnect attempts after disconnect.
        while events_rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(events_rx.try_recv().is_err());
        Ok(())
    }
}
