//! In-process relay double for pool tests.

use futures_util::{SinkExt, StreamExt};
use nostr::{Event, EventTemplate, finalize_event};
use nostr_relay_pool::{
    ConnectionState, PoolConfig, PoolNotification, RelayUrl, SessionConfig,
};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const WAIT: Duration = Duration::from_secs(5);

/// Relay that records every text frame it receives and sends whatever the
/// test pushes to all open connections.
pub struct MockRelay {
    pub url: String,
    received: mpsc::UnboundedReceiver<String>,
    push_tx: broadcast::Sender<String>,
    kick_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> TestResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}", listener.local_addr()?);
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push_tx, _) = broadcast::channel::<String>(64);
        let (kick_tx, _) = broadcast::channel::<()>(4);

        let accept_push = push_tx.clone();
        let accept_kick = kick_tx.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let received_tx = received_tx.clone();
                let mut push = accept_push.subscribe();
                let mut kick = accept_kick.subscribe();
                tokio::spawn(async move {
                    let Ok(ws) = accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut source) = ws.split();
                    loop {
                        tokio::select! {
                            frame = source.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = received_tx.send(text.to_string());
                                }
                                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                            pushed = push.recv() => match pushed {
                                Ok(text) => {
                                    if sink.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            },
                            // Drop the socket without a close handshake.
                            _ = kick.recv() => break,
                        }
                    }
                });
            }
        });

        Ok(Self {
            url,
            received,
            push_tx,
            kick_tx,
            task,
        })
    }

    /// Next frame the relay received, as JSON.
    pub async fn next_frame(&mut self) -> TestResult<Value> {
        let text = timeout(WAIT, self.received.recv())
            .await?
            .ok_or("mock relay stopped")?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Next frame, or `None` once the relay has been quiet for `period`.
    pub async fn next_frame_within(&mut self, period: Duration) -> TestResult<Option<Value>> {
        match timeout(period, self.received.recv()).await {
            Err(_) => Ok(None),
            Ok(text) => Ok(Some(serde_json::from_str(&text.ok_or("mock relay stopped")?)?)),
        }
    }

    /// Assert nothing arrives for `period`.
    pub async fn assert_silent(&mut self, period: Duration) -> TestResult {
        match timeout(period, self.received.recv()).await {
            Err(_) => Ok(()),
            Ok(frame) => Err(format!("unexpected frame: {frame:?}").into()),
        }
    }

    pub fn push(&self, frame: &Value) {
        let _ = self.push_tx.send(frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.push_tx.send(text.to_string());
    }

    /// Drop every open connection.
    pub fn kick(&self) {
        let _ = self.kick_tx.send(());
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        session: SessionConfig {
            connect_timeout: Duration::from_secs(2),
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(200),
            stability_window: Duration::from_secs(30),
            disconnect_grace: Duration::from_millis(500),
        },
        ..PoolConfig::default()
    }
}

pub fn signed_note(secret_key: &[u8; 32], content: &str) -> TestResult<Event> {
    Ok(finalize_event(
        &EventTemplate {
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: content.to_string(),
        },
        secret_key,
    )?)
}

/// Wait for the first notification accepted by `matches`, skipping others.
pub async fn next_matching(
    notifications: &mut broadcast::Receiver<PoolNotification>,
    mut matches: impl FnMut(&PoolNotification) -> bool,
) -> TestResult<PoolNotification> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let notification = tokio::time::timeout_at(deadline, notifications.recv()).await??;
        if matches(&notification) {
            return Ok(notification);
        }
    }
}

/// Wait until every relay in `relays` reports `Connected`, in any order.
pub async fn wait_connected(
    notifications: &mut broadcast::Receiver<PoolNotification>,
    relays: &[&RelayUrl],
) -> TestResult {
    let mut waiting: Vec<&RelayUrl> = relays.to_vec();
    while !waiting.is_empty() {
        let notification = next_matching(notifications, |notification| {
            matches!(
                notification,
                PoolNotification::RelayStatus { state: ConnectionState::Connected, .. }
            )
        })
        .await?;
        if let PoolNotification::RelayStatus { relay, .. } = notification {
            waiting.retain(|url| **url != relay);
        }
    }
    Ok(())
}
