//! Reconnecting event socket to the background service (`GET /events`).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::{Event, EventKind, RawEvent};
use crate::service::AuthToken;

pub fn decode(text: &str) -> Result<Event> {
    let raw: RawEvent = serde_json::from_str(text)
        .map_err(|e| AppError::Parse(format!("Event: {}", e)))?;
    Event::from_raw(raw)
}

/// User-facing failure for an event, `None` for events that are not errors.
/// `name` is the display name of the profile the event refers to.
pub fn alert(kind: &EventKind, name: Option<&str>) -> Option<AppError> {
    let on = |msg: &str| match name {
        Some(n) => format!("{} on {}", msg, n),
        None => msg.to_string(),
    };
    let to = |msg: &str| match name {
        Some(n) => format!("{} to {}", msg, n),
        None => msg.to_string(),
    };
    match kind {
        EventKind::AuthError { .. } => Some(AppError::Auth(to("Failed to authenticate"))),
        EventKind::Inactive { .. } => Some(AppError::Auth(on("Disconnected due to inactivity"))),
        EventKind::TimeoutError { .. } => Some(AppError::Timeout(on("Connection timed out"))),
        EventKind::HandshakeTimeout { .. } => Some(AppError::Timeout(on("Handshake timeout"))),
        EventKind::OfflineError { .. } => Some(AppError::request(on("Server is offline"))),
        EventKind::ConnectionError { .. } => Some(AppError::request(to("Failed to connect"))),
        EventKind::ConfigurationError { .. } => Some(AppError::Parse(on("Invalid configuration"))),
        EventKind::RegistrationRequired { .. } => {
            Some(AppError::Auth(match name {
                Some(n) => format!("Device registration required for {}", n),
                None => "Device registration required".into(),
            }))
        }
        EventKind::Update(_)
        | EventKind::Output { .. }
        | EventKind::SsoAuth { .. }
        | EventKind::RegistrationPass { .. }
        | EventKind::Wakeup => None,
    }
}

// ── Reconnect guard ───────────────────────────────────────────────────────────

/// At most one pending reconnect. Set when a reconnect is scheduled, cleared
/// when it fires.
#[derive(Debug, Clone, Default)]
pub struct ReconnectGuard {
    scheduled: Arc<AtomicBool>,
}

impl ReconnectGuard {
    /// Returns false if a reconnect is already pending.
    pub fn schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::SeqCst)
    }

    pub fn fire(&self) {
        self.scheduled.store(false, Ordering::SeqCst);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::SeqCst)
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Requests a reconnect of a running channel. Requests made while one is
/// already pending are dropped.
#[derive(Debug, Clone)]
pub struct Reconnect {
    guard: ReconnectGuard,
    kick: Arc<Notify>,
}

impl Reconnect {
    /// End the current session and reconnect after the delay. Returns false
    /// if a reconnect was already pending.
    pub fn reconnect(&self) -> bool {
        if !self.guard.schedule() {
            debug!("Event socket reconnect already scheduled");
            return false;
        }
        self.kick.notify_one();
        true
    }
}

/// Tasks behind a spawned channel.
pub struct EventHandle {
    trigger: Reconnect,
    tasks: Vec<JoinHandle<()>>,
}

impl EventHandle {
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct EventChannel {
    url: String,
    socket: Option<PathBuf>,
    token: AuthToken,
    delay: Duration,
    trigger: Reconnect,
}

impl EventChannel {
    pub fn new(url: impl Into<String>, token: AuthToken, delay: Duration) -> Self {
        Self {
            url: url.into(),
            socket: None,
            token,
            delay,
            trigger: Reconnect { guard: ReconnectGuard::default(), kick: Arc::new(Notify::new()) },
        }
    }

    /// Connect through the service's Unix socket; `url` then only supplies
    /// the handshake path.
    pub fn over_unix(mut self, socket: impl Into<PathBuf>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    /// Run until the receiver is dropped. Events are delivered in socket
    /// order; undecodable messages are logged and skipped. A rotated auth
    /// token triggers a reconnect so the new token is presented.
    pub fn spawn(self, tx: mpsc::UnboundedSender<Event>) -> EventHandle {
        let trigger = self.trigger.clone();

        let mut rotated = self.token.subscribe();
        rotated.borrow_and_update();
        let on_rotate = trigger.clone();
        let watcher = tokio::spawn(async move {
            while rotated.changed().await.is_ok() {
                info!("Service auth token rotated");
                on_rotate.reconnect();
            }
        });

        let runner = tokio::spawn(async move { self.run(tx).await });
        EventHandle { trigger, tasks: vec![runner, watcher] }
    }

    async fn run(self, tx: mpsc::UnboundedSender<Event>) {
        loop {
            match self.session(&tx).await {
                Ok(()) => info!("Event socket closed"),
                Err(e) => warn!("Event socket error: {}", e),
            }
            if tx.is_closed() {
                return;
            }
            // already set when a reconnect request ended the session
            self.trigger.guard.schedule();
            let wait = tokio::time::sleep(self.delay);
            tokio::pin!(wait);
            loop {
                // requests left over from a failed connect are spent here
                tokio::select! {
                    _ = &mut wait => break,
                    _ = self.trigger.kick.notified() => {}
                }
            }
            self.trigger.guard.fire();
        }
    }

    async fn session(&self, tx: &mpsc::UnboundedSender<Event>) -> Result<()> {
        let mut req = self.url.as_str().into_client_request()?;
        let headers = req.headers_mut();
        headers.insert("User-Agent", HeaderValue::from_static("pritunl"));
        let token = HeaderValue::from_str(&self.token.get())
            .map_err(|e| AppError::Parse(format!("Auth token header: {}", e)))?;
        headers.insert("Auth-Token", token);

        match &self.socket {
            Some(socket) => self.session_unix(socket, req, tx).await,
            None => {
                let (ws, _) = tokio_tungstenite::connect_async(req).await?;
                debug!(url = %self.url, "Event socket connected");
                self.pump(ws, tx).await
            }
        }
    }

    #[cfg(unix)]
    async fn session_unix(&self, socket: &Path, req: Request, tx: &mpsc::UnboundedSender<Event>) -> Result<()> {
        let stream = tokio::net::UnixStream::connect(socket).await?;
        let (ws, _) = tokio_tungstenite::client_async(req, stream).await?;
        debug!(socket = %socket.display(), "Event socket connected");
        self.pump(ws, tx).await
    }

    #[cfg(not(unix))]
    async fn session_unix(&self, socket: &Path, _req: Request, _tx: &mpsc::UnboundedSender<Event>) -> Result<()> {
        Err(AppError::Process(format!("Unix socket {} not supported here", socket.display())))
    }

    async fn pump<S>(&self, ws: WebSocketStream<S>, tx: &mpsc::UnboundedSender<Event>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();

        loop {
            let msg = tokio::select! {
                msg = read.next() => msg,
                _ = self.trigger.kick.notified() => {
                    debug!("Event socket reconnect requested");
                    return Ok(());
                }
            };
            let Some(msg) = msg else {
                return Ok(());
            };
            let text = match msg? {
                Message::Text(text) => text,
                Message::Close(_) => return Ok(()),
                _ => continue,
            };
            let evt = match decode(&text) {
                Ok(evt) => evt,
                Err(e) => {
                    warn!("Event dropped: {}", e);
                    continue;
                }
            };
            if evt.kind == EventKind::Wakeup {
                write.send(Message::Text("awake".into())).await?;
            }
            if tx.send(evt).is_err() {
                return Ok(());
            }
        }
    }
}
