use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use tracing::{Instrument, info_span};

use crate::{
    commands::ControlCommand,
    error::format_error_chain,
    transport::{ConnectionInfo, OutboundMessage, Transport, TransportError},
};

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentFrame<'a> {
    Hello {
        compute_name: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        fleet_id: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        location: Option<&'a str>,
        agent_version: &'static str,
    },
    Notify {
        message: &'a OutboundMessage,
    },
    Req {
        id: u64,
        message: &'a OutboundMessage,
    },
}

#[derive(Debug, Clone, serde::Deserialize)]
struct RemoteError {
    code: String,
    message: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
    Resp {
        id: u64,
        ok: bool,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default)]
        error: Option<RemoteError>,
    },
    Command {
        command: ControlCommand,
    },
    #[serde(other)]
    Unknown,
}

fn parse_ws_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Some(format!("wss://{rest}"));
    }
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Some(format!("ws://{rest}"));
    }
    Some(trimmed.to_string())
}

#[derive(Debug, Clone)]
pub struct WsSettings {
    pub url: String,
    pub token: Option<String>,
    pub compute_name: String,
    pub fleet_id: Option<String>,
    pub location: Option<String>,
}

struct Connection {
    info: ConnectionInfo,
    tx: mpsc::UnboundedSender<WsMessage>,
}

type Pending = HashMap<u64, oneshot::Sender<Result<serde_json::Value, TransportError>>>;

/// Long-lived WebSocket link to the control plane.
///
/// A background task owns the socket and reconnects with doubling backoff.
/// Inbound commands go out through the channel handed to [`WsTransport::spawn`].
pub struct WsTransport {
    settings: WsSettings,
    connection: RwLock<Option<Connection>>,
    pending: Mutex<Pending>,
    next_request_id: AtomicU64,
    next_connection_id: AtomicU64,
    closed: AtomicBool,
    commands: mpsc::UnboundedSender<ControlCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn spawn(
        mut settings: WsSettings,
        commands: mpsc::UnboundedSender<ControlCommand>,
    ) -> anyhow::Result<Arc<Self>> {
        let Some(url) = parse_ws_url(&settings.url) else {
            anyhow::bail!("control url is empty");
        };
        settings.url = url;

        let this = Arc::new(Self {
            settings,
            connection: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            next_connection_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            commands,
            task: Mutex::new(None),
        });

        let span = info_span!(
            "control_link",
            compute = %this.settings.compute_name,
            url = %this.settings.url
        );
        let task = tokio::spawn({
            let this = this.clone();
            async move {
                let mut backoff = Duration::from_millis(500);
                while !this.closed.load(Ordering::SeqCst) {
                    match this.run_once().await {
                        Ok(()) => backoff = Duration::from_millis(500),
                        Err(err) => {
                            tracing::warn!(
                                error = %format_error_chain(&err),
                                "control link disconnected"
                            );
                            backoff = (backoff * 2).min(Duration::from_secs(30));
                        }
                    }
                    if this.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
            .instrument(span)
        });
        *this.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(this)
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let mut req = self.settings.url.as_str().into_client_request()?;
        if let Some(tok) = &self.settings.token {
            req.headers_mut()
                .insert("Authorization", format!("Bearer {tok}").parse()?);
        }

        let (ws, _) = tokio_tungstenite::connect_async(req).await?;
        let (mut sink, mut stream) = ws.split();

        let hello = AgentFrame::Hello {
            compute_name: &self.settings.compute_name,
            fleet_id: self.settings.fleet_id.as_deref(),
            location: self.settings.location.as_deref(),
            agent_version: env!("CARGO_PKG_VERSION"),
        };
        sink.send(WsMessage::Text(serde_json::to_string(&hello)?.into()))
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let info = ConnectionInfo {
            id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            connected_at: chrono::Utc::now(),
        };
        let conn_id = info.id;
        *self.connection.write().unwrap_or_else(|e| e.into_inner()) = Some(Connection { info, tx });
        tracing::info!(connection_id = conn_id, "control link connected");

        let res: anyhow::Result<()> = loop {
            tokio::select! {
                Some(out) = rx.recv() => {
                    let closing = matches!(out, WsMessage::Close(_));
                    if let Err(err) = sink.send(out).await {
                        break Err(err.into());
                    }
                    if closing {
                        break Ok(());
                    }
                }
                msg = stream.next() => match msg {
                    None | Some(Ok(WsMessage::Close(_))) => break Ok(()),
                    Some(Ok(WsMessage::Text(text))) => self.on_text(&text),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Err(err.into()),
                }
            }
        };

        self.drop_connection(conn_id);
        res
    }

    fn on_text(&self, text: &str) {
        let frame = match serde_json::from_str::<ControlFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(error = %err, "unreadable control frame");
                return;
            }
        };
        match frame {
            ControlFrame::Resp {
                id,
                ok,
                payload,
                error,
            } => {
                let Some(waiter) = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id)
                else {
                    tracing::debug!(request_id = id, "response for an abandoned request");
                    return;
                };
                let result = if ok {
                    Ok(payload)
                } else {
                    let err = error.unwrap_or(RemoteError {
                        code: "UNKNOWN".to_string(),
                        message: "request failed".to_string(),
                    });
                    Err(TransportError::Remote {
                        code: err.code,
                        message: err.message,
                    })
                };
                let _ = waiter.send(result);
            }
            ControlFrame::Command { command } => {
                if self.commands.send(command).is_err() {
                    tracing::warn!("command dispatcher is gone; dropping command");
                }
            }
            ControlFrame::Unknown => {}
        }
    }

    fn drop_connection(&self, conn_id: u64) {
        {
            let mut slot = self.connection.write().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().map(|c| c.info.id) == Some(conn_id) {
                *slot = None;
            }
        }
        let closed = self.closed.load(Ordering::SeqCst);
        let waiters: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(if closed {
                TransportError::Closed
            } else {
                TransportError::Disconnected
            }));
        }
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<WsMessage>> {
        self.connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.tx.clone())
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    fn send_async(&self, message: OutboundMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(tx) = self.outbound() else {
            tracing::debug!(kind = message.kind(), "not connected; dropping message");
            return;
        };
        match serde_json::to_string(&AgentFrame::Notify { message: &message }) {
            Ok(text) => {
                let _ = tx.send(WsMessage::Text(text.into()));
            }
            Err(err) => tracing::warn!(kind = message.kind(), error = %err, "encode message failed"),
        }
    }

    async fn send_request(
        &self,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&AgentFrame::Req {
            id,
            message: &message,
        })
        .map_err(TransportError::Encode)?;
        let tx = self.outbound().ok_or(TransportError::NotConnected)?;

        let (waiter, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, waiter);

        if tx.send(WsMessage::Text(text.into())).is_err() {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(TransportError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    fn current_connection(&self) -> Option<ConnectionInfo> {
        self.connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.info.clone())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.outbound() {
            let _ = tx.send(WsMessage::Close(None));
        }
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        // The link task may have been aborted before it cleaned up.
        *self.connection.write().unwrap_or_else(|e| e.into_inner()) = None;
        let waiters: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(TransportError::Closed));
        }
        tracing::info!("control link closed");
    }
}
