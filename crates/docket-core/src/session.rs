//! Kernel session management.
//!
//! A session is one kernel started on the execution server plus the
//! WebSocket channel used to talk to it. The [`SessionManager`] owns the
//! single active session: it creates one on demand, recreates it when the
//! previous one died with its server, and replaces it on restart.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{Error, Result};
use crate::handler::{self, Inbound};
use crate::outcome::ExecutionOutcome;
use crate::protocol::{KernelEvent, KernelMessage, WireMessage};
use crate::status::StatusSink;
use crate::supervisor::ProcessSupervisor;

/// How long to wait for the idle status after the execute reply arrived.
const IDLE_GRACE: Duration = Duration::from_secs(5);

/// Timeout for REST calls to the execution server.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle state of the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Absent,
    Starting,
    Ready,
    ShuttingDown,
}

/// Kernel model returned by `POST /api/kernels`.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelModel {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// The request currently waiting for messages.
struct InFlight {
    msg_id: String,
    tx: mpsc::UnboundedSender<Inbound>,
}

/// The in-flight request of one channel, and whether the channel is shut.
///
/// Once shut, no request can be registered, so every registered request
/// is settled by whoever shut the slot.
#[derive(Default)]
struct RequestSlot {
    closed: bool,
    flight: Option<InFlight>,
}

impl RequestSlot {
    fn register(&mut self, msg_id: &str, tx: mpsc::UnboundedSender<Inbound>) -> Result<()> {
        if self.closed {
            return Err(Error::Connection("kernel channel is closed".to_string()));
        }
        self.flight = Some(InFlight {
            msg_id: msg_id.to_string(),
            tx,
        });
        Ok(())
    }

    fn clear(&mut self, msg_id: &str) {
        if self.flight.as_ref().is_some_and(|f| f.msg_id == msg_id) {
            self.flight = None;
        }
    }

    /// Refuse further requests and settle the current one with `last`.
    fn shut(&mut self, last: Inbound) {
        self.closed = true;
        if let Some(flight) = self.flight.take() {
            let _ = flight.tx.send(last);
        }
    }
}

type InFlightSlot = Arc<Mutex<RequestSlot>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Channels WebSocket URL for a kernel.
pub fn channels_url(endpoint: &Url, kernel_id: &str, session_id: &str) -> Result<Url> {
    let mut url = endpoint
        .join(&format!("api/kernels/{}/channels", kernel_id))
        .map_err(|e| Error::Connection(format!("invalid kernel URL: {}", e)))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| Error::Connection(format!("cannot use {} for {}", scheme, endpoint)))?;
    url.query_pairs_mut().clear().append_pair("session_id", session_id);
    Ok(url)
}

/// Browser URL of a notebook at `path` on the server.
pub fn notebook_url(endpoint: &Url, path: &str) -> Result<Url> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .map_err(|_| Error::Connection(format!("endpoint {} cannot hold a path", endpoint)))?
        .pop_if_empty()
        .push("notebooks")
        .extend(path.split('/').filter(|s| !s.is_empty()));
    Ok(url)
}

/// A live kernel and its channel connection.
pub struct KernelSession {
    kernel_id: String,
    client_session: String,
    endpoint: Url,
    ws_sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    in_flight: InFlightSlot,
    reader: JoinHandle<()>,
    exec_lock: tokio::sync::Mutex<()>,
    status: Arc<dyn StatusSink>,
}

impl KernelSession {
    /// Open the channels socket of an already started kernel.
    pub async fn connect(
        endpoint: Url,
        kernel: KernelModel,
        status: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        let client_session = uuid::Uuid::new_v4().to_string();
        let url = channels_url(&endpoint, &kernel.id, &client_session)?;
        tracing::debug!("Connecting kernel channels at {}", url);

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (ws_sink, ws_stream) = stream.split();

        let in_flight: InFlightSlot = Arc::new(Mutex::new(RequestSlot::default()));
        let reader = tokio::spawn(read_frames(ws_stream, in_flight.clone()));

        Ok(Self {
            kernel_id: kernel.id,
            client_session,
            endpoint,
            ws_sink: tokio::sync::Mutex::new(ws_sink),
            in_flight,
            reader,
            exec_lock: tokio::sync::Mutex::new(()),
            status,
        })
    }

    /// Kernel ID on the server.
    pub fn id(&self) -> &str {
        &self.kernel_id
    }

    /// Endpoint of the server hosting this kernel.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Whether the channel connection is still open.
    pub fn is_alive(&self) -> bool {
        !self.reader.is_finished() && !lock(&self.in_flight).closed
    }

    /// Run code on the kernel and wait for its outcome.
    ///
    /// Requests on one session are queued; only one is ever in flight.
    pub async fn execute(&self, code: &str) -> Result<ExecutionOutcome> {
        let _turn = self.exec_lock.lock().await;
        let request = WireMessage::execute_request(&self.client_session, code);
        let msg_id = request.msg_id().to_string();
        let frame = request.to_json()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        lock(&self.in_flight).register(&msg_id, tx)?;

        let sent = self.ws_sink.lock().await.send(Message::Text(frame.into())).await;
        if let Err(e) = sent {
            self.clear_in_flight(&msg_id);
            return Err(Error::from(e).into_connection());
        }
        tracing::debug!("Sent execute_request {}", msg_id);

        let outcome = handler::collect(&mut rx, self.status.as_ref()).await;
        self.clear_in_flight(&msg_id);
        Ok(outcome)
    }

    fn clear_in_flight(&self, msg_id: &str) {
        lock(&self.in_flight).clear(msg_id);
    }

    /// Stop accepting requests and settle the in-flight one, if any, with a
    /// failure.
    pub fn abandon(&self, reason: &str) {
        lock(&self.in_flight).shut(Inbound::Abandoned(reason.to_string()));
    }

    /// Close the channel connection.
    pub async fn close(&self) {
        self.abandon("session closed");
        if let Err(e) = self.ws_sink.lock().await.close().await {
            tracing::debug!("Error closing kernel channel: {}", e);
        }
        self.reader.abort();
        self.abandon("session closed");
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route inbound frames to the in-flight request until the socket closes.
async fn read_frames(mut stream: SplitStream<WsStream>, in_flight: InFlightSlot) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("Kernel channel error: {}", e);
                break;
            }
        };

        match KernelMessage::decode(text.as_str()) {
            Ok(message) => route(&in_flight, message),
            Err(e) => tracing::warn!("Skipping undecodable kernel frame: {}", e),
        }
    }

    tracing::debug!("Kernel channel closed");
    lock(&in_flight).shut(Inbound::Settled);
}

fn route(in_flight: &InFlightSlot, message: KernelMessage) {
    let slot = lock(in_flight);
    let Some(flight) = slot.flight.as_ref() else {
        tracing::debug!("Dropping message with no request in flight: {:?}", message.event);
        return;
    };
    if message.parent_msg_id.as_deref() != Some(flight.msg_id.as_str()) {
        tracing::debug!("Dropping message for another request: {:?}", message.event);
        return;
    }

    let is_reply = matches!(message.event, KernelEvent::ExecuteReply(_));
    let _ = flight.tx.send(Inbound::Message(message.event));

    // The idle status normally follows the reply; settle if it never does.
    if is_reply {
        let tx = flight.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(IDLE_GRACE).await;
            let _ = tx.send(Inbound::Settled);
        });
    }
}

/// Owner of the single active kernel session.
pub struct SessionManager {
    supervisor: Arc<ProcessSupervisor>,
    http: reqwest::Client,
    kernel_name: String,
    status: Arc<dyn StatusSink>,
    active: tokio::sync::Mutex<Option<Arc<KernelSession>>>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    /// Create a manager; no kernel is started until `active_session`.
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        kernel_name: impl Into<String>,
        status: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            supervisor,
            http,
            kernel_name: kernel_name.into(),
            status,
            active: tokio::sync::Mutex::new(None),
            state: Mutex::new(SessionState::Absent),
        })
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    /// The active session, if one exists, without starting anything.
    pub async fn current(&self) -> Option<Arc<KernelSession>> {
        self.active.lock().await.clone()
    }

    /// Return the active session, starting the server and a kernel if needed.
    pub async fn active_session(&self) -> Result<Arc<KernelSession>> {
        let mut active = self.active.lock().await;

        if let Some(session) = active.as_ref() {
            let same_server = self.supervisor.endpoint().as_ref() == Some(session.endpoint());
            if session.is_alive() && same_server {
                return Ok(session.clone());
            }
            tracing::info!("Discarding stale kernel session {}", session.id());
            session.abandon("session is not running");
            *active = None;
        }

        self.set_state(SessionState::Starting);
        let result = self.start_session().await;
        match result {
            Ok(session) => {
                let session = Arc::new(session);
                *active = Some(session.clone());
                self.set_state(SessionState::Ready);
                Ok(session)
            }
            Err(e) => {
                self.set_state(SessionState::Absent);
                Err(e)
            }
        }
    }

    async fn start_session(&self) -> Result<KernelSession> {
        let endpoint = self.supervisor.ensure_running().await?;
        let kernel = self
            .start_kernel(&endpoint)
            .await
            .map_err(Error::into_connection)?;

        self.status
            .log(&format!("Kernel started: {} ({})", kernel.id, kernel.name));
        tracing::info!("Kernel {} started on {}", kernel.id, endpoint);

        KernelSession::connect(endpoint, kernel, self.status.clone())
            .await
            .map_err(Error::into_connection)
    }

    async fn start_kernel(&self, endpoint: &Url) -> Result<KernelModel> {
        let url = endpoint
            .join("api/kernels")
            .map_err(|e| Error::Connection(e.to_string()))?;
        let kernel = self
            .http
            .post(url)
            .json(&serde_json::json!({ "name": self.kernel_name }))
            .send()
            .await?
            .error_for_status()?
            .json::<KernelModel>()
            .await?;
        Ok(kernel)
    }

    async fn shutdown_kernel(&self, session: &KernelSession) -> Result<()> {
        let url = session
            .endpoint()
            .join(&format!("api/kernels/{}", session.id()))
            .map_err(|e| Error::Connection(e.to_string()))?;
        self.http.delete(url).send().await?.error_for_status()?;
        Ok(())
    }

    /// Shut down the current session (best effort) and start a fresh one.
    ///
    /// A request in flight on the old session settles with a failure.
    pub async fn restart(&self) -> Result<Arc<KernelSession>> {
        self.discard("session restarted").await;
        let session = self.active_session().await?;
        self.status.status("Jupyter kernel restarted");
        Ok(session)
    }

    /// Shut down the current session, if any, and leave none active.
    pub async fn shutdown(&self) {
        self.discard("session closed").await;
    }

    async fn discard(&self, reason: &str) {
        let old = self.active.lock().await.take();
        let Some(old) = old else {
            return;
        };

        self.set_state(SessionState::ShuttingDown);
        old.abandon(reason);
        if let Err(e) = self.shutdown_kernel(&old).await {
            tracing::warn!("Failed to shut down kernel {}: {}", old.id(), e);
            self.status
                .log(&format!("Failed to shut down kernel {}: {}", old.id(), e));
        }
        old.close().await;
        self.set_state(SessionState::Absent);
    }

    /// Create a notebook attached to the active kernel and return its URL.
    pub async fn notebook_url(&self) -> Result<Url> {
        let session = self
            .current()
            .await
            .filter(|s| s.is_alive())
            .ok_or_else(|| Error::Connection("no kernel is running".to_string()))?;
        self.attach_notebook(&session)
            .await
            .map_err(Error::into_connection)
    }

    async fn attach_notebook(&self, session: &KernelSession) -> Result<Url> {
        #[derive(Deserialize)]
        struct ContentsModel {
            path: String,
        }

        let endpoint = session.endpoint();
        let contents_url = endpoint
            .join("api/contents")
            .map_err(|e| Error::Connection(e.to_string()))?;
        let created = self
            .http
            .post(contents_url)
            .json(&serde_json::json!({ "type": "notebook", "format": "json" }))
            .send()
            .await?
            .error_for_status()?
            .json::<ContentsModel>()
            .await?;

        let name = created
            .path
            .rsplit('/')
            .next()
            .unwrap_or(&created.path)
            .to_string();
        let sessions_url = endpoint
            .join("api/sessions")
            .map_err(|e| Error::Connection(e.to_string()))?;
        self.http
            .post(sessions_url)
            .json(&serde_json::json!({
                "kernel": { "id": session.id() },
                "name": name,
                "path": created.path,
                "type": "notebook",
            }))
            .send()
            .await?
            .error_for_status()?;

        notebook_url(endpoint, &created.path)
    }
}
