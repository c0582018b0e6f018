//! Execution server process supervision.
//!
//! Owns the single execution-server subprocess: spawns it on demand, watches
//! its diagnostic stream for the loopback URL it listens on, and terminates
//! it on request.
//!
//! # Lifecycle
//!
//! ```text
//! NotStarted ──ensure_running──► Starting ──URL seen──► Running
//!                                   │                      │
//!                                   │ exit / spawn error   │ stop / exit
//!                                   ▼                      ▼
//!                                 Failed                Stopped
//! ```
//!
//! `Failed` and `Stopped` both allow a fresh start on the next call.

use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::ServerLaunch;
use crate::error::{Error, Result};
use crate::status::StatusSink;

/// How long a terminated server gets to exit before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// How long to keep reading diagnostics after the server exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

static ENDPOINT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"http://127\.0\.0\.1:\d+").expect("endpoint pattern is valid")
});

/// Lifecycle state of the execution server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Starting,
    Running,
    Stopped,
    Failed,
}

/// Startup outcome broadcast to every caller waiting on one launch.
#[derive(Debug, Clone)]
enum Announcement {
    Pending,
    Ready(Url),
    Failed(String),
}

struct Inner {
    state: ServerState,
    endpoint: Option<Url>,
    /// Bumped on every launch so a stale monitor never touches a newer process.
    generation: u64,
    announce: Option<watch::Receiver<Announcement>>,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

/// Supervisor for the execution-server subprocess.
///
/// The supervisor is the only component that starts, stops or replaces the
/// process. Dropping it terminates the process.
pub struct ProcessSupervisor {
    launch: ServerLaunch,
    sink: Arc<dyn StatusSink>,
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Find the loopback URL the server announced in one line of output.
pub fn find_endpoint(line: &str) -> Option<Url> {
    let found = ENDPOINT_PATTERN.find(line)?;
    Url::parse(&format!("{}/", found.as_str())).ok()
}

impl ProcessSupervisor {
    /// Create a supervisor. Nothing is spawned until `ensure_running`.
    pub fn new(launch: ServerLaunch, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            launch,
            sink,
            inner: Arc::new(Mutex::new(Inner {
                state: ServerState::NotStarted,
                endpoint: None,
                generation: 0,
                announce: None,
                stop_tx: None,
                monitor: None,
            })),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        lock(&self.inner).state
    }

    /// Endpoint of the running server, if any.
    pub fn endpoint(&self) -> Option<Url> {
        lock(&self.inner).endpoint.clone()
    }

    /// Return the server endpoint, starting the server first if needed.
    ///
    /// Concurrent callers during startup all wait on the same launch; the
    /// process is spawned once.
    pub async fn ensure_running(&self) -> Result<Url> {
        let mut rx = {
            let mut inner = lock(&self.inner);
            match (inner.state, inner.endpoint.clone(), inner.announce.clone()) {
                (ServerState::Running, Some(endpoint), _) => return Ok(endpoint),
                (ServerState::Starting, _, Some(rx)) => rx,
                _ => self.spawn_locked(&mut inner)?,
            }
        };

        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                Announcement::Ready(endpoint) => return Ok(endpoint),
                Announcement::Failed(message) => return Err(Error::Startup(message)),
                Announcement::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::Startup(
                    "server monitor exited before an endpoint was announced".to_string(),
                ));
            }
        }
    }

    /// Spawn the server process and its monitor task. Caller holds the lock.
    fn spawn_locked(&self, inner: &mut Inner) -> Result<watch::Receiver<Announcement>> {
        self.sink.status("Starting Jupyter server...");
        tracing::info!(
            "Starting execution server: {} {}",
            self.launch.program.display(),
            self.launch.args.join(" ")
        );

        let spawned = Command::new(&self.launch.program)
            .args(&self.launch.args)
            .current_dir(&self.launch.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                inner.state = ServerState::Failed;
                inner.endpoint = None;
                return Err(Error::Startup(format!(
                    "failed to spawn '{}': {}",
                    self.launch.program.display(),
                    e
                )));
            }
        };

        let Some(stderr) = child.stderr.take() else {
            inner.state = ServerState::Failed;
            return Err(Error::Startup("failed to capture server stderr".to_string()));
        };

        let (tx, rx) = watch::channel(Announcement::Pending);
        let (stop_tx, stop_rx) = oneshot::channel();

        inner.generation += 1;
        inner.state = ServerState::Starting;
        inner.endpoint = None;
        inner.announce = Some(rx.clone());
        inner.stop_tx = Some(stop_tx);
        inner.monitor = Some(tokio::spawn(monitor(
            child,
            stderr,
            tx,
            stop_rx,
            self.inner.clone(),
            inner.generation,
            self.sink.clone(),
        )));

        Ok(rx)
    }

    /// Terminate the server if it is starting or running.
    ///
    /// Stopping an already stopped supervisor is a no-op.
    pub async fn stop(&self) {
        let (stop_tx, monitor) = {
            let mut inner = lock(&self.inner);
            match inner.state {
                ServerState::Starting | ServerState::Running => {
                    inner.state = ServerState::Stopped;
                    inner.endpoint = None;
                    inner.announce = None;
                    (inner.stop_tx.take(), inner.monitor.take())
                }
                _ => return,
            }
        };

        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        if let Some(handle) = monitor
            && let Err(e) = handle.await
        {
            tracing::warn!("Server monitor task failed: {}", e);
        }
        self.sink.status("Jupyter server stopped");
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        if let Some(tx) = inner.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

enum Exit {
    Exited(std::io::Result<std::process::ExitStatus>),
    Stopped,
}

/// Scan server output for the endpoint and track the process until it exits.
async fn monitor(
    mut child: Child,
    stderr: ChildStderr,
    tx: watch::Sender<Announcement>,
    mut stop_rx: oneshot::Receiver<()>,
    inner: Arc<Mutex<Inner>>,
    generation: u64,
    sink: Arc<dyn StatusSink>,
) {
    let mut lines = BufReader::new(stderr).lines();
    let mut stderr_open = true;
    let mut announced = false;
    let mut last_line = String::new();

    let exit = loop {
        tokio::select! {
            biased;
            line = lines.next_line(), if stderr_open => match line {
                Ok(Some(line)) => {
                    tracing::debug!("server: {}", line);
                    if !announced && let Some(endpoint) = find_endpoint(&line) {
                        announced = true;
                        {
                            let mut guard = lock(&inner);
                            if guard.generation == generation {
                                guard.state = ServerState::Running;
                                guard.endpoint = Some(endpoint.clone());
                                guard.announce = None;
                            }
                        }
                        sink.status("Jupyter server started");
                        sink.log(&format!("Jupyter server started at {}", endpoint));
                        let _ = tx.send(Announcement::Ready(endpoint));
                    } else if !line.trim().is_empty() {
                        last_line = line;
                    }
                }
                Ok(None) | Err(_) => stderr_open = false,
            },
            status = child.wait() => break Exit::Exited(status),
            _ = &mut stop_rx => break Exit::Stopped,
        }
    };

    match exit {
        Exit::Stopped => {
            terminate(&mut child).await;
            if !announced {
                let _ = tx.send(Announcement::Failed(
                    "server was stopped before it announced an endpoint".to_string(),
                ));
            }
        }
        Exit::Exited(status) => {
            // Output written right before exit may still be buffered.
            if stderr_open {
                let drain = async {
                    while let Ok(Some(line)) = lines.next_line().await {
                        if !line.trim().is_empty() {
                            last_line = line;
                        }
                    }
                };
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
            }
            let status = match status {
                Ok(status) => status.to_string(),
                Err(e) => format!("unknown status ({})", e),
            };
            let mut guard = lock(&inner);
            if guard.generation == generation {
                guard.endpoint = None;
                guard.announce = None;
                guard.stop_tx = None;
                if announced {
                    guard.state = ServerState::Stopped;
                } else {
                    guard.state = ServerState::Failed;
                }
            }
            drop(guard);

            if announced {
                tracing::warn!("Execution server exited: {}", status);
                sink.log(&format!("Jupyter server exited: {}", status));
            } else {
                let mut message =
                    format!("server exited ({}) before announcing an endpoint", status);
                if !last_line.is_empty() {
                    message.push_str(": ");
                    message.push_str(last_line.trim());
                }
                tracing::error!("{}", message);
                let _ = tx.send(Announcement::Failed(message));
            }
        }
    }
}

/// Send a termination signal, then kill if the process lingers.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child, which has not been reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if let Ok(Ok(_)) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            return;
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill execution server: {}", e);
    }
}
