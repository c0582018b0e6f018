//! The long-lived coordinator.
//!
//! [`Runner`] wires the supervisor, the session manager, the code transform
//! and the protocol handler together behind a single entry point,
//! [`Runner::run_code`].

use std::sync::Arc;

use url::Url;

use crate::config::{RunnerConfig, ServerLaunch};
use crate::error::{Error, Result};
use crate::outcome::ExecutionOutcome;
use crate::session::SessionManager;
use crate::status::{StatusSink, TracingSink};
use crate::supervisor::ProcessSupervisor;
use crate::transform::{CodeTransform, ExpressionProbe, Language, PythonProbe};

/// One fragment to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Raw fragment, before transformation.
    pub code: String,
    pub language: Language,
    /// False when the caller picked an explicit selection to run verbatim.
    pub capture_output: bool,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            capture_output: true,
        }
    }

    pub fn verbatim(mut self) -> Self {
        self.capture_output = false;
        self
    }
}

/// Coordinator owning the server, the active session and the transform.
pub struct Runner<P = PythonProbe> {
    config: RunnerConfig,
    status: Arc<dyn StatusSink>,
    supervisor: Arc<ProcessSupervisor>,
    sessions: SessionManager,
    transform: CodeTransform<P>,
    queue: tokio::sync::Mutex<()>,
}

impl Runner<PythonProbe> {
    /// Runner for a workspace, launching Jupyter from its virtual environment.
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let launch = ServerLaunch::jupyter(&config);
        let probe = PythonProbe::new(config.probe_interpreter());
        Self::with_parts(config, launch, probe, Arc::new(TracingSink))
    }
}

impl<P: ExpressionProbe> Runner<P> {
    /// Runner with an explicit launch command, probe and status sink.
    pub fn with_parts(
        config: RunnerConfig,
        launch: ServerLaunch,
        probe: P,
        status: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        let supervisor = Arc::new(ProcessSupervisor::new(launch, status.clone()));
        let sessions =
            SessionManager::new(supervisor.clone(), config.kernel_name.clone(), status.clone())?;
        Ok(Self {
            config,
            status,
            supervisor,
            sessions,
            transform: CodeTransform::new(probe),
            queue: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Execute a request and return its raw outcome.
    ///
    /// Requests are queued; a request is only sent once the previous one
    /// settled. A kernel failure is returned as `ExecutionOutcome::Failure`.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let _turn = self.queue.lock().await;

        let code = self
            .transform
            .transform(&request.code, request.language, request.capture_output)
            .await;
        tracing::debug!("Transformed {} fragment:\n{}", request.language, code);

        let session = self.sessions.active_session().await?;
        session.execute(&code).await.map_err(Error::into_connection)
    }

    /// Run a fragment and return what it produced.
    ///
    /// Status notices are emitted around the run. A kernel failure comes
    /// back as `Error::Execution` carrying the kernel's message.
    pub async fn run_code(
        &self,
        fragment: &str,
        language: Language,
        capture_output: bool,
    ) -> Result<ExecutionOutcome> {
        self.status
            .status(&format!("Running {} code...", language.display_name()));

        let request = ExecutionRequest {
            code: fragment.to_string(),
            language,
            capture_output,
        };
        let outcome = match self.execute(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.status.status(&e.to_string());
                return Err(e);
            }
        };

        match outcome {
            ExecutionOutcome::Value(_) => self.status.status("success; output inserted"),
            ExecutionOutcome::NoResult => self.status.status("success; no output"),
            ExecutionOutcome::Failure(message) => {
                self.status.status(&format!("error: {}", message));
                return Err(Error::Execution(message));
            }
        }
        Ok(outcome)
    }

    /// Replace the active session with a fresh kernel.
    pub async fn restart(&self) -> Result<()> {
        self.sessions.restart().await?;
        Ok(())
    }

    /// URL of a notebook attached to the active kernel.
    pub async fn notebook_url(&self) -> Result<Url> {
        self.sessions.notebook_url().await
    }

    /// Shut down the kernel and stop the server.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        self.supervisor.stop().await;
    }
}
