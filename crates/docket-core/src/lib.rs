//! Core engine for docket, an interactive code runner backed by Jupyter.
//!
//! This crate provides:
//! - Supervision of a local Jupyter server process
//! - Kernel session management over the REST and channels APIs
//! - Fragment transformation so trailing expressions are captured
//! - Collection of kernel messages into a single execution outcome
//! - Formatting of outcomes as insertable blocks

pub mod config;
pub mod error;
pub mod format;
pub mod handler;
pub mod outcome;
pub mod protocol;
pub mod runner;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod transform;

pub use config::{RunnerConfig, ServerLaunch};
pub use error::{Error, Result};
pub use format::{Insertion, format, format_payload, insertion_text};
pub use handler::{Inbound, RequestCollector};
pub use outcome::{ExecutionOutcome, Payload, Table};
pub use protocol::{KernelEvent, KernelMessage, WireMessage};
pub use runner::{ExecutionRequest, Runner};
pub use session::{KernelSession, SessionManager, SessionState};
pub use status::{StatusSink, TracingSink};
pub use supervisor::{ProcessSupervisor, ServerState};
pub use transform::{CodeTransform, ExpressionProbe, Language, PythonProbe, SourceSpan};
