//! Kernel messaging protocol.
//!
//! Jupyter kernel messages as they travel over the server's channels
//! WebSocket. Frames are JSON objects with `header`, `parent_header`,
//! `metadata`, `content` and `channel`; the free-form `content` is decoded
//! into [`KernelEvent`] here so nothing past this module handles untyped
//! payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Protocol version sent in request headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default)]
    pub version: String,
}

/// Reference to the request a message answers. Empty (`{}`) on requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParentHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
}

/// A raw message frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub header: Header,
    #[serde(default)]
    pub parent_header: ParentHeader,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub buffers: Vec<Value>,
}

impl WireMessage {
    /// Build an `execute_request` for `code` on the shell channel.
    pub fn execute_request(session_id: &str, code: &str) -> Self {
        Self {
            header: Header {
                msg_id: uuid::Uuid::new_v4().to_string(),
                msg_type: "execute_request".to_string(),
                session: session_id.to_string(),
                username: "docket".to_string(),
                date: None,
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: ParentHeader::default(),
            metadata: serde_json::json!({}),
            content: serde_json::json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
            channel: Some("shell".to_string()),
            buffers: Vec::new(),
        }
    }

    /// Message ID of this frame.
    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Kernel execution state carried by `status` messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
    Other(String),
}

impl From<&str> for ExecutionState {
    fn from(s: &str) -> Self {
        match s {
            "busy" => Self::Busy,
            "idle" => Self::Idle,
            "starting" => Self::Starting,
            other => Self::Other(other.to_string()),
        }
    }
}

/// MIME bundle of a `display_data` or `execute_result` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MimeBundle {
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: Value,
}

impl MimeBundle {
    /// Build a bundle with a single `text/plain` representation.
    pub fn plain(text: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert("text/plain".to_string(), Value::String(text.into()));
        Self {
            data,
            metadata: serde_json::json!({}),
        }
    }

    /// The `text/plain` representation.
    pub fn text_plain(&self) -> Option<String> {
        self.text("text/plain")
    }

    /// The `text/html` representation.
    pub fn text_html(&self) -> Option<String> {
        self.text("text/html")
    }

    /// Text content for `mime`, joining nbformat-style line lists.
    fn text(&self, mime: &str) -> Option<String> {
        match self.data.get(mime)? {
            Value::String(s) => Some(s.clone()),
            Value::Array(lines) => Some(
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .concat(),
            ),
            _ => None,
        }
    }
}

/// Content of an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelError {
    #[serde(default)]
    pub ename: String,
    #[serde(default)]
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Content of an `execute_reply` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: String,
    #[serde(default)]
    pub execution_count: Option<u64>,
    #[serde(default)]
    pub ename: Option<String>,
    #[serde(default)]
    pub evalue: Option<String>,
}

impl ExecuteReply {
    /// Whether the reply reports a failed execution.
    pub fn is_error(&self) -> bool {
        self.status == "error"
    }
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: String,
}

#[derive(Deserialize)]
struct StreamContent {
    #[serde(default)]
    name: String,
    #[serde(default)]
    text: String,
}

/// Decoded message kinds the execution handler dispatches on.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    /// Kernel busy/idle transition.
    Status(ExecutionState),
    /// Incremental stdout/stderr text.
    Stream { name: String, text: String },
    /// Rich display output.
    DisplayData(MimeBundle),
    /// Value of the executed code's final expression.
    ExecuteResult(MimeBundle),
    /// Exception raised by the executed code.
    Error(KernelError),
    /// Shell channel reply to the request.
    ExecuteReply(ExecuteReply),
    /// Any message kind the handler ignores.
    Other(String),
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelMessage {
    /// ID of the request this message answers, when present.
    pub parent_msg_id: Option<String>,
    pub event: KernelEvent,
}

impl KernelMessage {
    /// Decode a text frame.
    pub fn decode(frame: &str) -> Result<Self> {
        let wire: WireMessage = serde_json::from_str(frame)?;
        Self::from_wire(wire)
    }

    /// Decode the content of a raw frame according to its message type.
    pub fn from_wire(wire: WireMessage) -> Result<Self> {
        let content = wire.content;
        let event = match wire.header.msg_type.as_str() {
            "status" => {
                let status: StatusContent = serde_json::from_value(content)?;
                KernelEvent::Status(ExecutionState::from(status.execution_state.as_str()))
            }
            "stream" => {
                let stream: StreamContent = serde_json::from_value(content)?;
                KernelEvent::Stream {
                    name: stream.name,
                    text: stream.text,
                }
            }
            "display_data" => KernelEvent::DisplayData(serde_json::from_value(content)?),
            "execute_result" => KernelEvent::ExecuteResult(serde_json::from_value(content)?),
            "error" => KernelEvent::Error(serde_json::from_value(content)?),
            "execute_reply" => KernelEvent::ExecuteReply(serde_json::from_value(content)?),
            other => KernelEvent::Other(other.to_string()),
        };

        Ok(Self {
            parent_msg_id: wire.parent_header.msg_id,
            event,
        })
    }

    /// Build a reply frame answering `parent`, as a kernel would send it.
    pub fn reply_frame(parent: &str, msg_type: &str, channel: &str, content: Value) -> WireMessage {
        WireMessage {
            header: Header {
                msg_id: uuid::Uuid::new_v4().to_string(),
                msg_type: msg_type.to_string(),
                session: String::new(),
                username: "kernel".to_string(),
                date: None,
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: ParentHeader {
                msg_id: Some(parent.to_string()),
                msg_type: Some("execute_request".to_string()),
            },
            metadata: serde_json::json!({}),
            content,
            channel: Some(channel.to_string()),
            buffers: Vec::new(),
        }
    }
}
