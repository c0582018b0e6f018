//! Execution protocol handling.
//!
//! Reassembles the ordered message stream of one execute request into a
//! single [`ExecutionOutcome`].
//!
//! # Request state machine
//!
//! ```text
//! Sent ──begin──► Collecting ──error / reply error──────► Done (Failure)
//!                     │      ──idle──────────────────────► Done (Value | NoResult)
//!                     │      ──settled without idle──────► Done (Value | NoResult)
//!                     └──────abandoned (session restart)─► Done (Failure)
//! ```
//!
//! Messages are consumed strictly in arrival order, so an `error` that
//! arrives before the idle status always wins over a buffered result.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::outcome::{ExecutionOutcome, Payload};
use crate::protocol::{ExecutionState, KernelEvent, MimeBundle};
use crate::status::StatusSink;

/// Item on a request's inbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A kernel message answering this request.
    Message(KernelEvent),
    /// The transport finished with this request without further messages.
    Settled,
    /// The session was discarded while the request was in flight.
    Abandoned(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Sent,
    Collecting,
    Done,
}

/// Collects one request's messages into an outcome. Resolves exactly once.
pub struct RequestCollector<'a> {
    state: RequestState,
    result_seen: bool,
    candidate: Option<Payload>,
    sink: &'a dyn StatusSink,
}

impl<'a> RequestCollector<'a> {
    pub fn new(sink: &'a dyn StatusSink) -> Self {
        Self {
            state: RequestState::Sent,
            result_seen: false,
            candidate: None,
            sink,
        }
    }

    /// Mark the request as submitted and start collecting.
    pub fn begin(&mut self) {
        if self.state == RequestState::Sent {
            self.state = RequestState::Collecting;
        }
    }

    /// Whether an outcome has already been produced.
    pub fn is_done(&self) -> bool {
        self.state == RequestState::Done
    }

    /// Feed one inbound item. Returns the outcome when this item resolves
    /// the request; anything arriving after that is ignored.
    pub fn handle(&mut self, inbound: Inbound) -> Option<ExecutionOutcome> {
        if self.state == RequestState::Done {
            tracing::debug!("Ignoring message after resolution: {:?}", inbound);
            return None;
        }
        self.begin();

        match inbound {
            Inbound::Message(event) => self.dispatch(event),
            Inbound::Settled => {
                if self.candidate.is_none() {
                    tracing::warn!("Request settled without an idle status or result");
                    self.sink.log("Execution completed with no result.");
                } else {
                    tracing::warn!("Request settled without an idle status");
                }
                Some(self.finish())
            }
            Inbound::Abandoned(reason) => {
                self.sink.log(&format!("Request abandoned: {}", reason));
                Some(self.fail(reason))
            }
        }
    }

    fn dispatch(&mut self, event: KernelEvent) -> Option<ExecutionOutcome> {
        match event {
            KernelEvent::ExecuteResult(bundle) | KernelEvent::DisplayData(bundle) => {
                self.capture(&bundle);
                None
            }
            KernelEvent::Stream { name, text } => {
                self.sink.log(&format!("Stream ({}): {}", name, text.trim()));
                None
            }
            KernelEvent::Error(error) => {
                self.sink.log(&format!("Error: {}: {}", error.ename, error.evalue));
                let message = if !error.evalue.is_empty() {
                    error.evalue
                } else if !error.ename.is_empty() {
                    error.ename
                } else {
                    "An unknown error occurred.".to_string()
                };
                Some(self.fail(message))
            }
            KernelEvent::ExecuteReply(reply) if reply.is_error() => {
                let message = reply
                    .evalue
                    .filter(|m| !m.is_empty())
                    .or(reply.ename)
                    .unwrap_or_else(|| "An unknown error occurred.".to_string());
                self.sink.log(&format!("Reply error: {}", message));
                Some(self.fail(message))
            }
            KernelEvent::ExecuteReply(reply) => {
                tracing::debug!("Execute reply: {}", reply.status);
                None
            }
            KernelEvent::Status(state) => {
                self.sink.log(&format!("Kernel status: {:?}", state));
                (state == ExecutionState::Idle).then(|| self.finish())
            }
            KernelEvent::Other(kind) => {
                tracing::debug!("Ignoring {} message", kind);
                None
            }
        }
    }

    /// Record a result or display bundle as the candidate payload.
    fn capture(&mut self, bundle: &MimeBundle) {
        self.result_seen = true;

        if let Some(html) = bundle.text_html() {
            let text = html_to_text(&html);
            if !text.is_empty() {
                self.sink.log(&format!("HTML Output (text): {}", text));
            }
        }

        match bundle.text_plain() {
            Some(text) => {
                self.sink.log(&format!("Text Output: {}", text));
                self.candidate = Some(parse_text_result(&text));
            }
            None if bundle.text_html().is_none() => {
                let data = serde_json::to_string(&bundle.data).unwrap_or_default();
                self.sink.log(&format!("Other Output: {}", data));
            }
            None => {}
        }
    }

    fn finish(&mut self) -> ExecutionOutcome {
        self.state = RequestState::Done;
        match self.candidate.take() {
            Some(payload) => ExecutionOutcome::Value(payload),
            None => {
                if self.result_seen {
                    tracing::debug!("Result seen without a textual representation");
                }
                ExecutionOutcome::NoResult
            }
        }
    }

    fn fail(&mut self, message: String) -> ExecutionOutcome {
        self.state = RequestState::Done;
        self.candidate = None;
        ExecutionOutcome::Failure(message)
    }
}

/// Consume a request's stream until it resolves.
///
/// A stream that closes without any terminal item counts as settled.
pub async fn collect(
    rx: &mut mpsc::UnboundedReceiver<Inbound>,
    sink: &dyn StatusSink,
) -> ExecutionOutcome {
    let mut collector = RequestCollector::new(sink);
    collector.begin();

    while let Some(inbound) = rx.recv().await {
        if let Some(outcome) = collector.handle(inbound) {
            return outcome;
        }
    }

    collector
        .handle(Inbound::Settled)
        .unwrap_or(ExecutionOutcome::NoResult)
}

/// Interpret the plain-text representation of a result.
///
/// Quoted Python string reprs are unwrapped first. Text that is not JSON is
/// kept as-is.
pub fn parse_text_result(text: &str) -> Payload {
    let unquoted = unquote_python_repr(text);
    let candidate = unquoted.as_deref().unwrap_or(text);
    match serde_json::from_str::<Value>(candidate) {
        Ok(value) => Payload::from_json(value),
        Err(e) => {
            tracing::debug!("Result is not JSON ({}), keeping raw text", e);
            Payload::from_text(text)
        }
    }
}

/// Undo Python's `repr()` of a `str`, if `text` is one.
pub fn unquote_python_repr(text: &str) -> Option<String> {
    let quote = text.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    if text.len() < 2 || !text.ends_with(quote) {
        return None;
    }
    let inner = &text[1..text.len() - 1];

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(kind @ ('x' | 'u' | 'U')) => {
                let width = match kind {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let digits: String = chars.by_ref().take(width).collect();
                let decoded = u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32)?;
                out.push(decoded);
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    Some(out)
}

/// Reduce HTML to its text content for logging.
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }

    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
