//! Result formatting for document insertion.
//!
//! Tables become a `<DataTable>` block, everything else a `<PyResult>` block.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::outcome::{ExecutionOutcome, Payload, Table};

/// What the caller should insert into the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    /// A formatted block.
    Block(String),
    /// Nothing to insert; execution succeeded without output.
    Nothing,
}

/// Format an outcome for insertion.
///
/// A `Failure` is never formatted; it comes back as `Error::Execution`.
pub fn format(outcome: &ExecutionOutcome) -> Result<Insertion> {
    match outcome {
        ExecutionOutcome::Value(payload) => Ok(Insertion::Block(format_payload(payload))),
        ExecutionOutcome::NoResult => Ok(Insertion::Nothing),
        ExecutionOutcome::Failure(message) => Err(Error::Execution(message.clone())),
    }
}

/// Format a captured payload.
pub fn format_payload(payload: &Payload) -> String {
    match payload {
        Payload::Table(table) => format_table(table),
        Payload::QueryError(message) => format_scalar(&format!("error: {}", message)),
        Payload::Scalar(Value::String(text)) => format_scalar(text),
        Payload::Scalar(value) => format_scalar(&value.to_string()),
    }
}

/// Text to place right after a closing code fence.
pub fn insertion_text(block: &str) -> String {
    format!("\n\n{}", block)
}

fn format_table(table: &Table) -> String {
    let headers = table
        .columns
        .iter()
        .map(|c| Value::String(c.clone()).to_string())
        .collect::<Vec<_>>()
        .join(",");
    let rows = table
        .rows
        .iter()
        .map(|row| Value::Array(row.clone()).to_string())
        .collect::<Vec<_>>()
        .join(",\n    ");

    format!(
        "<DataTable\n  headers={{[\n    {}\n  ]}}\n  rows={{[\n    {}\n  ]}}\n  />",
        headers, rows
    )
}

fn format_scalar(text: &str) -> String {
    format!("<PyResult>\n{}\n</PyResult>", text)
}
