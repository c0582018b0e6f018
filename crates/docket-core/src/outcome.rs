//! Execution outcomes and captured payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A tabular result: ordered column names and row-major cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    /// Parse the column-oriented wire form (`{"columns": [...], "data": [[...]]}`).
    ///
    /// An `index` member, as written by pandas, is accepted and ignored.
    pub fn from_split_json(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let columns = object
            .get("columns")?
            .as_array()?
            .iter()
            .map(|c| match c {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        let rows = object
            .get("data")?
            .as_array()?
            .iter()
            .map(|row| row.as_array().cloned())
            .collect::<Option<Vec<_>>>()?;
        Some(Self { columns, rows })
    }

    /// Encode in the column-oriented wire form.
    pub fn to_split_json(&self) -> Value {
        let mut object = Map::new();
        object.insert(
            "columns".to_string(),
            Value::Array(self.columns.iter().cloned().map(Value::String).collect()),
        );
        object.insert(
            "data".to_string(),
            Value::Array(self.rows.iter().cloned().map(Value::Array).collect()),
        );
        Value::Object(object)
    }
}

/// A captured value.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured table.
    Table(Table),
    /// Query failure returned as a displayable value (`{"error": ...}`).
    QueryError(String),
    /// Anything else: a parsed JSON value or raw text.
    Scalar(Value),
}

impl Payload {
    /// Classify a parsed JSON value.
    pub fn from_json(value: Value) -> Self {
        if let Some(table) = Table::from_split_json(&value) {
            return Self::Table(table);
        }
        if let Some(object) = value.as_object()
            && object.len() == 1
            && let Some(Value::String(message)) = object.get("error")
        {
            return Self::QueryError(message.clone());
        }
        Self::Scalar(value)
    }

    /// Wrap raw text that did not parse as JSON.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::Scalar(Value::String(text.into()))
    }
}

/// Result of running one fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The fragment produced a value.
    Value(Payload),
    /// Execution completed without producing anything.
    NoResult,
    /// The kernel reported an error, or the request was abandoned.
    Failure(String),
}
