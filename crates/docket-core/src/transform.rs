//! Code transformation for result capture.
//!
//! Rewrites a fragment so the value of its trailing expression is kept in a
//! reserved variable and serialized (tables as column-oriented JSON) instead
//! of being discarded. Whether the last statement is a bare expression is
//! decided by the language's own parser, run out of session through an
//! [`ExpressionProbe`].

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Variable holding the captured trailing expression.
pub const RESULT_VAR: &str = "docket_result";

/// Variable holding the serialized value reported back to the caller.
pub const FINAL_RESULT_VAR: &str = "docket_final_result";

/// Source language of a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    /// General-purpose language (Python).
    General,
    /// Tabular query language (SQL, run through an in-session DuckDB connection).
    Tabular,
}

impl Language {
    /// Human-readable name for status notices.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::General => "Python",
            Self::Tabular => "SQL",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "general" | "python" | "py" => Ok(Self::General),
            "tabular" | "sql" => Ok(Self::Tabular),
            other => Err(format!("unsupported language: {}", other)),
        }
    }
}

/// Location of a statement as reported by Python's `ast`.
///
/// Lines are 1-based; columns are UTF-8 byte offsets within the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SourceSpan {
    pub lineno: usize,
    pub col_offset: usize,
    pub end_lineno: usize,
    pub end_col_offset: usize,
}

/// Decides whether a fragment ends in a bare expression.
pub trait ExpressionProbe: Send + Sync {
    /// Span of the trailing expression statement, or `None` when the last
    /// statement is not a bare expression (or the fragment does not parse).
    fn trailing_expression(&self, code: &str) -> impl Future<Output = Option<SourceSpan>> + Send;
}

const PROBE_SCRIPT: &str = r#"
import ast, json, sys
source = sys.stdin.buffer.read().decode("utf-8")
try:
    tree = ast.parse(source, mode="exec")
except SyntaxError:
    print("null")
else:
    last = tree.body[-1] if tree.body else None
    if isinstance(last, ast.Expr):
        print(json.dumps({
            "lineno": last.lineno,
            "col_offset": last.col_offset,
            "end_lineno": last.end_lineno,
            "end_col_offset": last.end_col_offset,
        }))
    else:
        print("null")
"#;

/// Probe backed by a short-lived Python interpreter.
#[derive(Debug, Clone)]
pub struct PythonProbe {
    interpreter: PathBuf,
}

impl PythonProbe {
    /// Create a probe running `interpreter`.
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    async fn run(&self, code: &str) -> std::io::Result<Option<SourceSpan>> {
        let mut child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(PROBE_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(code.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            tracing::warn!(
                "Expression probe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(serde_json::from_str::<Option<SourceSpan>>(stdout.trim()).unwrap_or_else(|e| {
            tracing::warn!("Unreadable expression probe output {:?}: {}", stdout.trim(), e);
            None
        }))
    }
}

impl ExpressionProbe for PythonProbe {
    async fn trailing_expression(&self, code: &str) -> Option<SourceSpan> {
        match self.run(code).await {
            Ok(span) => span,
            Err(e) => {
                tracing::warn!(
                    "Failed to run expression probe '{}': {}",
                    self.interpreter.display(),
                    e
                );
                None
            }
        }
    }
}

/// Rewrites fragments for capture.
pub struct CodeTransform<P> {
    probe: P,
}

impl<P: ExpressionProbe> CodeTransform<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    /// Rewrite `code` so its value is captured.
    ///
    /// Queries are always wrapped when capturing, unless they hold nothing
    /// but blank or comment lines. A general fragment is returned unchanged
    /// when `capture_output` is false, when its last line is blank or a
    /// comment, or when its last statement is not a bare expression.
    pub async fn transform(&self, code: &str, language: Language, capture_output: bool) -> String {
        if !capture_output {
            return code.to_string();
        }

        match language {
            Language::Tabular if has_query(code) => wrap_tabular(code),
            Language::Tabular => code.to_string(),
            Language::General if !has_trailing_line(code) => code.to_string(),
            Language::General => match self.probe.trailing_expression(code).await {
                Some(span) => match split_at_span(code, span) {
                    Some((prefix, expression)) => wrap_general(prefix, expression),
                    None => {
                        tracing::warn!("Probe span {:?} does not fit the fragment", span);
                        code.to_string()
                    }
                },
                None => code.to_string(),
            },
        }
    }
}

/// Whether the fragment's last line holds something other than a comment.
fn has_trailing_line(code: &str) -> bool {
    code.lines()
        .last()
        .map(str::trim)
        .is_some_and(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Whether a query has any line that is neither blank nor a comment.
fn has_query(query: &str) -> bool {
    query
        .lines()
        .map(str::trim)
        .any(|line| !line.is_empty() && !line.starts_with("--"))
}

/// Byte offset of (1-based line, byte column) within `code`.
fn byte_offset(code: &str, lineno: usize, col: usize) -> Option<usize> {
    let mut line_start = 0;
    for _ in 1..lineno {
        line_start += code[line_start..].find('\n')? + 1;
    }
    let offset = line_start + col;
    (offset <= code.len() && code.is_char_boundary(offset)).then_some(offset)
}

/// Split a fragment structurally into (statements before, trailing expression).
pub fn split_at_span(code: &str, span: SourceSpan) -> Option<(&str, &str)> {
    let start = byte_offset(code, span.lineno, span.col_offset)?;
    let end = byte_offset(code, span.end_lineno, span.end_col_offset)?;
    if end < start {
        return None;
    }
    Some((&code[..start], &code[start..end]))
}

/// Cell re-stringification shared by both wrappers: every cell is rendered
/// through a one-row frame of its column's dtype, so it reads exactly as
/// pandas would print it.
const RENDER_FRAME: &str = r#"def _docket_render(frame):
    def _cell(value, dtype):
        single = _docket_pd.DataFrame({"v": [value]}, dtype=dtype)
        return str(single).split("\n0 ", 1)[1].strip()
    return frame.apply(
        lambda col: col.map(lambda value: _cell(value, frame.dtypes[col.name]))
    ).to_json(orient="split")"#;

/// Wrap a general-purpose fragment whose trailing expression is known.
pub fn wrap_general(prefix: &str, expression: &str) -> String {
    format!(
        r#"import sys as _docket_sys

{prefix}

{result} = (
{expression}
)

_docket_pd = _docket_sys.modules.get("pandas")
if _docket_pd is not None and isinstance({result}, _docket_pd.DataFrame):
    {render}
    {final_result} = _docket_render({result})
else:
    {final_result} = {result}

{final_result}"#,
        prefix = prefix.trim_end(),
        expression = expression.trim(),
        result = RESULT_VAR,
        final_result = FINAL_RESULT_VAR,
        render = RENDER_FRAME.replace('\n', "\n    "),
    )
}

/// Wrap a query so it runs against the session's persistent DuckDB connection.
///
/// Query failures become an `{"error": ...}` value rather than an exception.
pub fn wrap_tabular(query: &str) -> String {
    let literal = serde_json::Value::String(query.to_string()).to_string();
    format!(
        r#"import json as _docket_json
import duckdb as _docket_duckdb
import pandas as _docket_pd

if "_docket_duckdb_connection" not in globals():
    _docket_duckdb_connection = _docket_duckdb.connect(database=":memory:")

{render}

try:
    {final_result} = _docket_render(_docket_duckdb_connection.execute({literal}).fetchdf())
except Exception as _docket_error:
    {final_result} = _docket_json.dumps({{"error": str(_docket_error)}})

{final_result}"#,
        render = RENDER_FRAME,
        final_result = FINAL_RESULT_VAR,
        literal = literal,
    )
}
