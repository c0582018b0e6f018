//! Exec command implementation for docket CLI.
//!
//! Runs a single fragment, prints its result and stops the server.

use std::path::Path;

use anyhow::Context;
use docket_core::{Language, Runner, RunnerConfig};
use tokio::io::AsyncReadExt;

use crate::output::print_outcome;

/// Execute one fragment read from `file` or stdin.
pub async fn execute(
    config: RunnerConfig,
    file: Option<&Path>,
    sql: bool,
    verbatim: bool,
) -> anyhow::Result<()> {
    let code = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut code = String::new();
            tokio::io::stdin()
                .read_to_string(&mut code)
                .await
                .context("failed to read stdin")?;
            code
        }
    };
    let language = if sql {
        Language::Tabular
    } else {
        Language::General
    };

    let runner = Runner::new(config)?;
    let result = runner.run_code(&code, language, !verbatim).await;
    runner.shutdown().await;

    print_outcome(&result?, false)?;
    Ok(())
}
