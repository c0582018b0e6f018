//! docket CLI - run code fragments against a live Jupyter kernel.

mod colors;
mod exec;
mod output;
mod shell;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use docket_core::RunnerConfig;

#[derive(Parser)]
#[command(name = "docket")]
#[command(about = "Run Python and SQL fragments against a live Jupyter kernel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace root holding the virtual environment (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Virtual environment directory, relative to the root
    #[arg(long, global = true)]
    venv_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one fragment and print its result block
    Exec {
        /// File holding the fragment (reads stdin when omitted)
        file: Option<PathBuf>,

        /// Treat the fragment as a SQL query
        #[arg(long)]
        sql: bool,

        /// Run the fragment as-is, without capturing its trailing expression
        #[arg(long)]
        verbatim: bool,
    },

    /// Interactive shell; state persists across fragments
    Shell,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format docket-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(docket_err) = err.downcast_ref::<docket_core::Error>() {
            anyhow::anyhow!("{}", docket_err.with_hint())
        } else {
            err
        }
    };

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let mut config = RunnerConfig::for_workspace(root);
    if let Some(venv_dir) = cli.venv_dir {
        config = config.with_venv_dir(venv_dir);
    }

    match cli.command {
        Commands::Exec {
            file,
            sql,
            verbatim,
        } => {
            exec::execute(config, file.as_deref(), sql, verbatim)
                .await
                .map_err(format_error)?;
        }

        Commands::Shell => {
            shell::execute(config).await.map_err(format_error)?;
        }
    }

    Ok(())
}
