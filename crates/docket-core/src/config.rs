//! Runner configuration.
//!
//! Resolves where the execution server lives and how it is launched.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding the virtual environment directory name.
pub const VENV_DIR_ENV: &str = "DOCKET_VENV_DIR";

/// Default virtual environment directory, relative to the workspace root.
pub const DEFAULT_VENV_DIR: &str = ".venv";

/// Configuration consumed by the runner and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory the server is started in; the virtual environment lives below it.
    pub workspace_root: PathBuf,
    /// Virtual environment directory name.
    pub venv_dir: String,
    /// Kernel spec requested when starting a session.
    pub kernel_name: String,
    /// Interpreter used for the out-of-session expression probe.
    pub probe_python: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            venv_dir: DEFAULT_VENV_DIR.to_string(),
            kernel_name: "python3".to_string(),
            probe_python: "python3".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Create a config rooted at `workspace_root`.
    ///
    /// Honors `DOCKET_VENV_DIR` when set and non-empty.
    pub fn for_workspace(workspace_root: impl AsRef<Path>) -> Self {
        let mut config = Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            ..Self::default()
        };
        if let Ok(dir) = std::env::var(VENV_DIR_ENV)
            && !dir.trim().is_empty()
        {
            config.venv_dir = dir;
        }
        config
    }

    /// Override the virtual environment directory name.
    pub fn with_venv_dir(mut self, venv_dir: impl Into<String>) -> Self {
        self.venv_dir = venv_dir.into();
        self
    }

    /// Path to the virtual environment.
    pub fn venv_path(&self) -> PathBuf {
        self.workspace_root.join(&self.venv_dir)
    }

    /// Path to the `jupyter` executable inside the virtual environment.
    pub fn jupyter_path(&self) -> PathBuf {
        let name = if cfg!(windows) { "jupyter.exe" } else { "jupyter" };
        let bin = if cfg!(windows) { "Scripts" } else { "bin" };
        self.venv_path().join(bin).join(name)
    }

    /// Resolve the probe interpreter.
    ///
    /// Prefers the virtual environment's python, then `probe_python` on PATH.
    pub fn probe_interpreter(&self) -> PathBuf {
        let venv_python = self.venv_path().join("bin").join("python");
        if venv_python.exists() {
            return venv_python;
        }
        which::which(&self.probe_python).unwrap_or_else(|_| PathBuf::from(&self.probe_python))
    }
}

/// The exact command the process supervisor spawns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLaunch {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
}

impl ServerLaunch {
    /// Launch a Jupyter server from the configured virtual environment.
    ///
    /// No browser, no token, no XSRF check, loopback only.
    pub fn jupyter(config: &RunnerConfig) -> Self {
        Self {
            program: config.jupyter_path(),
            args: [
                "notebook",
                "--no-browser",
                "--ip=127.0.0.1",
                "--NotebookApp.token=",
                "--NotebookApp.disable_check_xsrf=True",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            cwd: config.workspace_root.clone(),
        }
    }

    /// Launch an arbitrary command.
    pub fn command(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<String>>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.venv_dir, ".venv");
        assert_eq!(config.kernel_name, "python3");
    }

    #[test]
    fn test_jupyter_launch() {
        let config = RunnerConfig {
            workspace_root: PathBuf::from("/work"),
            ..RunnerConfig::default()
        }
        .with_venv_dir("env");
        let launch = ServerLaunch::jupyter(&config);

        assert!(launch.program.starts_with("/work/env"));
        assert!(launch.program.ends_with("jupyter") || launch.program.ends_with("jupyter.exe"));
        assert_eq!(launch.args[0], "notebook");
        assert!(launch.args.contains(&"--no-browser".to_string()));
        assert!(launch.args.contains(&"--NotebookApp.token=".to_string()));
        assert!(launch.args.contains(&"--NotebookApp.disable_check_xsrf=True".to_string()));
        assert_eq!(launch.cwd, PathBuf::from("/work"));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: RunnerConfig = serde_json::from_str(r#"{"venv_dir": "venv"}"#).unwrap();
        assert_eq!(config.venv_dir, "venv");
        assert_eq!(config.probe_python, "python3");
    }
}
