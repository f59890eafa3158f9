//! Electron host process lifecycle.
//!
//! Locates the Electron binary, spawns the host runner with piped stdio, and
//! hands out the [`PeerConnection`] used to wrap the child as a message bus.

use crate::error::{Error, Result};
use crate::transport::PeerConnection;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Configuration for spawning the host process.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Explicit Electron binary path; discovery runs when unset.
    pub electron_path: Option<PathBuf>,
    /// Path to the host runner entry script.
    pub runner: PathBuf,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
}

impl HostConfig {
    /// Creates a config for the given runner script.
    pub fn new(runner: impl Into<PathBuf>) -> Self {
        Self {
            electron_path: None,
            runner: runner.into(),
            env: Vec::new(),
        }
    }
}

/// Locate the Electron executable.
///
/// Search order:
/// 1. `NOCTURNE_ELECTRON` environment variable (runtime override)
/// 2. `electron` on PATH
/// 3. Local then global npm installation (`npm root`, `npm root -g`)
///
/// # Errors
///
/// Returns [`Error::HostNotFound`] if no candidate exists.
pub fn find_electron() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("NOCTURNE_ELECTRON") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            path = %path.display(),
            "NOCTURNE_ELECTRON is set but does not exist; falling back"
        );
    }

    if let Some(path) = try_path_lookup() {
        return Ok(path);
    }

    for global in [false, true] {
        if let Some(path) = try_npm_root(global) {
            return Ok(path);
        }
    }

    Err(Error::HostNotFound)
}

fn try_path_lookup() -> Option<PathBuf> {
    #[cfg(not(windows))]
    let which_cmd = "which";
    #[cfg(windows)]
    let which_cmd = "where";

    let output = std::process::Command::new(which_cmd)
        .arg("electron")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    let path = PathBuf::from(first);
    path.exists().then_some(path)
}

fn try_npm_root(global: bool) -> Option<PathBuf> {
    let mut args = vec!["root"];
    if global {
        args.push("-g");
    }
    let output = std::process::Command::new("npm").args(&args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let npm_root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    electron_in_node_modules(Path::new(&npm_root))
}

fn electron_in_node_modules(node_modules: &Path) -> Option<PathBuf> {
    let dist = node_modules.join("electron").join("dist");
    let candidate = if cfg!(windows) {
        dist.join("electron.exe")
    } else if cfg!(target_os = "macos") {
        dist.join("Electron.app")
            .join("Contents")
            .join("MacOS")
            .join("Electron")
    } else {
        dist.join("electron")
    };
    candidate.exists().then_some(candidate)
}

/// A spawned browser-hosting child process.
#[derive(Debug)]
pub struct HostProcess {
    process: Child,
}

impl HostProcess {
    /// Launches the host runner under Electron.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HostNotFound`] if the Electron binary cannot be
    /// located and [`Error::LaunchFailed`] if the process fails to start or
    /// exits immediately.
    pub async fn launch(config: &HostConfig) -> Result<Self> {
        let electron = match &config.electron_path {
            Some(path) => path.clone(),
            None => find_electron()?,
        };

        let mut cmd = Command::new(&electron);
        cmd.arg(&config.runner)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::LaunchFailed(format!("Failed to spawn process: {e}")))?;

        // Catch binaries that die on startup before we hand out pipes.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(Error::LaunchFailed(format!(
                    "Host process exited immediately with status: {status}"
                )));
            }
            Ok(None) => {}
            Err(e) => {
                return Err(Error::LaunchFailed(format!(
                    "Failed to check process status: {e}"
                )));
            }
        }

        Ok(Self { process: child })
    }

    /// Takes the child's stdio pipes as a peer connection.
    ///
    /// Can only be called once per process.
    pub fn connect(&mut self) -> Result<PeerConnection> {
        let stdin = self
            .process
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("host stdin already taken".to_string()))?;
        let stdout = self
            .process
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("host stdout already taken".to_string()))?;
        Ok(PeerConnection::from_io(stdin, stdout))
    }

    /// Shuts the host down, waiting briefly before escalating to kill.
    pub async fn shutdown(mut self) -> Result<()> {
        #[cfg(windows)]
        {
            // Tokio parks child stdio on a blocking threadpool on Windows;
            // pipes must be closed before kill or the wait can hang.
            drop(self.process.stdin.take());
            drop(self.process.stdout.take());
            drop(self.process.stderr.take());
        }

        self.process
            .kill()
            .await
            .map_err(|e| Error::LaunchFailed(format!("Failed to kill process: {e}")))?;

        match tokio::time::timeout(std::time::Duration::from_secs(5), self.process.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::LaunchFailed(format!(
                "Failed to wait for process: {e}"
            ))),
            Err(_) => {
                let _ = self.process.start_kill();
                Err(Error::LaunchFailed(
                    "Process shutdown timeout after 5 seconds".to_string(),
                ))
            }
        }
    }
}
