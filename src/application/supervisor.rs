use crate::config::{BackendConfig, TransportKind};
use futures::future::join_all;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn backend '{backend}': {source}")]
    Spawn {
        backend: String,
        #[source]
        source: std::io::Error,
    },
    #[error("backend '{backend}' did not expose its {stream} pipe")]
    MissingPipe {
        backend: String,
        stream: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Ready,
    Terminating,
    Terminated,
}

/// A launched backend. Owns the OS process handle; for stdio-transport
/// backends it also holds the protocol pipes until a session takes them.
pub struct BackendProcess {
    key: String,
    child: Child,
    state: ProcessState,
    stdio: Option<(ChildStdin, ChildStdout)>,
}

impl BackendProcess {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Takes the stdin/stdout protocol pipes of a stdio-transport backend.
    /// Returns `None` for TCP backends or after the pipes were taken.
    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        self.stdio.take()
    }

    /// Sends a termination signal, waits a bounded grace window, then forces
    /// a kill so this always returns. Idempotent: a terminated process is a
    /// no-op with no duplicate side effect.
    pub async fn terminate(&mut self) {
        if matches!(self.state, ProcessState::Terminated) {
            return;
        }
        self.state = ProcessState::Terminating;
        debug!(backend = %self.key, "terminating backend process");

        if let Err(err) = self.child.start_kill() {
            debug!(
                backend = %self.key,
                %err,
                "failed to signal backend process (may have already exited)"
            );
        }

        match timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(backend = %self.key, %status, "backend process exited");
            }
            Ok(Err(err)) => {
                warn!(backend = %self.key, %err, "failed to reap backend process");
            }
            Err(_) => {
                warn!(
                    backend = %self.key,
                    "backend did not exit within the grace window; forcing kill"
                );
                let _ = self.child.kill().await;
            }
        }

        self.state = ProcessState::Terminated;
        info!(backend = %self.key, "backend process terminated");
    }
}

/// Launches a backend from its descriptor: merges transport flags into the
/// argument list when absent, spawns with the merged environment, drains
/// diagnostic output without blocking, then waits the configured readiness
/// window. Readiness is a fixed wait, not a port probe; a caller racing the
/// window sees a retryable connection failure at the session layer.
pub async fn launch(config: &BackendConfig) -> Result<BackendProcess, LaunchError> {
    let args = merge_transport_args(config);

    let mut command = Command::new(&config.command);
    command.args(&args).stderr(Stdio::piped());
    match config.transport {
        TransportKind::Stdio => {
            command.stdin(Stdio::piped()).stdout(Stdio::piped());
        }
        TransportKind::Tcp => {
            command.stdin(Stdio::null()).stdout(Stdio::piped());
        }
    }
    if let Some(dir) = &config.workdir {
        command.current_dir(dir);
    }
    for (key, value) in &config.env {
        command.env(key, value);
    }
    // Backstop for error paths: the process dies with us even if terminate
    // is never reached.
    command.kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        backend: config.key.clone(),
        source,
    })?;

    let stderr = child.stderr.take().ok_or_else(|| LaunchError::MissingPipe {
        backend: config.key.clone(),
        stream: "stderr",
    })?;
    drain_diagnostics(config.key.clone(), "stderr", stderr);

    let stdio = match config.transport {
        TransportKind::Stdio => {
            let stdin = child.stdin.take().ok_or_else(|| LaunchError::MissingPipe {
                backend: config.key.clone(),
                stream: "stdin",
            })?;
            let stdout = child.stdout.take().ok_or_else(|| LaunchError::MissingPipe {
                backend: config.key.clone(),
                stream: "stdout",
            })?;
            Some((stdin, stdout))
        }
        TransportKind::Tcp => {
            let stdout = child.stdout.take().ok_or_else(|| LaunchError::MissingPipe {
                backend: config.key.clone(),
                stream: "stdout",
            })?;
            drain_diagnostics(config.key.clone(), "stdout", stdout);
            None
        }
    };

    info!(
        backend = %config.key,
        command = %config.command.display(),
        transport = config.transport.as_str(),
        wait_ms = config.readiness_wait.as_millis() as u64,
        "backend launched; waiting readiness window"
    );
    sleep(config.readiness_wait).await;

    Ok(BackendProcess {
        key: config.key.clone(),
        child,
        state: ProcessState::Ready,
        stdio,
    })
}

/// Terminates every launched process, concurrently. Called on success and
/// error paths alike so nothing launched is ever orphaned.
pub async fn terminate_all(processes: &mut [BackendProcess]) {
    join_all(processes.iter_mut().map(|process| process.terminate())).await;
}

fn merge_transport_args(config: &BackendConfig) -> Vec<String> {
    let mut args = config.args.clone();
    if !args.iter().any(|arg| arg == "--transport") {
        args.push("--transport".to_string());
        args.push(config.transport.as_str().to_string());
    }
    if config.transport == TransportKind::Tcp {
        if !args.iter().any(|arg| arg == "--host") {
            args.push("--host".to_string());
            args.push(config.host.clone());
        }
        if !args.iter().any(|arg| arg == "--port") {
            args.push("--port".to_string());
            args.push(config.port.to_string());
        }
    }
    args
}

fn drain_diagnostics(
    backend: String,
    stream: &'static str,
    source: impl AsyncRead + Send + Unpin + 'static,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(source).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(backend = %backend, stream, line = %line.trim_end(), "backend output");
        }
    });
}
