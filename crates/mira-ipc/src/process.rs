use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::error::{IpcError, Result};

/// How to launch the protocol sidecar.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub working_dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// `bun run index.ts` inside `working_dir`.
    pub fn bun(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            program: "bun".to_string(),
            args: vec!["run".to_string(), "index.ts".to_string()],
        }
    }
}

/// Running sidecar with line pumps on stdin, stdout and stderr.
///
/// Stdout lines go to the `line_tx` given at spawn; stderr is re-logged.
pub struct ProcessHandle {
    child: Child,
    stdin_tx: mpsc::Sender<String>,
}

impl ProcessHandle {
    pub async fn spawn(spec: &LaunchSpec, line_tx: mpsc::Sender<String>) -> Result<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| IpcError::SpawnFailed(format!("{}: {}", spec.program, e)))?;

        let stdout = child.stdout.take().ok_or(IpcError::ProcessNotRunning)?;
        let stderr = child.stderr.take().ok_or(IpcError::ProcessNotRunning)?;
        let stdin = child.stdin.take().ok_or(IpcError::ProcessNotRunning)?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
        tokio::spawn(pump_stdin(stdin, stdin_rx));
        tokio::spawn(pump_stdout(stdout, line_tx));
        tokio::spawn(pump_stderr(stderr));

        tracing::info!(pid = ?child.id(), program = %spec.program, "Sidecar spawned");
        Ok(Self { child, stdin_tx })
    }

    /// Sender feeding the child's stdin. Lines must carry their own newline.
    pub fn stdin_sender(&self) -> mpsc::Sender<String> {
        self.stdin_tx.clone()
    }

    /// Waits up to `grace` for the child to exit on its own, then kills it.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                tracing::info!(status = ?status.ok(), "Sidecar exited");
                Ok(())
            }
            Err(_) => self.child.kill().await.map_err(IpcError::Io),
        }
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child.try_wait().map_err(IpcError::Io)
    }
}

async fn pump_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            tracing::warn!("Sidecar stdin closed");
            break;
        }
    }
}

async fn pump_stdout(stdout: ChildStdout, line_tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if line_tx.send(line).await.is_err() {
            break;
        }
    }
    tracing::warn!("Sidecar stdout closed");
}

async fn pump_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(target: "mira_ipc::sidecar", "{}", line);
    }
}
