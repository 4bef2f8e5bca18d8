use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use mira_core::{IpcCommand, IpcEvent, IpcMessage, IpcMessageContent};

use crate::error::{IpcError, Result};
use crate::process::{LaunchSpec, ProcessHandle};

/// Connection flags for one account, updated from sidecar events.
#[derive(Debug, Default)]
pub struct SessionFlags {
    connected: AtomicBool,
    logged_in: AtomicBool,
}

impl SessionFlags {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::Release);
    }

    fn set_logged_in(&self, value: bool) {
        self.logged_in.store(value, Ordering::Release);
    }
}

#[derive(Debug)]
struct CommandOutcome {
    success: bool,
    data: Option<serde_json::Value>,
    error: Option<String>,
    code: Option<u16>,
}

impl CommandOutcome {
    fn into_result(self) -> Result<Option<serde_json::Value>> {
        if self.success {
            Ok(self.data)
        } else {
            Err(IpcError::Remote {
                code: self.code,
                message: self.error.unwrap_or_else(|| "unknown sidecar error".to_string()),
            })
        }
    }
}

struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<CommandOutcome>>>,
    sessions: Mutex<HashMap<i64, Arc<SessionFlags>>>,
    event_tx: mpsc::Sender<IpcEvent>,
}

impl Shared {
    async fn flags(&self, account_id: i64) -> Arc<SessionFlags> {
        self.sessions
            .lock()
            .await
            .entry(account_id)
            .or_default()
            .clone()
    }

    async fn dispatch_line(&self, line: &str) {
        let Some(message) = IpcMessage::from_line(line) else {
            debug!(line, "Ignoring unparsable sidecar line");
            return;
        };
        match message.content {
            IpcMessageContent::Event(event) => self.dispatch_event(event).await,
            IpcMessageContent::Command(_) => debug!("Ignoring command echoed by sidecar"),
        }
    }

    async fn dispatch_event(&self, event: IpcEvent) {
        match event {
            IpcEvent::CommandResult {
                command_id,
                success,
                data,
                error,
                code,
            } => {
                let waiter = self.pending.lock().await.remove(&command_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(CommandOutcome {
                            success,
                            data,
                            error,
                            code,
                        });
                    }
                    None => debug!(%command_id, "Late or unknown command result dropped"),
                }
                return;
            }
            IpcEvent::Connected { account_id, .. } => {
                let flags = self.flags(account_id).await;
                flags.set_connected(true);
                flags.set_logged_in(true);
            }
            IpcEvent::PairSuccess { account_id, .. } => {
                self.flags(account_id).await.set_logged_in(true);
            }
            IpcEvent::Disconnected { account_id, .. } => {
                self.flags(account_id).await.set_connected(false);
            }
            IpcEvent::LoggedOut { account_id, .. } => {
                let flags = self.flags(account_id).await;
                flags.set_connected(false);
                flags.set_logged_in(false);
            }
            _ => {}
        }

        if self.event_tx.send(event).await.is_err() {
            debug!("Sidecar event receiver dropped");
        }
    }
}

/// Owns the protocol sidecar process and correlates requests with results.
///
/// One sidecar serves every account; commands carry the account id.
pub struct SidecarManager {
    spec: LaunchSpec,
    shared: Arc<Shared>,
    process: Mutex<Option<ProcessHandle>>,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    event_rx: Option<mpsc::Receiver<IpcEvent>>,
}

impl SidecarManager {
    pub fn new(spec: LaunchSpec) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1000);
        Self {
            spec,
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                event_tx,
            }),
            process: Mutex::new(None),
            writer: Mutex::new(None),
            event_rx: Some(event_rx),
        }
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<IpcEvent>> {
        self.event_rx.take()
    }

    /// Runs `bun install` when the sidecar has no `node_modules` yet.
    pub async fn ensure_dependencies(&self) -> Result<()> {
        let dir = &self.spec.working_dir;
        if !dir.join("package.json").exists() {
            return Err(IpcError::BunInstallFailed(format!(
                "package.json not found in {}",
                dir.display()
            )));
        }
        if dir.join("node_modules").exists() {
            return Ok(());
        }

        info!("Installing sidecar dependencies with bun");
        let output = Command::new("bun")
            .arg("install")
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| IpcError::BunInstallFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IpcError::BunInstallFailed(stderr.to_string()));
        }
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        if let Some(handle) = process.as_mut() {
            if matches!(handle.try_wait(), Ok(None)) {
                return Ok(());
            }
            warn!("Sidecar exited, restarting");
        }

        if self.spec.program == "bun" {
            self.ensure_dependencies().await?;
        }

        let (line_tx, mut line_rx) = mpsc::channel::<String>(1000);
        let handle = ProcessHandle::spawn(&self.spec, line_tx).await?;
        *self.writer.lock().await = Some(handle.stdin_sender());
        *process = Some(handle);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                shared.dispatch_line(&line).await;
            }
            // Process gone: nothing will answer the outstanding requests.
            shared.pending.lock().await.clear();
            for flags in shared.sessions.lock().await.values() {
                flags.set_connected(false);
            }
        });

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let handle = self.process.lock().await.take();
        if let Some(mut handle) = handle {
            info!("Stopping sidecar");
            let _ = self.send(IpcCommand::Shutdown).await;
            handle.shutdown(Duration::from_secs(2)).await?;
        }
        *self.writer.lock().await = None;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(handle) => matches!(handle.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Connection flags for `account_id`; created on first use.
    pub async fn session_flags(&self, account_id: i64) -> Arc<SessionFlags> {
        self.shared.flags(account_id).await
    }

    /// Fire-and-forget command.
    pub async fn send(&self, command: IpcCommand) -> Result<()> {
        let message = IpcMessage::new_command(command);
        self.write(&message).await
    }

    /// Sends `command` and waits up to `timeout` for its `CommandResult`.
    pub async fn request(
        &self,
        command: IpcCommand,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>> {
        let message = IpcMessage::new_command(command);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(message.id.clone(), tx);

        if let Err(e) = self.write(&message).await {
            self.shared.pending.lock().await.remove(&message.id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome.into_result(),
            Ok(Err(_)) => Err(IpcError::ChannelClosed),
            Err(_) => {
                self.shared.pending.lock().await.remove(&message.id);
                Err(IpcError::Timeout)
            }
        }
    }

    async fn write(&self, message: &IpcMessage) -> Result<()> {
        if let IpcMessageContent::Command(command) = &message.content {
            let (name, account_id) = command.describe();
            debug!(command = name, account_id = ?account_id, id = %message.id, "Sending IPC command");
        }

        let writer = self.writer.lock().await.clone();
        let writer = writer.ok_or(IpcError::ProcessNotRunning)?;
        writer
            .send(message.to_line())
            .await
            .map_err(|_| IpcError::ChannelClosed)
    }

    #[cfg(test)]
    async fn attach_writer(&self, tx: mpsc::Sender<String>) {
        *self.writer.lock().await = Some(tx);
    }

    #[cfg(test)]
    async fn inject_line(&self, line: &str) {
        self.shared.dispatch_line(line).await;
    }
}
