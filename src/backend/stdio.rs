use anyhow::{Context, Result};
use rmcp::{ServiceExt, model::*, service::RunningService};
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::Connection;

/// A stdio child-process MCP connection.
///
/// Spawns the child directly to retain the `Child` handle for process-group
/// cleanup and crash detection.
pub struct StdioConnection {
    name: String,
    /// Command line: program followed by its arguments.
    command: Vec<String>,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    child: RwLock<Option<tokio::process::Child>>,
    alive: AtomicBool,
}

impl StdioConnection {
    pub fn new(name: String, command: Vec<String>) -> Self {
        Self {
            name,
            command,
            service: RwLock::new(None),
            child: RwLock::new(None),
            alive: AtomicBool::new(false),
        }
    }

    /// Kill the child's entire process group (unix), falling back to killing
    /// just the child.
    async fn kill_child(&self, child: &mut tokio::process::Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // Negative PID targets the whole group.
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret == 0 {
                debug!(backend = %self.name, pid, "sent SIGTERM to process group");
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            } else {
                warn!(backend = %self.name, pid, "failed to signal process group, killing child directly");
            }
        }
        let _ = child.kill().await;
    }
}

#[async_trait::async_trait]
impl Connection for StdioConnection {
    async fn connect(&self) -> Result<()> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow::anyhow!("stdio backend '{}' has no command", self.name))?;

        let mut cmd = Command::new(program);
        if self.command.len() > 1 {
            cmd.args(&self.command[1..]);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        // Each child in its own process group for clean kill-group cleanup.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn backend '{}'", self.name))?;
        let pid = child.id();
        debug!(backend = %self.name, pid = ?pid, "spawned child process");

        let stdout = child.stdout.take().ok_or_else(|| {
            anyhow::anyhow!("failed to capture stdout from backend '{}'", self.name)
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            anyhow::anyhow!("failed to capture stdin from backend '{}'", self.name)
        })?;

        // rmcp accepts (AsyncRead, AsyncWrite) tuples as IntoTransport.
        let service = ()
            .serve((stdout, stdin))
            .await
            .with_context(|| format!("failed MCP handshake with backend '{}'", self.name))?;

        if let Some(peer) = service.peer_info() {
            info!(
                backend = %self.name,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "stdio MCP handshake complete"
            );
        }

        *self.service.write().await = Some(service);
        *self.child.write().await = Some(child);
        self.alive.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.alive.store(false, Ordering::Release);

        let mut guard = self.service.write().await;
        if let Some(service) = guard.take()
            && let Err(e) = service.cancel().await
        {
            error!(backend = %self.name, error = %e, "error cancelling stdio service");
        }
        drop(guard);

        let mut child_guard = self.child.write().await;
        if let Some(mut child) = child_guard.take() {
            self.kill_child(&mut child).await;
        }

        info!(backend = %self.name, "stdio backend stopped");
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<rmcp::model::Tool>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("stdio backend '{}' not connected", self.name))?;
        service
            .list_all_tools()
            .await
            .map_err(|e| anyhow::anyhow!("tools/list on '{}' failed: {e}", self.name))
    }

    async fn call_tool(&self, tool_name: &str, args: Option<Value>) -> Result<CallToolResult> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("stdio backend '{}' not connected", self.name))?;

        let params = CallToolRequestParams {
            meta: None,
            name: tool_name.to_string().into(),
            arguments: args.and_then(|v| v.as_object().cloned()),
            task: None,
        };

        debug!(backend = %self.name, tool = %tool_name, "calling tool via stdio");
        service
            .call_tool(params)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    fn connected(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}
