//! Launches agents by running their rendered command through the system
//! shell (`sh -c`, or `cmd /C` on Windows).
//!
//! With the default docker templates the launched command exits as soon as
//! the container is started detached; stopping runs the stop command. For
//! templates that run the agent in the foreground the child itself is the
//! agent and is killed if the stop command does not end it in time.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use super::{AgentProcess, LaunchSpec, ProcessLauncher};
use crate::error::{MeshError, MeshResult};

#[derive(Debug, Clone, Default)]
pub struct ShellLauncher;

impl ShellLauncher {
    pub fn new() -> Self {
        Self
    }
}

fn shell_command(line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(line);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(line);
        cmd
    }
}

#[async_trait]
impl ProcessLauncher for ShellLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> MeshResult<Box<dyn AgentProcess>> {
        let mut child = shell_command(&spec.run_command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                MeshError::Lifecycle(format!("failed to spawn '{}': {}", spec.container, e))
            })?;

        if let Some(stderr) = child.stderr.take() {
            let name = spec.container.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::debug!("[Lifecycle:{} stderr] {}", name, line);
                    }
                }
            });
        }

        tracing::debug!(
            "[Lifecycle] Spawned {} (pid {:?})",
            spec.container,
            child.id()
        );

        Ok(Box::new(ShellProcess {
            container: spec.container.clone(),
            stop_command: spec.stop_command.clone(),
            child: Some(child),
        }))
    }
}

pub struct ShellProcess {
    container: String,
    stop_command: String,
    child: Option<Child>,
}

impl ShellProcess {
    async fn run_stop_command(&self, grace: Duration) -> MeshResult<()> {
        if self.stop_command.trim().is_empty() {
            return Ok(());
        }
        let mut cmd = shell_command(&self.stop_command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match tokio::time::timeout(grace, cmd.status()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(MeshError::Lifecycle(format!(
                "stop command for {} exited with {}",
                self.container, status
            ))),
            Ok(Err(e)) => Err(MeshError::Lifecycle(format!(
                "failed to run stop command for {}: {}",
                self.container, e
            ))),
            Err(_) => Err(MeshError::Lifecycle(format!(
                "stop command for {} did not finish within {}s",
                self.container,
                grace.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl AgentProcess for ShellProcess {
    fn describe(&self) -> String {
        self.container.clone()
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn terminate(&mut self, grace: Duration) -> MeshResult<()> {
        let stopped = self.run_stop_command(grace).await;

        if let Some(mut child) = self.child.take() {
            let exited = matches!(
                tokio::time::timeout(grace, child.wait()).await,
                Ok(Ok(_))
            );
            if !exited {
                tracing::warn!("[Lifecycle] {} still running after {}s, killing", self.container, grace.as_secs());
                child.kill().await?;
            }
        }
        stopped
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::worker::TopicBinding;

    fn spec(run: &str, stop: &str) -> LaunchSpec {
        LaunchSpec {
            agent: "chat".to_string(),
            slot: 0,
            container: "chat-u1-0".to_string(),
            binding: TopicBinding::new("1/in", "1/out"),
            run_command: run.to_string(),
            stop_command: stop.to_string(),
        }
    }

    #[tokio::test]
    async fn test_foreground_process_is_killed_after_grace() {
        let mut process = ShellLauncher
            .launch(&spec("sleep 30", "true"))
            .await
            .unwrap();
        assert!(process.is_running());
        process.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_failing_stop_command_is_reported() {
        let mut process = ShellLauncher
            .launch(&spec("true", "exit 3"))
            .await
            .unwrap();
        let err = process.terminate(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, MeshError::Lifecycle(_)));
    }
}
