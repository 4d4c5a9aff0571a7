//! Process lifecycle manager — keeps a session's running agent processes in
//! line with its single active workflow.
//!
//! `activate(session, workflow)`:
//!   1. Resolve the workflow, its agents and every run/stop command. Any
//!      unknown name fails here, before a process is touched.
//!   2. Stop every agent the session is running (best effort; failures are
//!      logged, not escalated).
//!   3. Launch one process per `(agent, input_topic, output_topic)` slot.
//!      If a launch fails, the processes launched so far are stopped again
//!      and the session is left with no active workflow.
//!   4. Record the launched processes on the session.
//!
//! There is no health check after launch.

pub mod shell;

pub use shell::{ShellLauncher, ShellProcess};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::BrokerConfig;
use crate::error::{MeshError, MeshResult};
use crate::registry::{Registry, TemplateContext};
use crate::session::{RunningAgent, Session};
use crate::worker::TopicBinding;

/// Everything needed to start (and later stop) one agent slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub agent: String,
    pub slot: usize,
    pub container: String,
    pub binding: TopicBinding,
    pub run_command: String,
    pub stop_command: String,
}

/// A launched agent process.
#[async_trait]
pub trait AgentProcess: Send + Sync {
    /// Human-readable identity for logs (container name, pid, ...).
    fn describe(&self) -> String;

    fn is_running(&mut self) -> bool;

    /// Ask the process to stop, waiting up to `grace` before forcing it.
    async fn terminate(&mut self, grace: Duration) -> MeshResult<()>;
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> MeshResult<Box<dyn AgentProcess>>;
}

pub struct LifecycleManager {
    registry: Arc<Registry>,
    launcher: Arc<dyn ProcessLauncher>,
    broker: BrokerConfig,
    stop_grace: Duration,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<Registry>,
        launcher: Arc<dyn ProcessLauncher>,
        broker: BrokerConfig,
        stop_grace: Duration,
    ) -> Self {
        Self {
            registry,
            launcher,
            broker,
            stop_grace,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Resolve and render every slot of `workflow` for `user_id`.
    pub fn plan(&self, workflow: &str, user_id: u32) -> MeshResult<Vec<LaunchSpec>> {
        let definition = self.registry.workflow(workflow)?;
        definition
            .slots(user_id)
            .into_iter()
            .map(|slot| {
                let agent = self.registry.agent(&slot.agent)?;
                let ctx = TemplateContext {
                    name: &agent.name,
                    image: &agent.image_ref,
                    slot: slot.index,
                    broker: &self.broker.host,
                    port: self.broker.port,
                    user_id,
                    input_topic: &slot.binding.input_topic,
                    output_topic: &slot.binding.output_topic,
                };
                Ok(LaunchSpec {
                    agent: agent.key.clone(),
                    slot: slot.index,
                    container: ctx.container(),
                    run_command: agent.run_template.render_shell(&ctx),
                    stop_command: agent.stop_template.render_shell(&ctx),
                    binding: slot.binding,
                })
            })
            .collect()
    }

    /// Make `workflow` the session's only active workflow.
    pub async fn activate(&self, session: &mut Session, workflow: &str) -> MeshResult<()> {
        let plan = self.plan(workflow, session.user_id())?;

        tracing::info!(
            "[Lifecycle] Activating '{}' for user {} ({} agent(s))",
            workflow,
            session.user_id(),
            plan.len()
        );

        self.stop_all(session).await;

        let mut launched: Vec<RunningAgent> = Vec::with_capacity(plan.len());
        for spec in plan {
            tracing::info!("[Lifecycle] Launching {} (slot {})", spec.container, spec.slot);
            tracing::debug!("[Lifecycle] $ {}", spec.run_command);
            match self.launcher.launch(&spec).await {
                Ok(process) => launched.push(RunningAgent {
                    agent: spec.agent,
                    slot: spec.slot,
                    container: spec.container,
                    binding: spec.binding,
                    process,
                }),
                Err(e) => {
                    tracing::error!(
                        "[Lifecycle] Launch of {} failed: {}; rolling back {} agent(s)",
                        spec.container,
                        e,
                        launched.len()
                    );
                    self.stop_agents(&mut launched).await;
                    return Err(MeshError::Lifecycle(format!(
                        "failed to launch '{}' for workflow '{}': {}",
                        spec.agent, workflow, e
                    )));
                }
            }
        }

        session.running_agents = launched;
        session.active_workflow = Some(workflow.to_string());
        Ok(())
    }

    /// Stop everything and leave the session without an active workflow.
    pub async fn deactivate(&self, session: &mut Session) {
        self.stop_all(session).await;
    }

    /// Stop every agent and consume the session.
    pub async fn shutdown(&self, mut session: Session) {
        tracing::info!("[Lifecycle] Shutting down session {}", session.id());
        self.stop_all(&mut session).await;
    }

    async fn stop_all(&self, session: &mut Session) {
        if let Some(previous) = session.active_workflow.take() {
            tracing::info!("[Lifecycle] Stopping workflow '{}'", previous);
        }
        let mut agents = std::mem::take(&mut session.running_agents);
        self.stop_agents(&mut agents).await;
    }

    /// Stops in reverse launch order.
    async fn stop_agents(&self, agents: &mut Vec<RunningAgent>) {
        while let Some(mut agent) = agents.pop() {
            let name = agent.process.describe();
            match agent.process.terminate(self.stop_grace).await {
                Ok(()) => tracing::info!("[Lifecycle] Stopped {}", name),
                Err(e) => tracing::warn!("[Lifecycle] Failed to stop {}: {}", name, e),
            }
        }
    }
}
