//! Orchestrator session: who the user is, which workflow is active and which
//! agent processes are running for it.
//!
//! A `Session` is owned by the orchestrator and only mutated through
//! `&mut` by the lifecycle manager, so two activations on one session can
//! never interleave.

use chrono::{DateTime, Utc};

use crate::lifecycle::AgentProcess;
use crate::worker::TopicBinding;

/// One launched agent process, bound to one workflow slot.
pub struct RunningAgent {
    pub agent: String,
    pub slot: usize,
    pub container: String,
    pub binding: TopicBinding,
    pub process: Box<dyn AgentProcess>,
}

impl std::fmt::Debug for RunningAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningAgent")
            .field("agent", &self.agent)
            .field("slot", &self.slot)
            .field("container", &self.container)
            .field("binding", &self.binding)
            .finish()
    }
}

#[derive(Debug)]
pub struct Session {
    id: String,
    user_id: u32,
    created_at: DateTime<Utc>,
    pub(crate) active_workflow: Option<String>,
    pub(crate) running_agents: Vec<RunningAgent>,
}

impl Session {
    pub fn new(user_id: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            created_at: Utc::now(),
            active_workflow: None,
            running_agents: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn active_workflow(&self) -> Option<&str> {
        self.active_workflow.as_deref()
    }

    pub fn running_agents(&self) -> &[RunningAgent] {
        &self.running_agents
    }

    pub fn is_idle(&self) -> bool {
        self.active_workflow.is_none() && self.running_agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_idle() {
        let a = Session::new(1);
        let b = Session::new(1);
        assert!(a.is_idle());
        assert_eq!(a.user_id(), 1);
        assert_ne!(a.id(), b.id());
    }
}
