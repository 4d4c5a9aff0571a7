//! Agent and workflow registry, loaded once from YAML.
//!
//! `agents.yaml`:
//!
//! ```yaml
//! agents:
//!   chatbot:
//!     name: chatbot_agent
//!     dockerfile_path: agents/config/chatbot.Dockerfile
//!     kind: chat                 # optional: chat | pdf | sheet | train
//!     image: chatbot_agent       # optional, defaults to `name`
//!     run_command: "..."         # optional, defaults to DEFAULT_RUN_COMMAND
//!     stop_command: "..."        # optional, defaults to DEFAULT_STOP_COMMAND
//! ```
//!
//! `workflows.yaml`:
//!
//! ```yaml
//! workflows:
//!   chat:
//!     agents: [chatbot]
//!     input_topics: ["{user_id}/chatbot/input_data"]
//!     output_topics: ["{user_id}/chatbot/output_data"]
//! ```
//!
//! Workflows reference agents by their key in `agents.yaml`. The registry
//! has no mutation API.

pub mod template;

pub use template::{Placeholder, Template, TemplateContext};

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{MeshError, MeshResult};
use crate::worker::{AgentKind, TopicBinding};

pub const DEFAULT_RUN_COMMAND: &str = "docker run --rm -d --network host --name {container} {image} \
--broker {broker} --port {port} --user_id {user_id} \
--input_topic {input_topic} --output_topic {output_topic}";

pub const DEFAULT_STOP_COMMAND: &str = "docker stop {container}";

// ── raw YAML shapes ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AgentsFile {
    #[serde(default)]
    agents: BTreeMap<String, AgentEntry>,
}

#[derive(Debug, Deserialize)]
struct AgentEntry {
    name: String,
    #[serde(default)]
    dockerfile_path: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    kind: Option<AgentKind>,
    #[serde(default)]
    run_command: Option<String>,
    #[serde(default)]
    stop_command: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowsFile {
    #[serde(default)]
    workflows: BTreeMap<String, WorkflowEntry>,
}

#[derive(Debug, Deserialize)]
struct WorkflowEntry {
    agents: Vec<String>,
    input_topics: Vec<String>,
    output_topics: Vec<String>,
    #[serde(default)]
    description: Option<String>,
}

// ── definitions ───────────────────────────────────────────────────────────

/// A launchable agent. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDefinition {
    /// Key under `agents:`; what workflows refer to
    pub key: String,
    /// Base name for containers
    pub name: String,
    pub image_ref: String,
    pub kind: Option<AgentKind>,
    pub dockerfile_path: Option<String>,
    pub run_template: Template,
    pub stop_template: Template,
}

/// A named pipeline; the i-th agent is bound to the i-th topic pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub description: Option<String>,
    pub agents: Vec<String>,
    pub input_topics: Vec<Template>,
    pub output_topics: Vec<Template>,
}

/// One agent slot of a workflow with its topics rendered for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSlot {
    pub index: usize,
    pub agent: String,
    pub binding: TopicBinding,
}

impl WorkflowDefinition {
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// `(agent, input_topic, output_topic)` triples for `user_id`.
    pub fn slots(&self, user_id: u32) -> Vec<WorkflowSlot> {
        self.agents
            .iter()
            .zip(self.input_topics.iter().zip(&self.output_topics))
            .enumerate()
            .map(|(index, (agent, (input, output)))| WorkflowSlot {
                index,
                agent: agent.clone(),
                binding: TopicBinding::new(input.render_topic(user_id), output.render_topic(user_id)),
            })
            .collect()
    }

    /// The topic pair a caller talks to: first slot's input, last slot's output.
    pub fn endpoints(&self, user_id: u32) -> Option<TopicBinding> {
        let input = self.input_topics.first()?;
        let output = self.output_topics.last()?;
        Some(TopicBinding::new(
            input.render_topic(user_id),
            output.render_topic(user_id),
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    agents: BTreeMap<String, AgentDefinition>,
    workflows: BTreeMap<String, WorkflowDefinition>,
}

impl Registry {
    /// Build a registry from the contents of `agents.yaml` and `workflows.yaml`.
    pub fn from_yaml(agents_yaml: &str, workflows_yaml: &str) -> MeshResult<Self> {
        let agents_file: AgentsFile = serde_yaml::from_str(agents_yaml)
            .map_err(|e| MeshError::Configuration(format!("Failed to parse agents YAML: {}", e)))?;
        let workflows_file: WorkflowsFile = serde_yaml::from_str(workflows_yaml).map_err(|e| {
            MeshError::Configuration(format!("Failed to parse workflows YAML: {}", e))
        })?;

        let mut agents = BTreeMap::new();
        for (key, entry) in agents_file.agents {
            let definition = agent_definition(&key, entry)?;
            agents.insert(key, definition);
        }

        let mut workflows = BTreeMap::new();
        for (name, entry) in workflows_file.workflows {
            let definition = workflow_definition(&name, entry)?;
            workflows.insert(name, definition);
        }

        tracing::info!(
            "[Registry] Loaded {} agent(s), {} workflow(s)",
            agents.len(),
            workflows.len()
        );
        Ok(Self { agents, workflows })
    }

    /// Load both files from disk.
    pub fn from_files(agents_path: impl AsRef<Path>, workflows_path: impl AsRef<Path>) -> MeshResult<Self> {
        let agents_path = agents_path.as_ref();
        let workflows_path = workflows_path.as_ref();
        let agents = std::fs::read_to_string(agents_path).map_err(|e| {
            MeshError::Configuration(format!(
                "Failed to read agents file '{}': {}",
                agents_path.display(),
                e
            ))
        })?;
        let workflows = std::fs::read_to_string(workflows_path).map_err(|e| {
            MeshError::Configuration(format!(
                "Failed to read workflows file '{}': {}",
                workflows_path.display(),
                e
            ))
        })?;
        Self::from_yaml(&agents, &workflows)
    }

    pub fn agent(&self, key: &str) -> MeshResult<&AgentDefinition> {
        self.agents
            .get(key)
            .ok_or_else(|| MeshError::Configuration(format!("unknown agent '{}'", key)))
    }

    pub fn workflow(&self, name: &str) -> MeshResult<&WorkflowDefinition> {
        self.workflows
            .get(name)
            .ok_or_else(|| MeshError::Configuration(format!("unknown workflow '{}'", name)))
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.values()
    }

    pub fn workflows(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.workflows.values()
    }

    /// Check that every workflow references known agents. Returns every
    /// problem found, not just the first.
    pub fn validate(&self) -> MeshResult<()> {
        let problems: Vec<String> = self
            .workflows
            .values()
            .flat_map(|wf| {
                wf.agents
                    .iter()
                    .filter(|a| !self.agents.contains_key(a.as_str()))
                    .map(move |a| format!("workflow '{}' references unknown agent '{}'", wf.name, a))
            })
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(MeshError::Configuration(problems.join("; ")))
        }
    }
}

fn agent_definition(key: &str, entry: AgentEntry) -> MeshResult<AgentDefinition> {
    let run = entry.run_command.as_deref().unwrap_or(DEFAULT_RUN_COMMAND);
    let stop = entry.stop_command.as_deref().unwrap_or(DEFAULT_STOP_COMMAND);
    let run_template =
        Template::command(run).map_err(context(format!("agent '{}' run_command", key)))?;
    let stop_template =
        Template::command(stop).map_err(context(format!("agent '{}' stop_command", key)))?;

    Ok(AgentDefinition {
        key: key.to_string(),
        image_ref: entry.image.unwrap_or_else(|| entry.name.clone()),
        name: entry.name,
        kind: entry.kind,
        dockerfile_path: entry.dockerfile_path,
        run_template,
        stop_template,
    })
}

fn context(prefix: String) -> impl FnOnce(MeshError) -> MeshError {
    move |e| match e {
        MeshError::Configuration(message) => MeshError::Configuration(format!("{}: {}", prefix, message)),
        other => other,
    }
}

fn workflow_definition(name: &str, entry: WorkflowEntry) -> MeshResult<WorkflowDefinition> {
    if entry.agents.is_empty() {
        return Err(MeshError::Configuration(format!("workflow '{}' has no agents", name)));
    }
    if entry.agents.len() != entry.input_topics.len() || entry.agents.len() != entry.output_topics.len() {
        return Err(MeshError::Configuration(format!(
            "workflow '{}': {} agent(s) but {} input topic(s) and {} output topic(s)",
            name,
            entry.agents.len(),
            entry.input_topics.len(),
            entry.output_topics.len()
        )));
    }

    let parse_topics = |topics: &[String]| -> MeshResult<Vec<Template>> {
        topics
            .iter()
            .map(|t| Template::topic(t).map_err(context(format!("workflow '{}' topic", name))))
            .collect()
    };

    Ok(WorkflowDefinition {
        name: name.to_string(),
        description: entry.description,
        input_topics: parse_topics(&entry.input_topics)?,
        output_topics: parse_topics(&entry.output_topics)?,
        agents: entry.agents,
    })
}
