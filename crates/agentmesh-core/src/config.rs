//! Runtime configuration for broker connections and the orchestrator.
//!
//! Values come from CLI flags (with environment fallbacks) in the binary;
//! the defaults here match the conventional local setup: a broker on
//! `localhost:1883`, user id 1, `agents.yaml` / `workflows.yaml` in the
//! working directory.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_USER_ID: u32 = 1;

/// Where and how to reach the MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix for generated client ids (`<prefix>-<suffix>`)
    #[serde(default = "default_client_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Largest packet accepted or sent; PDF and model payloads are big.
    #[serde(default = "default_max_packet")]
    pub max_packet_bytes: usize,
}

fn default_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_client_prefix() -> String {
    "agentmesh".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_packet() -> usize {
    64 * 1024 * 1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            client_id_prefix: default_client_prefix(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            max_packet_bytes: default_max_packet(),
        }
    }
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn client_id(&self, suffix: &str) -> String {
        format!("{}-{}", self.client_id_prefix, suffix)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Settings for the orchestrator side: registry files, session identity and
/// the bounds on waiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_agents_path")]
    pub agents_path: String,
    #[serde(default = "default_workflows_path")]
    pub workflows_path: String,
    #[serde(default = "default_user_id")]
    pub user_id: u32,
    /// Upper bound for one `send_and_wait`
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,
    /// How long a stopping agent gets before it is killed
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

fn default_agents_path() -> String {
    "agents.yaml".to_string()
}

fn default_workflows_path() -> String {
    "workflows.yaml".to_string()
}

fn default_user_id() -> u32 {
    DEFAULT_USER_ID
}

fn default_reply_timeout() -> u64 {
    300
}

fn default_stop_grace() -> u64 {
    10
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agents_path: default_agents_path(),
            workflows_path: default_workflows_path(),
            user_id: default_user_id(),
            reply_timeout_secs: default_reply_timeout(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

impl OrchestratorConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}
