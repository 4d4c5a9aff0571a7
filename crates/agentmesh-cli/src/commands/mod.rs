//! CLI command implementations.
//!
//! Each submodule backs one top-level command. They all return
//! `Result<(), String>` and leave exit codes to `main`.

pub mod agent;
pub mod chat;
pub mod send;
pub mod workflow;

use std::path::Path;
use std::sync::Arc;

use agentmesh_core::{BrokerConfig, MqttTransport, Registry};

/// Load `agents.yaml` + `workflows.yaml` and check cross references.
pub fn load_registry(agents: &Path, workflows: &Path) -> Result<Registry, String> {
    let registry = Registry::from_files(agents, workflows).map_err(|e| e.to_string())?;
    registry.validate().map_err(|e| e.to_string())?;
    Ok(registry)
}

/// Connect to the broker with a unique client id for `role`.
pub async fn connect(broker: &BrokerConfig, role: &str) -> Result<Arc<MqttTransport>, String> {
    let suffix = format!("{}-{}", role, &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let client_id = broker.client_id(&suffix);
    let transport = MqttTransport::connect(broker, &client_id)
        .await
        .map_err(|e| format!("cannot reach broker {}:{}: {}", broker.host, broker.port, e))?;
    Ok(Arc::new(transport))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
