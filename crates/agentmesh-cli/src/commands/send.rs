//! `agentmesh send` — publish one request and print the correlated reply.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentmesh_core::{BrokerConfig, CorrelationMode, Correlator, Payload, TopicBinding, Transport};
use serde_json::{Map, Value};

pub enum Target {
    Workflow {
        name: String,
        agents_path: PathBuf,
        workflows_path: PathBuf,
    },
    Topics {
        input: String,
        output: String,
    },
}

pub struct SendArgs {
    pub broker: BrokerConfig,
    pub target: Target,
    pub user_id: u32,
    pub json: Option<String>,
    pub file: Option<PathBuf>,
    pub timeout: Duration,
    pub mode: CorrelationMode,
}

impl Target {
    pub fn resolve(&self, user_id: u32) -> Result<TopicBinding, String> {
        match self {
            Target::Topics { input, output } => Ok(TopicBinding::new(input.clone(), output.clone())),
            Target::Workflow {
                name,
                agents_path,
                workflows_path,
            } => {
                let registry = super::load_registry(agents_path, workflows_path)?;
                let workflow = registry.workflow(name).map_err(|e| e.to_string())?;
                workflow
                    .endpoints(user_id)
                    .ok_or_else(|| format!("workflow '{}' has no agents", name))
            }
        }
    }
}

/// Build the request payload from `--json` or `--file`.
pub fn payload(json: Option<&str>, file: Option<&PathBuf>) -> Result<Payload, String> {
    match (json, file) {
        (Some(text), None) => {
            let value: Value = serde_json::from_str(text).map_err(|e| format!("invalid --json: {}", e))?;
            match value {
                Value::Object(map) => Ok(Payload::Json(map)),
                _ => Err("--json must be a JSON object".to_string()),
            }
        }
        (None, Some(path)) => std::fs::read(path)
            .map(Payload::Binary)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e)),
        _ => Err("pass exactly one of --json or --file".to_string()),
    }
}

/// Send `payload` on `binding.input_topic` and wait on `binding.output_topic`.
pub async fn request(
    transport: Arc<dyn Transport>,
    binding: &TopicBinding,
    payload: Payload,
    timeout: Duration,
    mode: CorrelationMode,
) -> Result<Map<String, Value>, String> {
    let correlator = Correlator::with_mode(transport, mode);
    let result = correlator
        .send_and_wait(&binding.input_topic, &binding.output_topic, payload, timeout)
        .await;
    correlator.close().await;
    result.map_err(|e| e.to_string())
}

pub async fn run(args: SendArgs) -> Result<(), String> {
    let binding = args.target.resolve(args.user_id)?;
    let payload = payload(args.json.as_deref(), args.file.as_ref())?;
    let transport = super::connect(&args.broker, "send").await?;

    let result = request(transport.clone(), &binding, payload, args.timeout, args.mode).await;
    if let Err(e) = transport.disconnect().await {
        tracing::debug!("[Send] Disconnect failed: {}", e);
    }
    super::print_json(&Value::Object(result?));
    Ok(())
}
