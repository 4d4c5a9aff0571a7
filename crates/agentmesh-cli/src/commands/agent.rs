//! `agentmesh agent <kind>` — run one worker until Ctrl-C.

use agentmesh_core::{AgentKind, AgentWorker, BrokerConfig, TopicBinding, WorkerOptions};

pub struct AgentArgs {
    pub kind: AgentKind,
    pub broker: BrokerConfig,
    pub user_id: u32,
    pub input_topic: Option<String>,
    pub output_topic: Option<String>,
    pub publish_errors: bool,
}

/// Explicit topics win over the kind's per-user defaults.
pub fn binding(kind: AgentKind, user_id: u32, input: Option<String>, output: Option<String>) -> TopicBinding {
    let defaults = kind.default_binding(user_id);
    TopicBinding::new(
        input.unwrap_or(defaults.input_topic),
        output.unwrap_or(defaults.output_topic),
    )
}

pub async fn run(args: AgentArgs) -> Result<(), String> {
    let binding = binding(args.kind, args.user_id, args.input_topic, args.output_topic);
    let transport = super::connect(&args.broker, args.kind.as_str()).await?;

    let worker = AgentWorker::new(
        transport,
        args.kind.transform(),
        binding.clone(),
        WorkerOptions {
            publish_errors: args.publish_errors,
            ..WorkerOptions::default()
        },
    );
    worker.start().await.map_err(|e| e.to_string())?;

    println!(
        "{} agent listening on '{}', replying on '{}' ({}:{})",
        args.kind, binding.input_topic, binding.output_topic, args.broker.host, args.broker.port
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[Agent] Interrupted, shutting down");
        }
        _ = worker.stopped() => {}
    }

    worker.stop().await.map_err(|e| e.to_string())?;
    println!("{} agent stopped after {} message(s)", args.kind, worker.processed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_defaults_and_overrides() {
        let b = binding(AgentKind::Pdf, 3, None, None);
        assert_eq!(b.input_topic, "3/pdf/encoded");
        assert_eq!(b.output_topic, "3/pdf/prompt_data");

        let b = binding(AgentKind::Chat, 3, Some("x/in".into()), None);
        assert_eq!(b.input_topic, "x/in");
        assert_eq!(b.output_topic, "3/chatbot/output_data");
    }
}
