//! `agentmesh chat` — interactive orchestrator session.
//!
//! Activates a workflow for one user, then sends every input line through
//! the workflow's endpoints and prints the reply. The conversation history
//! lives here, in the client, and travels with each request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentmesh_core::schema::{ChatResponse, ChatTurn};
use agentmesh_core::{
    BrokerConfig, Correlator, LifecycleManager, MeshError, Payload, Registry, Session, ShellLauncher,
    TopicBinding, Transport,
};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

pub struct ChatArgs {
    pub broker: BrokerConfig,
    pub agents_path: PathBuf,
    pub workflows_path: PathBuf,
    pub workflow: String,
    pub user_id: u32,
    pub timeout: Duration,
    pub launch: bool,
    pub stop_grace: Duration,
}

/// A parsed line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Quit,
    /// Switch to another workflow.
    Workflow(String),
    ListWorkflows,
    /// Forget the conversation history.
    Reset,
    /// Send a file's raw bytes (e.g. a PDF) to the workflow.
    File(PathBuf),
    Message(String),
    Empty,
    Unknown(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ReplCommand::Empty;
        }
        if !line.starts_with('/') {
            return ReplCommand::Message(line.to_string());
        }
        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };
        match (cmd, rest) {
            ("/quit" | "/exit" | "/q", _) => ReplCommand::Quit,
            ("/workflows", _) => ReplCommand::ListWorkflows,
            ("/reset", _) => ReplCommand::Reset,
            ("/workflow", name) if !name.is_empty() => ReplCommand::Workflow(name.to_string()),
            ("/file", path) if !path.is_empty() => ReplCommand::File(PathBuf::from(path)),
            _ => ReplCommand::Unknown(cmd.to_string()),
        }
    }
}

/// Body of a chat request carrying prior turns.
pub fn chat_request(input: &str, history: &[ChatTurn]) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("user_input".to_string(), json!(input));
    map.insert("history".to_string(), json!(history));
    map
}

/// Text to show for a reply: the assistant response if there is one,
/// otherwise the whole reply as JSON.
pub fn reply_text(reply: &Map<String, Value>) -> String {
    match serde_json::from_value::<ChatResponse>(Value::Object(reply.clone())) {
        Ok(chat) => chat.assistant_response,
        Err(_) => serde_json::to_string_pretty(reply).unwrap_or_else(|_| format!("{:?}", reply)),
    }
}

struct Repl {
    registry: Arc<Registry>,
    lifecycle: Option<LifecycleManager>,
    session: Session,
    correlator: Correlator,
    workflow: Option<String>,
    history: Vec<ChatTurn>,
    timeout: Duration,
}

impl Repl {
    async fn switch(&mut self, name: &str) -> Result<(), String> {
        if let Some(lifecycle) = &self.lifecycle {
            let activated = lifecycle.activate(&mut self.session, name).await;
            // A failed launch has already stopped the previous workflow.
            self.workflow = self.session.active_workflow().map(str::to_string);
            activated.map_err(|e| e.to_string())?;
        } else {
            self.registry.workflow(name).map_err(|e| e.to_string())?;
        }
        self.workflow = Some(name.to_string());
        self.history.clear();
        Ok(())
    }

    fn endpoints(&self) -> Result<TopicBinding, String> {
        let name = self.workflow.as_deref().ok_or("no active workflow; use /workflow <name>")?;
        let workflow = self.registry.workflow(name).map_err(|e| e.to_string())?;
        workflow
            .endpoints(self.session.user_id())
            .ok_or_else(|| format!("workflow '{}' has no agents", name))
    }

    async fn ask(&self, payload: Payload) -> Result<Map<String, Value>, String> {
        let binding = self.endpoints()?;
        self.correlator
            .send_and_wait(&binding.input_topic, &binding.output_topic, payload, self.timeout)
            .await
            .map_err(|e| match e {
                MeshError::Timeout { waited_ms, .. } => {
                    format!("no reply after {}s; is the workflow running?", waited_ms / 1000)
                }
                other => other.to_string(),
            })
    }

    async fn close(self) {
        self.correlator.close().await;
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.shutdown(self.session).await;
        }
    }
}

pub async fn run(args: ChatArgs) -> Result<(), String> {
    let registry = Arc::new(super::load_registry(&args.agents_path, &args.workflows_path)?);
    let transport = super::connect(&args.broker, "orchestrator").await?;
    let lifecycle = args.launch.then(|| {
        LifecycleManager::new(
            registry.clone(),
            Arc::new(ShellLauncher::new()),
            args.broker.clone(),
            args.stop_grace,
        )
    });

    let mut repl = Repl {
        registry,
        lifecycle,
        session: Session::new(args.user_id),
        correlator: Correlator::new(transport.clone()),
        workflow: None,
        history: Vec::new(),
        timeout: args.timeout,
    };

    println!("agentmesh chat");
    println!("══════════════════════════════════════");
    println!("Broker:  {}:{}", args.broker.host, args.broker.port);
    println!("User:    {}", args.user_id);
    println!("Session: {}", repl.session.id());
    println!("══════════════════════════════════════");

    match repl.switch(&args.workflow).await {
        Ok(()) => println!("Workflow '{}' active.", args.workflow),
        Err(e) => println!("Could not activate '{}': {}", args.workflow, e),
    }
    println!("Type a message, /workflow <name>, /workflows, /file <path>, /reset or /quit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        use std::io::Write;
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = lines.next_line() => line.map_err(|e| e.to_string()),
            _ = tokio::signal::ctrl_c() => Ok(None),
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("[Chat] stdin: {}", e);
                break;
            }
        };

        match ReplCommand::parse(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Quit => break,
            ReplCommand::Reset => {
                repl.history.clear();
                println!("History cleared.");
            }
            ReplCommand::ListWorkflows => {
                for wf in repl.registry.workflows() {
                    let marker = if repl.workflow.as_deref() == Some(wf.name.as_str()) { "*" } else { " " };
                    println!("{} {} ({})", marker, wf.name, wf.agents.join(" -> "));
                }
            }
            ReplCommand::Workflow(name) => match repl.switch(&name).await {
                Ok(()) => println!("Workflow '{}' active.", name),
                Err(e) => println!("Error: {}", e),
            },
            ReplCommand::File(path) => {
                let result = match std::fs::read(&path) {
                    Ok(bytes) => repl.ask(Payload::Binary(bytes)).await,
                    Err(e) => Err(format!("cannot read {}: {}", path.display(), e)),
                };
                match result {
                    Ok(reply) => println!("{}\n", reply_text(&reply)),
                    Err(e) => println!("Error: {}\n", e),
                }
            }
            ReplCommand::Message(text) => {
                let request = chat_request(&text, &repl.history);
                match repl.ask(Payload::Json(request)).await {
                    Ok(reply) => {
                        let answer = reply_text(&reply);
                        println!("{}\n", answer);
                        repl.history.push(ChatTurn {
                            role: "user".to_string(),
                            content: text,
                        });
                        repl.history.push(ChatTurn {
                            role: "assistant".to_string(),
                            content: answer,
                        });
                    }
                    Err(e) => println!("Error: {}\n", e),
                }
            }
            ReplCommand::Unknown(cmd) => println!("Unknown command: {}", cmd),
        }
    }

    println!("Shutting down...");
    repl.close().await;
    if let Err(e) = transport.disconnect().await {
        tracing::debug!("[Chat] Disconnect failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_core::lifecycle::{AgentProcess, LaunchSpec, ProcessLauncher};
    use agentmesh_core::{MemoryBroker, MeshResult};
    use async_trait::async_trait;

    /// Launches every agent except `broken`, which fails to start.
    struct PickyLauncher;

    struct Running(String);

    #[async_trait]
    impl AgentProcess for Running {
        fn describe(&self) -> String {
            self.0.clone()
        }

        fn is_running(&mut self) -> bool {
            true
        }

        async fn terminate(&mut self, _grace: Duration) -> MeshResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ProcessLauncher for PickyLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> MeshResult<Box<dyn AgentProcess>> {
            if spec.agent == "broken" {
                return Err(MeshError::Lifecycle("no such image".to_string()));
            }
            Ok(Box::new(Running(spec.container.clone())))
        }
    }

    fn launching_repl() -> Repl {
        let registry = Arc::new(
            Registry::from_yaml(
                "agents:\n  chatbot:\n    name: chatbot_agent\n  broken:\n    name: broken_agent\n",
                r#"
workflows:
  chat:
    agents: [chatbot]
    input_topics: ["{user_id}/chatbot/input_data"]
    output_topics: ["{user_id}/chatbot/output_data"]
  broken:
    agents: [broken]
    input_topics: [b/in]
    output_topics: [b/out]
"#,
            )
            .unwrap(),
        );
        let broker = MemoryBroker::new();
        Repl {
            lifecycle: Some(LifecycleManager::new(
                registry.clone(),
                Arc::new(PickyLauncher),
                BrokerConfig::new("localhost", 1883),
                Duration::from_millis(10),
            )),
            registry,
            session: Session::new(1),
            correlator: Correlator::new(Arc::new(broker.connect("repl"))),
            workflow: None,
            history: Vec::new(),
            timeout: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn test_failed_switch_forgets_the_stopped_workflow() {
        let mut repl = launching_repl();
        repl.switch("chat").await.unwrap();
        assert_eq!(repl.workflow.as_deref(), Some("chat"));

        // Unknown names are rejected before anything is stopped.
        assert!(repl.switch("nope").await.is_err());
        assert_eq!(repl.workflow.as_deref(), Some("chat"));

        // A failed launch stops the old agents, so nothing is active.
        assert!(repl.switch("broken").await.is_err());
        assert_eq!(repl.workflow, None);
        let err = repl.endpoints().unwrap_err();
        assert!(err.contains("no active workflow"), "got: {}", err);

        let started = std::time::Instant::now();
        let err = repl
            .ask(Payload::Json(chat_request("hi", &[])))
            .await
            .unwrap_err();
        assert!(err.contains("no active workflow"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_parse_repl_commands() {
        assert_eq!(ReplCommand::parse("  "), ReplCommand::Empty);
        assert_eq!(ReplCommand::parse("/q"), ReplCommand::Quit);
        assert_eq!(ReplCommand::parse("/exit"), ReplCommand::Quit);
        assert_eq!(
            ReplCommand::parse("/workflow pdf_chat"),
            ReplCommand::Workflow("pdf_chat".to_string())
        );
        assert_eq!(ReplCommand::parse("/workflow"), ReplCommand::Unknown("/workflow".to_string()));
        assert_eq!(ReplCommand::parse("/file  a.pdf"), ReplCommand::File(PathBuf::from("a.pdf")));
        assert_eq!(ReplCommand::parse("hello /there"), ReplCommand::Message("hello /there".to_string()));
    }

    #[test]
    fn test_reply_text_prefers_assistant_response() {
        let chat = json!({"assistant_response": "hi", "request_id": "r"});
        assert_eq!(reply_text(chat.as_object().unwrap()), "hi");

        let other = json!({"text": "page"});
        assert!(reply_text(other.as_object().unwrap()).contains("\"text\""));
    }

    #[test]
    fn test_chat_request_carries_history() {
        let history = vec![ChatTurn {
            role: "user".to_string(),
            content: "a".to_string(),
        }];
        let req = chat_request("b", &history);
        assert_eq!(req["user_input"], "b");
        assert_eq!(req["history"][0]["content"], "a");
    }
}
