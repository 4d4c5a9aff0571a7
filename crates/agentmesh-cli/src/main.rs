//! agentmesh CLI — run agent workers and drive workflows over an MQTT broker.

use std::path::PathBuf;
use std::time::Duration;

use agentmesh_cli::commands;
use agentmesh_core::{AgentKind, BrokerConfig, CorrelationMode, OrchestratorConfig};
use clap::{Args, Parser, Subcommand, ValueEnum};

/// agentmesh — agent orchestration over a pub/sub broker
#[derive(Parser)]
#[command(name = "agentmesh", version, about = "agentmesh — agent orchestration over a pub/sub broker")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct BrokerArgs {
    /// MQTT broker address (e.g. 192.168.1.10)
    #[arg(long, short = 'b', env = "AGENTMESH_BROKER", default_value = "localhost")]
    broker: String,
    /// MQTT broker port
    #[arg(long, short = 'p', env = "AGENTMESH_PORT", default_value_t = 1883)]
    port: u16,
}

impl BrokerArgs {
    fn config(&self) -> BrokerConfig {
        BrokerConfig::new(self.broker.clone(), self.port)
    }
}

#[derive(Args, Clone)]
struct RegistryArgs {
    /// Agent definitions file
    #[arg(long, env = "AGENTMESH_AGENTS", default_value = "agents.yaml")]
    agents: PathBuf,
    /// Workflow definitions file
    #[arg(long, env = "AGENTMESH_WORKFLOWS", default_value = "workflows.yaml")]
    workflows: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Chat,
    Pdf,
    Sheet,
    Train,
}

impl From<KindArg> for AgentKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Chat => AgentKind::Chat,
            KindArg::Pdf => AgentKind::Pdf,
            KindArg::Sheet => AgentKind::Sheet,
            KindArg::Train => AgentKind::Train,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CorrelationArg {
    /// Match replies by embedded request id
    RequestId,
    /// Take the next reply on the output topic (racy with concurrent callers)
    TopicOnly,
}

impl From<CorrelationArg> for CorrelationMode {
    fn from(arg: CorrelationArg) -> Self {
        match arg {
            CorrelationArg::RequestId => CorrelationMode::RequestId,
            CorrelationArg::TopicOnly => CorrelationMode::TopicOnly,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one agent worker until Ctrl-C
    Agent {
        /// Which agent to run
        #[arg(value_enum)]
        kind: KindArg,
        #[command(flatten)]
        broker: BrokerArgs,
        /// User id used for the default topics
        #[arg(long = "user_id", short = 't', default_value_t = 1)]
        user_id: u32,
        /// Topic to consume (default: <user_id>/<domain>/<input>)
        #[arg(long = "input_topic")]
        input_topic: Option<String>,
        /// Topic to publish replies on (default: <user_id>/<domain>/<output>)
        #[arg(long = "output_topic")]
        output_topic: Option<String>,
        /// Do not publish error envelopes when the transform fails
        #[arg(long)]
        no_error_replies: bool,
    },

    /// Inspect workflow and agent definitions
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Interactive session: activate a workflow and chat through it
    Chat {
        #[command(flatten)]
        broker: BrokerArgs,
        #[command(flatten)]
        registry: RegistryArgs,
        /// Workflow to activate on start
        #[arg(long, short = 'w', default_value = "chat")]
        workflow: String,
        #[arg(long = "user_id", short = 't', default_value_t = 1)]
        user_id: u32,
        /// Seconds to wait for each reply [default: 300]
        #[arg(long)]
        timeout: Option<u64>,
        /// Assume the agents are already running; do not launch or stop any
        #[arg(long)]
        no_launch: bool,
        /// Seconds a stopping agent gets before it is killed [default: 10]
        #[arg(long)]
        stop_grace: Option<u64>,
    },

    /// Send one request and print the reply
    Send {
        #[command(flatten)]
        broker: BrokerArgs,
        #[command(flatten)]
        registry: RegistryArgs,
        /// Take topics from this workflow's endpoints
        #[arg(long, short = 'w', conflicts_with_all = ["input_topic", "output_topic"])]
        workflow: Option<String>,
        #[arg(long = "input_topic", requires = "output_topic")]
        input_topic: Option<String>,
        #[arg(long = "output_topic", requires = "input_topic")]
        output_topic: Option<String>,
        #[arg(long = "user_id", short = 't', default_value_t = 1)]
        user_id: u32,
        /// JSON object to send
        #[arg(long, conflicts_with = "file")]
        json: Option<String>,
        /// File sent as raw bytes (e.g. a PDF)
        #[arg(long)]
        file: Option<PathBuf>,
        /// Seconds to wait for the reply [default: 300]
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long, value_enum, default_value = "request-id")]
        correlation: CorrelationArg,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// List workflows and their agent slots
    List {
        #[command(flatten)]
        registry: RegistryArgs,
        /// Render `{user_id}` topics for this user
        #[arg(long = "user_id", short = 't', default_value_t = 1)]
        user_id: u32,
    },
    /// Check that every workflow references known agents
    Validate {
        #[command(flatten)]
        registry: RegistryArgs,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentmesh_core=info,agentmesh_cli=info".into()),
        )
        .init();

    let defaults = OrchestratorConfig::default();
    let secs_or = |secs: Option<u64>, fallback: Duration| secs.map(Duration::from_secs).unwrap_or(fallback);

    let result = match cli.command {
        Commands::Agent {
            kind,
            broker,
            user_id,
            input_topic,
            output_topic,
            no_error_replies,
        } => {
            commands::agent::run(commands::agent::AgentArgs {
                kind: kind.into(),
                broker: broker.config(),
                user_id,
                input_topic,
                output_topic,
                publish_errors: !no_error_replies,
            })
            .await
        }

        Commands::Workflow { action } => match action {
            WorkflowAction::List { registry, user_id } => {
                commands::workflow::list(&registry.agents, &registry.workflows, user_id)
            }
            WorkflowAction::Validate { registry } => {
                commands::workflow::validate(&registry.agents, &registry.workflows)
            }
        },

        Commands::Chat {
            broker,
            registry,
            workflow,
            user_id,
            timeout,
            no_launch,
            stop_grace,
        } => {
            commands::chat::run(commands::chat::ChatArgs {
                broker: broker.config(),
                agents_path: registry.agents,
                workflows_path: registry.workflows,
                workflow,
                user_id,
                timeout: secs_or(timeout, defaults.reply_timeout()),
                launch: !no_launch,
                stop_grace: secs_or(stop_grace, defaults.stop_grace()),
            })
            .await
        }

        Commands::Send {
            broker,
            registry,
            workflow,
            input_topic,
            output_topic,
            user_id,
            json,
            file,
            timeout,
            correlation,
        } => {
            let target = match (workflow, input_topic, output_topic) {
                (Some(name), _, _) => commands::send::Target::Workflow {
                    name,
                    agents_path: registry.agents,
                    workflows_path: registry.workflows,
                },
                (None, Some(input), Some(output)) => commands::send::Target::Topics { input, output },
                _ => {
                    eprintln!("Error: pass --workflow or both --input_topic and --output_topic");
                    std::process::exit(2);
                }
            };
            commands::send::run(commands::send::SendArgs {
                broker: broker.config(),
                target,
                user_id,
                json,
                file,
                timeout: secs_or(timeout, defaults.reply_timeout()),
                mode: correlation.into(),
            })
            .await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
