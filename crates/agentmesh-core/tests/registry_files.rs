//! Loading the registry from files on disk.

use std::fs;

use agentmesh_core::registry::{Registry, DEFAULT_STOP_COMMAND};
use agentmesh_core::{AgentKind, MeshError};

#[test]
fn test_load_registry_from_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agents = dir.path().join("agents.yaml");
    let workflows = dir.path().join("workflows.yaml");
    fs::write(
        &agents,
        r#"
agents:
  chatbot:
    name: chatbot_agent
    dockerfile_path: agents/config/chatbot.Dockerfile
    kind: chat
  local_chat:
    name: local_chat
    kind: chat
    run_command: "agentmesh agent chat --broker {broker} --port {port} --user_id {user_id} --input_topic {input_topic} --output_topic {output_topic}"
    stop_command: ""
"#,
    )
    .expect("write agents");
    fs::write(
        &workflows,
        r#"
workflows:
  chat:
    agents: [chatbot]
    input_topics: ["{user_id}/chatbot/input_data"]
    output_topics: ["{user_id}/chatbot/output_data"]
  local:
    agents: [local_chat]
    input_topics: ["local/in"]
    output_topics: ["local/out"]
"#,
    )
    .expect("write workflows");

    let registry = Registry::from_files(&agents, &workflows).expect("load");
    registry.validate().expect("valid");

    let names: Vec<&str> = registry.workflows().map(|w| w.name.as_str()).collect();
    assert_eq!(names, vec!["chat", "local"]);

    let chatbot = registry.agent("chatbot").expect("chatbot");
    assert_eq!(chatbot.kind, Some(AgentKind::Chat));
    assert_eq!(chatbot.stop_template.source(), DEFAULT_STOP_COMMAND);
    assert_eq!(registry.agent("local_chat").expect("local").stop_template.source(), "");

    let local = registry.workflow("local").expect("local");
    assert_eq!(local.slots(9)[0].binding.input_topic, "local/in");
}

#[test]
fn test_missing_file_is_configuration_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = Registry::from_files(dir.path().join("nope.yaml"), dir.path().join("nope2.yaml"))
        .expect_err("missing file");
    assert!(matches!(err, MeshError::Configuration(_)));
}
