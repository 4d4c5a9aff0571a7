//! `agentmesh workflow` — inspect the registry.

use std::path::Path;

pub fn list(agents: &Path, workflows: &Path, user_id: u32) -> Result<(), String> {
    let registry = super::load_registry(agents, workflows)?;
    print!("{}", render_list(&registry, user_id));
    Ok(())
}

pub fn validate(agents: &Path, workflows: &Path) -> Result<(), String> {
    let registry = super::load_registry(agents, workflows)?;
    println!(
        "OK: {} agent(s), {} workflow(s)",
        registry.agents().count(),
        registry.workflows().count()
    );
    Ok(())
}

/// Human-readable listing of every workflow and its slots.
pub fn render_list(registry: &agentmesh_core::Registry, user_id: u32) -> String {
    let mut out = String::new();
    for wf in registry.workflows() {
        out.push_str(&wf.name);
        if let Some(description) = &wf.description {
            out.push_str(&format!(" — {}", description));
        }
        out.push('\n');
        for slot in wf.slots(user_id) {
            out.push_str(&format!(
                "  [{}] {:<16} {} -> {}\n",
                slot.index, slot.agent, slot.binding.input_topic, slot.binding.output_topic
            ));
        }
    }
    out
}
