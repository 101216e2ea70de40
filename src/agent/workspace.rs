//! Agent workspace bootstrap.
//!
//! Runs under the per-agent run lock, before a fresh provider session
//! opens: the workspace directory, the persistent memory file, and the
//! regenerated instruction file the provider reads.

use crate::agent::types::{Agent, AgentBinding};
use crate::config::DataPaths;
use crate::errors::HibossResult;
use std::fmt::Write;

const MEMORY_SEED: &str = "# Memory\n\nNothing recorded yet.\n";

pub fn bootstrap(paths: &DataPaths, agent: &Agent, bindings: &[AgentBinding]) -> HibossResult<()> {
    std::fs::create_dir_all(&agent.workspace)?;

    let internal = paths.agent_internal_space(&agent.name);
    std::fs::create_dir_all(&internal)?;

    let memory_path = internal.join("MEMORY.md");
    if !memory_path.exists() {
        std::fs::write(&memory_path, MEMORY_SEED)?;
    }

    let instructions = render_instructions(agent, bindings);
    std::fs::write(internal.join("AGENT.md"), instructions)?;
    Ok(())
}

fn render_instructions(agent: &Agent, bindings: &[AgentBinding]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Agent {}", agent.name);
    out.push('\n');
    if let Some(desc) = &agent.description {
        let _ = writeln!(out, "{}\n", desc);
    }
    let _ = writeln!(out, "Your address is `agent:{}`.", agent.name);
    let _ = writeln!(
        out,
        "Messages arrive as envelopes; each block starts with a `from:` line."
    );
    if bindings.is_empty() {
        let _ = writeln!(out, "\nNo channels are bound to you yet.");
    } else {
        let _ = writeln!(out, "\nBound channels:");
        for binding in bindings {
            let _ = writeln!(
                out,
                "- {} (send to `channel:{}:<chat-id>`)",
                binding.adapter_type, binding.adapter_type
            );
        }
    }
    let _ = writeln!(
        out,
        "\nTo thread a reply under the message you are answering, set\n\
         `replyToEnvelopeId` to the envelope id you received."
    );
    out
}
