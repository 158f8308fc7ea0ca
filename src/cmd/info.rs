//! Read-only commands: `aira agents`, `aira config`, `aira parse-limits`.

use anyhow::{Context, Result};

use aira::agent::Registry;
use aira::config::AiraConfig;
use aira_runtime::{parse_cpu_limit, parse_memory_limit};

pub fn cmd_agents(config: &AiraConfig) {
    let registry = Registry::with_builtin(
        &config.agents,
        &config.runtime.image_default,
        config.runtime.stop_grace(),
    );
    for name in registry.available() {
        println!("{:<10} {}", name, config.agent_image(&name));
    }
}

pub fn cmd_config(config: &AiraConfig) -> Result<()> {
    let mut shown = config.clone();
    if let Some(slack) = shown.messengers.slack.as_mut() {
        if !slack.token.is_empty() {
            slack.token = "<redacted>".to_string();
        }
    }
    print!("{}", shown.to_toml()?);
    Ok(())
}

pub fn cmd_parse_limits(cpu: &str, memory: &str) -> Result<()> {
    let quota = parse_cpu_limit(cpu).with_context(|| format!("Invalid CPU limit: {:?}", cpu))?;
    let bytes =
        parse_memory_limit(memory).with_context(|| format!("Invalid memory limit: {:?}", memory))?;
    println!("cpu_quota = {}", quota);
    println!("memory_bytes = {}", bytes);
    Ok(())
}
