//! Hive - 智能体执行引擎演示入口
//!
//! 加载 config/default.toml，用脚本化模型启动一个 agent：
//! 先写任务列表和文件，遇到人工审核中断时打印中断内容并自动批准。

use std::sync::Arc;

use anyhow::Context;
use hive::agent::{AgentConfig, AgentRegistry, AgentSupervisor};
use hive::config::load_config;
use hive::core::{ShutdownManager, State};
use hive::engine::{AgentOutcome, Decision};
use hive::llm::ScriptedModel;
use hive::memory::{Message, Role, ToolCall};
use hive::middleware::MiddlewareCatalog;
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 收到用户消息时规划并写文件，其余情况给出总结
fn demo_model() -> ScriptedModel {
    ScriptedModel::responder(|request| {
        let last = request.messages.last();
        match last.map(|m| m.role) {
            Some(Role::User) => {
                let prompt = last.map(|m| m.text()).unwrap_or_default();
                Ok(Message::assistant_with_calls(
                    "Planning the work.",
                    vec![
                        ToolCall::new(
                            "call_todos",
                            "write_todos",
                            json!({ "todos": [
                                { "content": "Write notes", "status": "in_progress" },
                                { "content": "Summarize", "status": "pending" }
                            ] }),
                        ),
                        ToolCall::new(
                            "call_write",
                            "write_file",
                            json!({ "path": "notes.md", "content": format!("# Notes\n\n{prompt}\n") }),
                        ),
                    ],
                ))
            }
            _ => Ok(Message::assistant("Notes written to notes.md.")),
        }
    })
}

async fn run_demo(registry: &AgentRegistry, prompt: String) -> anyhow::Result<()> {
    let app = load_config(None).context("Failed to load config")?;
    let config = AgentConfig::from_app_config(&app, Arc::new(demo_model()), &MiddlewareCatalog::with_builtin())
        .context("Failed to build agent config")?;

    let handle = AgentSupervisor::start(config, State::new())
        .await
        .context("Failed to start agent")?;
    registry.insert(handle.clone()).await;

    let mut outcome = handle
        .submit(Message::user(prompt))
        .await
        .context("Submit failed")?;

    loop {
        let decisions = match &outcome {
            AgentOutcome::Interrupted { interrupt, .. } => {
                println!("{}", serde_json::to_string_pretty(interrupt)?);
                vec![Decision::Approve; interrupt.decisions_required()]
            }
            _ => break,
        };
        outcome = handle.resume(decisions).await.context("Resume failed")?;
    }

    match &outcome {
        AgentOutcome::Completed(state) => {
            println!("{}", state.final_assistant_text().unwrap_or_default());
            println!("files: {:?}", state.extensions.files);
        }
        AgentOutcome::Halted { reason, .. } => println!("halted: {reason}"),
        AgentOutcome::Failed { error, .. } => println!("failed: {error}"),
        AgentOutcome::Interrupted { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let prompt = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let prompt = if prompt.is_empty() {
        "Collect notes about the hive runtime".to_string()
    } else {
        prompt
    };

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let registry = AgentRegistry::new();

    let result = tokio::select! {
        result = run_demo(&registry, prompt) => result,
        _ = shutdown.wait_for_shutdown() => {
            tracing::info!("interrupted, stopping agents");
            Ok(())
        }
    };

    registry.stop_all().await;
    result
}
