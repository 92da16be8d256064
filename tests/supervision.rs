//! 监管树：文件跨重启持久化、悬空工具调用修补、单元崩溃后的恢复

use std::sync::Arc;
use std::time::Duration;

use hive::agent::{AgentConfig, AgentSupervisor, Unit};
use hive::core::{AgentError, ShutdownReason, State};
use hive::engine::AgentOutcome;
use hive::llm::{ModelRequest, ScriptedModel};
use hive::memory::{Message, Role, ToolCall};
use hive::middleware::{FilesystemModule, MiddlewareSpec};
use hive::store::SqliteBackend;
use serde_json::json;

fn last_tool_content(request: &ModelRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Tool)
        .and_then(|m| m.tool_results.first())
        .map(|r| r.content.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_files_survive_agent_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("hive.db");

    let writer = ScriptedModel::replies(vec![
        Message::assistant_with_calls(
            "",
            vec![ToolCall::new(
                "w1",
                "write_file",
                json!({ "path": "notes.txt", "content": "hello from the first run" }),
            )],
        ),
        Message::assistant("saved"),
    ]);
    let config = AgentConfig::new("keeper", Arc::new(writer))
        .with_middleware(MiddlewareSpec::new(FilesystemModule))
        .with_store_backend(Arc::new(SqliteBackend::open(&db).unwrap()));
    let agent = AgentSupervisor::start(config, State::new()).await.unwrap();
    let outcome = agent.submit(Message::user("save a note")).await.unwrap();
    assert!(matches!(outcome, AgentOutcome::Completed(_)));
    agent.stop().await;
    assert!(!agent.is_running());

    let reader = ScriptedModel::responder(|request| {
        if request.messages.last().map(|m| m.role) == Some(Role::User) {
            return Ok(Message::assistant_with_calls(
                "",
                vec![ToolCall::new("r1", "read_file", json!({ "path": "notes.txt" }))],
            ));
        }
        Ok(Message::assistant(last_tool_content(request)))
    });
    let config = AgentConfig::new("keeper", Arc::new(reader))
        .with_middleware(MiddlewareSpec::new(FilesystemModule))
        .with_store_backend(Arc::new(SqliteBackend::open(&db).unwrap()));
    let agent = AgentSupervisor::start(config, State::new()).await.unwrap();
    let outcome = agent.submit(Message::user("read the note")).await.unwrap();
    let AgentOutcome::Completed(state) = outcome else {
        panic!("expected completion");
    };
    let text = state.final_assistant_text().unwrap_or_default();
    assert!(text.contains("hello from the first run"), "got: {text}");
    agent.stop().await;
}

#[tokio::test]
async fn test_dangling_tool_call_is_patched_before_model() {
    let model = Arc::new(ScriptedModel::replies(vec![Message::assistant("fresh start")]));
    let history = State::with_messages(vec![
        Message::user("write something"),
        Message::assistant_with_calls(
            "",
            vec![ToolCall::new("stale", "write_file", json!({ "path": "a.txt", "content": "a" }))],
        ),
    ]);
    let config = AgentConfig::new("patched", model.clone());
    let agent = AgentSupervisor::start(config, history).await.unwrap();

    let outcome = agent.submit(Message::user("never mind")).await.unwrap();
    assert!(matches!(outcome, AgentOutcome::Completed(_)));

    let request = &model.calls()[0];
    let roles: Vec<Role> = request.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::User]);
    let patched = &request.messages[2].tool_results[0];
    assert_eq!(patched.tool_call_id, "stale");
    assert!(patched.is_error);
    assert!(patched.content.contains("cancelled"));
    agent.stop().await;
}

#[tokio::test]
async fn test_crashed_store_keeps_agent_serving() {
    let model = ScriptedModel::replies(vec![
        Message::assistant("first"),
        Message::assistant("second"),
    ]);
    let agent = AgentSupervisor::start(AgentConfig::new("resilient", Arc::new(model)), State::new())
        .await
        .unwrap();

    agent.submit(Message::user("one")).await.unwrap();
    let before = agent.unit_ids().await.unwrap();
    let after = agent.crash_unit(Unit::Store).await.unwrap();
    assert_ne!(before.store, after.store);
    assert_ne!(before.execution_loop, after.execution_loop);
    assert_ne!(before.subagent_pool, after.subagent_pool);

    let outcome = agent.submit(Message::user("two")).await.unwrap();
    let AgentOutcome::Completed(state) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(state.messages.len(), 4);
    assert_eq!(agent.state().messages.len(), 4);

    let mut shutdown = agent.subscribe_shutdown();
    agent.stop().await;
    let reason = tokio::time::timeout(Duration::from_secs(1), shutdown.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, ShutdownReason::Requested);
}

#[tokio::test]
async fn test_cancel_during_model_call_keeps_state() {
    let model = ScriptedModel::replies(vec![Message::assistant("too late"), Message::assistant("back")])
        .with_latency(Duration::from_millis(1500));
    let agent = AgentSupervisor::start(AgentConfig::new("cancel", Arc::new(model)), State::new())
        .await
        .unwrap();

    let run = tokio::spawn({
        let agent = agent.clone();
        async move { agent.submit(Message::user("think hard")).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    agent.cancel();

    match run.await.unwrap().unwrap() {
        AgentOutcome::Failed { state, error } => {
            assert_eq!(error, AgentError::Cancelled);
            assert_eq!(state.messages.len(), 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(agent.state().messages.len(), 1);
    assert!(agent.is_running());

    let outcome = agent.submit(Message::user("try again")).await.unwrap();
    assert_eq!(outcome.into_state().final_assistant_text().as_deref(), Some("too late"));
    agent.stop().await;
}
