//! 子智能体委派：general-purpose 派生、模板子智能体的审核中断向上冒泡

use std::sync::Arc;

use async_trait::async_trait;
use hive::agent::{AgentConfig, AgentSupervisor};
use hive::core::State;
use hive::engine::{AgentOutcome, Decision, EngineEvent, Interrupt};
use hive::llm::{ModelRequest, ScriptedModel};
use hive::memory::{Message, Role, ToolCall};
use hive::middleware::{HitlModule, MiddlewareSpec, SubAgentModule, SubAgentTemplate};
use hive::tools::{Tool, ToolContext, ToolOutput};
use serde_json::{json, Value};

struct InternetSearch;

#[async_trait]
impl Tool for InternetSearch {
    fn name(&self) -> &str {
        "internet_search"
    }

    fn description(&self) -> &str {
        "Search the web. Args: {\"query\": \"...\"}"
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
        let query = args["query"].as_str().unwrap_or_default();
        Ok(format!("results for {query}").into())
    }
}

fn is_parent(request: &ModelRequest) -> bool {
    request.tool_names.iter().any(|t| t == "task")
}

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

fn last_role(request: &ModelRequest) -> Option<Role> {
    request.messages.last().map(|m| m.role)
}

#[tokio::test]
async fn test_general_purpose_child_answers_task() {
    let model = Arc::new(ScriptedModel::responder(|request| {
        if is_parent(request) {
            if last_role(request) == Some(Role::User) {
                return Ok(Message::assistant_with_calls(
                    "",
                    vec![ToolCall::new(
                        "call_task",
                        "task",
                        json!({ "instructions": "Say hi", "subagent_type": "general-purpose" }),
                    )],
                ));
            }
            return Ok(Message::assistant(format!("parent saw: {}", last_tool_content(request))));
        }
        Ok(Message::assistant("child answer"))
    }));
    let config = AgentConfig::new("root", model.clone())
        .with_tool(Arc::new(InternetSearch))
        .with_middleware(MiddlewareSpec::new(SubAgentModule::new()));
    let agent = AgentSupervisor::start(config, State::new()).await.unwrap();
    let mut events = agent.events().unwrap();

    let outcome = agent.submit(Message::user("delegate")).await.unwrap();
    let AgentOutcome::Completed(state) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(
        state.final_assistant_text().as_deref(),
        Some("parent saw: child answer")
    );

    // 子智能体从空对话开始，只看到 instructions，也拿不到 task 工具
    let child_calls: Vec<ModelRequest> = model.calls().into_iter().filter(|r| !is_parent(r)).collect();
    assert_eq!(child_calls.len(), 1);
    assert_eq!(child_calls[0].messages.len(), 1);
    assert_eq!(child_calls[0].messages[0].text(), "Say hi");
    assert!(child_calls[0].tool_names.contains(&"internet_search".to_string()));

    let mut spawned = 0;
    let mut finished = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        match envelope.event {
            EngineEvent::SubAgentSpawned { subagent_type, .. } => {
                assert_eq!(subagent_type, "general-purpose");
                spawned += 1;
            }
            EngineEvent::SubAgentFinished { outcome, .. } => finished.push(outcome),
            _ => {}
        }
    }
    assert_eq!(spawned, 1);
    assert_eq!(finished, vec!["completed".to_string()]);
    agent.stop().await;
}

#[tokio::test]
async fn test_child_review_bubbles_to_root() {
    let model = Arc::new(ScriptedModel::responder(|request| {
        let from_user = last_role(request) == Some(Role::User);
        match (is_parent(request), from_user) {
            (true, true) => Ok(Message::assistant_with_calls(
                "",
                vec![ToolCall::new(
                    "call_task",
                    "task",
                    json!({ "instructions": "Look up rust", "subagent_type": "researcher" }),
                )],
            )),
            (true, false) => Ok(Message::assistant(format!(
                "Summary: {}",
                last_tool_content(request)
            ))),
            (false, true) => Ok(Message::assistant_with_calls(
                "",
                vec![ToolCall::new(
                    "call_search",
                    "internet_search",
                    json!({ "query": "rust" }),
                )],
            )),
            (false, false) => Ok(Message::assistant(format!(
                "Found: {}",
                last_tool_content(request)
            ))),
        }
    }));

    let researcher = SubAgentTemplate {
        name: "researcher".into(),
        description: "Searches the web".into(),
        system_prompt: "You are a researcher.".into(),
        tools: vec!["internet_search".into()],
        middleware: vec![MiddlewareSpec::new(HitlModule)
            .with_options(json!({ "interrupt_on": { "internet_search": true } }))],
    };
    let config = AgentConfig::new("root", model.clone())
        .with_tool(Arc::new(InternetSearch))
        .with_middleware(MiddlewareSpec::new(SubAgentModule::new().with_template(researcher)));
    let agent = AgentSupervisor::start(config, State::new()).await.unwrap();

    let outcome = agent.submit(Message::user("research rust")).await.unwrap();
    let AgentOutcome::Interrupted { interrupt, .. } = outcome else {
        panic!("expected the child review to surface");
    };
    let Interrupt::SubAgent {
        subagent_type,
        call_id,
        interrupt_data,
        ..
    } = &interrupt
    else {
        panic!("expected a sub-agent interrupt");
    };
    assert_eq!(subagent_type, "researcher");
    assert_eq!(call_id, "call_task");
    assert_eq!(interrupt_data.action_requests[0].tool_name, "internet_search");
    assert_eq!(interrupt.decisions_required(), 1);

    let serialized = serde_json::to_value(&interrupt).unwrap();
    assert_eq!(serialized["type"], "subagent_hitl");

    let outcome = agent.resume(vec![Decision::Approve]).await.unwrap();
    let AgentOutcome::Completed(state) = outcome else {
        panic!("expected completion after approval");
    };
    assert_eq!(
        state.final_assistant_text().as_deref(),
        Some("Summary: Found: results for rust")
    );

    let task_result = state
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .and_then(|m| m.tool_results.first())
        .unwrap();
    assert_eq!(task_result.tool_call_id, "call_task");
    assert_eq!(task_result.content, "Found: results for rust");

    // 模板的系统提示词只出现在子智能体的调用里
    let parent_prompts: Vec<String> = model
        .calls()
        .into_iter()
        .filter(is_parent)
        .map(|r| r.system_prompt)
        .collect();
    assert!(parent_prompts.iter().all(|p| !p.contains("You are a researcher.")));
    agent.stop().await;
}
