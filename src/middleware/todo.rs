//! 任务列表中间件：`write_todos` 工具整体替换 State 中的任务列表

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{StateDelta, Todo, TodoStatus};
use crate::middleware::{Middleware, MiddlewareModule, SystemPromptProvider, ToolProvider};
use crate::tools::schema::{parse_args, schema_of};
use crate::tools::{Tool, ToolContext, ToolOutput};

pub const MODULE_NAME: &str = "todo";

const TODO_PROMPT: &str = "## Task list
Use `write_todos` to plan multi-step work. Always send the complete list; it replaces the previous one.
Keep exactly one item `in_progress` while you work and mark items `completed` as soon as they are done.";

#[derive(Deserialize, JsonSchema)]
struct WriteTodosArgs {
    /// 完整的任务列表
    todos: Vec<Todo>,
}

pub struct WriteTodosTool;

#[async_trait]
impl Tool for WriteTodosTool {
    fn name(&self) -> &str {
        "write_todos"
    }

    fn description(&self) -> &str {
        "Replace the task list. Args: {\"todos\": [{\"content\": \"...\", \"status\": \"pending|in_progress|completed\"}]}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<WriteTodosArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: WriteTodosArgs = parse_args(self.name(), args)?;
        let in_progress = args
            .todos
            .iter()
            .filter(|t| t.status == TodoStatus::InProgress)
            .count();
        if in_progress > 1 {
            return Err(format!("only one todo may be in_progress, got {in_progress}"));
        }
        let done = args
            .todos
            .iter()
            .filter(|t| t.status == TodoStatus::Completed)
            .count();
        let summary = format!("Updated todo list ({done}/{} completed)", args.todos.len());
        Ok(ToolOutput::WithState {
            content: summary,
            delta: StateDelta::default().with_todos(args.todos),
        })
    }
}

pub struct TodoList;

impl SystemPromptProvider for TodoList {
    fn system_prompt(&self) -> String {
        TODO_PROMPT.to_string()
    }
}

impl ToolProvider for TodoList {
    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![Arc::new(WriteTodosTool)]
    }
}

impl Middleware for TodoList {
    fn as_prompt_provider(&self) -> Option<&dyn SystemPromptProvider> {
        Some(self)
    }

    fn as_tool_provider(&self) -> Option<&dyn ToolProvider> {
        Some(self)
    }
}

pub struct TodoModule;

impl MiddlewareModule for TodoModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn init(&self, _options: &Value) -> Result<Arc<dyn Middleware>, String> {
        Ok(Arc::new(TodoList))
    }
}
