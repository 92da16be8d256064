//! 对话状态：消息列表 + 元数据 + 扩展槽
//!
//! State 是不可变快照，所有变更都产生新的 State，或者产生 StateDelta 再合并到基础 State 上。
//! 元数据对引擎不透明；扩展槽承载各中间件的数据（任务列表、文件索引等）。

use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::{Message, Role};

/// 任务列表条目状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Todo {
    pub content: String,
    pub status: TodoStatus,
}

/// 各功能的扩展槽
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Extensions {
    #[serde(default)]
    pub todos: Vec<Todo>,
    /// 虚拟文件存储中已知的路径
    #[serde(default)]
    pub files: BTreeSet<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, Value>,
}

/// 对话的完整工作记忆
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub extensions: Extensions,
}

/// 增量：追加消息、合并元数据、替换/增删扩展槽
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub todos: Option<Vec<Todo>>,
    #[serde(default)]
    pub files_added: BTreeSet<String>,
    #[serde(default)]
    pub files_removed: BTreeSet<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, Value>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.metadata.is_empty()
            && self.todos.is_none()
            && self.files_added.is_empty()
            && self.files_removed.is_empty()
            && self.custom.is_empty()
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_todos(mut self, todos: Vec<Todo>) -> Self {
        self.todos = Some(todos);
        self
    }

    pub fn file_added(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.files_removed.remove(&path);
        self.files_added.insert(path);
        self
    }

    pub fn file_removed(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.files_added.remove(&path);
        self.files_removed.insert(path);
        self
    }
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// 追加一条消息，返回新的 State
    pub fn append(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// 将增量合并到当前 State
    pub fn merge(mut self, delta: StateDelta) -> Self {
        self.messages.extend(delta.messages);
        self.metadata.extend(delta.metadata);
        if let Some(todos) = delta.todos {
            self.extensions.todos = todos;
        }
        for path in delta.files_removed {
            self.extensions.files.remove(&path);
        }
        self.extensions.files.extend(delta.files_added);
        for (key, value) in delta.custom {
            if value.is_null() {
                self.extensions.custom.remove(&key);
            } else {
                self.extensions.custom.insert(key, value);
            }
        }
        self
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 最后一条 assistant 消息的文本（子智能体只把它交还给父智能体）
    pub fn final_assistant_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.text())
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_appends_and_overrides() {
        let base = State::with_messages(vec![Message::user("hi")]).with_metadata("a", json!(1));
        let delta = StateDelta {
            messages: vec![Message::assistant("hello")],
            ..StateDelta::default()
        }
        .with_metadata("a", json!(2))
        .with_metadata("b", json!("x"));
        let merged = base.merge(delta);
        assert_eq!(merged.messages.len(), 2);
        assert_eq!(merged.metadata["a"], json!(2));
        assert_eq!(merged.metadata_str("b"), Some("x"));
    }

    #[test]
    fn test_merge_files_and_custom_removal() {
        let mut base = State::new();
        base.extensions.files.insert("old.txt".into());
        base.extensions.custom.insert("k".into(), json!(true));
        let mut delta = StateDelta::default()
            .file_added("new.txt")
            .file_removed("old.txt");
        delta.custom.insert("k".into(), Value::Null);
        let merged = base.merge(delta);
        assert!(merged.extensions.files.contains("new.txt"));
        assert!(!merged.extensions.files.contains("old.txt"));
        assert!(merged.extensions.custom.is_empty());
    }

    #[test]
    fn test_todos_replaced_only_when_present() {
        let todos = vec![Todo {
            content: "write tests".into(),
            status: TodoStatus::Pending,
        }];
        let state = State::new().merge(StateDelta::default().with_todos(todos.clone()));
        assert_eq!(state.extensions.todos, todos);
        let state = state.merge(StateDelta::default());
        assert_eq!(state.extensions.todos.len(), 1);
    }

    #[test]
    fn test_final_assistant_text() {
        let state = State::with_messages(vec![
            Message::user("q"),
            Message::assistant("first"),
            Message::user("again"),
            Message::assistant("second"),
        ]);
        assert_eq!(state.final_assistant_text().as_deref(), Some("second"));
    }
}
