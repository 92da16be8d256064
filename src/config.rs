//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__AGENT__MAX_ROUNDS=10`）。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::middleware::hitl::GateConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub hitl: HitlSection,
    pub subagents: SubAgentsSection,
    pub store: StoreSection,
    pub supervisor: SupervisorSection,
}

/// [agent] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_base_prompt")]
    pub base_prompt: String,
    /// 单次运行内最多调用模型的次数
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// 无入站消息多久后关闭整棵监管树；0 表示不关闭
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    /// 中间件（按模块名），依次装配；patch_tool_calls 始终在最前
    #[serde(default = "default_middleware")]
    pub middleware: Vec<MiddlewareEntryConfig>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            base_prompt: default_base_prompt(),
            max_rounds: default_max_rounds(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            middleware: default_middleware(),
        }
    }
}

fn default_agent_name() -> String {
    "hive".to_string()
}

fn default_base_prompt() -> String {
    "You are a helpful assistant. Use the available tools when they help.".to_string()
}

fn default_max_rounds() -> usize {
    25
}

fn default_inactivity_timeout_secs() -> u64 {
    300
}

fn default_middleware() -> Vec<MiddlewareEntryConfig> {
    ["todo", "filesystem", "subagent", "hitl"]
        .into_iter()
        .map(MiddlewareEntryConfig::module)
        .collect()
}

/// 一个中间件条目：模块名 + 可选显式 id + options
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MiddlewareEntryConfig {
    Name(String),
    Full {
        module: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        options: Value,
    },
}

impl MiddlewareEntryConfig {
    pub fn module(name: &str) -> Self {
        MiddlewareEntryConfig::Name(name.to_string())
    }

    pub fn module_name(&self) -> &str {
        match self {
            MiddlewareEntryConfig::Name(name) => name,
            MiddlewareEntryConfig::Full { module, .. } => module,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            MiddlewareEntryConfig::Name(_) => None,
            MiddlewareEntryConfig::Full { id, .. } => id.as_deref(),
        }
    }

    pub fn options(&self) -> Value {
        match self {
            MiddlewareEntryConfig::Name(_) => Value::Null,
            MiddlewareEntryConfig::Full { options, .. } => options.clone(),
        }
    }
}

/// [tools] 段：单次工具调用超时与并发上限
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            max_parallel: default_max_parallel(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_parallel() -> usize {
    3
}

/// [hitl] 段：`[hitl.interrupt_on]` 工具名 -> true / false / { allowed_decisions = [...] }
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HitlSection {
    #[serde(default)]
    pub interrupt_on: BTreeMap<String, GateConfig>,
}

/// [subagents] 段
#[derive(Debug, Clone, Deserialize)]
pub struct SubAgentsSection {
    /// 是否提供 general-purpose 类型
    #[serde(default = "default_true")]
    pub general_purpose: bool,
    /// general-purpose 子智能体不继承的中间件 id
    #[serde(default)]
    pub denylist: Vec<String>,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default)]
    pub templates: Vec<SubAgentTemplateConfig>,
}

impl Default for SubAgentsSection {
    fn default() -> Self {
        Self {
            general_purpose: true,
            denylist: Vec::new(),
            max_prompt_chars: default_max_prompt_chars(),
            templates: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_prompt_chars() -> usize {
    10_000
}

/// [[subagents.templates]]：预配置的子智能体
#[derive(Debug, Clone, Deserialize)]
pub struct SubAgentTemplateConfig {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    /// 从父智能体工具中挑选（按名称）
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub middleware: Vec<MiddlewareEntryConfig>,
}

/// [store] 段：虚拟文件存储
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// 未设置时只保存在内存中
    pub sqlite_path: Option<PathBuf>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            sqlite_path: None,
        }
    }
}

fn default_debounce_ms() -> u64 {
    500
}

/// [supervisor] 段：重启强度
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
        }
    }
}

fn default_max_restarts() -> usize {
    3
}

fn default_restart_window_secs() -> u64 {
    5
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_rounds, 25);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.subagents.max_prompt_chars, 10_000);
        assert!(cfg.subagents.general_purpose);
        assert_eq!(cfg.agent.middleware.len(), 4);
        assert!(cfg.store.sqlite_path.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[agent]
name = "researcher"
max_rounds = 7
inactivity_timeout_secs = 0
middleware = ["todo", {{ module = "hitl", id = "review" }}]

[hitl.interrupt_on]
write_file = true
shell = {{ allowed_decisions = ["approve", "reject"] }}

[subagents]
denylist = ["title"]

[[subagents.templates]]
name = "critic"
description = "Reviews drafts"
system_prompt = "You review drafts."
tools = ["internet_search"]
"#
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.name, "researcher");
        assert_eq!(cfg.agent.max_rounds, 7);
        assert_eq!(cfg.agent.inactivity_timeout_secs, 0);
        assert_eq!(cfg.agent.middleware[0], MiddlewareEntryConfig::module("todo"));
        assert_eq!(cfg.agent.middleware[1].id(), Some("review"));
        assert_eq!(cfg.hitl.interrupt_on["write_file"], GateConfig::Enabled(true));
        assert!(matches!(cfg.hitl.interrupt_on["shell"], GateConfig::Custom { .. }));
        assert_eq!(cfg.subagents.denylist, vec!["title"]);
        assert_eq!(cfg.subagents.templates[0].tools, vec!["internet_search"]);
    }
}
