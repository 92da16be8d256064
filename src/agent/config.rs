//! Agent 配置：模型、工具、中间件与运行/监管参数
//!
//! 既可以用 builder 方法在代码里组装，也可以由 `from_app_config` 从 config/default.toml 生成。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::middleware::patch::{self, PatchToolCallsModule};
use crate::middleware::{hitl, subagent, MiddlewareCatalog, MiddlewareSpec, SubAgentTemplate};
use crate::store::{FileBackend, MemoryBackend, SqliteBackend};
use crate::tools::Tool;

#[derive(Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub base_prompt: String,
    pub model: Arc<dyn LlmClient>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub middleware: Vec<MiddlewareSpec>,
    /// 自动在管线最前面插入 patch_tool_calls
    pub patch_tool_calls: bool,
    pub max_rounds: usize,
    pub tool_timeout_secs: u64,
    pub max_parallel_tools: usize,
    /// None 表示不因空闲而关闭
    pub inactivity_timeout: Option<Duration>,
    pub store_backend: Arc<dyn FileBackend>,
    pub store_debounce: Duration,
    pub max_restarts: usize,
    pub restart_window: Duration,
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, model: Arc<dyn LlmClient>) -> Self {
        Self {
            agent_id: agent_id.into(),
            base_prompt: String::new(),
            model,
            tools: Vec::new(),
            middleware: Vec::new(),
            patch_tool_calls: true,
            max_rounds: 25,
            tool_timeout_secs: 30,
            max_parallel_tools: 3,
            inactivity_timeout: None,
            store_backend: Arc::new(MemoryBackend::new()),
            store_debounce: Duration::from_millis(500),
            max_restarts: 3,
            restart_window: Duration::from_secs(5),
        }
    }

    pub fn with_base_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.base_prompt = prompt.into();
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_middleware(mut self, spec: MiddlewareSpec) -> Self {
        self.middleware.push(spec);
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_tool_timeout(mut self, secs: u64) -> Self {
        self.tool_timeout_secs = secs;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_store_backend(mut self, backend: Arc<dyn FileBackend>) -> Self {
        self.store_backend = backend;
        self
    }

    pub fn with_store_debounce(mut self, debounce: Duration) -> Self {
        self.store_debounce = debounce;
        self
    }

    /// window 内重启超过 max_restarts 次则整棵树停止
    pub fn with_restart_intensity(mut self, max_restarts: usize, window: Duration) -> Self {
        self.max_restarts = max_restarts;
        self.restart_window = window;
        self
    }

    pub fn without_patch(mut self) -> Self {
        self.patch_tool_calls = false;
        self
    }

    /// 实际装配的中间件：配置里没有 patch_tool_calls 时插到最前
    pub fn effective_middleware(&self) -> Vec<MiddlewareSpec> {
        let has_patch = self
            .middleware
            .iter()
            .any(|spec| spec.module_name() == patch::MODULE_NAME);
        if !self.patch_tool_calls || has_patch {
            return self.middleware.clone();
        }
        let mut specs = Vec::with_capacity(self.middleware.len() + 1);
        specs.push(MiddlewareSpec::new(PatchToolCallsModule));
        specs.extend(self.middleware.iter().cloned());
        specs
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// 由应用配置组装：模块名经 catalog 解析，hitl / subagent 的 options 由对应配置段补齐。
    /// agent_id 取 `[agent] name`，SQLite 后端据此在重启后找回文件
    pub fn from_app_config(
        app: &AppConfig,
        model: Arc<dyn LlmClient>,
        catalog: &MiddlewareCatalog,
    ) -> Result<Self, AgentError> {
        let mut config = AgentConfig::new(app.agent.name.clone(), model)
            .with_base_prompt(app.agent.base_prompt.clone())
            .with_max_rounds(app.agent.max_rounds)
            .with_tool_timeout(app.tools.tool_timeout_secs)
            .with_inactivity_timeout(match app.agent.inactivity_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            })
            .with_store_debounce(Duration::from_millis(app.store.debounce_ms))
            .with_restart_intensity(
                app.supervisor.max_restarts,
                Duration::from_secs(app.supervisor.restart_window_secs),
            );
        config.max_parallel_tools = app.tools.max_parallel;

        if let Some(path) = &app.store.sqlite_path {
            let backend = SqliteBackend::open(path)?;
            config = config.with_store_backend(Arc::new(backend));
        }

        for entry in &app.agent.middleware {
            let mut spec = catalog.spec(entry)?;
            if spec.options.is_null() {
                match spec.module_name() {
                    hitl::MODULE_NAME => {
                        spec = spec.with_options(json!({ "interrupt_on": app.hitl.interrupt_on }));
                    }
                    subagent::MODULE_NAME => {
                        spec = spec.with_options(json!({
                            "general_purpose": app.subagents.general_purpose,
                            "denylist": app.subagents.denylist,
                            "max_prompt_chars": app.subagents.max_prompt_chars,
                        }));
                    }
                    _ => {}
                }
            }
            if spec.module_name() == subagent::MODULE_NAME {
                let mut module = subagent::SubAgentModule::new();
                for template in &app.subagents.templates {
                    let mut middleware = Vec::with_capacity(template.middleware.len());
                    for entry in &template.middleware {
                        middleware.push(catalog.spec(entry)?);
                    }
                    module = module.with_template(SubAgentTemplate {
                        name: template.name.clone(),
                        description: template.description.clone(),
                        system_prompt: template.system_prompt.clone(),
                        tools: template.tools.clone(),
                        middleware,
                    });
                }
                let mut replaced = MiddlewareSpec::new(module).with_options(spec.options.clone());
                replaced.id = spec.id.clone();
                spec = replaced;
            }
            config = config.with_middleware(spec);
        }
        Ok(config)
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("agent_id", &self.agent_id)
            .field("tools", &self.tool_names())
            .field("middleware", &self.middleware)
            .field("max_rounds", &self.max_rounds)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .finish()
    }
}
