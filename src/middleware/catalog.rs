//! 中间件目录：模块名 -> 模块，供配置驱动的管线装配使用

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::MiddlewareEntryConfig;
use crate::core::AgentError;
use crate::middleware::{
    FilesystemModule, HitlModule, MiddlewareModule, MiddlewareSpec, PatchToolCallsModule,
    SubAgentModule, TitleModule, TodoModule,
};

#[derive(Clone, Default)]
pub struct MiddlewareCatalog {
    modules: HashMap<String, Arc<dyn MiddlewareModule>>,
}

impl MiddlewareCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置模块：patch_tool_calls、todo、filesystem、hitl、title、subagent（无模板）
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(PatchToolCallsModule));
        catalog.register(Arc::new(TodoModule));
        catalog.register(Arc::new(FilesystemModule));
        catalog.register(Arc::new(HitlModule));
        catalog.register(Arc::new(TitleModule));
        catalog.register(Arc::new(SubAgentModule::new()));
        catalog
    }

    /// 同名模块后注册者覆盖
    pub fn register(&mut self, module: Arc<dyn MiddlewareModule>) {
        self.modules.insert(module.name().to_string(), module);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MiddlewareModule>> {
        self.modules.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn spec(&self, entry: &MiddlewareEntryConfig) -> Result<MiddlewareSpec, AgentError> {
        let module = self.get(entry.module_name()).ok_or_else(|| {
            AgentError::ConfigError(format!(
                "unknown middleware module '{}' (known: {})",
                entry.module_name(),
                self.names().join(", ")
            ))
        })?;
        let mut spec = MiddlewareSpec::from_arc(module).with_options(entry.options());
        if let Some(id) = entry.id() {
            spec = spec.with_id(id);
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_names() {
        let catalog = MiddlewareCatalog::with_builtin();
        assert_eq!(
            catalog.names(),
            vec!["filesystem", "hitl", "patch_tool_calls", "subagent", "title", "todo"]
        );
    }

    #[test]
    fn test_spec_carries_id_and_options() {
        let catalog = MiddlewareCatalog::with_builtin();
        let entry = MiddlewareEntryConfig::Full {
            module: "filesystem".into(),
            id: Some("fs_ro".into()),
            options: json!({"read_only": true}),
        };
        let spec = catalog.spec(&entry).unwrap();
        assert_eq!(spec.identity(), "fs_ro");
        assert_eq!(spec.module_name(), "filesystem");
        assert_eq!(spec.options["read_only"], json!(true));
    }
}
