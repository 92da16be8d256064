//! 文件系统中间件：暴露虚拟文件工具与使用说明

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::middleware::{parse_options, Middleware, MiddlewareModule, SystemPromptProvider, ToolProvider};
use crate::tools::filesystem::{DeleteFileTool, EditFileTool, LsTool, ReadFileTool, WriteFileTool};
use crate::tools::Tool;

pub const MODULE_NAME: &str = "filesystem";

const FILESYSTEM_PROMPT: &str = "## Filesystem
You have access to a virtual filesystem shared with your sub-agents.
- ls: list files
- read_file: read a file with line numbers
- write_file: create or overwrite a file
- edit_file: replace exact text in a file
- delete_file: remove a file
Paths are relative; `..` is not allowed.";

const READ_ONLY_PROMPT: &str = "## Filesystem
You can inspect a virtual filesystem with `ls` and `read_file`. It is read-only for you.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemOptions {
    /// 只暴露 ls 与 read_file
    #[serde(default)]
    pub read_only: bool,
}

pub struct Filesystem {
    options: FilesystemOptions,
}

impl SystemPromptProvider for Filesystem {
    fn system_prompt(&self) -> String {
        if self.options.read_only {
            READ_ONLY_PROMPT.to_string()
        } else {
            FILESYSTEM_PROMPT.to_string()
        }
    }
}

impl ToolProvider for Filesystem {
    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = vec![Arc::new(LsTool), Arc::new(ReadFileTool)];
        if !self.options.read_only {
            tools.push(Arc::new(WriteFileTool));
            tools.push(Arc::new(EditFileTool));
            tools.push(Arc::new(DeleteFileTool));
        }
        tools
    }
}

impl Middleware for Filesystem {
    fn as_prompt_provider(&self) -> Option<&dyn SystemPromptProvider> {
        Some(self)
    }

    fn as_tool_provider(&self) -> Option<&dyn ToolProvider> {
        Some(self)
    }
}

pub struct FilesystemModule;

impl MiddlewareModule for FilesystemModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn init(&self, options: &Value) -> Result<Arc<dyn Middleware>, String> {
        Ok(Arc::new(Filesystem {
            options: parse_options(options)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_names(options: Value) -> Vec<String> {
        let mw = FilesystemModule.init(&options).unwrap();
        mw.as_tool_provider()
            .unwrap()
            .tools()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    #[test]
    fn test_default_exposes_all_tools() {
        assert_eq!(
            tool_names(Value::Null),
            vec!["ls", "read_file", "write_file", "edit_file", "delete_file"]
        );
    }

    #[test]
    fn test_read_only_mode() {
        assert_eq!(tool_names(json!({"read_only": true})), vec!["ls", "read_file"]);
    }
}
