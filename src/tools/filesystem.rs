//! 虚拟文件系统工具
//!
//! 所有读写经由 agent 的文件存储（FileStore）完成，与父子智能体共享。
//! 路径统一规范化为相对路径，禁止 `..` 逃逸；写入与删除同时更新 State 中的文件索引。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::StateDelta;
use crate::store::StoreError;
use crate::tools::schema::{parse_args, schema_of};
use crate::tools::{Tool, ToolContext, ToolOutput};

/// 规范化路径：去掉前导 `./` 与 `/`，拒绝空路径与 `..`
pub fn normalize_path(path: &str) -> Result<String, String> {
    let trimmed = path.trim().trim_start_matches("./").trim_start_matches('/');
    if trimmed.is_empty() {
        return Err("path must not be empty".into());
    }
    let mut parts = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(format!("path escapes the workspace: {path}")),
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

fn store_error(path: &str, e: StoreError) -> String {
    match e {
        StoreError::NotFound(_) => format!("File not found: {path}"),
        other => format!("File store error: {other}"),
    }
}

#[derive(Deserialize, JsonSchema)]
struct LsArgs {
    /// 只列出该前缀（目录）下的文件
    #[serde(default)]
    path: Option<String>,
}

/// 列出文件
pub struct LsTool;

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List files in the virtual filesystem. Args: {\"path\": \"optional directory prefix\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<LsArgs>()
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: LsArgs = parse_args(self.name(), args)?;
        let prefix = match args.path.as_deref().map(str::trim) {
            None | Some("") | Some(".") | Some("/") => None,
            Some(p) => Some(format!("{}/", normalize_path(p)?)),
        };
        let files = ctx.store()?.list().await.map_err(|e| store_error(".", e))?;
        let files: Vec<String> = files
            .into_iter()
            .filter(|f| prefix.as_deref().map_or(true, |p| f.starts_with(p)))
            .collect();
        tracing::debug!(count = files.len(), "ls tool execute");
        if files.is_empty() {
            Ok("No files found.".into())
        } else {
            Ok(files.join("\n").into())
        }
    }
}

#[derive(Deserialize, JsonSchema)]
struct ReadArgs {
    path: String,
    /// 起始行（从 0 开始）
    #[serde(default)]
    offset: usize,
    /// 最多读取的行数
    #[serde(default)]
    limit: Option<usize>,
}

/// 读取文件（带行号）
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the virtual filesystem with line numbers. Args: {\"path\": \"...\", \"offset\": 0, \"limit\": 200}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ReadArgs>()
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: ReadArgs = parse_args(self.name(), args)?;
        let path = normalize_path(&args.path)?;
        let content = ctx
            .store()?
            .read(&path)
            .await
            .map_err(|e| store_error(&path, e))?;
        if content.is_empty() {
            return Ok(format!("{path} is empty.").into());
        }
        let limit = args.limit.unwrap_or(usize::MAX);
        let lines: Vec<String> = content
            .lines()
            .enumerate()
            .skip(args.offset)
            .take(limit)
            .map(|(i, line)| format!("{:>6}\t{}", i + 1, line))
            .collect();
        if lines.is_empty() {
            return Err(format!("offset {} is past the end of {path}", args.offset));
        }
        Ok(lines.join("\n").into())
    }
}

#[derive(Deserialize, JsonSchema)]
struct WriteArgs {
    path: String,
    content: String,
}

/// 写入（覆盖）文件
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file. Args: {\"path\": \"...\", \"content\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<WriteArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: WriteArgs = parse_args(self.name(), args)?;
        let path = normalize_path(&args.path)?;
        let bytes = args.content.len();
        ctx.store()?
            .write(&path, args.content)
            .await
            .map_err(|e| store_error(&path, e))?;
        tracing::info!(path = %path, bytes, "write_file tool execute");
        Ok(ToolOutput::WithState {
            content: format!("Wrote {bytes} bytes to {path}"),
            delta: StateDelta::default().file_added(path),
        })
    }
}

#[derive(Deserialize, JsonSchema)]
struct EditArgs {
    path: String,
    old_string: String,
    new_string: String,
    /// 替换全部出现；默认要求 old_string 唯一
    #[serde(default)]
    replace_all: bool,
}

/// 字符串替换式编辑
pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace text in a file. Args: {\"path\": \"...\", \"old_string\": \"...\", \"new_string\": \"...\", \"replace_all\": false}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EditArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: EditArgs = parse_args(self.name(), args)?;
        let path = normalize_path(&args.path)?;
        if args.old_string.is_empty() {
            return Err("old_string must not be empty".into());
        }
        let store = ctx.store()?;
        let content = store.read(&path).await.map_err(|e| store_error(&path, e))?;
        let occurrences = content.matches(&args.old_string).count();
        if occurrences == 0 {
            return Err(format!("old_string not found in {path}"));
        }
        if occurrences > 1 && !args.replace_all {
            return Err(format!(
                "old_string appears {occurrences} times in {path}; pass replace_all or add context"
            ));
        }
        let updated = if args.replace_all {
            content.replace(&args.old_string, &args.new_string)
        } else {
            content.replacen(&args.old_string, &args.new_string, 1)
        };
        store
            .write(&path, updated)
            .await
            .map_err(|e| store_error(&path, e))?;
        Ok(format!("Replaced {occurrences} occurrence(s) in {path}").into())
    }
}

#[derive(Deserialize, JsonSchema)]
struct DeleteArgs {
    path: String,
}

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file. Args: {\"path\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<DeleteArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let args: DeleteArgs = parse_args(self.name(), args)?;
        let path = normalize_path(&args.path)?;
        ctx.store()?
            .delete(&path)
            .await
            .map_err(|e| store_error(&path, e))?;
        Ok(ToolOutput::WithState {
            content: format!("Deleted {path}"),
            delta: StateDelta::default().file_removed(path),
        })
    }
}
