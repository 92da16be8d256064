//! 工具参数 JSON Schema 生成（schemars）
//!
//! 工具的参数结构体 derive `JsonSchema`，这里转成暴露给模型的 `parameters`。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 参数类型的 JSON Schema；生成失败时退化为空对象 schema
pub fn schema_of<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    })
}

/// 反序列化工具参数，错误信息直接返回给模型
pub fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments for {tool}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct Args {
        /// 文件路径
        path: String,
        limit: Option<usize>,
    }

    #[test]
    fn test_schema_lists_required_fields() {
        let schema = schema_of::<Args>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["path"].is_object());
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "path"));
        assert!(!required.iter().any(|v| v == "limit"));
    }

    #[test]
    fn test_parse_args_error_names_tool() {
        let err = parse_args::<Args>("read_file", serde_json::json!({})).err().unwrap();
        assert!(err.starts_with("invalid arguments for read_file"));
    }
}
