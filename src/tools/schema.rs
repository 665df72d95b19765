//! 工具参数 JSON Schema 生成（schemars）
//!
//! 参数结构体 derive JsonSchema，生成的 schema 直接作为 ToolSpec.parameters 提供给模型。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 返回类型 T 的 JSON Schema；生成失败时退化为任意 object
pub fn schema_of<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
    }
    value
}

/// schema 中 required 字段的顺序；文本回退解析用它给位置参数命名
pub fn required_params(schema: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}
