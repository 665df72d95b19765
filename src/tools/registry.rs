//! 工具目录
//!
//! 工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolCatalog 按名注册；
//! 每次调用按启用白名单过滤。目录在进程内构建一次，之后以只读方式共享。

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::ToolSpec;

/// 传给每次工具执行的上下文
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolContext {
    pub thread_id: String,
    /// 变量空间会话；为 None 时变量工具不可用
    pub session_id: Option<String>,
    /// 研究分析任务会置位：结果需可作为证据引用
    pub require_evidence_refs: bool,
}

impl ToolContext {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_evidence_refs(mut self, required: bool) -> Self {
        self.require_evidence_refs = required;
        self
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON object）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String>;
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

type Handler = Box<dyn Fn(Value, ToolContext) -> ToolFuture + Send + Sync>;

/// 由闭包构造的工具，对应 register(name, schema, executor)
pub struct FnTool {
    name: String,
    description: String,
    schema: Value,
    handler: Handler,
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String> {
        (self.handler)(args, ctx.clone()).await
    }
}

#[derive(Default)]
pub struct ToolCatalog {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        f: F,
    ) where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.register(FnTool {
            name: name.into(),
            description: description.into(),
            schema,
            handler: Box::new(move |args, ctx| Box::pin(f(args, ctx))),
        });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 已注册且在白名单内的工具描述，按名称排序
    pub fn specs(&self, enabled: &BTreeSet<String>) -> Vec<ToolSpec> {
        enabled
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    /// 执行；未启用或未注册的工具返回 Err
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
        enabled: &BTreeSet<String>,
    ) -> Result<Value, String> {
        if !enabled.contains(name) {
            return Err(format!("Tool {name} is not enabled for this invocation"));
        }
        let tool = self.tools.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> ToolCatalog {
        let mut c = ToolCatalog::new();
        c.register_fn("sql_query", "Run SQL", json!({"type": "object"}), |args, _| async move {
            Ok(json!({"echo": args}))
        });
        c.register_fn("web_search", "Search", json!({"type": "object"}), |_, ctx| async move {
            Ok(json!({"thread": ctx.thread_id}))
        });
        c
    }

    #[test]
    fn test_specs_filtered_by_allowlist() {
        let c = catalog();
        let enabled: BTreeSet<String> = ["sql_query".to_string(), "ghost".to_string()].into();
        let specs = c.specs(&enabled);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "sql_query");
        assert!(c.specs(&BTreeSet::new()).is_empty());
    }

    #[tokio::test]
    async fn test_execute_respects_allowlist() {
        let c = catalog();
        let ctx = ToolContext::new("th");
        let enabled: BTreeSet<String> = ["web_search".to_string()].into();
        let out = c.execute("web_search", json!({}), &ctx, &enabled).await.unwrap();
        assert_eq!(out, json!({"thread": "th"}));
        let err = c.execute("sql_query", json!({}), &ctx, &enabled).await.unwrap_err();
        assert!(err.contains("not enabled"));
        let all: BTreeSet<String> = ["nope".to_string()].into();
        let err = c.execute("nope", json!({}), &ctx, &all).await.unwrap_err();
        assert!(err.contains("Unknown tool"));
    }
}
