//! 工具执行器
//!
//! 持有 ToolCatalog 与全局超时，对每次调用施加超时；失败 / 超时在这里被编码为 ToolResult 的错误负载，
//! 绝不以错误形式传出。每次调用输出结构化审计日志（JSON）。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::timeout;

use crate::core::AgentError;
use crate::memory::ToolCall;
use crate::tools::{ToolCatalog, ToolContext};

/// 与 ToolCall 一一对应的执行结果；失败时 payload 为 {"error": "..."}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub success: bool,
    pub payload: Value,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, payload: Value) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            success: true,
            payload,
        }
    }

    pub fn error(call: &ToolCall, err: &AgentError) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            success: false,
            payload: json!({ "error": err.to_string() }),
        }
    }

    /// 写入 tool 消息的文本；字符串负载原样返回
    pub fn to_message_content(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

pub struct ToolExecutor {
    catalog: Arc<ToolCatalog>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(catalog: Arc<ToolCatalog>, timeout_secs: u64) -> Self {
        Self {
            catalog,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行单个调用；永远返回 ToolResult
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext, enabled: &BTreeSet<String>) -> ToolResult {
        let start = Instant::now();
        let args_preview = args_preview(&call.arguments);
        let result = timeout(
            self.timeout,
            self.catalog.execute(&call.name, call.arguments.clone(), ctx, enabled),
        )
        .await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "thread_id": ctx.thread_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(payload)) => ToolResult::ok(call, payload),
            Ok(Err(e)) => ToolResult::error(call, &AgentError::ToolExecutionFailed(e)),
            Err(_) => ToolResult::error(call, &AgentError::ToolTimeout(call.name.clone())),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
