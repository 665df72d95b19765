//! 变量空间工具：var_set / var_get / var_list
//!
//! 让 Agent 把工具结果存进会话变量空间，之后作为证据 ref 引用。会话取自 ToolContext.session_id。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::memory::VariableSpace;
use crate::tools::schema::schema_of;
use crate::tools::{Tool, ToolCatalog, ToolContext};

const DEFAULT_LIST_LIMIT: usize = 20;

#[derive(Deserialize, JsonSchema)]
struct VarSetArgs {
    /// 变量键，建议带来源前缀，如 sql:revenue_2023
    key: String,
    /// 任意 JSON 值
    value: Value,
    /// 一行摘要，会出现在变量目录中
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize, JsonSchema)]
struct VarGetArgs {
    key: String,
}

#[derive(Deserialize, JsonSchema)]
struct VarListArgs {
    /// 只列出以此开头的键
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))
}

fn session(ctx: &ToolContext) -> Result<&str, String> {
    ctx.session_id
        .as_deref()
        .ok_or_else(|| "no variable session bound to this conversation".to_string())
}

pub struct VarSetTool {
    vars: Arc<VariableSpace>,
}

#[async_trait]
impl Tool for VarSetTool {
    fn name(&self) -> &str {
        "var_set"
    }

    fn description(&self) -> &str {
        "Store a JSON value in the session variable space under a key, with a one-line summary. \
         The key can later be cited as an evidence ref."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<VarSetArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String> {
        let args: VarSetArgs = parse_args(args)?;
        let entry = self
            .vars
            .set(session(ctx)?, &args.key, args.value, args.summary)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({
            "key": entry.key,
            "stored": true,
            "updated_at": entry.updated_at.to_rfc3339(),
        }))
    }
}

pub struct VarGetTool {
    vars: Arc<VariableSpace>,
}

#[async_trait]
impl Tool for VarGetTool {
    fn name(&self) -> &str {
        "var_get"
    }

    fn description(&self) -> &str {
        "Read a value previously stored in the session variable space."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<VarGetArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String> {
        let args: VarGetArgs = parse_args(args)?;
        let entry = self
            .vars
            .get(session(ctx)?, &args.key)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({
            "key": entry.key,
            "summary": entry.summary,
            "value": entry.value,
        }))
    }
}

pub struct VarListTool {
    vars: Arc<VariableSpace>,
}

#[async_trait]
impl Tool for VarListTool {
    fn name(&self) -> &str {
        "var_list"
    }

    fn description(&self) -> &str {
        "List keys and summaries in the session variable space, newest first."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<VarListArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String> {
        let args: VarListArgs = parse_args(args)?;
        let listed = self
            .vars
            .list(
                session(ctx)?,
                args.prefix.as_deref(),
                args.limit.unwrap_or(DEFAULT_LIST_LIMIT),
            )
            .await
            .map_err(|e| e.to_string())?;
        let entries: Vec<Value> = listed
            .into_iter()
            .map(|l| json!({"key": l.key, "summary": l.summary, "updated_at": l.updated_at.to_rfc3339()}))
            .collect();
        Ok(json!({ "entries": entries }))
    }
}

/// 注册三个变量工具，返回它们的名称
pub fn register_variable_tools(catalog: &mut ToolCatalog, vars: Arc<VariableSpace>) -> Vec<String> {
    catalog.register(VarSetTool { vars: vars.clone() });
    catalog.register(VarGetTool { vars: vars.clone() });
    catalog.register(VarListTool { vars });
    vec!["var_set".into(), "var_get".into(), "var_list".into()]
}
