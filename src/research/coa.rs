//! Chain-of-Analysis（CoA）块：解析与证据引用校验
//!
//! 每条 source 不为 "llm" 的证据都必须带 ref，且 ref 是变量空间中存在的键。

use serde::{Deserialize, Serialize};

use crate::core::{AgentError, StorageError};
use crate::memory::VariableSpace;
use crate::research::plan::{extract_json_object, ResearchTask};

/// 置信度：数值或标签（high / medium / low）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Confidence {
    Score(f64),
    Label(String),
}

impl Default for Confidence {
    fn default() -> Self {
        Confidence::Label("unknown".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub statement: String,
    #[serde(default)]
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub source: String,
    #[serde(default)]
    pub note: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl Evidence {
    /// 模型自身知识不需要引用
    pub fn needs_ref(&self) -> bool {
        !self.source.trim().eq_ignore_ascii_case("llm")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoABlock {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub goal: String,
    pub claims: Vec<Claim>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub limitations: Vec<String>,
    #[serde(default)]
    pub next_questions: Vec<String>,
}

/// 解析任务输出；id / title / goal 以任务本身为准
pub fn parse_coa(text: &str, task: &ResearchTask) -> Result<CoABlock, AgentError> {
    let raw = extract_json_object(text).ok_or_else(|| {
        AgentError::MalformedOutput(format!("task {} produced no CoA JSON object", task.id))
    })?;
    let mut block: CoABlock = serde_json::from_str(raw)
        .map_err(|e| AgentError::MalformedOutput(format!("task {} CoA JSON: {e}", task.id)))?;
    block.id = task.id.clone();
    if block.title.trim().is_empty() {
        block.title = task.title.clone();
    }
    if block.goal.trim().is_empty() {
        block.goal = task.goal.clone();
    }
    Ok(block)
}

/// 找出无法解析的证据引用；缺失的 ref 记为 `<missing ref: source>`
pub async fn dangling_refs(
    block: &CoABlock,
    vars: &VariableSpace,
    session_id: &str,
) -> Result<Vec<String>, StorageError> {
    let mut dangling = Vec::new();
    for ev in block.evidence.iter().filter(|e| e.needs_ref()) {
        match ev.reference.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            None => dangling.push(format!("<missing ref: {}>", ev.source)),
            Some(r) => match vars.get(session_id, r).await {
                Ok(_) => {}
                Err(StorageError::NotFound(_)) => dangling.push(r.to_string()),
                Err(e) => return Err(e),
            },
        }
    }
    Ok(dangling)
}

/// 校验证据完整性；悬空引用返回 EvidenceIntegrity，存储错误原样传播
pub async fn validate_evidence(block: &CoABlock, vars: &VariableSpace, session_id: &str) -> Result<(), AgentError> {
    let dangling = dangling_refs(block, vars, session_id).await?;
    if dangling.is_empty() {
        Ok(())
    } else {
        Err(AgentError::EvidenceIntegrity {
            task_id: block.id.clone(),
            dangling,
        })
    }
}
