//! 研究规划：让模型把问题拆成若干子任务，解析为 ResearchPlan
//!
//! 模型输出必须包含一个 JSON 对象 `{objective, tasks[]}`（可在 ```json 代码块中）；
//! 空计划或无法解析的计划直接失败，不做兜底。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::react::{PromptPipeline, PromptTree};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchTask {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub goal: String,
    #[serde(default)]
    pub suggested_tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchPlan {
    #[serde(default)]
    pub objective: String,
    pub tasks: Vec<ResearchTask>,
}

/// 取出文本中的 JSON 对象：优先 ```json 代码块，其次第一个能解析成对象的平衡 `{...}`
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let Some(end) = body.find("```") else { break };
        let candidate = body[..end].trim();
        if candidate.starts_with('{') && candidate.ends_with('}') {
            return Some(candidate);
        }
        rest = &body[end + 3..];
    }
    text.match_indices('{').find_map(|(start, _)| {
        let end = balanced_object_end(text, start)?;
        let candidate = &text[start..=end];
        matches!(serde_json::from_str::<serde_json::Value>(candidate), Ok(serde_json::Value::Object(_)))
            .then_some(candidate)
    })
}

/// start 处是 '{'，返回与之配对的 '}' 的字节下标；跳过 JSON 字符串内容
fn balanced_object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// 解析规划输出；缺失 / 重复的任务 id 依序补为 task_N，超出 max_tasks 的任务被截断
pub fn parse_plan(text: &str, max_tasks: usize) -> Result<ResearchPlan, AgentError> {
    let raw = extract_json_object(text)
        .ok_or_else(|| AgentError::MalformedOutput("plan output contains no JSON object".into()))?;
    let mut plan: ResearchPlan = serde_json::from_str(raw)
        .map_err(|e| AgentError::MalformedOutput(format!("plan JSON: {e}")))?;

    plan.tasks.retain(|t| !t.goal.trim().is_empty());
    if plan.tasks.is_empty() {
        return Err(AgentError::MalformedOutput("plan has no tasks".into()));
    }
    plan.tasks.truncate(max_tasks.max(1));

    let mut seen = std::collections::HashSet::new();
    for (i, task) in plan.tasks.iter_mut().enumerate() {
        let id = task.id.trim().to_string();
        task.id = if id.is_empty() || seen.contains(&id) {
            format!("task_{}", i + 1)
        } else {
            id
        };
        seen.insert(task.id.clone());
        if task.title.trim().is_empty() {
            task.title = task.goal.chars().take(60).collect();
        }
    }
    Ok(plan)
}

/// 规划阶段的 system prompt
pub fn planner_prompt(max_tasks: usize, available_tools: &[String]) -> String {
    let tools = if available_tools.is_empty() {
        "(none)".to_string()
    } else {
        available_tools.join(", ")
    };
    PromptPipeline::new()
        .section(
            "role",
            "You are a research planner. Decompose the user's question into independent \
             analysis tasks that can be worked on in parallel.",
        )
        .section(
            "format",
            format!(
                "Reply with a single JSON object and nothing else:\n\
                 {{\"objective\": \"...\", \"tasks\": [{{\"id\": \"task_1\", \"title\": \"...\", \
                 \"goal\": \"...\", \"suggestedTools\": [\"...\"]}}]}}\n\
                 Use at most {max_tasks} tasks."
            ),
        )
        .section("tools", format!("Tools available to analysts: {tools}"))
        .render(PromptTree::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_plan_assigns_ids_and_truncates() {
        let text = "Here is the plan:\n```json\n{\"objective\": \"revenue\", \"tasks\": [\
            {\"title\": \"A\", \"goal\": \"ga\", \"suggestedTools\": [\"sql_query\"]},\
            {\"id\": \"x\", \"goal\": \"gb\"},\
            {\"id\": \"x\", \"title\": \"C\", \"goal\": \"gc\"}]}\n```";
        let plan = parse_plan(text, 2).unwrap();
        assert_eq!(plan.objective, "revenue");
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[0].id, "task_1");
        assert_eq!(plan.tasks[0].suggested_tools, vec!["sql_query"]);
        assert_eq!(plan.tasks[1].id, "x");
        assert_eq!(plan.tasks[1].title, "gb");

        let plan = parse_plan(text, 5).unwrap();
        assert_eq!(plan.tasks[2].id, "task_3");
    }

    #[test]
    fn test_reject_empty_or_malformed_plan() {
        assert!(matches!(
            parse_plan("{\"objective\": \"x\", \"tasks\": []}", 3),
            Err(AgentError::MalformedOutput(_))
        ));
        assert!(matches!(parse_plan("no json here", 3), Err(AgentError::MalformedOutput(_))));
        assert!(matches!(
            parse_plan("{\"objective\": \"x\", \"tasks\": [{\"title\": 1}]}", 3),
            Err(AgentError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_extract_json_prefers_fence() {
        let text = "note {not json}\n```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json_object(text), Some("{\"a\": 1}"));
        assert_eq!(extract_json_object("x {\"b\": {\"c\": 2}} y"), Some("{\"b\": {\"c\": 2}}"));
        assert_eq!(extract_json_object("nothing"), None);
    }

    #[test]
    fn test_extract_json_skips_braces_in_prose() {
        let text = "Stored the rows as {sql:q1} first.\n{\"claims\": [], \"note\": \"see {x}\"} done";
        assert_eq!(extract_json_object(text), Some("{\"claims\": [], \"note\": \"see {x}\"}"));
        assert_eq!(extract_json_object("only {broken: json}"), None);
    }

    #[test]
    fn test_planner_prompt_mentions_limit() {
        let p = planner_prompt(4, &["sql_query".to_string()]);
        assert!(p.contains("at most 4 tasks"));
        assert!(p.contains("sql_query"));
    }
}
