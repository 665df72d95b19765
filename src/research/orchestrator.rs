//! 研究编排：规划 -> 并发分析 -> 汇总
//!
//! 分析阶段每个任务是一次独立的状态机调用（要求证据引用、结构化 CoA 输出）；
//! 悬空引用按 RecoveryEngine 的策略带强化提示重试，用尽后该任务失败，整个运行失败且不返回部分结果。
//! 第一个失败的任务会取消子令牌，排队中和运行中的兄弟任务在下一个检查点边界停止。

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine, WorkerPool, DEFAULT_MAX_ATTEMPTS};
use crate::llm::LlmClient;
use crate::memory::{Message, VariableSpace};
use crate::react::{AgentStateMachine, AgentTurn, EventSink, PromptPipeline, PromptTree};
use crate::research::coa::{parse_coa, validate_evidence, CoABlock};
use crate::research::plan::{parse_plan, planner_prompt, ResearchPlan, ResearchTask};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub max_tasks: usize,
    /// <= 0 按 1 处理
    pub concurrency: i64,
    pub max_tool_rounds_per_task: u32,
    /// 每个任务的总尝试次数（含首次）
    pub max_attempts: u32,
    pub plan_key: String,
    pub coa_key_prefix: String,
    pub coa_index_key: String,
    /// 拼入分析提示词的变量目录条数
    pub directory_limit: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_tasks: 6,
            concurrency: 3,
            max_tool_rounds_per_task: 6,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            plan_key: "research:plan".to_string(),
            coa_key_prefix: "research:coa:".to_string(),
            coa_index_key: "research:coa_index".to_string(),
            directory_limit: 30,
        }
    }
}

/// 一次研究运行的输入
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    pub question: String,
    pub session_id: String,
    /// 分析任务可用的工具（通常包含 var_set / var_get / var_list）
    pub enabled_tools: BTreeSet<String>,
}

impl ResearchRequest {
    pub fn new(question: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: session_id.into(),
            enabled_tools: BTreeSet::new(),
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_tools = tools.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResearchOutcome {
    pub run_id: String,
    pub plan: ResearchPlan,
    /// 与计划任务顺序一致
    pub coa_keys: Vec<String>,
}

pub struct ResearchOrchestrator {
    llm: Arc<dyn LlmClient>,
    agent: Arc<AgentStateMachine>,
    vars: Arc<VariableSpace>,
    recovery: RecoveryEngine,
    config: ResearchConfig,
}

impl ResearchOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        agent: Arc<AgentStateMachine>,
        vars: Arc<VariableSpace>,
        config: ResearchConfig,
    ) -> Self {
        Self {
            llm,
            agent,
            vars,
            recovery: RecoveryEngine::new(),
            config,
        }
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    pub async fn run(&self, request: ResearchRequest, cancel: &CancellationToken) -> Result<ResearchOutcome, AgentError> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!(run_id = %run_id, session_id = %request.session_id, "research started");

        let plan = self.plan(&request, cancel).await?;
        tracing::info!(run_id = %run_id, tasks = plan.tasks.len(), "research plan ready");

        let blocks = self.analyze(&run_id, &request, &plan, cancel).await?;
        let coa_keys = self.aggregate(&request.session_id, &plan, blocks).await?;
        tracing::info!(run_id = %run_id, blocks = coa_keys.len(), "research finished");

        Ok(ResearchOutcome {
            run_id,
            plan,
            coa_keys,
        })
    }

    /// 规划阶段：解析失败直接终止
    async fn plan(&self, request: &ResearchRequest, cancel: &CancellationToken) -> Result<ResearchPlan, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let tools: Vec<String> = request.enabled_tools.iter().cloned().collect();
        let messages = vec![
            Message::system(planner_prompt(self.config.max_tasks, &tools)),
            Message::user(request.question.clone()),
        ];
        let text = self.llm.complete(&messages).await.map_err(AgentError::LlmError)?;
        let plan = parse_plan(&text, self.config.max_tasks)?;

        let summary = format!(
            "Research plan: {} ({} tasks)",
            if plan.objective.is_empty() { &request.question } else { &plan.objective },
            plan.tasks.len()
        );
        self.vars
            .set(
                &request.session_id,
                &self.config.plan_key,
                serde_json::to_value(&plan).map_err(crate::core::StorageError::from)?,
                summary,
            )
            .await?;
        Ok(plan)
    }

    /// 分析阶段：WorkerPool 扇出；报告计划顺序中第一个非取消错误
    async fn analyze(
        &self,
        run_id: &str,
        request: &ResearchRequest,
        plan: &ResearchPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<CoABlock>, AgentError> {
        let run_token = cancel.child_token();
        let pool = WorkerPool::new(self.config.concurrency);
        let outcomes = pool
            .run(plan.tasks.clone(), |_, task| {
                let run_token = run_token.clone();
                async move {
                    let result = self.analyze_task(run_id, request, &task, &run_token).await;
                    if let Err(e) = &result {
                        if !e.is_cancelled() {
                            tracing::warn!(run_id, task_id = %task.id, error = %e, "task failed, cancelling run");
                            run_token.cancel();
                        }
                    }
                    result
                }
            })
            .await;

        let mut blocks = Vec::with_capacity(outcomes.len());
        let mut cancelled = false;
        let mut first_error: Option<AgentError> = None;
        for (task, outcome) in plan.tasks.iter().zip(outcomes) {
            let result = outcome
                .unwrap_or_else(|panic| Err(AgentError::InvalidState(format!("task {}: {panic}", task.id))));
            match result {
                Ok(block) => blocks.push(block),
                Err(e) if e.is_cancelled() => cancelled = true,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if cancelled {
            return Err(AgentError::Cancelled);
        }
        Ok(blocks)
    }

    /// 单个任务：调用状态机 -> 解析 CoA -> 校验引用；悬空引用按恢复策略重试
    async fn analyze_task(
        &self,
        run_id: &str,
        request: &ResearchRequest,
        task: &ResearchTask,
        cancel: &CancellationToken,
    ) -> Result<CoABlock, AgentError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut addendum: Option<String> = None;
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let directory = self
                .vars
                .build_directory_summary(&request.session_id, self.config.directory_limit)
                .await?;
            let system_prompt = analysis_prompt(task, &directory, addendum.as_deref());
            let thread_id = format!("research-{run_id}-{}-{attempt}", task.id);
            let turn = AgentTurn::new(thread_id.clone(), task_message(task))
                .with_system_prompt(system_prompt)
                .with_tools(request.enabled_tools.iter().cloned())
                .with_max_tool_rounds(self.config.max_tool_rounds_per_task)
                .with_session(request.session_id.clone())
                .require_evidence_refs();
            tracing::debug!(run_id, task_id = %task.id, attempt, "analysis attempt");

            let out = self.agent.invoke(turn, &EventSink::silent(thread_id), cancel).await?;
            let block = parse_coa(&out.content, task)?;
            let err = match validate_evidence(&block, &self.vars, &request.session_id).await {
                Ok(()) => return Ok(block),
                Err(e) => e,
            };
            match self.recovery.handle(&err, attempt, max_attempts) {
                RecoveryAction::RetryWithPrompt(p) => {
                    tracing::warn!(run_id, task_id = %task.id, attempt, error = %err, "dangling evidence refs, retrying");
                    addendum = Some(p);
                    attempt += 1;
                }
                RecoveryAction::Abort => return Err(err),
            }
        }
    }

    /// 汇总阶段：每个 CoA 一个键，另写一份按计划顺序排列的键索引
    async fn aggregate(
        &self,
        session_id: &str,
        plan: &ResearchPlan,
        blocks: Vec<CoABlock>,
    ) -> Result<Vec<String>, AgentError> {
        let mut keys = Vec::with_capacity(blocks.len());
        for block in blocks {
            let key = format!("{}{}", self.config.coa_key_prefix, block.id);
            let summary = block
                .claims
                .first()
                .map(|c| format!("{}: {}", block.title, c.statement))
                .unwrap_or_else(|| block.title.clone());
            let value = serde_json::to_value(&block).map_err(crate::core::StorageError::from)?;
            self.vars.set(session_id, &key, value, summary).await?;
            keys.push(key);
        }
        self.vars
            .set(
                session_id,
                &self.config.coa_index_key,
                json!(keys),
                format!("CoA blocks for: {}", plan.objective),
            )
            .await?;
        Ok(keys)
    }
}

fn task_message(task: &ResearchTask) -> String {
    let mut s = format!("Task {}: {}\nGoal: {}", task.id, task.title, task.goal);
    if !task.suggested_tools.is_empty() {
        s.push_str(&format!("\nSuggested tools: {}", task.suggested_tools.join(", ")));
    }
    s
}

const COA_CONTRACT: &str = "Finish with a single JSON object (Chain-of-Analysis) and nothing else:\n\
{\"claims\": [{\"statement\": \"...\", \"confidence\": 0.0}], \
\"evidence\": [{\"source\": \"<tool name or llm>\", \"note\": \"...\", \"ref\": \"<variable key>\"}], \
\"limitations\": [\"...\"], \"nextQuestions\": [\"...\"]}";

const EVIDENCE_DEMAND: &str = "Every evidence item whose source is not \"llm\" must carry a `ref` that is an \
existing key in the variable space. Store tool results with var_set and cite the key you used.";

/// 分析任务的 system prompt；重试时末尾追加强化约束
pub fn analysis_prompt(task: &ResearchTask, directory: &str, addendum: Option<&str>) -> String {
    let mut pipeline = PromptPipeline::new()
        .section(
            "role",
            format!("You are a research analyst working on task \"{}\".", task.title),
        )
        .section("contract", COA_CONTRACT)
        .section("evidence", EVIDENCE_DEMAND)
        .section("directory", directory);
    if let Some(extra) = addendum {
        let extra = extra.to_string();
        pipeline = pipeline.then(move |mut tree| {
            let evidence = tree.section("evidence").unwrap_or_default().to_string();
            tree.upsert("evidence", format!("{evidence}\n{extra}"));
            tree
        });
    }
    pipeline.render(PromptTree::new())
}
