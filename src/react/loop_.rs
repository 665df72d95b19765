//! 工具调用状态机主循环
//!
//! LLM_CALL -> (TOOL_EXEC -> LLM_CALL)* -> END，工具调用轮数到上限时经 MAX_ROUNDS 结束。
//! 每次节点转移后写一个检查点；取消令牌在每次模型调用前、每个工具执行前检查。
//! 一次调用的事件流总以恰好一个 done 或 error 结束。

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{extract_usage, resolve_usage, LlmClient, TokenUsage, UsageHeuristics};
use crate::memory::{
    append_message, sanitize_for_model, Checkpoint, CheckpointMeta, CheckpointStore, Message, ToolCall,
};
use crate::react::events::{EventKind, EventSink};
use crate::react::state::{next_node, GraphState, NodeKind};
use crate::react::tool_calls::{parse_text_tool_calls, ToolCallCollector};
use crate::tools::{required_params, ToolContext, ToolExecutor};

/// 轮数上限时写入的默认终止回复
pub const DEFAULT_ROUND_LIMIT_MESSAGE: &str =
    "I reached the maximum number of tool rounds for this turn before finishing. \
     Please narrow the request or ask me to continue.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_tool_rounds: u32,
    pub round_limit_message: String,
    #[serde(default)]
    pub usage: UsageHeuristics,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 8,
            round_limit_message: DEFAULT_ROUND_LIMIT_MESSAGE.to_string(),
            usage: UsageHeuristics::default(),
        }
    }
}

/// 一次对话回合的输入
#[derive(Debug, Clone)]
pub struct AgentTurn {
    pub thread_id: String,
    pub user_message: String,
    /// None 时沿用线程上一次的 system prompt
    pub system_prompt: Option<String>,
    pub enabled_tools: BTreeSet<String>,
    /// None 时使用 AgentConfig.max_tool_rounds
    pub max_tool_rounds: Option<u32>,
    pub session_id: Option<String>,
    pub require_evidence_refs: bool,
}

impl AgentTurn {
    pub fn new(thread_id: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            user_message: user_message.into(),
            system_prompt: None,
            enabled_tools: BTreeSet::new(),
            max_tool_rounds: None,
            session_id: None,
            require_evidence_refs: false,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = Some(rounds);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn require_evidence_refs(mut self) -> Self {
        self.require_evidence_refs = true;
        self
    }

    fn tool_context(&self) -> ToolContext {
        let ctx = ToolContext::new(self.thread_id.clone()).with_evidence_refs(self.require_evidence_refs);
        match &self.session_id {
            Some(s) => ctx.with_session(s.clone()),
            None => ctx,
        }
    }
}

/// 回合结果；与 done 事件内容一致
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub content: String,
    pub tools_used: Vec<String>,
    pub tool_rounds: u32,
    pub total_usage: TokenUsage,
}

/// 新到旧的一页检查点；next_cursor 传给下一次调用的 before
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub checkpoints: Vec<Checkpoint>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ForkResult {
    pub thread_id: String,
    pub state: GraphState,
}

pub struct AgentStateMachine {
    llm: Arc<dyn LlmClient>,
    executor: Arc<ToolExecutor>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: AgentConfig,
}

impl AgentStateMachine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: Arc<ToolExecutor>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            llm,
            executor,
            checkpoints,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// 运行一个回合；无论成败都在 sink 上发出唯一的终止事件
    pub async fn invoke(
        &self,
        turn: AgentTurn,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let thread_id = turn.thread_id.clone();
        let result = self.run_turn(turn, sink, cancel).await;
        match &result {
            Ok(out) => sink.emit(EventKind::Done {
                content: out.content.clone(),
                tools_used: out.tools_used.clone(),
                tool_rounds: out.tool_rounds,
                total_usage: out.total_usage,
            }),
            Err(e) => {
                tracing::warn!(thread_id = %thread_id, kind = e.kind(), error = %e, "turn failed");
                sink.emit(EventKind::Error {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_turn(
        &self,
        turn: AgentTurn,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let ctx = turn.tool_context();
        let mut state = match self.checkpoints.get(&turn.thread_id, None).await? {
            Some(cp) => cp.state.begin_turn(),
            None => GraphState::new(self.config.max_tool_rounds),
        };
        state.max_tool_rounds = turn.max_tool_rounds.unwrap_or(self.config.max_tool_rounds);
        state.enabled_tools = turn.enabled_tools;
        if turn.system_prompt.is_some() {
            state.system_prompt = turn.system_prompt;
        }
        append_message(&mut state.messages, Message::user(turn.user_message))?;
        self.persist(&turn.thread_id, &state, NodeKind::Input, NodeKind::LlmCall)
            .await?;

        let mut node = NodeKind::LlmCall;
        loop {
            state = match node {
                NodeKind::Input => state,
                NodeKind::LlmCall => {
                    if cancel.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                    self.llm_call(state, sink).await?
                }
                NodeKind::ToolExec => self.tool_exec(state, &ctx, sink, cancel).await?,
                NodeKind::MaxRounds => {
                    let mut s = state;
                    append_message(
                        &mut s.messages,
                        Message::assistant(self.config.round_limit_message.clone()),
                    )?;
                    s
                }
                NodeKind::End => break,
            };
            let next = next_node(node, &state);
            tracing::debug!(
                thread_id = %turn.thread_id,
                node = node.as_str(),
                next = next.as_str(),
                round = state.round_count,
                "transition"
            );
            self.persist(&turn.thread_id, &state, node, next).await?;
            node = next;
        }

        tracing::info!(
            thread_id = %turn.thread_id,
            rounds = state.round_count,
            tools = ?state.tools_used,
            "turn finished"
        );
        Ok(TurnOutcome {
            content: state.last_assistant_content(),
            tools_used: state.tools_used.clone(),
            tool_rounds: state.round_count,
            total_usage: state.token_usage,
        })
    }

    async fn persist(
        &self,
        thread_id: &str,
        state: &GraphState,
        node: NodeKind,
        next: NodeKind,
    ) -> Result<String, AgentError> {
        Ok(self
            .checkpoints
            .put(thread_id, state, CheckpointMeta { node, next })
            .await?)
    }

    /// LLM_CALL：流式调用模型，转发 token，收集并去重工具调用，记录用量
    async fn llm_call(&self, mut state: GraphState, sink: &EventSink) -> Result<GraphState, AgentError> {
        let mut prompt = Vec::with_capacity(state.messages.len() + 1);
        if let Some(sp) = state.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            prompt.push(Message::system(sp));
        }
        prompt.extend(sanitize_for_model(&state.messages));
        let specs = self.executor.catalog().specs(&state.enabled_tools);

        let mut stream = self
            .llm
            .stream_chat(&prompt, &specs)
            .await
            .map_err(AgentError::LlmError)?;

        let mut content = String::new();
        let mut collector = ToolCallCollector::new();
        let mut accepted: Vec<ToolCall> = Vec::new();
        let mut reported: Option<TokenUsage> = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(AgentError::LlmError)?;
            if let Some(text) = chunk.text.filter(|t| !t.is_empty()) {
                sink.emit(EventKind::Token { text: text.clone() });
                content.push_str(&text);
            }
            for delta in chunk.tool_calls {
                if let Some(call) = collector.offer(delta) {
                    accepted.push(call);
                }
            }
            if let Some(usage) = chunk.usage.as_ref().and_then(extract_usage) {
                reported = Some(usage);
            }
        }

        if accepted.is_empty() && !state.enabled_tools.is_empty() {
            let catalog = self.executor.catalog();
            accepted = parse_text_tool_calls(&content, &state.enabled_tools, |name| {
                catalog
                    .get(name)
                    .map(|t| required_params(&t.parameters_schema()))
                    .unwrap_or_default()
            });
            if !accepted.is_empty() {
                tracing::debug!(count = accepted.len(), "parsed tool calls from text");
            }
        }

        let accepted: Vec<ToolCall> = accepted
            .into_iter()
            .map(|call| rekey_if_reused(call, &state.messages))
            .collect();
        for call in &accepted {
            sink.emit(EventKind::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }

        let prompt_chars: usize = prompt.iter().map(|m| m.content.chars().count()).sum();
        let completion_chars = content.chars().count()
            + accepted
                .iter()
                .map(|c| c.name.len() + c.arguments.to_string().chars().count())
                .sum::<usize>();
        let usage = resolve_usage(reported, prompt_chars, completion_chars, &self.config.usage);

        append_message(&mut state.messages, Message::assistant_with_tools(content, accepted))?;
        state.round_count += 1;
        state.token_usage.merge(&usage);
        Ok(state)
    }

    /// TOOL_EXEC：按顺序执行本轮全部调用；单个失败编码进结果，不中断其余调用
    async fn tool_exec(
        &self,
        mut state: GraphState,
        ctx: &ToolContext,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<GraphState, AgentError> {
        let calls = state.pending_tool_calls().to_vec();
        for call in calls {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            sink.emit(EventKind::ToolStart {
                id: call.id.clone(),
                name: call.name.clone(),
            });
            let result = self.executor.execute(&call, ctx, &state.enabled_tools).await;
            append_message(
                &mut state.messages,
                Message::tool(call.id.clone(), call.name.clone(), result.to_message_content()),
            )?;
            sink.emit(EventKind::ToolResult {
                id: result.tool_call_id.clone(),
                name: result.name.clone(),
                success: result.success,
                payload: result.payload.clone(),
            });
            state.record_tool_used(&call.name);
        }
        Ok(state)
    }

    /// 线程最新状态
    pub async fn get_state(&self, thread_id: &str) -> Result<Option<GraphState>, AgentError> {
        Ok(self.checkpoints.get(thread_id, None).await?.map(|cp| cp.state))
    }

    /// 新到旧分页读取检查点历史
    pub async fn get_state_history(
        &self,
        thread_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<HistoryPage, AgentError> {
        if limit == 0 {
            return Ok(HistoryPage {
                checkpoints: Vec::new(),
                next_cursor: None,
            });
        }
        let mut checkpoints = self.checkpoints.history(thread_id, limit + 1, before).await?;
        let next_cursor = if checkpoints.len() > limit {
            checkpoints.truncate(limit);
            checkpoints.last().map(|cp| cp.checkpoint_id.clone())
        } else {
            None
        };
        Ok(HistoryPage {
            checkpoints,
            next_cursor,
        })
    }

    /// 以 checkpoint 处的状态创建新线程；源线程不变
    pub async fn fork_from_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        new_thread_id: Option<String>,
    ) -> Result<ForkResult, AgentError> {
        let new_thread_id =
            new_thread_id.unwrap_or_else(|| format!("{thread_id}-fork-{}", uuid::Uuid::new_v4().simple()));
        let state = self
            .checkpoints
            .fork(thread_id, checkpoint_id, &new_thread_id)
            .await?;
        tracing::info!(thread_id, checkpoint_id, new_thread_id = %new_thread_id, "forked thread");
        Ok(ForkResult {
            thread_id: new_thread_id,
            state,
        })
    }
}

/// 后端跨轮复用同一个调用 id 时换一个新 id，保持 tool_call_id 在线程内唯一
fn rekey_if_reused(mut call: ToolCall, history: &[Message]) -> ToolCall {
    let reused = history
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .any(|c| c.id == call.id);
    if reused {
        call.id = format!("{}_{}", call.id, uuid::Uuid::new_v4().simple());
    }
    call
}
