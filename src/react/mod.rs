//! 工具调用状态机：图状态与路由、流式事件、工具调用收集、提示词管道、主循环

pub mod events;
pub mod loop_;
pub mod prompt;
pub mod state;
pub mod tool_calls;

pub use events::{EventKind, EventSink, StreamEvent};
pub use loop_::{
    AgentConfig, AgentStateMachine, AgentTurn, ForkResult, HistoryPage, TurnOutcome, DEFAULT_ROUND_LIMIT_MESSAGE,
};
pub use prompt::{PromptPipeline, PromptSection, PromptTransform, PromptTree};
pub use state::{next_node, route_after_llm, GraphState, NodeKind};
pub use tool_calls::{parse_text_tool_calls, ToolCallCollector};
