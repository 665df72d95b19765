//! LLM 层：流式调用接口、用量解析与 Mock 实现

pub mod mock;
pub mod traits;
pub mod usage;

pub use mock::{MockLlmClient, RecordedCall};
pub use traits::{ChunkStream, LlmClient, ModelChunk, ToolCallDelta, ToolSpec};
pub use usage::{extract_usage, resolve_usage, TokenUsage, UsageHeuristics};
