//! 多任务研究：规划、CoA 证据校验、并发分析编排

pub mod coa;
pub mod orchestrator;
pub mod plan;

pub use coa::{dangling_refs, parse_coa, validate_evidence, Claim, CoABlock, Confidence, Evidence};
pub use orchestrator::{analysis_prompt, ResearchConfig, ResearchOrchestrator, ResearchOutcome, ResearchRequest};
pub use plan::{parse_plan, planner_prompt, ResearchPlan, ResearchTask};
