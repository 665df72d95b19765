//! Token 用量解析
//!
//! 不同后端把 usage 放在不同位置、用不同字段名。按优先级依次探测已知形状，取第一个能解析的；
//! 再用字符数做一次粗略的合理性检查，拒绝明显是占位值的数字（启发式，不是精确约定）。
//! 没有 usage 或被拒绝时，按字符数估算。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token 使用统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }

    pub fn merge(&mut self, other: &TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }

    pub fn is_zero(&self) -> bool {
        self.prompt == 0 && self.completion == 0 && self.total == 0
    }
}

/// 占位用量检测阈值（按后端调节）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageHeuristics {
    /// 字符数低于该值时不做检查
    #[serde(default = "default_min_chars_for_check")]
    pub min_chars_for_check: usize,
    /// 每个 token 最多对应多少字符；超过即视为占位值
    #[serde(default = "default_max_chars_per_token")]
    pub max_chars_per_token: f64,
    /// 估算时每个 token 对应的字符数
    #[serde(default = "default_estimate_chars_per_token")]
    pub estimate_chars_per_token: f64,
}

fn default_min_chars_for_check() -> usize {
    200
}

fn default_max_chars_per_token() -> f64 {
    12.0
}

fn default_estimate_chars_per_token() -> f64 {
    4.0
}

impl Default for UsageHeuristics {
    fn default() -> Self {
        Self {
            min_chars_for_check: default_min_chars_for_check(),
            max_chars_per_token: default_max_chars_per_token(),
            estimate_chars_per_token: default_estimate_chars_per_token(),
        }
    }
}

type Probe = fn(&Value) -> Option<TokenUsage>;

/// 探测顺序即优先级
const PROBES: &[Probe] = &[
    probe_usage_metadata,
    probe_response_metadata,
    probe_gemini,
    probe_nested_usage,
    probe_flat,
];

/// 依次尝试已知形状，返回第一个能解析出的用量
pub fn extract_usage(payload: &Value) -> Option<TokenUsage> {
    PROBES.iter().find_map(|probe| probe(payload))
}

fn as_count(v: Option<&Value>) -> Option<u64> {
    let v = v?;
    v.as_u64()
        .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

/// 在一个对象上按多组字段名读取 (prompt, completion, total?)
fn read_pair(obj: &Value, prompt_keys: &[&str], completion_keys: &[&str], total_keys: &[&str]) -> Option<TokenUsage> {
    let obj = obj.as_object()?;
    let prompt = prompt_keys.iter().find_map(|k| as_count(obj.get(*k)))?;
    let completion = completion_keys.iter().find_map(|k| as_count(obj.get(*k)))?;
    let total = total_keys
        .iter()
        .find_map(|k| as_count(obj.get(*k)))
        .unwrap_or(prompt + completion);
    Some(TokenUsage {
        prompt,
        completion,
        total,
    })
}

const PROMPT_KEYS: &[&str] = &["prompt_tokens", "input_tokens", "promptTokens", "inputTokens"];
const COMPLETION_KEYS: &[&str] = &[
    "completion_tokens",
    "output_tokens",
    "completionTokens",
    "outputTokens",
];
const TOTAL_KEYS: &[&str] = &["total_tokens", "totalTokens"];

fn probe_usage_metadata(v: &Value) -> Option<TokenUsage> {
    read_pair(v.get("usage_metadata")?, PROMPT_KEYS, COMPLETION_KEYS, TOTAL_KEYS)
}

fn probe_response_metadata(v: &Value) -> Option<TokenUsage> {
    let meta = v.get("response_metadata")?;
    let inner = meta
        .get("tokenUsage")
        .or_else(|| meta.get("token_usage"))
        .or_else(|| meta.get("usage"))?;
    read_pair(inner, PROMPT_KEYS, COMPLETION_KEYS, TOTAL_KEYS)
}

fn probe_gemini(v: &Value) -> Option<TokenUsage> {
    let meta = v.get("usageMetadata").unwrap_or(v);
    read_pair(
        meta,
        &["promptTokenCount"],
        &["candidatesTokenCount"],
        &["totalTokenCount"],
    )
}

fn probe_nested_usage(v: &Value) -> Option<TokenUsage> {
    let inner = v.get("usage").or_else(|| v.get("token_usage"))?;
    read_pair(inner, PROMPT_KEYS, COMPLETION_KEYS, TOTAL_KEYS)
}

fn probe_flat(v: &Value) -> Option<TokenUsage> {
    read_pair(v, PROMPT_KEYS, COMPLETION_KEYS, TOTAL_KEYS)
}

/// 用量相对于实际字符数小得不合理时视为占位值
pub fn looks_like_placeholder(
    usage: &TokenUsage,
    prompt_chars: usize,
    completion_chars: usize,
    h: &UsageHeuristics,
) -> bool {
    let implausible = |tokens: u64, chars: usize| {
        chars >= h.min_chars_for_check && (tokens as f64) * h.max_chars_per_token < chars as f64
    };
    implausible(usage.prompt, prompt_chars) || implausible(usage.completion, completion_chars)
}

/// 按字符数估算
pub fn estimate_usage(prompt_chars: usize, completion_chars: usize, h: &UsageHeuristics) -> TokenUsage {
    let per = if h.estimate_chars_per_token > 0.0 {
        h.estimate_chars_per_token
    } else {
        default_estimate_chars_per_token()
    };
    let est = |chars: usize| (chars as f64 / per).ceil() as u64;
    TokenUsage::new(est(prompt_chars), est(completion_chars))
}

/// 决定一轮模型调用最终记入的用量
pub fn resolve_usage(
    reported: Option<TokenUsage>,
    prompt_chars: usize,
    completion_chars: usize,
    h: &UsageHeuristics,
) -> TokenUsage {
    match reported {
        Some(u) if !looks_like_placeholder(&u, prompt_chars, completion_chars, h) => u,
        Some(u) => {
            tracing::debug!(?u, prompt_chars, completion_chars, "rejected placeholder usage");
            estimate_usage(prompt_chars, completion_chars, h)
        }
        None => estimate_usage(prompt_chars, completion_chars, h),
    }
}
