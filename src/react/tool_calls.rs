//! 工具调用收集：流内去重 + 文本回退解析
//!
//! 后端可能对同一调用重复发送增量：有 id 时按 id 去重，无 id 时按 (name, 规范化 args) 指纹去重。
//! 没有结构化调用时，尝试从文本中解析 `name(args)` 形式的调用（可在代码块内），只接受已启用的工具名。

use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::llm::ToolCallDelta;
use crate::memory::ToolCall;

/// 把参数规范成 JSON object：字符串先尝试按 JSON 解析，null 视为空对象
pub fn normalize_arguments(raw: Value) -> Value {
    match raw {
        Value::Object(_) => raw,
        Value::Null => Value::Object(Map::new()),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(v @ Value::Object(_)) => v,
            _ if s.trim().is_empty() => Value::Object(Map::new()),
            _ => single_input(Value::String(s)),
        },
        other => single_input(other),
    }
}

fn single_input(v: Value) -> Value {
    let mut m = Map::new();
    m.insert("input".to_string(), v);
    Value::Object(m)
}

/// 键有序的紧凑 JSON，与 serde_json 的 map 实现无关
pub fn canonical_json(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

pub fn fingerprint(name: &str, arguments: &Value) -> String {
    format!("{}({})", name, canonical_json(arguments))
}

fn generated_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// 单次模型流内的调用收集器
#[derive(Debug, Default)]
pub struct ToolCallCollector {
    seen_ids: HashSet<String>,
    seen_fingerprints: HashSet<String>,
    calls: Vec<ToolCall>,
}

impl ToolCallCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接受新调用时返回它；重复的增量返回 None
    pub fn offer(&mut self, delta: ToolCallDelta) -> Option<ToolCall> {
        if delta.name.trim().is_empty() {
            return None;
        }
        let arguments = normalize_arguments(delta.arguments);
        let print = fingerprint(&delta.name, &arguments);
        let id = match delta.id.filter(|id| !id.is_empty()) {
            Some(id) => {
                if !self.seen_ids.insert(id.clone()) {
                    return None;
                }
                id
            }
            None => {
                if self.seen_fingerprints.contains(&print) {
                    return None;
                }
                generated_call_id()
            }
        };
        self.seen_fingerprints.insert(print);
        let call = ToolCall {
            id,
            name: delta.name,
            arguments,
        };
        self.calls.push(call.clone());
        Some(call)
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn into_calls(self) -> Vec<ToolCall> {
        self.calls
    }
}

static FENCE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static CALL_HEAD_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn fence_re() -> Option<&'static Regex> {
    FENCE_RE
        .get_or_init(|| Regex::new(r"```[A-Za-z0-9_+-]*[ \t]*\n?([\s\S]*?)```").ok())
        .as_ref()
}

fn call_head_re() -> Option<&'static Regex> {
    CALL_HEAD_RE
        .get_or_init(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_.-]*)\s*\(").ok())
        .as_ref()
}

/// 整段就是 JSON 对象 / 数组（例如最终答案），不视为调用
fn is_json_document(region: &str) -> bool {
    matches!(
        serde_json::from_str::<Value>(region.trim()),
        Ok(Value::Object(_)) | Ok(Value::Array(_))
    )
}

/// 从纯文本中解析工具调用
///
/// 只接受语句级调用：某一行（去掉前导空白后）以 `name(` 开头，且匹配的 `)` 之后到行尾
/// 只剩空白或一个分号。行中间提到的调用、JSON 字符串里引用的调用都不算。
/// `param_names(name)` 给出该工具位置参数的命名顺序（通常是 schema 的 required 列表）。
pub fn parse_text_tool_calls<F>(text: &str, enabled: &BTreeSet<String>, param_names: F) -> Vec<ToolCall>
where
    F: Fn(&str) -> Vec<String>,
{
    let (Some(fence), Some(head)) = (fence_re(), call_head_re()) else {
        return Vec::new();
    };
    let fenced: Vec<&str> = fence
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let regions: Vec<&str> = if fenced.is_empty() { vec![text] } else { fenced };

    let mut collector = ToolCallCollector::new();
    for region in regions {
        if is_json_document(region) {
            continue;
        }
        let mut cursor = 0;
        while cursor < region.len() {
            let line_end = line_end_from(region, cursor);
            let line = &region[cursor..line_end];
            let start = cursor + (line.len() - line.trim_start().len());
            cursor = line_end + 1;

            let Some(caps) = head.captures(&region[start..]) else {
                continue;
            };
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if !enabled.contains(name.as_str()) {
                continue;
            }
            let open = start + whole.end() - 1;
            // 参数可以跨行，所以在整段上配对括号
            let Some(close) = matching_paren(region, open) else {
                continue;
            };
            let tail_end = line_end_from(region, close + 1);
            let tail = region[close + 1..tail_end].trim();
            if !(tail.is_empty() || tail == ";") {
                continue;
            }
            let inner = &region[open + 1..close];
            if let Some(args) = parse_arguments(inner, &param_names(name.as_str())) {
                collector.offer(ToolCallDelta {
                    id: None,
                    name: name.as_str().to_string(),
                    arguments: args,
                });
            }
            cursor = tail_end + 1;
        }
    }
    collector.into_calls()
}

/// from 起下一个换行的字节下标；没有则为结尾
fn line_end_from(s: &str, from: usize) -> usize {
    s[from..].find('\n').map(|i| from + i).unwrap_or(s.len())
}

/// open 处是 '('，返回与之匹配的 ')' 的字节下标；跳过引号内内容
fn matching_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, ch) in s[open..].char_indices() {
        let idx = open + i;
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return if ch == ')' { Some(idx) } else { None };
                }
            }
            _ => {}
        }
    }
    None
}

/// 解析括号内的参数列表；语法错误返回 None
///
/// 支持 `k=v` / `k: v` 关键字参数与位置参数；值可以是带引号字符串、数字、布尔、null、
/// 裸标识符，或 JSON 对象 / 数组。唯一的位置参数若是 JSON 对象则直接作为参数对象。
pub fn parse_arguments(src: &str, param_names: &[String]) -> Option<Value> {
    let mut p = ArgParser {
        chars: src.chars().collect(),
        pos: 0,
    };
    let items = p.parse_list()?;

    if items.len() == 1 && items[0].0.is_none() && items[0].1.is_object() {
        return items.into_iter().next().map(|(_, v)| v);
    }

    let positional = items.iter().filter(|(k, _)| k.is_none()).count();
    let mut out = Map::new();
    let mut pos_index = 0;
    for (key, value) in items {
        let key = match key {
            Some(k) => k,
            None => {
                let k = param_names.get(pos_index).cloned().unwrap_or_else(|| {
                    if positional == 1 {
                        "input".to_string()
                    } else {
                        format!("arg{pos_index}")
                    }
                });
                pos_index += 1;
                k
            }
        };
        out.insert(key, value);
    }
    Some(Value::Object(out))
}

struct ArgParser {
    chars: Vec<char>,
    pos: usize,
}

impl ArgParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_list(&mut self) -> Option<Vec<(Option<String>, Value)>> {
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek().is_none() {
            return Some(items);
        }
        loop {
            self.skip_ws();
            let key = self.try_key();
            self.skip_ws();
            let value = self.parse_value()?;
            items.push((key, value));
            self.skip_ws();
            match self.peek() {
                None => return Some(items),
                Some(',') => {
                    self.pos += 1;
                    self.skip_ws();
                    // 允许结尾逗号
                    if self.peek().is_none() {
                        return Some(items);
                    }
                }
                Some(_) => return None,
            }
        }
    }

    /// 标识符后紧跟 '=' 或 ':' 时消费并返回键名；否则回退
    fn try_key(&mut self) -> Option<String> {
        let start = self.pos;
        let mut end = start;
        let quoted = matches!(self.peek(), Some('"') | Some('\''));
        let name = if quoted {
            let s = self.parse_quoted()?;
            end = self.pos;
            s
        } else {
            while self
                .chars
                .get(end)
                .is_some_and(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            {
                end += 1;
            }
            if end == start {
                return None;
            }
            self.chars[start..end].iter().collect()
        };
        let mut look = end;
        while self.chars.get(look).is_some_and(|c| c.is_whitespace()) {
            look += 1;
        }
        match self.chars.get(look) {
            Some('=') if self.chars.get(look + 1) != Some(&'=') => {
                self.pos = look + 1;
                Some(name)
            }
            Some(':') => {
                self.pos = look + 1;
                Some(name)
            }
            _ => {
                self.pos = start;
                None
            }
        }
    }

    fn parse_quoted(&mut self) -> Option<String> {
        let q = self.peek()?;
        self.pos += 1;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                '\\' => {
                    let next = self.peek()?;
                    self.pos += 1;
                    out.push(match next {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                }
                c if c == q => return Some(out),
                c => out.push(c),
            }
        }
        None
    }

    fn parse_value(&mut self) -> Option<Value> {
        match self.peek()? {
            '"' | '\'' => self.parse_quoted().map(Value::String),
            '{' | '[' => self.parse_structured(),
            _ => self.parse_bare(),
        }
    }

    /// 平衡括号截取后按 JSON 解析，失败时保留原文字符串
    fn parse_structured(&mut self) -> Option<Value> {
        let start = self.pos;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut escaped = false;
        while let Some(c) = self.peek() {
            self.pos += 1;
            if let Some(q) = quote {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '"' | '\'' => quote = Some(c),
                '{' | '[' => depth += 1,
                '}' | ']' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        let raw: String = self.chars[start..self.pos].iter().collect();
                        return Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw)));
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn parse_bare(&mut self) -> Option<Value> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c != ',') {
            self.pos += 1;
        }
        let raw: String = self.chars[start..self.pos].iter().collect();
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(match raw {
            "true" | "True" => Value::Bool(true),
            "false" | "False" => Value::Bool(false),
            "null" | "None" | "nil" => Value::Null,
            _ => {
                if let Ok(i) = raw.parse::<i64>() {
                    Value::from(i)
                } else if let Ok(f) = raw.parse::<f64>() {
                    serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .unwrap_or_else(|| Value::String(raw.to_string()))
                } else if raw.chars().all(|c| c.is_alphanumeric() || "_-./".contains(c)) {
                    Value::String(raw.to_string())
                } else {
                    return None;
                }
            }
        })
    }
}
