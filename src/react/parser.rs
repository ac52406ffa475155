//! 工具调用协议解析
//!
//! 模型输出是自然语言与 `<|call|>{json}<|end|>` 块的混合流。ToolCallParser 是一个两态扫描器：
//! Scanning 把文本复制到 cleaned text，InBlock 缓冲到结束标记后按 JSON 解析。
//! 跨片段：Scanning 时扣留文本末尾从 `<` 起、只由标记字符组成的一段，与下一片段拼接后再扫描。
//! 移除块或孤立结束标记后，左侧这类尾巴可能与右侧拼成新标记（可层层嵌套），只有扣留整段才能
//! 保证已输出的文本不会再被拼接；流式结果因此与一次性解析完全相同。
//! InBlock 时在累积缓冲里找结束标记。畸形块整体丢弃并产生一条诊断，永不回流到文本。

use serde_json::{Map, Value};

use crate::tools::decode_payload;

pub const CALL_START: &str = "<|call|>";
pub const CALL_END: &str = "<|end|>";

/// 单个块缓冲上限（字节）
pub const DEFAULT_MAX_BLOCK_CHARS: usize = 16 * 1024;

/// 从块中解析出的调用（尚未分配 ID）
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    pub name: String,
    pub arguments: Value,
}

/// 非致命的解析诊断；每个被丢弃的块恰好一条
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseDiagnostic {
    MalformedJson { error: String },
    /// 不是对象，或 name 缺失 / 为空
    MissingName,
    /// arguments 存在但不是对象
    InvalidArguments { name: String },
    BlockTooLarge { limit: usize },
    /// 流结束时块仍未闭合
    UnterminatedBlock { len: usize },
    /// 扫描态遇到孤立的结束标记
    StrayEndMarker,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutput {
    pub text: String,
    pub invocations: Vec<ParsedCall>,
    pub diagnostics: Vec<ParseDiagnostic>,
}

impl ParseOutput {
    pub fn merge(&mut self, other: ParseOutput) {
        self.text.push_str(&other.text);
        self.invocations.extend(other.invocations);
        self.diagnostics.extend(other.diagnostics);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Scanning,
    InBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Start,
    End,
}

/// 流式解析器：每次模型生成用一个新实例
#[derive(Debug, Clone)]
pub struct ToolCallParser {
    state: ScanState,
    /// Scanning：扣留的文本尾巴；InBlock：已缓冲的块内容
    pending: String,
    /// InBlock：块之前尚未输出的文本尾巴，块闭合后可能参与拼接
    held: String,
    /// 块超限后进入吞弃模式，直到结束标记
    overflowed: bool,
    max_block_chars: usize,
}

impl Default for ToolCallParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BLOCK_CHARS)
    }
}

impl ToolCallParser {
    pub fn new(max_block_chars: usize) -> Self {
        Self {
            state: ScanState::Scanning,
            pending: String::new(),
            held: String::new(),
            overflowed: false,
            max_block_chars: max_block_chars.max(1),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// 尚未输出的部分（块缓冲或扣留的文本尾巴）
    pub fn trailing_partial(&self) -> &str {
        &self.pending
    }

    /// 输入一个片段；返回的 text 未 trim，可直接拼接
    pub fn feed(&mut self, chunk: &str) -> ParseOutput {
        let mut out = ParseOutput {
            text: std::mem::take(&mut self.held),
            ..Default::default()
        };
        let mut buf = std::mem::take(&mut self.pending);
        buf.push_str(chunk);
        let mut pos = 0usize;

        loop {
            let rest = &buf[pos..];
            match self.state {
                ScanState::Scanning => match next_marker(rest) {
                    Some((at, Marker::Start)) => {
                        out.text.push_str(&rest[..at]);
                        pos += at + CALL_START.len();
                        self.state = ScanState::InBlock;
                        self.overflowed = false;
                    }
                    Some((at, Marker::End)) => {
                        out.text.push_str(&rest[..at]);
                        pos += at + CALL_END.len();
                        emit(&mut out, ParseDiagnostic::StrayEndMarker);
                        rejoin(&mut out, &mut buf, &mut pos);
                    }
                    None => {
                        out.text.push_str(rest);
                        let keep = held_tail_len(&out.text);
                        self.pending = out.text.split_off(out.text.len() - keep);
                        break;
                    }
                },
                ScanState::InBlock => match rest.find(CALL_END) {
                    Some(at) => {
                        if !self.overflowed {
                            self.close_block(&rest[..at], &mut out);
                        }
                        pos += at + CALL_END.len();
                        self.state = ScanState::Scanning;
                        self.overflowed = false;
                        rejoin(&mut out, &mut buf, &mut pos);
                    }
                    None => {
                        if !self.overflowed && rest.len() > self.max_block_chars {
                            emit(
                                &mut out,
                                ParseDiagnostic::BlockTooLarge {
                                    limit: self.max_block_chars,
                                },
                            );
                            self.overflowed = true;
                        }
                        self.pending = if self.overflowed {
                            // 只留可能是结束标记开头的尾巴
                            let keep = partial_suffix_len(rest, &[CALL_END]);
                            rest[rest.len() - keep..].to_string()
                        } else {
                            rest.to_string()
                        };
                        let keep = held_tail_len(&out.text);
                        self.held = out.text.split_off(out.text.len() - keep);
                        break;
                    }
                },
            }
        }
        out
    }

    /// 流结束：扣留的尾巴按普通文本输出；未闭合的块丢弃
    pub fn finish(&mut self) -> ParseOutput {
        let mut out = ParseOutput::default();
        let pending = std::mem::take(&mut self.pending);
        match self.state {
            ScanState::Scanning => out.text = pending,
            ScanState::InBlock => {
                out.text = std::mem::take(&mut self.held);
                if !self.overflowed {
                    emit(
                        &mut out,
                        ParseDiagnostic::UnterminatedBlock { len: pending.len() },
                    );
                }
            }
        }
        self.state = ScanState::Scanning;
        self.overflowed = false;
        out
    }

    fn close_block(&self, span: &str, out: &mut ParseOutput) {
        if span.len() > self.max_block_chars {
            emit(
                out,
                ParseDiagnostic::BlockTooLarge {
                    limit: self.max_block_chars,
                },
            );
            return;
        }
        let mut obj = match serde_json::from_str::<Value>(span.trim()) {
            Ok(Value::Object(obj)) => obj,
            Ok(_) => return emit(out, ParseDiagnostic::MissingName),
            Err(e) => {
                return emit(
                    out,
                    ParseDiagnostic::MalformedJson {
                        error: e.to_string(),
                    },
                )
            }
        };
        let name = match obj
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            Some(n) => n.to_string(),
            None => return emit(out, ParseDiagnostic::MissingName),
        };
        let arguments = match obj.remove("arguments").map(decode_payload) {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(v @ Value::Object(_)) => v,
            Some(_) => return emit(out, ParseDiagnostic::InvalidArguments { name }),
        };
        out.invocations.push(ParsedCall { name, arguments });
    }
}

/// 一次性解析完整文本，结果 text 已 trim
pub fn parse_model_output(text: &str) -> ParseOutput {
    parse_with_limit(text, DEFAULT_MAX_BLOCK_CHARS)
}

pub fn parse_with_limit(text: &str, max_block_chars: usize) -> ParseOutput {
    let mut parser = ToolCallParser::new(max_block_chars);
    let mut out = parser.feed(text);
    out.merge(parser.finish());
    out.text = out.text.trim().to_string();
    out
}

fn emit(out: &mut ParseOutput, diagnostic: ParseDiagnostic) {
    tracing::warn!(diagnostic = ?diagnostic, "dropped malformed tool-call block");
    out.diagnostics.push(diagnostic);
}

/// 最早出现的标记
fn next_marker(s: &str) -> Option<(usize, Marker)> {
    match (s.find(CALL_START), s.find(CALL_END)) {
        (Some(a), Some(b)) if b < a => Some((b, Marker::End)),
        (Some(a), _) => Some((a, Marker::Start)),
        (None, Some(b)) => Some((b, Marker::End)),
        (None, None) => None,
    }
}

/// s 的最长后缀长度，该后缀是某个标记的真前缀
fn partial_suffix_len(s: &str, markers: &[&str]) -> usize {
    let longest = markers.iter().map(|m| m.len()).max().unwrap_or(0);
    for k in (1..longest).rev() {
        if k > s.len() || !s.is_char_boundary(s.len() - k) {
            continue;
        }
        let tail = &s[s.len() - k..];
        if markers.iter().any(|m| m.len() > k && m.starts_with(tail)) {
            return k;
        }
    }
    0
}

/// 标记真前缀里出现的字符（`>` 只在标记末尾）
fn is_marker_char(c: char) -> bool {
    matches!(c, '<' | '|' | 'c' | 'a' | 'l' | 'e' | 'n' | 'd')
}

/// 需要扣留的尾巴长度：末尾连续标记字符中，从最早的 `<` 到结尾
///
/// rejoin 退回的每一段都是以 `<` 开头的标记真前缀，连续退回只会落在这段尾巴里。
fn held_tail_len(text: &str) -> usize {
    let mut start = None;
    for (i, c) in text.char_indices().rev() {
        if !is_marker_char(c) {
            break;
        }
        if c == '<' {
            start = Some(i);
        }
    }
    start.map_or(0, |i| text.len() - i)
}

/// 移除块或标记后，左侧文本尾部可能与右侧拼出新标记：把尾部退回缓冲重新扫描
fn rejoin(out: &mut ParseOutput, buf: &mut String, pos: &mut usize) {
    let k = partial_suffix_len(&out.text, &[CALL_START, CALL_END]);
    if k == 0 {
        return;
    }
    let mut joined = out.text.split_off(out.text.len() - k);
    joined.push_str(&buf[*pos..]);
    *buf = joined;
    *pos = 0;
}
