//! Mid-stream tool-call detection.
//!
//! A conservative classifier over the token stream: once a `{` shows up,
//! content is withheld until the braces balance, then the buffer either
//! parses as tool calls (absorbed silently) or is re-emitted verbatim. JSON
//! the assistant merely talks about is never lost.

use tracing::debug;

use crate::toolcall::parse_tool_calls;
use crate::types::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Passthrough,
    Buffering,
}

pub struct StreamHandler {
    state: State,
    buffer: String,
    depth: i64,
    /// Everything seen, absorbed or not; becomes the assistant message in
    /// the recursion step.
    content: String,
    tool_calls: Vec<ToolCall>,
    tool_names: Vec<String>,
    tools_configured: bool,
}

impl StreamHandler {
    pub fn new(tool_names: Vec<String>, tools_configured: bool) -> Self {
        Self {
            state: State::Passthrough,
            buffer: String::new(),
            depth: 0,
            content: String::new(),
            tool_calls: Vec::new(),
            tool_names,
            tools_configured,
        }
    }

    /// Feed one token; returns content to surface to the caller now.
    pub fn push(&mut self, token: &str) -> Option<String> {
        self.content.push_str(token);

        match self.state {
            State::Passthrough => {
                if token.contains('{') {
                    self.state = State::Buffering;
                    self.buffer.push_str(token);
                    self.depth += brace_delta(token);
                    self.try_close()
                } else {
                    Some(token.to_string())
                }
            }
            State::Buffering => {
                self.buffer.push_str(token);
                self.depth += brace_delta(token);
                self.try_close()
            }
        }
    }

    /// If the braces balanced, classify the buffer: tool calls are absorbed,
    /// anything else is emitted verbatim.
    fn try_close(&mut self) -> Option<String> {
        if self.depth > 0 || !self.buffer.contains('}') {
            return None;
        }

        self.state = State::Passthrough;
        self.depth = 0;
        let buffer = std::mem::take(&mut self.buffer);

        let calls = parse_tool_calls(&buffer, &self.tool_names);
        if calls.is_empty() {
            Some(buffer)
        } else {
            debug!(count = calls.len(), "absorbed tool calls from stream");
            self.tool_calls.extend(calls);
            None
        }
    }

    /// End of stream: flush residual buffered content, and if tools are
    /// configured but nothing was collected, run the parser over the full
    /// accumulated content as a last resort.
    pub fn finalize(&mut self) -> Option<String> {
        let residual = if self.buffer.is_empty() {
            None
        } else {
            self.state = State::Passthrough;
            self.depth = 0;
            Some(std::mem::take(&mut self.buffer))
        };

        if self.tools_configured && self.tool_calls.is_empty() {
            let calls = parse_tool_calls(&self.content, &self.tool_names);
            if !calls.is_empty() {
                debug!(count = calls.len(), "tool calls found in finalize pass");
                self.tool_calls = calls;
            }
        }

        residual
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn take_tool_calls(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.tool_calls)
    }

    /// Full accumulated content, including absorbed tool-call text.
    pub fn content(&self) -> &str {
        &self.content
    }
}

fn brace_delta(token: &str) -> i64 {
    let mut delta = 0i64;
    for ch in token.chars() {
        match ch {
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

/// What a filtered fragment splits into.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Split {
    pub content: Option<String>,
    pub thinking: Option<String>,
}

/// Routes `<think>…</think>` spans into the thinking channel when the caller
/// asked for reasoning traces; a no-op passthrough otherwise. Tolerates tags
/// split across token boundaries.
pub struct ThinkFilter {
    enabled: bool,
    in_think: bool,
    pending: String,
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

impl ThinkFilter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            in_think: false,
            pending: String::new(),
        }
    }

    pub fn push(&mut self, text: &str) -> Split {
        if !self.enabled {
            return Split {
                content: Some(text.to_string()),
                thinking: None,
            };
        }

        self.pending.push_str(text);
        let mut content = String::new();
        let mut thinking = String::new();

        loop {
            let tag = if self.in_think { THINK_CLOSE } else { THINK_OPEN };
            match self.pending.find(tag) {
                Some(pos) => {
                    let segment = &self.pending[..pos];
                    if self.in_think {
                        thinking.push_str(segment);
                    } else {
                        content.push_str(segment);
                    }
                    self.pending.drain(..pos + tag.len());
                    self.in_think = !self.in_think;
                }
                None => {
                    // Hold back any suffix that could be the start of the
                    // tag we are waiting for.
                    let hold = partial_suffix_len(&self.pending, tag);
                    let emit_to = self.pending.len() - hold;
                    let segment: String = self.pending.drain(..emit_to).collect();
                    if self.in_think {
                        thinking.push_str(&segment);
                    } else {
                        content.push_str(&segment);
                    }
                    break;
                }
            }
        }

        Split {
            content: (!content.is_empty()).then_some(content),
            thinking: (!thinking.is_empty()).then_some(thinking),
        }
    }

    pub fn finalize(&mut self) -> Split {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Split::default();
        }
        if self.in_think {
            Split {
                content: None,
                thinking: Some(pending),
            }
        } else {
            Split {
                content: Some(pending),
                thinking: None,
            }
        }
    }
}

/// Length of the longest strict suffix of `text` that prefixes `tag`.
fn partial_suffix_len(text: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        if !text.is_char_boundary(text.len() - len) {
            continue;
        }
        if tag.starts_with(&text[text.len() - len..]) {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> StreamHandler {
        StreamHandler::new(vec!["calculator".into()], true)
    }

    #[test]
    fn test_plain_tokens_pass_through() {
        let mut h = handler();
        assert_eq!(h.push("Hel").as_deref(), Some("Hel"));
        assert_eq!(h.push("lo").as_deref(), Some("lo"));
        assert!(h.finalize().is_none());
        assert!(h.tool_calls().is_empty());
        assert_eq!(h.content(), "Hello");
    }

    #[test]
    fn test_tool_call_absorbed_silently() {
        let mut h = handler();
        let tokens = [
            "{\"name\":",
            "\"calculator\",",
            "\"arguments\":",
            "{\"expression\":",
            "\"2+2\"}",
            "}",
        ];
        for token in tokens {
            assert!(h.push(token).is_none(), "token {token:?} leaked");
        }
        assert!(h.finalize().is_none());
        assert_eq!(h.tool_calls().len(), 1);
        assert_eq!(h.tool_calls()[0].name, "calculator");
        assert_eq!(h.tool_calls()[0].arguments, "{\"expression\":\"2+2\"}");
        // Raw JSON is preserved for the assistant message.
        assert!(h.content().contains("\"calculator\""));
    }

    #[test]
    fn test_invalid_json_reemitted_verbatim() {
        let mut h = handler();
        assert!(h.push("{not ").is_none());
        let out = h.push("json}").expect("buffer should be re-emitted");
        assert_eq!(out, "{not json}");
        assert!(h.tool_calls().is_empty());
    }

    #[test]
    fn test_prose_json_reemitted() {
        let mut h = handler();
        assert!(h.push("{\"key\": ").is_none());
        let out = h.push("\"value\"}").unwrap();
        assert_eq!(out, "{\"key\": \"value\"}");
        assert!(h.tool_calls().is_empty());
    }

    #[test]
    fn test_finalize_flushes_residual_buffer() {
        let mut h = handler();
        assert!(h.push("{\"name\": \"calc").is_none());
        let residual = h.finalize().unwrap();
        assert_eq!(residual, "{\"name\": \"calc");
    }

    #[test]
    fn test_finalize_last_resort_parse() {
        // Unbalanced brace text keeps the handler buffering, but the full
        // content still holds a parseable call by stream end.
        let mut h = StreamHandler::new(vec![], true);
        h.push("ok {\"name\":\"t\",\"arguments\":{}}");
        // the single token balanced out: absorbed already
        assert_eq!(h.tool_calls().len(), 1);

        let mut h = StreamHandler::new(vec![], true);
        h.push("use {\"name\":\"t\",\"arguments\":\"{}\"} now");
        h.finalize();
        assert_eq!(h.tool_calls().len(), 1);
    }

    #[test]
    fn test_token_with_leading_text_buffers_whole_token() {
        let mut h = handler();
        assert!(h.push("see {\"a\":").is_none());
        let out = h.push("1}").unwrap();
        assert_eq!(out, "see {\"a\":1}");
    }

    #[test]
    fn test_think_filter_disabled_passthrough() {
        let mut f = ThinkFilter::new(false);
        let split = f.push("<think>reasoning</think>");
        assert_eq!(split.content.as_deref(), Some("<think>reasoning</think>"));
        assert!(split.thinking.is_none());
    }

    #[test]
    fn test_think_filter_routes_spans() {
        let mut f = ThinkFilter::new(true);
        let split = f.push("<think>step 1</think>answer");
        assert_eq!(split.thinking.as_deref(), Some("step 1"));
        assert_eq!(split.content.as_deref(), Some("answer"));
    }

    #[test]
    fn test_think_filter_split_tags() {
        let mut f = ThinkFilter::new(true);
        assert_eq!(f.push("<th"), Split::default());
        let split = f.push("ink>deep");
        assert_eq!(split.thinking.as_deref(), Some("deep"));
        let split = f.push(" thought</thi");
        assert_eq!(split.thinking.as_deref(), Some(" thought"));
        let split = f.push("nk> done");
        assert_eq!(split.content.as_deref(), Some(" done"));
    }

    #[test]
    fn test_think_filter_unclosed_stays_thinking() {
        let mut f = ThinkFilter::new(true);
        let split = f.push("<think>never closed");
        assert!(split.content.is_none());
        assert_eq!(split.thinking.as_deref(), Some("never closed"));

        // A held-back partial close tag flushes on finalize.
        let split = f.push("</thi");
        assert_eq!(split, Split::default());
        let split = f.finalize();
        assert_eq!(split.thinking.as_deref(), Some("</thi"));
    }
}
