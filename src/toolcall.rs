//! Tool-call extraction from assistant text.
//!
//! Pure and safe to call repeatedly on growing prefixes: candidates that do
//! not parse are discarded without side effects. Three shapes are
//! recognized — a bare JSON object carrying a `name`, the same object inside
//! `<tool_call>` delimiters, and `identifier({…})` function-call syntax. The
//! function-call shape only matches identifiers that name a configured tool;
//! prose that merely looks like a call never fires.

use serde_json::{Map, Value};

use crate::types::ToolCall;

/// A top-level `{…}` candidate found by the brace scanner.
struct Candidate {
    start: usize,
    text: String,
}

/// Extract zero or more tool calls from `text`.
///
/// `tool_names` gates the function-call shape; bare and tagged JSON are
/// always considered. Assigned ids are `call_{n}`, 0-based within this
/// invocation.
pub fn parse_tool_calls(text: &str, tool_names: &[String]) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    for candidate in scan_objects(text) {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&candidate.text) else {
            continue;
        };

        if let Some(call) = call_from_object(&obj) {
            calls.push(call);
            continue;
        }

        // No name field: maybe the object is the argument of name({…}).
        if let Some(name) = preceding_identifier(text, candidate.start) {
            if tool_names.iter().any(|t| t == name) {
                calls.push(ToolCall {
                    id: None,
                    name: name.to_string(),
                    arguments: candidate.text.clone(),
                });
            }
        }
    }

    for (n, call) in calls.iter_mut().enumerate() {
        call.id = Some(format!("call_{n}"));
    }
    calls
}

/// Brace-depth scan: a complete object is the substring from a `{` at depth
/// 1 through its matching `}`.
fn scan_objects(text: &str) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (i, ch) in text.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        candidates.push(Candidate {
                            start,
                            text: text[start..=i].to_string(),
                        });
                    }
                }
            }
            _ => {}
        }
    }
    candidates
}

/// Bare-JSON shape: `name` plus `arguments` (preferred), `parameters`, or
/// the remaining keys taken collectively.
fn call_from_object(obj: &Map<String, Value>) -> Option<ToolCall> {
    let name = obj.get("name")?.as_str()?.to_string();

    let arguments = if let Some(args) = obj.get("arguments").or_else(|| obj.get("parameters")) {
        stringify_args(args)
    } else {
        let rest: Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| k.as_str() != "name")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(rest).to_string()
    };

    Some(ToolCall {
        id: None,
        name,
        arguments,
    })
}

/// Arguments already serialized as a string pass through unchanged.
fn stringify_args(args: &Value) -> String {
    match args {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Look back from an object start for `identifier(` with optional
/// whitespace, as in `calculator({"expression": "2+2"})`.
fn preceding_identifier(text: &str, object_start: usize) -> Option<&str> {
    let head = &text[..object_start];
    let head = head.trim_end();
    let head = head.strip_suffix('(')?;
    let head = head.trim_end();

    let ident_start = head
        .rfind(|c: char| !c.is_alphanumeric() && c != '_')
        .map_or(0, |i| i + c_len(head, i));
    let ident = &head[ident_start..];
    (!ident.is_empty()).then_some(ident)
}

fn c_len(s: &str, i: usize) -> usize {
    s[i..].chars().next().map_or(1, char::len_utf8)
}
