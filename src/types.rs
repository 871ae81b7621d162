//! Chat data model: messages, streaming chunks, tool calls, and generation
//! options shared between the pipeline and the worker.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Fixed role string used by the native chat-template API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One ordered item of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Image references. The native core rejects these with a typed error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    /// Correlates a tool-role message with a prior assistant tool call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Outbound calls; meaningful only on assistant messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Tool result message answering the call with id `tool_call_id`.
    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            images: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            images: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn has_images(&self) -> bool {
        self.images.as_ref().is_some_and(|imgs| !imgs.is_empty())
    }

    /// Structural invariants from the data model: every non-tool message
    /// carries content (or, for assistant, outbound tool calls); tool
    /// messages carry the id of the call they answer.
    pub fn validate(&self) -> Result<()> {
        match self.role {
            Role::Tool => {
                if self.tool_call_id.as_deref().is_none_or(str::is_empty) {
                    return Err(Error::Validation(
                        "tool message missing tool_call_id".into(),
                    ));
                }
            }
            Role::Assistant => {
                let has_content = self.content.as_deref().is_some_and(|c| !c.is_empty());
                let has_calls = self.tool_calls.as_ref().is_some_and(|c| !c.is_empty());
                if !has_content && !has_calls {
                    return Err(Error::Validation(
                        "assistant message needs content or tool calls".into(),
                    ));
                }
            }
            Role::System | Role::User => {
                if self.content.as_deref().is_none_or(str::is_empty) {
                    return Err(Error::Validation(format!(
                        "{} message has no content",
                        self.role.as_str()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A structured tool invocation extracted from assistant output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Assigned by the parser (`call_{n}`) to correlate tool responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    /// Argument payload as JSON text, decoded only at execution time.
    pub arguments: String,
}

/// A streaming fragment of a chat response.
///
/// Tool calls are authoritative only on the terminal (`done`) chunk; content
/// fragments are append-only in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub model: String,
    /// Unix timestamp of chunk creation.
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning-trace content, populated when think-mode is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_tokens: Option<u32>,
}

impl Chunk {
    pub(crate) fn content(model: &str, text: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            content: Some(text.into()),
            thinking: None,
            tool_calls: None,
            done: false,
            prompt_tokens: None,
            generated_tokens: None,
        }
    }

    pub(crate) fn thinking(model: &str, text: impl Into<String>) -> Self {
        Self {
            content: None,
            thinking: Some(text.into()),
            ..Self::content(model, "")
        }
    }

    pub(crate) fn terminal(
        model: &str,
        tool_calls: Option<Vec<ToolCall>>,
        prompt_tokens: u32,
        generated_tokens: u32,
    ) -> Self {
        Self {
            model: model.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            content: None,
            thinking: None,
            tool_calls,
            done: true,
            prompt_tokens: Some(prompt_tokens),
            generated_tokens: Some(generated_tokens),
        }
    }
}

/// Aggregate response assembled from a completed stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub created_at: i64,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    pub prompt_tokens: u32,
    pub generated_tokens: u32,
}

/// Sampling and bounding knobs for one generation.
///
/// Frequency/presence penalties follow the signed chat-API convention; the
/// worker translates them to the native multiplier scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    /// Reproducible sampling when set; a high-resolution timestamp otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.95,
            top_k: 40,
            max_tokens: 512,
            seed: None,
            repeat_penalty: None,
            frequency_penalty: None,
            presence_penalty: None,
        }
    }
}

impl GenerationOptions {
    pub fn any_penalty_set(&self) -> bool {
        self.repeat_penalty.is_some()
            || self.frequency_penalty.is_some()
            || self.presence_penalty.is_some()
    }
}

/// One embedding vector. The native library yields `f32`; values are widened
/// to `f64` at this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub index: usize,
    pub values: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_requires_content() {
        let mut msg = Message::user("hello");
        assert!(msg.validate().is_ok());
        msg.content = None;
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_assistant_tool_calls_stand_in_for_content() {
        let msg = Message {
            role: Role::Assistant,
            content: None,
            images: None,
            tool_call_id: None,
            tool_calls: Some(vec![ToolCall {
                id: Some("call_0".into()),
                name: "calculator".into(),
                arguments: "{}".into(),
            }]),
        };
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_tool_message_requires_call_id() {
        let msg = Message::tool("4", "call_0");
        assert!(msg.validate().is_ok());

        let bad = Message {
            tool_call_id: None,
            ..msg
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_role_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        let role: Role = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(role, Role::Tool);
    }

    #[test]
    fn test_has_images() {
        let mut msg = Message::user("look");
        assert!(!msg.has_images());
        msg.images = Some(vec![]);
        assert!(!msg.has_images());
        msg.images = Some(vec!["img0".into()]);
        assert!(msg.has_images());
    }
}
