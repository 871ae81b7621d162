//! Explicit chat templates.
//!
//! The native library's own template application is preferred when messages
//! reach the worker as a message list; this family is the fallback when the
//! model carries no usable template. Each template serializes the message
//! list, appends the assistant turn opener, and names the stop tokens the
//! sampler needs to terminate generation deterministically.

use std::path::Path;

use tracing::debug;

use crate::types::{Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    ChatML,
    Llama2,
    Llama3,
    Alpaca,
    Vicuna,
    Phi3,
    /// No structure at all: contents concatenated in order.
    Raw,
}

/// Filename substring → template. Checked case-insensitively, first hit wins.
const FILENAME_PATTERNS: &[(&str, ChatTemplate)] = &[
    ("llama-3", ChatTemplate::Llama3),
    ("llama3", ChatTemplate::Llama3),
    ("llama-2", ChatTemplate::Llama2),
    ("llama2", ChatTemplate::Llama2),
    ("qwen", ChatTemplate::ChatML),
    ("openhermes", ChatTemplate::ChatML),
    ("mistral", ChatTemplate::ChatML),
    ("chatml", ChatTemplate::ChatML),
    ("alpaca", ChatTemplate::Alpaca),
    ("vicuna", ChatTemplate::Vicuna),
    ("phi-3", ChatTemplate::Phi3),
    ("phi3", ChatTemplate::Phi3),
];

impl ChatTemplate {
    /// Pick a template from the model filename. ChatML is the default for
    /// anything unrecognized.
    pub fn detect_from_path(path: &Path) -> Self {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase();
        for &(pattern, template) in FILENAME_PATTERNS {
            if filename.contains(pattern) {
                debug!(?template, pattern, "template matched from filename");
                return template;
            }
        }
        ChatTemplate::ChatML
    }

    /// Secondary detection from the GGUF-embedded template text, for models
    /// whose filenames say nothing useful.
    pub fn detect_from_template_text(template: &str) -> Option<Self> {
        if template.contains("<|im_start|>") && template.contains("<|im_end|>") {
            Some(ChatTemplate::ChatML)
        } else if template.contains("<|start_header_id|>") {
            Some(ChatTemplate::Llama3)
        } else if template.contains("[INST]") {
            Some(ChatTemplate::Llama2)
        } else if template.contains("<|system|>") && template.contains("<|end|>") {
            Some(ChatTemplate::Phi3)
        } else {
            None
        }
    }

    /// Stop tokens that mark the end of an assistant turn for this family.
    pub fn stop_tokens(&self) -> Vec<String> {
        let tokens: &[&str] = match self {
            ChatTemplate::ChatML => &["<|im_end|>", "<|im_start|>"],
            ChatTemplate::Llama2 => &["</s>", "[INST]"],
            ChatTemplate::Llama3 => &["<|eot_id|>", "<|end_of_text|>"],
            ChatTemplate::Alpaca => &["### Instruction:"],
            ChatTemplate::Vicuna => &["USER:"],
            ChatTemplate::Phi3 => &["<|end|>", "<|user|>"],
            ChatTemplate::Raw => &[],
        };
        tokens.iter().map(|s| s.to_string()).collect()
    }

    /// Serialize the messages and append the assistant turn opener.
    pub fn format(&self, messages: &[Message]) -> String {
        match self {
            ChatTemplate::ChatML => format_chatml(messages),
            ChatTemplate::Llama2 => format_llama2(messages),
            ChatTemplate::Llama3 => format_llama3(messages),
            ChatTemplate::Alpaca => format_alpaca(messages),
            ChatTemplate::Vicuna => format_vicuna(messages),
            ChatTemplate::Phi3 => format_phi3(messages),
            ChatTemplate::Raw => format_raw(messages),
        }
    }
}

fn content_of(msg: &Message) -> &str {
    msg.content.as_deref().unwrap_or_default()
}

fn format_chatml(messages: &[Message]) -> String {
    let mut p = String::new();
    for msg in messages {
        p.push_str("<|im_start|>");
        p.push_str(msg.role.as_str());
        p.push('\n');
        p.push_str(content_of(msg));
        p.push_str("<|im_end|>\n");
    }
    p.push_str("<|im_start|>assistant\n");
    p
}

fn format_llama2(messages: &[Message]) -> String {
    // <s>[INST] <<SYS>>…<</SYS>> user [/INST] assistant </s>
    let mut p = String::from("<s>");
    let mut system: Option<&str> = None;
    let mut open_inst = false;

    for msg in messages {
        match msg.role {
            Role::System => system = Some(content_of(msg)),
            Role::User | Role::Tool => {
                p.push_str("[INST] ");
                if let Some(sys) = system.take() {
                    p.push_str("<<SYS>>\n");
                    p.push_str(sys);
                    p.push_str("\n<</SYS>>\n\n");
                }
                p.push_str(content_of(msg));
                p.push_str(" [/INST]");
                open_inst = true;
            }
            Role::Assistant => {
                p.push(' ');
                p.push_str(content_of(msg));
                p.push_str(" </s><s>");
                open_inst = false;
            }
        }
    }
    if !open_inst {
        p.push_str("[INST] [/INST]");
    }
    p
}

fn format_llama3(messages: &[Message]) -> String {
    let mut p = String::from("<|begin_of_text|>");
    for msg in messages {
        p.push_str("<|start_header_id|>");
        p.push_str(msg.role.as_str());
        p.push_str("<|end_header_id|>\n\n");
        p.push_str(content_of(msg));
        p.push_str("<|eot_id|>");
    }
    p.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    p
}

fn format_alpaca(messages: &[Message]) -> String {
    let mut p = String::new();
    for msg in messages {
        match msg.role {
            Role::System => {
                p.push_str(content_of(msg));
                p.push_str("\n\n");
            }
            Role::User | Role::Tool => {
                p.push_str("### Instruction:\n");
                p.push_str(content_of(msg));
                p.push_str("\n\n");
            }
            Role::Assistant => {
                p.push_str("### Response:\n");
                p.push_str(content_of(msg));
                p.push_str("\n\n");
            }
        }
    }
    p.push_str("### Response:\n");
    p
}

fn format_vicuna(messages: &[Message]) -> String {
    let mut p = String::new();
    for msg in messages {
        let label = match msg.role {
            Role::System => "SYSTEM: ",
            Role::User | Role::Tool => "USER: ",
            Role::Assistant => "ASSISTANT: ",
        };
        p.push_str(label);
        p.push_str(content_of(msg));
        p.push('\n');
    }
    p.push_str("ASSISTANT: ");
    p
}

fn format_phi3(messages: &[Message]) -> String {
    let mut p = String::new();
    for msg in messages {
        let label = match msg.role {
            Role::System => "<|system|>",
            Role::User | Role::Tool => "<|user|>",
            Role::Assistant => "<|assistant|>",
        };
        p.push_str(label);
        p.push('\n');
        p.push_str(content_of(msg));
        p.push_str("<|end|>\n");
    }
    p.push_str("<|assistant|>\n");
    p
}

fn format_raw(messages: &[Message]) -> String {
    let mut p = String::new();
    for msg in messages {
        p.push_str(content_of(msg));
        p.push('\n');
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_detection() {
        let cases = [
            ("qwen-7b-q4.gguf", ChatTemplate::ChatML),
            ("Meta-Llama-3-8B-Instruct.Q4_K_M.gguf", ChatTemplate::Llama3),
            ("llama-2-13b-chat.gguf", ChatTemplate::Llama2),
            ("OpenHermes-2.5.gguf", ChatTemplate::ChatML),
            ("mistral-7b-instruct.gguf", ChatTemplate::ChatML),
            ("alpaca-native.gguf", ChatTemplate::Alpaca),
            ("vicuna-13b-v1.5.gguf", ChatTemplate::Vicuna),
            ("Phi-3-mini-4k.gguf", ChatTemplate::Phi3),
            ("some-unknown-model.gguf", ChatTemplate::ChatML),
        ];
        for (filename, expected) in cases {
            assert_eq!(
                ChatTemplate::detect_from_path(Path::new(filename)),
                expected,
                "{filename}"
            );
        }
    }

    #[test]
    fn test_template_text_detection() {
        assert_eq!(
            ChatTemplate::detect_from_template_text("{{'<|im_start|>' + role}}…<|im_end|>"),
            Some(ChatTemplate::ChatML)
        );
        assert_eq!(
            ChatTemplate::detect_from_template_text("<|start_header_id|>{{ role }}"),
            Some(ChatTemplate::Llama3)
        );
        assert_eq!(ChatTemplate::detect_from_template_text("plain prose"), None);
    }

    #[test]
    fn test_chatml_format_ends_with_opener() {
        let messages = vec![Message::system("Be brief."), Message::user("Hi")];
        let prompt = ChatTemplate::ChatML.format(&messages);
        assert!(prompt.contains("<|im_start|>system\nBe brief.<|im_end|>"));
        assert!(prompt.contains("<|im_start|>user\nHi<|im_end|>"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_llama2_system_folded_into_first_inst() {
        let messages = vec![Message::system("You are terse."), Message::user("Hello")];
        let prompt = ChatTemplate::Llama2.format(&messages);
        assert!(prompt.starts_with("<s>[INST] <<SYS>>\nYou are terse.\n<</SYS>>"));
        assert!(prompt.ends_with("[/INST]"));
    }

    #[test]
    fn test_llama3_round() {
        let messages = vec![Message::user("Hi"), Message::assistant("Hello")];
        let prompt = ChatTemplate::Llama3.format(&messages);
        assert!(prompt.starts_with("<|begin_of_text|>"));
        assert!(prompt.contains("<|start_header_id|>user<|end_header_id|>\n\nHi<|eot_id|>"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_stop_tokens_nonempty_except_raw() {
        for template in [
            ChatTemplate::ChatML,
            ChatTemplate::Llama2,
            ChatTemplate::Llama3,
            ChatTemplate::Alpaca,
            ChatTemplate::Vicuna,
            ChatTemplate::Phi3,
        ] {
            assert!(!template.stop_tokens().is_empty(), "{template:?}");
        }
        assert!(ChatTemplate::Raw.stop_tokens().is_empty());
    }

    #[test]
    fn test_tool_messages_render_in_explicit_templates() {
        let messages = vec![Message::user("2+2?"), Message::tool("4", "call_0")];
        let prompt = ChatTemplate::ChatML.format(&messages);
        assert!(prompt.contains("<|im_start|>tool\n4<|im_end|>"));
        // Families without a tool role fold the result into a user turn.
        let prompt = ChatTemplate::Vicuna.format(&messages);
        assert!(prompt.contains("USER: 4\n"));
    }
}
