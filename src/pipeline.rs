//! Streaming chat pipeline.
//!
//! Validates the request, submits it to the persistent worker, surfaces
//! token chunks through the stream handler, and on detected tool calls
//! executes the tools and re-enters itself with augmented history until the
//! attempt budget runs out. Tool execution errors are reified as tool-role
//! messages; they never abort generation.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::native::Model;
use crate::stream::{StreamHandler, ThinkFilter};
use crate::tools::{find_tool, Tool};
use crate::types::{ChatResponse, Chunk, GenerationOptions, Message, Role, ToolCall};
use crate::worker::{
    run_embedding_batch, EmbedParams, InferenceRequest, InferenceWorker, LoraRequest, PromptInput,
    RequestSource, WorkerEvent,
};

/// Guard against unbounded agent loops: one attempt is one round of
/// generation, optional tool execution, and re-entry.
pub const DEFAULT_TOOL_ATTEMPTS: u32 = 25;

const MAX_MODEL_NAME_LEN: usize = 256;

/// Where the engine's model comes from. Lazy loading is the worker's job,
/// not the constructor's.
#[derive(Debug, Clone)]
pub enum InferenceSource {
    /// Load from this path through the worker's pool.
    Owned(PathBuf),
    /// Share a handle the caller already holds.
    Shared(Arc<Model>),
}

#[derive(Debug, Clone)]
pub struct LoraConfig {
    pub path: PathBuf,
    pub scale: f32,
}

/// Context sizing defaults applied to every request from this engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_gpu_layers: u32,
    pub n_threads: Option<i32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 512,
            n_gpu_layers: 0,
            n_threads: None,
        }
    }
}

/// Bundled per-call options. When provided, its tools/extra/tool-attempts
/// take precedence over the scalar parameters of `stream_chat`.
#[derive(Default, Clone)]
pub struct ChatOptions {
    pub generation: GenerationOptions,
    pub stop: Vec<String>,
    pub tools: Option<Vec<Arc<dyn Tool>>>,
    pub extra: Option<Value>,
    pub tool_attempts: Option<u32>,
}

/// Resolved options after merge precedence.
#[derive(Clone)]
struct EffectiveOptions {
    generation: GenerationOptions,
    stop: Vec<String>,
    tools: Vec<Arc<dyn Tool>>,
    extra: Value,
    tool_attempts: u32,
    think: bool,
}

/// The chat repository over the native backend.
pub struct ChatEngine {
    source: InferenceSource,
    lora: Option<LoraConfig>,
    config: EngineConfig,
    worker: OnceLock<Arc<InferenceWorker>>,
}

impl ChatEngine {
    /// Single constructor: an explicit inference source plus optional LoRA.
    pub fn new(source: InferenceSource, lora: Option<LoraConfig>) -> Self {
        Self {
            source,
            lora,
            config: EngineConfig::default(),
            worker: OnceLock::new(),
        }
    }

    /// Construct with an injected worker shared across engines.
    pub fn with_worker(
        source: InferenceSource,
        lora: Option<LoraConfig>,
        worker: Arc<InferenceWorker>,
    ) -> Self {
        let engine = Self::new(source, lora);
        let _ = engine.worker.set(worker);
        engine
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The worker is created lazily on first inference unless injected.
    fn worker(&self) -> Arc<InferenceWorker> {
        Arc::clone(self.worker.get_or_init(InferenceWorker::spawn))
    }

    fn request_source(&self) -> RequestSource {
        match &self.source {
            InferenceSource::Owned(path) => RequestSource::Path(path.clone()),
            InferenceSource::Shared(model) => RequestSource::Handle(Arc::clone(model)),
        }
    }

    fn model_path(&self) -> PathBuf {
        match &self.source {
            InferenceSource::Owned(path) => path.clone(),
            InferenceSource::Shared(model) => model.path().to_path_buf(),
        }
    }

    /// Stream a chat completion. Non-terminal chunks carry content in
    /// arrival order; the terminal chunk carries tool calls and counters.
    pub fn stream_chat(
        &self,
        model: &str,
        messages: Vec<Message>,
        think: Option<bool>,
        tools: Option<Vec<Arc<dyn Tool>>>,
        extra: Option<Value>,
        options: Option<ChatOptions>,
    ) -> impl Stream<Item = Result<Chunk>> + Send + 'static {
        let validated = validate_request(model, &messages)
            .map(|()| merge_options(think, tools, extra, options));
        let model = model.to_string();
        let worker = self.worker();
        let source = self.request_source();
        let lora = self.lora.clone();
        let config = self.config.clone();

        stream! {
            let effective = match validated {
                Ok(effective) => effective,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let tool_names: Vec<String> =
                effective.tools.iter().map(|t| t.name().to_string()).collect();
            let tools_configured = !effective.tools.is_empty();
            let mut history = messages;
            let mut attempts = effective.tool_attempts;

            loop {
                let request = build_request(
                    source.clone(),
                    &history,
                    &effective,
                    &lora,
                    &config,
                );
                let mut rx = worker.submit(request);
                let mut handler = StreamHandler::new(tool_names.clone(), tools_configured);
                let mut filter = ThinkFilter::new(effective.think);
                let mut counters: Option<(u32, u32)> = None;
                let mut failure: Option<Error> = None;

                while let Some(event) = rx.recv().await {
                    match event {
                        WorkerEvent::Token(token) => {
                            if let Some(text) = handler.push(&token) {
                                let split = filter.push(&text);
                                if let Some(content) = split.content {
                                    yield Ok(Chunk::content(&model, content));
                                }
                                if let Some(thinking) = split.thinking {
                                    yield Ok(Chunk::thinking(&model, thinking));
                                }
                            }
                        }
                        WorkerEvent::Done { prompt_tokens, generated_tokens } => {
                            counters = Some((prompt_tokens, generated_tokens));
                        }
                        WorkerEvent::Failed(e) => {
                            failure = Some(e);
                        }
                    }
                }

                if let Some(e) = failure {
                    yield Err(e);
                    return;
                }
                let Some((prompt_tokens, generated_tokens)) = counters else {
                    yield Err(Error::WorkerClosed(
                        "response stream ended without a completion".into(),
                    ));
                    return;
                };

                // Residual buffered content, then the terminal chunk.
                if let Some(residual) = handler.finalize() {
                    let split = filter.push(&residual);
                    if let Some(content) = split.content {
                        yield Ok(Chunk::content(&model, content));
                    }
                    if let Some(thinking) = split.thinking {
                        yield Ok(Chunk::thinking(&model, thinking));
                    }
                }
                let split = filter.finalize();
                if let Some(content) = split.content {
                    yield Ok(Chunk::content(&model, content));
                }
                if let Some(thinking) = split.thinking {
                    yield Ok(Chunk::thinking(&model, thinking));
                }

                let calls = handler.take_tool_calls();
                let raw_content = handler.content().to_string();
                yield Ok(Chunk::terminal(
                    &model,
                    (!calls.is_empty()).then(|| calls.clone()),
                    prompt_tokens,
                    generated_tokens,
                ));

                if calls.is_empty() || !tools_configured {
                    return;
                }
                if attempts == 0 {
                    warn!(
                        rounds = effective.tool_attempts,
                        "tool attempt budget exhausted; not recursing"
                    );
                    return;
                }
                attempts -= 1;
                debug!(remaining = attempts, calls = calls.len(), "executing tool round");

                history.push(Message {
                    role: Role::Assistant,
                    content: Some(raw_content),
                    images: None,
                    tool_call_id: None,
                    tool_calls: Some(calls.clone()),
                });
                execute_tool_round(&effective.tools, &calls, &effective.extra, &mut history);
            }
        }
    }

    /// Aggregate form of `stream_chat`, assembled by draining the stream.
    pub async fn chat_response(
        &self,
        model: &str,
        messages: Vec<Message>,
        think: Option<bool>,
        tools: Option<Vec<Arc<dyn Tool>>>,
        extra: Option<Value>,
        options: Option<ChatOptions>,
    ) -> Result<ChatResponse> {
        let stream = self.stream_chat(model, messages, think, tools, extra, options);
        futures_util::pin_mut!(stream);

        let mut content = String::new();
        let mut thinking = String::new();
        let mut tool_calls: Option<Vec<ToolCall>> = None;
        let mut prompt_tokens = 0;
        let mut generated_tokens = 0;
        let mut created_at = chrono::Utc::now().timestamp();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            created_at = chunk.created_at;
            if let Some(text) = chunk.content {
                content.push_str(&text);
            }
            if let Some(text) = chunk.thinking {
                thinking.push_str(&text);
            }
            if chunk.done {
                tool_calls = chunk.tool_calls;
                prompt_tokens = chunk.prompt_tokens.unwrap_or(0);
                generated_tokens = chunk.generated_tokens.unwrap_or(0);
            }
        }

        Ok(ChatResponse {
            model: model.to_string(),
            created_at,
            content,
            thinking: (!thinking.is_empty()).then_some(thinking),
            tool_calls,
            prompt_tokens,
            generated_tokens,
        })
    }

    /// Compute embeddings for a batch of texts on a short-lived worker that
    /// does not compete with chat.
    pub async fn embed(
        &self,
        model: &str,
        texts: Vec<String>,
        options: Option<EmbedParams>,
    ) -> Result<Vec<crate::types::Embedding>> {
        validate_model_name(model)?;
        if texts.is_empty() {
            return Err(Error::Validation("texts must not be empty".into()));
        }
        let path = self.model_path();
        let mut params = options.unwrap_or_default();
        params.n_gpu_layers = params.n_gpu_layers.max(self.config.n_gpu_layers);

        tokio::task::spawn_blocking(move || run_embedding_batch(&path, &texts, &params))
            .await
            .map_err(|e| Error::WorkerClosed(format!("embedding task failed: {e}")))?
    }
}

fn build_request(
    source: RequestSource,
    history: &[Message],
    effective: &EffectiveOptions,
    lora: &Option<LoraConfig>,
    config: &EngineConfig,
) -> InferenceRequest {
    InferenceRequest {
        source,
        input: PromptInput::Messages(history.to_vec()),
        stop_tokens: effective.stop.clone(),
        n_ctx: config.n_ctx,
        n_batch: config.n_batch,
        n_gpu_layers: config.n_gpu_layers,
        n_threads: config.n_threads,
        options: effective.generation.clone(),
        lora: lora.as_ref().map(|l| LoraRequest {
            path: l.path.clone(),
            scale: l.scale,
        }),
    }
}

fn validate_model_name(model: &str) -> Result<()> {
    if model.is_empty() {
        return Err(Error::Validation("model name must not be empty".into()));
    }
    if model.len() > MAX_MODEL_NAME_LEN {
        return Err(Error::Validation(format!(
            "model name exceeds {MAX_MODEL_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_request(model: &str, messages: &[Message]) -> Result<()> {
    validate_model_name(model)?;
    if messages.is_empty() {
        return Err(Error::Validation("messages must not be empty".into()));
    }
    for msg in messages {
        msg.validate()?;
        if msg.has_images() {
            return Err(Error::VisionUnsupported(
                "the native backend does not process image attachments".into(),
            ));
        }
    }
    Ok(())
}

/// Merge precedence: when a bundled options object is provided, its
/// tools/extra/tool-attempts override the scalar parameters outright — an
/// unset field does not fall back to a scalar. Without one, the scalar
/// parameters apply.
fn merge_options(
    think: Option<bool>,
    tools: Option<Vec<Arc<dyn Tool>>>,
    extra: Option<Value>,
    options: Option<ChatOptions>,
) -> EffectiveOptions {
    let (generation, stop, tools, extra, tool_attempts) = match options {
        Some(o) => (
            o.generation,
            o.stop,
            o.tools.unwrap_or_default(),
            o.extra.unwrap_or(Value::Null),
            o.tool_attempts.unwrap_or(DEFAULT_TOOL_ATTEMPTS),
        ),
        None => (
            GenerationOptions::default(),
            Vec::new(),
            tools.unwrap_or_default(),
            extra.unwrap_or(Value::Null),
            DEFAULT_TOOL_ATTEMPTS,
        ),
    };

    EffectiveOptions {
        generation,
        stop,
        tools,
        extra,
        tool_attempts,
        think: think.unwrap_or(false),
    }
}

/// Execute each call and append its tool-role message. Failures become
/// messages, not errors.
fn execute_tool_round(
    tools: &[Arc<dyn Tool>],
    calls: &[ToolCall],
    extra: &Value,
    history: &mut Vec<Message>,
) {
    for call in calls {
        let content = match execute_tool(tools, call, extra) {
            Ok(result) => result,
            Err(detail) => format!("Error executing tool: {detail}"),
        };
        history.push(Message::tool(content, call.id.clone().unwrap_or_default()));
    }
}

fn execute_tool(tools: &[Arc<dyn Tool>], call: &ToolCall, extra: &Value) -> std::result::Result<String, String> {
    let tool = find_tool(tools, &call.name).ok_or_else(|| format!("unknown tool: {}", call.name))?;
    let args: serde_json::Map<String, Value> = serde_json::from_str(&call.arguments)
        .map_err(|e| format!("invalid arguments for {}: {e}", call.name))?;
    let value = tool.execute(args, extra).map_err(|e| e.to_string())?;
    Ok(stringify_result(value))
}

/// String results pass through; structured values are serialized.
fn stringify_result(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FnTool, Parameter};
    use serde_json::json;

    fn calculator() -> Arc<dyn Tool> {
        FnTool::new(
            "calculator",
            "Evaluate arithmetic",
            vec![Parameter::string("expression", "Expression")],
            |args, _| {
                match args.get("expression").and_then(Value::as_str) {
                    Some("2+2") => Ok(json!("4")),
                    _ => Err("unsupported expression".into()),
                }
            },
        )
    }

    #[test]
    fn test_validate_rejects_empty_model() {
        assert!(matches!(
            validate_request("", &[Message::user("hi")]),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_long_model_name() {
        let name = "m".repeat(MAX_MODEL_NAME_LEN + 1);
        assert!(matches!(
            validate_request(&name, &[Message::user("hi")]),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_messages() {
        assert!(matches!(
            validate_request("m", &[]),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_images() {
        let mut msg = Message::user("describe this");
        msg.images = Some(vec!["base64…".into()]);
        assert!(matches!(
            validate_request("m", &[msg]),
            Err(Error::VisionUnsupported(_))
        ));
    }

    #[test]
    fn test_merge_scalars_apply_without_options() {
        let effective = merge_options(Some(true), Some(vec![calculator()]), Some(json!(1)), None);
        assert!(effective.think);
        assert_eq!(effective.tools.len(), 1);
        assert_eq!(effective.extra, json!(1));
        assert_eq!(effective.tool_attempts, DEFAULT_TOOL_ATTEMPTS);
    }

    #[test]
    fn test_merge_options_override_scalars() {
        let options = ChatOptions {
            tools: Some(vec![]),
            extra: Some(json!({"a": 1})),
            tool_attempts: Some(3),
            ..ChatOptions::default()
        };
        let effective = merge_options(None, Some(vec![calculator()]), Some(json!(2)), Some(options));
        // Bundled values win.
        assert!(effective.tools.is_empty());
        assert_eq!(effective.extra, json!({"a": 1}));
        assert_eq!(effective.tool_attempts, 3);
    }

    #[test]
    fn test_bundled_options_supersede_scalars_even_when_unset() {
        // Precedence is all-or-nothing: supplying an options object means
        // its (unset) fields apply, not the scalars.
        let options = ChatOptions::default();
        let effective = merge_options(None, Some(vec![calculator()]), Some(json!(7)), Some(options));
        assert!(effective.tools.is_empty());
        assert_eq!(effective.extra, Value::Null);
        assert_eq!(effective.tool_attempts, DEFAULT_TOOL_ATTEMPTS);
    }

    #[test]
    fn test_execute_tool_round_success_and_error() {
        let tools = vec![calculator()];
        let calls = vec![
            ToolCall {
                id: Some("call_0".into()),
                name: "calculator".into(),
                arguments: r#"{"expression":"2+2"}"#.into(),
            },
            ToolCall {
                id: Some("call_1".into()),
                name: "calculator".into(),
                arguments: r#"{"expression":"9/0"}"#.into(),
            },
            ToolCall {
                id: Some("call_2".into()),
                name: "missing".into(),
                arguments: "{}".into(),
            },
        ];
        let mut history = Vec::new();
        execute_tool_round(&tools, &calls, &Value::Null, &mut history);

        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content.as_deref(), Some("4"));
        assert_eq!(history[0].tool_call_id.as_deref(), Some("call_0"));
        assert!(history[1]
            .content
            .as_deref()
            .unwrap()
            .starts_with("Error executing tool:"));
        assert!(history[2]
            .content
            .as_deref()
            .unwrap()
            .contains("unknown tool"));
        assert!(history.iter().all(|m| m.role == Role::Tool));
    }

    #[test]
    fn test_stringify_result() {
        assert_eq!(stringify_result(json!("plain")), "plain");
        assert_eq!(stringify_result(json!({"x": 1})), r#"{"x":1}"#);
        assert_eq!(stringify_result(json!(42)), "42");
    }

    #[tokio::test]
    async fn test_stream_chat_validation_error_is_first_item() {
        let engine = ChatEngine::new(
            InferenceSource::Owned(PathBuf::from("/m/q.gguf")),
            None,
        );
        let stream = engine.stream_chat("", vec![Message::user("hi")], None, None, None, None);
        futures_util::pin_mut!(stream);
        match stream.next().await {
            Some(Err(Error::Validation(_))) => {}
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_chat_missing_model_surfaces_model_load() {
        let engine = ChatEngine::new(
            InferenceSource::Owned(PathBuf::from("/nonexistent/q.gguf")),
            None,
        );
        let stream = engine.stream_chat(
            "qwen-7b-q4.gguf",
            vec![Message::user("Hi")],
            None,
            None,
            None,
            None,
        );
        futures_util::pin_mut!(stream);
        match stream.next().await {
            Some(Err(Error::ModelLoad(_))) => {}
            other => panic!("expected model-load error, got {other:?}"),
        }
    }
}
