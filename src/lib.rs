//! llamakit — a runtime façade for local LLM inference over llama.cpp.
//!
//! The crate centers on a persistent inference worker that owns exclusive
//! access to the native library, a streaming chat pipeline with automatic
//! tool-calling loops, a GGUF metadata reader, reference-counted model and
//! LoRA pools, and a deterministic model-acquisition planner.
//!
//! ```no_run
//! use std::path::PathBuf;
//! use futures_util::StreamExt;
//! use llamakit::{ChatEngine, InferenceSource, Message};
//!
//! # async fn demo() -> Result<(), llamakit::Error> {
//! let engine = ChatEngine::new(
//!     InferenceSource::Owned(PathBuf::from("models/qwen-7b-q4.gguf")),
//!     None,
//! );
//! let stream = engine.stream_chat(
//!     "qwen-7b",
//!     vec![Message::user("Hi")],
//!     None,
//!     None,
//!     None,
//!     None,
//! );
//! futures_util::pin_mut!(stream);
//! while let Some(chunk) = stream.next().await {
//!     if let Some(content) = chunk?.content {
//!         print!("{content}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod acquire;
pub mod error;
pub mod gguf;
pub mod native;
pub mod pipeline;
pub mod stream;
pub mod template;
pub mod toolcall;
pub mod tools;
pub mod types;
pub mod worker;

pub use acquire::{AcquireError, AcquisitionStage, AcquisitionStatus, ModelFetcher, Quantization};
pub use error::{Error, Result};
pub use gguf::{read_metadata, read_metadata_async, GgufError, GgufMetadata, GgufValue};
pub use native::{LoraAdapter, LoraManager, Model, ModelPool};
pub use pipeline::{
    ChatEngine, ChatOptions, EngineConfig, InferenceSource, LoraConfig, DEFAULT_TOOL_ATTEMPTS,
};
pub use template::ChatTemplate;
pub use toolcall::parse_tool_calls;
pub use tools::{FnTool, Parameter, ParameterType, Tool, ToolError};
pub use types::{ChatResponse, Chunk, Embedding, GenerationOptions, Message, Role, ToolCall};
pub use worker::{
    EmbedParams, InferenceRequest, InferenceWorker, LoraRequest, PromptInput, RequestSource,
    WorkerEvent,
};
