//! Safe layer over the llama.cpp C ABI.
//!
//! Everything that touches `llama_cpp_sys_2` lives under this module. The
//! wrappers are deliberately thin: NonNull ownership, CString marshalling,
//! and error translation — policy stays in the worker.

pub mod backend;
mod batch;
mod context;
mod lora;
mod model;
mod pool;
mod sampler;

pub use batch::Batch;
pub use context::{Context, ContextParams};
pub use lora::{LoraAdapter, LoraManager};
pub use model::Model;
pub use pool::ModelPool;
pub use sampler::Sampler;
