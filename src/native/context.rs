//! Per-session inference context.
//!
//! Carries the KV cache and decode scratch space for one model. Contexts are
//! not thread-safe; the worker creates, drives, and frees each one inside
//! its own thread.

use std::ptr::NonNull;
use std::sync::Arc;

use tracing::debug;

use super::{Batch, Model};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    /// Thread count for generation and batch decode; defaults to the
    /// physical core count.
    pub n_threads: Option<i32>,
    pub embeddings: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 512,
            n_threads: None,
            embeddings: false,
        }
    }
}

pub struct Context {
    ptr: NonNull<llama_cpp_sys_2::llama_context>,
    /// Keeps the model alive for the lifetime of the context.
    model: Arc<Model>,
    n_ctx: u32,
}

impl Context {
    pub fn new(model: Arc<Model>, params: &ContextParams) -> Result<Self> {
        let threads = params
            .n_threads
            .unwrap_or_else(|| num_cpus::get_physical() as i32);

        let mut ctx_params = unsafe { llama_cpp_sys_2::llama_context_default_params() };
        ctx_params.n_ctx = params.n_ctx;
        ctx_params.n_batch = params.n_batch;
        ctx_params.n_threads = threads;
        ctx_params.n_threads_batch = threads;
        ctx_params.embeddings = params.embeddings;

        let raw = unsafe { llama_cpp_sys_2::llama_init_from_model(model.as_ptr(), ctx_params) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::ContextCreate(format!(
                "context allocation failed (n_ctx={}, n_batch={})",
                params.n_ctx, params.n_batch
            ))
        })?;

        debug!(n_ctx = params.n_ctx, n_batch = params.n_batch, threads, "context created");
        Ok(Self {
            ptr,
            model,
            n_ctx: params.n_ctx,
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut llama_cpp_sys_2::llama_context {
        self.ptr.as_ptr()
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    /// Run one decode over the batch, updating KV state.
    pub fn decode(&mut self, batch: &Batch) -> Result<()> {
        let rc = unsafe { llama_cpp_sys_2::llama_decode(self.ptr.as_ptr(), batch.as_raw()) };
        if rc != 0 {
            return Err(Error::Inference {
                stage: "decode",
                message: format!("llama_decode returned {rc}"),
            });
        }
        Ok(())
    }

    pub fn kv_clear(&mut self) {
        unsafe { llama_cpp_sys_2::llama_kv_cache_clear(self.ptr.as_ptr()) };
    }

    /// Pooled embedding vector for a sequence. Requires a context created
    /// with `embeddings: true`.
    pub fn embeddings_seq(&self, seq_id: i32) -> Result<Vec<f32>> {
        let raw = unsafe { llama_cpp_sys_2::llama_get_embeddings_seq(self.ptr.as_ptr(), seq_id) };
        if raw.is_null() {
            return Err(Error::Inference {
                stage: "embeddings",
                message: format!("no embedding available for sequence {seq_id}"),
            });
        }
        let n_embd = self.model.n_embd() as usize;
        Ok(unsafe { std::slice::from_raw_parts(raw, n_embd) }.to_vec())
    }

    /// Apply a LoRA adapter at `scale`.
    pub fn set_lora(&mut self, adapter: &super::LoraAdapter, scale: f32) -> Result<()> {
        let rc = unsafe {
            llama_cpp_sys_2::llama_set_adapter_lora(self.ptr.as_ptr(), adapter.as_ptr(), scale)
        };
        if rc != 0 {
            return Err(Error::LoraApply(format!(
                "llama_set_adapter_lora returned {rc}"
            )));
        }
        Ok(())
    }

    pub fn remove_lora(&mut self, adapter: &super::LoraAdapter) -> Result<()> {
        let rc = unsafe {
            llama_cpp_sys_2::llama_rm_adapter_lora(self.ptr.as_ptr(), adapter.as_ptr())
        };
        if rc != 0 {
            return Err(Error::LoraApply(format!(
                "llama_rm_adapter_lora returned {rc}"
            )));
        }
        Ok(())
    }

    pub fn clear_lora(&mut self) {
        unsafe { llama_cpp_sys_2::llama_clear_adapter_lora(self.ptr.as_ptr()) };
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { llama_cpp_sys_2::llama_free(self.ptr.as_ptr()) };
    }
}
