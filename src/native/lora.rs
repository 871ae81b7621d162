//! LoRA adapter handles and their reference-counted cache.
//!
//! Structurally the LoRA manager mirrors the model pool, keyed by adapter
//! path. Adapter metadata comes from the adapter's own GGUF header rather
//! than extra ABI calls; adaptive adapters are recognized by a non-empty
//! invocation-token list.

use std::collections::HashMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Context, Model};
use crate::error::{Error, Result};
use crate::gguf::{self, GgufValue};

/// Metadata key holding an adaptive adapter's invocation token list.
const ALORA_INVOCATION_KEY: &str = "adapter.alora.invocation_tokens";

pub struct LoraAdapter {
    ptr: NonNull<llama_cpp_sys_2::llama_adapter_lora>,
    path: PathBuf,
    metadata: HashMap<String, String>,
    invocation_token_count: u64,
}

unsafe impl Send for LoraAdapter {}
unsafe impl Sync for LoraAdapter {}

impl LoraAdapter {
    /// Initialize an adapter against `model`.
    pub fn load(model: &Model, path: &Path) -> Result<Self> {
        let c_path = CString::new(path.to_string_lossy().into_owned())
            .map_err(|_| Error::LoraLoad("adapter path contains NUL".into()))?;

        let raw = unsafe {
            llama_cpp_sys_2::llama_adapter_lora_init(model.as_ptr(), c_path.as_ptr())
        };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::LoraLoad(format!("adapter init failed: {}", path.display()))
        })?;

        // Metadata is optional; a missing or unreadable header leaves an
        // empty map rather than failing the load.
        let (metadata, invocation_token_count) = match gguf::read_metadata(path) {
            Ok(meta) => {
                let invocation = match meta.get(ALORA_INVOCATION_KEY) {
                    Some(GgufValue::Array(_, items)) => items.len() as u64,
                    Some(v) => v.as_u64().unwrap_or(0),
                    None => 0,
                };
                let map = meta
                    .entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_display_string()))
                    .collect();
                (map, invocation)
            }
            Err(e) => {
                warn!(path = %path.display(), "adapter metadata unreadable: {e}");
                (HashMap::new(), 0)
            }
        };

        info!(
            path = %path.display(),
            adaptive = invocation_token_count > 0,
            "lora adapter loaded"
        );
        Ok(Self {
            ptr,
            path: path.to_path_buf(),
            metadata,
            invocation_token_count,
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut llama_cpp_sys_2::llama_adapter_lora {
        self.ptr.as_ptr()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn invocation_token_count(&self) -> u64 {
        self.invocation_token_count
    }

    /// Adaptive LoRAs activate on their invocation tokens instead of
    /// applying unconditionally.
    pub fn is_adaptive(&self) -> bool {
        self.invocation_token_count > 0
    }
}

impl Drop for LoraAdapter {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "freeing lora adapter");
        unsafe { llama_cpp_sys_2::llama_adapter_lora_free(self.ptr.as_ptr()) };
    }
}

struct LoraEntry {
    adapter: Arc<LoraAdapter>,
    refcount: usize,
}

/// Reference-counted adapter cache plus context application helpers.
#[derive(Default)]
pub struct LoraManager {
    entries: HashMap<PathBuf, LoraEntry>,
}

impl LoraManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, model: &Model, path: &Path) -> Result<Arc<LoraAdapter>> {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.refcount += 1;
            debug!(path = %path.display(), refcount = entry.refcount, "lora cache hit");
            return Ok(Arc::clone(&entry.adapter));
        }

        let adapter = Arc::new(LoraAdapter::load(model, path)?);
        self.entries.insert(
            path.to_path_buf(),
            LoraEntry {
                adapter: Arc::clone(&adapter),
                refcount: 1,
            },
        );
        Ok(adapter)
    }

    pub fn unload(&mut self, path: &Path, force: bool) {
        let Some(entry) = self.entries.get_mut(path) else {
            warn!(path = %path.display(), "unload of unknown adapter ignored");
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if force || entry.refcount == 0 {
            self.entries.remove(path);
            info!(path = %path.display(), forced = force, "lora adapter disposed");
        }
    }

    pub fn unload_all(&mut self) {
        self.entries.clear();
    }

    pub fn apply(&self, ctx: &mut Context, adapter: &LoraAdapter, scale: f32) -> Result<()> {
        ctx.set_lora(adapter, scale)
    }

    pub fn remove(&self, ctx: &mut Context, adapter: &LoraAdapter) -> Result<()> {
        ctx.remove_lora(adapter)
    }

    pub fn clear(&self, ctx: &mut Context) {
        ctx.clear_lora();
    }

    /// Clear whatever is applied, then apply `adapter` when given.
    pub fn switch(
        &self,
        ctx: &mut Context,
        adapter: Option<&LoraAdapter>,
        scale: f32,
    ) -> Result<()> {
        self.clear(ctx);
        if let Some(adapter) = adapter {
            self.apply(ctx, adapter, scale)?;
        }
        Ok(())
    }

    pub fn refcount(&self, path: &Path) -> usize {
        self.entries.get(path).map_or(0, |e| e.refcount)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unload_unknown_adapter_is_noop() {
        let mut mgr = LoraManager::new();
        mgr.unload(Path::new("/never/adapter.gguf"), false);
        assert_eq!(mgr.len(), 0);
    }

    #[test]
    fn test_refcount_unknown_is_zero() {
        let mgr = LoraManager::new();
        assert_eq!(mgr.refcount(Path::new("/x.gguf")), 0);
    }
}
