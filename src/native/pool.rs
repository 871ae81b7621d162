//! Reference-counted loaded-model cache.
//!
//! Keyed by path; the first load opens the file, later loads share the
//! handle. A handle is disposed only when its refcount reaches zero (or the
//! caller forces it). The pool is worker-owned and single-writer, so no
//! internal locking is needed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::Model;
use crate::error::Result;

struct PoolEntry {
    model: Arc<Model>,
    refcount: usize,
}

#[derive(Default)]
pub struct ModelPool {
    entries: HashMap<PathBuf, PoolEntry>,
}

impl ModelPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the model at `path`, loading it on first use.
    pub fn load(&mut self, path: &Path, n_gpu_layers: u32) -> Result<Arc<Model>> {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.refcount += 1;
            debug!(path = %path.display(), refcount = entry.refcount, "model pool hit");
            return Ok(Arc::clone(&entry.model));
        }

        let model = Arc::new(Model::load(path, n_gpu_layers)?);
        self.entries.insert(
            path.to_path_buf(),
            PoolEntry {
                model: Arc::clone(&model),
                refcount: 1,
            },
        );
        info!(path = %path.display(), "model pooled");
        Ok(model)
    }

    /// Drop one reference. The handle is disposed when the count reaches
    /// zero, or immediately when `force` is set.
    pub fn unload(&mut self, path: &Path, force: bool) {
        let Some(entry) = self.entries.get_mut(path) else {
            warn!(path = %path.display(), "unload of unknown model ignored");
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if force || entry.refcount == 0 {
            self.entries.remove(path);
            info!(path = %path.display(), forced = force, "model disposed");
        }
    }

    /// Force-dispose every entry.
    pub fn unload_all(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        if count > 0 {
            info!(count, "model pool cleared");
        }
    }

    pub fn refcount(&self, path: &Path) -> usize {
        self.entries.get(path).map_or(0, |e| e.refcount)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::Write;

    #[test]
    fn test_load_missing_file_is_model_load_error() {
        let mut pool = ModelPool::new();
        let err = pool
            .load(Path::new("/nonexistent/model.gguf"), 0)
            .unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_load_empty_file_is_model_load_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.flush().unwrap();
        let mut pool = ModelPool::new();
        let err = pool.load(file.path(), 0).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    #[test]
    fn test_unload_unknown_is_noop() {
        let mut pool = ModelPool::new();
        pool.unload(Path::new("/never/loaded.gguf"), false);
        pool.unload(Path::new("/never/loaded.gguf"), true);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_refcount_of_unknown_is_zero() {
        let pool = ModelPool::new();
        assert_eq!(pool.refcount(Path::new("/x.gguf")), 0);
    }
}
