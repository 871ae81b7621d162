//! Process-once native backend initialization.
//!
//! Backend registries live in native memory shared across every scheduler in
//! the process; loading them twice corrupts that state. A `OnceLock` gates
//! the load so only the first caller does the work.

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, info, warn};

static BACKEND_LOADED: OnceLock<BackendLoad> = OnceLock::new();

/// Which detection step succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendLoad {
    /// The generic load-all entry point registered backends.
    All,
    /// Backends were loaded from the resolved native library directory.
    FromPath(PathBuf),
    /// Individual CPU backend objects were loaded explicitly.
    Explicit(usize),
    /// Nothing registered dynamically; the backend may be statically linked.
    None,
}

/// Initialize native backends, once per process. Safe to call from any
/// number of callers; all but the first are no-ops.
pub fn ensure_loaded() -> &'static BackendLoad {
    BACKEND_LOADED.get_or_init(init_backends)
}

/// Worker-mode initialization: the worker lives in its own scheduling domain
/// but the backend registry is process-global, so loading is skipped. The
/// library handle is re-resolved for the worker's own use.
pub fn ensure_loaded_for_worker() -> &'static BackendLoad {
    if let Some(load) = BACKEND_LOADED.get() {
        if let Some(dir) = native_library_dir() {
            debug!(dir = %dir.display(), "worker re-resolved native library directory");
        }
        return load;
    }
    ensure_loaded()
}

fn init_backends() -> BackendLoad {
    unsafe {
        llama_cpp_sys_2::llama_log_set(Some(native_log_callback), std::ptr::null_mut());
        llama_cpp_sys_2::llama_backend_init();
    }

    // Step 1: generic load-all entry point.
    unsafe { llama_cpp_sys_2::ggml_backend_load_all() };
    let count = registered_backends();
    if count > 0 {
        info!(count, "native backends loaded");
        return BackendLoad::All;
    }

    // Step 2: path-taking variant against the resolved library directory.
    if let Some(dir) = native_library_dir() {
        if let Ok(c_dir) = CString::new(dir.to_string_lossy().into_owned()) {
            unsafe { llama_cpp_sys_2::ggml_backend_load_all_from_path(c_dir.as_ptr()) };
        }
        let count = registered_backends();
        if count > 0 {
            info!(count, dir = %dir.display(), "native backends loaded from library directory");
            return BackendLoad::FromPath(dir);
        }

        // Step 3: load matching CPU backend objects one by one.
        let loaded = load_cpu_backends(&dir);
        if loaded > 0 {
            info!(loaded, dir = %dir.display(), "cpu backend objects loaded explicitly");
            return BackendLoad::Explicit(loaded);
        }
    }

    // Step 4: nothing dynamic registered. Not fatal — static linkage covers it.
    warn!("no dynamic compute backends registered; assuming statically linked backend");
    BackendLoad::None
}

fn registered_backends() -> usize {
    unsafe { llama_cpp_sys_2::ggml_backend_reg_count() }
}

/// Resolve the directory containing the native library by walking a known
/// exported symbol back to its object file.
#[cfg(unix)]
pub fn native_library_dir() -> Option<PathBuf> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let symbol: unsafe extern "C" fn() = llama_cpp_sys_2::llama_backend_init;
    let rc = unsafe { libc::dladdr(symbol as *const c_void, &mut info) };
    if rc == 0 || info.dli_fname.is_null() {
        return None;
    }
    let fname = unsafe { CStr::from_ptr(info.dli_fname) }
        .to_string_lossy()
        .into_owned();
    Path::new(&fname).parent().map(Path::to_path_buf)
}

#[cfg(not(unix))]
pub fn native_library_dir() -> Option<PathBuf> {
    None
}

/// Platform filename pattern for a loadable CPU backend object.
fn is_cpu_backend_file(name: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        name.starts_with("libggml-cpu") && name.ends_with(".dylib")
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        name.starts_with("libggml-cpu") && name.ends_with(".so")
    }
    #[cfg(not(unix))]
    {
        name.starts_with("ggml-cpu") && name.ends_with(".dll")
    }
}

fn load_cpu_backends(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut loaded = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_cpu_backend_file(name) {
            continue;
        }
        let Ok(c_path) = CString::new(path.to_string_lossy().into_owned()) else {
            continue;
        };
        let reg = unsafe { llama_cpp_sys_2::ggml_backend_load(c_path.as_ptr()) };
        if !reg.is_null() {
            debug!(path = %path.display(), "loaded backend object");
            loaded += 1;
        }
    }
    loaded
}

// ggml log levels; kept numeric so the shim is robust to bindgen naming.
const LOG_LEVEL_DEBUG: u32 = 1;
const LOG_LEVEL_INFO: u32 = 2;
const LOG_LEVEL_WARN: u32 = 3;
const LOG_LEVEL_ERROR: u32 = 4;

/// Routes native library diagnostics into `tracing`.
unsafe extern "C" fn native_log_callback(
    level: llama_cpp_sys_2::ggml_log_level,
    text: *const c_char,
    _user_data: *mut c_void,
) {
    if text.is_null() {
        return;
    }
    let message = unsafe { CStr::from_ptr(text) }.to_string_lossy();
    let message = message.trim_end();
    if message.is_empty() {
        return;
    }
    match level as u32 {
        LOG_LEVEL_ERROR => tracing::error!(target: "llamakit::native", "{message}"),
        LOG_LEVEL_WARN => tracing::warn!(target: "llamakit::native", "{message}"),
        LOG_LEVEL_INFO => tracing::info!(target: "llamakit::native", "{message}"),
        LOG_LEVEL_DEBUG => tracing::debug!(target: "llamakit::native", "{message}"),
        _ => tracing::trace!(target: "llamakit::native", "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_loaded_is_idempotent() {
        let first = ensure_loaded();
        let second = ensure_loaded();
        // Same gate result, not a re-run.
        assert_eq!(first, second);
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_worker_init_reuses_gate() {
        let base = ensure_loaded();
        let worker = ensure_loaded_for_worker();
        assert!(std::ptr::eq(base, worker));
    }

    #[test]
    fn test_cpu_backend_pattern() {
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            assert!(is_cpu_backend_file("libggml-cpu.so"));
            assert!(is_cpu_backend_file("libggml-cpu-haswell.so"));
            assert!(!is_cpu_backend_file("libggml-cuda.so"));
            assert!(!is_cpu_backend_file("ggml-cpu.dll"));
        }
        #[cfg(target_os = "macos")]
        {
            assert!(is_cpu_backend_file("libggml-cpu.dylib"));
            assert!(!is_cpu_backend_file("libggml-metal.dylib"));
        }
    }
}
