//! Resume-safe file download.
//!
//! Bytes land in a `.download` temp file that is renamed over the target on
//! success, so a crash never leaves a half-written model behind. Interrupted
//! transfers resume with an HTTP Range request from the temp file's length.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::AcquireError;

const CHUNK_SIZE: usize = 64 * 1024;

/// Download `url` to `dest`, reporting `(bytes_done, total)` progress.
/// A pre-existing target whose size matches the remote is returned as-is.
pub fn download_file(
    url: &str,
    dest: &Path,
    expected_size: Option<u64>,
    progress: &dyn Fn(u64, Option<u64>),
) -> Result<PathBuf, AcquireError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AcquireError::Download(format!("cannot create {}: {e}", parent.display())))?;
    }

    if let Ok(meta) = fs::metadata(dest) {
        if expected_size.is_none_or(|size| size == meta.len()) {
            info!(dest = %dest.display(), "target already present, skipping download");
            return Ok(dest.to_path_buf());
        }
    }

    let temp = temp_path(dest);
    let resume_offset = fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);

    let mut request = ureq::get(url).set("User-Agent", "llamakit/0.1");
    if resume_offset > 0 {
        request = request.set("Range", &format!("bytes={resume_offset}-"));
        debug!(resume_offset, "resuming download");
    }

    let resp = request
        .call()
        .map_err(|e| AcquireError::Download(format!("{url}: {e}")))?;

    // A 200 on a ranged request means the server restarted from zero.
    let resumed = resp.status() == 206;
    let offset = if resumed { resume_offset } else { 0 };
    let content_length: Option<u64> = resp
        .header("content-length")
        .and_then(|v| v.parse().ok());
    let total = content_length.map(|len| len + offset).or(expected_size);

    let mut file = open_temp(&temp, resumed)?;
    let mut reader = resp.into_reader();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut done = offset;

    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| AcquireError::Download(format!("read error at byte {done}: {e}")))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .map_err(|e| AcquireError::Download(format!("write error at byte {done}: {e}")))?;
        done += n as u64;
        progress(done, total);
    }
    drop(file);

    fs::rename(&temp, dest)
        .map_err(|e| AcquireError::Download(format!("cannot finalize {}: {e}", dest.display())))?;
    info!(dest = %dest.display(), bytes = done, "download complete");
    Ok(dest.to_path_buf())
}

fn temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    dest.with_file_name(format!("{name}.download"))
}

fn open_temp(temp: &Path, append: bool) -> Result<File, AcquireError> {
    let result = if append {
        OpenOptions::new().append(true).open(temp)
    } else {
        File::create(temp)
    };
    result.map_err(|e| AcquireError::Download(format!("cannot open {}: {e}", temp.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_suffix() {
        let temp = temp_path(Path::new("/out/model-q4_k_m.gguf"));
        assert_eq!(temp, Path::new("/out/model-q4_k_m.gguf.download"));
    }

    #[test]
    fn test_existing_target_with_matching_size_skips() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        fs::write(&dest, b"0123456789").unwrap();

        let path = download_file("http://unreachable.invalid/x", &dest, Some(10), &|_, _| {})
            .unwrap();
        assert_eq!(path, dest);
    }

    #[test]
    fn test_existing_target_unknown_size_skips() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        fs::write(&dest, b"abc").unwrap();

        let path = download_file("http://unreachable.invalid/x", &dest, None, &|_, _| {}).unwrap();
        assert_eq!(path, dest);
    }

    #[test]
    fn test_size_mismatch_attempts_download() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        fs::write(&dest, b"abc").unwrap();

        // Wrong size forces a real request, which fails against an
        // unreachable host.
        let err = download_file("http://unreachable.invalid/x", &dest, Some(10), &|_, _| {})
            .unwrap_err();
        assert!(matches!(err, AcquireError::Download(_)));
    }
}
