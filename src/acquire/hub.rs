//! Hugging Face repository listing.
//!
//! Blocking `ureq` calls; run them from a blocking task.

use serde::Deserialize;
use tracing::debug;

use super::AcquireError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    /// Path inside the repository.
    pub path: String,
    pub size: Option<u64>,
}

#[derive(Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    entry_type: String,
    path: String,
    #[serde(default)]
    size: Option<u64>,
}

/// List the files of a model repository via the tree API.
pub fn list_repo_files(base_url: &str, repo_id: &str) -> Result<Vec<RepoFile>, AcquireError> {
    let url = format!("{base_url}/api/models/{repo_id}/tree/main?recursive=true");
    debug!(url, "listing repository");

    let resp = ureq::get(&url)
        .set("User-Agent", "llamakit/0.1")
        .call()
        .map_err(|e| AcquireError::Listing(format!("{repo_id}: {e}")))?;
    let body = resp
        .into_string()
        .map_err(|e| AcquireError::Listing(format!("{repo_id}: read failed: {e}")))?;

    let entries: Vec<TreeEntry> = serde_json::from_str(&body)
        .map_err(|e| AcquireError::Listing(format!("{repo_id}: unexpected payload: {e}")))?;

    Ok(entries
        .into_iter()
        .filter(|e| e.entry_type == "file")
        .map(|e| RepoFile {
            path: e.path,
            size: e.size,
        })
        .collect())
}

/// Resolve a repository file to its download URL.
pub fn file_url(base_url: &str, repo_id: &str, path: &str) -> String {
    format!(
        "{base_url}/{repo_id}/resolve/main/{}",
        urlencoding::encode(path)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_url_encodes_path() {
        let url = file_url("https://huggingface.co", "org/repo", "model q4.gguf");
        assert_eq!(
            url,
            "https://huggingface.co/org/repo/resolve/main/model%20q4.gguf"
        );
    }

    #[test]
    fn test_tree_entry_parsing() {
        let body = r#"[
            {"type": "file", "path": "model-q4_k_m.gguf", "size": 12345},
            {"type": "directory", "path": "assets"},
            {"type": "file", "path": "README.md"}
        ]"#;
        let entries: Vec<TreeEntry> = serde_json::from_str(body).unwrap();
        let files: Vec<RepoFile> = entries
            .into_iter()
            .filter(|e| e.entry_type == "file")
            .map(|e| RepoFile { path: e.path, size: e.size })
            .collect();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].size, Some(12345));
        assert_eq!(files[1].size, None);
    }
}
