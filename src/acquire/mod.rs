//! Model acquisition: deterministic resolution of a remote repository
//! reference into a locally usable GGUF artifact.
//!
//! The decision tree is pure and runs before any bytes move: a preferred
//! file must match exactly, GGUF repositories are filtered by quantization,
//! safetensors repositories go through conversion, and anything else is
//! unsupported. Planner errors surface synchronously; progress streams only
//! once work begins.

mod convert;
mod download;
mod hub;

use std::path::{Path, PathBuf};

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

use crate::error::Error;

pub use convert::ConvertConfig;
pub use hub::RepoFile;

/// Default quantization when the caller does not pick one.
pub const DEFAULT_QUANTIZATION: Quantization = Quantization::Q4KM;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("no file matching {requested:?} in repository; available GGUF files: {}", available.join(", "))]
    NotFound {
        requested: String,
        available: Vec<String>,
    },

    #[error("quantization {quant} matches multiple files: {}", matches.join(", "))]
    Ambiguous {
        quant: String,
        matches: Vec<String>,
    },

    #[error("repository holds only safetensors; pick a quantization to convert to")]
    ConversionRequired,

    #[error("repository contains neither GGUF nor safetensors files")]
    Unsupported,

    #[error("repository listing failed: {0}")]
    Listing(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("conversion failed: {0}")]
    Conversion(String),
}

/// Quantization targets with their canonical and CLI spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quantization {
    F32,
    F16,
    BF16,
    Q8_0,
    Q6K,
    Q5KM,
    Q5KS,
    Q4KM,
    Q4KS,
    Q3KL,
    Q3KM,
    Q3KS,
    Q2K,
    IQ4XS,
    IQ4NL,
    IQ3M,
    IQ3S,
    IQ3XXS,
    IQ2M,
    IQ2S,
    IQ2XXS,
}

impl Quantization {
    /// Canonical label as it appears in filenames and the quantizer CLI.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            Quantization::F32 => "F32",
            Quantization::F16 => "F16",
            Quantization::BF16 => "BF16",
            Quantization::Q8_0 => "Q8_0",
            Quantization::Q6K => "Q6_K",
            Quantization::Q5KM => "Q5_K_M",
            Quantization::Q5KS => "Q5_K_S",
            Quantization::Q4KM => "Q4_K_M",
            Quantization::Q4KS => "Q4_K_S",
            Quantization::Q3KL => "Q3_K_L",
            Quantization::Q3KM => "Q3_K_M",
            Quantization::Q3KS => "Q3_K_S",
            Quantization::Q2K => "Q2_K",
            Quantization::IQ4XS => "IQ4_XS",
            Quantization::IQ4NL => "IQ4_NL",
            Quantization::IQ3M => "IQ3_M",
            Quantization::IQ3S => "IQ3_S",
            Quantization::IQ3XXS => "IQ3_XXS",
            Quantization::IQ2M => "IQ2_M",
            Quantization::IQ2S => "IQ2_S",
            Quantization::IQ2XXS => "IQ2_XXS",
        }
    }

    /// Lowercase spelling used in output filenames.
    pub fn cli_name(&self) -> String {
        self.canonical_name().to_lowercase()
    }

    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_uppercase();
        [
            Quantization::F32,
            Quantization::F16,
            Quantization::BF16,
            Quantization::Q8_0,
            Quantization::Q6K,
            Quantization::Q5KM,
            Quantization::Q5KS,
            Quantization::Q4KM,
            Quantization::Q4KS,
            Quantization::Q3KL,
            Quantization::Q3KM,
            Quantization::Q3KS,
            Quantization::Q2K,
            Quantization::IQ4XS,
            Quantization::IQ4NL,
            Quantization::IQ3M,
            Quantization::IQ3S,
            Quantization::IQ3XXS,
            Quantization::IQ2M,
            Quantization::IQ2S,
            Quantization::IQ2XXS,
        ]
        .into_iter()
        .find(|q| q.canonical_name() == normalized)
    }
}

/// Stage of an acquisition, streamed to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionStage {
    Checking,
    Downloading,
    Converting,
    Quantizing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionStatus {
    pub stage: AcquisitionStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AcquisitionStatus {
    pub(crate) fn stage(stage: AcquisitionStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            progress: None,
            message: Some(message.into()),
            model_path: None,
            error: None,
        }
    }

    pub(crate) fn progress(stage: AcquisitionStage, progress: f32) -> Self {
        Self {
            stage,
            progress: Some(progress.clamp(0.0, 1.0)),
            message: None,
            model_path: None,
            error: None,
        }
    }

    pub(crate) fn complete(path: PathBuf) -> Self {
        Self {
            stage: AcquisitionStage::Complete,
            progress: Some(1.0),
            message: None,
            model_path: Some(path),
            error: None,
        }
    }

    pub(crate) fn failed(error: impl Into<String>) -> Self {
        Self {
            stage: AcquisitionStage::Failed,
            progress: None,
            message: None,
            model_path: None,
            error: Some(error.into()),
        }
    }
}

/// What the planner decided to do.
#[derive(Debug, Clone, PartialEq)]
enum AcquisitionPlan {
    Download(RepoFile),
    Convert(Quantization),
}

/// Pure decision tree over a repository listing.
fn plan(
    files: &[RepoFile],
    quantization: Option<Quantization>,
    preferred_file: Option<&str>,
) -> Result<AcquisitionPlan, AcquireError> {
    let gguf_files: Vec<&RepoFile> = files
        .iter()
        .filter(|f| f.path.to_lowercase().ends_with(".gguf"))
        .collect();
    let gguf_names = || gguf_files.iter().map(|f| f.path.clone()).collect::<Vec<_>>();

    if let Some(preferred) = preferred_file {
        return match gguf_files.iter().find(|f| f.path == preferred) {
            Some(file) => Ok(AcquisitionPlan::Download((*file).clone())),
            None => Err(AcquireError::NotFound {
                requested: preferred.to_string(),
                available: gguf_names(),
            }),
        };
    }

    if !gguf_files.is_empty() {
        let quant = quantization.unwrap_or(DEFAULT_QUANTIZATION);
        let pattern = RegexBuilder::new(&regex::escape(quant.canonical_name()))
            .case_insensitive(true)
            .build()
            .expect("escaped quantization name is a valid pattern");

        let matches: Vec<&&RepoFile> = gguf_files
            .iter()
            .filter(|f| pattern.is_match(&f.path))
            .collect();
        return match matches.as_slice() {
            [] => Err(AcquireError::NotFound {
                requested: quant.canonical_name().to_string(),
                available: gguf_files
                    .iter()
                    .map(|f| match f.size {
                        Some(size) => format!("{} ({} bytes)", f.path, size),
                        None => f.path.clone(),
                    })
                    .collect(),
            }),
            [file] => Ok(AcquisitionPlan::Download((**file).clone())),
            many => Err(AcquireError::Ambiguous {
                quant: quant.canonical_name().to_string(),
                matches: many.iter().map(|f| f.path.clone()).collect(),
            }),
        };
    }

    let has_safetensors = files
        .iter()
        .any(|f| f.path.to_lowercase().ends_with(".safetensors"));
    if has_safetensors {
        return match quantization {
            Some(quant) => Ok(AcquisitionPlan::Convert(quant)),
            None => Err(AcquireError::ConversionRequired),
        };
    }

    Err(AcquireError::Unsupported)
}

/// Resolves repository references into local model files.
#[derive(Debug, Clone)]
pub struct ModelFetcher {
    /// Hub base URL; swap for a mirror or a test server.
    pub base_url: String,
    pub convert: ConvertConfig,
}

impl Default for ModelFetcher {
    fn default() -> Self {
        Self {
            base_url: "https://huggingface.co".to_string(),
            convert: ConvertConfig::default(),
        }
    }
}

impl ModelFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `repo_id` into a local file under `output_dir`, streaming
    /// status updates. Planner errors (not-found, ambiguous,
    /// conversion-required, unsupported) return synchronously before any
    /// download begins.
    pub async fn get_model(
        &self,
        repo_id: &str,
        output_dir: &Path,
        quantization: Option<Quantization>,
        preferred_file: Option<String>,
    ) -> Result<UnboundedReceiverStream<AcquisitionStatus>, Error> {
        if repo_id.is_empty() {
            return Err(Error::Validation("repo id must not be empty".into()));
        }

        let base_url = self.base_url.clone();
        let repo = repo_id.to_string();
        let files = tokio::task::spawn_blocking(move || hub::list_repo_files(&base_url, &repo))
            .await
            .map_err(|e| AcquireError::Listing(format!("listing task failed: {e}")))??;

        let planned = plan(&files, quantization, preferred_file.as_deref())?;
        info!(repo_id, ?planned, "acquisition planned");

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(AcquisitionStatus::stage(
            AcquisitionStage::Checking,
            format!("resolved {} repository files", files.len()),
        ));

        let base_url = self.base_url.clone();
        let convert_cfg = self.convert.clone();
        let repo = repo_id.to_string();
        let output_dir = output_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            execute_plan(&base_url, &convert_cfg, &repo, &files, &output_dir, planned, &tx);
        });

        Ok(UnboundedReceiverStream::new(rx))
    }
}

fn execute_plan(
    base_url: &str,
    convert_cfg: &ConvertConfig,
    repo_id: &str,
    files: &[RepoFile],
    output_dir: &Path,
    planned: AcquisitionPlan,
    tx: &mpsc::UnboundedSender<AcquisitionStatus>,
) {
    let emit = |status: AcquisitionStatus| {
        let _ = tx.send(status);
    };

    let result = match planned {
        AcquisitionPlan::Download(file) => {
            emit(AcquisitionStatus::stage(
                AcquisitionStage::Downloading,
                format!("downloading {}", file.path),
            ));
            let url = hub::file_url(base_url, repo_id, &file.path);
            let dest = output_dir.join(
                Path::new(&file.path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.path.clone()),
            );
            download::download_file(&url, &dest, file.size, &|done, total| {
                if let Some(total) = total.filter(|&t| t > 0) {
                    emit(AcquisitionStatus::progress(
                        AcquisitionStage::Downloading,
                        done as f32 / total as f32,
                    ));
                }
            })
        }
        AcquisitionPlan::Convert(quant) => {
            convert::run_conversion(convert_cfg, base_url, repo_id, files, output_dir, quant, &emit)
        }
    };

    match result {
        Ok(path) => emit(AcquisitionStatus::complete(path)),
        Err(e) => emit(AcquisitionStatus::failed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64) -> RepoFile {
        RepoFile {
            path: path.to_string(),
            size: Some(size),
        }
    }

    #[test]
    fn test_quantization_names() {
        assert_eq!(Quantization::Q4KM.canonical_name(), "Q4_K_M");
        assert_eq!(Quantization::Q4KM.cli_name(), "q4_k_m");
        assert_eq!(Quantization::parse("q4_k_m"), Some(Quantization::Q4KM));
        assert_eq!(Quantization::parse("Q8_0"), Some(Quantization::Q8_0));
        assert_eq!(Quantization::parse("nonsense"), None);
    }

    #[test]
    fn test_plan_preferred_file_exact_match() {
        let files = vec![file("model-q4_k_m.gguf", 100), file("model-q8_0.gguf", 200)];
        let planned = plan(&files, None, Some("model-q8_0.gguf")).unwrap();
        assert_eq!(planned, AcquisitionPlan::Download(files[1].clone()));
    }

    #[test]
    fn test_plan_preferred_file_missing_lists_available() {
        let files = vec![file("model-q4_k_m.gguf", 100)];
        let err = plan(&files, None, Some("other.gguf")).unwrap_err();
        match err {
            AcquireError::NotFound { requested, available } => {
                assert_eq!(requested, "other.gguf");
                assert_eq!(available, vec!["model-q4_k_m.gguf"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_plan_single_quant_match_downloads() {
        let files = vec![
            file("model-Q4_K_M.gguf", 100),
            file("model-q8_0.gguf", 200),
            file("README.md", 1),
        ];
        let planned = plan(&files, Some(Quantization::Q4KM), None).unwrap();
        assert_eq!(planned, AcquisitionPlan::Download(files[0].clone()));
    }

    #[test]
    fn test_plan_default_quantization_is_q4_k_m() {
        let files = vec![file("model-q4_k_m.gguf", 100), file("model-q6_k.gguf", 1)];
        let planned = plan(&files, None, None).unwrap();
        assert_eq!(planned, AcquisitionPlan::Download(files[0].clone()));
    }

    #[test]
    fn test_plan_ambiguous_lists_matches() {
        // Two files carry the same quantization marker.
        let files = vec![
            file("model-q4_k_m.gguf", 100),
            file("model-alt-q4_k_m.gguf", 100),
        ];
        let err = plan(&files, Some(Quantization::Q4KM), None).unwrap_err();
        match err {
            AcquireError::Ambiguous { quant, matches } => {
                assert_eq!(quant, "Q4_K_M");
                assert_eq!(
                    matches,
                    vec!["model-q4_k_m.gguf", "model-alt-q4_k_m.gguf"]
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_plan_no_quant_match_lists_files_with_sizes() {
        let files = vec![file("model-q8_0.gguf", 4096)];
        let err = plan(&files, Some(Quantization::Q4KM), None).unwrap_err();
        match err {
            AcquireError::NotFound { available, .. } => {
                assert_eq!(available, vec!["model-q8_0.gguf (4096 bytes)"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_plan_safetensors_requires_quantization() {
        let files = vec![file("model-00001-of-00002.safetensors", 100), file("config.json", 1)];
        assert!(matches!(
            plan(&files, None, None),
            Err(AcquireError::ConversionRequired)
        ));
        assert_eq!(
            plan(&files, Some(Quantization::Q4KM), None).unwrap(),
            AcquisitionPlan::Convert(Quantization::Q4KM)
        );
    }

    #[test]
    fn test_plan_unsupported_repo() {
        let files = vec![file("weights.bin", 100), file("README.md", 1)];
        assert!(matches!(plan(&files, None, None), Err(AcquireError::Unsupported)));
    }
}
