//! Safetensors → GGUF conversion pipeline.
//!
//! A fixed sequence: verify the external tooling, download the model
//! sources, convert to an F16 intermediate, quantize to the final artifact,
//! delete the intermediate. The state machine is specified here; which
//! converter and quantizer binaries run is a deployment concern carried in
//! `ConvertConfig`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use super::download::download_file;
use super::hub::{file_url, RepoFile};
use super::{AcquireError, AcquisitionStage, AcquisitionStatus, Quantization};

/// External tooling for conversion and quantization.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    pub python: PathBuf,
    pub convert_script: PathBuf,
    pub quantize_bin: PathBuf,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            convert_script: PathBuf::from("convert_hf_to_gguf.py"),
            quantize_bin: PathBuf::from("llama-quantize"),
        }
    }
}

/// File extensions worth fetching for a conversion run.
const SOURCE_SUFFIXES: &[&str] = &[".safetensors", ".json", ".model", ".txt"];

pub fn run_conversion(
    cfg: &ConvertConfig,
    base_url: &str,
    repo_id: &str,
    files: &[RepoFile],
    output_dir: &Path,
    quant: Quantization,
    emit: &dyn Fn(AcquisitionStatus),
) -> Result<PathBuf, AcquireError> {
    check_tooling(cfg)?;

    let repo_name = repo_last_segment(repo_id);
    let sources_dir = output_dir.join(format!("{repo_name}-src"));
    let intermediate = output_dir.join(format!("{repo_name}-f16.gguf"));
    let final_path = output_dir.join(format!("{repo_name}-{}.gguf", quant.cli_name()));

    fs::create_dir_all(&sources_dir)
        .map_err(|e| AcquireError::Conversion(format!("cannot create sources dir: {e}")))?;

    // Download every conversion input the repository holds.
    let sources: Vec<&RepoFile> = files.iter().filter(|f| is_source_file(&f.path)).collect();
    if sources.is_empty() {
        return Err(AcquireError::Conversion(
            "repository lists no conversion sources".into(),
        ));
    }
    for (i, file) in sources.iter().enumerate() {
        emit(AcquisitionStatus::stage(
            AcquisitionStage::Downloading,
            format!("fetching source {} ({}/{})", file.path, i + 1, sources.len()),
        ));
        let name = Path::new(&file.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.path.clone());
        let url = file_url(base_url, repo_id, &file.path);
        let fraction_done = i as f32 / sources.len() as f32;
        let per_file = 1.0 / sources.len() as f32;
        download_file(&url, &sources_dir.join(name), file.size, &|done, total| {
            if let Some(total) = total.filter(|&t| t > 0) {
                emit(AcquisitionStatus::progress(
                    AcquisitionStage::Downloading,
                    fraction_done + per_file * (done as f32 / total as f32),
                ));
            }
        })?;
    }

    // Convert to the F16 intermediate.
    emit(AcquisitionStatus::stage(
        AcquisitionStage::Converting,
        format!("converting {repo_name} to F16"),
    ));
    run_step(
        Command::new(&cfg.python)
            .arg(&cfg.convert_script)
            .arg(&sources_dir)
            .arg("--outtype")
            .arg("f16")
            .arg("--outfile")
            .arg(&intermediate),
        "conversion",
    )?;

    // Quantize to the requested target.
    emit(AcquisitionStatus::stage(
        AcquisitionStage::Quantizing,
        format!("quantizing to {}", quant.canonical_name()),
    ));
    run_step(
        Command::new(&cfg.quantize_bin)
            .arg(&intermediate)
            .arg(&final_path)
            .arg(quant.canonical_name()),
        "quantization",
    )?;

    // The intermediate is twice the final size; drop it eagerly.
    if let Err(e) = fs::remove_file(&intermediate) {
        debug!(path = %intermediate.display(), "intermediate cleanup failed: {e}");
    }

    info!(path = %final_path.display(), "conversion complete");
    Ok(final_path)
}

fn check_tooling(cfg: &ConvertConfig) -> Result<(), AcquireError> {
    let probe = Command::new(&cfg.python).arg("--version").output();
    if probe.is_err() {
        return Err(AcquireError::Conversion(format!(
            "python interpreter not runnable: {}",
            cfg.python.display()
        )));
    }
    if !cfg.convert_script.exists() {
        return Err(AcquireError::Conversion(format!(
            "conversion script not found: {}",
            cfg.convert_script.display()
        )));
    }
    // The quantizer prints usage and may exit non-zero; only spawn failure
    // means it is missing.
    if Command::new(&cfg.quantize_bin).arg("--help").output().is_err() {
        return Err(AcquireError::Conversion(format!(
            "quantizer not runnable: {}",
            cfg.quantize_bin.display()
        )));
    }
    Ok(())
}

fn run_step(command: &mut Command, phase: &str) -> Result<(), AcquireError> {
    debug!(?command, phase, "running external tool");
    let output = command
        .output()
        .map_err(|e| AcquireError::Conversion(format!("{phase} failed to start: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(AcquireError::Conversion(format!(
            "{phase} exited with {}: {tail}",
            output.status
        )));
    }
    Ok(())
}

fn is_source_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    SOURCE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

fn repo_last_segment(repo_id: &str) -> String {
    repo_id
        .rsplit('/')
        .next()
        .unwrap_or(repo_id)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_last_segment() {
        assert_eq!(repo_last_segment("org/repo"), "repo");
        assert_eq!(repo_last_segment("solo"), "solo");
    }

    #[test]
    fn test_source_file_filter() {
        assert!(is_source_file("model-00001-of-00002.safetensors"));
        assert!(is_source_file("config.json"));
        assert!(is_source_file("tokenizer.model"));
        assert!(!is_source_file("weights.bin"));
        assert!(!is_source_file("demo.png"));
    }

    #[test]
    fn test_final_filename_shape() {
        let name = format!(
            "{}-{}.gguf",
            repo_last_segment("org/tiny-llama"),
            Quantization::Q4KM.cli_name()
        );
        assert_eq!(name, "tiny-llama-q4_k_m.gguf");
    }

    #[test]
    fn test_missing_script_fails_tooling_check() {
        let cfg = ConvertConfig {
            python: PathBuf::from("true"),
            convert_script: PathBuf::from("/nonexistent/convert.py"),
            quantize_bin: PathBuf::from("true"),
        };
        let err = check_tooling(&cfg).unwrap_err();
        assert!(matches!(err, AcquireError::Conversion(_)));
    }
}
