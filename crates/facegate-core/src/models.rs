//! ONNX model files: where they live and how to check them.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Model file descriptor: expected filename, source URL, SHA-256 checksum.
pub struct ModelFile {
    pub name: &'static str,
    pub url: &'static str,
    pub sha256: &'static str,
    pub size_display: &'static str,
}

pub const SCRFD_MODEL: &str = "det_10g.onnx";
pub const ARCFACE_MODEL: &str = "w600k_r50.onnx";

macro_rules! buffalo_l {
    ($file:literal) => {
        concat!(
            "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/",
            $file
        )
    };
}

// Checksums from the HuggingFace Git LFS pointer files (oid sha256: field).
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        name: SCRFD_MODEL,
        url: buffalo_l!("det_10g.onnx"),
        sha256: "5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91",
        size_display: "16 MB",
    },
    ModelFile {
        name: ARCFACE_MODEL,
        url: buffalo_l!("w600k_r50.onnx"),
        sha256: "4c06341c33c2ca1f86781dab0e829f88ad5b64be9fba56e56bc9ebdefc619e43",
        size_display: "166 MB",
    },
];

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path}), download from {url}")]
    MissingModel {
        name: &'static str,
        path: PathBuf,
        url: &'static str,
    },
    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: &'static str,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// `$XDG_DATA_HOME/facegate/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_home.join("facegate/models")
}

/// SHA-256 hex digest of a file, streamed.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let read_err = |source| ModelIntegrityError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::open(path).map_err(read_err)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(read_err)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Check that every model exists in `model_dir` with the expected checksum.
pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for model in MODELS {
        let path = model_dir.join(model.name);
        if !path.exists() {
            return Err(ModelIntegrityError::MissingModel {
                name: model.name,
                path,
                url: model.url,
            });
        }
        let got = sha256_file_hex(&path)?;
        if got != model.sha256 {
            return Err(ModelIntegrityError::ChecksumMismatch {
                name: model.name,
                path,
                expected: model.sha256.to_string(),
                got,
            });
        }
        tracing::debug!(name = model.name, "model checksum ok");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("facegate-models-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_sha256_known_digest() {
        let dir = scratch_dir("digest");
        let path = dir.join("abc.bin");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file_hex(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_verify_reports_missing_model() {
        let dir = scratch_dir("missing");
        let err = verify_models_dir(&dir).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { name: SCRFD_MODEL, .. }));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_verify_reports_checksum_mismatch() {
        let dir = scratch_dir("mismatch");
        fs::write(dir.join(SCRFD_MODEL), b"not a model").unwrap();
        let err = verify_models_dir(&dir).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { name: SCRFD_MODEL, .. }));
        fs::remove_dir_all(dir).ok();
    }
}
