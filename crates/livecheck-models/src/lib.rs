//! Detection model asset and its integrity check.
//!
//! The analyzer loads whatever file it is pointed at, so the CLI verifies
//! the file against a pinned SHA-256 digest before handing it over.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the short-range front camera face detection model.
pub const DEFAULT_DETECTOR_MODEL: &str = "face_detection_front.onnx";

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: String, path: PathBuf },

    #[error("failed to read model file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("expected digest for {name} is not a SHA-256 hex string: {digest}")]
    MalformedDigest { name: String, digest: String },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: String,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// A model file on disk and, optionally, the digest it must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAsset {
    pub name: String,
    pub path: PathBuf,
    pub expected_sha256: Option<String>,
}

/// Result of [`ModelAsset::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub sha256: String,
    /// False when no expected digest was configured.
    pub pinned: bool,
}

impl ModelAsset {
    pub fn new(path: impl Into<PathBuf>, expected_sha256: Option<String>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            path,
            expected_sha256,
        }
    }

    /// The default detector model inside `model_dir`.
    pub fn detector_in(model_dir: &Path, expected_sha256: Option<String>) -> Self {
        Self::new(model_dir.join(DEFAULT_DETECTOR_MODEL), expected_sha256)
    }

    /// Hash the file and compare it with the expected digest, if any.
    pub fn verify(&self) -> Result<IntegrityReport, ModelIntegrityError> {
        if !self.path.is_file() {
            return Err(ModelIntegrityError::MissingModel {
                name: self.name.clone(),
                path: self.path.clone(),
            });
        }

        let expected = self
            .expected_sha256
            .as_deref()
            .map(|d| normalize_digest(&self.name, d))
            .transpose()?;

        let sha256 = sha256_file_hex(&self.path)?;
        match expected {
            Some(expected) if expected != sha256 => Err(ModelIntegrityError::ChecksumMismatch {
                name: self.name.clone(),
                path: self.path.clone(),
                expected,
                got: sha256,
            }),
            Some(_) => {
                tracing::info!(model = %self.name, sha256 = %sha256, "model checksum verified");
                Ok(IntegrityReport {
                    sha256,
                    pinned: true,
                })
            }
            None => {
                tracing::warn!(
                    model = %self.name,
                    sha256 = %sha256,
                    "no expected checksum configured, model not verified"
                );
                Ok(IntegrityReport {
                    sha256,
                    pinned: false,
                })
            }
        }
    }
}

/// Lowercase hex SHA-256 of a file's contents.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let read_err = |source| ModelIntegrityError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(read_err)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher).map_err(read_err)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn normalize_digest(name: &str, digest: &str) -> Result<String, ModelIntegrityError> {
    let digest = digest.trim().to_ascii_lowercase();
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ModelIntegrityError::MalformedDigest {
            name: name.to_string(),
            digest,
        });
    }
    Ok(digest)
}
