//! Verify-model command - check a model file against its pinned digest.

use anyhow::Result;
use clap::Args;
use livecheck_models::ModelAsset;
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::config::Config;

#[derive(Args, Clone)]
pub struct VerifyArgs {
    /// Model file; defaults to the configured detection model
    pub path: Option<PathBuf>,

    /// Expected SHA-256 hex digest; defaults to LIVECHECK_MODEL_SHA256
    #[arg(long)]
    pub sha256: Option<String>,
}

pub fn run(args: &VerifyArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    let asset = resolve(args, config);
    let report = asset.verify()?;
    println!(
        "{}",
        json!({
            "model": asset.name,
            "path": asset.path,
            "sha256": report.sha256,
            "pinned": report.pinned,
        })
    );
    Ok(())
}

fn resolve(args: &VerifyArgs, config: Config) -> ModelAsset {
    let path = args.path.clone().unwrap_or(config.model_path);
    let expected = args.sha256.clone().or(config.model_sha256);
    ModelAsset::new(path, expected)
}
