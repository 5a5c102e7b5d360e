use anyhow::{bail, Context, Result};
use livecheck_core::geometry::{default_oval, OvalTolerance};
use livecheck_core::{ChallengeConfig, DetectorConfig};
use livecheck_models::DEFAULT_DETECTOR_MODEL;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Optional settings read from a TOML file. Environment variables win.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub model_dir: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub model_sha256: Option<String>,
    pub score_threshold: Option<f32>,
    pub suppression_threshold: Option<f32>,
    pub target_width: Option<f32>,
    pub target_height: Option<f32>,
    pub every_nth_frame: Option<u32>,
    pub hold_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub tolerance: Option<OvalTolerance>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Resolved CLI configuration.
#[derive(Debug)]
pub struct Config {
    /// Detection model file.
    pub model_path: PathBuf,
    /// Expected SHA-256 of the model. Unset means the digest is only reported.
    pub model_sha256: Option<String>,
    pub detector: DetectorConfig,
    pub challenge: ChallengeConfig,
    /// Run inference on one frame in this many.
    pub every_nth_frame: u32,
}

impl Config {
    /// Load the optional TOML file, then apply `LIVECHECK_*` overrides.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = match file {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::from_layers(file, |key| std::env::var(key).ok())
    }

    fn from_layers(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let model_dir = env("LIVECHECK_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(default_model_dir);
        let model_path = env("LIVECHECK_MODEL_PATH")
            .map(PathBuf::from)
            .or(file.model_path)
            .unwrap_or_else(|| model_dir.join(DEFAULT_DETECTOR_MODEL));
        let model_sha256 = env("LIVECHECK_MODEL_SHA256").or(file.model_sha256);

        let defaults = DetectorConfig::default();
        let detector = DetectorConfig {
            score_threshold: env_parse(&env, "LIVECHECK_SCORE_THRESHOLD")?
                .or(file.score_threshold)
                .unwrap_or(defaults.score_threshold),
            suppression_threshold: env_parse(&env, "LIVECHECK_SUPPRESSION_THRESHOLD")?
                .or(file.suppression_threshold)
                .unwrap_or(defaults.suppression_threshold),
            output_width: env_parse(&env, "LIVECHECK_TARGET_WIDTH")?
                .or(file.target_width)
                .unwrap_or(defaults.output_width),
            output_height: env_parse(&env, "LIVECHECK_TARGET_HEIGHT")?
                .or(file.target_height)
                .unwrap_or(defaults.output_height),
            ..defaults
        };

        let mut tolerance = file.tolerance.unwrap_or_default();
        if let Some(v) = env_parse(&env, "LIVECHECK_MATCH_THRESHOLD")? {
            tolerance.match_threshold = v;
        }
        let hold_ms = env_parse(&env, "LIVECHECK_HOLD_MS")?
            .or(file.hold_ms)
            .unwrap_or(1000);
        let timeout_secs = env_parse(&env, "LIVECHECK_TIMEOUT_SECS")?
            .or(file.timeout_secs)
            .unwrap_or(10);
        let challenge = ChallengeConfig {
            oval: default_oval(detector.output_width, detector.output_height),
            tolerance,
            hold_duration: Duration::from_millis(hold_ms),
            timeout: Duration::from_secs(timeout_secs),
        };

        let every_nth_frame = env_parse(&env, "LIVECHECK_EVERY_NTH_FRAME")?
            .or(file.every_nth_frame)
            .unwrap_or(1);

        let config = Self {
            model_path,
            model_sha256,
            detector,
            challenge,
            every_nth_frame,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if !(0.0..=1.0).contains(&d.score_threshold) {
            bail!("score threshold must be within [0, 1], got {}", d.score_threshold);
        }
        if !(0.0..=1.0).contains(&d.suppression_threshold) {
            bail!(
                "suppression threshold must be within [0, 1], got {}",
                d.suppression_threshold
            );
        }
        if d.output_width <= 0.0 || d.output_height <= 0.0 {
            bail!(
                "target size must be positive, got {}x{}",
                d.output_width,
                d.output_height
            );
        }
        if self.every_nth_frame == 0 {
            bail!("every_nth_frame must be at least 1");
        }
        let t = &self.challenge.tolerance;
        if !(0.0..=1.0).contains(&t.match_threshold) {
            bail!("match threshold must be within [0, 1], got {}", t.match_threshold);
        }
        if t.too_far_ratio >= t.too_close_ratio {
            bail!(
                "too_far_ratio ({}) must be below too_close_ratio ({})",
                t.too_far_ratio,
                t.too_close_ratio
            );
        }
        if self.challenge.timeout.is_zero() {
            bail!("timeout must be non-zero");
        }
        Ok(())
    }
}

fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("livecheck/models")
}

fn env_parse<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(key)
        .map(|v| {
            v.trim()
                .parse()
                .with_context(|| format!("invalid value for {key}: {v:?}"))
        })
        .transpose()
}
