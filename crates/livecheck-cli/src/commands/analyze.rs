//! Analyze command - replay still images as one capture session.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use livecheck_core::frame::RawFrame;
use livecheck_core::{
    ChallengeDriver, FaceModelRunner, FrameAnalyzer, FrameOutcome, Instruction,
    LivenessCheckState, LivenessState,
};
use livecheck_models::ModelAsset;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

#[derive(Args, Clone)]
pub struct AnalyzeArgs {
    /// Image files or directories, replayed in order as frames
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Clockwise rotation that makes the images upright
    #[arg(long, default_value_t = 0, value_parser = parse_rotation)]
    pub rotation: u32,

    /// Simulated time between frames
    #[arg(long, default_value_t = 100)]
    pub frame_interval_ms: u64,

    /// Keep replaying after the challenge reaches a terminal state
    #[arg(long)]
    pub keep_going: bool,
}

fn parse_rotation(s: &str) -> Result<u32, String> {
    let value: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    match value {
        0 | 90 | 180 | 270 => Ok(value),
        _ => Err(format!("{value} is not one of 0, 90, 180, 270")),
    }
}

/// One JSON line per replayed frame.
#[derive(Serialize)]
struct FrameRecord<'a> {
    session_id: &'a str,
    frame: usize,
    input: &'a Path,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    outcome: FrameOutcome,
    face_count: Option<usize>,
    state: &'a LivenessCheckState,
    instruction: Option<Instruction>,
    instruction_text: Option<String>,
}

pub fn run(args: &AnalyzeArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    let frames = collect_inputs(&args.inputs)?;
    if frames.is_empty() {
        anyhow::bail!("no images found in the given inputs");
    }

    ModelAsset::new(&config.model_path, config.model_sha256.clone())
        .verify()
        .context("detection model failed verification")?;
    let model_path = config.model_path.to_string_lossy();
    let runner = FaceModelRunner::load(&model_path)
        .with_context(|| format!("loading detection model {model_path}"))?;

    let session_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        session = %session_id,
        frames = frames.len(),
        rotation = args.rotation,
        "starting replay"
    );

    let liveness = Arc::new(LivenessState::with_cadence(config.every_nth_frame));
    let mut analyzer = FrameAnalyzer::new(
        runner,
        config.detector.clone(),
        Arc::clone(&liveness),
        &session_id,
    );
    let started = Instant::now();
    let mut driver = ChallengeDriver::new(config.challenge.clone(), started);
    let interval = Duration::from_millis(args.frame_interval_ms);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for (index, path) in frames.iter().enumerate() {
        let outcome = match load_frame(path, args.rotation) {
            Ok(frame) => analyzer.analyze(frame),
            Err(e) => {
                tracing::warn!(input = %path.display(), error = %format!("{e:#}"), "skipping unreadable image");
                FrameOutcome::Discarded
            }
        };

        let now = frame_time(started, interval, index)?;
        let state = driver.drive(&liveness, now);
        let instruction = state.instruction();
        let record = FrameRecord {
            session_id: &session_id,
            frame: index + 1,
            input: path,
            timestamp: Utc::now(),
            outcome,
            face_count: liveness.snapshot().face_count,
            state,
            instruction,
            instruction_text: instruction.map(|i| i.to_string()),
        };
        serde_json::to_writer(&mut out, &record)?;
        writeln!(out)?;

        if state.is_terminal() && !args.keep_going {
            tracing::info!(frame = index + 1, "challenge finished, stopping replay");
            break;
        }
    }
    out.flush()?;
    Ok(())
}

/// Simulated capture time of the frame at `index`, one interval after the previous.
fn frame_time(started: Instant, interval: Duration, index: usize) -> Result<Instant> {
    index
        .checked_add(1)
        .and_then(|n| u32::try_from(n).ok())
        .and_then(|n| interval.checked_mul(n))
        .and_then(|offset| started.checked_add(offset))
        .with_context(|| {
            format!(
                "frame index {index} at {}ms intervals is past the simulated clock's range",
                interval.as_millis()
            )
        })
}

fn load_frame(path: &Path, rotation: u32) -> Result<RawFrame> {
    let image = image::open(path)
        .with_context(|| format!("decoding {}", path.display()))?
        .to_rgba8();
    Ok(RawFrame::from_image(image, rotation))
}

/// Expand directories into their images, sorted by name. Files are kept as given.
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(input)
                .with_context(|| format!("listing {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image(p))
                .collect();
            entries.sort();
            frames.extend(entries);
        } else {
            frames.push(input.clone());
        }
    }
    Ok(frames)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
