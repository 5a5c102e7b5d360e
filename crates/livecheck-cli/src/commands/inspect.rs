//! Inspect command - print a model's tensor contract.

use anyhow::{Context, Result};
use clap::Args;
use livecheck_core::detector::MIN_COORDS;
use livecheck_core::runner::TensorLayout;
use livecheck_core::{DetectorConfig, FaceDetector, FaceModelRunner, InferenceBackend};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Args, Clone)]
pub struct InspectArgs {
    /// ONNX detection model
    pub model: PathBuf,
}

#[derive(Serialize, Debug, PartialEq)]
struct ModelContract {
    input_width: u32,
    input_height: u32,
    layout: &'static str,
    anchors: usize,
    coords_per_anchor: usize,
    /// Anchors the detector generates for this input size.
    expected_anchors: usize,
    compatible: bool,
}

pub fn run(args: &InspectArgs) -> Result<()> {
    let path = args.model.to_string_lossy();
    let runner = FaceModelRunner::load(&path).with_context(|| format!("loading model {path}"))?;
    let contract = describe(&runner);
    if !contract.compatible {
        tracing::warn!(
            anchors = contract.anchors,
            expected = contract.expected_anchors,
            "model anchor layout does not match the detector"
        );
    }
    println!("{}", serde_json::to_string_pretty(&contract)?);
    Ok(())
}

fn describe(runner: &FaceModelRunner) -> ModelContract {
    let shape = runner.input_shape();
    let expected_anchors = FaceDetector::new(DetectorConfig::default(), shape).anchor_count();
    ModelContract {
        input_width: shape.width,
        input_height: shape.height,
        layout: match shape.layout {
            TensorLayout::Nchw => "nchw",
            TensorLayout::Nhwc => "nhwc",
        },
        anchors: runner.anchor_count(),
        coords_per_anchor: runner.coords_per_anchor(),
        expected_anchors,
        compatible: runner.anchor_count() == expected_anchors
            && runner.coords_per_anchor() >= MIN_COORDS,
    }
}
