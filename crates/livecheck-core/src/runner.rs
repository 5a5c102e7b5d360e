//! Face detection model runner via ONNX Runtime.
//!
//! Owns the loaded detection model, turns the analyzer's RGBA buffer into
//! the model's input tensor and returns the raw per-anchor outputs. The
//! tensor contract (input size and layout, anchor count, coordinates per
//! anchor) is read from the model at load time.

use crate::frame::FrameError;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::{TensorRef, ValueType};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unsupported model input: {0}")]
    UnsupportedInput(String),
    #[error("unsupported model outputs: {0}")]
    UnsupportedOutput(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Memory layout of the model's image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// `[1, 3, H, W]`
    Nchw,
    /// `[1, H, W, 3]`
    Nhwc,
}

/// Spatial size and layout of the model's image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    pub width: u32,
    pub height: u32,
    pub layout: TensorLayout,
}

impl InputShape {
    /// Interpret a 4-d input shape, locating the channel axis.
    pub fn from_dims(dims: &[i64]) -> Result<Self, RunnerError> {
        let [_, d1, d2, d3] = dims else {
            return Err(RunnerError::UnsupportedInput(format!(
                "expected 4 dimensions, got {dims:?}"
            )));
        };

        let (height, width, layout) = match (*d1, *d3) {
            (3, _) => (*d2, *d3, TensorLayout::Nchw),
            (_, 3) => (*d1, *d2, TensorLayout::Nhwc),
            _ => {
                return Err(RunnerError::UnsupportedInput(format!(
                    "no 3-channel axis in {dims:?}"
                )))
            }
        };

        if height <= 0 || width <= 0 {
            return Err(RunnerError::UnsupportedInput(format!(
                "dynamic or empty spatial size in {dims:?}"
            )));
        }

        Ok(Self {
            width: width as u32,
            height: height as u32,
            layout,
        })
    }
}

/// Raw model output: one box row and one score per anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionTensorSet {
    /// `anchor_count * coords_per_anchor` regressor values, anchor-major.
    pub boxes: Vec<f32>,
    /// One logit per anchor.
    pub scores: Vec<f32>,
    pub coords_per_anchor: usize,
}

impl DetectionTensorSet {
    pub fn anchor_count(&self) -> usize {
        self.scores.len()
    }

    pub fn anchor_box(&self, index: usize) -> &[f32] {
        let start = index * self.coords_per_anchor;
        &self.boxes[start..start + self.coords_per_anchor]
    }
}

/// The seam between frame analysis and whatever executes the model.
pub trait InferenceBackend {
    fn input_shape(&self) -> InputShape;

    /// Execute the model on exactly one preprocessed image tensor.
    fn run(&mut self, input: &Array4<f32>) -> Result<DetectionTensorSet, RunnerError>;
}

/// Resize, rotate and normalise an RGBA buffer into the model's input tensor.
///
/// Built once per model input shape. The rotation is per frame since the
/// device can turn mid-session.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    shape: InputShape,
}

impl Preprocessor {
    pub fn new(shape: InputShape) -> Self {
        Self { shape }
    }

    pub fn shape(&self) -> InputShape {
        self.shape
    }

    /// Produce a `[1, 3, H, W]` or `[1, H, W, 3]` tensor with values in `[0, 1]`.
    ///
    /// `rotation_degrees` is the clockwise rotation that makes the sensor
    /// image upright; the output is always upright.
    pub fn process(&self, image: &RgbaImage, rotation_degrees: u32) -> Result<Array4<f32>, FrameError> {
        let quarter_turns = match rotation_degrees % 360 {
            0 => 0,
            90 => 1,
            180 => 2,
            270 => 3,
            _ => return Err(FrameError::UnsupportedRotation(rotation_degrees)),
        };

        // Resize to the pre-rotation size so a quarter turn lands on the
        // model's width and height.
        let (resize_w, resize_h) = if quarter_turns % 2 == 1 {
            (self.shape.height, self.shape.width)
        } else {
            (self.shape.width, self.shape.height)
        };
        let resized = imageops::resize(image, resize_w, resize_h, FilterType::Nearest);

        let upright = match quarter_turns {
            1 => imageops::rotate90(&resized),
            2 => imageops::rotate180(&resized),
            3 => imageops::rotate270(&resized),
            _ => resized,
        };

        let (w, h) = (self.shape.width as usize, self.shape.height as usize);
        let mut tensor = match self.shape.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
        };

        for (x, y, pixel) in upright.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let value = f32::from(pixel[c]) / 255.0;
                match self.shape.layout {
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                }
            }
        }

        Ok(tensor)
    }
}

/// ONNX Runtime backed detection model.
pub struct FaceModelRunner {
    session: Session,
    input_shape: InputShape,
    boxes_output: usize,
    scores_output: usize,
    anchor_count: usize,
    coords_per_anchor: usize,
}

impl FaceModelRunner {
    /// Load the detection model. Failure here is fatal for the analyzer.
    pub fn load(model_path: &str) -> Result<Self, RunnerError> {
        if !Path::new(model_path).exists() {
            return Err(RunnerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let input = session
            .inputs()
            .first()
            .ok_or_else(|| RunnerError::UnsupportedInput("model declares no inputs".into()))?;
        let input_dims = tensor_dims(input.dtype())
            .ok_or_else(|| RunnerError::UnsupportedInput("input is not a tensor".into()))?;
        let input_shape = InputShape::from_dims(&input_dims)?;

        let output_dims: Vec<Vec<i64>> = session
            .outputs()
            .iter()
            .map(|o| tensor_dims(o.dtype()).unwrap_or_default())
            .collect();
        let contract = OutputContract::from_dims(&output_dims)?;

        tracing::info!(
            path = model_path,
            width = input_shape.width,
            height = input_shape.height,
            layout = ?input_shape.layout,
            anchors = contract.anchor_count,
            coords = contract.coords_per_anchor,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face detection model"
        );

        Ok(Self {
            session,
            input_shape,
            boxes_output: contract.boxes_output,
            scores_output: contract.scores_output,
            anchor_count: contract.anchor_count,
            coords_per_anchor: contract.coords_per_anchor,
        })
    }

    pub fn anchor_count(&self) -> usize {
        self.anchor_count
    }

    pub fn coords_per_anchor(&self) -> usize {
        self.coords_per_anchor
    }
}

impl InferenceBackend for FaceModelRunner {
    fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    fn run(&mut self, input: &Array4<f32>) -> Result<DetectionTensorSet, RunnerError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, boxes) = outputs[self.boxes_output]
            .try_extract_tensor::<f32>()
            .map_err(|e| RunnerError::InferenceFailed(format!("box extraction: {e}")))?;
        let (_, scores) = outputs[self.scores_output]
            .try_extract_tensor::<f32>()
            .map_err(|e| RunnerError::InferenceFailed(format!("score extraction: {e}")))?;

        if scores.len() != self.anchor_count
            || boxes.len() != self.anchor_count * self.coords_per_anchor
        {
            return Err(RunnerError::InferenceFailed(format!(
                "expected {} anchors x {} coords, got {} scores and {} box values",
                self.anchor_count,
                self.coords_per_anchor,
                scores.len(),
                boxes.len()
            )));
        }

        Ok(DetectionTensorSet {
            boxes: boxes.to_vec(),
            scores: scores.to_vec(),
            coords_per_anchor: self.coords_per_anchor,
        })
    }
}

fn tensor_dims(value_type: &ValueType) -> Option<Vec<i64>> {
    match value_type {
        ValueType::Tensor { shape, .. } => Some(shape.iter().copied().collect()),
        _ => None,
    }
}

/// Which model outputs carry boxes and scores, and their sizes.
#[derive(Debug, PartialEq, Eq)]
struct OutputContract {
    boxes_output: usize,
    scores_output: usize,
    anchor_count: usize,
    coords_per_anchor: usize,
}

impl OutputContract {
    /// Scores are the output whose last dimension is 1; boxes the one whose
    /// last dimension holds at least a centre and a size.
    fn from_dims(outputs: &[Vec<i64>]) -> Result<Self, RunnerError> {
        let last = |dims: &Vec<i64>| dims.last().copied().unwrap_or(0);

        let scores_output = outputs
            .iter()
            .position(|d| d.len() >= 2 && last(d) == 1)
            .ok_or_else(|| RunnerError::UnsupportedOutput(format!("no score tensor in {outputs:?}")))?;
        let boxes_output = outputs
            .iter()
            .position(|d| d.len() >= 2 && last(d) >= 4)
            .ok_or_else(|| RunnerError::UnsupportedOutput(format!("no box tensor in {outputs:?}")))?;

        let anchors_of = |dims: &Vec<i64>| dims[dims.len() - 2];
        let anchor_count = anchors_of(&outputs[scores_output]);
        if anchor_count <= 0 || anchors_of(&outputs[boxes_output]) != anchor_count {
            return Err(RunnerError::UnsupportedOutput(format!(
                "anchor counts disagree or are dynamic: {outputs:?}"
            )));
        }

        Ok(Self {
            boxes_output,
            scores_output,
            anchor_count: anchor_count as usize,
            coords_per_anchor: last(&outputs[boxes_output]) as usize,
        })
    }
}
