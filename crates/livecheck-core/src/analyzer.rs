//! Per-frame orchestration.
//!
//! The capture pipeline hands every frame to [`FrameAnalyzer::analyze`], one
//! at a time. The analyzer copies the pixels into its reusable buffer,
//! releases the frame, asks the shared state whether this frame should run
//! inference, and if so preprocesses, runs the model, decodes, mirrors and
//! publishes. Per-frame failures never leave `analyze`: the frame is logged
//! and discarded and the next one is processed normally.

use crate::detector::{DetectorConfig, DetectorError, FaceCandidate, FaceDetector};
use crate::frame::{CameraFrame, FrameError, PixelBuffer};
use crate::geometry::{mirror_point, mirror_rect};
use crate::runner::{InferenceBackend, Preprocessor, RunnerError};
use crate::state::{LivenessSink, MirroredFaceGeometry};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error("inference: {0}")]
    Inference(#[from] RunnerError),
    #[error("decode: {0}")]
    Decode(#[from] DetectorError),
}

/// What happened to one delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FrameOutcome {
    /// The frame gate or cadence skipped inference. Nothing was published.
    GatedOut,
    /// Face count 0 published, geometry left as it was.
    NoFace,
    /// Face count published, geometry withheld.
    MultipleFaces { count: usize },
    /// Face count 1 and this geometry published.
    SingleFace { geometry: MirroredFaceGeometry },
    /// The frame failed and was dropped. Nothing was published.
    Discarded,
}

pub struct FrameAnalyzer<B, S> {
    backend: B,
    detector: FaceDetector,
    sink: Arc<S>,
    buffer: PixelBuffer,
    preprocessor: Option<Preprocessor>,
    target_width: f32,
    last_rotation: u32,
    frames_seen: u64,
    span: tracing::Span,
}

impl<B: InferenceBackend, S: LivenessSink> FrameAnalyzer<B, S> {
    /// `session_id` tags every log line this analyzer emits.
    pub fn new(backend: B, config: DetectorConfig, sink: Arc<S>, session_id: &str) -> Self {
        let input = backend.input_shape();
        let target_width = config.output_width;
        let span = tracing::info_span!("frame_analyzer", session = %session_id);
        span.in_scope(|| {
            tracing::info!(
                model_width = input.width,
                model_height = input.height,
                target_width,
                target_height = config.output_height,
                "frame analyzer ready"
            );
        });

        Self {
            detector: FaceDetector::new(config, input),
            backend,
            sink,
            buffer: PixelBuffer::new(),
            preprocessor: None,
            target_width,
            last_rotation: 0,
            frames_seen: 0,
            span,
        }
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    /// Rotation of the most recently delivered frame.
    pub fn last_rotation(&self) -> u32 {
        self.last_rotation
    }

    /// Process one frame, swallowing any failure.
    pub fn analyze<F: CameraFrame>(&mut self, frame: F) -> FrameOutcome {
        match self.try_analyze(frame) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.span.in_scope(|| {
                    tracing::warn!(frame = self.frames_seen, error = %e, "discarding frame");
                });
                FrameOutcome::Discarded
            }
        }
    }

    /// Process one frame. The frame is released before inference starts and
    /// on every error path.
    pub fn try_analyze<F: CameraFrame>(&mut self, frame: F) -> Result<FrameOutcome, AnalyzeError> {
        let span = self.span.clone();
        let _guard = span.enter();

        self.frames_seen += 1;
        self.last_rotation = frame.rotation_degrees();

        let image = self.buffer.copy_from(&frame)?;
        drop(frame);

        if !self.sink.should_analyze_frame() {
            tracing::trace!(frame = self.frames_seen, "frame gated out");
            return Ok(FrameOutcome::GatedOut);
        }

        let shape = self.backend.input_shape();
        let preprocessor = match self.preprocessor.take() {
            Some(p) if p.shape() == shape => p,
            Some(previous) => {
                tracing::info!(
                    old = ?previous.shape(),
                    new = ?shape,
                    "model input shape changed, rebuilding preprocessing"
                );
                self.detector = FaceDetector::new(self.detector.config().clone(), shape);
                Preprocessor::new(shape)
            }
            None => Preprocessor::new(shape),
        };
        let preprocessor = self.preprocessor.insert(preprocessor);

        let input = preprocessor.process(image, self.last_rotation)?;
        let tensors = self.backend.run(&input)?;
        let faces = self.detector.decode(&tensors)?;

        self.sink.report_face_count(faces.len());
        tracing::debug!(
            frame = self.frames_seen,
            faces = faces.len(),
            rotation = self.last_rotation,
            "frame analyzed"
        );

        Ok(match faces.as_slice() {
            [] => FrameOutcome::NoFace,
            [face] => {
                let geometry = self.mirror(face);
                self.sink.report_face_geometry(geometry);
                FrameOutcome::SingleFace { geometry }
            }
            many => FrameOutcome::MultipleFaces { count: many.len() },
        })
    }

    fn mirror(&self, face: &FaceCandidate) -> MirroredFaceGeometry {
        let w = self.target_width;
        MirroredFaceGeometry {
            face: mirror_rect(&face.location, w),
            left_eye: mirror_point(&face.left_eye, w),
            right_eye: mirror_point(&face.right_eye, w),
            mouth: mirror_point(&face.mouth, w),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;
    use crate::geometry::{Point, Rect};
    use crate::runner::{DetectionTensorSet, InputShape, TensorLayout};
    use crate::state::LivenessState;
    use ndarray::Array4;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::Mutex;

    const SHAPE: InputShape = InputShape {
        width: 128,
        height: 128,
        layout: TensorLayout::Nhwc,
    };
    const COORDS: usize = 16;

    /// Returns one scripted set of face centres per call.
    struct ScriptedBackend {
        anchors: Vec<Point>,
        script: VecDeque<Vec<Point>>,
        calls: Rc<Cell<usize>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Vec<Point>>) -> (Self, Rc<Cell<usize>>) {
            let calls = Rc::new(Cell::new(0));
            let anchors = FaceDetector::new(DetectorConfig::default(), SHAPE)
                .anchors()
                .to_vec();
            let backend = Self {
                anchors,
                script: script.into(),
                calls: Rc::clone(&calls),
            };
            (backend, calls)
        }
    }

    impl InferenceBackend for ScriptedBackend {
        fn input_shape(&self) -> InputShape {
            SHAPE
        }

        fn run(&mut self, input: &Array4<f32>) -> Result<DetectionTensorSet, RunnerError> {
            assert_eq!(input.shape(), &[1, 128, 128, 3]);
            self.calls.set(self.calls.get() + 1);
            let faces = self
                .script
                .pop_front()
                .ok_or_else(|| RunnerError::InferenceFailed("script exhausted".into()))?;

            let n = self.anchors.len();
            let mut t = DetectionTensorSet {
                boxes: vec![0.0; n * COORDS],
                scores: vec![-10.0; n],
                coords_per_anchor: COORDS,
            };
            for c in faces {
                let (i, a) = self
                    .anchors
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.distance(&c).total_cmp(&b.distance(&c)))
                    .map(|(i, a)| (i, *a))
                    .unwrap();
                let row = &mut t.boxes[i * COORDS..(i + 1) * COORDS];
                row[0] = (c.x - a.x) * 128.0;
                row[1] = (c.y - a.y) * 128.0;
                row[2] = 0.2 * 128.0;
                row[3] = 0.2 * 128.0;
                let kps = [(-0.04, -0.03), (0.04, -0.03), (0.0, 0.0), (0.0, 0.05)];
                for (k, (dx, dy)) in kps.iter().enumerate() {
                    row[4 + k * 2] = (c.x + dx - a.x) * 128.0;
                    row[5 + k * 2] = (c.y + dy - a.y) * 128.0;
                }
                t.scores[i] = 8.0;
            }
            Ok(t)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        gate: Mutex<VecDeque<bool>>,
        counts: Mutex<Vec<usize>>,
        geometries: Mutex<Vec<MirroredFaceGeometry>>,
    }

    impl RecordingSink {
        fn with_gate(decisions: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                gate: Mutex::new(decisions.iter().copied().collect()),
                ..Self::default()
            })
        }
    }

    impl LivenessSink for RecordingSink {
        fn should_analyze_frame(&self) -> bool {
            self.gate.lock().unwrap().pop_front().unwrap_or(true)
        }

        fn report_face_count(&self, count: usize) {
            self.counts.lock().unwrap().push(count);
        }

        fn report_face_geometry(&self, geometry: MirroredFaceGeometry) {
            self.geometries.lock().unwrap().push(geometry);
        }
    }

    /// Frame that records when it is released.
    struct TrackedFrame {
        inner: RawFrame,
        released: Rc<Cell<bool>>,
    }

    impl CameraFrame for TrackedFrame {
        fn width(&self) -> u32 {
            self.inner.width
        }
        fn height(&self) -> u32 {
            self.inner.height
        }
        fn rotation_degrees(&self) -> u32 {
            self.inner.rotation_degrees
        }
        fn row_stride(&self) -> usize {
            self.inner.row_stride
        }
        fn pixels(&self) -> &[u8] {
            &self.inner.data
        }
    }

    impl Drop for TrackedFrame {
        fn drop(&mut self) {
            self.released.set(true);
        }
    }

    fn frame() -> RawFrame {
        RawFrame::new(16, 16, 0, vec![128; 16 * 16 * 4])
    }

    fn tracked(inner: RawFrame) -> (TrackedFrame, Rc<Cell<bool>>) {
        let released = Rc::new(Cell::new(false));
        let frame = TrackedFrame {
            inner,
            released: Rc::clone(&released),
        };
        (frame, released)
    }

    fn analyzer(
        script: Vec<Vec<Point>>,
        sink: Arc<RecordingSink>,
    ) -> (FrameAnalyzer<ScriptedBackend, RecordingSink>, Rc<Cell<usize>>) {
        let (backend, calls) = ScriptedBackend::new(script);
        let analyzer = FrameAnalyzer::new(backend, DetectorConfig::default(), sink, "test");
        (analyzer, calls)
    }

    #[test]
    fn test_gated_frame_skips_inference_and_publishing() {
        let sink = RecordingSink::with_gate(&[false]);
        let (mut analyzer, calls) = analyzer(vec![], Arc::clone(&sink));

        assert_eq!(analyzer.analyze(frame()), FrameOutcome::GatedOut);
        assert_eq!(calls.get(), 0);
        assert!(sink.counts.lock().unwrap().is_empty());
        assert!(sink.geometries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_face_reports_zero_without_geometry() {
        let sink = RecordingSink::with_gate(&[]);
        let (mut analyzer, calls) = analyzer(vec![vec![]], Arc::clone(&sink));

        assert_eq!(analyzer.analyze(frame()), FrameOutcome::NoFace);
        assert_eq!(calls.get(), 1);
        assert_eq!(*sink.counts.lock().unwrap(), vec![0]);
        assert!(sink.geometries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_multiple_faces_withhold_geometry() {
        let sink = RecordingSink::with_gate(&[]);
        let faces = vec![Point::new(0.25, 0.3), Point::new(0.75, 0.7)];
        let (mut analyzer, _) = analyzer(vec![faces], Arc::clone(&sink));

        assert_eq!(
            analyzer.analyze(frame()),
            FrameOutcome::MultipleFaces { count: 2 }
        );
        assert_eq!(*sink.counts.lock().unwrap(), vec![2]);
        assert!(sink.geometries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_single_face_is_mirrored() {
        let sink = RecordingSink::with_gate(&[]);
        let (mut analyzer, _) = analyzer(vec![vec![Point::new(0.25, 0.5)]], Arc::clone(&sink));

        let outcome = analyzer.analyze(frame());
        let FrameOutcome::SingleFace { geometry } = outcome else {
            panic!("expected a single face, got {outcome:?}");
        };

        // Unmirrored centre x is 0.25 * 480 = 120, mirrored 480 - 120 = 360.
        let c = geometry.face.center();
        assert!((c.x - 360.0).abs() < 1e-2, "centre x {}", c.x);
        assert!((c.y - 320.0).abs() < 1e-2, "centre y {}", c.y);
        assert!(geometry.face.left < geometry.face.right);
        // Landmarks move with the box.
        assert!(geometry.face.contains(&geometry.left_eye));
        assert!(geometry.face.contains(&geometry.right_eye));
        assert!(geometry.face.contains(&geometry.mouth));
        assert_eq!(*sink.counts.lock().unwrap(), vec![1]);
        assert_eq!(*sink.geometries.lock().unwrap(), vec![geometry]);
    }

    #[test]
    fn test_mirroring_twice_recovers_detector_output() {
        let sink = RecordingSink::with_gate(&[]);
        let (mut analyzer, _) = analyzer(vec![vec![Point::new(0.4, 0.6)]], Arc::clone(&sink));
        let FrameOutcome::SingleFace { geometry } = analyzer.analyze(frame()) else {
            panic!("expected a single face");
        };

        let unmirrored: Rect = mirror_rect(&geometry.face, 480.0);
        let c = unmirrored.center();
        assert!((c.x - 0.4 * 480.0).abs() < 1e-2);
        assert!((c.y - 0.6 * 640.0).abs() < 1e-2);
    }

    #[test]
    fn test_frame_released_before_return() {
        let sink = RecordingSink::with_gate(&[false]);
        let (mut analyzer, _) = analyzer(vec![], sink);
        let (frame, released) = tracked(frame());

        analyzer.analyze(frame);
        assert!(released.get());
    }

    #[test]
    fn test_malformed_frame_discarded_and_released() {
        let sink = RecordingSink::with_gate(&[]);
        let (mut analyzer, calls) = analyzer(vec![], Arc::clone(&sink));
        let (bad, released) = tracked(RawFrame::new(16, 16, 0, vec![0; 10]));

        assert_eq!(analyzer.analyze(bad), FrameOutcome::Discarded);
        assert!(released.get());
        assert_eq!(calls.get(), 0);
        assert!(sink.counts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_overflowing_stride_is_discarded() {
        let sink = RecordingSink::with_gate(&[]);
        let (mut analyzer, calls) = analyzer(vec![vec![]], Arc::clone(&sink));
        let bad = RawFrame {
            width: 1,
            height: 3,
            rotation_degrees: 0,
            row_stride: usize::MAX / 2 + 1,
            data: vec![0; 16],
        };

        assert_eq!(analyzer.analyze(bad), FrameOutcome::Discarded);
        assert_eq!(calls.get(), 0);
        assert!(sink.counts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_short_box_tensor_is_discarded() {
        struct ShortBoxes;
        impl InferenceBackend for ShortBoxes {
            fn input_shape(&self) -> InputShape {
                SHAPE
            }
            fn run(&mut self, _input: &Array4<f32>) -> Result<DetectionTensorSet, RunnerError> {
                let mut scores = vec![-10.0; 896];
                scores[5] = 9.0;
                Ok(DetectionTensorSet {
                    boxes: vec![0.0; COORDS],
                    scores,
                    coords_per_anchor: COORDS,
                })
            }
        }

        let sink = RecordingSink::with_gate(&[]);
        let mut analyzer =
            FrameAnalyzer::new(ShortBoxes, DetectorConfig::default(), Arc::clone(&sink), "test");
        assert_eq!(analyzer.analyze(frame()), FrameOutcome::Discarded);
        assert!(sink.counts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_frame_keeps_published_state() {
        let state = Arc::new(LivenessState::new());
        let (backend, _) = ScriptedBackend::new(vec![vec![Point::new(0.5, 0.5)]]);
        let mut analyzer =
            FrameAnalyzer::new(backend, DetectorConfig::default(), Arc::clone(&state), "test");

        assert!(matches!(
            analyzer.analyze(frame()),
            FrameOutcome::SingleFace { .. }
        ));
        let before = state.snapshot();

        let outcome = analyzer.analyze(RawFrame::new(0, 16, 0, vec![]));
        assert_eq!(outcome, FrameOutcome::Discarded);
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn test_unsupported_rotation_is_discarded() {
        let sink = RecordingSink::with_gate(&[]);
        let (mut analyzer, calls) = analyzer(vec![vec![]], Arc::clone(&sink));
        let mut f = frame();
        f.rotation_degrees = 45;

        assert_eq!(analyzer.analyze(f), FrameOutcome::Discarded);
        assert_eq!(analyzer.last_rotation(), 45);
        assert_eq!(calls.get(), 0);
        assert!(sink.counts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_backend_failure_is_discarded_then_recovers() {
        let sink = RecordingSink::with_gate(&[]);
        let (mut analyzer, calls) = analyzer(vec![], Arc::clone(&sink));

        assert_eq!(analyzer.analyze(frame()), FrameOutcome::Discarded);
        analyzer.backend.script.push_back(vec![]);
        assert_eq!(analyzer.analyze(frame()), FrameOutcome::NoFace);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_try_analyze_surfaces_error() {
        let sink = RecordingSink::with_gate(&[]);
        let (mut analyzer, _) = analyzer(vec![], sink);
        let err = analyzer
            .try_analyze(RawFrame::new(16, 16, 0, vec![]))
            .unwrap_err();
        assert!(matches!(err, AnalyzeError::Frame(FrameError::BufferTooSmall { .. })));
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(FrameOutcome::MultipleFaces { count: 3 }).unwrap();
        assert_eq!(json["outcome"], "multiple_faces");
        assert_eq!(json["count"], 3);
    }
}
