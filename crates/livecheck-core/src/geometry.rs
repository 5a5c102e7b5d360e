//! Coordinate math shared by the detector, the analyzer and the challenge driver.
//!
//! Detector output lives in an unmirrored space the size of the caller's
//! target viewport. The user sees a mirrored front-camera preview, so every
//! published rectangle and landmark is reflected about the vertical centre
//! of the target width before it leaves the analyzer.

use serde::{Deserialize, Serialize};

/// A 2D point in target-space pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Axis-aligned rectangle, `left <= right` and `top <= bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    pub fn contains(&self, point: &Point) -> bool {
        point.x >= self.left && point.x <= self.right && point.y >= self.top && point.y <= self.bottom
    }

    /// Intersection over union. Zero when either rectangle is empty.
    pub fn iou(&self, other: &Rect) -> f32 {
        let x1 = self.left.max(other.left);
        let y1 = self.top.max(other.top);
        let x2 = self.right.min(other.right);
        let y2 = self.bottom.min(other.bottom);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Reflect a rectangle about the vertical centre of `target_width`.
///
/// Left and right swap roles so the result is still well-ordered.
pub fn mirror_rect(rect: &Rect, target_width: f32) -> Rect {
    Rect {
        left: target_width - rect.right,
        top: rect.top,
        right: target_width - rect.left,
        bottom: rect.bottom,
    }
}

/// Reflect a point about the vertical centre of `target_width`.
pub fn mirror_point(point: &Point, target_width: f32) -> Point {
    Point {
        x: target_width - point.x,
        y: point.y,
    }
}

/// Where the detected face sits relative to the target oval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceOvalPosition {
    Matched,
    TooFar,
    TooClose,
    MoveLeft,
    MoveRight,
}

/// Thresholds for [`face_oval_position`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OvalTolerance {
    /// Minimum IoU between face and oval to count as matched.
    pub match_threshold: f32,
    /// Face area above `oval area * too_close_ratio` is too close.
    pub too_close_ratio: f32,
    /// Face area below `oval area * too_far_ratio` is too far.
    pub too_far_ratio: f32,
    /// Allowed horizontal centre offset, as a fraction of the oval width.
    pub center_tolerance: f32,
}

impl Default for OvalTolerance {
    fn default() -> Self {
        Self {
            match_threshold: 0.6,
            too_close_ratio: 1.3,
            too_far_ratio: 0.6,
            center_tolerance: 0.15,
        }
    }
}

/// Classify a mirrored face rectangle against the target oval.
///
/// Size is checked before centring: a face that is far too small or large
/// gets a distance instruction even if it happens to be off-centre.
pub fn face_oval_position(face: &Rect, oval: &Rect, tolerance: &OvalTolerance) -> FaceOvalPosition {
    let oval_area = oval.area();
    let face_area = face.area();

    if oval_area > 0.0 {
        if face_area > oval_area * tolerance.too_close_ratio {
            return FaceOvalPosition::TooClose;
        }
        if face_area < oval_area * tolerance.too_far_ratio {
            return FaceOvalPosition::TooFar;
        }
    }

    // Both rects are in mirrored (preview) space, so "move left" means the
    // user moves towards the left edge of what they see.
    let offset = face.center().x - oval.center().x;
    let allowed = oval.width() * tolerance.center_tolerance;
    if offset > allowed {
        return FaceOvalPosition::MoveLeft;
    }
    if offset < -allowed {
        return FaceOvalPosition::MoveRight;
    }

    if face.iou(oval) >= tolerance.match_threshold {
        FaceOvalPosition::Matched
    } else if face_area < oval_area {
        FaceOvalPosition::TooFar
    } else {
        FaceOvalPosition::TooClose
    }
}

/// A centred oval bounding box covering the middle of the target viewport.
pub fn default_oval(target_width: f32, target_height: f32) -> Rect {
    let width = target_width * 0.6;
    let height = width * 1.4;
    let cx = target_width / 2.0;
    let cy = target_height / 2.0;
    Rect::new(
        cx - width / 2.0,
        cy - height / 2.0,
        cx + width / 2.0,
        cy + height / 2.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET_WIDTH: f32 = 480.0;

    #[test]
    fn test_mirror_rect_swaps_edges() {
        let rect = Rect::new(100.0, 50.0, 200.0, 150.0);
        let mirrored = mirror_rect(&rect, TARGET_WIDTH);
        assert_eq!(mirrored, Rect::new(280.0, 50.0, 380.0, 150.0));
        assert!(mirrored.left <= mirrored.right);
        assert_eq!(mirrored.width(), rect.width());
    }

    #[test]
    fn test_mirror_point_is_involution() {
        let points = [
            Point::new(0.0, 0.0),
            Point::new(12.5, 300.0),
            Point::new(240.0, 10.0),
            Point::new(479.0, 639.0),
        ];
        for p in points {
            let twice = mirror_point(&mirror_point(&p, TARGET_WIDTH), TARGET_WIDTH);
            assert_eq!(twice, p);
        }
    }

    #[test]
    fn test_mirror_rect_is_involution() {
        let rect = Rect::new(10.0, 20.0, 110.0, 220.0);
        assert_eq!(mirror_rect(&mirror_rect(&rect, TARGET_WIDTH), TARGET_WIDTH), rect);
    }

    #[test]
    fn test_center_point_is_fixed() {
        let center = Point::new(TARGET_WIDTH / 2.0, 99.0);
        assert_eq!(mirror_point(&center, TARGET_WIDTH), center);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = Rect::new(0.0, 0.0, 2.0, 2.0);
        let b = Rect::new(1.0, 1.0, 3.0, 3.0);
        // intersection 1, union 7
        assert!((a.iou(&b) - 1.0 / 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_empty_rect() {
        let a = Rect::new(5.0, 5.0, 5.0, 5.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_oval_matched_when_aligned() {
        let oval = default_oval(480.0, 640.0);
        let pos = face_oval_position(&oval, &oval, &OvalTolerance::default());
        assert_eq!(pos, FaceOvalPosition::Matched);
    }

    #[test]
    fn test_oval_too_far_for_small_face() {
        let oval = default_oval(480.0, 640.0);
        let c = oval.center();
        let face = Rect::new(c.x - 30.0, c.y - 40.0, c.x + 30.0, c.y + 40.0);
        let pos = face_oval_position(&face, &oval, &OvalTolerance::default());
        assert_eq!(pos, FaceOvalPosition::TooFar);
    }

    #[test]
    fn test_oval_too_close_for_large_face() {
        let oval = default_oval(480.0, 640.0);
        let face = Rect::new(0.0, 0.0, 480.0, 640.0);
        let pos = face_oval_position(&face, &oval, &OvalTolerance::default());
        assert_eq!(pos, FaceOvalPosition::TooClose);
    }

    #[test]
    fn test_oval_off_centre() {
        let oval = default_oval(480.0, 640.0);
        let shift = oval.width() * 0.3;
        let right = Rect::new(oval.left + shift, oval.top, oval.right + shift, oval.bottom);
        let left = Rect::new(oval.left - shift, oval.top, oval.right - shift, oval.bottom);
        let tol = OvalTolerance::default();
        assert_eq!(face_oval_position(&right, &oval, &tol), FaceOvalPosition::MoveLeft);
        assert_eq!(face_oval_position(&left, &oval, &tol), FaceOvalPosition::MoveRight);
    }

    #[test]
    fn test_default_oval_is_centred() {
        let oval = default_oval(480.0, 640.0);
        let c = oval.center();
        assert!((c.x - 240.0).abs() < 1e-3);
        assert!((c.y - 320.0).abs() < 1e-3);
        assert!(oval.left > 0.0 && oval.right < 480.0);
        assert!(oval.top > 0.0 && oval.bottom < 640.0);
    }
}
