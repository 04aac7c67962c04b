use serde::{Deserialize, Serialize};

/// Axis-aligned box, `(x_min, y_min, x_max, y_max)`, in the coordinate space
/// the detector reports (pixels or normalized).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    /// A box is well formed when every coordinate is finite and the corners
    /// are not inverted. Degenerate (zero-area) boxes are accepted.
    pub fn is_well_formed(&self) -> bool {
        [self.x_min, self.y_min, self.x_max, self.y_max]
            .iter()
            .all(|v| v.is_finite())
            && self.x_min <= self.x_max
            && self.y_min <= self.y_max
    }
}

/// One object instance predicted for a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_label: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    pub stream_id: String,
    pub sequence_number: i64,
    pub job_id: String,
}

impl Detection {
    /// Compare two detections allowing `tolerance` of drift in confidence and
    /// box coordinates. Inference is not bit-exact across accelerators.
    pub fn approx_eq(&self, other: &Detection, tolerance: f32) -> bool {
        let close = |a: f32, b: f32| (a - b).abs() <= tolerance;
        self.class_label == other.class_label
            && self.job_id == other.job_id
            && self.stream_id == other.stream_id
            && self.sequence_number == other.sequence_number
            && close(self.confidence, other.confidence)
            && close(self.bounding_box.x_min, other.bounding_box.x_min)
            && close(self.bounding_box.y_min, other.bounding_box.y_min)
            && close(self.bounding_box.x_max, other.bounding_box.x_max)
            && close(self.bounding_box.y_max, other.bounding_box.y_max)
    }
}
