use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::models::detection::Detection;
use crate::models::frame::FrameJob;
use crate::models::outcome::FailureKind;
use crate::services::detector::{DecodedFrame, Detector, DetectorError, RawDetection};

/// Wraps the detector behind an admission gate of K slots, K being the
/// accelerator's real parallel capacity. Callers beyond K wait for a slot.
pub struct InferenceEngine {
    detector: Arc<dyn Detector>,
    slots: Semaphore,
    capacity: usize,
    timeout: Duration,
    min_confidence: f32,
}

/// Holds one accelerator slot; released when dropped on any exit path.
struct Slot<'a> {
    _permit: SemaphorePermit<'a>,
    engine: &'a InferenceEngine,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let in_use = self.engine.in_flight().saturating_sub(1);
        metrics::gauge!("inference_slots_in_use").set(in_use as f64);
    }
}

impl InferenceEngine {
    pub fn new(detector: Arc<dyn Detector>, capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            detector,
            slots: Semaphore::new(capacity),
            capacity,
            timeout,
            min_confidence: 0.0,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence.clamp(0.0, 1.0);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inferences currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Score one frame. An empty result means nothing was detected.
    pub async fn infer(&self, job: &FrameJob, frame_bytes: Vec<u8>) -> Result<Vec<Detection>, InferenceError> {
        let frame = decode_frame(frame_bytes).await?;

        let raw = tokio::time::timeout(self.timeout, self.run_gated(&frame))
            .await
            .map_err(|_| InferenceError::Timeout(self.timeout))??;

        self.attach(job, raw)
    }

    async fn run_gated(&self, frame: &DecodedFrame) -> Result<Vec<RawDetection>, InferenceError> {
        let slot = self.acquire().await?;

        let start = Instant::now();
        let result = self.detector.detect(frame).await;
        metrics::histogram!("inference_seconds").record(start.elapsed().as_secs_f64());

        drop(slot);
        Ok(result?)
    }

    async fn acquire(&self) -> Result<Slot<'_>, InferenceError> {
        let permit = self.slots.acquire().await.map_err(|_| InferenceError::Closed)?;
        metrics::gauge!("inference_slots_in_use").set(self.in_flight() as f64);
        Ok(Slot {
            _permit: permit,
            engine: self,
        })
    }

    fn attach(&self, job: &FrameJob, raw: Vec<RawDetection>) -> Result<Vec<Detection>, InferenceError> {
        let mut detections = Vec::with_capacity(raw.len());
        for d in raw {
            if !d.confidence.is_finite() || !(0.0..=1.0).contains(&d.confidence) {
                return Err(InferenceError::Detector(DetectorError::InvalidOutput(format!(
                    "confidence {} for '{}' is outside [0, 1]",
                    d.confidence, d.class_label
                ))));
            }
            if !d.bounding_box.is_well_formed() {
                return Err(InferenceError::Detector(DetectorError::InvalidOutput(format!(
                    "malformed bounding box {:?} for '{}'",
                    d.bounding_box, d.class_label
                ))));
            }
            if d.confidence < self.min_confidence {
                continue;
            }
            detections.push(Detection {
                class_label: d.class_label,
                confidence: d.confidence,
                bounding_box: d.bounding_box,
                stream_id: job.stream_id.clone(),
                sequence_number: job.sequence_number,
                job_id: job.job_id.clone(),
            });
        }
        Ok(detections)
    }
}

/// Decode off the async threads; large frames take milliseconds to decode.
async fn decode_frame(bytes: Vec<u8>) -> Result<DecodedFrame, InferenceError> {
    tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&bytes).map_err(|e| InferenceError::Decode(e.to_string()))?;
        Ok(DecodedFrame {
            width: image.width(),
            height: image.height(),
            encoded: Arc::from(bytes),
            image: Arc::new(image),
        })
    })
    .await
    .map_err(|e| InferenceError::Decode(format!("decoder aborted: {}", e)))?
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Frame payload could not be decoded: {0}")]
    Decode(String),

    #[error("Inference did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Accelerator slot pool is closed")]
    Closed,

    #[error(transparent)]
    Detector(#[from] DetectorError),
}

impl InferenceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            InferenceError::Decode(_) => FailureKind::Data,
            InferenceError::Timeout(_) | InferenceError::Closed => FailureKind::Capacity,
            InferenceError::Detector(e) => e.kind(),
        }
    }
}
