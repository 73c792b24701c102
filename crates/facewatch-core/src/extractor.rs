//! The face-embedding capability consumed by the registry and matcher.

use crate::alignment;
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
}

/// Detects faces in an image and embeds each one.
///
/// Implementations may be stateful (inference sessions), hence `&mut self`.
/// "No faces" is an empty vector, not an error.
pub trait FaceExtractor: Send {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractorError>;
}

/// SCRFD detection + ArcFace embedding.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    /// Longest image side fed to the detector; `None` keeps the original size.
    max_size: Option<u32>,
}

impl OnnxExtractor {
    /// Load both ONNX models. `max_size == 0` disables downscaling.
    pub fn load(scrfd_path: &str, arcface_path: &str, max_size: u32) -> Result<Self, ExtractorError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self {
            detector,
            recognizer,
            max_size: (max_size > 0).then_some(max_size),
        })
    }
}

/// Shrink `image` so its longest side is at most `max_size`, keeping aspect.
///
/// Returns the factor that maps coordinates in the result back to `image`,
/// or `None` when no resize was needed.
pub(crate) fn downscale(image: &RgbImage, max_size: u32) -> Option<(RgbImage, f32)> {
    let longest = image.width().max(image.height());
    if longest <= max_size {
        return None;
    }
    let scale = max_size as f32 / longest as f32;
    let w = ((image.width() as f32 * scale).round() as u32).max(1);
    let h = ((image.height() as f32 * scale).round() as u32).max(1);
    let resized = imageops::resize(image, w, h, FilterType::Triangle);
    Some((resized, image.width() as f32 / w as f32))
}

impl FaceExtractor for OnnxExtractor {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractorError> {
        let resized = self.max_size.and_then(|max| downscale(image, max));
        let (frame, back_scale) = match &resized {
            Some((small, factor)) => (small, *factor),
            None => (image, 1.0),
        };

        let boxes = self.detector.detect(frame)?;
        tracing::debug!(
            faces = boxes.len(),
            width = frame.width(),
            height = frame.height(),
            "detector pass"
        );

        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let Some(landmarks) = bbox.landmarks else {
                tracing::warn!(confidence = bbox.confidence, "face without landmarks, skipping");
                continue;
            };
            let aligned = alignment::align_face(frame, &landmarks);
            let embedding = self.recognizer.embed(&aligned)?;
            faces.push(DetectedFace {
                bbox: bbox.scaled(back_scale),
                embedding,
            });
        }
        Ok(faces)
    }
}
