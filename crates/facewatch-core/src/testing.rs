//! Test doubles: a model-free extractor and database fixtures.

use crate::extractor::{ExtractorError, FaceExtractor};
use crate::types::{BoundingBox, DetectedFace, Embedding};
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Colour that makes [`ColorExtractor`] fail instead of detecting.
pub const FAILING_COLOR: Rgb<u8> = Rgb([1, 2, 3]);

/// One face per image whose embedding is the image's first pixel colour.
/// Black images contain no face.
#[derive(Clone, Default)]
pub struct ColorExtractor {
    calls: Arc<AtomicUsize>,
}

impl ColorExtractor {
    /// Shared counter of `detect_faces` calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl FaceExtractor for ColorExtractor {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pixel = *image.get_pixel(0, 0);
        if pixel == FAILING_COLOR {
            return Err(ExtractorError::Unavailable("synthetic failure".into()));
        }
        if pixel == Rgb([0, 0, 0]) {
            return Ok(Vec::new());
        }
        Ok(vec![DetectedFace {
            bbox: BoundingBox {
                x: 1.0,
                y: 1.0,
                width: image.width() as f32 - 2.0,
                height: image.height() as f32 - 2.0,
                confidence: 0.99,
                landmarks: None,
            },
            embedding: color_embedding(pixel),
        }])
    }
}

pub fn color_embedding(color: Rgb<u8>) -> Embedding {
    Embedding::new(color.0.iter().map(|&c| c as f32).collect())
}

/// Write a solid-colour 8×8 PNG at `dir/identity/file`.
pub fn write_face(root: &Path, identity: &str, file: &str, color: Rgb<u8>) -> PathBuf {
    let dir = root.join(identity);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(file);
    RgbImage::from_pixel(8, 8, color).save(&path).unwrap();
    path
}
