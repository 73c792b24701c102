//! facewatch-core: live face identification against a directory of enrolled faces.
//!
//! Uses SCRFD for face detection and ArcFace for embeddings, both via ONNX
//! Runtime, and keeps an identity registry in sync with its database folder.

pub mod alignment;
pub mod annotate;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod recognition;
pub mod recognizer;
pub mod registry;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use extractor::{ExtractorError, FaceExtractor, OnnxExtractor};
pub use matcher::{find_best_match, CosineSimilarity, Similarity};
pub use recognition::FaceRecognition;
pub use registry::{Identity, LoadError, LoadStatus, Registry};
pub use types::{BoundingBox, DetectedFace, Embedding, MatchResult, MatchResults, UNKNOWN_IDENTITY};
pub use watcher::WatchError;
