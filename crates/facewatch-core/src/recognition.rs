//! The face recognition service: a live identity registry over a database
//! directory, kept fresh by a background watcher, queried per frame.
//!
//! # Lifecycle
//! 1. `FaceRecognition::new(extractor)`
//! 2. `load_persons_db(path, force, visualize)` builds the first generation
//! 3. optionally `start_watching(interval)`; changes trigger forced reloads
//! 4. `run` / `run_one_face` / `find_best_match` from any thread
//! 5. drop (or `stop_watching`) joins the watcher thread

use crate::annotate::{self, KNOWN_COLOR, UNKNOWN_COLOR};
use crate::extractor::{ExtractorError, FaceExtractor};
use crate::matcher::{self, CosineSimilarity, Similarity};
use crate::registry::{self, AtomicLoadStatus, LoadError, LoadStatus, Registry};
use crate::types::{Embedding, MatchResult, MatchResults};
use crate::watcher::{WatchError, WatchTarget, Watcher};
use image::RgbImage;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// State shared with the watcher thread.
struct Shared {
    /// Also the load serialization point: held for a whole load pass.
    extractor: Mutex<Box<dyn FaceExtractor>>,
    similarity: Box<dyn Similarity>,
    /// Current generation. Swapped whole; readers clone the `Arc`.
    registry: RwLock<Arc<Registry>>,
    status: AtomicLoadStatus,
    db_path: Mutex<Option<PathBuf>>,
}

impl Shared {
    fn load(&self, path: &Path, force: bool, visualize: bool) -> Result<(), LoadError> {
        let mut extractor = self.extractor.lock();
        self.load_locked(extractor.as_mut(), path, force, visualize)
    }

    /// Forced reload of `path`, unless a caller switched the database away
    /// from it. Checked under the load lock so a newer path is never undone.
    fn reload_if_current(&self, path: &Path) -> Result<bool, LoadError> {
        let mut extractor = self.extractor.lock();
        if self.db_path.lock().as_deref() != Some(path) {
            tracing::debug!(path = %path.display(), "database path changed before reload, skipping");
            return Ok(false);
        }
        self.load_locked(extractor.as_mut(), path, true, false)?;
        Ok(true)
    }

    /// Body of a load pass. `extractor` is the held load lock.
    fn load_locked(
        &self,
        extractor: &mut dyn FaceExtractor,
        path: &Path,
        force: bool,
        visualize: bool,
    ) -> Result<(), LoadError> {
        {
            let mut current = self.db_path.lock();
            if current.as_deref() != Some(path) {
                tracing::debug!(path = %path.display(), previous = ?current.as_deref(), "database path changed");
                self.status.store(LoadStatus::NotLoaded);
                *current = Some(path.to_path_buf());
            }
        }

        let status = self.status.load();
        if status == LoadStatus::Loaded && !force {
            tracing::debug!(path = %path.display(), %status, force, "database already loaded, skipping");
            return Ok(());
        }

        self.status.store(LoadStatus::Loading);
        tracing::info!(path = %path.display(), force, visualize, "loading persons database");

        match registry::build_registry(path, extractor, visualize) {
            Ok(generation) => {
                tracing::info!(
                    path = %path.display(),
                    identities = generation.len(),
                    embeddings = generation.embedding_count(),
                    "persons database loaded"
                );
                *self.registry.write() = Arc::new(generation);
                self.status.store(LoadStatus::Loaded);
                Ok(())
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot load persons database");
                *self.registry.write() = Arc::new(Registry::default());
                self.status.store(LoadStatus::NotLoaded);
                Err(e)
            }
        }
    }

    fn snapshot(&self) -> Arc<Registry> {
        Arc::clone(&*self.registry.read())
    }
}

impl WatchTarget for Shared {
    fn watched_path(&self) -> Option<PathBuf> {
        self.db_path.lock().clone()
    }

    fn reload(&self, path: &Path) {
        if let Err(e) = self.reload_if_current(path) {
            tracing::warn!(path = %path.display(), error = %e, "watcher reload failed");
        }
    }
}

/// Identity registry plus matcher, optionally kept in sync with its
/// database directory by a watcher thread.
pub struct FaceRecognition {
    shared: Arc<Shared>,
    watcher: Mutex<Option<Watcher>>,
}

impl FaceRecognition {
    /// Service scoring with cosine similarity.
    pub fn new(extractor: Box<dyn FaceExtractor>) -> Self {
        Self::with_similarity(extractor, Box::new(CosineSimilarity))
    }

    pub fn with_similarity(extractor: Box<dyn FaceExtractor>, similarity: Box<dyn Similarity>) -> Self {
        Self {
            shared: Arc::new(Shared {
                extractor: Mutex::new(extractor),
                similarity,
                registry: RwLock::new(Arc::new(Registry::default())),
                status: AtomicLoadStatus::new(LoadStatus::NotLoaded),
                db_path: Mutex::new(None),
            }),
            watcher: Mutex::new(None),
        }
    }

    /// Load the persons database from `path` (one subdirectory per identity).
    ///
    /// No-op when `path` is already loaded and `force` is false. With
    /// `visualize`, an annotated `<stem>_visualize.<ext>` copy of every image
    /// is written next to it. Blocks for the whole pass; concurrent calls run
    /// one after another.
    pub fn load_persons_db(&self, path: impl AsRef<Path>, force: bool, visualize: bool) -> Result<(), LoadError> {
        self.shared.load(path.as_ref(), force, visualize)
    }

    /// Start polling the database folder every `interval`.
    ///
    /// Fails with [`WatchError::NoDatabasePath`] if no database was ever
    /// configured. No-op when already watching.
    pub fn start_watching(&self, interval: Duration) -> Result<(), WatchError> {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            tracing::debug!("watcher already running");
            return Ok(());
        }

        let Some(path) = self.db_path() else {
            tracing::error!("cannot start watching: no database path set");
            return Err(WatchError::NoDatabasePath);
        };

        *watcher = Some(Watcher::spawn(Arc::clone(&self.shared), path, interval)?);
        Ok(())
    }

    /// Stop the watcher and wait for its thread to exit. Safe to repeat.
    pub fn stop_watching(&self) {
        let mut watcher = self.watcher.lock();
        if let Some(w) = watcher.take() {
            w.stop();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }

    /// Score `probe` against the current registry generation.
    pub fn find_best_match(&self, probe: &Embedding, threshold: f32) -> MatchResults {
        let generation = self.shared.snapshot();
        matcher::find_best_match(&generation, probe, threshold, self.shared.similarity.as_ref())
    }

    /// Detect every face in `frame` and return each face's best match, in
    /// detection order. With `visualize`, boxes, landmarks and the matched
    /// name are drawn onto `frame`.
    ///
    /// Inference shares the extractor with database loads, so a call made
    /// during a load pass (including a watcher reload) waits for that pass
    /// to finish. [`FaceRecognition::find_best_match`] never waits.
    pub fn run(&self, frame: &mut RgbImage, threshold: f32, visualize: bool) -> Result<Vec<MatchResult>, ExtractorError> {
        let faces = self.shared.extractor.lock().detect_faces(frame)?;
        let generation = self.shared.snapshot();

        let mut results = Vec::with_capacity(faces.len());
        for (i, face) in faces.iter().enumerate() {
            let best = matcher::find_best_match(&generation, &face.embedding, threshold, self.shared.similarity.as_ref()).best;
            tracing::info!(face = i + 1, name = %best.name, score = best.score, "face best match");

            if visualize {
                let color = if best.is_unknown() { UNKNOWN_COLOR } else { KNOWN_COLOR };
                annotate::draw_face(frame, &face.bbox, color);
                annotate::draw_label(frame, &face.bbox, &best.name);
            }
            results.push(best);
        }
        Ok(results)
    }

    /// The single most confident identification in `frame`, or
    /// `("Unknown", 0.0)` when no face is found.
    pub fn run_one_face(&self, frame: &mut RgbImage, threshold: f32, visualize: bool) -> Result<MatchResult, ExtractorError> {
        let results = self.run(frame, threshold, visualize)?;
        let mut best: Option<MatchResult> = None;
        for result in results {
            if best.as_ref().map_or(true, |b| result.score > b.score) {
                best = Some(result);
            }
        }
        Ok(best.unwrap_or_else(MatchResult::unknown))
    }

    /// The database path of the last load, if any.
    pub fn db_path(&self) -> Option<PathBuf> {
        self.shared.db_path.lock().clone()
    }

    /// Point at a new database path. Invalidates the load status without
    /// reloading; waits for an in-flight load pass to finish first.
    pub fn set_db_path(&self, path: impl Into<PathBuf>) {
        let _serialized = self.shared.extractor.lock();
        *self.shared.db_path.lock() = Some(path.into());
        self.shared.status.store(LoadStatus::NotLoaded);
    }

    pub fn load_status(&self) -> LoadStatus {
        self.shared.status.load()
    }

    /// Read-only view of the current registry generation.
    pub fn registry(&self) -> Arc<Registry> {
        self.shared.snapshot()
    }
}

impl Drop for FaceRecognition {
    fn drop(&mut self) {
        self.stop_watching();
    }
}
