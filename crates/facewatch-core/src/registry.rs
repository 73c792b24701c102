//! Identity registry: one generation of identity → embeddings, built from a
//! directory tree with one subdirectory per identity.

use crate::annotate::{self, KNOWN_COLOR};
use crate::extractor::FaceExtractor;
use crate::types::{DetectedFace, Embedding};
use image::RgbImage;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;
use walkdir::WalkDir;

/// Whether the registry reflects the configured database path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadStatus {
    NotLoaded = 0,
    Loading = 1,
    Loaded = 2,
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadStatus::NotLoaded => "NOT_LOADED",
            LoadStatus::Loading => "LOADING",
            LoadStatus::Loaded => "LOADED",
        })
    }
}

/// Lock-free cell for [`LoadStatus`], shared by callers and the watcher.
#[derive(Debug)]
pub(crate) struct AtomicLoadStatus(AtomicU8);

impl AtomicLoadStatus {
    pub fn new(status: LoadStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> LoadStatus {
        match self.0.load(Ordering::Acquire) {
            1 => LoadStatus::Loading,
            2 => LoadStatus::Loaded,
            _ => LoadStatus::NotLoaded,
        }
    }

    pub fn store(&self, status: LoadStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("database path not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("database path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("cannot read database directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One enrolled identity and its embeddings, in load order.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub name: String,
    pub embeddings: Vec<Embedding>,
}

/// One complete registry generation. Immutable once built.
///
/// Identities keep insertion order, which is the order the matcher scores
/// them in and therefore decides ties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    identities: Vec<Identity>,
}

impl Registry {
    /// Build a generation from `(name, embeddings)` pairs. A repeated name
    /// appends to the first occurrence, so names stay unique.
    pub fn from_identities<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<Embedding>)>,
        S: Into<String>,
    {
        let mut identities: Vec<Identity> = Vec::new();
        for (name, embeddings) in entries {
            let name = name.into();
            match identities.iter_mut().find(|i| i.name == name) {
                Some(existing) => existing.embeddings.extend(embeddings),
                None => identities.push(Identity { name, embeddings }),
            }
        }
        Self { identities }
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Total stored embeddings across all identities.
    pub fn embedding_count(&self) -> usize {
        self.identities.iter().map(|i| i.embeddings.len()).sum()
    }

    pub fn get(&self, name: &str) -> Option<&[Embedding]> {
        self.identities
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.embeddings.as_slice())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Identity> {
        self.identities.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.identities.iter().map(|i| i.name.as_str())
    }
}

impl<'a> IntoIterator for &'a Registry {
    type Item = &'a Identity;
    type IntoIter = std::slice::Iter<'a, Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Direct children of `dir` sorted by file name, which fixes identity and
/// image order. Only failing to list `dir` itself is an error; an entry that
/// cannot be read is logged and left out.
fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name();
    for entry in walker {
        match entry {
            Ok(entry) => paths.push(entry.into_path()),
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable entry"),
        }
    }
    Ok(paths)
}

/// Walk `root` and embed every enrollment image.
///
/// Only a missing or unreadable root fails; every per-item problem is logged
/// and skipped.
pub(crate) fn build_registry(
    root: &Path,
    extractor: &mut dyn FaceExtractor,
    visualize: bool,
) -> Result<Registry, LoadError> {
    if !root.exists() {
        return Err(LoadError::NotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(LoadError::NotADirectory(root.to_path_buf()));
    }

    let entries = sorted_entries(root).map_err(|source| LoadError::ReadDir {
        path: root.to_path_buf(),
        source,
    })?;

    let mut identities = Vec::new();
    for entry in entries {
        if !entry.is_dir() {
            tracing::warn!(path = %entry.display(), "unexpected file in database root, skipping");
            continue;
        }
        // Names are registry keys; a lossy conversion could collide.
        let Some(name) = entry.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            tracing::warn!(path = %entry.display(), "identity directory name is not valid UTF-8, skipping");
            continue;
        };
        tracing::debug!(identity = %name, "loading identity");
        let embeddings = load_identity(&entry, &name, extractor, visualize);
        identities.push(Identity { name, embeddings });
    }

    Ok(Registry { identities })
}

fn load_identity(
    dir: &Path,
    name: &str,
    extractor: &mut dyn FaceExtractor,
    visualize: bool,
) -> Vec<Embedding> {
    let files = match sorted_entries(dir) {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(identity = name, error = %e, "cannot list identity directory");
            return Vec::new();
        }
    };

    let mut embeddings = Vec::new();
    for path in files {
        if path.is_dir() {
            tracing::warn!(path = %path.display(), "unexpected sub-directory, skipping");
            continue;
        }
        if annotate::is_visualization_output(&path) {
            continue;
        }

        tracing::debug!(identity = name, path = %path.display(), "loading image");
        let image = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read image, skipping");
                continue;
            }
        };

        let faces = match extractor.detect_faces(&image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "face extraction failed, skipping");
                continue;
            }
        };
        if faces.is_empty() {
            tracing::warn!(path = %path.display(), "no face found");
        }

        if visualize {
            write_visualization(&path, image, &faces);
        }
        embeddings.extend(faces.into_iter().map(|f| f.embedding));
    }
    embeddings
}

fn write_visualization(source: &Path, mut canvas: RgbImage, faces: &[DetectedFace]) {
    for face in faces {
        annotate::draw_face(&mut canvas, &face.bbox, KNOWN_COLOR);
    }
    let out = annotate::visualize_path(source);
    if let Err(e) = canvas.save(&out) {
        tracing::warn!(path = %out.display(), error = %e, "cannot write visualization");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{color_embedding, write_face, ColorExtractor, FAILING_COLOR};
    use image::Rgb;
    use std::fs;
    use tempfile::TempDir;

    const RED: Rgb<u8> = Rgb([200, 10, 10]);
    const GREEN: Rgb<u8> = Rgb([10, 200, 10]);
    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    #[test]
    fn test_one_entry_per_identity_directory() {
        let db = TempDir::new().unwrap();
        write_face(db.path(), "bob", "1.png", RED);
        write_face(db.path(), "bob", "2.png", GREEN);
        write_face(db.path(), "alice", "a.png", GREEN);
        write_face(db.path(), "carol", "blank.png", BLACK);

        let registry = build_registry(db.path(), &mut ColorExtractor::default(), false).unwrap();

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["alice", "bob", "carol"]);
        assert_eq!(registry.get("bob").unwrap(), &[color_embedding(RED), color_embedding(GREEN)]);
        assert_eq!(registry.get("alice").unwrap().len(), 1);
        // Zero faces contribute zero embeddings, the identity still exists.
        assert_eq!(registry.get("carol").unwrap().len(), 0);
        assert_eq!(registry.embedding_count(), 3);
    }

    #[test]
    fn test_skips_bad_items_without_failing() {
        let db = TempDir::new().unwrap();
        write_face(db.path(), "alice", "good.png", RED);
        write_face(db.path(), "alice", "broken.png", FAILING_COLOR);
        fs::write(db.path().join("alice/notes.jpg"), b"not an image").unwrap();
        fs::create_dir_all(db.path().join("alice/nested")).unwrap();
        fs::write(db.path().join("README.txt"), b"stray").unwrap();

        let registry = build_registry(db.path(), &mut ColorExtractor::default(), false).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("alice").unwrap(), &[color_embedding(RED)]);
    }

    #[test]
    fn test_visualize_writes_marked_copy_that_is_not_reloaded() {
        let db = TempDir::new().unwrap();
        let source = write_face(db.path(), "alice", "face.png", RED);
        let extractor = ColorExtractor::default();
        let calls = extractor.calls();
        let mut extractor = extractor;

        build_registry(db.path(), &mut extractor, true).unwrap();
        let marked = annotate::visualize_path(&source);
        assert!(marked.exists());

        let registry = build_registry(db.path(), &mut extractor, false).unwrap();
        assert_eq!(registry.get("alice").unwrap().len(), 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_identity_names_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let db = TempDir::new().unwrap();
        write_face(db.path(), "alice", "1.png", RED);
        for raw in [b"\xff".as_slice(), b"\xfe".as_slice()] {
            let dir = db.path().join(OsStr::from_bytes(raw));
            fs::create_dir(&dir).unwrap();
            RgbImage::from_pixel(8, 8, GREEN).save_with_format(dir.join("1.png"), image::ImageFormat::Png).unwrap();
        }

        let registry = build_registry(db.path(), &mut ColorExtractor::default(), false).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["alice"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_entry_does_not_fail_load() {
        let db = TempDir::new().unwrap();
        write_face(db.path(), "alice", "1.png", RED);
        write_face(db.path(), "bob", "1.png", GREEN);
        std::os::unix::fs::symlink(db.path().join("gone"), db.path().join("carol")).unwrap();
        std::os::unix::fs::symlink(db.path().join("gone.png"), db.path().join("bob/2.png")).unwrap();

        let registry = build_registry(db.path(), &mut ColorExtractor::default(), false).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(registry.get("bob").unwrap(), &[color_embedding(GREEN)]);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let db = TempDir::new().unwrap();
        let missing = db.path().join("nope");
        let err = build_registry(&missing, &mut ColorExtractor::default(), false).unwrap_err();
        assert!(matches!(err, LoadError::NotFound(p) if p == missing));
    }

    #[test]
    fn test_file_root_is_fatal() {
        let db = TempDir::new().unwrap();
        let file = db.path().join("db.txt");
        fs::write(&file, b"x").unwrap();
        let err = build_registry(&file, &mut ColorExtractor::default(), false).unwrap_err();
        assert!(matches!(err, LoadError::NotADirectory(_)));
    }

    #[test]
    fn test_from_identities_merges_duplicates() {
        let e = Embedding::new(vec![1.0]);
        let registry = Registry::from_identities(vec![
            ("alice", vec![e.clone()]),
            ("bob", vec![]),
            ("alice", vec![e.clone()]),
        ]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("alice").unwrap().len(), 2);
    }

    #[test]
    fn test_atomic_status_roundtrip() {
        let status = AtomicLoadStatus::new(LoadStatus::NotLoaded);
        status.store(LoadStatus::Loading);
        assert_eq!(status.load(), LoadStatus::Loading);
        status.store(LoadStatus::Loaded);
        assert_eq!(status.load().to_string(), "LOADED");
    }
}
