//! Polling directory watcher.
//!
//! A background thread periodically computes the newest modification time of
//! any regular file under the database directory and asks its target to
//! reload when that time moves forward. Several changes inside one interval
//! therefore collapse into a single reload.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use walkdir::WalkDir;

/// Shortest accepted poll interval; zero would spin.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("no database path configured, load a database before watching")]
    NoDatabasePath,
    #[error("cannot spawn watcher thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("cannot read modification time of {}: {source}", .path.display())]
    Mtime {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What the watcher observes and who it notifies.
pub(crate) trait WatchTarget: Send + Sync + 'static {
    /// Directory to scan this cycle.
    fn watched_path(&self) -> Option<PathBuf>;
    /// Called on the watcher thread after a change was detected under `path`.
    fn reload(&self, path: &Path);
}

/// Newest modification time of any regular file under `root`, recursively.
///
/// `Ok(None)` for a tree without files. Any access error fails the whole scan.
pub fn latest_mod_time(root: &Path) -> Result<Option<SystemTime>, ScanError> {
    let mut latest = None;
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry
            .metadata()?
            .modified()
            .map_err(|source| ScanError::Mtime {
                path: entry.path().to_path_buf(),
                source,
            })?;
        latest = latest.max(Some(modified));
    }
    Ok(latest)
}

fn scan_or_none(root: &Path) -> Option<SystemTime> {
    match latest_mod_time(root) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(path = %root.display(), error = %e, "cannot scan database folder");
            None
        }
    }
}

/// Handle to a running watcher thread. Dropping it without [`Watcher::stop`]
/// detaches the thread; owners are expected to stop it.
pub(crate) struct Watcher {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Watcher {
    /// Record the baseline for `root` and start polling every `interval`.
    pub fn spawn<T: WatchTarget>(target: Arc<T>, root: PathBuf, interval: Duration) -> Result<Self, WatchError> {
        let interval = interval.max(MIN_INTERVAL);
        let baseline = scan_or_none(&root);
        let (stop_tx, stop_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("facewatch-watcher".into())
            .spawn(move || run_loop(target.as_ref(), root, baseline, interval, stop_rx))
            .map_err(WatchError::Spawn)?;

        Ok(Self { stop_tx, handle })
    }

    /// Signal the loop and wait for the thread to exit.
    pub fn stop(self) {
        // The loop may already be gone; a failed send is fine.
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            tracing::error!("watcher thread panicked");
        }
    }
}

fn run_loop(
    target: &dyn WatchTarget,
    mut root: PathBuf,
    mut baseline: Option<SystemTime>,
    interval: Duration,
    stop_rx: mpsc::Receiver<()>,
) {
    tracing::info!(path = %root.display(), interval_ms = interval.as_millis() as u64, "watcher started");

    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let Some(current) = target.watched_path() else {
            continue;
        };
        if current != root {
            tracing::info!(from = %root.display(), to = %current.display(), "database path changed, re-baselining");
            baseline = scan_or_none(&current);
            root = current;
            continue;
        }

        let latest = match latest_mod_time(&root) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path = %root.display(), error = %e, "scan failed, treating as unchanged");
                continue;
            }
        };

        if latest > baseline {
            tracing::info!(path = %root.display(), "database folder changed, reloading");
            baseline = latest;
            target.reload(&root);
        }
    }

    tracing::info!(path = %root.display(), "watcher stopped");
}
