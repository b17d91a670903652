//! Allow-list store + watcher (C12, ambient): the set of acceptable client
//! certificate key hashes, hot-reloaded from disk.
//!
//! Follows the snapshot-swap pattern this crate uses for TLS config
//! hot-reload (`arc_swap::ArcSwap`, replace-whole-snapshot rather than
//! mutate-in-place) so readers never observe a half-written set: they hold
//! either the old complete `HashSet` or the new one, never a mix.

use arc_swap::ArcSwap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Errors from loading or watching the allow-list file.
#[derive(Debug, thiserror::Error)]
pub enum AllowListError {
    /// The file (or its parent directory, for the watcher) could not be
    /// read or created.
    #[error("could not access allow-list {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The filesystem watcher could not be installed.
    #[error("could not watch allow-list directory: {0}")]
    Watch(#[from] notify::Error),
}

fn parse(contents: &str) -> HashSet<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn load_from_disk(path: &Path) -> Result<HashSet<String>, AllowListError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(parse(&contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::write(path, b"").map_err(|source| AllowListError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(HashSet::new())
        }
        Err(source) => Err(AllowListError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// A hot-reloading snapshot of the allow-list file's hex digests.
pub struct AllowList {
    snapshot: Arc<ArcSwap<HashSet<String>>>,
    // Held only to keep the watcher alive for the lifetime of the store;
    // dropping it would stop delivering filesystem events.
    _watcher: RecommendedWatcher,
}

impl AllowList {
    /// Loads `path` (creating it empty if missing) and installs a
    /// directory watcher that reloads it on any write/rename event.
    ///
    /// # Errors
    ///
    /// Returns [`AllowListError`] if the file cannot be read/created or the
    /// watcher cannot be installed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, AllowListError> {
        let path = path.into();
        let initial = load_from_disk(&path)?;
        let snapshot = Arc::new(ArcSwap::new(Arc::new(initial)));

        let watch_path = path.clone();
        let watch_snapshot = Arc::clone(&snapshot);
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else {
                return;
            };
            if !event.paths.iter().any(|p| p == &watch_path) {
                return;
            }
            match load_from_disk(&watch_path) {
                Ok(updated) => {
                    info!(path = %watch_path.display(), count = updated.len(), "allow-list reloaded");
                    watch_snapshot.store(Arc::new(updated));
                }
                Err(e) => {
                    warn!(path = %watch_path.display(), error = %e, "allow-list reload failed, keeping previous snapshot");
                }
            }
        })?;

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        watcher.watch(parent, RecursiveMode::NonRecursive)?;

        Ok(Self {
            snapshot,
            _watcher: watcher,
        })
    }

    /// Whether `digest` (a lowercase hex SHA-1) is currently allow-listed.
    #[must_use]
    pub fn contains(&self, digest: &str) -> bool {
        self.snapshot.load().contains(&digest.to_lowercase())
    }

    /// Number of entries in the current snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Whether the current snapshot has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}
