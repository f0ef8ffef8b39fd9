// ls3d-scene/src/cache.rs
//! Instancing cache and parallel batch import
//!
//! Scenes that place one model many times decode it once. The cache is an
//! ordinary value owned by the caller; every decode still runs on its own
//! stream with its own registries, so independent files can be imported
//! in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::{debug, info};

use ls3d_core::Result;

use crate::import::{import_file_with_context, ImportOptions};
use crate::scene::SceneGraph;

/// Imported scenes keyed by normalised source path
#[derive(Debug, Default)]
pub struct ModelCache {
    entries: RwLock<HashMap<PathBuf, Arc<SceneGraph>>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical path when the file exists, the path as given otherwise
    fn key(path: &Path) -> PathBuf {
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<Arc<SceneGraph>> {
        self.entries.read().get(&Self::key(path)).cloned()
    }

    pub fn insert(&self, path: &Path, scene: SceneGraph) -> Arc<SceneGraph> {
        let scene = Arc::new(scene);
        self.entries.write().insert(Self::key(path), Arc::clone(&scene));
        scene
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Cached scene for `path`, importing it on a miss
    ///
    /// Two threads missing on the same path may both import it; the first
    /// insert wins and both get the same scene.
    pub fn get_or_import(&self, path: &Path, options: &ImportOptions) -> Result<Arc<SceneGraph>> {
        let key = Self::key(path);
        if let Some(scene) = self.entries.read().get(&key) {
            debug!(path = %path.display(), "Model cache hit");
            return Ok(Arc::clone(scene));
        }

        let imported = import_file_with_context(path, options)?;
        let scene = Arc::new(imported.scene);
        let mut entries = self.entries.write();
        Ok(Arc::clone(entries.entry(key).or_insert(scene)))
    }
}

/// Import many files in parallel through one cache
///
/// Results keep the order of `paths`. A failing file does not stop the
/// others.
pub fn decode_batch(
    paths: &[PathBuf],
    cache: &ModelCache,
    options: &ImportOptions,
) -> Vec<(PathBuf, Result<Arc<SceneGraph>>)> {
    let results: Vec<_> = paths
        .par_iter()
        .map(|path| (path.clone(), cache.get_or_import(path, options)))
        .collect();

    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    info!(files = paths.len(), failed, cached = cache.len(), "Batch import finished");
    results
}
