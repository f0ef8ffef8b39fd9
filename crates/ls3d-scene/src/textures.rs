// ls3d-scene/src/textures.rs
//! Locating texture files referenced by material names
//!
//! Game installs keep textures in a `maps/` folder next to `models/` (or
//! next to `missions/` for mission models). Names in the file are matched
//! case-insensitively.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ls3d_core::{Error, Result};
use tracing::debug;

/// Infer the install root a model file belongs to
pub fn base_dir_for(model_path: &Path) -> PathBuf {
    let dir = model_path.parent().unwrap_or_else(|| Path::new(""));
    let grandparent = dir.parent().unwrap_or_else(|| Path::new(""));

    if folder_name(dir) == "models" {
        grandparent.to_path_buf()
    } else if folder_name(grandparent) == "missions" {
        grandparent.parent().unwrap_or_else(|| Path::new("")).to_path_buf()
    } else {
        grandparent.to_path_buf()
    }
}

fn folder_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Case-insensitive lookup in one `maps` directory
#[derive(Debug, Clone)]
pub struct TextureResolver {
    maps_dir: PathBuf,
    /// Lower-cased file name to the name on disk
    index: HashMap<String, PathBuf>,
}

impl TextureResolver {
    /// Resolver for `<base>/maps`, base inferred from the model path
    pub fn for_model(model_path: &Path) -> Self {
        Self::new(base_dir_for(model_path).join("maps"))
    }

    /// Resolver for an explicit maps directory
    pub fn new(maps_dir: impl Into<PathBuf>) -> Self {
        let maps_dir = maps_dir.into();
        let mut index = HashMap::new();
        // An unreadable directory leaves the index empty; each lookup then
        // reports the texture as missing.
        if let Ok(entries) = fs::read_dir(&maps_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() {
                    let key = entry.file_name().to_string_lossy().to_lowercase();
                    index.insert(key, path);
                }
            }
        }
        debug!(dir = %maps_dir.display(), files = index.len(), "Indexed texture directory");
        Self { maps_dir, index }
    }

    pub fn maps_dir(&self) -> &Path {
        &self.maps_dir
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let file_name = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        self.index
            .get(&file_name)
            .cloned()
            .ok_or_else(|| Error::MissingResource {
                name: name.to_string(),
                searched: self.maps_dir.clone(),
            })
    }
}
