//! ls3d-scene
//!
//! Host-neutral scene graph for LS3D models, with import from and export to
//! the 4DS codec in `ls3d-parsers`.
//!
//! # Example
//!
//! ```rust,ignore
//! use ls3d_scene::{import_file, write_scene_file, ExportOptions, ImportOptions};
//!
//! let imported = import_file("models/car.4ds".as_ref(), &ImportOptions::default())?;
//! for warning in &imported.report.warnings {
//!     eprintln!("{warning}");
//! }
//! write_scene_file(&imported.scene, &ExportOptions::default(), "out/car.4ds".as_ref())?;
//! ```

pub mod cache;
pub mod export;
pub mod import;
mod material;
pub mod scene;
pub mod textures;

pub use cache::{decode_batch, ModelCache};
pub use export::{export_scene, write_scene, write_scene_file, ExportOptions, ExportReport, Exported};
pub use import::{
    build_armature, import_file, import_file_with_context, import_model, import_reader, ImportOptions, ImportReport,
    Imported, JointRecord,
};
pub use scene::{
    Armature, Bone, EmptyDisplay, MaterialDescriptor, MeshData, NodeId, NodeKind, Parent, Polygon, PropertyValue,
    SceneGraph, SceneMaterial, SceneNode, ShapeKey, VertexGroup,
};
pub use textures::{base_dir_for, TextureResolver};
