// ls3d-scene/src/import.rs
//! Building a [`SceneGraph`] from a decoded 4DS model
//!
//! Import runs in passes over the frame list:
//!
//! 1. every frame becomes scene nodes in file order; parent links are only
//!    queued, since a frame may name a parent that comes later
//! 2. joints are grouped under the skinned mesh that owns them and turned
//!    into one armature per mesh, then skin records become vertex groups
//! 3. the queued parent links are resolved, to nodes or to bones

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use ls3d_core::{Error, Mat4x4, Result, ResultExt, Transform, Vec3};
use ls3d_parsers::fds::{Lod, MorphSet, Object, Occluder, Sector, ShapeKeyName, SkinLod, Truncation};
use ls3d_parsers::{FdsModel, FdsParser, Frame, FramePayload, MaterialId, ParseOptions, Parser, VisualType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scene::{
    Armature, Bone, EmptyDisplay, MeshData, NodeId, NodeKind, Parent, Polygon, PropertyValue, SceneGraph,
    SceneMaterial, SceneNode,
};
use crate::textures::TextureResolver;

/// Length of the synthetic bone tail
const BONE_TAIL_LENGTH: f32 = 0.15;
/// Tolerance when comparing joint scales
const SCALE_EPSILON: f32 = 1.0e-4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    pub parse: ParseOptions,
    /// Build armatures and vertex groups for skinned meshes
    pub build_armatures: bool,
    /// Texture folder, instead of the one inferred from the model path
    pub maps_dir: Option<PathBuf>,
    pub resolve_textures: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            parse: ParseOptions::default(),
            build_armatures: true,
            maps_dir: None,
            resolve_textures: true,
        }
    }
}

/// Everything that degraded during an import
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub warnings: Vec<String>,
    pub truncated: Option<Truncation>,
    pub animated: bool,
}

impl ImportReport {
    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

#[derive(Debug, Clone)]
pub struct Imported {
    pub scene: SceneGraph,
    pub report: ImportReport,
}

/// Decode and import a file, resolving textures next to it
pub fn import_file(path: &Path, options: &ImportOptions) -> Result<Imported> {
    if !path.is_file() {
        return Err(Error::FileNotFound(path.to_path_buf()));
    }
    let model = FdsParser::new().parse_file_with_options(path, &options.parse, None)?;

    let textures = options.resolve_textures.then(|| match &options.maps_dir {
        Some(dir) => TextureResolver::new(dir),
        None => TextureResolver::for_model(path),
    });

    let imported = import_model(&model, options, textures.as_ref());
    info!(
        path = %path.display(),
        nodes = imported.scene.len(),
        warnings = imported.report.warnings.len(),
        "Imported 4DS model"
    );
    Ok(imported)
}

/// Decode and import from a stream. Textures resolve only against `maps_dir`.
pub fn import_reader<R: Read + Seek>(reader: R, options: &ImportOptions) -> Result<Imported> {
    let model = FdsParser::new().parse_with_options(reader, &options.parse, None)?;
    let textures = options
        .maps_dir
        .as_ref()
        .filter(|_| options.resolve_textures)
        .map(TextureResolver::new);
    Ok(import_model(&model, options, textures.as_ref()))
}

/// Import an already decoded model
pub fn import_model(model: &FdsModel, options: &ImportOptions, textures: Option<&TextureResolver>) -> Imported {
    let mut importer = Importer::new(model, textures);
    importer.import_materials();
    for frame in &model.frames {
        importer.import_frame(frame);
    }
    if options.build_armatures {
        importer.build_armatures();
    } else if !importer.skinned.is_empty() {
        debug!(meshes = importer.skinned.len(), "Armature building disabled");
    }
    importer.resolve_parents();
    importer.finish()
}

/// One joint frame as seen by armature construction
#[derive(Debug, Clone, PartialEq)]
pub struct JointRecord {
    pub frame_index: u16,
    pub name: String,
    /// Parent joint frame, `None` when the joint hangs off the mesh
    pub parent: Option<u16>,
    pub transform: Transform,
    pub matrix: Mat4x4,
    pub bone_id: u32,
}

impl JointRecord {
    pub fn from_frame(frame: &Frame, parent: Option<u16>) -> Option<Self> {
        let FramePayload::Joint { matrix, bone_id } = &frame.payload else {
            return None;
        };
        let header = &frame.header;
        Some(Self {
            frame_index: frame.index,
            name: header.name.clone(),
            parent,
            transform: Transform::new(header.position, header.rotation, header.scale),
            matrix: *matrix,
            bone_id: *bone_id,
        })
    }
}

/// Build the armature of one skinned mesh
///
/// Bone 0 is a base bone named after the mesh. Joints attached to the mesh
/// hang off it and must all share one scale, which becomes the armature
/// scale. Every other joint must be unscaled. Heads accumulate parent
/// heads; tails point 0.15 units along the joint's local Y axis.
///
/// Returns the armature and its scale, or [`Error::NonUniformScale`].
pub fn build_armature(mesh_name: &str, joints: &[JointRecord]) -> Result<(Armature, Vec3)> {
    let mut armature = Armature {
        base_bone: mesh_name.to_string(),
        bones: vec![Bone {
            name: mesh_name.to_string(),
            parent: None,
            head: Vec3::new(0.0, -0.3, 0.0),
            tail: Vec3::ZERO,
            bone_id: None,
            rest: Transform::IDENTITY,
            matrix: Mat4x4::IDENTITY,
            inverse_bind: None,
        }],
    };

    let mut bone_of_frame: HashMap<u16, usize> = HashMap::new();
    let mut root_scale: Option<Vec3> = None;

    for joint in parents_first(joints) {
        let scale = joint.transform.scale;
        match joint.parent {
            None => match root_scale {
                Some(expected) if !expected.abs_diff_eq(scale, SCALE_EPSILON) => {
                    return Err(Error::NonUniformScale {
                        armature: mesh_name.to_string(),
                        bone: joint.name.clone(),
                        expected,
                        found: scale,
                    });
                }
                Some(_) => {}
                None => root_scale = Some(scale),
            },
            Some(_) if !scale.abs_diff_eq(Vec3::ONE, SCALE_EPSILON) => {
                return Err(Error::NonUniformScale {
                    armature: mesh_name.to_string(),
                    bone: joint.name.clone(),
                    expected: Vec3::ONE,
                    found: scale,
                });
            }
            Some(_) => {}
        }

        let parent_bone = joint.parent.and_then(|frame| bone_of_frame.get(&frame).copied());
        let (parent, head) = match parent_bone {
            Some(index) => (index, armature.bones[index].head + joint.transform.position),
            None => (0, joint.transform.position),
        };

        let forward = (glam::Quat::from(joint.transform.rotation) * glam::Vec3::Y)
            .try_normalize()
            .unwrap_or(glam::Vec3::Y);
        let tail = head + Vec3::from(forward) * BONE_TAIL_LENGTH;

        bone_of_frame.insert(joint.frame_index, armature.bones.len());
        armature.bones.push(Bone {
            name: joint.name.clone(),
            parent: Some(parent),
            head,
            tail,
            bone_id: Some(joint.bone_id),
            rest: joint.transform,
            matrix: joint.matrix,
            inverse_bind: None,
        });
    }

    Ok((armature, root_scale.unwrap_or(Vec3::ONE)))
}

/// Joints ordered so that parents precede their children
fn parents_first(joints: &[JointRecord]) -> Vec<&JointRecord> {
    let by_frame: HashMap<u16, &JointRecord> = joints.iter().map(|j| (j.frame_index, j)).collect();
    let depth = |joint: &JointRecord| {
        let mut depth = 0usize;
        let mut current = joint;
        while let Some(parent) = current.parent.and_then(|p| by_frame.get(&p).copied()) {
            depth += 1;
            if depth > joints.len() {
                break;
            }
            current = parent;
        }
        depth
    };

    let mut ordered: Vec<&JointRecord> = joints.iter().collect();
    ordered.sort_by_cached_key(|joint| depth(*joint));
    ordered
}

/// Skin-record bone names, resolved through joint bone ids
struct BoneNames {
    by_id: HashMap<u32, String>,
    /// Names ordered by bone id
    ordered: Vec<String>,
}

impl BoneNames {
    fn new(joints: &[JointRecord]) -> Self {
        let mut sorted: Vec<&JointRecord> = joints.iter().collect();
        sorted.sort_by_key(|j| j.bone_id);
        Self {
            by_id: joints.iter().map(|j| (j.bone_id, j.name.clone())).collect(),
            ordered: sorted.into_iter().map(|j| j.name.clone()).collect(),
        }
    }

    fn resolve(&self, declaration: usize, bone_id: u32, report: &mut ImportReport) -> String {
        if let Some(name) = self.by_id.get(&bone_id) {
            return name.clone();
        }
        if let Some(name) = self.ordered.get(declaration) {
            report.warn(format!(
                "skin bone id {bone_id} has no joint; using bone {declaration} ('{name}') by position"
            ));
            return name.clone();
        }
        report.warn(format!("skin bone id {bone_id} has no joint"));
        format!("unknown_bone_{bone_id}")
    }
}

/// A skinned visual waiting for its armature
struct SkinnedMesh<'m> {
    frame: &'m Frame,
    node: NodeId,
    /// Scene node per object LOD, `None` for skipped levels
    lods: Vec<Option<NodeId>>,
    skin: &'m [SkinLod],
}

struct Importer<'m> {
    model: &'m FdsModel,
    textures: Option<&'m TextureResolver>,
    scene: SceneGraph,
    report: ImportReport,
    /// Frame index to the node created for it
    nodes: HashMap<u16, NodeId>,
    /// Joint frame index to its bone
    bones: HashMap<u16, (NodeId, String)>,
    materials: HashMap<MaterialId, usize>,
    joints: Vec<&'m Frame>,
    skinned: Vec<SkinnedMesh<'m>>,
    /// (child, parent) frame indices
    deferred: Vec<(u16, u16)>,
}

impl<'m> Importer<'m> {
    fn new(model: &'m FdsModel, textures: Option<&'m TextureResolver>) -> Self {
        Self {
            model,
            textures,
            scene: SceneGraph::new(),
            report: ImportReport::default(),
            nodes: HashMap::new(),
            bones: HashMap::new(),
            materials: HashMap::new(),
            joints: Vec::new(),
            skinned: Vec::new(),
            deferred: Vec::new(),
        }
    }

    fn finish(mut self) -> Imported {
        if let Some(truncation) = &self.model.truncated {
            self.report.warn(format!(
                "frame list stopped at frame {} of {} (offset {}): {}",
                truncation.frame_index, self.model.declared_frames, truncation.offset, truncation.reason
            ));
        }
        self.report.truncated = self.model.truncated.clone();
        self.report.animated = self.model.animated;
        if self.model.animated {
            debug!("Animation flag set; animation data is not decoded");
        }
        self.scene.animated = self.model.animated;

        Imported {
            scene: self.scene,
            report: self.report,
        }
    }

    // ==================== Materials ====================

    fn import_materials(&mut self) {
        for (index, material) in self.model.materials.iter().enumerate() {
            let mut scene_material = SceneMaterial::from_material(material);
            if let Some(textures) = self.textures {
                let descriptor = &scene_material.descriptor;
                scene_material.diffuse_path = self.resolve_texture(textures, descriptor.diffuse_texture.as_deref());
                scene_material.alpha_path = self.resolve_texture(textures, descriptor.alpha_texture.as_deref());
                scene_material.env_path = self.resolve_texture(textures, descriptor.env_texture.as_deref());
            }
            let scene_index = self.scene.add_material(scene_material);
            self.materials.insert(MaterialId(index), scene_index);
        }
    }

    fn resolve_texture(&mut self, textures: &TextureResolver, name: Option<&str>) -> Option<PathBuf> {
        let name = name.filter(|n| !n.is_empty())?;
        match textures.resolve(name) {
            Ok(path) => Some(path),
            Err(err) => {
                self.report.warn(err.to_string());
                None
            }
        }
    }

    fn material_slot(&mut self, reference: u16) -> Option<usize> {
        if reference == 0 {
            return None;
        }
        let slot = self
            .model
            .material_id_by_ref(reference)
            .and_then(|id| self.materials.get(&id).copied());
        if slot.is_none() {
            self.report.warn(format!("material reference {reference} is outside the material table"));
        }
        slot
    }

    // ==================== Frames ====================

    fn import_frame(&mut self, frame: &'m Frame) {
        if let Some(parent) = frame.parent_index() {
            self.deferred.push((frame.index, parent));
        }

        let header = &frame.header;
        debug!(index = frame.index, name = %header.name, kind = ?frame.payload.kind(), "Importing frame");

        let node = match &frame.payload {
            FramePayload::Joint { .. } => {
                self.joints.push(frame);
                return;
            }
            FramePayload::Dummy(bounds) => {
                let mut node = SceneNode::new(
                    header.name.clone(),
                    NodeKind::Empty(EmptyDisplay::Cube {
                        size: bounds.half_extent(),
                    }),
                );
                node.set_property("bbox_min", bounds.min);
                node.set_property("bbox_max", bounds.max);
                self.add_frame_node(frame, node)
            }
            FramePayload::Target { flags, links } => {
                let mut node = SceneNode::new(header.name.clone(), NodeKind::Empty(EmptyDisplay::PlainAxes { size: 0.5 }));
                node.set_property("target_flags", PropertyValue::Int(i64::from(*flags)));
                node.set_property(
                    "link_ids",
                    PropertyValue::Ints(links.iter().map(|&id| i64::from(id)).collect()),
                );
                self.add_frame_node(frame, node)
            }
            FramePayload::Sector(sector) => self.import_sector(frame, sector),
            FramePayload::Occluder(occluder) => self.import_occluder(frame, occluder),
            FramePayload::Object(object)
            | FramePayload::Billboard { object, .. }
            | FramePayload::SingleMesh { object, .. }
            | FramePayload::SingleMorph { object, .. }
            | FramePayload::Morph { object, .. } => self.import_visual(frame, object),
        };

        self.nodes.insert(frame.index, node);
    }

    /// Add the node for a frame with the header's transform and metadata
    fn add_frame_node(&mut self, frame: &Frame, mut node: SceneNode) -> NodeId {
        let header = &frame.header;
        node.transform = Transform::new(header.position, header.rotation, header.scale);
        if !header.user_properties.is_empty() {
            node.set_property("user_properties", header.user_properties.as_str());
        }
        if let Some(visual) = header.visual {
            let [a, b] = visual.render_flags;
            node.set_property("render_flags", PropertyValue::Ints(vec![i64::from(a), i64::from(b)]));
        }
        self.scene.add_node(node)
    }

    fn import_visual(&mut self, frame: &'m Frame, object: &'m Object) -> NodeId {
        let name = frame.name();
        let mut base = SceneNode::new(name, NodeKind::Mesh(MeshData::default()));

        if let Some(lod) = object.lods.first() {
            let mesh = self.mesh_from_lod(name, lod);
            base.set_property("clipping_range", PropertyValue::Float(lod.clipping_range));
            base.kind = NodeKind::Mesh(mesh);
        }

        match &frame.payload {
            FramePayload::Object(_) => {
                if frame.header.visual_type() == Some(VisualType::LitObject) {
                    base.set_property("lit_object", PropertyValue::Bool(true));
                }
                if let Some(mesh) = base.mesh_mut() {
                    mesh.wireframe = mesh.material_slots.iter().all(Option::is_none);
                }
            }
            FramePayload::Billboard {
                rotation_axis,
                rotation_mode,
                ..
            } => {
                base.set_property("billboard_axis", PropertyValue::Int(i64::from(*rotation_axis)));
                base.set_property("billboard_mode", PropertyValue::Int(i64::from(*rotation_mode)));
            }
            _ => {}
        }

        let base_id = self.add_frame_node(frame, base);

        let mut lods = vec![Some(base_id)];
        for (level, lod) in object.lods.iter().enumerate().skip(1) {
            if lod.skipped {
                lods.push(None);
                continue;
            }
            let lod_name = format!("{name}_lod{level}");
            let mesh = self.mesh_from_lod(&lod_name, lod);
            let mut node = SceneNode::new(lod_name, NodeKind::Mesh(mesh));
            node.parent = Some(Parent::Node(base_id));
            node.hidden = true;
            node.set_property("clipping_range", PropertyValue::Float(lod.clipping_range));
            lods.push(Some(self.scene.add_node(node)));
        }

        if let Some(morph) = frame.payload.morph() {
            self.apply_morph(name, object, &lods, morph);
        }
        if let Some(skin) = frame.payload.skin() {
            self.skinned.push(SkinnedMesh {
                frame,
                node: base_id,
                lods,
                skin,
            });
        }

        base_id
    }

    fn mesh_from_lod(&mut self, name: &str, lod: &Lod) -> MeshData {
        let vertex_count = lod.vertices.len();
        let mut mesh = MeshData {
            positions: lod.vertices.iter().map(|v| v.position).collect(),
            normals: lod.vertices.iter().map(|v| v.normal).collect(),
            has_uvs: true,
            ..MeshData::default()
        };

        let mut seen: HashSet<[u16; 3]> = HashSet::new();
        let (mut duplicates, mut degenerate, mut out_of_range) = (0usize, 0usize, 0usize);

        for group in &lod.face_groups {
            let slot = mesh.material_slots.len();
            let material = self.material_slot(group.material);
            mesh.material_slots.push(material);

            for face in &group.faces {
                if face.iter().any(|&i| i as usize >= vertex_count) {
                    out_of_range += 1;
                    continue;
                }
                if face[0] == face[1] || face[1] == face[2] || face[0] == face[2] {
                    degenerate += 1;
                    continue;
                }
                let mut key = *face;
                key.sort_unstable();
                if !seen.insert(key) {
                    duplicates += 1;
                    continue;
                }
                let uvs = face.map(|i| lod.vertices[i as usize].uv);
                mesh.polygons.push(Polygon::triangle(face.map(u32::from), uvs, slot));
            }
        }

        if duplicates > 0 {
            self.report.warn(format!("skipped {duplicates} duplicate triangles in '{name}'"));
        }
        if degenerate > 0 {
            self.report.warn(format!("skipped {degenerate} degenerate triangles in '{name}'"));
        }
        if out_of_range > 0 {
            self.report.warn(format!("skipped {out_of_range} triangles with out-of-range indices in '{name}'"));
        }
        mesh
    }

    fn apply_morph(&mut self, name: &str, object: &Object, lods: &[Option<NodeId>], morph: &MorphSet) {
        if morph.is_empty() {
            return;
        }
        if morph.lods.len() != object.lods.len() {
            self.report.warn(format!(
                "morph of '{name}' has {} LODs, the mesh has {}",
                morph.lods.len(),
                object.lods.len()
            ));
        }

        let target_count = morph.target_count as usize;
        for (level, morph_lod) in morph.lods.iter().enumerate() {
            let Some(Some(node)) = lods.get(level).copied() else {
                continue;
            };
            let Some(mesh) = self.scene.node_mut(node).and_then(SceneNode::mesh_mut) else {
                continue;
            };

            let vertex_count = mesh.vertex_count();
            let mut ignored = 0usize;
            for (channel_index, channel) in morph_lod.channels.iter().enumerate() {
                if channel.is_empty() {
                    continue;
                }
                for target in 0..target_count {
                    let mut positions = mesh.positions.clone();
                    for (i, targets) in channel.vertices.iter().enumerate() {
                        let vertex = channel.vertex_index(i);
                        match (positions.get_mut(vertex), targets.get(target)) {
                            (Some(slot), Some(morphed)) => *slot = morphed.position,
                            _ => ignored += 1,
                        }
                    }
                    let key = ShapeKeyName::new(target, level, channel_index);
                    mesh.add_shape_key(key.to_string(), positions);
                }
            }

            if ignored > 0 {
                self.report.warn(format!(
                    "{ignored} morph vertices of '{name}' LOD {level} fall outside its {vertex_count} vertices"
                ));
            }
        }
    }

    fn import_sector(&mut self, frame: &Frame, sector: &Sector) -> NodeId {
        let name = frame.name();
        let mesh = self.wire_mesh(name, &sector.vertices, &sector.faces);
        let mut node = SceneNode::new(name, NodeKind::Mesh(mesh));
        node.set_property(
            "flags",
            PropertyValue::Ints(sector.flags.iter().map(|&f| i64::from(f)).collect()),
        );
        node.set_property("min_bounds", sector.bounds.min);
        node.set_property("max_bounds", sector.bounds.max);
        node.set_property("num_portals", PropertyValue::Int(sector.portals.len() as i64));
        let sector_id = self.add_frame_node(frame, node);

        for (i, portal) in sector.portals.iter().enumerate() {
            let mesh = MeshData {
                positions: portal.vertices.clone(),
                wireframe: true,
                ..MeshData::default()
            };
            let mut node = SceneNode::new(format!("{name}_Portal{i}"), NodeKind::Mesh(mesh));
            node.parent = Some(Parent::Node(sector_id));
            node.set_property("is_portal", PropertyValue::Bool(true));
            node.set_property("plane", PropertyValue::Floats(portal.plane.to_array().to_vec()));
            node.set_property("flags", PropertyValue::Int(i64::from(portal.flags)));
            node.set_property("near_range", PropertyValue::Float(portal.near_range));
            node.set_property("far_range", PropertyValue::Float(portal.far_range));
            if let Some(extra) = portal.extra {
                node.set_property("portal_extra", PropertyValue::Int(i64::from(extra)));
            }
            self.scene.add_node(node);
        }

        sector_id
    }

    fn import_occluder(&mut self, frame: &Frame, occluder: &Occluder) -> NodeId {
        let mesh = self.wire_mesh(frame.name(), &occluder.vertices, &occluder.faces);
        let mut node = SceneNode::new(frame.name(), NodeKind::Mesh(mesh));
        node.set_property("occluder", PropertyValue::Bool(true));
        self.add_frame_node(frame, node)
    }

    /// Untextured mesh for sectors and occluders
    fn wire_mesh(&mut self, name: &str, vertices: &[Vec3], faces: &[[u16; 3]]) -> MeshData {
        let (valid, invalid): (Vec<&[u16; 3]>, Vec<&[u16; 3]>) =
            faces.iter().partition(|face| face.iter().all(|&i| (i as usize) < vertices.len()));
        if !invalid.is_empty() {
            self.report.warn(format!(
                "skipped {} faces with out-of-range indices in '{name}'",
                invalid.len()
            ));
        }

        MeshData {
            positions: vertices.to_vec(),
            polygons: valid
                .into_iter()
                .map(|face| Polygon {
                    corners: face.iter().map(|&i| u32::from(i)).collect(),
                    uvs: Default::default(),
                    material_slot: 0,
                })
                .collect(),
            wireframe: true,
            ..MeshData::default()
        }
    }

    // ==================== Armatures ====================

    /// Non-joint frame a joint chain hangs from
    fn joint_owner(&self, joint: &Frame) -> Option<u16> {
        let mut current = joint;
        for _ in 0..=self.model.frames.len() {
            let parent_index = current.parent_index().filter(|&p| p != current.index)?;
            let parent = self.model.frame(parent_index)?;
            if !parent.is_joint() {
                return Some(parent.index);
            }
            current = parent;
        }
        None
    }

    fn build_armatures(&mut self) {
        let skinned = std::mem::take(&mut self.skinned);

        let mut owned: HashMap<u16, Vec<JointRecord>> = HashMap::new();
        for &joint in &self.joints {
            let Some(owner) = self.joint_owner(joint) else {
                continue;
            };
            // Joints hanging off the mesh have no parent bone
            let parent = joint.parent_index().filter(|&p| p != owner);
            if let Some(record) = JointRecord::from_frame(joint, parent) {
                owned.entry(owner).or_default().push(record);
            }
        }

        for mesh in &skinned {
            let joints = owned.remove(&mesh.frame.index).unwrap_or_default();
            self.rig(mesh, &joints);
        }

        for joint in &self.joints {
            if !self.bones.contains_key(&joint.index) {
                self.report.warn(format!(
                    "joint '{}' (frame {}) belongs to no armature",
                    joint.name(),
                    joint.index
                ));
            }
        }
    }

    fn rig(&mut self, mesh: &SkinnedMesh<'m>, joints: &[JointRecord]) {
        let name = mesh.frame.name();
        let (mut armature, scale) = match build_armature(name, joints) {
            Ok(built) => built,
            Err(err) => {
                self.report.warn(format!("{err}; keeping '{name}' without its armature"));
                return;
            }
        };

        let names = BoneNames::new(joints);
        let resolved: Vec<Vec<String>> = mesh
            .skin
            .iter()
            .map(|lod| {
                lod.bones
                    .iter()
                    .enumerate()
                    .map(|(i, bone)| names.resolve(i, bone.bone_id, &mut self.report))
                    .collect()
            })
            .collect();

        if let (Some(skin), Some(bone_names)) = (mesh.skin.first(), resolved.first()) {
            for (record, bone_name) in skin.bones.iter().zip(bone_names) {
                if let Some(index) = armature.bone_index(bone_name) {
                    armature.bones[index].inverse_bind = Some(record.inverse_bind);
                }
            }
        }

        let base_bone = armature.base_bone.clone();
        let mut node = SceneNode::new(format!("{name}_armature"), NodeKind::Armature(armature));
        node.transform.scale = scale;
        node.parent = Some(Parent::Node(mesh.node));
        let armature_id = self.scene.add_node(node);

        for joint in joints {
            self.bones.insert(joint.frame_index, (armature_id, joint.name.clone()));
        }

        for ((lod_node, skin), bone_names) in mesh.lods.iter().zip(mesh.skin).zip(&resolved) {
            if let Some(lod_node) = lod_node {
                self.apply_skin(*lod_node, armature_id, &base_bone, skin, bone_names);
            }
        }
    }

    fn apply_skin(&mut self, node: NodeId, armature: NodeId, base_bone: &str, skin: &SkinLod, bone_names: &[String]) {
        let Some(scene_node) = self.scene.node_mut(node) else {
            return;
        };
        let node_name = scene_node.name.clone();
        let Some(mesh) = scene_node.mesh_mut() else {
            return;
        };
        mesh.armature = Some(armature);

        let layout = skin.layout(mesh.vertex_count());
        for span in &layout.spans {
            let record = &skin.bones[span.bone];
            let group = mesh.vertex_group_mut(&bone_names[span.bone]);
            for vertex in span.locked.clone() {
                group.weights.insert(vertex as u32, 1.0);
            }
            for (vertex, &weight) in span.weighted.clone().zip(&record.weights) {
                group.weights.insert(vertex as u32, weight);
            }
        }
        if !layout.base.is_empty() {
            let group = mesh.vertex_group_mut(base_bone);
            for vertex in layout.base.clone() {
                group.weights.insert(vertex as u32, 1.0);
            }
        }

        if layout.overflow > 0 {
            self.report.warn(format!(
                "skin of '{node_name}' claims {} more vertices than the mesh has",
                layout.overflow
            ));
        }
        debug!(mesh = %node_name, bones = layout.spans.len(), base = layout.base.len(), "Applied skin");
    }

    // ==================== Parenting ====================

    fn resolve_parents(&mut self) {
        for (child, parent) in std::mem::take(&mut self.deferred) {
            if child == parent {
                debug!(frame = child, "Ignoring self-parented frame");
                continue;
            }
            // Joints are placed by their armature
            let Some(&child_node) = self.nodes.get(&child) else {
                continue;
            };

            let link = if let Some(&parent_node) = self.nodes.get(&parent) {
                Parent::Node(parent_node)
            } else if let Some((armature, bone)) = self.bones.get(&parent) {
                Parent::Bone {
                    armature: *armature,
                    bone: bone.clone(),
                }
            } else {
                let err = Error::invalid_reference(format!("frame {child} names parent {parent}, which was not imported"));
                self.report.warn(err.to_string());
                continue;
            };

            if let Some(node) = self.scene.node_mut(child_node) {
                node.parent = Some(link);
            }
        }
    }
}

/// Import with file context on every error
pub fn import_file_with_context(path: &Path, options: &ImportOptions) -> Result<Imported> {
    import_file(path, options).with_context(|| format!("importing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ls3d_core::Quat;

    fn joint(frame_index: u16, name: &str, parent: Option<u16>, position: Vec3, scale: Vec3) -> JointRecord {
        JointRecord {
            frame_index,
            name: name.to_string(),
            parent,
            transform: Transform::new(position, Quat::IDENTITY, scale),
            matrix: Mat4x4::IDENTITY,
            bone_id: u32::from(frame_index),
        }
    }

    #[test]
    fn test_armature_heads_accumulate() {
        let joints = [
            joint(2, "hip", None, Vec3::new(0.0, 0.0, 1.0), Vec3::ONE),
            joint(3, "knee", Some(2), Vec3::new(0.0, 0.0, -0.5), Vec3::ONE),
        ];
        let (armature, scale) = build_armature("man", &joints).unwrap();

        assert_eq!(scale, Vec3::ONE);
        assert_eq!(armature.base_bone, "man");
        assert_eq!(armature.bones.len(), 3);

        let knee = armature.bone("knee").unwrap();
        assert!(knee.head.abs_diff_eq(Vec3::new(0.0, 0.0, 0.5), 1e-6));
        assert!(knee.tail.abs_diff_eq(Vec3::new(0.0, 0.15, 0.5), 1e-6));
        assert_eq!(knee.parent, armature.bone_index("hip"));
        assert_eq!(armature.bone("hip").unwrap().parent, Some(0));
    }

    #[test]
    fn test_child_listed_before_parent() {
        let joints = [
            joint(5, "hand", Some(4), Vec3::new(1.0, 0.0, 0.0), Vec3::ONE),
            joint(4, "arm", None, Vec3::new(1.0, 0.0, 0.0), Vec3::ONE),
        ];
        let (armature, _) = build_armature("man", &joints).unwrap();

        let hand = armature.bone("hand").unwrap();
        assert!(hand.head.abs_diff_eq(Vec3::new(2.0, 0.0, 0.0), 1e-6));
    }

    #[test]
    fn test_root_scales_must_match() {
        let joints = [
            joint(2, "a", None, Vec3::ZERO, Vec3::new(2.0, 2.0, 2.0)),
            joint(3, "b", None, Vec3::ZERO, Vec3::new(2.0, 2.0, 2.0)),
        ];
        let (_, scale) = build_armature("m", &joints).unwrap();
        assert_eq!(scale, Vec3::new(2.0, 2.0, 2.0));

        let joints = [
            joint(2, "a", None, Vec3::ZERO, Vec3::new(2.0, 2.0, 2.0)),
            joint(3, "b", None, Vec3::ZERO, Vec3::ONE),
        ];
        let err = build_armature("m", &joints).unwrap_err();
        assert!(matches!(err, Error::NonUniformScale { ref bone, .. } if bone == "b"));
    }

    #[test]
    fn test_scaled_child_joint_rejected() {
        let joints = [
            joint(2, "a", None, Vec3::ZERO, Vec3::ONE),
            joint(3, "b", Some(2), Vec3::ZERO, Vec3::new(1.0, 3.0, 1.0)),
        ];
        assert!(matches!(
            build_armature("m", &joints),
            Err(Error::NonUniformScale { .. })
        ));
    }

    #[test]
    fn test_bone_names_fallbacks() {
        let joints = [joint(7, "spine", None, Vec3::ZERO, Vec3::ONE)];
        let names = BoneNames::new(&joints);
        let mut report = ImportReport::default();

        assert_eq!(names.resolve(0, 7, &mut report), "spine");
        assert!(report.warnings.is_empty());

        assert_eq!(names.resolve(0, 99, &mut report), "spine");
        assert_eq!(names.resolve(3, 99, &mut report), "unknown_bone_99");
        assert_eq!(report.warnings.len(), 2);
    }
}
