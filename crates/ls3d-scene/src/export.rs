// ls3d-scene/src/export.rs
//! Building a 4DS model from a [`SceneGraph`]
//!
//! Frame indices are assigned before anything is written: regular nodes
//! first in scene order, then one joint frame per non-base bone of each
//! armature. Parent links can therefore point forward.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Seek, Write};
use std::path::Path;

use ls3d_core::{BoundingBox, Error, Mat4x4, Result, ResultExt, Vec2, Vec3, Vec4};
use ls3d_parsers::fds::primitives::{checked_count, face_from_slice};
use ls3d_parsers::fds::{
    filetime_now, FaceGroup, Lod, MorphChannel, MorphLod, MorphSet, MorphTarget, Object, Occluder, Portal, Sector,
    ShapeKeyName, SkinBone, SkinLod, Vertex,
};
use ls3d_parsers::{FdsModel, FdsVersion, FdsWriter, FormatWriter, FrameHeader, FramePayload, FrameType, VisualType};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::scene::{
    Armature, Bone, EmptyDisplay, MeshData, NodeId, NodeKind, Parent, Polygon, SceneGraph, SceneNode, VertexGroup,
};

/// Weights at or above this count as locked
const LOCKED_WEIGHT: f32 = 1.0 - 1.0e-6;
/// UV rounding used by vertex deduplication
const UV_PRECISION: f32 = 1.0e6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Header timestamp in FILETIME ticks; the current time when unset
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportReport {
    pub warnings: Vec<String>,
}

impl ExportReport {
    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

#[derive(Debug, Clone)]
pub struct Exported {
    pub model: FdsModel,
    pub report: ExportReport,
}

pub fn export_scene(scene: &SceneGraph, options: &ExportOptions) -> Result<Exported> {
    let mut exporter = Exporter::new(scene);
    exporter.collect()?;
    exporter.export_materials();
    exporter.export_nodes()?;
    exporter.export_joints();

    let mut model = exporter.model;
    model.timestamp = options.timestamp.unwrap_or_else(filetime_now);
    info!(
        frames = model.frames.len(),
        materials = model.materials.len(),
        warnings = exporter.report.warnings.len(),
        "Exported scene"
    );
    Ok(Exported {
        model,
        report: exporter.report,
    })
}

pub fn write_scene<W: Write + Seek>(scene: &SceneGraph, options: &ExportOptions, writer: W) -> Result<ExportReport> {
    let exported = export_scene(scene, options)?;
    FdsWriter::new().write(&exported.model, writer)?;
    Ok(exported.report)
}

pub fn write_scene_file(scene: &SceneGraph, options: &ExportOptions, path: &Path) -> Result<ExportReport> {
    let exported = export_scene(scene, options)?;
    FdsWriter::new()
        .write_file(&exported.model, path)
        .map_err(Error::from)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(exported.report)
}

/// Level of a `<base>_lod<n>` node below the mesh named `<base>`
fn lod_level(node: &SceneNode, parent: &SceneNode) -> Option<usize> {
    let (base, digits) = node.name.rsplit_once("_lod")?;
    if base != parent.name || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|&level| level > 0)
}

fn is_portal(node: &SceneNode) -> bool {
    node.flag("is_portal") || node.property("plane").is_some()
}

/// Next 1-based frame index; the frame count field is a u16
fn take_frame_index(next: &mut u32) -> Result<u16> {
    let index = checked_count(*next as usize, "frames")?;
    *next += 1;
    Ok(index)
}

/// Integer property narrowed to its field, `None` with a warning when it does not fit
fn narrow<T: TryFrom<i64>>(report: &mut ExportReport, node: &str, key: &str, value: i64) -> Option<T> {
    match T::try_from(value) {
        Ok(value) => Some(value),
        Err(_) => {
            report.warn(format!("'{node}' property {key} = {value} is out of range; writing 0"));
            None
        }
    }
}

/// Skin bone id written for the bone at `index`
fn bone_id(index: usize, bone: &Bone) -> u32 {
    bone.bone_id.unwrap_or(index.saturating_sub(1) as u32)
}

/// Object-to-bone matrix from the chain of rest transforms
fn rest_inverse_bind(armature: &Armature, index: usize) -> Mat4x4 {
    let mut world = glam::Mat4::IDENTITY;
    let mut current = Some(index);
    let mut steps = 0;
    while let Some(i) = current.filter(|&i| i != 0) {
        let Some(bone) = armature.bones.get(i) else {
            break;
        };
        world = bone.rest.to_matrix() * world;
        current = bone.parent;
        steps += 1;
        if steps > armature.bones.len() {
            break;
        }
    }
    Mat4x4::from_glam(world.inverse())
}

/// One exported LOD plus the scene vertex behind each stored vertex
/// Dedup key of one flattened vertex
fn uv_key(source: u32, uv: Vec2) -> (u32, i64, i64) {
    (
        source,
        (uv.x * UV_PRECISION).round() as i64,
        (uv.y * UV_PRECISION).round() as i64,
    )
}

struct LodBuild {
    lod: Lod,
    sources: Vec<u32>,
}

impl LodBuild {
    /// Reorder stored vertices; `order[new] = old`
    fn permute(&mut self, order: &[usize]) {
        let mut new_of_old = vec![0u16; order.len()];
        for (new, &old) in order.iter().enumerate() {
            new_of_old[old] = new as u16;
        }
        self.lod.vertices = order.iter().map(|&old| self.lod.vertices[old]).collect();
        self.sources = order.iter().map(|&old| self.sources[old]).collect();
        for group in &mut self.lod.face_groups {
            for face in &mut group.faces {
                *face = face.map(|i| new_of_old[i as usize]);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SkinOwner {
    Locked(usize),
    Weighted(usize, f32),
    Base,
}

struct Exporter<'s> {
    scene: &'s SceneGraph,
    model: FdsModel,
    report: ExportReport,
    /// Scene material index to 1-based table reference
    material_refs: Vec<u16>,
    /// Nodes written as frames, in frame order
    order: Vec<NodeId>,
    frames: HashMap<NodeId, u16>,
    /// Extra LOD nodes per base mesh, by level
    lods: HashMap<NodeId, BTreeMap<usize, NodeId>>,
    portals: HashMap<NodeId, Vec<NodeId>>,
    /// (armature node, bone index) in frame order
    joint_order: Vec<(NodeId, usize)>,
    joints: HashMap<(NodeId, usize), u16>,
    /// Frame each armature's root joints hang from
    owners: HashMap<NodeId, u16>,
}

impl<'s> Exporter<'s> {
    fn new(scene: &'s SceneGraph) -> Self {
        let mut model = FdsModel::new(FdsVersion::Mafia);
        model.animated = false;
        Self {
            scene,
            model,
            report: ExportReport::default(),
            material_refs: Vec::new(),
            order: Vec::new(),
            frames: HashMap::new(),
            lods: HashMap::new(),
            portals: HashMap::new(),
            joint_order: Vec::new(),
            joints: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    // ==================== Planning ====================

    fn collect(&mut self) -> Result<()> {
        let scene = self.scene;
        let mut absorbed: HashSet<NodeId> = HashSet::new();
        for (id, node) in scene.iter() {
            let Some(parent_id) = node.parent_node() else {
                continue;
            };
            let Some(parent) = scene.node(parent_id) else {
                continue;
            };
            if node.mesh().is_none() || parent.mesh().is_none() {
                continue;
            }
            if let Some(level) = lod_level(node, parent) {
                self.lods.entry(parent_id).or_default().insert(level, id);
                absorbed.insert(id);
            } else if is_portal(node) {
                self.portals.entry(parent_id).or_default().push(id);
                absorbed.insert(id);
            }
        }

        let mut next: u32 = 1;
        let mut armatures = Vec::new();
        for (id, node) in scene.iter() {
            if absorbed.contains(&id) {
                continue;
            }
            if let NodeKind::Armature(_) = node.kind {
                armatures.push(id);
                continue;
            }
            self.order.push(id);
            self.frames.insert(id, take_frame_index(&mut next)?);
        }

        for id in armatures {
            let Some(node) = scene.node(id) else {
                continue;
            };
            let Some(armature) = node.armature() else {
                continue;
            };
            let owner = node.parent_node().and_then(|p| self.frames.get(&p).copied());
            if owner.is_none() {
                self.report
                    .warn(format!("armature '{}' is not attached to an exported mesh", node.name));
            }
            self.owners.insert(id, owner.unwrap_or(0));
            for index in 1..armature.bones.len() {
                self.joint_order.push((id, index));
                self.joints.insert((id, index), take_frame_index(&mut next)?);
            }
        }

        debug!(
            frames = self.order.len(),
            joints = self.joint_order.len(),
            lod_nodes = self.lods.values().map(BTreeMap::len).sum::<usize>(),
            "Planned frame indices"
        );
        Ok(())
    }

    fn export_materials(&mut self) {
        for material in &self.scene.materials {
            let reference = self.model.push_material(material.descriptor.to_material());
            self.material_refs.push(reference);
        }
    }

    // ==================== Headers ====================

    fn parent_index(&mut self, node: &SceneNode) -> u16 {
        match &node.parent {
            None => 0,
            Some(Parent::Node(parent)) => {
                if let Some(&frame) = self.frames.get(parent).or_else(|| self.owners.get(parent)) {
                    frame
                } else {
                    self.report
                        .warn(format!("parent of '{}' is not exported; writing it unparented", node.name));
                    0
                }
            }
            Some(Parent::Bone { armature, bone }) => {
                let owner = self.owners.get(armature).copied().unwrap_or(0);
                let index = self
                    .scene
                    .node(*armature)
                    .and_then(SceneNode::armature)
                    .and_then(|a| a.bone_index(bone));
                match index {
                    Some(0) => owner,
                    Some(index) => self.joints.get(&(*armature, index)).copied().unwrap_or(owner),
                    None => {
                        self.report
                            .warn(format!("bone '{bone}' parenting '{}' does not exist", node.name));
                        owner
                    }
                }
            }
        }
    }

    fn header(&mut self, mut header: FrameHeader, node: &SceneNode) -> FrameHeader {
        header.parent_index = self.parent_index(node);
        header.position = node.transform.position;
        header.rotation = node.transform.rotation;
        header.scale = node.transform.scale;
        if let Some(text) = node.property("user_properties").and_then(|p| p.as_text()) {
            header.user_properties = text.to_string();
        }
        if let (Some(visual), Some(flags)) = (
            header.visual.as_mut(),
            node.property("render_flags").and_then(|p| p.as_ints()),
        ) {
            for (slot, &value) in visual.render_flags.iter_mut().zip(flags) {
                *slot = narrow(&mut self.report, &node.name, "render_flags", value).unwrap_or(0);
            }
        }
        header
    }

    // ==================== Frames ====================

    fn export_nodes(&mut self) -> Result<()> {
        let scene = self.scene;
        let order = std::mem::take(&mut self.order);
        for &id in &order {
            let Some(node) = scene.node(id) else {
                continue;
            };
            let (header, payload) = match &node.kind {
                NodeKind::Empty(EmptyDisplay::Cube { size }) => {
                    let bounds = match (
                        node.property("bbox_min").and_then(|p| p.as_vec3()),
                        node.property("bbox_max").and_then(|p| p.as_vec3()),
                    ) {
                        (Some(min), Some(max)) => BoundingBox::new(min, max),
                        _ => BoundingBox::new(Vec3::ONE * -*size, Vec3::ONE * *size),
                    };
                    (FrameHeader::new(FrameType::Dummy, &node.name), FramePayload::Dummy(bounds))
                }
                NodeKind::Empty(EmptyDisplay::PlainAxes { .. }) => {
                    (FrameHeader::new(FrameType::Target, &node.name), self.target(node))
                }
                NodeKind::Mesh(mesh) => self
                    .mesh_frame(id, node, mesh)
                    .with_context(|| format!("exporting '{}'", node.name))?,
                NodeKind::Armature(_) => continue,
            };

            let header = self.header(header, node);
            let index = self.model.push_frame(header, payload);
            debug_assert_eq!(Some(&index), self.frames.get(&id));
        }
        Ok(())
    }

    fn target(&mut self, node: &SceneNode) -> FramePayload {
        let flags = node
            .property("target_flags")
            .and_then(|p| p.as_int())
            .and_then(|f| u16::try_from(f).ok())
            .unwrap_or(0);
        let mut links = Vec::new();
        for &id in node.property("link_ids").and_then(|p| p.as_ints()).unwrap_or(&[]) {
            match u16::try_from(id) {
                Ok(id) => links.push(id),
                Err(_) => self
                    .report
                    .warn(format!("link id {id} of '{}' does not fit a frame index", node.name)),
            }
        }
        FramePayload::Target { flags, links }
    }

    fn mesh_frame(&mut self, id: NodeId, node: &SceneNode, mesh: &MeshData) -> Result<(FrameHeader, FramePayload)> {
        let is_sector = node.property("num_portals").is_some() || self.portals.contains_key(&id);
        if is_sector {
            let sector = self.sector(id, node, mesh)?;
            return Ok((FrameHeader::new(FrameType::Sector, &node.name), FramePayload::Sector(sector)));
        }

        let is_occluder =
            node.flag("occluder") || (mesh.wireframe && !mesh.has_uvs && mesh.material_slots.is_empty());
        if is_occluder {
            let occluder = Occluder {
                vertices: mesh.positions.clone(),
                faces: raw_faces(mesh)?,
            };
            return Ok((FrameHeader::new(FrameType::Occluder, &node.name), FramePayload::Occluder(occluder)));
        }

        self.visual_frame(id, node, mesh)
    }

    fn sector(&mut self, id: NodeId, node: &SceneNode, mesh: &MeshData) -> Result<Sector> {
        let mut flags = [0u32; 2];
        if let Some(values) = node.property("flags").and_then(|p| p.as_ints()) {
            for (slot, &value) in flags.iter_mut().zip(values) {
                *slot = narrow(&mut self.report, &node.name, "flags", value).unwrap_or(0);
            }
        }
        let bounds = match (
            node.property("min_bounds").and_then(|p| p.as_vec3()),
            node.property("max_bounds").and_then(|p| p.as_vec3()),
        ) {
            (Some(min), Some(max)) => BoundingBox::new(min, max),
            _ => mesh.bounds(),
        };

        let scene = self.scene;
        let mut portals = Vec::new();
        for &portal_id in self.portals.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            let Some(portal) = scene.node(portal_id) else {
                continue;
            };
            let plane = match portal.property("plane").and_then(|p| p.as_floats()) {
                Some(&[x, y, z, w]) => Vec4::new(x, y, z, w),
                _ => Vec4::new(0.0, 0.0, 1.0, 0.0),
            };
            let float = |key: &str, default: f32| portal.property(key).and_then(|p| p.as_float()).unwrap_or(default);
            let portal_flags = match portal.property("flags").and_then(|p| p.as_int()) {
                Some(value) => narrow(&mut self.report, &portal.name, "flags", value).unwrap_or(0),
                None => 0,
            };
            let extra = match portal.property("portal_extra").and_then(|p| p.as_int()) {
                Some(value) => Some(narrow(&mut self.report, &portal.name, "portal_extra", value).unwrap_or(0)),
                None => None,
            };
            portals.push(Portal {
                plane,
                flags: portal_flags,
                near_range: float("near_range", 0.0),
                far_range: float("far_range", 100.0),
                extra,
                vertices: portal.mesh().map(|m| m.positions.clone()).unwrap_or_default(),
            });
        }

        Ok(Sector {
            flags,
            vertices: mesh.positions.clone(),
            faces: raw_faces(mesh)?,
            bounds,
            portals,
        })
    }

    fn visual_frame(&mut self, id: NodeId, node: &SceneNode, mesh: &MeshData) -> Result<(FrameHeader, FramePayload)> {
        let scene = self.scene;
        let mut levels: Vec<(&SceneNode, &MeshData)> = vec![(node, mesh)];
        for &lod_id in self.lods.get(&id).map(|lods| lods.values()).into_iter().flatten() {
            if let Some((lod_node, lod_mesh)) = scene.node(lod_id).and_then(|n| n.mesh().map(|m| (n, m))) {
                levels.push((lod_node, lod_mesh));
            }
        }

        let armature_id = mesh.armature;
        let armature = armature_id.and_then(|a| scene.node(a)).and_then(SceneNode::armature);
        if armature_id.is_some() && armature.is_none() {
            self.report
                .warn(format!("armature of '{}' is missing; writing it unskinned", node.name));
        }

        let mut builds = Vec::with_capacity(levels.len());
        let mut skins = Vec::new();
        for (level, (lod_node, lod_mesh)) in levels.iter().enumerate() {
            let clipping_range = lod_node
                .property("clipping_range")
                .and_then(|p| p.as_float())
                .unwrap_or(100.0 * (level + 1) as f32);
            let mut build = self.build_lod(&lod_node.name, lod_mesh, clipping_range)?;
            if let Some(armature) = armature {
                skins.push(self.skin_lod(&mut build, lod_mesh, armature));
            }
            builds.push(build);
        }

        let morph = self.morph(&node.name, &levels, &builds)?;
        let object = Object {
            instance_id: 0,
            lods: builds.into_iter().map(|b| b.lod).collect(),
        };

        let (visual_type, payload) = match (armature.is_some(), morph) {
            (true, Some(morph)) => (VisualType::SingleMorph, FramePayload::SingleMorph { object, skin: skins, morph }),
            (true, None) => (VisualType::SingleMesh, FramePayload::SingleMesh { object, skin: skins }),
            (false, Some(morph)) => (VisualType::Morph, FramePayload::Morph { object, morph }),
            (false, None) => match (
                node.property("billboard_axis").and_then(|p| p.as_int()),
                node.property("billboard_mode").and_then(|p| p.as_int()),
            ) {
                (Some(axis), mode) => (
                    VisualType::Billboard,
                    FramePayload::Billboard {
                        object,
                        rotation_axis: narrow(&mut self.report, &node.name, "billboard_axis", axis).unwrap_or(0),
                        rotation_mode: narrow(&mut self.report, &node.name, "billboard_mode", mode.unwrap_or(0))
                            .unwrap_or(0),
                    },
                ),
                (None, _) if node.flag("lit_object") => (VisualType::LitObject, FramePayload::Object(object)),
                (None, _) => (VisualType::Object, FramePayload::Object(object)),
            },
        };

        Ok((FrameHeader::visual(visual_type, &node.name), payload))
    }

    // ==================== Geometry ====================

    fn build_lod(&mut self, name: &str, mesh: &MeshData, clipping_range: f32) -> Result<LodBuild> {
        if !mesh.has_uvs && !mesh.polygons.is_empty() {
            self.report.warn(format!("'{name}' has no UV layer; writing (0, 0)"));
        }

        let vertex_count = mesh.vertex_count();
        let corner_uv = |polygon: &Polygon, corner: usize| if mesh.has_uvs { polygon.uv(corner) } else { Vec2::ZERO };

        // Stored vertex i is scene vertex i, carrying the first UV it is used with
        let mut first_uv: Vec<Option<Vec2>> = vec![None; vertex_count];
        for polygon in &mesh.polygons {
            for (corner, &source) in polygon.corners.iter().enumerate() {
                let Some(slot) = first_uv.get_mut(source as usize) else {
                    return Err(Error::invalid_data(format!(
                        "polygon corner {source} is outside the {vertex_count} vertices"
                    )));
                };
                if slot.is_none() {
                    *slot = Some(corner_uv(polygon, corner));
                }
            }
        }

        checked_count::<u16>(vertex_count, "vertices")?;
        let mut vertices: Vec<Vertex> = Vec::with_capacity(vertex_count);
        let mut sources: Vec<u32> = Vec::with_capacity(vertex_count);
        let mut dedup: HashMap<(u32, i64, i64), u16> = HashMap::new();
        for (source, uv) in first_uv.into_iter().enumerate() {
            let uv = uv.unwrap_or(Vec2::ZERO);
            let source = source as u32;
            dedup.insert(uv_key(source, uv), vertices.len() as u16);
            vertices.push(Vertex {
                position: mesh.positions[source as usize],
                normal: mesh.normals.get(source as usize).copied().unwrap_or_default(),
                uv,
            });
            sources.push(source);
        }

        let mut groups: BTreeMap<usize, Vec<[u16; 3]>> = BTreeMap::new();
        let mut seen: HashSet<[u16; 3]> = HashSet::new();
        let mut duplicates = 0usize;

        // UV seams split a vertex; the extra copies follow all scene vertices
        for polygon in &mesh.polygons {
            let mut corners: SmallVec<[u16; 4]> = SmallVec::new();
            for (corner, &source) in polygon.corners.iter().enumerate() {
                let uv = corner_uv(polygon, corner);
                let key = uv_key(source, uv);
                let index = match dedup.get(&key) {
                    Some(&index) => index,
                    None => {
                        let index: u16 = checked_count(vertices.len(), "vertices")?;
                        vertices.push(Vertex {
                            position: mesh.positions[source as usize],
                            normal: mesh.normals.get(source as usize).copied().unwrap_or_default(),
                            uv,
                        });
                        sources.push(source);
                        dedup.insert(key, index);
                        index
                    }
                };
                corners.push(index);
            }

            let face = face_from_slice(&corners)?;
            let mut key = face;
            key.sort_unstable();
            if !seen.insert(key) {
                duplicates += 1;
                continue;
            }
            groups.entry(polygon.material_slot).or_default().push(face);
        }

        if duplicates > 0 {
            self.report.warn(format!("skipped {duplicates} duplicate triangles in '{name}'"));
        }

        let face_groups = groups
            .into_iter()
            .map(|(slot, faces)| FaceGroup {
                faces,
                material: mesh
                    .material_slots
                    .get(slot)
                    .copied()
                    .flatten()
                    .and_then(|m| self.material_refs.get(m).copied())
                    .unwrap_or(0),
            })
            .collect();

        debug!(mesh = name, vertices = vertices.len(), scene_vertices = vertex_count, "Flattened LOD");
        Ok(LodBuild {
            lod: Lod {
                clipping_range,
                vertex_count: vertices.len(),
                vertices,
                face_groups,
                skipped: false,
            },
            sources,
        })
    }

    /// Reorder the LOD for the skin cursor and build its skin record
    fn skin_lod(&mut self, build: &mut LodBuild, mesh: &MeshData, armature: &Armature) -> SkinLod {
        let groups: Vec<Option<&VertexGroup>> = armature.bones.iter().map(|bone| mesh.vertex_group(&bone.name)).collect();
        let owners: Vec<SkinOwner> = build.sources.iter().map(|&source| skin_owner(&groups, source)).collect();

        let mut order = Vec::with_capacity(owners.len());
        let mut bones = Vec::with_capacity(armature.bones.len().saturating_sub(1));
        for (index, bone) in armature.bones.iter().enumerate().skip(1) {
            let locked: Vec<usize> = (0..owners.len())
                .filter(|&v| owners[v] == SkinOwner::Locked(index))
                .collect();
            let weighted: Vec<(usize, f32)> = owners
                .iter()
                .enumerate()
                .filter_map(|(v, owner)| match *owner {
                    SkinOwner::Weighted(b, w) if b == index => Some((v, w)),
                    _ => None,
                })
                .collect();

            let bounds = BoundingBox::from_points(
                locked
                    .iter()
                    .chain(weighted.iter().map(|(v, _)| v))
                    .map(|&v| &build.lod.vertices[v].position),
            );
            bones.push(SkinBone {
                inverse_bind: bone
                    .inverse_bind
                    .unwrap_or_else(|| rest_inverse_bind(armature, index)),
                locked_count: locked.len() as u32,
                bone_id: bone_id(index, bone),
                bounds,
                weights: weighted.iter().map(|&(_, w)| w).collect(),
            });
            order.extend(locked);
            order.extend(weighted.into_iter().map(|(v, _)| v));
        }

        let base: Vec<usize> = (0..owners.len()).filter(|&v| owners[v] == SkinOwner::Base).collect();
        let non_weighted_count = base.len() as u32;
        order.extend(base);
        build.permute(&order);

        SkinLod {
            non_weighted_count,
            bounds: BoundingBox::from_points(build.lod.vertices.iter().map(|v| &v.position)),
            bones,
        }
    }

    /// Morph record from `Target_<t>_LOD<l>_Channel<c>` shape keys
    fn morph(&mut self, name: &str, levels: &[(&SceneNode, &MeshData)], builds: &[LodBuild]) -> Result<Option<MorphSet>> {
        let mut keys: Vec<HashMap<(usize, usize), &[Vec3]>> = Vec::with_capacity(levels.len());
        let (mut targets, mut channels) = (0usize, 0usize);

        for (level, (lod_node, mesh)) in levels.iter().enumerate() {
            let mut level_keys = HashMap::new();
            for key in mesh.morph_keys() {
                let parsed: ShapeKeyName = match key.name.parse() {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        self.report.warn(format!("skipping shape key of '{}': {err}", lod_node.name));
                        continue;
                    }
                };
                if parsed.lod != level {
                    self.report.warn(format!(
                        "skipping shape key '{}': it sits on LOD {level} of '{name}'",
                        key.name
                    ));
                    continue;
                }
                if key.positions.len() != mesh.vertex_count() {
                    self.report.warn(format!(
                        "skipping shape key '{}' of '{}': {} positions for {} vertices",
                        key.name,
                        lod_node.name,
                        key.positions.len(),
                        mesh.vertex_count()
                    ));
                    continue;
                }
                targets = targets.max(parsed.target + 1);
                channels = channels.max(parsed.channel + 1);
                level_keys.insert((parsed.channel, parsed.target), key.positions.as_slice());
            }
            keys.push(level_keys);
        }

        if targets == 0 {
            return Ok(None);
        }
        let target_count: u8 = checked_count(targets, "morph targets")?;
        let channel_count: u8 = checked_count(channels, "morph channels")?;

        let lods = levels
            .iter()
            .zip(builds)
            .zip(&keys)
            .map(|(((_, mesh), build), level_keys)| {
                let channels = (0..channels)
                    .map(|channel| {
                        if !(0..targets).any(|t| level_keys.contains_key(&(channel, t))) {
                            return MorphChannel::default();
                        }
                        let vertices = build
                            .sources
                            .iter()
                            .map(|&source| {
                                let source = source as usize;
                                let normal = mesh.normals.get(source).copied().unwrap_or_default();
                                (0..targets)
                                    .map(|target| MorphTarget {
                                        position: level_keys
                                            .get(&(channel, target))
                                            .map_or(mesh.positions[source], |positions| positions[source]),
                                        normal,
                                    })
                                    .collect()
                            })
                            .collect();
                        MorphChannel { vertices, indices: None }
                    })
                    .collect();

                let bounds = BoundingBox::from_points(build.lod.vertices.iter().map(|v| &v.position));
                MorphLod {
                    channels,
                    bounds,
                    center: bounds.center(),
                    radius: bounds.size().length(),
                }
            })
            .collect();

        Ok(Some(MorphSet {
            target_count,
            channel_count,
            lods,
        }))
    }

    // ==================== Joints ====================

    fn export_joints(&mut self) {
        let scene = self.scene;
        for (armature_id, index) in std::mem::take(&mut self.joint_order) {
            let Some(bone) = scene
                .node(armature_id)
                .and_then(SceneNode::armature)
                .and_then(|a| a.bones.get(index))
            else {
                continue;
            };
            let owner = self.owners.get(&armature_id).copied().unwrap_or(0);
            let parent_index = match bone.parent {
                Some(parent) if parent != 0 => self.joints.get(&(armature_id, parent)).copied().unwrap_or(owner),
                _ => owner,
            };

            let header = FrameHeader {
                parent_index,
                position: bone.rest.position,
                rotation: bone.rest.rotation,
                scale: bone.rest.scale,
                ..FrameHeader::new(FrameType::Joint, &bone.name)
            };
            let payload = FramePayload::Joint {
                matrix: bone.matrix,
                bone_id: bone_id(index, bone),
            };
            let frame = self.model.push_frame(header, payload);
            debug_assert_eq!(Some(&frame), self.joints.get(&(armature_id, index)));
        }
    }
}

/// First bone holding the vertex fully, else the first holding it partially
fn skin_owner(groups: &[Option<&VertexGroup>], source: u32) -> SkinOwner {
    let mut partial = None;
    for (bone, group) in groups.iter().enumerate().skip(1) {
        let Some(weight) = group.and_then(|g| g.weight(source)) else {
            continue;
        };
        if weight >= LOCKED_WEIGHT {
            return SkinOwner::Locked(bone);
        }
        if weight > 0.0 && partial.is_none() {
            partial = Some(SkinOwner::Weighted(bone, weight));
        }
    }
    partial.unwrap_or(SkinOwner::Base)
}

/// Triangles of an untextured mesh, indices as stored
fn raw_faces(mesh: &MeshData) -> Result<Vec<[u16; 3]>> {
    mesh.polygons
        .iter()
        .map(|polygon| {
            let corners = polygon
                .corners
                .iter()
                .map(|&c| u16::try_from(c).map_err(|_| Error::invalid_data(format!("vertex index {c} exceeds u16"))))
                .collect::<Result<SmallVec<[u16; 4]>>>()?;
            Ok(face_from_slice(&corners)?)
        })
        .collect()
}
