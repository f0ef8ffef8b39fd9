// ls3d-scene/src/scene.rs
//! Host-neutral scene graph
//!
//! Nodes live in one flat arena addressed by [`NodeId`]. Parenting is a
//! link from child to parent, either to another node or to a bone of an
//! armature node.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ls3d_core::{BoundingBox, Mat4x4, Transform, Vec2, Vec3};
use ls3d_parsers::MaterialFlags;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Index of a node in [`SceneGraph::nodes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Parent {
    Node(NodeId),
    /// Bone-relative parenting inside an armature node
    Bone { armature: NodeId, bone: String },
}

/// Opaque metadata carried on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Text(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Int(value) => Some(*value as f32),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Self::Ints(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_floats(&self) -> Option<&[f32]> {
        match self {
            Self::Floats(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_vec3(&self) -> Option<Vec3> {
        match self.as_floats()? {
            [x, y, z] => Some(Vec3::new(*x, *y, *z)),
            _ => None,
        }
    }
}

impl From<Vec3> for PropertyValue {
    fn from(value: Vec3) -> Self {
        Self::Floats(value.to_array().to_vec())
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Triangle (or n-gon) with per-corner texture coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub corners: SmallVec<[u32; 4]>,
    /// Parallel to `corners`; empty when the mesh has no UV layer
    pub uvs: SmallVec<[Vec2; 4]>,
    pub material_slot: usize,
}

impl Polygon {
    pub fn triangle(corners: [u32; 3], uvs: [Vec2; 3], material_slot: usize) -> Self {
        Self {
            corners: SmallVec::from_slice(&corners),
            uvs: SmallVec::from_slice(&uvs),
            material_slot,
        }
    }

    pub fn uv(&self, corner: usize) -> Vec2 {
        self.uvs.get(corner).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VertexGroup {
    pub name: String,
    /// Vertex index to weight
    pub weights: BTreeMap<u32, f32>,
}

impl VertexGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weights: BTreeMap::new(),
        }
    }

    pub fn weight(&self, vertex: u32) -> Option<f32> {
        self.weights.get(&vertex).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeKey {
    pub name: String,
    /// One position per mesh vertex
    pub positions: Vec<Vec3>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshData {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub polygons: Vec<Polygon>,
    /// Index into [`SceneGraph::materials`] per slot
    pub material_slots: Vec<Option<usize>>,
    pub has_uvs: bool,
    pub vertex_groups: Vec<VertexGroup>,
    /// The first key is the basis when present
    pub shape_keys: Vec<ShapeKey>,
    /// Armature deforming this mesh
    pub armature: Option<NodeId>,
    pub wireframe: bool,
}

impl MeshData {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn vertex_group(&self, name: &str) -> Option<&VertexGroup> {
        self.vertex_groups.iter().find(|g| g.name == name)
    }

    /// Existing group by name, or a new empty one
    pub fn vertex_group_mut(&mut self, name: &str) -> &mut VertexGroup {
        let index = match self.vertex_groups.iter().position(|g| g.name == name) {
            Some(index) => index,
            None => {
                self.vertex_groups.push(VertexGroup::new(name));
                self.vertex_groups.len() - 1
            }
        };
        &mut self.vertex_groups[index]
    }

    /// Shape keys other than the basis
    pub fn morph_keys(&self) -> &[ShapeKey] {
        self.shape_keys.get(1..).unwrap_or_default()
    }

    pub fn add_shape_key(&mut self, name: impl Into<String>, positions: Vec<Vec3>) {
        if self.shape_keys.is_empty() {
            self.shape_keys.push(ShapeKey {
                name: "Basis".to_string(),
                positions: self.positions.clone(),
            });
        }
        self.shape_keys.push(ShapeKey {
            name: name.into(),
            positions,
        });
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::from_points(&self.positions)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EmptyDisplay {
    /// Bounding-volume marker
    Cube { size: f32 },
    /// Link target marker
    PlainAxes { size: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bone {
    pub name: String,
    /// Index into [`Armature::bones`]
    pub parent: Option<usize>,
    pub head: Vec3,
    pub tail: Vec3,
    /// Skin bone id; `None` for the base bone
    pub bone_id: Option<u32>,
    /// Local transform relative to the parent bone
    pub rest: Transform,
    /// Joint matrix as stored in the file
    pub matrix: Mat4x4,
    pub inverse_bind: Option<Mat4x4>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Armature {
    /// Synthetic bone owning every unweighted vertex
    pub base_bone: String,
    pub bones: Vec<Bone>,
}

impl Armature {
    pub fn bone(&self, name: &str) -> Option<&Bone> {
        self.bones.iter().find(|b| b.name == name)
    }

    pub fn bone_index(&self, name: &str) -> Option<usize> {
        self.bones.iter().position(|b| b.name == name)
    }

    pub fn is_base(&self, index: usize) -> bool {
        self.bones.get(index).is_some_and(|b| b.name == self.base_bone)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Mesh(MeshData),
    Empty(EmptyDisplay),
    Armature(Armature),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneNode {
    pub name: String,
    /// Local to the parent
    pub transform: Transform,
    pub parent: Option<Parent>,
    pub kind: NodeKind,
    pub properties: BTreeMap<String, PropertyValue>,
    pub hidden: bool,
}

impl SceneNode {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            transform: Transform::IDENTITY,
            parent: None,
            kind,
            properties: BTreeMap::new(),
            hidden: false,
        }
    }

    pub fn mesh(&self) -> Option<&MeshData> {
        match &self.kind {
            NodeKind::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn mesh_mut(&mut self) -> Option<&mut MeshData> {
        match &mut self.kind {
            NodeKind::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn armature(&self) -> Option<&Armature> {
        match &self.kind {
            NodeKind::Armature(armature) => Some(armature),
            _ => None,
        }
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: &str, value: impl Into<PropertyValue>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn flag(&self, key: &str) -> bool {
        self.property(key).and_then(PropertyValue::as_bool).unwrap_or(false)
    }

    pub fn parent_node(&self) -> Option<NodeId> {
        match self.parent {
            Some(Parent::Node(id)) => Some(id),
            Some(Parent::Bone { armature, .. }) => Some(armature),
            None => None,
        }
    }
}

/// What a material looks like to the codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialDescriptor {
    pub diffuse_texture: Option<String>,
    pub alpha_texture: Option<String>,
    /// Palette-index transparency on the diffuse texture
    pub color_key: bool,
    pub env_texture: Option<String>,
    pub metallic: f32,
    pub opacity: f32,
    pub emission: Vec3,
    /// Flag bits not derived from the fields above
    pub extra_flags: MaterialFlags,
    pub animation: Option<[u8; 18]>,
}

impl Default for MaterialDescriptor {
    fn default() -> Self {
        Self {
            diffuse_texture: None,
            alpha_texture: None,
            color_key: false,
            env_texture: None,
            metallic: 0.0,
            opacity: 1.0,
            emission: Vec3::ZERO,
            extra_flags: MaterialFlags::empty(),
            animation: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneMaterial {
    pub name: String,
    pub descriptor: MaterialDescriptor,
    /// Files found for the texture names, when resolution ran
    pub diffuse_path: Option<PathBuf>,
    pub alpha_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneGraph {
    pub nodes: Vec<SceneNode>,
    pub materials: Vec<SceneMaterial>,
    pub animated: bool,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: SceneNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn add_material(&mut self, material: SceneMaterial) -> usize {
        self.materials.push(material);
        self.materials.len() - 1
    }

    pub fn node(&self, id: NodeId) -> Option<&SceneNode> {
        self.nodes.get(id.0)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut SceneNode> {
        self.nodes.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &SceneNode)> {
        self.nodes.iter().enumerate().map(|(i, node)| (NodeId(i), node))
    }

    /// First node with the given name
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    pub fn roots(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(id, _)| id)
            .collect()
    }

    /// Direct children, bone-parented ones included
    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, node)| node.parent_node() == Some(parent))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn mesh_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.mesh().is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_group_reuse() {
        let mut mesh = MeshData::default();
        mesh.vertex_group_mut("arm").weights.insert(0, 1.0);
        mesh.vertex_group_mut("arm").weights.insert(1, 0.5);
        mesh.vertex_group_mut("leg");

        assert_eq!(mesh.vertex_groups.len(), 2);
        assert_eq!(mesh.vertex_group("arm").and_then(|g| g.weight(1)), Some(0.5));
    }

    #[test]
    fn test_first_shape_key_adds_basis() {
        let mut mesh = MeshData {
            positions: vec![Vec3::ZERO, Vec3::ONE],
            ..Default::default()
        };
        assert!(mesh.morph_keys().is_empty());

        mesh.add_shape_key("Target_0_LOD0_Channel0", vec![Vec3::ONE, Vec3::ONE]);
        assert_eq!(mesh.shape_keys[0].name, "Basis");
        assert_eq!(mesh.shape_keys[0].positions, mesh.positions);
        assert_eq!(mesh.morph_keys().len(), 1);
    }

    #[test]
    fn test_children_include_bone_parented() {
        let mut scene = SceneGraph::new();
        let root = scene.add_node(SceneNode::new("root", NodeKind::Empty(EmptyDisplay::Cube { size: 1.0 })));
        let armature = scene.add_node(SceneNode {
            parent: Some(Parent::Node(root)),
            ..SceneNode::new("root_armature", NodeKind::Armature(Armature::default()))
        });
        scene.add_node(SceneNode {
            parent: Some(Parent::Bone {
                armature,
                bone: "hand".into(),
            }),
            ..SceneNode::new("gun", NodeKind::Empty(EmptyDisplay::PlainAxes { size: 0.5 }))
        });

        assert_eq!(scene.roots(), vec![root]);
        assert_eq!(scene.children(root), vec![armature]);
        assert_eq!(scene.children(armature).len(), 1);
    }

    #[test]
    fn test_property_accessors() {
        let mut node = SceneNode::new("box", NodeKind::Empty(EmptyDisplay::Cube { size: 1.0 }));
        node.set_property("bbox_min", Vec3::new(-1.0, -2.0, -3.0));
        node.set_property("lit_object", PropertyValue::Bool(true));

        assert_eq!(node.property("bbox_min").and_then(PropertyValue::as_vec3), Some(Vec3::new(-1.0, -2.0, -3.0)));
        assert!(node.flag("lit_object"));
        assert!(!node.flag("missing"));
    }
}
