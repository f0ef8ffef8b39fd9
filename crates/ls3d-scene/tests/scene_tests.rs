//! Integration tests for scene import and export
//!
//! Models are built in memory, written with the codec and imported back:
//! - Scenario files (minimal box, self-parent, unresolved parent)
//! - Armatures, skin cursor order and the non-uniform scale fallback
//! - Export round trips, vertex splitting and shape-key naming
//! - Texture resolution, the model cache and batch import on disk

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ls3d_core::{BoundingBox, Mat4x4, Quat, Transform, Vec2, Vec3};
use ls3d_parsers::fds::{FaceGroup, Lod, Object, SkinBone, SkinLod, Vertex};
use ls3d_parsers::{
    FdsModel, FdsVersion, FdsWriter, FormatWriter, FrameHeader, FramePayload, FrameType, Material, MaterialFlags,
    VisualType,
};
use ls3d_scene::{
    decode_batch, export_scene, import_model, import_reader, write_scene, EmptyDisplay, ExportOptions, ImportOptions,
    Imported, MeshData, ModelCache, NodeKind, Parent, Polygon, SceneGraph, SceneMaterial, SceneNode,
};

fn vertex(x: f32, y: f32, u: f32, v: f32) -> Vertex {
    Vertex {
        position: Vec3::new(x, y, 0.0),
        normal: Vec3::new(0.0, 0.0, 1.0),
        uv: Vec2::new(u, v),
    }
}

fn quad_object(material: u16) -> Object {
    Object {
        instance_id: 0,
        lods: vec![Lod {
            clipping_range: 100.0,
            vertex_count: 4,
            vertices: vec![
                vertex(0.0, 0.0, 0.0, 0.0),
                vertex(1.0, 0.0, 1.0, 0.0),
                vertex(1.0, 1.0, 1.0, 1.0),
                vertex(0.0, 1.0, 0.0, 1.0),
            ],
            face_groups: vec![FaceGroup {
                faces: vec![[0, 1, 2], [0, 2, 3]],
                material,
            }],
            skipped: false,
        }],
    }
}

fn dummy(model: &mut FdsModel, name: &str, parent: u16) -> u16 {
    let header = FrameHeader {
        parent_index: parent,
        ..FrameHeader::new(FrameType::Dummy, name)
    };
    let bounds = BoundingBox::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0));
    model.push_frame(header, FramePayload::Dummy(bounds))
}

fn joint(model: &mut FdsModel, name: &str, parent: u16, position: Vec3, scale: Vec3, bone_id: u32) -> u16 {
    let header = FrameHeader {
        parent_index: parent,
        position,
        scale,
        ..FrameHeader::new(FrameType::Joint, name)
    };
    model.push_frame(
        header,
        FramePayload::Joint {
            matrix: Mat4x4::IDENTITY,
            bone_id,
        },
    )
}

fn bone(bone_id: u32, locked_count: u32, weights: Vec<f32>) -> SkinBone {
    SkinBone {
        inverse_bind: Mat4x4::IDENTITY,
        locked_count,
        bone_id,
        bounds: BoundingBox::ZERO,
        weights,
    }
}

/// Encode with the codec, then import the bytes
fn reimport(model: &FdsModel) -> Imported {
    let bytes = FdsWriter::new().write_to_vec(model).unwrap();
    import_reader(Cursor::new(bytes), &ImportOptions::default()).unwrap()
}

fn node<'a>(scene: &'a SceneGraph, name: &str) -> &'a SceneNode {
    let id = scene.find(name).unwrap_or_else(|| panic!("no node named {name}"));
    scene.node(id).unwrap()
}

/// Skinned quad "man" with joints hip (bone 0) and leg (bone 1)
fn skinned_model() -> FdsModel {
    let mut model = FdsModel::new(FdsVersion::Mafia);
    let skin = SkinLod {
        non_weighted_count: 1,
        bounds: BoundingBox::ZERO,
        bones: vec![bone(0, 1, vec![0.5]), bone(1, 1, vec![])],
    };
    let mesh = model.push_frame(
        FrameHeader::visual(VisualType::SingleMesh, "man"),
        FramePayload::SingleMesh {
            object: quad_object(0),
            skin: vec![skin],
        },
    );
    let hip = joint(&mut model, "hip", mesh, Vec3::new(0.0, 0.0, 1.0), Vec3::ONE, 0);
    let leg = joint(&mut model, "leg", hip, Vec3::new(0.0, 0.0, -0.5), Vec3::ONE, 1);
    dummy(&mut model, "holster", leg);
    model
}

mod scenario_tests {
    use super::*;

    #[test]
    fn test_minimal_box_file() {
        let mut bytes = b"4DS\0".to_vec();
        bytes.extend_from_slice(&29u16.to_le_bytes());
        bytes.extend_from_slice(&[0; 8]);
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.push(6);
        bytes.extend_from_slice(&0u16.to_le_bytes());
        for value in [0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.push(0);
        bytes.push(3);
        bytes.extend_from_slice(b"Box");
        bytes.push(0);
        for value in [-1.0f32, -1.0, -1.0, 1.0, 1.0, 1.0] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.push(0);

        let imported = import_reader(Cursor::new(bytes), &ImportOptions::default()).unwrap();
        let scene = &imported.scene;

        assert_eq!(scene.len(), 1);
        let id = scene.find("Box").unwrap();
        let node = scene.node(id).unwrap();
        assert_eq!(node.kind, NodeKind::Empty(EmptyDisplay::Cube { size: 1.0 }));
        assert_eq!(node.property("bbox_max").and_then(|p| p.as_vec3()), Some(Vec3::ONE));
        assert!(node.parent.is_none());
        assert!(scene.children(id).is_empty());
        assert!(imported.report.warnings.is_empty());
    }

    #[test]
    fn test_self_parent_is_ignored() {
        let mut model = FdsModel::new(FdsVersion::Mafia);
        dummy(&mut model, "a", 0);
        dummy(&mut model, "loop", 2);

        let imported = reimport(&model);
        assert_eq!(imported.scene.len(), 2);
        assert!(node(&imported.scene, "loop").parent.is_none());
        assert!(imported.report.warnings.is_empty());
    }

    #[test]
    fn test_forward_and_unresolved_parents() {
        let mut model = FdsModel::new(FdsVersion::Mafia);
        dummy(&mut model, "child", 2);
        dummy(&mut model, "parent", 0);
        dummy(&mut model, "orphan", 9);

        let imported = reimport(&model);
        let scene = &imported.scene;
        let parent = scene.find("parent").unwrap();

        assert_eq!(node(scene, "child").parent, Some(Parent::Node(parent)));
        assert!(node(scene, "orphan").parent.is_none());
        assert_eq!(imported.report.warnings.len(), 1);
    }

    #[test]
    fn test_target_links_round_trip() {
        let mut model = FdsModel::new(FdsVersion::Mafia);
        model.push_frame(
            FrameHeader::new(FrameType::Target, "aim"),
            FramePayload::Target {
                flags: 2,
                links: vec![1, 4],
            },
        );

        let imported = reimport(&model);
        let aim = node(&imported.scene, "aim");
        assert_eq!(aim.kind, NodeKind::Empty(EmptyDisplay::PlainAxes { size: 0.5 }));
        assert_eq!(aim.property("link_ids").and_then(|p| p.as_ints()), Some(&[1i64, 4][..]));

        let exported = export_scene(&imported.scene, &ExportOptions::default()).unwrap();
        assert_eq!(exported.model.frames[0].payload, model.frames[0].payload);
    }
}

mod armature_tests {
    use super::*;

    #[test]
    fn test_skin_cursor_assigns_groups() {
        let imported = reimport(&skinned_model());
        let scene = &imported.scene;
        let man = node(scene, "man");
        let mesh = man.mesh().unwrap();

        let hip = mesh.vertex_group("hip").unwrap();
        assert_eq!(hip.weight(0), Some(1.0));
        assert_eq!(hip.weight(1), Some(0.5));
        assert_eq!(mesh.vertex_group("leg").unwrap().weight(2), Some(1.0));
        // Whatever the bones leave goes to the base bone
        assert_eq!(mesh.vertex_group("man").unwrap().weight(3), Some(1.0));

        let armature_id = mesh.armature.unwrap();
        let armature_node = scene.node(armature_id).unwrap();
        assert_eq!(armature_node.name, "man_armature");
        assert_eq!(armature_node.parent, Some(Parent::Node(scene.find("man").unwrap())));

        let armature = armature_node.armature().unwrap();
        assert_eq!(armature.bones.len(), 3);
        assert_eq!(armature.base_bone, "man");
        let leg = armature.bone("leg").unwrap();
        assert!(leg.head.abs_diff_eq(Vec3::new(0.0, 0.0, 0.5), 1e-5));
        assert_eq!(leg.bone_id, Some(1));

        assert_eq!(
            node(scene, "holster").parent,
            Some(Parent::Bone {
                armature: armature_id,
                bone: "leg".into(),
            })
        );
        assert!(imported.report.warnings.is_empty(), "{:?}", imported.report.warnings);
    }

    #[test]
    fn test_non_uniform_scale_keeps_mesh() {
        let mut model = FdsModel::new(FdsVersion::Mafia);
        let mesh = model.push_frame(
            FrameHeader::visual(VisualType::SingleMesh, "man"),
            FramePayload::SingleMesh {
                object: quad_object(0),
                skin: vec![SkinLod::default()],
            },
        );
        joint(&mut model, "left", mesh, Vec3::ZERO, Vec3::ONE, 0);
        joint(&mut model, "right", mesh, Vec3::ZERO, Vec3::new(2.0, 2.0, 2.0), 1);

        let imported = reimport(&model);
        let man = node(&imported.scene, "man");
        let mesh = man.mesh().unwrap();

        assert_eq!(mesh.vertex_count(), 4);
        assert!(mesh.armature.is_none());
        assert!(mesh.vertex_groups.is_empty());
        assert!(imported
            .report
            .warnings
            .iter()
            .any(|w| w.contains("Non-uniform armature scale")));
    }

    #[test]
    fn test_skinned_round_trip() {
        let first = reimport(&skinned_model());
        let exported = export_scene(&first.scene, &ExportOptions::default()).unwrap();

        let names: Vec<&str> = exported.model.frames.iter().map(|f| f.name()).collect();
        assert_eq!(names, ["man", "holster", "hip", "leg"]);
        let leg = &exported.model.frames[3];
        assert_eq!(leg.header.parent_index, 3);
        assert_eq!(exported.model.frames[1].header.parent_index, 4);

        let FramePayload::SingleMesh { skin, .. } = &exported.model.frames[0].payload else {
            panic!("expected a skinned mesh");
        };
        assert_eq!(skin[0].bones.len(), 2);
        assert_eq!(skin[0].bones[0].locked_count, 1);
        assert_eq!(skin[0].bones[0].weights, vec![0.5]);
        assert_eq!(skin[0].non_weighted_count, 1);

        let second = reimport(&exported.model);
        let mesh = node(&second.scene, "man").mesh().unwrap();
        assert_eq!(mesh.vertex_group("hip").unwrap().weight(1), Some(0.5));
        assert_eq!(mesh.vertex_group("leg").unwrap().weight(2), Some(1.0));
    }
}

mod export_tests {
    use super::*;

    fn quad_scene() -> SceneGraph {
        let mut scene = SceneGraph::new();
        let material = scene.add_material(SceneMaterial::from_material(&Material {
            flags: MaterialFlags::DIFFUSETEX | MaterialFlags::MIPMAP | MaterialFlags::DOUBLESIDED,
            diffuse_texture: "WALL.BMP".into(),
            ..Material::new()
        }));

        let uv = Vec2::new;
        let mesh = MeshData {
            positions: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(2.0, 0.0, 0.5),
                Vec3::new(2.0, 3.0, 0.5),
                Vec3::new(0.0, 3.0, 0.0),
            ],
            normals: vec![Vec3::new(0.0, 0.6, 0.8); 4],
            polygons: vec![
                Polygon::triangle([0, 1, 2], [uv(0.0, 0.0), uv(1.0, 0.0), uv(1.0, 1.0)], 0),
                Polygon::triangle([0, 2, 3], [uv(0.0, 0.0), uv(1.0, 1.0), uv(0.0, 1.0)], 0),
            ],
            material_slots: vec![Some(material)],
            has_uvs: true,
            ..MeshData::default()
        };
        let mut node = SceneNode::new("wall", NodeKind::Mesh(mesh));
        node.transform = Transform::new(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY, Vec3::ONE);
        scene.add_node(node);
        scene
    }

    #[test]
    fn test_single_mesh_round_trip() {
        let scene = quad_scene();
        let mut bytes = Cursor::new(Vec::new());
        let report = write_scene(&scene, &ExportOptions { timestamp: Some(7) }, &mut bytes).unwrap();
        assert!(report.warnings.is_empty());

        let imported = import_reader(Cursor::new(bytes.into_inner()), &ImportOptions::default()).unwrap();
        let original = node(&scene, "wall");
        let decoded = node(&imported.scene, "wall");
        let (a, b) = (original.mesh().unwrap(), decoded.mesh().unwrap());

        assert_eq!(a.positions.len(), b.positions.len());
        for (p, q) in a.positions.iter().zip(&b.positions) {
            assert!(p.abs_diff_eq(*q, 1e-5));
        }
        for (p, q) in a.normals.iter().zip(&b.normals) {
            assert!(p.abs_diff_eq(*q, 1e-5));
        }
        assert_eq!(a.polygons.len(), b.polygons.len());
        for (p, q) in a.polygons.iter().zip(&b.polygons) {
            assert_eq!(p.corners, q.corners);
            for corner in 0..3 {
                let (u, v) = (p.uv(corner), q.uv(corner));
                assert!((u.x - v.x).abs() < 1e-5 && (u.y - v.y).abs() < 1e-5);
            }
        }
        assert!(decoded.transform.position.abs_diff_eq(Vec3::new(1.0, 2.0, 3.0), 1e-5));

        assert_eq!(
            imported.scene.materials[0].descriptor.flags(),
            scene.materials[0].descriptor.flags()
        );
        assert_eq!(b.material_slots, vec![Some(0)]);
    }

    #[test]
    fn test_round_trip_keeps_vertex_order() {
        let mut scene = quad_scene();
        if let Some(mesh) = scene.nodes[0].mesh_mut() {
            mesh.positions = vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(2.0, 3.0, 0.0),
                Vec3::new(0.0, 3.0, 0.0),
                Vec3::new(9.0, 9.0, 9.0),
            ];
            mesh.normals = vec![Vec3::new(0.0, 0.0, 1.0); 5];
            let uv = |u, v| Vec2::new(u, v);
            mesh.polygons = vec![
                Polygon::triangle([2, 3, 0], [uv(1.0, 1.0), uv(0.0, 1.0), uv(0.0, 0.0)], 0),
                Polygon::triangle([2, 0, 1], [uv(1.0, 1.0), uv(0.0, 0.0), uv(1.0, 0.0)], 0),
            ];
        }

        let mut bytes = Cursor::new(Vec::new());
        write_scene(&scene, &ExportOptions::default(), &mut bytes).unwrap();
        let imported = import_reader(Cursor::new(bytes.into_inner()), &ImportOptions::default()).unwrap();

        let a = node(&scene, "wall").mesh().unwrap();
        let b = node(&imported.scene, "wall").mesh().unwrap();
        assert_eq!(b.positions.len(), 5);
        for (p, q) in a.positions.iter().zip(&b.positions) {
            assert!(p.abs_diff_eq(*q, 1e-5), "{p:?} vs {q:?}");
        }
        let corners: Vec<Vec<u32>> = b.polygons.iter().map(|p| p.corners.to_vec()).collect();
        assert_eq!(corners, vec![vec![2, 3, 0], vec![2, 0, 1]]);
    }

    #[test]
    fn test_uv_seam_splits_vertices() {
        let mut scene = quad_scene();
        if let Some(mesh) = scene.nodes[0].mesh_mut() {
            mesh.polygons[1].uvs[1] = Vec2::new(0.5, 0.5);
        }

        let exported = export_scene(&scene, &ExportOptions::default()).unwrap();
        let object = exported.model.frames[0].payload.object().unwrap();
        assert_eq!(object.lods[0].vertices.len(), 5);
        assert_eq!(object.lods[0].face_count(), 2);
    }

    #[test]
    fn test_malformed_shape_key_is_skipped() {
        let mut scene = quad_scene();
        if let Some(mesh) = scene.nodes[0].mesh_mut() {
            let mut raised = mesh.positions.clone();
            raised[2].z += 1.0;
            mesh.add_shape_key("Target_0_LOD0_Channel0", raised.clone());
            mesh.add_shape_key("wobble", raised);
        }

        let exported = export_scene(&scene, &ExportOptions::default()).unwrap();
        assert_eq!(exported.report.warnings.len(), 1);
        assert!(exported.report.warnings[0].contains("wobble"));

        let FramePayload::Morph { morph, .. } = &exported.model.frames[0].payload else {
            panic!("expected a morph visual");
        };
        assert_eq!(morph.target_count, 1);
        assert_eq!(morph.channel_count, 1);
        assert_eq!(morph.lods[0].channels[0].vertices.len(), 4);

        let imported = reimport(&exported.model);
        let mesh = node(&imported.scene, "wall").mesh().unwrap();
        let keys: Vec<&str> = mesh.morph_keys().iter().map(|k| k.name.as_str()).collect();
        assert_eq!(keys, ["Target_0_LOD0_Channel0"]);
        assert!((mesh.morph_keys()[0].positions[2].z - 1.5).abs() < 1e-5);
    }

    #[test]
    fn test_lod_children_regroup() {
        let mut model = FdsModel::new(FdsVersion::Mafia);
        let mut object = quad_object(0);
        let mut far = object.lods[0].clone();
        far.clipping_range = 250.0;
        object.lods.push(far);
        model.push_frame(FrameHeader::visual(VisualType::Object, "car"), FramePayload::Object(object));

        let imported = reimport(&model);
        let lod = node(&imported.scene, "car_lod1");
        assert!(lod.hidden);
        assert_eq!(lod.parent, Some(Parent::Node(imported.scene.find("car").unwrap())));

        let exported = export_scene(&imported.scene, &ExportOptions::default()).unwrap();
        assert_eq!(exported.model.frames.len(), 1);
        let object = exported.model.frames[0].payload.object().unwrap();
        assert_eq!(object.lods.len(), 2);
        assert_eq!(object.lods[1].clipping_range, 250.0);
    }
}

mod disk_tests {
    use super::*;

    fn write_model(path: &Path, texture: &str) {
        let mut model = FdsModel::new(FdsVersion::Mafia);
        let material = model.push_material(Material {
            flags: MaterialFlags::DIFFUSETEX,
            diffuse_texture: texture.into(),
            ..Material::new()
        });
        model.push_frame(
            FrameHeader::visual(VisualType::Object, "crate"),
            FramePayload::Object(quad_object(material)),
        );
        FdsWriter::new().write_file(&model, path).unwrap();
    }

    fn install() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("models")).unwrap();
        fs::create_dir_all(dir.path().join("maps")).unwrap();
        fs::write(dir.path().join("maps").join("CRATE.BMP"), b"BM").unwrap();
        let models = dir.path().join("models");
        (dir, models)
    }

    #[test]
    fn test_textures_resolve_next_to_models() {
        let (dir, models) = install();
        let path = models.join("crate.4ds");
        write_model(&path, "crate.bmp");

        let imported = ls3d_scene::import_file(&path, &ImportOptions::default()).unwrap();
        let material = &imported.scene.materials[0];
        assert_eq!(material.diffuse_path, Some(dir.path().join("maps").join("CRATE.BMP")));
        assert!(imported.report.warnings.is_empty());
    }

    #[test]
    fn test_missing_texture_warns() {
        let (_dir, models) = install();
        let path = models.join("barrel.4ds");
        write_model(&path, "barrel.bmp");

        let imported = ls3d_scene::import_file(&path, &ImportOptions::default()).unwrap();
        assert_eq!(imported.scene.materials[0].diffuse_path, None);
        assert_eq!(imported.report.warnings.len(), 1);
        assert_eq!(imported.scene.mesh_count(), 1);
    }

    #[test]
    fn test_batch_shares_cached_scenes() {
        let (_dir, models) = install();
        let a = models.join("a.4ds");
        let b = models.join("b.4ds");
        write_model(&a, "crate.bmp");
        write_model(&b, "crate.bmp");

        let cache = ModelCache::new();
        let paths = vec![a.clone(), b, a, models.join("missing.4ds")];
        let results = decode_batch(&paths, &cache, &ImportOptions::default());

        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(|(_, r)| r.is_ok()));
        assert!(results[3].1.is_err());
        assert_eq!(cache.len(), 2);

        let first = results[0].1.as_ref().unwrap();
        let third = results[2].1.as_ref().unwrap();
        assert!(Arc::ptr_eq(first, third));
    }

    #[test]
    fn test_import_model_without_textures() {
        let mut model = FdsModel::new(FdsVersion::Mafia);
        model.push_material(Material::new());
        model.push_frame(
            FrameHeader::visual(VisualType::Object, "plain"),
            FramePayload::Object(quad_object(0)),
        );

        let imported = import_model(&model, &ImportOptions::default(), None);
        let mesh = node(&imported.scene, "plain").mesh().unwrap();
        // Blank material slots draw as wireframe
        assert!(mesh.wireframe);
    }
}
