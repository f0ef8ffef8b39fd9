// ls3d-parsers/src/fds/mesh.rs
//! Object payload: instance id and a list of LOD meshes

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ls3d_core::{BoundingBox, Vec2, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::primitives::{checked_count, Axes, FdsReadExt, FdsWriteExt, FACE_RECORD_SIZE, VERTEX_RECORD_SIZE};
use crate::traits::{ParseError, ParseOptions, ParseResult};

/// One stored vertex, in scene convention (Z-up, V flipped)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

/// A run of triangles sharing one material reference
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FaceGroup {
    /// Triangles in scene winding
    pub faces: Vec<[u16; 3]>,
    /// 0 = none, otherwise 1-based into the material table
    pub material: u16,
}

/// One level of detail
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Lod {
    pub clipping_range: f32,
    /// Declared vertex count; equals `vertices.len()` unless skipped
    pub vertex_count: usize,
    pub vertices: Vec<Vertex>,
    pub face_groups: Vec<FaceGroup>,
    /// Geometry was seek-skipped while decoding
    pub skipped: bool,
}

impl Lod {
    pub fn face_count(&self) -> usize {
        self.face_groups.iter().map(|g| g.faces.len()).sum()
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::from_points(self.vertices.iter().map(|v| &v.position))
    }
}

/// Geometry shared by every visual that carries a mesh
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Object {
    pub instance_id: u16,
    pub lods: Vec<Lod>,
}

impl Object {
    pub fn vertex_count(&self) -> usize {
        self.lods.iter().map(|l| l.vertex_count).sum()
    }

    pub fn face_count(&self) -> usize {
        self.lods.iter().map(Lod::face_count).sum()
    }

    /// Declared vertex count of each LOD, in order
    pub fn vertex_counts(&self) -> Vec<usize> {
        self.lods.iter().map(|l| l.vertex_count).collect()
    }
}

/// Engine winding is the reverse of scene winding
fn rewind(face: [u16; 3]) -> [u16; 3] {
    [face[0], face[2], face[1]]
}

pub fn read_object<R: Read + Seek>(reader: &mut R, options: &ParseOptions) -> ParseResult<Object> {
    // A non-zero instance id does not end the payload; the LOD list follows
    let instance_id = reader.read_u16::<LittleEndian>()?;
    let lod_count = reader.read_u8()?;

    let mut lods = Vec::with_capacity(lod_count as usize);
    for level in 0..lod_count {
        let clipping_range = reader.read_f32::<LittleEndian>()?;
        let lod = if level > 0 && !options.import_lods {
            skip_lod(reader, clipping_range)?
        } else {
            read_lod(reader, clipping_range, options)?
        };
        lods.push(lod);
    }

    Ok(Object { instance_id, lods })
}

fn read_lod<R: Read + Seek>(reader: &mut R, clipping_range: f32, options: &ParseOptions) -> ParseResult<Lod> {
    let vertex_count = reader.read_u16::<LittleEndian>()? as usize;
    let mut vertices = Vec::with_capacity(vertex_count);
    for _ in 0..vertex_count {
        let position = reader.read_vec3(Axes::Swapped)?;
        let normal = reader.read_vec3(Axes::Swapped)?;
        let uv = reader.read_vec2()?.flip_v();
        vertices.push(Vertex { position, normal, uv });
    }

    let group_count = reader.read_u8()?;
    let mut face_groups = Vec::with_capacity(group_count as usize);
    for _ in 0..group_count {
        let face_count = reader.read_u16::<LittleEndian>()? as usize;
        let mut faces = Vec::with_capacity(face_count);
        for _ in 0..face_count {
            let face = reader.read_face()?;
            if let Some(&index) = face.iter().find(|&&i| i as usize >= vertex_count) {
                let offset = reader.stream_position()?;
                if options.strict_validation {
                    return Err(ParseError::CorruptedData {
                        offset,
                        message: format!("face index {index} out of range for {vertex_count} vertices"),
                    });
                }
                warn!(offset, index, vertex_count, "Face index out of range");
            }
            faces.push(rewind(face));
        }
        let material = reader.read_u16::<LittleEndian>()?;
        face_groups.push(FaceGroup { faces, material });
    }

    Ok(Lod {
        clipping_range,
        vertex_count,
        vertices,
        face_groups,
        skipped: false,
    })
}

/// Advance past one LOD without materializing it
fn skip_lod<R: Read + Seek>(reader: &mut R, clipping_range: f32) -> ParseResult<Lod> {
    let vertex_count = reader.read_u16::<LittleEndian>()? as usize;
    reader.seek(SeekFrom::Current(VERTEX_RECORD_SIZE * vertex_count as i64))?;

    let group_count = reader.read_u8()?;
    for _ in 0..group_count {
        let face_count = reader.read_u16::<LittleEndian>()? as i64;
        // triangles plus the trailing material reference
        reader.seek(SeekFrom::Current(FACE_RECORD_SIZE * face_count + 2))?;
    }
    debug!(vertex_count, group_count, "Skipped LOD geometry");

    Ok(Lod {
        clipping_range,
        vertex_count,
        vertices: Vec::new(),
        face_groups: Vec::new(),
        skipped: true,
    })
}

pub fn write_object<W: Write>(writer: &mut W, object: &Object) -> ParseResult<()> {
    writer.write_u16::<LittleEndian>(object.instance_id)?;
    writer.write_u8(checked_count(object.lods.len(), "LODs")?)?;

    for (level, lod) in object.lods.iter().enumerate() {
        if lod.skipped {
            return Err(ParseError::InvalidStructure(format!(
                "LOD {level} was skipped on decode and has no geometry to write"
            )));
        }
        writer.write_f32::<LittleEndian>(lod.clipping_range)?;
        writer.write_u16::<LittleEndian>(checked_count(lod.vertices.len(), "vertices")?)?;
        for vertex in &lod.vertices {
            writer.write_vec3(vertex.position, Axes::Swapped)?;
            writer.write_vec3(vertex.normal, Axes::Swapped)?;
            writer.write_vec2(vertex.uv.flip_v())?;
        }

        writer.write_u8(checked_count(lod.face_groups.len(), "face groups")?)?;
        for group in &lod.face_groups {
            writer.write_u16::<LittleEndian>(checked_count(group.faces.len(), "faces")?)?;
            for face in &group.faces {
                writer.write_face(&rewind(*face))?;
            }
            writer.write_u16::<LittleEndian>(group.material)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn quad(clipping_range: f32) -> Lod {
        let corner = |x: f32, y: f32| Vertex {
            position: Vec3::new(x, y, 0.0),
            normal: Vec3::new(0.0, 0.0, 1.0),
            uv: Vec2::new(x, y),
        };
        Lod {
            clipping_range,
            vertex_count: 4,
            vertices: vec![corner(0.0, 0.0), corner(1.0, 0.0), corner(1.0, 1.0), corner(0.0, 1.0)],
            face_groups: vec![FaceGroup {
                faces: vec![[0, 1, 2], [0, 2, 3]],
                material: 1,
            }],
            skipped: false,
        }
    }

    fn two_lod_object() -> Object {
        Object {
            instance_id: 0,
            lods: vec![quad(100.0), quad(200.0)],
        }
    }

    #[test]
    fn test_object_roundtrip() {
        let object = two_lod_object();
        let mut buf = Vec::new();
        write_object(&mut buf, &object).unwrap();

        let decoded = read_object(&mut Cursor::new(buf), &ParseOptions::default()).unwrap();
        assert_eq!(decoded, object);
        assert_eq!(decoded.face_count(), 4);
    }

    #[test]
    fn test_instanced_object_keeps_its_lods() {
        let object = Object {
            instance_id: 7,
            ..two_lod_object()
        };
        let mut buf = Vec::new();
        write_object(&mut buf, &object).unwrap();
        buf.push(0xAB);

        let mut cursor = Cursor::new(buf);
        let decoded = read_object(&mut cursor, &ParseOptions::default()).unwrap();
        assert_eq!(decoded.instance_id, 7);
        assert_eq!(decoded.lods.len(), 2);
        assert_eq!(cursor.read_u8().unwrap(), 0xAB);
    }

    #[test]
    fn test_winding_and_uv_on_the_wire() {
        let object = Object {
            instance_id: 0,
            lods: vec![quad(100.0)],
        };
        let mut buf = Vec::new();
        write_object(&mut buf, &object).unwrap();

        // instance id, lod count, clipping range, vertex count, two vertices
        let mut cursor = Cursor::new(&buf);
        cursor.set_position(2 + 1 + 4 + 2 + 2 * 32);
        assert_eq!(cursor.read_vec3(Axes::Raw).unwrap(), Vec3::new(1.0, 0.0, 1.0));
        let _normal = cursor.read_vec3(Axes::Raw).unwrap();
        assert_eq!(cursor.read_vec2().unwrap(), Vec2::new(1.0, -1.0));

        cursor.set_position(2 + 1 + 4 + 2 + 4 * 32 + 1 + 2);
        assert_eq!(cursor.read_face().unwrap(), [0, 2, 1]);
    }

    #[test]
    fn test_skipped_lods_keep_stream_aligned() {
        let object = two_lod_object();
        let mut buf = Vec::new();
        write_object(&mut buf, &object).unwrap();
        buf.push(0xAB);

        let options = ParseOptions {
            import_lods: false,
            ..ParseOptions::default()
        };
        let mut cursor = Cursor::new(buf);
        let decoded = read_object(&mut cursor, &options).unwrap();
        assert_eq!(cursor.read_u8().unwrap(), 0xAB);

        let lod = &decoded.lods[1];
        assert!(lod.skipped);
        assert_eq!(lod.vertex_count, 4);
        assert!(lod.vertices.is_empty());
        assert_eq!(lod.clipping_range, 200.0);
        assert!(!decoded.lods[0].skipped);
    }

    #[test]
    fn test_writing_skipped_lod_fails() {
        let mut object = two_lod_object();
        object.lods[1].skipped = true;
        let err = write_object(&mut Vec::new(), &object).unwrap_err();
        assert!(matches!(err, ParseError::InvalidStructure(_)));
    }

    #[test]
    fn test_out_of_range_index_strict() {
        let mut object = Object {
            instance_id: 0,
            lods: vec![quad(100.0)],
        };
        object.lods[0].face_groups[0].faces.push([0, 1, 9]);
        let mut buf = Vec::new();
        write_object(&mut buf, &object).unwrap();

        let lenient = read_object(&mut Cursor::new(buf.clone()), &ParseOptions::default());
        assert!(lenient.is_ok());

        let strict = ParseOptions {
            strict_validation: true,
            ..ParseOptions::default()
        };
        let err = read_object(&mut Cursor::new(buf), &strict).unwrap_err();
        assert!(matches!(err, ParseError::CorruptedData { .. }));
    }
}
