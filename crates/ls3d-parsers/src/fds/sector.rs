// ls3d-parsers/src/fds/sector.rs
//! Sector, portal and occluder payloads.
//!
//! The base version and the two variants disagree on vertex width, on
//! whether the sector bounds come before the vertices or after the faces,
//! and on an extra word in each portal. All of that lives in
//! [`GeometryLayout`]; the codec below only consults the table.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ls3d_core::{BoundingBox, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use super::primitives::{checked_count, Axes, FdsReadExt, FdsWriteExt};
use super::FdsVersion;
use crate::traits::ParseResult;

/// Stored width of a point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointWidth {
    Vec3,
    /// Four floats, the last one ignored
    Vec4,
}

/// Where the sector bounding box sits in the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsPosition {
    BeforeVertices,
    AfterFaces,
}

/// Per-version field layout of sector and occluder geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryLayout {
    pub point_width: PointWidth,
    pub point_axes: Axes,
    pub bounds_position: BoundsPosition,
    pub bounds_width: PointWidth,
    pub bounds_axes: Axes,
    /// Portals carry an extra u32 before their vertices
    pub portal_extra_word: bool,
}

static LAYOUTS: [(FdsVersion, GeometryLayout); 3] = [
    (
        FdsVersion::Mafia,
        GeometryLayout {
            point_width: PointWidth::Vec3,
            point_axes: Axes::Swapped,
            bounds_position: BoundsPosition::AfterFaces,
            bounds_width: PointWidth::Vec3,
            bounds_axes: Axes::Swapped,
            portal_extra_word: false,
        },
    ),
    (
        FdsVersion::Hd2,
        GeometryLayout {
            point_width: PointWidth::Vec4,
            point_axes: Axes::Raw,
            bounds_position: BoundsPosition::BeforeVertices,
            bounds_width: PointWidth::Vec4,
            bounds_axes: Axes::Raw,
            portal_extra_word: true,
        },
    ),
    (
        FdsVersion::Chameleon,
        GeometryLayout {
            point_width: PointWidth::Vec3,
            point_axes: Axes::Swapped,
            bounds_position: BoundsPosition::BeforeVertices,
            bounds_width: PointWidth::Vec3,
            bounds_axes: Axes::Swapped,
            portal_extra_word: true,
        },
    ),
];

impl GeometryLayout {
    pub fn for_version(version: FdsVersion) -> &'static GeometryLayout {
        LAYOUTS
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, layout)| layout)
            .unwrap_or(&LAYOUTS[0].1)
    }

    fn read_point<R: Read>(&self, reader: &mut R) -> ParseResult<Vec3> {
        read_point(reader, self.point_width, self.point_axes)
    }

    fn write_point<W: Write>(&self, writer: &mut W, point: Vec3) -> ParseResult<()> {
        write_point(writer, point, self.point_width, self.point_axes)
    }

    fn read_bounds<R: Read>(&self, reader: &mut R) -> ParseResult<BoundingBox> {
        let min = read_point(reader, self.bounds_width, self.bounds_axes)?;
        let max = read_point(reader, self.bounds_width, self.bounds_axes)?;
        Ok(BoundingBox::new(min, max))
    }

    fn write_bounds<W: Write>(&self, writer: &mut W, bounds: BoundingBox) -> ParseResult<()> {
        write_point(writer, bounds.min, self.bounds_width, self.bounds_axes)?;
        write_point(writer, bounds.max, self.bounds_width, self.bounds_axes)
    }
}

fn read_point<R: Read>(reader: &mut R, width: PointWidth, axes: Axes) -> ParseResult<Vec3> {
    match width {
        PointWidth::Vec3 => reader.read_vec3(axes),
        PointWidth::Vec4 => {
            let v = reader.read_vec4()?.truncate();
            Ok(match axes {
                Axes::Raw => v,
                Axes::Swapped => Vec3::new(v.x, v.z, v.y),
            })
        }
    }
}

fn write_point<W: Write>(writer: &mut W, point: Vec3, width: PointWidth, axes: Axes) -> ParseResult<()> {
    match width {
        PointWidth::Vec3 => writer.write_vec3(point, axes),
        PointWidth::Vec4 => {
            let p = match axes {
                Axes::Raw => point,
                Axes::Swapped => Vec3::new(point.x, point.z, point.y),
            };
            writer.write_vec4(Vec4::new(p.x, p.y, p.z, 0.0))
        }
    }
}

/// Opening between two sectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portal {
    /// Normal and distance, stored as is
    pub plane: Vec4,
    pub flags: u32,
    pub near_range: f32,
    pub far_range: f32,
    /// Present in the variant versions only
    pub extra: Option<u32>,
    pub vertices: Vec<Vec3>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sector {
    pub flags: [u32; 2],
    pub vertices: Vec<Vec3>,
    /// Stored as is, no winding bridge
    pub faces: Vec<[u16; 3]>,
    pub bounds: BoundingBox,
    pub portals: Vec<Portal>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Occluder {
    pub vertices: Vec<Vec3>,
    pub faces: Vec<[u16; 3]>,
}

pub fn read_sector<R: Read>(reader: &mut R, layout: &GeometryLayout) -> ParseResult<Sector> {
    let flags = [reader.read_u32::<LittleEndian>()?, reader.read_u32::<LittleEndian>()?];
    let vertex_count = reader.read_u32::<LittleEndian>()? as usize;
    let face_count = reader.read_u32::<LittleEndian>()? as usize;

    let mut bounds = BoundingBox::ZERO;
    if layout.bounds_position == BoundsPosition::BeforeVertices {
        bounds = layout.read_bounds(reader)?;
    }

    let vertices = (0..vertex_count)
        .map(|_| layout.read_point(reader))
        .collect::<ParseResult<Vec<_>>>()?;
    let faces = (0..face_count)
        .map(|_| reader.read_face())
        .collect::<ParseResult<Vec<_>>>()?;

    if layout.bounds_position == BoundsPosition::AfterFaces {
        bounds = layout.read_bounds(reader)?;
    }

    let portal_count = reader.read_u8()?;
    let mut portals = Vec::with_capacity(portal_count as usize);
    for _ in 0..portal_count {
        portals.push(read_portal(reader, layout)?);
    }

    Ok(Sector {
        flags,
        vertices,
        faces,
        bounds,
        portals,
    })
}

fn read_portal<R: Read>(reader: &mut R, layout: &GeometryLayout) -> ParseResult<Portal> {
    let vertex_count = reader.read_u8()?;
    let plane = reader.read_vec4()?;
    let flags = reader.read_u32::<LittleEndian>()?;
    let near_range = reader.read_f32::<LittleEndian>()?;
    let far_range = reader.read_f32::<LittleEndian>()?;
    let extra = if layout.portal_extra_word {
        Some(reader.read_u32::<LittleEndian>()?)
    } else {
        None
    };
    let vertices = (0..vertex_count)
        .map(|_| layout.read_point(reader))
        .collect::<ParseResult<Vec<_>>>()?;

    Ok(Portal {
        plane,
        flags,
        near_range,
        far_range,
        extra,
        vertices,
    })
}

pub fn write_sector<W: Write>(writer: &mut W, sector: &Sector, layout: &GeometryLayout) -> ParseResult<()> {
    writer.write_u32::<LittleEndian>(sector.flags[0])?;
    writer.write_u32::<LittleEndian>(sector.flags[1])?;
    writer.write_u32::<LittleEndian>(checked_count(sector.vertices.len(), "sector vertices")?)?;
    writer.write_u32::<LittleEndian>(checked_count(sector.faces.len(), "sector faces")?)?;

    if layout.bounds_position == BoundsPosition::BeforeVertices {
        layout.write_bounds(writer, sector.bounds)?;
    }
    for vertex in &sector.vertices {
        layout.write_point(writer, *vertex)?;
    }
    for face in &sector.faces {
        writer.write_face(face)?;
    }
    if layout.bounds_position == BoundsPosition::AfterFaces {
        layout.write_bounds(writer, sector.bounds)?;
    }

    writer.write_u8(checked_count(sector.portals.len(), "portals")?)?;
    for portal in &sector.portals {
        writer.write_u8(checked_count(portal.vertices.len(), "portal vertices")?)?;
        writer.write_vec4(portal.plane)?;
        writer.write_u32::<LittleEndian>(portal.flags)?;
        writer.write_f32::<LittleEndian>(portal.near_range)?;
        writer.write_f32::<LittleEndian>(portal.far_range)?;
        if layout.portal_extra_word {
            writer.write_u32::<LittleEndian>(portal.extra.unwrap_or(0))?;
        }
        for vertex in &portal.vertices {
            layout.write_point(writer, *vertex)?;
        }
    }

    Ok(())
}

pub fn read_occluder<R: Read>(reader: &mut R, layout: &GeometryLayout) -> ParseResult<Occluder> {
    let vertex_count = reader.read_u32::<LittleEndian>()? as usize;
    let face_count = reader.read_u32::<LittleEndian>()? as usize;
    let vertices = (0..vertex_count)
        .map(|_| layout.read_point(reader))
        .collect::<ParseResult<Vec<_>>>()?;
    let faces = (0..face_count)
        .map(|_| reader.read_face())
        .collect::<ParseResult<Vec<_>>>()?;
    Ok(Occluder { vertices, faces })
}

pub fn write_occluder<W: Write>(writer: &mut W, occluder: &Occluder, layout: &GeometryLayout) -> ParseResult<()> {
    writer.write_u32::<LittleEndian>(checked_count(occluder.vertices.len(), "occluder vertices")?)?;
    writer.write_u32::<LittleEndian>(checked_count(occluder.faces.len(), "occluder faces")?)?;
    for vertex in &occluder.vertices {
        layout.write_point(writer, *vertex)?;
    }
    for face in &occluder.faces {
        writer.write_face(face)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn room() -> Sector {
        Sector {
            flags: [0x0800_0001, 0x2],
            vertices: vec![Vec3::new(0.0, 0.0, 0.0), Vec3::new(4.0, 0.0, 0.0), Vec3::new(0.0, 4.0, 3.0)],
            faces: vec![[0, 1, 2]],
            bounds: BoundingBox::new(Vec3::ZERO, Vec3::new(4.0, 4.0, 3.0)),
            portals: vec![Portal {
                plane: Vec4::new(1.0, 0.0, 0.0, -4.0),
                flags: 4,
                near_range: 0.0,
                far_range: 50.0,
                extra: None,
                vertices: vec![Vec3::new(4.0, 0.0, 0.0), Vec3::new(4.0, 1.0, 0.0), Vec3::new(4.0, 1.0, 2.0)],
            }],
        }
    }

    #[test]
    fn test_layout_table() {
        let base = GeometryLayout::for_version(FdsVersion::Mafia);
        assert_eq!(base.bounds_position, BoundsPosition::AfterFaces);
        assert!(!base.portal_extra_word);

        let hd2 = GeometryLayout::for_version(FdsVersion::Hd2);
        assert_eq!(hd2.point_width, PointWidth::Vec4);
        assert_eq!(hd2.bounds_position, BoundsPosition::BeforeVertices);
    }

    #[test]
    fn test_sector_roundtrip_base_version() {
        let layout = GeometryLayout::for_version(FdsVersion::Mafia);
        let sector = room();
        let mut buf = Vec::new();
        write_sector(&mut buf, &sector, layout).unwrap();

        // flags, counts, 3 vertices, 1 face, bounds, portal count
        let portal_start = 16 + 3 * 12 + 6 + 24;
        assert_eq!(buf[portal_start], 1);
        // faces are not rewound
        assert_eq!(&buf[16 + 36..16 + 42], &[0, 0, 1, 0, 2, 0]);

        let decoded = read_sector(&mut Cursor::new(&buf), layout).unwrap();
        assert_eq!(decoded, sector);
    }

    #[test]
    fn test_sector_roundtrip_variants() {
        for version in [FdsVersion::Hd2, FdsVersion::Chameleon] {
            let layout = GeometryLayout::for_version(version);
            let mut sector = room();
            sector.portals[0].extra = Some(9);

            let mut buf = Vec::new();
            write_sector(&mut buf, &sector, layout).unwrap();
            buf.push(0x5A);

            let mut cursor = Cursor::new(buf);
            let decoded = read_sector(&mut cursor, layout).unwrap();
            assert_eq!(decoded, sector, "{version:?}");
            assert_eq!(cursor.read_u8().unwrap(), 0x5A);
        }
    }

    #[test]
    fn test_occluder_roundtrip() {
        let layout = GeometryLayout::for_version(FdsVersion::Mafia);
        let occluder = Occluder {
            vertices: vec![Vec3::ZERO, Vec3::ONE, Vec3::new(1.0, 0.0, 0.0)],
            faces: vec![[0, 2, 1]],
        };
        let mut buf = Vec::new();
        write_occluder(&mut buf, &occluder, layout).unwrap();
        assert_eq!(buf.len(), 8 + 36 + 6);
        assert_eq!(read_occluder(&mut Cursor::new(buf), layout).unwrap(), occluder);
    }
}
