// ls3d-parsers/src/fds/skin.rs
//! Skin weights for SingleMesh and SingleMorph visuals.
//!
//! Vertex indices are never stored. Each bone owns the next `locked_count`
//! vertices (weight 1.0) followed by the next `weights.len()` vertices
//! (partial weight), taken from one running cursor in bone declaration
//! order. Whatever the bones leave over belongs to the base bone.
//! [`SkinCursor`] makes that assignment explicit.

use std::io::{Read, Write};
use std::ops::Range;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ls3d_core::{BoundingBox, Mat4x4};
use serde::{Deserialize, Serialize};

use super::primitives::{checked_count, Axes, FdsReadExt, FdsWriteExt};
use crate::traits::{ParseError, ParseResult};

/// Per-bone skin record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkinBone {
    pub inverse_bind: Mat4x4,
    pub locked_count: u32,
    /// Engine bone id, matching the `bone_id` of a joint frame
    pub bone_id: u32,
    pub bounds: BoundingBox,
    /// One weight per partially weighted vertex
    pub weights: Vec<f32>,
}

impl SkinBone {
    pub fn weighted_count(&self) -> usize {
        self.weights.len()
    }
}

/// Skin record of one LOD
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SkinLod {
    /// Stored for information only
    pub non_weighted_count: u32,
    pub bounds: BoundingBox,
    pub bones: Vec<SkinBone>,
}

/// Vertex ranges one bone owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoneSpan {
    pub bone: usize,
    pub locked: Range<usize>,
    pub weighted: Range<usize>,
}

impl BoneSpan {
    pub fn len(&self) -> usize {
        self.locked.len() + self.weighted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Complete vertex-to-bone assignment of one LOD
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkinLayout {
    pub spans: Vec<BoneSpan>,
    /// Vertices left to the base bone
    pub base: Range<usize>,
    /// Vertices the bones claimed beyond the end of the mesh
    pub overflow: usize,
}

impl SkinLayout {
    pub fn covered(&self) -> usize {
        self.spans.iter().map(BoneSpan::len).sum::<usize>() + self.base.len()
    }
}

/// Running cursor over a mesh's vertices, clamped to its end
#[derive(Debug, Clone)]
pub struct SkinCursor {
    position: usize,
    total: usize,
    overflow: usize,
}

impl SkinCursor {
    pub fn new(total: usize) -> Self {
        Self {
            position: 0,
            total,
            overflow: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Claim the next `count` vertices
    pub fn take(&mut self, count: usize) -> Range<usize> {
        let start = self.position;
        let end = start.saturating_add(count).min(self.total);
        self.overflow += count - (end - start);
        self.position = end;
        start..end
    }

    /// Remaining vertices and the accumulated overflow
    pub fn finish(self) -> (Range<usize>, usize) {
        (self.position..self.total, self.overflow)
    }
}

impl SkinLod {
    /// Assign `vertex_count` vertices to bones
    pub fn layout(&self, vertex_count: usize) -> SkinLayout {
        let mut cursor = SkinCursor::new(vertex_count);
        let spans = self
            .bones
            .iter()
            .enumerate()
            .map(|(bone, record)| BoneSpan {
                bone,
                locked: cursor.take(record.locked_count as usize),
                weighted: cursor.take(record.weighted_count()),
            })
            .collect();
        let (base, overflow) = cursor.finish();
        SkinLayout { spans, base, overflow }
    }
}

/// Skin record of one LOD holding `vertex_count` vertices
pub fn read_skin_lod<R: Read>(reader: &mut R, vertex_count: usize) -> ParseResult<SkinLod> {
    let bone_count = reader.read_u8()?;
    let non_weighted_count = reader.read_u32::<LittleEndian>()?;
    let bounds = reader.read_bbox(Axes::Swapped)?;

    let mut bones = Vec::with_capacity(bone_count as usize);
    for _ in 0..bone_count {
        let inverse_bind = reader.read_matrix()?;
        let locked_count = reader.read_u32::<LittleEndian>()?;
        let weighted_count = reader.read_u32::<LittleEndian>()? as usize;
        let bone_id = reader.read_u32::<LittleEndian>()?;
        let bounds = reader.read_bbox(Axes::Swapped)?;
        if weighted_count > vertex_count {
            return Err(ParseError::InvalidStructure(format!(
                "bone {bone_id} weights {weighted_count} vertices of a {vertex_count}-vertex LOD"
            )));
        }
        let weights = reader.read_f32_array(weighted_count)?;
        bones.push(SkinBone {
            inverse_bind,
            locked_count,
            bone_id,
            bounds,
            weights,
        });
    }

    Ok(SkinLod {
        non_weighted_count,
        bounds,
        bones,
    })
}

pub fn write_skin_lod<W: Write>(writer: &mut W, skin: &SkinLod) -> ParseResult<()> {
    writer.write_u8(checked_count(skin.bones.len(), "bones")?)?;
    writer.write_u32::<LittleEndian>(skin.non_weighted_count)?;
    writer.write_bbox(skin.bounds, Axes::Swapped)?;

    for bone in &skin.bones {
        writer.write_matrix(&bone.inverse_bind)?;
        writer.write_u32::<LittleEndian>(bone.locked_count)?;
        writer.write_u32::<LittleEndian>(checked_count(bone.weights.len(), "weights")?)?;
        writer.write_u32::<LittleEndian>(bone.bone_id)?;
        writer.write_bbox(bone.bounds, Axes::Swapped)?;
        writer.write_f32_slice(&bone.weights)?;
    }

    Ok(())
}
