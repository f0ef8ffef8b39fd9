// ls3d-parsers/src/fds/morph.rs
//! Morph targets for Morph and SingleMorph visuals

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ls3d_core::{BoundingBox, Vec3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::primitives::{checked_count, Axes, FdsReadExt, FdsWriteExt};
use crate::traits::{ParseError, ParseResult};

/// Position and normal of one vertex in one target
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MorphTarget {
    pub position: Vec3,
    pub normal: Vec3,
}

/// Morphed vertices of one channel
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MorphChannel {
    /// Per vertex, one entry per target
    pub vertices: Vec<SmallVec<[MorphTarget; 4]>>,
    /// Mesh vertex each entry applies to; `None` means sequential
    pub indices: Option<Vec<u16>>,
}

impl MorphChannel {
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Mesh vertex index of the `i`-th morphed vertex
    pub fn vertex_index(&self, i: usize) -> usize {
        match &self.indices {
            Some(indices) => indices.get(i).map_or(i, |&v| v as usize),
            None => i,
        }
    }
}

/// Channels and bounds of one LOD
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MorphLod {
    pub channels: Vec<MorphChannel>,
    pub bounds: BoundingBox,
    pub center: Vec3,
    pub radius: f32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MorphSet {
    pub target_count: u8,
    pub channel_count: u8,
    pub lods: Vec<MorphLod>,
}

impl MorphSet {
    pub fn is_empty(&self) -> bool {
        self.target_count == 0
    }
}

pub fn read_morph<R: Read>(reader: &mut R) -> ParseResult<MorphSet> {
    let target_count = reader.read_u8()?;
    if target_count == 0 {
        return Ok(MorphSet::default());
    }
    let channel_count = reader.read_u8()?;
    let lod_count = reader.read_u8()?;

    let mut lods = Vec::with_capacity(lod_count as usize);
    for _ in 0..lod_count {
        let mut channels = Vec::with_capacity(channel_count as usize);
        for _ in 0..channel_count {
            channels.push(read_channel(reader, target_count)?);
        }
        let bounds = reader.read_bbox(Axes::Swapped)?;
        let center = reader.read_vec3(Axes::Swapped)?;
        let radius = reader.read_f32::<LittleEndian>()?;
        lods.push(MorphLod {
            channels,
            bounds,
            center,
            radius,
        });
    }

    Ok(MorphSet {
        target_count,
        channel_count,
        lods,
    })
}

fn read_channel<R: Read>(reader: &mut R, target_count: u8) -> ParseResult<MorphChannel> {
    let vertex_count = reader.read_u16::<LittleEndian>()? as usize;
    if vertex_count == 0 {
        return Ok(MorphChannel::default());
    }

    let mut vertices = Vec::with_capacity(vertex_count);
    for _ in 0..vertex_count {
        let mut targets = SmallVec::with_capacity(target_count as usize);
        for _ in 0..target_count {
            let position = reader.read_vec3(Axes::Swapped)?;
            let normal = reader.read_vec3(Axes::Swapped)?;
            targets.push(MorphTarget { position, normal });
        }
        vertices.push(targets);
    }

    let indices = if reader.read_bool()? {
        Some(reader.read_u16_array(vertex_count)?)
    } else {
        None
    };

    Ok(MorphChannel { vertices, indices })
}

pub fn write_morph<W: Write>(writer: &mut W, morph: &MorphSet) -> ParseResult<()> {
    writer.write_u8(morph.target_count)?;
    if morph.target_count == 0 {
        return Ok(());
    }
    writer.write_u8(morph.channel_count)?;
    writer.write_u8(checked_count(morph.lods.len(), "morph LODs")?)?;

    for (level, lod) in morph.lods.iter().enumerate() {
        if lod.channels.len() != morph.channel_count as usize {
            return Err(ParseError::InvalidStructure(format!(
                "morph LOD {level} has {} channels, header declares {}",
                lod.channels.len(),
                morph.channel_count
            )));
        }
        for channel in &lod.channels {
            write_channel(writer, channel, morph.target_count)?;
        }
        writer.write_bbox(lod.bounds, Axes::Swapped)?;
        writer.write_vec3(lod.center, Axes::Swapped)?;
        writer.write_f32::<LittleEndian>(lod.radius)?;
    }

    Ok(())
}

fn write_channel<W: Write>(writer: &mut W, channel: &MorphChannel, target_count: u8) -> ParseResult<()> {
    writer.write_u16::<LittleEndian>(checked_count(channel.vertices.len(), "morph vertices")?)?;
    if channel.vertices.is_empty() {
        return Ok(());
    }

    for targets in &channel.vertices {
        if targets.len() != target_count as usize {
            return Err(ParseError::InvalidStructure(format!(
                "morph vertex has {} targets, header declares {target_count}",
                targets.len()
            )));
        }
        for target in targets {
            writer.write_vec3(target.position, Axes::Swapped)?;
            writer.write_vec3(target.normal, Axes::Swapped)?;
        }
    }

    match &channel.indices {
        Some(indices) => {
            if indices.len() != channel.vertices.len() {
                return Err(ParseError::InvalidStructure(format!(
                    "morph channel has {} indices for {} vertices",
                    indices.len(),
                    channel.vertices.len()
                )));
            }
            writer.write_bool(true)?;
            writer.write_u16_slice(indices)?;
        }
        None => writer.write_bool(false)?,
    }

    Ok(())
}

/// Name of one shape key: `Target_<t>_LOD<l>_Channel<c>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeKeyName {
    pub target: usize,
    pub lod: usize,
    pub channel: usize,
}

impl ShapeKeyName {
    pub const PATTERN: &'static str = "Target_<idx>_LOD<n>_Channel<m>";

    pub fn new(target: usize, lod: usize, channel: usize) -> Self {
        Self { target, lod, channel }
    }
}

impl fmt::Display for ShapeKeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target_{}_LOD{}_Channel{}", self.target, self.lod, self.channel)
    }
}

impl FromStr for ShapeKeyName {
    type Err = ls3d_core::Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let malformed = || ls3d_core::Error::MalformedName {
            name: name.to_string(),
            expected: Self::PATTERN,
        };

        let rest = name.strip_prefix("Target_").ok_or_else(malformed)?;
        let (target, rest) = rest.split_once("_LOD").ok_or_else(malformed)?;
        let (lod, channel) = rest.split_once("_Channel").ok_or_else(malformed)?;

        let number = |text: &str| -> Result<usize, Self::Err> {
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            text.parse().map_err(|_| malformed())
        };

        Ok(Self {
            target: number(target)?,
            lod: number(lod)?,
            channel: number(channel)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;
    use std::io::Cursor;

    fn target(x: f32) -> MorphTarget {
        MorphTarget {
            position: Vec3::new(x, 0.0, 1.0),
            normal: Vec3::new(0.0, 0.0, 1.0),
        }
    }

    fn sample() -> MorphSet {
        MorphSet {
            target_count: 2,
            channel_count: 2,
            lods: vec![MorphLod {
                channels: vec![
                    MorphChannel {
                        vertices: vec![smallvec![target(1.0), target(2.0)], smallvec![target(3.0), target(4.0)]],
                        indices: Some(vec![5, 2]),
                    },
                    MorphChannel::default(),
                ],
                bounds: BoundingBox::new(Vec3::ZERO, Vec3::ONE),
                center: Vec3::new(0.5, 0.5, 0.5),
                radius: 3.0f32.sqrt(),
            }],
        }
    }

    #[test]
    fn test_morph_roundtrip() {
        let morph = sample();
        let mut buf = Vec::new();
        write_morph(&mut buf, &morph).unwrap();
        buf.push(0xEE);

        let mut cursor = Cursor::new(buf);
        let decoded = read_morph(&mut cursor).unwrap();
        assert_eq!(decoded, morph);
        assert_eq!(cursor.read_u8().unwrap(), 0xEE);
        assert_eq!(decoded.lods[0].channels[0].vertex_index(1), 2);
    }

    #[test]
    fn test_zero_targets_is_one_byte() {
        let mut buf = Vec::new();
        write_morph(&mut buf, &MorphSet::default()).unwrap();
        assert_eq!(buf, vec![0]);
        assert!(read_morph(&mut Cursor::new(buf)).unwrap().is_empty());
    }

    #[test]
    fn test_target_count_mismatch_rejected() {
        let mut morph = sample();
        morph.target_count = 3;
        assert!(write_morph(&mut Vec::new(), &morph).is_err());
    }

    #[test]
    fn test_shape_key_names() {
        let name = ShapeKeyName::new(1, 0, 3);
        assert_eq!(name.to_string(), "Target_1_LOD0_Channel3");
        assert_eq!("Target_1_LOD0_Channel3".parse::<ShapeKeyName>().unwrap(), name);

        for bad in ["Basis", "Target_x_LOD0_Channel0", "Target_1_LOD0", "Target__LOD0_Channel1", "Target_1_LOD0_Channel+2"] {
            let err = bad.parse::<ShapeKeyName>().unwrap_err();
            assert!(err.is_recoverable(), "{bad}");
        }
    }
}
