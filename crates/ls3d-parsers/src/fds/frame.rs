// ls3d-parsers/src/fds/frame.rs
//! Frame headers, payload dispatch and the per-frame codec

use std::io::{Read, Seek, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ls3d_core::{BoundingBox, Mat4x4, Quat, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::mesh::{read_object, write_object, Object};
use super::morph::{read_morph, write_morph, MorphSet};
use super::primitives::{checked_count, Axes, FdsReadExt, FdsWriteExt};
use super::sector::{read_occluder, read_sector, write_occluder, write_sector, GeometryLayout, Occluder, Sector};
use super::skin::{read_skin_lod, write_skin_lod, SkinLod};
use super::FdsVersion;
use crate::traits::{ParseError, ParseOptions, ParseResult};

/// Frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Visual = 1,
    Light = 2,
    Camera = 3,
    Sound = 4,
    Sector = 5,
    Dummy = 6,
    Target = 7,
    User = 8,
    Model = 9,
    Joint = 10,
    Volume = 11,
    Occluder = 12,
    Scene = 13,
    Area = 14,
    Landscape = 15,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Visual,
            2 => Self::Light,
            3 => Self::Camera,
            4 => Self::Sound,
            5 => Self::Sector,
            6 => Self::Dummy,
            7 => Self::Target,
            8 => Self::User,
            9 => Self::Model,
            10 => Self::Joint,
            11 => Self::Volume,
            12 => Self::Occluder,
            13 => Self::Scene,
            14 => Self::Area,
            15 => Self::Landscape,
            _ => return None,
        })
    }
}

/// Visual type byte, present only on Visual frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VisualType {
    Object = 0,
    LitObject = 1,
    SingleMesh = 2,
    SingleMorph = 3,
    Billboard = 4,
    Morph = 5,
    Lens = 6,
    Projector = 7,
    Mirror = 8,
    Emitter = 9,
    Shadow = 10,
    LandPatch = 11,
}

impl VisualType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Object,
            1 => Self::LitObject,
            2 => Self::SingleMesh,
            3 => Self::SingleMorph,
            4 => Self::Billboard,
            5 => Self::Morph,
            6 => Self::Lens,
            7 => Self::Projector,
            8 => Self::Mirror,
            9 => Self::Emitter,
            10 => Self::Shadow,
            11 => Self::LandPatch,
            _ => return None,
        })
    }
}

/// Payload shapes the codec understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Object,
    Billboard,
    SingleMesh,
    SingleMorph,
    Morph,
    Dummy,
    Target,
    Sector,
    Occluder,
    Joint,
}

/// `(frame type, visual type) -> payload`; anything absent is unsupported
static DISPATCH: &[(FrameType, Option<VisualType>, PayloadKind)] = &[
    (FrameType::Visual, Some(VisualType::Object), PayloadKind::Object),
    (FrameType::Visual, Some(VisualType::LitObject), PayloadKind::Object),
    (FrameType::Visual, Some(VisualType::Billboard), PayloadKind::Billboard),
    (FrameType::Visual, Some(VisualType::SingleMesh), PayloadKind::SingleMesh),
    (FrameType::Visual, Some(VisualType::SingleMorph), PayloadKind::SingleMorph),
    (FrameType::Visual, Some(VisualType::Morph), PayloadKind::Morph),
    (FrameType::Dummy, None, PayloadKind::Dummy),
    (FrameType::Target, None, PayloadKind::Target),
    (FrameType::Sector, None, PayloadKind::Sector),
    (FrameType::Occluder, None, PayloadKind::Occluder),
    (FrameType::Joint, None, PayloadKind::Joint),
];

pub fn payload_kind(frame_type: FrameType, visual_type: Option<VisualType>) -> Option<PayloadKind> {
    DISPATCH
        .iter()
        .find(|(f, v, _)| *f == frame_type && *v == visual_type)
        .map(|(_, _, kind)| *kind)
}

/// Visual-only header bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualHeader {
    pub visual_type: VisualType,
    /// Opaque render flags, preserved as read
    pub render_flags: [u8; 2],
}

/// Common header of every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub visual: Option<VisualHeader>,
    /// 0 = none, otherwise a 1-based frame index
    pub parent_index: u16,
    pub position: Vec3,
    pub scale: Vec3,
    pub rotation: Quat,
    pub culling_flags: u8,
    pub name: String,
    pub user_properties: String,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, name: impl Into<String>) -> Self {
        Self {
            frame_type,
            visual: None,
            parent_index: 0,
            position: Vec3::ZERO,
            scale: Vec3::ONE,
            rotation: Quat::IDENTITY,
            culling_flags: 0,
            name: name.into(),
            user_properties: String::new(),
        }
    }

    pub fn visual(visual_type: VisualType, name: impl Into<String>) -> Self {
        Self {
            visual: Some(VisualHeader {
                visual_type,
                render_flags: [0; 2],
            }),
            ..Self::new(FrameType::Visual, name)
        }
    }

    pub fn visual_type(&self) -> Option<VisualType> {
        self.visual.map(|v| v.visual_type)
    }

    pub fn payload_kind(&self) -> Option<PayloadKind> {
        payload_kind(self.frame_type, self.visual_type())
    }
}

/// Typed frame payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FramePayload {
    /// Object and LitObject visuals
    Object(Object),
    Billboard {
        object: Object,
        rotation_axis: u32,
        rotation_mode: u8,
    },
    SingleMesh {
        object: Object,
        /// One record per object LOD
        skin: Vec<SkinLod>,
    },
    SingleMorph {
        object: Object,
        skin: Vec<SkinLod>,
        morph: MorphSet,
    },
    Morph {
        object: Object,
        morph: MorphSet,
    },
    Dummy(BoundingBox),
    Target {
        flags: u16,
        links: Vec<u16>,
    },
    Sector(Sector),
    Occluder(Occluder),
    Joint {
        matrix: Mat4x4,
        bone_id: u32,
    },
}

impl FramePayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Object(_) => PayloadKind::Object,
            Self::Billboard { .. } => PayloadKind::Billboard,
            Self::SingleMesh { .. } => PayloadKind::SingleMesh,
            Self::SingleMorph { .. } => PayloadKind::SingleMorph,
            Self::Morph { .. } => PayloadKind::Morph,
            Self::Dummy(_) => PayloadKind::Dummy,
            Self::Target { .. } => PayloadKind::Target,
            Self::Sector(_) => PayloadKind::Sector,
            Self::Occluder(_) => PayloadKind::Occluder,
            Self::Joint { .. } => PayloadKind::Joint,
        }
    }

    /// Mesh geometry, for every visual payload
    pub fn object(&self) -> Option<&Object> {
        match self {
            Self::Object(object)
            | Self::Billboard { object, .. }
            | Self::SingleMesh { object, .. }
            | Self::SingleMorph { object, .. }
            | Self::Morph { object, .. } => Some(object),
            _ => None,
        }
    }

    pub fn skin(&self) -> Option<&[SkinLod]> {
        match self {
            Self::SingleMesh { skin, .. } | Self::SingleMorph { skin, .. } => Some(skin),
            _ => None,
        }
    }

    pub fn morph(&self) -> Option<&MorphSet> {
        match self {
            Self::SingleMorph { morph, .. } | Self::Morph { morph, .. } => Some(morph),
            _ => None,
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// 1-based position in the frame index space
    pub index: u16,
    /// Byte offset of the frame header
    pub offset: u64,
    pub header: FrameHeader,
    pub payload: FramePayload,
}

impl Frame {
    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn is_joint(&self) -> bool {
        self.header.frame_type == FrameType::Joint
    }

    pub fn parent_index(&self) -> Option<u16> {
        (self.header.parent_index != 0).then_some(self.header.parent_index)
    }
}

/// Per-file decode settings shared by the sub-codecs
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    pub version: FdsVersion,
    pub options: &'a ParseOptions,
}

impl DecodeContext<'_> {
    fn layout(&self) -> &'static GeometryLayout {
        GeometryLayout::for_version(self.version)
    }
}

fn unsupported(offset: u64, kind: String) -> ParseError {
    ParseError::UnsupportedRecord { offset, kind }
}

/// Read the type bytes and stop as soon as the pair is known to be unsupported
fn read_discriminant<R: Read>(reader: &mut R, offset: u64) -> ParseResult<(FrameType, Option<VisualHeader>, PayloadKind)> {
    let raw_type = reader.read_u8()?;
    let frame_type = FrameType::from_u8(raw_type)
        .ok_or_else(|| unsupported(offset, format!("unknown frame type {raw_type}")))?;

    if frame_type != FrameType::Visual {
        let kind = payload_kind(frame_type, None)
            .ok_or_else(|| unsupported(offset, format!("{frame_type:?} frame")))?;
        return Ok((frame_type, None, kind));
    }

    let raw_visual = reader.read_u8()?;
    let visual_type = VisualType::from_u8(raw_visual)
        .ok_or_else(|| unsupported(offset, format!("unknown visual type {raw_visual}")))?;
    let kind = payload_kind(frame_type, Some(visual_type))
        .ok_or_else(|| unsupported(offset, format!("{visual_type:?} visual")))?;

    let mut render_flags = [0u8; 2];
    reader.read_exact(&mut render_flags)?;
    Ok((frame_type, Some(VisualHeader { visual_type, render_flags }), kind))
}

pub fn read_frame<R: Read + Seek>(reader: &mut R, ctx: &DecodeContext<'_>, index: u16) -> ParseResult<Frame> {
    let offset = reader.stream_position()?;
    let (frame_type, visual, kind) = read_discriminant(reader, offset)?;

    let parent_index = reader.read_u16::<LittleEndian>()?;
    let position = reader.read_vec3(Axes::Swapped)?;
    let scale = reader.read_vec3(Axes::Swapped)?;
    let rotation = reader.read_quat(Axes::Swapped)?;
    let culling_flags = reader.read_u8()?;
    let name = reader.read_string8()?;
    let user_properties = reader.read_string8()?;

    let header = FrameHeader {
        frame_type,
        visual,
        parent_index,
        position,
        scale,
        rotation,
        culling_flags,
        name,
        user_properties,
    };
    debug!(index, offset, name = %header.name, ?kind, parent = parent_index, "Frame header");

    let payload = read_payload(reader, ctx, kind)
        .map_err(|e| e.with_context(format!("frame {index} '{}'", header.name)))?;

    Ok(Frame {
        index,
        offset,
        header,
        payload,
    })
}

fn read_skin<R: Read>(reader: &mut R, object: &Object) -> ParseResult<Vec<SkinLod>> {
    object.lods.iter().map(|lod| read_skin_lod(reader, lod.vertex_count)).collect()
}

fn read_checked_morph<R: Read + Seek>(reader: &mut R, ctx: &DecodeContext<'_>, object: &Object) -> ParseResult<MorphSet> {
    let offset = reader.stream_position()?;
    let morph = read_morph(reader)?;
    if !morph.is_empty() && morph.lods.len() != object.lods.len() {
        if ctx.options.strict_validation {
            return Err(ParseError::CorruptedData {
                offset,
                message: format!(
                    "morph declares {} LODs, object has {}",
                    morph.lods.len(),
                    object.lods.len()
                ),
            });
        }
        warn!(offset, morph_lods = morph.lods.len(), object_lods = object.lods.len(), "Morph LOD count mismatch");
    }
    Ok(morph)
}

fn read_payload<R: Read + Seek>(reader: &mut R, ctx: &DecodeContext<'_>, kind: PayloadKind) -> ParseResult<FramePayload> {
    Ok(match kind {
        PayloadKind::Object => FramePayload::Object(read_object(reader, ctx.options)?),
        PayloadKind::Billboard => {
            let object = read_object(reader, ctx.options)?;
            let rotation_axis = reader.read_u32::<LittleEndian>()?;
            let rotation_mode = reader.read_u8()?;
            FramePayload::Billboard {
                object,
                rotation_axis,
                rotation_mode,
            }
        }
        PayloadKind::SingleMesh => {
            let object = read_object(reader, ctx.options)?;
            let skin = read_skin(reader, &object)?;
            FramePayload::SingleMesh { object, skin }
        }
        PayloadKind::SingleMorph => {
            let object = read_object(reader, ctx.options)?;
            let skin = read_skin(reader, &object)?;
            let morph = read_checked_morph(reader, ctx, &object)?;
            FramePayload::SingleMorph { object, skin, morph }
        }
        PayloadKind::Morph => {
            let object = read_object(reader, ctx.options)?;
            let morph = read_checked_morph(reader, ctx, &object)?;
            FramePayload::Morph { object, morph }
        }
        PayloadKind::Dummy => FramePayload::Dummy(reader.read_bbox(Axes::Swapped)?),
        PayloadKind::Target => {
            let flags = reader.read_u16::<LittleEndian>()?;
            let count = reader.read_u8()? as usize;
            let links = reader.read_u16_array(count)?;
            FramePayload::Target { flags, links }
        }
        PayloadKind::Sector => FramePayload::Sector(read_sector(reader, ctx.layout())?),
        PayloadKind::Occluder => FramePayload::Occluder(read_occluder(reader, ctx.layout())?),
        PayloadKind::Joint => {
            let matrix = reader.read_matrix()?;
            let bone_id = reader.read_u32::<LittleEndian>()?;
            FramePayload::Joint { matrix, bone_id }
        }
    })
}

/// Encode header and payload of one frame. Culling flags are written as 0.
pub fn write_frame<W: Write>(writer: &mut W, header: &FrameHeader, payload: &FramePayload, layout: &GeometryLayout) -> ParseResult<()> {
    let declared = header.payload_kind().ok_or_else(|| {
        ParseError::InvalidStructure(format!(
            "frame '{}': {:?}/{:?} has no payload codec",
            header.name,
            header.frame_type,
            header.visual_type()
        ))
    })?;
    if declared != payload.kind() {
        return Err(ParseError::InvalidStructure(format!(
            "frame '{}': header declares {declared:?}, payload is {:?}",
            header.name,
            payload.kind()
        )));
    }

    writer.write_u8(header.frame_type as u8)?;
    if let Some(visual) = header.visual {
        writer.write_u8(visual.visual_type as u8)?;
        writer.write_all(&visual.render_flags)?;
    }
    writer.write_u16::<LittleEndian>(header.parent_index)?;
    writer.write_vec3(header.position, Axes::Swapped)?;
    writer.write_vec3(header.scale, Axes::Swapped)?;
    writer.write_quat(header.rotation, Axes::Swapped)?;
    writer.write_u8(0)?;
    writer.write_string8(&header.name)?;
    writer.write_string8(&header.user_properties)?;

    write_payload(writer, payload, layout)
        .map_err(|e| e.with_context(format!("frame '{}'", header.name)))
}

fn write_skin<W: Write>(writer: &mut W, object: &Object, skin: &[SkinLod]) -> ParseResult<()> {
    if skin.len() != object.lods.len() {
        return Err(ParseError::InvalidStructure(format!(
            "{} skin records for {} LODs",
            skin.len(),
            object.lods.len()
        )));
    }
    skin.iter().try_for_each(|lod| write_skin_lod(writer, lod))
}

fn write_payload<W: Write>(writer: &mut W, payload: &FramePayload, layout: &GeometryLayout) -> ParseResult<()> {
    match payload {
        FramePayload::Object(object) => write_object(writer, object),
        FramePayload::Billboard {
            object,
            rotation_axis,
            rotation_mode,
        } => {
            write_object(writer, object)?;
            writer.write_u32::<LittleEndian>(*rotation_axis)?;
            writer.write_u8(*rotation_mode)?;
            Ok(())
        }
        FramePayload::SingleMesh { object, skin } => {
            write_object(writer, object)?;
            write_skin(writer, object, skin)
        }
        FramePayload::SingleMorph { object, skin, morph } => {
            write_object(writer, object)?;
            write_skin(writer, object, skin)?;
            write_morph(writer, morph)
        }
        FramePayload::Morph { object, morph } => {
            write_object(writer, object)?;
            write_morph(writer, morph)
        }
        FramePayload::Dummy(bounds) => writer.write_bbox(*bounds, Axes::Swapped),
        FramePayload::Target { flags, links } => {
            writer.write_u16::<LittleEndian>(*flags)?;
            writer.write_u8(checked_count(links.len(), "target links")?)?;
            writer.write_u16_slice(links)
        }
        FramePayload::Sector(sector) => write_sector(writer, sector, layout),
        FramePayload::Occluder(occluder) => write_occluder(writer, occluder, layout),
        FramePayload::Joint { matrix, bone_id } => {
            writer.write_matrix(matrix)?;
            writer.write_u32::<LittleEndian>(*bone_id)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn base_layout() -> &'static GeometryLayout {
        GeometryLayout::for_version(FdsVersion::Mafia)
    }

    fn decode(bytes: Vec<u8>) -> ParseResult<Frame> {
        let options = ParseOptions::default();
        let ctx = DecodeContext {
            version: FdsVersion::Mafia,
            options: &options,
        };
        read_frame(&mut Cursor::new(bytes), &ctx, 1)
    }

    #[test]
    fn test_dispatch_table() {
        assert_eq!(payload_kind(FrameType::Visual, Some(VisualType::LitObject)), Some(PayloadKind::Object));
        assert_eq!(payload_kind(FrameType::Joint, None), Some(PayloadKind::Joint));
        assert_eq!(payload_kind(FrameType::Visual, Some(VisualType::Mirror)), None);
        assert_eq!(payload_kind(FrameType::Light, None), None);
        assert_eq!(payload_kind(FrameType::Visual, None), None);
    }

    #[test]
    fn test_dummy_frame_roundtrip() {
        let mut header = FrameHeader::new(FrameType::Dummy, "Box");
        header.position = Vec3::new(1.0, 2.0, 3.0);
        header.rotation = Quat::new(0.5, 0.5, 0.5, 0.5);
        header.user_properties = "lod=1".into();
        let payload = FramePayload::Dummy(BoundingBox::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::ONE));

        let mut buf = Vec::new();
        write_frame(&mut buf, &header, &payload, base_layout()).unwrap();
        let frame = decode(buf).unwrap();
        assert_eq!(frame.header, header);
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.parent_index(), None);
    }

    #[test]
    fn test_culling_flags_written_as_zero() {
        let mut header = FrameHeader::new(FrameType::Dummy, "d");
        header.culling_flags = 9;
        let mut buf = Vec::new();
        write_frame(&mut buf, &header, &FramePayload::Dummy(BoundingBox::ZERO), base_layout()).unwrap();
        assert_eq!(decode(buf).unwrap().header.culling_flags, 0);
    }

    #[test]
    fn test_target_and_joint_roundtrip() {
        let cases = [
            (
                FrameHeader::new(FrameType::Target, "t"),
                FramePayload::Target {
                    flags: 0x0102,
                    links: vec![3, 4, 9],
                },
            ),
            (
                FrameHeader::new(FrameType::Joint, "bone"),
                FramePayload::Joint {
                    matrix: Mat4x4::IDENTITY,
                    bone_id: 12,
                },
            ),
        ];
        for (header, payload) in cases {
            let mut buf = Vec::new();
            write_frame(&mut buf, &header, &payload, base_layout()).unwrap();
            let frame = decode(buf).unwrap();
            assert_eq!(frame.payload, payload);
            assert!(frame.header.visual.is_none());
        }
    }

    #[test]
    fn test_unsupported_stops_after_discriminant() {
        // Light frame: only the type byte is consumed
        let mut cursor = Cursor::new(vec![2u8, 0xFF, 0xFF]);
        let options = ParseOptions::default();
        let ctx = DecodeContext {
            version: FdsVersion::Mafia,
            options: &options,
        };
        let err = read_frame(&mut cursor, &ctx, 3).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedRecord { offset: 0, .. }));
        assert_eq!(cursor.position(), 1);

        // Mirror visual: type and visual bytes consumed
        let mut cursor = Cursor::new(vec![1u8, 8, 0, 0]);
        let err = read_frame(&mut cursor, &ctx, 3).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedRecord { .. }));
        assert_eq!(cursor.position(), 2);
    }

    #[test]
    fn test_header_payload_mismatch_rejected() {
        let header = FrameHeader::visual(VisualType::SingleMesh, "m");
        let err = write_frame(&mut Vec::new(), &header, &FramePayload::Dummy(BoundingBox::ZERO), base_layout()).unwrap_err();
        assert!(matches!(err, ParseError::InvalidStructure(_)));
    }
}
