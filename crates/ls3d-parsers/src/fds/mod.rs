// ls3d-parsers/src/fds/mod.rs
//! 4DS (LS3D engine model) codec
//!
//! A 4DS file is a flat list of typed frames forming a scene graph through
//! 1-based parent indices, preceded by a material table.
//!
//! # Format Structure
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      4DS File Structure                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    File Header                          ││
//! │  │  - Magic: "4DS\0"                                       ││
//! │  │  - Version (u16): 29, or 41 / 42 for the variants       ││
//! │  │  - Timestamp (u64): FILETIME ticks                      ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                  Material Table                         ││
//! │  │  - u16 count, flag-dependent records                    ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                     Frames                              ││
//! │  │  - u16 count, each a common header + typed payload      ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  - u8 animation flag                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Decoding stops at the first frame whose type the codec does not know.
//! The frames before it are returned and the stop is recorded in
//! [`FdsModel::truncated`].

mod frame;
mod material;
mod mesh;
mod morph;
pub mod primitives;
mod sector;
mod skin;
mod writer;

pub use frame::{
    payload_kind, read_frame, write_frame, DecodeContext, Frame, FrameHeader, FramePayload, FrameType, PayloadKind,
    VisualHeader, VisualType,
};
pub use material::{
    read_material, write_material, EnvMap, Material, MaterialCache, MaterialFlags, MaterialId, ANIMATION_BLOCK_SIZE,
};
pub use mesh::{read_object, write_object, FaceGroup, Lod, Object, Vertex};
pub use morph::{read_morph, write_morph, MorphChannel, MorphLod, MorphSet, MorphTarget, ShapeKeyName};
pub use sector::{
    read_occluder, read_sector, write_occluder, write_sector, BoundsPosition, GeometryLayout, Occluder, PointWidth,
    Portal, Sector,
};
pub use skin::{read_skin_lod, write_skin_lod, BoneSpan, SkinBone, SkinCursor, SkinLayout, SkinLod};
pub use writer::FdsWriter;

use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::{Cursor, ErrorKind, Read, Seek};
use std::path::Path;
use std::time::Instant;

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::traits::{
    HierarchicalParser, HumanReadable, ParseError, ParseOptions, ParsePhase, ParseProgress, ParseResult, Parser,
    ProgressCallback,
};

/// File magic
pub const MAGIC: &[u8; 4] = b"4DS\0";

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_OFFSET: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SECOND: i64 = 10_000_000;

/// Current time as Windows FILETIME ticks
pub fn filetime_now() -> u64 {
    filetime_from_datetime(Utc::now())
}

pub fn filetime_from_datetime(time: DateTime<Utc>) -> u64 {
    let seconds = time.timestamp() + FILETIME_UNIX_OFFSET;
    let ticks = seconds * FILETIME_TICKS_PER_SECOND + i64::from(time.timestamp_subsec_nanos() / 100);
    ticks.max(0) as u64
}

/// `None` for values outside chrono's range
pub fn filetime_to_datetime(ticks: u64) -> Option<DateTime<Utc>> {
    let ticks = i64::try_from(ticks).ok()?;
    let seconds = ticks / FILETIME_TICKS_PER_SECOND - FILETIME_UNIX_OFFSET;
    let nanos = (ticks % FILETIME_TICKS_PER_SECOND) as u32 * 100;
    Utc.timestamp_opt(seconds, nanos).single()
}

/// File format versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FdsVersion {
    /// Base version, fully supported
    Mafia,
    /// HD2 variant, best effort
    Hd2,
    /// Chameleon variant, best effort
    Chameleon,
}

impl FdsVersion {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            29 => Some(Self::Mafia),
            41 => Some(Self::Hd2),
            42 => Some(Self::Chameleon),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Mafia => 29,
            Self::Hd2 => 41,
            Self::Chameleon => 42,
        }
    }

    pub fn is_variant(self) -> bool {
        self != Self::Mafia
    }
}

/// Where and why the frame loop stopped early
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Truncation {
    /// 1-based index of the frame that was not decoded
    pub frame_index: u16,
    pub offset: u64,
    pub reason: String,
}

/// Decoded 4DS file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FdsModel {
    pub version: FdsVersion,
    /// FILETIME ticks from the header
    pub timestamp: u64,
    /// Unique materials
    pub materials: Vec<Material>,
    /// Material table in file order; face groups reference it 1-based
    pub material_slots: Vec<MaterialId>,
    pub frames: Vec<Frame>,
    /// Frame count stated by the header
    pub declared_frames: u16,
    pub truncated: Option<Truncation>,
    pub animated: bool,
}

impl FdsModel {
    /// Empty model stamped with the current time
    pub fn new(version: FdsVersion) -> Self {
        Self {
            version,
            timestamp: filetime_now(),
            materials: Vec::new(),
            material_slots: Vec::new(),
            frames: Vec::new(),
            declared_frames: 0,
            truncated: None,
            animated: false,
        }
    }

    /// Append a material and return its 1-based table reference
    pub fn push_material(&mut self, material: Material) -> u16 {
        let id = MaterialId(self.materials.len());
        self.materials.push(material);
        self.material_slots.push(id);
        self.material_slots.len() as u16
    }

    /// Append a frame and return its 1-based index
    pub fn push_frame(&mut self, header: FrameHeader, payload: FramePayload) -> u16 {
        let index = self.frames.len() as u16 + 1;
        self.frames.push(Frame {
            index,
            offset: 0,
            header,
            payload,
        });
        self.declared_frames = self.frames.len() as u16;
        index
    }

    /// Resolve a face-group material reference
    pub fn material_by_ref(&self, reference: u16) -> Option<&Material> {
        let slot = reference.checked_sub(1)? as usize;
        let id = self.material_slots.get(slot)?;
        self.materials.get(id.0)
    }

    pub fn material_id_by_ref(&self, reference: u16) -> Option<MaterialId> {
        let slot = reference.checked_sub(1)? as usize;
        self.material_slots.get(slot).copied()
    }

    pub fn frame(&self, index: u16) -> Option<&Frame> {
        let slot = index.checked_sub(1)? as usize;
        self.frames.get(slot).filter(|f| f.index == index)
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated.is_some()
    }

    /// Frames whose parent is absent, themselves, or unresolvable
    pub fn root_frames(&self) -> Vec<&Frame> {
        self.frames
            .iter()
            .filter(|f| match f.parent_index() {
                None => true,
                Some(parent) => parent == f.index || self.frame(parent).is_none(),
            })
            .collect()
    }

    pub fn child_frames(&self, index: u16) -> Vec<&Frame> {
        self.frames
            .iter()
            .filter(|f| f.header.parent_index == index && f.index != index)
            .collect()
    }

    pub fn vertex_count(&self) -> usize {
        self.frames
            .iter()
            .filter_map(|f| f.payload.object())
            .map(Object::vertex_count)
            .sum()
    }

    pub fn face_count(&self) -> usize {
        self.frames
            .iter()
            .filter_map(|f| f.payload.object())
            .map(Object::face_count)
            .sum()
    }
}

enum DecodeState {
    Header,
    MaterialTable,
    FrameLoop { next: u32, count: u16 },
    AnimationFlag,
    Done,
}

/// One decode session; owns its material cache and registries
struct Decoder<'a, R> {
    reader: R,
    options: &'a ParseOptions,
    progress: Option<&'a ProgressCallback>,
    cache: MaterialCache,
    model: FdsModel,
}

impl<'a, R: Read + Seek> Decoder<'a, R> {
    fn new(reader: R, options: &'a ParseOptions, progress: Option<&'a ProgressCallback>) -> Self {
        let mut model = FdsModel::new(FdsVersion::Mafia);
        model.timestamp = 0;
        Self {
            reader,
            options,
            progress,
            cache: MaterialCache::new(),
            model,
        }
    }

    fn report(&mut self, phase: ParsePhase, item: Option<String>, processed: u64, total: Option<u64>) {
        if let Some(cb) = self.progress {
            let mut progress = ParseProgress::new(phase, self.reader.stream_position().unwrap_or(0));
            progress.current_item = item;
            progress.items_processed = processed;
            progress.total_items = total;
            cb(progress);
        }
    }

    fn run(mut self) -> ParseResult<FdsModel> {
        let mut state = DecodeState::Header;
        loop {
            state = match state {
                DecodeState::Header => self.read_header()?,
                DecodeState::MaterialTable => self.read_material_table()?,
                DecodeState::FrameLoop { next, count } => self.read_next_frame(next, count)?,
                DecodeState::AnimationFlag => self.read_animation_flag()?,
                DecodeState::Done => break,
            };
        }

        self.report(ParsePhase::Complete, None, self.model.frames.len() as u64, None);
        let mut model = self.model;
        model.materials = self.cache.into_materials();
        Ok(model)
    }

    fn read_header(&mut self) -> ParseResult<DecodeState> {
        self.report(ParsePhase::ReadingHeader, None, 0, None);

        let mut magic = [0u8; 4];
        self.reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: MAGIC.to_vec(),
                found: magic.to_vec(),
            });
        }

        let raw_version = self.reader.read_u16::<LittleEndian>()?;
        let version = FdsVersion::from_u16(raw_version).ok_or(ParseError::UnsupportedVersion {
            version: raw_version as u32,
        })?;
        if version.is_variant() {
            if !self.options.allow_variant_versions {
                return Err(ParseError::UnsupportedVersion {
                    version: raw_version as u32,
                });
            }
            warn!(version = raw_version, "Variant 4DS version, decoding best effort");
        }

        self.model.version = version;
        self.model.timestamp = self.reader.read_u64::<LittleEndian>()?;
        debug!(version = raw_version, timestamp = self.model.timestamp, "4DS header");
        Ok(DecodeState::MaterialTable)
    }

    fn read_material_table(&mut self) -> ParseResult<DecodeState> {
        let count = self.reader.read_u16::<LittleEndian>()?;
        self.report(ParsePhase::ReadingMaterials, None, 0, Some(count as u64));

        for slot in 0..count {
            let id = read_material(&mut self.reader, &mut self.cache)
                .map_err(|e| e.with_context(format!("material {}", slot + 1)))?;
            self.model.material_slots.push(id);
        }
        debug!(slots = count, unique = self.cache.len(), "Material table");

        let frame_count = self.reader.read_u16::<LittleEndian>()?;
        self.model.declared_frames = frame_count;
        self.model.frames.reserve(frame_count as usize);
        Ok(DecodeState::FrameLoop {
            next: 1,
            count: frame_count,
        })
    }

    fn read_next_frame(&mut self, next: u32, count: u16) -> ParseResult<DecodeState> {
        if next > count as u32 {
            return Ok(DecodeState::AnimationFlag);
        }
        let index = next as u16;
        let offset = self.reader.stream_position()?;
        let ctx = DecodeContext {
            version: self.model.version,
            options: self.options,
        };

        match read_frame(&mut self.reader, &ctx, index) {
            Ok(frame) => {
                self.report(
                    ParsePhase::ParsingRecords,
                    Some(frame.header.name.clone()),
                    next as u64,
                    Some(count as u64),
                );
                self.model.frames.push(frame);
                crate::logging::log_progress(next as usize, count as usize);
                Ok(DecodeState::FrameLoop { next: next + 1, count })
            }
            Err(err) if matches!(err.root_cause(), ParseError::UnsupportedRecord { .. }) => {
                warn!(
                    frame = index,
                    offset,
                    decoded = self.model.frames.len(),
                    declared = count,
                    reason = %err,
                    "Unsupported frame, truncating frame list"
                );
                self.model.truncated = Some(Truncation {
                    frame_index: index,
                    offset,
                    reason: err.to_string(),
                });
                Ok(DecodeState::Done)
            }
            Err(err) => Err(err.with_context(format!("frame {index} of {count} at offset {offset}"))),
        }
    }

    fn read_animation_flag(&mut self) -> ParseResult<DecodeState> {
        self.report(ParsePhase::Finalizing, None, 0, None);
        match self.reader.read_u8() {
            Ok(flag) => {
                self.model.animated = flag != 0;
                if self.model.animated {
                    info!("Model is flagged as animated; animation data is not decoded");
                }
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("No trailing animation flag");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(DecodeState::Done)
    }
}

/// 4DS decoder
#[derive(Debug, Default)]
pub struct FdsParser;

impl FdsParser {
    pub fn new() -> Self {
        Self
    }

    fn fail_with_path(path: &Path, err: ParseError) -> ParseError {
        crate::log_parse_error!("4DS", err);
        err.with_context(path.display().to_string())
    }
}

impl Parser for FdsParser {
    type Output = FdsModel;

    fn extensions(&self) -> &[&str] {
        &["4ds"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(MAGIC)
    }

    fn name(&self) -> &str {
        "LS3D 4DS Model Codec"
    }

    fn supported_versions(&self) -> &[u32] {
        &[29, 41, 42]
    }

    fn parse_with_options<R: Read + Seek>(
        &self,
        reader: R,
        options: &ParseOptions,
        progress: Option<ProgressCallback>,
    ) -> ParseResult<Self::Output> {
        crate::logging::instrument_parse(self.name(), || {
            Decoder::new(reader, options, progress.as_ref()).run()
        })
    }

    fn parse_file_with_options(
        &self,
        path: &Path,
        options: &ParseOptions,
        progress: Option<ProgressCallback>,
    ) -> ParseResult<Self::Output> {
        crate::log_parse_start!(self.name(), path);
        let start = Instant::now();

        let file = std::fs::File::open(path).map_err(|e| Self::fail_with_path(path, e.into()))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        let result = if options.use_memory_mapping && size >= options.memory_mapping_threshold {
            self.parse_memory_mapped(path, options, progress)
        } else {
            self.parse_with_options(std::io::BufReader::new(file), options, progress)
        };

        let model = result.map_err(|e| Self::fail_with_path(path, e))?;
        crate::log_parse_complete!(self.name(), start.elapsed(), model.frames.len());
        Ok(model)
    }

    fn parse_memory_mapped(
        &self,
        path: &Path,
        options: &ParseOptions,
        progress: Option<ProgressCallback>,
    ) -> ParseResult<Self::Output> {
        let file = std::fs::File::open(path)?;
        // SAFETY: the mapping is read-only and dropped before this call returns.
        let mmap = unsafe { memmap2::Mmap::map(&file) }?;
        debug!(bytes = mmap.len(), "Decoding memory-mapped file");
        self.parse_with_options(Cursor::new(&mmap[..]), options, progress)
    }
}

impl HierarchicalParser for FdsParser {
    type Node = Frame;

    fn roots<'a>(&self, parsed: &'a FdsModel) -> Vec<&'a Frame> {
        parsed.root_frames()
    }

    fn children<'a>(&self, parsed: &'a FdsModel, node: &Frame) -> Vec<&'a Frame> {
        parsed.child_frames(node.index)
    }
}

/// One-line description of a frame payload
pub fn payload_summary(payload: &FramePayload) -> String {
    match payload {
        FramePayload::Dummy(bounds) => format!("dummy {:?}..{:?}", bounds.min.to_array(), bounds.max.to_array()),
        FramePayload::Target { links, .. } => format!("target -> {links:?}"),
        FramePayload::Sector(sector) => format!(
            "sector {} verts, {} faces, {} portals",
            sector.vertices.len(),
            sector.faces.len(),
            sector.portals.len()
        ),
        FramePayload::Occluder(occluder) => {
            format!("occluder {} verts, {} faces", occluder.vertices.len(), occluder.faces.len())
        }
        FramePayload::Joint { bone_id, .. } => format!("joint bone_id={bone_id}"),
        other => {
            let mut text = format!("{:?}", other.kind()).to_lowercase();
            if let Some(object) = other.object() {
                let _ = write!(text, " {} LODs, {} verts, {} faces", object.lods.len(), object.vertex_count(), object.face_count());
            }
            if let Some(morph) = other.morph() {
                let _ = write!(text, ", {} morph targets", morph.target_count);
            }
            text
        }
    }
}

impl HumanReadable for FdsModel {
    fn to_readable_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "4DS version {} ({:?})", self.version.as_u16(), self.version);
        if let Some(time) = filetime_to_datetime(self.timestamp) {
            let _ = writeln!(out, "Timestamp: {}", time.to_rfc3339());
        }
        let _ = writeln!(
            out,
            "Materials: {} slots, {} unique",
            self.material_slots.len(),
            self.materials.len()
        );
        let _ = writeln!(out, "Frames: {} of {} declared", self.frames.len(), self.declared_frames);
        if let Some(truncation) = &self.truncated {
            let _ = writeln!(
                out,
                "Truncated at frame {} (offset {}): {}",
                truncation.frame_index, truncation.offset, truncation.reason
            );
        }
        let _ = writeln!(out, "Animated: {}", self.animated);

        // Depth-first walk; `seen` guards against parent cycles.
        let mut seen = HashSet::new();
        let mut stack: Vec<(&Frame, usize)> = self.root_frames().into_iter().rev().map(|f| (f, 0)).collect();
        while let Some((frame, depth)) = stack.pop() {
            if !seen.insert(frame.index) {
                continue;
            }
            let _ = writeln!(
                out,
                "{}[{}] {} - {}",
                "  ".repeat(depth),
                frame.index,
                frame.header.name,
                payload_summary(&frame.payload)
            );
            for child in self.child_frames(frame.index).into_iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        out
    }

    fn to_json(&self) -> serde_json::Value {
        let frames: Vec<_> = self
            .frames
            .iter()
            .map(|f| {
                serde_json::json!({
                    "index": f.index,
                    "name": f.header.name,
                    "type": format!("{:?}", f.payload.kind()),
                    "parent": f.header.parent_index,
                    "offset": f.offset,
                })
            })
            .collect();

        serde_json::json!({
            "version": self.version.as_u16(),
            "timestamp": filetime_to_datetime(self.timestamp).map(|t| t.to_rfc3339()),
            "materials": self.materials.iter().map(|m| m.display_name()).collect::<Vec<_>>(),
            "material_slots": self.material_slots.len(),
            "declared_frames": self.declared_frames,
            "frames": frames,
            "truncated": self.truncated,
            "animated": self.animated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filetime_roundtrip() {
        let time = Utc.with_ymd_and_hms(2002, 8, 28, 12, 0, 0).single().unwrap();
        let ticks = filetime_from_datetime(time);
        assert_eq!(filetime_to_datetime(ticks), Some(time));
        assert_eq!(filetime_from_datetime(Utc.timestamp_opt(0, 0).single().unwrap()), 116_444_736_000_000_000);
    }

    #[test]
    fn test_version_mapping() {
        assert_eq!(FdsVersion::from_u16(29), Some(FdsVersion::Mafia));
        assert_eq!(FdsVersion::from_u16(30), None);
        assert!(FdsVersion::Chameleon.is_variant());
        assert_eq!(FdsVersion::Hd2.as_u16(), 41);
    }

    #[test]
    fn test_material_refs_are_one_based() {
        let mut model = FdsModel::new(FdsVersion::Mafia);
        let reference = model.push_material(Material::new());
        assert_eq!(reference, 1);
        assert!(model.material_by_ref(0).is_none());
        assert!(model.material_by_ref(1).is_some());
        assert!(model.material_by_ref(2).is_none());
    }

    #[test]
    fn test_roots_include_self_parented() {
        let mut model = FdsModel::new(FdsVersion::Mafia);
        let a = model.push_frame(FrameHeader::new(FrameType::Dummy, "a"), FramePayload::Dummy(Default::default()));
        let mut header = FrameHeader::new(FrameType::Dummy, "b");
        header.parent_index = 2;
        model.push_frame(header, FramePayload::Dummy(Default::default()));
        let mut header = FrameHeader::new(FrameType::Dummy, "c");
        header.parent_index = a;
        model.push_frame(header, FramePayload::Dummy(Default::default()));

        let roots: Vec<_> = model.root_frames().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(roots, vec!["a", "b"]);
        assert_eq!(model.child_frames(a).len(), 1);
        assert!(model.child_frames(2).is_empty());
        assert!(model.to_readable_string().contains("[3] c"));
    }
}
