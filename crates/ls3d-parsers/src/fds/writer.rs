// ls3d-parsers/src/fds/writer.rs
//! Encoder for [`FdsModel`]

use std::io::{Seek, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::{debug, info};

use super::frame::write_frame;
use super::material::write_material;
use super::primitives::checked_count;
use super::sector::GeometryLayout;
use super::{FdsModel, FdsVersion, MAGIC};
use crate::traits::{FormatWriter, ParseError, ParseResult};

/// Writes base-version (29) files
#[derive(Debug, Default)]
pub struct FdsWriter;

impl FdsWriter {
    pub fn new() -> Self {
        Self
    }
}

impl FormatWriter for FdsWriter {
    type Input = FdsModel;

    fn write<W: Write + Seek>(&self, model: &FdsModel, mut writer: W) -> ParseResult<()> {
        if model.version != FdsVersion::Mafia {
            return Err(ParseError::UnsupportedVersion {
                version: model.version.as_u16() as u32,
            });
        }
        let layout = GeometryLayout::for_version(model.version);

        writer.write_all(MAGIC)?;
        writer.write_u16::<LittleEndian>(model.version.as_u16())?;
        writer.write_u64::<LittleEndian>(model.timestamp)?;

        writer.write_u16::<LittleEndian>(checked_count(model.material_slots.len(), "materials")?)?;
        for (slot, id) in model.material_slots.iter().enumerate() {
            let material = model.materials.get(id.0).ok_or_else(|| {
                ParseError::InvalidStructure(format!("material slot {} points at missing material {}", slot + 1, id.0))
            })?;
            write_material(&mut writer, material)?;
        }

        writer.write_u16::<LittleEndian>(checked_count(model.frames.len(), "frames")?)?;
        for frame in &model.frames {
            debug!(index = frame.index, name = %frame.header.name, "Writing frame");
            write_frame(&mut writer, &frame.header, &frame.payload, layout)?;
        }

        writer.write_u8(u8::from(model.animated))?;
        writer.flush()?;

        info!(
            materials = model.material_slots.len(),
            frames = model.frames.len(),
            "Encoded 4DS model"
        );
        Ok(())
    }
}
