//! Fixed-width primitives of the 4DS stream.
//!
//! Everything is little-endian. Strings carry a one byte length followed by
//! Windows-1250 text. Vectors and quaternions are read either as stored or
//! with Y and Z swapped; each call site picks one, see [`Axes`].

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use encoding_rs::{EncoderResult, WINDOWS_1250};
use ls3d_core::{AxisSwap, BoundingBox, Mat4x4, Quat, Vec2, Vec3, Vec4};

use crate::traits::{ParseError, ParseResult};

/// Longest string a single length byte can describe
pub const MAX_STRING_LEN: usize = u8::MAX as usize;

/// Byte size of one stored vertex: position, normal, uv
pub const VERTEX_RECORD_SIZE: i64 = 12 + 12 + 8;

/// Elements read per step by the array readers
const ARRAY_CHUNK: usize = 1024;

/// Byte size of one stored triangle
pub const FACE_RECORD_SIZE: i64 = 6;

/// Axis handling for a vector or quaternion field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axes {
    /// Components in stored order
    Raw,
    /// Y and Z exchanged (engine Y-up to scene Z-up and back)
    Swapped,
}

impl Axes {
    fn apply<T: AxisSwap>(self, value: T) -> T {
        match self {
            Axes::Raw => value,
            Axes::Swapped => value.swap_axes(),
        }
    }
}

/// Decode Windows-1250 bytes, replacing anything undecodable
pub fn decode_text(bytes: &[u8]) -> String {
    let (text, _had_errors) = WINDOWS_1250.decode_without_bom_handling(bytes);
    text.into_owned()
}

/// Encode to Windows-1250, writing `?` for characters with no mapping
pub fn encode_text(text: &str) -> Vec<u8> {
    let mut encoder = WINDOWS_1250.new_encoder();
    let mut out = Vec::with_capacity(text.len());
    let mut buffer = [0u8; 256];
    let mut rest = text;

    loop {
        let (result, read, written) =
            encoder.encode_from_utf8_without_replacement(rest, &mut buffer, true);
        out.extend_from_slice(&buffer[..written]);
        rest = &rest[read..];
        match result {
            EncoderResult::InputEmpty => break,
            EncoderResult::OutputFull => {}
            EncoderResult::Unmappable(_) => out.push(b'?'),
        }
    }

    out
}

/// Narrow an in-memory length to the width of its count field
pub fn checked_count<T: TryFrom<usize>>(length: usize, what: &str) -> ParseResult<T> {
    T::try_from(length).map_err(|_| {
        ParseError::InvalidStructure(format!("too many {what} for the count field: {length}"))
    })
}

/// Validate a triangle index slice
pub fn face_from_slice(indices: &[u16]) -> ParseResult<[u16; 3]> {
    <[u16; 3]>::try_from(indices).map_err(|_| ParseError::InvalidFaceArity {
        arity: indices.len(),
    })
}

/// Reading side of the 4DS primitives
pub trait FdsReadExt: Read {
    fn read_string8(&mut self) -> ParseResult<String> {
        let length = self.read_u8()? as usize;
        if length == 0 {
            return Ok(String::new());
        }
        let mut bytes = vec![0u8; length];
        self.read_exact(&mut bytes)?;
        Ok(decode_text(&bytes))
    }

    fn read_vec2(&mut self) -> ParseResult<Vec2> {
        let x = self.read_f32::<LittleEndian>()?;
        let y = self.read_f32::<LittleEndian>()?;
        Ok(Vec2::new(x, y))
    }

    fn read_vec3(&mut self, axes: Axes) -> ParseResult<Vec3> {
        let x = self.read_f32::<LittleEndian>()?;
        let y = self.read_f32::<LittleEndian>()?;
        let z = self.read_f32::<LittleEndian>()?;
        Ok(axes.apply(Vec3::new(x, y, z)))
    }

    fn read_vec4(&mut self) -> ParseResult<Vec4> {
        let x = self.read_f32::<LittleEndian>()?;
        let y = self.read_f32::<LittleEndian>()?;
        let z = self.read_f32::<LittleEndian>()?;
        let w = self.read_f32::<LittleEndian>()?;
        Ok(Vec4::new(x, y, z, w))
    }

    /// Stored scalar first: w, x, y, z
    fn read_quat(&mut self, axes: Axes) -> ParseResult<Quat> {
        let w = self.read_f32::<LittleEndian>()?;
        let x = self.read_f32::<LittleEndian>()?;
        let y = self.read_f32::<LittleEndian>()?;
        let z = self.read_f32::<LittleEndian>()?;
        Ok(axes.apply(Quat::new(w, x, y, z)))
    }

    fn read_bbox(&mut self, axes: Axes) -> ParseResult<BoundingBox> {
        let min = self.read_vec3(axes)?;
        let max = self.read_vec3(axes)?;
        Ok(BoundingBox::new(min, max))
    }

    /// 16 floats, four per row, no transpose
    fn read_matrix(&mut self) -> ParseResult<Mat4x4> {
        let mut flat = [0f32; 16];
        self.read_f32_into::<LittleEndian>(&mut flat)?;
        Ok(Mat4x4::from_flat(&flat))
    }

    fn read_face(&mut self) -> ParseResult<[u16; 3]> {
        let mut face = [0u16; 3];
        self.read_u16_into::<LittleEndian>(&mut face)?;
        Ok(face)
    }

    /// Grows with the bytes actually read, so a bogus count ends in EOF
    fn read_f32_array(&mut self, count: usize) -> ParseResult<Vec<f32>> {
        let mut values = Vec::with_capacity(count.min(ARRAY_CHUNK));
        let mut chunk = [0f32; ARRAY_CHUNK];
        while values.len() < count {
            let n = (count - values.len()).min(ARRAY_CHUNK);
            self.read_f32_into::<LittleEndian>(&mut chunk[..n])?;
            values.extend_from_slice(&chunk[..n]);
        }
        Ok(values)
    }

    fn read_u16_array(&mut self, count: usize) -> ParseResult<Vec<u16>> {
        let mut values = Vec::with_capacity(count.min(ARRAY_CHUNK));
        let mut chunk = [0u16; ARRAY_CHUNK];
        while values.len() < count {
            let n = (count - values.len()).min(ARRAY_CHUNK);
            self.read_u16_into::<LittleEndian>(&mut chunk[..n])?;
            values.extend_from_slice(&chunk[..n]);
        }
        Ok(values)
    }

    fn read_bool(&mut self) -> ParseResult<bool> {
        Ok(self.read_u8()? != 0)
    }
}

impl<R: Read + ?Sized> FdsReadExt for R {}

/// Writing side of the 4DS primitives
pub trait FdsWriteExt: Write {
    /// Fails with [`ParseError::StringTooLong`] before writing anything
    fn write_string8(&mut self, text: &str) -> ParseResult<()> {
        let encoded = encode_text(text);
        let length = u8::try_from(encoded.len())
            .map_err(|_| ParseError::StringTooLong { length: encoded.len() })?;
        self.write_u8(length)?;
        self.write_all(&encoded)?;
        Ok(())
    }

    fn write_vec2(&mut self, value: Vec2) -> ParseResult<()> {
        self.write_f32::<LittleEndian>(value.x)?;
        self.write_f32::<LittleEndian>(value.y)?;
        Ok(())
    }

    fn write_vec3(&mut self, value: Vec3, axes: Axes) -> ParseResult<()> {
        let v = axes.apply(value);
        self.write_f32::<LittleEndian>(v.x)?;
        self.write_f32::<LittleEndian>(v.y)?;
        self.write_f32::<LittleEndian>(v.z)?;
        Ok(())
    }

    fn write_vec4(&mut self, value: Vec4) -> ParseResult<()> {
        for component in value.to_array() {
            self.write_f32::<LittleEndian>(component)?;
        }
        Ok(())
    }

    fn write_quat(&mut self, value: Quat, axes: Axes) -> ParseResult<()> {
        let q = axes.apply(value);
        self.write_f32::<LittleEndian>(q.w)?;
        self.write_f32::<LittleEndian>(q.x)?;
        self.write_f32::<LittleEndian>(q.y)?;
        self.write_f32::<LittleEndian>(q.z)?;
        Ok(())
    }

    fn write_bbox(&mut self, value: BoundingBox, axes: Axes) -> ParseResult<()> {
        self.write_vec3(value.min, axes)?;
        self.write_vec3(value.max, axes)
    }

    fn write_matrix(&mut self, value: &Mat4x4) -> ParseResult<()> {
        self.write_f32_slice(&value.to_flat())
    }

    /// Exactly three indices, otherwise [`ParseError::InvalidFaceArity`]
    fn write_face(&mut self, indices: &[u16]) -> ParseResult<()> {
        let face = face_from_slice(indices)?;
        for index in face {
            self.write_u16::<LittleEndian>(index)?;
        }
        Ok(())
    }

    fn write_f32_slice(&mut self, values: &[f32]) -> ParseResult<()> {
        for value in values {
            self.write_f32::<LittleEndian>(*value)?;
        }
        Ok(())
    }

    fn write_u16_slice(&mut self, values: &[u16]) -> ParseResult<()> {
        for value in values {
            self.write_u16::<LittleEndian>(*value)?;
        }
        Ok(())
    }

    fn write_bool(&mut self, value: bool) -> ParseResult<()> {
        self.write_u8(u8::from(value))?;
        Ok(())
    }
}

impl<W: Write + ?Sized> FdsWriteExt for W {}
