//! Material records.
//!
//! A record is a flag word followed by a tail whose shape depends on the
//! flags: the environment block, the diffuse name, the alpha name and the
//! animated texture block are each optional. Decoding always consumes the
//! whole tail, even when the diffuse name hits the cache, so the stream stays
//! aligned for the next record.

use std::collections::HashMap;
use std::io::{Read, Write};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ls3d_core::Vec3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::primitives::{Axes, FdsReadExt, FdsWriteExt};
use crate::traits::ParseResult;

bitflags! {
    /// Material flag word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MaterialFlags: u32 {
        const NORMTEXBLEND = 0x0000_0100;
        const MULTIPLYTEXBLEND = 0x0000_0200;
        const ADDTEXBLEND = 0x0000_0400;
        const CALCREFLECTTEXY = 0x0000_1000;
        const PROJECTREFLECTTEXY = 0x0000_2000;
        const PROJECTREFLECTTEXZ = 0x0000_4000;
        const ADDEFFECT = 0x0000_8000;
        const DIFFUSETEX = 0x0004_0000;
        const ENVMAP = 0x0008_0000;
        const MIPMAP = 0x0080_0000;
        const ANIMTEXALPHA = 0x0200_0000;
        const ANIMTEXDIFF = 0x0400_0000;
        const COLORED = 0x0800_0000;
        const DOUBLESIDED = 0x1000_0000;
        const COLORKEY = 0x2000_0000;
        const ALPHATEX = 0x4000_0000;
        const ADDITIVEMIX = 0x8000_0000;

        // Bits outside the named set survive a round trip untouched.
        const _ = !0;
    }
}

impl MaterialFlags {
    /// The alpha name is present only when both bits are set
    pub fn has_alpha_texture(self) -> bool {
        self.contains(Self::ADDEFFECT | Self::ALPHATEX)
    }

    pub fn has_env_map(self) -> bool {
        self.contains(Self::ENVMAP)
    }

    pub fn is_animated(self) -> bool {
        self.contains(Self::ANIMTEXDIFF)
    }

    pub fn uses_color_key(self) -> bool {
        self.contains(Self::COLORKEY)
    }
}

/// Byte size of the animated texture block
pub const ANIMATION_BLOCK_SIZE: usize = 18;

/// Environment reflection block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvMap {
    pub metallic: f32,
    pub texture: String,
}

/// One decoded material record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub flags: MaterialFlags,
    pub ambient: Vec3,
    pub diffuse: Vec3,
    pub emission: Vec3,
    pub opacity: f32,
    pub env: Option<EnvMap>,
    /// Lower-cased diffuse texture file name, possibly empty
    pub diffuse_texture: String,
    pub alpha_texture: Option<String>,
    /// Frame count, frame length and padding; kept opaque
    pub animation: Option<[u8; ANIMATION_BLOCK_SIZE]>,
}

impl Material {
    /// Opaque white material with no textures
    pub fn new() -> Self {
        Self {
            flags: MaterialFlags::empty(),
            ambient: Vec3::ONE,
            diffuse: Vec3::ONE,
            emission: Vec3::ZERO,
            opacity: 1.0,
            env: None,
            diffuse_texture: String::new(),
            alpha_texture: None,
            animation: None,
        }
    }

    /// Name the material is known by in the scene
    pub fn display_name(&self) -> &str {
        if self.diffuse_texture.is_empty() {
            "material"
        } else {
            &self.diffuse_texture
        }
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::new()
    }
}

/// Index into [`MaterialCache::materials`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaterialId(pub usize);

/// Deduplicates materials by diffuse texture name within one decode session
#[derive(Debug, Default)]
pub struct MaterialCache {
    materials: Vec<Material>,
    by_name: HashMap<String, MaterialId>,
}

impl MaterialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn into_materials(self) -> Vec<Material> {
        self.materials
    }

    fn lookup(&self, name: &str) -> Option<MaterialId> {
        // Unnamed materials carry their own colours and are never shared.
        if name.is_empty() {
            return None;
        }
        self.by_name.get(name).copied()
    }

    fn insert(&mut self, material: Material) -> MaterialId {
        let id = MaterialId(self.materials.len());
        if !material.diffuse_texture.is_empty() {
            self.by_name.insert(material.diffuse_texture.clone(), id);
        }
        self.materials.push(material);
        id
    }
}

/// Decode one material record, returning the shared handle
pub fn read_material<R: Read>(reader: &mut R, cache: &mut MaterialCache) -> ParseResult<MaterialId> {
    let flags = MaterialFlags::from_bits_retain(reader.read_u32::<LittleEndian>()?);

    // Colours are stored in engine order but never axis-swapped.
    let ambient = reader.read_vec3(Axes::Raw)?;
    let diffuse = reader.read_vec3(Axes::Raw)?;
    let emission = reader.read_vec3(Axes::Raw)?;
    let opacity = reader.read_f32::<LittleEndian>()?;

    let env = if flags.has_env_map() {
        let metallic = reader.read_f32::<LittleEndian>()?;
        let texture = reader.read_string8()?;
        Some(EnvMap { metallic, texture })
    } else {
        None
    };

    let diffuse_texture = reader.read_string8()?.to_lowercase();

    // The tail is consumed whether or not the cache already knows the name.
    let alpha_texture = if flags.has_alpha_texture() {
        Some(reader.read_string8()?.to_lowercase())
    } else {
        None
    };
    let animation = if flags.is_animated() {
        let mut block = [0u8; ANIMATION_BLOCK_SIZE];
        reader.read_exact(&mut block)?;
        Some(block)
    } else {
        None
    };

    if let Some(id) = cache.lookup(&diffuse_texture) {
        debug!(texture = %diffuse_texture, material = id.0, "Reusing cached material");
        return Ok(id);
    }

    Ok(cache.insert(Material {
        flags,
        ambient,
        diffuse,
        emission,
        opacity,
        env,
        diffuse_texture,
        alpha_texture,
        animation,
    }))
}

/// Encode one material record. Ambient and diffuse are always white.
pub fn write_material<W: Write>(writer: &mut W, material: &Material) -> ParseResult<()> {
    let flags = material.flags;
    writer.write_u32::<LittleEndian>(flags.bits())?;
    writer.write_vec3(Vec3::ONE, Axes::Raw)?;
    writer.write_vec3(Vec3::ONE, Axes::Raw)?;
    writer.write_vec3(material.emission, Axes::Raw)?;
    writer.write_f32::<LittleEndian>(material.opacity)?;

    if flags.has_env_map() {
        let (metallic, texture) = material
            .env
            .as_ref()
            .map_or((0.0, ""), |env| (env.metallic, env.texture.as_str()));
        writer.write_f32::<LittleEndian>(metallic)?;
        writer.write_string8(texture)?;
    }

    writer.write_string8(&material.diffuse_texture)?;

    if flags.has_alpha_texture() {
        writer.write_string8(material.alpha_texture.as_deref().unwrap_or(""))?;
    }
    if flags.is_animated() {
        writer.write_all(&material.animation.unwrap_or([0; ANIMATION_BLOCK_SIZE]))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn textured(name: &str, flags: MaterialFlags) -> Material {
        Material {
            flags: flags | MaterialFlags::DIFFUSETEX,
            diffuse_texture: name.to_string(),
            alpha_texture: flags.has_alpha_texture().then(|| "alpha.bmp".to_string()),
            animation: flags.is_animated().then_some([7; ANIMATION_BLOCK_SIZE]),
            env: flags.has_env_map().then(|| EnvMap {
                metallic: 0.25,
                texture: "env.bmp".into(),
            }),
            ..Material::new()
        }
    }

    fn encode(materials: &[Material]) -> Vec<u8> {
        let mut buf = Vec::new();
        for material in materials {
            write_material(&mut buf, material).unwrap();
        }
        buf
    }

    #[test]
    fn test_cache_hit_shares_handle_and_consumes_tail() {
        let tail = MaterialFlags::ADDEFFECT | MaterialFlags::ALPHATEX | MaterialFlags::ANIMTEXDIFF;
        let same = encode(&[textured("wall.bmp", tail), textured("wall.bmp", tail)]);
        let distinct = encode(&[textured("wall.bmp", tail), textured("roof.bmp", tail)]);
        assert_eq!(same.len(), distinct.len());

        let mut cache = MaterialCache::new();
        let mut cursor = Cursor::new(&same);
        let first = read_material(&mut cursor, &mut cache).unwrap();
        let after_first = cursor.position();
        let second = read_material(&mut cursor, &mut cache).unwrap();
        let after_same = cursor.position();

        let mut other_cache = MaterialCache::new();
        let mut other = Cursor::new(&distinct);
        let a = read_material(&mut other, &mut other_cache).unwrap();
        assert_eq!(other.position(), after_first);
        let b = read_material(&mut other, &mut other_cache).unwrap();

        assert_eq!(first, second);
        assert_ne!(a, b);
        assert_eq!(cache.len(), 1);
        assert_eq!(other_cache.len(), 2);
        assert_eq!(after_same, other.position());
        assert_eq!(after_same, same.len() as u64);
    }

    #[test]
    fn test_cache_is_case_insensitive() {
        let bytes = encode(&[
            textured("WALL.BMP", MaterialFlags::empty()),
            textured("wall.bmp", MaterialFlags::empty()),
        ]);
        let mut cache = MaterialCache::new();
        let mut cursor = Cursor::new(bytes);
        let a = read_material(&mut cursor, &mut cache).unwrap();
        let b = read_material(&mut cursor, &mut cache).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.get(a).unwrap().diffuse_texture, "wall.bmp");
    }

    #[test]
    fn test_unnamed_materials_are_not_shared() {
        let bytes = encode(&[Material::new(), Material::new()]);
        let mut cache = MaterialCache::new();
        let mut cursor = Cursor::new(bytes);
        let a = read_material(&mut cursor, &mut cache).unwrap();
        let b = read_material(&mut cursor, &mut cache).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.get(a).unwrap().display_name(), "material");
    }

    #[test]
    fn test_env_block_roundtrip() {
        let original = textured("glass.bmp", MaterialFlags::ENVMAP | MaterialFlags::MIPMAP);
        let bytes = encode(&[original.clone()]);

        let mut cache = MaterialCache::new();
        let id = read_material(&mut Cursor::new(bytes), &mut cache).unwrap();
        let decoded = cache.get(id).unwrap();
        assert_eq!(decoded, &original);
        assert_eq!(decoded.env.as_ref().unwrap().texture, "env.bmp");
    }

    #[test]
    fn test_alpha_name_needs_both_flags() {
        // ALPHATEX without ADDEFFECT: no alpha name on the wire
        let flags = MaterialFlags::ALPHATEX;
        let mut material = textured("leaf.bmp", flags);
        material.alpha_texture = Some("ignored.bmp".into());
        let bytes = encode(&[material]);

        let mut cache = MaterialCache::new();
        let mut cursor = Cursor::new(&bytes);
        let id = read_material(&mut cursor, &mut cache).unwrap();
        assert_eq!(cursor.position(), bytes.len() as u64);
        assert_eq!(cache.get(id).unwrap().alpha_texture, None);
    }

    #[test]
    fn test_writes_white_ambient_and_diffuse() {
        let mut material = Material::new();
        material.ambient = Vec3::ZERO;
        material.diffuse = Vec3::new(0.2, 0.3, 0.4);
        let bytes = encode(&[material]);

        let mut cache = MaterialCache::new();
        let id = read_material(&mut Cursor::new(bytes), &mut cache).unwrap();
        let decoded = cache.get(id).unwrap();
        assert_eq!(decoded.ambient, Vec3::ONE);
        assert_eq!(decoded.diffuse, Vec3::ONE);
    }
}
