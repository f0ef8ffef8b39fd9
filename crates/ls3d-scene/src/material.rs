// ls3d-scene/src/material.rs
//! Conversion between codec materials and scene material descriptors
//!
//! Flag bits that follow from descriptor fields are recomputed on export.
//! Every other bit is kept in [`MaterialDescriptor::extra_flags`], so a
//! decoded flag word survives a round trip unchanged, including the
//! inconsistent combinations found in shipped files.

use ls3d_core::Vec3;
use ls3d_parsers::fds::EnvMap;
use ls3d_parsers::{Material, MaterialFlags};

use crate::scene::{MaterialDescriptor, SceneMaterial};

impl MaterialDescriptor {
    pub fn from_material(material: &Material) -> Self {
        let flags = material.flags;
        let diffuse_texture = (flags.contains(MaterialFlags::DIFFUSETEX) || !material.diffuse_texture.is_empty())
            .then(|| material.diffuse_texture.clone());
        // An alpha flag without a name reads as opaque
        let alpha_texture = material
            .alpha_texture
            .clone()
            .filter(|name| flags.has_alpha_texture() && !name.is_empty());

        let mut descriptor = Self {
            color_key: flags.uses_color_key() && diffuse_texture.is_some(),
            diffuse_texture,
            alpha_texture,
            env_texture: material.env.as_ref().map(|env| env.texture.clone()),
            metallic: material.env.as_ref().map_or(0.0, |env| env.metallic),
            opacity: material.opacity,
            emission: material.emission,
            extra_flags: MaterialFlags::empty(),
            animation: material.animation,
        };
        descriptor.extra_flags = flags.difference(descriptor.derived_flags());
        descriptor
    }

    /// Bits implied by the descriptor fields
    pub fn derived_flags(&self) -> MaterialFlags {
        let mut flags = MaterialFlags::empty();
        if self.diffuse_texture.is_some() {
            flags |= MaterialFlags::DIFFUSETEX;
        }
        if self.env_texture.is_some() {
            flags |= MaterialFlags::ENVMAP;
        }
        if self.alpha_texture.is_some() {
            flags |= MaterialFlags::ADDEFFECT | MaterialFlags::ALPHATEX;
        }
        // Color keying cuts out of the diffuse texture
        if self.color_key && self.diffuse_texture.is_some() {
            flags |= MaterialFlags::ADDEFFECT | MaterialFlags::COLORKEY;
        }
        if self.animation.is_some() {
            flags |= MaterialFlags::ANIMTEXDIFF;
        }
        flags
    }

    pub fn flags(&self) -> MaterialFlags {
        self.derived_flags() | self.extra_flags
    }

    pub fn to_material(&self) -> Material {
        Material {
            flags: self.flags(),
            ambient: Vec3::ONE,
            diffuse: Vec3::ONE,
            emission: self.emission,
            opacity: self.opacity,
            env: self.env_texture.as_ref().map(|texture| EnvMap {
                metallic: self.metallic,
                texture: texture.clone(),
            }),
            diffuse_texture: self.diffuse_texture.clone().unwrap_or_default(),
            alpha_texture: self.alpha_texture.clone(),
            animation: self.animation,
        }
    }
}

impl SceneMaterial {
    /// Named after the lower-cased diffuse texture
    pub fn from_material(material: &Material) -> Self {
        Self {
            name: material.display_name().to_lowercase(),
            descriptor: MaterialDescriptor::from_material(material),
            diffuse_path: None,
            alpha_path: None,
            env_path: None,
        }
    }
}
