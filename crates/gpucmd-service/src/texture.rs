//! Textures and the per-group texture manager.
//!
//! A [`Texture`] is the shared backing state; the client-visible name and every binding are
//! [`ResourceRef`]s to it, so one texture can be referenced from several context groups at once.
//!
//! Each level tracks whether storage exists ("defined") and whether its contents are meaningful
//! ("cleared"). Storage allocated without data is defined but uncleared; anything that would read
//! it must first go through [`Texture::clear_uncleared_levels`] or [`Texture::clear_level`].

use std::collections::HashMap;
use std::sync::Arc;

use gpucmd_protocol::gl;

use crate::backend::{AllocParams, Backend, BackendError, Region, ResourceKind, ServiceId};
use crate::config::{FeatureSet, ServiceConfig};
use crate::error::GlError;
use crate::image_manager::GpuImage;
use crate::resource::{Resource, ResourceRef, SharedPool};
use crate::resource_manager::ResourceManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TextureTarget {
    Texture2D,
    CubeMap,
    External,
    Rectangle,
}

impl TextureTarget {
    pub const ALL: [TextureTarget; 4] = [Self::Texture2D, Self::CubeMap, Self::External, Self::Rectangle];

    /// Parse a `glBindTexture`-style target.
    pub fn from_bind_target(target: u32) -> Option<Self> {
        match target {
            gl::TEXTURE_2D => Some(Self::Texture2D),
            gl::TEXTURE_CUBE_MAP => Some(Self::CubeMap),
            gl::TEXTURE_EXTERNAL_OES => Some(Self::External),
            gl::TEXTURE_RECTANGLE_ARB => Some(Self::Rectangle),
            _ => None,
        }
    }

    pub const fn gl_enum(self) -> u32 {
        match self {
            Self::Texture2D => gl::TEXTURE_2D,
            Self::CubeMap => gl::TEXTURE_CUBE_MAP,
            Self::External => gl::TEXTURE_EXTERNAL_OES,
            Self::Rectangle => gl::TEXTURE_RECTANGLE_ARB,
        }
    }

    pub const fn face_count(self) -> usize {
        match self {
            Self::CubeMap => 6,
            _ => 1,
        }
    }

    pub const fn required_feature(self) -> Option<FeatureSet> {
        match self {
            Self::External => Some(FeatureSet::TEXTURE_EXTERNAL),
            Self::Rectangle => Some(FeatureSet::TEXTURE_RECTANGLE),
            _ => None,
        }
    }

    pub fn is_enabled(self, features: FeatureSet) -> bool {
        self.required_feature().map_or(true, |f| features.contains(f))
    }

    /// External and rectangle textures have no mip chain and only clamp.
    pub const fn is_restricted(self) -> bool {
        matches!(self, Self::External | Self::Rectangle)
    }
}

/// Parse an image-specification target (`GL_TEXTURE_2D` or one cube face) into the texture
/// target it belongs to and the face index.
pub fn face_target(target: u32) -> Option<(TextureTarget, u32)> {
    match target {
        gl::TEXTURE_2D => Some((TextureTarget::Texture2D, 0)),
        gl::TEXTURE_RECTANGLE_ARB => Some((TextureTarget::Rectangle, 0)),
        gl::TEXTURE_CUBE_MAP_POSITIVE_X..=gl::TEXTURE_CUBE_MAP_NEGATIVE_Z => {
            Some((TextureTarget::CubeMap, target - gl::TEXTURE_CUBE_MAP_POSITIVE_X))
        }
        _ => None,
    }
}

/// Bytes per pixel for an unpack `format`/`ty` pair.
///
/// Unknown enums are `INVALID_ENUM`; a packed type paired with the wrong format is
/// `INVALID_OPERATION`.
pub fn bytes_per_pixel(format: u32, ty: u32) -> Result<u32, GlError> {
    let components = match format {
        gl::ALPHA | gl::LUMINANCE => 1,
        gl::LUMINANCE_ALPHA => 2,
        gl::RGB => 3,
        gl::RGBA => 4,
        _ => return Err(GlError::InvalidEnum),
    };
    match ty {
        gl::UNSIGNED_BYTE => Ok(components),
        gl::UNSIGNED_SHORT_5_6_5 if format == gl::RGB => Ok(2),
        gl::UNSIGNED_SHORT_4_4_4_4 | gl::UNSIGNED_SHORT_5_5_5_1 if format == gl::RGBA => Ok(2),
        gl::UNSIGNED_SHORT_5_6_5 | gl::UNSIGNED_SHORT_4_4_4_4 | gl::UNSIGNED_SHORT_5_5_5_1 => {
            Err(GlError::InvalidOperation)
        }
        _ => Err(GlError::InvalidEnum),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LevelInfo {
    pub defined: bool,
    pub cleared: bool,
    pub width: u32,
    pub height: u32,
    pub internal_format: u32,
    pub format: u32,
    pub ty: u32,
}

impl LevelInfo {
    pub fn bytes_per_pixel(&self) -> u32 {
        bytes_per_pixel(self.format, self.ty).unwrap_or(4)
    }

    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel() as usize
    }

    fn alloc_params(&self, face: u32, level: u32) -> AllocParams {
        AllocParams::Image {
            face,
            level,
            width: self.width,
            height: self.height,
            bytes_per_pixel: self.bytes_per_pixel(),
        }
    }
}

/// Storage description for [`Texture::define_level`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelSpec {
    pub width: u32,
    pub height: u32,
    pub internal_format: u32,
    pub format: u32,
    pub ty: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    pub fn fits_in(&self, width: u32, height: u32) -> bool {
        self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }

    pub fn covers(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width == width && self.height == height
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplerState {
    pub min_filter: u32,
    pub mag_filter: u32,
    pub wrap_s: u32,
    pub wrap_t: u32,
}

impl Default for SamplerState {
    fn default() -> Self {
        Self {
            min_filter: gl::NEAREST_MIPMAP_LINEAR,
            mag_filter: gl::LINEAR,
            wrap_s: gl::REPEAT,
            wrap_t: gl::REPEAT,
        }
    }
}

impl SamplerState {
    fn restricted() -> Self {
        Self {
            min_filter: gl::LINEAR,
            mag_filter: gl::LINEAR,
            wrap_s: gl::CLAMP_TO_EDGE,
            wrap_t: gl::CLAMP_TO_EDGE,
        }
    }
}

/// An external image bound to level 0.
#[derive(Clone, Debug)]
pub struct BoundImage {
    pub id: u32,
    pub image: Arc<GpuImage>,
}

impl PartialEq for BoundImage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.image, &other.image)
    }
}

/// Snapshot of everything about a texture that crosses context groups.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureDefinition {
    pub target: Option<TextureTarget>,
    pub faces: Vec<Vec<LevelInfo>>,
    pub sampler: SamplerState,
    pub image: Option<BoundImage>,
}

impl TextureDefinition {
    pub fn size(&self) -> Option<(u32, u32)> {
        let base = self.faces.first()?.first()?;
        base.defined.then_some((base.width, base.height))
    }
}

#[derive(Debug)]
pub struct Texture {
    service_id: ServiceId,
    target: Option<TextureTarget>,
    faces: Vec<Vec<LevelInfo>>,
    sampler: SamplerState,
    image: Option<BoundImage>,
    is_default: bool,
    version: u64,
    /// Metadata was replaced from a snapshot; backend storage has not been rebuilt yet.
    storage_stale: bool,
}

impl Resource for Texture {
    const KIND: ResourceKind = ResourceKind::Texture;

    fn service_id(&self) -> ServiceId {
        self.service_id
    }
}

impl Texture {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            target: None,
            faces: Vec::new(),
            sampler: SamplerState::default(),
            image: None,
            is_default: false,
            version: 0,
            storage_stale: false,
        }
    }

    pub fn new_default(service_id: ServiceId, target: TextureTarget) -> Self {
        let mut texture = Self::new(service_id);
        texture.is_default = true;
        texture.lock_target(target);
        texture
    }

    pub fn target(&self) -> Option<TextureTarget> {
        self.target
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Bumped on every metadata change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn sampler(&self) -> SamplerState {
        self.sampler
    }

    pub fn image(&self) -> Option<&BoundImage> {
        self.image.as_ref()
    }

    pub fn storage_stale(&self) -> bool {
        self.storage_stale
    }

    pub fn level(&self, face: u32, level: u32) -> Option<&LevelInfo> {
        self.faces
            .get(face as usize)?
            .get(level as usize)
            .filter(|info| info.defined)
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        self.level(0, 0).map(|l| (l.width, l.height))
    }

    pub fn levels(&self) -> impl Iterator<Item = (u32, u32, &LevelInfo)> + '_ {
        self.faces.iter().enumerate().flat_map(|(face, levels)| {
            levels
                .iter()
                .enumerate()
                .filter(|(_, info)| info.defined)
                .map(move |(level, info)| (face as u32, level as u32, info))
        })
    }

    pub fn has_uncleared_levels(&self) -> bool {
        self.levels().any(|(_, _, info)| !info.cleared)
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    fn lock_target(&mut self, target: TextureTarget) {
        self.target = Some(target);
        self.faces = vec![Vec::new(); target.face_count()];
        if target.is_restricted() {
            self.sampler = SamplerState::restricted();
        }
        self.touch();
    }

    /// The first bind fixes the target permanently.
    pub fn set_target(&mut self, target: TextureTarget) -> Result<(), GlError> {
        match self.target {
            None => {
                self.lock_target(target);
                Ok(())
            }
            Some(t) if t == target => Ok(()),
            Some(_) => Err(GlError::InvalidOperation),
        }
    }

    pub fn set_parameter(&mut self, pname: u32, param: u32) -> Result<(), GlError> {
        if self.is_default {
            return Err(GlError::InvalidOperation);
        }
        let restricted = self.target.is_some_and(TextureTarget::is_restricted);
        let mut sampler = self.sampler;
        match pname {
            gl::TEXTURE_MIN_FILTER => {
                let mipmapped = matches!(
                    param,
                    gl::NEAREST_MIPMAP_NEAREST
                        | gl::LINEAR_MIPMAP_NEAREST
                        | gl::NEAREST_MIPMAP_LINEAR
                        | gl::LINEAR_MIPMAP_LINEAR
                );
                if !(mipmapped || matches!(param, gl::NEAREST | gl::LINEAR)) || (restricted && mipmapped) {
                    return Err(GlError::InvalidEnum);
                }
                sampler.min_filter = param;
            }
            gl::TEXTURE_MAG_FILTER => {
                if !matches!(param, gl::NEAREST | gl::LINEAR) {
                    return Err(GlError::InvalidEnum);
                }
                sampler.mag_filter = param;
            }
            gl::TEXTURE_WRAP_S | gl::TEXTURE_WRAP_T => {
                let valid = if restricted {
                    param == gl::CLAMP_TO_EDGE
                } else {
                    matches!(param, gl::REPEAT | gl::CLAMP_TO_EDGE | gl::MIRRORED_REPEAT)
                };
                if !valid {
                    return Err(GlError::InvalidEnum);
                }
                if pname == gl::TEXTURE_WRAP_S {
                    sampler.wrap_s = param;
                } else {
                    sampler.wrap_t = param;
                }
            }
            _ => return Err(GlError::InvalidEnum),
        }
        if sampler != self.sampler {
            self.sampler = sampler;
            self.touch();
        }
        Ok(())
    }

    fn level_slot(&mut self, face: u32, level: u32) -> &mut LevelInfo {
        if self.faces.len() <= face as usize {
            self.faces.resize(face as usize + 1, Vec::new());
        }
        let levels = &mut self.faces[face as usize];
        if levels.len() <= level as usize {
            levels.resize(level as usize + 1, LevelInfo::default());
        }
        &mut levels[level as usize]
    }

    /// (Re)define one level. `data`, when present, must cover the whole level.
    ///
    /// On allocation failure the texture keeps its previous definition of that level.
    pub fn define_level(
        &mut self,
        backend: &mut dyn Backend,
        face: u32,
        level: u32,
        spec: LevelSpec,
        data: Option<&[u8]>,
    ) -> Result<(), BackendError> {
        self.ensure_storage(backend)?;
        let info = LevelInfo {
            defined: true,
            cleared: false,
            width: spec.width,
            height: spec.height,
            internal_format: spec.internal_format,
            format: spec.format,
            ty: spec.ty,
        };
        backend.allocate(ResourceKind::Texture, self.service_id, &info.alloc_params(face, level))?;
        *self.level_slot(face, level) = info;
        if level == 0 && face == 0 {
            self.image = None;
        }
        self.touch();
        if let Some(data) = data {
            self.write_region(backend, face, level, Rect::full(spec.width, spec.height), data)?;
        }
        Ok(())
    }

    /// Write a sub-rectangle of a defined level, clearing the rest first if needed.
    pub fn write_region(
        &mut self,
        backend: &mut dyn Backend,
        face: u32,
        level: u32,
        rect: Rect,
        data: &[u8],
    ) -> Result<(), BackendError> {
        self.ensure_storage(backend)?;
        let info = *self.level(face, level).ok_or(BackendError::OutOfBounds)?;
        if !rect.fits_in(info.width, info.height) {
            return Err(BackendError::OutOfBounds);
        }
        let full = rect.covers(info.width, info.height);
        if !full && !info.cleared {
            self.clear_level(backend, face, level)?;
        }
        let region = Region::Image {
            face,
            level,
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        };
        backend.write(ResourceKind::Texture, self.service_id, &region, data)?;
        if full {
            self.mark_cleared(face, level);
        }
        Ok(())
    }

    fn mark_cleared(&mut self, face: u32, level: u32) {
        let slot = self.level_slot(face, level);
        if !slot.cleared {
            slot.cleared = true;
            self.touch();
        }
    }

    /// Zero-fill one level and mark it cleared.
    pub fn clear_level(&mut self, backend: &mut dyn Backend, face: u32, level: u32) -> Result<(), BackendError> {
        self.ensure_storage(backend)?;
        let info = *self.level(face, level).ok_or(BackendError::OutOfBounds)?;
        if info.cleared {
            return Ok(());
        }
        let region = Region::Image {
            face,
            level,
            x: 0,
            y: 0,
            width: info.width,
            height: info.height,
        };
        backend.write(ResourceKind::Texture, self.service_id, &region, &vec![0; info.byte_size()])?;
        self.mark_cleared(face, level);
        Ok(())
    }

    /// Force-clear every defined level whose contents are not meaningful. Returns how many
    /// levels were cleared.
    pub fn clear_uncleared_levels(&mut self, backend: &mut dyn Backend) -> Result<usize, BackendError> {
        self.ensure_storage(backend)?;
        let pending: Vec<(u32, u32)> = self
            .levels()
            .filter(|(_, _, info)| !info.cleared)
            .map(|(face, level, _)| (face, level))
            .collect();
        for &(face, level) in &pending {
            self.clear_level(backend, face, level)?;
        }
        Ok(pending.len())
    }

    /// Back level 0 with an external image.
    pub fn bind_image(
        &mut self,
        backend: &mut dyn Backend,
        image_id: u32,
        image: Arc<GpuImage>,
    ) -> Result<(), BackendError> {
        let spec = LevelSpec {
            width: image.width,
            height: image.height,
            internal_format: gl::RGBA,
            format: gl::RGBA,
            ty: gl::UNSIGNED_BYTE,
        };
        self.define_level(backend, 0, 0, spec, Some(&image.pixels))?;
        self.image = Some(BoundImage { id: image_id, image });
        self.touch();
        Ok(())
    }

    /// Detach `image_id` from level 0, leaving the level undefined.
    pub fn release_image(&mut self, image_id: u32) -> bool {
        if self.image.as_ref().map_or(true, |b| b.id != image_id) {
            return false;
        }
        self.image = None;
        *self.level_slot(0, 0) = LevelInfo::default();
        self.touch();
        true
    }

    /// Rebuild backend storage after [`Texture::apply_definition`].
    pub fn ensure_storage(&mut self, backend: &mut dyn Backend) -> Result<(), BackendError> {
        if !self.storage_stale {
            return Ok(());
        }
        let levels: Vec<(u32, u32, LevelInfo)> = self.levels().map(|(f, l, info)| (f, l, *info)).collect();
        for (face, level, info) in levels {
            backend.allocate(ResourceKind::Texture, self.service_id, &info.alloc_params(face, level))?;
            if !info.cleared {
                continue;
            }
            let region = Region::Image {
                face,
                level,
                x: 0,
                y: 0,
                width: info.width,
                height: info.height,
            };
            let from_image = self
                .image
                .as_ref()
                .filter(|b| face == 0 && level == 0 && b.image.width == info.width && b.image.height == info.height);
            match from_image {
                Some(bound) => backend.write(ResourceKind::Texture, self.service_id, &region, &bound.image.pixels)?,
                None => backend.write(ResourceKind::Texture, self.service_id, &region, &vec![0; info.byte_size()])?,
            }
        }
        self.storage_stale = false;
        Ok(())
    }

    pub fn definition(&self) -> TextureDefinition {
        TextureDefinition {
            target: self.target,
            faces: self.faces.clone(),
            sampler: self.sampler,
            image: self.image.clone(),
        }
    }

    /// Replace all shared state with a snapshot. Backend storage is rebuilt lazily.
    pub fn apply_definition(&mut self, def: TextureDefinition) {
        self.target = def.target;
        self.faces = def.faces;
        self.sampler = def.sampler;
        self.image = def.image;
        self.storage_stale = true;
        self.touch();
    }
}

/// Client-id mapping plus per-target default textures for one context group.
pub struct TextureManager {
    textures: ResourceManager<Texture>,
    defaults: HashMap<TextureTarget, ResourceRef<Texture>>,
    max_texture_size: u32,
    max_cube_map_texture_size: u32,
    features: FeatureSet,
}

impl TextureManager {
    pub fn new(pool: SharedPool<Texture>, config: &ServiceConfig) -> Result<Self, BackendError> {
        let mut defaults = HashMap::new();
        for target in TextureTarget::ALL {
            if target.is_enabled(config.features) {
                let texture = ResourceRef::create(&pool, |sid| Texture::new_default(sid, target))?;
                defaults.insert(target, texture);
            }
        }
        Ok(Self {
            textures: ResourceManager::new(pool, config.bind_generates_resource),
            defaults,
            max_texture_size: config.max_texture_size,
            max_cube_map_texture_size: config.max_cube_map_texture_size,
            features: config.features,
        })
    }

    pub fn resources(&self) -> &ResourceManager<Texture> {
        &self.textures
    }

    pub fn resources_mut(&mut self) -> &mut ResourceManager<Texture> {
        &mut self.textures
    }

    pub fn default_texture(&self, target: TextureTarget) -> Option<&ResourceRef<Texture>> {
        self.defaults.get(&target)
    }

    pub fn is_target_enabled(&self, target: TextureTarget) -> bool {
        target.is_enabled(self.features)
    }

    pub fn max_size(&self, target: TextureTarget) -> u32 {
        match target {
            TextureTarget::CubeMap => self.max_cube_map_texture_size,
            _ => self.max_texture_size,
        }
    }

    pub fn max_levels(&self, target: TextureTarget) -> u32 {
        if target.is_restricted() {
            1
        } else {
            ServiceConfig::max_levels(self.max_size(target))
        }
    }

    /// Whether `width`x`height` is legal for `level` of `target`.
    pub fn valid_level_size(&self, target: TextureTarget, level: u32, width: u32, height: u32) -> bool {
        if level >= self.max_levels(target) {
            return false;
        }
        let max = self.max_size(target) >> level;
        if width > max || height > max {
            return false;
        }
        target != TextureTarget::CubeMap || width == height
    }
}
