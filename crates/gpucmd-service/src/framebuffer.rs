//! Framebuffers and renderbuffers.
//!
//! A framebuffer holds a counted reference to everything attached to it, so an attachment stays
//! alive after its client name is deleted. Backend calls and reference drops must not overlap:
//! methods that detach something hand the old [`Attachment`] back to the caller, who drops it once
//! the backend borrow is released.

use std::collections::BTreeMap;

use gpucmd_protocol::gl;

use crate::backend::{AllocParams, AttachTarget, Backend, BackendError, Region, ResourceKind, ServiceId};
use crate::error::GlError;
use crate::resource::{Resource, ResourceRef};
use crate::texture::{Rect, Texture};

pub const ATTACHMENT_POINTS: [u32; 3] = [gl::COLOR_ATTACHMENT0, gl::DEPTH_ATTACHMENT, gl::STENCIL_ATTACHMENT];

pub fn valid_attachment_point(point: u32) -> bool {
    ATTACHMENT_POINTS.contains(&point)
}

/// Bytes per pixel of a renderbuffer format, or `None` if the format is not accepted.
pub fn renderbuffer_bytes_per_pixel(internal_format: u32) -> Option<u32> {
    match internal_format {
        gl::RGBA4 | gl::RGB5_A1 | gl::RGB565 | gl::DEPTH_COMPONENT16 => Some(2),
        gl::STENCIL_INDEX8 => Some(1),
        gl::RGBA8_OES => Some(4),
        _ => None,
    }
}

#[derive(Debug)]
pub struct Renderbuffer {
    service_id: ServiceId,
    width: u32,
    height: u32,
    internal_format: u32,
    defined: bool,
    cleared: bool,
}

impl Resource for Renderbuffer {
    const KIND: ResourceKind = ResourceKind::Renderbuffer;

    fn service_id(&self) -> ServiceId {
        self.service_id
    }
}

impl Renderbuffer {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            width: 0,
            height: 0,
            internal_format: gl::RGBA4,
            defined: false,
            cleared: false,
        }
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        self.defined.then_some((self.width, self.height))
    }

    pub fn internal_format(&self) -> u32 {
        self.internal_format
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    /// `internal_format` must already be validated.
    pub fn set_storage(
        &mut self,
        backend: &mut dyn Backend,
        internal_format: u32,
        width: u32,
        height: u32,
    ) -> Result<(), BackendError> {
        let bytes_per_pixel = renderbuffer_bytes_per_pixel(internal_format).ok_or(BackendError::Unsupported("renderbuffer format"))?;
        backend.allocate(
            ResourceKind::Renderbuffer,
            self.service_id,
            &AllocParams::Image {
                face: 0,
                level: 0,
                width,
                height,
                bytes_per_pixel,
            },
        )?;
        self.width = width;
        self.height = height;
        self.internal_format = internal_format;
        self.defined = true;
        self.cleared = false;
        Ok(())
    }

    fn fill(&mut self, backend: &mut dyn Backend, pixel: &[u8]) -> Result<(), BackendError> {
        let data = pixel.repeat(self.width as usize * self.height as usize);
        backend.write(
            ResourceKind::Renderbuffer,
            self.service_id,
            &full_region(self.width, self.height),
            &data,
        )?;
        self.cleared = true;
        Ok(())
    }
}

fn full_region(width: u32, height: u32) -> Region {
    Region::Image {
        face: 0,
        level: 0,
        x: 0,
        y: 0,
        width,
        height,
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u8,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0; 4],
            depth: 1.0,
            stencil: 0,
        }
    }
}

fn unorm(v: f32, bits: u32) -> u32 {
    let max = ((1u32 << bits) - 1) as f32;
    (v.clamp(0.0, 1.0) * max).round() as u32
}

/// One pixel of `rgba` in the given unpack `format`/`ty`.
pub fn encode_color(format: u32, ty: u32, rgba: [f32; 4]) -> Option<Vec<u8>> {
    let [r, g, b, a] = rgba;
    let packed = |v: u32| Some((v as u16).to_le_bytes().to_vec());
    match (format, ty) {
        (gl::RGBA, gl::UNSIGNED_BYTE) => Some(rgba.iter().map(|&c| unorm(c, 8) as u8).collect()),
        (gl::RGB, gl::UNSIGNED_BYTE) => Some([r, g, b].iter().map(|&c| unorm(c, 8) as u8).collect()),
        (gl::RGB, gl::UNSIGNED_SHORT_5_6_5) => packed(unorm(r, 5) << 11 | unorm(g, 6) << 5 | unorm(b, 5)),
        (gl::RGBA, gl::UNSIGNED_SHORT_4_4_4_4) => {
            packed(unorm(r, 4) << 12 | unorm(g, 4) << 8 | unorm(b, 4) << 4 | unorm(a, 4))
        }
        (gl::RGBA, gl::UNSIGNED_SHORT_5_5_5_1) => {
            packed(unorm(r, 5) << 11 | unorm(g, 5) << 6 | unorm(b, 5) << 1 | unorm(a, 1))
        }
        _ => None,
    }
}

fn renderbuffer_clear_pixel(internal_format: u32, values: &ClearValues) -> Option<Vec<u8>> {
    match internal_format {
        gl::RGBA4 => encode_color(gl::RGBA, gl::UNSIGNED_SHORT_4_4_4_4, values.color),
        gl::RGB5_A1 => encode_color(gl::RGBA, gl::UNSIGNED_SHORT_5_5_5_1, values.color),
        gl::RGB565 => encode_color(gl::RGB, gl::UNSIGNED_SHORT_5_6_5, values.color),
        gl::RGBA8_OES => encode_color(gl::RGBA, gl::UNSIGNED_BYTE, values.color),
        gl::DEPTH_COMPONENT16 => Some((unorm(values.depth, 16) as u16).to_le_bytes().to_vec()),
        gl::STENCIL_INDEX8 => Some(vec![values.stencil]),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub enum Attachment {
    Texture {
        texture: ResourceRef<Texture>,
        face: u32,
        level: u32,
    },
    Renderbuffer(ResourceRef<Renderbuffer>),
}

impl Attachment {
    fn attach_target(&self) -> AttachTarget {
        match self {
            Self::Texture { texture, face, level } => AttachTarget {
                kind: ResourceKind::Texture,
                id: texture.service_id(),
                face: *face,
                level: *level,
            },
            Self::Renderbuffer(rb) => AttachTarget {
                kind: ResourceKind::Renderbuffer,
                id: rb.service_id(),
                face: 0,
                level: 0,
            },
        }
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        match self {
            Self::Texture { texture, face, level } => {
                texture.with(|t| t.level(*face, *level).map(|l| (l.width, l.height)))
            }
            Self::Renderbuffer(rb) => rb.with(Renderbuffer::size),
        }
    }

    /// Whether the attachment can be rendered to at `point`.
    fn renderable_at(&self, point: u32) -> bool {
        match self {
            Self::Texture { texture, face, level } => {
                point == gl::COLOR_ATTACHMENT0
                    && texture.with(|t| {
                        t.level(*face, *level)
                            .is_some_and(|l| encode_color(l.format, l.ty, [0.0; 4]).is_some())
                    })
            }
            Self::Renderbuffer(rb) => {
                let format = rb.with(Renderbuffer::internal_format);
                match point {
                    gl::DEPTH_ATTACHMENT => format == gl::DEPTH_COMPONENT16,
                    gl::STENCIL_ATTACHMENT => format == gl::STENCIL_INDEX8,
                    _ => !matches!(format, gl::DEPTH_COMPONENT16 | gl::STENCIL_INDEX8),
                }
            }
        }
    }

    pub fn is_texture(&self, texture: &ResourceRef<Texture>) -> bool {
        matches!(self, Self::Texture { texture: t, .. } if t.ptr_eq(texture))
    }

    pub fn is_renderbuffer(&self, renderbuffer: &ResourceRef<Renderbuffer>) -> bool {
        matches!(self, Self::Renderbuffer(rb) if rb.ptr_eq(renderbuffer))
    }

    fn clear(&self, backend: &mut dyn Backend, values: &ClearValues) -> Result<(), BackendError> {
        match self {
            Self::Texture { texture, face, level } => texture.with_mut(|t| {
                let Some(info) = t.level(*face, *level).copied() else {
                    return Ok(());
                };
                let pixel =
                    encode_color(info.format, info.ty, values.color).ok_or(BackendError::Unsupported("texture format"))?;
                let data = pixel.repeat(info.width as usize * info.height as usize);
                t.write_region(backend, *face, *level, Rect::full(info.width, info.height), &data)
            }),
            Self::Renderbuffer(rb) => rb.with_mut(|r| {
                match renderbuffer_clear_pixel(r.internal_format, values) {
                    Some(pixel) if r.defined => r.fill(backend, &pixel),
                    _ => Ok(()),
                }
            }),
        }
    }

    fn clear_if_uncleared(&self, backend: &mut dyn Backend) -> Result<(), BackendError> {
        match self {
            Self::Texture { texture, face, level } => texture.with_mut(|t| {
                if t.level(*face, *level).is_some() {
                    t.clear_level(backend, *face, *level)
                } else {
                    Ok(())
                }
            }),
            Self::Renderbuffer(rb) => rb.with_mut(|r| {
                if !r.defined || r.cleared {
                    return Ok(());
                }
                let bpp = renderbuffer_bytes_per_pixel(r.internal_format).unwrap_or(1);
                r.fill(backend, &vec![0; bpp as usize])
            }),
        }
    }
}

#[derive(Debug)]
pub struct Framebuffer {
    service_id: ServiceId,
    attachments: BTreeMap<u32, Attachment>,
}

impl Resource for Framebuffer {
    const KIND: ResourceKind = ResourceKind::Framebuffer;

    fn service_id(&self) -> ServiceId {
        self.service_id
    }
}

impl Framebuffer {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            attachments: BTreeMap::new(),
        }
    }

    pub fn attachment(&self, point: u32) -> Option<&Attachment> {
        self.attachments.get(&point)
    }

    /// Attach (or with `None`, detach) at `point`. Returns the previous attachment.
    pub fn attach(
        &mut self,
        backend: &mut dyn Backend,
        point: u32,
        attachment: Option<Attachment>,
    ) -> Result<Option<Attachment>, BackendError> {
        backend.attach(self.service_id, point, attachment.as_ref().map(Attachment::attach_target))?;
        Ok(match attachment {
            Some(a) => self.attachments.insert(point, a),
            None => self.attachments.remove(&point),
        })
    }

    /// Detach every attachment matching `pred`, returning them for the caller to drop.
    pub fn detach_where(
        &mut self,
        backend: &mut dyn Backend,
        pred: impl Fn(&Attachment) -> bool,
    ) -> Vec<Attachment> {
        let points: Vec<u32> = self
            .attachments
            .iter()
            .filter(|(_, a)| pred(a))
            .map(|(&p, _)| p)
            .collect();
        let mut detached = Vec::with_capacity(points.len());
        for point in points {
            // Detaching only fails on a lost context, where the backend state is gone anyway.
            let _ = backend.attach(self.service_id, point, None);
            detached.extend(self.attachments.remove(&point));
        }
        detached
    }

    pub fn status(&self) -> u32 {
        if self.attachments.is_empty() {
            return gl::FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT;
        }
        let mut size = None;
        for (&point, attachment) in &self.attachments {
            let Some((w, h)) = attachment.size() else {
                return gl::FRAMEBUFFER_INCOMPLETE_ATTACHMENT;
            };
            if w == 0 || h == 0 || !attachment.renderable_at(point) {
                return gl::FRAMEBUFFER_INCOMPLETE_ATTACHMENT;
            }
            match size {
                None => size = Some((w, h)),
                Some(s) if s != (w, h) => return gl::FRAMEBUFFER_INCOMPLETE_DIMENSIONS,
                Some(_) => {}
            }
        }
        gl::FRAMEBUFFER_COMPLETE
    }

    pub fn is_complete(&self) -> bool {
        self.status() == gl::FRAMEBUFFER_COMPLETE
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        self.attachments.values().find_map(Attachment::size)
    }

    /// Force-clear attachments whose contents are not meaningful yet.
    pub fn clear_uncleared_attachments(&self, backend: &mut dyn Backend) -> Result<(), BackendError> {
        for attachment in self.attachments.values() {
            attachment.clear_if_uncleared(backend)?;
        }
        Ok(())
    }

    /// Overwrite the attachments selected by `mask` with `values`.
    pub fn clear(&self, backend: &mut dyn Backend, mask: u32, values: &ClearValues) -> Result<(), BackendError> {
        for (&point, attachment) in &self.attachments {
            let selected = match point {
                gl::COLOR_ATTACHMENT0 => mask & gl::COLOR_BUFFER_BIT != 0,
                gl::DEPTH_ATTACHMENT => mask & gl::DEPTH_BUFFER_BIT != 0,
                gl::STENCIL_ATTACHMENT => mask & gl::STENCIL_BUFFER_BIT != 0,
                _ => false,
            };
            if selected {
                attachment.clear(backend, values)?;
            }
        }
        Ok(())
    }

    /// Read RGBA8 pixels from the color attachment. `rect` must lie inside the attachment.
    pub fn read_color(&self, backend: &dyn Backend, rect: Rect) -> Result<Vec<u8>, GlError> {
        let attachment = self
            .attachments
            .get(&gl::COLOR_ATTACHMENT0)
            .ok_or(GlError::InvalidOperation)?;
        let (kind, id, face, level) = match attachment {
            Attachment::Texture { texture, face, level } => {
                let rgba8 = texture.with(|t| {
                    t.level(*face, *level)
                        .is_some_and(|l| l.format == gl::RGBA && l.ty == gl::UNSIGNED_BYTE)
                });
                if !rgba8 {
                    return Err(GlError::InvalidOperation);
                }
                (ResourceKind::Texture, texture.service_id(), *face, *level)
            }
            Attachment::Renderbuffer(rb) => {
                if rb.with(Renderbuffer::internal_format) != gl::RGBA8_OES {
                    return Err(GlError::InvalidOperation);
                }
                (ResourceKind::Renderbuffer, rb.service_id(), 0, 0)
            }
        };
        let region = Region::Image {
            face,
            level,
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        };
        backend.read(kind, id, &region).map_err(|_| GlError::InvalidOperation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::backend::{SharedBackend, SoftBackend};
    use crate::resource::ResourcePool;
    use crate::texture::{LevelSpec, TextureTarget};

    struct Fixture {
        soft: Rc<RefCell<SoftBackend>>,
        textures: crate::resource::SharedPool<Texture>,
        renderbuffers: crate::resource::SharedPool<Renderbuffer>,
    }

    fn fixture() -> Fixture {
        let soft = Rc::new(RefCell::new(SoftBackend::new()));
        let backend: SharedBackend = soft.clone();
        Fixture {
            textures: ResourcePool::new_shared(backend.clone()),
            renderbuffers: ResourcePool::new_shared(backend),
            soft,
        }
    }

    impl Fixture {
        fn texture(&self, width: u32, height: u32) -> ResourceRef<Texture> {
            let t = ResourceRef::create(&self.textures, Texture::new).unwrap();
            let mut backend = self.soft.borrow_mut();
            t.with_mut(|t| {
                t.set_target(TextureTarget::Texture2D).unwrap();
                t.define_level(
                    &mut *backend,
                    0,
                    0,
                    LevelSpec {
                        width,
                        height,
                        internal_format: gl::RGBA,
                        format: gl::RGBA,
                        ty: gl::UNSIGNED_BYTE,
                    },
                    None,
                )
            })
            .unwrap();
            t
        }

        fn renderbuffer(&self, format: u32, width: u32, height: u32) -> ResourceRef<Renderbuffer> {
            let rb = ResourceRef::create(&self.renderbuffers, Renderbuffer::new).unwrap();
            let mut backend = self.soft.borrow_mut();
            rb.with_mut(|r| r.set_storage(&mut *backend, format, width, height)).unwrap();
            rb
        }

        fn framebuffer(&self) -> Framebuffer {
            Framebuffer::new(self.soft.borrow_mut().create(ResourceKind::Framebuffer).unwrap())
        }
    }

    fn color(texture: &ResourceRef<Texture>) -> Attachment {
        Attachment::Texture {
            texture: texture.clone(),
            face: 0,
            level: 0,
        }
    }

    #[test]
    fn completeness_rules() {
        let f = fixture();
        let mut fb = f.framebuffer();
        assert_eq!(fb.status(), gl::FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT);

        let tex = f.texture(4, 4);
        fb.attach(&mut *f.soft.borrow_mut(), gl::COLOR_ATTACHMENT0, Some(color(&tex)))
            .unwrap();
        assert_eq!(fb.status(), gl::FRAMEBUFFER_COMPLETE);

        let depth = f.renderbuffer(gl::DEPTH_COMPONENT16, 2, 2);
        fb.attach(&mut *f.soft.borrow_mut(), gl::DEPTH_ATTACHMENT, Some(Attachment::Renderbuffer(depth)))
            .unwrap();
        assert_eq!(fb.status(), gl::FRAMEBUFFER_INCOMPLETE_DIMENSIONS);

        let color_rb = f.renderbuffer(gl::RGBA4, 4, 4);
        let old = fb
            .attach(&mut *f.soft.borrow_mut(), gl::DEPTH_ATTACHMENT, Some(Attachment::Renderbuffer(color_rb)))
            .unwrap();
        drop(old);
        assert_eq!(fb.status(), gl::FRAMEBUFFER_INCOMPLETE_ATTACHMENT);
    }

    #[test]
    fn attachment_keeps_texture_alive() {
        let f = fixture();
        let mut fb = f.framebuffer();
        let tex = f.texture(1, 1);
        let sid = tex.service_id();
        fb.attach(&mut *f.soft.borrow_mut(), gl::COLOR_ATTACHMENT0, Some(color(&tex)))
            .unwrap();
        drop(tex);
        assert!(f.soft.borrow().is_live(sid));

        let detached = fb.detach_where(&mut *f.soft.borrow_mut(), |_| true);
        assert_eq!(detached.len(), 1);
        drop(detached);
        assert!(!f.soft.borrow().is_live(sid));
    }

    #[test]
    fn clear_writes_encoded_color_and_marks_cleared() {
        let f = fixture();
        let mut fb = f.framebuffer();
        let tex = f.texture(2, 1);
        fb.attach(&mut *f.soft.borrow_mut(), gl::COLOR_ATTACHMENT0, Some(color(&tex)))
            .unwrap();
        let values = ClearValues {
            color: [1.0, 0.0, 0.5, 1.0],
            ..ClearValues::default()
        };
        fb.clear(&mut *f.soft.borrow_mut(), gl::COLOR_BUFFER_BIT, &values).unwrap();
        assert!(tex.with(|t| t.level(0, 0).unwrap().cleared));
        let pixels = fb.read_color(&*f.soft.borrow(), Rect::full(2, 1)).unwrap();
        assert_eq!(pixels, vec![255, 0, 128, 255, 255, 0, 128, 255]);
    }

    #[test]
    fn uncleared_attachments_are_zeroed_before_use() {
        let f = fixture();
        let mut fb = f.framebuffer();
        let rb = f.renderbuffer(gl::RGBA8_OES, 1, 1);
        fb.attach(&mut *f.soft.borrow_mut(), gl::COLOR_ATTACHMENT0, Some(Attachment::Renderbuffer(rb.clone())))
            .unwrap();
        assert!(!rb.with(Renderbuffer::is_cleared));
        fb.clear_uncleared_attachments(&mut *f.soft.borrow_mut()).unwrap();
        assert!(rb.with(Renderbuffer::is_cleared));
        assert_eq!(fb.read_color(&*f.soft.borrow(), Rect::full(1, 1)).unwrap(), vec![0; 4]);
    }

    #[test]
    fn packed_color_encoding() {
        assert_eq!(encode_color(gl::RGB, gl::UNSIGNED_SHORT_5_6_5, [1.0, 0.0, 0.0, 1.0]), Some(vec![0x00, 0xF8]));
        assert_eq!(encode_color(gl::LUMINANCE, gl::UNSIGNED_BYTE, [0.0; 4]), None);
    }
}
