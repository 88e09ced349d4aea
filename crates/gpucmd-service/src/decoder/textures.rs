use gpucmd_protocol::cmd::NO_SHARED_MEMORY;
use gpucmd_protocol::gl;

use super::state::Slot;
use super::{CmdResult, GpuDecoder, Validation};
use crate::backend::ResourceKind;
use crate::error::{ExecError, GlError};
use crate::pixel_transfer::PixelUpload;
use crate::resource::ResourceRef;
use crate::resource_manager::ResourceError;
use crate::shared_memory::MemoryRange;
use crate::texture::{bytes_per_pixel, face_target, LevelSpec, Rect, Texture, TextureTarget};

/// Arguments shared by `TexImage2D` and `AsyncTexImage2D`.
struct TexImageArgs {
    target: u32,
    level: u32,
    internal_format: u32,
    width: u32,
    height: u32,
    border: u32,
    format: u32,
    ty: u32,
    shm_id: u32,
    shm_offset: u32,
}

impl TexImageArgs {
    fn parse(args: &[u32]) -> Self {
        Self {
            target: args[0],
            level: args[1],
            internal_format: args[2],
            width: args[3],
            height: args[4],
            border: args[5],
            format: args[6],
            ty: args[7],
            shm_id: args[8],
            shm_offset: args[9],
        }
    }
}

/// Arguments shared by `TexSubImage2D` and `AsyncTexSubImage2D`.
struct TexSubImageArgs {
    target: u32,
    level: u32,
    rect: Rect,
    format: u32,
    ty: u32,
    shm_id: u32,
    shm_offset: u32,
}

impl TexSubImageArgs {
    fn parse(args: &[u32]) -> Self {
        Self {
            target: args[0],
            level: args[1],
            rect: Rect {
                x: args[2],
                y: args[3],
                width: args[4],
                height: args[5],
            },
            format: args[6],
            ty: args[7],
            shm_id: args[8],
            shm_offset: args[9],
        }
    }
}

struct TexImagePlan {
    texture: ResourceRef<Texture>,
    face: u32,
    level: u32,
    spec: LevelSpec,
}

struct TexSubImagePlan {
    texture: ResourceRef<Texture>,
    face: u32,
    level: u32,
    level_size: (u32, u32),
}

impl GpuDecoder {
    /// Bind target, if it is valid and enabled for this context.
    pub(super) fn texture_target(&self, target: u32) -> Option<TextureTarget> {
        TextureTarget::from_bind_target(target).filter(|t| t.is_enabled(self.config.features))
    }

    /// The texture bound to `target` on the active unit, or the target's default texture.
    pub(super) fn bound_texture(&self, target: TextureTarget) -> Result<ResourceRef<Texture>, GlError> {
        if let Some(texture) = self.state.unit().get(target).resolve()? {
            return Ok(texture.clone());
        }
        self.group
            .borrow()
            .textures
            .default_texture(target)
            .cloned()
            .ok_or(GlError::InvalidEnum)
    }

    pub(super) fn exec_gen_textures(&mut self, ids: &[u32]) -> CmdResult {
        let result = self.group.borrow_mut().textures.resources_mut().gen(ids, Texture::new);
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.resource_failed("glGenTextures", err),
        }
    }

    pub(super) fn exec_delete_textures(&mut self, ids: &[u32]) -> CmdResult {
        let mut unbound = Vec::new();
        let mut detached = Vec::new();
        let mut deleted = Vec::new();
        for &id in ids {
            let Some(texture) = self.group.borrow_mut().textures.resources_mut().delete(id) else {
                continue;
            };
            unbound.extend(self.state.unbind_texture(&texture));
            if let Some(fb) = self.state.framebuffer.bound() {
                let mut backend = self.backend.borrow_mut();
                detached.extend(fb.with_mut(|fb| fb.detach_where(&mut *backend, |a| a.is_texture(&texture))));
            }
            deleted.push(texture);
        }
        drop((unbound, detached));
        drop(deleted);
        Ok(())
    }

    pub(super) fn exec_bind_texture(&mut self, target: u32, id: u32) -> CmdResult {
        const FN: &str = "glBindTexture";
        let Some(target) = self.texture_target(target) else {
            return self.fail(GlError::InvalidEnum, FN, "invalid target");
        };
        let slot = if id == 0 {
            Slot::None
        } else {
            let lookup = self.group.borrow_mut().textures.resources_mut().bind_lookup(id, Texture::new);
            match lookup {
                Ok(Some(texture)) => {
                    if texture.with_mut(|t| t.set_target(target)).is_err() {
                        return self.fail(GlError::InvalidOperation, FN, "texture belongs to another target");
                    }
                    Slot::Bound(texture)
                }
                Ok(None) => Slot::None,
                Err(ResourceError::NotGenerated(_)) => {
                    let old = self.state.unit_mut().get_mut(target).replace(Slot::Invalid(id));
                    drop(old);
                    return self.fail(GlError::InvalidOperation, FN, "id was never generated");
                }
                Err(err) => return self.resource_failed(FN, err),
            }
        };

        let service_id = match &slot {
            Slot::Bound(texture) => Some(texture.service_id()),
            _ => self.bound_default_service_id(target),
        };
        let result = self
            .backend
            .borrow_mut()
            .bind(ResourceKind::Texture, target.gl_enum(), service_id);
        if let Err(err) = result {
            return self.backend_failed(FN, err);
        }
        let old = self.state.unit_mut().get_mut(target).replace(slot);
        drop(old);
        Ok(())
    }

    fn bound_default_service_id(&self, target: TextureTarget) -> Option<u32> {
        self.group
            .borrow()
            .textures
            .default_texture(target)
            .map(ResourceRef::service_id)
    }

    pub(super) fn exec_active_texture(&mut self, unit: u32) -> CmdResult {
        let index = unit.wrapping_sub(gl::TEXTURE0) as usize;
        if index >= self.state.units.len() {
            return self.fail(GlError::InvalidEnum, "glActiveTexture", "texture unit out of range");
        }
        self.state.active_unit = index;
        Ok(())
    }

    /// Client pixels for a full-level upload; `None` when the command carries no data.
    fn tex_image_data(&self, a: &TexImageArgs) -> Result<Option<MemoryRange>, ExecError> {
        if a.shm_id == NO_SHARED_MEMORY {
            return Ok(None);
        }
        self.resolve_pixels(a.shm_id, a.shm_offset, (a.width, a.height), a.format, a.ty)
            .map(Some)
    }

    fn tex_sub_image_data(&self, a: &TexSubImageArgs) -> Result<Option<MemoryRange>, ExecError> {
        if a.shm_id == NO_SHARED_MEMORY {
            return Ok(None);
        }
        self.resolve_pixels(a.shm_id, a.shm_offset, (a.rect.width, a.rect.height), a.format, a.ty)
            .map(Some)
    }

    fn validate_tex_image(&self, a: &TexImageArgs) -> Validation<TexImagePlan> {
        let (target, face) = face_target(a.target)
            .filter(|(t, _)| t.is_enabled(self.config.features))
            .ok_or((GlError::InvalidEnum, "invalid target"))?;
        bytes_per_pixel(a.format, a.ty).map_err(|e| (e, "invalid format or type"))?;
        if a.internal_format != a.format {
            return Err((GlError::InvalidOperation, "internal format must match format"));
        }
        if a.border != 0 {
            return Err((GlError::InvalidValue, "border must be 0"));
        }
        if !self
            .group
            .borrow()
            .textures
            .valid_level_size(target, a.level, a.width, a.height)
        {
            return Err((GlError::InvalidValue, "level or size out of range"));
        }
        let texture = self.bound_texture(target).map_err(|e| (e, "no usable texture bound"))?;
        Ok(TexImagePlan {
            texture,
            face,
            level: a.level,
            spec: LevelSpec {
                width: a.width,
                height: a.height,
                internal_format: a.internal_format,
                format: a.format,
                ty: a.ty,
            },
        })
    }

    fn validate_tex_sub_image(&self, a: &TexSubImageArgs) -> Validation<TexSubImagePlan> {
        let (target, face) = face_target(a.target)
            .filter(|(t, _)| t.is_enabled(self.config.features))
            .ok_or((GlError::InvalidEnum, "invalid target"))?;
        bytes_per_pixel(a.format, a.ty).map_err(|e| (e, "invalid format or type"))?;
        let texture = self.bound_texture(target).map_err(|e| (e, "no usable texture bound"))?;
        let info = texture
            .with(|t| t.level(face, a.level).copied())
            .ok_or((GlError::InvalidOperation, "level is not defined"))?;
        if info.format != a.format || info.ty != a.ty {
            return Err((GlError::InvalidOperation, "format or type differs from the level"));
        }
        if !a.rect.fits_in(info.width, info.height) {
            return Err((GlError::InvalidValue, "rectangle exceeds the level"));
        }
        Ok(TexSubImagePlan {
            texture,
            face,
            level: a.level,
            level_size: (info.width, info.height),
        })
    }

    pub(super) fn exec_tex_image_2d(&mut self, args: &[u32]) -> CmdResult {
        const FN: &str = "glTexImage2D";
        let a = TexImageArgs::parse(args);
        let data = self.tex_image_data(&a)?.map(|range| range.read_all());
        let plan = match self.validate_tex_image(&a) {
            Ok(plan) => plan,
            Err((err, msg)) => return self.fail(err, FN, msg),
        };
        if plan.texture.with(Texture::is_default) {
            return self.fail(GlError::InvalidOperation, FN, "default textures are immutable");
        }
        if self.transfers.transfer_in_progress(plan.texture.key()) {
            return self.fail(GlError::InvalidOperation, FN, "async upload in progress");
        }
        let result = {
            let mut backend = self.backend.borrow_mut();
            plan.texture
                .with_mut(|t| t.define_level(&mut *backend, plan.face, plan.level, plan.spec, data.as_deref()))
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.backend_failed(FN, err),
        }
    }

    pub(super) fn exec_tex_sub_image_2d(&mut self, args: &[u32]) -> CmdResult {
        const FN: &str = "glTexSubImage2D";
        let a = TexSubImageArgs::parse(args);
        let Some(data) = self.tex_sub_image_data(&a)? else {
            return self.fail(GlError::InvalidValue, FN, "pixel data is required");
        };
        let data = data.read_all();
        let plan = match self.validate_tex_sub_image(&a) {
            Ok(plan) => plan,
            Err((err, msg)) => return self.fail(err, FN, msg),
        };
        if self.transfers.transfer_in_progress(plan.texture.key()) {
            return self.fail(GlError::InvalidOperation, FN, "async upload in progress");
        }
        let result = {
            let mut backend = self.backend.borrow_mut();
            plan.texture
                .with_mut(|t| t.write_region(&mut *backend, plan.face, plan.level, a.rect, &data))
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.backend_failed(FN, err),
        }
    }

    pub(super) fn exec_tex_parameteri(&mut self, target: u32, pname: u32, param: u32) -> CmdResult {
        const FN: &str = "glTexParameteri";
        let Some(target) = self.texture_target(target) else {
            return self.fail(GlError::InvalidEnum, FN, "invalid target");
        };
        let result = self
            .bound_texture(target)
            .and_then(|texture| texture.with_mut(|t| t.set_parameter(pname, param)));
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err, FN, "parameter rejected"),
        }
    }

    pub(super) fn exec_bind_tex_image_2d(&mut self, target: u32, image_id: u32) -> CmdResult {
        const FN: &str = "glBindTexImage2DCHROMIUM";
        if target != gl::TEXTURE_2D {
            return self.fail(GlError::InvalidEnum, FN, "only TEXTURE_2D accepts images");
        }
        let image = self.group.borrow().images.lookup(image_id);
        let Some(image) = image else {
            return self.fail(GlError::InvalidOperation, FN, "no image with that id");
        };
        let texture = match self.bound_texture(TextureTarget::Texture2D) {
            Ok(texture) if !texture.with(Texture::is_default) => texture,
            Ok(_) => return self.fail(GlError::InvalidOperation, FN, "default textures are immutable"),
            Err(err) => return self.fail(err, FN, "no usable texture bound"),
        };
        if self.transfers.transfer_in_progress(texture.key()) {
            return self.fail(GlError::InvalidOperation, FN, "async upload in progress");
        }
        let result = {
            let mut backend = self.backend.borrow_mut();
            texture.with_mut(|t| t.bind_image(&mut *backend, image_id, image))
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.backend_failed(FN, err),
        }
    }

    pub(super) fn exec_release_tex_image_2d(&mut self, target: u32, image_id: u32) -> CmdResult {
        const FN: &str = "glReleaseTexImage2DCHROMIUM";
        if target != gl::TEXTURE_2D {
            return self.fail(GlError::InvalidEnum, FN, "only TEXTURE_2D accepts images");
        }
        match self.bound_texture(TextureTarget::Texture2D) {
            Ok(texture) => {
                // Releasing an image that is not bound is a no-op.
                texture.with_mut(|t| t.release_image(image_id));
                Ok(())
            }
            Err(err) => self.fail(err, FN, "no usable texture bound"),
        }
    }

    pub(super) fn exec_async_tex_image_2d(&mut self, args: &[u32]) -> CmdResult {
        const FN: &str = "glAsyncTexImage2DCHROMIUM";
        let a = TexImageArgs::parse(args);
        let data = self.tex_image_data(&a)?;
        let plan = match self.validate_tex_image(&a) {
            Ok(plan) => plan,
            Err((err, msg)) => return self.fail(err, FN, msg),
        };
        if plan.texture.with(Texture::is_default) {
            return self.fail(GlError::InvalidOperation, FN, "default textures are immutable");
        }
        if self.transfers.transfer_in_progress(plan.texture.key()) {
            return self.fail(GlError::InvalidOperation, FN, "async upload in progress");
        }
        let result = {
            let mut backend = self.backend.borrow_mut();
            plan.texture
                .with_mut(|t| t.define_level(&mut *backend, plan.face, plan.level, plan.spec, None))
        };
        if let Err(err) = result {
            return self.backend_failed(FN, err);
        }
        if let Some(data) = data {
            let delegate = self.transfers.create_transfer_delegate(&plan.texture);
            let upload = PixelUpload {
                face: plan.face,
                level: plan.level,
                rect: Rect::full(a.width, a.height),
                level_size: (a.width, a.height),
                data,
            };
            self.transfers.submit(&delegate, upload);
        }
        Ok(())
    }

    pub(super) fn exec_async_tex_sub_image_2d(&mut self, args: &[u32]) -> CmdResult {
        const FN: &str = "glAsyncTexSubImage2DCHROMIUM";
        let a = TexSubImageArgs::parse(args);
        let Some(data) = self.tex_sub_image_data(&a)? else {
            return self.fail(GlError::InvalidValue, FN, "pixel data is required");
        };
        let plan = match self.validate_tex_sub_image(&a) {
            Ok(plan) => plan,
            Err((err, msg)) => return self.fail(err, FN, msg),
        };
        if self.transfers.transfer_in_progress(plan.texture.key()) {
            return self.fail(GlError::InvalidOperation, FN, "async upload in progress");
        }
        let delegate = self.transfers.create_transfer_delegate(&plan.texture);
        let upload = PixelUpload {
            face: plan.face,
            level: plan.level,
            rect: a.rect,
            level_size: plan.level_size,
            data,
        };
        self.transfers.submit(&delegate, upload);
        Ok(())
    }

    pub(super) fn exec_wait_async_tex_image_2d(&mut self, target: u32) -> CmdResult {
        const FN: &str = "glWaitAsyncTexImage2DCHROMIUM";
        let Some(target) = self.texture_target(target) else {
            return self.fail(GlError::InvalidEnum, FN, "invalid target");
        };
        let texture = match self.bound_texture(target) {
            Ok(texture) => texture,
            Err(err) => return self.fail(err, FN, "no usable texture bound"),
        };
        self.transfers.wait_for_transfer_completion(texture.key());
        self.transfers.bind_completed_async_transfers(&self.backend);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use gpucmd_protocol::{gl, CmdWriter, CommandStatus};

    use crate::backend::{ResourceKind, SoftBackend};
    use crate::config::ServiceConfig;
    use crate::decoder::GpuDecoder;
    use crate::device::{ContextGroup, GpuDevice};
    use crate::shared_memory::SharedMemory;
    use crate::texture::TextureTarget;

    fn decoder(config: ServiceConfig) -> (Rc<RefCell<SoftBackend>>, GpuDecoder) {
        let soft = Rc::new(RefCell::new(SoftBackend::new()));
        let device = GpuDevice::new(soft.clone());
        let group = ContextGroup::new(&device, config).unwrap();
        (soft, GpuDecoder::new(&group))
    }

    fn run(dec: &mut GpuDecoder, w: &CmdWriter) {
        assert_eq!(dec.execute(w.as_words()).status, CommandStatus::NoError);
    }

    #[test]
    fn bind_locks_the_target() {
        let (_, mut dec) = decoder(ServiceConfig::default());
        let mut w = CmdWriter::new();
        w.gen_textures(&[1]);
        w.bind_texture(gl::TEXTURE_2D, 1);
        w.bind_texture(gl::TEXTURE_CUBE_MAP, 1);
        run(&mut dec, &w);
        assert_eq!(dec.get_error(), gl::INVALID_OPERATION);
        assert_eq!(dec.get_error(), gl::NO_ERROR);
    }

    #[test]
    fn tex_image_defines_the_bound_texture() {
        let (soft, mut dec) = decoder(ServiceConfig::default());
        let mem = SharedMemory::from_bytes(vec![7; 4 * 4 * 4]);
        let shm = dec.shared_memory().register(mem);
        let mut w = CmdWriter::new();
        w.gen_textures(&[1]);
        w.bind_texture(gl::TEXTURE_2D, 1);
        w.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, 4, 4, gl::RGBA, gl::UNSIGNED_BYTE, shm, 0);
        run(&mut dec, &w);
        assert_eq!(dec.get_error(), gl::NO_ERROR);

        let texture = dec.group().borrow().textures().resources().get(1).cloned().unwrap();
        assert_eq!(texture.with(|t| t.size()), Some((4, 4)));
        assert!(texture.with(|t| t.level(0, 0).unwrap().cleared));
        assert_eq!(soft.borrow().image_size(texture.service_id(), 0, 0), Some((4, 4)));
    }

    #[test]
    fn tex_image_validation_records_errors_without_touching_state() {
        let (_, mut dec) = decoder(ServiceConfig::default());
        let mut w = CmdWriter::new();
        w.gen_textures(&[1]);
        w.bind_texture(gl::TEXTURE_2D, 1);
        w.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGB, 4, 4, gl::RGBA, gl::UNSIGNED_BYTE, 0, 0);
        w.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, 1 << 20, 4, gl::RGBA, gl::UNSIGNED_BYTE, 0, 0);
        run(&mut dec, &w);
        assert_eq!(dec.get_error(), gl::INVALID_VALUE);
        assert_eq!(dec.get_error(), gl::INVALID_OPERATION);
        let texture = dec.group().borrow().textures().resources().get(1).cloned().unwrap();
        assert_eq!(texture.with(|t| t.size()), None);
    }

    #[test]
    fn tex_image_out_of_bounds_memory_stops_the_batch() {
        let (_, mut dec) = decoder(ServiceConfig::default());
        let shm = dec.shared_memory().register(SharedMemory::new(8));
        let mut w = CmdWriter::new();
        w.gen_textures(&[1]);
        w.bind_texture(gl::TEXTURE_2D, 1);
        w.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA, 4, 4, gl::RGBA, gl::UNSIGNED_BYTE, shm, 0);
        let r = dec.execute(w.as_words());
        assert_eq!(r.status, CommandStatus::OutOfBounds);
        assert_eq!(r.commands_processed, 2);
    }

    #[test]
    fn default_textures_reject_parameters() {
        let (_, mut dec) = decoder(ServiceConfig::default());
        let mut w = CmdWriter::new();
        w.tex_parameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::NEAREST);
        run(&mut dec, &w);
        assert_eq!(dec.get_error(), gl::INVALID_OPERATION);
    }

    #[test]
    fn active_texture_selects_units() {
        let (soft, mut dec) = decoder(ServiceConfig::default());
        let mut w = CmdWriter::new();
        w.gen_textures(&[1]);
        w.active_texture(gl::TEXTURE0 + 2);
        w.bind_texture(gl::TEXTURE_2D, 1);
        w.active_texture(gl::TEXTURE0 + 99);
        run(&mut dec, &w);
        assert_eq!(dec.get_error(), gl::INVALID_ENUM);
        assert_eq!(dec.state.active_unit, 2);
        assert!(dec.state.units[2].get(TextureTarget::Texture2D).bound().is_some());
        let sid = dec.state.units[2].get(TextureTarget::Texture2D).bound().unwrap().service_id();
        assert_eq!(soft.borrow().bound(ResourceKind::Texture, gl::TEXTURE_2D), Some(sid));
    }

    #[test]
    fn bound_images_back_level_zero() {
        let (_, mut dec) = decoder(ServiceConfig::default());
        let image = Arc::new(crate::image_manager::GpuImage::solid(2, 2, [1, 2, 3, 4]));
        dec.group().borrow_mut().images_mut().register(5, image);
        let mut w = CmdWriter::new();
        w.gen_textures(&[1]);
        w.bind_texture(gl::TEXTURE_2D, 1);
        w.bind_tex_image_2d(gl::TEXTURE_2D, 5);
        run(&mut dec, &w);
        assert_eq!(dec.get_error(), gl::NO_ERROR);
        let texture = dec.group().borrow().textures().resources().get(1).cloned().unwrap();
        assert_eq!(texture.with(|t| t.size()), Some((2, 2)));

        let mut w = CmdWriter::new();
        w.release_tex_image_2d(gl::TEXTURE_2D, 5);
        run(&mut dec, &w);
        assert_eq!(texture.with(|t| t.size()), None);
    }
}
