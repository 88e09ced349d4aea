use gpucmd_protocol::gl;

use super::state::Slot;
use super::{CmdResult, GpuDecoder};
use crate::backend::ResourceKind;
use crate::error::GlError;
use crate::framebuffer::{renderbuffer_bytes_per_pixel, valid_attachment_point, Attachment, Framebuffer, Renderbuffer};
use crate::resource::ResourceRef;
use crate::resource_manager::ResourceError;
use crate::texture::face_target;

impl GpuDecoder {
    /// The bound framebuffer. Attaching to the default framebuffer is not allowed.
    fn attachable_framebuffer(&self) -> Result<ResourceRef<Framebuffer>, GlError> {
        self.state
            .framebuffer
            .resolve()?
            .cloned()
            .ok_or(GlError::InvalidOperation)
    }

    pub(super) fn exec_gen_framebuffers(&mut self, ids: &[u32]) -> CmdResult {
        match self.framebuffers.gen(ids, Framebuffer::new) {
            Ok(()) => Ok(()),
            Err(err) => self.resource_failed("glGenFramebuffers", err),
        }
    }

    pub(super) fn exec_delete_framebuffers(&mut self, ids: &[u32]) -> CmdResult {
        let mut released = Vec::new();
        for &id in ids {
            let Some(framebuffer) = self.framebuffers.delete(id) else {
                continue;
            };
            if self.state.framebuffer.holds(&framebuffer) {
                // Only fails on a lost context, which the next command notices.
                let _ = self
                    .backend
                    .borrow_mut()
                    .bind(ResourceKind::Framebuffer, gl::FRAMEBUFFER, None);
                released.push(self.state.framebuffer.replace(Slot::None));
            }
            released.push(Slot::Bound(framebuffer));
        }
        drop(released);
        Ok(())
    }

    pub(super) fn exec_bind_framebuffer(&mut self, target: u32, id: u32) -> CmdResult {
        const FN: &str = "glBindFramebuffer";
        if target != gl::FRAMEBUFFER {
            return self.fail(GlError::InvalidEnum, FN, "invalid target");
        }
        let slot = if id == 0 {
            Slot::None
        } else {
            match self.framebuffers.bind_lookup(id, Framebuffer::new) {
                Ok(Some(framebuffer)) => Slot::Bound(framebuffer),
                Ok(None) => Slot::None,
                Err(ResourceError::NotGenerated(_)) => {
                    let old = self.state.framebuffer.replace(Slot::Invalid(id));
                    drop(old);
                    return self.fail(GlError::InvalidOperation, FN, "id was never generated");
                }
                Err(err) => return self.resource_failed(FN, err),
            }
        };
        let service_id = slot.bound().map(ResourceRef::service_id);
        let result = self
            .backend
            .borrow_mut()
            .bind(ResourceKind::Framebuffer, gl::FRAMEBUFFER, service_id);
        if let Err(err) = result {
            return self.backend_failed(FN, err);
        }
        let old = self.state.framebuffer.replace(slot);
        drop(old);
        Ok(())
    }

    fn attach(&mut self, function: &'static str, point: u32, attachment: Option<Attachment>) -> CmdResult {
        let framebuffer = match self.attachable_framebuffer() {
            Ok(framebuffer) => framebuffer,
            Err(err) => return self.fail(err, function, "no framebuffer object bound"),
        };
        let result = {
            let mut backend = self.backend.borrow_mut();
            framebuffer.with_mut(|fb| fb.attach(&mut *backend, point, attachment))
        };
        match result {
            Ok(previous) => {
                drop(previous);
                Ok(())
            }
            Err(err) => self.backend_failed(function, err),
        }
    }

    pub(super) fn exec_framebuffer_texture_2d(
        &mut self,
        target: u32,
        point: u32,
        textarget: u32,
        texture: u32,
        level: u32,
    ) -> CmdResult {
        const FN: &str = "glFramebufferTexture2D";
        if target != gl::FRAMEBUFFER || !valid_attachment_point(point) {
            return self.fail(GlError::InvalidEnum, FN, "invalid target or attachment point");
        }
        if texture == 0 {
            return self.attach(FN, point, None);
        }
        let Some((tex_target, face)) = face_target(textarget).filter(|(t, _)| t.is_enabled(self.config.features))
        else {
            return self.fail(GlError::InvalidEnum, FN, "invalid texture target");
        };
        if level != 0 {
            return self.fail(GlError::InvalidValue, FN, "only level 0 can be attached");
        }
        let texture = self.group.borrow().textures.resources().get(texture).cloned();
        let Some(texture) = texture else {
            return self.fail(GlError::InvalidOperation, FN, "no such texture");
        };
        if texture.with(|t| t.target()) != Some(tex_target) {
            return self.fail(GlError::InvalidOperation, FN, "texture target does not match");
        }
        self.attach(FN, point, Some(Attachment::Texture { texture, face, level }))
    }

    pub(super) fn exec_framebuffer_renderbuffer(
        &mut self,
        target: u32,
        point: u32,
        rb_target: u32,
        renderbuffer: u32,
    ) -> CmdResult {
        const FN: &str = "glFramebufferRenderbuffer";
        if target != gl::FRAMEBUFFER || rb_target != gl::RENDERBUFFER || !valid_attachment_point(point) {
            return self.fail(GlError::InvalidEnum, FN, "invalid target or attachment point");
        }
        if renderbuffer == 0 {
            return self.attach(FN, point, None);
        }
        let renderbuffer = self.group.borrow().renderbuffers.get(renderbuffer).cloned();
        let Some(renderbuffer) = renderbuffer else {
            return self.fail(GlError::InvalidOperation, FN, "no such renderbuffer");
        };
        self.attach(FN, point, Some(Attachment::Renderbuffer(renderbuffer)))
    }

    pub(super) fn exec_check_framebuffer_status(&mut self, target: u32, shm_id: u32, shm_offset: u32) -> CmdResult {
        const FN: &str = "glCheckFramebufferStatus";
        let out = self.resolve(shm_id, shm_offset, 4)?;
        if target != gl::FRAMEBUFFER {
            out.write_u32(0, 0);
            return self.fail(GlError::InvalidEnum, FN, "invalid target");
        }
        let status = match self.state.framebuffer.resolve() {
            Ok(Some(framebuffer)) => framebuffer.with(Framebuffer::status),
            Ok(None) => gl::FRAMEBUFFER_UNDEFINED,
            Err(err) => {
                out.write_u32(0, 0);
                return self.fail(err, FN, "bound id was never generated");
            }
        };
        out.write_u32(0, status);
        Ok(())
    }

    pub(super) fn exec_gen_renderbuffers(&mut self, ids: &[u32]) -> CmdResult {
        let result = self.group.borrow_mut().renderbuffers.gen(ids, Renderbuffer::new);
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.resource_failed("glGenRenderbuffers", err),
        }
    }

    pub(super) fn exec_delete_renderbuffers(&mut self, ids: &[u32]) -> CmdResult {
        let mut released = Vec::new();
        let mut detached = Vec::new();
        for &id in ids {
            let Some(renderbuffer) = self.group.borrow_mut().renderbuffers.delete(id) else {
                continue;
            };
            if self.state.renderbuffer.holds(&renderbuffer) {
                released.push(self.state.renderbuffer.replace(Slot::None));
            }
            if let Some(fb) = self.state.framebuffer.bound() {
                let mut backend = self.backend.borrow_mut();
                detached.extend(fb.with_mut(|fb| fb.detach_where(&mut *backend, |a| a.is_renderbuffer(&renderbuffer))));
            }
            released.push(Slot::Bound(renderbuffer));
        }
        drop(detached);
        drop(released);
        Ok(())
    }

    pub(super) fn exec_bind_renderbuffer(&mut self, target: u32, id: u32) -> CmdResult {
        const FN: &str = "glBindRenderbuffer";
        if target != gl::RENDERBUFFER {
            return self.fail(GlError::InvalidEnum, FN, "invalid target");
        }
        let slot = if id == 0 {
            Slot::None
        } else {
            let lookup = self.group.borrow_mut().renderbuffers.bind_lookup(id, Renderbuffer::new);
            match lookup {
                Ok(Some(renderbuffer)) => Slot::Bound(renderbuffer),
                Ok(None) => Slot::None,
                Err(ResourceError::NotGenerated(_)) => {
                    let old = self.state.renderbuffer.replace(Slot::Invalid(id));
                    drop(old);
                    return self.fail(GlError::InvalidOperation, FN, "id was never generated");
                }
                Err(err) => return self.resource_failed(FN, err),
            }
        };
        let service_id = slot.bound().map(ResourceRef::service_id);
        let result = self
            .backend
            .borrow_mut()
            .bind(ResourceKind::Renderbuffer, gl::RENDERBUFFER, service_id);
        if let Err(err) = result {
            return self.backend_failed(FN, err);
        }
        let old = self.state.renderbuffer.replace(slot);
        drop(old);
        Ok(())
    }

    pub(super) fn exec_renderbuffer_storage(
        &mut self,
        target: u32,
        internal_format: u32,
        width: u32,
        height: u32,
    ) -> CmdResult {
        const FN: &str = "glRenderbufferStorage";
        if target != gl::RENDERBUFFER || renderbuffer_bytes_per_pixel(internal_format).is_none() {
            return self.fail(GlError::InvalidEnum, FN, "invalid target or format");
        }
        let max = self.config.max_renderbuffer_size;
        if width > max || height > max {
            return self.fail(GlError::InvalidValue, FN, "size exceeds the renderbuffer limit");
        }
        let renderbuffer = match self.state.renderbuffer.resolve() {
            Ok(Some(renderbuffer)) => renderbuffer.clone(),
            Ok(None) => return self.fail(GlError::InvalidOperation, FN, "no renderbuffer bound"),
            Err(err) => return self.fail(err, FN, "bound id was never generated"),
        };
        let result = {
            let mut backend = self.backend.borrow_mut();
            renderbuffer.with_mut(|rb| rb.set_storage(&mut *backend, internal_format, width, height))
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.backend_failed(FN, err),
        }
    }
}
