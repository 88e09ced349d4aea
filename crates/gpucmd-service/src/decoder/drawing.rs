use gpucmd_protocol::gl;

use super::{CmdResult, GpuDecoder, Validation};
use crate::backend::BackendError;
use crate::error::GlError;
use crate::framebuffer::{Attachment, Framebuffer, ATTACHMENT_POINTS};
use crate::program::Program;
use crate::resource::ResourceRef;
use crate::texture::{Rect, Texture};

const CLEAR_MASK: u32 = gl::COLOR_BUFFER_BIT | gl::DEPTH_BUFFER_BIT | gl::STENCIL_BUFFER_BIT;

fn attached_textures(framebuffer: &Framebuffer) -> Vec<ResourceRef<Texture>> {
    ATTACHMENT_POINTS
        .iter()
        .filter_map(|&point| match framebuffer.attachment(point) {
            Some(Attachment::Texture { texture, .. }) => Some(texture.clone()),
            _ => None,
        })
        .collect()
}

impl GpuDecoder {
    /// The bound framebuffer, if it can be rendered to. The default framebuffer has no surface.
    fn render_target(&self) -> Validation<ResourceRef<Framebuffer>> {
        let framebuffer = self
            .state
            .framebuffer
            .resolve()
            .map_err(|e| (e, "bound framebuffer id was never generated"))?
            .ok_or((GlError::InvalidFramebufferOperation, "default framebuffer has no surface"))?;
        if !framebuffer.with(Framebuffer::is_complete) {
            return Err((GlError::InvalidFramebufferOperation, "framebuffer is incomplete"));
        }
        Ok(framebuffer.clone())
    }

    /// Make everything a draw or read touches hold meaningful contents: finished uploads are
    /// applied, proxies get backend storage, and uncleared levels and attachments are zeroed.
    fn prepare_render(
        &mut self,
        framebuffer: &ResourceRef<Framebuffer>,
        sampled: Vec<ResourceRef<Texture>>,
    ) -> Result<(), BackendError> {
        self.transfers.bind_completed_async_transfers(&self.backend);
        let attached = framebuffer.with(attached_textures);
        let mut backend = self.backend.borrow_mut();
        for texture in sampled.iter().chain(&attached) {
            texture.with_mut(|t| t.clear_uncleared_levels(&mut *backend))?;
        }
        framebuffer.with(|fb| fb.clear_uncleared_attachments(&mut *backend))
    }

    pub(super) fn exec_clear_color(&mut self, rgba: [f32; 4]) {
        self.state.clear.color = rgba;
    }

    pub(super) fn exec_clear(&mut self, mask: u32) -> CmdResult {
        const FN: &str = "glClear";
        if mask & !CLEAR_MASK != 0 {
            return self.fail(GlError::InvalidValue, FN, "unknown bits in mask");
        }
        let framebuffer = match self.render_target() {
            Ok(framebuffer) => framebuffer,
            Err((err, msg)) => return self.fail(err, FN, msg),
        };
        self.transfers.bind_completed_async_transfers(&self.backend);
        let result = {
            let mut backend = self.backend.borrow_mut();
            let values = self.state.clear;
            framebuffer.with(|fb| fb.clear(&mut *backend, mask, &values))
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.backend_failed(FN, err),
        }
    }

    pub(super) fn exec_draw_arrays(&mut self, mode: u32, first: u32, count: u32) -> CmdResult {
        const FN: &str = "glDrawArrays";
        if mode > gl::TRIANGLE_FAN {
            return self.fail(GlError::InvalidEnum, FN, "invalid mode");
        }
        if !self.state.program.as_ref().is_some_and(|p| p.with(Program::is_linked)) {
            return self.fail(GlError::InvalidOperation, FN, "no linked program in use");
        }
        let framebuffer = match self.render_target() {
            Ok(framebuffer) => framebuffer,
            Err((err, msg)) => return self.fail(err, FN, msg),
        };
        let sampled = self.state.bound_textures();
        if let Err(err) = self.prepare_render(&framebuffer, sampled) {
            return self.backend_failed(FN, err);
        }
        let result = self.backend.borrow_mut().draw(mode, first, count);
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.backend_failed(FN, err),
        }
    }

    pub(super) fn exec_read_pixels(&mut self, args: &[u32]) -> CmdResult {
        const FN: &str = "glReadPixels";
        let rect = Rect {
            x: args[0],
            y: args[1],
            width: args[2],
            height: args[3],
        };
        let (format, ty, shm_id, shm_offset) = (args[4], args[5], args[6], args[7]);
        let out = self.resolve_pixels(shm_id, shm_offset, (rect.width, rect.height), format, ty)?;
        if (format, ty) != (gl::RGBA, gl::UNSIGNED_BYTE) {
            return self.fail(GlError::InvalidOperation, FN, "only RGBA/UNSIGNED_BYTE can be read");
        }

        let framebuffer = match self.render_target() {
            Ok(framebuffer) => framebuffer,
            Err((err, msg)) => return self.fail(err, FN, msg),
        };
        let fits = framebuffer
            .with(Framebuffer::size)
            .is_some_and(|(w, h)| rect.fits_in(w, h));
        if !fits {
            return self.fail(GlError::InvalidValue, FN, "rectangle outside the framebuffer");
        }
        if let Err(err) = self.prepare_render(&framebuffer, Vec::new()) {
            return self.backend_failed(FN, err);
        }
        let pixels = {
            let backend = self.backend.borrow();
            framebuffer.with(|fb| fb.read_color(&*backend, rect))
        };
        match pixels {
            Ok(pixels) => {
                out.write(0, &pixels);
                Ok(())
            }
            Err(err) => self.fail(err, FN, "color attachment cannot be read"),
        }
    }
}
