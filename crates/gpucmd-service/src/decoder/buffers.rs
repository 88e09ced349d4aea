use gpucmd_protocol::cmd::NO_SHARED_MEMORY;

use super::state::Slot;
use super::{CmdResult, GpuDecoder};
use crate::backend::ResourceKind;
use crate::buffer::{valid_usage, Buffer, BufferTarget};
use crate::error::GlError;
use crate::resource::ResourceRef;
use crate::resource_manager::ResourceError;

impl GpuDecoder {
    fn bound_buffer(&self, target: BufferTarget) -> Result<ResourceRef<Buffer>, GlError> {
        self.state
            .buffer(target)
            .resolve()?
            .cloned()
            .ok_or(GlError::InvalidOperation)
    }

    pub(super) fn exec_gen_buffers(&mut self, ids: &[u32]) -> CmdResult {
        let result = self.group.borrow_mut().buffers.gen(ids, Buffer::new);
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.resource_failed("glGenBuffers", err),
        }
    }

    pub(super) fn exec_delete_buffers(&mut self, ids: &[u32]) -> CmdResult {
        let mut released = Vec::new();
        for &id in ids {
            let Some(buffer) = self.group.borrow_mut().buffers.delete(id) else {
                continue;
            };
            for target in [BufferTarget::Array, BufferTarget::ElementArray] {
                let slot = self.state.buffer_mut(target);
                if slot.holds(&buffer) {
                    released.push(slot.replace(Slot::None));
                }
            }
            released.push(Slot::Bound(buffer));
        }
        drop(released);
        Ok(())
    }

    pub(super) fn exec_bind_buffer(&mut self, target: u32, id: u32) -> CmdResult {
        const FN: &str = "glBindBuffer";
        let Some(target) = BufferTarget::from_gl(target) else {
            return self.fail(GlError::InvalidEnum, FN, "invalid target");
        };
        let slot = if id == 0 {
            Slot::None
        } else {
            let lookup = self.group.borrow_mut().buffers.bind_lookup(id, Buffer::new);
            match lookup {
                Ok(Some(buffer)) => {
                    if buffer.with_mut(|b| b.set_target(target)).is_err() {
                        return self.fail(GlError::InvalidOperation, FN, "buffer belongs to another target");
                    }
                    Slot::Bound(buffer)
                }
                Ok(None) => Slot::None,
                Err(ResourceError::NotGenerated(_)) => {
                    let old = self.state.buffer_mut(target).replace(Slot::Invalid(id));
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
            .bind(ResourceKind::Buffer, target.gl_enum(), service_id);
        if let Err(err) = result {
            return self.backend_failed(FN, err);
        }
        let old = self.state.buffer_mut(target).replace(slot);
        drop(old);
        Ok(())
    }

    pub(super) fn exec_buffer_data(
        &mut self,
        target: u32,
        size: u32,
        shm_id: u32,
        shm_offset: u32,
        usage: u32,
    ) -> CmdResult {
        const FN: &str = "glBufferData";
        let data = if shm_id == NO_SHARED_MEMORY {
            None
        } else {
            Some(self.resolve(shm_id, shm_offset, size)?.read_all())
        };
        let Some(target) = BufferTarget::from_gl(target) else {
            return self.fail(GlError::InvalidEnum, FN, "invalid target");
        };
        if !valid_usage(usage) {
            return self.fail(GlError::InvalidEnum, FN, "invalid usage");
        }
        if size > self.config.max_buffer_size {
            return self.fail(GlError::OutOfMemory, FN, "size exceeds max_buffer_size");
        }
        let buffer = match self.bound_buffer(target) {
            Ok(buffer) => buffer,
            Err(err) => return self.fail(err, FN, "no buffer bound"),
        };
        let result = {
            let mut backend = self.backend.borrow_mut();
            buffer.with_mut(|b| b.set_data(&mut *backend, size, data.as_deref(), usage))
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.backend_failed(FN, err),
        }
    }

    pub(super) fn exec_buffer_sub_data(
        &mut self,
        target: u32,
        offset: u32,
        size: u32,
        shm_id: u32,
        shm_offset: u32,
    ) -> CmdResult {
        const FN: &str = "glBufferSubData";
        let data = self.resolve(shm_id, shm_offset, size)?.read_all();
        let Some(target) = BufferTarget::from_gl(target) else {
            return self.fail(GlError::InvalidEnum, FN, "invalid target");
        };
        let buffer = match self.bound_buffer(target) {
            Ok(buffer) => buffer,
            Err(err) => return self.fail(err, FN, "no buffer bound"),
        };
        let result = {
            let mut backend = self.backend.borrow_mut();
            buffer.with_mut(|b| b.set_sub_data(&mut *backend, offset, &data))
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err, FN, "range outside the buffer"),
        }
    }
}
