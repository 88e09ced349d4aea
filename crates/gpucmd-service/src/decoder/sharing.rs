use gpucmd_protocol::mailbox::MAILBOX_SIZE_WORDS;
use gpucmd_protocol::Mailbox;

use super::state::Slot;
use super::{CmdResult, GpuDecoder};
use crate::backend::ResourceKind;
use crate::error::{ExecError, GlError};
use crate::mailbox::MailboxError;
use crate::resource::ResourceRef;
use crate::texture::Texture;

/// The mailbox name following the target word of a produce/consume packet.
pub(super) fn mailbox_payload(args: &[u32]) -> Result<Mailbox, ExecError> {
    let words: &[u32; MAILBOX_SIZE_WORDS] = args[1..]
        .get(..MAILBOX_SIZE_WORDS)
        .and_then(|w| w.try_into().ok())
        .ok_or(ExecError::PayloadTruncated)?;
    Ok(Mailbox::from_words(words))
}

impl GpuDecoder {
    fn mailbox_failed(&mut self, function: &'static str, err: MailboxError) -> CmdResult {
        match err {
            MailboxError::Backend(err) => self.backend_failed(function, err),
            err => self.fail(GlError::InvalidOperation, function, &err.to_string()),
        }
    }

    /// The non-default texture bound at `target` on the active unit.
    fn bound_named_texture(&self, target: u32) -> Result<ResourceRef<Texture>, (GlError, &'static str)> {
        let target = self
            .texture_target(target)
            .ok_or((GlError::InvalidEnum, "invalid target"))?;
        self.state
            .unit()
            .get(target)
            .resolve()
            .map_err(|e| (e, "bound id was never generated"))?
            .cloned()
            .ok_or((GlError::InvalidOperation, "default textures cannot be shared"))
    }

    pub(super) fn exec_produce_texture(&mut self, target: u32, mailbox: Mailbox) -> CmdResult {
        const FN: &str = "glProduceTextureCHROMIUM";
        let texture = match self.bound_named_texture(target) {
            Ok(texture) => texture,
            Err((err, msg)) => return self.fail(err, FN, msg),
        };
        match self.device.produce_texture(mailbox, &texture) {
            Ok(()) => Ok(()),
            Err(err) => self.mailbox_failed(FN, err),
        }
    }

    pub(super) fn exec_consume_texture(&mut self, target: u32, mailbox: Mailbox) -> CmdResult {
        const FN: &str = "glConsumeTextureCHROMIUM";
        let current = match self.bound_named_texture(target) {
            Ok(texture) => texture,
            Err((err, msg)) => return self.fail(err, FN, msg),
        };
        let client_id = self.group.borrow().textures.resources().client_id_of(&current);
        let Some(client_id) = client_id else {
            return self.fail(GlError::InvalidOperation, FN, "bound texture has no name");
        };
        let consumed = match self.device.consume_texture(&mailbox) {
            Ok(Some(texture)) => texture,
            Ok(None) => return self.fail(GlError::InvalidOperation, FN, "unknown mailbox"),
            Err(err) => return self.mailbox_failed(FN, err),
        };
        let tex_target = current.with(|t| t.target());
        if consumed.with(|t| t.target()) != tex_target {
            return self.fail(GlError::InvalidOperation, FN, "mailbox texture has a different target");
        }
        let Some(tex_target) = tex_target else {
            return self.fail(GlError::InvalidOperation, FN, "texture has no target");
        };
        if consumed.ptr_eq(&current) {
            return Ok(());
        }

        let result = self
            .backend
            .borrow_mut()
            .bind(ResourceKind::Texture, tex_target.gl_enum(), Some(consumed.service_id()));
        if let Err(err) = result {
            return self.backend_failed(FN, err);
        }
        let old_name = self
            .group
            .borrow_mut()
            .textures
            .resources_mut()
            .replace(client_id, consumed.clone());
        let old_slot = self.state.unit_mut().get_mut(tex_target).replace(Slot::Bound(consumed));
        drop((old_name, old_slot, current));
        Ok(())
    }

    pub(super) fn exec_gen_sync_point(&mut self, shm_id: u32, shm_offset: u32) -> CmdResult {
        let out = self.resolve(shm_id, shm_offset, 4)?;
        // Finished uploads belong to the state being published.
        self.transfers.bind_completed_async_transfers(&self.backend);
        let sync_point = self.device.sync_points().generate_sync_point();
        self.device.push_texture_updates(sync_point);
        out.write_u32(0, sync_point);
        Ok(())
    }

    pub(super) fn exec_wait_sync_point(&mut self, sync_point: u32) -> CmdResult {
        if !self.device.sync_points().is_generated(sync_point) {
            return self.fail(GlError::InvalidValue, "glWaitSyncPointCHROMIUM", "sync point was never generated");
        }
        self.device.pull_texture_updates(sync_point);
        Ok(())
    }
}
