//! Command stream builder.
//!
//! Intended for tests, fixtures and client-side tooling that needs to emit canonical command
//! streams (correct header sizes, argument order, inline payloads).

use crate::cmd::{CmdHeader, Opcode, MAX_CMD_SIZE_WORDS};
use crate::mailbox::Mailbox;

#[derive(Debug, Default, Clone)]
pub struct CmdWriter {
    buf: Vec<u32>,
}

impl CmdWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn finish(self) -> Vec<u32> {
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len_words(&self) -> usize {
        self.buf.len()
    }

    pub fn as_words(&self) -> &[u32] {
        &self.buf
    }

    /// Append a command with a header computed from `args`.
    pub fn command(&mut self, opcode: Opcode, args: &[u32]) {
        self.raw(opcode as u32, args);
    }

    /// Append a command with an arbitrary (possibly unknown) opcode.
    pub fn raw(&mut self, opcode: u32, args: &[u32]) {
        let size = args.len() + 1;
        assert!(
            size <= MAX_CMD_SIZE_WORDS as usize,
            "command too large for the header size field"
        );
        self.buf.push(CmdHeader::new(opcode, size as u32).pack());
        self.buf.extend_from_slice(args);
    }

    /// Append a header that lies about its size. Used to exercise decoder validation.
    pub fn raw_with_size(&mut self, opcode: u32, size_words: u32, args: &[u32]) {
        self.buf.push(CmdHeader::new(opcode, size_words).pack());
        self.buf.extend_from_slice(args);
    }

    fn immediate(&mut self, opcode: Opcode, fixed: &[u32], payload: &[u32]) {
        let mut args = Vec::with_capacity(fixed.len() + payload.len());
        args.extend_from_slice(fixed);
        args.extend_from_slice(payload);
        self.command(opcode, &args);
    }

    fn gen_or_delete(&mut self, opcode: Opcode, ids: &[u32]) {
        self.immediate(opcode, &[ids.len() as u32], ids);
    }

    pub fn noop(&mut self, skip_words: u32) {
        let args = vec![0u32; skip_words as usize];
        self.command(Opcode::Noop, &args);
    }

    pub fn set_token(&mut self, token: u32) {
        self.command(Opcode::SetToken, &[token]);
    }

    /// Drain one pending GL error into a `u32` at `(shm_id, shm_offset)`.
    pub fn get_error(&mut self, shm_id: u32, shm_offset: u32) {
        self.command(Opcode::GetError, &[shm_id, shm_offset]);
    }

    pub fn gen_textures(&mut self, ids: &[u32]) {
        self.gen_or_delete(Opcode::GenTexturesImmediate, ids);
    }

    pub fn delete_textures(&mut self, ids: &[u32]) {
        self.gen_or_delete(Opcode::DeleteTexturesImmediate, ids);
    }

    pub fn bind_texture(&mut self, target: u32, id: u32) {
        self.command(Opcode::BindTexture, &[target, id]);
    }

    pub fn active_texture(&mut self, unit: u32) {
        self.command(Opcode::ActiveTexture, &[unit]);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tex_image_2d(
        &mut self,
        target: u32,
        level: u32,
        internal_format: u32,
        width: u32,
        height: u32,
        format: u32,
        ty: u32,
        shm_id: u32,
        shm_offset: u32,
    ) {
        self.command(
            Opcode::TexImage2D,
            &[target, level, internal_format, width, height, 0, format, ty, shm_id, shm_offset],
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tex_sub_image_2d(
        &mut self,
        target: u32,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        format: u32,
        ty: u32,
        shm_id: u32,
        shm_offset: u32,
    ) {
        self.command(
            Opcode::TexSubImage2D,
            &[target, level, x, y, width, height, format, ty, shm_id, shm_offset],
        );
    }

    pub fn tex_parameteri(&mut self, target: u32, pname: u32, param: u32) {
        self.command(Opcode::TexParameteri, &[target, pname, param]);
    }

    pub fn gen_buffers(&mut self, ids: &[u32]) {
        self.gen_or_delete(Opcode::GenBuffersImmediate, ids);
    }

    pub fn delete_buffers(&mut self, ids: &[u32]) {
        self.gen_or_delete(Opcode::DeleteBuffersImmediate, ids);
    }

    pub fn bind_buffer(&mut self, target: u32, id: u32) {
        self.command(Opcode::BindBuffer, &[target, id]);
    }

    pub fn buffer_data(&mut self, target: u32, size: u32, shm_id: u32, shm_offset: u32, usage: u32) {
        self.command(Opcode::BufferData, &[target, size, shm_id, shm_offset, usage]);
    }

    pub fn buffer_sub_data(&mut self, target: u32, offset: u32, size: u32, shm_id: u32, shm_offset: u32) {
        self.command(Opcode::BufferSubData, &[target, offset, size, shm_id, shm_offset]);
    }

    pub fn gen_framebuffers(&mut self, ids: &[u32]) {
        self.gen_or_delete(Opcode::GenFramebuffersImmediate, ids);
    }

    pub fn delete_framebuffers(&mut self, ids: &[u32]) {
        self.gen_or_delete(Opcode::DeleteFramebuffersImmediate, ids);
    }

    pub fn bind_framebuffer(&mut self, target: u32, id: u32) {
        self.command(Opcode::BindFramebuffer, &[target, id]);
    }

    pub fn framebuffer_texture_2d(&mut self, target: u32, attachment: u32, textarget: u32, texture: u32, level: u32) {
        self.command(
            Opcode::FramebufferTexture2D,
            &[target, attachment, textarget, texture, level],
        );
    }

    pub fn framebuffer_renderbuffer(&mut self, target: u32, attachment: u32, rb_target: u32, renderbuffer: u32) {
        self.command(
            Opcode::FramebufferRenderbuffer,
            &[target, attachment, rb_target, renderbuffer],
        );
    }

    /// Write the framebuffer status as a `u32` at `(shm_id, shm_offset)`.
    pub fn check_framebuffer_status(&mut self, target: u32, shm_id: u32, shm_offset: u32) {
        self.command(Opcode::CheckFramebufferStatus, &[target, shm_id, shm_offset]);
    }

    pub fn gen_renderbuffers(&mut self, ids: &[u32]) {
        self.gen_or_delete(Opcode::GenRenderbuffersImmediate, ids);
    }

    pub fn delete_renderbuffers(&mut self, ids: &[u32]) {
        self.gen_or_delete(Opcode::DeleteRenderbuffersImmediate, ids);
    }

    pub fn bind_renderbuffer(&mut self, target: u32, id: u32) {
        self.command(Opcode::BindRenderbuffer, &[target, id]);
    }

    pub fn renderbuffer_storage(&mut self, target: u32, internal_format: u32, width: u32, height: u32) {
        self.command(
            Opcode::RenderbufferStorage,
            &[target, internal_format, width, height],
        );
    }

    pub fn create_shader(&mut self, ty: u32, client_id: u32) {
        self.command(Opcode::CreateShader, &[ty, client_id]);
    }

    pub fn delete_shader(&mut self, id: u32) {
        self.command(Opcode::DeleteShader, &[id]);
    }

    pub fn create_program(&mut self, client_id: u32) {
        self.command(Opcode::CreateProgram, &[client_id]);
    }

    pub fn delete_program(&mut self, id: u32) {
        self.command(Opcode::DeleteProgram, &[id]);
    }

    pub fn attach_shader(&mut self, program: u32, shader: u32) {
        self.command(Opcode::AttachShader, &[program, shader]);
    }

    pub fn link_program(&mut self, program: u32) {
        self.command(Opcode::LinkProgram, &[program]);
    }

    pub fn use_program(&mut self, program: u32) {
        self.command(Opcode::UseProgram, &[program]);
    }

    pub fn clear_color(&mut self, rgba: [f32; 4]) {
        self.command(Opcode::ClearColor, &rgba.map(f32::to_bits));
    }

    pub fn clear(&mut self, mask: u32) {
        self.command(Opcode::Clear, &[mask]);
    }

    pub fn draw_arrays(&mut self, mode: u32, first: u32, count: u32) {
        self.command(Opcode::DrawArrays, &[mode, first, count]);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn read_pixels(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        format: u32,
        ty: u32,
        shm_id: u32,
        shm_offset: u32,
    ) {
        self.command(
            Opcode::ReadPixels,
            &[x, y, width, height, format, ty, shm_id, shm_offset],
        );
    }

    pub fn gen_queries(&mut self, ids: &[u32]) {
        self.gen_or_delete(Opcode::GenQueriesImmediate, ids);
    }

    pub fn delete_queries(&mut self, ids: &[u32]) {
        self.gen_or_delete(Opcode::DeleteQueriesImmediate, ids);
    }

    pub fn begin_query(&mut self, target: u32, id: u32, sync_shm_id: u32, sync_shm_offset: u32) {
        self.command(Opcode::BeginQuery, &[target, id, sync_shm_id, sync_shm_offset]);
    }

    pub fn end_query(&mut self, target: u32, submit_count: u32) {
        self.command(Opcode::EndQuery, &[target, submit_count]);
    }

    pub fn produce_texture(&mut self, target: u32, mailbox: &Mailbox) {
        self.immediate(Opcode::ProduceTextureImmediate, &[target], &mailbox.to_words());
    }

    pub fn consume_texture(&mut self, target: u32, mailbox: &Mailbox) {
        self.immediate(Opcode::ConsumeTextureImmediate, &[target], &mailbox.to_words());
    }

    /// Insert a sync point; its value is written as a `u32` at `(shm_id, shm_offset)`.
    pub fn gen_sync_point(&mut self, shm_id: u32, shm_offset: u32) {
        self.command(Opcode::GenSyncPoint, &[shm_id, shm_offset]);
    }

    pub fn wait_sync_point(&mut self, sync_point: u32) {
        self.command(Opcode::WaitSyncPoint, &[sync_point]);
    }

    pub fn bind_tex_image_2d(&mut self, target: u32, image_id: u32) {
        self.command(Opcode::BindTexImage2D, &[target, image_id]);
    }

    pub fn release_tex_image_2d(&mut self, target: u32, image_id: u32) {
        self.command(Opcode::ReleaseTexImage2D, &[target, image_id]);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn async_tex_image_2d(
        &mut self,
        target: u32,
        level: u32,
        internal_format: u32,
        width: u32,
        height: u32,
        format: u32,
        ty: u32,
        shm_id: u32,
        shm_offset: u32,
    ) {
        self.command(
            Opcode::AsyncTexImage2D,
            &[target, level, internal_format, width, height, 0, format, ty, shm_id, shm_offset],
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn async_tex_sub_image_2d(
        &mut self,
        target: u32,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        format: u32,
        ty: u32,
        shm_id: u32,
        shm_offset: u32,
    ) {
        self.command(
            Opcode::AsyncTexSubImage2D,
            &[target, level, x, y, width, height, format, ty, shm_id, shm_offset],
        );
    }

    pub fn wait_async_tex_image_2d(&mut self, target: u32) {
        self.command(Opcode::WaitAsyncTexImage2D, &[target]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{CmdStreamIter, Opcode};

    #[test]
    fn gen_textures_carries_count_then_ids() {
        let mut w = CmdWriter::new();
        w.gen_textures(&[5, 6]);
        w.bind_texture(0x0DE1, 5);
        let words = w.finish();

        let packets: Vec<_> = CmdStreamIter::new(&words).map(Result::unwrap).collect();
        assert_eq!(packets.len(), 2);
        let (at, packet) = packets[0];
        assert_eq!(at, 0);
        assert_eq!(packet.opcode, Some(Opcode::GenTexturesImmediate));
        assert_eq!(packet.args, &[2, 5, 6]);
        assert_eq!(packets[1].0, 4);
    }

    #[test]
    fn mailbox_payload_follows_target() {
        let mailbox = Mailbox::from_bytes([0xAB; 16]);
        let mut w = CmdWriter::new();
        w.produce_texture(0x0DE1, &mailbox);
        let words = w.finish();
        assert_eq!(words.len(), 6);
        assert_eq!(words[1], 0x0DE1);
        assert_eq!(Mailbox::from_words(&[words[2], words[3], words[4], words[5]]), mailbox);
    }
}
