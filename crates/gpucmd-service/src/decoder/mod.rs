//! Command stream execution.
//!
//! [`GpuDecoder`] walks a batch of packets and dispatches each to an `exec_*` handler. Every
//! command is checked in a fixed order before it may touch state:
//!
//! 1. framing (header size against the remaining words),
//! 2. opcode and capability gating,
//! 3. argument layout and shared-memory ranges,
//! 4. GL semantics.
//!
//! Failures in steps 1-3 stop the batch with a [`CommandStatus`]; everything already executed
//! stays executed. Failures in step 4 record a sticky GL error and execution continues with the
//! next command.

mod buffers;
mod drawing;
mod framebuffers;
mod programs;
mod queries;
mod sharing;
mod state;
mod textures;

use std::rc::Rc;

use gpucmd_protocol::{read_packet, ArgLayout, CmdPacket, CmdStreamError, CommandStatus, Opcode};
use tracing::{debug, warn};

use crate::backend::{BackendError, SharedBackend};
use crate::config::{FeatureSet, ServiceConfig, TransferMode};
use crate::device::{GpuDevice, SharedGroup};
use crate::error::{ErrorState, ExecError, GlError};
use crate::framebuffer::Framebuffer;
use crate::pixel_transfer::{AsyncPixelTransferManager, IdleTransferManager, ThreadedTransferManager, TransferStats};
use crate::query_manager::{QueryManager, QueryStatus};
use crate::resource_manager::{ClientId, ResourceError, ResourceManager};
use crate::shared_memory::{MemoryError, MemoryRange, SharedMemoryRegistry};
use crate::texture::bytes_per_pixel;

use self::state::ContextState;

type CmdResult = Result<(), ExecError>;

/// A GL-level rejection: the error to record and a short reason for the log.
type Validation<T> = Result<T, (GlError, &'static str)>;

/// Outcome of [`GpuDecoder::execute`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecuteResult {
    pub status: CommandStatus,
    pub commands_processed: u32,
    /// Words consumed by fully executed commands. On error this is the offset of the failing packet.
    pub words_processed: usize,
}

pub struct GpuDecoder {
    group: SharedGroup,
    device: Rc<GpuDevice>,
    backend: SharedBackend,
    config: ServiceConfig,
    shm: SharedMemoryRegistry,
    errors: ErrorState,
    state: ContextState,
    /// Framebuffer names are per context, unlike every other object kind.
    framebuffers: ResourceManager<Framebuffer>,
    queries: QueryManager,
    transfers: Box<dyn AsyncPixelTransferManager>,
    token: u32,
    context_lost: bool,
}

impl GpuDecoder {
    pub fn new(group: &SharedGroup) -> Self {
        let (device, config) = {
            let group = group.borrow();
            (Rc::clone(group.device()), group.config().clone())
        };
        let backend = Rc::clone(device.backend());
        let transfers: Box<dyn AsyncPixelTransferManager> = match config.transfer_mode {
            TransferMode::Idle => Box::new(IdleTransferManager::new(config.idle_transfer_budget)),
            TransferMode::Threaded => Box::new(ThreadedTransferManager::new()),
        };
        Self {
            group: Rc::clone(group),
            framebuffers: ResourceManager::new(Rc::clone(device.framebuffer_pool()), config.bind_generates_resource),
            queries: QueryManager::new(Rc::clone(&backend), config.features),
            state: ContextState::new(config.max_texture_units),
            shm: SharedMemoryRegistry::new(),
            errors: ErrorState::default(),
            transfers,
            token: 0,
            context_lost: false,
            device,
            backend,
            config,
        }
    }

    pub fn group(&self) -> &SharedGroup {
        &self.group
    }

    pub fn features(&self) -> FeatureSet {
        self.config.features
    }

    pub fn shared_memory(&mut self) -> &mut SharedMemoryRegistry {
        &mut self.shm
    }

    /// Last value passed to `SetToken`.
    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn is_context_lost(&self) -> bool {
        self.context_lost
    }

    /// Drain one pending GL error, like `glGetError`.
    pub fn get_error(&mut self) -> u32 {
        self.errors.take()
    }

    pub fn query(&self, id: ClientId) -> Option<QueryStatus> {
        self.queries.query(id)
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.transfers.stats()
    }

    /// Advance background work. Call when the command buffer is idle.
    pub fn perform_idle_work(&mut self) {
        self.transfers.process_more_pending_transfers();
    }

    pub fn has_more_idle_work(&self) -> bool {
        self.transfers.needs_process_more_pending_transfers()
    }

    /// Resolve finished queries in submission order. Returns `true` once nothing is pending.
    pub fn process_pending_queries(&mut self, blocking: bool) -> bool {
        self.queries.process_pending_queries(blocking, self.transfers.as_mut())
    }

    pub fn has_pending_queries(&self) -> bool {
        self.queries.has_pending_queries()
    }

    /// Execute every packet in `words`, stopping at the first command-level failure.
    pub fn execute(&mut self, words: &[u32]) -> ExecuteResult {
        let mut result = ExecuteResult::default();
        if self.check_context_lost() {
            result.status = CommandStatus::LostContext;
            return result;
        }

        let mut offset = 0;
        while offset < words.len() {
            let packet = match read_packet(words, offset) {
                Ok(packet) => packet,
                Err(err) => {
                    warn!(%err, "malformed command stream");
                    result.status = match err {
                        CmdStreamError::ZeroSize { .. } => CommandStatus::InvalidArguments,
                        CmdStreamError::Truncated { .. } => CommandStatus::OutOfBounds,
                    };
                    return result;
                }
            };

            if let Err(err) = self.execute_packet(&packet) {
                match err {
                    ExecError::LostContext => self.lose_context(),
                    _ => warn!(opcode = packet.header.opcode, offset, %err, "command rejected"),
                }
                result.status = err.status();
                return result;
            }

            offset += packet.size_words();
            result.commands_processed += 1;
            result.words_processed = offset;

            if self.check_context_lost() {
                result.status = CommandStatus::LostContext;
                return result;
            }
        }
        result
    }

    fn execute_packet(&mut self, packet: &CmdPacket<'_>) -> CmdResult {
        let opcode = packet.opcode.ok_or(ExecError::UnknownCommand(packet.header.opcode))?;
        if let Some(capability) = opcode.capability() {
            if !self.config.features.supports(capability) {
                return Err(ExecError::UnknownCommand(packet.header.opcode));
            }
        }
        let args = packet.args;
        match opcode.layout() {
            ArgLayout::Fixed(n) if args.len() != n as usize => return Err(ExecError::InvalidArguments),
            ArgLayout::Immediate { fixed } if args.len() < fixed as usize => return Err(ExecError::InvalidArguments),
            _ => {}
        }
        self.dispatch(opcode, args)
    }

    fn dispatch(&mut self, opcode: Opcode, args: &[u32]) -> CmdResult {
        match opcode {
            Opcode::Noop => Ok(()),
            Opcode::SetToken => {
                self.token = args[0];
                Ok(())
            }
            Opcode::GetError => self.exec_get_error(args[0], args[1]),

            Opcode::GenTexturesImmediate => self.exec_gen_textures(immediate_ids(args)?),
            Opcode::DeleteTexturesImmediate => self.exec_delete_textures(immediate_ids(args)?),
            Opcode::BindTexture => self.exec_bind_texture(args[0], args[1]),
            Opcode::ActiveTexture => self.exec_active_texture(args[0]),
            Opcode::TexImage2D => self.exec_tex_image_2d(args),
            Opcode::TexSubImage2D => self.exec_tex_sub_image_2d(args),
            Opcode::TexParameteri => self.exec_tex_parameteri(args[0], args[1], args[2]),

            Opcode::GenBuffersImmediate => self.exec_gen_buffers(immediate_ids(args)?),
            Opcode::DeleteBuffersImmediate => self.exec_delete_buffers(immediate_ids(args)?),
            Opcode::BindBuffer => self.exec_bind_buffer(args[0], args[1]),
            Opcode::BufferData => self.exec_buffer_data(args[0], args[1], args[2], args[3], args[4]),
            Opcode::BufferSubData => self.exec_buffer_sub_data(args[0], args[1], args[2], args[3], args[4]),

            Opcode::GenFramebuffersImmediate => self.exec_gen_framebuffers(immediate_ids(args)?),
            Opcode::DeleteFramebuffersImmediate => self.exec_delete_framebuffers(immediate_ids(args)?),
            Opcode::BindFramebuffer => self.exec_bind_framebuffer(args[0], args[1]),
            Opcode::FramebufferTexture2D => {
                self.exec_framebuffer_texture_2d(args[0], args[1], args[2], args[3], args[4])
            }
            Opcode::FramebufferRenderbuffer => {
                self.exec_framebuffer_renderbuffer(args[0], args[1], args[2], args[3])
            }
            Opcode::CheckFramebufferStatus => self.exec_check_framebuffer_status(args[0], args[1], args[2]),
            Opcode::GenRenderbuffersImmediate => self.exec_gen_renderbuffers(immediate_ids(args)?),
            Opcode::DeleteRenderbuffersImmediate => self.exec_delete_renderbuffers(immediate_ids(args)?),
            Opcode::BindRenderbuffer => self.exec_bind_renderbuffer(args[0], args[1]),
            Opcode::RenderbufferStorage => self.exec_renderbuffer_storage(args[0], args[1], args[2], args[3]),

            Opcode::CreateShader => self.exec_create_shader(args[0], args[1]),
            Opcode::DeleteShader => self.exec_delete_shader(args[0]),
            Opcode::CreateProgram => self.exec_create_program(args[0]),
            Opcode::DeleteProgram => self.exec_delete_program(args[0]),
            Opcode::AttachShader => self.exec_attach_shader(args[0], args[1]),
            Opcode::LinkProgram => self.exec_link_program(args[0]),
            Opcode::UseProgram => self.exec_use_program(args[0]),

            Opcode::ClearColor => {
                self.exec_clear_color([args[0], args[1], args[2], args[3]].map(f32::from_bits));
                Ok(())
            }
            Opcode::Clear => self.exec_clear(args[0]),
            Opcode::DrawArrays => self.exec_draw_arrays(args[0], args[1], args[2]),
            Opcode::ReadPixels => self.exec_read_pixels(args),

            Opcode::GenQueriesImmediate => self.exec_gen_queries(immediate_ids(args)?),
            Opcode::DeleteQueriesImmediate => {
                self.queries.delete_queries(immediate_ids(args)?);
                Ok(())
            }
            Opcode::BeginQuery => self.exec_begin_query(args[0], args[1], args[2], args[3]),
            Opcode::EndQuery => self.exec_end_query(args[0], args[1]),

            Opcode::ProduceTextureImmediate => self.exec_produce_texture(args[0], sharing::mailbox_payload(args)?),
            Opcode::ConsumeTextureImmediate => self.exec_consume_texture(args[0], sharing::mailbox_payload(args)?),
            Opcode::GenSyncPoint => self.exec_gen_sync_point(args[0], args[1]),
            Opcode::WaitSyncPoint => self.exec_wait_sync_point(args[0]),

            Opcode::BindTexImage2D => self.exec_bind_tex_image_2d(args[0], args[1]),
            Opcode::ReleaseTexImage2D => self.exec_release_tex_image_2d(args[0], args[1]),

            Opcode::AsyncTexImage2D => self.exec_async_tex_image_2d(args),
            Opcode::AsyncTexSubImage2D => self.exec_async_tex_sub_image_2d(args),
            Opcode::WaitAsyncTexImage2D => self.exec_wait_async_tex_image_2d(args[0]),
        }
    }

    fn exec_get_error(&mut self, shm_id: u32, shm_offset: u32) -> CmdResult {
        let out = self.resolve(shm_id, shm_offset, 4)?;
        out.write_u32(0, self.errors.take());
        Ok(())
    }

    fn resolve(&self, shm_id: u32, offset: u32, size: u32) -> Result<MemoryRange, ExecError> {
        Ok(self.shm.resolve(shm_id, offset, size)?)
    }

    /// Resolve the pixels of a `width x height` image in `format`/`ty`. The size is computed from
    /// the raw arguments only, so this runs before any GL validation of them.
    fn resolve_pixels(
        &self,
        shm_id: u32,
        offset: u32,
        (width, height): (u32, u32),
        format: u32,
        ty: u32,
    ) -> Result<MemoryRange, ExecError> {
        let size = bytes_per_pixel(format, ty)
            .ok()
            .and_then(|bpp| width.checked_mul(height)?.checked_mul(bpp))
            .ok_or(MemoryError::UnsizedRange(shm_id))?;
        self.resolve(shm_id, offset, size)
    }

    /// Record a GL error. The command still counts as executed.
    fn fail(&mut self, err: GlError, function: &'static str, msg: &str) -> CmdResult {
        self.errors.record(err, function, msg);
        Ok(())
    }

    fn backend_failed(&mut self, function: &'static str, err: BackendError) -> CmdResult {
        match err {
            BackendError::ContextLost => Err(ExecError::LostContext),
            BackendError::OutOfMemory { .. } => self.fail(GlError::OutOfMemory, function, &err.to_string()),
            err => {
                warn!(function, %err, "backend rejected command");
                self.fail(GlError::InvalidOperation, function, &err.to_string())
            }
        }
    }

    /// Map a failed id allocation. Reusing or reserving ids is a client bug, not a GL error.
    fn resource_failed(&mut self, function: &'static str, err: ResourceError) -> CmdResult {
        match err {
            ResourceError::Backend(err) => self.backend_failed(function, err),
            ResourceError::NotGenerated(_) => self.fail(GlError::InvalidOperation, function, &err.to_string()),
            ResourceError::ReservedId | ResourceError::IdInUse(_) => {
                debug!(function, %err, "rejected client ids");
                Err(ExecError::InvalidArguments)
            }
        }
    }

    fn check_context_lost(&mut self) -> bool {
        if !self.context_lost && self.backend.borrow().context_lost() {
            self.lose_context();
        }
        self.context_lost
    }

    fn lose_context(&mut self) {
        if self.context_lost {
            return;
        }
        warn!("context lost; rejecting further commands");
        self.context_lost = true;
        self.errors.record(GlError::ContextLost, "execute", "context lost");
        self.transfers.wait_all_async_tex_image_2d(&self.backend);
    }
}

impl Drop for GpuDecoder {
    fn drop(&mut self) {
        if !self.context_lost {
            self.transfers.wait_all_async_tex_image_2d(&self.backend);
        }
    }
}

/// Ids of a `Gen*Immediate`/`Delete*Immediate` packet: a count followed by that many ids.
fn immediate_ids(args: &[u32]) -> Result<&[u32], ExecError> {
    let count = args[0] as usize;
    args[1..].get(..count).ok_or(ExecError::PayloadTruncated)
}
