//! Graphics backend abstraction.
//!
//! The decoder and resource managers never talk to a native driver directly; every side effect
//! goes through [`Backend`]. Production embedders forward into a real GL/Vulkan layer. Tests and
//! headless runs use the deterministic [`SoftBackend`].

mod soft;

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

pub use soft::{SoftBackend, SoftBackendStats, GARBAGE_BYTE};

/// Backend-internal handle. Never exposed to clients.
pub type ServiceId = u32;

pub type SharedBackend = Rc<RefCell<dyn Backend>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Texture,
    Buffer,
    Framebuffer,
    Renderbuffer,
    Query,
    Shader,
    Program,
}

/// Storage request for [`Backend::allocate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocParams {
    /// One 2D image: a texture level of a face, or a renderbuffer.
    Image {
        face: u32,
        level: u32,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
    },
    /// Linear storage for buffers.
    Linear { size: u32 },
}

impl AllocParams {
    pub fn byte_size(&self) -> usize {
        match *self {
            Self::Image {
                width,
                height,
                bytes_per_pixel,
                ..
            } => width as usize * height as usize * bytes_per_pixel as usize,
            Self::Linear { size } => size as usize,
        }
    }
}

/// Sub-region of previously allocated storage. Image data is tightly packed rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Image {
        face: u32,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    Linear { offset: u32, len: u32 },
}

/// What a framebuffer attachment point refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachTarget {
    pub kind: ResourceKind,
    pub id: ServiceId,
    pub face: u32,
    pub level: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceToken(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceWait {
    Poll,
    Block,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Signaled,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("out of memory ({requested} bytes requested, {available} available)")]
    OutOfMemory { requested: usize, available: usize },
    #[error("invalid {kind:?} resource {id}")]
    InvalidResource { kind: ResourceKind, id: ServiceId },
    #[error("region out of bounds")]
    OutOfBounds,
    #[error("context lost")]
    ContextLost,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

pub trait Backend {
    fn create(&mut self, kind: ResourceKind) -> Result<ServiceId, BackendError>;
    fn delete(&mut self, kind: ResourceKind, id: ServiceId) -> Result<(), BackendError>;

    /// Bind `id` (or unbind with `None`) at `target`. For queries, binding starts counting and
    /// unbinding stops it.
    fn bind(&mut self, kind: ResourceKind, target: u32, id: Option<ServiceId>) -> Result<(), BackendError>;

    /// Replace the storage described by `params`.
    ///
    /// On failure the previous storage must be left untouched.
    fn allocate(&mut self, kind: ResourceKind, id: ServiceId, params: &AllocParams) -> Result<(), BackendError>;

    fn write(&mut self, kind: ResourceKind, id: ServiceId, region: &Region, data: &[u8]) -> Result<(), BackendError>;
    fn read(&self, kind: ResourceKind, id: ServiceId, region: &Region) -> Result<Vec<u8>, BackendError>;

    fn attach(
        &mut self,
        framebuffer: ServiceId,
        attachment: u32,
        target: Option<AttachTarget>,
    ) -> Result<(), BackendError>;
    fn draw(&mut self, mode: u32, first: u32, count: u32) -> Result<(), BackendError>;

    fn fence(&mut self) -> FenceToken;
    fn wait_fence(&mut self, token: FenceToken, wait: FenceWait) -> FenceStatus;

    fn context_lost(&self) -> bool;
}
