//! `gpucmd-service` executes `gpucmd-protocol` command streams against a [`Backend`].
//!
//! Currently this crate provides:
//! - A validating command decoder with a sticky GL error model (see [`GpuDecoder`]) and a ring
//!   buffer front end for it (see [`CommandBufferService`]).
//! - Reference-counted resource pools and per-group client name tables shared by every object
//!   kind (see [`resource`] and [`resource_manager`]).
//! - Texture sharing across context groups through mailboxes, either immediately or ordered by
//!   sync points (see [`mailbox`]).
//! - Asynchronous pixel uploads and fence-backed queries.
//! - A deterministic in-memory backend for headless use and tests (see [`SoftBackend`]).

pub mod backend;
pub mod buffer;
pub mod command_buffer;
pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod id_allocator;
pub mod image_manager;
pub mod mailbox;
pub mod pixel_transfer;
pub mod program;
pub mod query_manager;
pub mod resource;
pub mod resource_manager;
pub mod shared_memory;
pub mod texture;

pub use backend::{Backend, BackendError, SharedBackend, SoftBackend};
pub use command_buffer::{CommandBufferService, CommandBufferState, RingError};
pub use config::{ConfigError, FeatureSet, ServiceConfig, TransferMode};
pub use decoder::{ExecuteResult, GpuDecoder};
pub use device::{ContextGroup, GpuDevice, GroupError, SharedGroup};
pub use error::{ExecError, GlError};
pub use mailbox::{generate_mailbox, MailboxSyncHub};
pub use shared_memory::{SharedMemory, SharedMemoryRegistry};
