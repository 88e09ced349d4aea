//! Per-backend device and per-share-group state.
//!
//! A [`GpuDevice`] owns one backend, the resource pools living on it, and the device's mailbox
//! manager. A [`ContextGroup`] is one client-id namespace on a device; decoders that share
//! resources share a group.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use gpucmd_protocol::Mailbox;
use thiserror::Error;
use tracing::warn;

use crate::backend::{BackendError, SharedBackend};
use crate::buffer::Buffer;
use crate::config::{ConfigError, ServiceConfig};
use crate::framebuffer::{Framebuffer, Renderbuffer};
use crate::image_manager::ImageManager;
use crate::mailbox::{
    ImmediateMailboxManager, MailboxError, MailboxManager, MailboxSyncHub, SyncMailboxManager, SyncPointManager,
};
use crate::program::{Program, ProgramManager, Shader};
use crate::resource::{ResourcePool, ResourceRef, SharedPool};
use crate::resource_manager::ResourceManager;
use crate::texture::{Texture, TextureManager};

pub type SharedMailboxManager = Rc<RefCell<dyn MailboxManager>>;

pub struct GpuDevice {
    backend: SharedBackend,
    textures: SharedPool<Texture>,
    buffers: SharedPool<Buffer>,
    renderbuffers: SharedPool<Renderbuffer>,
    framebuffers: SharedPool<Framebuffer>,
    shaders: SharedPool<Shader>,
    programs: SharedPool<Program>,
    mailboxes: SharedMailboxManager,
    sync_points: Arc<SyncPointManager>,
}

impl GpuDevice {
    /// A device whose mailboxes hand out textures directly. Only context groups on this device
    /// can consume them.
    pub fn new(backend: SharedBackend) -> Rc<Self> {
        let textures = ResourcePool::new_shared(Rc::clone(&backend));
        let mailboxes: SharedMailboxManager = Rc::new(RefCell::new(ImmediateMailboxManager::new(Rc::clone(&textures))));
        Rc::new(Self::with_parts(backend, textures, mailboxes, Arc::new(SyncPointManager::new())))
    }

    /// A device exchanging mailbox textures with other devices through `hub`.
    pub fn with_mailbox_sync(backend: SharedBackend, hub: &MailboxSyncHub) -> Rc<Self> {
        let textures = ResourcePool::new_shared(Rc::clone(&backend));
        let mailboxes: SharedMailboxManager =
            Rc::new(RefCell::new(SyncMailboxManager::new(hub, Rc::clone(&textures))));
        Rc::new(Self::with_parts(backend, textures, mailboxes, Arc::clone(hub.sync_points())))
    }

    fn with_parts(
        backend: SharedBackend,
        textures: SharedPool<Texture>,
        mailboxes: SharedMailboxManager,
        sync_points: Arc<SyncPointManager>,
    ) -> Self {
        Self {
            buffers: ResourcePool::new_shared(Rc::clone(&backend)),
            renderbuffers: ResourcePool::new_shared(Rc::clone(&backend)),
            framebuffers: ResourcePool::new_shared(Rc::clone(&backend)),
            shaders: ResourcePool::new_shared(Rc::clone(&backend)),
            programs: ResourcePool::new_shared(Rc::clone(&backend)),
            backend,
            textures,
            mailboxes,
            sync_points,
        }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn texture_pool(&self) -> &SharedPool<Texture> {
        &self.textures
    }

    pub fn framebuffer_pool(&self) -> &SharedPool<Framebuffer> {
        &self.framebuffers
    }

    pub fn sync_points(&self) -> &Arc<SyncPointManager> {
        &self.sync_points
    }

    pub fn uses_mailbox_sync(&self) -> bool {
        self.mailboxes.borrow().uses_sync()
    }

    pub fn produce_texture(&self, mailbox: Mailbox, texture: &ResourceRef<Texture>) -> Result<(), MailboxError> {
        let newly_tracked = self.mailboxes.borrow_mut().produce_texture(mailbox, texture)?;
        if newly_tracked {
            self.track(texture);
        }
        Ok(())
    }

    pub fn consume_texture(&self, mailbox: &Mailbox) -> Result<Option<ResourceRef<Texture>>, MailboxError> {
        let consumed = self.mailboxes.borrow_mut().consume_texture(mailbox)?;
        Ok(consumed.map(|c| {
            if c.newly_tracked {
                self.track(&c.texture);
            }
            c.texture
        }))
    }

    pub fn push_texture_updates(&self, sync_point: u32) {
        self.mailboxes.borrow_mut().push_texture_updates(sync_point);
    }

    pub fn pull_texture_updates(&self, sync_point: u32) {
        self.mailboxes.borrow_mut().pull_texture_updates(sync_point);
    }

    /// Tell the mailbox manager when `texture` is destroyed.
    fn track(&self, texture: &ResourceRef<Texture>) {
        let manager = Rc::downgrade(&self.mailboxes);
        texture.observe(Rc::new(move |key| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            match manager.try_borrow_mut() {
                Ok(mut manager) => manager.texture_deleted(key),
                Err(_) => warn!(?key, "mailbox manager busy while a tracked texture was destroyed"),
            };
        }));
    }
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create default resources: {0}")]
    Backend(#[from] BackendError),
}

pub type SharedGroup = Rc<RefCell<ContextGroup>>;

/// Client-id namespaces shared by every decoder in the group.
pub struct ContextGroup {
    pub(crate) config: ServiceConfig,
    pub(crate) device: Rc<GpuDevice>,
    pub(crate) textures: TextureManager,
    pub(crate) buffers: ResourceManager<Buffer>,
    pub(crate) renderbuffers: ResourceManager<Renderbuffer>,
    pub(crate) programs: ProgramManager,
    pub(crate) images: ImageManager,
}

impl ContextGroup {
    pub fn new(device: &Rc<GpuDevice>, config: ServiceConfig) -> Result<SharedGroup, GroupError> {
        config.validate()?;
        let bind_generates = config.bind_generates_resource;
        let group = Self {
            textures: TextureManager::new(Rc::clone(&device.textures), &config)?,
            buffers: ResourceManager::new(Rc::clone(&device.buffers), bind_generates),
            renderbuffers: ResourceManager::new(Rc::clone(&device.renderbuffers), bind_generates),
            programs: ProgramManager::new(Rc::clone(&device.shaders), Rc::clone(&device.programs)),
            images: ImageManager::new(),
            device: Rc::clone(device),
            config,
        };
        Ok(Rc::new(RefCell::new(group)))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn device(&self) -> &Rc<GpuDevice> {
        &self.device
    }

    pub fn textures(&self) -> &TextureManager {
        &self.textures
    }

    pub fn buffers(&self) -> &ResourceManager<Buffer> {
        &self.buffers
    }

    pub fn images_mut(&mut self) -> &mut ImageManager {
        &mut self.images
    }
}
