//! Asynchronous texture uploads.
//!
//! A submitted upload copies pixels out of client shared memory without blocking the decoder.
//! Results are only applied to the texture by [`AsyncPixelTransferManager::bind_completed_async_transfers`],
//! which the decoder calls on its own thread before anything samples or reads textures.
//!
//! An upload holds a weak reference to its texture and a strong reference to the client memory.
//! If the texture dies (or the level is redefined to a different size) before the result is bound,
//! the result is discarded.

mod idle;
mod threaded;

use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::SharedBackend;
use crate::resource::{ResourceKey, ResourceRef, WeakResource};
use crate::shared_memory::MemoryRange;
use crate::texture::{Rect, Texture};

pub use idle::IdleTransferManager;
pub use threaded::ThreadedTransferManager;

/// One-shot completion callback. May run on any thread.
pub type CompletionObserver = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub texture_uploads: u64,
    pub total_texture_upload_time: Duration,
}

/// Handle tying uploads to one texture without keeping it alive.
#[derive(Clone, Debug)]
pub struct TransferDelegate {
    texture: WeakResource<Texture>,
}

impl TransferDelegate {
    pub fn texture_key(&self) -> ResourceKey {
        self.texture.key()
    }
}

/// Pixels for one rectangle of one texture level.
#[derive(Clone, Debug)]
pub struct PixelUpload {
    pub face: u32,
    pub level: u32,
    pub rect: Rect,
    /// Level size at submission; the result is dropped if the level no longer has this size.
    pub level_size: (u32, u32),
    pub data: MemoryRange,
}

pub trait AsyncPixelTransferManager {
    fn create_transfer_delegate(&mut self, texture: &ResourceRef<Texture>) -> TransferDelegate {
        TransferDelegate {
            texture: texture.downgrade(),
        }
    }

    /// Queue an upload. Never blocks.
    fn submit(&mut self, delegate: &TransferDelegate, upload: PixelUpload);

    /// Whether the texture has uploads that are queued or completed but not yet bound.
    fn transfer_in_progress(&self, texture: ResourceKey) -> bool;

    /// Block until every upload submitted for `texture` has completed. Results still need binding.
    fn wait_for_transfer_completion(&mut self, texture: ResourceKey);

    /// Apply completed uploads to their textures. Returns how many were applied.
    fn bind_completed_async_transfers(&mut self, backend: &SharedBackend) -> usize;

    /// Run `observer` once every upload submitted before this call has completed.
    fn async_notify_completion(&mut self, observer: CompletionObserver);

    fn process_more_pending_transfers(&mut self);

    fn needs_process_more_pending_transfers(&self) -> bool;

    /// Complete and bind everything. Used on shutdown and context loss.
    fn wait_all_async_tex_image_2d(&mut self, backend: &SharedBackend);

    fn stats(&self) -> TransferStats;
}

/// Main-thread bookkeeping for a submitted upload.
#[derive(Debug)]
struct UploadMeta {
    texture: WeakResource<Texture>,
    face: u32,
    level: u32,
    rect: Rect,
    level_size: (u32, u32),
}

impl UploadMeta {
    fn new(delegate: &TransferDelegate, upload: &PixelUpload) -> Self {
        Self {
            texture: delegate.texture.clone(),
            face: upload.face,
            level: upload.level,
            rect: upload.rect,
            level_size: upload.level_size,
        }
    }
}

/// Write a completed upload into its texture, unless the texture or level went away.
fn bind_upload(backend: &SharedBackend, meta: &UploadMeta, data: &[u8]) -> bool {
    let Some(texture) = meta.texture.upgrade() else {
        debug!(level = meta.level, "discarding upload for destroyed texture");
        return false;
    };
    let result = {
        let mut backend = backend.borrow_mut();
        texture.with_mut(|t| {
            let current = t.level(meta.face, meta.level).map(|l| (l.width, l.height));
            if current != Some(meta.level_size) {
                return Ok(false);
            }
            t.write_region(&mut *backend, meta.face, meta.level, meta.rect, data)
                .map(|()| true)
        })
    };
    match result {
        Ok(true) => true,
        Ok(false) => {
            debug!(level = meta.level, "discarding upload for redefined level");
            false
        }
        Err(err) => {
            warn!(%err, level = meta.level, "failed to bind completed upload");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use gpucmd_protocol::gl;

    use crate::backend::{Backend, Region, ResourceKind, SoftBackend};
    use crate::resource::{ResourcePool, SharedPool};
    use crate::shared_memory::{SharedMemory, SharedMemoryRegistry};
    use crate::texture::{LevelSpec, TextureTarget};

    pub(super) struct Fixture {
        pub soft: Rc<RefCell<SoftBackend>>,
        pub backend: SharedBackend,
        pub pool: SharedPool<Texture>,
        pub shm: SharedMemoryRegistry,
        pub shm_id: u32,
    }

    impl Fixture {
        pub fn new() -> Self {
            let soft = Rc::new(RefCell::new(SoftBackend::new()));
            let backend: SharedBackend = soft.clone();
            let mut shm = SharedMemoryRegistry::new();
            let shm_id = shm.register(SharedMemory::from_bytes((0..64).collect()));
            Self {
                pool: ResourcePool::new_shared(backend.clone()),
                soft,
                backend,
                shm,
                shm_id,
            }
        }

        /// A 2x2 RGBA texture whose level 0 is defined but uncleared.
        pub fn texture(&self) -> ResourceRef<Texture> {
            let t = ResourceRef::create(&self.pool, Texture::new).unwrap();
            let mut backend = self.soft.borrow_mut();
            t.with_mut(|t| {
                t.set_target(TextureTarget::Texture2D).unwrap();
                t.define_level(
                    &mut *backend,
                    0,
                    0,
                    LevelSpec {
                        width: 2,
                        height: 2,
                        internal_format: gl::RGBA,
                        format: gl::RGBA,
                        ty: gl::UNSIGNED_BYTE,
                    },
                    None,
                )
            })
            .unwrap();
            t
        }

        pub fn upload(&self, offset: u32) -> PixelUpload {
            PixelUpload {
                face: 0,
                level: 0,
                rect: Rect::full(2, 2),
                level_size: (2, 2),
                data: self.shm.resolve(self.shm_id, offset, 16).unwrap(),
            }
        }

        pub fn pixels(&self, texture: &ResourceRef<Texture>) -> Vec<u8> {
            let region = Region::Image {
                face: 0,
                level: 0,
                x: 0,
                y: 0,
                width: 2,
                height: 2,
            };
            self.soft
                .borrow()
                .read(ResourceKind::Texture, texture.service_id(), &region)
                .unwrap()
        }
    }

    #[test]
    fn bind_discards_results_for_redefined_levels() {
        let f = Fixture::new();
        let texture = f.texture();
        let delegate = TransferDelegate {
            texture: texture.downgrade(),
        };
        let mut upload = f.upload(0);
        upload.level_size = (4, 4);
        let meta = UploadMeta::new(&delegate, &upload);
        assert!(!bind_upload(&f.backend, &meta, &upload.data.read_all()));
        assert!(!texture.with(|t| t.level(0, 0).unwrap().cleared));

        let upload = f.upload(0);
        let meta = UploadMeta::new(&delegate, &upload);
        assert!(bind_upload(&f.backend, &meta, &upload.data.read_all()));
        assert_eq!(f.pixels(&texture), (0..16).collect::<Vec<u8>>());
        assert!(texture.with(|t| t.level(0, 0).unwrap().cleared));

        drop(texture);
        assert!(!bind_upload(&f.backend, &meta, &upload.data.read_all()));
    }
}
