//! Cross-context texture sharing by opaque name.
//!
//! A producer binds a [`Mailbox`] to one of its textures; consumers resolve the name back to a
//! texture. Managers never keep a texture alive: they remember pool keys and are told through
//! [`MailboxManager::texture_deleted`] when a texture they know about is destroyed.
//!
//! [`ImmediateMailboxManager`] hands out the producer's own texture and only works inside one
//! backend. [`SyncMailboxManager`] materializes a local proxy per consumer and moves texture
//! definitions between sides only at sync points.

mod immediate;
mod sync;

use std::sync::atomic::{AtomicU32, Ordering};

use gpucmd_protocol::mailbox::MAILBOX_SIZE_BYTES;
use gpucmd_protocol::Mailbox;
use rand::Rng;
use thiserror::Error;

use crate::backend::BackendError;
use crate::resource::{ResourceKey, ResourceRef};
use crate::texture::Texture;

pub use immediate::ImmediateMailboxManager;
pub use sync::{ConflictKind, MailboxSyncHub, SyncConflict, SyncMailboxManager};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox name is all zeroes")]
    ZeroName,
    #[error("texture belongs to a different backend")]
    ForeignTexture,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A texture handed out by [`MailboxManager::consume_texture`].
#[derive(Debug)]
pub struct Consumed {
    pub texture: ResourceRef<Texture>,
    /// Set when the manager started tracking this texture during the call. The caller must
    /// arrange for [`MailboxManager::texture_deleted`] to run once it is destroyed.
    pub newly_tracked: bool,
}

pub trait MailboxManager {
    /// Bind `mailbox` to `texture`, replacing any previous binding.
    ///
    /// Returns `true` when the texture was not tracked before; see [`Consumed::newly_tracked`].
    fn produce_texture(&mut self, mailbox: Mailbox, texture: &ResourceRef<Texture>) -> Result<bool, MailboxError>;

    /// Resolve `mailbox`. Repeatable; never consumes the name.
    fn consume_texture(&mut self, mailbox: &Mailbox) -> Result<Option<Consumed>, MailboxError>;

    fn push_texture_updates(&mut self, sync_point: u32);

    fn pull_texture_updates(&mut self, sync_point: u32);

    /// Forget every name bound to the destroyed texture.
    fn texture_deleted(&mut self, texture: ResourceKey);

    fn uses_sync(&self) -> bool;
}

/// Fresh random mailbox name. Never the all-zero name.
pub fn generate_mailbox() -> Mailbox {
    let mut rng = rand::thread_rng();
    loop {
        let mut bytes = [0u8; MAILBOX_SIZE_BYTES];
        rng.fill(&mut bytes);
        let mailbox = Mailbox::from_bytes(bytes);
        if !mailbox.is_zero() {
            return mailbox;
        }
    }
}

/// Issues sync points. Shared by every context that may wait on another's.
#[derive(Debug, Default)]
pub struct SyncPointManager {
    last: AtomicU32,
}

impl SyncPointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate_sync_point(&self) -> u32 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether `sync_point` has been issued. Sync point 0 is never issued.
    pub fn is_generated(&self, sync_point: u32) -> bool {
        sync_point != 0 && sync_point <= self.last.load(Ordering::SeqCst)
    }

    pub fn last_generated(&self) -> u32 {
        self.last.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_are_distinct_and_nonzero() {
        let a = generate_mailbox();
        let b = generate_mailbox();
        assert!(!a.is_zero());
        assert_ne!(a, b);
    }

    #[test]
    fn sync_points_increase_from_one() {
        let sp = SyncPointManager::new();
        assert!(!sp.is_generated(0));
        assert!(!sp.is_generated(1));
        assert_eq!(sp.generate_sync_point(), 1);
        assert_eq!(sp.generate_sync_point(), 2);
        assert!(sp.is_generated(2));
        assert!(!sp.is_generated(3));
    }
}
