use std::collections::{HashMap, HashSet};

use gpucmd_protocol::Mailbox;

use super::{Consumed, MailboxError, MailboxManager};
use crate::resource::{self, ResourceKey, ResourceRef, SharedPool};
use crate::texture::Texture;

/// Shares texture objects directly between context groups on one backend.
pub struct ImmediateMailboxManager {
    pool: SharedPool<Texture>,
    mailboxes: HashMap<Mailbox, ResourceKey>,
    tracked: HashSet<ResourceKey>,
}

impl ImmediateMailboxManager {
    pub fn new(pool: SharedPool<Texture>) -> Self {
        Self {
            pool,
            mailboxes: HashMap::new(),
            tracked: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }
}

impl MailboxManager for ImmediateMailboxManager {
    fn produce_texture(&mut self, mailbox: Mailbox, texture: &ResourceRef<Texture>) -> Result<bool, MailboxError> {
        if mailbox.is_zero() {
            return Err(MailboxError::ZeroName);
        }
        if !texture.belongs_to(&self.pool) {
            return Err(MailboxError::ForeignTexture);
        }
        self.mailboxes.insert(mailbox, texture.key());
        Ok(self.tracked.insert(texture.key()))
    }

    fn consume_texture(&mut self, mailbox: &Mailbox) -> Result<Option<Consumed>, MailboxError> {
        let Some(&key) = self.mailboxes.get(mailbox) else {
            return Ok(None);
        };
        Ok(resource::upgrade(&self.pool, key).map(|texture| Consumed {
            texture,
            newly_tracked: false,
        }))
    }

    fn push_texture_updates(&mut self, _sync_point: u32) {}

    fn pull_texture_updates(&mut self, _sync_point: u32) {}

    fn texture_deleted(&mut self, texture: ResourceKey) {
        if self.tracked.remove(&texture) {
            self.mailboxes.retain(|_, key| *key != texture);
        }
    }

    fn uses_sync(&self) -> bool {
        false
    }
}
