//! Mailboxes across backends.
//!
//! Every texture reachable through a mailbox belongs to a *group*: the producer's texture plus
//! one proxy per consuming manager. The hub keeps each group's definition history ordered by
//! sync point. A push appends the pusher's current definition for every member it changed; a
//! pull applies the newest foreign definition at or before the pulled sync point. Pulls only
//! touch metadata; proxies rebuild backend storage the next time they are used.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gpucmd_protocol::Mailbox;
use tracing::{debug, warn};

use super::{Consumed, MailboxError, MailboxManager, SyncPointManager};
use crate::resource::{self, ResourceKey, ResourceRef, SharedPool};
use crate::texture::{Texture, TextureDefinition};

type ManagerId = u64;
type GroupId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    /// Local edits were pushed on top of a foreign snapshot this side never pulled.
    PushOverUnpulled,
    /// A pull replaced local edits that were never pushed.
    PullOverUnpushed,
}

/// Two sides edited one texture group between sync points. The later push in sync point order
/// still wins; the conflict is only recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncConflict {
    pub kind: ConflictKind,
    pub group: u64,
    pub sync_point: u32,
}

#[derive(Debug)]
struct Snapshot {
    sync_point: u32,
    origin: ManagerId,
    definition: TextureDefinition,
}

#[derive(Debug)]
struct Group {
    history: VecDeque<Snapshot>,
    members: usize,
}

impl Group {
    fn latest_at(&self, sync_point: u32) -> Option<&Snapshot> {
        self.history.iter().rev().find(|s| s.sync_point <= sync_point)
    }
}

#[derive(Debug)]
struct MailboxEntry {
    group: GroupId,
    producer: (ManagerId, ResourceKey),
}

#[derive(Debug, Default)]
struct HubState {
    groups: HashMap<GroupId, Group>,
    mailboxes: HashMap<Mailbox, MailboxEntry>,
    conflicts: Vec<SyncConflict>,
    next_group: GroupId,
    next_manager: ManagerId,
}

/// Process-wide state shared by every [`SyncMailboxManager`]. Cheap to clone.
#[derive(Clone, Debug)]
pub struct MailboxSyncHub {
    state: Arc<Mutex<HubState>>,
    sync_points: Arc<SyncPointManager>,
    max_history: usize,
}

impl MailboxSyncHub {
    pub fn new(max_snapshot_history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            sync_points: Arc::new(SyncPointManager::new()),
            max_history: max_snapshot_history.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sync_points(&self) -> &Arc<SyncPointManager> {
        &self.sync_points
    }

    pub fn conflicts(&self) -> Vec<SyncConflict> {
        self.lock().conflicts.clone()
    }

    pub fn group_count(&self) -> usize {
        self.lock().groups.len()
    }

    pub fn mailbox_count(&self) -> usize {
        self.lock().mailboxes.len()
    }
}

#[derive(Debug)]
struct Member {
    group: GroupId,
    /// Texture version when this side last pushed or pulled it.
    synced_version: u64,
    /// Sync point of the snapshot this side's copy is based on.
    base_sync_point: u32,
}

/// One backend's view of the synchronized mailbox namespace.
pub struct SyncMailboxManager {
    hub: MailboxSyncHub,
    id: ManagerId,
    pool: SharedPool<Texture>,
    members: HashMap<ResourceKey, Member>,
    by_group: HashMap<GroupId, ResourceKey>,
    last_pulled: u32,
}

impl SyncMailboxManager {
    pub fn new(hub: &MailboxSyncHub, pool: SharedPool<Texture>) -> Self {
        let id = {
            let mut state = hub.lock();
            state.next_manager += 1;
            state.next_manager
        };
        Self {
            hub: hub.clone(),
            id,
            pool,
            members: HashMap::new(),
            by_group: HashMap::new(),
            last_pulled: 0,
        }
    }

    fn release_member(&self, state: &mut HubState, key: ResourceKey, member: &Member) {
        let id = self.id;
        state.mailboxes.retain(|_, e| e.producer != (id, key));
        let emptied = match state.groups.get_mut(&member.group) {
            Some(group) => {
                group.members = group.members.saturating_sub(1);
                group.members == 0
            }
            None => false,
        };
        if emptied {
            state.groups.remove(&member.group);
            state.mailboxes.retain(|_, e| e.group != member.group);
            debug!(group = member.group, "texture group released");
        }
    }
}

impl MailboxManager for SyncMailboxManager {
    fn produce_texture(&mut self, mailbox: Mailbox, texture: &ResourceRef<Texture>) -> Result<bool, MailboxError> {
        if mailbox.is_zero() {
            return Err(MailboxError::ZeroName);
        }
        if !texture.belongs_to(&self.pool) {
            return Err(MailboxError::ForeignTexture);
        }
        let key = texture.key();
        let mut state = self.hub.lock();
        let (group, newly_tracked) = match self.members.get(&key) {
            Some(member) => (member.group, false),
            None => {
                let (version, definition) = texture.with(|t| (t.version(), t.definition()));
                let group = state.next_group;
                state.next_group += 1;
                state.groups.insert(
                    group,
                    Group {
                        history: VecDeque::from([Snapshot {
                            sync_point: 0,
                            origin: self.id,
                            definition,
                        }]),
                        members: 1,
                    },
                );
                self.members.insert(
                    key,
                    Member {
                        group,
                        synced_version: version,
                        base_sync_point: 0,
                    },
                );
                self.by_group.insert(group, key);
                (group, true)
            }
        };
        state.mailboxes.insert(
            mailbox,
            MailboxEntry {
                group,
                producer: (self.id, key),
            },
        );
        Ok(newly_tracked)
    }

    fn consume_texture(&mut self, mailbox: &Mailbox) -> Result<Option<Consumed>, MailboxError> {
        let mut state = self.hub.lock();
        let Some(group_id) = state.mailboxes.get(mailbox).map(|e| e.group) else {
            return Ok(None);
        };
        if let Some(&key) = self.by_group.get(&group_id) {
            return Ok(resource::upgrade(&self.pool, key).map(|texture| Consumed {
                texture,
                newly_tracked: false,
            }));
        }
        let Some(group) = state.groups.get_mut(&group_id) else {
            return Ok(None);
        };
        let (base_sync_point, definition) = {
            let group: &Group = group;
            // Consumers that have not pulled far enough yet start from the oldest retained state.
            let Some(snapshot) = group.latest_at(self.last_pulled).or_else(|| group.history.front()) else {
                return Ok(None);
            };
            (snapshot.sync_point, snapshot.definition.clone())
        };

        let texture = ResourceRef::create(&self.pool, Texture::new)?;
        let synced_version = texture.with_mut(|t| {
            t.apply_definition(definition);
            t.version()
        });
        group.members += 1;
        self.members.insert(
            texture.key(),
            Member {
                group: group_id,
                synced_version,
                base_sync_point,
            },
        );
        self.by_group.insert(group_id, texture.key());
        debug!(group = group_id, base_sync_point, "materialized mailbox proxy");
        Ok(Some(Consumed {
            texture,
            newly_tracked: true,
        }))
    }

    fn push_texture_updates(&mut self, sync_point: u32) {
        let mut state = self.hub.lock();
        let HubState { groups, conflicts, .. } = &mut *state;
        let pool = self.pool.borrow();
        for (&key, member) in &mut self.members {
            let Some((version, definition)) = pool.with(key, |t| (t.version(), t.definition())) else {
                continue;
            };
            if version == member.synced_version {
                continue;
            }
            let Some(group) = groups.get_mut(&member.group) else {
                continue;
            };
            let unpulled = group
                .history
                .iter()
                .any(|s| s.sync_point > member.base_sync_point && s.origin != self.id);
            if unpulled {
                warn!(group = member.group, sync_point, "pushing over an unpulled foreign update");
                conflicts.push(SyncConflict {
                    kind: ConflictKind::PushOverUnpulled,
                    group: member.group,
                    sync_point,
                });
            }
            let pos = group.history.partition_point(|s| s.sync_point <= sync_point);
            group.history.insert(
                pos,
                Snapshot {
                    sync_point,
                    origin: self.id,
                    definition,
                },
            );
            while group.history.len() > self.hub.max_history {
                group.history.pop_front();
            }
            member.synced_version = version;
            member.base_sync_point = sync_point;
        }
    }

    fn pull_texture_updates(&mut self, sync_point: u32) {
        self.last_pulled = self.last_pulled.max(sync_point);
        let mut state = self.hub.lock();
        let HubState { groups, conflicts, .. } = &mut *state;
        let pool = self.pool.borrow();
        for (&key, member) in &mut self.members {
            let Some(snapshot) = groups.get(&member.group).and_then(|g| g.latest_at(sync_point)) else {
                continue;
            };
            if snapshot.sync_point <= member.base_sync_point || snapshot.origin == self.id {
                continue;
            }
            let snapshot_sync_point = snapshot.sync_point;
            let definition = snapshot.definition.clone();
            let Some((edited, version)) = pool.with_mut(key, |t| {
                let edited = t.version() != member.synced_version;
                t.apply_definition(definition);
                (edited, t.version())
            }) else {
                continue;
            };
            if edited {
                warn!(group = member.group, sync_point, "pull discarded unpushed local edits");
                conflicts.push(SyncConflict {
                    kind: ConflictKind::PullOverUnpushed,
                    group: member.group,
                    sync_point,
                });
            }
            member.synced_version = version;
            member.base_sync_point = snapshot_sync_point;
        }
    }

    fn texture_deleted(&mut self, texture: ResourceKey) {
        let Some(member) = self.members.remove(&texture) else {
            return;
        };
        self.by_group.remove(&member.group);
        let mut state = self.hub.lock();
        self.release_member(&mut state, texture, &member);
    }

    fn uses_sync(&self) -> bool {
        true
    }
}

impl Drop for SyncMailboxManager {
    fn drop(&mut self) {
        let members = std::mem::take(&mut self.members);
        let mut state = self.hub.lock();
        for (key, member) in &members {
            self.release_member(&mut state, *key, member);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use gpucmd_protocol::gl;
    use pretty_assertions::assert_eq;

    use crate::backend::{SharedBackend, SoftBackend};
    use crate::mailbox::generate_mailbox;
    use crate::resource::ResourcePool;
    use crate::texture::{LevelSpec, TextureTarget};

    struct Side {
        soft: Rc<RefCell<SoftBackend>>,
        pool: SharedPool<Texture>,
        manager: SyncMailboxManager,
    }

    impl Side {
        fn new(hub: &MailboxSyncHub) -> Self {
            let soft = Rc::new(RefCell::new(SoftBackend::new()));
            let backend: SharedBackend = soft.clone();
            let pool = ResourcePool::new_shared(backend);
            let manager = SyncMailboxManager::new(hub, Rc::clone(&pool));
            Self { soft, pool, manager }
        }

        fn texture(&self, size: u32) -> ResourceRef<Texture> {
            let t = ResourceRef::create(&self.pool, Texture::new).unwrap();
            t.with_mut(|t| t.set_target(TextureTarget::Texture2D)).unwrap();
            self.resize(&t, size);
            t
        }

        fn resize(&self, t: &ResourceRef<Texture>, size: u32) {
            let spec = LevelSpec {
                width: size,
                height: size,
                internal_format: gl::RGBA,
                format: gl::RGBA,
                ty: gl::UNSIGNED_BYTE,
            };
            let mut backend = self.soft.borrow_mut();
            t.with_mut(|t| t.define_level(&mut *backend, 0, 0, spec, None)).unwrap();
        }
    }

    fn size(t: &ResourceRef<Texture>) -> Option<(u32, u32)> {
        t.with(Texture::size)
    }

    #[test]
    fn consumer_gets_a_proxy_with_the_produced_state() {
        let hub = MailboxSyncHub::new(4);
        let mut a = Side::new(&hub);
        let mut b = Side::new(&hub);
        let source = a.texture(4);
        let name = generate_mailbox();
        assert!(a.manager.produce_texture(name, &source).unwrap());

        let proxy = b.manager.consume_texture(&name).unwrap().unwrap();
        assert!(proxy.newly_tracked);
        assert!(!proxy.texture.belongs_to(&a.pool));
        assert_eq!(size(&proxy.texture), Some((4, 4)));
        assert!(proxy.texture.with(Texture::storage_stale));
        assert_eq!(b.soft.borrow().stats().allocations, 0);

        let again = b.manager.consume_texture(&name).unwrap().unwrap();
        assert!(!again.newly_tracked);
        assert!(again.texture.ptr_eq(&proxy.texture));

        let own = a.manager.consume_texture(&name).unwrap().unwrap();
        assert!(own.texture.ptr_eq(&source));
    }

    #[test]
    fn pull_sees_pushed_state_only() {
        let hub = MailboxSyncHub::new(4);
        let mut a = Side::new(&hub);
        let mut b = Side::new(&hub);
        let source = a.texture(4);
        let name = generate_mailbox();
        a.manager.produce_texture(name, &source).unwrap();
        let proxy = b.manager.consume_texture(&name).unwrap().unwrap().texture;

        a.resize(&source, 8);
        let sp = hub.sync_points().generate_sync_point();
        a.manager.push_texture_updates(sp);
        a.resize(&source, 16);
        b.manager.pull_texture_updates(sp);
        assert_eq!(size(&proxy), Some((8, 8)));

        b.manager.pull_texture_updates(sp);
        assert_eq!(size(&proxy), Some((8, 8)));
        assert!(hub.conflicts().is_empty());
    }

    #[test]
    fn deleting_the_source_keeps_the_last_pushed_state() {
        let hub = MailboxSyncHub::new(4);
        let mut a = Side::new(&hub);
        let mut b = Side::new(&hub);
        let source = a.texture(4);
        let name = generate_mailbox();
        a.manager.produce_texture(name, &source).unwrap();
        let proxy = b.manager.consume_texture(&name).unwrap().unwrap().texture;

        a.resize(&source, 32);
        let sp = hub.sync_points().generate_sync_point();
        a.manager.push_texture_updates(sp);
        let key = source.key();
        drop(source);
        a.manager.texture_deleted(key);

        b.manager.pull_texture_updates(sp);
        assert_eq!(size(&proxy), Some((32, 32)));
        let later = hub.sync_points().generate_sync_point();
        b.manager.pull_texture_updates(later);
        assert_eq!(size(&proxy), Some((32, 32)));

        assert!(b.manager.consume_texture(&name).unwrap().is_none());
        assert_eq!(hub.group_count(), 1);
        let key = proxy.key();
        drop(proxy);
        b.manager.texture_deleted(key);
        assert_eq!(hub.group_count(), 0);
    }

    #[test]
    fn concurrent_edits_are_recorded_and_last_push_wins() {
        let hub = MailboxSyncHub::new(4);
        let mut a = Side::new(&hub);
        let mut b = Side::new(&hub);
        let source = a.texture(4);
        let name = generate_mailbox();
        a.manager.produce_texture(name, &source).unwrap();
        let proxy = b.manager.consume_texture(&name).unwrap().unwrap().texture;

        b.resize(&proxy, 8);
        let sp1 = hub.sync_points().generate_sync_point();
        b.manager.push_texture_updates(sp1);

        a.resize(&source, 16);
        let sp2 = hub.sync_points().generate_sync_point();
        a.manager.push_texture_updates(sp2);
        assert_eq!(
            hub.conflicts(),
            vec![SyncConflict {
                kind: ConflictKind::PushOverUnpulled,
                group: 0,
                sync_point: sp2,
            }]
        );

        b.manager.pull_texture_updates(sp2);
        assert_eq!(size(&proxy), Some((16, 16)));
        a.manager.pull_texture_updates(sp2);
        assert_eq!(size(&source), Some((16, 16)));
    }

    #[test]
    fn history_is_bounded() {
        let hub = MailboxSyncHub::new(2);
        let mut a = Side::new(&hub);
        let source = a.texture(1);
        a.manager.produce_texture(generate_mailbox(), &source).unwrap();
        for size in [2, 4, 8] {
            a.resize(&source, size);
            let sp = hub.sync_points().generate_sync_point();
            a.manager.push_texture_updates(sp);
        }
        let state = hub.lock();
        let history = &state.groups[&0].history;
        assert_eq!(history.len(), 2);
        assert_eq!(history.back().unwrap().definition.size(), Some((8, 8)));
    }

    #[test]
    fn dropping_a_manager_releases_its_groups() {
        let hub = MailboxSyncHub::new(2);
        let mut a = Side::new(&hub);
        let source = a.texture(2);
        a.manager.produce_texture(generate_mailbox(), &source).unwrap();
        assert_eq!((hub.group_count(), hub.mailbox_count()), (1, 1));
        drop(a);
        assert_eq!((hub.group_count(), hub.mailbox_count()), (0, 0));
    }
}
